//! Local process jobs.
//!
//! The command runs under a small `sh` wrapper that writes its exit code to
//! a status file when it finishes. The file's path is kept in `this_job`, so
//! any later check can settle the workitem, including one made by a
//! different process than the one that spawned it.

use std::collections::HashMap;
use std::io;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use std::sync::Mutex;

use serde_json::Value;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::{JobExecutor, JobValues};
use crate::error::JobError;
use crate::model::WorkitemState;

const STATUS_ENV: &str = "WORKPOLL_STATUS_FILE";
const STATUS_KEY: &str = "status_file";

// `$0` is a label, `"$@"` is the command with its arguments.
const WRAPPER: &str = r#""$@"; code=$?; printf '%s' "$code" > "$WORKPOLL_STATUS_FILE.tmp" && mv "$WORKPOLL_STATUS_FILE.tmp" "$WORKPOLL_STATUS_FILE""#;

/// Runs `this_job.command` with `this_job.args` as a child process.
///
/// The wrapper's pid is stored on the workitem and leads its own process
/// group. Handles of children spawned here are kept until they are reaped.
pub struct CommandJob {
    status_dir: PathBuf,
    children: Mutex<HashMap<u32, Child>>,
}

impl Default for CommandJob {
    fn default() -> Self {
        Self::with_status_dir(std::env::temp_dir().join("workpoll"))
    }
}

fn lock_error<T>(_: T) -> JobError {
    JobError::Failed("process table lock poisoned".into())
}

fn io_error(context: &str, e: io::Error) -> JobError {
    JobError::Failed(format!("{context}: {e}"))
}

impl CommandJob {
    /// Keeps exit status files under `dir`.
    pub fn with_status_dir(dir: impl Into<PathBuf>) -> Self {
        Self {
            status_dir: dir.into(),
            children: Mutex::new(HashMap::new()),
        }
    }

    fn command_line(values: &JobValues) -> Result<(String, Vec<String>), JobError> {
        let props = values.this_job();
        let command = props
            .and_then(|p| p.get("command"))
            .and_then(Value::as_str)
            .filter(|c| !c.trim().is_empty())
            .ok_or(JobError::MissingProperty("command"))?;
        let args = props
            .and_then(|p| p.get("args"))
            .and_then(Value::as_array)
            .map(|args| {
                args.iter()
                    .map(|a| match a {
                        Value::String(s) => s.clone(),
                        other => other.to_string(),
                    })
                    .collect()
            })
            .unwrap_or_default();
        Ok((command.to_string(), args))
    }

    fn status_file(values: &JobValues) -> Result<PathBuf, JobError> {
        values
            .this_job()
            .and_then(|p| p.get(STATUS_KEY))
            .and_then(Value::as_str)
            .map(PathBuf::from)
            .ok_or(JobError::MissingProperty("status_file"))
    }

    /// Collects the exit of a child spawned by this executor, if it has one.
    fn reap(&self, pid: u32) -> Result<(), JobError> {
        let mut children = self.children.lock().map_err(lock_error)?;
        let exited = match children.get_mut(&pid) {
            Some(child) => child
                .try_wait()
                .map_err(|e| io_error("wait failed", e))?
                .is_some(),
            None => false,
        };
        if exited {
            children.remove(&pid);
        }
        Ok(())
    }
}

fn read_status(path: &Path) -> Result<Option<i32>, JobError> {
    match std::fs::read_to_string(path) {
        Ok(text) => text.trim().parse().map(Some).map_err(|_| {
            JobError::Failed(format!("unreadable exit status in {}", path.display()))
        }),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(io_error("cannot read exit status", e)),
    }
}

fn remove_status(path: &Path) {
    for file in [path.to_path_buf(), path.with_extension("status.tmp")] {
        match std::fs::remove_file(&file) {
            Err(e) if e.kind() != io::ErrorKind::NotFound => {
                warn!(file = %file.display(), error = %e, "could not remove status file");
            }
            _ => {}
        }
    }
}

fn signal(script: &str, pid: u32) -> Result<bool, JobError> {
    Command::new("sh")
        .args(["-c", script, "sh"])
        .arg(pid.to_string())
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .map(|s| s.success())
        .map_err(|e| io_error("cannot run kill", e))
}

/// Whether a process with `pid` still exists.
pub(crate) fn process_alive(pid: u32) -> Result<bool, JobError> {
    signal(r#"kill -0 "$1""#, pid)
}

/// Kills the process group led by `pid`, falling back to the process alone.
fn kill_group(pid: u32) -> Result<(), JobError> {
    signal(r#"kill -s KILL -- "-$1" || kill -s KILL "$1""#, pid).map(|_| ())
}

impl JobExecutor for CommandJob {
    fn properties_defaults(&self) -> &str {
        r#"{"command": "true", "args": []}"#
    }

    fn run_job(&self, mut values: JobValues) -> Result<JobValues, JobError> {
        let (command, args) = Self::command_line(&values)?;
        std::fs::create_dir_all(&self.status_dir)
            .map_err(|e| io_error("cannot create status directory", e))?;
        let status_file = self.status_dir.join(format!("{}.status", Uuid::new_v4()));
        values
            .this_job_mut()
            .ok_or(JobError::MissingProperty("command"))?
            .insert(
                STATUS_KEY.to_string(),
                Value::String(status_file.to_string_lossy().into_owned()),
            );

        let mut cmd = Command::new("sh");
        cmd.arg("-c")
            .arg(WRAPPER)
            .arg("workpoll-job")
            .arg(&command)
            .args(&args)
            .env(STATUS_ENV, &status_file)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null());
        #[cfg(unix)]
        {
            use std::os::unix::process::CommandExt;
            cmd.process_group(0);
        }
        let child = cmd.spawn().map_err(|source| JobError::Spawn {
            command: command.clone(),
            source,
        })?;

        let pid = child.id();
        info!(pid, %command, "command job started");
        self.children.lock().map_err(lock_error)?.insert(pid, child);

        values.pid = pid;
        values.run = true;
        Ok(values)
    }

    fn check_job(&self, mut values: JobValues) -> Result<JobValues, JobError> {
        let pid = values.pid;
        if pid == 0 {
            return Err(JobError::UnknownProcess(pid));
        }
        let status_file = Self::status_file(&values)?;
        self.reap(pid)?;

        let code = match read_status(&status_file)? {
            Some(code) => code,
            None if process_alive(pid)? => {
                debug!(pid, "command job still running");
                return Ok(values);
            }
            // The wrapper may have written its status right before exiting.
            None => match read_status(&status_file)? {
                Some(code) => code,
                None => {
                    warn!(pid, "command job vanished without an exit status");
                    values.state = WorkitemState::Exception;
                    values.error_msg =
                        format!("process {pid} ended without recording an exit status");
                    return Ok(values);
                }
            },
        };
        remove_status(&status_file);

        if code == 0 {
            info!(pid, "command job finished");
            values.state = WorkitemState::Done;
        } else {
            warn!(pid, code, "command job failed");
            values.state = WorkitemState::Exception;
            values.error_msg = format!("process {pid} exited with status {code}");
        }
        Ok(values)
    }

    fn cancel_job(&self, values: JobValues) -> Result<JobValues, JobError> {
        let pid = values.pid;
        if pid == 0 {
            return Ok(values);
        }
        kill_group(pid)?;
        let child = self.children.lock().map_err(lock_error)?.remove(&pid);
        if let Some(mut child) = child {
            child.kill().map_err(|e| io_error("kill failed", e))?;
            child.wait().map_err(|e| io_error("wait failed", e))?;
        }
        if let Ok(status_file) = Self::status_file(&values) {
            remove_status(&status_file);
        }
        info!(pid, "command job cancelled");
        Ok(values)
    }
}

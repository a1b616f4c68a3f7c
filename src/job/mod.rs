//! Job executor contract and the registry that dispatches on job kind.
//!
//! A workitem never talks to an executor directly: the state machine hands
//! it a [`JobValues`] snapshot and applies whatever comes back.

mod command;
mod router;

use std::collections::HashMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::JobError;
use crate::model::WorkitemState;

pub use command::CommandJob;
#[cfg(test)]
pub(crate) use command::process_alive;
pub use router::{DraftJob, RouterJob};

/// Identifies which executor runs an action.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobKind {
    /// Pass-through node; the only kind allowed on a start action.
    Router,
    /// Placeholder meant to be replaced by a concrete job later.
    Draft,
    /// Spawns a local process and waits for it to exit.
    Command,
}

impl JobKind {
    pub fn is_router(&self) -> bool {
        matches!(self, JobKind::Router)
    }
}

impl fmt::Display for JobKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            JobKind::Router => write!(f, "router"),
            JobKind::Draft => write!(f, "draft"),
            JobKind::Command => write!(f, "command"),
        }
    }
}

/// Workitem fields an executor may read and update.
///
/// Executors only change the fields they own and return the whole value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobValues {
    pub job_metadata: Value,
    pub scheduled_run: DateTime<Utc>,
    pub run: bool,
    pub triggered: bool,
    pub timeout: bool,
    pub pid: u32,
    pub state: WorkitemState,
    pub error_msg: String,
}

impl JobValues {
    /// The action specific part of the metadata, if any.
    pub fn this_job(&self) -> Option<&Value> {
        self.job_metadata.get("this_job")
    }

    pub fn this_job_mut(&mut self) -> Option<&mut serde_json::Map<String, Value>> {
        self.job_metadata
            .get_mut("this_job")
            .and_then(Value::as_object_mut)
    }
}

/// Behaviour every job kind provides.
pub trait JobExecutor: Send + Sync {
    /// Properties template used when an action leaves them empty.
    fn properties_defaults(&self) -> &str {
        "{}"
    }

    /// Starts the job. Sets `run = true` on success.
    fn run_job(&self, values: JobValues) -> Result<JobValues, JobError>;

    /// Polls a started job. Sets `state = done` once it has finished.
    fn check_job(&self, values: JobValues) -> Result<JobValues, JobError>;

    /// Stops a started job that will not be checked again, e.g. after a
    /// timeout. Jobs without anything to stop keep the default.
    fn cancel_job(&self, values: JobValues) -> Result<JobValues, JobError> {
        Ok(values)
    }
}

/// Maps job kinds to the executors available on this host.
pub struct JobRegistry {
    executors: HashMap<JobKind, Box<dyn JobExecutor>>,
}

impl Default for JobRegistry {
    fn default() -> Self {
        let mut registry = Self::empty();
        registry.register(JobKind::Router, RouterJob);
        registry.register(JobKind::Draft, DraftJob);
        registry.register(JobKind::Command, CommandJob::default());
        registry
    }
}

impl JobRegistry {
    pub fn empty() -> Self {
        Self {
            executors: HashMap::new(),
        }
    }

    /// Registers `executor` for `kind`, replacing any previous one.
    pub fn register(&mut self, kind: JobKind, executor: impl JobExecutor + 'static) {
        self.executors.insert(kind, Box::new(executor));
    }

    pub fn get(&self, kind: JobKind) -> Result<&dyn JobExecutor, JobError> {
        self.executors
            .get(&kind)
            .map(Box::as_ref)
            .ok_or_else(|| JobError::NoExecutor(kind.to_string()))
    }

    /// Whether this host can execute `kind`.
    pub fn handles(&self, kind: JobKind) -> bool {
        self.executors.contains_key(&kind)
    }

    /// Properties template for `kind`, `{}` when no executor is registered.
    pub fn properties_defaults(&self, kind: JobKind) -> String {
        self.executors
            .get(&kind)
            .map(|e| e.properties_defaults().to_string())
            .unwrap_or_else(|| "{}".to_string())
    }
}

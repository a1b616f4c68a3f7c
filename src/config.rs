//! workpoll configuration loaded from `workpoll.toml`.
//!
//! Missing fields fall back to defaults. `WORKPOLL_HOST` and
//! `WORKPOLL_STATE_FILE` take precedence over the file.

use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::error::Result;

pub const CONFIG_FILE: &str = "workpoll.toml";

#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct WorkpollConfig {
    /// Name this process polls as; matched against workitem host affinity.
    #[serde(default = "default_host")]
    pub host: String,

    /// JSON file holding workflows, instances and workitems.
    #[serde(default = "default_state_file")]
    pub state_file: PathBuf,

    /// Seconds between manage cycles in periodic mode.
    #[serde(default = "default_poll_interval_secs")]
    pub poll_interval_secs: u64,

    /// Propagate executor and expression errors instead of recording them.
    #[serde(default)]
    pub debug: bool,

    /// Default `tracing` filter when `RUST_LOG` is unset.
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

fn default_host() -> String {
    "localhost".to_string()
}

fn default_state_file() -> PathBuf {
    PathBuf::from("workpoll-state.json")
}

// One minute, the usual cron granularity.
fn default_poll_interval_secs() -> u64 {
    60
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for WorkpollConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            state_file: default_state_file(),
            poll_interval_secs: default_poll_interval_secs(),
            debug: false,
            log_level: default_log_level(),
        }
    }
}

impl WorkpollConfig {
    /// Loads `workpoll.toml` from the current directory.
    pub fn load() -> Result<Self> {
        Self::load_from(Path::new(CONFIG_FILE))
    }

    /// Loads the given file, using defaults if it does not exist, then
    /// applies environment overrides.
    pub fn load_from(path: &Path) -> Result<Self> {
        let mut config = if path.exists() {
            let contents = std::fs::read_to_string(path)?;
            toml::from_str::<WorkpollConfig>(&contents)?
        } else {
            Self::default()
        };
        config.apply_env(|key| std::env::var(key).ok());
        Ok(config)
    }

    fn apply_env(&mut self, var: impl Fn(&str) -> Option<String>) {
        if let Some(host) = var("WORKPOLL_HOST")
            && !host.is_empty()
        {
            self.host = host;
        }
        if let Some(file) = var("WORKPOLL_STATE_FILE")
            && !file.is_empty()
        {
            self.state_file = PathBuf::from(file);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_values() {
        let config = WorkpollConfig::default();
        assert_eq!(config.host, "localhost");
        assert_eq!(config.state_file, PathBuf::from("workpoll-state.json"));
        assert_eq!(config.poll_interval_secs, 60);
        assert_eq!(config.log_level, "info");
        assert!(!config.debug);
    }

    #[test]
    fn deserialize_partial_toml() {
        let config: WorkpollConfig = toml::from_str(
            r#"
            host = "runner-7"
            debug = true
        "#,
        )
        .unwrap();
        assert_eq!(config.host, "runner-7");
        assert!(config.debug);
        assert_eq!(config.poll_interval_secs, 60);
    }

    #[test]
    fn env_overrides_file_values() {
        let mut config = WorkpollConfig::default();
        config.apply_env(|key| match key {
            "WORKPOLL_HOST" => Some("ci-2".to_string()),
            "WORKPOLL_STATE_FILE" => Some(String::new()),
            _ => None,
        });
        assert_eq!(config.host, "ci-2");
        assert_eq!(config.state_file, PathBuf::from("workpoll-state.json"));
    }

    #[test]
    fn load_from_file_and_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let missing = WorkpollConfig::load_from(&dir.path().join("none.toml")).unwrap();
        assert_eq!(missing.poll_interval_secs, 60);

        let path = dir.path().join(CONFIG_FILE);
        std::fs::write(&path, "poll_interval_secs = 5\nlog_level = \"debug\"\n").unwrap();
        let config = WorkpollConfig::load_from(&path).unwrap();
        assert_eq!(config.poll_interval_secs, 5);
        assert_eq!(config.log_level, "debug");
    }

    #[test]
    fn invalid_toml_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(CONFIG_FILE);
        std::fs::write(&path, "poll_interval_secs = \"soon\"").unwrap();
        assert!(WorkpollConfig::load_from(&path).is_err());
    }
}

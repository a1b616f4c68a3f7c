use thiserror::Error;

use crate::expr::ExprError;

pub type Result<T> = std::result::Result<T, EngineError>;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("Validation error: {0}")]
    Validation(String),

    #[error("{kind} not found: {id}")]
    NotFound { kind: &'static str, id: String },

    #[error("Job error: {0}")]
    Job(#[from] JobError),

    #[error("Expression error: {0}")]
    Expression(#[from] ExprError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("TOML parse error: {0}")]
    Toml(#[from] toml::de::Error),
}

impl EngineError {
    pub fn validation(msg: impl Into<String>) -> Self {
        EngineError::Validation(msg.into())
    }

    pub fn not_found(kind: &'static str, id: impl ToString) -> Self {
        EngineError::NotFound {
            kind,
            id: id.to_string(),
        }
    }
}

/// Failure raised by a job executor while running or checking a workitem.
#[derive(Debug, Error)]
pub enum JobError {
    #[error("No executor registered for job kind `{0}`")]
    NoExecutor(String),

    #[error("Missing job property `{0}`")]
    MissingProperty(&'static str),

    #[error("Failed to spawn `{command}`: {source}")]
    Spawn {
        command: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Unknown process {0}")]
    UnknownProcess(u32),

    #[error("{0}")]
    Failed(String),
}

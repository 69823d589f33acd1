use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("TOML parse error: {0}")]
    TomlParse(#[from] toml::de::Error),

    #[error("TOML serialize error: {0}")]
    TomlSerialize(#[from] toml::ser::Error),

    #[error("No home directory")]
    NoHomeDir,

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Task not found: {0}")]
    TaskNotFound(String),

    #[error("Workflow not found: {0}")]
    WorkflowNotFound(String),

    #[error("Executor not found: {0}")]
    ExecutorNotFound(String),

    #[error("Executor failed: {0}")]
    Executor(String),

    #[error("Operation timed out after {0:?}")]
    Timeout(std::time::Duration),

    #[error("Persistence error: {0}")]
    Persistence(String),

    #[error("Invalid status transition from {from} to {to}")]
    InvalidTransition { from: String, to: String },

    #[error("Invalid cron expression '{expression}': {reason}")]
    InvalidCron { expression: String, reason: String },

    #[error("Condition error: {0}")]
    Condition(String),

    #[error("Dependency cycle detected: {0}")]
    Cycle(String),

    #[error("Task join error: {0}")]
    TaskJoin(String),
}

impl From<rusqlite::Error> for Error {
    fn from(err: rusqlite::Error) -> Self {
        Error::Persistence(err.to_string())
    }
}

impl Error {
    /// Whether the retry policy applies to this error.
    ///
    /// Executor failures, panics and deadline expiry are retried; a missing
    /// executor or malformed input is not.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::Executor(_) | Error::Timeout(_) | Error::TaskJoin(_))
    }

    /// Reclassifies an error raised inside an executor body as an execution
    /// failure, keeping its message.
    pub fn into_execution_failure(self) -> Error {
        match self {
            Error::Executor(_) | Error::Timeout(_) | Error::TaskJoin(_) => self,
            other => Error::Executor(other.to_string()),
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;

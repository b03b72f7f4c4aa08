//! Error types for the stackrun scheduler.
//!
//! `SchedulerError` is the crate-wide error. Narrower enums exist for each
//! collaborator seam (repository, runner transport, distributed lock, log
//! storage) and for step execution, where the outcome kinds drive distinct
//! task-level policies.

use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum SchedulerError {
    #[error("Database error: {0}")]
    DatabaseError(String),
    #[error("Configuration error: {0}")]
    Configuration(String),
    #[error("State transition error: {0}")]
    StateTransition(String),
    #[error("Run request resolution failed: {0}")]
    Resolution(String),
    #[error("Runner error: {0}")]
    Runner(String),
    #[error("Lock error: {0}")]
    Lock(String),
    #[error("Storage error: {0}")]
    Storage(String),
    #[error("Not found: {0}")]
    NotFound(String),
    #[error("Internal error: {0}")]
    Internal(String),
}

impl From<serde_json::Error> for SchedulerError {
    fn from(error: serde_json::Error) -> Self {
        SchedulerError::Internal(format!("JSON serialization error: {error}"))
    }
}

impl From<sqlx::Error> for SchedulerError {
    fn from(err: sqlx::Error) -> Self {
        SchedulerError::DatabaseError(err.to_string())
    }
}

impl From<config::ConfigError> for SchedulerError {
    fn from(err: config::ConfigError) -> Self {
        SchedulerError::Configuration(err.to_string())
    }
}

impl From<RepositoryError> for SchedulerError {
    fn from(err: RepositoryError) -> Self {
        match err {
            RepositoryError::TaskNotFound(id) => {
                SchedulerError::NotFound(format!("task {id}"))
            }
            RepositoryError::StepNotFound(id) => {
                SchedulerError::NotFound(format!("task step {id}"))
            }
            other => SchedulerError::DatabaseError(other.to_string()),
        }
    }
}

impl From<LockError> for SchedulerError {
    fn from(err: LockError) -> Self {
        SchedulerError::Lock(err.to_string())
    }
}

impl From<StepError> for SchedulerError {
    fn from(err: StepError) -> Self {
        SchedulerError::Runner(err.to_string())
    }
}

pub type SchedulerResult<T> = std::result::Result<T, SchedulerError>;

/// Errors raised by a task/step repository implementation
#[derive(Debug, Clone, PartialEq, Error)]
pub enum RepositoryError {
    #[error("Task {0} not found")]
    TaskNotFound(i64),
    #[error("Task step {0} not found")]
    StepNotFound(i64),
    #[error("Duplicate step index {index} for task {task_id}")]
    DuplicateStepIndex { task_id: i64, index: i32 },
    #[error("Invalid stored value for {field}: {reason}")]
    InvalidRow { field: String, reason: String },
    #[error("Database error: {0}")]
    Database(String),
}

impl From<sqlx::Error> for RepositoryError {
    fn from(err: sqlx::Error) -> Self {
        RepositoryError::Database(err.to_string())
    }
}

impl From<serde_json::Error> for RepositoryError {
    fn from(err: serde_json::Error) -> Self {
        RepositoryError::InvalidRow {
            field: "json".to_string(),
            reason: err.to_string(),
        }
    }
}

pub type RepositoryResult<T> = std::result::Result<T, RepositoryError>;

/// Errors raised while talking to a remote runner
#[derive(Debug, Clone, PartialEq, Error)]
pub enum RunnerError {
    #[error("Runner {0} is not registered in the runner directory")]
    UnknownRunner(String),
    #[error("Runner connection error: {0}")]
    Connection(String),
    #[error("Runner rejected request: {0}")]
    Rejected(String),
    #[error("Malformed runner message: {0}")]
    Protocol(String),
}

impl From<reqwest::Error> for RunnerError {
    fn from(err: reqwest::Error) -> Self {
        RunnerError::Connection(err.to_string())
    }
}

pub type RunnerResult<T> = std::result::Result<T, RunnerError>;

/// Errors raised by distributed lock implementations
#[derive(Debug, Clone, PartialEq, Error)]
pub enum LockError {
    #[error("Lock acquisition for {key} canceled")]
    Canceled { key: String },
    #[error("Lock backend error: {0}")]
    Backend(String),
}

impl From<sqlx::Error> for LockError {
    fn from(err: sqlx::Error) -> Self {
        LockError::Backend(err.to_string())
    }
}

pub type LockResult<T> = std::result::Result<T, LockError>;

/// Errors raised by the log/artifact store
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("Invalid storage path {0}")]
    InvalidPath(String),
    #[error("Storage object {0} not found")]
    NotFound(String),
    #[error("Storage I/O error for {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
}

pub type StorageResult<T> = std::result::Result<T, StorageError>;

/// Outcome kinds produced by the step runner.
///
/// `Rejected` and `Canceled` are sentinels: the first is a terminal approval
/// decision that the executor must not report as a generic failure, the second
/// means the leadership epoch ended and nothing terminal was persisted.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum StepError {
    #[error("step {index} approval rejected")]
    Rejected { index: i32 },
    #[error("step {index} canceled")]
    Canceled { index: i32 },
    #[error("step {index} timeout after {timeout:?}")]
    Timeout { index: i32, timeout: Duration },
    #[error("step {index} failed to start: {reason}")]
    StartFailed { index: i32, reason: String },
    #[error("step {index} exited with code {exit_code}")]
    ExitCode { index: i32, exit_code: i32 },
    #[error("step {index} panicked: {reason}")]
    Panicked { index: i32, reason: String },
    #[error("step {index} already finished as {status}")]
    AlreadyFinished { index: i32, status: String },
    #[error("step {index} repository error: {reason}")]
    Repository { index: i32, reason: String },
}

impl StepError {
    pub fn index(&self) -> i32 {
        match self {
            Self::Rejected { index }
            | Self::Canceled { index }
            | Self::Timeout { index, .. }
            | Self::StartFailed { index, .. }
            | Self::ExitCode { index, .. }
            | Self::Panicked { index, .. }
            | Self::AlreadyFinished { index, .. }
            | Self::Repository { index, .. } => *index,
        }
    }

    pub fn is_rejection(&self) -> bool {
        matches!(self, Self::Rejected { .. })
    }

    pub fn is_cancellation(&self) -> bool {
        matches!(self, Self::Canceled { .. })
    }
}

pub type StepResult<T> = std::result::Result<T, StepError>;

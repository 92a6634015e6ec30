use thiserror::Error;

use crate::cron::CronError;

/// Errors that can occur within the scheduler subsystem.
#[derive(Debug, Error)]
pub enum SchedulerError {
    /// The trigger expression does not parse.
    #[error("invalid trigger: {0}")]
    InvalidTrigger(#[from] CronError),

    /// A task field violates its constraints (name, priority, env key...).
    #[error("invalid task: {0}")]
    InvalidTask(String),

    #[error("task already exists: {name}")]
    DuplicateTask { name: String },

    #[error("task not found: {name}")]
    TaskNotFound { name: String },

    /// Underlying SQLite / rusqlite error.
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// A store could not complete a write or read for a non-SQL reason.
    #[error("storage error: {0}")]
    Storage(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// A completion webhook could not be delivered.
    #[error("webhook error: {0}")]
    Webhook(String),

    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),
}

impl SchedulerError {
    /// Stable error code for callers that map errors onto a control protocol.
    pub fn code(&self) -> &'static str {
        match self {
            Self::InvalidTrigger(_) => "INVALID_TRIGGER",
            Self::InvalidTask(_) => "INVALID_TASK",
            Self::DuplicateTask { .. } => "DUPLICATE_TASK",
            Self::TaskNotFound { .. } => "TASK_NOT_FOUND",
            Self::Database(_) | Self::Storage(_) => "PERSISTENCE_ERROR",
            Self::Serialization(_) => "SERIALIZATION_ERROR",
            Self::Webhook(_) | Self::Http(_) => "WEBHOOK_ERROR",
        }
    }

    /// True for failures of the backing store rather than of the request.
    pub fn is_persistence(&self) -> bool {
        matches!(
            self,
            Self::Database(_) | Self::Storage(_) | Self::Serialization(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, SchedulerError>;

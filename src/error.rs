//! Error taxonomy for the timer/notification core.
//!
//! Persistence and configuration code works in `anyhow::Result` and is
//! converted into [`CoreError`] at the store boundary. Only [`CoreError::NotFound`]
//! and unrecoverable writes are meant to reach the user; everything else is
//! absorbed and logged by the caller.

use std::fmt::Display;

use thiserror::Error;

/// Result alias used by every public engine operation.
pub type CoreResult<T> = std::result::Result<T, CoreError>;

#[derive(Debug, Error)]
pub enum CoreError {
    /// The task record vanished between read and write. Not retryable.
    #[error("task {task_id} no longer exists")]
    NotFound { task_id: String },

    /// Document store or delivery service failed. Retried by the next natural
    /// trigger (tick or lifecycle transition), never by a loop.
    #[error("transient I/O failure: {message}")]
    TransientIo { message: String },

    /// The ledger already saw this event inside the suppression window.
    #[error("task {task_id} was already processed")]
    StaleDuplicate { task_id: String },

    /// Malformed timer fields on a record that could not be recovered locally.
    #[error("invalid timer data: {message}")]
    InvalidTimerData { message: String },

    /// The caller asked for something the state machine does not allow.
    #[error("invalid request: {message}")]
    Invalid { message: String },
}

impl CoreError {
    pub fn not_found(task_id: impl Into<String>) -> Self {
        Self::NotFound {
            task_id: task_id.into(),
        }
    }

    pub fn transient(err: impl Display) -> Self {
        Self::TransientIo {
            message: err.to_string(),
        }
    }

    pub fn invalid(message: impl Into<String>) -> Self {
        Self::Invalid {
            message: message.into(),
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }

    /// Whether the UI layer should show this to the user as an alert.
    pub fn is_user_visible(&self) -> bool {
        matches!(self, Self::NotFound { .. } | Self::Invalid { .. })
    }

    /// Whether waiting for the next tick or lifecycle transition can help.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::TransientIo { .. })
    }
}

impl From<anyhow::Error> for CoreError {
    fn from(err: anyhow::Error) -> Self {
        Self::TransientIo {
            message: format!("{err:#}"),
        }
    }
}

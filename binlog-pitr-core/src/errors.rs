use thiserror::Error;

use crate::position::LogPosition;

pub type Result<T> = std::result::Result<T, PitrError>;

/// Error taxonomy shared by the collector, the manifest and the recoverer.
///
/// Only `TransientIo` is retryable. Everything else terminates the run.
#[derive(Debug, Error)]
pub enum PitrError {
    #[error("transient storage error on '{key}': {reason}")]
    TransientIo { key: String, reason: String },

    #[error("object not found: {0}")]
    NotFound(String),

    #[error("manifest conflict on '{key}': {reason}")]
    Conflict { key: String, reason: String },

    #[error("incomplete history at {expected}: {detail}")]
    IncompleteHistory {
        expected: LogPosition,
        detail: String,
    },

    #[error("binlog position {0} is no longer available on the source")]
    PositionUnavailable(LogPosition),

    #[error("apply failed after {position}: {reason}")]
    Apply {
        position: LogPosition,
        reason: String,
    },

    #[error("corrupt segment '{key}': {reason}")]
    Corrupt { key: String, reason: String },

    #[error("recovery target {target} not captured yet, newest captured position is {latest}")]
    TargetNotCaptured { target: String, latest: LogPosition },

    #[error("operation cancelled")]
    Cancelled,

    #[error("fatal: {0}")]
    Fatal(String),
}

impl PitrError {
    pub fn transient(key: impl Into<String>, reason: impl ToString) -> Self {
        PitrError::TransientIo {
            key: key.into(),
            reason: reason.to_string(),
        }
    }

    pub fn conflict(key: impl Into<String>, reason: impl ToString) -> Self {
        PitrError::Conflict {
            key: key.into(),
            reason: reason.to_string(),
        }
    }

    pub fn corrupt(key: impl Into<String>, reason: impl ToString) -> Self {
        PitrError::Corrupt {
            key: key.into(),
            reason: reason.to_string(),
        }
    }

    pub fn is_retryable(&self) -> bool {
        matches!(self, PitrError::TransientIo { .. })
    }

    /// Short stable label used for metrics and structured logs.
    pub fn kind(&self) -> &'static str {
        match self {
            PitrError::TransientIo { .. } => "transient_io",
            PitrError::NotFound(_) => "not_found",
            PitrError::Conflict { .. } => "conflict",
            PitrError::IncompleteHistory { .. } => "incomplete_history",
            PitrError::PositionUnavailable(_) => "position_unavailable",
            PitrError::Apply { .. } => "apply",
            PitrError::Corrupt { .. } => "corrupt",
            PitrError::TargetNotCaptured { .. } => "target_not_captured",
            PitrError::Cancelled => "cancelled",
            PitrError::Fatal(_) => "fatal",
        }
    }
}

//! Error types shared across the replay pipeline.

use std::io;
use std::path::PathBuf;

use thiserror::Error;

/// A log source could not be opened.
///
/// Raised before any processing starts; callers treat it as a configuration error.
#[derive(Debug, Error)]
pub enum SourceError {
    #[error("cannot open log file {path}")]
    Open {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

/// Failure reported by an execute-with-plan backend.
#[derive(Debug, Clone, Error)]
pub enum BackendError {
    /// The backend is unreachable or the session was lost.
    #[error("connection error: {0}")]
    Connection(String),
    /// The statement itself failed (bad SQL, missing session context, timeout).
    #[error("{severity}: {message}")]
    Statement {
        severity: String,
        code: String,
        message: String,
    },
    /// The backend answered but its plan output could not be interpreted.
    #[error("invalid plan output: {0}")]
    InvalidPlan(String),
    /// The run was cancelled while the call was in flight.
    #[error("context was cancelled")]
    Cancelled,
}

impl BackendError {
    /// Returns true if the run may continue with the next record.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            BackendError::Statement { .. } | BackendError::InvalidPlan(_)
        )
    }

    /// Builds a statement-level error with the usual `ERROR` severity.
    pub fn statement(code: impl Into<String>, message: impl Into<String>) -> Self {
        BackendError::Statement {
            severity: "ERROR".to_string(),
            code: code.into(),
            message: message.into(),
        }
    }
}

/// Fatal outcome of a replay run.
#[derive(Debug, Error)]
pub enum ReplayError {
    #[error(transparent)]
    Backend(#[from] BackendError),
    #[error("failed to write output")]
    Output(#[from] io::Error),
    #[error("context was cancelled")]
    Cancelled,
}

impl ReplayError {
    /// Folds a backend cancellation into the run-level `Cancelled` variant.
    pub(crate) fn from_backend(e: BackendError) -> Self {
        match e {
            BackendError::Cancelled => ReplayError::Cancelled,
            other => ReplayError::Backend(other),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn statement_errors_are_recoverable() {
        let e = BackendError::statement("42P01", "missing FROM-clause entry for table \"t\"");
        assert!(e.is_recoverable());
        assert_eq!(
            e.to_string(),
            "ERROR: missing FROM-clause entry for table \"t\""
        );
        assert!(BackendError::InvalidPlan("empty".into()).is_recoverable());
    }

    #[test]
    fn connection_and_cancel_are_fatal() {
        assert!(!BackendError::Connection("connection refused".into()).is_recoverable());
        assert!(!BackendError::Cancelled.is_recoverable());
    }

    #[test]
    fn backend_cancel_maps_to_run_cancel() {
        assert!(matches!(
            ReplayError::from_backend(BackendError::Cancelled),
            ReplayError::Cancelled
        ));
        assert!(matches!(
            ReplayError::from_backend(BackendError::Connection("x".into())),
            ReplayError::Backend(_)
        ));
    }
}

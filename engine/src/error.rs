//! Error types for the transfer engine.
//!
//! `EngineError` represents attempt-level and run-level failures: anything that
//! ends a job attempt or prevents a run from starting. File-level errors
//! (a source file that cannot be read, a target file that cannot be stored)
//! are recorded in the job ledger as plain `io::Error` values, not as
//! `EngineError`.

use std::io;

use thiserror::Error;

use crate::model::{ExitStatus, JobResult};

/// Errors that end a job attempt or a whole run.
#[derive(Debug, Error)]
pub enum EngineError {
    /// Bad or missing job configuration. Never retried, no I/O attempted.
    #[error("configuration error: {message}")]
    Config { message: String },

    /// A backend connection could not be established.
    #[error("connection to {endpoint} failed: {source}")]
    Connect {
        /// `host:port` (or the local path for local endpoints)
        endpoint: String,
        #[source]
        source: io::Error,
    },

    /// A job-ending failure raised from the walk/store loop itself,
    /// e.g. the source connection dropped mid-listing.
    #[error("transfer failed: {source}")]
    Transfer {
        #[source]
        source: io::Error,
    },

    /// Another run already holds the single-instance lock.
    #[error("already running: {lock}")]
    SingleInstance { lock: String },

    /// The configured ready file does not exist in the source.
    #[error("not ready: ready file '{ready_file}' not found")]
    NotReady { ready_file: String },

    /// An external termination request was received.
    #[error("terminated")]
    Terminated,
}

impl EngineError {
    pub(crate) fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
        }
    }

    pub(crate) fn connect(endpoint: impl Into<String>, source: io::Error) -> Self {
        Self::Connect {
            endpoint: endpoint.into(),
            source,
        }
    }

    /// Returns true for the failure kinds the retry controller recovers from.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Connect { .. } | Self::Transfer { .. })
    }

    /// Exit status a front-end should report for this error.
    pub fn exit_status(&self) -> ExitStatus {
        match self {
            Self::Config { .. } => ExitStatus::Config,
            Self::Connect { .. } | Self::Transfer { .. } => ExitStatus::Failure,
            Self::SingleInstance { .. } => ExitStatus::AlreadyRunning,
            Self::NotReady { .. } => ExitStatus::NotReady,
            Self::Terminated => ExitStatus::Terminated,
        }
    }
}

/// A failed run: the error that ended it plus whatever was transferred before.
#[derive(Debug, Error)]
#[error("{error}")]
pub struct RunFailure {
    #[source]
    pub error: EngineError,
    /// Partial result, present once at least one attempt was started.
    pub result: Option<JobResult>,
}

impl RunFailure {
    pub fn new(error: EngineError, result: Option<JobResult>) -> Self {
        Self { error, result }
    }
}

impl From<EngineError> for RunFailure {
    fn from(error: EngineError) -> Self {
        Self::new(error, None)
    }
}

/// True if an I/O error indicates the underlying connection is gone.
///
/// Used by the walker to tell a lost connection (fatal to the attempt) apart
/// from an unreadable directory (recorded as a discovery error).
pub fn is_connection_lost(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::NotConnected
            | io::ErrorKind::BrokenPipe
            | io::ErrorKind::UnexpectedEof
            | io::ErrorKind::TimedOut
    )
}

/// First line of an error's display text, used as the ledger's info field.
pub fn first_line(err: &dyn std::error::Error) -> String {
    err.to_string().lines().next().unwrap_or_default().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_kinds() {
        let connect = EngineError::connect("example.com:21", io::Error::other("refused"));
        let transfer = EngineError::Transfer {
            source: io::Error::from(io::ErrorKind::ConnectionReset),
        };
        assert!(connect.is_retryable());
        assert!(transfer.is_retryable());
        assert!(!EngineError::config("missing path").is_retryable());
        assert!(!EngineError::Terminated.is_retryable());
        assert!(!EngineError::SingleInstance { lock: "job".into() }.is_retryable());
        assert!(!EngineError::NotReady { ready_file: "READY".into() }.is_retryable());
    }

    #[test]
    fn test_connect_message_names_endpoint() {
        let err = EngineError::connect("example.com:2222", io::Error::other("incorrect hostkey"));
        assert_eq!(
            err.to_string(),
            "connection to example.com:2222 failed: incorrect hostkey"
        );
    }

    #[test]
    fn test_first_line() {
        let err = io::Error::other("550 No such file\nsecond line");
        assert_eq!(first_line(&err), "550 No such file");
    }

    #[test]
    fn test_exit_status_mapping() {
        assert_eq!(EngineError::Terminated.exit_status(), ExitStatus::Terminated);
        assert_eq!(EngineError::config("x").exit_status(), ExitStatus::Config);
        assert_eq!(
            EngineError::SingleInstance { lock: "a".into() }.exit_status(),
            ExitStatus::AlreadyRunning
        );
    }
}

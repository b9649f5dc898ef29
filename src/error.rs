//! Error types for scan sessions and the nmap backend.

use crate::session::ScanOutcome;
use thiserror::Error;

/// Failure of a single scan run.
///
/// `Clone` because a failed outcome is stored in the session's result slot and handed
/// to the caller by value.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ScanError {
    #[error("scanner binary not found: {binary}")]
    ToolNotFound { binary: String },

    #[error("scanner exited with {status}: {stderr}")]
    ToolFailed { status: String, stderr: String },

    #[error("invalid scan arguments: {0}")]
    InvalidArguments(String),

    #[error("I/O error: {0}")]
    Io(String),

    #[error("failed to parse scanner output: {0}")]
    Parse(String),

    #[error("{0}")]
    Other(String),
}

impl From<std::io::Error> for ScanError {
    fn from(err: std::io::Error) -> Self {
        ScanError::Io(err.to_string())
    }
}

impl From<quick_xml::Error> for ScanError {
    fn from(err: quick_xml::Error) -> Self {
        ScanError::Parse(err.to_string())
    }
}

/// Misuse or lifecycle errors of a [`crate::session::ScanSession`].
#[derive(Error, Debug)]
pub enum SessionError {
    #[error("a scan of {host} is already running")]
    AlreadyRunning { host: String },

    #[error("no tokio runtime available to spawn the scan worker")]
    NoRuntime,

    /// `outcome` is whatever the worker stored before panicking.
    #[error("scan worker for {host} panicked")]
    WorkerPanicked {
        host: String,
        outcome: Box<ScanOutcome>,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn io_errors_become_scan_errors() {
        let io = std::io::Error::new(std::io::ErrorKind::PermissionDenied, "raw sockets");
        let err: ScanError = io.into();
        assert!(matches!(err, ScanError::Io(ref m) if m.contains("raw sockets")));
    }

    #[test]
    fn messages_name_the_host() {
        let err = SessionError::AlreadyRunning { host: "10.0.0.1".into() };
        assert_eq!(err.to_string(), "a scan of 10.0.0.1 is already running");
    }
}

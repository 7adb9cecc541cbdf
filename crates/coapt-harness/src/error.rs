//! Error types for the harness crate.

use std::time::Duration;

use coapt_types::CoaptError;

/// Errors that can occur while driving a session.
#[derive(Debug, thiserror::Error)]
pub enum HarnessError {
    /// The process could not be started.
    #[error("spawn failed: {0}")]
    Spawn(String),
    /// Required run configuration is missing or invalid.
    #[error("configuration error: {0}")]
    Config(String),
    /// A deadline elapsed before the pattern appeared (or the process exited).
    ///
    /// This is the expected outcome of negative-path scenarios, which detect
    /// it with [`HarnessError::is_timeout`].
    #[error("timeout after {elapsed:?} waiting for: {pattern}")]
    Timeout {
        /// The text or pattern that was expected.
        pattern: String,
        /// Time spent waiting.
        elapsed: Duration,
        /// Unconsumed output at the time of the timeout.
        buffered: String,
    },
    /// A scenario or session assertion failed.
    #[error("assertion failed: {message}\nOutput:\n{buffered}")]
    AssertionFailed {
        /// Description of what was expected.
        message: String,
        /// Output relevant to the failure.
        buffered: String,
    },
    /// An operation needed a live process but the session is not connected.
    #[error("session {0} is not connected")]
    NotConnected(String),
    /// `connect` was called on a session that already has a live process.
    #[error("session {0} is already connected")]
    AlreadyConnected(String),
    /// The process exited where the operation required it to keep running.
    #[error("process exited with code {code}")]
    ProcessExited {
        /// The exit code; negative values are terminating signal numbers.
        code: i32,
    },
    /// An invalid regular expression was supplied.
    #[error("regex error: {0}")]
    Regex(#[from] regex::Error),
    /// I/O failure outside the PTY layer (pipes, log files).
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    /// Failure in the terminal or signal plumbing.
    #[error("pty error: {0}")]
    Pty(#[source] CoaptError),
}

impl HarnessError {
    /// Whether this is a deadline expiry rather than a harness or process fault.
    pub fn is_timeout(&self) -> bool {
        matches!(self, HarnessError::Timeout { .. })
    }

    /// Shorthand for an [`HarnessError::AssertionFailed`].
    pub fn assertion(message: impl Into<String>, buffered: impl Into<String>) -> Self {
        HarnessError::AssertionFailed {
            message: message.into(),
            buffered: buffered.into(),
        }
    }
}

impl From<CoaptError> for HarnessError {
    fn from(err: CoaptError) -> Self {
        match err {
            CoaptError::SpawnError(msg) => HarnessError::Spawn(msg),
            CoaptError::ConfigError(msg) | CoaptError::CredentialsError(msg) => {
                HarnessError::Config(msg)
            }
            other => HarnessError::Pty(other),
        }
    }
}

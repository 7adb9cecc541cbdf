//! Error types shared across all coapt crates.

/// Errors that can occur below the session layer.
///
/// Each variant corresponds to a different subsystem: run configuration,
/// process launch, terminal plumbing, signalling, or credentials.
#[derive(Debug, thiserror::Error)]
pub enum CoaptError {
    #[error("configuration error: {0}")]
    ConfigError(String),

    #[error("failed to spawn process: {0}")]
    SpawnError(String),

    #[error("pty error: {0}")]
    PtyError(String),

    #[error("signal error: {0}")]
    SignalError(String),

    #[error("credentials error: {0}")]
    CredentialsError(String),
}

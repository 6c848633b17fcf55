// src/utils/errors.rs
//! Error types shared across the broker and interpreter modules.

use std::time::Duration;

/// Errors produced while operating the broker or its interpreter workers.
///
/// These are internal failures. User-visible failures (bad code, quota
/// refusals, cancellations) travel to clients as exception frames instead,
/// see [`crate::protocol::ExceptionKind`].
#[derive(Debug, thiserror::Error)]
pub enum CillowError {
    /// The interpreter subprocess could not be spawned.
    #[error("failed to spawn interpreter process: {0}")]
    WorkerSpawnFailed(String),

    /// The interpreter subprocess never reported ready.
    #[error("interpreter worker did not become ready within {0:?}")]
    WorkerStartupTimeout(Duration),

    /// The worker channel closed while a request was in flight.
    #[error("worker channel closed unexpectedly")]
    ChannelClosed,

    /// The given environment string does not name a usable environment.
    #[error("invalid or unknown environment: {0}")]
    InvalidEnvironment(String),

    /// A frame could not be decoded.
    #[error("malformed frame: {0}")]
    MalformedFrame(String),

    /// The package installer exited with a non-zero status.
    #[error("installer exited with status {0}")]
    InstallerFailed(i32),

    /// No interpreter executable could be located for an environment.
    #[error("no interpreter executable found: {0}")]
    InterpreterNotFound(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Crate-wide result alias.
pub type Result<T> = std::result::Result<T, CillowError>;

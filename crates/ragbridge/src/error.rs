//! Error types surfaced by the bridge.

use std::time::Duration;

/// Failure of a bridge operation, as seen by the caller.
///
/// Cloneable so that a single initialization outcome can be handed to every
/// caller that waited on it.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BridgeError {
    #[error("failed to spawn worker: {0}")]
    Spawn(String),
    #[error("worker initialization failed: {0}")]
    InitFailed(String),
    #[error("worker initialization timed out after {0:?}")]
    InitTimeout(Duration),
    #[error("worker call timed out after {0:?}")]
    Timeout(Duration),
    /// The worker answered with `status: error`. Carries its message verbatim.
    #[error("{0}")]
    Worker(String),
    #[error("worker process terminated unexpectedly")]
    Terminated,
    #[error("worker bridge is shutting down")]
    ShuttingDown,
    #[error("protocol error: {0}")]
    Protocol(String),
    #[error("invalid input: {0}")]
    InvalidInput(String),
}

impl BridgeError {
    /// Whether repeating the same call later has a reasonable chance to succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Spawn(_) | Self::InitTimeout(_) | Self::Timeout(_) | Self::Terminated
        )
    }
}

#[derive(Debug, thiserror::Error)]
pub enum SpawnError {
    #[error("failed to spawn process: {0}")]
    Spawn(#[from] std::io::Error),
    #[error("spawn failed: {0}")]
    Other(String),
}

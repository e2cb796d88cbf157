//! Observable bridge state.

use serde::{Deserialize, Serialize};

/// Lifecycle state of the bridge.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BridgeState {
    /// No worker has been started yet, or the bridge was shut down.
    #[default]
    Uninitialized,
    /// Spawning the worker and waiting for `initialize` to complete.
    Initializing,
    /// Worker is up and accepting commands.
    Ready,
    /// Last attempt failed or the worker died. The next call retries.
    Degraded,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InitStatus {
    Starting,
    Succeeded,
    Failed,
}

/// Record of one initialization attempt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InitAttempt {
    /// 1 for the first attempt, incremented on every retry.
    pub attempt: u64,
    /// RFC 3339.
    pub started_at: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<String>,
    pub status: InitStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl InitAttempt {
    pub fn starting(attempt: u64) -> Self {
        Self {
            attempt,
            started_at: chrono::Utc::now().to_rfc3339(),
            completed_at: None,
            status: InitStatus::Starting,
            error: None,
        }
    }

    pub fn succeeded(mut self) -> Self {
        self.completed_at = Some(chrono::Utc::now().to_rfc3339());
        self.status = InitStatus::Succeeded;
        self
    }

    pub fn failed(mut self, error: impl Into<String>) -> Self {
        self.completed_at = Some(chrono::Utc::now().to_rfc3339());
        self.status = InitStatus::Failed;
        self.error = Some(error.into());
        self
    }
}

/// Point-in-time view of the bridge, served by the health endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BridgeSnapshot {
    pub state: BridgeState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pid: Option<u32>,
    pub in_flight: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_init: Option<InitAttempt>,
}

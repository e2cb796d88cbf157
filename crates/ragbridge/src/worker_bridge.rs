//! WorkerBridge: the long-lived service that owns the worker.
//!
//! Callers share one `Arc<WorkerBridge>`. The worker is spawned lazily on the
//! first call (or by [`WorkerBridge::preload`]) and initialized exactly once
//! per process; concurrent callers arriving during initialization wait on the
//! same attempt. A failed attempt or a dead worker leaves the bridge
//! `Degraded`, and the next call starts over with a fresh process.

use std::ops::Deref;
use std::sync::{Arc, Mutex as StdMutex, MutexGuard, PoisonError};

use tokio::sync::watch;
use tokio::task::AbortHandle;

use crate::bridge::protocol::{ChatTurn, Command, ResponseData, Source};
use crate::config::BridgeConfig;
use crate::connection::{WorkerConnection, into_payload};
use crate::error::BridgeError;
use crate::spawner::WorkerSpawner;
use crate::state::{BridgeSnapshot, BridgeState, InitAttempt};

/// Outcome of one initialization attempt; `None` until it finishes.
type InitOutcome = Option<Result<Arc<WorkerConnection>, BridgeError>>;

enum Phase {
    Idle {
        degraded: bool,
    },
    Initializing {
        outcome: watch::Receiver<InitOutcome>,
        task: AbortHandle,
    },
    Ready(Arc<WorkerConnection>),
}

struct Lifecycle {
    phase: Phase,
    /// Bumped by every new attempt and by shutdown. An attempt that finishes
    /// under a different generation has been superseded.
    generation: u64,
    attempts: u64,
    last_init: Option<InitAttempt>,
}

/// A worker reply with its supporting sources.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerReply {
    pub text: String,
    pub sources: Vec<Source>,
}

impl WorkerReply {
    fn from_payload(command: &str, data: Option<ResponseData>) -> Result<Self, BridgeError> {
        match data {
            Some(ResponseData {
                response: Some(text),
                sources,
                ..
            }) => Ok(Self { text, sources }),
            Some(ResponseData {
                error: Some(error), ..
            }) => Err(BridgeError::Worker(error)),
            _ => Err(BridgeError::Protocol(format!(
                "{command} response has no data.response"
            ))),
        }
    }
}

pub struct WorkerBridge {
    config: Arc<BridgeConfig>,
    spawner: Arc<dyn WorkerSpawner>,
    lifecycle: Arc<StdMutex<Lifecycle>>,
}

fn lock(lifecycle: &StdMutex<Lifecycle>) -> MutexGuard<'_, Lifecycle> {
    lifecycle.lock().unwrap_or_else(PoisonError::into_inner)
}

impl WorkerBridge {
    /// Create the bridge. Nothing is spawned until the first call.
    pub fn new(config: BridgeConfig, spawner: Arc<dyn WorkerSpawner>) -> Self {
        Self {
            config: Arc::new(config),
            spawner,
            lifecycle: Arc::new(StdMutex::new(Lifecycle {
                phase: Phase::Idle { degraded: false },
                generation: 0,
                attempts: 0,
                last_init: None,
            })),
        }
    }

    pub fn config(&self) -> &BridgeConfig {
        &self.config
    }

    /// Ensure the worker is spawned and initialized.
    pub async fn initialize(&self) -> Result<(), BridgeError> {
        self.ensure_ready().await.map(|_| ())
    }

    /// Warm the worker up ahead of the first request.
    ///
    /// Same as [`initialize`](Self::initialize); failures are logged as well
    /// as returned, since preload callers usually run it in the background.
    pub async fn preload(&self) -> Result<(), BridgeError> {
        tracing::info!("Preloading worker");
        let result = self.initialize().await;
        if let Err(e) = &result {
            tracing::warn!(error = %e, "Worker preload failed; the next call will retry");
        }
        result
    }

    pub async fn chat(
        &self,
        message: &str,
        history: &[ChatTurn],
        language: Option<&str>,
    ) -> Result<String, BridgeError> {
        Ok(self.chat_with_sources(message, history, language).await?.text)
    }

    pub async fn chat_with_sources(
        &self,
        message: &str,
        history: &[ChatTurn],
        language: Option<&str>,
    ) -> Result<WorkerReply, BridgeError> {
        if message.trim().is_empty() {
            return Err(BridgeError::InvalidInput(
                "message must not be empty".to_string(),
            ));
        }
        self.request(Command::Chat {
            message: message.to_string(),
            chat_history: history.to_vec(),
            language: language.map(str::to_string),
        })
        .await
    }

    pub async fn greeting(
        &self,
        assessment_summary: &str,
        language: Option<&str>,
    ) -> Result<String, BridgeError> {
        Ok(self
            .greeting_with_sources(assessment_summary, language)
            .await?
            .text)
    }

    pub async fn greeting_with_sources(
        &self,
        assessment_summary: &str,
        language: Option<&str>,
    ) -> Result<WorkerReply, BridgeError> {
        if assessment_summary.trim().is_empty() {
            return Err(BridgeError::InvalidInput(
                "assessment summary must not be empty".to_string(),
            ));
        }
        self.request(Command::Greeting {
            assessment_summary: assessment_summary.to_string(),
            language: language.map(str::to_string),
        })
        .await
    }

    /// Stop the worker and fail everything waiting on it with
    /// [`BridgeError::ShuttingDown`].
    ///
    /// Idempotent. The bridge returns to `Uninitialized`; a later call spawns
    /// a new worker.
    pub fn shutdown(&self) {
        let previous = {
            let mut lifecycle = lock(&self.lifecycle);
            lifecycle.generation += 1;
            let previous = std::mem::replace(&mut lifecycle.phase, Phase::Idle { degraded: false });
            if matches!(previous, Phase::Initializing { .. })
                && let Some(attempt) = lifecycle.last_init.take()
            {
                lifecycle.last_init = Some(attempt.failed(BridgeError::ShuttingDown.to_string()));
            }
            previous
        };

        match previous {
            Phase::Ready(connection) => {
                tracing::info!(pid = ?connection.pid(), "Shutting down worker");
                connection.terminate(BridgeError::ShuttingDown);
            }
            Phase::Initializing { task, .. } => {
                tracing::info!("Aborting worker initialization");
                task.abort();
            }
            Phase::Idle { .. } => {
                tracing::debug!("Shutdown requested with no worker running");
            }
        }
    }

    pub fn state(&self) -> BridgeState {
        phase_state(&lock(&self.lifecycle).phase)
    }

    pub fn snapshot(&self) -> BridgeSnapshot {
        let lifecycle = lock(&self.lifecycle);
        let (pid, in_flight) = match &lifecycle.phase {
            Phase::Ready(connection) if !connection.is_closed() => {
                (connection.pid(), connection.in_flight())
            }
            _ => (None, 0),
        };
        BridgeSnapshot {
            state: phase_state(&lifecycle.phase),
            pid,
            in_flight,
            last_init: lifecycle.last_init.clone(),
        }
    }

    async fn request(&self, command: Command) -> Result<WorkerReply, BridgeError> {
        let name = command.name();
        let connection = self.ensure_ready().await?;
        let response = connection.call(command, self.config.call_timeout).await?;
        WorkerReply::from_payload(name, into_payload(response)?)
    }

    async fn ensure_ready(&self) -> Result<Arc<WorkerConnection>, BridgeError> {
        let mut outcome = {
            let mut lifecycle = lock(&self.lifecycle);
            if let Phase::Ready(connection) = &lifecycle.phase {
                if !connection.is_closed() {
                    return Ok(Arc::clone(connection));
                }
                tracing::warn!(pid = ?connection.pid(), "Worker connection lost, restarting");
            }
            if let Phase::Initializing { outcome, .. } = &lifecycle.phase {
                outcome.clone()
            } else {
                self.start_attempt(&mut *lifecycle)
            }
        };

        // A dropped sender means the attempt was aborted by shutdown.
        let finished = outcome
            .wait_for(Option::is_some)
            .await
            .map(|value| (*value).clone())
            .map_err(|_| BridgeError::ShuttingDown)?;
        finished.unwrap_or(Err(BridgeError::ShuttingDown))
    }

    fn start_attempt(&self, lifecycle: &mut Lifecycle) -> watch::Receiver<InitOutcome> {
        lifecycle.generation += 1;
        lifecycle.attempts += 1;
        let attempt = InitAttempt::starting(lifecycle.attempts);
        lifecycle.last_init = Some(attempt.clone());

        let (tx, rx) = watch::channel(None);
        let task = tokio::spawn(run_attempt(
            Arc::clone(&self.config),
            Arc::clone(&self.spawner),
            Arc::clone(&self.lifecycle),
            lifecycle.generation,
            attempt,
            tx,
        ));
        lifecycle.phase = Phase::Initializing {
            outcome: rx.clone(),
            task: task.abort_handle(),
        };
        rx
    }
}

impl Drop for WorkerBridge {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn phase_state(phase: &Phase) -> BridgeState {
    match phase {
        Phase::Idle { degraded: false } => BridgeState::Uninitialized,
        Phase::Idle { degraded: true } => BridgeState::Degraded,
        Phase::Initializing { .. } => BridgeState::Initializing,
        Phase::Ready(connection) if connection.is_closed() => BridgeState::Degraded,
        Phase::Ready(_) => BridgeState::Ready,
    }
}

/// Runs one initialization attempt to completion in its own task, so that a
/// caller dropping its future does not abandon the attempt for everyone else.
async fn run_attempt(
    config: Arc<BridgeConfig>,
    spawner: Arc<dyn WorkerSpawner>,
    lifecycle: Arc<StdMutex<Lifecycle>>,
    generation: u64,
    attempt: InitAttempt,
    tx: watch::Sender<InitOutcome>,
) {
    tracing::info!(attempt = attempt.attempt, "Starting worker initialization");
    let result = initialize_worker(&config, spawner.as_ref()).await;

    let published = {
        let mut lifecycle = lock(&lifecycle);
        if lifecycle.generation != generation {
            if let Ok(connection) = &result {
                connection.terminate(BridgeError::ShuttingDown);
            }
            Err(BridgeError::ShuttingDown)
        } else {
            match &result {
                Ok(connection) => {
                    tracing::info!(pid = ?connection.pid(), "Worker ready");
                    lifecycle.phase = Phase::Ready(Arc::clone(connection));
                    lifecycle.last_init = Some(attempt.succeeded());
                }
                Err(e) => {
                    tracing::error!(error = %e, "Worker initialization failed");
                    lifecycle.phase = Phase::Idle { degraded: true };
                    lifecycle.last_init = Some(attempt.failed(e.to_string()));
                }
            }
            result
        }
    };

    let _ = tx.send(Some(published));
}

async fn initialize_worker(
    config: &BridgeConfig,
    spawner: &dyn WorkerSpawner,
) -> Result<Arc<WorkerConnection>, BridgeError> {
    tracing::info!(
        program = %config.launch.program.display(),
        args = ?config.launch.args,
        "Spawning worker process"
    );
    let child = spawner
        .spawn(&config.launch)
        .map_err(|e| BridgeError::Spawn(e.to_string()))?;
    let connection = WorkerConnection::start(child, config);

    let result = match connection
        .call(config.initialize.to_command(), config.init_timeout)
        .await
    {
        Ok(response) => into_payload(response).map(|_| ()).map_err(|e| match e {
            BridgeError::Worker(message) => BridgeError::InitFailed(message),
            other => other,
        }),
        Err(BridgeError::Timeout(timeout)) => Err(BridgeError::InitTimeout(timeout)),
        Err(BridgeError::Terminated) => Err(BridgeError::InitFailed(
            "worker exited during initialization".to_string(),
        )),
        Err(e) => Err(e),
    };

    match result {
        Ok(()) => Ok(connection),
        Err(e) => {
            connection.terminate(e.clone());
            Err(e)
        }
    }
}

/// Scoped ownership of a bridge: shuts the worker down when dropped.
///
/// Hold one for the lifetime of the host so that every exit path, including
/// early returns and panics, stops the worker.
pub struct BridgeGuard {
    bridge: Arc<WorkerBridge>,
}

impl BridgeGuard {
    pub fn new(bridge: Arc<WorkerBridge>) -> Self {
        Self { bridge }
    }

    pub fn bridge(&self) -> &Arc<WorkerBridge> {
        &self.bridge
    }
}

impl Deref for BridgeGuard {
    type Target = WorkerBridge;

    fn deref(&self) -> &WorkerBridge {
        &self.bridge
    }
}

impl Drop for BridgeGuard {
    fn drop(&mut self) {
        self.bridge.shutdown();
    }
}

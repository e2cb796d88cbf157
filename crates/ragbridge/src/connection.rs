//! A live connection to one worker process.
//!
//! Owns the write half of the worker's stdin and three background tasks:
//! - **reader**: decodes stdout and routes each response through the
//!   [`PendingTable`]
//! - **stderr drain**: forwards diagnostics into tracing
//! - **exit watcher**: kills the process on request and notices when it dies
//!
//! Any of those ending closes the pending table, which fails every waiting
//! caller at once. A connection is never reused after that; the bridge
//! spawns a fresh one.

use std::io;
use std::sync::Arc;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use tokio::sync::Mutex;
use tokio_util::codec::{FramedRead, FramedWrite};
use tokio_util::sync::CancellationToken;

use crate::bridge::codec::{Frame, JsonLinesCodec, preview};
use crate::bridge::correlation::{Delivery, PendingTable};
use crate::bridge::diagnostics::{StderrFilter, drain_stderr};
use crate::bridge::protocol::{Command, Envelope, RequestId, Response, ResponseData};
use crate::config::BridgeConfig;
use crate::error::BridgeError;
use crate::spawner::{WorkerChild, WorkerProcess, WorkerReader, WorkerWriter};

/// How long the exit watcher waits for stdout to drain after the process
/// exits, so replies written just before exit still reach their callers.
const EXIT_DRAIN_GRACE: Duration = Duration::from_secs(1);

pub struct WorkerConnection {
    writer: Mutex<FramedWrite<WorkerWriter, JsonLinesCodec<Envelope>>>,
    pending: Arc<PendingTable>,
    kill: CancellationToken,
    pid: Option<u32>,
}

impl WorkerConnection {
    /// Take ownership of a spawned worker and start its background tasks.
    pub fn start(child: WorkerChild, config: &BridgeConfig) -> Arc<Self> {
        let WorkerChild {
            stdin,
            stdout,
            stderr,
            process,
        } = child;
        let pid = process.id();
        let pending = Arc::new(PendingTable::new());
        let kill = CancellationToken::new();
        let reader_done = CancellationToken::new();

        let reader = FramedRead::new(
            stdout,
            JsonLinesCodec::<Response>::with_max_line_bytes(config.max_line_bytes),
        );
        tokio::spawn(read_responses(
            reader,
            Arc::clone(&pending),
            kill.clone(),
            reader_done.clone(),
            pid,
        ));

        if let Some(stderr) = stderr {
            let filter = StderrFilter::new(config.benign_stderr.iter().cloned());
            tokio::spawn(drain_stderr(stderr, filter, pid));
        }

        tokio::spawn(watch_exit(
            process,
            Arc::clone(&pending),
            kill.clone(),
            reader_done,
            pid,
        ));

        tracing::debug!(?pid, "Worker connection started");

        Arc::new(Self {
            writer: Mutex::new(FramedWrite::new(stdin, JsonLinesCodec::new())),
            pending,
            kill,
            pid,
        })
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    /// Callers currently waiting on this worker.
    pub fn in_flight(&self) -> usize {
        self.pending.live()
    }

    /// True once the worker is gone or the connection was terminated.
    pub fn is_closed(&self) -> bool {
        self.pending.is_closed()
    }

    /// Send one command and wait up to `timeout` for its response.
    ///
    /// Registration and the write happen under the writer lock, so ids reach
    /// the worker in increasing order. If this future is dropped or times
    /// out, the request is abandoned and its eventual response discarded.
    ///
    /// A timeout that finds the worker already behind (another request still
    /// unanswered, or an id-less answer swallowed by a tombstone while this
    /// call waited) means responses can no longer be matched reliably, so the
    /// connection is terminated and the next call starts a fresh worker.
    pub async fn call(&self, command: Command, timeout: Duration) -> Result<Response, BridgeError> {
        let name = command.name();

        let (id, receiver, late_before, mut guard) = {
            let mut writer = self.writer.lock().await;
            let (id, receiver) = self.pending.register(name)?;
            let late_before = self.pending.late_idless();
            let mut guard = PendingGuard {
                pending: &*self.pending,
                id,
                armed: true,
            };

            tracing::debug!(pid = ?self.pid, %id, command = name, "Sending command to worker");
            if let Err(e) = writer.send(Envelope { id, command }).await {
                if e.kind() == io::ErrorKind::InvalidData {
                    guard.disarm();
                    self.pending.cancel(id);
                    return Err(BridgeError::Protocol(format!(
                        "failed to encode {name}: {e}"
                    )));
                }
                tracing::warn!(pid = ?self.pid, %id, error = %e, "Write to worker stdin failed");
                guard.disarm();
                self.terminate(BridgeError::Terminated);
                return Err(BridgeError::Terminated);
            }
            (id, receiver, late_before, guard)
        };

        match tokio::time::timeout(timeout, receiver).await {
            Ok(Ok(result)) => {
                guard.disarm();
                result
            }
            Ok(Err(_)) => {
                guard.disarm();
                Err(BridgeError::Terminated)
            }
            Err(_) => {
                tracing::warn!(
                    pid = ?self.pid,
                    %id,
                    command = name,
                    ?timeout,
                    "Worker did not answer in time"
                );
                let behind = self.pending.tombstones() > 0;
                let swallowed = self.pending.late_idless() != late_before;
                if behind || swallowed {
                    tracing::warn!(
                        pid = ?self.pid,
                        behind,
                        swallowed,
                        "Worker responses out of sync, restarting worker"
                    );
                    guard.disarm();
                    self.terminate(BridgeError::Protocol(
                        "worker responses out of sync".to_string(),
                    ));
                }
                Err(BridgeError::Timeout(timeout))
            }
        }
    }

    /// Fail all waiting callers with `error` and kill the worker.
    ///
    /// Idempotent; only the first error is reported to callers.
    pub fn terminate(&self, error: BridgeError) {
        let failed = self.pending.close(error.clone());
        if failed > 0 {
            tracing::info!(pid = ?self.pid, failed, %error, "Failed in-flight requests");
        }
        self.kill.cancel();
    }
}

impl Drop for WorkerConnection {
    fn drop(&mut self) {
        self.kill.cancel();
    }
}

/// Check a worker response and extract its payload.
pub fn into_payload(response: Response) -> Result<Option<ResponseData>, BridgeError> {
    if response.is_success() {
        Ok(response.data)
    } else {
        Err(BridgeError::Worker(response.error_message()))
    }
}

/// Abandons the pending entry unless disarmed, covering both timeouts and a
/// caller that drops the `call` future.
struct PendingGuard<'a> {
    pending: &'a PendingTable,
    id: RequestId,
    armed: bool,
}

impl PendingGuard<'_> {
    fn disarm(&mut self) {
        self.armed = false;
    }
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        if self.armed {
            self.pending.abandon(self.id);
        }
    }
}

async fn read_responses(
    mut reader: FramedRead<WorkerReader, JsonLinesCodec<Response>>,
    pending: Arc<PendingTable>,
    kill: CancellationToken,
    done: CancellationToken,
    pid: Option<u32>,
) {
    while let Some(frame) = reader.next().await {
        match frame {
            Ok(Frame::Message(response)) => log_delivery(pending.deliver(response), pid),
            Ok(Frame::Malformed { line, error }) => {
                tracing::warn!(
                    ?pid,
                    line = preview(&line),
                    %error,
                    "Ignoring non-protocol line on worker stdout"
                );
            }
            Ok(Frame::Oversized { len }) => {
                tracing::warn!(
                    ?pid,
                    len,
                    max = reader.decoder().max_line_bytes(),
                    "Discarded oversized line on worker stdout"
                );
            }
            Err(e) => {
                tracing::warn!(?pid, error = %e, "Worker stdout read failed");
                break;
            }
        }
    }

    tracing::debug!(?pid, "Worker stdout closed");
    done.cancel();
    pending.close(BridgeError::Terminated);
    kill.cancel();
}

fn log_delivery(delivery: Delivery, pid: Option<u32>) {
    match delivery {
        Delivery::Delivered {
            id,
            command,
            elapsed_ms,
        } => {
            tracing::debug!(?pid, %id, command, elapsed_ms = elapsed_ms as u64, "Worker responded");
        }
        Delivery::Late { id, command } => {
            tracing::info!(?pid, %id, command, "Discarded late response for abandoned request");
        }
        Delivery::ReceiverGone { id } => {
            tracing::debug!(?pid, %id, "Caller went away before response arrived");
        }
        Delivery::Unmatched { id } => {
            tracing::warn!(?pid, ?id, "Worker response matched no pending request");
        }
    }
}

async fn watch_exit(
    mut process: Box<dyn WorkerProcess>,
    pending: Arc<PendingTable>,
    kill: CancellationToken,
    reader_done: CancellationToken,
    pid: Option<u32>,
) {
    let exited = tokio::select! {
        status = process.wait() => Some(status),
        _ = kill.cancelled() => None,
    };

    let status = match exited {
        Some(status) => {
            let _ = tokio::time::timeout(EXIT_DRAIN_GRACE, reader_done.cancelled()).await;
            status
        }
        None => {
            tracing::debug!(?pid, "Killing worker process");
            if let Err(e) = process.start_kill() {
                tracing::debug!(?pid, error = %e, "Kill failed, process likely already exited");
            }
            process.wait().await
        }
    };

    match status {
        Ok(code) => tracing::info!(?pid, ?code, "Worker process exited"),
        Err(e) => tracing::warn!(?pid, error = %e, "Failed to wait for worker process"),
    }

    pending.close(BridgeError::Terminated);
    kill.cancel();
}

//! Scripted in-memory worker for driving a `WorkerBridge` in tests.
//!
//! Each `spawn` creates a [`FakeWorker`] connected through duplex pipes and
//! hands it to the test over a channel. The test then plays the worker side:
//! reads commands, writes replies, exits.

#![allow(dead_code)]

use std::io;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use ragbridge::config::{BridgeConfig, InitializeConfig, LaunchSpec};
use ragbridge::error::SpawnError;
use ragbridge::spawner::{WorkerChild, WorkerProcess, WorkerSpawner};
use ragbridge::worker_bridge::WorkerBridge;
use serde_json::{Value, json};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, DuplexStream, Lines};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

const PIPE_CAPACITY: usize = 64 * 1024;

pub fn test_config() -> BridgeConfig {
    BridgeConfig::new(LaunchSpec::new("fake-worker"), InitializeConfig::default())
        .with_init_timeout(Duration::from_secs(10))
        .with_call_timeout(Duration::from_secs(5))
}

pub struct ScriptedSpawner {
    workers: mpsc::UnboundedSender<FakeWorker>,
    spawns: AtomicUsize,
}

impl ScriptedSpawner {
    pub fn new() -> (Arc<Self>, mpsc::UnboundedReceiver<FakeWorker>) {
        let (workers, rx) = mpsc::unbounded_channel();
        let spawner = Arc::new(Self {
            workers,
            spawns: AtomicUsize::new(0),
        });
        (spawner, rx)
    }

    pub fn spawns(&self) -> usize {
        self.spawns.load(Ordering::SeqCst)
    }
}

impl WorkerSpawner for ScriptedSpawner {
    fn spawn(&self, _spec: &LaunchSpec) -> Result<WorkerChild, SpawnError> {
        let n = self.spawns.fetch_add(1, Ordering::SeqCst) + 1;

        let (bridge_stdin, worker_stdin) = tokio::io::duplex(PIPE_CAPACITY);
        let (worker_stdout, bridge_stdout) = tokio::io::duplex(PIPE_CAPACITY);
        let (worker_stderr, bridge_stderr) = tokio::io::duplex(PIPE_CAPACITY);

        let killed = CancellationToken::new();
        let exited = CancellationToken::new();
        let code = Arc::new(Mutex::new(None));

        let worker = FakeWorker {
            commands: BufReader::new(worker_stdin).lines(),
            stdout: worker_stdout,
            stderr: worker_stderr,
            killed: killed.clone(),
            exited: exited.clone(),
            code: Arc::clone(&code),
        };
        self.workers
            .send(worker)
            .map_err(|_| SpawnError::Other("test dropped the worker receiver".to_string()))?;

        Ok(WorkerChild {
            stdin: Box::new(bridge_stdin),
            stdout: Box::new(bridge_stdout),
            stderr: Some(Box::new(bridge_stderr)),
            process: Box::new(FakeProcess {
                pid: 10_000 + n as u32,
                killed,
                exited,
                code,
            }),
        })
    }
}

struct FakeProcess {
    pid: u32,
    killed: CancellationToken,
    exited: CancellationToken,
    code: Arc<Mutex<Option<i32>>>,
}

#[async_trait]
impl WorkerProcess for FakeProcess {
    fn id(&self) -> Option<u32> {
        Some(self.pid)
    }

    fn start_kill(&mut self) -> io::Result<()> {
        self.killed.cancel();
        Ok(())
    }

    async fn wait(&mut self) -> io::Result<Option<i32>> {
        tokio::select! {
            _ = self.exited.cancelled() => {
                let code = *self.code.lock().unwrap();
                Ok(code)
            }
            _ = self.killed.cancelled() => Ok(None),
        }
    }
}

/// The worker side of one spawned process.
pub struct FakeWorker {
    commands: Lines<BufReader<DuplexStream>>,
    stdout: DuplexStream,
    stderr: DuplexStream,
    killed: CancellationToken,
    exited: CancellationToken,
    code: Arc<Mutex<Option<i32>>>,
}

impl FakeWorker {
    /// Next command written by the bridge, parsed.
    pub async fn next_command(&mut self) -> Value {
        let line = self
            .commands
            .next_line()
            .await
            .expect("worker stdin read failed")
            .expect("bridge closed worker stdin");
        serde_json::from_str(&line).expect("bridge wrote invalid JSON")
    }

    /// Read the next command and check its name. Returns the whole command.
    pub async fn expect_command(&mut self, name: &str) -> Value {
        let command = self.next_command().await;
        assert_eq!(command["command"], name, "unexpected command: {command}");
        command
    }

    pub async fn reply(&mut self, value: Value) {
        let mut line = value.to_string();
        line.push('\n');
        self.write_raw(line.as_bytes()).await;
    }

    pub async fn write_raw(&mut self, bytes: &[u8]) {
        self.stdout.write_all(bytes).await.expect("worker stdout closed");
        self.stdout.flush().await.expect("worker stdout closed");
    }

    pub async fn stderr(&mut self, line: &str) {
        self.stderr
            .write_all(format!("{line}\n").as_bytes())
            .await
            .expect("worker stderr closed");
    }

    /// Reply to the next command, which must be `initialize`, with success.
    pub async fn answer_initialize(&mut self) {
        let command = self.expect_command("initialize").await;
        self.reply(json!({
            "id": command["id"],
            "status": "success",
            "message": "RAG service initialized"
        }))
        .await;
    }

    /// Read the next chat or greeting and answer it with `text`.
    pub async fn answer_with(&mut self, text: &str) -> Value {
        let command = self.next_command().await;
        self.reply(json!({
            "id": command["id"],
            "status": "success",
            "data": {"response": text, "sources": []}
        }))
        .await;
        command
    }

    /// Exit with `code`, closing all pipes.
    pub fn exit(self, code: Option<i32>) {
        *self.code.lock().unwrap() = code;
        self.exited.cancel();
    }

    pub fn is_killed(&self) -> bool {
        self.killed.is_cancelled()
    }

    pub async fn wait_killed(&self) {
        tokio::time::timeout(Duration::from_secs(30), self.killed.cancelled())
            .await
            .expect("worker was not killed");
    }
}

pub fn bridge() -> (
    Arc<WorkerBridge>,
    Arc<ScriptedSpawner>,
    mpsc::UnboundedReceiver<FakeWorker>,
) {
    bridge_with(test_config())
}

pub fn bridge_with(
    config: BridgeConfig,
) -> (
    Arc<WorkerBridge>,
    Arc<ScriptedSpawner>,
    mpsc::UnboundedReceiver<FakeWorker>,
) {
    let (spawner, workers) = ScriptedSpawner::new();
    let bridge = Arc::new(WorkerBridge::new(config, spawner.clone()));
    (bridge, spawner, workers)
}

/// Receive the next spawned worker.
pub async fn next_worker(workers: &mut mpsc::UnboundedReceiver<FakeWorker>) -> FakeWorker {
    workers.recv().await.expect("spawner dropped")
}

//! Worker process spawning.
//!
//! [`WorkerSpawner`] is the seam between the bridge and the operating system.
//! [`ProcessSpawner`] starts a real child process; tests substitute spawners
//! backed by in-memory pipes.

use std::io;
use std::process::Stdio;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::process::{Child, Command};

use crate::config::LaunchSpec;
use crate::error::SpawnError;

pub type WorkerWriter = Box<dyn AsyncWrite + Send + Unpin>;
pub type WorkerReader = Box<dyn AsyncRead + Send + Unpin>;

/// Handle on the running worker, used for termination and exit detection.
#[async_trait]
pub trait WorkerProcess: Send {
    /// OS process id, if there is one.
    fn id(&self) -> Option<u32>;

    /// Request termination without waiting for it.
    fn start_kill(&mut self) -> io::Result<()>;

    /// Wait for exit. Returns the exit code when the process exited normally.
    async fn wait(&mut self) -> io::Result<Option<i32>>;
}

#[async_trait]
impl WorkerProcess for Child {
    fn id(&self) -> Option<u32> {
        Child::id(self)
    }

    fn start_kill(&mut self) -> io::Result<()> {
        Child::start_kill(self)
    }

    async fn wait(&mut self) -> io::Result<Option<i32>> {
        Ok(Child::wait(self).await?.code())
    }
}

/// A spawned worker with its standard streams detached.
pub struct WorkerChild {
    pub stdin: WorkerWriter,
    pub stdout: WorkerReader,
    pub stderr: Option<WorkerReader>,
    pub process: Box<dyn WorkerProcess>,
}

/// Extension point for different worker spawn strategies.
pub trait WorkerSpawner: Send + Sync {
    fn spawn(&self, spec: &LaunchSpec) -> Result<WorkerChild, SpawnError>;
}

/// Spawns the worker as an OS child process with piped stdio.
///
/// The child is killed when its handle is dropped, so a bridge that goes
/// away without an explicit shutdown never leaves an orphan behind.
#[derive(Debug, Clone, Copy, Default)]
pub struct ProcessSpawner;

impl WorkerSpawner for ProcessSpawner {
    fn spawn(&self, spec: &LaunchSpec) -> Result<WorkerChild, SpawnError> {
        let mut command = Command::new(&spec.program);
        command
            .args(&spec.args)
            .env("PYTHONIOENCODING", "utf-8")
            .env("PYTHONUNBUFFERED", "1")
            .envs(spec.env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(dir) = &spec.working_dir {
            command.current_dir(dir);
        }

        let mut child = command.spawn()?;
        tracing::debug!(
            program = %spec.program.display(),
            pid = ?child.id(),
            "Spawned worker process"
        );

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| SpawnError::Other("stdin not captured".to_string()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| SpawnError::Other("stdout not captured".to_string()))?;
        let stderr = child.stderr.take();

        Ok(WorkerChild {
            stdin: Box::new(stdin),
            stdout: Box::new(stdout),
            stderr: stderr.map(|s| Box::new(s) as WorkerReader),
            process: Box::new(child),
        })
    }
}

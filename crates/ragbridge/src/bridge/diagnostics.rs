//! Worker stderr forwarding.
//!
//! stderr is a free-text diagnostic channel. Lines are re-emitted as tracing
//! events under the `ragbridge::worker` target; known-noisy library output is
//! demoted to TRACE so it stays out of normal logs.

use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};

/// Substrings of stderr lines that carry no useful signal.
pub const DEFAULT_BENIGN_STDERR: &[&str] = &[
    "FutureWarning",
    "DeprecationWarning",
    "UserWarning",
    "TqdmWarning",
    "warnings.warn(",
    "it/s]",
    "s/it]",
    "Batches:",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LineClass {
    Blank,
    Benign,
    Problem,
    Info,
}

#[derive(Debug, Clone)]
pub struct StderrFilter {
    benign: Vec<String>,
}

impl Default for StderrFilter {
    fn default() -> Self {
        Self::new(DEFAULT_BENIGN_STDERR.iter().map(|s| s.to_string()))
    }
}

impl StderrFilter {
    pub fn new(benign: impl IntoIterator<Item = String>) -> Self {
        Self {
            benign: benign.into_iter().filter(|s| !s.is_empty()).collect(),
        }
    }

    pub fn classify(&self, line: &str) -> LineClass {
        let line = line.trim();
        if line.is_empty() {
            LineClass::Blank
        } else if self.benign.iter().any(|b| line.contains(b.as_str())) {
            LineClass::Benign
        } else if line.starts_with("Traceback")
            || line.contains("Error:")
            || line.contains("Exception:")
            || line.starts_with("CRITICAL")
        {
            LineClass::Problem
        } else {
            LineClass::Info
        }
    }

    pub fn emit(&self, line: &str, pid: Option<u32>) {
        let trimmed = line.trim();
        match self.classify(trimmed) {
            LineClass::Blank => {}
            LineClass::Benign => tracing::trace!(target: "ragbridge::worker", ?pid, "{}", trimmed),
            LineClass::Problem => tracing::warn!(target: "ragbridge::worker", ?pid, "{}", trimmed),
            LineClass::Info => tracing::info!(target: "ragbridge::worker", ?pid, "{}", trimmed),
        }
    }
}

/// Forward every stderr line until the stream closes.
///
/// Bytes are split on newline first and decoded lossily afterwards, so a
/// stray invalid byte never ends the drain.
pub async fn drain_stderr<R>(reader: R, filter: StderrFilter, pid: Option<u32>)
where
    R: AsyncRead + Unpin,
{
    let mut reader = BufReader::new(reader);
    let mut buf = Vec::new();
    loop {
        buf.clear();
        match reader.read_until(b'\n', &mut buf).await {
            Ok(0) => break,
            Ok(_) => filter.emit(&String::from_utf8_lossy(&buf), pid),
            Err(e) => {
                tracing::debug!(?pid, error = %e, "Worker stderr read failed");
                break;
            }
        }
    }
    tracing::debug!(?pid, "Worker stderr closed");
}

//! Bridge configuration.
//!
//! Built in code with `BridgeConfig::new(..).with_*()`, or from `RAGBRIDGE_*`
//! environment variables via [`BridgeConfig::from_env`].

use std::path::PathBuf;
use std::time::Duration;

use crate::bridge::codec::DEFAULT_MAX_LINE_BYTES;
use crate::bridge::diagnostics::DEFAULT_BENIGN_STDERR;
use crate::bridge::protocol::Command;

pub const DEFAULT_INIT_TIMEOUT: Duration = Duration::from_secs(300);
pub const DEFAULT_CALL_TIMEOUT: Duration = Duration::from_secs(60);

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("{var} must not be empty")]
    Empty { var: &'static str },
    #[error("{var} must be a positive number of seconds, got '{value}'")]
    InvalidSeconds { var: &'static str, value: String },
    #[error("{var} must be a positive number of bytes, got '{value}'")]
    InvalidBytes { var: &'static str, value: String },
}

/// How to start the worker process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchSpec {
    pub program: PathBuf,
    pub args: Vec<String>,
    pub working_dir: Option<PathBuf>,
    /// Extra variables on top of the inherited environment.
    pub env: Vec<(String, String)>,
}

impl LaunchSpec {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            working_dir: None,
            env: Vec::new(),
        }
    }

    pub fn with_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args = args.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_working_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }

    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }
}

/// Parameters of the `initialize` command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InitializeConfig {
    pub careers_json_path: PathBuf,
    pub chroma_persist_dir: PathBuf,
    pub provider: String,
}

impl Default for InitializeConfig {
    fn default() -> Self {
        Self {
            careers_json_path: PathBuf::from("./careers_cleaned.json"),
            chroma_persist_dir: PathBuf::from("./chroma_data_full"),
            provider: "google".to_string(),
        }
    }
}

impl InitializeConfig {
    pub fn to_command(&self) -> Command {
        Command::Initialize {
            careers_json_path: self.careers_json_path.clone(),
            chroma_persist_dir: self.chroma_persist_dir.clone(),
            provider: self.provider.clone(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct BridgeConfig {
    pub launch: LaunchSpec,
    pub initialize: InitializeConfig,
    /// Budget for spawn + `initialize`; cold starts load indices and models.
    pub init_timeout: Duration,
    pub call_timeout: Duration,
    pub max_line_bytes: usize,
    pub benign_stderr: Vec<String>,
}

impl BridgeConfig {
    pub fn new(launch: LaunchSpec, initialize: InitializeConfig) -> Self {
        Self {
            launch,
            initialize,
            init_timeout: DEFAULT_INIT_TIMEOUT,
            call_timeout: DEFAULT_CALL_TIMEOUT,
            max_line_bytes: DEFAULT_MAX_LINE_BYTES,
            benign_stderr: DEFAULT_BENIGN_STDERR.iter().map(|s| s.to_string()).collect(),
        }
    }

    pub fn with_init_timeout(mut self, timeout: Duration) -> Self {
        self.init_timeout = timeout;
        self
    }

    pub fn with_call_timeout(mut self, timeout: Duration) -> Self {
        self.call_timeout = timeout;
        self
    }

    pub fn with_max_line_bytes(mut self, n: usize) -> Self {
        self.max_line_bytes = n;
        self
    }

    pub fn with_benign_stderr<I, S>(mut self, patterns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.benign_stderr = patterns.into_iter().map(Into::into).collect();
        self
    }

    /// Load from the process environment.
    ///
    /// | variable | default |
    /// |---|---|
    /// | `RAGBRIDGE_PYTHON` | `python3` |
    /// | `RAGBRIDGE_WORKER_SCRIPT` | `src/services/rag_service.py` |
    /// | `RAGBRIDGE_WORKDIR` | current directory |
    /// | `RAGBRIDGE_CAREERS_JSON` | `./careers_cleaned.json` |
    /// | `RAGBRIDGE_CHROMA_DIR` | `./chroma_data_full` |
    /// | `RAGBRIDGE_PROVIDER` | `google` |
    /// | `RAGBRIDGE_INIT_TIMEOUT_SECS` | `300` |
    /// | `RAGBRIDGE_CALL_TIMEOUT_SECS` | `60` |
    /// | `RAGBRIDGE_MAX_LINE_BYTES` | 16 MiB |
    /// | `RAGBRIDGE_BENIGN_STDERR` | comma-separated, added to the defaults |
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |var: &'static str, default: &str| -> Result<String, ConfigError> {
            match lookup(var) {
                Some(value) if value.trim().is_empty() => Err(ConfigError::Empty { var }),
                Some(value) => Ok(value.trim().to_string()),
                None => Ok(default.to_string()),
            }
        };

        let python = get("RAGBRIDGE_PYTHON", "python3")?;
        let script = get("RAGBRIDGE_WORKER_SCRIPT", "src/services/rag_service.py")?;
        let mut launch = LaunchSpec::new(python).with_args([script]);
        if let Some(dir) = lookup("RAGBRIDGE_WORKDIR").filter(|d| !d.trim().is_empty()) {
            launch = launch.with_working_dir(dir.trim());
        }

        let initialize = InitializeConfig {
            careers_json_path: get("RAGBRIDGE_CAREERS_JSON", "./careers_cleaned.json")?.into(),
            chroma_persist_dir: get("RAGBRIDGE_CHROMA_DIR", "./chroma_data_full")?.into(),
            provider: get("RAGBRIDGE_PROVIDER", "google")?,
        };

        let mut config = Self::new(launch, initialize);

        if let Some(value) = lookup("RAGBRIDGE_INIT_TIMEOUT_SECS") {
            config.init_timeout = parse_seconds("RAGBRIDGE_INIT_TIMEOUT_SECS", &value)?;
        }
        if let Some(value) = lookup("RAGBRIDGE_CALL_TIMEOUT_SECS") {
            config.call_timeout = parse_seconds("RAGBRIDGE_CALL_TIMEOUT_SECS", &value)?;
        }
        if let Some(value) = lookup("RAGBRIDGE_MAX_LINE_BYTES") {
            config.max_line_bytes = match value.trim().parse::<usize>() {
                Ok(n) if n > 0 => n,
                _ => {
                    return Err(ConfigError::InvalidBytes {
                        var: "RAGBRIDGE_MAX_LINE_BYTES",
                        value,
                    });
                }
            };
        }
        if let Some(extra) = lookup("RAGBRIDGE_BENIGN_STDERR") {
            config.benign_stderr.extend(
                extra
                    .split(',')
                    .map(str::trim)
                    .filter(|s| !s.is_empty())
                    .map(str::to_string),
            );
        }

        Ok(config)
    }
}

fn parse_seconds(var: &'static str, value: &str) -> Result<Duration, ConfigError> {
    match value.trim().parse::<u64>() {
        Ok(secs) if secs > 0 => Ok(Duration::from_secs(secs)),
        _ => Err(ConfigError::InvalidSeconds {
            var,
            value: value.to_string(),
        }),
    }
}

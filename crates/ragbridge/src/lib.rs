//! ragbridge: persistent line-delimited JSON bridge to a long-lived worker process.
//!
//! One [`WorkerBridge`] owns one worker. Callers share it as
//! `Arc<WorkerBridge>`; the bridge spawns the worker on first use, initializes
//! it once, correlates each response with its caller by request id, and
//! restarts the worker on the next call after a crash or failed init.

pub mod bridge;
pub mod config;
pub mod connection;
pub mod error;
pub mod spawner;
pub mod state;
pub mod transport;
pub mod worker_bridge;

use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

pub use bridge::protocol::{ChatTurn, Role, Source};
pub use config::{BridgeConfig, ConfigError, InitializeConfig, LaunchSpec};
pub use error::{BridgeError, SpawnError};
pub use spawner::{ProcessSpawner, WorkerChild, WorkerProcess, WorkerSpawner};
pub use state::{BridgeSnapshot, BridgeState, InitAttempt, InitStatus};
pub use worker_bridge::{BridgeGuard, WorkerBridge, WorkerReply};

/// Install the global tracing subscriber, writing to stderr.
///
/// `RUST_LOG` takes precedence. Otherwise `RAGBRIDGE_LOG` (`debug`, `warn`,
/// `error`, default `info`) sets the level for this crate and for forwarded
/// worker output. `LOG_FORMAT=json` switches to JSON lines.
pub fn init_tracing() {
    let filter = if std::env::var("RUST_LOG").is_ok() {
        EnvFilter::from_default_env()
    } else {
        EnvFilter::new(default_filter(std::env::var("RAGBRIDGE_LOG").ok().as_deref()))
    };

    let use_json = std::env::var("LOG_FORMAT").as_deref() == Ok("json");

    if use_json {
        let subscriber = tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json().with_writer(std::io::stderr));
        let _ = subscriber.try_init();
    } else {
        let subscriber = tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_writer(std::io::stderr));
        let _ = subscriber.try_init();
    }
}

fn default_filter(level: Option<&str>) -> String {
    let level = match level {
        Some("trace") => "trace",
        Some("debug") => "debug",
        Some("warn") | Some("warning") => "warn",
        Some("error") => "error",
        _ => "info",
    };
    format!("ragbridge={level},ragbridge_server={level}")
}

//! HTTP server: bind, serve, drain, then stop the worker.

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Context;
use tokio::net::TcpListener;
use tokio::sync::watch;

use crate::worker_bridge::WorkerBridge;

use super::routes::{AppState, routes};

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8000,
        }
    }
}

impl ServerConfig {
    fn addr(&self) -> anyhow::Result<SocketAddr> {
        format!("{}:{}", self.host, self.port)
            .parse()
            .with_context(|| format!("invalid listen address {}:{}", self.host, self.port))
    }
}

/// Why the server stopped accepting requests.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StopReason {
    Interrupt,
    Terminate,
    Requested,
}

/// Serve the bridge over HTTP until SIGINT, SIGTERM or `POST /shutdown`.
///
/// The worker is shut down once in-flight requests have drained.
pub async fn serve(config: ServerConfig, bridge: Arc<WorkerBridge>) -> anyhow::Result<()> {
    let state = AppState::new(Arc::clone(&bridge));
    let shutdown_rx = state.shutdown_rx();
    let app = routes(state);

    let addr = config.addr()?;
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;
    tracing::info!(addr = %listener.local_addr()?, "ragbridge server listening");

    let served = axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            let reason = stop_signal(shutdown_rx).await;
            tracing::info!(?reason, "Draining HTTP requests");
        })
        .await;

    bridge.shutdown();
    served.context("HTTP server failed")?;
    tracing::info!("Server stopped");
    Ok(())
}

async fn stop_signal(mut shutdown_rx: watch::Receiver<bool>) -> StopReason {
    let interrupt = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::warn!(error = %e, "Cannot listen for SIGINT");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{SignalKind, signal};
        match signal(SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                tracing::warn!(error = %e, "Cannot listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    // A dropped sender means no one can request shutdown any more.
    let requested = async {
        if shutdown_rx.wait_for(|stop| *stop).await.is_err() {
            std::future::pending::<()>().await;
        }
    };

    tokio::select! {
        _ = interrupt => StopReason::Interrupt,
        _ = terminate => StopReason::Terminate,
        _ = requested => StopReason::Requested,
    }
}

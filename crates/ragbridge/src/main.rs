use std::process;
use std::sync::Arc;

use anyhow::Context;
use ragbridge::transport::{ServerConfig, serve};
use ragbridge::{BridgeConfig, BridgeGuard, ProcessSpawner, WorkerBridge};

const USAGE: &str = "\
Usage: ragbridge-server [--host <addr>] [--port <port>] [--preload]

Options:
  --host <addr>    Address to bind [default: 127.0.0.1]
  --port <port>    Port to listen on [default: 8000]
  --preload        Start and initialize the worker before the first request

Worker settings are read from RAGBRIDGE_* environment variables.";

#[derive(Debug, PartialEq, Eq)]
struct Args {
    host: String,
    port: u16,
    preload: bool,
}

#[tokio::main]
async fn main() {
    let args: Vec<String> = std::env::args().collect();

    let args = match parse_args(&args) {
        Ok(v) => v,
        Err(msg) => {
            if !msg.is_empty() {
                eprintln!("error: {msg}");
                eprintln!();
            }
            eprintln!("{USAGE}");
            process::exit(2);
        }
    };

    ragbridge::init_tracing();

    if let Err(e) = run(args).await {
        tracing::error!("ragbridge-server failed: {e:#}");
        process::exit(1);
    }
}

fn parse_args(args: &[String]) -> Result<Args, String> {
    let defaults = ServerConfig::default();
    let mut host = defaults.host;
    let mut port = defaults.port;
    let mut preload = false;

    let mut i = 1; // skip argv[0]
    while i < args.len() {
        match args[i].as_str() {
            "--host" => {
                i += 1;
                host = args.get(i).ok_or("--host requires a value")?.clone();
            }
            "--port" => {
                i += 1;
                let value = args.get(i).ok_or("--port requires a value")?;
                port = value
                    .parse()
                    .map_err(|_| format!("invalid port '{value}'"))?;
            }
            "--preload" => preload = true,
            "--help" | "-h" => return Err(String::new()),
            arg => return Err(format!("unexpected argument: {arg}")),
        }
        i += 1;
    }

    Ok(Args {
        host,
        port,
        preload,
    })
}

async fn run(args: Args) -> anyhow::Result<()> {
    let config = BridgeConfig::from_env().context("invalid worker configuration")?;
    tracing::info!(
        program = %config.launch.program.display(),
        args = ?config.launch.args,
        provider = %config.initialize.provider,
        "Configured worker"
    );

    let guard = BridgeGuard::new(Arc::new(WorkerBridge::new(
        config,
        Arc::new(ProcessSpawner),
    )));

    if args.preload {
        let bridge = Arc::clone(guard.bridge());
        tokio::spawn(async move {
            // Failures are logged by preload; the first request retries.
            let _ = bridge.preload().await;
        });
    }

    let server = ServerConfig {
        host: args.host,
        port: args.port,
    };
    serve(server, Arc::clone(guard.bridge())).await
}

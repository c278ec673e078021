mod dispatch;
mod rpc;
mod script;
mod server;
mod supervisor;
mod transactor;

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::info;

/// MCP adapter for manifest-described serial devices.
#[derive(Parser, Debug)]
#[command(name = "mculink-mcpd", version)]
struct Cli {
    /// Serial device path (e.g. /dev/ttyUSB0).
    #[arg(long)]
    line: String,

    /// Directory holding per-device `<device_id>.json` manifests.
    #[arg(long)]
    manifest_dir: PathBuf,

    /// HTTP listen port.
    #[arg(long, default_value_t = 8080)]
    port: u16,

    /// Serial baud rate.
    #[arg(long, default_value_t = 115_200)]
    baud: u32,

    /// Deadline for a single tool transaction, in seconds.
    #[arg(long, default_value_t = 30)]
    call_timeout_secs: u64,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let cli = Cli::parse();
    info!(
        line = %cli.line,
        manifest_dir = %cli.manifest_dir.display(),
        port = cli.port,
        baud = cli.baud,
        "starting mculink-mcpd"
    );

    let state = supervisor::StateCell::new();
    let transactor = Arc::new(transactor::Transactor::new());

    let config =
        supervisor::SupervisorConfig::new(cli.line.clone(), cli.baud, cli.manifest_dir.clone());
    let sup = supervisor::Supervisor::new(config, state.clone(), transactor.clone());
    let running = Arc::new(AtomicBool::new(true));
    let supervisor_running = running.clone();
    let supervisor_handle = std::thread::spawn(move || sup.run(supervisor_running));

    let endpoint = format!("http://127.0.0.1:{}/mcp", cli.port);
    let dispatcher = Arc::new(dispatch::Dispatcher::new(
        state.clone(),
        transactor,
        Duration::from_secs(cli.call_timeout_secs),
        endpoint,
    ));
    let app = server::build_router(server::AppState { dispatcher, state });

    let addr = format!("127.0.0.1:{}", cli.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("bind {addr}"))?;
    info!("MCP endpoint at http://{addr}/mcp");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!("shutting down");
    running.store(false, Ordering::SeqCst);
    if supervisor_handle.join().is_err() {
        tracing::warn!("supervisor thread panicked during shutdown");
    }
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        let _ = tokio::signal::ctrl_c().await;
    };
    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(_) => std::future::pending().await,
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}

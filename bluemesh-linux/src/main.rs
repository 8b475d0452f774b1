// BlueMesh Linux: TCP transport, flood router, stdin/stdout application.

mod app;
mod config;
mod transport;

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use bluemesh_core::MeshRouter;
use clap::Parser;
use tracing::{info, warn};

#[derive(Parser)]
#[command(name = "bluemesh", version)]
#[command(about = "Flood-routing mesh node: lines on stdin go out, delivered messages come out on stdout")]
struct Cli {
    /// Config file (default: ~/.config/bluemesh/config.toml, then /etc/bluemesh/config.toml)
    #[arg(short, long)]
    config: Option<PathBuf>,
    /// Identity announced to peers
    #[arg(short, long)]
    name: Option<String>,
    /// TCP listen address
    #[arg(short, long)]
    listen: Option<SocketAddr>,
    /// Peer to keep a connection to (repeatable)
    #[arg(short = 'p', long = "connect")]
    connect: Vec<SocketAddr>,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cfg = config::load(&config::Overrides {
        config_path: cli.config,
        node_name: cli.name,
        listen_addr: cli.listen,
        peers: cli.connect,
    })?;

    let rt = tokio::runtime::Runtime::new().context("starting runtime")?;
    let result = rt.block_on(run(cfg));
    rt.shutdown_timeout(Duration::from_secs(1));
    result
}

async fn run(cfg: config::Config) -> Result<()> {
    let router = Arc::new(MeshRouter::new(cfg.router.clone())?);
    let my_name: Arc<str> = Arc::from(cfg.node_name.as_str());
    info!(name = %my_name, peers = cfg.peers.len(), "node starting");

    let listener = tokio::net::TcpListener::bind(cfg.listen_addr)
        .await
        .with_context(|| format!("binding {}", cfg.listen_addr))?;
    tokio::spawn(transport::run_listener(
        router.clone(),
        listener,
        my_name.clone(),
    ));
    let retry = Duration::from_millis(cfg.connect_retry_ms);
    for addr in &cfg.peers {
        tokio::spawn(transport::run_dialler(
            router.clone(),
            *addr,
            my_name.clone(),
            retry,
        ));
    }

    let lines = app::spawn_stdin_reader().context("starting stdin reader")?;
    let input = tokio::spawn(app::run_input(router.clone(), lines));
    let output = tokio::spawn(app::run_output(
        router.clone(),
        tokio::io::stdout(),
        Duration::from_millis(cfg.poll_interval_ms.max(1)),
    ));

    shutdown_signal().await?;
    info!("shutting down");
    router.stop().await;
    input.abort();
    match output.await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => warn!(error = %e, "writing delivered messages failed"),
        Err(e) => warn!(error = %e, "output task failed"),
    }
    Ok(())
}

/// Wait for Ctrl+C or SIGTERM (Unix).
async fn shutdown_signal() -> Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = signal(SignalKind::terminate()).context("installing SIGTERM handler")?;
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = sigterm.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await?;
    }
    Ok(())
}

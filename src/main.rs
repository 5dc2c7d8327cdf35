//! mysql-credential-proxy - MySQL proxy with credential hiding
//!
//! This binary loads the YAML config, checks that the real database
//! credential can be resolved, then accepts clients until a termination
//! signal arrives.

use clap::Parser;
use std::path::PathBuf;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tokio::sync::broadcast;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use mysql_credential_proxy::server::ListenerStats;
use mysql_credential_proxy::{config, Listener, ProxyContext, Result};

#[derive(Parser)]
#[command(name = "mysql-credential-proxy")]
#[command(version)]
#[command(about = "MySQL protocol proxy that hides real database credentials")]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, default_value = "config/config.yaml")]
    config: PathBuf,

    /// Log level or filter, overrides RUST_LOG and the config file
    #[arg(short, long)]
    log: Option<String>,
}

#[tokio::main]
async fn main() {
    if let Err(e) = run(Cli::parse()).await {
        eprintln!("mysql-credential-proxy: {}", e);
        std::process::exit(1);
    }
}

async fn run(cli: Cli) -> Result<()> {
    let config = config::load_config(&cli.config)?;

    // Priority: --log flag, then RUST_LOG, then logging.level
    let filter = match cli.log {
        Some(level) => EnvFilter::try_new(level),
        None => EnvFilter::try_from_default_env()
            .or_else(|_| EnvFilter::try_new(&config.logging.level)),
    }
    .unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    info!("Starting mysql-credential-proxy v{}", env!("CARGO_PKG_VERSION"));
    info!("Loaded configuration from {:?}", cli.config);

    let config = Arc::new(config);
    let ctx = ProxyContext::from_config(Arc::clone(&config))?;

    // Fail at startup rather than on the first client
    let remote = ctx.secrets.remote_mysql().await?;
    info!(
        backend = %remote.addr(),
        storage = ?config.confidential.storage,
        "Database credential resolved"
    );

    let (shutdown_tx, shutdown_rx) = broadcast::channel::<()>(1);
    let listener = Listener::bind(Arc::new(ctx), shutdown_rx).await?;
    let stats = listener.stats();
    info!(
        "Proxy ready: listening on {} -> {}",
        listener.local_addr()?,
        remote.addr()
    );

    let mut listener_handle = tokio::spawn(listener.run());

    tokio::select! {
        received = wait_for_signal() => {
            info!("Received {}, initiating shutdown...", received?);
        }
        result = &mut listener_handle => {
            match result {
                Ok(Ok(())) => warn!("Listener stopped, shutting down"),
                Ok(Err(e)) => error!("Listener error: {}", e),
                Err(e) => error!("Listener task failed: {}", e),
            }
        }
    }

    let _ = shutdown_tx.send(());

    let grace = Duration::from_secs(config.server.shutdown_grace_secs);
    if tokio::time::timeout(grace, drain(&stats)).await.is_err() {
        warn!(
            active = stats.connections_active.load(Ordering::Relaxed),
            "Grace period of {:?} elapsed, exiting with sessions still open", grace
        );
    }

    info!(
        "Shutdown complete. Total connections handled: {}",
        stats.connections_accepted.load(Ordering::Relaxed)
    );
    Ok(())
}

/// Resolve once the process is asked to stop.
async fn wait_for_signal() -> std::io::Result<&'static str> {
    #[cfg(unix)]
    {
        use signal::unix::{signal as unix_signal, SignalKind};

        let mut sigterm = unix_signal(SignalKind::terminate())?;
        let mut sighup = unix_signal(SignalKind::hangup())?;
        let mut sigquit = unix_signal(SignalKind::quit())?;
        tokio::select! {
            result = signal::ctrl_c() => result.map(|_| "SIGINT"),
            _ = sigterm.recv() => Ok("SIGTERM"),
            _ = sighup.recv() => Ok("SIGHUP"),
            _ = sigquit.recv() => Ok("SIGQUIT"),
        }
    }
    #[cfg(not(unix))]
    {
        signal::ctrl_c().await.map(|_| "Ctrl+C")
    }
}

/// Wait until no session is running.
async fn drain(stats: &ListenerStats) {
    while stats.connections_active.load(Ordering::Relaxed) > 0 {
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
}

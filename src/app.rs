//! Application lifecycle: initialization, task orchestration, and shutdown.

use std::fs::OpenOptions;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;

use anyhow::Context;
use tokio::signal;
use tokio::sync::watch;
use tracing::{error, info};

use crate::config::Config;
use crate::probe::{ProbeSettings, Prober};
use crate::reachability::HttpReachability;
use crate::responder;
use crate::service::Systemctl;

/// Run the watchdog until SIGINT or SIGTERM.
///
/// Running -> ShuttingDown when a signal arrives, ShuttingDown -> Stopped
/// once both tasks have returned and the responder's listener is dropped.
pub async fn run(config: Config) -> anyhow::Result<()> {
    config.validate()?;
    init_tracing(&config)?;

    info!(
        version = env!("CARGO_PKG_VERSION"),
        service = %config.service_name,
        remote = %config.remote_probe_host,
        port = config.probe_port,
        "tunnel-watchdog starting"
    );

    // Bind first: a port we cannot hold is fatal before anything is spawned.
    let bind_ip: IpAddr = config.bind_address.parse()?;
    let listener = responder::bind(SocketAddr::new(bind_ip, config.probe_port))?;

    let prober = Prober::new(
        ProbeSettings::from_config(&config),
        HttpReachability::new()?,
        Systemctl::new(config.restart_sudo),
    );

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let responder_handle = tokio::spawn(responder::run(
        listener,
        config.probe_timeout(),
        shutdown_rx.clone(),
    ));
    let prober_handle = tokio::spawn(prober.run(shutdown_rx));

    wait_for_shutdown().await;
    info!("shutdown signal received, stopping tasks...");
    let _ = shutdown_tx.send(true);

    if let Err(e) = responder_handle.await {
        error!(task = "responder", error = %e, "task ended abnormally");
    }
    if let Err(e) = prober_handle.await {
        error!(task = "prober", error = %e, "task ended abnormally");
    }

    info!("tunnel-watchdog stopped");
    Ok(())
}

pub fn init_tracing(config: &Config) -> anyhow::Result<()> {
    use tracing_subscriber::prelude::*;
    use tracing_subscriber::{fmt, EnvFilter};

    let filter = EnvFilter::try_new(&config.log_level).unwrap_or_else(|_| EnvFilter::new("info"));

    let file_layer = match &config.log_file {
        Some(path) => {
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .with_context(|| format!("failed to open log file {}", path.display()))?;
            Some(fmt::layer().with_ansi(false).with_writer(Arc::new(file)))
        }
        None => None,
    };

    if config.log_json {
        tracing_subscriber::registry()
            .with(filter)
            .with(file_layer)
            .with(fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(file_layer)
            .with(fmt::layer())
            .init();
    }

    Ok(())
}

async fn wait_for_shutdown() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                error!(error = %e, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}

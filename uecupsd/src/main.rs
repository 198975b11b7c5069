//! uecupsd, the GTP-U user-plane daemon
//!
//! Bridges GTP-U tunnels to TUN devices for test setups that emulate
//! user equipment against a mobile core. Driven over a JSON control
//! channel by the control-plane peer.
//!
//! # Usage
//!
//! ```bash
//! uecupsd -c config/uecupsd.yaml
//! ```

use std::process::ExitCode;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::signal;
use tokio::signal::unix::{signal as unix_signal, SignalKind};
use tokio::sync::watch;
use tracing::{error, info, warn};

use uecups_common::logging::{init_logging, LogLevel};
use uecups_common::DaemonConfig;
use uecupsd::{load_and_validate_daemon_config, ControlTask, CupsServer, Registry};

/// Grace period for the control task on shutdown.
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(5);

/// uecupsd - user-plane daemon for UE emulation
#[derive(Parser, Debug)]
#[command(name = "uecupsd")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to the daemon configuration file (YAML)
    #[arg(short = 'c', long = "config", value_name = "FILE")]
    config_file: Option<String>,
}

#[tokio::main]
async fn main() -> ExitCode {
    init_logging(LogLevel::Info);

    let args = Args::parse();

    println!("uecupsd - GTP-U user-plane daemon");
    println!("=================================");

    match run_daemon(args).await {
        Ok(()) => {
            info!("daemon exited successfully");
            ExitCode::SUCCESS
        }
        Err(e) => {
            error!("daemon failed: {:#}", e);
            ExitCode::FAILURE
        }
    }
}

async fn run_daemon(args: Args) -> Result<()> {
    let config = match &args.config_file {
        Some(path) => {
            info!("loading configuration from: {}", path);
            load_and_validate_daemon_config(path)
                .with_context(|| format!("failed to load configuration from {path}"))?
        }
        None => DaemonConfig::default(),
    };

    let registry = Registry::new(config.tun_mtu);

    let server = CupsServer::bind(config.cups_listen_addr())
        .await
        .with_context(|| format!("failed to bind CUPS socket {}", config.cups_listen_addr()))?;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let control = ControlTask::new(server, registry.clone(), shutdown_rx);
    let control_handle = tokio::spawn(control.run());

    let mut sigusr1 =
        unix_signal(SignalKind::user_defined1()).context("failed to install SIGUSR1 handler")?;

    info!("daemon started, waiting for shutdown signal...");
    loop {
        tokio::select! {
            _ = signal::ctrl_c() => {
                info!("received Ctrl+C, initiating shutdown...");
                break;
            }
            _ = sigusr1.recv() => {
                // Diagnostic state dump, the allocation-report analog.
                info!("state report (SIGUSR1):\n{}", registry.diagnostic_report());
            }
        }
    }

    let _ = shutdown_tx.send(true);
    match tokio::time::timeout(SHUTDOWN_TIMEOUT, control_handle).await {
        Ok(Ok(())) => info!("control task shut down"),
        Ok(Err(e)) => warn!("control task panicked during shutdown: {}", e),
        Err(_) => warn!("control task did not stop within {:?}", SHUTDOWN_TIMEOUT),
    }

    registry.reset_all();

    Ok(())
}

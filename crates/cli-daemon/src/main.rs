//! CLI entry point for the OFM correction watcher
//!
//! Parses command line arguments, sets up logging and runs the daemon until
//! SIGINT or SIGTERM.

use clap::Parser;
use ofm_corrector::{Config, Daemon, DaemonError};
use std::path::PathBuf;
use std::process::ExitCode;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

const DEFAULT_LOG_FILTER: &str = "ofm_corrector=info,ofm_corrector_cli=info";
const VERBOSE_LOG_FILTER: &str = "ofm_corrector=debug,ofm_corrector_cli=debug";

/// Watches a directory tree and corrects new OFM acquisitions with Fiji/bUnwarpJ
#[derive(Parser, Debug)]
#[command(name = "ofm-corrector")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to the configuration file (config.toml); defaults are used when omitted
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Directory tree to watch, overrides watch.root
    #[arg(short, long)]
    root: Option<PathBuf>,

    /// Skip startup checks (launcher, script). For testing only.
    #[arg(long, default_value = "false")]
    skip_checks: bool,

    /// Debug logging unless RUST_LOG is set
    #[arg(short, long, default_value = "false")]
    verbose: bool,
}

fn init_tracing(verbose: bool) {
    let default = if verbose {
        VERBOSE_LOG_FILTER
    } else {
        DEFAULT_LOG_FILTER
    };
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| default.into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();
}

fn load_config(args: &Args) -> Result<Config, DaemonError> {
    let mut config = match &args.config {
        Some(path) => Config::load(path)?,
        None => {
            let mut config = Config::default();
            config.apply_env_overrides();
            config
        }
    };
    if let Some(root) = &args.root {
        config.watch.root = Some(root.clone());
    }
    Ok(config)
}

/// Resolves on SIGINT or SIGTERM
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            warn!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, shutting down");
        },
        _ = terminate => {
            info!("Received terminate signal, shutting down");
        },
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();
    init_tracing(args.verbose);

    let config_source = args
        .config
        .as_ref()
        .map(|p| p.display().to_string())
        .unwrap_or_else(|| "<defaults>".to_string());
    info!(config = %config_source, "OFM corrector starting");

    let config = match load_config(&args) {
        Ok(config) => config,
        Err(e) => {
            error!("Failed to load configuration: {}", e);
            return ExitCode::FAILURE;
        }
    };

    let daemon_result = if args.skip_checks {
        warn!("Skipping startup checks (--skip-checks enabled)");
        Daemon::new_without_checks(config)
    } else {
        Daemon::with_config(config)
    };

    let daemon = match daemon_result {
        Ok(daemon) => daemon,
        Err(e) => {
            error!("Failed to initialize daemon: {}", e);
            return ExitCode::FAILURE;
        }
    };

    if daemon.config.server.enabled {
        info!(
            "Status server on http://{}/metrics and /outputs",
            daemon.config.server.bind
        );
    }

    let cancel = CancellationToken::new();
    let on_signal = cancel.clone();
    tokio::spawn(async move {
        shutdown_signal().await;
        on_signal.cancel();
    });

    match daemon.run_with_server(cancel).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("Daemon error: {}", e);
            ExitCode::FAILURE
        }
    }
}

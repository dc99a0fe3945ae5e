//! oplog-replicator: full copy then change-log tailing between two stores.

use std::future::Future;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use oplog_replicator::codec::{CodecRegistry, PassthroughCodecFactory, SecretSource};
use oplog_replicator::coordinator::shutdown_requested;
use oplog_replicator::mongo::MongoStore;
use oplog_replicator::resilience::RetryConfig;
use oplog_replicator::{Replicator, ReplicatorConfig};
use tokio::signal;
use tokio::sync::watch;
use tracing::{error, info, warn};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

/// Replicate collections from a source to a destination store, then keep
/// them in sync by tailing the source change log.
#[derive(Debug, Parser)]
#[command(name = "oplog-replicator", version, about)]
struct Cli {
    /// Configuration file (.json or .toml).
    config: PathBuf,

    /// Log level used when RUST_LOG is not set.
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    if let Err(e) = init_logging(&cli.log_level) {
        eprintln!("failed to initialise logging: {:#}", e);
        return ExitCode::FAILURE;
    }

    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!(error = %format!("{:#}", e), "Fatal error");
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> Result<()> {
    // Signals are handled from here on, including while connecting.
    let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        shutdown_signal().await;
        let _ = shutdown_tx.send(true);
    });

    let config = ReplicatorConfig::load(&cli.config)
        .with_context(|| format!("Failed to load configuration from {}", cli.config.display()))?;
    let config = Arc::new(config);

    let secret = SecretSource::from_env(&config);
    match &secret {
        Some(SecretSource::Fixed(_)) => warn!("Using {} instead of the secret service", SecretSource::ENV_OVERRIDE),
        Some(SecretSource::Remote { host, key_name }) => info!(%host, %key_name, "Using remote secret service"),
        None => {}
    }
    let codecs = CodecRegistry::build(&config, &PassthroughCodecFactory, secret.as_ref())
        .context("Failed to build collection codecs")?;

    let retry = RetryConfig::startup();
    let connecting = MongoStore::connect(&config.source_uri, "source", &retry);
    let Some(source) = unless_shutdown(connecting, &mut shutdown_rx).await else {
        info!("Shutdown requested while connecting to source, exiting");
        return Ok(());
    };
    let source = source.context("Failed to connect to source")?;

    let connecting = MongoStore::connect(&config.dest_uri, "destination", &retry);
    let Some(dest) = unless_shutdown(connecting, &mut shutdown_rx).await else {
        info!("Shutdown requested while connecting to destination, exiting");
        return Ok(());
    };
    let dest = dest.context("Failed to connect to destination")?;

    let replicator = Replicator::new(Arc::clone(&config), Arc::new(source), Arc::new(dest), codecs);
    let report = replicator.run(shutdown_rx).await.context("Replication failed")?;

    info!(
        documents = report.documents_copied(),
        shutdown_position = %report.shutdown_position,
        "Shutdown complete"
    );
    Ok(())
}

/// Await `fut` unless shutdown is requested first.
async fn unless_shutdown<F: Future>(fut: F, shutdown_rx: &mut watch::Receiver<bool>) -> Option<F::Output> {
    tokio::select! {
        biased;
        _ = shutdown_requested(shutdown_rx) => None,
        out = fut => Some(out),
    }
}

fn init_logging(level: &str) -> Result<()> {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .or_else(|_| tracing_subscriber::EnvFilter::try_new(level))
        .context("Invalid log level")?;

    let fmt_layer = tracing_subscriber::fmt::layer().with_writer(std::io::stdout);

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt_layer)
        .try_init()
        .context("Failed to install tracing subscriber")?;

    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            warn!(error = %e, "Failed to listen for Ctrl+C");
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
            info!("Received SIGINT, shutting down");
        }
        _ = terminate => {
            info!("Received SIGTERM, shutting down");
        }
    }
}

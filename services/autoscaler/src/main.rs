//! bkscale
//!
//! Sizes a GCE instance group to the backlog of a Buildkite queue. Runs a
//! single reconciliation pass, or keeps reconciling when a poll interval is
//! configured, until interrupted.

use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::watch;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use bkscale_autoscaler::buildkite::BuildkiteClient;
use bkscale_autoscaler::config::{Cli, LogConfig, LogFormat};
use bkscale_autoscaler::gce::GceClient;
use bkscale_autoscaler::{Reconciler, ScalerError};

#[tokio::main]
async fn main() -> Result<()> {
    let settings = Cli::parse()
        .into_settings()
        .context("Invalid configuration")?;

    init_tracing(&settings.log);

    info!(
        project = %settings.reconcile.project,
        zone = %settings.reconcile.zone,
        group = %settings.reconcile.group,
        queue = %settings.reconcile.queue,
        "Starting bkscale"
    );

    let buildkite = Arc::new(
        BuildkiteClient::new(settings.buildkite).context("Failed to build Buildkite client")?,
    );
    let gce = Arc::new(
        GceClient::connect(settings.gce)
            .await
            .context("Failed to construct compute client")?,
    );

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        match wait_for_signal().await {
            Ok(()) => {
                info!("Received shutdown signal");
                let _ = shutdown_tx.send(true);
            }
            // Without handlers the loop only stops on its own.
            Err(e) => warn!(error = %e, "Failed to install signal handlers"),
        }
    });

    let reconciler = Reconciler::new(settings.reconcile, buildkite, gce);
    match reconciler.run(shutdown_rx).await {
        Ok(()) => Ok(()),
        Err(ScalerError::Cancelled) => {
            info!("bkscale shutdown complete");
            Ok(())
        }
        Err(e) => Err(e).context("Reconciliation failed"),
    }
}

fn init_tracing(log: &LogConfig) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&log.level));
    let registry = tracing_subscriber::registry().with(filter);

    match log.format {
        LogFormat::Json => registry.with(tracing_subscriber::fmt::layer().json()).init(),
        LogFormat::Text => registry.with(tracing_subscriber::fmt::layer()).init(),
    }
}

async fn wait_for_signal() -> std::io::Result<()> {
    let mut sigterm = signal(SignalKind::terminate())?;

    tokio::select! {
        result = tokio::signal::ctrl_c() => result,
        _ = sigterm.recv() => Ok(()),
    }
}

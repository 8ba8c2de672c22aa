//! Director Controller
//!
//! Routes Service traffic to exactly one leader pod.
//!
//! Watches Services annotated with `svc-director.io/leader-routing`,
//! resolves the current leader from a Lease or pod label, and republishes
//! the managed EndpointSlice to contain only that pod's address.

mod controller;
mod error;
mod probes;
mod reconciler;
#[cfg(test)]
mod test_utils;
mod watcher;

use controller::Controller;
use director_core::config::Config;
use tracing::info;
use tracing_subscriber::EnvFilter;

use crate::error::ControllerError;

#[tokio::main]
async fn main() -> Result<(), ControllerError> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    info!("Starting director controller");

    // Load configuration from environment variables; invalid values are fatal
    let config = Config::from_env()?;

    info!("Configuration:");
    info!("  Leadership source: {:?}", config.leadership_source);
    info!(
        "  Namespace: {}",
        config.watch_namespace.as_deref().unwrap_or("all namespaces")
    );
    info!("  Concurrency: {}", config.max_concurrent_reconciles);
    info!("  Probe address: {}", config.probe_addr);

    // Initialize and run controller
    let controller = Controller::new(config).await?;
    controller.run().await?;

    Ok(())
}

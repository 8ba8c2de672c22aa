//! Main controller implementation.
//!
//! Wires the engine out of the configured pieces, spawns the watcher and
//! probe server tasks, and runs until either exits.

use std::sync::Arc;
use std::time::Duration;

use kube::Client;
use tokio::task::JoinHandle;
use tracing::info;

use director_core::budget::ApiBudget;
use director_core::cache::DecisionCache;
use director_core::config::{Config, LeadershipKind};
use director_core::endpoints::EndpointSliceWriter;
use director_core::leadership::{LabelSource, LeadershipResolver, LeadershipSource, LeaseSource};
use director_core::metrics::{MetricsRecorder, PrometheusRecorder};
use director_core::retry::RetryPolicy;
use director_core::status::{Health, StatusRegistry};

use crate::error::ControllerError;
use crate::probes::{self, AppState};
use crate::reconciler::{Engine, Reconciler};
use crate::watcher::{ServiceIndex, Watcher};

/// How long one reconcile may run before readiness drops.
const STUCK_THRESHOLD: Duration = Duration::from_secs(300);
/// Event debounce before reconciling, batches pod churn.
const DEBOUNCE: Duration = Duration::from_secs(1);

/// Main controller for leader-routed services.
#[derive(Debug)]
pub struct Controller {
    watcher_task: JoinHandle<Result<(), ControllerError>>,
    probe_task: JoinHandle<Result<(), ControllerError>>,
}

impl Controller {
    /// Creates a new controller instance from configuration.
    pub async fn new(config: Config) -> Result<Self, ControllerError> {
        info!("Initializing director controller");

        let client = Client::try_default().await?;
        let metrics = Arc::new(PrometheusRecorder::new()?);
        let metrics_dyn: Arc<dyn MetricsRecorder> = metrics.clone();

        let budget = Arc::new(ApiBudget::new(config.client_qps, config.client_burst));
        let cache = Arc::new(DecisionCache::new(config.max_cache_entries_per_namespace));
        let status = Arc::new(StatusRegistry::new());
        let health = Arc::new(Health::new(STUCK_THRESHOLD));

        let source: Box<dyn LeadershipSource> = match config.leadership_source {
            LeadershipKind::Lease => Box::new(LeaseSource::new(client.clone(), budget.clone())),
            LeadershipKind::Label => Box::new(LabelSource::new()),
        };
        let resolver = LeadershipResolver::new(source);
        // Write retries must be able to exhaust before the cache-update
        // timeout cancels them.
        let writer = Arc::new(EndpointSliceWriter::new(
            client.clone(),
            RetryPolicy::within_deadline(config.cache_update_timeout),
            budget.clone(),
        ));

        let engine = Engine::new(
            cache,
            status.clone(),
            metrics_dyn.clone(),
            resolver,
            writer,
            config.cache_update_timeout,
            config.metrics_collection_timeout,
        );

        let index = Arc::new(ServiceIndex::default());
        let reconciler = Arc::new(Reconciler::new(
            client.clone(),
            engine,
            index.clone(),
            budget,
            health.clone(),
            metrics_dyn,
        ));

        let concurrency = u16::try_from(config.max_concurrent_reconciles).unwrap_or(u16::MAX);
        let watcher = Watcher::new(
            reconciler,
            index,
            client,
            config.watch_namespace.clone(),
            concurrency,
            DEBOUNCE,
        );

        let app_state = AppState { health, status, metrics };
        let probe_addr = config.probe_addr;

        let watcher_task = tokio::spawn(async move { watcher.watch_services().await });
        let probe_task = tokio::spawn(async move { probes::serve(probe_addr, app_state).await });

        Ok(Self { watcher_task, probe_task })
    }

    /// Runs the controller until shutdown.
    pub async fn run(mut self) -> Result<(), ControllerError> {
        info!("Director controller running");

        tokio::select! {
            result = &mut self.watcher_task => {
                result
                    .map_err(|e| ControllerError::Watch(format!("Service watcher panicked: {e}")))?
                    .map_err(|e| ControllerError::Watch(format!("Service watcher error: {e}")))?;
            }
            result = &mut self.probe_task => {
                result
                    .map_err(|e| ControllerError::Watch(format!("Probe server panicked: {e}")))??;
            }
        }

        Ok(())
    }
}

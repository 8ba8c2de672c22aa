//! Per-Service reconcile cycle.
//!
//! `Engine` carries the in-process pieces (resolver, cache, writer, status,
//! metrics) and settles one Service against an observed pod set.
//! `Reconciler` wraps it with the API-facing parts: pod listing, health
//! bookkeeping, and the directed-service index the watcher maps events
//! through.

use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use k8s_openapi::api::core::v1::{Pod, Service};
use kube::api::ListParams;
use kube::{Api, Client};
use tracing::{debug, error, info, warn};

use director_core::budget::ApiBudget;
use director_core::cache::{DecisionCache, DecisionCacheEntry};
use director_core::decision::{DirectedService, LeaderRecord, RoutingDecision, slice_name_for};
use director_core::endpoints::SliceStore;
use director_core::error::Error;
use director_core::leadership::{LeadershipResolver, Resolution, Sticky, ready_candidates};
use director_core::metrics::MetricsRecorder;
use director_core::ports::resolve_target_port;
use director_core::status::{Health, Phase, StatusRegistry};

use crate::error::ControllerError;
use crate::watcher::ServiceIndex;

/// Settles routing decisions for directed services.
pub struct Engine {
    cache: Arc<DecisionCache>,
    status: Arc<StatusRegistry>,
    metrics: Arc<dyn MetricsRecorder>,
    resolver: LeadershipResolver,
    store: Arc<dyn SliceStore>,
    cache_update_timeout: Duration,
    metrics_collection_timeout: Duration,
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine").finish_non_exhaustive()
    }
}

impl Engine {
    /// Creates an engine over the shared controller state.
    pub fn new(
        cache: Arc<DecisionCache>,
        status: Arc<StatusRegistry>,
        metrics: Arc<dyn MetricsRecorder>,
        resolver: LeadershipResolver,
        store: Arc<dyn SliceStore>,
        cache_update_timeout: Duration,
        metrics_collection_timeout: Duration,
    ) -> Self {
        Self {
            cache,
            status,
            metrics,
            resolver,
            store,
            cache_update_timeout,
            metrics_collection_timeout,
        }
    }

    /// Runs one cycle for a directed service against an observed pod set:
    /// resolve leadership, resolve the port, publish the slice if the
    /// decision changed, refresh status and gauges.
    ///
    /// Logical failures (ambiguous claims, malformed identity, unresolvable
    /// port) degrade to a zero-endpoint decision rather than an error; only
    /// transient failures propagate for requeue.
    pub async fn settle(&self, svc: &DirectedService, pods: Vec<Pod>) -> Result<Phase, Error> {
        let ns = svc.namespace.as_str();
        let name = svc.name.as_str();
        let candidates = ready_candidates(pods);
        let previous = self.cache.get(ns, name).and_then(|e| e.record);

        let mut message = None;
        let resolution = match self.resolver.resolve(svc, &candidates, previous.as_ref()).await {
            Ok(resolution) => resolution,
            Err(e) if e.is_logical() => {
                warn!("Leadership for {} undeterminable, routing no endpoints: {}", svc.key(), e);
                message = Some(e.to_string());
                Resolution::None
            }
            Err(e) => return Err(e),
        };

        let record = match resolution {
            Resolution::None => None,
            Resolution::Leader(leader, sticky) => {
                match sticky {
                    Sticky::Hit => self.metrics.record_sticky_hit(ns, name),
                    Sticky::Miss => {
                        info!(
                            "Leader of {} failing over from {:?} to {}",
                            svc.key(),
                            previous.as_ref().map(|p| p.holder.as_str()),
                            leader.name
                        );
                        self.metrics.record_failover(ns, name);
                    }
                    Sticky::Initial => {
                        info!("Leader of {} elected: {}", svc.key(), leader.name);
                    }
                }

                let pod = candidates
                    .iter()
                    .find(|p| p.metadata.name.as_deref() == Some(leader.name.as_str()));
                match pod.map(|p| resolve_target_port(&svc.target_port, p)) {
                    Some(Ok(port)) => Some(LeaderRecord {
                        holder: leader.name,
                        holder_uid: leader.uid,
                        namespace: svc.namespace.clone(),
                        since: leader.since,
                        pod_ip: leader.pod_ip,
                        port,
                    }),
                    Some(Err(Error::PortResolutionFailed(detail))) => {
                        warn!("Port resolution for {} failed: {}", svc.key(), detail);
                        self.metrics.record_port_resolution_failure(ns, name);
                        message = Some(format!("port resolution failed: {detail}"));
                        None
                    }
                    Some(Err(e)) => return Err(e),
                    None => None,
                }
            }
        };

        let decision = RoutingDecision::new(svc, record.clone());
        let fingerprint = decision.fingerprint();
        let cached = self.cache.get(ns, name);

        if cached.as_ref().is_some_and(|e| e.fingerprint == fingerprint) {
            debug!("Decision for {} unchanged, skipping write", svc.key());
            self.metrics.record_cache_hit(ns, name);
        } else {
            self.metrics.record_cache_miss(ns, name);
            tokio::time::timeout(self.cache_update_timeout, async {
                self.store.apply(self.metrics.as_ref(), svc, &decision).await?;
                self.cache
                    .put(ns, name, DecisionCacheEntry::new(record.clone(), fingerprint));
                Ok::<(), Error>(())
            })
            .await
            .map_err(|_| Error::Timeout(format!("cache update for {}", svc.key())))??;
        }

        tokio::time::timeout(self.metrics_collection_timeout, async {
            match &record {
                Some(r) => {
                    let age = r
                        .age_seconds(Utc::now())
                        .and_then(|s| u64::try_from(s).ok())
                        .unwrap_or(0);
                    self.metrics.set_leader_age(ns, name, Duration::from_secs(age));
                    self.metrics.set_without_endpoints(ns, name, false);
                }
                None => {
                    self.metrics.set_leader_age(ns, name, Duration::ZERO);
                    self.metrics.set_without_endpoints(ns, name, true);
                }
            }
        })
        .await
        .map_err(|_| Error::Timeout(format!("metrics collection for {}", svc.key())))?;

        let phase = if record.is_some() { Phase::Stable } else { Phase::Electing };
        let holder = record.as_ref().map(|r| r.holder.clone());
        self.status.update(&svc.key(), phase, holder, candidates.len(), message);
        Ok(phase)
    }

    /// Tears down everything held for a service that opted out or is gone.
    pub async fn drop_service(&self, namespace: &str, name: &str) -> Result<(), Error> {
        let slice = slice_name_for(name);
        self.store
            .delete(self.metrics.as_ref(), namespace, name, &slice)
            .await?;
        self.cache.evict(namespace, name);
        self.status.remove(&format!("{namespace}/{name}"));
        Ok(())
    }
}

/// API-facing reconciler: fetches candidates and drives the engine.
pub struct Reconciler {
    client: Client,
    engine: Engine,
    index: Arc<ServiceIndex>,
    budget: Arc<ApiBudget>,
    health: Arc<Health>,
    metrics: Arc<dyn MetricsRecorder>,
}

impl std::fmt::Debug for Reconciler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Reconciler").finish_non_exhaustive()
    }
}

impl Reconciler {
    /// Creates a reconciler over the shared controller state.
    pub fn new(
        client: Client,
        engine: Engine,
        index: Arc<ServiceIndex>,
        budget: Arc<ApiBudget>,
        health: Arc<Health>,
        metrics: Arc<dyn MetricsRecorder>,
    ) -> Self {
        Self {
            client,
            engine,
            index,
            budget,
            health,
            metrics,
        }
    }

    /// Reconciles one Service, with health and metrics bookkeeping.
    pub async fn reconcile(&self, service: &Service) -> Result<(), ControllerError> {
        let (Some(ns), Some(name)) = (
            service.metadata.namespace.as_deref(),
            service.metadata.name.as_deref(),
        ) else {
            warn!("Skipping Service without namespace/name");
            return Ok(());
        };
        let ns = ns.to_string();
        let name = name.to_string();
        let key = format!("{ns}/{name}");

        self.health.cycle_started(&key);
        let started = Instant::now();
        let result = self.run_cycle(service, &ns, &name).await;
        self.health.cycle_finished(&key);

        match &result {
            Ok(()) => self.metrics.record_reconcile(&ns, &name, started.elapsed()),
            Err(e) => {
                error!("Reconcile of {} failed: {}", key, e);
                self.metrics.record_reconcile_error(&ns, &name);
            }
        }
        result
    }

    async fn run_cycle(
        &self,
        service: &Service,
        ns: &str,
        name: &str,
    ) -> Result<(), ControllerError> {
        let Some(svc) = DirectedService::from_service(service)? else {
            // Opted out or deleting: tear down only if we were managing it.
            let was_indexed = self.index.remove(ns, name);
            if was_indexed || self.engine.cache.get(ns, name).is_some() {
                info!("Service {}/{} no longer directed, removing managed slice", ns, name);
                self.engine.drop_service(ns, name).await?;
            }
            return Ok(());
        };

        self.index.upsert(&svc);
        let pods = self.list_candidates(&svc).await?;
        self.engine.settle(&svc, pods).await?;
        Ok(())
    }

    async fn list_candidates(&self, svc: &DirectedService) -> Result<Vec<Pod>, ControllerError> {
        if svc.selector.is_empty() {
            warn!("Service {} has no selector, no candidates", svc.key());
            return Ok(Vec::new());
        }
        let selector = svc
            .selector
            .iter()
            .map(|(k, v)| format!("{k}={v}"))
            .collect::<Vec<_>>()
            .join(",");
        let api: Api<Pod> = Api::namespaced(self.client.clone(), &svc.namespace);
        self.budget.acquire().await;
        let pods = api
            .list(&ListParams::default().labels(&selector))
            .await
            .map_err(Error::from)?;
        Ok(pods.items)
    }
}

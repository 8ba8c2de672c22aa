//! Kubernetes resource watchers.
//!
//! One kube_runtime::Controller on Services drives everything: it owns the
//! managed EndpointSlices and watches Pods and Leases, mapping those events
//! back to the directed Services they affect through an in-process index.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::Duration;

use futures::StreamExt;
use k8s_openapi::api::coordination::v1::Lease;
use k8s_openapi::api::core::v1::{Pod, Service};
use k8s_openapi::api::discovery::v1::EndpointSlice;
use kube::{Api, Client};
use kube_runtime::controller::{Action, Config as ControllerConfig};
use kube_runtime::reflector::ObjectRef;
use kube_runtime::{Controller, watcher};
use tracing::{debug, error, info};

use director_core::backoff::FibonacciBackoff;
use director_core::decision::{DirectedService, MANAGED_BY};
use director_core::endpoints::MANAGED_BY_LABEL;

use crate::error::ControllerError;
use crate::reconciler::Reconciler;

/// Requeue interval for settled services, keeps the leader-age gauge fresh.
const RESYNC_INTERVAL: Duration = Duration::from_secs(60);
/// Backoff bounds for errored reconciles.
const ERROR_BACKOFF_MIN_SECS: u64 = 1;
const ERROR_BACKOFF_MAX_SECS: u64 = 60;

#[derive(Debug, Clone)]
struct IndexedService {
    selector: BTreeMap<String, String>,
    lease_name: String,
}

/// Index of currently directed services, used to map Pod and Lease events
/// back to the Services they affect.
#[derive(Debug, Default)]
pub struct ServiceIndex {
    namespaces: RwLock<HashMap<String, HashMap<String, IndexedService>>>,
}

impl ServiceIndex {
    /// Records or refreshes a directed service.
    pub fn upsert(&self, svc: &DirectedService) {
        let mut namespaces = self
            .namespaces
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        namespaces.entry(svc.namespace.clone()).or_default().insert(
            svc.name.clone(),
            IndexedService {
                selector: svc.selector.clone(),
                lease_name: svc.lease_name.clone(),
            },
        );
    }

    /// Drops a service; returns whether it was indexed.
    pub fn remove(&self, namespace: &str, name: &str) -> bool {
        let mut namespaces = self
            .namespaces
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        namespaces
            .get_mut(namespace)
            .is_some_and(|services| services.remove(name).is_some())
    }

    /// Directed services in the pod's namespace whose selector matches it.
    #[must_use]
    pub fn services_for_pod(&self, pod: &Pod) -> Vec<ObjectRef<Service>> {
        let Some(ns) = pod.metadata.namespace.as_deref() else {
            return Vec::new();
        };
        let empty = BTreeMap::new();
        let labels = pod.metadata.labels.as_ref().unwrap_or(&empty);
        let namespaces = self
            .namespaces
            .read()
            .unwrap_or_else(PoisonError::into_inner);
        namespaces
            .get(ns)
            .map(|services| {
                services
                    .iter()
                    .filter(|(_, indexed)| {
                        !indexed.selector.is_empty()
                            && indexed
                                .selector
                                .iter()
                                .all(|(k, v)| labels.get(k) == Some(v))
                    })
                    .map(|(name, _)| ObjectRef::new(name).within(ns))
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Directed services in the lease's namespace consulting this lease.
    #[must_use]
    pub fn services_for_lease(&self, lease: &Lease) -> Vec<ObjectRef<Service>> {
        let (Some(ns), Some(lease_name)) = (
            lease.metadata.namespace.as_deref(),
            lease.metadata.name.as_deref(),
        ) else {
            return Vec::new();
        };
        let namespaces = self
            .namespaces
            .read()
            .unwrap_or_else(PoisonError::into_inner);
        namespaces
            .get(ns)
            .map(|services| {
                services
                    .iter()
                    .filter(|(_, indexed)| indexed.lease_name == lease_name)
                    .map(|(name, _)| ObjectRef::new(name).within(ns))
                    .collect()
            })
            .unwrap_or_default()
    }
}

struct Context {
    reconciler: Arc<Reconciler>,
    error_counts: Mutex<HashMap<String, u32>>,
}

fn object_key(service: &Service) -> String {
    format!(
        "{}/{}",
        service.metadata.namespace.as_deref().unwrap_or("<unknown>"),
        service.metadata.name.as_deref().unwrap_or("<unknown>"),
    )
}

async fn reconcile(service: Arc<Service>, ctx: Arc<Context>) -> Result<Action, ControllerError> {
    ctx.reconciler.reconcile(&service).await?;
    ctx.error_counts
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .remove(&object_key(&service));
    Ok(Action::requeue(RESYNC_INTERVAL))
}

fn error_policy(service: Arc<Service>, error: &ControllerError, ctx: Arc<Context>) -> Action {
    let key = object_key(&service);
    let count = {
        let mut counts = ctx
            .error_counts
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        let count = counts.entry(key.clone()).or_insert(0);
        *count += 1;
        *count
    };
    let delay =
        FibonacciBackoff::for_error_count(count, ERROR_BACKOFF_MIN_SECS, ERROR_BACKOFF_MAX_SECS);
    error!(
        "Reconciliation error for {} (error #{}), requeueing in {}s: {}",
        key,
        count,
        delay.as_secs(),
        error
    );
    Action::requeue(delay)
}

/// Watches Services and their related resources.
pub struct Watcher {
    reconciler: Arc<Reconciler>,
    index: Arc<ServiceIndex>,
    client: Client,
    watch_namespace: Option<String>,
    concurrency: u16,
    debounce: Duration,
}

impl std::fmt::Debug for Watcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Watcher").finish_non_exhaustive()
    }
}

impl Watcher {
    /// Creates a new watcher instance.
    pub fn new(
        reconciler: Arc<Reconciler>,
        index: Arc<ServiceIndex>,
        client: Client,
        watch_namespace: Option<String>,
        concurrency: u16,
        debounce: Duration,
    ) -> Self {
        Self {
            reconciler,
            index,
            client,
            watch_namespace,
            concurrency,
            debounce,
        }
    }

    fn api<K>(&self) -> Api<K>
    where
        K: kube::Resource<Scope = k8s_openapi::NamespaceResourceScope>
            + serde::de::DeserializeOwned
            + std::fmt::Debug,
        K::DynamicType: Default,
    {
        match self.watch_namespace.as_deref() {
            Some(ns) => Api::namespaced(self.client.clone(), ns),
            None => Api::all(self.client.clone()),
        }
    }

    /// Runs the Service controller until the watch stream ends.
    pub async fn watch_services(self) -> Result<(), ControllerError> {
        info!("Starting Service watcher");

        let services: Api<Service> = self.api();
        let slices: Api<EndpointSlice> = self.api();
        let pods: Api<Pod> = self.api();
        let leases: Api<Lease> = self.api();

        let controller_config = ControllerConfig::default()
            .debounce(self.debounce)
            .concurrency(self.concurrency);

        let context = Arc::new(Context {
            reconciler: self.reconciler,
            error_counts: Mutex::new(HashMap::new()),
        });

        let pod_index = self.index.clone();
        let lease_index = self.index.clone();
        let managed_selector = format!("{MANAGED_BY_LABEL}={MANAGED_BY}");

        Controller::new(services, watcher::Config::default())
            .owns(slices, watcher::Config::default().labels(&managed_selector))
            .watches(pods, watcher::Config::default(), move |pod: Pod| {
                pod_index.services_for_pod(&pod)
            })
            .watches(leases, watcher::Config::default(), move |lease: Lease| {
                lease_index.services_for_lease(&lease)
            })
            .with_config(controller_config)
            .run(reconcile, error_policy, context)
            .for_each(|res| async move {
                match res {
                    Ok((obj, _)) => debug!("Reconciled {}", obj),
                    Err(e) => debug!("Controller event error: {}", e),
                }
            })
            .await;

        Ok(())
    }
}

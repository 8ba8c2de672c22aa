//! Test utilities for unit testing the reconcile engine.
//!
//! Provides builders for directed services and candidate pods, a scriptable
//! leadership source, and a harness wiring the engine over the mock slice
//! store and recording metrics.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::{Container, ContainerPort, Pod, PodCondition, PodSpec, PodStatus};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;

use director_core::cache::DecisionCache;
use director_core::decision::{DEFAULT_LEADER_LABEL, DirectedService, TargetPort, slice_name_for};
use director_core::endpoints::MockSliceStore;
use director_core::error::Error;
use director_core::leadership::{Claim, LeadershipResolver, LeadershipSource};
use director_core::metrics::RecordingRecorder;
use director_core::status::StatusRegistry;

use crate::reconciler::Engine;

/// Builds a directed service with a named `http` target port.
pub fn directed_service(ns: &str, name: &str, selector: &[(&str, &str)]) -> DirectedService {
    directed_service_with_target(ns, name, selector, TargetPort::Name("http".to_string()))
}

/// Builds a directed service with an explicit target port.
pub fn directed_service_with_target(
    ns: &str,
    name: &str,
    selector: &[(&str, &str)],
    target_port: TargetPort,
) -> DirectedService {
    DirectedService {
        namespace: ns.to_string(),
        name: name.to_string(),
        uid: format!("{name}-uid"),
        selector: selector
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect(),
        target_port,
        port_name: Some("http".to_string()),
        lease_name: slice_name_for(name),
        leader_label: DEFAULT_LEADER_LABEL.to_string(),
    }
}

fn pod(ns: &str, name: &str, uid: &str, ip: &str, ready: bool, labels: &[(&str, &str)]) -> Pod {
    let labels: BTreeMap<String, String> = labels
        .iter()
        .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
        .collect();
    Pod {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            namespace: Some(ns.to_string()),
            uid: Some(uid.to_string()),
            labels: Some(labels),
            ..Default::default()
        },
        spec: Some(PodSpec {
            containers: vec![Container {
                name: "app".to_string(),
                ports: Some(vec![ContainerPort {
                    name: Some("http".to_string()),
                    container_port: 8080,
                    ..Default::default()
                }]),
                ..Default::default()
            }],
            ..Default::default()
        }),
        status: Some(PodStatus {
            pod_ip: Some(ip.to_string()),
            conditions: Some(vec![PodCondition {
                type_: "Ready".to_string(),
                status: if ready { "True" } else { "False" }.to_string(),
                ..Default::default()
            }]),
            ..Default::default()
        }),
        ..Default::default()
    }
}

/// Builds a Ready candidate pod exposing container port `http` 8080.
pub fn ready_pod(ns: &str, name: &str, uid: &str, ip: &str, labels: &[(&str, &str)]) -> Pod {
    pod(ns, name, uid, ip, true, labels)
}

/// Builds a pod that is not Ready.
pub fn unready_pod(ns: &str, name: &str, uid: &str, ip: &str, labels: &[(&str, &str)]) -> Pod {
    pod(ns, name, uid, ip, false, labels)
}

/// Builds a leadership claim for a pod name.
pub fn claim(pod_name: &str) -> Claim {
    Claim { pod_name: pod_name.to_string(), since: None }
}

/// Scriptable leadership source returning a fixed claim set.
#[derive(Debug, Default)]
pub struct StaticClaims {
    claims: Mutex<Vec<Claim>>,
}

impl StaticClaims {
    /// Replaces the claim set returned from now on.
    pub fn set(&self, claims: Vec<Claim>) {
        *self.claims.lock().unwrap_or_else(PoisonError::into_inner) = claims;
    }
}

/// Newtype over a shared [`StaticClaims`] so the foreign trait can be
/// implemented locally (orphan rule).
#[derive(Debug)]
pub struct SharedStaticClaims(pub Arc<StaticClaims>);

#[async_trait]
impl LeadershipSource for SharedStaticClaims {
    async fn claims(
        &self,
        _svc: &DirectedService,
        _candidates: &[k8s_openapi::api::core::v1::Pod],
    ) -> Result<Vec<Claim>, Error> {
        Ok(self
            .0
            .claims
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone())
    }
}

/// Engine wired over mocks, with handles for assertions.
pub struct Harness {
    /// Engine under test
    pub engine: Engine,
    /// Claim source handle
    pub source: Arc<StaticClaims>,
    /// Recorded slice writes
    pub store: Arc<MockSliceStore>,
    /// Recorded metric events
    pub metrics: RecordingRecorder,
    /// Decision cache
    pub cache: Arc<DecisionCache>,
    /// Status registry
    pub status: Arc<StatusRegistry>,
}

impl std::fmt::Debug for Harness {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Harness").finish_non_exhaustive()
    }
}

/// Builds an engine harness with the given initial claim set.
pub fn harness(initial_claims: Vec<Claim>) -> Harness {
    let source = Arc::new(StaticClaims::default());
    source.set(initial_claims);
    let store = Arc::new(MockSliceStore::new());
    let metrics = RecordingRecorder::new();
    let cache = Arc::new(DecisionCache::new(0));
    let status = Arc::new(StatusRegistry::new());
    let engine = Engine::new(
        cache.clone(),
        status.clone(),
        Arc::new(metrics.clone()),
        LeadershipResolver::new(Box::new(SharedStaticClaims(source.clone()))),
        store.clone(),
        Duration::from_secs(5),
        Duration::from_secs(5),
    );
    Harness { engine, source, store, metrics, cache, status }
}

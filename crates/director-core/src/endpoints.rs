//! EndpointSlice writer.
//!
//! Publishes each routing decision as a server-side apply of the managed
//! slice. The slice carries `kubernetes.io/service-name` so kube-proxy
//! picks it up, a managed-by label so nothing else fights over it, and an
//! owner reference so it is garbage-collected with the Service.

use std::sync::Arc;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::ObjectReference;
use k8s_openapi::api::discovery::v1::{Endpoint, EndpointConditions, EndpointPort, EndpointSlice};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ObjectMeta, OwnerReference};
use kube::api::{Api, DeleteParams, Patch, PatchParams};
use kube::Client;
use tracing::{debug, info};

use crate::budget::ApiBudget;
use crate::decision::{DirectedService, MANAGED_BY, RoutingDecision};
use crate::error::Error;
use crate::metrics::MetricsRecorder;
use crate::retry::{RetryPolicy, with_retries};

/// Label kube-proxy uses to associate a slice with its Service.
pub const SERVICE_NAME_LABEL: &str = "kubernetes.io/service-name";
/// Label marking the slice as managed by this controller.
pub const MANAGED_BY_LABEL: &str = "endpointslice.kubernetes.io/managed-by";

/// Persistence seam for routing decisions.
#[async_trait]
pub trait SliceStore: Send + Sync {
    /// Publishes a decision as the managed EndpointSlice.
    async fn apply(
        &self,
        metrics: &dyn MetricsRecorder,
        svc: &DirectedService,
        decision: &RoutingDecision,
    ) -> Result<(), Error>;

    /// Removes the managed slice. A missing slice is not an error.
    async fn delete(
        &self,
        metrics: &dyn MetricsRecorder,
        namespace: &str,
        service_name: &str,
        slice_name: &str,
    ) -> Result<(), Error>;
}

/// Applies and deletes the managed EndpointSlice for directed services.
#[derive(Clone)]
pub struct EndpointSliceWriter {
    client: Client,
    policy: RetryPolicy,
    budget: Arc<ApiBudget>,
}

impl std::fmt::Debug for EndpointSliceWriter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EndpointSliceWriter").finish_non_exhaustive()
    }
}

impl EndpointSliceWriter {
    /// New writer over a shared client and API budget.
    #[must_use]
    pub fn new(client: Client, policy: RetryPolicy, budget: Arc<ApiBudget>) -> Self {
        Self { client, policy, budget }
    }

    /// Builds the desired slice for a decision. Zero-endpoint decisions
    /// produce a slice with an empty endpoints list, not a deletion.
    #[must_use]
    pub fn build_slice(svc: &DirectedService, decision: &RoutingDecision) -> EndpointSlice {
        let labels = [
            (SERVICE_NAME_LABEL.to_string(), svc.name.clone()),
            (MANAGED_BY_LABEL.to_string(), MANAGED_BY.to_string()),
        ]
        .into_iter()
        .collect();

        let (endpoints, ports) = match &decision.endpoint {
            Some(record) => (
                vec![Endpoint {
                    addresses: vec![record.pod_ip.clone()],
                    conditions: Some(EndpointConditions {
                        ready: Some(true),
                        serving: Some(true),
                        terminating: Some(false),
                    }),
                    target_ref: Some(ObjectReference {
                        kind: Some("Pod".to_string()),
                        name: Some(record.holder.clone()),
                        namespace: Some(record.namespace.clone()),
                        uid: Some(record.holder_uid.clone()),
                        ..Default::default()
                    }),
                    ..Default::default()
                }],
                Some(vec![EndpointPort {
                    name: decision.port_name.clone(),
                    port: Some(record.port),
                    protocol: Some("TCP".to_string()),
                    ..Default::default()
                }]),
            ),
            None => (Vec::new(), None),
        };

        EndpointSlice {
            metadata: ObjectMeta {
                name: Some(decision.slice_name.clone()),
                namespace: Some(svc.namespace.clone()),
                labels: Some(labels),
                owner_references: Some(vec![OwnerReference {
                    api_version: "v1".to_string(),
                    kind: "Service".to_string(),
                    name: svc.name.clone(),
                    uid: svc.uid.clone(),
                    controller: Some(true),
                    ..Default::default()
                }]),
                ..Default::default()
            },
            address_type: "IPv4".to_string(),
            endpoints,
            ports,
        }
    }
}

#[async_trait]
impl SliceStore for EndpointSliceWriter {
    /// Server-side applies the slice for a decision, retrying retryable
    /// failures. Exhaustion returns [`Error::WriteExhausted`] and leaves
    /// the caller's cache entry untouched.
    async fn apply(
        &self,
        metrics: &dyn MetricsRecorder,
        svc: &DirectedService,
        decision: &RoutingDecision,
    ) -> Result<(), Error> {
        let slice = Self::build_slice(svc, decision);
        let mut desired = serde_json::to_value(&slice)?;
        desired["apiVersion"] = serde_json::Value::String("discovery.k8s.io/v1".to_string());
        desired["kind"] = serde_json::Value::String("EndpointSlice".to_string());

        let api: Api<EndpointSlice> = Api::namespaced(self.client.clone(), &svc.namespace);
        let params = PatchParams::apply(MANAGED_BY).force();
        let slice_name = decision.slice_name.clone();

        let (result, ctx) = with_retries(
            self.policy,
            metrics,
            &svc.namespace,
            &svc.name,
            "endpoint_write",
            || {
                let api = api.clone();
                let params = params.clone();
                let desired = desired.clone();
                let slice_name = slice_name.clone();
                let budget = self.budget.clone();
                async move {
                    budget.acquire().await;
                    api.patch(&slice_name, &params, &Patch::Apply(&desired)).await?;
                    Ok(())
                }
            },
        )
        .await;

        match result {
            Ok(()) => {
                debug!(
                    namespace = %svc.namespace,
                    service = %svc.name,
                    slice = %slice_name,
                    endpoints = u8::from(decision.endpoint.is_some()),
                    "Applied endpoint slice"
                );
                Ok(())
            }
            Err(e) => {
                metrics.record_endpoint_write_error(&svc.namespace, &svc.name);
                Err(Error::WriteExhausted {
                    attempts: ctx.attempts,
                    source: Box::new(e),
                })
            }
        }
    }

    async fn delete(
        &self,
        metrics: &dyn MetricsRecorder,
        namespace: &str,
        service_name: &str,
        slice_name: &str,
    ) -> Result<(), Error> {
        let api: Api<EndpointSlice> = Api::namespaced(self.client.clone(), namespace);

        let (result, _) = with_retries(
            self.policy,
            metrics,
            namespace,
            service_name,
            "endpoint_delete",
            || {
                let api = api.clone();
                let slice_name = slice_name.to_string();
                let budget = self.budget.clone();
                async move {
                    budget.acquire().await;
                    match api.delete(&slice_name, &DeleteParams::default()).await {
                        Ok(_) => Ok(()),
                        Err(kube::Error::Api(ae)) if ae.code == 404 => Ok(()),
                        Err(e) => Err(Error::Kube(e)),
                    }
                }
            },
        )
        .await;

        if result.is_ok() {
            info!(namespace, service = service_name, slice = slice_name, "Deleted endpoint slice");
        }
        result
    }
}

/// In-memory store recording applies and deletes, with optional induced
/// write failures.
#[cfg(any(test, feature = "test-util"))]
#[derive(Debug, Default)]
pub struct MockSliceStore {
    applied: std::sync::Mutex<Vec<RoutingDecision>>,
    deleted: std::sync::Mutex<Vec<String>>,
    failures_remaining: std::sync::atomic::AtomicU32,
}

#[cfg(any(test, feature = "test-util"))]
impl MockSliceStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes the next `n` applies fail as exhausted writes.
    pub fn fail_next_applies(&self, n: u32) {
        self.failures_remaining
            .store(n, std::sync::atomic::Ordering::SeqCst);
    }

    /// Decisions applied so far, in order.
    #[must_use]
    pub fn applied(&self) -> Vec<RoutingDecision> {
        self.applied
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .clone()
    }

    /// Slice names deleted so far, in order.
    #[must_use]
    pub fn deleted(&self) -> Vec<String> {
        self.deleted
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .clone()
    }
}

#[cfg(any(test, feature = "test-util"))]
#[async_trait]
impl SliceStore for MockSliceStore {
    async fn apply(
        &self,
        metrics: &dyn MetricsRecorder,
        svc: &DirectedService,
        decision: &RoutingDecision,
    ) -> Result<(), Error> {
        let remaining = self
            .failures_remaining
            .load(std::sync::atomic::Ordering::SeqCst);
        if remaining > 0 {
            self.failures_remaining
                .store(remaining - 1, std::sync::atomic::Ordering::SeqCst);
            metrics.record_endpoint_write_error(&svc.namespace, &svc.name);
            return Err(Error::WriteExhausted {
                attempts: 5,
                source: Box::new(Error::Timeout("induced write failure".to_string())),
            });
        }
        self.applied
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .push(decision.clone());
        Ok(())
    }

    async fn delete(
        &self,
        _metrics: &dyn MetricsRecorder,
        _namespace: &str,
        _service_name: &str,
        slice_name: &str,
    ) -> Result<(), Error> {
        self.deleted
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .push(slice_name.to_string());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use chrono::Utc;

    use super::*;
    use crate::decision::{LeaderRecord, TargetPort};

    fn directed() -> DirectedService {
        DirectedService {
            namespace: "ns".to_string(),
            name: "s1".to_string(),
            uid: "svc-uid".to_string(),
            selector: std::collections::BTreeMap::new(),
            target_port: TargetPort::Name("http".to_string()),
            port_name: Some("http".to_string()),
            lease_name: "s1-leader".to_string(),
            leader_label: crate::decision::DEFAULT_LEADER_LABEL.to_string(),
        }
    }

    fn leader() -> LeaderRecord {
        LeaderRecord {
            holder: "pod-a".to_string(),
            holder_uid: "uid-a".to_string(),
            namespace: "ns".to_string(),
            since: Some(Utc::now()),
            pod_ip: "10.0.0.1".to_string(),
            port: 8080,
        }
    }

    #[test]
    fn slice_carries_routing_labels_and_owner() {
        let svc = directed();
        let decision = RoutingDecision::new(&svc, Some(leader()));
        let slice = EndpointSliceWriter::build_slice(&svc, &decision);

        let labels = slice.metadata.labels.unwrap();
        assert_eq!(labels.get(SERVICE_NAME_LABEL).unwrap(), "s1");
        assert_eq!(labels.get(MANAGED_BY_LABEL).unwrap(), MANAGED_BY);

        let owner = &slice.metadata.owner_references.unwrap()[0];
        assert_eq!(owner.kind, "Service");
        assert_eq!(owner.name, "s1");
        assert_eq!(owner.uid, "svc-uid");
        assert_eq!(owner.controller, Some(true));
    }

    #[test]
    fn leader_decision_produces_single_endpoint() {
        let svc = directed();
        let decision = RoutingDecision::new(&svc, Some(leader()));
        let slice = EndpointSliceWriter::build_slice(&svc, &decision);

        assert_eq!(slice.address_type, "IPv4");
        assert_eq!(slice.endpoints.len(), 1);
        assert_eq!(slice.endpoints[0].addresses, vec!["10.0.0.1".to_string()]);
        assert_eq!(
            slice.endpoints[0].target_ref.as_ref().unwrap().name.as_deref(),
            Some("pod-a")
        );

        let ports = slice.ports.unwrap();
        assert_eq!(ports[0].port, Some(8080));
        assert_eq!(ports[0].name.as_deref(), Some("http"));
    }

    #[test]
    fn electing_decision_produces_empty_slice_not_absence() {
        let svc = directed();
        let decision = RoutingDecision::new(&svc, None);
        let slice = EndpointSliceWriter::build_slice(&svc, &decision);

        assert_eq!(slice.metadata.name.as_deref(), Some("s1-leader"));
        assert!(slice.endpoints.is_empty());
        assert!(slice.ports.is_none());
    }
}

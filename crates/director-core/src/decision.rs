//! Routing decision data model.
//!
//! `DirectedService` captures a Service opted into leader routing,
//! `LeaderRecord` the resolved leadership state for one cycle, and
//! `RoutingDecision` the EndpointSlice content the writer applies.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use k8s_openapi::api::core::v1::Service;
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use serde::Serialize;

use crate::error::Error;

/// Opt-in annotation. A Service carrying `"true"` here is leader-routed.
pub const ROUTING_ANNOTATION: &str = "svc-director.io/leader-routing";
/// Overrides the Lease name consulted by the lease leadership source.
pub const LEASE_NAME_ANNOTATION: &str = "svc-director.io/lease-name";
/// Overrides the pod label key consulted by the label leadership source.
pub const LEADER_LABEL_ANNOTATION: &str = "svc-director.io/leader-label";
/// Default pod label marking a leadership claim.
pub const DEFAULT_LEADER_LABEL: &str = "svc-director.io/leader";
/// Field manager / managed-by value for everything this controller writes.
pub const MANAGED_BY: &str = "svc-director";

/// Declared target port of a DirectedService.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TargetPort {
    /// Named container port, resolved against the leader pod's spec
    Name(String),
    /// Numeric port, validated and passed through
    Number(i32),
}

/// A Service opted into leader-only routing.
#[derive(Debug, Clone)]
pub struct DirectedService {
    /// Namespace of the Service
    pub namespace: String,
    /// Name of the Service
    pub name: String,
    /// UID of the Service, used for the owner reference on the managed slice
    pub uid: String,
    /// Pod selector from the Service spec
    pub selector: BTreeMap<String, String>,
    /// Declared target port (name or number)
    pub target_port: TargetPort,
    /// Name of the service port, carried onto the EndpointSlice port
    pub port_name: Option<String>,
    /// Lease consulted by the lease leadership source
    pub lease_name: String,
    /// Pod label key consulted by the label leadership source
    pub leader_label: String,
}

impl DirectedService {
    /// Deterministic name of the managed EndpointSlice.
    #[must_use]
    pub fn slice_name(&self) -> String {
        slice_name_for(&self.name)
    }

    /// Cache/status key.
    #[must_use]
    pub fn key(&self) -> String {
        format!("{}/{}", self.namespace, self.name)
    }

    /// Builds a `DirectedService` from a watched Service.
    ///
    /// Returns `Ok(None)` when the Service has not opted in via the routing
    /// annotation or is being deleted.
    pub fn from_service(service: &Service) -> Result<Option<Self>, Error> {
        let annotations = service.metadata.annotations.as_ref();
        let opted_in = annotations
            .and_then(|a| a.get(ROUTING_ANNOTATION))
            .is_some_and(|v| v == "true");
        if !opted_in || service.metadata.deletion_timestamp.is_some() {
            return Ok(None);
        }

        let name = service
            .metadata
            .name
            .clone()
            .ok_or_else(|| Error::InvalidObject("Service missing name".to_string()))?;
        let namespace = service
            .metadata
            .namespace
            .clone()
            .ok_or_else(|| Error::InvalidObject("Service missing namespace".to_string()))?;
        let uid = service.metadata.uid.clone().unwrap_or_default();

        let spec = service
            .spec
            .as_ref()
            .ok_or_else(|| Error::InvalidObject(format!("Service {namespace}/{name} has no spec")))?;
        let selector = spec.selector.clone().unwrap_or_default();

        let port = spec
            .ports
            .as_ref()
            .and_then(|ports| ports.first())
            .ok_or_else(|| Error::InvalidObject(format!("Service {namespace}/{name} has no ports")))?;
        let target_port = match &port.target_port {
            Some(IntOrString::Int(n)) => TargetPort::Number(*n),
            Some(IntOrString::String(s)) => TargetPort::Name(s.clone()),
            None => TargetPort::Number(port.port),
        };

        let lease_name = annotations
            .and_then(|a| a.get(LEASE_NAME_ANNOTATION))
            .cloned()
            .unwrap_or_else(|| slice_name_for(&name));
        let leader_label = annotations
            .and_then(|a| a.get(LEADER_LABEL_ANNOTATION))
            .cloned()
            .unwrap_or_else(|| DEFAULT_LEADER_LABEL.to_string());

        Ok(Some(Self {
            namespace,
            name,
            uid,
            selector,
            target_port,
            port_name: port.name.clone(),
            lease_name,
            leader_label,
        }))
    }
}

/// Deterministic slice name derived from a Service name.
#[must_use]
pub fn slice_name_for(service_name: &str) -> String {
    format!("{service_name}-leader")
}

/// Resolved leadership state for a DirectedService at a point in time.
///
/// Transient: rederived every reconcile cycle, never persisted independently.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LeaderRecord {
    /// Pod name of the current holder
    pub holder: String,
    /// Pod UID of the current holder
    pub holder_uid: String,
    /// Namespace of the holder pod
    pub namespace: String,
    /// When this holder acquired leadership, if the source reports it
    pub since: Option<DateTime<Utc>>,
    /// Pod IP routed to
    pub pod_ip: String,
    /// Resolved numeric target port
    pub port: i32,
}

impl LeaderRecord {
    /// Seconds since this holder acquired leadership.
    #[must_use]
    pub fn age_seconds(&self, now: DateTime<Utc>) -> Option<i64> {
        self.since.map(|s| (now - s).num_seconds().max(0))
    }
}

/// The output the writer applies: zero or one endpoint for the managed slice.
///
/// A decision with no endpoint is still written, never silently skipped, so
/// leader loss shows up as "service without endpoints" rather than stale
/// routing to a dead pod.
#[derive(Debug, Clone, PartialEq)]
pub struct RoutingDecision {
    /// Target EndpointSlice name
    pub slice_name: String,
    /// Service port name carried onto the slice
    pub port_name: Option<String>,
    /// The single routed endpoint, or `None` while electing
    pub endpoint: Option<LeaderRecord>,
}

impl RoutingDecision {
    /// Builds the decision for a service and an optional leader record.
    #[must_use]
    pub fn new(svc: &DirectedService, endpoint: Option<LeaderRecord>) -> Self {
        Self {
            slice_name: svc.slice_name(),
            port_name: svc.port_name.clone(),
            endpoint,
        }
    }

    /// Content fingerprint used to detect no-op reconciles.
    ///
    /// Covers everything the written slice carries, including the port name,
    /// and excludes acquisition timestamps so lease renewals do not force
    /// writes.
    #[must_use]
    pub fn fingerprint(&self) -> String {
        let port_name = self.port_name.as_deref().unwrap_or("");
        match &self.endpoint {
            Some(r) => format!(
                "{}|{}|{}:{}|{}|{}",
                self.slice_name, port_name, r.pod_ip, r.port, r.holder, r.holder_uid
            ),
            None => format!("{}|{}|none", self.slice_name, port_name),
        }
    }
}

//! Leadership resolution.
//!
//! A [`LeadershipSource`] reports which candidate pods currently claim
//! leadership; the resolver applies the sticky-leader policy on top of the
//! observed claims. Sources are chosen at construction time: lease-based
//! (a coordination.k8s.io Lease holds the holder identity) or label-based
//! (a pod label marks the claim).

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use k8s_openapi::api::coordination::v1::Lease;
use k8s_openapi::api::core::v1::Pod;
use kube::{Api, Client};
use tracing::debug;

use crate::budget::ApiBudget;
use crate::decision::{DirectedService, LeaderRecord};
use crate::error::Error;

/// A leadership claim observed from the leadership source.
#[derive(Debug, Clone)]
pub struct Claim {
    /// Name of the claiming pod
    pub pod_name: String,
    /// When the claim was acquired, if the source reports it
    pub since: Option<DateTime<Utc>>,
}

/// Source of leadership state.
///
/// Claims are always resolved against the given ready candidate set; a holder
/// that names no candidate yields no claim.
#[async_trait]
pub trait LeadershipSource: Send + Sync {
    /// Returns the claims among `candidates` for this service.
    async fn claims(
        &self,
        svc: &DirectedService,
        candidates: &[Pod],
    ) -> Result<Vec<Claim>, Error>;
}

/// Lease-based leadership: reads the Lease named by the service (default
/// `<service>-leader`) and matches its holder identity against candidates.
///
/// Holder identities are accepted as a bare pod name or `name_uid`.
pub struct LeaseSource {
    client: Client,
    budget: Arc<ApiBudget>,
}

impl std::fmt::Debug for LeaseSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LeaseSource").finish_non_exhaustive()
    }
}

impl LeaseSource {
    /// Creates a lease source over the given client, drawing its reads from
    /// the shared API budget.
    #[must_use]
    pub fn new(client: Client, budget: Arc<ApiBudget>) -> Self {
        Self { client, budget }
    }
}

#[async_trait]
impl LeadershipSource for LeaseSource {
    async fn claims(
        &self,
        svc: &DirectedService,
        candidates: &[Pod],
    ) -> Result<Vec<Claim>, Error> {
        let api: Api<Lease> = Api::namespaced(self.client.clone(), &svc.namespace);
        self.budget.acquire().await;
        let Some(lease) = api.get_opt(&svc.lease_name).await? else {
            debug!("Lease {}/{} not found", svc.namespace, svc.lease_name);
            return Ok(Vec::new());
        };
        let spec = lease.spec.unwrap_or_default();
        let Some(holder) = spec.holder_identity else {
            return Ok(Vec::new());
        };
        if holder.trim().is_empty() || holder.contains(char::is_whitespace) {
            return Err(Error::MalformedIdentity(format!(
                "Lease {}/{} holder {holder:?}",
                svc.namespace, svc.lease_name
            )));
        }

        let since = spec.acquire_time.map(|t| t.0);
        let claim = candidates.iter().find_map(|pod| {
            let name = pod.metadata.name.as_deref()?;
            let uid = pod.metadata.uid.as_deref().unwrap_or_default();
            (holder == name || holder == format!("{name}_{uid}")).then(|| Claim {
                pod_name: name.to_string(),
                since,
            })
        });
        match claim {
            Some(c) => Ok(vec![c]),
            None => {
                debug!(
                    "Lease {}/{} holder {} matches no ready candidate",
                    svc.namespace, svc.lease_name, holder
                );
                Ok(Vec::new())
            }
        }
    }
}

/// Label-based leadership: candidates carrying the leader label (default
/// `svc-director.io/leader: "true"`) claim leadership.
#[derive(Debug, Default)]
pub struct LabelSource;

impl LabelSource {
    /// Creates a label source.
    #[must_use]
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl LeadershipSource for LabelSource {
    async fn claims(
        &self,
        svc: &DirectedService,
        candidates: &[Pod],
    ) -> Result<Vec<Claim>, Error> {
        Ok(candidates
            .iter()
            .filter(|pod| {
                pod.metadata
                    .labels
                    .as_ref()
                    .and_then(|l| l.get(&svc.leader_label))
                    .is_some_and(|v| v == "true")
            })
            .filter_map(|pod| {
                Some(Claim {
                    pod_name: pod.metadata.name.clone()?,
                    since: pod.status.as_ref().and_then(|s| s.start_time.as_ref()).map(|t| t.0),
                })
            })
            .collect())
    }
}

/// True when a pod is an eligible leadership candidate: not terminating,
/// has an IP, and reports the Ready condition.
#[must_use]
pub fn is_ready(pod: &Pod) -> bool {
    if pod.metadata.deletion_timestamp.is_some() {
        return false;
    }
    let Some(status) = pod.status.as_ref() else {
        return false;
    };
    let has_ip = status.pod_ip.as_deref().is_some_and(|ip| !ip.is_empty());
    let ready = status
        .conditions
        .as_deref()
        .unwrap_or_default()
        .iter()
        .any(|c| c.type_ == "Ready" && c.status == "True");
    has_ip && ready
}

/// Filters a pod set down to eligible leadership candidates.
#[must_use]
pub fn ready_candidates(pods: Vec<Pod>) -> Vec<Pod> {
    pods.into_iter().filter(is_ready).collect()
}

/// The leader elected for this cycle, before port resolution.
#[derive(Debug, Clone, PartialEq)]
pub struct ElectedLeader {
    /// Pod name
    pub name: String,
    /// Pod UID
    pub uid: String,
    /// Pod IP
    pub pod_ip: String,
    /// Acquisition time reported by the source
    pub since: Option<DateTime<Utc>>,
}

/// Whether the previous leader was retained.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Sticky {
    /// Previous leader retained
    Hit,
    /// Previous leader ineligible; failed over to the current claimant
    Miss,
    /// No previous leader was routed
    Initial,
}

/// Outcome of one resolution cycle.
#[derive(Debug, Clone, PartialEq)]
pub enum Resolution {
    /// No candidate claims leadership (Electing)
    None,
    /// A leader was resolved
    Leader(ElectedLeader, Sticky),
}

/// Resolves the current leader from a leadership source, holding onto the
/// previously routed leader while it remains eligible.
pub struct LeadershipResolver {
    source: Box<dyn LeadershipSource>,
}

impl std::fmt::Debug for LeadershipResolver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LeadershipResolver").finish_non_exhaustive()
    }
}

impl LeadershipResolver {
    /// Creates a resolver over the given source.
    #[must_use]
    pub fn new(source: Box<dyn LeadershipSource>) -> Self {
        Self { source }
    }

    /// Resolves leadership among ready candidates, applying the sticky policy
    /// against the previous cycle's record.
    pub async fn resolve(
        &self,
        svc: &DirectedService,
        candidates: &[Pod],
        previous: Option<&LeaderRecord>,
    ) -> Result<Resolution, Error> {
        let claims = self.source.claims(svc, candidates).await?;
        resolve_sticky(svc, &claims, candidates, previous)
    }
}

/// Pure sticky-leader policy over observed claims.
///
/// The previous leader is kept while it is present, Ready, the same pod
/// (name and UID), and still claiming, even if another pod also claims,
/// which guards against races during lease handover. Otherwise the current
/// claimant wins; more than one claimant with no previous among them is
/// ambiguous.
pub fn resolve_sticky(
    svc: &DirectedService,
    claims: &[Claim],
    candidates: &[Pod],
    previous: Option<&LeaderRecord>,
) -> Result<Resolution, Error> {
    if let Some(prev) = previous {
        let still_claiming = claims.iter().any(|c| c.pod_name == prev.holder);
        if still_claiming {
            if let Some(pod) = candidates.iter().find(|p| {
                p.metadata.name.as_deref() == Some(prev.holder.as_str())
                    && p.metadata.uid.as_deref() == Some(prev.holder_uid.as_str())
            }) {
                let elected = elect(pod, prev.since);
                return Ok(Resolution::Leader(elected, Sticky::Hit));
            }
        }
    }

    match claims {
        [] => Ok(Resolution::None),
        [claim] => {
            let Some(pod) = candidates
                .iter()
                .find(|p| p.metadata.name.as_deref() == Some(claim.pod_name.as_str()))
            else {
                return Ok(Resolution::None);
            };
            let sticky = if previous.is_some() { Sticky::Miss } else { Sticky::Initial };
            Ok(Resolution::Leader(elect(pod, claim.since), sticky))
        }
        many => Err(Error::AmbiguousClaim(format!(
            "{} candidates claim leadership of {}: {}",
            many.len(),
            svc.key(),
            many.iter().map(|c| c.pod_name.as_str()).collect::<Vec<_>>().join(", ")
        ))),
    }
}

fn elect(pod: &Pod, since: Option<DateTime<Utc>>) -> ElectedLeader {
    ElectedLeader {
        name: pod.metadata.name.clone().unwrap_or_default(),
        uid: pod.metadata.uid.clone().unwrap_or_default(),
        pod_ip: pod
            .status
            .as_ref()
            .and_then(|s| s.pod_ip.clone())
            .unwrap_or_default(),
        since,
    }
}

//! In-process status registry and health tracking.
//!
//! The annotation profile has no status subresource to patch, so the
//! per-service phase lives in memory and is served as JSON by the probe
//! server. [`Health`] backs the readiness probe: ready means at least
//! one cycle finished and no reconcile has been stuck past the
//! threshold.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, PoisonError, RwLock};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::Serialize;

/// Routing phase of one directed service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Phase {
    /// No leader currently routed; slice has zero endpoints.
    Electing,
    /// Exactly one leader routed.
    Stable,
}

/// Point-in-time status of one directed service.
#[derive(Debug, Clone, Serialize)]
pub struct ServiceStatus {
    /// Current phase.
    pub phase: Phase,
    /// Leader pod name, when Stable.
    pub holder: Option<String>,
    /// Ready candidate pods seen in the last cycle.
    pub candidates: usize,
    /// When the phase last changed.
    pub last_transition: DateTime<Utc>,
    /// Last logical error, if the cycle degraded to no endpoints.
    pub message: Option<String>,
}

/// Registry of service statuses keyed by `namespace/name`.
#[derive(Debug, Default)]
pub struct StatusRegistry {
    services: RwLock<HashMap<String, ServiceStatus>>,
}

impl StatusRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Records the outcome of a cycle. `last_transition` only moves when
    /// the phase actually changes.
    pub fn update(
        &self,
        key: &str,
        phase: Phase,
        holder: Option<String>,
        candidates: usize,
        message: Option<String>,
    ) {
        let mut services = self
            .services
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        match services.get_mut(key) {
            Some(existing) => {
                if existing.phase != phase {
                    existing.last_transition = Utc::now();
                }
                existing.phase = phase;
                existing.holder = holder;
                existing.candidates = candidates;
                existing.message = message;
            }
            None => {
                services.insert(
                    key.to_string(),
                    ServiceStatus {
                        phase,
                        holder,
                        candidates,
                        last_transition: Utc::now(),
                        message,
                    },
                );
            }
        }
    }

    /// Drops a service that is no longer directed.
    pub fn remove(&self, key: &str) {
        self.services
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(key);
    }

    /// Status of one service.
    #[must_use]
    pub fn get(&self, key: &str) -> Option<ServiceStatus> {
        self.services
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(key)
            .cloned()
    }

    /// Snapshot of all services, for the `/status` endpoint.
    #[must_use]
    pub fn snapshot(&self) -> HashMap<String, ServiceStatus> {
        self.services
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

/// Liveness/readiness state shared between the reconciler and the probe
/// server.
#[derive(Debug)]
pub struct Health {
    first_cycle_done: AtomicBool,
    in_flight: Mutex<HashMap<String, Instant>>,
    stuck_threshold: Duration,
}

impl Health {
    /// `stuck_threshold` is how long a single reconcile may run before
    /// readiness drops.
    #[must_use]
    pub fn new(stuck_threshold: Duration) -> Self {
        Self {
            first_cycle_done: AtomicBool::new(false),
            in_flight: Mutex::new(HashMap::new()),
            stuck_threshold,
        }
    }

    /// Marks a reconcile started for `key`.
    pub fn cycle_started(&self, key: &str) {
        self.in_flight
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(key.to_string(), Instant::now());
    }

    /// Marks the reconcile for `key` finished (success or error).
    pub fn cycle_finished(&self, key: &str) {
        self.first_cycle_done.store(true, Ordering::Release);
        self.in_flight
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(key);
    }

    /// True once the first cycle completed and no cycle is stuck.
    #[must_use]
    pub fn is_ready(&self) -> bool {
        if !self.first_cycle_done.load(Ordering::Acquire) {
            return false;
        }
        let in_flight = self
            .in_flight
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        !in_flight
            .values()
            .any(|started| started.elapsed() > self.stuck_threshold)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transition_time_moves_only_on_phase_change() {
        let registry = StatusRegistry::new();
        registry.update("ns/s1", Phase::Electing, None, 0, None);
        let first = registry.get("ns/s1").unwrap().last_transition;

        registry.update("ns/s1", Phase::Electing, None, 2, None);
        assert_eq!(registry.get("ns/s1").unwrap().last_transition, first);

        registry.update("ns/s1", Phase::Stable, Some("pod-a".to_string()), 2, None);
        let status = registry.get("ns/s1").unwrap();
        assert!(status.last_transition >= first);
        assert_eq!(status.phase, Phase::Stable);
        assert_eq!(status.holder.as_deref(), Some("pod-a"));
    }

    #[test]
    fn removed_service_disappears_from_snapshot() {
        let registry = StatusRegistry::new();
        registry.update("ns/s1", Phase::Stable, Some("pod-a".to_string()), 1, None);
        registry.update("ns/s2", Phase::Electing, None, 0, None);
        registry.remove("ns/s1");
        let snapshot = registry.snapshot();
        assert_eq!(snapshot.len(), 1);
        assert!(snapshot.contains_key("ns/s2"));
    }

    #[test]
    fn readiness_requires_a_completed_cycle() {
        let health = Health::new(Duration::from_secs(60));
        assert!(!health.is_ready());
        health.cycle_started("ns/s1");
        assert!(!health.is_ready());
        health.cycle_finished("ns/s1");
        assert!(health.is_ready());
    }

    #[test]
    fn stuck_cycle_drops_readiness() {
        let health = Health::new(Duration::ZERO);
        health.cycle_started("ns/s1");
        health.cycle_finished("ns/s1");
        assert!(health.is_ready());

        health.cycle_started("ns/s2");
        std::thread::sleep(Duration::from_millis(5));
        assert!(!health.is_ready());
        health.cycle_finished("ns/s2");
        assert!(health.is_ready());
    }
}

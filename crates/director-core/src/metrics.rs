//! Metrics recorder contract and Prometheus implementation.
//!
//! Every decision and failure the engine makes is reported through
//! [`MetricsRecorder`]; the trait is the observability contract, the
//! Prometheus registry is one implementation of it. Tests use
//! [`RecordingRecorder`] to assert on exact call sequences.

use std::time::Duration;

use prometheus::{
    Encoder, HistogramOpts, HistogramVec, IntCounterVec, IntGaugeVec, Opts, Registry, TextEncoder,
};
use tracing::warn;

/// Observability contract for the reconciliation engine.
pub trait MetricsRecorder: Send + Sync {
    /// One write/read attempt inside the retry wrapper; `attempt` is the
    /// attempt number as a label, capped at `"max"`.
    fn record_retry_attempt(&self, namespace: &str, service: &str, op: &str, attempt: &str);
    /// An operation that ultimately succeeded after at least one retry.
    fn record_retry_success_after_retry(&self, namespace: &str, service: &str, op: &str);
    /// New decision fingerprint matched the cached one; no write issued.
    fn record_cache_hit(&self, namespace: &str, service: &str);
    /// Decision changed; a write proceeds.
    fn record_cache_miss(&self, namespace: &str, service: &str);
    /// Previous leader retained across a cycle.
    fn record_sticky_hit(&self, namespace: &str, service: &str);
    /// Routed endpoint switched to a new leader.
    fn record_failover(&self, namespace: &str, service: &str);
    /// Declared target port could not be resolved on the leader pod.
    fn record_port_resolution_failure(&self, namespace: &str, service: &str);
    /// A write was abandoned after exhausting its retry budget.
    fn record_endpoint_write_error(&self, namespace: &str, service: &str);
    /// Age of the current leadership tenure.
    fn set_leader_age(&self, namespace: &str, service: &str, age: Duration);
    /// Whether the service currently routes to no endpoint.
    fn set_without_endpoints(&self, namespace: &str, service: &str, without: bool);
    /// A completed reconcile cycle and its duration.
    fn record_reconcile(&self, namespace: &str, service: &str, duration: Duration);
    /// A reconcile cycle that ended in error.
    fn record_reconcile_error(&self, namespace: &str, service: &str);
}

/// Prometheus-backed recorder.
pub struct PrometheusRecorder {
    registry: Registry,
    retry_attempts: IntCounterVec,
    retry_successes: IntCounterVec,
    cache_hits: IntCounterVec,
    cache_misses: IntCounterVec,
    sticky_hits: IntCounterVec,
    failovers: IntCounterVec,
    port_resolution_failures: IntCounterVec,
    endpoint_write_errors: IntCounterVec,
    leader_age_seconds: IntGaugeVec,
    without_endpoints: IntGaugeVec,
    reconcile_duration_seconds: HistogramVec,
    reconcile_total: IntCounterVec,
    reconcile_errors: IntCounterVec,
}

impl std::fmt::Debug for PrometheusRecorder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PrometheusRecorder").finish_non_exhaustive()
    }
}

const SERVICE_LABELS: &[&str] = &["namespace", "service"];

fn counter(name: &str, help: &str, labels: &[&str]) -> Result<IntCounterVec, prometheus::Error> {
    IntCounterVec::new(Opts::new(name, help), labels)
}

impl PrometheusRecorder {
    /// Builds the recorder and registers all metrics in a fresh registry.
    pub fn new() -> Result<Self, prometheus::Error> {
        let registry = Registry::new();

        let retry_attempts = counter(
            "director_retry_attempts_total",
            "API operation attempts, by attempt number (capped at \"max\")",
            &["namespace", "service", "operation", "attempt"],
        )?;
        let retry_successes = counter(
            "director_retry_success_after_retry_total",
            "API operations that succeeded only after retrying",
            &["namespace", "service", "operation"],
        )?;
        let cache_hits = counter(
            "director_cache_hits_total",
            "Reconciles short-circuited by an identical cached decision",
            SERVICE_LABELS,
        )?;
        let cache_misses = counter(
            "director_cache_misses_total",
            "Reconciles whose decision changed and triggered a write",
            SERVICE_LABELS,
        )?;
        let sticky_hits = counter(
            "director_sticky_hits_total",
            "Cycles that retained the previously routed leader",
            SERVICE_LABELS,
        )?;
        let failovers = counter(
            "director_failovers_total",
            "Cycles that switched the routed endpoint to a new leader",
            SERVICE_LABELS,
        )?;
        let port_resolution_failures = counter(
            "director_port_resolution_failures_total",
            "Cycles where the declared target port did not resolve",
            SERVICE_LABELS,
        )?;
        let endpoint_write_errors = counter(
            "director_endpoint_write_errors_total",
            "EndpointSlice writes abandoned after exhausting retries",
            SERVICE_LABELS,
        )?;
        let leader_age_seconds = IntGaugeVec::new(
            Opts::new(
                "director_leader_age_seconds",
                "Seconds since the current leader acquired leadership",
            ),
            SERVICE_LABELS,
        )?;
        let without_endpoints = IntGaugeVec::new(
            Opts::new(
                "director_service_without_endpoints",
                "1 when the service currently routes to no endpoint",
            ),
            SERVICE_LABELS,
        )?;
        let reconcile_duration_seconds = HistogramVec::new(
            HistogramOpts::new(
                "director_reconcile_duration_seconds",
                "Duration of reconcile cycles",
            ),
            SERVICE_LABELS,
        )?;
        let reconcile_total = counter(
            "director_reconcile_total",
            "Completed reconcile cycles",
            SERVICE_LABELS,
        )?;
        let reconcile_errors = counter(
            "director_reconcile_errors_total",
            "Reconcile cycles that ended in error",
            SERVICE_LABELS,
        )?;

        registry.register(Box::new(retry_attempts.clone()))?;
        registry.register(Box::new(retry_successes.clone()))?;
        registry.register(Box::new(cache_hits.clone()))?;
        registry.register(Box::new(cache_misses.clone()))?;
        registry.register(Box::new(sticky_hits.clone()))?;
        registry.register(Box::new(failovers.clone()))?;
        registry.register(Box::new(port_resolution_failures.clone()))?;
        registry.register(Box::new(endpoint_write_errors.clone()))?;
        registry.register(Box::new(leader_age_seconds.clone()))?;
        registry.register(Box::new(without_endpoints.clone()))?;
        registry.register(Box::new(reconcile_duration_seconds.clone()))?;
        registry.register(Box::new(reconcile_total.clone()))?;
        registry.register(Box::new(reconcile_errors.clone()))?;

        Ok(Self {
            registry,
            retry_attempts,
            retry_successes,
            cache_hits,
            cache_misses,
            sticky_hits,
            failovers,
            port_resolution_failures,
            endpoint_write_errors,
            leader_age_seconds,
            without_endpoints,
            reconcile_duration_seconds,
            reconcile_total,
            reconcile_errors,
        })
    }

    /// The underlying registry.
    #[must_use]
    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Renders all metrics in Prometheus text exposition format.
    #[must_use]
    pub fn render(&self) -> String {
        let mut buf = Vec::new();
        let encoder = TextEncoder::new();
        if let Err(e) = encoder.encode(&self.registry.gather(), &mut buf) {
            warn!("Failed to encode metrics: {}", e);
            return String::new();
        }
        String::from_utf8(buf).unwrap_or_default()
    }
}

impl MetricsRecorder for PrometheusRecorder {
    fn record_retry_attempt(&self, namespace: &str, service: &str, op: &str, attempt: &str) {
        self.retry_attempts
            .with_label_values(&[namespace, service, op, attempt])
            .inc();
    }

    fn record_retry_success_after_retry(&self, namespace: &str, service: &str, op: &str) {
        self.retry_successes
            .with_label_values(&[namespace, service, op])
            .inc();
    }

    fn record_cache_hit(&self, namespace: &str, service: &str) {
        self.cache_hits.with_label_values(&[namespace, service]).inc();
    }

    fn record_cache_miss(&self, namespace: &str, service: &str) {
        self.cache_misses.with_label_values(&[namespace, service]).inc();
    }

    fn record_sticky_hit(&self, namespace: &str, service: &str) {
        self.sticky_hits.with_label_values(&[namespace, service]).inc();
    }

    fn record_failover(&self, namespace: &str, service: &str) {
        self.failovers.with_label_values(&[namespace, service]).inc();
    }

    fn record_port_resolution_failure(&self, namespace: &str, service: &str) {
        self.port_resolution_failures
            .with_label_values(&[namespace, service])
            .inc();
    }

    fn record_endpoint_write_error(&self, namespace: &str, service: &str) {
        self.endpoint_write_errors
            .with_label_values(&[namespace, service])
            .inc();
    }

    fn set_leader_age(&self, namespace: &str, service: &str, age: Duration) {
        self.leader_age_seconds
            .with_label_values(&[namespace, service])
            .set(i64::try_from(age.as_secs()).unwrap_or(i64::MAX));
    }

    fn set_without_endpoints(&self, namespace: &str, service: &str, without: bool) {
        self.without_endpoints
            .with_label_values(&[namespace, service])
            .set(i64::from(without));
    }

    fn record_reconcile(&self, namespace: &str, service: &str, duration: Duration) {
        self.reconcile_duration_seconds
            .with_label_values(&[namespace, service])
            .observe(duration.as_secs_f64());
        self.reconcile_total.with_label_values(&[namespace, service]).inc();
    }

    fn record_reconcile_error(&self, namespace: &str, service: &str) {
        self.reconcile_errors
            .with_label_values(&[namespace, service])
            .inc();
    }
}

/// Recorded metric event, for test assertions.
#[cfg(any(test, feature = "test-util"))]
#[derive(Debug, Clone, PartialEq)]
pub enum MetricEvent {
    /// One attempt of a retried operation
    RetryAttempt {
        /// `namespace/service` key
        key: String,
        /// Operation name
        op: String,
        /// Attempt label ("1", "2", ..., "max")
        attempt: String,
    },
    /// Success after at least one retry
    RetrySuccessAfterRetry {
        /// `namespace/service` key
        key: String,
        /// Operation name
        op: String,
    },
    /// Cache hit
    CacheHit(String),
    /// Cache miss
    CacheMiss(String),
    /// Sticky hit
    StickyHit(String),
    /// Failover
    Failover(String),
    /// Port resolution failure
    PortResolutionFailure(String),
    /// Exhausted endpoint write
    EndpointWriteError(String),
    /// Leader age gauge update
    LeaderAge(String, Duration),
    /// Without-endpoints gauge update
    WithoutEndpoints(String, bool),
    /// Completed reconcile
    Reconcile(String),
    /// Errored reconcile
    ReconcileError(String),
}

/// In-memory recorder capturing events in call order.
#[cfg(any(test, feature = "test-util"))]
#[derive(Debug, Clone, Default)]
pub struct RecordingRecorder {
    events: std::sync::Arc<std::sync::Mutex<Vec<MetricEvent>>>,
}

#[cfg(any(test, feature = "test-util"))]
impl RecordingRecorder {
    /// Creates an empty recorder.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// All events recorded so far, in order.
    #[must_use]
    pub fn events(&self) -> Vec<MetricEvent> {
        self.events
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .clone()
    }

    /// Count of events matching a predicate.
    #[must_use]
    pub fn count(&self, pred: impl Fn(&MetricEvent) -> bool) -> usize {
        self.events().iter().filter(|e| pred(e)).count()
    }

    fn push(&self, event: MetricEvent) {
        self.events
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .push(event);
    }
}

#[cfg(any(test, feature = "test-util"))]
impl MetricsRecorder for RecordingRecorder {
    fn record_retry_attempt(&self, namespace: &str, service: &str, op: &str, attempt: &str) {
        self.push(MetricEvent::RetryAttempt {
            key: format!("{namespace}/{service}"),
            op: op.to_string(),
            attempt: attempt.to_string(),
        });
    }

    fn record_retry_success_after_retry(&self, namespace: &str, service: &str, op: &str) {
        self.push(MetricEvent::RetrySuccessAfterRetry {
            key: format!("{namespace}/{service}"),
            op: op.to_string(),
        });
    }

    fn record_cache_hit(&self, namespace: &str, service: &str) {
        self.push(MetricEvent::CacheHit(format!("{namespace}/{service}")));
    }

    fn record_cache_miss(&self, namespace: &str, service: &str) {
        self.push(MetricEvent::CacheMiss(format!("{namespace}/{service}")));
    }

    fn record_sticky_hit(&self, namespace: &str, service: &str) {
        self.push(MetricEvent::StickyHit(format!("{namespace}/{service}")));
    }

    fn record_failover(&self, namespace: &str, service: &str) {
        self.push(MetricEvent::Failover(format!("{namespace}/{service}")));
    }

    fn record_port_resolution_failure(&self, namespace: &str, service: &str) {
        self.push(MetricEvent::PortResolutionFailure(format!("{namespace}/{service}")));
    }

    fn record_endpoint_write_error(&self, namespace: &str, service: &str) {
        self.push(MetricEvent::EndpointWriteError(format!("{namespace}/{service}")));
    }

    fn set_leader_age(&self, namespace: &str, service: &str, age: Duration) {
        self.push(MetricEvent::LeaderAge(format!("{namespace}/{service}"), age));
    }

    fn set_without_endpoints(&self, namespace: &str, service: &str, without: bool) {
        self.push(MetricEvent::WithoutEndpoints(format!("{namespace}/{service}"), without));
    }

    fn record_reconcile(&self, namespace: &str, service: &str, _duration: Duration) {
        self.push(MetricEvent::Reconcile(format!("{namespace}/{service}")));
    }

    fn record_reconcile_error(&self, namespace: &str, service: &str) {
        self.push(MetricEvent::ReconcileError(format!("{namespace}/{service}")));
    }
}

//! Environment-driven configuration.
//!
//! All options are read once at startup; invalid values are fatal there,
//! never mid-loop.

use std::net::SocketAddr;
use std::time::Duration;

use crate::error::Error;

/// Which leadership source the resolver consults.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LeadershipKind {
    /// coordination.k8s.io/v1 Lease holder identity
    Lease,
    /// Pod label claim
    Label,
}

/// Controller configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Decision cache capacity per namespace, 0 = unbounded.
    pub max_cache_entries_per_namespace: usize,
    /// Global reconcile concurrency cap.
    pub max_concurrent_reconciles: usize,
    /// Deadline for the cache-update section of a cycle.
    pub cache_update_timeout: Duration,
    /// Deadline for the metrics-collection section of a cycle.
    pub metrics_collection_timeout: Duration,
    /// API budget refill rate.
    pub client_qps: u32,
    /// API budget burst size.
    pub client_burst: u32,
    /// Leadership source.
    pub leadership_source: LeadershipKind,
    /// Namespace scope; `None` watches all namespaces.
    pub watch_namespace: Option<String>,
    /// Bind address for the probe/metrics server.
    pub probe_addr: SocketAddr,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            max_cache_entries_per_namespace: 0,
            max_concurrent_reconciles: 5,
            cache_update_timeout: Duration::from_secs(5),
            metrics_collection_timeout: Duration::from_secs(5),
            client_qps: 20,
            client_burst: 30,
            leadership_source: LeadershipKind::Lease,
            watch_namespace: None,
            probe_addr: SocketAddr::from(([0, 0, 0, 0], 8080)),
        }
    }
}

fn parse<T: std::str::FromStr>(name: &str, value: &str) -> Result<T, Error> {
    value
        .parse()
        .map_err(|_| Error::InvalidConfig(format!("{name}: cannot parse {value:?}")))
}

impl Config {
    /// Reads configuration from process environment variables.
    pub fn from_env() -> Result<Self, Error> {
        Self::from_vars(|name| std::env::var(name).ok())
    }

    /// Reads configuration through an injected variable lookup.
    pub fn from_vars(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, Error> {
        let mut config = Self::default();

        if let Some(v) = lookup("MAX_CACHE_ENTRIES_PER_NAMESPACE") {
            config.max_cache_entries_per_namespace = parse("MAX_CACHE_ENTRIES_PER_NAMESPACE", &v)?;
        }
        if let Some(v) = lookup("MAX_CONCURRENT_RECONCILES") {
            config.max_concurrent_reconciles = parse("MAX_CONCURRENT_RECONCILES", &v)?;
            if config.max_concurrent_reconciles == 0 {
                return Err(Error::InvalidConfig(
                    "MAX_CONCURRENT_RECONCILES: must be at least 1".to_string(),
                ));
            }
        }
        if let Some(v) = lookup("CACHE_UPDATE_TIMEOUT_SECONDS") {
            config.cache_update_timeout =
                Duration::from_secs(parse("CACHE_UPDATE_TIMEOUT_SECONDS", &v)?);
        }
        if let Some(v) = lookup("METRICS_COLLECTION_TIMEOUT_SECONDS") {
            config.metrics_collection_timeout =
                Duration::from_secs(parse("METRICS_COLLECTION_TIMEOUT_SECONDS", &v)?);
        }
        if let Some(v) = lookup("CLIENT_QPS") {
            config.client_qps = parse("CLIENT_QPS", &v)?;
            if config.client_qps == 0 {
                return Err(Error::InvalidConfig("CLIENT_QPS: must be at least 1".to_string()));
            }
        }
        if let Some(v) = lookup("CLIENT_BURST") {
            config.client_burst = parse("CLIENT_BURST", &v)?;
            if config.client_burst == 0 {
                return Err(Error::InvalidConfig("CLIENT_BURST: must be at least 1".to_string()));
            }
        }
        if let Some(v) = lookup("LEADERSHIP_SOURCE") {
            config.leadership_source = match v.as_str() {
                "lease" => LeadershipKind::Lease,
                "label" => LeadershipKind::Label,
                other => {
                    return Err(Error::InvalidConfig(format!(
                        "LEADERSHIP_SOURCE: expected \"lease\" or \"label\", got {other:?}"
                    )));
                }
            };
        }
        if let Some(v) = lookup("WATCH_NAMESPACE") {
            if !v.is_empty() {
                config.watch_namespace = Some(v);
            }
        }
        if let Some(v) = lookup("PROBE_ADDR") {
            config.probe_addr = parse("PROBE_ADDR", &v)?;
        }

        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn vars(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect();
        move |name| map.get(name).cloned()
    }

    #[test]
    fn defaults_apply_when_unset() {
        let config = Config::from_vars(|_| None).unwrap();
        assert_eq!(config.max_cache_entries_per_namespace, 0);
        assert_eq!(config.max_concurrent_reconciles, 5);
        assert_eq!(config.cache_update_timeout, Duration::from_secs(5));
        assert_eq!(config.client_qps, 20);
        assert_eq!(config.client_burst, 30);
        assert_eq!(config.leadership_source, LeadershipKind::Lease);
        assert!(config.watch_namespace.is_none());
        assert_eq!(config.probe_addr.port(), 8080);
    }

    #[test]
    fn overrides_are_parsed() {
        let config = Config::from_vars(vars(&[
            ("MAX_CACHE_ENTRIES_PER_NAMESPACE", "128"),
            ("MAX_CONCURRENT_RECONCILES", "10"),
            ("LEADERSHIP_SOURCE", "label"),
            ("WATCH_NAMESPACE", "prod"),
            ("PROBE_ADDR", "127.0.0.1:9090"),
        ]))
        .unwrap();
        assert_eq!(config.max_cache_entries_per_namespace, 128);
        assert_eq!(config.max_concurrent_reconciles, 10);
        assert_eq!(config.leadership_source, LeadershipKind::Label);
        assert_eq!(config.watch_namespace.as_deref(), Some("prod"));
        assert_eq!(config.probe_addr.port(), 9090);
    }

    #[test]
    fn invalid_values_are_rejected() {
        assert!(Config::from_vars(vars(&[("CLIENT_QPS", "zero")])).is_err());
        assert!(Config::from_vars(vars(&[("CLIENT_QPS", "0")])).is_err());
        assert!(Config::from_vars(vars(&[("MAX_CONCURRENT_RECONCILES", "0")])).is_err());
        assert!(Config::from_vars(vars(&[("LEADERSHIP_SOURCE", "dns")])).is_err());
        assert!(Config::from_vars(vars(&[("PROBE_ADDR", "not-an-addr")])).is_err());
    }
}

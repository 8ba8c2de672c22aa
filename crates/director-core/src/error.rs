//! Core error taxonomy.
//!
//! Errors fall into three classes: transient failures worth retrying with
//! backoff, logical failures that are routed as "no endpoints" until the
//! underlying pod/lease state changes, and startup-only configuration
//! failures that abort the process.

use thiserror::Error;

/// Errors produced by the leader-routing engine.
#[derive(Debug, Error)]
pub enum Error {
    /// Kubernetes API error
    #[error("Kubernetes error: {0}")]
    Kube(#[from] kube::Error),

    /// JSON serialization/deserialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Declared target port could not be resolved against the leader pod
    #[error("Port resolution failed: {0}")]
    PortResolutionFailed(String),

    /// More than one candidate claims leadership and none is the previous leader
    #[error("Ambiguous leadership claim: {0}")]
    AmbiguousClaim(String),

    /// Leadership holder identity could not be parsed
    #[error("Malformed leadership identity: {0}")]
    MalformedIdentity(String),

    /// A per-cycle deadline elapsed
    #[error("Operation timed out: {0}")]
    Timeout(String),

    /// Retry budget exhausted for an API write
    #[error("Endpoint write abandoned after {attempts} attempts: {source}")]
    WriteExhausted {
        /// Attempts made before giving up
        attempts: u32,
        /// The final attempt's error
        #[source]
        source: Box<Error>,
    },

    /// Watched object is missing required fields
    #[error("Invalid object: {0}")]
    InvalidObject(String),

    /// Invalid configuration (startup only)
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}

impl Error {
    /// Transient failures worth retrying with bounded backoff.
    ///
    /// API conflicts, rate limiting, request timeouts, and server-side errors
    /// are retryable; non-Api kube errors are treated as transport-level
    /// (connection resets, TLS hiccups) and retried as well.
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::Kube(kube::Error::Api(ae)) => {
                matches!(ae.code, 408 | 409 | 429) || ae.code >= 500
            }
            Error::Kube(_) => true,
            Error::Timeout(_) => true,
            _ => false,
        }
    }

    /// Logical failures: never retried at the write layer, surfaced as a
    /// "no endpoints" decision plus metrics/status instead.
    pub fn is_logical(&self) -> bool {
        matches!(
            self,
            Error::PortResolutionFailed(_) | Error::AmbiguousClaim(_) | Error::MalformedIdentity(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kube::core::ErrorResponse;

    fn api_error(code: u16) -> Error {
        Error::Kube(kube::Error::Api(ErrorResponse {
            status: "Failure".to_string(),
            message: "test".to_string(),
            reason: "test".to_string(),
            code,
        }))
    }

    #[test]
    fn conflicts_and_rate_limits_are_retryable() {
        assert!(api_error(409).is_retryable());
        assert!(api_error(429).is_retryable());
        assert!(api_error(500).is_retryable());
        assert!(api_error(503).is_retryable());
        assert!(Error::Timeout("cache update".to_string()).is_retryable());
    }

    #[test]
    fn validation_errors_are_not_retryable() {
        assert!(!api_error(400).is_retryable());
        assert!(!api_error(404).is_retryable());
        assert!(!api_error(422).is_retryable());
    }

    #[test]
    fn logical_errors_are_neither_retryable_nor_transient() {
        let err = Error::PortResolutionFailed("no port named http".to_string());
        assert!(err.is_logical());
        assert!(!err.is_retryable());

        let err = Error::AmbiguousClaim("two claimants".to_string());
        assert!(err.is_logical());
        assert!(!err.is_retryable());
    }
}

//! Controller-specific error types.
//!
//! Wraps the core engine errors and adds the failure modes that only
//! exist at the binary layer (watch streams, probe server, startup).

use thiserror::Error;

/// Errors that can occur in the director controller.
#[derive(Debug, Error)]
pub enum ControllerError {
    /// Core engine error
    #[error("Engine error: {0}")]
    Core(#[from] director_core::Error),

    /// Kubernetes API error
    #[error("Kubernetes error: {0}")]
    Kube(#[from] kube::Error),

    /// Metrics registry error
    #[error("Metrics error: {0}")]
    Metrics(#[from] prometheus::Error),

    /// Resource watch failed
    #[error("Resource watch failed: {0}")]
    Watch(String),

    /// Probe server I/O error
    #[error("Probe server error: {0}")]
    Io(#[from] std::io::Error),
}

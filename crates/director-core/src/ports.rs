//! Target-port resolution against the leader pod's containers.

use k8s_openapi::api::core::v1::Pod;

use crate::decision::TargetPort;
use crate::error::Error;

/// Resolves a declared target port to a concrete numeric port.
///
/// Named ports are scanned across the pod's containers; numeric ports pass
/// through after bounds validation. Failure is the logical
/// [`Error::PortResolutionFailed`], which the caller routes as a
/// "no endpoints" decision for this cycle.
pub fn resolve_target_port(target: &TargetPort, pod: &Pod) -> Result<i32, Error> {
    match target {
        TargetPort::Number(n) => {
            if (1..=65535).contains(n) {
                Ok(*n)
            } else {
                Err(Error::PortResolutionFailed(format!(
                    "declared port {n} out of range 1-65535"
                )))
            }
        }
        TargetPort::Name(name) => {
            let pod_name = pod.metadata.name.as_deref().unwrap_or("<unnamed>");
            pod.spec
                .as_ref()
                .map(|spec| spec.containers.as_slice())
                .unwrap_or_default()
                .iter()
                .flat_map(|c| c.ports.as_deref().unwrap_or_default())
                .find(|p| p.name.as_deref() == Some(name.as_str()))
                .map(|p| p.container_port)
                .ok_or_else(|| {
                    Error::PortResolutionFailed(format!(
                        "pod {pod_name} exposes no container port named {name:?}"
                    ))
                })
        }
    }
}

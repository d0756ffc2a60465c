use std::sync::Arc;

use k8s_openapi::api::core::v1::{ObjectReference, Service};
use k8s_openapi::api::networking::v1::Ingress;
use log::warn;

use crate::dns;
use crate::kubernetes::{EventRecorder, EventType, Lister, ServiceClient};

/// Event reason for add handling.
pub const ADD: &str = "ADD";
/// Event reason for delete handling.
pub const DELETE: &str = "DELETE";

/// Cluster handles the reconciler reads from and writes to.
pub struct Cluster {
    pub services: Arc<dyn Lister<Service>>,
    pub ingresses: Arc<dyn Lister<Ingress>>,
    pub service_client: Arc<dyn ServiceClient>,
    pub recorder: Arc<dyn EventRecorder>,
}

/// Computes the DNS state cluster objects call for and applies it.
///
/// Holds no state of its own between calls. Every handler re-reads the
/// object from the lister, so replaying an item converges on the same result.
/// The handlers live next to the objects they handle, in `service` and
/// `ingress`.
pub struct Reconciler {
    pub(crate) dns: Arc<dyn dns::Interface>,
    pub(crate) cluster: Cluster,
    pub(crate) resource_group: String,
    pub(crate) domain_suffix: String,
}

impl Reconciler {
    pub fn new(
        dns: Arc<dyn dns::Interface>,
        cluster: Cluster,
        resource_group: impl Into<String>,
        domain_suffix: impl Into<String>,
    ) -> Self {
        Reconciler {
            dns,
            cluster,
            resource_group: resource_group.into(),
            domain_suffix: domain_suffix.into(),
        }
    }

    /// The zone record sets are written to.
    pub fn domain_suffix(&self) -> &str {
        &self.domain_suffix
    }

    pub fn resource_group(&self) -> &str {
        &self.resource_group
    }

    /// Records an event, logging rather than failing when that is not
    /// possible.
    pub(crate) async fn event(
        &self,
        object: ObjectReference,
        type_: EventType,
        reason: &str,
        message: String,
    ) {
        let target = format!(
            "{}/{}",
            object.namespace.as_deref().unwrap_or_default(),
            object.name.as_deref().unwrap_or_default()
        );
        if let Err(error) = self.cluster.recorder.record(object, type_, reason, message).await {
            warn!("recording {reason} event on {target} failed: {error}");
        }
    }
}

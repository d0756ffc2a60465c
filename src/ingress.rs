//! Ingress handling. Ingresses are tracked and acknowledged with an event;
//! their rules do not map to record sets yet.

use k8s_openapi::api::core::v1::ObjectReference;
use k8s_openapi::api::networking::v1::Ingress;
use kube::Resource;
use log::{debug, warn};

use crate::error::Result;
use crate::kubernetes::{EventType, ResourceRef};
use crate::reconciler::{Reconciler, ADD, DELETE};

fn ingress_reference(ingress: &ResourceRef<Ingress>) -> ObjectReference {
    ObjectReference {
        api_version: Some("networking.k8s.io/v1".to_owned()),
        kind: Some("Ingress".to_owned()),
        namespace: Some(ingress.namespace.clone()),
        name: Some(ingress.name.clone()),
        ..Default::default()
    }
}

impl Reconciler {
    pub async fn add_ingress(&self, ingress: &ResourceRef<Ingress>) -> Result<()> {
        debug!("[ingress] add: from workqueue -> {ingress}");

        let Some(current) = self.cluster.ingresses.get(&ingress.namespace, &ingress.name) else {
            warn!(
                "[ingress] add: {} in namespace {} from workqueue no longer exists",
                ingress.name, ingress.namespace
            );
            return Ok(());
        };

        debug!(
            "[ingress] add: from lister -> {ingress} with {} rules",
            current
                .spec
                .as_ref()
                .and_then(|spec| spec.rules.as_ref())
                .map_or(0, Vec::len)
        );
        self.event(current.object_ref(&()), EventType::Normal, ADD, "complete".to_owned())
            .await;
        Ok(())
    }

    pub async fn delete_ingress(&self, ingress: &ResourceRef<Ingress>) -> Result<()> {
        debug!("[ingress] delete: from workqueue -> {ingress}");

        let object = match self
            .cluster
            .ingresses
            .get(&ingress.namespace, &ingress.name)
            .or_else(|| ingress.snapshot.clone())
        {
            Some(current) => current.object_ref(&()),
            None => {
                warn!(
                    "[ingress] delete: {} in namespace {} is not cached, acknowledging regardless",
                    ingress.name, ingress.namespace
                );
                ingress_reference(ingress)
            }
        };

        self.event(object, EventType::Normal, DELETE, "complete".to_owned())
            .await;
        Ok(())
    }
}

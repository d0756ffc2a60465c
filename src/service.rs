//! Service handling: one A record set per LoadBalancer Service.

use std::sync::Arc;

use k8s_openapi::api::core::v1::{ObjectReference, Service};
use kube::{Resource, ResourceExt};
use log::{debug, info, warn};
use rand::{distributions::Alphanumeric, Rng};

use crate::dns::{RecordSet, RecordType};
use crate::error::Result;
use crate::kubernetes::{EventType, ResourceRef};
use crate::reconciler::{Reconciler, ADD, DELETE};

/// Annotation holding the name a Service's record set is published under.
pub const SERVICE_NAME_ANNOTATION: &str = "http-application-routing.io/servicenamelabel";

pub fn is_load_balancer(service: &Service) -> bool {
    service
        .spec
        .as_ref()
        .and_then(|spec| spec.type_.as_deref())
        == Some("LoadBalancer")
}

/// The address the record set points at: the requested load balancer IP, or
/// the first IP the load balancer was provisioned with.
pub fn load_balancer_ip(service: &Service) -> Option<&str> {
    let requested = service
        .spec
        .as_ref()
        .and_then(|spec| spec.load_balancer_ip.as_deref())
        .filter(|ip| !ip.is_empty());

    requested.or_else(|| {
        service
            .status
            .as_ref()?
            .load_balancer
            .as_ref()?
            .ingress
            .as_ref()?
            .iter()
            .find_map(|ingress| ingress.ip.as_deref().filter(|ip| !ip.is_empty()))
    })
}

/// The published name: the annotation when set, else the object's own name.
pub fn service_name(service: &Service) -> Option<String> {
    service
        .annotations()
        .get(SERVICE_NAME_ANNOTATION)
        .filter(|name| !name.is_empty())
        .or(service.metadata.name.as_ref().filter(|name| !name.is_empty()))
        .cloned()
}

fn generate_name() -> String {
    let suffix: String = rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(10)
        .map(|byte| char::from(byte).to_ascii_lowercase())
        .collect();
    format!("svc-{suffix}")
}

pub fn record_set_name(service_name: &str, domain_suffix: &str) -> String {
    format!("{service_name}.{domain_suffix}")
}

fn service_reference(service: &ResourceRef<Service>) -> ObjectReference {
    ObjectReference {
        api_version: Some("v1".to_owned()),
        kind: Some("Service".to_owned()),
        namespace: Some(service.namespace.clone()),
        name: Some(service.name.clone()),
        ..Default::default()
    }
}

impl Reconciler {
    /// Publishes a record set for the Service's load balancer IP.
    pub async fn add_service(&self, service: &ResourceRef<Service>) -> Result<()> {
        debug!("[service] add: from workqueue -> {service}");

        let Some(current) = self.cluster.services.get(&service.namespace, &service.name) else {
            warn!(
                "[service] add: {} in namespace {} from workqueue no longer exists",
                service.name, service.namespace
            );
            return Ok(());
        };

        if !is_load_balancer(&current) {
            debug!("[service] add: {service} is not a LoadBalancer, ignoring");
            return Ok(());
        }
        let Some(ip) = load_balancer_ip(&current).map(str::to_owned) else {
            debug!("[service] add: {service} has no load balancer IP yet, ignoring");
            return Ok(());
        };

        let name = service_name(&current).unwrap_or_else(generate_name);
        let current = match self.annotate(current, &name).await {
            Ok(current) => current,
            Err(error) if error.is_not_found() => {
                warn!("[service] add: {service} was deleted while annotating it");
                return Ok(());
            }
            Err(error) => {
                warn!("[service] add: updating annotation on {service} failed: {error}");
                self.event(
                    service_reference(service),
                    EventType::Warning,
                    ADD,
                    format!("updating annotation failed: {error}"),
                )
                .await;
                return Err(error);
            }
        };

        let record_set_name = record_set_name(&name, &self.domain_suffix);
        let record_set = RecordSet::a(&record_set_name, &ip);
        let object = current.object_ref(&());

        if let Err(error) = self
            .dns
            .create_or_update_record_set(
                &self.resource_group,
                &self.domain_suffix,
                RecordType::A,
                &record_set_name,
                &record_set,
            )
            .await
        {
            let message = format!(
                "adding dns record set {record_set_name} to ip {ip} in zone {} failed: {error}",
                self.domain_suffix
            );
            warn!("[service] add: {message}");
            self.event(object, EventType::Warning, ADD, message).await;
            return Err(error.into());
        }

        let message = format!(
            "successfully created dns record set {record_set_name} to ip {ip} in zone {}",
            self.domain_suffix
        );
        info!("[service] add: {message}");
        self.event(object, EventType::Normal, ADD, message).await;
        Ok(())
    }

    /// Removes the Service's record set.
    ///
    /// When the Service is gone from the lister the last state the watcher
    /// saw is used instead, and failing that the Service's own name.
    pub async fn delete_service(&self, service: &ResourceRef<Service>) -> Result<()> {
        debug!("[service] delete: from workqueue -> {service}");

        let current = self
            .cluster
            .services
            .get(&service.namespace, &service.name)
            .or_else(|| {
                warn!(
                    "[service] delete: {} in namespace {} is not cached, trying to garbage collect regardless",
                    service.name, service.namespace
                );
                service.snapshot.clone()
            });

        let (name, object) = match &current {
            Some(current) if !is_load_balancer(current) => {
                debug!("[service] delete: {service} is not a LoadBalancer, ignoring");
                return Ok(());
            }
            Some(current) => (service_name(current), current.object_ref(&())),
            None => (
                Some(service.name.clone()).filter(|name| !name.is_empty()),
                service_reference(service),
            ),
        };
        let Some(name) = name else {
            warn!("[service] delete: {service} has no name to derive a record set from");
            return Ok(());
        };

        self.delete_record_set(&name, object).await
    }

    async fn delete_record_set(&self, name: &str, object: ObjectReference) -> Result<()> {
        let record_set_name = record_set_name(name, &self.domain_suffix);

        if let Err(error) = self
            .dns
            .delete_record_set(
                &self.resource_group,
                &self.domain_suffix,
                RecordType::A,
                &record_set_name,
            )
            .await
        {
            let message = format!(
                "deleting dns record set {record_set_name} from zone {} failed: {error}",
                self.domain_suffix
            );
            warn!("[service] delete: {message}");
            self.event(object, EventType::Warning, DELETE, message).await;
            return Err(error.into());
        }

        let message = format!(
            "successfully deleted dns record set {record_set_name} from zone {}",
            self.domain_suffix
        );
        info!("[service] delete: {message}");
        self.event(object, EventType::Normal, DELETE, message).await;
        Ok(())
    }

    /// Makes sure the Service carries `name` in its naming annotation,
    /// returning the object as stored afterwards.
    async fn annotate(&self, service: Arc<Service>, name: &str) -> Result<Arc<Service>> {
        if service.annotations().get(SERVICE_NAME_ANNOTATION).map(String::as_str) == Some(name) {
            return Ok(service);
        }

        debug!(
            "[service] add: updating annotations for {} with {SERVICE_NAME_ANNOTATION}={name}",
            service.name_any()
        );
        let mut updated = Service::clone(&service);
        updated
            .annotations_mut()
            .insert(SERVICE_NAME_ANNOTATION.to_owned(), name.to_owned());

        let stored = self.cluster.service_client.replace_service(&updated).await?;
        Ok(Arc::new(stored))
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use k8s_openapi::api::core::v1::{LoadBalancerIngress, LoadBalancerStatus, ServiceSpec, ServiceStatus};
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
    use reqwest::StatusCode;

    use super::*;
    use crate::dns::{self, Interface, MemoryClient};
    use crate::error::Error;
    use crate::kubernetes::fake::{FakeCluster, FakeRecorder};
    use crate::kubernetes::Lister;
    use crate::reconciler::Cluster;

    const RESOURCE_GROUP: &str = "rg";
    const SUFFIX: &str = "cluster.example.com";

    struct Harness {
        reconciler: Reconciler,
        cluster: Arc<FakeCluster>,
        recorder: Arc<FakeRecorder>,
        dns: Arc<MemoryClient>,
    }

    fn harness() -> Harness {
        let cluster = Arc::new(FakeCluster::default());
        let recorder = Arc::new(FakeRecorder::default());
        let dns = Arc::new(MemoryClient::new().with_zone(RESOURCE_GROUP, SUFFIX));

        let reconciler = Reconciler::new(
            dns.clone(),
            Cluster {
                services: cluster.clone(),
                ingresses: cluster.clone(),
                service_client: cluster.clone(),
                recorder: recorder.clone(),
            },
            RESOURCE_GROUP,
            SUFFIX,
        );

        Harness {
            reconciler,
            cluster,
            recorder,
            dns,
        }
    }

    fn service(name: &str, type_: &str, ip: &str) -> Service {
        Service {
            metadata: ObjectMeta {
                namespace: Some("default".to_owned()),
                name: Some(name.to_owned()),
                ..Default::default()
            },
            spec: Some(ServiceSpec {
                type_: Some(type_.to_owned()),
                load_balancer_ip: Some(ip.to_owned()),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    fn reference(name: &str) -> ResourceRef<Service> {
        ResourceRef::new("default", name)
    }

    impl Harness {
        async fn record_ips(&self, name: &str) -> Option<Vec<String>> {
            let lookup = self
                .dns
                .get_record_set(RESOURCE_GROUP, SUFFIX, RecordType::A, &record_set_name(name, SUFFIX))
                .await
                .unwrap();
            lookup
                .value
                .map(|record_set| record_set.ipv4_addresses().map(str::to_owned).collect())
        }

        async fn record_count(&self) -> usize {
            dns::list_all_record_sets(self.dns.as_ref(), RESOURCE_GROUP, SUFFIX, None)
                .await
                .unwrap()
                .len()
        }
    }

    #[tokio::test]
    async fn add_is_idempotent() {
        let h = harness();
        h.cluster.apply_service(service("svc-a", "LoadBalancer", "1.2.3.4"));

        h.reconciler.add_service(&reference("svc-a")).await.unwrap();
        h.reconciler.add_service(&reference("svc-a")).await.unwrap();

        assert_eq!(h.record_count().await, 1);
        assert_eq!(h.record_ips("svc-a").await, Some(vec!["1.2.3.4".to_owned()]));
        // The second pass finds the annotation already in place.
        assert_eq!(h.cluster.replaced().len(), 1);
    }

    #[tokio::test]
    async fn add_follows_ip_changes() {
        let h = harness();
        h.cluster.apply_service(service("svc-a", "LoadBalancer", "1.2.3.4"));
        h.reconciler.add_service(&reference("svc-a")).await.unwrap();

        h.cluster.apply_service(service("svc-a", "LoadBalancer", "1.3.3.7"));
        h.reconciler.add_service(&reference("svc-a")).await.unwrap();

        assert_eq!(h.record_ips("svc-a").await, Some(vec!["1.3.3.7".to_owned()]));
        assert_eq!(h.record_count().await, 1);
    }

    #[tokio::test]
    async fn add_ignores_cluster_ip_services() {
        let h = harness();
        h.cluster.apply_service(service("internal", "ClusterIP", "1.2.3.4"));

        for _ in 0..3 {
            h.reconciler.add_service(&reference("internal")).await.unwrap();
        }

        assert_eq!(h.record_count().await, 0);
        assert!(h.cluster.replaced().is_empty());
        assert!(h.recorder.events().is_empty());
    }

    #[tokio::test]
    async fn add_ignores_load_balancer_without_ip() {
        let h = harness();
        h.cluster.apply_service(service("pending", "LoadBalancer", ""));

        h.reconciler.add_service(&reference("pending")).await.unwrap();

        assert_eq!(h.record_count().await, 0);
    }

    #[tokio::test]
    async fn add_uses_provisioned_ip_when_none_requested() {
        let h = harness();
        let mut svc = service("svc-a", "LoadBalancer", "");
        svc.status = Some(ServiceStatus {
            load_balancer: Some(LoadBalancerStatus {
                ingress: Some(vec![LoadBalancerIngress {
                    ip: Some("20.1.2.3".to_owned()),
                    ..Default::default()
                }]),
            }),
            ..Default::default()
        });
        h.cluster.apply_service(svc);

        h.reconciler.add_service(&reference("svc-a")).await.unwrap();

        assert_eq!(h.record_ips("svc-a").await, Some(vec!["20.1.2.3".to_owned()]));
    }

    #[tokio::test]
    async fn add_of_missing_service_is_a_no_op() {
        let h = harness();
        h.reconciler.add_service(&reference("gone")).await.unwrap();
        assert_eq!(h.record_count().await, 0);
    }

    #[tokio::test]
    async fn add_publishes_under_annotated_name() {
        let h = harness();
        let mut svc = service("svc-a", "LoadBalancer", "1.2.3.4");
        svc.metadata.annotations = Some(BTreeMap::from([(
            SERVICE_NAME_ANNOTATION.to_owned(),
            "frontend".to_owned(),
        )]));
        h.cluster.apply_service(svc);

        h.reconciler.add_service(&reference("svc-a")).await.unwrap();

        assert_eq!(h.record_ips("frontend").await, Some(vec!["1.2.3.4".to_owned()]));
        assert!(h.cluster.replaced().is_empty());
    }

    #[tokio::test]
    async fn add_writes_naming_annotation() {
        let h = harness();
        h.cluster.apply_service(service("svc-a", "LoadBalancer", "1.2.3.4"));

        h.reconciler.add_service(&reference("svc-a")).await.unwrap();

        let replaced = h.cluster.replaced();
        assert_eq!(replaced.len(), 1);
        assert_eq!(
            replaced[0].annotations().get(SERVICE_NAME_ANNOTATION).map(String::as_str),
            Some("svc-a")
        );

        let events = h.recorder.events();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].type_, EventType::Normal);
        assert_eq!(events[0].reason, ADD);
        assert!(events[0].message.contains("svc-a.cluster.example.com"));
        assert!(events[0].message.contains("1.2.3.4"));
    }

    #[test]
    fn naming_is_deterministic() {
        let svc = service("svc-a", "LoadBalancer", "1.2.3.4");
        assert_eq!(service_name(&svc), service_name(&svc.clone()));
        assert_eq!(
            record_set_name(&service_name(&svc).unwrap(), SUFFIX),
            "svc-a.cluster.example.com"
        );

        let mut unnamed = svc.clone();
        unnamed.metadata.name = None;
        assert_eq!(service_name(&unnamed), None);

        let generated = generate_name();
        assert!(generated.starts_with("svc-"));
        assert!(generated.chars().all(|c| c == '-' || c.is_ascii_lowercase() || c.is_ascii_digit()));
    }

    #[tokio::test]
    async fn annotation_conflict_is_retryable_and_reported() {
        let h = harness();
        h.cluster.apply_service(service("svc-a", "LoadBalancer", "1.2.3.4"));
        h.cluster.fail_next_replace(Error::Conflict {
            kind: "Service",
            namespace: "default".to_owned(),
            name: "svc-a".to_owned(),
            message: "the object has been modified".to_owned(),
        });

        let error = h.reconciler.add_service(&reference("svc-a")).await.unwrap_err();
        assert!(error.is_transient());
        assert_eq!(h.record_count().await, 0);

        let events = h.recorder.events();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].type_, EventType::Warning);
    }

    #[tokio::test]
    async fn annotation_not_found_is_a_no_op() {
        let h = harness();
        h.cluster.apply_service(service("svc-a", "LoadBalancer", "1.2.3.4"));
        h.cluster.fail_next_replace(Error::NotFound {
            kind: "Service",
            namespace: "default".to_owned(),
            name: "svc-a".to_owned(),
        });

        h.reconciler.add_service(&reference("svc-a")).await.unwrap();
        assert_eq!(h.record_count().await, 0);
    }

    #[tokio::test]
    async fn dns_failure_is_returned_with_warning_event() {
        let h = harness();
        h.cluster.apply_service(service("svc-a", "LoadBalancer", "1.2.3.4"));
        h.dns.fail_next(dns::Error::Api {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            code: "InternalServerError".to_owned(),
            message: "boom".to_owned(),
            target: None,
        });

        let error = h.reconciler.add_service(&reference("svc-a")).await.unwrap_err();
        assert!(error.is_transient());

        let events = h.recorder.events();
        assert_eq!(events.last().unwrap().type_, EventType::Warning);
        assert!(events.last().unwrap().message.contains("boom"));
    }

    #[tokio::test]
    async fn delete_tolerates_absent_record() {
        let h = harness();
        h.cluster.apply_service(service("svc-a", "LoadBalancer", "1.2.3.4"));

        h.reconciler.delete_service(&reference("svc-a")).await.unwrap();
        h.reconciler.delete_service(&reference("svc-a")).await.unwrap();
    }

    #[tokio::test]
    async fn delete_uses_snapshot_of_removed_service() {
        let h = harness();
        let mut svc = service("svc-a", "LoadBalancer", "1.2.3.4");
        svc.metadata.annotations = Some(BTreeMap::from([(
            SERVICE_NAME_ANNOTATION.to_owned(),
            "frontend".to_owned(),
        )]));
        h.cluster.apply_service(svc);
        h.reconciler.add_service(&reference("svc-a")).await.unwrap();
        assert!(h.record_ips("frontend").await.is_some());

        let removed = h.cluster.remove_service("default", "svc-a").unwrap();
        h.reconciler
            .delete_service(&ResourceRef::from_object(removed))
            .await
            .unwrap();

        assert_eq!(h.record_ips("frontend").await, None);
    }

    #[tokio::test]
    async fn delete_without_any_state_falls_back_to_name() {
        let h = harness();
        h.cluster.apply_service(service("svc-a", "LoadBalancer", "1.2.3.4"));
        h.reconciler.add_service(&reference("svc-a")).await.unwrap();
        h.cluster.remove_service("default", "svc-a");

        h.reconciler.delete_service(&reference("svc-a")).await.unwrap();

        assert_eq!(h.record_count().await, 0);
    }

    #[tokio::test]
    async fn delete_skips_non_load_balancers() {
        let h = harness();
        h.dns
            .create_or_update_record_set(
                RESOURCE_GROUP,
                SUFFIX,
                RecordType::A,
                "internal.cluster.example.com",
                &RecordSet::a("internal.cluster.example.com", "10.0.0.1"),
            )
            .await
            .unwrap();
        h.cluster.apply_service(service("internal", "ClusterIP", ""));

        h.reconciler.delete_service(&reference("internal")).await.unwrap();

        assert_eq!(h.record_count().await, 1);
    }

    #[tokio::test]
    async fn cluster_ip_service_never_touches_dns() {
        let h = harness();
        let mut web = service("web", "LoadBalancer", "1.2.3.4");
        web.metadata.annotations = Some(BTreeMap::from([(
            SERVICE_NAME_ANNOTATION.to_owned(),
            "frontend".to_owned(),
        )]));
        h.cluster.apply_service(web);
        h.reconciler.add_service(&reference("web")).await.unwrap();

        let mut other = service("other", "ClusterIP", "");
        other.metadata.annotations = Some(BTreeMap::from([(
            SERVICE_NAME_ANNOTATION.to_owned(),
            "frontend".to_owned(),
        )]));
        h.cluster.apply_service(other);
        h.dns.fail_next(dns::Error::Api {
            status: StatusCode::SERVICE_UNAVAILABLE,
            code: "ServiceUnavailable".to_owned(),
            message: "try again".to_owned(),
            target: None,
        });
        h.reconciler.add_service(&reference("other")).await.unwrap();

        // The queued failure is still pending, so no DNS call was made.
        assert!(h.dns.get_zone(RESOURCE_GROUP, SUFFIX).await.is_err());
        assert_eq!(h.record_ips("frontend").await, Some(vec!["1.2.3.4".to_owned()]));
    }

    #[tokio::test]
    async fn service_leaving_load_balancer_type_keeps_its_record() {
        let h = harness();
        h.cluster.apply_service(service("svc-a", "LoadBalancer", "1.2.3.4"));
        h.reconciler.add_service(&reference("svc-a")).await.unwrap();

        let mut demoted = Service::clone(&Lister::<Service>::get(h.cluster.as_ref(), "default", "svc-a").unwrap());
        demoted.spec.as_mut().unwrap().type_ = Some("ClusterIP".to_owned());
        h.cluster.apply_service(demoted);
        h.reconciler.add_service(&reference("svc-a")).await.unwrap();

        assert_eq!(h.record_count().await, 1);
    }

    #[tokio::test]
    async fn delete_into_missing_zone_is_an_error() {
        let h = harness();
        let reconciler = Reconciler::new(
            h.dns.clone(),
            Cluster {
                services: h.cluster.clone(),
                ingresses: h.cluster.clone(),
                service_client: h.cluster.clone(),
                recorder: h.recorder.clone(),
            },
            RESOURCE_GROUP,
            "missing.example.com",
        );

        let error = reconciler.delete_service(&reference("svc-a")).await.unwrap_err();
        assert!(matches!(error, Error::Dns(dns::Error::ZoneNotFound { .. })));
        assert!(!error.is_transient());
    }
}

//! Cluster-facing seams: cached reads, Service writes, Event recording and
//! the watch streams that feed the controller.

use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use futures::{Stream, StreamExt};
use k8s_openapi::api::core::v1::{Event, EventSource, ObjectReference, Service};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ObjectMeta, Time};
use kube::{
    api::PostParams,
    runtime::{
        reflector::{self, ObjectRef, Store},
        watcher, WatchStreamExt,
    },
    Api, Client, Resource, ResourceExt,
};
use log::{debug, warn};
use serde::de::DeserializeOwned;

use crate::error::{Error, Result};

/// Read access to the latest known state of a kind of object.
pub trait Lister<K>: Send + Sync {
    fn get(&self, namespace: &str, name: &str) -> Option<Arc<K>>;
}

impl<K> Lister<K> for Store<K>
where
    K: Resource<DynamicType = ()> + Clone + Send + Sync + 'static,
{
    fn get(&self, namespace: &str, name: &str) -> Option<Arc<K>> {
        Store::get(self, &ObjectRef::new(name).within(namespace))
    }
}

/// Writes to Service objects.
#[async_trait]
pub trait ServiceClient: Send + Sync {
    /// Replaces the Service, returning the object the API server stored.
    ///
    /// A missing Service is [`Error::NotFound`] and a stale resource
    /// version is [`Error::Conflict`].
    async fn replace_service(&self, service: &Service) -> Result<Service>;
}

pub struct KubeServiceClient {
    client: Client,
}

impl KubeServiceClient {
    pub fn new(client: Client) -> Self {
        KubeServiceClient { client }
    }
}

#[async_trait]
impl ServiceClient for KubeServiceClient {
    async fn replace_service(&self, service: &Service) -> Result<Service> {
        let namespace = service.namespace().unwrap_or_default();
        let name = service.name_any();
        let api: Api<Service> = Api::namespaced(self.client.clone(), &namespace);

        api.replace(&name, &PostParams::default(), service)
            .await
            .map_err(|error| match error {
                kube::Error::Api(response) if response.code == 404 => Error::NotFound {
                    kind: "Service",
                    namespace,
                    name,
                },
                kube::Error::Api(response) if response.code == 409 => Error::Conflict {
                    kind: "Service",
                    namespace,
                    name,
                    message: response.message,
                },
                error => Error::Kube(error),
            })
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EventType {
    Normal,
    Warning,
}

impl EventType {
    pub fn as_str(self) -> &'static str {
        match self {
            EventType::Normal => "Normal",
            EventType::Warning => "Warning",
        }
    }
}

/// Publishes operator-visible events about cluster objects.
#[async_trait]
pub trait EventRecorder: Send + Sync {
    async fn record(
        &self,
        object: ObjectReference,
        type_: EventType,
        reason: &str,
        message: String,
    ) -> Result<()>;
}

/// Records events as core/v1 `Event` objects in the involved object's
/// namespace.
pub struct KubeEventRecorder {
    client: Client,
    component: String,
}

impl KubeEventRecorder {
    pub fn new(client: Client, component: impl Into<String>) -> Self {
        KubeEventRecorder {
            client,
            component: component.into(),
        }
    }
}

#[async_trait]
impl EventRecorder for KubeEventRecorder {
    async fn record(
        &self,
        object: ObjectReference,
        type_: EventType,
        reason: &str,
        message: String,
    ) -> Result<()> {
        let namespace = object.namespace.clone().unwrap_or_else(|| "default".to_owned());
        let now = Time(Utc::now());

        let event = Event {
            metadata: ObjectMeta {
                generate_name: Some(format!(
                    "{}.",
                    object.name.as_deref().unwrap_or(&self.component)
                )),
                namespace: Some(namespace.clone()),
                ..Default::default()
            },
            involved_object: object,
            reason: Some(reason.to_owned()),
            message: Some(message),
            type_: Some(type_.as_str().to_owned()),
            source: Some(EventSource {
                component: Some(self.component.clone()),
                host: None,
            }),
            reporting_component: Some(self.component.clone()),
            first_timestamp: Some(now.clone()),
            last_timestamp: Some(now),
            count: Some(1),
            ..Default::default()
        };

        let events: Api<Event> = Api::namespaced(self.client.clone(), &namespace);
        events.create(&PostParams::default(), &event).await?;
        Ok(())
    }
}

/// Identity of a queued object, plus the last state the watcher saw of it.
///
/// Equality and hashing only consider namespace and name; the snapshot is a
/// fallback for when the object has already left the cache.
pub struct ResourceRef<K> {
    pub namespace: String,
    pub name: String,
    pub snapshot: Option<Arc<K>>,
}

impl<K> ResourceRef<K> {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        ResourceRef {
            namespace: namespace.into(),
            name: name.into(),
            snapshot: None,
        }
    }
}

impl<K: Resource> ResourceRef<K> {
    pub fn from_object(object: Arc<K>) -> Self {
        ResourceRef {
            namespace: object.meta().namespace.clone().unwrap_or_default(),
            name: object.meta().name.clone().unwrap_or_default(),
            snapshot: Some(object),
        }
    }
}

impl<K> Clone for ResourceRef<K> {
    fn clone(&self) -> Self {
        ResourceRef {
            namespace: self.namespace.clone(),
            name: self.name.clone(),
            snapshot: self.snapshot.clone(),
        }
    }
}

impl<K> PartialEq for ResourceRef<K> {
    fn eq(&self, other: &Self) -> bool {
        self.namespace == other.namespace && self.name == other.name
    }
}

impl<K> Eq for ResourceRef<K> {}

impl<K> Hash for ResourceRef<K> {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.namespace.hash(state);
        self.name.hash(state);
    }
}

impl<K> fmt::Debug for ResourceRef<K> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

impl<K> fmt::Display for ResourceRef<K> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

/// A flattened watch notification.
#[derive(Debug)]
pub enum Change<K> {
    Applied(Arc<K>),
    Deleted(Arc<K>),
}

/// Scopes an API to one namespace, or to all of them when none is given.
pub fn api<K>(client: &Client, namespace: Option<&str>) -> Api<K>
where
    K: Resource<DynamicType = (), Scope = k8s_openapi::NamespaceResourceScope>,
{
    match namespace {
        Some(namespace) => Api::namespaced(client.clone(), namespace),
        None => Api::all(client.clone()),
    }
}

/// Starts a cached watch. The store is filled as the returned stream is
/// polled.
pub fn reflect<K>(api: Api<K>) -> (Store<K>, impl Stream<Item = watcher::Result<watcher::Event<K>>>)
where
    K: Resource<DynamicType = ()> + Clone + DeserializeOwned + fmt::Debug + Send + Sync + 'static,
{
    let (reader, writer) = reflector::store();
    let stream = reflector::reflector(writer, watcher(api, watcher::Config::default()).default_backoff());
    (reader, stream)
}

/// Drives a watch stream to completion, handing every change to `on_change`.
///
/// A relist reports each listed object as applied. Watch errors are logged;
/// the stream backs off and resumes on its own.
pub async fn forward<K, S>(stream: S, mut on_change: impl FnMut(Change<K>))
where
    K: Resource<DynamicType = ()>,
    S: Stream<Item = watcher::Result<watcher::Event<K>>>,
{
    let kind = K::kind(&());
    futures::pin_mut!(stream);

    while let Some(event) = stream.next().await {
        match event {
            Ok(watcher::Event::Applied(object)) => on_change(Change::Applied(Arc::new(object))),
            Ok(watcher::Event::Deleted(object)) => on_change(Change::Deleted(Arc::new(object))),
            Ok(watcher::Event::Restarted(objects)) => {
                debug!("{kind} watch restarted with {} objects", objects.len());
                for object in objects {
                    on_change(Change::Applied(Arc::new(object)));
                }
            }
            Err(error) => warn!("{kind} watch failed: {error}"),
        }
    }

    warn!("{kind} watch stream ended");
}

/// Waits until the store has received its first full listing.
pub async fn wait_for_sync<K>(store: &Store<K>) -> Result<()>
where
    K: Resource<DynamicType = ()> + Clone + 'static,
{
    store
        .wait_until_ready()
        .await
        .map_err(|_| Error::CacheSync(K::kind(&()).into_owned()))
}

/// Every `period`, hands every cached object to `on_object`. A zero period
/// disables resyncing.
pub async fn resync<K>(store: Store<K>, period: Duration, mut on_object: impl FnMut(Arc<K>))
where
    K: Resource<DynamicType = ()> + Clone + 'static,
{
    if period.is_zero() {
        debug!("{} resync disabled", K::kind(&()));
        return;
    }

    let mut ticks = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
    loop {
        ticks.tick().await;
        let objects = store.state();
        debug!("resyncing {} {}s", objects.len(), K::kind(&()));
        for object in objects {
            on_object(object);
        }
    }
}

#[cfg(test)]
pub(crate) mod fake {
    //! In-process stand-ins for the cluster API.

    use std::collections::{BTreeMap, VecDeque};
    use std::sync::Mutex;

    use k8s_openapi::api::networking::v1::Ingress;

    use super::*;

    type Key = (String, String);

    fn key<K: Resource>(object: &K) -> Key {
        (
            object.meta().namespace.clone().unwrap_or_default(),
            object.meta().name.clone().unwrap_or_default(),
        )
    }

    /// Services and Ingresses held in memory. Service writes are visible
    /// through the lister immediately.
    #[derive(Default)]
    pub struct FakeCluster {
        services: Mutex<BTreeMap<Key, Arc<Service>>>,
        ingresses: Mutex<BTreeMap<Key, Arc<Ingress>>>,
        replace_failures: Mutex<VecDeque<Error>>,
        replaced: Mutex<Vec<Service>>,
    }

    impl FakeCluster {
        pub fn apply_service(&self, service: Service) -> Arc<Service> {
            let service = Arc::new(service);
            self.services
                .lock()
                .unwrap()
                .insert(key(service.as_ref()), Arc::clone(&service));
            service
        }

        pub fn remove_service(&self, namespace: &str, name: &str) -> Option<Arc<Service>> {
            self.services
                .lock()
                .unwrap()
                .remove(&(namespace.to_owned(), name.to_owned()))
        }

        pub fn apply_ingress(&self, ingress: Ingress) -> Arc<Ingress> {
            let ingress = Arc::new(ingress);
            self.ingresses
                .lock()
                .unwrap()
                .insert(key(ingress.as_ref()), Arc::clone(&ingress));
            ingress
        }

        pub fn remove_ingress(&self, namespace: &str, name: &str) -> Option<Arc<Ingress>> {
            self.ingresses
                .lock()
                .unwrap()
                .remove(&(namespace.to_owned(), name.to_owned()))
        }

        /// Makes the next `replace_service` call fail with `error`.
        pub fn fail_next_replace(&self, error: Error) {
            self.replace_failures.lock().unwrap().push_back(error);
        }

        /// Every Service successfully written, in order.
        pub fn replaced(&self) -> Vec<Service> {
            self.replaced.lock().unwrap().clone()
        }
    }

    impl Lister<Service> for FakeCluster {
        fn get(&self, namespace: &str, name: &str) -> Option<Arc<Service>> {
            self.services
                .lock()
                .unwrap()
                .get(&(namespace.to_owned(), name.to_owned()))
                .cloned()
        }
    }

    impl Lister<Ingress> for FakeCluster {
        fn get(&self, namespace: &str, name: &str) -> Option<Arc<Ingress>> {
            self.ingresses
                .lock()
                .unwrap()
                .get(&(namespace.to_owned(), name.to_owned()))
                .cloned()
        }
    }

    #[async_trait]
    impl ServiceClient for FakeCluster {
        async fn replace_service(&self, service: &Service) -> Result<Service> {
            if let Some(error) = self.replace_failures.lock().unwrap().pop_front() {
                return Err(error);
            }

            let (namespace, name) = key(service);
            let mut services = self.services.lock().unwrap();
            if !services.contains_key(&(namespace.clone(), name.clone())) {
                return Err(Error::NotFound {
                    kind: "Service",
                    namespace,
                    name,
                });
            }

            let mut stored = service.clone();
            let version = stored
                .metadata
                .resource_version
                .as_deref()
                .and_then(|version| version.parse::<u64>().ok())
                .unwrap_or(0);
            stored.metadata.resource_version = Some((version + 1).to_string());

            services.insert((namespace, name), Arc::new(stored.clone()));
            self.replaced.lock().unwrap().push(stored.clone());
            Ok(stored)
        }
    }

    #[derive(Clone, Debug, PartialEq, Eq)]
    pub struct RecordedEvent {
        pub namespace: Option<String>,
        pub name: Option<String>,
        pub type_: EventType,
        pub reason: String,
        pub message: String,
    }

    #[derive(Default)]
    pub struct FakeRecorder {
        events: Mutex<Vec<RecordedEvent>>,
    }

    impl FakeRecorder {
        pub fn events(&self) -> Vec<RecordedEvent> {
            self.events.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl EventRecorder for FakeRecorder {
        async fn record(
            &self,
            object: ObjectReference,
            type_: EventType,
            reason: &str,
            message: String,
        ) -> Result<()> {
            self.events.lock().unwrap().push(RecordedEvent {
                namespace: object.namespace,
                name: object.name,
                type_,
                reason: reason.to_owned(),
                message,
            });
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;

    use super::*;

    fn service(namespace: &str, name: &str) -> Service {
        Service {
            metadata: ObjectMeta {
                namespace: Some(namespace.to_owned()),
                name: Some(name.to_owned()),
                ..Default::default()
            },
            ..Default::default()
        }
    }

    #[test]
    fn resource_ref_identity_ignores_snapshot() {
        let with_snapshot = ResourceRef::from_object(Arc::new(service("default", "svc-a")));
        let bare = ResourceRef::<Service>::new("default", "svc-a");
        assert_eq!(with_snapshot, bare);

        let set: HashSet<_> = [with_snapshot, bare].into_iter().collect();
        assert_eq!(set.len(), 1);
        assert_ne!(
            ResourceRef::<Service>::new("default", "svc-a"),
            ResourceRef::<Service>::new("other", "svc-a")
        );
    }

    #[tokio::test]
    async fn forward_flattens_watch_events() {
        let events = futures::stream::iter(vec![
            Ok(watcher::Event::Restarted(vec![
                service("default", "a"),
                service("default", "b"),
            ])),
            Ok(watcher::Event::Applied(service("default", "c"))),
            Ok(watcher::Event::Deleted(service("default", "a"))),
        ]);

        let mut seen = Vec::new();
        forward(events, |change| {
            seen.push(match change {
                Change::Applied(service) => format!("applied {}", service.name_any()),
                Change::Deleted(service) => format!("deleted {}", service.name_any()),
            })
        })
        .await;

        assert_eq!(
            seen,
            vec!["applied a", "applied b", "applied c", "deleted a"]
        );
    }

    #[tokio::test]
    async fn fake_cluster_replace_bumps_version_and_updates_lister() {
        let cluster = fake::FakeCluster::default();
        cluster.apply_service(service("default", "svc-a"));

        let mut update = service("default", "svc-a");
        update
            .metadata
            .annotations
            .get_or_insert_with(Default::default)
            .insert("key".into(), "value".into());
        let stored = cluster.replace_service(&update).await.unwrap();
        assert_eq!(stored.metadata.resource_version.as_deref(), Some("1"));

        let cached = Lister::<Service>::get(&cluster, "default", "svc-a").unwrap();
        assert_eq!(cached.annotations().get("key").map(String::as_str), Some("value"));

        let missing = cluster.replace_service(&service("default", "gone")).await;
        assert!(missing.unwrap_err().is_not_found());
    }
}

//! The queue-draining half of the controller: watch changes go in as
//! [`QueueItem`]s, workers take them out and hand them to the [`Reconciler`].

use std::future::Future;
use std::sync::Arc;

use k8s_openapi::api::core::v1::Service;
use k8s_openapi::api::networking::v1::Ingress;
use log::{debug, error, info, warn};
use tokio::sync::watch;

use crate::error::Result;
use crate::kubernetes::{Change, ResourceRef};
use crate::reconciler::Reconciler;
use crate::workqueue::{default_controller_rate_limiter, WorkQueue};

/// Name used for the queue and as the event source component.
pub const CONTROLLER_NAME: &str = "http-application-routing-controller";

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Action {
    Add,
    Delete,
}

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum Object {
    Service(ResourceRef<Service>),
    Ingress(ResourceRef<Ingress>),
}

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct QueueItem {
    pub action: Action,
    pub object: Object,
}

/// Kinds the controller watches.
pub trait Watched: kube::Resource<DynamicType = ()> + Sized {
    fn queue_object(reference: ResourceRef<Self>) -> Object;
}

impl Watched for Service {
    fn queue_object(reference: ResourceRef<Self>) -> Object {
        Object::Service(reference)
    }
}

impl Watched for Ingress {
    fn queue_object(reference: ResourceRef<Self>) -> Object {
        Object::Ingress(reference)
    }
}

pub struct Controller {
    queue: Arc<WorkQueue<QueueItem>>,
    reconciler: Reconciler,
    active_workers: Arc<watch::Sender<usize>>,
}

/// Decrements the active worker count however the worker exits.
struct WorkerGuard(Arc<watch::Sender<usize>>);

impl Drop for WorkerGuard {
    fn drop(&mut self) {
        self.0.send_modify(|active| *active = active.saturating_sub(1));
    }
}

impl Controller {
    pub fn new(reconciler: Reconciler) -> Self {
        Controller {
            queue: Arc::new(WorkQueue::new(CONTROLLER_NAME, default_controller_rate_limiter())),
            reconciler,
            active_workers: Arc::new(watch::Sender::new(0)),
        }
    }

    pub fn reconciler(&self) -> &Reconciler {
        &self.reconciler
    }

    pub fn enqueue(&self, action: Action, object: Object) {
        self.queue.add_rate_limited(QueueItem { action, object });
    }

    pub fn enqueue_add(&self, object: Object) {
        self.enqueue(Action::Add, object);
    }

    pub fn enqueue_delete(&self, object: Object) {
        self.enqueue(Action::Delete, object);
    }

    /// Queues a watch notification. Updates are handled as adds.
    pub fn observe<K: Watched>(&self, change: Change<K>) {
        match change {
            Change::Applied(object) => self.enqueue_add(K::queue_object(ResourceRef::from_object(object))),
            Change::Deleted(object) => {
                self.enqueue_delete(K::queue_object(ResourceRef::from_object(object)))
            }
        }
    }

    /// Starts `workers` workers. They are registered before this returns,
    /// so a [`Controller::shutdown`] issued afterwards waits for them. The
    /// returned future completes once the queue is shut down and drained.
    pub fn run(self: &Arc<Self>, workers: usize) -> impl Future<Output = ()> + Send + 'static {
        info!("starting {workers} workers");

        let handles: Vec<_> = (0..workers)
            .map(|id| {
                self.active_workers.send_modify(|active| *active += 1);
                let guard = WorkerGuard(Arc::clone(&self.active_workers));
                let controller = Arc::clone(self);
                tokio::spawn(async move {
                    let _guard = guard;
                    debug!("worker {id} started");
                    while controller.process_next_work_item().await {}
                    debug!("worker {id} stopped");
                })
            })
            .collect();

        async move {
            for handle in futures::future::join_all(handles).await {
                if let Err(error) = handle {
                    error!("worker exited abnormally: {error}");
                }
            }
            info!("all workers stopped");
        }
    }

    /// Stops accepting work and waits for every worker to finish what it
    /// holds. Safe to call more than once.
    pub async fn shutdown(&self) {
        if !self.queue.is_shutting_down() {
            info!("shutting down work queue");
            self.queue.shut_down();
        }

        let mut active = self.active_workers.subscribe();
        // The sender lives as long as self, so this cannot fail.
        let _ = active.wait_for(|active| *active == 0).await;
    }

    /// Takes one item off the queue and reconciles it. Returns `false` once
    /// the queue has shut down and been drained.
    pub async fn process_next_work_item(&self) -> bool {
        let Some(item) = self.queue.get().await else {
            return false;
        };

        let result = self.dispatch(&item).await;
        self.queue.done(&item);

        match result {
            Ok(()) => self.queue.forget(&item),
            Err(error) => {
                let attempt = self.queue.num_requeues(&item) + 1;
                if error.is_transient() {
                    warn!("processing {item:?} failed (attempt {attempt}): {error}");
                } else {
                    error!("processing {item:?} failed (attempt {attempt}), retrying with backoff: {error}");
                }
                self.queue.requeue_rate_limited(item);
            }
        }
        true
    }

    async fn dispatch(&self, item: &QueueItem) -> Result<()> {
        match (&item.action, &item.object) {
            (Action::Add, Object::Service(service)) => self.reconciler.add_service(service).await,
            (Action::Delete, Object::Service(service)) => self.reconciler.delete_service(service).await,
            (Action::Add, Object::Ingress(ingress)) => self.reconciler.add_ingress(ingress).await,
            (Action::Delete, Object::Ingress(ingress)) => self.reconciler.delete_ingress(ingress).await,
        }
    }

    /// Items waiting to be processed.
    pub fn pending(&self) -> usize {
        self.queue.len()
    }
}

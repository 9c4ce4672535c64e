//! Event routing
//!
//! Turns informer notifications into work queue keys:
//! - Service add/update: enqueue the Service key (updates only if something
//!   the builder depends on changed)
//! - Ingress delete: enqueue the Ingress key if a Service controlled it
//!
//! Service deletes are left to the garbage collector (the Ingress carries an
//! owner reference). Ingress adds and updates are not watched: drift inside
//! an existing Ingress is not reconciled.

use crate::apis::ingress::ingress::{controller_of, SERVICE_KIND};
use crate::apis::metrics::record_event;
use crate::controller::queue::WorkQueue;
use common::ObjectKey;
use k8s_openapi::api::core::v1::Service;
use k8s_openapi::api::networking::v1::Ingress;
use kube::{Resource, ResourceExt};
use std::fmt;
use std::sync::Arc;
use tracing::{debug, error};

/// Payload of an informer notification
#[derive(Debug, Clone, PartialEq)]
pub enum WatchedObject {
    Service(Arc<Service>),
    Ingress(Arc<Ingress>),
}

impl WatchedObject {
    pub fn kind(&self) -> &'static str {
        match self {
            WatchedObject::Service(_) => "Service",
            WatchedObject::Ingress(_) => "Ingress",
        }
    }

    /// Logical key of the object, `None` if it has no name
    pub fn key(&self) -> Option<ObjectKey> {
        match self {
            WatchedObject::Service(svc) => object_key(&**svc),
            WatchedObject::Ingress(ing) => object_key(&**ing),
        }
    }
}

impl From<Arc<Service>> for WatchedObject {
    fn from(service: Arc<Service>) -> Self {
        WatchedObject::Service(service)
    }
}

impl From<Arc<Ingress>> for WatchedObject {
    fn from(ingress: Arc<Ingress>) -> Self {
        WatchedObject::Ingress(ingress)
    }
}

fn object_key<K: Resource>(obj: &K) -> Option<ObjectKey> {
    ObjectKey::from_parts(obj.meta().namespace.as_deref(), obj.meta().name.as_deref())
}

type AddFn = Box<dyn Fn(&WatchedObject) + Send + Sync>;
type UpdateFn = Box<dyn Fn(&WatchedObject, &WatchedObject) + Send + Sync>;
type DeleteFn = Box<dyn Fn(&WatchedObject) + Send + Sync>;

/// Optional add/update/delete callbacks registered with an informer
#[derive(Default)]
pub struct EventHandlerFuncs {
    on_add: Option<AddFn>,
    on_update: Option<UpdateFn>,
    on_delete: Option<DeleteFn>,
}

impl EventHandlerFuncs {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on_add(mut self, f: impl Fn(&WatchedObject) + Send + Sync + 'static) -> Self {
        self.on_add = Some(Box::new(f));
        self
    }

    pub fn on_update(
        mut self,
        f: impl Fn(&WatchedObject, &WatchedObject) + Send + Sync + 'static,
    ) -> Self {
        self.on_update = Some(Box::new(f));
        self
    }

    pub fn on_delete(mut self, f: impl Fn(&WatchedObject) + Send + Sync + 'static) -> Self {
        self.on_delete = Some(Box::new(f));
        self
    }

    pub fn handle_add(&self, obj: &WatchedObject) {
        if let Some(f) = &self.on_add {
            f(obj);
        }
    }

    pub fn handle_update(&self, old: &WatchedObject, new: &WatchedObject) {
        if let Some(f) = &self.on_update {
            f(old, new);
        }
    }

    pub fn handle_delete(&self, obj: &WatchedObject) {
        if let Some(f) = &self.on_delete {
            f(obj);
        }
    }
}

impl fmt::Debug for EventHandlerFuncs {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventHandlerFuncs")
            .field("on_add", &self.on_add.is_some())
            .field("on_update", &self.on_update.is_some())
            .field("on_delete", &self.on_delete.is_some())
            .finish()
    }
}

/// Whether an update changed anything the Ingress builder reads
///
/// Compares namespace, name, UID and the full annotation set. Status and
/// resourceVersion churn does not trigger a reconcile.
pub fn service_changed(old: &Service, new: &Service) -> bool {
    old.metadata.namespace != new.metadata.namespace
        || old.metadata.name != new.metadata.name
        || old.metadata.uid != new.metadata.uid
        || old.annotations() != new.annotations()
}

/// Bridges informer notifications into work queue keys
#[derive(Clone)]
pub struct EventRouter {
    queue: Arc<WorkQueue>,
}

impl EventRouter {
    pub fn new(queue: Arc<WorkQueue>) -> Self {
        Self { queue }
    }

    /// Callbacks for the Service informer: add and update only
    pub fn service_handlers(&self) -> EventHandlerFuncs {
        let on_add = self.clone();
        let on_update = self.clone();
        EventHandlerFuncs::new()
            .on_add(move |obj| on_add.service_added(obj))
            .on_update(move |old, new| on_update.service_updated(old, new))
    }

    /// Callbacks for the Ingress informer: delete only
    pub fn ingress_handlers(&self) -> EventHandlerFuncs {
        let on_delete = self.clone();
        EventHandlerFuncs::new().on_delete(move |obj| on_delete.ingress_deleted(obj))
    }

    pub fn service_added(&self, obj: &WatchedObject) {
        match obj {
            WatchedObject::Service(_) => self.enqueue(obj, "add"),
            other => unexpected_payload("Service", "add", other),
        }
    }

    pub fn service_updated(&self, old: &WatchedObject, new: &WatchedObject) {
        match (old, new) {
            (WatchedObject::Service(old_svc), WatchedObject::Service(new_svc)) => {
                if !service_changed(old_svc, new_svc) {
                    debug!(
                        "Service {}/{} update changed nothing relevant, skipping",
                        new_svc.namespace().unwrap_or_default(),
                        new_svc.name_any()
                    );
                    record_event("Service", "update", "unchanged");
                    return;
                }
                self.enqueue(new, "update");
            }
            (WatchedObject::Service(_), other) | (other, _) => {
                unexpected_payload("Service", "update", other)
            }
        }
    }

    pub fn ingress_deleted(&self, obj: &WatchedObject) {
        let ingress = match obj {
            WatchedObject::Ingress(ing) => ing,
            other => return unexpected_payload("Ingress", "delete", other),
        };

        let owned_by_service = controller_of(ingress.owner_references())
            .is_some_and(|owner| owner.kind == SERVICE_KIND);

        if !owned_by_service {
            debug!(
                "Ingress {}/{} deleted but not controlled by a Service, ignoring",
                ingress.namespace().unwrap_or_default(),
                ingress.name_any()
            );
            record_event("Ingress", "delete", "ignored");
            return;
        }

        // Same namespace/name as the owning Service by construction
        self.enqueue(obj, "delete");
    }

    fn enqueue(&self, obj: &WatchedObject, event: &str) {
        match obj.key() {
            Some(key) => {
                debug!("{} {} {}, enqueueing", obj.kind(), key, event);
                record_event(obj.kind(), event, "enqueued");
                self.queue.add(key.to_string());
            }
            None => {
                error!("{} {} event without a name, cannot enqueue", obj.kind(), event);
                record_event(obj.kind(), event, "invalid");
            }
        }
    }
}

/// A callback received an object of the wrong kind; there is no key to retry
fn unexpected_payload(expected: &str, event: &str, got: &WatchedObject) {
    error!(
        "Expected {} in {} event, got {} {}",
        expected,
        event,
        got.kind(),
        got.key().map(|k| k.to_string()).unwrap_or_default()
    );
    record_event(got.kind(), event, "unexpected");
}

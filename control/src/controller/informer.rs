//! Informer: watch-fed resource cache with event callbacks
//!
//! Wraps a `kube` watcher and reflector store. Every watch event is applied to
//! the store and translated into add/update/delete callbacks:
//!
//! - `Apply`: update if the store already held the object, add otherwise
//! - `Delete`: delete with the last observed state
//! - relist (`Init`, `InitApply`*, `InitDone`): listed objects dispatch as
//!   add/update; objects the store held but the relist did not return
//!   dispatch as deletes when `InitDone` arrives
//!
//! Callbacks run on the informer task and must not block.

use crate::controller::events::{EventHandlerFuncs, WatchedObject};
use futures::StreamExt;
use kube::api::Api;
use kube::runtime::reflector::store::Writer;
use kube::runtime::reflector::{ObjectRef, Store};
use kube::runtime::watcher::{self, Config as WatcherConfig};
use kube::runtime::WatchStreamExt;
use kube::{Resource, ResourceExt};
use serde::de::DeserializeOwned;
use std::collections::HashSet;
use std::fmt::Debug;
use std::hash::Hash;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Watch-fed cache of one resource kind
pub struct Informer<K>
where
    K: Resource + Clone + 'static,
    K::DynamicType: Eq + Hash + Clone,
{
    writer: Writer<K>,
    store: Store<K>,
    handlers: Vec<EventHandlerFuncs>,
    /// Objects seen since the current relist started
    relisted: HashSet<ObjectRef<K>>,
}

impl<K> Informer<K>
where
    K: Resource + Clone + Debug + DeserializeOwned + Send + Sync + 'static,
    K::DynamicType: Eq + Hash + Clone + Default,
    Arc<K>: Into<WatchedObject>,
{
    pub fn new() -> Self {
        let writer = Writer::default();
        let store = writer.as_reader();
        Self {
            writer,
            store,
            handlers: Vec::new(),
            relisted: HashSet::new(),
        }
    }

    /// Register a set of callbacks
    pub fn add_event_handler(&mut self, handler: EventHandlerFuncs) {
        self.handlers.push(handler);
    }

    /// Read handle on the cache
    ///
    /// `Store::wait_until_ready` is the readiness barrier: it resolves after
    /// the first complete list has been applied.
    pub fn store(&self) -> Store<K> {
        self.store.clone()
    }

    /// Watch `api` until `shutdown` fires
    pub async fn run(mut self, api: Api<K>, config: WatcherConfig, shutdown: CancellationToken) {
        let kind = K::kind(&K::DynamicType::default()).to_string();
        let stream = watcher::watcher(api, config).default_backoff();
        futures::pin_mut!(stream);

        info!("Starting {} informer", kind);

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    info!("{} informer received shutdown signal", kind);
                    break;
                }
                event = stream.next() => match event {
                    Some(Ok(event)) => self.dispatch(event),
                    Some(Err(e)) => warn!("{} watcher error: {}", kind, e),
                    None => {
                        warn!("{} watch stream ended", kind);
                        break;
                    }
                },
            }
        }

        info!("{} informer stopped", kind);
    }

    /// Apply one watch event to the cache and notify handlers
    pub fn dispatch(&mut self, event: watcher::Event<K>) {
        match &event {
            watcher::Event::Apply(obj) => {
                let new = Arc::new(obj.clone());
                let old = self.store.get(&ObjectRef::from_obj(obj));
                self.writer.apply_watcher_event(&event);
                self.notify_apply(old, new);
            }
            watcher::Event::Delete(obj) => {
                self.writer.apply_watcher_event(&event);
                self.notify_delete(Arc::new(obj.clone()));
            }
            watcher::Event::Init => {
                debug!("{} relist started", K::kind(&K::DynamicType::default()));
                self.relisted.clear();
                self.writer.apply_watcher_event(&event);
            }
            watcher::Event::InitApply(obj) => {
                let obj_ref = ObjectRef::from_obj(obj);
                let old = self.store.get(&obj_ref);
                self.relisted.insert(obj_ref);
                self.writer.apply_watcher_event(&event);
                self.notify_apply(old, Arc::new(obj.clone()));
            }
            watcher::Event::InitDone => {
                // Anything cached but absent from the relist was deleted
                // while the watch was down
                let vanished: Vec<Arc<K>> = self
                    .store
                    .state()
                    .into_iter()
                    .filter(|obj| !self.relisted.contains(&ObjectRef::from_obj(obj.as_ref())))
                    .collect();
                self.relisted.clear();
                self.writer.apply_watcher_event(&event);

                for obj in vanished {
                    debug!(
                        "{} {} disappeared during relist",
                        K::kind(&K::DynamicType::default()),
                        obj.name_any()
                    );
                    self.notify_delete(obj);
                }

                info!(
                    "{} informer synced ({} objects)",
                    K::kind(&K::DynamicType::default()),
                    self.store.state().len()
                );
            }
        }
    }

    fn notify_apply(&self, old: Option<Arc<K>>, new: Arc<K>) {
        let new: WatchedObject = new.into();
        match old {
            Some(old) => {
                let old: WatchedObject = old.into();
                for handler in &self.handlers {
                    handler.handle_update(&old, &new);
                }
            }
            None => {
                for handler in &self.handlers {
                    handler.handle_add(&new);
                }
            }
        }
    }

    fn notify_delete(&self, obj: Arc<K>) {
        let obj: WatchedObject = obj.into();
        for handler in &self.handlers {
            handler.handle_delete(&obj);
        }
    }
}

impl<K> Default for Informer<K>
where
    K: Resource + Clone + Debug + DeserializeOwned + Send + Sync + 'static,
    K::DynamicType: Eq + Hash + Clone + Default,
    Arc<K>: Into<WatchedObject>,
{
    fn default() -> Self {
        Self::new()
    }
}

// Copyright 2025 The Kubernetes Authors.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Informers - watch a resource kind, mirror it locally and notify observers.
//!
//! An [`Informer`] drives a [`kube::runtime::watcher`] stream into a reflector
//! [`Store`] and calls every registered [`ResourceEventHandler`] for each
//! observed change. Handlers are invoked sequentially from the informer's
//! own task, after the store reflects the change.

use std::collections::HashSet;
use std::fmt::Debug;
use std::hash::Hash;
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use kube::runtime::reflector::store::Writer;
use kube::runtime::reflector::{ObjectRef, Store};
use kube::runtime::watcher::{self, watcher, Event};
use kube::runtime::WatchStreamExt;
use kube::{Api, Resource, ResourceExt};
use serde::de::DeserializeOwned;
use thiserror::Error;
use tokio::sync::watch;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Function returning the delay until the next full resync.
pub type ResyncPeriodFn = Arc<dyn Fn() -> Duration + Send + Sync>;

/// Observer of changes to a watched resource kind.
pub trait ResourceEventHandler<K>: Send + Sync {
    /// Called when an object appears in the mirror.
    fn on_add(&self, obj: &K);

    /// Called when a mirrored object changes, and on every periodic resync
    /// (with `old` and `new` being the same object).
    fn on_update(&self, old: &K, new: &K);

    /// Called when an object is removed from the mirror.
    fn on_delete(&self, obj: &K);
}

/// Read access to a local mirror of namespaced objects.
pub trait Lister<K>: Send + Sync {
    /// Returns the mirrored object, if present.
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

/// Type-erased informer handle used for lifecycle management.
#[async_trait]
pub trait SharedInformer: Send + Sync {
    /// Kind of the watched resource.
    fn kind(&self) -> String;

    /// Returns true once the initial listing has been mirrored.
    fn has_synced(&self) -> bool;

    /// Resolves once the initial listing has been mirrored.
    async fn wait_synced(&self);

    /// Watches until the token is cancelled.
    async fn run(&self, cancel: CancellationToken);
}

/// Errors produced when decoding a work item key.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum KeyError {
    /// The key has more than one `/`, or an empty name.
    #[error("unexpected key format: {0:?}")]
    UnexpectedFormat(String),
}

/// Returns the `namespace/name` key of an object (`name` for cluster-scoped objects).
pub fn meta_namespace_key<K: Resource>(obj: &K) -> String {
    match obj.namespace() {
        Some(namespace) if !namespace.is_empty() => format!("{}/{}", namespace, obj.name_any()),
        _ => obj.name_any(),
    }
}

/// Splits a key produced by [`meta_namespace_key`] into namespace and name.
///
/// The namespace is empty for cluster-scoped keys.
pub fn split_meta_namespace_key(key: &str) -> Result<(&str, &str), KeyError> {
    let mut parts = key.split('/');
    match (parts.next(), parts.next(), parts.next()) {
        (Some(name), None, None) if !name.is_empty() => Ok(("", name)),
        (Some(namespace), Some(name), None) if !name.is_empty() => Ok((namespace, name)),
        _ => Err(KeyError::UnexpectedFormat(key.to_string())),
    }
}

/// Waits until every informer has synced.
///
/// Returns false if the token is cancelled first.
pub async fn wait_for_cache_sync(
    cancel: &CancellationToken,
    informers: &[Arc<dyn SharedInformer>],
) -> bool {
    let synced = futures::future::join_all(informers.iter().map(|informer| async move {
        informer.wait_synced().await;
        tracing::debug!(kind = %informer.kind(), "informer cache synced");
    }));

    tokio::select! {
        _ = cancel.cancelled() => false,
        _ = synced => true,
    }
}

/// Objects collected while a (re)list is in progress.
struct Relist<K> {
    /// Mirror contents before the list started.
    previous: Vec<Arc<K>>,
    /// Listed objects with their previously mirrored version.
    listed: Vec<(Option<Arc<K>>, K)>,
}

/// Watches one resource kind and keeps a local mirror of it.
pub struct Informer<K>
where
    K: Resource + Clone + 'static,
    K::DynamicType: Eq + Hash + Clone,
{
    api: Api<K>,
    store: Store<K>,
    writer: Mutex<Option<Writer<K>>>,
    handlers: RwLock<Vec<Arc<dyn ResourceEventHandler<K>>>>,
    resync_period_fn: Option<ResyncPeriodFn>,
    synced: watch::Sender<bool>,
}

impl<K> Informer<K>
where
    K: Resource<DynamicType = ()> + Clone + DeserializeOwned + Debug + Send + Sync + 'static,
{
    /// Creates an informer over the given API.
    ///
    /// With a resync function, every mirrored object is re-delivered through
    /// [`ResourceEventHandler::on_update`] once per period.
    pub fn new(api: Api<K>, resync_period_fn: Option<ResyncPeriodFn>) -> Self {
        let writer = Writer::default();
        let store = writer.as_reader();
        let (synced, _) = watch::channel(false);

        Self {
            api,
            store,
            writer: Mutex::new(Some(writer)),
            handlers: RwLock::new(Vec::new()),
            resync_period_fn,
            synced,
        }
    }

    /// Registers an observer. Must be called before the informer starts to
    /// see the initial listing.
    pub fn add_event_handler(&self, handler: Arc<dyn ResourceEventHandler<K>>) {
        self.handlers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(handler);
    }

    /// Returns a read handle on the local mirror.
    pub fn lister(&self) -> Store<K> {
        self.store.clone()
    }

    fn handlers(&self) -> Vec<Arc<dyn ResourceEventHandler<K>>> {
        self.handlers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn next_resync(&self) -> Duration {
        match &self.resync_period_fn {
            Some(period) => period(),
            // Effectively never; the select branch is disabled anyway.
            None => Duration::from_secs(60 * 60 * 24 * 365),
        }
    }

    fn notify_applied(&self, old: Option<Arc<K>>, obj: &K) {
        for handler in self.handlers() {
            match &old {
                Some(old) => handler.on_update(old, obj),
                None => handler.on_add(obj),
            }
        }
    }

    fn notify_deleted(&self, obj: &K) {
        for handler in self.handlers() {
            handler.on_delete(obj);
        }
    }

    /// Applies one watch event to the mirror, then notifies observers.
    fn handle_event(&self, writer: &mut Writer<K>, relist: &mut Option<Relist<K>>, event: Event<K>) {
        let old = match &event {
            Event::Apply(obj) | Event::InitApply(obj) => self.store.get(&ObjectRef::from_obj(obj)),
            _ => None,
        };

        writer.apply_watcher_event(&event);

        match event {
            Event::Init => {
                // The mirror is swapped atomically on InitDone, so it still
                // holds the previous contents here.
                *relist = Some(Relist {
                    previous: self.store.state(),
                    listed: Vec::new(),
                });
            }
            Event::InitApply(obj) => match relist.as_mut() {
                Some(relist) => relist.listed.push((old, obj)),
                None => self.notify_applied(old, &obj),
            },
            Event::InitDone => {
                if let Some(relist) = relist.take() {
                    let listed: HashSet<ObjectRef<K>> = relist
                        .listed
                        .iter()
                        .map(|(_, obj)| ObjectRef::from_obj(obj))
                        .collect();

                    for (old, obj) in relist.listed {
                        self.notify_applied(old, &obj);
                    }
                    for gone in relist.previous {
                        if !listed.contains(&ObjectRef::from_obj(gone.as_ref())) {
                            self.notify_deleted(&gone);
                        }
                    }
                }

                if !self.has_synced() {
                    tracing::info!(kind = %K::kind(&()), "informer cache populated");
                }
                self.synced.send_replace(true);
            }
            Event::Apply(obj) => self.notify_applied(old, &obj),
            Event::Delete(obj) => self.notify_deleted(&obj),
        }
    }

    /// Re-delivers every mirrored object as an update.
    fn resync(&self) {
        let objects = self.store.state();
        tracing::debug!(kind = %K::kind(&()), count = objects.len(), "resyncing informer");
        for obj in objects {
            for handler in self.handlers() {
                handler.on_update(&obj, &obj);
            }
        }
    }
}

#[async_trait]
impl<K> SharedInformer for Informer<K>
where
    K: Resource<DynamicType = ()> + Clone + DeserializeOwned + Debug + Send + Sync + 'static,
{
    fn kind(&self) -> String {
        K::kind(&()).into_owned()
    }

    fn has_synced(&self) -> bool {
        *self.synced.borrow()
    }

    async fn wait_synced(&self) {
        let mut synced = self.synced.subscribe();
        // The sender lives as long as self, so this only resolves on sync.
        let _ = synced.wait_for(|synced| *synced).await;
    }

    async fn run(&self, cancel: CancellationToken) {
        let taken = self
            .writer
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        let Some(mut writer) = taken else {
            tracing::warn!(kind = %self.kind(), "informer is already running");
            return;
        };

        tracing::info!(kind = %self.kind(), "starting informer");

        let mut events = watcher(self.api.clone(), watcher::Config::default())
            .default_backoff()
            .boxed();
        let mut relist = None;

        let resync = tokio::time::sleep(self.next_resync());
        tokio::pin!(resync);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    tracing::info!(kind = %self.kind(), "stopping informer");
                    break;
                }
                event = events.next() => match event {
                    Some(Ok(event)) => self.handle_event(&mut writer, &mut relist, event),
                    Some(Err(e)) => {
                        tracing::warn!(kind = %self.kind(), error = %e, "watch failed, backing off");
                    }
                    None => {
                        tracing::warn!(kind = %self.kind(), "watch stream ended");
                        break;
                    }
                },
                _ = &mut resync, if self.resync_period_fn.is_some() => {
                    if self.has_synced() {
                        self.resync();
                    }
                    resync.as_mut().reset(Instant::now() + self.next_resync());
                }
            }
        }
    }
}

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

//! Controller context - shared resources for all controllers.

use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::fmt::Debug;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use k8s_openapi::NamespaceResourceScope;
use kube::{Api, Client, Resource};
use rand::Rng;
use serde::de::DeserializeOwned;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::config::ControllerConfig;
use crate::informer::{self, Informer, ResyncPeriodFn, SharedInformer};

/// Shared context for all controllers.
///
/// This struct contains references to shared resources that controllers
/// need to operate, such as the Kubernetes client, informers, and configuration.
#[derive(Clone)]
pub struct ControllerContext {
    /// Kubernetes client for making API requests.
    pub client: Client,

    /// Shared informer factory for typed resources.
    pub informer_factory: Arc<InformerFactory>,

    /// Configuration for this controller instance.
    pub config: Arc<ControllerConfig>,
}

impl ControllerContext {
    /// Creates a new controller context.
    pub fn new(
        client: Client,
        informer_factory: Arc<InformerFactory>,
        config: Arc<ControllerConfig>,
    ) -> Self {
        Self {
            client,
            informer_factory,
            config,
        }
    }

    /// Builds a context, and its informer factory, from configuration.
    ///
    /// Informers resync on a jittered period, or never when the configured
    /// period is zero.
    pub fn from_config(client: Client, config: Arc<ControllerConfig>) -> Self {
        let generic = &config.generic;
        let factory_resync = (!generic.resync_period.is_zero()).then(|| {
            let resync_fn: ResyncPeriodFn = Arc::new(resync_period_fn(generic.resync_period));
            resync_fn
        });

        let informer_factory = Arc::new(
            InformerFactory::new(client.clone(), generic.namespace.clone(), factory_resync)
                .with_cache_sync_timeout(generic.cache_sync_timeout),
        );

        Self::new(client, informer_factory, config)
    }
}

struct RegisteredInformer {
    shared: Arc<dyn SharedInformer>,
    typed: Arc<dyn Any + Send + Sync>,
    started: bool,
}

/// Factory for shared informers.
///
/// Hands out one [`Informer`] per resource kind, so controllers asking for
/// the same kind share its watch and mirror.
pub struct InformerFactory {
    client: Client,
    namespace: Option<String>,
    resync_period_fn: Option<ResyncPeriodFn>,
    cache_sync_timeout: Duration,
    informers: Mutex<HashMap<TypeId, RegisteredInformer>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl InformerFactory {
    /// Creates a factory watching `namespace`, or every namespace when unset.
    pub fn new(
        client: Client,
        namespace: Option<String>,
        resync_period_fn: Option<ResyncPeriodFn>,
    ) -> Self {
        Self {
            client,
            namespace,
            resync_period_fn,
            cache_sync_timeout: Duration::ZERO,
            informers: Mutex::new(HashMap::new()),
            tasks: Mutex::new(Vec::new()),
        }
    }

    /// Bounds [`InformerFactory::wait_for_cache_sync`]. Zero waits until
    /// cancellation.
    pub fn with_cache_sync_timeout(mut self, timeout: Duration) -> Self {
        self.cache_sync_timeout = timeout;
        self
    }

    /// Returns the shared informer for `K`, creating it on first use.
    pub fn informer<K>(&self) -> Arc<Informer<K>>
    where
        K: Resource<Scope = NamespaceResourceScope, DynamicType = ()>
            + Clone
            + DeserializeOwned
            + Debug
            + Send
            + Sync
            + 'static,
    {
        let mut informers = self.informers.lock().unwrap_or_else(PoisonError::into_inner);
        let id = TypeId::of::<K>();

        if let Some(existing) = informers
            .get(&id)
            .and_then(|registered| registered.typed.clone().downcast::<Informer<K>>().ok())
        {
            return existing;
        }

        let api = match &self.namespace {
            Some(namespace) => Api::<K>::namespaced(self.client.clone(), namespace),
            None => Api::<K>::all(self.client.clone()),
        };
        let informer = Arc::new(Informer::new(api, self.resync_period_fn.clone()));
        informers.insert(
            id,
            RegisteredInformer {
                shared: informer.clone(),
                typed: informer.clone(),
                started: false,
            },
        );
        informer
    }

    /// Starts every informer that is not running yet.
    pub fn start(&self, cancel: &CancellationToken) {
        let mut informers = self.informers.lock().unwrap_or_else(PoisonError::into_inner);
        let mut tasks = self.tasks.lock().unwrap_or_else(PoisonError::into_inner);

        for registered in informers.values_mut().filter(|registered| !registered.started) {
            registered.started = true;
            let informer = registered.shared.clone();
            let cancel = cancel.clone();
            tasks.push(tokio::spawn(async move { informer.run(cancel).await }));
        }
    }

    fn shared_informers(&self) -> Vec<Arc<dyn SharedInformer>> {
        self.informers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .map(|registered| registered.shared.clone())
            .collect()
    }

    /// Returns true once every informer has completed its initial listing.
    pub fn has_synced(&self) -> bool {
        self.shared_informers().iter().all(|informer| informer.has_synced())
    }

    /// Waits until every informer has synced.
    ///
    /// Returns false if the token is cancelled or the sync timeout elapses
    /// first.
    pub async fn wait_for_cache_sync(&self, cancel: &CancellationToken) -> bool {
        let informers = self.shared_informers();
        if self.cache_sync_timeout.is_zero() {
            return informer::wait_for_cache_sync(cancel, &informers).await;
        }

        match tokio::time::timeout(
            self.cache_sync_timeout,
            informer::wait_for_cache_sync(cancel, &informers),
        )
        .await
        {
            Ok(synced) => synced,
            Err(_) => {
                let pending: Vec<String> = informers
                    .iter()
                    .filter(|informer| !informer.has_synced())
                    .map(|informer| informer.kind())
                    .collect();
                tracing::error!(
                    timeout = ?self.cache_sync_timeout,
                    ?pending,
                    "timed out waiting for informer caches to sync"
                );
                false
            }
        }
    }

    /// Waits for the informer tasks to exit. They stop when the token given
    /// to [`InformerFactory::start`] is cancelled.
    pub async fn shutdown(&self) {
        let tasks = std::mem::take(&mut *self.tasks.lock().unwrap_or_else(PoisonError::into_inner));
        for result in futures::future::join_all(tasks).await {
            if let Err(e) = result {
                tracing::error!(error = %e, "informer task failed");
            }
        }
    }
}

/// Creates a resync period function with the given base duration.
///
/// The returned function adds random jitter to avoid all informers
/// resyncing at the same time.
pub fn resync_period_fn(base: Duration) -> impl Fn() -> Duration + Send + Sync {
    move || {
        let mut rng = rand::thread_rng();
        // Add between 0 and 100% jitter
        let jitter = rng.gen_range(0.0..1.0);
        Duration::from_secs_f64(base.as_secs_f64() * (1.0 + jitter))
    }
}

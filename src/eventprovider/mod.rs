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

//! The EventProvider controller.
//!
//! Change notifications for EventProviders are turned into `namespace/name`
//! keys on a [`WorkQueue`]. A fixed pool of workers takes keys off the queue
//! and hands them to the [`Reconciler`]. The queue never gives the same key
//! to two workers at once, so different EventProviders reconcile in
//! parallel while each one reconciles sequentially.

pub mod error;
pub mod reconciler;
pub mod resources;

pub use error::ReconcileError;
pub use reconciler::{
    Converge, DownstreamClients, Provider, Reconciler, StorageEventStrategy, EVENT_GRID_PROVIDER,
    STORAGE_EVENT_TYPE,
};

use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use async_trait::async_trait;
use futures::FutureExt;
use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::Service;
use k8s_openapi::api::networking::v1::Ingress;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use crate::clients::KubeResourceClient;
use crate::controller::{Controller, ControllerError, Result};
use crate::controller_context::ControllerContext;
use crate::crd::EventProvider;
use crate::eventgrid::SubscriptionProvider;
use crate::informer::{meta_namespace_key, ResourceEventHandler};
use crate::workqueue::{ItemExponentialFailureRateLimiter, WorkQueue};

/// Canonical name of this controller.
pub const CONTROLLER_NAME: &str = "eventprovider";

/// Reconciles EventProviders from a rate-limited work queue.
///
/// Cloning yields a handle sharing the same queue and reconciler.
#[derive(Clone)]
pub struct EventProviderController {
    queue: WorkQueue<String>,
    reconciler: Arc<Reconciler>,
    workers: usize,
}

impl EventProviderController {
    /// Creates a controller around an existing queue and reconciler.
    pub fn new(queue: WorkQueue<String>, reconciler: Reconciler, workers: usize) -> Self {
        Self {
            queue,
            reconciler: Arc::new(reconciler),
            workers,
        }
    }

    /// Builds the controller from the shared context and registers it with
    /// the EventProvider informer.
    ///
    /// Child objects are read from their own informers, so the controller
    /// only starts once those caches have synced too.
    pub fn from_context(
        ctx: &ControllerContext,
        subscriptions: Arc<dyn SubscriptionProvider>,
    ) -> Arc<Self> {
        let factory = &ctx.informer_factory;
        let providers = factory.informer::<EventProvider>();
        let deployments = factory.informer::<Deployment>();
        let services = factory.informer::<Service>();
        let ingresses = factory.informer::<Ingress>();

        let downstream = DownstreamClients {
            deployments: Arc::new(KubeResourceClient::new(ctx.client.clone(), deployments.lister())),
            services: Arc::new(KubeResourceClient::new(ctx.client.clone(), services.lister())),
            ingresses: Arc::new(KubeResourceClient::new(ctx.client.clone(), ingresses.lister())),
            subscriptions,
        };

        let workqueue = &ctx.config.workqueue;
        let queue = WorkQueue::with_rate_limiter(
            "EventProviders",
            ItemExponentialFailureRateLimiter::new(workqueue.base_delay, workqueue.max_delay),
        );
        let reconciler = Reconciler::new(Arc::new(providers.lister()), downstream);

        let controller = Arc::new(Self::new(queue, reconciler, ctx.config.generic.workers));
        providers.add_event_handler(controller.clone());
        controller
    }

    /// Returns the work queue feeding this controller.
    pub fn queue(&self) -> &WorkQueue<String> {
        &self.queue
    }

    fn enqueue(&self, ep: &EventProvider) {
        self.queue.add(meta_namespace_key(ep));
    }

    /// Processes keys until the queue shuts down.
    pub async fn run_worker(&self) {
        while self.process_next_work_item().await {}
    }

    /// Takes one key off the queue and reconciles it.
    ///
    /// Returns false once the queue has shut down.
    pub async fn process_next_work_item(&self) -> bool {
        let Some(key) = self.queue.get().await else {
            return false;
        };

        let outcome = AssertUnwindSafe(self.reconciler.sync(&key))
            .catch_unwind()
            .await;

        match outcome {
            Ok(Ok(())) => {
                self.queue.forget(&key);
                tracing::info!(key = %key, "successfully synced");
            }
            Ok(Err(e)) if !e.is_retryable() => {
                self.queue.forget(&key);
                tracing::error!(key = %key, error = %e, "dropping key, retrying cannot fix this error");
            }
            Ok(Err(e)) => {
                tracing::warn!(
                    key = %key,
                    error = %e,
                    requeues = self.queue.num_requeues(&key),
                    "error syncing, requeuing with backoff"
                );
                self.queue.add_rate_limited(key.clone());
            }
            Err(panic) => {
                tracing::error!(
                    key = %key,
                    panic = %panic_message(panic.as_ref()),
                    "recovered from panic while syncing, requeuing with backoff"
                );
                self.queue.add_rate_limited(key.clone());
            }
        }

        self.queue.done(&key);
        true
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> &str {
    if let Some(message) = panic.downcast_ref::<&str>() {
        message
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message
    } else {
        "unknown panic"
    }
}

impl ResourceEventHandler<EventProvider> for EventProviderController {
    fn on_add(&self, obj: &EventProvider) {
        tracing::debug!(key = %meta_namespace_key(obj), "eventprovider added");
        self.enqueue(obj);
    }

    fn on_update(&self, _old: &EventProvider, new: &EventProvider) {
        tracing::debug!(key = %meta_namespace_key(new), "eventprovider updated");
        self.enqueue(new);
    }

    fn on_delete(&self, obj: &EventProvider) {
        tracing::debug!(key = %meta_namespace_key(obj), "eventprovider deleted");
        self.enqueue(obj);
    }
}

#[async_trait]
impl Controller for EventProviderController {
    fn name(&self) -> &str {
        CONTROLLER_NAME
    }

    async fn run(&self, ctx: ControllerContext, cancel: CancellationToken) -> Result<()> {
        if self.workers == 0 {
            return Err(ControllerError::InvalidConfig {
                name: CONTROLLER_NAME.to_string(),
                reason: "at least one worker is required".to_string(),
            });
        }

        tracing::info!(controller = CONTROLLER_NAME, "waiting for informer caches to sync");
        if !ctx.informer_factory.wait_for_cache_sync(&cancel).await {
            self.queue.shut_down();
            return Err(ControllerError::CacheSyncFailed(CONTROLLER_NAME.to_string()));
        }

        tracing::info!(
            controller = CONTROLLER_NAME,
            queue = self.queue.name(),
            workers = self.workers,
            "starting workers"
        );
        let mut workers = JoinSet::new();
        for id in 0..self.workers {
            let controller = self.clone();
            workers.spawn(async move {
                controller.run_worker().await;
                id
            });
        }

        cancel.cancelled().await;
        tracing::info!(
            controller = CONTROLLER_NAME,
            queue = self.queue.name(),
            pending = self.queue.len(),
            "shutting down workers"
        );
        self.queue.shut_down();

        while let Some(result) = workers.join_next().await {
            match result {
                Ok(id) => tracing::debug!(controller = CONTROLLER_NAME, worker = id, "worker stopped"),
                Err(e) => tracing::error!(controller = CONTROLLER_NAME, error = %e, "worker task failed"),
            }
        }

        Ok(())
    }

    fn worker_count(&self) -> usize {
        self.workers
    }
}

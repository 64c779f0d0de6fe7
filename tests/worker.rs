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

//! Worker loop outcomes: forget, drop or requeue with backoff.

mod common;

use std::sync::Arc;
use std::time::Duration;

use k8s_openapi::api::core::v1::ConfigMap;
use tokio_util::sync::CancellationToken;

use common::{storage_provider, Harness};
use eventprovider_controller::config::ControllerConfig;
use eventprovider_controller::controller::{Controller, ControllerError};
use eventprovider_controller::controller_context::ControllerContext;
use eventprovider_controller::eventprovider::EventProviderController;
use eventprovider_controller::informer::ResourceEventHandler;
use eventprovider_controller::workqueue::{ItemExponentialFailureRateLimiter, WorkQueue};

const KEY: &str = "ns/sa1";

fn controller(harness: &Harness) -> EventProviderController {
    let queue = WorkQueue::with_rate_limiter(
        "test",
        ItemExponentialFailureRateLimiter::new(Duration::from_millis(5), Duration::from_secs(1)),
    );
    EventProviderController::new(queue, harness.reconciler(), 1)
}

/// A context whose client points at a closed port.
fn context(cache_sync_timeout: Duration) -> ControllerContext {
    let config = kube::Config::new("http://127.0.0.1:1".parse().unwrap());
    let client = kube::Client::try_from(config).unwrap();
    let mut config = ControllerConfig::default();
    config.generic.cache_sync_timeout = cache_sync_timeout;
    ControllerContext::from_config(client, Arc::new(config))
}

#[tokio::test]
async fn test_success_forgets_key() {
    let harness = Harness::default();
    harness.lister.insert(storage_provider());
    let controller = controller(&harness);

    controller.queue().add(KEY.to_string());
    assert!(controller.process_next_work_item().await);

    assert!(controller.queue().is_empty());
    assert_eq!(controller.queue().num_requeues(&KEY.to_string()), 0);
    assert_eq!(harness.total_creates(), 4);
}

#[tokio::test(start_paused = true)]
async fn test_transient_error_requeues_after_backoff() {
    let harness = Harness::default();
    harness.lister.insert(storage_provider());
    harness.deployments.fail_gets(Some("apiserver unavailable"));
    let controller = controller(&harness);
    let key = KEY.to_string();

    controller.queue().add(key.clone());
    assert!(controller.process_next_work_item().await);

    // Not back before the backoff elapses
    assert!(controller.queue().is_empty());
    assert_eq!(controller.queue().num_requeues(&key), 1);
    assert_eq!(harness.services.gets(), 0);

    tokio::time::sleep(Duration::from_millis(10)).await;
    assert_eq!(controller.queue().len(), 1);

    // The second attempt succeeds and clears the failure history
    harness.deployments.fail_gets(None);
    assert!(controller.process_next_work_item().await);
    assert!(controller.queue().is_empty());
    assert_eq!(controller.queue().num_requeues(&key), 0);
    assert_eq!(harness.deployments.created().len(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_configuration_error_drops_key() {
    let harness = Harness::default();
    let mut ep = storage_provider();
    ep.spec.provider_name = "pubsub.gcp.com".to_string();
    harness.lister.insert(ep);
    let controller = controller(&harness);

    controller.queue().add(KEY.to_string());
    assert!(controller.process_next_work_item().await);

    tokio::time::sleep(Duration::from_secs(5)).await;
    assert!(controller.queue().is_empty());
    assert_eq!(controller.queue().num_requeues(&KEY.to_string()), 0);
}

#[tokio::test(start_paused = true)]
async fn test_malformed_key_is_dropped() {
    let harness = Harness::default();
    let controller = controller(&harness);

    controller.queue().add("a/b/c".to_string());
    assert!(controller.process_next_work_item().await);

    tokio::time::sleep(Duration::from_secs(5)).await;
    assert!(controller.queue().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_panic_is_recovered_and_requeued() {
    let harness = Harness::default();
    harness.lister.insert(storage_provider());
    harness.deployments.panic_on_get();
    let controller = controller(&harness);

    controller.queue().add(KEY.to_string());
    assert!(controller.process_next_work_item().await);

    tokio::time::sleep(Duration::from_millis(10)).await;
    assert_eq!(controller.queue().len(), 1);
}

#[tokio::test]
async fn test_notifications_enqueue_once() {
    let harness = Harness::default();
    let controller = controller(&harness);
    let ep = storage_provider();

    controller.on_add(&ep);
    controller.on_update(&ep, &ep);
    controller.on_delete(&ep);

    assert_eq!(controller.queue().len(), 1);
}

#[tokio::test]
async fn test_worker_exits_after_shutdown() {
    let harness = Harness::default();
    let controller = controller(&harness);

    controller.queue().shut_down();
    assert!(!controller.process_next_work_item().await);

    // Returns instead of blocking forever
    controller.run_worker().await;
}

#[tokio::test(start_paused = true)]
async fn test_subscription_check_failure_requeues_without_create() {
    let harness = Harness::default();
    harness.lister.insert(storage_provider());
    harness.subscriptions.fail_checks(Some("throttled"));
    let controller = controller(&harness);
    let key = KEY.to_string();

    controller.queue().add(key.clone());
    assert!(controller.process_next_work_item().await);

    assert!(harness.subscriptions.creates().is_empty());
    assert!(controller.queue().is_empty());
    assert_eq!(controller.queue().num_requeues(&key), 1);

    tokio::time::sleep(Duration::from_millis(10)).await;
    assert_eq!(controller.queue().len(), 1);

    // Children already exist, so only the subscription step is retried
    harness.subscriptions.fail_checks(None);
    assert!(controller.process_next_work_item().await);
    assert_eq!(harness.subscriptions.checks().len(), 2);
    assert_eq!(harness.subscriptions.creates().len(), 1);
    assert_eq!(harness.total_creates(), 4);
    assert_eq!(controller.queue().num_requeues(&key), 0);
}

#[tokio::test]
async fn test_run_fails_when_caches_never_sync() {
    let harness = Harness::default();
    harness.lister.insert(storage_provider());
    let ctx = context(Duration::from_millis(200));
    // Registered but never started
    let _informer = ctx.informer_factory.informer::<ConfigMap>();
    let controller = controller(&harness);
    controller.queue().add(KEY.to_string());

    let result = Controller::run(&controller, ctx, CancellationToken::new()).await;

    assert!(matches!(result, Err(ControllerError::CacheSyncFailed(ref name)) if name == "eventprovider"));
    assert_eq!(harness.total_creates(), 0);
    assert!(controller.queue().is_shutting_down());
}

#[tokio::test]
async fn test_run_processes_keys_until_cancelled() {
    let harness = Harness::default();
    harness.lister.insert(storage_provider());
    let ctx = context(Duration::from_millis(200));
    let controller = controller(&harness);
    controller.queue().add(KEY.to_string());

    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(100)).await;
        trigger.cancel();
    });

    Controller::run(&controller, ctx, cancel).await.unwrap();

    assert_eq!(harness.total_creates(), 4);
    assert!(controller.queue().is_shutting_down());
    assert!(controller.queue().is_empty());
}

#[tokio::test]
async fn test_run_rejects_zero_workers() {
    let harness = Harness::default();
    let queue = WorkQueue::new("test");
    let controller = EventProviderController::new(queue, harness.reconciler(), 0);

    let result = Controller::run(&controller, context(Duration::ZERO), CancellationToken::new()).await;

    assert!(matches!(result, Err(ControllerError::InvalidConfig { .. })));
}

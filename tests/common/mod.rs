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

//! In-memory collaborators for driving the reconciler without a cluster.

#![allow(dead_code)]

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::Service;
use k8s_openapi::api::networking::v1::Ingress;
use kube::core::ErrorResponse;
use kube::ResourceExt;

use eventprovider_controller::clients::{ClientError, ResourceClient};
use eventprovider_controller::crd::{EventProvider, EventProviderSpec};
use eventprovider_controller::eventgrid::{
    subscription_name, ProviderError, StorageAccountScope, SubscriptionProvider,
};
use eventprovider_controller::eventprovider::{DownstreamClients, Reconciler};
use eventprovider_controller::informer::Lister;

/// Child resource store counting every call.
pub struct FakeResourceClient<K> {
    objects: Mutex<HashMap<(String, String), Arc<K>>>,
    created: Mutex<Vec<K>>,
    gets: AtomicUsize,
    fail_get: Mutex<Option<String>>,
    fail_create: Mutex<Option<String>>,
    panic_on_get: AtomicBool,
}

/// A 503 from the API server.
pub fn unavailable(message: &str) -> ClientError {
    ClientError::Api(kube::Error::Api(ErrorResponse {
        status: "Failure".to_string(),
        message: message.to_string(),
        reason: "ServiceUnavailable".to_string(),
        code: 503,
    }))
}

/// A 503 from the subscription provider.
pub fn provider_unavailable(message: &str) -> ProviderError {
    ProviderError::UnexpectedStatus {
        status: 503,
        body: message.to_string(),
    }
}

impl<K> Default for FakeResourceClient<K> {
    fn default() -> Self {
        Self {
            objects: Mutex::new(HashMap::new()),
            created: Mutex::new(Vec::new()),
            gets: AtomicUsize::new(0),
            fail_get: Mutex::new(None),
            fail_create: Mutex::new(None),
            panic_on_get: AtomicBool::new(false),
        }
    }
}

impl<K: Clone> FakeResourceClient<K> {
    pub fn gets(&self) -> usize {
        self.gets.load(Ordering::SeqCst)
    }

    pub fn created(&self) -> Vec<K> {
        self.created.lock().unwrap().clone()
    }

    /// Makes every lookup fail until cleared.
    pub fn fail_gets(&self, message: Option<&str>) {
        *self.fail_get.lock().unwrap() = message.map(str::to_string);
    }

    /// Makes every create fail until cleared.
    pub fn fail_creates(&self, message: Option<&str>) {
        *self.fail_create.lock().unwrap() = message.map(str::to_string);
    }

    pub fn panic_on_get(&self) {
        self.panic_on_get.store(true, Ordering::SeqCst);
    }
}

#[async_trait]
impl<K> ResourceClient<K> for FakeResourceClient<K>
where
    K: kube::Resource + Clone + Send + Sync + 'static,
{
    async fn get(&self, namespace: &str, name: &str) -> Result<Option<Arc<K>>, ClientError> {
        self.gets.fetch_add(1, Ordering::SeqCst);
        if self.panic_on_get.load(Ordering::SeqCst) {
            panic!("lookup of {namespace}/{name} exploded");
        }
        if let Some(message) = self.fail_get.lock().unwrap().clone() {
            return Err(unavailable(&message));
        }
        Ok(self
            .objects
            .lock()
            .unwrap()
            .get(&(namespace.to_string(), name.to_string()))
            .cloned())
    }

    async fn create(&self, namespace: &str, obj: &K) -> Result<K, ClientError> {
        if let Some(message) = self.fail_create.lock().unwrap().clone() {
            return Err(unavailable(&message));
        }
        self.created.lock().unwrap().push(obj.clone());
        self.objects
            .lock()
            .unwrap()
            .insert((namespace.to_string(), obj.name_any()), Arc::new(obj.clone()));
        Ok(obj.clone())
    }
}

/// Subscription registry remembering every call.
#[derive(Default)]
pub struct FakeSubscriptions {
    existing: Mutex<HashSet<String>>,
    checks: Mutex<Vec<(StorageAccountScope, String)>>,
    creates: Mutex<Vec<(String, String, String)>>,
    fail_check: Mutex<Option<String>>,
    fail_create: Mutex<Option<String>>,
}

impl FakeSubscriptions {
    /// Makes every existence check fail until cleared.
    pub fn fail_checks(&self, message: Option<&str>) {
        *self.fail_check.lock().unwrap() = message.map(str::to_string);
    }

    /// Makes every create-or-update fail until cleared. Failed calls are
    /// still recorded.
    pub fn fail_creates(&self, message: Option<&str>) {
        *self.fail_create.lock().unwrap() = message.map(str::to_string);
    }

    pub fn checks(&self) -> Vec<(StorageAccountScope, String)> {
        self.checks.lock().unwrap().clone()
    }

    pub fn creates(&self) -> Vec<(String, String, String)> {
        self.creates.lock().unwrap().clone()
    }
}

#[async_trait]
impl SubscriptionProvider for FakeSubscriptions {
    async fn check_subscription(
        &self,
        scope: &StorageAccountScope,
        name: &str,
    ) -> Result<bool, ProviderError> {
        self.checks
            .lock()
            .unwrap()
            .push((scope.clone(), name.to_string()));
        if let Some(message) = self.fail_check.lock().unwrap().clone() {
            return Err(provider_unavailable(&message));
        }
        Ok(self.existing.lock().unwrap().contains(name))
    }

    async fn create_or_update_subscription(
        &self,
        resource_group: &str,
        storage_account: &str,
        target_host: &str,
    ) -> Result<(), ProviderError> {
        self.creates.lock().unwrap().push((
            resource_group.to_string(),
            storage_account.to_string(),
            target_host.to_string(),
        ));
        if let Some(message) = self.fail_create.lock().unwrap().clone() {
            return Err(provider_unavailable(&message));
        }
        self.existing
            .lock()
            .unwrap()
            .insert(subscription_name(storage_account));
        Ok(())
    }
}

/// EventProvider mirror.
#[derive(Default)]
pub struct FakeLister {
    objects: Mutex<HashMap<(String, String), Arc<EventProvider>>>,
}

impl FakeLister {
    pub fn insert(&self, ep: EventProvider) {
        let key = (ep.namespace().unwrap_or_default(), ep.name_any());
        self.objects.lock().unwrap().insert(key, Arc::new(ep));
    }
}

impl Lister<EventProvider> for FakeLister {
    fn get(&self, namespace: &str, name: &str) -> Option<Arc<EventProvider>> {
        self.objects
            .lock()
            .unwrap()
            .get(&(namespace.to_string(), name.to_string()))
            .cloned()
    }
}

/// Every fake wired into one reconciler.
#[derive(Default)]
pub struct Harness {
    pub lister: Arc<FakeLister>,
    pub deployments: Arc<FakeResourceClient<Deployment>>,
    pub services: Arc<FakeResourceClient<Service>>,
    pub ingresses: Arc<FakeResourceClient<Ingress>>,
    pub subscriptions: Arc<FakeSubscriptions>,
}

impl Harness {
    pub fn reconciler(&self) -> Reconciler {
        let downstream = DownstreamClients {
            deployments: self.deployments.clone(),
            services: self.services.clone(),
            ingresses: self.ingresses.clone(),
            subscriptions: self.subscriptions.clone(),
        };
        Reconciler::new(self.lister.clone(), downstream)
    }

    pub fn total_creates(&self) -> usize {
        self.deployments.created().len()
            + self.services.created().len()
            + self.ingresses.created().len()
            + self.subscriptions.creates().len()
    }

    pub fn total_lookups(&self) -> usize {
        self.deployments.gets()
            + self.services.gets()
            + self.ingresses.gets()
            + self.subscriptions.checks().len()
    }
}

/// The `ns/sa1` EventProvider on storage account `acct`.
pub fn storage_provider() -> EventProvider {
    let mut ep = EventProvider::new(
        "sa1",
        EventProviderSpec {
            provider_name: "eventgrid.azure.com".to_string(),
            event_type: "Microsoft.Storage".to_string(),
            storage_account: "acct".to_string(),
            resource_group: "rg".to_string(),
            secret: String::new(),
            host: "h.example.com".to_string(),
            host_image: "img:latest".to_string(),
        },
    );
    ep.metadata.namespace = Some("ns".to_string());
    ep
}

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

//! Convergence of an EventProvider towards its declared pipeline.
//!
//! Reconciliation is level-triggered: it only looks at the current mirror
//! and downstream state, never at the notification that queued the key.
//! Every step is get-or-create on a deterministic name, so running it again
//! against an unchanged EventProvider creates nothing.

use std::str::FromStr;
use std::sync::Arc;

use async_trait::async_trait;
use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::Service;
use k8s_openapi::api::networking::v1::Ingress;

use super::error::{ReconcileError, Result};
use super::resources::{new_deployment, new_ingress, new_service, with_host_rule, ChildNames};
use crate::clients::ResourceClient;
use crate::crd::EventProvider;
use crate::eventgrid::{subscription_name, StorageAccountScope, SubscriptionProvider};
use crate::informer::{split_meta_namespace_key, Lister};

/// Provider identifier of Azure Event Grid.
pub const EVENT_GRID_PROVIDER: &str = "eventgrid.azure.com";

/// The only event type the storage-event strategy accepts.
pub const STORAGE_EVENT_TYPE: &str = "Microsoft.Storage";

/// Clients for everything an EventProvider converges.
#[derive(Clone)]
pub struct DownstreamClients {
    /// Receiver Deployments.
    pub deployments: Arc<dyn ResourceClient<Deployment>>,
    /// Services in front of the receivers.
    pub services: Arc<dyn ResourceClient<Service>>,
    /// Ingresses routing each host to its Service.
    pub ingresses: Arc<dyn ResourceClient<Ingress>>,
    /// Event subscriptions at the cloud provider.
    pub subscriptions: Arc<dyn SubscriptionProvider>,
}

/// A strategy that converges an EventProvider for one provider.
#[async_trait]
pub trait Converge: Send + Sync {
    /// Applies the side effects needed for `ep`, stopping at the first error.
    async fn converge(
        &self,
        namespace: &str,
        ep: &EventProvider,
        downstream: &DownstreamClients,
    ) -> Result<()>;
}

/// Supported provider strategies, parsed from `spec.providerName`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Provider {
    /// Azure Event Grid delivering storage account events.
    EventGrid,
}

impl FromStr for Provider {
    type Err = ReconcileError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            EVENT_GRID_PROVIDER => Ok(Provider::EventGrid),
            other => Err(ReconcileError::UnsupportedProvider(other.to_string())),
        }
    }
}

impl Provider {
    /// Returns the strategy for this provider.
    pub fn strategy(&self) -> &'static dyn Converge {
        match self {
            Provider::EventGrid => &StorageEventStrategy,
        }
    }
}

/// Receiver deployment, service and ingress plus an Event Grid subscription
/// on the storage account.
#[derive(Debug, Clone, Copy, Default)]
pub struct StorageEventStrategy;

#[async_trait]
impl Converge for StorageEventStrategy {
    async fn converge(
        &self,
        namespace: &str,
        ep: &EventProvider,
        downstream: &DownstreamClients,
    ) -> Result<()> {
        let spec = &ep.spec;
        if spec.event_type != STORAGE_EVENT_TYPE {
            return Err(ReconcileError::UnsupportedEventType {
                provider: EVENT_GRID_PROVIDER,
                expected: STORAGE_EVENT_TYPE,
                actual: spec.event_type.clone(),
            });
        }

        let names = ChildNames::for_provider(ep);

        // The service selects the deployment's pods, so the deployment goes first.
        get_or_create(&*downstream.deployments, "Deployment", namespace, &names.deployment, || {
            new_deployment(ep, namespace, &names.deployment)
        })
        .await?;

        get_or_create(&*downstream.services, "Service", namespace, &names.service, || {
            new_service(namespace, &names.service, &names.deployment)
        })
        .await?;

        get_or_create(&*downstream.ingresses, "Ingress", namespace, &names.ingress, || {
            with_host_rule(
                new_ingress(namespace, &names.ingress),
                &spec.host,
                &names.service,
                &spec.secret,
            )
        })
        .await?;

        let scope = StorageAccountScope::new(&spec.resource_group, &spec.storage_account);
        let name = subscription_name(&spec.storage_account);
        let exists = downstream
            .subscriptions
            .check_subscription(&scope, &name)
            .await
            .map_err(|source| ReconcileError::CheckSubscription {
                name: name.clone(),
                source,
            })?;

        if !exists {
            downstream
                .subscriptions
                .create_or_update_subscription(&spec.resource_group, &spec.storage_account, &spec.host)
                .await
                .map_err(|source| ReconcileError::CreateSubscription {
                    storage_account: spec.storage_account.clone(),
                    source,
                })?;
            tracing::info!(subscription = %name, host = %spec.host, "created event subscription");
        }

        Ok(())
    }
}

async fn get_or_create<K, F>(
    client: &dyn ResourceClient<K>,
    kind: &'static str,
    namespace: &str,
    name: &str,
    desired: F,
) -> Result<()>
where
    F: FnOnce() -> K,
{
    let existing = client
        .get(namespace, name)
        .await
        .map_err(|source| ReconcileError::Lookup {
            kind,
            name: name.to_string(),
            source,
        })?;

    if existing.is_some() {
        tracing::debug!(kind, namespace, name, "child already exists");
        return Ok(());
    }

    client
        .create(namespace, &desired())
        .await
        .map_err(|source| ReconcileError::Create {
            kind,
            name: name.to_string(),
            source,
        })?;
    tracing::info!(kind, namespace, name, "created child");

    Ok(())
}

/// Converges the EventProvider identified by a work queue key.
pub struct Reconciler {
    lister: Arc<dyn Lister<EventProvider>>,
    downstream: DownstreamClients,
}

impl Reconciler {
    /// Creates a reconciler reading EventProviders from `lister`.
    pub fn new(lister: Arc<dyn Lister<EventProvider>>, downstream: DownstreamClients) -> Self {
        Self { lister, downstream }
    }

    /// Compares the actual state with the desired one and converges the two.
    pub async fn sync(&self, key: &str) -> Result<()> {
        let (namespace, name) = split_meta_namespace_key(key).map_err(|source| {
            ReconcileError::MalformedKey {
                key: key.to_string(),
                source,
            }
        })?;

        let ep = self
            .lister
            .get(namespace, name)
            .ok_or_else(|| ReconcileError::NotFound(key.to_string()))?;

        let provider: Provider = ep.spec.provider_name.parse()?;
        tracing::debug!(key, ?provider, "reconciling eventprovider");

        provider
            .strategy()
            .converge(namespace, &ep, &self.downstream)
            .await
    }
}

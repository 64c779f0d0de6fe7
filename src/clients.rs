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

//! Downstream resource clients for the child objects of an EventProvider.

use std::fmt::Debug;
use std::sync::Arc;

use async_trait::async_trait;
use k8s_openapi::NamespaceResourceScope;
use kube::api::PostParams;
use kube::runtime::reflector::Store;
use kube::{Api, Client, Resource, ResourceExt};
use serde::de::DeserializeOwned;
use serde::Serialize;
use thiserror::Error;

use crate::informer::Lister;

/// Field manager recorded on objects created by this controller.
pub const FIELD_MANAGER: &str = "eventprovider-controller";

/// Errors returned by a [`ResourceClient`].
#[derive(Error, Debug)]
pub enum ClientError {
    /// The API server rejected the request or could not be reached.
    #[error("kubernetes api request failed: {0}")]
    Api(#[from] kube::Error),
}

/// Typed access to one child resource kind.
///
/// `get` answers `Ok(None)` when the object does not exist; any other
/// failure is an error.
#[async_trait]
pub trait ResourceClient<K>: Send + Sync {
    /// Looks up an object by namespace and name.
    async fn get(&self, namespace: &str, name: &str) -> Result<Option<Arc<K>>, ClientError>;

    /// Creates the object in the namespace.
    async fn create(&self, namespace: &str, obj: &K) -> Result<K, ClientError>;
}

/// Reads from an informer mirror and writes through the API server.
pub struct KubeResourceClient<K>
where
    K: Resource + Clone + 'static,
    K::DynamicType: Eq + std::hash::Hash + Clone,
{
    client: Client,
    lister: Store<K>,
}

impl<K> KubeResourceClient<K>
where
    K: Resource + Clone + 'static,
    K::DynamicType: Eq + std::hash::Hash + Clone,
{
    /// Creates a client backed by the given mirror.
    pub fn new(client: Client, lister: Store<K>) -> Self {
        Self { client, lister }
    }
}

#[async_trait]
impl<K> ResourceClient<K> for KubeResourceClient<K>
where
    K: Resource<Scope = NamespaceResourceScope, DynamicType = ()>
        + Clone
        + DeserializeOwned
        + Serialize
        + Debug
        + Send
        + Sync
        + 'static,
{
    async fn get(&self, namespace: &str, name: &str) -> Result<Option<Arc<K>>, ClientError> {
        Ok(Lister::get(&self.lister, namespace, name))
    }

    async fn create(&self, namespace: &str, obj: &K) -> Result<K, ClientError> {
        let api: Api<K> = Api::namespaced(self.client.clone(), namespace);
        let params = PostParams {
            field_manager: Some(FIELD_MANAGER.to_string()),
            ..Default::default()
        };

        match api.create(&params, obj).await {
            Ok(created) => Ok(created),
            // The mirror may lag behind a create from a previous pass.
            Err(kube::Error::Api(response)) if response.code == 409 => {
                tracing::debug!(
                    kind = %K::kind(&()),
                    namespace,
                    name = %obj.name_any(),
                    "object already exists"
                );
                Ok(api.get(&obj.name_any()).await?)
            }
            Err(e) => Err(e.into()),
        }
    }
}

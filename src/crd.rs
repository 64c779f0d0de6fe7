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

//! The EventProvider custom resource.

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// API group of the EventProvider resource.
pub const GROUP_NAME: &str = "eventprovider.k8s.io";

/// Desired event ingestion pipeline.
///
/// The controller only reads this resource; it has no status.
#[derive(CustomResource, Deserialize, Serialize, Clone, Debug, Default, PartialEq, Eq, JsonSchema)]
#[kube(
    group = "eventprovider.k8s.io",
    version = "v1alpha1",
    kind = "EventProvider",
    plural = "eventproviders",
    shortname = "ep",
    namespaced
)]
#[serde(rename_all = "camelCase")]
pub struct EventProviderSpec {
    /// Selects the provider strategy, e.g. `eventgrid.azure.com`.
    pub provider_name: String,

    /// Event type filter, e.g. `Microsoft.Storage`.
    pub event_type: String,

    /// Storage account emitting the events.
    pub storage_account: String,

    /// Resource group of the storage account.
    pub resource_group: String,

    /// Name of a secret in the same namespace.
    #[serde(default)]
    pub secret: String,

    /// Public host receiving the events.
    pub host: String,

    /// Container image of the event receiver.
    pub host_image: String,
}

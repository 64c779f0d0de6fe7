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

//! Errors produced while reconciling a single EventProvider.

use thiserror::Error;

use crate::clients::ClientError;
use crate::eventgrid::ProviderError;
use crate::informer::KeyError;

/// Result type for reconciliation.
pub type Result<T, E = ReconcileError> = std::result::Result<T, E>;

/// Why a key failed to reconcile.
///
/// [`ReconcileError::is_retryable`] decides whether the key is requeued with
/// backoff or dropped until the next change notification.
#[derive(Error, Debug)]
pub enum ReconcileError {
    /// The queue key is not `namespace/name`.
    #[error("invalid resource key {key:?}: {source}")]
    MalformedKey {
        /// The offending key.
        key: String,
        /// Why the key did not split.
        #[source]
        source: KeyError,
    },

    /// No EventProvider with this key is in the mirror.
    #[error("eventprovider {0} not found in cache")]
    NotFound(String),

    /// `spec.providerName` names a provider this controller does not know.
    #[error("cannot handle provider {0:?}")]
    UnsupportedProvider(String),

    /// The provider does not emit the requested event type.
    #[error("provider {provider} can only handle {expected} events, got {actual:?}")]
    UnsupportedEventType {
        /// The provider handling the resource.
        provider: &'static str,
        /// The only event type it accepts.
        expected: &'static str,
        /// The event type the resource asked for.
        actual: String,
    },

    /// Looking up a child object failed.
    #[error("cannot get {kind} {name}: {source}")]
    Lookup {
        /// Kind of the child object.
        kind: &'static str,
        /// Name of the child object.
        name: String,
        /// The client failure.
        #[source]
        source: ClientError,
    },

    /// Creating a child object failed.
    #[error("cannot create {kind} {name}: {source}")]
    Create {
        /// Kind of the child object.
        kind: &'static str,
        /// Name of the child object.
        name: String,
        /// The client failure.
        #[source]
        source: ClientError,
    },

    /// The subscription existence check failed.
    #[error("cannot check event subscription {name}: {source}")]
    CheckSubscription {
        /// Name of the subscription.
        name: String,
        /// The provider failure.
        #[source]
        source: ProviderError,
    },

    /// Creating or updating the subscription failed.
    #[error("cannot create event subscription for storage account {storage_account}: {source}")]
    CreateSubscription {
        /// Storage account the subscription is scoped to.
        storage_account: String,
        /// The provider failure.
        #[source]
        source: ProviderError,
    },
}

impl ReconcileError {
    /// Returns false for errors that retrying cannot fix: malformed keys and
    /// unsupported provider configuration.
    pub fn is_retryable(&self) -> bool {
        !matches!(
            self,
            ReconcileError::MalformedKey { .. }
                | ReconcileError::UnsupportedProvider(_)
                | ReconcileError::UnsupportedEventType { .. }
        )
    }
}

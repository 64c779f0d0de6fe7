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

//! Event subscription provider backed by Azure Event Grid.
//!
//! Subscriptions are managed through the Azure Resource Manager REST API,
//! authenticated with a service principal (OAuth2 client credentials).

use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::{HeaderMap, LOCATION, RETRY_AFTER};
use reqwest::{Response, StatusCode};
use serde::Deserialize;
use serde_json::json;
use thiserror::Error;
use tokio::sync::Mutex;
use tokio::time::Instant;

use crate::config::{AzureConfig, AzureCredentials, ConfigError};

const AZURE_ASYNC_OPERATION: &str = "azure-asyncoperation";

/// Tokens are refreshed this long before they expire.
const TOKEN_EXPIRY_MARGIN: Duration = Duration::from_secs(60);

/// Errors returned by a [`SubscriptionProvider`].
#[derive(Error, Debug)]
pub enum ProviderError {
    /// The HTTP request could not be sent or its body could not be read.
    #[error("request failed: {0}")]
    Http(#[from] reqwest::Error),

    /// The token endpoint refused the service principal.
    #[error("cannot get service principal token: {0}")]
    Auth(String),

    /// The management API answered with a status the call does not expect.
    #[error("unexpected response {status}: {body}")]
    UnexpectedStatus {
        /// HTTP status code.
        status: u16,
        /// Response body, as returned.
        body: String,
    },

    /// A long-running operation finished without succeeding.
    #[error("operation {status}: {message}")]
    OperationFailed {
        /// Terminal operation status, such as `Failed` or `Canceled`.
        status: String,
        /// Error message reported by the operation.
        message: String,
    },

    /// A long-running operation was still in progress when polling gave up.
    #[error("operation did not finish within {0:?}")]
    Timeout(Duration),
}

/// Storage account a subscription is scoped to.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct StorageAccountScope {
    /// Resource group holding the storage account.
    pub resource_group: String,
    /// Storage account name.
    pub storage_account: String,
}

impl StorageAccountScope {
    /// Creates a scope for the storage account.
    pub fn new(resource_group: impl Into<String>, storage_account: impl Into<String>) -> Self {
        Self {
            resource_group: resource_group.into(),
            storage_account: storage_account.into(),
        }
    }

    /// Returns the ARM resource id of the storage account.
    pub fn resource_id(&self, subscription_id: &str) -> String {
        format!(
            "/subscriptions/{}/resourceGroups/{}/providers/Microsoft.Storage/storageAccounts/{}",
            subscription_id, self.resource_group, self.storage_account
        )
    }
}

/// Name of the subscription registered for a storage account.
pub fn subscription_name(storage_account: &str) -> String {
    format!("{}eventsubscription", storage_account)
}

/// Webhook endpoint URL for a target host. `https` is assumed when the host
/// carries no scheme.
pub fn endpoint_url(target_host: &str) -> String {
    if target_host.contains("://") {
        target_host.to_string()
    } else {
        format!("https://{}", target_host)
    }
}

/// External registry of event subscriptions.
///
/// Both calls may block until a remote long-running operation completes.
#[async_trait]
pub trait SubscriptionProvider: Send + Sync {
    /// Returns whether the named subscription exists on the scope.
    async fn check_subscription(
        &self,
        scope: &StorageAccountScope,
        name: &str,
    ) -> Result<bool, ProviderError>;

    /// Creates or updates the storage account's subscription so it delivers
    /// to the target host.
    async fn create_or_update_subscription(
        &self,
        resource_group: &str,
        storage_account: &str,
        target_host: &str,
    ) -> Result<(), ProviderError>;
}

struct CachedToken {
    access_token: String,
    expires_at: Instant,
}

#[derive(Deserialize)]
struct TokenResponse {
    access_token: String,
    /// Seconds; the v1 endpoint sends this as a string.
    #[serde(default)]
    expires_in: serde_json::Value,
}

impl TokenResponse {
    fn expires_in(&self) -> Duration {
        let seconds = match &self.expires_in {
            serde_json::Value::Number(n) => n.as_u64(),
            serde_json::Value::String(s) => s.parse().ok(),
            _ => None,
        };
        Duration::from_secs(seconds.unwrap_or(0))
    }
}

#[derive(Deserialize)]
struct AsyncOperationStatus {
    status: String,
    #[serde(default)]
    error: Option<AsyncOperationError>,
}

#[derive(Deserialize)]
struct AsyncOperationError {
    #[serde(default)]
    message: String,
}

/// [`SubscriptionProvider`] talking to Azure Resource Manager.
pub struct EventGridClient {
    http: reqwest::Client,
    config: AzureConfig,
    credentials: AzureCredentials,
    token: Mutex<Option<CachedToken>>,
}

impl EventGridClient {
    /// Creates a client, failing if credentials are missing.
    pub fn new(config: AzureConfig) -> Result<Self, ConfigError> {
        let credentials = config.credentials()?;
        Ok(Self {
            http: reqwest::Client::new(),
            config,
            credentials,
            token: Mutex::new(None),
        })
    }

    fn subscription_url(&self, scope: &StorageAccountScope, name: &str) -> String {
        format!(
            "{}{}/providers/Microsoft.EventGrid/eventSubscriptions/{}?api-version={}",
            self.config.resource_manager_endpoint.trim_end_matches('/'),
            scope.resource_id(&self.credentials.subscription_id),
            name,
            self.config.api_version
        )
    }

    async fn access_token(&self) -> Result<String, ProviderError> {
        let mut cached = self.token.lock().await;
        if let Some(token) = cached.as_ref() {
            if Instant::now() + TOKEN_EXPIRY_MARGIN < token.expires_at {
                return Ok(token.access_token.clone());
            }
        }

        let url = format!(
            "{}/{}/oauth2/token",
            self.config.active_directory_endpoint.trim_end_matches('/'),
            self.credentials.tenant_id
        );
        let response = self
            .http
            .post(&url)
            .form(&[
                ("grant_type", "client_credentials"),
                ("client_id", self.credentials.client_id.as_str()),
                ("client_secret", self.credentials.client_secret.as_str()),
                ("resource", self.config.resource_manager_endpoint.as_str()),
            ])
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(ProviderError::Auth(format!("{}: {}", status, body)));
        }

        let token: TokenResponse = response.json().await?;
        let access_token = token.access_token.clone();
        *cached = Some(CachedToken {
            expires_at: Instant::now() + token.expires_in(),
            access_token: token.access_token,
        });
        tracing::debug!("acquired resource manager token");

        Ok(access_token)
    }

    fn retry_after(&self, headers: &HeaderMap) -> Duration {
        headers
            .get(RETRY_AFTER)
            .and_then(|value| value.to_str().ok())
            .and_then(|value| value.parse::<u64>().ok())
            .map(Duration::from_secs)
            .unwrap_or(self.config.poll_interval)
    }

    /// Follows an ARM long-running operation until it reaches a terminal state.
    async fn wait_for_completion(&self, response: Response) -> Result<(), ProviderError> {
        let headers = response.headers().clone();

        if let Some(url) = header_str(&headers, AZURE_ASYNC_OPERATION) {
            let mut delay = self.retry_after(&headers);
            loop {
                tokio::time::sleep(delay).await;
                let token = self.access_token().await?;
                let response = self.http.get(&url).bearer_auth(token).send().await?;
                let response = expect_success(response).await?;
                delay = self.retry_after(response.headers());

                let operation: AsyncOperationStatus = response.json().await?;
                match operation.status.as_str() {
                    "Succeeded" => return Ok(()),
                    "Failed" | "Canceled" => {
                        return Err(ProviderError::OperationFailed {
                            status: operation.status,
                            message: operation.error.map(|e| e.message).unwrap_or_default(),
                        })
                    }
                    status => tracing::debug!(status, "waiting for event subscription operation"),
                }
            }
        }

        if response.status() == StatusCode::ACCEPTED {
            if let Some(url) = header_str(&headers, LOCATION.as_str()) {
                let mut delay = self.retry_after(&headers);
                loop {
                    tokio::time::sleep(delay).await;
                    let token = self.access_token().await?;
                    let response = self.http.get(&url).bearer_auth(token).send().await?;
                    if response.status() != StatusCode::ACCEPTED {
                        expect_success(response).await?;
                        return Ok(());
                    }
                    delay = self.retry_after(response.headers());
                }
            }
        }

        Ok(())
    }
}

fn header_str(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get(name)
        .and_then(|value| value.to_str().ok())
        .map(str::to_string)
}

async fn expect_success(response: Response) -> Result<Response, ProviderError> {
    if response.status().is_success() {
        return Ok(response);
    }
    let status = response.status().as_u16();
    let body = response.text().await.unwrap_or_default();
    Err(ProviderError::UnexpectedStatus { status, body })
}

#[async_trait]
impl SubscriptionProvider for EventGridClient {
    async fn check_subscription(
        &self,
        scope: &StorageAccountScope,
        name: &str,
    ) -> Result<bool, ProviderError> {
        let token = self.access_token().await?;
        let response = self
            .http
            .get(self.subscription_url(scope, name))
            .bearer_auth(token)
            .send()
            .await?;

        if response.status() == StatusCode::NOT_FOUND {
            return Ok(false);
        }
        expect_success(response).await?;
        Ok(true)
    }

    async fn create_or_update_subscription(
        &self,
        resource_group: &str,
        storage_account: &str,
        target_host: &str,
    ) -> Result<(), ProviderError> {
        let scope = StorageAccountScope::new(resource_group, storage_account);
        let name = subscription_name(storage_account);
        let body = json!({
            "properties": {
                "destination": {
                    "endpointType": "WebHook",
                    "properties": {
                        "endpointUrl": endpoint_url(target_host),
                    },
                },
            },
        });

        tracing::info!(subscription = %name, storage_account, "creating event subscription");

        let token = self.access_token().await?;
        let response = self
            .http
            .put(self.subscription_url(&scope, &name))
            .bearer_auth(token)
            .json(&body)
            .send()
            .await?;
        let response = expect_success(response).await?;

        let timeout = self.config.operation_timeout;
        tokio::time::timeout(timeout, self.wait_for_completion(response))
            .await
            .map_err(|_| ProviderError::Timeout(timeout))?
    }
}

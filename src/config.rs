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

//! Configuration structures for the eventprovider controller.

use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors found while validating a configuration.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    /// A required setting was not provided.
    #[error("missing required setting {0}")]
    Missing(&'static str),

    /// A setting was provided with an unusable value.
    #[error("invalid setting {name}: {reason}")]
    Invalid {
        /// The setting's name.
        name: &'static str,
        /// Why the value was rejected.
        reason: String,
    },
}

/// Main configuration for the controller.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ControllerConfig {
    /// Settings shared by every component.
    #[serde(default)]
    pub generic: GenericConfig,

    /// Work queue retry settings.
    #[serde(default)]
    pub workqueue: WorkQueueConfig,

    /// Azure credentials and endpoints for the Event Grid provider.
    #[serde(default)]
    pub azure: AzureConfig,
}

impl ControllerConfig {
    /// Checks settings that serde cannot express.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.generic.workers == 0 {
            return Err(ConfigError::Invalid {
                name: "generic.workers",
                reason: "at least one worker is required".to_string(),
            });
        }
        if self.workqueue.base_delay > self.workqueue.max_delay {
            return Err(ConfigError::Invalid {
                name: "workqueue.baseDelay",
                reason: "must not exceed workqueue.maxDelay".to_string(),
            });
        }
        Ok(())
    }
}

/// Generic configuration applicable to the whole process.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GenericConfig {
    /// Kubeconfig file for talking to the apiserver.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub kubeconfig: Option<PathBuf>,

    /// Namespace to watch. All namespaces when unset.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,

    /// Number of parallel reconciliation workers.
    #[serde(default = "default_workers")]
    pub workers: usize,

    /// Base period between full informer resyncs. Jittered per resync.
    #[serde(default = "default_resync_period", with = "humantime_serde")]
    pub resync_period: Duration,

    /// Maximum time to wait for informer caches to sync. Zero waits until shutdown.
    #[serde(default = "default_cache_sync_timeout", with = "humantime_serde")]
    pub cache_sync_timeout: Duration,

    /// The maximum time to wait for controllers to stop.
    #[serde(default = "default_shutdown_timeout", with = "humantime_serde")]
    pub shutdown_timeout: Duration,

    /// The address of the health check server.
    #[serde(default = "default_bind_address")]
    pub healthz_bind_address: String,

    /// Port for the health check server.
    #[serde(default = "default_healthz_port")]
    pub healthz_bind_port: u16,
}

impl Default for GenericConfig {
    fn default() -> Self {
        Self {
            kubeconfig: None,
            namespace: None,
            workers: default_workers(),
            resync_period: default_resync_period(),
            cache_sync_timeout: default_cache_sync_timeout(),
            shutdown_timeout: default_shutdown_timeout(),
            healthz_bind_address: default_bind_address(),
            healthz_bind_port: default_healthz_port(),
        }
    }
}

fn default_workers() -> usize {
    2
}

fn default_resync_period() -> Duration {
    Duration::from_secs(30)
}

fn default_cache_sync_timeout() -> Duration {
    Duration::from_secs(2 * 60)
}

fn default_shutdown_timeout() -> Duration {
    Duration::from_secs(30)
}

fn default_bind_address() -> String {
    "0.0.0.0".to_string()
}

fn default_healthz_port() -> u16 {
    10258
}

/// Retry behavior of the work queue.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkQueueConfig {
    /// Delay before the first retry of a failing key.
    #[serde(default = "default_base_delay", with = "humantime_serde")]
    pub base_delay: Duration,

    /// Upper bound of the retry delay.
    #[serde(default = "default_max_delay", with = "humantime_serde")]
    pub max_delay: Duration,
}

impl Default for WorkQueueConfig {
    fn default() -> Self {
        Self {
            base_delay: default_base_delay(),
            max_delay: default_max_delay(),
        }
    }
}

fn default_base_delay() -> Duration {
    crate::workqueue::DEFAULT_BASE_DELAY
}

fn default_max_delay() -> Duration {
    crate::workqueue::DEFAULT_MAX_DELAY
}

/// Azure settings used by the Event Grid subscription provider.
#[derive(Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AzureConfig {
    /// Azure subscription owning the storage accounts.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub subscription_id: Option<String>,

    /// Active Directory tenant of the service principal.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tenant_id: Option<String>,

    /// Service principal application id.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub client_id: Option<String>,

    /// Service principal secret. Never serialized.
    #[serde(default, skip_serializing)]
    pub client_secret: Option<String>,

    /// OAuth authority used to obtain management tokens.
    #[serde(default = "default_active_directory_endpoint")]
    pub active_directory_endpoint: String,

    /// Azure Resource Manager base URL, also the token audience.
    #[serde(default = "default_resource_manager_endpoint")]
    pub resource_manager_endpoint: String,

    /// Event Grid management API version.
    #[serde(default = "default_api_version")]
    pub api_version: String,

    /// Interval between polls of a long-running operation when the service
    /// does not send `Retry-After`.
    #[serde(default = "default_poll_interval", with = "humantime_serde")]
    pub poll_interval: Duration,

    /// Maximum time to wait for a long-running operation to finish.
    #[serde(default = "default_operation_timeout", with = "humantime_serde")]
    pub operation_timeout: Duration,
}

impl Default for AzureConfig {
    fn default() -> Self {
        Self {
            subscription_id: None,
            tenant_id: None,
            client_id: None,
            client_secret: None,
            active_directory_endpoint: default_active_directory_endpoint(),
            resource_manager_endpoint: default_resource_manager_endpoint(),
            api_version: default_api_version(),
            poll_interval: default_poll_interval(),
            operation_timeout: default_operation_timeout(),
        }
    }
}

impl fmt::Debug for AzureConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AzureConfig")
            .field("subscription_id", &self.subscription_id)
            .field("tenant_id", &self.tenant_id)
            .field("client_id", &self.client_id)
            .field("client_secret", &self.client_secret.as_ref().map(|_| "<redacted>"))
            .field("active_directory_endpoint", &self.active_directory_endpoint)
            .field("resource_manager_endpoint", &self.resource_manager_endpoint)
            .field("api_version", &self.api_version)
            .field("poll_interval", &self.poll_interval)
            .field("operation_timeout", &self.operation_timeout)
            .finish()
    }
}

/// Service principal credentials resolved from an [`AzureConfig`].
#[derive(Clone)]
pub struct AzureCredentials {
    /// Azure subscription owning the storage accounts.
    pub subscription_id: String,
    /// Active Directory tenant of the service principal.
    pub tenant_id: String,
    /// Service principal application id.
    pub client_id: String,
    /// Service principal secret.
    pub client_secret: String,
}

impl fmt::Debug for AzureCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AzureCredentials")
            .field("subscription_id", &self.subscription_id)
            .field("tenant_id", &self.tenant_id)
            .field("client_id", &self.client_id)
            .finish_non_exhaustive()
    }
}

impl AzureConfig {
    /// Returns the credentials, failing on the first missing one.
    pub fn credentials(&self) -> Result<AzureCredentials, ConfigError> {
        fn required(value: &Option<String>, name: &'static str) -> Result<String, ConfigError> {
            match value {
                Some(value) if !value.is_empty() => Ok(value.clone()),
                _ => Err(ConfigError::Missing(name)),
            }
        }

        Ok(AzureCredentials {
            subscription_id: required(&self.subscription_id, "azure.subscriptionId")?,
            tenant_id: required(&self.tenant_id, "azure.tenantId")?,
            client_id: required(&self.client_id, "azure.clientId")?,
            client_secret: required(&self.client_secret, "azure.clientSecret")?,
        })
    }
}

fn default_active_directory_endpoint() -> String {
    "https://login.microsoftonline.com/".to_string()
}

fn default_resource_manager_endpoint() -> String {
    "https://management.azure.com/".to_string()
}

fn default_api_version() -> String {
    "2018-01-01".to_string()
}

fn default_poll_interval() -> Duration {
    Duration::from_secs(5)
}

fn default_operation_timeout() -> Duration {
    Duration::from_secs(10 * 60)
}

/// Module for duration serialization/deserialization with human-readable format.
mod humantime_serde {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&humantime::format_duration(*duration).to_string())
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        humantime::parse_duration(&s).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = ControllerConfig::default();
        assert_eq!(config.generic.workers, 2);
        assert_eq!(config.generic.resync_period, Duration::from_secs(30));
        assert_eq!(config.workqueue.base_delay, Duration::from_millis(5));
        assert_eq!(config.workqueue.max_delay, Duration::from_secs(1000));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_deserialize_config() {
        let yaml = r#"
generic:
  namespace: events
  workers: 4
  resyncPeriod: 1m
  shutdownTimeout: 60s
workqueue:
  baseDelay: 10ms
azure:
  subscriptionId: sub
  tenantId: tenant
  clientId: client
  clientSecret: secret
"#;

        let config: ControllerConfig = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(config.generic.namespace.as_deref(), Some("events"));
        assert_eq!(config.generic.workers, 4);
        assert_eq!(config.generic.resync_period, Duration::from_secs(60));
        assert_eq!(config.workqueue.base_delay, Duration::from_millis(10));
        assert_eq!(config.workqueue.max_delay, Duration::from_secs(1000));

        let credentials = config.azure.credentials().unwrap();
        assert_eq!(credentials.subscription_id, "sub");
        assert_eq!(credentials.client_secret, "secret");
    }

    #[test]
    fn test_missing_credentials() {
        let mut azure = AzureConfig {
            subscription_id: Some("sub".to_string()),
            tenant_id: Some("tenant".to_string()),
            client_id: Some(String::new()),
            ..Default::default()
        };
        assert_eq!(
            azure.credentials().unwrap_err(),
            ConfigError::Missing("azure.clientId")
        );

        azure.client_id = Some("client".to_string());
        assert_eq!(
            azure.credentials().unwrap_err(),
            ConfigError::Missing("azure.clientSecret")
        );
    }

    #[test]
    fn test_secret_is_not_serialized_or_logged() {
        let azure = AzureConfig {
            client_secret: Some("hunter2".to_string()),
            ..Default::default()
        };
        let yaml = serde_yaml::to_string(&azure).unwrap();
        assert!(!yaml.contains("hunter2"));
        assert!(!format!("{:?}", azure).contains("hunter2"));
    }

    #[test]
    fn test_validate_rejects_zero_workers() {
        let mut config = ControllerConfig::default();
        config.generic.workers = 0;
        assert!(matches!(
            config.validate(),
            Err(ConfigError::Invalid { name: "generic.workers", .. })
        ));
    }
}

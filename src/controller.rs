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

//! Core controller traits and types.
//!
//! This module defines the interface the controller manager runs.

use std::future::Future;
use std::pin::Pin;

use async_trait::async_trait;
use thiserror::Error;

pub use tokio_util::sync::CancellationToken;

use crate::controller_context::ControllerContext;

/// Errors that can occur when running a controller.
#[derive(Error, Debug)]
pub enum ControllerError {
    /// The informer caches did not sync before shutdown or the sync timeout.
    #[error("controller {0} timed out waiting for informer caches to sync")]
    CacheSyncFailed(String),

    /// The controller failed while running.
    #[error("controller {name} runtime error: {source}")]
    Runtime {
        /// Name of the failing controller.
        name: String,
        /// The underlying failure.
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    /// The controller was built with settings it cannot run with.
    #[error("invalid configuration for controller {name}: {reason}")]
    InvalidConfig {
        /// Name of the misconfigured controller.
        name: String,
        /// What is wrong with the settings.
        reason: String,
    },
}

/// Result type for controller operations.
pub type Result<T> = std::result::Result<T, ControllerError>;

/// The base trait of everything the controller manager runs.
///
/// A controller watches the shared state of the cluster through the apiserver
/// and makes changes attempting to move the current state towards the desired state.
///
/// # Lifecycle
///
/// 1. The controller is built from a [`ControllerContext`] and registered
///    with the controller manager
/// 2. [`Controller::run`] is called with a cancellation token
/// 3. The controller runs until the token is cancelled or an error occurs
/// 4. [`Controller::shutdown`] is called to clean up resources
#[async_trait]
pub trait Controller: Send + Sync + 'static {
    /// Returns the canonical name of this controller.
    ///
    /// Used in logs and health check paths.
    fn name(&self) -> &str;

    /// Runs the controller's main loop.
    ///
    /// This method should block until:
    /// - The cancellation token is triggered
    /// - A fatal error occurs
    ///
    /// When the token is cancelled, the controller should gracefully shut down
    /// and return `Ok(())`.
    async fn run(&self, ctx: ControllerContext, cancel: CancellationToken) -> Result<()>;

    /// Optional health check for the controller.
    ///
    /// The default implementation always returns `true`.
    fn health_check(&self) -> Pin<Box<dyn Future<Output = bool> + Send + '_>> {
        Box::pin(async { true })
    }

    /// Optional graceful shutdown hook, called after [`Controller::run`]
    /// returns.
    fn shutdown(&self) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>> {
        Box::pin(async { Ok(()) })
    }

    /// Returns the number of workers this controller uses. The default is 1.
    fn worker_count(&self) -> usize {
        1
    }
}

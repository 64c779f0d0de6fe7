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

//! eventprovider-controller - converges EventProvider resources into event
//! ingestion pipelines.
//!
//! This library provides:
//! - The `EventProvider` custom resource
//! - A shared informer factory and a rate-limited work queue
//! - The EventProvider controller and its reconciler
//! - The Azure Event Grid subscription provider
//! - Controller manager, configuration and health checks

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod clients;
pub mod config;
pub mod controller;
pub mod controller_context;
pub mod controller_manager;
pub mod crd;
pub mod eventgrid;
pub mod eventprovider;
pub mod health;
pub mod informer;
pub mod workqueue;

// Re-export commonly used types
pub use config::ControllerConfig;
pub use controller::{Controller, ControllerError};
pub use controller_context::{ControllerContext, InformerFactory};
pub use controller_manager::ControllerManager;
pub use crd::{EventProvider, EventProviderSpec};
pub use eventprovider::{EventProviderController, ReconcileError, Reconciler};
pub use workqueue::WorkQueue;

/// Semantic version of this crate.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

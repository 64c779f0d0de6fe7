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

//! Controller manager - the main orchestrator.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use crate::config::ControllerConfig;
use crate::controller::{Controller, ControllerError, Result};
use crate::controller_context::ControllerContext;
use crate::health::{FunctionHealthChecker, HealthRegistry, HealthServer};

/// The controller manager.
///
/// This is the main orchestrator that:
/// 1. Provides shared resources (client, informers, config)
/// 2. Starts the informers, then every registered controller
/// 3. Handles graceful shutdown
///
/// Controllers gate their workers on informer sync themselves, so the
/// manager starts informers before running them.
pub struct ControllerManager {
    /// Configuration for this instance.
    config: Arc<ControllerConfig>,

    /// Context shared with every controller.
    ctx: ControllerContext,

    /// Registered controllers.
    controllers: Vec<Arc<dyn Controller>>,

    /// Checks served by the health server.
    health: HealthRegistry,

    /// Root cancellation token for shutdown.
    shutdown_token: CancellationToken,

    /// Controllers that are currently running.
    running_controllers: Arc<tokio::sync::RwLock<HashSet<String>>>,
}

impl ControllerManager {
    /// Creates a new controller manager.
    pub fn new(config: ControllerConfig, client: kube::Client) -> Self {
        let config = Arc::new(config);
        let ctx = ControllerContext::from_config(client, config.clone());

        Self {
            config,
            ctx,
            controllers: Vec::new(),
            health: HealthRegistry::new(),
            shutdown_token: CancellationToken::new(),
            running_controllers: Arc::new(tokio::sync::RwLock::new(HashSet::new())),
        }
    }

    /// Returns the context controllers are built from.
    pub fn context(&self) -> &ControllerContext {
        &self.ctx
    }

    /// Adds a controller to run.
    pub fn register_controller(&mut self, controller: Arc<dyn Controller>) -> &mut Self {
        tracing::debug!(controller = %controller.name(), "registered controller");
        self.controllers.push(controller);
        self
    }

    /// Returns the shutdown cancellation token.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown_token.clone()
    }

    /// Returns the checks served on the readiness endpoints.
    pub fn health_registry(&self) -> &HealthRegistry {
        &self.health
    }

    /// Runs the controller manager.
    ///
    /// This will:
    /// 1. Start the health server
    /// 2. Start the informers
    /// 3. Run all controllers concurrently
    /// 4. Wait for shutdown signal or errors, then stop the informers
    pub async fn run(&self) -> Result<()> {
        tracing::info!("starting eventprovider controller manager");

        if self.controllers.is_empty() {
            tracing::warn!("no controllers registered, exiting");
            return Ok(());
        }

        self.register_health_checks().await;

        let background = self.shutdown_token.child_token();
        let health_server = HealthServer::new(
            self.health.clone(),
            self.config.generic.healthz_bind_address.clone(),
            self.config.generic.healthz_bind_port,
        )
        .spawn(background.clone());

        self.ctx.informer_factory.start(&background);

        let result = self.run_controllers().await;

        background.cancel();
        self.ctx.informer_factory.shutdown().await;
        match health_server.await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => tracing::error!(error = %e, "health server failed"),
            Err(e) => tracing::error!(error = %e, "health server task failed"),
        }

        result
    }

    async fn register_health_checks(&self) {
        let factory = self.ctx.informer_factory.clone();
        self.health
            .register(Arc::new(FunctionHealthChecker::new("informers", move || {
                let factory = factory.clone();
                async move { factory.has_synced() }
            })))
            .await;

        for controller in &self.controllers {
            let checked = controller.clone();
            self.health
                .register(Arc::new(FunctionHealthChecker::new(
                    controller.name(),
                    move || {
                        let controller = checked.clone();
                        async move { controller.health_check().await }
                    },
                )))
                .await;
        }
    }

    /// Runs all controllers concurrently.
    async fn run_controllers(&self) -> Result<()> {
        let mut join_set = JoinSet::new();

        for controller in &self.controllers {
            let controller = controller.clone();
            let name = controller.name().to_string();
            let ctx = self.ctx.clone();
            let cancel = self.shutdown_token.clone();
            let running = self.running_controllers.clone();

            join_set.spawn(async move {
                tracing::info!(
                    controller = %name,
                    workers = controller.worker_count(),
                    "starting controller"
                );
                running.write().await.insert(name.clone());

                let result = controller.run(ctx, cancel).await;

                running.write().await.remove(&name);

                if let Err(e) = controller.shutdown().await {
                    tracing::warn!(controller = %name, error = %e, "controller shutdown hook failed");
                }

                match &result {
                    Ok(()) => {
                        tracing::info!(controller = %name, "controller terminated successfully");
                    }
                    Err(e) => {
                        tracing::error!(controller = %name, error = %e, "controller terminated with error");
                    }
                }

                (name, result)
            });
        }

        let mut failure = None;

        tokio::select! {
            result = async {
                while let Some(result) = join_set.join_next().await {
                    match result {
                        Ok((name, Ok(()))) => {
                            tracing::debug!(controller = %name, "controller finished");
                        }
                        Ok((_, Err(e))) => return Err(e),
                        Err(e) => {
                            if e.is_panic() {
                                tracing::error!("controller task panicked");
                            }
                            return Err(ControllerError::Runtime {
                                name: "unknown".to_string(),
                                source: e.into(),
                            });
                        }
                    }
                }
                Ok(())
            } => {
                if let Err(e) = result {
                    // One failed controller stops the rest.
                    self.shutdown_token.cancel();
                    failure = Some(e);
                }
            }

            _ = self.shutdown_token.cancelled() => {
                tracing::info!("shutdown signal received, waiting for controllers to stop");
            }
        }

        self.drain(&mut join_set).await;

        match failure {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Waits for the remaining controllers, up to the shutdown timeout.
    async fn drain(&self, join_set: &mut JoinSet<(String, Result<()>)>) {
        let shutdown_timeout = self.config.generic.shutdown_timeout;
        let deadline = tokio::time::Instant::now() + shutdown_timeout;

        while !join_set.is_empty() {
            let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());

            if remaining.is_zero() {
                let running = self.running_controllers.read().await;
                if !running.is_empty() {
                    tracing::warn!(
                        controllers = ?running.iter().collect::<Vec<_>>(),
                        "shutdown timeout reached, controllers still running"
                    );
                }
                join_set.abort_all();
                break;
            }

            tokio::select! {
                result = join_set.join_next() => {
                    match result {
                        Some(Ok((name, Ok(())))) => {
                            tracing::debug!(controller = %name, "controller stopped");
                        }
                        Some(Ok((name, Err(e)))) => {
                            tracing::warn!(controller = %name, error = %e, "controller stopped with error");
                        }
                        Some(Err(e)) => {
                            tracing::warn!(error = %e, "controller task failed");
                        }
                        None => break,
                    }
                }
                _ = tokio::time::sleep(remaining.min(Duration::from_secs(1))) => {
                    let running = self.running_controllers.read().await;
                    if !running.is_empty() {
                        tracing::debug!(
                            controllers = ?running.iter().collect::<Vec<_>>(),
                            "still waiting for controllers"
                        );
                    }
                }
            }
        }
    }

    /// Initiates a graceful shutdown.
    pub fn shutdown(&self) {
        tracing::info!("initiating graceful shutdown");
        self.shutdown_token.cancel();
    }
}

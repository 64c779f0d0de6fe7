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

//! Health check support.
//!
//! `/healthz` answers as long as the process serves requests.
//! `/healthz/ready` and `/healthz/deep` run the registered checkers, which
//! include the informer sync gate.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use http_body_util::Full;
use hyper::body::{Bytes, Incoming};
use hyper::http::StatusCode;
use hyper::service::service_fn;
use hyper::{Request, Response};
use hyper_util::rt::TokioIo;
use serde::Serialize;
use tokio::net::TcpListener;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;

/// Boxed future for health checks.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Health check status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    /// The component is healthy.
    Healthy,
    /// The component is unhealthy.
    Unhealthy,
}

impl From<bool> for HealthStatus {
    fn from(healthy: bool) -> Self {
        if healthy {
            HealthStatus::Healthy
        } else {
            HealthStatus::Unhealthy
        }
    }
}

/// Health check result.
#[derive(Debug, Clone, Serialize)]
pub struct HealthCheck {
    /// The overall health status.
    pub status: HealthStatus,

    /// Individual component health.
    #[serde(skip_serializing_if = "HashMap::is_empty")]
    pub checks: HashMap<String, HealthStatus>,
}

/// Components implement this trait to take part in readiness.
pub trait HealthChecker: Send + Sync + 'static {
    /// Returns `true` if the component is healthy.
    fn check(&self) -> BoxFuture<'_, bool>;

    /// Returns the name of this checker.
    fn name(&self) -> &str;
}

/// Adapter for implementing [`HealthChecker`] with a function.
pub struct FunctionHealthChecker<F, Fut>
where
    F: Fn() -> Fut + Send + Sync,
    Fut: Future<Output = bool> + Send,
{
    name: String,
    check_fn: F,
}

impl<F, Fut> FunctionHealthChecker<F, Fut>
where
    F: Fn() -> Fut + Send + Sync,
    Fut: Future<Output = bool> + Send,
{
    /// Creates a new function-based health checker.
    pub fn new(name: impl Into<String>, check_fn: F) -> Self {
        Self {
            name: name.into(),
            check_fn,
        }
    }
}

impl<F, Fut> HealthChecker for FunctionHealthChecker<F, Fut>
where
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = bool> + Send + 'static,
{
    fn check(&self) -> BoxFuture<'_, bool> {
        Box::pin((self.check_fn)())
    }

    fn name(&self) -> &str {
        &self.name
    }
}

/// Health check registry.
#[derive(Clone, Default)]
pub struct HealthRegistry {
    checkers: Arc<RwLock<Vec<Arc<dyn HealthChecker>>>>,
}

impl HealthRegistry {
    /// Creates a new empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a health checker.
    pub async fn register(&self, checker: Arc<dyn HealthChecker>) {
        self.checkers.write().await.push(checker);
    }

    /// Runs all health checks and returns the results.
    pub async fn check_all(&self) -> HealthCheck {
        let checkers = self.checkers.read().await;
        let mut checks = HashMap::new();
        let mut overall_healthy = true;

        for checker in checkers.iter() {
            let healthy = checker.check().await;
            overall_healthy &= healthy;
            checks.insert(checker.name().to_string(), healthy.into());
        }

        HealthCheck {
            status: overall_healthy.into(),
            checks,
        }
    }

    /// Returns the number of registered checkers.
    pub async fn len(&self) -> usize {
        self.checkers.read().await.len()
    }

    /// Returns true if there are no registered checkers.
    pub async fn is_empty(&self) -> bool {
        self.checkers.read().await.is_empty()
    }
}

/// Health check server.
pub struct HealthServer {
    registry: HealthRegistry,
    bind_address: String,
    bind_port: u16,
}

impl HealthServer {
    /// Creates a health server answering from `registry`.
    pub fn new(registry: HealthRegistry, bind_address: String, bind_port: u16) -> Self {
        Self {
            registry,
            bind_address,
            bind_port,
        }
    }

    /// Serves health endpoints until the token is cancelled.
    pub async fn run(self, cancel: CancellationToken) -> anyhow::Result<()> {
        let addr = format!("{}:{}", self.bind_address, self.bind_port);
        let listener = TcpListener::bind(&addr).await?;

        tracing::info!(%addr, "health server listening");

        loop {
            let (stream, _) = tokio::select! {
                _ = cancel.cancelled() => {
                    tracing::debug!("health server stopping");
                    return Ok(());
                }
                accepted = listener.accept() => accepted?,
            };
            let registry = self.registry.clone();
            let io = TokioIo::new(stream);

            tokio::task::spawn(async move {
                let http = hyper::server::conn::http1::Builder::new();
                let service = service_fn(move |req: Request<Incoming>| {
                    handle_request(req, registry.clone())
                });

                if let Err(e) = http.serve_connection(io, service).await {
                    tracing::debug!(error = %e, "health connection closed with error");
                }
            });
        }
    }

    /// Runs the health server in a background task.
    pub fn spawn(self, cancel: CancellationToken) -> tokio::task::JoinHandle<anyhow::Result<()>> {
        tokio::spawn(self.run(cancel))
    }
}

fn respond(
    status: StatusCode,
    content_type: &'static str,
    body: impl Into<Bytes>,
) -> Response<Full<Bytes>> {
    let mut response = Response::new(Full::new(body.into()));
    *response.status_mut() = status;
    response.headers_mut().insert(
        hyper::header::CONTENT_TYPE,
        hyper::header::HeaderValue::from_static(content_type),
    );
    response
}

fn status_code(status: HealthStatus) -> StatusCode {
    match status {
        HealthStatus::Healthy => StatusCode::OK,
        HealthStatus::Unhealthy => StatusCode::SERVICE_UNAVAILABLE,
    }
}

async fn handle_request(
    req: Request<Incoming>,
    registry: HealthRegistry,
) -> Result<Response<Full<Bytes>>, hyper::Error> {
    let path = req.uri().path().to_owned();
    Ok(route(&path, &registry).await)
}

async fn route(path: &str, registry: &HealthRegistry) -> Response<Full<Bytes>> {
    match path {
        "/healthz" | "/healthz/live" => respond(StatusCode::OK, "text/plain", "ok"),
        "/healthz/ready" => {
            let result = registry.check_all().await;
            let body = match result.status {
                HealthStatus::Healthy => "ok",
                HealthStatus::Unhealthy => "not ready",
            };
            respond(status_code(result.status), "text/plain", body)
        }
        "/healthz/deep" => {
            let result = registry.check_all().await;
            let json = serde_json::to_string(&result).unwrap_or_default();
            respond(status_code(result.status), "application/json", json)
        }
        _ => respond(StatusCode::NOT_FOUND, "text/plain", "not found"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::sync::atomic::{AtomicBool, Ordering};

    #[tokio::test]
    async fn test_health_registry() {
        let registry = HealthRegistry::new();

        let checker = FunctionHealthChecker::new("test", || async { true });
        registry.register(Arc::new(checker)).await;

        assert_eq!(registry.len().await, 1);
        assert!(!registry.is_empty().await);

        let result = registry.check_all().await;
        assert_eq!(result.status, HealthStatus::Healthy);
        assert_eq!(result.checks.get("test"), Some(&HealthStatus::Healthy));
    }

    #[tokio::test]
    async fn test_unhealthy_checker() {
        let registry = HealthRegistry::new();

        let checker = FunctionHealthChecker::new("failing", || async { false });
        registry.register(Arc::new(checker)).await;

        let result = registry.check_all().await;
        assert_eq!(result.status, HealthStatus::Unhealthy);
        assert_eq!(result.checks.get("failing"), Some(&HealthStatus::Unhealthy));
    }

    #[tokio::test]
    async fn test_readiness_follows_checkers() {
        let registry = HealthRegistry::new();
        let synced = Arc::new(AtomicBool::new(false));
        let flag = synced.clone();
        registry
            .register(Arc::new(FunctionHealthChecker::new("informers", move || {
                let flag = flag.clone();
                async move { flag.load(Ordering::SeqCst) }
            })))
            .await;

        assert_eq!(route("/healthz", &registry).await.status(), StatusCode::OK);
        assert_eq!(
            route("/healthz/ready", &registry).await.status(),
            StatusCode::SERVICE_UNAVAILABLE
        );

        synced.store(true, Ordering::SeqCst);
        assert_eq!(route("/healthz/ready", &registry).await.status(), StatusCode::OK);
        assert_eq!(route("/healthz/deep", &registry).await.status(), StatusCode::OK);
        assert_eq!(route("/metrics", &registry).await.status(), StatusCode::NOT_FOUND);
    }
}

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

//! eventprovider-controller - wires EventProviders to Azure Event Grid.
//!
//! Watches `EventProvider` objects and converges each into a receiver
//! deployment, service and ingress plus an Event Grid subscription on the
//! named storage account.

#![warn(missing_docs)]
#![warn(clippy::all)]

use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use kube::CustomResourceExt;
use tracing::{error, info};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use eventprovider_controller::config::ControllerConfig;
use eventprovider_controller::controller_manager::ControllerManager;
use eventprovider_controller::crd::EventProvider;
use eventprovider_controller::eventgrid::EventGridClient;
use eventprovider_controller::eventprovider::EventProviderController;

/// EventProvider controller
///
/// Converges every EventProvider into the Kubernetes objects receiving its
/// events and the Event Grid subscription delivering them.
#[derive(Parser, Debug)]
#[command(name = "eventprovider-controller")]
#[command(version)]
#[command(about = "EventProvider controller", long_about = None)]
struct Args {
    /// Path to the kubeconfig file
    #[arg(long, env = "KUBECONFIG")]
    kubeconfig: Option<PathBuf>,

    /// Path to the configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Namespace to watch (all namespaces when unset)
    #[arg(long)]
    namespace: Option<String>,

    /// Number of parallel reconciliation workers
    #[arg(long)]
    workers: Option<usize>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Enable JSON logging
    #[arg(long)]
    log_json: bool,

    /// Port for the health check server
    #[arg(long)]
    healthz_bind_port: Option<u16>,

    /// Azure subscription owning the storage accounts
    #[arg(long, env = "AZ_SUBSCRIPTION_ID")]
    subscription_id: Option<String>,

    /// Active Directory tenant of the service principal
    #[arg(long, env = "AZ_TENANT_ID")]
    tenant_id: Option<String>,

    /// Service principal application id
    #[arg(long, env = "AZ_CLIENT_ID")]
    client_id: Option<String>,

    /// Service principal secret
    #[arg(long, env = "AZ_CLIENT_SECRET", hide_env_values = true)]
    client_secret: Option<String>,

    /// Print the EventProvider CustomResourceDefinition as YAML and exit
    #[arg(long)]
    print_crd: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    if args.print_crd {
        print!("{}", serde_yaml::to_string(&EventProvider::crd())?);
        return Ok(());
    }

    init_logging(&args.log_level, args.log_json)?;

    let config = load_config(args).await?;
    config.validate().context("invalid configuration")?;

    info!(
        namespace = config.generic.namespace.as_deref().unwrap_or("<all>"),
        workers = config.generic.workers,
        "starting eventprovider-controller"
    );

    let client = create_client(&config).await?;
    let eventgrid =
        EventGridClient::new(config.azure.clone()).context("failed to configure Event Grid")?;

    let mut manager = ControllerManager::new(config, client);
    let controller = EventProviderController::from_context(manager.context(), Arc::new(eventgrid));
    manager.register_controller(controller);

    let shutdown = shutdown_signal()?;
    let shutdown_token = manager.shutdown_token();
    tokio::spawn(async move {
        shutdown.await;
        shutdown_token.cancel();
    });

    if let Err(e) = manager.run().await {
        error!(error = %e, "controller manager failed");
        return Err(e.into());
    }

    info!("eventprovider-controller exited successfully");
    Ok(())
}

/// Initializes logging based on the provided level and format.
fn init_logging(level: &str, json: bool) -> anyhow::Result<()> {
    let env_filter = EnvFilter::builder()
        .with_default_directive(
            level
                .parse()
                .with_context(|| format!("invalid log level: {level}"))?,
        )
        .from_env_lossy();

    let registry = tracing_subscriber::registry().with(env_filter);
    if json {
        registry.with(fmt::layer().json()).try_init()?;
    } else {
        registry.with(fmt::layer().pretty()).try_init()?;
    }
    Ok(())
}

/// Loads the configuration file, then applies command-line overrides.
async fn load_config(mut args: Args) -> anyhow::Result<ControllerConfig> {
    let mut config = if let Some(config_path) = args.config.take() {
        let content = tokio::fs::read_to_string(&config_path)
            .await
            .with_context(|| format!("failed to read config file: {:?}", config_path))?;

        serde_yaml::from_str::<ControllerConfig>(&content)
            .with_context(|| format!("failed to parse config file: {:?}", config_path))?
    } else {
        ControllerConfig::default()
    };

    if let Some(kubeconfig) = args.kubeconfig {
        config.generic.kubeconfig = Some(kubeconfig);
    }
    if let Some(namespace) = args.namespace.filter(|namespace| !namespace.is_empty()) {
        config.generic.namespace = Some(namespace);
    }
    if let Some(workers) = args.workers {
        config.generic.workers = workers;
    }
    if let Some(port) = args.healthz_bind_port {
        config.generic.healthz_bind_port = port;
    }

    let azure = &mut config.azure;
    azure.subscription_id = args.subscription_id.or(azure.subscription_id.take());
    azure.tenant_id = args.tenant_id.or(azure.tenant_id.take());
    azure.client_id = args.client_id.or(azure.client_id.take());
    azure.client_secret = args.client_secret.or(azure.client_secret.take());

    Ok(config)
}

/// Creates a Kubernetes client from the configuration.
async fn create_client(config: &ControllerConfig) -> anyhow::Result<kube::Client> {
    use kube::config::{KubeConfigOptions, Kubeconfig};
    use kube::Config;

    let kube_config = if let Some(kubeconfig_path) = &config.generic.kubeconfig {
        let kubeconfig = Kubeconfig::read_from(kubeconfig_path)
            .with_context(|| format!("failed to read kubeconfig from: {:?}", kubeconfig_path))?;
        Config::from_custom_kubeconfig(kubeconfig, &KubeConfigOptions::default())
            .await
            .with_context(|| format!("failed to load kubeconfig from: {:?}", kubeconfig_path))?
    } else {
        Config::infer().await.context("failed to load kubeconfig")?
    };

    Ok(kube::Client::try_from(kube_config)?)
}

/// Installs the signal handlers and returns a future resolving on the first
/// SIGINT or SIGTERM.
#[cfg(unix)]
fn shutdown_signal() -> anyhow::Result<impl Future<Output = ()>> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigterm =
        signal(SignalKind::terminate()).context("failed to install SIGTERM handler")?;
    let mut sigint = signal(SignalKind::interrupt()).context("failed to install SIGINT handler")?;

    Ok(async move {
        tokio::select! {
            _ = sigterm.recv() => info!("received SIGTERM, shutting down"),
            _ = sigint.recv() => info!("received SIGINT, shutting down"),
        }
    })
}

#[cfg(not(unix))]
fn shutdown_signal() -> anyhow::Result<impl Future<Output = ()>> {
    Ok(async {
        match tokio::signal::ctrl_c().await {
            Ok(()) => info!("received Ctrl+C, shutting down"),
            Err(e) => error!(error = %e, "failed to listen for Ctrl+C, shutting down"),
        }
    })
}

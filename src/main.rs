use crate::reconciler::Reconciler;
use crate::scope::OperationScope;
use crate::state::{ControllerContext, Readiness};
use crate::store::KubeObjectStore;
use k8s_openapi::api::apps::v1::{DaemonSet, Deployment};
use std::env;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

mod config;
mod controller;
mod filter;
mod image_reference;
mod mirror;
mod reconciler;
mod registry;
mod scope;
mod secret_string;
mod state;
mod store;
#[cfg(test)]
mod testing;
mod webserver;
mod workload;

#[cfg(target_env = "musl")]
#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

static DEFAULT_CONFIG_PATH: &str = "/config/config.yaml";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();
    info!("Starting image-clone-controller {}", env!("CARGO_PKG_VERSION"));

    let config_path = env::var("CONFIG_PATH").unwrap_or_else(|_| DEFAULT_CONFIG_PATH.to_string());
    let config = config::load_config(&config_path)?;

    let client = controller::create_client().await?;
    controller::ensure_watchable::<Deployment>(&client).await?;
    controller::ensure_watchable::<DaemonSet>(&client).await?;
    let registry = registry::create_client(&config)?;

    let abort = CancellationToken::new();
    let ctx = Arc::new(ControllerContext {
        reconciler: Reconciler::new(
            KubeObjectStore::new(client.clone()),
            registry,
            Arc::new(config.mirror_config()),
        ),
        scope: OperationScope::new(abort.clone(), config.controller.operation_timeout()),
    });

    let readiness = Readiness::default();
    let port = config.webserver.port;
    let webserver_readiness = readiness.clone();
    tokio::spawn(async move {
        if let Err(e) = webserver::serve(port, webserver_readiness).await {
            error!("Webserver failed: {:?}", e);
        }
    });

    tokio::spawn(abort_after_shutdown_signal(
        readiness.clone(),
        abort,
        config.controller.shutdown_grace_period(),
    ));

    controller::run(client, ctx, &config.controller, readiness).await?;
    info!("All controllers stopped, exiting");
    Ok(())
}

/// The controllers stop taking new work on SIGINT/SIGTERM by themselves. Reconciles
/// still running after `grace_period` get their registry and API calls cancelled.
async fn abort_after_shutdown_signal(
    readiness: Readiness,
    abort: CancellationToken,
    grace_period: Duration,
) {
    shutdown_signal().await;
    readiness.set_ready(false);
    info!(
        "Shutdown requested, waiting up to {:?} for in-flight reconciles",
        grace_period
    );
    tokio::time::sleep(grace_period).await;
    warn!("Shutdown grace period elapsed, cancelling in-flight operations");
    abort.cancel();
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to listen for SIGINT: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!("Failed to listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}

use anyhow::{Context, Result};
use control::config::ControllerConfig;
use control::controller::client::KubeClusterClient;
use control::controller::informer::Informer;
use control::controller::Controller;
use control::server;
use k8s_openapi::api::core::v1::Service;
use k8s_openapi::api::networking::v1::Ingress;
use kube::api::Api;
use kube::runtime::watcher::Config as WatcherConfig;
use kube::Client;
use std::env;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[cfg(not(target_env = "msvc"))]
#[global_allocator]
static GLOBAL: tikv_jemallocator::Jemalloc = tikv_jemallocator::Jemalloc;

/// Ingress manager: one Ingress per annotated Service
#[tokio::main]
async fn main() -> Result<()> {
    // Initialize rustls crypto provider (needed for Kubernetes TLS client)
    rustls::crypto::ring::default_provider()
        .install_default()
        .ok(); // Ignore error if already installed

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = load_config()?;
    info!("Starting ingress manager");
    info!("   Marker annotation: {}", config.marker_annotation);
    info!(
        "   Namespace: {}",
        config.watch_namespace.as_deref().unwrap_or("<all>")
    );
    info!(
        "   Ingress: {}{} -> :{}",
        config.ingress.host, config.ingress.path, config.ingress.port
    );

    let client = Client::try_default()
        .await
        .context("Failed to create Kubernetes client")?;

    let shutdown = CancellationToken::new();
    let ready = Arc::new(AtomicBool::new(false));

    let controller = Arc::new(Controller::new(
        Arc::new(KubeClusterClient::new(client.clone())),
        &config,
    ));
    let router = controller.event_router();

    let mut services = Informer::<Service>::new();
    services.add_event_handler(router.service_handlers());
    let service_store = services.store();

    let mut ingresses = Informer::<Ingress>::new();
    ingresses.add_event_handler(router.ingress_handlers());
    let ingress_store = ingresses.store();

    let (service_api, ingress_api): (Api<Service>, Api<Ingress>) = match &config.watch_namespace {
        Some(ns) => (
            Api::namespaced(client.clone(), ns),
            Api::namespaced(client.clone(), ns),
        ),
        None => (Api::all(client.clone()), Api::all(client.clone())),
    };

    let mut handles = vec![
        tokio::spawn(services.run(service_api, WatcherConfig::default(), shutdown.clone())),
        tokio::spawn(ingresses.run(ingress_api, WatcherConfig::default(), shutdown.clone())),
    ];

    let metrics_addr = config.metrics_addr.clone();
    let server_ready = ready.clone();
    let server_shutdown = shutdown.clone();
    handles.push(tokio::spawn(async move {
        if let Err(e) = server::serve(&metrics_addr, server_ready, server_shutdown).await {
            error!("Metrics server error: {}", e);
        }
    }));

    let signal_shutdown = shutdown.clone();
    tokio::spawn(async move {
        match signal::ctrl_c().await {
            Ok(()) => info!("Shutdown signal received"),
            Err(e) => error!("Failed to listen for shutdown signal: {}", e),
        }
        signal_shutdown.cancel();
    });

    info!("Waiting for informer caches to sync");
    tokio::select! {
        result = async {
            service_store.wait_until_ready().await?;
            ingress_store.wait_until_ready().await
        } => {
            result.context("Informer stopped before its cache synced")?;
            ready.store(true, Ordering::Release);
            info!("Caches synced");
        }
        _ = shutdown.cancelled() => {
            info!("Shutdown before caches synced");
        }
    }

    if !shutdown.is_cancelled() {
        controller.run(config.queue.workers, shutdown.clone()).await;
    }

    shutdown.cancel();
    for handle in handles {
        if let Err(e) = handle.await {
            error!("Task failed: {}", e);
        }
    }

    info!("Ingress manager stopped");
    Ok(())
}

/// `INGRESS_MANAGER_CONFIG` file if set, else defaults; env overrides on top
fn load_config() -> Result<ControllerConfig> {
    let config = match env::var("INGRESS_MANAGER_CONFIG") {
        Ok(path) => ControllerConfig::from_file(&path)
            .with_context(|| format!("Failed to load config file {}", path))?
            .with_env_overrides()?,
        Err(_) => ControllerConfig::from_env()?,
    };

    config.validate()?;
    Ok(config)
}

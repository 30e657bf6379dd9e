use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use axum::Router;
use eyre::Context;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing_subscriber::prelude::*;
use tracing_subscriber::EnvFilter;

mod api;
mod certs;
mod compositor;
mod config;
mod deploy;
mod docker_driver;
mod error;
mod health;
mod layers;
mod logs;
mod proxy;
mod router;
mod store;

use api::{ApiState, AppRegistry};
use certs::CertificateManager;
use config::Config;
use deploy::DeploymentEngine;
use docker_driver::DockerDriver;
use haloyd_common::app::App;
use haloyd_common::docker::DockerContext;
use health::{HealthMonitor, HealthMonitorConfig, HealthTarget, TargetProvider};
use layers::LayerStore;
use logs::LogHub;
use router::RouterTable;
use store::DurableStore;

const LETS_ENCRYPT_PRODUCTION: &str = "https://acme-v02.api.letsencrypt.org/directory";
const LETS_ENCRYPT_STAGING: &str = "https://acme-staging-v02.api.letsencrypt.org/directory";

/// Feeds the Health Monitor from the same app registry the API mutates,
/// resolving each app's live replicas via the Docker Driver on every
/// probe round instead of caching a snapshot of its own.
struct AppRegistryTargets {
    apps: AppRegistry,
    driver: Arc<DockerDriver>,
}

#[async_trait]
impl TargetProvider for AppRegistryTargets {
    async fn health_check_targets(&self) -> Vec<HealthTarget> {
        let apps: Vec<App> = self.apps.read().await.values().cloned().collect();
        let mut targets = Vec::new();
        for app in apps {
            let Ok(replicas) = self.driver.list_replicas(&app.name, None).await else {
                continue;
            };
            for replica in replicas {
                let Ok(ip) = replica.ip_address.parse::<IpAddr>() else {
                    continue;
                };
                targets.push(HealthTarget {
                    app_name: app.name.clone(),
                    container_name: replica.container_name,
                    addr: SocketAddr::new(ip, replica.port),
                    health_path: app.health_check_path.clone(),
                });
            }
        }
        targets
    }
}

#[tokio::main]
async fn main() -> eyre::Result<()> {
    rustls::crypto::ring::default_provider()
        .install_default()
        .expect("install rustls ring crypto provider");

    let config = Config::load()?;

    let logs = LogHub::new();
    let filter = if config.env.debug {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .with(logs::LogHubLayer::new(logs.clone()))
        .init();

    let store = DurableStore::open(&config.db_path())
        .await
        .context("opening durable store")?;
    let layers = LayerStore::new(store.clone(), config.layers_dir());

    let docker = bollard::Docker::try_from(config.yaml.docker.connection.clone())
        .context("connecting to docker engine")?;
    let ctx = DockerContext::new(docker, None, config.yaml.docker.network_name.clone());
    let driver = Arc::new(DockerDriver::new(ctx));
    driver.ensure_network().await.context("ensuring managed docker network exists")?;

    let router_table = Arc::new(RouterTable::new());

    let acme_directory_url = config.yaml.certificates.acme_directory.clone().unwrap_or_else(|| {
        if config.yaml.certificates.staging {
            LETS_ENCRYPT_STAGING.to_owned()
        } else {
            LETS_ENCRYPT_PRODUCTION.to_owned()
        }
    });
    let certs = CertificateManager::new(
        config.cert_storage_dir(),
        acme_directory_url,
        config.yaml.certificates.acme_email.clone(),
    );
    certs.reload().await.context("loading certificate storage")?;
    certs.clone().spawn_watcher();
    let _cert_watcher = certs
        .watch_directory()
        .context("watching certificate storage directory")?;

    let apps: AppRegistry = Arc::new(RwLock::new(HashMap::new()));

    let health_targets = Arc::new(AppRegistryTargets {
        apps: apps.clone(),
        driver: driver.clone(),
    });
    let health_config = HealthMonitorConfig {
        interval: config.yaml.health_monitor.interval(),
        timeout: config.yaml.health_monitor.timeout(),
        fall: config.yaml.health_monitor.fall,
        rise: config.yaml.health_monitor.rise,
        ..Default::default()
    };
    let health = HealthMonitor::new(health_targets, health_config, None);
    if config.yaml.health_monitor.enabled {
        health.clone().spawn();
    }

    let engine = DeploymentEngine::new(
        store.clone(),
        driver.clone(),
        router_table.clone(),
        health.clone(),
        certs.clone(),
        logs.clone(),
    );

    let api_state = Arc::new(ApiState::new(
        apps,
        store,
        layers,
        engine,
        driver,
        router_table.clone(),
        health.clone(),
        logs,
        config.env.api_token.clone(),
    ));

    let proxy_state = proxy::ProxyState::new(router_table, certs.clone());

    let tracker = TaskTracker::new();
    let shutdown = CancellationToken::new();
    let shutdown_for_signal = shutdown.clone();
    ctrlc::set_handler(move || shutdown_for_signal.cancel()).context("installing ctrl-c handler")?;

    tracker.spawn(proxy::serve_http(proxy_state.clone(), "0.0.0.0:80".parse().unwrap(), shutdown.clone()));
    tracker.spawn(proxy::serve_https(proxy_state, "0.0.0.0:443".parse().unwrap(), shutdown.clone()));

    {
        let certs = certs.clone();
        let shutdown = shutdown.clone();
        tracker.spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_secs(3600));
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => return,
                    _ = ticker.tick() => certs.renew_expiring().await,
                }
            }
        });
    }

    let api_addr: SocketAddr = format!("0.0.0.0:{}", config.yaml.api.port)
        .parse()
        .expect("api.port yields a valid socket address");
    let api_listener = tokio::net::TcpListener::bind(api_addr)
        .await
        .context("binding api listener")?;
    tracing::info!(%api_addr, "api listener bound");
    let api_shutdown = shutdown.clone();
    let api_router = Router::new().nest("/api", api::router(api_state));
    tracker.spawn(async move {
        if let Err(err) = axum::serve(api_listener, api_router)
            .with_graceful_shutdown(api_shutdown.cancelled_owned())
            .await
        {
            tracing::error!(%err, "api server exited with error");
        }
    });

    tracker.close();
    tracker.wait().await;
    health.stop().await;

    Ok(())
}

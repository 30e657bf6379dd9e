//! HTTP control plane: deploy/rollback/status/stop, log tailing, and
//! the layer-upload endpoints a client uses to ship an image without
//! re-sending bytes the daemon already has.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use axum::body::{Body, Bytes};
use axum::extract::{DefaultBodyLimit, Path, Query, State as StateE};
use axum::http::{header, Request, StatusCode};
use axum::middleware::{self, Next};
use axum::response::Response;
use axum::routing::{get, post};
use axum::{Json, Router};
use futures_util::StreamExt;
use haloyd_common::app::App;
use haloyd_common::DeploymentId;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tower_http::limit::RequestBodyLimitLayer;

use crate::compositor;
use crate::deploy::DeploymentEngine;
use crate::docker_driver::DockerDriver;
use crate::error::{Error, Result};
use crate::health::HealthMonitor;
use crate::layers::{LayerStore, ManifestEntry};
use crate::logs::{LogHub, SERVER_LOG_CHANNEL};
use crate::router::RouterTable;
use crate::store::DurableStore;

/// Non-upload JSON endpoints get a 1 MiB request body cap; the
/// layer/image upload endpoints below disable it explicitly since they
/// legitimately carry multi-megabyte tar/layer payloads.
const MAX_JSON_BODY_BYTES: usize = 1024 * 1024;

pub type AppRegistry = Arc<RwLock<HashMap<String, App>>>;

pub struct ApiState {
    pub apps: AppRegistry,
    pub store: DurableStore,
    pub layers: LayerStore,
    pub engine: DeploymentEngine,
    pub driver: Arc<DockerDriver>,
    pub router_table: Arc<RouterTable>,
    pub health: Arc<HealthMonitor>,
    pub logs: LogHub,
    pub api_token: Option<String>,
    pub started_at: Instant,
    pub version: &'static str,
    revision: AtomicU64,
}

impl ApiState {
    pub fn new(
        apps: AppRegistry,
        store: DurableStore,
        layers: LayerStore,
        engine: DeploymentEngine,
        driver: Arc<DockerDriver>,
        router_table: Arc<RouterTable>,
        health: Arc<HealthMonitor>,
        logs: LogHub,
        api_token: Option<String>,
    ) -> Self {
        Self {
            apps,
            store,
            layers,
            engine,
            driver,
            router_table,
            health,
            logs,
            api_token,
            started_at: Instant::now(),
            version: env!("CARGO_PKG_VERSION"),
            revision: AtomicU64::new(0),
        }
    }

    async fn recompose_router(&self) -> Result<()> {
        let revision = self.revision.fetch_add(1, Ordering::Relaxed) + 1;
        let apps = self.apps.read().await;
        let app_list: Vec<App> = apps.values().cloned().collect();
        drop(apps);

        let mut replicas_by_app = HashMap::new();
        for app in &app_list {
            let replicas = self.engine.current_replicas(&app.name).await.unwrap_or_default();
            replicas_by_app.insert(app.name.clone(), replicas);
        }

        match compositor::compose(&app_list, &replicas_by_app, &self.health, revision) {
            Ok(snapshot) => {
                self.router_table.publish(snapshot);
                Ok(())
            }
            Err(err) => {
                tracing::warn!(%err, "router rebuild rejected, keeping previous snapshot");
                Err(Error::DomainConflict(err.to_string()))
            }
        }
    }
}

async fn require_bearer_token(
    StateE(state): StateE<Arc<ApiState>>,
    req: Request<Body>,
    next: Next,
) -> Result<Response> {
    let Some(expected) = &state.api_token else {
        return Ok(next.run(req).await);
    };
    let provided = req
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "));
    if provided != Some(expected.as_str()) {
        return Err(Error::Unauthorized);
    }
    Ok(next.run(req).await)
}

#[derive(Deserialize)]
struct DeployRequest {
    app: App,
}

async fn deploy(StateE(state): StateE<Arc<ApiState>>, Json(payload): Json<DeployRequest>) -> Result<Json<DeploymentId>> {
    payload.app.validate().map_err(Error::InvalidConfig)?;
    let raw_config = serde_json::to_vec(&payload.app).map_err(|e| Error::Other(e.to_string()))?;

    {
        let mut apps = state.apps.write().await;
        apps.insert(payload.app.name.clone(), payload.app.clone());
    }

    let id = state.engine.deploy(payload.app, raw_config).await?;
    state.recompose_router().await.ok();
    Ok(Json(id))
}

#[derive(Deserialize)]
struct RollbackRequest {
    target: DeploymentId,
}

async fn rollback_to(
    StateE(state): StateE<Arc<ApiState>>,
    Path(app_name): Path<String>,
    Json(payload): Json<RollbackRequest>,
) -> Result<Json<DeploymentId>> {
    let app = state.apps.read().await.get(&app_name).cloned().ok_or(Error::NotFound)?;
    let id = state.engine.rollback(app, payload.target).await?;
    state.recompose_router().await.ok();
    Ok(Json(id))
}

/// Rolls back to the deployment immediately before the current one.
async fn rollback_previous(StateE(state): StateE<Arc<ApiState>>, Path(app_name): Path<String>) -> Result<Json<DeploymentId>> {
    let app = state.apps.read().await.get(&app_name).cloned().ok_or(Error::NotFound)?;
    let history = state.store.get_deployment_history(&app_name, Some(2)).await?;
    let target = history.get(1).ok_or(Error::NotFound)?.id;
    let id = state.engine.rollback(app, target).await?;
    state.recompose_router().await.ok();
    Ok(Json(id))
}

#[derive(Serialize)]
struct StatusResponse {
    app: String,
    history: Vec<DeploymentSummary>,
    replicas_healthy: usize,
    replicas_total: usize,
}

#[derive(Serialize)]
struct DeploymentSummary {
    id: DeploymentId,
    state: String,
    failed_reason: Option<String>,
}

async fn status(StateE(state): StateE<Arc<ApiState>>, Path(app_name): Path<String>) -> Result<Json<StatusResponse>> {
    let history = state.store.get_deployment_history(&app_name, Some(20)).await?;
    let replicas = state.engine.current_replicas(&app_name).await.unwrap_or_default();
    let replicas_healthy = replicas.iter().filter(|r| state.health.is_healthy(&r.container_name)).count();

    Ok(Json(StatusResponse {
        app: app_name,
        replicas_total: replicas.len(),
        replicas_healthy,
        history: history
            .into_iter()
            .map(|row| DeploymentSummary {
                id: row.id,
                state: format!("{:?}", row.state).to_lowercase(),
                failed_reason: row.failed_reason,
            })
            .collect(),
    }))
}

async fn stop(StateE(state): StateE<Arc<ApiState>>, Path(app_name): Path<String>) -> Result<()> {
    let names = state.driver.list_app_containers(&app_name, None).await.map_err(|e| Error::Other(e.to_string()))?;
    state.driver.stop_containers(&names).await.map_err(|e| Error::Other(e.to_string()))?;
    state.driver.remove_containers(&names).await.map_err(|e| Error::Other(e.to_string()))?;
    state.recompose_router().await.ok();
    Ok(())
}

#[derive(Deserialize, Default)]
struct TailLogsQuery {
    tail: Option<usize>,
    #[serde(rename = "containerId")]
    container_id: Option<String>,
    #[serde(rename = "allContainers", default)]
    all_containers: bool,
}

async fn tail_logs(
    StateE(state): StateE<Arc<ApiState>>,
    Path(app_name): Path<String>,
    Query(q): Query<TailLogsQuery>,
) -> Response {
    let filter = if q.all_containers { None } else { q.container_id.as_deref() };
    stream_channel(&state.logs, &app_name, q.tail, filter)
}

async fn server_logs(StateE(state): StateE<Arc<ApiState>>, Query(q): Query<TailLogsQuery>) -> Response {
    stream_channel(&state.logs, SERVER_LOG_CHANNEL, q.tail, None)
}

/// Each line is already an NDJSON `{containerID, line, ts}` object as
/// published by the deployment engine's log tailers (or, on the server
/// channel, a plain message the caller shouldn't filter on container).
fn matches_container(line: &str, container_id: &str) -> bool {
    line.contains(&format!("\"containerID\":\"{container_id}\""))
}

fn stream_channel(hub: &LogHub, channel: &str, tail: Option<usize>, container_id: Option<&str>) -> Response {
    let (mut backlog, rx) = hub.subscribe(channel);
    if let Some(container_id) = container_id {
        backlog.retain(|l| matches_container(l, container_id));
    }
    if let Some(n) = tail {
        if backlog.len() > n {
            backlog.drain(..backlog.len() - n);
        }
    }
    let container_filter = container_id.map(str::to_owned);
    let backlog_stream = futures_util::stream::iter(backlog.into_iter().map(|l| Ok::<_, std::io::Error>(Bytes::from(format!("{l}\n")))));
    let live_stream = tokio_stream::wrappers::BroadcastStream::new(rx).filter_map(move |res| {
        let container_filter = container_filter.clone();
        async move {
            let line = res.ok()?;
            if let Some(id) = &container_filter {
                if !matches_container(&line, id) {
                    return None;
                }
            }
            Some(Ok::<_, std::io::Error>(Bytes::from(format!("{line}\n"))))
        }
    });
    let body = Body::from_stream(backlog_stream.chain(live_stream));
    Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, "application/x-ndjson; charset=utf-8")
        .body(body)
        .unwrap()
}

#[derive(Serialize)]
struct VersionResponse {
    version: &'static str,
    uptime_secs: u64,
}

async fn version(StateE(state): StateE<Arc<ApiState>>) -> Json<VersionResponse> {
    Json(VersionResponse {
        version: state.version,
        uptime_secs: state.started_at.elapsed().as_secs(),
    })
}

#[derive(Deserialize)]
struct LayersCheckRequest {
    digests: Vec<String>,
}

#[derive(Serialize)]
struct LayersCheckResponse {
    missing: Vec<String>,
    present: Vec<String>,
}

async fn layers_check(StateE(state): StateE<Arc<ApiState>>, Json(payload): Json<LayersCheckRequest>) -> Result<Json<LayersCheckResponse>> {
    let (missing, present) = state.layers.has_layers(&payload.digests).await?;
    Ok(Json(LayersCheckResponse { missing, present }))
}

#[derive(Deserialize)]
struct LayerUploadQuery {
    digest: String,
}

async fn upload_layer(StateE(state): StateE<Arc<ApiState>>, Query(q): Query<LayerUploadQuery>, body: Body) -> Result<()> {
    let reader = tokio_util::io::StreamReader::new(body.into_data_stream().map(|r| r.map_err(std::io::Error::other)));
    state.layers.store_layer(&q.digest, reader).await?;
    Ok(())
}

#[derive(Deserialize)]
struct AssembleRequest {
    manifest: Vec<ManifestEntry>,
    config_base64: String,
}

#[derive(Serialize)]
struct AssembleResponse {
    reference: String,
}

async fn assemble_layers(StateE(state): StateE<Arc<ApiState>>, Json(payload): Json<AssembleRequest>) -> Result<Json<AssembleResponse>> {
    use base64::Engine;
    let config_bytes = base64::engine::general_purpose::STANDARD
        .decode(&payload.config_base64)
        .map_err(|e| Error::InvalidConfig(e.to_string()))?;
    let tar_path = state
        .layers
        .assemble_image_tar(&payload.manifest, &config_bytes)
        .await
        .map_err(|e| Error::Other(e.to_string()))?;
    state.driver.load_image_tar(&tar_path).await.map_err(|e| Error::Other(e.to_string()))?;
    tokio::fs::remove_dir_all(tar_path.parent().unwrap()).await.ok();

    let reference = payload
        .manifest
        .first()
        .and_then(|m| m.repo_tags.first().cloned())
        .ok_or_else(|| Error::InvalidConfig("manifest has no RepoTags".to_owned()))?;
    Ok(Json(AssembleResponse { reference }))
}

async fn upload_image_tar(StateE(state): StateE<Arc<ApiState>>, body: Body) -> Result<()> {
    let path = std::env::temp_dir().join(format!("haloyd-upload-{}.tar", uuid::Uuid::new_v4()));
    let mut file = tokio::fs::File::create(&path).await?;
    let mut stream = body.into_data_stream();
    use tokio::io::AsyncWriteExt;
    while let Some(chunk) = stream.next().await {
        let chunk = chunk.map_err(|e| Error::Other(e.to_string()))?;
        file.write_all(&chunk).await?;
    }
    file.flush().await?;
    drop(file);
    state.driver.load_image_tar(&path).await.map_err(|e| Error::Other(e.to_string()))?;
    tokio::fs::remove_file(&path).await.ok();
    Ok(())
}

pub fn router(state: Arc<ApiState>) -> Router {
    let json_routes = Router::new()
        .route("/deploy", post(deploy))
        .route("/rollback/{app}", post(rollback_previous))
        .route("/rollback/{app}/to", post(rollback_to))
        .route("/status/{app}", get(status))
        .route("/stop/{app}", post(stop))
        .route("/logs/{app}", get(tail_logs))
        .route("/server-logs", get(server_logs))
        .route("/version", get(version))
        .route("/images/layers/check", post(layers_check))
        .layer(RequestBodyLimitLayer::new(MAX_JSON_BODY_BYTES));

    let upload_routes = Router::new()
        .route("/images/layers", post(upload_layer))
        .route("/images/layers/assemble", post(assemble_layers))
        .route("/images/upload", post(upload_image_tar))
        .layer(DefaultBodyLimit::disable());

    json_routes
        .merge(upload_routes)
        .layer(middleware::from_fn_with_state(state.clone(), require_bearer_token))
        .with_state(state)
}

//! Deployment Engine: turns a declarative `App` into running, healthy
//! containers and an updated router snapshot, or leaves everything
//! exactly as it was. Deploys commit-or-rollback around a set of
//! Docker side effects, publishing the new router snapshot in-process
//! once the rollout is healthy.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures_util::StreamExt;
use haloyd_common::app::{App, HistoryStrategy, ImageSource, RolloutStrategy, ValueSource};
use haloyd_common::DeploymentId;
use tokio::sync::Mutex as AsyncMutex;

use crate::certs::CertificateManager;
use crate::docker_driver::{DockerDriver, Replica};
use crate::error::Error;
use crate::health::HealthMonitor;
use crate::logs::{LogEntry, LogHub};
use crate::router::RouterTable;
use crate::store::{DeploymentRow, DeploymentState, DurableStore};

/// `CheckWithRetry`: poll with exponential backoff (capped) rather than
/// a flat interval, so a replica that's slow to warm up doesn't eat the
/// whole deadline in fixed-size steps.
const HEALTH_MAX_ATTEMPTS: u32 = 30;
const HEALTH_INITIAL_BACKOFF: Duration = Duration::from_millis(500);
const HEALTH_BACKOFF_CAP: Duration = Duration::from_secs(5);
const HEALTH_WAIT_DEADLINE: Duration = Duration::from_secs(120);

/// Overall budget for one `deploy`/`rollback` call, image materialize
/// through healthy rollout. A deploy that blows this gets no deployment
/// row left behind — see `handle_rollout_failure`.
const DEPLOY_BUDGET: Duration = Duration::from_secs(600);

fn resolve_env(env: &HashMap<String, ValueSource>) -> Result<HashMap<String, String>, Error> {
    let mut out = HashMap::with_capacity(env.len());
    for (key, source) in env {
        let value = match source {
            ValueSource::Literal { value } => value.clone(),
            ValueSource::EnvRef { name } => std::env::var(name)
                .map_err(|_| Error::SecretMissing(format!("environment variable {name:?} is not set")))?,
            ValueSource::SecretRef { provider, key: secret_key } => {
                return Err(Error::SecretMissing(format!(
                    "no secret provider {provider:?} configured to resolve {secret_key:?}"
                )));
            }
        };
        out.insert(key.clone(), value);
    }
    Ok(out)
}

/// RAII rollback guard for a deploy in progress: any container names
/// pushed here get stopped and removed on drop unless `commit()` was
/// called first, via a fire-and-forget cleanup task spawned from
/// `Drop`.
struct RollbackGuard {
    driver: Arc<DockerDriver>,
    containers: Vec<String>,
    committed: bool,
}

impl RollbackGuard {
    fn new(driver: Arc<DockerDriver>) -> Self {
        Self {
            driver,
            containers: Vec::new(),
            committed: false,
        }
    }

    fn track(&mut self, names: impl IntoIterator<Item = String>) {
        self.containers.extend(names);
    }

    fn commit(&mut self) {
        self.committed = true;
    }
}

impl Drop for RollbackGuard {
    fn drop(&mut self) {
        if self.committed || self.containers.is_empty() {
            return;
        }
        let driver = self.driver.clone();
        let containers = std::mem::take(&mut self.containers);
        tokio::spawn(async move {
            driver.stop_containers(&containers).await.ok();
            driver.remove_containers(&containers).await.ok();
        });
    }
}

pub struct DeploymentEngine {
    store: DurableStore,
    driver: Arc<DockerDriver>,
    router: Arc<RouterTable>,
    health: Arc<HealthMonitor>,
    certs: Arc<CertificateManager>,
    logs: LogHub,
    locks: AsyncMutex<HashMap<String, Arc<AsyncMutex<()>>>>,
}

impl DeploymentEngine {
    pub fn new(
        store: DurableStore,
        driver: Arc<DockerDriver>,
        router: Arc<RouterTable>,
        health: Arc<HealthMonitor>,
        certs: Arc<CertificateManager>,
        logs: LogHub,
    ) -> Self {
        Self {
            store,
            driver,
            router,
            health,
            certs,
            logs,
            locks: AsyncMutex::new(HashMap::new()),
        }
    }

    async fn lock_for(&self, app_name: &str) -> Arc<AsyncMutex<()>> {
        let mut locks = self.locks.lock().await;
        locks.entry(app_name.to_owned()).or_insert_with(|| Arc::new(AsyncMutex::new(()))).clone()
    }

    pub async fn current_replicas(&self, app_name: &str) -> Result<Vec<Replica>, Error> {
        self.driver.list_replicas(app_name, None).await.map_err(docker_err)
    }

    /// Deploys `app` as a brand-new `DeploymentId`, serialized per app
    /// so concurrent deploy requests for the same app queue instead of
    /// racing each other's container churn. Under `history_strategy:
    /// none` no deployment row is ever written, so there is nothing
    /// for `rollback` to replay later.
    pub async fn deploy(&self, app: App, raw_config: Vec<u8>) -> Result<DeploymentId, Error> {
        app.validate().map_err(Error::InvalidConfig)?;
        let app_lock = self.lock_for(&app.name).await;
        let _guard = app_lock.lock().await;

        let persist = !matches!(app.history_strategy, HistoryStrategy::None);

        let previous = if persist {
            self.store.get_deployment_history(&app.name, Some(1)).await.ok().and_then(|mut v| v.pop())
        } else {
            None
        };
        let new_id = match &previous {
            Some(row) => DeploymentId::after(row.id),
            None => DeploymentId::now(),
        };

        let image_reference = app.image_tag(&new_id);
        if persist {
            self.store
                .save_deployment(&DeploymentRow {
                    id: new_id,
                    app_name: app.name.clone(),
                    raw_config: raw_config.clone(),
                    image_ref: image_reference.clone(),
                    state: DeploymentState::Pending,
                    failed_reason: None,
                    created_at: chrono::Utc::now(),
                })
                .await
                .map_err(store_err)?;
        }

        let rollout = tokio::time::timeout(
            DEPLOY_BUDGET,
            self.roll_out(&app, new_id, &image_reference, Some(&app.image), previous.as_ref()),
        )
        .await;

        match rollout {
            Ok(Ok(())) => {
                if persist {
                    self.mark_state(&new_id, DeploymentState::Healthy, None).await;
                }
                self.prune(&app, new_id).await;
                Ok(new_id)
            }
            Ok(Err(err)) => self.handle_rollout_failure(persist, new_id, err).await,
            Err(_elapsed) => {
                let err = Error::DeadlineExceeded(format!("deploy {new_id} exceeded its overall budget"));
                self.handle_rollout_failure(persist, new_id, err).await
            }
        }
    }

    /// Re-deploys an app at a previously recorded deployment's image,
    /// under a fresh `DeploymentId` — a rollback is just a deploy whose
    /// image reference already exists locally instead of needing to be
    /// pulled and tagged from scratch. Apps declared `history_strategy:
    /// none` have no rows to roll back to at all.
    pub async fn rollback(&self, app: App, target: DeploymentId) -> Result<DeploymentId, Error> {
        if matches!(app.history_strategy, HistoryStrategy::None) {
            return Err(Error::InvalidConfig(format!(
                "app {:?} uses history_strategy \"none\"; there is no deployment history to roll back to",
                app.name
            )));
        }

        let target_row = self.store.get_deployment(&target).await.map_err(store_err)?;
        let app_lock = self.lock_for(&app.name).await;
        let _guard = app_lock.lock().await;

        let previous = self.store.get_deployment_history(&app.name, Some(1)).await.ok().and_then(|mut v| v.pop());
        let new_id = match &previous {
            Some(row) => DeploymentId::after(row.id),
            None => DeploymentId::now(),
        };

        self.store
            .save_deployment(&DeploymentRow {
                id: new_id,
                app_name: app.name.clone(),
                raw_config: target_row.raw_config.clone(),
                image_ref: target_row.image_ref.clone(),
                state: DeploymentState::Pending,
                failed_reason: None,
                created_at: chrono::Utc::now(),
            })
            .await
            .map_err(store_err)?;

        // The target image reference is already a local tag from a prior
        // deploy (or, under `history_strategy: registry`, something the
        // operator is expected to have re-pulled); nothing to materialize.
        let rollout = tokio::time::timeout(
            DEPLOY_BUDGET,
            self.roll_out(&app, new_id, &target_row.image_ref, None, previous.as_ref()),
        )
        .await;

        match rollout {
            Ok(Ok(())) => {
                self.mark_state(&new_id, DeploymentState::Healthy, None).await;
                Ok(new_id)
            }
            Ok(Err(err)) => self.handle_rollout_failure(true, new_id, err).await,
            Err(_elapsed) => {
                let err = Error::DeadlineExceeded(format!("rollback {new_id} exceeded its overall budget"));
                self.handle_rollout_failure(true, new_id, err).await
            }
        }
    }

    /// On any failure but a blown deadline, leave a `Failed` row behind
    /// for operator visibility. On a blown deadline, the row — if one
    /// was ever written — is deleted instead: the deploy never reached a
    /// terminal state, so it shouldn't look like one did.
    async fn handle_rollout_failure(&self, persist: bool, id: DeploymentId, err: Error) -> Result<DeploymentId, Error> {
        if persist {
            if matches!(err, Error::DeadlineExceeded(_)) {
                self.store.delete_deployment(&id).await.ok();
            } else {
                self.mark_state(&id, DeploymentState::Failed, Some(err.to_string())).await;
            }
        }
        Err(err)
    }

    /// `image_source` is `Some` for a fresh deploy (pull/load then tag
    /// as `<app>:<deploymentId>`) and `None` for a rollback, where
    /// `image_reference` already names a tag from an earlier deploy.
    async fn roll_out(
        &self,
        app: &App,
        new_id: DeploymentId,
        image_reference: &str,
        image_source: Option<&ImageSource>,
        previous: Option<&DeploymentRow>,
    ) -> Result<(), Error> {
        let resolved_env = resolve_env(&app.env)?;
        let mut guard = RollbackGuard::new(self.driver.clone());

        self.driver.ensure_volumes(&app.name, &app.volumes).await.map_err(docker_err)?;

        if let Some(image) = image_source {
            self.set_state(&new_id, DeploymentState::Pulling).await;
            self.driver.ensure_image_up_to_date(image).await.map_err(docker_err)?;
            self.set_state(&new_id, DeploymentState::Tagging).await;
            self.driver.tag_image(image.reference(), &app.name, &new_id).await.map_err(docker_err)?;
        }

        let old_containers = self.driver.list_app_containers(&app.name, None).await.map_err(docker_err)?;

        if matches!(app.strategy, RolloutStrategy::Replace) && !old_containers.is_empty() {
            self.driver.stop_containers(&old_containers).await.map_err(docker_err)?;
            self.driver.remove_containers(&old_containers).await.map_err(docker_err)?;
        }

        self.set_state(&new_id, DeploymentState::Rolling).await;
        let replicas = self
            .driver
            .run_replicas(app, &new_id, image_reference, &resolved_env)
            .await
            .map_err(docker_err)?;
        guard.track(replicas.iter().map(|r| r.container_name.clone()));
        self.spawn_log_tailers(&app.name, &replicas);

        self.health.force_check();
        self.wait_for_healthy(&replicas).await?;

        if matches!(app.strategy, RolloutStrategy::Rolling) && !old_containers.is_empty() {
            self.driver.stop_containers(&old_containers).await.map_err(docker_err)?;
            self.driver.remove_containers(&old_containers).await.map_err(docker_err)?;
        }

        self.ensure_domain_certs(app);

        let _ = previous;
        guard.commit();
        Ok(())
    }

    /// `CheckWithRetry`: exponential backoff, capped, bounded by both an
    /// attempt count and an overall deadline — whichever is hit first
    /// ends the wait.
    async fn wait_for_healthy(&self, replicas: &[Replica]) -> Result<(), Error> {
        let deadline = Instant::now() + HEALTH_WAIT_DEADLINE;
        let mut backoff = HEALTH_INITIAL_BACKOFF;
        let mut attempt = 0u32;
        loop {
            if replicas.iter().all(|r| self.health.is_healthy(&r.container_name)) {
                return Ok(());
            }
            if attempt >= HEALTH_MAX_ATTEMPTS || Instant::now() >= deadline {
                return Err(Error::DeadlineExceeded(
                    "replicas did not become healthy before the rollout deadline".to_owned(),
                ));
            }
            tokio::time::sleep(backoff).await;
            backoff = (backoff * 2).min(HEALTH_BACKOFF_CAP);
            attempt += 1;
            self.health.force_check();
        }
    }

    /// Issues a certificate for any domain this app declares that
    /// doesn't already have one loaded. Renewal of existing certs is
    /// the hourly `renew_expiring` sweep's job; this only covers the
    /// "brand-new domain" case a sweep would otherwise never reach
    /// until the first renewal window.
    fn ensure_domain_certs(&self, app: &App) {
        for domain in &app.domains {
            if self.certs.meta_for(&domain.canonical).is_some() {
                continue;
            }
            let alt_names = domain.aliases.clone();
            self.certs.ensure_certificate(domain.canonical.clone(), alt_names, domain.acme_email.clone());
        }
    }

    /// One follower task per replica, feeding the Log Hub so `/logs/:app`
    /// has something to stream beyond an empty backlog.
    fn spawn_log_tailers(&self, app_name: &str, replicas: &[Replica]) {
        for replica in replicas {
            let driver = self.driver.clone();
            let logs = self.logs.clone();
            let app_name = app_name.to_owned();
            let container_name = replica.container_name.clone();
            tokio::spawn(async move {
                let mut stream = driver.container_logs(&container_name);
                while let Some(chunk) = stream.next().await {
                    let Ok(output) = chunk else { break };
                    let bytes = output.into_bytes();
                    for line in String::from_utf8_lossy(&bytes).lines() {
                        if line.is_empty() {
                            continue;
                        }
                        logs.publish(&app_name, LogEntry::ndjson(&container_name, line));
                    }
                }
            });
        }
    }

    async fn prune(&self, app: &App, current: DeploymentId) {
        match app.history_strategy {
            HistoryStrategy::Local => self.prune_local_tags(app, app.keep).await,
            // Rely on the registry for history: keep only the tag that's
            // actually running locally right now.
            HistoryStrategy::Registry => self.prune_local_tags(app, 1).await,
            // No rows are ever written for this app, so there's nothing
            // in the store to prune; the image tag for `current` sticks
            // around until the next deploy overwrites it.
            HistoryStrategy::None => {
                let _ = current;
            }
        }
    }

    async fn prune_local_tags(&self, app: &App, keep: u32) {
        match self.store.prune_old_deployments(&app.name, keep).await {
            Ok(deleted) if !deleted.is_empty() => {
                if let Err(err) = self.driver.remove_images(&app.name, &deleted).await {
                    tracing::warn!(app = %app.name, %err, "failed to remove pruned image tags");
                }
            }
            Ok(_) => {}
            Err(err) => tracing::warn!(app = %app.name, %err, "failed to prune deployment history"),
        }
    }

    async fn set_state(&self, id: &DeploymentId, state: DeploymentState) {
        if let Ok(mut row) = self.store.get_deployment(id).await {
            row.state = state;
            self.store.save_deployment(&row).await.ok();
        }
    }

    async fn mark_state(&self, id: &DeploymentId, state: DeploymentState, reason: Option<String>) {
        if let Ok(mut row) = self.store.get_deployment(id).await {
            row.state = state;
            row.failed_reason = reason;
            self.store.save_deployment(&row).await.ok();
        }
    }
}

fn docker_err(err: crate::docker_driver::DriverError) -> Error {
    Error::Other(err.to_string())
}

fn store_err(err: crate::store::StoreError) -> Error {
    match err {
        crate::store::StoreError::NotFound => Error::NotFound,
        other => Error::Other(other.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn literal_env_resolves_without_process_env() {
        let mut env = HashMap::new();
        env.insert("FOO".to_owned(), ValueSource::Literal { value: "bar".into() });
        let resolved = resolve_env(&env).unwrap();
        assert_eq!(resolved.get("FOO"), Some(&"bar".to_owned()));
    }

    #[test]
    fn secret_ref_is_unresolvable_without_a_provider() {
        let mut env = HashMap::new();
        env.insert(
            "TOKEN".to_owned(),
            ValueSource::SecretRef { provider: "vault".into(), key: "token".into() },
        );
        assert!(resolve_env(&env).is_err());
    }
}

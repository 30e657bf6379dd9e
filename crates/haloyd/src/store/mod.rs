//! Durable Store: deployments, layers, and a small kv table, all in
//! one embedded SQLite file under `<data-dir>/db/`. Embedded rather
//! than a shared cluster database because haloyd runs one instance per
//! server.

use std::path::Path;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use haloyd_common::DeploymentId;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::SqlitePool;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("not found")]
    NotFound,
    #[error("conflict: {0}")]
    Conflict(String),
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Db(#[from] sqlx::Error),
}

pub type Result<T> = std::result::Result<T, StoreError>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeploymentState {
    Pending,
    Pulling,
    Tagging,
    Rolling,
    Healthy,
    Failed,
}

impl DeploymentState {
    fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Pulling => "pulling",
            Self::Tagging => "tagging",
            Self::Rolling => "rolling",
            Self::Healthy => "healthy",
            Self::Failed => "failed",
        }
    }
}

impl FromStr for DeploymentState {
    type Err = StoreError;

    fn from_str(s: &str) -> Result<Self> {
        Ok(match s {
            "pending" => Self::Pending,
            "pulling" => Self::Pulling,
            "tagging" => Self::Tagging,
            "rolling" => Self::Rolling,
            "healthy" => Self::Healthy,
            "failed" => Self::Failed,
            other => return Err(StoreError::Conflict(format!("unknown deployment state {other:?}"))),
        })
    }
}

/// Row shape for `deployments`. `raw_config` is an opaque blob (the
/// declarative config serialized by the caller) kept solely so
/// `Rollback` can replay it; the store never interprets it.
#[derive(Debug, Clone)]
pub struct DeploymentRow {
    pub id: DeploymentId,
    pub app_name: String,
    pub raw_config: Vec<u8>,
    pub image_ref: String,
    pub state: DeploymentState,
    pub failed_reason: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(sqlx::FromRow)]
struct DeploymentRowSql {
    id: String,
    app_name: String,
    raw_config: Vec<u8>,
    image_ref: String,
    state: String,
    failed_reason: Option<String>,
    created_at: String,
}

impl TryFrom<DeploymentRowSql> for DeploymentRow {
    type Error = StoreError;

    fn try_from(r: DeploymentRowSql) -> Result<Self> {
        Ok(Self {
            id: r
                .id
                .parse()
                .map_err(|_| StoreError::Conflict("malformed deployment id in db".into()))?,
            app_name: r.app_name,
            raw_config: r.raw_config,
            image_ref: r.image_ref,
            state: r.state.parse()?,
            failed_reason: r.failed_reason,
            created_at: DateTime::parse_from_rfc3339(&r.created_at)
                .map(|d| d.with_timezone(&Utc))
                .map_err(|_| StoreError::Conflict("malformed timestamp in db".into()))?,
        })
    }
}

#[derive(Debug, Clone)]
pub struct LayerRow {
    pub digest: String,
    pub size: i64,
    pub created_at: DateTime<Utc>,
    pub last_used_at: DateTime<Utc>,
}

/// Single writer, many readers. SQLite enforces this for us at the
/// connection-pool level: one dedicated writer connection, a small
/// pool of read-only ones.
#[derive(Clone)]
pub struct DurableStore {
    write_pool: SqlitePool,
    read_pool: SqlitePool,
}

impl DurableStore {
    pub async fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let write_opts = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true);
        let write_pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(write_opts)
            .await?;
        sqlx::migrate!("src/store/migrations").run(&write_pool).await?;

        let read_opts = SqliteConnectOptions::new().filename(path);
        let read_pool = SqlitePoolOptions::new()
            .max_connections(4)
            .connect_with(read_opts)
            .await?;

        Ok(Self {
            write_pool,
            read_pool,
        })
    }

    pub async fn save_deployment(&self, d: &DeploymentRow) -> Result<()> {
        sqlx::query(
            "INSERT INTO deployments (id, app_name, raw_config, image_ref, state, failed_reason, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
             ON CONFLICT(id) DO UPDATE SET
                app_name = excluded.app_name,
                raw_config = excluded.raw_config,
                image_ref = excluded.image_ref,
                state = excluded.state,
                failed_reason = excluded.failed_reason",
        )
        .bind(d.id.as_str())
        .bind(&d.app_name)
        .bind(&d.raw_config)
        .bind(&d.image_ref)
        .bind(d.state.as_str())
        .bind(&d.failed_reason)
        .bind(d.created_at.to_rfc3339())
        .execute(&self.write_pool)
        .await?;
        Ok(())
    }

    /// Used when a rollout is abandoned before it ever reached a
    /// terminal state (the deploy-budget timeout): the row is removed
    /// rather than left behind in `Pending`/`Failed`.
    pub async fn delete_deployment(&self, id: &DeploymentId) -> Result<()> {
        sqlx::query("DELETE FROM deployments WHERE id = ?1")
            .bind(id.as_str())
            .execute(&self.write_pool)
            .await?;
        Ok(())
    }

    pub async fn get_deployment(&self, id: &DeploymentId) -> Result<DeploymentRow> {
        let row: DeploymentRowSql = sqlx::query_as(
            "SELECT id, app_name, raw_config, image_ref, state, failed_reason, created_at
             FROM deployments WHERE id = ?1",
        )
        .bind(id.as_str())
        .fetch_optional(&self.read_pool)
        .await?
        .ok_or(StoreError::NotFound)?;
        row.try_into()
    }

    pub async fn get_deployment_history(
        &self,
        app_name: &str,
        limit: Option<u32>,
    ) -> Result<Vec<DeploymentRow>> {
        let limit = limit.unwrap_or(u32::MAX) as i64;
        let rows: Vec<DeploymentRowSql> = sqlx::query_as(
            "SELECT id, app_name, raw_config, image_ref, state, failed_reason, created_at
             FROM deployments WHERE app_name = ?1 ORDER BY id DESC LIMIT ?2",
        )
        .bind(app_name)
        .bind(limit)
        .fetch_all(&self.read_pool)
        .await?;
        rows.into_iter().map(TryInto::try_into).collect()
    }

    /// Retains the `keep` most recent rows for `app_name`, deletes the
    /// rest, and returns the deleted ids so the caller can reclaim
    /// image tags.
    pub async fn prune_old_deployments(
        &self,
        app_name: &str,
        keep: u32,
    ) -> Result<Vec<DeploymentId>> {
        let all = self.get_deployment_history(app_name, None).await?;
        let to_delete = all.into_iter().skip(keep as usize).collect::<Vec<_>>();
        let mut deleted = Vec::with_capacity(to_delete.len());
        for row in to_delete {
            sqlx::query("DELETE FROM deployments WHERE id = ?1")
                .bind(row.id.as_str())
                .execute(&self.write_pool)
                .await?;
            deleted.push(row.id);
        }
        Ok(deleted)
    }

    pub async fn has_layers(&self, digests: &[String]) -> Result<(Vec<String>, Vec<String>)> {
        let mut missing = Vec::new();
        let mut exists = Vec::new();
        for digest in digests {
            let found: Option<(String,)> = sqlx::query_as("SELECT digest FROM layers WHERE digest = ?1")
                .bind(digest)
                .fetch_optional(&self.read_pool)
                .await?;
            if found.is_some() {
                exists.push(digest.clone());
            } else {
                missing.push(digest.clone());
            }
        }
        Ok((missing, exists))
    }

    pub async fn save_layer(&self, digest: &str, size: i64) -> Result<()> {
        let now = Utc::now().to_rfc3339();
        sqlx::query(
            "INSERT INTO layers (digest, size, created_at, last_used_at) VALUES (?1, ?2, ?3, ?3)
             ON CONFLICT(digest) DO UPDATE SET last_used_at = excluded.last_used_at",
        )
        .bind(digest)
        .bind(size)
        .bind(now)
        .execute(&self.write_pool)
        .await?;
        Ok(())
    }

    pub async fn touch_layers(&self, digests: &[String]) -> Result<()> {
        let now = Utc::now().to_rfc3339();
        for digest in digests {
            sqlx::query("UPDATE layers SET last_used_at = ?1 WHERE digest = ?2")
                .bind(&now)
                .bind(digest)
                .execute(&self.write_pool)
                .await?;
        }
        Ok(())
    }

    pub async fn delete_layer(&self, digest: &str) -> Result<()> {
        sqlx::query("DELETE FROM layers WHERE digest = ?1")
            .bind(digest)
            .execute(&self.write_pool)
            .await?;
        Ok(())
    }

    pub async fn kv_get(&self, key: &str) -> Result<Option<String>> {
        let row: Option<(String,)> = sqlx::query_as("SELECT value FROM kv WHERE key = ?1")
            .bind(key)
            .fetch_optional(&self.read_pool)
            .await?;
        Ok(row.map(|(v,)| v))
    }

    pub async fn kv_set(&self, key: &str, value: &str) -> Result<()> {
        sqlx::query(
            "INSERT INTO kv (key, value) VALUES (?1, ?2)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value",
        )
        .bind(key)
        .bind(value)
        .execute(&self.write_pool)
        .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn store() -> DurableStore {
        let dir = tempfile::tempdir().unwrap();
        DurableStore::open(&dir.path().join("test.sqlite3"))
            .await
            .unwrap()
    }

    fn row(app: &str, id: DeploymentId) -> DeploymentRow {
        DeploymentRow {
            id,
            app_name: app.to_owned(),
            raw_config: b"{}".to_vec(),
            image_ref: format!("{app}:{id}"),
            state: DeploymentState::Healthy,
            failed_reason: None,
            created_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn save_and_get_roundtrips() {
        let store = store().await;
        let id = DeploymentId::now();
        store.save_deployment(&row("web", id)).await.unwrap();
        let got = store.get_deployment(&id).await.unwrap();
        assert_eq!(got.app_name, "web");
    }

    #[tokio::test]
    async fn prune_keeps_newest_by_id() {
        let store = store().await;
        let mut ids = vec![];
        let mut prev = DeploymentId::now();
        for _ in 0..5 {
            store.save_deployment(&row("web", prev)).await.unwrap();
            ids.push(prev);
            prev = DeploymentId::after(prev);
        }
        let deleted = store.prune_old_deployments("web", 2).await.unwrap();
        assert_eq!(deleted.len(), 3);
        let remaining = store.get_deployment_history("web", None).await.unwrap();
        assert_eq!(remaining.len(), 2);
        assert_eq!(remaining[0].id, *ids.last().unwrap());
    }

    #[tokio::test]
    async fn has_layers_splits_missing_and_present() {
        let store = store().await;
        store.save_layer("sha256:aaa", 100).await.unwrap();
        let (missing, exists) = store
            .has_layers(&["sha256:aaa".to_owned(), "sha256:bbb".to_owned()])
            .await
            .unwrap();
        assert_eq!(exists, vec!["sha256:aaa".to_owned()]);
        assert_eq!(missing, vec!["sha256:bbb".to_owned()]);
    }
}

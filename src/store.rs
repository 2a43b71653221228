//! SQLite-backed deployment state store.
//!
//! Durable record of applications, their deployment history, per-deployment
//! stage transitions, and provisioned resource bindings. The pipeline
//! coordinator is the only writer of application and deployment state; the
//! control API reads through the same store.

use anyhow::{Context, Result};
use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::{Arc, Mutex};
use tracing::{debug, info};

use crate::error::Stage;

/// Current schema version for migrations
const SCHEMA_VERSION: i32 = 2;

/// Application lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AppState {
    /// Created but never deployed
    Uninitialized,
    /// No deployment in flight
    Idle,
    /// A deployment holds the application lock
    Deploying,
    /// Last deployment failed and nothing is serving
    Failed,
}

impl AppState {
    pub fn as_str(&self) -> &'static str {
        match self {
            AppState::Uninitialized => "uninitialized",
            AppState::Idle => "idle",
            AppState::Deploying => "deploying",
            AppState::Failed => "failed",
        }
    }
}

/// Terminal outcome of a deployment
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    Succeeded,
    Failed,
    RolledBack,
    /// Promoted and serving but the route update was rejected
    Degraded,
}

impl Outcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Outcome::Succeeded => "succeeded",
            Outcome::Failed => "failed",
            Outcome::RolledBack => "rolled_back",
            Outcome::Degraded => "degraded",
        }
    }
}

/// What started a deployment
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerKind {
    /// git push through the repository hook
    Push,
    /// Manual deploy of a revision
    Deploy,
    /// Redeploy of the active image
    Restart,
    /// Redeploy of a historical image
    Rollback,
    /// Build without a swap
    Build,
}

impl TriggerKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TriggerKind::Push => "push",
            TriggerKind::Deploy => "deploy",
            TriggerKind::Restart => "restart",
            TriggerKind::Rollback => "rollback",
            TriggerKind::Build => "build",
        }
    }
}

/// Per-stage progress marker
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StageStatus {
    Started,
    Succeeded,
    Failed,
    Cancelled,
}

impl StageStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            StageStatus::Started => "started",
            StageStatus::Succeeded => "succeeded",
            StageStatus::Failed => "failed",
            StageStatus::Cancelled => "cancelled",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppRecord {
    pub name: String,
    pub state: String,
    pub created_at: String,
    pub active_seq: Option<i64>,
    pub in_progress_seq: Option<i64>,
    pub active_container_id: Option<String>,
    pub active_container_name: Option<String>,
    pub active_port: Option<u16>,
    pub degraded: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeploymentRecord {
    pub app_name: String,
    pub seq: i64,
    pub revision: String,
    pub trigger: String,
    pub image: Option<String>,
    pub outcome: Option<String>,
    pub error_kind: Option<String>,
    pub error_message: Option<String>,
    pub build_log_path: Option<String>,
    pub started_at: String,
    pub finished_at: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageRecord {
    pub seq: i64,
    pub stage: String,
    pub status: String,
    pub detail: Option<String>,
    pub created_at: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BindingRecord {
    pub app_name: String,
    pub kind: String,
    pub idempotency_key: String,
    pub status: String,
    pub container_id: Option<String>,
    pub container_name: Option<String>,
    /// JSON connection material; credentials inside are only ever
    /// rendered into container environments, never logged
    pub connection: String,
    pub created_at: String,
}

/// Database connection wrapper with thread-safe access
#[derive(Clone)]
pub struct Store {
    conn: Arc<Mutex<Connection>>,
}

pub(crate) fn now_rfc3339() -> String {
    Utc::now().to_rfc3339()
}

impl Store {
    /// Open or create a store at the given path
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let conn = Connection::open(path).context("Failed to open state store")?;

        // WAL for concurrent API reads while a deployment writes
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA foreign_keys=ON;")?;

        let store = Self {
            conn: Arc::new(Mutex::new(conn)),
        };

        store.run_migrations()?;

        info!("State store opened at {}", path.display());
        Ok(store)
    }

    /// Open an in-memory store (for testing)
    pub fn open_in_memory() -> Result<Self> {
        let conn =
            Connection::open_in_memory().context("Failed to open in-memory state store")?;

        conn.execute_batch("PRAGMA foreign_keys=ON;")?;

        let store = Self {
            conn: Arc::new(Mutex::new(conn)),
        };

        store.run_migrations()?;
        Ok(store)
    }

    fn run_migrations(&self) -> Result<()> {
        let conn = self.conn.lock().unwrap();

        conn.execute(
            "CREATE TABLE IF NOT EXISTS schema_migrations (
                version INTEGER PRIMARY KEY,
                applied_at TEXT NOT NULL DEFAULT (datetime('now'))
            )",
            [],
        )?;

        let current_version: i32 = conn
            .query_row(
                "SELECT COALESCE(MAX(version), 0) FROM schema_migrations",
                [],
                |row| row.get(0),
            )
            .unwrap_or(0);

        if current_version < SCHEMA_VERSION {
            info!(
                "Running migrations from v{} to v{}",
                current_version, SCHEMA_VERSION
            );

            if current_version < 1 {
                self.migrate_v1(&conn)?;
            }

            if current_version < 2 {
                self.migrate_v2(&conn)?;
            }
        }

        Ok(())
    }

    /// Migration v1: applications, deployments, stage log
    fn migrate_v1(&self, conn: &Connection) -> Result<()> {
        debug!("Applying migration v1: initial schema");

        conn.execute_batch(
            r#"
            -- Applications
            CREATE TABLE IF NOT EXISTS apps (
                name TEXT PRIMARY KEY,
                state TEXT NOT NULL DEFAULT 'uninitialized',
                created_at TEXT NOT NULL,
                active_seq INTEGER,
                in_progress_seq INTEGER,
                active_container_id TEXT,
                active_container_name TEXT,
                active_port INTEGER,
                degraded INTEGER NOT NULL DEFAULT 0
            );

            -- Deployment history, seq monotonic per application
            CREATE TABLE IF NOT EXISTS deployments (
                app_name TEXT NOT NULL,
                seq INTEGER NOT NULL,
                revision TEXT NOT NULL,
                trigger TEXT NOT NULL,
                image TEXT,
                outcome TEXT,
                error_kind TEXT,
                error_message TEXT,
                build_log_path TEXT,
                started_at TEXT NOT NULL,
                finished_at TEXT,
                PRIMARY KEY (app_name, seq),
                FOREIGN KEY (app_name) REFERENCES apps(name) ON DELETE CASCADE
            );

            -- Stage transition log, append-only per deployment
            CREATE TABLE IF NOT EXISTS deployment_stages (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                app_name TEXT NOT NULL,
                seq INTEGER NOT NULL,
                stage TEXT NOT NULL,
                status TEXT NOT NULL,
                detail TEXT,
                created_at TEXT NOT NULL,
                FOREIGN KEY (app_name, seq) REFERENCES deployments(app_name, seq) ON DELETE CASCADE
            );

            CREATE INDEX IF NOT EXISTS idx_deployments_app ON deployments(app_name, seq DESC);
            CREATE INDEX IF NOT EXISTS idx_stages_deployment ON deployment_stages(app_name, seq);

            -- Record migration
            INSERT INTO schema_migrations (version) VALUES (1);
        "#,
        )?;

        Ok(())
    }

    /// Migration v2: provisioned resource bindings
    fn migrate_v2(&self, conn: &Connection) -> Result<()> {
        debug!("Applying migration v2: resource bindings");

        conn.execute_batch(
            r#"
            -- One active binding per (app, kind)
            CREATE TABLE IF NOT EXISTS resource_bindings (
                app_name TEXT NOT NULL,
                kind TEXT NOT NULL,
                idempotency_key TEXT NOT NULL,
                status TEXT NOT NULL DEFAULT 'active',
                container_id TEXT,
                container_name TEXT,
                connection TEXT NOT NULL,
                created_at TEXT NOT NULL,
                PRIMARY KEY (app_name, kind),
                FOREIGN KEY (app_name) REFERENCES apps(name) ON DELETE CASCADE
            );

            -- Record migration
            INSERT INTO schema_migrations (version) VALUES (2);
        "#,
        )?;

        Ok(())
    }

    // ==================== App Operations ====================

    pub fn create_app(&self, name: &str) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO apps (name, state, created_at) VALUES (?1, ?2, ?3)",
            params![name, AppState::Uninitialized.as_str(), now_rfc3339()],
        )?;
        Ok(())
    }

    pub fn get_app(&self, name: &str) -> Result<Option<AppRecord>> {
        let conn = self.conn.lock().unwrap();
        conn.query_row(
            "SELECT name, state, created_at, active_seq, in_progress_seq,
                    active_container_id, active_container_name, active_port, degraded
             FROM apps WHERE name = ?1",
            params![name],
            Self::map_app_row,
        )
        .optional()
        .context("Failed to get app")
    }

    pub fn list_apps(&self) -> Result<Vec<AppRecord>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT name, state, created_at, active_seq, in_progress_seq,
                    active_container_id, active_container_name, active_port, degraded
             FROM apps ORDER BY name",
        )?;

        let apps = stmt
            .query_map([], Self::map_app_row)?
            .collect::<Result<Vec<_>, _>>()?;

        Ok(apps)
    }

    fn map_app_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<AppRecord> {
        Ok(AppRecord {
            name: row.get(0)?,
            state: row.get(1)?,
            created_at: row.get(2)?,
            active_seq: row.get(3)?,
            in_progress_seq: row.get(4)?,
            active_container_id: row.get(5)?,
            active_container_name: row.get(6)?,
            active_port: row.get::<_, Option<i64>>(7)?.map(|p| p as u16),
            degraded: row.get(8)?,
        })
    }

    pub fn set_app_state(&self, name: &str, state: AppState) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "UPDATE apps SET state = ?1 WHERE name = ?2",
            params![state.as_str(), name],
        )?;
        Ok(())
    }

    pub fn set_app_degraded(&self, name: &str, degraded: bool) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "UPDATE apps SET degraded = ?1 WHERE name = ?2",
            params![degraded, name],
        )?;
        Ok(())
    }

    /// Record the promoted deployment and its serving container.
    pub fn promote_deployment(
        &self,
        name: &str,
        seq: i64,
        container_id: &str,
        container_name: &str,
        port: u16,
    ) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "UPDATE apps SET active_seq = ?1, active_container_id = ?2,
                    active_container_name = ?3, active_port = ?4, degraded = 0
             WHERE name = ?5",
            params![seq, container_id, container_name, port as i64, name],
        )?;
        Ok(())
    }

    /// Clear the serving container after a stop.
    pub fn clear_active_container(&self, name: &str) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "UPDATE apps SET active_container_id = NULL, active_container_name = NULL,
                    active_port = NULL, degraded = 0
             WHERE name = ?1",
            params![name],
        )?;
        Ok(())
    }

    pub fn delete_app(&self, name: &str) -> Result<bool> {
        let conn = self.conn.lock().unwrap();
        let rows = conn.execute("DELETE FROM apps WHERE name = ?1", params![name])?;
        Ok(rows > 0)
    }

    /// Application counts by lifecycle state, for the status endpoint.
    pub fn count_apps_by_state(&self) -> Result<Vec<(String, i64)>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt =
            conn.prepare("SELECT state, COUNT(*) FROM apps GROUP BY state ORDER BY state")?;
        let counts = stmt
            .query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(counts)
    }

    // ==================== Deployment Operations ====================

    /// Allocate the next sequence number and open a deployment record.
    /// Callers hold the application's deployment lock, so two concurrent
    /// begins for one app cannot happen.
    pub fn begin_deployment(
        &self,
        app_name: &str,
        revision: &str,
        trigger: TriggerKind,
    ) -> Result<i64> {
        let conn = self.conn.lock().unwrap();
        let seq: i64 = conn.query_row(
            "SELECT COALESCE(MAX(seq), 0) + 1 FROM deployments WHERE app_name = ?1",
            params![app_name],
            |row| row.get(0),
        )?;
        conn.execute(
            "INSERT INTO deployments (app_name, seq, revision, trigger, started_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![app_name, seq, revision, trigger.as_str(), now_rfc3339()],
        )?;
        conn.execute(
            "UPDATE apps SET state = ?1, in_progress_seq = ?2 WHERE name = ?3",
            params![AppState::Deploying.as_str(), seq, app_name],
        )?;
        Ok(seq)
    }

    /// Insert an already-terminal deployment without moving the application
    /// through `deploying`. Used when an attempt dies before it ever held the
    /// deployment lock, e.g. a lock wait that timed out behind a stuck build.
    pub fn record_terminal_deployment(
        &self,
        app_name: &str,
        revision: &str,
        trigger: TriggerKind,
        outcome: Outcome,
        error_kind: Option<&str>,
        error_message: Option<&str>,
    ) -> Result<i64> {
        let conn = self.conn.lock().unwrap();
        let seq: i64 = conn.query_row(
            "SELECT COALESCE(MAX(seq), 0) + 1 FROM deployments WHERE app_name = ?1",
            params![app_name],
            |row| row.get(0),
        )?;
        let now = now_rfc3339();
        conn.execute(
            "INSERT INTO deployments
                (app_name, seq, revision, trigger, outcome, error_kind, error_message,
                 started_at, finished_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?8)",
            params![
                app_name,
                seq,
                revision,
                trigger.as_str(),
                outcome.as_str(),
                error_kind,
                error_message,
                now
            ],
        )?;
        Ok(seq)
    }

    pub fn set_deployment_image(&self, app_name: &str, seq: i64, image: &str) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "UPDATE deployments SET image = ?1 WHERE app_name = ?2 AND seq = ?3",
            params![image, app_name, seq],
        )?;
        Ok(())
    }

    pub fn set_build_log_path(&self, app_name: &str, seq: i64, path: &str) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "UPDATE deployments SET build_log_path = ?1 WHERE app_name = ?2 AND seq = ?3",
            params![path, app_name, seq],
        )?;
        Ok(())
    }

    /// Close a deployment with its terminal outcome and move the
    /// application out of `deploying`.
    pub fn finish_deployment(
        &self,
        app_name: &str,
        seq: i64,
        outcome: Outcome,
        error_kind: Option<&str>,
        error_message: Option<&str>,
        app_state: AppState,
    ) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "UPDATE deployments SET outcome = ?1, error_kind = ?2, error_message = ?3,
                    finished_at = ?4
             WHERE app_name = ?5 AND seq = ?6",
            params![
                outcome.as_str(),
                error_kind,
                error_message,
                now_rfc3339(),
                app_name,
                seq
            ],
        )?;
        conn.execute(
            "UPDATE apps SET state = ?1, in_progress_seq = NULL WHERE name = ?2",
            params![app_state.as_str(), app_name],
        )?;
        Ok(())
    }

    pub fn get_deployment(&self, app_name: &str, seq: i64) -> Result<Option<DeploymentRecord>> {
        let conn = self.conn.lock().unwrap();
        conn.query_row(
            "SELECT app_name, seq, revision, trigger, image, outcome, error_kind,
                    error_message, build_log_path, started_at, finished_at
             FROM deployments WHERE app_name = ?1 AND seq = ?2",
            params![app_name, seq],
            Self::map_deployment_row,
        )
        .optional()
        .context("Failed to get deployment")
    }

    /// Recent deployments for an app, newest first.
    pub fn get_deployments(&self, app_name: &str, limit: usize) -> Result<Vec<DeploymentRecord>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT app_name, seq, revision, trigger, image, outcome, error_kind,
                    error_message, build_log_path, started_at, finished_at
             FROM deployments WHERE app_name = ?1 ORDER BY seq DESC LIMIT ?2",
        )?;

        let deployments = stmt
            .query_map(params![app_name, limit as i64], Self::map_deployment_row)?
            .collect::<Result<Vec<_>, _>>()?;

        Ok(deployments)
    }

    /// Distinct image tags recorded across an application's deployment
    /// history, for cleaning up built images on destroy.
    pub fn deployment_images(&self, app_name: &str) -> Result<Vec<String>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT DISTINCT image FROM deployments
             WHERE app_name = ?1 AND image IS NOT NULL ORDER BY image",
        )?;

        let images = stmt
            .query_map(params![app_name], |row| row.get(0))?
            .collect::<Result<Vec<_>, _>>()?;

        Ok(images)
    }

    /// Newest deployment older than `before_seq` whose image both exists and
    /// actually passed verification, i.e. a safe rollback target.
    pub fn latest_rollback_target(
        &self,
        app_name: &str,
        before_seq: i64,
    ) -> Result<Option<DeploymentRecord>> {
        let conn = self.conn.lock().unwrap();
        conn.query_row(
            "SELECT app_name, seq, revision, trigger, image, outcome, error_kind,
                    error_message, build_log_path, started_at, finished_at
             FROM deployments
             WHERE app_name = ?1 AND seq < ?2 AND image IS NOT NULL
               AND outcome IN ('succeeded', 'degraded')
             ORDER BY seq DESC LIMIT 1",
            params![app_name, before_seq],
            Self::map_deployment_row,
        )
        .optional()
        .context("Failed to find rollback target")
    }

    fn map_deployment_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<DeploymentRecord> {
        Ok(DeploymentRecord {
            app_name: row.get(0)?,
            seq: row.get(1)?,
            revision: row.get(2)?,
            trigger: row.get(3)?,
            image: row.get(4)?,
            outcome: row.get(5)?,
            error_kind: row.get(6)?,
            error_message: row.get(7)?,
            build_log_path: row.get(8)?,
            started_at: row.get(9)?,
            finished_at: row.get(10)?,
        })
    }

    /// Drop deployment records beyond the newest `keep`, never touching the
    /// promoted deployment (its image tag backs restart and rollback).
    pub fn prune_deployments(&self, app_name: &str, keep: usize) -> Result<usize> {
        let conn = self.conn.lock().unwrap();
        let deleted = conn.execute(
            "DELETE FROM deployments
             WHERE app_name = ?1
               AND seq NOT IN (
                   SELECT seq FROM deployments WHERE app_name = ?1
                   ORDER BY seq DESC LIMIT ?2
               )
               AND seq != COALESCE((SELECT active_seq FROM apps WHERE name = ?1), -1)",
            params![app_name, keep as i64],
        )?;
        if deleted > 0 {
            debug!(app = app_name, deleted, "Pruned deployment history");
        }
        Ok(deleted)
    }

    // ==================== Stage Log Operations ====================

    pub fn record_stage(
        &self,
        app_name: &str,
        seq: i64,
        stage: Stage,
        status: StageStatus,
        detail: Option<&str>,
    ) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO deployment_stages (app_name, seq, stage, status, detail, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                app_name,
                seq,
                stage.as_str(),
                status.as_str(),
                detail,
                now_rfc3339()
            ],
        )?;
        Ok(())
    }

    /// Stage log for one deployment in insertion order.
    pub fn get_stages(&self, app_name: &str, seq: i64) -> Result<Vec<StageRecord>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT seq, stage, status, detail, created_at
             FROM deployment_stages WHERE app_name = ?1 AND seq = ?2 ORDER BY id",
        )?;

        let stages = stmt
            .query_map(params![app_name, seq], |row| {
                Ok(StageRecord {
                    seq: row.get(0)?,
                    stage: row.get(1)?,
                    status: row.get(2)?,
                    detail: row.get(3)?,
                    created_at: row.get(4)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;

        Ok(stages)
    }

    // ==================== Resource Binding Operations ====================

    pub fn upsert_binding(&self, binding: &BindingRecord) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO resource_bindings
                (app_name, kind, idempotency_key, status, container_id, container_name,
                 connection, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
             ON CONFLICT(app_name, kind) DO UPDATE SET
                idempotency_key = excluded.idempotency_key,
                status = excluded.status,
                container_id = excluded.container_id,
                container_name = excluded.container_name,
                connection = excluded.connection",
            params![
                binding.app_name,
                binding.kind,
                binding.idempotency_key,
                binding.status,
                binding.container_id,
                binding.container_name,
                binding.connection,
                now_rfc3339()
            ],
        )?;
        Ok(())
    }

    pub fn get_binding(&self, app_name: &str, kind: &str) -> Result<Option<BindingRecord>> {
        let conn = self.conn.lock().unwrap();
        conn.query_row(
            "SELECT app_name, kind, idempotency_key, status, container_id, container_name,
                    connection, created_at
             FROM resource_bindings WHERE app_name = ?1 AND kind = ?2",
            params![app_name, kind],
            Self::map_binding_row,
        )
        .optional()
        .context("Failed to get binding")
    }

    pub fn get_bindings(&self, app_name: &str) -> Result<Vec<BindingRecord>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT app_name, kind, idempotency_key, status, container_id, container_name,
                    connection, created_at
             FROM resource_bindings WHERE app_name = ?1 ORDER BY kind",
        )?;

        let bindings = stmt
            .query_map(params![app_name], Self::map_binding_row)?
            .collect::<Result<Vec<_>, _>>()?;

        Ok(bindings)
    }

    fn map_binding_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<BindingRecord> {
        Ok(BindingRecord {
            app_name: row.get(0)?,
            kind: row.get(1)?,
            idempotency_key: row.get(2)?,
            status: row.get(3)?,
            container_id: row.get(4)?,
            container_name: row.get(5)?,
            connection: row.get(6)?,
            created_at: row.get(7)?,
        })
    }

    pub fn delete_binding(&self, app_name: &str, kind: &str) -> Result<bool> {
        let conn = self.conn.lock().unwrap();
        let rows = conn.execute(
            "DELETE FROM resource_bindings WHERE app_name = ?1 AND kind = ?2",
            params![app_name, kind],
        )?;
        Ok(rows > 0)
    }
}

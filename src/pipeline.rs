//! Deployment pipeline coordination.
//!
//! One work queue, a bounded worker pool, and a per-application lock held
//! across every stage of a run. Requests land in a per-application pending
//! slot where a newer request silently replaces an older one that has not
//! started yet; whoever holds the lock drains the slot, so an app never
//! runs two deployments at once while different apps deploy in parallel.

use anyhow::{bail, Context};
use dashmap::DashMap;
use serde::Serialize;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, error, info, warn};

use crate::builder::Builder;
use crate::error::{PipelineError, PipelineResult, Stage};
use crate::git::{self, GitManager};
use crate::manifest;
use crate::orchestrator::{container_name, Orchestrator, StartedContainer};
use crate::provision::Provisioner;
use crate::routes::{hostname, HttpsRoute, Route, RouteRegistrar};
use crate::store::{AppState, Outcome, StageStatus, Store, TriggerKind};

const QUEUE_CAPACITY: usize = 1024;

/// A deployment request parked in an application's pending slot.
#[derive(Debug, Clone)]
pub enum PendingDeploy {
    /// Build and swap to a revision (push or manual deploy).
    Deploy {
        trigger: TriggerKind,
        revision: Option<String>,
    },
    /// Build without swapping anything.
    BuildOnly,
    /// Redeploy the active image under a fresh sequence number.
    Restart,
    /// Redeploy a historical image.
    Rollback { seq: Option<i64> },
}

impl PendingDeploy {
    fn trigger(&self) -> TriggerKind {
        match self {
            PendingDeploy::Deploy { trigger, .. } => *trigger,
            PendingDeploy::BuildOnly => TriggerKind::Build,
            PendingDeploy::Restart => TriggerKind::Restart,
            PendingDeploy::Rollback { .. } => TriggerKind::Rollback,
        }
    }

    fn requested_revision(&self) -> Option<&str> {
        match self {
            PendingDeploy::Deploy { revision, .. } => revision.as_deref(),
            _ => None,
        }
    }
}

/// Why a request was rejected at the door rather than queued.
#[derive(Debug, Error)]
pub enum SubmitError {
    #[error("unknown application '{0}'")]
    UnknownApp(String),
    #[error("invalid revision '{0}'")]
    InvalidRevision(String),
    #[error("application '{0}' is being destroyed")]
    DestroyInProgress(String),
    #[error("deployment queue is full")]
    QueueFull,
    #[error(transparent)]
    Store(#[from] anyhow::Error),
}

/// What a stop request actually did.
#[derive(Debug, Serialize)]
pub struct StopSummary {
    pub cancelled_in_flight: bool,
    pub dropped_pending: bool,
    pub stopped_container: Option<String>,
}

/// Coordinator knobs lifted from the daemon configuration.
#[derive(Debug, Clone)]
pub struct PipelineSettings {
    pub domain: String,
    pub history_limit: usize,
    pub lock_timeout: Duration,
    pub logs_dir: PathBuf,
}

#[derive(Clone)]
pub struct Coordinator {
    inner: Arc<Inner>,
}

struct Inner {
    store: Store,
    builder: Builder,
    provisioner: Provisioner,
    orchestrator: Orchestrator,
    routes: Arc<RouteRegistrar>,
    repos: Arc<GitManager>,
    settings: PipelineSettings,
    /// One deployment lock per application, held across all stages
    locks: DashMap<String, Arc<Mutex<()>>>,
    /// Latest not-yet-started request per application
    pending: DashMap<String, PendingDeploy>,
    /// Cancellation handles for in-flight runs
    cancels: DashMap<String, Arc<watch::Sender<bool>>>,
    /// Apps mid-destroy reject new work
    destroying: DashMap<String, ()>,
    queue_tx: mpsc::Sender<String>,
}

impl Coordinator {
    pub fn new(
        store: Store,
        builder: Builder,
        provisioner: Provisioner,
        orchestrator: Orchestrator,
        routes: Arc<RouteRegistrar>,
        repos: Arc<GitManager>,
        settings: PipelineSettings,
    ) -> (Self, mpsc::Receiver<String>) {
        let (queue_tx, queue_rx) = mpsc::channel(QUEUE_CAPACITY);
        let coordinator = Self {
            inner: Arc::new(Inner {
                store,
                builder,
                provisioner,
                orchestrator,
                routes,
                repos,
                settings,
                locks: DashMap::new(),
                pending: DashMap::new(),
                cancels: DashMap::new(),
                destroying: DashMap::new(),
                queue_tx,
            }),
        };
        (coordinator, queue_rx)
    }

    /// Spawn the deploy worker pool. Workers share one receiver; each name
    /// on the queue is a nudge to drain that application's pending slot.
    pub fn spawn_workers(
        &self,
        count: usize,
        queue_rx: mpsc::Receiver<String>,
        shutdown: watch::Receiver<bool>,
    ) -> Vec<JoinHandle<()>> {
        let queue_rx = Arc::new(Mutex::new(queue_rx));
        (0..count.max(1))
            .map(|id| {
                let inner = Arc::clone(&self.inner);
                let queue_rx = Arc::clone(&queue_rx);
                let shutdown = shutdown.clone();
                tokio::spawn(worker_loop(inner, queue_rx, shutdown, id))
            })
            .collect()
    }

    /// Accept a push notification: validate, park in the pending slot, and
    /// return before any pipeline work happens.
    pub fn on_push(&self, app: &str, revision: &str) -> Result<(), SubmitError> {
        if !git::plausible_revision(revision) {
            return Err(SubmitError::InvalidRevision(revision.to_string()));
        }
        self.submit(
            app,
            PendingDeploy::Deploy {
                trigger: TriggerKind::Push,
                revision: Some(revision.to_string()),
            },
        )
    }

    /// Park a request in the application's pending slot and nudge the
    /// workers. A newer request replaces an older one that has not started.
    pub fn submit(&self, app: &str, task: PendingDeploy) -> Result<(), SubmitError> {
        let inner = &self.inner;
        if inner.destroying.contains_key(app) {
            return Err(SubmitError::DestroyInProgress(app.to_string()));
        }
        if inner.store.get_app(app)?.is_none() {
            return Err(SubmitError::UnknownApp(app.to_string()));
        }

        let trigger = task.trigger();
        if let Some(old) = inner.pending.insert(app.to_string(), task) {
            info!(
                app,
                superseded = old.trigger().as_str(),
                by = trigger.as_str(),
                "Superseding queued deployment"
            );
        } else {
            debug!(app, trigger = trigger.as_str(), "Queued deployment");
        }

        match inner.queue_tx.try_send(app.to_string()) {
            Ok(()) => Ok(()),
            Err(mpsc::error::TrySendError::Full(_)) => {
                // The slot stays set; the next successful nudge drains it
                warn!(app, "Deployment queue is full");
                Err(SubmitError::QueueFull)
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                Err(SubmitError::Store(anyhow::anyhow!("daemon is shutting down")))
            }
        }
    }

    /// Cancel any in-flight run, drop pending work, stop the serving
    /// container, and retract the route. Runs inline from the API handler;
    /// the application ends `idle` with its history intact.
    pub async fn stop_app(&self, app: &str) -> anyhow::Result<StopSummary> {
        let inner = &self.inner;

        let cancelled_in_flight = inner.request_cancel(app);
        let lock = inner.app_lock(app);
        let _guard = timeout(inner.settings.lock_timeout, lock.lock())
            .await
            .map_err(|_| anyhow::anyhow!("timed out waiting for the in-flight deployment of '{}' to cancel", app))?;

        let dropped_pending = inner.pending.remove(app).is_some();

        let record = inner
            .store
            .get_app(app)?
            .with_context(|| format!("unknown application '{}'", app))?;

        let stopped_container = record.active_container_name.clone();
        if let Some(name) = &stopped_container {
            info!(app, container = %name, "Stopping application");
            inner.orchestrator.stop_and_remove(name).await;
        }

        inner.routes.retract(app)?;
        inner.store.clear_active_container(app)?;
        inner.store.set_app_state(app, AppState::Idle)?;

        Ok(StopSummary {
            cancelled_in_flight,
            dropped_pending,
            stopped_container,
        })
    }

    pub fn is_destroying(&self, app: &str) -> bool {
        self.inner.destroying.contains_key(app)
    }

    /// Tear an application down completely: cancel and stop like `stop_app`,
    /// then deprovision resources and delete records, repository, work tree,
    /// and build logs. New requests are rejected while this runs.
    pub async fn destroy_app(&self, app: &str) -> anyhow::Result<()> {
        if self.inner.destroying.insert(app.to_string(), ()).is_some() {
            bail!("application '{}' is already being destroyed", app);
        }
        let result = self.destroy_locked(app).await;
        self.inner.destroying.remove(app);
        result
    }

    async fn destroy_locked(&self, app: &str) -> anyhow::Result<()> {
        let inner = &self.inner;

        inner.request_cancel(app);
        let lock = inner.app_lock(app);
        let _guard = timeout(inner.settings.lock_timeout, lock.lock())
            .await
            .map_err(|_| anyhow::anyhow!("timed out waiting for the in-flight deployment of '{}' to cancel", app))?;

        inner.pending.remove(app);

        let record = inner
            .store
            .get_app(app)?
            .with_context(|| format!("unknown application '{}'", app))?;

        info!(app, "Destroying application");

        inner.routes.retract(app)?;
        if let Some(name) = &record.active_container_name {
            inner.orchestrator.stop_and_remove(name).await;
        }
        inner.provisioner.deprovision_app(app).await?;

        // Image tags must be collected before the rows go
        for image in inner.store.deployment_images(app)? {
            inner.orchestrator.docker().remove_image(&image).await?;
        }

        inner.store.delete_app(app)?;
        inner.repos.delete_repo(app).await?;

        let logs = inner.settings.logs_dir.join(app);
        match tokio::fs::remove_dir_all(&logs).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => warn!(app, error = %e, "Failed to remove build logs"),
        }

        inner.locks.remove(app);
        info!(app, "Application destroyed");
        Ok(())
    }

    /// Close out deployments orphaned by a previous process: anything still
    /// `deploying` at startup died with that process.
    pub fn recover(&self) -> anyhow::Result<usize> {
        let mut recovered = 0;
        for app in self.inner.store.list_apps()? {
            if app.state != AppState::Deploying.as_str() {
                continue;
            }
            let end_state = if app.active_container_id.is_some() {
                AppState::Idle
            } else {
                AppState::Failed
            };
            if let Some(seq) = app.in_progress_seq {
                warn!(app = %app.name, seq, "Closing deployment orphaned by restart");
                self.inner.store.finish_deployment(
                    &app.name,
                    seq,
                    Outcome::Failed,
                    Some("internal"),
                    Some("daemon restarted while the deployment was in flight"),
                    end_state,
                )?;
            } else {
                self.inner.store.set_app_state(&app.name, end_state)?;
            }
            recovered += 1;
        }
        Ok(recovered)
    }
}

async fn worker_loop(
    inner: Arc<Inner>,
    queue_rx: Arc<Mutex<mpsc::Receiver<String>>>,
    mut shutdown: watch::Receiver<bool>,
    worker_id: usize,
) {
    debug!(worker_id, "Deploy worker started");
    loop {
        let app = {
            let mut rx = queue_rx.lock().await;
            tokio::select! {
                name = rx.recv() => match name {
                    Some(name) => name,
                    None => break,
                },
                res = shutdown.changed() => {
                    if res.is_err() || *shutdown.borrow() {
                        break;
                    }
                    continue;
                }
            }
        };
        inner.process_app(&app, &shutdown).await;
    }
    debug!(worker_id, "Deploy worker stopped");
}

impl Inner {
    fn app_lock(&self, app: &str) -> Arc<Mutex<()>> {
        self.locks
            .entry(app.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Flip the cancel flag of an in-flight run. True if one was running.
    fn request_cancel(&self, app: &str) -> bool {
        match self.cancels.get(app) {
            Some(tx) => tx.send(true).is_ok(),
            None => false,
        }
    }

    /// Take the lock and drain the application's pending slot. Called with a
    /// queue nudge; the slot may already be empty if a peer drained it.
    async fn process_app(&self, app: &str, shutdown: &watch::Receiver<bool>) {
        if !self.pending.contains_key(app) {
            return;
        }

        let lock = self.app_lock(app);
        let guard = match timeout(self.settings.lock_timeout, lock.lock()).await {
            Ok(guard) => guard,
            Err(_) => {
                // Whoever holds the lock is stuck past the bound; fail the
                // waiting request rather than queue behind it forever
                if let Some((_, task)) = self.pending.remove(app) {
                    let err = PipelineError::LockTimeout {
                        app: app.to_string(),
                        waited_secs: self.settings.lock_timeout.as_secs(),
                    };
                    error!(app, error = %err, "Dropping deployment request");
                    if let Err(e) = self.store.record_terminal_deployment(
                        app,
                        task.requested_revision().unwrap_or("unknown"),
                        task.trigger(),
                        Outcome::Failed,
                        Some(err.kind()),
                        Some(&err.to_string()),
                    ) {
                        error!(app, error = %e, "Failed to record lock timeout");
                    }
                }
                return;
            }
        };

        while let Some((_, task)) = self.pending.remove(app) {
            self.run_task(app, task, shutdown).await;
        }
        drop(guard);
    }

    /// Run one deployment end to end under the held application lock.
    async fn run_task(&self, app: &str, task: PendingDeploy, shutdown: &watch::Receiver<bool>) {
        let trigger = task.trigger();

        // Resolve what to deploy before opening a record, so requests that
        // reference nothing (no commits, bad rollback target) fail without
        // ever moving the app through `deploying`.
        let prepared = match self.prepare(app, &task).await {
            Ok(p) => p,
            Err(e) => {
                warn!(app, trigger = trigger.as_str(), error = %e, "Deployment rejected");
                if let Err(store_err) = self.store.record_terminal_deployment(
                    app,
                    task.requested_revision().unwrap_or("unknown"),
                    trigger,
                    Outcome::Failed,
                    Some(e.kind()),
                    Some(&e.to_string()),
                ) {
                    error!(app, error = %store_err, "Failed to record rejected deployment");
                }
                return;
            }
        };

        let seq = match self.store.begin_deployment(app, &prepared.revision, trigger) {
            Ok(seq) => seq,
            Err(e) => {
                error!(app, error = %e, "Failed to open deployment record");
                return;
            }
        };

        // Cancellation fans in from stop/destroy requests and daemon
        // shutdown; the forwarder bridges the latter.
        let (cancel_tx, mut cancel_rx) = watch::channel(false);
        let cancel_tx = Arc::new(cancel_tx);
        self.cancels.insert(app.to_string(), Arc::clone(&cancel_tx));
        let forwarder = {
            let cancel_tx = Arc::clone(&cancel_tx);
            let mut shutdown = shutdown.clone();
            tokio::spawn(async move {
                loop {
                    if *shutdown.borrow() {
                        let _ = cancel_tx.send(true);
                        break;
                    }
                    if shutdown.changed().await.is_err() {
                        break;
                    }
                }
            })
        };

        info!(
            app,
            seq,
            trigger = trigger.as_str(),
            revision = %short_rev(&prepared.revision),
            "Deployment started"
        );
        let started_at = Instant::now();

        let result = self.run_stages(app, seq, &prepared, &mut cancel_rx).await;

        self.cancels.remove(app);
        forwarder.abort();

        let (outcome, error_kind, error_message) = match &result {
            Ok(outcome) => (*outcome, None, None),
            Err(e) => {
                // A failed health check means the swap was undone
                let outcome = if matches!(e, PipelineError::HealthCheck { .. }) {
                    Outcome::RolledBack
                } else {
                    Outcome::Failed
                };
                (outcome, Some(e.kind()), Some(e.to_string()))
            }
        };

        let end_state = match self.store.get_app(app) {
            Ok(Some(record)) if record.active_container_id.is_some() => AppState::Idle,
            _ if outcome == Outcome::Succeeded => AppState::Idle,
            _ => AppState::Failed,
        };

        if let Err(e) = self.store.finish_deployment(
            app,
            seq,
            outcome,
            error_kind,
            error_message.as_deref(),
            end_state,
        ) {
            error!(app, seq, error = %e, "Failed to close deployment record");
        }

        let elapsed = started_at.elapsed().as_secs_f64();
        match outcome {
            Outcome::Succeeded => {
                info!(app, seq, elapsed_secs = elapsed, "Deployment succeeded")
            }
            Outcome::Degraded => {
                warn!(app, seq, "Deployment promoted but the route update failed")
            }
            Outcome::RolledBack => {
                warn!(app, seq, "Deployment rolled back; previous container untouched")
            }
            Outcome::Failed => {
                warn!(app, seq, error = error_message.as_deref().unwrap_or(""), "Deployment failed")
            }
        }
    }

    /// Decide the revision and image source for a request.
    async fn prepare(&self, app: &str, task: &PendingDeploy) -> PipelineResult<Prepared> {
        let record = self
            .store
            .get_app(app)?
            .ok_or_else(|| anyhow::anyhow!("unknown application '{}'", app))?;

        match task {
            PendingDeploy::Deploy { revision, .. } => {
                let revision = self.resolve_or_head(app, revision.as_deref()).await?;
                Ok(Prepared {
                    revision,
                    image: ImageSource::Build,
                    swap: true,
                })
            }
            PendingDeploy::BuildOnly => {
                let revision = self.resolve_or_head(app, None).await?;
                Ok(Prepared {
                    revision,
                    image: ImageSource::Build,
                    swap: false,
                })
            }
            PendingDeploy::Restart => {
                let active = record.active_seq.ok_or_else(|| {
                    anyhow::anyhow!("'{}' has never deployed; nothing to restart", app)
                })?;
                let dep = self
                    .store
                    .get_deployment(app, active)?
                    .ok_or_else(|| anyhow::anyhow!("active deployment v{} is missing", active))?;
                let image = dep.image.ok_or_else(|| {
                    anyhow::anyhow!("active deployment v{} has no image", active)
                })?;
                Ok(Prepared {
                    revision: dep.revision,
                    image: ImageSource::Reuse(image),
                    swap: true,
                })
            }
            PendingDeploy::Rollback { seq } => {
                let target = match seq {
                    Some(seq) => {
                        if record.active_seq == Some(*seq) {
                            return Err(PipelineError::Other(anyhow::anyhow!(
                                "v{} is already active; use restart",
                                seq
                            )));
                        }
                        self.store.get_deployment(app, *seq)?.ok_or_else(|| {
                            anyhow::anyhow!("deployment v{} not found for '{}'", seq, app)
                        })?
                    }
                    None => {
                        let active = record.active_seq.ok_or_else(|| {
                            anyhow::anyhow!("'{}' has never deployed; nothing to roll back", app)
                        })?;
                        self.store.latest_rollback_target(app, active)?.ok_or_else(|| {
                            anyhow::anyhow!(
                                "no earlier verified deployment to roll back to for '{}'",
                                app
                            )
                        })?
                    }
                };
                let seq = target.seq;
                let image = target.image.ok_or_else(|| {
                    anyhow::anyhow!(
                        "deployment v{} has no built image (outcome: {})",
                        seq,
                        target.outcome.as_deref().unwrap_or("unknown")
                    )
                })?;
                Ok(Prepared {
                    revision: target.revision,
                    image: ImageSource::Reuse(image),
                    swap: true,
                })
            }
        }
    }

    async fn resolve_or_head(&self, app: &str, rev: Option<&str>) -> PipelineResult<String> {
        match self.repos.resolve_revision(app, rev).await? {
            Some(full) => Ok(full),
            None => Err(PipelineError::Other(anyhow::anyhow!(
                "repository for '{}' has no commits yet; push first",
                app
            ))),
        }
    }

    /// The stage machine. Every entry and exit is recorded in the stage log
    /// before the next stage starts; any error return leaves the previous
    /// container serving whatever it was serving.
    async fn run_stages(
        &self,
        app: &str,
        seq: i64,
        prepared: &Prepared,
        cancel: &mut watch::Receiver<bool>,
    ) -> PipelineResult<Outcome> {
        let worktree = self.repos.worktree_path(app);
        let host = hostname(app, &self.settings.domain);

        // Resolve
        self.check_cancel(app, seq, Stage::Resolve, cancel)?;
        self.log_stage(app, seq, Stage::Resolve, StageStatus::Started, None);
        if matches!(prepared.image, ImageSource::Build) {
            if let Err(e) = self.repos.checkout(app, &prepared.revision).await {
                let err = PipelineError::Other(e);
                self.fail_stage(app, seq, Stage::Resolve, &err);
                return Err(err);
            }
        }
        let config = match manifest::resolve(app, &worktree) {
            Ok(config) => config,
            Err(e) => {
                self.fail_stage(app, seq, Stage::Resolve, &e);
                return Err(e);
            }
        };
        self.log_stage(app, seq, Stage::Resolve, StageStatus::Succeeded, None);

        // Build
        let image = match &prepared.image {
            ImageSource::Reuse(image) => {
                self.store.set_deployment_image(app, seq, image)?;
                image.clone()
            }
            ImageSource::Build => {
                self.check_cancel(app, seq, Stage::Build, cancel)?;
                self.log_stage(app, seq, Stage::Build, StageStatus::Started, None);
                match self.builder.build(app, seq, &worktree, cancel).await {
                    Ok(out) => {
                        self.store.set_deployment_image(app, seq, &out.image)?;
                        self.store
                            .set_build_log_path(app, seq, &out.log_path.to_string_lossy())?;
                        let detail = format!("{} in {:.1}s", out.image, out.duration_secs);
                        self.log_stage(
                            app,
                            seq,
                            Stage::Build,
                            StageStatus::Succeeded,
                            Some(&detail),
                        );
                        out.image
                    }
                    Err(e) => {
                        self.fail_stage(app, seq, Stage::Build, &e);
                        return Err(e);
                    }
                }
            }
        };

        if !prepared.swap {
            return Ok(Outcome::Succeeded);
        }

        // Provision
        self.check_cancel(app, seq, Stage::Provision, cancel)?;
        self.log_stage(app, seq, Stage::Provision, StageStatus::Started, None);
        let database = match self.provisioner.database(app, &config.database, cancel).await {
            Ok(db) => db,
            Err(e) => {
                self.fail_stage(app, seq, Stage::Provision, &e);
                return Err(e);
            }
        };
        let tls = match self.provisioner.certificate(app, &host, &config.https) {
            Ok(tls) => tls,
            Err(e) => {
                self.fail_stage(app, seq, Stage::Provision, &e);
                return Err(e);
            }
        };
        let detail = match (&database, &tls) {
            (Some(db), _) => Some(format!("database {} ready", db.container_name)),
            (None, Some(_)) => Some("certificate ready".to_string()),
            (None, None) => None,
        };
        self.log_stage(
            app,
            seq,
            Stage::Provision,
            StageStatus::Succeeded,
            detail.as_deref(),
        );
        let resource_env = database.map(|db| db.env_vars()).unwrap_or_default();

        // Start the new container next to the old one
        self.check_cancel(app, seq, Stage::Start, cancel)?;
        self.log_stage(app, seq, Stage::Start, StageStatus::Started, None);
        let started: StartedContainer = match self
            .orchestrator
            .start_deployment(&config, seq, &image, resource_env)
            .await
        {
            Ok(started) => started,
            Err(e) => {
                // A container created but never started may linger
                self.orchestrator
                    .stop_and_remove(&container_name(app, seq))
                    .await;
                self.fail_stage(app, seq, Stage::Start, &e);
                return Err(e);
            }
        };
        let detail = format!("container {} on port {}", started.name, started.port);
        self.log_stage(app, seq, Stage::Start, StageStatus::Succeeded, Some(&detail));

        // Health verification; failure tears the new container down and
        // leaves the old one serving
        self.log_stage(app, seq, Stage::HealthCheck, StageStatus::Started, None);
        if let Err(e) = self
            .orchestrator
            .health_check(app, started.port, &config.health, cancel)
            .await
        {
            self.fail_stage(app, seq, Stage::HealthCheck, &e);
            self.orchestrator.stop_and_remove(&started.name).await;
            return Err(e);
        }
        self.log_stage(app, seq, Stage::HealthCheck, StageStatus::Succeeded, None);

        // Promote
        self.log_stage(app, seq, Stage::Promote, StageStatus::Started, None);
        let previous = self
            .store
            .get_app(app)?
            .and_then(|record| record.active_container_name);
        if let Err(e) = self
            .store
            .promote_deployment(app, seq, &started.id, &started.name, started.port)
        {
            let err = PipelineError::Other(e);
            self.fail_stage(app, seq, Stage::Promote, &err);
            self.orchestrator.stop_and_remove(&started.name).await;
            return Err(err);
        }
        self.log_stage(app, seq, Stage::Promote, StageStatus::Succeeded, None);

        // Publish; the app is promoted either way, so failure degrades
        // instead of failing
        self.log_stage(app, seq, Stage::Publish, StageStatus::Started, None);
        let mut route = Route::new(app, &host, started.port, &started.name, seq);
        if config.https.enabled {
            if let Some(tls) = &tls {
                route.https = HttpsRoute {
                    enabled: true,
                    redirect_http: config.https.redirect_http,
                    cert_path: Some(tls.cert_path.clone()),
                    key_path: Some(tls.key_path.clone()),
                };
            }
        }
        let degraded = match self.routes.publish(route) {
            Ok(()) => {
                self.log_stage(app, seq, Stage::Publish, StageStatus::Succeeded, None);
                false
            }
            Err(e) => {
                self.fail_stage(app, seq, Stage::Publish, &e);
                if let Err(store_err) = self.store.set_app_degraded(app, true) {
                    error!(app, error = %store_err, "Failed to flag degraded state");
                }
                warn!(app, seq, error = %e, "Serving without a published route");
                true
            }
        };

        // Cleanup: the old container goes away only after the new one is
        // promoted; failures here never touch the outcome
        self.log_stage(app, seq, Stage::Cleanup, StageStatus::Started, None);
        if let Some(old) = previous {
            if old != started.name {
                self.orchestrator.stop_and_remove(&old).await;
            }
        }
        if let Err(e) = self.store.prune_deployments(app, self.settings.history_limit) {
            warn!(app, error = %e, "Failed to prune deployment history");
        }
        self.log_stage(app, seq, Stage::Cleanup, StageStatus::Succeeded, None);

        Ok(if degraded {
            Outcome::Degraded
        } else {
            Outcome::Succeeded
        })
    }

    /// Record a cancellation against `stage` if the flag is set.
    fn check_cancel(
        &self,
        app: &str,
        seq: i64,
        stage: Stage,
        cancel: &watch::Receiver<bool>,
    ) -> PipelineResult<()> {
        if *cancel.borrow() {
            self.log_stage(app, seq, stage, StageStatus::Cancelled, None);
            return Err(PipelineError::Cancelled);
        }
        Ok(())
    }

    fn log_stage(
        &self,
        app: &str,
        seq: i64,
        stage: Stage,
        status: StageStatus,
        detail: Option<&str>,
    ) {
        debug!(app, seq, stage = %stage, status = status.as_str(), "Stage");
        if let Err(e) = self.store.record_stage(app, seq, stage, status, detail) {
            error!(app, seq, stage = %stage, error = %e, "Failed to record stage");
        }
    }

    fn fail_stage(&self, app: &str, seq: i64, stage: Stage, err: &PipelineError) {
        let status = if matches!(err, PipelineError::Cancelled) {
            StageStatus::Cancelled
        } else {
            StageStatus::Failed
        };
        self.log_stage(app, seq, stage, status, Some(&err.to_string()));
    }
}

#[derive(Debug)]
struct Prepared {
    revision: String,
    image: ImageSource,
    /// False for build-only runs, which stop after the image exists
    swap: bool,
}

#[derive(Debug)]
enum ImageSource {
    Build,
    Reuse(String),
}

fn short_rev(rev: &str) -> &str {
    &rev[..rev.len().min(12)]
}

//! End-to-end tests for the deployment daemon.
//!
//! These tests run the real pipeline workers over a disk-backed store and the
//! real HTTP listener over localhost TCP, with Docker pointed at a socket
//! that is never reachable. A deployment therefore runs resolve, build (the
//! builder is stubbed with /bin/true), and provisioning for real, then fails
//! at the start stage with a docker error, which is exactly the terminal
//! record shape these tests pin down.
//!
//! Tests that need the `git` binary skip themselves when it is absent.
//!
//! Coverage:
//! - Push journey from revision to terminal deployment record and stage log
//! - Rollback reusing a previously built image without a rebuild
//! - Startup recovery of interrupted deployments across a store reopen
//! - API accept loop, bearer auth, and app lifecycle over real sockets

use slipway::api::{ApiConfig, ApiServer};
use slipway::builder::Builder;
use slipway::docker::DockerManager;
use slipway::git::GitManager;
use slipway::orchestrator::Orchestrator;
use slipway::pipeline::{Coordinator, PendingDeploy, PipelineSettings};
use slipway::provision::Provisioner;
use slipway::routes::RouteRegistrar;
use slipway::store::{AppState, DeploymentRecord, Outcome, Store, TriggerKind};

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::process::Command;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout};

const TOKEN: &str = "integration-token";

// ============================================================================
// Test rig
// ============================================================================

struct TestRig {
    store: Store,
    coordinator: Coordinator,
    repos: Arc<GitManager>,
    routes: Arc<RouteRegistrar>,
    docker: Arc<DockerManager>,
    queue_rx: Option<mpsc::Receiver<String>>,
    shutdown_tx: watch::Sender<bool>,
    shutdown_rx: watch::Receiver<bool>,
}

/// Build a full daemon wiring rooted at `root`, with the store on disk so a
/// second rig over the same root sees the same state.
fn build_rig(root: &Path) -> TestRig {
    let store = Store::open(root.join("slipway.db")).unwrap();
    let docker = Arc::new(DockerManager::connect_lazy(None).unwrap());

    let builder = Builder::with_docker_path(
        "/bin/true",
        root.join("logs"),
        Duration::from_secs(60),
        2,
    );
    let provisioner = Provisioner::new(
        Arc::clone(&docker),
        store.clone(),
        "slipway-test".to_string(),
        root.join("certs"),
        Duration::from_secs(30),
    );
    let orchestrator = Orchestrator::new(
        Arc::clone(&docker),
        "slipway-test".to_string(),
        10700,
        Duration::from_secs(5),
    )
    .unwrap();
    let routes = Arc::new(RouteRegistrar::new(root.join("routes")));
    let repos = Arc::new(GitManager::new(
        root.join("repos"),
        root.join("worktrees"),
        "http://127.0.0.1:1".to_string(),
        None,
    ));

    let settings = PipelineSettings {
        domain: "test.local".to_string(),
        history_limit: 20,
        lock_timeout: Duration::from_secs(5),
        logs_dir: root.join("logs"),
    };
    let (coordinator, queue_rx) = Coordinator::new(
        store.clone(),
        builder,
        provisioner,
        orchestrator,
        Arc::clone(&routes),
        Arc::clone(&repos),
        settings,
    );
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    TestRig {
        store,
        coordinator,
        repos,
        routes,
        docker,
        queue_rx: Some(queue_rx),
        shutdown_tx,
        shutdown_rx,
    }
}

impl TestRig {
    fn start_workers(&mut self) {
        let rx = self.queue_rx.take().unwrap();
        self.coordinator.spawn_workers(2, rx, self.shutdown_rx.clone());
    }

    /// Poll until the deployment `seq` of `app` reaches a terminal outcome.
    async fn wait_terminal(&self, app: &str, seq: i64) -> DeploymentRecord {
        for _ in 0..200 {
            if let Some(dep) = self.store.get_deployment(app, seq).unwrap() {
                if dep.outcome.is_some() {
                    return dep;
                }
            }
            sleep(Duration::from_millis(25)).await;
        }
        panic!("deployment v{} of {} never finished", seq, app);
    }

    fn spawn_api(&self, port: u16) -> JoinHandle<()> {
        let config = ApiConfig {
            bind_addr: format!("127.0.0.1:{}", port).parse().unwrap(),
            auth_token: TOKEN.to_string(),
            domain: "test.local".to_string(),
        };
        let api = Arc::new(ApiServer::new(
            config,
            self.store.clone(),
            self.coordinator.clone(),
            Arc::clone(&self.docker),
            Arc::clone(&self.routes),
            Arc::clone(&self.repos),
            self.shutdown_rx.clone(),
        ));
        tokio::spawn(async move {
            if let Err(e) = api.run().await {
                eprintln!("api server exited: {}", e);
            }
        })
    }
}

// ============================================================================
// Helpers
// ============================================================================

async fn git_available() -> bool {
    Command::new("git")
        .arg("version")
        .output()
        .await
        .map(|o| o.status.success())
        .unwrap_or(false)
}

async fn run_git(dir: &Path, args: &[&str]) {
    let out = Command::new("git")
        .args(args)
        .current_dir(dir)
        .output()
        .await
        .unwrap();
    assert!(
        out.status.success(),
        "git {:?}: {}",
        args,
        String::from_utf8_lossy(&out.stderr)
    );
}

/// Register `app`, create its bare repository, and push one commit with a
/// Dockerfile to it. Returns the pushed head revision.
async fn seed_app(rig: &TestRig, root: &Path, app: &str) -> String {
    rig.store.create_app(app).unwrap();
    rig.repos.init_repo(app).await.unwrap();

    let clone = root.join(format!("{}-clone", app));
    let repo = rig.repos.repo_path(app).display().to_string();
    run_git(root, &["clone", repo.as_str(), clone.to_str().unwrap()]).await;
    std::fs::write(clone.join("Dockerfile"), "FROM scratch\n").unwrap();
    run_git(&clone, &["add", "."]).await;
    run_git(
        &clone,
        &[
            "-c",
            "user.name=t",
            "-c",
            "user.email=t@example.com",
            "commit",
            "-m",
            "init",
        ],
    )
    .await;
    run_git(&clone, &["checkout", "-B", "main"]).await;
    run_git(&clone, &["push", "origin", "main"]).await;

    let out = Command::new("git")
        .args(["rev-parse", "HEAD"])
        .current_dir(&clone)
        .output()
        .await
        .unwrap();
    String::from_utf8(out.stdout).unwrap().trim().to_string()
}

async fn wait_for_port(port: u16) {
    for _ in 0..100 {
        if TcpStream::connect(("127.0.0.1", port)).await.is_ok() {
            return;
        }
        sleep(Duration::from_millis(50)).await;
    }
    panic!("port {} never opened", port);
}

/// One raw HTTP/1.1 exchange against the local API server.
async fn http_request(
    port: u16,
    method: &str,
    path: &str,
    token: Option<&str>,
    body: Option<&str>,
) -> (u16, String) {
    let mut stream = TcpStream::connect(("127.0.0.1", port)).await.unwrap();

    let mut req = format!(
        "{} {} HTTP/1.1\r\nHost: 127.0.0.1\r\nConnection: close\r\n",
        method, path
    );
    if let Some(token) = token {
        req.push_str(&format!("Authorization: Bearer {}\r\n", token));
    }
    match body {
        Some(body) => req.push_str(&format!(
            "Content-Type: application/json\r\nContent-Length: {}\r\n\r\n{}",
            body.len(),
            body
        )),
        None => req.push_str("Content-Length: 0\r\n\r\n"),
    }
    stream.write_all(req.as_bytes()).await.unwrap();

    let mut buf = Vec::new();
    stream.read_to_end(&mut buf).await.unwrap();
    let text = String::from_utf8_lossy(&buf).to_string();

    let status: u16 = text
        .split_whitespace()
        .nth(1)
        .expect("status line")
        .parse()
        .unwrap();
    let body = text
        .split("\r\n\r\n")
        .nth(1)
        .unwrap_or("")
        .to_string();
    (status, body)
}

// ============================================================================
// Push pipeline
// ============================================================================

mod push_pipeline_tests {
    use super::*;

    #[tokio::test]
    async fn test_push_journey_records_docker_failure() {
        if !git_available().await {
            eprintln!("git not installed; skipping");
            return;
        }
        let tmp = TempDir::new().unwrap();
        let mut rig = build_rig(tmp.path());
        let head = seed_app(&rig, tmp.path(), "web").await;

        rig.coordinator.on_push("web", &head).unwrap();
        rig.start_workers();

        let dep = rig.wait_terminal("web", 1).await;
        assert_eq!(dep.trigger, "push");
        assert_eq!(dep.revision, head);
        assert_eq!(dep.outcome.as_deref(), Some("failed"));
        assert_eq!(dep.error_kind.as_deref(), Some("docker"));
        assert!(dep.finished_at.is_some());

        // The image was built and logged before the start stage died
        assert_eq!(dep.image.as_deref(), Some("slipway-web:v1"));
        let log = dep.build_log_path.as_deref().unwrap();
        assert!(Path::new(log).exists(), "missing build log: {}", log);

        // Stage log: everything up to start succeeded, start failed,
        // promote never ran
        let stages = rig.store.get_stages("web", 1).unwrap();
        let status_of = |name: &str| {
            stages
                .iter()
                .rev()
                .find(|s| s.stage == name)
                .map(|s| s.status.clone())
        };
        assert_eq!(status_of("resolve").as_deref(), Some("succeeded"));
        assert_eq!(status_of("build").as_deref(), Some("succeeded"));
        assert_eq!(status_of("provision").as_deref(), Some("succeeded"));
        assert_eq!(status_of("start").as_deref(), Some("failed"));
        assert_eq!(status_of("promote"), None);

        // Nothing was promoted or published
        let app = rig.store.get_app("web").unwrap().unwrap();
        assert_eq!(app.state, "failed");
        assert!(app.active_seq.is_none());
        assert!(rig.routes.get("web").is_none());

        rig.shutdown_tx.send(true).unwrap();
    }

    #[tokio::test]
    async fn test_rollback_reuses_built_image_without_rebuild() {
        if !git_available().await {
            eprintln!("git not installed; skipping");
            return;
        }
        let tmp = TempDir::new().unwrap();
        let mut rig = build_rig(tmp.path());
        seed_app(&rig, tmp.path(), "web").await;

        rig.coordinator.submit("web", PendingDeploy::BuildOnly).unwrap();
        rig.start_workers();

        let built = rig.wait_terminal("web", 1).await;
        assert_eq!(built.outcome.as_deref(), Some("succeeded"), "err: {:?}", built.error_message);
        assert_eq!(built.image.as_deref(), Some("slipway-web:v1"));

        rig.coordinator
            .submit("web", PendingDeploy::Rollback { seq: Some(1) })
            .unwrap();
        let rolled = rig.wait_terminal("web", 2).await;

        // The rollback run carries v1's image and revision and goes straight
        // to the swap, where the missing docker daemon stops it
        assert_eq!(rolled.trigger, "rollback");
        assert_eq!(rolled.revision, built.revision);
        assert_eq!(rolled.image.as_deref(), Some("slipway-web:v1"));
        assert_eq!(rolled.outcome.as_deref(), Some("failed"));
        assert_eq!(rolled.error_kind.as_deref(), Some("docker"));

        let names: Vec<String> = rig
            .store
            .get_stages("web", 2)
            .unwrap()
            .into_iter()
            .map(|s| s.stage)
            .collect();
        assert!(names.contains(&"resolve".to_string()));
        assert!(names.contains(&"start".to_string()));
        assert!(!names.contains(&"build".to_string()), "stages: {:?}", names);

        assert_eq!(rig.store.get_deployments("web", 10).unwrap().len(), 2);

        rig.shutdown_tx.send(true).unwrap();
    }
}

// ============================================================================
// Crash recovery
// ============================================================================

mod recovery_tests {
    use super::*;

    #[tokio::test]
    async fn test_recover_closes_orphans_across_reopen() {
        let tmp = TempDir::new().unwrap();

        // First daemon: one app dies mid-deploy with a promoted container
        // still serving, another dies before anything was promoted
        {
            let rig = build_rig(tmp.path());
            rig.store.create_app("serving").unwrap();
            let s1 = rig
                .store
                .begin_deployment("serving", "abcabcabcabc", TriggerKind::Push)
                .unwrap();
            rig.store
                .promote_deployment("serving", s1, "cid", "slipway-serving-v1", 10701)
                .unwrap();
            rig.store
                .finish_deployment("serving", s1, Outcome::Succeeded, None, None, AppState::Idle)
                .unwrap();
            rig.store
                .begin_deployment("serving", "defdefdefdef", TriggerKind::Deploy)
                .unwrap();

            rig.store.create_app("fresh").unwrap();
            rig.store
                .begin_deployment("fresh", "abcabcabcabc", TriggerKind::Push)
                .unwrap();
        }

        // Second daemon over the same database file
        let rig = build_rig(tmp.path());
        assert_eq!(rig.coordinator.recover().unwrap(), 2);

        let serving = rig.store.get_app("serving").unwrap().unwrap();
        assert_eq!(serving.state, "idle");
        assert_eq!(serving.active_seq, Some(1));
        assert!(serving.in_progress_seq.is_none());

        let interrupted = rig.store.get_deployment("serving", 2).unwrap().unwrap();
        assert_eq!(interrupted.outcome.as_deref(), Some("failed"));
        assert_eq!(interrupted.error_kind.as_deref(), Some("internal"));
        assert!(
            interrupted
                .error_message
                .as_deref()
                .unwrap_or("")
                .contains("restarted"),
            "got: {:?}",
            interrupted.error_message
        );

        assert_eq!(rig.store.get_app("fresh").unwrap().unwrap().state, "failed");

        // The sweep is idempotent
        assert_eq!(rig.coordinator.recover().unwrap(), 0);
    }
}

// ============================================================================
// API over real sockets
// ============================================================================

mod api_tests {
    use super::*;

    #[tokio::test]
    async fn test_health_and_version_skip_auth() {
        let tmp = TempDir::new().unwrap();
        let rig = build_rig(tmp.path());
        rig.spawn_api(17731);
        wait_for_port(17731).await;

        let (status, body) = http_request(17731, "GET", "/health", None, None).await;
        assert_eq!(status, 200);
        assert!(body.contains(r#""status":"ok""#), "body: {}", body);

        let (status, body) = http_request(17731, "GET", "/version", None, None).await;
        assert_eq!(status, 200);
        assert!(body.contains(r#""name":"slipway""#), "body: {}", body);

        rig.shutdown_tx.send(true).unwrap();
    }

    #[tokio::test]
    async fn test_requests_require_bearer_token() {
        let tmp = TempDir::new().unwrap();
        let rig = build_rig(tmp.path());
        rig.spawn_api(17732);
        wait_for_port(17732).await;

        let (status, _) = http_request(17732, "GET", "/apps", None, None).await;
        assert_eq!(status, 401);

        let (status, _) = http_request(17732, "GET", "/apps", Some("wrong"), None).await;
        assert_eq!(status, 401);

        let (status, body) = http_request(17732, "GET", "/apps", Some(TOKEN), None).await;
        assert_eq!(status, 200);
        assert!(body.contains(r#""success":true"#), "body: {}", body);

        rig.shutdown_tx.send(true).unwrap();
    }

    #[tokio::test]
    async fn test_app_lifecycle_over_tcp() {
        if !git_available().await {
            eprintln!("git not installed; skipping");
            return;
        }
        let tmp = TempDir::new().unwrap();
        let rig = build_rig(tmp.path());
        rig.spawn_api(17733);
        wait_for_port(17733).await;

        let (status, body) = http_request(
            17733,
            "POST",
            "/apps",
            Some(TOKEN),
            Some(r#"{"name":"api-one"}"#),
        )
        .await;
        assert_eq!(status, 201, "body: {}", body);
        assert!(body.contains(r#""name":"api-one""#));
        assert!(body.contains(r#""remote""#));
        assert!(body.contains("manifest_example"));

        // Names are DNS labels; anything else is rejected up front
        let (status, _) = http_request(
            17733,
            "POST",
            "/apps",
            Some(TOKEN),
            Some(r#"{"name":"Bad_Name"}"#),
        )
        .await;
        assert_eq!(status, 400);

        let (status, _) = http_request(
            17733,
            "POST",
            "/apps",
            Some(TOKEN),
            Some(r#"{"name":"api-one"}"#),
        )
        .await;
        assert_eq!(status, 409);

        let (status, body) = http_request(17733, "GET", "/apps/api-one", Some(TOKEN), None).await;
        assert_eq!(status, 200);
        assert!(body.contains(r#""state":"uninitialized""#), "body: {}", body);
        assert!(body.contains("api-one.test.local"), "body: {}", body);

        // Queue a deploy (no workers run in this test), then destroy; the
        // pending request is dropped with the app
        let (status, _) =
            http_request(17733, "POST", "/apps/api-one/deploy", Some(TOKEN), Some("{}")).await;
        assert_eq!(status, 202);

        let (status, body) =
            http_request(17733, "DELETE", "/apps/api-one", Some(TOKEN), None).await;
        assert_eq!(status, 200, "body: {}", body);
        assert!(body.contains(r#""destroyed":"api-one""#));

        let (status, _) = http_request(17733, "GET", "/apps/api-one", Some(TOKEN), None).await;
        assert_eq!(status, 404);

        rig.shutdown_tx.send(true).unwrap();
    }

    #[tokio::test]
    async fn test_hook_push_queues_deployment() {
        if !git_available().await {
            eprintln!("git not installed; skipping");
            return;
        }
        let tmp = TempDir::new().unwrap();
        let mut rig = build_rig(tmp.path());
        let head = seed_app(&rig, tmp.path(), "hooked").await;
        rig.start_workers();
        rig.spawn_api(17734);
        wait_for_port(17734).await;

        let (status, body) = http_request(
            17734,
            "POST",
            "/hooks/hooked",
            Some(TOKEN),
            Some(&format!(r#"{{"revision":"{}"}}"#, head)),
        )
        .await;
        assert_eq!(status, 202, "body: {}", body);
        assert!(body.contains(r#""queued":true"#));

        let dep = rig.wait_terminal("hooked", 1).await;
        assert_eq!(dep.trigger, "push");
        assert_eq!(dep.revision, head);

        rig.shutdown_tx.send(true).unwrap();
    }

    #[tokio::test]
    async fn test_shutdown_stops_accept_loop() {
        let tmp = TempDir::new().unwrap();
        let rig = build_rig(tmp.path());
        let handle = rig.spawn_api(17735);
        wait_for_port(17735).await;

        rig.shutdown_tx.send(true).unwrap();
        timeout(Duration::from_secs(2), handle)
            .await
            .expect("accept loop kept running after shutdown")
            .unwrap();
    }
}

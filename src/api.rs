//! Status and control API.
//!
//! HTTP front door for the `slip` CLI and the repository post-receive hooks.
//! Mutations are validated here, parked with the pipeline coordinator, and
//! acknowledged with 202 while the pipeline runs. Stop and destroy run inline
//! because the caller needs the result. Every response shares one JSON
//! envelope: `{"success": bool, "data": ..., "error": ...}`.

use crate::docker::DockerManager;
use crate::git::{plausible_revision, GitManager};
use crate::manifest;
use crate::pipeline::{Coordinator, PendingDeploy, SubmitError};
use crate::routes::{hostname, Route, RouteRegistrar};
use crate::store::{AppRecord, DeploymentRecord, StageRecord, Store, TriggerKind};
use anyhow::Result;
use http_body_util::{BodyExt, Full};
use hyper::body::Bytes;
use hyper::header::{AUTHORIZATION, CONTENT_TYPE};
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder as AutoBuilder;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

pub const VERSION: &str = env!("CARGO_PKG_VERSION");
pub const PKG_NAME: &str = env!("CARGO_PKG_NAME");

/// Page size for deployment history responses.
const DEPLOYMENTS_PAGE: usize = 20;

const DEFAULT_LOG_TAIL: usize = 100;
const MAX_LOG_TAIL: usize = 5000;

#[derive(Debug, Clone)]
pub struct ApiConfig {
    pub bind_addr: SocketAddr,

    /// Bearer token required on everything except `/health` and `/version`
    pub auth_token: String,

    /// Local domain applications are routed under
    pub domain: String,
}

#[derive(Debug, Deserialize)]
pub struct CreateAppRequest {
    pub name: String,
}

#[derive(Debug, Default, Deserialize)]
pub struct DeployRequest {
    /// Full or abbreviated commit; omitted means the work tree's HEAD
    pub revision: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
pub struct RollbackRequest {
    /// Deployment to return to; omitted picks the newest eligible one
    pub seq: Option<i64>,
}

/// Payload the post-receive hook sends for each push.
#[derive(Debug, Deserialize)]
pub struct HookRequest {
    pub revision: String,
}

/// Application as the API reports it: the stored record plus its route.
#[derive(Debug, Serialize)]
pub struct AppView {
    #[serde(flatten)]
    pub record: AppRecord,
    pub hostname: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub route: Option<Route>,
}

/// Single-application view with enough deployment context for
/// `slip status <app>` to explain what last happened and why.
#[derive(Debug, Serialize)]
pub struct AppDetail {
    #[serde(flatten)]
    pub view: AppView,
    pub remote: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub latest: Option<DeploymentRecord>,
    /// Stage log of the latest deployment
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub stages: Vec<StageRecord>,
}

#[derive(Debug, Serialize)]
pub struct CreatedApp {
    #[serde(flatten)]
    pub record: AppRecord,
    pub hostname: String,
    /// Git remote to add for push deployments
    pub remote: String,
    /// Commented starter manifest; `slip init` writes it to slipway.toml
    pub manifest_example: String,
}

#[derive(Debug, Serialize)]
pub struct LogsView {
    pub container: String,
    pub lines: Vec<String>,
}

/// API response wrapper
#[derive(Debug, Serialize)]
pub struct ApiResponse<T: Serialize> {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl<T: Serialize> ApiResponse<T> {
    pub fn ok(data: T) -> Self {
        Self {
            success: true,
            data: Some(data),
            error: None,
        }
    }

    pub fn error(msg: impl Into<String>) -> Self {
        Self {
            success: false,
            data: None,
            error: Some(msg.into()),
        }
    }
}

pub struct ApiServer {
    config: ApiConfig,
    store: Store,
    coordinator: Coordinator,
    docker: Arc<DockerManager>,
    routes: Arc<RouteRegistrar>,
    repos: Arc<GitManager>,
    shutdown_rx: watch::Receiver<bool>,
}

impl ApiServer {
    pub fn new(
        config: ApiConfig,
        store: Store,
        coordinator: Coordinator,
        docker: Arc<DockerManager>,
        routes: Arc<RouteRegistrar>,
        repos: Arc<GitManager>,
        shutdown_rx: watch::Receiver<bool>,
    ) -> Self {
        Self {
            config,
            store,
            coordinator,
            docker,
            routes,
            repos,
            shutdown_rx,
        }
    }

    /// Accept loop. Runs until the shutdown flag flips.
    pub async fn run(self: Arc<Self>) -> Result<()> {
        let listener = TcpListener::bind(self.config.bind_addr).await?;
        info!(addr = %self.config.bind_addr, "API server listening");

        let mut shutdown_rx = self.shutdown_rx.clone();

        loop {
            tokio::select! {
                result = listener.accept() => {
                    match result {
                        Ok((stream, addr)) => {
                            let api = Arc::clone(&self);
                            tokio::spawn(async move {
                                if let Err(e) = api.serve_connection(stream, addr).await {
                                    debug!(addr = %addr, error = %e, "Connection error");
                                }
                            });
                        }
                        Err(e) => {
                            error!(error = %e, "Failed to accept connection");
                        }
                    }
                }
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        info!("API server shutting down");
                        break;
                    }
                }
            }
        }

        Ok(())
    }

    async fn serve_connection<S>(self: Arc<Self>, stream: S, _addr: SocketAddr) -> Result<()>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let io = TokioIo::new(stream);
        let service = service_fn(move |req| {
            let api = Arc::clone(&self);
            async move { api.handle_request(req).await }
        });

        AutoBuilder::new(TokioExecutor::new())
            .serve_connection(io, service)
            .await
            .map_err(|e| anyhow::anyhow!("connection error: {}", e))?;

        Ok(())
    }

    fn check_auth(&self, req: &Request<hyper::body::Incoming>) -> bool {
        req.headers()
            .get(AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .map(|auth| {
                auth.strip_prefix("Bearer ")
                    .unwrap_or(auth)
                    .eq(&self.config.auth_token)
            })
            .unwrap_or(false)
    }

    async fn handle_request(
        self: Arc<Self>,
        req: Request<hyper::body::Incoming>,
    ) -> std::result::Result<Response<Full<Bytes>>, hyper::Error> {
        let method = req.method().clone();
        let path = req.uri().path().to_string();
        let query = req.uri().query().map(str::to_string);

        debug!(%method, %path, "API request");

        // Liveness and version are open; everything else needs the token
        if method == Method::GET && path == "/health" {
            return Ok(json_response(StatusCode::OK, r#"{"status":"ok"}"#));
        }
        if method == Method::GET && path == "/version" {
            let version = serde_json::json!({
                "name": PKG_NAME,
                "version": VERSION,
            });
            return Ok(json_response(StatusCode::OK, version.to_string()));
        }

        if !self.check_auth(&req) {
            warn!(%method, %path, "Unauthorized API request");
            return Ok(json_error(StatusCode::UNAUTHORIZED, "unauthorized"));
        }

        let segments: Vec<&str> = path.trim_matches('/').split('/').collect();
        let response = match (method, segments.as_slice()) {
            (Method::GET, &["apps"]) => self.list_apps(),
            (Method::POST, &["apps"]) => self.create_app(req).await,
            (Method::GET, &["apps", name]) => self.get_app(name),
            (Method::DELETE, &["apps", name]) => self.destroy(name).await,
            (Method::GET, &["apps", name, "deployments"]) => self.list_deployments(name),
            (Method::POST, &["apps", name, "deploy"]) => self.deploy(name, req).await,
            (Method::POST, &["apps", name, "build"]) => submit_response(
                name,
                TriggerKind::Build,
                self.coordinator.submit(name, PendingDeploy::BuildOnly),
            ),
            (Method::POST, &["apps", name, "restart" | "start"]) => submit_response(
                name,
                TriggerKind::Restart,
                self.coordinator.submit(name, PendingDeploy::Restart),
            ),
            (Method::POST, &["apps", name, "rollback"]) => self.rollback(name, req).await,
            (Method::POST, &["apps", name, "stop"]) => self.stop(name).await,
            (Method::GET, &["apps", name, "logs"]) => self.logs(name, query.as_deref()).await,
            (Method::GET, &["status"]) => self.status().await,
            (Method::POST, &["hooks", name]) => self.hook(name, req).await,
            _ => Ok(json_error(StatusCode::NOT_FOUND, "not found")),
        };

        response.or_else(|e| {
            error!(error = %e, "API handler failed");
            Ok(json_error(
                StatusCode::INTERNAL_SERVER_ERROR,
                format!("internal error: {}", e),
            ))
        })
    }

    // ==================== Applications ====================

    fn view(&self, record: AppRecord) -> AppView {
        let hostname = hostname(&record.name, &self.config.domain);
        let route = self.routes.get(&record.name);
        AppView {
            record,
            hostname,
            route,
        }
    }

    fn list_apps(&self) -> Result<Response<Full<Bytes>>> {
        let apps: Vec<AppView> = self
            .store
            .list_apps()?
            .into_iter()
            .map(|record| self.view(record))
            .collect();
        ok_json(StatusCode::OK, apps)
    }

    async fn create_app(&self, req: Request<hyper::body::Incoming>) -> Result<Response<Full<Bytes>>> {
        let body = req.collect().await?.to_bytes();
        let create: CreateAppRequest = match serde_json::from_slice(&body) {
            Ok(r) => r,
            Err(e) => {
                return Ok(json_error(
                    StatusCode::BAD_REQUEST,
                    format!("invalid JSON: {}", e),
                ))
            }
        };

        if let Err(e) = manifest::validate_app_name(&create.name) {
            return Ok(json_error(StatusCode::BAD_REQUEST, e.to_string()));
        }
        if self.store.get_app(&create.name)?.is_some() {
            return Ok(json_error(
                StatusCode::CONFLICT,
                format!("application '{}' already exists", create.name),
            ));
        }

        self.repos.init_repo(&create.name).await?;
        self.store.create_app(&create.name)?;
        info!(app = %create.name, "Application created");

        let record = self
            .store
            .get_app(&create.name)?
            .ok_or_else(|| anyhow::anyhow!("application vanished after creation"))?;
        let created = CreatedApp {
            hostname: hostname(&record.name, &self.config.domain),
            remote: self.repos.remote_hint(&record.name),
            manifest_example: manifest::example_manifest(&record.name),
            record,
        };
        ok_json(StatusCode::CREATED, created)
    }

    fn get_app(&self, name: &str) -> Result<Response<Full<Bytes>>> {
        let record = match self.store.get_app(name)? {
            Some(record) => record,
            None => return Ok(app_not_found(name)),
        };

        let latest = self.store.get_deployments(name, 1)?.into_iter().next();
        let stages = match &latest {
            Some(dep) => self.store.get_stages(name, dep.seq)?,
            None => Vec::new(),
        };

        let detail = AppDetail {
            remote: self.repos.remote_hint(name),
            view: self.view(record),
            latest,
            stages,
        };
        ok_json(StatusCode::OK, detail)
    }

    async fn destroy(&self, name: &str) -> Result<Response<Full<Bytes>>> {
        if self.store.get_app(name)?.is_none() {
            return Ok(app_not_found(name));
        }
        if self.coordinator.is_destroying(name) {
            return Ok(json_error(
                StatusCode::CONFLICT,
                format!("application '{}' is being destroyed", name),
            ));
        }

        match self.coordinator.destroy_app(name).await {
            Ok(()) => ok_json(StatusCode::OK, serde_json::json!({ "destroyed": name })),
            Err(e) => Ok(json_error(StatusCode::INTERNAL_SERVER_ERROR, e.to_string())),
        }
    }

    // ==================== Deployments ====================

    fn list_deployments(&self, name: &str) -> Result<Response<Full<Bytes>>> {
        if self.store.get_app(name)?.is_none() {
            return Ok(app_not_found(name));
        }
        ok_json(
            StatusCode::OK,
            self.store.get_deployments(name, DEPLOYMENTS_PAGE)?,
        )
    }

    async fn deploy(&self, name: &str, req: Request<hyper::body::Incoming>) -> Result<Response<Full<Bytes>>> {
        let body = req.collect().await?.to_bytes();
        let deploy: DeployRequest = if body.is_empty() {
            DeployRequest::default()
        } else {
            match serde_json::from_slice(&body) {
                Ok(r) => r,
                Err(e) => {
                    return Ok(json_error(
                        StatusCode::BAD_REQUEST,
                        format!("invalid JSON: {}", e),
                    ))
                }
            }
        };

        if let Some(rev) = &deploy.revision {
            if !plausible_revision(rev) {
                return Ok(submit_error_response(&SubmitError::InvalidRevision(
                    rev.clone(),
                )));
            }
        }

        submit_response(
            name,
            TriggerKind::Deploy,
            self.coordinator.submit(
                name,
                PendingDeploy::Deploy {
                    trigger: TriggerKind::Deploy,
                    revision: deploy.revision,
                },
            ),
        )
    }

    async fn rollback(&self, name: &str, req: Request<hyper::body::Incoming>) -> Result<Response<Full<Bytes>>> {
        let body = req.collect().await?.to_bytes();
        let rollback: RollbackRequest = if body.is_empty() {
            RollbackRequest::default()
        } else {
            match serde_json::from_slice(&body) {
                Ok(r) => r,
                Err(e) => {
                    return Ok(json_error(
                        StatusCode::BAD_REQUEST,
                        format!("invalid JSON: {}", e),
                    ))
                }
            }
        };

        submit_response(
            name,
            TriggerKind::Rollback,
            self.coordinator
                .submit(name, PendingDeploy::Rollback { seq: rollback.seq }),
        )
    }

    async fn stop(&self, name: &str) -> Result<Response<Full<Bytes>>> {
        if self.store.get_app(name)?.is_none() {
            return Ok(app_not_found(name));
        }
        match self.coordinator.stop_app(name).await {
            Ok(summary) => ok_json(StatusCode::OK, summary),
            Err(e) => Ok(json_error(StatusCode::INTERNAL_SERVER_ERROR, e.to_string())),
        }
    }

    async fn hook(&self, name: &str, req: Request<hyper::body::Incoming>) -> Result<Response<Full<Bytes>>> {
        let body = req.collect().await?.to_bytes();
        let hook: HookRequest = match serde_json::from_slice(&body) {
            Ok(r) => r,
            Err(e) => {
                return Ok(json_error(
                    StatusCode::BAD_REQUEST,
                    format!("invalid JSON: {}", e),
                ))
            }
        };

        info!(app = %name, revision = %hook.revision, "Push received");
        submit_response(
            name,
            TriggerKind::Push,
            self.coordinator.on_push(name, &hook.revision),
        )
    }

    // ==================== Logs and status ====================

    async fn logs(&self, name: &str, query: Option<&str>) -> Result<Response<Full<Bytes>>> {
        let record = match self.store.get_app(name)? {
            Some(record) => record,
            None => return Ok(app_not_found(name)),
        };
        let container = match record.active_container_name {
            Some(container) => container,
            None => {
                return Ok(json_error(
                    StatusCode::NOT_FOUND,
                    format!("no running container for '{}'", name),
                ))
            }
        };

        let tail = match query_param(query, "tail") {
            Some(raw) => match raw.parse::<usize>() {
                Ok(n) => n.min(MAX_LOG_TAIL),
                Err(_) => {
                    return Ok(json_error(
                        StatusCode::BAD_REQUEST,
                        format!("invalid tail value {:?}", raw),
                    ))
                }
            },
            None => DEFAULT_LOG_TAIL,
        };

        match self.docker.tail_logs(&container, tail).await {
            Ok(output) => {
                let lines: Vec<String> = output.lines().map(str::to_string).collect();
                ok_json(StatusCode::OK, LogsView { container, lines })
            }
            Err(e) => Ok(json_error(
                StatusCode::INTERNAL_SERVER_ERROR,
                format!("cannot read logs: {}", e),
            )),
        }
    }

    async fn status(&self) -> Result<Response<Full<Bytes>>> {
        let mut by_state = serde_json::Map::new();
        let mut total = 0i64;
        for (state, count) in self.store.count_apps_by_state()? {
            total += count;
            by_state.insert(state, serde_json::Value::from(count));
        }

        let body = serde_json::json!({
            "name": PKG_NAME,
            "version": VERSION,
            "apps": total,
            "by_state": by_state,
            "routes": self.routes.list().len(),
            "docker": self.docker.ping().await,
        });
        ok_json(StatusCode::OK, body)
    }
}

// ==================== Helper functions ====================

fn json_response(status: StatusCode, body: impl Into<Bytes>) -> Response<Full<Bytes>> {
    Response::builder()
        .status(status)
        .header(CONTENT_TYPE, "application/json")
        .body(Full::new(body.into()))
        .expect("valid response")
}

fn json_error(status: StatusCode, message: impl Into<String>) -> Response<Full<Bytes>> {
    let response: ApiResponse<()> = ApiResponse::error(message);
    json_response(status, serde_json::to_string(&response).unwrap())
}

fn ok_json<T: Serialize>(status: StatusCode, data: T) -> Result<Response<Full<Bytes>>> {
    let body = serde_json::to_string(&ApiResponse::ok(data))?;
    Ok(json_response(status, body))
}

fn app_not_found(name: &str) -> Response<Full<Bytes>> {
    json_error(
        StatusCode::NOT_FOUND,
        format!("unknown application '{}'", name),
    )
}

/// 202 for queued work, or the matching status for a rejection.
fn submit_response(
    app: &str,
    trigger: TriggerKind,
    result: std::result::Result<(), SubmitError>,
) -> Result<Response<Full<Bytes>>> {
    match result {
        Ok(()) => {
            let body = serde_json::json!({
                "app": app,
                "trigger": trigger.as_str(),
                "queued": true,
            });
            ok_json(StatusCode::ACCEPTED, body)
        }
        Err(e) => Ok(submit_error_response(&e)),
    }
}

fn submit_error_response(err: &SubmitError) -> Response<Full<Bytes>> {
    let status = match err {
        SubmitError::UnknownApp(_) => StatusCode::NOT_FOUND,
        SubmitError::InvalidRevision(_) => StatusCode::BAD_REQUEST,
        SubmitError::DestroyInProgress(_) => StatusCode::CONFLICT,
        SubmitError::QueueFull => StatusCode::SERVICE_UNAVAILABLE,
        SubmitError::Store(_) => StatusCode::INTERNAL_SERVER_ERROR,
    };
    json_error(status, err.to_string())
}

fn query_param(query: Option<&str>, key: &str) -> Option<String> {
    query?.split('&').find_map(|pair| {
        let (k, v) = pair.split_once('=')?;
        (k == key).then(|| v.to_string())
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::builder::Builder;
    use crate::orchestrator::Orchestrator;
    use crate::pipeline::PipelineSettings;
    use crate::provision::Provisioner;
    use std::time::Duration;
    use tempfile::TempDir;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::process::Command;
    use tokio::sync::mpsc;

    const TOKEN: &str = "sekrit";

    struct TestApi {
        api: Arc<ApiServer>,
        store: Store,
        // Keeps submissions from seeing a closed queue; no worker runs
        _queue_rx: mpsc::Receiver<String>,
        _tmp: TempDir,
    }

    fn test_api() -> TestApi {
        let tmp = TempDir::new().unwrap();
        let store = Store::open_in_memory().unwrap();
        let docker = Arc::new(DockerManager::connect_lazy(None).unwrap());

        let builder = Builder::with_docker_path(
            "/bin/true",
            tmp.path().join("logs"),
            Duration::from_secs(60),
            2,
        );
        let provisioner = Provisioner::new(
            Arc::clone(&docker),
            store.clone(),
            "slipway-test".to_string(),
            tmp.path().join("certs"),
            Duration::from_secs(30),
        );
        let orchestrator = Orchestrator::new(
            Arc::clone(&docker),
            "slipway-test".to_string(),
            10600,
            Duration::from_secs(5),
        )
        .unwrap();
        let routes = Arc::new(RouteRegistrar::new(tmp.path().join("routes")));
        let repos = Arc::new(GitManager::new(
            tmp.path().join("repos"),
            tmp.path().join("worktrees"),
            "http://127.0.0.1:1".to_string(),
            None,
        ));

        let settings = PipelineSettings {
            domain: "test.local".to_string(),
            history_limit: 20,
            lock_timeout: Duration::from_secs(5),
            logs_dir: tmp.path().join("logs"),
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

        let (_shutdown_tx, shutdown_rx) = watch::channel(false);
        let config = ApiConfig {
            bind_addr: "127.0.0.1:0".parse().unwrap(),
            auth_token: TOKEN.to_string(),
            domain: "test.local".to_string(),
        };
        let api = Arc::new(ApiServer::new(
            config,
            store.clone(),
            coordinator,
            docker,
            routes,
            repos,
            shutdown_rx,
        ));

        TestApi {
            api,
            store,
            _queue_rx: queue_rx,
            _tmp: tmp,
        }
    }

    /// Drive one raw HTTP/1.1 exchange through `serve_connection` over an
    /// in-memory duplex stream and parse the status line and JSON body.
    async fn roundtrip(api: &Arc<ApiServer>, raw: String) -> (u16, serde_json::Value) {
        let (client, server) = tokio::io::duplex(64 * 1024);
        let api = Arc::clone(api);
        let served = tokio::spawn(async move {
            let _ = api
                .serve_connection(server, "127.0.0.1:0".parse().unwrap())
                .await;
        });

        let (mut rd, mut wr) = tokio::io::split(client);
        wr.write_all(raw.as_bytes()).await.unwrap();

        let mut buf = Vec::new();
        rd.read_to_end(&mut buf).await.unwrap();
        served.await.unwrap();

        let text = String::from_utf8(buf).unwrap();
        let status: u16 = text
            .split_whitespace()
            .nth(1)
            .expect("status line")
            .parse()
            .unwrap();
        let body = text.split("\r\n\r\n").nth(1).unwrap_or("");
        let json = if body.is_empty() {
            serde_json::Value::Null
        } else {
            serde_json::from_str(body).unwrap()
        };
        (status, json)
    }

    fn raw_request(method: &str, path: &str, token: Option<&str>, body: Option<&str>) -> String {
        let mut s = format!(
            "{} {} HTTP/1.1\r\nHost: slipway-test\r\nConnection: close\r\n",
            method, path
        );
        if let Some(token) = token {
            s.push_str(&format!("Authorization: Bearer {}\r\n", token));
        }
        match body {
            Some(body) => s.push_str(&format!(
                "Content-Type: application/json\r\nContent-Length: {}\r\n\r\n{}",
                body.len(),
                body
            )),
            None => s.push_str("Content-Length: 0\r\n\r\n"),
        }
        s
    }

    async fn get(t: &TestApi, path: &str, token: Option<&str>) -> (u16, serde_json::Value) {
        roundtrip(&t.api, raw_request("GET", path, token, None)).await
    }

    async fn post(
        t: &TestApi,
        path: &str,
        token: Option<&str>,
        body: Option<&str>,
    ) -> (u16, serde_json::Value) {
        roundtrip(&t.api, raw_request("POST", path, token, body)).await
    }

    async fn git_available() -> bool {
        Command::new("git")
            .arg("version")
            .output()
            .await
            .map(|o| o.status.success())
            .unwrap_or(false)
    }

    #[tokio::test]
    async fn test_health_needs_no_auth() {
        let t = test_api();
        let (status, json) = get(&t, "/health", None).await;
        assert_eq!(status, 200);
        assert_eq!(json["status"], "ok");
    }

    #[tokio::test]
    async fn test_version_reports_package_version() {
        let t = test_api();
        let (status, json) = get(&t, "/version", None).await;
        assert_eq!(status, 200);
        assert_eq!(json["version"], env!("CARGO_PKG_VERSION"));
    }

    #[tokio::test]
    async fn test_requests_without_token_rejected() {
        let t = test_api();
        let (status, json) = get(&t, "/apps", None).await;
        assert_eq!(status, 401);
        assert_eq!(json["success"], false);

        let (status, _) = post(&t, "/hooks/web", None, Some(r#"{"revision":"abc"}"#)).await;
        assert_eq!(status, 401);
    }

    #[tokio::test]
    async fn test_wrong_token_rejected() {
        let t = test_api();
        let (status, _) = get(&t, "/apps", Some("wrong")).await;
        assert_eq!(status, 401);
    }

    #[tokio::test]
    async fn test_unknown_route_is_404() {
        let t = test_api();
        let (status, json) = get(&t, "/nope", Some(TOKEN)).await;
        assert_eq!(status, 404);
        assert_eq!(json["success"], false);
    }

    #[tokio::test]
    async fn test_create_app_validates_name() {
        let t = test_api();
        for bad in [r#"{"name":"Bad Name"}"#, r#"{"name":""}"#, r#"{"name":"-x"}"#] {
            let (status, json) = post(&t, "/apps", Some(TOKEN), Some(bad)).await;
            assert_eq!(status, 400, "accepted: {}", bad);
            assert_eq!(json["success"], false);
        }

        let (status, _) = post(&t, "/apps", Some(TOKEN), Some("not json")).await;
        assert_eq!(status, 400);
    }

    #[tokio::test]
    async fn test_create_get_list_destroy_roundtrip() {
        if !git_available().await {
            eprintln!("git not installed; skipping");
            return;
        }
        let t = test_api();

        let (status, json) = post(&t, "/apps", Some(TOKEN), Some(r#"{"name":"web"}"#)).await;
        assert_eq!(status, 201, "body: {}", json);
        let data = &json["data"];
        assert_eq!(data["name"], "web");
        assert_eq!(data["state"], "uninitialized");
        assert_eq!(data["hostname"], "web.test.local");
        assert!(data["remote"].as_str().unwrap().contains("web.git"));
        assert!(data["manifest_example"]
            .as_str()
            .unwrap()
            .contains("[health_check]"));

        let (status, json) = get(&t, "/apps/web", Some(TOKEN)).await;
        assert_eq!(status, 200);
        assert_eq!(json["data"]["name"], "web");
        assert!(json["data"]["latest"].is_null());

        let (status, json) = get(&t, "/apps", Some(TOKEN)).await;
        assert_eq!(status, 200);
        assert_eq!(json["data"].as_array().unwrap().len(), 1);

        let (status, _) = roundtrip(
            &t.api,
            raw_request("DELETE", "/apps/web", Some(TOKEN), None),
        )
        .await;
        assert_eq!(status, 200);

        let (status, _) = get(&t, "/apps/web", Some(TOKEN)).await;
        assert_eq!(status, 404);
    }

    #[tokio::test]
    async fn test_duplicate_app_conflicts() {
        if !git_available().await {
            eprintln!("git not installed; skipping");
            return;
        }
        let t = test_api();

        let (status, _) = post(&t, "/apps", Some(TOKEN), Some(r#"{"name":"web"}"#)).await;
        assert_eq!(status, 201);
        let (status, json) = post(&t, "/apps", Some(TOKEN), Some(r#"{"name":"web"}"#)).await;
        assert_eq!(status, 409);
        assert!(json["error"].as_str().unwrap().contains("already exists"));
    }

    #[tokio::test]
    async fn test_hook_queues_deployment() {
        let t = test_api();
        t.store.create_app("web").unwrap();

        let (status, json) = post(
            &t,
            "/hooks/web",
            Some(TOKEN),
            Some(r#"{"revision":"aaaaaaaaaaaa"}"#),
        )
        .await;
        assert_eq!(status, 202);
        assert_eq!(json["data"]["trigger"], "push");
        assert_eq!(json["data"]["queued"], true);

        // Nothing ran: no worker is draining the queue
        let (_, json) = get(&t, "/apps/web/deployments", Some(TOKEN)).await;
        assert_eq!(json["data"].as_array().unwrap().len(), 0);
    }

    #[tokio::test]
    async fn test_hook_rejects_garbage_revision() {
        let t = test_api();
        t.store.create_app("web").unwrap();

        let (status, json) = post(
            &t,
            "/hooks/web",
            Some(TOKEN),
            Some(r#"{"revision":"zzz!"}"#),
        )
        .await;
        assert_eq!(status, 400);
        assert!(json["error"].as_str().unwrap().contains("invalid revision"));
    }

    #[tokio::test]
    async fn test_hook_unknown_app() {
        let t = test_api();
        let (status, _) = post(
            &t,
            "/hooks/ghost",
            Some(TOKEN),
            Some(r#"{"revision":"aaaaaaaaaaaa"}"#),
        )
        .await;
        assert_eq!(status, 404);
    }

    #[tokio::test]
    async fn test_deploy_validates_explicit_revision() {
        let t = test_api();
        t.store.create_app("web").unwrap();

        let (status, _) = post(
            &t,
            "/apps/web/deploy",
            Some(TOKEN),
            Some(r#"{"revision":"nothex"}"#),
        )
        .await;
        assert_eq!(status, 400);

        let (status, json) = post(&t, "/apps/web/deploy", Some(TOKEN), None).await;
        assert_eq!(status, 202);
        assert_eq!(json["data"]["trigger"], "deploy");
    }

    #[tokio::test]
    async fn test_restart_and_start_queue_the_same_trigger() {
        let t = test_api();
        t.store.create_app("web").unwrap();

        for path in ["/apps/web/restart", "/apps/web/start"] {
            let (status, json) = post(&t, path, Some(TOKEN), None).await;
            assert_eq!(status, 202, "path: {}", path);
            assert_eq!(json["data"]["trigger"], "restart");
        }
    }

    #[tokio::test]
    async fn test_rollback_accepts_optional_seq() {
        let t = test_api();
        t.store.create_app("web").unwrap();

        let (status, json) = post(&t, "/apps/web/rollback", Some(TOKEN), Some(r#"{"seq":3}"#)).await;
        assert_eq!(status, 202);
        assert_eq!(json["data"]["trigger"], "rollback");

        let (status, _) = post(&t, "/apps/web/rollback", Some(TOKEN), None).await;
        assert_eq!(status, 202);
    }

    #[tokio::test]
    async fn test_stop_unknown_app() {
        let t = test_api();
        let (status, _) = post(&t, "/apps/ghost/stop", Some(TOKEN), None).await;
        assert_eq!(status, 404);
    }

    #[tokio::test]
    async fn test_stop_idle_app_reports_what_it_did() {
        let t = test_api();
        t.store.create_app("web").unwrap();

        let (status, json) = post(&t, "/apps/web/stop", Some(TOKEN), None).await;
        assert_eq!(status, 200);
        assert_eq!(json["data"]["cancelled_in_flight"], false);
        assert!(json["data"]["stopped_container"].is_null());
    }

    #[tokio::test]
    async fn test_logs_without_running_container() {
        let t = test_api();
        t.store.create_app("web").unwrap();

        let (status, json) = get(&t, "/apps/web/logs?tail=50", Some(TOKEN)).await;
        assert_eq!(status, 404);
        assert!(json["error"]
            .as_str()
            .unwrap()
            .contains("no running container"));
    }

    #[tokio::test]
    async fn test_status_reports_counts() {
        let t = test_api();
        t.store.create_app("alpha").unwrap();
        t.store.create_app("beta").unwrap();

        let (status, json) = get(&t, "/status", Some(TOKEN)).await;
        assert_eq!(status, 200);
        let data = &json["data"];
        assert_eq!(data["apps"], 2);
        assert_eq!(data["by_state"]["uninitialized"], 2);
        assert_eq!(data["routes"], 0);
        assert_eq!(data["version"], env!("CARGO_PKG_VERSION"));
        assert!(data["docker"].is_boolean());
    }

    #[test]
    fn test_query_param_extraction() {
        assert_eq!(query_param(Some("tail=50"), "tail").as_deref(), Some("50"));
        assert_eq!(
            query_param(Some("a=1&tail=9&b=2"), "tail").as_deref(),
            Some("9")
        );
        assert_eq!(query_param(Some("a=1"), "tail"), None);
        assert_eq!(query_param(None, "tail"), None);
    }

    #[test]
    fn test_api_response_envelope() {
        let response: ApiResponse<String> = ApiResponse::ok("fine".to_string());
        assert!(response.success);
        assert!(response.error.is_none());

        let error: ApiResponse<String> = ApiResponse::error("broken");
        assert!(!error.success);
        assert!(error.data.is_none());
        assert_eq!(error.error, Some("broken".to_string()));
    }
}

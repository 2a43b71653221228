//! Container lifecycle for application deployments.
//!
//! New code always starts in a fresh container beside the old one; traffic
//! moves only after the newcomer answers its health check. The previous
//! container is untouched until promotion, so a failed deployment leaves
//! whatever was serving exactly as it was.

use crate::docker::{ContainerSpec, DockerManager};
use crate::error::{PipelineError, PipelineResult};
use crate::manifest::{HealthSettings, ResolvedConfig};
use anyhow::Context;
use std::collections::HashMap;
use std::net::TcpListener;
use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, info, warn};

/// Container name for one deployment, versioned so old and new can coexist
/// during the swap.
pub fn container_name(app: &str, seq: i64) -> String {
    format!("slipway-{}-v{}", app, seq)
}

#[derive(Debug, Clone)]
pub struct StartedContainer {
    pub id: String,
    pub name: String,
    pub port: u16,
}

/// Loopback port allocator for published app containers.
pub struct PortAllocator {
    start: u16,
    next: AtomicU16,
}

impl PortAllocator {
    pub fn new(start: u16) -> Self {
        Self {
            start,
            next: AtomicU16::new(start),
        }
    }

    /// Advance past ports already granted to running apps.
    pub fn seed(&self, in_use: impl IntoIterator<Item = u16>) {
        let mut next = self.start;
        for port in in_use {
            if port >= next {
                next = port.saturating_add(1);
            }
        }
        self.next.store(next, Ordering::SeqCst);
    }

    /// Hand out the next port nothing else has bound.
    pub fn allocate(&self) -> PipelineResult<u16> {
        for _ in 0..512 {
            let candidate = self.next.fetch_add(1, Ordering::SeqCst);
            if candidate < self.start {
                // Wrapped around the u16 space
                self.next.store(self.start, Ordering::SeqCst);
                continue;
            }
            if TcpListener::bind(("127.0.0.1", candidate)).is_ok() {
                return Ok(candidate);
            }
            debug!(port = candidate, "Port busy, trying the next one");
        }
        Err(PipelineError::Other(anyhow::anyhow!(
            "no free loopback ports above {}",
            self.start
        )))
    }
}

/// HTTP prober for deployment verification.
pub struct HealthProber {
    http: reqwest::Client,
}

impl HealthProber {
    pub fn new() -> anyhow::Result<Self> {
        let http = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(5))
            .build()
            .context("Failed to build health probe client")?;
        Ok(Self { http })
    }

    /// Probe `127.0.0.1:<port><path>` until it answers 2xx or the retry
    /// budget is spent. Every non-2xx answer, connection error, and probe
    /// timeout counts as one failed attempt.
    pub async fn wait_healthy(
        &self,
        app: &str,
        port: u16,
        health: &HealthSettings,
        cancel: &mut watch::Receiver<bool>,
    ) -> PipelineResult<()> {
        let url = format!("http://127.0.0.1:{}{}", port, health.path);
        let mut last_error = String::from("no probe attempted");
        let mut cancel_alive = true;

        for attempt in 1..=health.retries {
            if *cancel.borrow() {
                return Err(PipelineError::Cancelled);
            }

            match self
                .http
                .get(&url)
                .timeout(health.timeout())
                .send()
                .await
            {
                Ok(resp) if resp.status().is_success() => {
                    info!(app, url = %url, attempt, "Health check passed");
                    return Ok(());
                }
                Ok(resp) => {
                    last_error = format!("HTTP {}", resp.status());
                    debug!(app, attempt, status = %resp.status(), "Health probe failed");
                }
                Err(e) => {
                    last_error = probe_failure(&e);
                    debug!(app, attempt, error = %last_error, "Health probe failed");
                }
            }

            if attempt < health.retries {
                tokio::select! {
                    _ = tokio::time::sleep(health.interval()) => {}
                    changed = cancel.changed(), if cancel_alive => {
                        match changed {
                            Ok(()) if *cancel.borrow() => return Err(PipelineError::Cancelled),
                            Ok(()) => {}
                            Err(_) => cancel_alive = false,
                        }
                    }
                }
            }
        }

        Err(PipelineError::HealthCheck {
            failures: health.retries,
            last_error,
        })
    }
}

fn probe_failure(e: &reqwest::Error) -> String {
    if e.is_timeout() {
        "probe timed out".to_string()
    } else if e.is_connect() {
        "could not connect".to_string()
    } else {
        e.to_string()
    }
}

/// Final container environment: manifest env, then resource binding
/// variables, then the platform variables, later entries overriding earlier
/// ones of the same name.
fn assemble_env(
    config: &ResolvedConfig,
    seq: i64,
    resource_env: HashMap<String, String>,
) -> HashMap<String, String> {
    let mut merged = config.env.clone();
    merged.extend(resource_env);
    merged.insert("PORT".to_string(), config.port.to_string());
    merged.insert("SLIPWAY_APP".to_string(), config.app.clone());
    merged.insert("SLIPWAY_DEPLOYMENT".to_string(), seq.to_string());
    merged
}

pub struct Orchestrator {
    docker: Arc<DockerManager>,
    prober: HealthProber,
    network: String,
    ports: PortAllocator,
    stop_grace: Duration,
}

impl Orchestrator {
    pub fn new(
        docker: Arc<DockerManager>,
        network: String,
        port_range_start: u16,
        stop_grace: Duration,
    ) -> anyhow::Result<Self> {
        Ok(Self {
            docker,
            prober: HealthProber::new()?,
            network,
            ports: PortAllocator::new(port_range_start),
            stop_grace,
        })
    }

    /// Reserve ports already used by promoted deployments, called once at
    /// startup before any deployment runs.
    pub fn seed_ports(&self, in_use: impl IntoIterator<Item = u16>) {
        self.ports.seed(in_use);
    }

    /// Start the container for a deployment next to whatever is already
    /// serving. The container joins the shared network and is published on
    /// a fresh loopback port.
    pub async fn start_deployment(
        &self,
        config: &ResolvedConfig,
        seq: i64,
        image: &str,
        resource_env: HashMap<String, String>,
    ) -> PipelineResult<StartedContainer> {
        let app = &config.app;
        let name = container_name(app, seq);
        let port = self.ports.allocate()?;

        let merged = assemble_env(config, seq, resource_env);
        let env: Vec<String> = merged.iter().map(|(k, v)| format!("{}={}", k, v)).collect();

        let mut labels = HashMap::new();
        labels.insert("slipway.app".to_string(), app.clone());
        labels.insert("slipway.role".to_string(), "app".to_string());
        labels.insert("slipway.deployment".to_string(), seq.to_string());

        let spec = ContainerSpec {
            name: name.clone(),
            image: image.to_string(),
            env,
            network: self.network.clone(),
            container_port: config.port,
            host_port: Some(port),
            memory_bytes: Some(config.memory_bytes),
            cpus: Some(config.cpu),
            labels,
        };

        let id = self.docker.create_and_start(&spec).await?;
        info!(app, seq, container = %name, port, "Deployment container started");

        Ok(StartedContainer { id, name, port })
    }

    /// Health-verify a started container, bounded by the manifest's overall
    /// window even if individual probes stall.
    pub async fn health_check(
        &self,
        app: &str,
        port: u16,
        health: &HealthSettings,
        cancel: &mut watch::Receiver<bool>,
    ) -> PipelineResult<()> {
        let window = health.window();
        match tokio::time::timeout(window, self.prober.wait_healthy(app, port, health, cancel))
            .await
        {
            Ok(result) => result,
            Err(_) => Err(PipelineError::HealthCheck {
                failures: health.retries,
                last_error: format!("no healthy answer within {}s", window.as_secs()),
            }),
        }
    }

    /// Gracefully stop then force-remove a container. Failures are logged;
    /// cleanup never decides a deployment's outcome.
    pub async fn stop_and_remove(&self, container: &str) {
        if let Err(e) = self.docker.stop_container(container, self.stop_grace).await {
            warn!(container, error = %e, "Failed to stop container");
        }
        let _ = self.docker.remove_container(container).await;
    }

    pub async fn stop(&self, container: &str) -> PipelineResult<()> {
        self.docker.stop_container(container, self.stop_grace).await?;
        Ok(())
    }

    pub fn docker(&self) -> &DockerManager {
        &self.docker
    }
}

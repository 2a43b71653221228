//! Docker Engine plumbing shared by the orchestrator and provisioner.
//!
//! Image builds go through the `docker` CLI (see `builder`); everything else
//! uses the Engine API directly.

use anyhow::{Context, Result};
use bollard::container::{
    Config, CreateContainerOptions, LogsOptions, RemoveContainerOptions, StartContainerOptions,
    StopContainerOptions,
};
use bollard::exec::{CreateExecOptions, StartExecResults};
use bollard::image::{CreateImageOptions, RemoveImageOptions};
use bollard::models::{HostConfig, PortBinding};
use bollard::network::CreateNetworkOptions;
use bollard::Docker;
use futures::StreamExt;
use std::collections::HashMap;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Everything needed to create and start one managed container.
#[derive(Debug, Clone)]
pub struct ContainerSpec {
    pub name: String,
    pub image: String,
    /// `KEY=VALUE` pairs
    pub env: Vec<String>,
    pub network: String,
    pub container_port: u16,
    /// Host port publication on 127.0.0.1; databases stay unpublished and
    /// are reached over the shared network instead
    pub host_port: Option<u16>,
    pub memory_bytes: Option<i64>,
    pub cpus: Option<f64>,
    pub labels: HashMap<String, String>,
}

/// Status snapshot from inspecting a container by name or id.
#[derive(Debug, Clone)]
pub struct ContainerStatus {
    pub id: String,
    pub running: bool,
}

/// Thin wrapper around the bollard client.
pub struct DockerManager {
    client: Docker,
}

impl DockerManager {
    /// Connect to the Docker daemon and verify it responds.
    ///
    /// Connection priority:
    /// 1. Explicit endpoint from the daemon configuration
    /// 2. DOCKER_HOST environment variable
    /// 3. Common socket paths
    pub async fn new(docker_host: Option<&str>) -> Result<Self> {
        let client = if let Some(host) = docker_host {
            Self::connect_to_host(host)
                .with_context(|| format!("Failed to connect to Docker at '{}'", host))?
        } else if let Ok(host) = std::env::var("DOCKER_HOST") {
            Self::connect_to_host(&host)
                .with_context(|| format!("Failed to connect to Docker via DOCKER_HOST='{}'", host))?
        } else {
            Self::connect_with_defaults().await?
        };

        client.ping().await.map_err(|e| {
            anyhow::anyhow!(
                "Docker daemon is not responding: {}. Ensure dockerd is running.",
                e
            )
        })?;

        debug!("Connected to Docker daemon");
        Ok(Self { client })
    }

    /// Configure a client without probing the daemon. For callers that can
    /// tolerate a dead daemon until first use.
    pub fn connect_lazy(docker_host: Option<&str>) -> Result<Self> {
        let client = match docker_host {
            Some(host) => Self::connect_to_host(host)?,
            None => Docker::connect_with_socket(
                "/var/run/docker.sock",
                120,
                bollard::API_DEFAULT_VERSION,
            )
            .context("Cannot configure Docker client")?,
        };
        Ok(Self { client })
    }

    fn connect_to_host(host: &str) -> Result<Docker> {
        if host.starts_with("unix://") {
            let socket_path = host.trim_start_matches("unix://");
            Docker::connect_with_socket(socket_path, 120, bollard::API_DEFAULT_VERSION)
                .map_err(|e| anyhow::anyhow!("Cannot connect to Unix socket '{}': {}", socket_path, e))
        } else if host.starts_with("tcp://") || host.starts_with("http://") {
            Docker::connect_with_http(host, 120, bollard::API_DEFAULT_VERSION)
                .map_err(|e| anyhow::anyhow!("Cannot connect to TCP endpoint '{}': {}", host, e))
        } else {
            anyhow::bail!(
                "Invalid docker host '{}'. Expected 'unix:///path/to/socket' or 'tcp://host:port'",
                host
            )
        }
    }

    async fn connect_with_defaults() -> Result<Docker> {
        let home = std::env::var("HOME").unwrap_or_default();

        let socket_paths: Vec<String> = vec![
            "/var/run/docker.sock".to_string(),
            format!("{}/.docker/run/docker.sock", home),
            format!("{}/.colima/default/docker.sock", home),
        ];

        for path in &socket_paths {
            if path.contains("//") && !path.starts_with('/') {
                continue;
            }
            if std::path::Path::new(path).exists() {
                if let Ok(client) =
                    Docker::connect_with_socket(path, 120, bollard::API_DEFAULT_VERSION)
                {
                    if client.ping().await.is_ok() {
                        debug!(path, "Found Docker socket");
                        return Ok(client);
                    }
                }
            }
        }

        Docker::connect_with_socket_defaults().map_err(|e| {
            anyhow::anyhow!(
                "Cannot connect to Docker daemon. Start dockerd or set DOCKER_HOST. \
                 Underlying error: {}",
                e
            )
        })
    }

    pub async fn ping(&self) -> bool {
        self.client.ping().await.is_ok()
    }

    /// Ensure the shared bridge network exists.
    pub async fn ensure_network(&self, name: &str) -> Result<()> {
        match self.client.inspect_network::<String>(name, None).await {
            Ok(_) => Ok(()),
            Err(bollard::errors::Error::DockerResponseServerError {
                status_code: 404, ..
            }) => {
                info!(network = name, "Creating platform network");
                let options = CreateNetworkOptions {
                    name: name.to_string(),
                    driver: "bridge".to_string(),
                    ..Default::default()
                };
                match self.client.create_network(options).await {
                    Ok(_) => Ok(()),
                    // Lost the race with another creator
                    Err(bollard::errors::Error::DockerResponseServerError {
                        status_code: 409,
                        ..
                    }) => Ok(()),
                    Err(e) => Err(anyhow::anyhow!("Failed to create network '{}': {}", name, e)),
                }
            }
            Err(e) => Err(anyhow::anyhow!("Failed to inspect network '{}': {}", name, e)),
        }
    }

    /// Pull `image` from its registry unless it is already present locally.
    pub async fn pull_image_if_missing(&self, image: &str) -> Result<()> {
        if self.client.inspect_image(image).await.is_ok() {
            debug!(image, "Image exists locally, skipping pull");
            return Ok(());
        }

        info!(image, "Pulling image");
        let options = CreateImageOptions {
            from_image: image,
            ..Default::default()
        };

        let mut stream = self.client.create_image(Some(options), None, None);
        while let Some(result) = stream.next().await {
            match result {
                Ok(progress) => {
                    if let Some(status) = progress.status {
                        debug!(image, status, "Pull progress");
                    }
                    if let Some(error) = progress.error {
                        anyhow::bail!("Failed to pull '{}': {}", image, error);
                    }
                }
                Err(e) => {
                    let err_str = e.to_string();
                    if err_str.contains("manifest unknown") || err_str.contains("not found") {
                        anyhow::bail!(
                            "Image '{}' not found in registry. Check the name and tag.",
                            image
                        );
                    }
                    return Err(anyhow::anyhow!("Failed to pull '{}': {}", image, e));
                }
            }
        }

        Ok(())
    }

    /// Create and start a container from a spec. Any stale container with
    /// the same name is removed first.
    pub async fn create_and_start(&self, spec: &ContainerSpec) -> Result<String> {
        let _ = self.remove_container(&spec.name).await;

        let port_key = format!("{}/tcp", spec.container_port);

        let mut exposed_ports: HashMap<String, HashMap<(), ()>> = HashMap::new();
        exposed_ports.insert(port_key.clone(), HashMap::new());

        let port_bindings = spec.host_port.map(|host_port| {
            let mut bindings: HashMap<String, Option<Vec<PortBinding>>> = HashMap::new();
            bindings.insert(
                port_key.clone(),
                Some(vec![PortBinding {
                    host_ip: Some("127.0.0.1".to_string()),
                    host_port: Some(host_port.to_string()),
                }]),
            );
            bindings
        });

        let host_config = HostConfig {
            port_bindings,
            network_mode: Some(spec.network.clone()),
            memory: spec.memory_bytes,
            nano_cpus: spec.cpus.map(|c| (c * 1_000_000_000.0) as i64),
            ..Default::default()
        };

        let container_config = Config {
            image: Some(spec.image.clone()),
            env: Some(spec.env.clone()),
            exposed_ports: Some(exposed_ports),
            labels: Some(spec.labels.clone()),
            host_config: Some(host_config),
            ..Default::default()
        };

        let create_options = CreateContainerOptions {
            name: spec.name.clone(),
            platform: None,
        };

        let response = self
            .client
            .create_container(Some(create_options), container_config)
            .await
            .map_err(|e| {
                let err_str = e.to_string();
                if err_str.contains("port is already allocated")
                    || err_str.contains("address already in use")
                {
                    anyhow::anyhow!(
                        "Host port {:?} is already in use, cannot create '{}'",
                        spec.host_port,
                        spec.name
                    )
                } else if err_str.contains("No such image") {
                    anyhow::anyhow!("Image '{}' not found locally", spec.image)
                } else {
                    anyhow::anyhow!(
                        "Failed to create container '{}' from image '{}': {}",
                        spec.name,
                        spec.image,
                        e
                    )
                }
            })?;

        let container_id = response.id;

        self.client
            .start_container(&container_id, None::<StartContainerOptions<String>>)
            .await
            .map_err(|e| {
                anyhow::anyhow!("Failed to start container '{}': {}", spec.name, e)
            })?;

        info!(
            container = %spec.name,
            id = %container_id,
            image = %spec.image,
            "Started container"
        );

        Ok(container_id)
    }

    /// Start an existing container; already-running is not an error.
    pub async fn start_existing(&self, container: &str) -> Result<()> {
        match self
            .client
            .start_container(container, None::<StartContainerOptions<String>>)
            .await
        {
            Ok(_) => Ok(()),
            Err(bollard::errors::Error::DockerResponseServerError {
                status_code: 304, ..
            }) => Ok(()),
            Err(e) => Err(anyhow::anyhow!("Failed to start container '{}': {}", container, e)),
        }
    }

    /// Stop a container gracefully; missing or already-stopped is fine.
    pub async fn stop_container(&self, container: &str, grace: Duration) -> Result<()> {
        let options = StopContainerOptions {
            t: grace.as_secs() as i64,
        };

        match self.client.stop_container(container, Some(options)).await {
            Ok(_) => {
                info!(container, "Stopped container");
                Ok(())
            }
            Err(bollard::errors::Error::DockerResponseServerError {
                status_code: 304, ..
            }) => {
                debug!(container, "Container was already stopped");
                Ok(())
            }
            Err(bollard::errors::Error::DockerResponseServerError {
                status_code: 404, ..
            }) => {
                debug!(container, "Container not found");
                Ok(())
            }
            Err(e) => Err(anyhow::anyhow!("Failed to stop container: {}", e)),
        }
    }

    /// Force-remove a container. Removal failures are logged, not fatal.
    pub async fn remove_container(&self, container: &str) -> Result<()> {
        let options = RemoveContainerOptions {
            force: true,
            ..Default::default()
        };

        match self.client.remove_container(container, Some(options)).await {
            Ok(_) => {
                debug!(container, "Removed container");
                Ok(())
            }
            Err(bollard::errors::Error::DockerResponseServerError {
                status_code: 404, ..
            }) => {
                debug!(container, "Container not found");
                Ok(())
            }
            Err(e) => {
                warn!(container, error = %e, "Failed to remove container");
                Ok(())
            }
        }
    }

    /// Force-remove an image by tag. Missing images and removal failures are
    /// logged, not fatal.
    pub async fn remove_image(&self, image: &str) -> Result<()> {
        let options = RemoveImageOptions {
            force: true,
            ..Default::default()
        };

        match self.client.remove_image(image, Some(options), None).await {
            Ok(_) => {
                debug!(image, "Removed image");
                Ok(())
            }
            Err(bollard::errors::Error::DockerResponseServerError {
                status_code: 404, ..
            }) => {
                debug!(image, "Image not found");
                Ok(())
            }
            Err(e) => {
                warn!(image, error = %e, "Failed to remove image");
                Ok(())
            }
        }
    }

    /// Inspect a container by name or id.
    pub async fn inspect(&self, container: &str) -> Result<Option<ContainerStatus>> {
        match self.client.inspect_container(container, None).await {
            Ok(info) => {
                let id = info.id.unwrap_or_else(|| container.to_string());
                let running = info.state.and_then(|s| s.running).unwrap_or(false);
                Ok(Some(ContainerStatus { id, running }))
            }
            Err(bollard::errors::Error::DockerResponseServerError {
                status_code: 404, ..
            }) => Ok(None),
            Err(e) => Err(anyhow::anyhow!("Failed to inspect container '{}': {}", container, e)),
        }
    }

    /// Collect the last `tail` lines of a container's output.
    pub async fn tail_logs(&self, container: &str, tail: usize) -> Result<String> {
        let options = LogsOptions::<String> {
            follow: false,
            stdout: true,
            stderr: true,
            timestamps: false,
            tail: tail.to_string(),
            ..Default::default()
        };

        let mut stream = self.client.logs(container, Some(options));
        let mut out = String::new();

        while let Some(chunk) = stream.next().await {
            let chunk = chunk.with_context(|| format!("Failed to read logs for '{}'", container))?;
            out.push_str(&String::from_utf8_lossy(&chunk.into_bytes()));
        }

        Ok(out)
    }

    /// Run a command inside a container and return its exit code and
    /// combined output. Used for database readiness probes.
    pub async fn exec(&self, container: &str, cmd: Vec<&str>) -> Result<(Option<i64>, String)> {
        let exec = self
            .client
            .create_exec(
                container,
                CreateExecOptions {
                    cmd: Some(cmd.iter().map(|s| s.to_string()).collect()),
                    attach_stdout: Some(true),
                    attach_stderr: Some(true),
                    ..Default::default()
                },
            )
            .await
            .with_context(|| format!("Failed to create exec in '{}'", container))?;

        let mut output = String::new();
        if let StartExecResults::Attached { output: mut stream, .. } =
            self.client.start_exec(&exec.id, None).await?
        {
            while let Some(chunk) = stream.next().await {
                if let Ok(log) = chunk {
                    output.push_str(&String::from_utf8_lossy(&log.into_bytes()));
                }
            }
        }

        let inspect = self.client.inspect_exec(&exec.id).await?;
        Ok((inspect.exit_code, output))
    }
}

use slipway::api::{ApiConfig, ApiServer, PKG_NAME, VERSION};
use slipway::builder::Builder;
use slipway::config::{self, DaemonConfig};
use slipway::docker::DockerManager;
use slipway::git::GitManager;
use slipway::orchestrator::Orchestrator;
use slipway::pipeline::{Coordinator, PipelineSettings};
use slipway::provision::Provisioner;
use slipway::routes::RouteRegistrar;
use slipway::store::Store;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{error, info, warn};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("slipway=debug".parse().expect("valid log directive")),
        )
        .init();

    // Load configuration; a missing file means defaults, so a bare
    // `slipway` works on a fresh host
    let config_path = std::env::args()
        .nth(1)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("config.toml"));

    let config = if config_path.exists() {
        let config = DaemonConfig::load(&config_path).map_err(|e| {
            error!(path = %config_path.display(), error = %e, "Failed to load configuration");
            e
        })?;
        info!(path = %config_path.display(), "Configuration loaded");
        config
    } else {
        info!(path = %config_path.display(), "No configuration file found, using defaults");
        DaemonConfig::default()
    };

    // Print startup banner
    print_startup_banner(&config);

    // Write PID file if configured (with exclusive lock on Unix)
    let pid_file_path = config.server.pid_file.as_ref().map(PathBuf::from);
    let _pid_file = if let Some(ref path) = pid_file_path {
        let pid_file = write_pid_file(path)?;
        info!(path = %path.display(), "PID file written and locked");
        Some(pid_file)
    } else {
        None
    };

    config.ensure_directories()?;

    // Generate or use configured API token
    let auth_token = config.server.auth_token.clone().unwrap_or_else(|| {
        let token = config::generate_auth_token();
        info!(token = %token, "Generated API token (configure auth_token to set a fixed value)");
        token
    });

    // Create shutdown channel
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    // Nothing works without the Docker daemon, so fail fast here
    let docker = Arc::new(
        DockerManager::new(config.docker.host.as_deref())
            .await
            .map_err(|e| {
                error!(error = %e, "Docker daemon is not reachable");
                e
            })?,
    );
    docker.ensure_network(&config.docker.network).await?;

    let store = Store::open(config.db_path())?;

    let routes = Arc::new(RouteRegistrar::new(config.routes_dir()));
    let loaded = routes.load()?;
    if loaded > 0 {
        info!(routes = loaded, "Published routes loaded");
    }

    let orchestrator = Orchestrator::new(
        Arc::clone(&docker),
        config.docker.network.clone(),
        config.deploy.port_range_start,
        config.deploy.stop_grace(),
    )?;
    orchestrator.seed_ports(
        store
            .list_apps()?
            .iter()
            .filter_map(|app| app.active_port),
    );

    let builder = Builder::new(
        config.logs_dir(),
        config.deploy.build_timeout(),
        config.deploy.max_concurrent_builds,
    )
    .await?;

    let provisioner = Provisioner::new(
        Arc::clone(&docker),
        store.clone(),
        config.docker.network.clone(),
        config.certs_dir(),
        config.deploy.provision_timeout(),
    );

    // Post-receive hooks call back over loopback regardless of the bind
    // address
    let repos = Arc::new(GitManager::new(
        config.repos_dir(),
        config.worktrees_dir(),
        format!("http://127.0.0.1:{}", config.server.port),
        Some(auth_token.clone()),
    ));

    let (coordinator, queue_rx) = Coordinator::new(
        store.clone(),
        builder,
        provisioner,
        orchestrator,
        Arc::clone(&routes),
        Arc::clone(&repos),
        PipelineSettings {
            domain: config.deploy.domain.clone(),
            history_limit: config.deploy.history_limit,
            lock_timeout: config.deploy.lock_timeout(),
            logs_dir: config.logs_dir(),
        },
    );

    // Deployments interrupted by a crash are closed out before anything
    // new is accepted
    let recovered = coordinator.recover()?;
    if recovered > 0 {
        warn!(deployments = recovered, "Interrupted deployments marked as failed");
    }

    let worker_handles =
        coordinator.spawn_workers(config.deploy.workers, queue_rx, shutdown_rx.clone());
    info!(workers = config.deploy.workers, "Deploy workers started");

    // Spawn API server
    let api = Arc::new(ApiServer::new(
        ApiConfig {
            bind_addr: config.listen_addr()?,
            auth_token,
            domain: config.deploy.domain.clone(),
        },
        store,
        coordinator,
        Arc::clone(&docker),
        routes,
        repos,
        shutdown_rx.clone(),
    ));
    let api_handle = tokio::spawn(async move {
        if let Err(e) = api.run().await {
            error!(error = %e, "API server error");
        }
    });

    // Wait for shutdown signal (Ctrl+C or SIGTERM)
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm =
            signal(SignalKind::terminate()).expect("Failed to install SIGTERM handler");

        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Received SIGINT (Ctrl+C), shutting down...");
            }
            _ = sigterm.recv() => {
                info!("Received SIGTERM, shutting down...");
            }
        }
    }

    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await.expect("Failed to listen for Ctrl+C");
        info!("Received Ctrl+C, shutting down...");
    }

    // Signal shutdown; a deployment mid-stage finishes its stage, records
    // a cancelled outcome, and releases its lock
    let _ = shutdown_tx.send(true);

    info!("Draining deploy workers...");
    let _ = tokio::time::timeout(Duration::from_secs(5), async {
        for handle in worker_handles {
            let _ = handle.await;
        }
        let _ = api_handle.await;
    })
    .await;

    // Clean up PID file
    if let Some(ref path) = pid_file_path {
        if let Err(e) = std::fs::remove_file(path) {
            warn!(path = %path.display(), error = %e, "Failed to remove PID file");
        }
    }

    info!("Shutdown complete");
    Ok(())
}

/// PID file handle that maintains an exclusive lock
#[cfg(unix)]
struct PidFile {
    _file: std::fs::File,
}

#[cfg(unix)]
impl PidFile {
    fn create(path: &Path) -> anyhow::Result<Self> {
        use std::os::unix::io::AsRawFd;

        let file = std::fs::OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)?;

        // Try to acquire exclusive lock (non-blocking)
        let fd = file.as_raw_fd();
        let result = unsafe { libc::flock(fd, libc::LOCK_EX | libc::LOCK_NB) };

        if result != 0 {
            let err = std::io::Error::last_os_error();
            if err.kind() == std::io::ErrorKind::WouldBlock {
                anyhow::bail!("Another instance is already running (PID file is locked)");
            }
            return Err(err.into());
        }

        // Write PID
        let pid = std::process::id();
        use std::io::Write;
        writeln!(&file, "{}", pid)?;

        // Keep the file handle open to maintain the lock
        Ok(Self { _file: file })
    }
}

#[cfg(not(unix))]
struct PidFile;

#[cfg(not(unix))]
impl PidFile {
    fn create(path: &Path) -> anyhow::Result<Self> {
        let pid = std::process::id();
        let mut file = std::fs::File::create(path)?;
        use std::io::Write;
        writeln!(file, "{}", pid)?;
        Ok(Self)
    }
}

fn write_pid_file(path: &Path) -> anyhow::Result<PidFile> {
    PidFile::create(path)
}

fn print_startup_banner(config: &DaemonConfig) {
    info!(
        name = PKG_NAME,
        version = VERSION,
        "Starting deployment daemon"
    );
    info!(
        bind = %config.server.bind,
        port = config.server.port,
        fixed_token = config.server.auth_token.is_some(),
        "Control API"
    );
    info!(
        data_dir = %config.data_dir().display(),
        repos_dir = %config.repos_dir().display(),
        routes_dir = %config.routes_dir().display(),
        "Storage paths"
    );
    info!(
        host = ?config.docker.host,
        network = %config.docker.network,
        "Docker settings"
    );
    info!(
        domain = %config.deploy.domain,
        workers = config.deploy.workers,
        max_concurrent_builds = config.deploy.max_concurrent_builds,
        build_timeout_secs = config.deploy.build_timeout_secs,
        lock_timeout_secs = config.deploy.lock_timeout_secs,
        history_limit = config.deploy.history_limit,
        port_range_start = config.deploy.port_range_start,
        "Deployment settings"
    );
}

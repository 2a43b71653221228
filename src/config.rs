//! Daemon configuration.
//!
//! Loaded once at startup from a TOML file. Everything has a default so an
//! empty file (or no file) gives a working single-node setup under
//! `./slipway_data`.

use rand::distributions::Alphanumeric;
use rand::Rng;
use serde::Deserialize;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Default, Deserialize, Clone)]
pub struct DaemonConfig {
    #[serde(default)]
    pub server: ServerSection,

    #[serde(default)]
    pub paths: PathsSection,

    #[serde(default)]
    pub docker: DockerSection,

    #[serde(default)]
    pub deploy: DeploySection,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerSection {
    /// Bind address for the control API (default: 127.0.0.1)
    #[serde(default = "default_bind")]
    pub bind: String,

    /// Control API port (default: 7700)
    #[serde(default = "default_api_port")]
    pub port: u16,

    /// Bearer token for mutating API calls.
    /// If not set, a random token is generated at startup and logged.
    pub auth_token: Option<String>,

    /// Path to PID file (optional)
    pub pid_file: Option<String>,
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            bind: default_bind(),
            port: default_api_port(),
            auth_token: None,
            pid_file: None,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct PathsSection {
    /// Root for all state the daemon owns (default: ./slipway_data)
    #[serde(default = "default_data_dir")]
    pub data_dir: String,

    /// Bare git repositories (default: <data_dir>/repos)
    pub repos_dir: Option<String>,

    /// Checked-out application sources (default: <data_dir>/worktrees)
    pub worktrees_dir: Option<String>,

    /// Route declarations consumed by the reverse proxy
    /// (default: <data_dir>/routes)
    pub routes_dir: Option<String>,
}

impl Default for PathsSection {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            repos_dir: None,
            worktrees_dir: None,
            routes_dir: None,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct DockerSection {
    /// Docker daemon endpoint; falls back to DOCKER_HOST then common
    /// socket paths
    pub host: Option<String>,

    /// Bridge network shared by app and database containers
    /// (default: slipway)
    #[serde(default = "default_network")]
    pub network: String,
}

impl Default for DockerSection {
    fn default() -> Self {
        Self {
            host: None,
            network: default_network(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct DeploySection {
    /// Base domain for app hostnames: apps serve at `<app>.<domain>`
    /// (default: localhost)
    #[serde(default = "default_domain")]
    pub domain: String,

    /// Deployment worker tasks; the cross-application parallelism bound
    #[serde(default = "default_workers")]
    pub workers: usize,

    /// Image builds allowed to run at once across all applications
    #[serde(default = "default_max_concurrent_builds")]
    pub max_concurrent_builds: usize,

    /// Seconds before an image build is abandoned
    #[serde(default = "default_build_timeout")]
    pub build_timeout_secs: u64,

    /// Seconds to wait for a provisioned resource to become ready
    #[serde(default = "default_provision_timeout")]
    pub provision_timeout_secs: u64,

    /// Seconds a trigger waits for an application's deployment lock
    #[serde(default = "default_lock_timeout")]
    pub lock_timeout_secs: u64,

    /// Grace period for container stop before SIGKILL
    #[serde(default = "default_stop_grace")]
    pub stop_grace_secs: u64,

    /// Deployment records kept per application
    #[serde(default = "default_history_limit")]
    pub history_limit: usize,

    /// First host port handed to app containers
    #[serde(default = "default_port_range_start")]
    pub port_range_start: u16,
}

impl Default for DeploySection {
    fn default() -> Self {
        Self {
            domain: default_domain(),
            workers: default_workers(),
            max_concurrent_builds: default_max_concurrent_builds(),
            build_timeout_secs: default_build_timeout(),
            provision_timeout_secs: default_provision_timeout(),
            lock_timeout_secs: default_lock_timeout(),
            stop_grace_secs: default_stop_grace(),
            history_limit: default_history_limit(),
            port_range_start: default_port_range_start(),
        }
    }
}

impl DeploySection {
    pub fn build_timeout(&self) -> Duration {
        Duration::from_secs(self.build_timeout_secs)
    }

    pub fn provision_timeout(&self) -> Duration {
        Duration::from_secs(self.provision_timeout_secs)
    }

    pub fn lock_timeout(&self) -> Duration {
        Duration::from_secs(self.lock_timeout_secs)
    }

    pub fn stop_grace(&self) -> Duration {
        Duration::from_secs(self.stop_grace_secs)
    }
}

// Default value functions
fn default_bind() -> String {
    "127.0.0.1".to_string()
}

fn default_api_port() -> u16 {
    7700
}

fn default_data_dir() -> String {
    "./slipway_data".to_string()
}

fn default_network() -> String {
    "slipway".to_string()
}

fn default_domain() -> String {
    "localhost".to_string()
}

fn default_workers() -> usize {
    4
}

fn default_max_concurrent_builds() -> usize {
    2
}

fn default_build_timeout() -> u64 {
    600
}

fn default_provision_timeout() -> u64 {
    60
}

fn default_lock_timeout() -> u64 {
    600
}

fn default_stop_grace() -> u64 {
    10
}

fn default_history_limit() -> usize {
    20
}

fn default_port_range_start() -> u16 {
    10000
}

impl DaemonConfig {
    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(&path)?;
        let config: DaemonConfig = toml::from_str(&content)?;
        Ok(config)
    }

    pub fn data_dir(&self) -> PathBuf {
        PathBuf::from(&self.paths.data_dir)
    }

    pub fn repos_dir(&self) -> PathBuf {
        self.paths
            .repos_dir
            .as_ref()
            .map(PathBuf::from)
            .unwrap_or_else(|| self.data_dir().join("repos"))
    }

    pub fn worktrees_dir(&self) -> PathBuf {
        self.paths
            .worktrees_dir
            .as_ref()
            .map(PathBuf::from)
            .unwrap_or_else(|| self.data_dir().join("worktrees"))
    }

    pub fn routes_dir(&self) -> PathBuf {
        self.paths
            .routes_dir
            .as_ref()
            .map(PathBuf::from)
            .unwrap_or_else(|| self.data_dir().join("routes"))
    }

    pub fn logs_dir(&self) -> PathBuf {
        self.data_dir().join("logs")
    }

    pub fn certs_dir(&self) -> PathBuf {
        self.data_dir().join("certs")
    }

    pub fn db_path(&self) -> PathBuf {
        self.data_dir().join("slipway.db")
    }

    pub fn listen_addr(&self) -> anyhow::Result<SocketAddr> {
        format!("{}:{}", self.server.bind, self.server.port)
            .parse()
            .map_err(|e| {
                anyhow::anyhow!(
                    "invalid server bind address '{}:{}': {}",
                    self.server.bind,
                    self.server.port,
                    e
                )
            })
    }

    /// Create every directory the daemon writes into.
    pub fn ensure_directories(&self) -> anyhow::Result<()> {
        for dir in [
            self.data_dir(),
            self.repos_dir(),
            self.worktrees_dir(),
            self.routes_dir(),
            self.logs_dir(),
            self.certs_dir(),
        ] {
            std::fs::create_dir_all(&dir).map_err(|e| {
                anyhow::anyhow!("cannot create directory {}: {}", dir.display(), e)
            })?;
        }
        Ok(())
    }
}

/// Random bearer token for installs that do not configure one.
pub fn generate_auth_token() -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(32)
        .map(char::from)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_config_uses_defaults() {
        let config: DaemonConfig = toml::from_str("").unwrap();
        assert_eq!(config.server.bind, "127.0.0.1");
        assert_eq!(config.server.port, 7700);
        assert!(config.server.auth_token.is_none());
        assert_eq!(config.paths.data_dir, "./slipway_data");
        assert_eq!(config.docker.network, "slipway");
        assert_eq!(config.deploy.domain, "localhost");
        assert_eq!(config.deploy.workers, 4);
        assert_eq!(config.deploy.max_concurrent_builds, 2);
        assert_eq!(config.deploy.build_timeout_secs, 600);
        assert_eq!(config.deploy.history_limit, 20);
        assert_eq!(config.deploy.port_range_start, 10000);
    }

    #[test]
    fn test_parse_full_config() {
        let config: DaemonConfig = toml::from_str(
            r#"
[server]
bind = "0.0.0.0"
port = 8800
auth_token = "secret"

[paths]
data_dir = "/var/lib/slipway"
routes_dir = "/etc/proxy/routes"

[docker]
host = "unix:///var/run/docker.sock"
network = "apps"

[deploy]
domain = "apps.example.com"
workers = 8
max_concurrent_builds = 4
build_timeout_secs = 1200
history_limit = 50
"#,
        )
        .unwrap();

        assert_eq!(config.server.bind, "0.0.0.0");
        assert_eq!(config.server.port, 8800);
        assert_eq!(config.server.auth_token, Some("secret".to_string()));
        assert_eq!(config.paths.data_dir, "/var/lib/slipway");
        assert_eq!(
            config.routes_dir(),
            PathBuf::from("/etc/proxy/routes")
        );
        assert_eq!(
            config.repos_dir(),
            PathBuf::from("/var/lib/slipway/repos")
        );
        assert_eq!(config.docker.network, "apps");
        assert_eq!(config.deploy.domain, "apps.example.com");
        assert_eq!(config.deploy.build_timeout(), Duration::from_secs(1200));
        assert_eq!(config.deploy.history_limit, 50);
    }

    #[test]
    fn test_derived_paths() {
        let config = DaemonConfig::default();
        assert_eq!(config.db_path(), PathBuf::from("./slipway_data/slipway.db"));
        assert_eq!(
            config.worktrees_dir(),
            PathBuf::from("./slipway_data/worktrees")
        );
        assert_eq!(config.logs_dir(), PathBuf::from("./slipway_data/logs"));
        assert_eq!(config.certs_dir(), PathBuf::from("./slipway_data/certs"));
    }

    #[test]
    fn test_listen_addr() {
        let config = DaemonConfig::default();
        let addr = config.listen_addr().unwrap();
        assert_eq!(addr.port(), 7700);

        let mut bad = DaemonConfig::default();
        bad.server.bind = "not an address".to_string();
        assert!(bad.listen_addr().is_err());
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "[server]\nport = 9911\n").unwrap();

        let config = DaemonConfig::load(&path).unwrap();
        assert_eq!(config.server.port, 9911);
    }

    #[test]
    fn test_generate_auth_token() {
        let a = generate_auth_token();
        let b = generate_auth_token();
        assert_eq!(a.len(), 32);
        assert_ne!(a, b);
    }
}

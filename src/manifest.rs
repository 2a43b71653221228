//! Application manifest resolution.
//!
//! Each application describes itself with a `slipway.toml` at the root of its
//! work tree. Resolution reads the manifest, applies defaults, merges a `.env`
//! file when present, validates, and produces the immutable [`ResolvedConfig`]
//! that every later pipeline stage runs against. Resolution does no I/O beyond
//! reading those two files.

use crate::error::{PipelineError, PipelineResult};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

pub const MANIFEST_FILE: &str = "slipway.toml";
pub const DOTENV_FILE: &str = ".env";

/// Raw manifest as written by the application author. Every field is
/// optional; unknown keys are rejected so a typo fails the deployment
/// instead of silently deploying defaults.
#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Manifest {
    /// Port the application listens on inside its container
    pub port: Option<u32>,

    #[serde(default)]
    pub health_check: HealthCheckSection,

    #[serde(default)]
    pub resources: ResourcesSection,

    /// Environment variables. These win over `.env` values on conflict.
    #[serde(default)]
    pub environment: HashMap<String, String>,

    #[serde(default)]
    pub database: DatabaseSection,

    #[serde(default)]
    pub https: HttpsSection,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct HealthCheckSection {
    #[serde(default = "default_health_path")]
    pub path: String,

    /// Seconds between probes
    #[serde(default = "default_health_interval")]
    pub interval: u64,

    /// Per-probe timeout in seconds
    #[serde(default = "default_health_timeout")]
    pub timeout: u64,

    /// Consecutive failures before the deployment is rolled back
    #[serde(default = "default_health_retries")]
    pub retries: u32,
}

impl Default for HealthCheckSection {
    fn default() -> Self {
        Self {
            path: default_health_path(),
            interval: default_health_interval(),
            timeout: default_health_timeout(),
            retries: default_health_retries(),
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ResourcesSection {
    /// Memory limit (e.g., "256m", "1g")
    #[serde(default = "default_memory")]
    pub memory: String,

    /// CPU limit in cores (e.g., 0.5, 2.0)
    #[serde(default = "default_cpu")]
    pub cpu: f64,
}

impl Default for ResourcesSection {
    fn default() -> Self {
        Self {
            memory: default_memory(),
            cpu: default_cpu(),
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DatabaseSection {
    #[serde(default)]
    pub enabled: bool,

    #[serde(default, rename = "type")]
    pub kind: DatabaseKind,

    #[serde(default = "default_database_version")]
    pub version: String,

    /// Database name (default: `<app>_db`)
    pub name: Option<String>,
}

impl Default for DatabaseSection {
    fn default() -> Self {
        Self {
            enabled: false,
            kind: DatabaseKind::default(),
            version: default_database_version(),
            name: None,
        }
    }
}

/// Supported database engines for provisioned databases
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DatabaseKind {
    #[default]
    Postgresql,
    Mysql,
    Mongodb,
}

impl DatabaseKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            DatabaseKind::Postgresql => "postgresql",
            DatabaseKind::Mysql => "mysql",
            DatabaseKind::Mongodb => "mongodb",
        }
    }

    /// Docker image for a given engine version
    pub fn image(&self, version: &str) -> String {
        match self {
            DatabaseKind::Postgresql => format!("postgres:{}", version),
            DatabaseKind::Mysql => format!("mysql:{}", version),
            DatabaseKind::Mongodb => format!("mongo:{}", version),
        }
    }

    /// Port the engine listens on inside its container
    pub fn container_port(&self) -> u16 {
        match self {
            DatabaseKind::Postgresql => 5432,
            DatabaseKind::Mysql => 3306,
            DatabaseKind::Mongodb => 27017,
        }
    }
}

impl std::fmt::Display for DatabaseKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct HttpsSection {
    #[serde(default)]
    pub enabled: bool,

    #[serde(default = "default_redirect_http")]
    pub redirect_http: bool,
}

impl Default for HttpsSection {
    fn default() -> Self {
        Self {
            enabled: false,
            redirect_http: default_redirect_http(),
        }
    }
}

// Default value functions
fn default_health_path() -> String {
    "/health".to_string()
}

fn default_health_interval() -> u64 {
    30
}

fn default_health_timeout() -> u64 {
    10
}

fn default_health_retries() -> u32 {
    3
}

fn default_memory() -> String {
    "256m".to_string()
}

fn default_cpu() -> f64 {
    0.5
}

fn default_database_version() -> String {
    "13".to_string()
}

fn default_redirect_http() -> bool {
    true
}

/// Fully validated configuration for one deployment. Immutable once
/// resolved; the pipeline never re-reads manifest files mid-run.
#[derive(Debug, Clone)]
pub struct ResolvedConfig {
    pub app: String,
    pub port: u16,
    pub health: HealthSettings,
    pub memory: String,
    pub memory_bytes: i64,
    pub cpu: f64,
    /// Merged environment (`.env` then manifest, manifest winning)
    pub env: HashMap<String, String>,
    pub database: DatabaseSettings,
    pub https: HttpsSettings,
}

#[derive(Debug, Clone)]
pub struct HealthSettings {
    pub path: String,
    pub interval_secs: u64,
    pub timeout_secs: u64,
    pub retries: u32,
}

impl HealthSettings {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    /// Upper bound on the whole verification phase, with slack for
    /// container start latency. Saturates rather than overflowing on
    /// out-of-range settings.
    pub fn window(&self) -> Duration {
        let per_attempt = self.interval_secs.saturating_add(self.timeout_secs);
        Duration::from_secs(
            per_attempt
                .saturating_mul(self.retries as u64)
                .saturating_add(15),
        )
    }
}

#[derive(Debug, Clone)]
pub struct DatabaseSettings {
    pub enabled: bool,
    pub kind: DatabaseKind,
    pub version: String,
    pub name: String,
}

#[derive(Debug, Clone)]
pub struct HttpsSettings {
    pub enabled: bool,
    pub redirect_http: bool,
}

/// Resolve the manifest and `.env` in `worktree` for `app`.
///
/// A missing manifest resolves to all defaults; a present but invalid one
/// fails with a [`PipelineError::Config`] naming the offending field.
pub fn resolve(app: &str, worktree: &Path) -> PipelineResult<ResolvedConfig> {
    let manifest_path = worktree.join(MANIFEST_FILE);
    let manifest = if manifest_path.exists() {
        let content = std::fs::read_to_string(&manifest_path).map_err(|e| config_err(
            "manifest",
            format!("cannot read {}: {}", MANIFEST_FILE, e),
        ))?;
        toml::from_str::<Manifest>(&content)
            .map_err(|e| config_err("manifest", e.to_string()))?
    } else {
        Manifest::default()
    };

    let dotenv_path = worktree.join(DOTENV_FILE);
    let dotenv = if dotenv_path.exists() {
        let content = std::fs::read_to_string(&dotenv_path)
            .map_err(|e| config_err(".env", format!("cannot read .env: {}", e)))?;
        parse_dotenv(&content)
    } else {
        HashMap::new()
    };

    resolve_parts(app, manifest, dotenv)
}

/// Validate a raw manifest against defaults and merge the environment.
pub fn resolve_parts(
    app: &str,
    manifest: Manifest,
    dotenv: HashMap<String, String>,
) -> PipelineResult<ResolvedConfig> {
    let port = manifest.port.unwrap_or(3000);
    if port == 0 || port > u16::MAX as u32 {
        return Err(config_err(
            "port",
            format!("must be between 1 and 65535, got {}", port),
        ));
    }

    let hc = manifest.health_check;
    if !hc.path.starts_with('/') {
        return Err(config_err(
            "health_check.path",
            format!("must start with '/', got {:?}", hc.path),
        ));
    }
    if hc.interval == 0 || hc.interval > 3600 {
        return Err(config_err(
            "health_check.interval",
            format!("must be between 1 and 3600 seconds, got {}", hc.interval),
        ));
    }
    if hc.timeout == 0 || hc.timeout > 600 {
        return Err(config_err(
            "health_check.timeout",
            format!("must be between 1 and 600 seconds, got {}", hc.timeout),
        ));
    }
    if hc.retries == 0 || hc.retries > 100 {
        return Err(config_err(
            "health_check.retries",
            format!("must be between 1 and 100, got {}", hc.retries),
        ));
    }

    let res = manifest.resources;
    let memory_bytes = parse_memory_limit(&res.memory)
        .map_err(|e| config_err("resources.memory", e.to_string()))?;
    if memory_bytes <= 0 {
        return Err(config_err(
            "resources.memory",
            format!("must be positive, got {:?}", res.memory),
        ));
    }
    if !(res.cpu > 0.0) {
        return Err(config_err(
            "resources.cpu",
            format!("must be positive, got {}", res.cpu),
        ));
    }

    let db = manifest.database;
    let db_name = db.name.unwrap_or_else(|| format!("{}_db", app.replace('-', "_")));
    if db.enabled {
        if db.version.is_empty() {
            return Err(config_err("database.version", "must not be empty"));
        }
        if db_name.is_empty()
            || !db_name
                .chars()
                .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_')
        {
            return Err(config_err(
                "database.name",
                format!("must be lowercase alphanumeric or '_', got {:?}", db_name),
            ));
        }
    }

    // `.env` first, manifest entries overwrite on conflict
    let mut env = dotenv;
    env.extend(manifest.environment);

    Ok(ResolvedConfig {
        app: app.to_string(),
        port: port as u16,
        health: HealthSettings {
            path: hc.path,
            interval_secs: hc.interval,
            timeout_secs: hc.timeout,
            retries: hc.retries,
        },
        memory: res.memory,
        memory_bytes,
        cpu: res.cpu,
        env,
        database: DatabaseSettings {
            enabled: db.enabled,
            kind: db.kind,
            version: db.version,
            name: db_name,
        },
        https: HttpsSettings {
            enabled: manifest.https.enabled,
            redirect_http: manifest.https.redirect_http,
        },
    })
}

fn config_err(field: &str, message: impl Into<String>) -> PipelineError {
    PipelineError::Config {
        field: field.to_string(),
        message: message.into(),
    }
}

/// Parse a `.env` file: `KEY=VALUE` per line, `#` comments and blank
/// lines ignored, one pair of matching surrounding quotes stripped.
pub fn parse_dotenv(content: &str) -> HashMap<String, String> {
    let mut vars = HashMap::new();
    for line in content.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        if let Some((key, value)) = line.split_once('=') {
            let key = key.trim();
            if key.is_empty() {
                continue;
            }
            let value = value.trim();
            let value = strip_quotes(value);
            vars.insert(key.to_string(), value.to_string());
        }
    }
    vars
}

fn strip_quotes(value: &str) -> &str {
    if value.len() >= 2 {
        let bytes = value.as_bytes();
        let (first, last) = (bytes[0], bytes[value.len() - 1]);
        if first == last && (first == b'"' || first == b'\'') {
            return &value[1..value.len() - 1];
        }
    }
    value
}

/// Parse a memory limit string (e.g., "512m", "1g") to bytes
pub fn parse_memory_limit(limit: &str) -> anyhow::Result<i64> {
    let limit = limit.trim().to_lowercase();
    let (num_str, multiplier) = if limit.ends_with('g') || limit.ends_with("gb") {
        let num = limit.trim_end_matches("gb").trim_end_matches('g');
        (num, 1024 * 1024 * 1024i64)
    } else if limit.ends_with('m') || limit.ends_with("mb") {
        let num = limit.trim_end_matches("mb").trim_end_matches('m');
        (num, 1024 * 1024i64)
    } else if limit.ends_with('k') || limit.ends_with("kb") {
        let num = limit.trim_end_matches("kb").trim_end_matches('k');
        (num, 1024i64)
    } else {
        (limit.as_str(), 1i64)
    };

    let num: f64 = num_str
        .parse()
        .map_err(|_| anyhow::anyhow!("invalid memory limit: {}", limit))?;

    Ok((num * multiplier as f64) as i64)
}

/// Validate an application name: lowercase alphanumeric and hyphens, at
/// most 63 characters, no leading or trailing hyphen. The name doubles as
/// the routing subdomain, so DNS label rules apply.
pub fn validate_app_name(name: &str) -> PipelineResult<()> {
    if name.is_empty() || name.len() > 63 {
        return Err(config_err(
            "name",
            format!("must be 1-63 characters, got {}", name.len()),
        ));
    }
    if !name
        .chars()
        .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-')
    {
        return Err(config_err(
            "name",
            format!("must match [a-z0-9-], got {:?}", name),
        ));
    }
    if name.starts_with('-') || name.ends_with('-') {
        return Err(config_err("name", "must not start or end with '-'"));
    }
    Ok(())
}

/// Commented example manifest returned on application creation; `slip init`
/// writes it next to the code it will deploy.
pub fn example_manifest(app: &str) -> String {
    format!(
        r#"# slipway.toml - deployment manifest for {app}
# Every field is optional; the values below are the defaults.

# Port your application listens on inside its container.
port = 3000

[health_check]
path = "/health"
interval = 30   # seconds between probes
timeout = 10    # seconds per probe
retries = 3     # consecutive failures before rollback

[resources]
memory = "256m"
cpu = 0.5

[environment]
# KEY = "value"   (wins over .env on conflict)

[database]
enabled = false
type = "postgresql"   # postgresql | mysql | mongodb
version = "13"
# name = "{db_name}"

[https]
enabled = false
redirect_http = true
"#,
        app = app,
        db_name = format!("{}_db", app.replace('-', "_")),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn resolve_toml(app: &str, toml_src: &str) -> PipelineResult<ResolvedConfig> {
        let manifest: Manifest = toml::from_str(toml_src).map_err(|e| PipelineError::Config {
            field: "manifest".into(),
            message: e.to_string(),
        })?;
        resolve_parts(app, manifest, HashMap::new())
    }

    #[test]
    fn test_empty_manifest_resolves_to_defaults() {
        let config = resolve_toml("web", "").unwrap();
        assert_eq!(config.port, 3000);
        assert_eq!(config.health.path, "/health");
        assert_eq!(config.health.interval_secs, 30);
        assert_eq!(config.health.timeout_secs, 10);
        assert_eq!(config.health.retries, 3);
        assert_eq!(config.memory, "256m");
        assert_eq!(config.memory_bytes, 256 * 1024 * 1024);
        assert_eq!(config.cpu, 0.5);
        assert!(config.env.is_empty());
        assert!(!config.database.enabled);
        assert_eq!(config.database.kind, DatabaseKind::Postgresql);
        assert_eq!(config.database.version, "13");
        assert_eq!(config.database.name, "web_db");
        assert!(!config.https.enabled);
        assert!(config.https.redirect_http);
    }

    #[test]
    fn test_full_manifest() {
        let config = resolve_toml(
            "api",
            r#"
port = 8080

[health_check]
path = "/healthz"
interval = 5
timeout = 2
retries = 10

[resources]
memory = "1g"
cpu = 2.0

[environment]
RUST_LOG = "info"

[database]
enabled = true
type = "mysql"
version = "8"
name = "api_main"

[https]
enabled = true
redirect_http = false
"#,
        )
        .unwrap();

        assert_eq!(config.port, 8080);
        assert_eq!(config.health.path, "/healthz");
        assert_eq!(config.health.retries, 10);
        assert_eq!(config.memory_bytes, 1024 * 1024 * 1024);
        assert_eq!(config.cpu, 2.0);
        assert_eq!(config.env.get("RUST_LOG"), Some(&"info".to_string()));
        assert!(config.database.enabled);
        assert_eq!(config.database.kind, DatabaseKind::Mysql);
        assert_eq!(config.database.version, "8");
        assert_eq!(config.database.name, "api_main");
        assert!(config.https.enabled);
        assert!(!config.https.redirect_http);
    }

    #[test]
    fn test_unknown_key_rejected() {
        let err = resolve_toml("web", "prot = 3000").unwrap_err();
        assert_eq!(err.kind(), "config");
        assert!(err.to_string().contains("prot"));
    }

    #[test]
    fn test_unknown_nested_key_rejected() {
        let err = resolve_toml(
            "web",
            r#"
[health_check]
pathh = "/health"
"#,
        )
        .unwrap_err();
        assert!(err.to_string().contains("pathh"));
    }

    #[test]
    fn test_port_out_of_range() {
        let err = resolve_toml("web", "port = 0").unwrap_err();
        assert!(err.to_string().contains("port"));

        let err = resolve_toml("web", "port = 70000").unwrap_err();
        assert!(err.to_string().contains("port"));
        assert!(err.to_string().contains("70000"));
    }

    #[test]
    fn test_health_path_must_be_absolute() {
        let err = resolve_toml(
            "web",
            r#"
[health_check]
path = "health"
"#,
        )
        .unwrap_err();
        assert!(err.to_string().contains("health_check.path"));
    }

    #[test]
    fn test_health_retries_at_least_one() {
        let err = resolve_toml(
            "web",
            r#"
[health_check]
retries = 0
"#,
        )
        .unwrap_err();
        assert!(err.to_string().contains("health_check.retries"));
    }

    #[test]
    fn test_health_settings_have_upper_bounds() {
        let err = resolve_toml(
            "web",
            r#"
[health_check]
interval = 9223372036854775807
timeout = 10
retries = 2
"#,
        )
        .unwrap_err();
        assert!(err.to_string().contains("health_check.interval"));

        let err = resolve_toml(
            "web",
            r#"
[health_check]
timeout = 86400
"#,
        )
        .unwrap_err();
        assert!(err.to_string().contains("health_check.timeout"));

        let err = resolve_toml(
            "web",
            r#"
[health_check]
retries = 1000
"#,
        )
        .unwrap_err();
        assert!(err.to_string().contains("health_check.retries"));
    }

    #[test]
    fn test_window_covers_every_attempt_and_never_overflows() {
        let health = HealthSettings {
            path: "/health".to_string(),
            interval_secs: 30,
            timeout_secs: 10,
            retries: 3,
        };
        assert_eq!(health.window(), Duration::from_secs((30 + 10) * 3 + 15));

        let extreme = HealthSettings {
            path: "/health".to_string(),
            interval_secs: u64::MAX,
            timeout_secs: 10,
            retries: 2,
        };
        assert_eq!(extreme.window(), Duration::from_secs(u64::MAX));
    }

    #[test]
    fn test_invalid_memory_rejected() {
        let err = resolve_toml(
            "web",
            r#"
[resources]
memory = "lots"
"#,
        )
        .unwrap_err();
        assert!(err.to_string().contains("resources.memory"));
    }

    #[test]
    fn test_negative_cpu_rejected() {
        let err = resolve_toml(
            "web",
            r#"
[resources]
cpu = -1.0
"#,
        )
        .unwrap_err();
        assert!(err.to_string().contains("resources.cpu"));
    }

    #[test]
    fn test_manifest_wins_over_dotenv() {
        let manifest: Manifest = toml::from_str(
            r#"
[environment]
SHARED = "from-manifest"
MANIFEST_ONLY = "yes"
"#,
        )
        .unwrap();
        let mut dotenv = HashMap::new();
        dotenv.insert("SHARED".to_string(), "from-dotenv".to_string());
        dotenv.insert("ENV_ONLY".to_string(), "yes".to_string());

        let config = resolve_parts("web", manifest, dotenv).unwrap();
        assert_eq!(config.env.get("SHARED"), Some(&"from-manifest".to_string()));
        assert_eq!(config.env.get("ENV_ONLY"), Some(&"yes".to_string()));
        assert_eq!(config.env.get("MANIFEST_ONLY"), Some(&"yes".to_string()));
    }

    #[test]
    fn test_parse_dotenv() {
        let vars = parse_dotenv(
            r#"
# comment
FOO=bar

QUOTED="hello world"
SINGLE='one'
SPACED = padded
EMPTY=
not-a-pair
"#,
        );
        assert_eq!(vars.get("FOO"), Some(&"bar".to_string()));
        assert_eq!(vars.get("QUOTED"), Some(&"hello world".to_string()));
        assert_eq!(vars.get("SINGLE"), Some(&"one".to_string()));
        assert_eq!(vars.get("SPACED"), Some(&"padded".to_string()));
        assert_eq!(vars.get("EMPTY"), Some(&"".to_string()));
        assert!(!vars.contains_key("not-a-pair"));
        assert_eq!(vars.len(), 5);
    }

    #[test]
    fn test_resolve_reads_worktree_files() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join(MANIFEST_FILE),
            "port = 4000\n[environment]\nA = \"manifest\"\n",
        )
        .unwrap();
        std::fs::write(dir.path().join(DOTENV_FILE), "A=dotenv\nB=dotenv\n").unwrap();

        let config = resolve("web", dir.path()).unwrap();
        assert_eq!(config.port, 4000);
        assert_eq!(config.env.get("A"), Some(&"manifest".to_string()));
        assert_eq!(config.env.get("B"), Some(&"dotenv".to_string()));
    }

    #[test]
    fn test_resolve_missing_manifest_is_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = resolve("web", dir.path()).unwrap();
        assert_eq!(config.port, 3000);
    }

    #[test]
    fn test_parse_memory_limit() {
        assert_eq!(parse_memory_limit("512m").unwrap(), 512 * 1024 * 1024);
        assert_eq!(parse_memory_limit("1g").unwrap(), 1024 * 1024 * 1024);
        assert_eq!(parse_memory_limit("1G").unwrap(), 1024 * 1024 * 1024);
        assert_eq!(parse_memory_limit("256mb").unwrap(), 256 * 1024 * 1024);
        assert_eq!(parse_memory_limit("1024k").unwrap(), 1024 * 1024);
        assert_eq!(parse_memory_limit("1048576").unwrap(), 1048576);
        assert!(parse_memory_limit("invalid").is_err());
    }

    #[test]
    fn test_database_kind_mapping() {
        assert_eq!(DatabaseKind::Postgresql.image("13"), "postgres:13");
        assert_eq!(DatabaseKind::Mysql.image("8"), "mysql:8");
        assert_eq!(DatabaseKind::Mongodb.image("6"), "mongo:6");
        assert_eq!(DatabaseKind::Postgresql.container_port(), 5432);
        assert_eq!(DatabaseKind::Mysql.container_port(), 3306);
        assert_eq!(DatabaseKind::Mongodb.container_port(), 27017);
    }

    #[test]
    fn test_validate_app_name() {
        assert!(validate_app_name("web").is_ok());
        assert!(validate_app_name("my-app-2").is_ok());
        assert!(validate_app_name("").is_err());
        assert!(validate_app_name("My-App").is_err());
        assert!(validate_app_name("app_under").is_err());
        assert!(validate_app_name("-edge").is_err());
        assert!(validate_app_name("edge-").is_err());
        assert!(validate_app_name(&"a".repeat(64)).is_err());
    }

    #[test]
    fn test_hyphenated_app_gets_underscored_db_name() {
        let config = resolve_toml("my-app", "[database]\nenabled = true\n").unwrap();
        assert_eq!(config.database.name, "my_app_db");
    }

    #[test]
    fn test_example_manifest_parses_cleanly() {
        let example = example_manifest("demo");
        let manifest: Manifest = toml::from_str(&example).unwrap();
        let config = resolve_parts("demo", manifest, HashMap::new()).unwrap();
        assert_eq!(config.port, 3000);
        assert!(!config.database.enabled);
    }
}

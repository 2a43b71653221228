//! Idempotent provisioning of backing resources declared in the manifest.
//!
//! Each application owns at most one resource per kind. A binding row stores
//! a hash of the parameters it was created from; re-provisioning with equal
//! parameters reuses the binding, while changed parameters are rejected so a
//! manifest edit can never silently detach an app from its data.

use crate::docker::{ContainerSpec, DockerManager};
use crate::error::{PipelineError, PipelineResult};
use crate::manifest::{DatabaseKind, DatabaseSettings, HttpsSettings};
use crate::store::{self, BindingRecord, Store};
use anyhow::Context;
use rand::distributions::Alphanumeric;
use rand::Rng;
use rcgen::{CertificateParams, DistinguishedName, DnType, KeyPair, PKCS_ECDSA_P256_SHA256};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tracing::{debug, info, warn};

pub const KIND_DATABASE: &str = "database";
pub const KIND_CERTIFICATE: &str = "certificate";

const STATUS_PROVISIONING: &str = "provisioning";
const STATUS_READY: &str = "ready";

const READY_POLL_INTERVAL: Duration = Duration::from_secs(2);
/// Certificates within this many days of expiry are reissued on deploy.
const CERT_RENEW_DAYS: i64 = 30;

/// Credential wrapper that keeps passwords out of logs and debug output.
/// Serializes transparently so bindings survive daemon restarts.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Secret(String);

impl Secret {
    pub fn generate() -> Self {
        let value: String = rand::thread_rng()
            .sample_iter(&Alphanumeric)
            .take(24)
            .map(char::from)
            .collect();
        Secret(value)
    }

    pub fn reveal(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for Secret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Secret(****)")
    }
}

/// Connection material for a provisioned database, stored as the binding's
/// JSON payload. The host is the database container's name on the shared
/// network; nothing is published to the host.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DbConnection {
    pub engine: String,
    pub version: String,
    pub host: String,
    pub port: u16,
    pub database: String,
    pub user: String,
    pub password: Secret,
}

impl DbConnection {
    fn generate(settings: &DatabaseSettings, container_name: &str) -> Self {
        Self {
            engine: settings.kind.as_str().to_string(),
            version: settings.version.clone(),
            host: container_name.to_string(),
            port: settings.kind.container_port(),
            database: settings.name.clone(),
            user: format!("{}_user", settings.name),
            password: Secret::generate(),
        }
    }

    pub fn url(&self) -> String {
        match self.engine.as_str() {
            "mysql" => format!(
                "mysql://{}:{}@{}:{}/{}",
                self.user,
                self.password.reveal(),
                self.host,
                self.port,
                self.database
            ),
            // Root credentials live in the admin database
            "mongodb" => format!(
                "mongodb://{}:{}@{}:{}/{}?authSource=admin",
                self.user,
                self.password.reveal(),
                self.host,
                self.port,
                self.database
            ),
            _ => format!(
                "postgres://{}:{}@{}:{}/{}",
                self.user,
                self.password.reveal(),
                self.host,
                self.port,
                self.database
            ),
        }
    }

    /// The environment contract injected into every app container whose
    /// manifest declares a database.
    pub fn env_vars(&self) -> HashMap<String, String> {
        let mut env = HashMap::new();
        env.insert("DATABASE_URL".to_string(), self.url());
        env.insert("DB_HOST".to_string(), self.host.clone());
        env.insert("DB_PORT".to_string(), self.port.to_string());
        env.insert("DB_NAME".to_string(), self.database.clone());
        env.insert("DB_USER".to_string(), self.user.clone());
        env.insert("DB_PASSWORD".to_string(), self.password.reveal().to_string());
        env.insert("DB_TYPE".to_string(), self.engine.clone());
        env
    }
}

/// A ready database for one deployment.
#[derive(Debug, Clone)]
pub struct DatabaseResource {
    pub container_id: String,
    pub container_name: String,
    pub connection: DbConnection,
}

impl DatabaseResource {
    pub fn env_vars(&self) -> HashMap<String, String> {
        self.connection.env_vars()
    }
}

/// Paths to an issued certificate and its private key.
#[derive(Debug, Clone)]
pub struct TlsResource {
    pub hostname: String,
    pub cert_path: PathBuf,
    pub key_path: PathBuf,
}

fn db_container_name(app: &str) -> String {
    format!("slipway-{}-db", app)
}

pub struct Provisioner {
    docker: Arc<DockerManager>,
    store: Store,
    network: String,
    certs_dir: PathBuf,
    provision_timeout: Duration,
}

impl Provisioner {
    pub fn new(
        docker: Arc<DockerManager>,
        store: Store,
        network: String,
        certs_dir: PathBuf,
        provision_timeout: Duration,
    ) -> Self {
        Self {
            docker,
            store,
            network,
            certs_dir,
            provision_timeout,
        }
    }

    /// Provision the declared database, or reuse the existing binding when
    /// the declaration is unchanged.
    ///
    /// A stopped database container is restarted; a missing one is recreated
    /// with the stored credentials so `DATABASE_URL` stays stable across
    /// host reboots and manual cleanup.
    pub async fn database(
        &self,
        app: &str,
        settings: &DatabaseSettings,
        cancel: &mut watch::Receiver<bool>,
    ) -> PipelineResult<Option<DatabaseResource>> {
        if !settings.enabled {
            // An existing binding is left alone; data removal only ever
            // happens on app destroy
            return Ok(None);
        }

        let key = database_key(settings);
        let container_name = db_container_name(app);

        if let Some(existing) = self.store.get_binding(app, KIND_DATABASE)? {
            if existing.idempotency_key != key {
                warn!(
                    app,
                    "Database declaration changed; refusing to replace the existing binding"
                );
                return Err(PipelineError::ProvisionConflict {
                    app: app.to_string(),
                    kind: KIND_DATABASE.to_string(),
                });
            }

            let conn: DbConnection = serde_json::from_str(&existing.connection)
                .context("corrupt database binding record")?;
            let name = existing
                .container_name
                .clone()
                .unwrap_or_else(|| container_name.clone());

            match self.docker.inspect(&name).await? {
                Some(status) if status.running => {
                    if existing.status != STATUS_READY {
                        self.wait_ready(app, settings, &name, &conn, cancel).await?;
                        self.persist_binding(app, &key, STATUS_READY, Some(&status.id), &name, &conn)?;
                    }
                    debug!(app, container = %name, "Reusing running database");
                    return Ok(Some(DatabaseResource {
                        container_id: status.id,
                        container_name: name,
                        connection: conn,
                    }));
                }
                Some(status) => {
                    info!(app, container = %name, "Restarting stopped database container");
                    self.docker
                        .start_existing(&name)
                        .await
                        .map_err(|e| provision_err(app, KIND_DATABASE, e))?;
                    self.wait_ready(app, settings, &name, &conn, cancel).await?;
                    self.persist_binding(app, &key, STATUS_READY, Some(&status.id), &name, &conn)?;
                    return Ok(Some(DatabaseResource {
                        container_id: status.id,
                        container_name: name,
                        connection: conn,
                    }));
                }
                None => {
                    info!(
                        app,
                        container = %name,
                        "Database container is gone; recreating with stored credentials"
                    );
                    let id = self.create_database_container(app, settings, &name, &conn).await?;
                    self.wait_ready(app, settings, &name, &conn, cancel).await?;
                    self.persist_binding(app, &key, STATUS_READY, Some(&id), &name, &conn)?;
                    return Ok(Some(DatabaseResource {
                        container_id: id,
                        container_name: name,
                        connection: conn,
                    }));
                }
            }
        }

        // First provision for this app. Credentials are persisted before the
        // container exists so a crash mid-provision never strands a database
        // with unknown credentials.
        let conn = DbConnection::generate(settings, &container_name);
        self.persist_binding(app, &key, STATUS_PROVISIONING, None, &container_name, &conn)?;

        let id = self
            .create_database_container(app, settings, &container_name, &conn)
            .await?;
        self.wait_ready(app, settings, &container_name, &conn, cancel).await?;
        self.persist_binding(app, &key, STATUS_READY, Some(&id), &container_name, &conn)?;

        info!(app, engine = %settings.kind, database = %conn.database, "Database provisioned");
        Ok(Some(DatabaseResource {
            container_id: id,
            container_name,
            connection: conn,
        }))
    }

    /// Issue or reuse the self-signed certificate for an app's hostname.
    ///
    /// Unlike databases a certificate carries no state worth protecting, so
    /// a hostname change or approaching expiry reissues instead of failing.
    pub fn certificate(
        &self,
        app: &str,
        hostname: &str,
        https: &HttpsSettings,
    ) -> PipelineResult<Option<TlsResource>> {
        if !https.enabled {
            return Ok(None);
        }

        let key = certificate_key(hostname);
        let dir = self.certs_dir.join(app);
        let cert_path = dir.join("cert.pem");
        let key_path = dir.join("key.pem");

        if let Some(existing) = self.store.get_binding(app, KIND_CERTIFICATE)? {
            if existing.idempotency_key == key
                && key_path.exists()
                && cert_days_left(&cert_path).is_some_and(|days| days >= CERT_RENEW_DAYS)
            {
                debug!(app, hostname, "Reusing certificate");
                return Ok(Some(TlsResource {
                    hostname: hostname.to_string(),
                    cert_path,
                    key_path,
                }));
            }
            info!(app, hostname, "Reissuing certificate");
        }

        issue_self_signed(app, hostname, &dir, &cert_path, &key_path)?;

        let connection = serde_json::json!({
            "hostname": hostname,
            "cert_path": cert_path,
            "key_path": key_path,
        });
        self.store.upsert_binding(&BindingRecord {
            app_name: app.to_string(),
            kind: KIND_CERTIFICATE.to_string(),
            idempotency_key: key,
            status: STATUS_READY.to_string(),
            container_id: None,
            container_name: None,
            connection: connection.to_string(),
            created_at: store::now_rfc3339(),
        })?;

        info!(app, hostname, "Issued self-signed certificate");
        Ok(Some(TlsResource {
            hostname: hostname.to_string(),
            cert_path,
            key_path,
        }))
    }

    /// Remove every binding an app owns, with its backing containers and
    /// certificate files. Only called on app destroy.
    pub async fn deprovision_app(&self, app: &str) -> anyhow::Result<()> {
        for binding in self.store.get_bindings(app)? {
            match binding.kind.as_str() {
                KIND_DATABASE => {
                    if let Some(name) = &binding.container_name {
                        info!(app, container = %name, "Removing database container");
                        if let Err(e) = self.docker.stop_container(name, Duration::from_secs(10)).await
                        {
                            warn!(app, error = %e, "Failed to stop database container");
                        }
                        let _ = self.docker.remove_container(name).await;
                    }
                }
                KIND_CERTIFICATE => {
                    let dir = self.certs_dir.join(app);
                    if dir.exists() {
                        if let Err(e) = std::fs::remove_dir_all(&dir) {
                            warn!(app, error = %e, "Failed to remove certificate directory");
                        }
                    }
                }
                other => warn!(app, kind = other, "Unknown binding kind; dropping record"),
            }
            self.store.delete_binding(app, &binding.kind)?;
        }
        Ok(())
    }

    async fn create_database_container(
        &self,
        app: &str,
        settings: &DatabaseSettings,
        container_name: &str,
        conn: &DbConnection,
    ) -> PipelineResult<String> {
        let image = settings.kind.image(&settings.version);
        self.docker
            .pull_image_if_missing(&image)
            .await
            .map_err(|e| provision_err(app, KIND_DATABASE, e))?;

        let mut labels = HashMap::new();
        labels.insert("slipway.app".to_string(), app.to_string());
        labels.insert("slipway.role".to_string(), "database".to_string());

        let spec = ContainerSpec {
            name: container_name.to_string(),
            image,
            env: engine_env(settings, conn),
            network: self.network.clone(),
            container_port: settings.kind.container_port(),
            host_port: None,
            memory_bytes: None,
            cpus: None,
            labels,
        };

        self.docker
            .create_and_start(&spec)
            .await
            .map_err(|e| provision_err(app, KIND_DATABASE, e))
    }

    async fn wait_ready(
        &self,
        app: &str,
        settings: &DatabaseSettings,
        container_name: &str,
        conn: &DbConnection,
        cancel: &mut watch::Receiver<bool>,
    ) -> PipelineResult<()> {
        let deadline = Instant::now() + self.provision_timeout;
        let mut last_status = String::from("no probe attempted");

        loop {
            if *cancel.borrow() {
                return Err(PipelineError::Cancelled);
            }

            let probe = ready_probe(&settings.kind, conn);
            match self
                .docker
                .exec(container_name, probe.iter().map(String::as_str).collect())
                .await
            {
                Ok((Some(0), _)) => {
                    debug!(app, container = container_name, "Database is ready");
                    return Ok(());
                }
                Ok((code, output)) => {
                    last_status = format!("probe exited {:?}: {}", code, output.trim());
                }
                Err(e) => last_status = e.to_string(),
            }

            if Instant::now() >= deadline {
                return Err(PipelineError::Provision {
                    app: app.to_string(),
                    kind: KIND_DATABASE.to_string(),
                    message: format!(
                        "not ready after {}s ({})",
                        self.provision_timeout.as_secs(),
                        last_status
                    ),
                });
            }

            tokio::select! {
                _ = tokio::time::sleep(READY_POLL_INTERVAL) => {}
                _ = cancel.changed() => {}
            }
        }
    }

    fn persist_binding(
        &self,
        app: &str,
        key: &str,
        status: &str,
        container_id: Option<&str>,
        container_name: &str,
        conn: &DbConnection,
    ) -> PipelineResult<()> {
        self.store.upsert_binding(&BindingRecord {
            app_name: app.to_string(),
            kind: KIND_DATABASE.to_string(),
            idempotency_key: key.to_string(),
            status: status.to_string(),
            container_id: container_id.map(|s| s.to_string()),
            container_name: Some(container_name.to_string()),
            connection: serde_json::to_string(conn).context("serialize database binding")?,
            created_at: store::now_rfc3339(),
        })?;
        Ok(())
    }
}

fn provision_err(app: &str, kind: &str, e: impl fmt::Display) -> PipelineError {
    PipelineError::Provision {
        app: app.to_string(),
        kind: kind.to_string(),
        message: e.to_string(),
    }
}

/// Hash of the parameters a database binding was created from. Credentials
/// are generated, not declared, so they stay out of the key.
fn database_key(settings: &DatabaseSettings) -> String {
    let canonical = format!(
        "database|engine={}|version={}|name={}",
        settings.kind.as_str(),
        settings.version,
        settings.name
    );
    hex::encode(Sha256::digest(canonical.as_bytes()))
}

fn certificate_key(hostname: &str) -> String {
    let canonical = format!("certificate|hostname={}", hostname);
    hex::encode(Sha256::digest(canonical.as_bytes()))
}

fn engine_env(settings: &DatabaseSettings, conn: &DbConnection) -> Vec<String> {
    match settings.kind {
        DatabaseKind::Postgresql => vec![
            format!("POSTGRES_DB={}", conn.database),
            format!("POSTGRES_USER={}", conn.user),
            format!("POSTGRES_PASSWORD={}", conn.password.reveal()),
        ],
        DatabaseKind::Mysql => vec![
            format!("MYSQL_DATABASE={}", conn.database),
            format!("MYSQL_USER={}", conn.user),
            format!("MYSQL_PASSWORD={}", conn.password.reveal()),
            "MYSQL_RANDOM_ROOT_PASSWORD=yes".to_string(),
        ],
        DatabaseKind::Mongodb => vec![
            format!("MONGO_INITDB_ROOT_USERNAME={}", conn.user),
            format!("MONGO_INITDB_ROOT_PASSWORD={}", conn.password.reveal()),
            format!("MONGO_INITDB_DATABASE={}", conn.database),
        ],
    }
}

fn ready_probe(kind: &DatabaseKind, conn: &DbConnection) -> Vec<String> {
    match kind {
        DatabaseKind::Postgresql => {
            vec!["pg_isready".to_string(), "-U".to_string(), conn.user.clone()]
        }
        DatabaseKind::Mysql => vec![
            "mysqladmin".to_string(),
            "ping".to_string(),
            "-h".to_string(),
            "127.0.0.1".to_string(),
            "--silent".to_string(),
        ],
        DatabaseKind::Mongodb => vec![
            "mongosh".to_string(),
            "--quiet".to_string(),
            "--eval".to_string(),
            "db.runCommand({ ping: 1 }).ok".to_string(),
        ],
    }
}

fn issue_self_signed(
    app: &str,
    hostname: &str,
    dir: &Path,
    cert_path: &Path,
    key_path: &Path,
) -> PipelineResult<()> {
    std::fs::create_dir_all(dir)
        .with_context(|| format!("cannot create certificate dir {}", dir.display()))?;

    let mut params = CertificateParams::new(vec![hostname.to_string()])
        .map_err(|e| provision_err(app, KIND_CERTIFICATE, e))?;
    let mut dn = DistinguishedName::new();
    dn.push(DnType::CommonName, hostname);
    params.distinguished_name = dn;

    let key_pair = KeyPair::generate_for(&PKCS_ECDSA_P256_SHA256)
        .map_err(|e| provision_err(app, KIND_CERTIFICATE, e))?;
    let cert = params
        .self_signed(&key_pair)
        .map_err(|e| provision_err(app, KIND_CERTIFICATE, e))?;

    std::fs::write(cert_path, cert.pem())
        .with_context(|| format!("cannot write {}", cert_path.display()))?;
    std::fs::write(key_path, key_pair.serialize_pem())
        .with_context(|| format!("cannot write {}", key_path.display()))?;

    Ok(())
}

fn cert_days_left(path: &Path) -> Option<i64> {
    let data = std::fs::read(path).ok()?;
    let (_, pem) = x509_parser::pem::parse_x509_pem(&data).ok()?;
    let cert = pem.parse_x509().ok()?;
    let expiry = cert.validity().not_after.timestamp();
    Some((expiry - chrono::Utc::now().timestamp()) / 86_400)
}

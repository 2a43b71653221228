//! Route publication for the front proxy.
//!
//! The registrar keeps the live hostname table in memory and mirrors every
//! entry to a per-app TOML file that an external proxy watches. Files are
//! written atomically, so a reader never sees a half-written route, and the
//! table is rebuilt from the files on startup.

use crate::error::{PipelineError, PipelineResult};
use crate::store;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::io::Write;
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;
use tracing::{info, warn};

pub fn hostname(app: &str, domain: &str) -> String {
    format!("{}.{}", app, domain)
}

/// One published route: hostname to local backend.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Route {
    pub app: String,
    pub hostname: String,
    /// Backend origin, always loopback
    pub backend: String,
    pub port: u16,
    pub container: String,
    pub deployment: i64,
    pub updated_at: String,
    #[serde(default)]
    pub https: HttpsRoute,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HttpsRoute {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub redirect_http: bool,
    pub cert_path: Option<PathBuf>,
    pub key_path: Option<PathBuf>,
}

impl Route {
    pub fn new(app: &str, hostname: &str, port: u16, container: &str, deployment: i64) -> Self {
        Self {
            app: app.to_string(),
            hostname: hostname.to_string(),
            backend: format!("http://127.0.0.1:{}", port),
            port,
            container: container.to_string(),
            deployment,
            updated_at: store::now_rfc3339(),
            https: HttpsRoute::default(),
        }
    }
}

pub struct RouteRegistrar {
    routes_dir: PathBuf,
    table: RwLock<HashMap<String, Route>>,
}

impl RouteRegistrar {
    pub fn new(routes_dir: PathBuf) -> Self {
        Self {
            routes_dir,
            table: RwLock::new(HashMap::new()),
        }
    }

    /// Rebuild the in-memory table from the route files on disk.
    pub fn load(&self) -> anyhow::Result<usize> {
        if !self.routes_dir.exists() {
            return Ok(0);
        }

        let mut loaded = 0;
        for entry in std::fs::read_dir(&self.routes_dir)? {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) != Some("toml") {
                continue;
            }
            match Self::read_route(&path) {
                Ok(route) => {
                    self.table.write().insert(route.app.clone(), route);
                    loaded += 1;
                }
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "Skipping unreadable route file");
                }
            }
        }

        info!(loaded, "Restored routes from disk");
        Ok(loaded)
    }

    fn read_route(path: &Path) -> anyhow::Result<Route> {
        let content = std::fs::read_to_string(path)?;
        Ok(toml::from_str(&content)?)
    }

    /// Publish or replace the route for an app. The file hits the disk
    /// before the in-memory table changes, so the table never claims a
    /// route the proxy cannot see.
    pub fn publish(&self, route: Route) -> PipelineResult<()> {
        let path = self.route_path(&route.app);
        let content = toml::to_string_pretty(&route).map_err(|e| route_err(&route.app, e))?;

        std::fs::create_dir_all(&self.routes_dir).map_err(|e| route_err(&route.app, e))?;

        let mut tmp =
            NamedTempFile::new_in(&self.routes_dir).map_err(|e| route_err(&route.app, e))?;
        tmp.write_all(content.as_bytes())
            .map_err(|e| route_err(&route.app, e))?;
        tmp.persist(&path).map_err(|e| route_err(&route.app, e))?;

        info!(
            app = %route.app,
            hostname = %route.hostname,
            backend = %route.backend,
            "Route published"
        );
        self.table.write().insert(route.app.clone(), route);
        Ok(())
    }

    /// Remove an app's route. Retracting an unpublished route is a no-op.
    pub fn retract(&self, app: &str) -> PipelineResult<()> {
        let path = self.route_path(app);
        match std::fs::remove_file(&path) {
            Ok(_) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(route_err(app, e)),
        }

        if self.table.write().remove(app).is_some() {
            info!(app, "Route retracted");
        }
        Ok(())
    }

    pub fn get(&self, app: &str) -> Option<Route> {
        self.table.read().get(app).cloned()
    }

    pub fn list(&self) -> Vec<Route> {
        let mut routes: Vec<Route> = self.table.read().values().cloned().collect();
        routes.sort_by(|a, b| a.app.cmp(&b.app));
        routes
    }

    fn route_path(&self, app: &str) -> PathBuf {
        self.routes_dir.join(format!("{}.toml", app))
    }
}

fn route_err(app: &str, e: impl fmt::Display) -> PipelineError {
    PipelineError::Route {
        app: app.to_string(),
        message: e.to_string(),
    }
}

//! Error taxonomy for the deployment pipeline.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Stages a deployment moves through, in pipeline order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    /// Manifest resolution and validation
    Resolve,
    /// Image build
    Build,
    /// Declared resource provisioning
    Provision,
    /// New container creation and start
    Start,
    /// Health verification of the new container
    HealthCheck,
    /// Store promotion of the new deployment
    Promote,
    /// Route publication
    Publish,
    /// Old container teardown
    Cleanup,
}

impl Stage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::Resolve => "resolve",
            Stage::Build => "build",
            Stage::Provision => "provision",
            Stage::Start => "start",
            Stage::HealthCheck => "health_check",
            Stage::Promote => "promote",
            Stage::Publish => "publish",
            Stage::Cleanup => "cleanup",
        }
    }
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Errors that can terminate a deployment.
///
/// Each variant maps to a stable kind string recorded in deployment history
/// and surfaced through the API, so operators can distinguish a manifest typo
/// from a failing health check without reading logs.
#[derive(Debug, Error)]
pub enum PipelineError {
    /// Invalid or unreadable application manifest. Always names the field.
    #[error("invalid manifest field `{field}`: {message}")]
    Config { field: String, message: String },

    /// Image build failed or timed out. The build log has the full output.
    #[error("build failed for {app}: {message}")]
    Build { app: String, message: String },

    /// A declared resource could not be provisioned.
    #[error("provisioning {kind} for {app} failed: {message}")]
    Provision {
        app: String,
        kind: String,
        message: String,
    },

    /// Declared parameters differ from an existing binding. Never resolved
    /// automatically; the operator must remove the binding first.
    #[error("{kind} parameters for {app} changed; remove the existing binding before redeclaring")]
    ProvisionConflict { app: String, kind: String },

    /// The new container never became healthy.
    #[error("health check failed after {failures} attempts: {last_error}")]
    HealthCheck { failures: u32, last_error: String },

    /// Could not acquire the per-application deployment lock in time.
    #[error("timed out after {waited_secs}s waiting for the deployment lock on {app}")]
    LockTimeout { app: String, waited_secs: u64 },

    /// Route publication failed after a successful promotion. The app keeps
    /// serving; the deployment finishes degraded rather than failed.
    #[error("route update for {app} failed: {message}")]
    Route { app: String, message: String },

    /// Container runtime error outside any more specific stage failure.
    #[error("docker error: {0}")]
    Docker(#[from] bollard::errors::Error),

    /// The deployment was cancelled by a stop or destroy request.
    #[error("deployment cancelled")]
    Cancelled,

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl PipelineError {
    /// Stable kind string for history rows and API error payloads.
    pub fn kind(&self) -> &'static str {
        match self {
            PipelineError::Config { .. } => "config",
            PipelineError::Build { .. } => "build",
            PipelineError::Provision { .. } => "provision",
            PipelineError::ProvisionConflict { .. } => "provision_conflict",
            PipelineError::HealthCheck { .. } => "health_check",
            PipelineError::LockTimeout { .. } => "lock_timeout",
            PipelineError::Route { .. } => "route",
            PipelineError::Docker(_) => "docker",
            PipelineError::Cancelled => "cancelled",
            PipelineError::Other(_) => "internal",
        }
    }

}

pub type PipelineResult<T> = Result<T, PipelineError>;

//! Slipway - a git-push-to-deploy platform for a single Docker host
//!
//! This library implements the deployment pipeline behind the `slipway`
//! daemon and the `slip` CLI:
//! - Bare git repositories with push hooks that trigger deployments
//! - Manifest-driven builds into tagged Docker images
//! - Database provisioning with per-app credential bindings
//! - Zero-downtime container swaps gated on health checks
//! - Route publication for a fronting proxy, with rollback on failure
//! - A token-authenticated control API over HTTP

pub mod api;
pub mod builder;
pub mod config;
pub mod docker;
pub mod error;
pub mod git;
pub mod manifest;
pub mod orchestrator;
pub mod pipeline;
pub mod provision;
pub mod routes;
pub mod store;

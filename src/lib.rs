//! Showcase deployer: desired-state deploy engine for a self-hosted PaaS
//!
//! Converges a Docker Engine host or a Kubernetes namespace towards the set
//! of applications, websites and published ports the platform wants running,
//! and exposes container state, restarts, logs and shells of those
//! applications.

pub mod backend;
pub mod config;
pub mod domain;
pub mod error;
pub mod events;
pub mod ingress;
pub mod placement;
pub mod reconcile;
pub mod ssh;
pub mod telemetry;

#[cfg(feature = "metrics")]
pub mod metrics;

#[cfg(feature = "rest-api")]
pub mod rest_api;

#[cfg(test)]
mod test_support;

pub use crate::error::{Error, Result};

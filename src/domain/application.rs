//! Application, Website and PortPublication
//!
//! These are the user-facing objects the deploy engine turns into workloads,
//! services and routes. Validation and conflict rules live here so that both
//! backends reject the same inputs before any resource is synthesized.

use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::container::ContainerState;
use super::ValidationError;

/// How an application is deployed
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum DeployType {
    /// Long-running container built from the repository
    #[default]
    Runtime,
    /// Build artifact served by the shared static file server
    Static,
}

impl std::fmt::Display for DeployType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DeployType::Runtime => write!(f, "runtime"),
            DeployType::Static => write!(f, "static"),
        }
    }
}

/// Build configuration of an application
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum BuildConfig {
    RuntimeBuildpack {
        #[serde(default)]
        context: String,
    },
    RuntimeCmd {
        #[serde(default)]
        base_image: String,
        #[serde(default)]
        build_cmd: String,
    },
    RuntimeDockerfile {
        #[serde(default)]
        dockerfile_name: String,
        #[serde(default)]
        context: String,
    },
    StaticBuildpack {
        #[serde(default)]
        context: String,
        #[serde(default)]
        artifact_path: String,
    },
    StaticCmd {
        #[serde(default)]
        base_image: String,
        #[serde(default)]
        build_cmd: String,
        #[serde(default)]
        artifact_path: String,
    },
    StaticDockerfile {
        #[serde(default)]
        dockerfile_name: String,
        #[serde(default)]
        context: String,
        #[serde(default)]
        artifact_path: String,
    },
}

impl BuildConfig {
    /// Deploy type implied by this build configuration
    pub fn deploy_type(&self) -> DeployType {
        match self {
            BuildConfig::RuntimeBuildpack { .. }
            | BuildConfig::RuntimeCmd { .. }
            | BuildConfig::RuntimeDockerfile { .. } => DeployType::Runtime,
            BuildConfig::StaticBuildpack { .. }
            | BuildConfig::StaticCmd { .. }
            | BuildConfig::StaticDockerfile { .. } => DeployType::Static,
        }
    }
}

/// How a scaled-to-zero application wakes up on the first request
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum StartupBehavior {
    /// Show a waiting page while the container starts
    #[default]
    LoadingPage,
    /// Hold the request until the container is ready
    Blocking,
}

/// Scale-to-zero settings for runtime applications
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AutoShutdownConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub startup: StartupBehavior,
}

/// Deploy-time configuration of an application
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApplicationConfig {
    pub build: BuildConfig,
    /// Overrides the image entrypoint; shell words
    #[serde(default)]
    pub entrypoint: String,
    /// Overrides the image command; shell words
    #[serde(default)]
    pub command: String,
    #[serde(default)]
    pub auto_shutdown: AutoShutdownConfig,
}

/// A user application
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Application {
    pub id: String,
    pub name: String,
    pub deploy_type: DeployType,
    /// Whether the user wants the application to be running
    #[serde(default)]
    pub running: bool,
    #[serde(default)]
    pub container: ContainerState,
    #[serde(default)]
    pub websites: Vec<Website>,
    #[serde(default)]
    pub port_publications: Vec<PortPublication>,
    pub config: ApplicationConfig,
    #[serde(default)]
    pub owner_ids: Vec<String>,
    /// Changing this timestamp restarts the workload
    pub updated_at: DateTime<Utc>,
}

impl Application {
    /// Validate the application before synthesis
    ///
    /// Checks that the deploy type agrees with the build configuration and
    /// that every website and port publication is individually valid.
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.id.is_empty() {
            return Err(ValidationError::new("id", "application id must not be empty"));
        }
        let implied = self.config.build.deploy_type();
        if implied != self.deploy_type {
            return Err(ValidationError::new(
                "deployType",
                format!(
                    "deploy type {} does not match build config ({})",
                    self.deploy_type, implied
                ),
            ));
        }
        if self.deploy_type == DeployType::Static && self.config.auto_shutdown.enabled {
            return Err(ValidationError::new(
                "config.autoShutdown",
                "auto shutdown is only supported for runtime applications",
            ));
        }
        for website in &self.websites {
            website.validate()?;
        }
        for (i, website) in self.websites.iter().enumerate() {
            if self.websites[..i]
                .iter()
                .any(|other| website.conflicts_with(other))
            {
                return Err(ValidationError::new(
                    "websites",
                    format!(
                        "website {}{} conflicts with another website of the same application",
                        website.fqdn, website.path_prefix
                    ),
                ));
            }
        }
        let mut ports = BTreeSet::new();
        for port in &self.port_publications {
            port.validate()?;
            if !ports.insert((port.internet_port, port.protocol)) {
                return Err(ValidationError::new(
                    "portPublications",
                    format!("port {}/{} published twice", port.internet_port, port.protocol),
                ));
            }
        }
        Ok(())
    }

    pub fn is_owner(&self, user_id: &str) -> bool {
        self.owner_ids.iter().any(|id| id == user_id)
    }

    /// Whether the application scales to zero and needs a cold-start gate
    pub fn scales_to_zero(&self) -> bool {
        self.deploy_type == DeployType::Runtime && self.config.auto_shutdown.enabled
    }

    /// Check the application's websites against websites of other applications
    ///
    /// `existing` pairs each website with its owning application. Overlapping
    /// paths on an application the user also owns are allowed, exact duplicates
    /// never are.
    pub fn check_website_conflicts<'a>(
        &self,
        existing: impl IntoIterator<Item = (&'a Application, &'a Website)>,
        user_id: &str,
    ) -> Result<(), ValidationError> {
        let existing: Vec<_> = existing
            .into_iter()
            .filter(|(app, _)| app.id != self.id)
            .collect();
        for website in &self.websites {
            for (other_app, other) in &existing {
                if !website.conflicts_with(other) {
                    continue;
                }
                if website.is_same_endpoint(other) || !other_app.is_owner(user_id) {
                    return Err(ValidationError::new(
                        "websites",
                        format!(
                            "website {}{} conflicts with application {}",
                            website.fqdn, website.path_prefix, other_app.name
                        ),
                    ));
                }
            }
        }
        Ok(())
    }

    /// Check the application's port publications against other applications
    pub fn check_port_conflicts<'a>(
        &self,
        existing: impl IntoIterator<Item = &'a Application>,
    ) -> Result<(), ValidationError> {
        for other in existing.into_iter().filter(|app| app.id != self.id) {
            for port in &self.port_publications {
                if other
                    .port_publications
                    .iter()
                    .any(|p| p.conflicts_with(port))
                {
                    return Err(ValidationError::new(
                        "portPublications",
                        format!(
                            "port {}/{} is already used by application {}",
                            port.internet_port, port.protocol, other.name
                        ),
                    ));
                }
            }
        }
        Ok(())
    }
}

/// Authentication level enforced in front of a website
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum AuthenticationType {
    /// No authentication
    #[default]
    Off,
    /// Identify the user if logged in, but let anonymous requests through
    Soft,
    /// Require login
    Hard,
}

/// A public endpoint of an application
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Website {
    pub id: String,
    pub fqdn: String,
    #[serde(default = "root_path")]
    pub path_prefix: String,
    #[serde(default)]
    pub strip_prefix: bool,
    #[serde(default)]
    pub https: bool,
    #[serde(default)]
    pub h2c: bool,
    pub http_port: u16,
    #[serde(default)]
    pub authentication: AuthenticationType,
}

fn root_path() -> String {
    "/".to_string()
}

impl Website {
    pub fn validate(&self) -> Result<(), ValidationError> {
        if !is_valid_domain(&self.fqdn) {
            return Err(ValidationError::new(
                "fqdn",
                format!("invalid domain {:?}", self.fqdn),
            ));
        }
        if !is_valid_path_prefix(&self.path_prefix) {
            return Err(ValidationError::new(
                "pathPrefix",
                format!(
                    "invalid path prefix {:?}: must start with '/' and have no trailing slash",
                    self.path_prefix
                ),
            ));
        }
        if self.path_prefix == "/" && self.strip_prefix {
            return Err(ValidationError::new(
                "stripPrefix",
                "strip prefix cannot be used with the root path",
            ));
        }
        if self.http_port == 0 {
            return Err(ValidationError::new("httpPort", "port must be in 1-65535"));
        }
        Ok(())
    }

    /// True when both websites would claim overlapping requests
    pub fn conflicts_with(&self, other: &Website) -> bool {
        if self.fqdn != other.fqdn || self.https != other.https {
            return false;
        }
        path_contains(&self.path_prefix, &other.path_prefix)
            || path_contains(&other.path_prefix, &self.path_prefix)
    }

    fn is_same_endpoint(&self, other: &Website) -> bool {
        self.fqdn == other.fqdn && self.https == other.https && self.path_prefix == other.path_prefix
    }

    pub fn scheme(&self) -> &'static str {
        if self.https {
            "https"
        } else {
            "http"
        }
    }

    /// Scheme Traefik uses to reach the backend
    pub fn backend_scheme(&self) -> &'static str {
        if self.h2c {
            "h2c"
        } else {
            "http"
        }
    }

    pub fn url(&self) -> String {
        let path = if self.path_prefix == "/" {
            ""
        } else {
            self.path_prefix.as_str()
        };
        format!("{}://{}{}", self.scheme(), self.fqdn, path)
    }
}

/// Segment-aware prefix test: `/api` contains `/api/v1` but not `/apis`
fn path_contains(prefix: &str, path: &str) -> bool {
    if prefix == "/" || prefix == path {
        return true;
    }
    path.strip_prefix(prefix)
        .is_some_and(|rest| rest.starts_with('/'))
}

/// Validate a path prefix: starts with `/`, no trailing slash unless root
pub fn is_valid_path_prefix(prefix: &str) -> bool {
    if prefix == "/" {
        return true;
    }
    prefix.starts_with('/')
        && !prefix.ends_with('/')
        && !prefix.contains("//")
        && !prefix.chars().any(|c| c.is_whitespace() || c == '`')
}

/// Validate a DNS name (optionally a wildcard when `allow_wildcard`)
pub(crate) fn is_valid_domain_with(domain: &str, allow_wildcard: bool) -> bool {
    if domain.is_empty() || domain.len() > 253 {
        return false;
    }
    let labels: Vec<&str> = domain.split('.').collect();
    if labels.len() < 2 {
        return false;
    }
    labels.iter().enumerate().all(|(i, label)| {
        if *label == "*" {
            return allow_wildcard && i == 0;
        }
        !label.is_empty()
            && label.len() <= 63
            && !label.starts_with('-')
            && !label.ends_with('-')
            && label
                .chars()
                .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-')
    })
}

/// Validate a concrete (non-wildcard) FQDN
pub fn is_valid_domain(fqdn: &str) -> bool {
    is_valid_domain_with(fqdn, false)
}

/// Transport protocol of a published port
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PortProtocol {
    #[default]
    Tcp,
    Udp,
}

impl PortProtocol {
    pub fn as_str(&self) -> &'static str {
        match self {
            PortProtocol::Tcp => "tcp",
            PortProtocol::Udp => "udp",
        }
    }
}

impl std::fmt::Display for PortProtocol {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// An internet-facing port forwarded to an application port
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PortPublication {
    pub internet_port: u16,
    pub application_port: u16,
    #[serde(default)]
    pub protocol: PortProtocol,
}

impl PortPublication {
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.internet_port == 0 || self.application_port == 0 {
            return Err(ValidationError::new(
                "portPublications",
                "ports must be in 1-65535",
            ));
        }
        Ok(())
    }

    pub fn conflicts_with(&self, other: &PortPublication) -> bool {
        self.internet_port == other.internet_port && self.protocol == other.protocol
    }
}

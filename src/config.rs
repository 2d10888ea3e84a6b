//! Operator configuration
//!
//! Loaded from a YAML file selected on the command line. Every section has
//! serde defaults so a minimal file only names the backend and its domains.
//!
//! ```yaml
//! backend: kubernetes
//! domains:
//!   - domain: "*.apps.example.com"
//!     authAvailable: true
//! ports:
//!   - { start: 30000, end: 30100, protocol: tcp }
//! routing:
//!   auth:
//!     soft: [{ name: ns-auth-soft }]
//!     hard: [{ name: ns-auth-hard }]
//! ```

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::backend::docker::containers::{parse_memory_bytes, parse_nano_cpus};
use crate::domain::{AvailableDomain, AvailablePort, StartupBehavior, WildcardDomains};
use crate::error::{Error, Result};

/// Which container platform the backend drives
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    #[default]
    Docker,
    Kubernetes,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Config {
    #[serde(default)]
    pub backend: BackendKind,
    /// Prefix of every ownership label, e.g. `ns.trap.jp`
    #[serde(default = "default_label_namespace")]
    pub label_namespace: String,
    #[serde(default)]
    pub domains: Vec<AvailableDomain>,
    #[serde(default)]
    pub ports: Vec<AvailablePort>,
    #[serde(default)]
    pub routing: RoutingConfig,
    #[serde(default)]
    pub tls: TlsConfig,
    #[serde(default)]
    pub resources: ResourceRequirements,
    #[serde(default)]
    pub scheduling: SchedulingConfig,
    #[serde(default)]
    pub static_server: StaticServerConfig,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cold_start: Option<ColdStartConfig>,
    #[serde(default)]
    pub docker: DockerConfig,
    #[serde(default)]
    pub kubernetes: KubernetesConfig,
}

fn default_label_namespace() -> String {
    "ns.trap.jp".to_string()
}

impl Config {
    /// Read and validate a YAML config file
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)?;
        Self::from_yaml(&raw)
    }

    pub fn from_yaml(raw: &str) -> Result<Self> {
        let config: Config = serde_yaml::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        for domain in &self.domains {
            domain.validate()?;
        }
        for port in &self.ports {
            port.validate()?;
        }
        if self.label_namespace.is_empty() || self.label_namespace.contains('/') {
            return Err(Error::ConfigError(format!(
                "labelNamespace {:?} must be a non-empty DNS prefix",
                self.label_namespace
            )));
        }
        if self.backend == BackendKind::Kubernetes && self.kubernetes.namespace.is_empty() {
            return Err(Error::ConfigError(
                "kubernetes.namespace must be set".to_string(),
            ));
        }
        if self.backend == BackendKind::Docker && self.tls.source == CertificateSource::CertManager {
            return Err(Error::ConfigError(
                "tls.source cert-manager requires the kubernetes backend".to_string(),
            ));
        }
        self.resources.validate()?;
        Ok(())
    }

    /// Wildcards that anchor shared certificates
    ///
    /// Explicit `tls.wildcardDomains` win over the wildcard entries of
    /// `domains`.
    pub fn wildcard_domains(&self) -> Result<WildcardDomains> {
        if self.tls.wildcard_domains.is_empty() {
            Ok(WildcardDomains::from_available(&self.domains))
        } else {
            Ok(WildcardDomains::new(self.tls.wildcard_domains.clone())?)
        }
    }
}

/// Reference to a reverse-proxy middleware that exists outside this engine
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MiddlewareRef {
    pub name: String,
    /// Kubernetes namespace of the middleware; defaults to the app namespace
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
}

/// Middlewares attached for soft and hard website authentication
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuthMiddlewares {
    #[serde(default)]
    pub soft: Vec<MiddlewareRef>,
    #[serde(default)]
    pub hard: Vec<MiddlewareRef>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RoutingConfig {
    /// Added to every rule's length to form the router priority
    #[serde(default = "default_priority_offset")]
    pub priority_offset: i64,
    #[serde(default)]
    pub auth: AuthMiddlewares,
    #[serde(default = "default_http_entrypoint")]
    pub http_entrypoint: String,
    #[serde(default = "default_https_entrypoint")]
    pub https_entrypoint: String,
}

impl Default for RoutingConfig {
    fn default() -> Self {
        Self {
            priority_offset: default_priority_offset(),
            auth: AuthMiddlewares::default(),
            http_entrypoint: default_http_entrypoint(),
            https_entrypoint: default_https_entrypoint(),
        }
    }
}

fn default_priority_offset() -> i64 {
    0
}

fn default_http_entrypoint() -> String {
    "web".to_string()
}

fn default_https_entrypoint() -> String {
    "websecure".to_string()
}

/// How certificates are obtained for HTTPS websites
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CertificateSource {
    /// Traefik ACME resolver, certificate per target domain
    #[default]
    Traefik,
    /// cert-manager `Certificate` objects synthesized by the leader
    CertManager,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TlsConfig {
    #[serde(default)]
    pub source: CertificateSource,
    /// Traefik certificate resolver name
    #[serde(default = "default_cert_resolver")]
    pub cert_resolver: String,
    /// cert-manager issuer reference
    #[serde(default)]
    pub issuer: IssuerRef,
    #[serde(default)]
    pub wildcard_domains: Vec<String>,
}

impl Default for TlsConfig {
    fn default() -> Self {
        Self {
            source: CertificateSource::default(),
            cert_resolver: default_cert_resolver(),
            issuer: IssuerRef::default(),
            wildcard_domains: Vec::new(),
        }
    }
}

fn default_cert_resolver() -> String {
    "nsresolver".to_string()
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IssuerRef {
    pub name: String,
    #[serde(default = "default_issuer_kind")]
    pub kind: String,
}

impl Default for IssuerRef {
    fn default() -> Self {
        Self {
            name: "letsencrypt".to_string(),
            kind: default_issuer_kind(),
        }
    }
}

fn default_issuer_kind() -> String {
    "ClusterIssuer".to_string()
}

/// Kubernetes-style resource requirements applied to every application
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceRequirements {
    #[serde(default)]
    pub requests: ResourceSpec,
    #[serde(default)]
    pub limits: ResourceSpec,
}

/// CPU and memory quantities; empty means unset
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceSpec {
    /// CPU cores (e.g., "500m", "2")
    #[serde(default)]
    pub cpu: String,
    /// Memory (e.g., "256Mi", "1Gi")
    #[serde(default)]
    pub memory: String,
}

impl ResourceRequirements {
    /// Every set quantity must be positive and representable
    pub fn validate(&self) -> Result<()> {
        for (field, spec) in [("requests", &self.requests), ("limits", &self.limits)] {
            if !spec.cpu.is_empty() {
                parse_nano_cpus(&spec.cpu).map_err(|e| {
                    Error::ConfigError(format!("resources.{}.cpu: {}", field, e))
                })?;
            }
            if !spec.memory.is_empty() {
                parse_memory_bytes(&spec.memory).map_err(|e| {
                    Error::ConfigError(format!("resources.{}.memory: {}", field, e))
                })?;
            }
        }
        Ok(())
    }
}

impl ResourceSpec {
    pub fn is_empty(&self) -> bool {
        self.cpu.is_empty() && self.memory.is_empty()
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Toleration {
    pub key: String,
    #[serde(default = "default_toleration_operator")]
    pub operator: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub effect: Option<String>,
}

fn default_toleration_operator() -> String {
    "Equal".to_string()
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SpreadConstraint {
    pub topology_key: String,
    #[serde(default = "default_max_skew")]
    pub max_skew: i32,
    #[serde(default = "default_when_unsatisfiable")]
    pub when_unsatisfiable: String,
}

fn default_max_skew() -> i32 {
    1
}

fn default_when_unsatisfiable() -> String {
    "ScheduleAnyway".to_string()
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SchedulingConfig {
    /// Candidate hosts for sticky placement; empty lets the scheduler decide
    #[serde(default)]
    pub node_pool: Vec<String>,
    /// Node label the pinned host name is matched against
    #[serde(default = "default_node_label")]
    pub node_label: String,
    #[serde(default)]
    pub tolerations: Vec<Toleration>,
    #[serde(default)]
    pub spread_constraints: Vec<SpreadConstraint>,
}

impl Default for SchedulingConfig {
    fn default() -> Self {
        Self {
            node_pool: Vec::new(),
            node_label: default_node_label(),
            tolerations: Vec::new(),
            spread_constraints: Vec::new(),
        }
    }
}

fn default_node_label() -> String {
    "kubernetes.io/hostname".to_string()
}

/// The shared static-file server that serves every static site
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StaticServerConfig {
    /// Pod labels of the static server (Kubernetes)
    #[serde(default = "default_static_selector")]
    pub selector: BTreeMap<String, String>,
    #[serde(default = "default_static_port")]
    pub port: u16,
    /// URL Traefik forwards static sites to (Docker)
    #[serde(default = "default_static_url")]
    pub url: String,
}

impl Default for StaticServerConfig {
    fn default() -> Self {
        Self {
            selector: default_static_selector(),
            port: default_static_port(),
            url: default_static_url(),
        }
    }
}

fn default_static_selector() -> BTreeMap<String, String> {
    BTreeMap::from([(
        "app.kubernetes.io/name".to_string(),
        "ns-static".to_string(),
    )])
}

fn default_static_port() -> u16 {
    80
}

fn default_static_url() -> String {
    "http://ns-static:80".to_string()
}

/// Cold-start gate for scale-to-zero applications (Sablier plugin)
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ColdStartConfig {
    /// Sablier API URL
    pub url: String,
    #[serde(default = "default_session_duration")]
    pub session_duration: String,
    #[serde(default = "default_loading_theme")]
    pub theme: String,
    #[serde(default = "default_blocking_timeout")]
    pub blocking_timeout: String,
}

impl ColdStartConfig {
    pub fn strategy_name(startup: StartupBehavior) -> &'static str {
        match startup {
            StartupBehavior::LoadingPage => "dynamic",
            StartupBehavior::Blocking => "blocking",
        }
    }
}

fn default_session_duration() -> String {
    "15m".to_string()
}

fn default_loading_theme() -> String {
    "neoshowcase".to_string()
}

fn default_blocking_timeout() -> String {
    "60s".to_string()
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DockerConfig {
    /// Network shared by Traefik and every application container
    #[serde(default = "default_docker_network")]
    pub network: String,
    /// Directory watched by Traefik's file provider
    #[serde(default = "default_docker_config_dir")]
    pub config_dir: PathBuf,
    /// Seconds a container gets to stop before it is killed
    #[serde(default = "default_stop_grace")]
    pub stop_grace_seconds: i32,
}

impl Default for DockerConfig {
    fn default() -> Self {
        Self {
            network: default_docker_network(),
            config_dir: default_docker_config_dir(),
            stop_grace_seconds: default_stop_grace(),
        }
    }
}

fn default_docker_network() -> String {
    "neoshowcase_apps".to_string()
}

fn default_docker_config_dir() -> PathBuf {
    PathBuf::from("/opt/traefik/conf")
}

fn default_stop_grace() -> i32 {
    10
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KubernetesConfig {
    /// Namespace every application resource lives in
    #[serde(default)]
    pub namespace: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image_pull_secret: Option<String>,
}

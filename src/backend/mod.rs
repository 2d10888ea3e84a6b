//! Container platform backends
//!
//! [`Backend`] is the single facade the rest of the platform talks to. Two
//! implementations exist: [`docker::DockerBackend`] drives one Docker Engine
//! and a file-provider Traefik, [`k8s::K8sBackend`] drives a Kubernetes
//! namespace with Traefik and cert-manager CRDs.

pub mod docker;
pub mod k8s;

use std::collections::BTreeMap;
use std::future::Future;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tracing::{debug, warn};

use crate::domain::{
    Application, AvailableDomain, AvailablePort, Container, DesiredState, DesiredStateLeader,
    RuntimeDesiredState, StaticSite,
};
use crate::error::{Error, Result};
use crate::reconcile::SyncReport;

/// Caller-provided streams of an exec session
pub struct ExecStreams {
    pub stdin: Box<dyn AsyncRead + Send + Unpin>,
    pub stdout: Box<dyn AsyncWrite + Send + Unpin>,
    pub stderr: Box<dyn AsyncWrite + Send + Unpin>,
}

impl std::fmt::Debug for ExecStreams {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecStreams").finish_non_exhaustive()
    }
}

#[async_trait]
pub trait Backend: Send + Sync {
    /// Converge the platform towards `state`
    ///
    /// Invalid applications are skipped with a warning. Only a failure to
    /// list existing resources aborts the pass.
    async fn synchronize(&self, state: &DesiredState) -> Result<SyncReport>;

    /// Converge cluster-wide shared resources (certificates)
    ///
    /// Meant to be called by the elected leader only.
    async fn synchronize_shared(&self, state: &DesiredStateLeader) -> Result<SyncReport>;

    async fn get_container(&self, app_id: &str) -> Result<Container>;

    async fn list_containers(&self) -> Result<Vec<Container>>;

    async fn restart_container(&self, app_id: &str) -> Result<()>;

    /// Run `cmd` inside the application's container
    ///
    /// The end of the caller's input only closes the command's stdin; the
    /// session lasts until the command's output closes.
    async fn exec_container(
        &self,
        app_id: &str,
        cmd: &[String],
        streams: ExecStreams,
    ) -> Result<()>;

    /// Last `tail` lines of the container's combined output
    async fn container_logs(&self, app_id: &str, tail: usize) -> Result<String>;

    fn available_domains(&self) -> &[AvailableDomain];

    fn available_ports(&self) -> &[AvailablePort];

    /// Stop the event watcher and release resources
    async fn dispose(&self) -> Result<()>;
}

/// Drive one exec session
///
/// `stdin` is copied to `remote_stdin` until it ends, then `remote_stdin` is
/// shut down so the command sees EOF. `output` keeps draining meanwhile and
/// its completion ends the session.
pub(crate) async fn run_exec_session<R, W, F>(
    mut stdin: R,
    mut remote_stdin: W,
    output: F,
) -> Result<()>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
    F: Future<Output = Result<()>>,
{
    let input = async {
        tokio::io::copy(&mut stdin, &mut remote_stdin).await?;
        remote_stdin.shutdown().await
    };
    tokio::pin!(input);
    tokio::pin!(output);

    let mut input_open = true;
    loop {
        tokio::select! {
            r = &mut input, if input_open => {
                input_open = false;
                if let Err(e) = r {
                    // the command may have exited; its output still decides
                    debug!("Exec input closed: {}", e);
                }
            }
            r = &mut output => return r,
        }
    }
}

/// Name of the per-application workload / container
pub fn app_resource_name(app_id: &str) -> String {
    format!("nsapp-{}", app_id)
}

/// Name of the per-website service and router
pub fn website_resource_name(website_id: &str) -> String {
    format!("nsapp-{}", website_id)
}

/// Label keys identifying resources managed by this engine
///
/// Kubernetes keys use the `<prefix>/<name>` form, Docker keys the dotted
/// `<prefix>.<name>` convention.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct OwnershipLabels {
    prefix: String,
    separator: char,
}

impl OwnershipLabels {
    pub fn kubernetes(prefix: &str) -> Self {
        Self {
            prefix: prefix.to_string(),
            separator: '/',
        }
    }

    pub fn docker(prefix: &str) -> Self {
        Self {
            prefix: prefix.to_string(),
            separator: '.',
        }
    }

    fn key(&self, name: &str) -> String {
        format!("{}{}{}", self.prefix, self.separator, name)
    }

    pub fn managed_key(&self) -> String {
        self.key("app")
    }

    pub fn app_id_key(&self) -> String {
        self.key("appId")
    }

    pub fn hash_key(&self) -> String {
        self.key("resource-hash")
    }

    /// Marks shared resources reconciled by the leader
    pub fn shared_key(&self) -> String {
        self.key("shared")
    }

    /// Labels carried by every per-application resource
    pub fn app_labels(&self, app_id: &str) -> BTreeMap<String, String> {
        BTreeMap::from([
            (self.managed_key(), "true".to_string()),
            (self.app_id_key(), app_id.to_string()),
        ])
    }

    pub fn managed_labels(&self) -> BTreeMap<String, String> {
        BTreeMap::from([(self.managed_key(), "true".to_string())])
    }

    pub fn shared_labels(&self) -> BTreeMap<String, String> {
        BTreeMap::from([(self.shared_key(), "true".to_string())])
    }

    /// `key=true` selector over per-application resources
    pub fn managed_selector(&self) -> String {
        format!("{}=true", self.managed_key())
    }

    pub fn shared_selector(&self) -> String {
        format!("{}=true", self.shared_key())
    }
}

/// Runtime applications that pass validation
pub(crate) fn valid_runtime(state: &DesiredState) -> Vec<&RuntimeDesiredState> {
    state
        .runtime
        .iter()
        .filter(|r| is_valid(&r.app))
        .collect()
}

/// Static sites whose application passes validation
pub(crate) fn valid_static_sites(state: &DesiredState) -> Vec<&StaticSite> {
    state
        .static_sites
        .iter()
        .filter(|s| is_valid(&s.application))
        .collect()
}

fn is_valid(app: &Application) -> bool {
    match app.validate() {
        Ok(()) => true,
        Err(e) => {
            warn!(app_id = %app.id, "Skipping invalid application: {}", e);
            false
        }
    }
}

const SHELL_OPERATORS: &[&str] = &["&&", "||", "|", ";", ">", "<", "&", "$(", "`"];

/// Split an entrypoint or command override into argv
///
/// Commands using shell syntax run through `sh -c`. An empty string means
/// no override.
pub fn parse_command(cmd: &str) -> Result<Option<Vec<String>>> {
    let cmd = cmd.trim();
    if cmd.is_empty() {
        return Ok(None);
    }
    if SHELL_OPERATORS.iter().any(|op| cmd.contains(op)) {
        return Ok(Some(vec![
            "sh".to_string(),
            "-c".to_string(),
            cmd.to_string(),
        ]));
    }
    shell_words::split(cmd)
        .map(Some)
        .map_err(|e| Error::ValidationError(format!("invalid command {:?}: {}", cmd, e)))
}

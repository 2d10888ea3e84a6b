//! Application containers on the Docker Engine

use std::collections::{BTreeMap, HashMap};

use async_trait::async_trait;
use bollard::errors::Error as DockerError;
use bollard::models::{
    ContainerCreateBody, ContainerState as DockerState, ContainerStateStatusEnum,
    EndpointSettings, HostConfig, NetworkingConfig, PortBinding, PortMap, RestartPolicy,
    RestartPolicyNameEnum,
};
use bollard::query_parameters::{
    CreateContainerOptions, CreateImageOptions, InspectContainerOptions, ListContainersOptions,
    RemoveContainerOptions, StartContainerOptions,
};
use bollard::Docker;
use futures::StreamExt;
use serde::Serialize;
use tracing::{debug, warn};

use crate::backend::{app_resource_name, parse_command, OwnershipLabels};
use crate::config::{ResourceRequirements, ResourceSpec};
use crate::domain::{ContainerState, PortPublication, RuntimeDesiredState};
use crate::error::{Error, Result};
use crate::reconcile::{ManagedResource, ResourceStore};

/// Desired container of one runtime application
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct ManagedContainer {
    pub name: String,
    pub image: String,
    pub labels: BTreeMap<String, String>,
    pub env: BTreeMap<String, String>,
    pub entrypoint: Option<Vec<String>>,
    pub cmd: Option<Vec<String>>,
    pub ports: Vec<PortPublication>,
    pub network: String,
    /// Started after creation when true
    pub running: bool,
    pub memory_bytes: Option<i64>,
    pub nano_cpus: Option<i64>,
}

impl ManagedResource for ManagedContainer {
    fn resource_name(&self) -> String {
        self.name.clone()
    }

    fn resource_labels(&self) -> BTreeMap<String, String> {
        self.labels.clone()
    }

    fn set_resource_labels(&mut self, labels: BTreeMap<String, String>) {
        self.labels = labels;
    }
}

impl ManagedContainer {
    /// Build the container for a runtime application
    ///
    /// The `updatedAt` label makes a changed timestamp recreate the container.
    pub fn from_state(
        rt: &RuntimeDesiredState,
        labels: &OwnershipLabels,
        label_namespace: &str,
        network: &str,
        resources: &ResourceRequirements,
    ) -> Result<Self> {
        let app = &rt.app;
        let mut container_labels = labels.app_labels(&app.id);
        container_labels.insert(
            format!("{}.updatedAt", label_namespace),
            app.updated_at.to_rfc3339(),
        );
        if app.scales_to_zero() {
            container_labels.insert("sablier.enable".to_string(), "true".to_string());
            container_labels.insert("sablier.group".to_string(), app.id.clone());
        }

        Ok(Self {
            name: app_resource_name(&app.id),
            image: rt.image(),
            labels: container_labels,
            env: rt.envs.clone(),
            entrypoint: parse_command(&app.config.entrypoint)?,
            cmd: parse_command(&app.config.command)?,
            ports: app.port_publications.clone(),
            network: network.to_string(),
            running: app.running,
            memory_bytes: limit_or_request(resources, |s| &s.memory)
                .map(parse_memory_bytes)
                .transpose()?,
            nano_cpus: limit_or_request(resources, |s| &s.cpu)
                .map(parse_nano_cpus)
                .transpose()?,
        })
    }

    fn create_body(&self) -> ContainerCreateBody {
        let (port_bindings, exposed_ports) = build_ports(&self.ports);
        let env: Vec<String> = self.env.iter().map(|(k, v)| format!("{k}={v}")).collect();

        ContainerCreateBody {
            image: Some(self.image.clone()),
            env: if env.is_empty() { None } else { Some(env) },
            entrypoint: self.entrypoint.clone(),
            cmd: self.cmd.clone(),
            labels: Some(self.labels.clone().into_iter().collect()),
            exposed_ports,
            host_config: Some(HostConfig {
                port_bindings,
                memory: self.memory_bytes,
                nano_cpus: self.nano_cpus,
                restart_policy: Some(RestartPolicy {
                    name: Some(RestartPolicyNameEnum::UNLESS_STOPPED),
                    maximum_retry_count: None,
                }),
                ..Default::default()
            }),
            networking_config: Some(NetworkingConfig {
                endpoints_config: Some(HashMap::from([(
                    self.network.clone(),
                    EndpointSettings::default(),
                )])),
            }),
            ..Default::default()
        }
    }
}

fn limit_or_request<'a>(
    resources: &'a ResourceRequirements,
    field: impl Fn(&'a ResourceSpec) -> &'a String,
) -> Option<&'a str> {
    let limit = field(&resources.limits);
    let value = if limit.is_empty() {
        field(&resources.requests)
    } else {
        limit
    };
    (!value.is_empty()).then_some(value.as_str())
}

/// Parse a Kubernetes memory quantity (`512Mi`, `1G`, `1048576`) into bytes
pub fn parse_memory_bytes(quantity: &str) -> Result<i64> {
    const SUFFIXES: &[(&str, i64)] = &[
        ("Ki", 1 << 10),
        ("Mi", 1 << 20),
        ("Gi", 1 << 30),
        ("Ti", 1 << 40),
        ("k", 1_000),
        ("K", 1_000),
        ("M", 1_000_000),
        ("G", 1_000_000_000),
        ("T", 1_000_000_000_000),
    ];
    let (number, multiplier) = SUFFIXES
        .iter()
        .find_map(|(suffix, m)| quantity.strip_suffix(suffix).map(|n| (n, *m)))
        .unwrap_or((quantity, 1));
    number
        .parse::<i64>()
        .ok()
        .filter(|n| *n > 0)
        .and_then(|n| n.checked_mul(multiplier))
        .ok_or_else(|| Error::ConfigError(format!("invalid memory quantity {:?}", quantity)))
}

/// Parse a CPU quantity (`500m`, `2`, `1.5`) into nano CPUs
pub fn parse_nano_cpus(quantity: &str) -> Result<i64> {
    let invalid = || Error::ConfigError(format!("invalid cpu quantity {:?}", quantity));
    if let Some(milli) = quantity.strip_suffix('m') {
        let milli: i64 = milli.parse().map_err(|_| invalid())?;
        if milli <= 0 {
            return Err(invalid());
        }
        return milli.checked_mul(1_000_000).ok_or_else(invalid);
    }
    let cores: f64 = quantity.parse().map_err(|_| invalid())?;
    let nanos = (cores * 1e9).round();
    if !nanos.is_finite() || nanos < 1.0 || nanos >= i64::MAX as f64 {
        return Err(invalid());
    }
    Ok(nanos as i64)
}

type ExposedPorts = HashMap<String, HashMap<(), ()>>;

fn build_ports(ports: &[PortPublication]) -> (Option<PortMap>, Option<ExposedPorts>) {
    if ports.is_empty() {
        return (None, None);
    }

    let mut port_bindings: PortMap = HashMap::new();
    let mut exposed_ports: ExposedPorts = HashMap::new();

    for publication in ports {
        let key = format!("{}/{}", publication.application_port, publication.protocol);
        exposed_ports.entry(key.clone()).or_default();

        let entry = port_bindings.entry(key).or_insert_with(|| Some(Vec::new()));
        if let Some(bindings) = entry.as_mut() {
            bindings.push(PortBinding {
                host_ip: None,
                host_port: Some(publication.internet_port.to_string()),
            });
        }
    }

    (Some(port_bindings), Some(exposed_ports))
}

/// Normalize a Docker container state
pub fn map_status(state: Option<&DockerState>) -> (ContainerState, Option<String>) {
    let Some(state) = state else {
        return (ContainerState::Unknown, None);
    };
    match state.status {
        Some(ContainerStateStatusEnum::RUNNING) => (ContainerState::Running, None),
        Some(ContainerStateStatusEnum::CREATED) => (ContainerState::Starting, None),
        Some(ContainerStateStatusEnum::RESTARTING) => (
            ContainerState::Errored,
            Some("restarting".to_string()),
        ),
        Some(ContainerStateStatusEnum::EXITED) => {
            let code = state.exit_code.unwrap_or_default();
            let detail = Some(format!("exit code {}", code));
            if code == 0 {
                (ContainerState::Exited, detail)
            } else {
                (ContainerState::Errored, detail)
            }
        }
        Some(ContainerStateStatusEnum::DEAD) => (ContainerState::Errored, state.error.clone()),
        Some(ContainerStateStatusEnum::PAUSED) | Some(ContainerStateStatusEnum::REMOVING) => {
            (ContainerState::Exited, None)
        }
        _ => (ContainerState::Unknown, None),
    }
}

pub(crate) fn is_not_found(err: &DockerError) -> bool {
    matches!(
        err,
        DockerError::DockerResponseServerError {
            status_code: 404,
            ..
        }
    )
}

pub(crate) fn is_not_modified(err: &DockerError) -> bool {
    matches!(
        err,
        DockerError::DockerResponseServerError {
            status_code: 304,
            ..
        }
    )
}

/// Containers carrying the engine's ownership label
pub struct DockerContainerStore {
    docker: Docker,
    labels: OwnershipLabels,
}

impl DockerContainerStore {
    pub fn new(docker: Docker, labels: OwnershipLabels) -> Self {
        Self { docker, labels }
    }

    pub(crate) async fn list_summaries(
        &self,
    ) -> Result<Vec<bollard::models::ContainerSummary>> {
        let filters = HashMap::from([(
            "label".to_string(),
            vec![self.labels.managed_selector()],
        )]);
        Ok(self
            .docker
            .list_containers(Some(ListContainersOptions {
                all: true,
                filters: Some(filters),
                ..Default::default()
            }))
            .await?)
    }

    /// Inspect one container; `None` when it does not exist
    pub(crate) async fn inspect(
        &self,
        name: &str,
    ) -> Result<Option<bollard::models::ContainerInspectResponse>> {
        match self
            .docker
            .inspect_container(name, None::<InspectContainerOptions>)
            .await
        {
            Ok(details) => Ok(Some(details)),
            Err(err) if is_not_found(&err) => Ok(None),
            Err(err) => Err(err.into()),
        }
    }

    async fn pull_image(&self, image: &str) -> Result<()> {
        let stream = self.docker.create_image(
            Some(CreateImageOptions {
                from_image: Some(image.to_string()),
                ..Default::default()
            }),
            None,
            None,
        );
        futures::pin_mut!(stream);
        while let Some(progress) = stream.next().await {
            progress?;
        }
        Ok(())
    }

    async fn remove(&self, name: &str) -> Result<()> {
        match self
            .docker
            .remove_container(
                name,
                Some(RemoveContainerOptions {
                    v: false,
                    force: true,
                    link: false,
                }),
            )
            .await
        {
            Ok(()) => Ok(()),
            Err(err) if is_not_found(&err) => Ok(()),
            Err(err) => Err(err.into()),
        }
    }
}

#[async_trait]
impl ResourceStore<ManagedContainer> for DockerContainerStore {
    fn kind(&self) -> &'static str {
        "Container"
    }

    /// Only name and labels are recovered; that is all the diff needs
    async fn list(&self) -> Result<Vec<ManagedContainer>> {
        let summaries = self.list_summaries().await?;
        Ok(summaries
            .into_iter()
            .filter_map(|summary| {
                let name = summary
                    .names
                    .as_ref()?
                    .first()?
                    .trim_start_matches('/')
                    .to_string();
                Some(ManagedContainer {
                    name,
                    image: summary.image.unwrap_or_default(),
                    labels: summary.labels.unwrap_or_default().into_iter().collect(),
                    env: BTreeMap::new(),
                    entrypoint: None,
                    cmd: None,
                    ports: Vec::new(),
                    network: String::new(),
                    running: false,
                    memory_bytes: None,
                    nano_cpus: None,
                })
            })
            .collect())
    }

    /// Replace the container: remove, pull, create, and start if wanted
    async fn apply(&self, container: &ManagedContainer) -> Result<()> {
        self.remove(&container.name).await?;
        if let Err(e) = self.pull_image(&container.image).await {
            // a locally built image may not exist in any registry
            warn!(image = %container.image, "Image pull failed: {}", e);
        }

        self.docker
            .create_container(
                Some(CreateContainerOptions {
                    name: Some(container.name.clone()),
                    platform: String::new(),
                }),
                container.create_body(),
            )
            .await?;

        if container.running {
            self.docker
                .start_container(&container.name, None::<StartContainerOptions>)
                .await?;
            debug!(name = %container.name, "Started container");
        }
        Ok(())
    }

    async fn delete(&self, name: &str) -> Result<()> {
        self.remove(name).await
    }
}

//! Docker Engine backend
//!
//! Each runtime application is one container on a shared network. Routing
//! is a single Traefik file-provider document rewritten on every
//! synchronization; certificates come from Traefik's ACME resolver.

pub mod containers;
mod events;
mod exec;
pub mod traefik;

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use bollard::query_parameters::{StartContainerOptions, StopContainerOptions};
use bollard::Docker;
use tokio::sync::{watch as shutdown, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, instrument, warn};

pub use containers::{map_status, DockerContainerStore, ManagedContainer};
pub use traefik::DynamicConfig;

use super::{
    app_resource_name, valid_runtime, valid_static_sites, Backend, ExecStreams, OwnershipLabels,
};
use crate::config::Config;
use crate::domain::{
    AvailableDomain, AvailablePort, Container, ContainerState, DesiredState, DesiredStateLeader,
    RuntimeDesiredState,
};
use crate::error::{Error, Result};
use crate::events::EventBus;
use crate::ingress::IngressResolver;
use crate::reconcile::{sync_resources, ResourceStore, SyncReport};
use containers::{is_not_found, is_not_modified};

pub struct DockerBackend {
    docker: Docker,
    config: Arc<Config>,
    labels: OwnershipLabels,
    resolver: IngressResolver,
    sync_lock: Mutex<()>,
    stop: shutdown::Sender<bool>,
    watcher: Mutex<Option<JoinHandle<()>>>,
}

impl DockerBackend {
    /// Connect to the local engine using the standard environment
    pub fn connect(config: Arc<Config>, bus: EventBus) -> Result<Self> {
        let docker = Docker::connect_with_defaults()?;
        Self::new(docker, config, bus)
    }

    /// Create the backend and start the event watcher
    pub fn new(docker: Docker, config: Arc<Config>, bus: EventBus) -> Result<Self> {
        let labels = OwnershipLabels::docker(&config.label_namespace);
        let resolver = IngressResolver::from_config(&config)?;
        let (stop, stop_rx) = shutdown::channel(false);

        let watcher = tokio::spawn(events::watch_events(
            docker.clone(),
            labels.managed_selector(),
            labels.app_id_key(),
            bus,
            stop_rx,
        ));

        Ok(Self {
            docker,
            config,
            labels,
            resolver,
            sync_lock: Mutex::new(()),
            stop,
            watcher: Mutex::new(Some(watcher)),
        })
    }

    fn store(&self) -> DockerContainerStore {
        DockerContainerStore::new(self.docker.clone(), self.labels.clone())
    }

    fn container_to_domain(
        app_id: &str,
        details: Option<bollard::models::ContainerInspectResponse>,
    ) -> Container {
        let Some(details) = details else {
            return Container::missing(app_id);
        };
        let (state, message) = map_status(details.state.as_ref());
        let container = Container::new(app_id, state);
        match message {
            Some(message) if state != ContainerState::Running => container.with_message(message),
            _ => container,
        }
    }
}

/// Containers of every runtime application that can be built
///
/// An application with an unusable command or resource quantity is skipped.
pub(crate) fn desired_containers(
    config: &Config,
    labels: &OwnershipLabels,
    runtime: &[&RuntimeDesiredState],
) -> Vec<ManagedContainer> {
    let mut next = Vec::with_capacity(runtime.len());
    for rt in runtime {
        match ManagedContainer::from_state(
            rt,
            labels,
            &config.label_namespace,
            &config.docker.network,
            &config.resources,
        ) {
            Ok(container) => next.push(container),
            Err(e) => warn!(app_id = %rt.app.id, "Skipping application: {}", e),
        }
    }
    next
}

/// Apply containers, then the Traefik document
///
/// Containers go first so routers never point at a missing backend. Returns
/// the container report and whether the document changed.
pub(crate) async fn converge(
    store: &dyn ResourceStore<ManagedContainer>,
    containers: Vec<ManagedContainer>,
    hash_label: &str,
    routes_path: &Path,
    dynamic: &DynamicConfig,
) -> Result<(SyncReport, bool)> {
    let report = sync_resources(store, containers, hash_label).await?;
    let changed =
        traefik::write_if_changed(routes_path, &serde_yaml::to_string(dynamic)?).await?;
    Ok((report, changed))
}

#[async_trait]
impl Backend for DockerBackend {
    #[instrument(skip(self, state), fields(network = %self.config.docker.network))]
    async fn synchronize(&self, state: &DesiredState) -> Result<SyncReport> {
        let _guard = self.sync_lock.lock().await;
        #[cfg(feature = "metrics")]
        let started = std::time::Instant::now();

        let runtime = valid_runtime(state);
        let static_sites = valid_static_sites(state);

        let next = desired_containers(&self.config, &self.labels, &runtime);
        let dynamic = traefik::render(&self.resolver, &self.config, &runtime, &static_sites);
        let path = self.config.docker.config_dir.join(traefik::CONFIG_FILE);
        let (report, changed) =
            converge(&self.store(), next, &self.labels.hash_key(), &path, &dynamic).await?;

        #[cfg(feature = "metrics")]
        crate::metrics::observe_reconcile_duration_seconds(
            "synchronize",
            started.elapsed().as_secs_f64(),
        );
        info!(
            applied = report.applied.len(),
            pruned = report.pruned.len(),
            failed = report.failed.len(),
            routes = dynamic.http.routers.len(),
            routes_changed = changed,
            "Synchronized Docker resources"
        );
        Ok(report)
    }

    /// Traefik's resolver issues certificates on demand
    async fn synchronize_shared(&self, _state: &DesiredStateLeader) -> Result<SyncReport> {
        debug!("No shared resources on Docker");
        Ok(SyncReport::default())
    }

    async fn get_container(&self, app_id: &str) -> Result<Container> {
        let details = self.store().inspect(&app_resource_name(app_id)).await?;
        Ok(Self::container_to_domain(app_id, details))
    }

    async fn list_containers(&self) -> Result<Vec<Container>> {
        let store = self.store();
        let app_id_key = self.labels.app_id_key();
        let mut result = Vec::new();
        for summary in store.list_summaries().await? {
            let Some(app_id) = summary.labels.as_ref().and_then(|l| l.get(&app_id_key)) else {
                continue;
            };
            // the container may vanish between list and inspect
            let details = store.inspect(&app_resource_name(app_id)).await?;
            result.push(Self::container_to_domain(app_id, details));
        }
        Ok(result)
    }

    #[instrument(skip(self))]
    async fn restart_container(&self, app_id: &str) -> Result<()> {
        let name = app_resource_name(app_id);
        let stopped = self
            .docker
            .stop_container(
                &name,
                Some(StopContainerOptions {
                    signal: None,
                    t: Some(self.config.docker.stop_grace_seconds),
                }),
            )
            .await;
        match stopped {
            Ok(()) => {}
            Err(err) if is_not_modified(&err) => debug!("Container was not running"),
            Err(err) if is_not_found(&err) => {
                return Err(Error::NotFound(format!("container of application {}", app_id)))
            }
            Err(err) => return Err(err.into()),
        }

        match self
            .docker
            .start_container(&name, None::<StartContainerOptions>)
            .await
        {
            Ok(()) => {}
            Err(err) if is_not_modified(&err) => {}
            Err(err) => return Err(err.into()),
        }
        info!("Restarted application container");
        Ok(())
    }

    #[instrument(skip(self, streams))]
    async fn exec_container(
        &self,
        app_id: &str,
        cmd: &[String],
        streams: ExecStreams,
    ) -> Result<()> {
        exec::exec_in_container(&self.docker, &app_resource_name(app_id), cmd, streams).await
    }

    async fn container_logs(&self, app_id: &str, tail: usize) -> Result<String> {
        exec::tail_logs(&self.docker, &app_resource_name(app_id), tail).await
    }

    fn available_domains(&self) -> &[AvailableDomain] {
        &self.config.domains
    }

    fn available_ports(&self) -> &[AvailablePort] {
        &self.config.ports
    }

    async fn dispose(&self) -> Result<()> {
        let _ = self.stop.send(true);
        if let Some(handle) = self.watcher.lock().await.take() {
            if let Err(e) = handle.await {
                warn!("Docker event watcher failed: {}", e);
            }
        }
        Ok(())
    }
}

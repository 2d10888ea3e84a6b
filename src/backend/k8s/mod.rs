//! Kubernetes backend
//!
//! Applications run as single-replica StatefulSets in one namespace and are
//! routed by Traefik `IngressRoute`s. Certificates come from cert-manager or
//! Traefik's ACME resolver.

pub mod crd;
mod exec;
pub mod store;
pub mod synth;
#[cfg(test)]
mod synth_test;
mod watch;

use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use k8s_openapi::api::apps::v1::StatefulSet;
use k8s_openapi::api::core::v1::{Pod, Secret, Service};
use kube::api::{Api, ListParams, Patch, PatchParams};
use kube::{Client, ResourceExt};
use serde_json::json;
use tokio::sync::{watch as shutdown, Mutex};
use tokio::task::JoinHandle;
use tracing::{info, instrument, warn};

pub use crd::{Certificate, IngressRoute, Middleware};
pub use store::{KubeStore, FIELD_MANAGER};
pub use synth::{NextResources, Synthesizer, APP_CONTAINER};
pub use watch::pod_state;

use super::{app_resource_name, valid_runtime, valid_static_sites, Backend, ExecStreams};
use crate::config::Config;
use crate::domain::{
    AvailableDomain, AvailablePort, Container, ContainerState, DesiredState, DesiredStateLeader,
};
use crate::error::{Error, Result};
use crate::events::EventBus;
use crate::reconcile::{sync_resources, ResourceStore, SyncReport};

pub struct K8sBackend {
    client: Client,
    config: Arc<Config>,
    synth: Synthesizer,
    sync_lock: Mutex<()>,
    stop: shutdown::Sender<bool>,
    watcher: Mutex<Option<JoinHandle<()>>>,
}

impl K8sBackend {
    /// Create the backend and start the pod watcher
    pub fn new(client: Client, config: Arc<Config>, bus: EventBus) -> Result<Self> {
        let synth = Synthesizer::new(&config)?;
        let (stop, stop_rx) = shutdown::channel(false);

        let watcher = tokio::spawn(watch::watch_pods(
            Api::namespaced(client.clone(), &config.kubernetes.namespace),
            synth.labels().managed_selector(),
            synth.labels().app_id_key(),
            APP_CONTAINER,
            bus,
            stop_rx,
        ));

        Ok(Self {
            client,
            config,
            synth,
            sync_lock: Mutex::new(()),
            stop,
            watcher: Mutex::new(Some(watcher)),
        })
    }

    fn namespace(&self) -> &str {
        &self.config.kubernetes.namespace
    }

    fn api<K>(&self) -> Api<K>
    where
        K: kube::Resource<Scope = k8s_openapi::NamespaceResourceScope>,
        K::DynamicType: Default,
    {
        Api::namespaced(self.client.clone(), self.namespace())
    }

    fn store<K>(&self, kind: &'static str) -> KubeStore<K>
    where
        K: kube::Resource<Scope = k8s_openapi::NamespaceResourceScope>,
        K::DynamicType: Default,
    {
        KubeStore::new(self.api(), self.synth.labels().managed_selector(), kind)
    }

    /// Name of the single pod of an application's StatefulSet
    fn pod_name(app_id: &str) -> String {
        format!("{}-0", app_resource_name(app_id))
    }
}

/// Stores of the per-application kinds
pub(crate) struct AppStores<'a> {
    pub stateful_sets: &'a dyn ResourceStore<StatefulSet>,
    pub secrets: &'a dyn ResourceStore<Secret>,
    pub services: &'a dyn ResourceStore<Service>,
    pub middlewares: &'a dyn ResourceStore<Middleware>,
    pub ingress_routes: &'a dyn ResourceStore<IngressRoute>,
}

/// Reconcile every kind of `next` in dependency order
///
/// Workloads come first and routing rules last, so a router is never
/// applied before the service it points at.
pub(crate) async fn sync_next(
    stores: &AppStores<'_>,
    next: NextResources,
    hash_label: &str,
) -> Result<SyncReport> {
    #[cfg(feature = "metrics")]
    let started = std::time::Instant::now();

    let mut report = SyncReport::default();
    report.merge(sync_resources(stores.stateful_sets, next.stateful_sets, hash_label).await?);
    report.merge(sync_resources(stores.secrets, next.secrets, hash_label).await?);
    report.merge(sync_resources(stores.services, next.services, hash_label).await?);
    report.merge(sync_resources(stores.middlewares, next.middlewares, hash_label).await?);
    report.merge(sync_resources(stores.ingress_routes, next.ingress_routes, hash_label).await?);

    #[cfg(feature = "metrics")]
    crate::metrics::observe_reconcile_duration_seconds(
        "synchronize",
        started.elapsed().as_secs_f64(),
    );
    Ok(report)
}

/// Reconcile the shared certificates
pub(crate) async fn sync_shared(
    store: &dyn ResourceStore<Certificate>,
    certificates: Vec<Certificate>,
    hash_label: &str,
) -> Result<SyncReport> {
    #[cfg(feature = "metrics")]
    let started = std::time::Instant::now();

    let report = sync_resources(store, certificates, hash_label).await?;

    #[cfg(feature = "metrics")]
    crate::metrics::observe_reconcile_duration_seconds(
        "synchronize_shared",
        started.elapsed().as_secs_f64(),
    );
    Ok(report)
}

#[async_trait]
impl Backend for K8sBackend {
    #[instrument(skip(self, state), fields(namespace = %self.namespace()))]
    async fn synchronize(&self, state: &DesiredState) -> Result<SyncReport> {
        let _guard = self.sync_lock.lock().await;

        let next = self
            .synth
            .synthesize(&valid_runtime(state), &valid_static_sites(state))?;
        let stateful_sets = self.store::<StatefulSet>("StatefulSet");
        let secrets = self.store::<Secret>("Secret");
        let services = self.store::<Service>("Service");
        let middlewares = self.store::<Middleware>("Middleware");
        let ingress_routes = self.store::<IngressRoute>("IngressRoute");
        let stores = AppStores {
            stateful_sets: &stateful_sets,
            secrets: &secrets,
            services: &services,
            middlewares: &middlewares,
            ingress_routes: &ingress_routes,
        };
        let report = sync_next(&stores, next, &self.synth.labels().hash_key()).await?;
        info!(
            applied = report.applied.len(),
            pruned = report.pruned.len(),
            failed = report.failed.len(),
            "Synchronized Kubernetes resources"
        );
        Ok(report)
    }

    #[instrument(skip(self, state), fields(namespace = %self.namespace()))]
    async fn synchronize_shared(&self, state: &DesiredStateLeader) -> Result<SyncReport> {
        let _guard = self.sync_lock.lock().await;
        let certificates = self.synth.certificates(state);
        let store = KubeStore::<Certificate>::new(
            self.api(),
            self.synth.labels().shared_selector(),
            "Certificate",
        );
        let report = sync_shared(&store, certificates, &self.synth.labels().hash_key()).await?;
        info!(
            applied = report.applied.len(),
            pruned = report.pruned.len(),
            "Synchronized shared certificates"
        );
        Ok(report)
    }

    async fn get_container(&self, app_id: &str) -> Result<Container> {
        let pods: Api<Pod> = self.api();
        let selector = format!("{}={}", self.synth.labels().app_id_key(), app_id);
        let list = pods.list(&ListParams::default().labels(&selector)).await?;
        Ok(match list.items.first() {
            Some(pod) => to_container(app_id, pod),
            None => Container::missing(app_id),
        })
    }

    async fn list_containers(&self) -> Result<Vec<Container>> {
        let pods: Api<Pod> = self.api();
        let app_id_key = self.synth.labels().app_id_key();
        let list = pods
            .list(&ListParams::default().labels(&self.synth.labels().managed_selector()))
            .await?;
        Ok(list
            .items
            .iter()
            .filter_map(|pod| {
                let app_id = pod.labels().get(&app_id_key)?;
                Some(to_container(app_id, pod))
            })
            .collect())
    }

    /// Roll the StatefulSet by bumping the restart annotation
    #[instrument(skip(self))]
    async fn restart_container(&self, app_id: &str) -> Result<()> {
        let api: Api<StatefulSet> = self.api();
        let annotation = self.synth.restart_annotation();
        let patch = json!({
            "spec": {
                "template": {
                    "metadata": {
                        "annotations": { annotation: Utc::now().to_rfc3339() }
                    }
                }
            }
        });
        match api
            .patch(
                &app_resource_name(app_id),
                &PatchParams::default(),
                &Patch::Merge(&patch),
            )
            .await
        {
            Ok(_) => {
                info!("Restarted application workload");
                Ok(())
            }
            Err(kube::Error::Api(e)) if e.code == 404 => {
                Err(Error::NotFound(format!("workload of application {}", app_id)))
            }
            Err(e) => Err(Error::KubeError(e)),
        }
    }

    #[instrument(skip(self, streams))]
    async fn exec_container(
        &self,
        app_id: &str,
        cmd: &[String],
        streams: ExecStreams,
    ) -> Result<()> {
        exec::exec_in_pod(
            &self.api(),
            &Self::pod_name(app_id),
            APP_CONTAINER,
            cmd,
            streams,
        )
        .await
    }

    async fn container_logs(&self, app_id: &str, tail: usize) -> Result<String> {
        exec::tail_logs(&self.api(), &Self::pod_name(app_id), APP_CONTAINER, tail).await
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
                warn!("Pod watcher task failed: {}", e);
            }
        }
        Ok(())
    }
}

fn to_container(app_id: &str, pod: &Pod) -> Container {
    let (state, message) = pod_state(pod, APP_CONTAINER);
    let container = Container::new(app_id, state);
    match message {
        Some(message) if state != ContainerState::Running => container.with_message(message),
        _ => container,
    }
}

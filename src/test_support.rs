//! Fixtures shared by unit tests

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{TimeZone, Utc};

use crate::backend::{Backend, ExecStreams};
use crate::domain::{
    Application, ApplicationConfig, AuthenticationType, AvailableDomain, AvailablePort,
    BuildConfig, Container, ContainerState, DeployType, DesiredState, DesiredStateLeader,
    PortProtocol, PortPublication, RuntimeDesiredState, StaticSite, Website,
};
use crate::error::{Error, Result};
use crate::reconcile::{ManagedResource, ResourceStore, SyncReport};

pub(crate) fn website(id: &str, fqdn: &str, path: &str) -> Website {
    Website {
        id: id.to_string(),
        fqdn: fqdn.to_string(),
        path_prefix: path.to_string(),
        strip_prefix: false,
        https: false,
        h2c: false,
        http_port: 8080,
        authentication: AuthenticationType::Off,
    }
}

pub(crate) fn https_website(id: &str, fqdn: &str, path: &str) -> Website {
    Website {
        https: true,
        ..website(id, fqdn, path)
    }
}

pub(crate) fn runtime_app(id: &str, websites: Vec<Website>) -> Application {
    Application {
        id: id.to_string(),
        name: format!("app-{}", id),
        deploy_type: DeployType::Runtime,
        running: true,
        container: ContainerState::Unknown,
        websites,
        port_publications: vec![],
        config: ApplicationConfig {
            build: BuildConfig::RuntimeBuildpack {
                context: ".".to_string(),
            },
            entrypoint: String::new(),
            command: String::new(),
            auto_shutdown: Default::default(),
        },
        owner_ids: vec!["owner-1".to_string()],
        updated_at: Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap(),
    }
}

pub(crate) fn static_app(id: &str, websites: Vec<Website>) -> Application {
    let mut app = runtime_app(id, websites);
    app.deploy_type = DeployType::Static;
    app.config.build = BuildConfig::StaticBuildpack {
        context: ".".to_string(),
        artifact_path: "dist".to_string(),
    };
    app
}

pub(crate) fn tcp_port(internet: u16, app: u16) -> PortPublication {
    PortPublication {
        internet_port: internet,
        application_port: app,
        protocol: PortProtocol::Tcp,
    }
}

pub(crate) fn runtime_state(app: Application) -> RuntimeDesiredState {
    let mut envs = BTreeMap::new();
    envs.insert("PORT".to_string(), "8080".to_string());
    RuntimeDesiredState {
        app,
        image_name: "registry.local/showcase/app".to_string(),
        image_tag: "abc123".to_string(),
        envs,
    }
}

/// Two runtime apps and one static site
pub(crate) fn sample_state() -> DesiredState {
    let api = runtime_app(
        "app1",
        vec![https_website("w1", "api.apps.example.com", "/")],
    );
    let mut web = runtime_app("app2", vec![website("w2", "web.example.com", "/v1")]);
    web.websites[0].strip_prefix = true;
    web.port_publications.push(tcp_port(30022, 22));
    let docs = static_app("app3", vec![https_website("w3", "docs.apps.example.com", "/")]);
    DesiredState {
        runtime: vec![runtime_state(api), runtime_state(web)],
        static_sites: vec![StaticSite {
            website: docs.websites[0].clone(),
            application: docs,
            artifact_id: "artifact-1".to_string(),
        }],
    }
}

/// Backend with one optional container state that records exec calls
#[derive(Default)]
pub(crate) struct FakeBackend {
    pub state: Option<ContainerState>,
    pub execs: Mutex<Vec<(String, Vec<String>)>>,
    pub restarts: Mutex<Vec<String>>,
}

#[async_trait]
impl Backend for FakeBackend {
    async fn synchronize(&self, _state: &DesiredState) -> Result<SyncReport> {
        Ok(SyncReport::default())
    }

    async fn synchronize_shared(&self, _state: &DesiredStateLeader) -> Result<SyncReport> {
        Ok(SyncReport::default())
    }

    async fn get_container(&self, app_id: &str) -> Result<Container> {
        Ok(match self.state {
            Some(state) => Container::new(app_id, state),
            None => Container::missing(app_id),
        })
    }

    async fn list_containers(&self) -> Result<Vec<Container>> {
        Ok(match self.state {
            Some(state) => vec![Container::new("a1", state)],
            None => vec![],
        })
    }

    async fn restart_container(&self, app_id: &str) -> Result<()> {
        if self.state.is_none() {
            return Err(Error::NotFound(format!("container of application {}", app_id)));
        }
        self.restarts.lock().unwrap().push(app_id.to_string());
        Ok(())
    }

    async fn exec_container(
        &self,
        app_id: &str,
        cmd: &[String],
        _streams: ExecStreams,
    ) -> Result<()> {
        self.execs
            .lock()
            .unwrap()
            .push((app_id.to_string(), cmd.to_vec()));
        Ok(())
    }

    async fn container_logs(&self, app_id: &str, tail: usize) -> Result<String> {
        Ok(format!("{} last {} lines\n", app_id, tail))
    }

    fn available_domains(&self) -> &[AvailableDomain] {
        &[]
    }

    fn available_ports(&self) -> &[AvailablePort] {
        &[]
    }

    async fn dispose(&self) -> Result<()> {
        Ok(())
    }
}

/// In-memory [`ResourceStore`] of one kind
///
/// Stores sharing a `log` record applies as `Kind/name` in call order.
pub(crate) struct MemoryStore<T> {
    kind: &'static str,
    pub items: Mutex<BTreeMap<String, T>>,
    pub log: Arc<Mutex<Vec<String>>>,
}

impl<T> MemoryStore<T> {
    pub fn new(kind: &'static str) -> Self {
        Self::with_log(kind, Arc::default())
    }

    pub fn with_log(kind: &'static str, log: Arc<Mutex<Vec<String>>>) -> Self {
        Self {
            kind,
            items: Mutex::new(BTreeMap::new()),
            log,
        }
    }

    pub fn applied(&self) -> Vec<String> {
        self.log.lock().unwrap().clone()
    }

    pub fn len(&self) -> usize {
        self.items.lock().unwrap().len()
    }
}

#[async_trait]
impl<T: ManagedResource + 'static> ResourceStore<T> for MemoryStore<T> {
    fn kind(&self) -> &'static str {
        self.kind
    }

    async fn list(&self) -> Result<Vec<T>> {
        Ok(self.items.lock().unwrap().values().cloned().collect())
    }

    async fn apply(&self, resource: &T) -> Result<()> {
        let name = resource.resource_name();
        self.log
            .lock()
            .unwrap()
            .push(format!("{}/{}", self.kind, name));
        self.items.lock().unwrap().insert(name, resource.clone());
        Ok(())
    }

    async fn delete(&self, name: &str) -> Result<()> {
        self.items.lock().unwrap().remove(name);
        Ok(())
    }
}

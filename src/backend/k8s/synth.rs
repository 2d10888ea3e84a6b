//! Kubernetes resource synthesis
//!
//! Pure builders from a [`DesiredState`] to the objects the reconciler
//! applies. Nothing here talks to the API server.

use std::collections::{BTreeMap, BTreeSet};

use k8s_openapi::api::apps::v1::{StatefulSet, StatefulSetSpec};
use k8s_openapi::api::core::v1::{
    Container, ContainerPort, EnvFromSource, LocalObjectReference, PodSpec, PodTemplateSpec,
    ResourceRequirements as K8sResources, Secret, SecretEnvSource, Service, ServicePort,
    ServiceSpec,
};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, ObjectMeta};
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use k8s_openapi::ByteString;
use tracing::warn;

use super::crd::{
    Certificate, CertificateIssuerRef, CertificateSpec, IngressRoute, IngressRouteSpec,
    IngressRouteTls, Middleware, MiddlewareReference, MiddlewareSpec, RouteRule,
    ServiceReference, TlsDomain,
};
use crate::backend::{app_resource_name, parse_command, website_resource_name, OwnershipLabels};
use crate::config::{
    CertificateSource, Config, ResourceRequirements, SchedulingConfig, StaticServerConfig,
    TlsConfig,
};
use crate::domain::{
    Application, DesiredStateLeader, PortPublication, RuntimeDesiredState, StaticSite, Website,
};
use crate::error::Result;
use crate::ingress::{certificate_name, IngressResolver, Route, RouteMiddleware, RouteTls};
use crate::placement::placement;

/// Name of the application container inside the pod
pub const APP_CONTAINER: &str = "app";

/// Port every website Service exposes
const SERVICE_PORT: i32 = 80;

/// Objects of one synchronize pass, grouped by kind
#[derive(Clone, Debug, Default)]
pub struct NextResources {
    pub stateful_sets: Vec<StatefulSet>,
    pub secrets: Vec<Secret>,
    pub services: Vec<Service>,
    pub middlewares: Vec<Middleware>,
    pub ingress_routes: Vec<IngressRoute>,
}

#[derive(Clone, Debug)]
pub struct Synthesizer {
    namespace: String,
    labels: OwnershipLabels,
    label_namespace: String,
    resolver: IngressResolver,
    resources: ResourceRequirements,
    scheduling: SchedulingConfig,
    static_server: StaticServerConfig,
    tls: TlsConfig,
    image_pull_secret: Option<String>,
}

impl Synthesizer {
    pub fn new(config: &Config) -> Result<Self> {
        Ok(Self {
            namespace: config.kubernetes.namespace.clone(),
            labels: OwnershipLabels::kubernetes(&config.label_namespace),
            label_namespace: config.label_namespace.clone(),
            resolver: IngressResolver::from_config(config)?,
            resources: config.resources.clone(),
            scheduling: config.scheduling.clone(),
            static_server: config.static_server.clone(),
            tls: config.tls.clone(),
            image_pull_secret: config.kubernetes.image_pull_secret.clone(),
        })
    }

    pub fn labels(&self) -> &OwnershipLabels {
        &self.labels
    }

    /// Pod template annotation whose change rolls the workload
    pub fn restart_annotation(&self) -> String {
        format!("{}/restarted-at", self.label_namespace)
    }

    /// Build every per-application resource for valid applications
    ///
    /// An application whose command cannot be parsed is skipped with a
    /// warning, the others are still synthesized.
    pub fn synthesize(
        &self,
        runtime: &[&RuntimeDesiredState],
        static_sites: &[&StaticSite],
    ) -> Result<NextResources> {
        let mut next = NextResources::default();
        let mut middlewares = BTreeMap::new();

        for rt in runtime {
            let app = &rt.app;
            let stateful_set = match self.stateful_set(rt) {
                Ok(sts) => sts,
                Err(e) => {
                    warn!(app_id = %app.id, "Skipping application: {}", e);
                    continue;
                }
            };
            next.stateful_sets.push(stateful_set);
            next.secrets.push(self.env_secret(rt));
            next.services.push(self.headless_service(app));
            if let Some(ports) = self.port_service(app) {
                next.services.push(ports);
            }
            for website in &app.websites {
                next.services.push(self.website_service(app, website));
                let route = self.resolver.resolve(app, website);
                self.route(app, website, route, &mut next, &mut middlewares)?;
            }
        }

        for site in static_sites {
            next.services
                .push(self.static_service(&site.application, &site.website));
            let route = self.resolver.resolve_static(site);
            self.route(
                &site.application,
                &site.website,
                route,
                &mut next,
                &mut middlewares,
            )?;
        }

        next.middlewares = middlewares.into_values().collect();
        Ok(next)
    }

    fn meta(&self, name: String, labels: BTreeMap<String, String>) -> ObjectMeta {
        ObjectMeta {
            name: Some(name),
            namespace: Some(self.namespace.clone()),
            labels: Some(labels),
            ..Default::default()
        }
    }

    fn stateful_set(&self, rt: &RuntimeDesiredState) -> Result<StatefulSet> {
        let app = &rt.app;
        let name = app_resource_name(&app.id);
        let selector = self.labels.app_labels(&app.id);

        let mut labels = selector.clone();
        if app.scales_to_zero() {
            labels.insert("sablier.enable".to_string(), "true".to_string());
            labels.insert("sablier.group".to_string(), app.id.clone());
        }

        let annotations = BTreeMap::from([(
            self.restart_annotation(),
            app.updated_at.to_rfc3339(),
        )]);

        let placement = placement(&app.id, &self.scheduling, &selector);

        let container = Container {
            name: APP_CONTAINER.to_string(),
            image: Some(rt.image()),
            command: parse_command(&app.config.entrypoint)?,
            args: parse_command(&app.config.command)?,
            env_from: Some(vec![EnvFromSource {
                secret_ref: Some(SecretEnvSource {
                    name: Some(name.clone()),
                    optional: None,
                }),
                ..Default::default()
            }]),
            ports: container_ports(app),
            resources: build_resources(&self.resources),
            ..Default::default()
        };

        Ok(StatefulSet {
            metadata: self.meta(name.clone(), labels.clone()),
            spec: Some(StatefulSetSpec {
                replicas: Some(if app.running { 1 } else { 0 }),
                selector: LabelSelector {
                    match_labels: Some(selector),
                    ..Default::default()
                },
                service_name: name,
                template: PodTemplateSpec {
                    metadata: Some(ObjectMeta {
                        labels: Some(labels),
                        annotations: Some(annotations),
                        ..Default::default()
                    }),
                    spec: Some(PodSpec {
                        containers: vec![container],
                        enable_service_links: Some(false),
                        image_pull_secrets: self.image_pull_secret.as_ref().map(|name| {
                            vec![LocalObjectReference {
                                name: Some(name.clone()),
                            }]
                        }),
                        node_selector: placement.node_selector,
                        tolerations: non_empty(placement.tolerations),
                        topology_spread_constraints: non_empty(
                            placement.topology_spread_constraints,
                        ),
                        ..Default::default()
                    }),
                },
                ..Default::default()
            }),
            status: None,
        })
    }

    fn env_secret(&self, rt: &RuntimeDesiredState) -> Secret {
        let data = rt
            .envs
            .iter()
            .map(|(k, v)| (k.clone(), ByteString(v.as_bytes().to_vec())))
            .collect();
        Secret {
            metadata: self.meta(
                app_resource_name(&rt.app.id),
                self.labels.app_labels(&rt.app.id),
            ),
            data: Some(data),
            ..Default::default()
        }
    }

    /// Governing service of the StatefulSet
    fn headless_service(&self, app: &Application) -> Service {
        Service {
            metadata: self.meta(app_resource_name(&app.id), self.labels.app_labels(&app.id)),
            spec: Some(ServiceSpec {
                cluster_ip: Some("None".to_string()),
                selector: Some(self.labels.app_labels(&app.id)),
                ..Default::default()
            }),
            status: None,
        }
    }

    /// NodePort service publishing the application's ports
    fn port_service(&self, app: &Application) -> Option<Service> {
        if app.port_publications.is_empty() {
            return None;
        }
        let ports = app.port_publications.iter().map(node_port).collect();
        Some(Service {
            metadata: self.meta(
                format!("{}-ports", app_resource_name(&app.id)),
                self.labels.app_labels(&app.id),
            ),
            spec: Some(ServiceSpec {
                type_: Some("NodePort".to_string()),
                selector: Some(self.labels.app_labels(&app.id)),
                ports: Some(ports),
                ..Default::default()
            }),
            status: None,
        })
    }

    fn website_service(&self, app: &Application, website: &Website) -> Service {
        self.service_for(
            app,
            website,
            self.labels.app_labels(&app.id),
            i32::from(website.http_port),
        )
    }

    /// Service routing a static website to the shared static server
    fn static_service(&self, app: &Application, website: &Website) -> Service {
        self.service_for(
            app,
            website,
            self.static_server.selector.clone(),
            i32::from(self.static_server.port),
        )
    }

    fn service_for(
        &self,
        app: &Application,
        website: &Website,
        selector: BTreeMap<String, String>,
        target_port: i32,
    ) -> Service {
        Service {
            metadata: self.meta(
                website_resource_name(&website.id),
                self.labels.app_labels(&app.id),
            ),
            spec: Some(ServiceSpec {
                type_: Some("ClusterIP".to_string()),
                selector: Some(selector),
                ports: Some(vec![ServicePort {
                    name: Some("http".to_string()),
                    protocol: Some("TCP".to_string()),
                    port: SERVICE_PORT,
                    target_port: Some(IntOrString::Int(target_port)),
                    ..Default::default()
                }]),
                ..Default::default()
            }),
            status: None,
        }
    }

    fn route(
        &self,
        app: &Application,
        website: &Website,
        route: Route,
        next: &mut NextResources,
        middlewares: &mut BTreeMap<String, Middleware>,
    ) -> Result<()> {

        let mut refs = Vec::with_capacity(route.middlewares.len());
        for mw in &route.middlewares {
            if let RouteMiddleware::External(external) = mw {
                refs.push(MiddlewareReference {
                    name: external.name.clone(),
                    namespace: external.namespace.clone(),
                });
                continue;
            }
            refs.push(MiddlewareReference {
                name: mw.name().to_string(),
                namespace: None,
            });
            if let Some(spec) = mw.spec() {
                let spec: MiddlewareSpec = serde_json::from_value(spec)?;
                let mut middleware = Middleware::new(mw.name(), spec);
                middleware.metadata =
                    self.meta(mw.name().to_string(), self.labels.app_labels(&app.id));
                middlewares.insert(mw.name().to_string(), middleware);
            }
        }

        let tls = route.tls.map(|tls| match tls {
            RouteTls::Secret { secret_name, .. } => IngressRouteTls {
                secret_name: Some(secret_name),
                ..Default::default()
            },
            RouteTls::Resolver {
                domain,
                cert_resolver,
            } => IngressRouteTls {
                cert_resolver: Some(cert_resolver),
                domains: vec![TlsDomain {
                    main: domain,
                    sans: Vec::new(),
                }],
                ..Default::default()
            },
        });

        let mut ingress_route = IngressRoute::new(
            &route.name,
            IngressRouteSpec {
                entry_points: vec![route.entrypoint],
                routes: vec![RouteRule {
                    kind: "Rule".to_string(),
                    match_rule: route.rule,
                    priority: route.priority,
                    middlewares: refs,
                    services: vec![ServiceReference {
                        name: website_resource_name(&website.id),
                        port: SERVICE_PORT,
                        scheme: Some(website.backend_scheme().to_string()),
                    }],
                }],
                tls,
            },
        );
        ingress_route.metadata = self.meta(route.name, self.labels.app_labels(&app.id));
        next.ingress_routes.push(ingress_route);
        Ok(())
    }

    /// One certificate per distinct TLS target domain
    ///
    /// Empty unless certificates come from cert-manager.
    pub fn certificates(&self, state: &DesiredStateLeader) -> Vec<Certificate> {
        if self.tls.source != CertificateSource::CertManager {
            return Vec::new();
        }
        let targets: BTreeSet<String> = state
            .https_websites()
            .filter(|w| w.validate().is_ok())
            .map(|w| self.resolver.tls_target_domain(&w.fqdn))
            .collect();

        targets
            .into_iter()
            .map(|domain| {
                let name = certificate_name(&domain);
                let mut cert = Certificate::new(
                    &name,
                    CertificateSpec {
                        secret_name: name.clone(),
                        dns_names: vec![domain],
                        issuer_ref: CertificateIssuerRef {
                            name: self.tls.issuer.name.clone(),
                            kind: self.tls.issuer.kind.clone(),
                            group: Some("cert-manager.io".to_string()),
                        },
                    },
                );
                cert.metadata = self.meta(name, self.labels.shared_labels());
                cert
            })
            .collect()
    }
}

fn non_empty<T>(items: Vec<T>) -> Option<Vec<T>> {
    if items.is_empty() {
        None
    } else {
        Some(items)
    }
}

fn container_ports(app: &Application) -> Option<Vec<ContainerPort>> {
    let mut seen = BTreeSet::new();
    let mut ports = Vec::new();
    for website in &app.websites {
        if seen.insert((website.http_port, "TCP")) {
            ports.push(ContainerPort {
                container_port: i32::from(website.http_port),
                protocol: Some("TCP".to_string()),
                ..Default::default()
            });
        }
    }
    for publication in &app.port_publications {
        let protocol = protocol_name(publication);
        if seen.insert((publication.application_port, protocol)) {
            ports.push(ContainerPort {
                container_port: i32::from(publication.application_port),
                protocol: Some(protocol.to_string()),
                ..Default::default()
            });
        }
    }
    non_empty(ports)
}

fn protocol_name(publication: &PortPublication) -> &'static str {
    match publication.protocol {
        crate::domain::PortProtocol::Tcp => "TCP",
        crate::domain::PortProtocol::Udp => "UDP",
    }
}

fn node_port(publication: &PortPublication) -> ServicePort {
    ServicePort {
        name: Some(format!(
            "{}-{}",
            publication.protocol, publication.internet_port
        )),
        protocol: Some(protocol_name(publication).to_string()),
        port: i32::from(publication.internet_port),
        node_port: Some(i32::from(publication.internet_port)),
        target_port: Some(IntOrString::Int(i32::from(publication.application_port))),
        ..Default::default()
    }
}

fn build_resources(resources: &ResourceRequirements) -> Option<K8sResources> {
    fn quantities(spec: &crate::config::ResourceSpec) -> Option<BTreeMap<String, Quantity>> {
        let mut map = BTreeMap::new();
        if !spec.cpu.is_empty() {
            map.insert("cpu".to_string(), Quantity(spec.cpu.clone()));
        }
        if !spec.memory.is_empty() {
            map.insert("memory".to_string(), Quantity(spec.memory.clone()));
        }
        non_empty_map(map)
    }

    if resources.requests.is_empty() && resources.limits.is_empty() {
        return None;
    }
    Some(K8sResources {
        requests: quantities(&resources.requests),
        limits: quantities(&resources.limits),
        ..Default::default()
    })
}

fn non_empty_map<K, V>(map: BTreeMap<K, V>) -> Option<BTreeMap<K, V>> {
    if map.is_empty() {
        None
    } else {
        Some(map)
    }
}

//! Traefik file-provider configuration for the Docker backend

use std::collections::BTreeMap;
use std::io::ErrorKind;
use std::path::Path;

use serde::Serialize;
use serde_json::Value;
use tracing::debug;

use crate::backend::app_resource_name;
use crate::config::Config;
use crate::domain::{RuntimeDesiredState, StaticSite};
use crate::error::Result;
use crate::ingress::{IngressResolver, Route, RouteTls};

/// File the dynamic configuration is written to inside the config directory
pub const CONFIG_FILE: &str = "nsapp.yaml";

/// Root of a Traefik dynamic configuration file
#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct DynamicConfig {
    pub http: HttpConfig,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct HttpConfig {
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub routers: BTreeMap<String, Router>,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub middlewares: BTreeMap<String, Value>,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub services: BTreeMap<String, LoadBalancerService>,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Router {
    pub entry_points: Vec<String>,
    pub rule: String,
    pub priority: i64,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub middlewares: Vec<String>,
    pub service: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tls: Option<RouterTls>,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RouterTls {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cert_resolver: Option<String>,
    pub domains: Vec<TlsDomain>,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct TlsDomain {
    pub main: String,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LoadBalancerService {
    pub load_balancer: LoadBalancer,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct LoadBalancer {
    pub servers: Vec<Server>,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct Server {
    pub url: String,
}

/// Render routers, middlewares and services for every website
pub fn render(
    resolver: &IngressResolver,
    config: &Config,
    runtime: &[&RuntimeDesiredState],
    static_sites: &[&StaticSite],
) -> DynamicConfig {
    let mut dynamic = DynamicConfig::default();

    for rt in runtime {
        for website in &rt.app.websites {
            let url = format!(
                "{}://{}:{}",
                website.backend_scheme(),
                app_resource_name(&rt.app.id),
                website.http_port
            );
            add_website(&mut dynamic.http, resolver.resolve(&rt.app, website), url);
        }
    }
    for site in static_sites {
        add_website(
            &mut dynamic.http,
            resolver.resolve_static(site),
            config.static_server.url.clone(),
        );
    }

    dynamic
}

fn add_website(http: &mut HttpConfig, route: Route, url: String) {
    let Route {
        name,
        entrypoint,
        rule,
        priority,
        middlewares,
        tls,
    } = route;

    for middleware in &middlewares {
        if let Some(spec) = middleware.spec() {
            http.middlewares.insert(middleware.name().to_string(), spec);
        }
    }

    http.services.insert(
        name.clone(),
        LoadBalancerService {
            load_balancer: LoadBalancer {
                servers: vec![Server { url }],
            },
        },
    );
    http.routers.insert(
        name.clone(),
        Router {
            entry_points: vec![entrypoint],
            rule,
            priority,
            middlewares: middlewares.iter().map(|m| m.name().to_string()).collect(),
            service: name,
            tls: tls.map(|tls| RouterTls {
                domains: vec![TlsDomain {
                    main: tls.domain().to_string(),
                }],
                cert_resolver: match tls {
                    RouteTls::Resolver { cert_resolver, .. } => Some(cert_resolver),
                    RouteTls::Secret { .. } => None,
                },
            }),
        },
    );
}

/// Write `contents` to `path` unless it already holds exactly that
///
/// The file is replaced through a rename so Traefik never reads a partial
/// document. Returns whether the file changed.
pub async fn write_if_changed(path: &Path, contents: &str) -> Result<bool> {
    match tokio::fs::read_to_string(path).await {
        Ok(current) if current == contents => {
            debug!(path = %path.display(), "Traefik configuration unchanged");
            return Ok(false);
        }
        Ok(_) => {}
        Err(e) if e.kind() == ErrorKind::NotFound => {}
        Err(e) => return Err(e.into()),
    }

    if let Some(dir) = path.parent() {
        tokio::fs::create_dir_all(dir).await?;
    }
    let tmp = path.with_extension("yaml.tmp");
    tokio::fs::write(&tmp, contents).await?;
    tokio::fs::rename(&tmp, path).await?;
    debug!(path = %path.display(), "Wrote Traefik configuration");
    Ok(true)
}

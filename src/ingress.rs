//! Ingress rule and TLS-domain resolution
//!
//! Turns one website of one application into a backend-neutral [`Route`]:
//! entrypoint, Traefik rule, priority, middleware chain and TLS settings.
//! Both backends render the same `Route` into their own representation.

use serde_json::{json, Value};
use sha2::{Digest, Sha256};
use tracing::warn;

use crate::backend::{app_resource_name, website_resource_name};
use crate::config::{
    CertificateSource, ColdStartConfig, Config, MiddlewareRef, RoutingConfig, TlsConfig,
};
use crate::domain::{
    Application, AuthenticationType, AvailableDomain, AvailableDomainSlice, StaticSite,
    Website, WildcardDomains,
};
use crate::error::Result;

/// Request header carrying the artifact id of a static website
pub const ARTIFACT_HEADER: &str = "X-Showcase-Artifact";

/// A middleware in a router's chain
#[derive(Clone, Debug, PartialEq)]
pub enum RouteMiddleware {
    /// Middleware maintained outside the engine
    External(MiddlewareRef),
    /// Strip the website's path prefix before forwarding
    StripPrefix { name: String, prefix: String },
    /// Sablier gate that wakes a scaled-to-zero application
    ColdStart { name: String, spec: Value },
    /// Tells the shared static server which build artifact to serve
    Artifact { name: String, artifact_id: String },
}

impl RouteMiddleware {
    pub fn name(&self) -> &str {
        match self {
            RouteMiddleware::External(r) => &r.name,
            RouteMiddleware::StripPrefix { name, .. }
            | RouteMiddleware::ColdStart { name, .. }
            | RouteMiddleware::Artifact { name, .. } => name,
        }
    }

    /// Traefik middleware definition; `None` for external middlewares
    ///
    /// The shape is shared by the `Middleware` CRD spec and the file provider.
    pub fn spec(&self) -> Option<Value> {
        match self {
            RouteMiddleware::External(_) => None,
            RouteMiddleware::StripPrefix { prefix, .. } => Some(json!({
                "stripPrefix": { "prefixes": [prefix] }
            })),
            RouteMiddleware::ColdStart { spec, .. } => Some(spec.clone()),
            RouteMiddleware::Artifact { artifact_id, .. } => Some(json!({
                "headers": { "customRequestHeaders": { ARTIFACT_HEADER: artifact_id } }
            })),
        }
    }
}

/// TLS settings of an HTTPS router
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RouteTls {
    /// Certificate secret issued by cert-manager for `domain`
    Secret { domain: String, secret_name: String },
    /// Traefik ACME resolver with `domain` as the main name
    Resolver { domain: String, cert_resolver: String },
}

impl RouteTls {
    /// TLS target domain the certificate is issued for
    pub fn domain(&self) -> &str {
        match self {
            RouteTls::Secret { domain, .. } | RouteTls::Resolver { domain, .. } => domain,
        }
    }
}

/// Backend-neutral routing description of one website
#[derive(Clone, Debug, PartialEq)]
pub struct Route {
    /// Router name, unique per website
    pub name: String,
    pub entrypoint: String,
    pub rule: String,
    pub priority: i64,
    pub middlewares: Vec<RouteMiddleware>,
    pub tls: Option<RouteTls>,
}

/// Resolves routes from operator configuration
#[derive(Clone, Debug)]
pub struct IngressResolver {
    routing: RoutingConfig,
    tls: TlsConfig,
    domains: Vec<AvailableDomain>,
    wildcards: WildcardDomains,
    cold_start: Option<ColdStartConfig>,
}

impl IngressResolver {
    pub fn from_config(config: &Config) -> Result<Self> {
        Ok(Self {
            routing: config.routing.clone(),
            tls: config.tls.clone(),
            domains: config.domains.clone(),
            wildcards: config.wildcard_domains()?,
            cold_start: config.cold_start.clone(),
        })
    }

    pub fn entrypoint(&self, website: &Website) -> &str {
        if website.https {
            &self.routing.https_entrypoint
        } else {
            &self.routing.http_entrypoint
        }
    }

    /// Router priority; longer rules win
    pub fn priority(&self, rule: &str) -> i64 {
        rule.len() as i64 + self.routing.priority_offset
    }

    pub fn resolve(&self, app: &Application, website: &Website) -> Route {
        let rule = rule(website);
        Route {
            name: website_resource_name(&website.id),
            entrypoint: self.entrypoint(website).to_string(),
            priority: self.priority(&rule),
            rule,
            middlewares: self.middlewares(app, website),
            tls: self.tls(website),
        }
    }

    /// Route of a static website, ending with its artifact header
    pub fn resolve_static(&self, site: &StaticSite) -> Route {
        let mut route = self.resolve(&site.application, &site.website);
        route.middlewares.push(RouteMiddleware::Artifact {
            name: format!("{}-artifact", website_resource_name(&site.website.id)),
            artifact_id: site.artifact_id.clone(),
        });
        route
    }

    /// Middleware chain in order: auth, strip-prefix, cold-start
    pub fn middlewares(&self, app: &Application, website: &Website) -> Vec<RouteMiddleware> {
        let mut chain = Vec::new();

        let auth = match website.authentication {
            AuthenticationType::Off => &[][..],
            AuthenticationType::Soft => &self.routing.auth.soft[..],
            AuthenticationType::Hard => &self.routing.auth.hard[..],
        };
        if !auth.is_empty() {
            if self.domains.is_auth_available(&website.fqdn) {
                chain.extend(auth.iter().cloned().map(RouteMiddleware::External));
            } else {
                warn!(
                    app_id = %app.id,
                    fqdn = %website.fqdn,
                    "Authentication requested but not available on this domain, skipping"
                );
            }
        }

        if website.strip_prefix && website.path_prefix != "/" {
            chain.push(RouteMiddleware::StripPrefix {
                name: format!("{}-strip", website_resource_name(&website.id)),
                prefix: website.path_prefix.clone(),
            });
        }

        if app.scales_to_zero() {
            if let Some(cold_start) = &self.cold_start {
                chain.push(RouteMiddleware::ColdStart {
                    name: format!("{}-sablier", app_resource_name(&app.id)),
                    spec: sablier_spec(cold_start, app),
                });
            }
        }

        chain
    }

    /// TLS settings for HTTPS websites
    pub fn tls(&self, website: &Website) -> Option<RouteTls> {
        if !website.https {
            return None;
        }
        let domain = self.wildcards.tls_target_domain(&website.fqdn);
        Some(match self.tls.source {
            CertificateSource::CertManager => RouteTls::Secret {
                secret_name: certificate_name(&domain),
                domain,
            },
            CertificateSource::Traefik => RouteTls::Resolver {
                cert_resolver: self.tls.cert_resolver.clone(),
                domain,
            },
        })
    }

    pub fn tls_target_domain(&self, fqdn: &str) -> String {
        self.wildcards.tls_target_domain(fqdn)
    }
}

/// `Host(`fqdn`)`, plus a `PathPrefix` matcher for non-root prefixes
pub fn rule(website: &Website) -> String {
    if website.path_prefix == "/" {
        format!("Host(`{}`)", website.fqdn)
    } else {
        format!(
            "Host(`{}`) && PathPrefix(`{}`)",
            website.fqdn, website.path_prefix
        )
    }
}

/// Longest name Kubernetes accepts for a Certificate or Secret
const MAX_OBJECT_NAME: usize = 253;

/// Name of the certificate (and its secret) for a TLS target domain
///
/// `*.apps.example.com` becomes `tls-wildcard-apps-example-com-<hash>`. The
/// readable part alone is ambiguous (`a-b.x.org` and `a.b.x.org` read the
/// same), so the first 8 hex chars of the domain's SHA-256 are appended.
pub fn certificate_name(domain: &str) -> String {
    let digest = hex::encode(&Sha256::digest(domain.as_bytes())[..4]);
    let readable = domain.replace('*', "wildcard").replace('.', "-");
    // "tls-" + readable + "-" + digest
    let budget = MAX_OBJECT_NAME - 4 - 1 - digest.len();
    let readable = readable
        .get(..budget.min(readable.len()))
        .unwrap_or(&readable)
        .trim_end_matches('-');
    format!("tls-{}-{}", readable, digest)
}

fn sablier_spec(cold_start: &ColdStartConfig, app: &Application) -> Value {
    let startup = app.config.auto_shutdown.startup;
    let strategy = ColdStartConfig::strategy_name(startup);
    let strategy_spec = match strategy {
        "blocking" => json!({ "timeout": cold_start.blocking_timeout }),
        _ => json!({
            "displayName": app.name,
            "theme": cold_start.theme,
            "showDetails": true,
        }),
    };
    json!({
        "plugin": {
            "sablier": {
                "sablierUrl": cold_start.url,
                "group": app.id,
                "sessionDuration": cold_start.session_duration,
                strategy: strategy_spec,
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AuthMiddlewares;
    use crate::domain::StartupBehavior;
    use crate::test_support::{https_website, runtime_app, static_app, website};

    fn config() -> Config {
        Config {
            domains: vec![
                AvailableDomain::new("*.apps.example.com").with_auth(true),
                AvailableDomain::new("*.example.com"),
            ],
            routing: RoutingConfig {
                auth: AuthMiddlewares {
                    soft: vec![MiddlewareRef {
                        name: "auth-soft".into(),
                        namespace: None,
                    }],
                    hard: vec![MiddlewareRef {
                        name: "auth-hard".into(),
                        namespace: None,
                    }],
                },
                ..Default::default()
            },
            ..Default::default()
        }
    }

    fn resolver() -> IngressResolver {
        IngressResolver::from_config(&config()).unwrap()
    }

    #[test]
    fn test_rule() {
        assert_eq!(rule(&website("w", "a.com", "/")), "Host(`a.com`)");
        assert_eq!(
            rule(&website("w", "a.com", "/api")),
            "Host(`a.com`) && PathPrefix(`/api`)"
        );
    }

    #[test]
    fn test_longer_prefix_has_higher_priority() {
        let r = resolver();
        let app = runtime_app("a", vec![]);
        let root = r.resolve(&app, &website("w1", "a.com", "/"));
        let api = r.resolve(&app, &website("w2", "a.com", "/api"));
        let v1 = r.resolve(&app, &website("w3", "a.com", "/api/v1"));
        assert!(api.priority > root.priority);
        assert!(v1.priority > api.priority);
        assert_eq!(root.priority, "Host(`a.com`)".len() as i64);
    }

    #[test]
    fn test_priority_offset_is_added() {
        let mut c = config();
        c.routing.priority_offset = 1000;
        let r = IngressResolver::from_config(&c).unwrap();
        assert_eq!(r.priority("Host(`a.com`)"), 1000 + 13);
    }

    #[test]
    fn test_entrypoints() {
        let r = resolver();
        assert_eq!(r.entrypoint(&website("w", "a.com", "/")), "web");
        assert_eq!(r.entrypoint(&https_website("w", "a.com", "/")), "websecure");
    }

    #[test]
    fn test_middleware_chain_order() {
        let mut c = config();
        c.cold_start = Some(ColdStartConfig {
            url: "http://sablier:10000".into(),
            session_duration: "15m".into(),
            theme: "ghost".into(),
            blocking_timeout: "60s".into(),
        });
        let r = IngressResolver::from_config(&c).unwrap();

        let mut w = website("w1", "x.apps.example.com", "/api");
        w.strip_prefix = true;
        w.authentication = AuthenticationType::Hard;
        let mut app = runtime_app("a1", vec![w.clone()]);
        app.config.auto_shutdown.enabled = true;

        let names: Vec<_> = r
            .middlewares(&app, &w)
            .iter()
            .map(|m| m.name().to_string())
            .collect();
        assert_eq!(names, vec!["auth-hard", "nsapp-w1-strip", "nsapp-a1-sablier"]);
    }

    #[test]
    fn test_auth_skipped_without_auth_available() {
        let r = resolver();
        let mut w = website("w1", "x.example.com", "/");
        w.authentication = AuthenticationType::Soft;
        let app = runtime_app("a1", vec![w.clone()]);
        assert!(r.middlewares(&app, &w).is_empty());
    }

    #[test]
    fn test_strip_prefix_spec() {
        let r = resolver();
        let mut w = website("w1", "a.com", "/v1");
        w.strip_prefix = true;
        let app = runtime_app("a1", vec![w.clone()]);
        let chain = r.middlewares(&app, &w);
        assert_eq!(
            chain[0].spec().unwrap(),
            json!({ "stripPrefix": { "prefixes": ["/v1"] } })
        );
    }

    #[test]
    fn test_cold_start_requires_config() {
        let r = resolver();
        let w = website("w1", "a.com", "/");
        let mut app = runtime_app("a1", vec![w.clone()]);
        app.config.auto_shutdown.enabled = true;
        assert!(r.middlewares(&app, &w).is_empty());
    }

    #[test]
    fn test_blocking_cold_start_spec() {
        let cold = ColdStartConfig {
            url: "http://sablier:10000".into(),
            session_duration: "1h".into(),
            theme: "ghost".into(),
            blocking_timeout: "30s".into(),
        };
        let mut app = runtime_app("a1", vec![]);
        app.config.auto_shutdown.startup = StartupBehavior::Blocking;
        let spec = sablier_spec(&cold, &app);
        assert_eq!(spec["plugin"]["sablier"]["blocking"]["timeout"], "30s");
        assert_eq!(spec["plugin"]["sablier"]["group"], "a1");
    }

    #[test]
    fn test_tls_modes() {
        let r = resolver();
        assert!(r.tls(&website("w", "x.apps.example.com", "/")).is_none());

        let tls = r.tls(&https_website("w", "x.apps.example.com", "/")).unwrap();
        assert_eq!(
            tls,
            RouteTls::Resolver {
                domain: "*.apps.example.com".into(),
                cert_resolver: "nsresolver".into(),
            }
        );

        let mut c = config();
        c.tls.source = CertificateSource::CertManager;
        let r = IngressResolver::from_config(&c).unwrap();
        let tls = r.tls(&https_website("w", "a.b.example.com", "/")).unwrap();
        assert_eq!(tls.domain(), "*.b.example.com");
        assert!(matches!(
            tls,
            RouteTls::Secret { ref secret_name, .. }
                if *secret_name == certificate_name("*.b.example.com")
                    && secret_name.starts_with("tls-wildcard-b-example-com-")
        ));
    }

    #[test]
    fn test_static_route_carries_artifact_header() {
        let app = static_app("s1", vec![website("docs", "docs.example.com", "/")]);
        let site = StaticSite {
            website: app.websites[0].clone(),
            application: app,
            artifact_id: "art-7".to_string(),
        };
        let route = resolver().resolve_static(&site);
        let last = route.middlewares.last().unwrap();
        assert_eq!(last.name(), "nsapp-docs-artifact");
        assert_eq!(
            last.spec().unwrap()["headers"]["customRequestHeaders"][ARTIFACT_HEADER],
            "art-7"
        );
    }

    #[test]
    fn test_certificate_names_are_distinct_and_bounded() {
        let name = certificate_name("*.apps.example.com");
        assert!(name.starts_with("tls-wildcard-apps-example-com-"));
        assert_eq!(name.len(), "tls-wildcard-apps-example-com-".len() + 8);
        assert_eq!(certificate_name("*.apps.example.com"), name);

        assert_ne!(certificate_name("a-b.other.org"), certificate_name("a.b.other.org"));
        assert_ne!(certificate_name("wildcard.x.org"), certificate_name("*.x.org"));

        let long = format!("{}.example.com", "a".repeat(300));
        let name = certificate_name(&long);
        assert!(name.len() <= 253);
        assert!(!name.contains("--"));
    }
}

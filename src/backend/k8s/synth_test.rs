//! Unit tests for Kubernetes resource synthesis

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};

    use k8s_openapi::api::apps::v1::StatefulSet;
    use k8s_openapi::api::core::v1::{Secret, Service};
    use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
    use kube::ResourceExt;

    use crate::backend::k8s::crd::{Certificate, IngressRoute, Middleware};
    use crate::backend::k8s::synth::{NextResources, Synthesizer, APP_CONTAINER};
    use crate::backend::k8s::{sync_next, sync_shared, AppStores};
    use crate::backend::{valid_runtime, valid_static_sites};
    use crate::config::{CertificateSource, ColdStartConfig, Config, ResourceSpec};
    use crate::domain::{AvailableDomain, DesiredState, DesiredStateLeader};
    use crate::ingress::certificate_name;
    use crate::test_support::{
        https_website, runtime_app, runtime_state, sample_state, MemoryStore,
    };

    fn config() -> Config {
        let mut config = Config::default();
        config.kubernetes.namespace = "ns-apps".into();
        config.domains = vec![
            AvailableDomain::new("*.apps.example.com"),
            AvailableDomain::new("*.example.com"),
        ];
        config.resources.limits = ResourceSpec {
            cpu: String::new(),
            memory: "512Mi".into(),
        };
        config
    }

    fn synthesize(config: &Config, state: &DesiredState) -> NextResources {
        Synthesizer::new(config)
            .unwrap()
            .synthesize(&valid_runtime(state), &valid_static_sites(state))
            .unwrap()
    }

    #[test]
    fn test_one_statefulset_per_runtime_app() {
        let next = synthesize(&config(), &sample_state());
        let names: Vec<_> = next.stateful_sets.iter().map(|s| s.name_any()).collect();
        assert_eq!(names, vec!["nsapp-app1", "nsapp-app2"]);

        let sts = &next.stateful_sets[0];
        assert_eq!(sts.namespace().as_deref(), Some("ns-apps"));
        assert_eq!(
            sts.labels().get("ns.trap.jp/appId").map(String::as_str),
            Some("app1")
        );
        let spec = sts.spec.as_ref().unwrap();
        assert_eq!(spec.replicas, Some(1));
        let template = &spec.template;
        let annotations = template.metadata.as_ref().unwrap().annotations.as_ref().unwrap();
        assert_eq!(
            annotations.get("ns.trap.jp/restarted-at").map(String::as_str),
            Some("2024-05-01T12:00:00+00:00")
        );
        let container = &template.spec.as_ref().unwrap().containers[0];
        assert_eq!(container.name, APP_CONTAINER);
        assert_eq!(
            container.image.as_deref(),
            Some("registry.local/showcase/app:abc123")
        );
        let limits = container.resources.as_ref().unwrap().limits.as_ref().unwrap();
        assert_eq!(limits.get("memory").map(|q| q.0.as_str()), Some("512Mi"));
        assert!(!limits.contains_key("cpu"));
    }

    #[test]
    fn test_stopped_app_scales_to_zero_replicas() {
        let mut app = runtime_app("a1", vec![]);
        app.running = false;
        let state = DesiredState {
            runtime: vec![runtime_state(app)],
            static_sites: vec![],
        };
        let next = synthesize(&config(), &state);
        assert_eq!(next.stateful_sets[0].spec.as_ref().unwrap().replicas, Some(0));
    }

    #[test]
    fn test_command_override_is_parsed() {
        let mut app = runtime_app("a1", vec![]);
        app.config.entrypoint = "/bin/server --port 8080".into();
        app.config.command = "migrate && serve".into();
        let state = DesiredState {
            runtime: vec![runtime_state(app)],
            static_sites: vec![],
        };
        let next = synthesize(&config(), &state);
        let container = &next.stateful_sets[0]
            .spec
            .as_ref()
            .unwrap()
            .template
            .spec
            .as_ref()
            .unwrap()
            .containers[0];
        assert_eq!(
            container.command.as_deref(),
            Some(&["/bin/server".to_string(), "--port".into(), "8080".into()][..])
        );
        assert_eq!(
            container.args.as_deref(),
            Some(&["sh".to_string(), "-c".into(), "migrate && serve".into()][..])
        );
    }

    #[test]
    fn test_unparsable_command_skips_only_that_app() {
        let mut broken = runtime_app("broken", vec![]);
        broken.config.command = "echo \"unterminated".into();
        let mut state = sample_state();
        state.runtime.push(runtime_state(broken));
        let next = synthesize(&config(), &state);
        assert_eq!(next.stateful_sets.len(), 2);
    }

    #[test]
    fn test_env_is_stored_in_secret() {
        let next = synthesize(&config(), &sample_state());
        let secret = &next.secrets[0];
        assert_eq!(secret.name_any(), "nsapp-app1");
        let data = secret.data.as_ref().unwrap();
        assert_eq!(data.get("PORT").map(|b| b.0.as_slice()), Some(&b"8080"[..]));
    }

    #[test]
    fn test_services() {
        let next = synthesize(&config(), &sample_state());
        let names: Vec<_> = next.services.iter().map(|s| s.name_any()).collect();
        assert_eq!(
            names,
            vec![
                "nsapp-app1",
                "nsapp-w1",
                "nsapp-app2",
                "nsapp-app2-ports",
                "nsapp-w2",
                "nsapp-w3",
            ]
        );

        let ports = next.services.iter().find(|s| s.name_any() == "nsapp-app2-ports").unwrap();
        let spec = ports.spec.as_ref().unwrap();
        assert_eq!(spec.type_.as_deref(), Some("NodePort"));
        let port = &spec.ports.as_ref().unwrap()[0];
        assert_eq!(port.node_port, Some(30022));
        assert_eq!(port.target_port, Some(IntOrString::Int(22)));

        // static sites select the static server, not the application
        let docs = next.services.iter().find(|s| s.name_any() == "nsapp-w3").unwrap();
        let selector = docs.spec.as_ref().unwrap().selector.as_ref().unwrap();
        assert_eq!(
            selector.get("app.kubernetes.io/name").map(String::as_str),
            Some("ns-static")
        );
    }

    #[test]
    fn test_ingress_routes_and_middlewares() {
        let next = synthesize(&config(), &sample_state());
        assert_eq!(next.ingress_routes.len(), 3);

        let web = next
            .ingress_routes
            .iter()
            .find(|r| r.name_any() == "nsapp-w2")
            .unwrap();
        assert_eq!(web.spec.entry_points, vec!["web"]);
        let rule = &web.spec.routes[0];
        assert_eq!(rule.match_rule, "Host(`web.example.com`) && PathPrefix(`/v1`)");
        assert_eq!(rule.middlewares[0].name, "nsapp-w2-strip");
        assert!(web.spec.tls.is_none());

        let names: Vec<_> = next.middlewares.iter().map(|m| m.name_any()).collect();
        assert_eq!(names, vec!["nsapp-w2-strip", "nsapp-w3-artifact"]);
        let strip = &next.middlewares[0];
        assert_eq!(strip.name_any(), "nsapp-w2-strip");
        assert_eq!(
            strip.spec.strip_prefix.as_ref().unwrap().prefixes,
            vec!["/v1"]
        );

        let api = next
            .ingress_routes
            .iter()
            .find(|r| r.name_any() == "nsapp-w1")
            .unwrap();
        let tls = api.spec.tls.as_ref().unwrap();
        assert_eq!(tls.cert_resolver.as_deref(), Some("nsresolver"));
        assert_eq!(tls.domains[0].main, "*.apps.example.com");
    }

    #[test]
    fn test_cold_start_middleware_is_shared_per_app() {
        let mut config = config();
        config.cold_start = Some(ColdStartConfig {
            url: "http://sablier:10000".into(),
            session_duration: "15m".into(),
            theme: "ghost".into(),
            blocking_timeout: "60s".into(),
        });
        let mut app = runtime_app(
            "a1",
            vec![
                https_website("w1", "a.apps.example.com", "/"),
                https_website("w2", "b.apps.example.com", "/"),
            ],
        );
        app.config.auto_shutdown.enabled = true;
        let state = DesiredState {
            runtime: vec![runtime_state(app)],
            static_sites: vec![],
        };
        let next = synthesize(&config, &state);
        assert_eq!(next.middlewares.len(), 1);
        assert!(next.middlewares[0].spec.plugin.as_ref().unwrap().contains_key("sablier"));
        assert_eq!(
            next.stateful_sets[0]
                .labels()
                .get("sablier.group")
                .map(String::as_str),
            Some("a1")
        );
    }

    #[test]
    fn test_certificates_are_deduplicated_by_target() {
        let mut config = config();
        config.tls.source = CertificateSource::CertManager;
        let synth = Synthesizer::new(&config).unwrap();

        let app = runtime_app(
            "a1",
            vec![
                https_website("w1", "a.apps.example.com", "/"),
                https_website("w2", "b.apps.example.com", "/"),
                https_website("w3", "c.example.com", "/"),
            ],
        );
        let leader = DesiredStateLeader {
            runtime: vec![runtime_state(app)],
            static_sites: vec![],
        };
        let certs = synth.certificates(&leader);
        let names: Vec<_> = certs.iter().map(|c| c.name_any()).collect();
        assert_eq!(
            names,
            vec![
                certificate_name("*.apps.example.com"),
                certificate_name("*.example.com"),
            ]
        );
        assert_eq!(
            certs[0].labels().get("ns.trap.jp/shared").map(String::as_str),
            Some("true")
        );
        assert_eq!(certs[0].spec.issuer_ref.kind, "ClusterIssuer");
    }

    fn stores_with_log(
        log: &Arc<Mutex<Vec<String>>>,
    ) -> (
        MemoryStore<StatefulSet>,
        MemoryStore<Secret>,
        MemoryStore<Service>,
        MemoryStore<Middleware>,
        MemoryStore<IngressRoute>,
    ) {
        (
            MemoryStore::with_log("StatefulSet", log.clone()),
            MemoryStore::with_log("Secret", log.clone()),
            MemoryStore::with_log("Service", log.clone()),
            MemoryStore::with_log("Middleware", log.clone()),
            MemoryStore::with_log("IngressRoute", log.clone()),
        )
    }

    #[tokio::test]
    async fn test_synthesized_resources_converge_in_kind_order() {
        let config = config();
        let hash = Synthesizer::new(&config).unwrap().labels().hash_key();
        let log = Arc::new(Mutex::new(Vec::new()));
        let (sts, secrets, services, middlewares, routes) = stores_with_log(&log);
        let stores = AppStores {
            stateful_sets: &sts,
            secrets: &secrets,
            services: &services,
            middlewares: &middlewares,
            ingress_routes: &routes,
        };

        let first = sync_next(&stores, synthesize(&config, &sample_state()), &hash)
            .await
            .unwrap();
        assert!(first.is_clean());
        assert_eq!(services.len(), 6);

        let kinds: Vec<String> = log
            .lock()
            .unwrap()
            .iter()
            .map(|entry| entry.split('/').next().unwrap().to_string())
            .collect();
        let order = ["StatefulSet", "Secret", "Service", "Middleware", "IngressRoute"];
        let ranks: Vec<usize> = kinds
            .iter()
            .map(|kind| order.iter().position(|k| k == kind).unwrap())
            .collect();
        assert!(ranks.windows(2).all(|w| w[0] <= w[1]), "{:?}", kinds);
        assert_eq!(kinds.first().map(String::as_str), Some("StatefulSet"));
        assert_eq!(kinds.last().map(String::as_str), Some("IngressRoute"));

        // the same desired state a second time writes nothing
        let applied_before = log.lock().unwrap().len();
        let second = sync_next(&stores, synthesize(&config, &sample_state()), &hash)
            .await
            .unwrap();
        assert!(second.applied.is_empty(), "{:?}", second.applied);
        assert!(second.pruned.is_empty());
        assert_eq!(second.unchanged.len(), first.applied.len());
        assert_eq!(log.lock().unwrap().len(), applied_before);
    }

    #[tokio::test]
    async fn test_lookalike_domains_get_their_own_certificates() {
        let mut config = config();
        config.tls.source = CertificateSource::CertManager;
        let synth = Synthesizer::new(&config).unwrap();
        let hash = synth.labels().hash_key();

        let leader = || DesiredStateLeader {
            runtime: vec![runtime_state(runtime_app(
                "a1",
                vec![
                    https_website("w1", "a-b.other.org", "/"),
                    https_website("w2", "a.b.other.org", "/"),
                ],
            ))],
            static_sites: vec![],
        };

        let certs = synth.certificates(&leader());
        assert_eq!(certs.len(), 2);
        assert_ne!(certs[0].name_any(), certs[1].name_any());

        let store = MemoryStore::<Certificate>::new("Certificate");
        let first = sync_shared(&store, certs, &hash).await.unwrap();
        assert_eq!(first.applied.len(), 2);

        let mut dns: Vec<Vec<String>> = store
            .items
            .lock()
            .unwrap()
            .values()
            .map(|c| c.spec.dns_names.clone())
            .collect();
        dns.sort();
        assert_eq!(
            dns,
            vec![
                vec!["a-b.other.org".to_string()],
                vec!["a.b.other.org".to_string()],
            ]
        );

        let second = sync_shared(&store, synth.certificates(&leader()), &hash)
            .await
            .unwrap();
        assert!(second.applied.is_empty(), "{:?}", second.applied);
        assert_eq!(second.unchanged.len(), 2);

        // each route references the secret issued for its own domain
        let state = DesiredState {
            runtime: leader().runtime,
            static_sites: vec![],
        };
        let next = synthesize(&config, &state);
        for route in &next.ingress_routes {
            let fqdn = if route.name_any() == "nsapp-w1" {
                "a-b.other.org"
            } else {
                "a.b.other.org"
            };
            let secret = route.spec.tls.as_ref().unwrap().secret_name.clone();
            assert_eq!(secret, Some(certificate_name(fqdn)));
        }
    }

    #[cfg(feature = "metrics")]
    #[tokio::test]
    async fn test_shared_sync_records_duration() {
        let store = MemoryStore::<Certificate>::new("Certificate");
        sync_shared(&store, Vec::new(), "ns.trap.jp/resource-hash")
            .await
            .unwrap();
        assert!(crate::metrics::encode_text().contains("operation=\"synchronize_shared\""));
    }

    #[test]
    fn test_no_certificates_with_traefik_resolver() {
        let synth = Synthesizer::new(&config()).unwrap();
        let leader: DesiredStateLeader = sample_state().into();
        assert!(synth.certificates(&leader).is_empty());
    }
}

use kube::ResourceExt;
use showcase_k8s::backend::docker::traefik;
use showcase_k8s::backend::k8s::Synthesizer;
use showcase_k8s::config::Config;
use showcase_k8s::domain::{DesiredState, DesiredStateLeader};
use showcase_k8s::ingress::{certificate_name, IngressResolver};
use showcase_k8s::placement::select_node;

const STATE: &str = r#"
runtime:
  - imageName: registry.local/showcase/blog
    imageTag: "1f2e3d"
    envs: { PORT: "3000" }
    app:
      id: blog
      name: blog
      deployType: runtime
      running: true
      ownerIds: [alice]
      updatedAt: "2024-06-01T00:00:00Z"
      config:
        build: { type: runtimeBuildpack, context: "." }
        command: "node server.js"
      websites:
        - { id: blog-web, fqdn: blog.apps.example.com, https: true, httpPort: 3000 }
        - { id: blog-api, fqdn: api.apps.example.com, pathPrefix: /v1, stripPrefix: true, https: true, httpPort: 3000 }
staticSites:
  - artifactId: art-1
    application:
      id: docs
      name: docs
      deployType: static
      updatedAt: "2024-06-01T00:00:00Z"
      config:
        build: { type: staticBuildpack, artifactPath: dist }
    website: { id: docs-web, fqdn: docs.example.com, httpPort: 80 }
"#;

fn state() -> DesiredState {
    serde_yaml::from_str(STATE).unwrap()
}

fn kubernetes_config() -> Config {
    Config::from_yaml(
        r#"
backend: kubernetes
domains:
  - domain: "*.apps.example.com"
  - domain: docs.example.com
tls:
  source: cert-manager
kubernetes:
  namespace: ns-apps
"#,
    )
    .unwrap()
}

#[test]
fn kubernetes_resources_for_desired_state() {
    let config = kubernetes_config();
    let state = state();
    let synth = Synthesizer::new(&config).unwrap();

    let runtime: Vec<_> = state.runtime.iter().collect();
    let static_sites: Vec<_> = state.static_sites.iter().collect();
    let next = synth.synthesize(&runtime, &static_sites).unwrap();

    let workloads: Vec<_> = next.stateful_sets.iter().map(|s| s.name_any()).collect();
    assert_eq!(workloads, vec!["nsapp-blog"]);

    let mut routes: Vec<_> = next.ingress_routes.iter().map(|r| r.name_any()).collect();
    routes.sort();
    assert_eq!(routes, vec!["nsapp-blog-api", "nsapp-blog-web", "nsapp-docs-web"]);

    let middlewares: Vec<_> = next.middlewares.iter().map(|m| m.name_any()).collect();
    assert_eq!(
        middlewares,
        vec!["nsapp-blog-api-strip", "nsapp-docs-web-artifact"]
    );
}

#[test]
fn websites_under_one_wildcard_share_a_certificate() {
    let config = kubernetes_config();
    let synth = Synthesizer::new(&config).unwrap();

    let certificates = synth.certificates(&DesiredStateLeader::from(state()));
    let names: Vec<_> = certificates.iter().map(|c| c.name_any()).collect();
    assert_eq!(names, vec![certificate_name("*.apps.example.com")]);
    assert!(names[0].starts_with("tls-wildcard-apps-example-com-"));
    assert_eq!(
        certificates[0].spec.dns_names,
        vec!["*.apps.example.com".to_string()]
    );
}

#[test]
fn docker_routes_for_desired_state() {
    let config = Config::from_yaml(
        r#"
domains:
  - domain: "*.apps.example.com"
  - domain: docs.example.com
"#,
    )
    .unwrap();
    let resolver = IngressResolver::from_config(&config).unwrap();
    let state = state();
    let runtime: Vec<_> = state.runtime.iter().collect();
    let static_sites: Vec<_> = state.static_sites.iter().collect();

    let dynamic = traefik::render(&resolver, &config, &runtime, &static_sites);
    let api = &dynamic.http.routers["nsapp-blog-api"];
    assert_eq!(api.rule, "Host(`api.apps.example.com`) && PathPrefix(`/v1`)");
    assert!(api.priority > dynamic.http.routers["nsapp-blog-web"].priority);
    assert_eq!(
        dynamic.http.services["nsapp-blog-api"].load_balancer.servers[0].url,
        "http://nsapp-blog:3000"
    );
    assert_eq!(
        dynamic.http.services["nsapp-docs-web"].load_balancer.servers[0].url,
        config.static_server.url
    );
}

#[test]
fn placement_is_stable_for_an_application() {
    let pool: Vec<String> = ["node-a", "node-b", "node-c"]
        .iter()
        .map(|s| s.to_string())
        .collect();
    let first = select_node("blog", &pool);
    assert!(first.is_some());
    assert_eq!(select_node("blog", &pool), first);
}

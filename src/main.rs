use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand};
use k8s_openapi::api::coordination::v1::{Lease, LeaseSpec};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::MicroTime;
use kube::api::{Api, ObjectMeta, Patch, PatchParams, PostParams};
use showcase_k8s::backend::docker::DockerBackend;
use showcase_k8s::backend::k8s::K8sBackend;
use showcase_k8s::backend::Backend;
use showcase_k8s::config::{BackendKind, Config};
use showcase_k8s::domain::{DesiredState, DesiredStateLeader};
use showcase_k8s::events::EventBus;
use showcase_k8s::{telemetry, Error};
use tracing::{error, info, warn};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Keep the platform converged with a desired-state file
    Run(RunArgs),
    /// Run one synchronization pass and exit
    Sync(SyncArgs),
    /// Show the state of every managed container
    Containers(CommonArgs),
    /// Print container lifecycle events until interrupted
    Events(CommonArgs),
    /// Show version and build information
    Version,
}

#[derive(Parser, Debug)]
struct CommonArgs {
    /// Engine configuration file
    #[arg(long, env = "SHOWCASE_CONFIG", default_value = "/etc/showcase/config.yaml")]
    config: PathBuf,

    /// Emit logs as JSON
    #[arg(long, env = "LOG_JSON")]
    json_logs: bool,
}

#[derive(Parser, Debug)]
struct SyncArgs {
    #[command(flatten)]
    common: CommonArgs,

    /// Desired state (YAML or JSON)
    #[arg(long, env = "SHOWCASE_STATE")]
    state: PathBuf,

    /// Also synchronize shared resources such as certificates
    #[arg(long)]
    shared: bool,
}

#[derive(Parser, Debug)]
struct RunArgs {
    #[command(flatten)]
    common: CommonArgs,

    /// Desired state (YAML or JSON), re-read on every pass
    #[arg(long, env = "SHOWCASE_STATE")]
    state: PathBuf,

    /// Seconds between synchronization passes
    #[arg(long, env = "SYNC_INTERVAL_SECS", default_value_t = 30)]
    interval_secs: u64,

    /// REST API listen address
    #[arg(long, env = "LISTEN_ADDR", default_value = "0.0.0.0:8080")]
    listen: SocketAddr,
}

#[tokio::main]
async fn main() -> Result<(), Error> {
    let args = Args::parse();

    match args.command {
        Commands::Version => {
            println!("Showcase deployer v{}", env!("CARGO_PKG_VERSION"));
            println!("Build Date: {}", env!("BUILD_DATE"));
            Ok(())
        }
        Commands::Run(run_args) => {
            telemetry::init_tracing(run_args.common.json_logs)?;
            let result = run(run_args).await;
            telemetry::shutdown_telemetry();
            result
        }
        Commands::Sync(sync_args) => {
            telemetry::init_tracing(sync_args.common.json_logs)?;
            sync_once(sync_args).await
        }
        Commands::Containers(common) => {
            telemetry::init_tracing(common.json_logs)?;
            let backend = build_backend(&common.config, EventBus::new()).await?;
            let containers = backend.list_containers().await;
            backend.dispose().await?;
            for container in containers? {
                match &container.message {
                    Some(message) => println!(
                        "{}\t{}\t{}",
                        container.application_id, container.state, message
                    ),
                    None => println!("{}\t{}", container.application_id, container.state),
                }
            }
            Ok(())
        }
        Commands::Events(common) => {
            telemetry::init_tracing(common.json_logs)?;
            let bus = EventBus::new();
            let mut events = bus.subscribe();
            let backend = build_backend(&common.config, bus).await?;
            loop {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => break,
                    event = events.recv() => match event {
                        Some(event) => println!("{}\t{:?}", event.event_type, event.fields),
                        None => break,
                    }
                }
            }
            backend.dispose().await
        }
    }
}

async fn build_backend(config_path: &Path, bus: EventBus) -> Result<Arc<dyn Backend>, Error> {
    let config = Arc::new(Config::load(config_path)?);
    info!(backend = ?config.backend, "Loaded configuration");
    Ok(match config.backend {
        BackendKind::Docker => Arc::new(DockerBackend::connect(config, bus)?),
        BackendKind::Kubernetes => {
            let client = kube::Client::try_default().await?;
            Arc::new(K8sBackend::new(client, config, bus)?)
        }
    })
}

fn load_state(path: &Path) -> Result<DesiredState, Error> {
    let raw = std::fs::read_to_string(path)?;
    // YAML is a superset of JSON
    Ok(serde_yaml::from_str(&raw)?)
}

async fn sync_once(args: SyncArgs) -> Result<(), Error> {
    let state = load_state(&args.state)?;
    let backend = build_backend(&args.common.config, EventBus::new()).await?;

    let mut report = backend.synchronize(&state).await;
    if args.shared {
        if let Ok(report) = report.as_mut() {
            report.merge(
                backend
                    .synchronize_shared(&DesiredStateLeader::from(state))
                    .await?,
            );
        }
    }
    backend.dispose().await?;

    let report = report?;
    println!("{}", serde_json::to_string_pretty(&report)?);
    if !report.is_clean() {
        return Err(Error::ConfigError(format!(
            "{} resources failed to synchronize",
            report.failed.len()
        )));
    }
    Ok(())
}

async fn run(args: RunArgs) -> Result<(), Error> {
    info!(
        "Starting Showcase deployer v{}",
        env!("CARGO_PKG_VERSION")
    );
    let config = Arc::new(Config::load(&args.common.config)?);
    let bus = EventBus::new();

    let is_leader = Arc::new(AtomicBool::new(false));
    let backend: Arc<dyn Backend> = match config.backend {
        BackendKind::Docker => {
            // a Docker host is its own single-member cluster
            is_leader.store(true, Ordering::Relaxed);
            Arc::new(DockerBackend::connect(config.clone(), bus.clone())?)
        }
        BackendKind::Kubernetes => {
            let client = kube::Client::try_default().await?;
            info!("Connected to Kubernetes cluster");

            let holder_identity = std::env::var("HOSTNAME").unwrap_or_else(|_| {
                hostname::get()
                    .ok()
                    .and_then(|h| h.into_string().ok())
                    .unwrap_or_else(|| "unknown-host".to_string())
            });
            info!("Leader election using holder ID: {}", holder_identity);

            let lease_client = client.clone();
            let lease_ns = config.kubernetes.namespace.clone();
            let is_leader_bg = Arc::clone(&is_leader);
            tokio::spawn(async move {
                run_leader_election(lease_client, &lease_ns, &holder_identity, is_leader_bg)
                    .await;
            });

            Arc::new(K8sBackend::new(client, config.clone(), bus.clone())?)
        }
    };

    #[cfg(feature = "rest-api")]
    {
        let api_backend = backend.clone();
        let listen = args.listen;
        tokio::spawn(async move {
            if let Err(e) = showcase_k8s::rest_api::run_server(listen, api_backend).await {
                error!("REST API server error: {:?}", e);
            }
        });
    }
    #[cfg(not(feature = "rest-api"))]
    let _ = args.listen;

    let mut interval = tokio::time::interval(Duration::from_secs(args.interval_secs.max(1)));
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Shutting down");
                break;
            }
            _ = interval.tick() => {
                if let Err(e) = run_pass(backend.as_ref(), &args.state, &is_leader).await {
                    error!("Synchronization failed: {}", e);
                }
            }
        }
    }

    backend.dispose().await
}

async fn run_pass(
    backend: &dyn Backend,
    state_path: &Path,
    is_leader: &AtomicBool,
) -> Result<(), Error> {
    let state = load_state(state_path)?;
    let report = backend.synchronize(&state).await?;
    if !report.is_clean() {
        warn!(failed = ?report.failed, "Some resources failed to synchronize");
    }
    if is_leader.load(Ordering::Relaxed) {
        backend
            .synchronize_shared(&DesiredStateLeader::from(state))
            .await?;
    }
    Ok(())
}

const LEASE_NAME: &str = "showcase-deployer-leader";
const LEASE_DURATION_SECS: i32 = 15;
const RENEW_INTERVAL: Duration = Duration::from_secs(10);
const RETRY_INTERVAL: Duration = Duration::from_secs(5);

async fn run_leader_election(
    client: kube::Client,
    namespace: &str,
    identity: &str,
    is_leader: Arc<AtomicBool>,
) {
    let leases: Api<Lease> = Api::namespaced(client, namespace);

    loop {
        match try_acquire_or_renew(&leases, namespace, identity).await {
            Ok(true) => {
                if !is_leader.load(Ordering::Relaxed) {
                    info!("Acquired leadership for lease {}", LEASE_NAME);
                }
                is_leader.store(true, Ordering::Relaxed);
                tokio::time::sleep(RENEW_INTERVAL).await;
            }
            Ok(false) => {
                if is_leader.load(Ordering::Relaxed) {
                    warn!("Lost leadership for lease {}", LEASE_NAME);
                }
                is_leader.store(false, Ordering::Relaxed);
                tokio::time::sleep(RETRY_INTERVAL).await;
            }
            Err(e) => {
                warn!("Leader election error: {:?}", e);
                is_leader.store(false, Ordering::Relaxed);
                tokio::time::sleep(RETRY_INTERVAL).await;
            }
        }
    }
}

async fn try_acquire_or_renew(
    leases: &Api<Lease>,
    namespace: &str,
    identity: &str,
) -> Result<bool, kube::Error> {
    let now = Utc::now();

    match leases.get(LEASE_NAME).await {
        Ok(existing) => {
            let spec = existing.spec.as_ref();
            let current_holder = spec.and_then(|s| s.holder_identity.as_deref());

            if current_holder == Some(identity) {
                let patch = serde_json::json!({
                    "spec": {
                        "renewTime": MicroTime(now),
                        "leaseDurationSeconds": LEASE_DURATION_SECS,
                    }
                });
                leases
                    .patch(LEASE_NAME, &PatchParams::default(), &Patch::Merge(&patch))
                    .await?;
                return Ok(true);
            }

            if !lease_expired(spec, now) {
                return Ok(false);
            }
            info!(
                "Lease held by {:?} has expired, taking over",
                current_holder
            );
            let observed = existing.metadata.resource_version.as_deref();
            let patch = takeover_patch(identity, now, observed);
            lost_race(
                leases
                    .patch(LEASE_NAME, &PatchParams::default(), &Patch::Merge(&patch))
                    .await
                    .map(|_| ()),
            )
        }
        Err(kube::Error::Api(err)) if err.code == 404 => {
            let lease = Lease {
                metadata: ObjectMeta {
                    name: Some(LEASE_NAME.to_string()),
                    namespace: Some(namespace.to_string()),
                    ..Default::default()
                },
                spec: Some(LeaseSpec {
                    holder_identity: Some(identity.to_string()),
                    acquire_time: Some(MicroTime(now)),
                    renew_time: Some(MicroTime(now)),
                    lease_duration_seconds: Some(LEASE_DURATION_SECS),
                    ..Default::default()
                }),
            };
            let created = lost_race(
                leases
                    .create(&PostParams::default(), &lease)
                    .await
                    .map(|_| ()),
            )?;
            if created {
                info!("Created lease {} with holder {}", LEASE_NAME, identity);
            }
            Ok(created)
        }
        Err(e) => Err(e),
    }
}

/// Whether the lease in `spec` has run out at `now`
fn lease_expired(spec: Option<&LeaseSpec>, now: DateTime<Utc>) -> bool {
    spec.and_then(|s| s.renew_time.as_ref())
        .map(|renew| {
            let duration = spec
                .and_then(|s| s.lease_duration_seconds)
                .unwrap_or(LEASE_DURATION_SECS);
            now > renew.0 + chrono::Duration::seconds(duration as i64)
        })
        .unwrap_or(true)
}

/// Merge patch taking over an expired lease
///
/// Carries the observed `resourceVersion` so that only one of several
/// replicas racing for the same expired lease succeeds.
fn takeover_patch(
    identity: &str,
    now: DateTime<Utc>,
    resource_version: Option<&str>,
) -> serde_json::Value {
    serde_json::json!({
        "metadata": {
            "resourceVersion": resource_version,
        },
        "spec": {
            "holderIdentity": identity,
            "acquireTime": MicroTime(now),
            "renewTime": MicroTime(now),
            "leaseDurationSeconds": LEASE_DURATION_SECS,
        }
    })
}

/// A conflict means another replica got there first
fn lost_race(result: Result<(), kube::Error>) -> Result<bool, kube::Error> {
    match result {
        Ok(()) => Ok(true),
        Err(kube::Error::Api(err)) if err.code == 409 => {
            info!("Lost the race for lease {}: {}", LEASE_NAME, err.message);
            Ok(false)
        }
        Err(e) => Err(e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kube::core::ErrorResponse;

    fn spec(renewed_secs_ago: i64, duration: i32) -> LeaseSpec {
        LeaseSpec {
            holder_identity: Some("other".to_string()),
            renew_time: Some(MicroTime(
                Utc::now() - chrono::Duration::seconds(renewed_secs_ago),
            )),
            lease_duration_seconds: Some(duration),
            ..Default::default()
        }
    }

    fn api_error(code: u16) -> kube::Error {
        kube::Error::Api(ErrorResponse {
            status: "Failure".to_string(),
            message: "the object has been modified".to_string(),
            reason: "Conflict".to_string(),
            code,
        })
    }

    #[test]
    fn test_lease_expiry() {
        let now = Utc::now();
        assert!(!lease_expired(Some(&spec(5, 15)), now));
        assert!(lease_expired(Some(&spec(60, 15)), now));
        assert!(lease_expired(Some(&LeaseSpec::default()), now));
        assert!(lease_expired(None, now));
    }

    #[test]
    fn test_takeover_is_conditional_on_observed_version() {
        let patch = takeover_patch("replica-b", Utc::now(), Some("4711"));
        assert_eq!(patch["metadata"]["resourceVersion"], "4711");
        assert_eq!(patch["spec"]["holderIdentity"], "replica-b");
        assert_eq!(patch["spec"]["leaseDurationSeconds"], LEASE_DURATION_SECS);
    }

    #[test]
    fn test_conflict_means_not_leader() {
        assert!(lost_race(Ok(())).unwrap());
        assert!(!lost_race(Err(api_error(409))).unwrap());
        assert!(lost_race(Err(api_error(500))).is_err());
    }
}

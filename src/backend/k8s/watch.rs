//! Pod state normalization and the lifecycle event watcher

use std::collections::HashMap;

use futures::TryStreamExt;
use k8s_openapi::api::core::v1::{ContainerStatus, Pod};
use kube::api::Api;
use kube::runtime::watcher::{self, Event};
use kube::runtime::WatchStreamExt;
use kube::ResourceExt;
use tokio::sync::watch as shutdown;
use tracing::{debug, info, warn};

use crate::domain::ContainerState;
use crate::events::EventBus;

const ERROR_REASONS: &[&str] = &[
    "CrashLoopBackOff",
    "ErrImagePull",
    "ImagePullBackOff",
    "InvalidImageName",
    "CreateContainerConfigError",
    "CreateContainerError",
    "RunContainerError",
];

fn app_container_status(pod: &Pod, container: &str) -> Option<ContainerStatus> {
    pod.status
        .as_ref()?
        .container_statuses
        .as_ref()?
        .iter()
        .find(|s| s.name == container)
        .cloned()
}

/// Normalized state of the application container and an optional detail
pub fn pod_state(pod: &Pod, container: &str) -> (ContainerState, Option<String>) {
    if pod.metadata.deletion_timestamp.is_some() {
        return (ContainerState::Exited, Some("terminating".to_string()));
    }
    let status = app_container_status(pod, container);
    let state = status.as_ref().and_then(|s| s.state.as_ref());

    if let Some(waiting) = state.and_then(|s| s.waiting.as_ref()) {
        let reason = waiting.reason.clone().unwrap_or_default();
        if ERROR_REASONS.contains(&reason.as_str()) {
            let detail = waiting.message.clone().unwrap_or(reason);
            return (ContainerState::Errored, Some(detail));
        }
    }
    if let Some(terminated) = state.and_then(|s| s.terminated.as_ref()) {
        let detail = format!("exit code {}", terminated.exit_code);
        return if terminated.exit_code == 0 {
            (ContainerState::Exited, Some(detail))
        } else {
            (ContainerState::Errored, Some(detail))
        };
    }

    let phase = pod.status.as_ref().and_then(|s| s.phase.as_deref());
    match phase {
        Some("Running") if status.as_ref().is_some_and(|s| s.ready) => {
            (ContainerState::Running, None)
        }
        Some("Running") | Some("Pending") => (ContainerState::Starting, None),
        Some("Succeeded") => (ContainerState::Exited, None),
        Some("Failed") => (
            ContainerState::Errored,
            pod.status.as_ref().and_then(|s| s.message.clone()),
        ),
        _ => (ContainerState::Unknown, None),
    }
}

/// Watch application pods and publish start / stop transitions
///
/// Runs until `stop` flips to `true` or the watch stream ends.
pub(super) async fn watch_pods(
    api: Api<Pod>,
    selector: String,
    app_id_key: String,
    container: &'static str,
    bus: EventBus,
    mut stop: shutdown::Receiver<bool>,
) {
    let stream = watcher::watcher(api, watcher::Config::default().labels(&selector))
        .default_backoff();
    futures::pin_mut!(stream);
    let mut running: HashMap<String, bool> = HashMap::new();

    info!(%selector, "Starting pod watcher");
    loop {
        tokio::select! {
            changed = stop.changed() => {
                if changed.is_err() || *stop.borrow() {
                    break;
                }
            }
            next = stream.try_next() => match next {
                Ok(Some(Event::Apply(pod))) | Ok(Some(Event::InitApply(pod))) => {
                    let Some(app_id) = pod.labels().get(&app_id_key).cloned() else {
                        continue;
                    };
                    let is_running = pod_state(&pod, container).0.is_running();
                    let was_running = running.insert(app_id.clone(), is_running).unwrap_or(false);
                    if is_running != was_running {
                        debug!(%app_id, is_running, "Pod state changed");
                        bus.publish_container_event(is_running, &app_id);
                    }
                }
                Ok(Some(Event::Delete(pod))) => {
                    let Some(app_id) = pod.labels().get(&app_id_key).cloned() else {
                        continue;
                    };
                    if running.remove(&app_id).unwrap_or(false) {
                        bus.publish_container_event(false, &app_id);
                    }
                }
                Ok(Some(Event::Init)) | Ok(Some(Event::InitDone)) => {}
                Ok(None) => {
                    warn!("Pod watch stream ended");
                    break;
                }
                Err(e) => {
                    // backed off and retried on the next poll
                    warn!("Pod watch error: {}", e);
                }
            }
        }
    }
    info!("Pod watcher stopped");
}

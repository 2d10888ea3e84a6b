//! Container lifecycle events from the Docker Engine

use std::collections::HashMap;
use std::time::Duration;

use bollard::models::EventMessage;
use bollard::query_parameters::EventsOptions;
use bollard::Docker;
use futures::StreamExt;
use tokio::sync::watch as shutdown;
use tracing::{debug, info, warn};

use crate::events::EventBus;

/// Whether a Docker container action means started (`Some(true)`) or
/// stopped (`Some(false)`); other actions are ignored
pub fn action_running(action: &str) -> Option<bool> {
    match action {
        "start" | "unpause" => Some(true),
        "die" | "stop" | "kill" | "pause" | "destroy" => Some(false),
        _ => None,
    }
}

fn app_id_of<'a>(message: &'a EventMessage, app_id_key: &str) -> Option<&'a str> {
    message
        .actor
        .as_ref()?
        .attributes
        .as_ref()?
        .get(app_id_key)
        .map(String::as_str)
}

const MAX_RECONNECT_DELAY: Duration = Duration::from_secs(30);

/// Delay before reconnect attempt `attempt` (1-based): 1s, 2s, 4s, ... capped
pub(crate) fn reconnect_delay(attempt: u32) -> Duration {
    let secs = 2u64.saturating_pow(attempt.saturating_sub(1));
    Duration::from_secs(secs).min(MAX_RECONNECT_DELAY)
}

/// Record `action` for `app_id`, returning the transition to publish if any
///
/// die, stop and destroy arrive together for one removal; only the first
/// is reported. destroy forgets the container so a recreated one starts
/// from a clean slate.
pub(crate) fn record_action(
    running: &mut HashMap<String, bool>,
    action: &str,
    app_id: &str,
) -> Option<bool> {
    let is_running = action_running(action)?;
    let was_running = if action == "destroy" {
        running.remove(app_id)
    } else {
        running.insert(app_id.to_string(), is_running)
    };
    (was_running != Some(is_running)).then_some(is_running)
}

/// Relay start and stop events of managed containers onto `bus`
///
/// Reconnects with a growing delay whenever the engine closes the stream
/// or fails. Runs until `stop` flips to `true`.
pub(super) async fn watch_events(
    docker: Docker,
    selector: String,
    app_id_key: String,
    bus: EventBus,
    mut stop: shutdown::Receiver<bool>,
) {
    let filters = HashMap::from([
        ("type".to_string(), vec!["container".to_string()]),
        ("label".to_string(), vec![selector.clone()]),
    ]);
    let mut running: HashMap<String, bool> = HashMap::new();
    let mut attempt = 0u32;

    info!(%selector, "Starting Docker event watcher");
    'session: loop {
        let stream = docker.events(Some(EventsOptions {
            filters: Some(filters.clone()),
            ..Default::default()
        }));
        futures::pin_mut!(stream);

        loop {
            tokio::select! {
                changed = stop.changed() => {
                    if changed.is_err() || *stop.borrow() {
                        break 'session;
                    }
                }
                next = stream.next() => match next {
                    Some(Ok(message)) => {
                        attempt = 0;
                        let Some(action) = message.action.as_deref() else {
                            continue;
                        };
                        let Some(app_id) = app_id_of(&message, &app_id_key) else {
                            continue;
                        };
                        if let Some(is_running) = record_action(&mut running, action, app_id) {
                            debug!(%app_id, is_running, "Container state changed");
                            bus.publish_container_event(is_running, app_id);
                        }
                    }
                    Some(Err(e)) => {
                        warn!("Docker event stream error: {}", e);
                        break;
                    }
                    None => {
                        warn!("Docker event stream ended");
                        break;
                    }
                }
            }
        }

        attempt = attempt.saturating_add(1);
        let delay = reconnect_delay(attempt);
        debug!("Reconnecting to Docker events after {:?}", delay);
        tokio::select! {
            changed = stop.changed() => {
                if changed.is_err() || *stop.borrow() {
                    break 'session;
                }
            }
            _ = tokio::time::sleep(delay) => {}
        }
    }
    info!("Docker event watcher stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use bollard::models::EventActor;

    #[test]
    fn test_action_running() {
        assert_eq!(action_running("start"), Some(true));
        assert_eq!(action_running("die"), Some(false));
        assert_eq!(action_running("destroy"), Some(false));
        assert_eq!(action_running("exec_start"), None);
        assert_eq!(action_running("create"), None);
    }

    #[test]
    fn test_app_id_from_attributes() {
        let message = EventMessage {
            action: Some("start".to_string()),
            actor: Some(EventActor {
                id: Some("abc".to_string()),
                attributes: Some(HashMap::from([(
                    "ns.trap.jp.appId".to_string(),
                    "a1".to_string(),
                )])),
            }),
            ..Default::default()
        };
        assert_eq!(app_id_of(&message, "ns.trap.jp.appId"), Some("a1"));
        assert_eq!(app_id_of(&EventMessage::default(), "ns.trap.jp.appId"), None);
    }

    #[test]
    fn test_removal_burst_reports_one_stop() {
        let mut running = HashMap::new();
        assert_eq!(record_action(&mut running, "start", "a1"), Some(true));
        assert_eq!(record_action(&mut running, "kill", "a1"), Some(false));
        assert_eq!(record_action(&mut running, "die", "a1"), None);
        assert_eq!(record_action(&mut running, "destroy", "a1"), None);
        assert!(running.is_empty());
        assert_eq!(record_action(&mut running, "exec_start", "a1"), None);
    }

    #[test]
    fn test_recreated_container_is_reported_again() {
        let mut running = HashMap::new();
        record_action(&mut running, "start", "a1");
        record_action(&mut running, "destroy", "a1");
        assert!(!running.contains_key("a1"));
        assert_eq!(record_action(&mut running, "start", "a1"), Some(true));
    }

    #[test]
    fn test_reconnect_delay_grows_and_caps() {
        assert_eq!(reconnect_delay(1), Duration::from_secs(1));
        assert_eq!(reconnect_delay(2), Duration::from_secs(2));
        assert_eq!(reconnect_delay(4), Duration::from_secs(8));
        assert_eq!(reconnect_delay(6), MAX_RECONNECT_DELAY);
        assert_eq!(reconnect_delay(u32::MAX), MAX_RECONNECT_DELAY);
    }
}

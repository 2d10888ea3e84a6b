//! Normalized container state shared by both backends

use serde::{Deserialize, Serialize};

/// Platform-independent lifecycle state of an application's container
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ContainerState {
    /// No container exists for the application
    Missing,
    /// Created or scheduled, not serving yet
    Starting,
    Running,
    /// Stopped cleanly
    Exited,
    /// Crashed, failed to start, or stuck in a restart loop
    Errored,
    #[default]
    Unknown,
}

impl ContainerState {
    pub fn is_running(&self) -> bool {
        matches!(self, ContainerState::Running)
    }
}

impl std::fmt::Display for ContainerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ContainerState::Missing => "Missing",
            ContainerState::Starting => "Starting",
            ContainerState::Running => "Running",
            ContainerState::Exited => "Exited",
            ContainerState::Errored => "Errored",
            ContainerState::Unknown => "Unknown",
        };
        write!(f, "{}", s)
    }
}

/// Observed container of one application
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Container {
    pub application_id: String,
    pub state: ContainerState,
    /// Platform detail for non-running states (exit code, waiting reason)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl Container {
    pub fn new(application_id: impl Into<String>, state: ContainerState) -> Self {
        Self {
            application_id: application_id.into(),
            state,
            message: None,
        }
    }

    pub fn missing(application_id: impl Into<String>) -> Self {
        Self::new(application_id, ContainerState::Missing)
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }
}

//! Domain model of the deploy engine
//!
//! Applications, websites, port publications, operator-allocated domains and
//! ports, and the desired-state snapshots the backends reconcile.

mod application;
mod available;
mod container;
mod state;


pub use application::{
    is_valid_domain, is_valid_path_prefix, Application, ApplicationConfig, AuthenticationType,
    AutoShutdownConfig, BuildConfig, DeployType, PortProtocol, PortPublication, StartupBehavior,
    Website,
};
pub use available::{
    AvailableDomain, AvailableDomainSlice, AvailablePort, AvailablePortSlice, WildcardDomains,
};
pub use container::{Container, ContainerState};
pub use state::{DesiredState, DesiredStateLeader, RuntimeDesiredState, StaticSite};

/// Structured validation error for user-supplied objects
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ValidationError {
    pub field: String,
    pub message: String,
}

impl ValidationError {
    pub fn new(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            message: message.into(),
        }
    }
}

impl std::fmt::Display for ValidationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.field, self.message)
    }
}

impl std::error::Error for ValidationError {}

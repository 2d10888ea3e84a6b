//! Error types for the deploy engine

use thiserror::Error;

use crate::domain::ValidationError;

#[derive(Error, Debug)]
pub enum Error {
    /// Kubernetes API error
    #[error("Kubernetes error: {0}")]
    KubeError(#[from] kube::Error),

    /// Docker Engine API error
    #[error("Docker error: {0}")]
    DockerError(#[from] bollard::errors::Error),

    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),

    #[error("YAML error: {0}")]
    YamlError(#[from] serde_yaml::Error),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    /// Invalid operator configuration
    #[error("Configuration error: {0}")]
    ConfigError(String),

    /// Rejected user input; never retried
    #[error("Validation error: {0}")]
    ValidationError(String),

    #[error("Not found: {0}")]
    NotFound(String),

    /// Event stream could not be established
    #[error("Watch error: {0}")]
    WatchError(String),

    /// Exec session failed
    #[error("Exec error: {0}")]
    ExecError(String),
}

impl From<ValidationError> for Error {
    fn from(err: ValidationError) -> Self {
        Error::ValidationError(err.to_string())
    }
}

impl Error {
    /// Whether re-triggering the same operation may succeed
    pub fn is_retriable(&self) -> bool {
        match self {
            Error::KubeError(kube::Error::Api(resp)) => resp.code >= 500 || resp.code == 409,
            Error::KubeError(_) | Error::DockerError(_) | Error::IoError(_) => true,
            Error::WatchError(_) | Error::ExecError(_) => true,
            Error::SerializationError(_)
            | Error::YamlError(_)
            | Error::ConfigError(_)
            | Error::ValidationError(_)
            | Error::NotFound(_) => false,
        }
    }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

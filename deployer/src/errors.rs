//! Error types for fleetroll

use thiserror::Error;

/// Main error type for deploy operations
#[derive(Error, Debug)]
pub enum DeployError {
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    JsonError(#[from] serde_json::Error),

    #[error("YAML error: {0}")]
    YamlError(#[from] serde_yaml::Error),

    #[error("HTTP error: {0}")]
    HttpError(#[from] reqwest::Error),

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Provider error: {0}")]
    ProviderError(String),

    #[error("Connection error: {0}")]
    ConnectionError(String),

    #[error("Timeout error: {0}")]
    Timeout(String),

    #[error("Partial failure: {0}")]
    PartialFailure(String),

    #[error("{0}")]
    MigrationError(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("phase {phase} failed: {source}")]
    Phase {
        phase: String,
        #[source]
        source: Box<DeployError>,
    },

    #[error("Internal error: {0}")]
    Internal(String),
}

impl DeployError {
    /// Wrap an error with the name of the workflow phase it aborted
    pub fn in_phase(self, phase: impl ToString) -> Self {
        match self {
            err @ DeployError::Phase { .. } => err,
            err => DeployError::Phase {
                phase: phase.to_string(),
                source: Box::new(err),
            },
        }
    }

    /// The innermost error, skipping phase wrappers
    pub fn root(&self) -> &DeployError {
        match self {
            DeployError::Phase { source, .. } => source.root(),
            err => err,
        }
    }
}

impl From<openssh::Error> for DeployError {
    fn from(err: openssh::Error) -> Self {
        DeployError::ConnectionError(err.to_string())
    }
}

impl From<anyhow::Error> for DeployError {
    fn from(err: anyhow::Error) -> Self {
        DeployError::Internal(err.to_string())
    }
}

//! Error types for configuration loading and metric probes

/// Fatal configuration problem found while loading or resolving the config
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read configuration file: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to parse configuration file: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("invalid configuration: {0}")]
    Invalid(String),

    #[error("target '{target}': {message}")]
    InvalidTarget { target: String, message: String },
}

impl ConfigError {
    pub(crate) fn target(target: impl Into<String>, message: impl Into<String>) -> Self {
        ConfigError::InvalidTarget {
            target: target.into(),
            message: message.into(),
        }
    }
}

/// Failure to read a metric; never propagated past the sampler
#[derive(Debug, thiserror::Error)]
pub enum ProbeError {
    #[error("read timed out after {0:?}")]
    Timeout(std::time::Duration),

    #[error("probe unreachable: {0}")]
    Unreachable(String),

    #[error("probe task failed: {0}")]
    Task(String),

    #[error("{0}")]
    Unreadable(String),
}

impl From<reqwest::Error> for ProbeError {
    fn from(err: reqwest::Error) -> Self {
        ProbeError::Unreachable(err.to_string())
    }
}

impl From<tokio::task::JoinError> for ProbeError {
    fn from(err: tokio::task::JoinError) -> Self {
        ProbeError::Task(err.to_string())
    }
}

//! Common error types for tqbundle.

use thiserror::Error;

/// Common error type for tqbundle operations.
#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("Invalid scope: {0}")]
    InvalidScope(String),

    #[error("Unknown preset: {0}")]
    UnknownPreset(String),

    #[error("Sink forwarding failed: {0}")]
    SinkForwardingFailed(String),

    #[error("Invalid rule bundle: {0}")]
    RuleBundleInvalid(String),

    #[error("No evidence inputs available")]
    NoEvidence,

    #[error("Run cancelled")]
    Cancelled,

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("{0}")]
    Other(String),
}

/// Result type alias using common Error.
pub type Result<T> = std::result::Result<T, Error>;

impl From<anyhow::Error> for Error {
    fn from(e: anyhow::Error) -> Self {
        Error::Other(format!("{:#}", e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_anyhow_conversion_keeps_context() {
        let err = anyhow::anyhow!("root cause").context("Failed to launch converter");
        let converted: Error = err.into();
        let text = converted.to_string();
        assert!(text.contains("Failed to launch converter"));
        assert!(text.contains("root cause"));
    }
}

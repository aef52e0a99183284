//! Operator errors.

use thiserror::Error;

/// Errors raised by the resource operator.
#[derive(Debug, Error)]
pub enum OperatorError {
    #[error("template rendering failed: {0}")]
    Template(String),

    #[error("launch param missing required attribute: {0}")]
    MissingAttribute(String),

    #[error("cluster request failed: {0}")]
    Cluster(String),

    #[error("{0} not found")]
    NotFound(String),

    #[error("capacity query rejected: ({code}) {message}")]
    Capacity { code: i32, message: String },

    #[error("invalid operator config: {0}")]
    Config(String),

    #[error("failed to decode cluster response: {0}")]
    Decode(String),
}

impl From<reqwest::Error> for OperatorError {
    fn from(e: reqwest::Error) -> Self {
        Self::Cluster(e.to_string())
    }
}

impl From<serde_yaml::Error> for OperatorError {
    fn from(e: serde_yaml::Error) -> Self {
        Self::Decode(e.to_string())
    }
}

impl From<serde_json::Error> for OperatorError {
    fn from(e: serde_json::Error) -> Self {
        Self::Decode(e.to_string())
    }
}

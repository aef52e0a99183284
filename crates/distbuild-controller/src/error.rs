//! Controller errors.

use distbuild_core::WorkId;
use thiserror::Error;

/// Errors raised inside the controller daemon.
#[derive(Debug, Error)]
pub enum ControllerError {
    #[error("work not found: {0}")]
    WorkNotFound(WorkId),

    #[error("slot admission cancelled")]
    AdmissionCancelled,

    #[error("failed to start subprocess: {0}")]
    Spawn(#[from] std::io::Error),

    #[error("subprocess ran past the {0}s io timeout")]
    IoTimeout(u64),

    #[error("remote dispatch failed: {0}")]
    Remote(String),

    #[error("invalid request: {0}")]
    InvalidParam(String),
}

impl From<reqwest::Error> for ControllerError {
    fn from(e: reqwest::Error) -> Self {
        Self::Remote(e.to_string())
    }
}

//! Booster errors.

use distbuild_core::CoreError;
use thiserror::Error;

/// Errors surfaced by the booster client.
#[derive(Debug, Error)]
pub enum BoosterError {
    #[error("failed to read {path}: {source}")]
    FileRead {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to decode action chain: {0}")]
    ChainDecode(#[from] serde_json::Error),

    #[error(transparent)]
    Core(#[from] CoreError),

    #[error("controller request failed: {0}")]
    Controller(String),

    #[error("no actions ready to run while {unfinished} remain unfinished")]
    NoActionsToRun { unfinished: usize },

    #[error("gave up waiting for action results after {0} seconds")]
    OverMaxWait(u64),
}

impl From<reqwest::Error> for BoosterError {
    fn from(e: reqwest::Error) -> Self {
        Self::Controller(e.to_string())
    }
}

//! Core domain errors and the execution error taxonomy.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Classification of a failed execution attempt, consumed by the retry
/// policy. `None` means the attempt did not fail at the transport or
/// process level (the exit code still carries the tool's own verdict).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// No execution-level error.
    #[default]
    None,
    /// Subprocess could not start or failed in local mode.
    LocalExec,
    /// RPC failed or the remote worker reported a failure.
    RemoteExec,
    /// The controller has no such work id; self-healing path applies.
    WorkMissing,
    /// A bounded wait was exhausted.
    Timeout,
}

impl ErrorKind {
    /// Returns true if the executor may recover from this kind by itself.
    pub fn is_recoverable(&self) -> bool {
        matches!(self, Self::RemoteExec | Self::WorkMissing)
    }
}

/// Core domain errors for distbuild.
#[derive(Debug, Error)]
pub enum CoreError {
    /// Two actions share one identity.
    #[error("duplicate action index: {0}")]
    DuplicateAction(String),

    /// A dependency references an identity that is not in the chain.
    #[error("action {action} depends on unknown action {dep}")]
    UnknownDependency { action: String, dep: String },

    /// The dependency closure is not acyclic.
    #[error("dependency cycle involving action {0}")]
    DependencyCycle(String),

    /// Malformed input file or request body.
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// Invalid configuration (ports, selectors, budgets).
    #[error("invalid config: {0}")]
    InvalidConfig(String),

    /// Serialization error.
    #[error("serialization error: {0}")]
    Serialization(String),
}

impl From<serde_json::Error> for CoreError {
    fn from(e: serde_json::Error) -> Self {
        Self::Serialization(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_kind_recoverable() {
        assert!(ErrorKind::RemoteExec.is_recoverable());
        assert!(ErrorKind::WorkMissing.is_recoverable());
        assert!(!ErrorKind::LocalExec.is_recoverable());
        assert!(!ErrorKind::None.is_recoverable());
    }

    #[test]
    fn test_error_kind_wire_format() {
        let json = serde_json::to_string(&ErrorKind::WorkMissing).unwrap();
        assert_eq!(json, r#""work_missing""#);
    }
}

//! Server errors.

use distbuild_operator::OperatorError;
use thiserror::Error;

/// Errors raised by the apply/release flow.
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("task not found: {0}")]
    TaskNotFound(String),

    /// Releasing a task that already reached a terminal state. Callers
    /// treat the message as a success reply.
    #[error("task is already terminated")]
    TaskAlreadyTerminated,

    /// Releasing a task id with no live record. Also a success reply.
    #[error("unterminated task no found")]
    UnterminatedTaskNotFound,

    #[error("invalid param: {0}")]
    InvalidParam(String),

    #[error("cluster apply ran past {0}s")]
    ResourceTimeout(u64),

    #[error(transparent)]
    Operator(#[from] OperatorError),
}

impl ServerError {
    /// Release errors the caller receives verbatim as success.
    pub fn is_benign_release(&self) -> bool {
        matches!(
            self,
            Self::TaskAlreadyTerminated | Self::UnterminatedTaskNotFound
        )
    }
}

use thiserror::Error;

use crate::model::{SessionId, SessionStatus};

#[derive(Error, Debug)]
pub enum DupError {
    #[error("invalid input: {0}")]
    InvalidInput(String),
    #[error("check {0} not found")]
    SessionNotFound(SessionId),
    #[error("check {id} is {status} and cannot be stepped")]
    SessionClosed { id: SessionId, status: SessionStatus },
    #[error("no duplicate check in progress")]
    NoActiveCheck,
    #[error("persistence error: {0}")]
    Persistence(String),
    #[error("judge error: {0}")]
    Judge(String),
}

pub type Result<T> = std::result::Result<T, DupError>;

/// Whether the caller driving a check should retry the failed call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryHint {
    Transient,
    Terminal,
}

impl RetryHint {
    pub fn as_str(&self) -> &'static str {
        match self {
            RetryHint::Transient => "transient",
            RetryHint::Terminal => "terminal",
        }
    }
}

impl DupError {
    pub fn invalid(msg: impl Into<String>) -> Self {
        Self::InvalidInput(msg.into())
    }

    pub fn persistence(err: impl ToString) -> Self {
        Self::Persistence(err.to_string())
    }

    pub fn retry_hint(&self) -> RetryHint {
        match self {
            DupError::Persistence(_) | DupError::Judge(_) => RetryHint::Transient,
            DupError::InvalidInput(_)
            | DupError::SessionNotFound(_)
            | DupError::SessionClosed { .. }
            | DupError::NoActiveCheck => RetryHint::Terminal,
        }
    }
}

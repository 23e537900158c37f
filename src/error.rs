//! Error types for the simulation broker.
//!
//! Every adapter and session operation reports failures as a [`SimError`],
//! which carries a machine-readable [`ErrorKind`] and a human-readable message.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Convenience alias used throughout the crate.
pub type Result<T, E = SimError> = std::result::Result<T, E>;

/// Classification of a [`SimError`], stable across messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    NotFound,
    InvalidConfig,
    InvalidState,
    AlreadyRunning,
    ResourceExhausted,
    AccessDenied,
    Unsupported,
    Transport,
    InvalidArgument,
    Cancelled,
    Internal,
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ErrorKind::NotFound => "not_found",
            ErrorKind::InvalidConfig => "invalid_config",
            ErrorKind::InvalidState => "invalid_state",
            ErrorKind::AlreadyRunning => "already_running",
            ErrorKind::ResourceExhausted => "resource_exhausted",
            ErrorKind::AccessDenied => "access_denied",
            ErrorKind::Unsupported => "unsupported",
            ErrorKind::Transport => "transport",
            ErrorKind::InvalidArgument => "invalid_argument",
            ErrorKind::Cancelled => "cancelled",
            ErrorKind::Internal => "internal",
        };
        f.write_str(s)
    }
}

/// Errors surfaced by adapters and the session service.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SimError {
    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Invalid board configuration: {0}")]
    InvalidConfig(String),

    #[error("Invalid state: {0}")]
    InvalidState(String),

    #[error("Already running: {0}")]
    AlreadyRunning(String),

    #[error("Resource exhausted: {0}")]
    ResourceExhausted(String),

    #[error("Access denied: {0}")]
    AccessDenied(String),

    #[error("Not supported: {0}")]
    Unsupported(String),

    #[error("Transport failure: {0}")]
    Transport(String),

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Operation cancelled: {0}")]
    Cancelled(String),

    #[error("Engine error: {0}")]
    Internal(String),
}

impl SimError {
    /// The kind of this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            SimError::NotFound(_) => ErrorKind::NotFound,
            SimError::InvalidConfig(_) => ErrorKind::InvalidConfig,
            SimError::InvalidState(_) => ErrorKind::InvalidState,
            SimError::AlreadyRunning(_) => ErrorKind::AlreadyRunning,
            SimError::ResourceExhausted(_) => ErrorKind::ResourceExhausted,
            SimError::AccessDenied(_) => ErrorKind::AccessDenied,
            SimError::Unsupported(_) => ErrorKind::Unsupported,
            SimError::Transport(_) => ErrorKind::Transport,
            SimError::InvalidArgument(_) => ErrorKind::InvalidArgument,
            SimError::Cancelled(_) => ErrorKind::Cancelled,
            SimError::Internal(_) => ErrorKind::Internal,
        }
    }

    /// Whether this error means the backing engine can no longer be trusted.
    ///
    /// Fatal errors move the owning session to `error`.
    pub fn is_fatal(&self) -> bool {
        matches!(self, SimError::Internal(_) | SimError::NotFound(_))
    }

    pub(crate) fn instance_not_found(instance_id: &str) -> Self {
        SimError::NotFound(format!("instance {instance_id}"))
    }
}

impl From<std::io::Error> for SimError {
    fn from(e: std::io::Error) -> Self {
        SimError::Internal(e.to_string())
    }
}

impl From<serde_json::Error> for SimError {
    fn from(e: serde_json::Error) -> Self {
        SimError::InvalidConfig(e.to_string())
    }
}

impl From<tokio::task::JoinError> for SimError {
    fn from(e: tokio::task::JoinError) -> Self {
        SimError::Internal(format!("background task failed: {e}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_matches_variant() {
        assert_eq!(SimError::NotFound("x".into()).kind(), ErrorKind::NotFound);
        assert_eq!(
            SimError::AlreadyRunning("x".into()).kind(),
            ErrorKind::AlreadyRunning
        );
        assert_eq!(ErrorKind::ResourceExhausted.to_string(), "resource_exhausted");
    }

    #[test]
    fn test_fatal_classification() {
        assert!(SimError::Internal("crash".into()).is_fatal());
        assert!(!SimError::InvalidState("paused".into()).is_fatal());
        assert!(!SimError::AlreadyRunning("on".into()).is_fatal());
    }

    #[test]
    fn test_json_error_is_invalid_config() {
        let err: SimError = serde_json::from_str::<u32>("nope").unwrap_err().into();
        assert_eq!(err.kind(), ErrorKind::InvalidConfig);
    }
}

//! Session records and request types.

use crate::adapters::{BackendAdapter, BackendType};
use crate::board::ResourceConfig;
use crate::error::{Result, SimError};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use std::sync::Arc;

/// Lifecycle status of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    /// Instance allocated, engine not started.
    Created,
    Running,
    /// Engine alive but execution suspended.
    Paused,
    /// Engine powered off.
    Stopped,
    /// An adapter call failed fatally; only deletion is allowed.
    Error,
    Destroyed,
}

impl SessionStatus {
    /// Statuses from which no power action is possible.
    pub fn is_terminal(self) -> bool {
        matches!(self, SessionStatus::Error | SessionStatus::Destroyed)
    }
}

impl std::fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SessionStatus::Created => write!(f, "created"),
            SessionStatus::Running => write!(f, "running"),
            SessionStatus::Paused => write!(f, "paused"),
            SessionStatus::Stopped => write!(f, "stopped"),
            SessionStatus::Error => write!(f, "error"),
            SessionStatus::Destroyed => write!(f, "destroyed"),
        }
    }
}

/// Durable session record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Session {
    pub id: String,
    pub name: String,
    pub backend: BackendType,
    pub status: SessionStatus,
    /// Board configuration as JSON text.
    pub board_config: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub instance_id: String,
    pub user_id: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Process-local binding of a session to its adapter and instance.
#[derive(Clone)]
pub struct SessionRuntime {
    pub session_id: String,
    pub user_id: String,
    pub adapter: Arc<dyn BackendAdapter>,
    pub instance_id: String,
}

impl std::fmt::Debug for SessionRuntime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionRuntime")
            .field("session_id", &self.session_id)
            .field("user_id", &self.user_id)
            .field("backend", &self.adapter.backend_type())
            .field("instance_id", &self.instance_id)
            .finish()
    }
}

/// Power control action.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PowerAction {
    On,
    Off,
    Reset,
    Pause,
    Resume,
}

impl PowerAction {
    /// Status after a successful `self` from `from`, or why it is not allowed.
    pub fn target(self, from: SessionStatus) -> Result<SessionStatus> {
        use SessionStatus::*;
        match (self, from) {
            (PowerAction::On, Created | Stopped) => Ok(Running),
            (PowerAction::On, Running | Paused) => {
                Err(SimError::AlreadyRunning(format!("session is {from}")))
            }
            (PowerAction::Off, Running | Paused) => Ok(Stopped),
            (PowerAction::Reset, Running | Stopped | Paused) => Ok(from),
            (PowerAction::Pause, Running) => Ok(Paused),
            (PowerAction::Resume, Paused) => Ok(Running),
            (action, from) => Err(SimError::InvalidState(format!(
                "cannot {action} a session that is {from}"
            ))),
        }
    }
}

impl std::fmt::Display for PowerAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PowerAction::On => write!(f, "on"),
            PowerAction::Off => write!(f, "off"),
            PowerAction::Reset => write!(f, "reset"),
            PowerAction::Pause => write!(f, "pause"),
            PowerAction::Resume => write!(f, "resume"),
        }
    }
}

impl FromStr for PowerAction {
    type Err = SimError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "on" => Ok(PowerAction::On),
            "off" => Ok(PowerAction::Off),
            "reset" => Ok(PowerAction::Reset),
            "pause" => Ok(PowerAction::Pause),
            "resume" => Ok(PowerAction::Resume),
            other => Err(SimError::InvalidArgument(format!(
                "invalid power action: {other}"
            ))),
        }
    }
}

/// Identity on whose behalf a session operation runs.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Caller {
    pub user_id: String,
}

impl Caller {
    pub fn new(user_id: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
        }
    }

    pub fn anonymous() -> Self {
        Self::new("anonymous")
    }

    pub fn owns(&self, user_id: &str) -> bool {
        self.user_id == user_id
    }
}

/// Parameters of a new session.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CreateSessionRequest {
    pub name: String,
    /// Defaults to the service's primary backend.
    #[serde(default)]
    pub backend: Option<BackendType>,
    /// Inline board configuration (JSON text). Takes precedence over the template.
    #[serde(default)]
    pub board_config: Option<String>,
    #[serde(default)]
    pub board_template: Option<String>,
    #[serde(default)]
    pub resources: ResourceConfig,
}

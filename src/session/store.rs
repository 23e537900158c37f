//! Persistence boundary for session records and board templates.

use super::types::{Session, SessionStatus};
use crate::adapters::BackendType;
use crate::error::{Result, SimError};
use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tokio::sync::RwLock;

/// Board configuration stored under a name.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BoardTemplate {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub backend: BackendType,
    /// Board configuration as JSON text.
    pub config: String,
    #[serde(default)]
    pub tags: Vec<String>,
}

/// Key-based storage the session service reads and writes.
#[async_trait]
pub trait SessionStore: Send + Sync {
    async fn insert_session(&self, session: &Session) -> Result<()>;

    async fn get_session(&self, session_id: &str) -> Result<Session>;

    async fn update_status(&self, session_id: &str, status: SessionStatus) -> Result<()>;

    async fn delete_session(&self, session_id: &str) -> Result<()>;

    /// Sessions newest first, optionally restricted to one user.
    async fn list_sessions(&self, user_id: Option<&str>) -> Result<Vec<Session>>;

    /// Serialized board configuration of a template.
    async fn get_template(&self, template_id: &str) -> Result<String>;

    async fn put_template(&self, template: BoardTemplate) -> Result<()>;
}

/// In-process [`SessionStore`].
#[derive(Debug, Default)]
pub struct MemoryStore {
    sessions: RwLock<HashMap<String, Session>>,
    templates: RwLock<HashMap<String, BoardTemplate>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// A store preloaded with the stock board templates.
    pub fn seeded() -> Self {
        let templates = stock_templates()
            .into_iter()
            .map(|t| (t.id.clone(), t))
            .collect();
        Self {
            sessions: RwLock::new(HashMap::new()),
            templates: RwLock::new(templates),
        }
    }
}

fn stock_templates() -> Vec<BoardTemplate> {
    vec![BoardTemplate {
        id: "stm32f4-disco".to_string(),
        name: "STM32F4 Discovery".to_string(),
        description: "STM32F4 Discovery board with Cortex-M4".to_string(),
        backend: BackendType::Qemu,
        config: r#"{"system_id":"stm32f4-disco","name":"STM32F4 Discovery","nodes":[{"id":"mcu","backend":"qemu","processor":{"type":"ARM Cortex-M4","cores":1,"frequency":168000000},"memory":[{"type":"Flash","address":134217728,"size":1048576,"access":"RX"},{"type":"RAM","address":536870912,"size":196608,"access":"RW"}],"peripherals":[{"type":"UART","name":"USART2","address":1073759232},{"type":"GPIO","name":"GPIOD","address":1073889280}]}]}"#.to_string(),
        tags: vec!["stm32".to_string(), "arm".to_string(), "cortex-m4".to_string()],
    }]
}

fn session_not_found(session_id: &str) -> SimError {
    SimError::NotFound(format!("session {session_id}"))
}

#[async_trait]
impl SessionStore for MemoryStore {
    async fn insert_session(&self, session: &Session) -> Result<()> {
        let mut sessions = self.sessions.write().await;
        if sessions.contains_key(&session.id) {
            return Err(SimError::InvalidState(format!(
                "session {} already stored",
                session.id
            )));
        }
        sessions.insert(session.id.clone(), session.clone());
        Ok(())
    }

    async fn get_session(&self, session_id: &str) -> Result<Session> {
        self.sessions
            .read()
            .await
            .get(session_id)
            .cloned()
            .ok_or_else(|| session_not_found(session_id))
    }

    async fn update_status(&self, session_id: &str, status: SessionStatus) -> Result<()> {
        let mut sessions = self.sessions.write().await;
        let session = sessions
            .get_mut(session_id)
            .ok_or_else(|| session_not_found(session_id))?;
        session.status = status;
        session.updated_at = Utc::now();
        Ok(())
    }

    async fn delete_session(&self, session_id: &str) -> Result<()> {
        self.sessions
            .write()
            .await
            .remove(session_id)
            .map(|_| ())
            .ok_or_else(|| session_not_found(session_id))
    }

    async fn list_sessions(&self, user_id: Option<&str>) -> Result<Vec<Session>> {
        let sessions = self.sessions.read().await;
        let mut list: Vec<Session> = sessions
            .values()
            .filter(|s| user_id.map_or(true, |u| s.user_id == u))
            .cloned()
            .collect();
        list.sort_by(|a, b| b.created_at.cmp(&a.created_at).then_with(|| a.id.cmp(&b.id)));
        Ok(list)
    }

    async fn get_template(&self, template_id: &str) -> Result<String> {
        self.templates
            .read()
            .await
            .get(template_id)
            .map(|t| t.config.clone())
            .ok_or_else(|| SimError::NotFound(format!("board template {template_id}")))
    }

    async fn put_template(&self, template: BoardTemplate) -> Result<()> {
        self.templates
            .write()
            .await
            .insert(template.id.clone(), template);
        Ok(())
    }
}

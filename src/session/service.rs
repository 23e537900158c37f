//! Session lifecycle over the registered backend adapters.

use super::store::SessionStore;
use super::types::{
    Caller, CreateSessionRequest, PowerAction, Session, SessionRuntime, SessionStatus,
};
use crate::adapters::{BackendAdapter, BackendType, FeatureFlags, Limits, OpContext};
use crate::board::BoardConfig;
use crate::error::{ErrorKind, Result, SimError};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{info, warn};
use uuid::Uuid;

/// Features and limits of one backend, as shown in the capability matrix.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackendSummary {
    pub features: FeatureFlags,
    pub limits: Limits,
}

/// Which backends offer which processors, peripherals and buses.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CapabilityMatrix {
    pub processors: BTreeMap<String, Vec<BackendType>>,
    pub peripherals: BTreeMap<String, Vec<BackendType>>,
    pub buses: BTreeMap<String, Vec<BackendType>>,
    pub backends: BTreeMap<BackendType, BackendSummary>,
}

/// Creates, routes and tears down sessions.
///
/// Holds the session → runtime index under its own lock; the lock is always
/// released before an adapter is called.
pub struct SessionService {
    store: Arc<dyn SessionStore>,
    default_backend: BackendType,
    adapters: RwLock<HashMap<BackendType, Arc<dyn BackendAdapter>>>,
    sessions: RwLock<HashMap<String, SessionRuntime>>,
}

impl SessionService {
    pub fn new(store: Arc<dyn SessionStore>, default_backend: BackendType) -> Self {
        Self {
            store,
            default_backend,
            adapters: RwLock::new(HashMap::new()),
            sessions: RwLock::new(HashMap::new()),
        }
    }

    /// Register `adapter` for its backend, replacing any previous one.
    pub async fn register_adapter(&self, adapter: Arc<dyn BackendAdapter>) {
        let backend = adapter.backend_type();
        self.adapters.write().await.insert(backend, adapter);
        info!(backend = %backend, "Adapter registered");
    }

    async fn adapter_for(&self, backend: BackendType) -> Result<Arc<dyn BackendAdapter>> {
        self.adapters
            .read()
            .await
            .get(&backend)
            .cloned()
            .ok_or_else(|| SimError::Unsupported(format!("backend not registered: {backend}")))
    }

    async fn resolve_board(&self, request: &CreateSessionRequest) -> Result<BoardConfig> {
        let text = match (&request.board_config, &request.board_template) {
            (Some(inline), _) => inline.clone(),
            (None, Some(template)) => self.store.get_template(template).await?,
            (None, None) => {
                return Err(SimError::InvalidArgument(
                    "either board_config or board_template is required".to_string(),
                ))
            }
        };
        BoardConfig::from_json(&text)
    }

    /// Create a session and its instance.
    ///
    /// If the record cannot be persisted the instance is destroyed again, so a
    /// failed create leaves nothing behind.
    pub async fn create_session(
        &self,
        ctx: &OpContext,
        caller: &Caller,
        request: CreateSessionRequest,
    ) -> Result<Session> {
        ctx.check("create session")?;
        if request.name.trim().is_empty() {
            return Err(SimError::InvalidArgument("session name is required".to_string()));
        }
        let backend = request.backend.unwrap_or(self.default_backend);
        let adapter = self.adapter_for(backend).await?;
        let board = self.resolve_board(&request).await?;
        let board_config = board.to_json()?;

        let session_id = Uuid::new_v4().to_string();
        let instance_id = adapter
            .create_instance(ctx, &session_id, &board, &request.resources)
            .await?;

        let now = Utc::now();
        let session = Session {
            id: session_id.clone(),
            name: request.name,
            backend,
            status: SessionStatus::Created,
            board_config,
            instance_id: instance_id.clone(),
            user_id: caller.user_id.clone(),
            created_at: now,
            updated_at: now,
        };

        if let Err(e) = self.store.insert_session(&session).await {
            warn!(session_id = %session_id, error = %e, "Failed to persist session, destroying instance");
            if let Err(destroy_err) = adapter
                .destroy_instance(&OpContext::background(), &instance_id)
                .await
            {
                warn!(instance_id = %instance_id, error = %destroy_err, "Cleanup destroy failed");
            }
            return Err(e);
        }

        self.sessions.write().await.insert(
            session_id.clone(),
            SessionRuntime {
                session_id: session_id.clone(),
                user_id: caller.user_id.clone(),
                adapter,
                instance_id: instance_id.clone(),
            },
        );

        info!(
            session_id = %session_id,
            instance_id = %instance_id,
            backend = %backend,
            user_id = %caller.user_id,
            "Session created"
        );
        Ok(session)
    }

    /// Load a session record the caller owns.
    pub async fn get_session(&self, caller: &Caller, session_id: &str) -> Result<Session> {
        let session = self.store.get_session(session_id).await?;
        if !caller.owns(&session.user_id) {
            return Err(SimError::NotFound(format!("session {session_id}")));
        }
        Ok(session)
    }

    /// The caller's sessions, newest first.
    pub async fn list_sessions(&self, caller: &Caller) -> Result<Vec<Session>> {
        self.store.list_sessions(Some(&caller.user_id)).await
    }

    /// Tear down a session. Instance destruction is best-effort; the record is
    /// removed even if the adapter fails.
    pub async fn delete_session(
        &self,
        ctx: &OpContext,
        caller: &Caller,
        session_id: &str,
    ) -> Result<()> {
        let runtime = {
            let mut sessions = self.sessions.write().await;
            match sessions.get(session_id).map(|rt| caller.owns(&rt.user_id)) {
                Some(false) => {
                    return Err(SimError::NotFound(format!("session {session_id}")));
                }
                Some(true) => sessions.remove(session_id),
                None => None,
            }
        };

        match runtime {
            Some(rt) => {
                if let Err(e) = rt.adapter.destroy_instance(ctx, &rt.instance_id).await {
                    warn!(
                        session_id = %session_id,
                        instance_id = %rt.instance_id,
                        error = %e,
                        "Failed to destroy instance, deleting session anyway"
                    );
                }
            }
            None => {
                self.get_session(caller, session_id).await?;
            }
        }

        self.store.delete_session(session_id).await?;
        info!(session_id = %session_id, user_id = %caller.user_id, "Session deleted");
        Ok(())
    }

    /// Apply a power action and persist the resulting status.
    pub async fn power_control(
        &self,
        ctx: &OpContext,
        caller: &Caller,
        session_id: &str,
        action: PowerAction,
    ) -> Result<Session> {
        let (adapter, instance_id) = self.get_adapter(caller, session_id).await?;
        let session = self.store.get_session(session_id).await?;
        let target = action.target(session.status)?;

        let result = match action {
            PowerAction::On => adapter.power_on(ctx, &instance_id).await,
            PowerAction::Off => adapter.power_off(ctx, &instance_id).await,
            PowerAction::Reset => adapter.reset(ctx, &instance_id).await,
            PowerAction::Pause => adapter.suspend(ctx, &instance_id).await,
            PowerAction::Resume => adapter.resume(ctx, &instance_id).await,
        };

        if let Err(e) = result {
            if e.is_fatal() {
                self.mark_error(session_id, &e).await;
            }
            return Err(e);
        }

        if target != session.status {
            self.store.update_status(session_id, target).await?;
            info!(
                session_id = %session_id,
                action = %action,
                from = %session.status,
                to = %target,
                "Session status changed"
            );
        }
        self.store.get_session(session_id).await
    }

    /// Route to the adapter and instance bound to a session.
    ///
    /// Reads only the in-memory index, never the store.
    pub async fn get_adapter(
        &self,
        caller: &Caller,
        session_id: &str,
    ) -> Result<(Arc<dyn BackendAdapter>, String)> {
        let sessions = self.sessions.read().await;
        match sessions.get(session_id) {
            Some(rt) if caller.owns(&rt.user_id) => Ok((rt.adapter.clone(), rt.instance_id.clone())),
            _ => Err(SimError::NotFound(format!(
                "no runtime bound to session {session_id}"
            ))),
        }
    }

    /// Record the outcome of an adapter call routed through
    /// [`get_adapter`](Self::get_adapter); an engine failure moves the session to `error`.
    pub async fn observe<T: Send + Sync>(&self, session_id: &str, result: &Result<T>) {
        if let Err(e) = result {
            if e.kind() == ErrorKind::Internal {
                self.mark_error(session_id, e).await;
            }
        }
    }

    async fn mark_error(&self, session_id: &str, cause: &SimError) {
        warn!(session_id = %session_id, error = %cause, "Session moved to error");
        if let Err(e) = self
            .store
            .update_status(session_id, SessionStatus::Error)
            .await
        {
            warn!(session_id = %session_id, error = %e, "Failed to record error status");
        }
    }

    /// Aggregate capability report across registered adapters.
    pub async fn capabilities(&self) -> CapabilityMatrix {
        let adapters = self.adapters.read().await;
        let mut matrix = CapabilityMatrix::default();
        let mut backends: Vec<_> = adapters.keys().copied().collect();
        backends.sort();

        for backend in backends {
            let Some(adapter) = adapters.get(&backend) else {
                continue;
            };
            let caps = adapter.capabilities();
            for processor in caps.processors {
                matrix.processors.entry(processor).or_default().push(backend);
            }
            for peripheral in caps.peripherals {
                matrix.peripherals.entry(peripheral).or_default().push(backend);
            }
            for bus in caps.buses {
                matrix.buses.entry(bus).or_default().push(backend);
            }
            matrix.backends.insert(
                backend,
                BackendSummary {
                    features: caps.features,
                    limits: caps.limits,
                },
            );
        }
        matrix
    }

    /// Mark persisted sessions that have no runtime in this process as `error`.
    ///
    /// Run once at start-up; returns the number of sessions marked.
    pub async fn reconcile(&self) -> Result<usize> {
        let persisted = self.store.list_sessions(None).await?;
        let sessions = self.sessions.read().await;
        let mut marked = 0;
        for session in persisted {
            if session.status.is_terminal() || sessions.contains_key(&session.id) {
                continue;
            }
            warn!(
                session_id = %session.id,
                status = %session.status,
                "Session has no runtime after restart, marking error"
            );
            self.store
                .update_status(&session.id, SessionStatus::Error)
                .await?;
            marked += 1;
        }
        Ok(marked)
    }

    /// Number of sessions with a live runtime.
    pub async fn runtime_count(&self) -> usize {
        self.sessions.read().await.len()
    }

    /// Destroy every instance and drop every runtime. Records are marked `destroyed`.
    pub async fn shutdown_all(&self, ctx: &OpContext) {
        let runtimes: Vec<SessionRuntime> = self.sessions.write().await.drain().map(|(_, rt)| rt).collect();
        for rt in runtimes {
            if let Err(e) = rt.adapter.destroy_instance(ctx, &rt.instance_id).await {
                warn!(session_id = %rt.session_id, error = %e, "Failed to destroy instance during shutdown");
            }
            if let Err(e) = self
                .store
                .update_status(&rt.session_id, SessionStatus::Destroyed)
                .await
            {
                warn!(session_id = %rt.session_id, error = %e, "Failed to record shutdown");
            }
        }
        info!("All sessions shut down");
    }
}

impl std::fmt::Debug for SessionService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionService")
            .field("default_backend", &self.default_backend)
            .finish_non_exhaustive()
    }
}

//! Adapter-private instance state.

use super::console::ConsoleHub;
use super::debugger::{BreakpointTable, DebugLink};
use super::process::EngineProcess;
use super::program::ProgramImage;
use super::{BackendType, InstanceInfo, PortSet, ProgramInfo, ProgramState, SnapshotInfo};
use crate::board::{BoardConfig, NodeConfig, ResourceConfig};
use crate::error::{Result, SimError};
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::path::PathBuf;
use tracing::warn;

/// One simulated machine owned by an adapter.
///
/// Guarded by its own mutex; the adapter table lock is only held to look an
/// instance up, insert it or remove it.
#[derive(Debug)]
pub(crate) struct Instance {
    pub id: String,
    pub session_id: String,
    pub backend: BackendType,
    pub board: BoardConfig,
    /// The node this backend drives.
    pub node_id: String,
    pub resources: ResourceConfig,
    pub ports: PortSet,
    pub process: Option<EngineProcess>,
    pub running: bool,
    pub suspended: bool,
    /// Whether the target was executing when the instance was suspended.
    pub resume_running: bool,
    /// Set once the instance has left the adapter table.
    pub destroyed: bool,
    pub programs: Vec<ProgramInfo>,
    pub images: HashMap<String, ProgramImage>,
    /// Program currently running or paused.
    pub active_program: Option<String>,
    /// Debug connection to the engine; present while powered on.
    pub link: Option<DebugLink>,
    pub breakpoints: BreakpointTable,
    /// Engine execution log of the traced program.
    pub trace_log: Option<PathBuf>,
    pub snapshots: Vec<SnapshotInfo>,
    pub next_program: u64,
    pub next_snapshot: u64,
    pub console: ConsoleHub,
    pub work_dir: PathBuf,
    pub created_at: DateTime<Utc>,
}

impl Instance {
    pub fn node(&self) -> Result<&NodeConfig> {
        self.board.node(&self.node_id).ok_or_else(|| {
            SimError::Internal(format!("{}: node {} vanished", self.id, self.node_id))
        })
    }

    pub fn info(&self) -> InstanceInfo {
        InstanceInfo {
            id: self.id.clone(),
            session_id: self.session_id.clone(),
            backend: self.backend,
            ports: self.ports,
            running: self.running,
            suspended: self.suspended,
            pid: self.process.as_ref().and_then(|p| p.pid()),
            programs: self.programs.len(),
            created_at: self.created_at,
        }
    }

    /// Surface an engine that died since the last call.
    ///
    /// The instance is marked powered off so the crash is reported once and a
    /// later power-on can start a fresh engine.
    pub fn check_engine(&mut self) -> Result<()> {
        let Some(reason) = self.process.as_ref().and_then(|p| p.exit_reason()) else {
            return Ok(());
        };
        self.process = None;
        self.running = false;
        self.suspended = false;
        self.resume_running = false;
        self.stop_active_program();
        self.link = None;
        warn!(instance_id = %self.id, reason = %reason, "Engine is gone");
        Err(SimError::Internal(format!("engine for {} {reason}", self.id)))
    }

    /// Check the engine, then require the instance to be powered on.
    pub fn require_running(&mut self, what: &str) -> Result<()> {
        self.check_engine()?;
        if !self.running {
            return Err(SimError::InvalidState(format!(
                "{what} requires a powered-on instance; {} is off",
                self.id
            )));
        }
        Ok(())
    }

    /// The debug link of a powered-on instance.
    pub fn link_mut(&mut self) -> Result<&mut DebugLink> {
        let id = &self.id;
        self.link.as_mut().ok_or_else(|| {
            SimError::Transport(format!("{id} has no debug connection to its engine"))
        })
    }

    /// The debug link together with the breakpoints it enforces.
    pub fn debug_parts(&mut self) -> Result<(&mut DebugLink, &mut BreakpointTable)> {
        match self.link.as_mut() {
            Some(link) => Ok((link, &mut self.breakpoints)),
            None => Err(SimError::Transport(format!(
                "{} has no debug connection to its engine",
                self.id
            ))),
        }
    }

    pub fn program_mut(&mut self, program_id: &str) -> Result<&mut ProgramInfo> {
        self.programs
            .iter_mut()
            .find(|p| p.id == program_id)
            .ok_or_else(|| SimError::NotFound(format!("program {program_id} on {}", self.id)))
    }

    pub fn stop_active_program(&mut self) {
        if let Some(active) = self.active_program.take() {
            if let Some(program) = self.programs.iter_mut().find(|p| p.id == active) {
                program.state = ProgramState::Stopped;
            }
        }
    }
}

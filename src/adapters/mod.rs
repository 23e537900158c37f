//! Backend adapters: one uniform contract over heterogeneous simulators.
//!
//! # Architecture
//!
//! ```text
//! ┌───────────────────────────────────────────────────────────────┐
//! │ dyn BackendAdapter                                            │
//! │   EngineAdapter<Qemu>   EngineAdapter<Renode>   EngineAdapter<SkyEye>
//! │     ├─ instances: RwLock<HashMap<id, Arc<Mutex<Instance>>>>   │
//! │     │    Instance ─ ports, programs, breakpoints, ConsoleHub, │
//! │     │               EngineProcess (supervised child)          │
//! │     │               DebugLink ── GDB remote protocol ─▶ engine│
//! │     └─ ports: Arc<PortAllocator>   (shared by all adapters)   │
//! └───────────────────────────────────────────────────────────────┘
//! ```
//!
//! The engine-specific part of each backend (capability report, endpoint
//! layout and launch synthesis) lives behind the [`Engine`] trait; the
//! instance table, lifecycle state machine and debug semantics are shared by
//! [`EngineAdapter`].
//!
//! Execution state lives in the engine. Debug, register and memory
//! operations travel over the engine's GDB stub; reset, snapshots, program
//! loading and tracing go through its monitor console. The board's memory
//! map is only used to reject requests before they reach the engine.

mod console;
mod debugger;
mod engine;
mod gdb;
mod instance;
mod monitor;
mod port_allocator;
mod process;
mod program;
mod qemu;
mod renode;
mod skyeye;
mod target;

use crate::board::{BoardConfig, ResourceConfig};
use crate::config::BrokerConfig;
use crate::error::{Result, SimError};
use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

pub use console::{ConsoleHub, ConsoleStream};
pub use debugger::{StopInfo, StopReason};
pub use engine::{
    Engine, EngineAdapter, LaunchPlan, LaunchSpec, MonitorAction, PortLayout, SetupStep,
    TraceEvent,
};
pub use port_allocator::{PortAllocator, DEFAULT_PORT_RANGE_END, DEFAULT_PORT_RANGE_START};
pub use qemu::{qemu_cpu_model, Qemu};
pub use renode::Renode;
pub use skyeye::SkyEye;
pub use target::CpuFamily;

/// Adapter backed by a spawned QEMU process.
pub type QemuAdapter = EngineAdapter<Qemu>;
/// Adapter backed by a script-driven Renode process.
pub type RenodeAdapter = EngineAdapter<Renode>;
/// Adapter backed by the SkyEye simulator binary.
pub type SkyEyeAdapter = EngineAdapter<SkyEye>;

/// Simulation backend kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendType {
    Qemu,
    Renode,
    SkyEye,
}

impl BackendType {
    pub const ALL: [BackendType; 3] = [BackendType::Qemu, BackendType::Renode, BackendType::SkyEye];

    pub fn as_str(self) -> &'static str {
        match self {
            BackendType::Qemu => "qemu",
            BackendType::Renode => "renode",
            BackendType::SkyEye => "skyeye",
        }
    }
}

impl std::fmt::Display for BackendType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BackendType {
    type Err = SimError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "qemu" => Ok(BackendType::Qemu),
            "renode" => Ok(BackendType::Renode),
            "skyeye" => Ok(BackendType::SkyEye),
            other => Err(SimError::InvalidArgument(format!("unknown backend: {other}"))),
        }
    }
}

/// Per-call context carrying cancellation.
#[derive(Debug, Clone, Default)]
pub struct OpContext {
    token: CancellationToken,
}

impl OpContext {
    /// A context that is never cancelled unless [`OpContext::cancel`] is called.
    pub fn background() -> Self {
        Self::default()
    }

    pub fn with_token(token: CancellationToken) -> Self {
        Self { token }
    }

    pub fn token(&self) -> &CancellationToken {
        &self.token
    }

    pub fn cancel(&self) {
        self.token.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Fail fast if the caller has already given up.
    pub fn check(&self, what: &str) -> Result<()> {
        if self.is_cancelled() {
            Err(SimError::Cancelled(what.to_string()))
        } else {
            Ok(())
        }
    }
}

/// Boolean feature flags of a backend.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeatureFlags {
    pub gdb_support: bool,
    pub snapshot: bool,
    pub coverage: bool,
    pub trace: bool,
    pub multicore: bool,
    pub shared_memory: bool,
    pub peripheral_model: bool,
    pub python_scripting: bool,
}

/// Numeric limits of a backend.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Limits {
    pub max_cores: u32,
    pub max_memory_gb: u64,
    pub max_peripherals: u32,
    pub max_hw_breakpoints: u32,
}

/// Static capability report of a backend.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Capabilities {
    pub backend: BackendType,
    pub processors: Vec<String>,
    pub peripherals: Vec<String>,
    pub buses: Vec<String>,
    pub features: FeatureFlags,
    pub limits: Limits,
}

impl Capabilities {
    pub fn supports_processor(&self, name: &str) -> bool {
        self.processors.iter().any(|p| p.eq_ignore_ascii_case(name))
    }
}

/// Ports bound to one instance. Absent entries are endpoints the engine lacks.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortSet {
    pub debug: Option<u16>,
    pub console: Option<u16>,
    pub monitor: Option<u16>,
}

impl PortSet {
    pub fn all(&self) -> Vec<u16> {
        [self.debug, self.console, self.monitor]
            .into_iter()
            .flatten()
            .collect()
    }
}

/// Read-only view of an instance.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstanceInfo {
    pub id: String,
    pub session_id: String,
    pub backend: BackendType,
    pub ports: PortSet,
    pub running: bool,
    pub suspended: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pid: Option<u32>,
    pub programs: usize,
    pub created_at: DateTime<Utc>,
}

/// Program image format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ProgramFormat {
    Elf,
    Bin,
    Hex,
}

/// Metadata supplied with an uploaded program.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgramMetadata {
    pub name: String,
    #[serde(rename = "type")]
    pub format: ProgramFormat,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub entry_point: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub load_addr: Option<u64>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub metadata: BTreeMap<String, String>,
}

/// Options for starting a program.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StartOptions {
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    /// Halt at the entry point until a debugger continues.
    #[serde(default)]
    pub wait_for_gdb: bool,
    #[serde(default)]
    pub enable_trace: bool,
}

/// Lifecycle state of a program inside an instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProgramState {
    Uploaded,
    Running,
    Paused,
    Stopped,
}

/// A program known to an instance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgramInfo {
    pub id: String,
    pub metadata: ProgramMetadata,
    pub path: PathBuf,
    pub size: u64,
    pub entry: u64,
    pub state: ProgramState,
}

/// Breakpoint implementation kind.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BreakpointKind {
    Hardware,
    #[default]
    Software,
}

fn default_enabled() -> bool {
    true
}

/// Breakpoint request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BreakpointSpec {
    pub address: u64,
    #[serde(rename = "type", default)]
    pub kind: BreakpointKind,
    /// Optional `<register> <op> <value>` guard, e.g. `r0 == 0x10`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub condition: Option<String>,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

impl BreakpointSpec {
    pub fn software(address: u64) -> Self {
        Self {
            address,
            kind: BreakpointKind::Software,
            condition: None,
            enabled: true,
        }
    }

    pub fn hardware(address: u64) -> Self {
        Self {
            kind: BreakpointKind::Hardware,
            ..Self::software(address)
        }
    }
}

/// An installed breakpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Breakpoint {
    pub id: String,
    #[serde(flatten)]
    pub spec: BreakpointSpec,
    pub hits: u64,
}

/// Which registers a read covers.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RegisterScope {
    #[default]
    All,
    General,
    Control,
}

impl FromStr for RegisterScope {
    type Err = SimError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "" | "all" => Ok(RegisterScope::All),
            "general" | "gpr" => Ok(RegisterScope::General),
            "control" | "special" => Ok(RegisterScope::Control),
            other => Err(SimError::InvalidArgument(format!(
                "unknown register scope: {other}"
            ))),
        }
    }
}

/// A stored snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SnapshotInfo {
    pub id: String,
    pub instance_id: String,
    pub path: PathBuf,
    pub bytes: u64,
    pub created_at: DateTime<Utc>,
}

/// Kind of exported analysis artifact.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ArtifactKind {
    Coverage,
    Trace,
}

/// Reference to an exported artifact, retrieved out of band.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArtifactRef {
    pub kind: ArtifactKind,
    pub path: PathBuf,
    pub bytes: u64,
}

/// The contract every simulation backend implements.
///
/// Instances are addressed by the ID returned from
/// [`create_instance`](BackendAdapter::create_instance); the adapter owns them
/// exclusively. Calls on different instances never block each other.
#[async_trait]
pub trait BackendAdapter: Send + Sync {
    fn backend_type(&self) -> BackendType;

    fn capabilities(&self) -> Capabilities;

    // Instance management

    /// Register an instance for `session_id` and reserve its ports.
    /// The engine is not started until [`power_on`](BackendAdapter::power_on).
    async fn create_instance(
        &self,
        ctx: &OpContext,
        session_id: &str,
        board: &BoardConfig,
        resources: &ResourceConfig,
    ) -> Result<String>;

    /// Kill the engine if live and release every resource of the instance.
    async fn destroy_instance(&self, ctx: &OpContext, instance_id: &str) -> Result<()>;

    async fn instance_info(&self, instance_id: &str) -> Result<InstanceInfo>;

    async fn list_instances(&self) -> Vec<InstanceInfo>;

    // Power management

    async fn power_on(&self, ctx: &OpContext, instance_id: &str) -> Result<()>;
    async fn power_off(&self, ctx: &OpContext, instance_id: &str) -> Result<()>;
    async fn reset(&self, ctx: &OpContext, instance_id: &str) -> Result<()>;
    async fn suspend(&self, ctx: &OpContext, instance_id: &str) -> Result<()>;
    async fn resume(&self, ctx: &OpContext, instance_id: &str) -> Result<()>;

    // Program management

    async fn upload_program(
        &self,
        ctx: &OpContext,
        instance_id: &str,
        image: Bytes,
        metadata: ProgramMetadata,
    ) -> Result<String>;
    async fn start_program(
        &self,
        ctx: &OpContext,
        instance_id: &str,
        program_id: &str,
        options: &StartOptions,
    ) -> Result<()>;
    async fn pause_program(&self, ctx: &OpContext, instance_id: &str, program_id: &str)
        -> Result<()>;
    async fn stop_program(&self, ctx: &OpContext, instance_id: &str, program_id: &str)
        -> Result<()>;
    async fn list_programs(&self, instance_id: &str) -> Result<Vec<ProgramInfo>>;

    // Debug operations

    async fn set_breakpoint(
        &self,
        ctx: &OpContext,
        instance_id: &str,
        spec: &BreakpointSpec,
    ) -> Result<String>;
    async fn remove_breakpoint(
        &self,
        ctx: &OpContext,
        instance_id: &str,
        breakpoint_id: &str,
    ) -> Result<()>;
    async fn list_breakpoints(&self, instance_id: &str) -> Result<Vec<Breakpoint>>;
    async fn step_instruction(&self, ctx: &OpContext, instance_id: &str) -> Result<StopInfo>;
    async fn continue_execution(&self, ctx: &OpContext, instance_id: &str) -> Result<StopInfo>;

    // State inspection

    async fn read_registers(
        &self,
        ctx: &OpContext,
        instance_id: &str,
        scope: RegisterScope,
    ) -> Result<BTreeMap<String, u64>>;
    async fn write_register(
        &self,
        ctx: &OpContext,
        instance_id: &str,
        register: &str,
        value: u64,
    ) -> Result<()>;
    async fn read_memory(
        &self,
        ctx: &OpContext,
        instance_id: &str,
        address: u64,
        size: u32,
    ) -> Result<Vec<u8>>;
    async fn write_memory(
        &self,
        ctx: &OpContext,
        instance_id: &str,
        address: u64,
        data: &[u8],
    ) -> Result<()>;

    // Snapshots

    async fn create_snapshot(&self, ctx: &OpContext, instance_id: &str) -> Result<String>;
    async fn restore_snapshot(
        &self,
        ctx: &OpContext,
        instance_id: &str,
        snapshot_id: &str,
    ) -> Result<()>;
    async fn list_snapshots(&self, instance_id: &str) -> Result<Vec<SnapshotInfo>>;

    // Analysis

    async fn export_coverage(&self, ctx: &OpContext, instance_id: &str) -> Result<ArtifactRef>;
    async fn export_trace(&self, ctx: &OpContext, instance_id: &str) -> Result<ArtifactRef>;

    // Bridges

    /// `host:port` of the instance's GDB remote endpoint.
    async fn gdb_server_address(&self, instance_id: &str) -> Result<String>;

    /// Live console output; dropping the stream detaches without side effects.
    async fn console_stream(&self, instance_id: &str) -> Result<ConsoleStream>;
}

/// Build one adapter per backend, all sharing `ports`.
pub fn build_adapters(
    config: &BrokerConfig,
    ports: Arc<PortAllocator>,
) -> Vec<Arc<dyn BackendAdapter>> {
    vec![
        Arc::new(QemuAdapter::new(Qemu, config, ports.clone())),
        Arc::new(RenodeAdapter::new(Renode, config, ports.clone())),
        Arc::new(SkyEyeAdapter::new(SkyEye, config, ports)),
    ]
}

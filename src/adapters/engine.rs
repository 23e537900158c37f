//! The adapter contract implemented once over per-engine profiles.

use super::console::ConsoleHub;
use super::debugger::{DebugLink, StopInfo, StopReason};
use super::instance::Instance;
use super::monitor::run_script;
use super::port_allocator::PortAllocator;
use super::process::EngineProcess;
use super::program::parse_image;
use super::target::{check_access, Access, Condition, CpuFamily, MAX_TRANSFER};
use super::{
    ArtifactKind, ArtifactRef, BackendAdapter, BackendType, Breakpoint, BreakpointKind,
    BreakpointSpec, Capabilities, ConsoleStream, InstanceInfo, OpContext, PortSet, ProgramFormat,
    ProgramInfo, ProgramMetadata, ProgramState, RegisterScope, SnapshotInfo, StartOptions,
};
use crate::board::{BoardConfig, NodeConfig, ResourceConfig};
use crate::config::{BrokerConfig, EngineBinaries};
use crate::error::{Result, SimError};
use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::process::Command;
use tokio::sync::{Mutex, OwnedMutexGuard, RwLock};
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Most recent execution-log entries kept in a trace export.
const TRACE_LIMIT: usize = 100_000;

/// Which network endpoints an engine exposes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PortLayout {
    pub debug: bool,
    pub console: bool,
    pub monitor: bool,
}

impl PortLayout {
    pub fn count(&self) -> usize {
        [self.debug, self.console, self.monitor]
            .into_iter()
            .filter(|b| *b)
            .count()
    }
}

/// Engine operations carried out through the monitor console.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MonitorAction<'a> {
    Reset,
    SaveSnapshot { tag: &'a str, path: &'a Path },
    LoadSnapshot { tag: &'a str, path: &'a Path },
    LoadProgram {
        path: &'a Path,
        format: ProgramFormat,
        load_addr: u64,
    },
    /// Start writing executed addresses to `path`.
    StartTrace { path: &'a Path },
}

/// Inputs for launch synthesis.
#[derive(Debug, Clone, Copy)]
pub struct LaunchSpec<'a> {
    pub instance_id: &'a str,
    pub board: &'a BoardConfig,
    pub node: &'a NodeConfig,
    pub ports: PortSet,
    pub work_dir: &'a Path,
    pub binaries: &'a EngineBinaries,
}

/// A command run before the engine starts; skipped once `creates` exists.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SetupStep {
    pub program: String,
    pub args: Vec<String>,
    pub creates: PathBuf,
}

/// A concrete engine invocation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LaunchPlan {
    pub program: String,
    pub args: Vec<String>,
    /// Generated files written before spawning, as (path, contents).
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub files: Vec<(PathBuf, String)>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub setup: Vec<SetupStep>,
    /// TCP port serving the target's serial console, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub console_port: Option<u16>,
}

/// Engine-specific part of a backend.
pub trait Engine: Send + Sync + 'static {
    fn backend(&self) -> BackendType;

    fn capabilities(&self) -> Capabilities;

    fn port_layout(&self) -> PortLayout;

    /// Translate a board into an engine invocation.
    fn launch_plan(&self, spec: &LaunchSpec<'_>) -> Result<LaunchPlan>;

    /// Text every monitor prompt ends with.
    fn monitor_prompt(&self) -> &'static str {
        "> "
    }

    /// Monitor commands performing `action`, or `None` if the engine cannot.
    fn monitor_script(
        &self,
        _instance_id: &str,
        _ports: PortSet,
        _action: MonitorAction<'_>,
    ) -> Option<Vec<String>> {
        None
    }

    /// Whether a monitor answer reports a failure.
    fn monitor_failed(output: &str) -> bool
    where
        Self: Sized,
    {
        output.to_ascii_lowercase().contains("error")
    }

    /// Restoring a snapshot replaces the emulation, GDB stub included.
    fn reattach_after_restore(&self) -> bool {
        false
    }

    /// Program counter recorded on one line of the execution log.
    fn trace_pc(&self, _line: &str) -> Option<u64> {
        None
    }
}

#[derive(Serialize, Deserialize)]
struct SnapshotFile {
    id: String,
    instance_id: String,
    created_at: DateTime<Utc>,
    /// Name of the snapshot inside the engine.
    tag: String,
    /// Engine state file, for engines that save to a path.
    state: PathBuf,
    programs: Vec<ProgramInfo>,
    active_program: Option<String>,
}

#[derive(Serialize)]
struct CoverageReport<'a> {
    instance_id: &'a str,
    backend: BackendType,
    generated_at: DateTime<Utc>,
    log: &'a Path,
    executed: usize,
    addresses: Vec<u64>,
}

/// One executed block from the engine's execution log.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TraceEvent {
    pub seq: u64,
    pub pc: u64,
}

#[derive(Serialize)]
struct TraceReport<'a> {
    instance_id: &'a str,
    backend: BackendType,
    generated_at: DateTime<Utc>,
    log: &'a Path,
    events: Vec<TraceEvent>,
}

/// Split `<instance>/snap-<n>` into its parts.
fn parse_snapshot_id(snapshot_id: &str) -> Option<(&str, u64)> {
    let (owner, n) = snapshot_id.rsplit_once("/snap-")?;
    Some((owner, n.parse().ok()?))
}

fn family_of(inst: &Instance) -> Result<CpuFamily> {
    Ok(CpuFamily::from_processor(&inst.node()?.processor.kind))
}

/// A [`BackendAdapter`] driving one kind of engine.
pub struct EngineAdapter<E: Engine> {
    engine: E,
    config: BrokerConfig,
    ports: Arc<PortAllocator>,
    instances: RwLock<HashMap<String, Arc<Mutex<Instance>>>>,
}

impl<E: Engine> EngineAdapter<E> {
    pub fn new(engine: E, config: &BrokerConfig, ports: Arc<PortAllocator>) -> Self {
        Self {
            engine,
            config: config.clone(),
            ports,
            instances: RwLock::new(HashMap::new()),
        }
    }

    pub fn engine(&self) -> &E {
        &self.engine
    }

    /// Number of live instances.
    pub async fn instance_count(&self) -> usize {
        self.instances.read().await.len()
    }

    /// The invocation PowerOn would run for `instance_id`, without spawning.
    pub async fn launch_plan(&self, instance_id: &str) -> Result<LaunchPlan> {
        let inst = self.lock_instance(instance_id).await?;
        self.plan_for(&inst)
    }

    fn plan_for(&self, inst: &Instance) -> Result<LaunchPlan> {
        let spec = LaunchSpec {
            instance_id: &inst.id,
            board: &inst.board,
            node: inst.node()?,
            ports: inst.ports,
            work_dir: &inst.work_dir,
            binaries: &self.config.binaries,
        };
        self.engine.launch_plan(&spec)
    }

    async fn lock_instance(&self, instance_id: &str) -> Result<OwnedMutexGuard<Instance>> {
        let handle = {
            let instances = self.instances.read().await;
            instances
                .get(instance_id)
                .cloned()
                .ok_or_else(|| SimError::instance_not_found(instance_id))?
        };
        let inst = handle.lock_owned().await;
        if inst.destroyed {
            return Err(SimError::instance_not_found(instance_id));
        }
        Ok(inst)
    }

    fn check_limits(&self, node: &NodeConfig, resources: &ResourceConfig) -> Result<()> {
        let limits = self.engine.capabilities().limits;
        let backend = self.engine.backend();
        let memory_mib = node.total_memory_mib();

        if node.processor.cores > limits.max_cores {
            return Err(SimError::InvalidConfig(format!(
                "node {} needs {} cores, {backend} supports {}",
                node.id, node.processor.cores, limits.max_cores
            )));
        }
        if memory_mib > limits.max_memory_gb.saturating_mul(1024) {
            return Err(SimError::InvalidConfig(format!(
                "node {} declares {memory_mib} MiB, {backend} supports {} GiB",
                node.id, limits.max_memory_gb
            )));
        }
        if node.peripherals.len() > limits.max_peripherals as usize {
            return Err(SimError::InvalidConfig(format!(
                "node {} declares {} peripherals, {backend} supports {}",
                node.id,
                node.peripherals.len(),
                limits.max_peripherals
            )));
        }
        if let Some(cores) = resources.cpu_limit() {
            if node.processor.cores > cores {
                return Err(SimError::InvalidConfig(format!(
                    "node {} needs {} cores, resource limit is {cores}",
                    node.id, node.processor.cores
                )));
            }
        }
        if let Some(limit) = resources.memory_limit_mb() {
            if memory_mib > limit {
                return Err(SimError::InvalidConfig(format!(
                    "node {} declares {memory_mib} MiB, resource limit is {limit} MiB",
                    node.id
                )));
            }
        }
        Ok(())
    }

    fn require_feature(&self, enabled: bool, what: &str) -> Result<()> {
        if enabled {
            Ok(())
        } else {
            Err(SimError::Unsupported(format!(
                "{what} on {}",
                self.engine.backend()
            )))
        }
    }

    /// Run the monitor script for `action`; `Unsupported` if the engine has none.
    async fn monitor(&self, inst: &Instance, action: MonitorAction<'_>) -> Result<()> {
        let script = self
            .engine
            .monitor_script(&inst.id, inst.ports, action)
            .ok_or_else(|| {
                SimError::Unsupported(format!("{action:?} on {}", self.engine.backend()))
            })?;
        let port = inst.ports.monitor.ok_or_else(|| {
            SimError::Unsupported(format!("{} has no monitor", self.engine.backend()))
        })?;
        run_script(
            port,
            self.engine.monitor_prompt(),
            &script,
            self.config.debug_timeout(),
            E::monitor_failed,
        )
        .await?;
        Ok(())
    }

    async fn run_setup(&self, plan: &LaunchPlan, work_dir: &Path) -> Result<()> {
        for step in &plan.setup {
            if tokio::fs::metadata(&step.creates).await.is_ok() {
                continue;
            }
            let output = Command::new(&step.program)
                .args(&step.args)
                .current_dir(work_dir)
                .output()
                .await
                .map_err(|e| SimError::Internal(format!("failed to run {}: {e}", step.program)))?;
            if !output.status.success() {
                return Err(SimError::Internal(format!(
                    "{} failed ({}): {}",
                    step.program,
                    output.status,
                    String::from_utf8_lossy(&output.stderr).trim()
                )));
            }
            debug!(program = %step.program, creates = %step.creates.display(), "Setup step done");
        }
        Ok(())
    }

    async fn attach(&self, ctx: &OpContext, inst: &Instance) -> Result<DebugLink> {
        let port = inst.ports.debug.ok_or_else(|| {
            SimError::Unsupported(format!("{} has no debug transport", self.engine.backend()))
        })?;
        let deadline = Instant::now() + self.config.debug_attach_timeout();
        tokio::select! {
            link = DebugLink::attach(
                port,
                family_of(inst)?,
                deadline,
                self.config.debug_timeout(),
                inst.console.clone(),
                &inst.breakpoints,
            ) => link,
            _ = ctx.token().cancelled() => Err(SimError::Cancelled("power on".to_string())),
        }
    }

    /// Start the engine and connect the debug link. Nothing is left behind
    /// on failure.
    async fn boot(&self, ctx: &OpContext, inst: &mut Instance) -> Result<()> {
        let plan = self.plan_for(inst)?;
        tokio::fs::create_dir_all(&inst.work_dir).await?;
        for (path, contents) in &plan.files {
            tokio::fs::write(path, contents).await?;
        }
        self.run_setup(&plan, &inst.work_dir).await?;

        let mut process = EngineProcess::spawn(
            &plan,
            &self.config.binaries.launcher_prefix,
            &inst.work_dir,
            inst.console.clone(),
            inst.resources.timeout(),
            &inst.id,
        )?;
        let started = match process
            .wait_for_early_exit(self.config.startup_grace(), ctx)
            .await
        {
            Ok(()) => self.attach(ctx, inst).await,
            Err(e) => Err(e),
        };
        let mut link = match started {
            Ok(link) => link,
            Err(e) => {
                process.shutdown(self.config.shutdown_timeout()).await;
                warn!(instance_id = %inst.id, error = %e, "Power on rolled back");
                return Err(e);
            }
        };

        let boots_from_rom = inst
            .board
            .boot
            .as_ref()
            .is_some_and(|b| b.bootrom.is_some());
        if boots_from_rom {
            if let Err(e) = link.run(&inst.breakpoints).await {
                process.shutdown(self.config.shutdown_timeout()).await;
                return Err(e);
            }
        }

        inst.process = Some(process);
        inst.link = Some(link);
        inst.running = true;
        inst.suspended = false;
        Ok(())
    }

    async fn halt_engine(&self, inst: &mut Instance) {
        inst.link = None;
        if let Some(mut process) = inst.process.take() {
            process.shutdown(self.config.shutdown_timeout()).await;
        }
        inst.running = false;
        inst.suspended = false;
    }

    async fn write_artifact(
        &self,
        inst: &Instance,
        kind: ArtifactKind,
        body: Vec<u8>,
    ) -> Result<ArtifactRef> {
        let dir = self.config.instance_artifact_dir(inst.backend, &inst.id);
        tokio::fs::create_dir_all(&dir).await?;
        let stem = match kind {
            ArtifactKind::Coverage => "coverage",
            ArtifactKind::Trace => "trace",
        };
        let path = dir.join(format!(
            "{stem}-{}.json",
            Utc::now().format("%Y%m%dT%H%M%S%.3f")
        ));
        tokio::fs::write(&path, &body).await?;
        info!(instance_id = %inst.id, path = %path.display(), "Artifact exported");
        Ok(ArtifactRef {
            kind,
            path,
            bytes: body.len() as u64,
        })
    }

    /// Executed addresses from the instance's execution log, oldest first.
    async fn executed(&self, inst: &Instance) -> Result<(PathBuf, Vec<u64>)> {
        let log = inst.trace_log.clone().ok_or_else(|| {
            SimError::InvalidState(format!(
                "{} has no execution log; start a program with enable_trace",
                inst.id
            ))
        })?;
        let text = match tokio::fs::read_to_string(&log).await {
            Ok(text) => text,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => String::new(),
            Err(e) => return Err(e.into()),
        };
        let pcs = text.lines().filter_map(|l| self.engine.trace_pc(l)).collect();
        Ok((log, pcs))
    }

    fn after_stop(inst: &mut Instance, stop: &StopInfo) {
        if matches!(stop.reason, StopReason::Exited { .. }) {
            inst.stop_active_program();
        }
    }
}

#[async_trait]
impl<E: Engine> BackendAdapter for EngineAdapter<E> {
    fn backend_type(&self) -> BackendType {
        self.engine.backend()
    }

    fn capabilities(&self) -> Capabilities {
        self.engine.capabilities()
    }

    async fn create_instance(
        &self,
        ctx: &OpContext,
        session_id: &str,
        board: &BoardConfig,
        resources: &ResourceConfig,
    ) -> Result<String> {
        ctx.check("create instance")?;
        let backend = self.engine.backend();
        if session_id.trim().is_empty() {
            return Err(SimError::InvalidArgument("empty session id".to_string()));
        }

        board.validate()?;
        let node = board.primary_node(backend).ok_or_else(|| {
            SimError::InvalidConfig(format!("board {} has no {backend} node", board.system_id))
        })?;
        self.check_limits(node, resources)?;
        if !self.engine.capabilities().supports_processor(&node.processor.kind) {
            info!(
                backend = %backend,
                processor = %node.processor.kind,
                "Processor not in capability list, engine default CPU model will be used"
            );
        }

        let instance_id = format!("{backend}-{session_id}");
        let mut instances = self.instances.write().await;
        if instances.contains_key(&instance_id) {
            return Err(SimError::InvalidState(format!(
                "instance {instance_id} already exists"
            )));
        }
        if instances.len() >= self.config.max_instances_per_backend {
            return Err(SimError::ResourceExhausted(format!(
                "{backend} already hosts {} instances",
                instances.len()
            )));
        }

        let layout = self.engine.port_layout();
        let mut allocated = self.ports.allocate_many(layout.count())?.into_iter();
        let ports = PortSet {
            debug: layout.debug.then(|| allocated.next()).flatten(),
            console: layout.console.then(|| allocated.next()).flatten(),
            monitor: layout.monitor.then(|| allocated.next()).flatten(),
        };

        let instance = Instance {
            id: instance_id.clone(),
            session_id: session_id.to_string(),
            backend,
            board: board.clone(),
            node_id: node.id.clone(),
            resources: *resources,
            ports,
            process: None,
            running: false,
            suspended: false,
            resume_running: false,
            destroyed: false,
            programs: Vec::new(),
            images: HashMap::new(),
            active_program: None,
            link: None,
            breakpoints: Default::default(),
            trace_log: None,
            snapshots: Vec::new(),
            next_program: 1,
            next_snapshot: 1,
            console: ConsoleHub::new(),
            work_dir: self.config.instance_work_dir(backend, &instance_id),
            created_at: Utc::now(),
        };
        instances.insert(instance_id.clone(), Arc::new(Mutex::new(instance)));

        info!(
            instance_id = %instance_id,
            session_id = %session_id,
            ports = ?ports,
            "Instance created"
        );
        Ok(instance_id)
    }

    async fn destroy_instance(&self, _ctx: &OpContext, instance_id: &str) -> Result<()> {
        let handle = {
            let mut instances = self.instances.write().await;
            instances
                .remove(instance_id)
                .ok_or_else(|| SimError::instance_not_found(instance_id))?
        };

        let mut inst = handle.lock().await;
        inst.destroyed = true;
        self.halt_engine(&mut inst).await;
        self.ports.release_all(&inst.ports.all());
        inst.console.close();

        if let Err(e) = tokio::fs::remove_dir_all(&inst.work_dir).await {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!(instance_id = %instance_id, error = %e, "Failed to remove work directory");
            }
        }
        info!(instance_id = %instance_id, "Instance destroyed");
        Ok(())
    }

    async fn instance_info(&self, instance_id: &str) -> Result<InstanceInfo> {
        let inst = self.lock_instance(instance_id).await?;
        Ok(inst.info())
    }

    async fn list_instances(&self) -> Vec<InstanceInfo> {
        let handles: Vec<_> = self.instances.read().await.values().cloned().collect();
        let mut infos = Vec::with_capacity(handles.len());
        for handle in handles {
            let inst = handle.lock().await;
            if !inst.destroyed {
                infos.push(inst.info());
            }
        }
        infos.sort_by(|a, b| a.id.cmp(&b.id));
        infos
    }

    async fn power_on(&self, ctx: &OpContext, instance_id: &str) -> Result<()> {
        ctx.check("power on")?;
        let mut inst = self.lock_instance(instance_id).await?;
        inst.check_engine()?;
        if inst.running {
            return Err(SimError::AlreadyRunning(instance_id.to_string()));
        }

        self.boot(ctx, &mut inst).await?;
        inst.console.note("powered on");
        info!(instance_id = %instance_id, "Instance powered on");
        Ok(())
    }

    async fn power_off(&self, ctx: &OpContext, instance_id: &str) -> Result<()> {
        ctx.check("power off")?;
        let mut inst = self.lock_instance(instance_id).await?;
        inst.require_running("power off")?;

        self.halt_engine(&mut inst).await;
        inst.stop_active_program();
        inst.console.note("powered off");
        info!(instance_id = %instance_id, "Instance powered off");
        Ok(())
    }

    async fn reset(&self, ctx: &OpContext, instance_id: &str) -> Result<()> {
        ctx.check("reset")?;
        let mut inst = self.lock_instance(instance_id).await?;
        inst.check_engine()?;

        inst.stop_active_program();
        if inst.running {
            let suspended = inst.suspended;
            if self.engine.port_layout().monitor {
                self.monitor(&inst, MonitorAction::Reset).await?;
            } else {
                // No monitor to reset through: restart the engine.
                self.halt_engine(&mut inst).await;
                self.boot(ctx, &mut inst).await?;
                inst.suspended = suspended;
            }
        }
        inst.console.note("reset");
        info!(instance_id = %instance_id, running = inst.running, "Instance reset");
        Ok(())
    }

    async fn suspend(&self, ctx: &OpContext, instance_id: &str) -> Result<()> {
        ctx.check("suspend")?;
        let mut inst = self.lock_instance(instance_id).await?;
        inst.require_running("suspend")?;
        if inst.suspended {
            return Err(SimError::InvalidState(format!(
                "{instance_id} is already suspended"
            )));
        }
        let link = inst.link_mut()?;
        let was_running = link.is_running();
        link.pause().await?;
        inst.resume_running = was_running;
        inst.suspended = true;
        info!(instance_id = %instance_id, "Instance suspended");
        Ok(())
    }

    async fn resume(&self, ctx: &OpContext, instance_id: &str) -> Result<()> {
        ctx.check("resume")?;
        let mut inst = self.lock_instance(instance_id).await?;
        inst.require_running("resume")?;
        if !inst.suspended {
            return Err(SimError::InvalidState(format!("{instance_id} is not suspended")));
        }
        if inst.resume_running {
            let (link, breakpoints) = inst.debug_parts()?;
            link.run(breakpoints).await?;
        }
        inst.suspended = false;
        info!(instance_id = %instance_id, "Instance resumed");
        Ok(())
    }

    async fn upload_program(
        &self,
        ctx: &OpContext,
        instance_id: &str,
        image: Bytes,
        metadata: ProgramMetadata,
    ) -> Result<String> {
        ctx.check("upload program")?;
        let mut inst = self.lock_instance(instance_id).await?;
        inst.check_engine()?;

        let parsed = parse_image(&image, &metadata)?;
        {
            let node = inst.node()?;
            for segment in &parsed.segments {
                let len = segment.data.len() as u64;
                if node.region_containing(segment.address, len).is_none() {
                    return Err(SimError::AccessDenied(format!(
                        "{}: segment {:#x}+{len:#x} is outside the memory map",
                        metadata.name, segment.address
                    )));
                }
            }
        }

        let program_id = format!("prog-{}", inst.next_program);
        let extension = match metadata.format {
            ProgramFormat::Elf => "elf",
            ProgramFormat::Bin => "bin",
            ProgramFormat::Hex => "hex",
        };
        let dir = inst.work_dir.join("programs");
        tokio::fs::create_dir_all(&dir).await?;
        let path = dir.join(format!("{program_id}.{extension}"));
        tokio::fs::write(&path, &image).await?;
        if ctx.is_cancelled() {
            let _ = tokio::fs::remove_file(&path).await;
            return Err(SimError::Cancelled("upload program".to_string()));
        }

        inst.next_program += 1;
        inst.programs.push(ProgramInfo {
            id: program_id.clone(),
            metadata,
            path,
            size: image.len() as u64,
            entry: parsed.entry,
            state: ProgramState::Uploaded,
        });
        inst.images.insert(program_id.clone(), parsed);
        info!(instance_id = %instance_id, program_id = %program_id, bytes = image.len(), "Program uploaded");
        Ok(program_id)
    }

    async fn start_program(
        &self,
        ctx: &OpContext,
        instance_id: &str,
        program_id: &str,
        options: &StartOptions,
    ) -> Result<()> {
        ctx.check("start program")?;
        if !options.args.is_empty() || !options.env.is_empty() {
            return Err(SimError::Unsupported(
                "bare-metal programs take no arguments or environment".to_string(),
            ));
        }
        if options.enable_trace {
            self.require_feature(self.engine.capabilities().features.trace, "tracing")?;
        }
        let mut inst = self.lock_instance(instance_id).await?;
        inst.require_running("start program")?;

        match inst.program_mut(program_id)?.state {
            ProgramState::Running => {
                return Err(SimError::AlreadyRunning(format!("program {program_id}")));
            }
            ProgramState::Paused => {
                let (link, breakpoints) = inst.debug_parts()?;
                link.run(breakpoints).await?;
                inst.program_mut(program_id)?.state = ProgramState::Running;
                info!(instance_id = %instance_id, program_id = %program_id, "Program resumed");
                return Ok(());
            }
            ProgramState::Uploaded | ProgramState::Stopped => {}
        }
        if let Some(active) = &inst.active_program {
            return Err(SimError::InvalidState(format!(
                "program {active} is active on {instance_id}; stop it first"
            )));
        }

        let image = inst
            .images
            .get(program_id)
            .cloned()
            .ok_or_else(|| SimError::NotFound(format!("program image {program_id}")))?;
        let program = inst.program_mut(program_id)?;
        let (path, format) = (program.path.clone(), program.metadata.format);
        let load_addr = program
            .metadata
            .load_addr
            .or_else(|| image.segments.first().map(|s| s.address))
            .unwrap_or(image.entry);

        let load = MonitorAction::LoadProgram {
            path: &path,
            format,
            load_addr,
        };
        if self
            .engine
            .monitor_script(&inst.id, inst.ports, load)
            .is_some()
        {
            self.monitor(&inst, load).await?;
            inst.link_mut()?.set_pc(image.entry).await?;
        } else {
            inst.link_mut()?.load(&image).await?;
        }

        if options.enable_trace {
            let log = inst.work_dir.join(format!("{program_id}-exec.log"));
            self.monitor(&inst, MonitorAction::StartTrace { path: &log })
                .await?;
            inst.trace_log = Some(log);
        }
        if !options.wait_for_gdb && !inst.suspended {
            let (link, breakpoints) = inst.debug_parts()?;
            link.run(breakpoints).await?;
        }

        inst.program_mut(program_id)?.state = ProgramState::Running;
        inst.active_program = Some(program_id.to_string());
        inst.console.note(&format!(
            "program {program_id} started at {:#x}",
            image.entry
        ));
        info!(
            instance_id = %instance_id,
            program_id = %program_id,
            entry = image.entry,
            wait_for_gdb = options.wait_for_gdb,
            "Program started"
        );
        Ok(())
    }

    async fn pause_program(
        &self,
        ctx: &OpContext,
        instance_id: &str,
        program_id: &str,
    ) -> Result<()> {
        ctx.check("pause program")?;
        let mut inst = self.lock_instance(instance_id).await?;
        inst.check_engine()?;
        if inst.program_mut(program_id)?.state != ProgramState::Running {
            return Err(SimError::InvalidState(format!(
                "program {program_id} is not running"
            )));
        }
        inst.link_mut()?.pause().await?;
        inst.program_mut(program_id)?.state = ProgramState::Paused;
        debug!(instance_id = %instance_id, program_id = %program_id, "Program paused");
        Ok(())
    }

    async fn stop_program(
        &self,
        ctx: &OpContext,
        instance_id: &str,
        program_id: &str,
    ) -> Result<()> {
        ctx.check("stop program")?;
        let mut inst = self.lock_instance(instance_id).await?;
        inst.check_engine()?;
        let program = inst.program_mut(program_id)?;
        if !matches!(program.state, ProgramState::Running | ProgramState::Paused) {
            return Err(SimError::InvalidState(format!(
                "program {program_id} is not running"
            )));
        }
        if let Some(link) = inst.link.as_mut() {
            link.pause().await?;
        }
        inst.stop_active_program();
        debug!(instance_id = %instance_id, program_id = %program_id, "Program stopped");
        Ok(())
    }

    async fn list_programs(&self, instance_id: &str) -> Result<Vec<ProgramInfo>> {
        let inst = self.lock_instance(instance_id).await?;
        Ok(inst.programs.clone())
    }

    async fn set_breakpoint(
        &self,
        ctx: &OpContext,
        instance_id: &str,
        spec: &BreakpointSpec,
    ) -> Result<String> {
        ctx.check("set breakpoint")?;
        let mut inst = self.lock_instance(instance_id).await?;
        inst.require_running("set breakpoint")?;

        let family = family_of(&inst)?;
        let address = spec.address & family.pc_mask();
        check_access(inst.node()?, address, family.breakpoint_kind(), Access::Fetch).map_err(
            |e| SimError::AccessDenied(format!("breakpoint address {:#x}: {e}", spec.address)),
        )?;
        if let Some(condition) = &spec.condition {
            let condition = Condition::parse(condition)?;
            let layout = super::target::RegisterLayout::for_family(family);
            if layout.find(&condition.register).is_none() {
                return Err(SimError::InvalidArgument(format!(
                    "condition names unknown register {}",
                    condition.register
                )));
            }
        }
        if spec.kind == BreakpointKind::Hardware {
            let limit = self.engine.capabilities().limits.max_hw_breakpoints;
            if inst.breakpoints.hardware_in_use() >= limit {
                return Err(SimError::ResourceExhausted(format!(
                    "all {limit} hardware breakpoints in use"
                )));
            }
        }

        let bp = inst.breakpoints.add(spec.clone());
        if bp.spec.enabled {
            if let Err(e) = inst.link_mut()?.insert_breakpoint(&bp).await {
                let _ = inst.breakpoints.remove(&bp.id);
                return Err(e);
            }
        }
        debug!(instance_id = %instance_id, breakpoint_id = %bp.id, address = spec.address, "Breakpoint set");
        Ok(bp.id)
    }

    async fn remove_breakpoint(
        &self,
        ctx: &OpContext,
        instance_id: &str,
        breakpoint_id: &str,
    ) -> Result<()> {
        ctx.check("remove breakpoint")?;
        let mut inst = self.lock_instance(instance_id).await?;
        inst.require_running("remove breakpoint")?;
        let bp: Breakpoint = inst.breakpoints.get(breakpoint_id)?.clone();
        if bp.spec.enabled {
            inst.link_mut()?.remove_breakpoint(&bp).await?;
        }
        inst.breakpoints.remove(breakpoint_id)?;
        Ok(())
    }

    async fn list_breakpoints(&self, instance_id: &str) -> Result<Vec<Breakpoint>> {
        let inst = self.lock_instance(instance_id).await?;
        Ok(inst.breakpoints.list())
    }

    async fn step_instruction(&self, ctx: &OpContext, instance_id: &str) -> Result<StopInfo> {
        ctx.check("step")?;
        let mut inst = self.lock_instance(instance_id).await?;
        inst.require_running("step")?;
        let (link, breakpoints) = inst.debug_parts()?;
        let stop = link.step(breakpoints).await?;
        Self::after_stop(&mut inst, &stop);
        Ok(stop)
    }

    async fn continue_execution(&self, ctx: &OpContext, instance_id: &str) -> Result<StopInfo> {
        ctx.check("continue")?;
        let mut inst = self.lock_instance(instance_id).await?;
        inst.require_running("continue")?;
        if inst.suspended {
            return Err(SimError::InvalidState(format!(
                "{instance_id} is suspended; resume it first"
            )));
        }
        if let Some(active) = inst.active_program.clone() {
            inst.program_mut(&active)?.state = ProgramState::Running;
        }
        let deadline = Instant::now() + self.config.continue_window();
        let (link, breakpoints) = inst.debug_parts()?;
        let stop = link
            .continue_until(breakpoints, deadline, ctx.token())
            .await?;
        Self::after_stop(&mut inst, &stop);
        debug!(instance_id = %instance_id, stop = ?stop, "Continue finished");
        Ok(stop)
    }

    async fn read_registers(
        &self,
        ctx: &OpContext,
        instance_id: &str,
        scope: RegisterScope,
    ) -> Result<BTreeMap<String, u64>> {
        ctx.check("read registers")?;
        let mut inst = self.lock_instance(instance_id).await?;
        inst.require_running("read registers")?;
        inst.link_mut()?.read_registers(scope).await
    }

    async fn write_register(
        &self,
        ctx: &OpContext,
        instance_id: &str,
        register: &str,
        value: u64,
    ) -> Result<()> {
        ctx.check("write register")?;
        let mut inst = self.lock_instance(instance_id).await?;
        inst.require_running("write register")?;
        inst.link_mut()?.write_register(register, value).await
    }

    async fn read_memory(
        &self,
        ctx: &OpContext,
        instance_id: &str,
        address: u64,
        size: u32,
    ) -> Result<Vec<u8>> {
        ctx.check("read memory")?;
        if u64::from(size) > MAX_TRANSFER {
            return Err(SimError::InvalidArgument(format!(
                "read of {size} bytes exceeds {MAX_TRANSFER}"
            )));
        }
        let mut inst = self.lock_instance(instance_id).await?;
        inst.require_running("read memory")?;
        check_access(inst.node()?, address, u64::from(size), Access::Read)?;
        inst.link_mut()?.read_memory(address, size as usize).await
    }

    async fn write_memory(
        &self,
        ctx: &OpContext,
        instance_id: &str,
        address: u64,
        data: &[u8],
    ) -> Result<()> {
        ctx.check("write memory")?;
        let mut inst = self.lock_instance(instance_id).await?;
        inst.require_running("write memory")?;
        check_access(inst.node()?, address, data.len() as u64, Access::Write)?;
        inst.link_mut()?.write_memory(address, data).await
    }

    async fn create_snapshot(&self, ctx: &OpContext, instance_id: &str) -> Result<String> {
        ctx.check("create snapshot")?;
        self.require_feature(self.engine.capabilities().features.snapshot, "snapshots")?;
        let mut inst = self.lock_instance(instance_id).await?;
        inst.require_running("create snapshot")?;

        let n = inst.next_snapshot;
        let snapshot_id = format!("{instance_id}/snap-{n}");
        let tag = format!("snap-{n}");
        let dir = self.config.instance_snapshot_dir(inst.backend, instance_id);
        tokio::fs::create_dir_all(&dir).await?;
        let state = dir.join(format!("{n}.state"));

        // Saving a running target makes the stub report a stop nobody asked for.
        let was_running = inst.link_mut()?.is_running();
        inst.link_mut()?.pause().await?;
        let saved = self
            .monitor(
                &inst,
                MonitorAction::SaveSnapshot {
                    tag: &tag,
                    path: &state,
                },
            )
            .await;
        if was_running {
            let (link, breakpoints) = inst.debug_parts()?;
            link.run(breakpoints).await?;
        }
        saved?;

        let file = SnapshotFile {
            id: snapshot_id.clone(),
            instance_id: instance_id.to_string(),
            created_at: Utc::now(),
            tag,
            state: state.clone(),
            programs: inst.programs.clone(),
            active_program: inst.active_program.clone(),
        };
        let body = serde_json::to_vec(&file)
            .map_err(|e| SimError::Internal(format!("encode snapshot: {e}")))?;
        let path = dir.join(format!("{n}.json"));
        let tmp = dir.join(format!("{n}.json.tmp"));
        tokio::fs::write(&tmp, &body).await?;
        if ctx.is_cancelled() {
            let _ = tokio::fs::remove_file(&tmp).await;
            return Err(SimError::Cancelled("create snapshot".to_string()));
        }
        tokio::fs::rename(&tmp, &path).await?;

        let state_bytes = tokio::fs::metadata(&state)
            .await
            .map(|m| m.len())
            .unwrap_or(0);
        inst.next_snapshot += 1;
        inst.snapshots.push(SnapshotInfo {
            id: snapshot_id.clone(),
            instance_id: instance_id.to_string(),
            path,
            bytes: body.len() as u64 + state_bytes,
            created_at: file.created_at,
        });
        info!(instance_id = %instance_id, snapshot_id = %snapshot_id, "Snapshot created");
        Ok(snapshot_id)
    }

    async fn restore_snapshot(
        &self,
        ctx: &OpContext,
        instance_id: &str,
        snapshot_id: &str,
    ) -> Result<()> {
        ctx.check("restore snapshot")?;
        self.require_feature(self.engine.capabilities().features.snapshot, "snapshots")?;
        let (owner, _) = parse_snapshot_id(snapshot_id).ok_or_else(|| {
            SimError::InvalidArgument(format!("malformed snapshot id: {snapshot_id}"))
        })?;
        if owner != instance_id {
            return Err(SimError::InvalidArgument(format!(
                "snapshot {snapshot_id} belongs to {owner}, not {instance_id}"
            )));
        }

        let mut inst = self.lock_instance(instance_id).await?;
        inst.require_running("restore snapshot")?;
        let path = inst
            .snapshots
            .iter()
            .find(|s| s.id == snapshot_id)
            .map(|s| s.path.clone())
            .ok_or_else(|| SimError::NotFound(format!("snapshot {snapshot_id}")))?;

        let body = tokio::fs::read(&path).await?;
        let file: SnapshotFile = serde_json::from_slice(&body)
            .map_err(|e| SimError::Internal(format!("decode snapshot {snapshot_id}: {e}")))?;
        ctx.check("restore snapshot")?;

        let was_running = inst.link_mut()?.is_running();
        inst.link_mut()?.pause().await?;
        self.monitor(
            &inst,
            MonitorAction::LoadSnapshot {
                tag: &file.tag,
                path: &file.state,
            },
        )
        .await?;
        if self.engine.reattach_after_restore() {
            inst.link = None;
            let link = self.attach(ctx, &inst).await?;
            inst.link = Some(link);
        }

        let saved: HashMap<String, ProgramState> = file
            .programs
            .into_iter()
            .map(|p| (p.id, p.state))
            .collect();
        for program in inst.programs.iter_mut() {
            program.state = match saved.get(&program.id) {
                Some(state) => *state,
                None if matches!(program.state, ProgramState::Running | ProgramState::Paused) => {
                    ProgramState::Stopped
                }
                None => program.state,
            };
        }
        let active = file
            .active_program
            .filter(|id| inst.programs.iter().any(|p| &p.id == id));
        inst.active_program = active;
        if was_running && !inst.suspended {
            let (link, breakpoints) = inst.debug_parts()?;
            link.run(breakpoints).await?;
        }
        info!(instance_id = %instance_id, snapshot_id = %snapshot_id, "Snapshot restored");
        Ok(())
    }

    async fn list_snapshots(&self, instance_id: &str) -> Result<Vec<SnapshotInfo>> {
        let inst = self.lock_instance(instance_id).await?;
        Ok(inst.snapshots.clone())
    }

    async fn export_coverage(&self, ctx: &OpContext, instance_id: &str) -> Result<ArtifactRef> {
        ctx.check("export coverage")?;
        self.require_feature(self.engine.capabilities().features.coverage, "coverage export")?;
        let mut inst = self.lock_instance(instance_id).await?;
        inst.check_engine()?;
        let (log, pcs) = self.executed(&inst).await?;
        let executed = pcs.len();
        let addresses: BTreeSet<u64> = pcs.into_iter().collect();
        let report = CoverageReport {
            instance_id,
            backend: inst.backend,
            generated_at: Utc::now(),
            log: &log,
            executed,
            addresses: addresses.into_iter().collect(),
        };
        let body = serde_json::to_vec_pretty(&report)
            .map_err(|e| SimError::Internal(format!("encode coverage: {e}")))?;
        self.write_artifact(&inst, ArtifactKind::Coverage, body).await
    }

    async fn export_trace(&self, ctx: &OpContext, instance_id: &str) -> Result<ArtifactRef> {
        ctx.check("export trace")?;
        self.require_feature(self.engine.capabilities().features.trace, "trace export")?;
        let mut inst = self.lock_instance(instance_id).await?;
        inst.check_engine()?;
        let (log, pcs) = self.executed(&inst).await?;
        let mut events = VecDeque::with_capacity(pcs.len().min(TRACE_LIMIT));
        for (seq, pc) in pcs.into_iter().enumerate() {
            if events.len() == TRACE_LIMIT {
                events.pop_front();
            }
            events.push_back(TraceEvent {
                seq: seq as u64,
                pc,
            });
        }
        let report = TraceReport {
            instance_id,
            backend: inst.backend,
            generated_at: Utc::now(),
            log: &log,
            events: events.into(),
        };
        let body = serde_json::to_vec_pretty(&report)
            .map_err(|e| SimError::Internal(format!("encode trace: {e}")))?;
        self.write_artifact(&inst, ArtifactKind::Trace, body).await
    }

    async fn gdb_server_address(&self, instance_id: &str) -> Result<String> {
        let mut inst = self.lock_instance(instance_id).await?;
        inst.require_running("GDB server address")?;
        match inst.ports.debug {
            Some(port) if self.engine.capabilities().features.gdb_support => {
                Ok(format!("{}:{port}", self.config.advertise_host))
            }
            _ => Err(SimError::Unsupported(format!(
                "{} has no debug transport",
                self.engine.backend()
            ))),
        }
    }

    async fn console_stream(&self, instance_id: &str) -> Result<ConsoleStream> {
        let inst = self.lock_instance(instance_id).await?;
        Ok(inst.console.subscribe())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_snapshot_id() {
        assert_eq!(parse_snapshot_id("qemu-s1/snap-3"), Some(("qemu-s1", 3)));
        assert_eq!(parse_snapshot_id("qemu-a/b/snap-12"), Some(("qemu-a/b", 12)));
        assert_eq!(parse_snapshot_id("qemu-s1/3"), None);
        assert_eq!(parse_snapshot_id("qemu-s1/snap-x"), None);
    }

    #[test]
    fn test_port_layout_count() {
        let layout = PortLayout {
            debug: true,
            console: false,
            monitor: true,
        };
        assert_eq!(layout.count(), 2);
    }

    #[test]
    fn test_default_monitor_failure_detection() {
        struct Bare;
        impl Engine for Bare {
            fn backend(&self) -> BackendType {
                BackendType::SkyEye
            }
            fn capabilities(&self) -> Capabilities {
                unimplemented!()
            }
            fn port_layout(&self) -> PortLayout {
                PortLayout {
                    debug: true,
                    console: false,
                    monitor: false,
                }
            }
            fn launch_plan(&self, _spec: &LaunchSpec<'_>) -> Result<LaunchPlan> {
                unimplemented!()
            }
        }
        assert!(Bare::monitor_failed("Error: device not found"));
        assert!(!Bare::monitor_failed(""));
        assert_eq!(Bare.trace_pc("0x100"), None);
        assert_eq!(
            Bare.monitor_script("skyeye-s1", PortSet::default(), MonitorAction::Reset),
            None
        );
    }
}

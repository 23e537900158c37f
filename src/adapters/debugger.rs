//! The broker's debug connection to a running engine.
//!
//! A [`DebugLink`] is opened on the instance's debug port right after power
//! on and dropped when the engine goes away. It owns the run state of the
//! target as seen through the GDB stub: operations that need a halted CPU
//! interrupt a running target, do their work and let it run again.

use super::console::ConsoleHub;
use super::gdb::{BreakpointType, GdbClient, StopReply};
use super::program::ProgramImage;
use super::target::{le_hex, le_value, Condition, CpuFamily, RegisterDef, RegisterLayout};
use super::{Breakpoint, BreakpointKind, BreakpointSpec, RegisterScope};
use crate::error::{Result, SimError};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::debug;

const SIGINT: u8 = 2;
const SIGTRAP: u8 = 5;

/// Why execution stopped.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum StopReason {
    Step,
    Breakpoint { id: String },
    /// Halted by a signal other than a breakpoint trap, e.g. a fault.
    Signal { signal: u8 },
    /// Still running when the continue window closed.
    Running,
    /// The program ended.
    Exited { code: u8 },
}

/// Result of a step or continue.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StopInfo {
    /// Program counter of the halted target; absent while it runs.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pc: Option<u64>,
    #[serde(flatten)]
    pub reason: StopReason,
}

/// Breakpoints of one instance. They outlive engine restarts and are
/// inserted again whenever a link attaches.
#[derive(Debug, Default)]
pub(crate) struct BreakpointTable {
    entries: BTreeMap<u64, Breakpoint>,
    next: u64,
}

fn breakpoint_key(id: &str) -> Option<u64> {
    id.strip_prefix("bp-")?.parse().ok()
}

impl BreakpointTable {
    pub fn add(&mut self, spec: BreakpointSpec) -> Breakpoint {
        self.next += 1;
        let bp = Breakpoint {
            id: format!("bp-{}", self.next),
            spec,
            hits: 0,
        };
        self.entries.insert(self.next, bp.clone());
        bp
    }

    pub fn get(&self, id: &str) -> Result<&Breakpoint> {
        breakpoint_key(id)
            .and_then(|key| self.entries.get(&key))
            .ok_or_else(|| SimError::NotFound(format!("breakpoint {id}")))
    }

    pub fn remove(&mut self, id: &str) -> Result<Breakpoint> {
        breakpoint_key(id)
            .and_then(|key| self.entries.remove(&key))
            .ok_or_else(|| SimError::NotFound(format!("breakpoint {id}")))
    }

    pub fn list(&self) -> Vec<Breakpoint> {
        self.entries.values().cloned().collect()
    }

    pub fn hardware_in_use(&self) -> u32 {
        self.entries
            .values()
            .filter(|b| b.spec.kind == BreakpointKind::Hardware)
            .count() as u32
    }

    pub fn enabled(&self) -> impl Iterator<Item = &Breakpoint> {
        self.entries.values().filter(|b| b.spec.enabled)
    }

    fn enabled_at(&self, pc: u64, mask: u64) -> Option<&Breakpoint> {
        self.enabled().find(|b| b.spec.address & mask == pc)
    }

    fn enabled_at_mut(&mut self, pc: u64, mask: u64) -> Option<&mut Breakpoint> {
        self.entries
            .values_mut()
            .find(|b| b.spec.enabled && b.spec.address & mask == pc)
    }
}

fn gdb_type(kind: BreakpointKind) -> BreakpointType {
    match kind {
        BreakpointKind::Software => BreakpointType::Software,
        BreakpointKind::Hardware => BreakpointType::Hardware,
    }
}

/// A GDB connection plus what the broker knows about the CPU behind it.
#[derive(Debug)]
pub(crate) struct DebugLink {
    gdb: GdbClient,
    layout: RegisterLayout,
    running: bool,
}

impl DebugLink {
    /// Connect to the stub on `port` and insert every enabled breakpoint.
    pub async fn attach(
        port: u16,
        family: CpuFamily,
        deadline: Instant,
        request_timeout: Duration,
        console: ConsoleHub,
        breakpoints: &BreakpointTable,
    ) -> Result<Self> {
        let mut gdb = GdbClient::connect(port, deadline, request_timeout, console).await?;
        let halt = gdb.halt_reason().await?;
        debug!(port = port, halt = ?halt, "Debug link attached");
        let mut link = Self {
            gdb,
            layout: RegisterLayout::for_family(family),
            running: false,
        };
        for bp in breakpoints.enabled() {
            link.insert_halted(bp).await?;
        }
        Ok(link)
    }

    pub fn is_running(&self) -> bool {
        self.running
    }

    fn pc_mask(&self) -> u64 {
        self.layout.family().pc_mask()
    }

    /// Stop a running target.
    ///
    /// Returns `true` only when the interrupt stopped it; a target that
    /// halted on its own (a breakpoint hit nobody waited for) stays halted.
    async fn halt(&mut self) -> Result<bool> {
        if !self.running {
            return Ok(false);
        }
        self.gdb.interrupt().await?;
        let stop = self.gdb.expect_stop().await?;
        self.running = false;
        Ok(matches!(stop, StopReply::Signal { signal: SIGINT, .. }))
    }

    async fn settle(&mut self, resume: bool) -> Result<()> {
        if resume {
            self.gdb.resume().await?;
            self.running = true;
        }
        Ok(())
    }

    pub async fn pause(&mut self) -> Result<()> {
        self.halt().await.map(|_| ())
    }

    /// Let a halted target run without waiting for it to stop.
    pub async fn run(&mut self, breakpoints: &BreakpointTable) -> Result<()> {
        self.start(breakpoints).await.map(|_| ())
    }

    /// Resume; a stop is returned if stepping off a breakpoint already
    /// halted the target for another reason.
    async fn start(&mut self, breakpoints: &BreakpointTable) -> Result<Option<StopReply>> {
        if self.running {
            return Ok(None);
        }
        let pc = self.pc_halted().await?;
        if breakpoints.enabled_at(pc, self.pc_mask()).is_some() {
            let stop = self.single_step(pc, breakpoints).await?;
            if !matches!(stop, StopReply::Signal { signal: SIGTRAP, .. }) {
                return Ok(Some(stop));
            }
        }
        self.gdb.resume().await?;
        self.running = true;
        Ok(None)
    }

    /// Step once at `pc`, lifting a breakpoint planted there for the step.
    async fn single_step(&mut self, pc: u64, breakpoints: &BreakpointTable) -> Result<StopReply> {
        let width = self.layout.family().breakpoint_kind();
        let lifted = breakpoints
            .enabled_at(pc, self.pc_mask())
            .map(|bp| (gdb_type(bp.spec.kind), bp.spec.address & self.pc_mask()));
        if let Some((kind, address)) = lifted {
            self.gdb.remove_breakpoint(kind, address, width).await?;
        }
        self.gdb.step().await?;
        let stop = self.gdb.expect_stop().await?;
        if let Some((kind, address)) = lifted {
            self.gdb.insert_breakpoint(kind, address, width).await?;
        }
        Ok(stop)
    }

    pub async fn step(&mut self, breakpoints: &BreakpointTable) -> Result<StopInfo> {
        self.halt().await?;
        let pc = self.pc_halted().await?;
        let stop = self.single_step(pc, breakpoints).await?;
        match stop {
            StopReply::Signal { signal, registers } => {
                let pc = self.stop_pc(&registers).await?;
                let reason = if signal == SIGTRAP {
                    StopReason::Step
                } else {
                    StopReason::Signal { signal }
                };
                Ok(StopInfo {
                    pc: Some(pc),
                    reason,
                })
            }
            other => Ok(self.ended(other)),
        }
    }

    /// Resume and wait until `deadline` for a breakpoint whose condition
    /// holds, a fault or the end of the program.
    ///
    /// A breakpoint hit whose condition is false resumes the target again.
    /// Cancellation leaves the target running.
    pub async fn continue_until(
        &mut self,
        breakpoints: &mut BreakpointTable,
        deadline: Instant,
        cancel: &CancellationToken,
    ) -> Result<StopInfo> {
        loop {
            let stop = match self.start(breakpoints).await? {
                Some(stop) => Some(stop),
                None => {
                    let stop = tokio::select! {
                        stop = self.gdb.wait_stop(deadline) => stop?,
                        _ = cancel.cancelled() => {
                            return Err(SimError::Cancelled("continue".to_string()));
                        }
                    };
                    if stop.is_some() {
                        self.running = false;
                    }
                    stop
                }
            };

            let (signal, registers) = match stop {
                None => {
                    return Ok(StopInfo {
                        pc: None,
                        reason: StopReason::Running,
                    })
                }
                Some(StopReply::Signal { signal, registers }) => (signal, registers),
                Some(other) => return Ok(self.ended(other)),
            };
            let pc = self.stop_pc(&registers).await?;
            if signal != SIGTRAP {
                return Ok(StopInfo {
                    pc: Some(pc),
                    reason: StopReason::Signal { signal },
                });
            }

            let mask = self.pc_mask();
            let condition = match breakpoints.enabled_at(pc, mask) {
                Some(bp) => bp.spec.condition.clone(),
                None => {
                    return Ok(StopInfo {
                        pc: Some(pc),
                        reason: StopReason::Signal { signal },
                    })
                }
            };
            if let Some(text) = condition {
                let condition = Condition::parse(&text)?;
                let def = self.register(&condition.register)?;
                let actual = self.read_one(def).await?;
                if !condition.holds(actual) {
                    debug!(pc = pc, condition = %text, "Breakpoint condition false, resuming");
                    continue;
                }
            }
            if let Some(bp) = breakpoints.enabled_at_mut(pc, mask) {
                bp.hits += 1;
                return Ok(StopInfo {
                    pc: Some(pc),
                    reason: StopReason::Breakpoint { id: bp.id.clone() },
                });
            }
        }
    }

    fn ended(&self, stop: StopReply) -> StopInfo {
        let reason = match stop {
            StopReply::Exited { code } => StopReason::Exited { code },
            StopReply::Terminated { signal } | StopReply::Signal { signal, .. } => {
                StopReason::Signal { signal }
            }
        };
        StopInfo { pc: None, reason }
    }

    fn register(&self, name: &str) -> Result<RegisterDef> {
        self.layout.find(name).copied().ok_or_else(|| {
            SimError::AccessDenied(format!(
                "no register {name} on {:?}",
                self.layout.family()
            ))
        })
    }

    /// PC from the expedited registers of a stop reply, or read from the stub.
    async fn stop_pc(&mut self, expedited: &BTreeMap<u32, String>) -> Result<u64> {
        let def = self.layout.pc();
        match expedited
            .get(&def.regnum)
            .and_then(|hex| le_value(hex.as_bytes()))
        {
            Some(pc) => Ok(pc & self.pc_mask()),
            None => self.pc_halted().await,
        }
    }

    async fn pc_halted(&mut self) -> Result<u64> {
        let def = self.layout.pc();
        Ok(self.read_one(def).await? & self.pc_mask())
    }

    async fn read_one(&mut self, def: RegisterDef) -> Result<u64> {
        if def.offset.is_some() {
            let block = self.gdb.read_registers().await?;
            if let Some(value) = self.layout.decode(&def, &block) {
                return Ok(value);
            }
        }
        match self.gdb.read_register(def.regnum).await? {
            Some(hex) => le_value(&hex).ok_or_else(|| {
                SimError::AccessDenied(format!("register {} is unavailable", def.name))
            }),
            None => Err(SimError::AccessDenied(format!(
                "engine cannot read register {}",
                def.name
            ))),
        }
    }

    pub async fn read_registers(&mut self, scope: RegisterScope) -> Result<BTreeMap<String, u64>> {
        let resume = self.halt().await?;
        let result = self.read_registers_halted(scope).await;
        self.settle(resume).await?;
        result
    }

    async fn read_registers_halted(&mut self, scope: RegisterScope) -> Result<BTreeMap<String, u64>> {
        let block = self.gdb.read_registers().await?;
        let mut out = BTreeMap::new();
        for def in self.layout.registers() {
            let wanted = match scope {
                RegisterScope::All => true,
                RegisterScope::General => !def.control,
                RegisterScope::Control => def.control,
            };
            if !wanted {
                continue;
            }
            let value = match self.layout.decode(def, &block) {
                Some(value) => Some(value),
                None => self
                    .gdb
                    .read_register(def.regnum)
                    .await?
                    .and_then(|hex| le_value(&hex)),
            };
            if let Some(value) = value {
                out.insert(def.name.to_string(), value);
            }
        }
        Ok(out)
    }

    pub async fn write_register(&mut self, name: &str, value: u64) -> Result<()> {
        let def = self.register(name)?;
        if self.layout.read_only(&def) {
            return Err(SimError::AccessDenied(format!("register {name} is read-only")));
        }
        if def.size < 8 && value >> (def.size * 8) != 0 {
            return Err(SimError::InvalidArgument(format!(
                "value {value:#x} does not fit register {name}"
            )));
        }
        let resume = self.halt().await?;
        let result = self.write_halted(def, value).await;
        self.settle(resume).await?;
        result
    }

    async fn write_halted(&mut self, def: RegisterDef, value: u64) -> Result<()> {
        if self
            .gdb
            .write_register(def.regnum, &le_hex(value, def.size))
            .await?
        {
            return Ok(());
        }
        // Stub without `P`: patch the whole block.
        let mut block = self.gdb.read_registers().await?;
        if !self.layout.encode_into(&def, value, &mut block) {
            return Err(SimError::Unsupported(format!(
                "engine cannot write register {}",
                def.name
            )));
        }
        self.gdb.write_registers(&block).await
    }

    pub async fn read_memory(&mut self, address: u64, len: usize) -> Result<Vec<u8>> {
        let resume = self.halt().await?;
        let result = self.gdb.read_memory(address, len).await;
        self.settle(resume).await?;
        result
    }

    pub async fn write_memory(&mut self, address: u64, data: &[u8]) -> Result<()> {
        let resume = self.halt().await?;
        let result = self.gdb.write_memory(address, data).await;
        self.settle(resume).await?;
        result
    }

    async fn insert_halted(&mut self, bp: &Breakpoint) -> Result<()> {
        let width = self.layout.family().breakpoint_kind();
        let address = bp.spec.address & self.pc_mask();
        self.gdb
            .insert_breakpoint(gdb_type(bp.spec.kind), address, width)
            .await
    }

    pub async fn insert_breakpoint(&mut self, bp: &Breakpoint) -> Result<()> {
        let resume = self.halt().await?;
        let result = self.insert_halted(bp).await;
        self.settle(resume).await?;
        result
    }

    pub async fn remove_breakpoint(&mut self, bp: &Breakpoint) -> Result<()> {
        let width = self.layout.family().breakpoint_kind();
        let address = bp.spec.address & self.pc_mask();
        let resume = self.halt().await?;
        let result = self
            .gdb
            .remove_breakpoint(gdb_type(bp.spec.kind), address, width)
            .await;
        self.settle(resume).await?;
        result
    }

    /// Write the image's segments through the stub and point PC at its
    /// entry. The target is left halted.
    pub async fn load(&mut self, image: &ProgramImage) -> Result<()> {
        self.halt().await?;
        for segment in &image.segments {
            self.gdb.write_memory(segment.address, &segment.data).await?;
        }
        self.set_pc(image.entry).await
    }

    /// Point PC at `entry`. The target is left halted.
    pub async fn set_pc(&mut self, entry: u64) -> Result<()> {
        self.halt().await?;
        let def = self.layout.pc();
        self.write_halted(def, entry & self.pc_mask()).await
    }
}

//! Renode: a scriptable instruction-set simulator driven by a generated
//! platform description (`.repl`) and start-up script (`.resc`).

use super::engine::{Engine, LaunchPlan, LaunchSpec, MonitorAction, PortLayout};
use super::target::CpuFamily;
use super::{BackendType, Capabilities, FeatureFlags, Limits, PortSet, ProgramFormat};
use crate::board::{MemoryType, NodeConfig};
use crate::error::{Result, SimError};
use std::fmt::Write as _;

/// Renode CPU class and `cpuType` for a processor name.
fn renode_cpu(processor: &str) -> (&'static str, &'static str) {
    match processor {
        "ARM Cortex-M0" => ("CPU.CortexM", "cortex-m0"),
        "ARM Cortex-M3" => ("CPU.CortexM", "cortex-m3"),
        "ARM Cortex-M4" => ("CPU.CortexM", "cortex-m4"),
        "ARM Cortex-A9" => ("CPU.ARMv7A", "cortex-a9"),
        "RISC-V RV32" => ("CPU.RiscV32", "rv32imac"),
        "RISC-V RV64" => ("CPU.RiscV64", "rv64gc"),
        other => match CpuFamily::from_processor(other) {
            CpuFamily::Arm32 => ("CPU.ARMv7A", "cortex-a9"),
            CpuFamily::Aarch64 => ("CPU.ARMv8A", "cortex-a53"),
            CpuFamily::RiscV32 => ("CPU.RiscV32", "rv32imac"),
            CpuFamily::RiscV64 => ("CPU.RiscV64", "rv64gc"),
            CpuFamily::CortexM | CpuFamily::X86_64 => ("CPU.CortexM", "cortex-m3"),
        },
    }
}

/// Renode model for a peripheral type, if one is bundled.
fn renode_peripheral(kind: &str) -> Option<&'static str> {
    match kind {
        "UART" => Some("UART.PL011"),
        "GPIO" => Some("GPIOPort.PL061"),
        "Timer" => Some("Timers.ARM_SP804_Timer"),
        "SPI" => Some("SPI.PL022"),
        "I2C" => Some("I2C.VersatileI2C"),
        "CAN" => Some("CAN.MCP2515"),
        "Ethernet" => Some("Network.SMC91X"),
        _ => None,
    }
}

fn platform_description(node: &NodeConfig) -> String {
    let (class, cpu_type) = renode_cpu(&node.processor.kind);
    let cortex_m = class == "CPU.CortexM";
    let mut repl = String::new();

    let _ = writeln!(repl, "cpu: {class} @ sysbus");
    let _ = writeln!(repl, "    cpuType: \"{cpu_type}\"");
    if cortex_m {
        let _ = writeln!(repl, "    nvic: nvic");
        let _ = writeln!(repl);
        let _ = writeln!(repl, "nvic: IRQControllers.NVIC @ sysbus 0xE000E000");
        let _ = writeln!(repl, "    -> cpu@0");
    }

    for (i, region) in node.memory.iter().enumerate() {
        let name = match region.kind {
            MemoryType::Ram => "sram",
            MemoryType::Rom => "rom",
            MemoryType::Flash => "flash",
        };
        let _ = writeln!(repl);
        let _ = writeln!(repl, "{name}{i}: Memory.MappedMemory @ sysbus {:#x}", region.address);
        let _ = writeln!(repl, "    size: {:#x}", region.size);
    }

    for peripheral in &node.peripherals {
        let _ = writeln!(repl);
        let name = peripheral.name.to_ascii_lowercase();
        match (renode_peripheral(&peripheral.kind), peripheral.address) {
            (Some(model), Some(address)) => {
                let _ = writeln!(repl, "{name}: {model} @ sysbus {address:#x}");
                if let (true, Some(irq)) = (cortex_m, peripheral.irq.first()) {
                    let _ = writeln!(repl, "    -> nvic@{irq}");
                }
            }
            _ => {
                let _ = writeln!(repl, "// {name}: {} is not modelled", peripheral.kind);
            }
        }
    }
    repl
}

/// The Renode engine profile.
#[derive(Debug, Clone, Copy, Default)]
pub struct Renode;

impl Engine for Renode {
    fn backend(&self) -> BackendType {
        BackendType::Renode
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities {
            backend: BackendType::Renode,
            processors: [
                "ARM Cortex-M0",
                "ARM Cortex-M3",
                "ARM Cortex-M4",
                "ARM Cortex-A9",
                "RISC-V RV32",
                "RISC-V RV64",
            ]
            .map(String::from)
            .to_vec(),
            peripherals: ["UART", "GPIO", "SPI", "I2C", "Timer", "CAN", "Ethernet"]
                .map(String::from)
                .to_vec(),
            buses: ["AHB", "APB", "AXI"].map(String::from).to_vec(),
            features: FeatureFlags {
                gdb_support: true,
                snapshot: true,
                coverage: false,
                trace: true,
                multicore: true,
                shared_memory: false,
                peripheral_model: true,
                python_scripting: true,
            },
            limits: Limits {
                max_cores: 8,
                max_memory_gb: 16,
                max_peripherals: 64,
                max_hw_breakpoints: 4,
            },
        }
    }

    fn port_layout(&self) -> PortLayout {
        PortLayout {
            debug: true,
            console: false,
            monitor: true,
        }
    }

    fn launch_plan(&self, spec: &LaunchSpec<'_>) -> Result<LaunchPlan> {
        let (Some(gdb), Some(monitor)) = (spec.ports.debug, spec.ports.monitor) else {
            return Err(SimError::Internal(format!(
                "{}: Renode needs debug and monitor ports",
                spec.instance_id
            )));
        };

        let repl_path = spec.work_dir.join("platform.repl");
        let resc_path = spec.work_dir.join("start.resc");

        let mut resc = String::new();
        let _ = writeln!(resc, ":name: {}", spec.board.name);
        let _ = writeln!(resc, "mach create \"{}\"", spec.instance_id);
        let _ = writeln!(
            resc,
            "machine LoadPlatformDescription @{}",
            repl_path.display()
        );
        if let Some(bootrom) = spec.board.boot.as_ref().and_then(|b| b.bootrom.as_ref()) {
            if bootrom.ends_with(".elf") {
                let _ = writeln!(resc, "sysbus LoadELF @{bootrom}");
            } else {
                let base = spec
                    .node
                    .memory
                    .iter()
                    .find(|r| r.kind != MemoryType::Ram)
                    .or_else(|| spec.node.memory.first())
                    .map(|r| r.address)
                    .unwrap_or(0);
                let _ = writeln!(resc, "sysbus LoadBinary @{bootrom} {base:#x}");
            }
        }
        let _ = writeln!(resc, "machine StartGdbServer {gdb}");

        Ok(LaunchPlan {
            program: spec.binaries.renode.clone(),
            args: vec![
                "--disable-xwt".to_string(),
                "--console".to_string(),
                "--port".to_string(),
                monitor.to_string(),
                resc_path.display().to_string(),
            ],
            files: vec![
                (repl_path, platform_description(spec.node)),
                (resc_path, resc),
            ],
            setup: Vec::new(),
            console_port: None,
        })
    }

    /// Renode prompts with the selected machine, e.g. `(renode-s1) `.
    fn monitor_prompt(&self) -> &'static str {
        ") "
    }

    fn monitor_script(
        &self,
        instance_id: &str,
        ports: PortSet,
        action: MonitorAction<'_>,
    ) -> Option<Vec<String>> {
        let mut script = vec![format!("mach set \"{instance_id}\"")];
        match action {
            MonitorAction::Reset => script.push("machine Reset".to_string()),
            MonitorAction::SaveSnapshot { path, .. } => {
                script.push(format!("Save @{}", path.display()));
            }
            MonitorAction::LoadSnapshot { path, .. } => {
                // Load replaces the emulation, so the GDB server comes back too.
                script.push(format!("Load @{}", path.display()));
                script.push(format!("mach set \"{instance_id}\""));
                script.push(format!("machine StartGdbServer {}", ports.debug?));
            }
            MonitorAction::LoadProgram {
                path,
                format,
                load_addr,
            } => script.push(match format {
                ProgramFormat::Elf => format!("sysbus LoadELF @{}", path.display()),
                ProgramFormat::Hex => format!("sysbus LoadHEX @{}", path.display()),
                ProgramFormat::Bin => {
                    format!("sysbus LoadBinary @{} {load_addr:#x}", path.display())
                }
            }),
            MonitorAction::StartTrace { path } => script.push(format!(
                "cpu CreateExecutionTracing \"trace\" @{} PC",
                path.display()
            )),
        }
        Some(script)
    }

    fn reattach_after_restore(&self) -> bool {
        true
    }

    /// Execution tracing in `PC` mode writes one address per line.
    fn trace_pc(&self, line: &str) -> Option<u64> {
        let token = line.split_whitespace().find(|t| t.starts_with("0x"))?;
        u64::from_str_radix(token.trim_start_matches("0x").trim_end_matches(':'), 16).ok()
    }
}

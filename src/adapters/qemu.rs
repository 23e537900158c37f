//! QEMU: a spawned full-system emulator with gdbstub, serial and monitor sockets.

use super::engine::{Engine, LaunchPlan, LaunchSpec, MonitorAction, PortLayout, SetupStep};
use super::target::CpuFamily;
use super::{BackendType, Capabilities, FeatureFlags, Limits, PortSet};
use crate::error::{Result, SimError};

/// Size of the disk image that holds `savevm` snapshots.
const VMSTATE_SIZE: &str = "64M";

/// CPU model used when a processor name has no mapping.
pub const DEFAULT_CPU_MODEL: &str = "cortex-m3";

/// Map a processor name to a QEMU `-cpu` model.
pub fn qemu_cpu_model(processor: &str) -> &'static str {
    match processor {
        "ARM Cortex-M3" => "cortex-m3",
        "ARM Cortex-M4" => "cortex-m4",
        "ARM Cortex-M7" => "cortex-m7",
        "ARM Cortex-A9" => "cortex-a9",
        "ARM Cortex-A53" => "cortex-a53",
        "ARM Cortex-A72" => "cortex-a72",
        "RISC-V RV32" => "rv32",
        "RISC-V RV64" => "rv64",
        "x86" => "qemu32",
        "x86_64" => "qemu64",
        _ => DEFAULT_CPU_MODEL,
    }
}

/// The QEMU engine profile.
#[derive(Debug, Clone, Copy, Default)]
pub struct Qemu;

impl Engine for Qemu {
    fn backend(&self) -> BackendType {
        BackendType::Qemu
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities {
            backend: BackendType::Qemu,
            processors: [
                "ARM Cortex-M3",
                "ARM Cortex-M4",
                "ARM Cortex-M7",
                "ARM Cortex-A9",
                "ARM Cortex-A53",
                "ARM Cortex-A72",
                "RISC-V RV32",
                "RISC-V RV64",
                "x86",
                "x86_64",
            ]
            .map(String::from)
            .to_vec(),
            peripherals: [
                "UART", "GPIO", "SPI", "I2C", "Timer", "RTC", "Ethernet", "USB", "CAN", "ADC",
                "DAC",
            ]
            .map(String::from)
            .to_vec(),
            buses: ["AHB", "APB", "AXI", "PCIe"].map(String::from).to_vec(),
            features: FeatureFlags {
                gdb_support: true,
                snapshot: true,
                coverage: true,
                trace: true,
                multicore: true,
                shared_memory: true,
                peripheral_model: true,
                python_scripting: false,
            },
            limits: Limits {
                max_cores: 16,
                max_memory_gb: 64,
                max_peripherals: 128,
                max_hw_breakpoints: 8,
            },
        }
    }

    fn port_layout(&self) -> PortLayout {
        PortLayout {
            debug: true,
            console: true,
            monitor: true,
        }
    }

    fn launch_plan(&self, spec: &LaunchSpec<'_>) -> Result<LaunchPlan> {
        let node = spec.node;
        let (Some(gdb), Some(serial), Some(monitor)) =
            (spec.ports.debug, spec.ports.console, spec.ports.monitor)
        else {
            return Err(SimError::Internal(format!(
                "{}: QEMU needs debug, console and monitor ports",
                spec.instance_id
            )));
        };

        let family = CpuFamily::from_processor(&node.processor.kind);
        let program = match family {
            CpuFamily::CortexM | CpuFamily::Arm32 => &spec.binaries.qemu_arm,
            CpuFamily::Aarch64 => &spec.binaries.qemu_aarch64,
            CpuFamily::RiscV32 => &spec.binaries.qemu_riscv32,
            CpuFamily::RiscV64 => &spec.binaries.qemu_riscv64,
            CpuFamily::X86_64 => &spec.binaries.qemu_x86_64,
        };
        let default_machine = match family {
            CpuFamily::X86_64 => "pc",
            _ => "virt",
        };
        let machine = node
            .processor
            .features
            .get("machine")
            .and_then(|v| v.as_str())
            .unwrap_or(default_machine);

        // savevm needs a writable qcow2 drive even on diskless boards.
        let vmstate = spec.work_dir.join("vmstate.qcow2");
        let setup = vec![SetupStep {
            program: spec.binaries.qemu_img.clone(),
            args: vec![
                "create".into(),
                "-f".into(),
                "qcow2".into(),
                vmstate.display().to_string(),
                VMSTATE_SIZE.into(),
            ],
            creates: vmstate.clone(),
        }];

        let mut args: Vec<String> = vec![
            "-machine".into(),
            machine.into(),
            "-nographic".into(),
            "-S".into(),
            "-gdb".into(),
            format!("tcp::{gdb}"),
            "-serial".into(),
            format!("tcp::{serial},server,nowait"),
            "-monitor".into(),
            format!("tcp::{monitor},server,nowait"),
            "-cpu".into(),
            qemu_cpu_model(&node.processor.kind).into(),
            "-drive".into(),
            format!(
                "if=none,format=qcow2,file={},id=vmstate",
                vmstate.display()
            ),
        ];
        if node.processor.cores > 1 {
            args.push("-smp".into());
            args.push(node.processor.cores.to_string());
        }
        let memory_mib = node.total_memory_mib();
        if memory_mib > 0 {
            args.push("-m".into());
            args.push(memory_mib.to_string());
        }
        if let Some(boot) = &spec.board.boot {
            if let Some(bootrom) = &boot.bootrom {
                args.push("-bios".into());
                args.push(bootrom.clone());
            }
            if !boot.bootargs.is_empty() {
                args.push("-append".into());
                args.push(boot.bootargs.join(" "));
            }
        }

        Ok(LaunchPlan {
            program: program.clone(),
            args,
            files: Vec::new(),
            setup,
            console_port: Some(serial),
        })
    }

    fn monitor_prompt(&self) -> &'static str {
        "(qemu) "
    }

    fn monitor_script(
        &self,
        _instance_id: &str,
        _ports: PortSet,
        action: MonitorAction<'_>,
    ) -> Option<Vec<String>> {
        let script = match action {
            MonitorAction::Reset => vec!["system_reset".to_string()],
            MonitorAction::SaveSnapshot { tag, .. } => vec![format!("savevm {tag}")],
            MonitorAction::LoadSnapshot { tag, .. } => vec![format!("loadvm {tag}")],
            MonitorAction::StartTrace { path } => vec![
                format!("logfile {}", path.display()),
                "log exec,nochain".to_string(),
            ],
            // Images are written through the gdbstub.
            MonitorAction::LoadProgram { .. } => return None,
        };
        Some(script)
    }

    /// `Trace 0: 0x7f4c... [00000000/08000100/00000000/ff200000] func`; older
    /// releases print only the PC between the brackets.
    fn trace_pc(&self, line: &str) -> Option<u64> {
        let start = line.find('[')? + 1;
        let end = start + line[start..].find(']')?;
        let mut fields = line[start..end].split('/');
        let first = fields.next()?;
        let pc = fields.next().unwrap_or(first);
        u64::from_str_radix(pc.trim().trim_start_matches("0x"), 16).ok()
    }
}

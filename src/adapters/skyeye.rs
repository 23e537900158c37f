//! SkyEye: a standalone simulator binary configured by a generated machine file.

use super::engine::{Engine, LaunchPlan, LaunchSpec, PortLayout};
use super::{BackendType, Capabilities, FeatureFlags, Limits};
use crate::board::{AccessMode, MemoryType};
use crate::error::{Result, SimError};
use serde_json::json;

const DEFAULT_CORE: &str = "arm926ejs";

fn skyeye_core(processor: &str) -> &'static str {
    match processor {
        "ARM7TDMI" => "arm7tdmi",
        "ARM9" => "arm926ejs",
        "ARM11" => "arm1176jzf-s",
        "ARM Cortex-M3" => "cortex-m3",
        "ARM Cortex-A8" => "cortex-a8",
        _ => DEFAULT_CORE,
    }
}

/// The SkyEye engine profile.
#[derive(Debug, Clone, Copy, Default)]
pub struct SkyEye;

impl Engine for SkyEye {
    fn backend(&self) -> BackendType {
        BackendType::SkyEye
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities {
            backend: BackendType::SkyEye,
            processors: ["ARM7TDMI", "ARM9", "ARM11", "ARM Cortex-M3", "ARM Cortex-A8"]
                .map(String::from)
                .to_vec(),
            peripherals: ["UART", "GPIO", "Timer", "Ethernet"]
                .map(String::from)
                .to_vec(),
            buses: ["AMBA", "AHB"].map(String::from).to_vec(),
            features: FeatureFlags {
                gdb_support: true,
                ..FeatureFlags::default()
            },
            limits: Limits {
                max_cores: 1,
                max_memory_gb: 4,
                max_peripherals: 32,
                max_hw_breakpoints: 2,
            },
        }
    }

    fn port_layout(&self) -> PortLayout {
        PortLayout {
            debug: true,
            console: false,
            monitor: false,
        }
    }

    fn launch_plan(&self, spec: &LaunchSpec<'_>) -> Result<LaunchPlan> {
        let Some(gdb) = spec.ports.debug else {
            return Err(SimError::Internal(format!(
                "{}: SkyEye needs a debug port",
                spec.instance_id
            )));
        };
        let node = spec.node;

        let memory: Vec<_> = node
            .memory
            .iter()
            .map(|r| {
                json!({
                    "type": match r.kind {
                        MemoryType::Ram => "ram",
                        MemoryType::Rom => "rom",
                        MemoryType::Flash => "flash",
                    },
                    "base": format!("{:#x}", r.address),
                    "size": format!("{:#x}", r.size),
                    "readonly": !matches!(r.access, AccessMode::ReadWrite | AccessMode::WriteOnly),
                })
            })
            .collect();
        let devices: Vec<_> = node
            .peripherals
            .iter()
            .filter_map(|p| {
                let address = p.address?;
                Some(json!({
                    "name": p.name,
                    "type": p.kind.to_ascii_lowercase(),
                    "base": format!("{address:#x}"),
                    "irq": p.irq.first(),
                }))
            })
            .collect();
        let boot = spec.board.boot.as_ref();
        let config = json!({
            "machine": spec.instance_id,
            "cpu": {
                "core": skyeye_core(&node.processor.kind),
                "frequency": node.processor.frequency,
            },
            "memory": memory,
            "devices": devices,
            "gdb": { "port": gdb },
            "boot": {
                "image": boot.and_then(|b| b.bootrom.clone()),
                "args": boot.map(|b| b.bootargs.join(" ")).unwrap_or_default(),
            },
        });
        let text = serde_json::to_string_pretty(&config)
            .map_err(|e| SimError::Internal(format!("encode SkyEye config: {e}")))?;

        let conf_path = spec.work_dir.join("skyeye.json");
        Ok(LaunchPlan {
            program: spec.binaries.skyeye.clone(),
            args: vec!["-c".to_string(), conf_path.display().to_string()],
            files: vec![(conf_path, text)],
            setup: Vec::new(),
            console_port: None,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::PortSet;
    use crate::board::tests::sample_board;
    use crate::config::EngineBinaries;
    use serde_json::Value;
    use std::path::Path;

    #[test]
    fn test_launch_plan_generates_machine_file() {
        let mut board = sample_board(BackendType::SkyEye);
        board.nodes[0].processor.kind = "ARM7TDMI".to_string();
        let binaries = EngineBinaries::default();
        let spec = LaunchSpec {
            instance_id: "skyeye-s1",
            board: &board,
            node: &board.nodes[0],
            ports: PortSet {
                debug: Some(15000),
                ..PortSet::default()
            },
            work_dir: Path::new("/tmp/skyeye-s1"),
            binaries: &binaries,
        };
        let plan = SkyEye.launch_plan(&spec).expect("plan");
        assert_eq!(plan.program, "skyeye");
        assert_eq!(plan.args, ["-c", "/tmp/skyeye-s1/skyeye.json"]);

        let conf: Value = serde_json::from_str(&plan.files[0].1).expect("json");
        assert_eq!(conf["cpu"]["core"], "arm7tdmi");
        assert_eq!(conf["gdb"]["port"], 15000);
        assert_eq!(conf["memory"][0]["base"], "0x20000000");
        assert_eq!(conf["memory"][0]["readonly"], false);
    }

    #[test]
    fn test_capabilities_are_consistent() {
        let caps = SkyEye.capabilities();
        assert!(caps.features.gdb_support);
        assert!(!caps.features.snapshot);
        assert!(!caps.features.coverage);
        assert_eq!(caps.limits.max_cores, 1);
        assert_eq!(skyeye_core("ARM Cortex-M4"), DEFAULT_CORE);
    }
}

//! Broker configuration.

use crate::adapters::{BackendType, DEFAULT_PORT_RANGE_END, DEFAULT_PORT_RANGE_START};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::warn;

/// Program paths of the simulation engines.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineBinaries {
    pub qemu_arm: String,
    pub qemu_aarch64: String,
    pub qemu_riscv32: String,
    pub qemu_riscv64: String,
    pub qemu_x86_64: String,
    pub renode: String,
    pub skyeye: String,
    /// Creates the disk image QEMU stores snapshots in.
    pub qemu_img: String,
    /// Command prepended to every engine invocation, e.g. a sandbox wrapper.
    /// Its first element is the program actually executed.
    pub launcher_prefix: Vec<String>,
}

impl Default for EngineBinaries {
    fn default() -> Self {
        Self {
            qemu_arm: "qemu-system-arm".to_string(),
            qemu_aarch64: "qemu-system-aarch64".to_string(),
            qemu_riscv32: "qemu-system-riscv32".to_string(),
            qemu_riscv64: "qemu-system-riscv64".to_string(),
            qemu_x86_64: "qemu-system-x86_64".to_string(),
            renode: "renode".to_string(),
            skyeye: "skyeye".to_string(),
            qemu_img: "qemu-img".to_string(),
            launcher_prefix: Vec::new(),
        }
    }
}

/// Settings shared by the adapters and the session service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BrokerConfig {
    /// Per-instance scratch space (generated engine configs, uploaded programs).
    pub work_dir: PathBuf,
    /// Exported coverage and trace artifacts.
    pub artifact_dir: PathBuf,
    pub snapshot_dir: PathBuf,
    /// First port handed to engines (inclusive).
    pub port_range_start: u16,
    /// End of the engine port range (exclusive).
    pub port_range_end: u16,
    /// Host name reported in GDB server addresses.
    pub advertise_host: String,
    pub max_instances_per_backend: usize,
    pub default_backend: BackendType,
    /// How long PowerOn watches a fresh engine for an immediate exit.
    pub startup_grace_ms: u64,
    /// How long to wait for a killed engine to be reaped.
    pub shutdown_timeout_ms: u64,
    /// How long PowerOn keeps trying to reach the engine's GDB stub.
    pub debug_attach_timeout_ms: u64,
    /// Budget for one debug or monitor request.
    pub debug_timeout_ms: u64,
    /// How long Continue waits for the target to stop before reporting it running.
    pub continue_window_ms: u64,
    pub binaries: EngineBinaries,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            work_dir: PathBuf::from("./work"),
            artifact_dir: PathBuf::from("./artifacts"),
            snapshot_dir: PathBuf::from("./snapshots"),
            port_range_start: DEFAULT_PORT_RANGE_START,
            port_range_end: DEFAULT_PORT_RANGE_END,
            advertise_host: "localhost".to_string(),
            max_instances_per_backend: 64,
            default_backend: BackendType::Qemu,
            startup_grace_ms: 300,
            shutdown_timeout_ms: 3000,
            debug_attach_timeout_ms: 5000,
            debug_timeout_ms: 5000,
            continue_window_ms: 2000,
            binaries: EngineBinaries::default(),
        }
    }
}

impl BrokerConfig {
    /// Configuration rooted under a single directory; used by tests and the CLI.
    pub fn rooted_at(root: &Path) -> Self {
        Self {
            work_dir: root.join("work"),
            artifact_dir: root.join("artifacts"),
            snapshot_dir: root.join("snapshots"),
            ..Self::default()
        }
    }

    pub fn instance_work_dir(&self, backend: BackendType, instance_id: &str) -> PathBuf {
        self.work_dir.join(backend.as_str()).join(instance_id)
    }

    pub fn instance_artifact_dir(&self, backend: BackendType, instance_id: &str) -> PathBuf {
        self.artifact_dir.join(backend.as_str()).join(instance_id)
    }

    pub fn instance_snapshot_dir(&self, backend: BackendType, instance_id: &str) -> PathBuf {
        self.snapshot_dir.join(backend.as_str()).join(instance_id)
    }

    pub fn startup_grace(&self) -> Duration {
        Duration::from_millis(self.startup_grace_ms)
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_millis(self.shutdown_timeout_ms)
    }

    pub fn debug_attach_timeout(&self) -> Duration {
        Duration::from_millis(self.debug_attach_timeout_ms)
    }

    pub fn debug_timeout(&self) -> Duration {
        Duration::from_millis(self.debug_timeout_ms)
    }

    pub fn continue_window(&self) -> Duration {
        Duration::from_millis(self.continue_window_ms)
    }

    /// Create the per-backend directory trees. Failures are logged, not fatal;
    /// the first instance that needs a missing directory reports the error.
    pub fn prepare_dirs(&self) {
        for root in [&self.work_dir, &self.artifact_dir, &self.snapshot_dir] {
            for backend in BackendType::ALL {
                let dir = root.join(backend.as_str());
                if let Err(e) = std::fs::create_dir_all(&dir) {
                    warn!(path = %dir.display(), error = %e, "Failed to create directory");
                }
            }
        }
    }
}

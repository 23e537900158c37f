//! Declarative board descriptions.
//!
//! A [`BoardConfig`] describes a simulated system as a list of compute nodes,
//! each with a processor, a memory map and peripherals, plus optional
//! cross-node interconnect, boot and resource settings. Boards are stored and
//! transmitted as JSON and must round-trip losslessly.

mod validate;

use crate::adapters::BackendType;
use crate::error::Result;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

pub use validate::validate;

const MIB: u64 = 1024 * 1024;

fn is_false(b: &bool) -> bool {
    !*b
}

fn is_zero_u32(n: &u32) -> bool {
    *n == 0
}

fn is_zero_u64(n: &u64) -> bool {
    *n == 0
}

fn default_cores() -> u32 {
    1
}

/// Unified board configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BoardConfig {
    pub system_id: String,
    pub name: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub description: String,
    #[serde(default)]
    pub nodes: Vec<NodeConfig>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub interconnect: Option<InterconnectConfig>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub boot: Option<BootConfig>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resources: Option<ResourceConfig>,
}

impl BoardConfig {
    /// Parse a board from its JSON text form.
    pub fn from_json(text: &str) -> Result<Self> {
        Ok(serde_json::from_str(text)?)
    }

    /// Serialize a board to its JSON text form.
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    /// Check structural invariants. See [`validate`].
    pub fn validate(&self) -> Result<()> {
        validate(self)
    }

    /// Look up a node by ID.
    pub fn node(&self, id: &str) -> Option<&NodeConfig> {
        self.nodes.iter().find(|n| n.id == id)
    }

    /// Nodes owned by the given backend, in declaration order.
    pub fn nodes_for(&self, backend: BackendType) -> impl Iterator<Item = &NodeConfig> {
        self.nodes.iter().filter(move |n| n.backend == backend)
    }

    /// First node owned by `backend`; the node an adapter drives directly.
    pub fn primary_node(&self, backend: BackendType) -> Option<&NodeConfig> {
        self.nodes_for(backend).next()
    }
}

/// A single compute node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeConfig {
    pub id: String,
    pub backend: BackendType,
    pub processor: ProcessorConfig,
    #[serde(default)]
    pub memory: Vec<MemoryRegion>,
    #[serde(default)]
    pub peripherals: Vec<PeripheralConfig>,
}

impl NodeConfig {
    /// Sum of all declared memory region sizes, in bytes.
    pub fn total_memory_bytes(&self) -> u64 {
        self.memory
            .iter()
            .fold(0u64, |acc, r| acc.saturating_add(r.size))
    }

    /// Aggregate memory size in MiB, rounded up so small parts still get RAM.
    pub fn total_memory_mib(&self) -> u64 {
        let bytes = self.total_memory_bytes();
        if bytes == 0 {
            0
        } else {
            bytes.div_ceil(MIB)
        }
    }

    /// The region fully containing `[address, address + len)`, if any.
    pub fn region_containing(&self, address: u64, len: u64) -> Option<&MemoryRegion> {
        self.memory.iter().find(|r| r.contains(address, len))
    }
}

/// Processor description.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcessorConfig {
    /// Human processor name, e.g. "ARM Cortex-M4" or "RISC-V RV32".
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default = "default_cores")]
    pub cores: u32,
    /// Clock frequency in Hz.
    #[serde(default)]
    pub frequency: u64,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub features: BTreeMap<String, Value>,
}

/// Kind of memory backing a region.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MemoryType {
    #[serde(rename = "RAM")]
    Ram,
    #[serde(rename = "ROM")]
    Rom,
    Flash,
}

/// Access permitted on a region.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AccessMode {
    #[serde(rename = "RW")]
    ReadWrite,
    #[serde(rename = "RO")]
    ReadOnly,
    #[serde(rename = "WO")]
    WriteOnly,
    /// Read and execute; used for flash images.
    #[serde(rename = "RX")]
    ReadExecute,
}

impl AccessMode {
    pub fn readable(self) -> bool {
        !matches!(self, AccessMode::WriteOnly)
    }

    pub fn writable(self) -> bool {
        matches!(self, AccessMode::ReadWrite | AccessMode::WriteOnly)
    }
}

/// A contiguous memory region.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MemoryRegion {
    #[serde(rename = "type")]
    pub kind: MemoryType,
    pub address: u64,
    pub size: u64,
    pub access: AccessMode,
    /// Aliased regions may overlap other regions of the same node.
    #[serde(default, skip_serializing_if = "is_false")]
    pub alias: bool,
}

impl MemoryRegion {
    /// Exclusive end address, or `None` if the region wraps the address space.
    pub fn end(&self) -> Option<u64> {
        self.address.checked_add(self.size)
    }

    pub fn contains(&self, address: u64, len: u64) -> bool {
        let Some(end) = self.end() else {
            return false;
        };
        let Some(req_end) = address.checked_add(len) else {
            return false;
        };
        address >= self.address && req_end <= end
    }

    pub fn overlaps(&self, other: &MemoryRegion) -> bool {
        match (self.end(), other.end()) {
            (Some(a_end), Some(b_end)) => self.address < b_end && other.address < a_end,
            _ => true,
        }
    }
}

/// A peripheral device attached to a node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PeripheralConfig {
    #[serde(rename = "type")]
    pub kind: String,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub address: Option<u64>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub irq: Vec<u32>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub properties: BTreeMap<String, Value>,
}

/// Cross-node connections.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct InterconnectConfig {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub shared_memory: Vec<SharedMemoryConfig>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub mmio_map: Vec<MmioMapping>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub irq_routes: Vec<IrqRoute>,
}

/// Memory shared by several nodes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SharedMemoryConfig {
    pub id: String,
    pub address: u64,
    pub size: u64,
    pub nodes: Vec<String>,
}

/// Memory-mapped I/O window routed from one node to another.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MmioMapping {
    pub source_node: String,
    pub target_node: String,
    pub address: u64,
    pub size: u64,
}

/// Interrupt line routed between nodes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IrqRoute {
    pub source_node: String,
    pub source_irq: u32,
    pub target_node: String,
    pub target_irq: u32,
    /// Delivery latency in cycles.
    #[serde(default, skip_serializing_if = "is_zero_u32")]
    pub latency: u32,
}

/// Boot settings.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BootConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bootrom: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub bootargs: Vec<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub env: BTreeMap<String, String>,
}

/// Resource ceiling for one instance. Zero means "adapter default".
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceConfig {
    #[serde(default, skip_serializing_if = "is_zero_u32")]
    pub cpu_cores: u32,
    #[serde(default, skip_serializing_if = "is_zero_u64")]
    pub memory_mb: u64,
    #[serde(default, skip_serializing_if = "is_zero_u64")]
    pub disk_gb: u64,
    #[serde(default, skip_serializing_if = "is_zero_u64")]
    pub timeout_sec: u64,
}

impl ResourceConfig {
    pub fn cpu_limit(&self) -> Option<u32> {
        (self.cpu_cores > 0).then_some(self.cpu_cores)
    }

    pub fn memory_limit_mb(&self) -> Option<u64> {
        (self.memory_mb > 0).then_some(self.memory_mb)
    }

    pub fn timeout(&self) -> Option<std::time::Duration> {
        (self.timeout_sec > 0).then(|| std::time::Duration::from_secs(self.timeout_sec))
    }
}

//! Structural validation of board configurations.

use super::{BoardConfig, NodeConfig};
use crate::error::{Result, SimError};
use std::collections::HashSet;

/// Reject boards that no adapter could build.
///
/// Checks node identity, processor and memory sanity, overlapping regions
/// (unless one side is marked as an alias) and that every node named by the
/// interconnect exists.
pub fn validate(board: &BoardConfig) -> Result<()> {
    if board.nodes.is_empty() {
        return Err(invalid("board declares no nodes"));
    }

    let mut ids = HashSet::new();
    for node in &board.nodes {
        if node.id.trim().is_empty() {
            return Err(invalid("node with empty id"));
        }
        if !ids.insert(node.id.as_str()) {
            return Err(invalid(format!("duplicate node id {}", node.id)));
        }
        validate_node(node)?;
    }

    if let Some(ic) = &board.interconnect {
        for shm in &ic.shared_memory {
            if shm.size == 0 {
                return Err(invalid(format!("shared memory {} has zero size", shm.id)));
            }
            if shm.nodes.is_empty() {
                return Err(invalid(format!("shared memory {} names no nodes", shm.id)));
            }
            for node in &shm.nodes {
                require_node(&ids, node, &format!("shared memory {}", shm.id))?;
            }
        }
        for route in &ic.mmio_map {
            require_node(&ids, &route.source_node, "mmio route source")?;
            require_node(&ids, &route.target_node, "mmio route target")?;
            if route.size == 0 {
                return Err(invalid(format!(
                    "mmio route {} -> {} has zero size",
                    route.source_node, route.target_node
                )));
            }
        }
        for route in &ic.irq_routes {
            require_node(&ids, &route.source_node, "irq route source")?;
            require_node(&ids, &route.target_node, "irq route target")?;
        }
    }

    Ok(())
}

fn validate_node(node: &NodeConfig) -> Result<()> {
    if node.processor.kind.trim().is_empty() {
        return Err(invalid(format!("node {}: processor type is empty", node.id)));
    }
    if node.processor.cores == 0 {
        return Err(invalid(format!("node {}: core count must be >= 1", node.id)));
    }

    for (i, region) in node.memory.iter().enumerate() {
        if region.size == 0 {
            return Err(invalid(format!(
                "node {}: memory region at {:#x} has zero size",
                node.id, region.address
            )));
        }
        if region.end().is_none() {
            return Err(invalid(format!(
                "node {}: memory region at {:#x} wraps the address space",
                node.id, region.address
            )));
        }
        for other in &node.memory[..i] {
            if region.alias || other.alias {
                continue;
            }
            if region.overlaps(other) {
                return Err(invalid(format!(
                    "node {}: memory regions at {:#x} and {:#x} overlap",
                    node.id, other.address, region.address
                )));
            }
        }
    }

    let mut names = HashSet::new();
    for p in &node.peripherals {
        if p.name.trim().is_empty() {
            return Err(invalid(format!("node {}: peripheral with empty name", node.id)));
        }
        if !names.insert(p.name.as_str()) {
            return Err(invalid(format!(
                "node {}: duplicate peripheral name {}",
                node.id, p.name
            )));
        }
    }

    Ok(())
}

fn require_node(ids: &HashSet<&str>, node: &str, what: &str) -> Result<()> {
    if ids.contains(node) {
        Ok(())
    } else {
        Err(invalid(format!("{what} references unknown node {node}")))
    }
}

fn invalid(msg: impl Into<String>) -> SimError {
    SimError::InvalidConfig(msg.into())
}

//! Simulator session broker.
//!
//! This library brokers access to heterogeneous hardware simulators behind
//! one instance-lifecycle and debug interface. A client creates a session
//! against a backend, powers it on, loads and runs programs, and inspects or
//! steers the simulated target without knowing which engine backs it.
//!
//! # Architecture
//!
//! - **Board model** ([`board`]): declarative multi-node hardware description,
//!   serialized as JSON and validated before any engine sees it.
//!
//! - **Adapters** ([`adapters`]): the [`BackendAdapter`] contract and its
//!   three implementations over QEMU, Renode and SkyEye. Each adapter owns
//!   its instances, spawns and supervises the engine process, and answers
//!   debug, memory, snapshot and analysis requests.
//!
//! - **Port allocator** ([`PortAllocator`]): one bounded, releasable port
//!   pool shared by every adapter so engines never collide on a socket.
//!
//! - **Session service** ([`session`]): binds each durable session record to
//!   exactly one adapter instance, validates status transitions and routes
//!   calls to the owning adapter.
//!
//! # Operations
//!
//! ## Instance lifecycle
//! - `create_instance` / `destroy_instance`: reserve and release ports and slots
//! - `power_on` / `power_off` / `reset` / `suspend` / `resume`
//!
//! ## Programs
//! - `upload_program` (ELF or raw BIN), `start_program`, `pause_program`,
//!   `stop_program`, `list_programs`
//!
//! ## Debugging
//! - `set_breakpoint` / `remove_breakpoint` / `list_breakpoints`
//! - `step_instruction` / `continue_execution`
//! - `read_registers` / `write_register` / `read_memory` / `write_memory`
//!
//! ## State and analysis
//! - `create_snapshot` / `restore_snapshot` / `list_snapshots`
//! - `export_coverage` / `export_trace`: JSON artifacts referenced by path
//!
//! ## Bridges
//! - `gdb_server_address`: `host:port` of the engine's GDB remote endpoint
//! - `console_stream`: attachable console output

use std::path::PathBuf;

pub mod adapters;
pub mod board;
pub mod config;
pub mod error;
pub mod session;

pub use adapters::{
    build_adapters, BackendAdapter, BackendType, Capabilities, ConsoleStream, OpContext,
    PortAllocator, QemuAdapter, RenodeAdapter, SkyEyeAdapter,
};
pub use board::BoardConfig;
pub use config::{BrokerConfig, EngineBinaries};
pub use error::{ErrorKind, Result, SimError};
pub use session::{Caller, CreateSessionRequest, MemoryStore, PowerAction, SessionService};

/// Expand `~/` prefix to the user's home directory.
pub fn expand_path(path: &str) -> PathBuf {
    path.strip_prefix("~/")
        .and_then(|stripped| std::env::var_os("HOME").map(|h| PathBuf::from(h).join(stripped)))
        .unwrap_or_else(|| PathBuf::from(path))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_expand_path_leaves_plain_paths() {
        assert_eq!(expand_path("boards/a.json"), PathBuf::from("boards/a.json"));
        assert_eq!(expand_path("/abs/b.json"), PathBuf::from("/abs/b.json"));
    }
}

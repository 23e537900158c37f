#![allow(dead_code)]

pub mod target;

use bytes::Bytes;
use std::path::Path;
use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::Arc;
use std::time::Duration;
use virserver::adapters::{PortAllocator, ProgramFormat, ProgramMetadata};
use virserver::{BackendAdapter, BackendType, BoardConfig, BrokerConfig};

pub use target::{FakeTarget, LOOP_LEN, STUB_RAM};

/// Engine stand-in that stays up until killed.
pub const IDLE_ENGINE: &str = "exec sleep 30";
/// Engine stand-in that survives startup, then crashes.
pub const CRASHING_ENGINE: &str = "sleep 1; exit 7";

pub const RAM_BASE: u64 = 0x2000_0000;
pub const FLASH_BASE: u64 = 0x0800_0000;

/// One Cortex-M4 node with 256 KiB of flash and 128 KiB of RAM.
pub fn board_json(backend: BackendType) -> String {
    format!(
        r#"{{
            "system_id": "test-board",
            "name": "Test Board",
            "nodes": [{{
                "id": "mcu",
                "backend": "{backend}",
                "processor": {{"type": "ARM Cortex-M4", "cores": 1, "frequency": 168000000}},
                "memory": [
                    {{"type": "Flash", "address": {FLASH_BASE}, "size": 262144, "access": "RX"}},
                    {{"type": "RAM", "address": {RAM_BASE}, "size": 131072, "access": "RW"}}
                ],
                "peripherals": [{{"type": "UART", "name": "USART2", "address": 1073759232}}]
            }}]
        }}"#
    )
}

pub fn board(backend: BackendType) -> BoardConfig {
    BoardConfig::from_json(&board_json(backend)).expect("test board parses")
}

/// Broker rooted in `root` whose engines are replaced by `sh -c <script>`.
/// The engine's sockets are served by a [`FakeTarget`].
pub fn broker(root: &Path, script: &str) -> BrokerConfig {
    let mut config = BrokerConfig::rooted_at(root);
    config.binaries.launcher_prefix = ["sh", "-c", script, "engine"]
        .iter()
        .map(|s| s.to_string())
        .collect();
    config.binaries.qemu_img = "true".to_string();
    config.startup_grace_ms = 50;
    config.shutdown_timeout_ms = 2000;
    config.debug_attach_timeout_ms = 1000;
    config.debug_timeout_ms = 2000;
    config.continue_window_ms = 300;
    config
}

static NEXT_PORT: AtomicU16 = AtomicU16::new(21000);

/// A port range of `size` no other test in this binary shares, so fake
/// engines of concurrent tests never bind the same port.
pub fn port_pool(size: u16) -> Arc<PortAllocator> {
    let start = NEXT_PORT.fetch_add(size, Ordering::Relaxed);
    Arc::new(PortAllocator::new(start, start + size))
}

/// Serve the sockets of `instance_id` before it is powered on.
pub async fn fake_target<A: BackendAdapter + ?Sized>(adapter: &A, instance_id: &str) -> FakeTarget {
    let info = adapter.instance_info(instance_id).await.expect("info");
    FakeTarget::serve(info.ports).await
}

/// A raw 64-byte image loaded at the start of RAM.
pub fn ram_program() -> (Bytes, ProgramMetadata) {
    let image: Vec<u8> = (0u8..64).collect();
    let meta = ProgramMetadata {
        name: "blink.bin".to_string(),
        format: ProgramFormat::Bin,
        entry_point: None,
        load_addr: Some(RAM_BASE),
        metadata: Default::default(),
    };
    (Bytes::from(image), meta)
}

/// Poll `f` until it yields `Some`, for at most `limit`.
pub async fn eventually<T, F, Fut>(limit: Duration, mut f: F) -> Option<T>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Option<T>>,
{
    let deadline = tokio::time::Instant::now() + limit;
    loop {
        if let Some(value) = f().await {
            return Some(value);
        }
        if tokio::time::Instant::now() >= deadline {
            return None;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
}

//! Port allocation for engine debug, console and monitor endpoints.

use crate::error::{Result, SimError};
use std::collections::HashSet;
use std::sync::Mutex;

/// Default starting port for engine endpoints.
pub const DEFAULT_PORT_RANGE_START: u16 = 10000;
/// Default ending port for engine endpoints.
pub const DEFAULT_PORT_RANGE_END: u16 = 20000;

struct PortState {
    used: HashSet<u16>,
    /// Next candidate; allocation resumes here so released ports are reused last.
    cursor: u16,
}

/// Allocates TCP ports within a configured range.
///
/// One allocator is shared by every adapter in the process so engines of
/// different kinds never collide on a port.
pub struct PortAllocator {
    /// Starting port (inclusive).
    base_port: u16,
    /// Maximum port (exclusive).
    max_port: u16,
    state: Mutex<PortState>,
}

impl PortAllocator {
    /// Create a new port allocator with the given range.
    pub fn new(base_port: u16, max_port: u16) -> Self {
        let max_port = max_port.max(base_port);
        Self {
            base_port,
            max_port,
            state: Mutex::new(PortState {
                used: HashSet::new(),
                cursor: base_port,
            }),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, PortState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn capacity(&self) -> usize {
        (self.max_port - self.base_port) as usize
    }

    /// Allocate the next available port.
    pub fn allocate(&self) -> Result<u16> {
        self.allocate_many(1).map(|ports| ports[0])
    }

    /// Allocate `count` distinct ports, all or nothing.
    pub fn allocate_many(&self, count: usize) -> Result<Vec<u16>> {
        let mut state = self.lock();
        let free = self.capacity().saturating_sub(state.used.len());
        if count > free {
            return Err(SimError::ResourceExhausted(format!(
                "need {count} ports, {free} free in {}..{}",
                self.base_port, self.max_port
            )));
        }

        let mut ports = Vec::with_capacity(count);
        let mut candidate = state.cursor;
        while ports.len() < count {
            if candidate < self.base_port || candidate >= self.max_port {
                candidate = self.base_port;
            }
            if state.used.insert(candidate) {
                ports.push(candidate);
            }
            candidate = candidate.wrapping_add(1);
        }
        state.cursor = candidate;
        Ok(ports)
    }

    /// Release a previously allocated port.
    pub fn release(&self, port: u16) {
        let mut state = self.lock();
        state.used.remove(&port);
    }

    /// Release a batch of ports.
    pub fn release_all(&self, ports: &[u16]) {
        let mut state = self.lock();
        for port in ports {
            state.used.remove(port);
        }
    }

    /// Get the number of currently allocated ports.
    pub fn allocated_count(&self) -> usize {
        self.lock().used.len()
    }

    /// Get the number of available ports.
    pub fn available_count(&self) -> usize {
        self.capacity().saturating_sub(self.allocated_count())
    }

    /// Check if a specific port is available.
    pub fn is_available(&self, port: u16) -> bool {
        if port < self.base_port || port >= self.max_port {
            return false;
        }
        !self.lock().used.contains(&port)
    }
}

impl Default for PortAllocator {
    fn default() -> Self {
        Self::new(DEFAULT_PORT_RANGE_START, DEFAULT_PORT_RANGE_END)
    }
}

impl std::fmt::Debug for PortAllocator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PortAllocator")
            .field("range", &(self.base_port..self.max_port))
            .field("allocated", &self.allocated_count())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use std::sync::Arc;

    #[test]
    fn test_allocate_and_release() {
        let allocator = PortAllocator::new(13400, 13403);

        assert_eq!(allocator.allocate(), Ok(13400));
        assert_eq!(allocator.allocate(), Ok(13401));
        assert_eq!(allocator.allocate(), Ok(13402));
        assert_eq!(
            allocator.allocate().unwrap_err().kind(),
            ErrorKind::ResourceExhausted
        );

        allocator.release(13401);
        assert_eq!(allocator.allocate(), Ok(13401));
        assert!(allocator.allocate().is_err());
    }

    #[test]
    fn test_released_port_is_not_reissued_first() {
        let allocator = PortAllocator::new(13400, 13410);
        let first = allocator.allocate().expect("port");
        allocator.release(first);
        let second = allocator.allocate().expect("port");
        assert_ne!(first, second);
    }

    #[test]
    fn test_allocate_many_is_all_or_nothing() {
        let allocator = PortAllocator::new(13400, 13405);
        let triple = allocator.allocate_many(3).expect("triple");
        assert_eq!(triple, vec![13400, 13401, 13402]);

        let err = allocator.allocate_many(3).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ResourceExhausted);
        assert_eq!(allocator.allocated_count(), 3);

        allocator.release_all(&triple);
        assert_eq!(allocator.allocated_count(), 0);
    }

    #[test]
    fn test_available_count() {
        let allocator = PortAllocator::new(13400, 13405);
        assert_eq!(allocator.available_count(), 5);
        assert_eq!(allocator.allocated_count(), 0);

        let _ = allocator.allocate();
        let _ = allocator.allocate();
        assert_eq!(allocator.available_count(), 3);
        assert_eq!(allocator.allocated_count(), 2);
        assert!(!allocator.is_available(13400));
        assert!(allocator.is_available(13404));
        assert!(!allocator.is_available(13405));
    }

    #[test]
    fn test_concurrent_allocation_never_collides() {
        let allocator = Arc::new(PortAllocator::new(20000, 20600));
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let allocator = allocator.clone();
                std::thread::spawn(move || {
                    (0..25)
                        .map(|_| allocator.allocate_many(3).expect("ports"))
                        .collect::<Vec<_>>()
                })
            })
            .collect();

        let mut seen = HashSet::new();
        for handle in handles {
            for batch in handle.join().expect("thread") {
                for port in batch {
                    assert!(seen.insert(port), "port {port} issued twice");
                }
            }
        }
        assert_eq!(seen.len(), 600);
    }
}

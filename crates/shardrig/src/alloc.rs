//! Port allocation seam.
//!
//! Ports are handed out by an external allocator and injected into the
//! orchestrator; the core never reaches into shared global state. Tests use
//! [`SequentialPortAllocator`] for deterministic port assignment.

use std::net::TcpListener;
use std::sync::atomic::{AtomicU16, Ordering};

use crate::error::Result;

/// Hands out unique ports for fixture processes.
pub trait PortAllocator: Send + Sync {
    /// Returns the next free port.
    fn next_port(&self) -> Result<u16>;
}

/// Asks the operating system for an ephemeral port by binding to port zero.
#[derive(Debug, Default)]
pub struct EphemeralPortAllocator;

impl EphemeralPortAllocator {
    /// Creates the allocator.
    pub fn new() -> Self {
        Self
    }
}

impl PortAllocator for EphemeralPortAllocator {
    fn next_port(&self) -> Result<u16> {
        let listener = TcpListener::bind("127.0.0.1:0")?;
        Ok(listener.local_addr()?.port())
    }
}

/// Hands out consecutive ports from a fixed base. Deterministic, for tests
/// and for runners that partition port ranges per job.
#[derive(Debug)]
pub struct SequentialPortAllocator {
    next: AtomicU16,
}

impl SequentialPortAllocator {
    /// Creates an allocator starting at `base`.
    pub fn starting_at(base: u16) -> Self {
        Self {
            next: AtomicU16::new(base),
        }
    }
}

impl PortAllocator for SequentialPortAllocator {
    fn next_port(&self) -> Result<u16> {
        Ok(self.next.fetch_add(1, Ordering::SeqCst))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sequential_allocator() {
        let allocator = SequentialPortAllocator::starting_at(20000);
        assert_eq!(allocator.next_port().unwrap(), 20000);
        assert_eq!(allocator.next_port().unwrap(), 20001);
        assert_eq!(allocator.next_port().unwrap(), 20002);
    }

    #[test]
    fn test_ephemeral_allocator_returns_nonzero() {
        let allocator = EphemeralPortAllocator;
        assert_ne!(allocator.next_port().unwrap(), 0);
    }
}

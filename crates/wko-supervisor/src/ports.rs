// ABOUTME: PortAllocator: hands out ports from the configured range after a live bind probe.
// ABOUTME: Pinned worker ports are reserved up front and never enter the pool.

use crate::error::SupervisorError;
use std::collections::BTreeSet;
use std::net::{Ipv4Addr, TcpListener};
use std::sync::{Mutex, MutexGuard, PoisonError};
use wko_supervisor_core::PortRange;

pub struct PortAllocator {
    range: PortRange,
    free: Mutex<BTreeSet<u16>>,
}

impl PortAllocator {
    pub fn new(range: PortRange, reserved: impl IntoIterator<Item = u16>) -> Self {
        let mut free: BTreeSet<u16> = (range.start..=range.end).collect();
        for port in reserved {
            free.remove(&port);
        }
        Self {
            range,
            free: Mutex::new(free),
        }
    }

    pub fn range(&self) -> PortRange {
        self.range
    }

    /// Ports currently in the pool (not leased, not reserved).
    pub fn available(&self) -> usize {
        self.free().len()
    }

    /// Lease the lowest free port that can actually be bound right now.
    ///
    /// The pool alone is not trusted: other processes on the host may hold a
    /// pooled port, so each candidate is bound and released before it is handed out.
    pub fn allocate(&self) -> Result<u16, SupervisorError> {
        let mut free = self.free();
        let port = free.iter().copied().find(|port| bind_probe(*port));

        match port {
            Some(port) => {
                free.remove(&port);
                tracing::debug!(port, "Allocated port");
                Ok(port)
            }
            None => Err(SupervisorError::ResourceExhausted(format!(
                "No available ports in range {}-{}",
                self.range.start, self.range.end
            ))),
        }
    }

    /// Return a leased port to the pool. Idempotent.
    pub fn release(&self, port: u16) {
        if !self.range.contains(port) {
            return;
        }
        if self.free().insert(port) {
            tracing::debug!(port, "Released port");
        }
    }

    fn free(&self) -> MutexGuard<'_, BTreeSet<u16>> {
        self.free.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

fn bind_probe(port: u16) -> bool {
    TcpListener::bind((Ipv4Addr::LOCALHOST, port)).is_ok()
}

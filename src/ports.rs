//! Host port allocation for sandbox sessions.
//!
//! The allocator is the only mutable state shared between concurrent runs.
//! Leases live in a mutex-guarded ledger so two sessions can never be handed
//! the same port, and a rotating cursor spreads allocations over the range so
//! a just-released port is not immediately reused while its old container is
//! still winding down.

use std::collections::BTreeSet;
use std::net::TcpListener;
use std::sync::Mutex;

use crate::error::SandboxStartError;

#[derive(Debug)]
struct Ledger {
    leased: BTreeSet<u16>,
    cursor: u16,
}

/// Hands out unique host ports from a fixed inclusive range.
#[derive(Debug)]
pub struct PortAllocator {
    start: u16,
    end: u16,
    probe_bind: bool,
    ledger: Mutex<Ledger>,
}

impl PortAllocator {
    /// Creates an allocator over `start..=end` that skips ports the OS
    /// refuses to bind.
    pub fn new(start: u16, end: u16) -> Self {
        Self {
            start,
            end,
            probe_bind: true,
            ledger: Mutex::new(Ledger {
                leased: BTreeSet::new(),
                cursor: start,
            }),
        }
    }

    /// Disables the bind check, trusting the ledger alone.
    pub fn without_bind_check(mut self) -> Self {
        self.probe_bind = false;
        self
    }

    /// Reserves a free port.
    pub fn allocate(&self) -> Result<u16, SandboxStartError> {
        let mut ledger = self
            .ledger
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());

        let span = (self.end as u32).saturating_sub(self.start as u32) + 1;
        let mut candidate = ledger.cursor;

        for _ in 0..span {
            let next = if candidate >= self.end {
                self.start
            } else {
                candidate + 1
            };

            if !ledger.leased.contains(&candidate) && self.is_bindable(candidate) {
                ledger.leased.insert(candidate);
                ledger.cursor = next;
                tracing::debug!(port = candidate, leased = ledger.leased.len(), "allocated port");
                return Ok(candidate);
            }

            candidate = next;
        }

        Err(SandboxStartError::PortBindFailed {
            port: 0,
            diagnostic: format!(
                "no free port in range {}-{} ({} leased)",
                self.start,
                self.end,
                ledger.leased.len()
            ),
        })
    }

    /// Returns a port to the pool. Unknown ports are ignored.
    pub fn release(&self, port: u16) {
        let mut ledger = self
            .ledger
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if ledger.leased.remove(&port) {
            tracing::debug!(port, leased = ledger.leased.len(), "released port");
        }
    }

    /// Returns a snapshot of currently leased ports.
    pub fn leased(&self) -> Vec<u16> {
        let ledger = self
            .ledger
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        ledger.leased.iter().copied().collect()
    }

    fn is_bindable(&self, port: u16) -> bool {
        !self.probe_bind || TcpListener::bind(("0.0.0.0", port)).is_ok()
    }
}

//! Injected counter handle.
//!
//! A single `Arc<Metrics>` is created at startup and handed to every
//! component that wants to count something. Tear-down is the final Arc drop;
//! cloning the handle is free and snapshotting is lock-free. Exposition
//! formats live elsewhere — the counters only surface through the health
//! snapshot.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

/// Shared atomic counters.
#[derive(Debug, Default)]
pub struct Metrics {
    cycles: AtomicU64,
    cycle_failures: AtomicU64,
    router_writes: AtomicU64,
    writes_skipped: AtomicU64,
    failovers: AtomicU64,
    probe_failures: AtomicU64,
}

/// Cloneable handle injected into components.
pub type MetricsHandle = Arc<Metrics>;

/// Point-in-time counter values for the health snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct MetricsSnapshot {
    pub cycles: u64,
    pub cycle_failures: u64,
    pub router_writes: u64,
    pub writes_skipped: u64,
    pub failovers: u64,
    pub probe_failures: u64,
}

impl Metrics {
    /// Fresh handle for injection.
    pub fn new_handle() -> MetricsHandle {
        Arc::new(Metrics::default())
    }

    pub fn incr_cycles(&self) {
        self.cycles.fetch_add(1, Ordering::Relaxed);
    }

    pub fn incr_cycle_failures(&self) {
        self.cycle_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn incr_router_writes(&self) {
        self.router_writes.fetch_add(1, Ordering::Relaxed);
    }

    pub fn incr_writes_skipped(&self) {
        self.writes_skipped.fetch_add(1, Ordering::Relaxed);
    }

    pub fn incr_failovers(&self) {
        self.failovers.fetch_add(1, Ordering::Relaxed);
    }

    pub fn incr_probe_failures(&self) {
        self.probe_failures.fetch_add(1, Ordering::Relaxed);
    }

    /// Consistent-enough snapshot (relaxed loads; counters are independent).
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            cycles: self.cycles.load(Ordering::Relaxed),
            cycle_failures: self.cycle_failures.load(Ordering::Relaxed),
            router_writes: self.router_writes.load(Ordering::Relaxed),
            writes_skipped: self.writes_skipped.load(Ordering::Relaxed),
            failovers: self.failovers.load(Ordering::Relaxed),
            probe_failures: self.probe_failures.load(Ordering::Relaxed),
        }
    }
}

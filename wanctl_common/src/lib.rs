//! wanctl Common Library
//!
//! This crate provides the shared building blocks for both wanctl daemons
//! (`wanctl_autorate` and `wanctl_steering`):
//!
//! - [`zone`] - Latency zones and steering states
//! - [`state`] - Persisted controller/steering state schemas
//! - [`ewma`] - Baseline/load EWMA discipline with the freeze-under-load rule
//! - [`ratelimit`] - Sliding-window write limiter (flash-wear protection)
//! - [`probe`] - RTT prober with ICMP→TCP fallback
//! - [`persist`] - Atomic, corruption-tolerant JSON state persistence
//! - [`health`] - Read-only health snapshot types
//! - [`lock`] - PID lock files with stale-lock cleanup
//! - [`notify`] - systemd watchdog/readiness notifications
//! - [`shutdown`] - Process-wide cooperative shutdown flag + signal handlers
//! - [`envsub`] - `${VAR}` environment interpolation for config files
//! - [`ident`] - Router-side identifier validation
//! - [`metrics`] - Injected counter handle surfaced in health snapshots
//!
//! The two daemons never share memory; everything they exchange goes through
//! the atomically written state files in [`persist`].

pub mod envsub;
pub mod ewma;
pub mod health;
pub mod ident;
pub mod lock;
pub mod metrics;
pub mod notify;
pub mod persist;
pub mod probe;
pub mod ratelimit;
pub mod shutdown;
pub mod state;
pub mod zone;

/// Schema version accepted in config and state files.
pub const SCHEMA_VERSION: &str = "1.0";

//! Read-only health snapshot types.
//!
//! The supervisor assembles one [`HealthSnapshot`] per tick and writes it
//! (hash-gated) to the status file; the HTTP endpoint that serves it is an
//! external collaborator and not part of this workspace.

use serde::Serialize;

use crate::metrics::MetricsSnapshot;
use crate::state::FailureKind;

/// Overall daemon status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Healthy,
    Degraded,
}

/// Per-direction view.
#[derive(Debug, Clone, Serialize)]
pub struct DirectionHealth {
    /// Current shaped rate [Mbit/s].
    pub current_rate_mbps: f64,
    /// Zone label (GREEN/YELLOW/SOFT_RED/RED).
    pub state: String,
}

/// Router connectivity view.
#[derive(Debug, Clone, Serialize)]
pub struct ConnectivityHealth {
    pub is_reachable: bool,
    pub consecutive_failures: u32,
    pub last_failure_type: Option<FailureKind>,
    /// Seconds since the last failure, monotonic.
    pub last_failure_age_s: Option<f64>,
    /// Present while an outage is ongoing.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub outage_duration_s: Option<f64>,
}

/// Per-WAN view.
#[derive(Debug, Clone, Serialize)]
pub struct WanHealth {
    pub name: String,
    pub baseline_rtt_ms: f64,
    pub load_rtt_ms: f64,
    pub download: DirectionHealth,
    pub upload: DirectionHealth,
    pub router_connectivity: ConnectivityHealth,
}

/// Complete snapshot.
#[derive(Debug, Clone, Serialize)]
pub struct HealthSnapshot {
    pub status: HealthStatus,
    pub uptime_seconds: u64,
    pub version: String,
    /// Worst consecutive-failure count across WANs.
    pub consecutive_failures: u32,
    /// True iff every WAN's router is reachable.
    pub router_reachable: bool,
    pub wans: Vec<WanHealth>,
    pub metrics: MetricsSnapshot,
}

impl HealthSnapshot {
    /// Degraded iff any WAN has ≥ 3 consecutive failures or is unreachable.
    pub fn status_from_wans(wans: &[WanHealth]) -> HealthStatus {
        let degraded = wans.iter().any(|w| {
            !w.router_connectivity.is_reachable || w.router_connectivity.consecutive_failures >= 3
        });
        if degraded {
            HealthStatus::Degraded
        } else {
            HealthStatus::Healthy
        }
    }
}

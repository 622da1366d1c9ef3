//! Persisted state schemas for both daemons.
//!
//! Every field defaults so a partially written or schema-drifted file
//! deserializes to something usable instead of failing the whole load.
//! Monotonic instants never enter the file; cross-restart staleness is
//! judged from wall-clock seconds.

use serde::{Deserialize, Serialize};

use crate::zone::{SteerState, Zone};

/// Classified router failure kind.
///
/// `AuthFailure` is terminal for the supervisor's watchdog policy; every
/// other kind is transient and keeps the daemon petting the watchdog.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    Timeout,
    ConnectionRefused,
    NetworkUnreachable,
    DnsFailure,
    AuthFailure,
    Unknown,
}

impl FailureKind {
    /// Whether this kind may clear on its own without admin intervention.
    pub const fn is_transient(&self) -> bool {
        !matches!(self, FailureKind::AuthFailure)
    }
}

impl std::fmt::Display for FailureKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            FailureKind::Timeout => "timeout",
            FailureKind::ConnectionRefused => "connection_refused",
            FailureKind::NetworkUnreachable => "network_unreachable",
            FailureKind::DnsFailure => "dns_failure",
            FailureKind::AuthFailure => "auth_failure",
            FailureKind::Unknown => "unknown",
        };
        f.write_str(s)
    }
}

/// Per-direction queue controller state as persisted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct DirectionState {
    /// Current shaped rate [bit/s].
    pub current_rate: u64,
    /// Consecutive Green cycles toward the next step-up.
    pub green_streak: u32,
    /// Consecutive SoftRed cycles within the sustain window (download only).
    pub soft_red_streak: u32,
    /// Consecutive Red cycles.
    pub red_streak: u32,
    /// Zone the controller last reported.
    pub last_zone: Zone,
}

/// Persisted EWMA pair.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct EwmaState {
    /// Idle-path baseline estimate [ms]. 0.0 means never seeded.
    pub baseline_rtt: f64,
    /// Load EWMA [ms]. 0.0 means never seeded.
    pub load_rtt: f64,
}

/// Last rates actually written to the router, for flash-wear de-dup.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct AppliedRates {
    /// Download rate [bit/s].
    pub dl: u64,
    /// Upload rate [bit/s].
    pub ul: u64,
}

/// Router connectivity as persisted (instants are runtime-only).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectivitySnapshot {
    pub is_reachable: bool,
    pub consecutive_failures: u32,
    pub last_failure_type: Option<FailureKind>,
}

impl Default for ConnectivitySnapshot {
    fn default() -> Self {
        Self {
            is_reachable: true,
            consecutive_failures: 0,
            last_failure_type: None,
        }
    }
}

/// A computed-but-unapplied rate pair, queued while the router is down.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct PendingSnapshot {
    /// Download rate [bit/s].
    pub dl: u64,
    /// Upload rate [bit/s].
    pub ul: u64,
    /// Wall-clock queue time [s since epoch], for cross-restart staleness.
    pub queued_unix_s: u64,
}

/// Complete per-controller state file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ControllerState {
    pub download: DirectionState,
    pub upload: DirectionState,
    pub ewma: EwmaState,
    pub last_applied: Option<AppliedRates>,
    pub connectivity: ConnectivitySnapshot,
    pub pending: Option<PendingSnapshot>,
    pub schema_version: String,
}

impl Default for ControllerState {
    fn default() -> Self {
        Self {
            download: DirectionState::default(),
            upload: DirectionState::default(),
            ewma: EwmaState::default(),
            last_applied: None,
            connectivity: ConnectivitySnapshot::default(),
            pending: None,
            schema_version: crate::SCHEMA_VERSION.to_string(),
        }
    }
}

/// Steering daemon state file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SteeringState {
    pub state: SteerState,
    /// Red streak toward entering Degraded.
    pub degrade_count: u32,
    /// Green streak toward leaving Degraded.
    pub recover_count: u32,
    pub schema_version: String,
}

impl Default for SteeringState {
    fn default() -> Self {
        Self {
            state: SteerState::Good,
            degrade_count: 0,
            recover_count: 0,
            schema_version: crate::SCHEMA_VERSION.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn controller_state_roundtrips() {
        let mut s = ControllerState::default();
        s.download.current_rate = 800_000_000;
        s.download.last_zone = Zone::Red;
        s.ewma.baseline_rtt = 25.0;
        s.pending = Some(PendingSnapshot {
            dl: 750_000_000,
            ul: 32_000_000,
            queued_unix_s: 1_700_000_000,
        });
        let json = serde_json::to_string(&s).unwrap();
        let back: ControllerState = serde_json::from_str(&json).unwrap();
        assert_eq!(s, back);
    }

    #[test]
    fn empty_object_deserializes_to_defaults() {
        let s: ControllerState = serde_json::from_str("{}").unwrap();
        assert_eq!(s, ControllerState::default());
        assert_eq!(s.schema_version, crate::SCHEMA_VERSION);
    }

    #[test]
    fn partial_state_fills_defaults() {
        let s: ControllerState =
            serde_json::from_str(r#"{"ewma":{"baseline_rtt":21.5}}"#).unwrap();
        assert!((s.ewma.baseline_rtt - 21.5).abs() < 1e-9);
        assert_eq!(s.ewma.load_rtt, 0.0);
        assert!(s.connectivity.is_reachable);
    }

    #[test]
    fn failure_kind_transience() {
        assert!(FailureKind::Timeout.is_transient());
        assert!(FailureKind::ConnectionRefused.is_transient());
        assert!(FailureKind::NetworkUnreachable.is_transient());
        assert!(FailureKind::DnsFailure.is_transient());
        assert!(FailureKind::Unknown.is_transient());
        assert!(!FailureKind::AuthFailure.is_transient());
    }
}

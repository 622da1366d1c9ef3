//! Latency zones and steering states.
//!
//! Zone ordering is fixed: Green < Yellow < SoftRed < Red. The upload
//! controller never enters SoftRed; the steering daemon never assesses it.

use serde::{Deserialize, Serialize};

/// Latency zone derived from `delta = load_rtt - baseline_rtt`.
///
/// Comparisons against thresholds are inclusive on the lower zone:
/// `delta == target` is Green, `delta == warn` is Yellow,
/// `delta == hard_red` is SoftRed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum Zone {
    /// Delta at or below target: the path is idle enough to grow.
    #[default]
    Green,
    /// Delta between target and warn: early warning, no growth.
    Yellow,
    /// Delta between warn and hard_red (download only): clamp and hold.
    SoftRed,
    /// Delta above warn (upload) or hard_red (download): back off.
    Red,
}

impl Zone {
    /// Short uppercase label used in logs and transition reasons.
    pub const fn label(&self) -> &'static str {
        match self {
            Zone::Green => "GREEN",
            Zone::Yellow => "YELLOW",
            Zone::SoftRed => "SOFT_RED",
            Zone::Red => "RED",
        }
    }
}

impl std::fmt::Display for Zone {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.label())
    }
}

/// Steering daemon state: traffic stays on the primary uplink in `Good`,
/// latency-sensitive classes are diverted while `Degraded`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum SteerState {
    /// Primary uplink is healthy; steering rule disabled.
    #[default]
    Good,
    /// Primary uplink congested; steering rule enabled.
    Degraded,
}

impl std::fmt::Display for SteerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SteerState::Good => f.write_str("GOOD"),
            SteerState::Degraded => f.write_str("DEGRADED"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zone_ordering_is_fixed() {
        assert!(Zone::Green < Zone::Yellow);
        assert!(Zone::Yellow < Zone::SoftRed);
        assert!(Zone::SoftRed < Zone::Red);
    }

    #[test]
    fn zone_serializes_snake_case() {
        assert_eq!(serde_json::to_string(&Zone::SoftRed).unwrap(), "\"soft_red\"");
        let z: Zone = serde_json::from_str("\"green\"").unwrap();
        assert_eq!(z, Zone::Green);
    }

    #[test]
    fn steer_state_default_is_good() {
        assert_eq!(SteerState::default(), SteerState::Good);
    }
}

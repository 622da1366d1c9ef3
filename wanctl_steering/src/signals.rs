//! Congestion signal assembly, zone assessment, and confidence scoring.
//!
//! The steering decision combines three independent views of the primary
//! path: RTT delta against the autorate daemon's persisted baseline, CAKE
//! drop deltas (cumulative counters, subtracted read-over-read), and the
//! instantaneous queue depth. Any single RED-grade signal is enough to call
//! the path RED — the signals fail independently, so demanding agreement
//! would blind the daemon exactly when the router is struggling.

use wanctl_common::zone::Zone;

use wanctl_router::backend::QueueStats;

use crate::config::SteerThresholds;

/// One cycle's combined congestion view.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CongestionSignals {
    /// Measured RTT minus the primary's persisted baseline [ms].
    pub rtt_delta_ms: f64,
    /// Smoothed delta [ms].
    pub rtt_delta_ewma_ms: f64,
    /// Drops since the previous stats read.
    pub drops_delta: u64,
    /// Packets since the previous stats read.
    pub packets_delta: u64,
    /// Instantaneous queue depth [packets].
    pub queued_packets: u64,
    /// The baseline the deltas are measured against [ms].
    pub baseline_ms: f64,
}

/// Counter deltas between two cumulative stats reads.
///
/// A counter that went backwards means the router rebooted or the queue was
/// recreated; the delta for that read is zero rather than a huge wrap value.
pub fn stats_delta(prev: &QueueStats, current: &QueueStats) -> (u64, u64) {
    if current.packets < prev.packets || current.dropped < prev.dropped {
        return (0, 0);
    }
    (
        current.packets - prev.packets,
        current.dropped - prev.dropped,
    )
}

/// Assess a zone from the combined signals.
///
/// RED on any of: smoothed delta above the red threshold, drop burst, or
/// queue depth past the configured limit. YELLOW on moderate delta or a
/// trickle of drops. GREEN otherwise. Comparisons are inclusive on the
/// lower zone, matching the autorate machines.
pub fn assess_zone(signals: &CongestionSignals, t: &SteerThresholds) -> Zone {
    if signals.rtt_delta_ewma_ms > t.delta_red_ms
        || signals.drops_delta > t.drops_red
        || signals.queued_packets > t.queued_packets_red
    {
        return Zone::Red;
    }
    if signals.rtt_delta_ewma_ms > t.delta_yellow_ms || signals.drops_delta > t.drops_yellow {
        return Zone::Yellow;
    }
    Zone::Green
}

/// Confidence that steering should be active, 0–100.
///
/// Weighted blend of the same three signals: RTT delta up to 50 points,
/// drops up to 30, queue depth up to 20. Each component saturates at its
/// RED threshold, so a single screaming signal cannot exceed its weight.
pub fn confidence_score(signals: &CongestionSignals, t: &SteerThresholds) -> u8 {
    let rtt_part = (signals.rtt_delta_ewma_ms / t.delta_red_ms).clamp(0.0, 1.0) * 50.0;
    let drops_part = if t.drops_red == 0 {
        0.0
    } else {
        (signals.drops_delta as f64 / t.drops_red as f64).clamp(0.0, 1.0) * 30.0
    };
    let queue_part = if t.queued_packets_red == 0 {
        0.0
    } else {
        (signals.queued_packets as f64 / t.queued_packets_red as f64).clamp(0.0, 1.0) * 20.0
    };
    (rtt_part + drops_part + queue_part).round() as u8
}

/// What the confidence score asks for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfidenceDecision {
    EnableSteering,
    DisableSteering,
    Hold,
}

impl std::fmt::Display for ConfidenceDecision {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ConfidenceDecision::EnableSteering => "ENABLE_STEERING",
            ConfidenceDecision::DisableSteering => "DISABLE_STEERING",
            ConfidenceDecision::Hold => "HOLD",
        };
        f.write_str(s)
    }
}

/// Map a score onto a decision with a dead band between the thresholds.
pub fn confidence_decision(score: u8, enable_threshold: u8, disable_threshold: u8) -> ConfidenceDecision {
    if score >= enable_threshold {
        ConfidenceDecision::EnableSteering
    } else if score <= disable_threshold {
        ConfidenceDecision::DisableSteering
    } else {
        ConfidenceDecision::Hold
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn thresholds() -> SteerThresholds {
        SteerThresholds {
            delta_red_ms: 60.0,
            delta_yellow_ms: 30.0,
            drops_red: 20,
            drops_yellow: 2,
            queued_packets_red: 200,
        }
    }

    fn quiet_signals() -> CongestionSignals {
        CongestionSignals {
            rtt_delta_ms: 1.0,
            rtt_delta_ewma_ms: 1.0,
            drops_delta: 0,
            packets_delta: 100,
            queued_packets: 3,
            baseline_ms: 25.0,
        }
    }

    #[test]
    fn quiet_path_is_green() {
        assert_eq!(assess_zone(&quiet_signals(), &thresholds()), Zone::Green);
    }

    #[test]
    fn each_red_signal_alone_is_red() {
        let t = thresholds();
        let mut s = quiet_signals();
        s.rtt_delta_ewma_ms = 61.0;
        assert_eq!(assess_zone(&s, &t), Zone::Red);

        let mut s = quiet_signals();
        s.drops_delta = 21;
        assert_eq!(assess_zone(&s, &t), Zone::Red);

        let mut s = quiet_signals();
        s.queued_packets = 201;
        assert_eq!(assess_zone(&s, &t), Zone::Red);
    }

    #[test]
    fn moderate_values_are_yellow() {
        let t = thresholds();
        let mut s = quiet_signals();
        s.rtt_delta_ewma_ms = 45.0;
        assert_eq!(assess_zone(&s, &t), Zone::Yellow);

        let mut s = quiet_signals();
        s.drops_delta = 3;
        assert_eq!(assess_zone(&s, &t), Zone::Yellow);
    }

    #[test]
    fn thresholds_are_inclusive_on_the_lower_zone() {
        let t = thresholds();
        let mut s = quiet_signals();
        s.rtt_delta_ewma_ms = 30.0;
        assert_eq!(assess_zone(&s, &t), Zone::Green);
        s.rtt_delta_ewma_ms = 60.0;
        assert_eq!(assess_zone(&s, &t), Zone::Yellow);
        s.drops_delta = 20;
        assert_eq!(assess_zone(&s, &t), Zone::Yellow);
    }

    #[test]
    fn stats_delta_subtracts_cumulative_counters() {
        let prev = QueueStats {
            packets: 1000,
            dropped: 5,
            ..QueueStats::default()
        };
        let current = QueueStats {
            packets: 1500,
            dropped: 9,
            ..QueueStats::default()
        };
        assert_eq!(stats_delta(&prev, &current), (500, 4));
    }

    #[test]
    fn stats_delta_treats_counter_reset_as_zero() {
        let prev = QueueStats {
            packets: 1_000_000,
            dropped: 900,
            ..QueueStats::default()
        };
        let current = QueueStats {
            packets: 50,
            dropped: 0,
            ..QueueStats::default()
        };
        assert_eq!(stats_delta(&prev, &current), (0, 0));
    }

    #[test]
    fn confidence_saturates_at_100() {
        let t = thresholds();
        let s = CongestionSignals {
            rtt_delta_ms: 500.0,
            rtt_delta_ewma_ms: 500.0,
            drops_delta: 10_000,
            packets_delta: 10_000,
            queued_packets: 10_000,
            baseline_ms: 25.0,
        };
        assert_eq!(confidence_score(&s, &t), 100);
    }

    #[test]
    fn confidence_zero_on_quiet_path() {
        let t = thresholds();
        let mut s = quiet_signals();
        s.rtt_delta_ewma_ms = 0.0;
        assert_eq!(confidence_score(&s, &t), 0);
    }

    #[test]
    fn confidence_components_are_weighted() {
        let t = thresholds();
        // RTT at the red threshold is the full 50-point component; the
        // residual queue depth (3/200 · 20 = 0.3) rounds away.
        let mut s = quiet_signals();
        s.rtt_delta_ewma_ms = 60.0;
        assert_eq!(confidence_score(&s, &t), 50);

        // Half the drop threshold adds 15 of the 30 drop points.
        s.drops_delta = 10;
        assert_eq!(confidence_score(&s, &t), 65);
    }

    #[test]
    fn decision_bands() {
        assert_eq!(
            confidence_decision(80, 70, 30),
            ConfidenceDecision::EnableSteering
        );
        assert_eq!(
            confidence_decision(70, 70, 30),
            ConfidenceDecision::EnableSteering
        );
        assert_eq!(confidence_decision(50, 70, 30), ConfidenceDecision::Hold);
        assert_eq!(
            confidence_decision(30, 70, 30),
            ConfidenceDecision::DisableSteering
        );
    }
}

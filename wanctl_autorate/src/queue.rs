//! Per-direction rate state machines.
//!
//! Both controllers act on `delta = load_rtt − baseline_rtt` and return a
//! zone, a new rate, and a transition reason when the zone changed.
//!
//! Upload is a 3-state machine (GREEN/YELLOW/RED): YELLOW holds the rate as
//! an early warning. Download is a 4-state machine with SOFT_RED between
//! YELLOW and RED: YELLOW applies a gentle squeeze, SOFT_RED clamps to its
//! floor and holds for a sustain window before escalating, RED backs off
//! aggressively. The asymmetry exists because downstream bloat is both more
//! common and more damaging than upstream.
//!
//! Growth discipline is shared: `green_required` consecutive GREEN cycles
//! buy exactly one `step_up`, then the streak restarts. Zone comparisons are
//! inclusive on the lower zone: `delta == target` is GREEN, `== warn` is
//! YELLOW, `== hard_red` is SOFT_RED.
//!
//! Floors bound decays; the ceiling bounds growth. SOFT_RED's floor also
//! clamps upward on entry, so a rate crushed by a prior RED episode recovers
//! to the sustain level instead of lingering below it.

use wanctl_common::state::DirectionState;
use wanctl_common::zone::Zone;

/// One adjustment decision.
#[derive(Debug, Clone, PartialEq)]
pub struct Adjustment {
    pub zone: Zone,
    /// New rate [bit/s].
    pub rate: u64,
    /// Present iff the zone differs from the previous cycle's.
    pub reason: Option<String>,
}

// ─── Upload (3-state) ───────────────────────────────────────────────

/// Upload machine parameters. Rates in bit/s, thresholds in ms.
#[derive(Debug, Clone, Copy)]
pub struct UploadParams {
    pub target_ms: f64,
    pub warn_ms: f64,
    pub ceiling: u64,
    pub floor_red: u64,
    pub step_up: u64,
    pub factor_down: f64,
    pub green_required: u32,
}

/// 3-state upload controller.
#[derive(Debug, Clone)]
pub struct UploadController {
    params: UploadParams,
    rate: u64,
    green_streak: u32,
    red_streak: u32,
    last_zone: Zone,
}

impl UploadController {
    pub fn new(params: UploadParams, initial_rate: u64) -> Self {
        Self {
            rate: initial_rate.clamp(params.floor_red, params.ceiling),
            params,
            green_streak: 0,
            red_streak: 0,
            last_zone: Zone::Green,
        }
    }

    /// Restore streaks and rate from persisted state (rate re-clamped in
    /// case the configured bounds changed across the restart).
    pub fn restore(params: UploadParams, state: &DirectionState) -> Self {
        Self {
            rate: state.current_rate.clamp(params.floor_red, params.ceiling),
            params,
            green_streak: state.green_streak,
            red_streak: state.red_streak,
            last_zone: state.last_zone,
        }
    }

    /// One cycle's decision for the given delta [ms].
    pub fn adjust(&mut self, delta_ms: f64) -> Adjustment {
        let p = self.params;
        let zone = if delta_ms <= p.target_ms {
            Zone::Green
        } else if delta_ms <= p.warn_ms {
            Zone::Yellow
        } else {
            Zone::Red
        };

        match zone {
            Zone::Green => {
                self.red_streak = 0;
                self.green_streak += 1;
                if self.green_streak >= p.green_required {
                    self.rate = (self.rate + p.step_up).min(p.ceiling);
                    self.green_streak = 0;
                }
            }
            Zone::Yellow => {
                // Early warning: hold the rate, restart all streaks.
                self.green_streak = 0;
                self.red_streak = 0;
            }
            _ => {
                self.green_streak = 0;
                self.red_streak += 1;
                self.rate = scale_down(self.rate, p.factor_down).max(p.floor_red);
            }
        }

        let reason = self.transition_reason(zone, delta_ms);
        self.last_zone = zone;
        Adjustment {
            zone,
            rate: self.rate,
            reason,
        }
    }

    fn transition_reason(&self, zone: Zone, delta_ms: f64) -> Option<String> {
        if zone == self.last_zone {
            return None;
        }
        let p = self.params;
        let threshold = match zone {
            Zone::Green => format!("delta {delta_ms:.1}ms ≤ target {:.1}ms", p.target_ms),
            Zone::Yellow => format!("delta {delta_ms:.1}ms > target {:.1}ms", p.target_ms),
            _ => format!("delta {delta_ms:.1}ms > warn {:.1}ms", p.warn_ms),
        };
        Some(format!("{}→{}: {threshold}", self.last_zone, zone))
    }

    pub fn rate(&self) -> u64 {
        self.rate
    }

    pub fn last_zone(&self) -> Zone {
        self.last_zone
    }

    /// State for persistence.
    pub fn snapshot(&self) -> DirectionState {
        DirectionState {
            current_rate: self.rate,
            green_streak: self.green_streak,
            soft_red_streak: 0,
            red_streak: self.red_streak,
            last_zone: self.last_zone,
        }
    }
}

// ─── Download (4-state) ─────────────────────────────────────────────

/// Download machine parameters. Rates in bit/s, thresholds in ms.
#[derive(Debug, Clone, Copy)]
pub struct DownloadParams {
    pub target_ms: f64,
    pub warn_ms: f64,
    pub hard_red_ms: f64,
    pub ceiling: u64,
    pub floor_yellow: u64,
    pub floor_soft_red: u64,
    pub floor_red: u64,
    pub step_up: u64,
    pub factor_down: f64,
    pub factor_down_yellow: f64,
    pub green_required: u32,
    pub soft_red_required: u32,
}

/// 4-state download controller.
#[derive(Debug, Clone)]
pub struct DownloadController {
    params: DownloadParams,
    rate: u64,
    green_streak: u32,
    soft_red_streak: u32,
    red_streak: u32,
    last_zone: Zone,
}

impl DownloadController {
    pub fn new(params: DownloadParams, initial_rate: u64) -> Self {
        Self {
            rate: initial_rate.clamp(params.floor_red, params.ceiling),
            params,
            green_streak: 0,
            soft_red_streak: 0,
            red_streak: 0,
            last_zone: Zone::Green,
        }
    }

    /// Restore streaks and rate from persisted state.
    pub fn restore(params: DownloadParams, state: &DirectionState) -> Self {
        Self {
            rate: state.current_rate.clamp(params.floor_red, params.ceiling),
            params,
            green_streak: state.green_streak,
            soft_red_streak: state.soft_red_streak,
            red_streak: state.red_streak,
            last_zone: state.last_zone,
        }
    }

    /// One cycle's decision for the given delta [ms].
    pub fn adjust(&mut self, delta_ms: f64) -> Adjustment {
        let p = self.params;
        let zone = if delta_ms <= p.target_ms {
            Zone::Green
        } else if delta_ms <= p.warn_ms {
            Zone::Yellow
        } else if delta_ms <= p.hard_red_ms {
            Zone::SoftRed
        } else {
            Zone::Red
        };

        match zone {
            Zone::Green => {
                self.soft_red_streak = 0;
                self.red_streak = 0;
                self.green_streak += 1;
                if self.green_streak >= p.green_required {
                    self.rate = (self.rate + p.step_up).min(p.ceiling);
                    self.green_streak = 0;
                }
            }
            Zone::Yellow => {
                // Gentle squeeze rather than a hold: start draining early.
                self.green_streak = 0;
                self.soft_red_streak = 0;
                self.red_streak = 0;
                self.rate = scale_down(self.rate, p.factor_down_yellow).max(p.floor_yellow);
            }
            Zone::SoftRed => {
                self.green_streak = 0;
                self.red_streak = 0;
                self.soft_red_streak += 1;
                if self.soft_red_streak <= p.soft_red_required {
                    // Clamp up to the sustain floor and hold; decaying here
                    // would collapse the rate during moderate congestion.
                    self.rate = self.rate.max(p.floor_soft_red);
                } else {
                    // Sustain window exhausted: escalate to the hard squeeze.
                    self.rate = scale_down(self.rate, p.factor_down).max(p.floor_soft_red);
                }
            }
            Zone::Red => {
                self.green_streak = 0;
                self.soft_red_streak = 0;
                self.red_streak += 1;
                self.rate = scale_down(self.rate, p.factor_down).max(p.floor_red);
            }
        }

        let reason = self.transition_reason(zone, delta_ms);
        self.last_zone = zone;
        Adjustment {
            zone,
            rate: self.rate,
            reason,
        }
    }

    fn transition_reason(&self, zone: Zone, delta_ms: f64) -> Option<String> {
        if zone == self.last_zone {
            return None;
        }
        let p = self.params;
        let threshold = match zone {
            Zone::Green => format!("delta {delta_ms:.1}ms ≤ target {:.1}ms", p.target_ms),
            Zone::Yellow => format!("delta {delta_ms:.1}ms > target {:.1}ms", p.target_ms),
            Zone::SoftRed => format!("delta {delta_ms:.1}ms > warn {:.1}ms", p.warn_ms),
            Zone::Red => format!("delta {delta_ms:.1}ms > hard_red {:.1}ms", p.hard_red_ms),
        };
        Some(format!("{}→{}: {threshold}", self.last_zone, zone))
    }

    pub fn rate(&self) -> u64 {
        self.rate
    }

    pub fn last_zone(&self) -> Zone {
        self.last_zone
    }

    /// State for persistence.
    pub fn snapshot(&self) -> DirectionState {
        DirectionState {
            current_rate: self.rate,
            green_streak: self.green_streak,
            soft_red_streak: self.soft_red_streak,
            red_streak: self.red_streak,
            last_zone: self.last_zone,
        }
    }
}

fn scale_down(rate: u64, factor: f64) -> u64 {
    (rate as f64 * factor).round() as u64
}

// ─── Tests ──────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    const M: u64 = 1_000_000; // 1 Mbit/s in bit/s

    fn up_params() -> UploadParams {
        UploadParams {
            target_ms: 15.0,
            warn_ms: 40.0,
            ceiling: 40 * M,
            floor_red: 10 * M,
            step_up: 2 * M,
            factor_down: 0.85,
            green_required: 5,
        }
    }

    fn down_params() -> DownloadParams {
        DownloadParams {
            target_ms: 15.0,
            warn_ms: 40.0,
            hard_red_ms: 80.0,
            ceiling: 920 * M,
            floor_yellow: 600 * M,
            floor_soft_red: 500 * M,
            floor_red: 400 * M,
            step_up: 10 * M,
            factor_down: 0.85,
            factor_down_yellow: 0.95,
            green_required: 5,
            soft_red_required: 3,
        }
    }

    // ── Boundary behaviors ──

    #[test]
    fn delta_equal_target_is_green() {
        let mut c = DownloadController::new(down_params(), 800 * M);
        assert_eq!(c.adjust(15.0).zone, Zone::Green);
        let mut u = UploadController::new(up_params(), 35 * M);
        assert_eq!(u.adjust(15.0).zone, Zone::Green);
    }

    #[test]
    fn delta_equal_warn_is_yellow() {
        let mut c = DownloadController::new(down_params(), 800 * M);
        assert_eq!(c.adjust(40.0).zone, Zone::Yellow);
        let mut u = UploadController::new(up_params(), 35 * M);
        assert_eq!(u.adjust(40.0).zone, Zone::Yellow);
    }

    #[test]
    fn delta_equal_hard_red_is_soft_red() {
        let mut c = DownloadController::new(down_params(), 800 * M);
        assert_eq!(c.adjust(80.0).zone, Zone::SoftRed);
    }

    #[test]
    fn delta_above_hard_red_is_red() {
        let mut c = DownloadController::new(down_params(), 800 * M);
        assert_eq!(c.adjust(80.1).zone, Zone::Red);
    }

    // ── Growth discipline ──

    #[test]
    fn green_grows_one_step_per_required_streak() {
        // Scenario S1 shape: step every `green_required` GREEN cycles.
        let mut c = DownloadController::new(down_params(), 800 * M);
        let mut rates = Vec::new();
        for _ in 0..10 {
            rates.push(c.adjust(0.1).rate);
        }
        assert_eq!(rates[3], 800 * M); // cycle 4: no step yet
        assert_eq!(rates[4], 810 * M); // cycle 5: first step
        assert_eq!(rates[8], 810 * M); // cycle 9: still one step
        assert_eq!(rates[9], 820 * M); // cycle 10: second step
    }

    #[test]
    fn growth_is_bounded_by_ceiling() {
        let p = down_params();
        let mut c = DownloadController::new(p, 915 * M);
        for _ in 0..50 {
            let adj = c.adjust(0.1);
            assert!(adj.rate <= p.ceiling);
        }
        assert_eq!(c.rate(), p.ceiling);
    }

    #[test]
    fn yellow_interrupts_green_streak() {
        let mut c = DownloadController::new(down_params(), 800 * M);
        for _ in 0..4 {
            c.adjust(0.1);
        }
        // 4 greens, then a yellow resets the streak.
        c.adjust(20.0);
        // 4 more greens: still no step (streak restarted).
        for _ in 0..4 {
            assert_eq!(c.adjust(0.1).rate, c.rate());
        }
        assert!(c.rate() < 800 * M + 10 * M);
    }

    // ── Upload YELLOW holds, download YELLOW squeezes ──

    #[test]
    fn upload_yellow_holds_rate() {
        let mut u = UploadController::new(up_params(), 35 * M);
        let adj = u.adjust(20.0);
        assert_eq!(adj.zone, Zone::Yellow);
        assert_eq!(adj.rate, 35 * M);
    }

    #[test]
    fn download_yellow_squeezes_gently() {
        let mut c = DownloadController::new(down_params(), 800 * M);
        let adj = c.adjust(20.0);
        assert_eq!(adj.zone, Zone::Yellow);
        assert_eq!(adj.rate, 760 * M); // 800 · 0.95
    }

    #[test]
    fn download_yellow_respects_floor() {
        let mut c = DownloadController::new(down_params(), 610 * M);
        for _ in 0..20 {
            let adj = c.adjust(20.0);
            assert!(adj.rate >= 600 * M);
        }
        assert_eq!(c.rate(), 600 * M);
    }

    // ── RED backoff ──

    #[test]
    fn red_backs_off_with_factor_down() {
        // Scenario S2: 800 · 0.85 = 680, above floor_red 400.
        let mut c = DownloadController::new(down_params(), 800 * M);
        let adj = c.adjust(85.0);
        assert_eq!(adj.zone, Zone::Red);
        assert_eq!(adj.rate, 680 * M);
        let reason = adj.reason.unwrap();
        assert!(reason.contains("RED"), "{reason}");
        assert!(reason.contains("85.0"), "{reason}");
        assert!(reason.contains("80.0"), "{reason}");
    }

    #[test]
    fn red_is_floored() {
        let mut c = DownloadController::new(down_params(), 800 * M);
        for _ in 0..50 {
            let adj = c.adjust(200.0);
            assert!(adj.rate >= 400 * M);
        }
        assert_eq!(c.rate(), 400 * M);
    }

    #[test]
    fn upload_red_is_floored() {
        let mut u = UploadController::new(up_params(), 35 * M);
        for _ in 0..60 {
            let adj = u.adjust(50.0);
            assert!(adj.rate >= 10 * M);
        }
        assert_eq!(u.rate(), 10 * M);
    }

    #[test]
    fn recovery_after_red_waits_for_green_required() {
        // Scenario S2 continuation: RED then 5 greens.
        let mut c = DownloadController::new(down_params(), 800 * M);
        c.adjust(85.0);
        assert_eq!(c.rate(), 680 * M);
        let mut rates = Vec::new();
        for _ in 0..5 {
            let adj = c.adjust(0.1);
            assert_eq!(adj.zone, Zone::Green);
            rates.push(adj.rate);
        }
        assert_eq!(rates[..4], [680 * M; 4]);
        assert_eq!(rates[4], 690 * M);
    }

    // ── SOFT_RED hold + escalation ──

    #[test]
    fn soft_red_clamps_up_and_holds_through_sustain_window() {
        let p = down_params();
        // Rate previously crushed below the soft-red floor.
        let mut c = DownloadController::new(p, 450 * M);
        let adj = c.adjust(60.0);
        assert_eq!(adj.zone, Zone::SoftRed);
        assert_eq!(adj.rate, 500 * M); // clamped up to floor_soft_red
        // Held for the rest of the sustain window.
        for _ in 0..2 {
            assert_eq!(c.adjust(60.0).rate, 500 * M);
        }
    }

    #[test]
    fn soft_red_escalates_after_sustain_window() {
        let p = down_params();
        let mut c = DownloadController::new(p, 800 * M);
        // Three sustain cycles hold at 800.
        for _ in 0..3 {
            assert_eq!(c.adjust(60.0).rate, 800 * M);
        }
        // Fourth consecutive soft-red cycle escalates: 800 · 0.85 = 680.
        assert_eq!(c.adjust(60.0).rate, 680 * M);
        // Bounded by the soft-red floor, not the red floor.
        for _ in 0..20 {
            assert!(c.adjust(60.0).rate >= p.floor_soft_red);
        }
        assert_eq!(c.rate(), p.floor_soft_red);
    }

    #[test]
    fn leaving_soft_red_resets_its_streak() {
        let mut c = DownloadController::new(down_params(), 800 * M);
        c.adjust(60.0);
        c.adjust(60.0);
        c.adjust(0.1); // green resets soft_red_streak
        let snap = c.snapshot();
        assert_eq!(snap.soft_red_streak, 0);
        // Re-entering starts a fresh sustain window (hold again).
        for _ in 0..3 {
            let before = c.rate();
            assert_eq!(c.adjust(60.0).rate, before.max(500 * M));
        }
    }

    // ── Streak monotonicity / reset (property 3) ──

    #[test]
    fn streak_increments_within_zone_and_resets_on_change() {
        let mut c = DownloadController::new(down_params(), 800 * M);
        c.adjust(200.0);
        assert_eq!(c.snapshot().red_streak, 1);
        c.adjust(200.0);
        assert_eq!(c.snapshot().red_streak, 2);
        c.adjust(20.0); // yellow
        let snap = c.snapshot();
        assert_eq!(snap.red_streak, 0);
        assert_eq!(snap.green_streak, 0);
    }

    // ── Transition reasons ──

    #[test]
    fn reason_present_iff_zone_changed() {
        let mut c = DownloadController::new(down_params(), 800 * M);
        assert!(c.adjust(0.1).reason.is_none()); // starts Green, stays Green
        let adj = c.adjust(20.0);
        assert!(adj.reason.is_some());
        assert!(c.adjust(20.0).reason.is_none()); // still Yellow
        let back = c.adjust(0.1);
        assert_eq!(back.reason.as_deref().map(|r| r.contains("GREEN")), Some(true));
    }

    // ── Restore ──

    #[test]
    fn restore_clamps_rate_into_configured_bounds() {
        let p = down_params();
        let state = DirectionState {
            current_rate: 5_000 * M, // beyond ceiling from an older config
            green_streak: 2,
            soft_red_streak: 0,
            red_streak: 0,
            last_zone: Zone::Green,
        };
        let c = DownloadController::restore(p, &state);
        assert_eq!(c.rate(), p.ceiling);

        let state = DirectionState {
            current_rate: 1, // below any floor
            ..state
        };
        let c = DownloadController::restore(p, &state);
        assert_eq!(c.rate(), p.floor_red);
    }

    #[test]
    fn snapshot_roundtrips_through_restore() {
        let mut c = DownloadController::new(down_params(), 800 * M);
        c.adjust(60.0);
        c.adjust(60.0);
        let snap = c.snapshot();
        let restored = DownloadController::restore(down_params(), &snap);
        assert_eq!(restored.snapshot(), snap);
    }
}

//! The steering loop and GOOD↔DEGRADED state machine.
//!
//! Asymmetric by design: steering engages after a short RED streak
//! (`degrade_required`, typically 2 cycles) and disengages only after a long
//! GREEN streak (`recover_required`, typically 15). Flapping between uplinks
//! costs every latency-sensitive flow its connection state, so the way back
//! must be much harder than the way out.
//!
//! The state machine proposes; the daemon disposes. A rule flip that fails
//! verification leaves the machine in its old state with its streak intact,
//! so the flip is retried as long as the condition holds.

use std::time::Duration;

use tracing::{debug, info, warn};

use wanctl_common::metrics::MetricsHandle;
use wanctl_common::persist::{StateFile, read_peer};
use wanctl_common::probe::RttSource;
use wanctl_common::ratelimit::RateLimiter;
use wanctl_common::state::{ControllerState, SteeringState};
use wanctl_common::zone::{SteerState, Zone};
use wanctl_router::backend::{QueueStats, RouterBackend};

use crate::config::SteeringConfig;
use crate::signals::{
    CongestionSignals, ConfidenceDecision, assess_zone, confidence_decision, confidence_score,
    stats_delta,
};

/// Smoothing factor for the RTT delta EWMA fed into zone assessment.
const DELTA_EWMA_ALPHA: f64 = 0.3;

/// What the state machine wants done this cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SteerAction {
    None,
    Enable,
    Disable,
}

/// Streak-based GOOD↔DEGRADED machine.
#[derive(Debug, Clone)]
pub struct SteerMachine {
    state: SteerState,
    degrade_count: u32,
    recover_count: u32,
    degrade_required: u32,
    recover_required: u32,
}

impl SteerMachine {
    pub fn new(degrade_required: u32, recover_required: u32) -> Self {
        Self {
            state: SteerState::Good,
            degrade_count: 0,
            recover_count: 0,
            degrade_required,
            recover_required,
        }
    }

    /// Restore from persisted state.
    pub fn restore(degrade_required: u32, recover_required: u32, snap: &SteeringState) -> Self {
        Self {
            state: snap.state,
            degrade_count: snap.degrade_count,
            recover_count: snap.recover_count,
            degrade_required,
            recover_required,
        }
    }

    /// Advance the streaks for this cycle's zone and propose an action.
    ///
    /// The state itself only changes in [`commit`] — a proposal whose rule
    /// flip fails must leave the machine unmoved.
    pub fn step(&mut self, zone: Zone) -> SteerAction {
        match self.state {
            SteerState::Good => {
                if zone == Zone::Red {
                    self.degrade_count += 1;
                } else {
                    self.degrade_count = 0;
                }
                if self.degrade_count >= self.degrade_required {
                    SteerAction::Enable
                } else {
                    SteerAction::None
                }
            }
            SteerState::Degraded => {
                if zone == Zone::Green {
                    self.recover_count += 1;
                } else {
                    self.recover_count = 0;
                }
                if self.recover_count >= self.recover_required {
                    SteerAction::Disable
                } else {
                    SteerAction::None
                }
            }
        }
    }

    /// The proposed action's rule flip succeeded; flip the state.
    pub fn commit(&mut self, action: SteerAction) {
        match action {
            SteerAction::Enable => self.state = SteerState::Degraded,
            SteerAction::Disable => self.state = SteerState::Good,
            SteerAction::None => return,
        }
        self.degrade_count = 0;
        self.recover_count = 0;
    }

    /// Confidence live mode sets the state directly (streaks bypassed).
    pub fn force(&mut self, state: SteerState) {
        self.state = state;
        self.degrade_count = 0;
        self.recover_count = 0;
    }

    pub fn state(&self) -> SteerState {
        self.state
    }

    /// State for persistence.
    pub fn snapshot(&self) -> SteeringState {
        SteeringState {
            state: self.state,
            degrade_count: self.degrade_count,
            recover_count: self.recover_count,
            schema_version: wanctl_common::SCHEMA_VERSION.to_string(),
        }
    }
}

/// Outcome of one steering cycle, surfaced for the loop and for tests.
#[derive(Debug, Clone, PartialEq)]
pub enum CycleReport {
    /// The cycle could not assess the path; nothing changed.
    Skipped(&'static str),
    /// Assessment ran.
    Assessed {
        zone: Zone,
        state: SteerState,
        /// The rule flip executed this cycle, if any.
        flipped: Option<SteerAction>,
        /// Confidence score, when scoring is enabled.
        score: Option<u8>,
    },
}

/// The steering daemon's per-cycle logic and owned state.
pub struct SteeringDaemon {
    cfg: SteeringConfig,
    machine: SteerMachine,
    backend: RouterBackend,
    rtt: Box<dyn RttSource>,
    limiter: RateLimiter,
    state_file: StateFile,
    prev_stats: Option<QueueStats>,
    delta_ewma_ms: Option<f64>,
    metrics: MetricsHandle,
}

impl SteeringDaemon {
    /// Build from validated config, restoring persisted steering state.
    pub fn new(
        cfg: SteeringConfig,
        backend: RouterBackend,
        rtt: Box<dyn RttSource>,
        metrics: MetricsHandle,
    ) -> Self {
        let mut state_file = StateFile::new(&cfg.steering.state_file);
        let persisted: SteeringState = state_file.load_or(SteeringState::default());
        let machine = SteerMachine::restore(
            cfg.steering.degrade_required,
            cfg.steering.recover_required,
            &persisted,
        );
        let limiter = RateLimiter::new(
            Duration::from_secs(cfg.write_limit.window_s),
            cfg.write_limit.max_changes,
        );
        Self {
            machine,
            backend,
            rtt,
            limiter,
            state_file,
            prev_stats: None,
            delta_ewma_ms: None,
            metrics,
            cfg,
        }
    }

    /// One steering cycle.
    pub fn run_cycle(&mut self) -> CycleReport {
        self.metrics.incr_cycles();

        // 1. Peer baseline through the state file; a whole prior cycle or
        // nothing.
        let Some(primary) = read_peer::<ControllerState>(&self.cfg.steering.primary_state_file)
        else {
            debug!(
                file = %self.cfg.steering.primary_state_file.display(),
                "primary state unavailable; skipping cycle"
            );
            return CycleReport::Skipped("primary state unavailable");
        };
        let baseline_ms = primary.ewma.baseline_rtt;
        let s = &self.cfg.steering;
        if !(baseline_ms >= s.baseline_min_ms && baseline_ms <= s.baseline_max_ms) {
            debug!(baseline_ms, "primary baseline outside sanity bounds; skipping cycle");
            return CycleReport::Skipped("baseline outside sanity bounds");
        }

        // 2. Local RTT, with TCP fallback.
        let rtt_ms = match self.rtt.measure() {
            Some(ms) => ms,
            None => {
                self.metrics.incr_probe_failures();
                match self.rtt.verify_connectivity_fallback() {
                    (true, Some(ms)) => ms,
                    _ => {
                        warn!("RTT unavailable over ICMP and TCP; skipping cycle");
                        return CycleReport::Skipped("rtt unavailable");
                    }
                }
            }
        };

        // 3. CAKE stats delta (cumulative counters, never reset).
        let stats = match self.backend.get_queue_stats(&self.cfg.steering.queue) {
            Ok(stats) => stats,
            Err(e) => {
                warn!(error = %e, "queue stats read failed; skipping cycle");
                return CycleReport::Skipped("queue stats unavailable");
            }
        };
        let (packets_delta, drops_delta) = match &self.prev_stats {
            Some(prev) => stats_delta(prev, &stats),
            None => (0, 0),
        };
        self.prev_stats = Some(stats);

        // 4. Combine.
        let rtt_delta_ms = rtt_ms as f64 - baseline_ms;
        let ewma = match self.delta_ewma_ms {
            Some(prev) => DELTA_EWMA_ALPHA * rtt_delta_ms + (1.0 - DELTA_EWMA_ALPHA) * prev,
            None => rtt_delta_ms,
        };
        self.delta_ewma_ms = Some(ewma);
        let signals = CongestionSignals {
            rtt_delta_ms,
            rtt_delta_ewma_ms: ewma,
            drops_delta,
            packets_delta,
            queued_packets: stats.queued_packets,
            baseline_ms,
        };

        // 5. Assess.
        let zone = assess_zone(&signals, &self.cfg.thresholds);

        // 6+7. Hysteresis transition, optionally overridden by live
        // confidence scoring.
        let score = self
            .cfg
            .confidence
            .enabled
            .then(|| confidence_score(&signals, &self.cfg.thresholds));
        let flipped = match score {
            Some(score) if !self.cfg.confidence.dry_run => self.confidence_drive(score),
            other => {
                if let Some(score) = other {
                    let decision = confidence_decision(
                        score,
                        self.cfg.confidence.enable_threshold,
                        self.cfg.confidence.disable_threshold,
                    );
                    info!(score, %decision, "confidence (dry run); hysteresis remains authoritative");
                }
                let action = self.machine.step(zone);
                self.execute(action)
            }
        };

        // 8. Persist.
        let snapshot = self.machine.snapshot();
        if let Err(e) = self.state_file.save(&snapshot) {
            warn!(error = %e, "steering state persist failed");
        }

        CycleReport::Assessed {
            zone,
            state: self.machine.state(),
            flipped,
            score,
        }
    }

    /// Execute a proposed rule flip. Returns the action that actually ran.
    fn execute(&mut self, action: SteerAction) -> Option<SteerAction> {
        if action == SteerAction::None {
            return None;
        }
        if !self.limiter.can_change() {
            info!(
                wait_s = self.limiter.time_until_available().as_secs_f64(),
                "rule-flip budget exhausted; holding steering state"
            );
            self.metrics.incr_writes_skipped();
            return None;
        }

        let comment = self.cfg.steering.mangle_rule_comment.clone();
        let result = match action {
            SteerAction::Enable => self.backend.enable_rule(&comment),
            SteerAction::Disable => self.backend.disable_rule(&comment),
            SteerAction::None => unreachable!(),
        };
        match result {
            Ok(()) => {
                self.limiter.record_change();
                self.metrics.incr_router_writes();
                self.machine.commit(action);
                info!(
                    comment,
                    state = %self.machine.state(),
                    "steering rule {}",
                    if action == SteerAction::Enable { "enabled" } else { "disabled" }
                );
                Some(action)
            }
            Err(e) => {
                // Abandon the step for this cycle; streaks persist, so the
                // flip is retried while the condition holds.
                warn!(comment = %comment, error = %e, "rule flip failed; state machine step abandoned");
                None
            }
        }
    }

    /// Live confidence mode: the decision drives the rule directly,
    /// bypassing the streaks (but never the rate limiter).
    fn confidence_drive(&mut self, score: u8) -> Option<SteerAction> {
        let decision = confidence_decision(
            score,
            self.cfg.confidence.enable_threshold,
            self.cfg.confidence.disable_threshold,
        );
        let action = match (decision, self.machine.state()) {
            (ConfidenceDecision::EnableSteering, SteerState::Good) => SteerAction::Enable,
            (ConfidenceDecision::DisableSteering, SteerState::Degraded) => SteerAction::Disable,
            _ => return None,
        };
        info!(score, %decision, "confidence (live) driving steering rule");
        self.execute_forced(action)
    }

    /// Like [`execute`] but commits by forcing the state (no streak logic).
    fn execute_forced(&mut self, action: SteerAction) -> Option<SteerAction> {
        if !self.limiter.can_change() {
            self.metrics.incr_writes_skipped();
            return None;
        }
        let comment = self.cfg.steering.mangle_rule_comment.clone();
        let result = match action {
            SteerAction::Enable => self.backend.enable_rule(&comment),
            SteerAction::Disable => self.backend.disable_rule(&comment),
            SteerAction::None => return None,
        };
        match result {
            Ok(()) => {
                self.limiter.record_change();
                self.metrics.incr_router_writes();
                self.machine.force(match action {
                    SteerAction::Enable => SteerState::Degraded,
                    _ => SteerState::Good,
                });
                Some(action)
            }
            Err(e) => {
                warn!(comment = %comment, error = %e, "confidence-driven rule flip failed");
                None
            }
        }
    }

    /// Persist immediately (shutdown path).
    pub fn persist_now(&mut self) {
        let snapshot = self.machine.snapshot();
        if let Err(e) = self.state_file.save(&snapshot) {
            warn!(error = %e, "steering state persist failed");
        }
    }

    /// Close the router transport.
    pub fn close(&mut self) {
        self.backend.close();
    }

    pub fn state(&self) -> SteerState {
        self.machine.state()
    }
}

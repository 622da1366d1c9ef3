//! One WAN's control cycle.
//!
//! `run_cycle()` is the unit of observable progress: measure → EWMA update →
//! zone/rate decision → apply → persist, strictly in that order. The
//! controller exclusively owns its queue controllers, baseline discipline,
//! connectivity tracker, pending rate change, rate limiter, and state file.
//!
//! Failure semantics are fail-closed throughout: a router error never
//! removes or relaxes a limit. The computed rates are queued instead and
//! applied on reconnection (bypassing the rate limiter — the outage itself
//! was the quiet period), and the cycle still reports healthy: the daemon is
//! working, the router is not.

use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use tracing::{debug, info, warn};

use wanctl_common::ewma::BaselineEwma;
use wanctl_common::health::{ConnectivityHealth, DirectionHealth, WanHealth};
use wanctl_common::metrics::MetricsHandle;
use wanctl_common::persist::StateFile;
use wanctl_common::probe::RttSource;
use wanctl_common::ratelimit::RateLimiter;
use wanctl_common::state::{
    AppliedRates, ControllerState, EwmaState, FailureKind, PendingSnapshot,
};
use wanctl_common::SCHEMA_VERSION;
use wanctl_router::backend::{BackendError, RouterBackend};
use wanctl_router::connectivity::{ConnectivityTracker, classify_backend};

use crate::config::{WanConfig, bps_to_mbps, mbps_to_bps};
use crate::queue::{
    Adjustment, DownloadController, DownloadParams, UploadController, UploadParams,
};

/// A computed-but-unapplied rate pair.
#[derive(Debug, Clone, Copy)]
pub struct PendingRateChange {
    pub dl: u64,
    pub ul: u64,
    pub queued_at: Instant,
}

/// What the apply path did this cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Applied {
    /// Router unreachable; rates queued as pending.
    Queued,
    /// Rate limiter window exhausted; write skipped.
    RateLimited,
    /// Rates equal `last_applied`; write skipped (flash-wear de-dup).
    Unchanged,
    /// At least one queue limit was written.
    Written,
}

/// Result of one `run_cycle()` invocation.
#[derive(Debug, Clone)]
pub struct CycleOutcome {
    /// False only when no RTT measurement could be obtained at all.
    pub success: bool,
    /// The sample fed into the EWMAs, if any.
    pub measured_ms: Option<f32>,
    pub delta_ms: f64,
    pub download: Option<Adjustment>,
    pub upload: Option<Adjustment>,
    /// Classified router failure, if the apply path failed.
    pub router_failure: Option<FailureKind>,
}

impl CycleOutcome {
    fn failed() -> Self {
        Self {
            success: false,
            measured_ms: None,
            delta_ms: 0.0,
            download: None,
            upload: None,
            router_failure: None,
        }
    }
}

enum Measurement {
    /// A real sample (ICMP, or a TCP handshake standing in for one).
    Sample(f32),
    /// ICMP blackout with TCP alive but silent: keep the last known load.
    LoadPreserved,
    /// Nothing responded.
    Failed,
}

/// Closed-loop controller for one WAN uplink/direction pair.
pub struct WanController {
    name: String,
    ewma: BaselineEwma,
    download: DownloadController,
    upload: UploadController,
    connectivity: ConnectivityTracker,
    pending: Option<PendingRateChange>,
    limiter: RateLimiter,
    backend: RouterBackend,
    rtt: Box<dyn RttSource>,
    state_file: StateFile,
    last_applied: Option<(u64, u64)>,
    dl_queue: String,
    ul_queue: String,
    fallback_enabled: bool,
    fallback_max_cycles: u32,
    fallback_cycles: u32,
    rtt_degraded: bool,
    pending_stale: Duration,
    limiter_skip_logged: bool,
    metrics: MetricsHandle,
}

impl WanController {
    /// Build a controller from its validated config section, restoring
    /// persisted state. `backend` and `rtt` are injected so tests can script
    /// both sides of the loop.
    pub fn new(
        cfg: &WanConfig,
        dt_s: f64,
        backend: RouterBackend,
        rtt: Box<dyn RttSource>,
        metrics: MetricsHandle,
    ) -> Self {
        let mut state_file = StateFile::new(&cfg.state_file);
        let state: ControllerState = state_file.load_or(ControllerState::default());

        let h = cfg.hysteresis;
        let t = cfg.thresholds;
        let dl_params = DownloadParams {
            target_ms: t.target_ms,
            warn_ms: t.warn_ms,
            hard_red_ms: t.hard_red_ms,
            ceiling: mbps_to_bps(cfg.bandwidth.down_max),
            floor_yellow: mbps_to_bps(cfg.floors.download.yellow),
            floor_soft_red: mbps_to_bps(cfg.floors.download.soft_red),
            floor_red: mbps_to_bps(cfg.floors.download.red),
            step_up: mbps_to_bps(h.step_up_mbps),
            factor_down: h.factor_down,
            factor_down_yellow: h.factor_down_yellow,
            green_required: h.green_required,
            soft_red_required: h.soft_red_required,
        };
        let ul_params = UploadParams {
            target_ms: t.target_ms,
            warn_ms: t.warn_ms,
            ceiling: mbps_to_bps(cfg.bandwidth.up_max),
            floor_red: mbps_to_bps(cfg.floors.upload.red),
            step_up: mbps_to_bps(h.step_up_mbps),
            factor_down: h.factor_down,
            green_required: h.green_required,
        };

        // A never-persisted direction starts at the calibrated ceiling and
        // adapts downward from there.
        let mut dl_state = state.download.clone();
        if dl_state.current_rate == 0 {
            dl_state.current_rate = dl_params.ceiling;
        }
        let mut ul_state = state.upload.clone();
        if ul_state.current_rate == 0 {
            ul_state.current_rate = ul_params.ceiling;
        }

        let pending = state.pending.and_then(|p| {
            let now_unix = unix_now_s();
            let age_s = now_unix.saturating_sub(p.queued_unix_s);
            if age_s > cfg.pending_stale_s {
                info!(wan = %cfg.name, age_s, "discarding stale pending rate change from previous run");
                return None;
            }
            Instant::now()
                .checked_sub(Duration::from_secs(age_s))
                .map(|queued_at| PendingRateChange {
                    dl: p.dl,
                    ul: p.ul,
                    queued_at,
                })
        });

        Self {
            name: cfg.name.clone(),
            ewma: BaselineEwma::restore(
                cfg.ewma_params(dt_s),
                state.ewma.baseline_rtt,
                state.ewma.load_rtt,
            ),
            download: DownloadController::restore(dl_params, &dl_state),
            upload: UploadController::restore(ul_params, &ul_state),
            connectivity: ConnectivityTracker::restore(&cfg.router.host, &state.connectivity),
            pending,
            limiter: RateLimiter::new(
                Duration::from_secs(cfg.write_limit.window_s),
                cfg.write_limit.max_changes,
            ),
            backend,
            rtt,
            state_file,
            last_applied: state.last_applied.map(|a| (a.dl, a.ul)),
            dl_queue: cfg.queues.download.clone(),
            ul_queue: cfg.queues.upload.clone(),
            fallback_enabled: cfg.fallback.enabled,
            fallback_max_cycles: cfg.fallback.max_cycles,
            fallback_cycles: 0,
            rtt_degraded: false,
            pending_stale: Duration::from_secs(cfg.pending_stale_s),
            limiter_skip_logged: false,
            metrics,
        }
    }

    /// Run one control cycle.
    pub fn run_cycle(&mut self) -> CycleOutcome {
        self.metrics.incr_cycles();

        // Recover a queued change from a previous outage before computing
        // anything new.
        self.flush_pending();

        // 1. Measure.
        let measurement = self.measure_with_fallback();
        let measured_ms = match measurement {
            Measurement::Sample(ms) => {
                // 2+3. Sanity gating and the freeze rule live in the EWMA
                // discipline; the update itself never reorders them.
                self.ewma.update(ms as f64);
                Some(ms)
            }
            Measurement::LoadPreserved => None,
            Measurement::Failed => {
                self.metrics.incr_cycle_failures();
                return CycleOutcome::failed();
            }
        };

        if !self.ewma.is_seeded() {
            // No sane baseline yet; nothing to act on.
            debug!(wan = %self.name, "waiting for a sane baseline seed");
            self.persist();
            return CycleOutcome {
                success: true,
                measured_ms,
                delta_ms: 0.0,
                download: None,
                upload: None,
                router_failure: None,
            };
        }

        // 4. Delta.
        let delta_ms = self.ewma.delta_ms();

        // 5. Per-direction adjustment.
        let dl = self.download.adjust(delta_ms);
        let ul = self.upload.adjust(delta_ms);
        for adj in [&dl, &ul] {
            if let Some(reason) = &adj.reason {
                info!(wan = %self.name, rate_mbps = bps_to_mbps(adj.rate), "{reason}");
            }
        }

        // 6+7. Apply, record connectivity, queue on failure.
        let router_failure = match self.apply_rate_changes_if_needed(dl.rate, ul.rate) {
            Ok(Applied::Written) => {
                self.connectivity.record_success();
                None
            }
            Ok(_) => None,
            Err(e) => {
                let kind = self
                    .connectivity
                    .record_failure_kind(classify_backend(&e), &e.to_string());
                // Fail closed: never retry-relax, just queue what we wanted.
                self.queue_pending(dl.rate, ul.rate);
                Some(kind)
            }
        };

        // 9. Persist (hash-gated atomic replace).
        self.persist();

        CycleOutcome {
            success: true,
            measured_ms,
            delta_ms,
            download: Some(dl),
            upload: Some(ul),
            router_failure,
        }
    }

    /// Apply path: unreachable → queue; limiter veto → skip; equal rates →
    /// skip; otherwise write each queue that changed.
    fn apply_rate_changes_if_needed(&mut self, dl: u64, ul: u64) -> Result<Applied, BackendError> {
        if !self.connectivity.is_reachable() {
            self.queue_pending(dl, ul);
            return Ok(Applied::Queued);
        }

        if !self.limiter.can_change() {
            if !self.limiter_skip_logged {
                info!(
                    wan = %self.name,
                    wait_s = self.limiter.time_until_available().as_secs_f64(),
                    "write budget exhausted; holding rates until the window frees"
                );
                self.limiter_skip_logged = true;
            }
            self.metrics.incr_writes_skipped();
            return Ok(Applied::RateLimited);
        }
        self.limiter_skip_logged = false;

        if self.last_applied == Some((dl, ul)) {
            return Ok(Applied::Unchanged);
        }

        let last = self.last_applied;
        if last.is_none_or(|(prev_dl, _)| prev_dl != dl) {
            self.backend.set_queue_limit(&self.dl_queue, dl)?;
            self.metrics.incr_router_writes();
        }
        if last.is_none_or(|(_, prev_ul)| prev_ul != ul) {
            self.backend.set_queue_limit(&self.ul_queue, ul)?;
            self.metrics.incr_router_writes();
        }
        self.limiter.record_change();
        self.last_applied = Some((dl, ul));
        Ok(Applied::Written)
    }

    /// Try to apply the queued change from an outage. Bypasses the rate
    /// limiter — the intervening silence already satisfied any debounce.
    fn flush_pending(&mut self) {
        let Some(p) = self.pending else { return };

        if p.queued_at.elapsed() > self.pending_stale {
            warn!(
                wan = %self.name,
                age_s = p.queued_at.elapsed().as_secs(),
                "discarding stale pending rate change"
            );
            self.pending = None;
            return;
        }

        let result = self
            .backend
            .set_queue_limit(&self.dl_queue, p.dl)
            .and_then(|()| self.backend.set_queue_limit(&self.ul_queue, p.ul));
        match result {
            Ok(()) => {
                self.connectivity.record_success();
                self.last_applied = Some((p.dl, p.ul));
                self.pending = None;
                self.metrics.incr_router_writes();
                info!(
                    wan = %self.name,
                    dl_mbps = bps_to_mbps(p.dl),
                    ul_mbps = bps_to_mbps(p.ul),
                    "pending rate change applied after reconnection"
                );
            }
            Err(e) => {
                self.connectivity
                    .record_failure_kind(classify_backend(&e), &e.to_string());
                // Keep the pending entry; the next cycle retries or
                // supersedes it with fresher rates.
            }
        }
    }

    fn queue_pending(&mut self, dl: u64, ul: u64) {
        self.pending = Some(PendingRateChange {
            dl,
            ul,
            queued_at: Instant::now(),
        });
    }

    /// ICMP first; on blackout, the TCP ladder per the fallback policy.
    fn measure_with_fallback(&mut self) -> Measurement {
        if let Some(ms) = self.rtt.measure() {
            self.fallback_cycles = 0;
            if self.rtt_degraded {
                info!(wan = %self.name, "ICMP measurement recovered");
                self.rtt_degraded = false;
            }
            return Measurement::Sample(ms);
        }
        self.metrics.incr_probe_failures();

        if !self.fallback_enabled {
            warn!(wan = %self.name, "RTT measurement failed and fallback is disabled");
            return Measurement::Failed;
        }

        let (reachable, tcp_rtt) = self.rtt.verify_connectivity_fallback();
        if !reachable {
            warn!(wan = %self.name, "RTT measurement failed and TCP fallback found no path");
            return Measurement::Failed;
        }

        self.fallback_cycles += 1;
        if self.fallback_cycles <= self.fallback_max_cycles {
            match tcp_rtt {
                Some(ms) => Measurement::Sample(ms),
                None => Measurement::LoadPreserved,
            }
        } else {
            if !self.rtt_degraded {
                warn!(
                    wan = %self.name,
                    cycles = self.fallback_cycles,
                    "ICMP blackout persists beyond fallback budget; continuing on last known load"
                );
                self.rtt_degraded = true;
            }
            Measurement::LoadPreserved
        }
    }

    /// Serialize and (atomically, hash-gated) replace the state file.
    fn persist(&mut self) {
        let state = ControllerState {
            download: self.download.snapshot(),
            upload: self.upload.snapshot(),
            ewma: EwmaState {
                baseline_rtt: self.ewma.baseline_rtt_ms(),
                load_rtt: self.ewma.load_rtt_ms(),
            },
            last_applied: self.last_applied.map(|(dl, ul)| AppliedRates { dl, ul }),
            connectivity: self.connectivity.snapshot(),
            pending: self.pending.map(|p| PendingSnapshot {
                dl: p.dl,
                ul: p.ul,
                queued_unix_s: unix_now_s().saturating_sub(p.queued_at.elapsed().as_secs()),
            }),
            schema_version: SCHEMA_VERSION.to_string(),
        };
        if let Err(e) = self.state_file.save(&state) {
            warn!(wan = %self.name, error = %e, "state persist failed");
        }
    }

    /// Persist immediately (shutdown path).
    pub fn persist_now(&mut self) {
        self.persist();
    }

    /// Close the router transports (resets failover stickiness).
    pub fn close(&mut self) {
        self.backend.close();
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Whether the RTT path is degraded (ICMP blackout beyond budget).
    pub fn rtt_degraded(&self) -> bool {
        self.rtt_degraded
    }

    pub fn connectivity(&self) -> &ConnectivityTracker {
        &self.connectivity
    }

    /// Current pending change, if any (tests, health).
    pub fn pending(&self) -> Option<PendingRateChange> {
        self.pending
    }

    /// Last rates actually written to the router.
    pub fn last_applied(&self) -> Option<(u64, u64)> {
        self.last_applied
    }

    /// Assemble this WAN's health view.
    pub fn health(&self) -> WanHealth {
        WanHealth {
            name: self.name.clone(),
            baseline_rtt_ms: self.ewma.baseline_rtt_ms(),
            load_rtt_ms: self.ewma.load_rtt_ms(),
            download: DirectionHealth {
                current_rate_mbps: bps_to_mbps(self.download.rate()),
                state: self.download.last_zone().label().to_string(),
            },
            upload: DirectionHealth {
                current_rate_mbps: bps_to_mbps(self.upload.rate()),
                state: self.upload.last_zone().label().to_string(),
            },
            router_connectivity: ConnectivityHealth {
                is_reachable: self.connectivity.is_reachable(),
                consecutive_failures: self.connectivity.consecutive_failures(),
                last_failure_type: self.connectivity.last_failure_type(),
                last_failure_age_s: self.connectivity.last_failure_age_s(),
                outage_duration_s: self.connectivity.outage_duration_s(),
            },
        }
    }
}

fn unix_now_s() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

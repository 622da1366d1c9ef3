//! Tick loop, watchdog policy, and graceful shutdown.
//!
//! Single-threaded: each tick runs every WAN controller sequentially (order
//! is configuration order, deterministic), then sleeps to align the next
//! tick to the configured period. Cycles for the same WAN never overlap by
//! construction.
//!
//! Watchdog policy: the daemon pets systemd each tick iff the daemon itself
//! is healthy. Router-only trouble (any failure kind except auth, below the
//! consecutive-failure threshold) still pets — restarting the daemon cannot
//! fix the router. An auth failure stops the pets so systemd restarts us
//! into the admin's attention.

use std::time::{Duration, Instant};

use tracing::{info, warn};

use wanctl_common::health::HealthSnapshot;
use wanctl_common::metrics::MetricsHandle;
use wanctl_common::notify::SdNotify;
use wanctl_common::persist::StateFile;
use wanctl_common::shutdown;
use wanctl_common::state::FailureKind;

use crate::controller::WanController;

/// O(1) per-tick timing statistics.
#[derive(Debug, Clone, Copy, Default)]
pub struct TickStats {
    pub ticks: u64,
    pub last_tick: Duration,
    pub max_tick: Duration,
    pub overruns: u64,
}

impl TickStats {
    fn record(&mut self, elapsed: Duration, period: Duration) {
        self.ticks += 1;
        self.last_tick = elapsed;
        if elapsed > self.max_tick {
            self.max_tick = elapsed;
        }
        if elapsed > period {
            self.overruns += 1;
        }
    }
}

/// Process-level supervisor for all WAN controllers.
pub struct Supervisor {
    controllers: Vec<WanController>,
    period: Duration,
    max_consecutive_failures: u32,
    notify: SdNotify,
    metrics: MetricsHandle,
    health_file: Option<StateFile>,
    started: Instant,
    stats: TickStats,
    version: &'static str,
    on_verbose_toggle: Option<Box<dyn FnMut()>>,
}

impl Supervisor {
    pub fn new(
        controllers: Vec<WanController>,
        period: Duration,
        max_consecutive_failures: u32,
        notify: SdNotify,
        metrics: MetricsHandle,
        health_file: Option<StateFile>,
    ) -> Self {
        Self {
            controllers,
            period,
            max_consecutive_failures,
            notify,
            metrics,
            health_file,
            started: Instant::now(),
            stats: TickStats::default(),
            version: env!("CARGO_PKG_VERSION"),
            on_verbose_toggle: None,
        }
    }

    /// Install the SIGUSR1 verbosity-toggle callback.
    pub fn with_verbose_toggle(mut self, cb: Box<dyn FnMut()>) -> Self {
        self.on_verbose_toggle = Some(cb);
        self
    }

    /// Run until a shutdown signal arrives, then persist, notify, release.
    pub fn run(&mut self) {
        self.notify.ready();
        info!(
            wans = self.controllers.len(),
            period_ms = self.period.as_millis() as u64,
            "control loop started"
        );

        let mut next_wake = Instant::now() + self.period;
        while !shutdown::shutdown_requested() {
            if shutdown::take_verbose_toggle() {
                if let Some(cb) = &mut self.on_verbose_toggle {
                    cb();
                }
            }

            let tick_start = Instant::now();
            self.tick();
            let elapsed = tick_start.elapsed();
            self.stats.record(elapsed, self.period);

            // Absolute-time pacing: overruns skip ahead instead of
            // accumulating drift.
            let now = Instant::now();
            if next_wake > now {
                std::thread::sleep(next_wake - now);
                next_wake += self.period;
            } else {
                if self.stats.overruns % 100 == 1 {
                    warn!(
                        elapsed_ms = elapsed.as_millis() as u64,
                        period_ms = self.period.as_millis() as u64,
                        "tick overran the cycle period"
                    );
                }
                next_wake = now + self.period;
            }
        }

        self.shutdown();
    }

    /// Run exactly one tick (the `--oneshot` path). Returns true when every
    /// WAN's cycle succeeded.
    pub fn run_once(&mut self) -> bool {
        let ok = self.tick();
        for c in &mut self.controllers {
            c.persist_now();
            c.close();
        }
        ok
    }

    /// One tick over all WANs. Returns true when every cycle succeeded.
    fn tick(&mut self) -> bool {
        let mut all_success = true;
        let mut auth_failure = false;

        for controller in &mut self.controllers {
            let outcome = controller.run_cycle();
            all_success &= outcome.success;
            if outcome.router_failure == Some(FailureKind::AuthFailure) {
                auth_failure = true;
            }
        }

        let worst_failures = self
            .controllers
            .iter()
            .map(|c| c.connectivity().consecutive_failures())
            .max()
            .unwrap_or(0);

        if should_pet(auth_failure, worst_failures, self.max_consecutive_failures) {
            self.notify.watchdog();
        }

        self.write_health();
        all_success
    }

    fn shutdown(&mut self) {
        info!(signal = ?shutdown::shutdown_signal(), "shutting down");
        self.notify.stopping();
        for c in &mut self.controllers {
            c.persist_now();
            c.close();
        }
        info!(
            ticks = self.stats.ticks,
            overruns = self.stats.overruns,
            "control loop stopped"
        );
    }

    fn write_health(&mut self) {
        let Some(health_file) = &mut self.health_file else {
            return;
        };
        let wans: Vec<_> = self.controllers.iter().map(|c| c.health()).collect();
        let snapshot = HealthSnapshot {
            status: HealthSnapshot::status_from_wans(&wans),
            uptime_seconds: self.started.elapsed().as_secs(),
            version: self.version.to_string(),
            consecutive_failures: wans
                .iter()
                .map(|w| w.router_connectivity.consecutive_failures)
                .max()
                .unwrap_or(0),
            router_reachable: wans.iter().all(|w| w.router_connectivity.is_reachable),
            wans,
            metrics: self.metrics.snapshot(),
        };
        if let Err(e) = health_file.save(&snapshot) {
            warn!(error = %e, "health snapshot write failed");
        }
    }
}

/// The daemon pets the watchdog unless credentials are wrong or a WAN has
/// been failing long enough that a restart is worth trying.
fn should_pet(auth_failure: bool, worst_failures: u32, threshold: u32) -> bool {
    !auth_failure && worst_failures < threshold
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pet_policy_router_only_trouble_still_pets() {
        assert!(should_pet(false, 0, 60));
        assert!(should_pet(false, 59, 60));
    }

    #[test]
    fn pet_policy_stops_on_auth_failure() {
        assert!(!should_pet(true, 0, 60));
    }

    #[test]
    fn pet_policy_stops_past_failure_threshold() {
        assert!(!should_pet(false, 60, 60));
        assert!(!should_pet(false, 120, 60));
    }

    #[test]
    fn tick_stats_track_overruns() {
        let mut stats = TickStats::default();
        let period = Duration::from_millis(50);
        stats.record(Duration::from_millis(10), period);
        stats.record(Duration::from_millis(80), period);
        assert_eq!(stats.ticks, 2);
        assert_eq!(stats.overruns, 1);
        assert_eq!(stats.max_tick, Duration::from_millis(80));
        assert_eq!(stats.last_tick, Duration::from_millis(80));
    }
}

//! End-to-end control-cycle scenarios against a scripted router and RTT
//! source. Rates are asserted in literal bit/s so drift in the zone machines
//! or the apply path shows up as an exact-value failure.

use std::collections::VecDeque;

use wanctl_autorate::config::{AutorateConfig, load_config_from_str};
use wanctl_autorate::controller::WanController;
use wanctl_common::metrics::Metrics;
use wanctl_common::probe::RttSource;
use wanctl_common::state::{ControllerState, DirectionState, EwmaState, FailureKind};
use wanctl_common::zone::Zone;
use wanctl_router::backend::RouterBackend;
use wanctl_router::mock::MockTransport;
use wanctl_router::transport::TransportError;

const M: u64 = 1_000_000;

// ─── Scripted RTT source ────────────────────────────────────────────

/// Feeds a scripted sample sequence; repeats the last entry when exhausted.
struct ScriptedRtt {
    samples: VecDeque<Option<f32>>,
    last: Option<f32>,
    fallback: (bool, Option<f32>),
}

impl ScriptedRtt {
    fn constant(ms: f32) -> Self {
        Self::sequence(vec![Some(ms)])
    }

    fn sequence(samples: Vec<Option<f32>>) -> Self {
        Self {
            samples: samples.into(),
            last: None,
            fallback: (false, None),
        }
    }

    fn with_fallback(mut self, reachable: bool, rtt: Option<f32>) -> Self {
        self.fallback = (reachable, rtt);
        self
    }
}

impl RttSource for ScriptedRtt {
    fn measure(&mut self) -> Option<f32> {
        match self.samples.pop_front() {
            Some(s) => {
                self.last = s;
                s
            }
            None => self.last,
        }
    }

    fn verify_connectivity_fallback(&mut self) -> (bool, Option<f32>) {
        self.fallback
    }
}

// ─── Fixture ────────────────────────────────────────────────────────

/// Config with S1/S2 numbers: baseline 25, target 15, warn 40, hard_red 80,
/// green_required 5, step_up 10 Mbps, factor_down 0.85, dl 800/920 Mbps.
fn test_config(dir: &tempfile::TempDir, alpha_load: f64) -> AutorateConfig {
    let state_file = dir.path().join("wan1.json");
    let yaml = format!(
        r#"
schema_version: "1.0"
controller:
  name: wanctl-test
  cycle_interval_ms: 50
  lock_file: {lock}
wans:
  - name: wan1
    router:
      host: 192.168.88.1
      transport: rest
      user: api
      password: "pw"
    queues:
      download: wan1-down
      upload: wan1-up
    bandwidth:
      down_max: 920
      down_min: 400
      up_max: 40
      up_min: 10
    thresholds:
      target_ms: 15
      warn_ms: 40
      hard_red_ms: 80
    floors:
      download: {{ green: 500, yellow: 450, soft_red: 420, red: 400 }}
      upload: {{ green: 15, red: 10 }}
    ewma:
      alpha_baseline: 0.01
      alpha_load: {alpha_load}
    ping:
      hosts: [1.1.1.1]
    fallback:
      enabled: true
      max_cycles: 3
      tcp_targets:
        - {{ host: 1.1.1.1, port: 443 }}
    state_file: {state}
"#,
        lock = dir.path().join("test.lock").display(),
        state = state_file.display(),
    );
    load_config_from_str(&yaml).unwrap()
}

/// Seed the persisted state the way a warmed-up controller would have it.
fn seed_state(cfg: &AutorateConfig, baseline: f64, load: f64, dl_rate: u64, ul_rate: u64) {
    let state = ControllerState {
        download: DirectionState {
            current_rate: dl_rate,
            ..DirectionState::default()
        },
        upload: DirectionState {
            current_rate: ul_rate,
            ..DirectionState::default()
        },
        ewma: EwmaState {
            baseline_rtt: baseline,
            load_rtt: load,
        },
        ..ControllerState::default()
    };
    std::fs::write(
        &cfg.wans[0].state_file,
        serde_json::to_vec_pretty(&state).unwrap(),
    )
    .unwrap();
}

fn make_controller(
    cfg: &AutorateConfig,
    mock: &MockTransport,
    rtt: ScriptedRtt,
) -> WanController {
    WanController::new(
        &cfg.wans[0],
        0.05,
        RouterBackend::new(Box::new(mock.clone())),
        Box::new(rtt),
        Metrics::new_handle(),
    )
}

// ─── S1: GREEN steady state grows ───────────────────────────────────

#[test]
fn s1_green_steady_state_grows() {
    let dir = tempfile::tempdir().unwrap();
    let cfg = test_config(&dir, 0.25);
    seed_state(&cfg, 25.0, 25.4, 800 * M, 35 * M);
    let mock = MockTransport::new("router");
    let mut ctl = make_controller(&cfg, &mock, ScriptedRtt::constant(25.5));

    let mut dl_rates = Vec::new();
    let mut baselines = Vec::new();
    for _ in 0..10 {
        let outcome = ctl.run_cycle();
        assert!(outcome.success);
        let dl = outcome.download.unwrap();
        assert_eq!(dl.zone, Zone::Green);
        dl_rates.push(dl.rate);
        baselines.push(ctl.health().baseline_rtt_ms);
    }

    assert_eq!(dl_rates[4], 810 * M, "first step after green_required cycles");
    assert_eq!(dl_rates[9], 820 * M, "second step after ten cycles");
    for b in baselines {
        assert!((b - 25.0).abs() < 0.1, "baseline drifted to {b}");
    }
}

// ─── S2: RED then recovery ──────────────────────────────────────────

#[test]
fn s2_red_backoff_then_green_recovery() {
    let dir = tempfile::tempdir().unwrap();
    // alpha_load = 1.0: the load EWMA tracks the samples exactly, which is
    // what pins delta to the scripted values.
    let cfg = test_config(&dir, 1.0);
    seed_state(&cfg, 25.0, 25.4, 800 * M, 35 * M);
    let mock = MockTransport::new("router");
    let mut rtt_samples = vec![Some(120.0_f32)];
    rtt_samples.extend(std::iter::repeat_n(Some(25.5), 5));
    let mut ctl = make_controller(&cfg, &mock, ScriptedRtt::sequence(rtt_samples));

    // Cycle 1: delta = 120 − 25 = 95 > hard_red → RED, 800 · 0.85 = 680.
    let outcome = ctl.run_cycle();
    let dl = outcome.download.unwrap();
    assert_eq!(dl.zone, Zone::Red);
    assert_eq!(dl.rate, 680 * M);
    assert!(dl.reason.is_some());
    // Baseline unmoved: the sample is far from idle and beyond max_sane.
    assert!((ctl.health().baseline_rtt_ms - 25.0).abs() < 1e-9);

    // Recovery: GREEN from the first quiet cycle, step only after five.
    let mut rates = Vec::new();
    for _ in 0..5 {
        let outcome = ctl.run_cycle();
        let dl = outcome.download.unwrap();
        assert_eq!(dl.zone, Zone::Green);
        rates.push(dl.rate);
    }
    assert_eq!(rates[..4], [680 * M; 4]);
    assert_eq!(rates[4], 690 * M);
}

// ─── Flash-wear idempotence (property 4) ────────────────────────────

#[test]
fn equal_rates_produce_at_most_one_write_per_queue() {
    let dir = tempfile::tempdir().unwrap();
    let cfg = test_config(&dir, 0.25);
    seed_state(&cfg, 25.0, 25.4, 800 * M, 35 * M);
    let mock = MockTransport::new("router");
    let calls = mock.calls();
    let mut ctl = make_controller(&cfg, &mock, ScriptedRtt::constant(25.5));

    // Cycles 1–4 compute identical rates; only cycle 1 may write.
    for _ in 0..4 {
        ctl.run_cycle();
    }
    let writes: Vec<String> = calls.lock().unwrap().clone();
    assert_eq!(
        writes.len(),
        2,
        "expected exactly one write per queue, got {writes:?}"
    );
    assert!(writes[0].contains("wan1-down"));
    assert!(writes[1].contains("wan1-up"));
}

// ─── S5: unreachable router preserves limits ────────────────────────

#[test]
fn s5_router_outage_queues_pending_and_recovers() {
    let dir = tempfile::tempdir().unwrap();
    let cfg = test_config(&dir, 1.0);
    seed_state(&cfg, 25.0, 25.4, 800 * M, 35 * M);
    let mock = MockTransport::new("router");
    let calls = mock.calls();
    let samples = vec![Some(25.5_f32), Some(120.0), Some(25.5)];
    let mut ctl = make_controller(&cfg, &mock, ScriptedRtt::sequence(samples));

    // Cycle 1: steady, writes (800, 35).
    mock.push_ok("");
    mock.push_ok("");
    ctl.run_cycle();
    assert_eq!(ctl.last_applied(), Some((800 * M, 35 * M)));

    // Cycle 2: RED computes (680, 29.75); the write times out.
    mock.push_err(TransportError::Timeout("router down".into()));
    let outcome = ctl.run_cycle();
    assert!(outcome.success, "router trouble is not a cycle failure");
    assert_eq!(outcome.router_failure, Some(FailureKind::Timeout));
    assert!(!ctl.connectivity().is_reachable());
    // Fail closed: nothing was applied, the computed pair is pending.
    assert_eq!(ctl.last_applied(), Some((800 * M, 35 * M)));
    let pending = ctl.pending().expect("pending rate change");
    assert_eq!((pending.dl, pending.ul), (680 * M, 29_750_000));

    // Cycle 3: router is back; pending applies first, then the cycle runs.
    let calls_before = calls.lock().unwrap().len();
    let outcome = ctl.run_cycle();
    assert!(outcome.success);
    assert!(ctl.connectivity().is_reachable());
    assert!(ctl.pending().is_none());
    assert_eq!(ctl.last_applied(), Some((680 * M, 29_750_000)));
    let log = calls.lock().unwrap();
    let new_calls = &log[calls_before..];
    assert!(
        new_calls[0].contains("680000000"),
        "pending dl applied first: {new_calls:?}"
    );
    assert!(new_calls[1].contains("29750000"));
}

// ─── Fail-closed on auth errors ─────────────────────────────────────

#[test]
fn auth_failure_is_classified_and_fail_closed() {
    let dir = tempfile::tempdir().unwrap();
    let cfg = test_config(&dir, 1.0);
    seed_state(&cfg, 25.0, 25.4, 800 * M, 35 * M);
    let mock = MockTransport::new("router");
    let samples = vec![Some(120.0_f32)];
    let mut ctl = make_controller(&cfg, &mock, ScriptedRtt::sequence(samples));

    mock.push_err(TransportError::Auth("bad credentials".into()));
    let outcome = ctl.run_cycle();
    assert_eq!(outcome.router_failure, Some(FailureKind::AuthFailure));
    assert!(ctl.pending().is_some());
    assert_eq!(ctl.connectivity().last_failure_type(), Some(FailureKind::AuthFailure));
}

// ─── RTT fallback ladder ────────────────────────────────────────────

#[test]
fn icmp_blackout_with_tcp_fallback_keeps_cycles_running() {
    let dir = tempfile::tempdir().unwrap();
    let cfg = test_config(&dir, 0.25);
    seed_state(&cfg, 25.0, 25.4, 800 * M, 35 * M);
    let mock = MockTransport::new("router");
    // ICMP dead from the start; TCP answers with a handshake RTT.
    let rtt = ScriptedRtt::sequence(vec![None]).with_fallback(true, Some(26.0));
    let mut ctl = make_controller(&cfg, &mock, rtt);

    for _ in 0..3 {
        let outcome = ctl.run_cycle();
        assert!(outcome.success);
        assert_eq!(outcome.measured_ms, Some(26.0));
        assert!(!ctl.rtt_degraded());
    }
    // Beyond max_cycles: degraded, load-preserved, still running.
    let outcome = ctl.run_cycle();
    assert!(outcome.success);
    assert_eq!(outcome.measured_ms, None);
    assert!(ctl.rtt_degraded());
}

#[test]
fn measurement_failure_with_dead_tcp_fails_cycle_without_router_io() {
    let dir = tempfile::tempdir().unwrap();
    let cfg = test_config(&dir, 0.25);
    seed_state(&cfg, 25.0, 25.4, 800 * M, 35 * M);
    let mock = MockTransport::new("router");
    let calls = mock.calls();
    let rtt = ScriptedRtt::sequence(vec![None]).with_fallback(false, None);
    let mut ctl = make_controller(&cfg, &mock, rtt);

    let outcome = ctl.run_cycle();
    assert!(!outcome.success);
    assert!(outcome.download.is_none());
    assert!(calls.lock().unwrap().is_empty(), "router must not be touched");
}

// ─── Corrupt state recovery ─────────────────────────────────────────

#[test]
fn corrupt_state_file_starts_from_defaults() {
    let dir = tempfile::tempdir().unwrap();
    let cfg = test_config(&dir, 0.25);
    std::fs::write(&cfg.wans[0].state_file, b"\x00\xffgarbage").unwrap();
    let mock = MockTransport::new("router");
    let mut ctl = make_controller(&cfg, &mock, ScriptedRtt::constant(25.5));

    // Quarantined and replaced by defaults: the download direction starts at
    // the calibrated ceiling.
    let outcome = ctl.run_cycle();
    assert!(outcome.success);
    let corrupt = format!("{}.corrupt", cfg.wans[0].state_file.display());
    assert!(std::path::Path::new(&corrupt).exists());
    assert_eq!(ctl.health().download.current_rate_mbps, 920.0);
}

//! Baseline/load EWMA discipline.
//!
//! Two exponential moving averages over the measured RTT:
//!
//! ```text
//! load_rtt     ← α_load · measured + (1 − α_load) · load_rtt        (every cycle)
//! baseline_rtt ← α_base · measured + (1 − α_base) · baseline_rtt   (idle cycles only)
//! ```
//!
//! The baseline updates only when `|measured − load_rtt| < update_threshold`,
//! i.e. when the path is quiescent. Under sustained load the baseline is
//! frozen — it must never chase the load average, or the controller would
//! learn congestion as the new normal and stop backing off.
//!
//! Baseline candidates outside the sane band are rejected outright (the
//! update does not occur); they are never clamped silently.

use tracing::warn;

/// Fixed parameters of the EWMA pair.
#[derive(Debug, Clone, Copy)]
pub struct EwmaParams {
    /// Per-cycle smoothing factor for the baseline EWMA, in (0, 1].
    pub alpha_baseline: f64,
    /// Per-cycle smoothing factor for the load EWMA, in (0, 1].
    pub alpha_load: f64,
    /// Idle gate: baseline updates iff `|measured − load| < threshold` [ms].
    pub update_threshold_ms: f64,
    /// Lower sanity bound for baseline values [ms].
    pub min_sane_ms: f64,
    /// Upper sanity bound for baseline values [ms].
    pub max_sane_ms: f64,
}

impl Default for EwmaParams {
    fn default() -> Self {
        Self {
            alpha_baseline: 0.05,
            alpha_load: 0.25,
            update_threshold_ms: 3.0,
            min_sane_ms: 10.0,
            max_sane_ms: 60.0,
        }
    }
}

/// Convert a time constant τ [s] into a per-cycle alpha for cycle period `dt` [s].
///
/// `α = 1 − exp(−dt/τ)`. A τ shorter than one cycle (`dt/τ > 1`) means the
/// filter is under-sampled and behaves almost like a pass-through; that is
/// accepted but warned about.
pub fn alpha_from_time_constant(tau_s: f64, dt_s: f64) -> f64 {
    if tau_s <= 0.0 || dt_s <= 0.0 {
        return 1.0;
    }
    if dt_s / tau_s > 1.0 {
        warn!(
            tau_s,
            dt_s, "EWMA time constant shorter than one cycle; filter is effectively unsmoothed"
        );
    }
    1.0 - (-dt_s / tau_s).exp()
}

/// Outcome of one EWMA update.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EwmaUpdate {
    /// Load EWMA after the update [ms].
    pub load_rtt_ms: f64,
    /// Baseline after the update [ms] (unchanged if frozen).
    pub baseline_rtt_ms: f64,
    /// True when the freeze rule (or a sanity rejection) held the baseline.
    pub baseline_frozen: bool,
}

/// The EWMA pair plus seed tracking.
#[derive(Debug, Clone)]
pub struct BaselineEwma {
    params: EwmaParams,
    baseline_rtt_ms: f64,
    load_rtt_ms: f64,
    seeded: bool,
}

impl BaselineEwma {
    /// Create an unseeded pair; the first update seeds both averages.
    pub fn new(params: EwmaParams) -> Self {
        Self {
            params,
            baseline_rtt_ms: 0.0,
            load_rtt_ms: 0.0,
            seeded: false,
        }
    }

    /// Restore a pair from persisted values. Zero values mean "never seeded".
    pub fn restore(params: EwmaParams, baseline_rtt_ms: f64, load_rtt_ms: f64) -> Self {
        let seeded = baseline_rtt_ms > 0.0 && load_rtt_ms > 0.0;
        Self {
            params,
            baseline_rtt_ms,
            load_rtt_ms,
            seeded,
        }
    }

    /// Feed one measured RTT sample [ms].
    ///
    /// The load EWMA always updates. The baseline updates only when all of:
    /// - the sample is inside the sane band,
    /// - the path is idle (`|measured − load| < update_threshold`),
    /// - the resulting candidate stays inside the sane band.
    pub fn update(&mut self, measured_ms: f64) -> EwmaUpdate {
        if !self.seeded {
            self.load_rtt_ms = measured_ms;
            // Seed the baseline only from a sane sample; an insane first
            // sample seeds load alone and baseline waits for a sane one.
            if self.sample_sane(measured_ms) {
                self.baseline_rtt_ms = measured_ms;
                self.seeded = true;
            }
            return EwmaUpdate {
                load_rtt_ms: self.load_rtt_ms,
                baseline_rtt_ms: self.baseline_rtt_ms,
                baseline_frozen: !self.seeded,
            };
        }

        let p = self.params;
        self.load_rtt_ms = p.alpha_load * measured_ms + (1.0 - p.alpha_load) * self.load_rtt_ms;

        let idle = (measured_ms - self.load_rtt_ms).abs() < p.update_threshold_ms;
        let mut frozen = true;
        if idle && self.sample_sane(measured_ms) {
            let candidate =
                p.alpha_baseline * measured_ms + (1.0 - p.alpha_baseline) * self.baseline_rtt_ms;
            if candidate >= p.min_sane_ms && candidate <= p.max_sane_ms {
                self.baseline_rtt_ms = candidate;
                frozen = false;
            }
        }

        EwmaUpdate {
            load_rtt_ms: self.load_rtt_ms,
            baseline_rtt_ms: self.baseline_rtt_ms,
            baseline_frozen: frozen,
        }
    }

    /// `delta = load_rtt − baseline_rtt` [ms]; the scalar the zone machines act on.
    #[inline]
    pub fn delta_ms(&self) -> f64 {
        self.load_rtt_ms - self.baseline_rtt_ms
    }

    /// Current baseline [ms].
    #[inline]
    pub fn baseline_rtt_ms(&self) -> f64 {
        self.baseline_rtt_ms
    }

    /// Current load EWMA [ms].
    #[inline]
    pub fn load_rtt_ms(&self) -> f64 {
        self.load_rtt_ms
    }

    /// Whether the baseline has ever been seeded with a sane sample.
    #[inline]
    pub fn is_seeded(&self) -> bool {
        self.seeded
    }

    #[inline]
    fn sample_sane(&self, measured_ms: f64) -> bool {
        measured_ms >= self.params.min_sane_ms && measured_ms <= self.params.max_sane_ms
    }
}

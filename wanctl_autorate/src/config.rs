//! YAML configuration loader with validation.
//!
//! Loads the autorate daemon configuration: one `controller` section plus a
//! list of WANs, each carrying its router credentials, queue identifiers,
//! bandwidth bounds, thresholds, per-zone floors, EWMA parameters,
//! hysteresis knobs, probe targets, and fallback policy.
//!
//! Parsing is strict (`deny_unknown_fields`); environment interpolation runs
//! over the raw text before the YAML parser sees it. Every bound that the
//! controllers later rely on as a runtime invariant — floor ordering,
//! threshold ordering, identifier shape — is checked here, once, with a
//! precise message, so the control loop never needs to re-validate.

use std::path::{Path, PathBuf};

use serde::Deserialize;

use wanctl_common::ewma::{EwmaParams, alpha_from_time_constant};
use wanctl_common::ident::validate_identifier;
use wanctl_common::probe::{PingConfig, TcpTarget};
use wanctl_common::{SCHEMA_VERSION, envsub};

// ─── Error Type ─────────────────────────────────────────────────────

/// Configuration loading/validation error. All variants are fatal and map
/// to exit code 2.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Io {
        path: String,
        source: std::io::Error,
    },

    #[error("config parse error: {0}")]
    Parse(String),

    #[error("config validation: {0}")]
    Validation(String),

    #[error(transparent)]
    EnvSub(#[from] envsub::EnvSubError),
}

fn invalid(msg: impl Into<String>) -> ConfigError {
    ConfigError::Validation(msg.into())
}

// ─── Config Sections ────────────────────────────────────────────────

/// Top-level autorate configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AutorateConfig {
    pub schema_version: String,
    pub controller: ControllerSection,
    pub wans: Vec<WanConfig>,
}

/// Daemon-wide settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ControllerSection {
    /// Controller name; scopes the lock file.
    pub name: String,
    /// Cycle period [ms].
    #[serde(default = "default_cycle_interval_ms")]
    pub cycle_interval_ms: u64,
    pub lock_file: PathBuf,
    /// Optional health snapshot file, written hash-gated each tick.
    #[serde(default)]
    pub health_file: Option<PathBuf>,
    /// Consecutive router failures before a WAN counts as unhealthy for the
    /// watchdog policy.
    #[serde(default = "default_max_consecutive_failures")]
    pub max_consecutive_failures: u32,
    /// Optional log file; absent means stderr only.
    #[serde(default)]
    pub log_file: Option<PathBuf>,
}

/// One WAN uplink.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct WanConfig {
    pub name: String,
    pub router: RouterSection,
    pub queues: QueuesSection,
    pub bandwidth: BandwidthSection,
    pub thresholds: ThresholdsSection,
    pub floors: FloorsSection,
    #[serde(default)]
    pub ewma: EwmaSection,
    #[serde(default)]
    pub hysteresis: HysteresisSection,
    #[serde(default)]
    pub write_limit: WriteLimitSection,
    pub ping: PingSection,
    #[serde(default)]
    pub fallback: FallbackSection,
    pub state_file: PathBuf,
    /// Pending rate changes older than this are discarded [s].
    #[serde(default = "default_pending_stale_s")]
    pub pending_stale_s: u64,
}

/// Router endpoint and credentials.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RouterSection {
    pub host: String,
    /// Only RouterOS is spoken today.
    #[serde(default = "default_router_type", rename = "type")]
    pub router_type: String,
    /// Primary transport; the other becomes the failover fallback.
    #[serde(default)]
    pub transport: TransportKind,
    pub user: String,
    /// Key for the SSH transport; the client's defaults apply when absent.
    #[serde(default)]
    pub ssh_key: Option<PathBuf>,
    #[serde(default = "default_ssh_port")]
    pub ssh_port: u16,
    /// Password for the REST transport; usually `${VAR}`-injected.
    #[serde(default)]
    pub password: Option<String>,
    #[serde(default)]
    pub verify_ssl: bool,
    /// Per-call deadline [s]; sized below the cycle budget headroom.
    #[serde(default = "default_router_timeout_s")]
    pub timeout_s: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum TransportKind {
    Ssh,
    #[default]
    Rest,
}

/// Router-side queue identifiers.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct QueuesSection {
    pub download: String,
    pub upload: String,
}

/// Rate bounds [Mbit/s].
#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct BandwidthSection {
    pub down_max: f64,
    pub down_min: f64,
    pub up_max: f64,
    pub up_min: f64,
}

/// Zone thresholds on delta [ms].
#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ThresholdsSection {
    pub target_ms: f64,
    pub warn_ms: f64,
    /// Download only; the upload machine has no SoftRed.
    pub hard_red_ms: f64,
}

/// Per-zone floors [Mbit/s]: four for download, two for upload.
#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FloorsSection {
    pub download: DownloadFloors,
    pub upload: UploadFloors,
}

#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DownloadFloors {
    pub green: f64,
    pub yellow: f64,
    pub soft_red: f64,
    pub red: f64,
}

#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct UploadFloors {
    pub green: f64,
    pub red: f64,
}

/// EWMA knobs. Alphas may be given directly or as time constants; giving
/// both for the same average is a validation error.
#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct EwmaSection {
    #[serde(default)]
    pub alpha_baseline: Option<f64>,
    #[serde(default)]
    pub time_constant_baseline_s: Option<f64>,
    #[serde(default)]
    pub alpha_load: Option<f64>,
    #[serde(default)]
    pub time_constant_load_s: Option<f64>,
    #[serde(default = "default_update_threshold_ms")]
    pub update_threshold_ms: f64,
    #[serde(default = "default_min_sane_ms")]
    pub min_sane_ms: f64,
    #[serde(default = "default_max_sane_ms")]
    pub max_sane_ms: f64,
}

impl Default for EwmaSection {
    fn default() -> Self {
        Self {
            alpha_baseline: None,
            time_constant_baseline_s: None,
            alpha_load: None,
            time_constant_load_s: None,
            update_threshold_ms: default_update_threshold_ms(),
            min_sane_ms: default_min_sane_ms(),
            max_sane_ms: default_max_sane_ms(),
        }
    }
}

/// Zone-machine hysteresis knobs.
#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct HysteresisSection {
    #[serde(default = "default_green_required")]
    pub green_required: u32,
    #[serde(default = "default_soft_red_required")]
    pub soft_red_required: u32,
    #[serde(default = "default_factor_down")]
    pub factor_down: f64,
    #[serde(default = "default_factor_down_yellow")]
    pub factor_down_yellow: f64,
    #[serde(default = "default_step_up_mbps")]
    pub step_up_mbps: f64,
}

impl Default for HysteresisSection {
    fn default() -> Self {
        Self {
            green_required: default_green_required(),
            soft_red_required: default_soft_red_required(),
            factor_down: default_factor_down(),
            factor_down_yellow: default_factor_down_yellow(),
            step_up_mbps: default_step_up_mbps(),
        }
    }
}

/// Router write budget (flash-wear protection).
#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct WriteLimitSection {
    #[serde(default = "default_write_window_s")]
    pub window_s: u64,
    #[serde(default = "default_write_max_changes")]
    pub max_changes: usize,
}

impl Default for WriteLimitSection {
    fn default() -> Self {
        Self {
            window_s: default_write_window_s(),
            max_changes: default_write_max_changes(),
        }
    }
}

/// ICMP probe settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PingSection {
    pub hosts: Vec<String>,
    #[serde(default = "default_ping_count")]
    pub count: u32,
    #[serde(default = "default_ping_timeout_s")]
    pub timeout_s: f64,
    #[serde(default = "default_ping_deadline_s")]
    pub deadline_s: f64,
    #[serde(default)]
    pub strategy: wanctl_common::probe::Strategy,
}

/// ICMP-blackout fallback policy.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FallbackSection {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_fallback_max_cycles")]
    pub max_cycles: u32,
    #[serde(default)]
    pub tcp_targets: Vec<TcpTarget>,
}

impl Default for FallbackSection {
    fn default() -> Self {
        Self {
            enabled: false,
            max_cycles: default_fallback_max_cycles(),
            tcp_targets: Vec::new(),
        }
    }
}

// ─── Defaults ───────────────────────────────────────────────────────

fn default_cycle_interval_ms() -> u64 {
    50
}
fn default_max_consecutive_failures() -> u32 {
    60
}
fn default_pending_stale_s() -> u64 {
    60
}
fn default_router_type() -> String {
    "routeros".to_string()
}
fn default_ssh_port() -> u16 {
    22
}
fn default_router_timeout_s() -> f64 {
    3.0
}
fn default_update_threshold_ms() -> f64 {
    3.0
}
fn default_min_sane_ms() -> f64 {
    10.0
}
fn default_max_sane_ms() -> f64 {
    60.0
}
fn default_green_required() -> u32 {
    5
}
fn default_soft_red_required() -> u32 {
    3
}
fn default_factor_down() -> f64 {
    0.85
}
fn default_factor_down_yellow() -> f64 {
    0.95
}
fn default_step_up_mbps() -> f64 {
    10.0
}
fn default_write_window_s() -> u64 {
    60
}
fn default_write_max_changes() -> usize {
    10
}
fn default_ping_count() -> u32 {
    2
}
fn default_ping_timeout_s() -> f64 {
    1.0
}
fn default_ping_deadline_s() -> f64 {
    3.0
}
fn default_fallback_max_cycles() -> u32 {
    3
}

// ─── Loading ────────────────────────────────────────────────────────

/// Load, interpolate, parse, and validate a config file.
pub fn load_config(path: &Path) -> Result<AutorateConfig, ConfigError> {
    let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
        path: path.display().to_string(),
        source,
    })?;
    load_config_from_str(&raw)
}

/// Same, from a string (tests).
pub fn load_config_from_str(raw: &str) -> Result<AutorateConfig, ConfigError> {
    let interpolated = envsub::substitute(raw)?;
    let config: AutorateConfig =
        serde_yaml::from_str(&interpolated).map_err(|e| ConfigError::Parse(e.to_string()))?;
    config.validate()?;
    Ok(config)
}

// ─── Validation ─────────────────────────────────────────────────────

impl AutorateConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.schema_version != SCHEMA_VERSION {
            return Err(invalid(format!(
                "schema_version {:?} not supported (expected {SCHEMA_VERSION:?})",
                self.schema_version
            )));
        }
        if self.controller.name.is_empty() {
            return Err(invalid("controller.name cannot be empty"));
        }
        if self.controller.cycle_interval_ms == 0 {
            return Err(invalid("controller.cycle_interval_ms must be positive"));
        }
        if self.wans.is_empty() {
            return Err(invalid("at least one WAN must be configured"));
        }
        let mut seen = std::collections::HashSet::new();
        for wan in &self.wans {
            if !seen.insert(wan.name.as_str()) {
                return Err(invalid(format!("duplicate WAN name {:?}", wan.name)));
            }
            wan.validate()?;
        }
        let mut state_files = std::collections::HashSet::new();
        for wan in &self.wans {
            if !state_files.insert(wan.state_file.as_path()) {
                return Err(invalid(format!(
                    "state_file {} used by more than one WAN",
                    wan.state_file.display()
                )));
            }
        }
        Ok(())
    }
}

impl WanConfig {
    fn validate(&self) -> Result<(), ConfigError> {
        let ctx = &self.name;
        if ctx.is_empty() {
            return Err(invalid("wan name cannot be empty"));
        }

        self.router.validate(ctx)?;

        for (which, queue) in [
            ("download", &self.queues.download),
            ("upload", &self.queues.upload),
        ] {
            validate_identifier(queue)
                .map_err(|e| invalid(format!("{ctx}: {which} queue: {e}")))?;
        }

        let b = self.bandwidth;
        for (name, v) in [
            ("down_max", b.down_max),
            ("down_min", b.down_min),
            ("up_max", b.up_max),
            ("up_min", b.up_min),
        ] {
            if v <= 0.0 {
                return Err(invalid(format!("{ctx}: bandwidth.{name} must be positive")));
            }
        }
        if b.down_min > b.down_max {
            return Err(invalid(format!("{ctx}: bandwidth down_min > down_max")));
        }
        if b.up_min > b.up_max {
            return Err(invalid(format!("{ctx}: bandwidth up_min > up_max")));
        }

        let t = self.thresholds;
        if !(t.target_ms > 0.0 && t.target_ms < t.warn_ms && t.warn_ms < t.hard_red_ms) {
            return Err(invalid(format!(
                "{ctx}: thresholds must satisfy 0 < target_ms < warn_ms < hard_red_ms \
                 (got {}/{}/{})",
                t.target_ms, t.warn_ms, t.hard_red_ms
            )));
        }

        let d = self.floors.download;
        if !(b.down_min <= d.red
            && d.red <= d.soft_red
            && d.soft_red <= d.yellow
            && d.yellow <= d.green
            && d.green <= b.down_max)
        {
            return Err(invalid(format!(
                "{ctx}: download floors must satisfy down_min ≤ red ≤ soft_red ≤ yellow ≤ green ≤ down_max"
            )));
        }
        let u = self.floors.upload;
        if !(b.up_min <= u.red && u.red <= u.green && u.green <= b.up_max) {
            return Err(invalid(format!(
                "{ctx}: upload floors must satisfy up_min ≤ red ≤ green ≤ up_max"
            )));
        }

        self.ewma.validate(ctx)?;

        let h = self.hysteresis;
        if h.green_required == 0 || h.soft_red_required == 0 {
            return Err(invalid(format!(
                "{ctx}: hysteresis streak requirements must be ≥ 1"
            )));
        }
        for (name, f) in [
            ("factor_down", h.factor_down),
            ("factor_down_yellow", h.factor_down_yellow),
        ] {
            if !(f > 0.0 && f < 1.0) {
                return Err(invalid(format!(
                    "{ctx}: hysteresis.{name} must be in (0, 1), got {f}"
                )));
            }
        }
        if h.step_up_mbps <= 0.0 {
            return Err(invalid(format!("{ctx}: hysteresis.step_up_mbps must be positive")));
        }

        if self.write_limit.window_s == 0 || self.write_limit.max_changes == 0 {
            return Err(invalid(format!("{ctx}: write_limit must allow at least one change")));
        }

        if self.ping.hosts.is_empty() {
            return Err(invalid(format!("{ctx}: ping.hosts cannot be empty")));
        }
        if self.ping.count == 0 {
            return Err(invalid(format!("{ctx}: ping.count must be ≥ 1")));
        }
        if self.ping.timeout_s <= 0.0 || self.ping.deadline_s < self.ping.timeout_s {
            return Err(invalid(format!(
                "{ctx}: ping timeout/deadline must satisfy 0 < timeout_s ≤ deadline_s"
            )));
        }

        if self.fallback.enabled && self.fallback.tcp_targets.is_empty() {
            return Err(invalid(format!(
                "{ctx}: fallback.enabled requires at least one tcp_target"
            )));
        }

        Ok(())
    }

    /// Injected prober parameters.
    pub fn ping_config(&self) -> PingConfig {
        PingConfig {
            hosts: self.ping.hosts.clone(),
            count: self.ping.count,
            timeout_s: self.ping.timeout_s,
            deadline_s: self.ping.deadline_s,
            strategy: self.ping.strategy,
        }
    }

    /// Resolved EWMA parameters for the given cycle period.
    pub fn ewma_params(&self, dt_s: f64) -> EwmaParams {
        let e = self.ewma;
        let alpha_baseline = e
            .alpha_baseline
            .unwrap_or_else(|| match e.time_constant_baseline_s {
                Some(tau) => alpha_from_time_constant(tau, dt_s),
                None => EwmaParams::default().alpha_baseline,
            });
        let alpha_load = e.alpha_load.unwrap_or_else(|| match e.time_constant_load_s {
            Some(tau) => alpha_from_time_constant(tau, dt_s),
            None => EwmaParams::default().alpha_load,
        });
        EwmaParams {
            alpha_baseline,
            alpha_load,
            update_threshold_ms: e.update_threshold_ms,
            min_sane_ms: e.min_sane_ms,
            max_sane_ms: e.max_sane_ms,
        }
    }
}

impl RouterSection {
    fn validate(&self, ctx: &str) -> Result<(), ConfigError> {
        if self.host.is_empty() {
            return Err(invalid(format!("{ctx}: router.host cannot be empty")));
        }
        if self.router_type != "routeros" {
            return Err(invalid(format!(
                "{ctx}: router.type {:?} not supported (only \"routeros\")",
                self.router_type
            )));
        }
        if self.user.is_empty() {
            return Err(invalid(format!("{ctx}: router.user cannot be empty")));
        }
        if self.transport == TransportKind::Rest && self.password.is_none() {
            return Err(invalid(format!(
                "{ctx}: router.transport = rest requires router.password"
            )));
        }
        if self.timeout_s <= 0.0 {
            return Err(invalid(format!("{ctx}: router.timeout_s must be positive")));
        }
        Ok(())
    }
}

impl EwmaSection {
    fn validate(&self, ctx: &str) -> Result<(), ConfigError> {
        if self.alpha_baseline.is_some() && self.time_constant_baseline_s.is_some() {
            return Err(invalid(format!(
                "{ctx}: ewma: give alpha_baseline or time_constant_baseline_s, not both"
            )));
        }
        if self.alpha_load.is_some() && self.time_constant_load_s.is_some() {
            return Err(invalid(format!(
                "{ctx}: ewma: give alpha_load or time_constant_load_s, not both"
            )));
        }
        for (name, alpha) in [
            ("alpha_baseline", self.alpha_baseline),
            ("alpha_load", self.alpha_load),
        ] {
            if let Some(a) = alpha {
                if !(a > 0.0 && a <= 1.0) {
                    return Err(invalid(format!(
                        "{ctx}: ewma.{name} must be in (0, 1], got {a}"
                    )));
                }
            }
        }
        if self.update_threshold_ms <= 0.0 {
            return Err(invalid(format!("{ctx}: ewma.update_threshold_ms must be positive")));
        }
        if self.min_sane_ms <= 0.0 || self.min_sane_ms >= self.max_sane_ms {
            return Err(invalid(format!(
                "{ctx}: ewma sanity bounds must satisfy 0 < min_sane_ms < max_sane_ms"
            )));
        }
        Ok(())
    }
}

/// Mbit/s → bit/s.
pub fn mbps_to_bps(mbps: f64) -> u64 {
    (mbps * 1_000_000.0).round() as u64
}

/// bit/s → Mbit/s.
pub fn bps_to_mbps(bps: u64) -> f64 {
    bps as f64 / 1_000_000.0
}

// ─── Tests ──────────────────────────────────────────────────────────

//! YAML configuration for the steering daemon.
//!
//! Same loading discipline as the autorate daemon: environment interpolation
//! over the raw text, strict parsing, then semantic validation with precise
//! messages. The steering daemon owns its own router credentials and backend
//! instance; the only thing it shares with the autorate daemon is read-only
//! access to the primary WAN's state file.

use std::path::{Path, PathBuf};

use serde::Deserialize;

use wanctl_common::ident::validate_identifier;
use wanctl_common::probe::{PingConfig, TcpTarget};
use wanctl_common::{SCHEMA_VERSION, envsub};

/// Configuration error; fatal, exit code 2.
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

/// Top-level steering configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SteeringConfig {
    pub schema_version: String,
    pub steering: SteeringSection,
    pub thresholds: SteerThresholds,
    pub router: RouterSection,
    pub ping: PingSection,
    #[serde(default)]
    pub fallback: FallbackSection,
    #[serde(default)]
    pub confidence: ConfidenceSection,
    #[serde(default)]
    pub write_limit: WriteLimitSection,
}

/// Core steering knobs.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SteeringSection {
    pub name: String,
    /// Loop period [s]; independent of the primary's cycle, eventually
    /// consistent through the state file.
    #[serde(default = "default_interval_s")]
    pub interval_s: f64,
    /// Name of the primary WAN (for logs).
    pub primary_wan: String,
    /// The autorate daemon's state file for that WAN (read-only peer access).
    pub primary_state_file: PathBuf,
    /// Download queue whose CAKE counters feed the congestion signals.
    pub queue: String,
    /// Unique comment identifying the mangle rule to toggle.
    pub mangle_rule_comment: String,
    /// Baselines outside this band are ignored (skip the cycle).
    #[serde(default = "default_baseline_min_ms")]
    pub baseline_min_ms: f64,
    #[serde(default = "default_baseline_max_ms")]
    pub baseline_max_ms: f64,
    /// Consecutive RED cycles before steering engages.
    #[serde(default = "default_degrade_required")]
    pub degrade_required: u32,
    /// Consecutive GREEN cycles before steering disengages.
    #[serde(default = "default_recover_required")]
    pub recover_required: u32,
    pub state_file: PathBuf,
    pub lock_file: PathBuf,
    #[serde(default)]
    pub log_file: Option<PathBuf>,
}

/// Zone assessment thresholds.
#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SteerThresholds {
    /// RTT delta above which the path is RED [ms].
    pub delta_red_ms: f64,
    /// RTT delta above which the path is YELLOW [ms].
    pub delta_yellow_ms: f64,
    /// Drops since the last read above which the path is RED.
    #[serde(default = "default_drops_red")]
    pub drops_red: u64,
    /// Drops since the last read above which the path is YELLOW.
    #[serde(default = "default_drops_yellow")]
    pub drops_yellow: u64,
    /// Queue depth (packets) above which the path is RED.
    #[serde(default = "default_queued_packets_red")]
    pub queued_packets_red: u64,
}

/// Router endpoint (same shape as the autorate daemon's).
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RouterSection {
    pub host: String,
    #[serde(default = "default_router_type", rename = "type")]
    pub router_type: String,
    #[serde(default)]
    pub transport: TransportKind,
    pub user: String,
    #[serde(default)]
    pub ssh_key: Option<PathBuf>,
    #[serde(default = "default_ssh_port")]
    pub ssh_port: u16,
    #[serde(default)]
    pub password: Option<String>,
    #[serde(default)]
    pub verify_ssl: bool,
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

/// TCP fallback targets for ICMP blackouts.
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(deny_unknown_fields)]
pub struct FallbackSection {
    #[serde(default)]
    pub tcp_targets: Vec<TcpTarget>,
}

/// Optional confidence scoring.
#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ConfidenceSection {
    #[serde(default)]
    pub enabled: bool,
    /// Log decisions without acting on them.
    #[serde(default = "default_true")]
    pub dry_run: bool,
    #[serde(default = "default_enable_threshold")]
    pub enable_threshold: u8,
    #[serde(default = "default_disable_threshold")]
    pub disable_threshold: u8,
}

impl Default for ConfidenceSection {
    fn default() -> Self {
        Self {
            enabled: false,
            dry_run: true,
            enable_threshold: default_enable_threshold(),
            disable_threshold: default_disable_threshold(),
        }
    }
}

/// Rule-flip budget; shared shape with the autorate write limiter.
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

// ─── Defaults ───────────────────────────────────────────────────────

fn default_interval_s() -> f64 {
    2.0
}
fn default_baseline_min_ms() -> f64 {
    5.0
}
fn default_baseline_max_ms() -> f64 {
    100.0
}
fn default_degrade_required() -> u32 {
    2
}
fn default_recover_required() -> u32 {
    15
}
fn default_drops_red() -> u64 {
    20
}
fn default_drops_yellow() -> u64 {
    2
}
fn default_queued_packets_red() -> u64 {
    200
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
fn default_ping_count() -> u32 {
    1
}
fn default_ping_timeout_s() -> f64 {
    1.0
}
fn default_ping_deadline_s() -> f64 {
    1.5
}
fn default_true() -> bool {
    true
}
fn default_enable_threshold() -> u8 {
    70
}
fn default_disable_threshold() -> u8 {
    30
}
fn default_write_window_s() -> u64 {
    60
}
fn default_write_max_changes() -> usize {
    10
}

// ─── Loading & Validation ───────────────────────────────────────────

/// Load, interpolate, parse, and validate.
pub fn load_config(path: &Path) -> Result<SteeringConfig, ConfigError> {
    let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
        path: path.display().to_string(),
        source,
    })?;
    load_config_from_str(&raw)
}

/// Same, from a string (tests).
pub fn load_config_from_str(raw: &str) -> Result<SteeringConfig, ConfigError> {
    let interpolated = envsub::substitute(raw)?;
    let config: SteeringConfig =
        serde_yaml::from_str(&interpolated).map_err(|e| ConfigError::Parse(e.to_string()))?;
    config.validate()?;
    Ok(config)
}

impl SteeringConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.schema_version != SCHEMA_VERSION {
            return Err(invalid(format!(
                "schema_version {:?} not supported (expected {SCHEMA_VERSION:?})",
                self.schema_version
            )));
        }
        let s = &self.steering;
        if s.name.is_empty() {
            return Err(invalid("steering.name cannot be empty"));
        }
        if s.interval_s <= 0.0 {
            return Err(invalid("steering.interval_s must be positive"));
        }
        if s.primary_wan.is_empty() {
            return Err(invalid("steering.primary_wan cannot be empty"));
        }
        validate_identifier(&s.queue)
            .map_err(|e| invalid(format!("steering.queue: {e}")))?;
        validate_identifier(&s.mangle_rule_comment)
            .map_err(|e| invalid(format!("steering.mangle_rule_comment: {e}")))?;
        if !(s.baseline_min_ms > 0.0 && s.baseline_min_ms < s.baseline_max_ms) {
            return Err(invalid(
                "steering baseline sanity bounds must satisfy 0 < min < max",
            ));
        }
        if s.degrade_required == 0 || s.recover_required == 0 {
            return Err(invalid("steering streak requirements must be ≥ 1"));
        }

        let t = self.thresholds;
        if !(t.delta_yellow_ms > 0.0 && t.delta_yellow_ms < t.delta_red_ms) {
            return Err(invalid(
                "thresholds must satisfy 0 < delta_yellow_ms < delta_red_ms",
            ));
        }
        if t.drops_yellow > t.drops_red {
            return Err(invalid("thresholds.drops_yellow must not exceed drops_red"));
        }

        let r = &self.router;
        if r.host.is_empty() {
            return Err(invalid("router.host cannot be empty"));
        }
        if r.router_type != "routeros" {
            return Err(invalid(format!(
                "router.type {:?} not supported (only \"routeros\")",
                r.router_type
            )));
        }
        if r.user.is_empty() {
            return Err(invalid("router.user cannot be empty"));
        }
        if r.transport == TransportKind::Rest && r.password.is_none() {
            return Err(invalid("router.transport = rest requires router.password"));
        }

        if self.ping.hosts.is_empty() {
            return Err(invalid("ping.hosts cannot be empty"));
        }

        let c = self.confidence;
        if c.enabled && c.disable_threshold >= c.enable_threshold {
            return Err(invalid(
                "confidence.disable_threshold must be below enable_threshold",
            ));
        }
        for (name, v) in [
            ("enable_threshold", c.enable_threshold),
            ("disable_threshold", c.disable_threshold),
        ] {
            if v > 100 {
                return Err(invalid(format!("confidence.{name} must be ≤ 100")));
            }
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
}

// ─── Tests ──────────────────────────────────────────────────────────

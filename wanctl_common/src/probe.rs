//! RTT prober with ICMP→TCP fallback.
//!
//! One measurement probes every configured host concurrently (one scoped
//! thread per host, bounded by the host list) by spawning the system `ping`
//! binary, then aggregates the per-host averages with the configured
//! strategy. Per-host failures are tolerated; the measurement succeeds if
//! any host responded.
//!
//! Some ISPs drop ICMP entirely. `verify_connectivity_fallback` answers the
//! narrower question "is the path alive, and roughly how slow?" by timing a
//! TCP handshake against configured `{host, port}` pairs; the handshake RTT
//! stands in for the measurement so the control loop keeps running.
//!
//! The prober is stateless: all knobs are injected through [`PingConfig`],
//! and nothing here leaks into the controller math.

use std::net::{TcpStream, ToSocketAddrs};
use std::process::Command;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

/// Aggregation strategy across per-host sub-samples.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Strategy {
    Average,
    #[default]
    Median,
    Min,
    Max,
}

/// Injected probe parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PingConfig {
    /// Probe targets (IPv4 literals or resolvable names).
    pub hosts: Vec<String>,
    /// Echo requests per host per measurement.
    pub count: u32,
    /// Per-probe timeout [s].
    pub timeout_s: f64,
    /// Overall deadline for one measurement [s].
    pub deadline_s: f64,
    /// Aggregation across hosts.
    pub strategy: Strategy,
}

impl Default for PingConfig {
    fn default() -> Self {
        Self {
            hosts: Vec::new(),
            count: 2,
            timeout_s: 1.0,
            deadline_s: 3.0,
            strategy: Strategy::Median,
        }
    }
}

/// TCP fallback target.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TcpTarget {
    pub host: String,
    pub port: u16,
}

/// Source of RTT samples — the seam the controller is tested through.
pub trait RttSource {
    /// One aggregated measurement; `None` iff zero hosts responded.
    fn measure(&mut self) -> Option<f32>;

    /// TCP fallback: `(reachable, handshake_rtt_ms)`.
    fn verify_connectivity_fallback(&mut self) -> (bool, Option<f32>);
}

/// Production prober over the system `ping` binary + TCP handshakes.
#[derive(Debug, Clone)]
pub struct Prober {
    ping: PingConfig,
    tcp_targets: Vec<TcpTarget>,
}

impl Prober {
    pub fn new(ping: PingConfig, tcp_targets: Vec<TcpTarget>) -> Self {
        Self { ping, tcp_targets }
    }

    fn probe_host(&self, host: &str) -> Option<f32> {
        let cfg = &self.ping;
        let timeout_s = cfg.timeout_s.max(0.1);
        let deadline_s = cfg.deadline_s.max(timeout_s).ceil() as u64;
        let output = Command::new("ping")
            .arg("-n") // numeric; no reverse DNS in the hot path
            .arg("-q")
            .arg("-c")
            .arg(cfg.count.max(1).to_string())
            .arg("-W")
            .arg(format!("{timeout_s:.1}"))
            .arg("-w")
            .arg(deadline_s.to_string())
            .arg(host)
            .output();

        match output {
            Ok(out) if out.status.success() => {
                let stdout = String::from_utf8_lossy(&out.stdout);
                let rtt = parse_ping_rtt(&stdout);
                if rtt.is_none() {
                    debug!(host, "ping succeeded but rtt line was unparsable");
                }
                rtt
            }
            Ok(out) => {
                debug!(host, exit = ?out.status.code(), "ping probe failed");
                None
            }
            Err(e) => {
                warn!(host, error = %e, "could not spawn ping");
                None
            }
        }
    }
}

impl RttSource for Prober {
    fn measure(&mut self) -> Option<f32> {
        if self.ping.hosts.is_empty() {
            return None;
        }

        // One thread per host; the host list is the pool bound and ping's
        // own -w deadline bounds each thread's lifetime.
        let this: &Prober = self;
        let samples: Vec<f32> = std::thread::scope(|scope| {
            let handles: Vec<_> = this
                .ping
                .hosts
                .iter()
                .map(|host| scope.spawn(move || this.probe_host(host)))
                .collect();
            handles
                .into_iter()
                .filter_map(|h| h.join().ok().flatten())
                .collect()
        });

        aggregate(&samples, self.ping.strategy)
    }

    fn verify_connectivity_fallback(&mut self) -> (bool, Option<f32>) {
        let timeout = Duration::from_secs_f64(self.ping.timeout_s.max(0.1));
        for target in &self.tcp_targets {
            match tcp_handshake_rtt(&target.host, target.port, timeout) {
                Some(rtt_ms) => {
                    debug!(host = %target.host, port = target.port, rtt_ms, "TCP fallback handshake ok");
                    return (true, Some(rtt_ms));
                }
                None => {
                    debug!(host = %target.host, port = target.port, "TCP fallback handshake failed");
                }
            }
        }
        (false, None)
    }
}

/// Time a TCP connect; `None` on resolve/connect failure or timeout.
fn tcp_handshake_rtt(host: &str, port: u16, timeout: Duration) -> Option<f32> {
    let addrs: Vec<_> = (host, port).to_socket_addrs().ok()?.collect();
    for addr in addrs {
        let start = Instant::now();
        if TcpStream::connect_timeout(&addr, timeout).is_ok() {
            return Some(start.elapsed().as_secs_f32() * 1000.0);
        }
    }
    None
}

/// Extract the average RTT from iputils/busybox `ping -q` output.
///
/// Accepts both summary shapes:
/// `rtt min/avg/max/mdev = 11.2/11.9/12.4/0.5 ms` and
/// `round-trip min/avg/max = 11.2/11.9/12.4 ms`.
fn parse_ping_rtt(stdout: &str) -> Option<f32> {
    for line in stdout.lines() {
        if !line.contains("min/avg/max") {
            continue;
        }
        let values = line.split('=').nth(1)?.trim();
        let avg = values.split('/').nth(1)?;
        // Strip a trailing unit if the shape is `a/b/c ms` without mdev.
        let avg = avg.trim().trim_end_matches(|c: char| !c.is_ascii_digit() && c != '.');
        return avg.parse::<f32>().ok();
    }
    None
}

/// Aggregate per-host samples; `None` iff `samples` is empty.
fn aggregate(samples: &[f32], strategy: Strategy) -> Option<f32> {
    if samples.is_empty() {
        return None;
    }
    let value = match strategy {
        Strategy::Average => samples.iter().sum::<f32>() / samples.len() as f32,
        Strategy::Min => samples.iter().copied().fold(f32::INFINITY, f32::min),
        Strategy::Max => samples.iter().copied().fold(f32::NEG_INFINITY, f32::max),
        Strategy::Median => {
            let mut sorted = samples.to_vec();
            sorted.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
            let mid = sorted.len() / 2;
            if sorted.len() % 2 == 1 {
                sorted[mid]
            } else {
                (sorted[mid - 1] + sorted[mid]) / 2.0
            }
        }
    };
    Some(value)
}

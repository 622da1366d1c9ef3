//! Failure classification and per-router outage tracking.
//!
//! Classification maps any transport/backend error onto the six
//! [`FailureKind`]s in precedence order: timeout, connection refused,
//! network unreachable, DNS, auth, unknown. It is deterministic — the same
//! error always classifies the same way — so the watchdog policy above it
//! behaves predictably.
//!
//! Failure logging is rate-limited by contract: a sustained outage logs at
//! counts 1 and 3 and every 10th thereafter, never once per cycle.

use std::time::Instant;

use tracing::{error, info, warn};

use wanctl_common::state::{ConnectivitySnapshot, FailureKind};

use crate::backend::BackendError;
use crate::transport::TransportError;

/// Classify a transport error.
pub fn classify(err: &TransportError) -> FailureKind {
    match err {
        TransportError::Timeout(_) => FailureKind::Timeout,
        TransportError::ConnectionRefused(_) => FailureKind::ConnectionRefused,
        TransportError::NetworkUnreachable(_) => FailureKind::NetworkUnreachable,
        TransportError::Dns(_) => FailureKind::DnsFailure,
        TransportError::Auth(_) => FailureKind::AuthFailure,
        TransportError::Io(msg) => classify_message(msg),
        TransportError::CommandFailed { stderr, .. } => classify_message(stderr),
    }
}

/// Classify a backend error (transport errors delegate to [`classify`]).
pub fn classify_backend(err: &BackendError) -> FailureKind {
    match err {
        BackendError::Transport(e) => classify(e),
        BackendError::Verify { .. } | BackendError::Parse(_) => FailureKind::Unknown,
    }
}

/// Substring fallback for errors that arrive as bare text.
fn classify_message(msg: &str) -> FailureKind {
    let lower = msg.to_lowercase();
    if lower.contains("timed out") || lower.contains("timeout") {
        FailureKind::Timeout
    } else if lower.contains("connection refused") {
        FailureKind::ConnectionRefused
    } else if lower.contains("network unreachable")
        || lower.contains("network is unreachable")
        || lower.contains("no route to host")
    {
        FailureKind::NetworkUnreachable
    } else if lower.contains("dns") || lower.contains("resolve") {
        FailureKind::DnsFailure
    } else if lower.contains("permission denied")
        || lower.contains("authentication")
        || lower.contains("login failure")
    {
        FailureKind::AuthFailure
    } else {
        FailureKind::Unknown
    }
}

/// Per-router consecutive-failure counter with outage timing.
#[derive(Debug, Clone)]
pub struct ConnectivityTracker {
    router_name: String,
    is_reachable: bool,
    consecutive_failures: u32,
    last_failure_type: Option<FailureKind>,
    last_failure_time: Option<Instant>,
    outage_start_time: Option<Instant>,
}

impl ConnectivityTracker {
    pub fn new(router_name: impl Into<String>) -> Self {
        Self {
            router_name: router_name.into(),
            is_reachable: true,
            consecutive_failures: 0,
            last_failure_type: None,
            last_failure_time: None,
            outage_start_time: None,
        }
    }

    /// Restore counters from a persisted snapshot; instants restart fresh.
    pub fn restore(router_name: impl Into<String>, snap: &ConnectivitySnapshot) -> Self {
        Self {
            router_name: router_name.into(),
            is_reachable: snap.is_reachable,
            consecutive_failures: snap.consecutive_failures,
            last_failure_type: snap.last_failure_type,
            last_failure_time: None,
            outage_start_time: None,
        }
    }

    /// A router operation succeeded. Logs one reconnection line (with the
    /// outage duration) when a failure streak ends.
    pub fn record_success(&mut self) {
        if self.consecutive_failures > 0 {
            let outage_s = self
                .outage_start_time
                .map(|t| t.elapsed().as_secs_f64())
                .unwrap_or(0.0);
            info!(
                router = %self.router_name,
                failures = self.consecutive_failures,
                outage_s = format_args!("{outage_s:.1}"),
                "router reachable again"
            );
        }
        self.is_reachable = true;
        self.consecutive_failures = 0;
        self.last_failure_type = None;
        self.outage_start_time = None;
    }

    /// A router operation failed. Returns the classified kind.
    pub fn record_failure(&mut self, err: &TransportError) -> FailureKind {
        let kind = classify(err);
        self.record_failure_kind(kind, &err.to_string())
    }

    /// Same, for errors already reduced to a kind (backend layer).
    pub fn record_failure_kind(&mut self, kind: FailureKind, detail: &str) -> FailureKind {
        self.consecutive_failures += 1;
        self.is_reachable = false;
        self.last_failure_type = Some(kind);
        self.last_failure_time = Some(Instant::now());
        if self.outage_start_time.is_none() {
            self.outage_start_time = Some(Instant::now());
        }

        if should_log_failure(self.consecutive_failures) {
            if kind == FailureKind::AuthFailure {
                error!(
                    router = %self.router_name,
                    failures = self.consecutive_failures,
                    %kind,
                    detail,
                    "router authentication failed; admin intervention required"
                );
            } else {
                warn!(
                    router = %self.router_name,
                    failures = self.consecutive_failures,
                    %kind,
                    detail,
                    "router unreachable"
                );
            }
        }
        kind
    }

    pub fn is_reachable(&self) -> bool {
        self.is_reachable
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures
    }

    pub fn last_failure_type(&self) -> Option<FailureKind> {
        self.last_failure_type
    }

    /// Seconds since the last failure, if any.
    pub fn last_failure_age_s(&self) -> Option<f64> {
        self.last_failure_time.map(|t| t.elapsed().as_secs_f64())
    }

    /// Duration of the ongoing outage, if any.
    pub fn outage_duration_s(&self) -> Option<f64> {
        self.outage_start_time.map(|t| t.elapsed().as_secs_f64())
    }

    /// Snapshot for persistence / health.
    pub fn snapshot(&self) -> ConnectivitySnapshot {
        ConnectivitySnapshot {
            is_reachable: self.is_reachable,
            consecutive_failures: self.consecutive_failures,
            last_failure_type: self.last_failure_type,
        }
    }
}

/// Log at counts 1, 3, and every 10th thereafter.
fn should_log_failure(count: u32) -> bool {
    count == 1 || count == 3 || count % 10 == 0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classification_precedence() {
        assert_eq!(
            classify(&TransportError::Timeout("x".into())),
            FailureKind::Timeout
        );
        assert_eq!(
            classify(&TransportError::ConnectionRefused("x".into())),
            FailureKind::ConnectionRefused
        );
        assert_eq!(
            classify(&TransportError::NetworkUnreachable("x".into())),
            FailureKind::NetworkUnreachable
        );
        assert_eq!(classify(&TransportError::Dns("x".into())), FailureKind::DnsFailure);
        assert_eq!(classify(&TransportError::Auth("x".into())), FailureKind::AuthFailure);
    }

    #[test]
    fn message_substring_classification() {
        assert_eq!(
            classify(&TransportError::Io("read timed out".into())),
            FailureKind::Timeout
        );
        assert_eq!(
            classify(&TransportError::Io("connect: Connection refused".into())),
            FailureKind::ConnectionRefused
        );
        assert_eq!(
            classify(&TransportError::Io("sendto: Network is unreachable".into())),
            FailureKind::NetworkUnreachable
        );
        assert_eq!(
            classify(&TransportError::Io("no route to host".into())),
            FailureKind::NetworkUnreachable
        );
        assert_eq!(
            classify(&TransportError::Io("DNS lookup failed".into())),
            FailureKind::DnsFailure
        );
        assert_eq!(
            classify(&TransportError::Io("mystery".into())),
            FailureKind::Unknown
        );
    }

    #[test]
    fn classification_is_deterministic() {
        let err = TransportError::Io("connection refused by peer".into());
        assert_eq!(classify(&err), classify(&err));
    }

    #[test]
    fn failure_then_success_resets_counters() {
        let mut t = ConnectivityTracker::new("router");
        assert!(t.is_reachable());
        t.record_failure(&TransportError::Timeout("x".into()));
        t.record_failure(&TransportError::Timeout("x".into()));
        assert!(!t.is_reachable());
        assert_eq!(t.consecutive_failures(), 2);
        assert_eq!(t.last_failure_type(), Some(FailureKind::Timeout));
        assert!(t.outage_duration_s().is_some());

        t.record_success();
        assert!(t.is_reachable());
        assert_eq!(t.consecutive_failures(), 0);
        assert_eq!(t.last_failure_type(), None);
        assert!(t.outage_duration_s().is_none());
    }

    #[test]
    fn outage_start_is_stamped_once() {
        let mut t = ConnectivityTracker::new("router");
        t.record_failure(&TransportError::Timeout("x".into()));
        let first = t.outage_start_time;
        std::thread::sleep(std::time::Duration::from_millis(5));
        t.record_failure(&TransportError::Timeout("x".into()));
        assert_eq!(t.outage_start_time, first);
    }

    #[test]
    fn log_thresholds() {
        let logged: Vec<u32> = (1..=40).filter(|&c| should_log_failure(c)).collect();
        assert_eq!(logged, vec![1, 3, 10, 20, 30, 40]);
    }

    #[test]
    fn restore_keeps_counters_but_not_instants() {
        let snap = ConnectivitySnapshot {
            is_reachable: false,
            consecutive_failures: 7,
            last_failure_type: Some(FailureKind::DnsFailure),
        };
        let t = ConnectivityTracker::restore("router", &snap);
        assert!(!t.is_reachable());
        assert_eq!(t.consecutive_failures(), 7);
        assert_eq!(t.last_failure_type(), Some(FailureKind::DnsFailure));
        assert!(t.last_failure_age_s().is_none());
        assert!(t.outage_duration_s().is_none());
    }
}

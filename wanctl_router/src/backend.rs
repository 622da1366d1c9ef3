//! Typed router operations on top of a [`Transport`].
//!
//! Three operation families, all the controller and steering daemons ever
//! need: set a queue's max rate, read a queue's cumulative counters, and
//! toggle a mangle rule by its comment. Counters are never reset from here —
//! consumers subtract previous from current, which avoids the read/reset
//! race that would lose events.
//!
//! Output parsing is deliberately tolerant: the same accessor accepts the
//! REST transport's JSON and the SSH transport's CLI print output, including
//! whitespace and flag-position variations, because RouterOS formats drift
//! across versions.

use std::time::Duration;

use tracing::{debug, warn};

use crate::command::RouterCommand;
use crate::transport::{Transport, TransportError};

/// Backend error: transport trouble, unverifiable rule state, or a response
/// the parsers could not make sense of.
#[derive(Debug, thiserror::Error)]
pub enum BackendError {
    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error("rule {comment:?} still not {expected} after verification retries")]
    Verify {
        comment: String,
        expected: &'static str,
    },

    #[error("unparsable router response: {0}")]
    Parse(String),
}

/// Cumulative queue counters.
///
/// RouterOS reports simple-queue counters as `upload/download` pairs; both
/// directions are summed so the value is a single monotonic scalar.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct QueueStats {
    pub bytes: u64,
    pub packets: u64,
    pub dropped: u64,
    pub queued_packets: u64,
    pub queued_bytes: u64,
}

/// Rule presence/state as reported by the router.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RuleStatus {
    Enabled,
    Disabled,
    Absent,
}

/// Verification backoff after enable/disable: RouterOS may lag.
const VERIFY_BACKOFF: [Duration; 3] = [
    Duration::from_millis(100),
    Duration::from_millis(200),
    Duration::from_millis(400),
];

/// Typed operations over one transport.
pub struct RouterBackend {
    transport: Box<dyn Transport>,
}

impl RouterBackend {
    pub fn new(transport: Box<dyn Transport>) -> Self {
        Self { transport }
    }

    /// Set a simple queue's max rate [bit/s]. Idempotent on the router side;
    /// the controller's `last_applied` de-dup keeps equal writes from ever
    /// reaching this call.
    pub fn set_queue_limit(&mut self, queue: &str, rate_bps: u64) -> Result<(), BackendError> {
        let cmd = RouterCommand::new("queue/simple/set")
            .arg("numbers", queue)
            .arg("max-limit", rate_bps);
        self.transport.run_cmd(&cmd)?;
        debug!(queue, rate_bps, "queue limit written");
        Ok(())
    }

    /// Read a queue's cumulative counters.
    pub fn get_queue_stats(&mut self, queue: &str) -> Result<QueueStats, BackendError> {
        let cmd = RouterCommand::new("queue/simple/print")
            .flag("stats")
            .query("name", queue);
        let out = self.transport.run_cmd(&cmd)?;
        parse_queue_stats(&out.stdout)
            .ok_or_else(|| BackendError::Parse(format!("no stats for queue {queue:?}")))
    }

    /// Enable the mangle rule carrying `comment`, verified with retries.
    pub fn enable_rule(&mut self, comment: &str) -> Result<(), BackendError> {
        self.toggle_rule(comment, true)
    }

    /// Disable the mangle rule carrying `comment`, verified with retries.
    pub fn disable_rule(&mut self, comment: &str) -> Result<(), BackendError> {
        self.toggle_rule(comment, false)
    }

    /// Current state of the rule carrying `comment`.
    pub fn get_rule_status(&mut self, comment: &str) -> Result<RuleStatus, BackendError> {
        let cmd = RouterCommand::new("ip/firewall/mangle/print").query("comment", comment);
        let out = self.transport.run_cmd(&cmd)?;
        Ok(parse_rule_status(&out.stdout, comment))
    }

    /// Close the underlying transport (resets failover stickiness).
    pub fn close(&mut self) {
        self.transport.close();
    }

    fn toggle_rule(&mut self, comment: &str, enable: bool) -> Result<(), BackendError> {
        let (verb, expected, want) = if enable {
            ("enable", "enabled", RuleStatus::Enabled)
        } else {
            ("disable", "disabled", RuleStatus::Disabled)
        };
        let cmd =
            RouterCommand::new(&format!("ip/firewall/mangle/{verb}")).query("comment", comment);
        self.transport.run_cmd(&cmd)?;

        // Immediate check, then three backed-off retries.
        if self.get_rule_status(comment)? == want {
            return Ok(());
        }
        for delay in VERIFY_BACKOFF {
            std::thread::sleep(delay);
            if self.get_rule_status(comment)? == want {
                return Ok(());
            }
            warn!(comment, expected, "rule state not yet verified; retrying");
        }
        Err(BackendError::Verify {
            comment: comment.to_string(),
            expected,
        })
    }
}

// ─── Response Parsing ───────────────────────────────────────────────

/// Parse queue stats from either REST JSON or CLI print output.
fn parse_queue_stats(stdout: &str) -> Option<QueueStats> {
    if let Some(fields) = first_json_object(stdout) {
        return Some(QueueStats {
            bytes: json_counter(&fields, "bytes"),
            packets: json_counter(&fields, "packets"),
            dropped: json_counter(&fields, "dropped"),
            queued_packets: json_counter(&fields, "queued-packets"),
            queued_bytes: json_counter(&fields, "queued-bytes"),
        });
    }

    // CLI shape: `key=value` tokens spread over wrapped lines.
    let pairs = cli_pairs(stdout);
    if pairs.is_empty() {
        return None;
    }
    let get = |key: &str| {
        pairs
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| sum_pair_counter(v))
            .unwrap_or(0)
    };
    Some(QueueStats {
        bytes: get("bytes"),
        packets: get("packets"),
        dropped: get("dropped"),
        queued_packets: get("queued-packets"),
        queued_bytes: get("queued-bytes"),
    })
}

/// Parse rule status from either REST JSON or CLI print output.
///
/// CLI entries start with an index; the letters between the index and the
/// first `key=value` token are flags, where `X` means disabled. The parser
/// tolerates arbitrary spacing and extra flags.
fn parse_rule_status(stdout: &str, comment: &str) -> RuleStatus {
    if let Some(fields) = first_json_object(stdout) {
        let disabled = fields
            .get("disabled")
            .and_then(|v| v.as_str())
            .map(|s| s == "true" || s == "yes")
            .unwrap_or(false);
        return if disabled {
            RuleStatus::Disabled
        } else {
            RuleStatus::Enabled
        };
    }
    if stdout.trim_start().starts_with('[') {
        // Valid JSON array with no objects: the query matched nothing.
        return RuleStatus::Absent;
    }

    for line in stdout.lines() {
        if !line.contains(comment) {
            continue;
        }
        let trimmed = line.trim_start();
        // Skip the flag legend itself.
        if trimmed.starts_with("Flags:") {
            continue;
        }
        let Some(rest) = trimmed
            .split_once(|c: char| c.is_whitespace())
            .filter(|(idx, _)| idx.chars().all(|c| c.is_ascii_digit()))
            .map(|(_, rest)| rest)
        else {
            continue;
        };
        // Everything before the first `key=` is the flag area plus that
        // first key; flags are single uppercase letters.
        let flag_section = rest.split('=').next().unwrap_or("");
        let mut flag_tokens = flag_section.split_whitespace();
        let _first_key = flag_tokens.next_back();
        if flag_tokens.any(|t| t == "X") {
            return RuleStatus::Disabled;
        }
        return RuleStatus::Enabled;
    }
    RuleStatus::Absent
}

/// First object of a JSON response (`[{..}]` or `{..}`).
fn first_json_object(stdout: &str) -> Option<serde_json::Map<String, serde_json::Value>> {
    let value: serde_json::Value = serde_json::from_str(stdout.trim()).ok()?;
    match value {
        serde_json::Value::Array(items) => items.into_iter().find_map(|v| match v {
            serde_json::Value::Object(m) => Some(m),
            _ => None,
        }),
        serde_json::Value::Object(m) => Some(m),
        _ => None,
    }
}

fn json_counter(fields: &serde_json::Map<String, serde_json::Value>, key: &str) -> u64 {
    match fields.get(key) {
        Some(serde_json::Value::String(s)) => sum_pair_counter(s),
        Some(serde_json::Value::Number(n)) => n.as_u64().unwrap_or(0),
        _ => 0,
    }
}

/// `"123/456"` → 579; `"123"` → 123; garbage → 0.
fn sum_pair_counter(value: &str) -> u64 {
    value
        .split('/')
        .map(|part| part.trim().parse::<u64>().unwrap_or(0))
        .sum()
}

/// Extract `key=value` pairs from CLI print output, honoring quotes.
fn cli_pairs(stdout: &str) -> Vec<(String, String)> {
    let mut pairs = Vec::new();
    for line in stdout.lines() {
        let mut rest = line.trim();
        while let Some(eq) = rest.find('=') {
            let key_start = rest[..eq]
                .rfind(|c: char| c.is_whitespace())
                .map(|i| i + 1)
                .unwrap_or(0);
            let key = rest[key_start..eq].to_string();
            let after = &rest[eq + 1..];
            let (value, remaining) = if let Some(stripped) = after.strip_prefix('"') {
                match stripped.find('"') {
                    Some(close) => (stripped[..close].to_string(), &stripped[close + 1..]),
                    None => (stripped.to_string(), ""),
                }
            } else {
                match after.find(char::is_whitespace) {
                    Some(ws) => (after[..ws].to_string(), &after[ws..]),
                    None => (after.to_string(), ""),
                }
            };
            if !key.is_empty() {
                pairs.push((key, value));
            }
            rest = remaining.trim_start();
        }
    }
    pairs
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::MockTransport;

    const CLI_STATS: &str = r#"Flags: X - disabled, I - invalid, D - dynamic
 0    name="wan1-down" target=10.0.0.0/24 parent=none
      bytes=123456/789012 packets=1000/2000 dropped=5/10
      queued-packets=3/4 queued-bytes=100/200
"#;

    const REST_STATS: &str = r#"[{"name":"wan1-down","bytes":"123456/789012","packets":"1000/2000","dropped":"5/10","queued-packets":"3/4","queued-bytes":"100/200"}]"#;

    #[test]
    fn parses_cli_stats() {
        let s = parse_queue_stats(CLI_STATS).unwrap();
        assert_eq!(s.bytes, 912_468);
        assert_eq!(s.packets, 3_000);
        assert_eq!(s.dropped, 15);
        assert_eq!(s.queued_packets, 7);
        assert_eq!(s.queued_bytes, 300);
    }

    #[test]
    fn parses_rest_stats_identically() {
        assert_eq!(parse_queue_stats(REST_STATS), parse_queue_stats(CLI_STATS));
    }

    #[test]
    fn empty_output_is_unparsable() {
        assert!(parse_queue_stats("").is_none());
        assert!(parse_queue_stats("[]").is_none());
    }

    #[test]
    fn scalar_counters_parse_too() {
        let s = parse_queue_stats(r#"[{"bytes":"500","dropped":7}]"#).unwrap();
        assert_eq!(s.bytes, 500);
        assert_eq!(s.dropped, 7);
        assert_eq!(s.packets, 0);
    }

    #[test]
    fn rule_status_cli_enabled() {
        let out = r#"Flags: X - disabled, I - invalid, D - dynamic
 0    chain=prerouting action=mark-routing new-routing-mark=wan2 comment="ADAPTIVE-STEER"
"#;
        assert_eq!(parse_rule_status(out, "ADAPTIVE-STEER"), RuleStatus::Enabled);
    }

    #[test]
    fn rule_status_cli_disabled() {
        let out = r#"Flags: X - disabled, I - invalid, D - dynamic
 0  X chain=prerouting action=mark-routing comment="ADAPTIVE-STEER"
"#;
        assert_eq!(parse_rule_status(out, "ADAPTIVE-STEER"), RuleStatus::Disabled);
    }

    #[test]
    fn rule_status_tolerates_extra_whitespace_and_flags() {
        let out = "  12   X D  chain=prerouting comment=\"ADAPTIVE-STEER\"\n";
        assert_eq!(parse_rule_status(out, "ADAPTIVE-STEER"), RuleStatus::Disabled);
        let out = "12 chain=prerouting comment=\"ADAPTIVE-STEER\"";
        assert_eq!(parse_rule_status(out, "ADAPTIVE-STEER"), RuleStatus::Enabled);
    }

    #[test]
    fn rule_status_rest_variants() {
        let enabled = r#"[{"chain":"prerouting","disabled":"false","comment":"ADAPTIVE-STEER"}]"#;
        assert_eq!(parse_rule_status(enabled, "ADAPTIVE-STEER"), RuleStatus::Enabled);
        let disabled = r#"[{"chain":"prerouting","disabled":"true","comment":"ADAPTIVE-STEER"}]"#;
        assert_eq!(parse_rule_status(disabled, "ADAPTIVE-STEER"), RuleStatus::Disabled);
        assert_eq!(parse_rule_status("[]", "ADAPTIVE-STEER"), RuleStatus::Absent);
    }

    #[test]
    fn rule_status_absent_when_comment_missing() {
        let out = "Flags: X - disabled\n 0 chain=prerouting comment=\"OTHER\"\n";
        assert_eq!(parse_rule_status(out, "ADAPTIVE-STEER"), RuleStatus::Absent);
    }

    #[test]
    fn set_queue_limit_renders_expected_command() {
        let mock = MockTransport::new("mock");
        mock.push_ok("");
        let calls = mock.calls();
        let mut backend = RouterBackend::new(Box::new(mock));
        backend.set_queue_limit("wan1-down", 800_000_000).unwrap();
        let log = calls.lock().unwrap();
        assert_eq!(
            log[0],
            "/queue/simple/set numbers=wan1-down max-limit=800000000"
        );
    }

    #[test]
    fn get_queue_stats_roundtrip_through_mock() {
        let mock = MockTransport::new("mock");
        mock.push_ok(REST_STATS);
        let mut backend = RouterBackend::new(Box::new(mock));
        let s = backend.get_queue_stats("wan1-down").unwrap();
        assert_eq!(s.dropped, 15);
    }

    #[test]
    fn enable_rule_verifies_and_succeeds() {
        let mock = MockTransport::new("mock");
        mock.push_ok(""); // enable
        mock.push_ok(r#"[{"disabled":"false","comment":"STEER"}]"#); // verify
        let mut backend = RouterBackend::new(Box::new(mock));
        backend.enable_rule("STEER").unwrap();
    }

    #[test]
    fn enable_rule_retries_verification_then_fails() {
        let mock = MockTransport::new("mock");
        mock.push_ok(""); // enable
        // Four verification reads (immediate + three retries), all stale.
        for _ in 0..4 {
            mock.push_ok(r#"[{"disabled":"true","comment":"STEER"}]"#);
        }
        let calls = mock.calls();
        let mut backend = RouterBackend::new(Box::new(mock));
        let err = backend.enable_rule("STEER").unwrap_err();
        assert!(matches!(err, BackendError::Verify { .. }));
        // 1 toggle + 4 status reads.
        assert_eq!(calls.lock().unwrap().len(), 5);
    }

    #[test]
    fn disable_rule_lagging_router_converges() {
        let mock = MockTransport::new("mock");
        mock.push_ok(""); // disable
        mock.push_ok(r#"[{"disabled":"false","comment":"STEER"}]"#); // still stale
        mock.push_ok(r#"[{"disabled":"true","comment":"STEER"}]"#); // converged
        let mut backend = RouterBackend::new(Box::new(mock));
        backend.disable_rule("STEER").unwrap();
    }
}

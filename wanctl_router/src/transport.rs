//! The transport contract and shared retry policy.
//!
//! A transport runs one [`RouterCommand`] and returns the router's exit
//! status plus captured output. Errors are typed at the edge so everything
//! above (failover, backend, connectivity classification) can branch on the
//! kind instead of scraping message strings.
//!
//! Each underlying transport retries retryable errors itself with
//! exponential backoff — by default three attempts spaced 1 s then 2 s, then
//! give up. Authentication failures are never retried: hammering a router
//! with bad credentials only earns a ban from its login throttle.

use std::time::Duration;

use tracing::warn;

use crate::command::RouterCommand;

/// Result of one executed router command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandOutput {
    /// Process-style exit code (0 on success).
    pub exit: i32,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    /// Successful output with captured stdout.
    pub fn ok(stdout: impl Into<String>) -> Self {
        Self {
            exit: 0,
            stdout: stdout.into(),
            stderr: String::new(),
        }
    }
}

/// Typed transport error.
#[derive(Debug, Clone, thiserror::Error)]
pub enum TransportError {
    /// The router did not answer within the deadline.
    #[error("timeout: {0}")]
    Timeout(String),

    /// TCP-level refusal (service down, wrong port).
    #[error("connection refused: {0}")]
    ConnectionRefused(String),

    /// No route to the router.
    #[error("network unreachable: {0}")]
    NetworkUnreachable(String),

    /// Router hostname did not resolve.
    #[error("DNS resolution failed: {0}")]
    Dns(String),

    /// Credentials or key rejected. Terminal: never retried, never fails over.
    #[error("authentication failed: {0}")]
    Auth(String),

    /// Other transient I/O trouble.
    #[error("transport I/O: {0}")]
    Io(String),

    /// The command reached the router and the router rejected it.
    #[error("router command failed (exit {exit}): {stderr}")]
    CommandFailed { exit: i32, stderr: String },
}

impl TransportError {
    /// Whether the per-transport retry loop should try again.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            TransportError::Timeout(_)
                | TransportError::ConnectionRefused(_)
                | TransportError::NetworkUnreachable(_)
                | TransportError::Io(_)
        )
    }

    /// Whether the failover wrapper should switch to the fallback.
    ///
    /// Same set as [`is_retryable`]: network-shaped trouble fails over, auth
    /// and router-side rejections do not.
    pub fn triggers_failover(&self) -> bool {
        self.is_retryable()
    }
}

/// Run a router command over some wire.
pub trait Transport {
    /// Execute `cmd`, retrying retryable errors per the transport's policy.
    fn run_cmd(&mut self, cmd: &RouterCommand) -> Result<CommandOutput, TransportError>;

    /// Release connections and reset sticky state.
    fn close(&mut self);

    /// Stable name for logs ("ssh", "rest", "failover").
    fn name(&self) -> &'static str;
}

/// Exponential-backoff retry policy shared by the concrete transports.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    /// Total attempts (first try included).
    pub attempts: u32,
    /// Delay before the second attempt; doubles each retry.
    pub base_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: 3,
            base_delay: Duration::from_secs(1),
        }
    }
}

impl RetryPolicy {
    /// No retries — single attempt (tests, oneshot probing).
    pub fn none() -> Self {
        Self {
            attempts: 1,
            base_delay: Duration::ZERO,
        }
    }

    /// Run `op` under this policy, sleeping between retryable failures.
    pub fn run<T>(
        &self,
        what: &str,
        mut op: impl FnMut() -> Result<T, TransportError>,
    ) -> Result<T, TransportError> {
        let mut delay = self.base_delay;
        let mut attempt = 1;
        loop {
            match op() {
                Ok(v) => return Ok(v),
                Err(e) if e.is_retryable() && attempt < self.attempts => {
                    warn!(
                        what,
                        attempt,
                        max = self.attempts,
                        error = %e,
                        "retrying after transient transport error"
                    );
                    std::thread::sleep(delay);
                    delay = delay.saturating_mul(2);
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retryable_classification() {
        assert!(TransportError::Timeout("t".into()).is_retryable());
        assert!(TransportError::ConnectionRefused("c".into()).is_retryable());
        assert!(TransportError::NetworkUnreachable("n".into()).is_retryable());
        assert!(TransportError::Io("io".into()).is_retryable());
        assert!(!TransportError::Auth("denied".into()).is_retryable());
        assert!(!TransportError::Dns("nxdomain".into()).is_retryable());
        assert!(
            !TransportError::CommandFailed {
                exit: 1,
                stderr: "bad arg".into()
            }
            .is_retryable()
        );
    }

    #[test]
    fn auth_never_triggers_failover() {
        assert!(!TransportError::Auth("denied".into()).triggers_failover());
        assert!(TransportError::Timeout("t".into()).triggers_failover());
    }

    #[test]
    fn retry_policy_exhausts_then_surfaces_error() {
        let policy = RetryPolicy {
            attempts: 3,
            base_delay: Duration::from_millis(1),
        };
        let mut calls = 0;
        let res: Result<(), _> = policy.run("test", || {
            calls += 1;
            Err(TransportError::Timeout("always".into()))
        });
        assert!(matches!(res, Err(TransportError::Timeout(_))));
        assert_eq!(calls, 3);
    }

    #[test]
    fn retry_policy_stops_on_auth() {
        let policy = RetryPolicy {
            attempts: 3,
            base_delay: Duration::from_millis(1),
        };
        let mut calls = 0;
        let res: Result<(), _> = policy.run("test", || {
            calls += 1;
            Err(TransportError::Auth("denied".into()))
        });
        assert!(matches!(res, Err(TransportError::Auth(_))));
        assert_eq!(calls, 1);
    }

    #[test]
    fn retry_policy_succeeds_midway() {
        let policy = RetryPolicy {
            attempts: 3,
            base_delay: Duration::from_millis(1),
        };
        let mut calls = 0;
        let res = policy.run("test", || {
            calls += 1;
            if calls < 2 {
                Err(TransportError::Io("flaky".into()))
            } else {
                Ok(CommandOutput::ok("fine"))
            }
        });
        assert_eq!(res.unwrap().stdout, "fine");
        assert_eq!(calls, 2);
    }
}

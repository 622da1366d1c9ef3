//! Primary/fallback transport composition.
//!
//! Typical deployment: REST primary, SSH fallback. A classified network
//! failure on the primary logs one warning, flips `using_fallback`, and
//! re-runs the command on the fallback. The flag is sticky until [`close`]:
//! a router whose REST service just dropped once is likely mid-upgrade or
//! overloaded, and flapping between wires per-command would double the
//! failure noise for no benefit.
//!
//! Authentication failures propagate immediately — wrong credentials are
//! wrong on every wire.

use tracing::warn;

use wanctl_common::metrics::MetricsHandle;

use crate::command::RouterCommand;
use crate::transport::{CommandOutput, Transport, TransportError};

/// Sticky primary/fallback pair.
pub struct FailoverTransport {
    primary: Box<dyn Transport>,
    fallback: Box<dyn Transport>,
    using_fallback: bool,
    metrics: Option<MetricsHandle>,
}

impl FailoverTransport {
    pub fn new(primary: Box<dyn Transport>, fallback: Box<dyn Transport>) -> Self {
        Self {
            primary,
            fallback,
            using_fallback: false,
            metrics: None,
        }
    }

    /// Attach the metrics handle (counts failover flips).
    pub fn with_metrics(mut self, metrics: MetricsHandle) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Whether the sticky flag is set.
    pub fn using_fallback(&self) -> bool {
        self.using_fallback
    }
}

impl Transport for FailoverTransport {
    fn run_cmd(&mut self, cmd: &RouterCommand) -> Result<CommandOutput, TransportError> {
        if self.using_fallback {
            return self.fallback.run_cmd(cmd);
        }

        match self.primary.run_cmd(cmd) {
            Ok(out) => Ok(out),
            Err(e) if e.triggers_failover() => {
                warn!(
                    primary = self.primary.name(),
                    fallback = self.fallback.name(),
                    error = %e,
                    "primary transport failed; switching to fallback until close"
                );
                self.using_fallback = true;
                if let Some(m) = &self.metrics {
                    m.incr_failovers();
                }
                self.fallback.run_cmd(cmd)
            }
            Err(e) => Err(e),
        }
    }

    fn close(&mut self) {
        self.primary.close();
        self.fallback.close();
        self.using_fallback = false;
    }

    fn name(&self) -> &'static str {
        "failover"
    }
}

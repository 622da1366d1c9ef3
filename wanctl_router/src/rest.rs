//! RouterOS REST API transport.
//!
//! Commands become `POST https://<host>/rest/<path>` with basic auth and a
//! JSON body; the response body is handed up as stdout so the backend's
//! parsers see the same tolerant surface as with SSH. Certificate
//! verification is optional because home routers overwhelmingly run
//! self-signed certificates.

use std::time::Duration;

use reqwest::StatusCode;
use reqwest::blocking::Client;

use crate::command::RouterCommand;
use crate::transport::{CommandOutput, RetryPolicy, Transport, TransportError};

/// REST transport over `reqwest::blocking`.
pub struct RestTransport {
    base_url: String,
    user: String,
    password: String,
    client: Client,
    retry: RetryPolicy,
}

impl std::fmt::Debug for RestTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // The password must never leak into logs, including Debug output.
        f.debug_struct("RestTransport")
            .field("base_url", &self.base_url)
            .field("user", &self.user)
            .field("retry", &self.retry)
            .finish_non_exhaustive()
    }
}

impl RestTransport {
    /// Build a client for `https://<host>/rest`.
    pub fn new(
        host: &str,
        user: impl Into<String>,
        password: impl Into<String>,
        verify_ssl: bool,
        timeout: Duration,
    ) -> Result<Self, TransportError> {
        let client = Client::builder()
            .timeout(timeout)
            .connect_timeout(timeout)
            .danger_accept_invalid_certs(!verify_ssl)
            .build()
            .map_err(|e| TransportError::Io(format!("building HTTP client: {e}")))?;
        Ok(Self {
            base_url: format!("https://{host}/rest"),
            user: user.into(),
            password: password.into(),
            client,
            retry: RetryPolicy::default(),
        })
    }

    /// Override the retry policy (tests use [`RetryPolicy::none`]).
    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    fn run_once(&self, cmd: &RouterCommand) -> Result<CommandOutput, TransportError> {
        let url = format!("{}/{}", self.base_url, cmd.rest_path());
        let response = self
            .client
            .post(&url)
            .basic_auth(&self.user, Some(&self.password))
            .json(&cmd.rest_body())
            .send()
            .map_err(classify_reqwest_error)?;

        let status = response.status();
        let body = response.text().unwrap_or_default();

        match status {
            s if s.is_success() => Ok(CommandOutput::ok(body)),
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => Err(TransportError::Auth(format!(
                "router returned {status} for {}",
                cmd.describe()
            ))),
            s => Err(TransportError::CommandFailed {
                exit: s.as_u16() as i32,
                stderr: body,
            }),
        }
    }
}

impl Transport for RestTransport {
    fn run_cmd(&mut self, cmd: &RouterCommand) -> Result<CommandOutput, TransportError> {
        let retry = self.retry;
        retry.run(&cmd.describe(), || self.run_once(cmd))
    }

    fn close(&mut self) {
        // reqwest pools internally; dropping the client closes connections.
    }

    fn name(&self) -> &'static str {
        "rest"
    }
}

/// Map a reqwest error onto the typed transport error.
///
/// reqwest hides errno behind a source chain, so the connect-error text is
/// scanned for the few shapes the controller distinguishes.
fn classify_reqwest_error(e: reqwest::Error) -> TransportError {
    if e.is_timeout() {
        return TransportError::Timeout(e.to_string());
    }
    let chain = error_chain_text(&e);
    let lower = chain.to_lowercase();
    if e.is_connect() {
        if lower.contains("connection refused") {
            TransportError::ConnectionRefused(chain)
        } else if lower.contains("network unreachable") || lower.contains("no route to host") {
            TransportError::NetworkUnreachable(chain)
        } else if lower.contains("dns") || lower.contains("resolve") {
            TransportError::Dns(chain)
        } else {
            TransportError::Io(chain)
        }
    } else if lower.contains("dns") || lower.contains("resolve") {
        TransportError::Dns(chain)
    } else {
        TransportError::Io(chain)
    }
}

fn error_chain_text(e: &dyn std::error::Error) -> String {
    let mut text = e.to_string();
    let mut source = e.source();
    while let Some(s) = source {
        text.push_str(": ");
        text.push_str(&s.to_string());
        source = s.source();
    }
    text
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builds_with_and_without_verification() {
        let t = RestTransport::new("10.0.0.1", "api", "pw", false, Duration::from_secs(2));
        assert!(t.is_ok());
        let t = RestTransport::new("10.0.0.1", "api", "pw", true, Duration::from_secs(2));
        assert!(t.is_ok());
    }

    #[test]
    fn base_url_targets_rest_root() {
        let t = RestTransport::new("192.168.88.1", "api", "pw", false, Duration::from_secs(2))
            .unwrap();
        assert_eq!(t.base_url, "https://192.168.88.1/rest");
        assert_eq!(t.name(), "rest");
    }

    #[test]
    fn connection_refused_to_loopback_classifies() {
        // Nothing listens on this port; connect must fail fast and classify
        // as refused (or transient I/O on exotic stacks — never auth).
        let mut t = RestTransport::new(
            "127.0.0.1:1",
            "api",
            "pw",
            false,
            Duration::from_millis(500),
        )
        .unwrap()
        .with_retry(RetryPolicy::none());
        let err = t
            .run_cmd(&RouterCommand::new("system/resource/print"))
            .unwrap_err();
        assert!(
            matches!(
                err,
                TransportError::ConnectionRefused(_)
                    | TransportError::Io(_)
                    | TransportError::Timeout(_)
            ),
            "unexpected classification: {err:?}"
        );
    }
}

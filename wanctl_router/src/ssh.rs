//! SSH transport over the system ssh client.
//!
//! Spawns `ssh` in BatchMode with key authentication and runs the rendered
//! CLI command. RouterOS speaks a plain line protocol over SSH, so stdout is
//! handed up verbatim for the backend's tolerant parsers.
//!
//! ssh exits 255 for every client-side failure; the stderr text is the only
//! signal for classifying what actually went wrong.

use std::path::PathBuf;
use std::process::Command;

use crate::command::RouterCommand;
use crate::transport::{CommandOutput, RetryPolicy, Transport, TransportError};

/// SSH transport configuration + state.
#[derive(Debug, Clone)]
pub struct SshTransport {
    host: String,
    port: u16,
    user: String,
    key_path: Option<PathBuf>,
    connect_timeout_s: u32,
    retry: RetryPolicy,
}

impl SshTransport {
    pub fn new(
        host: impl Into<String>,
        port: u16,
        user: impl Into<String>,
        key_path: Option<PathBuf>,
    ) -> Self {
        Self {
            host: host.into(),
            port,
            user: user.into(),
            key_path,
            connect_timeout_s: 5,
            retry: RetryPolicy::default(),
        }
    }

    /// Override the retry policy (tests use [`RetryPolicy::none`]).
    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    fn run_once(&self, cmd: &RouterCommand) -> Result<CommandOutput, TransportError> {
        let mut ssh = Command::new("ssh");
        ssh.arg("-o")
            .arg("BatchMode=yes")
            .arg("-o")
            .arg("StrictHostKeyChecking=accept-new")
            .arg("-o")
            .arg(format!("ConnectTimeout={}", self.connect_timeout_s))
            .arg("-p")
            .arg(self.port.to_string());
        if let Some(key) = &self.key_path {
            ssh.arg("-i").arg(key);
        }
        ssh.arg(format!("{}@{}", self.user, self.host));
        ssh.arg(cmd.cli_render());

        let out = ssh
            .output()
            .map_err(|e| TransportError::Io(format!("spawning ssh: {e}")))?;
        let stdout = String::from_utf8_lossy(&out.stdout).into_owned();
        let stderr = String::from_utf8_lossy(&out.stderr).into_owned();
        let exit = out.status.code().unwrap_or(-1);

        if exit == 0 {
            return Ok(CommandOutput {
                exit,
                stdout,
                stderr,
            });
        }

        // 255 is the ssh client itself failing; anything else is the remote
        // command's exit status.
        if exit == 255 {
            Err(classify_ssh_stderr(&stderr))
        } else {
            Err(TransportError::CommandFailed { exit, stderr })
        }
    }
}

impl Transport for SshTransport {
    fn run_cmd(&mut self, cmd: &RouterCommand) -> Result<CommandOutput, TransportError> {
        let retry = self.retry;
        retry.run(&cmd.describe(), || self.run_once(cmd))
    }

    fn close(&mut self) {
        // One process per command; nothing persistent to tear down.
    }

    fn name(&self) -> &'static str {
        "ssh"
    }
}

/// Map ssh client stderr onto a typed error.
fn classify_ssh_stderr(stderr: &str) -> TransportError {
    let lower = stderr.to_lowercase();
    if lower.contains("timed out") || lower.contains("timeout") {
        TransportError::Timeout(first_line(stderr))
    } else if lower.contains("connection refused") {
        TransportError::ConnectionRefused(first_line(stderr))
    } else if lower.contains("network is unreachable") || lower.contains("no route to host") {
        TransportError::NetworkUnreachable(first_line(stderr))
    } else if lower.contains("could not resolve") || lower.contains("name or service not known") {
        TransportError::Dns(first_line(stderr))
    } else if lower.contains("permission denied")
        || lower.contains("authentication")
        || lower.contains("host key verification failed")
    {
        TransportError::Auth(first_line(stderr))
    } else {
        TransportError::Io(first_line(stderr))
    }
}

fn first_line(text: &str) -> String {
    text.lines().next().unwrap_or("").trim().to_string()
}

//! systemd readiness and watchdog notifications.
//!
//! Speaks the `sd_notify(3)` datagram protocol directly over `NOTIFY_SOCKET`
//! so the daemons carry no libsystemd linkage. All sends are best-effort:
//! outside systemd (no socket in the environment) every call is a no-op, and
//! send errors are logged at debug level and otherwise ignored — the control
//! loop must never stall on the supervisor.

use std::os::fd::AsRawFd;
use std::os::unix::net::UnixDatagram;

use nix::sys::socket::UnixAddr;
use tracing::debug;

/// Handle for systemd notifications. The supervisor owns exactly one.
#[derive(Debug)]
pub struct SdNotify {
    socket: Option<UnixDatagram>,
}

impl SdNotify {
    /// Build from `NOTIFY_SOCKET`; absent variable disables notifications.
    ///
    /// Abstract-namespace sockets are announced with a leading `@`.
    pub fn from_env() -> Self {
        let Some(path) = std::env::var_os("NOTIFY_SOCKET") else {
            return Self { socket: None };
        };
        let raw = path.as_encoded_bytes();
        if raw.is_empty() {
            return Self { socket: None };
        }

        let addr = if raw[0] == b'@' {
            UnixAddr::new_abstract(&raw[1..])
        } else {
            UnixAddr::new(raw)
        };

        let socket = addr.ok().and_then(|addr| {
            let sock = UnixDatagram::unbound().ok()?;
            nix::sys::socket::connect(sock.as_raw_fd(), &addr).ok()?;
            Some(sock)
        });
        if socket.is_none() {
            debug!("NOTIFY_SOCKET present but unusable; notifications disabled");
        }
        Self { socket }
    }

    /// Disabled handle (tests, `--oneshot`).
    pub fn disabled() -> Self {
        Self { socket: None }
    }

    /// Whether a notification socket is attached.
    pub fn is_enabled(&self) -> bool {
        self.socket.is_some()
    }

    /// `READY=1` — startup complete.
    pub fn ready(&self) {
        self.send(b"READY=1");
    }

    /// `WATCHDOG=1` — one liveness pet.
    pub fn watchdog(&self) {
        self.send(b"WATCHDOG=1");
    }

    /// `STOPPING=1` — graceful shutdown in progress.
    pub fn stopping(&self) {
        self.send(b"STOPPING=1");
    }

    fn send(&self, msg: &[u8]) {
        if let Some(sock) = &self.socket {
            if let Err(e) = sock.send(msg) {
                debug!(error = %e, "sd_notify send failed");
            }
        }
    }
}

//! wanctl Router Library
//!
//! Everything that talks to the router lives here:
//!
//! - [`command`] - Wire-neutral router command representation
//! - [`transport`] - The [`Transport`](transport::Transport) contract and retry policy
//! - [`ssh`] - SSH transport over the system ssh client
//! - [`rest`] - RouterOS REST API transport
//! - [`failover`] - Primary/fallback composition with a sticky failover flag
//! - [`backend`] - Typed operations: queue limits, queue stats, rule toggling
//! - [`connectivity`] - Failure classification and per-router outage tracking
//! - [`mock`] - Scriptable transport used by the daemons' tests
//!
//! The controller never sees a wire format; it calls the backend's typed
//! operations and classifies the errors that come back.

pub mod backend;
pub mod command;
pub mod connectivity;
pub mod failover;
pub mod mock;
pub mod rest;
pub mod ssh;
pub mod transport;

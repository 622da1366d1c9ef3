//! # wanctl Autorate
//!
//! Closed-loop bufferbloat controller: measures RTT every cycle, maintains
//! the idle baseline / load EWMA pair, and drives the router's shaped queue
//! limits through per-direction zone state machines with hysteresis.
//!
//! Module map:
//! - [`config`] - YAML configuration with strict validation
//! - [`queue`] - Per-direction rate state machines (3-state up, 4-state down)
//! - [`controller`] - One WAN's control cycle: measure → EWMA → adjust → apply → persist
//! - [`scheduler`] - Tick loop, watchdog pets, signal-driven shutdown

pub mod config;
pub mod controller;
pub mod queue;
pub mod scheduler;

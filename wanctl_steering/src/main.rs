//! # wanctl Steering Daemon
//!
//! Entry point: parse CLI arguments, load and validate the YAML config, set
//! up tracing, take the lock, build the backend and prober, and run the
//! steering loop on its own cadence.
//!
//! Exit codes: 0 success, 1 generic error, 2 config/argument error,
//! 130 interrupted by SIGINT.

use std::path::PathBuf;
use std::process::exit;
use std::sync::Arc;
use std::time::{Duration, Instant};

use clap::Parser;
use tracing::{error, info};
use tracing_subscriber::prelude::*;
use tracing_subscriber::{EnvFilter, fmt, reload};

use wanctl_common::lock::LockFile;
use wanctl_common::metrics::{Metrics, MetricsHandle};
use wanctl_common::notify::SdNotify;
use wanctl_common::probe::Prober;
use wanctl_common::shutdown;
use wanctl_router::backend::RouterBackend;
use wanctl_router::failover::FailoverTransport;
use wanctl_router::rest::RestTransport;
use wanctl_router::ssh::SshTransport;
use wanctl_router::transport::{Transport, TransportError};
use wanctl_steering::config::{self, RouterSection, SteeringConfig, TransportKind};
use wanctl_steering::daemon::{CycleReport, SteeringDaemon};

#[derive(Debug, Parser)]
#[command(name = "wanctl-steering", version, about = "Latency-sensitive traffic steering daemon")]
struct Cli {
    /// Path to the YAML configuration file.
    #[arg(long)]
    config: PathBuf,

    /// Parse and validate the configuration, then exit.
    #[arg(long)]
    validate_config: bool,

    /// Run a single steering cycle and exit.
    #[arg(long)]
    oneshot: bool,
}

fn main() {
    // All early returns funnel through here so destructors (lock file,
    // transports) run before the process exits.
    exit(run());
}

fn run() -> i32 {
    let cli = Cli::parse();

    let cfg = match config::load_config(&cli.config) {
        Ok(cfg) => cfg,
        Err(e) => {
            eprintln!("config error: {e}");
            return 2;
        }
    };
    if cli.validate_config {
        println!("config OK: steering {}", cfg.steering.name);
        return 0;
    }

    let reload_handle = init_tracing(&cfg);

    if let Err(e) = shutdown::install_signal_handlers() {
        eprintln!("signal handler setup failed: {e}");
        return 1;
    }

    let _lock = match LockFile::acquire(&cfg.steering.lock_file) {
        Ok(lock) => lock,
        Err(e) => {
            error!("{e}");
            return 1;
        }
    };

    let metrics = Metrics::new_handle();
    let backend = match build_backend(&cfg.router, metrics.clone()) {
        Ok(b) => b,
        Err(e) => {
            error!("router transport setup failed: {e}");
            return 1;
        }
    };
    let prober = Prober::new(cfg.ping_config(), cfg.fallback.tcp_targets.clone());
    let interval = Duration::from_secs_f64(cfg.steering.interval_s);
    let mut daemon = SteeringDaemon::new(cfg, backend, Box::new(prober), metrics);

    if cli.oneshot {
        let report = daemon.run_cycle();
        daemon.persist_now();
        daemon.close();
        info!(?report, "oneshot steering cycle complete");
        return 0;
    }

    let notify = SdNotify::from_env();
    notify.ready();
    info!(interval_s = interval.as_secs_f64(), "steering loop started");

    let mut verbose = false;
    let mut next_wake = Instant::now() + interval;
    while !shutdown::shutdown_requested() {
        if shutdown::take_verbose_toggle() {
            verbose = !verbose;
            let filter = if verbose { "debug" } else { "info" };
            if reload_handle.reload(EnvFilter::new(filter)).is_ok() {
                info!(filter, "log verbosity toggled via SIGUSR1");
            }
        }

        match daemon.run_cycle() {
            CycleReport::Skipped(_) => {
                // Skips are already logged with their cause; a skipped
                // assessment is not a daemon failure.
                notify.watchdog();
            }
            CycleReport::Assessed { .. } => notify.watchdog(),
        }

        let now = Instant::now();
        if next_wake > now {
            std::thread::sleep(next_wake - now);
            next_wake += interval;
        } else {
            next_wake = now + interval;
        }
    }

    info!(signal = ?shutdown::shutdown_signal(), "shutting down");
    notify.stopping();
    daemon.persist_now();
    daemon.close();
    shutdown::exit_code()
}

/// Resolve the configured transport pair into a backend (same policy as the
/// autorate daemon: the other wire is the fallback when credentials allow).
fn build_backend(
    router: &RouterSection,
    metrics: MetricsHandle,
) -> Result<RouterBackend, TransportError> {
    let timeout = Duration::from_secs_f64(router.timeout_s);
    let ssh = Box::new(SshTransport::new(
        &router.host,
        router.ssh_port,
        &router.user,
        router.ssh_key.clone(),
    ));

    let transport: Box<dyn Transport> = match router.transport {
        TransportKind::Rest => {
            let rest = Box::new(RestTransport::new(
                &router.host,
                &router.user,
                router.password.clone().unwrap_or_default(),
                router.verify_ssl,
                timeout,
            )?);
            Box::new(FailoverTransport::new(rest, ssh).with_metrics(metrics))
        }
        TransportKind::Ssh => match &router.password {
            Some(password) => {
                let rest = Box::new(RestTransport::new(
                    &router.host,
                    &router.user,
                    password.clone(),
                    router.verify_ssl,
                    timeout,
                )?);
                Box::new(FailoverTransport::new(ssh, rest).with_metrics(metrics))
            }
            None => ssh,
        },
    };

    Ok(RouterBackend::new(transport))
}

/// Tracing with an env-filter reload handle for SIGUSR1 verbosity toggling.
fn init_tracing(
    cfg: &SteeringConfig,
) -> reload::Handle<EnvFilter, tracing_subscriber::Registry> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let (filter_layer, handle) = reload::Layer::new(filter);

    let file_layer = cfg.steering.log_file.as_ref().and_then(|path| {
        match std::fs::OpenOptions::new().create(true).append(true).open(path) {
            Ok(file) => Some(fmt::layer().with_ansi(false).with_writer(Arc::new(file))),
            Err(e) => {
                eprintln!("log file {} unusable: {e}", path.display());
                None
            }
        }
    });

    tracing_subscriber::registry()
        .with(filter_layer)
        .with(fmt::layer().with_target(false).with_writer(std::io::stderr))
        .with(file_layer)
        .init();
    handle
}

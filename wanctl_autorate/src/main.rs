//! # wanctl Autorate Daemon
//!
//! Entry point: parse CLI arguments, load and validate the YAML config,
//! set up tracing, take the controller lock, build the per-WAN controllers,
//! and hand control to the supervisor loop.
//!
//! Exit codes: 0 success, 1 generic error (lock conflict, oneshot failure),
//! 2 config/argument error, 130 interrupted by SIGINT.

use std::path::PathBuf;
use std::process::exit;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tracing::{error, info};
use tracing_subscriber::prelude::*;
use tracing_subscriber::{EnvFilter, fmt, reload};

use wanctl_autorate::config::{self, AutorateConfig, RouterSection, TransportKind};
use wanctl_autorate::controller::WanController;
use wanctl_autorate::scheduler::Supervisor;
use wanctl_common::lock::LockFile;
use wanctl_common::metrics::{Metrics, MetricsHandle};
use wanctl_common::notify::SdNotify;
use wanctl_common::persist::StateFile;
use wanctl_common::probe::Prober;
use wanctl_common::shutdown;
use wanctl_router::backend::RouterBackend;
use wanctl_router::failover::FailoverTransport;
use wanctl_router::rest::RestTransport;
use wanctl_router::ssh::SshTransport;
use wanctl_router::transport::{Transport, TransportError};

#[derive(Debug, Parser)]
#[command(name = "wanctl-autorate", version, about = "Adaptive bufferbloat controller")]
struct Cli {
    /// Path to the YAML configuration file.
    #[arg(long)]
    config: PathBuf,

    /// Parse and validate the configuration, then exit.
    #[arg(long)]
    validate_config: bool,

    /// Run a single control cycle per WAN and exit.
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
        println!("config OK: {} WAN(s)", cfg.wans.len());
        return 0;
    }

    let reload_handle = init_tracing(&cfg);

    if let Err(e) = shutdown::install_signal_handlers() {
        eprintln!("signal handler setup failed: {e}");
        return 1;
    }

    let _lock = match LockFile::acquire(&cfg.controller.lock_file) {
        Ok(lock) => lock,
        Err(e) => {
            error!("{e}");
            return 1;
        }
    };

    let metrics = Metrics::new_handle();
    let period = Duration::from_millis(cfg.controller.cycle_interval_ms);
    let dt_s = period.as_secs_f64();

    let mut controllers = Vec::with_capacity(cfg.wans.len());
    for wan in &cfg.wans {
        let backend = match build_backend(&wan.router, metrics.clone()) {
            Ok(b) => b,
            Err(e) => {
                error!(wan = %wan.name, "router transport setup failed: {e}");
                return 1;
            }
        };
        let prober = Prober::new(wan.ping_config(), wan.fallback.tcp_targets.clone());
        controllers.push(WanController::new(
            wan,
            dt_s,
            backend,
            Box::new(prober),
            metrics.clone(),
        ));
    }

    let notify = if cli.oneshot {
        SdNotify::disabled()
    } else {
        SdNotify::from_env()
    };
    let health_file = cfg.controller.health_file.as_ref().map(StateFile::new);

    let mut verbose = false;
    let mut supervisor = Supervisor::new(
        controllers,
        period,
        cfg.controller.max_consecutive_failures,
        notify,
        metrics,
        health_file,
    )
    .with_verbose_toggle(Box::new(move || {
        verbose = !verbose;
        let filter = if verbose { "debug" } else { "info" };
        if reload_handle.reload(EnvFilter::new(filter)).is_ok() {
            info!(filter, "log verbosity toggled via SIGUSR1");
        }
    }));

    if cli.oneshot {
        let ok = supervisor.run_once();
        return if ok { 0 } else { 1 };
    }

    supervisor.run();
    shutdown::exit_code()
}

/// Resolve the configured transport pair into a backend.
///
/// REST primary gets SSH fallback; SSH primary gets REST fallback when a
/// password is configured, otherwise plain SSH without failover.
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
    cfg: &AutorateConfig,
) -> reload::Handle<EnvFilter, tracing_subscriber::Registry> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let (filter_layer, handle) = reload::Layer::new(filter);

    let file_layer = cfg.controller.log_file.as_ref().and_then(|path| {
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

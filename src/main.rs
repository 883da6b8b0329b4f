mod alert;
mod baseline;
mod cli;
mod config;
mod connection;
mod diff;
mod error;
mod filter;
mod logging;
mod monitor;
mod snapshot;
#[cfg(test)]
mod testing;

use crate::baseline::{BaselineMedium, BaselineStore, CorruptBaselinePolicy, FileMedium};
use crate::cli::CliArgs;
use crate::config::Config;
use crate::error::{BaselineError, ConfigError, PersistenceError, SnapshotError};
use crate::filter::ConnectionFilter;
use crate::logging::setup_logging;
use crate::monitor::{CycleOutcome, Monitor, MonitorSettings, SystemClock};
use anyhow::Context;
use log::{error, info, warn, LevelFilter};
use std::process::ExitCode;
use std::sync::Arc;
use tokio::sync::watch;

const EXIT_CONFIG: u8 = 1;
const EXIT_BASELINE: u8 = 2;
const EXIT_UNSUPPORTED: u8 = 3;

fn main() -> ExitCode {
    let args = CliArgs::from_matches(&cli::build_cli().get_matches());

    let config = match Config::resolve(args.config_path.as_deref(), &args.overrides) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Configuration error: {}", e);
            return ExitCode::from(EXIT_CONFIG);
        }
    };

    let level = config.logging.level().unwrap_or(LevelFilter::Info);
    if let Err(e) = setup_logging(level, config.logging.log_file.as_deref()) {
        eprintln!("Failed to setup logging: {}", e);
    }

    match run(config, args.once) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{:#}", e);
            ExitCode::from(exit_code(&e))
        }
    }
}

fn exit_code(err: &anyhow::Error) -> u8 {
    if err.downcast_ref::<BaselineError>().is_some()
        || err.downcast_ref::<PersistenceError>().is_some()
    {
        EXIT_BASELINE
    } else if matches!(err.downcast_ref::<SnapshotError>(), Some(SnapshotError::Unsupported)) {
        EXIT_UNSUPPORTED
    } else if err.downcast_ref::<ConfigError>().is_some() {
        EXIT_CONFIG
    } else {
        1
    }
}

fn run(config: Config, once: bool) -> anyhow::Result<()> {
    info!("conn-sentinel {} starting", env!("CARGO_PKG_VERSION"));

    let filter = ConnectionFilter::new(&config.filter)?;
    let source = snapshot::platform_source()?;

    let medium = FileMedium::new(&config.monitor.baseline_file);
    let baseline = open_baseline(&medium, config.monitor.on_corrupt_baseline)?;

    let sink = alert::build_sink(&config.alerts.target());
    let mut monitor = Monitor::new(
        MonitorSettings::from(&config.monitor),
        source,
        filter,
        Box::new(medium),
        baseline,
        sink,
        Arc::new(SystemClock),
    );

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(2)
        .enable_all()
        .build()
        .context("Failed to start the async runtime")?;

    runtime.block_on(async move {
        if once {
            if monitor.run_once().await == CycleOutcome::SnapshotFailed {
                anyhow::bail!("Snapshot failed, nothing was recorded");
            }
            return Ok(());
        }

        let (stop_tx, stop_rx) = watch::channel(false);
        tokio::spawn(async move {
            wait_for_shutdown().await;
            info!("Shutdown signal received, stopping...");
            let _ = stop_tx.send(true);
        });

        monitor.run(stop_rx).await;
        Ok(())
    })
}

/// Loads the baseline and writes it straight back, so an unusable baseline
/// path fails at startup instead of on the first cycle.
fn open_baseline(
    medium: &dyn BaselineMedium,
    policy: CorruptBaselinePolicy,
) -> anyhow::Result<BaselineStore> {
    let baseline = BaselineStore::load_or_recover(medium, policy)
        .with_context(|| format!("Cannot use baseline {}", medium.location()))?;
    baseline
        .save(medium)
        .with_context(|| format!("Baseline {} is not writable", medium.location()))?;

    if baseline.is_empty() {
        info!(
            "No known connections in {} yet, the first poll reports everything as new",
            medium.location()
        );
    } else {
        info!(
            "Loaded {} known connections from {}",
            baseline.len(),
            medium.location()
        );
    }
    Ok(baseline)
}

#[cfg(unix)]
async fn wait_for_shutdown() {
    use tokio::signal::unix::{signal, SignalKind};

    match signal(SignalKind::terminate()) {
        Ok(mut term) => {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {}
                _ = term.recv() => {}
            }
        }
        Err(e) => {
            warn!("Cannot listen for SIGTERM ({}), only Ctrl+C stops the monitor", e);
            let _ = tokio::signal::ctrl_c().await;
        }
    }
}

#[cfg(not(unix))]
async fn wait_for_shutdown() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!("Cannot listen for Ctrl+C: {}", e);
        std::future::pending::<()>().await;
    }
}

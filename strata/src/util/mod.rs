//! Process-wide helpers: logging setup and mount primitives.

pub mod mount;

use std::path::Path;
use std::sync::OnceLock;

use strata_shared::constants::envs;
use strata_shared::errors::{StrataError, StrataResult};
use strata_shared::layout::files;
use tracing_appender::non_blocking::{NonBlocking, WorkerGuard};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, fmt};

static LOG_GUARD: OnceLock<WorkerGuard> = OnceLock::new();

/// Install a daily-rolling file logger under `logs_dir`.
///
/// The filter comes from `STRATA_LOG`, then `RUST_LOG`, then `info`.
/// Only the first call installs anything; later calls (and processes that
/// already set a global subscriber) are left alone.
pub fn init_logging(logs_dir: &Path) -> StrataResult<()> {
    if LOG_GUARD.get().is_some() {
        return Ok(());
    }

    std::fs::create_dir_all(logs_dir).map_err(|e| {
        StrataError::Storage(format!(
            "failed to create logs dir {}: {}",
            logs_dir.display(),
            e
        ))
    })?;

    let appender = tracing_appender::rolling::daily(logs_dir, files::LOG_PREFIX);
    let (non_blocking, guard) = tracing_appender::non_blocking(appender);

    if LOG_GUARD.set(guard).is_err() {
        // Lost the race to a concurrent caller; their subscriber wins.
        return Ok(());
    }

    let env_filter = EnvFilter::try_from_env(envs::STRATA_LOG)
        .or_else(|_| EnvFilter::try_from_default_env())
        .unwrap_or_else(|_| EnvFilter::new("info"));

    register_to_tracing(non_blocking, env_filter);
    Ok(())
}

pub fn register_to_tracing(non_blocking: NonBlocking, env_filter: EnvFilter) {
    let _ = tracing_subscriber::registry()
        .with(env_filter)
        .with(
            fmt::layer()
                .with_writer(non_blocking)
                .with_target(true)
                .with_thread_ids(false)
                .with_file(false)
                .with_line_number(false)
                .with_ansi(false),
        )
        .try_init();
}

//! Tracing setup for the `batchq` binary.
//!
//! The filter comes from `RUST_LOG` and defaults to `info`. Daemon
//! instances additionally write to their own file under the configured
//! log directory.

use std::path::{Path, PathBuf};

use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

fn env_filter() -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
}

fn daemon_log_name(instance_id: &str) -> String {
    format!("batchq-daemon.{}.log", instance_id)
}

/// Log file of daemon instance `instance_id`.
pub fn daemon_log_path(log_dir: &Path, instance_id: &str) -> PathBuf {
    log_dir.join(daemon_log_name(instance_id))
}

/// Log to stderr and to [`daemon_log_path`].
///
/// The returned guard flushes the file writer on drop and must be held for
/// the life of the process.
pub fn init_daemon(log_dir: &Path, instance_id: &str) -> std::io::Result<WorkerGuard> {
    std::fs::create_dir_all(log_dir)?;
    let appender = tracing_appender::rolling::never(log_dir, daemon_log_name(instance_id));
    let (file_writer, guard) = tracing_appender::non_blocking(appender);

    let stderr_layer = fmt::layer().with_writer(std::io::stderr);
    let file_layer = fmt::layer().with_ansi(false).with_writer(file_writer);

    tracing_subscriber::registry()
        .with(env_filter())
        .with(stderr_layer)
        .with(file_layer)
        .try_init()
        .map_err(std::io::Error::other)?;

    Ok(guard)
}

/// Log to stderr only, for the short-lived client commands.
pub fn init_cli() {
    tracing_subscriber::fmt()
        .with_env_filter(env_filter())
        .with_writer(std::io::stderr)
        .init();
}

//! Logging initialization using `tracing` and `tracing-subscriber`.

use std::path::{Path, PathBuf};

use tracing::{info, warn};
use tracing_subscriber::{fmt, fmt::writer::BoxMakeWriter, util::SubscriberInitExt, EnvFilter};

use crate::http::stats::TransferSnapshot;
use crate::Result;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat {
    #[default]
    Human,
    Json,
}

#[derive(Debug, Clone)]
pub enum LogSink {
    /// Log to stderr, so user output and logs do not interleave.
    Console,
    /// Append-only log file.
    File(PathBuf),
}

#[derive(Debug, Clone)]
pub struct LoggingConfig {
    pub format: LogFormat,
    pub sink: LogSink,
    pub debug: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            format: LogFormat::Human,
            sink: LogSink::Console,
            debug: false,
        }
    }
}

/// Initialize global tracing subscriber. Safe to call multiple times;
/// subsequent calls will no-op.
pub fn init_logging(config: LoggingConfig) -> Result<()> {
    if tracing::dispatcher::has_been_set() {
        return Ok(());
    }

    let filter = if config.debug {
        EnvFilter::new("trace")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };

    let (writer, ansi) = match &config.sink {
        LogSink::Console => (BoxMakeWriter::new(std::io::stderr), true),
        LogSink::File(path) => {
            ensure_parent(path)?;
            let file = std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)?;
            (BoxMakeWriter::new(std::sync::Mutex::new(file)), false)
        }
    };

    let builder = fmt::Subscriber::builder()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(writer)
        .with_ansi(ansi);

    match config.format {
        LogFormat::Human => {
            let _ = builder.finish().try_init();
        }
        LogFormat::Json => {
            let _ = builder.json().finish().try_init();
        }
    };

    Ok(())
}

fn ensure_parent(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    Ok(())
}

/// Emit accumulated HTTP transfer counters. Called at unmount and on demand;
/// callers pass a snapshot to keep log volume bounded.
pub fn log_transfer_metrics(snapshot: TransferSnapshot, level_warn: bool) {
    let avg_ms = if snapshot.run_count > 0 {
        snapshot.run_time.as_secs_f64() / snapshot.run_count as f64 * 1.0e3
    } else {
        0.0
    };
    if level_warn {
        warn!(
            target = "objfs::http",
            run_count = snapshot.run_count,
            total_time_s = snapshot.run_time.as_secs_f64(),
            avg_time_ms = avg_ms,
            bytes = snapshot.bytes_transferred,
            transport_failures = snapshot.transport_failures,
            request_failures = snapshot.request_failures,
            timeouts = snapshot.timeouts,
            aborts = snapshot.aborts,
            hook_retries = snapshot.hook_retries,
            "transfer_metrics_degraded"
        );
    } else {
        info!(
            target = "objfs::http",
            run_count = snapshot.run_count,
            total_time_s = snapshot.run_time.as_secs_f64(),
            avg_time_ms = avg_ms,
            bytes = snapshot.bytes_transferred,
            transport_failures = snapshot.transport_failures,
            request_failures = snapshot.request_failures,
            timeouts = snapshot.timeouts,
            aborts = snapshot.aborts,
            hook_retries = snapshot.hook_retries,
            "transfer_metrics"
        );
    }
}

use std::{
    io::{self, IsTerminal},
    path::Path,
};

use tracing_appender::{
    non_blocking::WorkerGuard,
    rolling::{Builder, Rotation},
};
use tracing_subscriber::{
    fmt::{self, time::UtcTime},
    layer::SubscriberExt,
    util::SubscriberInitExt,
    EnvFilter, Layer,
};

use crate::cli::ColorChoice;

/// Rolled log files kept next to the current one.
const KEPT_LOG_FILES: usize = 7;

/// Keeps the file writer alive. Logs written after this is dropped may be
/// lost.
pub struct LogGuard {
    _file_guard: Option<WorkerGuard>,
}

pub fn init_logging(verbosity: u8, color: ColorChoice, log_dir: Option<&Path>) -> LogGuard {
    let console_env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(console_filter(verbosity)));

    let use_ansi = match color {
        ColorChoice::Always => true,
        ColorChoice::Never => false,
        ColorChoice::Auto => io::stderr().is_terminal(),
    };

    let console_layer = fmt::layer()
        .with_writer(io::stderr)
        .with_ansi(use_ansi)
        .without_time()
        .with_target(false)
        .with_thread_names(false)
        .with_level(true)
        .with_filter(console_env_filter);

    let mut file_guard = None;

    let file_layer = match log_dir.map(open_log_file) {
        Some(Ok((writer, guard))) => {
            file_guard = Some(guard);

            let layer = fmt::layer()
                .with_writer(writer)
                .with_ansi(false)
                .with_timer(UtcTime::rfc_3339())
                .with_target(true)
                .with_thread_names(true)
                .with_level(true)
                .with_filter(EnvFilter::new("debug"));

            Some(layer)
        }
        Some(Err(err)) => {
            eprintln!("Warning: could not open log file: {err}");
            None
        }
        None => None,
    };

    // Also forwards records of the `log` facade, which the library uses.
    tracing_subscriber::registry()
        .with(console_layer)
        .with(file_layer)
        .init();

    LogGuard {
        _file_guard: file_guard,
    }
}

fn console_filter(verbosity: u8) -> &'static str {
    match verbosity {
        0 => "info",
        1 => "info,libtreewatch=debug",
        2 => "info,libtreewatch=trace",
        _ => "trace",
    }
}

fn open_log_file(
    log_dir: &Path,
) -> anyhow::Result<(tracing_appender::non_blocking::NonBlocking, WorkerGuard)> {
    fs_err::create_dir_all(log_dir)?;

    let appender = Builder::new()
        .rotation(Rotation::DAILY)
        .filename_prefix("treewatch")
        .filename_suffix("log")
        .max_log_files(KEPT_LOG_FILES)
        .build(log_dir)?;

    Ok(tracing_appender::non_blocking(appender))
}

//! Logging system: console output plus an optional asynchronous log file.
//!
//! All diagnostics go through `log` macros, bridged to `tracing`. The
//! console layer writes to standard error (standard output may carry the
//! packet stream). The file layer uses a non-blocking writer whose buffer
//! depth is `--log-message-count`; with `--synchronous-log` the writer
//! blocks instead of dropping messages when the buffer fills.

use std::io;
use std::path::PathBuf;

use chrono::Local;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Resolved logging options.
#[derive(Debug, Clone, Default)]
pub struct LogOptions {
    /// Occurrences of `-v` / `--verbose`.
    pub verbose: u8,
    /// `-d` / `--debug` level.
    pub debug: Option<u8>,
    /// Timestamp each log line (`--timed-log`).
    pub timed: bool,
    /// Never drop file log messages (`--synchronous-log`).
    pub synchronous: bool,
    /// Log file path, console only when unset.
    pub log_file: Option<PathBuf>,
    /// Buffered message count for the asynchronous file writer.
    pub message_count: usize,
}

/// Initialize the logging system.
///
/// # Arguments
/// * `opts` - resolved logging options from the command line and the
///   configuration file
pub fn init_logging(opts: &LogOptions) -> Result<(), Box<dyn std::error::Error>> {
    let default_level = match (opts.debug, opts.verbose) {
        (Some(level), _) if level >= 2 => "trace",
        (Some(_), _) => "debug",
        (None, v) if v > 0 => "debug",
        _ => "info",
    };
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    let console_layer = fmt::layer()
        .with_writer(io::stderr)
        .with_target(false)
        .with_level(true)
        .with_timer(OptionalTimer { enabled: opts.timed });

    let file_layer = match &opts.log_file {
        Some(path) => {
            let file = std::fs::File::options()
                .create(true)
                .append(true)
                .open(path)
                .map_err(|e| format!("cannot open log file {}: {e}", path.display()))?;
            let (non_blocking, guard) = tracing_appender::non_blocking::NonBlockingBuilder::default()
                .lossy(!opts.synchronous)
                .buffered_lines_limit(opts.message_count.max(1))
                .finish(file);
            // Keep the writer guard alive for the lifetime of the process.
            Box::leak(Box::new(guard));
            Some(
                fmt::layer()
                    .with_writer(non_blocking)
                    .with_target(true)
                    .with_level(true)
                    .with_thread_ids(true)
                    .with_ansi(false)
                    .with_timer(OptionalTimer { enabled: true }),
            )
        }
        None => None,
    };

    let subscriber = tracing_subscriber::registry()
        .with(env_filter)
        .with(console_layer)
        .with(file_layer);

    tracing::subscriber::set_global_default(subscriber)
        .map_err(|e| format!("Failed to set default subscriber: {e}"))?;

    // Bridge log:: macros to tracing.
    tracing_log::LogTracer::init().map_err(|e| format!("Failed to initialize LogTracer: {e}"))?;

    Ok(())
}

/// Local-time timer that can be disabled (untimed console log lines).
#[derive(Debug, Clone, Copy)]
struct OptionalTimer {
    enabled: bool,
}

impl fmt::time::FormatTime for OptionalTimer {
    fn format_time(&self, w: &mut fmt::format::Writer) -> std::fmt::Result {
        if self.enabled {
            write!(w, "{}", Local::now().format("%Y-%m-%dT%H:%M:%S%.3f"))
        } else {
            Ok(())
        }
    }
}

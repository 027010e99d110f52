//! Structured logging for the riptide cli and agent.
//!
//! Both binaries log to stderr at a level picked by `-v` flags. The agent can
//! additionally write a debug-level log file, since it usually runs detached.

use std::path::{Path, PathBuf};

use tracing::Level;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{
    filter::LevelFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer,
};

/// Log verbosity level.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Verbosity {
    /// Errors only
    #[default]
    Quiet,
    /// Info level
    Normal,
    /// Debug level
    Verbose,
    /// Trace level
    Trace,
}

impl Verbosity {
    /// Map a repeated `-v` flag count to a verbosity.
    pub fn from_occurrences(count: u8) -> Self {
        match count {
            0 => Verbosity::Quiet,
            1 => Verbosity::Normal,
            2 => Verbosity::Verbose,
            _ => Verbosity::Trace,
        }
    }

    /// Get the tracing level filter for this verbosity.
    pub fn as_level_filter(&self) -> LevelFilter {
        match self {
            Verbosity::Quiet => LevelFilter::ERROR,
            Verbosity::Normal => LevelFilter::INFO,
            Verbosity::Verbose => LevelFilter::DEBUG,
            Verbosity::Trace => LevelFilter::TRACE,
        }
    }

    /// Get the tracing level for this verbosity.
    pub fn as_level(&self) -> Level {
        match self {
            Verbosity::Quiet => Level::ERROR,
            Verbosity::Normal => Level::INFO,
            Verbosity::Verbose => Level::DEBUG,
            Verbosity::Trace => Level::TRACE,
        }
    }
}

/// Configuration for the logging system.
#[derive(Debug, Clone, Default)]
pub struct LogConfig {
    /// Verbosity level for stderr output.
    pub verbosity: Verbosity,
    /// Optional path to log file.
    pub log_file: Option<PathBuf>,
}

/// Guard that must be kept alive for the duration of logging.
///
/// When this guard is dropped, the logging system will flush pending logs.
pub struct LogGuard {
    _file_guard: Option<WorkerGuard>,
}

/// Initialize the logging system.
///
/// Returns a guard that must be kept alive for the duration of logging.
/// `RUST_LOG` overrides the level picked by `verbosity`.
///
/// ```ignore
/// use riptide::logging::{init_logging, LogConfig, Verbosity};
///
/// let _guard = init_logging(&LogConfig {
///     verbosity: Verbosity::Verbose,
///     log_file: Some("/tmp/riptide-agent.log".into()),
/// });
/// tracing::info!("Logging initialized");
/// ```
pub fn init_logging(config: &LogConfig) -> LogGuard {
    let env_filter = EnvFilter::builder()
        .with_default_directive(config.verbosity.as_level_filter().into())
        .from_env_lossy();

    let (file_layer, file_guard) = if let Some(ref path) = config.log_file {
        let parent_dir = path.parent().unwrap_or(Path::new("."));
        let filename = path
            .file_name()
            .and_then(|s| s.to_str())
            .unwrap_or("riptide.log");

        let file_appender = tracing_appender::rolling::never(parent_dir, filename);
        let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

        let file_layer = fmt::layer()
            .with_ansi(false)
            .with_target(true)
            .with_thread_ids(true)
            .with_writer(non_blocking)
            .with_filter(LevelFilter::DEBUG);

        (Some(file_layer), Some(guard))
    } else {
        (None, None)
    };

    let stderr_layer = fmt::layer()
        .with_ansi(true)
        .with_target(false)
        .with_timer(fmt::time::uptime())
        .with_writer(std::io::stderr)
        .with_filter(config.verbosity.as_level_filter());

    // A subscriber may already be installed when an agent is embedded in tests.
    let _ = tracing_subscriber::registry()
        .with(env_filter)
        .with(stderr_layer)
        .with(file_layer)
        .try_init();

    LogGuard {
        _file_guard: file_guard,
    }
}

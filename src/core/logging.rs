use std::collections::HashMap;
use std::path::{Path, PathBuf};

use thiserror::Error;
use tracing_appender::non_blocking::{NonBlocking, WorkerGuard};
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::fmt::MakeWriter;
use tracing_subscriber::prelude::*;
use tracing_subscriber::EnvFilter;

/// Targets that get a log file of their own. Everything else goes to
/// `recorder.log`.
const ROUTED_TARGETS: [&str; 2] = ["rfb", "encoder"];
const DEFAULT_LOG_FILE: &str = "recorder";

#[derive(Error, Debug)]
pub enum LoggingError {
    #[error("Failed to create log directory {path:?}: {source}")]
    CreateDir {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("Failed to set global tracing subscriber: {0}")]
    Install(String),
}

#[derive(Debug, Clone)]
pub struct LogConfig {
    /// Filter used when RUST_LOG is unset.
    pub level: String,
    /// Directory for daily-rolled log files.
    pub dir: Option<PathBuf>,
}

/// Keeps the non-blocking writers flushing. Hold for the whole run.
pub struct LoggingGuards {
    _guards: Vec<WorkerGuard>,
}

struct TargetWriter {
    writers: HashMap<&'static str, NonBlocking>,
    default_writer: NonBlocking,
}

impl<'a> MakeWriter<'a> for TargetWriter {
    type Writer = NonBlocking;

    fn make_writer(&'a self) -> Self::Writer {
        self.default_writer.clone()
    }

    fn make_writer_for(&'a self, meta: &tracing::Metadata<'_>) -> Self::Writer {
        routed_target(meta.target())
            .and_then(|name| self.writers.get(name))
            .unwrap_or(&self.default_writer)
            .clone()
    }
}

/// Which routed target, if any, owns events logged under `target`.
fn routed_target(target: &str) -> Option<&'static str> {
    ROUTED_TARGETS.iter().copied().find(|name| {
        target == *name
            || target
                .strip_prefix(name)
                .is_some_and(|rest| rest.starts_with("::"))
    })
}

fn env_filter(level: &str) -> EnvFilter {
    EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(level))
        .unwrap_or_else(|_| EnvFilter::new("warn"))
}

fn file_writer(log_dir: &Path, guards: &mut Vec<WorkerGuard>) -> Result<TargetWriter, LoggingError> {
    if !log_dir.exists() {
        std::fs::create_dir_all(log_dir).map_err(|source| LoggingError::CreateDir {
            path: log_dir.to_path_buf(),
            source,
        })?;
    }

    let mut writers = HashMap::new();
    for target in ROUTED_TARGETS {
        let appender = RollingFileAppender::new(Rotation::DAILY, log_dir, format!("{}.log", target));
        let (non_blocking, guard) = tracing_appender::non_blocking(appender);
        writers.insert(target, non_blocking);
        guards.push(guard);
    }

    let appender = RollingFileAppender::new(
        Rotation::DAILY,
        log_dir,
        format!("{}.log", DEFAULT_LOG_FILE),
    );
    let (default_writer, guard) = tracing_appender::non_blocking(appender);
    guards.push(guard);

    Ok(TargetWriter {
        writers,
        default_writer,
    })
}

/// Installs the global subscriber: stdout always, plus per-target daily
/// files when a log directory is configured.
pub fn init_logging(config: &LogConfig) -> Result<LoggingGuards, LoggingError> {
    let mut guards = Vec::new();

    let file_layer = match &config.dir {
        Some(dir) => Some(
            tracing_subscriber::fmt::layer()
                .with_writer(file_writer(dir, &mut guards)?)
                .with_ansi(false)
                .with_target(true)
                .with_thread_names(true),
        ),
        None => None,
    };

    let stdout_layer = tracing_subscriber::fmt::layer()
        .with_writer(std::io::stdout)
        .with_target(true)
        .with_thread_ids(false)
        .with_thread_names(false);

    let subscriber = tracing_subscriber::registry()
        .with(env_filter(&config.level))
        .with(stdout_layer)
        .with(file_layer);

    tracing::subscriber::set_global_default(subscriber)
        .map_err(|e| LoggingError::Install(e.to_string()))?;

    if let Some(dir) = &config.dir {
        tracing::info!(target: "recorder", "Logging to {:?}", dir);
    }

    Ok(LoggingGuards { _guards: guards })
}

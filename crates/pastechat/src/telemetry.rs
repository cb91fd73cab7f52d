//! Log setup for embedders that do not install their own subscriber.

use std::fs::OpenOptions;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use tracing::level_filters::LevelFilter;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::EnvFilter;

use crate::error::TelemetryError;

/// Crates under the `webrtc` umbrella that flood the log at trace level.
const NOISY_TARGETS: &[&str] = &[
    "webrtc_ice",
    "webrtc_sctp",
    "webrtc_dtls",
    "webrtc_mdns",
    "webrtc_util",
    "webrtc_srtp",
    "interceptor",
];

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Error,
    #[default]
    Warn,
    Info,
    Debug,
    Trace,
}

impl LogLevel {
    pub fn to_filter(self) -> LevelFilter {
        match self {
            LogLevel::Error => LevelFilter::ERROR,
            LogLevel::Warn => LevelFilter::WARN,
            LogLevel::Info => LevelFilter::INFO,
            LogLevel::Debug => LevelFilter::DEBUG,
            LogLevel::Trace => LevelFilter::TRACE,
        }
    }
}

#[derive(Clone, Debug, Default)]
pub struct LogConfig {
    pub level: LogLevel,
    /// Append to this file instead of writing to stderr.
    pub file: Option<PathBuf>,
}

/// Flushes buffered log lines when dropped. Keep it alive for the life of
/// the process.
#[must_use]
pub struct LogGuard {
    _worker: WorkerGuard,
}

/// Installs the global subscriber. `RUST_LOG`, when set, replaces the filter
/// derived from `config.level`.
pub fn init(config: &LogConfig) -> Result<LogGuard, TelemetryError> {
    let env_filter = build_env_filter(config.level)?;

    let (writer, guard) = match &config.file {
        Some(path) => {
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .map_err(|source| TelemetryError::LogFile {
                    path: path.display().to_string(),
                    source,
                })?;
            tracing_appender::non_blocking(file)
        }
        None => tracing_appender::non_blocking(std::io::stderr()),
    };

    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_level(true)
        .with_target(config.level >= LogLevel::Debug)
        .with_thread_ids(config.level >= LogLevel::Trace)
        .with_ansi(config.file.is_none())
        .with_writer(writer)
        .finish();

    tracing::subscriber::set_global_default(subscriber)
        .map_err(|err| TelemetryError::AlreadyInstalled(err.to_string()))?;

    Ok(LogGuard { _worker: guard })
}

/// Routes logs through the test harness's captured output. Safe to call from
/// every test.
pub fn init_for_tests() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("pastechat=debug")),
        )
        .with_test_writer()
        .try_init();
}

fn build_env_filter(level: LogLevel) -> Result<EnvFilter, TelemetryError> {
    match std::env::var(EnvFilter::DEFAULT_ENV) {
        Ok(directives) if !directives.trim().is_empty() => Ok(EnvFilter::try_new(directives)?),
        _ => Ok(EnvFilter::try_new(default_directives(level))?),
    }
}

fn default_directives(level: LogLevel) -> String {
    match level {
        LogLevel::Trace => {
            let mut directives = String::from("info,pastechat=trace,webrtc=trace");
            for target in NOISY_TARGETS {
                directives.push(',');
                directives.push_str(target);
                directives.push_str("=info");
            }
            directives
        }
        LogLevel::Debug => "info,pastechat=debug,webrtc=debug".to_owned(),
        other => other.to_filter().to_string(),
    }
}

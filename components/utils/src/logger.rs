use serde::{Deserialize, Serialize};
use tracing_appender::{
    non_blocking::WorkerGuard,
    rolling::{RollingFileAppender, Rotation},
};
use tracing_subscriber::{filter, fmt::Layer, layer::SubscriberExt, EnvFilter, Registry};

pub const DEFAULT_LOG_DIR: &str = "/tmp/sorafs.logs";

const DEFAULT_LOG_TARGETS: &str = "info";

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingOptions {
    pub dir: String,
    pub level: Option<String>,
    pub append_stdout: bool,
    pub log_to_file: bool,
}

impl Default for LoggingOptions {
    fn default() -> Self {
        Self {
            dir: DEFAULT_LOG_DIR.to_string(),
            level: None,
            append_stdout: true,
            log_to_file: false,
        }
    }
}

impl LoggingOptions {
    pub fn with_dir(self, dir: String) -> Self {
        Self { dir, ..self }
    }

    pub fn with_level(self, level: impl Into<String>) -> Self {
        Self {
            level: Some(level.into()),
            ..self
        }
    }
}

/// Installs the global tracing subscriber. The returned guards must be held
/// for as long as logging should keep flushing.
pub fn init_global_logging(app_name: &str, opts: &LoggingOptions) -> Vec<WorkerGuard> {
    let mut guards = vec![];

    let stdout_logging_layer = if opts.append_stdout {
        let (stdout_writer, stdout_guard) = tracing_appender::non_blocking(std::io::stdout());
        guards.push(stdout_guard);
        Some(Layer::new().with_writer(stdout_writer))
    } else {
        None
    };

    let file_logging_layer = if opts.log_to_file {
        let rolling_appender = RollingFileAppender::new(Rotation::HOURLY, &opts.dir, app_name);
        let (rolling_writer, rolling_guard) = tracing_appender::non_blocking(rolling_appender);
        guards.push(rolling_guard);
        Some(Layer::new().with_writer(rolling_writer).with_ansi(false))
    } else {
        None
    };

    // Level resolution: explicit option, then RUST_LOG, then the default.
    let rust_log_env = std::env::var(EnvFilter::DEFAULT_ENV).ok();
    let targets_string = opts
        .level
        .as_deref()
        .or(rust_log_env.as_deref())
        .unwrap_or(DEFAULT_LOG_TARGETS);
    let target_filter = targets_string
        .parse::<filter::Targets>()
        .expect("error parsing log level string");

    let subscriber = Registry::default()
        .with(target_filter)
        .with(stdout_logging_layer)
        .with(file_logging_layer);

    tracing::subscriber::set_global_default(subscriber)
        .expect("error setting global tracing subscriber");

    guards
}

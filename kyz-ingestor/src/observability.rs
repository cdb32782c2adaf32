use std::path::Path;

use tracing_appender::{
    non_blocking::WorkerGuard,
    rolling::{InitError, RollingFileAppender, Rotation},
};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Defaults applied on top of `RUST_LOG`.
const DEFAULT_DIRECTIVES: [&str; 3] = ["kyz_ingestor=info", "mqtt_probe=info", "rumqttc=warn"];

pub const LOG_FILE_PREFIX: &str = "kyz_ingestor.log";
/// Rotated files kept besides the current one.
pub const LOG_RETENTION_DAYS: usize = 30;

fn default_filter() -> EnvFilter {
    let mut filter = EnvFilter::from_default_env();
    for directive in DEFAULT_DIRECTIVES {
        if let Ok(d) = directive.parse() {
            filter = filter.add_directive(d);
        }
    }
    filter
}

/// Log file under `dir`, rolled at midnight (UTC) and pruned to the retention limit.
pub fn file_appender(dir: &Path) -> Result<RollingFileAppender, InitError> {
    RollingFileAppender::builder()
        .rotation(Rotation::DAILY)
        .filename_prefix(LOG_FILE_PREFIX)
        .max_log_files(LOG_RETENTION_DAYS + 1)
        .build(dir)
}

/// Console logging, plus a daily log file when `log_dir` is given.
///
/// Keep the returned guard alive until exit; dropping it flushes the file writer.
pub fn init_tracing(log_dir: Option<&Path>) -> Option<WorkerGuard> {
    let (file, guard, file_err) = match log_dir.map(|dir| (dir, file_appender(dir))) {
        Some((_, Ok(appender))) => {
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let layer = fmt::layer()
                .with_ansi(false)
                .with_target(false)
                .with_thread_names(true)
                .with_writer(writer);
            (Some(layer), Some(guard), None)
        }
        Some((dir, Err(e))) => (None, None, Some((dir.display().to_string(), e))),
        None => (None, None, None),
    };

    tracing_subscriber::registry()
        .with(default_filter())
        .with(fmt::layer().with_target(false).with_thread_names(true))
        .with(file)
        .init();

    if let Some((dir, e)) = file_err {
        tracing::warn!(error = %e, %dir, "file logging disabled; console only");
    }

    guard
}

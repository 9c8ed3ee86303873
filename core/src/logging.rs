// Tracing setup
//
// RUST_LOG wins over the configured level. Initialising twice is harmless;
// the first subscriber stays.

use crate::config::LoggingConfig;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::EnvFilter;

const LOG_FILE_PREFIX: &str = "courier.log";

/// Install the global subscriber. With a log directory configured, output
/// goes to a daily rolling file and the returned guard must be kept alive
/// for buffered lines to be flushed.
pub fn init(config: &LoggingConfig) -> Option<WorkerGuard> {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.level));

    match &config.file_dir {
        Some(dir) => {
            let appender = tracing_appender::rolling::daily(dir, LOG_FILE_PREFIX);
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let builder = tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_writer(writer)
                .with_ansi(false);
            let installed = if config.json {
                builder.json().try_init()
            } else {
                builder.try_init()
            };
            installed.ok().map(|_| guard)
        }
        None => {
            let builder = tracing_subscriber::fmt().with_env_filter(filter);
            let _ = if config.json {
                builder.json().try_init()
            } else {
                builder.try_init()
            };
            None
        }
    }
}

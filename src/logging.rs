//! Tracing subscriber setup for the settlement binary

use crate::config::AppConfig;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

/// Install the global subscriber.
///
/// `RUST_LOG` overrides `log_level`. When `log_dir` is empty only stdout is
/// used and no guard is returned; otherwise the returned guard must outlive
/// the worker pool or buffered queue events are lost on exit.
pub fn init_logging(config: &AppConfig) -> Option<WorkerGuard> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.log_level.clone()));
    let registry = tracing_subscriber::registry().with(filter);

    // Worker tasks hop threads; thread names make claim traces readable.
    if config.log_dir.is_empty() {
        let stdout_layer = fmt::layer()
            .with_target(false)
            .with_thread_names(true)
            .with_ansi(true);
        registry.with(stdout_layer).init();
        return None;
    }

    let file_appender = match config.rotation.as_str() {
        "hourly" => tracing_appender::rolling::hourly(&config.log_dir, &config.log_file),
        "daily" => tracing_appender::rolling::daily(&config.log_dir, &config.log_file),
        _ => tracing_appender::rolling::never(&config.log_dir, &config.log_file),
    };
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

    if config.use_json {
        let file_layer = fmt::layer()
            .json()
            .with_target(true)
            .with_current_span(true)
            .with_writer(non_blocking)
            .with_ansi(false);
        let stdout_layer = fmt::layer()
            .with_target(false)
            .with_thread_names(true)
            .with_ansi(true);
        registry.with(file_layer).with(stdout_layer).init();
    } else {
        let file_layer = fmt::layer()
            .with_target(false)
            .with_thread_names(true)
            .with_writer(non_blocking)
            .with_ansi(false);
        let stdout_layer = fmt::layer()
            .with_target(false)
            .with_thread_names(true)
            .with_ansi(true);
        registry.with(file_layer).with(stdout_layer).init();
    }

    Some(guard)
}

#[cfg(test)]
mod tests {
    use super::*;

    // Installs the process-wide subscriber; keep it the only test that does
    #[test]
    fn test_stdout_only_logging_returns_no_guard() {
        let config = AppConfig {
            log_dir: String::new(),
            log_level: "debug".to_string(),
            ..AppConfig::default()
        };
        assert!(init_logging(&config).is_none());
        tracing::debug!(stage = "Pending", "Subscriber installed");
    }
}

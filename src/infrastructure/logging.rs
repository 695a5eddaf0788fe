use crate::domain::settings::LogSettings;
use std::str::FromStr;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling::Rotation;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

pub struct LoggingGuard {
    // Dropping the guard flushes and stops the file writer
    _guards: Vec<WorkerGuard>,
}

fn parse_rotation(name: &str) -> Rotation {
    match name.to_lowercase().as_str() {
        "hourly" => Rotation::HOURLY,
        "minutely" => Rotation::MINUTELY,
        "never" => Rotation::NEVER,
        _ => Rotation::DAILY,
    }
}

/// Install the global tracing subscriber described by `settings`.
///
/// `RUST_LOG` overrides `settings.level` when set. Fails if a global
/// subscriber has already been installed.
pub fn init_logger(settings: &LogSettings) -> anyhow::Result<LoggingGuard> {
    let (subscriber, guards) = build_subscriber(settings);
    subscriber.try_init()?;

    tracing::info!(
        "Logging initialized (level={}, file={})",
        settings.level,
        settings.file_logging_enabled
    );

    Ok(LoggingGuard { _guards: guards })
}

fn build_subscriber(
    settings: &LogSettings,
) -> (impl tracing::Subscriber + Send + Sync + 'static, Vec<WorkerGuard>) {
    let mut guards = Vec::new();

    let level_filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::from_str(&settings.level))
        .unwrap_or_else(|_| EnvFilter::new("info"));

    let console_layer = if settings.console_logging_enabled {
        Some(
            fmt::layer()
                .with_writer(std::io::stdout)
                .with_file(settings.show_file_line)
                .with_line_number(settings.show_file_line)
                .with_thread_ids(settings.show_thread_ids)
                .with_target(settings.show_target)
                .with_ansi(settings.ansi_colors),
        )
    } else {
        None
    };

    let file_layer = if settings.file_logging_enabled {
        let file_appender = tracing_appender::rolling::RollingFileAppender::new(
            parse_rotation(&settings.rotation),
            &settings.log_dir,
            &settings.file_name_prefix,
        );
        let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);
        guards.push(guard);
        Some(
            fmt::layer()
                .with_writer(non_blocking)
                .with_ansi(false)
                .with_file(settings.show_file_line)
                .with_line_number(settings.show_file_line)
                .with_thread_ids(settings.show_thread_ids)
                .with_target(settings.show_target),
        )
    } else {
        None
    };

    let subscriber = tracing_subscriber::registry()
        .with(level_filter)
        .with(console_layer)
        .with(file_layer);
    (subscriber, guards)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rotation_names() {
        assert_eq!(parse_rotation("HOURLY"), Rotation::HOURLY);
        assert_eq!(parse_rotation("minutely"), Rotation::MINUTELY);
        assert_eq!(parse_rotation("never"), Rotation::NEVER);
        assert_eq!(parse_rotation("weekly"), Rotation::DAILY);
    }

    #[test]
    fn file_layer_writes_into_log_dir() {
        let dir = tempfile::tempdir().unwrap();
        let settings = LogSettings {
            level: "debug".to_string(),
            file_logging_enabled: true,
            console_logging_enabled: false,
            log_dir: dir.path().to_string_lossy().into_owned(),
            rotation: "never".to_string(),
            ..LogSettings::default()
        };

        let (subscriber, guards) = build_subscriber(&settings);
        assert_eq!(guards.len(), 1);
        tracing::subscriber::with_default(subscriber, || {
            tracing::debug!("link to c0:ff:ee:00:00:01 released");
        });
        // flushes the non-blocking writer
        drop(guards);

        let written = std::fs::read_to_string(dir.path().join(&settings.file_name_prefix)).unwrap();
        assert!(written.contains("link to c0:ff:ee:00:00:01 released"));
    }

    #[test]
    fn console_only_needs_no_guard() {
        let (_subscriber, guards) = build_subscriber(&LogSettings::default());
        assert!(guards.is_empty());
    }
}

use crate::domain::settings::LogSettings;
use anyhow::Context;
use std::str::FromStr;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Keeps the file appender's worker alive; logs are flushed on drop.
pub struct LoggingGuard {
    _guards: Vec<WorkerGuard>,
}

/// `RUST_LOG` wins over the configured level; an unparsable level falls
/// back to `info`.
fn env_filter(level: &str) -> EnvFilter {
    EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::from_str(level))
        .unwrap_or_else(|_| EnvFilter::new("info"))
}

fn rotation(name: &str) -> Rotation {
    match name.to_lowercase().as_str() {
        "hourly" => Rotation::HOURLY,
        "minutely" => Rotation::MINUTELY,
        "never" => Rotation::NEVER,
        _ => Rotation::DAILY,
    }
}

pub fn init_logger(settings: &LogSettings) -> anyhow::Result<LoggingGuard> {
    let mut guards = Vec::new();

    // stderr, so command output on stdout stays clean
    let console_layer = settings.console.then(|| {
        fmt::layer()
            .with_writer(std::io::stderr)
            .with_file(settings.show_source)
            .with_line_number(settings.show_source)
            .with_target(settings.show_target)
            .with_ansi(settings.ansi_colors)
    });

    let file_layer = match &settings.file_dir {
        Some(dir) => {
            std::fs::create_dir_all(dir)
                .with_context(|| format!("creating log directory {}", dir.display()))?;
            let appender = RollingFileAppender::new(
                rotation(&settings.rotation),
                dir,
                &settings.file_name_prefix,
            );
            let (writer, guard) = tracing_appender::non_blocking(appender);
            guards.push(guard);
            Some(
                fmt::layer()
                    .with_writer(writer)
                    .with_ansi(false)
                    .with_file(settings.show_source)
                    .with_line_number(settings.show_source)
                    .with_target(settings.show_target),
            )
        }
        None => None,
    };

    tracing_subscriber::registry()
        .with(env_filter(&settings.level))
        .with(console_layer)
        .with(file_layer)
        .try_init()
        .context("installing the log subscriber")?;

    tracing::debug!(
        "Logging at {} (files: {})",
        settings.level,
        settings
            .file_dir
            .as_ref()
            .map_or_else(|| "off".to_string(), |d| d.display().to_string())
    );

    Ok(LoggingGuard { _guards: guards })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rotation_names() {
        assert_eq!(rotation("HOURLY"), Rotation::HOURLY);
        assert_eq!(rotation("never"), Rotation::NEVER);
        assert_eq!(rotation("weekly"), Rotation::DAILY);
    }
}

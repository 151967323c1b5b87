//! Tracing setup for the CLI and server.
//!
//! `RUST_LOG` wins over the configured level. Output goes to stderr in
//! compact or JSON form, and optionally to a daily-rolling file.

use std::io::IsTerminal;
use std::path::Path;

use anyhow::{Context, Result};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{
    EnvFilter, Layer, Registry, fmt, layer::SubscriberExt, util::SubscriberInitExt,
};

use crate::config::{LogFormat, LoggingSection};

const LOG_FILE_PREFIX: &str = "ontextract.log";

type BoxedLayer = Box<dyn Layer<Registry> + Send + Sync>;

/// Filter used when `RUST_LOG` is unset.
pub fn default_directive(level: &str, verbose: bool) -> String {
    if verbose {
        "ontextract=debug,info".to_string()
    } else {
        level.to_string()
    }
}

fn build_filter(level: &str, verbose: bool) -> Result<EnvFilter> {
    if let Ok(filter) = EnvFilter::try_from_default_env() {
        return Ok(filter);
    }
    let directive = default_directive(level, verbose);
    EnvFilter::try_new(&directive).with_context(|| format!("Invalid log filter '{}'", directive))
}

/// Install the global subscriber. Keep the returned guard alive for the
/// life of the process or buffered file output is lost.
pub fn init_logging(
    settings: &LoggingSection,
    log_dir: Option<&Path>,
    verbose: bool,
) -> Result<Option<WorkerGuard>> {
    let filter = build_filter(&settings.level, verbose)?;
    let mut layers: Vec<BoxedLayer> = Vec::new();

    let stderr = fmt::layer()
        .with_writer(std::io::stderr)
        .with_target(verbose);
    layers.push(match settings.format {
        LogFormat::Compact => stderr
            .with_ansi(std::io::stderr().is_terminal() && std::env::var_os("NO_COLOR").is_none())
            .compact()
            .boxed(),
        LogFormat::Json => stderr.json().boxed(),
    });

    let guard = match log_dir {
        Some(dir) => {
            std::fs::create_dir_all(dir)
                .with_context(|| format!("Failed to create log directory {}", dir.display()))?;
            let appender = tracing_appender::rolling::daily(dir, LOG_FILE_PREFIX);
            let (writer, guard) = tracing_appender::non_blocking(appender);
            layers.push(fmt::layer().with_writer(writer).with_ansi(false).json().boxed());
            Some(guard)
        }
        None => None,
    };

    tracing_subscriber::registry()
        .with(layers)
        .with(filter)
        .try_init()
        .context("Failed to install tracing subscriber")?;
    Ok(guard)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_directive() {
        assert_eq!(default_directive("warn", false), "warn");
        assert_eq!(default_directive("warn", true), "ontextract=debug,info");
    }

    #[test]
    fn test_invalid_level_is_an_error() {
        if std::env::var_os("RUST_LOG").is_some() {
            return;
        }
        assert!(build_filter("ontextract=loud", false).is_err());
        assert!(build_filter("ontextract=debug,info", false).is_ok());
    }
}

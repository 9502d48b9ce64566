use std::{io, path::Path};

use anyhow::Context;
use tracing_appender::non_blocking::{NonBlocking, WorkerGuard};
use tracing_subscriber::{EnvFilter, Layer, layer::SubscriberExt, util::SubscriberInitExt};

use crate::tunnelgate::config;

/// Keeps the background log writer alive; drop it last.
#[derive(Debug)]
pub struct LoggingRuntime {
    _guard: WorkerGuard,
}

pub fn init(logging: &config::LoggingConfig) -> anyhow::Result<LoggingRuntime> {
    let fmt = logging.format.trim().to_ascii_lowercase();

    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(filter_directive(&logging.level)))
        .context("logging: init filter")?;

    let (writer, guard) = make_writer(logging.output.trim())?;

    let base_fmt = tracing_subscriber::fmt::layer()
        .with_writer(writer)
        .with_ansi(fmt == "text" && logging.output.trim() == "stderr")
        .with_target(true)
        .with_file(logging.add_source)
        .with_line_number(logging.add_source);

    let base_fmt = if fmt == "json" {
        base_fmt.json().with_current_span(true).boxed()
    } else {
        base_fmt.boxed()
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(base_fmt)
        .try_init()
        .context("logging: install subscriber")?;

    Ok(LoggingRuntime { _guard: guard })
}

/// Our own level for the crate, dependencies held at `warn` unless more
/// verbose output was asked for.
fn filter_directive(level: &str) -> String {
    let level = match level.trim().to_ascii_lowercase().as_str() {
        "trace" => "trace",
        "debug" => "debug",
        "warn" => "warn",
        "error" => "error",
        _ => "info",
    };
    match level {
        "trace" | "debug" => level.to_string(),
        _ => format!("{level},hyper=warn,hyper_util=warn,reqwest=warn,tower_http=warn"),
    }
}

fn make_writer(output: &str) -> anyhow::Result<(NonBlocking, WorkerGuard)> {
    match output {
        "stderr" => Ok(tracing_appender::non_blocking(io::stderr())),
        "stdout" => Ok(tracing_appender::non_blocking(io::stdout())),
        "discard" => Ok(tracing_appender::non_blocking(io::sink())),
        other => {
            let p = Path::new(other);
            if let Some(parent) = p.parent() {
                if !parent.as_os_str().is_empty() {
                    std::fs::create_dir_all(parent)
                        .with_context(|| format!("logging: mkdir {}", parent.display()))?;
                }
            }
            let file = std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(p)
                .with_context(|| format!("logging: open {}", p.display()))?;
            Ok(tracing_appender::non_blocking(file))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn directive_quiets_dependencies() {
        assert_eq!(
            filter_directive("INFO"),
            "info,hyper=warn,hyper_util=warn,reqwest=warn,tower_http=warn"
        );
        assert_eq!(filter_directive("debug"), "debug");
        assert!(filter_directive("bogus").starts_with("info,"));
        assert!(EnvFilter::try_new(filter_directive("warn")).is_ok());
    }

    #[test]
    fn file_output_creates_parent_dirs() {
        let dir = std::env::temp_dir().join(format!("tunnelgate_log_test_{}", std::process::id()));
        let path = dir.join("logs").join("tunnelgate.log");
        let (_writer, _guard) = make_writer(path.to_str().expect("utf-8 path")).expect("writer");
        assert!(path.exists());
        let _ = std::fs::remove_dir_all(&dir);
    }
}

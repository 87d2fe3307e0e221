//! Logging initialisation shared by the two binaries.
//!
//! Diagnostics always go to a log file through a non-blocking appender;
//! passing `--verbose` mirrors them to stdout. The level is selected with
//! the `--log` name, defaulting to warnings only.

use anyhow::Result;
use std::path::Path;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{filter::LevelFilter, prelude::*, Layer};

/// Map the CLI level names onto tracing levels.
fn level_filter(name: Option<&str>) -> LevelFilter {
    match name.map(str::to_ascii_uppercase).as_deref() {
        Some("DEBUG") => LevelFilter::DEBUG,
        Some("INFO") => LevelFilter::INFO,
        Some("WARNING") => LevelFilter::WARN,
        Some("ERROR") | Some("CRITICAL") => LevelFilter::ERROR,
        _ => LevelFilter::WARN,
    }
}

/// Initialise the global subscriber.
///
/// The returned guard must stay alive for the duration of the program;
/// dropping it stops the background log writer.
pub fn init(level: Option<&str>, logfile: &Path, verbose: bool) -> Result<WorkerGuard> {
    let filter = level_filter(level);

    let log_dir = logfile.parent().filter(|p| !p.as_os_str().is_empty());
    let log_name = logfile
        .file_name()
        .unwrap_or_else(|| std::ffi::OsStr::new("netparity.log"));
    let appender = tracing_appender::rolling::never(
        log_dir.unwrap_or_else(|| Path::new(".")),
        log_name,
    );
    let (writer, guard) = tracing_appender::non_blocking(appender);
    let file_layer = tracing_subscriber::fmt::layer()
        .with_writer(writer)
        .with_ansi(false)
        .with_filter(filter)
        .boxed();

    let stdout_layer = verbose.then(|| {
        tracing_subscriber::fmt::layer()
            .with_writer(std::io::stdout)
            .with_filter(filter)
    });

    tracing_subscriber::registry()
        .with(file_layer)
        .with(stdout_layer)
        .init();

    Ok(guard)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn level_names_map_like_the_cli_documents() {
        assert_eq!(level_filter(Some("DEBUG")), LevelFilter::DEBUG);
        assert_eq!(level_filter(Some("info")), LevelFilter::INFO);
        assert_eq!(level_filter(Some("WARNING")), LevelFilter::WARN);
        assert_eq!(level_filter(Some("CRITICAL")), LevelFilter::ERROR);
        assert_eq!(level_filter(Some("bogus")), LevelFilter::WARN);
        assert_eq!(level_filter(None), LevelFilter::WARN);
    }
}

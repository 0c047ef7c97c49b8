//! Tracing subscriber setup for the binary: stderr or an appended log file,
//! filtered by `RUST_LOG` or the configured level.

use crate::Result;
use std::path::Path;
use tracing_subscriber::EnvFilter;

fn filter(verbose: bool, level: &str) -> EnvFilter {
    if verbose {
        EnvFilter::new("autostash=debug")
    } else {
        EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new(format!("autostash={}", level)))
    }
}

/// Log to stderr at `level` (`debug` when verbose)
pub fn init_logging(verbose: bool, level: &str) -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(filter(verbose, level))
        .with_target(false)
        .with_thread_ids(false)
        .with_file(true)
        .with_line_number(true)
        .with_writer(std::io::stderr)
        .init();

    Ok(())
}

/// Append logs to `log_file`
pub fn init_file_logging(log_file: &Path, verbose: bool, level: &str) -> Result<()> {
    use std::fs::OpenOptions;

    if let Some(parent) = log_file.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(log_file)?;

    tracing_subscriber::fmt()
        .with_env_filter(filter(verbose, level))
        .with_writer(std::sync::Mutex::new(file))
        .with_ansi(false)
        .init();

    Ok(())
}

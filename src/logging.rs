//! Tracing subscriber setup for the binary

use std::fs::{File, OpenOptions};
use std::path::Path;
use std::sync::Mutex;

use tracing_subscriber::EnvFilter;

use crate::config::LogConfig;
use crate::error::{Error, Result};

/// Install the global subscriber described by `config`
///
/// `RUST_LOG`, when set, wins over `config.level`. A non-empty `config.path`
/// sends output to that file (appended, no colours), otherwise to stderr.
pub fn init(config: &LogConfig) -> Result<()> {
    let rust_log = std::env::var(EnvFilter::DEFAULT_ENV).ok();
    let filter = build_filter(&config.level, rust_log.as_deref())?;
    let builder = tracing_subscriber::fmt().with_env_filter(filter);

    let installed = if config.path.is_empty() {
        builder.with_writer(std::io::stderr).try_init()
    } else {
        let file = open_log_file(&config.path)?;
        builder.with_ansi(false).with_writer(Mutex::new(file)).try_init()
    };

    installed.map_err(|e| Error::Logging(e.to_string()))
}

/// Filter from `RUST_LOG` if present and non-empty, otherwise from `level`
pub fn build_filter(level: &str, rust_log: Option<&str>) -> Result<EnvFilter> {
    let directives = rust_log.filter(|d| !d.trim().is_empty()).unwrap_or(level);
    EnvFilter::try_new(directives)
        .map_err(|e| Error::Logging(format!("invalid log filter {directives:?}: {e}")))
}

fn open_log_file(path: impl AsRef<Path>) -> Result<File> {
    let file = OpenOptions::new().create(true).append(true).open(path)?;
    Ok(file)
}

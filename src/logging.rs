//! Per-mode logging setup.
//!
//! The simulation mode logs JSON without timestamps; the correctness and
//! performance campaigns use a compact text format. Both write line-delimited
//! records to their mode's log file.

use std::fs::File;
use std::path::Path;
use std::sync::Arc;

use tracing_log::LogTracer;
use tracing_subscriber::filter::LevelFilter;

use crate::err::Result;

/// Log line format of a run mode.
#[derive(Copy, Clone, Debug)]
pub enum LogFormat {
    /// JSON records without timestamps.
    Json,
    /// Compact text without timestamps.
    Text,
}

/// Route `tracing` (and `log`) records to `path`, or to stderr when no path
/// is given. Safe to call once per process.
pub fn init_logging(format: LogFormat, path: Option<&Path>) -> Result<()> {
    let _ = LogTracer::init();

    let builder = tracing_subscriber::fmt()
        .with_max_level(LevelFilter::INFO)
        .with_ansi(false)
        .without_time();

    match path {
        Some(path) => {
            let file = Arc::new(File::create(path)?);
            match format {
                LogFormat::Json => {
                    let _ = builder.json().with_writer(file).try_init();
                }
                LogFormat::Text => {
                    let _ = builder.compact().with_writer(file).try_init();
                }
            }
        }
        None => {
            let _ = builder
                .compact()
                .with_writer(std::io::stderr)
                .try_init();
        }
    }
    Ok(())
}

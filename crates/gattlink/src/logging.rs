//! Logging backend setup
//!
//! The library only logs through the `log` facade. This installs
//! `env_logger` behind it, honouring `RUST_LOG` and defaulting to `info`.

use crate::error::{Error, Result};
use std::fs::OpenOptions;
use std::path::Path;

/// Install the logger, optionally writing into `log_file` (appending).
///
/// Returns `false` if a logger was already installed, in which case the
/// existing one is left alone.
pub fn init(log_file: Option<&Path>) -> Result<bool> {
    let mut builder =
        env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"));
    builder.format_timestamp_millis();

    if let Some(path) = log_file {
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .map_err(|e| {
                Error::Configuration(format!("cannot open log file {}: {}", path.display(), e))
            })?;
        builder.target(env_logger::Target::Pipe(Box::new(file)));
    }

    Ok(builder.try_init().is_ok())
}

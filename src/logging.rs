//! Tracing subscriber setup.
//!
//! Every run gets a console layer and, when a log directory is configured, a plain-text
//! `MainLog_<YYYY-mm-dd_HH-MM-SS>.log` file next to earlier runs. `RUST_LOG` overrides the
//! configured level.

use std::fs::{self, File};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::error::{StationError, StationResult};
use crate::TIMESTAMP_FORMAT;

/// File name of the run log for the given local timestamp.
pub fn run_log_name(timestamp: &chrono::DateTime<chrono::Local>) -> String {
    format!("MainLog_{}.log", timestamp.format(TIMESTAMP_FORMAT))
}

/// Install the global subscriber.
///
/// Returns the path of the run log file when `log_dir` is given.
pub fn init_logging(level: &str, log_dir: Option<&Path>) -> StationResult<Option<PathBuf>> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    let (file_layer, log_path) = match log_dir {
        Some(dir) => {
            fs::create_dir_all(dir)?;
            let path = dir.join(run_log_name(&chrono::Local::now()));
            let file = File::create(&path)?;
            let layer = fmt::layer()
                .with_ansi(false)
                .with_target(true)
                .with_writer(Mutex::new(file));
            (Some(layer), Some(path))
        }
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_target(false))
        .with(file_layer)
        .try_init()
        .map_err(|e| StationError::Logging(e.to_string()))?;

    if let Some(path) = &log_path {
        tracing::info!(log_file = %path.display(), "Run log opened");
    }
    Ok(log_path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_run_log_name() {
        let ts = chrono::Local
            .with_ymd_and_hms(2024, 3, 7, 9, 5, 1)
            .single()
            .unwrap();
        assert_eq!(run_log_name(&ts), "MainLog_2024-03-07_09-05-01.log");
    }
}

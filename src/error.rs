//! Custom error types for the station.
//!
//! This module defines the primary error type, `StationError`, for the whole crate.
//! Using the `thiserror` crate, it provides a single place where the failure modes of
//! a calibration run are named, from transport and configuration problems to limit
//! violations and lease contention.
//!
//! ## Error Hierarchy
//!
//! - **`Config`**: Wraps [`ConfigError`](crate::config::ConfigError), raised while loading
//!   or validating the station configuration.
//! - **`Io`**: Wraps `std::io::Error` for file system work (ledger, audit log, chart export).
//! - **`Transport`**: The instrument was unreachable, timed out, or answered with
//!   something that could not be decoded. A step that hits this fails, the run continues.
//! - **`LimitViolation`**: A measured value fell outside its configured window. The step
//!   fails and the run-wide fail flag is raised.
//! - **`Lease`**: The exclusive instrument lease could not be taken in time, or a
//!   non-reentrant lease was entered twice by the same holder.
//! - **`ChannelNotConfirmed`**: The optical switch never reported the requested channel.
//! - **`Spectral`**: A spectral algorithm was given unusable input.
//! - **`Aborted`**: A step stopped early because the run was aborted while it waited.
//! - **`FeatureNotEnabled`**: Functionality that was compiled out via feature flags.
//!
//! Ledger corruption has no variant here. A ledger that cannot be parsed is reinitialized
//! in place and never reported to callers.

use std::time::Duration;
use thiserror::Error;

use crate::adapters::TransportError;
use crate::config::ConfigError;
use crate::data::spectrum::SpectralError;
use crate::hardware::lease::LeaseError;
use crate::sequencer::SequencerError;

/// Convenience alias for results using the station error type.
pub type StationResult<T> = std::result::Result<T, StationError>;

/// Every failure a station operation can report.
#[derive(Error, Debug)]
pub enum StationError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("Instrument error: {0}")]
    Instrument(String),

    #[error("Fail Verify limit {name}: {low} <= {value} <= {high}")]
    LimitViolation {
        name: String,
        value: f64,
        low: f64,
        high: f64,
    },

    #[error(transparent)]
    Lease(#[from] LeaseError),

    #[error("Optical switch did not confirm channel {channel} within {timeout:?}")]
    ChannelNotConfirmed { channel: u16, timeout: Duration },

    #[error("Spectral analysis error: {0}")]
    Spectral(#[from] SpectralError),

    #[error(transparent)]
    Sequencer(#[from] SequencerError),

    #[error("Operator prompt failed: {0}")]
    Prompt(String),

    #[error("Aborted: {0}")]
    Aborted(String),

    #[error("Logging setup failed: {0}")]
    Logging(String),

    #[error("Feature '{0}' is not enabled. Please build with --features {0}")]
    FeatureNotEnabled(String),
}

impl StationError {
    /// True when the error came from a measured value leaving its limit window.
    pub fn is_limit_violation(&self) -> bool {
        matches!(self, StationError::LimitViolation { .. })
    }

    pub fn is_aborted(&self) -> bool {
        matches!(self, StationError::Aborted(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = StationError::Instrument("switch offline".to_string());
        assert_eq!(err.to_string(), "Instrument error: switch offline");
    }

    #[test]
    fn test_limit_violation_display() {
        let err = StationError::LimitViolation {
            name: "Path_Loss".into(),
            value: 7.5,
            low: 0.0,
            high: 6.0,
        };
        assert_eq!(err.to_string(), "Fail Verify limit Path_Loss: 0 <= 7.5 <= 6");
        assert!(err.is_limit_violation());
    }

    #[test]
    fn test_feature_not_enabled_display() {
        let err = StationError::FeatureNotEnabled("instrument_visa".into());
        assert!(err.to_string().contains("--features instrument_visa"));
        assert!(!err.is_limit_violation());
    }

    #[test]
    fn test_aborted_is_not_an_instrument_fault() {
        let err = StationError::Aborted("laser warm-up".into());
        assert_eq!(err.to_string(), "Aborted: laser warm-up");
        assert!(err.is_aborted());
        assert!(!StationError::Instrument("laser warm-up".into()).is_aborted());
    }
}

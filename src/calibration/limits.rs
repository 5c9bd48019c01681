//! Limit verification

use tracing::info;

use crate::config::LimitBand;
use crate::{StationError, StationResult};

/// Check `low <= value <= high`.
///
/// A NaN value never passes.
pub fn verify_window(name: &str, value: f64, low: f64, high: f64) -> StationResult<()> {
    if low <= value && value <= high {
        info!("Pass Verify limit {}: {} <= {} <= {}", name, low, value, high);
        Ok(())
    } else {
        Err(StationError::LimitViolation {
            name: name.to_string(),
            value,
            low,
            high,
        })
    }
}

/// Check `value` against a configured limit band.
pub fn verify_limit(value: f64, band: &LimitBand) -> StationResult<()> {
    verify_window(&band.limit_name, value, band.low, band.high)
}

/// Window of `reference ± tolerance_pct` percent, ordered so it also holds for
/// negative dBm references.
pub fn tolerance_window(reference: f64, tolerance_pct: f64) -> (f64, f64) {
    let a = reference * (100.0 + tolerance_pct) / 100.0;
    let b = reference * (100.0 - tolerance_pct) / 100.0;
    (a.min(b), a.max(b))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn band() -> LimitBand {
        LimitBand {
            limit_name: "Path_Loss".into(),
            high: 6.0,
            low: 0.0,
        }
    }

    #[test]
    fn test_bounds_are_inclusive() {
        assert!(verify_limit(0.0, &band()).is_ok());
        assert!(verify_limit(6.0, &band()).is_ok());
        assert!(verify_limit(3.2, &band()).is_ok());
    }

    #[test]
    fn test_violation_message() {
        let err = verify_limit(6.5, &band()).unwrap_err();
        assert!(err.is_limit_violation());
        assert_eq!(err.to_string(), "Fail Verify limit Path_Loss: 0 <= 6.5 <= 6");
    }

    #[test]
    fn test_nan_fails() {
        assert!(verify_limit(f64::NAN, &band()).is_err());
    }

    #[test]
    fn test_tolerance_window_negative_reference() {
        let (low, high) = tolerance_window(-2.0, 1.0);
        assert!((low - -2.02).abs() < 1e-12);
        assert!((high - -1.98).abs() < 1e-12);
        assert!(verify_window("Calibration reference power", -2.01, low, high).is_ok());

        let (low, high) = tolerance_window(3.0, 1.0);
        assert!((low - 2.97).abs() < 1e-12);
        assert!((high - 3.03).abs() < 1e-12);
    }
}

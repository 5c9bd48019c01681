//! Run context
//!
//! Everything a calibration run knows: who runs it, on which station, the limits in
//! force, and every reading taken so far. Only the sequencer's worker mutates it, one
//! step at a time.

use chrono::{DateTime, Local};
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};
use std::path::PathBuf;

use crate::config::LimitsConfig;
use crate::data::ledger::{BayRecord, CalibrationRecord};
use crate::data::spectrum::SpectrumSummary;
use crate::sequencer::FailFlag;
use crate::{StationError, StationResult, TIMESTAMP_FORMAT};

/// Raw and derived readings of one bay
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct BayReadings {
    /// Wavelength-meter power through the bay, dBm, as read by the wavelength meter
    pub wlm_raw_dbm: Option<f64>,
    /// Power-meter power through the bay, dBm
    pub opm_raw_dbm: Option<f64>,
    /// `|CRP - WLM raw|`, dB
    pub wlm_db: f64,
    /// Path loss reported for the power meter, dB
    pub opm_db: f64,
    /// Total path loss `|CRP - OPM raw|`, dB
    pub tpl_db: f64,
    pub path_cord_change: bool,
    pub spectrum: Option<SpectrumSummary>,
}

impl BayReadings {
    pub fn record(&self) -> BayRecord {
        BayRecord {
            wlm_db: self.wlm_db,
            opm_db: self.opm_db,
            tpl_db: self.tpl_db,
            path_cord_change: self.path_cord_change,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct RunContext {
    pub operator_id: String,
    pub station_id: String,
    /// Run timestamp in [`TIMESTAMP_FORMAT`]
    pub datetime: String,
    pub limits: LimitsConfig,
    /// Bay the run is working on
    pub current_bay: Option<u16>,
    /// Calibration reference power, dBm
    pub crp_dbm: Option<f64>,
    /// Reference power re-read at the end of the run, dBm
    pub crp_end_dbm: Option<f64>,
    /// Last wavelength-meter frequency, THz
    pub wlm_freq_thz: f64,
    /// Last wavelength-meter SMSR, dB
    pub wlm_smsr_db: f64,
    bays: BTreeMap<u16, BayReadings>,
    fail: bool,
    /// Row written to the ledger, once appended
    pub ledger_record: Option<CalibrationRecord>,
    /// Control chart written after a passing run
    pub chart_path: Option<PathBuf>,
}

impl RunContext {
    /// Fresh context with one neutral slot per available bay.
    pub fn new(
        operator_id: impl Into<String>,
        station_id: impl Into<String>,
        started: DateTime<Local>,
        limits: LimitsConfig,
        available_bays: &[u16],
        path_cord_changes: &BTreeSet<u16>,
    ) -> Self {
        let bays = available_bays
            .iter()
            .map(|&bay| {
                (
                    bay,
                    BayReadings {
                        path_cord_change: path_cord_changes.contains(&bay),
                        ..BayReadings::default()
                    },
                )
            })
            .collect();
        Self {
            operator_id: operator_id.into(),
            station_id: station_id.into(),
            datetime: started.format(TIMESTAMP_FORMAT).to_string(),
            limits,
            current_bay: None,
            crp_dbm: None,
            crp_end_dbm: None,
            wlm_freq_thz: 0.0,
            wlm_smsr_db: 0.0,
            bays,
            fail: false,
            ledger_record: None,
            chart_path: None,
        }
    }

    pub fn available_bays(&self) -> Vec<u16> {
        self.bays.keys().copied().collect()
    }

    pub fn bay(&self, bay: u16) -> Option<&BayReadings> {
        self.bays.get(&bay)
    }

    pub fn bay_mut(&mut self, bay: u16) -> StationResult<&mut BayReadings> {
        self.bays
            .get_mut(&bay)
            .ok_or_else(|| StationError::Instrument(format!("Bay {} is not available", bay)))
    }

    /// The reference power, or an error when it has not been read in this run.
    pub fn crp(&self) -> StationResult<f64> {
        self.crp_dbm.ok_or_else(|| {
            StationError::Instrument("Calibration reference power has not been read".to_string())
        })
    }

    /// Ledger row for this run. The iteration is assigned by the ledger.
    pub fn to_record(&self) -> CalibrationRecord {
        CalibrationRecord {
            iteration: 0,
            station_id: self.station_id.clone(),
            operator_id: self.operator_id.clone(),
            datetime: self.datetime.clone(),
            crp_db: self.crp_dbm.unwrap_or(0.0),
            wlm_freq_thz: self.wlm_freq_thz,
            wlm_smsr_db: self.wlm_smsr_db,
            bays: self
                .bays
                .iter()
                .map(|(&bay, readings)| (bay, readings.record()))
                .collect(),
        }
    }
}

impl FailFlag for RunContext {
    fn fail(&self) -> bool {
        self.fail
    }

    fn set_fail(&mut self) {
        self.fail = true;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn context() -> RunContext {
        let started = Local.with_ymd_and_hms(2026, 3, 2, 10, 15, 0).unwrap();
        RunContext::new(
            "OP1",
            "CAL-01",
            started,
            LimitsConfig::default(),
            &[1, 3],
            &BTreeSet::from([3]),
        )
    }

    #[test]
    fn test_bays_seeded_neutral() {
        let ctx = context();
        assert_eq!(ctx.available_bays(), vec![1, 3]);
        assert_eq!(ctx.bay(1).unwrap().tpl_db, 0.0);
        assert!(!ctx.bay(1).unwrap().path_cord_change);
        assert!(ctx.bay(3).unwrap().path_cord_change);
        assert!(ctx.bay(2).is_none());
        assert_eq!(ctx.datetime, "2026-03-02_10-15-00");
    }

    #[test]
    fn test_fail_flag_is_sticky() {
        let mut ctx = context();
        assert!(!ctx.fail());
        ctx.set_fail();
        ctx.set_fail();
        assert!(ctx.fail());
    }

    #[test]
    fn test_record_from_context() {
        let mut ctx = context();
        ctx.crp_dbm = Some(3.0);
        ctx.bay_mut(3).unwrap().tpl_db = 2.5;
        let record = ctx.to_record();
        assert_eq!(record.crp_db, 3.0);
        assert_eq!(record.bay(3).tpl_db, 2.5);
        assert!(record.bay(3).path_cord_change);
        assert_eq!(record.bay(2), BayRecord::default());
    }

    #[test]
    fn test_crp_required() {
        let ctx = context();
        assert!(ctx.crp().is_err());
        assert!(ctx.clone().bay_mut(9).is_err());
    }
}

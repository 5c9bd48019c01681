//! Control-chart export.
//!
//! After a passing run the power-meter path loss of every bay across all ledger
//! iterations is written to `<chart_dir>/<Datetime>.csv`, one row per iteration and
//! one column per bay, for trending outside the station.
use std::path::{Path, PathBuf};

use crate::data::ledger::CalibrationRecord;
use crate::StationResult;

/// Column header for the OPM path loss of `bay`.
pub fn chart_column(bay: u16) -> String {
    format!("OPM_Bay{:02}(dB)", bay)
}

// ============================================================================
// CSV Export
// ============================================================================

#[cfg(feature = "storage_csv")]
mod csv_enabled {
    use super::*;
    use std::fs;
    use tracing::info;

    pub struct ControlChartExporter {
        dir: PathBuf,
    }

    impl ControlChartExporter {
        pub fn new(dir: impl AsRef<Path>) -> Self {
            Self {
                dir: dir.as_ref().to_path_buf(),
            }
        }

        /// Write the chart for `bays` and return the file path.
        pub fn export(
            &self,
            records: &[CalibrationRecord],
            bays: &[u16],
            datetime: &str,
        ) -> StationResult<PathBuf> {
            fs::create_dir_all(&self.dir)?;
            let path = self.dir.join(format!("{}.csv", datetime));
            let mut writer = csv::Writer::from_path(&path).map_err(std::io::Error::from)?;

            let header: Vec<String> = ["Iteration", "Datetime"]
                .iter()
                .map(|s| s.to_string())
                .chain(bays.iter().map(|&bay| chart_column(bay)))
                .collect();
            writer.write_record(&header).map_err(std::io::Error::from)?;

            for record in records {
                let row: Vec<String> = [record.iteration.to_string(), record.datetime.clone()]
                    .into_iter()
                    .chain(bays.iter().map(|&bay| record.bay(bay).opm_db.to_string()))
                    .collect();
                writer.write_record(&row).map_err(std::io::Error::from)?;
            }
            writer.flush()?;

            info!(path = %path.display(), rows = records.len(), "Control chart exported");
            Ok(path)
        }
    }
}

#[cfg(not(feature = "storage_csv"))]
mod csv_disabled {
    use super::*;
    use crate::StationError;

    pub struct ControlChartExporter;

    impl ControlChartExporter {
        pub fn new(_dir: impl AsRef<Path>) -> Self {
            Self
        }

        pub fn export(
            &self,
            _records: &[CalibrationRecord],
            _bays: &[u16],
            _datetime: &str,
        ) -> StationResult<PathBuf> {
            Err(StationError::FeatureNotEnabled("storage_csv".to_string()))
        }
    }
}

#[cfg(feature = "storage_csv")]
pub use csv_enabled::ControlChartExporter;

#[cfg(not(feature = "storage_csv"))]
pub use csv_disabled::ControlChartExporter;

#[cfg(all(test, feature = "storage_csv"))]
mod tests {
    use super::*;
    use crate::data::ledger::BayRecord;
    use std::collections::BTreeMap;

    #[test]
    fn test_export_rows_per_iteration() {
        let dir = tempfile::TempDir::new().unwrap();
        let records: Vec<CalibrationRecord> = (1..=3)
            .map(|i| {
                let mut bays = BTreeMap::new();
                bays.insert(
                    5,
                    BayRecord {
                        opm_db: 2.0 + i as f64,
                        ..BayRecord::default()
                    },
                );
                CalibrationRecord {
                    iteration: i,
                    datetime: format!("2026-01-0{}_08-00-00", i),
                    bays,
                    ..CalibrationRecord::default()
                }
            })
            .collect();

        let exporter = ControlChartExporter::new(dir.path().join("charts"));
        let path = exporter
            .export(&records, &[1, 5], "2026-01-03_08-00-00")
            .unwrap();
        assert_eq!(path.file_name().unwrap(), "2026-01-03_08-00-00.csv");

        let text = std::fs::read_to_string(path).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines[0], "Iteration,Datetime,OPM_Bay01(dB),OPM_Bay05(dB)");
        assert_eq!(lines[3], "3,2026-01-03_08-00-00,0,5");
        assert_eq!(lines.len(), 4);
    }
}

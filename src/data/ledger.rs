//! Fixed-width calibration ledger.
//!
//! One header row followed by one row per completed calibration run. Columns:
//!
//! ```text
//! Iteration(#) Station_ID(#) Operator_ID(#) Datetime(#) CRP(dB) WLM_freq(THz) WLM_SMSR
//! WLM_Bay01(dB) OPM_Bay01(dB) TPL_Bay01(dB) Path_Cord_Change_Bay01(bool) ... BayNN
//! ```
//!
//! Cells are right-aligned to the widest entry in their column and separated by a single
//! space, so the file stays readable and diffable by hand. Every append rewrites the whole
//! file through a temporary file in the same directory that is then renamed over the
//! ledger.
//!
//! A ledger that is missing or does not parse is treated as empty. The next append
//! replaces it with a fresh header and the new row; callers never see the corruption.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

use crate::StationResult;

/// Leading columns, in file order
pub const FIXED_COLUMNS: [&str; 7] = [
    "Iteration(#)",
    "Station_ID(#)",
    "Operator_ID(#)",
    "Datetime(#)",
    "CRP(dB)",
    "WLM_freq(THz)",
    "WLM_SMSR",
];

/// Per-bay column names for `bay`, in file order.
pub fn bay_columns(bay: u16) -> [String; 4] {
    [
        format!("WLM_Bay{:02}(dB)", bay),
        format!("OPM_Bay{:02}(dB)", bay),
        format!("TPL_Bay{:02}(dB)", bay),
        format!("Path_Cord_Change_Bay{:02}(bool)", bay),
    ]
}

/// Full header for a ledger covering bays `1..=bays`.
pub fn ledger_columns(bays: u16) -> Vec<String> {
    FIXED_COLUMNS
        .iter()
        .map(|c| c.to_string())
        .chain((1..=bays).flat_map(bay_columns))
        .collect()
}

/// Readings of one bay in a calibration row
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct BayRecord {
    /// `|CRP - WLM power|`, dB
    pub wlm_db: f64,
    /// Path loss as measured by the power meter, dB
    pub opm_db: f64,
    /// Total path loss, dB
    pub tpl_db: f64,
    pub path_cord_change: bool,
}

/// One row of the ledger
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CalibrationRecord {
    /// Assigned by [`CalibrationLedger::append`]; any value set by the caller is replaced.
    pub iteration: u64,
    pub station_id: String,
    pub operator_id: String,
    /// Run timestamp formatted with [`TIMESTAMP_FORMAT`](crate::TIMESTAMP_FORMAT)
    pub datetime: String,
    pub crp_db: f64,
    pub wlm_freq_thz: f64,
    pub wlm_smsr_db: f64,
    /// Bays without an entry are written as zero readings and `False`.
    pub bays: BTreeMap<u16, BayRecord>,
}

impl CalibrationRecord {
    /// Readings for `bay`, or the neutral default when the bay was not measured.
    pub fn bay(&self, bay: u16) -> BayRecord {
        self.bays.get(&bay).copied().unwrap_or_default()
    }

    fn cells(&self, bays: u16) -> Vec<String> {
        let mut cells = vec![
            self.iteration.to_string(),
            text_cell(&self.station_id),
            text_cell(&self.operator_id),
            text_cell(&self.datetime),
            self.crp_db.to_string(),
            self.wlm_freq_thz.to_string(),
            self.wlm_smsr_db.to_string(),
        ];
        for bay in 1..=bays {
            let reading = self.bay(bay);
            cells.push(reading.wlm_db.to_string());
            cells.push(reading.opm_db.to_string());
            cells.push(reading.tpl_db.to_string());
            cells.push(bool_cell(reading.path_cord_change).to_string());
        }
        cells
    }
}

/// Text cells cannot contain whitespace (it separates columns) and cannot be empty.
fn text_cell(value: &str) -> String {
    let cleaned: String = value
        .trim()
        .chars()
        .map(|c| if c.is_whitespace() { '_' } else { c })
        .collect();
    if cleaned.is_empty() {
        "0".to_string()
    } else {
        cleaned
    }
}

fn bool_cell(value: bool) -> &'static str {
    if value {
        "True"
    } else {
        "False"
    }
}

fn parse_bool(cell: &str) -> Option<bool> {
    match cell {
        "True" | "true" | "1" => Some(true),
        "False" | "false" | "0" => Some(false),
        _ => None,
    }
}

/// Why an existing ledger was discarded; only ever logged.
#[derive(Debug)]
enum Corruption {
    Missing,
    Unreadable(std::io::Error),
    Malformed(String),
}

impl std::fmt::Display for Corruption {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Corruption::Missing => write!(f, "ledger file does not exist"),
            Corruption::Unreadable(e) => write!(f, "ledger file unreadable: {}", e),
            Corruption::Malformed(detail) => write!(f, "ledger malformed: {}", detail),
        }
    }
}

/// Append-only calibration ledger backed by a fixed-width text file
#[derive(Debug, Clone)]
pub struct CalibrationLedger {
    path: PathBuf,
    bays: u16,
}

impl CalibrationLedger {
    /// Ledger at `path` with per-bay columns for bays `1..=bays`.
    pub fn new(path: impl Into<PathBuf>, bays: u16) -> Self {
        Self {
            path: path.into(),
            bays,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn bays(&self) -> u16 {
        self.bays
    }

    /// All rows currently in the ledger; empty when the file is missing or unparseable.
    pub fn read(&self) -> Vec<CalibrationRecord> {
        match self.load() {
            Ok(records) => records,
            Err(reason) => {
                debug!(path = %self.path.display(), %reason, "Treating ledger as empty");
                Vec::new()
            }
        }
    }

    /// Iteration number the next append will receive.
    pub fn next_iteration(&self) -> u64 {
        next_iteration(&self.read())
    }

    /// Append `record`, assigning it the next iteration number.
    ///
    /// Returns the record as written. The whole ledger (existing rows plus the new one)
    /// is rewritten atomically, keeping every bay column already in the file even when
    /// it lies beyond the configured bay count.
    pub fn append(&self, mut record: CalibrationRecord) -> StationResult<CalibrationRecord> {
        let mut records = match self.load() {
            Ok(records) => records,
            Err(Corruption::Missing) => {
                info!(path = %self.path.display(), "Creating calibration ledger");
                Vec::new()
            }
            Err(reason) => {
                warn!(path = %self.path.display(), %reason, "Reinitializing calibration ledger");
                Vec::new()
            }
        };

        record.iteration = next_iteration(&records);
        records.push(record.clone());
        self.write_all(&records)?;

        info!(
            path = %self.path.display(),
            iteration = record.iteration,
            "Calibration record appended"
        );
        Ok(record)
    }

    fn load(&self) -> Result<Vec<CalibrationRecord>, Corruption> {
        let text = match fs::read_to_string(&self.path) {
            Ok(text) => text,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Err(Corruption::Missing),
            Err(e) => return Err(Corruption::Unreadable(e)),
        };
        parse_ledger(&text).map_err(Corruption::Malformed)
    }

    fn write_all(&self, records: &[CalibrationRecord]) -> StationResult<()> {
        let dir = match self.path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
            _ => PathBuf::from("."),
        };
        fs::create_dir_all(&dir)?;

        let bays = records
            .iter()
            .filter_map(|r| r.bays.keys().next_back().copied())
            .fold(self.bays, u16::max);
        if bays > self.bays {
            debug!(configured = self.bays, kept = bays, "Ledger carries more bay columns than configured");
        }
        let body = render_ledger(records, bays);
        let mut file = tempfile::NamedTempFile::new_in(&dir)?;
        file.write_all(body.as_bytes())?;
        file.as_file().sync_all()?;
        file.persist(&self.path).map_err(|e| e.error)?;
        Ok(())
    }
}

fn next_iteration(records: &[CalibrationRecord]) -> u64 {
    records.iter().map(|r| r.iteration).max().unwrap_or(0) + 1
}

/// Render header and rows as right-aligned fixed-width text.
fn render_ledger(records: &[CalibrationRecord], bays: u16) -> String {
    let header = ledger_columns(bays);
    let rows: Vec<Vec<String>> = records.iter().map(|r| r.cells(bays)).collect();

    let widths: Vec<usize> = header
        .iter()
        .enumerate()
        .map(|(i, h)| {
            rows.iter()
                .map(|row| row[i].len())
                .chain(std::iter::once(h.len()))
                .max()
                .unwrap_or(0)
        })
        .collect();

    let mut out = String::new();
    for line in std::iter::once(&header).chain(rows.iter()) {
        let cells: Vec<String> = line
            .iter()
            .zip(&widths)
            .map(|(cell, &width)| format!("{:>width$}", cell, width = width))
            .collect();
        out.push_str(&cells.join(" "));
        out.push('\n');
    }
    out
}

fn parse_ledger(text: &str) -> Result<Vec<CalibrationRecord>, String> {
    let mut lines = text.lines().filter(|l| !l.trim().is_empty());
    let header: Vec<&str> = lines
        .next()
        .ok_or_else(|| "no header row".to_string())?
        .split_whitespace()
        .collect();
    for (expected, found) in FIXED_COLUMNS.iter().zip(&header) {
        if expected != found {
            return Err(format!("expected column '{}', found '{}'", expected, found));
        }
    }
    if header.len() < FIXED_COLUMNS.len() {
        return Err(format!("header has only {} columns", header.len()));
    }
    let index: HashMap<&str, usize> = header.iter().enumerate().map(|(i, h)| (*h, i)).collect();

    let mut records = Vec::new();
    for (line_no, line) in lines.enumerate() {
        let cells: Vec<&str> = line.split_whitespace().collect();
        if cells.len() != header.len() {
            return Err(format!(
                "row {} has {} cells, header has {}",
                line_no + 1,
                cells.len(),
                header.len()
            ));
        }
        records.push(parse_row(&cells, &index).map_err(|e| format!("row {}: {}", line_no + 1, e))?);
    }
    Ok(records)
}

fn parse_row(cells: &[&str], index: &HashMap<&str, usize>) -> Result<CalibrationRecord, String> {
    let float = |column: &str| -> Result<f64, String> {
        let cell = cells[index[column]];
        cell.parse::<f64>()
            .map_err(|_| format!("{} '{}' is not a number", column, cell))
    };

    let iteration_cell = cells[0];
    let mut record = CalibrationRecord {
        iteration: iteration_cell
            .parse()
            .map_err(|_| format!("iteration '{}' is not an integer", iteration_cell))?,
        station_id: cells[1].to_string(),
        operator_id: cells[2].to_string(),
        datetime: cells[3].to_string(),
        crp_db: float("CRP(dB)")?,
        wlm_freq_thz: float("WLM_freq(THz)")?,
        wlm_smsr_db: float("WLM_SMSR")?,
        bays: BTreeMap::new(),
    };

    for (&column, &i) in index {
        let Some(bay) = column
            .strip_prefix("OPM_Bay")
            .and_then(|rest| rest.strip_suffix("(dB)"))
            .and_then(|n| n.parse::<u16>().ok())
        else {
            continue;
        };
        let [wlm, opm, tpl, cord] = bay_columns(bay);
        let lookup = |name: &str| index.get(name).map(|&j| cells[j]);
        let cord_cell = lookup(&cord).unwrap_or("False");
        record.bays.insert(
            bay,
            BayRecord {
                wlm_db: lookup(&wlm).map_or(Ok(0.0), |_| float(&wlm))?,
                opm_db: cells[i]
                    .parse()
                    .map_err(|_| format!("{} '{}' is not a number", opm, cells[i]))?,
                tpl_db: lookup(&tpl).map_or(Ok(0.0), |_| float(&tpl))?,
                path_cord_change: parse_bool(cord_cell)
                    .ok_or_else(|| format!("{} '{}' is not a boolean", cord, cord_cell))?,
            },
        );
    }
    Ok(record)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn record(operator: &str) -> CalibrationRecord {
        let mut bays = BTreeMap::new();
        bays.insert(
            2,
            BayRecord {
                wlm_db: 1.25,
                opm_db: 3.5,
                tpl_db: 3.5,
                path_cord_change: true,
            },
        );
        CalibrationRecord {
            iteration: 99,
            station_id: "CAL-ST-01".into(),
            operator_id: operator.into(),
            datetime: "2026-03-02_10-15-00".into(),
            crp_db: 3.1,
            wlm_freq_thz: 193.414,
            wlm_smsr_db: f64::NAN,
            bays,
        }
    }

    #[test]
    fn test_columns() {
        let columns = ledger_columns(70);
        assert_eq!(columns.len(), 7 + 70 * 4);
        assert_eq!(columns[7], "WLM_Bay01(dB)");
        assert_eq!(columns[10], "Path_Cord_Change_Bay01(bool)");
        assert_eq!(columns.last().unwrap(), "Path_Cord_Change_Bay70(bool)");
    }

    #[test]
    fn test_first_append_on_missing_file() {
        let dir = TempDir::new().unwrap();
        let ledger = CalibrationLedger::new(dir.path().join("data/ledger.txt"), 4);
        assert_eq!(ledger.next_iteration(), 1);

        let written = ledger.append(record("op1")).unwrap();
        assert_eq!(written.iteration, 1);
        assert!(ledger.path().exists());
    }

    #[test]
    fn test_successive_appends_increment() {
        let dir = TempDir::new().unwrap();
        let ledger = CalibrationLedger::new(dir.path().join("ledger.txt"), 4);

        let iterations: Vec<u64> = ["a", "b with space", ""]
            .iter()
            .map(|op| ledger.append(record(op)).unwrap().iteration)
            .collect();
        assert_eq!(iterations, vec![1, 2, 3]);

        let rows = ledger.read();
        assert_eq!(rows.len(), 3);
        assert_eq!(rows[1].operator_id, "b_with_space");
        assert_eq!(rows[2].operator_id, "0");
    }

    #[test]
    fn test_corrupt_file_is_reinitialized() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("ledger.txt");
        fs::write(&path, "this is not\na ledger at all\n").unwrap();
        let ledger = CalibrationLedger::new(&path, 2);

        assert!(ledger.read().is_empty());
        assert_eq!(ledger.append(record("op")).unwrap().iteration, 1);

        let text = fs::read_to_string(&path).unwrap();
        assert!(text.starts_with(&format!("{:>12}", "Iteration(#)")));
        assert_eq!(text.lines().count(), 2);
    }

    #[test]
    fn test_iteration_uses_max_not_last_row() {
        let dir = TempDir::new().unwrap();
        let ledger = CalibrationLedger::new(dir.path().join("ledger.txt"), 1);
        let mut rows = vec![record("a"), record("b")];
        rows[0].iteration = 7;
        rows[1].iteration = 3;
        fs::write(ledger.path(), render_ledger(&rows, 1)).unwrap();

        assert_eq!(ledger.append(record("c")).unwrap().iteration, 8);
    }

    #[test]
    fn test_absent_bays_written_as_defaults() {
        let dir = TempDir::new().unwrap();
        let ledger = CalibrationLedger::new(dir.path().join("ledger.txt"), 3);
        ledger.append(record("op")).unwrap();

        let row = &ledger.read()[0];
        assert_eq!(row.bay(1), BayRecord::default());
        assert_eq!(row.bay(2).opm_db, 3.5);
        assert!(row.bay(2).path_cord_change);
        assert!(!row.bay(3).path_cord_change);
        assert!(row.wlm_smsr_db.is_nan());
    }

    #[test]
    fn test_rows_are_fixed_width() {
        let dir = TempDir::new().unwrap();
        let ledger = CalibrationLedger::new(dir.path().join("ledger.txt"), 2);
        ledger.append(record("short")).unwrap();
        ledger.append(record("a-much-longer-operator")).unwrap();

        let text = fs::read_to_string(ledger.path()).unwrap();
        let widths: Vec<usize> = text.lines().map(str::len).collect();
        assert!(widths.windows(2).all(|w| w[0] == w[1]));
    }

    #[test]
    fn test_narrower_ledger_keeps_wider_history() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("ledger.txt");
        let mut wide = record("wide");
        wide.bays.insert(
            7,
            BayRecord {
                wlm_db: 4.5,
                opm_db: 4.25,
                tpl_db: 4.25,
                path_cord_change: false,
            },
        );
        CalibrationLedger::new(&path, 8).append(wide).unwrap();

        let narrow = CalibrationLedger::new(&path, 4);
        narrow.append(record("narrow")).unwrap();

        let rows = narrow.read();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].bay(7).opm_db, 4.25);
        assert_eq!(rows[0].bay(7).wlm_db, 4.5);
        assert_eq!(rows[1].bay(7), BayRecord::default());
        let header = fs::read_to_string(&path).unwrap();
        assert!(header.lines().next().unwrap().ends_with("Path_Cord_Change_Bay08(bool)"));
    }

    #[test]
    fn test_ragged_row_is_corruption() {
        let header = ledger_columns(1).join(" ");
        assert!(parse_ledger(&format!("{}\n1 2 3\n", header)).is_err());
        assert!(parse_ledger("").is_err());
    }
}

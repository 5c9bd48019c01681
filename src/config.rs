//! Station configuration using Figment
//!
//! Configuration is loaded from:
//! 1. a TOML file (default `config/station.toml`, missing file means all defaults)
//! 2. Environment variables prefixed with `PATHLOSS_`
//!
//! # Environment Variable Overrides
//!
//! Nested keys are separated by a double underscore so that snake_case field names
//! survive the split:
//!
//! ```text
//! PATHLOSS_STATION__STATION_ID=CAL-07
//! PATHLOSS_LEASE__TIMEOUT_MS=120000
//! PATHLOSS_LIMITS__PATH_LOSS__HIGH=4.5
//! ```
//!
//! # Example
//!
//! ```no_run
//! use pathloss_station::config::StationConfig;
//!
//! let config = StationConfig::load_from("config/station.toml")?;
//! println!("Station: {}", config.station.station_id);
//! println!("Bays: {:?}", config.bays.available);
//! # Ok::<(), pathloss_station::config::ConfigError>(())
//! ```

use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

/// Default configuration file, relative to the working directory.
pub const DEFAULT_CONFIG_PATH: &str = "config/station.toml";

/// Configuration error types
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Configuration load error: {0}")]
    LoadError(#[from] figment::Error),
    #[error("Configuration validation error: {0}")]
    ValidationError(String),
}

/// Top-level station configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StationConfig {
    /// Station identity and file locations
    #[serde(default)]
    pub station: StationSettings,
    /// Bay map
    #[serde(default)]
    pub bays: BayConfig,
    /// Exclusive instrument lease
    #[serde(default)]
    pub lease: LeaseConfig,
    /// Instrument address and driver blocks
    #[serde(default)]
    pub instruments: InstrumentsConfig,
    /// Pass/fail limits
    #[serde(default)]
    pub limits: LimitsConfig,
    /// Calibration procedure timing and tolerances
    #[serde(default)]
    pub sequence: SequenceConfig,
    /// Spectral analysis parameters
    #[serde(default)]
    pub spectrum: SpectrumConfig,
}

/// Station identity and file locations
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StationSettings {
    /// Station identifier written to every ledger row
    #[serde(default = "default_station_id")]
    pub station_id: String,
    /// Logging level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// Directory receiving the per-run `MainLog_*.log` files
    #[serde(default = "default_log_dir")]
    pub log_dir: PathBuf,
    /// Directory holding the lease lock files
    #[serde(default = "default_lock_dir")]
    pub lock_dir: PathBuf,
    /// Append-only lease audit log
    #[serde(default = "default_lock_log")]
    pub lock_log: PathBuf,
    /// Fixed-width calibration ledger
    #[serde(default = "default_ledger_path")]
    pub ledger_path: PathBuf,
    /// Directory receiving control-chart exports
    #[serde(default = "default_chart_dir")]
    pub chart_dir: PathBuf,
}

/// Bay availability
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BayConfig {
    /// Bays that are populated and calibrated on this station
    #[serde(default)]
    pub available: Vec<u16>,
    /// Number of bays carried by the ledger columns
    #[serde(default = "default_ledger_bays")]
    pub ledger_bays: u16,
}

/// Exclusive instrument lease settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LeaseConfig {
    /// Lease name; the lock file is `<lock_dir>/<name>.lock`
    #[serde(default = "default_lease_name")]
    pub name: String,
    /// Maximum time to wait for the lease in milliseconds
    #[serde(default = "default_lease_timeout")]
    pub timeout_ms: u64,
    /// Interval between acquisition attempts in milliseconds
    #[serde(default = "default_lease_poll")]
    pub poll_interval_ms: u64,
    /// Whether the same holder may enter the lease more than once
    #[serde(default)]
    pub reentrant: bool,
}

/// Instrument blocks, one per role
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstrumentsConfig {
    /// Wavelength meter
    #[serde(default = "default_wlm")]
    pub wlm: InstrumentDefinition,
    /// Optical power meter
    #[serde(default = "default_opm")]
    pub opm: InstrumentDefinition,
    /// Optical switch
    #[serde(default = "default_osw")]
    pub osw: InstrumentDefinition,
    /// Optional spectrum source; without one, spectral analysis is skipped
    #[serde(default)]
    pub osa: Option<InstrumentDefinition>,
}

/// One instrument: which driver talks to it and over what transport
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstrumentDefinition {
    /// Driver name (bristol, keysight, santec, mock)
    pub driver: String,
    /// Transport settings
    #[serde(default)]
    pub transport: TransportConfig,
    /// Power meter settings, read by the keysight driver
    #[serde(default)]
    pub opm: Option<PowerMeterSettings>,
    /// Wavelength meter settings, read by the bristol driver
    #[serde(default)]
    pub wlm: Option<WavelengthMeterSettings>,
}

/// Transport kinds understood by the instrument factory
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportKind {
    /// Raw TCP socket or telnet-style line protocol
    Tcp,
    /// VISA resource string (requires the `instrument_visa` feature)
    Visa,
}

/// Text encoding used on the wire
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WireEncoding {
    /// UTF-8, with a hex fallback for undecodable replies
    #[default]
    Utf8,
    /// ISO-8859-1, every byte maps to one char
    Latin1,
}

/// Generic command transport settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransportConfig {
    /// Transport kind
    #[serde(default = "default_transport_kind")]
    pub kind: TransportKind,
    /// Host name, IP address or VISA resource string
    #[serde(default)]
    pub address: String,
    /// TCP port (ignored for VISA)
    #[serde(default = "default_port")]
    pub port: u16,
    /// Read/connect timeout in milliseconds
    #[serde(default = "default_transport_timeout")]
    pub timeout_ms: u64,
    /// Reply terminator stripped by `read`
    #[serde(default = "default_terminator")]
    pub prompt: String,
    /// Line terminator appended by `write`
    #[serde(default = "default_terminator")]
    pub eol: String,
    /// Text encoding
    #[serde(default)]
    pub encoding: WireEncoding,
    /// Delay between write and read in a query, in milliseconds
    #[serde(default = "default_query_delay")]
    pub query_delay_ms: u64,
}

/// Keysight power meter settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PowerMeterSettings {
    /// Sensor channel
    #[serde(default = "default_opm_channel")]
    pub channel: u8,
    /// Calibration wavelength in nm
    #[serde(default)]
    pub wavelength_nm: Option<f64>,
    /// Averaging time in seconds
    #[serde(default)]
    pub averaging_time_s: Option<f64>,
    /// Manual power range in dBm (-30..=10)
    #[serde(default)]
    pub range_dbm: Option<i32>,
    /// Auto gain
    #[serde(default)]
    pub auto_gain: Option<bool>,
}

/// Measurement method for the Bristol wavelength meter
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum MeasureMethod {
    /// Trigger a new measurement and wait for it
    #[default]
    Meas,
    /// Return the next completed measurement
    Read,
    /// Return the last completed measurement
    Fetch,
}

/// Bristol wavelength meter settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WavelengthMeterSettings {
    /// Measurement method
    #[serde(default)]
    pub method: MeasureMethod,
    /// SMSR reporting mode (1, 2 or 3)
    #[serde(default = "default_smsr_mode")]
    pub smsr_mode: u8,
    /// Number of attempts for an in-band frequency reading
    #[serde(default = "default_freq_retries")]
    pub freq_retries: u32,
}

/// A named inclusive limit window
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LimitBand {
    /// Name reported in limit violations
    pub limit_name: String,
    /// Upper bound (inclusive)
    pub high: f64,
    /// Lower bound (inclusive)
    pub low: f64,
}

/// Pass/fail limits
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LimitsConfig {
    /// Calibration reference power window (dBm)
    #[serde(default = "default_laser_source_limits")]
    pub laser_source: LimitBand,
    /// Per-bay path loss window (dB)
    #[serde(default = "default_path_loss_limits")]
    pub path_loss: LimitBand,
}

/// Calibration procedure settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SequenceConfig {
    /// Laser warm-up wait in seconds
    #[serde(default = "default_warmup_secs")]
    pub warmup_secs: u64,
    /// Allowed CRP drift at the end of the run, in percent
    #[serde(default = "default_power_tolerance")]
    pub power_end_tolerance_pct: f64,
    /// Delay before each instrument read in milliseconds
    #[serde(default = "default_read_settle")]
    pub read_settle_ms: u64,
    /// Operation-complete wait after a switch command in milliseconds
    #[serde(default = "default_opc_timeout")]
    pub opc_timeout_ms: u64,
    /// Maximum wait for the switch to confirm a channel in milliseconds
    #[serde(default = "default_confirm_timeout")]
    pub channel_confirm_timeout_ms: u64,
    /// Poll interval while waiting for channel confirmation in milliseconds
    #[serde(default = "default_confirm_poll")]
    pub channel_poll_ms: u64,
    /// Settle time after the channel is confirmed in milliseconds
    #[serde(default = "default_channel_settle")]
    pub channel_settle_ms: u64,
    /// Run spectral analysis (OSNR/SMSR) on each bay
    #[serde(default)]
    pub analyze_spectrum: bool,
}

/// Spectral analysis parameters; all frequency quantities in THz
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SpectrumConfig {
    /// Drop below the peak that bounds the channel, in dB
    #[serde(default = "default_center_threshold")]
    pub center_threshold_db: f64,
    /// Absolute floor for side-mode candidates, in dBm
    #[serde(default = "default_smsr_level")]
    pub smsr_level_db: f64,
    /// Minimum side-mode distance from the main peak, in GHz
    #[serde(default = "default_smsr_min_distance")]
    pub smsr_min_distance_ghz: f64,
    /// Maximum side-mode distance from the main peak, in GHz
    #[serde(default = "default_smsr_max_distance")]
    pub smsr_max_distance_ghz: f64,
    /// Resolution bandwidth of the acquisition
    #[serde(default = "default_rbw")]
    pub rbw_thz: f64,
    /// Width of each of the three integration windows
    #[serde(default = "default_signal_bw")]
    pub signal_bw_thz: f64,
    /// Offset of the noise windows from the channel centre
    #[serde(default = "default_noise_offset")]
    pub noise_offset_thz: f64,
    /// Reference bandwidth for OSNR
    #[serde(default = "default_noise_bw")]
    pub noise_bw_thz: f64,
}

// ============================================================================
// Default value functions
// ============================================================================

fn default_station_id() -> String {
    hostname::get()
        .ok()
        .and_then(|name| name.into_string().ok())
        .unwrap_or_else(|| "unknown-station".to_string())
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_dir() -> PathBuf {
    PathBuf::from("logs")
}

fn default_lock_dir() -> PathBuf {
    PathBuf::from("lock")
}

fn default_lock_log() -> PathBuf {
    PathBuf::from("lock/lock_log.txt")
}

fn default_ledger_path() -> PathBuf {
    PathBuf::from("data/Optical_Calibration.txt")
}

fn default_chart_dir() -> PathBuf {
    PathBuf::from("data/control_charts")
}

fn default_ledger_bays() -> u16 {
    70
}

fn default_lease_name() -> String {
    "Optical_lock".to_string()
}

fn default_lease_timeout() -> u64 {
    600_000
}

fn default_lease_poll() -> u64 {
    1000
}

fn default_transport_kind() -> TransportKind {
    TransportKind::Tcp
}

fn default_port() -> u16 {
    23
}

fn default_transport_timeout() -> u64 {
    5000
}

fn default_terminator() -> String {
    "\r\n".to_string()
}

fn default_query_delay() -> u64 {
    100
}

fn default_opm_channel() -> u8 {
    1
}

fn default_smsr_mode() -> u8 {
    1
}

fn default_freq_retries() -> u32 {
    3
}

fn default_wlm() -> InstrumentDefinition {
    InstrumentDefinition::new("bristol")
}

fn default_opm() -> InstrumentDefinition {
    InstrumentDefinition::new("keysight")
}

fn default_osw() -> InstrumentDefinition {
    InstrumentDefinition::new("santec")
}

fn default_laser_source_limits() -> LimitBand {
    LimitBand {
        limit_name: "Laser_Source".to_string(),
        high: 10.0,
        low: -10.0,
    }
}

fn default_path_loss_limits() -> LimitBand {
    LimitBand {
        limit_name: "Path_Loss".to_string(),
        high: 6.0,
        low: 0.0,
    }
}

fn default_warmup_secs() -> u64 {
    900
}

fn default_power_tolerance() -> f64 {
    1.0
}

fn default_read_settle() -> u64 {
    1000
}

fn default_opc_timeout() -> u64 {
    3000
}

fn default_confirm_timeout() -> u64 {
    5000
}

fn default_confirm_poll() -> u64 {
    100
}

fn default_channel_settle() -> u64 {
    200
}

fn default_center_threshold() -> f64 {
    5.0
}

fn default_smsr_level() -> f64 {
    -70.0
}

fn default_smsr_min_distance() -> f64 {
    5.0
}

fn default_smsr_max_distance() -> f64 {
    5000.0
}

fn default_rbw() -> f64 {
    180e-6
}

// 0.5 nm, 0.6 nm and 0.1 nm expressed at 1550 nm
fn default_signal_bw() -> f64 {
    0.0624
}

fn default_noise_offset() -> f64 {
    0.0749
}

fn default_noise_bw() -> f64 {
    0.0125
}

impl Default for StationSettings {
    fn default() -> Self {
        Self {
            station_id: default_station_id(),
            log_level: default_log_level(),
            log_dir: default_log_dir(),
            lock_dir: default_lock_dir(),
            lock_log: default_lock_log(),
            ledger_path: default_ledger_path(),
            chart_dir: default_chart_dir(),
        }
    }
}

impl Default for BayConfig {
    fn default() -> Self {
        Self {
            available: Vec::new(),
            ledger_bays: default_ledger_bays(),
        }
    }
}

impl Default for LeaseConfig {
    fn default() -> Self {
        Self {
            name: default_lease_name(),
            timeout_ms: default_lease_timeout(),
            poll_interval_ms: default_lease_poll(),
            reentrant: false,
        }
    }
}

impl Default for InstrumentsConfig {
    fn default() -> Self {
        Self {
            wlm: default_wlm(),
            opm: default_opm(),
            osw: default_osw(),
            osa: None,
        }
    }
}

impl InstrumentDefinition {
    /// A definition for `driver` with default transport settings
    pub fn new(driver: &str) -> Self {
        Self {
            driver: driver.to_string(),
            transport: TransportConfig::default(),
            opm: None,
            wlm: None,
        }
    }
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            kind: default_transport_kind(),
            address: String::new(),
            port: default_port(),
            timeout_ms: default_transport_timeout(),
            prompt: default_terminator(),
            eol: default_terminator(),
            encoding: WireEncoding::default(),
            query_delay_ms: default_query_delay(),
        }
    }
}

impl TransportConfig {
    /// Read/connect timeout
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    /// Delay between the write and the read of a query
    pub fn query_delay(&self) -> Duration {
        Duration::from_millis(self.query_delay_ms)
    }
}

impl Default for PowerMeterSettings {
    fn default() -> Self {
        Self {
            channel: default_opm_channel(),
            wavelength_nm: None,
            averaging_time_s: None,
            range_dbm: None,
            auto_gain: None,
        }
    }
}

impl Default for WavelengthMeterSettings {
    fn default() -> Self {
        Self {
            method: MeasureMethod::default(),
            smsr_mode: default_smsr_mode(),
            freq_retries: default_freq_retries(),
        }
    }
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            laser_source: default_laser_source_limits(),
            path_loss: default_path_loss_limits(),
        }
    }
}

impl Default for SequenceConfig {
    fn default() -> Self {
        Self {
            warmup_secs: default_warmup_secs(),
            power_end_tolerance_pct: default_power_tolerance(),
            read_settle_ms: default_read_settle(),
            opc_timeout_ms: default_opc_timeout(),
            channel_confirm_timeout_ms: default_confirm_timeout(),
            channel_poll_ms: default_confirm_poll(),
            channel_settle_ms: default_channel_settle(),
            analyze_spectrum: false,
        }
    }
}

impl Default for SpectrumConfig {
    fn default() -> Self {
        Self {
            center_threshold_db: default_center_threshold(),
            smsr_level_db: default_smsr_level(),
            smsr_min_distance_ghz: default_smsr_min_distance(),
            smsr_max_distance_ghz: default_smsr_max_distance(),
            rbw_thz: default_rbw(),
            signal_bw_thz: default_signal_bw(),
            noise_offset_thz: default_noise_offset(),
            noise_bw_thz: default_noise_bw(),
        }
    }
}

// ============================================================================
// Configuration Loading and Validation
// ============================================================================

impl StationConfig {
    /// Load configuration from [`DEFAULT_CONFIG_PATH`] and environment variables
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_from(DEFAULT_CONFIG_PATH)
    }

    /// Load configuration from a specific file path
    ///
    /// Environment variables (`PATHLOSS_` prefix) take precedence over the file.
    /// After loading, configuration is validated.
    pub fn load_from<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let config: Self = Figment::new()
            .merge(Toml::file(path.as_ref()))
            .merge(Env::prefixed("PATHLOSS_").split("__"))
            .extract()
            .map_err(ConfigError::LoadError)?;

        config.validate()?;
        Ok(config)
    }

    /// Validate configuration after loading
    ///
    /// Checks:
    /// - Log level is valid
    /// - Available bays are unique and within `1..=ledger_bays`
    /// - Lease timing is non-zero
    /// - Limit windows are ordered
    /// - Instrument drivers are known
    pub fn validate(&self) -> Result<(), ConfigError> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.station.log_level.as_str()) {
            return Err(ConfigError::ValidationError(format!(
                "Invalid log_level '{}'. Must be one of: {}",
                self.station.log_level,
                valid_levels.join(", ")
            )));
        }

        if self.station.station_id.trim().is_empty() {
            return Err(ConfigError::ValidationError(
                "station_id cannot be empty".to_string(),
            ));
        }

        let mut seen = std::collections::HashSet::new();
        for bay in &self.bays.available {
            if *bay == 0 || *bay > self.bays.ledger_bays {
                return Err(ConfigError::ValidationError(format!(
                    "Bay {} is outside 1..={}",
                    bay, self.bays.ledger_bays
                )));
            }
            if !seen.insert(bay) {
                return Err(ConfigError::ValidationError(format!(
                    "Duplicate bay in available list: {}",
                    bay
                )));
            }
        }

        if self.lease.poll_interval_ms == 0 || self.lease.timeout_ms == 0 {
            return Err(ConfigError::ValidationError(
                "lease timeout_ms and poll_interval_ms must be > 0".to_string(),
            ));
        }

        for band in [&self.limits.laser_source, &self.limits.path_loss] {
            if band.low > band.high {
                return Err(ConfigError::ValidationError(format!(
                    "Limit '{}': low {} is above high {}",
                    band.limit_name, band.low, band.high
                )));
            }
        }

        if self.sequence.power_end_tolerance_pct < 0.0 {
            return Err(ConfigError::ValidationError(
                "power_end_tolerance_pct cannot be negative".to_string(),
            ));
        }

        Self::validate_driver("wlm", &self.instruments.wlm, &["bristol", "mock"])?;
        Self::validate_driver("opm", &self.instruments.opm, &["keysight", "mock"])?;
        Self::validate_driver("osw", &self.instruments.osw, &["santec", "mock"])?;
        if let Some(osa) = &self.instruments.osa {
            Self::validate_driver("osa", osa, &["bristol", "mock"])?;
        }

        Ok(())
    }

    fn validate_driver(
        role: &str,
        definition: &InstrumentDefinition,
        known: &[&str],
    ) -> Result<(), ConfigError> {
        if !known.contains(&definition.driver.as_str()) {
            return Err(ConfigError::ValidationError(format!(
                "Invalid driver '{}' for instrument '{}'. Must be one of: {}",
                definition.driver,
                role,
                known.join(", ")
            )));
        }
        if let Some(wlm) = &definition.wlm {
            if !(1..=3).contains(&wlm.smsr_mode) {
                return Err(ConfigError::ValidationError(format!(
                    "Instrument '{}': smsr_mode must be 1, 2 or 3",
                    role
                )));
            }
        }
        if let Some(opm) = &definition.opm {
            if let Some(range) = opm.range_dbm {
                if !(-30..=10).contains(&range) {
                    return Err(ConfigError::ValidationError(format!(
                        "Instrument '{}': range_dbm {} outside -30..=10",
                        role, range
                    )));
                }
            }
        }
        Ok(())
    }

    /// Lease timeout as a [`Duration`]
    pub fn lease_timeout(&self) -> Duration {
        Duration::from_millis(self.lease.timeout_ms)
    }

    /// Lease poll interval as a [`Duration`]
    pub fn lease_poll_interval(&self) -> Duration {
        Duration::from_millis(self.lease.poll_interval_ms)
    }
}

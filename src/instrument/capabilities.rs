//! Capability traits per instrument role.
//!
//! The calibration steps only see these traits; vendor drivers and the simulated bench
//! implement them. All methods take `&self` so one instrument can be shared behind an
//! `Arc` by the session and the steps that use it.

use async_trait::async_trait;
use std::time::Duration;

use crate::data::spectrum::SpectrumSample;
use crate::StationResult;

/// Behaviour common to every instrument.
#[async_trait]
pub trait Instrument: Send + Sync {
    /// Short name used in logs (`"OPM"`, `"WLM"`, ...).
    fn name(&self) -> &str;

    /// `*IDN?` style identification string.
    async fn identify(&self) -> StationResult<String>;

    /// Release the underlying connection.
    async fn close(&self) -> StationResult<()>;
}

/// Display unit of a power meter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PowerUnit {
    Dbm,
    Watt,
}

/// Capability for instruments that report optical power.
#[async_trait]
pub trait PowerMeter: Instrument {
    /// One power reading in dBm.
    async fn read_power_dbm(&self) -> StationResult<f64>;

    async fn power_unit(&self) -> StationResult<PowerUnit>;
}

/// Capability for optical switches.
#[async_trait]
pub trait OpticalSwitch: Instrument {
    async fn set_channel(&self, channel: u16) -> StationResult<()>;

    /// Channel the switch currently reports.
    async fn channel(&self) -> StationResult<u16>;

    /// True once the last command has finished executing.
    async fn operation_complete(&self) -> StationResult<bool>;

    /// Poll [`operation_complete`](Self::operation_complete) until it is true or
    /// `timeout` elapses; returns the final state.
    async fn wait_operation_complete(&self, timeout: Duration, poll: Duration) -> StationResult<bool> {
        let start = tokio::time::Instant::now();
        loop {
            if self.operation_complete().await? {
                return Ok(true);
            }
            if start.elapsed() >= timeout {
                return self.operation_complete().await;
            }
            tokio::time::sleep(poll).await;
        }
    }
}

/// Capability for wavelength meters.
#[async_trait]
pub trait WavelengthMeter: Instrument {
    /// Optical frequency in THz.
    async fn frequency_thz(&self) -> StationResult<f64>;

    /// Optical power in dBm.
    async fn power_dbm(&self) -> StationResult<f64>;

    /// Side-mode suppression ratio in dB; `None` when the meter has SMSR turned off.
    async fn smsr_db(&self) -> StationResult<Option<f64>>;
}

/// Capability for instruments that return a full optical spectrum.
#[async_trait]
pub trait SpectrumAnalyzer: Instrument {
    async fn acquire_spectrum(&self) -> StationResult<SpectrumSample>;
}

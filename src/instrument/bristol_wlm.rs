//! Bristol wavelength meter driver
//!
//! Readings are taken with the configured measurement method (`MEAS`, `READ` or
//! `FETCH`). The meter can also return its full spectrum as a binary block of 12-byte
//! little-endian records (`f64` wavelength in nm, `f32` power in dBm) via
//! `:CALC3:DATA?`, which makes it usable as the station's spectrum source.

use async_trait::async_trait;
use tracing::{debug, info};

use crate::adapters::InstrumentTransport;
use crate::config::{MeasureMethod, WavelengthMeterSettings};
use crate::data::spectrum::{nm_to_thz, SpectrumSample};
use crate::instrument::capabilities::{Instrument, SpectrumAnalyzer, WavelengthMeter};
use crate::{StationError, StationResult};

/// Size of one spectrum record in the `:CALC3:DATA?` block
pub const SPECTRUM_RECORD_LEN: usize = 12;

pub struct BristolWavelengthMeter {
    name: String,
    transport: Box<dyn InstrumentTransport>,
    settings: WavelengthMeterSettings,
}

fn method_str(method: MeasureMethod) -> &'static str {
    match method {
        MeasureMethod::Meas => "MEAS",
        MeasureMethod::Read => "READ",
        MeasureMethod::Fetch => "FETCH",
    }
}

impl BristolWavelengthMeter {
    pub fn new(name: &str, transport: Box<dyn InstrumentTransport>, settings: WavelengthMeterSettings) -> Self {
        Self {
            name: name.to_string(),
            transport,
            settings,
        }
    }

    /// Select the configured SMSR reporting mode.
    pub async fn configure(&self) -> StationResult<()> {
        self.transport
            .write(&format!(":CALCulate2:SMSR:MODE {}", self.settings.smsr_mode))
            .await?;
        info!(
            instrument = %self.name,
            method = method_str(self.settings.method),
            smsr_mode = self.settings.smsr_mode,
            "Wavelength meter configured"
        );
        Ok(())
    }

    async fn measure(&self, quantity: &str) -> StationResult<String> {
        let command = format!(":{}:{}?", method_str(self.settings.method), quantity);
        Ok(self.transport.query(&command).await?)
    }

    fn parse_float(&self, what: &str, text: &str) -> StationResult<f64> {
        text.trim().parse::<f64>().map_err(|_| {
            StationError::Instrument(format!(
                "{}: failed to parse {} '{}'",
                self.name,
                what,
                text.trim()
            ))
        })
    }

    /// SMSR from a `:SMSR?` reply in the configured mode.
    ///
    /// Modes 2 and 3 report red and blue side modes separately; the smaller (worse)
    /// suppression is returned.
    fn parse_smsr(&self, reply: &str) -> StationResult<Option<f64>> {
        let reply = reply.trim();
        if reply.eq_ignore_ascii_case("SMSR off") {
            return Ok(None);
        }
        let fields: Vec<&str> = reply.split(',').collect();
        let field = |i: usize| -> StationResult<f64> {
            let text = fields.get(i).ok_or_else(|| {
                StationError::Instrument(format!(
                    "{}: SMSR reply '{}' has no field {}",
                    self.name, reply, i
                ))
            })?;
            self.parse_float("SMSR field", text)
        };
        let smsr = match self.settings.smsr_mode {
            1 => field(fields.len().saturating_sub(1))?,
            2 => field(3)?.min(field(5)?),
            3 => {
                let peak = field(1)?;
                (peak - field(3)?).min(peak - field(5)?)
            }
            other => {
                return Err(StationError::Instrument(format!(
                    "{}: unsupported SMSR mode {}",
                    self.name, other
                )))
            }
        };
        Ok(Some(smsr))
    }
}

/// Decode a `:CALC3:DATA?` payload into a spectrum with ascending frequency.
pub fn parse_spectrum_block(payload: &[u8]) -> StationResult<SpectrumSample> {
    if payload.len() % SPECTRUM_RECORD_LEN != 0 {
        return Err(StationError::Instrument(format!(
            "spectrum block of {} bytes is not a whole number of {}-byte records",
            payload.len(),
            SPECTRUM_RECORD_LEN
        )));
    }
    let mut frequency = Vec::with_capacity(payload.len() / SPECTRUM_RECORD_LEN);
    let mut power = Vec::with_capacity(payload.len() / SPECTRUM_RECORD_LEN);
    for record in payload.chunks_exact(SPECTRUM_RECORD_LEN) {
        let (wl, pw) = record.split_at(8);
        let wavelength_nm = f64::from_le_bytes(wl.try_into().map_err(|_| {
            StationError::Instrument("truncated wavelength field".to_string())
        })?);
        let power_dbm = f32::from_le_bytes(pw.try_into().map_err(|_| {
            StationError::Instrument("truncated power field".to_string())
        })?);
        frequency.push(nm_to_thz(wavelength_nm));
        power.push(f64::from(power_dbm));
    }
    // Ascending wavelength is descending frequency.
    frequency.reverse();
    power.reverse();
    Ok(SpectrumSample::new(frequency, power)?)
}

#[async_trait]
impl Instrument for BristolWavelengthMeter {
    fn name(&self) -> &str {
        &self.name
    }

    async fn identify(&self) -> StationResult<String> {
        Ok(self.transport.query("*IDN?").await?)
    }

    async fn close(&self) -> StationResult<()> {
        Ok(self.transport.close().await?)
    }
}

#[async_trait]
impl WavelengthMeter for BristolWavelengthMeter {
    async fn frequency_thz(&self) -> StationResult<f64> {
        let reply = self.measure("FREQ").await?;
        self.parse_float("frequency", &reply)
    }

    async fn power_dbm(&self) -> StationResult<f64> {
        let reply = self.measure("POW").await?;
        self.parse_float("power", &reply)
    }

    async fn smsr_db(&self) -> StationResult<Option<f64>> {
        let reply = self.measure("SMSR").await?;
        self.parse_smsr(&reply)
    }
}

#[async_trait]
impl SpectrumAnalyzer for BristolWavelengthMeter {
    async fn acquire_spectrum(&self) -> StationResult<SpectrumSample> {
        let payload = self.transport.query_raw(":CALC3:DATA?").await?;
        let sample = parse_spectrum_block(&payload)?;
        debug!(instrument = %self.name, points = sample.len(), "Spectrum acquired");
        Ok(sample)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::MockTransport;
    use bytes::Bytes;

    fn wlm(transport: &MockTransport, smsr_mode: u8) -> BristolWavelengthMeter {
        BristolWavelengthMeter::new(
            "WLM",
            Box::new(transport.clone()),
            WavelengthMeterSettings {
                smsr_mode,
                ..WavelengthMeterSettings::default()
            },
        )
    }

    #[tokio::test]
    async fn test_frequency_and_power() {
        let transport = MockTransport::new("wlm");
        transport.respond_to(":MEAS:FREQ?", "193.4145");
        transport.respond_to(":MEAS:POW?", "2.75");
        let meter = wlm(&transport, 1);
        assert_eq!(meter.frequency_thz().await.unwrap(), 193.4145);
        assert_eq!(meter.power_dbm().await.unwrap(), 2.75);
    }

    #[tokio::test]
    async fn test_read_method() {
        let transport = MockTransport::new("wlm");
        transport.respond_to(":READ:FREQ?", "193.1");
        let meter = BristolWavelengthMeter::new(
            "WLM",
            Box::new(transport.clone()),
            WavelengthMeterSettings {
                method: MeasureMethod::Read,
                ..WavelengthMeterSettings::default()
            },
        );
        assert_eq!(meter.frequency_thz().await.unwrap(), 193.1);
    }

    #[tokio::test]
    async fn test_smsr_modes() {
        let transport = MockTransport::new("wlm");
        transport.respond_to(":MEAS:SMSR?", "1550.1,2.5,0.8,45.5");
        assert_eq!(wlm(&transport, 1).smsr_db().await.unwrap(), Some(45.5));

        transport.respond_to(":MEAS:SMSR?", "1550.1,2.5,0.8,44.0,0.8,41.0");
        assert_eq!(wlm(&transport, 2).smsr_db().await.unwrap(), Some(41.0));

        transport.respond_to(":MEAS:SMSR?", "1550.1,2.5,1549.3,-40.0,1550.9,-42.5");
        assert_eq!(wlm(&transport, 3).smsr_db().await.unwrap(), Some(42.5));

        transport.respond_to(":MEAS:SMSR?", "SMSR off");
        assert_eq!(wlm(&transport, 1).smsr_db().await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_spectrum_block() {
        let mut payload = Vec::new();
        for (nm, dbm) in [(1549.0f64, -60.0f32), (1550.0, -5.0), (1551.0, -61.0)] {
            payload.extend_from_slice(&nm.to_le_bytes());
            payload.extend_from_slice(&dbm.to_le_bytes());
        }
        let transport = MockTransport::new("wlm");
        transport.respond_raw(":CALC3:DATA?", Bytes::from(payload));

        let sample = wlm(&transport, 1).acquire_spectrum().await.unwrap();
        assert_eq!(sample.len(), 3);
        assert!(sample.frequency()[0] < sample.frequency()[2]);
        assert!((sample.frequency()[0] - nm_to_thz(1551.0)).abs() < 1e-9);
        assert_eq!(sample.power()[1], -5.0);
    }

    #[test]
    fn test_partial_record_rejected() {
        assert!(parse_spectrum_block(&[0u8; 13]).is_err());
        assert!(parse_spectrum_block(&[]).unwrap().is_empty());
    }
}

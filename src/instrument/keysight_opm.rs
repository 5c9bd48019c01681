//! Keysight optical power meter driver
//!
//! SCPI over any [`InstrumentTransport`]. The meter is addressed by channel (slot);
//! settings from the `[instruments.opm.opm]` configuration block are applied once by
//! [`KeysightPowerMeter::configure`].
//!
//! ```toml
//! [instruments.opm]
//! driver = "keysight"
//!
//! [instruments.opm.transport]
//! kind = "visa"
//! address = "TCPIP0::10.0.0.21::inst0::INSTR"
//!
//! [instruments.opm.opm]
//! channel = 1
//! wavelength_nm = 1550.0
//! averaging_time_s = 0.1
//! auto_gain = true
//! ```

use async_trait::async_trait;
use tracing::{debug, info};

use crate::adapters::InstrumentTransport;
use crate::config::PowerMeterSettings;
use crate::instrument::capabilities::{Instrument, PowerMeter, PowerUnit};
use crate::{StationError, StationResult};

/// Keysight power meter on one channel
pub struct KeysightPowerMeter {
    name: String,
    transport: Box<dyn InstrumentTransport>,
    settings: PowerMeterSettings,
}

impl KeysightPowerMeter {
    pub fn new(name: &str, transport: Box<dyn InstrumentTransport>, settings: PowerMeterSettings) -> Self {
        Self {
            name: name.to_string(),
            transport,
            settings,
        }
    }

    pub fn channel(&self) -> u8 {
        self.settings.channel
    }

    /// Apply the configured wavelength, averaging time, range and auto gain.
    pub async fn configure(&self) -> StationResult<()> {
        let ch = self.settings.channel;
        if let Some(wl) = self.settings.wavelength_nm {
            self.transport
                .write(&format!(":SENS{}:POW:WAV {}NM", ch, wl))
                .await?;
        }
        if let Some(t) = self.settings.averaging_time_s {
            self.transport
                .write(&format!(":SENS{}:POW:ATIM {:0.6}S", ch, t))
                .await?;
        }
        if let Some(range) = self.settings.range_dbm {
            self.transport
                .write(&format!(":SENS{}:POW:RANG {}DBM", ch, range))
                .await?;
        }
        if let Some(auto) = self.settings.auto_gain {
            self.transport
                .write(&format!(":SENS{}:POW:GAIN:AUTO {}", ch, u8::from(auto)))
                .await?;
        }
        info!(instrument = %self.name, channel = ch, "Power meter configured");
        Ok(())
    }

    fn parse_power(&self, reply: &str) -> StationResult<f64> {
        reply.trim().parse::<f64>().map_err(|_| {
            StationError::Instrument(format!(
                "{}: failed to parse power reply '{}'",
                self.name,
                reply.trim()
            ))
        })
    }
}

#[async_trait]
impl Instrument for KeysightPowerMeter {
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
impl PowerMeter for KeysightPowerMeter {
    async fn read_power_dbm(&self) -> StationResult<f64> {
        let reply = self
            .transport
            .query(&format!(":READ{}:POW?", self.settings.channel))
            .await?;
        let value = self.parse_power(&reply)?;
        let dbm = match self.power_unit().await? {
            PowerUnit::Dbm => value,
            PowerUnit::Watt => 10.0 * (value * 1e3).log10(),
        };
        debug!(instrument = %self.name, power_dbm = dbm, "Power read");
        Ok(dbm)
    }

    async fn power_unit(&self) -> StationResult<PowerUnit> {
        let reply = self
            .transport
            .query(&format!(":SENSe{}:POW:UNIT?", self.settings.channel))
            .await?;
        match reply.trim() {
            "0" => Ok(PowerUnit::Dbm),
            "1" => Ok(PowerUnit::Watt),
            other => Err(StationError::Instrument(format!(
                "{}: unknown power unit code '{}'",
                self.name, other
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::MockTransport;

    fn meter(transport: &MockTransport, settings: PowerMeterSettings) -> KeysightPowerMeter {
        KeysightPowerMeter::new("OPM", Box::new(transport.clone()), settings)
    }

    #[tokio::test]
    async fn test_read_power_dbm() {
        let transport = MockTransport::new("opm");
        transport.respond_to(":READ2:POW?", "-3.125");
        transport.respond_to(":SENSe2:POW:UNIT?", "0");
        let opm = meter(
            &transport,
            PowerMeterSettings {
                channel: 2,
                ..PowerMeterSettings::default()
            },
        );
        assert_eq!(opm.read_power_dbm().await.unwrap(), -3.125);
    }

    #[tokio::test]
    async fn test_watt_reading_converted() {
        let transport = MockTransport::new("opm");
        transport.respond_to(":READ1:POW?", "1.0E-03");
        transport.respond_to(":SENSe1:POW:UNIT?", "1");
        let opm = meter(&transport, PowerMeterSettings::default());
        assert!(opm.read_power_dbm().await.unwrap().abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_garbage_reply_is_instrument_error() {
        let transport = MockTransport::new("opm");
        transport.respond_to(":READ1:POW?", "ERR");
        let opm = meter(&transport, PowerMeterSettings::default());
        assert!(matches!(
            opm.read_power_dbm().await,
            Err(StationError::Instrument(_))
        ));
    }

    #[tokio::test]
    async fn test_configure_commands() {
        let transport = MockTransport::new("opm");
        let opm = meter(
            &transport,
            PowerMeterSettings {
                channel: 1,
                wavelength_nm: Some(1550.0),
                averaging_time_s: Some(0.1),
                range_dbm: Some(-10),
                auto_gain: Some(true),
            },
        );
        opm.configure().await.unwrap();
        assert_eq!(
            transport.written(),
            vec![
                ":SENS1:POW:WAV 1550NM",
                ":SENS1:POW:ATIM 0.100000S",
                ":SENS1:POW:RANG -10DBM",
                ":SENS1:POW:GAIN:AUTO 1",
            ]
        );
    }
}

//! Instrument bring-up.
//!
//! An [`InstrumentFactory`] opens the station's optical instruments for one lease
//! session. [`ConfiguredFactory`] builds the vendor drivers named in the configuration;
//! [`MockFactory`] hands out instruments on a [`MockBench`].

use async_trait::async_trait;
use serde::Serialize;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, warn};

use crate::adapters::transport_from_config;
use crate::config::{InstrumentDefinition, InstrumentsConfig};
use crate::instrument::bristol_wlm::BristolWavelengthMeter;
use crate::instrument::capabilities::{
    Instrument, OpticalSwitch, PowerMeter, SpectrumAnalyzer, WavelengthMeter,
};
use crate::instrument::keysight_opm::KeysightPowerMeter;
use crate::instrument::mock::{
    MockBench, MockFault, MockPowerMeter, MockSpectrumAnalyzer, MockSwitch, MockWavelengthMeter,
    Route,
};
use crate::instrument::santec_switch::SantecSwitch;
use crate::{StationError, StationResult};

/// The instruments of one session
#[derive(Clone)]
pub struct OpticalInstruments {
    pub opm: Arc<dyn PowerMeter>,
    pub wlm: Arc<dyn WavelengthMeter>,
    pub osw: Arc<dyn OpticalSwitch>,
    pub osa: Option<Arc<dyn SpectrumAnalyzer>>,
}

/// Presence and identity of one instrument
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EquipmentStatus {
    pub role: String,
    pub present: bool,
    pub idn: String,
}

/// Result of an equipment check
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EquipmentReport {
    pub instruments: Vec<EquipmentStatus>,
}

impl EquipmentReport {
    pub fn all_present(&self) -> bool {
        self.instruments.iter().all(|s| s.present)
    }
}

impl OpticalInstruments {
    /// Close every instrument. Failures are logged, not returned.
    pub async fn close_all(&self) {
        close_quietly(self.wlm.as_ref()).await;
        close_quietly(self.opm.as_ref()).await;
        close_quietly(self.osw.as_ref()).await;
        if let Some(osa) = &self.osa {
            close_quietly(osa.as_ref()).await;
        }
    }

    /// Identify each instrument; an instrument that does not answer is reported absent.
    pub async fn check(&self) -> EquipmentReport {
        let mut instruments = vec![
            identify_status("OPM", self.opm.as_ref()).await,
            identify_status("WLM", self.wlm.as_ref()).await,
            identify_status("OSW", self.osw.as_ref()).await,
        ];
        if let Some(osa) = &self.osa {
            instruments.push(identify_status("OSA", osa.as_ref()).await);
        }
        EquipmentReport { instruments }
    }
}

async fn close_quietly<T: Instrument + ?Sized>(instrument: &T) {
    if let Err(e) = instrument.close().await {
        warn!(instrument = instrument.name(), error = %e, "Failed to close instrument");
    }
}

async fn identify_status<T: Instrument + ?Sized>(role: &str, instrument: &T) -> EquipmentStatus {
    match instrument.identify().await {
        Ok(idn) => EquipmentStatus {
            role: role.to_string(),
            present: true,
            idn,
        },
        Err(e) => {
            warn!(role, error = %e, "Instrument did not identify");
            EquipmentStatus {
                role: role.to_string(),
                present: false,
                idn: String::new(),
            }
        }
    }
}

/// Opens the instruments for a session
#[async_trait]
pub trait InstrumentFactory: Send + Sync {
    /// Open and configure all instruments; `bay` is the bay the session will switch to.
    async fn bring_up(&self, bay: Option<u16>) -> StationResult<OpticalInstruments>;
}

/// Factory for the drivers named in the `[instruments]` configuration
pub struct ConfiguredFactory {
    config: InstrumentsConfig,
    bench: MockBench,
}

impl ConfiguredFactory {
    pub fn new(config: InstrumentsConfig) -> Self {
        Self {
            config,
            bench: MockBench::new(),
        }
    }

    /// Bench used by any instrument configured with the `mock` driver.
    pub fn bench(&self) -> &MockBench {
        &self.bench
    }

    async fn wlm(&self, def: &InstrumentDefinition) -> StationResult<Arc<dyn WavelengthMeter>> {
        match def.driver.as_str() {
            "bristol" => {
                let wlm = BristolWavelengthMeter::new(
                    "WLM",
                    transport_from_config(&def.transport),
                    def.wlm.clone().unwrap_or_default(),
                );
                wlm.configure().await?;
                Ok(Arc::new(wlm))
            }
            "mock" => Ok(Arc::new(MockWavelengthMeter::new(self.bench.clone()))),
            other => Err(unknown_driver("wlm", other)),
        }
    }

    async fn opm(&self, def: &InstrumentDefinition) -> StationResult<Arc<dyn PowerMeter>> {
        match def.driver.as_str() {
            "keysight" => {
                let opm = KeysightPowerMeter::new(
                    "OPM",
                    transport_from_config(&def.transport),
                    def.opm.clone().unwrap_or_default(),
                );
                opm.configure().await?;
                Ok(Arc::new(opm))
            }
            "mock" => Ok(Arc::new(MockPowerMeter::new(self.bench.clone()))),
            other => Err(unknown_driver("opm", other)),
        }
    }

    fn osw(&self, def: &InstrumentDefinition) -> StationResult<Arc<dyn OpticalSwitch>> {
        match def.driver.as_str() {
            "santec" => Ok(Arc::new(SantecSwitch::new(
                "OSW",
                transport_from_config(&def.transport),
            ))),
            "mock" => Ok(Arc::new(MockSwitch::new(self.bench.clone()))),
            other => Err(unknown_driver("osw", other)),
        }
    }

    fn osa(&self, def: &InstrumentDefinition) -> StationResult<Arc<dyn SpectrumAnalyzer>> {
        match def.driver.as_str() {
            "bristol" => Ok(Arc::new(BristolWavelengthMeter::new(
                "OSA",
                transport_from_config(&def.transport),
                def.wlm.clone().unwrap_or_default(),
            ))),
            "mock" => Ok(Arc::new(MockSpectrumAnalyzer::new(self.bench.clone()))),
            other => Err(unknown_driver("osa", other)),
        }
    }
}

fn unknown_driver(role: &str, driver: &str) -> StationError {
    StationError::Instrument(format!("Unknown driver '{}' for {}", driver, role))
}

/// Identify `instrument` and log how long bring-up took.
async fn announce<T: Instrument + ?Sized>(instrument: &T, started: Instant) -> StationResult<()> {
    let idn = instrument.identify().await?;
    debug!(
        instrument = instrument.name(),
        idn = %idn,
        connect_ms = started.elapsed().as_millis() as u64,
        "Instrument connected"
    );
    Ok(())
}

/// Instruments opened so far during a bring-up
#[derive(Default)]
struct Opened {
    wlm: Option<Arc<dyn WavelengthMeter>>,
    opm: Option<Arc<dyn PowerMeter>>,
    osw: Option<Arc<dyn OpticalSwitch>>,
}

impl Opened {
    async fn close(self) {
        if let Some(wlm) = self.wlm {
            close_quietly(wlm.as_ref()).await;
        }
        if let Some(opm) = self.opm {
            close_quietly(opm.as_ref()).await;
        }
        if let Some(osw) = self.osw {
            close_quietly(osw.as_ref()).await;
        }
    }
}

impl ConfiguredFactory {
    async fn open_all(&self, opened: &mut Opened) -> StationResult<OpticalInstruments> {
        let started = Instant::now();
        let wlm = self.wlm(&self.config.wlm).await?;
        opened.wlm = Some(Arc::clone(&wlm));
        announce(wlm.as_ref(), started).await?;

        let started = Instant::now();
        let opm = self.opm(&self.config.opm).await?;
        opened.opm = Some(Arc::clone(&opm));
        announce(opm.as_ref(), started).await?;

        let started = Instant::now();
        let osw = self.osw(&self.config.osw)?;
        opened.osw = Some(Arc::clone(&osw));
        announce(osw.as_ref(), started).await?;

        let osa = match &self.config.osa {
            Some(def) => Some(self.osa(def)?),
            None => None,
        };
        Ok(OpticalInstruments { opm, wlm, osw, osa })
    }
}

#[async_trait]
impl InstrumentFactory for ConfiguredFactory {
    async fn bring_up(&self, _bay: Option<u16>) -> StationResult<OpticalInstruments> {
        let mut opened = Opened::default();
        match self.open_all(&mut opened).await {
            Ok(instruments) => Ok(instruments),
            Err(e) => {
                opened.close().await;
                Err(e)
            }
        }
    }
}

/// Factory over a shared [`MockBench`]
///
/// Sessions without a bay route the power meter directly to the source; sessions on a
/// bay route it through the switch.
#[derive(Clone)]
pub struct MockFactory {
    bench: MockBench,
    with_osa: bool,
}

impl MockFactory {
    pub fn new(bench: MockBench) -> Self {
        Self {
            bench,
            with_osa: true,
        }
    }

    /// Leave the spectrum analyzer out of the session.
    pub fn without_osa(mut self) -> Self {
        self.with_osa = false;
        self
    }

    pub fn bench(&self) -> &MockBench {
        &self.bench
    }
}

#[async_trait]
impl InstrumentFactory for MockFactory {
    async fn bring_up(&self, bay: Option<u16>) -> StationResult<OpticalInstruments> {
        self.bench
            .enter(format!("bring_up {:?}", bay), MockFault::BringUp)?;
        self.bench.set_route(if bay.is_some() {
            Route::Switched
        } else {
            Route::Direct
        });
        let osa: Option<Arc<dyn SpectrumAnalyzer>> = if self.with_osa {
            Some(Arc::new(MockSpectrumAnalyzer::new(self.bench.clone())))
        } else {
            None
        };
        Ok(OpticalInstruments {
            opm: Arc::new(MockPowerMeter::new(self.bench.clone())),
            wlm: Arc::new(MockWavelengthMeter::new(self.bench.clone())),
            osw: Arc::new(MockSwitch::new(self.bench.clone())),
            osa,
        })
    }
}

//! Simulated optical bench.
//!
//! [`MockBench`] holds the physical state shared by the simulated instruments: the
//! reference source power, the loss of each bay, the switch position and how the power
//! meter is patched. Instruments created from one bench see the same state, so a run
//! against the bench behaves like a run against real hardware.
//!
//! The power meter reads the source directly while the bench is routed
//! [`Route::Direct`] (the LC patch used for the reference reading) and through the
//! switch to the selected bay otherwise.

use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use crate::adapters::TransportError;
use crate::data::spectrum::{dbm_to_mw, mw_to_dbm, SpectrumSample};
use crate::instrument::capabilities::{
    Instrument, OpticalSwitch, PowerMeter, PowerUnit, SpectrumAnalyzer, WavelengthMeter,
};
use crate::StationResult;

/// How the power meter is patched
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Route {
    /// Straight from the reference source
    Direct,
    /// Through the optical switch to the selected bay
    Switched,
}

/// Operations that can be made to fail
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MockFault {
    BringUp,
    Identify,
    OpmRead,
    WlmFrequency,
    WlmPower,
    SwitchSet,
    Spectrum,
}

#[derive(Debug)]
struct BenchState {
    reference_power_dbm: f64,
    bay_loss_db: HashMap<u16, f64>,
    wlm_extra_loss_db: f64,
    frequency_thz: f64,
    smsr_db: Option<f64>,
    channel: u16,
    switch_frozen: bool,
    route: Route,
    faults: HashSet<MockFault>,
    persistent_faults: HashSet<MockFault>,
    call_log: Vec<String>,
}

/// Shared state of the simulated instruments
#[derive(Debug, Clone)]
pub struct MockBench {
    state: Arc<Mutex<BenchState>>,
}

impl Default for MockBench {
    fn default() -> Self {
        Self::new()
    }
}

impl MockBench {
    /// Bench with a 3 dBm source at 193.4145 THz, 45 dB SMSR and 2.5 dB loss on every bay.
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(BenchState {
                reference_power_dbm: 3.0,
                bay_loss_db: HashMap::new(),
                wlm_extra_loss_db: 0.4,
                frequency_thz: 193.4145,
                smsr_db: Some(45.0),
                channel: 0,
                switch_frozen: false,
                route: Route::Direct,
                faults: HashSet::new(),
                persistent_faults: HashSet::new(),
                call_log: Vec::new(),
            })),
        }
    }

    fn lock(&self) -> MutexGuard<'_, BenchState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn set_reference_power(&self, dbm: f64) {
        self.lock().reference_power_dbm = dbm;
    }

    pub fn set_bay_loss(&self, bay: u16, loss_db: f64) {
        self.lock().bay_loss_db.insert(bay, loss_db);
    }

    pub fn set_frequency(&self, thz: f64) {
        self.lock().frequency_thz = thz;
    }

    pub fn set_smsr(&self, smsr_db: Option<f64>) {
        self.lock().smsr_db = smsr_db;
    }

    /// A frozen switch accepts commands but never changes position.
    pub fn freeze_switch(&self, frozen: bool) {
        self.lock().switch_frozen = frozen;
    }

    pub fn set_route(&self, route: Route) {
        self.lock().route = route;
    }

    pub fn route(&self) -> Route {
        self.lock().route
    }

    pub fn channel(&self) -> u16 {
        self.lock().channel
    }

    /// Fail the next call of `fault`.
    pub fn inject_failure(&self, fault: MockFault) {
        self.lock().faults.insert(fault);
    }

    /// Fail every call of `fault` until [`clear_faults`](Self::clear_faults).
    pub fn inject_persistent_failure(&self, fault: MockFault) {
        self.lock().persistent_faults.insert(fault);
    }

    pub fn clear_faults(&self) {
        let mut state = self.lock();
        state.faults.clear();
        state.persistent_faults.clear();
    }

    /// Get the call log
    pub fn call_log(&self) -> Vec<String> {
        self.lock().call_log.clone()
    }

    pub fn clear_log(&self) {
        self.lock().call_log.clear();
    }

    /// Loss configured for `bay` (2.5 dB unless set).
    pub fn bay_loss(&self, bay: u16) -> f64 {
        self.lock().bay_loss_db.get(&bay).copied().unwrap_or(2.5)
    }

    /// Record `call` and fail if `fault` is armed.
    pub(crate) fn enter(&self, call: String, fault: MockFault) -> StationResult<()> {
        let mut state = self.lock();
        state.call_log.push(call);
        if state.faults.remove(&fault) || state.persistent_faults.contains(&fault) {
            return Err(TransportError::Injected(format!("{:?}", fault)).into());
        }
        Ok(())
    }

    fn received_power(&self, extra_loss: f64) -> f64 {
        let state = self.lock();
        match state.route {
            Route::Direct => state.reference_power_dbm,
            Route::Switched => {
                let loss = state.bay_loss_db.get(&state.channel).copied().unwrap_or(2.5);
                state.reference_power_dbm - loss - extra_loss
            }
        }
    }

    /// Synthetic spectrum: the source line over a -60 dBm floor with one side mode
    /// 45 dB down, 100 GHz above the carrier.
    pub fn spectrum(&self) -> StationResult<SpectrumSample> {
        let (center, peak_dbm, smsr) = {
            let state = self.lock();
            (
                state.frequency_thz,
                state.reference_power_dbm,
                state.smsr_db.unwrap_or(45.0),
            )
        };
        let floor_mw = dbm_to_mw(-60.0);
        let line = |f: f64, at: f64, dbm: f64| {
            let x = (f - at) / 0.004;
            dbm_to_mw(dbm) * (-0.5 * x * x).exp()
        };
        let frequency: Vec<f64> = (0..=600).map(|i| center - 0.3 + i as f64 * 0.001).collect();
        let power: Vec<f64> = frequency
            .iter()
            .map(|&f| mw_to_dbm(floor_mw + line(f, center, peak_dbm) + line(f, center + 0.1, peak_dbm - smsr)))
            .collect();
        Ok(SpectrumSample::new(frequency, power)?)
    }
}

macro_rules! mock_instrument {
    ($ty:ident, $label:literal, $idn:literal) => {
        #[derive(Debug, Clone)]
        pub struct $ty {
            bench: MockBench,
        }

        impl $ty {
            pub fn new(bench: MockBench) -> Self {
                Self { bench }
            }
        }

        #[async_trait]
        impl Instrument for $ty {
            fn name(&self) -> &str {
                $label
            }

            async fn identify(&self) -> StationResult<String> {
                self.bench
                    .enter(format!("{} identify", $label), MockFault::Identify)?;
                Ok($idn.to_string())
            }

            async fn close(&self) -> StationResult<()> {
                self.bench.lock().call_log.push(format!("{} close", $label));
                Ok(())
            }
        }
    };
}

mock_instrument!(MockPowerMeter, "OPM", "MOCK,Power Meter,0,1.0");
mock_instrument!(MockSwitch, "OSW", "MOCK,Optical Switch 1x70,0,1.0");
mock_instrument!(MockWavelengthMeter, "WLM", "MOCK,Wavelength Meter,0,1.0");
mock_instrument!(MockSpectrumAnalyzer, "OSA", "MOCK,Spectrum Analyzer,0,1.0");

#[async_trait]
impl PowerMeter for MockPowerMeter {
    async fn read_power_dbm(&self) -> StationResult<f64> {
        self.bench.enter("OPM read".to_string(), MockFault::OpmRead)?;
        Ok(self.bench.received_power(0.0))
    }

    async fn power_unit(&self) -> StationResult<PowerUnit> {
        Ok(PowerUnit::Dbm)
    }
}

#[async_trait]
impl OpticalSwitch for MockSwitch {
    async fn set_channel(&self, channel: u16) -> StationResult<()> {
        self.bench
            .enter(format!("OSW set {}", channel), MockFault::SwitchSet)?;
        let mut state = self.bench.lock();
        if !state.switch_frozen {
            state.channel = channel;
        }
        Ok(())
    }

    async fn channel(&self) -> StationResult<u16> {
        Ok(self.bench.channel())
    }

    async fn operation_complete(&self) -> StationResult<bool> {
        Ok(true)
    }
}

#[async_trait]
impl WavelengthMeter for MockWavelengthMeter {
    async fn frequency_thz(&self) -> StationResult<f64> {
        self.bench
            .enter("WLM frequency".to_string(), MockFault::WlmFrequency)?;
        Ok(self.bench.lock().frequency_thz)
    }

    async fn power_dbm(&self) -> StationResult<f64> {
        self.bench.enter("WLM power".to_string(), MockFault::WlmPower)?;
        let extra = self.bench.lock().wlm_extra_loss_db;
        Ok(self.bench.received_power(extra))
    }

    async fn smsr_db(&self) -> StationResult<Option<f64>> {
        Ok(self.bench.lock().smsr_db)
    }
}

#[async_trait]
impl SpectrumAnalyzer for MockSpectrumAnalyzer {
    async fn acquire_spectrum(&self) -> StationResult<SpectrumSample> {
        self.bench.enter("OSA spectrum".to_string(), MockFault::Spectrum)?;
        self.bench.spectrum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::spectrum::find_center;

    #[tokio::test]
    async fn test_direct_and_switched_readings() {
        let bench = MockBench::new();
        bench.set_bay_loss(4, 3.25);
        let opm = MockPowerMeter::new(bench.clone());
        let osw = MockSwitch::new(bench.clone());

        assert_eq!(opm.read_power_dbm().await.unwrap(), 3.0);

        bench.set_route(Route::Switched);
        osw.set_channel(4).await.unwrap();
        assert_eq!(osw.channel().await.unwrap(), 4);
        assert!((opm.read_power_dbm().await.unwrap() - (3.0 - 3.25)).abs() < 1e-12);
    }

    #[tokio::test]
    async fn test_frozen_switch_stays_put() {
        let bench = MockBench::new();
        bench.freeze_switch(true);
        let osw = MockSwitch::new(bench.clone());
        osw.set_channel(9).await.unwrap();
        assert_eq!(osw.channel().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_injected_failure_consumed() {
        let bench = MockBench::new();
        let wlm = MockWavelengthMeter::new(bench.clone());
        bench.inject_failure(MockFault::WlmFrequency);
        assert!(wlm.frequency_thz().await.is_err());
        assert_eq!(wlm.frequency_thz().await.unwrap(), 193.4145);
        assert_eq!(bench.call_log(), vec!["WLM frequency", "WLM frequency"]);
    }

    #[tokio::test]
    async fn test_persistent_failure() {
        let bench = MockBench::new();
        let opm = MockPowerMeter::new(bench.clone());
        bench.inject_persistent_failure(MockFault::OpmRead);
        assert!(opm.read_power_dbm().await.is_err());
        assert!(opm.read_power_dbm().await.is_err());
        bench.clear_faults();
        assert!(opm.read_power_dbm().await.is_ok());
    }

    #[tokio::test]
    async fn test_spectrum_centered_on_source() {
        let bench = MockBench::new();
        let osa = MockSpectrumAnalyzer::new(bench.clone());
        let sample = osa.acquire_spectrum().await.unwrap();
        let center = find_center(sample.frequency(), sample.power(), 5.0).unwrap();
        assert!((center.frequency_thz - 193.4145).abs() < 0.002);
    }
}

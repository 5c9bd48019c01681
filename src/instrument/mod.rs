//! Optical instruments of the station
//!
//! Capability traits per role (power meter, switch, wavelength meter, spectrum
//! analyzer), the vendor drivers that implement them over an
//! [`InstrumentTransport`](crate::adapters::InstrumentTransport), a simulated bench,
//! and the factory that opens a full instrument set for a session.

pub mod bristol_wlm;
pub mod capabilities;
pub mod factory;
pub mod keysight_opm;
pub mod mock;
pub mod santec_switch;

pub use bristol_wlm::BristolWavelengthMeter;
pub use capabilities::{
    Instrument, OpticalSwitch, PowerMeter, PowerUnit, SpectrumAnalyzer, WavelengthMeter,
};
pub use factory::{
    ConfiguredFactory, EquipmentReport, EquipmentStatus, InstrumentFactory, MockFactory,
    OpticalInstruments,
};
pub use keysight_opm::KeysightPowerMeter;
pub use mock::{MockBench, MockFault, Route};
pub use santec_switch::SantecSwitch;

use tracing::warn;

/// Lower bound of a plausible C/L-band reading in THz (exclusive)
pub const FREQUENCY_MIN_THZ: f64 = 190.0;
/// Upper bound of a plausible C/L-band reading in THz (exclusive)
pub const FREQUENCY_MAX_THZ: f64 = 197.0;

/// Read the frequency until it falls inside (190, 197) THz.
///
/// At least one attempt is made. Transport errors count as failed attempts. Returns
/// `NaN` when no attempt produced a plausible value.
pub async fn read_frequency_with_retry<W: WavelengthMeter + ?Sized>(wlm: &W, retries: u32) -> f64 {
    let attempts = retries.max(1);
    for attempt in 1..=attempts {
        match wlm.frequency_thz().await {
            Ok(f) if f > FREQUENCY_MIN_THZ && f < FREQUENCY_MAX_THZ => return f,
            Ok(f) => warn!(attempt, frequency_thz = f, "Implausible frequency reading"),
            Err(e) => warn!(attempt, error = %e, "Frequency read failed"),
        }
    }
    f64::NAN
}

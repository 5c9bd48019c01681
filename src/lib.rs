//! Core library for the optical path-loss calibration station.
//!
//! The station calibrates per-bay optical path loss using instruments that are shared
//! between independently running station processes. The library is split along the
//! same lines as the procedure itself:
//!
//! - [`adapters`]: the generic command transport every instrument driver talks through
//! - [`instrument`]: capability traits per instrument role and the vendor drivers
//! - [`hardware`]: the cross-process instrument lease and the session built on it
//! - [`data`]: spectral algorithms, the fixed-width calibration ledger, chart export
//! - [`sequencer`]: the ordered step runner with abort and failure propagation
//! - [`calibration`]: the run context, calibration steps and the procedure builder
//!
//! The binary in `src/main.rs` is a thin CLI over these modules.

pub mod adapters;
pub mod calibration;
pub mod config;
pub mod data;
pub mod error;
pub mod hardware;
pub mod instrument;
pub mod logging;
pub mod sequencer;

pub use error::{StationError, StationResult};

/// Timestamp format shared by the ledger, the audit log and file names.
pub const TIMESTAMP_FORMAT: &str = "%Y-%m-%d_%H-%M-%S";

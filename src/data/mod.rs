//! Data processing and storage modules.
//!
//! - [`spectrum`]: spectral algorithms (centre, OSNR, SMSR)
//! - [`ledger`]: the fixed-width calibration ledger
//! - [`control_chart`]: CSV export of path loss across iterations

pub mod control_chart;
pub mod ledger;
pub mod spectrum;

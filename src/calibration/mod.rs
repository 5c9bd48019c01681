//! Optical path-loss calibration
//!
//! The run context, the limit checks, the steps that read the instruments and the
//! builder that assembles them into a procedure for the sequencer.

pub mod context;
pub mod limits;
pub mod procedure;
pub mod prompt;
pub mod steps;

pub use context::{BayReadings, RunContext};
pub use limits::{tolerance_window, verify_limit, verify_window};
pub use procedure::build_procedure;
pub use prompt::{AutoConfirm, OperatorPrompt};
pub use steps::{CalibrationStation, CalibrationStep, StepKind, POWER_END_LIMIT};

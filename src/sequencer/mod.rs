//! Ordered step execution
//!
//! The sequencer owns a step list built before the run and executes it once against a
//! run context, recording a [`StepOutcome`] per step. See [`runner`] for the failure
//! and abort rules and [`status`] for the indicator model driven by its events.

pub mod runner;
pub mod status;
pub mod step;

pub use runner::{
    CompletedRun, RunReport, Sequencer, SequencerEvents, SequencerHandle, StepEvent, StepFault,
    StepRecord,
};
pub use status::{Indicator, StatusBoard, StepStatus};
pub use step::{step_fn, FailFlag, FnStep, Step, StepAction, StepOutcome};

use serde::Serialize;
use thiserror::Error;

/// Lifecycle of one sequencer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum SequencerState {
    Idle,
    Running,
    Completed,
    Aborted,
}

#[derive(Error, Debug)]
pub enum SequencerError {
    #[error("Sequencer is {0:?}; steps can only be added or run while idle")]
    NotIdle(SequencerState),
}

//! Step and bay indicators
//!
//! A display-independent model of the run's status lights. It is fed from the
//! sequencer's progress events and closed with the terminal [`RunReport`].

use serde::Serialize;
use std::collections::BTreeMap;

use crate::sequencer::runner::{RunReport, StepEvent};
use crate::sequencer::step::Step;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Indicator {
    Idle,
    Running,
    Passed,
    Failed,
}

/// One step indicator
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StepStatus {
    pub index: usize,
    pub name: String,
    pub indicator: Indicator,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct StatusBoard {
    steps: Vec<StepStatus>,
    bays: BTreeMap<u16, Indicator>,
}

impl StatusBoard {
    /// Indicators for every triggering step and every bay a step is attributed to.
    pub fn for_steps<C>(steps: &[Step<C>]) -> Self {
        let mut board = Self::default();
        for (index, step) in steps.iter().enumerate() {
            if step.trigger() {
                board.steps.push(StepStatus {
                    index,
                    name: step.name().to_string(),
                    indicator: Indicator::Idle,
                });
            }
            if let Some(bay) = step.bay() {
                board.bays.insert(bay, Indicator::Idle);
            }
        }
        board
    }

    pub fn steps(&self) -> &[StepStatus] {
        &self.steps
    }

    pub fn step(&self, index: usize) -> Option<Indicator> {
        self.steps
            .iter()
            .find(|s| s.index == index)
            .map(|s| s.indicator)
    }

    pub fn bay(&self, bay: u16) -> Option<Indicator> {
        self.bays.get(&bay).copied()
    }

    pub fn bays(&self) -> &BTreeMap<u16, Indicator> {
        &self.bays
    }

    fn set_step(&mut self, index: usize, indicator: Indicator) {
        if let Some(status) = self.steps.iter_mut().find(|s| s.index == index) {
            status.indicator = indicator;
        }
    }

    /// A failed bay stays failed for the rest of the run.
    fn set_bay(&mut self, bay: u16, indicator: Indicator) {
        if let Some(current) = self.bays.get_mut(&bay) {
            if *current != Indicator::Failed {
                *current = indicator;
            }
        }
    }

    pub fn apply(&mut self, event: &StepEvent) {
        match event {
            StepEvent::Started { index, bay, .. } => {
                self.set_step(*index, Indicator::Running);
                if let Some(bay) = bay {
                    self.set_bay(*bay, Indicator::Running);
                }
            }
            StepEvent::Finished {
                index,
                bay,
                trigger,
                outcome,
                ..
            } => {
                let indicator = if outcome.is_passed() {
                    Indicator::Passed
                } else {
                    Indicator::Failed
                };
                if *trigger {
                    self.set_step(*index, indicator);
                }
                if let Some(bay) = bay {
                    self.set_bay(*bay, indicator);
                }
            }
        }
    }

    /// Close the board. With the run-wide fail flag set, every indicator that is not
    /// already passed renders as failed.
    pub fn finish(&mut self, report: &RunReport) {
        if !report.failed {
            return;
        }
        for status in &mut self.steps {
            if status.indicator != Indicator::Passed {
                status.indicator = Indicator::Failed;
            }
        }
        for indicator in self.bays.values_mut() {
            if *indicator != Indicator::Passed {
                *indicator = Indicator::Failed;
            }
        }
    }
}

//! Step sequencer
//!
//! Runs a fixed step list in insertion order against one run context. A failing step
//! never stops the run: its error (or panic) is caught, logged and recorded, and the
//! next step starts. The cooperative abort flag is checked before each step; once set,
//! every remaining step is recorded [`StepOutcome::NotRun`] without executing.
//!
//! The caller observes the run through three one-way channels:
//!
//! - progress: a [`StepEvent`] when each step starts and finishes
//! - result: the [`RunReport`], delivered exactly once when the run ends
//! - faults: a [`StepFault`] for every step that panicked
//!
//! The progress and fault channels close when the run ends.

use futures::FutureExt;
use serde::Serialize;
use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::sequencer::step::{FailFlag, Step, StepOutcome};
use crate::sequencer::{SequencerError, SequencerState};

/// Progress notification
#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum StepEvent {
    Started {
        index: usize,
        name: String,
        bay: Option<u16>,
    },
    Finished {
        index: usize,
        name: String,
        bay: Option<u16>,
        trigger: bool,
        outcome: StepOutcome,
    },
}

/// A step that panicked
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StepFault {
    pub index: usize,
    pub name: String,
    pub message: String,
}

/// Recorded outcome of one step
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StepRecord {
    pub index: usize,
    pub name: String,
    pub bay: Option<u16>,
    pub trigger: bool,
    pub outcome: StepOutcome,
    #[serde(with = "duration_ms")]
    pub elapsed: Duration,
}

/// Terminal result of a run
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RunReport {
    pub state: SequencerState,
    pub steps: Vec<StepRecord>,
    /// Run-wide fail flag as the run ended
    pub failed: bool,
}

impl RunReport {
    pub fn outcome(&self, index: usize) -> Option<&StepOutcome> {
        self.steps.get(index).map(|r| &r.outcome)
    }

    pub fn passed_count(&self) -> usize {
        self.steps.iter().filter(|r| r.outcome.is_passed()).count()
    }

    pub fn failed_count(&self) -> usize {
        self.steps.len() - self.passed_count()
    }

    pub fn is_success(&self) -> bool {
        self.state == SequencerState::Completed && !self.failed
    }
}

mod duration_ms {
    use serde::Serializer;
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }
}

/// Receivers for the three notification channels
pub struct SequencerEvents {
    pub progress: mpsc::UnboundedReceiver<StepEvent>,
    pub result: oneshot::Receiver<RunReport>,
    pub faults: mpsc::UnboundedReceiver<StepFault>,
}

/// Abort trigger usable from any task
#[derive(Debug, Clone, Default)]
pub struct SequencerHandle {
    abort: Arc<AtomicBool>,
}

impl SequencerHandle {
    /// Stop scheduling further steps. The step in flight finishes normally.
    pub fn abort(&self) {
        if !self.abort.swap(true, Ordering::SeqCst) {
            warn!("Sequencer abort requested");
        }
    }

    pub fn is_aborted(&self) -> bool {
        self.abort.load(Ordering::SeqCst)
    }
}

/// A finished run handed back by [`Sequencer::spawn`]
pub struct CompletedRun<C> {
    pub report: RunReport,
    pub context: C,
    pub sequencer: Sequencer<C>,
}

/// Ordered step runner
pub struct Sequencer<C> {
    state: SequencerState,
    steps: Vec<Step<C>>,
    handle: SequencerHandle,
    progress_tx: Option<mpsc::UnboundedSender<StepEvent>>,
    result_tx: Option<oneshot::Sender<RunReport>>,
    fault_tx: Option<mpsc::UnboundedSender<StepFault>>,
}

impl<C> Default for Sequencer<C> {
    fn default() -> Self {
        Self {
            state: SequencerState::Idle,
            steps: Vec::new(),
            handle: SequencerHandle::default(),
            progress_tx: None,
            result_tx: None,
            fault_tx: None,
        }
    }
}

impl<C> Sequencer<C> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self) -> SequencerState {
        self.state
    }

    pub fn steps(&self) -> &[Step<C>] {
        &self.steps
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    pub fn handle(&self) -> SequencerHandle {
        self.handle.clone()
    }

    /// Append a step. Only valid while idle.
    pub fn add_step(&mut self, step: Step<C>) -> Result<(), SequencerError> {
        if self.state != SequencerState::Idle {
            return Err(SequencerError::NotIdle(self.state));
        }
        self.steps.push(step);
        Ok(())
    }

    /// Open the notification channels, replacing any earlier subscription.
    pub fn subscribe(&mut self) -> SequencerEvents {
        let (progress_tx, progress) = mpsc::unbounded_channel();
        let (result_tx, result) = oneshot::channel();
        let (fault_tx, faults) = mpsc::unbounded_channel();
        self.progress_tx = Some(progress_tx);
        self.result_tx = Some(result_tx);
        self.fault_tx = Some(fault_tx);
        SequencerEvents {
            progress,
            result,
            faults,
        }
    }

    fn emit(&self, event: StepEvent) {
        if let Some(tx) = &self.progress_tx {
            // A dropped receiver only means nobody is watching.
            let _ = tx.send(event);
        }
    }

    fn fault(&self, fault: StepFault) {
        if let Some(tx) = &self.fault_tx {
            let _ = tx.send(fault);
        }
    }
}

impl<C: FailFlag + Send> Sequencer<C> {
    /// Run every step once, in order.
    ///
    /// Any failed or skipped step sets the context's fail flag. Errors are only
    /// returned when the sequencer is not idle.
    pub async fn run(&mut self, ctx: &mut C) -> Result<RunReport, SequencerError> {
        if self.state != SequencerState::Idle {
            return Err(SequencerError::NotIdle(self.state));
        }
        self.state = SequencerState::Running;
        info!(steps = self.steps.len(), "Sequencer started");

        let mut records = Vec::with_capacity(self.steps.len());
        for (index, step) in self.steps.iter().enumerate() {
            let started = Instant::now();
            let outcome = if self.handle.is_aborted() {
                StepOutcome::NotRun
            } else {
                self.emit(StepEvent::Started {
                    index,
                    name: step.name().to_string(),
                    bay: step.bay(),
                });
                let result = AssertUnwindSafe(step.action().run(ctx))
                    .catch_unwind()
                    .await;
                match result {
                    Ok(Ok(())) => StepOutcome::Passed,
                    Ok(Err(e)) => {
                        warn!(step = step.name(), index, error = %e, "Step failed");
                        StepOutcome::Failed(e.to_string())
                    }
                    Err(payload) => {
                        let message = panic_message(payload.as_ref());
                        error!(step = step.name(), index, panic = %message, "Step panicked");
                        self.fault(StepFault {
                            index,
                            name: step.name().to_string(),
                            message: message.clone(),
                        });
                        StepOutcome::Failed(format!("panicked: {}", message))
                    }
                }
            };

            if outcome.is_failure() {
                ctx.set_fail();
            }
            if outcome.is_passed() {
                info!(step = step.name(), index, "Step passed");
            }
            self.emit(StepEvent::Finished {
                index,
                name: step.name().to_string(),
                bay: step.bay(),
                trigger: step.trigger(),
                outcome: outcome.clone(),
            });
            records.push(StepRecord {
                index,
                name: step.name().to_string(),
                bay: step.bay(),
                trigger: step.trigger(),
                outcome,
                elapsed: started.elapsed(),
            });
        }

        self.state = if self.handle.is_aborted() {
            SequencerState::Aborted
        } else {
            SequencerState::Completed
        };
        let report = RunReport {
            state: self.state,
            steps: records,
            failed: ctx.fail(),
        };
        info!(
            state = ?report.state,
            passed = report.passed_count(),
            failed = report.failed_count(),
            fail_flag = report.failed,
            "Sequencer finished"
        );
        if let Some(tx) = self.result_tx.take() {
            let _ = tx.send(report.clone());
        }
        // closes the progress and fault channels for the subscriber
        self.progress_tx = None;
        self.fault_tx = None;
        Ok(report)
    }
}

impl<C: FailFlag + Send + 'static> Sequencer<C> {
    /// Run on a dedicated tokio task; the sequencer and context come back with the
    /// report.
    pub fn spawn(mut self, mut ctx: C) -> JoinHandle<Result<CompletedRun<C>, SequencerError>> {
        tokio::spawn(async move {
            let report = self.run(&mut ctx).await?;
            Ok(CompletedRun {
                report,
                context: ctx,
                sequencer: self,
            })
        })
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

//! Sequencer steps
//!
//! A [`Step`] is a named action bound to its arguments at build time. Steps run one at
//! a time against a mutable run context `C`; the context is the only state they share.

use async_trait::async_trait;
use futures::future::BoxFuture;
use serde::Serialize;
use std::fmt;

use crate::StationResult;

/// Run-wide failure flag carried by the run context
///
/// Once set it stays set for the rest of the run.
pub trait FailFlag {
    fn fail(&self) -> bool;

    fn set_fail(&mut self);
}

/// The work a step performs
#[async_trait]
pub trait StepAction<C>: Send + Sync {
    async fn run(&self, ctx: &mut C) -> StationResult<()>;
}

/// A [`StepAction`] backed by a closure, see [`step_fn`].
pub struct FnStep<F> {
    f: F,
}

/// Wrap a closure returning a boxed future as a [`StepAction`].
///
/// ```rust,ignore
/// use futures::FutureExt;
///
/// let action = step_fn(|ctx: &mut RunContext| async move {
///     ctx.set_fail();
///     Ok(())
/// }.boxed());
/// ```
pub fn step_fn<C, F>(f: F) -> FnStep<F>
where
    C: Send,
    F: for<'a> Fn(&'a mut C) -> BoxFuture<'a, StationResult<()>> + Send + Sync,
{
    FnStep { f }
}

#[async_trait]
impl<C, F> StepAction<C> for FnStep<F>
where
    C: Send,
    F: for<'a> Fn(&'a mut C) -> BoxFuture<'a, StationResult<()>> + Send + Sync,
{
    async fn run(&self, ctx: &mut C) -> StationResult<()> {
        (self.f)(ctx).await
    }
}

/// One entry of the step list
pub struct Step<C> {
    name: String,
    bay: Option<u16>,
    trigger: bool,
    action: Box<dyn StepAction<C>>,
}

impl<C> Step<C> {
    pub fn new(name: impl Into<String>, action: impl StepAction<C> + 'static) -> Self {
        Self {
            name: name.into(),
            bay: None,
            trigger: true,
            action: Box::new(action),
        }
    }

    /// Attribute the step to a bay indicator.
    pub fn for_bay(mut self, bay: u16) -> Self {
        self.bay = Some(bay);
        self
    }

    /// Keep the step off the step indicators. It still runs and is recorded.
    pub fn silent(mut self) -> Self {
        self.trigger = false;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn bay(&self) -> Option<u16> {
        self.bay
    }

    /// Whether the step drives a step indicator.
    pub fn trigger(&self) -> bool {
        self.trigger
    }

    pub(crate) fn action(&self) -> &dyn StepAction<C> {
        self.action.as_ref()
    }
}

impl<C> fmt::Debug for Step<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Step")
            .field("name", &self.name)
            .field("bay", &self.bay)
            .field("trigger", &self.trigger)
            .finish_non_exhaustive()
    }
}

/// Recorded result of one step
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "outcome", content = "reason")]
pub enum StepOutcome {
    Passed,
    /// The action ran and returned an error or panicked
    Failed(String),
    /// The action never ran because the run was aborted
    NotRun,
}

impl StepOutcome {
    pub fn is_passed(&self) -> bool {
        matches!(self, StepOutcome::Passed)
    }

    /// Both `Failed` and `NotRun` count as failures.
    pub fn is_failure(&self) -> bool {
        !self.is_passed()
    }
}

impl fmt::Display for StepOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StepOutcome::Passed => write!(f, "passed"),
            StepOutcome::Failed(reason) => write!(f, "failed: {}", reason),
            StepOutcome::NotRun => write!(f, "not run"),
        }
    }
}

//! Step sequencer.
//!
//! Runs a [`Plan`] against a [`PipettorActuator`], one waited command at a time. After a
//! step completes and the device reports clear error codes, the step's effect is applied
//! to the deck and pipettor state. The first failing step stops the run; every earlier
//! step stays applied. With a [`RunControl`] attached, pause and abort requests are
//! honoured before each step.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::Instrument;

use crate::engine::control::RunControl;
use crate::engine::plan::{Action, Effect, ItemTransfer, Plan, PlannedStep};
use crate::error::{ContentError, HardwareError, HardwareErrorKind};
use crate::hardware::PipettorActuator;
use crate::labware::{Deck, ItemAddress, VOLUME_TOLERANCE};
use crate::pipettor::PipettorState;

/// A step that ran to completion.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CompletedStep {
    /// Zero-based index into the plan.
    pub index: usize,
    /// Action the device completed.
    pub action: Action,
    /// When the device reported completion.
    pub completed_at: DateTime<Utc>,
}

/// Why a step failed.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "cause", rename_all = "snake_case")]
pub enum FailureCause {
    /// The device rejected or failed the command, or reported non-zero codes after it.
    Device(HardwareError),
    /// The device completed the step but the labware model could not record it.
    State { message: String },
}

impl std::fmt::Display for FailureCause {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FailureCause::Device(err) => write!(f, "{err}"),
            FailureCause::State { message } => write!(f, "state update failed: {message}"),
        }
    }
}

/// The step that failed and its cause.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StepFailure {
    /// Zero-based index of the failed step.
    pub index: usize,
    /// The action the device was asked to perform.
    pub action: Action,
    /// Why the step failed.
    pub cause: FailureCause,
}

/// Outcome of running one plan.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ExecutionReport {
    /// Name of the executed operation.
    pub operation: String,
    /// Steps in the plan, run or not.
    pub total_steps: usize,
    completed: Vec<CompletedStep>,
    failure: Option<StepFailure>,
    /// First step not run because the run was aborted.
    #[serde(skip_serializing_if = "Option::is_none")]
    aborted_at: Option<usize>,
    /// When the first step was issued.
    pub started_at: DateTime<Utc>,
    /// When the run stopped, successfully or not.
    pub finished_at: DateTime<Utc>,
}

impl ExecutionReport {
    fn start(plan: &Plan) -> Self {
        let now = Utc::now();
        Self {
            operation: plan.operation.clone(),
            total_steps: plan.len(),
            completed: Vec::with_capacity(plan.len()),
            failure: None,
            aborted_at: None,
            started_at: now,
            finished_at: now,
        }
    }

    /// Steps applied to the deck and pipettor, in order.
    pub fn completed(&self) -> &[CompletedStep] {
        &self.completed
    }

    /// The step that stopped the run, if one failed.
    pub fn failure(&self) -> Option<&StepFailure> {
        self.failure.as_ref()
    }

    /// Index of the first step skipped by an abort.
    pub fn aborted_at(&self) -> Option<usize> {
        self.aborted_at
    }

    /// The run stopped on an abort request.
    pub fn is_aborted(&self) -> bool {
        self.aborted_at.is_some()
    }

    /// Every step ran.
    pub fn is_success(&self) -> bool {
        self.failure.is_none() && self.aborted_at.is_none()
    }

    /// Steps never attempted because of an earlier failure or an abort.
    pub fn not_attempted(&self) -> usize {
        self.total_steps
            .saturating_sub(self.completed.len())
            .saturating_sub(usize::from(self.failure.is_some()))
    }
}

/// Drives plans against one actuator.
pub struct Sequencer<'a> {
    actuator: &'a dyn PipettorActuator,
    control: Option<&'a RunControl>,
}

impl<'a> Sequencer<'a> {
    /// A sequencer that ignores run control.
    pub fn new(actuator: &'a dyn PipettorActuator) -> Self {
        Self {
            actuator,
            control: None,
        }
    }

    /// Check `control` for pause and abort requests before each step.
    pub fn with_control(mut self, control: &'a RunControl) -> Self {
        self.control = Some(control);
        self
    }

    /// Run every step of `plan` in order.
    pub async fn execute(
        &self,
        plan: &Plan,
        deck: &mut Deck,
        pipettor: &mut PipettorState,
    ) -> ExecutionReport {
        let span = tracing::info_span!("execute", operation = %plan.operation, steps = plan.len());
        self.run(plan, deck, pipettor).instrument(span).await
    }

    async fn run(
        &self,
        plan: &Plan,
        deck: &mut Deck,
        pipettor: &mut PipettorState,
    ) -> ExecutionReport {
        let mut report = ExecutionReport::start(plan);

        for (index, step) in plan.steps.iter().enumerate() {
            if let Some(control) = self.control {
                if control.checkpoint().await.is_err() {
                    tracing::warn!(step = index, completed = report.completed.len(), "Plan aborted");
                    report.aborted_at = Some(index);
                    break;
                }
            }
            tracing::debug!(step = index, action = %step.action, "Issuing step");

            if let Err(err) = self.issue(&step.action).await {
                tracing::error!(step = index, action = %step.action, error = %err, "Step failed");
                report.failure = Some(StepFailure {
                    index,
                    action: step.action.clone(),
                    cause: FailureCause::Device(err),
                });
                break;
            }

            if let Err(err) = apply(step, deck, pipettor) {
                tracing::error!(step = index, action = %step.action, error = %err, "State update failed");
                report.failure = Some(StepFailure {
                    index,
                    action: step.action.clone(),
                    cause: FailureCause::State {
                        message: err.to_string(),
                    },
                });
                break;
            }

            report.completed.push(CompletedStep {
                index,
                action: step.action.clone(),
                completed_at: Utc::now(),
            });
        }

        report.finished_at = Utc::now();
        if report.is_success() {
            tracing::info!(steps = report.completed.len(), "Plan executed");
        }
        report
    }

    /// Issue one action with wait semantics and check the device codes afterwards.
    async fn issue(&self, action: &Action) -> Result<(), HardwareError> {
        let device = self.actuator;
        match *action {
            Action::MoveXy { x, y } => device.move_xy(x, y, true).await?,
            Action::MoveZ { z } => device.move_z(z, true).await?,
            Action::MoveToSurface { limit, distance } => {
                device.move_to_surface(limit, distance, true).await?
            }
            Action::PickTip { z_limit } => device.pick_tip(z_limit, true).await?,
            Action::EjectTip => device.eject_tip(true).await?,
            Action::Aspirate { volume } => device.aspirate(volume, true).await?,
            Action::Dispense { volume } => device.dispense(volume, true).await?,
        }
        let codes = device.error_codes();
        if codes.is_clear() {
            Ok(())
        } else {
            Err(HardwareError::new(
                HardwareErrorKind::CommandFailed,
                codes,
                format!("device reported errors after {action}"),
            ))
        }
    }
}

/// Apply a completed step to the pipettor and deck.
fn apply(step: &PlannedStep, deck: &mut Deck, pipettor: &mut PipettorState) -> Result<(), StateError> {
    match step.action {
        Action::PickTip { .. } => pipettor.attach_tips(),
        Action::EjectTip => {
            let leftover = pipettor.detach_tips();
            if leftover > VOLUME_TOLERANCE {
                tracing::warn!(volume = leftover, "Tips ejected while holding liquid");
            }
        }
        Action::Aspirate { volume } => pipettor.piston_in(volume)?,
        Action::Dispense { volume } => pipettor.piston_out(volume)?,
        Action::MoveXy { .. } | Action::MoveZ { .. } | Action::MoveToSurface { .. } => {}
    }

    match &step.effect {
        Effect::None | Effect::Mix | Effect::DropTips => Ok(()),
        Effect::TakeTips(items) => set_tip_flags(deck, items, true),
        Effect::StowTips(items) => set_tip_flags(deck, items, false),
        Effect::Draw(transfers) => transfers
            .iter()
            .try_for_each(|t| draw(deck, pipettor, t)),
        Effect::Deposit(transfers) => transfers
            .iter()
            .try_for_each(|t| deposit(deck, pipettor, t)),
    }
}

#[derive(Debug, thiserror::Error)]
enum StateError {
    #[error("no item at {0}")]
    MissingItem(ItemAddress),
    #[error("tip: {0}")]
    Tip(#[from] ContentError),
    #[error("{item}: {source}")]
    Content {
        item: ItemAddress,
        source: ContentError,
    },
}

fn set_tip_flags(deck: &mut Deck, items: &[ItemAddress], has_tip: bool) -> Result<(), StateError> {
    for address in items {
        let holder = deck
            .labware_mut(&address.labware)
            .ok()
            .and_then(|l| l.holder_at_mut(address.position))
            .ok_or_else(|| StateError::MissingItem(address.clone()))?;
        holder.has_tip = has_tip;
    }
    Ok(())
}

fn draw(deck: &mut Deck, pipettor: &mut PipettorState, transfer: &ItemTransfer) -> Result<(), StateError> {
    let content = deck
        .labware_mut(&transfer.item.labware)
        .ok()
        .and_then(|l| l.content_at_mut(transfer.item.position))
        .ok_or_else(|| StateError::MissingItem(transfer.item.clone()))?;
    let total = transfer.total();
    // An empty source still delivers its volume to the tip, untracked.
    let removed = if content.is_empty() {
        BTreeMap::new()
    } else {
        content
            .remove(total.min(content.total()))
            .map_err(|source| StateError::Content {
                item: transfer.item.clone(),
                source,
            })?
    };

    let share = 1.0 / transfer.channels.len().max(1) as f64;
    let portion: BTreeMap<String, f64> = removed
        .into_iter()
        .map(|(kind, volume)| (kind, volume * share))
        .collect();
    for channel in &transfer.channels {
        pipettor
            .load_channel(*channel, &portion)
            .map_err(|source| StateError::Content {
                item: transfer.item.clone(),
                source,
            })?;
    }
    Ok(())
}

fn deposit(deck: &mut Deck, pipettor: &mut PipettorState, transfer: &ItemTransfer) -> Result<(), StateError> {
    let mut incoming: BTreeMap<String, f64> = BTreeMap::new();
    for channel in &transfer.channels {
        let portion = pipettor
            .unload_channel(*channel, transfer.volume_per_channel)
            .map_err(|source| StateError::Content {
                item: transfer.item.clone(),
                source,
            })?;
        for (kind, volume) in portion {
            *incoming.entry(kind).or_insert(0.0) += volume;
        }
    }
    let content = deck
        .labware_mut(&transfer.item.labware)
        .ok()
        .and_then(|l| l.content_at_mut(transfer.item.position))
        .ok_or_else(|| StateError::MissingItem(transfer.item.clone()))?;
    content
        .add_all(&incoming)
        .map_err(|source| StateError::Content {
            item: transfer.item.clone(),
            source,
        })
}

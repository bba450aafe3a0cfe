//! Single-flow execution engine.
//!
//! The [`Engine`] owns one pipettor connection, the deck it is bound to and the simulated
//! pipettor state. Every request runs the same pipeline:
//!
//! ```text
//! Operation ──► Validator ──► Planner ──► Sequencer ──► ExecutionReport
//!                 (deck + pipettor, read)       (deck + pipettor, written)
//! ```
//!
//! At most one operation or workflow is in flight at a time. A second submission while one
//! is running is rejected with [`PipettorError::Busy`], never queued.
//!
//! A run in flight can be paused, resumed or aborted from another task through
//! [`Engine::pause`], [`Engine::resume`] and [`Engine::abort`]. Requests take effect
//! between device commands; an abort parks the head at the origin and keeps every step
//! already applied.
//!
//! Editing the deck through [`Engine::edit_deck`] invalidates the binding between the
//! connection and the deck; submissions fail with [`PipettorError::StaleDeck`] until
//! [`Engine::rebind`] is called.

pub mod control;
pub mod plan;
pub mod planner;
pub mod remap;
pub mod sequencer;
pub mod validator;

use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;
use serde::Serialize;

pub use control::{RunControl, RunRequest};
pub use plan::{Action, BatchKind, BatchRecord, Effect, ItemTransfer, Plan, PlannedStep};
pub use planner::{batch_limit, split_trips, Planner};
pub use remap::{MissingLabware, RemapReport, TypeConflict};
pub use sequencer::{CompletedStep, ExecutionReport, FailureCause, Sequencer, StepFailure};
pub use validator::{holder_partition, HolderPartition, TipAction, TipLedger, Validator};

use crate::config::{PipettorConfig, SpeedSettings};
use crate::error::{AppResult, PipettorError, ValidationFailure, ValidationReason};
use crate::hardware::{
    Axis, Connection, MovementSpeed, PipettorActuator, PistonDirection, PistonSpeed,
};
use crate::labware::{Deck, LabwareId};
use crate::operation::Operation;
use crate::pipettor::PipettorState;
use crate::workflow::{Workflow, WorkflowEntry, WorkflowProgress, WorkflowResult, WorkflowStatus};

/// What the engine is doing right now.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum EngineState {
    Idle,
    Homing,
    Executing { operation: String },
    RunningWorkflow { name: String, index: usize },
    /// A run parked at a checkpoint; `during` describes what it was doing.
    Paused { during: String },
    EditingDeck,
}

impl fmt::Display for EngineState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EngineState::Idle => f.write_str("idle"),
            EngineState::Homing => f.write_str("homing"),
            EngineState::Executing { operation } => write!(f, "executing {operation}"),
            EngineState::RunningWorkflow { name, index } => {
                write!(f, "running workflow '{name}' at operation {}", index + 1)
            }
            EngineState::Paused { during } => write!(f, "paused while {during}"),
            EngineState::EditingDeck => f.write_str("editing deck"),
        }
    }
}

/// How a workflow run treats unresolved labware and where it starts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RunPolicy {
    /// Run the operations that resolve and skip the rest instead of refusing the workflow.
    pub allow_partial: bool,
    /// Index of the first operation to run; earlier ones count as already completed.
    pub start_from: usize,
}

/// Device state as polled directly from the actuator.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct DeviceStatus {
    /// `None` when the device reports a position as unavailable.
    pub x: Option<f64>,
    pub y: Option<f64>,
    pub z: Option<f64>,
    pub tip_attached: bool,
}

struct Session {
    deck: Deck,
    pipettor: PipettorState,
    bound_revision: u64,
}

impl Session {
    fn check_bound(&self) -> AppResult<()> {
        let current = self.deck.revision();
        if current == self.bound_revision {
            Ok(())
        } else {
            Err(PipettorError::StaleDeck {
                bound: self.bound_revision,
                current,
            })
        }
    }

    fn validate(&self, op: &Operation) -> AppResult<()> {
        Validator::new(&self.deck, &self.pipettor).validate(op)
    }

    fn plan(&self, op: &Operation) -> AppResult<Plan> {
        self.validate(op)?;
        Planner::new(&self.deck, &self.pipettor).plan(op)
    }
}

/// Resets the activity to idle when dropped.
struct Activity<'a>(&'a Mutex<EngineState>);

impl<'a> Activity<'a> {
    fn begin(state: &'a Mutex<EngineState>, activity: EngineState) -> Self {
        *state.lock() = activity;
        Self(state)
    }

    fn update(&self, activity: EngineState) {
        *self.0.lock() = activity;
    }
}

impl Drop for Activity<'_> {
    fn drop(&mut self) {
        *self.0.lock() = EngineState::Idle;
    }
}

/// A connected pipettor bound to a deck.
pub struct Engine {
    connection: Connection,
    session: tokio::sync::Mutex<Session>,
    state: Mutex<EngineState>,
    control: RunControl,
    progress: Mutex<Option<WorkflowProgress>>,
}

impl Engine {
    /// Open `actuator`, apply the configured speeds and bind `deck`.
    ///
    /// The pipettor starts without a tip unless the device reports one attached. Homing is
    /// left to [`Engine::home`].
    pub async fn connect(
        actuator: Arc<dyn PipettorActuator>,
        deck: Deck,
        config: &PipettorConfig,
    ) -> AppResult<Self> {
        config.validate().map_err(PipettorError::Config)?;
        if actuator.channel_count() != config.channel_count() {
            return Err(PipettorError::Config(format!(
                "device '{}' drives {} channels, configuration expects {}",
                actuator.name(),
                actuator.channel_count(),
                config.channel_count()
            )));
        }
        deck.validate_layout()?;

        let connection = Connection::open(actuator)?;
        apply_speeds(connection.actuator(), &config.speeds).await?;

        let mut pipettor = PipettorState::from_config(config);
        if connection.actuator().tip_attached().await? {
            tracing::warn!("Device reports a tip attached at connection time");
            pipettor.attach_tips();
        }

        let bound_revision = deck.revision();
        tracing::info!(
            deck = %deck.id,
            revision = bound_revision,
            channels = pipettor.channel_count(),
            tip_capacity = pipettor.tip_capacity(),
            "Engine ready"
        );
        Ok(Self {
            connection,
            session: tokio::sync::Mutex::new(Session {
                deck,
                pipettor,
                bound_revision,
            }),
            state: Mutex::new(EngineState::Idle),
            control: RunControl::new(),
            progress: Mutex::new(None),
        })
    }

    /// What the engine is doing; [`EngineState::Paused`] while a run is parked.
    pub fn state(&self) -> EngineState {
        let state = self.state.lock().clone();
        if self.control.is_parked() {
            EngineState::Paused {
                during: state.to_string(),
            }
        } else {
            state
        }
    }

    /// Pause the run in flight before its next device command.
    ///
    /// Returns false if a pause or abort is already pending.
    pub fn pause(&self) -> bool {
        let accepted = self.control.pause();
        if accepted {
            tracing::info!(state = %self.state.lock(), "Pause requested");
        }
        accepted
    }

    /// Let a paused run continue. Returns false if nothing was paused.
    pub fn resume(&self) -> bool {
        let accepted = self.control.resume();
        if accepted {
            tracing::info!("Run resumed");
        }
        accepted
    }

    /// Stop the run in flight before its next device command, even while paused.
    pub fn abort(&self) {
        tracing::warn!(state = %self.state.lock(), "Abort requested");
        self.control.abort();
    }

    /// True while a run is parked by [`Engine::pause`].
    pub fn is_paused(&self) -> bool {
        self.control.is_parked()
    }

    /// Progress of the current workflow run, or of the last one if none is running.
    pub fn workflow_progress(&self) -> Option<WorkflowProgress> {
        let mut progress = self.progress.lock().clone()?;
        if progress.status == WorkflowStatus::Running && self.control.is_parked() {
            progress.status = WorkflowStatus::Paused;
        }
        Some(progress)
    }

    pub fn is_connected(&self) -> bool {
        self.connection.is_open()
    }

    fn session(&self) -> AppResult<tokio::sync::MutexGuard<'_, Session>> {
        self.session.try_lock().map_err(|_| PipettorError::Busy {
            state: self.state.lock().to_string(),
        })
    }

    /// Home every axis.
    pub async fn home(&self) -> AppResult<()> {
        let _session = self.session()?;
        let _activity = Activity::begin(&self.state, EngineState::Homing);
        self.connection.actuator().initialize().await?;
        tracing::info!("Pipettor homed");
        Ok(())
    }

    /// Poll positions and tip state. Does not take the engine, so it works mid-run.
    pub async fn device_status(&self) -> AppResult<DeviceStatus> {
        let device = self.connection.actuator();
        let (x, y, z, tip_attached) = futures::try_join!(
            device.position(Axis::X),
            device.position(Axis::Y),
            device.position(Axis::Z),
            device.tip_attached(),
        )?;
        Ok(DeviceStatus {
            x,
            y,
            z,
            tip_attached,
        })
    }

    /// Run the pre-flight checks without planning.
    pub fn validate(&self, op: &Operation) -> AppResult<()> {
        let session = self.session()?;
        session.check_bound()?;
        session.validate(op)
    }

    /// Validate and expand an operation without executing it.
    pub fn plan(&self, op: &Operation) -> AppResult<Plan> {
        let session = self.session()?;
        session.check_bound()?;
        session.plan(op)
    }

    /// Candidate and excluded holders for a tip action on the current deck.
    pub fn holder_partition(&self, holder: &LabwareId, action: TipAction) -> AppResult<HolderPartition> {
        let session = self.session()?;
        Validator::new(&session.deck, &session.pipettor).partition(holder, action)
    }

    /// Validate, plan and execute one operation.
    ///
    /// A step failure returns [`PipettorError::Hardware`] carrying the report; every step
    /// before the failure stays applied to the deck and pipettor.
    pub async fn submit(&self, op: &Operation) -> AppResult<ExecutionReport> {
        let mut session = self.session()?;
        session.check_bound()?;
        self.control.reset();
        let _activity = Activity::begin(
            &self.state,
            EngineState::Executing {
                operation: op.name().to_string(),
            },
        );
        self.execute(&mut session, op).await
    }

    async fn execute(&self, session: &mut Session, op: &Operation) -> AppResult<ExecutionReport> {
        let plan = session.plan(op)?;
        let Session { deck, pipettor, .. } = session;
        let report = Sequencer::new(self.connection.actuator())
            .with_control(&self.control)
            .execute(&plan, deck, pipettor)
            .await;
        if report.is_aborted() {
            self.park().await;
            Err(PipettorError::Aborted(Box::new(report)))
        } else if report.is_success() {
            Ok(report)
        } else {
            Err(PipettorError::Hardware(Box::new(report)))
        }
    }

    /// Raise the head and return to the XY origin, keeping any tip.
    async fn park(&self) {
        let device = self.connection.actuator();
        let parked = async {
            device.move_z(0.0, true).await?;
            device.move_xy(0.0, 0.0, true).await
        };
        match parked.await {
            Ok(()) => tracing::info!("Head parked after abort"),
            Err(err) => tracing::error!(error = %err, "Could not park the head after abort"),
        }
    }

    /// Run every operation of a workflow under one hold of the engine.
    ///
    /// Unresolved labware blocks the whole workflow unless `policy.allow_partial` is set,
    /// in which case the blocked operations are skipped. The run stops at the first failure;
    /// the returned result records where and why.
    pub async fn run_workflow(&self, workflow: &Workflow, policy: RunPolicy) -> AppResult<WorkflowResult> {
        let mut session = self.session()?;
        session.check_bound()?;

        let remap = remap::analyze(workflow, &session.deck);
        if !remap.is_complete() && !policy.allow_partial {
            return Err(PipettorError::RemapUnresolved {
                ids: remap.unresolved_ids().into_iter().collect(),
            });
        }
        if policy.start_from > workflow.len() {
            return Err(PipettorError::Config(format!(
                "start index {} is past the end of a workflow of {} operations",
                policy.start_from,
                workflow.len()
            )));
        }
        let blocked = remap.blocked_operations();
        self.control.reset();

        let activity = Activity::begin(
            &self.state,
            EngineState::RunningWorkflow {
                name: workflow.name.clone(),
                index: policy.start_from,
            },
        );
        let mut result = WorkflowResult::new(workflow);
        result.status = WorkflowStatus::Running;
        result.operations_completed = policy.start_from;
        self.publish(&result, &workflow.name, policy.start_from);
        tracing::info!(
            workflow = %workflow.name,
            operations = workflow.len(),
            start_from = policy.start_from,
            blocked = blocked.len(),
            "Workflow started"
        );

        for (index, entry) in workflow.operations.iter().enumerate().skip(policy.start_from) {
            activity.update(EngineState::RunningWorkflow {
                name: workflow.name.clone(),
                index,
            });
            self.publish(&result, &workflow.name, index);
            if blocked.contains(&index) {
                tracing::warn!(index, operation = entry.operation.name(), "Skipping operation with unresolved labware");
                result.skipped.push(index);
                continue;
            }

            let outcome = match check_channels(entry, &session.pipettor) {
                Ok(()) => self.execute(&mut session, &entry.operation).await,
                Err(err) => Err(err),
            };
            match outcome {
                Ok(report) => {
                    result.reports.push(report);
                    result.operations_completed += 1;
                }
                Err(err) => {
                    tracing::error!(index, operation = entry.operation.name(), error = %err, "Workflow stopped");
                    if let Some(report) = err.report() {
                        result.reports.push(report.clone());
                    }
                    if matches!(err, PipettorError::Aborted(_)) {
                        result.abort(index, &err);
                    } else {
                        result.fail(index, &err);
                    }
                    self.publish(&result, &workflow.name, index);
                    return Ok(result);
                }
            }
        }

        result.finish();
        self.publish(&result, &workflow.name, workflow.len());
        tracing::info!(
            workflow = %workflow.name,
            completed = result.operations_completed,
            skipped = result.skipped.len(),
            "Workflow finished"
        );
        Ok(result)
    }

    fn publish(&self, result: &WorkflowResult, name: &str, index: usize) {
        *self.progress.lock() = Some(result.progress(name, index));
    }

    /// Copy of the deck as it is now.
    pub fn deck_snapshot(&self) -> AppResult<Deck> {
        Ok(self.session()?.deck.clone())
    }

    pub fn pipettor_snapshot(&self) -> AppResult<PipettorState> {
        Ok(self.session()?.pipettor.clone())
    }

    /// Edit the deck. Any change leaves the engine stale until [`Engine::rebind`].
    pub fn edit_deck<R>(&self, edit: impl FnOnce(&mut Deck) -> AppResult<R>) -> AppResult<R> {
        let mut session = self.session()?;
        let _activity = Activity::begin(&self.state, EngineState::EditingDeck);
        let before = session.deck.revision();
        let result = edit(&mut session.deck);
        if session.deck.revision() != before {
            tracing::info!(
                bound = session.bound_revision,
                revision = session.deck.revision(),
                "Deck edited; connection binding is stale"
            );
        }
        result
    }

    /// Bind the connection to the current deck revision.
    pub fn rebind(&self) -> AppResult<()> {
        let mut session = self.session()?;
        session.deck.validate_layout()?;
        session.bound_revision = session.deck.revision();
        tracing::info!(revision = session.bound_revision, "Connection rebound to deck");
        Ok(())
    }

    /// Close the connection and hand back the final deck state.
    pub fn disconnect(self) -> Deck {
        let Engine {
            connection,
            session,
            ..
        } = self;
        connection.close();
        session.into_inner().deck
    }
}

async fn apply_speeds(device: &dyn PipettorActuator, speeds: &SpeedSettings) -> AppResult<()> {
    device.set_movement_speed(Axis::X, MovementSpeed::new(speeds.x)?).await?;
    device.set_movement_speed(Axis::Y, MovementSpeed::new(speeds.y)?).await?;
    device.set_movement_speed(Axis::Z, MovementSpeed::new(speeds.z)?).await?;
    device
        .set_piston_speed(PistonDirection::Inward, PistonSpeed::new(speeds.aspirate)?)
        .await?;
    device
        .set_piston_speed(PistonDirection::Outward, PistonSpeed::new(speeds.dispense)?)
        .await?;
    Ok(())
}

fn check_channels(entry: &WorkflowEntry, pipettor: &PipettorState) -> AppResult<()> {
    match entry.channels {
        Some(channels) if channels != pipettor.channel_count() => {
            let labware = entry
                .operation
                .referenced_labware()
                .first()
                .map(|r| r.id.clone())
                .unwrap_or_else(|| LabwareId::new(entry.operation_id.to_string()));
            Err(ValidationFailure::new(
                labware,
                ValidationReason::Request(format!(
                    "operation was recorded for {channels} channel(s), pipettor has {}",
                    pipettor.channel_count()
                )),
            )
            .into())
        }
        _ => Ok(()),
    }
}

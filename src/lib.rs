//! # Pipettor Plus Core Library
//!
//! Operation planning and execution for motorized single- and multi-channel pipettors. The
//! library turns high-level liquid-handling requests (add medium, remove medium, transfer,
//! tip handling) into validated, ordered actuator steps and keeps a model of the deck's
//! liquid and tip state in sync with what the device actually did.
//!
//! ## Crate Structure
//!
//! - **`labware`**: The deck model. Slots, labware kinds, grids of wells, reservoirs and
//!   pipette holders, and the content maps that track liquid per item.
//! - **`pipettor`**: `PipettorState`, the engine's view of the head: tip attached, held
//!   volume, per-channel tip content and geometry.
//! - **`operation`**: Operation descriptors and the transfer options bundle. Operations
//!   reference labware by id only.
//! - **`engine`**: The validator, the batch and trip planner, the step sequencer, the remap
//!   resolver and the single-flow `Engine` that ties them to a connection.
//! - **`workflow`**: Ordered, persistable lists of operations and the result of running one.
//! - **`hardware`**: The actuator command contract, a simulator with fault injection, the
//!   vendor adapter and the scoped connection guard.
//! - **`config`**: Figment-based layered configuration.
//! - **`error`**: The crate error, `PipettorError`, and its supporting types.
//! - **`logging`**: Tracing subscriber setup.
//! - **`validation`**: Small predicates shared by configuration checks.

pub mod config;
pub mod engine;
pub mod error;
pub mod hardware;
pub mod labware;
pub mod logging;
pub mod operation;
pub mod pipettor;
pub mod validation;
pub mod workflow;

pub use config::PipettorConfig;
pub use engine::{Engine, EngineState, ExecutionReport, Plan, RunPolicy};
pub use error::{AppResult, PipettorError};
pub use operation::{LabwareRef, Operation, TransferOptions};
pub use pipettor::PipettorState;
pub use workflow::{Workflow, WorkflowResult};

//! Custom error types for the engine.
//!
//! This module defines the primary error type, `PipettorError`, for the whole crate.
//! Using the `thiserror` crate, it gives one consistent surface for everything that can
//! go wrong between receiving an operation request and the last actuator step.
//!
//! ## Error Hierarchy
//!
//! - **`Validation`**: A pre-flight check rejected the request. Raised before any actuator
//!   call, never partially applied, and always carries the offending labware id and reason.
//! - **`InsufficientHolders`**: Autoselect could not find enough pipette holders in the
//!   state the action requires. A specialization of validation failure.
//! - **`Hardware`**: Plan execution stopped on a failing step. The boxed report lists every
//!   step that was applied before the failure, which is never rolled back.
//! - **`Aborted`**: The run was aborted between two steps. Like `Hardware`, the report
//!   lists the applied steps.
//! - **`Device`**: A device failure outside plan execution (connect, home, speed setup).
//! - **`RemapUnresolved`**: A workflow references labware ids with no compatible
//!   replacement on the current deck.
//! - **`Busy`**: Another operation or workflow is already in flight. Submissions are
//!   rejected, never queued.
//!
//! By using `#[from]`, `PipettorError` can be created from underlying error types,
//! simplifying error handling with the `?` operator.

use std::fmt;

use serde::Serialize;
use thiserror::Error;

use crate::engine::sequencer::ExecutionReport;
use crate::hardware::{CommErrorCode, ControlErrorCode, ErrorCodes};
use crate::labware::LabwareId;

/// Convenience alias for results using the crate error type.
pub type AppResult<T> = std::result::Result<T, PipettorError>;

#[derive(Error, Debug)]
pub enum PipettorError {
    #[error(transparent)]
    Validation(#[from] ValidationFailure),

    #[error(
        "Not enough pipette holders on '{holder}' to {action}: need {required}, found {available}"
    )]
    InsufficientHolders {
        holder: LabwareId,
        action: String,
        required: usize,
        available: usize,
    },

    #[error("Labware '{0}' not found on deck")]
    NotFound(LabwareId),

    #[error("{}", describe_report(.0))]
    Hardware(Box<ExecutionReport>),

    #[error("{}", describe_report(.0))]
    Aborted(Box<ExecutionReport>),

    #[error("Device error: {0}")]
    Device(#[from] HardwareError),

    #[error("Unresolved labware references: {}", join_ids(.ids))]
    RemapUnresolved { ids: Vec<LabwareId> },

    #[error("Engine is busy: {state}")]
    Busy { state: String },

    #[error("Deck changed after the pipettor connection was bound (bound revision {bound}, deck revision {current})")]
    StaleDeck { bound: u64, current: u64 },

    #[error("Content error: {0}")]
    Content(#[from] ContentError),

    #[error("Configuration validation error: {0}")]
    Config(String),

    #[error("Configuration error: {0}")]
    Figment(#[from] Box<figment::Error>),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl PipettorError {
    /// True for every failure raised before the first actuator call.
    pub fn is_validation(&self) -> bool {
        matches!(
            self,
            PipettorError::Validation(_)
                | PipettorError::InsufficientHolders { .. }
                | PipettorError::NotFound(_)
        )
    }

    /// The execution report attached to a halted plan, if any.
    pub fn report(&self) -> Option<&ExecutionReport> {
        match self {
            PipettorError::Hardware(report) | PipettorError::Aborted(report) => Some(report),
            _ => None,
        }
    }
}

impl From<figment::Error> for PipettorError {
    fn from(err: figment::Error) -> Self {
        PipettorError::Figment(Box::new(err))
    }
}

fn describe_report(report: &ExecutionReport) -> String {
    match report.failure() {
        Some(failure) => format!(
            "Execution halted at step {} ({}) after {} completed steps: {}",
            failure.index + 1,
            failure.action,
            report.completed().len(),
            failure.cause
        ),
        None => match report.aborted_at() {
            Some(index) => format!(
                "Execution aborted before step {} after {} completed steps",
                index + 1,
                report.completed().len()
            ),
            None => "Execution halted".to_string(),
        },
    }
}

fn join_ids(ids: &[LabwareId]) -> String {
    ids.iter()
        .map(LabwareId::as_str)
        .collect::<Vec<_>>()
        .join(", ")
}

/// Why a labware or request failed a pre-flight check.
#[derive(Debug, Clone, PartialEq)]
pub enum ValidationReason {
    /// Labware exists but lacks the capability the operation needs.
    WrongType { expected: String, found: String },
    /// The grid position is outside the labware or refers to an empty hook.
    InvalidPosition { column: usize, row: usize },
    /// The pipettor or holder tip state does not permit the action.
    TipState(String),
    /// The target would overflow.
    Overflow { capacity: f64, current: f64, incoming: f64 },
    /// The source does not hold enough liquid.
    Underflow { available: f64, requested: f64 },
    /// A single trip would exceed the tip capacity and multi-trip is disabled.
    ExceedsTipCapacity { requested: f64, capacity: f64 },
    /// A computed axis target is outside the reachable travel.
    AxisLimit { axis: char, target: f64, limit: f64 },
    /// Anything else wrong with the request itself.
    Request(String),
}

impl fmt::Display for ValidationReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ValidationReason::WrongType { expected, found } => {
                write!(f, "expected {expected}, found {found}")
            }
            ValidationReason::InvalidPosition { column, row } => {
                write!(f, "no addressable item at column {column}, row {row}")
            }
            ValidationReason::TipState(msg) => write!(f, "tip state: {msg}"),
            ValidationReason::Overflow {
                capacity,
                current,
                incoming,
            } => write!(
                f,
                "would overflow: {current:.2} µl + {incoming:.2} µl exceeds capacity {capacity:.2} µl"
            ),
            ValidationReason::Underflow {
                available,
                requested,
            } => write!(
                f,
                "not enough liquid: {available:.2} µl available, {requested:.2} µl requested"
            ),
            ValidationReason::ExceedsTipCapacity {
                requested,
                capacity,
            } => write!(
                f,
                "{requested:.2} µl exceeds tip capacity {capacity:.2} µl and multi-trip is disabled"
            ),
            ValidationReason::AxisLimit {
                axis,
                target,
                limit,
            } => write!(f, "{axis} target {target:.2} is outside 0..={limit:.2}"),
            ValidationReason::Request(msg) => f.write_str(msg),
        }
    }
}

/// A rejected operation, naming the labware at fault.
#[derive(Error, Debug, Clone, PartialEq)]
#[error("Validation failed for '{labware_id}': {reason}")]
pub struct ValidationFailure {
    pub labware_id: LabwareId,
    pub reason: ValidationReason,
}

impl ValidationFailure {
    pub fn new(labware_id: impl Into<LabwareId>, reason: ValidationReason) -> Self {
        Self {
            labware_id: labware_id.into(),
            reason,
        }
    }
}

/// Content map violations.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ContentError {
    #[error("Cannot add {requested:.2} µl: {current:.2} µl of {capacity:.2} µl already used")]
    Overflow {
        capacity: f64,
        current: f64,
        requested: f64,
    },
    #[error("Cannot remove {requested:.2} µl: only {available:.2} µl present")]
    Underflow { available: f64, requested: f64 },
    #[error("Volume must be positive, got {0}")]
    NonPositiveVolume(f64),
    #[error("Content type must not be empty")]
    EmptyContentType,
}

/// Classifies a device failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum HardwareErrorKind {
    /// The device did not accept the command.
    CommandRejected,
    /// The device accepted the command but reported failure on completion.
    CommandFailed,
    /// No completion within the driver timeout.
    Timeout,
    /// No open connection.
    NotConnected,
    /// The request violated the device's physical rules.
    Protocol,
}

impl fmt::Display for HardwareErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            HardwareErrorKind::CommandRejected => "command rejected",
            HardwareErrorKind::CommandFailed => "command failed",
            HardwareErrorKind::Timeout => "timeout",
            HardwareErrorKind::NotConnected => "not connected",
            HardwareErrorKind::Protocol => "protocol",
        };
        f.write_str(label)
    }
}

/// Error reported by an actuator, with both device error codes as read back after the call.
#[derive(Error, Debug, Clone, PartialEq, Serialize)]
#[error("{kind} error ({codes}): {message}")]
pub struct HardwareError {
    pub kind: HardwareErrorKind,
    pub codes: ErrorCodes,
    pub message: String,
}

impl HardwareError {
    pub fn new(kind: HardwareErrorKind, codes: ErrorCodes, message: impl Into<String>) -> Self {
        Self {
            kind,
            codes,
            message: message.into(),
        }
    }

    /// A driver timeout, surfaced as a receive timeout on the communication layer.
    pub fn timeout(message: impl Into<String>) -> Self {
        Self::new(
            HardwareErrorKind::Timeout,
            ErrorCodes::new(CommErrorCode::ReceiveTimeout, ControlErrorCode::None),
            message,
        )
    }

    pub fn not_connected() -> Self {
        Self::new(
            HardwareErrorKind::NotConnected,
            ErrorCodes::new(CommErrorCode::OpenFailed, ControlErrorCode::None),
            "no open connection to the pipettor",
        )
    }

    pub fn protocol(message: impl Into<String>) -> Self {
        Self::new(HardwareErrorKind::Protocol, ErrorCodes::default(), message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validation_failure_names_labware_and_reason() {
        let err: PipettorError = ValidationFailure::new(
            "plate_1",
            ValidationReason::Underflow {
                available: 10.0,
                requested: 50.0,
            },
        )
        .into();
        let text = err.to_string();
        assert!(text.contains("plate_1"));
        assert!(text.contains("50.00"));
        assert!(err.is_validation());
    }

    #[test]
    fn timeout_maps_to_receive_timeout_code() {
        let err = HardwareError::timeout("move_xy");
        assert_eq!(err.codes.comm, CommErrorCode::ReceiveTimeout);
        assert_eq!(err.codes.control, ControlErrorCode::None);
        assert!(!err.codes.is_clear());
    }

    #[test]
    fn remap_unresolved_lists_every_id() {
        let err = PipettorError::RemapUnresolved {
            ids: vec![LabwareId::new("a"), LabwareId::new("b")],
        };
        assert_eq!(err.to_string(), "Unresolved labware references: a, b");
        assert!(!err.is_validation());
    }
}

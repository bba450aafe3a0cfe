//! Actuator Command Layer
//!
//! This module defines the command contract every pipettor backend implements. The engine
//! only talks to this trait, so planning and execution never depend on whether a real
//! device or the simulator is behind it.
//!
//! # Addressing
//!
//! Movement actuators are `X`, `Y` and `Z`, the piston is `P`. Multi-channel devices
//! broadcast the same command to every channel; single-channel devices address one.
//!
//! # Wait Semantics
//!
//! Every action takes a `wait` flag:
//! - `wait = true`: the call resolves after physical completion and `Ok` means the
//!   action executed.
//! - `wait = false`: the call resolves once the device accepted the command and `Ok` only
//!   means acceptance. Callers poll position/speed afterwards.
//!
//! The sequencer always passes `wait = true`.
//!
//! # Error Codes
//!
//! Devices expose two independently readable codes after each call. Any non-zero code
//! observed after a step is that step's failure cause.
//!
//! # Example
//!
//! ```rust,ignore
//! async fn prime<A: PipettorActuator + ?Sized>(device: &A) -> Result<(), HardwareError> {
//!     device.set_movement_speed(Axis::Z, MovementSpeed::new(9)?).await?;
//!     device.move_z(0.0, true).await?;
//!     device.move_xy(42.0, 17.5, true).await?;
//!     Ok(())
//! }
//! ```

use std::fmt;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::HardwareError;

/// Position polling sentinel meaning "unavailable".
pub const POSITION_UNAVAILABLE: f64 = -1000.0;

/// Speed polling sentinel meaning "unavailable".
pub const SPEED_UNAVAILABLE: i32 = -1;

/// Actuator address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Axis {
    X,
    Y,
    Z,
    /// Piston.
    P,
}

impl Axis {
    /// Address character used on the wire.
    pub fn address(self) -> char {
        match self {
            Axis::X => 'X',
            Axis::Y => 'Y',
            Axis::Z => 'Z',
            Axis::P => 'P',
        }
    }

    pub fn is_movement(self) -> bool {
        !matches!(self, Axis::P)
    }
}

impl fmt::Display for Axis {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.address())
    }
}

/// Piston travel direction. Inward draws liquid, outward expels it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PistonDirection {
    Inward,
    Outward,
}

/// Speed for the X, Y and Z actuators, 1 (slowest) to 9.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub struct MovementSpeed(u8);

impl MovementSpeed {
    pub const MIN: u8 = 1;
    pub const MAX: u8 = 9;
    pub const DEFAULT_XY: MovementSpeed = MovementSpeed(8);
    pub const DEFAULT_Z: MovementSpeed = MovementSpeed(9);

    pub fn new(value: u8) -> Result<Self, HardwareError> {
        if (Self::MIN..=Self::MAX).contains(&value) {
            Ok(Self(value))
        } else {
            Err(HardwareError::protocol(format!(
                "movement speed {value} outside {}..={}",
                Self::MIN,
                Self::MAX
            )))
        }
    }

    pub fn get(self) -> u8 {
        self.0
    }
}

impl TryFrom<u8> for MovementSpeed {
    type Error = HardwareError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<MovementSpeed> for u8 {
    fn from(speed: MovementSpeed) -> u8 {
        speed.0
    }
}

/// Piston speed, 1 (slowest) to 6. Set independently per direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub struct PistonSpeed(u8);

impl PistonSpeed {
    pub const MIN: u8 = 1;
    pub const MAX: u8 = 6;
    pub const DEFAULT: PistonSpeed = PistonSpeed(3);

    pub fn new(value: u8) -> Result<Self, HardwareError> {
        if (Self::MIN..=Self::MAX).contains(&value) {
            Ok(Self(value))
        } else {
            Err(HardwareError::protocol(format!(
                "piston speed {value} outside {}..={}",
                Self::MIN,
                Self::MAX
            )))
        }
    }

    pub fn get(self) -> u8 {
        self.0
    }
}

impl TryFrom<u8> for PistonSpeed {
    type Error = HardwareError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<PistonSpeed> for u8 {
    fn from(speed: PistonSpeed) -> u8 {
        speed.0
    }
}

/// Communication-layer error code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CommErrorCode {
    #[default]
    None,
    OpenFailed,
    ReceiveTimeout,
    ChecksumMismatch,
    Busy,
    /// A code outside the documented table.
    Unknown(i32),
}

impl CommErrorCode {
    pub fn from_raw(raw: i32) -> Self {
        match raw {
            0 => CommErrorCode::None,
            1 => CommErrorCode::OpenFailed,
            2 => CommErrorCode::ReceiveTimeout,
            3 => CommErrorCode::ChecksumMismatch,
            4 => CommErrorCode::Busy,
            other => CommErrorCode::Unknown(other),
        }
    }

    pub fn raw(self) -> i32 {
        match self {
            CommErrorCode::None => 0,
            CommErrorCode::OpenFailed => 1,
            CommErrorCode::ReceiveTimeout => 2,
            CommErrorCode::ChecksumMismatch => 3,
            CommErrorCode::Busy => 4,
            CommErrorCode::Unknown(other) => other,
        }
    }

    pub fn is_error(self) -> bool {
        self != CommErrorCode::None
    }
}

/// Control-layer error code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ControlErrorCode {
    #[default]
    None,
    InvalidAddress,
    InvalidParameter,
    CommunicationError,
    /// A code outside the documented table.
    Unknown(i32),
}

impl ControlErrorCode {
    pub fn from_raw(raw: i32) -> Self {
        match raw {
            0 => ControlErrorCode::None,
            1 => ControlErrorCode::InvalidAddress,
            2 => ControlErrorCode::InvalidParameter,
            3 => ControlErrorCode::CommunicationError,
            other => ControlErrorCode::Unknown(other),
        }
    }

    pub fn raw(self) -> i32 {
        match self {
            ControlErrorCode::None => 0,
            ControlErrorCode::InvalidAddress => 1,
            ControlErrorCode::InvalidParameter => 2,
            ControlErrorCode::CommunicationError => 3,
            ControlErrorCode::Unknown(other) => other,
        }
    }

    pub fn is_error(self) -> bool {
        self != ControlErrorCode::None
    }
}

/// Both error codes as read back from the device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ErrorCodes {
    pub comm: CommErrorCode,
    pub control: ControlErrorCode,
}

impl ErrorCodes {
    pub fn new(comm: CommErrorCode, control: ControlErrorCode) -> Self {
        Self { comm, control }
    }

    pub fn from_raw(comm: i32, control: i32) -> Self {
        Self::new(CommErrorCode::from_raw(comm), ControlErrorCode::from_raw(control))
    }

    /// True when neither layer reports an error.
    pub fn is_clear(&self) -> bool {
        !self.comm.is_error() && !self.control.is_error()
    }
}

impl fmt::Display for ErrorCodes {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "comm={}, control={}", self.comm.raw(), self.control.raw())
    }
}

/// Decode a raw position reading. The sentinel maps to `None`, zero stays a reading.
pub fn decode_position(raw: f64) -> Option<f64> {
    if (raw - POSITION_UNAVAILABLE).abs() < f64::EPSILON {
        None
    } else {
        Some(raw)
    }
}

/// Decode a raw speed reading. The sentinel (and any other negative value) maps to `None`.
pub fn decode_speed(raw: i32) -> Option<u8> {
    if raw == SPEED_UNAVAILABLE {
        return None;
    }
    u8::try_from(raw).ok()
}

/// Capability: Pipettor Actuation
///
/// Motion, piston and tip commands of a single- or multi-channel pipettor.
///
/// # Contract
/// - Coordinates are in millimetres; Z grows downward from the home position at 0.
/// - Volumes are per channel in µl.
/// - Each action honors its `wait` flag as described in the module docs.
/// - After any call, [`PipettorActuator::error_codes`] reflects that call.
///
/// # Thread Safety
/// - All async methods take `&self`; implementations use interior mutability.
/// - `connect`/`disconnect` are synchronous so a drop guard can release the device.
#[async_trait]
pub trait PipettorActuator: Send + Sync {
    /// Human-readable backend name for logs.
    fn name(&self) -> &str;

    /// Number of channels driven in lock-step.
    fn channel_count(&self) -> usize;

    /// Open the device connection.
    fn connect(&self) -> Result<(), HardwareError>;

    /// Release the device connection. Must be safe to call more than once.
    fn disconnect(&self);

    fn is_connected(&self) -> bool;

    /// Error codes from the most recent call.
    fn error_codes(&self) -> ErrorCodes;

    /// Home all axes.
    async fn initialize(&self) -> Result<(), HardwareError>;

    /// Move X and Y to an absolute position.
    async fn move_xy(&self, x: f64, y: f64, wait: bool) -> Result<(), HardwareError>;

    /// Move Z to an absolute position.
    async fn move_z(&self, z: f64, wait: bool) -> Result<(), HardwareError>;

    /// Descend until the liquid surface is detected, stopping `distance` above it and never
    /// below `limit`. Requires a tip.
    async fn move_to_surface(
        &self,
        limit: f64,
        distance: f64,
        wait: bool,
    ) -> Result<(), HardwareError>;

    /// Draw `volume` µl into every tip.
    async fn aspirate(&self, volume: f64, wait: bool) -> Result<(), HardwareError>;

    /// Expel `volume` µl from every tip.
    async fn dispense(&self, volume: f64, wait: bool) -> Result<(), HardwareError>;

    /// Descend onto a tip, never below `z_limit`, and press it on.
    async fn pick_tip(&self, z_limit: f64, wait: bool) -> Result<(), HardwareError>;

    /// Eject the attached tip(s) at the current position.
    async fn eject_tip(&self, wait: bool) -> Result<(), HardwareError>;

    async fn set_movement_speed(&self, axis: Axis, speed: MovementSpeed)
        -> Result<(), HardwareError>;

    async fn set_piston_speed(
        &self,
        direction: PistonDirection,
        speed: PistonSpeed,
    ) -> Result<(), HardwareError>;

    /// Current position of an axis, `None` when the device reports it unavailable.
    async fn position(&self, axis: Axis) -> Result<Option<f64>, HardwareError>;

    /// Current movement speed of an axis, `None` when unavailable.
    async fn movement_speed(&self, axis: Axis) -> Result<Option<u8>, HardwareError>;

    /// Current piston speed for a direction, `None` when unavailable.
    async fn piston_speed(
        &self,
        direction: PistonDirection,
    ) -> Result<Option<u8>, HardwareError>;

    /// Whether the device reports a tip attached.
    async fn tip_attached(&self) -> Result<bool, HardwareError>;
}

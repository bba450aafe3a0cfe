//! Pipettor hardware layer.
//!
//! - [`capabilities`]: the actuator command contract the engine consumes
//! - [`simulator`]: deterministic in-memory device with fault injection
//! - [`vendor`]: adapter over the native instrument library
//! - [`connection`]: scoped connection with guaranteed disconnect

pub mod capabilities;
pub mod connection;
pub mod simulator;
pub mod vendor;

pub use capabilities::{
    decode_position, decode_speed, Axis, CommErrorCode, ControlErrorCode, ErrorCodes,
    MovementSpeed, PipettorActuator, PistonDirection, PistonSpeed, POSITION_UNAVAILABLE,
    SPEED_UNAVAILABLE,
};
pub use connection::Connection;
pub use simulator::{SimulatedCommand, SimulatedPipettor};
pub use vendor::{VendorBinding, VendorPipettor};

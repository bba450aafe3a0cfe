//! Simulated Pipettor
//!
//! A deterministic, in-memory pipettor for planning tests and dry runs. It enforces the
//! same physical rules a device would (no liquid handling without a tip, no aspirating
//! past tip capacity, no double pick) and records every accepted command.
//!
//! Failures can be injected at a chosen command index to exercise partial-completion
//! paths. All timing uses `tokio::time::sleep`, and the default latency is zero.

use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::Serialize;
use tokio::time::sleep;

use crate::error::{HardwareError, HardwareErrorKind};
use crate::hardware::capabilities::{
    Axis, CommErrorCode, ControlErrorCode, ErrorCodes, MovementSpeed, PipettorActuator,
    PistonDirection, PistonSpeed,
};
use crate::pipettor::TIP_VOLUME_TOLERANCE;

/// One accepted command, as recorded by the simulator.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "command", rename_all = "snake_case")]
pub enum SimulatedCommand {
    Initialize,
    MoveXy { x: f64, y: f64 },
    MoveZ { z: f64 },
    MoveToSurface { limit: f64, distance: f64 },
    Aspirate { volume: f64 },
    Dispense { volume: f64 },
    PickTip { z_limit: f64 },
    EjectTip,
}

#[derive(Debug, Clone, Copy)]
struct InjectedFault {
    command_index: usize,
    codes: ErrorCodes,
}

#[derive(Debug)]
struct SimulatorState {
    connected: bool,
    x: f64,
    y: f64,
    z: f64,
    has_tip: bool,
    volume: f64,
    xy_speed: [MovementSpeed; 2],
    z_speed: MovementSpeed,
    inward: PistonSpeed,
    outward: PistonSpeed,
    last_codes: ErrorCodes,
    commands: Vec<SimulatedCommand>,
    attempted: usize,
    faults: Vec<InjectedFault>,
    position_available: bool,
}

impl SimulatorState {
    fn new() -> Self {
        Self {
            connected: false,
            x: 0.0,
            y: 0.0,
            z: 0.0,
            has_tip: false,
            volume: 0.0,
            xy_speed: [MovementSpeed::DEFAULT_XY; 2],
            z_speed: MovementSpeed::DEFAULT_Z,
            inward: PistonSpeed::DEFAULT,
            outward: PistonSpeed::DEFAULT,
            last_codes: ErrorCodes::default(),
            commands: Vec::new(),
            attempted: 0,
            faults: Vec::new(),
            position_available: true,
        }
    }
}

// =============================================================================
// SimulatedPipettor
// =============================================================================

/// Deterministic pipettor simulator.
///
/// # Example
///
/// ```rust,ignore
/// let sim = SimulatedPipettor::new(1, 1000.0)
///     .fail_at(6, ErrorCodes::from_raw(2, 0));
/// sim.connect()?;
/// sim.move_xy(10.0, 10.0, true).await?;
/// ```
pub struct SimulatedPipettor {
    name: String,
    channels: usize,
    tip_capacity: f64,
    multichannel: bool,
    latency: Duration,
    state: Mutex<SimulatorState>,
}

impl SimulatedPipettor {
    /// Create a simulator with `channels` channels and tips of `tip_capacity` µl.
    pub fn new(channels: usize, tip_capacity: f64) -> Self {
        let channels = channels.max(1);
        Self {
            name: format!("simulator-{channels}ch"),
            channels,
            tip_capacity,
            multichannel: channels > 1,
            latency: Duration::ZERO,
            state: Mutex::new(SimulatorState::new()),
        }
    }

    /// Sleep this long on every waited command.
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    /// Fail the command with this zero-based index (counting motion, piston and tip
    /// commands only) and report `codes` afterwards.
    pub fn fail_at(self, command_index: usize, codes: ErrorCodes) -> Self {
        self.state.lock().faults.push(InjectedFault {
            command_index,
            codes,
        });
        self
    }

    /// Make position polling report the unavailable sentinel.
    pub fn with_positions_unavailable(self) -> Self {
        self.state.lock().position_available = false;
        self
    }

    /// Every accepted command so far.
    pub fn commands(&self) -> Vec<SimulatedCommand> {
        self.state.lock().commands.clone()
    }

    /// Commands attempted so far, including failed ones.
    pub fn attempted(&self) -> usize {
        self.state.lock().attempted
    }

    /// Liquid currently held per channel.
    pub fn held_volume(&self) -> f64 {
        self.state.lock().volume
    }

    fn ensure_connected(state: &SimulatorState) -> Result<(), HardwareError> {
        if state.connected {
            Ok(())
        } else {
            Err(HardwareError::not_connected())
        }
    }

    /// Run one action: fault injection, physics check, state change, logging.
    async fn run<F>(&self, wait: bool, command: SimulatedCommand, apply: F) -> Result<(), HardwareError>
    where
        F: FnOnce(&mut SimulatorState) -> Result<(), String>,
    {
        {
            let mut state = self.state.lock();
            Self::ensure_connected(&state)?;
            let index = state.attempted;
            state.attempted += 1;
            state.last_codes = ErrorCodes::default();

            if let Some(fault) = state.faults.iter().find(|f| f.command_index == index).copied() {
                state.last_codes = fault.codes;
                tracing::debug!(index, ?command, codes = %fault.codes, "Injected simulator fault");
                return Err(HardwareError::new(
                    HardwareErrorKind::CommandFailed,
                    fault.codes,
                    format!("injected fault on command {index}"),
                ));
            }

            if let Err(message) = apply(&mut *state) {
                state.last_codes =
                    ErrorCodes::new(CommErrorCode::None, ControlErrorCode::InvalidParameter);
                return Err(HardwareError::new(
                    HardwareErrorKind::Protocol,
                    state.last_codes,
                    message,
                ));
            }
            state.commands.push(command);
        }

        if wait && !self.latency.is_zero() {
            sleep(self.latency).await;
        }
        Ok(())
    }
}

#[async_trait]
impl PipettorActuator for SimulatedPipettor {
    fn name(&self) -> &str {
        &self.name
    }

    fn channel_count(&self) -> usize {
        self.channels
    }

    fn connect(&self) -> Result<(), HardwareError> {
        let mut state = self.state.lock();
        state.connected = true;
        state.last_codes = ErrorCodes::default();
        Ok(())
    }

    fn disconnect(&self) {
        let mut state = self.state.lock();
        if state.has_tip {
            tracing::warn!(simulator = %self.name, "Disconnecting with a tip still attached");
        }
        state.connected = false;
    }

    fn is_connected(&self) -> bool {
        self.state.lock().connected
    }

    fn error_codes(&self) -> ErrorCodes {
        self.state.lock().last_codes
    }

    async fn initialize(&self) -> Result<(), HardwareError> {
        self.run(true, SimulatedCommand::Initialize, |s| {
            if s.has_tip {
                return Err("eject the tip before homing".to_string());
            }
            s.volume = 0.0;
            s.x = 0.0;
            s.y = 0.0;
            s.z = 0.0;
            Ok(())
        })
        .await
    }

    async fn move_xy(&self, x: f64, y: f64, wait: bool) -> Result<(), HardwareError> {
        self.run(wait, SimulatedCommand::MoveXy { x, y }, |s| {
            s.x = x;
            s.y = y;
            Ok(())
        })
        .await
    }

    async fn move_z(&self, z: f64, wait: bool) -> Result<(), HardwareError> {
        self.run(wait, SimulatedCommand::MoveZ { z }, |s| {
            s.z = z;
            Ok(())
        })
        .await
    }

    async fn move_to_surface(
        &self,
        limit: f64,
        distance: f64,
        wait: bool,
    ) -> Result<(), HardwareError> {
        let multichannel = self.multichannel;
        self.run(wait, SimulatedCommand::MoveToSurface { limit, distance }, |s| {
            if multichannel {
                return Err("multi-channel heads have no tip sensor".to_string());
            }
            if !s.has_tip {
                return Err("move_to_surface requires a tip".to_string());
            }
            s.z = limit;
            Ok(())
        })
        .await
    }

    async fn aspirate(&self, volume: f64, wait: bool) -> Result<(), HardwareError> {
        let capacity = self.tip_capacity;
        self.run(wait, SimulatedCommand::Aspirate { volume }, |s| {
            if !s.has_tip {
                return Err("aspirate requires a tip".to_string());
            }
            if s.volume + volume > capacity + TIP_VOLUME_TOLERANCE {
                return Err(format!(
                    "cannot aspirate {volume} µl: holding {} µl of {capacity} µl",
                    s.volume
                ));
            }
            s.volume += volume;
            Ok(())
        })
        .await
    }

    async fn dispense(&self, volume: f64, wait: bool) -> Result<(), HardwareError> {
        self.run(wait, SimulatedCommand::Dispense { volume }, |s| {
            if !s.has_tip {
                return Err("dispense requires a tip".to_string());
            }
            if volume > s.volume + TIP_VOLUME_TOLERANCE {
                return Err(format!(
                    "cannot dispense {volume} µl: holding {} µl",
                    s.volume
                ));
            }
            s.volume = (s.volume - volume).max(0.0);
            Ok(())
        })
        .await
    }

    async fn pick_tip(&self, z_limit: f64, wait: bool) -> Result<(), HardwareError> {
        self.run(wait, SimulatedCommand::PickTip { z_limit }, |s| {
            if s.has_tip {
                return Err("a tip is already attached".to_string());
            }
            s.z = z_limit;
            s.has_tip = true;
            Ok(())
        })
        .await
    }

    async fn eject_tip(&self, wait: bool) -> Result<(), HardwareError> {
        let name = self.name.clone();
        self.run(wait, SimulatedCommand::EjectTip, move |s| {
            if !s.has_tip {
                return Err("no tip to eject".to_string());
            }
            if s.volume > TIP_VOLUME_TOLERANCE {
                tracing::warn!(simulator = %name, volume = s.volume, "Ejecting tip with liquid");
            }
            s.has_tip = false;
            s.volume = 0.0;
            Ok(())
        })
        .await
    }

    async fn set_movement_speed(
        &self,
        axis: Axis,
        speed: MovementSpeed,
    ) -> Result<(), HardwareError> {
        let mut state = self.state.lock();
        Self::ensure_connected(&state)?;
        match axis {
            Axis::X => state.xy_speed[0] = speed,
            Axis::Y => state.xy_speed[1] = speed,
            Axis::Z => state.z_speed = speed,
            Axis::P => {
                state.last_codes =
                    ErrorCodes::new(CommErrorCode::None, ControlErrorCode::InvalidAddress);
                return Err(HardwareError::new(
                    HardwareErrorKind::CommandRejected,
                    state.last_codes,
                    "piston speed is set per direction",
                ));
            }
        }
        state.last_codes = ErrorCodes::default();
        Ok(())
    }

    async fn set_piston_speed(
        &self,
        direction: PistonDirection,
        speed: PistonSpeed,
    ) -> Result<(), HardwareError> {
        let mut state = self.state.lock();
        Self::ensure_connected(&state)?;
        match direction {
            PistonDirection::Inward => state.inward = speed,
            PistonDirection::Outward => state.outward = speed,
        }
        state.last_codes = ErrorCodes::default();
        Ok(())
    }

    async fn position(&self, axis: Axis) -> Result<Option<f64>, HardwareError> {
        let state = self.state.lock();
        Self::ensure_connected(&state)?;
        if !state.position_available {
            return Ok(None);
        }
        Ok(Some(match axis {
            Axis::X => state.x,
            Axis::Y => state.y,
            Axis::Z => state.z,
            Axis::P => state.volume,
        }))
    }

    async fn movement_speed(&self, axis: Axis) -> Result<Option<u8>, HardwareError> {
        let state = self.state.lock();
        Self::ensure_connected(&state)?;
        Ok(match axis {
            Axis::X => Some(state.xy_speed[0].get()),
            Axis::Y => Some(state.xy_speed[1].get()),
            Axis::Z => Some(state.z_speed.get()),
            Axis::P => None,
        })
    }

    async fn piston_speed(
        &self,
        direction: PistonDirection,
    ) -> Result<Option<u8>, HardwareError> {
        let state = self.state.lock();
        Self::ensure_connected(&state)?;
        Ok(Some(match direction {
            PistonDirection::Inward => state.inward.get(),
            PistonDirection::Outward => state.outward.get(),
        }))
    }

    async fn tip_attached(&self) -> Result<bool, HardwareError> {
        let state = self.state.lock();
        Self::ensure_connected(&state)?;
        Ok(state.has_tip)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn connected(channels: usize) -> SimulatedPipettor {
        let sim = SimulatedPipettor::new(channels, 1000.0);
        sim.connect().unwrap();
        sim
    }

    #[tokio::test]
    async fn refuses_commands_when_disconnected() {
        let sim = SimulatedPipettor::new(1, 1000.0);
        let err = sim.move_z(10.0, true).await.unwrap_err();
        assert_eq!(err.kind, HardwareErrorKind::NotConnected);
    }

    #[tokio::test]
    async fn aspirate_requires_tip_and_respects_capacity() {
        let sim = connected(1);
        assert!(sim.aspirate(10.0, true).await.is_err());
        assert!(!sim.error_codes().is_clear());

        sim.pick_tip(50.0, true).await.unwrap();
        sim.aspirate(600.0, true).await.unwrap();
        assert!(sim.error_codes().is_clear());
        assert!(sim.aspirate(600.0, true).await.is_err());
        sim.dispense(600.0, true).await.unwrap();
        assert_eq!(sim.held_volume(), 0.0);
    }

    #[tokio::test]
    async fn double_pick_and_empty_eject_are_rejected() {
        let sim = connected(1);
        assert!(sim.eject_tip(true).await.is_err());
        sim.pick_tip(50.0, true).await.unwrap();
        assert!(sim.pick_tip(50.0, true).await.is_err());
        sim.eject_tip(true).await.unwrap();
        assert!(!sim.tip_attached().await.unwrap());
    }

    #[tokio::test]
    async fn injected_fault_reports_codes() {
        let sim = SimulatedPipettor::new(1, 1000.0).fail_at(1, ErrorCodes::from_raw(2, 0));
        sim.connect().unwrap();
        sim.move_xy(1.0, 2.0, true).await.unwrap();
        let err = sim.move_z(5.0, true).await.unwrap_err();
        assert_eq!(err.codes.comm, CommErrorCode::ReceiveTimeout);
        assert_eq!(sim.error_codes().comm, CommErrorCode::ReceiveTimeout);
        assert_eq!(sim.commands().len(), 1);
        assert_eq!(sim.attempted(), 2);
    }

    #[tokio::test]
    async fn multichannel_head_cannot_detect_surface() {
        let sim = connected(8);
        sim.pick_tip(50.0, true).await.unwrap();
        assert!(sim.move_to_surface(40.0, 2.0, true).await.is_err());
    }

    #[tokio::test]
    async fn unavailable_positions_poll_as_none() {
        let sim = SimulatedPipettor::new(1, 200.0).with_positions_unavailable();
        sim.connect().unwrap();
        assert_eq!(sim.position(Axis::X).await.unwrap(), None);
        assert_eq!(sim.movement_speed(Axis::Z).await.unwrap(), Some(9));
    }
}

//! Vendor Device Adapter
//!
//! Bridges the native instrument library to [`PipettorActuator`]. The native calls are
//! synchronous and report success as a boolean, with error codes read back separately;
//! [`VendorBinding`] mirrors that surface so the FFI layer can stay a thin shim.
//!
//! Every call runs on the blocking pool under the configured command timeout. A call that
//! does not return in time surfaces as a receive timeout, the same as any other failure.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;

use crate::config::PipettorConfig;
use crate::error::{HardwareError, HardwareErrorKind};
use crate::hardware::capabilities::{
    decode_position, decode_speed, Axis, CommErrorCode, ControlErrorCode, ErrorCodes,
    MovementSpeed, PipettorActuator, PistonDirection, PistonSpeed,
};

/// Raw native instrument surface.
///
/// Boolean returns mean "accepted" when `wait` is false and "executed" when it is true.
/// Polling returns the documented sentinels when a value is unavailable.
pub trait VendorBinding: Send + Sync + 'static {
    fn open(&self) -> bool;
    fn dispose(&self);
    fn is_connected(&self) -> bool;
    fn initialize_instrument(&self) -> bool;
    fn move_xy(&self, x: f64, y: f64, wait: bool) -> bool;
    fn move_z(&self, z: f64, wait: bool) -> bool;
    fn move_to_surface(&self, limit: f64, distance: f64, wait: bool) -> bool;
    /// Piston move in motor steps.
    fn aspirate(&self, steps: f64, wait: bool) -> bool;
    /// Piston move in motor steps.
    fn dispense(&self, steps: f64, wait: bool) -> bool;
    fn pick_tip(&self, limit: f64, wait: bool) -> bool;
    fn eject_tip(&self, wait: bool) -> bool;
    fn set_actuator_speed(&self, address: char, speed: u8) -> bool;
    fn set_aspirate_speed(&self, speed: u8) -> bool;
    fn set_dispense_speed(&self, speed: u8) -> bool;
    fn poll_position(&self, address: char) -> f64;
    fn poll_speed(&self, address: char, inwards: bool) -> i32;
    fn comm_error_code(&self) -> i32;
    fn control_error_code(&self) -> i32;
}

/// [`PipettorActuator`] over a native [`VendorBinding`].
pub struct VendorPipettor<B: VendorBinding> {
    binding: Arc<B>,
    name: String,
    channels: usize,
    multichannel: bool,
    steps_per_ul: f64,
    timeout: Duration,
    tip_attached: AtomicBool,
    last_codes: Mutex<ErrorCodes>,
}

impl<B: VendorBinding> VendorPipettor<B> {
    pub fn new(binding: B, config: &PipettorConfig) -> Self {
        let channels = config.channel_count();
        Self {
            binding: Arc::new(binding),
            name: format!("vendor-{channels}ch-{}ul", config.pipettor.tip_volume),
            channels,
            multichannel: config.pipettor.multichannel,
            steps_per_ul: config.steps_per_ul(),
            timeout: Duration::from_millis(config.driver.command_timeout_ms),
            tip_attached: AtomicBool::new(false),
            last_codes: Mutex::new(ErrorCodes::default()),
        }
    }

    fn read_codes(&self) -> ErrorCodes {
        let codes = ErrorCodes::from_raw(
            self.binding.comm_error_code(),
            self.binding.control_error_code(),
        );
        *self.last_codes.lock() = codes;
        codes
    }

    /// Issue one native call on the blocking pool and translate the outcome.
    async fn invoke<F>(&self, what: &'static str, wait: bool, call: F) -> Result<(), HardwareError>
    where
        F: FnOnce(&B) -> bool + Send + 'static,
    {
        if !self.binding.is_connected() {
            return Err(HardwareError::not_connected());
        }

        let binding = Arc::clone(&self.binding);
        let task = tokio::task::spawn_blocking(move || call(binding.as_ref()));
        let accepted = match tokio::time::timeout(self.timeout, task).await {
            Err(_) => {
                let err = HardwareError::timeout(format!(
                    "{what} did not complete within {} ms",
                    self.timeout.as_millis()
                ));
                *self.last_codes.lock() = err.codes;
                return Err(err);
            }
            Ok(Err(join_err)) => {
                return Err(HardwareError::protocol(format!("{what} call aborted: {join_err}")))
            }
            Ok(Ok(accepted)) => accepted,
        };

        let codes = self.read_codes();
        if accepted && codes.is_clear() {
            return Ok(());
        }
        let kind = if !accepted && !wait {
            HardwareErrorKind::CommandRejected
        } else {
            HardwareErrorKind::CommandFailed
        };
        Err(HardwareError::new(kind, codes, format!("{what} reported failure")))
    }
}

#[async_trait]
impl<B: VendorBinding> PipettorActuator for VendorPipettor<B> {
    fn name(&self) -> &str {
        &self.name
    }

    fn channel_count(&self) -> usize {
        self.channels
    }

    fn connect(&self) -> Result<(), HardwareError> {
        if self.binding.open() && self.binding.is_connected() {
            *self.last_codes.lock() = ErrorCodes::default();
            Ok(())
        } else {
            let mut codes = self.read_codes();
            if codes.is_clear() {
                codes = ErrorCodes::new(CommErrorCode::OpenFailed, ControlErrorCode::None);
            }
            Err(HardwareError::new(
                HardwareErrorKind::NotConnected,
                codes,
                "failed to open the instrument",
            ))
        }
    }

    fn disconnect(&self) {
        if self.tip_attached.load(Ordering::SeqCst) {
            tracing::warn!(device = %self.name, "Disconnecting with a tip still attached");
        }
        self.binding.dispose();
    }

    fn is_connected(&self) -> bool {
        self.binding.is_connected()
    }

    fn error_codes(&self) -> ErrorCodes {
        *self.last_codes.lock()
    }

    async fn initialize(&self) -> Result<(), HardwareError> {
        if self.tip_attached.load(Ordering::SeqCst) {
            return Err(HardwareError::protocol("eject the tip before homing"));
        }
        self.invoke("initialize", true, |b| b.initialize_instrument())
            .await
    }

    async fn move_xy(&self, x: f64, y: f64, wait: bool) -> Result<(), HardwareError> {
        self.invoke("move_xy", wait, move |b| b.move_xy(x, y, wait)).await
    }

    async fn move_z(&self, z: f64, wait: bool) -> Result<(), HardwareError> {
        self.invoke("move_z", wait, move |b| b.move_z(z, wait)).await
    }

    async fn move_to_surface(
        &self,
        limit: f64,
        distance: f64,
        wait: bool,
    ) -> Result<(), HardwareError> {
        if self.multichannel {
            return Err(HardwareError::protocol(
                "surface detection needs a tip sensor, single-channel only",
            ));
        }
        self.invoke("move_to_surface", wait, move |b| {
            b.move_to_surface(limit, distance, wait)
        })
        .await
    }

    async fn aspirate(&self, volume: f64, wait: bool) -> Result<(), HardwareError> {
        let steps = volume * self.steps_per_ul;
        self.invoke("aspirate", wait, move |b| b.aspirate(steps, wait)).await
    }

    async fn dispense(&self, volume: f64, wait: bool) -> Result<(), HardwareError> {
        let steps = volume * self.steps_per_ul;
        self.invoke("dispense", wait, move |b| b.dispense(steps, wait)).await
    }

    async fn pick_tip(&self, z_limit: f64, wait: bool) -> Result<(), HardwareError> {
        self.invoke("pick_tip", wait, move |b| b.pick_tip(z_limit, wait))
            .await?;
        self.tip_attached.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn eject_tip(&self, wait: bool) -> Result<(), HardwareError> {
        self.invoke("eject_tip", wait, move |b| b.eject_tip(wait)).await?;
        self.tip_attached.store(false, Ordering::SeqCst);
        Ok(())
    }

    async fn set_movement_speed(
        &self,
        axis: Axis,
        speed: MovementSpeed,
    ) -> Result<(), HardwareError> {
        if !axis.is_movement() {
            return Err(HardwareError::new(
                HardwareErrorKind::CommandRejected,
                ErrorCodes::new(CommErrorCode::None, ControlErrorCode::InvalidAddress),
                "piston speed is set per direction",
            ));
        }
        let address = axis.address();
        let value = speed.get();
        self.invoke("set_actuator_speed", true, move |b| {
            b.set_actuator_speed(address, value)
        })
        .await
    }

    async fn set_piston_speed(
        &self,
        direction: PistonDirection,
        speed: PistonSpeed,
    ) -> Result<(), HardwareError> {
        let value = speed.get();
        match direction {
            PistonDirection::Inward => {
                self.invoke("set_aspirate_speed", true, move |b| b.set_aspirate_speed(value))
                    .await
            }
            PistonDirection::Outward => {
                self.invoke("set_dispense_speed", true, move |b| b.set_dispense_speed(value))
                    .await
            }
        }
    }

    async fn position(&self, axis: Axis) -> Result<Option<f64>, HardwareError> {
        if !self.binding.is_connected() {
            return Err(HardwareError::not_connected());
        }
        Ok(decode_position(self.binding.poll_position(axis.address())))
    }

    async fn movement_speed(&self, axis: Axis) -> Result<Option<u8>, HardwareError> {
        if !self.binding.is_connected() {
            return Err(HardwareError::not_connected());
        }
        Ok(decode_speed(self.binding.poll_speed(axis.address(), false)))
    }

    async fn piston_speed(
        &self,
        direction: PistonDirection,
    ) -> Result<Option<u8>, HardwareError> {
        if !self.binding.is_connected() {
            return Err(HardwareError::not_connected());
        }
        let inwards = direction == PistonDirection::Inward;
        Ok(decode_speed(
            self.binding.poll_speed(Axis::P.address(), inwards),
        ))
    }

    async fn tip_attached(&self) -> Result<bool, HardwareError> {
        Ok(self.tip_attached.load(Ordering::SeqCst))
    }
}

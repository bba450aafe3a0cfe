//! Scoped device connection.
//!
//! [`Connection`] opens the actuator on construction and disconnects it when dropped, so the
//! device is released on every exit path: early `?` returns, failed plans and panics alike.

use std::sync::Arc;

use crate::error::HardwareError;
use crate::hardware::capabilities::PipettorActuator;

/// An open connection to a pipettor. Dropping it disconnects the device.
pub struct Connection {
    actuator: Arc<dyn PipettorActuator>,
    open: bool,
}

impl Connection {
    /// Connect to `actuator`.
    pub fn open(actuator: Arc<dyn PipettorActuator>) -> Result<Self, HardwareError> {
        actuator.connect()?;
        tracing::info!(device = actuator.name(), channels = actuator.channel_count(), "Pipettor connected");
        Ok(Self {
            actuator,
            open: true,
        })
    }

    pub fn actuator(&self) -> &dyn PipettorActuator {
        self.actuator.as_ref()
    }

    pub fn is_open(&self) -> bool {
        self.open && self.actuator.is_connected()
    }

    /// Disconnect now instead of at drop.
    pub fn close(mut self) {
        self.release();
    }

    fn release(&mut self) {
        if self.open {
            self.open = false;
            self.actuator.disconnect();
            tracing::info!(device = self.actuator.name(), "Pipettor disconnected");
        }
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.release();
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("device", &self.actuator.name())
            .field("open", &self.open)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hardware::SimulatedPipettor;

    #[test]
    fn drop_disconnects() {
        let sim = Arc::new(SimulatedPipettor::new(1, 1000.0));
        {
            let conn = Connection::open(sim.clone()).unwrap();
            assert!(conn.is_open());
            assert!(sim.is_connected());
        }
        assert!(!sim.is_connected());
    }

    #[test]
    fn disconnects_when_unwinding() {
        let sim = Arc::new(SimulatedPipettor::new(1, 1000.0));
        let inner = sim.clone();
        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(move || {
            let _conn = Connection::open(inner).unwrap();
            panic!("plan aborted");
        }));
        assert!(result.is_err());
        assert!(!sim.is_connected());
    }

    #[test]
    fn explicit_close_is_idempotent_with_drop() {
        let sim = Arc::new(SimulatedPipettor::new(1, 1000.0));
        let conn = Connection::open(sim.clone()).unwrap();
        conn.close();
        assert!(!sim.is_connected());
    }
}

//! Backend implementations
//!
//! Two variants of [`SensorBackend`](crate::core::backend::SensorBackend)
//! exist: [`hardware::HardwareBackend`] binds to the real device subsystem
//! over its Unix socket, [`simulated::SimulatedBackend`] is a software
//! model that keeps the broker functional on machines without one.

pub mod hardware;
pub mod simulated;

use crate::config::Config;
use crate::core::backend::SensorBackend;
use crate::error::Result;
use hardware::HardwareBackend;
use simulated::SimulatedBackend;

/// Create a backend based on configuration
pub fn create_backend(config: &Config) -> Result<Box<dyn SensorBackend>> {
    match config.backend.kind.as_str() {
        "hardware" => Ok(Box::new(HardwareBackend::new(&config.backend))),
        "simulated" => Ok(Box::new(SimulatedBackend::new(&config.backend.simulation))),
        other => Err(crate::error::Error::Config(format!(
            "unknown backend kind: {other}"
        ))),
    }
}

//! SensorBackend trait definition

use crate::core::types::{RateConfig, SensorDescriptor, SensorId, SensorSample};
use crate::error::Result;
use crossbeam_channel::Sender;

/// Liveness events a backend reports about itself
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendEvent {
    /// The backend process went away; the hub should reconnect
    Died,
}

/// Backend trait for hardware abstraction.
///
/// Two variants exist: one talking to the real device subsystem over a
/// socket, and a software model used when no hardware backend is present.
/// Both sinks must be registered before `connect` so samples and death
/// events have somewhere to go from the first moment of the connection.
pub trait SensorBackend: Send {
    /// Bind to the backend. The hardware variant retries a bounded number
    /// of times before giving up with `ConnectFailed`; the simulated
    /// variant always succeeds. Reinvoked by the hub on reconnect.
    fn connect(&mut self) -> Result<()>;

    /// Discovered sensor descriptors
    fn list_sensors(&self) -> Result<Vec<SensorDescriptor>>;

    /// Start producing samples for a sensor
    fn enable(&mut self, sensor_id: SensorId) -> Result<()>;

    /// Stop producing samples for a sensor
    fn disable(&mut self, sensor_id: SensorId) -> Result<()>;

    /// Apply one sampling configuration to a sensor.
    /// Non-success results are surfaced unchanged to the caller.
    fn configure(&mut self, sensor_id: SensorId, rate: RateConfig) -> Result<()>;

    /// Install the sink the backend pushes every arriving sample into
    fn register_sample_sink(&mut self, sink: Sender<SensorSample>);

    /// Install the sink the backend reports liveness events into
    fn register_lifecycle_sink(&mut self, sink: Sender<BackendEvent>);

    /// Tear the connection down; safe to call when never connected
    fn disconnect(&mut self) {}
}

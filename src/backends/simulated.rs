//! Simulated sensor backend
//!
//! A software model of the sensor chip set, used when no hardware backend
//! process is present. It exposes a small fixed set of sensors and runs one
//! generator thread producing plausible readings:
//!
//! | Sensor | Simulation method |
//! |--------|-------------------|
//! | Accelerometer | random split of 1g across three axes |
//! | Gyroscope | small gaussian rate noise around zero |
//! | Ambient light | uniform illuminance |
//! | Proximity | uniform distance over the sensor range |
//!
//! `connect` always succeeds, so the broker stays testable and functional
//! standalone. Tests can grab a [`SimProbe`] before handing the backend to
//! the hub to observe applied configurations or fake a process death.

use crate::config::SimulationConfig;
use crate::core::backend::{BackendEvent, SensorBackend};
use crate::core::types::{
    RateConfig, SensorDescriptor, SensorId, SensorSample, SENSOR_TYPE_ACCELEROMETER,
    SENSOR_TYPE_AMBIENT_LIGHT, SENSOR_TYPE_GYROSCOPE, SENSOR_TYPE_PROXIMITY,
};
use crate::error::{Error, Result};
use crossbeam_channel::Sender;
use log::{debug, info, warn};
use parking_lot::Mutex;
use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};
use rand_distr::StandardNormal;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

const GRAVITY: f32 = 9.8;

/// State shared between the backend handle, the generator thread, and
/// probes held by tests.
struct SimShared {
    enabled: Mutex<HashSet<SensorId>>,
    applied: Mutex<HashMap<SensorId, RateConfig>>,
    sample_tx: Mutex<Option<Sender<SensorSample>>>,
    lifecycle_tx: Mutex<Option<Sender<BackendEvent>>>,
    shutdown: AtomicBool,
}

/// Simulated backend variant
pub struct SimulatedBackend {
    descriptors: Vec<SensorDescriptor>,
    shared: Arc<SimShared>,
    generator: Option<JoinHandle<()>>,
    config: SimulationConfig,
}

/// Observation/fault-injection handle for tests
#[derive(Clone)]
pub struct SimProbe {
    shared: Arc<SimShared>,
}

impl SimProbe {
    /// Configuration most recently applied to a sensor, if any
    pub fn applied_config(&self, sensor_id: SensorId) -> Option<RateConfig> {
        self.shared.applied.lock().get(&sensor_id).copied()
    }

    pub fn is_enabled(&self, sensor_id: SensorId) -> bool {
        self.shared.enabled.lock().contains(&sensor_id)
    }

    /// Simulate the backend process dying: the generator stops, all
    /// enable/configure state is lost, and a death event is emitted.
    pub fn kill_backend(&self) {
        self.shared.shutdown.store(true, Ordering::Relaxed);
        self.shared.enabled.lock().clear();
        self.shared.applied.lock().clear();
        if let Some(tx) = self.shared.lifecycle_tx.lock().as_ref() {
            let _ = tx.send(BackendEvent::Died);
        }
    }
}

impl SimulatedBackend {
    pub fn new(config: &SimulationConfig) -> Self {
        Self {
            descriptors: builtin_sensors(),
            shared: Arc::new(SimShared {
                enabled: Mutex::new(HashSet::new()),
                applied: Mutex::new(HashMap::new()),
                sample_tx: Mutex::new(None),
                lifecycle_tx: Mutex::new(None),
                shutdown: AtomicBool::new(false),
            }),
            generator: None,
            config: config.clone(),
        }
    }

    /// Handle for observing and fault-injecting this backend
    pub fn probe(&self) -> SimProbe {
        SimProbe {
            shared: Arc::clone(&self.shared),
        }
    }

    fn descriptor(&self, sensor_id: SensorId) -> Result<&SensorDescriptor> {
        self.descriptors
            .iter()
            .find(|d| d.sensor_id == sensor_id)
            .ok_or(Error::InvalidSensor(sensor_id))
    }
}

impl SensorBackend for SimulatedBackend {
    fn connect(&mut self) -> Result<()> {
        // A previous incarnation may still be winding down after a
        // simulated death; collect it before starting fresh.
        if let Some(handle) = self.generator.take() {
            self.shared.shutdown.store(true, Ordering::Relaxed);
            let _ = handle.join();
        }
        self.shared.shutdown.store(false, Ordering::Relaxed);

        let shared = Arc::clone(&self.shared);
        let descriptors = self.descriptors.clone();
        let config = self.config.clone();
        let handle = thread::Builder::new()
            .name("sim-generator".to_string())
            .spawn(move || generator_loop(shared, descriptors, config))?;
        self.generator = Some(handle);

        info!("Simulated sensor backend connected");
        Ok(())
    }

    fn list_sensors(&self) -> Result<Vec<SensorDescriptor>> {
        Ok(self.descriptors.clone())
    }

    fn enable(&mut self, sensor_id: SensorId) -> Result<()> {
        self.descriptor(sensor_id)?;
        self.shared.enabled.lock().insert(sensor_id);
        debug!("Simulated sensor {} enabled", sensor_id);
        Ok(())
    }

    fn disable(&mut self, sensor_id: SensorId) -> Result<()> {
        self.descriptor(sensor_id)?;
        self.shared.enabled.lock().remove(&sensor_id);
        self.shared.applied.lock().remove(&sensor_id);
        debug!("Simulated sensor {} disabled", sensor_id);
        Ok(())
    }

    fn configure(&mut self, sensor_id: SensorId, rate: RateConfig) -> Result<()> {
        self.descriptor(sensor_id)?;
        if rate.sampling_period_ns <= 0 {
            return Err(Error::ConfigureFailed(format!(
                "non-positive sampling period for sensor {sensor_id}"
            )));
        }
        self.shared.applied.lock().insert(sensor_id, rate);
        Ok(())
    }

    fn register_sample_sink(&mut self, sink: Sender<SensorSample>) {
        *self.shared.sample_tx.lock() = Some(sink);
    }

    fn register_lifecycle_sink(&mut self, sink: Sender<BackendEvent>) {
        *self.shared.lifecycle_tx.lock() = Some(sink);
    }

    fn disconnect(&mut self) {
        self.shared.shutdown.store(true, Ordering::Relaxed);
        if let Some(handle) = self.generator.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for SimulatedBackend {
    fn drop(&mut self) {
        self.disconnect();
    }
}

/// The fixed sensor set of the simulated chip
fn builtin_sensors() -> Vec<SensorDescriptor> {
    let sensor = |sensor_id, type_id, name: &str, max_range, resolution, power, min_ns, fifo| {
        SensorDescriptor {
            sensor_id,
            type_id,
            name: name.to_string(),
            vendor: "indriya".to_string(),
            firmware_version: "1.0.0".to_string(),
            hardware_version: "1.0.0".to_string(),
            max_range,
            resolution,
            power,
            min_sample_period_ns: min_ns,
            max_sample_period_ns: 1_000_000_000,
            fifo_max_event_count: fifo,
        }
    };
    vec![
        sensor(1, SENSOR_TYPE_ACCELEROMETER, "sim-accel", 78.4, 1e-4, 0.5, 20_000_000, 100),
        sensor(2, SENSOR_TYPE_GYROSCOPE, "sim-gyro", 34.9, 1e-4, 0.6, 10_000_000, 100),
        sensor(5, SENSOR_TYPE_AMBIENT_LIGHT, "sim-light", 10_000.0, 0.1, 0.1, 100_000_000, 10),
        sensor(8, SENSOR_TYPE_PROXIMITY, "sim-prox", 5.0, 1.0, 0.1, 20_000_000, 100),
    ]
}

fn generator_loop(
    shared: Arc<SimShared>,
    descriptors: Vec<SensorDescriptor>,
    config: SimulationConfig,
) {
    let mut rng = if config.random_seed == 0 {
        SmallRng::from_entropy()
    } else {
        SmallRng::seed_from_u64(config.random_seed)
    };
    let default_interval = Duration::from_millis(config.default_interval_ms);
    debug!("Simulation generator started");

    while !shared.shutdown.load(Ordering::Relaxed) {
        let enabled: Vec<SensorId> = shared.enabled.lock().iter().copied().collect();

        for sensor_id in &enabled {
            let Some(descriptor) = descriptors.iter().find(|d| d.sensor_id == *sensor_id) else {
                continue;
            };
            let sample = generate_sample(descriptor, &mut rng);
            if let Some(tx) = shared.sample_tx.lock().as_ref() {
                // Non-blocking: a congested broker drops the tick
                if tx.try_send(sample).is_err() {
                    warn!("Sample sink full, dropping tick of sensor {}", sensor_id);
                }
            }
        }

        // Tick at the fastest applied rate, or idle at the default
        let interval = {
            let applied = shared.applied.lock();
            enabled
                .iter()
                .filter_map(|id| applied.get(id))
                .map(|rate| Duration::from_nanos(rate.sampling_period_ns.max(0) as u64))
                .min()
                .unwrap_or(default_interval)
        };
        sleep_interruptible(&shared, interval);
    }
    debug!("Simulation generator terminated");
}

/// Sleep in small slices so shutdown (and thread join) stays responsive
/// even when the generator idles at a long interval
fn sleep_interruptible(shared: &SimShared, interval: Duration) {
    let mut remaining = interval;
    while remaining > Duration::ZERO && !shared.shutdown.load(Ordering::Relaxed) {
        let step = remaining.min(Duration::from_millis(20));
        thread::sleep(step);
        remaining = remaining.saturating_sub(step);
    }
}

fn generate_sample(descriptor: &SensorDescriptor, rng: &mut SmallRng) -> SensorSample {
    let timestamp_ns = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos() as i64)
        .unwrap_or(0);
    let mut sample = SensorSample::new(descriptor.sensor_id, timestamp_ns);
    sample.option = 3;
    match descriptor.type_id {
        SENSOR_TYPE_ACCELEROMETER => {
            // Split 1g of magnitude over three axes
            let target = GRAVITY * GRAVITY;
            let mut a = rng.gen_range(0.0..target);
            let mut b = rng.gen_range(0.0..target);
            if a > b {
                std::mem::swap(&mut a, &mut b);
            }
            sample.set_floats(&[a.sqrt(), (b - a).sqrt(), (target - b).sqrt()]);
        }
        SENSOR_TYPE_GYROSCOPE => {
            let noise = |rng: &mut SmallRng| {
                let n: f32 = rng.sample(StandardNormal);
                n * 0.01
            };
            sample.set_floats(&[noise(rng), noise(rng), noise(rng)]);
        }
        SENSOR_TYPE_AMBIENT_LIGHT => {
            sample.set_floats(&[rng.gen_range(0.0..descriptor.max_range)]);
        }
        SENSOR_TYPE_PROXIMITY => {
            sample.set_floats(&[rng.gen_range(0.0..descriptor.max_range)]);
        }
        _ => {
            warn!("No generator for sensor type {}", descriptor.type_id);
        }
    }
    sample
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::create_sample_channel;

    #[test]
    fn test_enable_unknown_sensor_is_rejected() {
        let mut backend = SimulatedBackend::new(&SimulationConfig::default());
        assert!(matches!(backend.enable(999), Err(Error::InvalidSensor(999))));
    }

    #[test]
    fn test_configure_tracks_applied_rate() {
        let mut backend = SimulatedBackend::new(&SimulationConfig::default());
        let probe = backend.probe();
        backend
            .configure(1, RateConfig::new(20_000_000, 500_000_000))
            .unwrap();
        assert_eq!(
            probe.applied_config(1),
            Some(RateConfig::new(20_000_000, 500_000_000))
        );
        backend.disable(1).unwrap();
        assert_eq!(probe.applied_config(1), None);
    }

    #[test]
    fn test_generator_produces_samples_for_enabled_sensors() {
        let config = SimulationConfig {
            default_interval_ms: 5,
            random_seed: 42,
        };
        let mut backend = SimulatedBackend::new(&config);
        let (tx, rx) = create_sample_channel();
        backend.register_sample_sink(tx);
        backend.connect().unwrap();
        backend.enable(8).unwrap();

        let sample = rx
            .recv_timeout(Duration::from_secs(2))
            .expect("generator should produce a sample");
        assert_eq!(sample.sensor_id, 8);
        let distance = sample.float(0).unwrap();
        assert!((0.0..=5.0).contains(&distance));

        backend.disconnect();
    }

    #[test]
    fn test_kill_backend_emits_death_event_and_drops_state() {
        let mut backend = SimulatedBackend::new(&SimulationConfig::default());
        let probe = backend.probe();
        let (life_tx, life_rx) = crossbeam_channel::bounded(4);
        backend.register_lifecycle_sink(life_tx);
        backend.connect().unwrap();
        backend.enable(1).unwrap();
        backend
            .configure(1, RateConfig::new(20_000_000, 100_000_000))
            .unwrap();

        probe.kill_backend();
        assert_eq!(
            life_rx.recv_timeout(Duration::from_secs(1)).unwrap(),
            BackendEvent::Died
        );
        assert!(!probe.is_enabled(1));
        assert_eq!(probe.applied_config(1), None);
    }
}

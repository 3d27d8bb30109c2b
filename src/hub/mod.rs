//! Subscription hub
//!
//! The hub arbitrates all clients' sampling requests for each sensor into
//! one hardware configuration: the most demanding request wins on both
//! axes (smallest sampling period, smallest report delay). It owns the
//! discovered descriptor table, the subscription state, the delivery loop,
//! and the backend reconnect policy. Subscriptions survive a backend death;
//! once the connection is back, the retained aggregate configuration is
//! re-applied without any client resubscribing.

pub mod delivery;
pub mod subscriptions;

use crate::channel::DataChannel;
use crate::config::Config;
use crate::core::backend::{BackendEvent, SensorBackend};
use crate::core::types::{
    create_sample_channel, ClientId, RateConfig, SensorDescriptor, SensorId, Subscription,
};
use crate::error::{Error, Result};
use crossbeam_channel::{Receiver, RecvTimeoutError};
use delivery::{spawn_delivery_loop, DeliveryStats};
use log::{debug, info, warn};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;
use subscriptions::SubscriptionTable;

/// Hardware action derived while holding the manager lock, executed after
/// releasing it so no backend I/O runs under the lock.
enum Teardown {
    Disable,
    Reapply(RateConfig),
    Nothing,
}

/// The subscription-arbitration manager
pub struct SensorHub {
    backend: Arc<Mutex<Box<dyn SensorBackend>>>,
    descriptors: Arc<Mutex<HashMap<SensorId, SensorDescriptor>>>,
    table: Arc<Mutex<SubscriptionTable>>,
    stats: Arc<DeliveryStats>,
    shutdown: Arc<AtomicBool>,
    delivery: Option<JoinHandle<()>>,
    watcher: Option<JoinHandle<()>>,
    config: Config,
}

impl SensorHub {
    pub fn new(backend: Box<dyn SensorBackend>, config: Config) -> Self {
        Self {
            backend: Arc::new(Mutex::new(backend)),
            descriptors: Arc::new(Mutex::new(HashMap::new())),
            table: Arc::new(Mutex::new(SubscriptionTable::new(config.channel.max_clients))),
            stats: Arc::new(DeliveryStats::default()),
            shutdown: Arc::new(AtomicBool::new(false)),
            delivery: None,
            watcher: None,
            config,
        }
    }

    /// Connect the backend, install its sensor list, and start the delivery
    /// and death-watch threads. A `ConnectFailed` here is a fault, not a
    /// process failure; the caller may retry later.
    pub fn start(&mut self) -> Result<()> {
        let (sample_tx, sample_rx) = create_sample_channel();
        let (life_tx, life_rx) = crossbeam_channel::bounded(4);

        let sensors = {
            let mut backend = self.backend.lock();
            backend.register_sample_sink(sample_tx);
            backend.register_lifecycle_sink(life_tx);
            backend.connect()?;
            backend.list_sensors()?
        };
        self.register_backend(sensors);

        self.delivery = Some(spawn_delivery_loop(
            sample_rx,
            Arc::clone(&self.table),
            Arc::clone(&self.shutdown),
            Arc::clone(&self.stats),
        )?);

        let backend = Arc::clone(&self.backend);
        let descriptors = Arc::clone(&self.descriptors);
        let table = Arc::clone(&self.table);
        let shutdown = Arc::clone(&self.shutdown);
        self.watcher = Some(
            thread::Builder::new()
                .name("backend-watch".to_string())
                .spawn(move || {
                    watch_loop(life_rx, backend, descriptors, table, shutdown);
                })?,
        );

        info!(
            "Sensor hub started with {} sensors",
            self.descriptors.lock().len()
        );
        Ok(())
    }

    /// Install the discovered sensor list. Idempotent; replaces any prior
    /// registration.
    pub fn register_backend(&self, sensors: Vec<SensorDescriptor>) {
        let mut descriptors = self.descriptors.lock();
        descriptors.clear();
        for descriptor in sensors {
            descriptors.insert(descriptor.sensor_id, descriptor);
        }
        debug!("Registered {} sensor descriptors", descriptors.len());
    }

    /// List of discovered sensors, for the control surface
    pub fn list_sensors(&self) -> Vec<SensorDescriptor> {
        self.descriptors.lock().values().cloned().collect()
    }

    /// Subscribe one client to one sensor.
    ///
    /// The stored entry is the request clamped against the descriptor's
    /// limits; the hardware gets the aggregate over all enabled entries.
    /// Reconfiguration is skipped when this request is strictly less
    /// demanding than the active aggregate on both axes - configuring to an
    /// already-sufficient setting would be a harmless no-op.
    pub fn subscribe(
        &self,
        sensor_id: SensorId,
        client_id: ClientId,
        sampling_period_ns: i64,
        max_report_delay_ns: i64,
    ) -> Result<()> {
        if sampling_period_ns < 0 || max_report_delay_ns < 0 {
            return Err(Error::InvalidParameter(
                "sampling period and report delay must be non-negative".to_string(),
            ));
        }
        let descriptor = self.descriptors.lock().get(&sensor_id).cloned();
        let known = descriptor.is_some();
        let rate = match descriptor {
            Some(descriptor) => {
                clamp_request(&descriptor, sampling_period_ns, max_report_delay_ns)?
            }
            None => {
                // Recover unknown ids with a best-effort config instead of
                // rejecting: a client may legitimately resubscribe to an id
                // the current backend incarnation has not announced.
                warn!(
                    "Subscribe for unknown sensor {}, synthesizing fallback config",
                    sensor_id
                );
                RateConfig::new(sampling_period_ns, max_report_delay_ns)
            }
        };

        let (aggregate, skip_configure, channel, replay) = {
            let mut table = self.table.lock();
            table.update(
                sensor_id,
                client_id,
                Subscription {
                    rate,
                    enabled: true,
                },
            );
            let aggregate = table.best_rate(sensor_id).unwrap_or(rate);
            let skip = rate.sampling_period_ns > aggregate.sampling_period_ns
                && rate.max_report_delay_ns > aggregate.max_report_delay_ns;
            (
                aggregate,
                skip,
                table.channel(client_id),
                table.stored_sample(sensor_id),
            )
        };

        if known {
            let mut backend = self.backend.lock();
            if !skip_configure {
                backend.configure(sensor_id, aggregate)?;
            }
            backend.enable(sensor_id)?;
        }
        debug!(
            "Client {} subscribed to sensor {} ({} ns / {} ns, aggregate {} ns / {} ns)",
            client_id,
            sensor_id,
            rate.sampling_period_ns,
            rate.max_report_delay_ns,
            aggregate.sampling_period_ns,
            aggregate.max_report_delay_ns,
        );

        // Hand the new subscriber last-known state instead of making it
        // wait for the next hardware tick
        if let (Some(channel), Some(sample)) = (channel, replay) {
            let _ = channel.send(&sample);
        }
        Ok(())
    }

    /// Remove one client's subscription. Disables the sensor when the last
    /// enabled subscriber leaves, otherwise re-applies the aggregate of the
    /// remaining entries. Always safe to call, even for sensors that were
    /// never enabled.
    pub fn unsubscribe(&self, sensor_id: SensorId, client_id: ClientId) -> Result<()> {
        let (known, proximity) = {
            let descriptors = self.descriptors.lock();
            match descriptors.get(&sensor_id) {
                Some(d) => (true, d.is_proximity()),
                None => (false, false),
            }
        };

        let action = {
            let mut table = self.table.lock();
            if !table.contains(sensor_id, client_id) {
                debug!(
                    "Unsubscribe without subscription (sensor {}, client {}), nothing to do",
                    sensor_id, client_id
                );
                return Ok(());
            }
            let exclusive = table.only_client_enabled(sensor_id, client_id);
            table.remove(sensor_id, client_id);
            if exclusive || !table.has_enabled(sensor_id) {
                table.clear_sensor(sensor_id);
                if proximity {
                    // The cache must not report stale "near" state to the
                    // next subscriber
                    table.reset_stored_to_far(sensor_id);
                }
                Teardown::Disable
            } else {
                match table.best_rate(sensor_id) {
                    Some(rate) => Teardown::Reapply(rate),
                    None => Teardown::Nothing,
                }
            }
        };

        if known {
            let mut backend = self.backend.lock();
            match action {
                Teardown::Disable => {
                    backend.disable(sensor_id)?;
                    info!("Sensor {} disabled, last subscriber left", sensor_id);
                }
                Teardown::Reapply(rate) => {
                    backend.configure(sensor_id, rate)?;
                }
                Teardown::Nothing => {}
            }
        }
        Ok(())
    }

    /// True iff `client_id` is the only enabled subscriber of the sensor.
    /// Callers use this to decide whether disabling on this client may
    /// safely reset hardware state.
    pub fn is_exclusively_mine(&self, sensor_id: SensorId, client_id: ClientId) -> bool {
        self.table.lock().only_client_enabled(sensor_id, client_id)
    }

    /// Allocate the data channel of a client session
    pub fn open_channel(&self, client_id: ClientId) -> Result<Arc<DataChannel>> {
        let channel = Arc::new(DataChannel::create(&self.config.channel)?);
        self.table
            .lock()
            .register_channel(client_id, Arc::clone(&channel))?;
        info!("Opened data channel for client {}", client_id);
        Ok(channel)
    }

    /// Client-death cleanup: drop every subscription of the client with the
    /// same last-subscriber teardown as `unsubscribe`, then close its
    /// channel.
    pub fn close_channel(&self, client_id: ClientId) {
        let sensors = self.table.lock().sensors_of_client(client_id);
        for sensor_id in sensors {
            if let Err(e) = self.unsubscribe(sensor_id, client_id) {
                warn!(
                    "Cleanup unsubscribe failed (sensor {}, client {}): {}",
                    sensor_id, client_id, e
                );
            }
        }
        if let Some(channel) = self.table.lock().remove_channel(client_id) {
            channel.close();
        }
        info!("Closed data channel of client {}", client_id);
    }

    /// Delivered/dropped counters of the delivery loop
    pub fn delivery_stats(&self) -> (u64, u64) {
        self.stats.snapshot()
    }

    pub fn client_count(&self) -> usize {
        self.table.lock().channel_count()
    }

    /// Stop background threads and disconnect the backend
    pub fn stop(&mut self) {
        self.shutdown.store(true, Ordering::Relaxed);
        if let Some(handle) = self.delivery.take() {
            let _ = handle.join();
        }
        if let Some(handle) = self.watcher.take() {
            let _ = handle.join();
        }
        self.backend.lock().disconnect();
    }
}

impl Drop for SensorHub {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Clamp one request against the descriptor's limits.
///
/// The period is floored at the sensor's minimum; the delay is capped at
/// period x FIFO depth so the hardware is never asked to queue more samples
/// than it can hold. A zero period is rejected outright and an overflowing
/// product fails with no state change.
fn clamp_request(
    descriptor: &SensorDescriptor,
    sampling_period_ns: i64,
    max_report_delay_ns: i64,
) -> Result<RateConfig> {
    if sampling_period_ns == 0 {
        return Err(Error::InvalidParameter(format!(
            "zero sampling period for sensor {}",
            descriptor.sensor_id
        )));
    }
    let period = sampling_period_ns.max(descriptor.min_sample_period_ns);
    let supported_delay = period
        .checked_mul(descriptor.fifo_max_event_count)
        .ok_or(Error::Overflow(descriptor.sensor_id))?;
    Ok(RateConfig::new(
        period,
        max_report_delay_ns.min(supported_delay),
    ))
}

/// Death-watch loop: reconnect with the bounded retry policy and re-apply
/// the retained aggregate configuration for every sensor that still has an
/// enabled subscriber.
fn watch_loop(
    events: Receiver<BackendEvent>,
    backend: Arc<Mutex<Box<dyn SensorBackend>>>,
    descriptors: Arc<Mutex<HashMap<SensorId, SensorDescriptor>>>,
    table: Arc<Mutex<SubscriptionTable>>,
    shutdown: Arc<AtomicBool>,
) {
    debug!("Backend watch thread started");
    while !shutdown.load(Ordering::Relaxed) {
        match events.recv_timeout(Duration::from_millis(100)) {
            Ok(BackendEvent::Died) => {
                warn!("Backend died, reconnecting; subscriptions are retained");
                reconnect(&backend, &descriptors, &table);
            }
            Err(RecvTimeoutError::Timeout) => continue,
            Err(RecvTimeoutError::Disconnected) => break,
        }
    }
    debug!("Backend watch thread exiting");
}

fn reconnect(
    backend: &Mutex<Box<dyn SensorBackend>>,
    descriptors: &Mutex<HashMap<SensorId, SensorDescriptor>>,
    table: &Mutex<SubscriptionTable>,
) {
    let mut backend = backend.lock();
    if let Err(e) = backend.connect() {
        log::error!("Backend reconnect failed permanently: {}", e);
        return;
    }
    match backend.list_sensors() {
        Ok(sensors) => {
            let mut descriptors = descriptors.lock();
            descriptors.clear();
            for descriptor in sensors {
                descriptors.insert(descriptor.sensor_id, descriptor);
            }
        }
        Err(e) => {
            log::error!("Sensor list unavailable after reconnect: {}", e);
            return;
        }
    }

    // Manager lock only long enough to read the retained aggregates
    let sensor_ids: Vec<SensorId> = descriptors.lock().keys().copied().collect();
    let to_restore: Vec<(SensorId, RateConfig)> = {
        let table = table.lock();
        sensor_ids
            .into_iter()
            .filter(|id| table.has_enabled(*id))
            .filter_map(|id| table.best_rate(id).map(|rate| (id, rate)))
            .collect()
    };
    let mut restored = 0;
    for (sensor_id, rate) in to_restore {
        if let Err(e) = backend.configure(sensor_id, rate) {
            warn!("Restore configure failed for sensor {}: {}", sensor_id, e);
            continue;
        }
        if let Err(e) = backend.enable(sensor_id) {
            warn!("Restore enable failed for sensor {}: {}", sensor_id, e);
            continue;
        }
        restored += 1;
    }
    info!("Backend reconnected, {} sensor configurations restored", restored);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backends::simulated::{SimProbe, SimulatedBackend};
    use crate::config::SimulationConfig;
    use crate::core::types::SensorSample;

    const MS: i64 = 1_000_000;
    // The simulated accelerometer: min period 20ms, FIFO depth 100
    const ACCEL: SensorId = 1;
    const PROX: SensorId = 8;

    fn started_hub() -> (SensorHub, SimProbe) {
        let config = Config::defaults();
        // A long idle interval keeps the generator quiet, so assertions on
        // stored samples and applied configs are deterministic.
        let backend = SimulatedBackend::new(&SimulationConfig {
            default_interval_ms: 10_000,
            random_seed: 7,
        });
        let probe = backend.probe();
        let mut hub = SensorHub::new(Box::new(backend), config);
        hub.start().expect("hub start");
        (hub, probe)
    }

    #[test]
    fn test_arbitration_takes_the_most_demanding_request() {
        let (hub, probe) = started_hub();

        // Client A: 50ms period, 500ms delay. 500ms <= 50ms * 100, so the
        // delay survives the FIFO cap.
        hub.subscribe(ACCEL, 100, 50 * MS, 500 * MS).unwrap();
        assert_eq!(
            probe.applied_config(ACCEL),
            Some(RateConfig::new(50 * MS, 500 * MS))
        );

        // Client B: 10ms period floors at the 20ms hardware minimum; its
        // 50ms delay now drives the aggregate.
        hub.subscribe(ACCEL, 101, 10 * MS, 50 * MS).unwrap();
        assert_eq!(
            probe.applied_config(ACCEL),
            Some(RateConfig::new(20 * MS, 50 * MS))
        );
        assert!(probe.is_enabled(ACCEL));
    }

    #[test]
    fn test_less_demanding_request_does_not_reconfigure() {
        let (hub, probe) = started_hub();
        hub.subscribe(ACCEL, 100, 30 * MS, 100 * MS).unwrap();
        let before = probe.applied_config(ACCEL);

        // Strictly less demanding on both axes: hardware already satisfies
        // it, so nothing is re-applied.
        hub.subscribe(ACCEL, 101, 500 * MS, 900 * MS).unwrap();
        assert_eq!(probe.applied_config(ACCEL), before);
    }

    #[test]
    fn test_unknown_sensor_falls_back_instead_of_failing() {
        let (hub, probe) = started_hub();
        hub.subscribe(999, 7, 100 * MS, 100 * MS).unwrap();

        assert!(hub.is_exclusively_mine(999, 7));
        // No hardware counterpart exists, so nothing was applied
        assert_eq!(probe.applied_config(999), None);

        // The fallback entry behaves like any other on teardown
        hub.unsubscribe(999, 7).unwrap();
        assert!(!hub.is_exclusively_mine(999, 7));
    }

    #[test]
    fn test_zero_period_and_overflow_are_rejected() {
        let (hub, probe) = started_hub();
        assert!(matches!(
            hub.subscribe(ACCEL, 100, 0, 100 * MS),
            Err(Error::InvalidParameter(_))
        ));
        assert!(matches!(
            hub.subscribe(ACCEL, 100, i64::MAX / 2, i64::MAX),
            Err(Error::Overflow(ACCEL))
        ));
        // Rejections leave no state behind
        assert!(!hub.is_exclusively_mine(ACCEL, 100));
        assert_eq!(probe.applied_config(ACCEL), None);
    }

    #[test]
    fn test_subscribe_unsubscribe_round_trip_restores_aggregate() {
        let (hub, probe) = started_hub();
        hub.subscribe(ACCEL, 100, 50 * MS, 500 * MS).unwrap();
        let baseline = probe.applied_config(ACCEL);

        hub.subscribe(ACCEL, 101, 20 * MS, 50 * MS).unwrap();
        hub.unsubscribe(ACCEL, 101).unwrap();

        assert_eq!(probe.applied_config(ACCEL), baseline);
        assert!(hub.is_exclusively_mine(ACCEL, 100));
    }

    #[test]
    fn test_last_unsubscribe_disables_and_resets_proximity_cache() {
        let (hub, probe) = started_hub();
        hub.subscribe(PROX, 100, 100 * MS, 100 * MS).unwrap();
        assert!(probe.is_enabled(PROX));

        // A "near" reading was the last thing delivered
        let near = SensorSample::with_floats(PROX, 1, &[0.0]);
        hub.table.lock().store_sample(&near);

        hub.unsubscribe(PROX, 100).unwrap();
        assert!(!probe.is_enabled(PROX));
        let stored = hub.table.lock().stored_sample(PROX).unwrap();
        assert_eq!(stored.float(0), Some(crate::core::types::PROXIMITY_FAR));
    }

    #[test]
    fn test_reconnect_restores_retained_configuration() {
        let (hub, probe) = started_hub();
        hub.subscribe(ACCEL, 100, 50 * MS, 500 * MS).unwrap();
        hub.subscribe(PROX, 100, 100 * MS, 200 * MS).unwrap();
        let accel_rate = probe.applied_config(ACCEL).unwrap();

        probe.kill_backend();

        // The watch thread reconnects and re-applies the retained
        // aggregates without any client resubscribing
        for _ in 0..100 {
            if probe.applied_config(ACCEL).is_some() && probe.applied_config(PROX).is_some() {
                break;
            }
            thread::sleep(Duration::from_millis(10));
        }
        assert_eq!(probe.applied_config(ACCEL), Some(accel_rate));
        assert!(probe.is_enabled(ACCEL));
        assert!(probe.is_enabled(PROX));
        assert!(hub.is_exclusively_mine(ACCEL, 100));
    }

    #[test]
    fn test_subscribe_replays_stored_sample_to_new_client() {
        let (hub, _probe) = started_hub();
        let channel = hub.open_channel(100).unwrap();

        let last = SensorSample::with_floats(ACCEL, 99, &[0.1, 0.2, 9.8]);
        hub.table.lock().store_sample(&last);

        hub.subscribe(ACCEL, 100, 50 * MS, 500 * MS).unwrap();
        let replayed = channel.receive_sample().unwrap().expect("replayed record");
        assert_eq!(replayed, last);
    }

    #[test]
    fn test_close_channel_cleans_up_client_state() {
        let (hub, probe) = started_hub();
        hub.open_channel(100).unwrap();
        hub.subscribe(ACCEL, 100, 50 * MS, 500 * MS).unwrap();
        assert_eq!(hub.client_count(), 1);

        hub.close_channel(100);
        assert_eq!(hub.client_count(), 0);
        assert!(!probe.is_enabled(ACCEL));
        assert!(!hub.is_exclusively_mine(ACCEL, 100));
    }
}

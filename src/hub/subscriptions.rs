//! Per-(sensor, client) subscription bookkeeping
//!
//! All maps here are owned by the hub and mutated only under its manager
//! lock; this module itself is lock-free and unit-testable in isolation.

use crate::channel::DataChannel;
use crate::core::types::{
    ClientId, RateConfig, SensorId, SensorSample, Subscription, PROXIMITY_FAR,
};
use crate::error::{Error, Result};
use std::collections::HashMap;
use std::sync::Arc;

/// One delivery target for a sensor: the client's channel plus the
/// down-sampling divisor derived from its requested period.
pub struct FanoutTarget {
    pub client_id: ClientId,
    pub channel: Arc<DataChannel>,
    /// Deliver every Nth sample; 1 = every sample
    pub every_nth: u64,
}

/// Desired configuration and channel registry for every subscriber.
#[derive(Default)]
pub struct SubscriptionTable {
    /// sensor -> client -> requested configuration
    subscriptions: HashMap<SensorId, HashMap<ClientId, Subscription>>,
    /// client -> its open data channel
    channels: HashMap<ClientId, Arc<DataChannel>>,
    /// most recent sample per sensor, replayed to late joiners
    stored: HashMap<SensorId, SensorSample>,
    /// open-channel cap
    max_clients: usize,
}

impl SubscriptionTable {
    pub fn new(max_clients: usize) -> Self {
        Self {
            max_clients,
            ..Default::default()
        }
    }

    /// Create or update one client's subscription; latest request wins
    pub fn update(&mut self, sensor_id: SensorId, client_id: ClientId, sub: Subscription) {
        self.subscriptions
            .entry(sensor_id)
            .or_default()
            .insert(client_id, sub);
    }

    /// Remove one client's subscription. Returns whether it existed.
    /// Drops the sensor's map entirely when the last client leaves.
    pub fn remove(&mut self, sensor_id: SensorId, client_id: ClientId) -> bool {
        let Some(clients) = self.subscriptions.get_mut(&sensor_id) else {
            return false;
        };
        let existed = clients.remove(&client_id).is_some();
        if clients.is_empty() {
            self.subscriptions.remove(&sensor_id);
        }
        existed
    }

    pub fn contains(&self, sensor_id: SensorId, client_id: ClientId) -> bool {
        self.subscriptions
            .get(&sensor_id)
            .is_some_and(|clients| clients.contains_key(&client_id))
    }

    /// Drop all state for a sensor (subscriptions only; the stored sample
    /// survives so teardown policy can rewrite it)
    pub fn clear_sensor(&mut self, sensor_id: SensorId) {
        self.subscriptions.remove(&sensor_id);
    }

    /// Sensors this client subscribes to, used for client-death cleanup
    pub fn sensors_of_client(&self, client_id: ClientId) -> Vec<SensorId> {
        self.subscriptions
            .iter()
            .filter(|(_, clients)| clients.contains_key(&client_id))
            .map(|(sensor_id, _)| *sensor_id)
            .collect()
    }

    /// Aggregate configuration for a sensor: the minimum of sampling period
    /// and of report delay over all enabled subscriptions. The most
    /// demanding client determines the physical configuration; this is a
    /// min-reduction, never an average.
    pub fn best_rate(&self, sensor_id: SensorId) -> Option<RateConfig> {
        let clients = self.subscriptions.get(&sensor_id)?;
        let mut best: Option<RateConfig> = None;
        for sub in clients.values().filter(|sub| sub.enabled) {
            best = Some(match best {
                None => sub.rate,
                Some(cur) => RateConfig::new(
                    cur.sampling_period_ns.min(sub.rate.sampling_period_ns),
                    cur.max_report_delay_ns.min(sub.rate.max_report_delay_ns),
                ),
            });
        }
        best
    }

    /// Whether any client has the sensor enabled
    pub fn has_enabled(&self, sensor_id: SensorId) -> bool {
        self.subscriptions
            .get(&sensor_id)
            .is_some_and(|clients| clients.values().any(|sub| sub.enabled))
    }

    /// True iff `client_id` is the only client with the sensor enabled
    pub fn only_client_enabled(&self, sensor_id: SensorId, client_id: ClientId) -> bool {
        let Some(clients) = self.subscriptions.get(&sensor_id) else {
            return false;
        };
        let mut found_self = false;
        for (id, sub) in clients {
            if !sub.enabled {
                continue;
            }
            if *id != client_id {
                return false;
            }
            found_self = true;
        }
        found_self
    }

    /// Register a client's channel, enforcing the open-channel cap
    pub fn register_channel(
        &mut self,
        client_id: ClientId,
        channel: Arc<DataChannel>,
    ) -> Result<()> {
        if !self.channels.contains_key(&client_id) && self.channels.len() >= self.max_clients {
            return Err(Error::TooManyClients(self.max_clients));
        }
        self.channels.insert(client_id, channel);
        Ok(())
    }

    pub fn channel(&self, client_id: ClientId) -> Option<Arc<DataChannel>> {
        self.channels.get(&client_id).cloned()
    }

    pub fn remove_channel(&mut self, client_id: ClientId) -> Option<Arc<DataChannel>> {
        self.channels.remove(&client_id)
    }

    pub fn channel_count(&self) -> usize {
        self.channels.len()
    }

    /// Delivery targets for one sensor: every enabled subscriber that has
    /// an active channel, with its down-sampling divisor relative to the
    /// aggregate rate.
    pub fn fanout_targets(&self, sensor_id: SensorId) -> Vec<FanoutTarget> {
        let Some(clients) = self.subscriptions.get(&sensor_id) else {
            return Vec::new();
        };
        let best_period = self
            .best_rate(sensor_id)
            .map(|rate| rate.sampling_period_ns)
            .unwrap_or(0);
        let mut targets = Vec::new();
        for (client_id, sub) in clients {
            if !sub.enabled {
                continue;
            }
            let Some(channel) = self.channels.get(client_id) else {
                continue;
            };
            if !channel.is_active() {
                continue;
            }
            let every_nth = if best_period > 0 {
                (sub.rate.sampling_period_ns / best_period).max(1) as u64
            } else {
                1
            };
            targets.push(FanoutTarget {
                client_id: *client_id,
                channel: Arc::clone(channel),
                every_nth,
            });
        }
        targets
    }

    /// Remember the most recent sample for a sensor
    pub fn store_sample(&mut self, sample: &SensorSample) {
        self.stored.insert(sample.sensor_id, *sample);
    }

    pub fn stored_sample(&self, sensor_id: SensorId) -> Option<SensorSample> {
        self.stored.get(&sensor_id).copied()
    }

    /// Overwrite the stored sample's distance value with the defined "far"
    /// reading. Applied to proximity-class sensors when their last
    /// subscriber leaves, so the cache never reports stale "near" state.
    pub fn reset_stored_to_far(&mut self, sensor_id: SensorId) {
        if let Some(sample) = self.stored.get_mut(&sensor_id) {
            sample.set_float(0, PROXIMITY_FAR);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;

    const MS: i64 = 1_000_000;

    fn sub(period_ms: i64, delay_ms: i64) -> Subscription {
        Subscription {
            rate: RateConfig::new(period_ms * MS, delay_ms * MS),
            enabled: true,
        }
    }

    #[test]
    fn test_best_rate_is_min_reduction() {
        let mut table = SubscriptionTable::new(16);
        table.update(1, 100, sub(50, 500));
        table.update(1, 101, sub(20, 800));
        table.update(1, 102, sub(35, 60));

        let best = table.best_rate(1).unwrap();
        assert_eq!(best.sampling_period_ns, 20 * MS);
        assert_eq!(best.max_report_delay_ns, 60 * MS);
    }

    #[test]
    fn test_best_rate_ignores_disabled_entries() {
        let mut table = SubscriptionTable::new(16);
        table.update(1, 100, sub(50, 500));
        table.update(
            1,
            101,
            Subscription {
                rate: RateConfig::new(5 * MS, 5 * MS),
                enabled: false,
            },
        );

        let best = table.best_rate(1).unwrap();
        assert_eq!(best.sampling_period_ns, 50 * MS);
    }

    #[test]
    fn test_only_client_enabled() {
        let mut table = SubscriptionTable::new(16);
        table.update(1, 100, sub(50, 500));
        assert!(table.only_client_enabled(1, 100));

        table.update(1, 101, sub(20, 100));
        assert!(!table.only_client_enabled(1, 100));

        table.remove(1, 101);
        assert!(table.only_client_enabled(1, 100));
        assert!(!table.only_client_enabled(2, 100));
    }

    #[test]
    fn test_remove_drops_empty_sensor_entry() {
        let mut table = SubscriptionTable::new(16);
        table.update(1, 100, sub(50, 500));
        assert!(table.remove(1, 100));
        assert!(!table.remove(1, 100));
        assert!(table.best_rate(1).is_none());
        assert!(!table.has_enabled(1));
    }

    #[test]
    fn test_channel_cap() {
        let mut table = SubscriptionTable::new(2);
        let cfg = Config::defaults().channel;
        table
            .register_channel(1, Arc::new(DataChannel::create(&cfg).unwrap()))
            .unwrap();
        table
            .register_channel(2, Arc::new(DataChannel::create(&cfg).unwrap()))
            .unwrap();
        let err = table
            .register_channel(3, Arc::new(DataChannel::create(&cfg).unwrap()))
            .unwrap_err();
        assert!(matches!(err, Error::TooManyClients(2)));
        // replacing an existing client's channel is not a new slot
        table
            .register_channel(2, Arc::new(DataChannel::create(&cfg).unwrap()))
            .unwrap();
    }

    #[test]
    fn test_fanout_downsampling_ratio() {
        let mut table = SubscriptionTable::new(16);
        let cfg = Config::defaults().channel;
        table
            .register_channel(100, Arc::new(DataChannel::create(&cfg).unwrap()))
            .unwrap();
        table
            .register_channel(101, Arc::new(DataChannel::create(&cfg).unwrap()))
            .unwrap();
        table.update(1, 100, sub(20, 500));
        table.update(1, 101, sub(60, 500));

        let mut targets = table.fanout_targets(1);
        targets.sort_by_key(|t| t.client_id);
        assert_eq!(targets.len(), 2);
        assert_eq!(targets[0].every_nth, 1); // runs at the aggregate rate
        assert_eq!(targets[1].every_nth, 3); // every third sample
    }

    #[test]
    fn test_proximity_far_reset() {
        let mut table = SubscriptionTable::new(16);
        let near = SensorSample::with_floats(8, 42, &[0.0]);
        table.store_sample(&near);

        table.reset_stored_to_far(8);
        let stored = table.stored_sample(8).unwrap();
        assert_eq!(stored.float(0), Some(PROXIMITY_FAR));
        // unrelated sensors untouched
        table.reset_stored_to_far(1);
        assert!(table.stored_sample(1).is_none());
    }
}

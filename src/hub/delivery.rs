//! Sample delivery loop
//!
//! One background thread drains backend-pushed samples and fans each one
//! out to every subscribed client's channel. Running the fanout on a single
//! thread keeps per-sensor emission order intact for every client; across
//! clients no ordering is guaranteed.

use crate::core::types::{ClientId, SensorId, SensorSample};
use crate::hub::subscriptions::SubscriptionTable;
use crossbeam_channel::{Receiver, RecvTimeoutError};
use log::{debug, info};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::io;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

/// Delivered/dropped counters, shared with the statistics logger
#[derive(Default)]
pub struct DeliveryStats {
    pub delivered: AtomicU64,
    pub dropped: AtomicU64,
}

impl DeliveryStats {
    pub fn snapshot(&self) -> (u64, u64) {
        (
            self.delivered.load(Ordering::Relaxed),
            self.dropped.load(Ordering::Relaxed),
        )
    }
}

/// Spawn the delivery thread. Exits when `shutdown` is set or the sample
/// channel disconnects (backend torn down for good).
pub fn spawn_delivery_loop(
    samples: Receiver<SensorSample>,
    table: Arc<Mutex<SubscriptionTable>>,
    shutdown: Arc<AtomicBool>,
    stats: Arc<DeliveryStats>,
) -> io::Result<JoinHandle<()>> {
    thread::Builder::new()
        .name("sample-delivery".to_string())
        .spawn(move || {
            delivery_loop(samples, table, shutdown, stats);
        })
}

fn delivery_loop(
    samples: Receiver<SensorSample>,
    table: Arc<Mutex<SubscriptionTable>>,
    shutdown: Arc<AtomicBool>,
    stats: Arc<DeliveryStats>,
) {
    debug!("Delivery thread started");
    // Per-(sensor, client) tick counters for down-sampling
    let mut counters: HashMap<(SensorId, ClientId), u64> = HashMap::new();

    while !shutdown.load(Ordering::Relaxed) {
        let sample = match samples.recv_timeout(Duration::from_millis(100)) {
            Ok(sample) => sample,
            Err(RecvTimeoutError::Timeout) => continue,
            Err(RecvTimeoutError::Disconnected) => {
                info!("Sample source disconnected, delivery thread exiting");
                break;
            }
        };

        // Collect targets under the manager lock, send after releasing it;
        // sends are non-blocking either way.
        let targets = {
            let mut table = table.lock();
            table.store_sample(&sample);
            table.fanout_targets(sample.sensor_id)
        };

        for target in targets {
            let counter = counters
                .entry((sample.sensor_id, target.client_id))
                .or_insert(0);
            *counter += 1;
            if target.every_nth > 1 && *counter % target.every_nth != 0 {
                continue;
            }
            // Keep last-known state on the channel even when the send is
            // dropped, so a reader can always be given the latest value.
            target.channel.cache_sample(&sample);
            match target.channel.send(&sample) {
                Ok(()) => {
                    stats.delivered.fetch_add(1, Ordering::Relaxed);
                }
                Err(e) => {
                    // Contained to this client; other channels still get
                    // their copy. A stale sample is worse than a missing
                    // one, so nothing is queued for retry.
                    debug!(
                        "Dropping sample of sensor {} for client {}: {}",
                        sample.sensor_id, target.client_id, e
                    );
                    stats.dropped.fetch_add(1, Ordering::Relaxed);
                }
            }
        }
    }
    debug!("Delivery thread exiting");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::DataChannel;
    use crate::config::Config;
    use crate::core::types::{create_sample_channel, RateConfig, Subscription};
    use std::sync::Arc;

    fn enabled(period_ns: i64) -> Subscription {
        Subscription {
            rate: RateConfig::new(period_ns, period_ns * 10),
            enabled: true,
        }
    }

    fn wait_processed(stats: &DeliveryStats, at_least: u64) {
        for _ in 0..100 {
            let (delivered, dropped) = stats.snapshot();
            if delivered + dropped >= at_least {
                return;
            }
            thread::sleep(Duration::from_millis(10));
        }
        panic!("delivery loop did not catch up");
    }

    #[test]
    fn test_fanout_reaches_all_clients_and_isolates_failures() {
        let cfg = Config::defaults();
        let mut table = SubscriptionTable::new(16);
        let healthy = Arc::new(DataChannel::create(&cfg.channel).unwrap());
        let broken = Arc::new(DataChannel::create(&cfg.channel).unwrap());
        broken.close_receive(); // peer went away

        table.register_channel(1, Arc::clone(&healthy)).unwrap();
        table.register_channel(2, Arc::clone(&broken)).unwrap();
        table.update(5, 1, enabled(1_000_000));
        table.update(5, 2, enabled(1_000_000));

        let table = Arc::new(Mutex::new(table));
        let shutdown = Arc::new(AtomicBool::new(false));
        let stats = Arc::new(DeliveryStats::default());
        let (tx, rx) = create_sample_channel();
        let handle =
            spawn_delivery_loop(rx, Arc::clone(&table), Arc::clone(&shutdown), Arc::clone(&stats))
                .unwrap();

        let first = SensorSample::with_floats(5, 1, &[100.0]);
        let second = SensorSample::with_floats(5, 2, &[200.0]);
        tx.send(first).unwrap();
        tx.send(second).unwrap();
        wait_processed(&stats, 4); // 2 delivered + 2 dropped

        // healthy client got both records in emission order
        assert_eq!(healthy.receive_sample().unwrap().unwrap(), first);
        assert_eq!(healthy.receive_sample().unwrap().unwrap(), second);
        // failed sends were counted, not retried, and did not stall anything
        assert_eq!(stats.dropped.load(Ordering::Relaxed), 2);
        // the stored sample tracks the latest record
        assert_eq!(table.lock().stored_sample(5).unwrap(), second);

        shutdown.store(true, Ordering::Relaxed);
        handle.join().unwrap();
    }

    #[test]
    fn test_downsampled_client_sees_every_nth_sample() {
        let cfg = Config::defaults();
        let mut table = SubscriptionTable::new(16);
        let fast = Arc::new(DataChannel::create(&cfg.channel).unwrap());
        let slow = Arc::new(DataChannel::create(&cfg.channel).unwrap());
        table.register_channel(1, Arc::clone(&fast)).unwrap();
        table.register_channel(2, Arc::clone(&slow)).unwrap();
        table.update(7, 1, enabled(10_000_000));
        table.update(7, 2, enabled(30_000_000)); // every 3rd sample

        let table = Arc::new(Mutex::new(table));
        let shutdown = Arc::new(AtomicBool::new(false));
        let stats = Arc::new(DeliveryStats::default());
        let (tx, rx) = create_sample_channel();
        let handle =
            spawn_delivery_loop(rx, Arc::clone(&table), Arc::clone(&shutdown), Arc::clone(&stats))
                .unwrap();

        for i in 0..6 {
            tx.send(SensorSample::with_floats(7, i, &[i as f32])).unwrap();
        }
        wait_processed(&stats, 8); // 6 fast + 2 slow

        let mut fast_count = 0;
        while fast.receive_sample().unwrap().is_some() {
            fast_count += 1;
        }
        assert_eq!(fast_count, 6);

        let timestamps: Vec<i64> = std::iter::from_fn(|| {
            slow.receive_sample().unwrap().map(|sample| sample.timestamp_ns)
        })
        .collect();
        assert_eq!(timestamps, vec![2, 5]);

        shutdown.store(true, Ordering::Relaxed);
        handle.join().unwrap();
    }
}

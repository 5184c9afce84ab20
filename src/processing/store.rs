//! Keyed observation histories with age and count eviction
//!
//! Two windows share this store:
//! - the node-side smoothing window, keyed by device and node, that keeps the
//!   most recent readings for averaging;
//! - the server-side fusion window, keyed by device, that keeps the freshest
//!   reading from each node for a solve.

use crate::core::{NodeId, Observation, Timestamp, AVG_NUM, AVG_TIMEOUT_SECS, FUSION_STALENESS_SECS};
use crate::processing::queue::{BoundedQueue, QueueGuard};
use std::collections::HashMap;
use std::fmt::Debug;
use std::hash::Hash;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};
use tracing::{debug, warn};

/// Eviction policy applied to every history in a store
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WindowPolicy {
    /// Keep at most `capacity` readings, none older than `max_age_secs`
    Smoothing { capacity: usize, max_age_secs: u64 },
    /// Keep one reading per node, none older than `staleness_secs` at read time
    Fusion { staleness_secs: u64 },
}

impl WindowPolicy {
    pub fn smoothing() -> Self {
        WindowPolicy::Smoothing {
            capacity: AVG_NUM,
            max_age_secs: AVG_TIMEOUT_SECS,
        }
    }

    pub fn fusion() -> Self {
        WindowPolicy::Fusion {
            staleness_secs: FUSION_STALENESS_SECS,
        }
    }
}

/// What an insert did to the target history
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct InsertReport {
    /// Readings dropped by age, count or node replacement
    pub evicted: usize,
    /// History length after the insert
    pub len: usize,
    /// Arithmetic mean RSSI over the surviving window
    pub mean_rssi: f64,
}

/// Shared handle to one key's history
pub type History = Arc<BoundedQueue<Observation>>;

/// Map from key to history. Each history carries its own lock; the map lock is
/// only held long enough to find or create an entry.
#[derive(Debug)]
pub struct ObservationStore<K> {
    policy: WindowPolicy,
    histories: RwLock<HashMap<K, History>>,
}

impl<K> ObservationStore<K>
where
    K: Eq + Hash + Clone + Debug,
{
    pub fn new(policy: WindowPolicy) -> Self {
        Self {
            policy,
            histories: RwLock::new(HashMap::new()),
        }
    }

    pub fn smoothing(capacity: usize, max_age_secs: u64) -> Self {
        Self::new(WindowPolicy::Smoothing { capacity, max_age_secs })
    }

    pub fn fusion(staleness_secs: u64) -> Self {
        Self::new(WindowPolicy::Fusion { staleness_secs })
    }

    pub fn policy(&self) -> WindowPolicy {
        self.policy
    }

    pub fn get(&self, key: &K) -> Option<History> {
        self.read_map().get(key).cloned()
    }

    pub fn get_or_create(&self, key: &K) -> History {
        if let Some(history) = self.read_map().get(key) {
            return Arc::clone(history);
        }
        let mut map = self.write_map();
        Arc::clone(map.entry(key.clone()).or_default())
    }

    /// Adds `record` under `key`, evicting before and after the append
    pub fn insert(&self, key: K, record: Observation, now: Timestamp) -> InsertReport {
        let history = self.get_or_create(&key);
        let mut window = history.lock();

        let evicted = match self.policy {
            WindowPolicy::Smoothing { capacity, max_age_secs } => {
                let mut evicted = evict_aged_from_head(&mut window, now, max_age_secs);
                window.push_tail(record);
                evicted += evict_aged_from_head(&mut window, now, max_age_secs);
                while window.len() > capacity {
                    window.pop_head();
                    evicted += 1;
                }
                evicted
            }
            WindowPolicy::Fusion { staleness_secs } => {
                let node = record.node();
                let mut evicted = window.remove_where(|o| o.node() == node);
                window.push_tail(record);
                evicted += evict_stale(&mut window, now, staleness_secs);
                evicted
            }
        };

        let report = InsertReport {
            evicted,
            len: window.len(),
            mean_rssi: mean_rssi(&window),
        };
        if evicted > 0 {
            debug!(?key, evicted, len = report.len, "evicted observations");
        }
        report
    }

    /// Freshest reading per node, oldest first, after dropping stale ones.
    ///
    /// Taken under the history lock so a concurrent insert lands either wholly
    /// before or wholly after the snapshot.
    pub fn snapshot_for_solve(&self, key: &K, now: Timestamp) -> Vec<(NodeId, Observation)> {
        let Some(history) = self.get(key) else {
            return Vec::new();
        };
        let mut window = history.lock();
        match self.policy {
            WindowPolicy::Fusion { staleness_secs } => {
                let dropped = evict_stale(&mut window, now, staleness_secs);
                if dropped > 0 {
                    debug!(?key, dropped, "dropped stale observations before solve");
                }
            }
            WindowPolicy::Smoothing { max_age_secs, .. } => {
                evict_aged_from_head(&mut window, now, max_age_secs);
            }
        }

        let mut latest: Vec<(NodeId, Observation)> = Vec::with_capacity(window.len());
        for (_, obs) in window.iter() {
            match latest.iter_mut().find(|(node, _)| *node == obs.node()) {
                Some(slot) => slot.1 = obs.clone(),
                None => latest.push((obs.node(), obs.clone())),
            }
        }
        latest
    }

    /// Mean RSSI over the current window, `None` if empty or unknown
    pub fn mean_rssi(&self, key: &K) -> Option<f64> {
        let history = self.get(key)?;
        let window = history.lock();
        if window.is_empty() {
            None
        } else {
            Some(mean_rssi(&window))
        }
    }

    pub fn keys(&self) -> Vec<K> {
        self.read_map().keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.read_map().len()
    }

    pub fn is_empty(&self) -> bool {
        self.read_map().is_empty()
    }

    pub fn remove(&self, key: &K) -> Option<History> {
        self.write_map().remove(key)
    }

    /// Applies the policy's age bound to every history, not just the ones
    /// being written to. Returns how many readings went.
    pub fn evict_expired(&self, now: Timestamp) -> usize {
        let histories: Vec<History> = self.read_map().values().cloned().collect();
        let evicted: usize = histories
            .iter()
            .map(|history| {
                let mut window = history.lock();
                match self.policy {
                    WindowPolicy::Smoothing { max_age_secs, .. } => {
                        evict_aged_from_head(&mut window, now, max_age_secs)
                    }
                    WindowPolicy::Fusion { staleness_secs } => evict_stale(&mut window, now, staleness_secs),
                }
            })
            .sum();
        if evicted > 0 {
            debug!(evicted, "expired observations swept");
        }
        evicted
    }

    /// Drops keys whose history has emptied out. Returns how many went.
    ///
    /// A history some caller still holds (an insert between finding its entry
    /// and appending) is kept, so the append cannot land in a detached queue.
    pub fn prune_empty(&self) -> usize {
        let mut map = self.write_map();
        let before = map.len();
        map.retain(|_, history| Arc::strong_count(history) > 1 || !history.is_empty());
        before - map.len()
    }

    fn read_map(&self) -> RwLockReadGuard<'_, HashMap<K, History>> {
        self.histories.read().unwrap_or_else(|poisoned| {
            warn!("observation store lock poisoned; recovering");
            poisoned.into_inner()
        })
    }

    fn write_map(&self) -> RwLockWriteGuard<'_, HashMap<K, History>> {
        self.histories.write().unwrap_or_else(|poisoned| {
            warn!("observation store lock poisoned; recovering");
            poisoned.into_inner()
        })
    }
}

/// Head-first age eviction; stops at the first reading still in bounds
fn evict_aged_from_head(window: &mut QueueGuard<'_, Observation>, now: Timestamp, max_age_secs: u64) -> usize {
    let mut evicted = 0;
    while window.front().is_some_and(|o| o.age(now) > max_age_secs) {
        window.pop_head();
        evicted += 1;
    }
    evicted
}

/// Full-window staleness sweep; readings from different nodes can arrive out of order
fn evict_stale(window: &mut QueueGuard<'_, Observation>, now: Timestamp, staleness_secs: u64) -> usize {
    window.remove_where(|o| o.age(now) > staleness_secs)
}

fn mean_rssi(window: &QueueGuard<'_, Observation>) -> f64 {
    if window.is_empty() {
        return 0.0;
    }
    let sum: f64 = window.iter().map(|(_, o)| o.rssi()).sum();
    sum / window.len() as f64
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::MacAddress;
    use proptest::prelude::*;

    const DEVICE: MacAddress = MacAddress::new([0xAA, 0xBB, 0xCC, 0xDD, 0xEE, 0x01]);

    fn obs(node: NodeId, rssi: f64, timestamp: Timestamp) -> Observation {
        Observation::new(DEVICE, node, rssi, timestamp)
    }

    #[test]
    fn test_fusion_staleness_is_evaluated_at_read_time() {
        let store = ObservationStore::fusion(300);
        store.insert(DEVICE, obs(1, 50.0, 0), 0);
        store.insert(DEVICE, obs(2, 55.0, 100), 100);
        store.insert(DEVICE, obs(3, 60.0, 400), 100);

        let snapshot = store.snapshot_for_solve(&DEVICE, 400);
        let stamps: Vec<Timestamp> = snapshot.iter().map(|(_, o)| o.timestamp()).collect();
        assert_eq!(stamps, vec![100, 400]);
        assert_eq!(store.get(&DEVICE).unwrap().len(), 2);
    }

    #[test]
    fn test_fusion_keeps_one_record_per_node() {
        let store = ObservationStore::fusion(300);
        store.insert(DEVICE, obs(1, 50.0, 10), 10);
        store.insert(DEVICE, obs(2, 70.0, 11), 11);
        let report = store.insert(DEVICE, obs(1, 40.0, 12), 12);

        assert_eq!(report.evicted, 1);
        assert_eq!(report.len, 2);
        let snapshot = store.snapshot_for_solve(&DEVICE, 12);
        assert_eq!(snapshot.len(), 2);
        assert_eq!(snapshot[0].0, 2);
        assert_eq!(snapshot[1].0, 1);
        assert_eq!(snapshot[1].1.rssi(), 40.0);
    }

    #[test]
    fn test_smoothing_keeps_most_recent_by_count() {
        let store = ObservationStore::smoothing(32, 300);
        let key = (DEVICE, 7);
        for t in 0..40u64 {
            store.insert(key, obs(7, t as f64, 1000 + t), 1000 + t);
        }
        let history = store.get(&key).unwrap();
        let kept: Vec<Timestamp> = history.to_vec().iter().map(|o| o.timestamp()).collect();
        assert_eq!(kept.len(), 32);
        assert_eq!(kept.first(), Some(&1008));
        assert_eq!(kept.last(), Some(&1039));
    }

    #[test]
    fn test_smoothing_evicts_by_age_and_recomputes_mean() {
        let store = ObservationStore::smoothing(32, 300);
        let key = (DEVICE, 1);
        store.insert(key, obs(1, 10.0, 0), 0);
        store.insert(key, obs(1, 20.0, 100), 100);
        let report = store.insert(key, obs(1, 30.0, 400), 400);

        assert_eq!(report.evicted, 1);
        assert_eq!(report.len, 2);
        assert!((report.mean_rssi - 25.0).abs() < 1e-12);
        assert_eq!(store.mean_rssi(&key), Some(25.0));
    }

    #[test]
    fn test_snapshot_of_unknown_key_is_empty() {
        let store: ObservationStore<MacAddress> = ObservationStore::fusion(60);
        assert!(store.snapshot_for_solve(&DEVICE, 0).is_empty());
        assert_eq!(store.mean_rssi(&DEVICE), None);
    }

    #[test]
    fn test_prune_empty_drops_drained_histories() {
        let store = ObservationStore::fusion(60);
        store.insert(DEVICE, obs(1, 50.0, 0), 0);
        assert!(store.snapshot_for_solve(&DEVICE, 1000).is_empty());
        assert_eq!(store.prune_empty(), 1);
        assert!(store.is_empty());
    }

    #[test]
    fn test_prune_keeps_history_held_by_an_insert() {
        let store = ObservationStore::fusion(60);
        store.insert(DEVICE, obs(1, 50.0, 0), 0);
        assert!(store.snapshot_for_solve(&DEVICE, 1000).is_empty());

        let in_flight = store.get_or_create(&DEVICE);
        assert_eq!(store.prune_empty(), 0);
        in_flight.push_tail(obs(2, 60.0, 1000));
        drop(in_flight);

        assert_eq!(store.prune_empty(), 0);
        let snapshot = store.snapshot_for_solve(&DEVICE, 1000);
        assert_eq!(snapshot.len(), 1);
        assert_eq!(snapshot[0].0, 2);
    }

    #[test]
    fn test_evict_expired_sweeps_idle_keys() {
        let store = ObservationStore::smoothing(32, 300);
        let gone = (DEVICE, 1);
        let other = MacAddress::new([0xAA, 0xBB, 0xCC, 0xDD, 0xEE, 0x02]);
        let active = (other, 1);
        store.insert(gone, obs(1, 50.0, 0), 0);
        store.insert(gone, obs(1, 52.0, 10), 10);
        store.insert(active, Observation::new(other, 1, 40.0, 400), 400);

        assert_eq!(store.evict_expired(400), 2);
        assert_eq!(store.prune_empty(), 1);
        assert_eq!(store.keys(), vec![active]);
    }

    proptest! {
        #[test]
        fn prop_smoothing_window_is_bounded(
            capacity in 1usize..40,
            steps in proptest::collection::vec(0u64..50, 1..120),
        ) {
            let store = ObservationStore::smoothing(capacity, 300);
            let key = (DEVICE, 1);
            let mut now = 0u64;
            for step in steps {
                now += step;
                let report = store.insert(key, obs(1, 50.0, now), now);
                prop_assert!(report.len <= capacity);
                prop_assert!(report.len >= 1);
                let window = store.get(&key).unwrap().to_vec();
                prop_assert!(window.iter().all(|o| now - o.timestamp() <= 300));
                prop_assert!(window.windows(2).all(|w| w[0].timestamp() <= w[1].timestamp()));
            }
        }
    }
}

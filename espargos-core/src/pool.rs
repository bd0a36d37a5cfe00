//! Fuses per-antenna CSI fragments from every board in a pool into
//! complete [`Cluster`]s and dispatches them to registered callbacks
//! (§4.4).

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, RwLock};
use std::thread::JoinHandle;
use std::time::Duration;

use espargos_wire::SerializedCsi;
use tracing::{debug, warn};

use crate::board::{Board, ConsumerQueue};
use crate::calibration::{Calibration, ReferenceSample};
use crate::cluster::{cluster_key, Cluster};
use crate::error::Result;

/// Default age after which a cluster without completing is dropped (§4.4,
/// stale eviction), matching the original driver's `ota_cache_timeout=5`.
/// Configurable per pool via [`Pool::set_ota_cache_timeout`].
const DEFAULT_OTA_CACHE_TIMEOUT: Duration = Duration::from_secs(5);
/// How long the drain loop blocks for new queue entries before re-checking
/// `running` and sweeping for stale clusters.
const DRAIN_TIMEOUT: Duration = Duration::from_millis(500);

type Callback = Box<dyn Fn(&Cluster) + Send + Sync>;
type Predicate = Box<dyn Fn(&Cluster) -> bool + Send + Sync>;

struct CallbackEntry {
    predicate: Option<Predicate>,
    callback: Callback,
}

/// A FIFO-ordered cache of in-progress clusters, keyed the way the stream
/// itself is keyed (`source-dest-seg-frag`). Oldest entries are evicted
/// first, matching the insertion-ordered eviction of the source this is
/// ported from.
#[derive(Default)]
struct ClusterCache {
    order: VecDeque<String>,
    clusters: HashMap<String, Cluster>,
}

impl ClusterCache {
    fn get_or_insert_with(&mut self, key: &str, make: impl FnOnce() -> Cluster) -> &mut Cluster {
        if !self.clusters.contains_key(key) {
            self.order.push_back(key.to_string());
            self.clusters.insert(key.to_string(), make());
        }
        self.clusters.get_mut(key).unwrap()
    }

    fn remove(&mut self, key: &str) -> Option<Cluster> {
        self.order.retain(|k| k != key);
        self.clusters.remove(key)
    }

    fn evict_stale(&mut self, max_age: Duration) -> Vec<String> {
        let mut evicted = Vec::new();
        while let Some(front) = self.order.front() {
            let Some(cluster) = self.clusters.get(front) else {
                self.order.pop_front();
                continue;
            };
            if cluster.age() <= max_age {
                break;
            }
            let key = self.order.pop_front().unwrap();
            self.clusters.remove(&key);
            evicted.push(key);
        }
        evicted
    }
}

/// A running set of boards fused into one CSI cluster stream.
///
/// Packets land on a single shared queue (one consumer registration per
/// board); [`Pool::run`] drains that queue on a dedicated thread and feeds
/// [`Cluster`]s to registered callbacks as they complete. A second,
/// separate cluster cache is used for calibration traffic so ordinary
/// consumption and `calibrate()` never interfere with each other.
pub struct Pool {
    boards: Vec<Arc<Board>>,
    queue: ConsumerQueue,
    cache_ota: Mutex<ClusterCache>,
    cache_calib: Mutex<ClusterCache>,
    callbacks: Mutex<Vec<CallbackEntry>>,
    fired: Mutex<HashSet<(String, usize)>>,
    running: Arc<AtomicBool>,
    calibration: RwLock<Option<Calibration>>,
    drain_thread: Mutex<Option<JoinHandle<()>>>,
    ota_cache_timeout: RwLock<Duration>,
}

impl Pool {
    pub fn new(boards: Vec<Arc<Board>>) -> Arc<Self> {
        let queue: ConsumerQueue = Arc::new((Mutex::new(VecDeque::new()), Condvar::new()));
        for (index, board) in boards.iter().enumerate() {
            board.add_consumer(index, Arc::clone(&queue));
        }

        Arc::new(Self {
            boards,
            queue,
            cache_ota: Mutex::new(ClusterCache::default()),
            cache_calib: Mutex::new(ClusterCache::default()),
            callbacks: Mutex::new(Vec::new()),
            fired: Mutex::new(HashSet::new()),
            running: Arc::new(AtomicBool::new(false)),
            calibration: RwLock::new(None),
            drain_thread: Mutex::new(None),
            ota_cache_timeout: RwLock::new(DEFAULT_OTA_CACHE_TIMEOUT),
        })
    }

    pub fn board_count(&self) -> usize {
        self.boards.len()
    }

    pub fn boards(&self) -> &[Arc<Board>] {
        &self.boards
    }

    /// Override how long an incomplete cluster is kept before being dropped
    /// as stale (default 5s, §4.4 step 4).
    pub fn set_ota_cache_timeout(&self, timeout: Duration) {
        *self.ota_cache_timeout.write().unwrap() = timeout;
    }

    pub fn set_calib(&self, calibration: Calibration) {
        *self.calibration.write().unwrap() = Some(calibration);
    }

    pub fn get_calibration(&self) -> Option<Calibration> {
        self.calibration.read().unwrap().clone()
    }

    /// Register a callback fired (at most once per cluster) when
    /// `predicate` returns true, or when every antenna has reported in if
    /// no predicate is given.
    pub fn add_csi_callback(
        self: &Arc<Self>,
        predicate: Option<Box<dyn Fn(&Cluster) -> bool + Send + Sync>>,
        callback: Box<dyn Fn(&Cluster) + Send + Sync>,
    ) {
        self.callbacks.lock().unwrap().push(CallbackEntry { predicate, callback });
    }

    /// Start every board's CSI stream and the drain loop.
    pub fn start(self: &Arc<Self>) {
        for board in &self.boards {
            board.start();
        }

        self.running.store(true, Ordering::SeqCst);
        let pool = Arc::clone(self);
        let handle = std::thread::spawn(move || pool.run());
        *self.drain_thread.lock().unwrap() = Some(handle);
    }

    pub fn stop(&self) {
        for board in &self.boards {
            board.stop();
        }
        self.running.store(false, Ordering::SeqCst);
        self.queue.1.notify_all();
        if let Some(handle) = self.drain_thread.lock().unwrap().take() {
            let _ = handle.join();
        }
    }

    /// Drain loop: blocks on the shared queue with a timeout, processes
    /// whatever arrived, then sweeps stale clusters. Runs on its own
    /// thread for the lifetime of the pool.
    fn run(&self) {
        let (lock, cv) = &*self.queue;
        while self.running.load(Ordering::SeqCst) {
            let mut queue = lock.lock().unwrap();
            if queue.is_empty() {
                let (guard, timeout) = cv.wait_timeout(queue, DRAIN_TIMEOUT).unwrap();
                queue = guard;
                if timeout.timed_out() && queue.is_empty() {
                    drop(queue);
                    self.sweep_stale();
                    continue;
                }
            }
            let batch: Vec<_> = queue.drain(..).collect();
            drop(queue);

            self.process_batch(batch);
            self.sweep_stale();
        }
    }

    /// Pop and process whatever is currently queued, without blocking. Used
    /// by [`Self::run`]'s batches and, separately, by `calibrate()`, which
    /// drains the same queue on the calling thread rather than relying on
    /// `run()`'s own thread to have been started (§5).
    fn drain_available(&self) {
        let batch: Vec<_> = {
            let (lock, _cv) = &*self.queue;
            let mut queue = lock.lock().unwrap();
            queue.drain(..).collect()
        };
        self.process_batch(batch);
    }

    fn process_batch(&self, batch: Vec<(usize, u32, SerializedCsi)>) {
        for (board_idx, esp_num, record) in batch {
            self.handle_packet(board_idx, esp_num, &record);
        }
    }

    fn sweep_stale(&self) {
        let max_age = *self.ota_cache_timeout.read().unwrap();
        for key in self.cache_ota.lock().unwrap().evict_stale(max_age) {
            debug!(cluster = %key, "evicted stale cluster");
        }
        for key in self.cache_calib.lock().unwrap().evict_stale(max_age) {
            debug!(cluster = %key, "evicted stale calibration cluster");
        }
    }

    fn handle_packet(&self, board_idx: usize, esp_num: u32, record: &SerializedCsi) {
        let key = cluster_key(&record.source_mac, &record.dest_mac, &record.seq_ctrl);
        let complex_samples = record.buf.all_samples();
        let board_count = self.boards.len();

        let cache = if record.is_calib { &self.cache_calib } else { &self.cache_ota };
        let mut cache = cache.lock().unwrap();
        let cluster = cache.get_or_insert_with(&key, || {
            Cluster::new(record.source_mac, record.dest_mac, record.seq_ctrl, board_count)
        });
        cluster.add(board_idx, esp_num, record, &complex_samples);
        let completion_all = cluster.completion_all();

        // Calibration packets are never fired to user callbacks (§4.4):
        // `collect_calib_samples` drains `cache_calib` directly instead.
        if record.is_calib {
            if completion_all {
                cache.remove(&key);
            }
            return;
        }

        self.dispatch(&key, cluster);
        if completion_all {
            cache.remove(&key);
            self.fired.lock().unwrap().retain(|(fired_key, _)| fired_key != &key);
        }
    }

    fn dispatch(&self, key: &str, cluster: &Cluster) {
        let callbacks = self.callbacks.lock().unwrap();
        let mut fired = self.fired.lock().unwrap();
        for (idx, entry) in callbacks.iter().enumerate() {
            let matches = match &entry.predicate {
                Some(p) => p(cluster),
                None => cluster.completion_all(),
            };
            if !matches {
                continue;
            }
            let fire_key = (key.to_string(), idx);
            if fired.contains(&fire_key) {
                continue;
            }
            (entry.callback)(cluster);
            fired.insert(fire_key);
        }
    }

    /// Run a calibration pass: enable calibration-signal injection on every
    /// board (or one board at a time if `per_board`), collect complete
    /// calibration clusters for `duration`, then derive and store a
    /// [`Calibration`]. The calling task is the pool's drain loop for the
    /// duration of this call (§5) — it does not require [`Self::start`] to
    /// have been called, and works correctly alongside it if it has.
    pub async fn calibrate(
        self: &Arc<Self>,
        duration: Duration,
        per_board: bool,
        cable_lengths_m: Option<&[f64]>,
        cable_velocity_factors: Option<&[f64]>,
    ) -> Result<()> {
        let (channel_primary, channel_secondary) = (self.boards[0].channel_primary(), self.boards[0].channel_secondary());

        let mut samples_per_board: Vec<Vec<ReferenceSample>> = Vec::new();

        if per_board {
            for board in &self.boards {
                board.set_calib(true).await?;
                let samples = self.collect_calib_samples(duration).await;
                board.set_calib(false).await?;
                samples_per_board.push(samples);
            }
        } else {
            for board in &self.boards {
                board.set_calib(true).await?;
            }
            let samples = self.collect_calib_samples(duration).await;
            for board in &self.boards {
                board.set_calib(false).await?;
            }
            samples_per_board.push(samples);
        }

        let calibration = Calibration::derive(
            &samples_per_board,
            channel_primary,
            channel_secondary,
            per_board,
            cable_lengths_m,
            cable_velocity_factors,
        )?;
        self.set_calib(calibration);
        Ok(())
    }

    /// Drains the pool's own queue on the calling thread for `duration`,
    /// collecting every complete HT40 calibration cluster that appears.
    /// This *is* the pool's drain loop for the duration of a `calibrate()`
    /// call (§5): it does not assume `run()`'s dedicated thread is feeding
    /// `cache_calib` from somewhere else.
    async fn collect_calib_samples(&self, duration: Duration) -> Vec<ReferenceSample> {
        let deadline = tokio::time::Instant::now() + duration;
        let mut samples = Vec::new();
        while tokio::time::Instant::now() < deadline {
            self.drain_available();

            let mut cache = self.cache_calib.lock().unwrap();
            let complete: Vec<String> = cache
                .clusters
                .iter()
                .filter(|(_, c)| c.completion_all() && c.is_ht40())
                .map(|(k, _)| k.clone())
                .collect();
            for key in complete {
                if let Some(cluster) = cache.remove(&key) {
                    let host_ts = cluster.host_timestamp_seconds();
                    samples.push(ReferenceSample {
                        ht40: cluster.deserialize_ht40().into_dyn(),
                        lltf: cluster.deserialize_lltf().into_dyn(),
                        timestamp_offset: cluster.sensor_timestamps().mapv(|v| v - host_ts).into_dyn(),
                    });
                }
            }
            drop(cache);

            tokio::time::sleep(Duration::from_millis(100)).await;
        }
        if samples.is_empty() {
            warn!("calibration pass collected no complete HT40 clusters");
        }
        samples
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use espargos_wire::{CsiBuf, RxCtrl, SeqCtrl, CSI_BUF_BYTES, CSI_BUF_SAMPLES};
    use num_complex::Complex32;
    use std::sync::atomic::AtomicUsize;

    fn fake_record() -> SerializedCsi {
        SerializedCsi {
            rx_ctrl: RxCtrl {
                rssi: -40,
                channel: 6,
                secondary_channel: 0,
                cwb: false,
                rxstart_time_cyc: 0,
                rxstart_time_cyc_dec: 0,
                noise_floor: -92,
                timestamp: 1,
                global_timestamp_us: 0,
            },
            source_mac: [1; 6],
            dest_mac: [2; 6],
            seq_ctrl: SeqCtrl { frag: 0, seg: 1 },
            timestamp: 1,
            is_calib: false,
            first_word_invalid: false,
            buf: CsiBuf([0u8; CSI_BUF_BYTES]),
        }
    }

    fn samples() -> Vec<Complex32> {
        vec![Complex32::new(0.0, 0.0); CSI_BUF_SAMPLES]
    }

    fn full_cluster() -> Cluster {
        let record = fake_record();
        let mut cluster = Cluster::new(record.source_mac, record.dest_mac, record.seq_ctrl, 1);
        for esp_num in 0..8u32 {
            cluster.add(0, esp_num, &record, &samples());
        }
        cluster
    }

    #[test]
    fn cluster_cache_inserts_once_and_tracks_insertion_order() {
        let mut cache = ClusterCache::default();
        let mut created = 0;
        cache.get_or_insert_with("a", || {
            created += 1;
            full_cluster()
        });
        cache.get_or_insert_with("a", || {
            created += 1;
            full_cluster()
        });
        assert_eq!(created, 1);
        assert_eq!(Vec::from(cache.order.clone()), vec!["a".to_string()]);
    }

    #[test]
    fn cluster_cache_evicts_only_what_is_older_than_max_age() {
        let mut cache = ClusterCache::default();
        cache.get_or_insert_with("old", full_cluster);
        std::thread::sleep(Duration::from_millis(5));
        let evicted = cache.evict_stale(Duration::from_millis(1));
        assert_eq!(evicted, vec!["old".to_string()]);
        assert!(cache.clusters.is_empty());
    }

    #[test]
    fn dispatch_fires_each_callback_at_most_once_per_cluster() {
        let pool = Pool::new(vec![]);
        let fire_count = Arc::new(AtomicUsize::new(0));
        let counted = Arc::clone(&fire_count);
        pool.add_csi_callback(None, Box::new(move |_c| { counted.fetch_add(1, Ordering::SeqCst); }));

        let cluster = full_cluster();
        pool.dispatch("key-a", &cluster);
        pool.dispatch("key-a", &cluster);
        pool.dispatch("key-b", &cluster);

        assert_eq!(fire_count.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn dispatch_respects_custom_predicate() {
        let pool = Pool::new(vec![]);
        let fired = Arc::new(AtomicUsize::new(0));
        let counted = Arc::clone(&fired);
        pool.add_csi_callback(Some(Box::new(|_c: &Cluster| false)), Box::new(move |_c| { counted.fetch_add(1, Ordering::SeqCst); }));

        pool.dispatch("key-a", &full_cluster());
        assert_eq!(fired.load(Ordering::SeqCst), 0);
    }

    /// S2: an age-gated predicate on a still-incomplete cluster fires once
    /// the cluster is old enough, and a subsequent stale sweep evicts it.
    #[test]
    fn age_gated_predicate_fires_once_then_cluster_is_evicted() {
        let pool = Pool::new(vec![]);
        let fired = Arc::new(AtomicUsize::new(0));
        let counted = Arc::clone(&fired);
        pool.add_csi_callback(
            Some(Box::new(|c: &Cluster| c.age() > Duration::from_millis(5))),
            Box::new(move |_c| { counted.fetch_add(1, Ordering::SeqCst); }),
        );

        let mut cache = ClusterCache::default();
        cache.get_or_insert_with("key-a", || {
            let record = fake_record();
            let mut cluster = Cluster::new(record.source_mac, record.dest_mac, record.seq_ctrl, 1);
            cluster.add(0, 0, &record, &samples()); // incomplete: only 1 of 8 antennas
            cluster
        });

        std::thread::sleep(Duration::from_millis(10));
        let cluster = cache.clusters.get("key-a").unwrap();
        assert!(!cluster.completion_all());
        pool.dispatch("key-a", cluster);
        pool.dispatch("key-a", cluster);
        assert_eq!(fired.load(Ordering::SeqCst), 1);

        let evicted = cache.evict_stale(Duration::from_millis(5));
        assert_eq!(evicted, vec!["key-a".to_string()]);
        assert!(cache.clusters.is_empty());
    }

    fn single_board_pool() -> Arc<Pool> {
        Pool::new(vec![Arc::new(Board::test_instance())])
    }

    fn fake_calib_record() -> SerializedCsi {
        SerializedCsi {
            rx_ctrl: RxCtrl {
                rssi: -40,
                channel: 6,
                secondary_channel: 1,
                cwb: true,
                rxstart_time_cyc: 0,
                rxstart_time_cyc_dec: 0,
                noise_floor: -92,
                timestamp: 1,
                global_timestamp_us: 0,
            },
            source_mac: [3; 6],
            dest_mac: [4; 6],
            seq_ctrl: SeqCtrl { frag: 0, seg: 1 },
            timestamp: 1,
            is_calib: true,
            first_word_invalid: false,
            buf: CsiBuf([0u8; CSI_BUF_BYTES]),
        }
    }

    /// Drives `calibrate()`'s own queue-draining path end to end: with no
    /// `Pool::run` thread started, `collect_calib_samples` must still be
    /// able to pop its own fragments off the shared queue and assemble a
    /// complete calibration cluster.
    #[tokio::test]
    async fn collect_calib_samples_drains_its_own_queue() {
        let pool = single_board_pool();
        let record = fake_calib_record();
        {
            let (lock, cv) = &*pool.queue;
            let mut queue = lock.lock().unwrap();
            for esp_num in 0..8u32 {
                queue.push_back((0, esp_num, record.clone()));
            }
            cv.notify_all();
        }

        let samples = pool.collect_calib_samples(Duration::from_millis(150)).await;
        assert_eq!(samples.len(), 1);
        assert!(pool.cache_calib.lock().unwrap().clusters.is_empty());
    }

    /// A calibration packet, even once its cluster completes, must never
    /// reach an ordinary callback — only `collect_calib_samples` consumes
    /// `cache_calib`.
    #[test]
    fn calibration_clusters_are_never_dispatched_to_callbacks() {
        let pool = single_board_pool();
        let fired = Arc::new(AtomicUsize::new(0));
        let counted = Arc::clone(&fired);
        pool.add_csi_callback(None, Box::new(move |_c| { counted.fetch_add(1, Ordering::SeqCst); }));

        let record = fake_calib_record();
        for esp_num in 0..8u32 {
            pool.handle_packet(0, esp_num, &record);
        }

        assert_eq!(fired.load(Ordering::SeqCst), 0);
        assert!(pool.cache_calib.lock().unwrap().clusters.is_empty());
    }

    /// Once a non-calibration cluster dispatches complete, it must be
    /// dropped from `cache_ota` and its `fired` bookkeeping purged, so a
    /// long-running pool doesn't grow either without bound.
    #[test]
    fn ota_cluster_is_removed_from_cache_and_fired_set_after_dispatch() {
        let pool = single_board_pool();
        let fired = Arc::new(AtomicUsize::new(0));
        let counted = Arc::clone(&fired);
        pool.add_csi_callback(None, Box::new(move |_c| { counted.fetch_add(1, Ordering::SeqCst); }));

        let record = fake_record();
        for esp_num in 0..8u32 {
            pool.handle_packet(0, esp_num, &record);
        }

        assert_eq!(fired.load(Ordering::SeqCst), 1);
        assert!(pool.cache_ota.lock().unwrap().clusters.is_empty());
        assert!(pool.fired.lock().unwrap().is_empty());
    }

    /// S2 through the real path: `handle_packet` must let `dispatch` decide
    /// eligibility for every packet, not just complete ones, so a predicate
    /// that accepts incomplete clusters actually gets a chance to fire.
    #[test]
    fn predicate_gated_dispatch_fires_through_handle_packet_on_incomplete_cluster() {
        let pool = single_board_pool();
        let fired = Arc::new(AtomicUsize::new(0));
        let counted = Arc::clone(&fired);
        pool.add_csi_callback(Some(Box::new(|_c: &Cluster| true)), Box::new(move |_c| { counted.fetch_add(1, Ordering::SeqCst); }));

        let record = fake_record();
        pool.handle_packet(0, 0, &record); // only 1 of 8 antennas

        assert_eq!(fired.load(Ordering::SeqCst), 1);
        let key = cluster_key(&record.source_mac, &record.dest_mac, &record.seq_ctrl);
        assert!(!pool.cache_ota.lock().unwrap().clusters.get(&key).unwrap().completion_all());
    }
}

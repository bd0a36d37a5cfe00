//! Ring-buffered recent-history store for HT40/L-LTF CSI, timestamps and
//! RSSI, fed by a [`Pool`] callback (§4.6).

use std::sync::{Arc, Mutex, RwLock};

use espargos_wire::{mac_to_hex, COLS, HT40_SUBCARRIERS, LLTF_SUBCARRIERS, ROWS};
use ndarray::{s, Array5};
use num_complex::Complex32;
use regex::Regex;
use tracing::info;

use crate::cluster::Cluster;
use crate::pool::Pool;

struct Ring {
    size: usize,
    board_count: usize,
    head: usize,
    fill_level: usize,
    latest: Option<usize>,

    ht40: Option<Array5<Complex32>>,
    lltf: Option<Array5<Complex32>>,
    rssi: Array5<f32>,
    timestamps: Array5<f64>,
    source_macs: Vec<[u8; 6]>,
}

impl Ring {
    fn new(size: usize, board_count: usize, enable_ht40: bool, enable_lltf: bool) -> Self {
        let scalar_shape = (size, board_count, ROWS, COLS, 1);
        Self {
            size,
            board_count,
            head: 0,
            fill_level: 0,
            latest: None,
            ht40: enable_ht40.then(|| Array5::from_elem((size, board_count, ROWS, COLS, HT40_SUBCARRIERS), Complex32::new(f32::NAN, f32::NAN))),
            lltf: enable_lltf.then(|| Array5::from_elem((size, board_count, ROWS, COLS, LLTF_SUBCARRIERS), Complex32::new(f32::NAN, f32::NAN))),
            rssi: Array5::from_elem(scalar_shape, f32::NAN),
            timestamps: Array5::from_elem(scalar_shape, f64::NAN),
            source_macs: vec![[0; 6]; size],
        }
    }

    fn advance(&mut self) {
        self.latest = Some(self.head);
        self.head = (self.head + 1) % self.size;
        self.fill_level = (self.fill_level + 1).min(self.size);
    }

    /// Oldest-first view of a ring buffer: rotate the leading axis so slot
    /// `head` becomes index 0, then keep only the last `fill_level` entries.
    fn rolled<D>(array: &Array5<D>, head: usize, fill_level: usize) -> Array5<D>
    where
        D: Clone + num_traits::Zero,
    {
        let size = array.shape()[0];
        let mut rolled = ndarray::Array::zeros(array.raw_dim());
        for i in 0..size {
            let src = (head + i) % size;
            rolled.slice_mut(s![i, .., .., .., ..]).assign(&array.slice(s![src, .., .., .., ..]));
        }
        rolled.slice(s![size - fill_level.., .., .., .., ..]).to_owned()
    }
}

/// Ring-buffered recent history of CSI data fused by a [`Pool`], oldest
/// entries evicted first. Registers its own callback with the pool at
/// construction time, so it starts filling as soon as the pool is started.
pub struct Backlog {
    pool: Arc<Pool>,
    calibrate: bool,
    enable_ht40: bool,
    enable_lltf: bool,
    ring: RwLock<Ring>,
    mac_filter: Mutex<Option<Regex>>,
    update_callbacks: Mutex<Vec<Box<dyn Fn() + Send + Sync>>>,
}

impl Backlog {
    pub fn new(pool: Arc<Pool>, enable_ht40: bool, enable_lltf: bool, calibrate: bool, size: usize) -> Arc<Self> {
        let board_count = pool.board_count();
        let backlog = Arc::new(Self {
            pool: Arc::clone(&pool),
            calibrate,
            enable_ht40,
            enable_lltf,
            ring: RwLock::new(Ring::new(size, board_count, enable_ht40, enable_lltf)),
            mac_filter: Mutex::new(None),
            update_callbacks: Mutex::new(Vec::new()),
        });

        let handle = Arc::clone(&backlog);
        pool.add_csi_callback(None, Box::new(move |cluster: &Cluster| handle.new_csi_callback(cluster)));

        backlog
    }

    fn new_csi_callback(&self, cluster: &Cluster) {
        if let Some(filter) = self.mac_filter.lock().unwrap().as_ref() {
            if !filter.is_match(&mac_to_hex(&cluster.source_mac)) {
                return;
            }
        }

        let raw_timestamps = cluster.sensor_timestamps().clone();
        let timestamps = if self.calibrate {
            let calibration = self.pool.get_calibration().expect("calibrate=true requires Pool::set_calib to have run");
            calibration.apply_timestamps(&raw_timestamps)
        } else {
            raw_timestamps.clone()
        };

        let mut ring = self.ring.write().unwrap();
        let head = ring.head;
        for b in 0..ring.board_count {
            for r in 0..ROWS {
                for c in 0..COLS {
                    ring.timestamps[[head, b, r, c, 0]] = timestamps[[b, r, c]];
                    ring.rssi[[head, b, r, c, 0]] = cluster.rssi()[[b, r, c]];
                }
            }
        }

        if self.enable_ht40 {
            if cluster.is_ht40() {
                let mut ht40 = cluster.deserialize_ht40();
                if self.calibrate {
                    let calibration = self.pool.get_calibration().expect("calibrate=true requires Pool::set_calib to have run");
                    ht40 = calibration.apply_ht40(&ht40, &raw_timestamps);
                }
                if let Some(storage) = ring.ht40.as_mut() {
                    storage.slice_mut(s![head, .., .., .., ..]).assign(&ht40);
                }
            } else if let Some(storage) = ring.ht40.as_mut() {
                // Non-HT40 cluster this cycle: don't leave the previous
                // occupant's HT40 reading behind in the slot we're publishing.
                storage.slice_mut(s![head, .., .., .., ..]).fill(Complex32::new(f32::NAN, f32::NAN));
            }
        }

        if self.enable_lltf {
            let mut lltf = cluster.deserialize_lltf();
            if self.calibrate {
                let calibration = self.pool.get_calibration().expect("calibrate=true requires Pool::set_calib to have run");
                lltf = calibration.apply_lltf(&lltf, &raw_timestamps);
            }
            if let Some(storage) = ring.lltf.as_mut() {
                storage.slice_mut(s![head, .., .., .., ..]).assign(&lltf);
            }
        }

        ring.source_macs[head] = cluster.source_mac;
        ring.advance();
        drop(ring);

        for cb in self.update_callbacks.lock().unwrap().iter() {
            cb();
        }
    }

    pub fn add_update_callback(&self, cb: Box<dyn Fn() + Send + Sync>) {
        self.update_callbacks.lock().unwrap().push(cb);
    }

    pub fn set_mac_filter(&self, pattern: &str) -> Result<(), regex::Error> {
        *self.mac_filter.lock().unwrap() = Some(Regex::new(pattern)?);
        Ok(())
    }

    /// Oldest-first HT40 CSI, shape `(n, boards, ROWS, COLS, HT40_SUBCARRIERS)`.
    pub fn get_ht40(&self) -> Array5<Complex32> {
        assert!(self.enable_ht40, "HT40 storage was not enabled for this backlog");
        let ring = self.ring.read().unwrap();
        Ring::rolled(ring.ht40.as_ref().expect("enable_ht40 implies storage exists"), ring.head, ring.fill_level)
    }

    /// Oldest-first L-LTF CSI, shape `(n, boards, ROWS, COLS, LLTF_SUBCARRIERS)`.
    pub fn get_lltf(&self) -> Array5<Complex32> {
        assert!(self.enable_lltf, "L-LTF storage was not enabled for this backlog");
        let ring = self.ring.read().unwrap();
        Ring::rolled(ring.lltf.as_ref().expect("enable_lltf implies storage exists"), ring.head, ring.fill_level)
    }

    pub fn get_rssi(&self) -> Array5<f32> {
        let ring = self.ring.read().unwrap();
        Ring::rolled(&ring.rssi, ring.head, ring.fill_level)
    }

    pub fn get_timestamps(&self) -> Array5<f64> {
        let ring = self.ring.read().unwrap();
        Ring::rolled(&ring.timestamps, ring.head, ring.fill_level)
    }

    pub fn get_macs(&self) -> Vec<[u8; 6]> {
        let ring = self.ring.read().unwrap();
        let size = ring.size;
        (0..ring.fill_level).map(|i| ring.source_macs[(ring.head + size - ring.fill_level + i) % size]).collect()
    }

    /// Mean (over antennas) timestamp of the most recent packet, or `None`
    /// if the backlog is still empty.
    pub fn get_latest_timestamp(&self) -> Option<f64> {
        let ring = self.ring.read().unwrap();
        let latest = ring.latest?;
        let slice = ring.timestamps.slice(s![latest, .., .., .., 0]);
        Some(slice.iter().sum::<f64>() / slice.len() as f64)
    }

    pub fn nonempty(&self) -> bool {
        self.ring.read().unwrap().latest.is_some()
    }

    /// Start the underlying pool (a backlog has no thread of its own: the
    /// pool's drain thread is what calls back into it).
    pub fn start(&self) {
        info!("starting CSI backlog");
    }

    pub fn stop(&self) {
        info!("stopping CSI backlog");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::Pool;
    use espargos_wire::SeqCtrl;

    fn cluster_for_mac(mac: [u8; 6]) -> Cluster {
        Cluster::new(mac, [0xff; 6], SeqCtrl { frag: 0, seg: 1 }, 0)
    }

    /// S4: a backlog of size 3 receives 5 clusters; the oldest-first view
    /// holds exactly the last 3, in arrival order.
    #[test]
    fn ring_keeps_only_the_most_recent_entries_in_order() {
        let pool = Pool::new(vec![]);
        let backlog = Backlog::new(pool, false, false, false, 3);

        for i in 0..5u8 {
            backlog.new_csi_callback(&cluster_for_mac([i; 6]));
        }

        let macs = backlog.get_macs();
        assert_eq!(macs, vec![[2u8; 6], [3u8; 6], [4u8; 6]]);
    }

    /// S5: a MAC filter discards non-matching clusters outright (they never
    /// touch the ring), while matching clusters still advance it normally.
    #[test]
    fn mac_filter_discards_non_matching_clusters() {
        let pool = Pool::new(vec![]);
        let backlog = Backlog::new(pool, false, false, false, 3);
        backlog.set_mac_filter("^aabbcc").unwrap();

        backlog.new_csi_callback(&cluster_for_mac([0xaa, 0xbb, 0xcc, 0x00, 0x00, 0x01]));
        backlog.new_csi_callback(&cluster_for_mac([0x11, 0x22, 0x33, 0x00, 0x00, 0x02]));
        backlog.new_csi_callback(&cluster_for_mac([0xaa, 0xbb, 0xcc, 0x00, 0x00, 0x03]));

        let macs = backlog.get_macs();
        assert_eq!(macs, vec![[0xaa, 0xbb, 0xcc, 0x00, 0x00, 0x01], [0xaa, 0xbb, 0xcc, 0x00, 0x00, 0x03]]);
    }
}

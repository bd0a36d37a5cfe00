//! In-memory aggregation of the per-antenna fragments of one WiFi packet
//! across all boards in a pool (§4.3).

use espargos_wire::{SerializedCsi, SeqCtrl, ANTENNAS_PER_BOARD, COLS, HT40_SUBCARRIERS, ROWS};
use ndarray::{s, Array3, Array4};
use num_complex::Complex32;
use std::time::{Instant, SystemTime, UNIX_EPOCH};

use crate::constants;

/// All per-antenna fragments received so far for one `(source_mac,
/// dest_mac, seg, frag)` key.
///
/// Invariants upheld by [`Cluster::add`]: a filled `(board, row, col)` slot
/// is never overwritten; every contributor shares this cluster's key (a
/// mismatch is a programmer error — checked with `debug_assert!`).
pub struct Cluster {
    pub source_mac: [u8; 6],
    pub dest_mac: [u8; 6],
    pub seq_ctrl: SeqCtrl,
    board_count: usize,
    birth: Instant,
    /// Wall-clock birth, for comparing against sensor timestamps during
    /// calibration (`Instant` has no epoch and can't be compared to them).
    host_birth: SystemTime,

    csi: Array4<Complex32>,
    completion: Array3<bool>,
    completion_all: bool,
    rssi: Array3<f32>,
    noise_floor: Array3<f32>,
    sensor_timestamps: Array3<f64>,

    // Cached from the first contributing record; HT40 reassembly needs the
    // channel bonding info, which is the same for every antenna in a cluster.
    channel_primary: Option<u8>,
    secondary_channel_nibble: Option<u8>,
    cwb: Option<bool>,
}

impl Cluster {
    pub fn new(source_mac: [u8; 6], dest_mac: [u8; 6], seq_ctrl: SeqCtrl, board_count: usize) -> Self {
        let shape = (board_count, ROWS, COLS);
        Self {
            source_mac,
            dest_mac,
            seq_ctrl,
            board_count,
            birth: Instant::now(),
            host_birth: SystemTime::now(),
            csi: Array4::from_elem(
                (board_count, ROWS, COLS, espargos_wire::CSI_BUF_SAMPLES),
                Complex32::new(f32::NAN, f32::NAN),
            ),
            completion: Array3::from_elem(shape, false),
            completion_all: false,
            rssi: Array3::from_elem(shape, f32::NAN),
            noise_floor: Array3::from_elem(shape, f32::NAN),
            sensor_timestamps: Array3::from_elem(shape, f64::NAN),
            channel_primary: None,
            secondary_channel_nibble: None,
            cwb: None,
        }
    }

    /// Add one sensor's fragment. `complex_samples` must already be decoded
    /// from `(im, re)` int8 pairs (§4.1); the full `CSI_BUF_SAMPLES`-wide
    /// slice is expected, not just a subband.
    ///
    /// `debug_assert!`s that `record`'s key fields match this cluster's key
    /// (`MacMismatch`/`SeqMismatch` in the error table are programmer
    /// errors, not recoverable conditions).
    pub fn add(&mut self, board: usize, esp_num: u32, record: &SerializedCsi, complex_samples: &[Complex32]) {
        debug_assert_eq!(record.source_mac, self.source_mac, "MacMismatch: source_mac");
        debug_assert_eq!(record.dest_mac, self.dest_mac, "MacMismatch: dest_mac");
        debug_assert_eq!(record.seq_ctrl, self.seq_ctrl, "SeqMismatch: seq_ctrl");
        debug_assert_eq!(complex_samples.len(), espargos_wire::CSI_BUF_SAMPLES);

        let (row, col) = espargos_wire::antenna_position(esp_num % ANTENNAS_PER_BOARD as u32);
        if self.completion[[board, row, col]] {
            // Invariant (i): a filled slot is never overwritten.
            return;
        }

        if self.channel_primary.is_none() {
            self.channel_primary = Some(record.rx_ctrl.channel);
            self.secondary_channel_nibble = Some(record.rx_ctrl.secondary_channel);
            self.cwb = Some(record.rx_ctrl.cwb);
        }

        self.csi
            .slice_mut(s![board, row, col, ..])
            .assign(&ndarray::ArrayView1::from(complex_samples));
        self.rssi[[board, row, col]] = record.rx_ctrl.rssi as f32;
        self.noise_floor[[board, row, col]] = record.rx_ctrl.noise_floor as f32;
        self.sensor_timestamps[[board, row, col]] = antenna_timestamp_seconds(record);
        self.completion[[board, row, col]] = true;
        self.completion_all = self.completion.iter().all(|&b| b);
    }

    pub fn completion(&self) -> &Array3<bool> {
        &self.completion
    }

    pub fn completion_all(&self) -> bool {
        self.completion_all
    }

    pub fn age(&self) -> std::time::Duration {
        self.birth.elapsed()
    }

    /// Host wall-clock time this cluster was first seen, seconds since the
    /// Unix epoch — comparable to `sensor_timestamps()`.
    pub fn host_timestamp_seconds(&self) -> f64 {
        self.host_birth.duration_since(UNIX_EPOCH).unwrap_or_default().as_secs_f64()
    }

    pub fn board_count(&self) -> usize {
        self.board_count
    }

    pub fn rssi(&self) -> &Array3<f32> {
        &self.rssi
    }

    pub fn noise_floor(&self) -> &Array3<f32> {
        &self.noise_floor
    }

    pub fn sensor_timestamps(&self) -> &Array3<f64> {
        &self.sensor_timestamps
    }

    pub fn is_ht40(&self) -> bool {
        self.cwb.unwrap_or(false)
    }

    /// `+1` if the secondary channel is above the primary, `-1` if below,
    /// `0` if HT40 is not in use.
    pub fn secondary_channel_relative(&self) -> i8 {
        match self.secondary_channel_nibble {
            Some(0) | None => 0,
            Some(1) => 1,
            Some(2) => -1,
            Some(other) => {
                debug_assert!(false, "unexpected secondary_channel nibble {other}");
                0
            }
        }
    }

    pub fn primary_channel(&self) -> Option<u8> {
        self.channel_primary
    }

    pub fn secondary_channel(&self) -> Option<u8> {
        self.channel_primary
            .map(|p| (p as i16 + 4 * self.secondary_channel_relative() as i16) as u8)
    }

    /// The already-contiguous L-LTF subband, shape `(B, ROWS, COLS, 53)`.
    pub fn deserialize_lltf(&self) -> Array4<Complex32> {
        let lltf_start = 6; // lltf_guard_below
        let lltf_len = espargos_wire::LLTF_SUBCARRIERS;
        self.csi
            .slice(s![.., .., .., lltf_start..lltf_start + lltf_len])
            .to_owned()
    }

    /// Assemble the `[htltf_lower … gap … htltf_higher]` HT40 tensor,
    /// applying the `exp(-jπ/2)` pilot-rotation correction to whichever
    /// half is the secondary channel. Panics if called on a non-HT40
    /// cluster (mirrors the source's `assert(is_ht40())`).
    pub fn deserialize_ht40(&self) -> Array4<Complex32> {
        assert!(self.is_ht40(), "deserialize_ht40 called on a non-HT40 cluster");
        let loc = self.secondary_channel_relative();
        assert_ne!(loc, 0, "deserialize_ht40 called with secondary_channel_relative == 0");

        let half = espargos_wire::HTLTF_HALF_SUBCARRIERS;
        let gap = espargos_wire::HT40_GAP_SUBCARRIERS;

        let htltf_higher_start = 6 + espargos_wire::LLTF_SUBCARRIERS + 7; // guard_below + lltf + guard_above
        let htltf_lower_start = htltf_higher_start + half + 11; // + htltf_higher + guard

        let mut ht40 = Array4::<Complex32>::zeros((self.board_count, ROWS, COLS, HT40_SUBCARRIERS));
        ht40.slice_mut(s![.., .., .., 0..half])
            .assign(&self.csi.slice(s![.., .., .., htltf_lower_start..htltf_lower_start + half]));
        ht40.slice_mut(s![.., .., .., half + gap..half + gap + half])
            .assign(&self.csi.slice(s![.., .., .., htltf_higher_start..htltf_higher_start + half]));

        let rot = Complex32::from_polar(1.0, -std::f32::consts::FRAC_PI_2);
        if loc == 1 {
            let mut lower = ht40.slice_mut(s![.., .., .., 0..half]);
            lower.mapv_inplace(|v| v * rot);
        } else {
            let mut higher = ht40.slice_mut(s![.., .., .., half + gap..half + gap + half]);
            higher.mapv_inplace(|v| v * rot);
        }

        ht40
    }
}

/// Per-antenna nanosecond-resolution timestamp, in seconds (§4.3).
///
/// Combines the microsecond base (`global_timestamp_us` if non-zero, else
/// the legacy `timestamp` field), the 80 MHz `rxstart_time_cyc` counter and
/// the 640 MHz `rxstart_time_cyc_dec` fractional counter (folded into
/// `[-1024, 1023]`), minus a fixed hardware lag.
fn antenna_timestamp_seconds(record: &SerializedCsi) -> f64 {
    let rx_ctrl = &record.rx_ctrl;
    let base_us = if rx_ctrl.global_timestamp_us != 0 {
        rx_ctrl.global_timestamp_us
    } else {
        record.timestamp
    };
    let base_s = base_us as f64 * 1e-6;

    let cyc_s = rx_ctrl.rxstart_time_cyc as f64 / constants::RXSTART_TIME_CYC_HZ;

    let mut dec = rx_ctrl.rxstart_time_cyc_dec as i32;
    if dec >= 1024 {
        dec -= 2048;
    }
    let dec_s = dec as f64 / constants::RXSTART_TIME_CYC_DEC_HZ;

    base_s + cyc_s + dec_s - constants::HARDWARE_TIMESTAMP_LAG_NS * 1e-9
}

/// Build a `(source_mac, dest_mac, seg, frag)` cache key, matching the
/// `"{src}-{dst}-{seg:03x}-{frag:01x}"` convention of the host it fuses
/// packets from.
pub fn cluster_key(source_mac: &[u8; 6], dest_mac: &[u8; 6], seq_ctrl: &SeqCtrl) -> String {
    format!(
        "{}-{}-{:03x}-{:01x}",
        espargos_wire::mac_to_hex(source_mac),
        espargos_wire::mac_to_hex(dest_mac),
        seq_ctrl.seg,
        seq_ctrl.frag
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use espargos_wire::{CsiBuf, RxCtrl, CSI_BUF_BYTES};

    fn fake_record(channel: u8, secondary: u8, cwb: bool, timestamp: u32) -> SerializedCsi {
        SerializedCsi {
            rx_ctrl: RxCtrl {
                rssi: -20,
                channel,
                secondary_channel: secondary,
                cwb,
                rxstart_time_cyc: 0,
                rxstart_time_cyc_dec: 0,
                noise_floor: -90,
                timestamp,
                global_timestamp_us: 0,
            },
            source_mac: [1, 2, 3, 4, 5, 6],
            dest_mac: [0xaa; 6],
            seq_ctrl: SeqCtrl { frag: 0, seg: 7 },
            timestamp,
            is_calib: false,
            first_word_invalid: false,
            buf: CsiBuf([0u8; CSI_BUF_BYTES]),
        }
    }

    fn samples() -> Vec<Complex32> {
        (0..espargos_wire::CSI_BUF_SAMPLES)
            .map(|k| Complex32::new(k as f32, -(k as f32)))
            .collect()
    }

    #[test]
    fn completion_is_monotone_and_all_iff_all_bits_set() {
        let mut cluster = Cluster::new([1, 2, 3, 4, 5, 6], [0xaa; 6], SeqCtrl { frag: 0, seg: 7 }, 1);
        let rec = fake_record(6, 0, false, 1_000_000);
        assert!(!cluster.completion_all());

        for esp_num in 0..8u32 {
            cluster.add(0, esp_num, &rec, &samples());
            let expect_all = esp_num == 7;
            assert_eq!(cluster.completion_all(), expect_all);
        }
    }

    #[test]
    fn filled_slot_is_not_overwritten() {
        let mut cluster = Cluster::new([1, 2, 3, 4, 5, 6], [0xaa; 6], SeqCtrl { frag: 0, seg: 7 }, 1);
        let rec_a = fake_record(6, 0, false, 1_000_000);
        let rec_b = fake_record(6, 0, false, 2_000_000);
        cluster.add(0, 0, &rec_a, &samples());
        let ts_after_first = cluster.sensor_timestamps()[[0, 1, 3]];
        cluster.add(0, 0, &rec_b, &samples());
        assert_eq!(cluster.sensor_timestamps()[[0, 1, 3]], ts_after_first);
    }

    #[test]
    fn ht40_assembly_width_and_rotation_sign() {
        let mut cluster = Cluster::new([1, 2, 3, 4, 5, 6], [0xaa; 6], SeqCtrl { frag: 0, seg: 7 }, 1);
        let rec = fake_record(6, 1, true, 1_000_000); // secondary_channel_relative == +1
        for esp_num in 0..8u32 {
            cluster.add(0, esp_num, &rec, &samples());
        }

        let ht40 = cluster.deserialize_ht40();
        assert_eq!(ht40.shape()[3], HT40_SUBCARRIERS);
        assert_eq!(cluster.secondary_channel_relative(), 1);
    }
}

//! Wire codec for the ESPARGOS sensor board binary CSI packet format.
//!
//! Mirrors the fixed, packed `ctypes.LittleEndianStructure` layout of
//! `serialized_csi_t` / `csistream_pkt_t` from the ESPARGOS controller
//! firmware (see `espargos.csi` in the original Python driver). No async,
//! no I/O — pure decode/encode of byte buffers.
//!
//! ## Complex sample convention
//!
//! Each complex channel coefficient is stored on the wire as two signed
//! `i8` bytes, in `(imaginary, real)` order. `decode(buf)[k] = buf[2k+1] +
//! j*buf[2k]`.

use num_complex::Complex32;
use thiserror::Error;

// ── Frame constants ───────────────────────────────────────────────────────────

/// Magic value identifying a CSI-typed record.
pub const TYPE_HEADER_CSI: u32 = 0x5A1F_19B1;

/// Rows of antennas per sensor board.
pub const ROWS: usize = 2;
/// Antennas per row.
pub const COLS: usize = 4;
/// Total antennas on one board.
pub const ANTENNAS_PER_BOARD: usize = ROWS * COLS;

/// Antenna center-to-center spacing, in meters (half-wavelength at 2.5 GHz).
pub const ANTENNA_SEPARATION_M: f64 = 0.06;

/// Gap between the lower and higher HT-LTF halves in HT40 mode, in subcarriers.
pub const HT40_GAP_SUBCARRIERS: usize = 3;

const LLTF_GUARD_BELOW: usize = 6;
/// Width of the L-LTF subband, in subcarriers.
pub const LLTF_SUBCARRIERS: usize = 53;
const LLTF_GUARD_ABOVE: usize = 7;
/// Width of one HT-LTF half (lower or higher), in subcarriers.
pub const HTLTF_HALF_SUBCARRIERS: usize = 57;
const HTLTF_GUARD: usize = 11;

/// Width of the assembled HT40 tensor: both HT-LTF halves plus the DC gap.
pub const HT40_SUBCARRIERS: usize = HTLTF_HALF_SUBCARRIERS * 2 + HT40_GAP_SUBCARRIERS;

/// Total complex samples packed into `csi_buf_t::buf`.
pub const CSI_BUF_SAMPLES: usize =
    LLTF_GUARD_BELOW + LLTF_SUBCARRIERS + LLTF_GUARD_ABOVE + HTLTF_HALF_SUBCARRIERS * 2 + HTLTF_GUARD;
/// Byte length of `csi_buf_t::buf` (two `i8` per complex sample).
pub const CSI_BUF_BYTES: usize = CSI_BUF_SAMPLES * 2;

/// Byte length of the bit-packed `rx_ctrl` descriptor.
///
/// The firmware's own `wifi_pkt_rx_ctrl_t` is 37 bytes by strict
/// `sizeof`, but the legacy host driver reads only 36 — a documented
/// one-byte workaround (see DESIGN.md). This implementation follows that
/// 36-byte convention and lays out the fields spec.md names
/// (`rssi`, `channel`, `secondary_channel`, `cwb`, `rxstart_time_cyc`,
/// `rxstart_time_cyc_dec`, `noise_floor`, `timestamp`, `global_timestamp_us`)
/// at fixed, non-overlapping offsets within it. See `RxCtrl` for the exact
/// byte map.
pub const RX_CTRL_BYTES: usize = 36;

const MAC_BYTES: usize = 6;
const SEQ_CTRL_BYTES: usize = 2;

/// Byte length of one `serialized_csi_t` record.
pub const SERIALIZED_CSI_BYTES: usize =
    4 + RX_CTRL_BYTES + MAC_BYTES * 2 + SEQ_CTRL_BYTES + 4 + 1 + 1 + CSI_BUF_BYTES;

/// Byte length of one stream (SPI/WebSocket) frame: `esp_num` plus a
/// zero-padded `serialized_csi_t` record.
pub const STREAM_PACKET_BYTES: usize = 512;

// ── Errors ─────────────────────────────────────────────────────────────────────

#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum WireError {
    #[error("bad magic: expected {expected:#010x}, found {found:#010x}")]
    BadMagic { expected: u32, found: u32 },
    #[error("short frame: have {have} bytes, need {need}")]
    ShortFrame { have: usize, need: usize },
}

// ── Complex sample conversion ──────────────────────────────────────────────────

/// Convert one `(imaginary, real)` int8 pair into a complex sample.
///
/// `c = (re as f32) + j * (im as f32)`, i.e. `decode(buf)[k] = buf[2k+1] +
/// j*buf[2k]`.
#[inline]
pub fn sample_from_im_re(im: i8, re: i8) -> Complex32 {
    Complex32::new(re as f32, im as f32)
}

fn decode_samples(bytes: &[u8], count: usize) -> Vec<Complex32> {
    let mut out = Vec::with_capacity(count);
    for i in 0..count {
        let im = bytes[2 * i] as i8;
        let re = bytes[2 * i + 1] as i8;
        out.push(sample_from_im_re(im, re));
    }
    out
}

// ── rx_ctrl ────────────────────────────────────────────────────────────────────

/// Decoded WiFi receive descriptor (subset of fields this crate needs).
///
/// Byte map within the 36-byte `rx_ctrl` buffer (see `RX_CTRL_BYTES`):
///
/// | offset | field |
/// |---|---|
/// | 0 | `rssi` (i8) |
/// | 1 | `channel` (low nibble), `secondary_channel` (high nibble) |
/// | 2 | `cwb` (bit 0), `rxstart_time_cyc` (bits 1-7) |
/// | 3..5 | `rxstart_time_cyc_dec` (u16 LE, 11 bits used) |
/// | 5 | `noise_floor` (i8) |
/// | 6..10 | `timestamp` (u32 LE) |
/// | 10..14 | `global_timestamp_us` (u32 LE) |
/// | 14..36 | reserved |
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RxCtrl {
    pub rssi: i8,
    pub channel: u8,
    pub secondary_channel: u8,
    pub cwb: bool,
    pub rxstart_time_cyc: u8,
    pub rxstart_time_cyc_dec: u16,
    pub noise_floor: i8,
    pub timestamp: u32,
    pub global_timestamp_us: u32,
}

impl RxCtrl {
    pub fn parse(bytes: &[u8; RX_CTRL_BYTES]) -> Self {
        let channel = bytes[1] & 0x0F;
        let secondary_channel = (bytes[1] >> 4) & 0x0F;
        let cwb = bytes[2] & 0x01 != 0;
        let rxstart_time_cyc = (bytes[2] >> 1) & 0x7F;
        let rxstart_time_cyc_dec = u16::from_le_bytes([bytes[3], bytes[4]]) & 0x07FF;

        Self {
            rssi: bytes[0] as i8,
            channel,
            secondary_channel,
            cwb,
            rxstart_time_cyc,
            rxstart_time_cyc_dec,
            noise_floor: bytes[5] as i8,
            timestamp: u32::from_le_bytes(bytes[6..10].try_into().unwrap()),
            global_timestamp_us: u32::from_le_bytes(bytes[10..14].try_into().unwrap()),
        }
    }
}

// ── seq_ctrl ───────────────────────────────────────────────────────────────────

/// Sequence control field: fragment number and segment (sequence) number.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SeqCtrl {
    pub frag: u8,
    pub seg: u16,
}

impl SeqCtrl {
    pub fn parse(bytes: &[u8; SEQ_CTRL_BYTES]) -> Self {
        let raw = u16::from_le_bytes(*bytes);
        Self {
            frag: (raw & 0x0F) as u8,
            seg: (raw >> 4) & 0x0FFF,
        }
    }
}

// ── csi_buf_t ──────────────────────────────────────────────────────────────────

/// Raw CSI sample buffer, laid out exactly as the firmware produces it:
/// `lltf_guard_below[6] . lltf[53] . lltf_guard_above[7] . htltf_higher[57]
/// . htltf_guard[11] . htltf_lower[57]`.
#[derive(Clone)]
pub struct CsiBuf(pub [u8; CSI_BUF_BYTES]);

impl CsiBuf {
    fn slice_samples(&self, sample_start: usize, count: usize) -> Vec<Complex32> {
        decode_samples(&self.0[sample_start * 2..(sample_start + count) * 2], count)
    }

    /// The 53-subcarrier L-LTF subband (already contiguous on the wire).
    pub fn lltf(&self) -> Vec<Complex32> {
        self.slice_samples(LLTF_GUARD_BELOW, LLTF_SUBCARRIERS)
    }

    /// The higher HT-LTF half (57 subcarriers).
    pub fn htltf_higher(&self) -> Vec<Complex32> {
        self.slice_samples(LLTF_GUARD_BELOW + LLTF_SUBCARRIERS + LLTF_GUARD_ABOVE, HTLTF_HALF_SUBCARRIERS)
    }

    /// The lower HT-LTF half (57 subcarriers).
    pub fn htltf_lower(&self) -> Vec<Complex32> {
        let start = LLTF_GUARD_BELOW
            + LLTF_SUBCARRIERS
            + LLTF_GUARD_ABOVE
            + HTLTF_HALF_SUBCARRIERS
            + HTLTF_GUARD;
        self.slice_samples(start, HTLTF_HALF_SUBCARRIERS)
    }

    /// Every sample in the buffer, guard bands included, in wire order.
    pub fn all_samples(&self) -> Vec<Complex32> {
        self.slice_samples(0, CSI_BUF_SAMPLES)
    }
}

impl std::fmt::Debug for CsiBuf {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CsiBuf").field("bytes", &self.0.len()).finish()
    }
}

// ── serialized_csi_t ───────────────────────────────────────────────────────────

/// One decoded CSI record: the per-sensor, per-WiFi-packet payload.
#[derive(Debug, Clone)]
pub struct SerializedCsi {
    pub rx_ctrl: RxCtrl,
    pub source_mac: [u8; 6],
    pub dest_mac: [u8; 6],
    pub seq_ctrl: SeqCtrl,
    pub timestamp: u32,
    pub is_calib: bool,
    pub first_word_invalid: bool,
    pub buf: CsiBuf,
}

impl SerializedCsi {
    /// Decode one record from a byte slice. Fails with `BadMagic` if the
    /// header magic mismatches, `ShortFrame` if fewer than
    /// `SERIALIZED_CSI_BYTES` bytes are available.
    pub fn decode(bytes: &[u8]) -> Result<Self, WireError> {
        if bytes.len() < SERIALIZED_CSI_BYTES {
            return Err(WireError::ShortFrame {
                have: bytes.len(),
                need: SERIALIZED_CSI_BYTES,
            });
        }

        let type_header = u32::from_le_bytes(bytes[0..4].try_into().unwrap());
        if type_header != TYPE_HEADER_CSI {
            return Err(WireError::BadMagic {
                expected: TYPE_HEADER_CSI,
                found: type_header,
            });
        }

        let mut off = 4;
        let rx_ctrl_bytes: [u8; RX_CTRL_BYTES] = bytes[off..off + RX_CTRL_BYTES].try_into().unwrap();
        let rx_ctrl = RxCtrl::parse(&rx_ctrl_bytes);
        off += RX_CTRL_BYTES;

        let source_mac: [u8; 6] = bytes[off..off + 6].try_into().unwrap();
        off += 6;
        let dest_mac: [u8; 6] = bytes[off..off + 6].try_into().unwrap();
        off += 6;

        let seq_ctrl_bytes: [u8; SEQ_CTRL_BYTES] = bytes[off..off + SEQ_CTRL_BYTES].try_into().unwrap();
        let seq_ctrl = SeqCtrl::parse(&seq_ctrl_bytes);
        off += SEQ_CTRL_BYTES;

        let timestamp = u32::from_le_bytes(bytes[off..off + 4].try_into().unwrap());
        off += 4;

        let is_calib = bytes[off] != 0;
        off += 1;
        let first_word_invalid = bytes[off] != 0;
        off += 1;

        let mut buf = [0u8; CSI_BUF_BYTES];
        buf.copy_from_slice(&bytes[off..off + CSI_BUF_BYTES]);

        Ok(Self {
            rx_ctrl,
            source_mac,
            dest_mac,
            seq_ctrl,
            timestamp,
            is_calib,
            first_word_invalid,
            buf: CsiBuf(buf),
        })
    }

    /// `1` if the lower-relative secondary channel, `-1` if higher-relative,
    /// `0` if HT40 is not in use (`secondary_channel == 0`).
    pub fn secondary_channel_relative(&self) -> i8 {
        match self.rx_ctrl.secondary_channel {
            0 => 0,
            1 => 1,
            2 => -1,
            other => {
                debug_assert!(false, "unexpected secondary_channel nibble {other}");
                0
            }
        }
    }

    pub fn is_ht40(&self) -> bool {
        self.rx_ctrl.cwb
    }
}

/// Format a raw MAC address as a lowercase hex string, no separators
/// (matches pyespargos's `binascii.hexlify` cluster key convention).
pub fn mac_to_hex(mac: &[u8; 6]) -> String {
    let mut s = String::with_capacity(12);
    for b in mac {
        use std::fmt::Write;
        let _ = write!(s, "{b:02x}");
    }
    s
}

/// Parse a hex-encoded MAC address (inverse of [`mac_to_hex`]). Returns
/// `None` if the string isn't exactly 12 hex digits.
pub fn mac_from_hex(s: &str) -> Option<[u8; 6]> {
    if s.len() != 12 {
        return None;
    }
    let mut mac = [0u8; 6];
    for i in 0..6 {
        mac[i] = u8::from_str_radix(&s[i * 2..i * 2 + 2], 16).ok()?;
    }
    Some(mac)
}

// ── csistream_pkt_t ────────────────────────────────────────────────────────────

/// One decoded stream frame: the sensor index (`esp_num`) plus the CSI
/// record it carries.
#[derive(Debug, Clone)]
pub struct StreamPacket {
    pub esp_num: u32,
    pub record: SerializedCsi,
}

/// Decode one `STREAM_PACKET_BYTES`-sized frame as received over the
/// controller WebSocket.
pub fn decode_stream_packet(bytes: &[u8]) -> Result<StreamPacket, WireError> {
    if bytes.len() < STREAM_PACKET_BYTES {
        return Err(WireError::ShortFrame {
            have: bytes.len(),
            need: STREAM_PACKET_BYTES,
        });
    }

    let esp_num = u32::from_le_bytes(bytes[0..4].try_into().unwrap());
    let record = SerializedCsi::decode(&bytes[4..])?;
    Ok(StreamPacket { esp_num, record })
}

/// Logical `(row, col)` antenna position for a given `esp_num in [0,7]`.
pub fn antenna_position(esp_num: u32) -> (usize, usize) {
    let esp_num = esp_num as usize % ANTENNAS_PER_BOARD;
    let row = 1 - esp_num / COLS;
    let col = 3 - esp_num % COLS;
    (row, col)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_record_bytes(is_calib: bool) -> Vec<u8> {
        let mut buf = vec![0u8; SERIALIZED_CSI_BYTES];
        buf[0..4].copy_from_slice(&TYPE_HEADER_CSI.to_le_bytes());

        // rx_ctrl at offset 4
        let rx_ctrl_off = 4;
        buf[rx_ctrl_off] = (-10i8) as u8; // rssi
        buf[rx_ctrl_off + 1] = 0x16; // channel=6 secondary=1
        buf[rx_ctrl_off + 2] = 0b0000_0011; // cwb=1, rxstart_time_cyc=1
        buf[rx_ctrl_off + 3..rx_ctrl_off + 5].copy_from_slice(&100u16.to_le_bytes());
        buf[rx_ctrl_off + 5] = (-40i8) as u8; // noise_floor
        buf[rx_ctrl_off + 6..rx_ctrl_off + 10].copy_from_slice(&1_000_000u32.to_le_bytes());
        buf[rx_ctrl_off + 10..rx_ctrl_off + 14].copy_from_slice(&2_000_000u32.to_le_bytes());

        let mac_off = rx_ctrl_off + RX_CTRL_BYTES;
        buf[mac_off..mac_off + 6].copy_from_slice(&[0xAA, 0xBB, 0xCC, 0x01, 0x02, 0x03]);
        buf[mac_off + 6..mac_off + 12].copy_from_slice(&[0xDE, 0xAD, 0xBE, 0xEF, 0x00, 0x01]);

        let seq_off = mac_off + 12;
        let raw_seq: u16 = (3u16 & 0xF) | ((42u16 & 0xFFF) << 4);
        buf[seq_off..seq_off + 2].copy_from_slice(&raw_seq.to_le_bytes());

        let ts_off = seq_off + 2;
        buf[ts_off..ts_off + 4].copy_from_slice(&12345u32.to_le_bytes());

        buf[ts_off + 4] = is_calib as u8;
        buf[ts_off + 5] = 0;

        let csi_off = ts_off + 6;
        for k in 0..CSI_BUF_SAMPLES {
            buf[csi_off + 2 * k] = k as u8; // im
            buf[csi_off + 2 * k + 1] = (k as u8).wrapping_add(1); // re
        }

        buf
    }

    #[test]
    fn decode_roundtrip_fields() {
        let bytes = sample_record_bytes(true);
        let rec = SerializedCsi::decode(&bytes).unwrap();
        assert_eq!(rec.rx_ctrl.rssi, -10);
        assert_eq!(rec.rx_ctrl.channel, 6);
        assert_eq!(rec.rx_ctrl.secondary_channel, 1);
        assert!(rec.rx_ctrl.cwb);
        assert_eq!(rec.rx_ctrl.rxstart_time_cyc, 1);
        assert_eq!(rec.rx_ctrl.rxstart_time_cyc_dec, 100);
        assert_eq!(rec.rx_ctrl.noise_floor, -40);
        assert_eq!(rec.rx_ctrl.timestamp, 1_000_000);
        assert_eq!(rec.rx_ctrl.global_timestamp_us, 2_000_000);
        assert_eq!(rec.source_mac, [0xAA, 0xBB, 0xCC, 0x01, 0x02, 0x03]);
        assert_eq!(rec.dest_mac, [0xDE, 0xAD, 0xBE, 0xEF, 0x00, 0x01]);
        assert_eq!(rec.seq_ctrl.frag, 3);
        assert_eq!(rec.seq_ctrl.seg, 42);
        assert_eq!(rec.timestamp, 12345);
        assert!(rec.is_calib);
        assert!(!rec.first_word_invalid);
    }

    #[test]
    fn complex_sample_convention_is_im_re() {
        let bytes = sample_record_bytes(false);
        let rec = SerializedCsi::decode(&bytes).unwrap();
        let lltf = rec.buf.lltf();
        // lltf starts at sample index LLTF_GUARD_BELOW == 6
        let k = LLTF_GUARD_BELOW;
        let expected = sample_from_im_re(k as u8 as i8, (k as u8).wrapping_add(1) as i8);
        assert_eq!(lltf[0], expected);
    }

    #[test]
    fn bad_magic_is_rejected() {
        let mut bytes = sample_record_bytes(false);
        bytes[0] = 0;
        match SerializedCsi::decode(&bytes) {
            Err(WireError::BadMagic { .. }) => {}
            other => panic!("expected BadMagic, got {other:?}"),
        }
    }

    #[test]
    fn short_frame_is_rejected() {
        let bytes = vec![0u8; SERIALIZED_CSI_BYTES - 1];
        match SerializedCsi::decode(&bytes) {
            Err(WireError::ShortFrame { .. }) => {}
            other => panic!("expected ShortFrame, got {other:?}"),
        }
    }

    #[test]
    fn stream_packet_decode() {
        let record_bytes = sample_record_bytes(false);
        let mut frame = vec![0u8; STREAM_PACKET_BYTES];
        frame[0..4].copy_from_slice(&3u32.to_le_bytes());
        frame[4..4 + record_bytes.len()].copy_from_slice(&record_bytes);
        let pkt = decode_stream_packet(&frame).unwrap();
        assert_eq!(pkt.esp_num, 3);
        assert_eq!(pkt.record.timestamp, 12345);
    }

    #[test]
    fn antenna_position_mapping() {
        assert_eq!(antenna_position(0), (1, 3));
        assert_eq!(antenna_position(4), (0, 3));
        assert_eq!(antenna_position(7), (0, 0));
    }

    #[test]
    fn mac_hex_roundtrip() {
        let mac = [0xAA, 0xBB, 0xCC, 0x01, 0x02, 0x03];
        let hex = mac_to_hex(&mac);
        assert_eq!(hex, "aabbcc010203");
        assert_eq!(mac_from_hex(&hex), Some(mac));
    }
}

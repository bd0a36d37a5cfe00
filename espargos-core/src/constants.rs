//! Physical constants for calibration trace and WiFi channel math.
//!
//! Frame/array geometry constants (`ROWS`, `COLS`, subcarrier counts) live in
//! `espargos_wire` next to the layouts they describe; this module only holds
//! the constants calibration needs and nothing decodes from the wire.

/// Speed of light in vacuum, m/s.
pub const SPEED_OF_LIGHT: f64 = 299_792_458.0;

/// Calibration signal trace lengths on the sensor PCB, in meters, indexed
/// `[row][col]`.
pub const CALIB_TRACE_LENGTH_M: [[f64; 4]; 2] = [
    [0.0708462, 0.0229349, 0.0786856, 0.1423600],
    [0.0838888, 0.0295291, 0.0671322, 0.1308537],
];

/// Dielectric constant of the sensor PCB substrate.
pub const CALIB_TRACE_DIELECTRIC_CONSTANT: f64 = 4.3;

/// Width of the calibration signal trace, in meters.
pub const CALIB_TRACE_WIDTH_M: f64 = 0.2;

/// Height of the calibration trace above the ground plane, in meters.
pub const CALIB_TRACE_HEIGHT_M: f64 = 0.119;

/// Effective dielectric constant of a microstrip with the board's geometry.
pub fn calib_trace_effective_dielectric_constant() -> f64 {
    let er = CALIB_TRACE_DIELECTRIC_CONSTANT;
    (er + 1.0) / 2.0
        + (er - 1.0) / 2.0 * (1.0 + 12.0 * (CALIB_TRACE_HEIGHT_M / CALIB_TRACE_WIDTH_M)).powf(-0.5)
}

/// Group velocity of the calibration signal on the PCB trace, m/s.
pub fn calib_trace_group_velocity() -> f64 {
    SPEED_OF_LIGHT / calib_trace_effective_dielectric_constant().sqrt()
}

/// Center frequency of WiFi channel 1 (2.4 GHz band), Hz.
pub const WIFI_CHANNEL1_FREQUENCY_HZ: f64 = 2.412e9;

/// Frequency spacing between adjacent WiFi channel numbers, Hz.
pub const WIFI_CHANNEL_SPACING_HZ: f64 = 5e6;

/// WiFi OFDM subcarrier spacing, Hz.
pub const WIFI_SUBCARRIER_SPACING_HZ: f64 = 312.5e3;

/// Fixed hardware lag subtracted from every per-antenna timestamp, ns.
pub const HARDWARE_TIMESTAMP_LAG_NS: f64 = 20_800.0;

/// `rxstart_time_cyc` clock rate, Hz (80 MHz).
pub const RXSTART_TIME_CYC_HZ: f64 = 80e6;

/// `rxstart_time_cyc_dec` clock rate, Hz (640 MHz).
pub const RXSTART_TIME_CYC_DEC_HZ: f64 = 640e6;

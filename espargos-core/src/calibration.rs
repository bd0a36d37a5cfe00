//! Derivation and application of per-antenna phase and timestamp
//! corrections (§4.4 step 6-7, §4.5).

use espargos_wire::{COLS, HT40_SUBCARRIERS, LLTF_SUBCARRIERS, ROWS};
use ndarray::{Array1, Array3, Array4, ArrayD, Axis, IxDyn};
use num_complex::Complex32;

use crate::constants;
use crate::error::{Error, Result};
use crate::numeric;

/// One complete calibration-mode cluster, reduced to what `Calibration`
/// needs: the assembled HT40 and L-LTF tensors and the sensor-vs-host
/// timestamp offset, for either one board (`per_board` mode) or the whole
/// array (combined mode).
pub struct ReferenceSample {
    pub ht40: ArrayD<Complex32>,
    pub lltf: ArrayD<Complex32>,
    pub timestamp_offset: ArrayD<f64>,
}

/// Immutable, once derived: the phase and timestamp corrections produced by
/// one `Pool::calibrate()` call. Every entry of `phase_correction` and
/// `lltf_phase_correction` has unit magnitude; `timestamp_offset` has both
/// the host-clock offset and the calibration-trace group delay subtracted.
#[derive(Clone)]
pub struct Calibration {
    channel_primary: u8,
    channel_secondary: u8,
    /// Shape `(B, ROWS, COLS, HT40_SUBCARRIERS)`, unit modulus.
    phase_correction: Array4<Complex32>,
    /// Shape `(B, ROWS, COLS, LLTF_SUBCARRIERS)`, unit modulus.
    lltf_phase_correction: Array4<Complex32>,
    /// Shape `(B, ROWS, COLS)`, subcarrier-summed (not unit modulus).
    phase_correction_flat: Array3<Complex32>,
    /// Shape `(B, ROWS, COLS)`, seconds.
    timestamp_offset: Array3<f64>,
}

impl Calibration {
    pub fn channel_primary(&self) -> u8 {
        self.channel_primary
    }

    pub fn channel_secondary(&self) -> u8 {
        self.channel_secondary
    }

    pub fn timestamp_offset(&self) -> &Array3<f64> {
        &self.timestamp_offset
    }

    /// Derive a calibration from a set of complete reference samples.
    ///
    /// `per_board`: each sample's tensors are shape `(ROWS, COLS, W)` /
    /// `(ROWS, COLS)` (one board at a time, no cable compensation).
    /// Combined (`!per_board`): each sample covers all `B` boards at once,
    /// shape `(B, ROWS, COLS, W)` / `(B, ROWS, COLS)`, and `cable_lengths`
    /// / `cable_velocity_factors` (one entry per board) may additionally
    /// compensate for feeder-cable length differences.
    pub fn derive(
        samples_per_board: &[Vec<ReferenceSample>],
        channel_primary: u8,
        channel_secondary: u8,
        per_board: bool,
        cable_lengths_m: Option<&[f64]>,
        cable_velocity_factors: Option<&[f64]>,
    ) -> Result<Self> {
        let board_count = samples_per_board.len();
        if samples_per_board.iter().any(|s| s.is_empty()) {
            return Err(Error::CalibrationFailed { board: None });
        }

        let center_primary = constants::WIFI_CHANNEL1_FREQUENCY_HZ + constants::WIFI_CHANNEL_SPACING_HZ * (channel_primary as f64 - 1.0);
        let center_secondary = constants::WIFI_CHANNEL1_FREQUENCY_HZ + constants::WIFI_CHANNEL_SPACING_HZ * (channel_secondary as f64 - 1.0);
        let center_ht40 = (center_primary + center_secondary) / 2.0;

        let trace_phase = trace_propagation_phase(&trace_wavelengths(center_ht40, HT40_SUBCARRIERS));
        let lltf_trace_phase = trace_propagation_phase(&trace_wavelengths(center_primary, LLTF_SUBCARRIERS));
        let group_velocity = constants::calib_trace_group_velocity();

        let mut phase_correction = Array4::<Complex32>::zeros((board_count, ROWS, COLS, HT40_SUBCARRIERS));
        let mut lltf_phase_correction = Array4::<Complex32>::zeros((board_count, ROWS, COLS, LLTF_SUBCARRIERS));
        let mut phase_correction_flat = Array3::<Complex32>::zeros((board_count, ROWS, COLS));
        let mut timestamp_offset = Array3::<f64>::zeros((board_count, ROWS, COLS));

        if per_board {
            for (b, samples) in samples_per_board.iter().enumerate() {
                let h_ref = average_reference_ht40(samples, false)?;
                let lltf_ref = average_reference_lltf(samples, false)?;
                let ts_offset = average_timestamp_offset(samples, false);

                for r in 0..ROWS {
                    for c in 0..COLS {
                        for s in 0..HT40_SUBCARRIERS {
                            let without_prop = h_ref[[r, c, s]] * trace_phase[[r, c, s]].conj();
                            let unit = unit_conj(without_prop);
                            phase_correction[[b, r, c, s]] = unit;
                            phase_correction_flat[[b, r, c]] += unit;
                        }
                        for s in 0..LLTF_SUBCARRIERS {
                            let without_prop = lltf_ref[[r, c, s]] * lltf_trace_phase[[r, c, s]].conj();
                            lltf_phase_correction[[b, r, c, s]] = unit_conj(without_prop);
                        }
                        let trace_delay = constants::CALIB_TRACE_LENGTH_M[r][c] / group_velocity;
                        timestamp_offset[[b, r, c]] = ts_offset[[r, c]] - trace_delay;
                    }
                }
            }
        } else {
            let samples = &samples_per_board[0];
            let h_ref = average_reference_ht40(samples, true)?; // shape (B, ROWS, COLS, W)
            let lltf_ref = average_reference_lltf(samples, true)?; // shape (B, ROWS, COLS, W)
            let ts_offset = average_timestamp_offset(samples, true); // shape (B, ROWS, COLS)

            let cable_phase = match (cable_lengths_m, cable_velocity_factors) {
                (Some(lengths), Some(vfs)) => Some(cable_propagation_phase(channel_primary, channel_secondary, lengths, vfs)),
                _ => None,
            };

            for b in 0..board_count {
                for r in 0..ROWS {
                    for c in 0..COLS {
                        for s in 0..HT40_SUBCARRIERS {
                            let mut prop = trace_phase[[r, c, s]];
                            if let Some(cable) = &cable_phase {
                                prop *= cable[[b, s]];
                            }
                            let without_prop = h_ref[[b, r, c, s]] * prop.conj();
                            let unit = unit_conj(without_prop);
                            phase_correction[[b, r, c, s]] = unit;
                            phase_correction_flat[[b, r, c]] += unit;
                        }
                        for s in 0..LLTF_SUBCARRIERS {
                            let without_prop = lltf_ref[[b, r, c, s]] * lltf_trace_phase[[r, c, s]].conj();
                            lltf_phase_correction[[b, r, c, s]] = unit_conj(without_prop);
                        }
                        let trace_delay = constants::CALIB_TRACE_LENGTH_M[r][c] / group_velocity;
                        timestamp_offset[[b, r, c]] = ts_offset[[b, r, c]] - trace_delay;
                    }
                }
            }
        }

        Ok(Self {
            channel_primary,
            channel_secondary,
            phase_correction,
            lltf_phase_correction,
            phase_correction_flat,
            timestamp_offset,
        })
    }

    /// Apply the full per-subcarrier calibration to an HT40 tensor,
    /// correcting for sampling-time drift between `calibrate()` time and
    /// now (§4.5 steps 1-3).
    pub fn apply_ht40(&self, csi: &Array4<Complex32>, sensor_timestamps: &Array3<f64>) -> Array4<Complex32> {
        self.apply_correction(csi, sensor_timestamps, &self.phase_correction)
    }

    /// Same correction as [`Self::apply_ht40`], applied to the narrower
    /// L-LTF (legacy, primary-channel-only) tensor.
    pub fn apply_lltf(&self, csi: &Array4<Complex32>, sensor_timestamps: &Array3<f64>) -> Array4<Complex32> {
        self.apply_correction(csi, sensor_timestamps, &self.lltf_phase_correction)
    }

    fn apply_correction(&self, csi: &Array4<Complex32>, sensor_timestamps: &Array3<f64>, phase_correction: &Array4<Complex32>) -> Array4<Complex32> {
        let mut delta_t = sensor_timestamps - &self.timestamp_offset;
        let mean = delta_t.iter().filter(|v| v.is_finite()).sum::<f64>()
            / delta_t.iter().filter(|v| v.is_finite()).count().max(1) as f64;
        delta_t.mapv_inplace(|v| v - mean);

        let shape = csi.dim();
        let mut out = csi.clone();
        let subcarrier_center = shape.3 as isize / 2;
        for b in 0..shape.0 {
            for r in 0..shape.1 {
                for c in 0..shape.2 {
                    for s in 0..shape.3 {
                        let s_idx = s as isize - subcarrier_center;
                        let ramp = Complex32::from_polar(
                            1.0,
                            (-2.0 * std::f64::consts::PI * delta_t[[b, r, c]] * constants::WIFI_SUBCARRIER_SPACING_HZ * s_idx as f64) as f32,
                        );
                        out[[b, r, c, s]] = csi[[b, r, c, s]] * ramp * phase_correction[[b, r, c, s]];
                    }
                }
            }
        }

        // Residual sampling-time-offset clean-up.
        for b in 0..shape.0 {
            for r in 0..shape.1 {
                for c in 0..shape.2 {
                    let mut acc = Complex32::new(0.0, 0.0);
                    for s in 0..shape.3 - 1 {
                        acc += out[[b, r, c, s + 1]] * out[[b, r, c, s]].conj();
                    }
                    let residual_cycles_per_subcarrier = (acc.arg() as f64) / (2.0 * std::f64::consts::PI);
                    for s in 0..shape.3 {
                        let s_idx = s as isize - subcarrier_center;
                        let cleanup = Complex32::from_polar(1.0, (-2.0 * std::f64::consts::PI * residual_cycles_per_subcarrier * s_idx as f64) as f32);
                        out[[b, r, c, s]] *= cleanup;
                    }
                }
            }
        }

        out
    }

    /// Apply the subcarrier-summed scalar correction only.
    pub fn apply_ht40_flat(&self, csi: &Array3<Complex32>) -> Array3<Complex32> {
        csi * &self.phase_correction_flat
    }

    pub fn apply_timestamps(&self, ts: &Array3<f64>) -> Array3<f64> {
        ts - &self.timestamp_offset
    }
}

fn unit_conj(v: Complex32) -> Complex32 {
    Complex32::from_polar(1.0, -v.arg())
}

/// Subcarrier frequencies of a band of `subcarrier_count` subcarriers
/// centered on `center_freq`.
fn trace_wavelengths(center_freq: f64, subcarrier_count: usize) -> Array1<f64> {
    let group_velocity = constants::calib_trace_group_velocity();
    (0..subcarrier_count)
        .map(|s| {
            let s_idx = s as isize - subcarrier_count as isize / 2;
            let freq = center_freq + s_idx as f64 * constants::WIFI_SUBCARRIER_SPACING_HZ;
            group_velocity / freq
        })
        .collect()
}

/// `P_trace[r,c,s] = exp(-j·2π·trace_len[r,c] / λ_eff(s))`.
fn trace_propagation_phase(wavelengths: &Array1<f64>) -> Array3<Complex32> {
    let subcarrier_count = wavelengths.len();
    let mut out = Array3::<Complex32>::zeros((ROWS, COLS, subcarrier_count));
    for r in 0..ROWS {
        for c in 0..COLS {
            let trace_len = constants::CALIB_TRACE_LENGTH_M[r][c];
            for s in 0..subcarrier_count {
                let phase = -2.0 * std::f64::consts::PI * trace_len / wavelengths[s];
                out[[r, c, s]] = Complex32::from_polar(1.0, phase as f32);
            }
        }
    }
    out
}

/// `P_cable[b,s] = exp(-j·2π·cable_len[b] / λ_cable(s, vf[b]))`.
fn cable_propagation_phase(channel_primary: u8, channel_secondary: u8, cable_lengths_m: &[f64], cable_velocity_factors: &[f64]) -> Array3<Complex32> {
    let center_primary = constants::WIFI_CHANNEL1_FREQUENCY_HZ + constants::WIFI_CHANNEL_SPACING_HZ * (channel_primary as f64 - 1.0);
    let center_secondary = constants::WIFI_CHANNEL1_FREQUENCY_HZ + constants::WIFI_CHANNEL_SPACING_HZ * (channel_secondary as f64 - 1.0);
    let center_ht40 = (center_primary + center_secondary) / 2.0;

    let board_count = cable_lengths_m.len();
    let mut out = Array3::<Complex32>::zeros((board_count, HT40_SUBCARRIERS, 1));
    for b in 0..board_count {
        for s in 0..HT40_SUBCARRIERS {
            let s_idx = s as isize - HT40_SUBCARRIERS as isize / 2;
            let freq = center_ht40 + s_idx as f64 * constants::WIFI_SUBCARRIER_SPACING_HZ;
            let wavelength = constants::SPEED_OF_LIGHT / freq * cable_velocity_factors[b];
            let phase = -2.0 * std::f64::consts::PI * cable_lengths_m[b] / wavelength;
            out[[b, s, 0]] = Complex32::from_polar(1.0, phase as f32);
        }
    }
    out.index_axis(Axis(2), 0).to_owned().into_shape((board_count, HT40_SUBCARRIERS)).unwrap()
}

fn average_reference_ht40(samples: &[ReferenceSample], combined: bool) -> Result<ArrayD<Complex32>> {
    if samples.is_empty() {
        return Err(Error::CalibrationFailed { board: None });
    }
    let stacked = stack_samples(samples.iter().map(|s| &s.ht40));
    Ok(if combined {
        numeric::csi_interp_iterative_by_array(&stacked, None, 10)
    } else {
        numeric::csi_interp_iterative(&stacked, None, 10)
    })
}

fn average_reference_lltf(samples: &[ReferenceSample], combined: bool) -> Result<ArrayD<Complex32>> {
    if samples.is_empty() {
        return Err(Error::CalibrationFailed { board: None });
    }
    let stacked = stack_samples(samples.iter().map(|s| &s.lltf));
    Ok(if combined {
        numeric::csi_interp_iterative_by_array(&stacked, None, 10)
    } else {
        numeric::csi_interp_iterative(&stacked, None, 10)
    })
}

fn average_timestamp_offset(samples: &[ReferenceSample], combined: bool) -> ArrayD<f64> {
    let rest_shape = samples[0].timestamp_offset.shape().to_vec();
    let mut out = ArrayD::<f64>::zeros(IxDyn(&rest_shape));
    for s in samples {
        out += &s.timestamp_offset;
    }
    out.mapv_inplace(|v| v / samples.len() as f64);
    let _ = combined; // shape is identical either way; only the caller's tensor rank differs
    out
}

fn stack_samples<'a>(tensors: impl Iterator<Item = &'a ArrayD<Complex32>>) -> ArrayD<Complex32> {
    let views: Vec<_> = tensors.map(|t| t.view()).collect();
    ndarray::stack(Axis(0), &views).expect("reference samples must share a shape")
}

//! Pure array functions shared by calibration and downstream consumers
//! (§4.7): iterative phase-coherent averaging, HT40 gap interpolation, and
//! first-peak time alignment. None of these carry state.

use ndarray::{Array1, Array3, Array4, ArrayD, ArrayView1, ArrayView2, Axis, IxDyn};
use num_complex::Complex32;
use num_traits::Zero;

/// Iterative phase-coherent average of `csi`'s leading axis (`n` datapoints
/// of identical shape). Minimizes `Σ_n w_n · ‖x_n − e^{jφ_n}·w‖²` by
/// alternating between solving for `w` given the phases and for the phases
/// given `w`.
///
/// Idempotent w.r.t. a global phase rotation applied to every input: see
/// the `fixed_point_with_unit_modulus_inputs` test.
pub fn csi_interp_iterative(csi: &ArrayD<Complex32>, weights: Option<&Array1<f32>>, iterations: usize) -> ArrayD<Complex32> {
    let shape = csi.shape().to_vec();
    let n = shape[0];
    let rest_shape = shape[1..].to_vec();
    let flat_dim: usize = rest_shape.iter().product();

    let flat = csi
        .view()
        .into_shape((n, flat_dim))
        .expect("csi_interp_iterative: leading axis must hold the datapoints");

    let w = csi_interp_iterative_flat(flat, weights, iterations);
    w.into_shape(IxDyn(&rest_shape)).expect("reshape back to input shape")
}

/// Same algorithm as [`csi_interp_iterative`], but assumes axis 1 of `csi`
/// (shape `(n, b, ...)`) is an antenna-array dimension and runs the
/// averager independently for each `b`.
pub fn csi_interp_iterative_by_array(csi: &ArrayD<Complex32>, weights: Option<&Array1<f32>>, iterations: usize) -> ArrayD<Complex32> {
    let shape = csi.shape().to_vec();
    let b_count = shape[1];
    let rest_shape = shape[2..].to_vec();

    let mut out_shape = vec![b_count];
    out_shape.extend(rest_shape.iter());
    let mut out = ArrayD::<Complex32>::zeros(IxDyn(&out_shape));

    for b in 0..b_count {
        let slice = csi.index_axis(Axis(1), b).to_owned();
        let averaged = csi_interp_iterative(&slice, weights, iterations);
        out.index_axis_mut(Axis(0), b).assign(&averaged);
    }

    out
}

/// Core of [`csi_interp_iterative`] on an already-flattened `(n, flat_dim)`
/// view, per the algorithm in §4.7: `w ← Σ_n w_n·e^{-jφ_n}·x_n`, then
/// `φ_n ← angle(⟨w, x_n⟩)`, repeated `iterations` times (default 10 at the
/// call site).
fn csi_interp_iterative_flat(csi: ArrayView2<Complex32>, weights: Option<&Array1<f32>>, iterations: usize) -> Array1<Complex32> {
    let n = csi.shape()[0];
    let flat_dim = csi.shape()[1];

    let owned_weights;
    let w_n: &Array1<f32> = match weights {
        Some(w) => w,
        None => {
            owned_weights = Array1::from_elem(n, 1.0 / n as f32);
            &owned_weights
        }
    };

    let mut phi = Array1::<f32>::zeros(n);
    let mut w = Array1::<Complex32>::from_elem(flat_dim, Complex32::zero());

    for _ in 0..iterations {
        w.fill(Complex32::zero());
        for i in 0..n {
            let coeff = Complex32::from_polar(w_n[i], -phi[i]);
            let row = csi.row(i);
            for (acc, &x) in w.iter_mut().zip(row.iter()) {
                *acc += coeff * x;
            }
        }

        for i in 0..n {
            let row = csi.row(i);
            let dot: Complex32 = w.iter().zip(row.iter()).map(|(wa, xa)| wa.conj() * xa).sum();
            phi[i] = dot.arg();
        }
    }

    w
}

/// Principal-eigenvector interpolation: finds the dominant eigenvector of
/// the weighted outer-product covariance of `csi`'s leading axis via power
/// iteration (the covariance is Hermitian PSD, so this converges to the
/// eigenvector with the largest eigenvalue).
pub fn csi_interp_eigenvec(csi: &ArrayD<Complex32>, weights: Option<&Array1<f32>>) -> ArrayD<Complex32> {
    let shape = csi.shape().to_vec();
    let n = shape[0];
    let rest_shape = shape[1..].to_vec();
    let flat_dim: usize = rest_shape.iter().product();

    let flat = csi
        .view()
        .into_shape((n, flat_dim))
        .expect("csi_interp_eigenvec: leading axis must hold the datapoints");

    let owned_weights;
    let w_n: &Array1<f32> = match weights {
        Some(w) => w,
        None => {
            owned_weights = Array1::from_elem(n, 1.0 / n as f32);
            &owned_weights
        }
    };

    // R = Σ_n w_n · x_n x_n^H, represented implicitly: power iteration only
    // ever needs R·v = Σ_n w_n · x_n · ⟨x_n, v⟩.
    let mut v = Array1::<Complex32>::from_elem(flat_dim, Complex32::new(1.0, 0.0));
    for _ in 0..64 {
        let mut rv = Array1::<Complex32>::from_elem(flat_dim, Complex32::zero());
        for i in 0..n {
            let row = flat.row(i);
            let inner: Complex32 = row.iter().zip(v.iter()).map(|(x, vv)| x.conj() * vv).sum();
            let coeff = w_n[i] * inner;
            for (acc, &x) in rv.iter_mut().zip(row.iter()) {
                *acc += coeff * x;
            }
        }
        let norm = rv.iter().map(|c| c.norm_sqr()).sum::<f32>().sqrt();
        if norm > 0.0 {
            rv.mapv_inplace(|c| c / norm);
        }
        v = rv;
    }

    v.into_shape(IxDyn(&rest_shape)).expect("reshape back to input shape")
}

/// Linearly interpolate the `HT40_GAP_SUBCARRIERS` missing subcarriers
/// between the two HT-LTF halves, in place, treating them as complex.
pub fn interpolate_ht40_gap(csi_ht40: &mut Array4<Complex32>) {
    let half = espargos_wire::HTLTF_HALF_SUBCARRIERS;
    let gap = espargos_wire::HT40_GAP_SUBCARRIERS;
    let index_left = half - 1;
    let index_right = half + gap;

    let shape = csi_ht40.shape();
    let (b, r, c) = (shape[0], shape[1], shape[2]);
    for bi in 0..b {
        for ri in 0..r {
            for ci in 0..c {
                let left = csi_ht40[[bi, ri, ci, index_left]];
                let right = csi_ht40[[bi, ri, ci, index_right]];
                for idx in (index_left + 1)..index_right {
                    let t = (idx - index_left) as f32 / (index_right - index_left) as f32;
                    csi_ht40[[bi, ri, ci, idx]] = right * t + left * (1.0 - t);
                }
            }
        }
    }
}

/// For each CSI datapoint `(datapoints, arrays, rows, cols, subcarriers)`,
/// estimate the first channel-impulse-response peak among `search_resolution`
/// candidate fractional-sample shifts in `[-max_delay_taps, 0]` and shift
/// that datapoint so the peak lands at delay 0. Each datapoint may pick a
/// different shift.
pub fn shift_to_firstpeak(
    csi_datapoints: &ndarray::Array5<Complex32>,
    max_delay_taps: f32,
    search_resolution: usize,
    peak_threshold: f32,
) -> ndarray::Array5<Complex32> {
    let shift_vectors = build_shift_vectors(csi_datapoints.shape()[4], max_delay_taps, search_resolution);

    let shape = csi_datapoints.dim();
    let mut out = csi_datapoints.clone();
    for l in 0..shape.0 {
        for b in 0..shape.1 {
            for r in 0..shape.2 {
                for m in 0..shape.3 {
                    let h = csi_datapoints.slice(ndarray::s![l, b, r, m, ..]);
                    let (shift_idx, _) = best_shift(&h, &shift_vectors, peak_threshold);
                    let ramp = shift_vectors.row(shift_idx);
                    let mut out_slice = out.slice_mut(ndarray::s![l, b, r, m, ..]);
                    for (o, (&hv, &rv)) in out_slice.iter_mut().zip(h.iter().zip(ramp.iter())) {
                        *o = hv * rv;
                    }
                }
            }
        }
    }
    out
}

/// Same as [`shift_to_firstpeak`], but picks a single shift shared by every
/// antenna in a datapoint (requires synchronized CSI across the array).
pub fn shift_to_firstpeak_sync(
    csi_datapoints: &ndarray::Array5<Complex32>,
    max_delay_taps: f32,
    search_resolution: usize,
    peak_threshold: f32,
) -> ndarray::Array5<Complex32> {
    let shift_vectors = build_shift_vectors(csi_datapoints.shape()[4], max_delay_taps, search_resolution);
    let shape = csi_datapoints.dim();

    let mut out = csi_datapoints.clone();
    for l in 0..shape.0 {
        let mut powers_by_delay = vec![0f32; search_resolution];
        for d in 0..search_resolution {
            let ramp = shift_vectors.row(d);
            let mut power = 0f32;
            for b in 0..shape.1 {
                for r in 0..shape.2 {
                    for m in 0..shape.3 {
                        let h = csi_datapoints.slice(ndarray::s![l, b, r, m, ..]);
                        let acc: Complex32 = h.iter().zip(ramp.iter()).map(|(&hv, &rv)| hv * rv).sum();
                        power += acc.norm_sqr();
                    }
                }
            }
            powers_by_delay[d] = power;
        }

        let max_power = powers_by_delay.iter().cloned().fold(0f32, f32::max);
        let shift_idx = powers_by_delay
            .iter()
            .position(|&p| p > peak_threshold * max_power)
            .unwrap_or(search_resolution - 1);
        let ramp = shift_vectors.row(shift_idx);

        for b in 0..shape.1 {
            for r in 0..shape.2 {
                for m in 0..shape.3 {
                    let h = csi_datapoints.slice(ndarray::s![l, b, r, m, ..]);
                    let mut out_slice = out.slice_mut(ndarray::s![l, b, r, m, ..]);
                    for (o, (&hv, &rv)) in out_slice.iter_mut().zip(h.iter().zip(ramp.iter())) {
                        *o = hv * rv;
                    }
                }
            }
        }
    }
    out
}

fn build_shift_vectors(subcarriers: usize, max_delay_taps: f32, search_resolution: usize) -> ndarray::Array2<Complex32> {
    let subcarrier_range: Vec<f32> = (0..subcarriers)
        .map(|s| (s as isize - subcarriers as isize / 2) as f32 + 1.0)
        .collect();

    let mut out = ndarray::Array2::<Complex32>::zeros((search_resolution, subcarriers));
    for d in 0..search_resolution {
        let shift = if search_resolution <= 1 {
            0.0
        } else {
            -max_delay_taps + max_delay_taps * (d as f32) / (search_resolution as f32 - 1.0)
        };
        for (s, &sc) in subcarrier_range.iter().enumerate() {
            let phase = 2.0 * std::f32::consts::PI * sc / subcarriers as f32 * shift;
            out[[d, s]] = Complex32::from_polar(1.0, phase);
        }
    }
    out
}

fn best_shift(h: &ArrayView1<Complex32>, shift_vectors: &ndarray::Array2<Complex32>, peak_threshold: f32) -> (usize, f32) {
    let resolution = shift_vectors.shape()[0];
    let mut powers = vec![0f32; resolution];
    for d in 0..resolution {
        let ramp = shift_vectors.row(d);
        let acc: Complex32 = h.iter().zip(ramp.iter()).map(|(&hv, &rv)| hv * rv).sum();
        powers[d] = acc.norm_sqr();
    }
    let max_power = powers.iter().cloned().fold(0f32, f32::max);
    let idx = powers.iter().position(|&p| p > peak_threshold * max_power).unwrap_or(resolution - 1);
    (idx, max_power)
}

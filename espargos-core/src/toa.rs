//! Root-MUSIC time-of-arrival estimation (§4.8): forward-backward
//! smoothed subspace decomposition, Rissanen MDL source-count selection,
//! and companion-matrix polynomial rooting.

use ndarray::{s, Array2, Array3, Array5};
use ndarray_linalg::{Eig, Eigh, UPLO};
use num_complex::{Complex32, Complex64};

use crate::constants::WIFI_SUBCARRIER_SPACING_HZ;

pub const DEFAULT_MAX_SOURCE_COUNT: usize = 2;
pub const DEFAULT_CHUNK_SIZE: usize = 36;
const MDL_SOURCE_CAP: usize = 10;

/// Estimate per-antenna LoS-path time of arrival.
///
/// `csi_fdomain` has shape `(datapoints, arrays, rows, cols, subcarriers)`.
/// Returns delays in seconds, shape `(arrays, rows, cols)`; when
/// `per_board_average` is set every `(row, col)` within an array holds the
/// same, array-averaged delay.
pub fn estimate_toas_rootmusic(
    csi_fdomain: &Array5<Complex32>,
    max_source_count: usize,
    chunk_size: usize,
    per_board_average: bool,
) -> Array3<f64> {
    let (datapoints, arrays, rows, cols, subcarriers) = csi_fdomain.dim();
    let chunk_count = subcarriers / chunk_size;
    assert!(chunk_count > 0, "chunk_size must not exceed the subcarrier count");
    let padding = (subcarriers - chunk_count * chunk_size) / 2;

    let covariances = covariance_matrices(csi_fdomain, chunk_size, chunk_count, padding, per_board_average);
    let measurement_count = chunk_count * datapoints;

    let mut toas = Array3::<f64>::zeros((arrays, rows, cols));
    for a in 0..arrays {
        let (row_range, col_range) = if per_board_average { (0..1, 0..1) } else { (0..rows, 0..cols) };
        for r in row_range.clone() {
            for c in col_range.clone() {
                let r_fb = forward_backward_smooth(&covariances[[a, r, c]]);
                let delay = estimate_delay(&r_fb, measurement_count, max_source_count);

                if per_board_average {
                    for rr in 0..rows {
                        for cc in 0..cols {
                            toas[[a, rr, cc]] = delay;
                        }
                    }
                } else {
                    toas[[a, r, c]] = delay;
                }
            }
        }
    }

    toas
}

/// `R[a,r,c]`, each a `chunk_size x chunk_size` Hermitian covariance
/// estimated from `chunk_count` frequency chunks (and, if
/// `per_board_average`, pooled over `rows`/`cols` too).
fn covariance_matrices(
    csi_fdomain: &Array5<Complex32>,
    chunk_size: usize,
    chunk_count: usize,
    padding: usize,
    per_board_average: bool,
) -> ndarray::Array3<Array2<Complex64>> {
    let (datapoints, arrays, rows, cols, _subcarriers) = csi_fdomain.dim();

    let extract_chunk = |d: usize, a: usize, r: usize, c: usize, k: usize| -> ndarray::ArrayView1<Complex32> {
        let start = padding + k * chunk_size;
        csi_fdomain.slice(s![d, a, r, c, start..start + chunk_size])
    };

    let mut out = ndarray::Array3::from_shape_fn((arrays, if per_board_average { 1 } else { rows }, if per_board_average { 1 } else { cols }), |_| {
        Array2::<Complex64>::zeros((chunk_size, chunk_size))
    });

    for a in 0..arrays {
        if per_board_average {
            let mut acc = Array2::<Complex64>::zeros((chunk_size, chunk_size));
            let mut count = 0usize;
            for d in 0..datapoints {
                for r in 0..rows {
                    for c in 0..cols {
                        for k in 0..chunk_count {
                            accumulate_outer_product(&mut acc, &extract_chunk(d, a, r, c, k));
                            count += 1;
                        }
                    }
                }
            }
            acc.mapv_inplace(|v| v / count as f64);
            out[[a, 0, 0]] = acc;
        } else {
            for r in 0..rows {
                for c in 0..cols {
                    let mut acc = Array2::<Complex64>::zeros((chunk_size, chunk_size));
                    let mut count = 0usize;
                    for d in 0..datapoints {
                        for k in 0..chunk_count {
                            accumulate_outer_product(&mut acc, &extract_chunk(d, a, r, c, k));
                            count += 1;
                        }
                    }
                    acc.mapv_inplace(|v| v / count as f64);
                    out[[a, r, c]] = acc;
                }
            }
        }
    }

    out
}

fn accumulate_outer_product(acc: &mut Array2<Complex64>, chunk: &ndarray::ArrayView1<Complex32>) {
    let n = chunk.len();
    for i in 0..n {
        let xi = Complex64::new(chunk[i].re as f64, chunk[i].im as f64);
        for j in 0..n {
            let xj = Complex64::new(chunk[j].re as f64, chunk[j].im as f64);
            acc[[i, j]] += xi * xj.conj();
        }
    }
}

/// `(R + J·conj(R)·J) / 2`, the forward-backward correlation matrix
/// (`J` reverses both row and column order).
fn forward_backward_smooth(r: &Array2<Complex64>) -> Array2<Complex64> {
    let n = r.shape()[0];
    let mut out = Array2::<Complex64>::zeros((n, n));
    for i in 0..n {
        for j in 0..n {
            out[[i, j]] = (r[[i, j]] + r[[n - 1 - i, n - 1 - j]].conj()) / 2.0;
        }
    }
    out
}

/// Rissanen MDL source-count selection followed by root-MUSIC delay
/// estimation for one antenna's smoothed covariance matrix.
fn estimate_delay(r_fb: &Array2<Complex64>, measurement_count: usize, max_source_count: usize) -> f64 {
    let n = r_fb.shape()[0];
    let (eigvals, eigvecs) = r_fb
        .clone()
        .eigh(UPLO::Upper)
        .expect("covariance matrix must be Hermitian");

    let mut order: Vec<usize> = (0..n).collect();
    order.sort_by(|&i, &j| eigvals[j].partial_cmp(&eigvals[i]).unwrap());
    let ev_sorted: Vec<f64> = order.iter().map(|&i| eigvals[i]).collect();

    let source_count = mdl_source_count(&ev_sorted, measurement_count).min(max_source_count);

    let mut qn = Array2::<Complex64>::zeros((n, n - source_count));
    for (col, &src) in order[source_count..].iter().enumerate() {
        qn.column_mut(col).assign(&eigvecs.column(src));
    }
    let c = qn.dot(&qn.t().mapv(|v| v.conj()));

    let coeffs = polynomial_coefficients(&c);
    let roots = companion_matrix_roots(&coeffs);

    let mut candidates: Vec<(f64, f64)> = roots
        .iter()
        .filter(|root| root.norm() < 1.0)
        .map(|root| {
            let power = 1.0 / (1.0 - root.norm());
            let delay = -root.arg() / (2.0 * std::f64::consts::PI) / WIFI_SUBCARRIER_SPACING_HZ;
            (power, delay)
        })
        .collect();

    candidates.sort_by(|a, b| b.0.partial_cmp(&a.0).unwrap());
    candidates.truncate(source_count.min(2).max(1));

    let earliest = candidates.iter().map(|&(_, delay)| delay).fold(f64::INFINITY, f64::min);
    if earliest.is_finite() {
        earliest
    } else {
        0.0
    }
}

fn mdl_source_count(eigenvalues_desc: &[f64], measurement_count: usize) -> usize {
    let l = MDL_SOURCE_CAP.min(eigenvalues_desc.len());
    let ev: Vec<f64> = eigenvalues_desc[..l].to_vec();
    let m = measurement_count as f64;

    let mut mdl = vec![0f64; l];
    for k in 0..l {
        let tail = &ev[k..l];
        let count = (l - k) as f64;
        let log_mean_of_logs = tail.iter().map(|&v| (v + 1e-6).ln()).sum::<f64>() / count;
        let mean = tail.iter().map(|&v| v + 1e-6).sum::<f64>() / count;
        mdl[k] = -m * (l - k) as f64 * (log_mean_of_logs - mean.ln());
        mdl[k] += 0.25 * k as f64 * (2.0 * l as f64 - k as f64 + 1.0) * m.ln();
    }

    mdl.iter()
        .enumerate()
        .min_by(|(_, a), (_, b)| a.partial_cmp(b).unwrap())
        .map(|(k, _)| k)
        .unwrap_or(0)
}

/// `coeffs[d] = trace(C, offset = d+1)` for `d` in `0..n-1`, mirrored and
/// conjugated into the full `np.roots`-style polynomial coefficient list
/// `[rev(coeffs), trace(C), conj(coeffs)]` (highest degree first).
fn polynomial_coefficients(c: &Array2<Complex64>) -> Vec<Complex64> {
    let n = c.shape()[0];
    let off_diag_traces: Vec<Complex64> = (1..n)
        .map(|offset| (0..n - offset).map(|i| c[[i, i + offset]]).sum())
        .collect();

    let trace0: Complex64 = (0..n).map(|i| c[[i, i]]).sum();

    let mut coeffs = Vec::with_capacity(2 * n - 1);
    coeffs.extend(off_diag_traces.iter().rev().cloned());
    coeffs.push(trace0);
    coeffs.extend(off_diag_traces.iter().map(|v| v.conj()));
    coeffs
}

/// Roots of the polynomial with coefficients `coeffs` (highest degree
/// first), found as the eigenvalues of its companion matrix.
fn companion_matrix_roots(coeffs: &[Complex64]) -> Vec<Complex64> {
    let degree = coeffs.len() - 1;
    if degree == 0 {
        return Vec::new();
    }

    let leading = coeffs[0];
    let mut companion = Array2::<Complex64>::zeros((degree, degree));
    for j in 0..degree {
        companion[[0, j]] = -coeffs[j + 1] / leading;
    }
    for i in 1..degree {
        companion[[i, i - 1]] = Complex64::new(1.0, 0.0);
    }

    let (eigvals, _) = companion.eig().expect("companion matrix eigendecomposition failed");
    eigvals.to_vec()
}

//! S6: first-peak alignment of a synthetic single-tap channel recovers the
//! tap position to within a handful of search-resolution steps. Uses a
//! threshold close to 1 so the selected candidate tracks the coherent-sum
//! peak rather than the onset of the main lobe.

use espargos_core::numeric::shift_to_firstpeak;
use ndarray::Array5;
use num_complex::Complex32;

const SUBCARRIERS: usize = 64;

/// Frequency-domain response of a single tap delayed by `shift` samples.
fn single_tap_response(shift: f32) -> Vec<Complex32> {
    (0..SUBCARRIERS)
        .map(|s| {
            let sc = (s as isize - SUBCARRIERS as isize / 2) as f32 + 1.0;
            let phase = -2.0 * std::f32::consts::PI * sc / SUBCARRIERS as f32 * shift;
            Complex32::from_polar(1.0, phase)
        })
        .collect()
}

#[test]
fn recovers_fractional_shift_within_a_few_resolution_steps() {
    let true_shift = -1.7f32;
    let max_delay_taps = 4.0f32;
    let search_resolution = 64usize;
    let step = max_delay_taps / (search_resolution as f32 - 1.0);

    let mut csi = Array5::<Complex32>::zeros((1, 1, 1, 1, SUBCARRIERS));
    for (s, &v) in single_tap_response(true_shift).iter().enumerate() {
        csi[[0, 0, 0, 0, s]] = v;
    }

    // A near-1 threshold means the first candidate clearing it is the one
    // nearest the coherent-sum maximum, not an early rising-edge crossing.
    let aligned = shift_to_firstpeak(&csi, max_delay_taps, search_resolution, 0.99);

    // Once aligned to (close to) the true delay, residual phase across
    // subcarriers should be small: bound it by a few grid steps' worth of
    // residual ramp rather than demanding an exact match.
    let reference = aligned[[0, 0, 0, 0, SUBCARRIERS / 2]];
    let tolerance_samples = 3.0 * step;
    for s in 0..SUBCARRIERS {
        let phase_diff = (aligned[[0, 0, 0, 0, s]] * reference.conj()).arg();
        let sc = (s as isize - SUBCARRIERS as isize / 2) as f32 + 1.0;
        let max_phase_diff = 2.0 * std::f32::consts::PI * sc.abs() / SUBCARRIERS as f32 * tolerance_samples + 1e-3;
        assert!(phase_diff.abs() <= max_phase_diff, "subcarrier {s}: phase_diff={phase_diff}, bound={max_phase_diff}");
    }
}

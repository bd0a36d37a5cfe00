//! S1: calibration fails with no complete clusters, and succeeds with a
//! unit-modulus phase tensor once every board has complete reference data.

use espargos_core::calibration::{Calibration, ReferenceSample};
use espargos_core::error::Error;
use espargos_wire::{COLS, HT40_SUBCARRIERS, LLTF_SUBCARRIERS, ROWS};
use ndarray::{Array3, ArrayD};
use num_complex::Complex32;

fn reference_sample(phase: f32) -> ReferenceSample {
    let ht40 = ArrayD::from_shape_fn(vec![ROWS, COLS, HT40_SUBCARRIERS], |_| Complex32::from_polar(1.0, phase));
    let lltf = ArrayD::from_shape_fn(vec![ROWS, COLS, LLTF_SUBCARRIERS], |_| Complex32::from_polar(1.0, phase));
    let timestamp_offset = ArrayD::from_elem(vec![ROWS, COLS], 0.0);
    ReferenceSample { ht40, lltf, timestamp_offset }
}

#[test]
fn calibrate_with_no_samples_fails() {
    let samples_per_board: Vec<Vec<ReferenceSample>> = vec![vec![], vec![]];
    let result = Calibration::derive(&samples_per_board, 6, 10, true, None, None);
    assert!(matches!(result, Err(Error::CalibrationFailed { .. })));
}

#[test]
fn calibrate_per_board_with_complete_clusters_yields_unit_modulus_phase() {
    let samples_per_board: Vec<Vec<ReferenceSample>> = (0..2)
        .map(|_| (0..4).map(|k| reference_sample(0.1 * k as f32)).collect())
        .collect();

    let calibration = Calibration::derive(&samples_per_board, 6, 10, true, None, None).expect("derive should succeed");

    let empty_ts = Array3::<f64>::zeros((2, ROWS, COLS));
    let csi = ndarray::Array4::<Complex32>::from_elem((2, ROWS, COLS, HT40_SUBCARRIERS), Complex32::new(1.0, 0.0));
    let corrected = calibration.apply_ht40(&csi, &empty_ts);

    // apply_ht40 folds the unit-modulus phase correction onto unit-magnitude
    // input: every corrected sample should itself have magnitude 1.
    for v in corrected.iter() {
        assert!((v.norm() - 1.0).abs() < 1e-5, "expected unit modulus, got {}", v.norm());
    }
}

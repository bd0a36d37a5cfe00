//! Configuration of a combined sensor array (§6): a logical layout of
//! boards, each tagged by network address and feeder-cable metadata. This
//! crate only defines the shape consumed by calibration; parsing it out of
//! a YAML file is an application-level concern, same split as the teacher's
//! `state.rs` structs versus `persistence.rs`'s file I/O.

use serde::{Deserialize, Serialize};

/// One physical board's placement and cabling within a combined array.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BoardConfig {
    /// `host:port` or bare hostname of the controller running this board.
    pub host: String,
    /// Feeder cable length from the combining point to this board, meters.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cable_length_m: Option<f64>,
    /// Cable velocity factor, in `(0, 1]`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cable_velocity_factor: Option<f64>,
}

/// A logical `rows_a × cols_a` layout of sensors tagged `"board.row.col"`,
/// each entry naming a board index into `boards` plus its antenna row/col
/// within that board.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CombinedArrayConfig {
    pub boards: Vec<BoardConfig>,
    /// Row-major indexing matrix: `layout[a_row][a_col] = (board, row, col)`.
    /// Consumed by post-processing for logical array geometry, not by
    /// calibration itself.
    pub layout: Vec<Vec<(usize, usize, usize)>>,
}

impl CombinedArrayConfig {
    pub fn board_count(&self) -> usize {
        self.boards.len()
    }

    /// Per-board cable lengths, if every board has one configured.
    pub fn cable_lengths_m(&self) -> Option<Vec<f64>> {
        self.boards.iter().map(|b| b.cable_length_m).collect()
    }

    /// Per-board cable velocity factors, if every board has one configured.
    pub fn cable_velocity_factors(&self) -> Option<Vec<f64>> {
        self.boards.iter().map(|b| b.cable_velocity_factor).collect()
    }
}

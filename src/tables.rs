//! Scan tables: the immutable, precomputed mapping from scan-map pixel
//! indices to LPX cell indices, plus the fovea's inner-cell centroids.
//!
//! A scan-tables file is loaded once per process and then shared by
//! reference across every scan; nothing in `ScanTables` is mutated after
//! `load` returns.
//!
//! # Binary layout
//!
//! Header: seven little-endian `i32`s, in order:
//! `total_length_in_int32s, map_width, spiral_period_int, outer_length,
//! inner_length, last_fovea_index, last_cell_index`.
//!
//! Followed by, contiguously:
//! - `outer_length` × `i32` — `outer_pixel_index`
//! - `outer_length` × `i32` — `outer_pixel_cell_idx`
//! - `inner_length` × `(i32, i32)` — `inner_cells` (x, y)

use std::fs::File;
use std::io::{BufReader, Read};
use std::path::Path;

use byteorder::{LittleEndian, ReadBytesExt};

use crate::error::{AppResult, LpxError};

/// An `(x, y)` centroid in scan-map coordinates, used to populate a fovea
/// cell from a single source pixel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InnerCell {
    pub x: i32,
    pub y: i32,
}

/// Immutable, process-wide scan tables.
#[derive(Debug)]
pub struct ScanTables {
    map_width: i32,
    spiral_period: f64,
    last_fovea_index: usize,
    last_cell_index: usize,
    inner_cells: Vec<InnerCell>,
    outer_pixel_index: Vec<i32>,
    outer_pixel_cell_idx: Vec<u32>,
}

impl ScanTables {
    /// Side length of the square scan map.
    #[must_use]
    pub fn map_width(&self) -> i32 {
        self.map_width
    }

    /// Hexagon-cells-per-revolution of the log-spiral.
    #[must_use]
    pub fn spiral_period(&self) -> f64 {
        self.spiral_period
    }

    /// Number of distinct LPX cells (`last_cell_index + 1`).
    #[must_use]
    pub fn total_cells(&self) -> usize {
        self.last_cell_index + 1
    }

    /// Largest cell index belonging to the fovea.
    #[must_use]
    pub fn last_fovea_index(&self) -> usize {
        self.last_fovea_index
    }

    /// Ordered `(x, y)` centroids used to populate fovea cells.
    #[must_use]
    pub fn inner_cells(&self) -> &[InnerCell] {
        &self.inner_cells
    }

    /// Direct, unsearched lookup into `outer_pixel_cell_idx`, used by the
    /// fovea-fill phase for inner-cell indices beyond `last_fovea_index`
    /// (see `scan::Phase A`, step 3).
    #[must_use]
    pub fn outer_cell_at(&self, i: usize) -> Option<usize> {
        self.outer_pixel_cell_idx.get(i).map(|&v| v as usize)
    }

    /// The cell that collects scan-map pixel index `p`: binary search for
    /// the largest `j` with `outer_pixel_index[j] <= p`, returning
    /// `outer_pixel_cell_idx[j]`. Falls back to `last_fovea_index` if `p`
    /// precedes every entry.
    #[must_use]
    pub fn cell_of(&self, p: i64) -> usize {
        match self.outer_pixel_index.partition_point(|&idx| i64::from(idx) <= p) {
            0 => self.last_fovea_index,
            j => self.outer_pixel_cell_idx[j - 1] as usize,
        }
    }

    /// Load scan tables from a binary file. See module docs for layout.
    ///
    /// # Errors
    ///
    /// Returns `LpxError::Io` on a read failure, or
    /// `LpxError::InvalidScanTables` if any structural or range
    /// invariant is violated.
    pub fn load<P: AsRef<Path>>(path: P) -> AppResult<Self> {
        let file = File::open(path)?;
        let mut r = BufReader::new(file);

        let total_length_in_int32s = r.read_i32::<LittleEndian>()?;
        let map_width = r.read_i32::<LittleEndian>()?;
        let spiral_period_int = r.read_i32::<LittleEndian>()?;
        let outer_length = r.read_i32::<LittleEndian>()?;
        let inner_length = r.read_i32::<LittleEndian>()?;
        let last_fovea_index = r.read_i32::<LittleEndian>()?;
        let last_cell_index = r.read_i32::<LittleEndian>()?;

        if map_width <= 0 {
            return Err(LpxError::InvalidScanTables(
                "map_width must be positive".into(),
            ));
        }
        if outer_length < 0 || inner_length < 0 {
            return Err(LpxError::InvalidScanTables(
                "array lengths must be non-negative".into(),
            ));
        }

        let spiral_period = f64::from(spiral_period_int) + 0.5;
        if !(0.1 < spiral_period && spiral_period < 1000.0) {
            return Err(LpxError::InvalidScanTables(format!(
                "spiral_period {spiral_period} out of range (0.1, 1000)"
            )));
        }

        if !(0 < last_fovea_index && last_fovea_index < last_cell_index) {
            return Err(LpxError::InvalidScanTables(format!(
                "expected 0 < last_fovea_index ({last_fovea_index}) < last_cell_index ({last_cell_index})"
            )));
        }

        let outer_length = outer_length as usize;
        let inner_length = inner_length as usize;
        let total_cells = last_cell_index as usize + 1;

        let mut outer_pixel_index = Vec::with_capacity(outer_length);
        for _ in 0..outer_length {
            outer_pixel_index.push(r.read_i32::<LittleEndian>()?);
        }
        if !outer_pixel_index.windows(2).all(|w| w[0] <= w[1]) {
            return Err(LpxError::InvalidScanTables(
                "outer_pixel_index is not sorted".into(),
            ));
        }

        let mut outer_pixel_cell_idx = Vec::with_capacity(outer_length);
        for _ in 0..outer_length {
            let idx = r.read_i32::<LittleEndian>()?;
            if idx < 0 || idx as usize >= total_cells {
                return Err(LpxError::InvalidScanTables(format!(
                    "cell index {idx} out of range [0, {total_cells})"
                )));
            }
            outer_pixel_cell_idx.push(idx as u32);
        }

        let mut inner_cells = Vec::with_capacity(inner_length);
        for _ in 0..inner_length {
            let x = r.read_i32::<LittleEndian>()?;
            let y = r.read_i32::<LittleEndian>()?;
            inner_cells.push(InnerCell { x, y });
        }

        // Best-effort sanity check; a mismatch here indicates truncation
        // or a header that lies about array lengths, either of which we
        // would already have failed to read above. Checked anyway since
        // `total_length_in_int32s` is otherwise unused.
        let expected_ints = 7 + 2 * outer_length + 2 * inner_length;
        if total_length_in_int32s >= 0 && total_length_in_int32s as usize != expected_ints {
            return Err(LpxError::InvalidScanTables(format!(
                "header promises {total_length_in_int32s} int32s, arrays imply {expected_ints}"
            )));
        }

        let mut trailing = [0u8; 1];
        if r.read(&mut trailing)? != 0 {
            return Err(LpxError::InvalidScanTables(
                "trailing bytes after declared arrays".into(),
            ));
        }

        Ok(ScanTables {
            map_width,
            spiral_period,
            last_fovea_index: last_fovea_index as usize,
            last_cell_index: last_cell_index as usize,
            inner_cells,
            outer_pixel_index,
            outer_pixel_cell_idx,
        })
    }
}


#[cfg(test)]
mod tests {
    use super::test_support::*;
    use super::*;

    #[test]
    fn loads_a_well_formed_table() {
        let bytes = make_tables_bytes(64, 63, 5, 4);
        let file = write_tables_file(&bytes);
        let tables = ScanTables::load(file.path()).unwrap();

        assert_eq!(tables.map_width(), 64);
        assert!((tables.spiral_period() - 63.5).abs() < 1e-9);
        assert_eq!(tables.total_cells(), 9);
        assert_eq!(tables.last_fovea_index(), 4);
        assert_eq!(tables.inner_cells().len(), 5);
    }

    #[test]
    fn cell_of_falls_back_to_fovea_before_first_entry() {
        let bytes = make_tables_bytes(64, 63, 5, 4);
        let file = write_tables_file(&bytes);
        let tables = ScanTables::load(file.path()).unwrap();

        assert_eq!(tables.cell_of(0), tables.last_fovea_index());
    }

    #[test]
    fn cell_of_finds_exact_and_interpolated_entries() {
        let bytes = make_tables_bytes(64, 63, 5, 4);
        let file = write_tables_file(&bytes);
        let tables = ScanTables::load(file.path()).unwrap();

        // First peripheral run starts at pixel index `map_width` (64).
        assert_eq!(tables.cell_of(64), 5);
        // Still within the first run's reach (no next entry until 128).
        assert_eq!(tables.cell_of(100), 5);
        assert_eq!(tables.cell_of(128), 6);
    }

    #[test]
    fn rejects_out_of_range_spiral_period() {
        let bytes = make_tables_bytes(64, 2000, 5, 4);
        let file = write_tables_file(&bytes);
        assert!(matches!(
            ScanTables::load(file.path()),
            Err(LpxError::InvalidScanTables(_))
        ));
    }

    #[test]
    fn rejects_unsorted_outer_pixel_index() {
        let mut bytes = make_tables_bytes(64, 63, 5, 4);
        // Corrupt the first two outer_pixel_index entries (header is 7 i32s = 28 bytes).
        let first = 28;
        bytes[first..first + 4].copy_from_slice(&200i32.to_le_bytes());
        bytes[first + 4..first + 8].copy_from_slice(&100i32.to_le_bytes());
        let file = write_tables_file(&bytes);
        assert!(matches!(
            ScanTables::load(file.path()),
            Err(LpxError::InvalidScanTables(_))
        ));
    }

    #[test]
    fn rejects_last_fovea_index_out_of_range() {
        let mut bytes = make_tables_bytes(64, 63, 5, 4);
        // last_fovea_index is the 6th i32 in the header, at byte offset 20.
        bytes[20..24].copy_from_slice(&20i32.to_le_bytes());
        let file = write_tables_file(&bytes);
        assert!(matches!(
            ScanTables::load(file.path()),
            Err(LpxError::InvalidScanTables(_))
        ));
    }
}

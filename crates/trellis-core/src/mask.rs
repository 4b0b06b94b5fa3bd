use crate::dtype::Element;
use crate::error::{Error, Result};
use crate::matrix::Matrix;

// SequenceMask — Which minibatch columns carry real data
//
// Several variable-length sequences are packed side by side into one
// minibatch. Column `t` of every per-sample matrix holds
//
//   time step  = t / num_parallel_sequences
//   sequence   = t % num_parallel_sequences
//
// Shorter sequences leave padding cells at the end. The batcher marks a
// cell as "no label" and/or "no feature"; a column is invalid when either
// flag is set. Criteria zero invalid columns in their working tensors
// before any reduction so padding never contributes to a loss or gradient.
//
// When the batcher reports no flags at all, every column is valid and
// masking is a no-op.

/// Padding flags for one (sequence, time) cell.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CellFlags {
    pub no_label: bool,
    pub no_feature: bool,
}

impl CellFlags {
    pub fn is_invalid(&self) -> bool {
        self.no_label || self.no_feature
    }
}

/// Per-minibatch sequence layout and padding flags.
#[derive(Debug, Clone, PartialEq)]
pub struct SequenceMask {
    num_parallel_sequences: usize,
    num_time_steps: usize,
    /// Indexed by `time * num_parallel_sequences + sequence`; empty when no
    /// cell has been flagged.
    cells: Vec<CellFlags>,
}

impl SequenceMask {
    /// Layout of `num_parallel_sequences` sequences over `num_time_steps`
    /// steps with every cell valid.
    pub fn dense(num_parallel_sequences: usize, num_time_steps: usize) -> Self {
        SequenceMask {
            num_parallel_sequences: num_parallel_sequences.max(1),
            num_time_steps,
            cells: Vec::new(),
        }
    }

    /// One sequence of `num_columns` steps with every cell valid.
    pub fn single(num_columns: usize) -> Self {
        Self::dense(1, num_columns)
    }

    pub fn num_parallel_sequences(&self) -> usize {
        self.num_parallel_sequences
    }

    pub fn num_time_steps(&self) -> usize {
        self.num_time_steps
    }

    pub fn num_columns(&self) -> usize {
        self.num_parallel_sequences * self.num_time_steps
    }

    /// True when no cell carries any flag.
    pub fn is_all_none(&self) -> bool {
        self.cells.iter().all(|c| !c.no_label && !c.no_feature)
    }

    fn cell_mut(&mut self, sequence: usize, time: usize) -> Result<&mut CellFlags> {
        if sequence >= self.num_parallel_sequences || time >= self.num_time_steps {
            return Err(Error::shape(
                "SequenceMask",
                format!(
                    "cell (sequence {}, time {}) outside {} sequences x {} steps",
                    sequence, time, self.num_parallel_sequences, self.num_time_steps
                ),
            ));
        }
        if self.cells.is_empty() {
            self.cells = vec![CellFlags::default(); self.num_columns()];
        }
        let idx = time * self.num_parallel_sequences + sequence;
        Ok(&mut self.cells[idx])
    }

    pub fn set_no_label(&mut self, sequence: usize, time: usize) -> Result<()> {
        self.cell_mut(sequence, time)?.no_label = true;
        Ok(())
    }

    pub fn set_no_feature(&mut self, sequence: usize, time: usize) -> Result<()> {
        self.cell_mut(sequence, time)?.no_feature = true;
        Ok(())
    }

    /// Flag a cell as pure padding (no label and no feature).
    pub fn set_gap(&mut self, sequence: usize, time: usize) -> Result<()> {
        let cell = self.cell_mut(sequence, time)?;
        cell.no_label = true;
        cell.no_feature = true;
        Ok(())
    }

    /// Whether the cell at (`sequence`, `time`) is padding.
    pub fn is_invalid_at(&self, sequence: usize, time: usize) -> bool {
        self.cells
            .get(time * self.num_parallel_sequences + sequence)
            .map_or(false, CellFlags::is_invalid)
    }

    /// Whether minibatch column `col` is padding.
    pub fn is_invalid(&self, col: usize) -> bool {
        self.cells.get(col).map_or(false, CellFlags::is_invalid)
    }

    /// Zero every invalid column of `m` in place. Returns the number of
    /// columns zeroed.
    pub fn mask_columns<T: Element>(&self, m: &mut Matrix<T>) -> usize {
        if self.is_all_none() {
            return 0;
        }
        let mut zeroed = 0;
        for col in 0..m.cols() {
            if self.is_invalid(col) {
                m.zero_column(col);
                zeroed += 1;
            }
        }
        zeroed
    }

    /// Zero column `col` of `m` if it is invalid.
    pub fn mask_column<T: Element>(&self, m: &mut Matrix<T>, col: usize) -> bool {
        if col < m.cols() && self.is_invalid(col) {
            m.zero_column(col);
            return true;
        }
        false
    }
}

impl Default for SequenceMask {
    fn default() -> Self {
        Self::dense(1, 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_column_decomposition() {
        let mut mask = SequenceMask::dense(2, 3);
        mask.set_gap(1, 2).unwrap();
        // column = time * S + sequence
        assert!(mask.is_invalid(5));
        assert!(mask.is_invalid_at(1, 2));
        assert!((0..5).all(|c| !mask.is_invalid(c)));
    }

    #[test]
    fn test_either_flag_invalidates() {
        let mut mask = SequenceMask::dense(1, 3);
        mask.set_no_label(0, 1).unwrap();
        mask.set_no_feature(0, 2).unwrap();
        assert!(!mask.is_all_none());
        assert!(!mask.is_invalid(0));
        assert!(mask.is_invalid(1));
        assert!(mask.is_invalid(2));
    }

    #[test]
    fn test_out_of_range_cell_is_error() {
        let mut mask = SequenceMask::dense(2, 2);
        assert!(mask.set_gap(2, 0).is_err());
        assert!(mask.set_gap(0, 2).is_err());
    }

    #[test]
    fn test_mask_columns_zeroes_only_invalid() {
        let mut mask = SequenceMask::dense(2, 2);
        mask.set_gap(0, 1).unwrap();
        let mut m = Matrix::<f64>::full(2, 4, 1.0);
        assert_eq!(mask.mask_columns(&mut m), 1);
        assert_eq!(m.col(2), &[0.0, 0.0]);
        assert_eq!(m.col(3), &[1.0, 1.0]);
    }

    #[test]
    fn test_no_flags_is_noop() {
        let mask = SequenceMask::single(3);
        let mut m = Matrix::<f32>::full(1, 3, 2.0);
        assert!(mask.is_all_none());
        assert_eq!(mask.mask_columns(&mut m), 0);
        assert!(!mask.mask_column(&mut m, 0));
        assert_eq!(m.sum(), 6.0);
    }
}

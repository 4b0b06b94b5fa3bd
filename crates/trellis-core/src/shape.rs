use std::fmt;

// Dims — Two-dimensional shape of a matrix
//
// Every tensor a criterion touches is 2-D:
//   - rows    index features, classes, or labels
//   - columns index (time, parallel-sequence) pairs packed by the batcher
//
// A matrix with zero rows or zero columns is "empty". Empty operands are a
// configuration error for every criterion, so validation code asks for
// `is_empty()` a lot.

/// Row and column count of a matrix.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Dims {
    pub rows: usize,
    pub cols: usize,
}

impl Dims {
    pub fn new(rows: usize, cols: usize) -> Self {
        Dims { rows, cols }
    }

    /// The 1×1 shape every scalar criterion output is resized to.
    pub fn scalar() -> Self {
        Dims { rows: 1, cols: 1 }
    }

    /// Total number of elements.
    pub fn elem_count(&self) -> usize {
        self.rows * self.cols
    }

    /// Whether this shape holds no elements.
    pub fn is_empty(&self) -> bool {
        self.elem_count() == 0
    }

    /// Whether this is a square matrix shape.
    pub fn is_square(&self) -> bool {
        self.rows == self.cols
    }
}

impl fmt::Display for Dims {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{} x {}]", self.rows, self.cols)
    }
}

impl From<(usize, usize)> for Dims {
    fn from((rows, cols): (usize, usize)) -> Self {
        Dims { rows, cols }
    }
}

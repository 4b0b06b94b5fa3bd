use std::fmt;
use std::ops::{Index, IndexMut};

use rayon::prelude::*;

use crate::device::DeviceId;
use crate::dtype::Element;
use crate::error::{Error, Result};
use crate::shape::Dims;

// Matrix — The dense numeric engine consumed by criterion nodes
//
// Criterion nodes never do arithmetic on raw buffers themselves; they call a
// fixed vocabulary of named engine operations (difference, element division,
// log-soft-max, Frobenius norm, scaled accumulation, matrix products, ...).
// This type provides exactly that vocabulary over a host buffer.
//
// LAYOUT:
//
//   Storage is column-major. A column holds one (time, sequence) sample, so
//   column slices are contiguous sub-slices of the buffer. That is what the
//   per-column loops of the criteria (soft-max per sample, masking a sample,
//   scattering one time step's gradient) want to touch.
//
// NAMING:
//
//   assign_*  overwrite `self` with the result (resizing it if needed)
//   add_* / *_and_add  accumulate into the destination, never overwrite
//   inplace_* transform `self` element-wise
//
// PARALLELISM:
//
//   Column-wise soft-max and matrix products split work across output
//   columns with rayon once a matrix is large enough to amortise the fork.

/// Below this many elements, column kernels stay on the calling thread.
const PAR_THRESHOLD: usize = 1 << 14;

/// Numerically stable `ln(exp(a) + exp(b))`.
pub fn log_add<T: Element>(a: T, b: T) -> T {
    let (hi, lo) = if a >= b { (a, b) } else { (b, a) };
    if lo == T::neg_infinity() {
        return hi;
    }
    hi + (lo - hi).exp().ln_1p()
}

/// A 2-D dense matrix resident on a (tagged) device.
#[derive(Clone, PartialEq)]
pub struct Matrix<T: Element> {
    rows: usize,
    cols: usize,
    data: Vec<T>,
    device: DeviceId,
}

impl<T: Element> Default for Matrix<T> {
    fn default() -> Self {
        Self::empty(DeviceId::Cpu)
    }
}

impl<T: Element> fmt::Debug for Matrix<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Matrix(dims={}, dtype={}, device={})",
            self.dims(),
            T::DTYPE,
            self.device
        )
    }
}

impl<T: Element> Matrix<T> {
    // Construction

    /// A 0×0 matrix on `device`; scratch tensors start like this and are
    /// resized during validation.
    pub fn empty(device: DeviceId) -> Self {
        Matrix {
            rows: 0,
            cols: 0,
            data: Vec::new(),
            device,
        }
    }

    /// A zero-filled host matrix.
    pub fn zeros(rows: usize, cols: usize) -> Self {
        Self::zeros_on(rows, cols, DeviceId::Cpu)
    }

    pub fn zeros_on(rows: usize, cols: usize, device: DeviceId) -> Self {
        Matrix {
            rows,
            cols,
            data: vec![T::zero(); rows * cols],
            device,
        }
    }

    /// A host matrix with every element set to `value`.
    pub fn full(rows: usize, cols: usize, value: T) -> Self {
        Matrix {
            rows,
            cols,
            data: vec![value; rows * cols],
            device: DeviceId::Cpu,
        }
    }

    /// A 1×1 matrix.
    pub fn scalar(value: T) -> Self {
        Self::full(1, 1, value)
    }

    /// Build from a column-major buffer.
    pub fn from_col_major(rows: usize, cols: usize, data: Vec<T>) -> Result<Self> {
        if data.len() != rows * cols {
            return Err(Error::shape(
                "Matrix::from_col_major",
                format!(
                    "{} elements cannot fill {}",
                    data.len(),
                    Dims::new(rows, cols)
                ),
            ));
        }
        Ok(Matrix {
            rows,
            cols,
            data,
            device: DeviceId::Cpu,
        })
    }

    /// Build from a list of rows, e.g. `Matrix::from_rows(&[[1.0, 2.0], [3.0, 4.0]])`.
    pub fn from_rows<R: AsRef<[T]>>(rows: &[R]) -> Result<Self> {
        let nrows = rows.len();
        let ncols = rows.first().map(|r| r.as_ref().len()).unwrap_or(0);
        let mut m = Self::zeros(nrows, ncols);
        for (i, row) in rows.iter().enumerate() {
            let row = row.as_ref();
            if row.len() != ncols {
                return Err(Error::shape(
                    "Matrix::from_rows",
                    format!("row {} has {} elements, expected {}", i, row.len(), ncols),
                ));
            }
            for (j, &v) in row.iter().enumerate() {
                m[(i, j)] = v;
            }
        }
        Ok(m)
    }

    /// One-hot columns: column `t` has a 1 at row `indices[t]`.
    pub fn one_hot(num_rows: usize, indices: &[usize]) -> Result<Self> {
        let mut m = Self::zeros(num_rows, indices.len());
        for (t, &k) in indices.iter().enumerate() {
            if k >= num_rows {
                return Err(Error::shape(
                    "Matrix::one_hot",
                    format!("index {} out of range for {} rows", k, num_rows),
                ));
            }
            m[(k, t)] = T::one();
        }
        Ok(m)
    }

    // Shape and access

    pub fn rows(&self) -> usize {
        self.rows
    }

    pub fn cols(&self) -> usize {
        self.cols
    }

    pub fn dims(&self) -> Dims {
        Dims::new(self.rows, self.cols)
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn device(&self) -> DeviceId {
        self.device
    }

    /// The column-major buffer.
    pub fn data(&self) -> &[T] {
        &self.data
    }

    pub fn data_mut(&mut self) -> &mut [T] {
        &mut self.data
    }

    pub fn at(&self, row: usize, col: usize) -> T {
        self[(row, col)]
    }

    pub fn set(&mut self, row: usize, col: usize, value: T) {
        self[(row, col)] = value;
    }

    /// The [0, 0] element; scalar outputs and upstream gradients live there.
    pub fn get00(&self) -> T {
        self.data[0]
    }

    pub fn col(&self, j: usize) -> &[T] {
        &self.data[j * self.rows..(j + 1) * self.rows]
    }

    pub fn col_mut(&mut self, j: usize) -> &mut [T] {
        let rows = self.rows;
        &mut self.data[j * rows..(j + 1) * rows]
    }

    /// Row-major copy of the contents, for inspection.
    pub fn to_rows(&self) -> Vec<Vec<T>> {
        (0..self.rows)
            .map(|i| (0..self.cols).map(|j| self[(i, j)]).collect())
            .collect()
    }

    /// Change the shape. Contents are preserved when the shape is unchanged
    /// and zero-filled otherwise.
    pub fn resize(&mut self, rows: usize, cols: usize) {
        if self.rows == rows && self.cols == cols {
            return;
        }
        self.rows = rows;
        self.cols = cols;
        self.data.clear();
        self.data.resize(rows * cols, T::zero());
    }

    pub fn resize_like(&mut self, other: &Matrix<T>) {
        self.resize(other.rows, other.cols);
    }

    /// Fill every element with `value`.
    pub fn set_value(&mut self, value: T) {
        self.data.iter_mut().for_each(|x| *x = value);
    }

    /// Copy shape and contents of `src`; the residency of `self` is kept.
    pub fn copy_from(&mut self, src: &Matrix<T>) {
        self.rows = src.rows;
        self.cols = src.cols;
        self.data.clear();
        self.data.extend_from_slice(&src.data);
    }

    /// Copy of columns `[start, start + n)`.
    pub fn column_slice(&self, start: usize, n: usize) -> Result<Matrix<T>> {
        self.check_column_range("Matrix::column_slice", start, n)?;
        Ok(Matrix {
            rows: self.rows,
            cols: n,
            data: self.data[start * self.rows..(start + n) * self.rows].to_vec(),
            device: self.device,
        })
    }

    /// Overwrite columns `[start, start + src.cols())` with `src`.
    pub fn set_column_slice(&mut self, start: usize, src: &Matrix<T>) -> Result<()> {
        if src.rows != self.rows {
            return Err(Error::DimsMismatch {
                op: "Matrix::set_column_slice".into(),
                left: self.dims(),
                right: src.dims(),
            });
        }
        self.check_column_range("Matrix::set_column_slice", start, src.cols)?;
        let rows = self.rows;
        self.data[start * rows..(start + src.cols) * rows].copy_from_slice(&src.data);
        Ok(())
    }

    pub fn zero_column(&mut self, j: usize) {
        self.col_mut(j).iter_mut().for_each(|x| *x = T::zero());
    }

    fn check_column_range(&self, op: &str, start: usize, n: usize) -> Result<()> {
        if start + n > self.cols {
            return Err(Error::shape(
                op,
                format!(
                    "columns [{}, {}) out of range for {}",
                    start,
                    start + n,
                    self.dims()
                ),
            ));
        }
        Ok(())
    }

    fn check_same_dims(op: &str, a: &Matrix<T>, b: &Matrix<T>) -> Result<()> {
        if a.dims() != b.dims() {
            return Err(Error::DimsMismatch {
                op: op.to_string(),
                left: a.dims(),
                right: b.dims(),
            });
        }
        Ok(())
    }

    // Device residency

    /// Move to `device`. A no-op when already resident and not forced.
    /// Returns whether a transfer happened.
    pub fn transfer_to_device(&mut self, device: DeviceId, force: bool) -> bool {
        if self.device == device && !force {
            return false;
        }
        self.device = device;
        true
    }

    // Element-wise assignments

    /// self = a - b
    pub fn assign_difference_of(&mut self, a: &Matrix<T>, b: &Matrix<T>) -> Result<()> {
        Self::check_same_dims("AssignDifferenceOf", a, b)?;
        self.resize(a.rows, a.cols);
        for ((out, &x), &y) in self.data.iter_mut().zip(&a.data).zip(&b.data) {
            *out = x - y;
        }
        Ok(())
    }

    /// self = a ./ b
    pub fn assign_element_division_of(&mut self, a: &Matrix<T>, b: &Matrix<T>) -> Result<()> {
        Self::check_same_dims("AssignElementDivisionOf", a, b)?;
        self.resize(a.rows, a.cols);
        for ((out, &x), &y) in self.data.iter_mut().zip(&a.data).zip(&b.data) {
            *out = x / y;
        }
        Ok(())
    }

    /// self = sign(a), with sign(0) = 0
    pub fn assign_sign_of(&mut self, a: &Matrix<T>) {
        self.resize(a.rows, a.cols);
        for (out, &x) in self.data.iter_mut().zip(&a.data) {
            *out = if x > T::zero() {
                T::one()
            } else if x < T::zero() {
                -T::one()
            } else {
                T::zero()
            };
        }
    }

    /// self = exp(a)
    pub fn assign_exp_of(&mut self, a: &Matrix<T>) {
        self.copy_from(a);
        self.inplace_exp();
    }

    pub fn inplace_exp(&mut self) {
        self.data.iter_mut().for_each(|x| *x = x.exp());
    }

    pub fn inplace_log(&mut self) {
        self.data.iter_mut().for_each(|x| *x = x.ln());
    }

    /// self = log_softmax(x), normalising each column (`by_column`) or each row.
    pub fn assign_log_softmax_of(&mut self, x: &Matrix<T>, by_column: bool) {
        self.copy_from(x);
        self.inplace_log_softmax(by_column);
    }

    pub fn inplace_log_softmax(&mut self, by_column: bool) {
        if self.is_empty() {
            return;
        }
        if by_column {
            let rows = self.rows;
            if self.data.len() >= PAR_THRESHOLD {
                self.data.par_chunks_mut(rows).for_each(log_softmax_in_place);
            } else {
                self.data.chunks_mut(rows).for_each(log_softmax_in_place);
            }
        } else {
            let mut row = vec![T::zero(); self.cols];
            for i in 0..self.rows {
                for (j, v) in row.iter_mut().enumerate() {
                    *v = self[(i, j)];
                }
                log_softmax_in_place(&mut row);
                for (j, &v) in row.iter().enumerate() {
                    self[(i, j)] = v;
                }
            }
        }
    }

    // Reductions

    /// sqrt(sum of squares)
    pub fn frobenius_norm(&self) -> T {
        self.data
            .iter()
            .fold(T::zero(), |acc, &x| acc + x * x)
            .sqrt()
    }

    /// Sum of absolute values.
    pub fn matrix_norm1(&self) -> T {
        self.data.iter().fold(T::zero(), |acc, &x| acc + x.abs())
    }

    pub fn sum(&self) -> T {
        self.data.iter().fold(T::zero(), |acc, &x| acc + x)
    }

    /// ln(sum(exp(self))) over every element.
    pub fn log_add_sum_of_elements(&self) -> T {
        self.data
            .iter()
            .fold(T::log_zero(), |acc, &x| log_add(acc, x))
    }

    /// self = [<a, b>_F] as a 1×1 matrix.
    pub fn assign_inner_product_of_matrices(&mut self, a: &Matrix<T>, b: &Matrix<T>) -> Result<()> {
        let v = Self::inner_product_of_matrices(a, b)?;
        self.resize(1, 1);
        self.data[0] = v;
        Ok(())
    }

    /// sum_ij a_ij * b_ij
    pub fn inner_product_of_matrices(a: &Matrix<T>, b: &Matrix<T>) -> Result<T> {
        Self::check_same_dims("InnerProductOfMatrices", a, b)?;
        Ok(a
            .data
            .iter()
            .zip(&b.data)
            .fold(T::zero(), |acc, (&x, &y)| acc + x * y))
    }

    // Accumulation

    /// self += alpha * a
    pub fn add_with_scale_of(&mut self, alpha: T, a: &Matrix<T>) -> Result<()> {
        Self::check_same_dims("AddWithScaleOf", self, a)?;
        for (out, &x) in self.data.iter_mut().zip(&a.data) {
            *out = *out + alpha * x;
        }
        Ok(())
    }

    /// c += alpha * a
    pub fn scale_and_add(alpha: T, a: &Matrix<T>, c: &mut Matrix<T>) -> Result<()> {
        c.add_with_scale_of(alpha, a)
    }

    /// c += alpha * (a - b)
    pub fn add_scaled_difference(
        alpha: T,
        a: &Matrix<T>,
        b: &Matrix<T>,
        c: &mut Matrix<T>,
    ) -> Result<()> {
        Self::check_same_dims("AddScaledDifference", a, b)?;
        Self::check_same_dims("AddScaledDifference", a, c)?;
        for ((out, &x), &y) in c.data.iter_mut().zip(&a.data).zip(&b.data) {
            *out = *out + alpha * (x - y);
        }
        Ok(())
    }

    // Products

    /// self = op(a) * op(b), where op transposes when the flag is set.
    pub fn assign_product_of(
        &mut self,
        a: &Matrix<T>,
        transpose_a: bool,
        b: &Matrix<T>,
        transpose_b: bool,
    ) -> Result<()> {
        let (m, _, n) = Self::product_dims(a, transpose_a, b, transpose_b)?;
        self.resize(m, n);
        self.set_value(T::zero());
        gemm_accumulate(a, transpose_a, b, transpose_b, self);
        Ok(())
    }

    /// c += op(a) * op(b)
    pub fn multiply_and_add(
        a: &Matrix<T>,
        transpose_a: bool,
        b: &Matrix<T>,
        transpose_b: bool,
        c: &mut Matrix<T>,
    ) -> Result<()> {
        let (m, _, n) = Self::product_dims(a, transpose_a, b, transpose_b)?;
        if c.dims() != Dims::new(m, n) {
            return Err(Error::DimsMismatch {
                op: "MultiplyAndAdd".into(),
                left: Dims::new(m, n),
                right: c.dims(),
            });
        }
        gemm_accumulate(a, transpose_a, b, transpose_b, c);
        Ok(())
    }

    fn product_dims(
        a: &Matrix<T>,
        transpose_a: bool,
        b: &Matrix<T>,
        transpose_b: bool,
    ) -> Result<(usize, usize, usize)> {
        let (m, k) = if transpose_a {
            (a.cols, a.rows)
        } else {
            (a.rows, a.cols)
        };
        let (k2, n) = if transpose_b {
            (b.cols, b.rows)
        } else {
            (b.rows, b.cols)
        };
        if k != k2 {
            return Err(Error::shape(
                "MatrixProduct",
                format!("[{}x{}] @ [{}x{}]: inner dimensions must match", m, k, k2, n),
            ));
        }
        Ok((m, k, n))
    }

    // Diagnostics

    /// Fail with `NumericAnomaly` if any element is NaN or infinite.
    pub fn check_finite(&self, op: &str) -> Result<()> {
        match self.data.iter().find(|x| !x.is_finite()) {
            Some(&bad) => Err(Error::NumericAnomaly {
                op: op.to_string(),
                value: bad.as_f64(),
            }),
            None => Ok(()),
        }
    }
}

impl<T: Element> Index<(usize, usize)> for Matrix<T> {
    type Output = T;

    fn index(&self, (row, col): (usize, usize)) -> &T {
        debug_assert!(row < self.rows && col < self.cols);
        &self.data[col * self.rows + row]
    }
}

impl<T: Element> IndexMut<(usize, usize)> for Matrix<T> {
    fn index_mut(&mut self, (row, col): (usize, usize)) -> &mut T {
        debug_assert!(row < self.rows && col < self.cols);
        &mut self.data[col * self.rows + row]
    }
}

/// log-soft-max over one contiguous run of values.
fn log_softmax_in_place<T: Element>(v: &mut [T]) {
    let max = v.iter().fold(T::neg_infinity(), |a, &b| a.max(b));
    let sum = v.iter().fold(T::zero(), |acc, &x| acc + (x - max).exp());
    let log_norm = max + sum.ln();
    v.iter_mut().for_each(|x| *x = *x - log_norm);
}

/// c += op(a) * op(b), dimensions already checked.
fn gemm_accumulate<T: Element>(
    a: &Matrix<T>,
    transpose_a: bool,
    b: &Matrix<T>,
    transpose_b: bool,
    c: &mut Matrix<T>,
) {
    let m = c.rows;
    if m == 0 || c.cols == 0 {
        return;
    }
    let k = if transpose_a { a.rows } else { a.cols };
    let a_at = |i: usize, p: usize| if transpose_a { a[(p, i)] } else { a[(i, p)] };
    let b_at = |p: usize, j: usize| if transpose_b { b[(j, p)] } else { b[(p, j)] };
    let column = |(j, out): (usize, &mut [T])| {
        for p in 0..k {
            let bpj = b_at(p, j);
            if bpj == T::zero() {
                continue;
            }
            for (i, o) in out.iter_mut().enumerate() {
                *o = *o + a_at(i, p) * bpj;
            }
        }
    };
    if c.data.len() * k >= PAR_THRESHOLD {
        c.data.par_chunks_mut(m).enumerate().for_each(column);
    } else {
        c.data.chunks_mut(m).enumerate().for_each(column);
    }
}

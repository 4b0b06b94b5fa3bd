use std::fmt;

use num_traits::{Float, NumCast};

// DType — Element types a criterion can be instantiated over
//
// Training criteria are numerically sensitive (log-domain sums, soft-max
// normalisation, divisions by probabilities), so only IEEE floating point
// types are supported:
//
//   F32  — 32-bit float, the default workhorse
//   F64  — 64-bit float, used when checking gradients against brute force

/// Runtime tag for the element type of a matrix.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DType {
    F32,
    F64,
}

impl DType {
    /// Size of one element in bytes.
    pub fn size_in_bytes(&self) -> usize {
        match self {
            DType::F32 => 4,
            DType::F64 => 8,
        }
    }
}

impl fmt::Display for DType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            DType::F32 => "f32",
            DType::F64 => "f64",
        };
        write!(f, "{}", s)
    }
}

// Element — Trait that connects Rust float types to DType
//
// Every node and every matrix is generic over `T: Element`, so the same
// criterion code is monomorphised once for f32 and once for f64. The trait
// carries the handful of conversions the engine needs on top of
// `num_traits::Float` (log, exp, comparisons, infinities).

/// Trait implemented by the float types a [`Matrix`](crate::Matrix) can hold.
pub trait Element:
    Float + NumCast + Default + Send + Sync + fmt::Debug + fmt::Display + 'static
{
    /// The corresponding DType enum variant.
    const DTYPE: DType;

    /// Widen this value to f64.
    fn as_f64(self) -> f64;

    /// Narrow an f64 into this type.
    fn from_f64(v: f64) -> Self;

    /// The log-domain zero, `ln(0)`.
    fn log_zero() -> Self {
        Self::neg_infinity()
    }

    /// Interpret a stored label value as a non-negative index.
    ///
    /// Label matrices carry word, class, and boundary indices as floats.
    fn as_index(self) -> usize {
        self.as_f64().max(0.0).round() as usize
    }
}

impl Element for f32 {
    const DTYPE: DType = DType::F32;
    fn as_f64(self) -> f64 {
        self as f64
    }
    fn from_f64(v: f64) -> Self {
        v as f32
    }
}

impl Element for f64 {
    const DTYPE: DType = DType::F64;
    fn as_f64(self) -> f64 {
        self
    }
    fn from_f64(v: f64) -> Self {
        v
    }
}

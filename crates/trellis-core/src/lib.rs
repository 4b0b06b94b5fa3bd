//! # trellis-core
//!
//! Numeric building blocks shared by every trellis criterion.
//!
//! This crate provides:
//! - [`Matrix`] — column-major dense matrix with the engine operations criteria call
//! - [`SequenceMask`] — which minibatch columns are padding
//! - [`DType`] / [`Element`] — the float types a matrix can hold
//! - [`Dims`] / [`DeviceId`] — shape and residency tags
//! - [`Error`] / [`Result`] — the error type every fallible call returns
// - dtype: f32 / f64 element types
// - shape: 2-D dims
// - device: residency tags
// - matrix: dense engine plus log_add
// - mask: sequence padding flags
// - persist: little-endian helpers for saved node state

pub mod device;
pub mod dtype;
pub mod error;
pub mod mask;
pub mod matrix;
pub mod persist;
pub mod shape;

pub use device::DeviceId;
pub use dtype::{DType, Element};
pub use error::{Error, Result};
pub use mask::{CellFlags, SequenceMask};
pub use matrix::{log_add, Matrix};
pub use shape::Dims;

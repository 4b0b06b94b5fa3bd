//! # trellis-criterion
//!
//! Training-criterion nodes for a dataflow-graph trainer.
//!
//! A criterion sits at the top of a network: it reads predictions and
//! targets from its input nodes, reduces them to one scalar loss, and on
//! the backward pass adds its derivative into each differentiable input's
//! gradient.
//!
//! 1. **Node contract** — [`Criterion`], [`GraphNode`] handles, [`CopyNodeFlags`]
//! 2. **Losses** — [`SquareError`], [`CrossEntropyWithSoftmax`], [`CrossEntropy`]
//! 3. **Regularizers** — [`MatrixL1Reg`], [`MatrixL2Reg`]
//! 4. **Large vocabularies** — [`NoiseContrastiveEstimation`],
//!    [`ClassBasedCrossEntropyWithSoftmax`]
//! 5. **Sequences** — [`SequenceCRF`] over the forward-backward engine in [`crf`]
//! 6. **Pass-through** — [`DummyCriterion`]
//!
//! [`SquareError`], both cross-entropies, both regularizers and
//! [`ClassBasedCrossEntropyWithSoftmax`] honor the
//! [`SequenceMask`](trellis_core::SequenceMask): padded columns contribute
//! neither loss nor gradient. [`NoiseContrastiveEstimation`] and
//! [`DummyCriterion`] score every column, and [`SequenceCRF`] uses the mask
//! only for its number of parallel sequences.

pub mod class_based;
pub mod config;
pub mod crf;
pub mod cross_entropy;
pub mod dummy;
pub mod factory;
pub mod nce;
pub mod node;
pub mod regularizer;
pub mod sequence_crf;
pub mod square_error;

pub use class_based::{ClassBasedCrossEntropyWithSoftmax, ClassSegment, SoftmaxGradState};
pub use config::{CriterionConfig, DEFAULT_L2_EPSILON};
pub use crf::CrfOutcome;
pub use cross_entropy::{CrossEntropy, CrossEntropyWithSoftmax};
pub use dummy::DummyCriterion;
pub use factory::{new_criterion, CriterionKind, CriterionNode};
pub use nce::{NceEvalMode, NoiseContrastiveEstimation};
pub use node::{CopyNodeFlags, Criterion, CriterionCore, GraphNode, NodeRef, NodeRole};
pub use regularizer::{MatrixL1Reg, MatrixL2Reg};
pub use sequence_crf::SequenceCRF;
pub use square_error::SquareError;

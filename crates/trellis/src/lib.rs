//! # Trellis
//!
//! Training criteria for dataflow-graph neural network trainers.
//!
//! This is the top-level facade crate that re-exports everything you need.
//!
//! ## Usage
//!
//! ```rust
//! use trellis::prelude::*;
//!
//! let prediction = GraphNode::computed("z", Matrix::<f64>::from_rows(&[[1.0, 2.0]]).unwrap());
//! let target = GraphNode::input("y", Matrix::<f64>::from_rows(&[[0.0, 2.0]]).unwrap());
//! let mut loss = SquareError::new("mse");
//! loss.attach(prediction, target);
//! loss.validate().unwrap();
//! loss.evaluate(&SequenceMask::single(2)).unwrap();
//! assert_eq!(loss.value(), 0.5);
//! ```
//!
//! ## Architecture
//!
//! | Crate | Purpose |
//! |-------|----------|
//! | `trellis-core` | Matrix engine, DType, Dims, SequenceMask, persistence helpers, Error |
//! | `trellis-criterion` | Criterion contract, loss and regularizer nodes, NCE, class-based soft-max, CRF |

/// Re-export core types.
pub use trellis_core::{
    log_add, CellFlags, DType, DeviceId, Dims, Element, Error, Matrix, Result, SequenceMask,
};

/// Re-export the criterion nodes.
pub mod criterion {
    pub use trellis_criterion::*;
}

/// Re-export the binary persistence helpers.
pub mod persist {
    pub use trellis_core::persist::*;
}

/// Prelude: import this for the most common types.
pub mod prelude {
    pub use crate::criterion::{
        new_criterion, ClassBasedCrossEntropyWithSoftmax, CopyNodeFlags, Criterion,
        CriterionConfig, CriterionKind, CriterionNode, CrossEntropy, CrossEntropyWithSoftmax,
        DummyCriterion, GraphNode, MatrixL1Reg, MatrixL2Reg, NceEvalMode, NodeRef, NodeRole,
        NoiseContrastiveEstimation, SequenceCRF, SquareError,
    };
    pub use crate::{DType, DeviceId, Dims, Element, Matrix, SequenceMask};
}

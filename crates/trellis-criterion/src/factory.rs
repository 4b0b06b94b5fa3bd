// Criterion dispatch
//
// `CriterionKind` names every variant by its operation name, and
// `CriterionNode` wraps every variant in one closed enum so a graph can
// hold criteria without boxing. `new_criterion` builds any variant from a
// kind and applies a `CriterionConfig`.

use std::fmt;
use std::str::FromStr;

use tracing::{debug, warn};
use trellis_core::{DeviceId, Element, Error, Result, SequenceMask};

use crate::class_based::ClassBasedCrossEntropyWithSoftmax;
use crate::config::CriterionConfig;
use crate::cross_entropy::{CrossEntropy, CrossEntropyWithSoftmax};
use crate::dummy::DummyCriterion;
use crate::nce::NoiseContrastiveEstimation;
use crate::node::{CopyNodeFlags, Criterion, NodeRef};
use crate::regularizer::{MatrixL1Reg, MatrixL2Reg};
use crate::sequence_crf::SequenceCRF;
use crate::square_error::SquareError;

/// The criterion variants, keyed by operation name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CriterionKind {
    SquareError,
    CrossEntropyWithSoftmax,
    CrossEntropy,
    MatrixL1Reg,
    MatrixL2Reg,
    NoiseContrastiveEstimation,
    ClassBasedCrossEntropyWithSoftmax,
    SequenceCRF,
    DummyCriterion,
}

impl CriterionKind {
    pub const ALL: [CriterionKind; 9] = [
        CriterionKind::SquareError,
        CriterionKind::CrossEntropyWithSoftmax,
        CriterionKind::CrossEntropy,
        CriterionKind::MatrixL1Reg,
        CriterionKind::MatrixL2Reg,
        CriterionKind::NoiseContrastiveEstimation,
        CriterionKind::ClassBasedCrossEntropyWithSoftmax,
        CriterionKind::SequenceCRF,
        CriterionKind::DummyCriterion,
    ];

    /// The operation name a node of this kind reports.
    pub fn as_str(&self) -> &'static str {
        match self {
            CriterionKind::SquareError => "SquareError",
            CriterionKind::CrossEntropyWithSoftmax => "CrossEntropyWithSoftmax",
            CriterionKind::CrossEntropy => "CrossEntropy",
            CriterionKind::MatrixL1Reg => "MatrixL1Reg",
            CriterionKind::MatrixL2Reg => "MatrixL2Reg",
            CriterionKind::NoiseContrastiveEstimation => "NCEBasedCrossEntropyWithSoftmax",
            CriterionKind::ClassBasedCrossEntropyWithSoftmax => "ClassBasedCrossEntropyWithSoftmax",
            CriterionKind::SequenceCRF => "CRF",
            CriterionKind::DummyCriterion => "DummyCriterion",
        }
    }

    pub fn arity(&self) -> usize {
        match self {
            CriterionKind::MatrixL1Reg | CriterionKind::MatrixL2Reg => 1,
            CriterionKind::SquareError
            | CriterionKind::CrossEntropyWithSoftmax
            | CriterionKind::CrossEntropy => 2,
            CriterionKind::SequenceCRF | CriterionKind::DummyCriterion => 3,
            CriterionKind::NoiseContrastiveEstimation
            | CriterionKind::ClassBasedCrossEntropyWithSoftmax => 4,
        }
    }
}

impl fmt::Display for CriterionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CriterionKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        CriterionKind::ALL
            .into_iter()
            .find(|kind| kind.as_str() == s)
            .ok_or_else(|| Error::Config(format!("unknown criterion '{}'", s)))
    }
}

/// Every criterion variant behind one type.
#[derive(Debug)]
pub enum CriterionNode<T: Element> {
    SquareError(SquareError<T>),
    CrossEntropyWithSoftmax(CrossEntropyWithSoftmax<T>),
    CrossEntropy(CrossEntropy<T>),
    MatrixL1Reg(MatrixL1Reg<T>),
    MatrixL2Reg(MatrixL2Reg<T>),
    NoiseContrastiveEstimation(NoiseContrastiveEstimation<T>),
    ClassBasedCrossEntropyWithSoftmax(ClassBasedCrossEntropyWithSoftmax<T>),
    SequenceCRF(SequenceCRF<T>),
    DummyCriterion(DummyCriterion<T>),
}

macro_rules! dispatch {
    ($node:expr, $inner:ident => $body:expr) => {
        match $node {
            CriterionNode::SquareError($inner) => $body,
            CriterionNode::CrossEntropyWithSoftmax($inner) => $body,
            CriterionNode::CrossEntropy($inner) => $body,
            CriterionNode::MatrixL1Reg($inner) => $body,
            CriterionNode::MatrixL2Reg($inner) => $body,
            CriterionNode::NoiseContrastiveEstimation($inner) => $body,
            CriterionNode::ClassBasedCrossEntropyWithSoftmax($inner) => $body,
            CriterionNode::SequenceCRF($inner) => $body,
            CriterionNode::DummyCriterion($inner) => $body,
        }
    };
}

impl<T: Element> CriterionNode<T> {
    pub fn kind(&self) -> CriterionKind {
        match self {
            CriterionNode::SquareError(_) => CriterionKind::SquareError,
            CriterionNode::CrossEntropyWithSoftmax(_) => CriterionKind::CrossEntropyWithSoftmax,
            CriterionNode::CrossEntropy(_) => CriterionKind::CrossEntropy,
            CriterionNode::MatrixL1Reg(_) => CriterionKind::MatrixL1Reg,
            CriterionNode::MatrixL2Reg(_) => CriterionKind::MatrixL2Reg,
            CriterionNode::NoiseContrastiveEstimation(_) => {
                CriterionKind::NoiseContrastiveEstimation
            }
            CriterionNode::ClassBasedCrossEntropyWithSoftmax(_) => {
                CriterionKind::ClassBasedCrossEntropyWithSoftmax
            }
            CriterionNode::SequenceCRF(_) => CriterionKind::SequenceCRF,
            CriterionNode::DummyCriterion(_) => CriterionKind::DummyCriterion,
        }
    }

    /// Copy into a node of the same kind; a target of another kind is an error.
    pub fn try_copy_to(&self, target: &mut Self, flags: CopyNodeFlags) -> Result<()> {
        use CriterionNode as N;
        match (self, target) {
            (N::SquareError(a), N::SquareError(b)) => a.copy_to(b, flags),
            (N::CrossEntropyWithSoftmax(a), N::CrossEntropyWithSoftmax(b)) => a.copy_to(b, flags),
            (N::CrossEntropy(a), N::CrossEntropy(b)) => a.copy_to(b, flags),
            (N::MatrixL1Reg(a), N::MatrixL1Reg(b)) => a.copy_to(b, flags),
            (N::MatrixL2Reg(a), N::MatrixL2Reg(b)) => a.copy_to(b, flags),
            (N::NoiseContrastiveEstimation(a), N::NoiseContrastiveEstimation(b)) => {
                a.copy_to(b, flags)
            }
            (N::ClassBasedCrossEntropyWithSoftmax(a), N::ClassBasedCrossEntropyWithSoftmax(b)) => {
                a.copy_to(b, flags)
            }
            (N::SequenceCRF(a), N::SequenceCRF(b)) => a.copy_to(b, flags),
            (N::DummyCriterion(a), N::DummyCriterion(b)) => a.copy_to(b, flags),
            (a, b) => {
                return Err(Error::msg(format!(
                    "cannot copy {} into {}",
                    a.kind(),
                    b.kind()
                )))
            }
        }
        Ok(())
    }
}

impl<T: Element> Criterion<T> for CriterionNode<T> {
    fn name(&self) -> &str {
        dispatch!(self, n => n.name())
    }

    fn operation_name(&self) -> &'static str {
        dispatch!(self, n => n.operation_name())
    }

    fn arity(&self) -> usize {
        dispatch!(self, n => n.arity())
    }

    fn attach_inputs(&mut self, inputs: &[NodeRef<T>]) -> Result<()> {
        dispatch!(self, n => n.attach_inputs(inputs))
    }

    fn inputs(&self) -> Vec<NodeRef<T>> {
        dispatch!(self, n => n.inputs())
    }

    fn output(&self) -> &NodeRef<T> {
        dispatch!(self, n => n.output())
    }

    fn validate(&mut self) -> Result<()> {
        dispatch!(self, n => n.validate())
    }

    fn evaluate(&mut self, mask: &SequenceMask) -> Result<()> {
        dispatch!(self, n => n.evaluate(mask))
    }

    fn compute_gradient(&mut self, input_index: usize, mask: &SequenceMask) -> Result<()> {
        dispatch!(self, n => n.compute_gradient(input_index, mask))
    }

    fn move_to_device(&mut self, device: DeviceId, force: bool) {
        dispatch!(self, n => n.move_to_device(device, force))
    }

    fn set_nan_check(&mut self, enabled: bool) {
        dispatch!(self, n => n.set_nan_check(enabled))
    }

    /// Mismatched kinds are skipped with a warning; use `try_copy_to` to
    /// get an error instead.
    fn copy_to(&self, target: &mut Self, flags: CopyNodeFlags) {
        if let Err(e) = self.try_copy_to(target, flags) {
            warn!(node = self.name(), error = %e, "copy skipped");
        }
    }
}

/// Build a criterion of `kind` named `name`, configured by `config`.
pub fn new_criterion<T: Element>(
    kind: CriterionKind,
    name: impl Into<String>,
    config: &CriterionConfig,
) -> CriterionNode<T> {
    let name = name.into();
    let mut node = match kind {
        CriterionKind::SquareError => CriterionNode::SquareError(SquareError::new(name)),
        CriterionKind::CrossEntropyWithSoftmax => {
            CriterionNode::CrossEntropyWithSoftmax(CrossEntropyWithSoftmax::new(name))
        }
        CriterionKind::CrossEntropy => CriterionNode::CrossEntropy(CrossEntropy::new(name)),
        CriterionKind::MatrixL1Reg => CriterionNode::MatrixL1Reg(MatrixL1Reg::new(name)),
        CriterionKind::MatrixL2Reg => CriterionNode::MatrixL2Reg(MatrixL2Reg::with_epsilon(
            name,
            T::from_f64(config.l2_epsilon),
        )),
        CriterionKind::NoiseContrastiveEstimation => CriterionNode::NoiseContrastiveEstimation(
            NoiseContrastiveEstimation::with_mode(name, config.nce_eval_mode),
        ),
        CriterionKind::ClassBasedCrossEntropyWithSoftmax => {
            CriterionNode::ClassBasedCrossEntropyWithSoftmax(
                ClassBasedCrossEntropyWithSoftmax::new(name),
            )
        }
        CriterionKind::SequenceCRF => CriterionNode::SequenceCRF(SequenceCRF::new(name)),
        CriterionKind::DummyCriterion => CriterionNode::DummyCriterion(DummyCriterion::new(name)),
    };
    node.set_nan_check(config.nan_check);
    debug!(node = node.name(), op = kind.as_str(), dtype = %T::DTYPE, "created criterion");
    node
}

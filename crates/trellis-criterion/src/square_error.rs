// SquareError — Half the squared Frobenius distance between two operands
//
//   d     = x0 - x1          (invalid columns zeroed)
//   loss  = ||d||_F^2 / 2
//
//   dL/dx0 += g * d
//   dL/dx1 -= g * d
//
// The difference `d` is kept from the forward pass; the backward pass only
// scales it.

use tracing::debug;
use trellis_core::{DeviceId, Element, Matrix, Result, SequenceMask};

use crate::node::{
    infer_learnable_dims, invalid_gradient_target, require_not_empty, require_same_dims,
    CopyNodeFlags, Criterion, CriterionCore, NodeRef,
};

const OP: &str = "SquareError";

#[derive(Debug)]
pub struct SquareError<T: Element> {
    core: CriterionCore<T, 2>,
    left_minus_right: Matrix<T>,
}

impl<T: Element> SquareError<T> {
    pub fn new(name: impl Into<String>) -> Self {
        SquareError {
            core: CriterionCore::new(name),
            left_minus_right: Matrix::default(),
        }
    }

    pub fn attach(&mut self, left: NodeRef<T>, right: NodeRef<T>) {
        self.core.attach([left, right]);
    }

    /// `x0 - x1` of the last forward pass, with invalid columns zeroed.
    pub fn difference(&self) -> &Matrix<T> {
        &self.left_minus_right
    }

    /// Fill `diff` with the masked difference and return the loss.
    pub fn compute_loss(
        diff: &mut Matrix<T>,
        left: &Matrix<T>,
        right: &Matrix<T>,
        mask: &SequenceMask,
    ) -> Result<T> {
        diff.assign_difference_of(left, right)?;
        mask.mask_columns(diff);
        let norm = diff.frobenius_norm();
        Ok(norm * norm / T::from_f64(2.0))
    }
}

impl<T: Element> Criterion<T> for SquareError<T> {
    fn name(&self) -> &str {
        self.core.name()
    }

    fn operation_name(&self) -> &'static str {
        OP
    }

    fn arity(&self) -> usize {
        2
    }

    fn attach_inputs(&mut self, inputs: &[NodeRef<T>]) -> Result<()> {
        self.core.attach_slice(OP, inputs)
    }

    fn inputs(&self) -> Vec<NodeRef<T>> {
        self.core.input_list()
    }

    fn output(&self) -> &NodeRef<T> {
        self.core.output()
    }

    fn validate(&mut self) -> Result<()> {
        let [left, right] = self.core.inputs(OP)?;
        infer_learnable_dims(OP, &left, &right);
        infer_learnable_dims(OP, &right, &left);
        require_not_empty(OP, &left)?;
        require_not_empty(OP, &right)?;
        require_same_dims(OP, &left, &right)?;

        let dims = left.dims();
        self.left_minus_right.resize(dims.rows, dims.cols);
        self.core.reset_output();
        debug!(node = self.core.name(), op = OP, dims = %dims, "validated");
        Ok(())
    }

    fn evaluate(&mut self, mask: &SequenceMask) -> Result<()> {
        let [left, right] = self.core.inputs(OP)?;
        let loss = Self::compute_loss(
            &mut self.left_minus_right,
            &left.value(),
            &right.value(),
            mask,
        )?;
        self.core.finish_evaluate(OP, loss)
    }

    fn compute_gradient(&mut self, input_index: usize, _mask: &SequenceMask) -> Result<()> {
        let inputs = self.core.inputs(OP)?;
        let g = self.core.upstream_gradient();
        let alpha = match input_index {
            0 => g,
            1 => -g,
            _ => return Err(invalid_gradient_target(OP, input_index)),
        };
        let result = inputs[input_index]
            .gradient_mut()
            .add_with_scale_of(alpha, &self.left_minus_right);
        result
    }

    fn move_to_device(&mut self, device: DeviceId, force: bool) {
        self.core.move_to_device(OP, device, force);
        self.left_minus_right.transfer_to_device(device, force);
    }

    fn set_nan_check(&mut self, enabled: bool) {
        self.core.set_nan_check(enabled);
    }

    fn copy_to(&self, target: &mut Self, flags: CopyNodeFlags) {
        self.core.copy_to(&mut target.core, flags);
        if flags.copy_value {
            target.left_minus_right.copy_from(&self.left_minus_right);
        }
    }
}

// Cross-entropy criteria
//
// CrossEntropyWithSoftmax (label, logits):
//
//   logSoftmax = log_softmax(x1) per column
//   softmax    = exp(logSoftmax)          (kept unmasked for the gradient)
//   loss       = -<x0, mask(logSoftmax)>
//
//   dL/dx0 += -g * logSoftmax
//   dL/dx1 +=  g * mask(softmax - x0)
//
// CrossEntropy (label, probabilities):
//
//   logOfRight = mask(log(x1))
//   loss       = -<x0, logOfRight>
//
//   dL/dx0 += -g * logOfRight
//   dL/dx1 += -g * mask(x0 ./ x1)
//
// Both take the label first. The probabilities variant insists on the label
// being a reader-fed leaf because the element-wise division by x1 would be
// meaningless against a computed left operand.

use tracing::debug;
use trellis_core::{DeviceId, Element, Matrix, Result, SequenceMask};

use crate::node::{
    infer_learnable_dims, invalid_gradient_target, require_input_value, require_not_empty,
    require_same_dims, CopyNodeFlags, Criterion, CriterionCore, NodeRef,
};

/// Shared validation of the two-operand cross-entropy shapes.
fn validate_pair<T: Element>(op: &str, label: &NodeRef<T>, other: &NodeRef<T>) -> Result<()> {
    infer_learnable_dims(op, label, other);
    infer_learnable_dims(op, other, label);
    require_not_empty(op, label)?;
    require_not_empty(op, other)?;
    require_same_dims(op, label, other)
}

// CrossEntropyWithSoftmax

const CE_SOFTMAX_OP: &str = "CrossEntropyWithSoftmax";

#[derive(Debug)]
pub struct CrossEntropyWithSoftmax<T: Element> {
    core: CriterionCore<T, 2>,
    log_softmax: Matrix<T>,
    softmax: Matrix<T>,
    grad_of_logits: Matrix<T>,
}

impl<T: Element> CrossEntropyWithSoftmax<T> {
    pub fn new(name: impl Into<String>) -> Self {
        CrossEntropyWithSoftmax {
            core: CriterionCore::new(name),
            log_softmax: Matrix::default(),
            softmax: Matrix::default(),
            grad_of_logits: Matrix::default(),
        }
    }

    pub fn attach(&mut self, label: NodeRef<T>, logits: NodeRef<T>) {
        self.core.attach([label, logits]);
    }

    /// Column soft-max of the logits from the last forward pass.
    pub fn softmax(&self) -> &Matrix<T> {
        &self.softmax
    }

    pub fn compute_loss(
        log_softmax: &mut Matrix<T>,
        softmax: &mut Matrix<T>,
        label: &Matrix<T>,
        logits: &Matrix<T>,
        mask: &SequenceMask,
    ) -> Result<T> {
        log_softmax.assign_log_softmax_of(logits, true);
        softmax.assign_exp_of(log_softmax);
        mask.mask_columns(log_softmax);
        Ok(-Matrix::inner_product_of_matrices(label, log_softmax)?)
    }
}

impl<T: Element> Criterion<T> for CrossEntropyWithSoftmax<T> {
    fn name(&self) -> &str {
        self.core.name()
    }

    fn operation_name(&self) -> &'static str {
        CE_SOFTMAX_OP
    }

    fn arity(&self) -> usize {
        2
    }

    fn attach_inputs(&mut self, inputs: &[NodeRef<T>]) -> Result<()> {
        self.core.attach_slice(CE_SOFTMAX_OP, inputs)
    }

    fn inputs(&self) -> Vec<NodeRef<T>> {
        self.core.input_list()
    }

    fn output(&self) -> &NodeRef<T> {
        self.core.output()
    }

    fn validate(&mut self) -> Result<()> {
        let [label, logits] = self.core.inputs(CE_SOFTMAX_OP)?;
        validate_pair(CE_SOFTMAX_OP, &label, &logits)?;
        let dims = logits.dims();
        self.log_softmax.resize(dims.rows, dims.cols);
        self.softmax.resize(dims.rows, dims.cols);
        self.core.reset_output();
        debug!(node = self.core.name(), op = CE_SOFTMAX_OP, dims = %dims, "validated");
        Ok(())
    }

    fn evaluate(&mut self, mask: &SequenceMask) -> Result<()> {
        let [label, logits] = self.core.inputs(CE_SOFTMAX_OP)?;
        let loss = Self::compute_loss(
            &mut self.log_softmax,
            &mut self.softmax,
            &label.value(),
            &logits.value(),
            mask,
        )?;
        self.core.finish_evaluate(CE_SOFTMAX_OP, loss)
    }

    fn compute_gradient(&mut self, input_index: usize, mask: &SequenceMask) -> Result<()> {
        let [label, logits] = self.core.inputs(CE_SOFTMAX_OP)?;
        let g = self.core.upstream_gradient();
        match input_index {
            0 => label.gradient_mut().add_with_scale_of(-g, &self.log_softmax),
            1 => {
                self.grad_of_logits
                    .assign_difference_of(&self.softmax, &label.value())?;
                mask.mask_columns(&mut self.grad_of_logits);
                logits.gradient_mut().add_with_scale_of(g, &self.grad_of_logits)
            }
            _ => Err(invalid_gradient_target(CE_SOFTMAX_OP, input_index)),
        }
    }

    fn move_to_device(&mut self, device: DeviceId, force: bool) {
        self.core.move_to_device(CE_SOFTMAX_OP, device, force);
        self.log_softmax.transfer_to_device(device, force);
        self.softmax.transfer_to_device(device, force);
        self.grad_of_logits.transfer_to_device(device, force);
    }

    fn set_nan_check(&mut self, enabled: bool) {
        self.core.set_nan_check(enabled);
    }

    fn copy_to(&self, target: &mut Self, flags: CopyNodeFlags) {
        self.core.copy_to(&mut target.core, flags);
        if flags.copy_value {
            target.log_softmax.copy_from(&self.log_softmax);
            target.softmax.copy_from(&self.softmax);
        }
    }
}

// CrossEntropy

const CE_OP: &str = "CrossEntropy";

#[derive(Debug)]
pub struct CrossEntropy<T: Element> {
    core: CriterionCore<T, 2>,
    log_of_right: Matrix<T>,
    left_div_right: Matrix<T>,
}

impl<T: Element> CrossEntropy<T> {
    pub fn new(name: impl Into<String>) -> Self {
        CrossEntropy {
            core: CriterionCore::new(name),
            log_of_right: Matrix::default(),
            left_div_right: Matrix::default(),
        }
    }

    pub fn attach(&mut self, label: NodeRef<T>, probabilities: NodeRef<T>) {
        self.core.attach([label, probabilities]);
    }

    pub fn compute_loss(
        log_of_right: &mut Matrix<T>,
        label: &Matrix<T>,
        probabilities: &Matrix<T>,
        mask: &SequenceMask,
    ) -> Result<T> {
        log_of_right.copy_from(probabilities);
        log_of_right.inplace_log();
        mask.mask_columns(log_of_right);
        Ok(-Matrix::inner_product_of_matrices(label, log_of_right)?)
    }
}

impl<T: Element> Criterion<T> for CrossEntropy<T> {
    fn name(&self) -> &str {
        self.core.name()
    }

    fn operation_name(&self) -> &'static str {
        CE_OP
    }

    fn arity(&self) -> usize {
        2
    }

    fn attach_inputs(&mut self, inputs: &[NodeRef<T>]) -> Result<()> {
        self.core.attach_slice(CE_OP, inputs)
    }

    fn inputs(&self) -> Vec<NodeRef<T>> {
        self.core.input_list()
    }

    fn output(&self) -> &NodeRef<T> {
        self.core.output()
    }

    fn validate(&mut self) -> Result<()> {
        let [label, probabilities] = self.core.inputs(CE_OP)?;
        require_input_value(CE_OP, &label, "the label (input 0)")?;
        validate_pair(CE_OP, &label, &probabilities)?;
        let dims = probabilities.dims();
        self.log_of_right.resize(dims.rows, dims.cols);
        self.left_div_right.resize(dims.rows, dims.cols);
        self.core.reset_output();
        debug!(node = self.core.name(), op = CE_OP, dims = %dims, "validated");
        Ok(())
    }

    fn evaluate(&mut self, mask: &SequenceMask) -> Result<()> {
        let [label, probabilities] = self.core.inputs(CE_OP)?;
        let loss = Self::compute_loss(
            &mut self.log_of_right,
            &label.value(),
            &probabilities.value(),
            mask,
        )?;
        self.core.finish_evaluate(CE_OP, loss)
    }

    fn compute_gradient(&mut self, input_index: usize, mask: &SequenceMask) -> Result<()> {
        let [label, probabilities] = self.core.inputs(CE_OP)?;
        let g = self.core.upstream_gradient();
        match input_index {
            0 => label.gradient_mut().add_with_scale_of(-g, &self.log_of_right),
            1 => {
                self.left_div_right
                    .assign_element_division_of(&label.value(), &probabilities.value())?;
                mask.mask_columns(&mut self.left_div_right);
                probabilities
                    .gradient_mut()
                    .add_with_scale_of(-g, &self.left_div_right)
            }
            _ => Err(invalid_gradient_target(CE_OP, input_index)),
        }
    }

    fn move_to_device(&mut self, device: DeviceId, force: bool) {
        self.core.move_to_device(CE_OP, device, force);
        self.log_of_right.transfer_to_device(device, force);
        self.left_div_right.transfer_to_device(device, force);
    }

    fn set_nan_check(&mut self, enabled: bool) {
        self.core.set_nan_check(enabled);
    }

    fn copy_to(&self, target: &mut Self, flags: CopyNodeFlags) {
        self.core.copy_to(&mut target.core, flags);
        if flags.copy_value {
            target.log_of_right.copy_from(&self.log_of_right);
            target.left_div_right.copy_from(&self.left_div_right);
        }
    }
}

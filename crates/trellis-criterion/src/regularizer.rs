// Matrix regularizers
//
//   MatrixL1Reg:  loss = sum |mask(x)|          dL/dx += g * sign(mask(x))
//   MatrixL2Reg:  loss = ||mask(x)||_F          dL/dx += g / (loss + eps) * mask(x)
//
// The masked copy of the input is scratch state; the input itself is never
// written. `eps` keeps the L2 gradient finite at x = 0.

use tracing::debug;
use trellis_core::{DeviceId, Element, Matrix, Result, SequenceMask};

use crate::config::DEFAULT_L2_EPSILON;
use crate::node::{
    invalid_gradient_target, require_not_empty, CopyNodeFlags, Criterion, CriterionCore, NodeRef,
};

// MatrixL1Reg

const L1_OP: &str = "MatrixL1Reg";

#[derive(Debug)]
pub struct MatrixL1Reg<T: Element> {
    core: CriterionCore<T, 1>,
    masked_input: Matrix<T>,
    sign: Matrix<T>,
}

impl<T: Element> MatrixL1Reg<T> {
    pub fn new(name: impl Into<String>) -> Self {
        MatrixL1Reg {
            core: CriterionCore::new(name),
            masked_input: Matrix::default(),
            sign: Matrix::default(),
        }
    }

    pub fn attach(&mut self, input: NodeRef<T>) {
        self.core.attach([input]);
    }
}

impl<T: Element> Criterion<T> for MatrixL1Reg<T> {
    fn name(&self) -> &str {
        self.core.name()
    }

    fn operation_name(&self) -> &'static str {
        L1_OP
    }

    fn arity(&self) -> usize {
        1
    }

    fn attach_inputs(&mut self, inputs: &[NodeRef<T>]) -> Result<()> {
        self.core.attach_slice(L1_OP, inputs)
    }

    fn inputs(&self) -> Vec<NodeRef<T>> {
        self.core.input_list()
    }

    fn output(&self) -> &NodeRef<T> {
        self.core.output()
    }

    fn validate(&mut self) -> Result<()> {
        let [input] = self.core.inputs(L1_OP)?;
        require_not_empty(L1_OP, &input)?;
        let dims = input.dims();
        self.masked_input.resize(dims.rows, dims.cols);
        self.sign.resize(dims.rows, dims.cols);
        self.core.reset_output();
        debug!(node = self.core.name(), op = L1_OP, dims = %dims, "validated");
        Ok(())
    }

    fn evaluate(&mut self, mask: &SequenceMask) -> Result<()> {
        let [input] = self.core.inputs(L1_OP)?;
        self.masked_input.copy_from(&input.value());
        mask.mask_columns(&mut self.masked_input);
        let loss = self.masked_input.matrix_norm1();
        self.core.finish_evaluate(L1_OP, loss)
    }

    fn compute_gradient(&mut self, input_index: usize, _mask: &SequenceMask) -> Result<()> {
        if input_index != 0 {
            return Err(invalid_gradient_target(L1_OP, input_index));
        }
        let [input] = self.core.inputs(L1_OP)?;
        let g = self.core.upstream_gradient();
        self.sign.assign_sign_of(&self.masked_input);
        let result = input.gradient_mut().add_with_scale_of(g, &self.sign);
        result
    }

    fn move_to_device(&mut self, device: DeviceId, force: bool) {
        self.core.move_to_device(L1_OP, device, force);
        self.masked_input.transfer_to_device(device, force);
        self.sign.transfer_to_device(device, force);
    }

    fn set_nan_check(&mut self, enabled: bool) {
        self.core.set_nan_check(enabled);
    }

    fn copy_to(&self, target: &mut Self, flags: CopyNodeFlags) {
        self.core.copy_to(&mut target.core, flags);
        if flags.copy_value {
            target.masked_input.copy_from(&self.masked_input);
            target.sign.copy_from(&self.sign);
        }
    }
}

// MatrixL2Reg

const L2_OP: &str = "MatrixL2Reg";

#[derive(Debug)]
pub struct MatrixL2Reg<T: Element> {
    core: CriterionCore<T, 1>,
    masked_input: Matrix<T>,
    epsilon: T,
}

impl<T: Element> MatrixL2Reg<T> {
    pub fn new(name: impl Into<String>) -> Self {
        Self::with_epsilon(name, T::from_f64(DEFAULT_L2_EPSILON))
    }

    pub fn with_epsilon(name: impl Into<String>, epsilon: T) -> Self {
        MatrixL2Reg {
            core: CriterionCore::new(name),
            masked_input: Matrix::default(),
            epsilon,
        }
    }

    pub fn attach(&mut self, input: NodeRef<T>) {
        self.core.attach([input]);
    }

    pub fn epsilon(&self) -> T {
        self.epsilon
    }
}

impl<T: Element> Criterion<T> for MatrixL2Reg<T> {
    fn name(&self) -> &str {
        self.core.name()
    }

    fn operation_name(&self) -> &'static str {
        L2_OP
    }

    fn arity(&self) -> usize {
        1
    }

    fn attach_inputs(&mut self, inputs: &[NodeRef<T>]) -> Result<()> {
        self.core.attach_slice(L2_OP, inputs)
    }

    fn inputs(&self) -> Vec<NodeRef<T>> {
        self.core.input_list()
    }

    fn output(&self) -> &NodeRef<T> {
        self.core.output()
    }

    fn validate(&mut self) -> Result<()> {
        let [input] = self.core.inputs(L2_OP)?;
        require_not_empty(L2_OP, &input)?;
        let dims = input.dims();
        self.masked_input.resize(dims.rows, dims.cols);
        self.core.reset_output();
        debug!(node = self.core.name(), op = L2_OP, dims = %dims, "validated");
        Ok(())
    }

    fn evaluate(&mut self, mask: &SequenceMask) -> Result<()> {
        let [input] = self.core.inputs(L2_OP)?;
        self.masked_input.copy_from(&input.value());
        mask.mask_columns(&mut self.masked_input);
        let loss = self.masked_input.frobenius_norm();
        self.core.finish_evaluate(L2_OP, loss)
    }

    fn compute_gradient(&mut self, input_index: usize, _mask: &SequenceMask) -> Result<()> {
        if input_index != 0 {
            return Err(invalid_gradient_target(L2_OP, input_index));
        }
        let [input] = self.core.inputs(L2_OP)?;
        let g = self.core.upstream_gradient();
        let norm = self.core.output().value().get00();
        let alpha = g / (norm + self.epsilon);
        let result = input.gradient_mut().add_with_scale_of(alpha, &self.masked_input);
        result
    }

    fn move_to_device(&mut self, device: DeviceId, force: bool) {
        self.core.move_to_device(L2_OP, device, force);
        self.masked_input.transfer_to_device(device, force);
    }

    fn set_nan_check(&mut self, enabled: bool) {
        self.core.set_nan_check(enabled);
    }

    fn copy_to(&self, target: &mut Self, flags: CopyNodeFlags) {
        self.core.copy_to(&mut target.core, flags);
        if flags.copy_value {
            target.masked_input.copy_from(&self.masked_input);
            target.epsilon = self.epsilon;
        }
    }
}

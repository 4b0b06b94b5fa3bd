// DummyCriterion — Pass-through for externally computed objectives
//
// Inputs:
//   [0] objective   1 × 1, computed outside the graph
//   [1] derivative  R × N, d(objective)/d(prediction), also computed outside
//   [2] prediction  R × N
//
// The output is the objective as given, and the prediction's gradient is
// the supplied derivative scaled by the upstream gradient. No mask applies.

use tracing::debug;
use trellis_core::{DeviceId, Element, Error, Result, SequenceMask};

use crate::node::{
    invalid_gradient_target, require_input_value, require_not_empty, CopyNodeFlags, Criterion,
    CriterionCore, NodeRef,
};

const OP: &str = "DummyCriterion";

#[derive(Debug)]
pub struct DummyCriterion<T: Element> {
    core: CriterionCore<T, 3>,
}

impl<T: Element> DummyCriterion<T> {
    pub fn new(name: impl Into<String>) -> Self {
        DummyCriterion {
            core: CriterionCore::new(name),
        }
    }

    pub fn attach(&mut self, objective: NodeRef<T>, derivative: NodeRef<T>, prediction: NodeRef<T>) {
        self.core.attach([objective, derivative, prediction]);
    }
}

impl<T: Element> Criterion<T> for DummyCriterion<T> {
    fn name(&self) -> &str {
        self.core.name()
    }

    fn operation_name(&self) -> &'static str {
        OP
    }

    fn arity(&self) -> usize {
        3
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
        let [objective, derivative, prediction] = self.core.inputs(OP)?;
        require_input_value(OP, &objective, "the objective")?;
        require_input_value(OP, &derivative, "the derivative")?;
        for node in [&objective, &derivative, &prediction] {
            require_not_empty(OP, node)?;
        }
        if objective.dims().rows != 1 {
            return Err(Error::shape(
                OP,
                format!("objective must have one row, got {}", objective.dims()),
            ));
        }
        let (d, p) = (derivative.dims(), prediction.dims());
        if d.rows != p.rows {
            return Err(Error::shape(
                OP,
                format!("derivative {} and prediction {} differ in rows", d, p),
            ));
        }
        if d.cols != p.cols {
            debug!(node = self.core.name(), op = OP, from = %d, cols = p.cols, "resizing derivative");
            derivative.value_mut().resize(d.rows, p.cols);
        }
        self.core.reset_output();
        debug!(node = self.core.name(), op = OP, dims = %p, "validated");
        Ok(())
    }

    fn evaluate(&mut self, _mask: &SequenceMask) -> Result<()> {
        let [objective, _, _] = self.core.inputs(OP)?;
        let dims = objective.dims();
        if dims.rows != 1 || dims.cols != 1 {
            return Err(Error::shape(
                OP,
                format!("objective must be 1 x 1, got {}", dims),
            ));
        }
        let loss = objective.value().get00();
        self.core.finish_evaluate(OP, loss)
    }

    fn compute_gradient(&mut self, input_index: usize, _mask: &SequenceMask) -> Result<()> {
        if input_index != 2 {
            return Err(invalid_gradient_target(OP, input_index));
        }
        let [_, derivative, prediction] = self.core.inputs(OP)?;
        let g = self.core.upstream_gradient();
        let result = prediction
            .gradient_mut()
            .add_with_scale_of(g, &derivative.value());
        result
    }

    fn move_to_device(&mut self, device: DeviceId, force: bool) {
        self.core.move_to_device(OP, device, force);
    }

    fn set_nan_check(&mut self, enabled: bool) {
        self.core.set_nan_check(enabled);
    }

    fn copy_to(&self, target: &mut Self, flags: CopyNodeFlags) {
        self.core.copy_to(&mut target.core, flags);
    }
}

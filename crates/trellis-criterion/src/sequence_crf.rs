// SequenceCRF — Linear-chain CRF negative log-likelihood
//
// Inputs:
//   [0] labels  L × N one-hot
//   [1] pos     L × N position-dependent scores
//   [2] pair    L × L transition scores
//
// The N columns are split into S = num_parallel_sequences strides of N / S
// consecutive columns, and each stride is scored as exactly one sequence.
// Packing several variable-length sequences into one stride is not
// supported, and the sequence mask is not applied inside a stride.
//
//   dL/dpos  += g * (posterior - labels)
//   dL/dpair += g * (expected - observed transition counts), per stride

use tracing::{debug, trace};
use trellis_core::{DeviceId, Element, Error, Matrix, Result, SequenceMask};

use crate::crf::{forward_backward, transition_gradient};
use crate::node::{
    invalid_gradient_target, require_not_empty, CopyNodeFlags, Criterion, CriterionCore, NodeRef,
};

const OP: &str = "CRF";

#[derive(Debug)]
pub struct SequenceCRF<T: Element> {
    core: CriterionCore<T, 3>,
    alpha: Matrix<T>,
    beta: Matrix<T>,
    posterior: Matrix<T>,
    /// Number of strides the last forward pass used.
    num_strides: usize,
    first_label: Option<usize>,
    last_label: Option<usize>,
}

impl<T: Element> SequenceCRF<T> {
    pub fn new(name: impl Into<String>) -> Self {
        SequenceCRF {
            core: CriterionCore::new(name),
            alpha: Matrix::default(),
            beta: Matrix::default(),
            posterior: Matrix::default(),
            num_strides: 1,
            first_label: None,
            last_label: None,
        }
    }

    pub fn attach(&mut self, labels: NodeRef<T>, pos: NodeRef<T>, pair: NodeRef<T>) {
        self.core.attach([labels, pos, pair]);
    }

    pub fn alpha(&self) -> &Matrix<T> {
        &self.alpha
    }

    /// Log posterior marginals.
    pub fn beta(&self) -> &Matrix<T> {
        &self.beta
    }

    pub fn posterior(&self) -> &Matrix<T> {
        &self.posterior
    }

    /// First true label of the last sequence scored.
    pub fn first_label(&self) -> Option<usize> {
        self.first_label
    }

    /// Last true label of the last sequence scored.
    pub fn last_label(&self) -> Option<usize> {
        self.last_label
    }

    fn stride_len(num_cols: usize, num_strides: usize) -> Result<usize> {
        if num_strides == 0 || num_cols % num_strides != 0 {
            return Err(Error::shape(
                OP,
                format!(
                    "{} columns cannot be split into {} equal sequences",
                    num_cols, num_strides
                ),
            ));
        }
        Ok(num_cols / num_strides)
    }
}

impl<T: Element> Criterion<T> for SequenceCRF<T> {
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
        let [labels, pos, pair] = self.core.inputs(OP)?;
        for node in [&labels, &pos, &pair] {
            require_not_empty(OP, node)?;
        }
        let (l, p, t) = (labels.dims(), pos.dims(), pair.dims());
        if !(p.rows == t.rows && l.rows == p.rows && l.cols == p.cols && t.is_square()) {
            return Err(Error::shape(
                OP,
                format!(
                    "labels {}, position scores {} and transitions {} do not match",
                    l, p, t
                ),
            ));
        }
        self.alpha.resize(l.rows, l.cols);
        self.beta.resize(l.rows, l.cols);
        self.posterior.resize(l.rows, l.cols);
        self.core.reset_output();
        debug!(node = self.core.name(), op = OP, labels = l.rows, positions = l.cols, "validated");
        Ok(())
    }

    fn evaluate(&mut self, mask: &SequenceMask) -> Result<()> {
        let [labels, pos, pair] = self.core.inputs(OP)?;
        let (labels, pos, pair) = (labels.value(), pos.value(), pair.value());
        let (num_labels, num_cols) = (labels.rows(), labels.cols());
        let num_strides = mask.num_parallel_sequences();
        let step = Self::stride_len(num_cols, num_strides)?;

        self.alpha.resize(num_labels, num_cols);
        self.beta.resize(num_labels, num_cols);
        self.posterior.resize(num_labels, num_cols);

        let (mut alpha, mut beta, mut post) =
            (Matrix::default(), Matrix::default(), Matrix::default());
        let mut loss = T::zero();
        for i in 0..num_strides {
            let start = i * step;
            let label_slice = labels.column_slice(start, step)?;
            let pos_slice = pos.column_slice(start, step)?;
            let outcome = forward_backward(
                &mut alpha,
                &mut beta,
                &mut post,
                &label_slice,
                &pos_slice,
                &pair,
            )?;
            self.alpha.set_column_slice(start, &alpha)?;
            self.beta.set_column_slice(start, &beta)?;
            self.posterior.set_column_slice(start, &post)?;
            self.first_label = Some(outcome.first_label);
            self.last_label = Some(outcome.last_label);
            trace!(node = self.core.name(), stride = i, loss = outcome.loss.as_f64(), "scored sequence");
            loss = loss + outcome.loss;
        }
        self.num_strides = num_strides;
        self.core.finish_evaluate(OP, loss)
    }

    fn compute_gradient(&mut self, input_index: usize, _mask: &SequenceMask) -> Result<()> {
        let [labels, pos, pair] = self.core.inputs(OP)?;
        let g = self.core.upstream_gradient();
        match input_index {
            1 => Matrix::add_scaled_difference(
                g,
                &self.posterior,
                &labels.value(),
                &mut pos.gradient_mut(),
            ),
            2 => {
                let labels = labels.value();
                let pair_value = pair.value();
                let mut grad = pair.gradient_mut();
                let step = Self::stride_len(labels.cols(), self.num_strides)?;
                for i in 0..self.num_strides {
                    let start = i * step;
                    let label_slice = labels.column_slice(start, step)?;
                    let first = crate::crf::active_label(&label_slice, 0)?;
                    transition_gradient(
                        &mut grad,
                        g,
                        &label_slice,
                        &self.alpha.column_slice(start, step)?,
                        &self.beta.column_slice(start, step)?,
                        &pair_value,
                        first,
                    )?;
                }
                Ok(())
            }
            _ => Err(invalid_gradient_target(OP, input_index)),
        }
    }

    fn move_to_device(&mut self, device: DeviceId, force: bool) {
        self.core.move_to_device(OP, device, force);
        self.alpha.transfer_to_device(device, force);
        self.beta.transfer_to_device(device, force);
        self.posterior.transfer_to_device(device, force);
    }

    fn set_nan_check(&mut self, enabled: bool) {
        self.core.set_nan_check(enabled);
    }

    fn copy_to(&self, target: &mut Self, flags: CopyNodeFlags) {
        self.core.copy_to(&mut target.core, flags);
        if flags.copy_value {
            target.alpha.copy_from(&self.alpha);
            target.beta.copy_from(&self.beta);
            target.posterior.copy_from(&self.posterior);
            target.num_strides = self.num_strides;
            target.first_label = self.first_label;
            target.last_label = self.last_label;
        }
    }
}

// ClassBasedCrossEntropyWithSoftmax — Two-level (class, then word) soft-max
//
// Inputs:
//   [0] label   4 × T: word id, class id, first word of the class, one past
//               the last word of the class
//   [1] hidden  H × T observations
//   [2] weight  H × V word embeddings; a class owns the contiguous columns
//               [left, right)
//   [3] class   C × T class logits
//
// For every labelled, valid column t:
//
//   wordLogPost  = log_softmax(h_t^T · W[:, left..right])
//   classLogPost = log_softmax(class[:, t])
//   loss        -= wordLogPost[y - left] + classLogPost[c]
//
// A column whose class range is empty and whose word id is 0 carries no
// label and is skipped. Columns the sequence mask marks invalid are skipped
// too. Either way they contribute nothing to the loss or any gradient.
//
// GRADIENT CACHE:
//
// The word-level soft-max gradient g * (softmax - onehot) is shared by the
// hidden and weight gradients. It is computed on the first backward request
// after a forward pass and reused until the next forward pass marks it
// stale.

use tracing::debug;
use trellis_core::{bail, DeviceId, Element, Error, Matrix, Result, SequenceMask};

use crate::node::{
    invalid_gradient_target, require_input_value, require_not_empty, CopyNodeFlags, Criterion,
    CriterionCore, NodeRef,
};

const OP: &str = "ClassBasedCrossEntropyWithSoftmax";

/// Freshness of the cached word-level soft-max gradient.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SoftmaxGradState {
    /// Invalidated by a forward pass.
    #[default]
    Stale,
    /// Being rebuilt; an error part way leaves it here and forces a rebuild.
    InProgress,
    /// Matches the last forward pass.
    Valid,
}

/// One labelled column and the slice of the word scratch it owns.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClassSegment {
    pub column: usize,
    pub word: usize,
    pub class: usize,
    pub left: usize,
    pub len: usize,
    /// Start of this column's words in the 1 × W scratch rows.
    pub offset: usize,
}

#[derive(Debug)]
pub struct ClassBasedCrossEntropyWithSoftmax<T: Element> {
    core: CriterionCore<T, 4>,
    segments: Vec<ClassSegment>,
    log_softmax: Matrix<T>,
    softmax: Matrix<T>,
    grad_to_softmax_input: Matrix<T>,
    class_log_softmax: Matrix<T>,
    class_softmax: Matrix<T>,
    grad_state: SoftmaxGradState,
}

impl<T: Element> ClassBasedCrossEntropyWithSoftmax<T> {
    pub fn new(name: impl Into<String>) -> Self {
        ClassBasedCrossEntropyWithSoftmax {
            core: CriterionCore::new(name),
            segments: Vec::new(),
            log_softmax: Matrix::default(),
            softmax: Matrix::default(),
            grad_to_softmax_input: Matrix::default(),
            class_log_softmax: Matrix::default(),
            class_softmax: Matrix::default(),
            grad_state: SoftmaxGradState::Stale,
        }
    }

    pub fn attach(
        &mut self,
        label: NodeRef<T>,
        hidden: NodeRef<T>,
        weight: NodeRef<T>,
        class_logits: NodeRef<T>,
    ) {
        self.core.attach([label, hidden, weight, class_logits]);
    }

    pub fn grad_state(&self) -> SoftmaxGradState {
        self.grad_state
    }

    /// Columns that contributed to the last forward pass.
    pub fn segments(&self) -> &[ClassSegment] {
        &self.segments
    }

    /// Total number of in-class words across the contributing columns.
    pub fn total_words(&self) -> usize {
        self.segments.iter().map(|s| s.len).sum()
    }

    /// Read the label matrix into segments, checking every column.
    ///
    /// A column is skipped when the mask sets either `no_label` or
    /// `no_feature` on it, the same rule every other mask-aware criterion
    /// uses, so a `no_feature` gap is dropped here as well.
    pub fn collect_segments(
        label: &Matrix<T>,
        vocab: usize,
        num_classes: usize,
        mask: &SequenceMask,
    ) -> Result<Vec<ClassSegment>> {
        let mut segments = Vec::new();
        let mut offset = 0;
        for t in 0..label.cols() {
            let word = label.at(0, t).as_index();
            let class = label.at(1, t).as_index();
            let left = label.at(2, t).as_index();
            let right = label.at(3, t).as_index();
            if right < left {
                bail!("{}: column {} has class range [{}, {})", OP, t, left, right);
            }
            let len = right - left;
            if len == 0 {
                if word == 0 {
                    continue;
                }
                bail!(
                    "{}: column {} labels word {} but its class is empty",
                    OP,
                    t,
                    word
                );
            }
            if mask.is_invalid(t) {
                continue;
            }
            if word < left || word >= right {
                bail!(
                    "{}: word {} at column {} lies outside its class [{}, {})",
                    OP,
                    word,
                    t,
                    left,
                    right
                );
            }
            if right > vocab {
                bail!(
                    "{}: class range [{}, {}) exceeds a vocabulary of {}",
                    OP,
                    left,
                    right,
                    vocab
                );
            }
            if class >= num_classes {
                bail!(
                    "{}: class {} at column {} but only {} classes",
                    OP,
                    class,
                    t,
                    num_classes
                );
            }
            segments.push(ClassSegment {
                column: t,
                word,
                class,
                left,
                len,
                offset,
            });
            offset += len;
        }
        Ok(segments)
    }

    fn compute_softmax_gradient(&mut self) -> Result<()> {
        if self.grad_state == SoftmaxGradState::Valid {
            return Ok(());
        }
        self.grad_state = SoftmaxGradState::InProgress;
        let g = self.core.upstream_gradient();
        let total = self.total_words();
        self.grad_to_softmax_input.resize(1, total);
        for seg in &self.segments {
            let mut slice = self.softmax.column_slice(seg.offset, seg.len)?;
            let target = seg.word - seg.left;
            slice.set(0, target, slice.at(0, target) - T::one());
            slice.data_mut().iter_mut().for_each(|x| *x = *x * g);
            self.grad_to_softmax_input.set_column_slice(seg.offset, &slice)?;
        }
        self.grad_state = SoftmaxGradState::Valid;
        Ok(())
    }
}

fn dot<T: Element>(a: &[T], b: &[T]) -> T {
    a.iter()
        .zip(b)
        .fold(T::zero(), |acc, (&x, &y)| acc + x * y)
}

impl<T: Element> Criterion<T> for ClassBasedCrossEntropyWithSoftmax<T> {
    fn name(&self) -> &str {
        self.core.name()
    }

    fn operation_name(&self) -> &'static str {
        OP
    }

    fn arity(&self) -> usize {
        4
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
        let [label, hidden, weight, class_logits] = self.core.inputs(OP)?;
        require_input_value(OP, &label, "the label (input 0)")?;
        for node in [&label, &hidden, &weight, &class_logits] {
            require_not_empty(OP, node)?;
        }
        let (l, h, w, c) = (
            label.dims(),
            hidden.dims(),
            weight.dims(),
            class_logits.dims(),
        );
        if h.rows != w.rows {
            return Err(Error::shape(
                OP,
                format!("hidden {} and weight {} differ in rows", h, w),
            ));
        }
        if l.cols != h.cols {
            return Err(Error::shape(
                OP,
                format!("label {} and hidden {} differ in columns", l, h),
            ));
        }
        if l.rows != 4 {
            return Err(Error::shape(
                OP,
                format!("label must have 4 rows, got {}", l),
            ));
        }
        if c.cols != l.cols {
            return Err(Error::shape(
                OP,
                format!("class logits {} and label {} differ in columns", c, l),
            ));
        }
        self.class_log_softmax.resize(c.rows, c.cols);
        self.class_softmax.resize(c.rows, c.cols);
        self.core.reset_output();
        debug!(node = self.core.name(), op = OP, hidden = %h, vocab = w.cols, classes = c.rows, "validated");
        Ok(())
    }

    fn evaluate(&mut self, mask: &SequenceMask) -> Result<()> {
        let [label, hidden, weight, class_logits] = self.core.inputs(OP)?;
        if !label.device().is_cpu() {
            bail!(
                "{}: label matrix must be on the cpu, found {}",
                OP,
                label.device()
            );
        }
        let (label, hidden, weight, class_logits) = (
            label.value(),
            hidden.value(),
            weight.value(),
            class_logits.value(),
        );
        self.grad_state = SoftmaxGradState::Stale;

        self.segments =
            Self::collect_segments(&label, weight.cols(), class_logits.rows(), mask)?;
        let total = self.total_words();
        self.log_softmax.resize(1, total);
        self.softmax.resize(1, total);

        self.class_log_softmax.assign_log_softmax_of(&class_logits, true);
        self.class_softmax.assign_exp_of(&self.class_log_softmax);

        let mut loss = T::zero();
        for seg in &self.segments {
            let obs = hidden.col(seg.column);
            let mut scores = Matrix::zeros(1, seg.len);
            for j in 0..seg.len {
                scores.set(0, j, dot(weight.col(seg.left + j), obs));
            }
            scores.inplace_log_softmax(false);
            self.log_softmax.set_column_slice(seg.offset, &scores)?;
            let word_log_post = scores.at(0, seg.word - seg.left);
            scores.inplace_exp();
            self.softmax.set_column_slice(seg.offset, &scores)?;

            loss = loss - word_log_post - self.class_log_softmax.at(seg.class, seg.column);
        }
        self.core.finish_evaluate(OP, loss)
    }

    fn compute_gradient(&mut self, input_index: usize, _mask: &SequenceMask) -> Result<()> {
        if !(1..=3).contains(&input_index) {
            return Err(invalid_gradient_target(OP, input_index));
        }
        let inputs = self.core.inputs(OP)?;
        self.compute_softmax_gradient()?;
        let g = self.core.upstream_gradient();

        match input_index {
            1 => {
                let weight = inputs[2].value();
                let mut grad = inputs[1].gradient_mut();
                for seg in &self.segments {
                    let out = grad.col_mut(seg.column);
                    for j in 0..seg.len {
                        let gj = self.grad_to_softmax_input.at(0, seg.offset + j);
                        for (o, &w) in out.iter_mut().zip(weight.col(seg.left + j)) {
                            *o = *o + w * gj;
                        }
                    }
                }
            }
            2 => {
                let hidden = inputs[1].value();
                let mut grad = inputs[2].gradient_mut();
                for seg in &self.segments {
                    let obs = hidden.col(seg.column);
                    for j in 0..seg.len {
                        let gj = self.grad_to_softmax_input.at(0, seg.offset + j);
                        for (o, &h) in grad.col_mut(seg.left + j).iter_mut().zip(obs) {
                            *o = *o + h * gj;
                        }
                    }
                }
            }
            _ => {
                let mut grad = inputs[3].gradient_mut();
                for seg in &self.segments {
                    let probs = self.class_softmax.col(seg.column);
                    for (k, (o, &p)) in grad.col_mut(seg.column).iter_mut().zip(probs).enumerate() {
                        let target = if k == seg.class { T::one() } else { T::zero() };
                        *o = *o + g * (p - target);
                    }
                }
            }
        }
        Ok(())
    }

    fn move_to_device(&mut self, device: DeviceId, force: bool) {
        self.core.move_to_device(OP, device, force);
        self.log_softmax.transfer_to_device(device, force);
        self.softmax.transfer_to_device(device, force);
        self.grad_to_softmax_input.transfer_to_device(device, force);
        self.class_log_softmax.transfer_to_device(device, force);
        self.class_softmax.transfer_to_device(device, force);
    }

    fn set_nan_check(&mut self, enabled: bool) {
        self.core.set_nan_check(enabled);
    }

    fn copy_to(&self, target: &mut Self, flags: CopyNodeFlags) {
        self.core.copy_to(&mut target.core, flags);
        if flags.copy_value {
            target.segments = self.segments.clone();
            target.log_softmax.copy_from(&self.log_softmax);
            target.softmax.copy_from(&self.softmax);
            target.grad_to_softmax_input.copy_from(&self.grad_to_softmax_input);
            target.class_log_softmax.copy_from(&self.class_log_softmax);
            target.class_softmax.copy_from(&self.class_softmax);
            target.grad_state = self.grad_state;
        }
    }
}

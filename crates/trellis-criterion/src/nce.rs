// NoiseContrastiveEstimation — Sampled soft-max training with exact evaluation
//
// Inputs:
//   [0] samples  label matrix (see below)
//   [1] hidden   H × T observations
//   [2] weight   H × V output embeddings, one column per word
//   [3] bias     V elements (1 × V or V × 1), addressed linearly
//
// TRAINING (mode None): the label holds 2·S rows per column. Row 2s is a
// sampled word id, row 2s+1 its log noise probability. Sample 0 is the true
// word and its probability is used as stored; samples 1..S are noise words
// whose probabilities are stored negated. With k = S - 1 noise samples:
//
//   score  = bias[w] + W[:, w] · h[:, t]
//   noise  = ln k + p
//   z      = logadd(score, noise)
//   loss  -= (s == 0 ? score - z : noise - z)
//   pred[s, t] = (s == 0 ? 1 : 0) - exp(score - z)
//
// EVALUATION: the label is a single row of word ids. The sign of the ids
// selects the evaluation when the configured mode does not:
//   positive ids -> full soft-max over the vocabulary
//   negative ids -> unnormalized score of word -id
//
// Only the NCE objective has a gradient.

use std::fmt;
use std::io::{Read, Seek, Write};
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};
use trellis_core::persist::{read_u32, rewind_u32, write_u32};
use trellis_core::{bail, log_add, DeviceId, Element, Error, Matrix, Result, SequenceMask};

use crate::node::{
    invalid_gradient_target, require_input_value, require_not_empty, CopyNodeFlags, Criterion,
    CriterionCore, NodeRef,
};

const OP: &str = "NCEBasedCrossEntropyWithSoftmax";

/// Which objective a noise-contrastive node computes. The numeric values
/// are the persisted representation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
#[repr(u32)]
pub enum NceEvalMode {
    /// Exact soft-max over the whole vocabulary.
    Softmax = 0,
    /// Raw score of the labelled word.
    Unnormalized = 1,
    /// The NCE training objective.
    #[default]
    None = 2,
}

impl NceEvalMode {
    pub fn as_u32(self) -> u32 {
        self as u32
    }

    pub fn from_u32(v: u32) -> Option<Self> {
        match v {
            0 => Some(NceEvalMode::Softmax),
            1 => Some(NceEvalMode::Unnormalized),
            2 => Some(NceEvalMode::None),
            _ => None,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            NceEvalMode::Softmax => "softmax",
            NceEvalMode::Unnormalized => "unnormalized",
            NceEvalMode::None => "none",
        }
    }
}

impl fmt::Display for NceEvalMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for NceEvalMode {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "softmax" => Ok(NceEvalMode::Softmax),
            "unnormalized" => Ok(NceEvalMode::Unnormalized),
            "none" => Ok(NceEvalMode::None),
            other => Err(Error::Config(format!("unknown NCE evaluation mode '{}'", other))),
        }
    }
}

#[derive(Debug)]
pub struct NoiseContrastiveEstimation<T: Element> {
    core: CriterionCore<T, 4>,
    mode: NceEvalMode,
    /// The objective the last forward pass actually computed.
    last_objective: Option<NceEvalMode>,
    /// T × V, only filled by the soft-max evaluation.
    log_softmax: Matrix<T>,
    /// S × T derivative of the log-likelihood w.r.t. each sample's score.
    prediction: Matrix<T>,
}

impl<T: Element> NoiseContrastiveEstimation<T> {
    pub fn new(name: impl Into<String>) -> Self {
        Self::with_mode(name, NceEvalMode::None)
    }

    pub fn with_mode(name: impl Into<String>, mode: NceEvalMode) -> Self {
        NoiseContrastiveEstimation {
            core: CriterionCore::new(name),
            mode,
            last_objective: None,
            log_softmax: Matrix::default(),
            prediction: Matrix::default(),
        }
    }

    pub fn attach(
        &mut self,
        samples: NodeRef<T>,
        hidden: NodeRef<T>,
        weight: NodeRef<T>,
        bias: NodeRef<T>,
    ) {
        self.core.attach([samples, hidden, weight, bias]);
    }

    pub fn eval_mode(&self) -> NceEvalMode {
        self.mode
    }

    pub fn set_eval_mode(&mut self, mode: NceEvalMode) {
        self.mode = mode;
    }

    /// The objective computed by the last forward pass.
    pub fn last_objective(&self) -> Option<NceEvalMode> {
        self.last_objective
    }

    /// Per-sample score derivatives of the last NCE forward pass.
    pub fn prediction(&self) -> &Matrix<T> {
        &self.prediction
    }

    /// Persist the evaluation mode as one little-endian u32.
    pub fn save_mode(&self, w: &mut impl Write) -> Result<()> {
        write_u32(w, self.mode.as_u32())?;
        Ok(())
    }

    /// Restore the evaluation mode. A value outside the known modes means
    /// the field was never written: the mode falls back to `None` and the
    /// stream is rewound to just before the value.
    pub fn load_mode<R: Read + Seek>(&mut self, r: &mut R) -> Result<()> {
        let raw = read_u32(r)?;
        match NceEvalMode::from_u32(raw) {
            Some(mode) => self.mode = mode,
            None => {
                warn!(node = self.core.name(), raw, "unknown NCE mode on load, using none");
                self.mode = NceEvalMode::None;
                rewind_u32(r)?;
            }
        }
        Ok(())
    }

    /// Pick the objective for `label`, honouring the configured mode first
    /// and the sign of single-row labels second.
    pub fn select_objective(mode: NceEvalMode, label: &Matrix<T>) -> Result<NceEvalMode> {
        let (mut positive, mut negative) = (0usize, 0usize);
        if label.rows() == 1 {
            for &v in label.data() {
                if v > T::zero() {
                    positive += 1;
                } else if v < T::zero() {
                    negative += 1;
                }
            }
            if positive > 0 && negative > 0 {
                bail!(
                    "{}: single-row label mixes positive ({}) and negative ({}) word ids",
                    OP,
                    positive,
                    negative
                );
            }
        }
        let objective = if mode == NceEvalMode::Softmax || (label.rows() == 1 && positive > 0) {
            NceEvalMode::Softmax
        } else if mode == NceEvalMode::Unnormalized || (label.rows() == 1 && negative > 0) {
            NceEvalMode::Unnormalized
        } else {
            NceEvalMode::None
        };
        Ok(objective)
    }

    /// `-sum_t log softmax(h_t^T W + bias)[label_t]`
    pub fn softmax_loss(
        log_softmax: &mut Matrix<T>,
        label: &Matrix<T>,
        hidden: &Matrix<T>,
        weight: &Matrix<T>,
        bias: &Matrix<T>,
    ) -> Result<T> {
        log_softmax.assign_product_of(hidden, true, weight, false)?;
        let vocab = weight.cols();
        for w in 0..vocab {
            let b = bias.data()[w];
            log_softmax.col_mut(w).iter_mut().for_each(|x| *x = *x + b);
        }
        log_softmax.inplace_log_softmax(false);

        let mut loss = T::zero();
        for t in 0..label.cols() {
            let w = word_id(label.at(0, t), vocab)?;
            loss = loss - log_softmax.at(t, w);
        }
        Ok(loss)
    }

    /// `-sum_t (bias[w] + W[:, w] · h[:, t])` with `w = -label_t`.
    pub fn unnormalized_loss(
        label: &Matrix<T>,
        hidden: &Matrix<T>,
        weight: &Matrix<T>,
        bias: &Matrix<T>,
    ) -> Result<T> {
        let mut loss = T::zero();
        for t in 0..label.cols() {
            let w = word_id(-label.at(0, t), weight.cols())?;
            loss = loss - score(hidden, weight, bias, w, t);
        }
        Ok(loss)
    }

    /// The NCE objective; fills `prediction` for the backward pass.
    pub fn nce_loss(
        prediction: &mut Matrix<T>,
        label: &Matrix<T>,
        hidden: &Matrix<T>,
        weight: &Matrix<T>,
        bias: &Matrix<T>,
    ) -> Result<T> {
        let rows = label.rows();
        if rows < 4 || rows % 2 != 0 {
            return Err(Error::shape(
                OP,
                format!(
                    "training label needs an even number (>= 4) of rows, got {}",
                    rows
                ),
            ));
        }
        let samples = rows / 2;
        let ln_k = T::from_f64(((samples - 1) as f64).ln());
        prediction.resize(samples, label.cols());

        let mut log_likelihood = T::zero();
        for t in 0..label.cols() {
            for s in 0..samples {
                let w = word_id(label.at(2 * s, t), weight.cols())?;
                let stored = label.at(2 * s + 1, t);
                let p = if s == 0 { stored } else { -stored };
                let sc = score(hidden, weight, bias, w, t);
                let noise = ln_k + p;
                let z = log_add(sc, noise);
                log_likelihood = log_likelihood + if s == 0 { sc - z } else { noise - z };
                let target = if s == 0 { T::one() } else { T::zero() };
                prediction.set(s, t, target - (sc - z).exp());
            }
        }
        Ok(-log_likelihood)
    }

    /// Scatter `-g * pred` through the score of every sample into the
    /// gradient of input `input_index` (1, 2, or 3).
    pub fn accumulate_nce_gradient(
        grad: &mut Matrix<T>,
        input_index: usize,
        g: T,
        prediction: &Matrix<T>,
        label: &Matrix<T>,
        hidden: &Matrix<T>,
        weight: &Matrix<T>,
    ) -> Result<()> {
        for t in 0..label.cols() {
            for s in 0..prediction.rows() {
                let w = word_id(label.at(2 * s, t), weight.cols())?;
                let step = g * prediction.at(s, t);
                match input_index {
                    1 => {
                        let wc = weight.col(w);
                        for (o, &x) in grad.col_mut(t).iter_mut().zip(wc) {
                            *o = *o - step * x;
                        }
                    }
                    2 => {
                        let hc = hidden.col(t);
                        for (o, &x) in grad.col_mut(w).iter_mut().zip(hc) {
                            *o = *o - step * x;
                        }
                    }
                    3 => {
                        let b = &mut grad.data_mut()[w];
                        *b = *b - step;
                    }
                    _ => return Err(invalid_gradient_target(OP, input_index)),
                }
            }
        }
        Ok(())
    }
}

/// Interpret a stored label value as a word id below `vocab`.
fn word_id<T: Element>(v: T, vocab: usize) -> Result<usize> {
    if v < T::zero() {
        bail!("{}: negative word id {} where a word index was expected", OP, v);
    }
    let w = v.as_index();
    if w >= vocab {
        bail!("{}: word id {} outside a vocabulary of {}", OP, w, vocab);
    }
    Ok(w)
}

fn score<T: Element>(
    hidden: &Matrix<T>,
    weight: &Matrix<T>,
    bias: &Matrix<T>,
    w: usize,
    t: usize,
) -> T {
    weight
        .col(w)
        .iter()
        .zip(hidden.col(t))
        .fold(bias.data()[w], |acc, (&a, &b)| acc + a * b)
}

impl<T: Element> Criterion<T> for NoiseContrastiveEstimation<T> {
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
        let [samples, hidden, weight, bias] = self.core.inputs(OP)?;
        require_input_value(OP, &samples, "the samples (input 0)")?;
        for node in [&samples, &hidden, &weight, &bias] {
            require_not_empty(OP, node)?;
        }
        let (s, h, w, b) = (samples.dims(), hidden.dims(), weight.dims(), bias.dims());
        if h.rows != w.rows {
            return Err(Error::shape(
                OP,
                format!("hidden {} and weight {} differ in rows", h, w),
            ));
        }
        if s.cols != h.cols {
            return Err(Error::shape(
                OP,
                format!("samples {} and hidden {} differ in columns", s, h),
            ));
        }
        if b.elem_count() != w.cols {
            return Err(Error::shape(
                OP,
                format!("bias {} does not hold one value per word of {}", b, w),
            ));
        }
        self.core.reset_output();
        debug!(node = self.core.name(), op = OP, mode = %self.mode, hidden = %h, weight = %w, "validated");
        Ok(())
    }

    fn evaluate(&mut self, _mask: &SequenceMask) -> Result<()> {
        let [samples, hidden, weight, bias] = self.core.inputs(OP)?;
        let (label, hidden, weight, bias) =
            (samples.value(), hidden.value(), weight.value(), bias.value());

        let objective = Self::select_objective(self.mode, &label)?;
        if objective != self.mode {
            warn!(
                node = self.core.name(),
                configured = %self.mode,
                used = %objective,
                "label signs override the configured NCE mode"
            );
        }
        let loss = match objective {
            NceEvalMode::Softmax => {
                Self::softmax_loss(&mut self.log_softmax, &label, &hidden, &weight, &bias)?
            }
            NceEvalMode::Unnormalized => Self::unnormalized_loss(&label, &hidden, &weight, &bias)?,
            NceEvalMode::None => {
                Self::nce_loss(&mut self.prediction, &label, &hidden, &weight, &bias)?
            }
        };
        self.last_objective = Some(objective);
        self.core.finish_evaluate(OP, loss)
    }

    fn compute_gradient(&mut self, input_index: usize, _mask: &SequenceMask) -> Result<()> {
        if input_index == 0 || input_index > 3 {
            return Err(invalid_gradient_target(OP, input_index));
        }
        if self.mode != NceEvalMode::None || self.last_objective != Some(NceEvalMode::None) {
            bail!(
                "{}: gradients are only defined for the NCE training objective (mode {}, last objective {:?})",
                OP,
                self.mode,
                self.last_objective
            );
        }
        let inputs = self.core.inputs(OP)?;
        let g = self.core.upstream_gradient();
        let label = inputs[0].value();
        let hidden = inputs[1].value();
        let weight = inputs[2].value();
        let mut grad = inputs[input_index].gradient_mut();
        Self::accumulate_nce_gradient(
            &mut grad,
            input_index,
            g,
            &self.prediction,
            &label,
            &hidden,
            &weight,
        )
    }

    fn move_to_device(&mut self, device: DeviceId, force: bool) {
        self.core.move_to_device(OP, device, force);
        self.log_softmax.transfer_to_device(device, force);
        self.prediction.transfer_to_device(device, force);
    }

    fn set_nan_check(&mut self, enabled: bool) {
        self.core.set_nan_check(enabled);
    }

    fn copy_to(&self, target: &mut Self, flags: CopyNodeFlags) {
        self.core.copy_to(&mut target.core, flags);
        if flags.copy_value {
            target.mode = self.mode;
            target.last_objective = self.last_objective;
            target.log_softmax.copy_from(&self.log_softmax);
            target.prediction.copy_from(&self.prediction);
        }
    }
}

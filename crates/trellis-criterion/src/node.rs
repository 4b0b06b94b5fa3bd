// Criterion contract — What every training-criterion node implements
//
// A criterion sits at the top of a dataflow graph. It reads the values of a
// fixed number of input nodes (labels, model outputs, parameters), reduces
// them to one scalar loss, and on the way back adds its contribution into the
// gradients of those inputs.
//
// The surrounding executor drives each node through:
//
//   attach_inputs  bind the input handles once, when the graph is built
//   validate       check shapes and roles, size the scratch tensors
//   evaluate       forward pass for one minibatch
//   compute_gradient(i)  backward pass into input i, reading the upstream
//                        gradient the executor wrote into the output node
//
// HANDLES:
//
// Graph nodes are shared: the same parameter may feed several criteria, and
// a criterion may even receive one node twice. `NodeRef` is an `Rc` to a
// `GraphNode` that keeps its value and its gradient in separate `RefCell`s,
// so a criterion can read one input's value while accumulating into another
// input's gradient even when both are the same node.
//
// GRADIENTS ALWAYS ACCUMULATE:
//
// compute_gradient adds into the target gradient and never overwrites it.
// Zeroing between minibatches is the executor's job (`zero_gradient`).

use std::cell::{Ref, RefCell, RefMut};
use std::rc::Rc;

use tracing::{debug, trace};
use trellis_core::{DeviceId, Dims, Element, Error, Matrix, Result, SequenceMask};

/// What kind of graph node an input is. Several criteria insist that their
/// label input is a data leaf rather than something computed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeRole {
    /// Dense data fed by the reader (features, labels).
    Input,
    /// Sparse data fed by the reader.
    SparseInput,
    /// A trainable parameter; its shape may be inferred at validation.
    LearnableParameter,
    /// The output of another node.
    Computed,
}

impl NodeRole {
    /// Whether the node is a dense reader-fed leaf. Criteria that demand
    /// an input-value label reject sparse leaves.
    pub fn is_input_value(&self) -> bool {
        matches!(self, NodeRole::Input)
    }
}

/// A value/gradient pair owned by the graph.
#[derive(Debug)]
pub struct GraphNode<T: Element> {
    name: String,
    role: NodeRole,
    value: RefCell<Matrix<T>>,
    gradient: RefCell<Matrix<T>>,
}

/// Shared handle to a graph node.
pub type NodeRef<T> = Rc<GraphNode<T>>;

impl<T: Element> GraphNode<T> {
    pub fn new(name: impl Into<String>, role: NodeRole, value: Matrix<T>) -> Self {
        let device = value.device();
        GraphNode {
            name: name.into(),
            role,
            value: RefCell::new(value),
            gradient: RefCell::new(Matrix::empty(device)),
        }
    }

    /// A reader-fed data leaf.
    pub fn input(name: impl Into<String>, value: Matrix<T>) -> NodeRef<T> {
        Rc::new(Self::new(name, NodeRole::Input, value))
    }

    /// A trainable parameter.
    pub fn parameter(name: impl Into<String>, value: Matrix<T>) -> NodeRef<T> {
        Rc::new(Self::new(name, NodeRole::LearnableParameter, value))
    }

    /// The output of some upstream computation.
    pub fn computed(name: impl Into<String>, value: Matrix<T>) -> NodeRef<T> {
        Rc::new(Self::new(name, NodeRole::Computed, value))
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn role(&self) -> NodeRole {
        self.role
    }

    pub fn dims(&self) -> Dims {
        self.value.borrow().dims()
    }

    pub fn device(&self) -> DeviceId {
        self.value.borrow().device()
    }

    pub fn value(&self) -> Ref<'_, Matrix<T>> {
        self.value.borrow()
    }

    pub fn value_mut(&self) -> RefMut<'_, Matrix<T>> {
        self.value.borrow_mut()
    }

    /// Replace the value, e.g. when the reader delivers a new minibatch.
    pub fn set_value(&self, value: Matrix<T>) {
        *self.value.borrow_mut() = value;
    }

    pub fn gradient(&self) -> Ref<'_, Matrix<T>> {
        self.gradient.borrow()
    }

    /// Mutable gradient, resized (zero-filled) to the value's shape first if
    /// the shapes differ.
    pub fn gradient_mut(&self) -> RefMut<'_, Matrix<T>> {
        let dims = self.dims();
        let mut grad = self.gradient.borrow_mut();
        if grad.dims() != dims {
            grad.resize(dims.rows, dims.cols);
        }
        grad
    }

    pub fn zero_gradient(&self) {
        self.gradient_mut().set_value(T::zero());
    }

    /// Fill the gradient with `g`. The executor uses this to hand a criterion
    /// its upstream gradient.
    pub fn seed_gradient(&self, g: T) {
        self.gradient_mut().set_value(g);
    }

    pub fn move_to_device(&self, device: DeviceId, force: bool) {
        self.value.borrow_mut().transfer_to_device(device, force);
        self.gradient.borrow_mut().transfer_to_device(device, force);
    }
}

/// Which parts of a criterion `copy_to` clones.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CopyNodeFlags {
    /// Deep-copy the output value and every scratch tensor.
    pub copy_value: bool,
    /// Attach the target to the same input handles.
    pub copy_children: bool,
}

impl CopyNodeFlags {
    pub fn all() -> Self {
        CopyNodeFlags {
            copy_value: true,
            copy_children: true,
        }
    }

    pub fn value_only() -> Self {
        CopyNodeFlags {
            copy_value: true,
            copy_children: false,
        }
    }
}

/// The contract every criterion node implements.
///
/// The trait is object safe; `CriterionNode` also wraps every variant in a
/// closed enum for static dispatch.
pub trait Criterion<T: Element> {
    /// Instance name.
    fn name(&self) -> &str;

    /// Stable type name of the criterion (e.g. "CrossEntropyWithSoftmax").
    fn operation_name(&self) -> &'static str;

    /// Number of inputs this criterion takes.
    fn arity(&self) -> usize;

    /// Bind the input handles. Fails with a shape error on a wrong count.
    fn attach_inputs(&mut self, inputs: &[NodeRef<T>]) -> Result<()>;

    /// The bound inputs, empty when nothing is attached yet.
    fn inputs(&self) -> Vec<NodeRef<T>>;

    /// The 1×1 output node. Its gradient holds the upstream gradient.
    fn output(&self) -> &NodeRef<T>;

    /// Check input shapes and roles; size the output and scratch tensors.
    fn validate(&mut self) -> Result<()>;

    /// Forward pass: write the scalar loss into the output node.
    fn evaluate(&mut self, mask: &SequenceMask) -> Result<()>;

    /// Backward pass: add this criterion's contribution into the gradient of
    /// input `input_index`, scaled by the upstream gradient.
    fn compute_gradient(&mut self, input_index: usize, mask: &SequenceMask) -> Result<()>;

    /// Migrate the output and every scratch tensor to `device`.
    fn move_to_device(&mut self, device: DeviceId, force: bool);

    /// Turn the non-finite output check on or off.
    fn set_nan_check(&mut self, enabled: bool);

    /// Copy state into another node of the same type.
    fn copy_to(&self, target: &mut Self, flags: CopyNodeFlags)
    where
        Self: Sized;

    /// The scalar loss of the last forward pass.
    fn value(&self) -> T {
        self.output().value().get00()
    }
}

// CriterionCore — State every variant carries
//
// Name, the fixed-arity input list, the output node, and the numeric check
// flag. The arity is a const generic so each variant's input array has the
// right length by construction.

#[derive(Debug)]
pub struct CriterionCore<T: Element, const N: usize> {
    name: String,
    inputs: Option<[NodeRef<T>; N]>,
    output: NodeRef<T>,
    nan_check: bool,
}

impl<T: Element, const N: usize> CriterionCore<T, N> {
    pub fn new(name: impl Into<String>) -> Self {
        let name = name.into();
        let output = GraphNode::computed(name.clone(), Matrix::zeros(1, 1));
        CriterionCore {
            name,
            inputs: None,
            output,
            nan_check: false,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn output(&self) -> &NodeRef<T> {
        &self.output
    }

    pub fn nan_check(&self) -> bool {
        self.nan_check
    }

    pub fn set_nan_check(&mut self, enabled: bool) {
        self.nan_check = enabled;
    }

    pub fn attach(&mut self, inputs: [NodeRef<T>; N]) {
        self.inputs = Some(inputs);
    }

    pub fn attach_slice(&mut self, op: &str, inputs: &[NodeRef<T>]) -> Result<()> {
        let inputs: [NodeRef<T>; N] = inputs.to_vec().try_into().map_err(|v: Vec<_>| {
            Error::shape(op, format!("expects {} inputs, got {}", N, v.len()))
        })?;
        self.attach(inputs);
        Ok(())
    }

    /// The bound inputs, cloned so callers hold no borrow of `self`.
    pub fn inputs(&self, op: &str) -> Result<[NodeRef<T>; N]> {
        self.inputs
            .clone()
            .ok_or_else(|| Error::NotAttached { op: op.to_string() })
    }

    pub fn input_list(&self) -> Vec<NodeRef<T>> {
        self.inputs
            .as_ref()
            .map(|inputs| inputs.to_vec())
            .unwrap_or_default()
    }

    /// The upstream gradient `g`; zero when the executor has not seeded it.
    pub fn upstream_gradient(&self) -> T {
        let grad = self.output.gradient();
        if grad.is_empty() {
            T::zero()
        } else {
            grad.get00()
        }
    }

    /// Size the output to 1×1.
    pub fn reset_output(&self) {
        self.output.value_mut().resize(1, 1);
    }

    /// Store the forward result, checking it when the numeric check is on.
    pub fn finish_evaluate(&self, op: &str, loss: T) -> Result<()> {
        {
            let mut out = self.output.value_mut();
            out.resize(1, 1);
            out.set(0, 0, loss);
        }
        trace!(node = %self.name, op, loss = loss.as_f64(), "evaluated");
        if self.nan_check {
            self.output.value().check_finite(op)?;
        }
        Ok(())
    }

    pub fn move_to_device(&self, op: &str, device: DeviceId, force: bool) {
        debug!(node = %self.name, op, device = %device, force, "moving criterion");
        self.output.move_to_device(device, force);
    }

    /// Copy the output value and/or the input bindings into `target`.
    pub fn copy_to(&self, target: &mut Self, flags: CopyNodeFlags) {
        if flags.copy_value {
            target.output.value_mut().copy_from(&self.output.value());
            target.nan_check = self.nan_check;
        }
        if flags.copy_children {
            target.inputs = self.inputs.clone();
        }
    }
}

// Validation helpers shared by the variants.

pub fn invalid_gradient_target(op: &str, index: usize) -> Error {
    Error::InvalidGradientTarget {
        op: op.to_string(),
        index,
    }
}

/// Fail unless `node` is a dense reader-fed data leaf.
pub fn require_input_value<T: Element>(op: &str, node: &NodeRef<T>, what: &str) -> Result<()> {
    if node.role().is_input_value() {
        return Ok(());
    }
    Err(Error::StructuralPrecondition {
        op: op.to_string(),
        msg: format!(
            "{} must be an input value, but node '{}' is {:?}",
            what,
            node.name(),
            node.role()
        ),
    })
}

/// Fail when `node` holds no elements.
pub fn require_not_empty<T: Element>(op: &str, node: &NodeRef<T>) -> Result<()> {
    if node.dims().is_empty() {
        return Err(Error::shape(
            op,
            format!("input '{}' has no elements ({})", node.name(), node.dims()),
        ));
    }
    Ok(())
}

pub fn require_same_dims<T: Element>(op: &str, a: &NodeRef<T>, b: &NodeRef<T>) -> Result<()> {
    let (left, right) = (a.dims(), b.dims());
    if left != right {
        return Err(Error::DimsMismatch {
            op: op.to_string(),
            left,
            right,
        });
    }
    Ok(())
}

/// A learnable parameter with a zero row (column) count adopts `other`'s.
pub fn infer_learnable_dims<T: Element>(op: &str, node: &NodeRef<T>, other: &NodeRef<T>) {
    if node.role() != NodeRole::LearnableParameter {
        return;
    }
    let (own, theirs) = (node.dims(), other.dims());
    let rows = if own.rows == 0 { theirs.rows } else { own.rows };
    let cols = if own.cols == 0 { theirs.cols } else { own.cols };
    let inferred = Dims::new(rows, cols);
    if inferred != own {
        debug!(op, node = node.name(), from = %own, to = %inferred, "inferred parameter shape");
        node.value_mut().resize(rows, cols);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_gradient_is_lazily_sized() {
        let node = GraphNode::parameter("w", Matrix::<f64>::full(2, 3, 1.0));
        assert!(node.gradient().is_empty());
        node.gradient_mut().set(1, 2, 5.0);
        assert_eq!(node.gradient().dims(), Dims::new(2, 3));
        node.zero_gradient();
        assert_eq!(node.gradient().sum(), 0.0);
    }

    #[test]
    fn test_value_and_gradient_borrow_independently() {
        let node = GraphNode::computed("x", Matrix::<f32>::full(1, 2, 2.0));
        let value = node.value();
        node.gradient_mut().add_with_scale_of(3.0, &value).unwrap();
        drop(value);
        assert_eq!(node.gradient().col(1), &[6.0]);
    }

    #[test]
    fn test_attach_slice_checks_arity() {
        let mut core = CriterionCore::<f64, 2>::new("ce");
        let a = GraphNode::input("a", Matrix::zeros(1, 1));
        assert!(matches!(
            core.attach_slice("Test", &[a.clone()]),
            Err(Error::Shape { .. })
        ));
        assert!(matches!(core.inputs("Test"), Err(Error::NotAttached { .. })));
        core.attach_slice("Test", &[a.clone(), a]).unwrap();
        assert_eq!(core.input_list().len(), 2);
    }

    #[test]
    fn test_upstream_gradient_defaults_to_zero() {
        let core = CriterionCore::<f64, 1>::new("l1");
        assert_eq!(core.upstream_gradient(), 0.0);
        core.output().seed_gradient(0.5);
        assert_eq!(core.upstream_gradient(), 0.5);
    }

    #[test]
    fn test_nan_check_rejects_non_finite_loss() {
        let mut core = CriterionCore::<f64, 1>::new("l2");
        core.finish_evaluate("Test", f64::INFINITY).unwrap();
        core.set_nan_check(true);
        assert!(matches!(
            core.finish_evaluate("Test", f64::NAN),
            Err(Error::NumericAnomaly { .. })
        ));
    }

    #[test]
    fn test_infer_learnable_dims_only_for_parameters() {
        let label = GraphNode::input("y", Matrix::<f64>::zeros(4, 3));
        let param = GraphNode::parameter("w", Matrix::<f64>::zeros(0, 3));
        let data = GraphNode::input("x", Matrix::<f64>::zeros(0, 3));
        infer_learnable_dims("Test", &param, &label);
        infer_learnable_dims("Test", &data, &label);
        assert_eq!(param.dims(), Dims::new(4, 3));
        assert_eq!(data.dims(), Dims::new(0, 3));
    }

    #[test]
    fn test_require_input_value() {
        let leaf = GraphNode::input("y", Matrix::<f32>::zeros(1, 1));
        let computed = GraphNode::computed("p", Matrix::<f32>::zeros(1, 1));
        let sparse: NodeRef<f32> =
            Rc::new(GraphNode::new("s", NodeRole::SparseInput, Matrix::zeros(1, 1)));
        assert!(require_input_value("Test", &leaf, "label").is_ok());
        assert!(matches!(
            require_input_value("Test", &computed, "label"),
            Err(Error::StructuralPrecondition { .. })
        ));
        assert!(matches!(
            require_input_value("Test", &sparse, "label"),
            Err(Error::StructuralPrecondition { .. })
        ));
    }
}

// Integration tests for the criterion nodes
//
// These tests drive the nodes the way a graph executor would: validate once,
// evaluate per minibatch, seed the upstream gradient, and pull gradients for
// each differentiable input. Analytic gradients are checked against central
// finite differences of the forward pass.

use std::rc::Rc;

use proptest::collection::vec;
use proptest::prelude::*;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use trellis::prelude::*;

fn approx_eq(a: f64, b: f64, tol: f64) -> bool {
    (a - b).abs() < tol
}

fn assert_vec_approx(got: &[f64], expected: &[f64], tol: f64) {
    assert_eq!(
        got.len(),
        expected.len(),
        "length mismatch: {} vs {}",
        got.len(),
        expected.len()
    );
    for (i, (g, e)) in got.iter().zip(expected.iter()).enumerate() {
        assert!(
            approx_eq(*g, *e, tol),
            "index {}: got {} expected {} (tol {})",
            i,
            g,
            e,
            tol
        );
    }
}

/// Compare the gradient of input `index` against central differences.
fn check_gradient(
    node: &mut dyn Criterion<f64>,
    input: &NodeRef<f64>,
    index: usize,
    mask: &SequenceMask,
    tol: f64,
) -> trellis::Result<()> {
    node.evaluate(mask)?;
    input.zero_gradient();
    node.output().seed_gradient(1.0);
    node.compute_gradient(index, mask)?;
    let analytic = input.gradient().data().to_vec();

    let eps = 1e-6;
    let mut numeric = Vec::with_capacity(analytic.len());
    for i in 0..analytic.len() {
        let orig = input.value().data()[i];
        input.value_mut().data_mut()[i] = orig + eps;
        node.evaluate(mask)?;
        let up = node.value();
        input.value_mut().data_mut()[i] = orig - eps;
        node.evaluate(mask)?;
        let down = node.value();
        input.value_mut().data_mut()[i] = orig;
        numeric.push((up - down) / (2.0 * eps));
    }
    node.evaluate(mask)?;
    assert_vec_approx(&analytic, &numeric, tol);
    Ok(())
}

fn logits() -> Matrix<f64> {
    Matrix::from_rows(&[[0.2, -1.0, 0.7], [1.5, 0.3, -0.4], [-0.6, 0.9, 0.1]]).unwrap()
}

// SquareError / CrossEntropy

#[test]
fn test_square_error_gradients_match_finite_differences() -> trellis::Result<()> {
    let a = GraphNode::computed("a", logits());
    let b = GraphNode::parameter("b", Matrix::full(3, 3, 0.25));
    let mut node = SquareError::new("mse");
    node.attach(a.clone(), b.clone());
    node.validate()?;
    let mask = SequenceMask::single(3);
    check_gradient(&mut node, &a, 0, &mask, 1e-6)?;
    check_gradient(&mut node, &b, 1, &mask, 1e-6)?;
    Ok(())
}

#[test]
fn test_softmax_ce_gradient_with_mask_matches_finite_differences() -> trellis::Result<()> {
    let label = GraphNode::input("y", Matrix::one_hot(3, &[1, 0, 2])?);
    let z = GraphNode::computed("z", logits());
    let mut node = CrossEntropyWithSoftmax::new("ce");
    node.attach(label, z.clone());
    node.validate()?;
    let mut mask = SequenceMask::single(3);
    mask.set_gap(0, 1)?;
    check_gradient(&mut node, &z, 1, &mask, 1e-6)?;
    assert_vec_approx(z.gradient().col(1), &[0.0, 0.0, 0.0], 1e-12);
    Ok(())
}

#[test]
fn test_cross_entropy_gradient_matches_finite_differences() -> trellis::Result<()> {
    let label = GraphNode::input("y", Matrix::from_rows(&[[1.0, 0.0], [0.0, 0.3], [0.0, 0.7]])?);
    let p = GraphNode::computed("p", Matrix::from_rows(&[[0.6, 0.2], [0.3, 0.5], [0.1, 0.3]])?);
    let mut node = CrossEntropy::new("ce");
    node.attach(label, p.clone());
    node.validate()?;
    check_gradient(&mut node, &p, 1, &SequenceMask::single(2), 1e-5)?;
    Ok(())
}

// Masking and parallel-sequence layout

/// One criterion input. `per_step` inputs carry one column per minibatch
/// column; the others (class-based word weights) are shared by all columns.
struct CaseInput {
    role: NodeRole,
    value: Matrix<f64>,
    per_step: bool,
}

fn per_step(role: NodeRole, value: Matrix<f64>) -> CaseInput {
    CaseInput { role, value, per_step: true }
}

struct Case {
    kind: CriterionKind,
    inputs: Vec<CaseInput>,
    /// Inputs the criterion differentiates.
    targets: Vec<usize>,
}

struct Outcome {
    value: f64,
    grads: Vec<Matrix<f64>>,
}

fn uniform(rng: &mut StdRng, rows: usize, cols: usize, lo: f64, hi: f64) -> Matrix<f64> {
    let data = (0..rows * cols).map(|_| rng.gen_range(lo..hi)).collect();
    Matrix::from_col_major(rows, cols, data).unwrap()
}

/// Random inputs over `cols` minibatch columns for every mask-aware criterion.
fn mask_aware_cases(cols: usize, rng: &mut StdRng) -> Vec<Case> {
    let labels: Vec<usize> = (0..cols).map(|_| rng.gen_range(0..3)).collect();
    let one_hot = Matrix::one_hot(3, &labels).unwrap();

    // Classes {0, 1} and {2, 3, 4}.
    let mut class_label = Vec::with_capacity(4 * cols);
    for _ in 0..cols {
        let word = rng.gen_range(0..5usize);
        let (class, left, right) = if word < 2 { (0, 0, 2) } else { (1, 2, 5) };
        class_label.extend([word as f64, class as f64, left as f64, right as f64]);
    }

    vec![
        Case {
            kind: CriterionKind::SquareError,
            inputs: vec![
                per_step(NodeRole::Computed, uniform(rng, 3, cols, -1.0, 1.0)),
                per_step(NodeRole::Input, uniform(rng, 3, cols, -1.0, 1.0)),
            ],
            targets: vec![0, 1],
        },
        Case {
            kind: CriterionKind::CrossEntropyWithSoftmax,
            inputs: vec![
                per_step(NodeRole::Input, one_hot.clone()),
                per_step(NodeRole::Computed, uniform(rng, 3, cols, -2.0, 2.0)),
            ],
            targets: vec![0, 1],
        },
        Case {
            kind: CriterionKind::CrossEntropy,
            inputs: vec![
                per_step(NodeRole::Input, one_hot),
                per_step(NodeRole::Computed, uniform(rng, 3, cols, 0.1, 1.0)),
            ],
            targets: vec![0, 1],
        },
        Case {
            kind: CriterionKind::MatrixL1Reg,
            inputs: vec![per_step(NodeRole::LearnableParameter, uniform(rng, 3, cols, -1.0, 1.0))],
            targets: vec![0],
        },
        Case {
            kind: CriterionKind::MatrixL2Reg,
            inputs: vec![per_step(NodeRole::LearnableParameter, uniform(rng, 3, cols, -1.0, 1.0))],
            targets: vec![0],
        },
        Case {
            kind: CriterionKind::ClassBasedCrossEntropyWithSoftmax,
            inputs: vec![
                per_step(NodeRole::Input, Matrix::from_col_major(4, cols, class_label).unwrap()),
                per_step(NodeRole::Computed, uniform(rng, 2, cols, -1.0, 1.0)),
                CaseInput {
                    role: NodeRole::LearnableParameter,
                    value: uniform(rng, 2, 5, -1.0, 1.0),
                    per_step: false,
                },
                per_step(NodeRole::Computed, uniform(rng, 2, cols, -1.0, 1.0)),
            ],
            targets: vec![1, 2, 3],
        },
    ]
}

/// Build the criterion over fresh nodes holding `values`, run one forward
/// and one backward pass for every target.
fn run_case(
    case: &Case,
    values: Vec<Matrix<f64>>,
    mask: &SequenceMask,
) -> trellis::Result<Outcome> {
    let nodes: Vec<NodeRef<f64>> = case
        .inputs
        .iter()
        .zip(values)
        .map(|(input, value)| Rc::new(GraphNode::new("x", input.role, value)))
        .collect();
    let mut node = new_criterion::<f64>(case.kind, "under-test", &CriterionConfig::default());
    node.attach_inputs(&nodes)?;
    node.validate()?;
    node.evaluate(mask)?;
    node.output().seed_gradient(1.0);
    let mut grads = Vec::with_capacity(case.targets.len());
    for &i in &case.targets {
        node.compute_gradient(i, mask)?;
        grads.push(nodes[i].gradient().clone());
    }
    Ok(Outcome { value: node.value(), grads })
}

/// New column `i` is old column `order[i]`.
fn select_columns(m: &Matrix<f64>, order: &[usize]) -> trellis::Result<Matrix<f64>> {
    let data = order.iter().flat_map(|&c| m.col(c).iter().copied()).collect();
    Matrix::from_col_major(m.rows(), order.len(), data)
}

/// Move parallel-sequence slot `s` to slot `perm[s]` at every time step.
fn permute_slots(m: &Matrix<f64>, perm: &[usize]) -> trellis::Result<Matrix<f64>> {
    let num_seq = perm.len();
    let mut order = vec![0; m.cols()];
    for t in 0..m.cols() / num_seq {
        for (s, &to) in perm.iter().enumerate() {
            order[t * num_seq + to] = t * num_seq + s;
        }
    }
    select_columns(m, &order)
}

#[test]
fn test_masking_equals_removing_columns() -> trellis::Result<()> {
    let mut rng = StdRng::seed_from_u64(11);
    let (cols, dropped) = (4, 1);
    let kept: Vec<usize> = (0..cols).filter(|&c| c != dropped).collect();

    for no_label in [true, false] {
        let mut mask = SequenceMask::single(cols);
        if no_label {
            mask.set_no_label(0, dropped)?;
        } else {
            mask.set_no_feature(0, dropped)?;
        }
        for case in mask_aware_cases(cols, &mut rng) {
            let full: Vec<Matrix<f64>> = case.inputs.iter().map(|i| i.value.clone()).collect();
            let trimmed: Vec<Matrix<f64>> = case
                .inputs
                .iter()
                .map(|i| {
                    if i.per_step {
                        select_columns(&i.value, &kept)
                    } else {
                        Ok(i.value.clone())
                    }
                })
                .collect::<trellis::Result<_>>()?;

            let masked = run_case(&case, full, &mask)?;
            let removed = run_case(&case, trimmed, &SequenceMask::single(kept.len()))?;
            assert!(
                approx_eq(masked.value, removed.value, 1e-12),
                "{}: {} vs {}",
                case.kind,
                masked.value,
                removed.value
            );

            for ((&i, got), want) in case.targets.iter().zip(&masked.grads).zip(&removed.grads) {
                if !case.inputs[i].per_step {
                    assert_vec_approx(got.data(), want.data(), 1e-12);
                    continue;
                }
                for (j, &c) in kept.iter().enumerate() {
                    assert_vec_approx(got.col(c), want.col(j), 1e-12);
                }
                assert!(
                    got.col(dropped).iter().all(|&v| v == 0.0),
                    "{}: input {} has gradient in the masked column",
                    case.kind,
                    i
                );
            }
        }
    }
    Ok(())
}

/// Slots, time steps, a slot permutation, padded cells and a data seed.
fn slot_layout() -> impl Strategy<Value = (usize, Vec<usize>, Vec<(usize, usize, bool)>, u64)> {
    (2usize..=3, 2usize..=3).prop_flat_map(|(num_seq, steps)| {
        (
            Just(steps),
            Just((0..num_seq).collect::<Vec<usize>>()).prop_shuffle(),
            vec((0..num_seq, 0..steps, any::<bool>()), 0..=3),
            any::<u64>(),
        )
    })
}

proptest! {
    #[test]
    fn prop_slot_order_does_not_change_output((steps, perm, gaps, seed) in slot_layout()) {
        let num_seq = perm.len();
        let mut mask = SequenceMask::dense(num_seq, steps);
        let mut permuted_mask = SequenceMask::dense(num_seq, steps);
        for &(s, t, no_label) in &gaps {
            if no_label {
                mask.set_no_label(s, t).unwrap();
                permuted_mask.set_no_label(perm[s], t).unwrap();
            } else {
                mask.set_no_feature(s, t).unwrap();
                permuted_mask.set_no_feature(perm[s], t).unwrap();
            }
        }

        let mut rng = StdRng::seed_from_u64(seed);
        for case in mask_aware_cases(num_seq * steps, &mut rng) {
            let original: Vec<Matrix<f64>> = case.inputs.iter().map(|i| i.value.clone()).collect();
            let permuted: Vec<Matrix<f64>> = case
                .inputs
                .iter()
                .map(|i| if i.per_step { permute_slots(&i.value, &perm).unwrap() } else { i.value.clone() })
                .collect();
            let a = run_case(&case, original, &mask).unwrap();
            let b = run_case(&case, permuted, &permuted_mask).unwrap();
            prop_assert!((a.value - b.value).abs() < 1e-10, "{}: {} vs {}", case.kind, a.value, b.value);
        }
    }

    #[test]
    fn prop_crf_stride_order_does_not_change_output((steps, perm, _gaps, seed) in slot_layout()) {
        let num_seq = perm.len();
        let cols = num_seq * steps;
        let mut rng = StdRng::seed_from_u64(seed);
        let labels: Vec<usize> = (0..cols).map(|_| rng.gen_range(0..3)).collect();
        let one_hot = Matrix::one_hot(3, &labels).unwrap();
        let pos = uniform(&mut rng, 3, cols, -1.0, 1.0);
        let pair = uniform(&mut rng, 3, 3, -1.0, 1.0);

        // Each stride is `steps` consecutive columns.
        let mut order = vec![0; cols];
        for (i, &to) in perm.iter().enumerate() {
            for k in 0..steps {
                order[to * steps + k] = i * steps + k;
            }
        }
        let mask = SequenceMask::dense(num_seq, steps);
        let case = Case {
            kind: CriterionKind::SequenceCRF,
            inputs: vec![
                per_step(NodeRole::Input, one_hot.clone()),
                per_step(NodeRole::Computed, pos.clone()),
                CaseInput { role: NodeRole::LearnableParameter, value: pair.clone(), per_step: false },
            ],
            targets: vec![1, 2],
        };
        let a = run_case(&case, vec![one_hot.clone(), pos.clone(), pair.clone()], &mask).unwrap();
        let b = run_case(
            &case,
            vec![
                select_columns(&one_hot, &order).unwrap(),
                select_columns(&pos, &order).unwrap(),
                pair,
            ],
            &mask,
        )
        .unwrap();
        prop_assert!((a.value - b.value).abs() < 1e-10, "{} vs {}", a.value, b.value);
        // The transition gradient sums over strides, so it ignores their order.
        for (x, y) in a.grads[1].data().iter().zip(b.grads[1].data()) {
            prop_assert!((x - y).abs() < 1e-10);
        }
    }
}

#[test]
fn test_gradients_accumulate_across_calls() -> trellis::Result<()> {
    let label = GraphNode::input("y", Matrix::one_hot(3, &[2, 2, 0])?);
    let z = GraphNode::computed("z", logits());
    let mut node = CrossEntropyWithSoftmax::new("ce");
    node.attach(label, z.clone());
    node.validate()?;
    let mask = SequenceMask::single(3);
    node.evaluate(&mask)?;
    node.output().seed_gradient(1.0);
    node.compute_gradient(1, &mask)?;
    let once = z.gradient().data().to_vec();
    node.compute_gradient(1, &mask)?;
    let twice: Vec<f64> = once.iter().map(|v| 2.0 * v).collect();
    assert_vec_approx(z.gradient().data(), &twice, 1e-12);
    Ok(())
}

// Regularizers

#[test]
fn test_regularizer_gradients_match_finite_differences() -> trellis::Result<()> {
    let w = GraphNode::parameter("w", logits());
    let mask = SequenceMask::single(3);

    let mut l1 = MatrixL1Reg::new("l1");
    l1.attach(w.clone());
    l1.validate()?;
    check_gradient(&mut l1, &w, 0, &mask, 1e-6)?;

    let mut l2 = MatrixL2Reg::new("l2");
    l2.attach(w.clone());
    l2.validate()?;
    check_gradient(&mut l2, &w, 0, &mask, 1e-6)?;
    Ok(())
}

// NCE

#[test]
fn test_nce_gradients_match_finite_differences() -> trellis::Result<()> {
    // Two samples (one true word, one noise word) per column, vocabulary of 4.
    let samples = GraphNode::input(
        "samples",
        Matrix::from_rows(&[
            [1.0, 3.0],
            [-1.2, -0.7],
            [2.0, 0.0],
            [1.6, 1.1],
        ])?,
    );
    let hidden = GraphNode::computed("h", Matrix::from_rows(&[[0.3, -0.5], [0.8, 0.1]])?);
    let weight = GraphNode::parameter(
        "W",
        Matrix::from_rows(&[[0.1, -0.4, 0.2, 0.6], [0.3, 0.5, -0.1, 0.0]])?,
    );
    let bias = GraphNode::parameter("b", Matrix::from_rows(&[[0.05, -0.1, 0.2, 0.0]])?);
    let mut node = NoiseContrastiveEstimation::new("nce");
    node.attach(samples, hidden.clone(), weight.clone(), bias.clone());
    node.validate()?;

    let mask = SequenceMask::single(2);
    check_gradient(&mut node, &hidden, 1, &mask, 1e-6)?;
    check_gradient(&mut node, &weight, 2, &mask, 1e-6)?;
    check_gradient(&mut node, &bias, 3, &mask, 1e-6)?;
    Ok(())
}

// Class-based soft-max

#[test]
fn test_class_based_gradients_match_finite_differences() -> trellis::Result<()> {
    // Classes {0, 1} and {2, 3, 4}; the middle column carries no label.
    let label = GraphNode::input(
        "label",
        Matrix::from_rows(&[
            [1.0, 0.0, 4.0],
            [0.0, 0.0, 1.0],
            [0.0, 0.0, 2.0],
            [2.0, 0.0, 5.0],
        ])?,
    );
    let hidden = GraphNode::computed("h", Matrix::from_rows(&[[0.4, 1.0, -0.3], [0.2, -2.0, 0.9]])?);
    let weight = GraphNode::parameter(
        "W",
        Matrix::from_rows(&[[0.1, -0.2, 0.3, 0.4, -0.5], [0.5, 0.0, -0.6, 0.2, 0.7]])?,
    );
    let class = GraphNode::computed("cls", Matrix::from_rows(&[[0.3, 0.0, -0.2], [0.1, 0.0, 0.4]])?);
    let mut node = ClassBasedCrossEntropyWithSoftmax::new("cbce");
    node.attach(label, hidden.clone(), weight.clone(), class.clone());
    node.validate()?;

    let mask = SequenceMask::single(3);
    check_gradient(&mut node, &hidden, 1, &mask, 1e-6)?;
    check_gradient(&mut node, &weight, 2, &mask, 1e-6)?;
    check_gradient(&mut node, &class, 3, &mask, 1e-6)?;
    assert_eq!(node.segments().len(), 2);
    assert_vec_approx(hidden.gradient().col(1), &[0.0, 0.0], 1e-12);
    Ok(())
}

// Dispatch

#[test]
fn test_boxed_and_enum_dispatch_agree() -> trellis::Result<()> {
    let config = CriterionConfig::default();
    let a = GraphNode::computed("a", logits());
    let b = GraphNode::input("b", Matrix::zeros(3, 3));
    let mask = SequenceMask::single(3);

    let mut boxed: Vec<Box<dyn Criterion<f64>>> = vec![
        Box::new(SquareError::new("mse")),
        Box::new(new_criterion::<f64>(CriterionKind::SquareError, "mse2", &config)),
    ];
    let mut values = Vec::new();
    for node in boxed.iter_mut() {
        node.attach_inputs(&[a.clone(), b.clone()])?;
        node.validate()?;
        node.evaluate(&mask)?;
        values.push(node.value());
    }
    assert!(approx_eq(values[0], values[1], 1e-15));
    assert_eq!(boxed[1].operation_name(), "SquareError");
    Ok(())
}

#[test]
fn test_copy_to_clones_value_and_inputs() -> trellis::Result<()> {
    let label = GraphNode::input("y", Matrix::one_hot(3, &[0, 1, 2])?);
    let z = GraphNode::computed("z", logits());
    let mut src = CrossEntropyWithSoftmax::new("src");
    src.attach(label, z);
    src.validate()?;
    src.evaluate(&SequenceMask::single(3))?;

    let mut value_only = CrossEntropyWithSoftmax::new("a");
    src.copy_to(&mut value_only, CopyNodeFlags::value_only());
    assert_eq!(value_only.value(), src.value());
    assert!(value_only.inputs().is_empty());

    let mut everything = CrossEntropyWithSoftmax::new("b");
    src.copy_to(&mut everything, CopyNodeFlags::all());
    assert_eq!(everything.inputs().len(), 2);
    assert_eq!(everything.softmax(), src.softmax());
    Ok(())
}

#[test]
fn test_move_to_device_keeps_values() -> trellis::Result<()> {
    let w = GraphNode::parameter("w", logits());
    let mut node = MatrixL2Reg::new("l2");
    node.attach(w);
    node.validate()?;
    node.evaluate(&SequenceMask::single(3))?;
    let before = node.value();
    node.move_to_device(DeviceId::Gpu(0), false);
    assert_eq!(node.output().device(), DeviceId::Gpu(0));
    node.move_to_device(DeviceId::Gpu(0), false);
    assert_eq!(node.value(), before);
    Ok(())
}

#[test]
fn test_config_file_drives_factory() -> trellis::Result<()> {
    let config = CriterionConfig::from_toml_str(
        r#"
        [criterion]
        nan_check = true
        nce_eval_mode = "unnormalized"
        "#,
    )?;
    let node = new_criterion::<f32>(
        "NCEBasedCrossEntropyWithSoftmax".parse()?,
        "nce",
        &config,
    );
    match node {
        CriterionNode::NoiseContrastiveEstimation(n) => {
            assert_eq!(n.eval_mode(), NceEvalMode::Unnormalized)
        }
        other => panic!("unexpected {}", other.kind()),
    }
    Ok(())
}

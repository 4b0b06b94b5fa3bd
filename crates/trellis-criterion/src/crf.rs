// CRF forward-backward engine
//
// Pure functions over explicit matrices, for one label sequence of N
// positions over L labels:
//
//   labels  L × N  one-hot true label per position
//   pos     L × N  position-dependent scores
//   pair    L × L  transition scores, pair[to, from]
//
// The partition function starts from the true first label: position 0 is
// entered through pair[k, first], as if a virtual step -1 sat on `first`.
// The true path score has no entry transition; it only counts the
// transitions between consecutive positions of the sequence.
//
//   alpha[k, t] = pos[k, t] + logadd_j(prev_j + pair[k, j])
//                 prev_j = alpha[j, t-1], or (j == first ? 0 : -inf) at t = 0
//   logZ        = logadd_k alpha[k, N-1]
//
// `beta` holds log posterior marginals (not the unnormalized backward
// variable), so posterior = exp(beta):
//
//   beta[k, N-1] = alpha[k, N-1] - logZ
//   beta[k, t]   = logadd_j( beta[j, t+1] + alpha[k, t] + pair[j, k]
//                            - logadd_m(alpha[m, t] + pair[j, m]) )
//
// The loss of a sequence is logZ - pathScore (negative log-likelihood).

use trellis_core::{bail, log_add, Element, Matrix, Result};

/// Result of running forward-backward on one sequence.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CrfOutcome<T: Element> {
    pub loss: T,
    pub log_partition: T,
    pub path_score: T,
    pub first_label: usize,
    pub last_label: usize,
}

/// The first row of column `t` holding a nonzero label.
pub fn active_label<T: Element>(labels: &Matrix<T>, t: usize) -> Result<usize> {
    match labels.col(t).iter().position(|&v| v != T::zero()) {
        Some(k) => Ok(k),
        None => bail!("CRF: position {} has no active label", t),
    }
}

/// Fill `alpha` (resized to L × N) with forward log scores.
pub fn forward_compute<T: Element>(
    alpha: &mut Matrix<T>,
    pos: &Matrix<T>,
    pair: &Matrix<T>,
    first: usize,
) {
    let (num_labels, num_pos) = (pos.rows(), pos.cols());
    alpha.resize(num_labels, num_pos);
    for t in 0..num_pos {
        for k in 0..num_labels {
            let mut acc = T::log_zero();
            for j in 0..num_labels {
                let prev = if t == 0 {
                    if j == first {
                        T::zero()
                    } else {
                        T::log_zero()
                    }
                } else {
                    alpha.at(j, t - 1)
                };
                acc = log_add(acc, prev + pair.at(k, j));
            }
            alpha.set(k, t, acc + pos.at(k, t));
        }
    }
}

/// `logadd_k alpha[k, N-1]`.
pub fn log_partition<T: Element>(alpha: &Matrix<T>) -> T {
    alpha
        .col(alpha.cols() - 1)
        .iter()
        .fold(T::log_zero(), |acc, &v| log_add(acc, v))
}

/// `out[j] = logadd_m(prev[m] + pair[j, m])` for every target label j.
fn incoming_log_sums<T: Element>(prev: &[T], pair: &Matrix<T>, out: &mut Vec<T>) {
    out.clear();
    for j in 0..pair.rows() {
        let s = prev
            .iter()
            .enumerate()
            .fold(T::log_zero(), |acc, (m, &p)| log_add(acc, p + pair.at(j, m)));
        out.push(s);
    }
}

/// Fill `beta` (resized like `alpha`) with log posterior marginals.
pub fn backward_compute<T: Element>(
    beta: &mut Matrix<T>,
    alpha: &Matrix<T>,
    pair: &Matrix<T>,
    log_z: T,
) {
    let (num_labels, num_pos) = (alpha.rows(), alpha.cols());
    beta.resize(num_labels, num_pos);
    if num_pos == 0 {
        return;
    }
    for k in 0..num_labels {
        beta.set(k, num_pos - 1, alpha.at(k, num_pos - 1) - log_z);
    }
    let mut incoming = Vec::with_capacity(num_labels);
    for t in (0..num_pos - 1).rev() {
        incoming_log_sums(alpha.col(t), pair, &mut incoming);
        for k in 0..num_labels {
            let mut acc = T::log_zero();
            for (j, &lse) in incoming.iter().enumerate() {
                acc = log_add(
                    acc,
                    beta.at(j, t + 1) + alpha.at(k, t) + pair.at(j, k) - lse,
                );
            }
            beta.set(k, t, acc);
        }
    }
}

/// `posterior = exp(beta)`.
pub fn posterior_compute<T: Element>(posterior: &mut Matrix<T>, beta: &Matrix<T>) {
    posterior.assign_exp_of(beta);
}

/// Score of the labelled path: `Σ_t pos[y_t, t] + Σ_t pair[y_{t+1}, y_t]`.
pub fn path_score<T: Element>(
    labels: &Matrix<T>,
    pos: &Matrix<T>,
    pair: &Matrix<T>,
) -> Result<T> {
    let mut score = Matrix::inner_product_of_matrices(labels, pos)?;
    if labels.cols() == 0 {
        return Ok(score);
    }
    let mut prev = active_label(labels, 0)?;
    for t in 1..labels.cols() {
        let cur = active_label(labels, t)?;
        score = score + pair.at(cur, prev);
        prev = cur;
    }
    Ok(score)
}

/// Accumulate `g * (expected - observed)` transition counts into `grad`.
///
/// Expected counts include the entry step from `first` into position 0;
/// observed counts start at the transition into position 1.
pub fn transition_gradient<T: Element>(
    grad: &mut Matrix<T>,
    g: T,
    labels: &Matrix<T>,
    alpha: &Matrix<T>,
    beta: &Matrix<T>,
    pair: &Matrix<T>,
    first: usize,
) -> Result<()> {
    let num_labels = pair.rows();
    let start: Vec<T> = (0..num_labels)
        .map(|i| if i == first { T::zero() } else { T::log_zero() })
        .collect();
    let mut incoming = Vec::with_capacity(num_labels);
    let mut prev_label = None;
    for t in 0..alpha.cols() {
        let prev = if t == 0 { &start[..] } else { alpha.col(t - 1) };
        incoming_log_sums(prev, pair, &mut incoming);
        for (j, &lse) in incoming.iter().enumerate() {
            let b = beta.at(j, t);
            for (i, &p) in prev.iter().enumerate() {
                let expected = (p + pair.at(j, i) - lse + b).exp();
                grad[(j, i)] = grad[(j, i)] + g * expected;
            }
        }
        let cur = active_label(labels, t)?;
        if let Some(from) = prev_label {
            grad[(cur, from)] = grad[(cur, from)] - g;
        }
        prev_label = Some(cur);
    }
    Ok(())
}

/// Run forward-backward on one sequence and return its loss.
pub fn forward_backward<T: Element>(
    alpha: &mut Matrix<T>,
    beta: &mut Matrix<T>,
    posterior: &mut Matrix<T>,
    labels: &Matrix<T>,
    pos: &Matrix<T>,
    pair: &Matrix<T>,
) -> Result<CrfOutcome<T>> {
    if labels.cols() == 0 {
        bail!("CRF: cannot score an empty sequence");
    }
    let first_label = active_label(labels, 0)?;
    let last_label = active_label(labels, labels.cols() - 1)?;
    forward_compute(alpha, pos, pair, first_label);
    let log_z = log_partition(alpha);
    backward_compute(beta, alpha, pair, log_z);
    posterior_compute(posterior, beta);
    let score = path_score(labels, pos, pair)?;
    Ok(CrfOutcome {
        loss: log_z - score,
        log_partition: log_z,
        path_score: score,
        first_label,
        last_label,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    fn run(labels: &[usize], pos: &Matrix<f64>, pair: &Matrix<f64>) -> (CrfOutcome<f64>, Matrix<f64>, Matrix<f64>, Matrix<f64>) {
        let labels = Matrix::one_hot(pos.rows(), labels).unwrap();
        let (mut a, mut b, mut p) = (Matrix::default(), Matrix::default(), Matrix::default());
        let out = forward_backward(&mut a, &mut b, &mut p, &labels, pos, pair).unwrap();
        (out, a, b, p)
    }

    #[test]
    fn test_single_position_reduces_to_softmax() {
        let pos = Matrix::from_rows(&[[1.0], [2.0], [0.5]]).unwrap();
        let pair = Matrix::zeros(3, 3);
        let (out, alpha, beta, post) = run(&[1], &pos, &pair);
        let lse = (1.0f64.exp() + 2.0f64.exp() + 0.5f64.exp()).ln();
        assert_abs_diff_eq!(out.loss, lse - 2.0, epsilon = 1e-12);
        for k in 0..3 {
            assert_abs_diff_eq!(alpha.at(k, 0), pos.at(k, 0), epsilon = 1e-12);
            assert_abs_diff_eq!(beta.at(k, 0), pos.at(k, 0) - lse, epsilon = 1e-12);
        }
        assert_abs_diff_eq!(post.col(0).iter().sum::<f64>(), 1.0, epsilon = 1e-12);
    }

    #[test]
    fn test_posterior_columns_are_distributions() {
        let pos = Matrix::from_rows(&[[0.3, -1.0, 2.0, 0.1], [1.2, 0.4, -0.3, 0.0]]).unwrap();
        let pair = Matrix::from_rows(&[[0.5, -0.2], [0.1, 0.7]]).unwrap();
        let (out, _, _, post) = run(&[0, 1, 1, 0], &pos, &pair);
        assert!(out.loss > 0.0);
        assert_eq!((out.first_label, out.last_label), (0, 0));
        for t in 0..4 {
            assert_abs_diff_eq!(post.col(t).iter().sum::<f64>(), 1.0, epsilon = 1e-10);
        }
    }

    #[test]
    fn test_partition_matches_enumeration() {
        let pos = Matrix::from_rows(&[[0.3, -1.0, 2.0], [1.2, 0.4, -0.3]]).unwrap();
        let pair = Matrix::from_rows(&[[0.5, -0.2], [0.1, 0.7]]).unwrap();
        let first = 1;
        let mut total = f64::NEG_INFINITY;
        for y0 in 0..2 {
            for y1 in 0..2 {
                for y2 in 0..2 {
                    let s = pos.at(y0, 0) + pos.at(y1, 1) + pos.at(y2, 2)
                        + pair.at(y0, first) + pair.at(y1, y0) + pair.at(y2, y1);
                    total = log_add(total, s);
                }
            }
        }
        let (out, _, _, _) = run(&[1, 0, 1], &pos, &pair);
        assert_abs_diff_eq!(out.log_partition, total, epsilon = 1e-12);
    }

    #[test]
    fn test_path_score_has_no_entry_transition() {
        // Entering label 0 from itself is worth 3, but only the partition
        // function sees that step.
        let pos = Matrix::from_rows(&[[1.0], [2.0]]).unwrap();
        let pair = Matrix::from_rows(&[[3.0, 0.0], [0.0, 0.0]]).unwrap();
        let (out, _, _, _) = run(&[0], &pos, &pair);
        assert_abs_diff_eq!(out.path_score, 1.0, epsilon = 1e-12);
        assert_abs_diff_eq!(out.log_partition, log_add(4.0, 2.0), epsilon = 1e-12);
        assert_abs_diff_eq!(out.loss, log_add(4.0, 2.0) - 1.0, epsilon = 1e-12);
    }

    #[test]
    fn test_path_score_counts_inner_transitions() {
        let pos = Matrix::from_rows(&[[0.3, -1.0, 2.0], [1.2, 0.4, -0.3]]).unwrap();
        let pair = Matrix::from_rows(&[[0.5, -0.2], [0.1, 0.7]]).unwrap();
        let labels = Matrix::one_hot(2, &[1, 0, 0]).unwrap();
        // 1.2 - 1.0 + 2.0, then 1 -> 0 and 0 -> 0
        let want = 2.2 + pair.at(0, 1) + pair.at(0, 0);
        assert_abs_diff_eq!(path_score(&labels, &pos, &pair).unwrap(), want, epsilon = 1e-12);
    }

    #[test]
    fn test_transition_gradient_sums_to_one_entry_step() {
        let pos = Matrix::from_rows(&[[0.3, -1.0, 2.0], [1.2, 0.4, -0.3]]).unwrap();
        let pair = Matrix::from_rows(&[[0.5, -0.2], [0.1, 0.7]]).unwrap();
        let labels = Matrix::one_hot(2, &[0, 1, 1]).unwrap();
        let (out, alpha, beta, _) = run(&[0, 1, 1], &pos, &pair);
        let mut grad = Matrix::zeros(2, 2);
        transition_gradient(&mut grad, 1.0, &labels, &alpha, &beta, &pair, out.first_label).unwrap();
        // every step carries one unit of expected mass; the observed path
        // has one transition fewer than it has positions
        assert_abs_diff_eq!(grad.sum(), 1.0, epsilon = 1e-10);
    }

    #[test]
    fn test_missing_label_is_logic_error() {
        let labels = Matrix::<f64>::zeros(2, 1);
        assert!(active_label(&labels, 0).is_err());
    }
}

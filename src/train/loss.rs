//! Causal language-modeling loss

use crate::autograd::{BackwardOp, GradCell};
use crate::data::IGNORE_INDEX;
use crate::Tensor;
use ndarray::{s, Array1};
use std::rc::Rc;

/// Mean next-token cross entropy
///
/// `logits` is `[batch * seq_len, vocab]`; position `t` of a row is scored
/// against the label at `t + 1` of the same row. Labels equal to
/// [`IGNORE_INDEX`] contribute nothing. Returns a one-element tensor and the
/// number of scored targets; with no targets the loss is 0 and carries no
/// gradient.
pub fn causal_lm_loss(logits: &Tensor, labels: &[i64], batch: usize, seq_len: usize, vocab: usize) -> (Tensor, usize) {
    assert_eq!(labels.len(), batch * seq_len, "labels must be batch x seq_len");
    assert_eq!(logits.len(), batch * seq_len * vocab, "logits must be rows x vocab");

    // (logit row, target id)
    let targets: Vec<(usize, usize)> = (0..batch)
        .flat_map(|b| (0..seq_len.saturating_sub(1)).map(move |t| (b * seq_len + t, b * seq_len + t + 1)))
        .filter_map(|(row, next)| match labels[next] {
            IGNORE_INDEX => None,
            id => Some((row, id as usize)),
        })
        .collect();

    if targets.is_empty() {
        return (Tensor::from_vec(vec![0.0], false), 0);
    }

    let data = logits.data();
    let mut total = 0.0f64;
    let mut probs = Vec::with_capacity(targets.len());
    for &(row, target) in &targets {
        let offset = row * vocab;
        let (p, log_z) = softmax_row(data.slice(s![offset..offset + vocab]).to_vec());
        total += f64::from(log_z - data[offset + target]);
        probs.push(p);
    }
    let n = targets.len();
    let loss = (total / n as f64) as f32;

    let mut result = Tensor::from_vec(vec![loss], logits.requires_grad());
    if logits.requires_grad() {
        let op = CausalLmLossBackward {
            logits: logits.clone(),
            targets,
            probs,
            vocab,
            result_grad: result.grad_cell(),
        };
        result.set_backward_op(Rc::new(op));
    }
    (result, n)
}

/// Softmax of a row and its log-partition
fn softmax_row(mut row: Vec<f32>) -> (Vec<f32>, f32) {
    let max = row.iter().copied().fold(f32::NEG_INFINITY, f32::max);
    let mut sum = 0.0f32;
    for v in row.iter_mut() {
        *v = (*v - max).exp();
        sum += *v;
    }
    for v in row.iter_mut() {
        *v /= sum;
    }
    (row, max + sum.ln())
}

struct CausalLmLossBackward {
    logits: Tensor,
    targets: Vec<(usize, usize)>,
    probs: Vec<Vec<f32>>,
    vocab: usize,
    result_grad: GradCell,
}

impl BackwardOp for CausalLmLossBackward {
    fn backward(&self) {
        let Some(upstream) = self.result_grad.borrow().as_ref().map(|g| g[0]) else {
            return;
        };
        let scale = upstream / self.targets.len() as f32;
        let mut grad = Array1::<f32>::zeros(self.logits.len());
        for (&(row, target), probs) in self.targets.iter().zip(&self.probs) {
            let offset = row * self.vocab;
            for (j, &p) in probs.iter().enumerate() {
                grad[offset + j] += p * scale;
            }
            grad[offset + target] -= scale;
        }
        self.logits.accumulate_grad(grad);
    }

    fn inputs(&self) -> Vec<&Tensor> {
        vec![&self.logits]
    }
}

/// Mean of `losses`, or 0 when empty
pub(crate) fn mean(losses: &[f32]) -> f32 {
    if losses.is_empty() {
        0.0
    } else {
        losses.iter().sum::<f32>() / losses.len() as f32
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::autograd::backward;
    use approx::assert_abs_diff_eq;
    use proptest::prelude::*;

    #[test]
    fn test_uniform_logits_give_log_vocab() {
        let logits = Tensor::zeros(2 * 3 * 4, true);
        let labels = vec![0, 1, 2, 3, 0, 1];
        let (loss, n) = causal_lm_loss(&logits, &labels, 2, 3, 4);

        assert_eq!(n, 4);
        assert_abs_diff_eq!(loss.data()[0], 4.0f32.ln(), epsilon = 1e-6);
    }

    #[test]
    fn test_labels_are_shifted() {
        // One row of two positions: position 0 predicts label[1] = 2
        let logits = Tensor::from_vec(vec![0.0, 0.0, 10.0, -5.0, -5.0, -5.0], true);
        let (loss, n) = causal_lm_loss(&logits, &[1, 2], 1, 2, 3);

        assert_eq!(n, 1);
        assert!(loss.data()[0] < 1e-3);
    }

    #[test]
    fn test_ignored_labels_are_skipped() {
        let logits = Tensor::from_vec(vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0], true);
        let (all, n_all) = causal_lm_loss(&logits, &[0, 1, 0], 1, 3, 2);
        let (masked, n_masked) = causal_lm_loss(&logits, &[0, 1, IGNORE_INDEX], 1, 3, 2);

        assert_eq!(n_all, 2);
        assert_eq!(n_masked, 1);
        // First target alone: logits [1, 2] against class 1
        let expected = (1.0f32.exp() + 2.0f32.exp()).ln() - 2.0;
        assert_abs_diff_eq!(masked.data()[0], expected, epsilon = 1e-5);
        assert!(all.data()[0] != masked.data()[0]);
    }

    #[test]
    fn test_fully_masked_batch() {
        let logits = Tensor::zeros(4 * 2, true);
        let (loss, n) = causal_lm_loss(&logits, &[IGNORE_INDEX; 4], 2, 2, 2);

        assert_eq!(n, 0);
        assert_eq!(loss.data()[0], 0.0);
        assert!(loss.backward_op().is_none());
    }

    #[test]
    fn test_gradient_matches_finite_difference() {
        let values = vec![0.2, -0.4, 1.1, 0.5, -0.3, 0.8, 0.0, 0.9, -1.2];
        let labels = [0, 2, 1];
        let logits = Tensor::from_vec(values.clone(), true);
        let (loss, _) = causal_lm_loss(&logits, &labels, 1, 3, 3);
        backward(&loss, None);
        let analytic = logits.grad().unwrap();

        let eps = 1e-3;
        for i in 0..values.len() {
            let mut plus = values.clone();
            plus[i] += eps;
            let mut minus = values.clone();
            minus[i] -= eps;
            let f = |v: Vec<f32>| causal_lm_loss(&Tensor::from_vec(v, false), &labels, 1, 3, 3).0.data()[0];
            let numeric = (f(plus) - f(minus)) / (2.0 * eps);
            assert_abs_diff_eq!(analytic[i], numeric, epsilon = 1e-3);
        }
        // The last position predicts nothing
        assert!(analytic.iter().skip(6).all(|&g| g == 0.0));
    }

    #[test]
    fn test_upstream_scale_is_applied() {
        let logits = Tensor::from_vec(vec![0.5, -0.5, 0.0, 0.0], true);
        let (loss, _) = causal_lm_loss(&logits, &[0, 1], 1, 2, 2);
        backward(&loss, Some(ndarray::arr1(&[0.5])));
        let half = logits.grad().unwrap();

        let logits_full = Tensor::from_vec(vec![0.5, -0.5, 0.0, 0.0], true);
        let (loss_full, _) = causal_lm_loss(&logits_full, &[0, 1], 1, 2, 2);
        backward(&loss_full, None);
        let full = logits_full.grad().unwrap();

        for (h, f) in half.iter().zip(full.iter()) {
            assert_abs_diff_eq!(*h * 2.0, *f, epsilon = 1e-6);
        }
    }

    proptest! {
        #[test]
        fn prop_loss_is_non_negative(values in prop::collection::vec(-5.0f32..5.0, 12)) {
            let logits = Tensor::from_vec(values, false);
            let (loss, _) = causal_lm_loss(&logits, &[0, 1, 2, 0], 1, 4, 3);
            prop_assert!(loss.data()[0] >= -1e-6);
        }
    }
}

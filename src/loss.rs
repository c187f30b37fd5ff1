//! Cross-Entropy Loss
//!
//! Mean negative log-likelihood of the target ids over every position of
//! every sequence in the batch:
//!
//! ```text
//! loss = -(1/N) Σ log softmax(logits[b, t])[target[b, t]]      N = B × T
//! ```
//!
//! Its gradient with respect to the logits is `(softmax(logits) - onehot) / N`,
//! which is where backpropagation starts.

use crate::error::{ModelError, Result};
use crate::tensor::Tensor;
use rayon::prelude::*;

/// Check that `targets` matches the `[B, T, V]` logits and return `(N, V)`
fn check_targets(logits: &Tensor, targets: &[Vec<usize>]) -> Result<(usize, usize)> {
    let vocab = logits.last_dim();
    let flat_targets: usize = targets.iter().map(Vec::len).sum();
    let expected_shape = vec![targets.len(), targets.first().map_or(0, Vec::len), vocab];

    if logits.shape != expected_shape || flat_targets * vocab != logits.numel() {
        return Err(ModelError::ShapeMismatch {
            name: "targets".into(),
            expected: logits.shape.clone(),
            actual: expected_shape,
        });
    }
    if flat_targets == 0 {
        return Err(ModelError::EmptyBatch);
    }
    if let Some(&id) = targets.iter().flatten().find(|&&id| id >= vocab) {
        return Err(ModelError::TokenOutOfRange {
            id,
            vocab_size: vocab,
        });
    }
    Ok((flat_targets, vocab))
}

/// `(max, log Σ exp(x - max))` of one row
fn log_sum_exp(row: &[f32]) -> (f32, f32) {
    let max = row.iter().fold(f32::NEG_INFINITY, |a, &b| a.max(b));
    let sum: f32 = row.iter().map(|&x| (x - max).exp()).sum();
    (max, sum.ln())
}

/// Mean cross-entropy of `logits` (`[B, T, V]`) against `targets` (`B` rows of `T` ids)
pub fn cross_entropy(logits: &Tensor, targets: &[Vec<usize>]) -> Result<f32> {
    let (n, vocab) = check_targets(logits, targets)?;
    let flat: Vec<usize> = targets.iter().flatten().copied().collect();

    let total: f32 = logits
        .data
        .par_chunks(vocab)
        .zip(flat.par_iter())
        .map(|(row, &target)| {
            let (max, lse) = log_sum_exp(row);
            lse - (row[target] - max)
        })
        .sum();

    Ok(total / n as f32)
}

/// Cross-entropy and its gradient with respect to `logits`
pub fn cross_entropy_with_grad(logits: &Tensor, targets: &[Vec<usize>]) -> Result<(f32, Tensor)> {
    let (n, vocab) = check_targets(logits, targets)?;
    let flat: Vec<usize> = targets.iter().flatten().copied().collect();
    let inv_n = 1.0 / n as f32;

    let mut grad = vec![0.0; logits.numel()];
    let total: f32 = grad
        .par_chunks_mut(vocab)
        .zip(logits.data.par_chunks(vocab))
        .zip(flat.par_iter())
        .map(|((g, row), &target)| {
            let (max, lse) = log_sum_exp(row);
            for (gi, &x) in g.iter_mut().zip(row) {
                *gi = (x - max - lse).exp() * inv_n;
            }
            g[target] -= inv_n;
            lse - (row[target] - max)
        })
        .sum();

    Ok((total * inv_n, Tensor::new(grad, logits.shape.clone())))
}

/// `exp(loss)`, capped to avoid overflow in logs
pub fn perplexity(loss: f32) -> f32 {
    loss.min(80.0).exp()
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_uniform_logits_give_log_vocab() {
        let logits = Tensor::zeros(vec![2, 3, 5]);
        let loss = cross_entropy(&logits, &[vec![0, 1, 2], vec![3, 4, 0]]).unwrap();
        assert_relative_eq!(loss, (5.0f32).ln(), epsilon = 1e-6);
    }

    #[test]
    fn test_confident_correct_prediction_has_low_loss() {
        let logits = Tensor::new(vec![10.0, 0.0, 0.0], vec![1, 1, 3]);
        assert!(cross_entropy(&logits, &[vec![0]]).unwrap() < 1e-3);
        assert!(cross_entropy(&logits, &[vec![1]]).unwrap() > 9.0);
    }

    #[test]
    fn test_gradient_matches_finite_difference() {
        let logits = Tensor::new(vec![0.5, -1.0, 2.0, 0.1, 0.3, -0.2], vec![1, 2, 3]);
        let targets = [vec![2, 0]];
        let (loss, grad) = cross_entropy_with_grad(&logits, &targets).unwrap();
        assert_relative_eq!(loss, cross_entropy(&logits, &targets).unwrap(), epsilon = 1e-6);

        let h = 1e-3;
        for i in 0..logits.numel() {
            let mut plus = logits.clone();
            plus.data[i] += h;
            let mut minus = logits.clone();
            minus.data[i] -= h;
            let numeric = (cross_entropy(&plus, &targets).unwrap()
                - cross_entropy(&minus, &targets).unwrap())
                / (2.0 * h);
            assert_relative_eq!(grad.data[i], numeric, epsilon = 1e-3);
        }
    }

    #[test]
    fn test_target_validation() {
        let logits = Tensor::zeros(vec![1, 2, 3]);
        assert!(matches!(
            cross_entropy(&logits, &[vec![0, 3]]),
            Err(ModelError::TokenOutOfRange { id: 3, vocab_size: 3 })
        ));
        assert!(matches!(
            cross_entropy(&logits, &[vec![0]]),
            Err(ModelError::ShapeMismatch { .. })
        ));
    }
}

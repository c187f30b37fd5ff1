//! Gradient Storage and Clipping
//!
//! Backward passes write parameter gradients into a [`Gradients`] map keyed by
//! the same dotted names the model uses for its parameters
//! (`blocks.0.attn.q_proj.weight`, `ln_f.gamma`, ...). The optimizer looks the
//! gradients up by name, so the map, the state dict and the optimizer state
//! always line up.
//!
//! ## Gradient Clipping
//!
//! Deep transformers occasionally produce very large gradients. Clipping
//! rescales every gradient by the same factor when the global L2 norm exceeds a
//! threshold, which keeps the update direction and bounds its size.
//!
//! ```text
//! norm = sqrt(sum over all tensors of sum(g²))
//! if norm > max_norm: g *= max_norm / norm
//! ```

use crate::tensor::Tensor;
use rayon::prelude::*;
use std::collections::BTreeMap;

/// Parameter gradients keyed by parameter name
#[derive(Debug, Clone, Default)]
pub struct Gradients {
    grads: BTreeMap<String, Tensor>,
}

impl Gradients {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add `grad` into the entry for `name`, creating it if absent
    ///
    /// A parameter used more than once in the graph receives the sum of its
    /// gradient contributions.
    pub fn accumulate(&mut self, name: impl Into<String>, grad: Tensor) {
        let name = name.into();
        match self.grads.get_mut(&name) {
            Some(existing) => existing.add_assign(&grad),
            None => {
                self.grads.insert(name, grad);
            }
        }
    }

    pub fn get(&self, name: &str) -> Option<&Tensor> {
        self.grads.get(name)
    }

    pub fn len(&self) -> usize {
        self.grads.len()
    }

    pub fn is_empty(&self) -> bool {
        self.grads.is_empty()
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.grads.keys().map(String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Tensor)> {
        self.grads.iter().map(|(k, v)| (k.as_str(), v))
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = (&str, &mut Tensor)> {
        self.grads.iter_mut().map(|(k, v)| (k.as_str(), v))
    }
}

/// Compute the global L2 norm of all gradients
///
/// Each tensor's sum of squares is computed in parallel.
pub fn compute_grad_norm(grads: &Gradients) -> f32 {
    let sum_sq: f32 = grads
        .grads
        .values()
        .collect::<Vec<_>>()
        .par_iter()
        .map(|g| g.sum_squares())
        .sum();
    sum_sq.sqrt()
}

/// Clip gradients to a maximum global norm
///
/// Returns the norm measured before clipping, which the training loop logs.
pub fn clip_gradients(grads: &mut Gradients, max_norm: f32) -> f32 {
    let norm = compute_grad_norm(grads);

    if norm > max_norm {
        let scale = max_norm / norm;
        for (_, grad) in grads.iter_mut() {
            grad.data.par_iter_mut().for_each(|val| *val *= scale);
        }
    }

    norm
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_accumulate_sums_repeated_names() {
        let mut grads = Gradients::new();
        grads.accumulate("w", Tensor::new(vec![1.0, 2.0], vec![2]));
        grads.accumulate("w", Tensor::new(vec![0.5, 0.5], vec![2]));
        assert_eq!(grads.len(), 1);
        assert_eq!(grads.get("w").unwrap().data, vec![1.5, 2.5]);
    }

    #[test]
    fn test_norm_spans_all_tensors() {
        let mut grads = Gradients::new();
        grads.accumulate("a", Tensor::new(vec![3.0], vec![1]));
        grads.accumulate("b", Tensor::new(vec![4.0], vec![1]));
        assert_relative_eq!(compute_grad_norm(&grads), 5.0);
    }

    #[test]
    fn test_clip_scales_to_max_norm() {
        let mut grads = Gradients::new();
        grads.accumulate("a", Tensor::new(vec![3.0, 0.0], vec![2]));
        grads.accumulate("b", Tensor::new(vec![4.0], vec![1]));

        let before = clip_gradients(&mut grads, 1.0);
        assert_relative_eq!(before, 5.0);
        assert_relative_eq!(compute_grad_norm(&grads), 1.0, epsilon = 1e-6);
        assert_relative_eq!(grads.get("a").unwrap().data[0], 0.6, epsilon = 1e-6);
    }

    #[test]
    fn test_clip_leaves_small_gradients_alone() {
        let mut grads = Gradients::new();
        grads.accumulate("a", Tensor::new(vec![0.1, 0.2], vec![2]));
        clip_gradients(&mut grads, 1.0);
        assert_eq!(grads.get("a").unwrap().data, vec![0.1, 0.2]);
    }
}

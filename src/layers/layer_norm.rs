//! Layer Normalization
//!
//! Normalizes each position's feature vector to zero mean and unit variance,
//! then applies a learned scale (gamma) and shift (beta).
//!
//! ## Forward Pass
//!
//! ```text
//! mean   = sum(x) / N
//! var    = sum((x - mean)²) / N        (population variance)
//! x_norm = (x - mean) / √(var + ε)
//! y      = γ * x_norm + β
//! ```
//!
//! ## Backward Pass
//!
//! ```text
//! grad_γ      = sum over rows of (grad_y * x_norm)
//! grad_β      = sum over rows of grad_y
//! grad_x_norm = grad_y * γ
//! grad_x      = (grad_x_norm - mean(grad_x_norm) - x_norm * mean(grad_x_norm * x_norm)) / √(var + ε)
//! ```
//!
//! The two mean terms account for every element of a row contributing to that
//! row's mean and variance.

use super::{param_name, Parameters};
use crate::gradients::Gradients;
use crate::tensor::Tensor;
use rayon::prelude::*;

pub const LAYER_NORM_EPS: f32 = 1e-5;

#[derive(Debug, Clone)]
pub struct LayerNorm {
    pub gamma: Tensor,
    pub beta: Tensor,
    pub eps: f32,
}

#[derive(Debug, Clone)]
pub struct LayerNormCache {
    pub x_norm: Tensor,
    /// `√(var + ε)` per row, shape `[..., 1]`
    pub std: Tensor,
}

impl LayerNorm {
    pub fn new(normalized_shape: usize) -> Self {
        Self {
            gamma: Tensor::ones(vec![normalized_shape]),
            beta: Tensor::zeros(vec![normalized_shape]),
            eps: LAYER_NORM_EPS,
        }
    }

    pub fn forward(&self, x: &Tensor) -> Tensor {
        self.forward_with_cache(x).0
    }

    pub fn forward_with_cache(&self, x: &Tensor) -> (Tensor, LayerNormCache) {
        let mean = x.mean(-1, true);
        let std = x.var(-1, true).add_scalar(self.eps).sqrt();
        let x_norm = x.sub(&mean).div(&std);
        let y = x_norm.mul(&self.gamma).add(&self.beta);
        (y, LayerNormCache { x_norm, std })
    }

    /// Backward pass; records `{prefix}.gamma` and `{prefix}.beta`
    pub fn backward(
        &self,
        grad_out: &Tensor,
        cache: &LayerNormCache,
        prefix: &str,
        grads: &mut Gradients,
    ) -> Tensor {
        let n = self.gamma.numel();

        grads.accumulate(param_name(prefix, "gamma"), grad_out.mul(&cache.x_norm).sum_rows());
        grads.accumulate(param_name(prefix, "beta"), grad_out.sum_rows());

        let grad_x_norm = grad_out.mul(&self.gamma);
        let mut grad_x = vec![0.0; grad_out.numel()];

        grad_x
            .par_chunks_mut(n)
            .zip(grad_x_norm.data.par_chunks(n))
            .zip(cache.x_norm.data.par_chunks(n))
            .zip(cache.std.data.par_iter())
            .for_each(|(((out, g), xn), &std)| {
                let mean_g = g.iter().sum::<f32>() / n as f32;
                let mean_gx = g.iter().zip(xn).map(|(a, b)| a * b).sum::<f32>() / n as f32;
                for ((o, &gi), &xi) in out.iter_mut().zip(g).zip(xn) {
                    *o = (gi - mean_g - xi * mean_gx) / std;
                }
            });

        Tensor::new(grad_x, grad_out.shape.clone())
    }
}

impl Parameters for LayerNorm {
    fn parameters<'a>(&'a self, prefix: &str, out: &mut Vec<(String, &'a Tensor)>) {
        out.push((param_name(prefix, "gamma"), &self.gamma));
        out.push((param_name(prefix, "beta"), &self.beta));
    }

    fn parameters_mut<'a>(&'a mut self, prefix: &str, out: &mut Vec<(String, &'a mut Tensor)>) {
        out.push((param_name(prefix, "gamma"), &mut self.gamma));
        out.push((param_name(prefix, "beta"), &mut self.beta));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_rows_are_normalized() {
        let ln = LayerNorm::new(4);
        let x = Tensor::new(vec![1.0, 2.0, 3.0, 4.0, -5.0, 0.0, 5.0, 10.0], vec![1, 2, 4]);
        let y = ln.forward(&x);
        for row in y.data.chunks(4) {
            let mean: f32 = row.iter().sum::<f32>() / 4.0;
            let var: f32 = row.iter().map(|v| (v - mean).powi(2)).sum::<f32>() / 4.0;
            assert_relative_eq!(mean, 0.0, epsilon = 1e-5);
            assert_relative_eq!(var, 1.0, epsilon = 1e-3);
        }
    }

    #[test]
    fn test_backward_matches_finite_difference() {
        let mut ln = LayerNorm::new(3);
        ln.gamma = Tensor::new(vec![1.5, -0.5, 2.0], vec![3]);
        ln.beta = Tensor::new(vec![0.1, 0.2, 0.3], vec![3]);
        let x = Tensor::new(vec![0.3, -1.2, 0.8, 2.0, 0.5, -0.4], vec![2, 3]);
        // Loss = sum(y * w) for a fixed w
        let w = Tensor::new(vec![0.7, -1.1, 0.4, 0.2, 0.9, -0.6], vec![2, 3]);
        let loss = |input: &Tensor| ln.forward(input).mul(&w).data.iter().sum::<f32>();

        let (_, cache) = ln.forward_with_cache(&x);
        let mut grads = Gradients::new();
        let gx = ln.backward(&w, &cache, "ln", &mut grads);

        let h = 1e-2;
        for i in 0..x.numel() {
            let mut plus = x.clone();
            plus.data[i] += h;
            let mut minus = x.clone();
            minus.data[i] -= h;
            let numeric = (loss(&plus) - loss(&minus)) / (2.0 * h);
            assert_relative_eq!(gx.data[i], numeric, epsilon = 2e-2);
        }
        assert_eq!(grads.get("ln.beta").unwrap().data, w.sum_rows().data);
    }
}

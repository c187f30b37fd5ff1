//! Linear Layer (Fully Connected)
//!
//! Performs the affine transformation `y = x @ W + b` over the last axis of an
//! input of any rank.
//!
//! ```text
//! Input:  x [..., in_features]
//! Weight: W [in_features, out_features]
//! Bias:   b [out_features]           (optional)
//! Output: y [..., out_features]
//! ```
//!
//! ## Backward Pass
//!
//! With the leading axes flattened into N rows:
//!
//! ```text
//! grad_W = x^T @ grad_y          [in, out]
//! grad_b = sum(grad_y, rows)     [out]
//! grad_x = grad_y @ W^T          [N, in]
//! ```

use super::{normal_init, param_name, Parameters, INIT_STD};
use crate::gradients::Gradients;
use crate::tensor::Tensor;
use rand::Rng;

/// Fully connected layer
///
/// - `weight`: `[in_features, out_features]`, initialized from N(0, 0.02²)
/// - `bias`: `[out_features]`, initialized to zero, absent when disabled
#[derive(Debug, Clone)]
pub struct Linear {
    pub weight: Tensor,
    pub bias: Option<Tensor>,
}

/// Cache for the linear backward pass
#[derive(Debug, Clone)]
pub struct LinearCache {
    pub x: Tensor,
}

impl Linear {
    pub fn new<R: Rng + ?Sized>(in_features: usize, out_features: usize, bias: bool, rng: &mut R) -> Self {
        Self {
            weight: normal_init(vec![in_features, out_features], INIT_STD, rng),
            bias: bias.then(|| Tensor::zeros(vec![out_features])),
        }
    }

    pub fn in_features(&self) -> usize {
        self.weight.shape[0]
    }

    pub fn out_features(&self) -> usize {
        self.weight.shape[1]
    }

    pub fn forward(&self, x: &Tensor) -> Tensor {
        let in_features = self.in_features();
        assert_eq!(
            x.last_dim(),
            in_features,
            "Linear expects last dimension {}, got shape {:?}",
            in_features,
            x.shape
        );

        let rows = x.numel() / in_features.max(1);
        let y = x.reshape(&[rows, in_features]).matmul(&self.weight);

        let mut out_shape = x.shape.clone();
        if let Some(last) = out_shape.last_mut() {
            *last = self.out_features();
        }
        let y = y.reshape(&out_shape);

        match &self.bias {
            Some(bias) => y.add(bias),
            None => y,
        }
    }

    pub fn forward_with_cache(&self, x: &Tensor) -> (Tensor, LinearCache) {
        (self.forward(x), LinearCache { x: x.clone() })
    }

    /// Backward pass; records `{prefix}.weight` and `{prefix}.bias`
    pub fn backward(
        &self,
        grad_out: &Tensor,
        cache: &LinearCache,
        prefix: &str,
        grads: &mut Gradients,
    ) -> Tensor {
        let in_features = self.in_features();
        let out_features = self.out_features();
        let rows = grad_out.numel() / out_features.max(1);

        let g = grad_out.reshape(&[rows, out_features]);
        let x = cache.x.reshape(&[rows, in_features]);

        grads.accumulate(param_name(prefix, "weight"), x.transpose(0, 1).matmul(&g));
        if self.bias.is_some() {
            grads.accumulate(param_name(prefix, "bias"), g.sum_rows());
        }

        g.matmul(&self.weight.transpose(0, 1)).reshape(&cache.x.shape)
    }
}

impl Parameters for Linear {
    fn parameters<'a>(&'a self, prefix: &str, out: &mut Vec<(String, &'a Tensor)>) {
        out.push((param_name(prefix, "weight"), &self.weight));
        if let Some(bias) = &self.bias {
            out.push((param_name(prefix, "bias"), bias));
        }
    }

    fn parameters_mut<'a>(&'a mut self, prefix: &str, out: &mut Vec<(String, &'a mut Tensor)>) {
        out.push((param_name(prefix, "weight"), &mut self.weight));
        if let Some(bias) = &mut self.bias {
            out.push((param_name(prefix, "bias"), bias));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fixed() -> Linear {
        Linear {
            weight: Tensor::new(vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0], vec![2, 3]),
            bias: Some(Tensor::new(vec![0.5, 0.0, -0.5], vec![3])),
        }
    }

    #[test]
    fn test_forward_3d() {
        let layer = fixed();
        let x = Tensor::new(vec![1.0, 0.0, 0.0, 1.0], vec![1, 2, 2]);
        let y = layer.forward(&x);
        assert_eq!(y.shape, vec![1, 2, 3]);
        assert_eq!(y.data, vec![1.5, 2.0, 2.5, 4.5, 5.0, 5.5]);
    }

    #[test]
    fn test_backward_gradients() {
        let layer = fixed();
        let x = Tensor::new(vec![1.0, 2.0, 3.0, 4.0], vec![2, 2]);
        let (_, cache) = layer.forward_with_cache(&x);
        let g = Tensor::ones(vec![2, 3]);

        let mut grads = Gradients::new();
        let gx = layer.backward(&g, &cache, "fc", &mut grads);

        // grad_W[i, j] = sum over rows of x[:, i]
        assert_eq!(grads.get("fc.weight").unwrap().data, vec![4.0, 4.0, 4.0, 6.0, 6.0, 6.0]);
        assert_eq!(grads.get("fc.bias").unwrap().data, vec![2.0, 2.0, 2.0]);
        // grad_x[:, i] = sum of row i of W
        assert_eq!(gx.data, vec![6.0, 15.0, 6.0, 15.0]);
    }

    #[test]
    fn test_no_bias_has_no_bias_parameter() {
        let mut rng = rand::rng();
        let layer = Linear::new(4, 2, false, &mut rng);
        let mut params = Vec::new();
        layer.parameters("head", &mut params);
        let names: Vec<_> = params.iter().map(|(n, _)| n.as_str()).collect();
        assert_eq!(names, vec!["head.weight"]);
    }
}

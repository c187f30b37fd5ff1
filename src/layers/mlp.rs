//! Feed-Forward Network
//!
//! The position-wise MLP inside every transformer block:
//!
//! ```text
//! x [B, T, C] -> c_fc -> [B, T, 4C] -> GELU -> c_proj -> [B, T, C]
//! ```
//!
//! The 4x expansion gives each position a wider hidden space to compute in
//! before projecting back to the residual stream.

use super::activation::{gelu_backward, gelu_forward};
use super::linear::{Linear, LinearCache};
use super::{param_name, Parameters};
use crate::gradients::Gradients;
use crate::tensor::Tensor;
use rand::Rng;

/// Hidden width multiplier of the feed-forward network
pub const FF_EXPANSION: usize = 4;

#[derive(Debug, Clone)]
pub struct FeedForward {
    pub c_fc: Linear,
    pub c_proj: Linear,
}

#[derive(Debug, Clone)]
pub struct FeedForwardCache {
    pub fc: LinearCache,
    /// Pre-activation hidden values, needed for the GELU derivative
    pub hidden: Tensor,
    pub proj: LinearCache,
}

impl FeedForward {
    pub fn new<R: Rng + ?Sized>(n_embd: usize, rng: &mut R) -> Self {
        let hidden = FF_EXPANSION * n_embd;
        Self {
            c_fc: Linear::new(n_embd, hidden, true, rng),
            c_proj: Linear::new(hidden, n_embd, true, rng),
        }
    }

    pub fn forward(&self, x: &Tensor) -> Tensor {
        self.c_proj.forward(&gelu_forward(&self.c_fc.forward(x)))
    }

    pub fn forward_with_cache(&self, x: &Tensor) -> (Tensor, FeedForwardCache) {
        let (hidden, fc) = self.c_fc.forward_with_cache(x);
        let activated = gelu_forward(&hidden);
        let (y, proj) = self.c_proj.forward_with_cache(&activated);
        (y, FeedForwardCache { fc, hidden, proj })
    }

    pub fn backward(
        &self,
        grad_out: &Tensor,
        cache: &FeedForwardCache,
        prefix: &str,
        grads: &mut Gradients,
    ) -> Tensor {
        let grad_activated =
            self.c_proj
                .backward(grad_out, &cache.proj, &param_name(prefix, "c_proj"), grads);
        let grad_hidden = gelu_backward(&grad_activated, &cache.hidden);
        self.c_fc
            .backward(&grad_hidden, &cache.fc, &param_name(prefix, "c_fc"), grads)
    }
}

impl Parameters for FeedForward {
    fn parameters<'a>(&'a self, prefix: &str, out: &mut Vec<(String, &'a Tensor)>) {
        self.c_fc.parameters(&param_name(prefix, "c_fc"), out);
        self.c_proj.parameters(&param_name(prefix, "c_proj"), out);
    }

    fn parameters_mut<'a>(&'a mut self, prefix: &str, out: &mut Vec<(String, &'a mut Tensor)>) {
        self.c_fc.parameters_mut(&param_name(prefix, "c_fc"), out);
        self.c_proj.parameters_mut(&param_name(prefix, "c_proj"), out);
    }
}

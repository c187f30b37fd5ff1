//! Causal Multi-Head Self-Attention
//!
//! Each position attends to itself and every earlier position, never to later
//! ones. The embedding is split into `n_heads` independent heads of
//! `head_dim = n_embd / n_heads` features.
//!
//! ## Scaled Dot-Product Attention
//!
//! ```text
//! Q, K, V  = x @ W_q, x @ W_k, x @ W_v          [B, T, C]
//! split    -> [B, H, T, D]
//! scores   = (Q @ K^T) / √D                      [B, H, T, T]
//! scores[i, j] = -inf for j > i                   (causal mask)
//! weights  = softmax(scores)                      rows sum to 1
//! context  = dropout(weights) @ V                 [B, H, T, D]
//! merge    -> [B, T, C] -> out_proj
//! ```
//!
//! The mask uses a true negative infinity, so masked positions receive exactly
//! zero weight after the softmax.
//!
//! ## Backward Pass
//!
//! ```text
//! grad_V       = weights_dropped^T @ grad_ctx
//! grad_weights = dropout_backward(grad_ctx @ V^T)
//! grad_scores  = weights * (grad_weights - rowsum(grad_weights * weights))
//! grad_Q       = grad_scores @ K / √D
//! grad_K       = grad_scores^T @ Q / √D
//! ```
//!
//! Masked entries have zero weight, so their score gradient is zero as well.

use super::dropout::{Dropout, DropoutCache};
use super::linear::{Linear, LinearCache};
use super::{param_name, Parameters};
use crate::gradients::Gradients;
use crate::tensor::Tensor;
use rand::Rng;
use rand_chacha::ChaCha8Rng;

/// `[seq_len, seq_len]` mask with 1.0 strictly above the diagonal
pub fn causal_mask(seq_len: usize) -> Tensor {
    let mut mask = Tensor::zeros(vec![seq_len, seq_len]);
    for i in 0..seq_len {
        for j in (i + 1)..seq_len {
            mask.data[i * seq_len + j] = 1.0;
        }
    }
    mask
}

#[derive(Debug, Clone)]
pub struct MultiHeadAttention {
    pub q_proj: Linear,
    pub k_proj: Linear,
    pub v_proj: Linear,
    pub out_proj: Linear,
    pub attn_dropout: Dropout,
    pub n_heads: usize,
    pub head_dim: usize,
}

#[derive(Debug, Clone)]
pub struct AttentionCache {
    q_lin: LinearCache,
    k_lin: LinearCache,
    v_lin: LinearCache,
    out_lin: LinearCache,
    /// Split heads, `[B, H, T, D]`
    q: Tensor,
    k: Tensor,
    v: Tensor,
    /// Softmax output before dropout, `[B, H, T, T]`
    weights: Tensor,
    weights_dropped: Tensor,
    dropout: DropoutCache,
}

impl MultiHeadAttention {
    /// # Panics
    ///
    /// Panics if `n_embd` is not divisible by `n_heads`; the model validates
    /// its configuration before building layers.
    pub fn new<R: Rng + ?Sized>(
        n_embd: usize,
        n_heads: usize,
        dropout_rate: f32,
        qkv_bias: bool,
        rng: &mut R,
    ) -> Self {
        assert!(
            n_heads > 0 && n_embd % n_heads == 0,
            "n_embd ({n_embd}) must be divisible by n_heads ({n_heads})"
        );
        Self {
            q_proj: Linear::new(n_embd, n_embd, qkv_bias, rng),
            k_proj: Linear::new(n_embd, n_embd, qkv_bias, rng),
            v_proj: Linear::new(n_embd, n_embd, qkv_bias, rng),
            out_proj: Linear::new(n_embd, n_embd, true, rng),
            attn_dropout: Dropout::new(dropout_rate),
            n_heads,
            head_dim: n_embd / n_heads,
        }
    }

    fn scale(&self) -> f32 {
        1.0 / (self.head_dim as f32).sqrt()
    }

    /// `[B, T, C] -> [B, H, T, D]`
    fn split_heads(&self, x: &Tensor) -> Tensor {
        let (b, t) = (x.shape[0], x.shape[1]);
        x.reshape(&[b, t, self.n_heads, self.head_dim]).transpose(1, 2)
    }

    /// `[B, H, T, D] -> [B, T, C]`
    fn merge_heads(&self, x: &Tensor) -> Tensor {
        let (b, t) = (x.shape[0], x.shape[2]);
        x.transpose(1, 2).reshape(&[b, t, self.n_heads * self.head_dim])
    }

    fn masked_weights(&self, q: &Tensor, k: &Tensor) -> Tensor {
        let seq_len = q.shape[2];
        q.matmul(&k.transpose(-2, -1))
            .mul_scalar(self.scale())
            .masked_fill(&causal_mask(seq_len), f32::NEG_INFINITY)
            .softmax(-1)
    }

    pub fn forward(&self, x: &Tensor) -> Tensor {
        self.forward_with_cache(x, None).0
    }

    /// Attention weights `[B, H, T, T]` for `x`, computed without dropout
    pub fn attention_weights(&self, x: &Tensor) -> Tensor {
        let q = self.split_heads(&self.q_proj.forward(x));
        let k = self.split_heads(&self.k_proj.forward(x));
        self.masked_weights(&q, &k)
    }

    pub fn forward_with_cache(
        &self,
        x: &Tensor,
        rng: Option<&mut ChaCha8Rng>,
    ) -> (Tensor, AttentionCache) {
        assert_eq!(x.ndim(), 3, "attention expects [batch, seq, n_embd], got {:?}", x.shape);

        let (q_out, q_lin) = self.q_proj.forward_with_cache(x);
        let (k_out, k_lin) = self.k_proj.forward_with_cache(x);
        let (v_out, v_lin) = self.v_proj.forward_with_cache(x);
        let q = self.split_heads(&q_out);
        let k = self.split_heads(&k_out);
        let v = self.split_heads(&v_out);

        let weights = self.masked_weights(&q, &k);
        let (weights_dropped, dropout) = self.attn_dropout.forward(&weights, rng);

        let context = self.merge_heads(&weights_dropped.matmul(&v));
        let (y, out_lin) = self.out_proj.forward_with_cache(&context);

        let cache = AttentionCache {
            q_lin,
            k_lin,
            v_lin,
            out_lin,
            q,
            k,
            v,
            weights,
            weights_dropped,
            dropout,
        };
        (y, cache)
    }

    pub fn backward(
        &self,
        grad_out: &Tensor,
        cache: &AttentionCache,
        prefix: &str,
        grads: &mut Gradients,
    ) -> Tensor {
        let grad_context = self.out_proj.backward(
            grad_out,
            &cache.out_lin,
            &param_name(prefix, "out_proj"),
            grads,
        );
        let grad_ctx = self.split_heads(&grad_context);

        let grad_v = cache.weights_dropped.transpose(-2, -1).matmul(&grad_ctx);
        let grad_dropped = grad_ctx.matmul(&cache.v.transpose(-2, -1));
        let grad_weights = self.attn_dropout.backward(&grad_dropped, &cache.dropout);

        // Softmax backward, row by row
        let row_dot = grad_weights.mul(&cache.weights).sum(-1, true);
        let grad_scores = cache
            .weights
            .mul(&grad_weights.sub(&row_dot))
            .mul_scalar(self.scale());

        let grad_q = grad_scores.matmul(&cache.k);
        let grad_k = grad_scores.transpose(-2, -1).matmul(&cache.q);

        let mut grad_x = self.q_proj.backward(
            &self.merge_heads(&grad_q),
            &cache.q_lin,
            &param_name(prefix, "q_proj"),
            grads,
        );
        grad_x.add_assign(&self.k_proj.backward(
            &self.merge_heads(&grad_k),
            &cache.k_lin,
            &param_name(prefix, "k_proj"),
            grads,
        ));
        grad_x.add_assign(&self.v_proj.backward(
            &self.merge_heads(&grad_v),
            &cache.v_lin,
            &param_name(prefix, "v_proj"),
            grads,
        ));
        grad_x
    }
}

impl Parameters for MultiHeadAttention {
    fn parameters<'a>(&'a self, prefix: &str, out: &mut Vec<(String, &'a Tensor)>) {
        self.q_proj.parameters(&param_name(prefix, "q_proj"), out);
        self.k_proj.parameters(&param_name(prefix, "k_proj"), out);
        self.v_proj.parameters(&param_name(prefix, "v_proj"), out);
        self.out_proj.parameters(&param_name(prefix, "out_proj"), out);
    }

    fn parameters_mut<'a>(&'a mut self, prefix: &str, out: &mut Vec<(String, &'a mut Tensor)>) {
        self.q_proj.parameters_mut(&param_name(prefix, "q_proj"), out);
        self.k_proj.parameters_mut(&param_name(prefix, "k_proj"), out);
        self.v_proj.parameters_mut(&param_name(prefix, "v_proj"), out);
        self.out_proj.parameters_mut(&param_name(prefix, "out_proj"), out);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use rand::SeedableRng;

    fn layer(n_embd: usize, n_heads: usize) -> MultiHeadAttention {
        MultiHeadAttention::new(n_embd, n_heads, 0.0, true, &mut ChaCha8Rng::seed_from_u64(11))
    }

    fn input(b: usize, t: usize, c: usize) -> Tensor {
        let n = b * t * c;
        Tensor::new((0..n).map(|i| ((i * 37 % 17) as f32 - 8.0) * 0.1).collect(), vec![b, t, c])
    }

    #[test]
    fn test_causal_mask_layout() {
        assert_eq!(causal_mask(3).data, vec![0.0, 1.0, 1.0, 0.0, 0.0, 1.0, 0.0, 0.0, 0.0]);
    }

    #[test]
    fn test_weights_are_causal_distributions() {
        let attn = layer(8, 2);
        let w = attn.attention_weights(&input(2, 5, 8));
        assert_eq!(w.shape, vec![2, 2, 5, 5]);
        for (r, row) in w.data.chunks(5).enumerate() {
            let i = r % 5;
            assert_relative_eq!(row.iter().sum::<f32>(), 1.0, epsilon = 1e-5);
            assert!(row.iter().all(|&p| p >= 0.0));
            assert!(row[i + 1..].iter().all(|&p| p == 0.0));
        }
    }

    #[test]
    fn test_single_position_attends_to_itself() {
        let attn = layer(4, 1);
        let w = attn.attention_weights(&input(1, 1, 4));
        assert_eq!(w.data, vec![1.0]);
    }

    #[test]
    fn test_split_merge_roundtrip() {
        let attn = layer(6, 3);
        let x = input(2, 4, 6);
        let split = attn.split_heads(&x);
        assert_eq!(split.shape, vec![2, 3, 4, 2]);
        assert_eq!(attn.merge_heads(&split), x);
    }

    #[test]
    fn test_batch_rows_do_not_mix() {
        let attn = layer(4, 2);
        let a = input(1, 3, 4);
        let both = Tensor::new([a.data.clone(), vec![5.0; 12]].concat(), vec![2, 3, 4]);
        let alone = attn.forward(&a);
        let batched = attn.forward(&both);
        for (x, y) in alone.data.iter().zip(&batched.data[..12]) {
            assert_relative_eq!(*x, *y, epsilon = 1e-6);
        }
    }

    #[test]
    fn test_backward_matches_finite_difference() {
        let mut attn = layer(4, 2);
        {
            let mut params = Vec::new();
            attn.parameters_mut("", &mut params);
            for (_, p) in params {
                *p = p.mul_scalar(25.0);
            }
        }
        let x = input(1, 3, 4);
        let w = input(1, 3, 4).map(|v| v * 0.5 + 0.1);
        let loss = |inp: &Tensor| attn.forward(inp).mul(&w).data.iter().sum::<f32>();

        let (_, cache) = attn.forward_with_cache(&x, None);
        let mut grads = Gradients::new();
        let gx = attn.backward(&w, &cache, "attn", &mut grads);

        let h = 1e-2;
        for i in 0..x.numel() {
            let mut plus = x.clone();
            plus.data[i] += h;
            let mut minus = x.clone();
            minus.data[i] -= h;
            let numeric = (loss(&plus) - loss(&minus)) / (2.0 * h);
            assert_relative_eq!(gx.data[i], numeric, epsilon = 1e-2, max_relative = 5e-2);
        }
        assert!(grads.get("attn.q_proj.weight").is_some());
        assert!(grads.get("attn.out_proj.bias").is_some());
    }
}

//! Transformer Block
//!
//! One pre-norm block: attention and a feed-forward network, each wrapped in a
//! residual connection.
//!
//! ## Architecture
//!
//! ```text
//! x → LayerNorm → Attention → Dropout → (+) → LayerNorm → MLP → Dropout → (+) → out
//! │                                      ↑  │                              ↑
//! └──────────────────────────────────────┘  └──────────────────────────────┘
//! ```
//!
//! ## Backward Pass
//!
//! At each residual connection the incoming gradient flows both straight
//! through the shortcut and back through the branch; the two contributions are
//! summed.

use super::attention::{AttentionCache, MultiHeadAttention};
use super::dropout::{Dropout, DropoutCache};
use super::layer_norm::{LayerNorm, LayerNormCache};
use super::mlp::{FeedForward, FeedForwardCache};
use super::{param_name, Parameters};
use crate::config::Config;
use crate::gradients::Gradients;
use crate::tensor::Tensor;
use rand::Rng;
use rand_chacha::ChaCha8Rng;

#[derive(Debug, Clone)]
pub struct TransformerBlock {
    pub ln_1: LayerNorm,
    pub attn: MultiHeadAttention,
    pub ln_2: LayerNorm,
    pub mlp: FeedForward,
    pub drop_shortcut: Dropout,
}

#[derive(Debug, Clone)]
pub struct BlockCache {
    ln_1: LayerNormCache,
    attn: AttentionCache,
    drop_1: DropoutCache,
    ln_2: LayerNormCache,
    mlp: FeedForwardCache,
    drop_2: DropoutCache,
}

impl TransformerBlock {
    pub fn new<R: Rng + ?Sized>(config: &Config, rng: &mut R) -> Self {
        Self {
            ln_1: LayerNorm::new(config.n_embd),
            attn: MultiHeadAttention::new(
                config.n_embd,
                config.n_heads,
                config.dropout_rate,
                config.qkv_bias,
                rng,
            ),
            ln_2: LayerNorm::new(config.n_embd),
            mlp: FeedForward::new(config.n_embd, rng),
            drop_shortcut: Dropout::new(config.dropout_rate),
        }
    }

    pub fn forward(&self, x: &Tensor) -> Tensor {
        self.forward_with_cache(x, None).0
    }

    pub fn forward_with_cache(
        &self,
        x: &Tensor,
        mut rng: Option<&mut ChaCha8Rng>,
    ) -> (Tensor, BlockCache) {
        let (normed, ln_1) = self.ln_1.forward_with_cache(x);
        let (attended, attn) = self.attn.forward_with_cache(&normed, rng.as_deref_mut());
        let (attended, drop_1) = self.drop_shortcut.forward(&attended, rng.as_deref_mut());
        let y = x.add(&attended);

        let (normed, ln_2) = self.ln_2.forward_with_cache(&y);
        let (fed, mlp) = self.mlp.forward_with_cache(&normed);
        let (fed, drop_2) = self.drop_shortcut.forward(&fed, rng);
        let out = y.add(&fed);

        let cache = BlockCache {
            ln_1,
            attn,
            drop_1,
            ln_2,
            mlp,
            drop_2,
        };
        (out, cache)
    }

    pub fn backward(
        &self,
        grad_out: &Tensor,
        cache: &BlockCache,
        prefix: &str,
        grads: &mut Gradients,
    ) -> Tensor {
        // Second residual: out = y + drop(mlp(ln_2(y)))
        let grad_fed = self.drop_shortcut.backward(grad_out, &cache.drop_2);
        let grad_normed = self
            .mlp
            .backward(&grad_fed, &cache.mlp, &param_name(prefix, "mlp"), grads);
        let mut grad_y = grad_out.clone();
        grad_y.add_assign(&self.ln_2.backward(
            &grad_normed,
            &cache.ln_2,
            &param_name(prefix, "ln_2"),
            grads,
        ));

        // First residual: y = x + drop(attn(ln_1(x)))
        let grad_attended = self.drop_shortcut.backward(&grad_y, &cache.drop_1);
        let grad_normed = self.attn.backward(
            &grad_attended,
            &cache.attn,
            &param_name(prefix, "attn"),
            grads,
        );
        let mut grad_x = grad_y;
        grad_x.add_assign(&self.ln_1.backward(
            &grad_normed,
            &cache.ln_1,
            &param_name(prefix, "ln_1"),
            grads,
        ));
        grad_x
    }
}

impl Parameters for TransformerBlock {
    fn parameters<'a>(&'a self, prefix: &str, out: &mut Vec<(String, &'a Tensor)>) {
        self.ln_1.parameters(&param_name(prefix, "ln_1"), out);
        self.attn.parameters(&param_name(prefix, "attn"), out);
        self.ln_2.parameters(&param_name(prefix, "ln_2"), out);
        self.mlp.parameters(&param_name(prefix, "mlp"), out);
    }

    fn parameters_mut<'a>(&'a mut self, prefix: &str, out: &mut Vec<(String, &'a mut Tensor)>) {
        self.ln_1.parameters_mut(&param_name(prefix, "ln_1"), out);
        self.attn.parameters_mut(&param_name(prefix, "attn"), out);
        self.ln_2.parameters_mut(&param_name(prefix, "ln_2"), out);
        self.mlp.parameters_mut(&param_name(prefix, "mlp"), out);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;

    #[test]
    fn test_shape_preserved_and_training_is_stochastic() {
        let config = Config::tiny(16).with_dropout(0.5);
        let block = TransformerBlock::new(&config, &mut ChaCha8Rng::seed_from_u64(0));
        let x = Tensor::new((0..2 * 3 * 64).map(|i| (i % 13) as f32 * 0.1).collect(), vec![2, 3, 64]);

        let eval_a = block.forward(&x);
        let eval_b = block.forward(&x);
        assert_eq!(eval_a.shape, vec![2, 3, 64]);
        assert_eq!(eval_a, eval_b);

        let mut rng = ChaCha8Rng::seed_from_u64(1);
        let (train, _) = block.forward_with_cache(&x, Some(&mut rng));
        assert_ne!(train, eval_a);
    }

    #[test]
    fn test_parameter_count() {
        let config = Config::tiny(16);
        let block = TransformerBlock::new(&config, &mut ChaCha8Rng::seed_from_u64(0));
        let mut params = Vec::new();
        block.parameters("blocks.0", &mut params);
        let total: usize = params.iter().map(|(_, t)| t.numel()).sum();
        let c = config.n_embd;
        // 2 LayerNorms, q/k/v without bias, out_proj with bias, MLP 4x with biases
        let expected = 4 * c + 3 * c * c + (c * c + c) + (c * 4 * c + 4 * c) + (4 * c * c + c);
        assert_eq!(total, expected);
        assert_eq!(params[0].0, "blocks.0.ln_1.gamma");
    }
}

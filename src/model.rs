//! GPT Model Architecture
//!
//! The full autoregressive transformer:
//!
//! ```text
//! Token IDs [B, T]
//!     ↓
//! Token Embedding + Position Embedding → Dropout    [B, T, C]
//!     ↓
//! Transformer Block × n_layers                       [B, T, C]
//!     ↓
//! Final LayerNorm
//!     ↓
//! Output head (no bias)                              [B, T, vocab_size]
//! ```
//!
//! [`GptModel::forward`] is the inference path: deterministic, no dropout,
//! borrowing the model immutably. [`GptModel::forward_with_cache`] and
//! [`GptModel::backward`] make up the training path.
//!
//! ## Parameter Names
//!
//! Every learnable tensor has a stable dotted name, used by the state dict,
//! the gradient map and the optimizer:
//!
//! ```text
//! token_embedding.weight              [vocab_size, n_embd]
//! position_embedding.weight           [context_length, n_embd]
//! blocks.{i}.ln_1.gamma / beta        [n_embd]
//! blocks.{i}.attn.{q,k,v}_proj.weight [n_embd, n_embd]   (+ .bias when qkv_bias)
//! blocks.{i}.attn.out_proj.weight     [n_embd, n_embd]   (+ .bias)
//! blocks.{i}.ln_2.gamma / beta        [n_embd]
//! blocks.{i}.mlp.c_fc.weight          [n_embd, 4 * n_embd] (+ .bias)
//! blocks.{i}.mlp.c_proj.weight        [4 * n_embd, n_embd] (+ .bias)
//! ln_f.gamma / beta                   [n_embd]
//! lm_head.weight                      [n_embd, vocab_size]
//! ```

use crate::config::Config;
use crate::error::{ModelError, Result};
use crate::gradients::Gradients;
use crate::layers::{
    param_name, BlockCache, Dropout, DropoutCache, Embedding, LayerNorm, LayerNormCache, Linear,
    LinearCache, Parameters, TransformerBlock,
};
use crate::tensor::Tensor;
use log::debug;
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use std::collections::{BTreeMap, BTreeSet};

/// Named parameter tensors, the in-memory form of a checkpoint
pub type StateDict = BTreeMap<String, Tensor>;

/// GPT language model
#[derive(Debug, Clone)]
pub struct GptModel {
    config: Config,
    pub token_embedding: Embedding,
    pub position_embedding: Embedding,
    pub drop_emb: Dropout,
    pub blocks: Vec<TransformerBlock>,
    pub ln_f: LayerNorm,
    pub lm_head: Linear,
}

/// Everything the backward pass needs from a training forward pass
#[derive(Debug, Clone)]
pub struct ForwardCache {
    ids: Vec<Vec<usize>>,
    drop_emb: DropoutCache,
    blocks: Vec<BlockCache>,
    ln_f: LayerNormCache,
    lm_head: LinearCache,
}

impl GptModel {
    /// Build a freshly initialized model
    ///
    /// Weights are drawn from N(0, 0.02²) with a ChaCha8 stream seeded by
    /// `seed`, so the same config and seed always produce the same model.
    /// Fails with [`ModelError::InvalidConfig`] if the config is invalid,
    /// e.g. when `n_embd` is not divisible by `n_heads`.
    pub fn new(config: &Config, seed: u64) -> Result<Self> {
        config.validate()?;
        let mut rng = ChaCha8Rng::seed_from_u64(seed);

        let token_embedding = Embedding::new(config.vocab_size, config.n_embd, &mut rng);
        let position_embedding = Embedding::new(config.context_length, config.n_embd, &mut rng);
        let blocks = (0..config.n_layers)
            .map(|_| TransformerBlock::new(config, &mut rng))
            .collect();
        let lm_head = Linear::new(config.n_embd, config.vocab_size, false, &mut rng);

        let model = Self {
            config: config.clone(),
            token_embedding,
            position_embedding,
            drop_emb: Dropout::new(config.dropout_rate),
            blocks,
            ln_f: LayerNorm::new(config.n_embd),
            lm_head,
        };
        debug!(
            "built model: {} layers, {} heads, n_embd {}, {} parameters",
            config.n_layers,
            config.n_heads,
            config.n_embd,
            model.count_parameters()
        );
        Ok(model)
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Validate a batch and return `(batch_size, seq_len)`
    fn check_batch(&self, ids: &[Vec<usize>]) -> Result<(usize, usize)> {
        let seq_len = ids.first().map(Vec::len).ok_or(ModelError::EmptyBatch)?;
        if seq_len == 0 {
            return Err(ModelError::EmptyBatch);
        }
        if let Some((row, r)) = ids.iter().enumerate().find(|(_, r)| r.len() != seq_len) {
            return Err(ModelError::RaggedBatch {
                row,
                len: r.len(),
                expected: seq_len,
            });
        }
        if seq_len > self.config.context_length {
            return Err(ModelError::SequenceTooLong {
                len: seq_len,
                max: self.config.context_length,
            });
        }
        Ok((ids.len(), seq_len))
    }

    /// Token embeddings plus position embeddings, `[B, T, n_embd]`
    pub fn embed(&self, ids: &[Vec<usize>]) -> Result<Tensor> {
        let (_, seq_len) = self.check_batch(ids)?;
        let tokens = self.token_embedding.forward(ids)?;
        Ok(tokens.add(&self.position_embedding.positions(seq_len)))
    }

    /// Inference forward pass: ids `[B, T]` to logits `[B, T, vocab_size]`
    pub fn forward(&self, ids: &[Vec<usize>]) -> Result<Tensor> {
        let mut x = self.embed(ids)?;
        for block in &self.blocks {
            x = block.forward(&x);
        }
        Ok(self.lm_head.forward(&self.ln_f.forward(&x)))
    }

    /// Training forward pass
    ///
    /// With `rng` set, dropout is active and draws its masks from it; with
    /// `None` the output equals [`GptModel::forward`].
    pub fn forward_with_cache(
        &self,
        ids: &[Vec<usize>],
        mut rng: Option<&mut ChaCha8Rng>,
    ) -> Result<(Tensor, ForwardCache)> {
        let x = self.embed(ids)?;
        let (mut x, drop_emb) = self.drop_emb.forward(&x, rng.as_deref_mut());

        let mut block_caches = Vec::with_capacity(self.blocks.len());
        for block in &self.blocks {
            let (out, cache) = block.forward_with_cache(&x, rng.as_deref_mut());
            x = out;
            block_caches.push(cache);
        }

        let (x, ln_f) = self.ln_f.forward_with_cache(&x);
        let (logits, lm_head) = self.lm_head.forward_with_cache(&x);

        let cache = ForwardCache {
            ids: ids.to_vec(),
            drop_emb,
            blocks: block_caches,
            ln_f,
            lm_head,
        };
        Ok((logits, cache))
    }

    /// Backpropagate `grad_logits` (`[B, T, vocab_size]`) to every parameter
    pub fn backward(&self, grad_logits: &Tensor, cache: &ForwardCache) -> Gradients {
        let mut grads = Gradients::new();

        let grad = self
            .lm_head
            .backward(grad_logits, &cache.lm_head, "lm_head", &mut grads);
        let mut grad = self.ln_f.backward(&grad, &cache.ln_f, "ln_f", &mut grads);

        for (i, (block, block_cache)) in self.blocks.iter().zip(&cache.blocks).enumerate().rev() {
            grad = block.backward(&grad, block_cache, &format!("blocks.{i}"), &mut grads);
        }

        let grad = self.drop_emb.backward(&grad, &cache.drop_emb);
        self.token_embedding.backward(
            &grad,
            cache.ids.iter().flatten(),
            "token_embedding",
            &mut grads,
        );

        // Every batch row reads the same positions, so their gradients sum
        let seq_len = grad.shape[1];
        let row = seq_len * self.config.n_embd;
        let mut grad_pos = Tensor::zeros(vec![seq_len, self.config.n_embd]);
        for chunk in grad.data.chunks(row) {
            for (g, &v) in grad_pos.data.iter_mut().zip(chunk) {
                *g += v;
            }
        }
        let positions: Vec<usize> = (0..seq_len).collect();
        self.position_embedding
            .backward(&grad_pos, positions.iter(), "position_embedding", &mut grads);

        grads
    }

    /// Attention weights `[B, n_heads, T, T]` of block `layer` for `ids`
    pub fn attention_weights(&self, ids: &[Vec<usize>], layer: usize) -> Result<Tensor> {
        let block = self.blocks.get(layer).ok_or_else(|| {
            ModelError::InvalidConfig(format!(
                "layer {layer} out of range for {} blocks",
                self.blocks.len()
            ))
        })?;
        let mut x = self.embed(ids)?;
        for earlier in &self.blocks[..layer] {
            x = earlier.forward(&x);
        }
        Ok(block.attn.attention_weights(&block.ln_1.forward(&x)))
    }

    pub fn named_parameters(&self) -> Vec<(String, &Tensor)> {
        let mut out = Vec::new();
        self.parameters("", &mut out);
        out
    }

    pub fn named_parameters_mut(&mut self) -> Vec<(String, &mut Tensor)> {
        let mut out = Vec::new();
        self.parameters_mut("", &mut out);
        out
    }

    /// Copy of every parameter keyed by name
    pub fn state_dict(&self) -> StateDict {
        self.named_parameters()
            .into_iter()
            .map(|(name, tensor)| (name, tensor.clone()))
            .collect()
    }

    /// Replace every parameter with the tensor of the same name in `state`
    ///
    /// All names and shapes are checked before anything is written, so a
    /// failed load leaves the model untouched. Tensors are never reshaped.
    pub fn load_state_dict(&mut self, state: &StateDict) -> Result<()> {
        let expected: Vec<(String, Vec<usize>)> = self
            .named_parameters()
            .into_iter()
            .map(|(name, tensor)| (name, tensor.shape.clone()))
            .collect();

        for (name, shape) in &expected {
            let tensor = state
                .get(name)
                .ok_or_else(|| ModelError::MissingParameter(name.clone()))?;
            if tensor.shape != *shape || tensor.data.len() != shape.iter().product::<usize>() {
                return Err(ModelError::ShapeMismatch {
                    name: name.clone(),
                    expected: shape.clone(),
                    actual: tensor.shape.clone(),
                });
            }
        }

        let known: BTreeSet<&str> = expected.iter().map(|(name, _)| name.as_str()).collect();
        if let Some(extra) = state.keys().find(|name| !known.contains(name.as_str())) {
            return Err(ModelError::UnexpectedParameter(extra.clone()));
        }

        for (name, param) in self.named_parameters_mut() {
            if let Some(tensor) = state.get(&name) {
                param.clone_from(tensor);
            }
        }
        Ok(())
    }

    /// Total number of learnable scalars
    pub fn count_parameters(&self) -> usize {
        self.named_parameters().iter().map(|(_, t)| t.numel()).sum()
    }

    /// Parameter count if the output head shared the token embedding matrix
    ///
    /// This is the convention behind the "124M" name of GPT-2 small.
    pub fn count_parameters_tied(&self) -> usize {
        self.count_parameters() - self.lm_head.weight.numel()
    }

    /// Memory footprint of the parameters in megabytes (f32)
    pub fn size_mb(&self) -> f64 {
        (self.count_parameters() * std::mem::size_of::<f32>()) as f64 / (1024.0 * 1024.0)
    }
}

impl Parameters for GptModel {
    fn parameters<'a>(&'a self, prefix: &str, out: &mut Vec<(String, &'a Tensor)>) {
        self.token_embedding
            .parameters(&param_name(prefix, "token_embedding"), out);
        self.position_embedding
            .parameters(&param_name(prefix, "position_embedding"), out);
        for (i, block) in self.blocks.iter().enumerate() {
            block.parameters(&param_name(prefix, &format!("blocks.{i}")), out);
        }
        self.ln_f.parameters(&param_name(prefix, "ln_f"), out);
        self.lm_head.parameters(&param_name(prefix, "lm_head"), out);
    }

    fn parameters_mut<'a>(&'a mut self, prefix: &str, out: &mut Vec<(String, &'a mut Tensor)>) {
        self.token_embedding
            .parameters_mut(&param_name(prefix, "token_embedding"), out);
        self.position_embedding
            .parameters_mut(&param_name(prefix, "position_embedding"), out);
        for (i, block) in self.blocks.iter_mut().enumerate() {
            block.parameters_mut(&param_name(prefix, &format!("blocks.{i}")), out);
        }
        self.ln_f.parameters_mut(&param_name(prefix, "ln_f"), out);
        self.lm_head.parameters_mut(&param_name(prefix, "lm_head"), out);
    }
}

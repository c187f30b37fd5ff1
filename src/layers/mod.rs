//! Neural Network Layers
//!
//! Every layer of the GPT model lives here. Each one supports inference and
//! training through the same code path.
//!
//! ## Layers
//!
//! - **activation**: GELU activation function (forward and backward)
//! - **linear**: Fully connected layer with optional bias
//! - **embedding**: Lookup table for token and position embeddings
//! - **layer_norm**: Layer normalization
//! - **dropout**: Dropout regularization driven by a seeded RNG
//! - **mlp**: Feed-forward network (4x expansion with GELU)
//! - **attention**: Causal multi-head self-attention
//! - **block**: Complete pre-norm transformer block
//!
//! ## Design Pattern
//!
//! ```rust,ignore
//! impl Layer {
//!     // Inference: no dropout, nothing cached
//!     pub fn forward(&self, x: &Tensor) -> Tensor;
//!     // Training: dropout draws from `rng` when it is Some
//!     pub fn forward_with_cache(&self, x: &Tensor, rng: Option<&mut ChaCha8Rng>) -> (Tensor, Cache);
//!     // Writes parameter gradients under `prefix` and returns the input gradient
//!     pub fn backward(&self, grad: &Tensor, cache: &Cache, prefix: &str, grads: &mut Gradients) -> Tensor;
//! }
//! ```
//!
//! Parameters are exposed by name through the [`Parameters`] trait, which the
//! model uses to build its state dict and the optimizer uses to update weights.

pub mod activation;
pub mod attention;
pub mod block;
pub mod dropout;
pub mod embedding;
pub mod layer_norm;
pub mod linear;
pub mod mlp;

use crate::tensor::Tensor;
use rand::Rng;
use rand_distr::StandardNormal;

pub use activation::{gelu, gelu_backward, gelu_forward, gelu_grad};
pub use attention::{causal_mask, AttentionCache, MultiHeadAttention};
pub use block::{BlockCache, TransformerBlock};
pub use dropout::{Dropout, DropoutCache};
pub use embedding::Embedding;
pub use layer_norm::{LayerNorm, LayerNormCache};
pub use linear::{Linear, LinearCache};
pub use mlp::{FeedForward, FeedForwardCache};

/// Standard deviation used for all weight initialization (GPT-2 convention)
pub const INIT_STD: f32 = 0.02;

/// Named access to a layer's learnable tensors
///
/// Names are dotted paths built from `prefix`, e.g. `blocks.3.mlp.c_fc.weight`.
/// Both methods must visit the same names in the same order.
pub trait Parameters {
    fn parameters<'a>(&'a self, prefix: &str, out: &mut Vec<(String, &'a Tensor)>);

    fn parameters_mut<'a>(&'a mut self, prefix: &str, out: &mut Vec<(String, &'a mut Tensor)>);
}

/// Join a parameter prefix and a local name with a dot
pub fn param_name(prefix: &str, name: &str) -> String {
    if prefix.is_empty() {
        name.to_string()
    } else {
        format!("{prefix}.{name}")
    }
}

/// Draw `shape` values from N(0, std²)
pub fn normal_init<R: Rng + ?Sized>(shape: Vec<usize>, std: f32, rng: &mut R) -> Tensor {
    let size: usize = shape.iter().product();
    let data = (0..size)
        .map(|_| rng.sample::<f32, _>(StandardNormal) * std)
        .collect();
    Tensor::new(data, shape)
}

//! Verdict: a GPT language model from scratch
//!
//! A GPT-style decoder-only transformer with everything needed to train it
//! and sample from it: tensors, layers with hand-written backward passes, a
//! byte-level BPE tokenizer, AdamW, a training loop and a checkpoint format.
//!
//! # Modules
//!
//! - [`tensor`] - Dense `f32` tensors with parallel matmul
//! - [`layers`] - Linear, embedding, layer norm, dropout, attention, blocks
//! - [`model`] - The full GPT model and its state dict
//! - [`tokenizer`] - Byte Pair Encoding (BPE) tokenization
//! - [`generate`] - Greedy, temperature and top-k decoding
//! - [`loss`], [`gradients`], [`optimizer`] - Cross-entropy, clipping, AdamW
//! - [`train`] - Data loading and the training loop
//! - [`checkpoint`] - Saving and loading trained models
//!
//! # Example
//!
//! ```rust,no_run
//! use verdict::{generate_text, BpeTokenizer, Config, GenerationConfig, GptModel, Sampler};
//!
//! let text = std::fs::read_to_string("corpus.txt")?;
//! let tokenizer = BpeTokenizer::train_new(&text, 512);
//! let model = GptModel::new(&Config::tiny(512), 42)?;
//!
//! let config = GenerationConfig::default().with_temperature(0.8).with_top_k(40);
//! let sample = generate_text(&model, &tokenizer, "Once upon", &config, &mut Sampler::new(7))?;
//! println!("{sample}");
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```

pub mod checkpoint;
pub mod config;
pub mod error;
pub mod generate;
pub mod gradients;
pub mod layers;
pub mod loss;
pub mod model;
pub mod optimizer;
pub mod tensor;
pub mod tokenizer;
pub mod train;
pub mod training_logger;

// Re-export main types for convenience
pub use checkpoint::{Checkpoint, CheckpointMetadata};
pub use config::{Config, GPT2_VOCAB_SIZE};
pub use error::{ModelError, Result, TokenizerError};
pub use generate::{
    generate, generate_greedy, generate_text, GenerationConfig, LanguageModel, Sampler,
};
pub use gradients::{clip_gradients, compute_grad_norm, Gradients};
pub use loss::{cross_entropy, cross_entropy_with_grad, perplexity};
pub use model::{GptModel, StateDict};
pub use optimizer::{AdamW, AdamWConfig};
pub use tensor::Tensor;
pub use tokenizer::{BpeTokenizer, Tokenizer, TokenizerStats, END_OF_TEXT};
pub use train::{
    calc_loss_batch, calc_loss_loader, evaluate_model, train_model_simple, train_val_split,
    TextDataLoader, TrainingConfig, TrainingHistory,
};
pub use training_logger::{EvalRecord, TrainingLogger};

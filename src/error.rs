//! Error types for the model, tokenizer and checkpoint layers.

use thiserror::Error;

/// Result type used across the crate
pub type Result<T> = std::result::Result<T, ModelError>;

/// Errors raised while building, running, training or loading a model
#[derive(Error, Debug)]
pub enum ModelError {
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("token id {id} is out of range for a vocabulary of {vocab_size}")]
    TokenOutOfRange { id: usize, vocab_size: usize },

    #[error("sequence of {len} tokens exceeds the context length of {max}")]
    SequenceTooLong { len: usize, max: usize },

    #[error("input batch is empty")]
    EmptyBatch,

    #[error("batch row {row} has {len} tokens, expected {expected}")]
    RaggedBatch {
        row: usize,
        len: usize,
        expected: usize,
    },

    #[error("shape mismatch for `{name}`: expected {expected:?}, got {actual:?}")]
    ShapeMismatch {
        name: String,
        expected: Vec<usize>,
        actual: Vec<usize>,
    },

    #[error("missing parameter `{0}`")]
    MissingParameter(String),

    #[error("unexpected parameter `{0}`")]
    UnexpectedParameter(String),

    #[error("invalid sampling settings: {0}")]
    InvalidSampling(String),

    #[error("tokenizer error: {0}")]
    Tokenizer(#[from] TokenizerError),

    #[error("invalid checkpoint: {0}")]
    Checkpoint(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Errors raised by tokenizers
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TokenizerError {
    #[error("text contains special token `{0}` which is not allowed here")]
    DisallowedSpecial(String),

    #[error("token id {0} is not in the vocabulary")]
    UnknownToken(usize),

    #[error("invalid tokenizer: {0}")]
    Invalid(String),
}

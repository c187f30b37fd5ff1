//! Model Configuration
//!
//! [`Config`] holds every architectural hyper-parameter of the GPT model. It is
//! an explicit value passed to [`GptModel::new`](crate::GptModel::new), validated
//! once at construction, and persisted as JSON next to checkpoints.
//!
//! ## Presets
//!
//! | preset        | n_embd | heads | layers | context |
//! |---------------|--------|-------|--------|---------|
//! | `tiny`        | 64     | 2     | 2      | 64      |
//! | `small`       | 128    | 4     | 3      | 128     |
//! | `medium`      | 256    | 4     | 4      | 256     |
//! | `gpt2_124m`   | 768    | 12    | 12     | 256     |

use crate::error::{ModelError, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

/// Vocabulary size of the GPT-2 byte-pair encoding
pub const GPT2_VOCAB_SIZE: usize = 50257;

/// Architecture hyper-parameters for a GPT model
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Config {
    /// Number of distinct token ids
    pub vocab_size: usize,
    /// Maximum number of positions the model can attend over
    pub context_length: usize,
    /// Embedding (hidden) dimension
    pub n_embd: usize,
    /// Number of attention heads; must divide `n_embd`
    pub n_heads: usize,
    /// Number of transformer blocks
    pub n_layers: usize,
    /// Dropout probability used during training
    pub dropout_rate: f32,
    /// Whether the query/key/value projections carry a bias
    pub qkv_bias: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self::gpt2_124m()
    }
}

impl Config {
    /// Tiny config for quick experiments and tests
    pub fn tiny(vocab_size: usize) -> Self {
        Self {
            vocab_size,
            context_length: 64,
            n_embd: 64,
            n_heads: 2,
            n_layers: 2,
            dropout_rate: 0.1,
            qkv_bias: false,
        }
    }

    pub fn small(vocab_size: usize) -> Self {
        Self {
            vocab_size,
            context_length: 128,
            n_embd: 128,
            n_heads: 4,
            n_layers: 3,
            dropout_rate: 0.1,
            qkv_bias: false,
        }
    }

    pub fn medium(vocab_size: usize) -> Self {
        Self {
            vocab_size,
            context_length: 256,
            n_embd: 256,
            n_heads: 4,
            n_layers: 4,
            dropout_rate: 0.1,
            qkv_bias: false,
        }
    }

    /// GPT-2 "124M" architecture
    ///
    /// 768-dimensional embeddings, 12 heads, 12 layers, GPT-2 vocabulary. The
    /// context is shortened to 256 tokens for training on a laptop; use
    /// [`Config::with_context_length`] to restore 1024 when loading released
    /// weights.
    ///
    /// The "124M" figure assumes the output head shares its weights with the
    /// token embedding. This model keeps them separate, see
    /// [`GptModel::count_parameters_tied`](crate::GptModel::count_parameters_tied).
    pub fn gpt2_124m() -> Self {
        Self {
            vocab_size: GPT2_VOCAB_SIZE,
            context_length: 256,
            n_embd: 768,
            n_heads: 12,
            n_layers: 12,
            dropout_rate: 0.1,
            qkv_bias: false,
        }
    }

    /// Look up a preset by name
    pub fn preset(name: &str, vocab_size: usize) -> Result<Self> {
        match name {
            "tiny" => Ok(Self::tiny(vocab_size)),
            "small" => Ok(Self::small(vocab_size)),
            "medium" => Ok(Self::medium(vocab_size)),
            "gpt2-124m" | "gpt2_124m" => Ok(Self {
                vocab_size,
                ..Self::gpt2_124m()
            }),
            other => Err(ModelError::InvalidConfig(format!(
                "unknown preset `{other}` (expected tiny, small, medium or gpt2-124m)"
            ))),
        }
    }

    pub fn with_context_length(mut self, context_length: usize) -> Self {
        self.context_length = context_length;
        self
    }

    pub fn with_dropout(mut self, dropout_rate: f32) -> Self {
        self.dropout_rate = dropout_rate;
        self
    }

    pub fn with_qkv_bias(mut self, qkv_bias: bool) -> Self {
        self.qkv_bias = qkv_bias;
        self
    }

    /// Dimension of a single attention head
    pub fn head_dim(&self) -> usize {
        self.n_embd / self.n_heads
    }

    /// Check the invariants every model relies on
    ///
    /// All sizes must be positive (except `n_layers`, which may be zero),
    /// `n_embd` must be divisible by `n_heads`, and the dropout rate must lie
    /// in `[0, 1)`.
    pub fn validate(&self) -> Result<()> {
        let positive = [
            ("vocab_size", self.vocab_size),
            ("context_length", self.context_length),
            ("n_embd", self.n_embd),
            ("n_heads", self.n_heads),
        ];
        for (name, value) in positive {
            if value == 0 {
                return Err(ModelError::InvalidConfig(format!(
                    "{name} must be greater than zero"
                )));
            }
        }
        if self.n_embd % self.n_heads != 0 {
            return Err(ModelError::InvalidConfig(format!(
                "n_embd ({}) must be divisible by n_heads ({})",
                self.n_embd, self.n_heads
            )));
        }
        if !(0.0..1.0).contains(&self.dropout_rate) {
            return Err(ModelError::InvalidConfig(format!(
                "dropout_rate must be in [0, 1), got {}",
                self.dropout_rate
            )));
        }
        Ok(())
    }

    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let json = serde_json::to_string_pretty(self)?;
        fs::write(path, json)?;
        Ok(())
    }

    /// Read a config from JSON and validate it
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let json = fs::read_to_string(path)?;
        let config: Self = serde_json::from_str(&json)?;
        config.validate()?;
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_presets_are_valid() {
        for config in [
            Config::tiny(100),
            Config::small(100),
            Config::medium(100),
            Config::gpt2_124m(),
        ] {
            config.validate().unwrap();
        }
    }

    #[test]
    fn test_gpt2_124m_matches_reference_sizes() {
        let config = Config::default();
        assert_eq!(config.vocab_size, 50257);
        assert_eq!(config.context_length, 256);
        assert_eq!(config.n_embd, 768);
        assert_eq!(config.head_dim(), 64);
        assert!(!config.qkv_bias);
    }

    #[test]
    fn test_indivisible_heads_rejected() {
        let config = Config {
            n_embd: 10,
            n_heads: 3,
            ..Config::tiny(16)
        };
        let err = config.validate().unwrap_err();
        assert!(matches!(err, ModelError::InvalidConfig(_)));
        assert!(err.to_string().contains("divisible"));
    }

    #[test]
    fn test_zero_layers_allowed() {
        let config = Config {
            n_layers: 0,
            ..Config::tiny(16)
        };
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_bad_dropout_rejected() {
        assert!(Config::tiny(16).with_dropout(1.0).validate().is_err());
        assert!(Config::tiny(16).with_dropout(-0.1).validate().is_err());
    }

    #[test]
    fn test_unknown_preset() {
        assert!(Config::preset("huge", 10).is_err());
        assert_eq!(Config::preset("small", 10).unwrap().vocab_size, 10);
    }

    #[test]
    fn test_save_load_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        let config = Config::tiny(42).with_qkv_bias(true);
        config.save(&path).unwrap();
        assert_eq!(Config::load(&path).unwrap(), config);
    }
}

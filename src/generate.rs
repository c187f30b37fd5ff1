//! Text Generation
//!
//! Autoregressive decoding: feed the context through the model, pick the next
//! token from the last position's logits, append it and repeat.
//!
//! ## One Step
//!
//! ```text
//! window  = last context_size ids of the running sequence
//! logits  = model(window)[last position]           [vocab_size]
//! top-k   : keep the k largest logits, rest -> -inf (optional)
//! T > 0   : p = softmax(logits / T), draw from p with the seeded sampler
//! T == 0  : argmax (first index on ties)
//! eos     : stop before appending if the pick is the end-of-sequence id
//! ```
//!
//! The returned sequence is the prompt followed by every generated id; the
//! window only limits what the model sees.
//!
//! ## Reproducibility
//!
//! All randomness comes from a [`Sampler`] owned by the caller. Two runs with
//! the same model, prompt, config and sampler seed produce the same ids.

use crate::error::{ModelError, Result};
use crate::model::GptModel;
use crate::tokenizer::Tokenizer;
use log::debug;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use serde::{Deserialize, Serialize};

/// Anything that can produce next-token logits for a context
pub trait LanguageModel {
    fn vocab_size(&self) -> usize;

    /// Longest context the model accepts
    fn context_length(&self) -> usize;

    /// Logits for the position after `ids`, one per vocabulary entry
    fn next_token_logits(&self, ids: &[usize]) -> Result<Vec<f32>>;
}

impl LanguageModel for GptModel {
    fn vocab_size(&self) -> usize {
        self.config().vocab_size
    }

    fn context_length(&self) -> usize {
        self.config().context_length
    }

    fn next_token_logits(&self, ids: &[usize]) -> Result<Vec<f32>> {
        let logits = self.forward(&[ids.to_vec()])?;
        let vocab = logits.last_dim();
        let start = logits.numel() - vocab;
        Ok(logits.data[start..].to_vec())
    }
}

/// Decoding settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GenerationConfig {
    /// Upper bound on the number of appended tokens
    pub max_new_tokens: usize,
    /// Number of trailing ids fed to the model each step
    pub context_size: usize,
    /// 0 selects greedy decoding
    pub temperature: f32,
    pub top_k: Option<usize>,
    /// Stop when this id is selected; it is not appended
    pub eos_id: Option<usize>,
}

impl Default for GenerationConfig {
    fn default() -> Self {
        Self {
            max_new_tokens: 50,
            context_size: 256,
            temperature: 0.0,
            top_k: None,
            eos_id: None,
        }
    }
}

impl GenerationConfig {
    pub fn greedy(max_new_tokens: usize, context_size: usize) -> Self {
        Self {
            max_new_tokens,
            context_size,
            ..Self::default()
        }
    }

    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = temperature;
        self
    }

    pub fn with_top_k(mut self, top_k: usize) -> Self {
        self.top_k = Some(top_k);
        self
    }

    pub fn with_eos(mut self, eos_id: usize) -> Self {
        self.eos_id = Some(eos_id);
        self
    }

    pub fn validate(&self) -> Result<()> {
        if !self.temperature.is_finite() || self.temperature < 0.0 {
            return Err(ModelError::InvalidSampling(format!(
                "temperature must be finite and >= 0, got {}",
                self.temperature
            )));
        }
        if self.top_k == Some(0) {
            return Err(ModelError::InvalidSampling("top_k must be at least 1".into()));
        }
        if self.context_size == 0 {
            return Err(ModelError::InvalidSampling(
                "context_size must be at least 1".into(),
            ));
        }
        Ok(())
    }
}

/// Source of randomness for sampling
#[derive(Debug, Clone)]
pub struct Sampler {
    rng: ChaCha8Rng,
}

impl Sampler {
    /// Reproducible sampler
    pub fn new(seed: u64) -> Self {
        Self {
            rng: ChaCha8Rng::seed_from_u64(seed),
        }
    }

    /// Sampler seeded from the thread RNG; runs are not reproducible
    pub fn from_entropy() -> Self {
        Self {
            rng: ChaCha8Rng::from_rng(&mut rand::rng()),
        }
    }

    /// Draw an index from a probability vector
    ///
    /// `probs` need not be normalized. Indices with zero (or non-finite)
    /// probability are never returned; `None` when no entry has positive mass.
    pub fn sample_index(&mut self, probs: &[f32]) -> Option<usize> {
        let total: f32 = probs.iter().filter(|p| p.is_finite() && **p > 0.0).sum();
        if !(total > 0.0 && total.is_finite()) {
            return None;
        }

        let r = self.rng.random::<f32>() * total;
        let mut cumsum = 0.0;
        let mut last_valid = None;
        for (i, &p) in probs.iter().enumerate() {
            if !(p.is_finite() && p > 0.0) {
                continue;
            }
            cumsum += p;
            last_valid = Some(i);
            if r < cumsum {
                return Some(i);
            }
        }
        // Rounding can leave r just above the final cumulative sum
        last_valid
    }
}

/// Index of the largest logit; the lowest index wins ties
pub fn argmax(logits: &[f32]) -> usize {
    let mut best = 0;
    let mut max_val = f32::NEG_INFINITY;
    for (i, &v) in logits.iter().enumerate() {
        if v > max_val {
            max_val = v;
            best = i;
        }
    }
    best
}

/// Keep exactly the `k` largest logits and set the rest to `-inf`
///
/// When several logits tie at the boundary, the lower ids are kept. `k` at
/// or above the vocabulary size is a no-op.
pub fn apply_top_k(logits: &mut [f32], k: usize) {
    if k >= logits.len() {
        return;
    }
    let mut order: Vec<usize> = (0..logits.len()).collect();
    order.sort_by(|&a, &b| logits[b].total_cmp(&logits[a]).then(a.cmp(&b)));
    for &i in &order[k..] {
        logits[i] = f32::NEG_INFINITY;
    }
}

/// `softmax(logits / temperature)`
///
/// Entries at `-inf` get probability zero. The max is subtracted before
/// dividing, so tiny temperatures approach one-hot instead of overflowing.
pub fn softmax_with_temperature(logits: &[f32], temperature: f32) -> Vec<f32> {
    let max_val = logits.iter().copied().fold(f32::NEG_INFINITY, f32::max);
    if !max_val.is_finite() {
        return vec![0.0; logits.len()];
    }
    let exps: Vec<f32> = logits
        .iter()
        .map(|&v| ((v - max_val) / temperature).exp())
        .collect();
    let sum: f32 = exps.iter().sum();
    exps.iter().map(|&e| e / sum).collect()
}

/// Pick the next id from raw logits according to `config`
pub fn select_next_token(logits: &[f32], config: &GenerationConfig, sampler: &mut Sampler) -> usize {
    let mut logits = logits.to_vec();
    if let Some(k) = config.top_k {
        apply_top_k(&mut logits, k);
    }
    if config.temperature > 0.0 {
        sampler
            .sample_index(&softmax_with_temperature(&logits, config.temperature))
            .unwrap_or_else(|| argmax(&logits))
    } else {
        argmax(&logits)
    }
}

/// Extend `prompt` by up to `config.max_new_tokens` ids
///
/// The window fed to the model is the last `context_size` ids, further capped
/// at the model's own context length. Returns the prompt followed by the
/// generated ids; an end-of-sequence pick stops generation without being
/// appended.
pub fn generate<M: LanguageModel + ?Sized>(
    model: &M,
    prompt: &[usize],
    config: &GenerationConfig,
    sampler: &mut Sampler,
) -> Result<Vec<usize>> {
    config.validate()?;
    if prompt.is_empty() {
        return Err(ModelError::EmptyBatch);
    }

    let window = config.context_size.min(model.context_length());
    let mut ids = prompt.to_vec();

    for step in 0..config.max_new_tokens {
        let start = ids.len().saturating_sub(window);
        let logits = model.next_token_logits(&ids[start..])?;
        let next = select_next_token(&logits, config, sampler);

        if config.eos_id == Some(next) {
            debug!("end of sequence after {step} new tokens");
            break;
        }
        ids.push(next);
    }

    Ok(ids)
}

/// Greedy decoding without an end-of-sequence id
pub fn generate_greedy<M: LanguageModel + ?Sized>(
    model: &M,
    prompt: &[usize],
    max_new_tokens: usize,
    context_size: usize,
) -> Result<Vec<usize>> {
    let config = GenerationConfig::greedy(max_new_tokens, context_size);
    generate(model, prompt, &config, &mut Sampler::new(0))
}

/// Encode `prompt`, generate, and decode the full sequence back to text
pub fn generate_text<M, T>(
    model: &M,
    tokenizer: &T,
    prompt: &str,
    config: &GenerationConfig,
    sampler: &mut Sampler,
) -> Result<String>
where
    M: LanguageModel + ?Sized,
    T: Tokenizer + ?Sized,
{
    let ids = tokenizer.encode_with_special(prompt, &[crate::tokenizer::END_OF_TEXT])?;
    let out = generate(model, &ids, config, sampler)?;
    Ok(tokenizer.decode(&out)?)
}

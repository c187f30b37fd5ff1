//! Training
//!
//! Data preparation and the training loop.
//!
//! ## How Sequences Are Generated
//!
//! The loader slides a window of `max_length` ids over the token stream,
//! advancing `stride` ids each time. The target is the same window shifted by
//! one id:
//!
//! ```text
//! Tokens: [1, 2, 3, 4, 5, 6, 7, 8, 9, 10]
//! max_length: 4, stride: 4
//!
//!   Input:  [1, 2, 3, 4]  Target: [2, 3, 4, 5]
//!   Input:  [5, 6, 7, 8]  Target: [6, 7, 8, 9]
//! ```
//!
//! Windows are grouped into batches of `batch_size`, optionally shuffled every
//! epoch with a seeded RNG.
//!
//! ## Training Loop
//!
//! [`train_model_simple`] runs `num_epochs` passes over the training loader.
//! Every `eval_freq` optimizer steps it measures the mean loss over the first
//! `eval_iter` batches of both loaders, and after every epoch it generates a
//! short greedy sample from `start_context`.

use crate::error::{ModelError, Result};
use crate::generate::{generate_text, GenerationConfig, Sampler};
use crate::gradients::clip_gradients;
use crate::loss::{cross_entropy, cross_entropy_with_grad};
use crate::model::GptModel;
use crate::optimizer::{AdamW, AdamWConfig};
use crate::tokenizer::Tokenizer;
use crate::training_logger::{EvalRecord, TrainingLogger};
use log::{debug, info};
use rand::seq::SliceRandom;
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use serde::{Deserialize, Serialize};

/// Input and target rows, each `[batch_size][max_length]`
pub type Batch = (Vec<Vec<usize>>, Vec<Vec<usize>>);

/// Split `text` at `train_ratio` of its length
///
/// The split point moves back to the nearest character boundary.
pub fn train_val_split(text: &str, train_ratio: f32) -> (&str, &str) {
    let ratio = train_ratio.clamp(0.0, 1.0);
    let mut split_idx = (text.len() as f32 * ratio) as usize;
    while !text.is_char_boundary(split_idx) {
        split_idx -= 1;
    }
    text.split_at(split_idx)
}

/// Sliding-window batches over a token stream
#[derive(Debug, Clone)]
pub struct TextDataLoader {
    tokens: Vec<usize>,
    max_length: usize,
    batch_size: usize,
    drop_last: bool,
    /// Start offset of every window, in iteration order
    order: Vec<usize>,
    rng: Option<ChaCha8Rng>,
}

impl TextDataLoader {
    /// Build a loader over `tokens`
    ///
    /// A window starts at every multiple of `stride` that leaves room for its
    /// shifted target.
    pub fn new(tokens: Vec<usize>, max_length: usize, stride: usize, batch_size: usize) -> Result<Self> {
        if max_length == 0 || stride == 0 || batch_size == 0 {
            return Err(ModelError::InvalidConfig(format!(
                "max_length ({max_length}), stride ({stride}) and batch_size ({batch_size}) must be > 0"
            )));
        }

        let order = (0..tokens.len().saturating_sub(max_length))
            .step_by(stride)
            .collect();

        Ok(Self {
            tokens,
            max_length,
            batch_size,
            drop_last: false,
            order,
            rng: None,
        })
    }

    /// Tokenize `text` and build a loader over the result
    pub fn from_text<T: Tokenizer + ?Sized>(
        text: &str,
        tokenizer: &T,
        max_length: usize,
        stride: usize,
        batch_size: usize,
    ) -> Result<Self> {
        let tokens = tokenizer.encode_with_special(text, &[crate::tokenizer::END_OF_TEXT])?;
        debug!("loaded {} tokens from {} bytes of text", tokens.len(), text.len());
        Self::new(tokens, max_length, stride, batch_size)
    }

    /// Reshuffle window order at the start of every epoch
    pub fn with_shuffle(mut self, seed: u64) -> Self {
        self.rng = Some(ChaCha8Rng::seed_from_u64(seed));
        self
    }

    /// Skip a final batch smaller than `batch_size`
    pub fn with_drop_last(mut self, drop_last: bool) -> Self {
        self.drop_last = drop_last;
        self
    }

    /// Prepare the next epoch; a no-op unless shuffling is on
    pub fn start_epoch(&mut self) {
        if let Some(rng) = self.rng.as_mut() {
            self.order.shuffle(rng);
        }
    }

    pub fn num_windows(&self) -> usize {
        self.order.len()
    }

    pub fn num_tokens(&self) -> usize {
        self.tokens.len()
    }

    /// Number of batches one epoch yields
    pub fn len(&self) -> usize {
        if self.drop_last {
            self.order.len() / self.batch_size
        } else {
            self.order.len().div_ceil(self.batch_size)
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Iterate over one epoch of batches in the current order
    pub fn batches(&self) -> impl Iterator<Item = Batch> + '_ {
        self.order
            .chunks(self.batch_size)
            .take(self.len())
            .map(move |starts| {
                starts
                    .iter()
                    .map(|&start| {
                        let end = start + self.max_length;
                        (
                            self.tokens[start..end].to_vec(),
                            self.tokens[start + 1..end + 1].to_vec(),
                        )
                    })
                    .unzip()
            })
    }
}

/// Training loop settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrainingConfig {
    pub num_epochs: usize,
    /// Evaluate every this many optimizer steps
    pub eval_freq: usize,
    /// Batches per loader used for each evaluation
    pub eval_iter: usize,
    /// Prompt for the end-of-epoch sample
    pub start_context: String,
    /// Tokens generated for the end-of-epoch sample
    pub sample_tokens: usize,
    /// Clip the global gradient norm to this value
    pub max_grad_norm: Option<f32>,
    /// Seed for dropout masks
    pub seed: u64,
    pub optimizer: AdamWConfig,
}

impl Default for TrainingConfig {
    fn default() -> Self {
        Self {
            num_epochs: 10,
            eval_freq: 5,
            eval_iter: 5,
            start_context: "Every effort moves you".to_string(),
            sample_tokens: 50,
            max_grad_norm: Some(1.0),
            seed: 123,
            optimizer: AdamWConfig::default(),
        }
    }
}

/// Losses recorded at each evaluation
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TrainingHistory {
    pub train_losses: Vec<f32>,
    pub val_losses: Vec<f32>,
    pub tokens_seen: Vec<usize>,
    /// One sample per epoch
    pub samples: Vec<String>,
}

impl TrainingHistory {
    pub fn best_val_loss(&self) -> Option<f32> {
        self.val_losses
            .iter()
            .copied()
            .filter(|l| l.is_finite())
            .reduce(f32::min)
    }
}

/// Mean cross-entropy of one batch, in evaluation mode
pub fn calc_loss_batch(input: &[Vec<usize>], target: &[Vec<usize>], model: &GptModel) -> Result<f32> {
    let logits = model.forward(input)?;
    cross_entropy(&logits, target)
}

/// Mean batch loss over the first `num_batches` batches (all when `None`)
///
/// An empty loader has no defined loss and yields NaN.
pub fn calc_loss_loader(loader: &TextDataLoader, model: &GptModel, num_batches: Option<usize>) -> Result<f32> {
    if loader.is_empty() {
        return Ok(f32::NAN);
    }
    let num_batches = num_batches.map_or(loader.len(), |n| n.min(loader.len()));
    if num_batches == 0 {
        return Ok(f32::NAN);
    }

    let mut total = 0.0;
    for (input, target) in loader.batches().take(num_batches) {
        total += calc_loss_batch(&input, &target, model)?;
    }
    Ok(total / num_batches as f32)
}

/// `(train_loss, val_loss)` over `eval_iter` batches of each loader
pub fn evaluate_model(
    model: &GptModel,
    train_loader: &TextDataLoader,
    val_loader: &TextDataLoader,
    eval_iter: usize,
) -> Result<(f32, f32)> {
    let train_loss = calc_loss_loader(train_loader, model, Some(eval_iter))?;
    let val_loss = calc_loss_loader(val_loader, model, Some(eval_iter))?;
    Ok((train_loss, val_loss))
}

/// One optimizer step on one batch; returns the batch loss before the update
///
/// Dropout draws its masks from `rng`.
pub fn train_step(
    model: &mut GptModel,
    optimizer: &mut AdamW,
    batch: &Batch,
    rng: &mut ChaCha8Rng,
    max_grad_norm: Option<f32>,
) -> Result<f32> {
    let (input, target) = batch;
    let (logits, cache) = model.forward_with_cache(input, Some(rng))?;
    let (loss, grad_logits) = cross_entropy_with_grad(&logits, target)?;

    let mut grads = model.backward(&grad_logits, &cache);
    if let Some(max_norm) = max_grad_norm {
        let norm = clip_gradients(&mut grads, max_norm);
        debug!("grad norm {norm:.4}");
    }

    optimizer.step(model.named_parameters_mut(), &grads)?;
    Ok(loss)
}

/// Greedily continue `start_context` and flatten newlines for one-line display
pub fn generate_sample<T: Tokenizer + ?Sized>(
    model: &GptModel,
    tokenizer: &T,
    start_context: &str,
    max_new_tokens: usize,
) -> Result<String> {
    let config = GenerationConfig::greedy(max_new_tokens, model.config().context_length);
    let text = generate_text(model, tokenizer, start_context, &config, &mut Sampler::new(0))?;
    Ok(text.replace('\n', " "))
}

/// Train `model` for `config.num_epochs` epochs
///
/// Evaluations happen at global steps 0, `eval_freq`, `2 * eval_freq`, ...
/// and are appended to the returned history (and to `logger` if given).
pub fn train_model_simple<T: Tokenizer + ?Sized>(
    model: &mut GptModel,
    optimizer: &mut AdamW,
    train_loader: &mut TextDataLoader,
    val_loader: &TextDataLoader,
    tokenizer: &T,
    config: &TrainingConfig,
    mut logger: Option<&mut TrainingLogger>,
) -> Result<TrainingHistory> {
    if config.eval_freq == 0 {
        return Err(ModelError::InvalidConfig("eval_freq must be > 0".into()));
    }

    let mut history = TrainingHistory::default();
    let mut rng = ChaCha8Rng::seed_from_u64(config.seed);
    let mut tokens_seen = 0;
    let mut global_step = 0;

    info!(
        "training {} parameters on {} batches/epoch for {} epochs",
        model.count_parameters(),
        train_loader.len(),
        config.num_epochs
    );

    for epoch in 1..=config.num_epochs {
        train_loader.start_epoch();
        let batches: Vec<Batch> = train_loader.batches().collect();

        for batch in &batches {
            train_step(model, optimizer, batch, &mut rng, config.max_grad_norm)?;
            tokens_seen += batch.0.iter().map(Vec::len).sum::<usize>();

            if global_step % config.eval_freq == 0 {
                let (train_loss, val_loss) =
                    evaluate_model(model, train_loader, val_loader, config.eval_iter)?;
                history.train_losses.push(train_loss);
                history.val_losses.push(val_loss);
                history.tokens_seen.push(tokens_seen);
                info!("Ep {epoch} (Step {global_step:06}): Train loss {train_loss:.3}, Val loss {val_loss:.3}");

                if let Some(logger) = logger.as_deref_mut() {
                    let record = EvalRecord {
                        epoch,
                        step: global_step,
                        tokens_seen,
                        train_loss,
                        val_loss,
                    };
                    logger.log(&record, None)?;
                }
            }
            global_step += 1;
        }

        if config.sample_tokens > 0 && !config.start_context.is_empty() {
            let sample = generate_sample(model, tokenizer, &config.start_context, config.sample_tokens)?;
            info!("{sample}");
            history.samples.push(sample);
        }
    }

    Ok(history)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::tokenizer::BpeTokenizer;

    fn ids(n: usize) -> Vec<usize> {
        (0..n).collect()
    }

    #[test]
    fn test_split_ratio() {
        let (train, val) = train_val_split("abcdefghij", 0.9);
        assert_eq!(train, "abcdefghi");
        assert_eq!(val, "j");
    }

    #[test]
    fn test_split_respects_char_boundary() {
        // "é" occupies bytes 1..3, and 0.5 of 5 bytes lands inside it
        let (train, val) = train_val_split("aébc", 0.5);
        assert_eq!(train, "a");
        assert_eq!(val, "ébc");
    }

    #[test]
    fn test_windows_and_target_shift() {
        let loader = TextDataLoader::new(ids(10), 4, 4, 1).unwrap();
        let batches: Vec<Batch> = loader.batches().collect();

        assert_eq!(batches.len(), 2);
        assert_eq!(batches[0], (vec![vec![0, 1, 2, 3]], vec![vec![1, 2, 3, 4]]));
        assert_eq!(batches[1], (vec![vec![4, 5, 6, 7]], vec![vec![5, 6, 7, 8]]));
    }

    #[test]
    fn test_overlapping_stride() {
        let loader = TextDataLoader::new(ids(6), 3, 1, 2).unwrap();
        assert_eq!(loader.num_windows(), 3);
        assert_eq!(loader.len(), 2);

        let batches: Vec<Batch> = loader.batches().collect();
        assert_eq!(batches[0].0, vec![vec![0, 1, 2], vec![1, 2, 3]]);
        assert_eq!(batches[1].0, vec![vec![2, 3, 4]]);
        assert_eq!(batches[1].1, vec![vec![3, 4, 5]]);
    }

    #[test]
    fn test_drop_last() {
        let loader = TextDataLoader::new(ids(6), 3, 1, 2).unwrap().with_drop_last(true);
        assert_eq!(loader.len(), 1);
        assert_eq!(loader.batches().count(), 1);
    }

    #[test]
    fn test_too_short_is_empty() {
        let loader = TextDataLoader::new(ids(4), 4, 1, 2).unwrap();
        assert!(loader.is_empty());
        assert_eq!(loader.batches().count(), 0);
    }

    #[test]
    fn test_rejects_zero_sizes() {
        assert!(TextDataLoader::new(ids(10), 0, 1, 1).is_err());
        assert!(TextDataLoader::new(ids(10), 4, 0, 1).is_err());
        assert!(TextDataLoader::new(ids(10), 4, 1, 0).is_err());
    }

    #[test]
    fn test_shuffle_is_seeded_permutation() {
        let mut a = TextDataLoader::new(ids(40), 2, 2, 4).unwrap().with_shuffle(9);
        let mut b = TextDataLoader::new(ids(40), 2, 2, 4).unwrap().with_shuffle(9);
        a.start_epoch();
        b.start_epoch();

        let first_a: Vec<Batch> = a.batches().collect();
        let first_b: Vec<Batch> = b.batches().collect();
        assert_eq!(first_a, first_b);

        let mut starts: Vec<usize> = first_a.iter().flat_map(|(x, _)| x.iter().map(|w| w[0])).collect();
        starts.sort_unstable();
        assert_eq!(starts, (0..38).step_by(2).collect::<Vec<_>>());
    }

    #[test]
    fn test_loss_loader_empty_is_nan() {
        let model = GptModel::new(&Config::tiny(16).with_dropout(0.0), 0).unwrap();
        let loader = TextDataLoader::new(ids(3), 4, 1, 1).unwrap();
        assert!(calc_loss_loader(&loader, &model, None).unwrap().is_nan());
    }

    #[test]
    fn test_loss_loader_averages_batches() {
        let model = GptModel::new(&Config::tiny(16).with_dropout(0.0), 0).unwrap();
        let loader = TextDataLoader::new(ids(16), 4, 4, 1).unwrap();

        let expected: Vec<f32> = loader
            .batches()
            .take(2)
            .map(|(x, y)| calc_loss_batch(&x, &y, &model).unwrap())
            .collect();
        let mean = calc_loss_loader(&loader, &model, Some(2)).unwrap();
        approx::assert_relative_eq!(mean, (expected[0] + expected[1]) / 2.0, max_relative = 1e-5);

        // A fresh model is close to uniform over the vocabulary
        assert!((mean - (16.0f32).ln()).abs() < 0.5);
    }

    #[test]
    fn test_overfitting_one_batch_reduces_loss() {
        let config = Config::tiny(16).with_context_length(8).with_dropout(0.0);
        let mut model = GptModel::new(&config, 7).unwrap();
        let mut optimizer = AdamW::with_learning_rate(1e-2);
        let mut rng = ChaCha8Rng::seed_from_u64(0);

        let batch: Batch = (
            vec![vec![1, 5, 2, 9, 3, 3, 7, 0]],
            vec![vec![5, 2, 9, 3, 3, 7, 0, 4]],
        );

        let initial = calc_loss_batch(&batch.0, &batch.1, &model).unwrap();
        for _ in 0..30 {
            train_step(&mut model, &mut optimizer, &batch, &mut rng, Some(1.0)).unwrap();
        }
        let trained = calc_loss_batch(&batch.0, &batch.1, &model).unwrap();

        assert_eq!(optimizer.steps(), 30);
        assert!(trained < initial * 0.5, "loss {initial} -> {trained}");
    }

    #[test]
    fn test_train_model_simple_records_history() {
        let tokenizer = BpeTokenizer::new();
        let config = Config::tiny(tokenizer.vocab_size()).with_context_length(8);
        let mut model = GptModel::new(&config, 1).unwrap();
        let mut optimizer = AdamW::new(AdamWConfig::default());

        let text = "the cat sat on the mat. the dog sat on the log. ".repeat(4);
        let (train_text, val_text) = train_val_split(&text, 0.75);
        let mut train_loader = TextDataLoader::from_text(train_text, &tokenizer, 8, 8, 2)
            .unwrap()
            .with_shuffle(3)
            .with_drop_last(true);
        let val_loader = TextDataLoader::from_text(val_text, &tokenizer, 8, 8, 2).unwrap();

        let training = TrainingConfig {
            num_epochs: 2,
            eval_freq: 2,
            eval_iter: 1,
            start_context: "the".into(),
            sample_tokens: 3,
            ..TrainingConfig::default()
        };
        let history = train_model_simple(
            &mut model,
            &mut optimizer,
            &mut train_loader,
            &val_loader,
            &tokenizer,
            &training,
            None,
        )
        .unwrap();

        let steps = 2 * train_loader.len();
        assert_eq!(optimizer.steps(), steps);
        assert_eq!(history.train_losses.len(), steps.div_ceil(2));
        assert_eq!(history.val_losses.len(), history.train_losses.len());
        assert!(history.tokens_seen.windows(2).all(|w| w[0] < w[1]));
        assert_eq!(history.tokens_seen[0], 16);
        assert_eq!(history.samples.len(), 2);
        assert!(history.samples.iter().all(|s| s.starts_with("the")));
        assert!(history.best_val_loss().is_some());
    }
}

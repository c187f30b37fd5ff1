//! Command-line front end: train a model, sample from it, inspect a checkpoint
//!
//! ## Usage
//!
//! ```bash
//! # Train a tokenizer and a tiny model on a text file
//! RUST_LOG=info verdict train --data the-verdict.txt --preset tiny --epochs 10
//!
//! # Sample from the result
//! verdict generate --checkpoint verdict.ckpt --prompt "Every effort moves you" \
//!     --temperature 1.4 --top-k 25 --seed 123
//!
//! # Print config and parameter counts
//! verdict info --checkpoint verdict.ckpt
//! ```

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use log::info;
use std::fs;
use std::path::{Path, PathBuf};
use verdict::{
    generate_text, train_model_simple, train_val_split, AdamW, AdamWConfig, BpeTokenizer, Checkpoint,
    CheckpointMetadata, Config, GenerationConfig, GptModel, Sampler, TextDataLoader, Tokenizer,
    TrainingConfig, TrainingLogger, END_OF_TEXT,
};

/// Fraction of the text used for training; the rest is validation
const TRAIN_RATIO: f32 = 0.9;

#[derive(Parser)]
#[command(name = "verdict", about = "Train and sample from a small GPT model")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Train a tokenizer and a model on a text file
    Train(TrainArgs),
    /// Generate text from a checkpoint
    Generate(GenerateArgs),
    /// Show what a checkpoint contains
    Info {
        #[arg(long)]
        checkpoint: PathBuf,
    },
}

#[derive(clap::Args)]
struct TrainArgs {
    /// Path to training text file
    #[arg(long)]
    data: PathBuf,

    /// Model size: tiny, small, medium or gpt2-124m
    #[arg(long, default_value = "tiny")]
    preset: String,

    /// Vocabulary size for the BPE tokenizer
    #[arg(long, default_value_t = 512)]
    vocab: usize,

    #[arg(long, default_value_t = 10)]
    epochs: usize,

    /// Peak learning rate
    #[arg(long, default_value_t = 4e-4)]
    lr: f32,

    #[arg(long, default_value_t = 0.1)]
    weight_decay: f32,

    #[arg(long, default_value_t = 2)]
    batch_size: usize,

    /// Evaluate every this many steps
    #[arg(long, default_value_t = 5)]
    eval_freq: usize,

    #[arg(long, default_value_t = 5)]
    eval_iter: usize,

    /// Gradient clipping max norm (0 disables clipping)
    #[arg(long, default_value_t = 1.0)]
    grad_clip: f32,

    #[arg(long, default_value_t = 123)]
    seed: u64,

    /// Where to write the checkpoint
    #[arg(long, default_value = "verdict.ckpt")]
    out: PathBuf,

    /// Optional CSV metrics log
    #[arg(long)]
    log: Option<PathBuf>,

    /// Prompt for the sample printed after each epoch
    #[arg(long, default_value = "Every effort moves you")]
    start_context: String,
}

#[derive(clap::Args)]
struct GenerateArgs {
    #[arg(long)]
    checkpoint: PathBuf,

    #[arg(long)]
    prompt: String,

    #[arg(long, default_value_t = 50)]
    max_new_tokens: usize,

    /// 0 selects greedy decoding
    #[arg(long, default_value_t = 0.0)]
    temperature: f32,

    #[arg(long)]
    top_k: Option<usize>,

    /// Seed for sampling; omit for a different sample each run
    #[arg(long)]
    seed: Option<u64>,
}

fn main() -> Result<()> {
    env_logger::init();

    match Cli::parse().command {
        Command::Train(args) => train(args),
        Command::Generate(args) => generate(args),
        Command::Info { checkpoint } => show_info(&checkpoint),
    }
}

fn train(args: TrainArgs) -> Result<()> {
    let text = fs::read_to_string(&args.data)
        .with_context(|| format!("reading training data from {}", args.data.display()))?;
    let (train_text, val_text) = train_val_split(&text, TRAIN_RATIO);

    info!("training tokenizer (target vocab {})", args.vocab);
    let tokenizer = BpeTokenizer::train_new(train_text, args.vocab);
    let config = Config::preset(&args.preset, tokenizer.vocab_size())?;
    let context = config.context_length;

    let mut train_loader = TextDataLoader::from_text(train_text, &tokenizer, context, context, args.batch_size)?
        .with_shuffle(args.seed)
        .with_drop_last(true);
    let val_loader = TextDataLoader::from_text(val_text, &tokenizer, context, context, args.batch_size)?;
    if train_loader.is_empty() {
        bail!(
            "not enough training text: {} tokens for a context of {context}",
            train_loader.num_tokens()
        );
    }

    let mut model = GptModel::new(&config, args.seed)?;
    info!(
        "model: {} parameters ({:.1} MB)",
        model.count_parameters(),
        model.size_mb()
    );

    let training = TrainingConfig {
        num_epochs: args.epochs,
        eval_freq: args.eval_freq,
        eval_iter: args.eval_iter,
        start_context: args.start_context,
        max_grad_norm: (args.grad_clip > 0.0).then_some(args.grad_clip),
        seed: args.seed,
        optimizer: AdamWConfig {
            learning_rate: args.lr,
            weight_decay: args.weight_decay,
            ..AdamWConfig::default()
        },
        ..TrainingConfig::default()
    };
    let mut optimizer = AdamW::new(training.optimizer);

    let mut logger = args
        .log
        .as_ref()
        .map(TrainingLogger::new)
        .transpose()
        .context("creating training log")?;

    let history = train_model_simple(
        &mut model,
        &mut optimizer,
        &mut train_loader,
        &val_loader,
        &tokenizer,
        &training,
        logger.as_mut(),
    )?;

    let metadata = CheckpointMetadata {
        step: optimizer.steps(),
        best_val_loss: history.best_val_loss(),
    };
    Checkpoint::from_model(&model)
        .with_tokenizer(tokenizer)
        .with_metadata(metadata)
        .save(&args.out)
        .with_context(|| format!("writing checkpoint to {}", args.out.display()))?;

    println!("Saved {} after {} steps", args.out.display(), metadata.step);
    Ok(())
}

fn generate(args: GenerateArgs) -> Result<()> {
    let (model, tokenizer) = Checkpoint::load(&args.checkpoint)?.into_model()?;
    let Some(tokenizer) = tokenizer else {
        bail!("{} has no tokenizer", args.checkpoint.display());
    };

    let mut config = GenerationConfig::greedy(args.max_new_tokens, model.config().context_length)
        .with_temperature(args.temperature);
    if let Some(k) = args.top_k {
        config = config.with_top_k(k);
    }
    if let Some(eos) = tokenizer.special_token_id(END_OF_TEXT) {
        config = config.with_eos(eos);
    }

    let mut sampler = match args.seed {
        Some(seed) => Sampler::new(seed),
        None => Sampler::from_entropy(),
    };

    let text = generate_text(&model, &tokenizer, &args.prompt, &config, &mut sampler)?;
    println!("{text}");
    Ok(())
}

fn show_info(path: &Path) -> Result<()> {
    let checkpoint = Checkpoint::load(path)?;
    println!("Config:\n{}", serde_json::to_string_pretty(&checkpoint.config)?);
    println!("Step: {}", checkpoint.metadata.step);
    if let Some(loss) = checkpoint.metadata.best_val_loss {
        println!("Best val loss: {loss:.4}");
    }

    if let Some(tokenizer) = &checkpoint.tokenizer {
        let stats = tokenizer.stats();
        println!(
            "Tokenizer: {} ids ({} bytes, {} special, {} merges)",
            stats.vocab_size, stats.base_tokens, stats.special_tokens, stats.num_merges
        );
    }

    let (model, _) = checkpoint.into_model()?;
    println!("Parameters: {}", model.count_parameters());
    println!("Parameters (tied head): {}", model.count_parameters_tied());
    println!("Size: {:.2} MB", model.size_mb());
    Ok(())
}

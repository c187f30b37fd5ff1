//! Byte Pair Encoding (BPE) Tokenizer
//!
//! Byte-level BPE with one special token, `<|endoftext|>`.
//!
//! ## Id Layout
//!
//! ```text
//! 0..=255       one token per byte value
//! 256           <|endoftext|>
//! 257..         learned merges, in training order
//! ```
//!
//! Every string round-trips: byte tokens cover all input, and decoding just
//! concatenates each token's bytes.
//!
//! ## Training
//!
//! 1. Start from the byte sequence of the corpus
//! 2. Count adjacent pairs (in parallel with Rayon)
//! 3. Merge the most frequent pair into a new token; ties go to the smaller
//!    pair so training is deterministic
//! 4. Repeat until the target vocabulary size is reached or no pair occurs
//!    twice
//!
//! Occurrences of `<|endoftext|>` in the corpus separate documents: no merge
//! is learned across them.
//!
//! ## Special Tokens
//!
//! [`Tokenizer::encode`] refuses text containing a special token so that user
//! text can never inject one by accident. [`Tokenizer::encode_with_special`]
//! maps the listed specials to their ids.

use crate::error::TokenizerError;
use log::{debug, info};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::path::Path;

/// Marks the boundary between documents
pub const END_OF_TEXT: &str = "<|endoftext|>";

/// Number of byte-level base tokens
pub const BYTE_TOKENS: usize = 256;

/// Texts longer than this are encoded in parallel chunks
const PARALLEL_ENCODE_CHUNK: usize = 100_000;

/// Vocabularies needing more merges than this train on a corpus sample
const SAMPLE_MERGE_THRESHOLD: usize = 2000;
const TRAINING_SAMPLE_BYTES: usize = 200_000;

/// Separates documents inside the training buffer; never part of a pair
const BOUNDARY: usize = usize::MAX;

/// Text to token id conversion
pub trait Tokenizer {
    /// Encode ordinary text; special tokens in `text` are an error
    fn encode(&self, text: &str) -> Result<Vec<usize>, TokenizerError> {
        self.encode_with_special(text, &[])
    }

    /// Encode text, mapping the `allowed` special tokens to their ids
    fn encode_with_special(&self, text: &str, allowed: &[&str]) -> Result<Vec<usize>, TokenizerError>;

    fn decode(&self, ids: &[usize]) -> Result<String, TokenizerError>;

    fn vocab_size(&self) -> usize;

    fn special_token_id(&self, token: &str) -> Option<usize>;
}

/// On-disk form: everything else is derived
#[derive(Clone, Serialize, Deserialize)]
struct TokenizerFile {
    specials: Vec<String>,
    merges: Vec<(usize, usize)>,
}

/// Byte-level BPE tokenizer
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(try_from = "TokenizerFile", into = "TokenizerFile")]
pub struct BpeTokenizer {
    specials: Vec<String>,
    /// Merge `i` produces id `first_merge_id() + i`
    merges: Vec<(usize, usize)>,
    /// Bytes of every token, indexed by id
    pieces: Vec<Vec<u8>>,
    /// Pair to merged id
    ranks: HashMap<(usize, usize), usize>,
}

/// Summary of a tokenizer's vocabulary
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TokenizerStats {
    pub vocab_size: usize,
    pub base_tokens: usize,
    pub special_tokens: usize,
    pub num_merges: usize,
}

impl From<BpeTokenizer> for TokenizerFile {
    fn from(tokenizer: BpeTokenizer) -> Self {
        Self {
            specials: tokenizer.specials,
            merges: tokenizer.merges,
        }
    }
}

impl TryFrom<TokenizerFile> for BpeTokenizer {
    type Error = TokenizerError;

    fn try_from(file: TokenizerFile) -> Result<Self, Self::Error> {
        let mut tokenizer = Self::with_specials(file.specials);
        for (a, b) in file.merges {
            let next = tokenizer.vocab_size();
            if a >= next || b >= next {
                return Err(TokenizerError::Invalid(format!(
                    "merge ({a}, {b}) references an id not yet defined at {next}"
                )));
            }
            tokenizer.push_merge((a, b));
        }
        Ok(tokenizer)
    }
}

impl Default for BpeTokenizer {
    fn default() -> Self {
        Self::new()
    }
}

impl BpeTokenizer {
    /// Byte-level tokenizer with `<|endoftext|>` and no merges
    pub fn new() -> Self {
        Self::with_specials(vec![END_OF_TEXT.to_string()])
    }

    fn with_specials(specials: Vec<String>) -> Self {
        let mut pieces: Vec<Vec<u8>> = (0..=255u8).map(|b| vec![b]).collect();
        pieces.extend(specials.iter().map(|s| s.as_bytes().to_vec()));
        Self {
            specials,
            merges: Vec::new(),
            pieces,
            ranks: HashMap::new(),
        }
    }

    /// Train a fresh tokenizer on `text`
    pub fn train_new(text: &str, vocab_size: usize) -> Self {
        let mut tokenizer = Self::new();
        tokenizer.train(text, vocab_size);
        tokenizer
    }

    fn first_merge_id(&self) -> usize {
        BYTE_TOKENS + self.specials.len()
    }

    fn push_merge(&mut self, pair: (usize, usize)) -> usize {
        let id = self.pieces.len();
        let mut piece = self.pieces[pair.0].clone();
        piece.extend_from_slice(&self.pieces[pair.1]);
        self.pieces.push(piece);
        self.merges.push(pair);
        self.ranks.insert(pair, id);
        id
    }

    /// Learn merges from `text` until the vocabulary reaches `vocab_size`
    ///
    /// Training continues from any merges already present.
    pub fn train(&mut self, text: &str, vocab_size: usize) {
        let num_merges = vocab_size.saturating_sub(self.vocab_size());
        if num_merges == 0 {
            return;
        }

        info!(
            "training BPE tokenizer: {} -> {} tokens on {} bytes",
            self.vocab_size(),
            vocab_size,
            text.len()
        );

        let training_text = if num_merges > SAMPLE_MERGE_THRESHOLD && text.len() > TRAINING_SAMPLE_BYTES {
            let mut end = TRAINING_SAMPLE_BYTES;
            while !text.is_char_boundary(end) {
                end -= 1;
            }
            debug!("using a {end}-byte training sample");
            &text[..end]
        } else {
            text
        };

        let mut tokens: Vec<usize> = Vec::with_capacity(training_text.len());
        for (i, doc) in training_text.split(END_OF_TEXT).enumerate() {
            if i > 0 {
                tokens.push(BOUNDARY);
            }
            tokens.extend(doc.bytes().map(usize::from));
        }
        // Continue from an already-trained state
        for (&pair, id) in self.merges.iter().zip(self.first_merge_id()..) {
            tokens = merge_pair(&tokens, pair, id);
        }

        for merge_idx in 0..num_merges {
            let Some((pair, count)) = most_frequent_pair(&tokens) else {
                break;
            };
            if count < 2 {
                debug!("stopping early: no pair occurs more than once");
                break;
            }

            let id = self.push_merge(pair);
            tokens = merge_pair(&tokens, pair, id);

            if merge_idx % 50 == 0 {
                debug!(
                    "merge {}/{}: {:?} (count {}) -> id {}",
                    merge_idx + 1,
                    num_merges,
                    pair,
                    count,
                    id
                );
            }
        }

        info!(
            "tokenizer trained: {} tokens, {} merges",
            self.vocab_size(),
            self.merges.len()
        );
    }

    /// Apply learned merges to one run of ordinary text
    ///
    /// Repeatedly merges the adjacent pair with the lowest rank, which yields
    /// the same tokens as replaying every merge in training order.
    fn encode_ordinary(&self, text: &str) -> Vec<usize> {
        let mut tokens: Vec<usize> = text.bytes().map(usize::from).collect();
        while tokens.len() >= 2 {
            let best = tokens
                .windows(2)
                .filter_map(|w| self.ranks.get(&(w[0], w[1])).map(|&id| ((w[0], w[1]), id)))
                .min_by_key(|&(_, id)| id);
            match best {
                Some((pair, id)) => tokens = merge_pair(&tokens, pair, id),
                None => break,
            }
        }
        tokens
    }

    /// [`Self::encode_ordinary`], split into chunks and run in parallel for
    /// large inputs
    ///
    /// Merges never span a chunk boundary.
    fn encode_chunked(&self, text: &str) -> Vec<usize> {
        if text.len() <= PARALLEL_ENCODE_CHUNK * 2 {
            return self.encode_ordinary(text);
        }

        let mut chunks = Vec::new();
        let mut start = 0;
        while start < text.len() {
            let mut end = (start + PARALLEL_ENCODE_CHUNK).min(text.len());
            while end < text.len() && !text.is_char_boundary(end) {
                end += 1;
            }
            chunks.push(&text[start..end]);
            start = end;
        }

        chunks
            .par_iter()
            .map(|chunk| self.encode_ordinary(chunk))
            .collect::<Vec<_>>()
            .concat()
    }

    /// Bytes of token `id`
    pub fn token_bytes(&self, id: usize) -> Option<&[u8]> {
        self.pieces.get(id).map(Vec::as_slice)
    }

    pub fn num_merges(&self) -> usize {
        self.merges.len()
    }

    pub fn stats(&self) -> TokenizerStats {
        TokenizerStats {
            vocab_size: self.vocab_size(),
            base_tokens: BYTE_TOKENS,
            special_tokens: self.specials.len(),
            num_merges: self.merges.len(),
        }
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string_pretty(self)
    }

    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }

    pub fn save<P: AsRef<Path>>(&self, path: P) -> crate::Result<()> {
        fs::write(path, self.to_json()?)?;
        Ok(())
    }

    pub fn load<P: AsRef<Path>>(path: P) -> crate::Result<Self> {
        let json = fs::read_to_string(path)?;
        Ok(Self::from_json(&json)?)
    }
}

impl Tokenizer for BpeTokenizer {
    fn encode_with_special(&self, text: &str, allowed: &[&str]) -> Result<Vec<usize>, TokenizerError> {
        if let Some(special) = self
            .specials
            .iter()
            .find(|s| !allowed.contains(&s.as_str()) && text.contains(s.as_str()))
        {
            return Err(TokenizerError::DisallowedSpecial(special.clone()));
        }

        let active: Vec<(usize, &str)> = self
            .specials
            .iter()
            .enumerate()
            .filter(|(_, s)| allowed.contains(&s.as_str()))
            .map(|(i, s)| (BYTE_TOKENS + i, s.as_str()))
            .collect();

        let mut ids = Vec::new();
        let mut rest = text;
        loop {
            let next = active
                .iter()
                .filter_map(|&(id, s)| rest.find(s).map(|pos| (pos, id, s.len())))
                .min_by_key(|&(pos, _, _)| pos);
            match next {
                Some((pos, id, len)) => {
                    ids.extend(self.encode_chunked(&rest[..pos]));
                    ids.push(id);
                    rest = &rest[pos + len..];
                }
                None => {
                    ids.extend(self.encode_chunked(rest));
                    return Ok(ids);
                }
            }
        }
    }

    fn decode(&self, ids: &[usize]) -> Result<String, TokenizerError> {
        let mut bytes = Vec::with_capacity(ids.len() * 2);
        for &id in ids {
            let piece = self.pieces.get(id).ok_or(TokenizerError::UnknownToken(id))?;
            bytes.extend_from_slice(piece);
        }
        Ok(String::from_utf8_lossy(&bytes).into_owned())
    }

    fn vocab_size(&self) -> usize {
        self.pieces.len()
    }

    fn special_token_id(&self, token: &str) -> Option<usize> {
        self.specials
            .iter()
            .position(|s| s == token)
            .map(|i| BYTE_TOKENS + i)
    }
}

/// Most frequent adjacent pair, ties broken by the smaller pair
fn most_frequent_pair(tokens: &[usize]) -> Option<((usize, usize), usize)> {
    if tokens.len() < 2 {
        return None;
    }
    let chunk_size = 50_000.max(tokens.len() / rayon::current_num_threads().max(1));

    // Chunks overlap by one token so pairs across boundaries are counted once
    let counts: HashMap<(usize, usize), usize> = (0..tokens.len() - 1)
        .step_by(chunk_size)
        .collect::<Vec<_>>()
        .into_par_iter()
        .fold(HashMap::new, |mut local, start| {
            let end = (start + chunk_size + 1).min(tokens.len());
            for w in tokens[start..end].windows(2) {
                if w[0] != BOUNDARY && w[1] != BOUNDARY {
                    *local.entry((w[0], w[1])).or_insert(0) += 1;
                }
            }
            local
        })
        .reduce(HashMap::new, |mut a, b| {
            for (pair, count) in b {
                *a.entry(pair).or_insert(0) += count;
            }
            a
        });

    counts
        .into_iter()
        .max_by(|(pa, ca), (pb, cb)| ca.cmp(cb).then_with(|| pb.cmp(pa)))
}

/// Replace every non-overlapping occurrence of `pair` (left to right) with `id`
fn merge_pair(tokens: &[usize], pair: (usize, usize), id: usize) -> Vec<usize> {
    let mut out = Vec::with_capacity(tokens.len());
    let mut i = 0;
    while i < tokens.len() {
        if i + 1 < tokens.len() && tokens[i] == pair.0 && tokens[i + 1] == pair.1 {
            out.push(id);
            i += 2;
        } else {
            out.push(tokens[i]);
            i += 1;
        }
    }
    out
}

//! Model Checkpoints
//!
//! A checkpoint bundles everything needed to rebuild a trained model: its
//! config, every named parameter, and optionally the tokenizer it was trained
//! with. Optimizer moments are not stored.
//!
//! ## File Layout
//!
//! All integers are little-endian.
//!
//! ```text
//! b"VERDICT_CKPT"  u8 version
//! u32 len, config JSON
//! u32 count, then per tensor:
//!     u32 len, name (UTF-8)
//!     u32 ndim, u32 dims[ndim]
//!     u32 len, f32 data[len]
//! u8 has_tokenizer, [u32 len, tokenizer JSON]
//! u32 len, metadata JSON
//! ```

use crate::config::Config;
use crate::error::{ModelError, Result};
use crate::model::{GptModel, StateDict};
use crate::tensor::Tensor;
use crate::tokenizer::BpeTokenizer;
use log::info;
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::Path;

const MAGIC: &[u8; 12] = b"VERDICT_CKPT";
const VERSION: u8 = 1;

/// Training progress stored alongside the weights
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CheckpointMetadata {
    pub step: usize,
    pub best_val_loss: Option<f32>,
}

#[derive(Debug, Clone)]
pub struct Checkpoint {
    pub config: Config,
    pub state: StateDict,
    pub tokenizer: Option<BpeTokenizer>,
    pub metadata: CheckpointMetadata,
}

impl Checkpoint {
    /// Snapshot `model` with no training metadata
    pub fn from_model(model: &GptModel) -> Self {
        Self {
            config: model.config().clone(),
            state: model.state_dict(),
            tokenizer: None,
            metadata: CheckpointMetadata {
                step: 0,
                best_val_loss: None,
            },
        }
    }

    pub fn with_tokenizer(mut self, tokenizer: BpeTokenizer) -> Self {
        self.tokenizer = Some(tokenizer);
        self
    }

    pub fn with_metadata(mut self, metadata: CheckpointMetadata) -> Self {
        self.metadata = metadata;
        self
    }

    /// Rebuild the model
    ///
    /// Weights go through [`GptModel::load_state_dict`], so a state dict that
    /// does not match the stored config is rejected.
    pub fn into_model(self) -> Result<(GptModel, Option<BpeTokenizer>)> {
        let mut model = GptModel::new(&self.config, 0)?;
        model.load_state_dict(&self.state)?;
        Ok((model, self.tokenizer))
    }

    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let path = path.as_ref();
        let mut out = BufWriter::new(File::create(path)?);

        out.write_all(MAGIC)?;
        out.write_all(&[VERSION])?;
        write_bytes(&mut out, serde_json::to_string(&self.config)?.as_bytes())?;

        write_u32(&mut out, self.state.len())?;
        for (name, tensor) in &self.state {
            write_bytes(&mut out, name.as_bytes())?;
            write_tensor(&mut out, tensor)?;
        }

        match &self.tokenizer {
            Some(tokenizer) => {
                out.write_all(&[1])?;
                write_bytes(&mut out, tokenizer.to_json()?.as_bytes())?;
            }
            None => out.write_all(&[0])?,
        }

        write_bytes(&mut out, serde_json::to_string(&self.metadata)?.as_bytes())?;
        out.flush()?;

        info!(
            "saved checkpoint to {} ({} tensors{})",
            path.display(),
            self.state.len(),
            if self.tokenizer.is_some() { " + tokenizer" } else { "" }
        );
        Ok(())
    }

    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let mut input = BufReader::new(File::open(path)?);

        let mut header = [0u8; MAGIC.len()];
        input.read_exact(&mut header)?;
        if &header != MAGIC {
            return Err(ModelError::Checkpoint(format!(
                "{} is not a checkpoint (bad header)",
                path.display()
            )));
        }

        let version = read_u8(&mut input)?;
        if version != VERSION {
            return Err(ModelError::Checkpoint(format!(
                "unsupported checkpoint version {version}"
            )));
        }

        let config: Config = serde_json::from_str(&read_string(&mut input)?)?;
        config.validate()?;

        let count = read_u32(&mut input)?;
        let mut state = StateDict::new();
        for _ in 0..count {
            let name = read_string(&mut input)?;
            let tensor = read_tensor(&mut input, &name)?;
            if state.insert(name.clone(), tensor).is_some() {
                return Err(ModelError::Checkpoint(format!("duplicate tensor {name}")));
            }
        }

        let tokenizer = match read_u8(&mut input)? {
            0 => None,
            1 => Some(BpeTokenizer::from_json(&read_string(&mut input)?)?),
            flag => {
                return Err(ModelError::Checkpoint(format!("invalid tokenizer flag {flag}")));
            }
        };

        let metadata: CheckpointMetadata = serde_json::from_str(&read_string(&mut input)?)?;

        info!("loaded checkpoint from {} ({count} tensors)", path.display());
        Ok(Self {
            config,
            state,
            tokenizer,
            metadata,
        })
    }
}

fn write_u32<W: Write>(out: &mut W, value: usize) -> Result<()> {
    let value = u32::try_from(value)
        .map_err(|_| ModelError::Checkpoint(format!("{value} does not fit in 32 bits")))?;
    out.write_all(&value.to_le_bytes())?;
    Ok(())
}

fn write_bytes<W: Write>(out: &mut W, bytes: &[u8]) -> Result<()> {
    write_u32(out, bytes.len())?;
    out.write_all(bytes)?;
    Ok(())
}

fn write_tensor<W: Write>(out: &mut W, tensor: &Tensor) -> Result<()> {
    write_u32(out, tensor.shape.len())?;
    for &dim in &tensor.shape {
        write_u32(out, dim)?;
    }
    write_u32(out, tensor.data.len())?;
    for value in &tensor.data {
        out.write_all(&value.to_le_bytes())?;
    }
    Ok(())
}

fn read_u8<R: Read>(input: &mut R) -> Result<u8> {
    let mut buf = [0u8; 1];
    input.read_exact(&mut buf)?;
    Ok(buf[0])
}

fn read_u32<R: Read>(input: &mut R) -> Result<usize> {
    let mut buf = [0u8; 4];
    input.read_exact(&mut buf)?;
    Ok(u32::from_le_bytes(buf) as usize)
}

fn read_string<R: Read>(input: &mut R) -> Result<String> {
    let len = read_u32(input)?;
    let mut buf = vec![0u8; len];
    input.read_exact(&mut buf)?;
    String::from_utf8(buf).map_err(|e| ModelError::Checkpoint(format!("invalid UTF-8: {e}")))
}

fn read_tensor<R: Read>(input: &mut R, name: &str) -> Result<Tensor> {
    let ndim = read_u32(input)?;
    let shape = (0..ndim).map(|_| read_u32(input)).collect::<Result<Vec<_>>>()?;

    let numel = shape
        .iter()
        .try_fold(1usize, |acc, &dim| acc.checked_mul(dim))
        .ok_or_else(|| ModelError::Checkpoint(format!("{name}: shape {shape:?} overflows")))?;

    let len = read_u32(input)?;
    if len != numel {
        return Err(ModelError::Checkpoint(format!(
            "{name}: {len} values do not fill shape {shape:?}"
        )));
    }

    let byte_len = len
        .checked_mul(4)
        .ok_or_else(|| ModelError::Checkpoint(format!("{name}: {len} values overflow")))?;
    let mut bytes = vec![0u8; byte_len];
    input.read_exact(&mut bytes)?;
    let data = bytes
        .chunks_exact(4)
        .map(|b| f32::from_le_bytes([b[0], b[1], b[2], b[3]]))
        .collect();
    Ok(Tensor::new(data, shape))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tiny_model() -> GptModel {
        GptModel::new(&Config::tiny(32).with_context_length(8), 5).unwrap()
    }

    #[test]
    fn test_roundtrip_reproduces_logits() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("model.ckpt");
        let model = tiny_model();
        let ids = vec![vec![3, 1, 4, 1, 5]];

        let metadata = CheckpointMetadata {
            step: 42,
            best_val_loss: Some(1.25),
        };
        Checkpoint::from_model(&model)
            .with_metadata(metadata)
            .save(&path)
            .unwrap();

        let loaded = Checkpoint::load(&path).unwrap();
        assert_eq!(loaded.metadata, metadata);
        assert_eq!(&loaded.config, model.config());
        assert!(loaded.tokenizer.is_none());

        let (restored, _) = loaded.into_model().unwrap();
        assert_eq!(restored.forward(&ids).unwrap(), model.forward(&ids).unwrap());
    }

    #[test]
    fn test_roundtrip_with_tokenizer() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("model.ckpt");
        let tokenizer = BpeTokenizer::train_new("low lower lowest low low", 260);

        Checkpoint::from_model(&tiny_model())
            .with_tokenizer(tokenizer.clone())
            .save(&path)
            .unwrap();

        let (_, restored) = Checkpoint::load(&path).unwrap().into_model().unwrap();
        let restored = restored.unwrap();
        assert_eq!(restored.num_merges(), tokenizer.num_merges());
    }

    #[test]
    fn test_rejects_bad_header() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("junk.ckpt");
        std::fs::write(&path, b"NOT_A_CHECKPOINT_AT_ALL").unwrap();

        let err = Checkpoint::load(&path).unwrap_err();
        assert!(matches!(err, ModelError::Checkpoint(_)));
    }

    #[test]
    fn test_truncated_file_is_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("model.ckpt");
        Checkpoint::from_model(&tiny_model()).save(&path).unwrap();

        let bytes = std::fs::read(&path).unwrap();
        std::fs::write(&path, &bytes[..bytes.len() / 2]).unwrap();
        assert!(Checkpoint::load(&path).is_err());
    }

    #[test]
    fn test_overflowing_shape_is_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("huge.ckpt");
        let config = serde_json::to_string(&Config::tiny(32)).unwrap();

        let mut bytes = Vec::new();
        bytes.extend_from_slice(MAGIC);
        bytes.push(VERSION);
        write_bytes(&mut bytes, config.as_bytes()).unwrap();
        write_u32(&mut bytes, 1).unwrap();
        write_bytes(&mut bytes, b"token_embedding.weight").unwrap();
        write_u32(&mut bytes, 4).unwrap();
        for _ in 0..4 {
            write_u32(&mut bytes, 65536).unwrap();
        }
        write_u32(&mut bytes, 0).unwrap();
        std::fs::write(&path, &bytes).unwrap();

        let err = Checkpoint::load(&path).unwrap_err();
        assert!(matches!(err, ModelError::Checkpoint(ref msg) if msg.contains("overflows")));
    }

    #[test]
    fn test_mismatched_state_is_rejected() {
        let mut checkpoint = Checkpoint::from_model(&tiny_model());
        checkpoint
            .state
            .insert("lm_head.weight".into(), Tensor::zeros(vec![32, 64]));

        let err = checkpoint.into_model().unwrap_err();
        assert!(matches!(err, ModelError::ShapeMismatch { ref name, .. } if name == "lm_head.weight"));
    }
}

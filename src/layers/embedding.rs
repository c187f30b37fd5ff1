//! Embedding Lookup
//!
//! A table of `num_embeddings` learned vectors. The token embedding maps ids to
//! vectors; the position embedding maps positions `0..seq_len` to vectors.
//!
//! The backward pass scatters each output row's gradient back onto the table
//! row it was read from. Rows read several times receive the sum.

use super::{normal_init, param_name, Parameters, INIT_STD};
use crate::error::{ModelError, Result};
use crate::gradients::Gradients;
use crate::tensor::Tensor;
use rand::Rng;

#[derive(Debug, Clone)]
pub struct Embedding {
    /// `[num_embeddings, embedding_dim]`
    pub weight: Tensor,
}

impl Embedding {
    pub fn new<R: Rng + ?Sized>(num_embeddings: usize, embedding_dim: usize, rng: &mut R) -> Self {
        Self {
            weight: normal_init(vec![num_embeddings, embedding_dim], INIT_STD, rng),
        }
    }

    pub fn num_embeddings(&self) -> usize {
        self.weight.shape[0]
    }

    pub fn embedding_dim(&self) -> usize {
        self.weight.shape[1]
    }

    /// Look up `ids` (a rectangular batch) into `[batch, seq, dim]`
    pub fn forward(&self, ids: &[Vec<usize>]) -> Result<Tensor> {
        let dim = self.embedding_dim();
        let batch = ids.len();
        let seq = ids.first().map_or(0, Vec::len);

        let mut data = Vec::with_capacity(batch * seq * dim);
        for &id in ids.iter().flatten() {
            if id >= self.num_embeddings() {
                return Err(ModelError::TokenOutOfRange {
                    id,
                    vocab_size: self.num_embeddings(),
                });
            }
            data.extend_from_slice(&self.weight.data[id * dim..(id + 1) * dim]);
        }
        Ok(Tensor::new(data, vec![batch, seq, dim]))
    }

    /// Rows `0..seq_len` as a `[seq_len, dim]` tensor
    ///
    /// # Panics
    ///
    /// Panics if `seq_len` exceeds the table size; callers check the context
    /// length first.
    pub fn positions(&self, seq_len: usize) -> Tensor {
        let dim = self.embedding_dim();
        assert!(
            seq_len <= self.num_embeddings(),
            "position {} out of range for {} positions",
            seq_len,
            self.num_embeddings()
        );
        Tensor::new(self.weight.data[..seq_len * dim].to_vec(), vec![seq_len, dim])
    }

    /// Scatter-add `grad_out` (`[..., dim]`, one row per id) into `{prefix}.weight`
    pub fn backward<'a, I>(&self, grad_out: &Tensor, ids: I, prefix: &str, grads: &mut Gradients)
    where
        I: IntoIterator<Item = &'a usize>,
    {
        let dim = self.embedding_dim();
        let mut grad = Tensor::zeros(self.weight.shape.clone());
        for (row, &id) in grad_out.data.chunks(dim).zip(ids) {
            for (g, &v) in grad.data[id * dim..(id + 1) * dim].iter_mut().zip(row) {
                *g += v;
            }
        }
        grads.accumulate(param_name(prefix, "weight"), grad);
    }
}

impl Parameters for Embedding {
    fn parameters<'a>(&'a self, prefix: &str, out: &mut Vec<(String, &'a Tensor)>) {
        out.push((param_name(prefix, "weight"), &self.weight));
    }

    fn parameters_mut<'a>(&'a mut self, prefix: &str, out: &mut Vec<(String, &'a mut Tensor)>) {
        out.push((param_name(prefix, "weight"), &mut self.weight));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn table() -> Embedding {
        Embedding {
            weight: Tensor::new((0..8).map(|x| x as f32).collect(), vec![4, 2]),
        }
    }

    #[test]
    fn test_lookup() {
        let y = table().forward(&[vec![3, 0], vec![1, 1]]).unwrap();
        assert_eq!(y.shape, vec![2, 2, 2]);
        assert_eq!(y.data, vec![6.0, 7.0, 0.0, 1.0, 2.0, 3.0, 2.0, 3.0]);
    }

    #[test]
    fn test_out_of_range_id() {
        let err = table().forward(&[vec![0, 4]]).unwrap_err();
        assert!(matches!(err, ModelError::TokenOutOfRange { id: 4, vocab_size: 4 }));
    }

    #[test]
    fn test_backward_accumulates_repeated_ids() {
        let emb = table();
        let ids = [1usize, 1, 2];
        let grad_out = Tensor::ones(vec![3, 2]);
        let mut grads = Gradients::new();
        emb.backward(&grad_out, ids.iter(), "tok", &mut grads);
        assert_eq!(
            grads.get("tok.weight").unwrap().data,
            vec![0.0, 0.0, 2.0, 2.0, 1.0, 1.0, 0.0, 0.0]
        );
    }
}

//! Dropout Layer
//!
//! Randomly zeros activations during training and rescales the survivors by
//! `1 / (1 - rate)` so the expected value is unchanged. Inference passes values
//! through untouched.
//!
//! Whether a call is "training" is decided by the caller: passing an RNG turns
//! dropout on, passing `None` turns it off. Masks are drawn from that RNG, so a
//! seeded training run is reproducible.

use crate::tensor::Tensor;
use rand::Rng;
use rand_chacha::ChaCha8Rng;

#[derive(Debug, Clone, Copy)]
pub struct Dropout {
    pub rate: f32,
}

#[derive(Debug, Clone)]
pub struct DropoutCache {
    /// Keep mask, `None` when dropout was not applied
    pub mask: Option<Vec<bool>>,
    pub scale: f32,
}

impl Dropout {
    pub fn new(rate: f32) -> Self {
        assert!(
            (0.0..1.0).contains(&rate),
            "Dropout rate must be in [0.0, 1.0), got {rate}"
        );
        Self { rate }
    }

    pub fn forward(&self, x: &Tensor, rng: Option<&mut ChaCha8Rng>) -> (Tensor, DropoutCache) {
        let rng = match rng {
            Some(rng) if self.rate > 0.0 => rng,
            _ => {
                let cache = DropoutCache {
                    mask: None,
                    scale: 1.0,
                };
                return (x.clone(), cache);
            }
        };

        let scale = 1.0 / (1.0 - self.rate);
        let mask: Vec<bool> = (0..x.numel())
            .map(|_| rng.random::<f32>() >= self.rate)
            .collect();

        let output = x
            .data
            .iter()
            .zip(&mask)
            .map(|(&v, &keep)| if keep { v * scale } else { 0.0 })
            .collect();

        let cache = DropoutCache {
            mask: Some(mask),
            scale,
        };
        (Tensor::new(output, x.shape.clone()), cache)
    }

    /// Route gradients through the same mask used in the forward pass
    pub fn backward(&self, grad_output: &Tensor, cache: &DropoutCache) -> Tensor {
        match &cache.mask {
            Some(mask) => {
                let grad = grad_output
                    .data
                    .iter()
                    .zip(mask)
                    .map(|(&g, &keep)| if keep { g * cache.scale } else { 0.0 })
                    .collect();
                Tensor::new(grad, grad_output.shape.clone())
            }
            None => grad_output.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;

    #[test]
    fn test_eval_mode_is_identity() {
        let dropout = Dropout::new(0.5);
        let x = Tensor::new(vec![1.0, 2.0, 3.0], vec![3]);
        let (y, cache) = dropout.forward(&x, None);
        assert_eq!(y, x);
        assert!(cache.mask.is_none());
    }

    #[test]
    fn test_training_mask_scales_and_routes_gradients() {
        let dropout = Dropout::new(0.5);
        let mut rng = ChaCha8Rng::seed_from_u64(7);
        let x = Tensor::ones(vec![1000]);
        let (y, cache) = dropout.forward(&x, Some(&mut rng));

        let kept = y.data.iter().filter(|&&v| v != 0.0).count();
        assert!(kept > 400 && kept < 600, "kept {kept}");
        assert!(y.data.iter().all(|&v| v == 0.0 || v == 2.0));

        let grad = dropout.backward(&Tensor::ones(vec![1000]), &cache);
        assert_eq!(grad, y);
    }

    #[test]
    fn test_same_seed_same_mask() {
        let dropout = Dropout::new(0.3);
        let x = Tensor::ones(vec![64]);
        let (a, _) = dropout.forward(&x, Some(&mut ChaCha8Rng::seed_from_u64(3)));
        let (b, _) = dropout.forward(&x, Some(&mut ChaCha8Rng::seed_from_u64(3)));
        assert_eq!(a, b);
    }
}

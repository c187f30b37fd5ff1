//! AdamW Optimizer
//!
//! Adam with decoupled weight decay, the standard optimizer for transformers.
//!
//! ## Algorithm
//!
//! For each parameter θ with gradient g at step t:
//!
//! ```text
//! θ = θ * (1 - α * λ)              # Weight decay (weight matrices only)
//! m = β₁ * m + (1 - β₁) * g        # First moment (momentum)
//! v = β₂ * v + (1 - β₂) * g²       # Second moment (variance)
//! m_hat = m / (1 - β₁^t)           # Bias correction
//! v_hat = v / (1 - β₂^t)           # Bias correction
//! θ = θ - α * m_hat / (√v_hat + ε) # Parameter update
//! ```
//!
//! Defaults: α = 4e-4, λ = 0.1, β₁ = 0.9, β₂ = 0.999, ε = 1e-8.
//!
//! ## Selective Weight Decay
//!
//! Decay applies only to 2D weight matrices of linear layers. Biases,
//! LayerNorm scales and shifts, and the embedding tables are not decayed.
//!
//! ## State
//!
//! Moment estimates are kept per parameter name and created lazily on the
//! first step that sees a gradient for that name. A parameter without a
//! gradient in a step is left unchanged.

use crate::error::{ModelError, Result};
use crate::gradients::Gradients;
use crate::tensor::Tensor;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Tensors larger than this are updated in parallel
const PARALLEL_UPDATE_THRESHOLD: usize = 1000;

/// AdamW hyper-parameters
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct AdamWConfig {
    pub learning_rate: f32,
    pub weight_decay: f32,
    pub beta1: f32,
    pub beta2: f32,
    pub epsilon: f32,
}

impl Default for AdamWConfig {
    fn default() -> Self {
        Self {
            learning_rate: 4e-4,
            weight_decay: 0.1,
            beta1: 0.9,
            beta2: 0.999,
            epsilon: 1e-8,
        }
    }
}

#[derive(Debug, Clone)]
struct Moments {
    m: Vec<f32>,
    v: Vec<f32>,
}

/// AdamW optimizer state
#[derive(Debug, Clone)]
pub struct AdamW {
    pub config: AdamWConfig,
    step: usize,
    moments: HashMap<String, Moments>,
}

/// Whether `name` (with `shape`) receives weight decay
pub fn decays(name: &str, shape: &[usize]) -> bool {
    shape.len() == 2 && name.ends_with(".weight") && !name.contains("embedding")
}

impl AdamW {
    pub fn new(config: AdamWConfig) -> Self {
        Self {
            config,
            step: 0,
            moments: HashMap::new(),
        }
    }

    pub fn with_learning_rate(learning_rate: f32) -> Self {
        Self::new(AdamWConfig {
            learning_rate,
            ..AdamWConfig::default()
        })
    }

    /// Number of completed steps
    pub fn steps(&self) -> usize {
        self.step
    }

    /// Apply one update to every parameter that has a gradient
    ///
    /// `params` comes from [`GptModel::named_parameters_mut`](crate::GptModel::named_parameters_mut).
    /// Every gradient shape is checked before any parameter changes.
    pub fn step<'a, I>(&mut self, params: I, grads: &Gradients) -> Result<()>
    where
        I: IntoIterator<Item = (String, &'a mut Tensor)>,
    {
        let params: Vec<(String, &'a mut Tensor)> = params.into_iter().collect();
        for (name, param) in &params {
            if let Some(grad) = grads.get(name) {
                if grad.shape != param.shape {
                    return Err(ModelError::ShapeMismatch {
                        name: format!("gradient of {name}"),
                        expected: param.shape.clone(),
                        actual: grad.shape.clone(),
                    });
                }
            }
        }

        self.step += 1;
        let t = self.step as i32;
        let AdamWConfig {
            learning_rate: lr,
            weight_decay,
            beta1,
            beta2,
            epsilon,
        } = self.config;
        let bias_correction1 = 1.0 - beta1.powi(t);
        let bias_correction2 = 1.0 - beta2.powi(t);

        for (name, param) in params {
            let Some(grad) = grads.get(&name) else {
                continue;
            };
            let apply_decay = decays(&name, &param.shape);
            let state = self.moments.entry(name).or_insert_with(|| Moments {
                m: vec![0.0; param.numel()],
                v: vec![0.0; param.numel()],
            });

            let update = |(((p, &g), m), v): (((&mut f32, &f32), &mut f32), &mut f32)| {
                if apply_decay {
                    *p *= 1.0 - lr * weight_decay;
                }
                *m = beta1 * *m + (1.0 - beta1) * g;
                *v = beta2 * *v + (1.0 - beta2) * g * g;
                let m_hat = *m / bias_correction1;
                let v_hat = *v / bias_correction2;
                *p -= lr * m_hat / (v_hat.sqrt() + epsilon);
            };

            if param.numel() > PARALLEL_UPDATE_THRESHOLD {
                param
                    .data
                    .par_iter_mut()
                    .zip(grad.data.par_iter())
                    .zip(state.m.par_iter_mut())
                    .zip(state.v.par_iter_mut())
                    .for_each(update);
            } else {
                param
                    .data
                    .iter_mut()
                    .zip(grad.data.iter())
                    .zip(state.m.iter_mut())
                    .zip(state.v.iter_mut())
                    .for_each(update);
            }
        }
        Ok(())
    }
}

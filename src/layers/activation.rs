//! Activation Functions
//!
//! ## GELU (Gaussian Error Linear Unit)
//!
//! The feed-forward network uses GELU with the tanh approximation GPT-2 was
//! trained with:
//!
//! ```text
//! GELU(x) ≈ 0.5 × x × (1 + tanh(√(2/π) × (x + 0.044715 × x³)))
//! ```
//!
//! Its derivative, needed by the backward pass:
//!
//! ```text
//! GELU'(x) = 0.5 × (1 + tanh(u)) + 0.5 × x × sech²(u) × √(2/π) × (1 + 3 × 0.044715 × x²)
//! where u = √(2/π) × (x + 0.044715 × x³)
//! ```

use crate::tensor::Tensor;
use rayon::prelude::*;

const GELU_COEFF: f32 = 0.044715;

#[inline]
fn sqrt_2_over_pi() -> f32 {
    (2.0 / std::f32::consts::PI).sqrt()
}

/// Scalar GELU (tanh approximation)
#[inline]
pub fn gelu(x: f32) -> f32 {
    0.5 * x * (1.0 + (sqrt_2_over_pi() * (x + GELU_COEFF * x.powi(3))).tanh())
}

/// Derivative of [`gelu`] at `x`
#[inline]
pub fn gelu_grad(x: f32) -> f32 {
    let tanh_inner = (sqrt_2_over_pi() * (x + GELU_COEFF * x.powi(3))).tanh();
    let sech_sq = 1.0 - tanh_inner * tanh_inner;
    0.5 * (1.0 + tanh_inner)
        + 0.5 * x * sech_sq * sqrt_2_over_pi() * (1.0 + 3.0 * GELU_COEFF * x * x)
}

pub fn gelu_forward(x: &Tensor) -> Tensor {
    x.map(gelu)
}

/// Chain rule through GELU: `grad_out * GELU'(x)`
pub fn gelu_backward(grad_out: &Tensor, x: &Tensor) -> Tensor {
    assert_eq!(grad_out.shape, x.shape, "gelu_backward shape mismatch");
    let grad = x
        .data
        .par_iter()
        .zip(&grad_out.data)
        .map(|(&x_val, &g)| g * gelu_grad(x_val))
        .collect();
    Tensor::new(grad, x.shape.clone())
}

//! Discrete SIR-style infection rollout driven by a learned rate.
//!
//! Starting from `I₀`, each forecast day adds
//! `dIᵢ = α · Iᵢ · (N − Iᵢ) / N` with `Iᵢ₊₁ = Iᵢ + dIᵢ`. Only `α` carries a
//! gradient: the accumulated `Iᵢ` is treated as a constant at every step.

use crate::core::{Error, Result};
use candle_core::Tensor;

/// Plain-valued rollout of `steps` daily increments.
pub fn sir_increments(alpha: f32, population: f32, initial: f32, steps: usize) -> Vec<f32> {
    let mut out = Vec::with_capacity(steps);
    let mut infected = initial;
    for i in 0..steps {
        if i > 0 {
            infected += out[i - 1];
        }
        out.push(alpha * infected * ((population - infected) / population));
    }
    out
}

/// Differentiable rollout as a `1 × steps` row. `alpha` must be `1 × 1`.
pub fn rollout(alpha: &Tensor, population: f32, initial: f32, steps: usize) -> Result<Tensor> {
    if alpha.dims() != [1, 1] {
        return Err(Error::ShapeMismatch(format!(
            "rate must be 1x1, got {:?}",
            alpha.dims()
        )));
    }
    if population.is_nan() || population <= 0.0 {
        return Err(Error::InvalidConfig(format!(
            "population must be positive, got {population}"
        )));
    }
    if steps == 0 {
        return Err(Error::InvalidConfig("rollout needs at least one step".to_string()));
    }
    let mut infected = Tensor::new(&[[initial]], alpha.device())?;
    let mut parts = Vec::with_capacity(steps);
    for _ in 0..steps {
        // I · (1 − I/N)
        let coefficient = (&infected * infected.affine(-1.0 / population as f64, 1.0)?)?;
        let increment = (alpha * &coefficient)?;
        infected = (infected + increment.detach())?;
        parts.push(increment);
    }
    Ok(Tensor::cat(&parts, 1)?)
}

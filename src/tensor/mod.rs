//! Tensor plumbing on top of candle.
//!
//! - Seeded variance-scaling initializers
//! - A named parameter store over `candle_nn::VarMap`
//! - Host-side helpers for finiteness checks and scalar reads

pub mod init;
pub mod params;

pub use init::{calculate_gain, orthogonal, xavier_normal, xavier_uniform, Nonlinearity};
pub use params::{ParamStore, TensorSnapshot};

use crate::core::Result;
use candle_core::Tensor;

/// Whether every element of `t` is finite.
pub fn all_finite(t: &Tensor) -> Result<bool> {
    Ok(t.flatten_all()?
        .to_vec1::<f32>()?
        .iter()
        .all(|v| v.is_finite()))
}

/// Value of a single-element tensor of any rank.
pub fn scalar(t: &Tensor) -> Result<f32> {
    Ok(t.sum_all()?.to_scalar::<f32>()?)
}

//! Adam on candle variables, with exportable moment state.
//!
//! Implements [`candle_nn::Optimizer`] so it can drive any `Var` list; the
//! moments are kept as tensors and can be snapshotted into a checkpoint.

use crate::core::{Error, Result};
use crate::tensor::{all_finite, TensorSnapshot};
use candle_core::backprop::GradStore;
use candle_core::{Device, Tensor, Var};
use candle_nn::Optimizer;
use serde::{Deserialize, Serialize};

/// Adam hyperparameters.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct AdamParams {
    pub learning_rate: f64,
    pub beta1: f64,
    pub beta2: f64,
    pub epsilon: f64,
}

impl Default for AdamParams {
    fn default() -> Self {
        Self {
            learning_rate: 1e-3,
            beta1: 0.9,
            beta2: 0.999,
            epsilon: 1e-8,
        }
    }
}

/// Serializable optimizer state.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct AdamState {
    pub params: AdamParams,
    /// Completed update steps
    pub steps: u64,
    pub first_moment: Vec<TensorSnapshot>,
    pub second_moment: Vec<TensorSnapshot>,
}

struct Slot {
    var: Var,
    m: Var,
    v: Var,
}

/// Adam with bias-corrected moment estimates.
pub struct Adam {
    slots: Vec<Slot>,
    params: AdamParams,
    steps: u64,
}

impl Optimizer for Adam {
    type Config = AdamParams;

    fn new(vars: Vec<Var>, params: AdamParams) -> candle_core::Result<Self> {
        let slots = vars
            .into_iter()
            .map(|var| {
                let m = Var::from_tensor(&var.zeros_like()?)?;
                let v = Var::from_tensor(&var.zeros_like()?)?;
                Ok(Slot { var, m, v })
            })
            .collect::<candle_core::Result<Vec<_>>>()?;
        Ok(Self {
            slots,
            params,
            steps: 0,
        })
    }

    fn step(&mut self, grads: &GradStore) -> candle_core::Result<()> {
        self.steps += 1;
        let p = &self.params;
        let t = self.steps as i32;
        let bias1 = 1.0 - p.beta1.powi(t);
        let bias2 = 1.0 - p.beta2.powi(t);
        for slot in &self.slots {
            let Some(g) = grads.get(slot.var.as_tensor()) else {
                continue;
            };
            let m = ((slot.m.as_tensor() * p.beta1)? + (g * (1.0 - p.beta1))?)?;
            let v = ((slot.v.as_tensor() * p.beta2)? + (g.sqr()? * (1.0 - p.beta2))?)?;
            let m_hat = (&m / bias1)?;
            let v_hat = (&v / bias2)?;
            let update = (m_hat / (v_hat.sqrt()? + p.epsilon)?)?;
            let next = (slot.var.as_tensor() - (update * p.learning_rate)?)?;
            slot.m.set(&m)?;
            slot.v.set(&v)?;
            slot.var.set(&next)?;
        }
        Ok(())
    }

    fn learning_rate(&self) -> f64 {
        self.params.learning_rate
    }

    fn set_learning_rate(&mut self, lr: f64) {
        self.params.learning_rate = lr;
    }
}

impl Adam {
    pub fn steps(&self) -> u64 {
        self.steps
    }

    /// Apply one update. Any non-finite gradient leaves every variable and
    /// moment untouched.
    pub fn apply(&mut self, grads: &GradStore) -> Result<()> {
        for slot in &self.slots {
            if let Some(g) = grads.get(slot.var.as_tensor()) {
                if !all_finite(g)? {
                    return Err(Error::NumericInstability {
                        stage: "gradients".to_string(),
                        step: self.steps as usize,
                    });
                }
            }
        }
        Ok(self.step(grads)?)
    }

    pub fn state(&self) -> Result<AdamState> {
        let mut first_moment = Vec::with_capacity(self.slots.len());
        let mut second_moment = Vec::with_capacity(self.slots.len());
        for (i, slot) in self.slots.iter().enumerate() {
            first_moment.push(TensorSnapshot::from_tensor(i.to_string(), slot.m.as_tensor())?);
            second_moment.push(TensorSnapshot::from_tensor(i.to_string(), slot.v.as_tensor())?);
        }
        Ok(AdamState {
            params: self.params.clone(),
            steps: self.steps,
            first_moment,
            second_moment,
        })
    }

    /// Load moments saved by [`Adam::state`] for the same variable list.
    pub fn restore(&mut self, state: &AdamState, device: &Device) -> Result<()> {
        let fits = |moments: &[TensorSnapshot]| {
            moments.len() == self.slots.len()
                && self
                    .slots
                    .iter()
                    .zip(moments)
                    .all(|(s, m)| s.var.dims() == m.shape.as_slice())
        };
        if !fits(&state.first_moment) || !fits(&state.second_moment) {
            return Err(Error::CheckpointCorrupted(
                "optimizer state does not match the parameters".to_string(),
            ));
        }
        for ((slot, m), v) in self
            .slots
            .iter()
            .zip(&state.first_moment)
            .zip(&state.second_moment)
        {
            slot.m.set(&m.to_tensor(device)?)?;
            slot.v.set(&v.to_tensor(device)?)?;
        }
        self.params = state.params.clone();
        self.steps = state.steps;
        Ok(())
    }
}

//! Spatio-temporal forecaster with a physics-constrained rate head.
//!
//! For every window of a [`RegionRollout`], in order:
//! 1. the attention encoder embeds all regions' histories;
//! 2. embeddings are max-pooled over regions;
//! 3. the GRU advances the hidden state;
//! 4. the state plus the region's current anchor feeds a direct `P`-day
//!    head and a scalar rate head;
//! 5. the sigmoid rate drives an SIR-style rollout from the last raw count.

use crate::core::{Error, Result};
use crate::gnn::attention::{EdgeIndex, GatEncoder, HeadMerge};
use crate::gnn::learner::RegionRollout;
use crate::gnn::physics;
use crate::gnn::temporal::GruCell;
use crate::graph::RegionGraph;
use crate::tensor::{all_finite, scalar, xavier_uniform, ParamStore};
use candle_core::Tensor;
use candle_nn::{Linear, Module};
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Model hyperparameters.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelConfig {
    /// Per-head width of the first attention layer
    pub hidden_dim1: usize,
    /// Width of the second attention layer
    pub hidden_dim2: usize,
    /// Recurrent state width
    pub gru_dim: usize,
    /// Heads in the first attention layer
    pub num_heads: usize,
    /// How first-layer heads are combined
    pub head_merge: HeadMerge,
    /// Negative slope of the attention-logit activation
    pub leaky_relu_slope: f32,
    /// ELU scale between and after attention layers
    pub elu_alpha: f32,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            hidden_dim1: 32,
            hidden_dim2: 32,
            gru_dim: 32,
            num_heads: 1,
            head_merge: HeadMerge::Concat,
            leaky_relu_slope: 0.01,
            elu_alpha: 1.0,
        }
    }
}

impl ModelConfig {
    pub fn validate(&self) -> Result<()> {
        if self.hidden_dim1 == 0 || self.hidden_dim2 == 0 || self.gru_dim == 0 {
            return Err(Error::InvalidConfig(
                "model dimensions must be positive".to_string(),
            ));
        }
        if self.num_heads == 0 {
            return Err(Error::InvalidConfig("num_heads must be positive".to_string()));
        }
        if !self.leaky_relu_slope.is_finite() || !(self.elu_alpha.is_finite() && self.elu_alpha > 0.0) {
            return Err(Error::InvalidConfig(
                "activation parameters must be finite, elu_alpha positive".to_string(),
            ));
        }
        Ok(())
    }
}

/// Forecaster stage after the encoder, used in instability reports.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ForecastStage {
    Pooling,
    Recurrent,
    DirectHead,
    RateHead,
    PhysicsRollout,
}

impl fmt::Display for ForecastStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ForecastStage::Pooling => "pooling",
            ForecastStage::Recurrent => "recurrent",
            ForecastStage::DirectHead => "direct_head",
            ForecastStage::RateHead => "rate_head",
            ForecastStage::PhysicsRollout => "physics_rollout",
        };
        f.write_str(name)
    }
}

/// Learned rate per window, before and after the sigmoid.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct RateTrace {
    /// Rate-head logits, one per window
    pub raw: Vec<f32>,
    /// `σ(raw)`, the rate fed to the rollout
    pub scaled: Vec<f32>,
}

/// Result of one rollout.
#[derive(Clone, Debug)]
pub struct ForecastTrace {
    /// `windows × P` direct predictions, normalized scale
    pub direct: Tensor,
    /// `windows × P` physics increments, raw case scale
    pub physics: Tensor,
    /// Final `1 × gru_dim` hidden state
    pub hidden: Tensor,
    pub rates: RateTrace,
}

#[derive(Clone, Debug)]
pub struct Forecaster {
    pub config: ModelConfig,
    pub input_dim: usize,
    pub pred_window: usize,
    encoder: GatEncoder,
    gru: GruCell,
    direct_head: Linear,
    rate_head: Linear,
}

impl Forecaster {
    /// Register all parameters in `store`, drawing initial values from `rng`.
    pub fn new<R: Rng + ?Sized>(
        config: &ModelConfig,
        input_dim: usize,
        pred_window: usize,
        store: &ParamStore,
        rng: &mut R,
    ) -> Result<Self> {
        config.validate()?;
        if input_dim == 0 || pred_window == 0 {
            return Err(Error::InvalidConfig(
                "input_dim and pred_window must be positive".to_string(),
            ));
        }
        let encoder = GatEncoder::two_layer(
            store,
            input_dim,
            config.hidden_dim1,
            config.hidden_dim2,
            config.num_heads,
            config.head_merge,
            config.leaky_relu_slope,
            config.elu_alpha,
            rng,
        )?;
        let gru = GruCell::new(store, "gru", encoder.out_dim(), config.gru_dim, rng)?;
        let head_in = config.gru_dim + 1;
        let device = store.device().clone();
        let direct_head = store.linear(
            "direct_head",
            xavier_uniform(pred_window, head_in, 1.0, rng, &device)?,
        )?;
        let rate_head = store.linear(
            "rate_head",
            xavier_uniform(1, head_in, 1.0, rng, &device)?,
        )?;

        Ok(Self {
            config: config.clone(),
            input_dim,
            pred_window,
            encoder,
            gru,
            direct_head,
            rate_head,
        })
    }

    /// Fresh random hidden state.
    pub fn init_hidden<R: Rng + ?Sized>(&self, rng: &mut R) -> Result<Tensor> {
        self.gru.init_hidden(rng)
    }

    /// Run the rollout's windows in order. `hidden` carries state in from a
    /// previous call; `None` starts from a fresh random state.
    pub fn forward<R: Rng + ?Sized>(
        &self,
        graph: &RegionGraph,
        rollout: &RegionRollout,
        hidden: Option<Tensor>,
        rng: &mut R,
    ) -> Result<ForecastTrace> {
        rollout.check_shape(graph.num_nodes(), self.input_dim, self.pred_window)?;
        let index = EdgeIndex::new(graph, rollout.device())?;

        let mut h = match hidden {
            Some(h) if h.dims() == [1, self.config.gru_dim] => h,
            Some(h) => {
                return Err(Error::ShapeMismatch(format!(
                    "hidden state {:?}, expected (1, {})",
                    h.dims(),
                    self.config.gru_dim
                )))
            }
            None => self.init_hidden(rng)?,
        };

        let steps = rollout.len();
        let mut direct_rows = Vec::with_capacity(steps);
        let mut physics_rows = Vec::with_capacity(steps);
        let mut rates = RateTrace::default();

        for step in 0..steps {
            let embedded = self.encoder.forward(&rollout.histories[step], &index, step)?;

            let pooled = embedded.max_keepdim(0)?;
            check(&pooled, ForecastStage::Pooling, step)?;

            h = self.gru.forward(&pooled, &h)?;
            check(&h, ForecastStage::Recurrent, step)?;

            let anchor = Tensor::new(&[[rollout.anchor_current[step]]], h.device())?;
            let combined = Tensor::cat(&[&h, &anchor], 1)?;

            let direct = self.direct_head.forward(&combined)?;
            check(&direct, ForecastStage::DirectHead, step)?;

            let logit = self.rate_head.forward(&combined)?;
            check(&logit, ForecastStage::RateHead, step)?;
            let alpha = candle_nn::ops::sigmoid(&logit)?;
            rates.raw.push(scalar(&logit)?);
            rates.scaled.push(scalar(&alpha)?);

            let physics = physics::rollout(
                &alpha,
                rollout.population,
                rollout.anchor_last[step],
                self.pred_window,
            )?;
            check(&physics, ForecastStage::PhysicsRollout, step)?;

            direct_rows.push(direct);
            physics_rows.push(physics);
        }

        Ok(ForecastTrace {
            direct: Tensor::cat(&direct_rows, 0)?,
            physics: Tensor::cat(&physics_rows, 0)?,
            hidden: h,
            rates,
        })
    }
}

fn check(t: &Tensor, stage: ForecastStage, step: usize) -> Result<()> {
    if all_finite(t)? {
        Ok(())
    } else {
        Err(Error::NumericInstability {
            stage: stage.to_string(),
            step,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gnn::learner::RegionRollout;
    use candle_core::{DType, Device};
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn small_config() -> ModelConfig {
        ModelConfig {
            hidden_dim1: 4,
            hidden_dim2: 4,
            gru_dim: 6,
            num_heads: 2,
            ..Default::default()
        }
    }

    fn rollout(steps: usize, nodes: usize, input: usize, pred: usize) -> RegionRollout {
        let histories = (0..steps)
            .map(|s| {
                let data: Vec<f32> = (0..nodes * input)
                    .map(|k| ((s + k) as f32 * 0.37).sin())
                    .collect();
                Tensor::from_vec(data, (nodes, input), &Device::Cpu).unwrap()
            })
            .collect();
        RegionRollout {
            region: 0,
            name: "a".to_string(),
            population: 10_000.0,
            histories,
            anchor_current: (0..steps).map(|s| s as f32 * 0.1).collect(),
            anchor_last: (0..steps).map(|s| 100.0 + 10.0 * s as f32).collect(),
            targets: Tensor::zeros((steps, pred), DType::F32, &Device::Cpu).unwrap(),
            mean: 0.0,
            scale: 1.0,
        }
    }

    fn model(store: &ParamStore) -> Forecaster {
        let mut rng = StdRng::seed_from_u64(42);
        Forecaster::new(&small_config(), 5, 3, store, &mut rng).unwrap()
    }

    #[test]
    fn test_output_shapes_and_rates() {
        let store = ParamStore::cpu();
        let f = model(&store);
        let graph = RegionGraph::fully_connected(4).unwrap();
        let r = rollout(7, 4, 5, 3);

        let mut rng = StdRng::seed_from_u64(0);
        let trace = f.forward(&graph, &r, None, &mut rng).unwrap();

        assert_eq!(trace.direct.dims(), &[7, 3]);
        assert_eq!(trace.physics.dims(), &[7, 3]);
        assert_eq!(trace.hidden.dims(), &[1, 6]);
        assert_eq!(trace.rates.raw.len(), 7);
        for (raw, scaled) in trace.rates.raw.iter().zip(&trace.rates.scaled) {
            assert!(*scaled > 0.0 && *scaled < 1.0);
            assert!((1.0 / (1.0 + (-raw).exp()) - scaled).abs() < 1e-6);
        }
    }

    #[test]
    fn test_physics_row_starts_from_last_count() {
        let store = ParamStore::cpu();
        let f = model(&store);
        let graph = RegionGraph::fully_connected(4).unwrap();
        let r = rollout(3, 4, 5, 3);

        let mut rng = StdRng::seed_from_u64(0);
        let trace = f.forward(&graph, &r, None, &mut rng).unwrap();
        let physics = trace.physics.to_vec2::<f32>().unwrap();
        for step in 0..3 {
            let expected = physics::sir_increments(
                trace.rates.scaled[step],
                r.population,
                r.anchor_last[step],
                3,
            );
            for (k, e) in expected.iter().enumerate() {
                assert!((physics[step][k] - e).abs() < 1e-2);
            }
        }
    }

    #[test]
    fn test_explicit_hidden_state_is_deterministic() {
        let store = ParamStore::cpu();
        let f = model(&store);
        let graph = RegionGraph::fully_connected(4).unwrap();
        let r = rollout(4, 4, 5, 3);
        let h0 = Tensor::zeros((1, 6), DType::F32, &Device::Cpu).unwrap();

        let run = |seed: u64| {
            let mut rng = StdRng::seed_from_u64(seed);
            let trace = f.forward(&graph, &r, Some(h0.clone()), &mut rng).unwrap();
            trace.direct.to_vec2::<f32>().unwrap()
        };
        assert_eq!(run(1), run(2));
    }

    #[test]
    fn test_rejects_wrong_hidden_shape() {
        let store = ParamStore::cpu();
        let f = model(&store);
        let graph = RegionGraph::fully_connected(4).unwrap();
        let r = rollout(2, 4, 5, 3);
        let mut rng = StdRng::seed_from_u64(0);
        let h = Tensor::zeros((1, 2), DType::F32, &Device::Cpu).unwrap();
        let result = f.forward(&graph, &r, Some(h), &mut rng);
        assert!(matches!(result, Err(Error::ShapeMismatch(_))));
    }

    #[test]
    fn test_non_finite_anchor_reports_stage() {
        let store = ParamStore::cpu();
        let f = model(&store);
        let graph = RegionGraph::fully_connected(4).unwrap();
        let mut r = rollout(3, 4, 5, 3);
        r.anchor_current[1] = f32::INFINITY;

        let mut rng = StdRng::seed_from_u64(0);
        match f.forward(&graph, &r, None, &mut rng) {
            Err(Error::NumericInstability { stage, step }) => {
                assert_eq!(stage, "direct_head");
                assert_eq!(step, 1);
            }
            other => panic!("expected numeric instability, got {:?}", other.map(|t| t.rates)),
        }
    }

    #[test]
    fn test_loss_gradients_reach_every_component() {
        let store = ParamStore::cpu();
        let f = model(&store);
        let graph = RegionGraph::fully_connected(4).unwrap();
        let r = rollout(3, 4, 5, 3);

        let mut rng = StdRng::seed_from_u64(0);
        let trace = f.forward(&graph, &r, None, &mut rng).unwrap();
        let target = Tensor::ones((3, 3), DType::F32, &Device::Cpu).unwrap();
        let direct_loss = (&trace.direct - &target).unwrap().sqr().unwrap().mean_all().unwrap();
        let scaled = trace.physics.affine(1e-2, 0.0).unwrap();
        let physics_loss = (scaled - &target).unwrap().sqr().unwrap().mean_all().unwrap();
        let loss = (direct_loss + physics_loss.affine(0.1, 0.0).unwrap()).unwrap();
        let grads = loss.backward().unwrap();

        for name in [
            "encoder.layer1.head0.fc.weight",
            "encoder.layer2.head0.attn_fc.weight",
            "gru.weight_hh_l0",
            "direct_head.weight",
            "rate_head.weight",
        ] {
            let w = store.get(name).unwrap().unwrap();
            let g = grads
                .get(&w)
                .unwrap_or_else(|| panic!("no gradient for {name}"))
                .flatten_all()
                .unwrap()
                .to_vec1::<f32>()
                .unwrap();
            assert!(g.iter().any(|&v| v != 0.0), "zero gradient for {name}");
        }
    }
}

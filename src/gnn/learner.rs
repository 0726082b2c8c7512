//! Training driver for the forecaster.
//!
//! A batch is a slice of independent [`RegionRollout`]s. Each rollout gets
//! its own fresh hidden state, its own forward/backward pass and its own
//! optimizer step. A rollout that turns non-finite is skipped and reported;
//! an epoch with any such failure never produces a checkpoint.

use crate::core::{Error, ForecastConfig, Region, Result};
use crate::data::{FeatureChannel, Normalizer, WindowSet};
use crate::data::features::NORMALIZE_EPSILON;
use crate::gnn::checkpoint::Checkpoint;
use crate::gnn::forecaster::{ForecastTrace, Forecaster, RateTrace};
use crate::gnn::optim::{Adam, AdamParams};
use crate::graph::RegionGraph;
use crate::tensor::{scalar, ParamStore};
use candle_core::{Device, Tensor};
use candle_nn::Optimizer;
use rand::rngs::StdRng;
use rand::SeedableRng;
use serde::{Deserialize, Serialize};
use std::path::Path;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Optimization settings.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TrainConfig {
    pub learning_rate: f32,
    pub epochs: usize,
    /// Weight of the physics term in the training loss
    pub physics_weight: f32,
    /// Seed for parameter and hidden-state initialization
    pub seed: u64,
    /// Node features; the first must be `Infected`
    pub feature_channels: Vec<FeatureChannel>,
}

impl Default for TrainConfig {
    fn default() -> Self {
        Self {
            learning_rate: 1e-3,
            epochs: 50,
            physics_weight: 0.1,
            seed: 42,
            feature_channels: vec![FeatureChannel::Infected],
        }
    }
}

impl TrainConfig {
    pub fn validate(&self) -> Result<()> {
        if !(self.learning_rate.is_finite() && self.learning_rate > 0.0) {
            return Err(Error::InvalidConfig(
                "learning_rate must be positive".to_string(),
            ));
        }
        if self.epochs == 0 {
            return Err(Error::InvalidConfig("epochs must be positive".to_string()));
        }
        if !(self.physics_weight.is_finite() && self.physics_weight >= 0.0) {
            return Err(Error::InvalidConfig(
                "physics_weight must be non-negative".to_string(),
            ));
        }
        if self.feature_channels.first() != Some(&FeatureChannel::Infected) {
            return Err(Error::InvalidConfig(
                "feature_channels must start with Infected".to_string(),
            ));
        }
        for (i, c) in self.feature_channels.iter().enumerate() {
            if self.feature_channels[..i].contains(c) {
                return Err(Error::InvalidConfig(format!("duplicate feature channel {c:?}")));
            }
        }
        Ok(())
    }
}

/// One region's window sequence, ready for the forecaster.
#[derive(Clone, Debug)]
pub struct RegionRollout {
    /// Node index of the region
    pub region: usize,
    /// Region name, used in reports and failure records
    pub name: String,
    pub population: f32,
    /// Per window, all regions' flattened history (`N × input_dim`)
    pub histories: Vec<Tensor>,
    /// Per window, this region's normalized current infected delta
    pub anchor_current: Vec<f32>,
    /// Per window, this region's raw active count at the last history day
    pub anchor_last: Vec<f32>,
    /// `windows × P` normalized targets
    pub targets: Tensor,
    /// Infected-delta mean of this region
    pub mean: f32,
    /// Infected-delta standard deviation plus epsilon
    pub scale: f32,
}

impl RegionRollout {
    /// Slice one region out of a split's windows, on the CPU.
    pub fn from_windows(
        split: &str,
        windows: &WindowSet,
        regions: &[Region],
        region: usize,
        normalizer: &Normalizer,
    ) -> Result<Self> {
        windows.ensure_nonempty(split)?;
        let meta = regions
            .get(region)
            .ok_or_else(|| Error::UnknownRegion(format!("node index {region}")))?;
        if region >= normalizer.num_regions() {
            return Err(Error::ShapeMismatch(format!(
                "normalizer covers {} regions, asked for {}",
                normalizer.num_regions(),
                region
            )));
        }
        if meta.population == 0 {
            return Err(Error::InvalidConfig(format!(
                "region {} has zero population",
                meta.name
            )));
        }

        let device = Device::Cpu;
        let p = windows.pred_window;
        let mut targets = Vec::with_capacity(windows.len() * p);
        for window in &windows.windows {
            targets.extend_from_slice(&window.target[region]);
        }
        let targets = Tensor::from_vec(targets, (windows.len(), p), &device)?;
        let histories = windows
            .windows
            .iter()
            .map(|w| rows_to_tensor(&w.history, &device))
            .collect::<Result<Vec<_>>>()?;

        Ok(Self {
            region,
            name: meta.name.clone(),
            population: meta.population as f32,
            histories,
            anchor_current: windows.windows.iter().map(|w| w.anchor_current[region]).collect(),
            anchor_last: windows.windows.iter().map(|w| w.anchor_last[region]).collect(),
            targets,
            mean: normalizer.mean[region] as f32,
            scale: (normalizer.std[region] + NORMALIZE_EPSILON) as f32,
        })
    }

    /// Number of windows.
    pub fn len(&self) -> usize {
        self.histories.len()
    }

    pub fn is_empty(&self) -> bool {
        self.histories.is_empty()
    }

    pub fn device(&self) -> &Device {
        self.targets.device()
    }

    pub fn normalize(&self, x: f32) -> f32 {
        (x - self.mean) / self.scale
    }

    pub fn denormalize(&self, z: f32) -> f32 {
        z * self.scale + self.mean
    }

    pub(crate) fn check_shape(&self, nodes: usize, input_dim: usize, pred_window: usize) -> Result<()> {
        let n = self.len();
        if n == 0 {
            return Err(Error::InsufficientHistory {
                split: self.name.clone(),
                timesteps: 0,
                required: 1,
            });
        }
        if self.anchor_current.len() != n
            || self.anchor_last.len() != n
            || self.targets.dims() != [n, pred_window]
        {
            return Err(Error::ShapeMismatch(format!(
                "rollout {} has inconsistent window counts",
                self.name
            )));
        }
        if let Some(h) = self.histories.iter().find(|h| h.dims() != [nodes, input_dim]) {
            return Err(Error::ShapeMismatch(format!(
                "history {:?}, expected ({nodes}, {input_dim})",
                h.dims()
            )));
        }
        Ok(())
    }
}

fn rows_to_tensor(rows: &[Vec<f32>], device: &Device) -> Result<Tensor> {
    let width = rows.first().map_or(0, Vec::len);
    if rows.iter().any(|r| r.len() != width) {
        return Err(Error::ShapeMismatch("ragged history rows".to_string()));
    }
    let flat: Vec<f32> = rows.iter().flatten().copied().collect();
    Ok(Tensor::from_vec(flat, (rows.len(), width), device)?)
}

/// A rollout skipped because of non-finite values.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RolloutFailure {
    pub region: String,
    pub reason: String,
}

/// Errors aggregated over one pass of a batch.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct BatchMetrics {
    /// Mean objective over completed rollouts
    pub loss: f32,
    /// `sqrt(loss)`
    pub rmse: f32,
    /// Mean absolute error of the direct head (normalized scale)
    pub direct_mae: f32,
    /// Mean absolute error of the normalized physics rollout
    pub physics_mae: f32,
    /// Completed rollouts
    pub rollouts: usize,
    pub failures: Vec<RolloutFailure>,
}

impl BatchMetrics {
    pub fn is_clean(&self) -> bool {
        self.failures.is_empty() && self.rollouts > 0
    }
}

#[derive(Default)]
struct Accumulator {
    loss: f64,
    direct_mae: f64,
    physics_mae: f64,
    rollouts: usize,
    failures: Vec<RolloutFailure>,
}

impl Accumulator {
    fn finish(self) -> BatchMetrics {
        let n = self.rollouts.max(1) as f64;
        let loss = if self.rollouts == 0 { f64::NAN } else { self.loss / n };
        BatchMetrics {
            loss: loss as f32,
            rmse: loss.sqrt() as f32,
            direct_mae: (self.direct_mae / n) as f32,
            physics_mae: (self.physics_mae / n) as f32,
            rollouts: self.rollouts,
            failures: self.failures,
        }
    }

    fn fail(&mut self, rollout: &RegionRollout, err: Error) -> Result<()> {
        if !err.is_step_local() {
            return Err(err);
        }
        warn!(region = %rollout.name, error = %err, "Rollout aborted");
        self.failures.push(RolloutFailure {
            region: rollout.name.clone(),
            reason: err.to_string(),
        });
        Ok(())
    }
}

/// Per-epoch record kept by [`Trainer::fit`].
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct EpochMetrics {
    pub epoch: usize,
    pub train: BatchMetrics,
    pub validation: Option<BatchMetrics>,
    /// Whether this epoch wrote a new best checkpoint
    pub checkpointed: bool,
}

/// De-normalized forecast for one region.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RegionForecast {
    pub region: String,
    /// Per window, direct forecast of daily active-case change
    pub direct: Vec<Vec<f32>>,
    /// Per window, physics-rollout daily increments
    pub physics: Vec<Vec<f32>>,
    /// Per window, observed daily change
    pub observed: Vec<Vec<f32>>,
    pub rates: RateTrace,
    pub metrics: BatchMetrics,
}

struct Evaluated {
    loss: Tensor,
    value: f32,
    direct: Tensor,
    physics_normalized: Tensor,
    trace: ForecastTrace,
}

/// Owns the model, its parameters and the optimizer state.
pub struct Trainer {
    config: ForecastConfig,
    graph: RegionGraph,
    model: Forecaster,
    params: ParamStore,
    optimizer: Adam,
    rng: StdRng,
    run_id: Uuid,
}

impl Trainer {
    pub fn new(config: ForecastConfig, graph: RegionGraph) -> Result<Self> {
        config.validate()?;
        let mut rng = StdRng::seed_from_u64(config.train.seed);
        let params = ParamStore::cpu();
        let model = Forecaster::new(
            &config.model,
            config.input_dim(),
            config.window.pred_window,
            &params,
            &mut rng,
        )?;
        let optimizer = Adam::new(
            params.vars()?,
            AdamParams {
                learning_rate: config.train.learning_rate as f64,
                ..Default::default()
            },
        )?;
        info!(
            parameters = params.num_scalars(),
            nodes = graph.num_nodes(),
            edges = graph.num_edges(),
            "Initialized forecaster"
        );
        Ok(Self {
            config,
            graph,
            model,
            params,
            optimizer,
            rng,
            run_id: Uuid::new_v4(),
        })
    }

    /// Rebuild a trainer with the parameters and optimizer state of a checkpoint.
    pub fn from_checkpoint(checkpoint: Checkpoint, graph: RegionGraph) -> Result<Self> {
        let mut trainer = Self::new(checkpoint.config, graph)?;
        trainer.params.restore(&checkpoint.params)?;
        let device = trainer.params.device().clone();
        trainer.optimizer.restore(&checkpoint.optimizer, &device)?;
        trainer.run_id = checkpoint.run_id;
        Ok(trainer)
    }

    pub fn config(&self) -> &ForecastConfig {
        &self.config
    }

    pub fn graph(&self) -> &RegionGraph {
        &self.graph
    }

    pub fn model(&self) -> &Forecaster {
        &self.model
    }

    pub fn params(&self) -> &ParamStore {
        &self.params
    }

    pub fn run_id(&self) -> Uuid {
        self.run_id
    }

    /// Snapshot of the current state.
    pub fn checkpoint(&self, epoch: usize, val_loss: f32, regions: Vec<String>) -> Result<Checkpoint> {
        Ok(Checkpoint::new(
            self.run_id,
            epoch,
            val_loss,
            regions,
            self.params.snapshot()?,
            self.optimizer.state()?,
            self.config.clone(),
        ))
    }

    /// `MSE(direct, y) + w · MSE(normalize(physics), y)`.
    fn run(&mut self, rollout: &RegionRollout) -> Result<Evaluated> {
        let trace = self
            .model
            .forward(&self.graph, rollout, None, &mut self.rng)?;

        let scale = rollout.scale as f64;
        let direct_mse = mean_squared_error(&trace.direct, &rollout.targets)?;
        let physics_normalized = trace
            .physics
            .affine(1.0 / scale, -(rollout.mean as f64) / scale)?;
        let physics_mse = mean_squared_error(&physics_normalized, &rollout.targets)?;
        let weight = self.config.train.physics_weight as f64;
        let loss = (direct_mse + physics_mse.affine(weight, 0.0)?)?;
        let value = scalar(&loss)?;
        if !value.is_finite() {
            return Err(Error::NumericInstability {
                stage: "loss".to_string(),
                step: rollout.len() - 1,
            });
        }
        Ok(Evaluated {
            loss,
            value,
            direct: trace.direct.detach(),
            physics_normalized: physics_normalized.detach(),
            trace,
        })
    }

    /// One forward/backward/update per rollout.
    pub fn train_epoch(&mut self, batch: &[RegionRollout]) -> Result<BatchMetrics> {
        let mut acc = Accumulator::default();
        for rollout in batch {
            let outcome = self.run(rollout).and_then(|e| {
                let grads = e.loss.backward()?;
                self.optimizer.apply(&grads)?;
                Ok(e)
            });
            match outcome {
                Ok(e) => {
                    acc.loss += e.value as f64;
                    acc.direct_mae += mean_abs_error(&e.direct, &rollout.targets)? as f64;
                    acc.physics_mae +=
                        mean_abs_error(&e.physics_normalized, &rollout.targets)? as f64;
                    acc.rollouts += 1;
                }
                Err(err) => acc.fail(rollout, err)?,
            }
        }
        Ok(acc.finish())
    }

    /// Validation metric: MSE of the normalized physics rollout against
    /// the targets. No parameters change.
    pub fn evaluate(&mut self, batch: &[RegionRollout]) -> Result<BatchMetrics> {
        let mut acc = Accumulator::default();
        for rollout in batch {
            match self.run(rollout) {
                Ok(e) => {
                    let mse = mean_squared_error(&e.physics_normalized, &rollout.targets)?;
                    acc.loss += scalar(&mse)? as f64;
                    acc.direct_mae += mean_abs_error(&e.direct, &rollout.targets)? as f64;
                    acc.physics_mae +=
                        mean_abs_error(&e.physics_normalized, &rollout.targets)? as f64;
                    acc.rollouts += 1;
                }
                Err(err) => acc.fail(rollout, err)?,
            }
        }
        Ok(acc.finish())
    }

    /// Train for the configured number of epochs. When `checkpoint_path` is
    /// set, a checkpoint is written each time the validation loss (training
    /// loss if `valid` is empty) reaches a new best on a clean epoch.
    pub fn fit(
        &mut self,
        train: &[RegionRollout],
        valid: &[RegionRollout],
        checkpoint_path: Option<&Path>,
    ) -> Result<Vec<EpochMetrics>> {
        if train.is_empty() {
            return Err(Error::InvalidConfig("training batch is empty".to_string()));
        }
        let regions: Vec<String> = train.iter().map(|r| r.name.clone()).collect();
        let mut best = f32::INFINITY;
        let mut history = Vec::with_capacity(self.config.train.epochs);

        for epoch in 0..self.config.train.epochs {
            let train_metrics = self.train_epoch(train)?;
            let validation = if valid.is_empty() {
                None
            } else {
                Some(self.evaluate(valid)?)
            };

            let clean = train_metrics.is_clean() && validation.as_ref().map_or(true, |v| v.is_clean());
            let score = validation.as_ref().map_or(train_metrics.loss, |v| v.loss);
            let mut checkpointed = false;
            if clean && score < best {
                best = score;
                if let Some(path) = checkpoint_path {
                    let digest = self.checkpoint(epoch, score, regions.clone())?.save(path)?;
                    debug!(%digest, path = %path.display(), "Checkpoint written");
                    checkpointed = true;
                }
            } else if !clean {
                warn!(epoch, "Epoch had aborted rollouts; not checkpointing");
            }

            info!(
                epoch,
                loss = train_metrics.loss,
                rmse = train_metrics.rmse,
                mae = train_metrics.direct_mae,
                val_loss = validation.as_ref().map(|v| v.loss),
                val_rmse = validation.as_ref().map(|v| v.rmse),
                val_mae = validation.as_ref().map(|v| v.physics_mae),
                checkpointed,
                "Epoch complete"
            );
            history.push(EpochMetrics {
                epoch,
                train: train_metrics,
                validation,
                checkpointed,
            });
        }
        Ok(history)
    }

    /// Reload the best checkpoint written by a [`Trainer::fit`] run that
    /// produced `history`. A file at `path` left over from an earlier run is
    /// ignored when no epoch of this run checkpointed. Returns whether the
    /// state was replaced.
    pub fn restore_best(&mut self, history: &[EpochMetrics], path: &Path) -> Result<bool> {
        if !history.iter().any(|e| e.checkpointed) {
            return Ok(false);
        }
        let best = Checkpoint::load(path)?;
        info!(epoch = best.epoch, val_loss = best.val_loss, "Restoring best checkpoint");
        *self = Self::from_checkpoint(best, self.graph.clone())?;
        Ok(true)
    }

    /// Forecast every window of a rollout, mapped back to case counts.
    pub fn forecast(&mut self, rollout: &RegionRollout) -> Result<RegionForecast> {
        let e = self.run(rollout)?;
        let rows = |t: &Tensor, f: &dyn Fn(f32) -> f32| -> Result<Vec<Vec<f32>>> {
            Ok(t.to_vec2::<f32>()?
                .into_iter()
                .map(|row| row.into_iter().map(f).collect())
                .collect())
        };

        let mse = scalar(&mean_squared_error(&e.physics_normalized, &rollout.targets)?)?;
        let metrics = BatchMetrics {
            loss: mse,
            rmse: mse.sqrt(),
            direct_mae: mean_abs_error(&e.direct, &rollout.targets)?,
            physics_mae: mean_abs_error(&e.physics_normalized, &rollout.targets)?,
            rollouts: 1,
            failures: Vec::new(),
        };
        Ok(RegionForecast {
            region: rollout.name.clone(),
            direct: rows(&e.direct, &|z| rollout.denormalize(z))?,
            physics: rows(&e.trace.physics, &|v| v)?,
            observed: rows(&rollout.targets, &|z| rollout.denormalize(z))?,
            rates: e.trace.rates,
            metrics,
        })
    }
}

fn mean_abs_error(a: &Tensor, b: &Tensor) -> Result<f32> {
    scalar(&(a - b)?.abs()?.mean_all()?)
}

/// Differentiable `mean((a − b)²)` as a scalar tensor.
fn mean_squared_error(a: &Tensor, b: &Tensor) -> Result<Tensor> {
    Ok((a - b)?.sqr()?.mean_all()?)
}

//! Graph attention layers over the static region graph.
//!
//! Each head projects node features, scores every edge from the
//! concatenated source/destination projections, normalizes the scores over
//! each destination's incoming edges and sums the weighted source rows.
//! Message passing is `index_select` on the edge endpoints followed by
//! `index_add` into the destination rows.

use crate::core::{Error, Result};
use crate::graph::RegionGraph;
use crate::tensor::{all_finite, calculate_gain, xavier_normal, Nonlinearity, ParamStore};
use candle_core::{DType, Device, Tensor};
use candle_nn::{Linear, Module};
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Edge endpoints of a [`RegionGraph`] as `u32` index tensors.
#[derive(Clone, Debug)]
pub struct EdgeIndex {
    src: Tensor,
    dst: Tensor,
    dst_nodes: Arc<[usize]>,
    num_nodes: usize,
}

impl EdgeIndex {
    pub fn new(graph: &RegionGraph, device: &Device) -> Result<Self> {
        let to_tensor = |nodes: &[usize]| -> Result<Tensor> {
            let ids: Vec<u32> = nodes.iter().map(|&n| n as u32).collect();
            let len = ids.len();
            Ok(Tensor::from_vec(ids, len, device)?)
        };
        Ok(Self {
            src: to_tensor(graph.sources())?,
            dst: to_tensor(graph.destinations())?,
            dst_nodes: Arc::clone(graph.destinations()),
            num_nodes: graph.num_nodes(),
        })
    }

    fn num_edges(&self) -> usize {
        self.dst_nodes.len()
    }
}

/// Softmax of an `E × 1` logit column, normalized separately over the
/// incoming edges of each destination node.
///
/// The per-destination maximum is subtracted for stability. It is read
/// back as a constant, which leaves the gradient unchanged since the
/// softmax is invariant to a per-group shift.
pub fn edge_softmax(logits: &Tensor, index: &EdgeIndex) -> Result<Tensor> {
    let (rows, cols) = logits.dims2()?;
    if cols != 1 || rows != index.num_edges() {
        return Err(Error::ShapeMismatch(format!(
            "edge_softmax: logits {:?} for {} edges",
            logits.dims(),
            index.num_edges()
        )));
    }
    let host = logits.flatten_all()?.to_vec1::<f32>()?;
    let mut max = vec![f32::NEG_INFINITY; index.num_nodes];
    for (e, &d) in index.dst_nodes.iter().enumerate() {
        max[d] = max[d].max(host[e]);
    }
    let shift: Vec<f32> = index.dst_nodes.iter().map(|&d| max[d]).collect();
    let shift = Tensor::from_vec(shift, (rows, 1), logits.device())?;

    let exp = (logits - shift)?.exp()?;
    let sums = Tensor::zeros((index.num_nodes, 1), DType::F32, logits.device())?
        .index_add(&index.dst, &exp, 0)?;
    let denom = sums.index_select(&index.dst, 0)?;
    Ok((exp / denom)?)
}

/// `max(x, 0) + slope · min(x, 0)`
fn leaky_relu(x: &Tensor, slope: f64) -> Result<Tensor> {
    let zeros = x.zeros_like()?;
    let positive = x.maximum(&zeros)?;
    let negative = x.minimum(&zeros)?.affine(slope, 0.0)?;
    Ok((positive + negative)?)
}

/// How the outputs of parallel heads are combined.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HeadMerge {
    /// Concatenate along the feature axis
    #[default]
    Concat,
    /// Elementwise average of the head outputs
    Mean,
}

/// A single attention head.
#[derive(Clone, Debug)]
pub struct GatHead {
    fc: Linear,
    attn_fc: Linear,
    negative_slope: f64,
    out_dim: usize,
}

impl GatHead {
    pub fn new<R: Rng + ?Sized>(
        store: &ParamStore,
        name: &str,
        in_dim: usize,
        out_dim: usize,
        negative_slope: f32,
        rng: &mut R,
    ) -> Result<Self> {
        let gain = calculate_gain(Nonlinearity::Relu);
        let device = store.device().clone();
        let fc = store.linear(
            &format!("{name}.fc"),
            xavier_normal(out_dim, in_dim, gain, rng, &device)?,
        )?;
        let attn_fc = store.linear(
            &format!("{name}.attn_fc"),
            xavier_normal(1, 2 * out_dim, gain, rng, &device)?,
        )?;
        Ok(Self {
            fc,
            attn_fc,
            negative_slope: negative_slope as f64,
            out_dim,
        })
    }

    /// Node projection `h · Wᵀ + b`, before any message passing.
    pub fn project(&self, h: &Tensor) -> Result<Tensor> {
        Ok(self.fc.forward(h)?)
    }

    /// Returns the `N × out` node outputs and the `E × 1` edge weights.
    pub fn forward(&self, h: &Tensor, index: &EdgeIndex) -> Result<(Tensor, Tensor)> {
        let (rows, _) = h.dims2()?;
        if rows != index.num_nodes {
            return Err(Error::ShapeMismatch(format!(
                "attention input has {} rows for {} nodes",
                rows, index.num_nodes
            )));
        }
        let z = self.project(h)?;
        let out = Tensor::zeros((index.num_nodes, self.out_dim), DType::F32, h.device())?;
        // Nodes without incoming edges receive a zero row.
        if index.num_edges() == 0 {
            let alpha = Tensor::zeros((0, 1), DType::F32, h.device())?;
            return Ok((out, alpha));
        }

        let z_src = z.index_select(&index.src, 0)?;
        let z_dst = z.index_select(&index.dst, 0)?;
        let pair = Tensor::cat(&[&z_src, &z_dst], 1)?;
        let logits = leaky_relu(&self.attn_fc.forward(&pair)?, self.negative_slope)?;
        let alpha = edge_softmax(&logits, index)?;
        let messages = z_src.broadcast_mul(&alpha)?;
        Ok((out.index_add(&index.dst, &messages, 0)?, alpha))
    }
}

/// Independent heads run in parallel and merged.
#[derive(Clone, Debug)]
pub struct MultiHeadGat {
    heads: Vec<GatHead>,
    merge: HeadMerge,
    in_dim: usize,
    head_dim: usize,
}

impl MultiHeadGat {
    #[allow(clippy::too_many_arguments)]
    pub fn new<R: Rng + ?Sized>(
        store: &ParamStore,
        name: &str,
        in_dim: usize,
        head_dim: usize,
        num_heads: usize,
        merge: HeadMerge,
        negative_slope: f32,
        rng: &mut R,
    ) -> Result<Self> {
        if num_heads == 0 || in_dim == 0 || head_dim == 0 {
            return Err(Error::InvalidConfig(format!(
                "{name}: heads and dimensions must be positive"
            )));
        }
        let heads = (0..num_heads)
            .map(|i| {
                GatHead::new(
                    store,
                    &format!("{name}.head{i}"),
                    in_dim,
                    head_dim,
                    negative_slope,
                    rng,
                )
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(Self {
            heads,
            merge,
            in_dim,
            head_dim,
        })
    }

    pub fn out_dim(&self) -> usize {
        match self.merge {
            HeadMerge::Concat => self.head_dim * self.heads.len(),
            HeadMerge::Mean => self.head_dim,
        }
    }

    pub fn forward(&self, h: &Tensor, index: &EdgeIndex) -> Result<Tensor> {
        let outs = self
            .heads
            .iter()
            .map(|head| Ok(head.forward(h, index)?.0))
            .collect::<Result<Vec<_>>>()?;
        match self.merge {
            HeadMerge::Concat => Ok(Tensor::cat(&outs, 1)?),
            HeadMerge::Mean => Ok(Tensor::stack(&outs, 0)?.mean(0)?),
        }
    }
}

/// One step of the encoder pipeline.
#[derive(Clone, Debug)]
pub enum EncoderStage {
    Attention(MultiHeadGat),
    Elu { alpha: f64 },
}

impl EncoderStage {
    pub fn label(&self) -> &'static str {
        match self {
            EncoderStage::Attention(_) => "attention",
            EncoderStage::Elu { .. } => "elu",
        }
    }
}

/// Ordered attention/activation stages with checked feature widths.
#[derive(Clone, Debug)]
pub struct GatEncoder {
    stages: Vec<EncoderStage>,
    out_dim: usize,
}

impl GatEncoder {
    /// Validate that consecutive attention stages agree on widths.
    pub fn from_stages(in_dim: usize, stages: Vec<EncoderStage>) -> Result<Self> {
        let mut width = in_dim;
        for (i, stage) in stages.iter().enumerate() {
            if let EncoderStage::Attention(layer) = stage {
                if layer.in_dim != width {
                    return Err(Error::InvalidConfig(format!(
                        "encoder stage {i} expects width {}, got {width}",
                        layer.in_dim
                    )));
                }
                width = layer.out_dim();
            }
        }
        Ok(Self {
            stages,
            out_dim: width,
        })
    }

    /// Two stacked attention layers, each followed by ELU. The second
    /// layer is single-headed.
    #[allow(clippy::too_many_arguments)]
    pub fn two_layer<R: Rng + ?Sized>(
        store: &ParamStore,
        in_dim: usize,
        hidden_dim1: usize,
        hidden_dim2: usize,
        num_heads: usize,
        merge: HeadMerge,
        negative_slope: f32,
        elu_alpha: f32,
        rng: &mut R,
    ) -> Result<Self> {
        let layer1 = MultiHeadGat::new(
            store,
            "encoder.layer1",
            in_dim,
            hidden_dim1,
            num_heads,
            merge,
            negative_slope,
            rng,
        )?;
        let layer2 = MultiHeadGat::new(
            store,
            "encoder.layer2",
            layer1.out_dim(),
            hidden_dim2,
            1,
            HeadMerge::Concat,
            negative_slope,
            rng,
        )?;
        let alpha = elu_alpha as f64;
        Self::from_stages(
            in_dim,
            vec![
                EncoderStage::Attention(layer1),
                EncoderStage::Elu { alpha },
                EncoderStage::Attention(layer2),
                EncoderStage::Elu { alpha },
            ],
        )
    }

    pub fn out_dim(&self) -> usize {
        self.out_dim
    }

    /// Run every stage, failing on the first non-finite output.
    pub fn forward(&self, h: &Tensor, index: &EdgeIndex, step: usize) -> Result<Tensor> {
        let mut x = h.clone();
        for (i, stage) in self.stages.iter().enumerate() {
            x = match stage {
                EncoderStage::Attention(layer) => layer.forward(&x, index)?,
                EncoderStage::Elu { alpha } => x.elu(*alpha)?,
            };
            if !all_finite(&x)? {
                return Err(Error::NumericInstability {
                    stage: format!("encoder.{i}.{}", stage.label()),
                    step,
                });
            }
        }
        Ok(x)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::Edge;
    use candle_core::Var;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn chain_graph() -> RegionGraph {
        // 0 -> 1, 2 -> 1, 1 -> 2; node 0 has no incoming edges.
        RegionGraph::new(
            3,
            vec![
                Edge { src: 0, dst: 1, affinity: 1.0 },
                Edge { src: 2, dst: 1, affinity: 1.0 },
                Edge { src: 1, dst: 2, affinity: 1.0 },
            ],
        )
        .unwrap()
    }

    fn features() -> Tensor {
        Tensor::new(
            &[
                [0.1f32, -0.2, 0.3, 0.5],
                [1.0, 0.0, -1.0, 0.2],
                [-0.4, 0.6, 0.1, -0.3],
            ],
            &Device::Cpu,
        )
        .unwrap()
    }

    fn from_rows(rows: Vec<Vec<f32>>) -> Tensor {
        let (r, c) = (rows.len(), rows[0].len());
        let flat: Vec<f32> = rows.into_iter().flatten().collect();
        Tensor::from_vec(flat, (r, c), &Device::Cpu).unwrap()
    }

    fn index(graph: &RegionGraph) -> EdgeIndex {
        EdgeIndex::new(graph, &Device::Cpu).unwrap()
    }

    #[test]
    fn test_edge_softmax_is_per_destination() {
        let graph = chain_graph();
        let logits = Tensor::new(&[[2.0f32], [0.0], [5.0]], &Device::Cpu).unwrap();
        let alpha = edge_softmax(&logits, &index(&graph))
            .unwrap()
            .flatten_all()
            .unwrap()
            .to_vec1::<f32>()
            .unwrap();
        let e2 = 2.0f32.exp();
        assert!((alpha[0] - e2 / (e2 + 1.0)).abs() < 1e-6);
        assert!((alpha[1] - 1.0 / (e2 + 1.0)).abs() < 1e-6);
        // Sole incoming edge of node 2.
        assert!((alpha[2] - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_head_aggregates_only_incoming_sources() {
        let mut rng = StdRng::seed_from_u64(7);
        let store = ParamStore::cpu();
        let head = GatHead::new(&store, "h", 4, 3, 0.01, &mut rng).unwrap();
        let graph = chain_graph();

        let x = features();
        let (out, alpha) = head.forward(&x, &index(&graph)).unwrap();
        let z = head.project(&x).unwrap().to_vec2::<f32>().unwrap();
        let out = out.to_vec2::<f32>().unwrap();
        let alpha = alpha.flatten_all().unwrap().to_vec1::<f32>().unwrap();

        assert_eq!(out.len(), 3);
        assert!(out[0].iter().all(|&v| v == 0.0));
        // Node 2 has a single incoming edge from node 1.
        assert!((alpha[2] - 1.0).abs() < 1e-6);
        for c in 0..3 {
            assert!((out[2][c] - z[1][c]).abs() < 1e-5);
        }
        // Node 1 mixes sources 0 and 2.
        assert!((alpha[0] + alpha[1] - 1.0).abs() < 1e-5);
        for c in 0..3 {
            let expected = alpha[0] * z[0][c] + alpha[1] * z[2][c];
            assert!((out[1][c] - expected).abs() < 1e-5);
        }
    }

    #[test]
    fn test_message_passing_gradient_matches_finite_differences() {
        let mut rng = StdRng::seed_from_u64(13);
        let store = ParamStore::cpu();
        let head = GatHead::new(&store, "h", 4, 2, 0.2, &mut rng).unwrap();
        let graph = chain_graph();
        let idx = index(&graph);
        let weights = Tensor::new(&[[0.3f32, -1.1], [0.7, 0.4], [-0.5, 0.9]], &Device::Cpu).unwrap();

        let loss_at = |x: &Tensor| -> Tensor {
            let (out, _) = head.forward(x, &idx).unwrap();
            (out * &weights).unwrap().sum_all().unwrap()
        };

        let x = Var::from_tensor(&features()).unwrap();
        let grads = loss_at(x.as_tensor()).backward().unwrap();
        let analytic = grads.get(x.as_tensor()).unwrap().to_vec2::<f32>().unwrap();

        let base = features().to_vec2::<f32>().unwrap();
        let eps = 1e-3f32;
        for r in 0..3 {
            for c in 0..4 {
                let shifted = |delta: f32| {
                    let mut rows = base.clone();
                    rows[r][c] += delta;
                    loss_at(&from_rows(rows)).to_scalar::<f32>().unwrap()
                };
                let numeric = (shifted(eps) - shifted(-eps)) / (2.0 * eps);
                let g = analytic[r][c];
                assert!(
                    (numeric - g).abs() < 5e-3 + 1e-2 * g.abs(),
                    "d/dx[{r}][{c}]: numeric {numeric}, analytic {g}"
                );
            }
        }
    }

    #[test]
    fn test_multi_head_merge_widths() {
        let mut rng = StdRng::seed_from_u64(1);
        let store = ParamStore::cpu();
        let cat =
            MultiHeadGat::new(&store, "c", 4, 5, 3, HeadMerge::Concat, 0.01, &mut rng).unwrap();
        let mean =
            MultiHeadGat::new(&store, "m", 4, 5, 3, HeadMerge::Mean, 0.01, &mut rng).unwrap();
        assert_eq!(cat.out_dim(), 15);
        assert_eq!(mean.out_dim(), 5);

        let graph = RegionGraph::fully_connected(3).unwrap();
        let idx = index(&graph);
        assert_eq!(cat.forward(&features(), &idx).unwrap().dims(), &[3, 15]);
        assert_eq!(mean.forward(&features(), &idx).unwrap().dims(), &[3, 5]);
    }

    #[test]
    fn test_attention_weights_sum_per_destination() {
        let mut rng = StdRng::seed_from_u64(3);
        let store = ParamStore::cpu();
        let layer =
            MultiHeadGat::new(&store, "l", 4, 2, 2, HeadMerge::Concat, 0.01, &mut rng).unwrap();
        let graph = RegionGraph::fully_connected(3).unwrap();
        let idx = index(&graph);
        for head in &layer.heads {
            let (_, alpha) = head.forward(&features(), &idx).unwrap();
            let alpha = alpha.flatten_all().unwrap().to_vec1::<f32>().unwrap();
            for dst in 0..3 {
                let total: f32 = graph
                    .edges()
                    .iter()
                    .zip(&alpha)
                    .filter(|(e, _)| e.dst == dst)
                    .map(|(_, w)| w)
                    .sum();
                assert!((total - 1.0).abs() < 1e-5);
            }
        }
    }

    #[test]
    fn test_graph_without_edges_outputs_zeros() {
        let mut rng = StdRng::seed_from_u64(4);
        let store = ParamStore::cpu();
        let head = GatHead::new(&store, "h", 4, 2, 0.01, &mut rng).unwrap();
        let graph = RegionGraph::new(1, Vec::new()).unwrap();
        let x = Tensor::new(&[[1.0f32, 2.0, 3.0, 4.0]], &Device::Cpu).unwrap();
        let (out, _) = head.forward(&x, &index(&graph)).unwrap();
        assert_eq!(out.to_vec2::<f32>().unwrap(), vec![vec![0.0, 0.0]]);
    }

    #[test]
    fn test_encoder_rejects_mismatched_stages() {
        let mut rng = StdRng::seed_from_u64(5);
        let store = ParamStore::cpu();
        let a = MultiHeadGat::new(&store, "a", 4, 6, 2, HeadMerge::Concat, 0.01, &mut rng).unwrap();
        let b = MultiHeadGat::new(&store, "b", 6, 3, 1, HeadMerge::Concat, 0.01, &mut rng).unwrap();
        let result = GatEncoder::from_stages(
            4,
            vec![EncoderStage::Attention(a), EncoderStage::Attention(b)],
        );
        assert!(matches!(result, Err(Error::InvalidConfig(_))));
    }

    #[test]
    fn test_two_layer_encoder_forward() {
        let mut rng = StdRng::seed_from_u64(11);
        let store = ParamStore::cpu();
        let encoder =
            GatEncoder::two_layer(&store, 4, 6, 5, 2, HeadMerge::Concat, 0.01, 1.0, &mut rng)
                .unwrap();
        assert_eq!(encoder.stages.len(), 4);
        assert_eq!(encoder.out_dim(), 5);

        let graph = RegionGraph::fully_connected(3).unwrap();
        let y = encoder.forward(&features(), &index(&graph), 0).unwrap();
        assert_eq!(y.dims(), &[3, 5]);
        // ELU output is bounded below by -alpha.
        let values = y.flatten_all().unwrap().to_vec1::<f32>().unwrap();
        assert!(values.iter().all(|&v| v >= -1.0));
    }

    #[test]
    fn test_encoder_reports_non_finite_stage() {
        let mut rng = StdRng::seed_from_u64(2);
        let store = ParamStore::cpu();
        let encoder =
            GatEncoder::two_layer(&store, 4, 3, 3, 1, HeadMerge::Concat, 0.01, 1.0, &mut rng)
                .unwrap();
        let graph = RegionGraph::fully_connected(3).unwrap();
        let mut rows = features().to_vec2::<f32>().unwrap();
        rows[0][0] = f32::NAN;
        let bad = from_rows(rows);
        match encoder.forward(&bad, &index(&graph), 4) {
            Err(Error::NumericInstability { stage, step }) => {
                assert_eq!(stage, "encoder.0.attention");
                assert_eq!(step, 4);
            }
            other => panic!("expected numeric instability, got {:?}", other.map(|t| t.dims().to_vec())),
        }
    }

    #[test]
    fn test_encoder_gradients_reach_first_layer() {
        let mut rng = StdRng::seed_from_u64(9);
        let store = ParamStore::cpu();
        let encoder =
            GatEncoder::two_layer(&store, 4, 3, 2, 2, HeadMerge::Concat, 0.01, 1.0, &mut rng)
                .unwrap();
        let graph = RegionGraph::fully_connected(3).unwrap();
        let y = encoder.forward(&features(), &index(&graph), 0).unwrap();
        let loss = y.sqr().unwrap().mean_all().unwrap();
        let grads = loss.backward().unwrap();
        let w = store.get("encoder.layer1.head0.fc.weight").unwrap().unwrap();
        let g = grads.get(&w).unwrap().flatten_all().unwrap().to_vec1::<f32>().unwrap();
        assert!(g.iter().any(|&v| v != 0.0));
    }
}

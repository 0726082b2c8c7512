//! Affinity matrix to directed edge list.
//!
//! Two passes run over each region's candidates ranked by descending
//! affinity:
//! - the primary pass keeps a few strong neighbours plus a short weak tail
//!   and is only reported as an [`AdjacencyMap`];
//! - the degree-repair pass keeps every candidate above the threshold and
//!   backfills weaker ones until the minimum out-degree is met. Its result
//!   is the trainable [`RegionGraph`].

use crate::core::{Error, Result};
use crate::graph::gravity::AffinityMatrix;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Configuration for edge construction.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GraphConfig {
    /// Affinity above which a candidate counts as strong
    pub threshold: f64,
    /// Primary pass: strong candidates are kept while their rank is below this
    pub top_k_cutoff: usize,
    /// Primary pass: number of weak candidates kept after the strong run
    pub backfill_cutoff: usize,
    /// Minimum out-degree guaranteed by the degree-repair pass
    pub min_degree: usize,
}

impl Default for GraphConfig {
    fn default() -> Self {
        Self {
            threshold: 17.0,
            top_k_cutoff: 4,
            backfill_cutoff: 2,
            min_degree: 5,
        }
    }
}

impl GraphConfig {
    pub fn validate(&self) -> Result<()> {
        if !self.threshold.is_finite() || self.threshold < 0.0 {
            return Err(Error::InvalidConfig(format!(
                "graph threshold must be a non-negative number, got {}",
                self.threshold
            )));
        }
        Ok(())
    }
}

/// A directed edge with the affinity that produced it.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Edge {
    /// Node the message comes from
    pub src: usize,
    /// Node the message is aggregated into
    pub dst: usize,
    /// Gravity score of the pair
    pub affinity: f64,
}

/// Static directed graph over region node indices.
#[derive(Clone, Debug)]
pub struct RegionGraph {
    num_nodes: usize,
    edges: Vec<Edge>,
    src: Arc<[usize]>,
    dst: Arc<[usize]>,
}

impl RegionGraph {
    /// Build from an edge list. Self-loops and duplicate pairs are dropped.
    pub fn new(num_nodes: usize, edges: Vec<Edge>) -> Result<Self> {
        if num_nodes == 0 {
            return Err(Error::EmptyRegions);
        }
        if let Some(e) = edges.iter().find(|e| e.src >= num_nodes || e.dst >= num_nodes) {
            return Err(Error::ShapeMismatch(format!(
                "edge {}->{} outside {} nodes",
                e.src, e.dst, num_nodes
            )));
        }

        let mut seen = std::collections::HashSet::new();
        let edges: Vec<Edge> = edges
            .into_iter()
            .filter(|e| e.src != e.dst && seen.insert((e.src, e.dst)))
            .collect();

        let src: Arc<[usize]> = edges.iter().map(|e| e.src).collect();
        let dst: Arc<[usize]> = edges.iter().map(|e| e.dst).collect();
        Ok(Self {
            num_nodes,
            edges,
            src,
            dst,
        })
    }

    /// Every ordered pair of distinct nodes, affinity 1.
    pub fn fully_connected(num_nodes: usize) -> Result<Self> {
        let edges = (0..num_nodes)
            .flat_map(|i| {
                (0..num_nodes).filter(move |&j| j != i).map(move |j| Edge {
                    src: i,
                    dst: j,
                    affinity: 1.0,
                })
            })
            .collect();
        Self::new(num_nodes, edges)
    }

    pub fn num_nodes(&self) -> usize {
        self.num_nodes
    }

    pub fn num_edges(&self) -> usize {
        self.edges.len()
    }

    pub fn edges(&self) -> &[Edge] {
        &self.edges
    }

    /// Source node of every edge, in edge order.
    pub fn sources(&self) -> &Arc<[usize]> {
        &self.src
    }

    /// Destination node of every edge, in edge order.
    pub fn destinations(&self) -> &Arc<[usize]> {
        &self.dst
    }

    pub fn out_degree(&self, node: usize) -> usize {
        self.src.iter().filter(|&&s| s == node).count()
    }

    pub fn in_degree(&self, node: usize) -> usize {
        self.dst.iter().filter(|&&d| d == node).count()
    }

    pub fn has_self_loops(&self) -> bool {
        self.edges.iter().any(|e| e.src == e.dst)
    }
}

/// Primary-pass neighbour lists, one per source node.
pub type AdjacencyMap = Vec<Vec<usize>>;

/// Output of [`build_graph`].
#[derive(Clone, Debug)]
pub struct GraphBuild {
    /// Trainable graph (degree-repair result)
    pub graph: RegionGraph,
    /// Informational primary-pass adjacency
    pub adjacency: AdjacencyMap,
    /// Nodes whose out-degree was capped below the minimum
    pub capped: Vec<usize>,
}

/// Other nodes ranked by descending affinity from `node`.
///
/// The sort is stable over node order, so equal affinities keep the
/// first-seen region first.
pub fn ranked_candidates(matrix: &AffinityMatrix, node: usize) -> Vec<(usize, f64)> {
    let mut ranked: Vec<(usize, f64)> = (0..matrix.len())
        .filter(|&j| j != node)
        .map(|j| (j, matrix.get(node, j)))
        .collect();
    ranked.sort_by(|a, b| b.1.total_cmp(&a.1));
    ranked
}

/// Primary pass for one node.
pub fn primary_neighbors(ranked: &[(usize, f64)], config: &GraphConfig) -> Vec<usize> {
    let mut picked = Vec::new();
    let mut weak_taken = 0;
    let mut in_tail = false;

    for (rank, &(j, affinity)) in ranked.iter().enumerate() {
        if affinity > config.threshold && !in_tail {
            if rank >= config.top_k_cutoff {
                break;
            }
            picked.push(j);
        } else {
            in_tail = true;
            if weak_taken >= config.backfill_cutoff {
                break;
            }
            picked.push(j);
            weak_taken += 1;
        }
    }
    picked
}

/// Degree-repair pass for one node: all strong candidates, then weak ones
/// by (affinity desc, name desc) until `min_degree` or the candidates run out.
pub fn repaired_neighbors(
    matrix: &AffinityMatrix,
    ranked: &[(usize, f64)],
    config: &GraphConfig,
) -> Vec<(usize, f64)> {
    let (mut picked, mut weak): (Vec<(usize, f64)>, Vec<(usize, f64)>) = ranked
        .iter()
        .partition(|&&(_, affinity)| affinity > config.threshold);

    if picked.len() < config.min_degree {
        weak.sort_by(|a, b| {
            b.1.total_cmp(&a.1)
                .then_with(|| matrix.name(b.0).cmp(matrix.name(a.0)))
        });
        let missing = config.min_degree - picked.len();
        picked.extend(weak.into_iter().take(missing));
    }
    picked
}

/// Build the region graph from an affinity matrix.
pub fn build_graph(matrix: &AffinityMatrix, config: &GraphConfig) -> Result<GraphBuild> {
    config.validate()?;
    let n = matrix.len();
    if n == 0 {
        return Err(Error::EmptyRegions);
    }

    let mut adjacency = Vec::with_capacity(n);
    let mut edges = Vec::new();
    let mut capped = Vec::new();

    for i in 0..n {
        let ranked = ranked_candidates(matrix, i);
        adjacency.push(primary_neighbors(&ranked, config));

        let neighbors = repaired_neighbors(matrix, &ranked, config);
        if neighbors.len() < config.min_degree {
            capped.push(i);
        }
        debug!(
            region = matrix.name(i),
            degree = neighbors.len(),
            "Repaired neighbour list"
        );
        edges.extend(neighbors.into_iter().map(|(j, affinity)| Edge {
            src: i,
            dst: j,
            affinity,
        }));
    }

    if !capped.is_empty() {
        warn!(
            capped = capped.len(),
            min_degree = config.min_degree,
            max_possible = n - 1,
            "Minimum out-degree unsatisfiable; capped at N-1"
        );
    }

    let graph = RegionGraph::new(n, edges)?;
    info!(
        nodes = graph.num_nodes(),
        edges = graph.num_edges(),
        threshold = config.threshold,
        "Built region graph"
    );

    Ok(GraphBuild {
        graph,
        adjacency,
        capped,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::Region;
    use crate::graph::gravity::GravityConfig;

    fn matrix(names: &[&str], scores: Vec<f64>) -> AffinityMatrix {
        AffinityMatrix::from_scores(names.iter().map(|s| s.to_string()).collect(), scores).unwrap()
    }

    #[test]
    fn test_three_regions_capped_at_two() {
        let m = matrix(
            &["a", "b", "c"],
            vec![1e5, 50.0, 40.0, 50.0, 1e5, 30.0, 40.0, 30.0, 1e5],
        );
        let build = build_graph(&m, &GraphConfig::default()).unwrap();
        for i in 0..3 {
            assert_eq!(build.graph.out_degree(i), 2);
        }
        assert_eq!(build.capped, vec![0, 1, 2]);
        assert!(!build.graph.has_self_loops());
    }

    #[test]
    fn test_min_degree_on_gravity_graph() {
        let regions: Vec<Region> = (0..12)
            .map(|i| {
                Region::new(
                    &format!("r{i}"),
                    30.0 + i as f64,
                    -100.0 - 2.0 * i as f64,
                    1_000_000 + 250_000 * i as u64,
                    50.0,
                )
            })
            .collect();
        let m = AffinityMatrix::compute(&regions, &GravityConfig::default()).unwrap();
        let build = build_graph(&m, &GraphConfig::default()).unwrap();
        for i in 0..regions.len() {
            assert!(build.graph.out_degree(i) >= 5);
        }
        assert!(build.capped.is_empty());
        assert!(!build.graph.has_self_loops());
    }

    #[test]
    fn test_strong_edges_all_kept() {
        // Node 0 has 6 strong neighbours; all survive the repair pass.
        let n = 7;
        let mut scores = vec![1.0; n * n];
        for j in 1..n {
            scores[j] = 100.0 + j as f64;
        }
        for i in 0..n {
            scores[i * n + i] = 1e5;
        }
        let m = matrix(&["a", "b", "c", "d", "e", "f", "g"], scores);
        let build = build_graph(&m, &GraphConfig::default()).unwrap();
        assert_eq!(build.graph.out_degree(0), 6);
        // Primary pass only keeps the first four ranks.
        assert_eq!(build.adjacency[0], vec![6, 5, 4, 3]);
    }

    #[test]
    fn test_backfill_breaks_ties_by_name_descending() {
        let names = ["src", "alpha", "beta", "gamma"];
        let n = names.len();
        let mut scores = vec![5.0; n * n];
        for i in 0..n {
            scores[i * n + i] = 1e5;
        }
        let m = matrix(&names, scores);
        let config = GraphConfig {
            min_degree: 2,
            ..Default::default()
        };
        let ranked = ranked_candidates(&m, 0);
        // Stable ranking keeps node order on ties.
        assert_eq!(
            ranked.iter().map(|r| r.0).collect::<Vec<_>>(),
            vec![1, 2, 3]
        );
        let picked: Vec<usize> = repaired_neighbors(&m, &ranked, &config)
            .into_iter()
            .map(|(j, _)| j)
            .collect();
        assert_eq!(picked, vec![3, 2]); // gamma, beta
    }

    #[test]
    fn test_primary_pass_weak_tail() {
        let config = GraphConfig::default();
        let ranked = vec![(1, 30.0), (2, 20.0), (3, 10.0), (4, 9.0), (5, 8.0)];
        assert_eq!(primary_neighbors(&ranked, &config), vec![1, 2, 3, 4]);

        let all_weak = vec![(1, 3.0), (2, 2.0), (3, 1.0)];
        assert_eq!(primary_neighbors(&all_weak, &config), vec![1, 2]);
    }

    #[test]
    fn test_single_region_graph_has_no_edges() {
        let m = matrix(&["solo"], vec![1e5]);
        let build = build_graph(&m, &GraphConfig::default()).unwrap();
        assert_eq!(build.graph.num_edges(), 0);
        assert_eq!(build.capped, vec![0]);
    }

    #[test]
    fn test_region_graph_drops_self_loops_and_duplicates() {
        let edges = vec![
            Edge { src: 0, dst: 0, affinity: 1.0 },
            Edge { src: 0, dst: 1, affinity: 1.0 },
            Edge { src: 0, dst: 1, affinity: 2.0 },
        ];
        let g = RegionGraph::new(2, edges).unwrap();
        assert_eq!(g.num_edges(), 1);
        assert!(RegionGraph::new(2, vec![Edge { src: 0, dst: 5, affinity: 1.0 }]).is_err());
    }

    #[test]
    fn test_fully_connected() {
        let g = RegionGraph::fully_connected(3).unwrap();
        assert_eq!(g.num_edges(), 6);
        assert_eq!(g.in_degree(1), 2);
    }
}

//! Summarization-tree builder.
//!
//! Takes the embedded leaf nodes of one document and produces a multi-level
//! tree plan, entirely in memory: k-means over the layer's vectors, one
//! summary node per cluster, children back-referencing their summary through
//! pre-commit temporary ids. The orchestrator remaps temporary ids to row ids
//! at commit time.
//!
//! Degenerate layers collapse instead of failing:
//! - a layer too small to form two clusters gets a single root summary and
//!   the build stops;
//! - when the loop exits below the level cap with several tops remaining,
//!   one extra root summary is emitted over them.

use anyhow::{anyhow, Result};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use crate::config::RaptorConfig;
use crate::embedding::Embedder;
use crate::llm::Summarizer;

/// Separator between member contents when building a cluster's input text.
const CLUSTER_JOINER: &str = "\n\n---\n\n";

/// Character cap of the no-summarizer fallback text.
const FALLBACK_SUMMARY_CHARS: usize = 1000;

const KMEANS_MAX_ITERS: usize = 100;
const KMEANS_TOLERANCE: f32 = 1e-6;

/// A node of the in-memory plan. `temp_id` and `parent_id` live in the
/// pre-commit id space; levels above 0 carry their own vectors.
#[derive(Debug, Clone)]
pub struct PlanNode {
    pub temp_id: i64,
    pub content: String,
    pub content_tokens: String,
    pub level: i64,
    pub parent_id: Option<i64>,
    pub chunk_order: i64,
    pub vector: Vec<f32>,
}

pub struct RaptorBuilder {
    config: RaptorConfig,
    embedder: Arc<dyn Embedder>,
    summarizer: Option<Arc<dyn Summarizer>>,
}

impl RaptorBuilder {
    pub fn new(
        config: RaptorConfig,
        embedder: Arc<dyn Embedder>,
        summarizer: Option<Arc<dyn Summarizer>>,
    ) -> Self {
        Self {
            config,
            embedder,
            summarizer,
        }
    }

    /// Build the tree plan over embedded leaves.
    ///
    /// Returns the input nodes (with `parent_id` filled in) plus the new
    /// summary nodes. Input order is preserved; summaries append after their
    /// children's layer.
    pub async fn build(
        &self,
        mut nodes: Vec<PlanNode>,
        cancel: &CancellationToken,
    ) -> Result<Vec<PlanNode>> {
        if nodes.len() < self.config.min_nodes {
            return Ok(nodes);
        }

        let mut next_id = nodes.iter().map(|n| n.temp_id).max().unwrap_or(0) + 1;

        // Indices into `nodes` forming the layer being clustered.
        let mut layer: Vec<usize> = (0..nodes.len()).collect();
        let mut level: i64 = 0;

        while (level as usize) < self.config.max_level && layer.len() >= self.config.min_nodes {
            let k = layer.len() / self.config.cluster_size;
            if k < 2 {
                // Not enough members for two clusters; collapse into one root.
                let root =
                    self.summarize_cluster(&nodes, &layer, level + 1, 0, next_id, cancel).await?;
                for &i in &layer {
                    nodes[i].parent_id = Some(next_id);
                }
                nodes.push(root);
                return Ok(nodes);
            }
            let k = k.min(layer.len());

            let vectors: Vec<&[f32]> = layer.iter().map(|&i| nodes[i].vector.as_slice()).collect();
            let assignment = kmeans(&vectors, k);

            let mut clusters: Vec<Vec<usize>> = vec![Vec::new(); k];
            for (pos, &cluster) in assignment.iter().enumerate() {
                clusters[cluster].push(layer[pos]);
            }

            let mut new_layer = Vec::new();
            for (cluster_idx, members) in clusters.iter().enumerate() {
                if members.is_empty() {
                    continue;
                }
                let summary = self
                    .summarize_cluster(
                        &nodes,
                        members,
                        level + 1,
                        new_layer.len() as i64,
                        next_id,
                        cancel,
                    )
                    .await
                    .map_err(|e| anyhow!("cluster {} at level {}: {}", cluster_idx, level + 1, e))?;
                for &i in members {
                    nodes[i].parent_id = Some(next_id);
                }
                nodes.push(summary);
                new_layer.push(nodes.len() - 1);
                next_id += 1;
            }

            layer = new_layer;
            level += 1;
        }

        if layer.len() > 1 && (level as usize) < self.config.max_level {
            let root =
                self.summarize_cluster(&nodes, &layer, level + 1, 0, next_id, cancel).await?;
            for &i in &layer {
                nodes[i].parent_id = Some(next_id);
            }
            nodes.push(root);
        }

        Ok(nodes)
    }

    /// Produce the summary node for one cluster: concatenate, truncate,
    /// summarize (or fall back), embed.
    async fn summarize_cluster(
        &self,
        nodes: &[PlanNode],
        members: &[usize],
        level: i64,
        chunk_order: i64,
        temp_id: i64,
        cancel: &CancellationToken,
    ) -> Result<PlanNode> {
        if cancel.is_cancelled() {
            return Err(anyhow!("cancelled"));
        }

        let joined = members
            .iter()
            .map(|&i| nodes[i].content.as_str())
            .collect::<Vec<_>>()
            .join(CLUSTER_JOINER);
        let input = truncate_chars(&joined, self.config.max_tokens_per_summary * 4);

        let content = match &self.summarizer {
            Some(summarizer) => summarizer.summarize(&input).await?,
            None => {
                let mut text = truncate_chars(&input, FALLBACK_SUMMARY_CHARS);
                if text.chars().count() < input.chars().count() {
                    text.push_str("...");
                }
                text
            }
        };

        let vector = self
            .embedder
            .embed(&[content.clone()])
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| anyhow!("empty embedding response for summary"))?;

        Ok(PlanNode {
            temp_id,
            content,
            content_tokens: String::new(),
            level,
            parent_id: None,
            chunk_order,
            vector,
        })
    }
}

fn truncate_chars(s: &str, max_chars: usize) -> String {
    s.chars().take(max_chars).collect()
}

// ============ k-means ============

/// Deterministic k-means: centroids seeded at evenly spaced member indices,
/// ties broken toward the lower cluster index, empty clusters reseeded from
/// the farthest point.
fn kmeans(vectors: &[&[f32]], k: usize) -> Vec<usize> {
    let n = vectors.len();
    debug_assert!(k >= 1 && k <= n);
    let dims = vectors[0].len();

    let mut centroids: Vec<Vec<f32>> = (0..k).map(|i| vectors[i * n / k].to_vec()).collect();
    let mut assignment = vec![0usize; n];

    for _ in 0..KMEANS_MAX_ITERS {
        // Assign each point to the nearest centroid.
        let mut distances = vec![0.0f32; n];
        for (point, vec) in vectors.iter().enumerate() {
            let mut best = 0usize;
            let mut best_dist = f32::MAX;
            for (cluster, centroid) in centroids.iter().enumerate() {
                let d = sq_distance(vec, centroid);
                if d < best_dist {
                    best_dist = d;
                    best = cluster;
                }
            }
            assignment[point] = best;
            distances[point] = best_dist;
        }

        // Reseed empty clusters from the farthest point.
        for cluster in 0..k {
            if assignment.iter().any(|&a| a == cluster) {
                continue;
            }
            let farthest = distances
                .iter()
                .enumerate()
                .max_by(|a, b| a.1.partial_cmp(b.1).unwrap_or(std::cmp::Ordering::Equal))
                .map(|(i, _)| i)
                .unwrap_or(0);
            assignment[farthest] = cluster;
            distances[farthest] = 0.0;
            centroids[cluster] = vectors[farthest].to_vec();
        }

        // Recompute centroids.
        let mut sums = vec![vec![0.0f32; dims]; k];
        let mut counts = vec![0usize; k];
        for (point, vec) in vectors.iter().enumerate() {
            let cluster = assignment[point];
            counts[cluster] += 1;
            for (d, v) in vec.iter().enumerate() {
                sums[cluster][d] += v;
            }
        }

        let mut shift = 0.0f32;
        for cluster in 0..k {
            if counts[cluster] == 0 {
                continue;
            }
            for d in 0..dims {
                sums[cluster][d] /= counts[cluster] as f32;
            }
            shift = shift.max(sq_distance(&sums[cluster], &centroids[cluster]));
            centroids[cluster] = std::mem::take(&mut sums[cluster]);
        }

        if shift < KMEANS_TOLERANCE {
            break;
        }
    }

    assignment
}

fn sq_distance(a: &[f32], b: &[f32]) -> f32 {
    a.iter().zip(b.iter()).map(|(x, y)| (x - y) * (x - y)).sum()
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;

    /// Embeds text into a 2-d vector from its first byte; deterministic and
    /// cluster-friendly.
    struct ByteEmbedder;

    #[async_trait]
    impl Embedder for ByteEmbedder {
        async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
            Ok(texts
                .iter()
                .map(|t| {
                    let b = t.bytes().next().unwrap_or(0) as f32;
                    vec![b, 1.0]
                })
                .collect())
        }
        fn model_name(&self) -> &str {
            "byte"
        }
    }

    fn leaf(temp_id: i64, content: &str, vector: Vec<f32>) -> PlanNode {
        PlanNode {
            temp_id,
            content: content.to_string(),
            content_tokens: String::new(),
            level: 0,
            parent_id: None,
            chunk_order: temp_id - 1,
            vector,
        }
    }

    fn builder(config: RaptorConfig) -> RaptorBuilder {
        RaptorBuilder::new(config, Arc::new(ByteEmbedder), None)
    }

    #[tokio::test]
    async fn test_below_min_nodes_unchanged() {
        let config = RaptorConfig {
            min_nodes: 3,
            ..Default::default()
        };
        let nodes = vec![
            leaf(1, "a", vec![1.0, 0.0]),
            leaf(2, "b", vec![0.0, 1.0]),
        ];
        let out = builder(config)
            .build(nodes.clone(), &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(out.len(), 2);
        assert!(out.iter().all(|n| n.parent_id.is_none() && n.level == 0));
    }

    #[tokio::test]
    async fn test_small_layer_collapses_to_single_root() {
        let config = RaptorConfig {
            min_nodes: 2,
            cluster_size: 5,
            ..Default::default()
        };
        let nodes = vec![
            leaf(1, "alpha", vec![1.0, 0.0]),
            leaf(2, "beta", vec![0.0, 1.0]),
        ];
        let out = builder(config)
            .build(nodes, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(out.len(), 3);
        let root = &out[2];
        assert_eq!(root.level, 1);
        assert_eq!(root.temp_id, 3);
        assert_eq!(out[0].parent_id, Some(3));
        assert_eq!(out[1].parent_id, Some(3));
        assert!(root.content.contains("alpha"));
        assert!(root.content.contains("---"));
    }

    #[tokio::test]
    async fn test_shrunk_layer_gets_single_extra_root() {
        // 10 leaves, cluster_size 5 → 2 summaries at level 1; the layer of 2
        // is below min_nodes, so the loop exits and one root covers both.
        let config = RaptorConfig {
            min_nodes: 3,
            cluster_size: 5,
            max_level: 2,
            ..Default::default()
        };
        let nodes: Vec<PlanNode> = (0..10)
            .map(|i| {
                let v = if i < 5 { vec![0.0, 1.0] } else { vec![100.0, 1.0] };
                leaf(i + 1, if i < 5 { "left" } else { "right" }, v)
            })
            .collect();
        let out = builder(config)
            .build(nodes, &CancellationToken::new())
            .await
            .unwrap();

        let level1: Vec<&PlanNode> = out.iter().filter(|n| n.level == 1).collect();
        let level2: Vec<&PlanNode> = out.iter().filter(|n| n.level == 2).collect();
        assert_eq!(level1.len(), 2);
        assert_eq!(level2.len(), 1, "exactly one root");
        for summary in &level1 {
            assert_eq!(summary.parent_id, Some(level2[0].temp_id));
        }
        // Every leaf points at one of the level-1 summaries.
        for leaf_node in out.iter().filter(|n| n.level == 0) {
            let parent = leaf_node.parent_id.expect("leaf has parent");
            assert!(level1.iter().any(|s| s.temp_id == parent));
        }
    }

    #[tokio::test]
    async fn test_parent_always_higher_level() {
        let config = RaptorConfig {
            min_nodes: 3,
            cluster_size: 3,
            max_level: 2,
            ..Default::default()
        };
        let nodes: Vec<PlanNode> = (0..12)
            .map(|i| leaf(i + 1, "n", vec![(i as f32) * 10.0, 1.0]))
            .collect();
        let out = builder(config)
            .build(nodes, &CancellationToken::new())
            .await
            .unwrap();
        let by_id: std::collections::HashMap<i64, &PlanNode> =
            out.iter().map(|n| (n.temp_id, n)).collect();
        for node in &out {
            if let Some(parent) = node.parent_id {
                assert!(by_id[&parent].level > node.level);
            }
        }
    }

    #[tokio::test]
    async fn test_fallback_summary_truncates_with_ellipsis() {
        let config = RaptorConfig {
            min_nodes: 2,
            cluster_size: 5,
            ..Default::default()
        };
        let long = "x".repeat(3000);
        let nodes = vec![leaf(1, &long, vec![1.0, 0.0]), leaf(2, &long, vec![0.0, 1.0])];
        let out = builder(config)
            .build(nodes, &CancellationToken::new())
            .await
            .unwrap();
        let root = out.last().unwrap();
        assert!(root.content.ends_with("..."));
        assert_eq!(root.content.chars().count(), 1003);
    }

    #[tokio::test]
    async fn test_cancel_aborts_build() {
        let config = RaptorConfig {
            min_nodes: 2,
            cluster_size: 5,
            ..Default::default()
        };
        let nodes = vec![leaf(1, "a", vec![1.0, 0.0]), leaf(2, "b", vec![0.0, 1.0])];
        let cancel = CancellationToken::new();
        cancel.cancel();
        assert!(builder(config).build(nodes, &cancel).await.is_err());
    }

    #[test]
    fn test_kmeans_deterministic_and_balanced() {
        let raw: Vec<Vec<f32>> = (0..10)
            .map(|i| if i < 5 { vec![0.0, 0.0] } else { vec![50.0, 50.0] })
            .collect();
        let vectors: Vec<&[f32]> = raw.iter().map(|v| v.as_slice()).collect();
        let a = kmeans(&vectors, 2);
        let b = kmeans(&vectors, 2);
        assert_eq!(a, b);
        assert_eq!(a[0], a[4]);
        assert_eq!(a[5], a[9]);
        assert_ne!(a[0], a[5]);
    }

    #[test]
    fn test_kmeans_k_equals_n() {
        let raw: Vec<Vec<f32>> = (0..3).map(|i| vec![i as f32 * 10.0]).collect();
        let vectors: Vec<&[f32]> = raw.iter().map(|v| v.as_slice()).collect();
        let assignment = kmeans(&vectors, 3);
        let mut seen = assignment.clone();
        seen.sort_unstable();
        seen.dedup();
        assert_eq!(seen.len(), 3, "every cluster occupied: {:?}", assignment);
    }
}

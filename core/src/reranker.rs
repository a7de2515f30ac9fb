//! Feedback-trained re-ranker.
//!
//! A small random forest of CART regression trees. Each tree is grown on a
//! bootstrap sample (or the full set for tiny ledgers) by greedily picking the
//! split that minimizes the summed squared error of both children. The forest
//! prediction is the mean of its trees. An untrained forest predicts `0.0`.

use crate::error::{SearchError, SearchResult};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};

/// Below this many samples every tree sees the full training set.
const MIN_BOOTSTRAP_SAMPLES: usize = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ForestConfig {
    pub trees: usize,
    pub max_depth: usize,
    pub min_samples_split: usize,
    pub seed: u64,
}

impl Default for ForestConfig {
    fn default() -> Self {
        Self { trees: 32, max_depth: 6, min_samples_split: 2, seed: 0x5EED }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct TrainingSample {
    pub features: Vec<f32>,
    pub target: f32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
enum Node {
    Leaf { value: f32 },
    Split { feature: usize, threshold: f32, left: Box<Node>, right: Box<Node> },
}

impl Node {
    fn predict(&self, features: &[f32]) -> f32 {
        let mut node = self;
        loop {
            match node {
                Node::Leaf { value } => return *value,
                Node::Split { feature, threshold, left, right } => {
                    let x = features.get(*feature).copied().unwrap_or(0.0);
                    node = if x <= *threshold { left } else { right };
                }
            }
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Reranker {
    config: ForestConfig,
    num_features: usize,
    trees: Vec<Node>,
}

impl Default for Reranker {
    fn default() -> Self {
        Self::new(ForestConfig::default())
    }
}

impl Reranker {
    pub fn new(config: ForestConfig) -> Self {
        Self { config, num_features: 0, trees: Vec::new() }
    }

    pub fn config(&self) -> ForestConfig {
        self.config
    }

    pub fn is_trained(&self) -> bool {
        !self.trees.is_empty()
    }

    /// Mean tree output; `0.0` until the first successful fit.
    pub fn predict(&self, features: &[f32]) -> f32 {
        if self.trees.is_empty() {
            return 0.0;
        }
        let sum: f32 = self.trees.iter().map(|t| t.predict(features)).sum();
        sum / self.trees.len() as f32
    }

    /// Full refit on `samples`, replacing any previous trees.
    pub fn fit(&mut self, samples: &[TrainingSample]) -> SearchResult<()> {
        let first = samples.first().ok_or_else(|| SearchError::invalid("no training samples"))?;
        let num_features = first.features.len();
        if num_features == 0 {
            return Err(SearchError::invalid("training samples have no features"));
        }
        if samples.iter().any(|s| s.features.len() != num_features) {
            return Err(SearchError::invalid("training samples disagree on feature count"));
        }

        let mut rng = StdRng::seed_from_u64(self.config.seed);
        let n = samples.len();
        let mut trees = Vec::with_capacity(self.config.trees.max(1));
        for _ in 0..self.config.trees.max(1) {
            let mut idx: Vec<usize> = if n >= MIN_BOOTSTRAP_SAMPLES {
                (0..n).map(|_| rng.gen_range(0..n)).collect()
            } else {
                (0..n).collect()
            };
            trees.push(grow(samples, &mut idx, 0, num_features, &self.config));
        }

        tracing::info!(samples = n, trees = trees.len(), "re-ranker fitted");
        self.num_features = num_features;
        self.trees = trees;
        Ok(())
    }
}

fn mean(samples: &[TrainingSample], idx: &[usize]) -> f32 {
    let sum: f64 = idx.iter().map(|&i| samples[i].target as f64).sum();
    (sum / idx.len().max(1) as f64) as f32
}

fn sse(sum: f64, sum_sq: f64, count: f64) -> f64 {
    sum_sq - sum * sum / count
}

struct BestSplit {
    feature: usize,
    threshold: f32,
    error: f64,
}

fn grow(samples: &[TrainingSample], idx: &mut [usize], depth: usize, num_features: usize, cfg: &ForestConfig) -> Node {
    let value = mean(samples, idx);
    if depth >= cfg.max_depth || idx.len() < cfg.min_samples_split.max(2) {
        return Node::Leaf { value };
    }

    let total: f64 = idx.iter().map(|&i| samples[i].target as f64).sum();
    let total_sq: f64 = idx.iter().map(|&i| (samples[i].target as f64).powi(2)).sum();
    let parent_error = sse(total, total_sq, idx.len() as f64);
    if parent_error <= 1e-12 {
        return Node::Leaf { value };
    }

    let mut best: Option<BestSplit> = None;
    for feature in 0..num_features {
        idx.sort_by(|&a, &b| samples[a].features[feature].total_cmp(&samples[b].features[feature]));
        let (mut left_sum, mut left_sq) = (0.0f64, 0.0f64);
        for split in 1..idx.len() {
            let t = samples[idx[split - 1]].target as f64;
            left_sum += t;
            left_sq += t * t;
            let lo = samples[idx[split - 1]].features[feature];
            let hi = samples[idx[split]].features[feature];
            if lo == hi {
                continue;
            }
            let left_n = split as f64;
            let right_n = (idx.len() - split) as f64;
            let error = sse(left_sum, left_sq, left_n) + sse(total - left_sum, total_sq - left_sq, right_n);
            if best.as_ref().map_or(true, |b| error < b.error) {
                best = Some(BestSplit { feature, threshold: lo + (hi - lo) / 2.0, error });
            }
        }
    }

    let Some(best) = best.filter(|b| b.error < parent_error) else {
        return Node::Leaf { value };
    };

    idx.sort_by(|&a, &b| samples[a].features[best.feature].total_cmp(&samples[b].features[best.feature]));
    let cut = idx.partition_point(|&i| samples[i].features[best.feature] <= best.threshold);
    let (left, right) = idx.split_at_mut(cut);
    Node::Split {
        feature: best.feature,
        threshold: best.threshold,
        left: Box::new(grow(samples, left, depth + 1, num_features, cfg)),
        right: Box::new(grow(samples, right, depth + 1, num_features, cfg)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(features: &[f32], target: f32) -> TrainingSample {
        TrainingSample { features: features.to_vec(), target }
    }

    #[test]
    fn untrained_predicts_zero() {
        let r = Reranker::default();
        assert!(!r.is_trained());
        assert_eq!(r.predict(&[0.9, 0.5]), 0.0);
    }

    #[test]
    fn learns_a_threshold() {
        let samples = vec![
            sample(&[0.1], 0.0),
            sample(&[0.2], 0.0),
            sample(&[0.8], 1.0),
            sample(&[0.9], 1.0),
        ];
        let mut r = Reranker::default();
        r.fit(&samples).unwrap();
        assert!(r.is_trained());
        assert!(r.predict(&[0.85]) > r.predict(&[0.15]));
    }

    #[test]
    fn same_seed_same_model() {
        let samples: Vec<_> = (0..40)
            .map(|i| {
                let x = i as f32 / 40.0;
                sample(&[x, (i % 3) as f32], if i % 3 == 0 { 1.0 } else { 0.0 })
            })
            .collect();
        let mut a = Reranker::default();
        let mut b = Reranker::default();
        a.fit(&samples).unwrap();
        b.fit(&samples).unwrap();
        for probe in [[0.1, 0.0], [0.5, 1.0], [0.9, 2.0]] {
            assert_eq!(a.predict(&probe), b.predict(&probe));
        }
    }

    #[test]
    fn rejects_ragged_features() {
        let mut r = Reranker::default();
        let err = r.fit(&[sample(&[0.1], 0.0), sample(&[0.1, 0.2], 1.0)]).unwrap_err();
        assert!(matches!(err, SearchError::InvalidInput(_)));
        assert!(!r.is_trained());
    }
}

//! Isolation forest outlier model
//!
//! Random axis-aligned splits isolate anomalous samples in fewer steps than
//! normal ones. The forest is seeded, so a fit is reproducible for a given
//! seed and input order.

use super::{check_dimensions, OutlierModel, Verdict};
use crate::error::ComputeError;
use crate::stats::percentile;
use crate::types::ModelKind;
use rand::rngs::StdRng;
use rand::seq::index::sample as sample_indices;
use rand::{Rng, SeedableRng};
use tracing::debug;

const EULER_GAMMA: f64 = 0.577_215_664_9;

/// Average path length of an unsuccessful BST search over `n` samples
pub fn average_path_length(n: usize) -> f64 {
    match n {
        0 | 1 => 0.0,
        2 => 1.0,
        _ => {
            let n = n as f64;
            2.0 * ((n - 1.0).ln() + EULER_GAMMA) - 2.0 * (n - 1.0) / n
        }
    }
}

#[derive(Debug, Clone)]
enum Node {
    Leaf {
        size: usize,
    },
    Split {
        feature: usize,
        value: f64,
        left: Box<Node>,
        right: Box<Node>,
    },
}

#[derive(Debug, Clone)]
struct IsolationTree {
    root: Node,
}

impl IsolationTree {
    fn build(data: &[Vec<f64>], indices: Vec<usize>, height_limit: usize, rng: &mut StdRng) -> Self {
        Self {
            root: grow(data, indices, 0, height_limit, rng),
        }
    }

    fn path_length(&self, sample: &[f64]) -> f64 {
        let mut node = &self.root;
        let mut depth = 0.0;
        loop {
            match node {
                Node::Leaf { size } => return depth + average_path_length(*size),
                Node::Split {
                    feature,
                    value,
                    left,
                    right,
                } => {
                    node = if sample[*feature] < *value { left } else { right };
                    depth += 1.0;
                }
            }
        }
    }
}

fn grow(
    data: &[Vec<f64>],
    indices: Vec<usize>,
    depth: usize,
    height_limit: usize,
    rng: &mut StdRng,
) -> Node {
    if depth >= height_limit || indices.len() <= 1 {
        return Node::Leaf {
            size: indices.len(),
        };
    }

    // Only features that still vary can split
    let dims = data[indices[0]].len();
    let candidates: Vec<(usize, f64, f64)> = (0..dims)
        .filter_map(|f| {
            let (lo, hi) = indices.iter().fold((f64::INFINITY, f64::NEG_INFINITY), |(lo, hi), i| {
                (lo.min(data[*i][f]), hi.max(data[*i][f]))
            });
            (lo < hi).then_some((f, lo, hi))
        })
        .collect();
    if candidates.is_empty() {
        return Node::Leaf {
            size: indices.len(),
        };
    }

    let (feature, lo, hi) = candidates[rng.gen_range(0..candidates.len())];
    let value = rng.gen_range(lo..hi);
    let (left, right): (Vec<usize>, Vec<usize>) =
        indices.into_iter().partition(|i| data[*i][feature] < value);

    Node::Split {
        feature,
        value,
        left: Box::new(grow(data, left, depth + 1, height_limit, rng)),
        right: Box::new(grow(data, right, depth + 1, height_limit, rng)),
    }
}

/// Isolation forest outlier model
#[derive(Debug, Clone)]
pub struct IsolationForestModel {
    n_estimators: usize,
    max_samples: usize,
    contamination: f64,
    seed: u64,
    trees: Vec<IsolationTree>,
    sample_size: usize,
    offset: f64,
}

impl IsolationForestModel {
    pub fn new(n_estimators: usize, max_samples: usize, contamination: f64, seed: u64) -> Self {
        Self {
            n_estimators,
            max_samples,
            contamination,
            seed,
            trees: Vec::new(),
            sample_size: 0,
            offset: 0.0,
        }
    }

    /// Offset subtracted from raw scores; the `contamination` percentile
    pub fn offset(&self) -> f64 {
        self.offset
    }

    /// Raw score `-2^(-E[h] / c(psi))`, in `[-1, 0)`; lower is more anomalous
    pub fn raw_score(&self, sample: &[f64]) -> f64 {
        let mean_path = self.trees.iter().map(|t| t.path_length(sample)).sum::<f64>()
            / self.trees.len() as f64;
        let norm = average_path_length(self.sample_size);
        if norm <= 0.0 {
            return -1.0;
        }
        -(2f64.powf(-mean_path / norm))
    }

    fn verdict(&self, raw: f64, degenerate: bool) -> Verdict {
        let decision = raw - self.offset;
        let abnormal = !degenerate && decision < 0.0;
        Verdict {
            abnormal,
            label: if abnormal {
                ModelKind::IsolationBased.abnormal_label()
            } else {
                ModelKind::IsolationBased.normal_label()
            },
            abnormality_score: Some(decision),
            distance_score: None,
        }
    }
}

impl OutlierModel for IsolationForestModel {
    fn kind(&self) -> ModelKind {
        ModelKind::IsolationBased
    }

    fn fit_predict(&mut self, data: &[Vec<f64>]) -> Result<Vec<Verdict>, ComputeError> {
        check_dimensions(data)?;
        let n = data.len();
        self.sample_size = self.max_samples.min(n);
        let height_limit = (self.sample_size.max(2) as f64).log2().ceil() as usize;

        let mut rng = StdRng::seed_from_u64(self.seed);
        self.trees = (0..self.n_estimators)
            .map(|_| {
                let indices = sample_indices(&mut rng, n, self.sample_size).into_vec();
                IsolationTree::build(data, indices, height_limit, &mut rng)
            })
            .collect();

        let scores: Vec<f64> = data.iter().map(|x| self.raw_score(x)).collect();
        let degenerate = n < 2;
        self.offset = percentile(&scores, 100.0 * self.contamination).unwrap_or(0.0);
        debug!(
            trees = self.trees.len(),
            sample_size = self.sample_size,
            offset = self.offset,
            "Isolation forest fitted"
        );

        Ok(scores
            .into_iter()
            .map(|s| self.verdict(s, degenerate))
            .collect())
    }

}

//! Neighbor-distance outlier model

use super::{check_dimensions, euclidean, OutlierModel, Verdict};
use crate::config::NeighborAggregation;
use crate::error::ComputeError;
use crate::stats::{mean, median, percentile};
use crate::types::ModelKind;
use tracing::debug;

/// kNN outlier model
///
/// A sample's score aggregates the distances to its `k` nearest training
/// samples; scores above the `1 - contamination` percentile of the training
/// scores are abnormal.
#[derive(Debug, Clone)]
pub struct NeighborDistanceModel {
    n_neighbors: usize,
    aggregation: NeighborAggregation,
    contamination: f64,
    k: usize,
    threshold: Option<f64>,
}

impl NeighborDistanceModel {
    pub fn new(n_neighbors: usize, aggregation: NeighborAggregation, contamination: f64) -> Self {
        Self {
            n_neighbors,
            aggregation,
            contamination,
            k: 0,
            threshold: None,
        }
    }

    /// Effective neighbor count after fitting
    pub fn k(&self) -> usize {
        self.k
    }

    /// Score threshold after fitting; `None` when the fit was degenerate
    pub fn threshold(&self) -> Option<f64> {
        self.threshold
    }

    fn aggregate(&self, mut distances: Vec<f64>) -> f64 {
        distances.sort_by(|a, b| a.total_cmp(b));
        distances.truncate(self.k);
        let aggregated = match self.aggregation {
            NeighborAggregation::Largest => distances.last().copied(),
            NeighborAggregation::Mean => mean(&distances),
            NeighborAggregation::Median => median(&distances),
        };
        aggregated.unwrap_or(0.0)
    }

    fn verdict(&self, score: f64) -> Verdict {
        let abnormal = self.threshold.map_or(false, |t| score > t);
        Verdict {
            abnormal,
            label: if abnormal {
                ModelKind::NeighborDistance.abnormal_label()
            } else {
                ModelKind::NeighborDistance.normal_label()
            },
            abnormality_score: None,
            distance_score: Some(score),
        }
    }
}

impl OutlierModel for NeighborDistanceModel {
    fn kind(&self) -> ModelKind {
        ModelKind::NeighborDistance
    }

    fn fit_predict(&mut self, data: &[Vec<f64>]) -> Result<Vec<Verdict>, ComputeError> {
        check_dimensions(data)?;
        self.k = self.n_neighbors.min(data.len() - 1);

        let scores: Vec<f64> = if self.k == 0 {
            vec![0.0; data.len()]
        } else {
            (0..data.len())
                .map(|i| {
                    let distances = (0..data.len())
                        .filter(|j| *j != i)
                        .map(|j| euclidean(&data[i], &data[j]))
                        .collect();
                    self.aggregate(distances)
                })
                .collect()
        };

        self.threshold = if self.k == 0 {
            None
        } else {
            percentile(&scores, 100.0 * (1.0 - self.contamination))
        };
        debug!(k = self.k, threshold = ?self.threshold, "kNN fitted");

        Ok(scores.into_iter().map(|s| self.verdict(s)).collect())
    }

}

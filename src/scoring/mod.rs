//! Anomaly scoring of dose feature rows
//!
//! Two interchangeable outlier models score the selected feature columns:
//! - Neighbor distance (kNN), native labels normal 0 / abnormal 1
//! - Isolation forest, native labels normal 1 / abnormal -1
//!
//! The scorer normalizes both into a single `abnormal` verdict per row.

mod filter;
mod isolation_forest;
mod knn;

pub use filter::*;
pub use isolation_forest::*;
pub use knn::*;

use crate::config::{NeighborAggregation, PipelineConfig};
use crate::error::ComputeError;
use crate::types::{DoseFeatureRow, FeatureColumn, ModelKind};
use serde::{Deserialize, Serialize};
use std::fmt;
use tracing::{info, warn};

/// Model output for one row
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Verdict {
    pub abnormal: bool,
    /// Native label of the model that produced the verdict
    pub label: i8,
    /// Isolation forest decision value; more negative is more anomalous
    pub abnormality_score: Option<f64>,
    /// Aggregated neighbor distance; larger is more anomalous
    pub distance_score: Option<f64>,
}

impl Verdict {
    /// Single ordering key across models: larger is more anomalous
    pub fn severity(&self) -> f64 {
        match (self.distance_score, self.abnormality_score) {
            (Some(d), _) => d,
            (None, Some(a)) => -a,
            (None, None) => f64::NEG_INFINITY,
        }
    }
}

/// An outlier model fitted on the rows it scores
pub trait OutlierModel: Send + fmt::Debug {
    fn kind(&self) -> ModelKind;

    /// Fit on `data` (one row per sample) and return the training verdicts
    fn fit_predict(&mut self, data: &[Vec<f64>]) -> Result<Vec<Verdict>, ComputeError>;
}

/// Parameters of the scoring stage
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScorerParams {
    pub model_kind: ModelKind,
    pub contamination: f64,
    pub n_neighbors: usize,
    pub neighbor_aggregation: NeighborAggregation,
    pub n_estimators: usize,
    pub max_samples: usize,
    pub seed: u64,
}

impl Default for ScorerParams {
    fn default() -> Self {
        Self::from(&PipelineConfig::default())
    }
}

impl From<&PipelineConfig> for ScorerParams {
    fn from(config: &PipelineConfig) -> Self {
        Self {
            model_kind: config.model_kind,
            contamination: config.contamination,
            n_neighbors: config.n_neighbors,
            neighbor_aggregation: config.neighbor_aggregation,
            n_estimators: config.n_estimators,
            max_samples: config.max_samples,
            seed: config.seed,
        }
    }
}

/// A feature row with its verdict appended
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScoredDose {
    pub row: DoseFeatureRow,
    pub verdict: Verdict,
}

/// Normal/abnormal counts of one scoring run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScoreSummary {
    pub scored: usize,
    pub normal: usize,
    pub abnormal: usize,
    /// Rows dropped for a missing value in a selected column
    pub excluded: usize,
    /// Omitted when every row carries the same label
    #[serde(skip_serializing_if = "Option::is_none")]
    pub abnormal_percentage: Option<f64>,
}

impl ScoreSummary {
    fn from_verdicts(verdicts: &[Verdict], excluded: usize) -> Self {
        let abnormal = verdicts.iter().filter(|v| v.abnormal).count();
        let normal = verdicts.len() - abnormal;
        let abnormal_percentage = (abnormal > 0 && normal > 0)
            .then(|| 100.0 * abnormal as f64 / verdicts.len() as f64);
        Self {
            scored: verdicts.len(),
            normal,
            abnormal,
            excluded,
            abnormal_percentage,
        }
    }

    /// True when the fit separated nothing
    pub fn is_degenerate(&self) -> bool {
        self.abnormal_percentage.is_none()
    }
}

/// Scored rows of one review
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VerdictTable {
    pub model_kind: ModelKind,
    pub feature_columns: Vec<FeatureColumn>,
    pub rows: Vec<ScoredDose>,
    pub summary: ScoreSummary,
}

impl VerdictTable {
    pub fn abnormal(&self) -> impl Iterator<Item = &ScoredDose> {
        self.rows.iter().filter(|r| r.verdict.abnormal)
    }

    /// Abnormal rows, most anomalous first
    pub fn ranked_abnormal(&self) -> Vec<&ScoredDose> {
        let mut ranked: Vec<&ScoredDose> = self.abnormal().collect();
        ranked.sort_by(|a, b| b.verdict.severity().total_cmp(&a.verdict.severity()));
        ranked
    }
}

/// Scorer that builds and fits the configured model
pub struct AnomalyScorer {
    params: ScorerParams,
}

impl AnomalyScorer {
    pub fn new(params: ScorerParams) -> Self {
        Self { params }
    }

    pub fn params(&self) -> &ScorerParams {
        &self.params
    }

    /// Unfitted model of the configured kind
    pub fn build_model(&self) -> Box<dyn OutlierModel> {
        let p = &self.params;
        match p.model_kind {
            ModelKind::NeighborDistance => Box::new(NeighborDistanceModel::new(
                p.n_neighbors,
                p.neighbor_aggregation,
                p.contamination,
            )),
            ModelKind::IsolationBased => Box::new(IsolationForestModel::new(
                p.n_estimators,
                p.max_samples,
                p.contamination,
                p.seed,
            )),
        }
    }

    /// Score `rows` on `columns`, returning the verdicts and the fitted model
    pub fn score(
        &self,
        rows: &[DoseFeatureRow],
        columns: &[FeatureColumn],
    ) -> Result<(VerdictTable, Box<dyn OutlierModel>), ComputeError> {
        if columns.is_empty() {
            return Err(ComputeError::Configuration(
                "at least one feature column is required for scoring".to_string(),
            ));
        }

        let mut kept = Vec::with_capacity(rows.len());
        let mut matrix = Vec::with_capacity(rows.len());
        for row in rows {
            let values: Option<Vec<f64>> = columns.iter().map(|c| c.value(row)).collect();
            if let Some(values) = values {
                kept.push(row);
                matrix.push(values);
            }
        }
        let excluded = rows.len() - kept.len();
        if excluded > 0 {
            warn!(excluded, "Rows with missing feature values excluded from scoring");
        }
        if kept.is_empty() {
            return Err(ComputeError::InsufficientData(format!(
                "no rows with complete values for columns [{}]",
                join_columns(columns)
            )));
        }

        let mut model = self.build_model();
        let verdicts = model.fit_predict(&matrix)?;
        let summary = ScoreSummary::from_verdicts(&verdicts, excluded);

        info!(
            model = %self.params.model_kind,
            scored = summary.scored,
            abnormal = summary.abnormal,
            degenerate = summary.is_degenerate(),
            "Scoring complete"
        );

        let rows = kept
            .into_iter()
            .zip(verdicts)
            .map(|(row, verdict)| ScoredDose {
                row: row.clone(),
                verdict,
            })
            .collect();

        Ok((
            VerdictTable {
                model_kind: self.params.model_kind,
                feature_columns: columns.to_vec(),
                rows,
                summary,
            },
            model,
        ))
    }
}

fn join_columns(columns: &[FeatureColumn]) -> String {
    columns
        .iter()
        .map(|c| c.as_str())
        .collect::<Vec<_>>()
        .join(", ")
}

/// Euclidean distance of two equal-length samples
pub(crate) fn euclidean(a: &[f64], b: &[f64]) -> f64 {
    a.iter()
        .zip(b)
        .map(|(x, y)| (x - y).powi(2))
        .sum::<f64>()
        .sqrt()
}

pub(crate) fn check_dimensions(data: &[Vec<f64>]) -> Result<usize, ComputeError> {
    let dims = data.first().map(|r| r.len()).unwrap_or(0);
    if dims == 0 {
        return Err(ComputeError::InsufficientData(
            "cannot fit a model on an empty matrix".to_string(),
        ));
    }
    if data.iter().any(|r| r.len() != dims) {
        return Err(ComputeError::DataFormat(
            "feature rows have inconsistent lengths".to_string(),
        ));
    }
    Ok(dims)
}

#[cfg(test)]
pub(crate) mod test_support {
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    /// `n` samples around the origin in `dims` dimensions
    pub fn cloud(n: usize, dims: usize, seed: u64) -> Vec<Vec<f64>> {
        let mut rng = StdRng::seed_from_u64(seed);
        (0..n)
            .map(|_| (0..dims).map(|_| rng.gen_range(-1.0..1.0)).collect())
            .collect()
    }
}

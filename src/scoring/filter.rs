//! Low-glucose post-filter for abnormal boluses

use super::{ScoredDose, VerdictTable};
use crate::config::PipelineConfig;
use crate::stats::percentile;
use crate::types::GlucoseSeries;
use serde::{Deserialize, Serialize};
use tracing::debug;

/// Keeps abnormal boluses that were followed by low glucose
///
/// The threshold is a percentile of the person's real readings, never lower
/// than `floor` (mmol/L).
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LowGlucoseFilter {
    pub percentile: f64,
    pub floor: f64,
}

impl Default for LowGlucoseFilter {
    fn default() -> Self {
        Self::from(&PipelineConfig::default())
    }
}

impl From<&PipelineConfig> for LowGlucoseFilter {
    fn from(config: &PipelineConfig) -> Self {
        Self {
            percentile: config.low_glucose_percentile,
            floor: config.low_glucose_floor,
        }
    }
}

impl LowGlucoseFilter {
    /// Threshold for `series`; the floor when no reading exists
    pub fn threshold(&self, series: &GlucoseSeries) -> f64 {
        percentile(&series.real_values(), self.percentile)
            .map_or(self.floor, |p| p.max(self.floor))
    }

    /// Abnormal rows whose reading 75 minutes after the dose is below
    /// `threshold`, most anomalous first
    pub fn apply(&self, table: &VerdictTable, threshold: f64) -> Vec<ScoredDose> {
        let kept: Vec<ScoredDose> = table
            .ranked_abnormal()
            .into_iter()
            .filter(|s| s.row.glucose_75min_after.map_or(false, |g| g < threshold))
            .cloned()
            .collect();
        debug!(
            threshold,
            abnormal = table.summary.abnormal,
            kept = kept.len(),
            "Low glucose filter applied"
        );
        kept
    }
}

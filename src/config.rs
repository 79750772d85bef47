//! Pipeline configuration
//!
//! All tunables recognized by the pipeline and their defaults.
//! Configuration is validated before any data is read.

use crate::error::ComputeError;
use crate::types::ModelKind;
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Letters available for SAX symbols
pub const SAX_ALPHABET: &str = "abcdefghijklmnopqrstuvwxyz";

/// Largest usable alphabet; one letter is reserved for windows with no data
pub const MAX_ALPHABET_SIZE: usize = 25;

/// How neighbor distances are collapsed into one outlier score
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NeighborAggregation {
    /// Distance to the k-th nearest neighbor
    Largest,
    /// Mean distance to the k nearest neighbors
    Mean,
    /// Median distance to the k nearest neighbors
    Median,
}

/// Configuration for one pipeline run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// SAX alphabet size K (2..=25)
    pub alphabet_size: usize,
    /// SAX window used for the per-dose annotation strings
    pub sax_window_minutes: i64,
    /// Additional SAX resolutions written as standalone views
    pub sax_resolutions: Vec<i64>,
    /// Minutes of glucose considered before and after each dose
    pub consideration_window_minutes: i64,
    /// Glucose grid cadence
    pub glucose_cadence_minutes: i64,
    /// Half-width of the window searched when backfilling `glucose_input`
    pub glucose_input_window_minutes: i64,
    pub model_kind: ModelKind,
    /// Expected outlier fraction, shared by both model kinds
    pub contamination: f64,
    /// Keep only this many trailing days of the export
    pub days_to_process: Option<u32>,
    pub n_neighbors: usize,
    pub neighbor_aggregation: NeighborAggregation,
    pub n_estimators: usize,
    pub max_samples: usize,
    /// Seed for the isolation forest
    pub seed: u64,
    /// Percentile of the reference glucose distribution for the bolus post-filter
    pub low_glucose_percentile: f64,
    /// Lower clamp (mmol/L) of the post-filter threshold
    pub low_glucose_floor: f64,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            alphabet_size: 7,
            sax_window_minutes: 10,
            sax_resolutions: vec![10, 30, 60, 180],
            consideration_window_minutes: 180,
            glucose_cadence_minutes: 5,
            glucose_input_window_minutes: 5,
            model_kind: ModelKind::NeighborDistance,
            contamination: 0.05,
            days_to_process: None,
            n_neighbors: 5,
            neighbor_aggregation: NeighborAggregation::Largest,
            n_estimators: 100,
            max_samples: 256,
            seed: 42,
            low_glucose_percentile: 25.0,
            low_glucose_floor: 3.9,
        }
    }
}

impl PipelineConfig {
    /// Load configuration from JSON; absent keys take their defaults
    pub fn from_json(json: &str) -> Result<Self, ComputeError> {
        let config: PipelineConfig = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a JSON file
    pub fn from_path(path: &Path) -> Result<Self, ComputeError> {
        let json = std::fs::read_to_string(path)?;
        Self::from_json(&json)
    }

    pub fn to_json(&self) -> Result<String, ComputeError> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    /// Check every parameter; the first violation is returned
    pub fn validate(&self) -> Result<(), ComputeError> {
        if self.alphabet_size < 2 || self.alphabet_size > MAX_ALPHABET_SIZE {
            return Err(ComputeError::Configuration(format!(
                "alphabet_size must be between 2 and {MAX_ALPHABET_SIZE}, got {}",
                self.alphabet_size
            )));
        }
        if self.glucose_cadence_minutes <= 0 {
            return Err(ComputeError::Configuration(format!(
                "glucose_cadence_minutes must be positive, got {}",
                self.glucose_cadence_minutes
            )));
        }
        if self.sax_window_minutes <= 0 {
            return Err(ComputeError::Configuration(format!(
                "sax_window_minutes must be positive, got {}",
                self.sax_window_minutes
            )));
        }
        if let Some(bad) = self.sax_resolutions.iter().find(|w| **w <= 0) {
            return Err(ComputeError::Configuration(format!(
                "sax_resolutions must be positive, got {bad}"
            )));
        }
        if self.consideration_window_minutes < self.glucose_cadence_minutes {
            return Err(ComputeError::Configuration(format!(
                "consideration_window_minutes ({}) must be at least the glucose cadence ({})",
                self.consideration_window_minutes, self.glucose_cadence_minutes
            )));
        }
        if self.glucose_input_window_minutes <= 0 {
            return Err(ComputeError::Configuration(format!(
                "glucose_input_window_minutes must be positive, got {}",
                self.glucose_input_window_minutes
            )));
        }
        if !(self.contamination > 0.0 && self.contamination <= 0.5) {
            return Err(ComputeError::Configuration(format!(
                "contamination must be in (0, 0.5], got {}",
                self.contamination
            )));
        }
        if self.days_to_process == Some(0) {
            return Err(ComputeError::Configuration(
                "days_to_process must be positive when set".to_string(),
            ));
        }
        if self.n_neighbors == 0 {
            return Err(ComputeError::Configuration(
                "n_neighbors must be positive".to_string(),
            ));
        }
        if self.n_estimators == 0 || self.max_samples < 2 {
            return Err(ComputeError::Configuration(format!(
                "isolation forest needs n_estimators >= 1 and max_samples >= 2, got {} and {}",
                self.n_estimators, self.max_samples
            )));
        }
        if !(0.0..=100.0).contains(&self.low_glucose_percentile) {
            return Err(ComputeError::Configuration(format!(
                "low_glucose_percentile must be in [0, 100], got {}",
                self.low_glucose_percentile
            )));
        }
        Ok(())
    }

    /// Symbols for the configured alphabet plus the reserved missing symbol
    pub fn alphabet(&self) -> (Vec<char>, char) {
        sax_alphabet(self.alphabet_size)
    }
}

/// First `size` letters of the SAX alphabet and the letter after them
pub fn sax_alphabet(size: usize) -> (Vec<char>, char) {
    let letters: Vec<char> = SAX_ALPHABET.chars().collect();
    let size = size.min(MAX_ALPHABET_SIZE);
    (letters[..size].to_vec(), letters[size])
}

//! Pipeline orchestration
//!
//! This module provides the public API for Glyco Flux.
//! It runs the stages of one export in dependency order:
//! 1. RawEventAdapter - Parse the export, restrict to trailing days
//! 2. GlucoseNormalizer - Fixed-cadence glucose series
//! 3. SaxDiscretizer - SAX tables at every resolution
//! 4. DoseFeatureExtractor - Per-dose feature table
//! 5. AnomalyScorer - Bolus and temp-basal reviews

use crate::cache::{cached, StageCache, StageKey};
use crate::config::PipelineConfig;
use crate::error::ComputeError;
use crate::features::{DoseFeatureExtractor, ExtractionParams};
use crate::normalizer::GlucoseNormalizer;
use crate::sax::SaxDiscretizer;
use crate::schema::RawEventAdapter;
use crate::scoring::{
    AnomalyScorer, LowGlucoseFilter, ScoreSummary, ScoredDose, ScorerParams, VerdictTable,
};
use crate::types::{
    DoseFeatureRow, DoseKind, FeatureColumn, FeatureTable, GlucoseSeries, ModelKind, SaxTable,
};
use crate::GLYCO_FLUX_VERSION;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Instant;
use tracing::{info, info_span, warn};
use uuid::Uuid;

/// Standard review of a subset of the feature table
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Review {
    /// Every bolus, scored on the bolus calculator inputs
    Bolus,
    /// Temporary basals, scored on their settings and surrounding glucose
    TempBasal,
}

impl Review {
    pub const ALL: [Review; 2] = [Review::Bolus, Review::TempBasal];

    pub fn as_str(&self) -> &'static str {
        match self {
            Review::Bolus => "bolus",
            Review::TempBasal => "temp_basal",
        }
    }

    pub fn columns(&self) -> &'static [FeatureColumn] {
        match self {
            Review::Bolus => &FeatureColumn::BOLUS,
            Review::TempBasal => &FeatureColumn::TEMP_BASAL,
        }
    }

    /// Rows of the feature table this review scores
    pub fn select(&self, rows: &[DoseFeatureRow]) -> Vec<DoseFeatureRow> {
        rows.iter()
            .filter(|r| match self {
                Review::Bolus => r.kind == DoseKind::Bolus,
                Review::TempBasal => r.is_temp_basal(),
            })
            .cloned()
            .collect()
    }
}

/// Result of one review
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReviewOutcome {
    pub review: Review,
    pub verdicts: VerdictTable,
    /// Abnormal rows reported for manual review, most anomalous first
    pub flagged: Vec<ScoredDose>,
    /// Post-filter threshold (mmol/L); bolus review only
    pub low_glucose_threshold: Option<f64>,
}

/// Per-review entry of the run summary
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReviewSummary {
    pub review: Review,
    pub model_kind: ModelKind,
    pub scores: ScoreSummary,
    pub flagged: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub low_glucose_threshold: Option<f64>,
}

/// Run-level metadata written next to the output tables
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunSummary {
    pub run_id: Uuid,
    pub identifier: String,
    pub version: String,
    pub computed_at: DateTime<Utc>,
    pub events: usize,
    pub dropped_rows: usize,
    pub glucose_slots: usize,
    pub glucose_coverage: f64,
    pub dose_rows: usize,
    pub reviews: Vec<ReviewSummary>,
    pub skipped_reviews: Vec<Review>,
    pub config: PipelineConfig,
}

/// Everything one run produces
#[derive(Debug, Clone)]
pub struct PipelineOutput {
    pub series: GlucoseSeries,
    pub sax_tables: Vec<SaxTable>,
    pub features: FeatureTable,
    pub reviews: Vec<ReviewOutcome>,
    pub summary: RunSummary,
}

impl PipelineOutput {
    pub fn review(&self, review: Review) -> Option<&ReviewOutcome> {
        self.reviews.iter().find(|r| r.review == review)
    }
}

/// Pipeline for processing one export at a time
///
/// Holds no per-run state, so one pipeline may serve many files.
pub struct Pipeline {
    config: PipelineConfig,
    cache: Option<StageCache>,
}

impl Pipeline {
    /// Create a pipeline; the configuration is validated up front
    pub fn new(config: PipelineConfig) -> Result<Self, ComputeError> {
        config.validate()?;
        Ok(Self {
            config,
            cache: None,
        })
    }

    /// Reuse stage outputs stored in `cache`
    pub fn with_cache(mut self, cache: StageCache) -> Self {
        self.cache = Some(cache);
        self
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    /// Run on a CSV export file, identified by its file stem
    pub fn run_path(&self, path: &Path) -> Result<PipelineOutput, ComputeError> {
        let bytes = std::fs::read(path)?;
        self.run_bytes(&file_identifier(path), &bytes)
    }

    /// Run on the raw bytes of a CSV export
    pub fn run_bytes(&self, identifier: &str, bytes: &[u8]) -> Result<PipelineOutput, ComputeError> {
        let span = info_span!("pipeline", identifier);
        let _guard = span.enter();
        let started = Instant::now();
        let config = &self.config;
        let cache = self.cache.as_ref();

        // Stage 1: Parse and restrict
        let root = StageKey::root(bytes, config.days_to_process);
        let mut export = RawEventAdapter::read_csv(bytes)?;
        if let Some(days) = config.days_to_process {
            export = RawEventAdapter::restrict_to_trailing_days(export, days);
        }

        // Stage 2: Normalize glucose
        let glucose_key = root.child("glucose", &config.glucose_cadence_minutes)?;
        let series = cached(cache, "glucose", &glucose_key, || {
            GlucoseNormalizer::normalize(&export, config.glucose_cadence_minutes)
        })?;

        // Stage 3: SAX tables; the annotation window always gets one
        let mut windows = config.sax_resolutions.clone();
        if !windows.contains(&config.sax_window_minutes) {
            windows.push(config.sax_window_minutes);
        }
        let sax_key = glucose_key.child("sax", &(config.alphabet_size, &windows))?;
        let sax_tables: Vec<SaxTable> = cached(cache, "sax", &sax_key, || {
            SaxDiscretizer::discretize_many(&series, config.alphabet_size, &windows)
        })?;
        let annotation = sax_tables
            .iter()
            .find(|t| t.window_minutes == config.sax_window_minutes)
            .ok_or_else(|| {
                ComputeError::Configuration(format!(
                    "no SAX table at {} minutes",
                    config.sax_window_minutes
                ))
            })?;

        // Stage 4: Dose features
        let params = ExtractionParams::from(config);
        let features_key = sax_key.child("features", &params)?;
        let features = cached(cache, "features", &features_key, || {
            DoseFeatureExtractor::extract(&export, &series, annotation, &params)
        })?;

        // Stage 5: Reviews
        let scorer = AnomalyScorer::new(ScorerParams::from(config));
        let mut reviews = Vec::new();
        let mut skipped_reviews = Vec::new();
        for review in Review::ALL {
            match self.run_review(review, &scorer, &features, &series, &features_key)? {
                Some(outcome) => reviews.push(outcome),
                None => skipped_reviews.push(review),
            }
        }

        let summary = RunSummary {
            run_id: Uuid::new_v4(),
            identifier: identifier.to_string(),
            version: GLYCO_FLUX_VERSION.to_string(),
            computed_at: Utc::now(),
            events: export.events.len(),
            dropped_rows: export.dropped_rows,
            glucose_slots: series.len(),
            glucose_coverage: series.coverage(),
            dose_rows: features.rows.len(),
            reviews: reviews
                .iter()
                .map(|r| ReviewSummary {
                    review: r.review,
                    model_kind: r.verdicts.model_kind,
                    scores: r.verdicts.summary.clone(),
                    flagged: r.flagged.len(),
                    low_glucose_threshold: r.low_glucose_threshold,
                })
                .collect(),
            skipped_reviews,
            config: config.clone(),
        };

        info!(
            run_id = %summary.run_id,
            dose_rows = summary.dose_rows,
            reviews = summary.reviews.len(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Pipeline complete"
        );

        Ok(PipelineOutput {
            series,
            sax_tables,
            features,
            reviews,
            summary,
        })
    }

    fn run_review(
        &self,
        review: Review,
        scorer: &AnomalyScorer,
        features: &FeatureTable,
        series: &GlucoseSeries,
        features_key: &StageKey,
    ) -> Result<Option<ReviewOutcome>, ComputeError> {
        let rows = review.select(&features.rows);
        if rows.is_empty() {
            warn!(review = review.as_str(), "No rows for review; skipped");
            return Ok(None);
        }
        let complete = rows
            .iter()
            .filter(|row| review.columns().iter().all(|c| c.value(row).is_some()))
            .count();
        if complete == 0 {
            warn!(
                review = review.as_str(),
                rows = rows.len(),
                "No rows with complete feature values; review skipped"
            );
            return Ok(None);
        }

        let stage = format!("scoring-{}", review.as_str());
        let key = features_key.child(&stage, &(scorer.params(), review.columns()))?;
        let verdicts = cached(self.cache.as_ref(), &stage, &key, || {
            scorer
                .score(&rows, review.columns())
                .map(|(verdicts, _model)| verdicts)
        })?;

        Ok(Some(finish_review(review, verdicts, series, &self.config)))
    }
}

/// Run identifier of an export file: its stem
pub fn file_identifier(path: &Path) -> String {
    path.file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| "export".to_string())
}

fn finish_review(
    review: Review,
    verdicts: VerdictTable,
    series: &GlucoseSeries,
    config: &PipelineConfig,
) -> ReviewOutcome {
    let (flagged, low_glucose_threshold) = match review {
        Review::Bolus => {
            let filter = LowGlucoseFilter::from(config);
            let threshold = filter.threshold(series);
            (filter.apply(&verdicts, threshold), Some(threshold))
        }
        Review::TempBasal => (
            verdicts.ranked_abnormal().into_iter().cloned().collect(),
            None,
        ),
    };
    ReviewOutcome {
        review,
        verdicts,
        flagged,
        low_glucose_threshold,
    }
}

#[cfg(test)]
pub(crate) mod fixtures {
    use chrono::{Duration, TimeZone, Utc};
    use std::fmt::Write;

    pub const HEADER: &str = "type,time,value,subType,deliveryType,normal,extended,rate,insulinCarbRatio,carbInput,bgInput,insulinSensitivity,duration,percent";

    /// Three days of 5-minute CGM with no readings from day 1 12:05 to
    /// 14:00, and five boluses of which the last has no carbs and a far-off
    /// glucose entry
    pub fn three_day_export() -> String {
        let day0 = Utc.with_ymd_and_hms(2024, 3, 1, 0, 0, 0).unwrap();
        let gap_start = day0 + Duration::minutes(24 * 60 + 12 * 60 + 5);
        let gap_end = day0 + Duration::minutes(24 * 60 + 14 * 60);

        let mut csv = String::from(HEADER);
        csv.push('\n');
        for i in 0..(3 * 288) {
            let t = day0 + Duration::minutes(5 * i);
            if t >= gap_start && t <= gap_end {
                continue;
            }
            let value = 5.5 + (i % 24) as f64 * 0.1;
            writeln!(csv, "cbg,{},{value:.1},,,,,,,,,,,", t.format("%Y-%m-%dT%H:%M:%SZ")).unwrap();
        }

        let boluses = [
            (8 * 60, "5.0,,,10,50,6.0,2"),
            (13 * 60, "5.5,,,,55,6.5,"),
            (24 * 60 + 8 * 60, "4.5,,,,45,5.8,"),
            (24 * 60 + 12 * 60, "4.8,,,,48,6.2,"),
            (48 * 60 + 9 * 60, "4.0,,,,0,22.0,"),
        ];
        for (minutes, fields) in boluses {
            let t = day0 + Duration::minutes(minutes);
            writeln!(
                csv,
                "bolus,{},,normal,,{fields},,",
                t.format("%Y-%m-%dT%H:%M:%SZ")
            )
            .unwrap();
        }
        csv
    }

    /// Temp basal rows to append to [`three_day_export`]
    pub fn temp_basals() -> String {
        let day0 = Utc.with_ymd_and_hms(2024, 3, 1, 0, 0, 0).unwrap();
        let mut csv = String::new();
        let rows = [
            (3 * 60, "0.4", "1800000", "0.5"),
            (27 * 60, "0.5", "1800000", "0.6"),
            (30 * 60, "0.45", "3600000", "0.55"),
            (50 * 60, "0.5", "1800000", "0.6"),
        ];
        for (minutes, rate, duration, percent) in rows {
            let t = day0 + Duration::minutes(minutes);
            writeln!(
                csv,
                "basal,{},,,temp,,,{rate},,,,,{duration},{percent}",
                t.format("%Y-%m-%dT%H:%M:%SZ")
            )
            .unwrap();
        }
        csv
    }
}

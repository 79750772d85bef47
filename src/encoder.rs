//! Output table encoding
//!
//! This module writes the tables of one pipeline run as CSV files plus a
//! JSON run summary, all under `<out_dir>/<identifier>/`.

use crate::error::ComputeError;
use crate::pipeline::{PipelineOutput, Review, ReviewOutcome, RunSummary};
use crate::scoring::Verdict;
use crate::types::{DoseFeatureRow, GlucoseSeries, SaxTable};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::info;

const FEATURE_HEADER: [&str; 27] = [
    "type",
    "time",
    "jsonRowIndex",
    "subType",
    "deliveryType",
    "normal",
    "extended",
    "rate",
    "carbInput",
    "insulinCarbRatio",
    "insulinSensitivity",
    "insulinOnBoard",
    "duration",
    "percent",
    "totalBolusAmount",
    "TDD",
    "bgInput",
    "bgInputSource",
    "glucose_before",
    "glucose_after",
    "duration_gaps_before",
    "duration_gaps_after",
    "bg_30_min_before",
    "bg_75_min_after",
    "sax_string_before",
    "sax_string_after",
    "consideration_window",
];

const VERDICT_HEADER: [&str; 4] = ["abnormal", "label", "abnormality_score", "distance_score"];

/// Encoder for writing run outputs to disk
pub struct TableEncoder {
    out_dir: PathBuf,
}

impl TableEncoder {
    pub fn new(out_dir: impl Into<PathBuf>) -> Self {
        Self {
            out_dir: out_dir.into(),
        }
    }

    /// Directory the tables of `identifier` are written to
    pub fn run_dir(&self, identifier: &str) -> PathBuf {
        self.out_dir.join(identifier)
    }

    /// Write every table of `output`; returns the written paths
    pub fn write(&self, output: &PipelineOutput) -> Result<Vec<PathBuf>, ComputeError> {
        let dir = self.run_dir(&output.summary.identifier);
        fs::create_dir_all(&dir)?;
        let mut written = Vec::new();

        let path = dir.join("glucose.csv");
        write_glucose(&path, &output.series)?;
        written.push(path);

        for table in &output.sax_tables {
            let path = dir.join(format!("sax_{}min.csv", table.window_minutes));
            write_sax(&path, table)?;
            written.push(path);
        }

        let path = dir.join("features.csv");
        let window = output.features.consideration_window_minutes;
        let rows = output.features.rows.iter().map(|r| (r, None));
        write_rows(&path, rows, window, false)?;
        written.push(path);

        for outcome in &output.reviews {
            let name = match outcome.review {
                Review::Bolus => "abnormal_boluses.csv",
                Review::TempBasal => "abnormal_basals.csv",
            };
            let path = dir.join(name);
            write_review(&path, outcome, window)?;
            written.push(path);
        }

        let path = dir.join("summary.json");
        fs::write(&path, encode_summary(&output.summary)?)?;
        written.push(path);

        info!(dir = %dir.display(), files = written.len(), "Tables written");
        Ok(written)
    }
}

/// Pretty JSON of a run summary
pub fn encode_summary(summary: &RunSummary) -> Result<String, ComputeError> {
    Ok(serde_json::to_string_pretty(summary)?)
}

fn write_glucose(path: &Path, series: &GlucoseSeries) -> Result<(), ComputeError> {
    let mut wtr = csv::Writer::from_path(path)?;
    wtr.write_record(["time", "value", "log_value"])?;
    for p in &series.points {
        wtr.write_record([
            p.timestamp.to_rfc3339(),
            p.value.to_string(),
            opt(p.log_value),
        ])?;
    }
    wtr.flush()?;
    Ok(())
}

fn write_sax(path: &Path, table: &SaxTable) -> Result<(), ComputeError> {
    let mut wtr = csv::Writer::from_path(path)?;
    wtr.write_record(["window_start", "mean_z", "symbol"])?;
    for row in &table.rows {
        wtr.write_record([
            row.window_start.to_rfc3339(),
            opt(row.mean_z),
            row.symbol.to_string(),
        ])?;
    }
    wtr.flush()?;
    Ok(())
}

fn write_review(path: &Path, outcome: &ReviewOutcome, window: i64) -> Result<(), ComputeError> {
    let rows = outcome.flagged.iter().map(|s| (&s.row, Some(&s.verdict)));
    write_rows(path, rows, window, true)
}

fn write_rows<'a, I>(
    path: &Path,
    rows: I,
    window: i64,
    with_verdicts: bool,
) -> Result<(), ComputeError>
where
    I: Iterator<Item = (&'a DoseFeatureRow, Option<&'a Verdict>)>,
{
    let mut wtr = csv::Writer::from_path(path)?;
    let mut header: Vec<&str> = FEATURE_HEADER.to_vec();
    if with_verdicts {
        header.extend(VERDICT_HEADER);
    }
    wtr.write_record(&header)?;

    for (row, verdict) in rows {
        let mut record = feature_record(row, window);
        if let Some(v) = verdict {
            record.push(v.abnormal.to_string());
            record.push(v.label.to_string());
            record.push(opt(v.abnormality_score));
            record.push(opt(v.distance_score));
        }
        wtr.write_record(&record)?;
    }
    wtr.flush()?;
    Ok(())
}

fn feature_record(row: &DoseFeatureRow, window: i64) -> Vec<String> {
    vec![
        row.kind.as_str().to_string(),
        row.timestamp.to_rfc3339(),
        row.row_index.map(|i| i.to_string()).unwrap_or_default(),
        row.sub_type.clone().unwrap_or_default(),
        row.delivery_type
            .as_ref()
            .map(|d| d.as_str().to_string())
            .unwrap_or_default(),
        row.normal.to_string(),
        row.extended.to_string(),
        row.rate.to_string(),
        row.carb_input.to_string(),
        opt(row.insulin_carb_ratio),
        opt(row.insulin_sensitivity),
        opt(row.insulin_on_board),
        opt(row.duration),
        opt(row.percent),
        row.total_bolus_amount.to_string(),
        row.tdd.to_string(),
        row.glucose_input.to_string(),
        row.glucose_input_source.as_str().to_string(),
        list(&row.glucose_before),
        list(&row.glucose_after),
        row.gap_duration_before.to_string(),
        row.gap_duration_after.to_string(),
        opt(row.glucose_30min_before),
        opt(row.glucose_75min_after),
        row.sax_string_before.clone(),
        row.sax_string_after.clone(),
        window.to_string(),
    ]
}

fn opt(v: Option<f64>) -> String {
    v.map(|x| x.to_string()).unwrap_or_default()
}

/// `[a, b, c]`, the list layout of the feature export
pub fn list(values: &[f64]) -> String {
    let items: Vec<String> = values.iter().map(|v| v.to_string()).collect();
    format!("[{}]", items.join(", "))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PipelineConfig;
    use crate::pipeline::fixtures::{temp_basals, three_day_export};
    use crate::pipeline::Pipeline;
    use tempfile::TempDir;

    fn run(input: &str) -> PipelineOutput {
        Pipeline::new(PipelineConfig::default())
            .unwrap()
            .run_bytes("patient-01", input.as_bytes())
            .unwrap()
    }

    #[test]
    fn test_list_layout() {
        assert_eq!(list(&[5.5, -1.0, 6.25]), "[5.5, -1, 6.25]");
        assert_eq!(list(&[]), "[]");
    }

    #[test]
    fn test_write_all_tables() {
        let dir = TempDir::new().unwrap();
        let output = run(&(three_day_export() + &temp_basals()));
        let written = TableEncoder::new(dir.path()).write(&output).unwrap();

        let run_dir = dir.path().join("patient-01");
        let mut names: Vec<String> = written
            .iter()
            .map(|p| p.file_name().unwrap().to_string_lossy().into_owned())
            .collect();
        names.sort();
        assert_eq!(
            names,
            vec![
                "abnormal_basals.csv",
                "abnormal_boluses.csv",
                "features.csv",
                "glucose.csv",
                "sax_10min.csv",
                "sax_180min.csv",
                "sax_30min.csv",
                "sax_60min.csv",
                "summary.json",
            ]
        );

        let mut rdr = csv::Reader::from_path(run_dir.join("features.csv")).unwrap();
        assert_eq!(rdr.headers().unwrap().len(), FEATURE_HEADER.len());
        assert_eq!(rdr.records().count(), output.features.rows.len());

        let mut rdr = csv::Reader::from_path(run_dir.join("glucose.csv")).unwrap();
        assert_eq!(rdr.records().count(), output.series.len());

        let summary: RunSummary =
            serde_json::from_str(&fs::read_to_string(run_dir.join("summary.json")).unwrap())
                .unwrap();
        assert_eq!(summary.run_id, output.summary.run_id);
    }

    #[test]
    fn test_basal_table_absent_when_review_skipped() {
        let dir = TempDir::new().unwrap();
        let output = run(&three_day_export());
        TableEncoder::new(dir.path()).write(&output).unwrap();
        let run_dir = dir.path().join("patient-01");
        assert!(run_dir.join("abnormal_boluses.csv").exists());
        assert!(!run_dir.join("abnormal_basals.csv").exists());
    }
}

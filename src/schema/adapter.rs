//! Adapter for turning a device export into typed events
//!
//! Reads delimited text, checks the declared columns, converts rows to
//! [`Event`]s, and applies the optional trailing-days restriction.

use crate::error::ComputeError;
use crate::schema::raw_event::*;
use crate::types::Event;
use chrono::Duration;
use serde::Serialize;
use std::collections::BTreeSet;
use std::io::Read;
use std::path::Path;
use tracing::{debug, info, warn};

/// Typed contents of one device export
#[derive(Debug, Clone, PartialEq)]
pub struct RawExport {
    /// Header columns present in the source file
    pub columns: BTreeSet<String>,
    /// Glucose and dose events, ascending by timestamp
    pub events: Vec<Event>,
    /// Rows dropped because their timestamp could not be parsed
    pub dropped_rows: usize,
    /// Rows of kinds the pipeline does not use
    pub ignored_rows: usize,
}

impl RawExport {
    /// Build an export directly from events, declaring every known column
    pub fn from_events(mut events: Vec<Event>) -> Self {
        events.sort_by_key(|e| e.timestamp);
        let columns = REQUIRED_COLUMNS
            .iter()
            .chain(GLUCOSE_COLUMNS.iter())
            .chain(DOSE_COLUMNS.iter())
            .chain(OPTIONAL_DOSE_COLUMNS.iter())
            .map(|c| c.to_string())
            .collect();
        Self {
            columns,
            events,
            dropped_rows: 0,
            ignored_rows: 0,
        }
    }

    pub fn has_column(&self, column: &str) -> bool {
        self.columns.contains(column)
    }

    /// Columns of `required` that the source file lacks
    pub fn missing_columns(&self, required: &[&str]) -> Vec<String> {
        required
            .iter()
            .filter(|c| !self.has_column(c))
            .map(|c| c.to_string())
            .collect()
    }

    /// Fail with a data format error naming the stage if any column is absent
    pub fn require_columns(&self, required: &[&str], stage: &str) -> Result<(), ComputeError> {
        let missing = self.missing_columns(required);
        if missing.is_empty() {
            Ok(())
        } else {
            Err(ComputeError::DataFormat(format!(
                "{stage} requires missing column(s): {}",
                missing.join(", ")
            )))
        }
    }
}

/// Column and row check of an export
#[derive(Debug, Clone, Serialize)]
pub struct ValidationReport {
    pub events: usize,
    pub glucose_events: usize,
    pub dose_events: usize,
    pub dropped_rows: usize,
    pub ignored_rows: usize,
    pub missing_glucose_columns: Vec<String>,
    pub missing_dose_columns: Vec<String>,
    pub missing_optional_columns: Vec<String>,
}

impl ValidationReport {
    /// True when every stage has the columns it needs
    pub fn is_usable(&self) -> bool {
        self.missing_glucose_columns.is_empty() && self.missing_dose_columns.is_empty()
    }
}

/// Adapter for converting device exports to events
pub struct RawEventAdapter;

impl RawEventAdapter {
    /// Read an export from a CSV file
    pub fn read_path(path: &Path) -> Result<RawExport, ComputeError> {
        let file = std::fs::File::open(path)?;
        let export = Self::read_csv(file)?;
        info!(
            path = %path.display(),
            events = export.events.len(),
            dropped = export.dropped_rows,
            "Export loaded"
        );
        Ok(export)
    }

    /// Read an export from any CSV source
    pub fn read_csv<R: Read>(reader: R) -> Result<RawExport, ComputeError> {
        let mut rdr = csv::ReaderBuilder::new()
            .flexible(true)
            .trim(csv::Trim::All)
            .from_reader(reader);

        let columns: BTreeSet<String> = rdr.headers()?.iter().map(|h| h.to_string()).collect();
        let missing: Vec<&str> = REQUIRED_COLUMNS
            .iter()
            .copied()
            .filter(|c| !columns.contains(*c))
            .collect();
        if !missing.is_empty() {
            return Err(ComputeError::DataFormat(format!(
                "input is missing required column(s): {}",
                missing.join(", ")
            )));
        }

        let mut events = Vec::new();
        let mut dropped_rows = 0;
        let mut ignored_rows = 0;

        for (line, record) in rdr.deserialize::<RawRow>().enumerate() {
            let row = record?;
            match row.into_event() {
                Ok(event) => events.push(event),
                Err(RowRejection::IgnoredKind) => ignored_rows += 1,
                Err(RowRejection::BadTimestamp) => {
                    debug!(line = line + 2, "Dropping row with unparsable timestamp");
                    dropped_rows += 1;
                }
            }
        }

        if dropped_rows > 0 {
            warn!(dropped_rows, "Rows with unparsable timestamps were dropped");
        }

        events.sort_by_key(|e| e.timestamp);

        Ok(RawExport {
            columns,
            events,
            dropped_rows,
            ignored_rows,
        })
    }

    /// Keep only the trailing `days` of the export
    ///
    /// The window is anchored on the latest event: `(last - days, last]`.
    pub fn restrict_to_trailing_days(export: RawExport, days: u32) -> RawExport {
        let Some(last) = export.events.last().map(|e| e.timestamp) else {
            return export;
        };
        let first = last - Duration::days(i64::from(days));
        let before = export.events.len();

        let events: Vec<Event> = export
            .events
            .into_iter()
            .filter(|e| e.timestamp > first && e.timestamp <= last)
            .collect();

        debug!(days, kept = events.len(), removed = before - events.len(), "Restricted export");

        RawExport { events, ..export }
    }

    /// Report which stages the export can feed
    pub fn validate(export: &RawExport) -> ValidationReport {
        let glucose_events = export
            .events
            .iter()
            .filter(|e| e.kind == crate::types::EventKind::Glucose)
            .count();
        let dose_events = export.events.iter().filter(|e| e.is_dose()).count();

        ValidationReport {
            events: export.events.len(),
            glucose_events,
            dose_events,
            dropped_rows: export.dropped_rows,
            ignored_rows: export.ignored_rows,
            missing_glucose_columns: export.missing_columns(&GLUCOSE_COLUMNS),
            missing_dose_columns: export.missing_columns(&DOSE_COLUMNS),
            missing_optional_columns: export.missing_columns(&OPTIONAL_DOSE_COLUMNS),
        }
    }
}

//! Core types for the Glyco Flux pipeline
//!
//! This module defines the tables that flow through each stage of the
//! pipeline: raw events, the normalized glucose series, SAX annotations,
//! dose feature rows, and the model selection shared by configuration and
//! scoring.

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::window::Timestamped;

/// Sentinel stored in glucose slots that have no reading
pub const MISSING_GLUCOSE: f64 = -1.0;

/// Kind of a raw device record
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    /// Continuous glucose monitor reading (`cbg`)
    Glucose,
    /// Insulin bolus dose (`bolus`)
    Bolus,
    /// Basal rate record (`basal`), scheduled or temporary
    Basal,
    /// Anything else in the export; ignored by the pipeline
    Other,
}

impl EventKind {
    /// Map the export's `type` column to an event kind
    pub fn from_raw(raw: &str) -> Self {
        match raw.trim() {
            "cbg" => EventKind::Glucose,
            "bolus" => EventKind::Bolus,
            "basal" => EventKind::Basal,
            _ => EventKind::Other,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::Glucose => "cbg",
            EventKind::Bolus => "bolus",
            EventKind::Basal => "basal",
            EventKind::Other => "other",
        }
    }
}

/// Basal delivery type (`deliveryType` column)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryType {
    /// Programmed basal schedule
    Scheduled,
    /// Temporary basal override
    Temp,
    Suspend,
    Automated,
    /// For unrecognized delivery types
    #[serde(untagged)]
    Other(String),
}

impl DeliveryType {
    pub fn from_raw(raw: &str) -> Self {
        match raw.trim() {
            "scheduled" => DeliveryType::Scheduled,
            "temp" => DeliveryType::Temp,
            "suspend" => DeliveryType::Suspend,
            "automated" => DeliveryType::Automated,
            other => DeliveryType::Other(other.to_string()),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            DeliveryType::Scheduled => "scheduled",
            DeliveryType::Temp => "temp",
            DeliveryType::Suspend => "suspend",
            DeliveryType::Automated => "automated",
            DeliveryType::Other(name) => name.as_str(),
        }
    }
}

/// One row of the raw device export
///
/// Events are immutable once read; later stages derive new tables from them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub kind: EventKind,
    pub timestamp: DateTime<Utc>,
    /// Calendar day in the export's own UTC offset
    pub local_date: NaiveDate,
    /// Row index assigned by the exporter (`jsonRowIndex`)
    pub row_index: Option<i64>,
    /// Glucose reading (mmol/L)
    pub value: Option<f64>,
    /// Bolus subtype: normal, square, dual/square
    pub sub_type: Option<String>,
    pub delivery_type: Option<DeliveryType>,
    /// Units delivered by a normal bolus
    pub normal: Option<f64>,
    /// Units delivered by an extended bolus
    pub extended: Option<f64>,
    /// Absolute basal rate (U/h)
    pub rate: Option<f64>,
    pub insulin_carb_ratio: Option<f64>,
    /// Carbohydrates entered into the bolus calculator (g)
    pub carb_input: Option<f64>,
    pub insulin_on_board: Option<f64>,
    /// Glucose recorded by the device at dose time
    pub bg_input: Option<f64>,
    pub insulin_sensitivity: Option<f64>,
    /// Temp basal length (ms)
    pub duration: Option<f64>,
    /// Percent of the scheduled basal rate
    pub percent: Option<f64>,
}

impl Event {
    /// Bare event of the given kind with every optional field empty; the
    /// local day is the UTC day
    pub fn new(kind: EventKind, timestamp: DateTime<Utc>) -> Self {
        Self {
            kind,
            timestamp,
            local_date: timestamp.date_naive(),
            row_index: None,
            value: None,
            sub_type: None,
            delivery_type: None,
            normal: None,
            extended: None,
            rate: None,
            insulin_carb_ratio: None,
            carb_input: None,
            insulin_on_board: None,
            bg_input: None,
            insulin_sensitivity: None,
            duration: None,
            percent: None,
        }
    }

    pub fn is_dose(&self) -> bool {
        matches!(self.kind, EventKind::Bolus | EventKind::Basal)
    }
}

/// One slot of the fixed-cadence glucose grid
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GlucosePoint {
    pub timestamp: DateTime<Utc>,
    /// Reading in mmol/L, or [`MISSING_GLUCOSE`] when the slot is empty
    pub value: f64,
    /// log10 of the reading; undefined at sentinel slots
    pub log_value: Option<f64>,
}

impl GlucosePoint {
    pub fn is_missing(&self) -> bool {
        self.log_value.is_none()
    }
}

impl Timestamped for GlucosePoint {
    fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }
}

/// Normalized glucose series on a fixed cadence
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GlucoseSeries {
    pub cadence_minutes: i64,
    pub points: Vec<GlucosePoint>,
}

impl GlucoseSeries {
    pub fn len(&self) -> usize {
        self.points.len()
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    /// Values of slots that hold an actual reading
    pub fn real_values(&self) -> Vec<f64> {
        self.points
            .iter()
            .filter(|p| !p.is_missing())
            .map(|p| p.value)
            .collect()
    }

    /// Fraction of slots holding a reading (0-1)
    pub fn coverage(&self) -> f64 {
        if self.points.is_empty() {
            return 0.0;
        }
        self.points.iter().filter(|p| !p.is_missing()).count() as f64 / self.points.len() as f64
    }
}

/// One PAA window of a SAX annotation table
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SaxRow {
    pub window_start: DateTime<Utc>,
    /// Mean z-normalized log glucose over the window; undefined when empty
    pub mean_z: Option<f64>,
    pub symbol: char,
}

impl Timestamped for SaxRow {
    fn timestamp(&self) -> DateTime<Utc> {
        self.window_start
    }
}

/// SAX annotation table at one aggregation resolution
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SaxTable {
    pub window_minutes: i64,
    pub alphabet_size: usize,
    /// Interior breakpoints, ascending; the outer bins extend to ±∞
    pub breakpoints: Vec<f64>,
    /// Symbol used for windows with no data
    pub missing_symbol: char,
    pub rows: Vec<SaxRow>,
}

impl SaxTable {
    /// Full symbol sequence of the table
    pub fn word(&self) -> String {
        self.rows.iter().map(|r| r.symbol).collect()
    }
}

/// Dose kind carried by a feature row
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DoseKind {
    Bolus,
    Basal,
}

impl DoseKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            DoseKind::Bolus => "bolus",
            DoseKind::Basal => "basal",
        }
    }
}

/// Where a row's `glucose_input` came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GlucoseInputSource {
    /// Recorded by the pump at dose time
    Recorded,
    /// Nearest CGM reading around the dose
    Cgm,
    /// Mean of the recorded values across the dataset
    DatasetMean,
}

impl GlucoseInputSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            GlucoseInputSource::Recorded => "recorded",
            GlucoseInputSource::Cgm => "cgm",
            GlucoseInputSource::DatasetMean => "dataset_mean",
        }
    }
}

/// Per-dose feature row
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DoseFeatureRow {
    pub kind: DoseKind,
    pub timestamp: DateTime<Utc>,
    pub row_index: Option<i64>,
    pub sub_type: Option<String>,
    pub delivery_type: Option<DeliveryType>,
    pub normal: f64,
    pub extended: f64,
    pub rate: f64,
    pub carb_input: f64,
    pub insulin_carb_ratio: Option<f64>,
    pub insulin_sensitivity: Option<f64>,
    pub insulin_on_board: Option<f64>,
    pub duration: Option<f64>,
    pub percent: Option<f64>,
    pub total_bolus_amount: f64,
    /// Total daily dose for the row's calendar day
    pub tdd: f64,
    pub glucose_input: f64,
    pub glucose_input_source: GlucoseInputSource,
    pub glucose_before: Vec<f64>,
    pub glucose_after: Vec<f64>,
    pub gap_duration_before: f64,
    pub gap_duration_after: f64,
    pub glucose_30min_before: Option<f64>,
    pub glucose_75min_after: Option<f64>,
    pub sax_string_before: String,
    pub sax_string_after: String,
}

impl DoseFeatureRow {
    pub fn is_temp_basal(&self) -> bool {
        self.kind == DoseKind::Basal && self.delivery_type == Some(DeliveryType::Temp)
    }
}

/// Merged dose feature table
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeatureTable {
    pub consideration_window_minutes: i64,
    pub sax_window_minutes: i64,
    pub rows: Vec<DoseFeatureRow>,
}

/// Numeric column of the feature table usable as a model input
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FeatureColumn {
    TotalBolusAmount,
    CarbInput,
    InsulinCarbRatio,
    GlucoseInput,
    InsulinSensitivity,
    Tdd,
    Duration,
    Percent,
    Rate,
    Glucose30MinBefore,
    Glucose75MinAfter,
    GapDurationBefore,
    GapDurationAfter,
}

impl FeatureColumn {
    /// Columns used to review boluses
    pub const BOLUS: [FeatureColumn; 6] = [
        FeatureColumn::TotalBolusAmount,
        FeatureColumn::CarbInput,
        FeatureColumn::InsulinCarbRatio,
        FeatureColumn::GlucoseInput,
        FeatureColumn::InsulinSensitivity,
        FeatureColumn::Tdd,
    ];

    /// Columns used to review temporary basals
    pub const TEMP_BASAL: [FeatureColumn; 6] = [
        FeatureColumn::Duration,
        FeatureColumn::Percent,
        FeatureColumn::Rate,
        FeatureColumn::GlucoseInput,
        FeatureColumn::Glucose30MinBefore,
        FeatureColumn::Glucose75MinAfter,
    ];

    /// Value of this column for a row, if present
    pub fn value(&self, row: &DoseFeatureRow) -> Option<f64> {
        match self {
            FeatureColumn::TotalBolusAmount => Some(row.total_bolus_amount),
            FeatureColumn::CarbInput => Some(row.carb_input),
            FeatureColumn::InsulinCarbRatio => row.insulin_carb_ratio,
            FeatureColumn::GlucoseInput => Some(row.glucose_input),
            FeatureColumn::InsulinSensitivity => row.insulin_sensitivity,
            FeatureColumn::Tdd => Some(row.tdd),
            FeatureColumn::Duration => row.duration,
            FeatureColumn::Percent => row.percent,
            FeatureColumn::Rate => Some(row.rate),
            FeatureColumn::Glucose30MinBefore => row.glucose_30min_before,
            FeatureColumn::Glucose75MinAfter => row.glucose_75min_after,
            FeatureColumn::GapDurationBefore => Some(row.gap_duration_before),
            FeatureColumn::GapDurationAfter => Some(row.gap_duration_after),
        }
        .filter(|v| v.is_finite())
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            FeatureColumn::TotalBolusAmount => "total_bolus_amount",
            FeatureColumn::CarbInput => "carb_input",
            FeatureColumn::InsulinCarbRatio => "insulin_carb_ratio",
            FeatureColumn::GlucoseInput => "glucose_input",
            FeatureColumn::InsulinSensitivity => "insulin_sensitivity",
            FeatureColumn::Tdd => "tdd",
            FeatureColumn::Duration => "duration",
            FeatureColumn::Percent => "percent",
            FeatureColumn::Rate => "rate",
            FeatureColumn::Glucose30MinBefore => "glucose_30min_before",
            FeatureColumn::Glucose75MinAfter => "glucose_75min_after",
            FeatureColumn::GapDurationBefore => "gap_duration_before",
            FeatureColumn::GapDurationAfter => "gap_duration_after",
        }
    }
}

impl fmt::Display for FeatureColumn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for FeatureColumn {
    type Err = String;

    /// Accepts the snake_case names and the export's camelCase names
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "total_bolus_amount" | "totalBolusAmount" => Ok(FeatureColumn::TotalBolusAmount),
            "carb_input" | "carbInput" => Ok(FeatureColumn::CarbInput),
            "insulin_carb_ratio" | "insulinCarbRatio" => Ok(FeatureColumn::InsulinCarbRatio),
            "glucose_input" | "bgInput" => Ok(FeatureColumn::GlucoseInput),
            "insulin_sensitivity" | "insulinSensitivity" => Ok(FeatureColumn::InsulinSensitivity),
            "tdd" | "TDD" => Ok(FeatureColumn::Tdd),
            "duration" => Ok(FeatureColumn::Duration),
            "percent" => Ok(FeatureColumn::Percent),
            "rate" => Ok(FeatureColumn::Rate),
            "glucose_30min_before" | "bg_30_min_before" => Ok(FeatureColumn::Glucose30MinBefore),
            "glucose_75min_after" | "bg_75_min_after" => Ok(FeatureColumn::Glucose75MinAfter),
            "gap_duration_before" | "duration_gaps_before" => Ok(FeatureColumn::GapDurationBefore),
            "gap_duration_after" | "duration_gaps_after" => Ok(FeatureColumn::GapDurationAfter),
            other => Err(format!("unknown feature column: {other}")),
        }
    }
}

/// Outlier model family
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ModelKind {
    /// k-nearest-neighbor distance; native labels normal 0 / abnormal 1
    NeighborDistance,
    /// Isolation forest; native labels normal 1 / abnormal -1
    IsolationBased,
}

impl ModelKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ModelKind::NeighborDistance => "neighbor-distance",
            ModelKind::IsolationBased => "isolation-based",
        }
    }

    /// Native label the model assigns to inliers
    pub fn normal_label(&self) -> i8 {
        match self {
            ModelKind::NeighborDistance => 0,
            ModelKind::IsolationBased => 1,
        }
    }

    /// Native label the model assigns to outliers
    pub fn abnormal_label(&self) -> i8 {
        match self {
            ModelKind::NeighborDistance => 1,
            ModelKind::IsolationBased => -1,
        }
    }
}

impl Default for ModelKind {
    fn default() -> Self {
        ModelKind::NeighborDistance
    }
}

impl fmt::Display for ModelKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ModelKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "neighbor-distance" | "knn" => Ok(ModelKind::NeighborDistance),
            "isolation-based" | "isolation_forest" => Ok(ModelKind::IsolationBased),
            other => Err(format!("unknown model kind: {other}")),
        }
    }
}

//! Device export row schema
//!
//! A fixed, typed view of one row of a diabetes device export (Tidepool-style
//! CSV). Every kind-specific column is optional at the row level; which
//! columns must exist in the file is declared per stage below.

use chrono::{DateTime, FixedOffset, NaiveDate, NaiveDateTime, Utc};
use serde::Deserialize;

use crate::types::{DeliveryType, Event, EventKind};

/// Columns every export must carry
pub const REQUIRED_COLUMNS: [&str; 2] = ["type", "time"];

/// Columns the glucose normalizer needs
pub const GLUCOSE_COLUMNS: [&str; 1] = ["value"];

/// Columns the dose feature extractor needs
pub const DOSE_COLUMNS: [&str; 8] = [
    "deliveryType",
    "normal",
    "rate",
    "insulinCarbRatio",
    "carbInput",
    "bgInput",
    "insulinSensitivity",
    "duration",
];

/// Dose columns that are commonly absent; missing values are treated as empty
pub const OPTIONAL_DOSE_COLUMNS: [&str; 5] = [
    "extended",
    "percent",
    "subType",
    "insulinOnBoard",
    "jsonRowIndex",
];

/// One row of the export as read from CSV
///
/// Malformed numbers deserialize to `None` rather than failing the file.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RawRow {
    #[serde(rename = "type", default)]
    pub kind: Option<String>,
    #[serde(default)]
    pub time: Option<String>,
    #[serde(rename = "jsonRowIndex", default, deserialize_with = "csv::invalid_option")]
    pub json_row_index: Option<f64>,
    #[serde(default, deserialize_with = "csv::invalid_option")]
    pub value: Option<f64>,
    #[serde(rename = "subType", default)]
    pub sub_type: Option<String>,
    #[serde(rename = "deliveryType", default)]
    pub delivery_type: Option<String>,
    #[serde(default, deserialize_with = "csv::invalid_option")]
    pub normal: Option<f64>,
    #[serde(default, deserialize_with = "csv::invalid_option")]
    pub extended: Option<f64>,
    #[serde(default, deserialize_with = "csv::invalid_option")]
    pub rate: Option<f64>,
    #[serde(rename = "insulinCarbRatio", default, deserialize_with = "csv::invalid_option")]
    pub insulin_carb_ratio: Option<f64>,
    #[serde(rename = "carbInput", default, deserialize_with = "csv::invalid_option")]
    pub carb_input: Option<f64>,
    #[serde(rename = "insulinOnBoard", default, deserialize_with = "csv::invalid_option")]
    pub insulin_on_board: Option<f64>,
    #[serde(rename = "bgInput", default, deserialize_with = "csv::invalid_option")]
    pub bg_input: Option<f64>,
    #[serde(rename = "insulinSensitivity", default, deserialize_with = "csv::invalid_option")]
    pub insulin_sensitivity: Option<f64>,
    #[serde(default, deserialize_with = "csv::invalid_option")]
    pub duration: Option<f64>,
    #[serde(default, deserialize_with = "csv::invalid_option")]
    pub percent: Option<f64>,
}

/// Why a row did not become an event
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RowRejection {
    /// Row kind is not glucose, bolus or basal
    IgnoredKind,
    /// `time` is absent or unparsable
    BadTimestamp,
}

impl RawRow {
    /// Convert to a typed event
    pub fn into_event(self) -> Result<Event, RowRejection> {
        let kind = self
            .kind
            .as_deref()
            .map(EventKind::from_raw)
            .unwrap_or(EventKind::Other);
        if kind == EventKind::Other {
            return Err(RowRejection::IgnoredKind);
        }

        let local = self
            .time
            .as_deref()
            .and_then(parse_timestamp)
            .ok_or(RowRejection::BadTimestamp)?;

        Ok(Event {
            kind,
            timestamp: local.with_timezone(&Utc),
            local_date: local.date_naive(),
            row_index: self.json_row_index.map(|i| i as i64),
            value: finite(self.value),
            sub_type: non_empty(self.sub_type),
            delivery_type: non_empty(self.delivery_type).map(|d| DeliveryType::from_raw(&d)),
            normal: finite(self.normal),
            extended: finite(self.extended),
            rate: finite(self.rate),
            insulin_carb_ratio: finite(self.insulin_carb_ratio),
            carb_input: finite(self.carb_input),
            insulin_on_board: finite(self.insulin_on_board),
            bg_input: finite(self.bg_input),
            insulin_sensitivity: finite(self.insulin_sensitivity),
            duration: finite(self.duration),
            percent: finite(self.percent),
        })
    }
}

fn finite(v: Option<f64>) -> Option<f64> {
    v.filter(|x| x.is_finite())
}

fn non_empty(s: Option<String>) -> Option<String> {
    s.map(|s| s.trim().to_string()).filter(|s| !s.is_empty())
}

/// Naive layouts accepted after RFC 3339; interpreted as UTC
const NAIVE_FORMATS: [&str; 8] = [
    "%Y-%m-%dT%H:%M:%S%.f",
    "%Y-%m-%dT%H:%M:%S",
    "%Y-%m-%d %H:%M:%S%.f",
    "%Y-%m-%d %H:%M:%S",
    "%Y-%m-%dT%H:%M",
    "%Y-%m-%d %H:%M",
    "%m/%d/%Y %H:%M:%S",
    "%m/%d/%Y %H:%M",
];

/// Parse an ISO-ish timestamp
///
/// The source offset is kept so the local calendar day survives; naive
/// timestamps are taken as UTC; a bare date is midnight.
pub fn parse_timestamp(raw: &str) -> Option<DateTime<FixedOffset>> {
    let s = raw.trim();
    if s.is_empty() {
        return None;
    }

    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Some(dt);
    }
    for fmt in ["%Y-%m-%d %H:%M:%S%.f%:z", "%Y-%m-%d %H:%M:%S%z"] {
        if let Ok(dt) = DateTime::parse_from_str(s, fmt) {
            return Some(dt);
        }
    }
    for fmt in NAIVE_FORMATS {
        if let Ok(naive) = NaiveDateTime::parse_from_str(s, fmt) {
            return Some(naive.and_utc().fixed_offset());
        }
    }
    NaiveDate::parse_from_str(s, "%Y-%m-%d")
        .ok()
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .map(|naive| naive.and_utc().fixed_offset())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_parse_rfc3339_with_offset() {
        let ts = parse_timestamp("2018-03-01T12:00:00.000Z").unwrap();
        assert_eq!(ts, Utc.with_ymd_and_hms(2018, 3, 1, 12, 0, 0).unwrap());

        let ts = parse_timestamp("2018-03-01T07:00:00-05:00").unwrap();
        assert_eq!(ts, Utc.with_ymd_and_hms(2018, 3, 1, 12, 0, 0).unwrap());
        assert_eq!(ts.offset().local_minus_utc(), -5 * 3600);
    }

    #[test]
    fn test_local_date_follows_source_offset() {
        // 21:00 at -05:00 is already the next day in UTC
        let row = RawRow {
            kind: Some("bolus".to_string()),
            time: Some("2018-03-01T21:00:00-05:00".to_string()),
            normal: Some(3.0),
            ..Default::default()
        };
        let event = row.into_event().unwrap();
        assert_eq!(event.timestamp, Utc.with_ymd_and_hms(2018, 3, 2, 2, 0, 0).unwrap());
        assert_eq!(event.local_date, NaiveDate::from_ymd_opt(2018, 3, 1).unwrap());
    }

    #[test]
    fn test_parse_naive_formats() {
        let utc = |raw: &str| parse_timestamp(raw).map(|t| t.with_timezone(&Utc));
        let expected = Utc.with_ymd_and_hms(2018, 3, 1, 12, 5, 0).unwrap();
        assert_eq!(utc("2018-03-01 12:05:00"), Some(expected));
        assert_eq!(utc("2018-03-01T12:05:00"), Some(expected));
        assert_eq!(utc("2018-03-01 12:05"), Some(expected));
        assert_eq!(utc("03/01/2018 12:05"), Some(expected));
        assert_eq!(
            utc("2018-03-01"),
            Some(Utc.with_ymd_and_hms(2018, 3, 1, 0, 0, 0).unwrap())
        );
    }

    #[test]
    fn test_parse_garbage() {
        assert_eq!(parse_timestamp(""), None);
        assert_eq!(parse_timestamp("yesterday"), None);
        assert_eq!(parse_timestamp("2018-13-45 99:00:00"), None);
    }

    #[test]
    fn test_row_rejections() {
        let row = RawRow {
            kind: Some("smbg".to_string()),
            time: Some("2018-03-01T12:00:00Z".to_string()),
            ..Default::default()
        };
        assert_eq!(row.into_event(), Err(RowRejection::IgnoredKind));

        let row = RawRow {
            kind: Some("cbg".to_string()),
            time: Some("not a time".to_string()),
            value: Some(5.5),
            ..Default::default()
        };
        assert_eq!(row.into_event(), Err(RowRejection::BadTimestamp));
    }

    #[test]
    fn test_row_into_event() {
        let row = RawRow {
            kind: Some("basal".to_string()),
            time: Some("2018-03-01T12:00:00Z".to_string()),
            delivery_type: Some("temp".to_string()),
            rate: Some(0.8),
            percent: Some(f64::NAN),
            json_row_index: Some(17.0),
            ..Default::default()
        };
        let event = row.into_event().unwrap();
        assert_eq!(event.kind, EventKind::Basal);
        assert_eq!(event.delivery_type, Some(DeliveryType::Temp));
        assert_eq!(event.rate, Some(0.8));
        assert_eq!(event.percent, None);
        assert_eq!(event.row_index, Some(17));
    }
}

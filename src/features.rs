//! Dose feature extraction
//!
//! This module derives one feature row per bolus or basal dose:
//! - Zero and median fills of the raw dose fields
//! - Total bolus amount and total daily dose (TDD)
//! - Glucose at dose time, backfilled from CGM when not recorded
//! - Glucose windows around the dose and their gap durations
//! - Point readings 30 minutes before and 75 minutes after
//! - SAX strings over the consideration window

use crate::config::PipelineConfig;
use crate::error::ComputeError;
use crate::schema::{RawExport, DOSE_COLUMNS};
use crate::stats::{mean, median};
use crate::types::{
    DoseFeatureRow, DoseKind, Event, EventKind, FeatureTable, GlucoseInputSource, GlucoseSeries,
    SaxTable, MISSING_GLUCOSE,
};
use crate::window::{query_slice, query_values, round_to_minutes, Bounds};
use chrono::{DateTime, Duration, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tracing::{debug, info};

/// Reading window and target before the dose: (start, end, target) minutes
const READING_BEFORE: (i64, i64, i64) = (-31, -24, -30);

/// Reading window and target after the dose
const READING_AFTER: (i64, i64, i64) = (74, 79, 75);

/// Overlap of the glucose windows past the dose time, in minutes
const GLUCOSE_WINDOW_BUFFER: i64 = 5;

/// Parameters of the feature extraction stage
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ExtractionParams {
    pub consideration_window_minutes: i64,
    pub glucose_input_window_minutes: i64,
    /// Resolution of the SAX table the strings are read from
    pub sax_window_minutes: i64,
}

impl Default for ExtractionParams {
    fn default() -> Self {
        Self::from(&PipelineConfig::default())
    }
}

impl From<&PipelineConfig> for ExtractionParams {
    fn from(config: &PipelineConfig) -> Self {
        Self {
            consideration_window_minutes: config.consideration_window_minutes,
            glucose_input_window_minutes: config.glucose_input_window_minutes,
            sax_window_minutes: config.sax_window_minutes,
        }
    }
}

/// Per-day TDD memo, owned by a single extraction call
#[derive(Debug, Default)]
pub struct TddCache {
    totals: HashMap<NaiveDate, f64>,
    hits: usize,
    misses: usize,
}

impl TddCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// TDD for `date`, computed on first request
    pub fn get_or_compute(&mut self, date: NaiveDate, doses: &[&Event]) -> f64 {
        if let Some(total) = self.totals.get(&date) {
            self.hits += 1;
            return *total;
        }
        self.misses += 1;
        let total = daily_total(doses, date);
        self.totals.insert(date, total);
        total
    }

    pub fn len(&self) -> usize {
        self.totals.len()
    }

    pub fn is_empty(&self) -> bool {
        self.totals.is_empty()
    }

    /// (hits, misses)
    pub fn stats(&self) -> (usize, usize) {
        (self.hits, self.misses)
    }
}

/// Sum of bolus amounts and basal rates over one local calendar day
pub fn daily_total(doses: &[&Event], date: NaiveDate) -> f64 {
    doses
        .iter()
        .filter(|e| e.local_date == date)
        .map(|e| bolus_amount(e) + e.rate.unwrap_or(0.0))
        .sum()
}

fn bolus_amount(event: &Event) -> f64 {
    event.normal.unwrap_or(0.0) + event.extended.unwrap_or(0.0)
}

/// Gap duration of a glucose window
///
/// Sentinel slots plus slots the window should have held but did not,
/// clamped to `[0, window_minutes]`.
pub fn gap_duration(values: &[f64], window_minutes: i64, cadence_minutes: i64) -> f64 {
    let cadence = cadence_minutes as f64;
    let sentinels = values.iter().filter(|v| **v == MISSING_GLUCOSE).count() as f64;
    let expected = (window_minutes / cadence_minutes) as f64;
    let absent = (expected - values.len() as f64).max(0.0);
    (sentinels * cadence + absent * cadence).clamp(0.0, window_minutes as f64)
}

/// Real reading in the open window `(anchor + start, anchor + end)` closest
/// to `anchor + target`; the earlier reading wins ties
pub fn nearest_reading(
    series: &GlucoseSeries,
    anchor: DateTime<Utc>,
    (start, end, target): (i64, i64, i64),
) -> Option<f64> {
    let target = anchor + Duration::minutes(target);
    query_slice(&series.points, anchor, start, end, Bounds::Open)
        .iter()
        .filter(|p| !p.is_missing())
        .min_by_key(|p| (p.timestamp - target).num_seconds().abs())
        .map(|p| p.value)
}

/// Extractor for building the dose feature table
pub struct DoseFeatureExtractor;

impl DoseFeatureExtractor {
    /// Build the feature table for every dose in the export
    pub fn extract(
        export: &RawExport,
        series: &GlucoseSeries,
        sax: &SaxTable,
        params: &ExtractionParams,
    ) -> Result<FeatureTable, ComputeError> {
        let window = params.consideration_window_minutes;
        if window <= 0 || params.glucose_input_window_minutes <= 0 {
            return Err(ComputeError::Configuration(format!(
                "feature windows must be positive, got consideration {window} and glucose input {}",
                params.glucose_input_window_minutes
            )));
        }
        if sax.window_minutes != params.sax_window_minutes {
            return Err(ComputeError::Configuration(format!(
                "SAX table is at {} minutes, extraction expects {}",
                sax.window_minutes, params.sax_window_minutes
            )));
        }
        export.require_columns(&DOSE_COLUMNS, "dose feature extractor")?;

        let doses: Vec<&Event> = export.events.iter().filter(|e| e.is_dose()).collect();
        if doses.is_empty() {
            return Err(ComputeError::InsufficientData(
                "export contains no bolus or basal rows".to_string(),
            ));
        }

        // Fills are computed once over the whole dose set
        let carb_ratio_median = median(&collect(&doses, |e| e.insulin_carb_ratio));
        let sensitivity_median = median(&collect(&doses, |e| e.insulin_sensitivity));
        let recorded: Vec<f64> = doses.iter().filter_map(|e| recorded_glucose(e)).collect();
        let fallback_glucose = mean(&recorded)
            .or_else(|| mean(&series.real_values()))
            .unwrap_or(MISSING_GLUCOSE);

        let cadence = series.cadence_minutes;
        let mut tdd_cache = TddCache::new();
        let mut backfilled = 0usize;
        let mut rows = Vec::with_capacity(doses.len());

        for dose in &doses {
            let t = dose.timestamp;

            let (glucose_input, glucose_input_source) = match recorded_glucose(dose) {
                Some(v) => (v, GlucoseInputSource::Recorded),
                None => {
                    backfilled += 1;
                    let half = params.glucose_input_window_minutes;
                    match nearest_reading(series, t, (-half, half, 0)) {
                        Some(v) => (v, GlucoseInputSource::Cgm),
                        None => (fallback_glucose, GlucoseInputSource::DatasetMean),
                    }
                }
            };

            let buffer = GLUCOSE_WINDOW_BUFFER;
            let glucose_before =
                query_values(&series.points, t, -window, buffer, Bounds::Open, |p| p.value);
            let glucose_after =
                query_values(&series.points, t, -buffer, window, Bounds::Open, |p| p.value);

            let (sax_string_before, sax_string_after) = sax_strings(sax, t, window);

            rows.push(DoseFeatureRow {
                kind: if dose.kind == EventKind::Bolus {
                    DoseKind::Bolus
                } else {
                    DoseKind::Basal
                },
                timestamp: t,
                row_index: dose.row_index,
                sub_type: dose.sub_type.clone(),
                delivery_type: dose.delivery_type.clone(),
                normal: dose.normal.unwrap_or(0.0),
                extended: dose.extended.unwrap_or(0.0),
                rate: dose.rate.unwrap_or(0.0),
                carb_input: dose.carb_input.unwrap_or(0.0),
                insulin_carb_ratio: dose.insulin_carb_ratio.or(carb_ratio_median),
                insulin_sensitivity: dose.insulin_sensitivity.or(sensitivity_median),
                insulin_on_board: dose.insulin_on_board,
                duration: dose.duration,
                percent: dose.percent,
                total_bolus_amount: bolus_amount(dose),
                tdd: tdd_cache.get_or_compute(dose.local_date, &doses),
                glucose_input,
                glucose_input_source,
                gap_duration_before: gap_duration(&glucose_before, window, cadence),
                gap_duration_after: gap_duration(&glucose_after, window, cadence),
                glucose_before,
                glucose_after,
                glucose_30min_before: Some(
                    nearest_reading(series, t, READING_BEFORE).unwrap_or(fallback_glucose),
                ),
                glucose_75min_after: Some(
                    nearest_reading(series, t, READING_AFTER).unwrap_or(fallback_glucose),
                ),
                sax_string_before,
                sax_string_after,
            });
        }

        let (hits, misses) = tdd_cache.stats();
        debug!(tdd_days = tdd_cache.len(), hits, misses, "TDD cache");
        info!(
            rows = rows.len(),
            backfilled_glucose_input = backfilled,
            "Dose features extracted"
        );

        Ok(FeatureTable {
            consideration_window_minutes: window,
            sax_window_minutes: sax.window_minutes,
            rows,
        })
    }
}

fn collect(doses: &[&Event], field: impl Fn(&Event) -> Option<f64>) -> Vec<f64> {
    doses.iter().filter_map(|e| field(*e)).collect()
}

fn recorded_glucose(event: &Event) -> Option<f64> {
    event.bg_input.filter(|v| *v > 0.0)
}

/// SAX symbols over `[round(t - W), round(t))` and `(round(t), round(t + W)]`
fn sax_strings(sax: &SaxTable, t: DateTime<Utc>, window: i64) -> (String, String) {
    let w = sax.window_minutes;
    let anchor = round_to_minutes(t, w);
    let start = (round_to_minutes(t - Duration::minutes(window), w) - anchor).num_minutes();
    let end = (round_to_minutes(t + Duration::minutes(window), w) - anchor).num_minutes();

    let before: String =
        query_values(&sax.rows, anchor, start, 0, Bounds::ClosedOpen, |r| r.symbol)
            .into_iter()
            .collect();
    let after: String = query_values(&sax.rows, anchor, 0, end, Bounds::OpenClosed, |r| r.symbol)
        .into_iter()
        .collect();
    (before, after)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sax::SaxDiscretizer;
    use crate::types::{DeliveryType, GlucosePoint};
    use chrono::TimeZone;
    use pretty_assertions::assert_eq;

    fn day0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 15, 0, 0, 0).unwrap()
    }

    fn at(minutes: i64) -> DateTime<Utc> {
        day0() + Duration::minutes(minutes)
    }

    /// One day of 5-minute readings, sentinels in `gap` (minutes, half-open)
    fn series(gap: Option<(i64, i64)>) -> GlucoseSeries {
        let points = (0..288)
            .map(|i| {
                let m = i * 5;
                let missing = gap.map_or(false, |(a, b)| m >= a && m < b);
                let value = if missing { MISSING_GLUCOSE } else { 5.0 + (i % 12) as f64 * 0.25 };
                GlucosePoint {
                    timestamp: at(m),
                    value,
                    log_value: (!missing).then(|| value.log10()),
                }
            })
            .collect();
        GlucoseSeries {
            cadence_minutes: 5,
            points,
        }
    }

    fn bolus(minutes: i64, normal: f64, bg_input: Option<f64>) -> Event {
        let mut e = Event::new(EventKind::Bolus, at(minutes));
        e.normal = Some(normal);
        e.carb_input = Some(normal * 10.0);
        e.bg_input = bg_input;
        e
    }

    fn temp_basal(minutes: i64, rate: f64) -> Event {
        let mut e = Event::new(EventKind::Basal, at(minutes));
        e.delivery_type = Some(DeliveryType::Temp);
        e.rate = Some(rate);
        e.duration = Some(1_800_000.0);
        e.percent = Some(0.5);
        e
    }

    fn extract(events: Vec<Event>, series: &GlucoseSeries) -> FeatureTable {
        let export = RawExport::from_events(events);
        let sax = SaxDiscretizer::discretize(series, 7, 10).unwrap();
        DoseFeatureExtractor::extract(&export, series, &sax, &ExtractionParams::default()).unwrap()
    }

    #[test]
    fn test_tdd_cache_hit_equals_miss() {
        let events = vec![
            bolus(60, 2.0, None),
            temp_basal(120, 0.5),
            bolus(23 * 60 + 59, 3.0, None),
            bolus(24 * 60, 7.0, None),
        ];
        let doses: Vec<&Event> = events.iter().collect();
        let day = day0().date_naive();

        let mut cache = TddCache::new();
        let miss = cache.get_or_compute(day, &doses);
        let hit = cache.get_or_compute(day, &doses);
        assert_eq!(miss, hit);
        assert_eq!(miss, daily_total(&doses, day));
        // Midnight of the next day belongs to the next day only
        assert_eq!(miss, 5.5);
        assert_eq!(cache.stats(), (1, 1));
        assert_eq!(cache.get_or_compute(day.succ_opt().unwrap(), &doses), 7.0);
    }

    #[test]
    fn test_tdd_follows_local_day() {
        // 08:00 and 21:00 at -05:00 are 13:00 and 02:00 (+1 day) in UTC
        let local_day = day0().date_naive();
        let mut morning = bolus(13 * 60, 2.0, Some(6.0));
        let mut evening = bolus(26 * 60, 3.0, Some(6.0));
        morning.local_date = local_day;
        evening.local_date = local_day;

        let table = extract(vec![morning, evening], &series(None));
        let tdds: Vec<f64> = table.rows.iter().map(|r| r.tdd).collect();
        assert_eq!(tdds, vec![5.0, 5.0]);
    }

    #[test]
    fn test_tdd_same_day_of_month() {
        let jan = bolus(60, 2.0, None);
        let feb = bolus(31 * 24 * 60 + 60, 4.5, None);
        assert_eq!(feb.local_date.to_string(), "2024-02-15");
        let doses = vec![&jan, &feb];

        let mut cache = TddCache::new();
        assert_eq!(cache.get_or_compute(jan.local_date, &doses), 2.0);
        assert_eq!(cache.get_or_compute(feb.local_date, &doses), 4.5);
        assert_eq!(cache.stats(), (0, 2));
    }

    #[test]
    fn test_sax_window_mismatch_is_rejected() {
        let s = series(None);
        let export = RawExport::from_events(vec![bolus(300, 2.0, Some(6.0))]);
        let sax = SaxDiscretizer::discretize(&s, 7, 30).unwrap();
        let err = DoseFeatureExtractor::extract(&export, &s, &sax, &ExtractionParams::default())
            .unwrap_err();
        assert!(matches!(err, ComputeError::Configuration(_)));
    }

    #[test]
    fn test_tdd_in_feature_rows() {
        let s = series(None);
        let mut second = bolus(600, 1.5, Some(6.0));
        second.extended = Some(0.5);
        let table = extract(vec![bolus(300, 2.0, Some(6.0)), second], &s);
        assert_eq!(table.rows[1].total_bolus_amount, 2.0);
        assert!(table.rows.iter().all(|r| r.tdd == 4.0));
    }

    #[test]
    fn test_zero_and_median_fills() {
        let s = series(None);
        let mut a = bolus(300, 2.0, Some(6.0));
        a.insulin_carb_ratio = Some(8.0);
        a.insulin_sensitivity = Some(2.0);
        let mut b = bolus(400, 2.0, Some(6.0));
        b.insulin_carb_ratio = Some(12.0);
        let c = bolus(500, 2.0, Some(6.0));
        let table = extract(vec![a, b, c, temp_basal(700, 0.4)], &s);

        assert_eq!(table.rows[2].insulin_carb_ratio, Some(10.0));
        assert_eq!(table.rows[2].insulin_sensitivity, Some(2.0));
        assert_eq!(table.rows[3].extended, 0.0);
        assert_eq!(table.rows[3].carb_input, 0.0);
        assert_eq!(table.rows[0].rate, 0.0);
        assert!(table.rows[3].is_temp_basal());
    }

    #[test]
    fn test_glucose_input_backfill() {
        let s = series(Some((900, 960)));
        let table = extract(
            vec![
                bolus(300, 2.0, Some(7.0)),
                bolus(600, 2.0, None),
                bolus(930, 2.0, None),
                bolus(1000, 2.0, Some(9.0)),
            ],
            &s,
        );
        let sources: Vec<GlucoseInputSource> =
            table.rows.iter().map(|r| r.glucose_input_source).collect();
        assert_eq!(
            sources,
            vec![
                GlucoseInputSource::Recorded,
                GlucoseInputSource::Cgm,
                GlucoseInputSource::DatasetMean,
                GlucoseInputSource::Recorded,
            ]
        );
        // 600 min is slot 120 -> 5.0 + (120 % 12) * 0.25
        assert_eq!(table.rows[1].glucose_input, 5.0);
        assert_eq!(table.rows[2].glucose_input, 8.0);
    }

    #[test]
    fn test_gap_durations() {
        assert_eq!(gap_duration(&[5.0; 36], 180, 5), 0.0);
        assert_eq!(gap_duration(&[], 180, 5), 180.0);
        assert_eq!(gap_duration(&[5.0, MISSING_GLUCOSE, 6.0], 15, 5), 5.0);
        // More slots than expected never goes negative
        assert_eq!(gap_duration(&[5.0; 40], 180, 5), 0.0);
        assert_eq!(gap_duration(&[MISSING_GLUCOSE; 40], 180, 5), 180.0);
    }

    #[test]
    fn test_windows_and_gaps_around_a_gap() {
        // Sentinels from 12:05 to 14:00
        let s = series(Some((725, 845)));
        let table = extract(vec![bolus(480, 2.0, Some(6.0)), bolus(720, 2.0, Some(6.0))], &s);

        let morning = &table.rows[0];
        assert_eq!(morning.glucose_before.len(), 36);
        assert_eq!(morning.gap_duration_before, 0.0);
        assert_eq!(morning.gap_duration_after, 0.0);

        let noon = &table.rows[1];
        assert_eq!(noon.gap_duration_before, 0.0);
        assert_eq!(noon.glucose_after.len(), 36);
        assert_eq!(noon.gap_duration_after, 120.0);
    }

    #[test]
    fn test_window_buffer_is_fixed_at_five_minutes() {
        let points = (0..144)
            .map(|i| GlucosePoint {
                timestamp: at(i * 10),
                value: 6.0,
                log_value: Some(6.0_f64.log10()),
            })
            .collect();
        let s = GlucoseSeries {
            cadence_minutes: 10,
            points,
        };
        // 10:05 on a 10-minute grid: 07:10 to 10:00 before, 10:10 to 13:00 after
        let table = extract(vec![bolus(605, 2.0, Some(6.0))], &s);
        let row = &table.rows[0];
        assert_eq!(row.glucose_before.len(), 18);
        assert_eq!(row.glucose_after.len(), 18);
        assert_eq!(row.gap_duration_before, 0.0);
        assert_eq!(row.gap_duration_after, 0.0);
    }

    #[test]
    fn test_window_beyond_series_counts_as_gap() {
        let s = series(None);
        // 01:00 sees 13 slots (00:00 to 01:00) of the 36 expected
        let table = extract(vec![bolus(60, 2.0, Some(6.0))], &s);
        assert_eq!(table.rows[0].gap_duration_before, 115.0);
    }

    #[test]
    fn test_point_readings() {
        let s = series(None);
        let table = extract(vec![bolus(600, 2.0, Some(6.0))], &s);
        let row = &table.rows[0];
        // 570 min is slot 114, 675 min is slot 135
        assert_eq!(row.glucose_30min_before, Some(5.0 + 6.0 * 0.25));
        assert_eq!(row.glucose_75min_after, Some(5.0 + 3.0 * 0.25));

        let s = series(Some((560, 575)));
        let table = extract(vec![bolus(600, 2.0, Some(6.0))], &s);
        // Only the -25 reading (slot 115) is real
        assert_eq!(table.rows[0].glucose_30min_before, Some(5.0 + 7.0 * 0.25));
    }

    #[test]
    fn test_sax_strings_span_the_window() {
        let s = series(None);
        let table = extract(vec![bolus(603, 2.0, Some(6.0))], &s);
        let row = &table.rows[0];
        assert_eq!(row.sax_string_before.len(), 18);
        assert_eq!(row.sax_string_after.len(), 18);
        assert!(row.sax_string_before.chars().all(|c| ('a'..='g').contains(&c)));
    }

    #[test]
    fn test_missing_dose_column() {
        let s = series(None);
        let sax = SaxDiscretizer::discretize(&s, 7, 10).unwrap();
        let export = crate::schema::RawEventAdapter::read_csv(
            "type,time,value,normal\nbolus,2024-01-15T08:00:00Z,,2.0\n".as_bytes(),
        )
        .unwrap();
        let err = DoseFeatureExtractor::extract(&export, &s, &sax, &ExtractionParams::default())
            .unwrap_err();
        assert_eq!(err.kind(), "DATA_FORMAT_ERROR");
    }

    #[test]
    fn test_no_doses() {
        let s = series(None);
        let sax = SaxDiscretizer::discretize(&s, 7, 10).unwrap();
        let export = RawExport::from_events(vec![]);
        let err = DoseFeatureExtractor::extract(&export, &s, &sax, &ExtractionParams::default())
            .unwrap_err();
        assert_eq!(err.kind(), "INSUFFICIENT_DATA_ERROR");
    }
}

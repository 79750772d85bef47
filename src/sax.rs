//! Symbolic aggregate approximation of glucose
//!
//! The log glucose series is z-normalized, averaged over non-overlapping
//! windows (PAA), and each window mean is mapped to a letter by the
//! equal-probability bins of the standard normal distribution.

use crate::config::{sax_alphabet, MAX_ALPHABET_SIZE};
use crate::error::ComputeError;
use crate::stats::{mean, normal_quantile, population_std};
use crate::types::{GlucoseSeries, SaxRow, SaxTable};
use crate::window::floor_to_minutes;
use chrono::Duration;
use tracing::debug;

/// Below this the series is treated as constant
const MIN_STD: f64 = 1e-12;

/// Discretizer for building SAX annotation tables
pub struct SaxDiscretizer;

impl SaxDiscretizer {
    /// Build the SAX table of `series` at one window size
    pub fn discretize(
        series: &GlucoseSeries,
        alphabet_size: usize,
        window_minutes: i64,
    ) -> Result<SaxTable, ComputeError> {
        if !(2..=MAX_ALPHABET_SIZE).contains(&alphabet_size) {
            return Err(ComputeError::Configuration(format!(
                "SAX alphabet size must be between 2 and {MAX_ALPHABET_SIZE}, got {alphabet_size}"
            )));
        }
        if window_minutes <= 0 {
            return Err(ComputeError::Configuration(format!(
                "SAX window must be positive, got {window_minutes}"
            )));
        }

        let (alphabet, missing_symbol) = sax_alphabet(alphabet_size);
        let breakpoints = breakpoints(alphabet_size);

        let logs: Vec<f64> = series.points.iter().filter_map(|p| p.log_value).collect();
        let mu = mean(&logs).unwrap_or(0.0);
        let sigma = population_std(&logs).unwrap_or(0.0);
        let z = |l: f64| {
            if sigma < MIN_STD {
                0.0
            } else {
                (l - mu) / sigma
            }
        };

        let mut rows = Vec::new();
        if let (Some(first), Some(last)) = (series.points.first(), series.points.last()) {
            let step = Duration::minutes(window_minutes);
            let mut window_start = floor_to_minutes(first.timestamp, window_minutes);
            let end = floor_to_minutes(last.timestamp, window_minutes);
            let mut idx = 0;

            while window_start <= end {
                let window_end = window_start + step;
                let mut sum = 0.0;
                let mut n = 0usize;
                while idx < series.points.len() && series.points[idx].timestamp < window_end {
                    if let Some(l) = series.points[idx].log_value {
                        sum += z(l);
                        n += 1;
                    }
                    idx += 1;
                }

                let mean_z = (n > 0).then(|| sum / n as f64);
                let symbol = match mean_z {
                    Some(v) => alphabet[bin_index(&breakpoints, v)],
                    None => missing_symbol,
                };
                rows.push(SaxRow {
                    window_start,
                    mean_z,
                    symbol,
                });
                window_start = window_end;
            }
        }

        debug!(
            window_minutes,
            alphabet_size,
            windows = rows.len(),
            "SAX table built"
        );

        Ok(SaxTable {
            window_minutes,
            alphabet_size,
            breakpoints,
            missing_symbol,
            rows,
        })
    }

    /// Build one SAX table per window size, in the order given
    pub fn discretize_many(
        series: &GlucoseSeries,
        alphabet_size: usize,
        windows: &[i64],
    ) -> Result<Vec<SaxTable>, ComputeError> {
        windows
            .iter()
            .map(|w| Self::discretize(series, alphabet_size, *w))
            .collect()
    }
}

/// Interior breakpoints: standard normal quantiles at i/K, i = 1..K-1
pub fn breakpoints(alphabet_size: usize) -> Vec<f64> {
    (1..alphabet_size)
        .map(|i| normal_quantile(i as f64 / alphabet_size as f64))
        .collect()
}

/// Bin of `v` under right-closed bins `(b[i-1], b[i]]`
pub fn bin_index(breakpoints: &[f64], v: f64) -> usize {
    breakpoints.partition_point(|b| *b < v)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{GlucosePoint, MISSING_GLUCOSE};
    use chrono::{DateTime, TimeZone, Utc};

    fn start() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 15, 0, 0, 0).unwrap()
    }

    fn series_from(values: &[f64]) -> GlucoseSeries {
        let points = values
            .iter()
            .enumerate()
            .map(|(i, v)| GlucosePoint {
                timestamp: start() + Duration::minutes(5 * i as i64),
                value: *v,
                log_value: (*v > 0.0).then(|| v.log10()),
            })
            .collect();
        GlucoseSeries {
            cadence_minutes: 5,
            points,
        }
    }

    #[test]
    fn test_constant_series_maps_to_middle_letter() {
        let series = series_from(&[6.0; 24]);
        let table = SaxDiscretizer::discretize(&series, 7, 10).unwrap();
        assert_eq!(table.rows.len(), 12);
        assert!(table.rows.iter().all(|r| r.symbol == 'd'));

        let table = SaxDiscretizer::discretize(&series, 5, 30).unwrap();
        assert!(table.rows.iter().all(|r| r.symbol == 'c'));
    }

    #[test]
    fn test_breakpoints_ascending_and_symmetric() {
        let b = breakpoints(7);
        assert_eq!(b.len(), 6);
        assert!(b.windows(2).all(|w| w[0] < w[1]));
        for i in 0..3 {
            assert!((b[i] + b[5 - i]).abs() < 1e-8);
        }
        // Even alphabets put a breakpoint exactly at zero
        assert_eq!(breakpoints(4)[1], 0.0);
    }

    #[test]
    fn test_bins_cover_the_real_line() {
        let b = breakpoints(7);
        for v in [-1e9, -2.0, -0.5, 0.0, 0.3, 1.5, 1e9] {
            let idx = bin_index(&b, v);
            assert!(idx < 7);
            let lower = if idx == 0 { f64::NEG_INFINITY } else { b[idx - 1] };
            let upper = if idx == 6 { f64::INFINITY } else { b[idx] };
            assert!(v > lower && v <= upper, "v={v} idx={idx}");
        }
        // A value on a breakpoint belongs to the bin it closes
        assert_eq!(bin_index(&b, b[2]), 2);
    }

    #[test]
    fn test_empty_window_uses_missing_symbol() {
        let mut values = vec![5.0, 6.0, 7.0, 8.0];
        values.extend([MISSING_GLUCOSE; 4]);
        values.extend([9.0, 10.0, 11.0, 12.0]);
        let series = series_from(&values);

        let table = SaxDiscretizer::discretize(&series, 7, 10).unwrap();
        assert_eq!(table.missing_symbol, 'h');
        assert_eq!(table.rows.len(), 6);
        assert_eq!(table.rows[2].symbol, 'h');
        assert_eq!(table.rows[3].symbol, 'h');
        assert_eq!(table.rows[2].mean_z, None);
        // Rising series: letters never decrease across defined windows
        let word: Vec<char> = table.word().chars().filter(|c| *c != 'h').collect();
        assert!(word.windows(2).all(|w| w[0] <= w[1]));
    }

    #[test]
    fn test_windows_are_contiguous() {
        let series = series_from(&[5.0; 40]);
        let table = SaxDiscretizer::discretize(&series, 7, 30).unwrap();
        for pair in table.rows.windows(2) {
            assert_eq!(pair[1].window_start - pair[0].window_start, Duration::minutes(30));
        }
        // 40 slots span 195 minutes -> windows at 0, 30, ..., 180
        assert_eq!(table.rows.len(), 7);
    }

    #[test]
    fn test_alphabet_bounds() {
        let series = series_from(&[5.0; 4]);
        let err = SaxDiscretizer::discretize(&series, 26, 10).unwrap_err();
        assert_eq!(err.kind(), "CONFIGURATION_ERROR");
        assert!(SaxDiscretizer::discretize(&series, 1, 10).is_err());
        assert!(SaxDiscretizer::discretize(&series, 25, 10).is_ok());
    }

    #[test]
    fn test_discretize_many() {
        let series = series_from(&[5.0; 36]);
        let tables = SaxDiscretizer::discretize_many(&series, 7, &[10, 30, 60, 180]).unwrap();
        let sizes: Vec<usize> = tables.iter().map(|t| t.rows.len()).collect();
        assert_eq!(sizes, vec![18, 6, 3, 1]);
    }
}

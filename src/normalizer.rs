//! Glucose normalization
//!
//! This module resamples CGM readings onto a fixed-cadence grid:
//! - Slots aligned to the Unix epoch, one every `cadence_minutes`
//! - The last reading in a slot wins
//! - Empty slots carry the [`MISSING_GLUCOSE`] sentinel
//! - log10 of every real reading

use crate::error::ComputeError;
use crate::schema::{RawExport, GLUCOSE_COLUMNS};
use crate::types::{EventKind, GlucosePoint, GlucoseSeries, MISSING_GLUCOSE};
use crate::window::floor_to_minutes;
use chrono::Duration;
use std::collections::BTreeMap;
use tracing::debug;

/// Normalizer for turning raw glucose events into a fixed-cadence series
pub struct GlucoseNormalizer;

impl GlucoseNormalizer {
    /// Normalize the glucose readings of an export
    pub fn normalize(
        export: &RawExport,
        cadence_minutes: i64,
    ) -> Result<GlucoseSeries, ComputeError> {
        if cadence_minutes <= 0 {
            return Err(ComputeError::Configuration(format!(
                "glucose cadence must be positive, got {cadence_minutes}"
            )));
        }
        export.require_columns(&GLUCOSE_COLUMNS, "glucose normalizer")?;

        // Events are time-sorted, so later inserts are later readings
        let mut slots = BTreeMap::new();
        let mut rejected = 0usize;
        for event in export.events.iter().filter(|e| e.kind == EventKind::Glucose) {
            match event.value.filter(|v| v.is_finite() && *v > 0.0) {
                Some(v) => {
                    slots.insert(floor_to_minutes(event.timestamp, cadence_minutes), v);
                }
                None => rejected += 1,
            }
        }

        let (Some(&first), Some(&last)) = (slots.keys().next(), slots.keys().next_back()) else {
            return Err(ComputeError::InsufficientData(
                "export contains no usable glucose readings".to_string(),
            ));
        };

        let step = Duration::minutes(cadence_minutes);
        let n_slots = (last - first).num_minutes() / cadence_minutes + 1;
        let mut points = Vec::with_capacity(n_slots as usize);
        let mut t = first;
        while t <= last {
            let point = match slots.get(&t) {
                Some(&value) => GlucosePoint {
                    timestamp: t,
                    value,
                    log_value: Some(value.log10()),
                },
                None => GlucosePoint {
                    timestamp: t,
                    value: MISSING_GLUCOSE,
                    log_value: None,
                },
            };
            points.push(point);
            t += step;
        }

        let series = GlucoseSeries {
            cadence_minutes,
            points,
        };

        debug!(
            slots = series.len(),
            readings = slots.len(),
            rejected,
            coverage = series.coverage(),
            "Glucose normalized"
        );

        Ok(series)
    }
}

//! Time-window queries over sorted event streams
//!
//! Every lookup in the pipeline goes through this module. Offsets are signed
//! minutes relative to the anchor and the caller supplies the sign:
//! `start = anchor + before_offset`, `end = anchor + after_offset`. A window
//! reaching 30 minutes into the past therefore uses `before_offset = -30`.

use chrono::{DateTime, Duration, Utc};
use std::cmp::Ordering;

/// Anything carrying a point in time
pub trait Timestamped {
    fn timestamp(&self) -> DateTime<Utc>;
}

/// Boundary inclusion of a window
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Bounds {
    /// `start < t < end`; glucose lookups
    Open,
    /// `start <= t < end`; SAX strings before an event
    ClosedOpen,
    /// `start < t <= end`; SAX strings after an event
    OpenClosed,
}

#[cfg(test)]
impl Bounds {
    fn contains(&self, t: DateTime<Utc>, start: DateTime<Utc>, end: DateTime<Utc>) -> bool {
        match self {
            Bounds::Open => t > start && t < end,
            Bounds::ClosedOpen => t >= start && t < end,
            Bounds::OpenClosed => t > start && t <= end,
        }
    }
}

/// Absolute window edges for an anchor and signed minute offsets
pub fn window_edges(
    anchor: DateTime<Utc>,
    before_offset_minutes: i64,
    after_offset_minutes: i64,
) -> (DateTime<Utc>, DateTime<Utc>) {
    (
        anchor + Duration::minutes(before_offset_minutes),
        anchor + Duration::minutes(after_offset_minutes),
    )
}

/// Entries of a time-sorted `series` inside the window, in series order
///
/// Uses binary search on both edges, so `series` must be sorted ascending by
/// timestamp. Duplicate timestamps are kept; see [`query_values`] for the
/// deduplicated form.
pub fn query_slice<T: Timestamped>(
    series: &[T],
    anchor: DateTime<Utc>,
    before_offset_minutes: i64,
    after_offset_minutes: i64,
    bounds: Bounds,
) -> &[T] {
    let (start, end) = window_edges(anchor, before_offset_minutes, after_offset_minutes);
    if end < start {
        return &[];
    }

    let lo = match bounds {
        Bounds::ClosedOpen => series.partition_point(|e| e.timestamp() < start),
        Bounds::Open | Bounds::OpenClosed => series.partition_point(|e| e.timestamp() <= start),
    };
    let hi = match bounds {
        Bounds::OpenClosed => series.partition_point(|e| e.timestamp() <= end),
        Bounds::Open | Bounds::ClosedOpen => series.partition_point(|e| e.timestamp() < end),
    };

    if lo >= hi {
        &[]
    } else {
        &series[lo..hi]
    }
}

/// Values of the window's entries, deduplicated by timestamp (first kept)
pub fn query_values<T, V, F>(
    series: &[T],
    anchor: DateTime<Utc>,
    before_offset_minutes: i64,
    after_offset_minutes: i64,
    bounds: Bounds,
    value: F,
) -> Vec<V>
where
    T: Timestamped,
    F: Fn(&T) -> V,
{
    let slice = query_slice(
        series,
        anchor,
        before_offset_minutes,
        after_offset_minutes,
        bounds,
    );

    let mut out = Vec::with_capacity(slice.len());
    let mut last: Option<DateTime<Utc>> = None;
    for entry in slice {
        let ts = entry.timestamp();
        if last == Some(ts) {
            continue;
        }
        last = Some(ts);
        out.push(value(entry));
    }
    out
}

/// Linear-scan reference of [`query_slice`] membership
#[cfg(test)]
fn in_window(
    t: DateTime<Utc>,
    anchor: DateTime<Utc>,
    before_offset_minutes: i64,
    after_offset_minutes: i64,
    bounds: Bounds,
) -> bool {
    let (start, end) = window_edges(anchor, before_offset_minutes, after_offset_minutes);
    bounds.contains(t, start, end)
}

/// Round `t` to the nearest multiple of `minutes` since the epoch; exact
/// ties go to the even multiple
pub fn round_to_minutes(t: DateTime<Utc>, minutes: i64) -> DateTime<Utc> {
    let step = minutes.max(1) * 60;
    let secs = t.timestamp();
    let rem = secs.rem_euclid(step);
    let floored = secs - rem;
    let up = match (rem * 2).cmp(&step) {
        Ordering::Greater => true,
        Ordering::Less => false,
        Ordering::Equal => t.timestamp_subsec_nanos() > 0 || (floored / step).rem_euclid(2) == 1,
    };
    let rounded = if up { floored + step } else { floored };
    DateTime::from_timestamp(rounded, 0).unwrap_or(t)
}

/// Floor `t` to a multiple of `minutes` since the epoch
pub fn floor_to_minutes(t: DateTime<Utc>, minutes: i64) -> DateTime<Utc> {
    let step = minutes.max(1) * 60;
    let secs = t.timestamp();
    DateTime::from_timestamp(secs - secs.rem_euclid(step), 0).unwrap_or(t)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[derive(Debug, Clone, PartialEq)]
    struct Point {
        at: DateTime<Utc>,
        value: f64,
    }

    impl Timestamped for Point {
        fn timestamp(&self) -> DateTime<Utc> {
            self.at
        }
    }

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 15, 12, 0, 0).unwrap()
    }

    /// Points every 5 minutes from t0 - 60min to t0 + 60min
    fn series() -> Vec<Point> {
        (-12..=12)
            .map(|i| Point {
                at: t0() + Duration::minutes(i * 5),
                value: i as f64,
            })
            .collect()
    }

    #[test]
    fn test_open_window_excludes_edges() {
        let s = series();
        let values = query_values(&s, t0(), -10, 10, Bounds::Open, |p| p.value);
        assert_eq!(values, vec![-1.0, 0.0, 1.0]);
    }

    #[test]
    fn test_closed_open_includes_start() {
        let s = series();
        let values = query_values(&s, t0(), -10, 10, Bounds::ClosedOpen, |p| p.value);
        assert_eq!(values, vec![-2.0, -1.0, 0.0, 1.0]);
    }

    #[test]
    fn test_open_closed_includes_end() {
        let s = series();
        let values = query_values(&s, t0(), -10, 10, Bounds::OpenClosed, |p| p.value);
        assert_eq!(values, vec![-1.0, 0.0, 1.0, 2.0]);
    }

    #[test]
    fn test_zero_offsets_are_empty() {
        let s = series();
        assert!(query_values(&s, t0(), 0, 0, Bounds::Open, |p| p.value).is_empty());
        // Anchor on an exact sample is still excluded by the open interval
        assert!(query_slice(&s, t0(), 0, 0, Bounds::Open).is_empty());
    }

    #[test]
    fn test_offsets_are_signed() {
        let s = series();
        // Both offsets negative: a window entirely in the past
        let past = query_values(&s, t0(), -31, -24, Bounds::Open, |p| p.value);
        assert_eq!(past, vec![-6.0, -5.0]);

        // Both offsets positive: a window entirely in the future
        let future = query_values(&s, t0(), 44, 56, Bounds::Open, |p| p.value);
        assert_eq!(future, vec![9.0, 10.0, 11.0]);
    }

    #[test]
    fn test_inverted_window_is_empty() {
        let s = series();
        assert!(query_slice(&s, t0(), 10, -10, Bounds::Open).is_empty());
    }

    #[test]
    fn test_matches_linear_scan() {
        let s = series();
        let anchors = [
            t0(),
            t0() + Duration::minutes(2),
            t0() - Duration::minutes(37),
            t0() + Duration::minutes(300),
        ];
        let offsets = [(-180, 5), (-5, 180), (-31, -24), (74, 79), (0, 0), (-7, 3)];
        for anchor in anchors {
            for (b, a) in offsets {
                for bounds in [Bounds::Open, Bounds::ClosedOpen, Bounds::OpenClosed] {
                    let fast: Vec<f64> = query_slice(&s, anchor, b, a, bounds)
                        .iter()
                        .map(|p| p.value)
                        .collect();
                    let slow: Vec<f64> = s
                        .iter()
                        .filter(|p| in_window(p.at, anchor, b, a, bounds))
                        .map(|p| p.value)
                        .collect();
                    assert_eq!(fast, slow, "anchor={anchor} b={b} a={a} {bounds:?}");
                }
            }
        }
    }

    #[test]
    fn test_dedup_by_timestamp_keeps_first() {
        let mut s = series();
        let dup = Point {
            at: t0(),
            value: 99.0,
        };
        s.insert(13, dup);
        let values = query_values(&s, t0(), -6, 6, Bounds::Open, |p| p.value);
        assert_eq!(values, vec![-1.0, 0.0, 1.0]);
    }

    #[test]
    fn test_rounding_helpers() {
        let t = Utc.with_ymd_and_hms(2024, 1, 15, 12, 4, 59).unwrap();
        assert_eq!(
            round_to_minutes(t, 10),
            Utc.with_ymd_and_hms(2024, 1, 15, 12, 0, 0).unwrap()
        );
        // Ties go to the even multiple; 12:00 is an even multiple of 10 minutes
        let t = Utc.with_ymd_and_hms(2024, 1, 15, 12, 5, 0).unwrap();
        assert_eq!(
            round_to_minutes(t, 10),
            Utc.with_ymd_and_hms(2024, 1, 15, 12, 0, 0).unwrap()
        );
        assert_eq!(
            round_to_minutes(Utc.with_ymd_and_hms(2024, 1, 15, 12, 15, 0).unwrap(), 10),
            Utc.with_ymd_and_hms(2024, 1, 15, 12, 20, 0).unwrap()
        );
        assert_eq!(
            round_to_minutes(t + Duration::milliseconds(1), 10),
            Utc.with_ymd_and_hms(2024, 1, 15, 12, 10, 0).unwrap()
        );
        assert_eq!(
            floor_to_minutes(t, 30),
            Utc.with_ymd_and_hms(2024, 1, 15, 12, 0, 0).unwrap()
        );
    }
}

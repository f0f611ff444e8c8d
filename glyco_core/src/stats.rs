//! Recent glucose statistics ("BG now" and delta).
//!
//! Readings are grouped into 5-minute buckets anchored on the newest valid
//! reading. The newest bucket gives the current mean; the next non-empty
//! bucket gives the delta, scaled back to a 5-minute change when readings
//! are missing in between.

use crate::history::valid_readings;
use crate::{GlucoseReading, Units, MINUTE_MS};
use serde::{Deserialize, Serialize};

/// Width of one statistics bucket
pub const BUCKET_MINUTES: i64 = 5;

const BUCKET_COUNT: i64 = 4;

/// Gaps longer than this are interpolated to a 5-minute delta
const INTERPOLATE_AFTER_MINUTES: f64 = 9.0;

/// Statistics for the newest bucket of readings
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct BgNow {
    /// Timestamp of the newest reading in the bucket
    pub mills: i64,
    pub mean: f64,
    /// Value of the newest reading in the bucket
    pub last: f64,
    pub readings: usize,
}

/// Change between the newest bucket and the one before it
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct Delta {
    pub absolute: f64,
    pub elapsed_mins: f64,
    pub interpolated: bool,
    pub mean_5_mins_ago: f64,
    /// Rounded 5-minute change in mg/dL
    pub mgdl: i64,
    pub previous_mills: i64,
}

impl Delta {
    /// Build a delta directly from two bucket means
    pub fn between(recent: &BgNow, previous: &BgNow) -> Self {
        let absolute = recent.mean - previous.mean;
        let elapsed_mins = (recent.mills - previous.mills) as f64 / MINUTE_MS as f64;
        let interpolated = elapsed_mins > INTERPOLATE_AFTER_MINUTES;

        let mean_5_mins_ago = if interpolated {
            recent.mean - absolute / elapsed_mins * BUCKET_MINUTES as f64
        } else {
            recent.mean - absolute
        };

        Self {
            absolute,
            elapsed_mins,
            interpolated,
            mean_5_mins_ago,
            mgdl: (recent.mean - mean_5_mins_ago).round() as i64,
            previous_mills: previous.mills,
        }
    }

    /// Signed change in the given units, e.g. `+0.3` or `-12`
    pub fn display(&self, units: Units) -> String {
        let change = self.mgdl as f64;
        let scaled = match units {
            Units::MgDl => format!("{}", change.abs()),
            Units::Mmol => format!("{:.1}", (change / crate::MGDL_PER_MMOL).abs()),
        };
        let sign = if change >= 0.0 { "+" } else { "-" };
        format!("{}{}", sign, scaled)
    }
}

/// Current glucose statistics derived from a history window
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
pub struct GlucoseStats {
    pub bg_now: Option<BgNow>,
    pub delta: Option<Delta>,
}

impl GlucoseStats {
    /// Compute statistics from unordered history
    pub fn from_history(history: &[GlucoseReading]) -> Self {
        let readings = valid_readings(history);
        let Some(newest) = readings.last() else {
            return Self::default();
        };

        let half_bucket = BUCKET_MINUTES * MINUTE_MS / 2;
        let anchor = newest.timestamp_ms + half_bucket;

        let buckets: Vec<Option<BgNow>> = (0..BUCKET_COUNT)
            .map(|index| {
                let to_ms = anchor - index * BUCKET_MINUTES * MINUTE_MS;
                let from_ms = to_ms - BUCKET_MINUTES * MINUTE_MS;
                bucket_stats(
                    readings
                        .iter()
                        .filter(|r| from_ms < r.timestamp_ms && r.timestamp_ms <= to_ms),
                )
            })
            .collect();

        let bg_now = buckets.first().cloned().flatten();
        let delta = bg_now.as_ref().and_then(|recent| {
            buckets
                .iter()
                .skip(1)
                .flatten()
                .next()
                .map(|previous| Delta::between(recent, previous))
        });

        tracing::debug!(
            "Glucose stats from {} readings: bg_now={:?} delta={:?}",
            readings.len(),
            bg_now.as_ref().map(|b| b.mean),
            delta.as_ref().map(|d| d.mgdl)
        );

        Self { bg_now, delta }
    }
}

fn bucket_stats<'a>(readings: impl Iterator<Item = &'a GlucoseReading>) -> Option<BgNow> {
    let mut count = 0usize;
    let mut sum = 0.0;
    let mut newest: Option<&GlucoseReading> = None;

    for reading in readings {
        count += 1;
        sum += reading.value_mgdl;
        if newest.map_or(true, |n| reading.timestamp_ms >= n.timestamp_ms) {
            newest = Some(reading);
        }
    }

    newest.map(|n| BgNow {
        mills: n.timestamp_ms,
        mean: sum / count as f64,
        last: n.value_mgdl,
        readings: count,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    const T0: i64 = 1_432_864_800_000;

    #[test]
    fn test_empty_history_has_no_stats() {
        let stats = GlucoseStats::from_history(&[]);
        assert!(stats.bg_now.is_none());
        assert!(stats.delta.is_none());
    }

    #[test]
    fn test_single_reading_has_no_delta() {
        let stats = GlucoseStats::from_history(&[GlucoseReading::new(T0, 120.0)]);
        assert_eq!(stats.bg_now.unwrap().mean, 120.0);
        assert!(stats.delta.is_none());
    }

    #[test]
    fn test_delta_over_five_minutes() {
        let history = vec![
            GlucoseReading::new(T0 + 5 * MINUTE_MS, 110.0),
            GlucoseReading::new(T0, 100.0),
        ];

        let stats = GlucoseStats::from_history(&history);
        let delta = stats.delta.unwrap();

        assert_eq!(stats.bg_now.unwrap().mean, 110.0);
        assert!(!delta.interpolated);
        assert_eq!(delta.mean_5_mins_ago, 100.0);
        assert_eq!(delta.mgdl, 10);
        assert_eq!(delta.display(Units::MgDl), "+10");
    }

    #[test]
    fn test_gap_is_interpolated() {
        let history = vec![
            GlucoseReading::new(T0, 100.0),
            GlucoseReading::new(T0 + 10 * MINUTE_MS, 120.0),
        ];

        let delta = GlucoseStats::from_history(&history).delta.unwrap();

        assert!(delta.interpolated);
        assert_eq!(delta.elapsed_mins, 10.0);
        assert!((delta.mean_5_mins_ago - 110.0).abs() < 1e-9);
        assert_eq!(delta.mgdl, 10);
    }

    #[test]
    fn test_readings_in_same_bucket_are_averaged() {
        let history = vec![
            GlucoseReading::new(T0, 100.0),
            GlucoseReading::new(T0 + 4 * MINUTE_MS, 90.0),
            GlucoseReading::new(T0 + 5 * MINUTE_MS, 110.0),
        ];

        let bg_now = GlucoseStats::from_history(&history).bg_now.unwrap();

        assert_eq!(bg_now.readings, 2);
        assert_eq!(bg_now.mean, 100.0);
        assert_eq!(bg_now.last, 110.0);
        assert_eq!(bg_now.mills, T0 + 5 * MINUTE_MS);
    }

    #[test]
    fn test_negative_delta_display_in_mmol() {
        let recent = BgNow { mills: T0 + 5 * MINUTE_MS, mean: 90.0, last: 90.0, readings: 1 };
        let previous = BgNow { mills: T0, mean: 99.0, last: 99.0, readings: 1 };
        let delta = Delta::between(&recent, &previous);
        assert_eq!(delta.display(Units::Mmol), "-0.5");
    }
}

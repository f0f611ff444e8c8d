//! Temporary overrides layered over the base schedules.

use crate::{Treatment, HOUR_MS};

/// Start-sorted overrides of one kind
///
/// Windows are truncated at the next start so at most one entry is active
/// at any instant and a lookup only has to inspect the latest start.
#[derive(Clone, Debug, Default)]
pub(crate) struct OverrideTrack {
    entries: Vec<Treatment>,
}

impl OverrideTrack {
    pub(crate) fn new(treatments: Vec<Treatment>, keep: fn(&Treatment) -> bool) -> Self {
        let mut entries: Vec<Treatment> = treatments.into_iter().filter(keep).collect();
        entries.sort_by_key(|t| t.timestamp_ms);

        let next_starts: Vec<Option<i64>> = entries
            .iter()
            .skip(1)
            .map(|t| Some(t.timestamp_ms))
            .chain(std::iter::once(None))
            .collect();

        for (entry, next_start) in entries.iter_mut().zip(next_starts) {
            if let Some(next) = next_start {
                if entry.duration_ms() > 0 && entry.end_ms() > next {
                    entry.duration_min = Some((next - entry.timestamp_ms) as f64 / 60_000.0);
                }
            }
        }

        Self { entries }
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }

    /// The latest entry starting at or before `time_ms`
    fn latest_started(&self, time_ms: i64) -> Option<(usize, &Treatment)> {
        let idx = self.entries.partition_point(|t| t.timestamp_ms <= time_ms);
        idx.checked_sub(1).map(|i| (i, &self.entries[i]))
    }

    /// The entry whose `[start, start + duration)` window holds `time_ms`
    pub(crate) fn active_at(&self, time_ms: i64) -> Option<&Treatment> {
        self.latest_started(time_ms)
            .map(|(_, t)| t)
            .filter(|t| t.is_active_at(time_ms))
    }

    /// Like [`active_at`](Self::active_at) but an entry without a duration
    /// stays in force until the next one starts. An expired temporary
    /// entry hands back to the most recent open-ended entry before it.
    pub(crate) fn in_force_at(&self, time_ms: i64) -> Option<&Treatment> {
        let (idx, _) = self.latest_started(time_ms)?;
        self.entries[..=idx]
            .iter()
            .rev()
            .find(|t| t.duration_ms() == 0 || t.is_active_at(time_ms))
    }
}

/// The override sets replaced by `update_treatments`
#[derive(Clone, Debug, Default)]
pub(crate) struct Overrides {
    pub temp_basals: OverrideTrack,
    pub combo_boluses: OverrideTrack,
    pub profile_switches: OverrideTrack,
}

/// Circadian adjustment carried by a profile switch
#[derive(Clone, Copy, Debug, PartialEq)]
pub(crate) struct Circadian {
    pub percentage: f64,
    pub timeshift_ms: i64,
}

impl Default for Circadian {
    fn default() -> Self {
        Self {
            percentage: 100.0,
            timeshift_ms: 0,
        }
    }
}

impl Circadian {
    pub(crate) fn from_switch(treatment: &Treatment) -> Self {
        let percentage = treatment
            .percentage
            .filter(|p| p.is_finite() && *p > 0.0)
            .unwrap_or(100.0);
        let shift_hours = treatment
            .timeshift_hours
            .filter(|h| h.is_finite())
            .map(|h| h % 24.0)
            .unwrap_or(0.0);

        Self {
            percentage,
            timeshift_ms: (shift_hours * HOUR_MS as f64).round() as i64,
        }
    }

    pub(crate) fn is_identity(&self) -> bool {
        self.percentage == 100.0 && self.timeshift_ms == 0
    }
}

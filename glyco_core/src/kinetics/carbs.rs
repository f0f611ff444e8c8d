//! Carb absorption and carbs on board.
//!
//! Carbs sit undigested for a delay, then absorb linearly at the profile's
//! rate. Overlapping meals queue up: a later entry only starts decaying once
//! the earlier ones are gone. Active insulin pushes the horizon further out
//! because the liver releases less glucose while insulin is acting.

use super::KineticsSettings;
use crate::{ProfileResolver, Result, Treatment, HOUR_MS, MINUTE_MS};

/// Note phrases that slow absorption (fat and protein delay gastric emptying)
const SLOW_MARKERS: &[&[&str]] = &[&["high", "fat"], &["highfat"], &["fatty"], &["protein"]];

/// Note phrases that mark fast-acting carbs
const FAST_MARKERS: &[&[&str]] = &[
    &["juice"],
    &["glucose", "tab"],
    &["glucose", "tabs"],
    &["dextrose"],
    &["fast"],
];

/// Rate multiplier implied by free-text treatment notes
pub(crate) fn note_factor(notes: Option<&str>) -> f64 {
    let Some(notes) = notes else {
        return 1.0;
    };

    let lower = notes.to_lowercase();
    let words: Vec<&str> = lower
        .split(|c: char| !c.is_alphanumeric())
        .filter(|w| !w.is_empty())
        .collect();
    let mentions = |markers: &[&[&str]]| {
        markers
            .iter()
            .any(|phrase| words.windows(phrase.len()).any(|w| w == *phrase))
    };

    let mut factor = 1.0;
    if mentions(SLOW_MARKERS) {
        factor *= 0.5;
    }
    if mentions(FAST_MARKERS) {
        factor *= 2.0;
    }
    factor
}

/// How one carb entry absorbs
#[derive(Clone, Copy, Debug, PartialEq)]
pub(crate) struct Absorption {
    /// Grams absorbed per hour once decay has started
    pub carbs_hr: f64,
    /// Minutes before absorption starts
    pub delay_min: f64,
}

impl Absorption {
    pub(crate) fn for_treatment(
        treatment: &Treatment,
        profile: &ProfileResolver,
        settings: &KineticsSettings,
    ) -> Result<Self> {
        let at = treatment.timestamp_ms;
        let profile_rate = profile
            .carb_absorption_rate(at, None)?
            .filter(|r| r.is_finite() && *r > 0.0)
            .unwrap_or(settings.default_carbs_hr);
        let delay_min = profile
            .carb_delay(at, None)?
            .filter(|d| d.is_finite() && *d >= 0.0)
            .unwrap_or(settings.default_carb_delay_min);

        let override_min = treatment
            .absorption_time_override_min
            .filter(|m| m.is_finite() && *m > 0.0);

        let carbs_hr = match (override_min, treatment.carb_grams()) {
            (Some(minutes), Some(carbs)) => carbs / minutes * 60.0,
            _ => {
                let factor = note_factor(treatment.notes.as_deref());
                if factor != 1.0 {
                    tracing::debug!(
                        "Carbs at {}: notes {:?} scale absorption by {}",
                        at,
                        treatment.notes,
                        factor
                    );
                }
                profile_rate * factor
            }
        };

        Ok(Self {
            carbs_hr,
            delay_min,
        })
    }

    fn carbs_per_min(&self) -> f64 {
        self.carbs_hr / 60.0
    }
}

/// Decay window of one carb entry
#[derive(Clone, Copy, Debug, PartialEq)]
pub(crate) struct CarbDecay {
    /// When the entry is fully absorbed
    pub decayed_by_ms: i64,
    /// True once absorption has started (or an earlier entry is still absorbing)
    pub is_decaying: bool,
}

/// Decay window of `carbs` eaten at `start_ms` queued behind earlier entries
///
/// `last_decayed_by_ms` is when the previous entry finishes; the new entry
/// waits for whichever is later, that or its own delay. The horizon is
/// counted in whole minutes.
pub(crate) fn decay(
    carbs: f64,
    start_ms: i64,
    absorption: Absorption,
    last_decayed_by_ms: i64,
    at_ms: i64,
) -> CarbDecay {
    let minutes_left = last_decayed_by_ms.saturating_sub(start_ms) as f64 / MINUTE_MS as f64;
    let absorb_minutes =
        absorption.delay_min.max(minutes_left) + carbs / absorption.carbs_per_min();
    let decayed_by_ms =
        start_ms.saturating_add((absorb_minutes.trunc() as i64).saturating_mul(MINUTE_MS));

    let start_decay_ms =
        start_ms.saturating_add((absorption.delay_min * MINUTE_MS as f64).round() as i64);

    CarbDecay {
        decayed_by_ms,
        is_decaying: at_ms < last_decayed_by_ms || at_ms > start_decay_ms,
    }
}

/// Grams left of `carbs` at `at_ms` given its decay window
pub(crate) fn remaining(carbs: f64, window: &CarbDecay, absorption: Absorption, at_ms: i64) -> f64 {
    let decays_in_hr = window.decayed_by_ms.saturating_sub(at_ms) as f64 / HOUR_MS as f64;
    (decays_in_hr * absorption.carbs_hr).clamp(0.0, carbs)
}

/// Carbs on board summed over a treatment history
#[derive(Clone, Debug, Default, PartialEq)]
pub(crate) struct CarbsOnBoard {
    pub cob: f64,
    pub decayed_by_ms: Option<i64>,
    pub is_decaying: bool,
    pub contributing: Vec<Treatment>,
}

/// Extra minutes the liver delay adds to a carb horizon
///
/// Missing or failing sensitivity/ratio lookups mean no delay.
fn liver_delay_minutes(
    treatment: &Treatment,
    absorption: Absorption,
    avg_activity: f64,
    profile: &ProfileResolver,
    settings: &KineticsSettings,
) -> i64 {
    if avg_activity <= 0.0 {
        return 0;
    }

    let at = treatment.timestamp_ms;
    let ratios = || -> Result<Option<(f64, f64)>> {
        Ok(profile
            .sensitivity(at, None)?
            .zip(profile.carb_ratio(at, None)?))
    };

    match ratios() {
        Ok(Some((sens, carb_ratio))) if sens > 0.0 => {
            // BG * scalar / (BG/U) * (g/U) = g
            let delayed_carbs = avg_activity * settings.liver_sens_ratio / sens * carb_ratio;
            (delayed_carbs / absorption.carbs_hr * 60.0).round() as i64
        }
        Ok(_) => 0,
        Err(err) => {
            tracing::debug!("No liver delay for carbs at {}: {}", at, err);
            0
        }
    }
}

/// Sum carbs on board at `at_ms` from start-sorted treatments
///
/// Only entries strictly before `at_ms` count. An entry that has fully
/// absorbed resets the running total, since everything queued before it
/// is gone too. `activity_at` supplies insulin activity for the liver delay.
pub(crate) fn carbs_on_board(
    sorted: &[&Treatment],
    profile: &ProfileResolver,
    settings: &KineticsSettings,
    at_ms: i64,
    activity_at: &dyn Fn(i64) -> Result<f64>,
) -> Result<CarbsOnBoard> {
    let mut total = CarbsOnBoard::default();
    let mut last_decayed_by_ms = 0;

    for treatment in sorted.iter().copied() {
        let Some(carbs) = treatment.carb_grams() else {
            continue;
        };
        if treatment.timestamp_ms >= at_ms {
            continue;
        }

        let absorption = Absorption::for_treatment(treatment, profile, settings)?;
        let mut window = decay(
            carbs,
            treatment.timestamp_ms,
            absorption,
            last_decayed_by_ms,
            at_ms,
        );

        let decays_in_hr = window.decayed_by_ms.saturating_sub(at_ms) as f64 / HOUR_MS as f64;
        if decays_in_hr > -10.0 {
            let avg_activity =
                (activity_at(last_decayed_by_ms)? + activity_at(window.decayed_by_ms)?) / 2.0;
            let delay =
                liver_delay_minutes(treatment, absorption, avg_activity, profile, settings);
            if delay > 0 {
                window.decayed_by_ms =
                    window.decayed_by_ms.saturating_add(delay.saturating_mul(MINUTE_MS));
            }
        }
        last_decayed_by_ms = window.decayed_by_ms;

        let left = remaining(carbs, &window, absorption, at_ms);
        if left > 0.0 {
            total.cob += left;
            total.is_decaying = window.is_decaying;
            total.contributing.push(treatment.clone());
        } else {
            total.cob = 0.0;
            total.contributing.clear();
        }
        total.decayed_by_ms = Some(window.decayed_by_ms);
    }

    Ok(total)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{ProfileSchedule, ProfileStore};
    use chrono::DateTime;

    fn ms(rfc3339: &str) -> i64 {
        DateTime::parse_from_rfc3339(rfc3339)
            .unwrap()
            .timestamp_millis()
    }

    fn profile() -> ProfileResolver {
        crate::logging::init_test();
        ProfileResolver::with_store(&ProfileStore::single(
            "Default",
            ProfileSchedule {
                carbs_hr: Some(30.0),
                sens: Some(95.0.into()),
                carbratio: Some(18.0.into()),
                ..Default::default()
            },
        ))
        .unwrap()
    }

    fn cob_at(treatments: &[Treatment], at: i64) -> CarbsOnBoard {
        let sorted: Vec<&Treatment> = treatments.iter().collect();
        carbs_on_board(
            &sorted,
            &profile(),
            &KineticsSettings::default(),
            at,
            &|_| Ok(0.0),
        )
        .unwrap()
    }

    #[test]
    fn test_single_small_dose() {
        let start = ms("2015-05-29T02:00:00.000Z");
        let treatments = [Treatment::carbs(start, 8.0)];

        assert_eq!(cob_at(&treatments, start + MINUTE_MS).cob, 8.0);
        assert_eq!(cob_at(&treatments, start + 24 * MINUTE_MS).cob, 6.0);
        assert_eq!(cob_at(&treatments, start + 40 * MINUTE_MS).cob, 0.0);
        assert_eq!(cob_at(&treatments, start + 130 * MINUTE_MS).cob, 0.0);
    }

    #[test]
    fn test_second_dose_queues_behind_first() {
        let first = ms("2015-05-29T02:03:48.827Z");
        let second = ms("2015-05-29T03:45:10.670Z");
        let treatments = [Treatment::carbs(first, 100.0), Treatment::carbs(second, 10.0)];

        let after_first = cob_at(&treatments, ms("2015-05-29T02:03:49.827Z"));
        assert_eq!(after_first.cob, 100.0);

        let before_second = cob_at(&treatments, second);
        assert_eq!(before_second.cob.round(), 59.0);
        assert_eq!(before_second.contributing.len(), 1);

        let after_second = cob_at(&treatments, ms("2015-05-29T03:45:11.670Z"));
        assert_eq!(after_second.cob.round(), 69.0);
        assert_eq!(after_second.contributing.len(), 2);
        assert_eq!(
            after_second.decayed_by_ms,
            Some(second + 138 * MINUTE_MS)
        );
    }

    #[test]
    fn test_extreme_override_stays_in_bounds() {
        let start = ms("2015-05-29T02:00:00.000Z");
        let mut slow = Treatment::carbs(start, 20.0);
        slow.absorption_time_override_min = Some(1e300);

        let result = cob_at(&[slow], start + HOUR_MS);
        assert!(result.cob > 0.0 && result.cob <= 20.0);
        assert_eq!(result.decayed_by_ms, Some(i64::MAX));
    }

    #[test]
    fn test_future_entries_do_not_count() {
        let start = ms("2015-05-29T02:00:00.000Z");
        let result = cob_at(&[Treatment::carbs(start, 20.0)], start);
        assert_eq!(result.cob, 0.0);
        assert_eq!(result.decayed_by_ms, None);
    }

    #[test]
    fn test_remaining_never_increases() {
        let start = ms("2015-05-29T02:00:00.000Z");
        let treatments = [Treatment::carbs(start, 45.0)];

        let mut last = f64::MAX;
        for minute in 1..200 {
            let cob = cob_at(&treatments, start + minute * MINUTE_MS).cob;
            assert!((0.0..=45.0).contains(&cob));
            assert!(cob <= last, "rose at minute {}", minute);
            last = cob;
        }
        assert_eq!(last, 0.0);
    }

    #[test]
    fn test_absorption_override_sets_rate() {
        let start = ms("2015-05-29T02:00:00.000Z");
        let mut meal = Treatment::carbs(start, 30.0);
        meal.absorption_time_override_min = Some(180.0);

        let absorption =
            Absorption::for_treatment(&meal, &profile(), &KineticsSettings::default()).unwrap();
        assert_eq!(absorption.carbs_hr, 10.0);
        assert_eq!(absorption.delay_min, 20.0);

        // 20 min delay + 180 min absorption
        let window = decay(30.0, start, absorption, 0, start);
        assert_eq!(window.decayed_by_ms, start + 200 * MINUTE_MS);
    }

    #[test]
    fn test_note_markers_adjust_rate() {
        assert_eq!(note_factor(None), 1.0);
        assert_eq!(note_factor(Some("Pizza, high-fat")), 0.5);
        assert_eq!(note_factor(Some("protein shake")), 0.5);
        assert_eq!(note_factor(Some("Apple Juice")), 2.0);
        assert_eq!(note_factor(Some("2 glucose tabs")), 2.0);
        assert_eq!(note_factor(Some("fast carbs")), 2.0);
        // Only whole words count
        assert_eq!(note_factor(Some("breakfast")), 1.0);

        let start = ms("2015-05-29T02:00:00.000Z");
        let mut juice = Treatment::carbs(start, 15.0);
        juice.notes = Some("juice".into());
        let absorption =
            Absorption::for_treatment(&juice, &profile(), &KineticsSettings::default()).unwrap();
        assert_eq!(absorption.carbs_hr, 60.0);
    }

    #[test]
    fn test_insulin_activity_delays_decay() {
        let start = ms("2015-05-29T02:00:00.000Z");
        let treatments = [Treatment::carbs(start, 8.0)];
        let sorted: Vec<&Treatment> = treatments.iter().collect();

        let with_activity = carbs_on_board(
            &sorted,
            &profile(),
            &KineticsSettings::default(),
            start + 40 * MINUTE_MS,
            &|_| Ok(10.0),
        )
        .unwrap();

        // 10 * 8 / 95 * 18 g at 30 g/h is 30 extra minutes
        assert_eq!(
            with_activity.decayed_by_ms,
            Some(start + (36 + 30) * MINUTE_MS)
        );
        assert_eq!(with_activity.cob, 8.0);
    }

    #[test]
    fn test_missing_sensitivity_means_no_liver_delay() {
        let resolver = ProfileResolver::with_store(&ProfileStore::single(
            "Default",
            ProfileSchedule {
                carbs_hr: Some(30.0),
                ..Default::default()
            },
        ))
        .unwrap();
        let start = ms("2015-05-29T02:00:00.000Z");
        let treatments = [Treatment::carbs(start, 8.0)];
        let sorted: Vec<&Treatment> = treatments.iter().collect();

        let result = carbs_on_board(
            &sorted,
            &resolver,
            &KineticsSettings::default(),
            start + MINUTE_MS,
            &|_| Ok(0.5),
        )
        .unwrap();
        assert_eq!(result.decayed_by_ms, Some(start + 36 * MINUTE_MS));
    }
}

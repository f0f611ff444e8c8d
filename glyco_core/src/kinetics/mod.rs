//! Insulin on board (IOB) and carbs on board (COB).
//!
//! Both totals follow the same source priority: a fresh value reported by a
//! loop controller or pump wins outright, and only when no device reports
//! one is the total integrated from the treatment history. The two are
//! never blended.

mod carbs;
mod device;
mod insulin;

pub use device::{from_device_status, DeviceReading, Quantity};
pub use insulin::{InsulinAction, InsulinCurve, DEFAULT_CURVE};

use crate::profile::DEFAULT_DIA_HOURS;
use crate::{DeviceStatus, ProfileResolver, Result, Treatment, MINUTE_MS};
use serde::{Deserialize, Serialize};

/// Source label of totals computed from treatments
pub const CARE_PORTAL_SOURCE: &str = "Care Portal";

/// Tunables for the kinetics engine, resolved once from configuration
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct KineticsSettings {
    pub insulin_curve: InsulinCurve,
    /// Device statuses older than this are ignored
    pub staleness_minutes: f64,
    /// Device statuses further ahead than this are ignored
    pub future_tolerance_minutes: f64,
    /// Carb absorption rate when the profile has none, g/h
    pub default_carbs_hr: f64,
    /// Carb absorption delay when the profile has none
    pub default_carb_delay_min: f64,
    /// Blood glucose held back by the liver per unit of insulin activity
    pub liver_sens_ratio: f64,
}

impl Default for KineticsSettings {
    fn default() -> Self {
        Self {
            insulin_curve: InsulinCurve::default(),
            staleness_minutes: 30.0,
            future_tolerance_minutes: 5.0,
            default_carbs_hr: 30.0,
            default_carb_delay_min: 20.0,
            liver_sens_ratio: 8.0,
        }
    }
}

/// What a single treatment contributes at an instant
#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize, PartialEq)]
pub struct TreatmentContribution {
    /// Grams still to absorb
    pub carb_contrib: f64,
    /// Units still on board
    pub insulin_contrib: f64,
    /// Expected glucose drop per minute, mg/dL
    pub insulin_activity_contrib: f64,
}

/// An IOB or COB total and where it came from
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct KineticsResult {
    pub quantity: Quantity,
    pub value: f64,
    /// Vendor tag of the reporting device, or [`CARE_PORTAL_SOURCE`]
    pub source: String,
    pub device: Option<String>,
    /// Upload time of the device status used
    pub reported_at_ms: Option<i64>,
    pub contributing_treatments: Vec<Treatment>,
    /// Insulin activity, mg/dL per minute
    pub activity: f64,
    /// When the last carb entry is fully absorbed
    pub decayed_by_ms: Option<i64>,
    pub is_decaying: bool,
    pub display_line: String,
}

impl KineticsResult {
    fn computed(quantity: Quantity, value: f64) -> Self {
        Self {
            quantity,
            value,
            source: CARE_PORTAL_SOURCE.to_string(),
            device: None,
            reported_at_ms: None,
            contributing_treatments: Vec::new(),
            activity: 0.0,
            decayed_by_ms: None,
            is_decaying: false,
            display_line: display_line(quantity, value),
        }
    }

    fn reported(quantity: Quantity, reading: DeviceReading) -> Self {
        Self {
            source: reading.source,
            device: Some(reading.device),
            reported_at_ms: Some(reading.timestamp_ms),
            ..Self::computed(quantity, reading.value)
        }
    }
}

/// `"IOB: 1.25U"` or `"COB: 59g"`
pub fn display_line(quantity: Quantity, value: f64) -> String {
    match quantity {
        Quantity::Iob => format!("IOB: {:.2}U", value),
        Quantity::Cob => format!("COB: {}g", value.round()),
    }
}

/// Run strategies in order and keep the first that yields a value
///
/// Errors stop the chain.
pub fn first_success<T>(strategies: &[&dyn Fn() -> Result<Option<T>>]) -> Result<Option<T>> {
    for strategy in strategies {
        if let Some(value) = strategy()? {
            return Ok(Some(value));
        }
    }
    Ok(None)
}

struct InsulinOnBoard<'a> {
    iob: f64,
    activity: f64,
    contributing: Vec<&'a Treatment>,
}

/// Stateless IOB/COB calculator
#[derive(Clone, Debug, Default)]
pub struct KineticsEngine {
    settings: KineticsSettings,
}

impl KineticsEngine {
    pub fn new(settings: KineticsSettings) -> Self {
        Self { settings }
    }

    pub fn settings(&self) -> &KineticsSettings {
        &self.settings
    }

    /// Insulin remaining and activity of one treatment at `at_ms`
    ///
    /// Activity is scaled by the insulin sensitivity at `at_ms`; without a
    /// usable sensitivity it is 0.
    fn insulin_contribution(
        &self,
        treatment: &Treatment,
        profile: &ProfileResolver,
        at_ms: i64,
    ) -> Result<(f64, f64)> {
        let Some(units) = treatment.insulin_units() else {
            return Ok((0.0, 0.0));
        };
        if treatment.timestamp_ms > at_ms {
            return Ok((0.0, 0.0));
        }

        let dia = profile
            .dia(at_ms, None)?
            .filter(|d| d.is_finite() && *d > 0.0)
            .unwrap_or(DEFAULT_DIA_HOURS);
        let minutes_ago = (at_ms - treatment.timestamp_ms) as f64 / MINUTE_MS as f64;
        let action = self.settings.insulin_curve.action(minutes_ago, dia);

        let sens = match profile.sensitivity(at_ms, None) {
            Ok(sens) => sens.unwrap_or(0.0),
            Err(err) => {
                tracing::debug!("No insulin activity at {}: {}", at_ms, err);
                0.0
            }
        };

        Ok((units * action.remaining, sens * units * action.activity))
    }

    fn insulin_on_board<'a>(
        &self,
        treatments: &'a [Treatment],
        profile: &ProfileResolver,
        at_ms: i64,
    ) -> Result<InsulinOnBoard<'a>> {
        let mut total = InsulinOnBoard {
            iob: 0.0,
            activity: 0.0,
            contributing: Vec::new(),
        };
        for treatment in treatments {
            let (iob, activity) = self.insulin_contribution(treatment, profile, at_ms)?;
            if iob > 0.0 {
                total.contributing.push(treatment);
            }
            total.iob += iob;
            total.activity += activity;
        }
        Ok(total)
    }

    /// What `treatment` alone contributes at `at_ms`
    ///
    /// The carb part ignores other meals and the liver delay; it falls from
    /// the full amount to 0 at the end of the absorption horizon.
    pub fn calc_treatment_contribution(
        &self,
        treatment: &Treatment,
        profile: &ProfileResolver,
        at_ms: i64,
    ) -> Result<TreatmentContribution> {
        let carb_contrib = match treatment.carb_grams() {
            Some(grams) if treatment.timestamp_ms < at_ms => {
                let absorption = carbs::Absorption::for_treatment(treatment, profile, &self.settings)?;
                let window = carbs::decay(grams, treatment.timestamp_ms, absorption, 0, at_ms);
                carbs::remaining(grams, &window, absorption, at_ms)
            }
            _ => 0.0,
        };
        let (insulin_contrib, insulin_activity_contrib) =
            self.insulin_contribution(treatment, profile, at_ms)?;

        Ok(TreatmentContribution {
            carb_contrib,
            insulin_contrib,
            insulin_activity_contrib,
        })
    }

    /// Insulin on board at `at_ms`
    pub fn iob_total(
        &self,
        treatments: &[Treatment],
        device_statuses: &[DeviceStatus],
        profile: &ProfileResolver,
        at_ms: i64,
    ) -> Result<KineticsResult> {
        let from_device = || -> Result<Option<KineticsResult>> {
            Ok(
                device::latest_reported(device_statuses, Quantity::Iob, at_ms, &self.settings)
                    .map(|reading| KineticsResult::reported(Quantity::Iob, reading)),
            )
        };
        let from_treatments = || -> Result<Option<KineticsResult>> {
            let total = self.insulin_on_board(treatments, profile, at_ms)?;
            let iob = (total.iob * 1000.0).round() / 1000.0;
            Ok(Some(KineticsResult {
                activity: total.activity,
                contributing_treatments: total.contributing.into_iter().cloned().collect(),
                ..KineticsResult::computed(Quantity::Iob, iob)
            }))
        };

        let strategies: [&dyn Fn() -> Result<Option<KineticsResult>>; 2] =
            [&from_device, &from_treatments];
        let result = first_success(&strategies)?
            .unwrap_or_else(|| KineticsResult::computed(Quantity::Iob, 0.0));

        tracing::debug!("{} at {} from {}", result.display_line, at_ms, result.source);
        Ok(result)
    }

    /// Carbs on board at `at_ms`
    pub fn cob_total(
        &self,
        treatments: &[Treatment],
        device_statuses: &[DeviceStatus],
        profile: &ProfileResolver,
        at_ms: i64,
    ) -> Result<KineticsResult> {
        let from_device = || -> Result<Option<KineticsResult>> {
            Ok(
                device::latest_reported(device_statuses, Quantity::Cob, at_ms, &self.settings)
                    .map(|reading| KineticsResult::reported(Quantity::Cob, reading)),
            )
        };
        let from_treatments = || -> Result<Option<KineticsResult>> {
            let mut sorted: Vec<&Treatment> = treatments.iter().collect();
            sorted.sort_by_key(|t| t.timestamp_ms);

            let activity_at = |time_ms: i64| -> Result<f64> {
                Ok(self.insulin_on_board(treatments, profile, time_ms)?.activity)
            };
            let total =
                carbs::carbs_on_board(&sorted, profile, &self.settings, at_ms, &activity_at)?;

            Ok(Some(KineticsResult {
                contributing_treatments: total.contributing,
                decayed_by_ms: total.decayed_by_ms,
                is_decaying: total.is_decaying,
                ..KineticsResult::computed(Quantity::Cob, total.cob)
            }))
        };

        let strategies: [&dyn Fn() -> Result<Option<KineticsResult>>; 2] =
            [&from_device, &from_treatments];
        let result = first_success(&strategies)?
            .unwrap_or_else(|| KineticsResult::computed(Quantity::Cob, 0.0));

        tracing::debug!("{} at {} from {}", result.display_line, at_ms, result.source);
        Ok(result)
    }
}

//! Core domain types shared by the resolver and the engines.
//!
//! This module defines the raw inputs the data-access layer hands us:
//! - Glucose readings
//! - Treatments (boluses, carbs, temp basals, combo boluses, profile switches)
//! - Device statuses reported by closed-loop systems and pumps
//! - Display units

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Milliseconds per minute
pub const MINUTE_MS: i64 = 60_000;

/// Milliseconds per hour
pub const HOUR_MS: i64 = 60 * MINUTE_MS;

/// Readings below this are sensor error codes, not glucose values
pub const MIN_VALID_MGDL: f64 = 39.0;

/// Conversion factor between mg/dL and mmol/L
pub const MGDL_PER_MMOL: f64 = 18.0;

// ============================================================================
// Glucose
// ============================================================================

/// A single sensor glucose value
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct GlucoseReading {
    pub timestamp_ms: i64,
    pub value_mgdl: f64,
    #[serde(default)]
    pub noise_level: Option<u8>,
}

impl GlucoseReading {
    pub fn new(timestamp_ms: i64, value_mgdl: f64) -> Self {
        Self {
            timestamp_ms,
            value_mgdl,
            noise_level: None,
        }
    }

    /// True when the value is an actual glucose level rather than an error code
    pub fn is_valid(&self) -> bool {
        self.value_mgdl.is_finite() && self.value_mgdl >= MIN_VALID_MGDL
    }
}

/// Glucose display units
#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
pub enum Units {
    #[default]
    #[serde(rename = "mg/dl", alias = "mg/dL", alias = "mgdl")]
    MgDl,
    #[serde(rename = "mmol", alias = "mmol/L", alias = "mmol/l")]
    Mmol,
}

impl Units {
    pub fn label(self) -> &'static str {
        match self {
            Units::MgDl => "mg/dl",
            Units::Mmol => "mmol/L",
        }
    }

    /// Convert a mg/dL value into these units
    pub fn scale(self, mgdl: f64) -> f64 {
        match self {
            Units::MgDl => mgdl.round(),
            Units::Mmol => (mgdl / MGDL_PER_MMOL * 10.0).round() / 10.0,
        }
    }

    /// Format a mg/dL value in these units without the label
    pub fn format(self, mgdl: f64) -> String {
        match self {
            Units::MgDl => format!("{}", self.scale(mgdl)),
            Units::Mmol => format!("{:.1}", self.scale(mgdl)),
        }
    }

    /// Convert a value expressed in these units to mg/dL
    pub fn to_mgdl(self, value: f64) -> f64 {
        match self {
            Units::MgDl => value,
            Units::Mmol => value * MGDL_PER_MMOL,
        }
    }
}

// ============================================================================
// Treatments
// ============================================================================

/// Care-portal event type of a treatment record
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
pub enum EventType {
    #[serde(rename = "Meal Bolus")]
    MealBolus,
    #[serde(rename = "Correction Bolus")]
    CorrectionBolus,
    #[serde(rename = "Carb Correction")]
    CarbCorrection,
    #[serde(rename = "Temp Basal")]
    TempBasal,
    #[serde(rename = "Combo Bolus")]
    ComboBolus,
    #[serde(rename = "Profile Switch")]
    ProfileSwitch,
    #[serde(rename = "Note")]
    Note,
    #[default]
    #[serde(other)]
    Other,
}

/// A treatment record
///
/// One record may carry several roles at once (a meal bolus has both
/// carbs and insulin); the engines look only at the fields they need.
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
pub struct Treatment {
    pub timestamp_ms: i64,
    #[serde(default)]
    pub event_type: EventType,
    #[serde(default)]
    pub carbs: Option<f64>,
    #[serde(default)]
    pub insulin: Option<f64>,
    #[serde(default)]
    pub duration_min: Option<f64>,
    /// Absolute temp basal rate in U/h
    #[serde(default)]
    pub absolute_rate: Option<f64>,
    /// Relative temp basal change in percent (-50 halves the rate)
    #[serde(default)]
    pub percent_rate: Option<f64>,
    /// Combo bolus extension rate in U/h
    #[serde(default)]
    pub relative_rate: Option<f64>,
    #[serde(default)]
    pub absorption_time_override_min: Option<f64>,
    #[serde(default)]
    pub notes: Option<String>,
    /// Target profile of a profile switch
    #[serde(default)]
    pub profile_name: Option<String>,
    /// Circadian percentage of a profile switch
    #[serde(default)]
    pub percentage: Option<f64>,
    #[serde(default)]
    pub timeshift_hours: Option<f64>,
}

impl Treatment {
    /// A carb entry
    pub fn carbs(timestamp_ms: i64, grams: f64) -> Self {
        Self {
            timestamp_ms,
            event_type: EventType::CarbCorrection,
            carbs: Some(grams),
            ..Default::default()
        }
    }

    /// An insulin bolus
    pub fn bolus(timestamp_ms: i64, units: f64) -> Self {
        Self {
            timestamp_ms,
            event_type: EventType::CorrectionBolus,
            insulin: Some(units),
            ..Default::default()
        }
    }

    /// A relative (percent) temp basal
    pub fn temp_basal_percent(timestamp_ms: i64, duration_min: f64, percent: f64) -> Self {
        Self {
            timestamp_ms,
            event_type: EventType::TempBasal,
            duration_min: Some(duration_min),
            percent_rate: Some(percent),
            ..Default::default()
        }
    }

    /// An absolute temp basal
    pub fn temp_basal_absolute(timestamp_ms: i64, duration_min: f64, rate: f64) -> Self {
        Self {
            timestamp_ms,
            event_type: EventType::TempBasal,
            duration_min: Some(duration_min),
            absolute_rate: Some(rate),
            ..Default::default()
        }
    }

    /// The extended part of a combo bolus
    pub fn combo_bolus(timestamp_ms: i64, duration_min: f64, relative_rate: f64) -> Self {
        Self {
            timestamp_ms,
            event_type: EventType::ComboBolus,
            duration_min: Some(duration_min),
            relative_rate: Some(relative_rate),
            ..Default::default()
        }
    }

    /// A switch to another named profile
    pub fn profile_switch(timestamp_ms: i64, profile_name: impl Into<String>) -> Self {
        Self {
            timestamp_ms,
            event_type: EventType::ProfileSwitch,
            profile_name: Some(profile_name.into()),
            ..Default::default()
        }
    }

    /// Carbs in grams, when positive
    pub fn carb_grams(&self) -> Option<f64> {
        self.carbs.filter(|c| c.is_finite() && *c > 0.0)
    }

    /// Insulin in units, when positive
    pub fn insulin_units(&self) -> Option<f64> {
        self.insulin.filter(|u| u.is_finite() && *u > 0.0)
    }

    pub fn duration_ms(&self) -> i64 {
        self.duration_min
            .filter(|d| d.is_finite() && *d > 0.0)
            .map(|d| (d * MINUTE_MS as f64).round() as i64)
            .unwrap_or(0)
    }

    pub fn end_ms(&self) -> i64 {
        self.timestamp_ms.saturating_add(self.duration_ms())
    }

    /// Active iff `start <= time < start + duration`
    pub fn is_active_at(&self, time_ms: i64) -> bool {
        self.timestamp_ms <= time_ms && time_ms < self.end_ms()
    }

    /// A rate change with a window, whatever the event type says
    pub fn is_temp_basal(&self) -> bool {
        (self.absolute_rate.is_some() || self.percent_rate.is_some()) && self.duration_ms() > 0
    }

    /// An extended bolus rate with a window
    pub fn is_combo_bolus(&self) -> bool {
        self.relative_rate.is_some() && self.duration_ms() > 0
    }

    pub fn is_profile_switch(&self) -> bool {
        self.event_type == EventType::ProfileSwitch
    }
}

// ============================================================================
// Device status
// ============================================================================

/// Which closed-loop system or device produced a status
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum SourceTag {
    Loop,
    OpenAps,
    Other(String),
}

impl Default for SourceTag {
    fn default() -> Self {
        SourceTag::Other("unknown".into())
    }
}

impl From<String> for SourceTag {
    fn from(value: String) -> Self {
        match value.to_ascii_lowercase().as_str() {
            "loop" => SourceTag::Loop,
            "openaps" => SourceTag::OpenAps,
            _ => SourceTag::Other(value),
        }
    }
}

impl From<SourceTag> for String {
    fn from(tag: SourceTag) -> Self {
        tag.to_string()
    }
}

impl fmt::Display for SourceTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SourceTag::Loop => write!(f, "Loop"),
            SourceTag::OpenAps => write!(f, "OpenAPS"),
            SourceTag::Other(name) => write!(f, "{}", name),
        }
    }
}

/// One element or a list of them (OpenAPS reports IOB either way)
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(untagged)]
pub enum OneOrMany<T> {
    One(T),
    Many(Vec<T>),
}

impl<T> OneOrMany<T> {
    pub fn first(&self) -> Option<&T> {
        match self {
            OneOrMany::One(item) => Some(item),
            OneOrMany::Many(items) => items.first(),
        }
    }
}

/// OpenAPS IOB sample
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
pub struct OpenApsIob {
    #[serde(default)]
    pub iob: Option<f64>,
    #[serde(default)]
    pub basaliob: Option<f64>,
    #[serde(default)]
    pub activity: Option<f64>,
    #[serde(default, alias = "timestamp")]
    pub time: Option<DateTime<Utc>>,
}

/// OpenAPS dosing suggestion (carries the loop's COB)
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
pub struct OpenApsSuggested {
    #[serde(default, rename = "COB")]
    pub cob: Option<f64>,
    #[serde(default)]
    pub timestamp: Option<DateTime<Utc>>,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
pub struct OpenApsPayload {
    #[serde(default)]
    pub iob: Option<OneOrMany<OpenApsIob>>,
    #[serde(default)]
    pub suggested: Option<OpenApsSuggested>,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
pub struct LoopIob {
    #[serde(default)]
    pub iob: Option<f64>,
    #[serde(default)]
    pub timestamp: Option<DateTime<Utc>>,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
pub struct LoopCob {
    #[serde(default)]
    pub cob: Option<f64>,
    #[serde(default)]
    pub timestamp: Option<DateTime<Utc>>,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
pub struct LoopPayload {
    #[serde(default)]
    pub iob: Option<LoopIob>,
    #[serde(default)]
    pub cob: Option<LoopCob>,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
pub struct PumpIob {
    #[serde(default)]
    pub iob: Option<f64>,
    #[serde(default)]
    pub bolusiob: Option<f64>,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
pub struct PumpPayload {
    #[serde(default)]
    pub iob: Option<PumpIob>,
    #[serde(default)]
    pub manufacturer: Option<String>,
}

/// A status upload from a loop controller or pump uploader
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
pub struct DeviceStatus {
    pub timestamp_ms: i64,
    #[serde(default)]
    pub device_id: String,
    #[serde(default)]
    pub source_tag: SourceTag,
    #[serde(default)]
    pub reported_iob: Option<f64>,
    #[serde(default)]
    pub reported_cob: Option<f64>,
    #[serde(default)]
    pub openaps: Option<OpenApsPayload>,
    #[serde(default, rename = "loop")]
    pub loop_status: Option<LoopPayload>,
    #[serde(default)]
    pub pump: Option<PumpPayload>,
}

impl DeviceStatus {
    /// A flat status with only top-level reported values
    pub fn reported(
        timestamp_ms: i64,
        device_id: impl Into<String>,
        source_tag: SourceTag,
        iob: Option<f64>,
        cob: Option<f64>,
    ) -> Self {
        Self {
            timestamp_ms,
            device_id: device_id.into(),
            source_tag,
            reported_iob: iob,
            reported_cob: cob,
            ..Default::default()
        }
    }
}

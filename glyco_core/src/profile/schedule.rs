//! Profile schedules: the authored form and the validated lookup form.
//!
//! Authored profiles follow the care-portal shape: a named store of
//! profiles, each parameter either a scalar or a list of `"HH:MM"`
//! breakpoints whose values may be numbers or numeric strings. Loading
//! compiles them into sorted offset/value arrays searched by index.

use crate::{Error, Result, Units};
use chrono::{DateTime, Timelike};
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::str::FromStr;

const SECONDS_PER_DAY: u32 = 24 * 60 * 60;

/// Default duration of insulin action in hours
pub const DEFAULT_DIA_HOURS: f64 = 3.0;

// ============================================================================
// Parameters
// ============================================================================

/// A time-of-day scheduled profile parameter
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Parameter {
    Basal,
    Sensitivity,
    CarbRatio,
    TargetLow,
    TargetHigh,
}

impl Parameter {
    pub const ALL: [Parameter; 5] = [
        Parameter::Basal,
        Parameter::Sensitivity,
        Parameter::CarbRatio,
        Parameter::TargetLow,
        Parameter::TargetHigh,
    ];

    fn index(self) -> usize {
        self as usize
    }

    /// Care-portal key of the parameter
    pub fn key(self) -> &'static str {
        match self {
            Parameter::Basal => "basal",
            Parameter::Sensitivity => "sens",
            Parameter::CarbRatio => "carbratio",
            Parameter::TargetLow => "target_low",
            Parameter::TargetHigh => "target_high",
        }
    }
}

impl fmt::Display for Parameter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.key())
    }
}

impl FromStr for Parameter {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "basal" => Ok(Parameter::Basal),
            "sens" | "sensitivity" | "isf" => Ok(Parameter::Sensitivity),
            "carbratio" | "carb_ratio" | "ic" => Ok(Parameter::CarbRatio),
            "target_low" | "low" => Ok(Parameter::TargetLow),
            "target_high" | "high" => Ok(Parameter::TargetHigh),
            other => Err(Error::InvalidInput(format!(
                "Unknown profile parameter: {}",
                other
            ))),
        }
    }
}

// ============================================================================
// Authored form
// ============================================================================

/// Numeric value that may arrive as a string
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(untagged)]
pub enum NumberOrString {
    Number(f64),
    Text(String),
}

impl NumberOrString {
    fn to_f64(&self) -> Option<f64> {
        let value = match self {
            NumberOrString::Number(n) => Some(*n),
            NumberOrString::Text(s) => s.trim().parse::<f64>().ok(),
        };
        value.filter(|v| v.is_finite())
    }
}

impl From<f64> for NumberOrString {
    fn from(value: f64) -> Self {
        NumberOrString::Number(value)
    }
}

/// One authored `(time-of-day, value)` pair
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct Breakpoint {
    /// `"HH:MM"` or `"HH:MM:SS"`
    pub time: String,
    pub value: NumberOrString,
    /// Precomputed offset some uploaders send along
    #[serde(default, rename = "timeAsSeconds", alias = "time_as_seconds")]
    pub time_as_seconds: Option<u32>,
}

impl Breakpoint {
    pub fn new(time: impl Into<String>, value: f64) -> Self {
        Self {
            time: time.into(),
            value: value.into(),
            time_as_seconds: None,
        }
    }
}

/// A parameter given either as a single value or as a schedule
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(untagged)]
pub enum ScheduleInput {
    Breakpoints(Vec<Breakpoint>),
    Constant(NumberOrString),
}

impl From<Vec<Breakpoint>> for ScheduleInput {
    fn from(points: Vec<Breakpoint>) -> Self {
        ScheduleInput::Breakpoints(points)
    }
}

impl From<f64> for ScheduleInput {
    fn from(value: f64) -> Self {
        ScheduleInput::Constant(value.into())
    }
}

/// One named therapy profile as authored
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
pub struct ProfileSchedule {
    /// Duration of insulin action in hours
    #[serde(default)]
    pub dia: Option<f64>,
    #[serde(default)]
    pub units: Units,
    /// IANA timezone name; UTC when absent
    #[serde(default)]
    pub timezone: Option<String>,
    /// Carb absorption rate in g/h
    #[serde(default)]
    pub carbs_hr: Option<f64>,
    /// Minutes before carbs start absorbing
    #[serde(default)]
    pub delay: Option<f64>,
    #[serde(default)]
    pub basal: Option<ScheduleInput>,
    #[serde(default)]
    pub sens: Option<ScheduleInput>,
    #[serde(default)]
    pub carbratio: Option<ScheduleInput>,
    #[serde(default)]
    pub target_low: Option<ScheduleInput>,
    #[serde(default)]
    pub target_high: Option<ScheduleInput>,
}

impl ProfileSchedule {
    fn input(&self, parameter: Parameter) -> Option<&ScheduleInput> {
        match parameter {
            Parameter::Basal => self.basal.as_ref(),
            Parameter::Sensitivity => self.sens.as_ref(),
            Parameter::CarbRatio => self.carbratio.as_ref(),
            Parameter::TargetLow => self.target_low.as_ref(),
            Parameter::TargetHigh => self.target_high.as_ref(),
        }
    }
}

/// The set of profiles loaded as one unit
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
pub struct ProfileStore {
    #[serde(rename = "defaultProfile", alias = "default_profile")]
    pub default_profile: String,
    pub store: BTreeMap<String, ProfileSchedule>,
}

impl ProfileStore {
    /// A store holding one profile, which is also the default
    pub fn single(name: impl Into<String>, profile: ProfileSchedule) -> Self {
        let name = name.into();
        let mut store = BTreeMap::new();
        store.insert(name.clone(), profile);
        Self {
            default_profile: name,
            store,
        }
    }
}

// ============================================================================
// Compiled form
// ============================================================================

/// Sorted breakpoints of one parameter
#[derive(Clone, Debug, Default)]
pub(crate) struct CompiledSchedule {
    offsets: Vec<u32>,
    values: Vec<f64>,
}

impl CompiledSchedule {
    fn compile(profile: &str, parameter: Parameter, input: Option<&ScheduleInput>) -> Result<Self> {
        let mut points: Vec<(u32, f64)> = match input {
            None => Vec::new(),
            Some(ScheduleInput::Constant(value)) => {
                vec![(0, parse_value(profile, parameter, value)?)]
            }
            Some(ScheduleInput::Breakpoints(breakpoints)) => breakpoints
                .iter()
                .map(|bp| {
                    let offset = match bp.time_as_seconds {
                        Some(secs) if secs < SECONDS_PER_DAY => secs,
                        _ => parse_time_of_day(&bp.time).ok_or_else(|| {
                            Error::Configuration(format!(
                                "Profile {:?} {}: invalid time {:?}",
                                profile, parameter, bp.time
                            ))
                        })?,
                    };
                    Ok((offset, parse_value(profile, parameter, &bp.value)?))
                })
                .collect::<Result<_>>()?,
        };

        // Stable sort, then keep the last value authored for a repeated time
        points.sort_by_key(|(offset, _)| *offset);
        let mut schedule = Self::default();
        for (offset, value) in points {
            if schedule.offsets.last() == Some(&offset) {
                if let Some(last) = schedule.values.last_mut() {
                    *last = value;
                }
            } else {
                schedule.offsets.push(offset);
                schedule.values.push(value);
            }
        }
        Ok(schedule)
    }

    pub(crate) fn len(&self) -> usize {
        self.offsets.len()
    }

    /// Value of the greatest breakpoint at or before `offset`, wrapping
    /// to the last breakpoint before the first one of the day.
    pub(crate) fn value_at(&self, offset_secs: u32) -> Option<f64> {
        let idx = self.offsets.partition_point(|&o| o <= offset_secs);
        if idx == 0 {
            self.values.last().copied()
        } else {
            Some(self.values[idx - 1])
        }
    }
}

fn parse_value(profile: &str, parameter: Parameter, value: &NumberOrString) -> Result<f64> {
    value.to_f64().ok_or_else(|| {
        Error::Configuration(format!(
            "Profile {:?} {}: non-numeric value {:?}",
            profile, parameter, value
        ))
    })
}

/// Parse `"HH:MM"` or `"HH:MM:SS"` into seconds from midnight
pub fn parse_time_of_day(raw: &str) -> Option<u32> {
    let mut parts = raw.trim().split(':');
    let hours: u32 = parts.next()?.parse().ok()?;
    let minutes: u32 = parts.next()?.parse().ok()?;
    let seconds: u32 = match parts.next() {
        Some(s) => s.parse().ok()?,
        None => 0,
    };
    if parts.next().is_some() || hours > 23 || minutes > 59 || seconds > 59 {
        return None;
    }
    Some(hours * 3600 + minutes * 60 + seconds)
}

/// A validated profile ready for lookups
#[derive(Clone, Debug)]
pub(crate) struct CompiledProfile {
    pub name: String,
    pub dia: Option<f64>,
    pub units: Units,
    pub timezone: Tz,
    pub carbs_hr: Option<f64>,
    pub delay: Option<f64>,
    schedules: [CompiledSchedule; 5],
}

impl CompiledProfile {
    fn compile(name: &str, profile: &ProfileSchedule) -> Result<Self> {
        let timezone = match profile.timezone.as_deref() {
            None | Some("") => Tz::UTC,
            Some(tz) => tz.parse::<Tz>().map_err(|e| {
                Error::Configuration(format!("Profile {:?}: invalid timezone {:?}: {}", name, tz, e))
            })?,
        };

        let schedules = [
            CompiledSchedule::compile(name, Parameter::Basal, profile.input(Parameter::Basal))?,
            CompiledSchedule::compile(
                name,
                Parameter::Sensitivity,
                profile.input(Parameter::Sensitivity),
            )?,
            CompiledSchedule::compile(name, Parameter::CarbRatio, profile.input(Parameter::CarbRatio))?,
            CompiledSchedule::compile(name, Parameter::TargetLow, profile.input(Parameter::TargetLow))?,
            CompiledSchedule::compile(
                name,
                Parameter::TargetHigh,
                profile.input(Parameter::TargetHigh),
            )?,
        ];

        Ok(Self {
            name: name.to_string(),
            dia: profile.dia.filter(|d| d.is_finite() && *d > 0.0),
            units: profile.units,
            timezone,
            carbs_hr: profile.carbs_hr.filter(|c| c.is_finite() && *c > 0.0),
            delay: profile.delay.filter(|d| d.is_finite() && *d >= 0.0),
            schedules,
        })
    }

    pub(crate) fn schedule(&self, parameter: Parameter) -> &CompiledSchedule {
        &self.schedules[parameter.index()]
    }

    /// Seconds since local midnight in the profile's timezone
    ///
    /// `None` for instants chrono cannot represent.
    pub(crate) fn seconds_from_midnight(&self, time_ms: i64) -> Option<u32> {
        let utc = DateTime::from_timestamp_millis(time_ms)?;
        Some(utc.with_timezone(&self.timezone).num_seconds_from_midnight())
    }

    /// Resolve a parameter at `time_ms`
    ///
    /// Fails when the parameter has no breakpoints; an unrepresentable
    /// timestamp has no value.
    pub(crate) fn value_at(&self, time_ms: i64, parameter: Parameter) -> Result<Option<f64>> {
        let schedule = self.schedule(parameter);
        if schedule.len() == 0 {
            return Err(Error::Configuration(format!(
                "Profile {:?} has no {} breakpoints",
                self.name, parameter
            )));
        }

        let Some(offset) = self.seconds_from_midnight(time_ms) else {
            tracing::warn!("Timestamp {} is out of range, no {} value", time_ms, parameter);
            return Ok(None);
        };
        Ok(schedule.value_at(offset))
    }
}

/// All profiles of a store, validated
#[derive(Clone, Debug)]
pub(crate) struct CompiledStore {
    pub default_profile: String,
    pub profiles: HashMap<String, CompiledProfile>,
}

impl CompiledStore {
    pub(crate) fn compile(store: &ProfileStore) -> Result<Self> {
        let profiles = store
            .store
            .iter()
            .map(|(name, profile)| Ok((name.clone(), CompiledProfile::compile(name, profile)?)))
            .collect::<Result<HashMap<_, _>>>()?;

        if !profiles.contains_key(&store.default_profile) {
            return Err(Error::Configuration(format!(
                "Default profile {:?} is not in the store",
                store.default_profile
            )));
        }

        Ok(Self {
            default_profile: store.default_profile.clone(),
            profiles,
        })
    }

    pub(crate) fn get(&self, name: &str) -> Option<&CompiledProfile> {
        self.profiles.get(name)
    }

    pub(crate) fn default_entry(&self) -> &CompiledProfile {
        // compile() guarantees the default exists
        &self.profiles[&self.default_profile]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn compile(points: Vec<Breakpoint>) -> CompiledSchedule {
        CompiledSchedule::compile("test", Parameter::Basal, Some(&points.into())).unwrap()
    }

    #[test]
    fn test_parse_time_of_day() {
        assert_eq!(parse_time_of_day("00:00"), Some(0));
        assert_eq!(parse_time_of_day("02:30"), Some(9000));
        assert_eq!(parse_time_of_day("23:59:59"), Some(86_399));
        assert_eq!(parse_time_of_day("24:00"), None);
        assert_eq!(parse_time_of_day("noon"), None);
        assert_eq!(parse_time_of_day("1:2:3:4"), None);
    }

    #[test]
    fn test_value_at_uses_greatest_breakpoint_not_after() {
        let schedule = compile(vec![
            Breakpoint::new("06:00", 1.0),
            Breakpoint::new("12:00", 2.0),
            Breakpoint::new("18:00", 3.0),
        ]);

        assert_eq!(schedule.value_at(6 * 3600), Some(1.0));
        assert_eq!(schedule.value_at(12 * 3600 - 1), Some(1.0));
        assert_eq!(schedule.value_at(12 * 3600), Some(2.0));
        assert_eq!(schedule.value_at(23 * 3600), Some(3.0));
    }

    #[test]
    fn test_value_before_first_breakpoint_wraps_to_last() {
        let schedule = compile(vec![
            Breakpoint::new("18:00", 3.0),
            Breakpoint::new("06:00", 1.0),
        ]);
        assert_eq!(schedule.value_at(3600), Some(3.0));
    }

    #[test]
    fn test_repeated_time_keeps_last_authored() {
        let schedule = compile(vec![
            Breakpoint::new("00:00", 1.0),
            Breakpoint::new("00:00", 1.5),
        ]);
        assert_eq!(schedule.len(), 1);
        assert_eq!(schedule.value_at(0), Some(1.5));
    }

    #[test]
    fn test_string_values_and_scalars_are_accepted() {
        let json = r#"{
            "dia": 4,
            "basal": [{"time": "00:00", "value": "0.175"}],
            "carbratio": 7,
            "sens": "35"
        }"#;
        let profile: ProfileSchedule = serde_json::from_str(json).unwrap();
        let compiled = CompiledProfile::compile("p", &profile).unwrap();

        assert_eq!(compiled.schedule(Parameter::Basal).value_at(0), Some(0.175));
        assert_eq!(compiled.schedule(Parameter::CarbRatio).value_at(500), Some(7.0));
        assert_eq!(compiled.schedule(Parameter::Sensitivity).value_at(500), Some(35.0));
        assert_eq!(compiled.schedule(Parameter::TargetLow).len(), 0);
    }

    #[test]
    fn test_invalid_entries_are_configuration_errors() {
        let bad_time = ProfileSchedule {
            basal: Some(vec![Breakpoint::new("25:00", 1.0)].into()),
            ..Default::default()
        };
        assert!(matches!(
            CompiledProfile::compile("p", &bad_time),
            Err(Error::Configuration(_))
        ));

        let bad_tz = ProfileSchedule {
            timezone: Some("Mars/Olympus_Mons".into()),
            ..Default::default()
        };
        assert!(matches!(
            CompiledProfile::compile("p", &bad_tz),
            Err(Error::Configuration(_))
        ));
    }

    #[test]
    fn test_timezone_shifts_time_of_day() {
        let profile = ProfileSchedule {
            timezone: Some("Europe/Stockholm".into()),
            ..Default::default()
        };
        let compiled = CompiledProfile::compile("p", &profile).unwrap();

        // 2015-06-21T00:00:00Z is 02:00 local (CEST)
        let secs = compiled.seconds_from_midnight(1_434_844_800_000).unwrap();
        assert_eq!(secs, 2 * 3600);
    }

    #[test]
    fn test_out_of_range_timestamp_has_no_value() {
        let profile = ProfileSchedule {
            basal: Some(0.5.into()),
            ..Default::default()
        };
        let compiled = CompiledProfile::compile("p", &profile).unwrap();

        assert_eq!(compiled.seconds_from_midnight(i64::MAX), None);
        assert_eq!(compiled.value_at(i64::MAX, Parameter::Basal).unwrap(), None);
        assert_eq!(compiled.value_at(0, Parameter::Basal).unwrap(), Some(0.5));
        // Missing breakpoints stay a configuration error
        assert!(matches!(
            compiled.value_at(i64::MAX, Parameter::Sensitivity),
            Err(Error::Configuration(_))
        ));
    }

    #[test]
    fn test_missing_default_profile_is_rejected() {
        let store = ProfileStore {
            default_profile: "Missing".into(),
            store: BTreeMap::new(),
        };
        assert!(CompiledStore::compile(&store).is_err());
    }

    #[test]
    fn test_parameter_from_str() {
        assert_eq!("ISF".parse::<Parameter>().unwrap(), Parameter::Sensitivity);
        assert_eq!("carbratio".parse::<Parameter>().unwrap(), Parameter::CarbRatio);
        assert!("dia".parse::<Parameter>().is_err());
    }
}

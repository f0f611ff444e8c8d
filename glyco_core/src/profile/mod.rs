//! Profile resolution: time-of-day schedule lookup with override layering.
//!
//! The resolver holds an immutable snapshot (schedules, override sets and a
//! lookup cache) behind a lock that is only ever held long enough to clone
//! or swap an `Arc`. Every mutation builds a fresh snapshot with the next
//! generation number, so cached values from an older generation are simply
//! unreachable and readers never observe a half-applied update.

mod overrides;
mod schedule;

pub use schedule::{
    parse_time_of_day, Breakpoint, NumberOrString, Parameter, ProfileSchedule, ProfileStore,
    ScheduleInput, DEFAULT_DIA_HOURS,
};

use crate::{Error, EventType, Result, Treatment, Units};
use overrides::{Circadian, OverrideTrack, Overrides};
use parking_lot::{Mutex, RwLock};
use schedule::{CompiledProfile, CompiledStore};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;

/// Basal rate at an instant, with the overrides that shaped it
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
pub struct BasalRate {
    /// Scheduled rate in U/h
    pub base: f64,
    /// Rate after the temp basal, equal to `base` when none is active
    pub temp_rate: f64,
    /// Combo bolus extension rate added on top
    pub combo_rate: f64,
    pub total: f64,
    pub contributing_treatment: Option<Treatment>,
    pub combo_treatment: Option<Treatment>,
}

impl BasalRate {
    /// `"T:"` temp basal, `"C:"` combo bolus, `"TC:"` both, `""` neither
    pub fn display_prefix(&self) -> &'static str {
        match (
            self.contributing_treatment.is_some(),
            self.combo_treatment.is_some(),
        ) {
            (true, true) => "TC:",
            (true, false) => "T:",
            (false, true) => "C:",
            (false, false) => "",
        }
    }

    pub fn display_line(&self) -> String {
        let prefix = self.display_prefix();
        if prefix.is_empty() {
            format!("{:.3}U", self.total)
        } else {
            format!("{} {:.3}U", prefix, self.total)
        }
    }
}

/// Memo size at which a generation's cache starts over
pub const MAX_CACHED_ENTRIES: usize = 4096;

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
enum Query {
    Parameter(Parameter),
    BasalRate,
}

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
struct CacheKey {
    time_ms: i64,
    query: Query,
    profile: Option<String>,
}

#[derive(Clone, Debug)]
enum Cached {
    Value(Option<f64>),
    Basal(BasalRate),
}

/// One generation of resolver state
#[derive(Debug, Default)]
struct Snapshot {
    generation: u64,
    store: Option<Arc<CompiledStore>>,
    overrides: Arc<Overrides>,
    cache: Mutex<HashMap<CacheKey, Cached>>,
}

impl Snapshot {
    fn next(&self, store: Option<Arc<CompiledStore>>, overrides: Arc<Overrides>) -> Self {
        Self {
            generation: self.generation + 1,
            store,
            overrides,
            cache: Mutex::new(HashMap::new()),
        }
    }

    fn cached(&self, key: &CacheKey) -> Option<Cached> {
        self.cache.lock().get(key).cloned()
    }

    fn remember(&self, key: CacheKey, value: Cached) {
        let mut cache = self.cache.lock();
        if cache.len() >= MAX_CACHED_ENTRIES {
            tracing::trace!("Lookup cache full at generation {}, clearing", self.generation);
            cache.clear();
        }
        cache.insert(key, value);
    }

    /// Pick the profile for a lookup and any circadian adjustment.
    ///
    /// An explicit name always wins and is taken as authored. Otherwise the
    /// profile switch in force at `time_ms` decides, falling back to the
    /// store's default profile.
    fn select<'a>(
        &self,
        store: &'a CompiledStore,
        time_ms: i64,
        name: Option<&str>,
    ) -> Result<(&'a CompiledProfile, Circadian)> {
        if let Some(name) = name {
            let profile = store.get(name).ok_or_else(|| {
                Error::Configuration(format!("Profile {:?} is not loaded", name))
            })?;
            return Ok((profile, Circadian::default()));
        }

        let Some(switch) = self.overrides.profile_switches.in_force_at(time_ms) else {
            return Ok((store.default_entry(), Circadian::default()));
        };

        let profile = match switch.profile_name.as_deref() {
            Some(target) => store.get(target).unwrap_or_else(|| {
                tracing::warn!(
                    "Profile switch to unknown profile {:?}, using {:?}",
                    target,
                    store.default_profile
                );
                store.default_entry()
            }),
            None => store.default_entry(),
        };
        Ok((profile, Circadian::from_switch(switch)))
    }

    fn resolve(&self, time_ms: i64, parameter: Parameter, name: Option<&str>) -> Result<Option<f64>> {
        let Some(store) = self.store.as_deref() else {
            return Ok(None);
        };

        let (profile, circadian) = self.select(store, time_ms, name)?;
        let Some(raw) = profile.value_at(time_ms.saturating_add(circadian.timeshift_ms), parameter)?
        else {
            return Ok(None);
        };

        let value = if circadian.is_identity() {
            raw
        } else {
            match parameter {
                Parameter::Basal => raw * circadian.percentage / 100.0,
                Parameter::Sensitivity | Parameter::CarbRatio => raw * 100.0 / circadian.percentage,
                Parameter::TargetLow | Parameter::TargetHigh => raw,
            }
        };
        Ok(Some(value))
    }

    fn profile_scalar<T>(
        &self,
        time_ms: i64,
        name: Option<&str>,
        pick: impl Fn(&CompiledProfile) -> Option<T>,
    ) -> Result<Option<T>> {
        let Some(store) = self.store.as_deref() else {
            return Ok(None);
        };
        let (profile, _) = self.select(store, time_ms, name)?;
        Ok(pick(profile))
    }
}

/// Thread-safe resolver of profile parameters
///
/// Cheap to share behind an `Arc`; all methods take `&self`.
#[derive(Debug, Default)]
pub struct ProfileResolver {
    state: RwLock<Arc<Snapshot>>,
}

impl ProfileResolver {
    /// A resolver with nothing loaded; lookups return `None`
    pub fn new() -> Self {
        Self::default()
    }

    /// A resolver with `store` already loaded
    pub fn with_store(store: &ProfileStore) -> Result<Self> {
        let resolver = Self::new();
        resolver.load_schedules(store)?;
        Ok(resolver)
    }

    fn snapshot(&self) -> Arc<Snapshot> {
        self.state.read().clone()
    }

    /// Replace the whole schedule set
    ///
    /// The store is validated first; on error the previous set stays active.
    pub fn load_schedules(&self, store: &ProfileStore) -> Result<()> {
        let compiled = Arc::new(CompiledStore::compile(store)?);

        let mut state = self.state.write();
        let next = state.next(Some(compiled), Arc::clone(&state.overrides));
        *state = Arc::new(next);

        tracing::info!(
            "Loaded {} profile(s), default {:?} (generation {})",
            store.store.len(),
            store.default_profile,
            state.generation
        );
        Ok(())
    }

    /// Replace override sets; `None` keeps the current set of that kind
    pub fn update_treatments(
        &self,
        temp_basals: Option<Vec<Treatment>>,
        combo_boluses: Option<Vec<Treatment>>,
        profile_switches: Option<Vec<Treatment>>,
    ) {
        let mut state = self.state.write();
        let current = &state.overrides;

        let overrides = Overrides {
            temp_basals: temp_basals
                .map(|t| OverrideTrack::new(t, Treatment::is_temp_basal))
                .unwrap_or_else(|| current.temp_basals.clone()),
            combo_boluses: combo_boluses
                .map(|t| OverrideTrack::new(t, Treatment::is_combo_bolus))
                .unwrap_or_else(|| current.combo_boluses.clone()),
            profile_switches: profile_switches
                .map(|t| OverrideTrack::new(t, Treatment::is_profile_switch))
                .unwrap_or_else(|| current.profile_switches.clone()),
        };

        tracing::debug!(
            "Override sets: {} temp basal(s), {} combo bolus(es), {} profile switch(es)",
            overrides.temp_basals.len(),
            overrides.combo_boluses.len(),
            overrides.profile_switches.len()
        );

        let next = state.next(state.store.clone(), Arc::new(overrides));
        *state = Arc::new(next);
    }

    /// Replace every override set from one mixed treatment list
    ///
    /// Roles come from the fields set. A record carrying both temp basal and
    /// combo rates goes only where its event type points, or to both when
    /// the event type names neither.
    pub fn update_from_treatments(&self, treatments: &[Treatment]) {
        let temp_basal = |t: &Treatment| {
            t.is_temp_basal() && !(t.is_combo_bolus() && t.event_type == EventType::ComboBolus)
        };
        let combo_bolus = |t: &Treatment| {
            t.is_combo_bolus() && !(t.is_temp_basal() && t.event_type == EventType::TempBasal)
        };
        let pick = |keep: &dyn Fn(&Treatment) -> bool| -> Vec<Treatment> {
            treatments.iter().filter(|t| keep(t)).cloned().collect()
        };
        self.update_treatments(
            Some(pick(&temp_basal)),
            Some(pick(&combo_bolus)),
            Some(pick(&Treatment::is_profile_switch)),
        );
    }

    /// Counter advanced by every load or override update
    pub fn generation(&self) -> u64 {
        self.snapshot().generation
    }

    /// Number of memoised lookups in the current generation
    pub fn cached_entries(&self) -> usize {
        self.snapshot().cache.lock().len()
    }

    pub fn has_data(&self) -> bool {
        self.snapshot().store.is_some()
    }

    /// Resolve a scheduled parameter at `time_ms`
    ///
    /// Returns `Ok(None)` when nothing is loaded, and a configuration error
    /// when the selected profile has no breakpoints for `parameter`.
    pub fn get_value(
        &self,
        time_ms: i64,
        parameter: Parameter,
        profile: Option<&str>,
    ) -> Result<Option<f64>> {
        let snapshot = self.snapshot();
        let key = CacheKey {
            time_ms,
            query: Query::Parameter(parameter),
            profile: profile.map(str::to_string),
        };
        if let Some(Cached::Value(value)) = snapshot.cached(&key) {
            return Ok(value);
        }

        let value = snapshot.resolve(time_ms, parameter, profile)?;
        tracing::trace!(
            "Resolved {} at {} ({:?}) = {:?}",
            parameter,
            time_ms,
            profile,
            value
        );
        snapshot.remember(key, Cached::Value(value));
        Ok(value)
    }

    pub fn basal(&self, time_ms: i64, profile: Option<&str>) -> Result<Option<f64>> {
        self.get_value(time_ms, Parameter::Basal, profile)
    }

    pub fn sensitivity(&self, time_ms: i64, profile: Option<&str>) -> Result<Option<f64>> {
        self.get_value(time_ms, Parameter::Sensitivity, profile)
    }

    pub fn carb_ratio(&self, time_ms: i64, profile: Option<&str>) -> Result<Option<f64>> {
        self.get_value(time_ms, Parameter::CarbRatio, profile)
    }

    pub fn target_low(&self, time_ms: i64, profile: Option<&str>) -> Result<Option<f64>> {
        self.get_value(time_ms, Parameter::TargetLow, profile)
    }

    pub fn target_high(&self, time_ms: i64, profile: Option<&str>) -> Result<Option<f64>> {
        self.get_value(time_ms, Parameter::TargetHigh, profile)
    }

    /// Duration of insulin action in hours
    pub fn dia(&self, time_ms: i64, profile: Option<&str>) -> Result<Option<f64>> {
        self.snapshot().profile_scalar(time_ms, profile, |p| p.dia)
    }

    /// Carb absorption rate in g/h
    pub fn carb_absorption_rate(&self, time_ms: i64, profile: Option<&str>) -> Result<Option<f64>> {
        self.snapshot().profile_scalar(time_ms, profile, |p| p.carbs_hr)
    }

    /// Minutes before carbs start absorbing
    pub fn carb_delay(&self, time_ms: i64, profile: Option<&str>) -> Result<Option<f64>> {
        self.snapshot().profile_scalar(time_ms, profile, |p| p.delay)
    }

    pub fn units(&self, time_ms: i64, profile: Option<&str>) -> Result<Option<Units>> {
        self.snapshot().profile_scalar(time_ms, profile, |p| Some(p.units))
    }

    /// Timezone name of the selected profile
    pub fn timezone(&self, time_ms: i64, profile: Option<&str>) -> Result<Option<String>> {
        self.snapshot()
            .profile_scalar(time_ms, profile, |p| Some(p.timezone.name().to_string()))
    }

    /// Name of the profile in force at `time_ms`
    pub fn active_profile_name(&self, time_ms: i64) -> Result<Option<String>> {
        self.snapshot()
            .profile_scalar(time_ms, None, |p| Some(p.name.clone()))
    }

    /// Basal rate at `time_ms` with temp basal and combo bolus layered on
    ///
    /// With no schedules loaded the base rate is 0.
    pub fn get_basal_rate(&self, time_ms: i64) -> Result<BasalRate> {
        let snapshot = self.snapshot();
        let key = CacheKey {
            time_ms,
            query: Query::BasalRate,
            profile: None,
        };
        if let Some(Cached::Basal(rate)) = snapshot.cached(&key) {
            return Ok(rate);
        }

        let base = snapshot.resolve(time_ms, Parameter::Basal, None)?.unwrap_or(0.0);
        let temp = snapshot.overrides.temp_basals.active_at(time_ms);
        let combo = snapshot.overrides.combo_boluses.active_at(time_ms);

        // An absolute temp of 0 is a suspend, not a missing value
        let temp_rate = match temp {
            Some(t) => match (t.absolute_rate, t.percent_rate) {
                (Some(absolute), _) if absolute.is_finite() => absolute.max(0.0),
                (_, Some(percent)) if percent.is_finite() => {
                    (base * (100.0 + percent) / 100.0).max(0.0)
                }
                _ => base,
            },
            None => base,
        };
        let combo_rate = combo
            .and_then(|c| c.relative_rate)
            .filter(|r| r.is_finite())
            .unwrap_or(0.0);

        let rate = BasalRate {
            base,
            temp_rate,
            combo_rate,
            total: temp_rate + combo_rate,
            contributing_treatment: temp.cloned(),
            combo_treatment: combo.cloned(),
        };

        tracing::debug!("Basal at {}: {}", time_ms, rate.display_line());
        snapshot.remember(key, Cached::Basal(rate.clone()));
        Ok(rate)
    }
}

//! Short-horizon glucose forecasting.
//!
//! The forecast is a second-order autoregressive model on log-scaled
//! glucose: with `y = ln(bg / 140)`,
//!
//! ```text
//! y[n+1] = -0.723 * y[n-1] + 1.716 * y[n]
//! ```
//!
//! seeded by the mean of the newest 5-minute bucket and the mean five
//! minutes earlier. The model pulls gently back toward 140 mg/dL, so a
//! flat trace stays nearly flat while a trend is carried forward and damped.

use crate::history::valid_readings;
use crate::stats::{BgNow, Delta, GlucoseStats};
use crate::{GlucoseReading, Units, MINUTE_MS};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Central tendency the log scale is centred on
pub const BG_REF: f64 = 140.0;

/// Lowest value a forecast may show
pub const BG_MIN: f64 = 36.0;

/// Highest value a forecast may show
pub const BG_MAX: f64 = 400.0;

/// Loss above which a predicted excursion is worth a warning
pub const WARN_THRESHOLD: f64 = 0.05;

/// Loss above which a predicted excursion is urgent
pub const URGENT_THRESHOLD: f64 = 0.10;

/// Number of forecast points (30 minutes)
pub const FORECAST_STEPS: usize = 6;

/// Cone half-width per step, in log units, before the cone factor
pub const CONE: [f64; 13] = [
    0.020, 0.041, 0.061, 0.081, 0.099, 0.116, 0.132, 0.146, 0.159, 0.171, 0.182, 0.192, 0.201,
];

/// Colour every cone point is drawn with
pub const CONE_COLOR: &str = "cyan";

const AR: [f64; 2] = [-0.723, 1.716];
const STEP_MS: i64 = 5 * MINUTE_MS;
const LOSS_REFERENCE: f64 = 120.0;

/// Index of the +15 minute point
const IN_15_MINS: usize = 2;

/// Index of the +20 minute point
const IN_20_MINS: usize = 3;

/// Alarm thresholds and display settings, resolved once from configuration
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct ForecastSettings {
    /// High target in mg/dL
    pub bg_target_top: f64,
    /// Low target in mg/dL
    pub bg_target_bottom: f64,
    pub alarm_high: bool,
    pub alarm_low: bool,
    pub units: Units,
}

impl Default for ForecastSettings {
    fn default() -> Self {
        Self {
            bg_target_top: 180.0,
            bg_target_bottom: 80.0,
            alarm_high: true,
            alarm_low: true,
            units: Units::MgDl,
        }
    }
}

/// One predicted value
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct PredictedPoint {
    pub timestamp_ms: i64,
    pub value_mgdl: f64,
}

/// One point of the forecast cone
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct ConePoint {
    pub timestamp_ms: i64,
    pub value_mgdl: f64,
    pub color: String,
}

/// Predicted excursion out of the target range
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ForecastEvent {
    High,
    Low,
}

impl fmt::Display for ForecastEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ForecastEvent::High => write!(f, "high"),
            ForecastEvent::Low => write!(f, "low"),
        }
    }
}

/// Notification level implied by the forecast loss
#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord)]
#[serde(rename_all = "lowercase")]
pub enum AlarmLevel {
    #[default]
    None,
    Warn,
    Urgent,
}

impl AlarmLevel {
    pub fn from_loss(avg_loss: f64) -> Self {
        if avg_loss > URGENT_THRESHOLD {
            AlarmLevel::Urgent
        } else if avg_loss > WARN_THRESHOLD {
            AlarmLevel::Warn
        } else {
            AlarmLevel::None
        }
    }
}

#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
pub struct ForecastResult {
    pub predicted: Vec<PredictedPoint>,
    pub avg_loss: f64,
    pub display_line: String,
    pub event_name: Option<ForecastEvent>,
    pub level: AlarmLevel,
}

/// Rolling state of the AR(2) recursion in log space
#[derive(Clone, Copy, Debug)]
struct Ar2 {
    previous: f64,
    current: f64,
}

impl Ar2 {
    fn seed(bg_now: &BgNow, delta: &Delta) -> Self {
        Self {
            previous: (delta.mean_5_mins_ago / BG_REF).ln(),
            current: (bg_now.mean / BG_REF).ln(),
        }
    }

    fn step(&mut self) -> f64 {
        let next = AR[0] * self.previous + AR[1] * self.current;
        self.previous = self.current;
        self.current = next;
        next
    }
}

fn to_mgdl(log_value: f64) -> f64 {
    clamp_bg((BG_REF * log_value.exp()).round())
}

/// Clamp a glucose value into the displayable range
pub fn clamp_bg(value: f64) -> f64 {
    value.clamp(BG_MIN, BG_MAX)
}

/// Whether the current statistics are enough to run the model
pub fn can_forecast(bg_now: Option<&BgNow>, delta: Option<&Delta>) -> bool {
    match (bg_now, delta) {
        (Some(now), Some(delta)) => {
            now.mean.is_finite()
                && now.mean >= BG_MIN
                && delta.mean_5_mins_ago.is_finite()
                && delta.mean_5_mins_ago > 0.0
        }
        _ => false,
    }
}

fn has_enough_history(history: &[GlucoseReading]) -> bool {
    valid_readings(history).len() >= 2
}

/// Predict the next 30 minutes
///
/// Returns an empty result when the history or statistics are insufficient.
pub fn calculate_forecast(
    history: &[GlucoseReading],
    bg_now: Option<&BgNow>,
    delta: Option<&Delta>,
    settings: &ForecastSettings,
) -> ForecastResult {
    let (Some(now), Some(delta)) = (bg_now, delta) else {
        tracing::debug!("Forecast skipped: missing bg_now or delta");
        return ForecastResult::default();
    };
    if !can_forecast(Some(now), Some(delta)) || !has_enough_history(history) {
        tracing::debug!("Forecast skipped: insufficient data");
        return ForecastResult::default();
    }

    let mut model = Ar2::seed(now, delta);
    let mut forecast_time = now.mills;
    let predicted: Vec<PredictedPoint> = (0..FORECAST_STEPS)
        .map(|_| {
            forecast_time += STEP_MS;
            PredictedPoint {
                timestamp_ms: forecast_time,
                value_mgdl: to_mgdl(model.step()),
            }
        })
        .collect();

    let avg_loss = average_loss(&predicted);
    let level = AlarmLevel::from_loss(avg_loss);
    let event_name = classify_event(&predicted, avg_loss, settings);

    let display_line = format!(
        "BG 15m: {} {}",
        settings.units.format(predicted[IN_15_MINS].value_mgdl),
        settings.units.label()
    );

    tracing::debug!(
        "Forecast from {:.1} (5m ago {:.1}): avg_loss={:.4} event={:?}",
        now.mean,
        delta.mean_5_mins_ago,
        avg_loss,
        event_name
    );

    ForecastResult {
        predicted,
        avg_loss,
        display_line,
        event_name,
        level,
    }
}

/// Convenience wrapper that derives the statistics from the history itself
pub fn forecast_from_history(
    history: &[GlucoseReading],
    settings: &ForecastSettings,
) -> ForecastResult {
    let stats = GlucoseStats::from_history(history);
    calculate_forecast(history, stats.bg_now.as_ref(), stats.delta.as_ref(), settings)
}

/// Mean squared log10 distance of the predictions from 120 mg/dL
fn average_loss(predicted: &[PredictedPoint]) -> f64 {
    let size = predicted.len().saturating_sub(1).min(FORECAST_STEPS);
    if size == 0 {
        return 0.0;
    }

    predicted
        .iter()
        .take(size + 1)
        .map(|p| (p.value_mgdl / LOSS_REFERENCE).log10().powi(2) / size as f64)
        .sum()
}

fn classify_event(
    predicted: &[PredictedPoint],
    avg_loss: f64,
    settings: &ForecastSettings,
) -> Option<ForecastEvent> {
    if avg_loss <= WARN_THRESHOLD {
        return None;
    }
    let in_20_mins = predicted.get(IN_20_MINS)?.value_mgdl;

    if settings.alarm_high && in_20_mins > settings.bg_target_top {
        Some(ForecastEvent::High)
    } else if settings.alarm_low && in_20_mins < settings.bg_target_bottom {
        Some(ForecastEvent::Low)
    } else {
        None
    }
}

/// Project the uncertainty cone over the next 65 minutes
///
/// With a positive `cone_factor` every step yields an upper and a lower
/// bound; with zero only the centre line is produced.
pub fn generate_forecast_cone(
    history: &[GlucoseReading],
    bg_now: Option<&BgNow>,
    delta: Option<&Delta>,
    cone_factor: f64,
) -> Vec<ConePoint> {
    let (Some(now), Some(delta)) = (bg_now, delta) else {
        return Vec::new();
    };
    if !can_forecast(Some(now), Some(delta)) || !has_enough_history(history) {
        return Vec::new();
    }

    let cone_factor = if cone_factor.is_finite() { cone_factor.max(0.0) } else { 0.0 };
    let mut model = Ar2::seed(now, delta);
    let mut forecast_time = now.mills;
    let mut points = Vec::with_capacity(CONE.len() * 2);

    for width in CONE {
        forecast_time += STEP_MS;
        let centre = model.step();

        if cone_factor > 0.0 {
            for offset in [cone_factor * width, -cone_factor * width] {
                points.push(ConePoint {
                    timestamp_ms: forecast_time,
                    value_mgdl: to_mgdl(centre + offset),
                    color: CONE_COLOR.into(),
                });
            }
        } else {
            points.push(ConePoint {
                timestamp_ms: forecast_time,
                value_mgdl: to_mgdl(centre),
                color: CONE_COLOR.into(),
            });
        }
    }

    points
}

#[cfg(test)]
mod tests {
    use super::*;

    const T0: i64 = 1_432_864_800_000;

    fn history() -> Vec<GlucoseReading> {
        vec![
            GlucoseReading::new(T0 - 5 * MINUTE_MS, 100.0),
            GlucoseReading::new(T0, 100.0),
        ]
    }

    fn stats(mean_5_mins_ago: f64, mean: f64) -> (BgNow, Delta) {
        let now = BgNow { mills: T0, mean, last: mean, readings: 1 };
        let previous = BgNow {
            mills: T0 - 5 * MINUTE_MS,
            mean: mean_5_mins_ago,
            last: mean_5_mins_ago,
            readings: 1,
        };
        let delta = Delta::between(&now, &previous);
        (now, delta)
    }

    fn values(result: &ForecastResult) -> Vec<f64> {
        result.predicted.iter().map(|p| p.value_mgdl).collect()
    }

    #[test]
    fn test_can_forecast_requirements() {
        let (now, delta) = stats(100.0, 100.0);
        assert!(can_forecast(Some(&now), Some(&delta)));
        assert!(!can_forecast(Some(&now), None));
        assert!(!can_forecast(None, Some(&delta)));

        let (low, delta) = stats(40.0, 30.0);
        assert!(!can_forecast(Some(&low), Some(&delta)));
    }

    #[test]
    fn test_short_history_gives_empty_forecast() {
        let (now, delta) = stats(100.0, 100.0);
        let one = vec![GlucoseReading::new(T0, 100.0)];

        let result = calculate_forecast(&one, Some(&now), Some(&delta), &ForecastSettings::default());

        assert!(result.predicted.is_empty());
        assert_eq!(result.avg_loss, 0.0);
        assert!(result.event_name.is_none());
        assert!(generate_forecast_cone(&one, Some(&now), Some(&delta), 2.0).is_empty());
    }

    #[test]
    fn test_flat_trace_stays_near_flat() {
        let (now, delta) = stats(100.0, 100.0);
        let result =
            calculate_forecast(&history(), Some(&now), Some(&delta), &ForecastSettings::default());

        assert_eq!(values(&result), vec![100.0, 101.0, 101.0, 102.0, 102.0, 103.0]);
        for (i, point) in result.predicted.iter().enumerate() {
            assert_eq!(point.timestamp_ms, T0 + (i as i64 + 1) * 5 * MINUTE_MS);
        }
        assert!(result.avg_loss < WARN_THRESHOLD);
        assert_eq!(result.level, AlarmLevel::None);
        assert_eq!(result.display_line, "BG 15m: 101 mg/dl");
    }

    #[test]
    fn test_rising_trace_predicts_high() {
        let (now, delta) = stats(180.0, 200.0);
        let result =
            calculate_forecast(&history(), Some(&now), Some(&delta), &ForecastSettings::default());

        assert_eq!(values(&result), vec![215.0, 226.0, 234.0, 239.0, 241.0, 242.0]);
        assert!(result.avg_loss > WARN_THRESHOLD);
        assert_eq!(result.event_name, Some(ForecastEvent::High));
        assert_eq!(result.display_line, "BG 15m: 234 mg/dl");
    }

    #[test]
    fn test_high_alarm_can_be_disabled() {
        let (now, delta) = stats(180.0, 200.0);
        let settings = ForecastSettings {
            alarm_high: false,
            ..Default::default()
        };

        let result = calculate_forecast(&history(), Some(&now), Some(&delta), &settings);

        assert_eq!(result.predicted.len(), FORECAST_STEPS);
        assert!(result.event_name.is_none());
    }

    #[test]
    fn test_falling_trace_predicts_urgent_low() {
        let (now, delta) = stats(80.0, 70.0);
        let result =
            calculate_forecast(&history(), Some(&now), Some(&delta), &ForecastSettings::default());

        assert_eq!(values(&result), vec![64.0, 60.0, 58.0, 57.0, 56.0, 56.0]);
        assert_eq!(result.event_name, Some(ForecastEvent::Low));
        assert_eq!(result.level, AlarmLevel::Urgent);
    }

    #[test]
    fn test_values_are_clamped() {
        let (now, delta) = stats(350.0, 390.0);
        let result =
            calculate_forecast(&history(), Some(&now), Some(&delta), &ForecastSettings::default());

        assert_eq!(result.predicted.len(), FORECAST_STEPS);
        assert!(result.predicted.iter().all(|p| p.value_mgdl == BG_MAX));
    }

    #[test]
    fn test_display_line_in_mmol() {
        let (now, delta) = stats(100.0, 100.0);
        let settings = ForecastSettings {
            units: Units::Mmol,
            ..Default::default()
        };
        let result = calculate_forecast(&history(), Some(&now), Some(&delta), &settings);
        assert_eq!(result.display_line, "BG 15m: 5.6 mmol/L");
    }

    #[test]
    fn test_cone_point_counts() {
        let (now, delta) = stats(110.0, 120.0);

        let centre = generate_forecast_cone(&history(), Some(&now), Some(&delta), 0.0);
        assert_eq!(centre.len(), CONE.len());

        let cone = generate_forecast_cone(&history(), Some(&now), Some(&delta), 2.0);
        assert_eq!(cone.len(), CONE.len() * 2);

        for point in centre.iter().chain(cone.iter()) {
            assert_eq!(point.color, CONE_COLOR);
            assert!(point.value_mgdl >= BG_MIN && point.value_mgdl <= BG_MAX);
        }
    }

    #[test]
    fn test_cone_bounds_widen_around_centre() {
        let (now, delta) = stats(120.0, 120.0);
        let centre = generate_forecast_cone(&history(), Some(&now), Some(&delta), 0.0);
        let cone = generate_forecast_cone(&history(), Some(&now), Some(&delta), 2.0);

        for (step, mid) in centre.iter().enumerate() {
            let upper = &cone[step * 2];
            let lower = &cone[step * 2 + 1];
            assert_eq!(upper.timestamp_ms, mid.timestamp_ms);
            assert!(upper.value_mgdl >= mid.value_mgdl);
            assert!(lower.value_mgdl <= mid.value_mgdl);
        }

        let first_width = cone[0].value_mgdl - cone[1].value_mgdl;
        let last_width = cone[24].value_mgdl - cone[25].value_mgdl;
        assert!(last_width > first_width);
    }

    #[test]
    fn test_cone_is_clamped_at_extremes() {
        let (now, delta) = stats(60.0, 40.0);
        let cone = generate_forecast_cone(&history(), Some(&now), Some(&delta), 5.0);
        assert_eq!(cone.len(), 26);
        assert!(cone.iter().any(|p| p.value_mgdl == BG_MIN));
    }

    #[test]
    fn test_forecast_from_history_derives_stats() {
        let history = vec![
            GlucoseReading::new(T0, 180.0),
            GlucoseReading::new(T0 + 5 * MINUTE_MS, 200.0),
        ];
        let result = forecast_from_history(&history, &ForecastSettings::default());
        assert_eq!(result.predicted.len(), FORECAST_STEPS);
        assert_eq!(result.predicted[0].timestamp_ms, T0 + 10 * MINUTE_MS);
        assert_eq!(result.predicted[0].value_mgdl, 215.0);
    }
}

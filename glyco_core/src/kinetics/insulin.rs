//! Insulin action curves.
//!
//! Two shapes are supported:
//! - exponential, parameterised by the time of peak activity, with the
//!   named presets "rapid-acting" (75 min) and "ultra-rapid" (55 min)
//! - the classic bilinear curve peaking at 75 minutes, stretched to the DIA

use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Label of the default curve
pub const DEFAULT_CURVE: &str = "rapid-acting";

/// Exponential curves are not defined for short action times
const MIN_EXPONENTIAL_DIA_HOURS: f64 = 5.0;

const BILINEAR_PEAK: f64 = 75.0;
const BILINEAR_END: f64 = 180.0;

/// Past the vertex of the tail polynomial nothing is left on board
const BILINEAR_TAIL_VERTEX: f64 = 0.054233 / (2.0 * 0.001323);

static PRESETS: Lazy<HashMap<&'static str, InsulinCurve>> = Lazy::new(|| {
    HashMap::from([
        ("rapid-acting", InsulinCurve::Exponential { peak_minutes: 75.0 }),
        ("ultra-rapid", InsulinCurve::Exponential { peak_minutes: 55.0 }),
        ("bilinear", InsulinCurve::Bilinear),
    ])
});

/// Shape of the insulin action curve
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum InsulinCurve {
    Bilinear,
    Exponential { peak_minutes: f64 },
}

impl Default for InsulinCurve {
    fn default() -> Self {
        PRESETS[DEFAULT_CURVE]
    }
}

/// Remaining fraction and activity of one unit at some time after delivery
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct InsulinAction {
    /// Fraction of the dose still on board, in [0, 1]
    pub remaining: f64,
    /// Fraction of the dose acting per minute
    pub activity: f64,
}

impl InsulinAction {
    const NONE: InsulinAction = InsulinAction {
        remaining: 0.0,
        activity: 0.0,
    };
}

impl InsulinCurve {
    /// Look up a named preset
    pub fn preset(name: &str) -> Option<Self> {
        PRESETS.get(name.to_ascii_lowercase().as_str()).copied()
    }

    /// Names of all presets, sorted
    pub fn preset_names() -> Vec<&'static str> {
        let mut names: Vec<_> = PRESETS.keys().copied().collect();
        names.sort_unstable();
        names
    }

    /// Exponential curve with a custom peak
    pub fn with_peak(peak_minutes: f64) -> Self {
        InsulinCurve::Exponential { peak_minutes }
    }

    pub fn label(&self) -> String {
        PRESETS
            .iter()
            .find(|(_, curve)| *curve == self)
            .map(|(name, _)| name.to_string())
            .unwrap_or_else(|| match self {
                InsulinCurve::Exponential { peak_minutes } => {
                    format!("custom (peak {} min)", peak_minutes)
                }
                InsulinCurve::Bilinear => "bilinear".into(),
            })
    }

    /// Evaluate the curve `minutes_ago` after delivery for a DIA in hours
    pub fn action(&self, minutes_ago: f64, dia_hours: f64) -> InsulinAction {
        if !minutes_ago.is_finite() || minutes_ago < 0.0 || !dia_hours.is_finite() || dia_hours <= 0.0
        {
            return InsulinAction::NONE;
        }

        match *self {
            InsulinCurve::Bilinear => bilinear(minutes_ago, dia_hours),
            InsulinCurve::Exponential { peak_minutes } => {
                exponential(minutes_ago, dia_hours.max(MIN_EXPONENTIAL_DIA_HOURS), peak_minutes)
            }
        }
    }
}

fn bilinear(minutes_ago: f64, dia_hours: f64) -> InsulinAction {
    let scale = 3.0 / dia_hours;
    let scaled = scale * minutes_ago;

    if scaled < BILINEAR_PEAK {
        let x = scaled / 5.0 + 1.0;
        InsulinAction {
            remaining: 1.0 - 0.001852 * x * x + 0.001852 * x,
            activity: (2.0 / dia_hours / 60.0 / BILINEAR_PEAK) * scaled,
        }
    } else if scaled < BILINEAR_END {
        let x = (scaled - BILINEAR_PEAK) / 5.0;
        InsulinAction {
            remaining: if x > BILINEAR_TAIL_VERTEX {
                0.0
            } else {
                (0.001323 * x * x - 0.054233 * x + 0.55556).max(0.0)
            },
            activity: 2.0 / dia_hours / 60.0
                - (scaled - BILINEAR_PEAK) * 2.0 / dia_hours / 60.0 / (BILINEAR_END - BILINEAR_PEAK),
        }
    } else {
        InsulinAction::NONE
    }
}

fn exponential(minutes_ago: f64, dia_hours: f64, peak_minutes: f64) -> InsulinAction {
    let end = dia_hours * 60.0;
    // The closed form needs the peak well inside the action window
    let peak = peak_minutes.clamp(1.0, end / 2.0 - 1.0);
    if minutes_ago >= end {
        return InsulinAction::NONE;
    }

    let t = minutes_ago;
    let tau = peak * (1.0 - peak / end) / (1.0 - 2.0 * peak / end);
    let a = 2.0 * tau / end;
    let s = 1.0 / (1.0 - a + (1.0 + a) * (-end / tau).exp());
    let decay = (-t / tau).exp();

    let activity = s / tau.powi(2) * t * (1.0 - t / end) * decay;
    let remaining =
        1.0 - s * (1.0 - a) * ((t.powi(2) / (tau * end * (1.0 - a)) - t / tau - 1.0) * decay + 1.0);

    InsulinAction {
        remaining: remaining.clamp(0.0, 1.0),
        activity: activity.max(0.0),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn close(a: f64, b: f64) -> bool {
        (a - b).abs() < 1e-3
    }

    #[test]
    fn test_default_is_rapid_acting() {
        let curve = InsulinCurve::default();
        assert_eq!(curve, InsulinCurve::Exponential { peak_minutes: 75.0 });
        assert_eq!(curve.label(), "rapid-acting");
        assert_eq!(InsulinCurve::with_peak(60.0).label(), "custom (peak 60 min)");
    }

    #[test]
    fn test_presets() {
        assert_eq!(
            InsulinCurve::preset("Ultra-Rapid"),
            Some(InsulinCurve::Exponential { peak_minutes: 55.0 })
        );
        assert_eq!(InsulinCurve::preset("bilinear"), Some(InsulinCurve::Bilinear));
        assert_eq!(InsulinCurve::preset("nph"), None);
        assert_eq!(
            InsulinCurve::preset_names(),
            vec!["bilinear", "rapid-acting", "ultra-rapid"]
        );
    }

    #[test]
    fn test_bilinear_shape() {
        let curve = InsulinCurve::Bilinear;
        assert!(close(curve.action(0.0, 3.0).remaining, 1.0));
        assert!(close(curve.action(30.0, 3.0).remaining, 0.922));
        assert!(close(curve.action(75.0, 3.0).remaining, 0.556));
        assert_eq!(curve.action(179.0, 3.0).remaining, 0.0);
        assert_eq!(curve.action(180.0, 3.0), InsulinAction::NONE);

        // A 6 hour DIA stretches the curve
        assert!(close(curve.action(60.0, 6.0).remaining, 0.922));
    }

    #[test]
    fn test_exponential_shape() {
        let curve = InsulinCurve::default();
        assert!(close(curve.action(0.0, 5.0).remaining, 1.0));
        assert!(close(curve.action(75.0, 5.0).remaining, 0.673));
        assert!(close(curve.action(180.0, 5.0).remaining, 0.159));
        assert_eq!(curve.action(300.0, 5.0), InsulinAction::NONE);

        // Activity peaks at the peak time
        let before = curve.action(60.0, 5.0).activity;
        let peak = curve.action(75.0, 5.0).activity;
        let after = curve.action(90.0, 5.0).activity;
        assert!(peak > before && peak > after);
    }

    #[test]
    fn test_short_dia_is_raised_for_exponential() {
        let curve = InsulinCurve::default();
        assert_eq!(curve.action(180.0, 3.0), curve.action(180.0, 5.0));
    }

    #[test]
    fn test_remaining_is_monotonic() {
        for curve in [InsulinCurve::Bilinear, InsulinCurve::default(), InsulinCurve::with_peak(55.0)] {
            let mut last = 1.0;
            for minute in 0..400 {
                let remaining = curve.action(minute as f64, 5.0).remaining;
                assert!(remaining <= last + 1e-12, "{:?} rose at {}", curve, minute);
                assert!((0.0..=1.0).contains(&remaining));
                last = remaining;
            }
        }
    }

    #[test]
    fn test_future_delivery_has_no_action() {
        assert_eq!(InsulinCurve::default().action(-5.0, 5.0), InsulinAction::NONE);
    }
}

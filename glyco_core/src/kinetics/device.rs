//! Normalising loop controller and pump uploads.

use super::KineticsSettings;
use crate::{DeviceStatus, SourceTag, MINUTE_MS};
use serde::{Deserialize, Serialize};
use std::cmp::Reverse;
use std::fmt;

/// What a kinetics total measures
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Quantity {
    /// Insulin on board, units
    Iob,
    /// Carbs on board, grams
    Cob,
}

impl fmt::Display for Quantity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Quantity::Iob => write!(f, "IOB"),
            Quantity::Cob => write!(f, "COB"),
        }
    }
}

/// A value reported by a device rather than computed from treatments
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct DeviceReading {
    pub value: f64,
    pub source: String,
    pub device: String,
    pub timestamp_ms: i64,
}

type Extractor = fn(&DeviceStatus, Quantity) -> Option<(f64, String)>;

/// Tried in order; the first payload carrying the quantity wins
const EXTRACTORS: [Extractor; 4] = [openaps, loop_controller, pump, reported];

fn finite(value: Option<f64>) -> Option<f64> {
    value.filter(|v| v.is_finite())
}

fn openaps(status: &DeviceStatus, quantity: Quantity) -> Option<(f64, String)> {
    let payload = status.openaps.as_ref()?;
    let value = match quantity {
        Quantity::Iob => payload.iob.as_ref()?.first()?.iob,
        Quantity::Cob => payload.suggested.as_ref()?.cob,
    };
    Some((finite(value)?, SourceTag::OpenAps.to_string()))
}

fn loop_controller(status: &DeviceStatus, quantity: Quantity) -> Option<(f64, String)> {
    let payload = status.loop_status.as_ref()?;
    let value = match quantity {
        Quantity::Iob => payload.iob.as_ref()?.iob,
        Quantity::Cob => payload.cob.as_ref()?.cob,
    };
    Some((finite(value)?, SourceTag::Loop.to_string()))
}

/// Pumps only know about insulin
fn pump(status: &DeviceStatus, quantity: Quantity) -> Option<(f64, String)> {
    if quantity != Quantity::Iob {
        return None;
    }
    let payload = status.pump.as_ref()?;
    let iob = payload.iob.as_ref()?;
    let value = finite(iob.iob).or(finite(iob.bolusiob))?;
    let source = payload
        .manufacturer
        .clone()
        .unwrap_or_else(|| "Pump".into());
    Some((value, source))
}

fn reported(status: &DeviceStatus, quantity: Quantity) -> Option<(f64, String)> {
    let value = match quantity {
        Quantity::Iob => status.reported_iob,
        Quantity::Cob => status.reported_cob,
    };
    Some((finite(value)?, status.source_tag.to_string()))
}

/// Extract `quantity` from whichever payload of `status` carries it
///
/// Absent or malformed fields give `None`. Negative values are reported as 0.
pub fn from_device_status(status: &DeviceStatus, quantity: Quantity) -> Option<DeviceReading> {
    EXTRACTORS
        .iter()
        .find_map(|extract| extract(status, quantity))
        .map(|(value, source)| DeviceReading {
            value: value.max(0.0),
            source,
            device: status.device_id.clone(),
            timestamp_ms: status.timestamp_ms,
        })
}

/// Newest fresh device value for `quantity` at `at_ms`
pub(crate) fn latest_reported(
    statuses: &[DeviceStatus],
    quantity: Quantity,
    at_ms: i64,
    settings: &KineticsSettings,
) -> Option<DeviceReading> {
    let max_age_ms = (settings.staleness_minutes * MINUTE_MS as f64).round() as i64;
    let max_ahead_ms = (settings.future_tolerance_minutes * MINUTE_MS as f64).round() as i64;

    let mut recent: Vec<&DeviceStatus> = statuses.iter().collect();
    recent.sort_by_key(|s| Reverse(s.timestamp_ms));

    for (idx, status) in recent.iter().enumerate() {
        let age_ms = at_ms.saturating_sub(status.timestamp_ms);
        if age_ms < -max_ahead_ms {
            tracing::debug!(
                "Skipping {} status from {:?}: {} min in the future",
                quantity,
                status.device_id,
                -age_ms / MINUTE_MS
            );
            continue;
        }
        if age_ms > max_age_ms {
            tracing::debug!(
                "Ignoring {} stale status(es) for {}, newest {} min old",
                recent.len() - idx,
                quantity,
                age_ms / MINUTE_MS
            );
            break;
        }
        if let Some(reading) = from_device_status(status, quantity) {
            return Some(reading);
        }
    }
    None
}

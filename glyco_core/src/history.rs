//! Glucose history normalisation and CSV import.
//!
//! Callers hand over readings in whatever order the data layer produced
//! them. Everything downstream works on the normalised form: ascending by
//! timestamp, one reading per timestamp.

use crate::{GlucoseReading, Result};
use chrono::DateTime;
use csv::ReaderBuilder;
use serde::Deserialize;
use std::path::Path;

/// CSV row format for exported sensor readings
#[derive(Debug, Deserialize)]
struct CsvRow {
    timestamp: String,
    mgdl: f64,
    noise: Option<u8>,
}

impl TryFrom<CsvRow> for GlucoseReading {
    type Error = crate::Error;

    fn try_from(row: CsvRow) -> Result<Self> {
        let timestamp_ms = parse_timestamp_ms(&row.timestamp)?;

        Ok(GlucoseReading {
            timestamp_ms,
            value_mgdl: row.mgdl,
            noise_level: row.noise,
        })
    }
}

/// Parse either epoch milliseconds or an RFC 3339 date
pub fn parse_timestamp_ms(raw: &str) -> Result<i64> {
    let raw = raw.trim();
    if let Ok(ms) = raw.parse::<i64>() {
        return Ok(ms);
    }

    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.timestamp_millis())
        .map_err(|e| crate::Error::InvalidInput(format!("Invalid timestamp {:?}: {}", raw, e)))
}

/// Sort ascending by timestamp and collapse duplicates.
///
/// When two readings share a timestamp the one supplied last wins.
/// Non-finite values are dropped.
pub fn normalize(readings: &[GlucoseReading]) -> Vec<GlucoseReading> {
    let mut sorted: Vec<GlucoseReading> = readings
        .iter()
        .filter(|r| r.value_mgdl.is_finite())
        .cloned()
        .collect();

    // Stable sort keeps supply order inside equal timestamps
    sorted.sort_by_key(|r| r.timestamp_ms);

    let mut out: Vec<GlucoseReading> = Vec::with_capacity(sorted.len());
    for reading in sorted {
        match out.last_mut() {
            Some(last) if last.timestamp_ms == reading.timestamp_ms => *last = reading,
            _ => out.push(reading),
        }
    }

    if out.len() != readings.len() {
        tracing::debug!(
            "Normalized {} readings down to {}",
            readings.len(),
            out.len()
        );
    }

    out
}

/// Normalised readings that carry a real glucose value
pub fn valid_readings(readings: &[GlucoseReading]) -> Vec<GlucoseReading> {
    normalize(readings)
        .into_iter()
        .filter(GlucoseReading::is_valid)
        .collect()
}

/// Load readings from a CSV file with `timestamp,mgdl,noise` columns
///
/// Rows that fail to parse are skipped with a warning.
pub fn load_readings_csv(path: &Path) -> Result<Vec<GlucoseReading>> {
    let mut reader = ReaderBuilder::new()
        .has_headers(true)
        .trim(csv::Trim::All)
        .from_path(path)?;

    let mut readings = Vec::new();
    for result in reader.deserialize::<CsvRow>() {
        match result {
            Ok(row) => match GlucoseReading::try_from(row) {
                Ok(reading) => readings.push(reading),
                Err(e) => {
                    tracing::warn!("Failed to parse CSV row: {}", e);
                }
            },
            Err(e) => {
                tracing::warn!("Failed to deserialize CSV row: {}", e);
            }
        }
    }

    tracing::info!("Loaded {} readings from {:?}", readings.len(), path);
    Ok(readings)
}

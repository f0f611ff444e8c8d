//! JSON snapshots of everything the engines need at one instant.

use crate::profile::{ProfileResolver, ProfileStore};
use crate::{DeviceStatus, GlucoseReading, Result, Treatment};
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::BufReader;
use std::path::Path;

/// Readings, treatments, device uploads and the profile store
///
/// ```json
/// {
///   "entries": [{"timestamp_ms": 1432864800000, "value_mgdl": 120}],
///   "treatments": [{"timestamp_ms": 1432864800000, "carbs": 40}],
///   "devicestatus": [],
///   "profile": {"defaultProfile": "Default", "store": {"Default": {"basal": 0.8}}}
/// }
/// ```
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct Snapshot {
    #[serde(default)]
    pub entries: Vec<GlucoseReading>,
    #[serde(default)]
    pub treatments: Vec<Treatment>,
    #[serde(default, alias = "device_statuses")]
    pub devicestatus: Vec<DeviceStatus>,
    #[serde(default)]
    pub profile: Option<ProfileStore>,
}

impl Snapshot {
    pub fn load(path: &Path) -> Result<Self> {
        let reader = BufReader::new(File::open(path)?);
        let snapshot: Snapshot = serde_json::from_reader(reader)?;
        tracing::info!(
            "Loaded snapshot {:?}: {} entries, {} treatments, {} device statuses",
            path,
            snapshot.entries.len(),
            snapshot.treatments.len(),
            snapshot.devicestatus.len()
        );
        Ok(snapshot)
    }

    /// A resolver loaded with the profile store and the override treatments
    ///
    /// Without a profile store lookups fall back to their defaults.
    pub fn resolver(&self) -> Result<ProfileResolver> {
        let resolver = match &self.profile {
            Some(store) => ProfileResolver::with_store(store)?,
            None => {
                tracing::warn!("Snapshot has no profile store");
                ProfileResolver::new()
            }
        };
        resolver.update_from_treatments(&self.treatments);
        Ok(resolver)
    }

    /// Newest timestamp across entries, treatments and device statuses
    pub fn latest_timestamp_ms(&self) -> Option<i64> {
        let entries = self.entries.iter().map(|e| e.timestamp_ms);
        let treatments = self.treatments.iter().map(|t| t.timestamp_ms);
        let statuses = self.devicestatus.iter().map(|s| s.timestamp_ms);
        entries.chain(treatments).chain(statuses).max()
    }
}

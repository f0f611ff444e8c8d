//! Configuration file support for glyco.
//!
//! Configuration is loaded from `$XDG_CONFIG_HOME/glyco/config.toml`.
//! Every key is optional; missing keys take the documented defaults.

use crate::forecast::ForecastSettings;
use crate::kinetics::{InsulinCurve, KineticsSettings, DEFAULT_CURVE};
use crate::{Error, Result, Units};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Application configuration
#[derive(Clone, Debug, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub forecast: ForecastConfig,

    #[serde(default)]
    pub kinetics: KineticsConfig,
}

/// Forecast targets and alarms
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ForecastConfig {
    /// High target in mg/dL
    #[serde(default = "default_bg_target_top")]
    pub bg_target_top: f64,

    /// Low target in mg/dL
    #[serde(default = "default_bg_target_bottom")]
    pub bg_target_bottom: f64,

    #[serde(default = "default_true")]
    pub alarm_high: bool,

    #[serde(default = "default_true")]
    pub alarm_low: bool,

    #[serde(default)]
    pub units: Units,
}

impl Default for ForecastConfig {
    fn default() -> Self {
        Self {
            bg_target_top: default_bg_target_top(),
            bg_target_bottom: default_bg_target_bottom(),
            alarm_high: true,
            alarm_low: true,
            units: Units::default(),
        }
    }
}

/// Insulin curve and carb absorption parameters
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct KineticsConfig {
    /// Preset name: "rapid-acting", "ultra-rapid" or "bilinear"
    #[serde(default = "default_insulin_curve")]
    pub insulin_curve: String,

    /// Custom peak for an exponential curve, overriding the preset's
    #[serde(default)]
    pub peak_minutes: Option<f64>,

    #[serde(default = "default_staleness_minutes")]
    pub staleness_minutes: f64,

    #[serde(default = "default_future_tolerance_minutes")]
    pub future_tolerance_minutes: f64,

    /// Used when the profile has no carbs_hr
    #[serde(default = "default_carbs_hr")]
    pub default_carbs_hr: f64,

    /// Used when the profile has no delay
    #[serde(default = "default_carb_delay_min")]
    pub carb_delay_min: f64,
}

impl Default for KineticsConfig {
    fn default() -> Self {
        Self {
            insulin_curve: default_insulin_curve(),
            peak_minutes: None,
            staleness_minutes: default_staleness_minutes(),
            future_tolerance_minutes: default_future_tolerance_minutes(),
            default_carbs_hr: default_carbs_hr(),
            carb_delay_min: default_carb_delay_min(),
        }
    }
}

// Default value functions
fn default_bg_target_top() -> f64 {
    180.0
}

fn default_bg_target_bottom() -> f64 {
    80.0
}

fn default_true() -> bool {
    true
}

fn default_insulin_curve() -> String {
    DEFAULT_CURVE.into()
}

fn default_staleness_minutes() -> f64 {
    30.0
}

fn default_future_tolerance_minutes() -> f64 {
    5.0
}

fn default_carbs_hr() -> f64 {
    30.0
}

fn default_carb_delay_min() -> f64 {
    20.0
}

impl ForecastConfig {
    pub fn settings(&self) -> ForecastSettings {
        ForecastSettings {
            bg_target_top: self.bg_target_top,
            bg_target_bottom: self.bg_target_bottom,
            alarm_high: self.alarm_high,
            alarm_low: self.alarm_low,
            units: self.units,
        }
    }
}

impl KineticsConfig {
    /// Resolve the curve name and numeric settings
    pub fn settings(&self) -> Result<KineticsSettings> {
        let preset = InsulinCurve::preset(&self.insulin_curve).ok_or_else(|| {
            Error::Configuration(format!(
                "Unknown insulin curve {:?}, expected one of {}",
                self.insulin_curve,
                InsulinCurve::preset_names().join(", ")
            ))
        })?;

        let insulin_curve = match (preset, self.peak_minutes) {
            (InsulinCurve::Bilinear, Some(peak)) => {
                tracing::warn!("peak_minutes = {} ignored for the bilinear curve", peak);
                preset
            }
            (_, Some(peak)) if peak.is_finite() && peak > 0.0 => InsulinCurve::with_peak(peak),
            (_, Some(peak)) => {
                return Err(Error::Configuration(format!(
                    "peak_minutes must be positive, got {}",
                    peak
                )))
            }
            (_, None) => preset,
        };

        for (key, value) in [
            ("staleness_minutes", self.staleness_minutes),
            ("future_tolerance_minutes", self.future_tolerance_minutes),
            ("carb_delay_min", self.carb_delay_min),
        ] {
            if !value.is_finite() || value < 0.0 {
                return Err(Error::Configuration(format!(
                    "{} must not be negative, got {}",
                    key, value
                )));
            }
        }
        if !self.default_carbs_hr.is_finite() || self.default_carbs_hr <= 0.0 {
            return Err(Error::Configuration(format!(
                "default_carbs_hr must be positive, got {}",
                self.default_carbs_hr
            )));
        }

        Ok(KineticsSettings {
            insulin_curve,
            staleness_minutes: self.staleness_minutes,
            future_tolerance_minutes: self.future_tolerance_minutes,
            default_carbs_hr: self.default_carbs_hr,
            default_carb_delay_min: self.carb_delay_min,
            ..KineticsSettings::default()
        })
    }
}

impl Config {
    /// Load configuration from the standard config path
    pub fn load() -> Result<Self> {
        let config_path = Self::default_config_path();
        if config_path.exists() {
            Self::load_from(&config_path)
        } else {
            tracing::info!("No config file found at {:?}, using defaults", config_path);
            Ok(Self::default())
        }
    }

    /// Load configuration from a specific path
    pub fn load_from(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&contents)?;
        tracing::info!("Loaded config from {:?}", path);
        Ok(config)
    }

    /// Get the default config file path
    pub fn default_config_path() -> PathBuf {
        let base = dirs::config_dir()
            .or_else(|| dirs::home_dir().map(|home| home.join(".config")))
            .unwrap_or_default();
        base.join("glyco").join("config.toml")
    }

    /// Save the current configuration to a specific path
    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let contents = toml::to_string_pretty(self)
            .map_err(|e| Error::Configuration(format!("Failed to serialize config: {}", e)))?;
        std::fs::write(path, contents)?;
        tracing::info!("Saved config to {:?}", path);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.forecast.settings(), ForecastSettings::default());
        assert_eq!(
            config.kinetics.settings().unwrap(),
            KineticsSettings::default()
        );
    }

    #[test]
    fn test_partial_config() {
        let toml_str = r#"
[forecast]
bg_target_top = 200
units = "mmol"

[kinetics]
insulin_curve = "ultra-rapid"
"#;
        let config: Config = toml::from_str(toml_str).unwrap();
        let forecast = config.forecast.settings();
        assert_eq!(forecast.bg_target_top, 200.0);
        assert_eq!(forecast.bg_target_bottom, 80.0); // default
        assert_eq!(forecast.units, Units::Mmol);

        let kinetics = config.kinetics.settings().unwrap();
        assert_eq!(kinetics.insulin_curve, InsulinCurve::with_peak(55.0));
        assert_eq!(kinetics.staleness_minutes, 30.0);
    }

    #[test]
    fn test_custom_peak_and_bad_curve() {
        let config: Config = toml::from_str("[kinetics]\npeak_minutes = 65").unwrap();
        assert_eq!(
            config.kinetics.settings().unwrap().insulin_curve,
            InsulinCurve::with_peak(65.0)
        );

        let config: Config = toml::from_str("[kinetics]\ninsulin_curve = \"nph\"").unwrap();
        assert!(matches!(
            config.kinetics.settings(),
            Err(Error::Configuration(_))
        ));

        let config: Config = toml::from_str("[kinetics]\ndefault_carbs_hr = 0").unwrap();
        assert!(config.kinetics.settings().is_err());
    }

    #[test]
    fn test_save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("config.toml");

        let mut config = Config::default();
        config.kinetics.insulin_curve = "bilinear".into();
        config.forecast.alarm_low = false;
        config.save_to(&path).unwrap();

        let loaded = Config::load_from(&path).unwrap();
        assert!(!loaded.forecast.alarm_low);
        assert_eq!(
            loaded.kinetics.settings().unwrap().insulin_curve,
            InsulinCurve::Bilinear
        );
    }
}

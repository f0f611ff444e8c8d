#![forbid(unsafe_code)]

//! Core computations for the glyco glucose tools.
//!
//! This crate provides:
//! - Domain types (readings, treatments, device statuses, units)
//! - Profile resolution (time-of-day schedules with overrides)
//! - Kinetics (insulin and carbs on board)
//! - Glucose statistics and the AR(2) forecast
//! - Configuration, snapshot and CSV input

pub mod types;
pub mod error;
pub mod config;
pub mod logging;
pub mod history;
pub mod stats;
pub mod profile;
pub mod kinetics;
pub mod forecast;
pub mod snapshot;

// Re-export commonly used types
pub use error::{Error, Result};
pub use types::*;
pub use config::Config;
pub use profile::{BasalRate, Parameter, ProfileResolver, ProfileSchedule, ProfileStore};
pub use kinetics::{
    from_device_status, InsulinCurve, KineticsEngine, KineticsResult, KineticsSettings, Quantity,
    TreatmentContribution,
};
pub use forecast::{
    calculate_forecast, can_forecast, forecast_from_history, generate_forecast_cone, ConePoint,
    ForecastResult, ForecastSettings,
};
pub use stats::{BgNow, Delta, GlucoseStats};
pub use history::load_readings_csv;
pub use snapshot::Snapshot;

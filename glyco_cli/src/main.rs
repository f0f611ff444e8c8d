use clap::{Parser, Subcommand};
use glyco_core::history::{normalize, parse_timestamp_ms};
use glyco_core::*;
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "glyco")]
#[command(about = "Glucose forecast and insulin/carbs on board calculator", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// JSON snapshot with entries, treatments, devicestatus and profile
    #[arg(long, global = true)]
    snapshot: Option<PathBuf>,

    /// CSV of glucose readings (timestamp,mgdl,noise) merged into the entries
    #[arg(long, global = true)]
    entries_csv: Option<PathBuf>,

    /// Evaluation time as RFC 3339 or epoch milliseconds [default: newest input timestamp]
    #[arg(long, global = true)]
    at: Option<String>,

    /// Config file [default: ~/.config/glyco/config.toml]
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Print results as JSON
    #[arg(long, global = true)]
    json: bool,

    /// More log output on stderr (-v info, -vv debug, -vvv trace)
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,
}

#[derive(Subcommand)]
enum Commands {
    /// Predict glucose for the next 30 minutes
    Forecast,

    /// Uncertainty cone for the next 65 minutes
    Cone {
        /// Width multiplier; 0 gives only the centre line
        #[arg(long, default_value_t = 2.0)]
        cone_factor: f64,
    },

    /// Insulin on board
    Iob,

    /// Carbs on board
    Cob,

    /// Basal rate with temp basal and combo bolus applied
    Basal,

    /// Look up a scheduled profile parameter
    Profile {
        /// basal, sens, carbratio, target_low or target_high
        parameter: String,
    },
}

/// Everything a command needs, loaded once
struct Inputs {
    snapshot: Snapshot,
    at_ms: i64,
    config: Config,
}

impl Inputs {
    fn load(cli: &Cli) -> Result<Self> {
        let config = match &cli.config {
            Some(path) => Config::load_from(path)?,
            None => Config::load()?,
        };

        let mut snapshot = match &cli.snapshot {
            Some(path) => Snapshot::load(path)?,
            None => Snapshot::default(),
        };
        if let Some(path) = &cli.entries_csv {
            snapshot.entries.extend(load_readings_csv(path)?);
        }

        let at_ms = match &cli.at {
            Some(raw) => parse_timestamp_ms(raw)?,
            None => snapshot
                .latest_timestamp_ms()
                .unwrap_or_else(|| chrono::Utc::now().timestamp_millis()),
        };
        tracing::debug!("Evaluating at {}", at_ms);

        Ok(Self {
            snapshot,
            at_ms,
            config,
        })
    }

    /// Readings up to the evaluation time, oldest first
    fn history(&self) -> Vec<GlucoseReading> {
        normalize(&self.snapshot.entries)
            .into_iter()
            .filter(|r| r.timestamp_ms <= self.at_ms)
            .collect()
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    glyco_core::logging::init_with_level(glyco_core::logging::level_for_verbosity(cli.verbose));

    let inputs = Inputs::load(&cli)?;

    match &cli.command {
        Commands::Forecast => cmd_forecast(&inputs, cli.json),
        Commands::Cone { cone_factor } => cmd_cone(&inputs, *cone_factor, cli.json),
        Commands::Iob => cmd_kinetics(&inputs, Quantity::Iob, cli.json),
        Commands::Cob => cmd_kinetics(&inputs, Quantity::Cob, cli.json),
        Commands::Basal => cmd_basal(&inputs, cli.json),
        Commands::Profile { parameter } => cmd_profile(&inputs, parameter, cli.json),
    }
}

fn print_json<T: serde::Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn minutes_after(at_ms: i64, timestamp_ms: i64) -> i64 {
    (timestamp_ms - at_ms) / MINUTE_MS
}

fn cmd_forecast(inputs: &Inputs, json: bool) -> Result<()> {
    let settings = inputs.config.forecast.settings();
    let history = inputs.history();
    let result = forecast_from_history(&history, &settings);

    if json {
        return print_json(&result);
    }

    if result.predicted.is_empty() {
        println!("Not enough recent glucose data to forecast");
        return Ok(());
    }

    println!("{}", result.display_line);
    let start = GlucoseStats::from_history(&history)
        .bg_now
        .map(|now| now.mills)
        .unwrap_or(inputs.at_ms);
    for point in &result.predicted {
        println!(
            "  +{:>2}m  {}",
            minutes_after(start, point.timestamp_ms),
            settings.units.format(point.value_mgdl)
        );
    }
    println!("Loss: {:.4} ({:?})", result.avg_loss, result.level);
    if let Some(event) = result.event_name {
        println!("Predicted {}", event);
    }
    Ok(())
}

fn cmd_cone(inputs: &Inputs, cone_factor: f64, json: bool) -> Result<()> {
    let units = inputs.config.forecast.settings().units;
    let history = inputs.history();
    let stats = GlucoseStats::from_history(&history);
    let cone = generate_forecast_cone(
        &history,
        stats.bg_now.as_ref(),
        stats.delta.as_ref(),
        cone_factor,
    );

    if json {
        return print_json(&cone);
    }

    let Some(now) = stats.bg_now.filter(|_| !cone.is_empty()) else {
        println!("Not enough recent glucose data to forecast");
        return Ok(());
    };

    for point in &cone {
        println!(
            "  +{:>2}m  {}",
            minutes_after(now.mills, point.timestamp_ms),
            units.format(point.value_mgdl)
        );
    }
    Ok(())
}

fn cmd_kinetics(inputs: &Inputs, quantity: Quantity, json: bool) -> Result<()> {
    let engine = KineticsEngine::new(inputs.config.kinetics.settings()?);
    let resolver = inputs.snapshot.resolver()?;
    let snapshot = &inputs.snapshot;

    let result = match quantity {
        Quantity::Iob => engine.iob_total(
            &snapshot.treatments,
            &snapshot.devicestatus,
            &resolver,
            inputs.at_ms,
        )?,
        Quantity::Cob => engine.cob_total(
            &snapshot.treatments,
            &snapshot.devicestatus,
            &resolver,
            inputs.at_ms,
        )?,
    };

    if json {
        return print_json(&result);
    }

    match &result.device {
        Some(device) => println!("{} ({}, {})", result.display_line, result.source, device),
        None => println!("{} ({})", result.display_line, result.source),
    }
    Ok(())
}

fn cmd_basal(inputs: &Inputs, json: bool) -> Result<()> {
    let resolver = inputs.snapshot.resolver()?;
    let rate = resolver.get_basal_rate(inputs.at_ms)?;

    if json {
        return print_json(&rate);
    }

    println!("{}", rate.display_line());
    if rate.total != rate.base {
        println!("  scheduled {:.3}U", rate.base);
    }
    Ok(())
}

fn cmd_profile(inputs: &Inputs, parameter: &str, json: bool) -> Result<()> {
    let parameter: Parameter = parameter.parse()?;
    let resolver = inputs.snapshot.resolver()?;
    let value = resolver.get_value(inputs.at_ms, parameter, None)?;
    let profile = resolver.active_profile_name(inputs.at_ms)?;

    if json {
        return print_json(&serde_json::json!({
            "parameter": parameter.key(),
            "profile": profile,
            "value": value,
        }));
    }

    match value {
        Some(value) => println!("{}: {}", parameter.key(), value),
        None => println!("{}: no profile loaded", parameter.key()),
    }
    Ok(())
}

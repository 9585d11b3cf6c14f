use chrono::{DateTime, Utc};
use clap::{App, Arg, ArgMatches, SubCommand};
use colored::*;
use fleetsim::detection::{DetectionScore, Detector, EnvelopeDetector, ThresholdDetector};
use fleetsim::{EnvelopeSource, EnvelopeTable, FleetConfig, FleetSimulator};
use std::error::Error;
use std::str::FromStr;

const DEFAULT_TICKS: &str = "10";

fn main() -> Result<(), Box<dyn Error>> {
    let matches = App::new("fleetsim")
        .version(env!("CARGO_PKG_VERSION"))
        .about("Fleet telemetry simulator tooling")
        .arg(
            Arg::with_name("format")
                .short("f")
                .long("format")
                .value_name("FORMAT")
                .help("Output format")
                .takes_value(true)
                .possible_values(&["table", "json"])
                .default_value("table")
                .global(true),
        )
        .arg(
            Arg::with_name("dataset")
                .long("dataset")
                .value_name("CSV")
                .help("Operational readout dataset (overrides OPERATIONAL_DATASET)")
                .takes_value(true)
                .global(true),
        )
        .arg(
            Arg::with_name("max-rows")
                .long("max-rows")
                .value_name("N")
                .help("Read at most N dataset rows (default 1000, overrides DATASET_MAX_ROWS)")
                .takes_value(true)
                .global(true),
        )
        .subcommand(
            SubCommand::with_name("envelopes")
                .about("Show the signal envelopes the simulator would use"),
        )
        .subcommand(
            SubCommand::with_name("sample")
                .about("Generate telemetry offline and print one JSON record per line")
                .args(&generation_args()),
        )
        .subcommand(
            SubCommand::with_name("evaluate")
                .about("Score a reference detector against injected anomalies")
                .args(&generation_args())
                .arg(
                    Arg::with_name("detector")
                        .long("detector")
                        .value_name("DETECTOR")
                        .takes_value(true)
                        .possible_values(&["threshold", "envelope"])
                        .default_value("envelope"),
                ),
        )
        .get_matches();

    let format = matches.value_of("format").unwrap_or("table");

    match matches.subcommand() {
        ("envelopes", Some(sub)) => handle_envelopes(sub, format)?,
        ("sample", Some(sub)) => handle_sample(sub)?,
        ("evaluate", Some(sub)) => handle_evaluate(sub, format)?,
        _ => {
            println!("{}", "No command specified. Use --help for usage information.".yellow());
            println!("{}", "Quick start:".bright_green());
            println!("  {} Inspect signal envelopes", "fleetsim envelopes".bright_cyan());
            println!("  {} Print a few ticks of telemetry", "fleetsim sample --ticks 3".bright_cyan());
            println!("  {} Measure detectability", "fleetsim evaluate --anomaly-prob 0.1".bright_cyan());
        }
    }

    Ok(())
}

fn generation_args() -> Vec<Arg<'static, 'static>> {
    vec![
        Arg::with_name("ticks")
            .long("ticks")
            .value_name("N")
            .takes_value(true)
            .default_value(DEFAULT_TICKS)
            .help("Number of ticks to generate"),
        Arg::with_name("vehicles")
            .long("vehicles")
            .value_name("N")
            .takes_value(true)
            .help("Fleet size (overrides NUM_VEHICLES)"),
        Arg::with_name("seed")
            .long("seed")
            .value_name("SEED")
            .takes_value(true)
            .help("Seed for a reproducible run"),
        Arg::with_name("mode")
            .long("mode")
            .value_name("MODE")
            .takes_value(true)
            .possible_values(&["random-walk", "stateless"])
            .help("Evolution mode"),
        Arg::with_name("anomaly-prob")
            .long("anomaly-prob")
            .value_name("P")
            .takes_value(true)
            .help("Per-vehicle, per-tick anomaly probability"),
        Arg::with_name("specs")
            .long("specs")
            .value_name("CSV")
            .takes_value(true)
            .help("Vehicle specification dataset"),
        Arg::with_name("start")
            .long("start")
            .value_name("RFC3339")
            .takes_value(true)
            .help("Timestamp of the first tick (default: now)"),
    ]
}

fn parse_arg<T>(matches: &ArgMatches<'_>, name: &str) -> Result<Option<T>, Box<dyn Error>>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    matches
        .value_of(name)
        .map(|raw| {
            raw.parse::<T>()
                .map_err(|e| Box::<dyn Error>::from(format!("invalid --{name} '{raw}': {e}")))
        })
        .transpose()
}

/// Environment configuration with command-line overrides applied on top.
fn fleet_config(matches: &ArgMatches<'_>) -> Result<FleetConfig, Box<dyn Error>> {
    let mut config = FleetConfig::from_env()?;

    if let Some(path) = matches.value_of("dataset") {
        config.datasets.operational = Some(path.into());
    }
    if let Some(rows) = parse_arg(matches, "max-rows")? {
        config.datasets.max_rows = Some(rows);
    }
    if let Some(path) = matches.value_of("specs") {
        config.datasets.specifications = Some(path.into());
    }
    if let Some(vehicles) = parse_arg(matches, "vehicles")? {
        config.vehicle_count = vehicles;
    }
    if let Some(seed) = parse_arg(matches, "seed")? {
        config.seed = Some(seed);
    }
    if let Some(mode) = parse_arg(matches, "mode")? {
        config.evolution_mode = mode;
    }
    if let Some(p) = parse_arg(matches, "anomaly-prob")? {
        config.anomaly.tick_probability = p;
    }

    config.validate()?;
    Ok(config)
}

fn start_time(matches: &ArgMatches<'_>) -> Result<DateTime<Utc>, Box<dyn Error>> {
    match matches.value_of("start") {
        Some(raw) => Ok(DateTime::parse_from_rfc3339(raw)
            .map_err(|e| format!("invalid --start '{raw}': {e}"))?
            .with_timezone(&Utc)),
        None => Ok(Utc::now()),
    }
}

fn handle_envelopes(matches: &ArgMatches<'_>, format: &str) -> Result<(), Box<dyn Error>> {
    let config = fleet_config(matches)?;
    let (table, source) = EnvelopeTable::load_or_fallback(
        config.datasets.operational.as_deref(),
        config.datasets.max_rows,
    );

    if format == "json" {
        println!("{}", serde_json::to_string_pretty(&table)?);
        return Ok(());
    }

    match &source {
        EnvelopeSource::Dataset { name, rows } => {
            println!("{} {} ({} rows)", "Source:".bright_white(), name.bright_green(), rows);
        }
        EnvelopeSource::Fallback { reason } => {
            println!("{} {} ({})", "Source:".bright_white(), "built-in".yellow(), reason);
        }
    }
    println!(
        "{:<20} {:>12} {:>12} {:>12} {:>12}",
        "signal".bold(),
        "mean".bold(),
        "std".bold(),
        "min".bold(),
        "max".bold()
    );
    for (name, e) in table.iter() {
        println!(
            "{:<20} {:>12.3} {:>12.3} {:>12.3} {:>12.3}",
            name.bright_cyan(),
            e.mean,
            e.std_dev,
            e.min,
            e.max
        );
    }
    Ok(())
}

fn build_simulator(config: &FleetConfig) -> Result<FleetSimulator, Box<dyn Error>> {
    Ok(FleetSimulator::from_config(config)?)
}

fn handle_sample(matches: &ArgMatches<'_>) -> Result<(), Box<dyn Error>> {
    let config = fleet_config(matches)?;
    let ticks: u64 = parse_arg(matches, "ticks")?.unwrap_or(0);
    let mut timestamp = start_time(matches)?;
    let step = chrono::Duration::from_std(config.tick_interval)?;

    let mut simulator = build_simulator(&config)?;
    for _ in 0..ticks {
        for record in simulator.generate_tick(timestamp) {
            println!("{}", record.to_json()?);
        }
        timestamp += step;
    }
    Ok(())
}

fn handle_evaluate(matches: &ArgMatches<'_>, format: &str) -> Result<(), Box<dyn Error>> {
    let config = fleet_config(matches)?;
    let ticks: u64 = parse_arg(matches, "ticks")?.unwrap_or(0);
    let mut timestamp = start_time(matches)?;
    let step = chrono::Duration::from_std(config.tick_interval)?;

    let mut simulator = build_simulator(&config)?;
    let detector: Box<dyn Detector> = match matches.value_of("detector") {
        Some("threshold") => Box::new(ThresholdDetector::overspeed()),
        _ => Box::new(EnvelopeDetector::new(simulator.envelopes().clone())),
    };

    let mut score = DetectionScore::default();
    for _ in 0..ticks {
        for record in simulator.generate_tick(timestamp) {
            score.observe(detector.as_ref(), &record);
        }
        timestamp += step;
    }

    if format == "json" {
        println!("{}", serde_json::to_string_pretty(&score)?);
        return Ok(());
    }

    println!("{}", "Detection score".bright_blue().bold());
    println!("{} {}", "Records:".bright_white(), score.total());
    println!(
        "{} tp={} fp={} tn={} fn={}",
        "Confusion:".bright_white(),
        score.true_positives,
        score.false_positives,
        score.true_negatives,
        score.false_negatives
    );
    println!("{} {:.3}", "Precision:".bright_white(), score.precision());
    println!("{} {:.3}", "Recall:".bright_white(), score.recall());
    println!("{} {:.3}", "Accuracy:".bright_white(), score.accuracy());
    Ok(())
}

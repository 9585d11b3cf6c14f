//! Simulator configuration.
//!
//! Every option has a documented default and can be overridden through an
//! environment variable. Values are validated up front: a bad number would
//! corrupt every tick that follows, so construction fails instead.

use crate::evolution::{AnomalyConfig, AnomalyDirection, EvolutionConfig, EvolutionMode, WalkProfile};
use crate::specs::SpecMode;
use std::fmt::Display;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

const DEFAULT_VEHICLE_COUNT: usize = 30;
const DEFAULT_VEHICLE_ID_PREFIX: &str = "TRUCK-";
const DEFAULT_TICK_INTERVAL_SECS: f64 = 3.0;
const DEFAULT_BACKEND_URL: &str = "http://localhost:8081";
const DEFAULT_BACKEND_PATH: &str = "/api/telemetry/ingest";
pub const DEFAULT_HEALTH_PATH: &str = "/actuator/health";
const DEFAULT_HTTP_TIMEOUT_MS: u64 = 5000;
const DEFAULT_NATS_URL: &str = "nats://localhost:4222";
const DEFAULT_TELEMETRY_SUBJECT: &str = "fleet.telemetry";
const MAX_DECIMALS: u32 = 6;
/// Rows read from each dataset unless `DATASET_MAX_ROWS` says otherwise.
pub const DEFAULT_DATASET_MAX_ROWS: usize = 1000;

#[derive(Debug, Error, PartialEq)]
pub enum ConfigError {
    #[error("invalid {key} '{value}': {reason}")]
    Invalid {
        key: &'static str,
        value: String,
        reason: String,
    },
    #[error("{key} out of range: {reason}")]
    OutOfRange { key: &'static str, reason: String },
}

#[derive(Debug, Clone, PartialEq)]
pub enum TransportConfig {
    Http {
        base_url: String,
        path: String,
        /// Probed once at startup, never per record.
        health_path: String,
        timeout: Duration,
    },
    Nats {
        url: String,
        subject: String,
    },
    Stdout,
}

impl Default for TransportConfig {
    fn default() -> Self {
        TransportConfig::Http {
            base_url: DEFAULT_BACKEND_URL.to_string(),
            path: DEFAULT_BACKEND_PATH.to_string(),
            health_path: DEFAULT_HEALTH_PATH.to_string(),
            timeout: Duration::from_millis(DEFAULT_HTTP_TIMEOUT_MS),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct DatasetPaths {
    pub operational: Option<PathBuf>,
    pub specifications: Option<PathBuf>,
    /// Cap on rows read from the operational dataset; `None` reads everything.
    pub max_rows: Option<usize>,
}

impl Default for DatasetPaths {
    fn default() -> Self {
        Self {
            operational: None,
            specifications: None,
            max_rows: Some(DEFAULT_DATASET_MAX_ROWS),
        }
    }
}

fn row_cap(raw: &str) -> Result<Option<usize>, ConfigError> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "all" | "none" | "unlimited" => Ok(None),
        _ => parse("DATASET_MAX_ROWS", raw).map(Some),
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct FleetConfig {
    pub vehicle_count: usize,
    pub vehicle_id_prefix: String,
    pub tick_interval: Duration,
    /// Pause between vehicles inside one tick.
    pub vehicle_stagger: Duration,
    pub run_duration: Option<Duration>,
    pub seed: Option<u64>,
    pub evolution_mode: EvolutionMode,
    pub spec_mode: SpecMode,
    pub anomaly: AnomalyConfig,
    pub decimals: u32,
    pub datasets: DatasetPaths,
    pub transport: TransportConfig,
    /// Abort startup when the receiver's health check fails.
    pub require_healthy_backend: bool,
}

impl Default for FleetConfig {
    fn default() -> Self {
        Self {
            vehicle_count: DEFAULT_VEHICLE_COUNT,
            vehicle_id_prefix: DEFAULT_VEHICLE_ID_PREFIX.to_string(),
            tick_interval: Duration::from_secs_f64(DEFAULT_TICK_INTERVAL_SECS),
            vehicle_stagger: Duration::ZERO,
            run_duration: None,
            seed: None,
            evolution_mode: EvolutionMode::RandomWalk,
            spec_mode: SpecMode::Stable,
            anomaly: AnomalyConfig::default(),
            decimals: crate::evolution::DEFAULT_DECIMALS,
            datasets: DatasetPaths::default(),
            transport: TransportConfig::default(),
            require_healthy_backend: false,
        }
    }
}

fn parse<T>(key: &'static str, raw: &str) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: Display,
{
    raw.trim().parse().map_err(|e: T::Err| ConfigError::Invalid {
        key,
        value: raw.to_string(),
        reason: e.to_string(),
    })
}

fn seconds(key: &'static str, raw: &str) -> Result<Duration, ConfigError> {
    let secs: f64 = parse(key, raw)?;
    Duration::try_from_secs_f64(secs).map_err(|e| ConfigError::Invalid {
        key,
        value: raw.to_string(),
        reason: e.to_string(),
    })
}

fn probability(key: &'static str, value: f64) -> Result<(), ConfigError> {
    if value.is_finite() && (0.0..=1.0).contains(&value) {
        Ok(())
    } else {
        Err(ConfigError::OutOfRange {
            key,
            reason: format!("{value} is not a probability in [0, 1]"),
        })
    }
}

impl FleetConfig {
    /// Load configuration from the process environment.
    ///
    /// Recognized variables (all optional):
    /// - `NUM_VEHICLES` -- fleet size (default 30)
    /// - `VEHICLE_ID_PREFIX` -- id prefix (default `TRUCK-`)
    /// - `SEND_INTERVAL` -- tick interval in seconds (default 3.0)
    /// - `VEHICLE_STAGGER_MS` -- delay between vehicles in a tick (default 0)
    /// - `SIMULATE_DURATION` -- stop after this many seconds (default: run forever)
    /// - `SIMULATION_SEED` -- seed for reproducible runs
    /// - `ANOMALY_PROB`, `ANOMALY_SIGNAL_PROB`, `ANOMALY_MAGNITUDE`, `ANOMALY_DIRECTION`
    /// - `EVOLUTION_MODE` -- `random-walk` or `stateless`
    /// - `SPEC_MODE` -- `stable` or `resample`
    /// - `SIGNAL_DECIMALS` -- rounding precision (default 2)
    /// - `OPERATIONAL_DATASET`, `SPECIFICATIONS_DATASET`
    /// - `DATASET_MAX_ROWS` -- rows read per dataset (default 1000, `all` for no cap)
    /// - `TRANSPORT` -- `http`, `nats` or `stdout`
    /// - `BACKEND_URL`, `BACKEND_PATH`, `HTTP_TIMEOUT_MS`
    /// - `HEALTH_PATH` -- receiver health route (default `/actuator/health`)
    /// - `REQUIRE_BACKEND_HEALTH` -- `true` aborts startup on a failed health check
    /// - `NATS_URL`, `TELEMETRY_SUBJECT`
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load configuration through an arbitrary key lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());
        let mut config = Self::default();

        if let Some(raw) = get("NUM_VEHICLES") {
            config.vehicle_count = parse("NUM_VEHICLES", &raw)?;
        }
        if let Some(raw) = get("VEHICLE_ID_PREFIX") {
            config.vehicle_id_prefix = raw;
        }
        if let Some(raw) = get("SEND_INTERVAL") {
            config.tick_interval = seconds("SEND_INTERVAL", &raw)?;
        }
        if let Some(raw) = get("VEHICLE_STAGGER_MS") {
            config.vehicle_stagger = Duration::from_millis(parse("VEHICLE_STAGGER_MS", &raw)?);
        }
        if let Some(raw) = get("SIMULATE_DURATION") {
            config.run_duration = Some(seconds("SIMULATE_DURATION", &raw)?);
        }
        if let Some(raw) = get("SIMULATION_SEED") {
            config.seed = Some(parse("SIMULATION_SEED", &raw)?);
        }

        if let Some(raw) = get("ANOMALY_PROB") {
            config.anomaly.tick_probability = parse("ANOMALY_PROB", &raw)?;
        }
        if let Some(raw) = get("ANOMALY_SIGNAL_PROB") {
            config.anomaly.signal_probability = parse("ANOMALY_SIGNAL_PROB", &raw)?;
        }
        if let Some(raw) = get("ANOMALY_MAGNITUDE") {
            config.anomaly.magnitude_sigmas = parse("ANOMALY_MAGNITUDE", &raw)?;
        }
        if let Some(raw) = get("ANOMALY_DIRECTION") {
            config.anomaly.direction = parse::<AnomalyDirection>("ANOMALY_DIRECTION", &raw)?;
        }
        if let Some(raw) = get("EVOLUTION_MODE") {
            config.evolution_mode = parse("EVOLUTION_MODE", &raw)?;
        }
        if let Some(raw) = get("SPEC_MODE") {
            config.spec_mode = parse("SPEC_MODE", &raw)?;
        }
        if let Some(raw) = get("SIGNAL_DECIMALS") {
            config.decimals = parse("SIGNAL_DECIMALS", &raw)?;
        }

        config.datasets = DatasetPaths {
            operational: get("OPERATIONAL_DATASET").map(PathBuf::from),
            specifications: get("SPECIFICATIONS_DATASET").map(PathBuf::from),
            max_rows: match get("DATASET_MAX_ROWS") {
                Some(raw) => row_cap(&raw)?,
                None => Some(DEFAULT_DATASET_MAX_ROWS),
            },
        };
        if let Some(raw) = get("REQUIRE_BACKEND_HEALTH") {
            config.require_healthy_backend = parse("REQUIRE_BACKEND_HEALTH", &raw)?;
        }

        let backend = get("TRANSPORT").unwrap_or_else(|| "http".to_string());
        config.transport = match backend.trim().to_ascii_lowercase().as_str() {
            "http" => TransportConfig::Http {
                base_url: get("BACKEND_URL").unwrap_or_else(|| DEFAULT_BACKEND_URL.to_string()),
                path: get("BACKEND_PATH").unwrap_or_else(|| DEFAULT_BACKEND_PATH.to_string()),
                health_path: get("HEALTH_PATH").unwrap_or_else(|| DEFAULT_HEALTH_PATH.to_string()),
                timeout: Duration::from_millis(
                    get("HTTP_TIMEOUT_MS")
                        .map(|raw| parse("HTTP_TIMEOUT_MS", &raw))
                        .transpose()?
                        .unwrap_or(DEFAULT_HTTP_TIMEOUT_MS),
                ),
            },
            "nats" | "queue" => TransportConfig::Nats {
                url: get("NATS_URL").unwrap_or_else(|| DEFAULT_NATS_URL.to_string()),
                subject: get("TELEMETRY_SUBJECT").unwrap_or_else(|| DEFAULT_TELEMETRY_SUBJECT.to_string()),
            },
            "stdout" => TransportConfig::Stdout,
            _ => {
                return Err(ConfigError::Invalid {
                    key: "TRANSPORT",
                    value: backend,
                    reason: "expected http, nats or stdout".to_string(),
                })
            }
        };

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.vehicle_count == 0 {
            return Err(ConfigError::OutOfRange {
                key: "NUM_VEHICLES",
                reason: "fleet must contain at least one vehicle".to_string(),
            });
        }
        if self.tick_interval.is_zero() {
            return Err(ConfigError::OutOfRange {
                key: "SEND_INTERVAL",
                reason: "tick interval must be positive".to_string(),
            });
        }
        probability("ANOMALY_PROB", self.anomaly.tick_probability)?;
        probability("ANOMALY_SIGNAL_PROB", self.anomaly.signal_probability)?;
        if !self.anomaly.magnitude_sigmas.is_finite() || self.anomaly.magnitude_sigmas < 0.0 {
            return Err(ConfigError::OutOfRange {
                key: "ANOMALY_MAGNITUDE",
                reason: format!("{} is not a non-negative number", self.anomaly.magnitude_sigmas),
            });
        }
        if self.decimals > MAX_DECIMALS {
            return Err(ConfigError::OutOfRange {
                key: "SIGNAL_DECIMALS",
                reason: format!("at most {MAX_DECIMALS} decimals are supported"),
            });
        }
        if self.datasets.max_rows == Some(0) {
            return Err(ConfigError::OutOfRange {
                key: "DATASET_MAX_ROWS",
                reason: "row cap must be positive".to_string(),
            });
        }
        Ok(())
    }

    /// `TRUCK-001`, `TRUCK-002`, ...
    pub fn vehicle_ids(&self) -> Vec<String> {
        (1..=self.vehicle_count)
            .map(|n| format!("{}{n:03}", self.vehicle_id_prefix))
            .collect()
    }

    pub fn evolution_config(&self) -> EvolutionConfig {
        EvolutionConfig {
            mode: self.evolution_mode,
            anomaly: self.anomaly.clone(),
            walk: WalkProfile::default(),
            decimals: self.decimals,
            tick_seconds: self.tick_interval.as_secs_f64(),
        }
    }
}

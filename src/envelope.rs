//! Per-signal statistical envelopes.
//!
//! An envelope is derived once at startup, either from historical readouts
//! or from the built-in fleet table, and is read-only for the rest of the
//! run.

use crate::dataset::{DatasetError, OperationalDataset};
use rand::Rng;
use rand_distr::{Distribution, Normal};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use tracing::{info, warn};

/// Built-in envelopes: (signal, mean, std_dev, min, max).
const FALLBACK_ENVELOPES: [(&str, f64, f64, f64, f64); 10] = [
    ("engine_temp", 85.0, 10.0, 60.0, 120.0),
    ("fuel_pressure", 45.0, 5.0, 30.0, 60.0),
    ("speed", 65.0, 15.0, 0.0, 120.0),
    ("rpm", 2200.0, 400.0, 800.0, 6000.0),
    ("oil_pressure", 35.0, 5.0, 20.0, 50.0),
    ("fuel_level", 75.0, 15.0, 0.0, 100.0),
    ("tire_pressure", 34.0, 3.0, 25.0, 40.0),
    ("coolant_temp", 85.0, 8.0, 70.0, 110.0),
    ("battery_voltage", 12.8, 0.5, 11.0, 14.0),
    ("exhaust_temp", 450.0, 50.0, 300.0, 600.0),
];

/// Deserialized envelopes go through [`SignalEnvelope::new`].
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(from = "EnvelopeFields")]
pub struct SignalEnvelope {
    pub mean: f64,
    pub std_dev: f64,
    pub min: f64,
    pub max: f64,
}

#[derive(Deserialize)]
struct EnvelopeFields {
    mean: f64,
    std_dev: f64,
    min: f64,
    max: f64,
}

impl From<EnvelopeFields> for SignalEnvelope {
    fn from(fields: EnvelopeFields) -> Self {
        Self::new(fields.mean, fields.std_dev, fields.min, fields.max)
    }
}

impl SignalEnvelope {
    /// Build an envelope, repairing inputs that would break the
    /// `min <= mean <= max`, `std_dev >= 0` invariant.
    pub fn new(mean: f64, std_dev: f64, min: f64, max: f64) -> Self {
        let (min, max) = if min <= max { (min, max) } else { (max, min) };
        let std_dev = if std_dev.is_finite() { std_dev.abs() } else { 0.0 };
        Self {
            mean: mean.max(min).min(max),
            std_dev,
            min,
            max,
        }
    }

    /// Arithmetic mean, sample standard deviation and extremes of `samples`.
    ///
    /// Returns `None` for an empty slice. A single sample has zero spread.
    pub fn from_samples(samples: &[f64]) -> Option<Self> {
        let first = *samples.first()?;
        let n = samples.len() as f64;

        let mut sum = 0.0;
        let mut min = first;
        let mut max = first;
        for &v in samples {
            sum += v;
            min = min.min(v);
            max = max.max(v);
        }
        let mean = sum / n;

        let std_dev = if samples.len() > 1 {
            let squares: f64 = samples.iter().map(|v| (v - mean).powi(2)).sum();
            (squares / (n - 1.0)).sqrt()
        } else {
            0.0
        };

        Some(Self::new(mean, std_dev, min, max))
    }

    pub fn clamp(&self, value: f64) -> f64 {
        if value.is_nan() {
            return self.mean;
        }
        // tolerates min > max on hand-built envelopes
        value.max(self.min).min(self.max)
    }

    pub fn contains(&self, value: f64) -> bool {
        value >= self.min && value <= self.max
    }

    pub fn span(&self) -> f64 {
        self.max - self.min
    }

    /// Standard score of `value`; zero when the envelope has no spread.
    pub fn z_score(&self, value: f64) -> f64 {
        if self.std_dev > 0.0 {
            (value - self.mean) / self.std_dev
        } else {
            0.0
        }
    }

    /// Draw from `Normal(mean, std_dev)` and clamp into the envelope.
    pub fn sample<R: Rng + ?Sized>(&self, rng: &mut R) -> f64 {
        match Normal::new(self.mean, self.std_dev) {
            Ok(normal) => self.clamp(normal.sample(rng)),
            Err(_) => self.mean,
        }
    }

    /// Round to `decimals` places without leaving the envelope. Never
    /// returns negative zero.
    pub fn round_within(&self, value: f64, decimals: u32) -> f64 {
        self.round_within_signed(value, decimals) + 0.0
    }

    fn round_within_signed(&self, value: f64, decimals: u32) -> f64 {
        let scale = 10f64.powi(decimals as i32);
        let rounded = (value * scale).round() / scale;
        if rounded > self.max {
            let down = (value * scale).floor() / scale;
            if self.contains(down) {
                return down;
            }
        } else if rounded < self.min {
            let up = (value * scale).ceil() / scale;
            if self.contains(up) {
                return up;
            }
        }
        self.clamp(rounded)
    }
}

/// Where an [`EnvelopeTable`] came from.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum EnvelopeSource {
    Dataset { name: String, rows: usize },
    Fallback { reason: String },
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EnvelopeTable {
    envelopes: BTreeMap<String, SignalEnvelope>,
}

impl EnvelopeTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// The built-in fleet signal set.
    pub fn fallback() -> Self {
        FALLBACK_ENVELOPES
            .iter()
            .map(|&(name, mean, std_dev, min, max)| {
                (name.to_string(), SignalEnvelope::new(mean, std_dev, min, max))
            })
            .collect()
    }

    pub fn from_dataset(dataset: &OperationalDataset) -> Self {
        dataset
            .columns()
            .iter()
            .filter_map(|column| {
                SignalEnvelope::from_samples(&column.values).map(|e| (column.name.clone(), e))
            })
            .collect()
    }

    pub fn from_path(path: &Path, max_rows: Option<usize>) -> Result<Self, DatasetError> {
        let dataset = OperationalDataset::from_path(path, max_rows)?;
        Ok(Self::from_dataset(&dataset))
    }

    /// Derive envelopes from `path`, or fall back to the built-in table when
    /// no path is configured or the dataset cannot be used.
    pub fn load_or_fallback(path: Option<&Path>, max_rows: Option<usize>) -> (Self, EnvelopeSource) {
        let Some(path) = path else {
            info!(signals = FALLBACK_ENVELOPES.len(), "no operational dataset configured, using built-in envelopes");
            return (
                Self::fallback(),
                EnvelopeSource::Fallback {
                    reason: "no dataset configured".to_string(),
                },
            );
        };

        match OperationalDataset::from_path(path, max_rows) {
            Ok(dataset) => {
                let table = Self::from_dataset(&dataset);
                info!(
                    dataset = dataset.source_name(),
                    rows = dataset.rows_read(),
                    signals = table.len(),
                    "derived signal envelopes from dataset"
                );
                let source = EnvelopeSource::Dataset {
                    name: dataset.source_name().to_string(),
                    rows: dataset.rows_read(),
                };
                (table, source)
            }
            Err(e) => {
                warn!(error = %e, "operational dataset unusable, using built-in envelopes");
                (
                    Self::fallback(),
                    EnvelopeSource::Fallback { reason: e.to_string() },
                )
            }
        }
    }

    pub fn insert(&mut self, name: &str, envelope: SignalEnvelope) {
        self.envelopes.insert(name.to_string(), envelope);
    }

    pub fn get(&self, name: &str) -> Option<&SignalEnvelope> {
        self.envelopes.get(name)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &SignalEnvelope)> {
        self.envelopes.iter().map(|(k, v)| (k.as_str(), v))
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.envelopes.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.envelopes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.envelopes.is_empty()
    }
}

impl FromIterator<(String, SignalEnvelope)> for EnvelopeTable {
    fn from_iter<I: IntoIterator<Item = (String, SignalEnvelope)>>(iter: I) -> Self {
        Self {
            envelopes: iter.into_iter().collect(),
        }
    }
}

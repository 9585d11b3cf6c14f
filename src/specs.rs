//! Descriptive vehicle attributes attached to every telemetry record.
//!
//! Resolution order for a vehicle: its own row in the reference table, a
//! random row of that table, then a spec synthesized from fixed candidate
//! sets. Resolution cannot fail.

use crate::dataset::{self, DatasetError, TableRow};
use rand::seq::SliceRandom;
use rand::Rng;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::str::FromStr;
use tracing::{debug, info, warn};

const SYNTHETIC_MAKES: [&str; 4] = ["Scania", "Volvo", "Mercedes", "MAN"];
const SYNTHETIC_ENGINE_TYPES: [&str; 5] = ["DC13", "DC16", "D16G", "OM471", "D26"];
const SYNTHETIC_CLASSES: [&str; 3] = ["Heavy", "Medium", "Light"];
const SYNTHETIC_FUEL_TYPE: &str = "Diesel";
const MODEL_SERIES_MIN: u32 = 100;
const MODEL_SERIES_MAX: u32 = 999;
const YEAR_MIN: i32 = 2018;
const YEAR_MAX: i32 = 2024;

const DEFAULT_MAKE: &str = "Unknown";
const DEFAULT_MODEL: &str = "Unknown";
const DEFAULT_YEAR: i32 = YEAR_MAX;
const DEFAULT_ENGINE_TYPE: &str = "Unknown";
const DEFAULT_VEHICLE_CLASS: &str = "Heavy";

const ID_KEYS: [&str; 3] = ["vehicle_id", "vehicleId", "id"];
const MAKE_KEYS: [&str; 2] = ["make", "manufacturer"];
const MODEL_KEYS: [&str; 1] = ["model"];
const YEAR_KEYS: [&str; 2] = ["year", "model_year"];
const ENGINE_KEYS: [&str; 2] = ["engine_type", "engineType"];
const FUEL_KEYS: [&str; 2] = ["fuel_type", "fuelType"];
const CLASS_KEYS: [&str; 2] = ["vehicle_class", "vehicleClass"];

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VehicleSpec {
    pub make: String,
    pub model: String,
    pub year: i32,
    pub engine_type: String,
    pub fuel_type: String,
    pub vehicle_class: String,
    /// Any further reference-table columns, emitted verbatim.
    #[serde(flatten)]
    pub extra: BTreeMap<String, Value>,
}

fn lookup<'a>(row: &'a TableRow, keys: &[&str]) -> Option<&'a Value> {
    keys.iter().find_map(|k| row.get(*k))
}

fn text(row: &TableRow, keys: &[&str]) -> Option<String> {
    match lookup(row, keys)? {
        Value::String(s) if !s.trim().is_empty() => Some(s.trim().to_string()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn integer(row: &TableRow, keys: &[&str]) -> Option<i32> {
    match lookup(row, keys)? {
        Value::Number(n) => n.as_i64().and_then(|v| i32::try_from(v).ok()),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

fn row_vehicle_id(row: &TableRow) -> Option<String> {
    text(row, &ID_KEYS)
}

impl VehicleSpec {
    /// Build a spec from a reference-table row.
    ///
    /// Missing attributes get fixed defaults and unrecognized columns are kept
    /// in `extra`. Returns `None` only for a row with nothing but an id.
    pub fn from_row(row: &TableRow) -> Option<Self> {
        let known: Vec<&str> = ID_KEYS
            .iter()
            .chain(&MAKE_KEYS)
            .chain(&MODEL_KEYS)
            .chain(&YEAR_KEYS)
            .chain(&ENGINE_KEYS)
            .chain(&FUEL_KEYS)
            .chain(&CLASS_KEYS)
            .copied()
            .collect();

        if row.keys().all(|k| ID_KEYS.contains(&k.as_str())) {
            return None;
        }

        let extra = row
            .iter()
            .filter(|(k, _)| !known.contains(&k.as_str()))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();

        Some(Self {
            make: text(row, &MAKE_KEYS).unwrap_or_else(|| DEFAULT_MAKE.to_string()),
            model: text(row, &MODEL_KEYS).unwrap_or_else(|| DEFAULT_MODEL.to_string()),
            year: integer(row, &YEAR_KEYS).unwrap_or(DEFAULT_YEAR),
            engine_type: text(row, &ENGINE_KEYS).unwrap_or_else(|| DEFAULT_ENGINE_TYPE.to_string()),
            fuel_type: text(row, &FUEL_KEYS).unwrap_or_else(|| SYNTHETIC_FUEL_TYPE.to_string()),
            vehicle_class: text(row, &CLASS_KEYS).unwrap_or_else(|| DEFAULT_VEHICLE_CLASS.to_string()),
            extra,
        })
    }

    pub fn synthesize<R: Rng + ?Sized>(rng: &mut R) -> Self {
        let pick = |options: &[&str], rng: &mut R| -> String {
            options.choose(rng).copied().unwrap_or_default().to_string()
        };

        let make = pick(&SYNTHETIC_MAKES, rng);
        let model = format!("Series-{}", rng.gen_range(MODEL_SERIES_MIN..=MODEL_SERIES_MAX));
        let year = rng.gen_range(YEAR_MIN..=YEAR_MAX);
        let engine_type = pick(&SYNTHETIC_ENGINE_TYPES, rng);
        let vehicle_class = pick(&SYNTHETIC_CLASSES, rng);

        Self {
            make,
            model,
            year,
            engine_type,
            fuel_type: SYNTHETIC_FUEL_TYPE.to_string(),
            vehicle_class,
            extra: BTreeMap::new(),
        }
    }
}

/// Reference specifications, optionally keyed by vehicle id.
#[derive(Debug, Clone, Default)]
pub struct SpecTable {
    entries: Vec<VehicleSpec>,
    by_id: HashMap<String, usize>,
}

impl SpecTable {
    /// Keep every row that describes a vehicle; returns the table and how
    /// many rows were skipped.
    pub fn from_rows(rows: &[TableRow]) -> (Self, usize) {
        let mut table = Self::default();
        let mut skipped = 0;

        for row in rows {
            let Some(spec) = VehicleSpec::from_row(row) else {
                skipped += 1;
                continue;
            };
            if let Some(id) = row_vehicle_id(row) {
                table.by_id.entry(id).or_insert(table.entries.len());
            }
            table.entries.push(spec);
        }

        (table, skipped)
    }

    pub fn from_path(path: &Path) -> Result<Self, DatasetError> {
        let rows = dataset::read_table_path(path)?;
        let (table, skipped) = Self::from_rows(&rows);
        if skipped > 0 {
            warn!(skipped, dataset = %path.display(), "skipped malformed specification rows");
        }
        if table.is_empty() {
            return Err(DatasetError::NoUsableRows(path.display().to_string()));
        }
        Ok(table)
    }

    /// Load the table if one is configured and usable.
    pub fn load_optional(path: Option<&Path>) -> Option<Self> {
        let path = path?;
        match Self::from_path(path) {
            Ok(table) => {
                info!(vehicles = table.len(), dataset = %path.display(), "loaded vehicle specifications");
                Some(table)
            }
            Err(e) => {
                warn!(error = %e, "specification table unusable, synthesizing vehicle specs");
                None
            }
        }
    }

    pub fn get(&self, vehicle_id: &str) -> Option<&VehicleSpec> {
        self.by_id.get(vehicle_id).map(|&i| &self.entries[i])
    }

    pub fn sample<R: Rng + ?Sized>(&self, rng: &mut R) -> Option<&VehicleSpec> {
        self.entries.choose(rng)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SpecMode {
    /// Resolve once per vehicle and reuse for the rest of the run.
    Stable,
    /// Resolve again on every tick.
    ResampleEachTick,
}

impl FromStr for SpecMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "stable" | "fixed" => Ok(SpecMode::Stable),
            "resample" | "resample-each-tick" | "random" => Ok(SpecMode::ResampleEachTick),
            other => Err(format!("unknown spec mode '{other}'")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpecSource {
    Exact,
    Sampled,
    Synthesized,
}

#[derive(Debug)]
pub struct SpecProvider {
    table: Option<SpecTable>,
    mode: SpecMode,
    assigned: HashMap<String, VehicleSpec>,
}

impl SpecProvider {
    pub fn new(table: Option<SpecTable>, mode: SpecMode) -> Self {
        let table = table.filter(|t| !t.is_empty());
        Self {
            table,
            mode,
            assigned: HashMap::new(),
        }
    }

    pub fn resolve<R: Rng + ?Sized>(&self, vehicle_id: &str, rng: &mut R) -> (VehicleSpec, SpecSource) {
        if let Some(table) = &self.table {
            if let Some(spec) = table.get(vehicle_id) {
                return (spec.clone(), SpecSource::Exact);
            }
            if let Some(spec) = table.sample(rng) {
                return (spec.clone(), SpecSource::Sampled);
            }
        }
        (VehicleSpec::synthesize(rng), SpecSource::Synthesized)
    }

    pub fn specs_for<R: Rng + ?Sized>(&mut self, vehicle_id: &str, rng: &mut R) -> VehicleSpec {
        if self.mode == SpecMode::Stable {
            if let Some(spec) = self.assigned.get(vehicle_id) {
                return spec.clone();
            }
        }

        let (spec, source) = self.resolve(vehicle_id, rng);
        debug!(vehicle_id, ?source, make = %spec.make, model = %spec.model, "resolved vehicle spec");

        if self.mode == SpecMode::Stable {
            self.assigned.insert(vehicle_id.to_string(), spec.clone());
        }
        spec
    }

    pub fn mode(&self) -> SpecMode {
        self.mode
    }

    pub fn has_table(&self) -> bool {
        self.table.is_some()
    }
}

use crate::envelope::EnvelopeTable;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use thiserror::Error;

// Operating area for the simulated fleet (southern and central Scandinavia)
pub const AREA_LAT_MIN: f64 = 55.0;
pub const AREA_LAT_MAX: f64 = 69.0;
pub const AREA_LON_MIN: f64 = 10.0;
pub const AREA_LON_MAX: f64 = 25.0;

const ODOMETER_MIN_KM: f64 = 50_000.0;
const ODOMETER_MAX_KM: f64 = 200_000.0;
const DEPOT_SCATTER_DEG: f64 = 0.05;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Location {
    pub latitude: f64,
    pub longitude: f64,
}

impl Location {
    pub fn new(latitude: f64, longitude: f64) -> Self {
        Self { latitude, longitude }
    }

    /// Clamp into the operating area.
    pub fn bounded(self) -> Self {
        Self {
            latitude: self.latitude.clamp(AREA_LAT_MIN, AREA_LAT_MAX),
            longitude: self.longitude.clamp(AREA_LON_MIN, AREA_LON_MAX),
        }
    }

    pub fn random_in_area<R: Rng + ?Sized>(rng: &mut R) -> Self {
        Self {
            latitude: rng.gen_range(AREA_LAT_MIN..=AREA_LAT_MAX),
            longitude: rng.gen_range(AREA_LON_MIN..=AREA_LON_MAX),
        }
    }

    pub fn is_in_area(&self) -> bool {
        (AREA_LAT_MIN..=AREA_LAT_MAX).contains(&self.latitude)
            && (AREA_LON_MIN..=AREA_LON_MAX).contains(&self.longitude)
    }

    pub fn rounded(self, decimals: u32) -> Self {
        let scale = 10f64.powi(decimals as i32);
        Self {
            latitude: (self.latitude * scale).round() / scale,
            longitude: (self.longitude * scale).round() / scale,
        }
    }
}

/// Home depots; vehicles are assigned round-robin.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Depot {
    Stockholm,
    Gothenburg,
    Malmo,
    Uppsala,
    Linkoping,
}

impl Depot {
    pub const ALL: [Depot; 5] = [
        Depot::Stockholm,
        Depot::Gothenburg,
        Depot::Malmo,
        Depot::Uppsala,
        Depot::Linkoping,
    ];

    pub fn location(self) -> Location {
        match self {
            Depot::Stockholm => Location::new(59.3293, 18.0686),
            Depot::Gothenburg => Location::new(57.7089, 11.9746),
            Depot::Malmo => Location::new(55.6050, 13.0038),
            Depot::Uppsala => Location::new(59.8586, 17.6389),
            Depot::Linkoping => Location::new(58.4108, 15.6214),
        }
    }

    pub fn for_index(index: usize) -> Self {
        Self::ALL[index % Self::ALL.len()]
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VehicleState {
    pub vehicle_id: String,
    /// Current unrounded value per signal.
    pub signals: BTreeMap<String, f64>,
    pub location: Location,
    pub heading_deg: f64,
    pub depot: Depot,
    pub odometer_km: f64,
    pub is_active: bool,
}

impl VehicleState {
    pub fn new<R: Rng + ?Sized>(
        vehicle_id: &str,
        depot: Depot,
        envelopes: &EnvelopeTable,
        rng: &mut R,
    ) -> Self {
        let signals = envelopes
            .iter()
            .map(|(name, envelope)| (name.to_string(), envelope.sample(rng)))
            .collect();

        let home = depot.location();
        let location = Location::new(
            home.latitude + rng.gen_range(-DEPOT_SCATTER_DEG..=DEPOT_SCATTER_DEG),
            home.longitude + rng.gen_range(-DEPOT_SCATTER_DEG..=DEPOT_SCATTER_DEG),
        )
        .bounded();

        Self {
            vehicle_id: vehicle_id.to_string(),
            signals,
            location,
            heading_deg: rng.gen_range(0.0..360.0),
            depot,
            odometer_km: rng.gen_range(ODOMETER_MIN_KM..=ODOMETER_MAX_KM),
            is_active: true,
        }
    }

    pub fn signal(&self, name: &str) -> Option<f64> {
        self.signals.get(name).copied()
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum StoreError {
    #[error("duplicate vehicle id: {0}")]
    DuplicateVehicle(String),
}

/// One state record per vehicle, in fleet order.
#[derive(Debug, Clone, Default)]
pub struct VehicleStateStore {
    vehicles: Vec<VehicleState>,
    index: HashMap<String, usize>,
}

impl VehicleStateStore {
    pub fn initialize<R: Rng + ?Sized>(
        vehicle_ids: &[String],
        envelopes: &EnvelopeTable,
        rng: &mut R,
    ) -> Result<Self, StoreError> {
        let mut store = Self {
            vehicles: Vec::with_capacity(vehicle_ids.len()),
            index: HashMap::with_capacity(vehicle_ids.len()),
        };

        for (position, id) in vehicle_ids.iter().enumerate() {
            if store.index.contains_key(id) {
                return Err(StoreError::DuplicateVehicle(id.clone()));
            }
            let state = VehicleState::new(id, Depot::for_index(position), envelopes, rng);
            store.index.insert(id.clone(), position);
            store.vehicles.push(state);
        }

        Ok(store)
    }

    pub fn get(&self, vehicle_id: &str) -> Option<&VehicleState> {
        self.index.get(vehicle_id).map(|&i| &self.vehicles[i])
    }

    pub fn get_mut(&mut self, vehicle_id: &str) -> Option<&mut VehicleState> {
        let position = *self.index.get(vehicle_id)?;
        self.vehicles.get_mut(position)
    }

    pub fn by_position_mut(&mut self, position: usize) -> Option<&mut VehicleState> {
        self.vehicles.get_mut(position)
    }

    pub fn iter(&self) -> impl Iterator<Item = &VehicleState> {
        self.vehicles.iter()
    }

    pub fn vehicle_ids(&self) -> impl Iterator<Item = &str> {
        self.vehicles.iter().map(|v| v.vehicle_id.as_str())
    }

    pub fn len(&self) -> usize {
        self.vehicles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.vehicles.is_empty()
    }
}

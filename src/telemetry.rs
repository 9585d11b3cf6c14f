use crate::specs::VehicleSpec;
use crate::state::Location;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum HealthState {
    Normal,
    Anomaly,
}

impl HealthState {
    pub fn from_anomalous(anomalous: bool) -> Self {
        if anomalous {
            HealthState::Anomaly
        } else {
            HealthState::Normal
        }
    }

    pub fn is_anomaly(self) -> bool {
        self == HealthState::Anomaly
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VehicleStatus {
    /// Ground truth for detection: whether an anomaly was injected this tick.
    pub state: HealthState,
    pub location: Location,
}

/// One vehicle's telemetry for one tick, in wire layout.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TelemetryRecord {
    pub vehicle_id: String,
    #[serde(with = "timestamp_format")]
    pub timestamp: DateTime<Utc>,
    pub specs: VehicleSpec,
    pub signals: BTreeMap<String, f64>,
    pub status: VehicleStatus,
}

impl TelemetryRecord {
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    pub fn is_anomalous(&self) -> bool {
        self.status.state.is_anomaly()
    }
}

/// RFC 3339, UTC, millisecond precision, `Z` suffix.
mod timestamp_format {
    use chrono::{DateTime, SecondsFormat, Utc};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(ts: &DateTime<Utc>, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&ts.to_rfc3339_opts(SecondsFormat::Millis, true))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<DateTime<Utc>, D::Error> {
        let raw = String::deserialize(deserializer)?;
        DateTime::parse_from_rfc3339(&raw)
            .map(|ts| ts.with_timezone(&Utc))
            .map_err(serde::de::Error::custom)
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EmitterMetrics {
    pub records_emitted: u64,
    pub anomalies_emitted: u64,
    pub signals_emitted: u64,
}

/// Packages evolved state into wire records. Performs no I/O.
#[derive(Debug, Default)]
pub struct TelemetryEmitter {
    metrics: EmitterMetrics,
}

impl TelemetryEmitter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn emit(
        &mut self,
        vehicle_id: &str,
        timestamp: DateTime<Utc>,
        spec: VehicleSpec,
        signals: BTreeMap<String, f64>,
        anomalous: bool,
        location: Location,
    ) -> TelemetryRecord {
        self.metrics.records_emitted += 1;
        self.metrics.signals_emitted += signals.len() as u64;
        if anomalous {
            self.metrics.anomalies_emitted += 1;
        }

        TelemetryRecord {
            vehicle_id: vehicle_id.to_string(),
            timestamp,
            specs: spec,
            signals,
            status: VehicleStatus {
                state: HealthState::from_anomalous(anomalous),
                location,
            },
        }
    }

    pub fn metrics(&self) -> &EmitterMetrics {
        &self.metrics
    }
}

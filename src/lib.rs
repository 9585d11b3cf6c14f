//! # Fleet Telemetry Simulator
//!
//! Generates realistic, statistically grounded telemetry for a fleet of
//! heavy vehicles and streams it to an ingest service or a message queue.
//!
//! ## Features
//!
//! - **Data-driven envelopes**: per-signal mean, spread and bounds derived from
//!   an operational readout dataset, with a built-in fallback table
//! - **Stateful evolution**: bounded random walk per vehicle, or independent
//!   draws each tick
//! - **Anomaly injection**: labeled multi-sigma excursions with ground truth in
//!   every record
//! - **Vehicle specifications**: exact, sampled or synthesized per vehicle
//! - **Transports**: HTTP POST, NATS subject or stdout
//! - **Reproducible runs**: a single seeded generator drives the whole fleet
//!
//! ## Quick Start
//!
//! ```rust
//! use fleetsim::{EnvelopeTable, FleetConfig, FleetSimulator};
//!
//! let config = FleetConfig {
//!     vehicle_count: 3,
//!     seed: Some(42),
//!     ..FleetConfig::default()
//! };
//! let mut simulator = FleetSimulator::new(&config, EnvelopeTable::fallback(), None)?;
//!
//! let records = simulator.generate_tick(chrono::Utc::now());
//! assert_eq!(records.len(), 3);
//! # Ok::<(), fleetsim::SimulatorError>(())
//! ```
//!
//! ## Architecture
//!
//! - [`dataset`] - CSV loading for readouts and specification tables
//! - [`envelope`] - Signal envelopes and the envelope table
//! - [`state`] - Per-vehicle state and the fleet store
//! - [`evolution`] - Per-tick evolution and anomaly injection
//! - [`specs`] - Vehicle specification lookup and synthesis
//! - [`telemetry`] - Wire records
//! - [`transport`] - Delivery backends
//! - [`simulator`] - Fleet orchestration and the run loop
//! - [`detection`] - Reference detectors for offline evaluation
//! - [`config`] - Environment-driven configuration

#![deny(clippy::all)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::cast_precision_loss)]

pub mod config;
pub mod dataset;
pub mod detection;
pub mod envelope;
pub mod evolution;
pub mod simulator;
pub mod specs;
pub mod state;
pub mod telemetry;
pub mod transport;

// Re-export main public types for convenience
pub use config::{ConfigError, FleetConfig, TransportConfig};
pub use envelope::{EnvelopeSource, EnvelopeTable, SignalEnvelope};
pub use evolution::{EvolutionEngine, EvolutionMode};
pub use simulator::{FleetSimulator, RunSummary, SimulatorError, TickReport};
pub use specs::{SpecMode, SpecTable, VehicleSpec};
pub use telemetry::{HealthState, TelemetryRecord};
pub use transport::{Backend, Transport, TransportError};

use crate::config::{ConfigError, FleetConfig};
use crate::envelope::{EnvelopeSource, EnvelopeTable};
use crate::evolution::{EvolutionEngine, EvolutionStats};
use crate::specs::{SpecProvider, SpecTable};
use crate::state::{StoreError, VehicleStateStore};
use crate::telemetry::{EmitterMetrics, TelemetryEmitter, TelemetryRecord};
use crate::transport::Transport;
use chrono::{DateTime, Utc};
use heapless::Vec as BoundedVec;
use rand::rngs::StdRng;
use rand::SeedableRng;
use std::collections::BTreeMap;
use std::future::Future;
use std::time::Duration;
use thiserror::Error;
use tokio::time::{self, Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

const RECENT_FAILURE_HISTORY: usize = 16;

#[derive(Debug, Error)]
pub enum SimulatorError {
    #[error("invalid configuration: {0}")]
    Config(#[from] ConfigError),
    #[error("failed to initialize fleet: {0}")]
    Store(#[from] StoreError),
    #[error("no signals to simulate")]
    NoSignals,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishFailure {
    pub tick: u64,
    pub vehicle_id: String,
    pub error: String,
}

/// Delivery counters across the whole run.
#[derive(Debug, Clone, Default)]
pub struct PublishStats {
    pub sent: u64,
    pub failed: u64,
    pub failures_by_vehicle: BTreeMap<String, u64>,
    recent: BoundedVec<PublishFailure, RECENT_FAILURE_HISTORY>,
}

impl PublishStats {
    fn record_failure(&mut self, failure: PublishFailure) {
        self.failed += 1;
        *self
            .failures_by_vehicle
            .entry(failure.vehicle_id.clone())
            .or_insert(0) += 1;

        if self.recent.is_full() {
            self.recent.remove(0);
        }
        let _ = self.recent.push(failure);
    }

    /// Most recent failures, oldest first.
    pub fn recent_failures(&self) -> &[PublishFailure] {
        &self.recent
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TickReport {
    pub tick: u64,
    pub sent: usize,
    pub failed: usize,
    pub anomalies: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunSummary {
    pub ticks: u64,
    pub records_sent: u64,
    pub publish_failures: u64,
    pub anomalies: u64,
    pub elapsed: Duration,
}

impl RunSummary {
    /// Share of publish attempts that were delivered, `None` before the first
    /// attempt.
    pub fn success_rate(&self) -> Option<f64> {
        let attempts = self.records_sent + self.publish_failures;
        (attempts > 0).then(|| self.records_sent as f64 / attempts as f64)
    }

    fn absorb(&mut self, report: &TickReport) {
        self.ticks += 1;
        self.records_sent += report.sent as u64;
        self.publish_failures += report.failed as u64;
        self.anomalies += report.anomalies as u64;
    }
}

/// Drives the whole fleet: one record per vehicle per tick, in fleet order.
///
/// All randomness flows through a single generator owned here, so a seeded
/// simulator fed the same timestamps produces identical output.
pub struct FleetSimulator {
    config: FleetConfig,
    envelopes: EnvelopeTable,
    envelope_source: Option<EnvelopeSource>,
    store: VehicleStateStore,
    engine: EvolutionEngine,
    specs: SpecProvider,
    emitter: TelemetryEmitter,
    rng: StdRng,
    tick: u64,
    stats: PublishStats,
}

impl FleetSimulator {
    pub fn new(
        config: &FleetConfig,
        envelopes: EnvelopeTable,
        spec_table: Option<SpecTable>,
    ) -> Result<Self, SimulatorError> {
        config.validate()?;
        if envelopes.is_empty() {
            return Err(SimulatorError::NoSignals);
        }

        let mut rng = match config.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        let store = VehicleStateStore::initialize(&config.vehicle_ids(), &envelopes, &mut rng)?;

        Ok(Self {
            config: config.clone(),
            envelopes,
            envelope_source: None,
            store,
            engine: EvolutionEngine::new_with_config(config.evolution_config()),
            specs: SpecProvider::new(spec_table, config.spec_mode),
            emitter: TelemetryEmitter::new(),
            rng,
            tick: 0,
            stats: PublishStats::default(),
        })
    }

    /// Load both datasets named by `config` (falling back where needed) and
    /// build the fleet.
    pub fn from_config(config: &FleetConfig) -> Result<Self, SimulatorError> {
        let (envelopes, source) = EnvelopeTable::load_or_fallback(
            config.datasets.operational.as_deref(),
            config.datasets.max_rows,
        );
        let spec_table = SpecTable::load_optional(config.datasets.specifications.as_deref());

        let mut simulator = Self::new(config, envelopes, spec_table)?;
        info!(
            vehicles = simulator.store.len(),
            signals = simulator.envelopes.len(),
            mode = ?config.evolution_mode,
            specs = ?config.spec_mode,
            seeded = config.seed.is_some(),
            "fleet initialized"
        );
        simulator.envelope_source = Some(source);
        Ok(simulator)
    }

    /// Advance every vehicle one tick and return their records. No I/O.
    pub fn generate_tick(&mut self, timestamp: DateTime<Utc>) -> Vec<TelemetryRecord> {
        self.tick += 1;
        (0..self.store.len())
            .filter_map(|position| self.advance_vehicle(position, timestamp))
            .collect()
    }

    fn advance_vehicle(&mut self, position: usize, timestamp: DateTime<Utc>) -> Option<TelemetryRecord> {
        let state = self.store.by_position_mut(position)?;
        let outcome = self.engine.step(state, &self.envelopes, &mut self.rng);
        let spec = self.specs.specs_for(&state.vehicle_id, &mut self.rng);

        if outcome.anomalous {
            let signals: Vec<&str> = outcome.excursions.iter().map(|e| e.signal.as_str()).collect();
            debug!(vehicle_id = %state.vehicle_id, tick = self.tick, ?signals, "injected anomaly");
        }

        Some(self.emitter.emit(
            &state.vehicle_id,
            timestamp,
            spec,
            outcome.signals,
            outcome.anomalous,
            outcome.location,
        ))
    }

    /// Generate and publish one tick. A failed publish is logged and counted;
    /// the remaining vehicles are still sent.
    pub async fn run_tick<T: Transport>(&mut self, transport: &mut T, timestamp: DateTime<Utc>) -> TickReport {
        self.tick += 1;
        let mut report = TickReport {
            tick: self.tick,
            ..TickReport::default()
        };

        let vehicles = self.store.len();
        for position in 0..vehicles {
            let Some(record) = self.advance_vehicle(position, timestamp) else {
                continue;
            };
            if record.is_anomalous() {
                report.anomalies += 1;
            }

            match transport.publish(&record).await {
                Ok(ack) => {
                    debug!(vehicle_id = %record.vehicle_id, status = ?ack.status, "published telemetry");
                    report.sent += 1;
                    self.stats.sent += 1;
                }
                Err(e) => {
                    warn!(
                        vehicle_id = %record.vehicle_id,
                        tick = self.tick,
                        transport = transport.name(),
                        error = %e,
                        "failed to publish telemetry"
                    );
                    report.failed += 1;
                    self.stats.record_failure(PublishFailure {
                        tick: self.tick,
                        vehicle_id: record.vehicle_id,
                        error: e.to_string(),
                    });
                }
            }

            if !self.config.vehicle_stagger.is_zero() && position + 1 < vehicles {
                time::sleep(self.config.vehicle_stagger).await;
            }
        }

        report
    }

    /// Tick on the configured interval until `shutdown` resolves or the
    /// configured run duration has passed. Shutdown is only observed between
    /// ticks, so a tick in progress always completes.
    pub async fn run<T, F>(&mut self, transport: &mut T, shutdown: F) -> RunSummary
    where
        T: Transport,
        F: Future<Output = ()>,
    {
        tokio::pin!(shutdown);

        let mut interval = time::interval(self.config.tick_interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let started = Instant::now();
        let mut summary = RunSummary::default();

        info!(
            transport = transport.name(),
            interval_secs = self.config.tick_interval.as_secs_f64(),
            "simulation started"
        );

        loop {
            tokio::select! {
                biased;
                _ = &mut shutdown => {
                    info!("shutdown requested");
                    break;
                }
                _ = interval.tick() => {}
            }

            if let Some(limit) = self.config.run_duration {
                if started.elapsed() >= limit {
                    info!(limit_secs = limit.as_secs_f64(), "run duration reached");
                    break;
                }
            }

            let report = self.run_tick(transport, Utc::now()).await;
            summary.absorb(&report);
            info!(
                tick = report.tick,
                sent = report.sent,
                failed = report.failed,
                anomalies = report.anomalies,
                "tick complete"
            );
        }

        summary.elapsed = started.elapsed();
        info!(
            ticks = summary.ticks,
            sent = summary.records_sent,
            failed = summary.publish_failures,
            anomalies = summary.anomalies,
            "simulation stopped"
        );
        summary
    }

    pub fn config(&self) -> &FleetConfig {
        &self.config
    }

    pub fn envelopes(&self) -> &EnvelopeTable {
        &self.envelopes
    }

    /// `None` when the envelopes were handed to [`FleetSimulator::new`] directly.
    pub fn envelope_source(&self) -> Option<&EnvelopeSource> {
        self.envelope_source.as_ref()
    }

    pub fn store(&self) -> &VehicleStateStore {
        &self.store
    }

    pub fn ticks(&self) -> u64 {
        self.tick
    }

    pub fn publish_stats(&self) -> &PublishStats {
        &self.stats
    }

    pub fn evolution_stats(&self) -> &EvolutionStats {
        self.engine.stats()
    }

    pub fn emitter_metrics(&self) -> &EmitterMetrics {
        self.emitter.metrics()
    }
}

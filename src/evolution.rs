use crate::envelope::{EnvelopeTable, SignalEnvelope};
use crate::state::{Location, VehicleState};
use rand::seq::SliceRandom;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::str::FromStr;

// Anomaly injection defaults
const DEFAULT_TICK_ANOMALY_PROBABILITY: f64 = 0.02;
const DEFAULT_SIGNAL_ANOMALY_PROBABILITY: f64 = 0.3;
const DEFAULT_ANOMALY_MAGNITUDE_SIGMAS: f64 = 3.0;

// Random-walk defaults
const DEFAULT_WALK_STEP_SIGMAS: f64 = 0.25;
const DEFAULT_MAX_STEP_SIGMAS: f64 = 0.5;
const REFILL_THRESHOLD_FRACTION: f64 = 0.05;

pub const DEFAULT_DECIMALS: u32 = 2;
pub const DEFAULT_TICK_SECONDS: f64 = 3.0;
const LOCATION_DECIMALS: u32 = 6;

// Motion model
const SPEED_SIGNAL: &str = "speed";
const HEADING_JITTER_DEG: f64 = 15.0;
const KM_PER_DEGREE: f64 = 111.32;

/// How a signal's baseline is produced each tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum EvolutionMode {
    /// Fresh `Normal(mean, std)` draw every tick.
    Stateless,
    /// Previous value plus a bounded delta.
    RandomWalk,
}

impl FromStr for EvolutionMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "stateless" | "normal" => Ok(EvolutionMode::Stateless),
            "random-walk" | "random_walk" | "stateful" | "walk" => Ok(EvolutionMode::RandomWalk),
            other => Err(format!("unknown evolution mode '{other}'")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum AnomalyDirection {
    Both,
    Up,
}

impl FromStr for AnomalyDirection {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "both" | "bidirectional" => Ok(AnomalyDirection::Both),
            "up" | "upward" | "drift" => Ok(AnomalyDirection::Up),
            other => Err(format!("unknown anomaly direction '{other}'")),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnomalyConfig {
    pub tick_probability: f64,
    pub signal_probability: f64,
    pub magnitude_sigmas: f64,
    pub direction: AnomalyDirection,
}

impl Default for AnomalyConfig {
    fn default() -> Self {
        Self {
            tick_probability: DEFAULT_TICK_ANOMALY_PROBABILITY,
            signal_probability: DEFAULT_SIGNAL_ANOMALY_PROBABILITY,
            magnitude_sigmas: DEFAULT_ANOMALY_MAGNITUDE_SIGMAS,
            direction: AnomalyDirection::Both,
        }
    }
}

/// Inclusive delta range for one random-walk step.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct WalkStep {
    pub lower: f64,
    pub upper: f64,
}

impl WalkStep {
    pub fn symmetric(half_width: f64) -> Self {
        let half_width = half_width.abs();
        Self {
            lower: -half_width,
            upper: half_width,
        }
    }

    /// Narrow both ends to at most `limit` away from zero.
    pub fn capped(&self, limit: f64) -> Self {
        let limit = limit.abs();
        Self {
            lower: self.lower.max(-limit),
            upper: self.upper.min(limit),
        }
    }

    fn draw<R: Rng + ?Sized>(&self, rng: &mut R) -> f64 {
        if self.upper > self.lower {
            rng.gen_range(self.lower..=self.upper)
        } else {
            self.lower
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WalkProfile {
    /// Step width for signals without an override, in standard deviations.
    pub default_step_sigmas: f64,
    /// Fixed per-signal steps, in signal units.
    pub overrides: BTreeMap<String, WalkStep>,
    /// Widest an override may step, in standard deviations of the envelope it
    /// is applied to. `None` leaves overrides uncapped.
    pub max_step_sigmas: Option<f64>,
    /// Consumables that are topped up once they run close to empty.
    pub refill: BTreeSet<String>,
}

impl WalkProfile {
    /// Symmetric steps for every signal, no overrides.
    pub fn uniform(step_sigmas: f64) -> Self {
        Self {
            default_step_sigmas: step_sigmas,
            overrides: BTreeMap::new(),
            max_step_sigmas: None,
            refill: BTreeSet::new(),
        }
    }

    /// Overrides are tuned for the fallback envelopes; on a narrower
    /// envelope they shrink to `max_step_sigmas * std_dev`.
    pub fn step_for(&self, name: &str, envelope: &SignalEnvelope) -> WalkStep {
        match (self.overrides.get(name), self.max_step_sigmas) {
            (Some(step), Some(sigmas)) => step.capped(sigmas * envelope.std_dev),
            (Some(step), None) => *step,
            (None, _) => WalkStep::symmetric(self.default_step_sigmas * envelope.std_dev),
        }
    }
}

impl Default for WalkProfile {
    fn default() -> Self {
        let overrides = [
            ("speed", WalkStep::symmetric(5.0)),
            ("engine_temp", WalkStep::symmetric(2.0)),
            ("rpm", WalkStep::symmetric(100.0)),
            ("tire_pressure", WalkStep::symmetric(0.5)),
            ("fuel_level", WalkStep { lower: -0.5, upper: 0.1 }),
        ]
        .into_iter()
        .map(|(name, step)| (name.to_string(), step))
        .collect();

        Self {
            default_step_sigmas: DEFAULT_WALK_STEP_SIGMAS,
            overrides,
            max_step_sigmas: Some(DEFAULT_MAX_STEP_SIGMAS),
            refill: BTreeSet::from(["fuel_level".to_string()]),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EvolutionConfig {
    pub mode: EvolutionMode,
    pub anomaly: AnomalyConfig,
    pub walk: WalkProfile,
    pub decimals: u32,
    pub tick_seconds: f64,
}

impl Default for EvolutionConfig {
    fn default() -> Self {
        Self {
            mode: EvolutionMode::RandomWalk,
            anomaly: AnomalyConfig::default(),
            walk: WalkProfile::default(),
            decimals: DEFAULT_DECIMALS,
            tick_seconds: DEFAULT_TICK_SECONDS,
        }
    }
}

/// A deliberate deviation applied to one signal on an anomalous tick.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Excursion {
    pub signal: String,
    /// Value before the excursion was added.
    pub baseline: f64,
    pub offset: f64,
    /// Value after re-clamping, before rounding.
    pub emitted: f64,
}

impl Excursion {
    pub fn is_saturated(&self) -> bool {
        self.emitted != self.baseline + self.offset
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct StepOutcome {
    /// Rounded, envelope-bounded values ready for emission.
    pub signals: BTreeMap<String, f64>,
    pub anomalous: bool,
    pub excursions: Vec<Excursion>,
    pub location: Location,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EvolutionStats {
    pub steps: u64,
    pub anomalous_steps: u64,
    pub excursions: u64,
    pub saturated_excursions: u64,
    pub refills: u64,
}

/// Advances vehicle state one tick at a time.
#[derive(Debug)]
pub struct EvolutionEngine {
    config: EvolutionConfig,
    stats: EvolutionStats,
}

impl EvolutionEngine {
    pub fn new() -> Self {
        Self::new_with_config(EvolutionConfig::default())
    }

    pub fn new_with_config(config: EvolutionConfig) -> Self {
        Self {
            config,
            stats: EvolutionStats::default(),
        }
    }

    /// Advance `state` by one tick.
    ///
    /// The anomaly decision is made once for the whole tick. Each signal gets
    /// a new baseline (written back to `state`); on an anomalous tick signals
    /// with non-zero spread are independently picked for an excursion of
    /// `magnitude_sigmas * std`, and at least one of them is always picked.
    /// Excursions only affect the emitted values, never the stored baseline.
    pub fn step<R: Rng + ?Sized>(
        &mut self,
        state: &mut VehicleState,
        envelopes: &EnvelopeTable,
        rng: &mut R,
    ) -> StepOutcome {
        let anomalous = rng.gen::<f64>() < self.config.anomaly.tick_probability;
        let mut signals = BTreeMap::new();
        let mut excursions = Vec::new();

        for (name, envelope) in envelopes.iter() {
            let baseline = match self.config.mode {
                EvolutionMode::Stateless => envelope.sample(rng),
                EvolutionMode::RandomWalk => self.walk(name, envelope, state.signal(name), rng),
            };
            state.signals.insert(name.to_string(), baseline);

            let mut value = baseline;
            if anomalous
                && envelope.std_dev > 0.0
                && rng.gen::<f64>() < self.config.anomaly.signal_probability
            {
                let excursion = self.excursion(name, envelope, baseline, rng);
                value = excursion.emitted;
                excursions.push(excursion);
            }
            signals.insert(name.to_string(), value);
        }

        if anomalous && excursions.is_empty() {
            let candidates: Vec<(&str, &SignalEnvelope)> =
                envelopes.iter().filter(|(_, e)| e.std_dev > 0.0).collect();
            if let Some(&(name, envelope)) = candidates.choose(rng) {
                let baseline = state.signal(name).unwrap_or(envelope.mean);
                let excursion = self.excursion(name, envelope, baseline, rng);
                signals.insert(name.to_string(), excursion.emitted);
                excursions.push(excursion);
            }
        }

        for (name, value) in signals.iter_mut() {
            if let Some(envelope) = envelopes.get(name) {
                *value = envelope.round_within(*value, self.config.decimals);
            }
        }

        self.advance_motion(state, rng);

        self.stats.steps += 1;
        if anomalous {
            self.stats.anomalous_steps += 1;
        }
        self.stats.excursions += excursions.len() as u64;
        self.stats.saturated_excursions += excursions.iter().filter(|e| e.is_saturated()).count() as u64;

        StepOutcome {
            signals,
            anomalous,
            excursions,
            location: state.location.rounded(LOCATION_DECIMALS),
        }
    }

    fn walk<R: Rng + ?Sized>(
        &mut self,
        name: &str,
        envelope: &SignalEnvelope,
        previous: Option<f64>,
        rng: &mut R,
    ) -> f64 {
        let Some(previous) = previous else {
            return envelope.sample(rng);
        };

        let refill_level = envelope.min + REFILL_THRESHOLD_FRACTION * envelope.span();
        if self.config.walk.refill.contains(name) && envelope.span() > 0.0 && previous <= refill_level {
            self.stats.refills += 1;
            return rng.gen_range(envelope.mean..=envelope.max);
        }

        let step = self.config.walk.step_for(name, envelope);
        envelope.clamp(previous + step.draw(rng))
    }

    fn excursion<R: Rng + ?Sized>(
        &self,
        name: &str,
        envelope: &SignalEnvelope,
        baseline: f64,
        rng: &mut R,
    ) -> Excursion {
        let sign = match self.config.anomaly.direction {
            AnomalyDirection::Up => 1.0,
            AnomalyDirection::Both => {
                if rng.gen::<bool>() {
                    1.0
                } else {
                    -1.0
                }
            }
        };
        let offset = sign * self.config.anomaly.magnitude_sigmas * envelope.std_dev;

        Excursion {
            signal: name.to_string(),
            baseline,
            offset,
            emitted: envelope.clamp(baseline + offset),
        }
    }

    /// Move the vehicle and update odometer and activity flag.
    fn advance_motion<R: Rng + ?Sized>(&self, state: &mut VehicleState, rng: &mut R) {
        let speed_kmh = state.signal(SPEED_SIGNAL).unwrap_or(0.0).max(0.0);
        let distance_km = speed_kmh * self.config.tick_seconds / 3600.0;

        match self.config.mode {
            EvolutionMode::Stateless => {
                state.location = Location::random_in_area(rng);
            }
            EvolutionMode::RandomWalk => {
                let jitter = rng.gen_range(-HEADING_JITTER_DEG..=HEADING_JITTER_DEG);
                state.heading_deg = (state.heading_deg + jitter).rem_euclid(360.0);

                let heading = state.heading_deg.to_radians();
                let lat_scale = state.location.latitude.to_radians().cos().max(0.1);
                let next = Location::new(
                    state.location.latitude + distance_km * heading.cos() / KM_PER_DEGREE,
                    state.location.longitude + distance_km * heading.sin() / (KM_PER_DEGREE * lat_scale),
                );

                if !next.is_in_area() {
                    // turn back at the edge of the operating area
                    state.heading_deg = (state.heading_deg + 180.0).rem_euclid(360.0);
                }
                state.location = next.bounded();
            }
        }

        state.odometer_km += distance_km;
        state.is_active = state.signal(SPEED_SIGNAL).map_or(true, |speed| speed > 0.0);
    }

    pub fn config(&self) -> &EvolutionConfig {
        &self.config
    }

    pub fn stats(&self) -> &EvolutionStats {
        &self.stats
    }
}

impl Default for EvolutionEngine {
    fn default() -> Self {
        Self::new()
    }
}

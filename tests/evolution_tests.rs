use fleetsim::envelope::{EnvelopeTable, SignalEnvelope};
use fleetsim::evolution::{AnomalyConfig, EvolutionConfig, EvolutionEngine, EvolutionMode};
use fleetsim::state::{Depot, VehicleState};
use fleetsim::telemetry::HealthState;
use rand::rngs::StdRng;
use rand::SeedableRng;

const SAMPLES: usize = 10_000;

fn engine(mode: EvolutionMode, tick_probability: f64) -> EvolutionEngine {
    EvolutionEngine::new_with_config(EvolutionConfig {
        mode,
        anomaly: AnomalyConfig {
            tick_probability,
            ..AnomalyConfig::default()
        },
        ..EvolutionConfig::default()
    })
}

fn vehicle(envelopes: &EnvelopeTable, rng: &mut StdRng) -> VehicleState {
    VehicleState::new("TRUCK-001", Depot::Stockholm, envelopes, rng)
}

fn assert_bounded(mode: EvolutionMode, tick_probability: f64, seed: u64) {
    let envelopes = EnvelopeTable::fallback();
    let mut rng = StdRng::seed_from_u64(seed);
    let mut state = vehicle(&envelopes, &mut rng);
    let mut engine = engine(mode, tick_probability);

    for _ in 0..SAMPLES {
        let outcome = engine.step(&mut state, &envelopes, &mut rng);
        assert_eq!(outcome.signals.len(), envelopes.len());
        for (name, value) in &outcome.signals {
            let e = envelopes.get(name).unwrap();
            assert!(
                *value >= e.min && *value <= e.max,
                "{name}={value} outside [{}, {}]",
                e.min,
                e.max
            );
        }
        assert!(outcome.location.is_in_area(), "left operating area: {:?}", outcome.location);
    }
}

#[test]
fn test_random_walk_values_stay_in_envelope() {
    assert_bounded(EvolutionMode::RandomWalk, 0.0, 1);
}

#[test]
fn test_random_walk_with_anomalies_stays_in_envelope() {
    assert_bounded(EvolutionMode::RandomWalk, 0.5, 2);
}

#[test]
fn test_stateless_values_stay_in_envelope() {
    assert_bounded(EvolutionMode::Stateless, 0.0, 3);
}

#[test]
fn test_stateless_with_anomalies_stays_in_envelope() {
    assert_bounded(EvolutionMode::Stateless, 0.5, 4);
}

#[test]
fn test_normal_tick_has_no_excursions_and_rounded_values() {
    let envelopes = EnvelopeTable::fallback();
    let mut rng = StdRng::seed_from_u64(11);
    let mut state = vehicle(&envelopes, &mut rng);
    let mut engine = engine(EvolutionMode::RandomWalk, 0.0);

    for _ in 0..100 {
        let outcome = engine.step(&mut state, &envelopes, &mut rng);
        assert!(!outcome.anomalous);
        assert!(outcome.excursions.is_empty());
        assert_eq!(HealthState::from_anomalous(outcome.anomalous), HealthState::Normal);
        for value in outcome.signals.values() {
            let scaled = value * 100.0;
            assert!((scaled - scaled.round()).abs() < 1e-6, "{value} has more than 2 decimals");
        }
    }
    assert_eq!(engine.stats().anomalous_steps, 0);
}

#[test]
fn test_single_signal_stateless_normal_ticks() {
    let mut envelopes = EnvelopeTable::new();
    envelopes.insert("speed", SignalEnvelope::new(65.0, 15.0, 0.0, 120.0));
    let mut rng = StdRng::seed_from_u64(15);
    let mut state = vehicle(&envelopes, &mut rng);
    let mut engine = engine(EvolutionMode::Stateless, 0.0);

    for _ in 0..1000 {
        let outcome = engine.step(&mut state, &envelopes, &mut rng);
        let speed = outcome.signals["speed"];
        assert!((0.0..=120.0).contains(&speed));
        assert_eq!(HealthState::from_anomalous(outcome.anomalous), HealthState::Normal);
    }
}

#[test]
fn test_random_walk_on_narrow_dataset_envelope() {
    let mut envelopes = EnvelopeTable::new();
    envelopes.insert("speed", SignalEnvelope::new(20.0, 1.0, 15.0, 25.0));
    let mut rng = StdRng::seed_from_u64(16);
    let mut state = vehicle(&envelopes, &mut rng);
    let mut engine = engine(EvolutionMode::RandomWalk, 0.0);

    let mut previous = state.signal("speed").unwrap();
    let mut largest_step: f64 = 0.0;
    let mut saturated = 0;
    for _ in 0..1000 {
        engine.step(&mut state, &envelopes, &mut rng);
        let current = state.signal("speed").unwrap();
        largest_step = largest_step.max((current - previous).abs());
        if current == 15.0 || current == 25.0 {
            saturated += 1;
        }
        previous = current;
    }

    // steps scale with the envelope's spread, not the fleet-wide speed range
    assert!(largest_step <= 0.5 + 1e-9, "step {largest_step} too wide for std 1");
    assert!(saturated < 150, "{saturated} of 1000 ticks pinned at a bound");
}

#[test]
fn test_forced_anomaly_is_multi_sigma() {
    let envelopes = EnvelopeTable::fallback();
    let mut rng = StdRng::seed_from_u64(12);
    let mut state = vehicle(&envelopes, &mut rng);
    let mut engine = engine(EvolutionMode::RandomWalk, 1.0);

    for _ in 0..500 {
        let outcome = engine.step(&mut state, &envelopes, &mut rng);
        assert!(outcome.anomalous);
        assert!(!outcome.excursions.is_empty());
        assert_eq!(HealthState::from_anomalous(outcome.anomalous), HealthState::Anomaly);

        for excursion in &outcome.excursions {
            let e = envelopes.get(&excursion.signal).unwrap();
            assert!(excursion.offset.abs() >= 2.0 * e.std_dev);
            // the stored baseline never carries the excursion
            assert_eq!(state.signal(&excursion.signal), Some(excursion.baseline));
        }
    }
    assert_eq!(engine.stats().anomalous_steps, 500);
}

#[test]
fn test_anomalous_ticks_are_statistically_separable() {
    let envelopes = EnvelopeTable::fallback();
    let mut rng = StdRng::seed_from_u64(13);
    let mut state = vehicle(&envelopes, &mut rng);
    let mut engine = engine(EvolutionMode::Stateless, 0.3);

    let (mut normal_sum, mut normal_n) = (0.0, 0usize);
    let (mut anomalous_sum, mut anomalous_n) = (0.0, 0usize);

    for _ in 0..SAMPLES {
        let outcome = engine.step(&mut state, &envelopes, &mut rng);
        let worst = outcome
            .signals
            .iter()
            .map(|(name, v)| envelopes.get(name).unwrap().z_score(*v).abs())
            .fold(0.0, f64::max);

        if outcome.anomalous {
            anomalous_sum += worst;
            anomalous_n += 1;
        } else {
            normal_sum += worst;
            normal_n += 1;
        }
    }

    assert!(anomalous_n > 0 && normal_n > 0);
    let normal_mean = normal_sum / normal_n as f64;
    let anomalous_mean = anomalous_sum / anomalous_n as f64;
    assert!(
        anomalous_mean > normal_mean + 0.5,
        "anomalous mean |z| {anomalous_mean:.2} not separated from normal {normal_mean:.2}"
    );
}

#[test]
fn test_odometer_accumulates_while_moving() {
    let envelopes = EnvelopeTable::fallback();
    let mut rng = StdRng::seed_from_u64(14);
    let mut state = vehicle(&envelopes, &mut rng);
    let start = state.odometer_km;
    let mut engine = engine(EvolutionMode::RandomWalk, 0.0);

    for _ in 0..1000 {
        engine.step(&mut state, &envelopes, &mut rng);
    }
    assert!(state.odometer_km > start);
}

use chrono::{DateTime, Duration as ChronoDuration, TimeZone, Utc};
use fleetsim::detection::{DetectionScore, EnvelopeDetector};
use fleetsim::specs::SpecMode;
use fleetsim::transport::Ack;
use fleetsim::*;
use std::collections::BTreeMap;
use std::io::Write;
use std::time::Duration;
use tempfile::NamedTempFile;

/// Records everything it is handed; refuses one vehicle.
struct MockTransport {
    fail_vehicle: Option<String>,
    delivered: Vec<TelemetryRecord>,
}

impl MockTransport {
    fn new() -> Self {
        Self {
            fail_vehicle: None,
            delivered: Vec::new(),
        }
    }

    fn failing_on(vehicle_id: &str) -> Self {
        Self {
            fail_vehicle: Some(vehicle_id.to_string()),
            delivered: Vec::new(),
        }
    }
}

impl Transport for MockTransport {
    fn name(&self) -> &'static str {
        "mock"
    }

    async fn publish(&mut self, record: &TelemetryRecord) -> Result<Ack, TransportError> {
        if self.fail_vehicle.as_deref() == Some(record.vehicle_id.as_str()) {
            return Err(TransportError::Rejected {
                status: 503,
                body: "unavailable".to_string(),
            });
        }
        self.delivered.push(record.clone());
        Ok(Ack {
            backend: "mock",
            status: Some(200),
        })
    }
}

fn config(vehicles: usize, seed: u64) -> FleetConfig {
    FleetConfig {
        vehicle_count: vehicles,
        seed: Some(seed),
        ..FleetConfig::default()
    }
}

fn tick_time(tick: i64) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap() + ChronoDuration::seconds(3 * tick)
}

fn generate(config: &FleetConfig, ticks: i64) -> Vec<String> {
    let mut simulator = FleetSimulator::new(config, EnvelopeTable::fallback(), None).unwrap();
    (0..ticks)
        .flat_map(|t| simulator.generate_tick(tick_time(t)))
        .map(|record| record.to_json().unwrap())
        .collect()
}

#[test]
fn test_seeded_runs_are_identical() {
    let anomalous = FleetConfig {
        anomaly: evolution::AnomalyConfig {
            tick_probability: 0.2,
            ..Default::default()
        },
        ..config(5, 42)
    };
    let first = generate(&anomalous, 20);
    let second = generate(&anomalous, 20);
    assert_eq!(first.len(), 100);
    assert_eq!(first, second);

    let other = generate(&FleetConfig { seed: Some(43), ..anomalous }, 20);
    assert_ne!(first, other);
}

#[test]
fn test_records_carry_wire_fields() {
    let mut simulator = FleetSimulator::new(&config(2, 1), EnvelopeTable::fallback(), None).unwrap();
    let record = simulator.generate_tick(tick_time(0)).remove(0);
    let json: serde_json::Value = serde_json::from_str(&record.to_json().unwrap()).unwrap();

    assert_eq!(json["vehicleId"], "TRUCK-001");
    assert_eq!(json["timestamp"], "2024-03-01T12:00:00.000Z");
    assert!(json["specs"]["make"].is_string());
    assert!(json["signals"]["engine_temp"].is_number());
    assert!(json["status"]["location"]["latitude"].is_number());
    assert!(json["status"]["state"] == "NORMAL" || json["status"]["state"] == "ANOMALY");
}

#[tokio::test]
async fn test_publish_failure_does_not_stop_the_tick() {
    let mut simulator = FleetSimulator::new(&config(5, 9), EnvelopeTable::fallback(), None).unwrap();
    let mut transport = MockTransport::failing_on("TRUCK-003");

    for t in 0..4 {
        let report = simulator.run_tick(&mut transport, tick_time(t)).await;
        assert_eq!(report.sent, 4);
        assert_eq!(report.failed, 1);
    }

    let delivered: Vec<&str> = transport.delivered[..4].iter().map(|r| r.vehicle_id.as_str()).collect();
    assert_eq!(delivered, vec!["TRUCK-001", "TRUCK-002", "TRUCK-004", "TRUCK-005"]);

    let stats = simulator.publish_stats();
    assert_eq!(stats.sent, 16);
    assert_eq!(stats.failed, 4);
    assert_eq!(stats.failures_by_vehicle, BTreeMap::from([("TRUCK-003".to_string(), 4)]));
    assert_eq!(stats.recent_failures().len(), 4);
    assert_eq!(stats.recent_failures()[3].tick, 4);
}

#[tokio::test(start_paused = true)]
async fn test_run_summary_reports_success_rate() {
    let config = FleetConfig {
        tick_interval: Duration::from_secs(3),
        run_duration: Some(Duration::from_secs(6)),
        ..config(4, 9)
    };
    let mut simulator = FleetSimulator::new(&config, EnvelopeTable::fallback(), None).unwrap();
    let mut transport = MockTransport::failing_on("TRUCK-002");

    let summary = simulator.run(&mut transport, std::future::pending()).await;

    assert_eq!(summary.ticks, 2);
    assert_eq!(summary.records_sent, 6);
    assert_eq!(summary.publish_failures, 2);
    assert_eq!(summary.success_rate(), Some(0.75));
}

#[test]
fn test_stable_specs_do_not_change_between_ticks() {
    let mut simulator = FleetSimulator::new(&config(3, 5), EnvelopeTable::fallback(), None).unwrap();
    let first = simulator.generate_tick(tick_time(0));
    for t in 1..10 {
        let next = simulator.generate_tick(tick_time(t));
        for (a, b) in first.iter().zip(&next) {
            assert_eq!(a.specs, b.specs);
        }
    }
}

#[test]
fn test_resampled_specs_change_between_ticks() {
    let config = FleetConfig {
        spec_mode: SpecMode::ResampleEachTick,
        ..config(1, 5)
    };
    let mut simulator = FleetSimulator::new(&config, EnvelopeTable::fallback(), None).unwrap();
    let specs: Vec<VehicleSpec> = (0..20)
        .map(|t| simulator.generate_tick(tick_time(t)).remove(0).specs)
        .collect();
    assert!(specs.windows(2).any(|w| w[0] != w[1]));
}

#[test]
fn test_specs_from_reference_table() {
    let mut file = NamedTempFile::new().unwrap();
    file.write_all(b"vehicle_id,make,model,year\nTRUCK-002,Scania,R500,2023\n").unwrap();
    file.flush().unwrap();

    let table = SpecTable::from_path(file.path()).unwrap();
    let mut simulator = FleetSimulator::new(&config(3, 2), EnvelopeTable::fallback(), Some(table)).unwrap();
    let records = simulator.generate_tick(tick_time(0));

    assert_eq!(records[1].specs.model, "R500");
    // vehicles without a row of their own draw from the table
    assert!(records.iter().all(|r| r.specs.make == "Scania"));
}

#[test]
fn test_from_config_uses_fallback_without_datasets() {
    let simulator = FleetSimulator::from_config(&config(2, 3)).unwrap();
    assert_eq!(simulator.envelopes(), &EnvelopeTable::fallback());
    assert!(matches!(simulator.envelope_source(), Some(EnvelopeSource::Fallback { .. })));
    assert_eq!(simulator.store().len(), 2);
}

#[test]
fn test_injected_anomalies_are_detectable() {
    let config = FleetConfig {
        evolution_mode: EvolutionMode::Stateless,
        anomaly: evolution::AnomalyConfig {
            tick_probability: 0.2,
            ..Default::default()
        },
        ..config(5, 21)
    };
    let mut simulator = FleetSimulator::new(&config, EnvelopeTable::fallback(), None).unwrap();
    let detector = EnvelopeDetector::new(EnvelopeTable::fallback());

    let mut score = DetectionScore::default();
    for t in 0..400 {
        for record in simulator.generate_tick(tick_time(t)) {
            score.observe(&detector, &record);
        }
    }

    assert_eq!(score.total(), 2000);
    assert!(score.true_positives + score.false_negatives > 0);
    assert!(score.recall() > 0.6, "recall {:.2}", score.recall());
}

#[tokio::test(start_paused = true)]
async fn test_run_stops_after_configured_duration() {
    let config = FleetConfig {
        tick_interval: Duration::from_secs(3),
        run_duration: Some(Duration::from_secs(9)),
        ..config(2, 4)
    };
    let mut simulator = FleetSimulator::new(&config, EnvelopeTable::fallback(), None).unwrap();
    let mut transport = MockTransport::new();

    let summary = simulator.run(&mut transport, std::future::pending()).await;

    assert_eq!(summary.ticks, 3);
    assert_eq!(summary.records_sent, 6);
    assert_eq!(transport.delivered.len(), 6);
}

#[tokio::test(start_paused = true)]
async fn test_run_honors_shutdown_between_ticks() {
    let mut simulator = FleetSimulator::new(&config(2, 4), EnvelopeTable::fallback(), None).unwrap();
    let mut transport = MockTransport::new();

    let summary = simulator
        .run(&mut transport, tokio::time::sleep(Duration::from_secs(7)))
        .await;

    // ticks at 0s, 3s and 6s complete before the 7s shutdown
    assert_eq!(summary.ticks, 3);
    assert_eq!(summary.publish_failures, 0);
}

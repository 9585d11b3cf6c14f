//! Reference anomaly detectors for offline evaluation.
//!
//! The simulator never calls these. They reproduce the receiving service's
//! threshold rule, plus a statistical rule over the envelopes, so that the
//! detectability of injected anomalies can be measured against the ground
//! truth carried in each record's status.

use crate::envelope::EnvelopeTable;
use crate::telemetry::TelemetryRecord;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

const OVERSPEED_LIMIT_KMH: f64 = 120.0;
const OVERSPEED_SEVERITY: f64 = 0.9;
const DEFAULT_Z_THRESHOLD: f64 = 2.5;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Assessment {
    pub anomaly: bool,
    /// In `[0, 1]`.
    pub severity: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

impl Assessment {
    pub fn normal() -> Self {
        Self {
            anomaly: false,
            severity: 0.0,
            reason: None,
        }
    }
}

pub trait Detector {
    fn assess(&self, signals: &BTreeMap<String, f64>) -> Assessment;
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ThresholdRule {
    pub signal: String,
    pub limit: f64,
    pub severity: f64,
    pub reason: String,
}

/// Fixed upper limits; the first rule exceeded wins.
#[derive(Debug, Clone)]
pub struct ThresholdDetector {
    rules: Vec<ThresholdRule>,
}

impl ThresholdDetector {
    pub fn new(rules: Vec<ThresholdRule>) -> Self {
        Self { rules }
    }

    /// The receiving service's rule: speed above 120 is an overspeed.
    pub fn overspeed() -> Self {
        Self::new(vec![ThresholdRule {
            signal: "speed".to_string(),
            limit: OVERSPEED_LIMIT_KMH,
            severity: OVERSPEED_SEVERITY,
            reason: "overspeed".to_string(),
        }])
    }

    pub fn with_rule(mut self, rule: ThresholdRule) -> Self {
        self.rules.push(rule);
        self
    }
}

impl Default for ThresholdDetector {
    fn default() -> Self {
        Self::overspeed()
    }
}

impl Detector for ThresholdDetector {
    fn assess(&self, signals: &BTreeMap<String, f64>) -> Assessment {
        self.rules
            .iter()
            .find(|rule| signals.get(&rule.signal).is_some_and(|&v| v > rule.limit))
            .map_or_else(Assessment::normal, |rule| Assessment {
                anomaly: true,
                severity: rule.severity.clamp(0.0, 1.0),
                reason: Some(rule.reason.clone()),
            })
    }
}

/// Flags a snapshot when any signal strays more than `z_threshold` standard
/// deviations from its envelope mean.
#[derive(Debug, Clone)]
pub struct EnvelopeDetector {
    envelopes: EnvelopeTable,
    z_threshold: f64,
}

impl EnvelopeDetector {
    pub fn new(envelopes: EnvelopeTable) -> Self {
        Self::with_threshold(envelopes, DEFAULT_Z_THRESHOLD)
    }

    pub fn with_threshold(envelopes: EnvelopeTable, z_threshold: f64) -> Self {
        Self {
            envelopes,
            z_threshold: z_threshold.abs(),
        }
    }
}

impl Detector for EnvelopeDetector {
    fn assess(&self, signals: &BTreeMap<String, f64>) -> Assessment {
        let worst = signals
            .iter()
            .filter_map(|(name, &v)| self.envelopes.get(name).map(|e| (name, e.z_score(v).abs())))
            .max_by(|a, b| a.1.total_cmp(&b.1));

        match worst {
            Some((name, z)) if z > self.z_threshold => Assessment {
                anomaly: true,
                // saturates at twice the threshold
                severity: (z / (2.0 * self.z_threshold)).min(1.0),
                reason: Some(format!("{name} z={z:.2}")),
            },
            _ => Assessment::normal(),
        }
    }
}

/// Confusion matrix of detector verdicts against injected ground truth.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DetectionScore {
    pub true_positives: u64,
    pub false_positives: u64,
    pub true_negatives: u64,
    pub false_negatives: u64,
}

impl DetectionScore {
    pub fn record(&mut self, predicted: bool, actual: bool) {
        match (predicted, actual) {
            (true, true) => self.true_positives += 1,
            (true, false) => self.false_positives += 1,
            (false, false) => self.true_negatives += 1,
            (false, true) => self.false_negatives += 1,
        }
    }

    pub fn observe<D: Detector + ?Sized>(&mut self, detector: &D, record: &TelemetryRecord) -> Assessment {
        let assessment = detector.assess(&record.signals);
        self.record(assessment.anomaly, record.is_anomalous());
        assessment
    }

    pub fn total(&self) -> u64 {
        self.true_positives + self.false_positives + self.true_negatives + self.false_negatives
    }

    pub fn precision(&self) -> f64 {
        ratio(self.true_positives, self.true_positives + self.false_positives)
    }

    pub fn recall(&self) -> f64 {
        ratio(self.true_positives, self.true_positives + self.false_negatives)
    }

    pub fn accuracy(&self) -> f64 {
        ratio(self.true_positives + self.true_negatives, self.total())
    }
}

fn ratio(numerator: u64, denominator: u64) -> f64 {
    if denominator == 0 {
        0.0
    } else {
        numerator as f64 / denominator as f64
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::envelope::SignalEnvelope;

    fn snapshot(pairs: &[(&str, f64)]) -> BTreeMap<String, f64> {
        pairs.iter().map(|(k, v)| (k.to_string(), *v)).collect()
    }

    #[test]
    fn test_overspeed_rule() {
        let detector = ThresholdDetector::overspeed();
        let fast = detector.assess(&snapshot(&[("speed", 121.0)]));
        assert!(fast.anomaly);
        assert_eq!(fast.severity, 0.9);
        assert_eq!(fast.reason.as_deref(), Some("overspeed"));

        assert_eq!(detector.assess(&snapshot(&[("speed", 120.0)])), Assessment::normal());
        assert_eq!(detector.assess(&snapshot(&[("rpm", 9000.0)])), Assessment::normal());
    }

    #[test]
    fn test_extra_threshold_rule() {
        let detector = ThresholdDetector::overspeed().with_rule(ThresholdRule {
            signal: "engine_temp".to_string(),
            limit: 110.0,
            severity: 0.7,
            reason: "overheating".to_string(),
        });
        let hot = detector.assess(&snapshot(&[("speed", 80.0), ("engine_temp", 115.0)]));
        assert_eq!(hot.reason.as_deref(), Some("overheating"));
    }

    #[test]
    fn test_envelope_detector() {
        let mut envelopes = EnvelopeTable::new();
        envelopes.insert("speed", SignalEnvelope::new(65.0, 15.0, 0.0, 120.0));
        let detector = EnvelopeDetector::new(envelopes);

        assert!(!detector.assess(&snapshot(&[("speed", 80.0)])).anomaly);
        let far = detector.assess(&snapshot(&[("speed", 115.0)]));
        assert!(far.anomaly);
        assert!(far.severity > 0.0 && far.severity <= 1.0);
    }

    #[test]
    fn test_score_ratios() {
        let mut score = DetectionScore::default();
        score.record(true, true);
        score.record(true, false);
        score.record(false, false);
        score.record(false, true);
        score.record(true, true);

        assert_eq!(score.total(), 5);
        assert!((score.precision() - 2.0 / 3.0).abs() < 1e-12);
        assert!((score.recall() - 2.0 / 3.0).abs() < 1e-12);
        assert!((score.accuracy() - 3.0 / 5.0).abs() < 1e-12);
        assert_eq!(DetectionScore::default().precision(), 0.0);
    }
}

use std::time::{Duration, Instant};

use serde::Serialize;

/// Sliding evaluator for one named metric. A breach only fires after the
/// value has stayed above the threshold continuously for the required
/// duration; any dip to or below the threshold resets the clock.
#[derive(Debug, Clone)]
pub struct ThresholdEvaluator {
    name: String,
    threshold_value: f64,
    required_duration: Duration,
    current_value: f64,
    exceeded_since: Option<Instant>,
}

impl ThresholdEvaluator {
    pub fn new(name: impl Into<String>, threshold_value: f64, required_duration: Duration) -> Self {
        Self {
            name: name.into(),
            threshold_value,
            required_duration,
            current_value: 0.0,
            exceeded_since: None,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Feed the latest value; true means the breach has been sustained for
    /// the required duration. `exceeded_since` is left set after a true
    /// result: the caller consumes the signal once per cycle.
    pub fn check(&mut self, value: f64) -> bool {
        self.check_at(value, Instant::now())
    }

    pub fn check_at(&mut self, value: f64, now: Instant) -> bool {
        self.current_value = value;
        if value > self.threshold_value {
            let since = *self.exceeded_since.get_or_insert(now);
            now.duration_since(since) >= self.required_duration
        } else {
            self.exceeded_since = None;
            false
        }
    }

    pub fn snapshot(&self) -> ThresholdSnapshot {
        ThresholdSnapshot {
            name: self.name.clone(),
            current_value: self.current_value,
            threshold_value: self.threshold_value,
            required_secs: self.required_duration.as_secs_f64(),
            exceeded_for_secs: self.exceeded_since.map(|s| s.elapsed().as_secs_f64()),
        }
    }
}

/// Point-in-time view of one evaluator, served by the status endpoint.
#[derive(Debug, Clone, Serialize)]
pub struct ThresholdSnapshot {
    pub name: String,
    pub current_value: f64,
    pub threshold_value: f64,
    pub required_secs: f64,
    pub exceeded_for_secs: Option<f64>,
}

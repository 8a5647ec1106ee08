use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

/// Protective state machine for one external dependency. After
/// `failure_threshold` consecutive failures the circuit opens and calls are
/// refused until the cooldown elapses; the first call after cooldown runs
/// half-open as a trial.
#[derive(Debug)]
pub struct CircuitBreaker {
    state: CircuitState,
    failure_count: u32,
    failure_threshold: u32,
    cooldown: Duration,
    last_failure_time: Option<Instant>,
}

impl CircuitBreaker {
    pub fn new(failure_threshold: u32, cooldown: Duration) -> Self {
        Self {
            state: CircuitState::Closed,
            failure_count: 0,
            failure_threshold: failure_threshold.max(1),
            cooldown,
            last_failure_time: None,
        }
    }

    pub fn state(&self) -> CircuitState {
        self.state
    }

    /// Whether a call may proceed right now.
    pub fn allow_request(&mut self) -> bool {
        self.allow_request_at(Instant::now())
    }

    pub fn allow_request_at(&mut self, now: Instant) -> bool {
        match self.state {
            CircuitState::Closed | CircuitState::HalfOpen => true,
            CircuitState::Open => {
                let cooled = self
                    .last_failure_time
                    .map(|t| now.duration_since(t) >= self.cooldown)
                    .unwrap_or(true);
                if cooled {
                    self.state = CircuitState::HalfOpen;
                }
                cooled
            }
        }
    }

    pub fn record_success(&mut self) {
        self.state = CircuitState::Closed;
        self.failure_count = 0;
        self.last_failure_time = None;
    }

    pub fn record_failure(&mut self) {
        self.record_failure_at(Instant::now());
    }

    pub fn record_failure_at(&mut self, now: Instant) {
        self.failure_count += 1;
        self.last_failure_time = Some(now);
        // A failed half-open trial reopens immediately.
        if self.state == CircuitState::HalfOpen || self.failure_count >= self.failure_threshold {
            self.state = CircuitState::Open;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn opens_after_threshold_and_cools_down() {
        let mut cb = CircuitBreaker::new(3, Duration::from_secs(30));
        let t0 = Instant::now();

        for _ in 0..3 {
            assert!(cb.allow_request_at(t0));
            cb.record_failure_at(t0);
        }
        assert_eq!(cb.state(), CircuitState::Open);
        assert!(!cb.allow_request_at(t0 + Duration::from_secs(29)));

        // Cooldown elapsed: half-open trial allowed.
        assert!(cb.allow_request_at(t0 + Duration::from_secs(30)));
        assert_eq!(cb.state(), CircuitState::HalfOpen);

        cb.record_success();
        assert_eq!(cb.state(), CircuitState::Closed);
    }

    #[test]
    fn failed_half_open_trial_reopens() {
        let mut cb = CircuitBreaker::new(1, Duration::from_secs(10));
        let t0 = Instant::now();
        cb.record_failure_at(t0);
        assert_eq!(cb.state(), CircuitState::Open);

        assert!(cb.allow_request_at(t0 + Duration::from_secs(10)));
        cb.record_failure_at(t0 + Duration::from_secs(10));
        assert_eq!(cb.state(), CircuitState::Open);
        assert!(!cb.allow_request_at(t0 + Duration::from_secs(15)));
    }

    #[test]
    fn success_resets_consecutive_failures() {
        let mut cb = CircuitBreaker::new(3, Duration::from_secs(10));
        cb.record_failure();
        cb.record_failure();
        cb.record_success();
        cb.record_failure();
        cb.record_failure();
        assert_eq!(cb.state(), CircuitState::Closed);
    }
}

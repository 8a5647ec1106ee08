use std::sync::Arc;
use std::sync::Mutex;
use std::time::Duration;

use crate::circuit::CircuitBreaker;
use crate::error::{GuardError, GuardResult};
use crate::ports::ReadinessCheck;
use crate::retry;

#[derive(Debug, Clone)]
pub struct ProbeConfig {
    /// Attempts for `verify_healthy` before the condition escalates.
    pub max_attempts: u32,
    pub backoff_base: Duration,
    pub backoff_cap: Duration,
    pub breaker_failure_threshold: u32,
    pub breaker_cooldown: Duration,
}

impl Default for ProbeConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            backoff_base: Duration::from_millis(500),
            backoff_cap: Duration::from_secs(8),
            breaker_failure_threshold: 3,
            breaker_cooldown: Duration::from_secs(30),
        }
    }
}

/// Bounded readiness/liveness checking against the protected service, with
/// a circuit breaker so a flapping endpoint is not hammered during cooldown.
pub struct ServiceHealthProbe {
    check: Arc<dyn ReadinessCheck>,
    breaker: Mutex<CircuitBreaker>,
    cfg: ProbeConfig,
}

impl ServiceHealthProbe {
    pub fn new(check: Arc<dyn ReadinessCheck>, cfg: ProbeConfig) -> Self {
        let breaker = CircuitBreaker::new(cfg.breaker_failure_threshold, cfg.breaker_cooldown);
        Self {
            check,
            breaker: Mutex::new(breaker),
            cfg,
        }
    }

    /// Single probe. A refused request (open circuit) counts as not ready.
    pub async fn check_ready(&self) -> bool {
        if !self.breaker.lock().unwrap().allow_request() {
            tracing::debug!("health probe: circuit open, skipping call");
            return false;
        }
        let ready = self.check.check_ready().await;
        let mut breaker = self.breaker.lock().unwrap();
        if ready {
            breaker.record_success();
        } else {
            breaker.record_failure();
        }
        ready
    }

    /// Bounded-retry verification used pre-cutover and after a rollback.
    /// Exhaustion surfaces as a transient error for the caller to escalate.
    pub async fn verify_healthy(&self) -> GuardResult<()> {
        retry::bounded(
            "health verification",
            self.cfg.max_attempts,
            self.cfg.backoff_base,
            self.cfg.backoff_cap,
            || async {
                if self.check.check_ready().await {
                    Ok(())
                } else {
                    Err(GuardError::Transient("instance not ready".into()))
                }
            },
        )
        .await
    }
}

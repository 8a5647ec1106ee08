use std::sync::Arc;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use serde::Deserialize;

use crate::error::{GuardError, GuardResult};
use crate::ports::ControlPlane;
use crate::probe::ServiceHealthProbe;
use crate::retry;

/// How the candidate instance set is provisioned. The readiness/redirect
/// contract is identical for both.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Topology {
    /// Parallel blue/green label sets, atomic redirect between them.
    DualStack,
    /// In-place rolling update of the live label set.
    SingleStack,
}

#[derive(Debug, Clone)]
pub struct SwitcherConfig {
    pub topology: Topology,
    pub ready_backoff_base: Duration,
    pub ready_backoff_cap: Duration,
    /// Total wait budget for the candidate to become ready.
    pub ready_budget: Duration,
    pub control_attempts: u32,
    pub control_backoff_base: Duration,
    pub control_backoff_cap: Duration,
}

impl Default for SwitcherConfig {
    fn default() -> Self {
        Self {
            topology: Topology::DualStack,
            ready_backoff_base: Duration::from_millis(500),
            ready_backoff_cap: Duration::from_secs(8),
            ready_budget: Duration::from_secs(60),
            control_attempts: 3,
            control_backoff_base: Duration::from_millis(500),
            control_backoff_cap: Duration::from_secs(4),
        }
    }
}

/// Blue-green (or rolling) traffic cutover. Any step failure tears the
/// candidate down and leaves live traffic untouched.
pub struct VersionSwitcher {
    control: Arc<dyn ControlPlane>,
    probe: Arc<ServiceHealthProbe>,
    cfg: SwitcherConfig,
    active: Mutex<String>,
}

impl VersionSwitcher {
    pub fn new(
        control: Arc<dyn ControlPlane>,
        probe: Arc<ServiceHealthProbe>,
        cfg: SwitcherConfig,
    ) -> Self {
        let initial = match cfg.topology {
            Topology::DualStack => "blue",
            Topology::SingleStack => "primary",
        };
        Self {
            control,
            probe,
            cfg,
            active: Mutex::new(initial.to_string()),
        }
    }

    pub fn active_label(&self) -> String {
        self.active.lock().unwrap().clone()
    }

    fn candidate_label(&self) -> String {
        let active = self.active.lock().unwrap();
        match self.cfg.topology {
            Topology::DualStack => {
                if *active == "blue" {
                    "green".to_string()
                } else {
                    "blue".to_string()
                }
            }
            Topology::SingleStack => active.clone(),
        }
    }

    /// Provision the candidate, gate on readiness, then redirect traffic.
    pub async fn switch(&self, artifact_ref: &str) -> GuardResult<()> {
        let candidate = self.candidate_label();
        tracing::info!("switch: bringing up {artifact_ref} as '{candidate}'");

        let labels = vec![candidate.clone()];
        if let Err(e) = retry::bounded(
            "bring_up",
            self.cfg.control_attempts,
            self.cfg.control_backoff_base,
            self.cfg.control_backoff_cap,
            || self.control.bring_up(artifact_ref, &labels),
        )
        .await
        {
            self.discard_candidate(&candidate).await;
            return Err(e);
        }

        if let Err(e) = self.await_ready().await {
            tracing::warn!("switch: candidate '{candidate}' never became ready");
            self.discard_candidate(&candidate).await;
            return Err(e);
        }

        if let Err(e) = retry::bounded(
            "redirect_traffic",
            self.cfg.control_attempts,
            self.cfg.control_backoff_base,
            self.cfg.control_backoff_cap,
            || self.control.redirect_traffic(&candidate),
        )
        .await
        {
            self.discard_candidate(&candidate).await;
            return Err(e);
        }

        *self.active.lock().unwrap() = candidate.clone();
        tracing::info!("switch: traffic redirected to '{candidate}'");
        Ok(())
    }

    /// Re-apply the previous artifact through the identical
    /// readiness-then-redirect sequence, then tear down the abandoned stack.
    pub async fn revert(&self, previous_artifact: &str) -> GuardResult<()> {
        let abandoned = self.active_label();
        tracing::info!("revert: re-applying {previous_artifact}, abandoning '{abandoned}'");
        self.switch(previous_artifact).await?;

        let now_active = self.active_label();
        if abandoned != now_active {
            if let Err(e) = self.control.tear_down(&[abandoned.clone()]).await {
                // Traffic is already safe on the previous artifact; the
                // orphan stack is an operator cleanup, not a rollback
                // failure.
                tracing::warn!("revert: teardown of '{abandoned}' failed: {e}");
            }
        }
        Ok(())
    }

    async fn discard_candidate(&self, candidate: &str) {
        // In-place topology shares the live label set; tearing it down
        // would take live traffic with it.
        if *candidate == *self.active.lock().unwrap() {
            return;
        }
        if let Err(e) = self.control.tear_down(&[candidate.to_string()]).await {
            tracing::warn!("teardown of failed candidate '{candidate}' failed: {e}");
        }
    }

    /// Poll readiness with capped exponential backoff until the total wait
    /// budget is spent.
    async fn await_ready(&self) -> GuardResult<()> {
        let started = Instant::now();
        let mut delay = self.cfg.ready_backoff_base;
        loop {
            if self.probe.check_ready().await {
                return Ok(());
            }
            if started.elapsed() >= self.cfg.ready_budget {
                return Err(GuardError::Transient(format!(
                    "readiness budget of {:?} exhausted",
                    self.cfg.ready_budget
                )));
            }
            tokio::time::sleep(retry::jittered(delay)).await;
            delay = (delay * 2).min(self.cfg.ready_backoff_cap);
        }
    }
}

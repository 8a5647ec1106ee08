use std::collections::BTreeMap;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::{Duration, Instant};

use chrono::Utc;
use tokio::sync::{Mutex as AsyncMutex, watch};
use tokio::task::JoinHandle;

use crate::alert::{AlertDispatcher, Severity};
use crate::error::{GuardError, GuardResult};
use crate::migration::SchemaMigrationCoordinator;
use crate::models::deployment::{
    DeploymentState, DeploymentVersion, RollbackEvent, RollbackReason, StatusReport,
};
use crate::monitor;
use crate::ports::{CacheInvalidator, MetricsSnapshotProvider};
use crate::probe::ServiceHealthProbe;
use crate::retry;
use crate::sessions::SessionPreservationManager;
use crate::state_db::StateDb;
use crate::switcher::VersionSwitcher;
use crate::threshold::ThresholdEvaluator;

#[derive(Debug, Clone)]
pub struct ThresholdSpec {
    pub metric: String,
    pub threshold: f64,
    pub required: Duration,
}

#[derive(Debug, Clone)]
pub struct ControllerConfig {
    pub interval: Duration,
    pub window: Duration,
    pub health_fail_limit: u32,
    pub thresholds: Vec<ThresholdSpec>,
}

struct Inner {
    state: DeploymentState,
    current: Option<DeploymentVersion>,
    previous: Option<DeploymentVersion>,
    evaluators: Vec<ThresholdEvaluator>,
    health_failures: u32,
    monitor_cancel: Option<watch::Sender<bool>>,
    monitor_handle: Option<JoinHandle<()>>,
}

/// Owns the deployment state machine and sequences every other component.
/// All transitions and version-pointer swaps happen under `inner`; `deploy`
/// and rollback additionally serialize on `op_lock` so the two long
/// sequences are never concurrent with each other.
pub struct RollbackController {
    inner: StdMutex<Inner>,
    op_lock: AsyncMutex<()>,
    db: Arc<StateDb>,
    sessions: Arc<SessionPreservationManager>,
    switcher: Arc<VersionSwitcher>,
    migrations: SchemaMigrationCoordinator,
    cache: Arc<dyn CacheInvalidator>,
    metrics: Arc<dyn MetricsSnapshotProvider>,
    probe: Arc<ServiceHealthProbe>,
    alerts: Arc<AlertDispatcher>,
    cfg: ControllerConfig,
}

impl RollbackController {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        db: Arc<StateDb>,
        sessions: Arc<SessionPreservationManager>,
        switcher: Arc<VersionSwitcher>,
        migrations: SchemaMigrationCoordinator,
        cache: Arc<dyn CacheInvalidator>,
        metrics: Arc<dyn MetricsSnapshotProvider>,
        probe: Arc<ServiceHealthProbe>,
        alerts: Arc<AlertDispatcher>,
        cfg: ControllerConfig,
    ) -> Self {
        Self {
            inner: StdMutex::new(Inner {
                state: DeploymentState::Stable,
                current: None,
                previous: None,
                evaluators: Vec::new(),
                health_failures: 0,
                monitor_cancel: None,
                monitor_handle: None,
            }),
            op_lock: AsyncMutex::new(()),
            db,
            sessions,
            switcher,
            migrations,
            cache,
            metrics,
            probe,
            alerts,
            cfg,
        }
    }

    pub(crate) fn monitor_interval(&self) -> Duration {
        self.cfg.interval
    }

    pub(crate) fn monitor_window(&self) -> Duration {
        self.cfg.window
    }

    /// Record the transition durably, then apply it. Illegal edges are
    /// rejected, not ignored.
    fn transition_locked(
        &self,
        inner: &mut Inner,
        to: DeploymentState,
        note: Option<&str>,
    ) -> GuardResult<()> {
        let from = inner.state;
        if !from.can_transition(to) {
            return Err(GuardError::InvalidTransition { from, to });
        }
        self.db.record_transition(from, to, note)?;
        inner.state = to;
        tracing::info!("state: {from} -> {to}");
        Ok(())
    }

    fn transition(&self, to: DeploymentState, note: Option<&str>) -> GuardResult<()> {
        let mut inner = self.inner.lock().unwrap();
        self.transition_locked(&mut inner, to, note)
    }

    /// Deploy a new version: snapshot sessions, cut traffic over, then
    /// monitor. A failed switch leaves the controller stable with no
    /// partial mutation; the candidate is already torn down.
    pub async fn deploy(
        self: &Arc<Self>,
        version_id: &str,
        artifact_ref: &str,
        config_snapshot: BTreeMap<String, serde_json::Value>,
    ) -> GuardResult<()> {
        let _op = self.op_lock.lock().await;
        {
            let inner = self.inner.lock().unwrap();
            if inner.state != DeploymentState::Stable {
                return Err(GuardError::Precondition(format!(
                    "deploy requires stable state, currently {}",
                    inner.state
                )));
            }
        }

        // Sessions are protected before any traffic moves.
        let backup = self.sessions.backup_all().await?;
        if backup.failed > 0 {
            tracing::warn!(
                "deploy {version_id}: {} of {} sessions failed to back up",
                backup.failed,
                backup.total
            );
        }

        let schema_revision = self.migrations.current_version().await?;
        let metrics_baseline = match self.metrics.snapshot().await {
            Ok(m) => m,
            Err(e) => {
                tracing::warn!("deploy {version_id}: baseline snapshot unavailable: {e}");
                Default::default()
            }
        };
        let version = DeploymentVersion {
            id: version_id.to_string(),
            deployed_at: Utc::now(),
            artifact_ref: artifact_ref.to_string(),
            config_snapshot,
            metrics_baseline,
            schema_revision,
        };

        self.transition(DeploymentState::Deploying, Some(version_id))?;
        match self.switcher.switch(artifact_ref).await {
            Ok(()) => {
                self.db.record_deployment(&version)?;
                {
                    let mut inner = self.inner.lock().unwrap();
                    inner.previous = inner.current.take();
                    inner.current = Some(version);
                    inner.evaluators = self
                        .cfg
                        .thresholds
                        .iter()
                        .map(|t| ThresholdEvaluator::new(&t.metric, t.threshold, t.required))
                        .collect();
                    inner.health_failures = 0;
                    self.transition_locked(&mut inner, DeploymentState::Monitoring, Some("switch ok"))?;
                }
                self.start_monitor();
                self.alerts
                    .notify(
                        Severity::Info,
                        "deployment live",
                        &format!(
                            "version {version_id} serving traffic, monitoring for {:?}",
                            self.cfg.window
                        ),
                        None,
                    )
                    .await;
                Ok(())
            }
            Err(e) => {
                // Nothing went live; settle straight back to stable.
                self.transition(DeploymentState::Stable, Some("switch failed"))?;
                self.alerts
                    .notify(
                        Severity::Warning,
                        "deployment failed",
                        &format!("switch to {version_id} failed: {e}"),
                        None,
                    )
                    .await;
                Err(e)
            }
        }
    }

    fn start_monitor(self: &Arc<Self>) {
        let (tx, rx) = watch::channel(false);
        let handle = monitor::spawn(self.clone(), rx);
        let mut inner = self.inner.lock().unwrap();
        inner.monitor_cancel = Some(tx);
        inner.monitor_handle = Some(handle);
    }

    /// Manual or external rollback trigger.
    pub async fn trigger_rollback(self: &Arc<Self>, reason: RollbackReason) -> GuardResult<RollbackEvent> {
        self.rollback(reason, false).await
    }

    pub(crate) async fn rollback_from_monitor(
        self: &Arc<Self>,
        reason: RollbackReason,
    ) -> GuardResult<RollbackEvent> {
        self.rollback(reason, true).await
    }

    async fn rollback(
        self: &Arc<Self>,
        reason: RollbackReason,
        from_monitor: bool,
    ) -> GuardResult<RollbackEvent> {
        let started = Instant::now();

        // Atomic claim: exactly one caller moves monitoring ->
        // rollback_triggered; a concurrent second call is rejected here,
        // not queued.
        let handle = {
            let mut inner = self.inner.lock().unwrap();
            match inner.state {
                DeploymentState::Monitoring => {
                    self.transition_locked(
                        &mut inner,
                        DeploymentState::RollbackTriggered,
                        Some(reason.as_str()),
                    )?;
                }
                DeploymentState::RollbackTriggered | DeploymentState::RollingBack => {
                    return Err(GuardError::RollbackInProgress);
                }
                other => {
                    return Err(GuardError::Precondition(format!(
                        "cannot trigger rollback from {other}"
                    )));
                }
            }
            if let Some(cancel) = inner.monitor_cancel.take() {
                let _ = cancel.send(true);
            }
            inner.monitor_handle.take()
        };
        // Join the loop so a stale breach cannot fire a second rollback.
        // The monitor path would self-join and deadlock, so it only drops
        // its handle; the claim above already protects it.
        if !from_monitor {
            if let Some(handle) = handle {
                let _ = handle.await;
            }
        }

        let _op = self.op_lock.lock().await;
        self.transition(DeploymentState::RollingBack, None)?;

        match self.run_rollback_sequence(reason, started).await {
            Ok(event) => Ok(event),
            Err(e) => {
                // Deliberately not auto-retried: flipping traffic again in
                // an unknown-bad state risks compounding data loss. The
                // controller stays in rolling_back until an operator steps
                // in.
                tracing::error!("rollback failed, automation halted: {e}");
                self.alerts
                    .notify(
                        Severity::Critical,
                        "rollback failed",
                        &format!(
                            "rollback ({reason}) halted in rolling_back: {e}; manual intervention required"
                        ),
                        None,
                    )
                    .await;
                Err(e)
            }
        }
    }

    async fn run_rollback_sequence(
        &self,
        reason: RollbackReason,
        started: Instant,
    ) -> GuardResult<RollbackEvent> {
        let (current, previous) = {
            let inner = self.inner.lock().unwrap();
            let current = inner
                .current
                .clone()
                .ok_or_else(|| GuardError::Fatal("rollback with no current version".into()))?;
            let previous = inner
                .previous
                .clone()
                .ok_or_else(|| GuardError::Fatal("rollback with no previous version".into()))?;
            (current, previous)
        };

        self.switcher.revert(&previous.artifact_ref).await?;
        self.migrations
            .downgrade_if_needed(&previous.schema_revision)
            .await?;
        retry::bounded(
            "cache flush",
            3,
            Duration::from_millis(200),
            Duration::from_secs(2),
            || self.cache.flush_all(),
        )
        .await?;
        self.probe.verify_healthy().await.map_err(|e| {
            GuardError::Fatal(format!("reverted instance failed health verification: {e}"))
        })?;

        let event = RollbackEvent {
            id: uuid::Uuid::new_v4().to_string(),
            triggered_at: Utc::now(),
            reason,
            from_version: current.id.clone(),
            to_version: previous.id.clone(),
            duration_ms: started.elapsed().as_millis() as u64,
        };

        {
            let mut inner = self.inner.lock().unwrap();
            self.transition_locked(&mut inner, DeploymentState::RolledBack, Some(reason.as_str()))?;
            inner.current = Some(previous);
            // The rolled-back-from version is discarded, not kept around.
            inner.previous = None;
            inner.evaluators.clear();
        }
        self.db.append_rollback_event(&event)?;
        self.alerts
            .notify(
                Severity::Warning,
                "rollback completed",
                &format!(
                    "reverted {} -> {} after {} in {}ms",
                    event.from_version, event.to_version, reason, event.duration_ms
                ),
                Some(&event),
            )
            .await;

        // Best-effort bulk restore; per-session failures are visible in the
        // stats, never fatal to an already-completed rollback.
        match self.sessions.restore_all().await {
            Ok(stats) if stats.failed > 0 => {
                tracing::warn!(
                    "session restore: {} of {} sessions failed",
                    stats.failed,
                    stats.total
                );
            }
            Ok(_) => {}
            Err(e) => tracing::error!("session restore after rollback failed: {e}"),
        }
        Ok(event)
    }

    /// Called by the monitor when the window elapses with no breach.
    pub(crate) fn finish_monitoring(&self) {
        let mut inner = self.inner.lock().unwrap();
        if inner.state != DeploymentState::Monitoring {
            return;
        }
        if let Err(e) = self.transition_locked(
            &mut inner,
            DeploymentState::Stable,
            Some("monitoring window elapsed, no breach"),
        ) {
            tracing::error!("failed to settle to stable: {e}");
            return;
        }
        inner.monitor_cancel = None;
        inner.monitor_handle = None;
    }

    /// One monitoring tick: pull a snapshot, probe liveness, feed the
    /// evaluators. Returns the reason to roll back, if any breach has been
    /// sustained long enough.
    pub(crate) async fn evaluate_tick(&self) -> GuardResult<Option<RollbackReason>> {
        let snapshot = self.metrics.snapshot().await?;
        let ready = self.probe.check_ready().await;

        let mut inner = self.inner.lock().unwrap();
        if inner.state != DeploymentState::Monitoring {
            return Ok(None);
        }

        if ready {
            inner.health_failures = 0;
        } else {
            inner.health_failures += 1;
            tracing::warn!(
                "monitor: liveness probe failed ({}/{})",
                inner.health_failures,
                self.cfg.health_fail_limit
            );
            if inner.health_failures >= self.cfg.health_fail_limit {
                return Ok(Some(RollbackReason::HealthCheckFailed));
            }
        }

        let baseline = inner
            .current
            .as_ref()
            .map(|v| v.metrics_baseline.clone())
            .unwrap_or_default();
        for evaluator in inner.evaluators.iter_mut() {
            let Some(raw) = snapshot.get(evaluator.name()).copied() else {
                continue;
            };
            // Response time is judged relative to the deploy-time baseline
            // so workload-driven latency swings don't false-positive.
            let value = if evaluator.name() == "response_time" {
                let base = baseline
                    .get("response_time")
                    .copied()
                    .filter(|b| *b > 0.0)
                    .unwrap_or(1.0);
                raw / base
            } else {
                raw
            };
            if evaluator.check(value) {
                return Ok(Some(RollbackReason::for_metric(evaluator.name())));
            }
        }
        Ok(None)
    }

    /// Operator acknowledgement after a completed rollback; the only way
    /// back to stable.
    pub fn acknowledge_rollback(&self) -> GuardResult<()> {
        let mut inner = self.inner.lock().unwrap();
        if inner.state != DeploymentState::RolledBack {
            return Err(GuardError::Precondition(format!(
                "nothing to acknowledge in {}",
                inner.state
            )));
        }
        self.transition_locked(&mut inner, DeploymentState::Stable, Some("operator acknowledged"))
    }

    /// Side-effect free status view.
    pub fn status(&self) -> GuardResult<StatusReport> {
        let inner = self.inner.lock().unwrap();
        Ok(StatusReport {
            state: inner.state,
            current_version: inner.current.as_ref().map(|v| v.id.clone()),
            previous_version: inner.previous.as_ref().map(|v| v.id.clone()),
            rollback_in_progress: matches!(
                inner.state,
                DeploymentState::RollbackTriggered | DeploymentState::RollingBack
            ),
            recent_events: self.db.list_recent_events(20)?,
            live_threshold_values: inner.evaluators.iter().map(|e| e.snapshot()).collect(),
        })
    }

    pub fn recent_events(&self, limit: usize) -> GuardResult<Vec<RollbackEvent>> {
        self.db.list_recent_events(limit)
    }

    /// Cancel and join the monitoring task, if any.
    pub async fn shutdown(&self) {
        let handle = {
            let mut inner = self.inner.lock().unwrap();
            if let Some(cancel) = inner.monitor_cancel.take() {
                let _ = cancel.send(true);
            }
            inner.monitor_handle.take()
        };
        if let Some(handle) = handle {
            let _ = handle.await;
        }
    }

    #[cfg(test)]
    pub(crate) fn force_state(&self, state: DeploymentState) {
        self.inner.lock().unwrap().state = state;
    }

    #[cfg(test)]
    pub(crate) fn current_state(&self) -> DeploymentState {
        self.inner.lock().unwrap().state
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alert::SmtpConfig;
    use crate::ports::fakes::{FakeCache, FakeControlPlane, FakeMetrics, FakeMigrationTool, FakeReadiness};
    use crate::probe::ProbeConfig;
    use crate::session_store::MemorySessionStore;
    use crate::sessions::SessionConfig;
    use crate::switcher::{SwitcherConfig, Topology};
    use std::collections::BTreeMap;

    struct Fixture {
        controller: Arc<RollbackController>,
        control: Arc<FakeControlPlane>,
        metrics: Arc<FakeMetrics>,
        readiness: Arc<FakeReadiness>,
        migration_tool: Arc<FakeMigrationTool>,
        cache: Arc<FakeCache>,
        store: Arc<MemorySessionStore>,
        sessions: Arc<SessionPreservationManager>,
        db: Arc<StateDb>,
    }

    fn fixture(cfg: ControllerConfig) -> Fixture {
        let control = Arc::new(FakeControlPlane::default());
        let metrics = Arc::new(FakeMetrics::default());
        let readiness = Arc::new(FakeReadiness::default());
        let migration_tool = Arc::new(FakeMigrationTool::at("rev-1"));
        let cache = Arc::new(FakeCache::default());
        let store = Arc::new(MemorySessionStore::new());
        let db = Arc::new(StateDb::open_in_memory().unwrap());

        let probe = Arc::new(ServiceHealthProbe::new(
            readiness.clone(),
            ProbeConfig {
                max_attempts: 2,
                backoff_base: Duration::from_millis(1),
                backoff_cap: Duration::from_millis(2),
                breaker_failure_threshold: 1000,
                breaker_cooldown: Duration::from_millis(1),
            },
        ));
        let switcher = Arc::new(VersionSwitcher::new(
            control.clone(),
            probe.clone(),
            SwitcherConfig {
                topology: Topology::DualStack,
                ready_backoff_base: Duration::from_millis(1),
                ready_backoff_cap: Duration::from_millis(2),
                ready_budget: Duration::from_millis(20),
                control_attempts: 2,
                control_backoff_base: Duration::from_millis(1),
                control_backoff_cap: Duration::from_millis(2),
            },
        ));
        let sessions = Arc::new(SessionPreservationManager::new(
            store.clone(),
            SessionConfig {
                live_ttl: Duration::from_secs(60),
                backup_ttl: Duration::from_secs(600),
                concurrency: 8,
            },
        ));
        let alerts = Arc::new(AlertDispatcher::new(
            reqwest::Client::new(),
            Vec::new(),
            SmtpConfig::default(),
        ));
        let controller = Arc::new(RollbackController::new(
            db.clone(),
            sessions.clone(),
            switcher,
            SchemaMigrationCoordinator::new(migration_tool.clone()),
            cache.clone(),
            metrics.clone(),
            probe,
            alerts,
            cfg,
        ));
        Fixture {
            controller,
            control,
            metrics,
            readiness,
            migration_tool,
            cache,
            store,
            sessions,
            db,
        }
    }

    fn fast_cfg() -> ControllerConfig {
        ControllerConfig {
            interval: Duration::from_millis(20),
            window: Duration::from_millis(200),
            health_fail_limit: 3,
            thresholds: vec![ThresholdSpec {
                metric: "error_rate".to_string(),
                threshold: 0.05,
                required: Duration::from_millis(60),
            }],
        }
    }

    async fn wait_for_state(fx: &Fixture, want: DeploymentState, budget: Duration) {
        let started = Instant::now();
        loop {
            if fx.controller.current_state() == want {
                return;
            }
            if started.elapsed() > budget {
                panic!(
                    "timed out waiting for {want}, still {}",
                    fx.controller.current_state()
                );
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    #[tokio::test]
    async fn only_modeled_edges_are_accepted() {
        use DeploymentState::*;
        let allowed = [
            (Stable, Deploying),
            (Deploying, Monitoring),
            (Deploying, Stable),
            (Monitoring, Stable),
            (Monitoring, RollbackTriggered),
            (RollbackTriggered, RollingBack),
            (RollingBack, RolledBack),
            (RolledBack, Stable),
        ];
        let fx = fixture(fast_cfg());
        for from in DeploymentState::all() {
            for to in DeploymentState::all() {
                fx.controller.force_state(from);
                let result = fx.controller.transition(to, None);
                if allowed.contains(&(from, to)) {
                    assert!(result.is_ok(), "{from} -> {to} should be allowed");
                } else {
                    assert!(
                        matches!(result, Err(GuardError::InvalidTransition { .. })),
                        "{from} -> {to} should be rejected"
                    );
                    assert_eq!(fx.controller.current_state(), from);
                }
            }
        }
    }

    #[tokio::test]
    async fn deploy_requires_stable_state() {
        let fx = fixture(fast_cfg());
        fx.metrics.set("error_rate", 0.01);
        fx.controller.force_state(DeploymentState::Monitoring);
        let err = fx
            .controller
            .deploy("v2", "registry/app:v2", BTreeMap::new())
            .await
            .unwrap_err();
        assert!(matches!(err, GuardError::Precondition(_)));
        assert_eq!(fx.controller.current_state(), DeploymentState::Monitoring);
    }

    #[tokio::test]
    async fn failed_switch_settles_back_to_stable() {
        let fx = fixture(fast_cfg());
        fx.metrics.set("error_rate", 0.01);
        fx.control
            .fail_bring_up
            .store(true, std::sync::atomic::Ordering::SeqCst);

        let err = fx
            .controller
            .deploy("v1", "registry/app:v1", BTreeMap::new())
            .await
            .unwrap_err();
        assert!(err.is_transient());
        assert_eq!(fx.controller.current_state(), DeploymentState::Stable);
        let status = fx.controller.status().unwrap();
        assert_eq!(status.current_version, None);
    }

    /// Scenario A: a sustained error-rate breach rolls the deployment back
    /// automatically and lands on the previous version.
    #[tokio::test]
    async fn sustained_breach_triggers_automatic_rollback() {
        let mut cfg = fast_cfg();
        // Generous window so slow CI scheduling can't close it before the
        // breach has been sustained.
        cfg.window = Duration::from_secs(1);
        let fx = fixture(cfg);
        fx.metrics.set("error_rate", 0.01);

        fx.controller
            .deploy("v1", "registry/app:v1", BTreeMap::new())
            .await
            .unwrap();
        wait_for_state(&fx, DeploymentState::Stable, Duration::from_secs(3)).await;

        fx.controller
            .deploy("v2", "registry/app:v2", BTreeMap::new())
            .await
            .unwrap();
        assert_eq!(fx.controller.current_state(), DeploymentState::Monitoring);

        // Inject a continuous breach well past the required duration.
        fx.metrics.set("error_rate", 0.08);
        wait_for_state(&fx, DeploymentState::RolledBack, Duration::from_secs(3)).await;

        let status = fx.controller.status().unwrap();
        assert_eq!(status.current_version, Some("v1".to_string()));
        assert_eq!(status.previous_version, None);
        assert_eq!(status.recent_events.len(), 1);
        assert_eq!(status.recent_events[0].reason, RollbackReason::HighErrorRate);
        // Whatever label serves traffic now must run the v1 artifact, and
        // the abandoned stack must be gone.
        let routed = fx.control.routed().unwrap();
        assert_eq!(
            fx.control.artifact_of(&routed).as_deref(),
            Some("registry/app:v1")
        );
        assert_eq!(fx.control.live_labels(), vec![routed]);
        assert_eq!(fx.cache.flushes.load(std::sync::atomic::Ordering::SeqCst), 1);
    }

    /// Scenario B: a breach that recovers before the required duration
    /// never rolls back; the window settles the deployment to stable.
    #[tokio::test]
    async fn transient_breach_recovers_without_rollback() {
        let mut cfg = fast_cfg();
        cfg.window = Duration::from_millis(300);
        // Far longer than the injected breach, so the evaluator can never
        // accumulate the required duration no matter how ticks land.
        cfg.thresholds[0].required = Duration::from_secs(10);
        let fx = fixture(cfg);
        fx.metrics.set("error_rate", 0.01);

        fx.controller
            .deploy("v1", "registry/app:v1", BTreeMap::new())
            .await
            .unwrap();
        wait_for_state(&fx, DeploymentState::Stable, Duration::from_secs(3)).await;
        fx.controller
            .deploy("v2", "registry/app:v2", BTreeMap::new())
            .await
            .unwrap();

        fx.metrics.set("error_rate", 0.08);
        tokio::time::sleep(Duration::from_millis(40)).await;
        fx.metrics.set("error_rate", 0.01);

        wait_for_state(&fx, DeploymentState::Stable, Duration::from_secs(3)).await;
        let status = fx.controller.status().unwrap();
        assert_eq!(status.current_version, Some("v2".to_string()));
        assert!(status.recent_events.is_empty());
        assert_eq!(fx.db.count_rollback_events().unwrap(), 0);
    }

    /// Scenario D: of two concurrent triggers exactly one rollback runs;
    /// the loser sees "already in progress" and no duplicate event exists.
    #[tokio::test]
    async fn concurrent_double_trigger_runs_one_rollback() {
        let fx = fixture(fast_cfg());
        fx.metrics.set("error_rate", 0.01);

        fx.controller
            .deploy("v1", "registry/app:v1", BTreeMap::new())
            .await
            .unwrap();
        wait_for_state(&fx, DeploymentState::Stable, Duration::from_secs(3)).await;
        fx.controller
            .deploy("v2", "registry/app:v2", BTreeMap::new())
            .await
            .unwrap();

        let (a, b) = tokio::join!(
            fx.controller.trigger_rollback(RollbackReason::ManualTrigger),
            fx.controller.trigger_rollback(RollbackReason::ManualTrigger),
        );
        let outcomes = [a, b];
        assert_eq!(outcomes.iter().filter(|r| r.is_ok()).count(), 1);
        assert!(
            outcomes
                .iter()
                .any(|r| matches!(r, Err(GuardError::RollbackInProgress)))
        );
        assert_eq!(fx.db.count_rollback_events().unwrap(), 1);
        assert_eq!(fx.controller.current_state(), DeploymentState::RolledBack);
    }

    #[tokio::test]
    async fn manual_trigger_outside_monitoring_is_rejected() {
        let fx = fixture(fast_cfg());
        let err = fx
            .controller
            .trigger_rollback(RollbackReason::ManualTrigger)
            .await
            .unwrap_err();
        assert!(matches!(err, GuardError::Precondition(_)));
        assert_eq!(fx.db.count_rollback_events().unwrap(), 0);
    }

    #[tokio::test]
    async fn failed_rollback_halts_in_rolling_back() {
        let fx = fixture(fast_cfg());
        fx.metrics.set("error_rate", 0.01);

        fx.controller
            .deploy("v1", "registry/app:v1", BTreeMap::new())
            .await
            .unwrap();
        wait_for_state(&fx, DeploymentState::Stable, Duration::from_secs(3)).await;
        fx.controller
            .deploy("v2", "registry/app:v2", BTreeMap::new())
            .await
            .unwrap();

        // The previous stack can never become ready again.
        fx.readiness.set_ready(false);
        let err = fx
            .controller
            .trigger_rollback(RollbackReason::ManualTrigger)
            .await
            .unwrap_err();
        assert!(err.is_transient());
        assert_eq!(fx.controller.current_state(), DeploymentState::RollingBack);
        let status = fx.controller.status().unwrap();
        assert!(status.rollback_in_progress);
        assert_eq!(fx.db.count_rollback_events().unwrap(), 0);

        // Automation stays halted: no deploys, no second trigger.
        let err = fx
            .controller
            .deploy("v3", "registry/app:v3", BTreeMap::new())
            .await
            .unwrap_err();
        assert!(matches!(err, GuardError::Precondition(_)));
        let err = fx
            .controller
            .trigger_rollback(RollbackReason::ManualTrigger)
            .await
            .unwrap_err();
        assert!(matches!(err, GuardError::RollbackInProgress));
    }

    #[tokio::test]
    async fn rollback_downgrades_schema_only_when_revisions_differ() {
        let fx = fixture(fast_cfg());
        fx.metrics.set("error_rate", 0.01);

        // v1 deploys at rev-1, then the schema moves to rev-2 with v2.
        fx.controller
            .deploy("v1", "registry/app:v1", BTreeMap::new())
            .await
            .unwrap();
        wait_for_state(&fx, DeploymentState::Stable, Duration::from_secs(3)).await;
        *fx.migration_tool.revision.lock().unwrap() = "rev-2".to_string();
        fx.controller
            .deploy("v2", "registry/app:v2", BTreeMap::new())
            .await
            .unwrap();

        fx.controller
            .trigger_rollback(RollbackReason::ManualTrigger)
            .await
            .unwrap();
        assert_eq!(
            *fx.migration_tool.downgrades.lock().unwrap(),
            vec!["rev-1".to_string()]
        );
    }

    #[tokio::test]
    async fn rollback_restores_backed_up_sessions() {
        let fx = fixture(fast_cfg());
        fx.metrics.set("error_rate", 0.01);

        let payload = BTreeMap::from([("step".to_string(), serde_json::json!("checkout"))]);
        let rec = fx.sessions.create_session("user-1", payload.clone()).await.unwrap();

        fx.controller
            .deploy("v1", "registry/app:v1", BTreeMap::new())
            .await
            .unwrap();
        wait_for_state(&fx, DeploymentState::Stable, Duration::from_secs(3)).await;
        fx.controller
            .deploy("v2", "registry/app:v2", BTreeMap::new())
            .await
            .unwrap();

        // The bad deploy mangles the live store.
        fx.store.wipe_prefix("session:");

        fx.controller
            .trigger_rollback(RollbackReason::HighErrorRate)
            .await
            .unwrap();
        let restored = fx.sessions.get_session(&rec.id).await.unwrap().unwrap();
        assert_eq!(restored.payload, payload);
    }

    #[tokio::test]
    async fn acknowledge_reopens_deploys_after_rollback() {
        let fx = fixture(fast_cfg());
        fx.metrics.set("error_rate", 0.01);

        fx.controller
            .deploy("v1", "registry/app:v1", BTreeMap::new())
            .await
            .unwrap();
        wait_for_state(&fx, DeploymentState::Stable, Duration::from_secs(3)).await;
        fx.controller
            .deploy("v2", "registry/app:v2", BTreeMap::new())
            .await
            .unwrap();
        fx.controller
            .trigger_rollback(RollbackReason::ManualTrigger)
            .await
            .unwrap();

        assert!(fx.controller.acknowledge_rollback().is_ok());
        assert_eq!(fx.controller.current_state(), DeploymentState::Stable);
        fx.controller
            .deploy("v3", "registry/app:v3", BTreeMap::new())
            .await
            .unwrap();
        assert_eq!(fx.controller.current_state(), DeploymentState::Monitoring);
        fx.controller.shutdown().await;
    }

    #[tokio::test]
    async fn consecutive_probe_failures_report_health_breach() {
        let fx = fixture(fast_cfg());
        fx.metrics.set("error_rate", 0.01);
        fx.controller
            .deploy("v1", "registry/app:v1", BTreeMap::new())
            .await
            .unwrap();
        fx.controller.shutdown().await;

        fx.readiness.set_ready(false);
        assert_eq!(fx.controller.evaluate_tick().await.unwrap(), None);
        assert_eq!(fx.controller.evaluate_tick().await.unwrap(), None);
        assert_eq!(
            fx.controller.evaluate_tick().await.unwrap(),
            Some(RollbackReason::HealthCheckFailed)
        );
    }

    #[tokio::test]
    async fn metrics_outage_is_not_a_breach() {
        let fx = fixture(fast_cfg());
        fx.metrics.set("error_rate", 0.01);
        fx.controller
            .deploy("v1", "registry/app:v1", BTreeMap::new())
            .await
            .unwrap();
        fx.controller.shutdown().await;

        fx.metrics
            .fail
            .store(true, std::sync::atomic::Ordering::SeqCst);
        // A failed snapshot surfaces as a tick error, not a rollback.
        assert!(fx.controller.evaluate_tick().await.is_err());
        assert_eq!(fx.controller.current_state(), DeploymentState::Monitoring);
    }

    #[tokio::test]
    async fn response_time_is_judged_against_the_baseline() {
        let mut cfg = fast_cfg();
        cfg.thresholds = vec![ThresholdSpec {
            metric: "response_time".to_string(),
            threshold: 2.0,
            required: Duration::from_millis(0),
        }];
        let fx = fixture(cfg);
        fx.metrics.set("response_time", 100.0);

        fx.controller
            .deploy("v1", "registry/app:v1", BTreeMap::new())
            .await
            .unwrap();
        fx.controller.shutdown().await;

        // 180ms against a 100ms baseline is a 1.8 ratio: no breach.
        fx.metrics.set("response_time", 180.0);
        assert_eq!(fx.controller.evaluate_tick().await.unwrap(), None);

        // 250ms is a 2.5 ratio: breach.
        fx.metrics.set("response_time", 250.0);
        assert_eq!(
            fx.controller.evaluate_tick().await.unwrap(),
            Some(RollbackReason::SlowResponse)
        );
    }
}

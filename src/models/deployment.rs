use std::collections::{BTreeMap, HashMap};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Lifecycle of a deployment as seen by the controller. Exactly one current
/// value per controller; transitions only along the edges in
/// [`DeploymentState::can_transition`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeploymentState {
    Stable,
    Deploying,
    Monitoring,
    RollbackTriggered,
    RollingBack,
    RolledBack,
}

impl DeploymentState {
    /// The modeled edges of the state machine. Anything not listed here is
    /// rejected by the controller, not silently ignored.
    pub fn can_transition(self, to: DeploymentState) -> bool {
        use DeploymentState::*;
        matches!(
            (self, to),
            (Stable, Deploying)
                | (Deploying, Monitoring)
                | (Deploying, Stable)
                | (Monitoring, Stable)
                | (Monitoring, RollbackTriggered)
                | (RollbackTriggered, RollingBack)
                | (RollingBack, RolledBack)
                | (RolledBack, Stable)
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            DeploymentState::Stable => "stable",
            DeploymentState::Deploying => "deploying",
            DeploymentState::Monitoring => "monitoring",
            DeploymentState::RollbackTriggered => "rollback_triggered",
            DeploymentState::RollingBack => "rolling_back",
            DeploymentState::RolledBack => "rolled_back",
        }
    }

    pub fn parse(s: &str) -> Option<DeploymentState> {
        Some(match s {
            "stable" => DeploymentState::Stable,
            "deploying" => DeploymentState::Deploying,
            "monitoring" => DeploymentState::Monitoring,
            "rollback_triggered" => DeploymentState::RollbackTriggered,
            "rolling_back" => DeploymentState::RollingBack,
            "rolled_back" => DeploymentState::RolledBack,
            _ => return None,
        })
    }

    pub fn all() -> [DeploymentState; 6] {
        [
            DeploymentState::Stable,
            DeploymentState::Deploying,
            DeploymentState::Monitoring,
            DeploymentState::RollbackTriggered,
            DeploymentState::RollingBack,
            DeploymentState::RolledBack,
        ]
    }
}

impl std::fmt::Display for DeploymentState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why a rollback was triggered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RollbackReason {
    HighErrorRate,
    SlowResponse,
    DbConnectionFailure,
    AuthSpike,
    CostExceeded,
    ManualTrigger,
    HealthCheckFailed,
}

impl RollbackReason {
    pub fn as_str(self) -> &'static str {
        match self {
            RollbackReason::HighErrorRate => "high_error_rate",
            RollbackReason::SlowResponse => "slow_response",
            RollbackReason::DbConnectionFailure => "db_connection_failure",
            RollbackReason::AuthSpike => "auth_spike",
            RollbackReason::CostExceeded => "cost_exceeded",
            RollbackReason::ManualTrigger => "manual_trigger",
            RollbackReason::HealthCheckFailed => "health_check_failed",
        }
    }

    pub fn parse(s: &str) -> Option<RollbackReason> {
        Some(match s {
            "high_error_rate" => RollbackReason::HighErrorRate,
            "slow_response" => RollbackReason::SlowResponse,
            "db_connection_failure" => RollbackReason::DbConnectionFailure,
            "auth_spike" => RollbackReason::AuthSpike,
            "cost_exceeded" => RollbackReason::CostExceeded,
            "manual_trigger" => RollbackReason::ManualTrigger,
            "health_check_failed" => RollbackReason::HealthCheckFailed,
            _ => return None,
        })
    }

    /// Reason attached to a breach of the named monitored metric.
    pub fn for_metric(name: &str) -> RollbackReason {
        match name {
            "response_time" => RollbackReason::SlowResponse,
            "connection_utilization" => RollbackReason::DbConnectionFailure,
            "auth_failure_rate" => RollbackReason::AuthSpike,
            "spend_rate" => RollbackReason::CostExceeded,
            _ => RollbackReason::HighErrorRate,
        }
    }
}

impl std::fmt::Display for RollbackReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Immutable record of one deployed version. The controller retains at most
/// current + previous; previous is discarded once a rollback completes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeploymentVersion {
    pub id: String,
    pub deployed_at: DateTime<Utc>,
    pub artifact_ref: String,
    /// Opaque config snapshot supplied with the deploy request.
    pub config_snapshot: BTreeMap<String, serde_json::Value>,
    /// Per-metric values captured at deploy time. The response-time
    /// threshold is evaluated as a ratio against this baseline.
    pub metrics_baseline: HashMap<String, f64>,
    /// Schema revision the database was at when this version went live.
    pub schema_revision: String,
}

/// Append-only record of one completed (or attempted) rollback.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RollbackEvent {
    pub id: String,
    pub triggered_at: DateTime<Utc>,
    pub reason: RollbackReason,
    pub from_version: String,
    pub to_version: String,
    pub duration_ms: u64,
}

/// Read-only view served by `RollbackController::status`.
#[derive(Debug, Clone, Serialize)]
pub struct StatusReport {
    pub state: DeploymentState,
    pub current_version: Option<String>,
    pub previous_version: Option<String>,
    pub rollback_in_progress: bool,
    pub recent_events: Vec<RollbackEvent>,
    pub live_threshold_values: Vec<crate::threshold::ThresholdSnapshot>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn state_round_trips_through_text() {
        for state in DeploymentState::all() {
            assert_eq!(DeploymentState::parse(state.as_str()), Some(state));
        }
        assert_eq!(DeploymentState::parse("nope"), None);
    }

    #[test]
    fn reason_maps_from_metric_name() {
        assert_eq!(
            RollbackReason::for_metric("error_rate"),
            RollbackReason::HighErrorRate
        );
        assert_eq!(
            RollbackReason::for_metric("response_time"),
            RollbackReason::SlowResponse
        );
        assert_eq!(
            RollbackReason::for_metric("spend_rate"),
            RollbackReason::CostExceeded
        );
    }

    #[test]
    fn rolled_back_only_returns_to_stable() {
        use DeploymentState::*;
        for to in DeploymentState::all() {
            assert_eq!(RolledBack.can_transition(to), to == Stable);
        }
    }
}

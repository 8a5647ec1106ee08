use std::path::Path;
use std::time::Duration;

use serde::Deserialize;

use crate::alert::ChannelConfig;
use crate::probe::ProbeConfig;
use crate::sessions::SessionConfig;
use crate::switcher::{SwitcherConfig, Topology};

/// Top-level config loaded from `guard.toml`.
#[derive(Debug, Clone, Deserialize, Default)]
pub struct GuardConfig {
    #[serde(default)]
    pub service: ServiceConfig,
    #[serde(default)]
    pub monitor: MonitorConfig,
    #[serde(default = "default_thresholds")]
    pub thresholds: Vec<ThresholdRule>,
    #[serde(default)]
    pub switcher: SwitcherFileConfig,
    #[serde(default)]
    pub sessions: SessionsFileConfig,
    #[serde(default)]
    pub control_plane: EndpointConfig,
    #[serde(default)]
    pub migration: MigrationEndpointConfig,
    #[serde(default)]
    pub metrics: MetricsConfig,
    #[serde(default)]
    pub cache: CacheConfig,
    #[serde(default)]
    pub alerts: AlertsConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServiceConfig {
    /// Base URL of the protected service.
    #[serde(default = "default_service_url")]
    pub base_url: String,
    #[serde(default = "default_readiness_path")]
    pub readiness_path: String,
    #[serde(default = "default_5")]
    pub probe_timeout_secs: u64,
    #[serde(default = "default_probe_attempts")]
    pub probe_attempts: u32,
    #[serde(default = "default_3")]
    pub breaker_failure_threshold: u32,
    #[serde(default = "default_30")]
    pub breaker_cooldown_secs: u64,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            base_url: default_service_url(),
            readiness_path: default_readiness_path(),
            probe_timeout_secs: default_5(),
            probe_attempts: default_probe_attempts(),
            breaker_failure_threshold: default_3(),
            breaker_cooldown_secs: default_30(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct MonitorConfig {
    /// Polling interval for the monitoring loop.
    #[serde(default = "default_10")]
    pub interval_secs: u64,
    /// Monitoring window; with no breach the deployment settles to stable.
    #[serde(default = "default_300")]
    pub window_secs: u64,
    /// Consecutive failed liveness probes before a health-check rollback.
    #[serde(default = "default_3")]
    pub health_fail_limit: u32,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            interval_secs: default_10(),
            window_secs: default_300(),
            health_fail_limit: default_3(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ThresholdRule {
    pub metric: String,
    pub threshold: f64,
    pub required_secs: u64,
}

fn default_thresholds() -> Vec<ThresholdRule> {
    vec![
        ThresholdRule {
            metric: "error_rate".to_string(),
            threshold: 0.05,
            required_secs: 60,
        },
        ThresholdRule {
            // Evaluated as a ratio against the deploy-time baseline.
            metric: "response_time".to_string(),
            threshold: 2.0,
            required_secs: 120,
        },
        ThresholdRule {
            metric: "connection_utilization".to_string(),
            threshold: 0.9,
            required_secs: 60,
        },
        ThresholdRule {
            metric: "auth_failure_rate".to_string(),
            threshold: 0.1,
            required_secs: 60,
        },
        ThresholdRule {
            metric: "spend_rate".to_string(),
            threshold: 1.5,
            required_secs: 300,
        },
    ]
}

#[derive(Debug, Clone, Deserialize)]
pub struct SwitcherFileConfig {
    #[serde(default = "default_topology")]
    pub topology: Topology,
    #[serde(default = "default_500")]
    pub ready_backoff_base_ms: u64,
    #[serde(default = "default_8000")]
    pub ready_backoff_cap_ms: u64,
    #[serde(default = "default_60000")]
    pub ready_budget_ms: u64,
    #[serde(default = "default_3")]
    pub control_attempts: u32,
}

impl Default for SwitcherFileConfig {
    fn default() -> Self {
        Self {
            topology: default_topology(),
            ready_backoff_base_ms: default_500(),
            ready_backoff_cap_ms: default_8000(),
            ready_budget_ms: default_60000(),
            control_attempts: default_3(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct SessionsFileConfig {
    #[serde(default = "default_3600")]
    pub live_ttl_secs: u64,
    #[serde(default = "default_86400")]
    pub backup_ttl_secs: u64,
    #[serde(default = "default_32")]
    pub concurrency: usize,
}

impl Default for SessionsFileConfig {
    fn default() -> Self {
        Self {
            live_ttl_secs: default_3600(),
            backup_ttl_secs: default_86400(),
            concurrency: default_32(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct EndpointConfig {
    #[serde(default = "default_control_plane_url")]
    pub base_url: String,
    #[serde(default = "default_10")]
    pub timeout_secs: u64,
}

impl Default for EndpointConfig {
    fn default() -> Self {
        Self {
            base_url: default_control_plane_url(),
            timeout_secs: default_10(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct MigrationEndpointConfig {
    #[serde(default = "default_migration_url")]
    pub base_url: String,
    #[serde(default = "default_30")]
    pub timeout_secs: u64,
}

impl Default for MigrationEndpointConfig {
    fn default() -> Self {
        Self {
            base_url: default_migration_url(),
            timeout_secs: default_30(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct MetricsConfig {
    #[serde(default = "default_metrics_url")]
    pub url: String,
    #[serde(default = "default_5")]
    pub timeout_secs: u64,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            url: default_metrics_url(),
            timeout_secs: default_5(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct CacheConfig {
    #[serde(default = "default_cache_url")]
    pub flush_url: String,
    #[serde(default = "default_5")]
    pub timeout_secs: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            flush_url: default_cache_url(),
            timeout_secs: default_5(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct AlertsConfig {
    #[serde(default)]
    pub channels: Vec<ChannelConfig>,
}

fn default_service_url() -> String {
    "http://localhost:8081".to_string()
}

fn default_readiness_path() -> String {
    "/healthz".to_string()
}

fn default_control_plane_url() -> String {
    "http://localhost:9000".to_string()
}

fn default_migration_url() -> String {
    "http://localhost:9100".to_string()
}

fn default_metrics_url() -> String {
    "http://localhost:9090/snapshot".to_string()
}

fn default_cache_url() -> String {
    "http://localhost:9200/flush".to_string()
}

fn default_topology() -> Topology {
    Topology::DualStack
}

fn default_probe_attempts() -> u32 {
    5
}

fn default_3() -> u32 {
    3
}

fn default_5() -> u64 {
    5
}

fn default_10() -> u64 {
    10
}

fn default_30() -> u64 {
    30
}

fn default_300() -> u64 {
    300
}

fn default_500() -> u64 {
    500
}

fn default_3600() -> u64 {
    3600
}

fn default_8000() -> u64 {
    8000
}

fn default_32() -> usize {
    32
}

fn default_60000() -> u64 {
    60000
}

fn default_86400() -> u64 {
    86400
}

impl GuardConfig {
    /// Load config from a TOML file. Returns defaults if the file doesn't exist.
    pub fn load(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        if !path.exists() {
            tracing::info!("config file not found at {}, using defaults", path.display());
            return Ok(Self::default());
        }
        let contents = std::fs::read_to_string(path)?;
        let config: GuardConfig = toml::from_str(&contents)?;
        tracing::info!("loaded config from {}", path.display());
        Ok(config)
    }

    pub fn probe_config(&self) -> ProbeConfig {
        ProbeConfig {
            max_attempts: self.service.probe_attempts,
            backoff_base: Duration::from_millis(500),
            backoff_cap: Duration::from_secs(8),
            breaker_failure_threshold: self.service.breaker_failure_threshold,
            breaker_cooldown: Duration::from_secs(self.service.breaker_cooldown_secs),
        }
    }

    pub fn switcher_config(&self) -> SwitcherConfig {
        SwitcherConfig {
            topology: self.switcher.topology,
            ready_backoff_base: Duration::from_millis(self.switcher.ready_backoff_base_ms),
            ready_backoff_cap: Duration::from_millis(self.switcher.ready_backoff_cap_ms),
            ready_budget: Duration::from_millis(self.switcher.ready_budget_ms),
            control_attempts: self.switcher.control_attempts,
            control_backoff_base: Duration::from_millis(500),
            control_backoff_cap: Duration::from_secs(4),
        }
    }

    pub fn session_config(&self) -> SessionConfig {
        SessionConfig {
            live_ttl: Duration::from_secs(self.sessions.live_ttl_secs),
            backup_ttl: Duration::from_secs(self.sessions.backup_ttl_secs),
            concurrency: self.sessions.concurrency,
        }
    }

    pub fn controller_config(&self) -> crate::controller::ControllerConfig {
        crate::controller::ControllerConfig {
            interval: Duration::from_secs(self.monitor.interval_secs),
            window: Duration::from_secs(self.monitor.window_secs),
            health_fail_limit: self.monitor.health_fail_limit,
            thresholds: self
                .thresholds
                .iter()
                .map(|rule| crate::controller::ThresholdSpec {
                    metric: rule.metric.clone(),
                    threshold: rule.threshold,
                    required: Duration::from_secs(rule.required_secs),
                })
                .collect(),
        }
    }
}

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;

use crate::error::{GuardError, GuardResult};

/// Supplies the flat name -> value map consumed once per monitoring tick.
/// The loop is agnostic to how the snapshot is produced.
#[async_trait]
pub trait MetricsSnapshotProvider: Send + Sync {
    async fn snapshot(&self) -> GuardResult<HashMap<String, f64>>;
}

/// Lifecycle control plane: three idempotent-on-retry operations treated as
/// black boxes. Provisioning topology lives in the switcher, not here.
#[async_trait]
pub trait ControlPlane: Send + Sync {
    async fn bring_up(&self, artifact_ref: &str, labels: &[String]) -> GuardResult<()>;
    async fn redirect_traffic(&self, target_label: &str) -> GuardResult<()>;
    async fn tear_down(&self, labels: &[String]) -> GuardResult<()>;
}

/// External schema migration tool. Synchronous semantics, hard-timeout
/// bounded by the adapter.
#[async_trait]
pub trait MigrationTool: Send + Sync {
    async fn current_revision(&self) -> GuardResult<String>;
    async fn downgrade(&self, target_revision: &str) -> GuardResult<()>;
}

/// Durable key-value store backing live session records and versioned
/// backups.
#[async_trait]
pub trait SessionStore: Send + Sync {
    async fn get(&self, key: &str) -> GuardResult<Option<Vec<u8>>>;
    async fn set(&self, key: &str, value: Vec<u8>, ttl: Duration) -> GuardResult<()>;
    async fn keys_by_prefix(&self, prefix: &str) -> GuardResult<Vec<String>>;
    async fn delete(&self, key: &str) -> GuardResult<()>;
}

/// One flush per rollback so the reverted version never serves stale reads.
#[async_trait]
pub trait CacheInvalidator: Send + Sync {
    async fn flush_all(&self) -> GuardResult<()>;
}

/// Readiness signal for the protected service: 200 = ready, anything else
/// or a timeout = not ready.
#[async_trait]
pub trait ReadinessCheck: Send + Sync {
    async fn check_ready(&self) -> bool;
}

// ── HTTP adapters ──

fn classify_status(what: &str, status: reqwest::StatusCode) -> GuardError {
    if status.is_server_error() {
        GuardError::Transient(format!("{what}: upstream returned {status}"))
    } else {
        GuardError::ControlPlane(format!("{what}: upstream returned {status}"))
    }
}

fn classify_send(what: &str, e: reqwest::Error) -> GuardError {
    // Timeouts and connection failures are retryable; anything the server
    // actually rejected is not.
    GuardError::Transient(format!("{what}: {e}"))
}

pub struct HttpMetricsProvider {
    client: reqwest::Client,
    url: String,
    timeout: Duration,
}

impl HttpMetricsProvider {
    pub fn new(client: reqwest::Client, url: String, timeout: Duration) -> Self {
        Self {
            client,
            url,
            timeout,
        }
    }
}

#[async_trait]
impl MetricsSnapshotProvider for HttpMetricsProvider {
    async fn snapshot(&self) -> GuardResult<HashMap<String, f64>> {
        let resp = self
            .client
            .get(&self.url)
            .timeout(self.timeout)
            .send()
            .await
            .map_err(|e| classify_send("metrics snapshot", e))?;
        if !resp.status().is_success() {
            return Err(classify_status("metrics snapshot", resp.status()));
        }
        let raw: serde_json::Value = resp
            .json()
            .await
            .map_err(|e| GuardError::Transient(format!("metrics snapshot: bad body: {e}")))?;
        let map = raw
            .as_object()
            .ok_or_else(|| GuardError::Transient("metrics snapshot: not an object".into()))?
            .iter()
            .filter_map(|(k, v)| v.as_f64().map(|f| (k.clone(), f)))
            .collect();
        Ok(map)
    }
}

pub struct HttpControlPlane {
    client: reqwest::Client,
    base_url: String,
    timeout: Duration,
}

impl HttpControlPlane {
    pub fn new(client: reqwest::Client, base_url: String, timeout: Duration) -> Self {
        Self {
            client,
            base_url,
            timeout,
        }
    }

    async fn post(&self, path: &str, body: serde_json::Value) -> GuardResult<()> {
        let url = format!("{}{path}", self.base_url);
        let resp = self
            .client
            .post(&url)
            .timeout(self.timeout)
            .json(&body)
            .send()
            .await
            .map_err(|e| classify_send("control plane", e))?;
        if !resp.status().is_success() {
            return Err(classify_status("control plane", resp.status()));
        }
        Ok(())
    }
}

#[async_trait]
impl ControlPlane for HttpControlPlane {
    async fn bring_up(&self, artifact_ref: &str, labels: &[String]) -> GuardResult<()> {
        self.post(
            "/instances/up",
            serde_json::json!({ "artifact_ref": artifact_ref, "labels": labels }),
        )
        .await
    }

    async fn redirect_traffic(&self, target_label: &str) -> GuardResult<()> {
        self.post(
            "/traffic/redirect",
            serde_json::json!({ "target": target_label }),
        )
        .await
    }

    async fn tear_down(&self, labels: &[String]) -> GuardResult<()> {
        self.post("/instances/down", serde_json::json!({ "labels": labels }))
            .await
    }
}

pub struct HttpMigrationTool {
    client: reqwest::Client,
    base_url: String,
    timeout: Duration,
}

impl HttpMigrationTool {
    pub fn new(client: reqwest::Client, base_url: String, timeout: Duration) -> Self {
        Self {
            client,
            base_url,
            timeout,
        }
    }
}

#[async_trait]
impl MigrationTool for HttpMigrationTool {
    async fn current_revision(&self) -> GuardResult<String> {
        let url = format!("{}/revision", self.base_url);
        let resp = self
            .client
            .get(&url)
            .timeout(self.timeout)
            .send()
            .await
            .map_err(|e| classify_send("migration tool", e))?;
        if !resp.status().is_success() {
            return Err(GuardError::Migration(format!(
                "revision lookup returned {}",
                resp.status()
            )));
        }
        let body: serde_json::Value = resp
            .json()
            .await
            .map_err(|e| GuardError::Migration(format!("bad revision body: {e}")))?;
        body.get("revision")
            .and_then(|r| r.as_str())
            .map(str::to_string)
            .ok_or_else(|| GuardError::Migration("revision field missing".into()))
    }

    async fn downgrade(&self, target_revision: &str) -> GuardResult<()> {
        let url = format!("{}/downgrade", self.base_url);
        let resp = self
            .client
            .post(&url)
            .timeout(self.timeout)
            .json(&serde_json::json!({ "target": target_revision }))
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    // The downgrade may or may not have run; never assume
                    // success and never blindly re-run it.
                    GuardError::Ambiguous(format!(
                        "downgrade to {target_revision} timed out, outcome unknown"
                    ))
                } else {
                    classify_send("migration tool", e)
                }
            })?;
        if resp.status().is_server_error() {
            return Err(GuardError::Transient(format!(
                "downgrade returned {}",
                resp.status()
            )));
        }
        if !resp.status().is_success() {
            return Err(GuardError::Migration(format!(
                "downgrade returned {}",
                resp.status()
            )));
        }
        Ok(())
    }
}

pub struct HttpCacheInvalidator {
    client: reqwest::Client,
    flush_url: String,
    timeout: Duration,
}

impl HttpCacheInvalidator {
    pub fn new(client: reqwest::Client, flush_url: String, timeout: Duration) -> Self {
        Self {
            client,
            flush_url,
            timeout,
        }
    }
}

#[async_trait]
impl CacheInvalidator for HttpCacheInvalidator {
    async fn flush_all(&self) -> GuardResult<()> {
        let resp = self
            .client
            .post(&self.flush_url)
            .timeout(self.timeout)
            .send()
            .await
            .map_err(|e| classify_send("cache flush", e))?;
        if !resp.status().is_success() {
            return Err(classify_status("cache flush", resp.status()));
        }
        Ok(())
    }
}

pub struct HttpReadinessCheck {
    client: reqwest::Client,
    url: String,
    timeout: Duration,
}

impl HttpReadinessCheck {
    pub fn new(client: reqwest::Client, base_url: &str, path: &str, timeout: Duration) -> Self {
        Self {
            client,
            url: format!("{base_url}{path}"),
            timeout,
        }
    }
}

#[async_trait]
impl ReadinessCheck for HttpReadinessCheck {
    async fn check_ready(&self) -> bool {
        match self
            .client
            .get(&self.url)
            .timeout(self.timeout)
            .send()
            .await
        {
            Ok(resp) => resp.status() == reqwest::StatusCode::OK,
            Err(e) => {
                tracing::debug!("readiness check failed: {e}");
                false
            }
        }
    }
}

// ── Test fakes ──

#[cfg(test)]
pub mod fakes {
    use super::*;
    use std::collections::HashSet;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

    #[derive(Default)]
    pub struct FakeMetrics {
        values: Mutex<HashMap<String, f64>>,
        pub fail: AtomicBool,
    }

    impl FakeMetrics {
        pub fn set(&self, name: &str, value: f64) {
            self.values.lock().unwrap().insert(name.to_string(), value);
        }
    }

    #[async_trait]
    impl MetricsSnapshotProvider for FakeMetrics {
        async fn snapshot(&self) -> GuardResult<HashMap<String, f64>> {
            if self.fail.load(Ordering::SeqCst) {
                return Err(GuardError::Transient("metrics down".into()));
            }
            Ok(self.values.lock().unwrap().clone())
        }
    }

    /// Scriptable control plane: tracks which label sets hold instances,
    /// which artifact each runs, and where traffic is routed.
    #[derive(Default)]
    pub struct FakeControlPlane {
        pub up: Mutex<HashSet<String>>,
        pub artifacts: Mutex<HashMap<String, String>>,
        pub routed_to: Mutex<Option<String>>,
        pub fail_bring_up: AtomicBool,
        pub fail_redirect: AtomicBool,
    }

    impl FakeControlPlane {
        pub fn routed(&self) -> Option<String> {
            self.routed_to.lock().unwrap().clone()
        }

        pub fn live_labels(&self) -> Vec<String> {
            let mut v: Vec<String> = self.up.lock().unwrap().iter().cloned().collect();
            v.sort();
            v
        }

        pub fn artifact_of(&self, label: &str) -> Option<String> {
            self.artifacts.lock().unwrap().get(label).cloned()
        }
    }

    #[async_trait]
    impl ControlPlane for FakeControlPlane {
        async fn bring_up(&self, artifact_ref: &str, labels: &[String]) -> GuardResult<()> {
            if self.fail_bring_up.load(Ordering::SeqCst) {
                return Err(GuardError::Transient("bring_up refused".into()));
            }
            let mut up = self.up.lock().unwrap();
            let mut artifacts = self.artifacts.lock().unwrap();
            for label in labels {
                up.insert(label.clone());
                artifacts.insert(label.clone(), artifact_ref.to_string());
            }
            Ok(())
        }

        async fn redirect_traffic(&self, target_label: &str) -> GuardResult<()> {
            if self.fail_redirect.load(Ordering::SeqCst) {
                return Err(GuardError::Transient("redirect refused".into()));
            }
            *self.routed_to.lock().unwrap() = Some(target_label.to_string());
            Ok(())
        }

        async fn tear_down(&self, labels: &[String]) -> GuardResult<()> {
            let mut up = self.up.lock().unwrap();
            let mut artifacts = self.artifacts.lock().unwrap();
            for label in labels {
                up.remove(label);
                artifacts.remove(label);
            }
            Ok(())
        }
    }

    #[derive(Default)]
    pub struct FakeMigrationTool {
        pub revision: Mutex<String>,
        pub downgrades: Mutex<Vec<String>>,
        pub fail_downgrade: AtomicBool,
    }

    impl FakeMigrationTool {
        pub fn at(revision: &str) -> Self {
            Self {
                revision: Mutex::new(revision.to_string()),
                ..Default::default()
            }
        }
    }

    #[async_trait]
    impl MigrationTool for FakeMigrationTool {
        async fn current_revision(&self) -> GuardResult<String> {
            Ok(self.revision.lock().unwrap().clone())
        }

        async fn downgrade(&self, target_revision: &str) -> GuardResult<()> {
            if self.fail_downgrade.load(Ordering::SeqCst) {
                return Err(GuardError::Transient("migration tool down".into()));
            }
            self.downgrades
                .lock()
                .unwrap()
                .push(target_revision.to_string());
            *self.revision.lock().unwrap() = target_revision.to_string();
            Ok(())
        }
    }

    #[derive(Default)]
    pub struct FakeCache {
        pub flushes: AtomicU32,
    }

    #[async_trait]
    impl CacheInvalidator for FakeCache {
        async fn flush_all(&self) -> GuardResult<()> {
            self.flushes.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    pub struct FakeReadiness {
        pub ready: AtomicBool,
    }

    impl Default for FakeReadiness {
        fn default() -> Self {
            Self {
                ready: AtomicBool::new(true),
            }
        }
    }

    impl FakeReadiness {
        pub fn set_ready(&self, ready: bool) {
            self.ready.store(ready, Ordering::SeqCst);
        }
    }

    #[async_trait]
    impl ReadinessCheck for FakeReadiness {
        async fn check_ready(&self) -> bool {
            self.ready.load(Ordering::SeqCst)
        }
    }
}

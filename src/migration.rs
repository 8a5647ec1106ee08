use std::sync::Arc;
use std::time::Duration;

use crate::error::GuardResult;
use crate::ports::MigrationTool;
use crate::retry;

/// Tracks and reverses database schema revisions tied to a deployment.
/// The comparison target is the revision recorded on the previous
/// deployment at the time it went live.
pub struct SchemaMigrationCoordinator {
    tool: Arc<dyn MigrationTool>,
    attempts: u32,
    backoff_base: Duration,
    backoff_cap: Duration,
}

impl SchemaMigrationCoordinator {
    pub fn new(tool: Arc<dyn MigrationTool>) -> Self {
        Self {
            tool,
            attempts: 3,
            backoff_base: Duration::from_millis(500),
            backoff_cap: Duration::from_secs(4),
        }
    }

    #[cfg(test)]
    fn with_backoff(mut self, attempts: u32, base: Duration, cap: Duration) -> Self {
        self.attempts = attempts;
        self.backoff_base = base;
        self.backoff_cap = cap;
        self
    }

    pub async fn current_version(&self) -> GuardResult<String> {
        self.tool.current_revision().await
    }

    /// Downgrade only when the live revision differs from the target;
    /// deploys with no schema change cost zero database action on rollback.
    /// Returns whether a downgrade actually ran.
    pub async fn downgrade_if_needed(&self, target_revision: &str) -> GuardResult<bool> {
        let current = self.tool.current_revision().await?;
        if current == target_revision {
            tracing::info!("schema at {current}, no downgrade needed");
            return Ok(false);
        }
        tracing::info!("schema downgrade: {current} -> {target_revision}");
        retry::bounded(
            "schema downgrade",
            self.attempts,
            self.backoff_base,
            self.backoff_cap,
            || self.tool.downgrade(target_revision),
        )
        .await?;
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ports::fakes::FakeMigrationTool;

    fn coordinator(tool: Arc<FakeMigrationTool>) -> SchemaMigrationCoordinator {
        SchemaMigrationCoordinator::new(tool).with_backoff(
            2,
            Duration::from_millis(1),
            Duration::from_millis(2),
        )
    }

    #[tokio::test]
    async fn unchanged_revision_takes_no_action() {
        let tool = Arc::new(FakeMigrationTool::at("rev-7"));
        let coord = coordinator(tool.clone());
        assert!(!coord.downgrade_if_needed("rev-7").await.unwrap());
        assert!(tool.downgrades.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn differing_revision_downgrades_to_target() {
        let tool = Arc::new(FakeMigrationTool::at("rev-8"));
        let coord = coordinator(tool.clone());
        assert!(coord.downgrade_if_needed("rev-7").await.unwrap());
        assert_eq!(*tool.downgrades.lock().unwrap(), vec!["rev-7".to_string()]);
        assert_eq!(coord.current_version().await.unwrap(), "rev-7");
    }

    #[tokio::test]
    async fn exhausted_retries_surface_the_failure() {
        let tool = Arc::new(FakeMigrationTool::at("rev-8"));
        tool.fail_downgrade
            .store(true, std::sync::atomic::Ordering::SeqCst);
        let coord = coordinator(tool.clone());
        assert!(coord.downgrade_if_needed("rev-7").await.is_err());
    }
}

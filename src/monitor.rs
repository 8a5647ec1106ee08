use std::sync::Arc;
use std::time::Instant;

use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::controller::RollbackController;

/// One supervised monitoring task per active deployment. Polls the metrics
/// snapshot through the controller's evaluators at a fixed interval for up
/// to the configured window, then settles the deployment back to stable.
/// Cancellation is cooperative: the watch signal is honored at the next
/// poll boundary, never mid external call.
pub(crate) fn spawn(
    controller: Arc<RollbackController>,
    mut cancel: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let interval = controller.monitor_interval();
        let window = controller.monitor_window();
        let started = Instant::now();
        tracing::info!("monitor: started (interval={interval:?}, window={window:?})");

        let mut ticker = tokio::time::interval(interval);
        // The first tick completes immediately; consume it so evaluation
        // starts one full interval after cutover.
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = cancel.changed() => {
                    tracing::info!("monitor: cancelled");
                    return;
                }
            }
            if *cancel.borrow() {
                tracing::info!("monitor: cancelled");
                return;
            }
            if started.elapsed() >= window {
                controller.finish_monitoring();
                return;
            }
            match controller.evaluate_tick().await {
                Ok(None) => {}
                Ok(Some(reason)) => {
                    tracing::warn!("monitor: sustained breach ({reason}), triggering rollback");
                    if let Err(e) = controller.rollback_from_monitor(reason).await {
                        tracing::error!("monitor: automatic rollback failed: {e}");
                    }
                    return;
                }
                Err(e) => {
                    // A failed snapshot is not a breach; the next tick
                    // retries.
                    tracing::warn!("monitor: tick failed: {e}");
                }
            }
        }
    })
}

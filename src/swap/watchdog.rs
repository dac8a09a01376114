use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use tokio::task::JoinHandle;

/// A periodic pass that re-derives swap or vault state from external truth.
#[async_trait]
pub trait Reconciler: Send + Sync + 'static {
    fn name(&self) -> &'static str;

    async fn reconcile(&self) -> Result<()>;
}

/// Runs `reconciler` immediately, then every `interval`. Failed passes are
/// logged and retried on the next tick.
pub fn spawn_watchdog(reconciler: Arc<dyn Reconciler>, interval: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            if let Err(err) = reconciler.reconcile().await {
                tracing::warn!(
                    watchdog = reconciler.name(),
                    error = %format!("{err:#}"),
                    "watchdog pass failed"
                );
            }
            tokio::time::sleep(interval).await;
        }
    })
}

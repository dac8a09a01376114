use std::future::Future;
use std::pin::Pin;

use anyhow::{Context as _, Result};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

type Job = Pin<Box<dyn Future<Output = ()> + Send>>;

/// Runs Bitcoin payouts strictly one after another, so two payouts never
/// select the same wallet inputs. A job runs to completion even if the
/// caller that enqueued it has gone away.
#[derive(Clone)]
pub struct PayoutQueue {
    tx: mpsc::UnboundedSender<Job>,
}

impl PayoutQueue {
    pub fn spawn() -> (Self, JoinHandle<()>) {
        let (tx, mut rx) = mpsc::unbounded_channel::<Job>();
        let worker = tokio::spawn(async move {
            while let Some(job) = rx.recv().await {
                job.await;
            }
            tracing::debug!("payout queue closed");
        });
        (Self { tx }, worker)
    }

    pub async fn run<T, F>(&self, fut: F) -> Result<T>
    where
        T: Send + 'static,
        F: Future<Output = T> + Send + 'static,
    {
        let (done_tx, done_rx) = oneshot::channel();
        let job: Job = Box::pin(async move {
            let out = fut.await;
            let _ = done_tx.send(out);
        });
        self.tx
            .send(job)
            .map_err(|_| anyhow::anyhow!("payout queue is closed"))?;
        done_rx.await.context("payout job dropped")
    }
}

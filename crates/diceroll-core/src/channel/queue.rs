//! Strictly ordered task queue
//!
//! Jobs run one at a time in submission order on a dedicated tokio task. A
//! job that suspends (on the blocking pool, a timer, the network) holds the
//! queue until it completes, so later jobs can never overtake it.

use crate::{Error, Result};
use futures_util::future::BoxFuture;
use std::future::Future;
use tokio::sync::mpsc;
use tracing::debug;

type Job = BoxFuture<'static, ()>;

/// Handle for submitting jobs to an ordered queue
#[derive(Clone)]
pub struct SerialQueue {
    name: &'static str,
    tx: mpsc::UnboundedSender<Job>,
}

impl SerialQueue {
    /// Spawn the worker task. Must be called inside a tokio runtime.
    pub fn spawn(name: &'static str) -> Self {
        let (tx, mut rx) = mpsc::unbounded_channel::<Job>();
        tokio::spawn(async move {
            while let Some(job) = rx.recv().await {
                job.await;
            }
            debug!(queue = name, "queue closed");
        });
        Self { name, tx }
    }

    /// Append a job
    pub fn push<F>(&self, job: F) -> Result<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        self.tx
            .send(Box::pin(job))
            .map_err(|_| Error::Relay(format!("{} queue closed", self.name)))
    }

    /// Wait until every job submitted so far has finished
    pub async fn flush(&self) -> Result<()> {
        let (done, wait) = tokio::sync::oneshot::channel();
        self.push(async move {
            let _ = done.send(());
        })?;
        wait.await
            .map_err(|_| Error::Relay(format!("{} queue dropped a job", self.name)))
    }
}

use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::FutureExt;
use log::{error, info, warn};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::db::{FailOutcome, QueueStore};
use crate::error::{Error, Result};
use crate::models::CanonicalEvent;

/// Business logic run for every job attempt.
///
/// Delivery is at-least-once, so implementations must be idempotent. An `Err`
/// or a panic counts as a failed attempt.
#[async_trait]
pub trait JobHandler: Send + Sync {
    async fn handle(&self, event: &CanonicalEvent) -> anyhow::Result<()>;
}

/// Logs the event and succeeds.
pub struct LogHandler;

#[async_trait]
impl JobHandler for LogHandler {
    async fn handle(&self, event: &CanonicalEvent) -> anyhow::Result<()> {
        info!("[worker] processing event: {}.", serde_json::to_string(event)?);
        Ok(())
    }
}

#[derive(Debug, Clone, Copy)]
pub struct WorkerConfig {
    /// Sleep between polls when the queue has nothing runnable.
    pub poll_interval: Duration,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(500),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobOutcome {
    Succeeded,
    Retrying { attempts: u32, retry_in: Duration },
    Failed { attempts: u32 },
}

pub struct Worker {
    name: String,
    store: Arc<dyn QueueStore>,
    handler: Arc<dyn JobHandler>,
    config: WorkerConfig,
}

impl Worker {
    pub fn new(
        name: impl Into<String>,
        store: Arc<dyn QueueStore>,
        handler: Arc<dyn JobHandler>,
        config: WorkerConfig,
    ) -> Self {
        Self {
            name: name.into(),
            store,
            handler,
            config,
        }
    }

    /// Lease and process at most one job. `None` when nothing is runnable.
    pub async fn run_once(&self) -> Result<Option<(String, JobOutcome)>> {
        let Some(job) = self.store.dequeue_lease().await? else {
            return Ok(None);
        };

        let result = AssertUnwindSafe(self.handler.handle(&job.payload))
            .catch_unwind()
            .await;

        let failure = match result {
            Ok(Ok(())) => {
                self.store.ack(&job.id).await?;
                info!("[{}] job {} succeeded.", self.name, job.id);
                return Ok(Some((job.id, JobOutcome::Succeeded)));
            }
            Ok(Err(e)) => Error::ProcessingFailure(format!("{:#}", e)),
            Err(panic) => Error::ProcessingFailure(format!("handler panicked: {}", panic_message(&*panic))),
        };

        let outcome = match self.store.fail(&job.id, &failure.to_string()).await? {
            FailOutcome::Retrying { attempts, retry_in } => {
                warn!(
                    "[{}] job {} attempt {}/{} failed: {}; retrying in {:?}.",
                    self.name, job.id, attempts, job.max_attempts, failure, retry_in
                );
                JobOutcome::Retrying { attempts, retry_in }
            }
            FailOutcome::Terminal { attempts } => {
                error!(
                    "[{}] job {} failed permanently after {} attempts: {}.",
                    self.name, job.id, attempts, failure
                );
                JobOutcome::Failed { attempts }
            }
        };
        Ok(Some((job.id, outcome)))
    }

    /// Drain the queue until `shutdown` fires. A job in progress is always
    /// finished before the loop exits.
    pub async fn run(&self, shutdown: CancellationToken) {
        info!("[{}] started.", self.name);
        while !shutdown.is_cancelled() {
            let idle = match self.run_once().await {
                Ok(Some(_)) => false,
                Ok(None) => true,
                Err(e) => {
                    error!("[{}] queue error: {}", self.name, e);
                    true
                }
            };

            if idle {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = tokio::time::sleep(self.config.poll_interval) => {}
                }
            }
        }
        info!("[{}] stopped.", self.name);
    }
}

/// Start `count` workers sharing one store and handler.
pub fn spawn_workers(
    count: usize,
    store: Arc<dyn QueueStore>,
    handler: Arc<dyn JobHandler>,
    config: WorkerConfig,
    shutdown: CancellationToken,
) -> Vec<JoinHandle<()>> {
    (0..count.max(1))
        .map(|i| {
            let worker = Worker::new(format!("worker-{}", i), store.clone(), handler.clone(), config);
            let shutdown = shutdown.clone();
            tokio::spawn(async move { worker.run(shutdown).await })
        })
        .collect()
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

//! In-process job queue with at-least-once delivery.
//!
//! Jobs are pushed onto a bounded channel and handled by up to `concurrency`
//! tasks at once. A job whose handler returns an error, or outlives the job
//! timeout, is delivered again after the configured backoff until its
//! attempts run out.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, Mutex, Semaphore};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::QueueConfig;
use crate::error::{DeployError, DeployResult};
use crate::orchestrator::DeploymentOrchestrator;
use crate::types::{CapabilitySnapshot, InstanceId};

/// A request to deploy the version served by an instance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeployJob {
    /// Instance whose pending version should go live.
    pub instance_id: InstanceId,
    /// Version data supplied when the job was enqueued. Published as-is when
    /// the provider does not report capabilities of its own.
    #[serde(default)]
    pub target_version: CapabilitySnapshot,
}

/// Something that can process a [`DeployJob`].
///
/// An `Err` asks the queue to deliver the job again.
#[async_trait]
pub trait JobHandler: Send + Sync {
    /// Handle one delivery of `job`.
    async fn handle(&self, job: &DeployJob) -> DeployResult<()>;
}

#[async_trait]
impl JobHandler for DeploymentOrchestrator {
    async fn handle(&self, job: &DeployJob) -> DeployResult<()> {
        self.run(job).await
    }
}

#[derive(Debug)]
struct Delivery {
    job: DeployJob,
    attempt: u32,
}

/// Bounded job queue and its worker pool.
pub struct JobQueue {
    tx: mpsc::Sender<Delivery>,
    rx: Mutex<mpsc::Receiver<Delivery>>,
    attempts: u32,
    concurrency: usize,
    backoff: Duration,
    timeout: Duration,
}

impl JobQueue {
    /// Create a queue from configuration.
    #[must_use]
    pub fn new(config: &QueueConfig) -> Self {
        let (tx, rx) = mpsc::channel(config.channel_capacity.max(1));
        Self {
            tx,
            rx: Mutex::new(rx),
            attempts: config.attempts.max(1),
            concurrency: config.concurrency.max(1),
            backoff: config.backoff(),
            timeout: config.job_timeout(),
        }
    }

    /// Add a job to the queue, waiting for space if it is full.
    pub async fn enqueue(&self, job: DeployJob) -> DeployResult<()> {
        debug!(instance_id = %job.instance_id, "job queued");
        self.tx
            .send(Delivery { job, attempt: 1 })
            .await
            .map_err(|_| DeployError::internal("job queue is closed"))
    }

    /// Deliver jobs to `handler` until `cancel` is triggered.
    ///
    /// Jobs already running are awaited before this returns. Retries still
    /// waiting out their backoff are dropped.
    pub async fn run(&self, handler: Arc<dyn JobHandler>, cancel: CancellationToken) {
        info!(concurrency = self.concurrency, "job queue started");

        let slots = Arc::new(Semaphore::new(self.concurrency));
        let mut rx = self.rx.lock().await;
        let mut running = JoinSet::new();

        loop {
            let permit = tokio::select! {
                biased;

                () = cancel.cancelled() => break,

                permit = Arc::clone(&slots).acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break,
                },
            };

            let delivery = tokio::select! {
                biased;

                () = cancel.cancelled() => break,

                delivery = rx.recv() => match delivery {
                    Some(delivery) => delivery,
                    None => break,
                },
            };

            let handler = Arc::clone(&handler);
            let retry = Retry {
                tx: self.tx.clone(),
                attempts: self.attempts,
                backoff: self.backoff,
                timeout: self.timeout,
                cancel: cancel.clone(),
            };
            running.spawn(async move {
                let _permit = permit;
                deliver(handler.as_ref(), delivery, retry).await;
            });

            while running.try_join_next().is_some() {}
        }

        info!(in_flight = running.len(), "job queue stopping");
        while running.join_next().await.is_some() {}
        info!("job queue stopped");
    }
}

struct Retry {
    tx: mpsc::Sender<Delivery>,
    attempts: u32,
    backoff: Duration,
    timeout: Duration,
    cancel: CancellationToken,
}

async fn deliver(handler: &dyn JobHandler, delivery: Delivery, retry: Retry) {
    let Delivery { job, attempt } = delivery;

    let outcome = tokio::time::timeout(retry.timeout, handler.handle(&job))
        .await
        .unwrap_or_else(|_| {
            Err(DeployError::internal(format!(
                "job timed out after {}ms",
                retry.timeout.as_millis()
            )))
        });

    let Err(e) = outcome else {
        debug!(instance_id = %job.instance_id, attempt, "job handled");
        return;
    };

    if attempt >= retry.attempts {
        error!(
            instance_id = %job.instance_id,
            attempt,
            error = %e,
            "job failed, attempts exhausted"
        );
        return;
    }

    warn!(
        instance_id = %job.instance_id,
        attempt,
        error = %e,
        backoff_ms = retry.backoff.as_millis(),
        "job failed, retrying"
    );

    // The slot is released while the retry waits out its backoff.
    tokio::spawn(async move {
        tokio::select! {
            () = retry.cancel.cancelled() => {}
            () = tokio::time::sleep(retry.backoff) => {
                let next = Delivery { job, attempt: attempt + 1 };
                if retry.tx.send(next).await.is_err() {
                    warn!("job queue closed before retry");
                }
            }
        }
    });
}

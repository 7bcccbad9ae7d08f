//! Bounded hand-off between webhook acknowledgement and event processing.
//!
//! The webhook handler must answer quickly, so accepted events are queued
//! here and processed by a fixed number of concurrent workers.

use std::sync::Arc;

use async_trait::async_trait;
use metrics::{counter, gauge};
use shared::{
    config::server::DispatchConfig,
    models::{ClipDeletedEvent, StreamOnlineEvent},
};
use thiserror::Error;
use tokio::{
    sync::{Semaphore, mpsc},
    task::JoinHandle,
};
use tokio_util::{sync::CancellationToken, task::TaskTracker};
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Job {
    StreamOnline(StreamOnlineEvent),
    ClipDeleted(ClipDeletedEvent),
}

impl Job {
    pub const fn label(&self) -> &'static str {
        match self {
            Self::StreamOnline(_) => "stream_online",
            Self::ClipDeleted(_) => "clip_deleted",
        }
    }
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait JobHandler: Send + Sync {
    async fn handle(&self, job: Job) -> anyhow::Result<()>;
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum DispatchError {
    #[error("dispatch queue is full")]
    QueueFull,
    #[error("dispatcher has shut down")]
    Closed,
}

#[derive(Debug, Clone)]
pub struct Dispatcher {
    sender: mpsc::Sender<Job>,
}

impl Dispatcher {
    /// Starts the worker loop. The returned handle completes once `cancel`
    /// fires and every in-flight job has finished.
    pub fn spawn(
        handler: Arc<dyn JobHandler>,
        config: &DispatchConfig,
        cancel: CancellationToken,
    ) -> (Self, JoinHandle<()>) {
        let (sender, receiver) = mpsc::channel(config.queue_capacity.max(1));
        let permits = Arc::new(Semaphore::new(config.concurrency.max(1)));
        let handle = tokio::spawn(run_workers(handler, receiver, permits, cancel));
        (Self { sender }, handle)
    }

    /// Queues `job` without waiting.
    pub fn try_dispatch(&self, job: Job) -> Result<(), DispatchError> {
        let label = job.label();
        match self.sender.try_send(job) {
            Ok(()) => {
                counter!("streamrelay_dispatch_jobs_total", "job" => label, "outcome" => "queued")
                    .increment(1);
                Ok(())
            }
            Err(mpsc::error::TrySendError::Full(_)) => {
                counter!("streamrelay_dispatch_jobs_total", "job" => label, "outcome" => "rejected")
                    .increment(1);
                Err(DispatchError::QueueFull)
            }
            Err(mpsc::error::TrySendError::Closed(_)) => Err(DispatchError::Closed),
        }
    }
}

async fn run_workers(
    handler: Arc<dyn JobHandler>,
    mut receiver: mpsc::Receiver<Job>,
    permits: Arc<Semaphore>,
    cancel: CancellationToken,
) {
    let tasks = TaskTracker::new();
    let mut dropped = 0;

    loop {
        let job = tokio::select! {
            () = cancel.cancelled() => break,
            job = receiver.recv() => match job {
                Some(job) => job,
                None => break,
            },
        };

        let permit = tokio::select! {
            () = cancel.cancelled() => {
                dropped += 1;
                break;
            }
            permit = permits.clone().acquire_owned() => match permit {
                Ok(permit) => permit,
                Err(_) => {
                    dropped += 1;
                    break;
                }
            },
        };

        let handler = handler.clone();
        gauge!("streamrelay_dispatch_in_flight").increment(1.0);
        tasks.spawn(async move {
            let label = job.label();
            debug!(job = label, "processing job");
            if let Err(err) = handler.handle(job).await {
                error!(job = label, error = %err, "job failed");
                counter!("streamrelay_dispatch_jobs_total", "job" => label, "outcome" => "failed")
                    .increment(1);
            }
            gauge!("streamrelay_dispatch_in_flight").decrement(1.0);
            drop(permit);
        });
    }

    dropped += drain_pending(&mut receiver);
    if dropped > 0 {
        warn!(dropped, "dispatcher stopped with unprocessed jobs");
    }
    tasks.close();
    tasks.wait().await;
    info!("dispatcher stopped");
}

/// Closes the queue and discards whatever is still buffered, returning how
/// many jobs were lost.
fn drain_pending(receiver: &mut mpsc::Receiver<Job>) -> usize {
    receiver.close();
    let mut dropped = 0;
    while let Ok(job) = receiver.try_recv() {
        debug!(job = job.label(), "dropping queued job");
        counter!("streamrelay_dispatch_jobs_total", "job" => job.label(), "outcome" => "dropped")
            .increment(1);
        dropped += 1;
    }
    dropped
}

//! ============================================================================
//! Worker - Single-consumer FIFO job queue
//! ============================================================================
//! Producers (host callbacks, CLI input) only enqueue events. One consumer
//! task runs the jobs strictly one at a time, in arrival order, each bounded
//! by a wall-clock timeout. A job that overruns is aborted and fully stopped
//! before the next one starts, so the store never sees two writers.
//!
//! Pattern: submit -> mpsc -> consumer -> tokio::spawn(job) -> timeout -> next
//! ============================================================================

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::types::SyncEvent;

/// One full event-handling sequence
#[async_trait]
pub trait JobHandler: Send + Sync + 'static {
    async fn run_job(&self, event: SyncEvent);
}

/// Job outcome counters
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct WorkerStats {
    pub completed: u64,
    pub timed_out: u64,
    pub panicked: u64,
}

/// Cloneable producer side of the queue
#[derive(Clone)]
pub struct WorkerHandle {
    tx: mpsc::UnboundedSender<SyncEvent>,
}

impl WorkerHandle {
    /// Append an event to the queue. Never blocks.
    pub fn submit(&self, event: SyncEvent) -> Result<()> {
        debug!("Queueing job: {}", event.kind());
        self.tx
            .send(event)
            .map_err(|e| anyhow!("Worker stopped, dropped {}", e.0.kind()))
    }
}

/// Owner of the queue and its consumer task
pub struct Worker {
    handle: WorkerHandle,
    consumer: JoinHandle<()>,
    stats: Arc<Mutex<WorkerStats>>,
}

impl Worker {
    /// Start the consumer. Must be called inside a tokio runtime.
    pub fn start(handler: Arc<dyn JobHandler>, job_timeout: Duration) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let stats = Arc::new(Mutex::new(WorkerStats::default()));

        let consumer = tokio::spawn(run_consumer(handler, rx, job_timeout, stats.clone()));
        info!("Worker started (job timeout: {:?})", job_timeout);

        Self {
            handle: WorkerHandle { tx },
            consumer,
            stats,
        }
    }

    pub fn submit(&self, event: SyncEvent) -> Result<()> {
        self.handle.submit(event)
    }

    pub fn handle(&self) -> WorkerHandle {
        self.handle.clone()
    }

    pub fn stats(&self) -> WorkerStats {
        read_stats(&self.stats)
    }

    /// Close the queue, let already-queued jobs drain, and wait for the consumer.
    /// Producers holding a `WorkerHandle` keep the queue open until they drop it.
    pub async fn shutdown(self) -> Result<WorkerStats> {
        let Worker {
            handle,
            consumer,
            stats,
        } = self;
        drop(handle);

        consumer
            .await
            .map_err(|e| anyhow!("Worker consumer failed: {}", e))?;

        let stats = read_stats(&stats);
        info!(
            "Worker stopped: {} completed, {} timed out, {} panicked",
            stats.completed, stats.timed_out, stats.panicked
        );
        Ok(stats)
    }
}

async fn run_consumer(
    handler: Arc<dyn JobHandler>,
    mut rx: mpsc::UnboundedReceiver<SyncEvent>,
    job_timeout: Duration,
    stats: Arc<Mutex<WorkerStats>>,
) {
    while let Some(event) = rx.recv().await {
        let kind = event.kind();
        debug!("Starting job: {}", kind);

        let job_handler = handler.clone();
        let mut job = tokio::spawn(async move { job_handler.run_job(event).await });

        match tokio::time::timeout(job_timeout, &mut job).await {
            Ok(Ok(())) => {
                debug!("Job {} finished", kind);
                update_stats(&stats, |s| s.completed += 1);
            }
            Ok(Err(e)) => {
                error!("Job {} panicked: {}", kind, e);
                update_stats(&stats, |s| s.panicked += 1);
            }
            Err(_) => {
                warn!("Job {} exceeded {:?}, abandoning it", kind, job_timeout);
                job.abort();
                // Wait until the aborted job is really gone
                let _ = job.await;
                update_stats(&stats, |s| s.timed_out += 1);
            }
        }
    }
}

fn read_stats(stats: &Mutex<WorkerStats>) -> WorkerStats {
    match stats.lock() {
        Ok(guard) => *guard,
        Err(poisoned) => *poisoned.into_inner(),
    }
}

fn update_stats(stats: &Mutex<WorkerStats>, apply: impl FnOnce(&mut WorkerStats)) {
    match stats.lock() {
        Ok(mut guard) => apply(&mut *guard),
        Err(poisoned) => apply(&mut *poisoned.into_inner()),
    }
}

//! In-memory FIFO of job ids.
//!
//! Many producers (upload handlers, retry timers, startup rehydration) push;
//! exactly one worker pops. The queue itself is ephemeral: job records in the
//! `JobStore` are the durable truth and are re-enqueued after a restart.

use anyhow::{anyhow, Result};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, warn};
use uuid::Uuid;

/// Producer handle; cheap to clone.
#[derive(Debug, Clone)]
pub struct JobQueue {
    tx: mpsc::UnboundedSender<Uuid>,
    depth: Arc<AtomicUsize>,
}

/// The single consumer end.
#[derive(Debug)]
pub struct JobReceiver {
    rx: mpsc::UnboundedReceiver<Uuid>,
    depth: Arc<AtomicUsize>,
}

pub fn job_queue() -> (JobQueue, JobReceiver) {
    let (tx, rx) = mpsc::unbounded_channel();
    let depth = Arc::new(AtomicUsize::new(0));
    (
        JobQueue {
            tx,
            depth: depth.clone(),
        },
        JobReceiver { rx, depth },
    )
}

impl JobQueue {
    /// Append to the tail.
    pub fn push(&self, job_id: Uuid) -> Result<()> {
        self.depth.fetch_add(1, Ordering::SeqCst);
        if self.tx.send(job_id).is_err() {
            self.depth.fetch_sub(1, Ordering::SeqCst);
            return Err(anyhow!("conversion worker is not running"));
        }
        debug!(job = %job_id, depth = self.depth(), "job enqueued");
        Ok(())
    }

    /// Jobs waiting to be picked up, excluding ones sleeping in backoff.
    pub fn depth(&self) -> usize {
        self.depth.load(Ordering::SeqCst)
    }
}

impl JobReceiver {
    pub async fn next(&mut self) -> Option<Uuid> {
        let id = self.rx.recv().await?;
        self.depth.fetch_sub(1, Ordering::SeqCst);
        Some(id)
    }

    /// Non-blocking pop.
    pub fn try_next(&mut self) -> Option<Uuid> {
        let id = self.rx.try_recv().ok()?;
        self.depth.fetch_sub(1, Ordering::SeqCst);
        Some(id)
    }
}

/// Delayed re-enqueue for retries.
pub trait RetryTimer: Send + Sync {
    /// Push `job_id` onto `queue` after `delay`.
    fn schedule(&self, job_id: Uuid, delay: Duration, queue: JobQueue);
}

/// Sleeps on the tokio timer, one task per pending retry.
#[derive(Debug, Clone, Copy, Default)]
pub struct TokioRetryTimer;

impl RetryTimer for TokioRetryTimer {
    fn schedule(&self, job_id: Uuid, delay: Duration, queue: JobQueue) {
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if let Err(e) = queue.push(job_id) {
                warn!(job = %job_id, "dropping retry: {}", e);
            }
        });
    }
}

// =============================================================================
// Command Queue — FIFO, one-at-a-time outbound work per connection
// =============================================================================
//
// Every outbound (un)subscribe goes through here so frames reach the socket in
// call order and a slow write cannot stall the ones behind it for longer than
// the per-item timeout. `drain()` bumps the generation: anything queued before
// the bump is skipped by the worker instead of being written to a new socket.
// =============================================================================

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures_util::future::BoxFuture;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

struct Job {
    generation: u64,
    work: BoxFuture<'static, ()>,
}

pub struct CommandQueue {
    tx: mpsc::UnboundedSender<Job>,
    generation: Arc<AtomicU64>,
    worker: JoinHandle<()>,
}

impl CommandQueue {
    /// Spawn the worker. Must be called inside a tokio runtime.
    pub fn start(item_timeout: Duration) -> Self {
        let (tx, mut rx) = mpsc::unbounded_channel::<Job>();
        let generation = Arc::new(AtomicU64::new(0));

        let current = generation.clone();
        let worker = tokio::spawn(async move {
            while let Some(job) = rx.recv().await {
                if job.generation != current.load(Ordering::SeqCst) {
                    debug!(generation = job.generation, "dropping drained command");
                    continue;
                }
                if tokio::time::timeout(item_timeout, job.work).await.is_err() {
                    warn!(timeout_ms = item_timeout.as_millis() as u64, "queued command timed out");
                }
            }
        });

        Self {
            tx,
            generation,
            worker,
        }
    }

    /// Append `work` to the queue.
    pub fn push<F>(&self, work: F)
    where
        F: std::future::Future<Output = ()> + Send + 'static,
    {
        let job = Job {
            generation: self.generation.load(Ordering::SeqCst),
            work: Box::pin(work),
        };
        if self.tx.send(job).is_err() {
            warn!("command queue worker is gone, command dropped");
        }
    }

    /// Discard everything queued so far. The item currently running is not
    /// interrupted.
    pub fn drain(&self) {
        self.generation.fetch_add(1, Ordering::SeqCst);
    }
}

impl Drop for CommandQueue {
    fn drop(&mut self) {
        self.worker.abort();
    }
}

impl std::fmt::Debug for CommandQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CommandQueue")
            .field("generation", &self.generation.load(Ordering::SeqCst))
            .finish()
    }
}

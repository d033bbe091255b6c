//! Fire-and-forget side effects
//!
//! Last-heartbeat and account-activity writes must not delay the request that
//! caused them. They are queued here and run by a single worker task; each
//! job is attempted once and failures are only logged, since losing one of
//! these writes degrades `last_seen` or shard hints but never correctness.
//!
//! The queue is bounded. When the worker falls behind, new jobs are dropped
//! and counted instead of growing the backlog.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};

use crate::error::Result;

pub const DEFAULT_BACKGROUND_CAPACITY: usize = 10_000;

type Job = Pin<Box<dyn Future<Output = Result<()>> + Send>>;

enum Message {
    Run { name: &'static str, job: Job },
    Flush(oneshot::Sender<()>),
}

#[derive(Default)]
struct Counters {
    completed: AtomicU64,
    failed: AtomicU64,
    dropped: AtomicU64,
}

#[derive(Clone)]
pub struct BackgroundQueue {
    tx: mpsc::Sender<Message>,
    counters: Arc<Counters>,
}

impl BackgroundQueue {
    /// Spawn the worker on the current runtime, holding at most `capacity`
    /// pending messages
    pub fn start(capacity: usize) -> Self {
        let (tx, mut rx) = mpsc::channel::<Message>(capacity.max(1));
        let counters = Arc::new(Counters::default());
        let worker_counters = counters.clone();

        tokio::spawn(async move {
            while let Some(message) = rx.recv().await {
                match message {
                    Message::Run { name, job } => match job.await {
                        Ok(()) => {
                            worker_counters.completed.fetch_add(1, Ordering::Relaxed);
                        }
                        Err(e) => {
                            worker_counters.failed.fetch_add(1, Ordering::Relaxed);
                            metrics::counter!("vigil_background_failures_total", "job" => name)
                                .increment(1);
                            warn!(job = name, error = %e, "Background job failed");
                        }
                    },
                    Message::Flush(done) => {
                        let _ = done.send(());
                    }
                }
            }
            debug!("Background queue closed");
        });

        Self { tx, counters }
    }

    pub fn submit<F>(&self, name: &'static str, job: F)
    where
        F: Future<Output = Result<()>> + Send + 'static,
    {
        match self.tx.try_send(Message::Run {
            name,
            job: Box::pin(job),
        }) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => {
                self.counters.dropped.fetch_add(1, Ordering::Relaxed);
                metrics::counter!("vigil_background_dropped_total", "job" => name).increment(1);
                debug!(job = name, "Background queue full, dropping job");
            }
            Err(TrySendError::Closed(_)) => {
                debug!(job = name, "Background queue closed, dropping job");
            }
        }
    }

    /// Wait until every job submitted before this call has been attempted
    pub async fn drain(&self) {
        let (done, wait) = oneshot::channel();
        if self.tx.send(Message::Flush(done)).await.is_ok() {
            let _ = wait.await;
        }
    }

    pub fn completed(&self) -> u64 {
        self.counters.completed.load(Ordering::Relaxed)
    }

    pub fn failed(&self) -> u64 {
        self.counters.failed.load(Ordering::Relaxed)
    }

    /// Jobs rejected because the queue was full
    pub fn dropped(&self) -> u64 {
        self.counters.dropped.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::RegistryError;
    use std::sync::atomic::AtomicUsize;

    #[tokio::test]
    async fn test_jobs_run_in_order_and_failures_are_counted() {
        let queue = BackgroundQueue::start(DEFAULT_BACKGROUND_CAPACITY);
        let seen = Arc::new(parking_lot::Mutex::new(Vec::new()));

        for i in 0..3 {
            let seen = seen.clone();
            queue.submit("record", async move {
                seen.lock().push(i);
                Ok(())
            });
        }
        queue.submit("broken", async { Err(RegistryError::ShortCircuit) });
        queue.drain().await;

        assert_eq!(*seen.lock(), vec![0, 1, 2]);
        assert_eq!(queue.completed(), 3);
        assert_eq!(queue.failed(), 1);
    }

    #[tokio::test]
    async fn test_drain_on_idle_queue() {
        let queue = BackgroundQueue::start(DEFAULT_BACKGROUND_CAPACITY);
        queue.drain().await;
        let hits = Arc::new(AtomicUsize::new(0));
        let h = hits.clone();
        queue.submit("hit", async move {
            h.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });
        queue.drain().await;
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_full_queue_drops_and_counts() {
        let queue = BackgroundQueue::start(2);
        let hits = Arc::new(AtomicUsize::new(0));

        // The worker does not run until this task yields
        for _ in 0..5 {
            let h = hits.clone();
            queue.submit("hit", async move {
                h.fetch_add(1, Ordering::SeqCst);
                Ok(())
            });
        }
        queue.drain().await;

        assert_eq!(hits.load(Ordering::SeqCst), 2);
        assert_eq!(queue.completed(), 2);
        assert_eq!(queue.dropped(), 3);

        // Capacity frees up once the backlog is worked off
        let h = hits.clone();
        queue.submit("hit", async move {
            h.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });
        queue.drain().await;
        assert_eq!(hits.load(Ordering::SeqCst), 3);
        assert_eq!(queue.dropped(), 3);
    }
}

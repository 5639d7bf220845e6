//! Per-session task scheduling.
//!
//! Three lanes of work per session:
//!
//! 1. **Streaming**: at most one active; holds the stream mutex for its
//!    whole duration.
//! 2. **Deferred**: FIFO; each task acquires the stream mutex before
//!    running, so no deferred work ever overlaps an active chapter stream.
//! 3. **Image**: may run alongside streaming (the generation call is not an
//!    LLM call; anything that is goes through the deferred lane), bounded by
//!    a single permit.
//!
//! The stream mutex is the streaming-priority mechanism: background LLM
//! calls scheduled alongside streaming were observed to stall the first
//! words of a chapter by multiple seconds, so mutual exclusion is the
//! contract, not an optimization.

use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tale_core::{Result, TaleError};
use tokio::sync::{Mutex, Notify, Semaphore, mpsc};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

/// Wall-clock caps per task category.
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    pub streaming_timeout: Duration,
    pub deferred_timeout: Duration,
    pub image_timeout: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            streaming_timeout: Duration::from_secs(120),
            deferred_timeout: Duration::from_secs(30),
            image_timeout: Duration::from_secs(60),
        }
    }
}

struct DeferredTask {
    label: &'static str,
    work: futures::future::BoxFuture<'static, ()>,
}

/// Observable lane gauges, used by the streaming-priority tests.
#[derive(Debug, Default)]
pub struct LaneGauges {
    streaming: AtomicUsize,
    deferred: AtomicUsize,
}

impl LaneGauges {
    pub fn streaming_active(&self) -> usize {
        self.streaming.load(Ordering::SeqCst)
    }

    pub fn deferred_active(&self) -> usize {
        self.deferred.load(Ordering::SeqCst)
    }
}

pub struct TaskScheduler {
    config: SchedulerConfig,
    stream_lock: Arc<Mutex<()>>,
    deferred_tx: mpsc::UnboundedSender<DeferredTask>,
    pending_deferred: Arc<AtomicUsize>,
    deferred_drained: Arc<Notify>,
    image_permit: Arc<Semaphore>,
    gauges: Arc<LaneGauges>,
    cancel: CancellationToken,
    tracker: TaskTracker,
}

impl TaskScheduler {
    pub fn new(config: SchedulerConfig, cancel: CancellationToken) -> Arc<Self> {
        let (deferred_tx, deferred_rx) = mpsc::unbounded_channel();
        let scheduler = Arc::new(Self {
            config,
            stream_lock: Arc::new(Mutex::new(())),
            deferred_tx,
            pending_deferred: Arc::new(AtomicUsize::new(0)),
            deferred_drained: Arc::new(Notify::new()),
            image_permit: Arc::new(Semaphore::new(1)),
            gauges: Arc::new(LaneGauges::default()),
            cancel,
            tracker: TaskTracker::new(),
        });
        scheduler.spawn_deferred_worker(deferred_rx);
        scheduler
    }

    fn spawn_deferred_worker(self: &Arc<Self>, mut rx: mpsc::UnboundedReceiver<DeferredTask>) {
        let stream_lock = self.stream_lock.clone();
        let pending = self.pending_deferred.clone();
        let drained = self.deferred_drained.clone();
        let gauges = self.gauges.clone();
        let cancel = self.cancel.clone();
        let timeout = self.config.deferred_timeout;

        self.tracker.spawn(async move {
            loop {
                let task = tokio::select! {
                    _ = cancel.cancelled() => break,
                    task = rx.recv() => match task {
                        Some(task) => task,
                        None => break,
                    },
                };

                // Streaming-priority: wait for the stream mutex before any
                // work starts.
                let guard = tokio::select! {
                    _ = cancel.cancelled() => break,
                    guard = stream_lock.lock() => guard,
                };

                gauges.deferred.fetch_add(1, Ordering::SeqCst);
                let outcome = tokio::select! {
                    _ = cancel.cancelled() => Err("cancelled"),
                    result = tokio::time::timeout(timeout, task.work) => {
                        result.map_err(|_| "timed out")
                    }
                };
                gauges.deferred.fetch_sub(1, Ordering::SeqCst);
                drop(guard);

                if let Err(reason) = outcome {
                    tracing::warn!(task = task.label, reason, "deferred task did not complete");
                }

                if pending.fetch_sub(1, Ordering::SeqCst) == 1 {
                    drained.notify_waiters();
                }
            }
        });
    }

    /// Queue a background task. It begins execution only at the next
    /// transition into streaming-idle, in FIFO order.
    pub fn enqueue_deferred<F>(&self, label: &'static str, work: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        self.pending_deferred.fetch_add(1, Ordering::SeqCst);
        let task = DeferredTask { label, work: Box::pin(work) };
        if self.deferred_tx.send(task).is_err() {
            // Worker is gone (session cancelled); nothing will run this.
            self.pending_deferred.fetch_sub(1, Ordering::SeqCst);
        }
    }

    /// Run the exclusive streaming window: no deferred task starts or makes
    /// progress until the returned future resolves.
    pub async fn run_streaming<F, T>(&self, work: F) -> Result<T>
    where
        F: Future<Output = Result<T>>,
    {
        let _guard = tokio::select! {
            _ = self.cancel.cancelled() => return Err(TaleError::Cancelled),
            guard = self.stream_lock.lock() => guard,
        };

        self.gauges.streaming.fetch_add(1, Ordering::SeqCst);
        let outcome = tokio::select! {
            _ = self.cancel.cancelled() => Err(TaleError::Cancelled),
            result = tokio::time::timeout(self.config.streaming_timeout, work) => {
                result.unwrap_or_else(|_| {
                    Err(TaleError::Timeout {
                        task: "chapter streaming".into(),
                        seconds: self.config.streaming_timeout.as_secs(),
                    })
                })
            }
        };
        self.gauges.streaming.fetch_sub(1, Ordering::SeqCst);
        outcome
    }

    /// Spawn an image-lane task: runs concurrently with streaming, one at a
    /// time, capped at the image timeout.
    pub fn spawn_image<F>(&self, label: &'static str, work: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let permit = self.image_permit.clone();
        let cancel = self.cancel.clone();
        let timeout = self.config.image_timeout;
        self.tracker.spawn(async move {
            let _permit = tokio::select! {
                _ = cancel.cancelled() => return,
                permit = permit.acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => return,
                },
            };
            let outcome = tokio::select! {
                _ = cancel.cancelled() => Err("cancelled"),
                result = tokio::time::timeout(timeout, work) => result.map_err(|_| "timed out"),
            };
            if let Err(reason) = outcome {
                tracing::warn!(task = label, reason, "image task did not complete");
            }
        });
    }

    /// Wait until every queued deferred task has finished. Used before
    /// `summary_ready` so recap artifacts are settled.
    pub async fn quiesce_deferred(&self) {
        loop {
            let notified = self.deferred_drained.notified();
            if self.pending_deferred.load(Ordering::SeqCst) == 0 {
                return;
            }
            tokio::select! {
                _ = self.cancel.cancelled() => return,
                _ = notified => {}
            }
        }
    }

    /// Cooperative cancel for every lane.
    pub fn cancel(&self) {
        self.cancel.cancel();
        self.tracker.close();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn gauges(&self) -> Arc<LaneGauges> {
        self.gauges.clone()
    }

    pub fn pending_deferred(&self) -> usize {
        self.pending_deferred.load(Ordering::SeqCst)
    }
}

//! Request queue - throttles fan-out fetches into fixed-size concurrent batches.

use std::collections::VecDeque;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use futures::future::{join_all, BoxFuture};
use futures::FutureExt;
use parking_lot::Mutex;
use tokio::sync::Notify;

use crate::config::RequestsConfig;
use crate::observability::SyncMetrics;

/// Callback run once its task has settled, whether it succeeded or not.
pub type OnComplete = Box<dyn FnOnce() + Send + 'static>;

struct Job {
    task: BoxFuture<'static, anyhow::Result<()>>,
    on_complete: Option<OnComplete>,
}

#[derive(Default)]
struct State {
    pending: VecDeque<Job>,
    pumping: bool,
    closed: bool,
}

struct Inner {
    state: Mutex<State>,
    idle: Notify,
    batch_size: usize,
    batch_delay: Duration,
    metrics: Arc<SyncMetrics>,
}

/// FIFO of independent fetch tasks run `batch_size` at a time.
///
/// A single pump drains the queue. Within a batch tasks run concurrently and
/// every task settles on its own: one failure or panic is logged and does not
/// affect its siblings or later batches.
#[derive(Clone)]
pub struct RequestQueue {
    inner: Arc<Inner>,
}

impl RequestQueue {
    pub fn new(config: &RequestsConfig, metrics: Arc<SyncMetrics>) -> Self {
        Self {
            inner: Arc::new(Inner {
                state: Mutex::new(State::default()),
                idle: Notify::new(),
                batch_size: config.batch_size.max(1),
                batch_delay: config.batch_delay(),
                metrics,
            }),
        }
    }

    /// Queue a task; starts the pump when it is idle.
    pub fn add<F>(&self, task: F, on_complete: Option<OnComplete>)
    where
        F: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        let mut state = self.inner.state.lock();
        if state.closed {
            drop(state);
            tracing::warn!("Request queue is shut down, dropping task");
            if let Some(callback) = on_complete {
                callback();
            }
            return;
        }

        state.pending.push_back(Job {
            task: task.boxed(),
            on_complete,
        });

        if !state.pumping {
            state.pumping = true;
            tokio::spawn(pump(self.inner.clone()));
        }
    }

    /// Discard tasks that have not started. Running tasks are unaffected.
    pub fn clear(&self) -> usize {
        let dropped = std::mem::take(&mut self.inner.state.lock().pending);
        let count = dropped.len();
        if count > 0 {
            tracing::debug!(dropped = count, "Cleared pending requests");
        }
        count
    }

    /// Clear pending work and reject further tasks.
    pub fn shutdown(&self) {
        self.inner.state.lock().closed = true;
        self.clear();
    }

    pub fn pending_len(&self) -> usize {
        self.inner.state.lock().pending.len()
    }

    /// Resolves once nothing is pending or running.
    pub async fn idle(&self) {
        loop {
            let notified = self.inner.idle.notified();
            {
                let state = self.inner.state.lock();
                if !state.pumping && state.pending.is_empty() {
                    return;
                }
            }
            notified.await;
        }
    }
}

async fn pump(inner: Arc<Inner>) {
    loop {
        let batch: Vec<Job> = {
            let mut state = inner.state.lock();
            let take = inner.batch_size.min(state.pending.len());
            if take == 0 {
                state.pumping = false;
                drop(state);
                inner.idle.notify_waiters();
                return;
            }
            state.pending.drain(..take).collect()
        };

        let size = batch.len();
        let (tasks, callbacks): (Vec<_>, Vec<_>) =
            batch.into_iter().map(|job| (job.task, job.on_complete)).unzip();

        let results = join_all(tasks.into_iter().map(|task| async move {
            AssertUnwindSafe(task)
                .catch_unwind()
                .await
                .unwrap_or_else(|_| Err(anyhow::anyhow!("request task panicked")))
        }))
        .await;
        let mut failed = 0;
        for (result, callback) in results.into_iter().zip(callbacks) {
            match result {
                Ok(()) => inner.metrics.record_request_completed(1),
                Err(e) => {
                    failed += 1;
                    inner.metrics.record_request_failed(1);
                    tracing::error!(error = %e, "Error processing request");
                }
            }
            if let Some(callback) = callback {
                callback();
            }
        }
        tracing::debug!(batch = size, failed, "Request batch settled");

        let more = !inner.state.lock().pending.is_empty();
        if more {
            tokio::time::sleep(inner.batch_delay).await;
        }
    }
}

//! Generic batching work queue.
//!
//! A [`BufferedTask`] owns one supervisor task. Producers hand entries in
//! through a [`BufferHandle`] at any time without blocking; every
//! `flush_interval` the accumulated entries are cut into batches of at most
//! `max_batch_size` and dispatched to workers, never more than
//! `max_concurrency` in flight. A batch that fails or whose worker crashes
//! re-enters the queue with its retry counter bumped; the retry counter is
//! unbounded and giving up is the handler's decision via
//! [`BatchOutcome::Halt`]. Batch order is not preserved.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{Notify, Semaphore};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, warn};

#[derive(Clone, Debug)]
pub struct TaskConfig {
    pub flush_interval: Duration,
    pub max_batch_size: usize,
    pub max_concurrency: usize,
    /// Page size the handler's `init` scan should use.
    pub init_chunk_size: usize,
}

impl Default for TaskConfig {
    fn default() -> Self {
        Self {
            flush_interval: Duration::from_secs(3),
            max_batch_size: 100,
            max_concurrency: 4,
            init_chunk_size: 1000,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum BatchOutcome {
    Ok,
    /// Re-queue the batch; the reason is logged at debug level.
    Retry(String),
    /// Drop the batch permanently.
    Halt(String),
}

#[async_trait]
pub trait BatchHandler: Send + Sync + 'static {
    type Entry: Send + Sync + Clone + 'static;

    const NAME: &'static str;

    /// Seeds the queue with unfinished work from the store. Invoked once
    /// when the task starts, before any flushing begins.
    async fn init(&self, buffer: BufferHandle<Self::Entry>);

    async fn run(&self, batch: Vec<Self::Entry>, retries: u32) -> BatchOutcome;
}

struct QueueState<E> {
    pending: Vec<E>,
    batches: VecDeque<(Vec<E>, u32)>,
}

/// Producer-side handle; cheap to clone, `buffer` never blocks.
pub struct BufferHandle<E> {
    name: &'static str,
    state: Arc<Mutex<QueueState<E>>>,
    notify: Arc<Notify>,
}

impl<E> Clone for BufferHandle<E> {
    fn clone(&self) -> Self {
        Self { name: self.name, state: self.state.clone(), notify: self.notify.clone() }
    }
}

impl<E: Send + 'static> BufferHandle<E> {
    pub(crate) fn new(name: &'static str) -> Self {
        Self {
            name,
            state: Arc::new(Mutex::new(QueueState {
                pending: Vec::new(),
                batches: VecDeque::new(),
            })),
            notify: Arc::new(Notify::new()),
        }
    }

    /// Accepts entries unconditionally; they join the next flush.
    pub fn buffer(&self, entries: Vec<E>) {
        if entries.is_empty() {
            return;
        }
        self.state
            .lock()
            .expect("buffer lock poisoned")
            .pending
            .extend(entries);
        self.notify.notify_one();
    }

    pub fn backlog_len(&self) -> usize {
        let state = self.state.lock().expect("buffer lock poisoned");
        state.pending.len()
            + state
                .batches
                .iter()
                .map(|(batch, _)| batch.len())
                .sum::<usize>()
    }

    fn flush(&self, max_batch_size: usize) {
        let mut state = self.state.lock().expect("buffer lock poisoned");
        if state.pending.is_empty() {
            return;
        }
        let pending = std::mem::take(&mut state.pending);
        let mut batch = Vec::with_capacity(max_batch_size.min(pending.len()));
        for entry in pending {
            batch.push(entry);
            if batch.len() == max_batch_size {
                state
                    .batches
                    .push_back((std::mem::take(&mut batch), 0));
            }
        }
        if !batch.is_empty() {
            state.batches.push_back((batch, 0));
        }
    }

    fn queue_batch(&self, batch: Vec<E>, retries: u32) {
        self.state
            .lock()
            .expect("buffer lock poisoned")
            .batches
            .push_back((batch, retries));
        self.notify.notify_one();
    }

    fn pop_batch(&self) -> Option<(Vec<E>, u32)> {
        self.state
            .lock()
            .expect("buffer lock poisoned")
            .batches
            .pop_front()
    }
}

/// A queue the memory monitor can shrink when the process is over its soft
/// limit.
pub trait ShrinkableQueue: Send + Sync {
    fn name(&self) -> &'static str;
    fn backlog_bytes(&self) -> usize;
    /// Drops roughly half the backlog, returning the number of entries
    /// shed. The dropped work is re-derived from the store by a later
    /// `init` scan.
    fn shed_half(&self) -> usize;
}

impl<E: Send + 'static> ShrinkableQueue for BufferHandle<E> {
    fn name(&self) -> &'static str {
        self.name
    }

    fn backlog_bytes(&self) -> usize {
        self.backlog_len() * std::mem::size_of::<E>()
    }

    fn shed_half(&self) -> usize {
        let mut state = self.state.lock().expect("buffer lock poisoned");
        let pending_cut = state.pending.len() / 2;
        let keep = state.pending.len() - pending_cut;
        state.pending.truncate(keep);

        let batches_cut = state.batches.len() / 2;
        let mut dropped = pending_cut;
        for _ in 0..batches_cut {
            if let Some((batch, _)) = state.batches.pop_back() {
                dropped += batch.len();
            }
        }
        dropped
    }
}

pub struct BufferedTask;

impl BufferedTask {
    /// Starts the supervisor task. The returned handle is the producer side
    /// of the queue; the join handle owns the supervisor.
    pub fn spawn<H: BatchHandler>(
        handler: Arc<H>,
        config: TaskConfig,
    ) -> (BufferHandle<H::Entry>, JoinHandle<()>) {
        let handle = BufferHandle::new(H::NAME);
        let supervisor = tokio::spawn(run_loop(handler, config, handle.clone()));
        (handle, supervisor)
    }
}

async fn run_loop<H: BatchHandler>(
    handler: Arc<H>,
    config: TaskConfig,
    handle: BufferHandle<H::Entry>,
) {
    handler.init(handle.clone()).await;

    let semaphore = Arc::new(Semaphore::new(config.max_concurrency));
    let mut flush = tokio::time::interval(config.flush_interval);
    flush.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = flush.tick() => handle.flush(config.max_batch_size),
            _ = handle.notify.notified() => {}
        }

        while let Ok(permit) = semaphore.clone().try_acquire_owned() {
            let Some((batch, retries)) = handle.pop_batch() else {
                drop(permit);
                break;
            };
            let handler = Arc::clone(&handler);
            let handle = handle.clone();
            tokio::spawn(async move {
                let _permit = permit;
                let attempt = batch.clone();
                // the worker runs in its own task so a panic is observable
                // instead of fatal
                let worker = tokio::spawn({
                    let handler = Arc::clone(&handler);
                    async move { handler.run(attempt, retries).await }
                });
                match worker.await {
                    Ok(BatchOutcome::Ok) => {}
                    Ok(BatchOutcome::Retry(reason)) => {
                        debug!(task = H::NAME, retries, %reason, "batch retried");
                        handle.queue_batch(batch, retries + 1);
                    }
                    Ok(BatchOutcome::Halt(reason)) => {
                        warn!(task = H::NAME, retries, %reason, size = batch.len(), "batch dropped");
                    }
                    Err(join_error) => {
                        error!(task = H::NAME, retries, %join_error, "batch worker crashed");
                        handle.queue_batch(batch, retries + 1);
                    }
                }
                handle.notify.notify_one();
            });
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Recording {
        runs: Mutex<Vec<(Vec<u64>, u32)>>,
        fail_first: AtomicUsize,
        seed: Vec<u64>,
    }

    impl Recording {
        fn new(seed: Vec<u64>, fail_first: usize) -> Self {
            Self {
                runs: Mutex::new(Vec::new()),
                fail_first: AtomicUsize::new(fail_first),
                seed,
            }
        }
    }

    #[async_trait]
    impl BatchHandler for Recording {
        type Entry = u64;

        const NAME: &'static str = "recording";

        async fn init(&self, buffer: BufferHandle<u64>) {
            buffer.buffer(self.seed.clone());
        }

        async fn run(&self, batch: Vec<u64>, retries: u32) -> BatchOutcome {
            self.runs
                .lock()
                .unwrap()
                .push((batch, retries));
            if self
                .fail_first
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok()
            {
                BatchOutcome::Retry("transient".into())
            } else {
                BatchOutcome::Ok
            }
        }
    }

    fn config(max_batch_size: usize) -> TaskConfig {
        TaskConfig {
            flush_interval: Duration::from_millis(10),
            max_batch_size,
            max_concurrency: 2,
            init_chunk_size: 10,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn seeds_flushes_and_batches() {
        let handler = Arc::new(Recording::new(vec![1, 2, 3, 4, 5], 0));
        let (_handle, supervisor) = BufferedTask::spawn(handler.clone(), config(2));

        tokio::time::sleep(Duration::from_millis(100)).await;
        supervisor.abort();

        let mut runs: Vec<Vec<u64>> = handler
            .runs
            .lock()
            .unwrap()
            .iter()
            .map(|(batch, _)| batch.clone())
            .collect();
        runs.sort();
        assert_eq!(runs, vec![vec![1, 2], vec![3, 4], vec![5]]);
    }

    #[test_log::test(tokio::test(start_paused = true))]
    async fn retry_increments_counter() {
        let handler = Arc::new(Recording::new(vec![7], 2));
        let (_handle, supervisor) = BufferedTask::spawn(handler.clone(), config(10));

        tokio::time::sleep(Duration::from_millis(200)).await;
        supervisor.abort();

        let runs = handler.runs.lock().unwrap().clone();
        assert_eq!(runs, vec![(vec![7], 0), (vec![7], 1), (vec![7], 2)]);
    }

    #[tokio::test(start_paused = true)]
    async fn external_producers_feed_the_queue() {
        let handler = Arc::new(Recording::new(vec![], 0));
        let (handle, supervisor) = BufferedTask::spawn(handler.clone(), config(10));

        handle.buffer(vec![10, 11]);
        tokio::time::sleep(Duration::from_millis(50)).await;
        handle.buffer(vec![12]);
        tokio::time::sleep(Duration::from_millis(50)).await;
        supervisor.abort();

        let runs: Vec<Vec<u64>> = handler
            .runs
            .lock()
            .unwrap()
            .iter()
            .map(|(batch, _)| batch.clone())
            .collect();
        assert_eq!(runs, vec![vec![10, 11], vec![12]]);
    }

    #[tokio::test]
    async fn shed_half_drops_backlog() {
        let handle: BufferHandle<u64> = BufferHandle::new("test");
        handle.buffer((0..10).collect());
        handle.queue_batch((10..20).collect(), 0);
        handle.queue_batch((20..30).collect(), 0);

        let dropped = handle.shed_half();
        // half the pending entries and half the queued batches
        assert_eq!(dropped, 5 + 10);
        assert_eq!(handle.backlog_len(), 15);
    }
}

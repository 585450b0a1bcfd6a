//! Persistence Writer - moves samples from the poll path to durable storage
//!
//! Pollers hand samples to a `SampleQueue` and never wait on the disk. The
//! writer drains the queue on a fixed interval and appends the whole batch
//! through `SampleStore::append_batch`. A failed batch goes back to the
//! front of the queue and is retried on the next tick.
//!
//! The queue is bounded. When it is full the oldest pending sample is
//! dropped and counted; every tick that saw drops logs a warning so the
//! loss is never silent.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::SampleStore;
use crate::types::Sample;

/// Ticks in a row with drops before the warning escalates to an error
const SUSTAINED_DROP_TICKS: u32 = 3;

// ============================================================================
// Sample queue
// ============================================================================

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct QueueStats {
    pub pending: usize,
    pub ceiling: usize,
    pub enqueued_total: u64,
    pub dropped_total: u64,
}

#[derive(Debug)]
struct QueueState {
    pending: VecDeque<Sample>,
    ceiling: usize,
    enqueued_total: u64,
    dropped_total: u64,
}

impl QueueState {
    fn trim_to_ceiling(&mut self) -> usize {
        let mut dropped = 0;
        while self.pending.len() > self.ceiling {
            self.pending.pop_front();
            dropped += 1;
        }
        self.dropped_total += dropped as u64;
        dropped
    }
}

/// Shared handle to the pending-sample queue.
///
/// A disabled queue accepts and discards everything; it is what pollers get
/// when persistence is off.
#[derive(Debug, Clone)]
pub struct SampleQueue {
    inner: Option<Arc<Mutex<QueueState>>>,
}

impl SampleQueue {
    /// `ceiling` is clamped to at least 1.
    pub fn new(ceiling: usize) -> Self {
        Self {
            inner: Some(Arc::new(Mutex::new(QueueState {
                pending: VecDeque::new(),
                ceiling: ceiling.max(1),
                enqueued_total: 0,
                dropped_total: 0,
            }))),
        }
    }

    pub const fn disabled() -> Self {
        Self { inner: None }
    }

    pub const fn is_enabled(&self) -> bool {
        self.inner.is_some()
    }

    /// Append samples, dropping the oldest pending ones past the ceiling.
    /// Returns how many were dropped.
    pub fn enqueue(&self, samples: impl IntoIterator<Item = Sample>) -> usize {
        let Some(inner) = &self.inner else {
            return 0;
        };
        let mut state = inner.lock().unwrap_or_else(|e| e.into_inner());
        for sample in samples {
            state.pending.push_back(sample);
            state.enqueued_total += 1;
        }
        state.trim_to_ceiling()
    }

    pub fn len(&self) -> usize {
        self.inner.as_ref().map_or(0, |inner| {
            inner.lock().unwrap_or_else(|e| e.into_inner()).pending.len()
        })
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn stats(&self) -> QueueStats {
        self.inner.as_ref().map_or_else(QueueStats::default, |inner| {
            let state = inner.lock().unwrap_or_else(|e| e.into_inner());
            QueueStats {
                pending: state.pending.len(),
                ceiling: state.ceiling,
                enqueued_total: state.enqueued_total,
                dropped_total: state.dropped_total,
            }
        })
    }

    /// Take everything pending, oldest first.
    pub fn drain(&self) -> Vec<Sample> {
        self.inner.as_ref().map_or_else(Vec::new, |inner| {
            inner
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .pending
                .drain(..)
                .collect()
        })
    }

    /// Put an unwritten batch back ahead of newer samples. The ceiling still
    /// applies, so a long outage sheds the oldest data first.
    pub fn requeue_front(&self, batch: Vec<Sample>) -> usize {
        let Some(inner) = &self.inner else {
            return 0;
        };
        let mut state = inner.lock().unwrap_or_else(|e| e.into_inner());
        for sample in batch.into_iter().rev() {
            state.pending.push_front(sample);
        }
        state.trim_to_ceiling()
    }
}

// ============================================================================
// Writer task
// ============================================================================

#[derive(Debug, Clone, Default, Serialize)]
pub struct WriterStats {
    pub flushes: u64,
    pub failed_flushes: u64,
    pub rows_written: u64,
    pub last_batch: usize,
    pub last_flush: Option<DateTime<Utc>>,
}

/// Cheap to clone; clones share the queue and counters.
#[derive(Clone)]
pub struct PersistenceWriter {
    store: Arc<dyn SampleStore>,
    queue: SampleQueue,
    interval: Duration,
    stats: Arc<Mutex<WriterStats>>,
}

impl std::fmt::Debug for PersistenceWriter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PersistenceWriter")
            .field("backend", &self.store.backend_name())
            .field("interval", &self.interval)
            .field("pending", &self.queue.len())
            .finish()
    }
}

impl PersistenceWriter {
    pub fn new(store: Arc<dyn SampleStore>, interval: Duration, ceiling: usize) -> Self {
        Self {
            store,
            queue: SampleQueue::new(ceiling),
            interval: interval.max(Duration::from_millis(1)),
            stats: Arc::new(Mutex::new(WriterStats::default())),
        }
    }

    /// Handle for producers.
    pub fn queue(&self) -> SampleQueue {
        self.queue.clone()
    }

    pub fn stats(&self) -> WriterStats {
        self.stats.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// Shared view of the counters that outlives the spawned task.
    pub fn stats_handle(&self) -> Arc<Mutex<WriterStats>> {
        self.stats.clone()
    }

    /// Write everything pending as one batch. Returns rows written.
    ///
    /// On failure the batch is requeued and nothing is counted as written.
    pub fn flush_now(&self) -> usize {
        let batch = self.queue.drain();
        if batch.is_empty() {
            return 0;
        }

        let rows = batch.len();
        match self.store.append_batch(&batch) {
            Ok(ids) => {
                let mut stats = self.stats.lock().unwrap_or_else(|e| e.into_inner());
                stats.flushes += 1;
                stats.rows_written += ids.len() as u64;
                stats.last_batch = rows;
                stats.last_flush = Some(Utc::now());
                debug!(rows, backend = self.store.backend_name(), "Batch persisted");
                rows
            }
            Err(e) => {
                self.stats
                    .lock()
                    .unwrap_or_else(|e| e.into_inner())
                    .failed_flushes += 1;
                let dropped = self.queue.requeue_front(batch);
                error!(
                    rows,
                    dropped,
                    backend = self.store.backend_name(),
                    error = %e,
                    "Batch write failed, retained for retry"
                );
                0
            }
        }
    }

    /// Flush on every interval tick until cancelled, then flush once more
    /// and sync the store.
    pub async fn run(self, cancel: CancellationToken) {
        info!(
            backend = self.store.backend_name(),
            interval_ms = self.interval.as_millis() as u64,
            ceiling = self.queue.stats().ceiling,
            "Persistence writer started"
        );

        let mut ticker =
            tokio::time::interval_at(tokio::time::Instant::now() + self.interval, self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let mut last_dropped = self.queue.stats().dropped_total;
        let mut drop_ticks = 0u32;

        loop {
            tokio::select! {
                () = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    let dropped_total = self.queue.stats().dropped_total;
                    let new_drops = dropped_total - last_dropped;
                    last_dropped = dropped_total;
                    if new_drops > 0 {
                        drop_ticks += 1;
                        if drop_ticks >= SUSTAINED_DROP_TICKS {
                            error!(
                                dropped = new_drops,
                                dropped_total,
                                ticks = drop_ticks,
                                "Persistence queue saturated, samples are being lost continuously"
                            );
                        } else {
                            warn!(dropped = new_drops, dropped_total, "Persistence queue full, oldest samples dropped");
                        }
                    } else {
                        drop_ticks = 0;
                    }
                    self.flush_now();
                }
            }
        }

        let rows = self.flush_now();
        if let Err(e) = self.store.sync() {
            error!(error = %e, "Final storage sync failed");
        }
        let pending = self.queue.len();
        if pending > 0 {
            warn!(pending, "Persistence writer stopped with unwritten samples");
        }
        info!(final_rows = rows, "Persistence writer stopped");
    }

    pub fn spawn(self, cancel: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(self.run(cancel))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::{InMemoryStore, StorageError};
    use crate::types::FunctionCode;
    use std::sync::atomic::{AtomicBool, Ordering};

    fn sample(raw: u16) -> Sample {
        Sample {
            channel: Arc::from("flow"),
            slave_id: 1,
            address: 0,
            function_code: FunctionCode::InputRegisters,
            timestamp: Utc::now(),
            raw,
            value: f64::from(raw),
            unit: Arc::from("l/min"),
        }
    }

    fn raws(samples: &[Sample]) -> Vec<u16> {
        samples.iter().map(|s| s.raw).collect()
    }

    /// Fails while `broken` is set.
    struct FlakyStore {
        inner: InMemoryStore,
        broken: AtomicBool,
    }

    impl SampleStore for FlakyStore {
        fn append_batch(&self, batch: &[Sample]) -> Result<Vec<u64>, StorageError> {
            if self.broken.load(Ordering::SeqCst) {
                return Err(StorageError::Io("disk full".into()));
            }
            self.inner.append_batch(batch)
        }

        fn backend_name(&self) -> &'static str {
            "flaky"
        }
    }

    #[test]
    fn test_queue_drops_oldest_at_ceiling() {
        let queue = SampleQueue::new(3);
        assert_eq!(queue.enqueue((0..5).map(sample)), 2);
        assert_eq!(raws(&queue.drain()), vec![2, 3, 4]);
        let stats = queue.stats();
        assert_eq!((stats.enqueued_total, stats.dropped_total), (5, 2));
        assert!(queue.is_empty());
    }

    #[test]
    fn test_requeue_keeps_order_ahead_of_newer() {
        let queue = SampleQueue::new(10);
        queue.enqueue((0..3).map(sample));
        let batch = queue.drain();
        queue.enqueue([sample(9)]);
        queue.requeue_front(batch);
        assert_eq!(raws(&queue.drain()), vec![0, 1, 2, 9]);
    }

    #[test]
    fn test_disabled_queue_discards() {
        let queue = SampleQueue::disabled();
        assert!(!queue.is_enabled());
        assert_eq!(queue.enqueue([sample(1)]), 0);
        assert!(queue.is_empty());
        assert_eq!(queue.stats(), QueueStats::default());
    }

    #[test]
    fn test_failed_flush_retains_batch() {
        let store = Arc::new(FlakyStore {
            inner: InMemoryStore::new(),
            broken: AtomicBool::new(true),
        });
        let writer = PersistenceWriter::new(store.clone(), Duration::from_secs(1), 100);
        writer.queue().enqueue((0..4).map(sample));

        assert_eq!(writer.flush_now(), 0);
        assert_eq!(writer.queue().len(), 4);
        assert_eq!(writer.stats().failed_flushes, 1);

        store.broken.store(false, Ordering::SeqCst);
        writer.queue().enqueue([sample(4)]);
        assert_eq!(writer.flush_now(), 5);
        let values: Vec<f64> = store.inner.records().iter().map(|r| r.value).collect();
        assert_eq!(values, vec![0.0, 1.0, 2.0, 3.0, 4.0]);
        assert_eq!(writer.stats().rows_written, 5);
    }

    #[test]
    fn test_empty_flush_is_not_counted() {
        let writer = PersistenceWriter::new(Arc::new(InMemoryStore::new()), Duration::from_secs(1), 10);
        assert_eq!(writer.flush_now(), 0);
        assert_eq!(writer.stats().flushes, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_flushes_on_interval_and_on_stop() {
        let store = Arc::new(InMemoryStore::new());
        let writer = PersistenceWriter::new(store.clone(), Duration::from_secs(5), 100);
        let queue = writer.queue();
        let stats = writer.stats_handle();
        let cancel = CancellationToken::new();
        let handle = writer.spawn(cancel.clone());

        queue.enqueue((0..3).map(sample));
        tokio::time::sleep(Duration::from_millis(4_900)).await;
        assert!(store.is_empty());

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(store.len(), 3);

        queue.enqueue([sample(7)]);
        cancel.cancel();
        handle.await.unwrap();
        assert_eq!(store.len(), 4);
        assert_eq!(stats.lock().unwrap().flushes, 2);
    }

    #[test]
    fn test_block_on_final_flush() {
        let store = Arc::new(InMemoryStore::new());
        let writer = PersistenceWriter::new(store.clone(), Duration::from_secs(60), 10);
        writer.queue().enqueue([sample(1), sample(2)]);
        let cancel = CancellationToken::new();
        cancel.cancel();
        tokio_test::block_on(writer.run(cancel));
        assert_eq!(store.len(), 2);
    }
}

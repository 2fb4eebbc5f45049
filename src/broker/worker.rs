//! Worker pool: batch collection and bounded-parallel delivery
//!
//! Each worker loops: collect up to `batch_size` messages within
//! `batch_timeout_ms`, deliver them with at most `delivery_parallelism` in
//! flight, wait for all to finish, repeat. Statistics live in per-slot
//! [`WorkerStats`] that outlive the task, so a replacement worker continues
//! the same counters.

use crate::broker::delivery::{self, panic_message, DeliveryReport};
use crate::broker::queue::QueuedMessage;
use crate::broker::BrokerShared;
use crate::error::BrokerError;
use crate::observability::metrics::WorkerStatsSnapshot;
use crate::worker_span;
use futures::stream::{self, StreamExt};
use futures::FutureExt;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, warn, Instrument};

/// Counters and health flag for one worker slot
#[derive(Debug)]
pub struct WorkerStats {
    messages_processed: AtomicU64,
    batches_processed: AtomicU64,
    errors: AtomicU64,
    restarts: AtomicU64,
    consecutive_errors: AtomicU32,
    healthy: AtomicBool,
    last_fault: Mutex<Option<String>>,
}

impl Default for WorkerStats {
    fn default() -> Self {
        Self::new()
    }
}

impl WorkerStats {
    pub fn new() -> Self {
        Self {
            messages_processed: AtomicU64::new(0),
            batches_processed: AtomicU64::new(0),
            errors: AtomicU64::new(0),
            restarts: AtomicU64::new(0),
            consecutive_errors: AtomicU32::new(0),
            healthy: AtomicBool::new(true),
            last_fault: Mutex::new(None),
        }
    }

    fn fault_slot(&self) -> MutexGuard<'_, Option<String>> {
        self.last_fault.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Fold one batch into the counters, returning the consecutive error streak
    pub fn record_batch(&self, batch_size: usize, report: &DeliveryReport) -> u32 {
        self.messages_processed
            .fetch_add(batch_size as u64, Ordering::Relaxed);
        self.batches_processed.fetch_add(1, Ordering::Relaxed);
        self.errors
            .fetch_add(report.failed as u64, Ordering::Relaxed);

        if report.delivered > 0 {
            self.consecutive_errors.store(0, Ordering::Relaxed);
            0
        } else {
            let failed = u32::try_from(report.failed).unwrap_or(u32::MAX);
            self.consecutive_errors
                .fetch_add(failed, Ordering::Relaxed)
                .saturating_add(failed)
        }
    }

    pub fn mark_unhealthy(&self, reason: impl Into<String>) {
        *self.fault_slot() = Some(reason.into());
        self.healthy.store(false, Ordering::Release);
    }

    pub fn is_healthy(&self) -> bool {
        self.healthy.load(Ordering::Acquire)
    }

    pub fn last_fault(&self) -> Option<String> {
        self.fault_slot().clone()
    }

    pub fn messages_processed(&self) -> u64 {
        self.messages_processed.load(Ordering::Relaxed)
    }

    /// Clear the health flag and error streak for a replacement task; counters are kept
    fn prepare_restart(&self) {
        self.restarts.fetch_add(1, Ordering::Relaxed);
        self.consecutive_errors.store(0, Ordering::Relaxed);
        *self.fault_slot() = None;
        self.healthy.store(true, Ordering::Release);
    }

    pub fn snapshot(&self, worker_id: usize) -> WorkerStatsSnapshot {
        WorkerStatsSnapshot {
            worker_id,
            messages_processed: self.messages_processed.load(Ordering::Relaxed),
            batches_processed: self.batches_processed.load(Ordering::Relaxed),
            errors: self.errors.load(Ordering::Relaxed),
            is_healthy: self.is_healthy(),
            restarts: self.restarts.load(Ordering::Relaxed),
        }
    }
}

/// Observed state of one worker slot, input to health decisions
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerProbe {
    pub worker_id: usize,
    pub is_healthy: bool,
    /// The slot's task has exited (or was never started)
    pub task_finished: bool,
    pub last_fault: Option<String>,
}

struct WorkerSlot {
    worker_id: usize,
    stats: Arc<WorkerStats>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl WorkerSlot {
    fn handle(&self) -> MutexGuard<'_, Option<JoinHandle<()>>> {
        self.handle.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Fixed set of worker slots sharing one broker state
pub struct WorkerPool {
    shared: Arc<BrokerShared>,
    slots: Vec<WorkerSlot>,
    shutdown: watch::Receiver<bool>,
}

impl WorkerPool {
    pub(crate) fn new(shared: Arc<BrokerShared>, shutdown: watch::Receiver<bool>) -> Self {
        let slots = shared
            .worker_stats
            .iter()
            .enumerate()
            .map(|(worker_id, stats)| WorkerSlot {
                worker_id,
                stats: stats.clone(),
                handle: Mutex::new(None),
            })
            .collect();

        Self {
            shared,
            slots,
            shutdown,
        }
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Spawn a task for every slot
    pub fn start(&self) {
        for slot in &self.slots {
            let handle = self.spawn_worker(slot);
            *slot.handle() = Some(handle);
        }
        info!(num_workers = self.slots.len(), "Worker pool started");
    }

    fn spawn_worker(&self, slot: &WorkerSlot) -> JoinHandle<()> {
        let worker_id = slot.worker_id;
        let shared = self.shared.clone();
        let stats = slot.stats.clone();
        let shutdown = self.shutdown.clone();

        tokio::spawn(
            run_worker(worker_id, shared, stats, shutdown).instrument(worker_span!(worker_id)),
        )
    }

    /// Replace the task in slot `worker_id`, keeping its statistics
    pub fn restart(&self, worker_id: usize) -> bool {
        let Some(slot) = self.slots.get(worker_id) else {
            return false;
        };

        let mut handle = slot.handle();
        if let Some(old) = handle.take() {
            old.abort();
        }
        slot.stats.prepare_restart();
        *handle = Some(self.spawn_worker(slot));
        self.shared.metrics.worker_restarted();

        info!(worker_id, "Worker restarted");
        true
    }

    /// Flag a worker as unhealthy; the health monitor will replace it
    pub fn mark_unhealthy(&self, worker_id: usize, reason: &str) -> bool {
        match self.slots.get(worker_id) {
            Some(slot) => {
                slot.stats.mark_unhealthy(reason);
                true
            }
            None => false,
        }
    }

    pub fn probes(&self) -> Vec<WorkerProbe> {
        self.slots
            .iter()
            .map(|slot| WorkerProbe {
                worker_id: slot.worker_id,
                is_healthy: slot.stats.is_healthy(),
                task_finished: slot
                    .handle()
                    .as_ref()
                    .map(|h| h.is_finished())
                    .unwrap_or(true),
                last_fault: slot.stats.last_fault(),
            })
            .collect()
    }

    /// Wait up to `grace` for workers to finish their current batch, then abort the rest
    pub async fn join(&self, grace: Duration) {
        let deadline = Instant::now() + grace;
        let handles: Vec<(usize, JoinHandle<()>)> = self
            .slots
            .iter()
            .filter_map(|slot| slot.handle().take().map(|h| (slot.worker_id, h)))
            .collect();

        for (worker_id, mut handle) in handles {
            if tokio::time::timeout_at(deadline, &mut handle).await.is_err() {
                warn!(worker_id, "Worker did not stop within grace period, aborting");
                handle.abort();
            }
        }
    }
}

async fn run_worker(
    worker_id: usize,
    shared: Arc<BrokerShared>,
    stats: Arc<WorkerStats>,
    mut shutdown: watch::Receiver<bool>,
) {
    info!("Worker started");
    let max_consecutive_errors = shared.config.max_consecutive_errors;

    loop {
        let (batch, stop) = collect_batch(&shared, &mut shutdown).await;

        if !batch.is_empty() {
            let batch_size = batch.len();
            match AssertUnwindSafe(process_batch(&shared, batch, worker_id))
                .catch_unwind()
                .await
            {
                Ok(report) => {
                    shared.metrics.batch_processed(batch_size);
                    let streak = stats.record_batch(batch_size, &report);
                    debug!(
                        batch_size,
                        delivered = report.delivered,
                        failed = report.failed,
                        expired = report.expired,
                        "Batch processed"
                    );

                    if streak >= max_consecutive_errors {
                        let failure = BrokerError::worker_failure(
                            worker_id,
                            format!("{streak} consecutive delivery failures"),
                        );
                        error!(error = %failure, "Worker unhealthy");
                        stats.mark_unhealthy(failure.to_string());
                        break;
                    }
                }
                Err(panic) => {
                    let failure = BrokerError::worker_failure(
                        worker_id,
                        format!("batch processing panicked: {}", panic_message(panic.as_ref())),
                    );
                    error!(error = %failure, "Worker unhealthy");
                    stats.mark_unhealthy(failure.to_string());
                    break;
                }
            }
        }

        if stop {
            break;
        }
    }

    info!("Worker stopped");
}

/// Collect the next batch; the flag is true when shutdown was requested
///
/// Shutdown is only observed between pops, so every popped message is
/// returned and processed.
async fn collect_batch(
    shared: &BrokerShared,
    shutdown: &mut watch::Receiver<bool>,
) -> (Vec<QueuedMessage>, bool) {
    let batch_size = shared.config.effective_batch_size();
    let mut batch = Vec::with_capacity(batch_size);

    loop {
        if *shutdown.borrow() {
            return (batch, true);
        }

        let deadline = if shared.config.enable_batching {
            Some(Instant::now() + shared.config.batch_timeout())
        } else {
            None
        };

        while batch.len() < batch_size {
            tokio::select! {
                item = shared.queue.pop_until(deadline) => match item {
                    Some(item) => batch.push(item),
                    None => break,
                },
                _ = wait_for_shutdown(shutdown) => return (batch, true),
            }
        }

        if !batch.is_empty() {
            return (batch, false);
        }
    }
}

async fn wait_for_shutdown(shutdown: &mut watch::Receiver<bool>) {
    loop {
        if *shutdown.borrow_and_update() {
            return;
        }
        if shutdown.changed().await.is_err() {
            return;
        }
    }
}

/// Deliver a batch with bounded parallelism and wait for every delivery
async fn process_batch(
    shared: &BrokerShared,
    batch: Vec<QueuedMessage>,
    worker_id: usize,
) -> DeliveryReport {
    let parallelism = shared.config.delivery_parallelism.max(1);

    stream::iter(batch)
        .map(|item| delivery::deliver(shared, item, worker_id))
        .buffer_unordered(parallelism)
        .fold(DeliveryReport::default(), |mut total, report| async move {
            total.merge(report);
            total
        })
        .await
}

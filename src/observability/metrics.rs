//! Thread-safe broker metrics
//!
//! Atomic counters for message flow plus a bounded window of delivery
//! latencies. Each broker owns its own collector; [`BrokerMetrics::snapshot`]
//! combines the counters with point-in-time gauges into [`BrokerStats`].

use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant};
use tracing::{info, warn};

/// Latency samples kept for percentile calculation
const MAX_LATENCY_SAMPLES: usize = 1000;

/// Monotonic counters and latency samples for one broker
pub struct BrokerMetrics {
    messages_sent: AtomicU64,
    messages_delivered: AtomicU64,
    messages_failed: AtomicU64,
    messages_expired: AtomicU64,
    messages_retried: AtomicU64,
    messages_rejected: AtomicU64,
    messages_dead_lettered: AtomicU64,
    responses_generated: AtomicU64,
    requests_completed: AtomicU64,
    requests_timeout: AtomicU64,
    late_responses: AtomicU64,
    events_published: AtomicU64,
    publishes_without_subscribers: AtomicU64,
    batches_processed: AtomicU64,
    batched_messages: AtomicU64,
    worker_restarts: AtomicU64,
    queue_warning_active: AtomicBool,

    // Delivery latency in microseconds
    delivery_latencies: Mutex<VecDeque<u64>>,
    started_at: Instant,
}

impl Default for BrokerMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl BrokerMetrics {
    pub fn new() -> Self {
        Self {
            messages_sent: AtomicU64::new(0),
            messages_delivered: AtomicU64::new(0),
            messages_failed: AtomicU64::new(0),
            messages_expired: AtomicU64::new(0),
            messages_retried: AtomicU64::new(0),
            messages_rejected: AtomicU64::new(0),
            messages_dead_lettered: AtomicU64::new(0),
            responses_generated: AtomicU64::new(0),
            requests_completed: AtomicU64::new(0),
            requests_timeout: AtomicU64::new(0),
            late_responses: AtomicU64::new(0),
            events_published: AtomicU64::new(0),
            publishes_without_subscribers: AtomicU64::new(0),
            batches_processed: AtomicU64::new(0),
            batched_messages: AtomicU64::new(0),
            worker_restarts: AtomicU64::new(0),
            queue_warning_active: AtomicBool::new(false),
            delivery_latencies: Mutex::new(VecDeque::with_capacity(MAX_LATENCY_SAMPLES)),
            started_at: Instant::now(),
        }
    }

    pub fn message_sent(&self) {
        self.messages_sent.fetch_add(1, Ordering::Relaxed);
    }

    pub fn message_delivered(&self, latency: Duration) {
        self.messages_delivered.fetch_add(1, Ordering::Relaxed);
        self.record_latency(latency);
    }

    pub fn message_failed(&self) {
        self.messages_failed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn message_expired(&self) {
        self.messages_expired.fetch_add(1, Ordering::Relaxed);
    }

    pub fn message_retried(&self) {
        self.messages_retried.fetch_add(1, Ordering::Relaxed);
    }

    pub fn message_rejected(&self) {
        self.messages_rejected.fetch_add(1, Ordering::Relaxed);
    }

    pub fn message_dead_lettered(&self) {
        self.messages_dead_lettered.fetch_add(1, Ordering::Relaxed);
    }

    pub fn response_generated(&self) {
        self.responses_generated.fetch_add(1, Ordering::Relaxed);
    }

    pub fn request_completed(&self) {
        self.requests_completed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn request_timed_out(&self) {
        self.requests_timeout.fetch_add(1, Ordering::Relaxed);
    }

    pub fn late_response(&self) {
        self.late_responses.fetch_add(1, Ordering::Relaxed);
    }

    pub fn event_published(&self) {
        self.events_published.fetch_add(1, Ordering::Relaxed);
    }

    pub fn publish_without_subscribers(&self) {
        self.publishes_without_subscribers
            .fetch_add(1, Ordering::Relaxed);
    }

    pub fn batch_processed(&self, size: usize) {
        self.batches_processed.fetch_add(1, Ordering::Relaxed);
        self.batched_messages
            .fetch_add(size as u64, Ordering::Relaxed);
    }

    pub fn worker_restarted(&self) {
        self.worker_restarts.fetch_add(1, Ordering::Relaxed);
    }

    pub fn messages_expired(&self) -> u64 {
        self.messages_expired.load(Ordering::Relaxed)
    }

    pub fn late_responses(&self) -> u64 {
        self.late_responses.load(Ordering::Relaxed)
    }

    /// Log once when utilization crosses the warning threshold, and once when it falls back
    pub fn observe_queue(&self, size: usize, capacity: usize, threshold: f64) {
        let utilization = utilization(size, capacity);
        let above = utilization >= threshold;
        let was_above = self.queue_warning_active.swap(above, Ordering::Relaxed);

        if above && !was_above {
            warn!(
                queue_size = size,
                queue_capacity = capacity,
                utilization,
                "Queue utilization crossed warning threshold"
            );
        } else if !above && was_above {
            info!(
                queue_size = size,
                queue_capacity = capacity,
                utilization,
                "Queue utilization back below warning threshold"
            );
        }
    }

    fn record_latency(&self, latency: Duration) {
        if let Ok(mut samples) = self.delivery_latencies.lock() {
            if samples.len() >= MAX_LATENCY_SAMPLES {
                samples.pop_front();
            }
            samples.push_back(latency.as_micros() as u64);
        }
    }

    fn latency_summary(&self) -> LatencySummary {
        let mut sorted: Vec<u64> = match self.delivery_latencies.lock() {
            Ok(samples) => samples.iter().copied().collect(),
            Err(_) => return LatencySummary::default(),
        };
        if sorted.is_empty() {
            return LatencySummary::default();
        }
        sorted.sort_unstable();

        let to_ms = |micros: f64| micros / 1000.0;
        let avg = sorted.iter().sum::<u64>() as f64 / sorted.len() as f64;

        LatencySummary {
            samples: sorted.len(),
            avg_ms: to_ms(avg),
            p50_ms: to_ms(percentile(&sorted, 50.0)),
            p95_ms: to_ms(percentile(&sorted, 95.0)),
            p99_ms: to_ms(percentile(&sorted, 99.0)),
        }
    }

    /// Combine counters with point-in-time gauges
    pub fn snapshot(&self, gauges: RuntimeGauges) -> BrokerStats {
        let batches_processed = self.batches_processed.load(Ordering::Relaxed);
        let batched_messages = self.batched_messages.load(Ordering::Relaxed);
        let avg_batch_size = if batches_processed == 0 {
            0.0
        } else {
            batched_messages as f64 / batches_processed as f64
        };

        let queue_utilization = utilization(gauges.queue_size, gauges.queue_capacity);

        BrokerStats {
            running: gauges.running,
            messages_sent: self.messages_sent.load(Ordering::Relaxed),
            messages_delivered: self.messages_delivered.load(Ordering::Relaxed),
            messages_failed: self.messages_failed.load(Ordering::Relaxed),
            messages_expired: self.messages_expired.load(Ordering::Relaxed),
            messages_retried: self.messages_retried.load(Ordering::Relaxed),
            messages_rejected: self.messages_rejected.load(Ordering::Relaxed),
            messages_dead_lettered: self.messages_dead_lettered.load(Ordering::Relaxed),
            responses_generated: self.responses_generated.load(Ordering::Relaxed),
            requests_completed: self.requests_completed.load(Ordering::Relaxed),
            requests_timeout: self.requests_timeout.load(Ordering::Relaxed),
            late_responses: self.late_responses.load(Ordering::Relaxed),
            events_published: self.events_published.load(Ordering::Relaxed),
            publishes_without_subscribers: self
                .publishes_without_subscribers
                .load(Ordering::Relaxed),
            agents_registered: gauges.agents_registered,
            topics: gauges.topics,
            batches_processed,
            avg_batch_size,
            queue_size: gauges.queue_size,
            queue_capacity: gauges.queue_capacity,
            queue_utilization,
            queue_warning: queue_utilization >= gauges.queue_warning_threshold,
            pending_requests: gauges.pending_requests,
            dead_letters: gauges.dead_letters,
            worker_restarts: self.worker_restarts.load(Ordering::Relaxed),
            uptime_seconds: self.started_at.elapsed().as_secs_f64(),
            delivery_latency: self.latency_summary(),
            workers: gauges.workers,
        }
    }
}

/// Point-in-time values owned by other broker components
#[derive(Debug, Clone, Default)]
pub struct RuntimeGauges {
    pub running: bool,
    pub agents_registered: usize,
    pub topics: usize,
    pub queue_size: usize,
    pub queue_capacity: usize,
    pub queue_warning_threshold: f64,
    pub pending_requests: usize,
    pub dead_letters: usize,
    pub workers: Vec<WorkerStatsSnapshot>,
}

/// Delivery latency percentiles over the most recent samples
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct LatencySummary {
    pub samples: usize,
    pub avg_ms: f64,
    pub p50_ms: f64,
    pub p95_ms: f64,
    pub p99_ms: f64,
}

/// Per-worker counters
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WorkerStatsSnapshot {
    pub worker_id: usize,
    pub messages_processed: u64,
    pub batches_processed: u64,
    pub errors: u64,
    pub is_healthy: bool,
    pub restarts: u64,
}

/// Statistics snapshot returned by `MessageBroker::stats`
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BrokerStats {
    pub running: bool,
    pub messages_sent: u64,
    pub messages_delivered: u64,
    pub messages_failed: u64,
    pub messages_expired: u64,
    pub messages_retried: u64,
    pub messages_rejected: u64,
    pub messages_dead_lettered: u64,
    pub responses_generated: u64,
    pub requests_completed: u64,
    pub requests_timeout: u64,
    pub late_responses: u64,
    pub events_published: u64,
    pub publishes_without_subscribers: u64,
    pub agents_registered: usize,
    pub topics: usize,
    pub batches_processed: u64,
    pub avg_batch_size: f64,
    pub queue_size: usize,
    pub queue_capacity: usize,
    pub queue_utilization: f64,
    pub queue_warning: bool,
    pub pending_requests: usize,
    pub dead_letters: usize,
    pub worker_restarts: u64,
    pub uptime_seconds: f64,
    pub delivery_latency: LatencySummary,
    pub workers: Vec<WorkerStatsSnapshot>,
}

impl BrokerStats {
    /// Sum of `messages_processed` across worker slots
    pub fn messages_processed(&self) -> u64 {
        self.workers.iter().map(|w| w.messages_processed).sum()
    }

    pub fn all_workers_healthy(&self) -> bool {
        self.workers.iter().all(|w| w.is_healthy)
    }
}

fn utilization(size: usize, capacity: usize) -> f64 {
    if capacity == 0 {
        0.0
    } else {
        size as f64 / capacity as f64
    }
}

fn percentile(sorted_data: &[u64], percentile: f64) -> f64 {
    if sorted_data.is_empty() {
        return 0.0;
    }

    let len = sorted_data.len();
    let index = (percentile / 100.0) * (len - 1) as f64;

    if index.fract() == 0.0 {
        sorted_data[index as usize] as f64
    } else {
        let lower = sorted_data[index.floor() as usize] as f64;
        let upper = sorted_data[index.ceil() as usize] as f64;
        lower + (upper - lower) * index.fract()
    }
}

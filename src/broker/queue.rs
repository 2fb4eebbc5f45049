//! Bounded priority queue with delayed (retry) entries
//!
//! Ready entries are ordered by priority (highest first) and then by
//! insertion sequence. Retries wait in a separate min-heap keyed by the
//! instant they become eligible and are promoted on the next pop after that
//! instant.

use crate::error::BrokerError;
use crate::protocol::messages::{AgentIdentity, AgentMessage, Priority};
use std::cmp::{Ordering, Reverse};
use std::collections::BinaryHeap;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::Instant;

/// An envelope waiting for delivery
#[derive(Debug, Clone)]
pub struct QueuedMessage {
    pub message: AgentMessage,
    /// Recipients for this attempt; `None` means "resolve from the envelope"
    pub targets: Option<Vec<AgentIdentity>>,
    pub enqueued_at: Instant,
}

impl QueuedMessage {
    pub fn new(message: AgentMessage) -> Self {
        Self {
            message,
            targets: None,
            enqueued_at: Instant::now(),
        }
    }

    /// Retry attempt aimed at a single recipient
    pub fn retry_for(message: AgentMessage, recipient: AgentIdentity) -> Self {
        Self {
            message,
            targets: Some(vec![recipient]),
            enqueued_at: Instant::now(),
        }
    }

    pub fn priority(&self) -> Priority {
        self.message.priority()
    }
}

#[derive(Debug)]
struct ReadyEntry {
    priority: Priority,
    seq: u64,
    item: QueuedMessage,
}

impl PartialEq for ReadyEntry {
    fn eq(&self, other: &Self) -> bool {
        self.seq == other.seq
    }
}

impl Eq for ReadyEntry {}

impl PartialOrd for ReadyEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for ReadyEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        // Max-heap: higher priority first, then lower sequence first
        self.priority
            .cmp(&other.priority)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

#[derive(Debug)]
struct DelayedEntry {
    ready_at: Instant,
    seq: u64,
    item: QueuedMessage,
}

impl PartialEq for DelayedEntry {
    fn eq(&self, other: &Self) -> bool {
        self.seq == other.seq
    }
}

impl Eq for DelayedEntry {}

impl PartialOrd for DelayedEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for DelayedEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        self.ready_at
            .cmp(&other.ready_at)
            .then_with(|| self.seq.cmp(&other.seq))
    }
}

#[derive(Debug, Default)]
struct QueueState {
    ready: BinaryHeap<ReadyEntry>,
    delayed: BinaryHeap<Reverse<DelayedEntry>>,
    next_seq: u64,
}

impl QueueState {
    fn len(&self) -> usize {
        self.ready.len() + self.delayed.len()
    }

    fn next_seq(&mut self) -> u64 {
        let seq = self.next_seq;
        self.next_seq += 1;
        seq
    }

    fn push_ready(&mut self, item: QueuedMessage) {
        let seq = self.next_seq();
        self.ready.push(ReadyEntry {
            priority: item.priority(),
            seq,
            item,
        });
    }

    /// Move every delayed entry due at `now` into the ready heap
    fn promote_due(&mut self, now: Instant) {
        while self
            .delayed
            .peek()
            .is_some_and(|Reverse(entry)| entry.ready_at <= now)
        {
            if let Some(Reverse(entry)) = self.delayed.pop() {
                self.ready.push(ReadyEntry {
                    priority: entry.item.priority(),
                    seq: entry.seq,
                    item: entry.item,
                });
            }
        }
    }

    fn next_ready_at(&self) -> Option<Instant> {
        self.delayed.peek().map(|Reverse(entry)| entry.ready_at)
    }
}

/// Thread-safe bounded priority queue shared by the facade and workers
#[derive(Debug)]
pub struct MessageQueue {
    state: Mutex<QueueState>,
    capacity: usize,
    item_ready: Notify,
    space_available: Notify,
}

impl MessageQueue {
    pub fn new(capacity: usize) -> Self {
        Self {
            state: Mutex::new(QueueState::default()),
            capacity,
            item_ready: Notify::new(),
            space_available: Notify::new(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, QueueState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn try_push_inner(&self, item: QueuedMessage) -> Result<(), QueuedMessage> {
        {
            let mut state = self.lock();
            if state.len() >= self.capacity {
                return Err(item);
            }
            state.push_ready(item);
        }
        self.item_ready.notify_one();
        Ok(())
    }

    /// Enqueue unless the queue is at capacity
    pub fn try_push(&self, item: QueuedMessage) -> Result<(), BrokerError> {
        self.try_push_inner(item)
            .map_err(|_| BrokerError::capacity_exceeded(self.len(), self.capacity))
    }

    /// Enqueue, waiting up to `timeout` for space
    pub async fn push_wait(&self, item: QueuedMessage, timeout: Duration) -> Result<(), BrokerError> {
        let deadline = Instant::now() + timeout;
        let mut item = item;

        loop {
            let notified = self.space_available.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            match self.try_push_inner(item) {
                Ok(()) => return Ok(()),
                Err(returned) => item = returned,
            }

            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return Err(BrokerError::capacity_exceeded(self.len(), self.capacity));
            }
        }
    }

    /// Enqueue regardless of capacity (retries and generated responses)
    pub fn push_unbounded(&self, item: QueuedMessage) {
        self.lock().push_ready(item);
        self.item_ready.notify_one();
    }

    /// Enqueue an entry that becomes eligible after `delay`
    pub fn push_delayed(&self, item: QueuedMessage, delay: Duration) {
        if delay.is_zero() {
            self.push_unbounded(item);
            return;
        }

        {
            let mut state = self.lock();
            let seq = state.next_seq();
            state.delayed.push(Reverse(DelayedEntry {
                ready_at: Instant::now() + delay,
                seq,
                item,
            }));
        }
        // Wake a waiter so it can re-arm its timer for the new earliest deadline
        self.item_ready.notify_one();
    }

    /// Pop the highest-priority entry eligible at `now`
    pub fn try_pop_at(&self, now: Instant) -> Option<QueuedMessage> {
        let item = {
            let mut state = self.lock();
            state.promote_due(now);
            state.ready.pop().map(|entry| entry.item)
        };
        if item.is_some() {
            self.space_available.notify_one();
        }
        item
    }

    pub fn try_pop(&self) -> Option<QueuedMessage> {
        self.try_pop_at(Instant::now())
    }

    /// Wait for an eligible entry until `deadline` (forever when `None`)
    ///
    /// Cancel-safe: an entry is only removed by a synchronous pop that is
    /// returned immediately.
    pub async fn pop_until(&self, deadline: Option<Instant>) -> Option<QueuedMessage> {
        loop {
            let notified = self.item_ready.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let now = Instant::now();
            if let Some(item) = self.try_pop_at(now) {
                return Some(item);
            }
            if deadline.is_some_and(|d| d <= now) {
                return None;
            }

            let wake_at = match (deadline, self.next_ready_at()) {
                (Some(d), Some(r)) => Some(d.min(r)),
                (d, r) => d.or(r),
            };

            match wake_at {
                Some(at) => {
                    tokio::select! {
                        _ = &mut notified => {}
                        _ = tokio::time::sleep_until(at) => {}
                    }
                }
                None => notified.await,
            }
        }
    }

    fn next_ready_at(&self) -> Option<Instant> {
        self.lock().next_ready_at()
    }

    /// Total entries, ready and delayed
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn delayed_len(&self) -> usize {
        self.lock().delayed.len()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn utilization(&self) -> f64 {
        self.len() as f64 / self.capacity as f64
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{AgentIdentity, MessageType};
    use proptest::prelude::*;

    fn message(priority: Priority, tag: &str) -> AgentMessage {
        AgentMessage::builder(AgentIdentity::new("sender", "test"), MessageType::Event)
            .recipient(AgentIdentity::new("receiver", "test"))
            .priority(priority)
            .header("tag", serde_json::json!(tag))
            .build()
    }

    fn tag(item: &QueuedMessage) -> String {
        item.message.metadata().headers["tag"]
            .as_str()
            .unwrap_or_default()
            .to_string()
    }

    #[test]
    fn test_higher_priority_dequeued_first() {
        let queue = MessageQueue::new(10);
        queue.try_push(QueuedMessage::new(message(Priority::Low, "low"))).unwrap();
        queue
            .try_push(QueuedMessage::new(message(Priority::Urgent, "urgent")))
            .unwrap();

        assert_eq!(tag(&queue.try_pop().unwrap()), "urgent");
        assert_eq!(tag(&queue.try_pop().unwrap()), "low");
        assert!(queue.try_pop().is_none());
    }

    #[test]
    fn test_fifo_within_priority() {
        let queue = MessageQueue::new(10);
        for i in 0..5 {
            queue
                .try_push(QueuedMessage::new(message(Priority::Normal, &i.to_string())))
                .unwrap();
        }
        let order: Vec<String> = std::iter::from_fn(|| queue.try_pop()).map(|i| tag(&i)).collect();
        assert_eq!(order, vec!["0", "1", "2", "3", "4"]);
    }

    #[test]
    fn test_capacity_enforced() {
        let queue = MessageQueue::new(2);
        queue.try_push(QueuedMessage::new(message(Priority::Normal, "a"))).unwrap();
        queue.try_push(QueuedMessage::new(message(Priority::Normal, "b"))).unwrap();

        let result = queue.try_push(QueuedMessage::new(message(Priority::Normal, "c")));
        assert!(matches!(
            result,
            Err(BrokerError::CapacityExceeded {
                size: 2,
                capacity: 2
            })
        ));
        assert_eq!(queue.utilization(), 1.0);
    }

    #[test]
    fn test_unbounded_push_ignores_capacity() {
        let queue = MessageQueue::new(1);
        queue.try_push(QueuedMessage::new(message(Priority::Normal, "a"))).unwrap();
        queue.push_unbounded(QueuedMessage::new(message(Priority::Normal, "retry")));
        assert_eq!(queue.len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_delayed_entry_not_eligible_early() {
        let queue = MessageQueue::new(10);
        queue.push_delayed(
            QueuedMessage::new(message(Priority::Urgent, "retry")),
            Duration::from_millis(100),
        );

        assert!(queue.try_pop().is_none());
        assert_eq!(queue.len(), 1);
        assert_eq!(queue.delayed_len(), 1);

        tokio::time::advance(Duration::from_millis(101)).await;
        assert_eq!(tag(&queue.try_pop().unwrap()), "retry");
    }

    #[tokio::test(start_paused = true)]
    async fn test_pop_until_wakes_for_delayed_entry() {
        let queue = MessageQueue::new(10);
        queue.push_delayed(
            QueuedMessage::new(message(Priority::Normal, "later")),
            Duration::from_millis(50),
        );

        let item = queue.pop_until(None).await.unwrap();
        assert_eq!(tag(&item), "later");
    }

    #[tokio::test(start_paused = true)]
    async fn test_pop_until_deadline_returns_none() {
        let queue = MessageQueue::new(10);
        let deadline = Instant::now() + Duration::from_millis(20);
        assert!(queue.pop_until(Some(deadline)).await.is_none());
    }

    #[tokio::test]
    async fn test_pop_until_wakes_on_push() {
        let queue = std::sync::Arc::new(MessageQueue::new(10));
        let waiter = {
            let queue = queue.clone();
            tokio::spawn(async move { queue.pop_until(None).await })
        };

        tokio::time::sleep(Duration::from_millis(10)).await;
        queue.try_push(QueuedMessage::new(message(Priority::High, "x"))).unwrap();

        let item = tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(tag(&item), "x");
    }

    #[tokio::test]
    async fn test_push_wait_succeeds_when_space_frees() {
        let queue = std::sync::Arc::new(MessageQueue::new(1));
        queue.try_push(QueuedMessage::new(message(Priority::Normal, "a"))).unwrap();

        let producer = {
            let queue = queue.clone();
            tokio::spawn(async move {
                queue
                    .push_wait(
                        QueuedMessage::new(message(Priority::Normal, "b")),
                        Duration::from_secs(2),
                    )
                    .await
            })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(queue.try_pop().is_some());

        assert!(producer.await.unwrap().is_ok());
        assert_eq!(tag(&queue.try_pop().unwrap()), "b");
    }

    #[tokio::test(start_paused = true)]
    async fn test_push_wait_times_out() {
        let queue = MessageQueue::new(1);
        queue.try_push(QueuedMessage::new(message(Priority::Normal, "a"))).unwrap();

        let result = queue
            .push_wait(
                QueuedMessage::new(message(Priority::Normal, "b")),
                Duration::from_millis(30),
            )
            .await;
        assert!(matches!(result, Err(BrokerError::CapacityExceeded { .. })));
    }

    fn priority_strategy() -> impl Strategy<Value = Priority> {
        prop_oneof![
            Just(Priority::Low),
            Just(Priority::Normal),
            Just(Priority::High),
            Just(Priority::Urgent),
        ]
    }

    proptest! {
        #[test]
        fn test_dequeue_order_is_priority_then_arrival(
            priorities in proptest::collection::vec(priority_strategy(), 1..40)
        ) {
            let queue = MessageQueue::new(100);
            for (i, p) in priorities.iter().enumerate() {
                queue.try_push(QueuedMessage::new(message(*p, &i.to_string()))).unwrap();
            }

            let popped: Vec<(Priority, usize)> = std::iter::from_fn(|| queue.try_pop())
                .map(|item| (item.priority(), tag(&item).parse::<usize>().unwrap()))
                .collect();

            prop_assert_eq!(popped.len(), priorities.len());
            for pair in popped.windows(2) {
                let (p1, i1) = pair[0];
                let (p2, i2) = pair[1];
                prop_assert!(p1 > p2 || (p1 == p2 && i1 < i2));
            }
        }
    }
}

//! Dead-letter store for undeliverable messages
//!
//! Bounded FIFO: when full, the oldest entry is evicted. Entries are
//! immutable once recorded.

use crate::protocol::messages::AgentMessage;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard};
use tracing::warn;

/// Why a message ended up in the dead-letter store
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum DeadLetterReason {
    Expired,
    RetriesExhausted,
    UnknownRecipient,
}

impl DeadLetterReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeadLetterReason::Expired => "expired",
            DeadLetterReason::RetriesExhausted => "retries_exhausted",
            DeadLetterReason::UnknownRecipient => "unknown_recipient",
        }
    }
}

impl fmt::Display for DeadLetterReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Record of a message that could not be delivered
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DeadLetterEntry {
    message: AgentMessage,
    reason: DeadLetterReason,
    recipient: Option<String>,
    last_error: Option<String>,
    timestamp: DateTime<Utc>,
}

impl DeadLetterEntry {
    pub fn new(message: AgentMessage, reason: DeadLetterReason) -> Self {
        Self {
            message,
            reason,
            recipient: None,
            last_error: None,
            timestamp: Utc::now(),
        }
    }

    /// Agent the failed delivery targeted
    pub fn with_recipient(mut self, agent_id: impl Into<String>) -> Self {
        self.recipient = Some(agent_id.into());
        self
    }

    /// Error text from the final failed attempt (already sanitized)
    pub fn with_error(mut self, error: impl Into<String>) -> Self {
        self.last_error = Some(error.into());
        self
    }

    pub fn message(&self) -> &AgentMessage {
        &self.message
    }

    pub fn reason(&self) -> DeadLetterReason {
        self.reason
    }

    pub fn recipient(&self) -> Option<&str> {
        self.recipient.as_deref()
    }

    pub fn last_error(&self) -> Option<&str> {
        self.last_error.as_deref()
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }
}

/// Bounded, thread-safe collection of dead letters
pub struct DeadLetterStore {
    entries: Mutex<VecDeque<DeadLetterEntry>>,
    max_size: usize,
    evicted: AtomicU64,
}

impl DeadLetterStore {
    pub fn new(max_size: usize) -> Self {
        Self {
            entries: Mutex::new(VecDeque::new()),
            max_size: max_size.max(1),
            evicted: AtomicU64::new(0),
        }
    }

    fn lock(&self) -> MutexGuard<'_, VecDeque<DeadLetterEntry>> {
        self.entries.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn push(&self, entry: DeadLetterEntry) {
        warn!(
            message_id = %entry.message.message_id(),
            reason = %entry.reason,
            recipient = entry.recipient.as_deref().unwrap_or("-"),
            "Message dead-lettered"
        );

        let mut entries = self.lock();
        if entries.len() >= self.max_size {
            entries.pop_front();
            self.evicted.fetch_add(1, Ordering::Relaxed);
        }
        entries.push_back(entry);
    }

    /// Oldest first
    pub fn snapshot(&self) -> Vec<DeadLetterEntry> {
        self.lock().iter().cloned().collect()
    }

    pub fn count_by_reason(&self, reason: DeadLetterReason) -> usize {
        self.lock().iter().filter(|e| e.reason == reason).count()
    }

    /// Remove every entry, returning how many were removed
    pub fn clear(&self) -> usize {
        let mut entries = self.lock();
        let count = entries.len();
        entries.clear();
        count
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Entries dropped because the store was full
    pub fn evicted(&self) -> u64 {
        self.evicted.load(Ordering::Relaxed)
    }
}

//! Pending-request table for request/response correlation
//!
//! Each in-flight `send_request` owns one entry keyed by correlation id.
//! Removing the entry and firing its sender happen under the same lock, so an
//! entry is resolved or cancelled exactly once.

use crate::error::{BrokerError, BrokerResult};
use crate::protocol::messages::Payload;
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};
use tokio::sync::oneshot;
use tokio::time::Instant;
use tracing::debug;

struct PendingEntry {
    tx: oneshot::Sender<Payload>,
    created_at: Instant,
}

/// Correlation id -> single-resolution response slot
#[derive(Default)]
pub struct PendingRequests {
    entries: Mutex<HashMap<String, PendingEntry>>,
}

impl PendingRequests {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, PendingEntry>> {
        self.entries.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Create the slot for `correlation_id`
    ///
    /// Fails if a request with the same correlation id is already in flight.
    pub fn register(&self, correlation_id: &str) -> BrokerResult<oneshot::Receiver<Payload>> {
        let mut entries = self.lock();
        if entries.contains_key(correlation_id) {
            return Err(BrokerError::invalid_message(format!(
                "a request with correlation_id {correlation_id} is already pending"
            )));
        }

        let (tx, rx) = oneshot::channel();
        entries.insert(
            correlation_id.to_string(),
            PendingEntry {
                tx,
                created_at: Instant::now(),
            },
        );
        Ok(rx)
    }

    /// Resolve the slot with a response payload
    ///
    /// Returns false when no entry exists (timed out, cancelled, or already
    /// resolved by an earlier response).
    pub fn resolve(&self, correlation_id: &str, payload: Payload) -> bool {
        let mut entries = self.lock();
        match entries.remove(correlation_id) {
            Some(entry) => {
                debug!(
                    correlation_id = %correlation_id,
                    elapsed_ms = entry.created_at.elapsed().as_millis() as u64,
                    "Resolving pending request"
                );
                // A dropped receiver means the caller went away; the entry is still consumed
                let _ = entry.tx.send(payload);
                true
            }
            None => false,
        }
    }

    /// Remove the slot without resolving it
    pub fn cancel(&self, correlation_id: &str) -> bool {
        self.lock().remove(correlation_id).is_some()
    }

    /// Cancel `correlation_id` when the returned guard is dropped
    pub(crate) fn guard<'a>(&'a self, correlation_id: &'a str) -> PendingGuard<'a> {
        PendingGuard {
            pending: self,
            correlation_id,
        }
    }

    pub fn contains(&self, correlation_id: &str) -> bool {
        self.lock().contains_key(correlation_id)
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Removes a pending entry when its waiter goes away, however it exits
pub(crate) struct PendingGuard<'a> {
    pending: &'a PendingRequests,
    correlation_id: &'a str,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        if self.pending.cancel(self.correlation_id) {
            debug!(correlation_id = %self.correlation_id, "Dropped pending request");
        }
    }
}

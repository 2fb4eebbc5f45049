//! Mock handlers for testing
//!
//! Each mock implements [`MessageHandler`] and records what it saw so tests
//! can assert on deliveries without hand-written closures.

use crate::broker::handler::{HandlerError, HandlerResult, MessageHandler, SharedHandler};
use crate::protocol::messages::{into_payload, AgentMessage, Payload};
use async_trait::async_trait;
use serde_json::Value;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, Notify};

/// Shared delivery log used by every mock
#[derive(Debug, Default)]
pub struct DeliveryLog {
    messages: Mutex<Vec<AgentMessage>>,
    count: AtomicUsize,
    notify: Notify,
}

impl DeliveryLog {
    async fn record(&self, message: &AgentMessage) {
        self.messages.lock().await.push(message.clone());
        self.count.fetch_add(1, Ordering::SeqCst);
        self.notify.notify_waiters();
    }

    pub fn count(&self) -> usize {
        self.count.load(Ordering::SeqCst)
    }

    pub async fn messages(&self) -> Vec<AgentMessage> {
        self.messages.lock().await.clone()
    }

    /// Wait until at least `expected` invocations were recorded
    pub async fn wait_for(&self, expected: usize, timeout: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if self.count() >= expected {
                return true;
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return self.count() >= expected;
            }
        }
    }
}

/// Records every message and optionally replies with a fixed payload
#[derive(Debug, Default)]
pub struct RecordingHandler {
    log: DeliveryLog,
    reply: Option<Payload>,
}

impl RecordingHandler {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn replying(reply: Value) -> Arc<Self> {
        Arc::new(Self {
            log: DeliveryLog::default(),
            reply: Some(into_payload(reply)),
        })
    }

    pub fn log(&self) -> &DeliveryLog {
        &self.log
    }

    pub fn count(&self) -> usize {
        self.log.count()
    }

    pub async fn messages(&self) -> Vec<AgentMessage> {
        self.log.messages().await
    }

    /// Payloads in delivery order
    pub async fn payloads(&self) -> Vec<Payload> {
        self.messages()
            .await
            .into_iter()
            .map(|m| m.payload().clone())
            .collect()
    }

    pub async fn wait_for(&self, expected: usize, timeout: Duration) -> bool {
        self.log.wait_for(expected, timeout).await
    }

    pub fn shared(self: &Arc<Self>) -> SharedHandler {
        self.clone()
    }
}

#[async_trait]
impl MessageHandler for RecordingHandler {
    async fn handle(&self, message: &AgentMessage) -> HandlerResult {
        self.log.record(message).await;
        Ok(self.reply.clone())
    }
}

/// Replies with the request payload unchanged
#[derive(Debug, Default)]
pub struct EchoHandler {
    log: DeliveryLog,
}

impl EchoHandler {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn count(&self) -> usize {
        self.log.count()
    }
}

#[async_trait]
impl MessageHandler for EchoHandler {
    async fn handle(&self, message: &AgentMessage) -> HandlerResult {
        self.log.record(message).await;
        Ok(Some(message.payload().clone()))
    }
}

/// Fails the first `failures` invocations, then succeeds
///
/// `FailingHandler::always()` never succeeds.
#[derive(Debug)]
pub struct FailingHandler {
    log: DeliveryLog,
    failures: usize,
    error: String,
}

impl FailingHandler {
    pub fn new(failures: usize) -> Arc<Self> {
        Arc::new(Self {
            log: DeliveryLog::default(),
            failures,
            error: "mock handler failure".to_string(),
        })
    }

    pub fn always() -> Arc<Self> {
        Self::new(usize::MAX)
    }

    pub fn with_error(failures: usize, error: impl Into<String>) -> Arc<Self> {
        Arc::new(Self {
            log: DeliveryLog::default(),
            failures,
            error: error.into(),
        })
    }

    /// Total invocations, failed or not
    pub fn attempts(&self) -> usize {
        self.log.count()
    }

    pub async fn messages(&self) -> Vec<AgentMessage> {
        self.log.messages().await
    }

    pub async fn wait_for(&self, expected: usize, timeout: Duration) -> bool {
        self.log.wait_for(expected, timeout).await
    }
}

#[async_trait]
impl MessageHandler for FailingHandler {
    async fn handle(&self, message: &AgentMessage) -> HandlerResult {
        let attempt = self.log.count();
        self.log.record(message).await;
        if attempt < self.failures {
            Err(HandlerError::failed(self.error.clone()))
        } else {
            Ok(None)
        }
    }
}

/// Panics on every invocation
#[derive(Debug, Default)]
pub struct PanickingHandler {
    log: DeliveryLog,
}

impl PanickingHandler {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn attempts(&self) -> usize {
        self.log.count()
    }

    pub async fn wait_for(&self, expected: usize, timeout: Duration) -> bool {
        self.log.wait_for(expected, timeout).await
    }
}

#[async_trait]
impl MessageHandler for PanickingHandler {
    async fn handle(&self, message: &AgentMessage) -> HandlerResult {
        self.log.record(message).await;
        panic!("mock handler panic for {}", message.message_id());
    }
}

/// Sleeps before recording and replying
#[derive(Debug)]
pub struct SlowHandler {
    log: DeliveryLog,
    delay: Duration,
    reply: Option<Payload>,
}

impl SlowHandler {
    pub fn new(delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            log: DeliveryLog::default(),
            delay,
            reply: None,
        })
    }

    pub fn replying(delay: Duration, reply: Value) -> Arc<Self> {
        Arc::new(Self {
            log: DeliveryLog::default(),
            delay,
            reply: Some(into_payload(reply)),
        })
    }

    pub fn count(&self) -> usize {
        self.log.count()
    }

    pub async fn wait_for(&self, expected: usize, timeout: Duration) -> bool {
        self.log.wait_for(expected, timeout).await
    }
}

#[async_trait]
impl MessageHandler for SlowHandler {
    async fn handle(&self, message: &AgentMessage) -> HandlerResult {
        tokio::time::sleep(self.delay).await;
        self.log.record(message).await;
        Ok(self.reply.clone())
    }
}

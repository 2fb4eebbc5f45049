//! Per-message delivery: expiry check, message-type dispatch, retry and dead-lettering
//!
//! Dispatch uses the closed [`DeliveryRoute`] table. Handler failures and
//! panics are absorbed here and turned into retries or dead letters.

use crate::broker::dead_letter::{DeadLetterEntry, DeadLetterReason};
use crate::broker::handler::HandlerError;
use crate::broker::queue::QueuedMessage;
use crate::broker::BrokerShared;
use crate::delivery_span;
use crate::error::{sanitize_error_message, BrokerError};
use crate::protocol::messages::{AgentIdentity, AgentMessage, MessageType};
use chrono::Utc;
use futures::FutureExt;
use std::any::Any;
use std::collections::HashSet;
use std::fmt;
use std::panic::AssertUnwindSafe;
use std::time::Instant;
use tracing::{debug, warn, Instrument};

/// How a message type is handled on delivery
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryRoute {
    /// Invoke the handler; a returned payload becomes a RESPONSE
    Request,
    /// Resolve the pending request; no handler runs
    Response,
    /// Invoke every recipient; return values are ignored
    Notify,
    /// Invoke the handler for logging only; never retried or expired
    Diagnostic,
}

impl DeliveryRoute {
    pub fn for_type(message_type: MessageType) -> Self {
        match message_type {
            MessageType::Request => DeliveryRoute::Request,
            MessageType::Response => DeliveryRoute::Response,
            MessageType::Event
            | MessageType::Broadcast
            | MessageType::ContextShare
            | MessageType::StatusUpdate => DeliveryRoute::Notify,
            MessageType::Error => DeliveryRoute::Diagnostic,
        }
    }

    pub fn checks_ttl(&self) -> bool {
        !matches!(self, DeliveryRoute::Diagnostic)
    }

    pub fn retries(&self) -> bool {
        matches!(self, DeliveryRoute::Request | DeliveryRoute::Notify)
    }
}

/// Per-message delivery state, emitted in logs as `state`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryState {
    Created,
    Queued,
    Dequeued,
    Expired,
    Delivering,
    Delivered,
    Failed,
    Retrying,
    DeadLettered,
}

impl DeliveryState {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeliveryState::Created => "created",
            DeliveryState::Queued => "queued",
            DeliveryState::Dequeued => "dequeued",
            DeliveryState::Expired => "expired",
            DeliveryState::Delivering => "delivering",
            DeliveryState::Delivered => "delivered",
            DeliveryState::Failed => "failed",
            DeliveryState::Retrying => "retrying",
            DeliveryState::DeadLettered => "dead_lettered",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            DeliveryState::Expired | DeliveryState::Delivered | DeliveryState::DeadLettered
        )
    }
}

impl fmt::Display for DeliveryState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outcome counts for one dequeued message
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DeliveryReport {
    pub delivered: usize,
    pub failed: usize,
    pub expired: usize,
    pub retried: usize,
    pub dead_lettered: usize,
}

impl DeliveryReport {
    pub fn merge(&mut self, other: DeliveryReport) {
        self.delivered += other.delivered;
        self.failed += other.failed;
        self.expired += other.expired;
        self.retried += other.retried;
        self.dead_lettered += other.dead_lettered;
    }
}

/// Deliver one dequeued message to all of its recipients
pub(crate) async fn deliver(shared: &BrokerShared, item: QueuedMessage, worker_id: usize) -> DeliveryReport {
    let span = delivery_span!(
        worker_id,
        message_id = %item.message.message_id(),
        message_type = %item.message.message_type(),
        retry_count = item.message.retry_count()
    );
    deliver_inner(shared, item).instrument(span).await
}

async fn deliver_inner(shared: &BrokerShared, item: QueuedMessage) -> DeliveryReport {
    let mut report = DeliveryReport::default();
    let message = &item.message;
    let route = DeliveryRoute::for_type(message.message_type());

    debug!(
        state = %DeliveryState::Dequeued,
        queued_ms = item.enqueued_at.elapsed().as_millis() as u64,
        "Message dequeued"
    );

    if route.checks_ttl() && message.is_expired_at(Utc::now()) {
        expire(shared, message, None, true);
        report.expired += 1;
        report.dead_lettered += 1;
        return report;
    }

    if route == DeliveryRoute::Response {
        resolve_response(shared, message, &mut report);
        return report;
    }

    // Expiry mid fan-out dead-letters each remaining recipient but counts once
    let mut expiry_counted = false;
    for recipient in resolve_recipients(shared, &item) {
        if route.checks_ttl() && message.is_expired_at(Utc::now()) {
            expire(shared, message, Some(&recipient.agent_id), !expiry_counted);
            expiry_counted = true;
            report.expired += 1;
            report.dead_lettered += 1;
            continue;
        }

        let outcome = deliver_to(shared, message, route, &recipient).await;
        report.merge(outcome);
    }

    report
}

/// Recipients for this attempt: retry targets, the registry (broadcast), or the envelope
fn resolve_recipients(shared: &BrokerShared, item: &QueuedMessage) -> Vec<AgentIdentity> {
    let candidates = match &item.targets {
        Some(targets) => targets.clone(),
        None if item.message.is_broadcast() => shared.registry.identities(),
        None => item.message.recipients().to_vec(),
    };

    let mut seen = HashSet::new();
    candidates
        .into_iter()
        .filter(|identity| seen.insert(identity.agent_id.clone()))
        .collect()
}

fn resolve_response(shared: &BrokerShared, message: &AgentMessage, report: &mut DeliveryReport) {
    let started = Instant::now();
    if shared
        .pending
        .resolve(message.correlation_id(), message.payload().clone())
    {
        shared.metrics.message_delivered(started.elapsed());
        shared.metrics.request_completed();
        report.delivered += 1;
        debug!(state = %DeliveryState::Delivered, "Response resolved pending request");
    } else {
        shared.metrics.late_response();
        debug!(
            correlation_id = %message.correlation_id(),
            "Discarding response with no pending request"
        );
    }
}

async fn deliver_to(
    shared: &BrokerShared,
    message: &AgentMessage,
    route: DeliveryRoute,
    recipient: &AgentIdentity,
) -> DeliveryReport {
    let mut report = DeliveryReport::default();

    let Some(registration) = shared.registry.resolve(&recipient.agent_id) else {
        dead_letter(
            shared,
            DeadLetterEntry::new(message.clone(), DeadLetterReason::UnknownRecipient)
                .with_recipient(recipient.agent_id.clone()),
        );
        report.dead_lettered += 1;
        return report;
    };

    debug!(
        state = %DeliveryState::Delivering,
        recipient = %recipient.agent_id,
        "Invoking handler"
    );

    let started = Instant::now();
    let result = match AssertUnwindSafe(registration.handler.handle(message))
        .catch_unwind()
        .await
    {
        Ok(result) => result,
        Err(panic) => Err(HandlerError::Panicked(panic_message(panic.as_ref()))),
    };

    match result {
        Ok(reply) => {
            shared.metrics.message_delivered(started.elapsed());
            report.delivered += 1;
            debug!(
                state = %DeliveryState::Delivered,
                recipient = %recipient.agent_id,
                elapsed_ms = started.elapsed().as_millis() as u64,
                "Delivered"
            );

            if route == DeliveryRoute::Request {
                if let Some(payload) = reply {
                    let response = message.response_from(&registration.identity, payload);
                    shared.queue.push_unbounded(QueuedMessage::new(response));
                    shared.metrics.response_generated();
                }
            }
        }
        Err(err) => {
            shared.metrics.message_failed();
            report.failed += 1;

            if route.retries() {
                handle_failure(shared, message, recipient, &err, &mut report);
            } else {
                warn!(
                    state = %DeliveryState::Failed,
                    recipient = %recipient.agent_id,
                    error = %sanitize_error_message(&err.to_string()),
                    "Diagnostic handler failed"
                );
            }
        }
    }

    report
}

fn handle_failure(
    shared: &BrokerShared,
    message: &AgentMessage,
    recipient: &AgentIdentity,
    err: &HandlerError,
    report: &mut DeliveryReport,
) {
    let config = &shared.config;
    let error_text = sanitize_error_message(&err.to_string());
    let attempt = message.next_attempt();
    let retry_count = attempt.retry_count();

    if retry_count <= config.retry_max_attempts && config.retry_allowed(message.priority()) {
        let delay = config.retry_delay(retry_count);
        warn!(
            state = %DeliveryState::Retrying,
            retry_count,
            delay_ms = delay.as_millis() as u64,
            error = %BrokerError::delivery(&recipient.agent_id, &error_text),
            "Delivery failed, scheduling retry"
        );
        shared
            .queue
            .push_delayed(QueuedMessage::retry_for(attempt, recipient.clone()), delay);
        shared.metrics.message_retried();
        report.retried += 1;
    } else {
        warn!(
            state = %DeliveryState::DeadLettered,
            error = %BrokerError::delivery(&recipient.agent_id, &error_text),
            "Delivery failed, retries exhausted"
        );
        dead_letter(
            shared,
            DeadLetterEntry::new(message.clone(), DeadLetterReason::RetriesExhausted)
                .with_recipient(recipient.agent_id.clone())
                .with_error(error_text),
        );
        report.dead_lettered += 1;
    }
}

fn expire(shared: &BrokerShared, message: &AgentMessage, recipient: Option<&str>, count: bool) {
    if count {
        shared.metrics.message_expired();
    }
    let err = BrokerError::ExpiredMessage {
        message_id: message.message_id().to_string(),
        age_ms: message.age_at(Utc::now()).num_milliseconds(),
        ttl_seconds: message.metadata().ttl_seconds,
    };
    debug!(state = %DeliveryState::Expired, error = %err, "Message expired before delivery");

    let mut entry =
        DeadLetterEntry::new(message.clone(), DeadLetterReason::Expired).with_error(err.to_string());
    if let Some(agent_id) = recipient {
        entry = entry.with_recipient(agent_id);
    }
    dead_letter(shared, entry);
}

fn dead_letter(shared: &BrokerShared, entry: DeadLetterEntry) {
    shared.metrics.message_dead_lettered();
    shared.dead_letters.push(entry);
}

pub(crate) fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

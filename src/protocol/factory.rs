//! Construction helpers for correctly-typed envelopes
//!
//! Upstream collaborators (supervisors, orchestrators) use these instead of
//! assembling envelopes by hand. Priority, TTL and headers can be set through
//! [`AgentMessage::builder`] when the defaults do not fit.

use crate::error::BrokerError;
use crate::protocol::messages::{into_payload, AgentIdentity, AgentMessage, MessageType, Payload};
use serde_json::{json, Value};

/// REQUEST addressed to a single agent; its RESPONSE is correlated by id
pub fn create_request_message(
    sender: &AgentIdentity,
    recipient: &AgentIdentity,
    payload: Value,
) -> AgentMessage {
    AgentMessage::builder(sender.clone(), MessageType::Request)
        .recipient(recipient.clone())
        .payload(payload)
        .build()
}

/// EVENT delivered to the given recipients; handlers' return values are ignored
pub fn create_event_message(
    sender: &AgentIdentity,
    recipients: Vec<AgentIdentity>,
    payload: Value,
) -> AgentMessage {
    AgentMessage::builder(sender.clone(), MessageType::Event)
        .recipients(recipients)
        .payload(payload)
        .build()
}

/// BROADCAST delivered to every agent registered when it is dequeued
pub fn create_broadcast_message(sender: &AgentIdentity, payload: Value) -> AgentMessage {
    AgentMessage::builder(sender.clone(), MessageType::Broadcast)
        .payload(payload)
        .build()
}

/// CONTEXT_SHARE carrying shared working context, wrapped as `{"context": ...}`
pub fn create_context_share_message(
    sender: &AgentIdentity,
    recipients: Vec<AgentIdentity>,
    context: Value,
) -> AgentMessage {
    AgentMessage::builder(sender.clone(), MessageType::ContextShare)
        .recipients(recipients)
        .payload(json!({ "context": context }))
        .build()
}

/// STATUS_UPDATE with a status string merged into `details`
pub fn create_status_update_message(
    sender: &AgentIdentity,
    recipients: Vec<AgentIdentity>,
    status: &str,
    details: Value,
) -> AgentMessage {
    let mut payload: Payload = into_payload(details);
    payload.insert("status".to_string(), Value::String(status.to_string()));

    AgentMessage::builder(sender.clone(), MessageType::StatusUpdate)
        .recipients(recipients)
        .payload_map(payload)
        .build()
}

/// ERROR reporting `error` to `recipient`
///
/// When `in_reply_to` is given, the error joins that message's correlation
/// chain and references it through `reply_to`.
pub fn create_error_message(
    sender: &AgentIdentity,
    recipient: &AgentIdentity,
    error: &BrokerError,
    in_reply_to: Option<&AgentMessage>,
) -> AgentMessage {
    let mut builder = AgentMessage::builder(sender.clone(), MessageType::Error)
        .recipient(recipient.clone())
        .payload_map(error.to_error_payload());

    if let Some(original) = in_reply_to {
        builder = builder
            .correlation_id(original.correlation_id())
            .reply_to(original.message_id())
            .priority(original.priority());
    }

    builder.build()
}

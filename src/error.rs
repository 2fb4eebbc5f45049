//! Error types for the agent broker
//!
//! Delivery-side failures (handler errors, expiry) are absorbed by the broker
//! and recorded in statistics and the dead-letter store; only the variants
//! documented on each facade operation ever reach a caller.

use crate::config::ConfigError;
use crate::protocol::messages::Payload;
use crate::protocol::validation::ValidationError;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use thiserror::Error;

/// Main error type for broker operations
#[derive(Debug, Error)]
pub enum BrokerError {
    #[error("Delivery to '{agent_id}' failed: {message}")]
    Delivery { agent_id: String, message: String },

    #[error("Message {message_id} expired: age {age_ms}ms exceeds ttl {ttl_seconds}s")]
    ExpiredMessage {
        message_id: String,
        age_ms: i64,
        ttl_seconds: u64,
    },

    #[error("Unknown recipient: '{agent_id}' is not registered")]
    UnknownRecipient { agent_id: String },

    #[error("Request {correlation_id} timed out after {timeout_ms}ms")]
    RequestTimeout {
        correlation_id: String,
        timeout_ms: u64,
    },

    #[error("Queue capacity exceeded: {size}/{capacity}")]
    CapacityExceeded { size: usize, capacity: usize },

    #[error("Worker {worker_id} failed: {message}")]
    WorkerFailure { worker_id: usize, message: String },

    #[error("Invalid message: {message}")]
    InvalidMessage { message: String },

    #[error("Invalid topic: {message}")]
    InvalidTopic { message: String },

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),
}

/// Stable error codes carried in ERROR message payloads
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    DeliveryFailed,
    ExpiredMessage,
    UnknownRecipient,
    RequestTimeout,
    CapacityExceeded,
    WorkerFailure,
    InvalidMessage,
    InvalidTopic,
    SerializationError,
    ConfigError,
}

impl BrokerError {
    pub fn delivery<A: Into<String>, S: Into<String>>(agent_id: A, message: S) -> Self {
        Self::Delivery {
            agent_id: agent_id.into(),
            message: message.into(),
        }
    }

    pub fn unknown_recipient<S: Into<String>>(agent_id: S) -> Self {
        Self::UnknownRecipient {
            agent_id: agent_id.into(),
        }
    }

    pub fn request_timeout<S: Into<String>>(correlation_id: S, timeout_ms: u64) -> Self {
        Self::RequestTimeout {
            correlation_id: correlation_id.into(),
            timeout_ms,
        }
    }

    pub fn capacity_exceeded(size: usize, capacity: usize) -> Self {
        Self::CapacityExceeded { size, capacity }
    }

    pub fn worker_failure<S: Into<String>>(worker_id: usize, message: S) -> Self {
        Self::WorkerFailure {
            worker_id,
            message: message.into(),
        }
    }

    pub fn invalid_message<S: Into<String>>(message: S) -> Self {
        Self::InvalidMessage {
            message: message.into(),
        }
    }

    pub fn invalid_topic<S: Into<String>>(message: S) -> Self {
        Self::InvalidTopic {
            message: message.into(),
        }
    }

    pub fn code(&self) -> ErrorCode {
        match self {
            BrokerError::Delivery { .. } => ErrorCode::DeliveryFailed,
            BrokerError::ExpiredMessage { .. } => ErrorCode::ExpiredMessage,
            BrokerError::UnknownRecipient { .. } => ErrorCode::UnknownRecipient,
            BrokerError::RequestTimeout { .. } => ErrorCode::RequestTimeout,
            BrokerError::CapacityExceeded { .. } => ErrorCode::CapacityExceeded,
            BrokerError::WorkerFailure { .. } => ErrorCode::WorkerFailure,
            BrokerError::InvalidMessage { .. } => ErrorCode::InvalidMessage,
            BrokerError::InvalidTopic { .. } => ErrorCode::InvalidTopic,
            BrokerError::Serialization(_) => ErrorCode::SerializationError,
            BrokerError::Config(_) => ErrorCode::ConfigError,
        }
    }

    /// Payload body for an ERROR message: `{"error": {"code", "message"}}`
    ///
    /// The message text is sanitized before it leaves the broker.
    pub fn to_error_payload(&self) -> Payload {
        let mut payload = Payload::new();
        payload.insert(
            "error".to_string(),
            json!({
                "code": self.code(),
                "message": sanitize_error_message(&self.to_string()),
            }),
        );
        payload
    }

    /// True for failures that the broker absorbs rather than surfacing to senders
    pub fn is_delivery_side(&self) -> bool {
        matches!(
            self,
            BrokerError::Delivery { .. }
                | BrokerError::ExpiredMessage { .. }
                | BrokerError::WorkerFailure { .. }
        )
    }
}

impl From<ValidationError> for BrokerError {
    fn from(err: ValidationError) -> Self {
        match err {
            ValidationError::EmptyTopic
            | ValidationError::TopicTooLong(_)
            | ValidationError::InvalidTopicChar(_) => BrokerError::invalid_topic(err.to_string()),
            ValidationError::EmptyAgentId | ValidationError::InvalidAgentIdChar(_) => {
                BrokerError::invalid_message(err.to_string())
            }
        }
    }
}

const MAX_ERROR_MESSAGE_LEN: usize = 500;
const TRUNCATE_SUFFIX: &str = "...[truncated]";

static SECRET_PATTERN: Lazy<Option<Regex>> =
    Lazy::new(|| Regex::new(r"(?i)(password|token|key|secret)[=:]\s*\S+").ok());

static SENSITIVE_PATH_PATTERN: Lazy<Option<Regex>> = Lazy::new(|| {
    Regex::new(r"/[a-zA-Z0-9._/-]+/(secrets?|\.ssh|\.aws|\.config)/[a-zA-Z0-9._/-]+").ok()
});

/// Redact secret-looking values and sensitive paths, then cap the length
///
/// Applied to handler error text before it is stored in dead letters or
/// placed in ERROR payloads.
pub fn sanitize_error_message(message: &str) -> String {
    let mut sanitized = message.to_string();

    if let Some(pattern) = SECRET_PATTERN.as_ref() {
        sanitized = pattern.replace_all(&sanitized, "${1}=***").to_string();
    }

    if let Some(pattern) = SENSITIVE_PATH_PATTERN.as_ref() {
        sanitized = pattern
            .replace_all(&sanitized, "/***REDACTED***/")
            .to_string();
    }

    if sanitized.len() > MAX_ERROR_MESSAGE_LEN {
        let mut cut = MAX_ERROR_MESSAGE_LEN - TRUNCATE_SUFFIX.len();
        while !sanitized.is_char_boundary(cut) {
            cut -= 1;
        }
        sanitized = format!("{}{}", &sanitized[..cut], TRUNCATE_SUFFIX);
    }

    sanitized
}

/// Extract the error code from an ERROR payload built by [`BrokerError::to_error_payload`]
pub fn error_code_of(payload: &Payload) -> Option<ErrorCode> {
    payload
        .get("error")
        .and_then(|e| e.get("code"))
        .cloned()
        .and_then(|code: Value| serde_json::from_value(code).ok())
}

/// Result type for broker operations
pub type BrokerResult<T> = Result<T, BrokerError>;

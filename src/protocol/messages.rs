//! Message envelope types for the agent broker
//!
//! This module defines the envelope routed between agents, the identity of
//! the agents themselves, and the metadata that drives scheduling (priority),
//! expiry (TTL) and request/response correlation.

use crate::error::BrokerError;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::{Map, Value};
use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::hash::{Hash, Hasher};
use std::str::FromStr;
use uuid::Uuid;

/// Structured message body. Always a JSON object on the wire.
pub type Payload = Map<String, Value>;

/// Default time-to-live for new envelopes (5 minutes)
pub const DEFAULT_TTL_SECONDS: u64 = 300;

/// Convert an arbitrary JSON value into a payload
///
/// Objects are used as-is; any other value is wrapped as `{"value": ...}`.
pub fn into_payload(value: Value) -> Payload {
    match value {
        Value::Object(map) => map,
        Value::Null => Payload::new(),
        other => {
            let mut map = Payload::new();
            map.insert("value".to_string(), other);
            map
        }
    }
}

/// Identity of a registered agent
///
/// Two identities are equal when their `agent_id` matches, regardless of
/// the descriptive fields.
///
/// # Examples
/// ```
/// use agent_broker::protocol::AgentIdentity;
///
/// let a = AgentIdentity::new("planner", "supervisor").with_display_name("Planner");
/// let b = AgentIdentity::new("planner", "other");
/// assert_eq!(a, b);
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentIdentity {
    pub agent_id: String,
    pub agent_type: String,
    /// Human-readable name, `agent_name` on the wire
    #[serde(rename = "agent_name")]
    pub display_name: String,
    #[serde(default)]
    pub capabilities: BTreeSet<String>,
}

impl AgentIdentity {
    /// Create an identity whose display name defaults to the agent id
    pub fn new(agent_id: impl Into<String>, agent_type: impl Into<String>) -> Self {
        let agent_id = agent_id.into();
        Self {
            display_name: agent_id.clone(),
            agent_id,
            agent_type: agent_type.into(),
            capabilities: BTreeSet::new(),
        }
    }

    pub fn with_display_name(mut self, display_name: impl Into<String>) -> Self {
        self.display_name = display_name.into();
        self
    }

    pub fn with_capabilities<I, S>(mut self, capabilities: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.capabilities = capabilities.into_iter().map(Into::into).collect();
        self
    }

    /// Case-insensitive capability check
    pub fn has_capability(&self, capability: &str) -> bool {
        self.capabilities
            .iter()
            .any(|c| c.eq_ignore_ascii_case(capability))
    }
}

impl PartialEq for AgentIdentity {
    fn eq(&self, other: &Self) -> bool {
        self.agent_id == other.agent_id
    }
}

impl Eq for AgentIdentity {}

impl Hash for AgentIdentity {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.agent_id.hash(state);
    }
}

/// Scheduling priority. Higher values are serviced first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub enum Priority {
    Low = 1,
    #[default]
    Normal = 2,
    High = 3,
    Urgent = 4,
}

impl Priority {
    pub fn as_str(&self) -> &'static str {
        match self {
            Priority::Low => "low",
            Priority::Normal => "normal",
            Priority::High => "high",
            Priority::Urgent => "urgent",
        }
    }
}

impl From<Priority> for u8 {
    fn from(priority: Priority) -> Self {
        priority as u8
    }
}

impl TryFrom<u8> for Priority {
    type Error = String;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(Priority::Low),
            2 => Ok(Priority::Normal),
            3 => Ok(Priority::High),
            4 => Ok(Priority::Urgent),
            other => Err(format!("priority must be between 1 and 4, got {other}")),
        }
    }
}

impl FromStr for Priority {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "low" => Ok(Priority::Low),
            "normal" => Ok(Priority::Normal),
            "high" => Ok(Priority::High),
            "urgent" => Ok(Priority::Urgent),
            other => other
                .parse::<u8>()
                .map_err(|_| format!("unknown priority '{other}'"))
                .and_then(Priority::try_from),
        }
    }
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// The wire format carries the integer; configuration files may also use names.
impl Serialize for Priority {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u8(u8::from(*self))
    }
}

impl<'de> Deserialize<'de> for Priority {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum PriorityRepr {
            Level(u8),
            Name(String),
        }

        match PriorityRepr::deserialize(deserializer)? {
            PriorityRepr::Level(level) => Priority::try_from(level),
            PriorityRepr::Name(name) => name.parse(),
        }
        .map_err(serde::de::Error::custom)
    }
}

/// Closed set of message kinds understood by the broker
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum MessageType {
    Request,
    Response,
    Event,
    Broadcast,
    ContextShare,
    StatusUpdate,
    Error,
}

impl MessageType {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageType::Request => "request",
            MessageType::Response => "response",
            MessageType::Event => "event",
            MessageType::Broadcast => "broadcast",
            MessageType::ContextShare => "context_share",
            MessageType::StatusUpdate => "status_update",
            MessageType::Error => "error",
        }
    }
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

fn default_ttl_seconds() -> u64 {
    DEFAULT_TTL_SECONDS
}

/// Routing and scheduling metadata attached to every envelope
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MessageMetadata {
    /// Creation time, RFC 3339 on the wire
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub priority: Priority,
    /// Links a REQUEST to its RESPONSE; unique per request chain
    pub correlation_id: String,
    /// Envelope id this message answers
    #[serde(default)]
    pub reply_to: Option<String>,
    #[serde(default = "default_ttl_seconds")]
    pub ttl_seconds: u64,
    #[serde(default)]
    pub retry_count: u32,
    #[serde(default)]
    pub headers: HashMap<String, Value>,
}

impl Default for MessageMetadata {
    fn default() -> Self {
        Self {
            timestamp: Utc::now(),
            priority: Priority::default(),
            correlation_id: Uuid::new_v4().to_string(),
            reply_to: None,
            ttl_seconds: DEFAULT_TTL_SECONDS,
            retry_count: 0,
            headers: HashMap::new(),
        }
    }
}

/// Envelope routed between agents
///
/// Envelopes are immutable once built: fields are read through accessors,
/// and derived envelopes (retry attempts, responses) are new values.
///
/// # Examples
/// ```
/// use agent_broker::protocol::{AgentIdentity, AgentMessage, MessageType, Priority};
/// use serde_json::json;
///
/// let sender = AgentIdentity::new("planner", "supervisor");
/// let worker = AgentIdentity::new("retriever", "search");
///
/// let message = AgentMessage::builder(sender, MessageType::Request)
///     .recipient(worker)
///     .payload(json!({"query": "rust brokers"}))
///     .priority(Priority::High)
///     .ttl_seconds(30)
///     .build();
///
/// assert_eq!(message.priority(), Priority::High);
/// assert_eq!(message.recipients().len(), 1);
/// ```
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AgentMessage {
    message_id: String,
    sender: AgentIdentity,
    #[serde(default)]
    recipients: Vec<AgentIdentity>,
    message_type: MessageType,
    #[serde(default)]
    payload: Payload,
    metadata: MessageMetadata,
}

impl AgentMessage {
    /// Start building a new envelope with a fresh message id
    pub fn builder(sender: AgentIdentity, message_type: MessageType) -> MessageBuilder {
        MessageBuilder::new(sender, message_type)
    }

    pub fn message_id(&self) -> &str {
        &self.message_id
    }

    pub fn sender(&self) -> &AgentIdentity {
        &self.sender
    }

    pub fn recipients(&self) -> &[AgentIdentity] {
        &self.recipients
    }

    pub fn message_type(&self) -> MessageType {
        self.message_type
    }

    pub fn payload(&self) -> &Payload {
        &self.payload
    }

    pub fn metadata(&self) -> &MessageMetadata {
        &self.metadata
    }

    pub fn priority(&self) -> Priority {
        self.metadata.priority
    }

    pub fn correlation_id(&self) -> &str {
        &self.metadata.correlation_id
    }

    pub fn retry_count(&self) -> u32 {
        self.metadata.retry_count
    }

    /// Broadcast messages and messages without recipients go to every registered agent
    pub fn is_broadcast(&self) -> bool {
        self.message_type == MessageType::Broadcast || self.recipients.is_empty()
    }

    /// Age of the envelope relative to its creation timestamp
    pub fn age_at(&self, now: DateTime<Utc>) -> ChronoDuration {
        now.signed_duration_since(self.metadata.timestamp)
    }

    /// True when the age at `now` strictly exceeds the TTL
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        let ttl_micros = i128::from(self.metadata.ttl_seconds) * 1_000_000;
        let age_micros = self
            .age_at(now)
            .num_microseconds()
            .map(i128::from)
            .unwrap_or(i128::MAX);
        age_micros > ttl_micros
    }

    pub fn is_expired(&self) -> bool {
        self.is_expired_at(Utc::now())
    }

    /// Copy of this envelope for the next delivery attempt (same message id)
    pub fn next_attempt(&self) -> AgentMessage {
        let mut attempt = self.clone();
        attempt.metadata.retry_count = self.metadata.retry_count.saturating_add(1);
        attempt
    }

    /// Copy of this envelope under a newly generated correlation id
    pub fn with_fresh_correlation(&self) -> AgentMessage {
        let mut message = self.clone();
        message.metadata.correlation_id = Uuid::new_v4().to_string();
        message
    }

    /// Build the RESPONSE envelope that answers this message
    ///
    /// The response goes from `responder` back to the original sender, keeps
    /// the correlation id and priority, and references this message id.
    pub fn response_from(&self, responder: &AgentIdentity, payload: Payload) -> AgentMessage {
        AgentMessage::builder(responder.clone(), MessageType::Response)
            .recipient(self.sender.clone())
            .payload_map(payload)
            .priority(self.metadata.priority)
            .ttl_seconds(self.metadata.ttl_seconds)
            .correlation_id(self.metadata.correlation_id.clone())
            .reply_to(self.message_id.clone())
            .build()
    }

    /// Structural validation performed before an envelope is enqueued
    pub fn validate(&self) -> Result<(), BrokerError> {
        if self.message_id.trim().is_empty() {
            return Err(BrokerError::invalid_message("message_id must not be empty"));
        }
        if self.metadata.correlation_id.trim().is_empty() {
            return Err(BrokerError::invalid_message(
                "correlation_id must not be empty",
            ));
        }
        crate::protocol::validation::validate_agent_id(&self.sender.agent_id)?;
        for recipient in &self.recipients {
            crate::protocol::validation::validate_agent_id(&recipient.agent_id)?;
        }
        if self.message_type == MessageType::Response && self.metadata.reply_to.is_none() {
            return Err(BrokerError::invalid_message(
                "response messages must reference the request they answer",
            ));
        }
        Ok(())
    }

    /// Serialize to the JSON wire structure
    pub fn to_json(&self) -> Result<Value, BrokerError> {
        Ok(serde_json::to_value(self)?)
    }

    pub fn to_json_string(&self) -> Result<String, BrokerError> {
        Ok(serde_json::to_string(self)?)
    }

    /// Parse from the JSON wire structure
    pub fn from_json(value: Value) -> Result<Self, BrokerError> {
        Ok(serde_json::from_value(value)?)
    }

    pub fn from_json_str(raw: &str) -> Result<Self, BrokerError> {
        Ok(serde_json::from_str(raw)?)
    }
}

/// Fluent construction of [`AgentMessage`]
#[derive(Debug, Clone)]
pub struct MessageBuilder {
    sender: AgentIdentity,
    message_type: MessageType,
    recipients: Vec<AgentIdentity>,
    payload: Payload,
    metadata: MessageMetadata,
}

impl MessageBuilder {
    fn new(sender: AgentIdentity, message_type: MessageType) -> Self {
        Self {
            sender,
            message_type,
            recipients: Vec::new(),
            payload: Payload::new(),
            metadata: MessageMetadata::default(),
        }
    }

    pub fn recipient(mut self, recipient: AgentIdentity) -> Self {
        self.recipients.push(recipient);
        self
    }

    pub fn recipients<I>(mut self, recipients: I) -> Self
    where
        I: IntoIterator<Item = AgentIdentity>,
    {
        self.recipients.extend(recipients);
        self
    }

    /// Set the payload from any JSON value (see [`into_payload`])
    pub fn payload(mut self, payload: Value) -> Self {
        self.payload = into_payload(payload);
        self
    }

    pub fn payload_map(mut self, payload: Payload) -> Self {
        self.payload = payload;
        self
    }

    pub fn priority(mut self, priority: Priority) -> Self {
        self.metadata.priority = priority;
        self
    }

    pub fn ttl_seconds(mut self, ttl_seconds: u64) -> Self {
        self.metadata.ttl_seconds = ttl_seconds;
        self
    }

    pub fn correlation_id(mut self, correlation_id: impl Into<String>) -> Self {
        self.metadata.correlation_id = correlation_id.into();
        self
    }

    pub fn reply_to(mut self, message_id: impl Into<String>) -> Self {
        self.metadata.reply_to = Some(message_id.into());
        self
    }

    pub fn header(mut self, key: impl Into<String>, value: Value) -> Self {
        self.metadata.headers.insert(key.into(), value);
        self
    }

    /// Override the creation timestamp (replaying or aging messages)
    pub fn timestamp(mut self, timestamp: DateTime<Utc>) -> Self {
        self.metadata.timestamp = timestamp;
        self
    }

    pub fn build(self) -> AgentMessage {
        AgentMessage {
            message_id: Uuid::new_v4().to_string(),
            sender: self.sender,
            recipients: self.recipients,
            message_type: self.message_type,
            payload: self.payload,
            metadata: self.metadata,
        }
    }
}

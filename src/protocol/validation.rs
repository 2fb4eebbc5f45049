//! Agent ID and topic name validation
//!
//! Agent ids and pub/sub topic names are plain strings supplied by callers;
//! these checks run before anything reaches the registry.

use thiserror::Error;

/// Longest topic name accepted by the subscription index
pub const MAX_TOPIC_LEN: usize = 256;

pub fn validate_agent_id(agent_id: &str) -> Result<(), ValidationError> {
    if agent_id.is_empty() {
        return Err(ValidationError::EmptyAgentId);
    }

    for ch in agent_id.chars() {
        if !ch.is_ascii_alphanumeric() && ch != '.' && ch != '_' && ch != '-' {
            return Err(ValidationError::InvalidAgentIdChar(ch));
        }
    }

    Ok(())
}

/// Topics are exact-match keys: no whitespace, control characters or wildcards
pub fn validate_topic(topic: &str) -> Result<(), ValidationError> {
    if topic.is_empty() {
        return Err(ValidationError::EmptyTopic);
    }
    if topic.len() > MAX_TOPIC_LEN {
        return Err(ValidationError::TopicTooLong(topic.len()));
    }

    for ch in topic.chars() {
        if ch.is_whitespace() || ch.is_control() || ch == '+' || ch == '#' {
            return Err(ValidationError::InvalidTopicChar(ch));
        }
    }

    Ok(())
}

/// Validation errors for agent ids and topics
#[derive(Debug, Clone, Error, PartialEq)]
pub enum ValidationError {
    #[error("Agent ID cannot be empty")]
    EmptyAgentId,
    #[error("Agent ID contains invalid character: '{0}'")]
    InvalidAgentIdChar(char),
    #[error("Topic cannot be empty")]
    EmptyTopic,
    #[error("Topic is {0} bytes, maximum is 256")]
    TopicTooLong(usize),
    #[error("Topic contains invalid character: {0:?}")]
    InvalidTopicChar(char),
}

//! Handler contract for registered agents
//!
//! A handler receives the envelope and returns an optional payload. For
//! REQUEST messages a returned payload becomes the RESPONSE body; for every
//! other type it is ignored. Immediately-returning and asynchronously
//! completing handlers go through the same trait.

use crate::protocol::messages::{AgentMessage, Payload};
use async_trait::async_trait;
use std::future::Future;
use std::sync::Arc;
use thiserror::Error;

/// Failure reported by (or on behalf of) a handler
#[derive(Debug, Clone, Error, PartialEq)]
pub enum HandlerError {
    #[error("{0}")]
    Failed(String),
    #[error("handler panicked: {0}")]
    Panicked(String),
}

impl HandlerError {
    pub fn failed<S: Into<String>>(message: S) -> Self {
        Self::Failed(message.into())
    }
}

impl From<String> for HandlerError {
    fn from(message: String) -> Self {
        Self::Failed(message)
    }
}

impl From<&str> for HandlerError {
    fn from(message: &str) -> Self {
        Self::Failed(message.to_string())
    }
}

impl From<serde_json::Error> for HandlerError {
    fn from(err: serde_json::Error) -> Self {
        Self::Failed(format!("payload error: {err}"))
    }
}

impl From<crate::error::BrokerError> for HandlerError {
    fn from(err: crate::error::BrokerError) -> Self {
        Self::Failed(err.to_string())
    }
}

pub type HandlerResult = Result<Option<Payload>, HandlerError>;

/// Callable invoked by workers for each delivery to an agent
#[async_trait]
pub trait MessageHandler: Send + Sync {
    async fn handle(&self, message: &AgentMessage) -> HandlerResult;
}

/// Shared handle stored in the registry
pub type SharedHandler = Arc<dyn MessageHandler>;

/// Adapter for async closures taking the envelope by value
pub struct FnHandler<F> {
    f: F,
}

#[async_trait]
impl<F, Fut> MessageHandler for FnHandler<F>
where
    F: Fn(AgentMessage) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = HandlerResult> + Send + 'static,
{
    async fn handle(&self, message: &AgentMessage) -> HandlerResult {
        (self.f)(message.clone()).await
    }
}

/// Adapter for closures that return immediately
pub struct SyncFnHandler<F> {
    f: F,
}

#[async_trait]
impl<F> MessageHandler for SyncFnHandler<F>
where
    F: Fn(&AgentMessage) -> HandlerResult + Send + Sync + 'static,
{
    async fn handle(&self, message: &AgentMessage) -> HandlerResult {
        (self.f)(message)
    }
}

/// Wrap an async closure as a handler
///
/// # Examples
/// ```
/// use agent_broker::broker::handler_fn;
/// use serde_json::json;
///
/// let handler = handler_fn(|message| async move {
///     let x = message.payload().get("x").cloned().unwrap_or_default();
///     Ok(Some(agent_broker::protocol::into_payload(json!({ "echo": x }))))
/// });
/// # let _ = handler;
/// ```
pub fn handler_fn<F, Fut>(f: F) -> SharedHandler
where
    F: Fn(AgentMessage) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = HandlerResult> + Send + 'static,
{
    Arc::new(FnHandler { f })
}

/// Wrap an immediately-returning closure as a handler
pub fn sync_handler_fn<F>(f: F) -> SharedHandler
where
    F: Fn(&AgentMessage) -> HandlerResult + Send + Sync + 'static,
{
    Arc::new(SyncFnHandler { f })
}

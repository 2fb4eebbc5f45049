//! Agent Message Broker
//!
//! An in-process broker that lets autonomous agents exchange typed messages:
//! point-to-point requests with correlated responses, topic publish/subscribe,
//! and broadcast to every registered agent.
//!
//! # Overview
//!
//! - Priority-ordered bounded queue with FIFO tie-breaking
//! - Pool of batching workers with bounded delivery parallelism
//! - Per-message TTL expiry, retry with backoff, and a bounded dead-letter store
//! - Health monitor that replaces failed workers
//! - Statistics snapshot plus an optional HTTP stats endpoint
//!
//! # Quick Start
//!
//! ```no_run
//! use agent_broker::{create_request_message, into_payload, sync_handler_fn};
//! use agent_broker::{AgentIdentity, BrokerConfig, MessageBroker};
//! use serde_json::json;
//! use std::time::Duration;
//!
//! # async fn run() -> agent_broker::BrokerResult<()> {
//! let broker = MessageBroker::new(BrokerConfig::default())?;
//! let a = AgentIdentity::new("agent-a", "client");
//! let b = AgentIdentity::new("agent-b", "calculator");
//!
//! broker.register(a.clone(), sync_handler_fn(|_| Ok(None)))?;
//! broker.register(b.clone(), sync_handler_fn(|_| Ok(Some(into_payload(json!({"y": 2}))))))?;
//! broker.start().await?;
//!
//! let reply = broker
//!     .send_request(create_request_message(&a, &b, json!({"x": 1})), Duration::from_secs(1))
//!     .await?;
//! assert_eq!(reply["y"], json!(2));
//! broker.stop().await;
//! # Ok(())
//! # }
//! ```

pub mod broker;
pub mod config;
pub mod error;
pub mod observability;
pub mod protocol;
pub mod testing;

pub use broker::{
    handler_fn, sync_handler_fn, DeadLetterEntry, DeadLetterReason, HandlerError, HandlerResult,
    MessageBroker, MessageHandler, SharedHandler,
};
pub use config::{BackoffStrategy, BackpressurePolicy, BrokerConfig, ConfigError};
pub use error::{BrokerError, BrokerResult, ErrorCode};
pub use observability::{BrokerStats, StatsServer};
pub use protocol::*;

//! In-process message broker
//!
//! [`MessageBroker`] is the public facade. It owns the registry, priority
//! queue, pending-request table, dead-letter store and metrics, and runs a
//! worker pool plus health monitor between [`MessageBroker::start`] and
//! [`MessageBroker::stop`].
//!
//! # Examples
//! ```no_run
//! use agent_broker::broker::{sync_handler_fn, MessageBroker};
//! use agent_broker::config::BrokerConfig;
//! use agent_broker::protocol::{create_request_message, into_payload, AgentIdentity};
//! use serde_json::json;
//! use std::time::Duration;
//!
//! # async fn demo() -> Result<(), agent_broker::error::BrokerError> {
//! let broker = MessageBroker::new(BrokerConfig::default())?;
//! let planner = AgentIdentity::new("planner", "supervisor");
//! let search = AgentIdentity::new("search", "retriever");
//!
//! broker.register(planner.clone(), sync_handler_fn(|_| Ok(None)))?;
//! broker.register(
//!     search.clone(),
//!     sync_handler_fn(|_| Ok(Some(into_payload(json!({"hits": 3}))))),
//! )?;
//! broker.start().await?;
//!
//! let request = create_request_message(&planner, &search, json!({"q": "rust"}));
//! let reply = broker.send_request(request, Duration::from_secs(5)).await?;
//! assert_eq!(reply["hits"], json!(3));
//!
//! broker.stop().await;
//! # Ok(())
//! # }
//! ```

pub mod dead_letter;
pub mod delivery;
pub mod handler;
pub mod health;
pub mod pending;
pub mod queue;
pub mod registry;
pub mod worker;

pub use dead_letter::{DeadLetterEntry, DeadLetterReason, DeadLetterStore};
pub use delivery::{DeliveryReport, DeliveryRoute, DeliveryState};
pub use handler::{
    handler_fn, sync_handler_fn, HandlerError, HandlerResult, MessageHandler, SharedHandler,
};
pub use health::{HealthCheckSummary, HealthMonitor, WorkerHealthDecision};
pub use pending::PendingRequests;
pub use queue::{MessageQueue, QueuedMessage};
pub use registry::{AgentRegistry, Registration};
pub use worker::{WorkerPool, WorkerProbe, WorkerStats};

use crate::broker_span;
use crate::config::{BackpressurePolicy, BrokerConfig};
use crate::error::{BrokerError, BrokerResult};
use crate::observability::metrics::{BrokerMetrics, BrokerStats, RuntimeGauges};
use crate::protocol::messages::{AgentIdentity, AgentMessage, MessageType, Payload};
use crate::protocol::validation::validate_topic;
use crate::request_span;
use serde_json::{json, Value};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn, Instrument};

/// Time `stop` allows workers to finish their in-flight batch
const STOP_GRACE_PERIOD: Duration = Duration::from_secs(5);

/// State shared by the facade, workers and health monitor
pub(crate) struct BrokerShared {
    pub(crate) config: BrokerConfig,
    pub(crate) registry: AgentRegistry,
    pub(crate) queue: MessageQueue,
    pub(crate) pending: PendingRequests,
    pub(crate) dead_letters: DeadLetterStore,
    pub(crate) metrics: BrokerMetrics,
    /// One entry per worker slot; survives worker replacement and broker restarts
    pub(crate) worker_stats: Vec<Arc<WorkerStats>>,
}

impl BrokerShared {
    pub(crate) fn new(config: BrokerConfig) -> Self {
        let worker_stats = (0..config.num_workers)
            .map(|_| Arc::new(WorkerStats::new()))
            .collect();

        Self {
            registry: AgentRegistry::new(),
            queue: MessageQueue::new(config.max_queue_size),
            pending: PendingRequests::new(),
            dead_letters: DeadLetterStore::new(config.dead_letter_max_size),
            metrics: BrokerMetrics::new(),
            worker_stats,
            config,
        }
    }
}

struct RunningState {
    pool: Arc<WorkerPool>,
    monitor: JoinHandle<()>,
    shutdown_tx: watch::Sender<bool>,
}

struct BrokerInner {
    shared: Arc<BrokerShared>,
    running: Mutex<Option<RunningState>>,
}

/// Public broker facade; cheap to clone, all clones share one broker
#[derive(Clone)]
pub struct MessageBroker {
    inner: Arc<BrokerInner>,
}

impl MessageBroker {
    /// Create a stopped broker after validating `config`
    pub fn new(config: BrokerConfig) -> BrokerResult<Self> {
        config.validate()?;
        Ok(Self {
            inner: Arc::new(BrokerInner {
                shared: Arc::new(BrokerShared::new(config)),
                running: Mutex::new(None),
            }),
        })
    }

    fn shared(&self) -> &BrokerShared {
        &self.inner.shared
    }

    fn running(&self) -> MutexGuard<'_, Option<RunningState>> {
        self.inner.running.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn config(&self) -> &BrokerConfig {
        &self.shared().config
    }

    pub fn is_running(&self) -> bool {
        self.running().is_some()
    }

    /// Start the worker pool and health monitor; no-op when already running
    pub async fn start(&self) -> BrokerResult<()> {
        let mut running = self.running();
        if running.is_some() {
            debug!("Broker already running");
            return Ok(());
        }

        let span = broker_span!(operation = "start");
        let _enter = span.enter();

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let pool = Arc::new(WorkerPool::new(self.inner.shared.clone(), shutdown_rx.clone()));
        pool.start();

        let config = &self.shared().config;
        let monitor = tokio::spawn(
            HealthMonitor::run(
                pool.clone(),
                config.health_check_interval(),
                config.worker_restart_on_failure,
                shutdown_rx,
            )
            .instrument(broker_span!(component = "health_monitor")),
        );

        *running = Some(RunningState {
            pool,
            monitor,
            shutdown_tx,
        });

        info!(
            num_workers = config.num_workers,
            batching = config.enable_batching,
            max_queue_size = config.max_queue_size,
            "Broker started"
        );
        Ok(())
    }

    /// Signal shutdown, let in-flight batches finish, then tear down
    ///
    /// Messages still queued stay in the queue and are delivered if the
    /// broker is started again.
    pub async fn stop(&self) {
        let Some(state) = self.running().take() else {
            return;
        };

        async {
            let _ = state.shutdown_tx.send(true);
            state.pool.join(STOP_GRACE_PERIOD).await;
            if tokio::time::timeout(STOP_GRACE_PERIOD, state.monitor).await.is_err() {
                warn!("Health monitor did not stop in time");
            }
            info!(queued = self.shared().queue.len(), "Broker stopped");
        }
        .instrument(broker_span!(operation = "stop"))
        .await
    }

    /// Install or replace the handler for `identity`
    pub fn register(&self, identity: AgentIdentity, handler: SharedHandler) -> BrokerResult<()> {
        self.shared().registry.register(identity, handler)?;
        Ok(())
    }

    /// Remove an agent and all of its subscriptions
    pub fn unregister(&self, agent_id: &str) -> bool {
        self.shared().registry.unregister(agent_id).is_some()
    }

    pub fn subscribe(&self, agent_id: &str, topic: &str) -> BrokerResult<()> {
        self.shared().registry.subscribe(agent_id, topic)?;
        Ok(())
    }

    pub fn unsubscribe(&self, agent_id: &str, topic: &str) -> BrokerResult<()> {
        self.shared().registry.unsubscribe(agent_id, topic)?;
        Ok(())
    }

    pub fn is_registered(&self, agent_id: &str) -> bool {
        self.shared().registry.is_registered(agent_id)
    }

    pub fn registered_agents(&self) -> Vec<AgentIdentity> {
        self.shared().registry.identities()
    }

    pub fn subscribers(&self, topic: &str) -> Vec<AgentIdentity> {
        self.shared().registry.subscribers(topic)
    }

    /// Enqueue under the configured backpressure policy
    async fn enqueue(&self, item: QueuedMessage) -> BrokerResult<()> {
        let shared = self.shared();
        let message_id = item.message.message_id().to_string();

        let result = match shared.config.backpressure {
            BackpressurePolicy::Reject => shared.queue.try_push(item),
            BackpressurePolicy::Block => {
                shared
                    .queue
                    .push_wait(item, shared.config.send_timeout())
                    .await
            }
        };

        match &result {
            Ok(()) => {
                shared.metrics.message_sent();
                debug!(message_id = %message_id, state = %DeliveryState::Queued, "Message enqueued");
            }
            Err(err) => {
                shared.metrics.message_rejected();
                warn!(message_id = %message_id, error = %err, "Message rejected");
            }
        }

        shared.metrics.observe_queue(
            shared.queue.len(),
            shared.queue.capacity(),
            shared.config.queue_warning_threshold,
        );
        result
    }

    /// Fire-and-forget send
    ///
    /// Returns true once the message is enqueued; false if it is malformed or
    /// the queue is full. Delivery outcomes are visible only through
    /// statistics and dead letters.
    pub async fn send(&self, message: AgentMessage) -> bool {
        if let Err(err) = message.validate() {
            warn!(message_id = %message.message_id(), error = %err, "Refusing invalid message");
            return false;
        }
        debug!(message_id = %message.message_id(), state = %DeliveryState::Created, "Sending message");
        self.enqueue(QueuedMessage::new(message)).await.is_ok()
    }

    /// Send a REQUEST and wait for the correlated RESPONSE payload
    ///
    /// The envelope is re-stamped with a fresh correlation id before it is
    /// enqueued, so a late reply to an earlier call with the same envelope
    /// never resolves this one. Fails with `InvalidMessage` for non-REQUEST
    /// or malformed envelopes, `CapacityExceeded` if the queue rejects it,
    /// and `RequestTimeout` if no response arrives within `timeout`.
    ///
    /// Dropping the returned future removes the pending request.
    pub async fn send_request(
        &self,
        message: AgentMessage,
        timeout: Duration,
    ) -> BrokerResult<Payload> {
        if message.message_type() != MessageType::Request {
            return Err(BrokerError::invalid_message(format!(
                "send_request requires a request message, got {}",
                message.message_type()
            )));
        }
        message.validate()?;

        let message = message.with_fresh_correlation();
        let correlation_id = message.correlation_id().to_string();
        let span = request_span!(
            correlation_id = %correlation_id,
            timeout_ms = timeout.as_millis() as u64
        );

        self.await_response(message, &correlation_id, timeout)
            .instrument(span)
            .await
    }

    async fn await_response(
        &self,
        message: AgentMessage,
        correlation_id: &str,
        timeout: Duration,
    ) -> BrokerResult<Payload> {
        let shared = self.shared();
        let mut rx = shared.pending.register(correlation_id)?;
        let _guard = shared.pending.guard(correlation_id);

        self.enqueue(QueuedMessage::new(message)).await?;

        let timed_out = || {
            shared.metrics.request_timed_out();
            warn!("Request timed out");
            BrokerError::request_timeout(correlation_id, timeout.as_millis() as u64)
        };

        match tokio::time::timeout(timeout, &mut rx).await {
            Ok(Ok(payload)) => Ok(payload),
            Ok(Err(_)) => Err(timed_out()),
            Err(_) => {
                if shared.pending.cancel(correlation_id) {
                    return Err(timed_out());
                }
                // Resolved between the timer firing and the cancel
                rx.try_recv().map_err(|_| timed_out())
            }
        }
    }

    /// `send_request` with the configured default timeout
    pub async fn send_request_default(&self, message: AgentMessage) -> BrokerResult<Payload> {
        let timeout = self.shared().config.default_request_timeout();
        self.send_request(message, timeout).await
    }

    /// Publish `data` to the current subscribers of `topic`
    ///
    /// Builds one EVENT with payload `{"topic": topic, "data": data}` and
    /// returns the number of recipients. With no subscribers nothing is
    /// enqueued and `Ok(0)` is returned.
    pub async fn publish(
        &self,
        topic: &str,
        sender: &AgentIdentity,
        data: Value,
    ) -> BrokerResult<usize> {
        validate_topic(topic)?;
        let shared = self.shared();

        let recipients = shared.registry.subscribers(topic);
        if recipients.is_empty() {
            shared.metrics.publish_without_subscribers();
            debug!(topic = %topic, "Publish with no subscribers");
            return Ok(0);
        }

        let count = recipients.len();
        let event = AgentMessage::builder(sender.clone(), MessageType::Event)
            .recipients(recipients)
            .payload(json!({ "topic": topic, "data": data }))
            .build();
        event.validate()?;

        self.enqueue(QueuedMessage::new(event)).await?;
        shared.metrics.event_published();
        debug!(topic = %topic, recipients = count, "Published event");
        Ok(count)
    }

    /// Statistics snapshot
    pub fn stats(&self) -> BrokerStats {
        let shared = self.shared();
        let running = self.is_running();

        let workers = shared
            .worker_stats
            .iter()
            .enumerate()
            .map(|(worker_id, stats)| stats.snapshot(worker_id))
            .collect();

        shared.metrics.snapshot(RuntimeGauges {
            running,
            agents_registered: shared.registry.len(),
            topics: shared.registry.topic_count(),
            queue_size: shared.queue.len(),
            queue_capacity: shared.queue.capacity(),
            queue_warning_threshold: shared.config.queue_warning_threshold,
            pending_requests: shared.pending.len(),
            dead_letters: shared.dead_letters.len(),
            workers,
        })
    }

    /// Dead letters, oldest first
    pub fn dead_letters(&self) -> Vec<DeadLetterEntry> {
        self.shared().dead_letters.snapshot()
    }

    pub fn clear_dead_letters(&self) -> usize {
        self.shared().dead_letters.clear()
    }

    /// Flag a worker as unhealthy so the health monitor replaces it
    ///
    /// Returns false when the broker is stopped or the id is out of range.
    pub fn mark_worker_unhealthy(&self, worker_id: usize, reason: &str) -> bool {
        let pool = self.running().as_ref().map(|state| state.pool.clone());
        pool.is_some_and(|pool| pool.mark_unhealthy(worker_id, reason))
    }

    /// Run one health check immediately instead of waiting for the interval
    pub fn check_workers_now(&self) -> Option<HealthCheckSummary> {
        let pool = self.running().as_ref().map(|state| state.pool.clone())?;
        Some(HealthMonitor::check_once(
            &pool,
            self.shared().config.worker_restart_on_failure,
        ))
    }
}

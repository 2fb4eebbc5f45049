//! Agent registry and topic subscription index
//!
//! Registrations and subscriptions live behind one lock, so unregistering an
//! agent and dropping its subscriptions is a single atomic step with respect
//! to concurrent deliveries and publishes.

use crate::broker::handler::SharedHandler;
use crate::error::{BrokerError, BrokerResult};
use crate::protocol::messages::AgentIdentity;
use crate::protocol::validation::{validate_agent_id, validate_topic};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};
use tracing::{debug, info};

/// Identity plus handler for one registered agent
#[derive(Clone)]
pub struct Registration {
    pub identity: AgentIdentity,
    pub handler: SharedHandler,
}

impl fmt::Debug for Registration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Registration")
            .field("identity", &self.identity)
            .finish_non_exhaustive()
    }
}

#[derive(Default)]
struct RegistryState {
    /// agent_id -> registration (ordered so broadcast fan-out is deterministic)
    agents: BTreeMap<String, Registration>,
    /// topic -> subscribed agent ids
    topics: BTreeMap<String, BTreeSet<String>>,
}

/// Thread-safe registry of agents and their topic subscriptions
#[derive(Default)]
pub struct AgentRegistry {
    state: RwLock<RegistryState>,
}

impl AgentRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> RwLockReadGuard<'_, RegistryState> {
        self.state.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, RegistryState> {
        self.state.write().unwrap_or_else(|e| e.into_inner())
    }

    /// Install or replace the handler for `identity.agent_id`
    ///
    /// Existing subscriptions are keyed by agent id and are left untouched.
    /// Returns true when the agent was not previously registered.
    pub fn register(&self, identity: AgentIdentity, handler: SharedHandler) -> BrokerResult<bool> {
        validate_agent_id(&identity.agent_id)?;
        let agent_id = identity.agent_id.clone();

        let mut state = self.write();
        let is_new = state
            .agents
            .insert(agent_id.clone(), Registration { identity, handler })
            .is_none();

        if is_new {
            info!(agent_id = %agent_id, "Registered agent");
        } else {
            info!(agent_id = %agent_id, "Replaced handler for registered agent");
        }
        Ok(is_new)
    }

    /// Remove an agent and every subscription it holds
    pub fn unregister(&self, agent_id: &str) -> Option<AgentIdentity> {
        let mut state = self.write();
        let removed = state.agents.remove(agent_id)?;

        state.topics.retain(|_, subscribers| {
            subscribers.remove(agent_id);
            !subscribers.is_empty()
        });

        info!(agent_id = %agent_id, "Unregistered agent");
        Some(removed.identity)
    }

    pub fn subscribe(&self, agent_id: &str, topic: &str) -> BrokerResult<bool> {
        validate_topic(topic)?;

        let mut state = self.write();
        if !state.agents.contains_key(agent_id) {
            return Err(BrokerError::unknown_recipient(agent_id));
        }

        let added = state
            .topics
            .entry(topic.to_string())
            .or_default()
            .insert(agent_id.to_string());

        debug!(agent_id = %agent_id, topic = %topic, added, "Subscribed");
        Ok(added)
    }

    pub fn unsubscribe(&self, agent_id: &str, topic: &str) -> BrokerResult<bool> {
        validate_topic(topic)?;

        let mut state = self.write();
        if !state.agents.contains_key(agent_id) {
            return Err(BrokerError::unknown_recipient(agent_id));
        }

        let removed = match state.topics.get_mut(topic) {
            Some(subscribers) => {
                let removed = subscribers.remove(agent_id);
                if subscribers.is_empty() {
                    state.topics.remove(topic);
                }
                removed
            }
            None => false,
        };

        debug!(agent_id = %agent_id, topic = %topic, removed, "Unsubscribed");
        Ok(removed)
    }

    /// Registration for `agent_id` as of this instant
    pub fn resolve(&self, agent_id: &str) -> Option<Registration> {
        self.read().agents.get(agent_id).cloned()
    }

    /// Current subscribers of `topic`, ordered by agent id
    pub fn subscribers(&self, topic: &str) -> Vec<AgentIdentity> {
        let state = self.read();
        state
            .topics
            .get(topic)
            .map(|ids| {
                ids.iter()
                    .filter_map(|id| state.agents.get(id))
                    .map(|r| r.identity.clone())
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Every registered identity, ordered by agent id
    pub fn identities(&self) -> Vec<AgentIdentity> {
        self.read()
            .agents
            .values()
            .map(|r| r.identity.clone())
            .collect()
    }

    pub fn topics_for(&self, agent_id: &str) -> Vec<String> {
        self.read()
            .topics
            .iter()
            .filter(|(_, ids)| ids.contains(agent_id))
            .map(|(topic, _)| topic.clone())
            .collect()
    }

    pub fn is_registered(&self, agent_id: &str) -> bool {
        self.read().agents.contains_key(agent_id)
    }

    pub fn len(&self) -> usize {
        self.read().agents.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn topic_count(&self) -> usize {
        self.read().topics.len()
    }
}

//! Agent runtime: lifecycle, message intake, and status for a single
//! registered participant.
//!
//! Behavior is supplied by implementors of [`AgentBehavior`]; [`Agent`]
//! wraps that behavior with the coordination concerns every agent needs
//! regardless of what it does — a capability set, a status machine, a
//! bounded message history, and a lock that serializes message
//! processing. The registry and workflow manager only ever see agents
//! through the object-safe [`AgentHandle`] trait, so a single
//! `Vec<Arc<dyn AgentHandle>>` can hold arbitrarily different behaviors.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::sync::OnceLock;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, instrument, warn};

use crate::capability::{Capability, CapabilityKey, CapabilitySet};
use crate::config::RuntimeConfig;
use crate::error::{CoreError, CoreResult};
use crate::types::{AgentId, MessageId, RegistrationIndex};

/// Default history cap for agents built without an explicit `RuntimeConfig`.
const DEFAULT_MAX_HISTORY: usize = 256;

/// Lifecycle status of an agent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AgentStatus {
    /// Registered and idle, ready for work.
    Idle,
    /// Currently inside `process_message`.
    Busy,
    /// The last operation failed; needs recovery before reuse.
    Error,
    /// Unregistered or shut down.
    Offline,
    /// Actively engaged in a long-running workflow step.
    Active,
}

/// An immutable message passed between agents.
///
/// Construction validates that both `sender_id` and `recipient_id` are
/// present; since [`AgentId`] itself cannot be empty, the only way this
/// fails today is in external deserialization paths that bypass the
/// constructor, which is why `try_new` still exists as the supported
/// entry point.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentMessage {
    /// Unique id for this message.
    pub id: MessageId,
    /// The agent that sent the message.
    pub sender_id: AgentId,
    /// The agent the message is addressed to.
    pub recipient_id: AgentId,
    /// Opaque payload.
    pub content: serde_json::Value,
    /// When the message was constructed.
    pub timestamp: DateTime<Utc>,
    /// A free-form tag describing the message's purpose.
    pub message_type: String,
    /// Free-form metadata.
    pub metadata: HashMap<String, serde_json::Value>,
}

impl AgentMessage {
    /// Builds a validated message.
    ///
    /// # Errors
    /// Returns [`CoreError::RouteFailed`] if sender or recipient is
    /// effectively empty (only reachable via manual struct construction
    /// elsewhere in the process, since [`AgentId`] itself forbids empty
    /// strings).
    pub fn try_new(
        sender_id: AgentId,
        recipient_id: AgentId,
        content: serde_json::Value,
        message_type: impl Into<String>,
    ) -> CoreResult<Self> {
        if sender_id.as_ref().is_empty() || recipient_id.as_ref().is_empty() {
            return Err(CoreError::RouteFailed(
                "message requires both sender and recipient".to_string(),
            ));
        }
        Ok(Self {
            id: MessageId::generate(),
            sender_id,
            recipient_id,
            content,
            timestamp: Utc::now(),
            message_type: message_type.into(),
            metadata: HashMap::new(),
        })
    }
}

/// A snapshot of an agent's current state, returned by `get_status`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusReport {
    /// Current lifecycle status.
    pub status: AgentStatus,
    /// Currently advertised capabilities.
    pub capabilities: Vec<Capability>,
    /// Number of messages processed since the last `shutdown`.
    pub message_count: usize,
    /// Timestamp of the most recent processed message, if any.
    pub last_message_at: Option<DateTime<Utc>>,
}

/// The behavior an agent implementation supplies; everything else
/// (status, history, locking) is handled by [`Agent`] itself.
#[async_trait]
pub trait AgentBehavior: Send + Sync {
    /// Handles one message, returning the response payload.
    ///
    /// # Errors
    /// Any error returned here is wrapped in
    /// [`CoreError::ProcessingFailed`] and causes the agent to transition
    /// to [`AgentStatus::Error`].
    async fn process(&self, message: &AgentMessage) -> CoreResult<serde_json::Value>;

    /// Whether this behavior supports the typed `execute` interface in
    /// addition to `process_message`. Workflow steps prefer `execute`
    /// when available.
    fn has_typed_execute(&self) -> bool {
        false
    }

    /// Executes a workflow step payload directly, bypassing message
    /// construction. Only called when `has_typed_execute` returns `true`.
    ///
    /// # Errors
    /// Returns [`CoreError::ProcessingFailed`] by default, since the
    /// default behavior does not support typed execution.
    async fn execute(&self, _payload: &serde_json::Value) -> CoreResult<serde_json::Value> {
        Err(CoreError::ProcessingFailed {
            cause: "typed execute not supported by this agent".to_string(),
        })
    }
}

/// Object-safe view of an agent used by the registry, router, and
/// workflow manager. Implemented generically by [`Agent<B>`].
#[async_trait]
pub trait AgentHandle: Send + Sync {
    /// This agent's id.
    fn id(&self) -> &AgentId;
    /// A free-form type tag (e.g. `"sensor"`, `"coordinator"`).
    fn agent_type(&self) -> &str;
    /// Idempotently initializes the agent's capability set.
    async fn initialize(&self, caps: Vec<Capability>) -> CoreResult<()>;
    /// Current capability snapshot.
    async fn capabilities(&self) -> CoreResult<Vec<Capability>>;
    /// Adds a capability under the agent's lock.
    async fn add_capability(&self, cap: Capability) -> CoreResult<()>;
    /// Removes a capability under the agent's lock.
    async fn remove_capability(&self, cap: &Capability) -> CoreResult<()>;
    /// Tests whether this agent currently advertises `key`.
    async fn has_capability<'a>(&self, key: CapabilityKey<'a>) -> CoreResult<bool>;
    /// Dispatches a message, serialized by the agent's coordination lock.
    async fn process_message(&self, message: AgentMessage) -> CoreResult<serde_json::Value>;
    /// Whether this agent prefers the typed `execute` interface.
    fn has_typed_execute(&self) -> bool;
    /// Executes a workflow step payload directly.
    async fn execute(&self, payload: &serde_json::Value) -> CoreResult<serde_json::Value>;
    /// Current lifecycle status.
    async fn status(&self) -> AgentStatus;
    /// Transitions the agent to a new status.
    async fn set_status(&self, status: AgentStatus);
    /// A snapshot suitable for external reporting.
    async fn status_report(&self) -> CoreResult<StatusReport>;
    /// Clears history, marks the agent offline.
    async fn shutdown(&self);
    /// Agents this one names as dependencies (run-before relationships).
    fn dependencies(&self) -> &[AgentId];
    /// Whether this agent is a test-only fixture, filtered out of
    /// selection when real candidates exist.
    fn is_test_only(&self) -> bool;
    /// Whether this agent fills the `monitoring` role for selection.
    fn is_monitor(&self) -> bool;
    /// Registration order, assigned once by the registry.
    fn registration_index(&self) -> Option<RegistrationIndex>;
    /// Assigns the registration order; only the registry calls this, and
    /// only once.
    fn set_registration_index(&self, index: RegistrationIndex);
}

/// The default, generic agent: coordination plumbing plus an injected
/// [`AgentBehavior`].
pub struct Agent<B: AgentBehavior> {
    id: AgentId,
    agent_type: String,
    capabilities: CapabilitySet,
    status: RwLock<AgentStatus>,
    history: Mutex<VecDeque<(MessageId, DateTime<Utc>)>>,
    max_history: usize,
    coordination_lock: Mutex<()>,
    behavior: B,
    dependencies: Vec<AgentId>,
    test_only: bool,
    monitor: bool,
    registration_index: OnceLock<RegistrationIndex>,
}

impl<B: AgentBehavior> Agent<B> {
    /// Builds a new agent wrapping `behavior`. The agent starts `Offline`
    /// until `initialize` is called (normally by the registry during
    /// registration).
    pub fn new(id: AgentId, agent_type: impl Into<String>, behavior: B) -> Self {
        Self {
            id,
            agent_type: agent_type.into(),
            capabilities: CapabilitySet::new(),
            status: RwLock::new(AgentStatus::Offline),
            history: Mutex::new(VecDeque::new()),
            max_history: DEFAULT_MAX_HISTORY,
            coordination_lock: Mutex::new(()),
            behavior,
            dependencies: Vec::new(),
            test_only: false,
            monitor: false,
            registration_index: OnceLock::new(),
        }
    }

    /// Marks this agent as advertising the `monitoring` role for
    /// selection purposes (see `WorkflowManager` selection policy step 1).
    #[must_use]
    pub fn as_monitor(mut self) -> Self {
        self.monitor = true;
        self
    }

    /// Marks this agent as a test-only fixture (selection policy step 3).
    #[must_use]
    pub fn as_test_only(mut self) -> Self {
        self.test_only = true;
        self
    }

    /// Declares agents this one depends on (selection policy step 2).
    #[must_use]
    pub fn with_dependencies(mut self, deps: Vec<AgentId>) -> Self {
        self.dependencies = deps;
        self
    }

    /// Caps the number of retained history entries.
    #[must_use]
    pub fn with_max_history(mut self, max_history: usize) -> Self {
        self.max_history = max_history;
        self
    }

    /// Applies the runtime's configured history cap. Callers that hold a
    /// `RuntimeConfig` (the workflow manager spawning a phantom worker, a
    /// host application wiring up its own agents) should chain this onto
    /// `Agent::new` instead of hardcoding a cap.
    #[must_use]
    pub fn with_config(self, config: &RuntimeConfig) -> Self {
        self.with_max_history(config.max_history)
    }
}

#[async_trait]
impl<B: AgentBehavior> AgentHandle for Agent<B> {
    fn id(&self) -> &AgentId {
        &self.id
    }

    fn agent_type(&self) -> &str {
        &self.agent_type
    }

    #[instrument(skip(self, caps), fields(agent_id = %self.id))]
    async fn initialize(&self, caps: Vec<Capability>) -> CoreResult<()> {
        self.capabilities.initialize(caps).await;
        *self.status.write().await = AgentStatus::Idle;
        debug!("agent initialized");
        Ok(())
    }

    async fn capabilities(&self) -> CoreResult<Vec<Capability>> {
        self.capabilities.snapshot().await
    }

    async fn add_capability(&self, cap: Capability) -> CoreResult<()> {
        self.capabilities.add(cap).await?;
        Ok(())
    }

    async fn remove_capability(&self, cap: &Capability) -> CoreResult<()> {
        self.capabilities.remove(cap).await?;
        Ok(())
    }

    async fn has_capability<'a>(&self, key: CapabilityKey<'a>) -> CoreResult<bool> {
        self.capabilities.has(key).await
    }

    #[instrument(skip(self, message), fields(agent_id = %self.id, message_id = %message.id))]
    async fn process_message(&self, message: AgentMessage) -> CoreResult<serde_json::Value> {
        let _guard = self.coordination_lock.lock().await;
        *self.status.write().await = AgentStatus::Busy;

        let result = self.behavior.process(&message).await;

        let mut history = self.history.lock().await;
        history.push_back((message.id, message.timestamp));
        while history.len() > self.max_history {
            history.pop_front();
        }
        drop(history);

        match result {
            Ok(value) => {
                *self.status.write().await = AgentStatus::Idle;
                Ok(value)
            }
            Err(err) => {
                warn!(error = %err, "agent failed to process message");
                *self.status.write().await = AgentStatus::Error;
                Err(CoreError::ProcessingFailed {
                    cause: err.to_string(),
                })
            }
        }
    }

    fn has_typed_execute(&self) -> bool {
        self.behavior.has_typed_execute()
    }

    async fn execute(&self, payload: &serde_json::Value) -> CoreResult<serde_json::Value> {
        let _guard = self.coordination_lock.lock().await;
        *self.status.write().await = AgentStatus::Active;
        let result = self.behavior.execute(payload).await;
        *self.status.write().await = match &result {
            Ok(_) => AgentStatus::Idle,
            Err(_) => AgentStatus::Error,
        };
        result
    }

    async fn status(&self) -> AgentStatus {
        *self.status.read().await
    }

    async fn set_status(&self, status: AgentStatus) {
        *self.status.write().await = status;
    }

    async fn status_report(&self) -> CoreResult<StatusReport> {
        let history = self.history.lock().await;
        Ok(StatusReport {
            status: *self.status.read().await,
            capabilities: self.capabilities.snapshot().await?,
            message_count: history.len(),
            last_message_at: history.back().map(|(_, ts)| *ts),
        })
    }

    async fn shutdown(&self) {
        self.history.lock().await.clear();
        *self.status.write().await = AgentStatus::Offline;
    }

    fn dependencies(&self) -> &[AgentId] {
        &self.dependencies
    }

    fn is_test_only(&self) -> bool {
        self.test_only
    }

    fn is_monitor(&self) -> bool {
        self.monitor
    }

    fn registration_index(&self) -> Option<RegistrationIndex> {
        self.registration_index.get().copied()
    }

    fn set_registration_index(&self, index: RegistrationIndex) {
        let _ = self.registration_index.set(index);
    }
}

/// A behavior that always fails, used by tests exercising the recovery
/// engine (the reference system's `should_fail` testability hook,
/// expressed here as an explicit constructor rather than a branch on
/// message content).
pub struct AlwaysFails;

#[async_trait]
impl AgentBehavior for AlwaysFails {
    async fn process(&self, _message: &AgentMessage) -> CoreResult<serde_json::Value> {
        Err(CoreError::ProcessingFailed {
            cause: "simulated failure".to_string(),
        })
    }
}

/// A behavior that echoes its input, useful as a minimal generic worker
/// (see the workflow manager's phantom-worker fallback).
pub struct Echo;

#[async_trait]
impl AgentBehavior for Echo {
    async fn process(&self, message: &AgentMessage) -> CoreResult<serde_json::Value> {
        Ok(message.content.clone())
    }

    fn has_typed_execute(&self) -> bool {
        true
    }

    async fn execute(&self, payload: &serde_json::Value) -> CoreResult<serde_json::Value> {
        Ok(payload.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capability::CapabilityKind;

    fn agent_id(s: &str) -> AgentId {
        AgentId::try_new(s.to_string()).unwrap()
    }

    #[tokio::test]
    async fn process_message_round_trip_transitions_idle_busy_idle() {
        let agent = Agent::new(agent_id("echo"), "worker", Echo);
        agent
            .initialize(vec![Capability::new(CapabilityKind::MessageProcessing)])
            .await
            .unwrap();
        assert_eq!(agent.status().await, AgentStatus::Idle);

        let msg = AgentMessage::try_new(
            agent_id("caller"),
            agent_id("echo"),
            serde_json::json!({"hello": "world"}),
            "ping",
        )
        .unwrap();
        let response = agent.process_message(msg).await.unwrap();
        assert_eq!(response, serde_json::json!({"hello": "world"}));
        assert_eq!(agent.status().await, AgentStatus::Idle);
    }

    #[tokio::test]
    async fn failing_behavior_transitions_to_error() {
        let agent = Agent::new(agent_id("broken"), "worker", AlwaysFails);
        agent.initialize(vec![]).await.unwrap();
        let msg = AgentMessage::try_new(
            agent_id("caller"),
            agent_id("broken"),
            serde_json::json!(null),
            "ping",
        )
        .unwrap();
        let result = agent.process_message(msg).await;
        assert!(result.is_err());
        assert_eq!(agent.status().await, AgentStatus::Error);
    }

    #[test]
    fn message_requires_sender_and_recipient() {
        // AgentId itself forbids empty strings, so the only way to hit
        // this path is constructing AgentMessage manually; try_new
        // remains the supported, validating constructor.
        assert!(AgentId::try_new(String::new()).is_err());
    }
}

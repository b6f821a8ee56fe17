//! `AgentRegistry`: the agent directory and capability index.
//!
//! Grounded in this codebase's `message_router/implementations/agent_registry.rs`
//! (the `DashMap`-per-map, per-kind capability index with empty-bucket
//! cleanup on deregistration) and in the reference system's
//! `agent_registry.py` (rollback-on-failure registration, capability
//! normalization, the 30-second hard deadline on recovery). Lock
//! ordering follows the top-level → per-agent → per-kind policy recorded
//! in DESIGN.md to avoid deadlock between concurrent register/unregister
//! calls touching overlapping capability kinds.

use async_trait::async_trait;
use dashmap::DashMap;
use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use tokio::sync::{Mutex, RwLock};
use tokio::time::{timeout, Duration};
use tracing::{debug, instrument, warn};

use crate::agent::{AgentHandle, AgentMessage, AgentStatus};
use crate::capability::{Capability, CapabilityKind};
use crate::config::RuntimeConfig;
use crate::error::{CoreError, CoreResult};
use crate::notifier::WorkflowNotifier;
use crate::recovery::RecoveryStrategyEngine;
use crate::types::{AgentId, RegistrationIndex};

/// A collaborator notified of registry lifecycle events.
///
/// Held as a `Weak` reference by the registry (see the design notes on
/// breaking the registry/notifier/workflow-manager cycle) so that
/// registering an observer never extends its lifetime past its owner's.
/// Observer errors are swallowed and logged; they must never affect
/// registration or unregistration.
#[async_trait]
pub trait RegistryObserver: Send + Sync {
    /// Called after an agent is successfully registered.
    async fn on_agent_registered(&self, agent_id: &AgentId) {
        let _ = agent_id;
    }
    /// Called after an agent is unregistered.
    async fn on_agent_unregistered(&self, agent_id: &AgentId) {
        let _ = agent_id;
    }
    /// Called after an agent's capabilities change.
    async fn on_capability_updated(&self, agent_id: &AgentId, capabilities: &[Capability]) {
        let _ = (agent_id, capabilities);
    }
}

/// Result of `validate_capabilities`.
#[derive(Debug, Clone, Default)]
pub struct CapabilityValidation {
    /// Capability kinds that have at least one capable agent.
    pub available: Vec<String>,
    /// Capability kinds with no capable agent.
    pub missing: Vec<String>,
}

struct CapabilityLock {
    index: RwLock<HashSet<AgentId>>,
}

/// The agent directory: agents, their capability index, and registry
/// observers.
pub struct AgentRegistry {
    agents: DashMap<AgentId, Arc<dyn AgentHandle>>,
    capability_index: DashMap<String, Arc<CapabilityLock>>,
    observers: RwLock<Vec<Weak<dyn RegistryObserver>>>,
    registration_counter: AtomicU64,
    notifier: WorkflowNotifier,
    recovery: Arc<RecoveryStrategyEngine>,
    recovery_locks: DashMap<AgentId, Arc<Mutex<()>>>,
    config: RuntimeConfig,
}

impl AgentRegistry {
    /// Builds an empty registry backed by `notifier` for lifecycle events,
    /// `recovery` for `recover_agent`, and `config` for its recovery
    /// deadline.
    #[must_use]
    pub fn new(notifier: WorkflowNotifier, recovery: Arc<RecoveryStrategyEngine>, config: RuntimeConfig) -> Self {
        Self {
            agents: DashMap::new(),
            capability_index: DashMap::new(),
            observers: RwLock::new(Vec::new()),
            registration_counter: AtomicU64::new(0),
            notifier,
            recovery,
            recovery_locks: DashMap::new(),
            config,
        }
    }

    fn recovery_lock(&self, agent_id: &AgentId) -> Arc<Mutex<()>> {
        self.recovery_locks
            .entry(agent_id.clone())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    fn bucket(&self, kind: &str) -> Arc<CapabilityLock> {
        self.capability_index
            .entry(kind.to_string())
            .or_insert_with(|| {
                Arc::new(CapabilityLock {
                    index: RwLock::new(HashSet::new()),
                })
            })
            .clone()
    }

    /// Registers `agent` under `capabilities`. Idempotent: re-registering
    /// an id already present is a no-op that returns `Ok(())`.
    ///
    /// The capability index is updated before `agent.initialize` runs, so
    /// that a failed initialization has something to unwind: on error,
    /// every bucket this call inserted into is rolled back (and emptied
    /// buckets removed) before the error is propagated, and the agent is
    /// never inserted into `agents`.
    ///
    /// # Errors
    /// Returns whatever `agent.initialize` returns; on failure the
    /// partially-built index entries are rolled back before the error is
    /// propagated.
    #[instrument(skip(self, agent, capabilities), fields(agent_id = %agent.id()))]
    pub async fn register_agent(
        &self,
        agent: Arc<dyn AgentHandle>,
        capabilities: Vec<Capability>,
    ) -> CoreResult<()> {
        let id = agent.id().clone();
        if self.agents.contains_key(&id) {
            debug!("register_agent: already registered, no-op");
            return Ok(());
        }

        let mut inserted_kinds = Vec::new();
        for cap in &capabilities {
            let bucket = self.bucket(cap.kind.as_str());
            bucket.index.write().await.insert(id.clone());
            inserted_kinds.push(cap.kind.as_str().to_string());
        }

        if let Err(err) = agent.initialize(capabilities.clone()).await {
            warn!(error = %err, "agent initialization failed, rolling back index inserts");
            for kind in &inserted_kinds {
                if let Some(bucket) = self.capability_index.get(kind.as_str()) {
                    let mut index = bucket.index.write().await;
                    index.remove(&id);
                    let empty = index.is_empty();
                    drop(index);
                    if empty {
                        self.capability_index.remove(kind.as_str());
                    }
                }
            }
            return Err(err);
        }

        let index = RegistrationIndex::new(self.registration_counter.fetch_add(1, Ordering::SeqCst));
        agent.set_registration_index(index);

        self.agents.insert(id.clone(), agent);

        self.notifier.notify_agent_registered(id.clone());
        self.notify_registered(&id).await;
        Ok(())
    }

    async fn notify_registered(&self, id: &AgentId) {
        for observer in self.live_observers().await {
            observer.on_agent_registered(id).await;
        }
    }

    async fn notify_unregistered(&self, id: &AgentId) {
        for observer in self.live_observers().await {
            observer.on_agent_unregistered(id).await;
        }
    }

    async fn notify_capability_updated(&self, id: &AgentId, caps: &[Capability]) {
        for observer in self.live_observers().await {
            observer.on_capability_updated(id, caps).await;
        }
    }

    async fn live_observers(&self) -> Vec<Arc<dyn RegistryObserver>> {
        let mut guard = self.observers.write().await;
        guard.retain(|w| w.strong_count() > 0);
        guard.iter().filter_map(Weak::upgrade).collect()
    }

    /// Removes `agent_id`, cleaning empty capability buckets. A
    /// non-existent id is a no-op.
    #[instrument(skip(self))]
    pub async fn unregister_agent(&self, agent_id: &AgentId) {
        let Some((_, agent)) = self.agents.remove(agent_id) else {
            debug!("unregister_agent: not registered, no-op");
            return;
        };

        if let Ok(caps) = agent.capabilities().await {
            for cap in &caps {
                let kind = cap.kind.as_str();
                if let Some(bucket) = self.capability_index.get(kind) {
                    let mut index = bucket.index.write().await;
                    index.remove(agent_id);
                    let empty = index.is_empty();
                    drop(index);
                    if empty {
                        self.capability_index.remove(kind);
                    }
                }
            }
        }

        agent.shutdown().await;
        self.recovery_locks.remove(agent_id);
        self.notifier.notify_agent_unregistered(agent_id.clone());
        self.notify_unregistered(agent_id).await;
    }

    /// Returns every registered agent capable of `kind`, in insertion
    /// order. Unknown kinds yield an empty list.
    pub async fn get_agents_by_capability(&self, kind: &CapabilityKind) -> Vec<Arc<dyn AgentHandle>> {
        let Some(bucket) = self.capability_index.get(kind.as_str()) else {
            return Vec::new();
        };
        let ids = bucket.index.read().await.clone();
        let mut agents: Vec<_> = ids
            .iter()
            .filter_map(|id| self.agents.get(id).map(|a| a.clone()))
            .collect();
        agents.sort_by_key(|a| a.registration_index());
        agents
    }

    /// Looks up a single agent by id.
    #[must_use]
    pub fn get_agent(&self, agent_id: &AgentId) -> Option<Arc<dyn AgentHandle>> {
        self.agents.get(agent_id).map(|a| a.clone())
    }

    /// Lists every registered agent.
    #[must_use]
    pub fn list_all(&self) -> Vec<Arc<dyn AgentHandle>> {
        self.agents.iter().map(|e| e.value().clone()).collect()
    }

    /// Replaces `agent_id`'s advertised capabilities, updating the index
    /// and notifying observers of the change.
    ///
    /// # Errors
    /// Returns [`CoreError::NotFound`] if the agent is not registered.
    pub async fn update_agent_capabilities(
        &self,
        agent_id: &AgentId,
        new_caps: Vec<Capability>,
    ) -> CoreResult<()> {
        let agent = self
            .agents
            .get(agent_id)
            .map(|a| a.clone())
            .ok_or_else(|| CoreError::NotFound(agent_id.to_string()))?;

        let old_caps = agent.capabilities().await?;
        let old_kinds: HashSet<&str> = old_caps.iter().map(|c| c.kind.as_str()).collect();
        let new_kinds: HashSet<&str> = new_caps.iter().map(|c| c.kind.as_str()).collect();

        for kind in old_kinds.difference(&new_kinds) {
            if let Some(bucket) = self.capability_index.get(*kind) {
                bucket.index.write().await.remove(agent_id);
            }
        }
        for kind in new_kinds.difference(&old_kinds) {
            self.bucket(kind).index.write().await.insert(agent_id.clone());
        }

        for cap in old_caps {
            agent.remove_capability(&cap).await?;
        }
        for cap in &new_caps {
            agent.add_capability(cap.clone()).await?;
        }

        let names: Vec<String> = new_caps.iter().map(|c| c.kind.as_str().to_string()).collect();
        self.notifier
            .notify_capability_change(agent_id.clone(), names);
        self.notify_capability_updated(agent_id, &new_caps).await;
        Ok(())
    }

    /// Checks which of `required` capability kinds currently have at
    /// least one capable agent.
    pub async fn validate_capabilities(&self, required: &[CapabilityKind]) -> CapabilityValidation {
        let mut result = CapabilityValidation::default();
        for kind in required {
            if self.get_agents_by_capability(kind).await.is_empty() {
                result.missing.push(kind.as_str().to_string());
            } else {
                result.available.push(kind.as_str().to_string());
            }
        }
        result
    }

    /// Routes `message` to its recipient, or to the first agent capable
    /// of `message.message_type` if `required_capability` metadata is
    /// present and the recipient is a routing placeholder.
    ///
    /// # Errors
    /// [`CoreError::RouteFailed`] if the recipient is not registered.
    pub async fn route_message(&self, message: AgentMessage) -> CoreResult<serde_json::Value> {
        let recipient = self
            .agents
            .get(&message.recipient_id)
            .map(|a| a.clone())
            .ok_or_else(|| CoreError::RouteFailed(format!("unknown recipient {}", message.recipient_id)))?;
        recipient.process_message(message).await
    }

    /// Delivers `message`'s content to every registered agent except its
    /// sender. Per-agent failures are logged and excluded from the
    /// returned map rather than aborting the broadcast.
    pub async fn broadcast_message(&self, message: &AgentMessage) -> std::collections::HashMap<AgentId, serde_json::Value> {
        let mut results = std::collections::HashMap::new();
        for entry in self.agents.iter() {
            let (id, agent) = (entry.key().clone(), entry.value().clone());
            if id == message.sender_id {
                continue;
            }
            let copy = AgentMessage {
                id: crate::types::MessageId::generate(),
                sender_id: message.sender_id.clone(),
                recipient_id: id.clone(),
                content: message.content.clone(),
                timestamp: message.timestamp,
                message_type: message.message_type.clone(),
                metadata: message.metadata.clone(),
            };
            match agent.process_message(copy).await {
                Ok(value) => {
                    results.insert(id, value);
                }
                Err(err) => {
                    warn!(agent_id = %id, error = %err, "broadcast delivery failed");
                }
            }
        }
        results
    }

    /// Recovers `agent_id` from `error_kind`, bounded by
    /// `config.recovery_deadline`. Returns `false` on timeout or if the
    /// agent is unknown.
    ///
    /// Serialized per-agent by a dedicated lock, so two concurrent
    /// recoveries of the same agent are observed in a single order rather
    /// than interleaving.
    #[instrument(skip(self))]
    pub async fn recover_agent(&self, agent_id: &AgentId, error_kind: &str) -> bool {
        let Some(agent) = self.agents.get(agent_id).map(|a| a.clone()) else {
            return false;
        };

        let lock = self.recovery_lock(agent_id);
        let _guard = lock.lock().await;

        let recovery = self.recovery.clone();
        let kind = error_kind.to_string();
        let agent_for_task = agent.clone();
        let result = timeout(self.config.recovery_deadline, async move {
            recovery.recover(agent_for_task.as_ref(), &kind).await
        })
        .await;

        let success = result.unwrap_or(false);
        self.notifier
            .notify_agent_recovery(agent_id.clone(), success);
        success
    }

    /// Registers an observer. The registry only holds a `Weak` reference;
    /// the caller must keep an `Arc` alive for as long as notifications
    /// are wanted.
    pub async fn add_observer(&self, observer: Weak<dyn RegistryObserver>) {
        self.observers.write().await.push(observer);
    }

    /// Unregisters every agent and shuts down the notifier.
    pub async fn shutdown(&self) {
        let ids: Vec<AgentId> = self.agents.iter().map(|e| e.key().clone()).collect();
        for id in ids {
            self.unregister_agent(&id).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::Agent;
    use crate::agent::Echo;
    use crate::agent::StatusReport;
    use crate::capability::{Capability, CapabilityKey};

    fn agent_id(s: &str) -> AgentId {
        AgentId::try_new(s.to_string()).unwrap()
    }

    fn registry() -> AgentRegistry {
        AgentRegistry::new(
            WorkflowNotifier::start(),
            Arc::new(RecoveryStrategyEngine::new()),
            RuntimeConfig::test(),
        )
    }

    #[tokio::test]
    async fn register_then_lookup_by_capability() {
        let registry = registry();
        let agent = Arc::new(Agent::new(agent_id("sensor"), "sensor", Echo));
        registry
            .register_agent(agent, vec![Capability::new(CapabilityKind::SensorReading)])
            .await
            .unwrap();

        let found = registry
            .get_agents_by_capability(&CapabilityKind::SensorReading)
            .await;
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].id(), &agent_id("sensor"));
    }

    #[tokio::test]
    async fn duplicate_registration_is_a_no_op() {
        let registry = registry();
        let agent = Arc::new(Agent::new(agent_id("sensor"), "sensor", Echo));
        registry
            .register_agent(agent.clone(), vec![Capability::new(CapabilityKind::SensorReading)])
            .await
            .unwrap();
        registry
            .register_agent(agent, vec![Capability::new(CapabilityKind::SensorReading)])
            .await
            .unwrap();

        assert_eq!(
            registry
                .get_agents_by_capability(&CapabilityKind::SensorReading)
                .await
                .len(),
            1
        );
    }

    /// Wraps an `Agent` but always fails `initialize`, to exercise the
    /// rollback path in `register_agent`.
    struct FailsToInitialize(Agent<Echo>);

    #[async_trait]
    impl AgentHandle for FailsToInitialize {
        fn id(&self) -> &AgentId {
            self.0.id()
        }

        fn agent_type(&self) -> &str {
            self.0.agent_type()
        }

        async fn initialize(&self, _caps: Vec<Capability>) -> CoreResult<()> {
            Err(CoreError::ProcessingFailed {
                cause: "simulated collaborator failure".to_string(),
            })
        }

        async fn capabilities(&self) -> CoreResult<Vec<Capability>> {
            self.0.capabilities().await
        }

        async fn add_capability(&self, cap: Capability) -> CoreResult<()> {
            self.0.add_capability(cap).await
        }

        async fn remove_capability(&self, cap: &Capability) -> CoreResult<()> {
            self.0.remove_capability(cap).await
        }

        async fn has_capability<'a>(&self, key: CapabilityKey<'a>) -> CoreResult<bool> {
            self.0.has_capability(key).await
        }

        async fn process_message(&self, message: AgentMessage) -> CoreResult<serde_json::Value> {
            self.0.process_message(message).await
        }

        fn has_typed_execute(&self) -> bool {
            self.0.has_typed_execute()
        }

        async fn execute(&self, payload: &serde_json::Value) -> CoreResult<serde_json::Value> {
            self.0.execute(payload).await
        }

        async fn status(&self) -> AgentStatus {
            self.0.status().await
        }

        async fn set_status(&self, status: AgentStatus) {
            self.0.set_status(status).await;
        }

        async fn status_report(&self) -> CoreResult<StatusReport> {
            self.0.status_report().await
        }

        async fn shutdown(&self) {
            self.0.shutdown().await;
        }

        fn dependencies(&self) -> &[AgentId] {
            self.0.dependencies()
        }

        fn is_test_only(&self) -> bool {
            self.0.is_test_only()
        }

        fn is_monitor(&self) -> bool {
            self.0.is_monitor()
        }

        fn registration_index(&self) -> Option<RegistrationIndex> {
            self.0.registration_index()
        }

        fn set_registration_index(&self, index: RegistrationIndex) {
            self.0.set_registration_index(index);
        }
    }

    #[tokio::test]
    async fn failed_initialization_rolls_back_index_inserts() {
        let registry = registry();
        let agent = Arc::new(FailsToInitialize(Agent::new(agent_id("doomed"), "worker", Echo)));

        let result = registry
            .register_agent(agent, vec![Capability::new(CapabilityKind::SensorReading)])
            .await;
        assert!(result.is_err());

        assert!(registry
            .get_agents_by_capability(&CapabilityKind::SensorReading)
            .await
            .is_empty());
        assert!(registry.get_agent(&agent_id("doomed")).is_none());
    }

    #[tokio::test]
    async fn concurrent_registration_of_the_same_id_registers_exactly_once() {
        let registry = Arc::new(registry());
        let agent_a = Arc::new(Agent::new(agent_id("sensor"), "sensor", Echo));
        let agent_b = Arc::new(Agent::new(agent_id("sensor"), "sensor", Echo));

        let r1 = registry.clone();
        let r2 = registry.clone();
        let (first, second) = tokio::join!(
            tokio::spawn(async move {
                r1.register_agent(agent_a, vec![Capability::new(CapabilityKind::SensorReading)])
                    .await
            }),
            tokio::spawn(async move {
                r2.register_agent(agent_b, vec![Capability::new(CapabilityKind::SensorReading)])
                    .await
            }),
        );
        first.unwrap().unwrap();
        second.unwrap().unwrap();

        assert_eq!(
            registry
                .get_agents_by_capability(&CapabilityKind::SensorReading)
                .await
                .len(),
            1
        );
    }

    #[tokio::test]
    async fn recover_agent_returns_errored_agent_to_idle() {
        use crate::agent::AlwaysFails;

        let registry = registry();
        let agent = Arc::new(Agent::new(agent_id("broken"), "worker", AlwaysFails));
        registry.register_agent(agent.clone(), vec![]).await.unwrap();
        agent.set_status(AgentStatus::Error).await;

        let ok = registry.recover_agent(&agent_id("broken"), "timeout").await;
        assert!(ok);
        assert_eq!(agent.status().await, AgentStatus::Idle);
    }

    #[tokio::test]
    async fn recover_agent_is_false_for_unknown_agent() {
        let registry = registry();
        assert!(!registry.recover_agent(&agent_id("ghost"), "timeout").await);
    }

    struct NeverRecovers;

    #[async_trait]
    impl crate::recovery::RecoveryStrategy for NeverRecovers {
        fn can_handle(&self, _error_kind: &str) -> bool {
            true
        }

        async fn recover(&self, _agent: &dyn AgentHandle) -> bool {
            tokio::time::sleep(Duration::from_secs(3600)).await;
            true
        }

        fn name(&self) -> &'static str {
            "never"
        }
    }

    #[tokio::test(start_paused = true)]
    async fn recover_agent_exceeding_the_deadline_returns_false_and_stays_errored() {
        use crate::agent::AlwaysFails;

        let mut recovery = RecoveryStrategyEngine::new();
        recovery.register(Arc::new(NeverRecovers));
        let registry = AgentRegistry::new(WorkflowNotifier::start(), Arc::new(recovery), RuntimeConfig::test());
        let agent = Arc::new(Agent::new(agent_id("broken"), "worker", AlwaysFails));
        registry.register_agent(agent.clone(), vec![]).await.unwrap();
        agent.set_status(AgentStatus::Error).await;

        let ok = registry.recover_agent(&agent_id("broken"), "timeout").await;
        assert!(!ok);
        assert_eq!(agent.status().await, AgentStatus::Error);
    }

    #[tokio::test]
    async fn concurrent_recoveries_of_the_same_agent_serialize() {
        let registry = Arc::new(registry());
        let agent = Arc::new(Agent::new(agent_id("broken"), "worker", AlwaysFails));
        registry.register_agent(agent.clone(), vec![]).await.unwrap();

        let id = agent_id("broken");
        let r1 = registry.clone();
        let id1 = id.clone();
        let r2 = registry.clone();
        let id2 = id.clone();
        let (a, b) = tokio::join!(
            tokio::spawn(async move { r1.recover_agent(&id1, "timeout").await }),
            tokio::spawn(async move { r2.recover_agent(&id2, "timeout").await }),
        );
        assert!(a.unwrap());
        assert!(b.unwrap());
    }

    #[tokio::test]
    async fn unregister_removes_agent_from_capability_index() {
        let registry = registry();
        let agent = Arc::new(Agent::new(agent_id("sensor"), "sensor", Echo));
        registry
            .register_agent(agent, vec![Capability::new(CapabilityKind::SensorReading)])
            .await
            .unwrap();

        registry.unregister_agent(&agent_id("sensor")).await;

        assert!(registry
            .get_agents_by_capability(&CapabilityKind::SensorReading)
            .await
            .is_empty());
    }
}

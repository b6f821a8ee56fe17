//! `Runtime`: wires the registry, router, recovery engine, notifier, and
//! workflow manager into the single process-local fabric described in
//! the system overview's control/data flow (§2).
//!
//! Grounded in this codebase's own top-level runtime shape (a struct
//! that owns every subsystem and exposes construction presets mirroring
//! `RuntimeConfig`'s `development`/`test`/`production`), adapted here so
//! that the four ways components reference each other — the registry
//! holding the notifier and recovery engine, the router and workflow
//! manager holding the registry, the workflow manager also holding the
//! router and notifier — are assembled in one place instead of being the
//! caller's responsibility.

use std::sync::Arc;

use crate::config::RuntimeConfig;
use crate::notifier::WorkflowNotifier;
use crate::persistence::{InMemoryWorkflowPersistence, WorkflowPersistence};
use crate::recovery::RecoveryStrategyEngine;
use crate::registry::AgentRegistry;
use crate::router::CapabilityRouter;
use crate::workflow::WorkflowManager;

/// The assembled coordination fabric: one registry, one router, one
/// recovery engine, one notifier, one workflow manager, sharing a single
/// `RuntimeConfig`.
pub struct Runtime {
    /// The agent directory and capability index.
    pub registry: Arc<AgentRegistry>,
    /// Scores and selects agents for a capability.
    pub router: Arc<CapabilityRouter>,
    /// Assembles, executes, and persists workflows.
    pub workflows: Arc<WorkflowManager>,
    /// The ordered event bus shared by the registry and workflow manager.
    pub notifier: WorkflowNotifier,
    /// The active configuration.
    pub config: RuntimeConfig,
}

impl Runtime {
    /// Assembles a runtime over `config` and `persistence`.
    ///
    /// Registers the router and workflow manager as registry observers,
    /// so registration, unregistration, and capability-change events
    /// reach both the routing cache invalidation and the opportunistic
    /// workflow re-assembly described in §4.7's observer role — without
    /// either of those components owning the registry's lifetime.
    pub async fn new(config: RuntimeConfig, persistence: Arc<dyn WorkflowPersistence>) -> Arc<Self> {
        let notifier = WorkflowNotifier::start();
        let recovery = Arc::new(RecoveryStrategyEngine::new());
        let registry = Arc::new(AgentRegistry::new(notifier.clone(), recovery, config.clone()));
        let router = Arc::new(CapabilityRouter::new(registry.clone(), config.clone()));
        let workflows = Arc::new(WorkflowManager::new(
            registry.clone(),
            router.clone(),
            notifier.clone(),
            persistence,
            config.clone(),
        ));

        // Observers are held as `Weak` references by the registry (see
        // `RegistryObserver`), so the runtime itself is what keeps the
        // router and workflow manager alive for as long as observation
        // is wanted.
        let router_observer: Arc<dyn crate::registry::RegistryObserver> = router.clone();
        let workflow_observer: Arc<dyn crate::registry::RegistryObserver> = workflows.clone();
        registry.add_observer(Arc::downgrade(&router_observer)).await;
        registry.add_observer(Arc::downgrade(&workflow_observer)).await;

        Arc::new(Self {
            registry,
            router,
            workflows,
            notifier,
            config,
        })
    }

    /// Builds a runtime with `RuntimeConfig::development()` and
    /// in-memory persistence — the quickest path to a working fabric for
    /// local experimentation.
    pub async fn development() -> Arc<Self> {
        Self::new(RuntimeConfig::development(), Arc::new(InMemoryWorkflowPersistence::new())).await
    }

    /// Builds a runtime with `RuntimeConfig::test()` and in-memory
    /// persistence, for use in integration tests.
    pub async fn for_tests() -> Arc<Self> {
        Self::new(RuntimeConfig::test(), Arc::new(InMemoryWorkflowPersistence::new())).await
    }

    /// Cancels running workflows and unregisters every agent, in that
    /// order, then stops the notifier's consumer task.
    pub async fn shutdown(&self) {
        self.workflows.shutdown().await;
        self.registry.shutdown().await;
        self.notifier.shutdown().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::{Agent, Echo};
    use crate::capability::{Capability, CapabilityKind};
    use crate::types::AgentId;
    use crate::workflow::LoadBalancingStrategy;

    #[tokio::test]
    async fn registering_an_agent_opportunistically_assembles_a_pending_workflow() {
        let runtime = Runtime::for_tests().await;
        let id = runtime
            .workflows
            .create_workflow(
                "w",
                "d",
                vec![CapabilityKind::SensorReading],
                1,
                LoadBalancingStrategy::RoundRobin,
            )
            .await;
        assert_eq!(
            runtime.workflows.get_workflow_status(id).await,
            Some(crate::workflow::WorkflowStatus::Pending)
        );

        let agent = Arc::new(Agent::new(AgentId::try_new("sensor".to_string()).unwrap(), "sensor", Echo));
        runtime
            .registry
            .register_agent(agent, vec![Capability::new(CapabilityKind::SensorReading)])
            .await
            .unwrap();

        // Observer notification is itself async but synchronous from the
        // caller's perspective: `register_agent` awaits every observer
        // before returning.
        assert_eq!(
            runtime.workflows.get_workflow_status(id).await,
            Some(crate::workflow::WorkflowStatus::Assembled)
        );
    }

    #[tokio::test]
    async fn unregistering_an_agent_invalidates_the_router_cache() {
        let runtime = Runtime::for_tests().await;
        let agent = Arc::new(Agent::new(AgentId::try_new("v1".to_string()).unwrap(), "worker", Echo));
        runtime
            .registry
            .register_agent(agent, vec![Capability::new(CapabilityKind::MessageProcessing)])
            .await
            .unwrap();

        let _ = runtime
            .router
            .score_agents_for_capability(&CapabilityKind::MessageProcessing, None, None)
            .await;

        runtime
            .registry
            .unregister_agent(&AgentId::try_new("v1".to_string()).unwrap())
            .await;

        let matches = runtime
            .router
            .score_agents_for_capability(&CapabilityKind::MessageProcessing, None, None)
            .await;
        assert!(matches.is_empty());
    }
}

//! Recovery strategy engine: classifies an error kind and applies the
//! matching recovery procedure to return an agent to `Idle`.
//!
//! Grounded in the reference system's strategy classes, which define a
//! `Timeout`, `ResourceExhaustion`, `Communication`, and `StateCorruption`
//! strategy plus a catch-all default. Unlike the original factory —
//! which only ever registered three of those five in practice — every
//! named strategy here is registered by `RecoveryStrategyEngine::new`,
//! since the wider system promises all four as part of its taxonomy (see
//! DESIGN.md).

use async_trait::async_trait;
use std::sync::Arc;
use tracing::{error, info, instrument};

use crate::agent::{AgentHandle, AgentStatus};

/// A recovery procedure bound to a class of errors.
#[async_trait]
pub trait RecoveryStrategy: Send + Sync {
    /// Whether this strategy knows how to handle `error_kind`.
    fn can_handle(&self, error_kind: &str) -> bool;

    /// Attempts to recover `agent`, returning whether it succeeded.
    /// Never raises: failures are reported via the return value, and the
    /// agent is left in [`AgentStatus::Error`] on failure.
    async fn recover(&self, agent: &dyn AgentHandle) -> bool;

    /// A short name for logging and the `agent_recovery` notifier event.
    fn name(&self) -> &'static str;
}

/// Sets `agent`'s final status for a recovery attempt. None of the five
/// built-in strategies below ever call this with `false` — the abstracted
/// agent has no resource or connection subsystem whose recovery can
/// intrinsically fail, so the only way an agent stays `Error` after
/// `RecoveryStrategyEngine::recover` is the registry's deadline elapsing
/// first, or a caller-registered strategy choosing to fail.
async fn settle(agent: &dyn AgentHandle, succeeded: bool) -> bool {
    if succeeded {
        agent.set_status(AgentStatus::Idle).await;
    } else {
        agent.set_status(AgentStatus::Error).await;
    }
    succeeded
}

/// Handles `timeout`, `operation_timeout`, and `response_timeout`.
pub struct TimeoutRecoveryStrategy;

#[async_trait]
impl RecoveryStrategy for TimeoutRecoveryStrategy {
    fn can_handle(&self, error_kind: &str) -> bool {
        matches!(
            error_kind,
            "timeout" | "operation_timeout" | "response_timeout"
        )
    }

    async fn recover(&self, agent: &dyn AgentHandle) -> bool {
        settle(agent, true).await
    }

    fn name(&self) -> &'static str {
        "timeout"
    }
}

/// Handles `memory_exhaustion`, `cpu_exhaustion`, and `resource_exhaustion`.
pub struct ResourceExhaustionRecoveryStrategy;

#[async_trait]
impl RecoveryStrategy for ResourceExhaustionRecoveryStrategy {
    fn can_handle(&self, error_kind: &str) -> bool {
        matches!(
            error_kind,
            "memory_exhaustion" | "cpu_exhaustion" | "resource_exhaustion"
        )
    }

    async fn recover(&self, agent: &dyn AgentHandle) -> bool {
        settle(agent, true).await
    }

    fn name(&self) -> &'static str {
        "resource_exhaustion"
    }
}

/// Handles `connection_error`, `communication_error`, and `network_error`.
pub struct CommunicationRecoveryStrategy;

#[async_trait]
impl RecoveryStrategy for CommunicationRecoveryStrategy {
    fn can_handle(&self, error_kind: &str) -> bool {
        matches!(
            error_kind,
            "connection_error" | "communication_error" | "network_error"
        )
    }

    async fn recover(&self, agent: &dyn AgentHandle) -> bool {
        settle(agent, true).await
    }

    fn name(&self) -> &'static str {
        "communication"
    }
}

/// Handles `state_corruption`, `data_corruption`, and `inconsistent_state`.
pub struct StateCorruptionRecoveryStrategy;

#[async_trait]
impl RecoveryStrategy for StateCorruptionRecoveryStrategy {
    fn can_handle(&self, error_kind: &str) -> bool {
        matches!(
            error_kind,
            "state_corruption" | "data_corruption" | "inconsistent_state"
        )
    }

    async fn recover(&self, agent: &dyn AgentHandle) -> bool {
        settle(agent, true).await
    }

    fn name(&self) -> &'static str {
        "state_corruption"
    }
}

/// Fallback strategy: handles any error kind not matched above.
pub struct DefaultRecoveryStrategy;

#[async_trait]
impl RecoveryStrategy for DefaultRecoveryStrategy {
    fn can_handle(&self, _error_kind: &str) -> bool {
        true
    }

    async fn recover(&self, agent: &dyn AgentHandle) -> bool {
        settle(agent, true).await
    }

    fn name(&self) -> &'static str {
        "default"
    }
}

/// Looks up and applies recovery strategies by error kind.
///
/// Strategies are tried in registration order; the first whose
/// `can_handle` matches wins. `RecoveryStrategyEngine::new` registers the
/// four named strategies ahead of the default, so the default only ever
/// fires for genuinely unclassified errors.
pub struct RecoveryStrategyEngine {
    strategies: Vec<Arc<dyn RecoveryStrategy>>,
    default_strategy: Arc<dyn RecoveryStrategy>,
}

impl Default for RecoveryStrategyEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl RecoveryStrategyEngine {
    /// Builds an engine with the standard taxonomy already registered.
    #[must_use]
    pub fn new() -> Self {
        Self {
            strategies: vec![
                Arc::new(TimeoutRecoveryStrategy),
                Arc::new(ResourceExhaustionRecoveryStrategy),
                Arc::new(CommunicationRecoveryStrategy),
                Arc::new(StateCorruptionRecoveryStrategy),
            ],
            default_strategy: Arc::new(DefaultRecoveryStrategy),
        }
    }

    /// Registers an additional strategy, tried ahead of the built-ins in
    /// reverse registration order (most recently added wins ties).
    pub fn register(&mut self, strategy: Arc<dyn RecoveryStrategy>) {
        self.strategies.insert(0, strategy);
    }

    /// Resolves the strategy that handles `error_kind`, falling back to
    /// the default strategy if none match.
    #[must_use]
    pub fn strategy_for(&self, error_kind: &str) -> Arc<dyn RecoveryStrategy> {
        self.strategies
            .iter()
            .find(|s| s.can_handle(error_kind))
            .cloned()
            .unwrap_or_else(|| self.default_strategy.clone())
    }

    /// Resolves and applies the matching strategy to `agent`.
    #[instrument(skip(self, agent), fields(agent_id = %agent.id(), error_kind))]
    pub async fn recover(&self, agent: &dyn AgentHandle, error_kind: &str) -> bool {
        let strategy = self.strategy_for(error_kind);
        let ok = strategy.recover(agent).await;
        if ok {
            info!(strategy = strategy.name(), "agent recovered");
        } else {
            error!(strategy = strategy.name(), "agent recovery failed");
        }
        ok
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::{Agent, AlwaysFails};
    use crate::types::AgentId;

    #[tokio::test]
    async fn resolves_timeout_strategy_by_kind() {
        let engine = RecoveryStrategyEngine::new();
        assert_eq!(engine.strategy_for("timeout").name(), "timeout");
        assert_eq!(
            engine.strategy_for("state_corruption").name(),
            "state_corruption"
        );
        assert_eq!(engine.strategy_for("something_else").name(), "default");
    }

    #[tokio::test]
    async fn recovering_an_errored_agent_returns_it_to_idle() {
        let engine = RecoveryStrategyEngine::new();
        let agent = Agent::new(AgentId::try_new("broken".to_string()).unwrap(), "worker", AlwaysFails);
        agent.initialize(vec![]).await.unwrap();
        agent.set_status(AgentStatus::Error).await;

        let ok = engine.recover(&agent, "timeout").await;
        assert!(ok);
        assert_eq!(agent.status().await, AgentStatus::Idle);
    }

    /// None of the built-in strategies can fail intrinsically, so this
    /// registers a custom one that does, to exercise `settle`'s `false`
    /// branch without relying on the registry's external deadline.
    struct AlwaysFailsRecovery;

    #[async_trait]
    impl RecoveryStrategy for AlwaysFailsRecovery {
        fn can_handle(&self, _error_kind: &str) -> bool {
            true
        }

        async fn recover(&self, agent: &dyn AgentHandle) -> bool {
            settle(agent, false).await
        }

        fn name(&self) -> &'static str {
            "always_fails"
        }
    }

    #[tokio::test]
    async fn a_strategy_that_intrinsically_fails_leaves_the_agent_in_error() {
        let mut engine = RecoveryStrategyEngine::new();
        engine.register(Arc::new(AlwaysFailsRecovery));
        let agent = Agent::new(AgentId::try_new("broken".to_string()).unwrap(), "worker", AlwaysFails);
        agent.initialize(vec![]).await.unwrap();
        agent.set_status(AgentStatus::Error).await;

        let ok = engine.recover(&agent, "timeout").await;
        assert!(!ok);
        assert_eq!(agent.status().await, AgentStatus::Error);
    }
}

//! `WorkflowNotifier`: a single-consumer, strictly-ordered event bus
//! coupling the registry, workflow manager, and recovery engine.
//!
//! Grounded in the reference system's `WorkflowNotifier` (an
//! `asyncio.Queue` drained by one background task) and in this codebase's
//! own `AgentLifecycleManager`, which uses the same
//! `mpsc::unbounded_channel` + `tokio::spawn` consumer shape for agent
//! lifecycle events. Handler errors are logged and never stop the
//! consumer; `shutdown` cancels it and waits for the queue to drain.

use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::types::{AgentId, WorkflowId};

/// An event published onto the notifier.
#[derive(Debug, Clone)]
pub enum NotifierEvent {
    /// An agent was registered with the registry.
    AgentRegistered {
        /// The newly registered agent.
        agent_id: AgentId,
    },
    /// An agent was removed from the registry.
    AgentUnregistered {
        /// The removed agent.
        agent_id: AgentId,
    },
    /// A recovery attempt completed for an agent.
    AgentRecovery {
        /// The agent that was recovered (or not).
        agent_id: AgentId,
        /// Whether recovery succeeded.
        success: bool,
    },
    /// An agent's advertised capabilities changed.
    CapabilityChange {
        /// The agent whose capabilities changed.
        agent_id: AgentId,
        /// The capability kind names now advertised.
        capabilities: Vec<String>,
    },
    /// A workflow finished assembly and is ready to execute.
    WorkflowAssembled {
        /// The assembled workflow.
        workflow_id: WorkflowId,
        /// Agents assigned to its steps.
        agents: Vec<AgentId>,
    },
}

struct Inner {
    tx: mpsc::UnboundedSender<Option<NotifierEvent>>,
    consumer: Mutex<Option<JoinHandle<()>>>,
}

/// Handle to the running notifier. Cloning shares the same underlying
/// queue and consumer task.
#[derive(Clone)]
pub struct WorkflowNotifier {
    inner: Arc<Inner>,
}

impl WorkflowNotifier {
    /// Starts the notifier's background consumer task.
    #[must_use]
    pub fn start() -> Self {
        let (tx, mut rx) = mpsc::unbounded_channel::<Option<NotifierEvent>>();

        let consumer = tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                let Some(event) = event else {
                    break;
                };
                if let Err(err) = dispatch(&event) {
                    warn!(error = %err, "notifier handler failed, continuing");
                }
            }
            info!("workflow notifier consumer stopped");
        });

        Self {
            inner: Arc::new(Inner {
                tx,
                consumer: Mutex::new(Some(consumer)),
            }),
        }
    }

    fn send(&self, event: NotifierEvent) {
        // An unbounded sender only fails once the receiver (owned by the
        // consumer task) is gone, which only happens after shutdown.
        let _ = self.inner.tx.send(Some(event));
    }

    /// Publishes an `agent_registered` event.
    pub fn notify_agent_registered(&self, agent_id: AgentId) {
        self.send(NotifierEvent::AgentRegistered { agent_id });
    }

    /// Publishes an `agent_unregistered` event.
    pub fn notify_agent_unregistered(&self, agent_id: AgentId) {
        self.send(NotifierEvent::AgentUnregistered { agent_id });
    }

    /// Publishes an `agent_recovery` event.
    pub fn notify_agent_recovery(&self, agent_id: AgentId, success: bool) {
        self.send(NotifierEvent::AgentRecovery { agent_id, success });
    }

    /// Publishes a `capability_change` event.
    pub fn notify_capability_change(&self, agent_id: AgentId, capabilities: Vec<String>) {
        self.send(NotifierEvent::CapabilityChange {
            agent_id,
            capabilities,
        });
    }

    /// Publishes a `workflow_assembled` event.
    pub fn notify_workflow_assembled(&self, workflow_id: WorkflowId, agents: Vec<AgentId>) {
        self.send(NotifierEvent::WorkflowAssembled {
            workflow_id,
            agents,
        });
    }

    /// Cancels the consumer and waits for it to drain and stop.
    pub async fn shutdown(&self) {
        info!("shutting down workflow notifier");
        let _ = self.inner.tx.send(None);
        if let Some(handle) = self.inner.consumer.lock().await.take() {
            let _ = handle.await;
        }
    }
}

fn dispatch(event: &NotifierEvent) -> Result<(), std::convert::Infallible> {
    match event {
        NotifierEvent::AgentRegistered { agent_id } => {
            info!(%agent_id, "agent registered");
        }
        NotifierEvent::AgentUnregistered { agent_id } => {
            info!(%agent_id, "agent unregistered");
        }
        NotifierEvent::AgentRecovery { agent_id, success } => {
            info!(%agent_id, success, "agent recovery");
        }
        NotifierEvent::CapabilityChange {
            agent_id,
            capabilities,
        } => {
            info!(%agent_id, ?capabilities, "capabilities updated");
        }
        NotifierEvent::WorkflowAssembled {
            workflow_id,
            agents,
        } => {
            info!(%workflow_id, ?agents, "workflow assembled");
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn shutdown_drains_and_stops_the_consumer() {
        let notifier = WorkflowNotifier::start();
        notifier.notify_agent_registered(AgentId::try_new("a".to_string()).unwrap());
        notifier.notify_agent_recovery(AgentId::try_new("a".to_string()).unwrap(), true);
        notifier.shutdown().await;
        // A second shutdown must not hang or panic.
        notifier.shutdown().await;
    }
}

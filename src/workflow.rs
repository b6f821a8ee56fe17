//! `WorkflowManager`: assembles, executes, recovers, and persists
//! multi-step workflows over capabilities resolved through the registry
//! and router.
//!
//! Grounded in the reference system's `WorkflowManager` (opportunistic
//! assembly on `create_workflow`, the five-step selection policy, the
//! dependency fan-out on step completion) and in this codebase's
//! `hot_reload_manager.rs` / `deployment_manager.rs` for the
//! per-id-locked state-machine shape (a `DashMap<Id, Arc<RwLock<T>>>`
//! plus a history log of `{state, timestamp}` entries) that this module
//! reuses for workflows instead of deployments.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tokio::time::{timeout, Duration, Instant};
use tracing::{info, instrument, warn};

use crate::agent::{Agent, AgentHandle, AgentMessage, Echo};
use crate::capability::{Capability, CapabilityKind};
use crate::config::RuntimeConfig;
use crate::error::{CoreError, CoreResult};
use crate::notifier::WorkflowNotifier;
use crate::persistence::WorkflowPersistence;
use crate::registry::{AgentRegistry, RegistryObserver};
use crate::router::{CapabilityRouter, RoutingPreferences};
use crate::types::{AgentId, StepId, WorkflowId};

/// Lifecycle status of a workflow.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowStatus {
    /// Created but not yet assembled.
    Pending,
    /// Steps created and every required capability has a live candidate.
    Assembled,
    /// `execute_workflow` is in progress.
    Running,
    /// Every step completed successfully.
    Completed,
    /// At least one step failed.
    Failed,
    /// Cancelled by a caller or by manager shutdown.
    Cancelled,
    /// Skipped, e.g. superseded by a later workflow.
    Skipped,
}

/// Lifecycle status of a single step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    /// Not yet attempted.
    Pending,
    /// Currently dispatched to an agent.
    Running,
    /// Completed successfully.
    Completed,
    /// Failed (timeout or processing error).
    Failed,
    /// Skipped because an earlier step failed unrecoverably.
    Skipped,
}

/// One step of a workflow: a capability requirement plus its execution
/// state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowStep {
    /// Unique id for this step.
    pub id: StepId,
    /// The capability this step requires.
    pub capability: CapabilityKind,
    /// Parameters passed to the agent as the request payload.
    pub parameters: serde_json::Value,
    /// Current status.
    pub status: StepStatus,
    /// The agent assigned to run this step, once selected.
    pub assigned_agent_id: Option<AgentId>,
    /// When the step entered `Running`.
    pub start_time: Option<DateTime<Utc>>,
    /// When the step left `Running`.
    pub end_time: Option<DateTime<Utc>>,
    /// Error message, set only when `status == Failed`.
    pub error: Option<String>,
    /// The agent's response payload, set only on success.
    pub result: Option<serde_json::Value>,
    /// Agent ids this step's assigned agent names as dependents to
    /// trigger, once, after this step completes.
    pub dependencies: Vec<AgentId>,
    /// Per-step timeout override, in milliseconds.
    pub timeout_ms: Option<u64>,
}

impl WorkflowStep {
    fn new(capability: CapabilityKind) -> Self {
        Self {
            id: StepId::generate(),
            capability,
            parameters: serde_json::Value::Null,
            status: StepStatus::Pending,
            assigned_agent_id: None,
            start_time: None,
            end_time: None,
            error: None,
            result: None,
            dependencies: Vec::new(),
            timeout_ms: None,
        }
    }
}

/// A single `{state, timestamp}` entry appended to a workflow's history.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HistoryEntry {
    /// The state or event name, e.g. `"created"`, `"assembled"`, `"cancelled"`.
    pub state: String,
    /// When this entry was appended.
    pub timestamp: DateTime<Utc>,
}

/// An ordered sequence of capability-backed steps.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Workflow {
    /// Unique id.
    pub id: WorkflowId,
    /// Human-readable name.
    pub name: String,
    /// Human-readable description.
    pub description: String,
    /// Current status.
    pub status: WorkflowStatus,
    /// Ordered steps.
    pub steps: Vec<WorkflowStep>,
    /// When this workflow was created.
    pub created_at: DateTime<Utc>,
    /// When this workflow was last mutated. Monotonically non-decreasing.
    pub updated_at: DateTime<Utc>,
    /// Free-form metadata, including `max_agents_per_capability` and
    /// `load_balancing_strategy` recorded by `create_workflow`.
    pub metadata: HashMap<String, serde_json::Value>,
    /// The capabilities this workflow requires, in declaration order.
    pub required_capabilities: Vec<CapabilityKind>,
    /// Append-only log of state transitions.
    pub history: Vec<HistoryEntry>,
    /// Top-level error, set when `status == Failed` or `Cancelled`.
    pub error: Option<String>,
}

impl Workflow {
    fn push_history(&mut self, state: impl Into<String>) {
        let now = Utc::now();
        self.history.push(HistoryEntry {
            state: state.into(),
            timestamp: now,
        });
        self.updated_at = now;
    }
}

/// How a step's candidate agent is chosen once multiple satisfy the
/// capability, after the monitor/dependency/test-filter passes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum SelectionPolicy {
    /// Prefer the earliest-registered remaining candidate.
    Oldest,
    /// Prefer the most-recently-registered remaining candidate.
    #[default]
    Newest,
}

/// How candidates are distributed across a step when
/// `max_agents_per_capability` names more than one agent in the
/// assignment report produced by `assemble_workflow`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum LoadBalancingStrategy {
    /// Take the first `max_agents_per_capability` candidates in
    /// registration order.
    #[default]
    RoundRobin,
    /// Prefer the agents with the fewest recorded processing errors.
    LeastErrors,
}

/// Report returned by `assemble_workflow`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum AssemblyReport {
    /// Every required capability resolved to at least one live agent.
    Success {
        /// `(capability, agent_ids)` assignments, in declaration order.
        agents: Vec<(String, Vec<AgentId>)>,
    },
    /// At least one required capability has no capable agent, or a
    /// liveness ping failed.
    Error {
        /// Always `"missing_capabilities"` or `"liveness_failure"`.
        error: String,
        /// Capability kinds that failed to resolve.
        details: Vec<String>,
    },
}

/// Report returned by `validate_workflow`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ValidationReport {
    /// Whether the workflow is structurally and capability-wise sound.
    pub valid: bool,
    /// Hard errors (cycles, missing capabilities).
    pub errors: Vec<String>,
    /// Non-fatal warnings.
    pub warnings: Vec<String>,
    /// Capability kinds with zero registered agents, if any.
    pub missing_capabilities: Option<Vec<String>>,
}

/// Outcome of `execute_workflow`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionResult {
    /// The executed workflow's id.
    pub workflow_id: WorkflowId,
    /// `"success"`, `"completed"`, or `"failed"` — kept as a string rather
    /// than reusing `WorkflowStatus` so callers consuming this as JSON see
    /// the exact vocabulary named in the external contract.
    pub status: String,
    /// The workflow's terminal `WorkflowStatus`.
    pub workflow_status: WorkflowStatus,
    /// Per-step results keyed by step id, with any `AgentMessage` result
    /// already unwrapped to its content.
    pub results: HashMap<StepId, serde_json::Value>,
    /// Set when `status == "failed"`.
    pub error: Option<String>,
}

/// A single alert surfaced by `get_system_health`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Alert {
    /// `"workflow_failed"` or `"step_failed"`.
    pub kind: String,
    /// The workflow this alert concerns.
    pub workflow_id: WorkflowId,
    /// The step this alert concerns, for `step_failed` alerts.
    pub step_id: Option<StepId>,
    /// Human-readable detail.
    pub message: String,
    /// When the alert was raised.
    pub at: DateTime<Utc>,
}

/// System-wide health snapshot.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SystemHealth {
    /// Workflow counts by status.
    pub workflow_counts: HashMap<String, usize>,
    /// Currently active alerts.
    pub alerts: Vec<Alert>,
}

/// Aggregate execution metrics for one workflow.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WorkflowMetrics {
    /// Wall-clock time from `Running` to terminal status, in milliseconds.
    pub execution_time_ms: Option<u64>,
    /// Step counts by status.
    pub completed_steps: usize,
    /// Step counts by status.
    pub failed_steps: usize,
    /// Step counts by status.
    pub pending_steps: usize,
    /// Step counts by status.
    pub running_steps: usize,
    /// Step counts by status.
    pub skipped_steps: usize,
    /// Per-agent processing error counts accumulated across executions of
    /// this workflow.
    pub per_agent_errors: HashMap<AgentId, u64>,
    /// The workflow's history, duplicated here for convenience.
    pub history: Vec<HistoryEntry>,
}

struct CapabilityCacheEntry {
    agents: Vec<Arc<dyn AgentHandle>>,
    inserted_at: Instant,
}

/// Creates, assembles, executes, and recovers multi-step workflows.
pub struct WorkflowManager {
    registry: Arc<AgentRegistry>,
    router: Arc<CapabilityRouter>,
    notifier: WorkflowNotifier,
    persistence: Arc<dyn WorkflowPersistence>,
    config: RuntimeConfig,
    workflows: DashMap<WorkflowId, Arc<RwLock<Workflow>>>,
    capability_cache: RwLock<HashMap<String, CapabilityCacheEntry>>,
    selection_policies: RwLock<HashMap<String, SelectionPolicy>>,
    per_agent_errors: DashMap<AgentId, u64>,
    alerts: RwLock<Vec<Alert>>,
}

impl WorkflowManager {
    /// Builds a manager over `registry`, routing through `router`,
    /// reporting through `notifier`, and persisting through `persistence`.
    #[must_use]
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        registry: Arc<AgentRegistry>,
        router: Arc<CapabilityRouter>,
        notifier: WorkflowNotifier,
        persistence: Arc<dyn WorkflowPersistence>,
        config: RuntimeConfig,
    ) -> Self {
        let mut policies = HashMap::new();
        policies.insert(CapabilityKind::Research.as_str().to_string(), SelectionPolicy::Oldest);
        Self {
            registry,
            router,
            notifier,
            persistence,
            config,
            workflows: DashMap::new(),
            capability_cache: RwLock::new(HashMap::new()),
            selection_policies: RwLock::new(policies),
            per_agent_errors: DashMap::new(),
            alerts: RwLock::new(Vec::new()),
        }
    }

    /// Overrides the tie-break policy applied to `kind` in step selection.
    pub async fn set_selection_policy(&self, kind: &CapabilityKind, policy: SelectionPolicy) {
        self.selection_policies
            .write()
            .await
            .insert(kind.as_str().to_string(), policy);
    }

    async fn policy_for(&self, kind: &CapabilityKind) -> SelectionPolicy {
        self.selection_policies
            .read()
            .await
            .get(kind.as_str())
            .copied()
            .unwrap_or_default()
    }

    /// Creates a new workflow in `Pending`, opportunistically assembling
    /// it immediately if every required capability already has a
    /// candidate agent.
    #[instrument(skip(self, required_capabilities))]
    pub async fn create_workflow(
        &self,
        name: impl Into<String>,
        description: impl Into<String>,
        required_capabilities: Vec<CapabilityKind>,
        max_agents_per_capability: usize,
        load_balancing_strategy: LoadBalancingStrategy,
    ) -> WorkflowId {
        let id = WorkflowId::generate();
        let now = Utc::now();
        let mut metadata = HashMap::new();
        metadata.insert(
            "max_agents_per_capability".to_string(),
            serde_json::json!(max_agents_per_capability),
        );
        metadata.insert(
            "load_balancing_strategy".to_string(),
            serde_json::json!(load_balancing_strategy),
        );

        let mut workflow = Workflow {
            id,
            name: name.into(),
            description: description.into(),
            status: WorkflowStatus::Pending,
            steps: Vec::new(),
            created_at: now,
            updated_at: now,
            metadata,
            required_capabilities,
            history: Vec::new(),
            error: None,
        };
        workflow.push_history("created");

        self.workflows.insert(id, Arc::new(RwLock::new(workflow)));
        self.persist(id).await;

        if self.capabilities_all_available(id).await {
            let _ = self.assemble_workflow(id).await;
        }

        id
    }

    /// Registers an externally constructed workflow under its own id,
    /// persisting it immediately.
    pub async fn register_workflow(&self, workflow: Workflow) {
        let id = workflow.id;
        self.workflows.insert(id, Arc::new(RwLock::new(workflow)));
        self.persist(id).await;
    }

    async fn capabilities_all_available(&self, id: WorkflowId) -> bool {
        let Some(handle) = self.workflows.get(&id).map(|e| e.clone()) else {
            return false;
        };
        let kinds = handle.read().await.required_capabilities.clone();
        for kind in &kinds {
            if self.agents_for(kind).await.is_empty() {
                return false;
            }
        }
        true
    }

    async fn agents_for(&self, kind: &CapabilityKind) -> Vec<Arc<dyn AgentHandle>> {
        let key = kind.as_str().to_string();
        if let Some(entry) = self.capability_cache.read().await.get(&key) {
            if entry.inserted_at.elapsed() < self.config.workflow_cache_ttl {
                return entry.agents.clone();
            }
        }
        let agents = self.registry.get_agents_by_capability(kind).await;
        self.capability_cache.write().await.insert(
            key,
            CapabilityCacheEntry {
                agents: agents.clone(),
                inserted_at: Instant::now(),
            },
        );
        agents
    }

    /// Clears the workflow capability cache.
    pub async fn clear_capability_cache(&self) {
        self.capability_cache.write().await.clear();
    }

    /// Creates one step per required capability if absent, validates
    /// every capability resolves to at least one agent, pings the first
    /// candidate per kind for liveness, and transitions `Pending` →
    /// `Assembled`. Idempotent once already `Assembled`.
    ///
    /// # Errors
    /// Returns [`CoreError::NotFound`] if `id` is unknown.
    #[instrument(skip(self))]
    pub async fn assemble_workflow(&self, id: WorkflowId) -> CoreResult<AssemblyReport> {
        let handle = self
            .workflows
            .get(&id)
            .map(|e| e.clone())
            .ok_or_else(|| CoreError::NotFound(id.to_string()))?;

        {
            let workflow = handle.read().await;
            if workflow.status == WorkflowStatus::Assembled {
                let agents = self.current_assignment_report(&workflow).await;
                return Ok(agents);
            }
        }

        let required = handle.read().await.required_capabilities.clone();
        let max_per_capability = {
            let workflow = handle.read().await;
            workflow
                .metadata
                .get("max_agents_per_capability")
                .and_then(serde_json::Value::as_u64)
                .unwrap_or(1) as usize
        };

        let mut missing = Vec::new();
        let mut assignments = Vec::new();
        for kind in &required {
            let candidates = self.agents_for(kind).await;
            if candidates.is_empty() {
                missing.push(kind.as_str().to_string());
                continue;
            }
            let first = candidates[0].clone();
            let ping = AgentMessage::try_new(
                first.id().clone(),
                first.id().clone(),
                serde_json::json!({"ping": true}),
                "ping",
            )?;
            if first.process_message(ping).await.is_err() {
                missing.push(kind.as_str().to_string());
                continue;
            }
            let ids: Vec<AgentId> = candidates
                .iter()
                .take(max_per_capability.max(1))
                .map(|a| a.id().clone())
                .collect();
            assignments.push((kind.as_str().to_string(), ids));
        }

        if !missing.is_empty() {
            return Ok(AssemblyReport::Error {
                error: "missing_capabilities".to_string(),
                details: missing,
            });
        }

        let mut workflow = handle.write().await;
        if workflow.steps.is_empty() {
            for kind in &required {
                workflow.steps.push(WorkflowStep::new(kind.clone()));
            }
        }
        workflow.status = WorkflowStatus::Assembled;
        workflow.push_history("assembled");
        drop(workflow);

        self.persist(id).await;
        let agent_ids: Vec<AgentId> = assignments.iter().flat_map(|(_, ids)| ids.clone()).collect();
        self.notifier.notify_workflow_assembled(id, agent_ids);

        Ok(AssemblyReport::Success { agents: assignments })
    }

    async fn current_assignment_report(&self, workflow: &Workflow) -> AssemblyReport {
        let mut assignments = Vec::new();
        for step in &workflow.steps {
            if let Some(agent_id) = &step.assigned_agent_id {
                assignments.push((step.capability.as_str().to_string(), vec![agent_id.clone()]));
            }
        }
        AssemblyReport::Success { agents: assignments }
    }

    /// Runs every step of `id` in declaration order, honoring
    /// per-step timeouts and selection policy, reporting progress
    /// through the notifier, and persisting the final state.
    ///
    /// # Errors
    /// Returns [`CoreError::NotFound`] if `id` is unknown.
    #[instrument(skip(self, initial_data))]
    pub async fn execute_workflow(
        &self,
        id: WorkflowId,
        initial_data: Option<serde_json::Value>,
    ) -> CoreResult<ExecutionResult> {
        let handle = self
            .workflows
            .get(&id)
            .map(|e| e.clone())
            .ok_or_else(|| CoreError::NotFound(id.to_string()))?;

        {
            let mut workflow = handle.write().await;
            workflow.status = WorkflowStatus::Running;
            workflow.push_history("running");
        }
        self.persist(id).await;

        let step_count = handle.read().await.steps.len();
        if step_count == 0 {
            let report = self.assemble_workflow(id).await?;
            if let AssemblyReport::Error { error, .. } = report {
                let mut workflow = handle.write().await;
                workflow.status = WorkflowStatus::Failed;
                workflow.error = Some(error.clone());
                workflow.push_history("failed");
                drop(workflow);
                self.persist(id).await;
                return Ok(ExecutionResult {
                    workflow_id: id,
                    status: "failed".to_string(),
                    workflow_status: WorkflowStatus::Failed,
                    results: HashMap::new(),
                    error: Some(error),
                });
            }
        }

        let mut triggered_dependents: std::collections::HashSet<AgentId> = std::collections::HashSet::new();
        let mut results = HashMap::new();
        let mut any_failed = false;

        let step_ids: Vec<StepId> = handle.read().await.steps.iter().map(|s| s.id).collect();
        for step_id in step_ids {
            self.clear_capability_cache().await;

            {
                let workflow = handle.read().await;
                if workflow.status == WorkflowStatus::Cancelled {
                    let error = workflow.error.clone();
                    drop(workflow);
                    return Ok(ExecutionResult {
                        workflow_id: id,
                        status: "cancelled".to_string(),
                        workflow_status: WorkflowStatus::Cancelled,
                        results,
                        error,
                    });
                }
            }

            let (capability, parameters, timeout_ms, dependencies) = {
                let workflow = handle.read().await;
                let step = workflow.steps.iter().find(|s| s.id == step_id).expect("step exists");
                (
                    step.capability.clone(),
                    step.parameters.clone(),
                    step.timeout_ms,
                    step.dependencies.clone(),
                )
            };
            let payload = if parameters.is_null() {
                initial_data.clone().unwrap_or(serde_json::Value::Null)
            } else {
                parameters
            };

            let agent = match self.select_agent(&capability).await {
                Some(agent) => agent,
                None => {
                    self.fail_step(&handle, step_id, "no agent available for capability").await;
                    any_failed = true;
                    continue;
                }
            };

            if !agent.has_capability((&capability).into()).await.unwrap_or(false) {
                let _ = agent.add_capability(Capability::new(capability.clone())).await;
            }

            {
                let mut workflow = handle.write().await;
                if let Some(step) = workflow.steps.iter_mut().find(|s| s.id == step_id) {
                    step.status = StepStatus::Running;
                    step.assigned_agent_id = Some(agent.id().clone());
                    step.start_time = Some(Utc::now());
                }
            }
            self.persist(id).await;

            let message = AgentMessage::try_new(
                AgentId::try_new("workflow_manager".to_string()).unwrap_or_else(|_| agent.id().clone()),
                agent.id().clone(),
                serde_json::json!({
                    "workflow_id": id.to_string(),
                    "step_id": step_id.to_string(),
                    "capability": capability.as_str(),
                    "parameters": payload,
                }),
                "workflow_step",
            )?;

            let step_timeout = timeout_ms.map(Duration::from_millis).unwrap_or(self.config.default_step_timeout);
            let outcome = timeout(step_timeout, agent.process_message(message)).await;

            match outcome {
                Ok(Ok(value)) => {
                    let mut workflow = handle.write().await;
                    if let Some(step) = workflow.steps.iter_mut().find(|s| s.id == step_id) {
                        step.status = StepStatus::Completed;
                        step.end_time = Some(Utc::now());
                        step.result = Some(value.clone());
                    }
                    drop(workflow);
                    results.insert(step_id, value);

                    for dependent_id in &dependencies {
                        if triggered_dependents.insert(dependent_id.clone()) {
                            self.trigger_dependent(dependent_id).await;
                        }
                    }
                    for other in self.registry.list_all() {
                        if other.dependencies().contains(agent.id())
                            && triggered_dependents.insert(other.id().clone())
                        {
                            self.trigger_dependent(other.id()).await;
                        }
                    }
                }
                Ok(Err(err)) => {
                    self.fail_step(&handle, step_id, &err.to_string()).await;
                    *self.per_agent_errors.entry(agent.id().clone()).or_insert(0) += 1;
                    any_failed = true;
                }
                Err(_) => {
                    self.fail_step(&handle, step_id, "timeout").await;
                    *self.per_agent_errors.entry(agent.id().clone()).or_insert(0) += 1;
                    any_failed = true;
                }
            }
            self.persist(id).await;
        }

        let final_status = if any_failed {
            WorkflowStatus::Failed
        } else {
            WorkflowStatus::Completed
        };

        {
            let mut workflow = handle.write().await;
            if workflow.status == WorkflowStatus::Cancelled {
                let error = workflow.error.clone();
                drop(workflow);
                return Ok(ExecutionResult {
                    workflow_id: id,
                    status: "cancelled".to_string(),
                    workflow_status: WorkflowStatus::Cancelled,
                    results,
                    error,
                });
            }
            workflow.status = final_status;
            if any_failed {
                workflow.error = Some("one or more steps failed".to_string());
                workflow.push_history("failed");
                self.alerts.write().await.push(Alert {
                    kind: "workflow_failed".to_string(),
                    workflow_id: id,
                    step_id: None,
                    message: "one or more steps failed".to_string(),
                    at: Utc::now(),
                });
            } else {
                workflow.push_history("completed");
            }
        }
        self.persist(id).await;

        Ok(ExecutionResult {
            workflow_id: id,
            status: if any_failed { "failed".to_string() } else { "completed".to_string() },
            workflow_status: final_status,
            results,
            error: if any_failed { Some("one or more steps failed".to_string()) } else { None },
        })
    }

    async fn fail_step(&self, handle: &Arc<RwLock<Workflow>>, step_id: StepId, error: &str) {
        let mut workflow = handle.write().await;
        let workflow_id = workflow.id;
        if let Some(step) = workflow.steps.iter_mut().find(|s| s.id == step_id) {
            step.status = StepStatus::Failed;
            step.end_time = Some(Utc::now());
            step.error = Some(error.to_string());
        }
        drop(workflow);
        warn!(%workflow_id, %step_id, error, "workflow step failed");
        self.alerts.write().await.push(Alert {
            kind: "step_failed".to_string(),
            workflow_id,
            step_id: Some(step_id),
            message: error.to_string(),
            at: Utc::now(),
        });
    }

    async fn trigger_dependent(&self, agent_id: &AgentId) {
        let Some(agent) = self.registry.get_agent(agent_id) else {
            return;
        };
        let Ok(message) = AgentMessage::try_new(
            agent_id.clone(),
            agent_id.clone(),
            serde_json::json!({"trigger": "dependency_satisfied"}),
            "dependency_trigger",
        ) else {
            return;
        };
        if let Err(err) = agent.process_message(message).await {
            warn!(%agent_id, error = %err, "dependent trigger failed");
        }
    }

    /// Selects an agent for `capability` via the five-step policy:
    /// monitor role, dependency preference, test-fixture exclusion, the
    /// capability's configured tie-break, and a phantom-worker fallback.
    async fn select_agent(&self, capability: &CapabilityKind) -> Option<Arc<dyn AgentHandle>> {
        let mut candidates = self.agents_for(capability).await;
        if candidates.is_empty() && !self.config.allow_phantom_workers {
            return None;
        }
        if candidates.is_empty() {
            return self.spawn_phantom_worker(capability).await;
        }

        if capability.is_monitoring() {
            if let Some(monitor) = candidates.iter().find(|a| a.is_monitor()) {
                return Some(monitor.clone());
            }
        }

        let all_agents = self.registry.list_all();
        let depended_on: std::collections::HashSet<AgentId> = all_agents
            .iter()
            .flat_map(|a| a.dependencies().iter().cloned())
            .collect();
        let preferred: Vec<_> = candidates
            .iter()
            .filter(|a| depended_on.contains(a.id()))
            .cloned()
            .collect();
        if !preferred.is_empty() {
            candidates = preferred;
        }

        let non_test: Vec<_> = candidates.iter().filter(|a| !a.is_test_only()).cloned().collect();
        if !non_test.is_empty() {
            candidates = non_test;
        }

        let prefs = RoutingPreferences {
            preferred_agents: candidates.iter().map(|a| a.id().clone()).collect(),
            avoid_agents: Vec::new(),
        };
        if let Some(best) = self.router.find_best_agent(capability, None, Some(0.0), Some(&prefs)).await {
            if candidates.iter().any(|a| a.id() == best.id()) {
                return Some(best);
            }
        }

        let policy = self.policy_for(capability).await;
        candidates.sort_by_key(|a| a.registration_index());
        match policy {
            SelectionPolicy::Oldest => candidates.into_iter().next(),
            SelectionPolicy::Newest => candidates.into_iter().next_back(),
        }
    }

    async fn spawn_phantom_worker(&self, capability: &CapabilityKind) -> Option<Arc<dyn AgentHandle>> {
        let id = AgentId::try_new(format!("phantom_{}_{}", capability.as_str(), uuid::Uuid::new_v4())).ok()?;
        let agent: Arc<dyn AgentHandle> =
            Arc::new(Agent::new(id, "phantom_worker", Echo).with_config(&self.config));
        let cap = Capability::new(capability.clone());
        self.registry.register_agent(agent.clone(), vec![cap]).await.ok()?;
        info!(capability = %capability, "spawned phantom worker (no registered candidate)");
        Some(agent)
    }

    /// Transitions `id` to `Cancelled` with `reason` as the recorded
    /// error, persisting the final state.
    ///
    /// # Errors
    /// Returns [`CoreError::NotFound`] if `id` is unknown.
    pub async fn cancel_workflow(&self, id: WorkflowId, reason: impl Into<String>) -> CoreResult<()> {
        let handle = self
            .workflows
            .get(&id)
            .map(|e| e.clone())
            .ok_or_else(|| CoreError::NotFound(id.to_string()))?;
        {
            let mut workflow = handle.write().await;
            workflow.status = WorkflowStatus::Cancelled;
            workflow.error = Some(reason.into());
            workflow.push_history("cancelled");
        }
        self.persist(id).await;
        Ok(())
    }

    /// Like `cancel_workflow`, but only valid while the workflow is
    /// `Running`.
    ///
    /// # Errors
    /// Returns [`CoreError::NotFound`] if unknown, or
    /// [`CoreError::Cancelled`] if the workflow is not currently running.
    pub async fn stop_workflow(&self, id: WorkflowId) -> CoreResult<()> {
        let handle = self
            .workflows
            .get(&id)
            .map(|e| e.clone())
            .ok_or_else(|| CoreError::NotFound(id.to_string()))?;
        if handle.read().await.status != WorkflowStatus::Running {
            return Err(CoreError::Cancelled("workflow is not running".to_string()));
        }
        self.cancel_workflow(id, "Workflow cancelled by stop_workflow".to_string()).await
    }

    /// Checks capability availability and flags an unassembled workflow.
    ///
    /// There is no step-to-step edge to walk for cycles here: steps run
    /// strictly in declaration order and a step's `dependencies` names the
    /// agents to notify on completion, not downstream steps, so this
    /// data model has no step dependency graph that could contain a cycle.
    pub async fn validate_workflow(&self, id: WorkflowId) -> CoreResult<ValidationReport> {
        let handle = self
            .workflows
            .get(&id)
            .map(|e| e.clone())
            .ok_or_else(|| CoreError::NotFound(id.to_string()))?;
        let workflow = handle.read().await;

        let mut report = ValidationReport { valid: true, ..Default::default() };

        if workflow.steps.is_empty() && !workflow.required_capabilities.is_empty() {
            report.warnings.push("workflow has not been assembled yet".to_string());
        }

        let mut missing = Vec::new();
        for kind in &workflow.required_capabilities {
            if self.agents_for(kind).await.is_empty() {
                missing.push(kind.as_str().to_string());
            }
        }
        if !missing.is_empty() {
            report.valid = false;
            report.errors.push("missing_capabilities".to_string());
            report.missing_capabilities = Some(missing);
        }

        Ok(report)
    }

    /// Returns a snapshot of workflow `id`.
    pub async fn get_workflow(&self, id: WorkflowId) -> Option<Workflow> {
        let handle = self.workflows.get(&id)?.clone();
        Some(handle.read().await.clone())
    }

    /// Returns the current status of workflow `id`.
    pub async fn get_workflow_status(&self, id: WorkflowId) -> Option<WorkflowStatus> {
        let handle = self.workflows.get(&id)?.clone();
        Some(handle.read().await.status)
    }

    /// Aggregates execution metrics for workflow `id`.
    pub async fn get_workflow_metrics(&self, id: WorkflowId) -> Option<WorkflowMetrics> {
        let handle = self.workflows.get(&id)?.clone();
        let workflow = handle.read().await;

        let mut metrics = WorkflowMetrics {
            history: workflow.history.clone(),
            ..Default::default()
        };
        for step in &workflow.steps {
            match step.status {
                StepStatus::Completed => metrics.completed_steps += 1,
                StepStatus::Failed => metrics.failed_steps += 1,
                StepStatus::Pending => metrics.pending_steps += 1,
                StepStatus::Running => metrics.running_steps += 1,
                StepStatus::Skipped => metrics.skipped_steps += 1,
            }
        }
        if let (Some(first), Some(last)) = (workflow.history.first(), workflow.history.last()) {
            let elapsed = last.timestamp.signed_duration_since(first.timestamp);
            metrics.execution_time_ms = u64::try_from(elapsed.num_milliseconds()).ok();
        }
        for step in &workflow.steps {
            if let Some(agent_id) = &step.assigned_agent_id {
                if let Some(count) = self.per_agent_errors.get(agent_id) {
                    metrics.per_agent_errors.insert(agent_id.clone(), *count);
                }
            }
        }
        Some(metrics)
    }

    /// Currently active alerts, most recent first.
    pub async fn get_active_alerts(&self) -> Vec<Alert> {
        let mut alerts = self.alerts.read().await.clone();
        alerts.reverse();
        alerts
    }

    /// System-wide workflow counts and active alerts.
    pub async fn get_system_health(&self) -> SystemHealth {
        let mut counts = HashMap::new();
        let ids: Vec<WorkflowId> = self.workflows.iter().map(|e| *e.key()).collect();
        for id in ids {
            if let Some(handle) = self.workflows.get(&id).map(|e| e.clone()) {
                let status = handle.read().await.status;
                let key = format!("{status:?}").to_lowercase();
                *counts.entry(key).or_insert(0) += 1;
            }
        }
        SystemHealth {
            workflow_counts: counts,
            alerts: self.get_active_alerts().await,
        }
    }

    async fn persist(&self, id: WorkflowId) {
        let Some(handle) = self.workflows.get(&id).map(|e| e.clone()) else {
            return;
        };
        let snapshot = handle.read().await.clone();
        if let Err(err) = self.persistence.save_workflow(&snapshot).await {
            crate::persistence::log_failure(id, &err);
        }
    }

    /// Cancels every `Running` workflow and persists the terminal state.
    /// Called by the owning application during graceful shutdown.
    pub async fn shutdown(&self) {
        let ids: Vec<WorkflowId> = self.workflows.iter().map(|e| *e.key()).collect();
        for id in ids {
            let Some(handle) = self.workflows.get(&id).map(|e| e.clone()) else {
                continue;
            };
            if handle.read().await.status == WorkflowStatus::Running {
                let _ = self.cancel_workflow(id, "shutdown").await;
            }
        }
    }
}

impl WorkflowManager {
    async fn try_assemble_pending(&self) {
        let ids: Vec<WorkflowId> = self.workflows.iter().map(|e| *e.key()).collect();
        for id in ids {
            let Some(handle) = self.workflows.get(&id).map(|e| e.clone()) else {
                continue;
            };
            if handle.read().await.status != WorkflowStatus::Pending {
                continue;
            }
            if self.capabilities_all_available(id).await {
                let _ = self.assemble_workflow(id).await;
            }
        }
    }
}

#[async_trait]
impl RegistryObserver for WorkflowManager {
    async fn on_agent_registered(&self, _agent_id: &AgentId) {
        self.clear_capability_cache().await;
        self.try_assemble_pending().await;
    }

    async fn on_agent_unregistered(&self, agent_id: &AgentId) {
        self.clear_capability_cache().await;
        let ids: Vec<WorkflowId> = self.workflows.iter().map(|e| *e.key()).collect();
        for id in ids {
            let Some(handle) = self.workflows.get(&id).map(|e| e.clone()) else {
                continue;
            };
            let mut workflow = handle.write().await;
            if workflow.status != WorkflowStatus::Running {
                continue;
            }
            for step in &mut workflow.steps {
                if step.assigned_agent_id.as_ref() == Some(agent_id) && step.status == StepStatus::Running {
                    step.status = StepStatus::Pending;
                    step.assigned_agent_id = None;
                    step.error = Some(format!("agent {agent_id} unregistered mid-step"));
                }
            }
        }
    }

    async fn on_capability_updated(&self, _agent_id: &AgentId, _capabilities: &[Capability]) {
        self.clear_capability_cache().await;
        self.try_assemble_pending().await;
    }
}

//! End-to-end coverage of workflow creation, assembly, execution, and
//! recovery through the public `Runtime` facade.

use std::sync::Arc;

use conductor::agent::{Agent, AgentHandle, AgentStatus, AlwaysFails, Echo};
use conductor::capability::{Capability, CapabilityKind};
use conductor::types::AgentId;
use conductor::workflow::{LoadBalancingStrategy, WorkflowStatus};
use conductor::Runtime;
use test_log::test;

fn agent_id(s: &str) -> AgentId {
    AgentId::try_new(s.to_string()).unwrap()
}

#[test(tokio::test)]
async fn workflow_assembles_once_every_capability_has_a_candidate() {
    let runtime = Runtime::for_tests().await;

    let sensor = Arc::new(Agent::new(agent_id("sensor-1"), "sensor", Echo));
    runtime
        .registry
        .register_agent(sensor, vec![Capability::new(CapabilityKind::SensorReading)])
        .await
        .unwrap();

    let workflow_id = runtime
        .workflows
        .create_workflow(
            "readings",
            "collect one sensor reading",
            vec![CapabilityKind::SensorReading],
            1,
            LoadBalancingStrategy::RoundRobin,
        )
        .await;

    assert_eq!(
        runtime.workflows.get_workflow_status(workflow_id).await,
        Some(WorkflowStatus::Assembled)
    );

    runtime.shutdown().await;
}

#[test(tokio::test)]
async fn workflow_stays_pending_until_every_capability_is_covered() {
    let runtime = Runtime::for_tests().await;

    let workflow_id = runtime
        .workflows
        .create_workflow(
            "multi-step",
            "sensor reading, then research",
            vec![CapabilityKind::SensorReading, CapabilityKind::Research],
            1,
            LoadBalancingStrategy::RoundRobin,
        )
        .await;
    assert_eq!(
        runtime.workflows.get_workflow_status(workflow_id).await,
        Some(WorkflowStatus::Pending)
    );

    let sensor = Arc::new(Agent::new(agent_id("sensor-1"), "sensor", Echo));
    runtime
        .registry
        .register_agent(sensor, vec![Capability::new(CapabilityKind::SensorReading)])
        .await
        .unwrap();
    assert_eq!(
        runtime.workflows.get_workflow_status(workflow_id).await,
        Some(WorkflowStatus::Pending)
    );

    let researcher = Arc::new(Agent::new(agent_id("researcher-1"), "researcher", Echo));
    runtime
        .registry
        .register_agent(researcher, vec![Capability::new(CapabilityKind::Research)])
        .await
        .unwrap();
    assert_eq!(
        runtime.workflows.get_workflow_status(workflow_id).await,
        Some(WorkflowStatus::Assembled)
    );

    runtime.shutdown().await;
}

#[test(tokio::test)]
async fn execute_workflow_runs_every_step_and_completes() {
    let runtime = Runtime::for_tests().await;

    for (name, kind) in [
        ("sensor-1", CapabilityKind::SensorReading),
        ("processor-1", CapabilityKind::DataProcessing),
    ] {
        let agent = Arc::new(Agent::new(agent_id(name), "worker", Echo));
        runtime
            .registry
            .register_agent(agent, vec![Capability::new(kind)])
            .await
            .unwrap();
    }

    let workflow_id = runtime
        .workflows
        .create_workflow(
            "ingest",
            "read then process",
            vec![CapabilityKind::SensorReading, CapabilityKind::DataProcessing],
            1,
            LoadBalancingStrategy::RoundRobin,
        )
        .await;

    let result = runtime
        .workflows
        .execute_workflow(workflow_id, Some(serde_json::json!({"reading": 12.0})))
        .await
        .unwrap();

    assert_eq!(result.status, "completed");
    assert_eq!(result.workflow_status, WorkflowStatus::Completed);
    assert_eq!(result.results.len(), 2);

    runtime.shutdown().await;
}

#[test(tokio::test)]
async fn unregistering_an_agent_mid_flight_falls_back_to_another_candidate() {
    let runtime = Runtime::for_tests().await;

    let first = Arc::new(Agent::new(agent_id("sensor-1"), "sensor", Echo));
    let second = Arc::new(Agent::new(agent_id("sensor-2"), "sensor", Echo));
    runtime
        .registry
        .register_agent(first.clone(), vec![Capability::new(CapabilityKind::SensorReading)])
        .await
        .unwrap();
    runtime
        .registry
        .register_agent(second, vec![Capability::new(CapabilityKind::SensorReading)])
        .await
        .unwrap();

    runtime.registry.unregister_agent(first.id()).await;

    let workflow_id = runtime
        .workflows
        .create_workflow(
            "readings",
            "collect a reading from whichever sensor remains",
            vec![CapabilityKind::SensorReading],
            1,
            LoadBalancingStrategy::RoundRobin,
        )
        .await;
    let result = runtime.workflows.execute_workflow(workflow_id, None).await.unwrap();
    assert_eq!(result.status, "completed");

    runtime.shutdown().await;
}

#[test(tokio::test)]
async fn a_failing_agent_can_be_recovered_before_a_retry() {
    let runtime = Runtime::for_tests().await;

    let flaky = Arc::new(Agent::new(agent_id("flaky-1"), "worker", AlwaysFails));
    runtime
        .registry
        .register_agent(flaky.clone(), vec![Capability::new(CapabilityKind::MessageProcessing)])
        .await
        .unwrap();
    flaky.set_status(AgentStatus::Error).await;

    let recovered = runtime.registry.recover_agent(flaky.id(), "communication_error").await;
    assert!(recovered);
    assert_eq!(flaky.status().await, AgentStatus::Idle);

    runtime.shutdown().await;
}

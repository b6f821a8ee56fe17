//! Durable persistence coverage: a workflow executed against a real
//! `SQLite` file survives across a fresh `SqliteWorkflowStorage` handle
//! opened on the same path.

use std::sync::Arc;

use conductor::agent::{Agent, Echo};
use conductor::capability::{Capability, CapabilityKind};
use conductor::persistence::{DatabasePath, SqliteWorkflowStorage, WorkflowPersistence};
use conductor::types::AgentId;
use conductor::workflow::{LoadBalancingStrategy, WorkflowStatus};
use conductor::Runtime;
use test_log::test;

fn agent_id(s: &str) -> AgentId {
    AgentId::try_new(s.to_string()).unwrap()
}

#[test(tokio::test)]
async fn executed_workflow_snapshots_are_durable_across_a_reopened_connection() {
    let dir = tempfile::tempdir().unwrap();
    let db_path = dir.path().join("workflows.db");

    let persistence = Arc::new(
        SqliteWorkflowStorage::open(DatabasePath::new(&db_path).unwrap())
            .await
            .unwrap(),
    );
    let runtime = Runtime::new(conductor::RuntimeConfig::test(), persistence).await;

    let sensor = Arc::new(Agent::new(agent_id("sensor-1"), "sensor", Echo));
    runtime
        .registry
        .register_agent(sensor, vec![Capability::new(CapabilityKind::SensorReading)])
        .await
        .unwrap();

    let workflow_id = runtime
        .workflows
        .create_workflow(
            "durable-readings",
            "one durable sensor reading",
            vec![CapabilityKind::SensorReading],
            1,
            LoadBalancingStrategy::RoundRobin,
        )
        .await;
    let result = runtime
        .workflows
        .execute_workflow(workflow_id, Some(serde_json::json!({"reading": 7.0})))
        .await
        .unwrap();
    assert_eq!(result.status, "completed");

    runtime.shutdown().await;

    let reopened = SqliteWorkflowStorage::open(DatabasePath::new(&db_path).unwrap())
        .await
        .unwrap();
    let history = reopened.get_workflow_history(workflow_id).await.unwrap();

    assert!(history.len() >= 2, "expected at least a pending and a completed snapshot");
    assert_eq!(history.first().unwrap().status, WorkflowStatus::Pending);
    assert_eq!(history.last().unwrap().status, WorkflowStatus::Completed);
}

#[test(tokio::test)]
async fn database_path_rejects_non_db_extensions() {
    assert!(DatabasePath::new("workflows.db").is_ok());
    assert!(DatabasePath::new("workflows.sqlite").is_err());
}

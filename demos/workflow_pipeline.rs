//! Example demonstrating a full workflow pipeline: registration,
//! opportunistic assembly, execution, a simulated agent failure and
//! recovery, and a final system health snapshot.
//!
//! Run with:
//! ```text
//! rustc --edition 2024 -L target/debug/deps demos/workflow_pipeline.rs
//! ```
//! or wire it up as a `[[example]]` in Cargo.toml if you want `cargo run
//! --example workflow_pipeline`.

use conductor::agent::{Agent, AgentHandle, AgentStatus, Echo};
use conductor::capability::{Capability, CapabilityKind};
use conductor::types::AgentId;
use conductor::workflow::LoadBalancingStrategy;
use conductor::Runtime;
use std::sync::Arc;
use tokio::time::{sleep, Duration};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    println!("Starting workflow pipeline example");

    let runtime = Runtime::development().await;
    println!("Runtime assembled");

    let sensor = Arc::new(Agent::new(AgentId::try_new("sensor-1".to_string())?, "sensor", Echo));
    let processor = Arc::new(Agent::new(AgentId::try_new("processor-1".to_string())?, "processor", Echo));
    let researcher = Arc::new(Agent::new(AgentId::try_new("researcher-1".to_string())?, "researcher", Echo));

    runtime
        .registry
        .register_agent(sensor.clone(), vec![Capability::new(CapabilityKind::SensorReading)])
        .await?;
    runtime
        .registry
        .register_agent(processor.clone(), vec![Capability::new(CapabilityKind::DataProcessing)])
        .await?;
    println!("Registered sensor and processor agents");

    let workflow_id = runtime
        .workflows
        .create_workflow(
            "ingest-and-process",
            "collect a sensor reading and hand it to a processor",
            vec![CapabilityKind::SensorReading, CapabilityKind::DataProcessing, CapabilityKind::Research],
            1,
            LoadBalancingStrategy::RoundRobin,
        )
        .await;

    // The workflow can't assemble yet: no Research-capable agent exists.
    println!(
        "Workflow status before researcher joins: {:?}",
        runtime.workflows.get_workflow_status(workflow_id).await
    );

    runtime
        .registry
        .register_agent(researcher.clone(), vec![Capability::new(CapabilityKind::Research)])
        .await?;
    println!(
        "Workflow status after researcher joins: {:?}",
        runtime.workflows.get_workflow_status(workflow_id).await
    );

    // Simulate the sensor wedging, then recovering, before execution.
    sensor.set_status(AgentStatus::Error).await;
    let recovered = runtime.registry.recover_agent(sensor.id(), "timeout").await;
    println!("Sensor recovery succeeded: {recovered}");

    let result = runtime
        .workflows
        .execute_workflow(workflow_id, Some(serde_json::json!({"reading": 42.0})))
        .await?;
    println!("Workflow finished with status: {}", result.status);

    sleep(Duration::from_millis(10)).await;
    let health = runtime.workflows.get_system_health().await;
    println!("System health: {health:?}");

    runtime.shutdown().await;
    println!("Runtime shut down cleanly");
    Ok(())
}

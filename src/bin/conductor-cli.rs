//! Command-line interface for exercising the coordination core directly.
//!
//! A thin demonstration shell over [`conductor::Runtime`]: it spawns a
//! handful of `Echo` agents, assembles and runs one workflow, and prints
//! the result. It is not meant to be conductor's only embedding surface —
//! see the crate-level docs for the library API this wraps.

use clap::{Parser, Subcommand};
use conductor::agent::{Agent, Echo};
use conductor::capability::{Capability, CapabilityKind};
use conductor::observability::{init_tracing, LogFormat};
use conductor::types::AgentId;
use conductor::workflow::LoadBalancingStrategy;
use conductor::{Runtime, RuntimeConfig};
use std::sync::Arc;

/// conductor - a coordination substrate for multi-agent systems.
#[derive(Parser)]
#[command(name = "conductor-cli")]
#[command(version = env!("CARGO_PKG_VERSION"))]
struct Cli {
    /// Which configuration preset to run under.
    #[arg(long, value_enum, default_value = "development")]
    config: ConfigPreset,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Copy, clap::ValueEnum)]
enum ConfigPreset {
    Development,
    Production,
}

#[derive(Subcommand)]
enum Commands {
    /// Register a few demo agents and run a sensor/processor/research
    /// workflow end to end, printing the result as JSON.
    Demo,
    /// Print the system health snapshot after running the demo workflow.
    Health,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    let config = match cli.config {
        ConfigPreset::Development => RuntimeConfig::development(),
        ConfigPreset::Production => RuntimeConfig::production(),
    };
    init_tracing(&config, LogFormat::Pretty);

    let persistence = Arc::new(conductor::persistence::InMemoryWorkflowPersistence::new());
    let runtime = Runtime::new(config, persistence).await;

    register_demo_agents(&runtime).await?;
    let workflow_id = runtime
        .workflows
        .create_workflow(
            "demo-readings",
            "collect and process a sensor reading",
            vec![
                CapabilityKind::SensorReading,
                CapabilityKind::DataProcessing,
                CapabilityKind::Research,
            ],
            1,
            LoadBalancingStrategy::RoundRobin,
        )
        .await;
    let result = runtime
        .workflows
        .execute_workflow(workflow_id, Some(serde_json::json!({"reading": 21.5})))
        .await?;

    match cli.command {
        Commands::Demo => {
            println!("{}", serde_json::to_string_pretty(&result)?);
        }
        Commands::Health => {
            let health = runtime.workflows.get_system_health().await;
            println!("{}", serde_json::to_string_pretty(&health)?);
        }
    }

    runtime.shutdown().await;
    Ok(())
}

async fn register_demo_agents(runtime: &Runtime) -> Result<(), Box<dyn std::error::Error>> {
    let sensor = Arc::new(Agent::new(AgentId::try_new("sensor-1".to_string())?, "sensor", Echo));
    runtime
        .registry
        .register_agent(sensor, vec![Capability::new(CapabilityKind::SensorReading)])
        .await?;

    let processor = Arc::new(Agent::new(AgentId::try_new("processor-1".to_string())?, "processor", Echo));
    runtime
        .registry
        .register_agent(processor, vec![Capability::new(CapabilityKind::DataProcessing)])
        .await?;

    let researcher = Arc::new(Agent::new(AgentId::try_new("researcher-1".to_string())?, "researcher", Echo));
    runtime
        .registry
        .register_agent(researcher, vec![Capability::new(CapabilityKind::Research)])
        .await?;

    Ok(())
}

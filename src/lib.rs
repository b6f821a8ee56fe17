//! # conductor
//!
//! A coordination substrate for multi-agent systems: an agent registry, a
//! capability-based router, a recovery strategy engine, and a workflow
//! manager that assembles and executes multi-step capability pipelines
//! across whatever agents are registered at the time.
//!
//! The crate is deliberately a library, not a service: it owns no
//! network listener and no wire protocol of its own. Callers embed
//! [`Runtime`] in a process, register [`agent::AgentHandle`]
//! implementations against it, and drive workflows through
//! [`workflow::WorkflowManager`]. The included `conductor-cli` binary is a
//! thin demonstration shell over the same API.
//!
//! ## Example
//!
//! ```no_run
//! use conductor::agent::{Agent, Echo};
//! use conductor::capability::{Capability, CapabilityKind};
//! use conductor::types::AgentId;
//! use conductor::workflow::LoadBalancingStrategy;
//! use conductor::Runtime;
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let runtime = Runtime::development().await;
//!
//!     let sensor = Arc::new(Agent::new(AgentId::try_new("sensor-1".to_string())?, "sensor", Echo));
//!     runtime
//!         .registry
//!         .register_agent(sensor, vec![Capability::new(CapabilityKind::SensorReading)])
//!         .await?;
//!
//!     let workflow_id = runtime
//!         .workflows
//!         .create_workflow(
//!             "readings",
//!             "collect one sensor reading",
//!             vec![CapabilityKind::SensorReading],
//!             1,
//!             LoadBalancingStrategy::RoundRobin,
//!         )
//!         .await;
//!
//!     let result = runtime.workflows.execute_workflow(workflow_id, None).await?;
//!     println!("workflow finished: {}", result.status);
//!
//!     runtime.shutdown().await;
//!     Ok(())
//! }
//! ```

pub mod agent;
pub mod capability;
pub mod config;
pub mod error;
pub mod notifier;
pub mod observability;
pub mod persistence;
pub mod recovery;
pub mod registry;
pub mod router;
pub mod runtime;
pub mod types;
pub mod workflow;

pub use crate::config::RuntimeConfig;
pub use crate::error::{CoreError, CoreResult};
pub use crate::runtime::Runtime;

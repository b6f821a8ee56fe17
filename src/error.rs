//! Error taxonomy for the coordination core.
//!
//! Every fallible operation in this crate returns [`CoreError`] (or a
//! component-local alias of it). Observer and notifier handlers never
//! propagate errors to their callers; see the module docs on
//! [`crate::notifier`] and [`crate::registry`] for the swallow-and-log
//! policy applied there.

use crate::types::AgentId;
use thiserror::Error;

/// Errors produced by the registry, router, workflow manager, and recovery
/// engine.
#[derive(Error, Debug)]
pub enum CoreError {
    /// A component was used before its `initialize()` call completed.
    #[error("component used before initialization")]
    NotInitialized,

    /// Registration was attempted for an agent id already present.
    #[error("agent already registered: {0}")]
    AlreadyRegistered(AgentId),

    /// A lookup by id found nothing.
    #[error("not found: {0}")]
    NotFound(String),

    /// A capability string could not be mapped to a known kind.
    #[error("unknown capability: {0}")]
    UnknownCapability(String),

    /// No recipient or no capable agent could be resolved for a message.
    #[error("routing failed: {0}")]
    RouteFailed(String),

    /// An agent raised an error while processing a message.
    #[error("processing failed: {cause}")]
    ProcessingFailed {
        /// The underlying cause reported by the agent.
        cause: String,
    },

    /// A deadline was exceeded.
    #[error("operation timed out: {0}")]
    Timeout(String),

    /// A workflow was cancelled before it could complete.
    #[error("cancelled: {0}")]
    Cancelled(String),

    /// A workflow could not be assembled.
    #[error("workflow assembly failed: {reason}")]
    AssemblyFailed {
        /// Human-readable reason, e.g. missing capabilities or a failed
        /// liveness probe.
        reason: String,
    },

    /// A workflow snapshot could not be persisted. Never fatal to execution.
    #[error("persistence failed: {0}")]
    PersistenceFailed(String),

    /// Serialization of a value failed.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Convenience alias used throughout the crate.
pub type CoreResult<T> = Result<T, CoreError>;

//! Domain newtypes shared across the coordination core.
//!
//! Every identifier and bounded numeric is a distinct type rather than a
//! bare `String`/`u64`, following the "parse, don't validate" style used
//! throughout this codebase: once a value exists it is known-valid, and
//! invalid construction is a compile-time or construction-time error
//! rather than a runtime check scattered at every call site.

use nutype::nutype;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Unique identifier for an agent.
///
/// Agents in the wider system are named by callers (not generated), so
/// this wraps a validated string rather than a UUID: `sensor`, `monitor_1`,
/// and similar human-chosen names are the norm.
#[nutype(
    validate(len_char_min = 1, len_char_max = 255),
    derive(
        Debug,
        Clone,
        PartialEq,
        Eq,
        Hash,
        Serialize,
        Deserialize,
        Display,
        TryFrom,
        Into
    )
)]
pub struct AgentId(String);

/// Unique identifier for a workflow.
#[nutype(derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    Display,
    TryFrom,
    Into
))]
pub struct WorkflowId(Uuid);

impl WorkflowId {
    /// Generates a fresh random workflow id.
    #[must_use]
    pub fn generate() -> Self {
        Self::new(Uuid::new_v4())
    }
}

/// Unique identifier for a workflow step.
#[nutype(derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    Display,
    TryFrom,
    Into
))]
pub struct StepId(Uuid);

impl StepId {
    /// Generates a fresh random step id.
    #[must_use]
    pub fn generate() -> Self {
        Self::new(Uuid::new_v4())
    }
}

/// Unique identifier for a message.
#[nutype(derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    Display,
    TryFrom,
    Into
))]
pub struct MessageId(Uuid);

impl MessageId {
    /// Generates a fresh random message id.
    #[must_use]
    pub fn generate() -> Self {
        Self::new(Uuid::new_v4())
    }
}

/// A dotted-numeric capability version, e.g. `"1.0"` or `"2.3.1"`.
///
/// Stored as-is; parsing into comparable components happens at match time
/// (see [`crate::capability::compare_versions`]) since most versions are
/// never compared at all and eager parsing would be wasted work.
#[nutype(
    default = "1.0",
    validate(len_char_min = 1, len_char_max = 32),
    derive(
        Debug,
        Clone,
        PartialEq,
        Eq,
        Hash,
        Serialize,
        Deserialize,
        Display,
        Default,
        TryFrom,
        Into
    )
)]
pub struct CapabilityVersion(String);

/// A match score in the closed interval `[0.0, 1.0]`.
#[nutype(
    validate(finite, greater_or_equal = 0.0, less_or_equal = 1.0),
    derive(Debug, Clone, Copy, PartialEq, PartialOrd, Serialize, Deserialize, Into)
)]
pub struct Score(f64);

impl Score {
    /// The minimum score, `0.0`.
    #[must_use]
    pub fn zero() -> Self {
        Self::try_new(0.0).expect("0.0 is within [0.0, 1.0]")
    }
}

/// Registration sequence number, used to break ties deterministically by
/// recency. Monotonically increasing for the lifetime of a registry.
#[nutype(derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    Serialize,
    Deserialize,
    Into
))]
pub struct RegistrationIndex(u64);

//! Capabilities: the tags agents advertise and workflows require.
//!
//! A [`Capability`] is a `(kind, version)` pair. Equality and hashing only
//! look at those two fields — parameters and metadata are carried for
//! informational purposes and never participate in set membership, which
//! is what lets [`CapabilitySet`] support three distinct lookup keys (a
//! full `Capability`, a bare [`CapabilityKind`], or that kind's string
//! name).

use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::fmt;
use tokio::sync::RwLock;

use crate::error::{CoreError, CoreResult};
use crate::types::CapabilityVersion;

/// The fixed enumeration of capability kinds known to this runtime, plus a
/// free-form escape hatch for kinds defined outside it.
///
/// Unlike the knowledge-graph-backed system this runtime grew out of, new
/// capability kinds do not require a central registry entry: `Custom`
/// covers anything not worth naming here, and callers are free to match on
/// its string payload.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CapabilityKind {
    /// Produces or reports sensor readings.
    SensorReading,
    /// Transforms or summarizes data produced by other agents.
    DataProcessing,
    /// Performs open-ended investigation and produces recommendations.
    Research,
    /// Generic inter-agent message handling.
    MessageProcessing,
    /// Watches other agents or system state for anomalies.
    Monitoring,
    /// Any capability kind not named above.
    Custom(String),
}

impl CapabilityKind {
    /// The canonical string form of this kind, used for the string-keyed
    /// half of [`CapabilitySet`]'s membership test and for routing-cache
    /// keys.
    #[must_use]
    pub fn as_str(&self) -> &str {
        match self {
            Self::SensorReading => "sensor_reading",
            Self::DataProcessing => "data_processing",
            Self::Research => "research",
            Self::MessageProcessing => "message_processing",
            Self::Monitoring => "monitoring",
            Self::Custom(s) => s.as_str(),
        }
    }

    /// Parses a kind from its canonical string form. Unknown strings
    /// become `Custom` rather than failing, since the capability
    /// enumeration is intentionally open-ended; see
    /// [`CoreError::UnknownCapability`] for the one place an unrecognized
    /// string is instead treated as an error (explicit capability
    /// normalization at registration).
    #[must_use]
    pub fn parse(s: &str) -> Self {
        match s {
            "sensor_reading" => Self::SensorReading,
            "data_processing" => Self::DataProcessing,
            "research" => Self::Research,
            "message_processing" => Self::MessageProcessing,
            "monitoring" => Self::Monitoring,
            other => Self::Custom(other.to_string()),
        }
    }

    /// Whether this kind is considered part of the "monitoring" role for
    /// selection purposes (see `WorkflowManager` step selection, policy 1).
    #[must_use]
    pub fn is_monitoring(&self) -> bool {
        matches!(self, Self::Monitoring)
    }

    /// Whether this kind belongs to the "research" class, which defaults
    /// to an oldest-first tie-break (see `SelectionPolicy`).
    #[must_use]
    pub fn is_research_class(&self) -> bool {
        matches!(self, Self::Research)
    }
}

impl fmt::Display for CapabilityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A capability an agent advertises or a step requires: a kind plus a
/// version and optional parameters/metadata.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Capability {
    /// The kind of capability.
    pub kind: CapabilityKind,
    /// The dotted-numeric version this capability implements.
    pub version: CapabilityVersion,
    /// Free-form parameters describing how this capability is configured.
    pub parameters: HashMap<String, serde_json::Value>,
    /// Free-form metadata, never consulted by scoring or matching.
    pub metadata: HashMap<String, serde_json::Value>,
}

impl Capability {
    /// Builds a capability of the given kind at the default version
    /// (`"1.0"`) with no parameters or metadata.
    #[must_use]
    pub fn new(kind: CapabilityKind) -> Self {
        Self {
            kind,
            version: CapabilityVersion::default(),
            parameters: HashMap::new(),
            metadata: HashMap::new(),
        }
    }

    /// Builds a capability at an explicit version.
    #[must_use]
    pub fn at_version(kind: CapabilityKind, version: CapabilityVersion) -> Self {
        Self {
            kind,
            version,
            parameters: HashMap::new(),
            metadata: HashMap::new(),
        }
    }
}

// Equality and hashing are by (kind, version) only, matching the
// reference system's Capability so that a CapabilitySet never holds two
// entries that would be indistinguishable to a router.
impl PartialEq for Capability {
    fn eq(&self, other: &Self) -> bool {
        self.kind == other.kind && self.version == other.version
    }
}
impl Eq for Capability {}
impl std::hash::Hash for Capability {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.kind.hash(state);
        self.version.hash(state);
    }
}

/// Anything that can be compared for capability-set membership: a full
/// capability, a bare kind, or the kind's string name.
pub enum CapabilityKey<'a> {
    /// An exact capability (kind and version both must match).
    Exact(&'a Capability),
    /// Any capability of this kind, regardless of version.
    Kind(&'a CapabilityKind),
    /// Any capability whose kind's string name equals this value.
    Name(&'a str),
}

impl<'a> From<&'a Capability> for CapabilityKey<'a> {
    fn from(c: &'a Capability) -> Self {
        Self::Exact(c)
    }
}
impl<'a> From<&'a CapabilityKind> for CapabilityKey<'a> {
    fn from(k: &'a CapabilityKind) -> Self {
        Self::Kind(k)
    }
}
impl<'a> From<&'a str> for CapabilityKey<'a> {
    fn from(s: &'a str) -> Self {
        Self::Name(s)
    }
}

/// A thread-safe container of an agent's capabilities.
///
/// Must be initialized before use; every operation on an uninitialized set
/// returns [`CoreError::NotInitialized`], mirroring the reference system's
/// behavior of raising before its own `initialize()` call.
pub struct CapabilitySet {
    inner: RwLock<Option<HashSet<Capability>>>,
}

impl Default for CapabilitySet {
    fn default() -> Self {
        Self::new()
    }
}

impl CapabilitySet {
    /// Creates an uninitialized capability set.
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(None),
        }
    }

    /// Creates an already-initialized, empty capability set.
    #[must_use]
    pub fn initialized() -> Self {
        Self {
            inner: RwLock::new(Some(HashSet::new())),
        }
    }

    /// Marks the set initialized, seeding it with `caps`. Idempotent: a
    /// second call replaces the contents rather than erroring.
    pub async fn initialize(&self, caps: impl IntoIterator<Item = Capability>) {
        let mut guard = self.inner.write().await;
        *guard = Some(caps.into_iter().collect());
    }

    async fn read(&self) -> CoreResult<tokio::sync::RwLockReadGuard<'_, Option<HashSet<Capability>>>> {
        let guard = self.inner.read().await;
        if guard.is_none() {
            return Err(CoreError::NotInitialized);
        }
        Ok(guard)
    }

    /// Adds a capability, returning `true` if it was not already present.
    ///
    /// # Errors
    /// Returns [`CoreError::NotInitialized`] if `initialize` has not been
    /// called.
    pub async fn add(&self, cap: Capability) -> CoreResult<bool> {
        let mut guard = self.inner.write().await;
        let set = guard.as_mut().ok_or(CoreError::NotInitialized)?;
        Ok(set.insert(cap))
    }

    /// Removes a capability, returning `true` if it was present.
    ///
    /// # Errors
    /// Returns [`CoreError::NotInitialized`] if `initialize` has not been
    /// called.
    pub async fn remove(&self, cap: &Capability) -> CoreResult<bool> {
        let mut guard = self.inner.write().await;
        let set = guard.as_mut().ok_or(CoreError::NotInitialized)?;
        Ok(set.remove(cap))
    }

    /// Tests membership against an exact capability, a bare kind, or a
    /// kind's string name.
    ///
    /// # Errors
    /// Returns [`CoreError::NotInitialized`] if `initialize` has not been
    /// called.
    pub async fn has<'a>(&self, key: impl Into<CapabilityKey<'a>>) -> CoreResult<bool> {
        let guard = self.read().await?;
        let set = guard.as_ref().expect("checked above");
        Ok(match key.into() {
            CapabilityKey::Exact(c) => set.contains(c),
            CapabilityKey::Kind(k) => set.iter().any(|c| &c.kind == k),
            CapabilityKey::Name(name) => set.iter().any(|c| c.kind.as_str() == name),
        })
    }

    /// Returns every capability of the given kind.
    ///
    /// # Errors
    /// Returns [`CoreError::NotInitialized`] if `initialize` has not been
    /// called.
    pub async fn get_by_kind(&self, kind: &CapabilityKind) -> CoreResult<Vec<Capability>> {
        let guard = self.read().await?;
        let set = guard.as_ref().expect("checked above");
        Ok(set.iter().filter(|c| &c.kind == kind).cloned().collect())
    }

    /// Returns a point-in-time snapshot of every capability.
    ///
    /// # Errors
    /// Returns [`CoreError::NotInitialized`] if `initialize` has not been
    /// called.
    pub async fn snapshot(&self) -> CoreResult<Vec<Capability>> {
        let guard = self.read().await?;
        let set = guard.as_ref().expect("checked above");
        Ok(set.iter().cloned().collect())
    }

    /// Removes every capability without uninitializing the set.
    ///
    /// # Errors
    /// Returns [`CoreError::NotInitialized`] if `initialize` has not been
    /// called.
    pub async fn clear(&self) -> CoreResult<()> {
        let mut guard = self.inner.write().await;
        let set = guard.as_mut().ok_or(CoreError::NotInitialized)?;
        set.clear();
        Ok(())
    }

    /// Number of distinct capabilities currently held.
    ///
    /// # Errors
    /// Returns [`CoreError::NotInitialized`] if `initialize` has not been
    /// called.
    pub async fn len(&self) -> CoreResult<usize> {
        let guard = self.read().await?;
        Ok(guard.as_ref().expect("checked above").len())
    }

    /// Whether the set holds no capabilities.
    ///
    /// # Errors
    /// Returns [`CoreError::NotInitialized`] if `initialize` has not been
    /// called.
    pub async fn is_empty(&self) -> CoreResult<bool> {
        Ok(self.len().await? == 0)
    }
}

/// Parses a version requirement of the form `(==|>=|<=|>|<)?<dotted-numeric>`.
/// A missing operator means `==`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VersionOp {
    /// `==`, or no operator given.
    Eq,
    /// `>=`
    Ge,
    /// `<=`
    Le,
    /// `>`
    Gt,
    /// `<`
    Lt,
}

fn parse_dotted(s: &str) -> Option<Vec<u64>> {
    s.split('.').map(|part| part.parse::<u64>().ok()).collect()
}

fn parse_requirement(req: &str) -> Option<(VersionOp, Vec<u64>)> {
    let (op, rest) = if let Some(r) = req.strip_prefix(">=") {
        (VersionOp::Ge, r)
    } else if let Some(r) = req.strip_prefix("<=") {
        (VersionOp::Le, r)
    } else if let Some(r) = req.strip_prefix("==") {
        (VersionOp::Eq, r)
    } else if let Some(r) = req.strip_prefix('>') {
        (VersionOp::Gt, r)
    } else if let Some(r) = req.strip_prefix('<') {
        (VersionOp::Lt, r)
    } else {
        (VersionOp::Eq, req)
    };
    parse_dotted(rest.trim()).map(|v| (op, v))
}

/// Checks whether `agent_version` satisfies `requirement`.
///
/// Unparsable requirements or versions are treated as compatible
/// (fail-open), matching the reference router's behavior: a malformed
/// version string should never itself be the reason routing fails.
#[must_use]
pub fn version_compatible(agent_version: &str, requirement: &str) -> bool {
    let Some((op, req_parts)) = parse_requirement(requirement) else {
        return true;
    };
    let Some(agent_parts) = parse_dotted(agent_version) else {
        return true;
    };
    let ordering = compare_dotted(&agent_parts, &req_parts);
    match op {
        VersionOp::Eq => ordering == std::cmp::Ordering::Equal,
        VersionOp::Ge => ordering != std::cmp::Ordering::Less,
        VersionOp::Le => ordering != std::cmp::Ordering::Greater,
        VersionOp::Gt => ordering == std::cmp::Ordering::Greater,
        VersionOp::Lt => ordering == std::cmp::Ordering::Less,
    }
}

fn compare_dotted(a: &[u64], b: &[u64]) -> std::cmp::Ordering {
    let len = a.len().max(b.len());
    for i in 0..len {
        let x = a.get(i).copied().unwrap_or(0);
        let y = b.get(i).copied().unwrap_or(0);
        match x.cmp(&y) {
            std::cmp::Ordering::Equal => continue,
            other => return other,
        }
    }
    std::cmp::Ordering::Equal
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn not_initialized_fails_every_operation() {
        let set = CapabilitySet::new();
        assert!(matches!(
            set.add(Capability::new(CapabilityKind::Research)).await,
            Err(CoreError::NotInitialized)
        ));
        assert!(matches!(set.len().await, Err(CoreError::NotInitialized)));
    }

    #[tokio::test]
    async fn membership_supports_three_keys() {
        let set = CapabilitySet::initialized();
        let cap = Capability::new(CapabilityKind::SensorReading);
        set.add(cap.clone()).await.unwrap();

        assert!(set.has(&cap).await.unwrap());
        assert!(set.has(&CapabilityKind::SensorReading).await.unwrap());
        assert!(set.has("sensor_reading").await.unwrap());
        assert!(!set.has("data_processing").await.unwrap());
    }

    #[tokio::test]
    async fn add_then_remove_restores_prior_capability_set() {
        let set = CapabilitySet::initialized();
        let existing = Capability::new(CapabilityKind::SensorReading);
        set.add(existing.clone()).await.unwrap();
        let before = set.snapshot().await.unwrap();

        let added = Capability::new(CapabilityKind::Research);
        set.add(added.clone()).await.unwrap();
        set.remove(&added).await.unwrap();

        let after = set.snapshot().await.unwrap();
        assert_eq!(before.len(), after.len());
        assert!(after.contains(&existing));
        assert!(!after.contains(&added));
    }

    #[test]
    fn version_requirement_grammar() {
        assert!(version_compatible("1.0", ">=1.0"));
        assert!(version_compatible("2.3", ">=1.0"));
        assert!(!version_compatible("0.9", ">=1.0"));
        assert!(version_compatible("1.0", "1.0"));
        assert!(!version_compatible("1.1", "==1.0"));
    }

    #[test]
    fn unparsable_versions_fail_open() {
        assert!(version_compatible("not-a-version", ">=1.0"));
        assert!(version_compatible("1.0", "not-a-requirement"));
    }
}

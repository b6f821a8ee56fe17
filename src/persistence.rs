//! `WorkflowPersistence`: pluggable storage for workflow snapshots.
//!
//! Grounded in this codebase's `database.rs` (the `DatabasePath` newtype,
//! `SqliteConnectOptions` wiring, and `DatabaseError` taxonomy) and
//! `storage/agent_storage.rs` (embedded `CREATE TABLE IF NOT EXISTS`
//! issued on first use rather than a separate migration step). The
//! in-memory implementation is the default; `SqliteWorkflowStorage` is an
//! optional durable backing for callers that want snapshots to survive a
//! process restart. Both implement the same trait, and persistence
//! failures are logged but never abort workflow execution — see
//! `WorkflowManager::persist`.

use async_trait::async_trait;
use dashmap::DashMap;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::{Row, SqlitePool};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use thiserror::Error;
use tracing::warn;

use crate::types::WorkflowId;
use crate::workflow::Workflow;

/// Errors specific to the persistence layer. Kept separate from
/// [`crate::error::CoreError`] since callers of `WorkflowManager` only
/// ever see [`crate::error::CoreError::PersistenceFailed`]; this type is
/// the detail wrapped inside that variant's message.
#[derive(Error, Debug)]
pub enum PersistenceError {
    /// The underlying `SQLite` connection or query failed.
    #[error("sqlite error: {0}")]
    Sqlite(#[from] sqlx::Error),
    /// A workflow snapshot could not be serialized or deserialized.
    #[error("snapshot (de)serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),
    /// The configured database path was not a `.db` file.
    #[error("invalid database path: {0}")]
    InvalidPath(String),
}

/// Storage result alias.
pub type PersistenceResult<T> = Result<T, PersistenceError>;

/// Pluggable storage for workflow snapshots.
///
/// `save_workflow` appends a point-in-time snapshot; `get_workflow_history`
/// returns every snapshot recorded for a workflow, oldest first, so
/// callers can observe the monotonically non-decreasing `updated_at`
/// sequence described in the external-interfaces contract.
#[async_trait]
pub trait WorkflowPersistence: Send + Sync {
    /// Appends a snapshot of `workflow`'s current state.
    ///
    /// # Errors
    /// Returns [`PersistenceError`] if the snapshot could not be stored.
    /// Callers (the workflow manager) log and otherwise ignore this —
    /// persistence is never allowed to abort execution.
    async fn save_workflow(&self, workflow: &Workflow) -> PersistenceResult<()>;

    /// Returns every snapshot recorded for `id`, oldest first.
    ///
    /// # Errors
    /// Returns [`PersistenceError`] if the store could not be read.
    async fn get_workflow_history(&self, id: WorkflowId) -> PersistenceResult<Vec<Workflow>>;
}

/// Default, in-memory append-only log keyed by workflow id. Sufficient
/// for single-process use and for tests; snapshots do not survive
/// process restart.
#[derive(Default)]
pub struct InMemoryWorkflowPersistence {
    snapshots: DashMap<WorkflowId, Mutex<Vec<Workflow>>>,
}

impl InMemoryWorkflowPersistence {
    /// Builds an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl WorkflowPersistence for InMemoryWorkflowPersistence {
    async fn save_workflow(&self, workflow: &Workflow) -> PersistenceResult<()> {
        self.snapshots
            .entry(workflow.id)
            .or_default()
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .push(workflow.clone());
        Ok(())
    }

    async fn get_workflow_history(&self, id: WorkflowId) -> PersistenceResult<Vec<Workflow>> {
        Ok(self
            .snapshots
            .get(&id)
            .map(|entry| {
                entry
                    .lock()
                    .unwrap_or_else(std::sync::PoisonError::into_inner)
                    .clone()
            })
            .unwrap_or_default())
    }
}

/// A validated path to a `SQLite` database file.
///
/// Mirrors `database.rs`'s `DatabasePath`, trimmed to what the workflow
/// store needs: a `.db`-suffixed path the process can create and open.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DatabasePath(PathBuf);

impl DatabasePath {
    /// Validates `path` as a usable database file location.
    ///
    /// # Errors
    /// Returns [`PersistenceError::InvalidPath`] if the path is empty or
    /// does not end in `.db`.
    pub fn new<P: AsRef<Path>>(path: P) -> PersistenceResult<Self> {
        let path = path.as_ref().to_path_buf();
        if path.as_os_str().is_empty() || path.extension().is_none_or(|ext| ext != "db") {
            return Err(PersistenceError::InvalidPath(path.display().to_string()));
        }
        Ok(Self(path))
    }

    fn connect_options(&self) -> SqliteConnectOptions {
        SqliteConnectOptions::new()
            .filename(&self.0)
            .create_if_missing(true)
    }
}

const CREATE_SNAPSHOTS_TABLE: &str = r"
    CREATE TABLE IF NOT EXISTS workflow_snapshots (
        seq INTEGER PRIMARY KEY AUTOINCREMENT,
        workflow_id TEXT NOT NULL,
        snapshot TEXT NOT NULL,
        recorded_at INTEGER NOT NULL
    )
";

const CREATE_WORKFLOW_ID_INDEX: &str = r"
    CREATE INDEX IF NOT EXISTS idx_workflow_snapshots_workflow_id
        ON workflow_snapshots (workflow_id, seq)
";

const INSERT_SNAPSHOT: &str = r"
    INSERT INTO workflow_snapshots (workflow_id, snapshot, recorded_at) VALUES (?1, ?2, ?3)
";

const SELECT_HISTORY: &str = r"
    SELECT snapshot FROM workflow_snapshots WHERE workflow_id = ?1 ORDER BY seq ASC
";

/// Durable `WorkflowPersistence` backed by a single-writer `SQLite` file.
///
/// Single-process, single-file durability only — this is explicitly not
/// a distributed log or a clustering mechanism (see the crate-level
/// Non-goals). Each snapshot is stored as a JSON blob keyed by an
/// auto-incrementing sequence number, so `get_workflow_history` is a
/// plain ordered scan.
pub struct SqliteWorkflowStorage {
    pool: SqlitePool,
}

impl SqliteWorkflowStorage {
    /// Opens (creating if necessary) the database at `path` and ensures
    /// its schema exists.
    ///
    /// # Errors
    /// Returns [`PersistenceError`] if the path is invalid or the
    /// connection/schema setup fails.
    pub async fn open(path: DatabasePath) -> PersistenceResult<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(path.connect_options())
            .await?;
        sqlx::query(CREATE_SNAPSHOTS_TABLE).execute(&pool).await?;
        sqlx::query(CREATE_WORKFLOW_ID_INDEX).execute(&pool).await?;
        Ok(Self { pool })
    }

    /// Builds a storage backend over an already-open pool, e.g. one
    /// shared with other ambient `SQLite` consumers. Still ensures the
    /// snapshot table exists.
    ///
    /// # Errors
    /// Returns [`PersistenceError`] if schema setup fails.
    pub async fn from_pool(pool: SqlitePool) -> PersistenceResult<Self> {
        sqlx::query(CREATE_SNAPSHOTS_TABLE).execute(&pool).await?;
        sqlx::query(CREATE_WORKFLOW_ID_INDEX).execute(&pool).await?;
        Ok(Self { pool })
    }
}

#[async_trait]
impl WorkflowPersistence for SqliteWorkflowStorage {
    async fn save_workflow(&self, workflow: &Workflow) -> PersistenceResult<()> {
        let snapshot = serde_json::to_string(workflow)?;
        let recorded_at = workflow.updated_at.timestamp_millis();
        sqlx::query(INSERT_SNAPSHOT)
            .bind(workflow.id.to_string())
            .bind(snapshot)
            .bind(recorded_at)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn get_workflow_history(&self, id: WorkflowId) -> PersistenceResult<Vec<Workflow>> {
        let rows = sqlx::query(SELECT_HISTORY)
            .bind(id.to_string())
            .fetch_all(&self.pool)
            .await?;
        rows.iter()
            .map(|row| {
                let snapshot: String = row.try_get("snapshot")?;
                serde_json::from_str(&snapshot).map_err(PersistenceError::from)
            })
            .collect()
    }
}

/// Logs (rather than propagates) a persistence failure, matching the
/// crate-wide policy that snapshotting never aborts workflow execution.
pub(crate) fn log_failure(workflow_id: WorkflowId, err: &PersistenceError) {
    warn!(%workflow_id, error = %err, "workflow snapshot persistence failed");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capability::CapabilityKind;
    use crate::workflow::{LoadBalancingStrategy, WorkflowManager, WorkflowStatus};
    use std::sync::Arc;

    #[tokio::test]
    async fn in_memory_store_returns_history_in_insertion_order() {
        let store = InMemoryWorkflowPersistence::new();
        let notifier = crate::notifier::WorkflowNotifier::start();
        let registry = Arc::new(crate::registry::AgentRegistry::new(
            notifier.clone(),
            Arc::new(crate::recovery::RecoveryStrategyEngine::new()),
            crate::config::RuntimeConfig::test(),
        ));
        let router = Arc::new(crate::router::CapabilityRouter::new(
            registry.clone(),
            crate::config::RuntimeConfig::test(),
        ));
        let manager = WorkflowManager::new(
            registry,
            router,
            notifier,
            Arc::new(InMemoryWorkflowPersistence::new()),
            crate::config::RuntimeConfig::test(),
        );
        let id = manager
            .create_workflow(
                "w",
                "d",
                vec![CapabilityKind::Custom("unused".to_string())],
                1,
                LoadBalancingStrategy::RoundRobin,
            )
            .await;
        let workflow = manager.get_workflow(id).await.unwrap();
        store.save_workflow(&workflow).await.unwrap();
        let mut later = workflow.clone();
        later.status = WorkflowStatus::Cancelled;
        store.save_workflow(&later).await.unwrap();

        let history = store.get_workflow_history(id).await.unwrap();
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].status, WorkflowStatus::Pending);
        assert_eq!(history[1].status, WorkflowStatus::Cancelled);
    }

    #[test]
    fn database_path_requires_db_extension() {
        assert!(DatabasePath::new("workflows.db").is_ok());
        assert!(DatabasePath::new("workflows.txt").is_err());
        assert!(DatabasePath::new("").is_err());
    }
}

//! SQLite state store for the orchestrator daemon.
//!
//! Persists work units, the append-only status log, and daemon config.
//! Migrations are embedded, numbered, forward-only, and recorded in
//! `schema_migrations(version, applied_at)`.

use chrono::{DateTime, Utc};
use sqlx::{sqlite::SqlitePoolOptions, Pool, Sqlite};
use std::collections::BTreeMap;
use std::path::Path;
use thiserror::Error;
use ve_core::{StatusLogEntry, WorkUnit, WorkUnitPhase, WorkUnitStatus};

/// Explicit column list for work_units queries.
/// ALTER TABLE appends columns, so SELECT * order depends on migration
/// history; explicit columns keep row mapping stable.
const WORK_UNIT_COLUMNS: &str = "chunk, phase, status, blocked_by, worktree, priority, \
    session_id, completion_retries, attention_reason, displaced_chunk, pending_answer, \
    created_at, updated_at";

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("work unit for chunk '{0}' already exists")]
    UnitExists(String),
    #[error("work unit '{0}' not found")]
    UnitNotFound(String),
}

pub type Result<T> = std::result::Result<T, StorageError>;

/// Embedded migrations, applied in order.
const MIGRATIONS: [(i64, &str); 3] = [
    (1, include_str!("../../../migrations/0001_init.sql")),
    (2, include_str!("../../../migrations/0002_scheduling.sql")),
    (3, include_str!("../../../migrations/0003_attention.sql")),
];

/// Storage backend for the daemon.
pub struct StateStore {
    pool: Pool<Sqlite>,
}

impl std::fmt::Debug for StateStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StateStore").finish_non_exhaustive()
    }
}

impl StateStore {
    /// Open (or create) the database at the given path.
    pub async fn new(db_path: &Path) -> Result<Self> {
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent).ok();
        }

        let db_url = format!("sqlite://{}?mode=rwc", db_path.display());
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect(&db_url)
            .await?;

        sqlx::query("PRAGMA journal_mode = WAL").execute(&pool).await?;
        sqlx::query("PRAGMA foreign_keys = ON").execute(&pool).await?;

        Ok(Self { pool })
    }

    /// Apply embedded migrations past the recorded schema version.
    pub async fn migrate(&self) -> Result<()> {
        sqlx::query(
            "CREATE TABLE IF NOT EXISTS schema_migrations (\
                 version INTEGER PRIMARY KEY, applied_at TEXT NOT NULL)",
        )
        .execute(&self.pool)
        .await?;

        let current: (Option<i64>,) =
            sqlx::query_as("SELECT MAX(version) FROM schema_migrations")
                .fetch_one(&self.pool)
                .await?;
        let current = current.0.unwrap_or(0);

        for (version, sql) in MIGRATIONS {
            if version <= current {
                continue;
            }
            let cleaned: String = sql
                .lines()
                .filter(|line| !line.trim().starts_with("--"))
                .collect::<Vec<_>>()
                .join("\n");
            for statement in cleaned.split(';') {
                let trimmed = statement.trim();
                if !trimmed.is_empty() {
                    sqlx::query(trimmed).execute(&self.pool).await?;
                }
            }
            sqlx::query("INSERT INTO schema_migrations (version, applied_at) VALUES (?1, ?2)")
                .bind(version)
                .bind(Utc::now().to_rfc3339())
                .execute(&self.pool)
                .await?;
        }
        Ok(())
    }

    /// Recorded schema version.
    pub async fn schema_version(&self) -> Result<i64> {
        let row: (Option<i64>,) = sqlx::query_as("SELECT MAX(version) FROM schema_migrations")
            .fetch_one(&self.pool)
            .await?;
        Ok(row.0.unwrap_or(0))
    }

    // --- Work unit CRUD ---

    /// Insert a new work unit and log its initial status.
    pub async fn create_work_unit(&self, unit: &WorkUnit) -> Result<()> {
        let blocked_by = serde_json::to_string(&unit.blocked_by)?;
        let result = sqlx::query(
            r#"
            INSERT INTO work_units
                (chunk, phase, status, blocked_by, worktree, priority, session_id,
                 completion_retries, attention_reason, displaced_chunk, pending_answer,
                 created_at, updated_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)
            "#,
        )
        .bind(&unit.chunk)
        .bind(unit.phase.as_str())
        .bind(unit.status.as_str())
        .bind(&blocked_by)
        .bind(&unit.worktree)
        .bind(unit.priority)
        .bind(&unit.session_id)
        .bind(unit.completion_retries)
        .bind(&unit.attention_reason)
        .bind(&unit.displaced_chunk)
        .bind(&unit.pending_answer)
        .bind(unit.created_at.to_rfc3339())
        .bind(unit.updated_at.to_rfc3339())
        .execute(&self.pool)
        .await;

        match result {
            Ok(_) => {}
            Err(sqlx::Error::Database(e)) if e.is_unique_violation() => {
                return Err(StorageError::UnitExists(unit.chunk.clone()));
            }
            Err(e) => return Err(e.into()),
        }

        self.log_status(&unit.chunk, None, unit.status).await?;
        Ok(())
    }

    /// Get a work unit, or None when absent.
    pub async fn try_get_work_unit(&self, chunk: &str) -> Result<Option<WorkUnit>> {
        let query = format!("SELECT {WORK_UNIT_COLUMNS} FROM work_units WHERE chunk = ?1");
        let row = sqlx::query_as::<_, WorkUnitRow>(&query)
            .bind(chunk)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(WorkUnitRow::into_unit))
    }

    /// Get a work unit, failing when absent.
    pub async fn get_work_unit(&self, chunk: &str) -> Result<WorkUnit> {
        self.try_get_work_unit(chunk)
            .await?
            .ok_or_else(|| StorageError::UnitNotFound(chunk.to_string()))
    }

    /// Update every mutable field; appends exactly one status-log row iff the
    /// status changed. `updated_at` is stamped here.
    pub async fn update_work_unit(&self, unit: &WorkUnit) -> Result<WorkUnit> {
        let old = self.get_work_unit(&unit.chunk).await?;
        let blocked_by = serde_json::to_string(&unit.blocked_by)?;
        let now = Utc::now();

        sqlx::query(
            r#"
            UPDATE work_units
            SET phase = ?1, status = ?2, blocked_by = ?3, worktree = ?4, priority = ?5,
                session_id = ?6, completion_retries = ?7, attention_reason = ?8,
                displaced_chunk = ?9, pending_answer = ?10, updated_at = ?11
            WHERE chunk = ?12
            "#,
        )
        .bind(unit.phase.as_str())
        .bind(unit.status.as_str())
        .bind(&blocked_by)
        .bind(&unit.worktree)
        .bind(unit.priority)
        .bind(&unit.session_id)
        .bind(unit.completion_retries)
        .bind(&unit.attention_reason)
        .bind(&unit.displaced_chunk)
        .bind(&unit.pending_answer)
        .bind(now.to_rfc3339())
        .bind(&unit.chunk)
        .execute(&self.pool)
        .await?;

        if old.status != unit.status {
            self.log_status(&unit.chunk, Some(old.status), unit.status).await?;
        }

        let mut updated = unit.clone();
        updated.updated_at = now;
        Ok(updated)
    }

    /// Hard-delete a work unit. Returns false when it did not exist.
    pub async fn delete_work_unit(&self, chunk: &str) -> Result<bool> {
        let result = sqlx::query("DELETE FROM work_units WHERE chunk = ?1")
            .bind(chunk)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    /// List work units, optionally filtered by status, in creation order.
    pub async fn list_work_units(&self, status: Option<WorkUnitStatus>) -> Result<Vec<WorkUnit>> {
        let rows = match status {
            Some(status) => {
                let query = format!(
                    "SELECT {WORK_UNIT_COLUMNS} FROM work_units WHERE status = ?1 ORDER BY created_at ASC, chunk ASC"
                );
                sqlx::query_as::<_, WorkUnitRow>(&query)
                    .bind(status.as_str())
                    .fetch_all(&self.pool)
                    .await?
            }
            None => {
                let query = format!(
                    "SELECT {WORK_UNIT_COLUMNS} FROM work_units ORDER BY created_at ASC, chunk ASC"
                );
                sqlx::query_as::<_, WorkUnitRow>(&query)
                    .fetch_all(&self.pool)
                    .await?
            }
        };
        Ok(rows.into_iter().map(WorkUnitRow::into_unit).collect())
    }

    /// Count work units grouped by status.
    pub async fn count_by_status(&self) -> Result<BTreeMap<String, i64>> {
        let rows: Vec<(String, i64)> =
            sqlx::query_as("SELECT status, COUNT(*) FROM work_units GROUP BY status")
                .fetch_all(&self.pool)
                .await?;
        Ok(rows.into_iter().collect())
    }

    /// Count RUNNING units (the scheduler's concurrency gauge).
    pub async fn count_running(&self) -> Result<i64> {
        let row: (i64,) =
            sqlx::query_as("SELECT COUNT(*) FROM work_units WHERE status = 'RUNNING'")
                .fetch_one(&self.pool)
                .await?;
        Ok(row.0)
    }

    // --- Queues ---

    /// READY units in dispatch order: priority DESC, created_at ASC, chunk ASC.
    pub async fn ready_queue(&self, limit: Option<i64>) -> Result<Vec<WorkUnit>> {
        let mut query = format!(
            "SELECT {WORK_UNIT_COLUMNS} FROM work_units WHERE status = 'READY' \
             ORDER BY priority DESC, created_at ASC, chunk ASC"
        );
        if let Some(limit) = limit {
            query.push_str(&format!(" LIMIT {limit}"));
        }
        let rows = sqlx::query_as::<_, WorkUnitRow>(&query)
            .fetch_all(&self.pool)
            .await?;
        Ok(rows.into_iter().map(WorkUnitRow::into_unit).collect())
    }

    /// NEEDS_ATTENTION units with the number of other units each one blocks,
    /// ordered by blocking count descending, then `updated_at` ascending.
    pub async fn attention_queue(&self) -> Result<Vec<(WorkUnit, i64)>> {
        let all = self.list_work_units(None).await?;
        let mut queue: Vec<(WorkUnit, i64)> = all
            .iter()
            .filter(|u| u.status == WorkUnitStatus::NeedsAttention)
            .map(|u| {
                let blocking = all
                    .iter()
                    .filter(|other| {
                        other.chunk != u.chunk && other.blocked_by.contains(&u.chunk)
                    })
                    .count() as i64;
                (u.clone(), blocking)
            })
            .collect();
        queue.sort_by(|a, b| {
            b.1.cmp(&a.1)
                .then_with(|| a.0.updated_at.cmp(&b.0.updated_at))
                .then_with(|| a.0.chunk.cmp(&b.0.chunk))
        });
        Ok(queue)
    }

    // --- Status log ---

    async fn log_status(
        &self,
        chunk: &str,
        old: Option<WorkUnitStatus>,
        new: WorkUnitStatus,
    ) -> Result<()> {
        sqlx::query(
            "INSERT INTO status_log (chunk, old_status, new_status, timestamp) VALUES (?1, ?2, ?3, ?4)",
        )
        .bind(chunk)
        .bind(old.map(|s| s.as_str()))
        .bind(new.as_str())
        .bind(Utc::now().to_rfc3339())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Status history for a chunk, oldest first (`id ASC` reflects the exact
    /// transition sequence).
    pub async fn status_history(&self, chunk: &str) -> Result<Vec<StatusLogEntry>> {
        let rows: Vec<(Option<String>, String, String)> = sqlx::query_as(
            "SELECT old_status, new_status, timestamp FROM status_log WHERE chunk = ?1 ORDER BY id ASC",
        )
        .bind(chunk)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows
            .into_iter()
            .map(|(old_status, new_status, timestamp)| StatusLogEntry {
                chunk: chunk.to_string(),
                old_status,
                new_status,
                timestamp: parse_timestamp(&timestamp),
            })
            .collect())
    }

    // --- Config ---

    pub async fn get_config(&self, key: &str) -> Result<Option<String>> {
        let row: Option<(String,)> = sqlx::query_as("SELECT value FROM config WHERE key = ?1")
            .bind(key)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(|(v,)| v))
    }

    pub async fn set_config(&self, key: &str, value: &str) -> Result<()> {
        sqlx::query("INSERT OR REPLACE INTO config (key, value) VALUES (?1, ?2)")
            .bind(key)
            .bind(value)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

fn parse_timestamp(raw: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(raw)
        .map(|t| t.with_timezone(&Utc))
        .unwrap_or_default()
}

// --- Row mapping ---

#[derive(sqlx::FromRow)]
struct WorkUnitRow {
    chunk: String,
    phase: String,
    status: String,
    blocked_by: Option<String>,
    worktree: Option<String>,
    priority: Option<i64>,
    session_id: Option<String>,
    completion_retries: Option<i64>,
    attention_reason: Option<String>,
    displaced_chunk: Option<String>,
    pending_answer: Option<String>,
    created_at: String,
    updated_at: String,
}

impl WorkUnitRow {
    fn into_unit(self) -> WorkUnit {
        let blocked_by = self
            .blocked_by
            .as_deref()
            .and_then(|raw| serde_json::from_str(raw).ok())
            .unwrap_or_default();
        WorkUnit {
            chunk: self.chunk,
            phase: WorkUnitPhase::parse(&self.phase).unwrap_or(WorkUnitPhase::Goal),
            status: WorkUnitStatus::parse(&self.status).unwrap_or(WorkUnitStatus::NeedsAttention),
            blocked_by,
            worktree: self.worktree,
            priority: self.priority.unwrap_or(0),
            session_id: self.session_id,
            completion_retries: self.completion_retries.unwrap_or(0),
            attention_reason: self.attention_reason,
            displaced_chunk: self.displaced_chunk,
            pending_answer: self.pending_answer,
            created_at: parse_timestamp(&self.created_at),
            updated_at: parse_timestamp(&self.updated_at),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use tempfile::TempDir;

    struct TestStore {
        store: StateStore,
        _dir: TempDir, // keep alive for the db file
    }

    async fn create_test_store() -> TestStore {
        let dir = TempDir::new().unwrap();
        let store = StateStore::new(&dir.path().join("test.db")).await.unwrap();
        store.migrate().await.unwrap();
        TestStore { store, _dir: dir }
    }

    fn unit(chunk: &str) -> WorkUnit {
        WorkUnit::new(chunk)
    }

    fn unit_at(chunk: &str, offset_secs: i64, priority: i64) -> WorkUnit {
        let mut u = WorkUnit::new(chunk);
        let base = DateTime::parse_from_rfc3339("2024-01-01T00:00:00Z")
            .unwrap()
            .with_timezone(&Utc);
        u.created_at = base + Duration::seconds(offset_secs);
        u.updated_at = u.created_at;
        u.priority = priority;
        u
    }

    #[tokio::test]
    async fn migrations_are_recorded_and_idempotent() {
        let ts = create_test_store().await;
        assert_eq!(ts.store.schema_version().await.unwrap(), 3);
        // Running again is a no-op.
        ts.store.migrate().await.unwrap();
        assert_eq!(ts.store.schema_version().await.unwrap(), 3);
    }

    #[tokio::test]
    async fn create_and_get_round_trips() {
        let ts = create_test_store().await;
        let mut u = unit("auth_cache");
        u.blocked_by = vec!["bootstrap".to_string()];
        u.priority = 5;
        ts.store.create_work_unit(&u).await.unwrap();

        let got = ts.store.get_work_unit("auth_cache").await.unwrap();
        assert_eq!(got.chunk, "auth_cache");
        assert_eq!(got.status, WorkUnitStatus::Ready);
        assert_eq!(got.blocked_by, vec!["bootstrap".to_string()]);
        assert_eq!(got.priority, 5);
    }

    #[tokio::test]
    async fn duplicate_chunk_is_rejected() {
        let ts = create_test_store().await;
        ts.store.create_work_unit(&unit("dup")).await.unwrap();
        assert!(matches!(
            ts.store.create_work_unit(&unit("dup")).await,
            Err(StorageError::UnitExists(_))
        ));
    }

    #[tokio::test]
    async fn get_missing_unit_fails() {
        let ts = create_test_store().await;
        assert!(matches!(
            ts.store.get_work_unit("ghost").await,
            Err(StorageError::UnitNotFound(_))
        ));
        assert!(ts.store.try_get_work_unit("ghost").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn status_change_logs_exactly_one_row() {
        let ts = create_test_store().await;
        ts.store.create_work_unit(&unit("w")).await.unwrap();

        // Initial creation logged one row.
        assert_eq!(ts.store.status_history("w").await.unwrap().len(), 1);

        let mut u = ts.store.get_work_unit("w").await.unwrap();
        u.status = WorkUnitStatus::Running;
        ts.store.update_work_unit(&u).await.unwrap();

        let history = ts.store.status_history("w").await.unwrap();
        assert_eq!(history.len(), 2);
        assert_eq!(history[1].old_status.as_deref(), Some("READY"));
        assert_eq!(history[1].new_status, "RUNNING");

        // Update without a status change adds nothing.
        let mut u = ts.store.get_work_unit("w").await.unwrap();
        u.priority = 9;
        ts.store.update_work_unit(&u).await.unwrap();
        assert_eq!(ts.store.status_history("w").await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn history_preserves_transition_order() {
        let ts = create_test_store().await;
        ts.store.create_work_unit(&unit("w")).await.unwrap();
        for status in [
            WorkUnitStatus::Running,
            WorkUnitStatus::NeedsAttention,
            WorkUnitStatus::Ready,
            WorkUnitStatus::Running,
            WorkUnitStatus::Done,
        ] {
            let mut u = ts.store.get_work_unit("w").await.unwrap();
            u.status = status;
            ts.store.update_work_unit(&u).await.unwrap();
        }
        let transitions: Vec<String> = ts
            .store
            .status_history("w")
            .await
            .unwrap()
            .into_iter()
            .map(|e| e.new_status)
            .collect();
        assert_eq!(
            transitions,
            ["READY", "RUNNING", "NEEDS_ATTENTION", "READY", "RUNNING", "DONE"]
        );
    }

    #[tokio::test]
    async fn delete_is_hard() {
        let ts = create_test_store().await;
        ts.store.create_work_unit(&unit("w")).await.unwrap();
        assert!(ts.store.delete_work_unit("w").await.unwrap());
        assert!(!ts.store.delete_work_unit("w").await.unwrap());
        assert!(ts.store.try_get_work_unit("w").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn ready_queue_orders_by_priority_then_age_then_chunk() {
        let ts = create_test_store().await;
        ts.store.create_work_unit(&unit_at("old_low", 0, 1)).await.unwrap();
        ts.store.create_work_unit(&unit_at("new_low", 100, 1)).await.unwrap();
        ts.store.create_work_unit(&unit_at("high", 200, 5)).await.unwrap();
        ts.store.create_work_unit(&unit_at("tie_b", 300, 1)).await.unwrap();
        ts.store.create_work_unit(&unit_at("tie_a", 300, 1)).await.unwrap();

        let queue = ts.store.ready_queue(None).await.unwrap();
        let chunks: Vec<&str> = queue.iter().map(|u| u.chunk.as_str()).collect();
        assert_eq!(chunks, ["high", "old_low", "new_low", "tie_a", "tie_b"]);

        let limited = ts.store.ready_queue(Some(2)).await.unwrap();
        assert_eq!(limited.len(), 2);
        assert_eq!(limited[0].chunk, "high");
    }

    #[tokio::test]
    async fn ready_queue_excludes_other_statuses() {
        let ts = create_test_store().await;
        ts.store.create_work_unit(&unit("ready")).await.unwrap();
        let mut blocked = unit("blocked");
        blocked.status = WorkUnitStatus::Blocked;
        ts.store.create_work_unit(&blocked).await.unwrap();

        let queue = ts.store.ready_queue(None).await.unwrap();
        assert_eq!(queue.len(), 1);
        assert_eq!(queue[0].chunk, "ready");
    }

    #[tokio::test]
    async fn attention_queue_orders_by_blocking_count_then_age() {
        let ts = create_test_store().await;

        let mut a = unit_at("a", 0, 0);
        a.status = WorkUnitStatus::NeedsAttention;
        ts.store.create_work_unit(&a).await.unwrap();

        let mut b = unit_at("b", 10, 0);
        b.status = WorkUnitStatus::NeedsAttention;
        ts.store.create_work_unit(&b).await.unwrap();

        // Three units blocked by a, none by b.
        for name in ["d1", "d2", "d3"] {
            let mut u = unit(name);
            u.status = WorkUnitStatus::Blocked;
            u.blocked_by = vec!["a".to_string()];
            ts.store.create_work_unit(&u).await.unwrap();
        }

        let queue = ts.store.attention_queue().await.unwrap();
        assert_eq!(queue.len(), 2);
        assert_eq!(queue[0].0.chunk, "a");
        assert_eq!(queue[0].1, 3);
        assert_eq!(queue[1].0.chunk, "b");
        assert_eq!(queue[1].1, 0);
    }

    #[tokio::test]
    async fn count_by_status_groups() {
        let ts = create_test_store().await;
        ts.store.create_work_unit(&unit("r1")).await.unwrap();
        ts.store.create_work_unit(&unit("r2")).await.unwrap();
        let mut running = unit("run");
        running.status = WorkUnitStatus::Running;
        ts.store.create_work_unit(&running).await.unwrap();

        let counts = ts.store.count_by_status().await.unwrap();
        assert_eq!(counts.get("READY"), Some(&2));
        assert_eq!(counts.get("RUNNING"), Some(&1));
    }

    #[tokio::test]
    async fn config_round_trips() {
        let ts = create_test_store().await;
        assert!(ts.store.get_config("max_agents").await.unwrap().is_none());
        ts.store.set_config("max_agents", "4").await.unwrap();
        assert_eq!(
            ts.store.get_config("max_agents").await.unwrap().as_deref(),
            Some("4")
        );
        ts.store.set_config("max_agents", "2").await.unwrap();
        assert_eq!(
            ts.store.get_config("max_agents").await.unwrap().as_deref(),
            Some("2")
        );
    }

    #[tokio::test]
    async fn resuming_clears_pending_answer_on_next_transition() {
        // Boundary from the spec: a NEEDS_ATTENTION unit with a pending
        // answer must drop it when it transitions onward.
        let ts = create_test_store().await;
        let mut u = unit("asked");
        u.status = WorkUnitStatus::NeedsAttention;
        u.attention_reason = Some("question".to_string());
        ts.store.create_work_unit(&u).await.unwrap();

        let mut answered = ts.store.get_work_unit("asked").await.unwrap();
        answered.status = WorkUnitStatus::Ready;
        answered.pending_answer = Some("use port 8080".to_string());
        ts.store.update_work_unit(&answered).await.unwrap();

        let mut resumed = ts.store.get_work_unit("asked").await.unwrap();
        resumed.status = WorkUnitStatus::Running;
        resumed.pending_answer = None;
        resumed.session_id = None;
        ts.store.update_work_unit(&resumed).await.unwrap();

        let final_unit = ts.store.get_work_unit("asked").await.unwrap();
        assert_eq!(final_unit.status, WorkUnitStatus::Running);
        assert!(final_unit.pending_answer.is_none());
    }
}

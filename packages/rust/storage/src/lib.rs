//! libSQL run ledger and reasoning cache.
//!
//! The [`Ledger`] struct wraps a libSQL database recording processing runs,
//! per-record outcomes, and cached structured reasoning results. The CLI is
//! the sole writer; the ledger is an audit trail, never an input to
//! decisions within a run.

mod migrations;

use std::path::Path;

use chrono::Utc;
use libsql::{Connection, Database, params};
use sha2::{Digest, Sha256};
use uuid::Uuid;

use lorekeeper_shared::{LorekeeperError, Result};

/// Per-action counts for a finished run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct OutcomeCounts {
    pub created: u32,
    pub updated: u32,
    pub appended: u32,
    pub replaced: u32,
    pub ignored: u32,
    pub failed: u32,
}

impl OutcomeCounts {
    pub fn total(&self) -> u32 {
        self.created + self.updated + self.appended + self.replaced + self.ignored + self.failed
    }
}

/// A row from the `runs` table.
#[derive(Debug, Clone)]
pub struct RunRow {
    pub id: String,
    pub started_at: String,
    pub finished_at: Option<String>,
    pub status: String,
    pub records_total: u32,
    pub counts: OutcomeCounts,
    pub proposal_id: Option<String>,
}

/// Primary ledger handle wrapping a libSQL database.
pub struct Ledger {
    #[allow(dead_code)]
    db: Database,
    conn: Connection,
}

impl Ledger {
    /// Open or create a database at `path`, applying pending migrations.
    pub async fn open(path: &Path) -> Result<Self> {
        // Ensure parent directory exists
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| LorekeeperError::io(parent, e))?;
        }

        let db = libsql::Builder::new_local(path)
            .build()
            .await
            .map_err(|e| LorekeeperError::Storage(e.to_string()))?;

        let conn = db
            .connect()
            .map_err(|e| LorekeeperError::Storage(e.to_string()))?;

        let ledger = Self { db, conn };
        ledger.run_migrations().await?;
        Ok(ledger)
    }

    /// Run pending schema migrations.
    async fn run_migrations(&self) -> Result<()> {
        let current_version = self.get_schema_version().await;

        for migration in migrations::all_migrations() {
            if migration.version > current_version {
                tracing::info!(
                    version = migration.version,
                    description = migration.description,
                    "applying migration"
                );
                self.conn.execute_batch(migration.sql).await.map_err(|e| {
                    LorekeeperError::Storage(format!(
                        "migration v{} failed: {e}",
                        migration.version
                    ))
                })?;
            }
        }
        Ok(())
    }

    /// Get the current schema version, or 0 if no migrations have been applied.
    async fn get_schema_version(&self) -> u32 {
        let result = self
            .conn
            .query("SELECT MAX(version) FROM schema_migrations", params![])
            .await;

        match result {
            Ok(mut rows) => {
                if let Ok(Some(row)) = rows.next().await {
                    row.get::<u32>(0).unwrap_or(0)
                } else {
                    0
                }
            }
            Err(_) => 0, // Table doesn't exist yet
        }
    }

    // -----------------------------------------------------------------------
    // Run operations
    // -----------------------------------------------------------------------

    /// Record the start of a processing run.
    pub async fn insert_run(&self, run_id: &str, records_total: u32) -> Result<()> {
        let now = Utc::now().to_rfc3339();
        self.conn
            .execute(
                "INSERT INTO runs (id, started_at, records_total) VALUES (?1, ?2, ?3)",
                params![run_id, now.as_str(), records_total],
            )
            .await
            .map_err(|e| LorekeeperError::Storage(e.to_string()))?;
        Ok(())
    }

    /// Mark a run finished with its per-action counts.
    pub async fn finish_run(
        &self,
        run_id: &str,
        status: &str,
        counts: &OutcomeCounts,
        proposal_id: Option<&str>,
    ) -> Result<()> {
        let now = Utc::now().to_rfc3339();
        self.conn
            .execute(
                "UPDATE runs SET finished_at = ?2, status = ?3, created = ?4, updated = ?5,
                 appended = ?6, replaced = ?7, ignored = ?8, failed = ?9, proposal_id = ?10
                 WHERE id = ?1",
                params![
                    run_id,
                    now.as_str(),
                    status,
                    counts.created,
                    counts.updated,
                    counts.appended,
                    counts.replaced,
                    counts.ignored,
                    counts.failed,
                    proposal_id
                ],
            )
            .await
            .map_err(|e| LorekeeperError::Storage(e.to_string()))?;
        Ok(())
    }

    /// List the most recent runs, newest first.
    pub async fn list_runs(&self, limit: u32) -> Result<Vec<RunRow>> {
        let mut rows = self
            .conn
            .query(
                "SELECT id, started_at, finished_at, status, records_total,
                        created, updated, appended, replaced, ignored, failed, proposal_id
                 FROM runs ORDER BY started_at DESC LIMIT ?1",
                params![limit],
            )
            .await
            .map_err(|e| LorekeeperError::Storage(e.to_string()))?;

        let mut runs = Vec::new();
        while let Some(row) = rows
            .next()
            .await
            .map_err(|e| LorekeeperError::Storage(e.to_string()))?
        {
            runs.push(RunRow {
                id: row.get(0).map_err(|e| LorekeeperError::Storage(e.to_string()))?,
                started_at: row.get(1).map_err(|e| LorekeeperError::Storage(e.to_string()))?,
                finished_at: row.get(2).ok(),
                status: row.get(3).map_err(|e| LorekeeperError::Storage(e.to_string()))?,
                records_total: row.get(4).unwrap_or(0),
                counts: OutcomeCounts {
                    created: row.get(5).unwrap_or(0),
                    updated: row.get(6).unwrap_or(0),
                    appended: row.get(7).unwrap_or(0),
                    replaced: row.get(8).unwrap_or(0),
                    ignored: row.get(9).unwrap_or(0),
                    failed: row.get(10).unwrap_or(0),
                },
                proposal_id: row.get(11).ok(),
            });
        }
        Ok(runs)
    }

    // -----------------------------------------------------------------------
    // Record outcomes
    // -----------------------------------------------------------------------

    /// Record one conversation record's outcome within a run.
    #[allow(clippy::too_many_arguments)]
    pub async fn insert_outcome(
        &self,
        run_id: &str,
        record_id: &str,
        action: &str,
        confidence: f64,
        target_path: Option<&str>,
        fallback: bool,
        note: Option<&str>,
    ) -> Result<()> {
        let now = Utc::now().to_rfc3339();
        self.conn
            .execute(
                "INSERT INTO record_outcomes
                 (run_id, record_id, action, confidence, target_path, fallback, note, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                params![
                    run_id,
                    record_id,
                    action,
                    confidence,
                    target_path,
                    fallback as i32,
                    note,
                    now.as_str()
                ],
            )
            .await
            .map_err(|e| LorekeeperError::Storage(e.to_string()))?;
        Ok(())
    }

    /// Outcomes for one run as `(record_id, action, confidence, fallback)`.
    pub async fn outcomes_for_run(
        &self,
        run_id: &str,
    ) -> Result<Vec<(String, String, f64, bool)>> {
        let mut rows = self
            .conn
            .query(
                "SELECT record_id, action, confidence, fallback
                 FROM record_outcomes WHERE run_id = ?1 ORDER BY id",
                params![run_id],
            )
            .await
            .map_err(|e| LorekeeperError::Storage(e.to_string()))?;

        let mut outcomes = Vec::new();
        while let Some(row) = rows
            .next()
            .await
            .map_err(|e| LorekeeperError::Storage(e.to_string()))?
        {
            outcomes.push((
                row.get(0).map_err(|e| LorekeeperError::Storage(e.to_string()))?,
                row.get(1).map_err(|e| LorekeeperError::Storage(e.to_string()))?,
                row.get(2).unwrap_or(0.0),
                row.get::<i32>(3).unwrap_or(0) != 0,
            ));
        }
        Ok(outcomes)
    }

    // -----------------------------------------------------------------------
    // Reasoning cache
    // -----------------------------------------------------------------------

    /// Look up a cached structured reasoning result.
    pub async fn get_cached_reasoning(
        &self,
        task: &str,
        content_hash: &str,
        model: &str,
    ) -> Result<Option<String>> {
        let mut rows = self
            .conn
            .query(
                "SELECT result_json FROM reasoning_cache
                 WHERE task = ?1 AND content_hash = ?2 AND model = ?3",
                params![task, content_hash, model],
            )
            .await
            .map_err(|e| LorekeeperError::Storage(e.to_string()))?;

        match rows
            .next()
            .await
            .map_err(|e| LorekeeperError::Storage(e.to_string()))?
        {
            Some(row) => Ok(row.get(0).ok()),
            None => Ok(None),
        }
    }

    /// Store a structured reasoning result.
    pub async fn set_cached_reasoning(
        &self,
        task: &str,
        content_hash: &str,
        model: &str,
        result_json: &str,
    ) -> Result<()> {
        let now = Utc::now().to_rfc3339();
        let id = Uuid::now_v7().to_string();
        self.conn
            .execute(
                "INSERT OR REPLACE INTO reasoning_cache
                 (id, task, content_hash, model, result_json, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    id.as_str(),
                    task,
                    content_hash,
                    model,
                    result_json,
                    now.as_str()
                ],
            )
            .await
            .map_err(|e| LorekeeperError::Storage(e.to_string()))?;
        Ok(())
    }
}

/// Compute the cache key for a piece of content under a task kind.
pub fn content_hash(content: &str, task: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(content.as_bytes());
    hasher.update(task.as_bytes());
    format!("{:x}", hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn test_ledger() -> Ledger {
        let tmp = std::env::temp_dir().join(format!("lk_test_{}.db", Uuid::now_v7()));
        Ledger::open(&tmp).await.expect("open test ledger")
    }

    #[test]
    fn content_hash_is_deterministic() {
        let h1 = content_hash("hello world", "extract");
        let h2 = content_hash("hello world", "extract");
        assert_eq!(h1, h2);
    }

    #[test]
    fn content_hash_differs_by_task() {
        assert_ne!(content_hash("hello", "extract"), content_hash("hello", "arbitrate"));
    }

    #[tokio::test]
    async fn idempotent_migration() {
        let tmp = std::env::temp_dir().join(format!("lk_test_{}.db", Uuid::now_v7()));
        let first = Ledger::open(&tmp).await.expect("first open");
        drop(first);
        let second = Ledger::open(&tmp).await.expect("second open");
        assert_eq!(second.get_schema_version().await, 1);
    }

    #[tokio::test]
    async fn run_lifecycle() {
        let ledger = test_ledger().await;
        let run_id = Uuid::now_v7().to_string();

        ledger.insert_run(&run_id, 3).await.expect("insert run");

        let counts = OutcomeCounts {
            created: 1,
            updated: 1,
            ignored: 1,
            ..Default::default()
        };
        ledger
            .finish_run(&run_id, "completed", &counts, Some("kb/db-timeouts-0192ab34"))
            .await
            .expect("finish run");

        let runs = ledger.list_runs(10).await.expect("list runs");
        assert_eq!(runs.len(), 1);
        assert_eq!(runs[0].id, run_id);
        assert_eq!(runs[0].status, "completed");
        assert_eq!(runs[0].counts, counts);
        assert_eq!(runs[0].counts.total(), 3);
        assert_eq!(runs[0].proposal_id.as_deref(), Some("kb/db-timeouts-0192ab34"));
    }

    #[tokio::test]
    async fn outcomes_are_recorded_per_record() {
        let ledger = test_ledger().await;
        let run_id = Uuid::now_v7().to_string();
        ledger.insert_run(&run_id, 2).await.unwrap();

        ledger
            .insert_outcome(
                &run_id,
                "rec-1",
                "update",
                0.82,
                Some("troubleshooting/db-timeouts.md"),
                false,
                None,
            )
            .await
            .expect("insert outcome");
        ledger
            .insert_outcome(&run_id, "rec-2", "create", 0.5, None, true, Some("arbiter timeout"))
            .await
            .expect("insert fallback outcome");

        let outcomes = ledger.outcomes_for_run(&run_id).await.expect("outcomes");
        assert_eq!(outcomes.len(), 2);
        assert_eq!(outcomes[0].1, "update");
        assert!(!outcomes[0].3);
        assert_eq!(outcomes[1].1, "create");
        assert!(outcomes[1].3, "fallback flag must persist");
    }

    #[tokio::test]
    async fn reasoning_cache_roundtrip() {
        let ledger = test_ledger().await;
        let hash = content_hash("conversation text", "extract");

        // Miss
        let cached = ledger
            .get_cached_reasoning("extract", &hash, "test-model")
            .await
            .expect("cache miss");
        assert!(cached.is_none());

        // Set
        ledger
            .set_cached_reasoning("extract", &hash, "test-model", r#"{"is_kb_worthy": true}"#)
            .await
            .expect("set cache");

        // Hit
        let cached = ledger
            .get_cached_reasoning("extract", &hash, "test-model")
            .await
            .expect("cache hit");
        assert!(cached.unwrap().contains("is_kb_worthy"));

        // Different model misses
        let other = ledger
            .get_cached_reasoning("extract", &hash, "other-model")
            .await
            .unwrap();
        assert!(other.is_none());
    }
}

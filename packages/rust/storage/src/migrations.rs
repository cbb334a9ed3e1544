//! SQL migration definitions for the lorekeeper run ledger.
//!
//! Migrations are applied in order on database open. Each migration has a
//! version number and a set of SQL statements executed within a transaction.

/// A database migration with a version and SQL statements.
pub(crate) struct Migration {
    pub version: u32,
    pub description: &'static str,
    pub sql: &'static str,
}

/// All migrations, in ascending version order.
pub(crate) fn all_migrations() -> Vec<Migration> {
    vec![Migration {
        version: 1,
        description: "Initial schema: runs, record_outcomes, reasoning_cache",
        sql: r#"
-- Schema version tracking
CREATE TABLE IF NOT EXISTS schema_migrations (
    version   INTEGER PRIMARY KEY,
    applied_at TEXT NOT NULL DEFAULT (datetime('now'))
);

-- Processing run history
CREATE TABLE IF NOT EXISTS runs (
    id            TEXT PRIMARY KEY,
    started_at    TEXT NOT NULL,
    finished_at   TEXT,
    status        TEXT NOT NULL DEFAULT 'running',
    records_total INTEGER NOT NULL DEFAULT 0,
    created       INTEGER NOT NULL DEFAULT 0,
    updated       INTEGER NOT NULL DEFAULT 0,
    appended      INTEGER NOT NULL DEFAULT 0,
    replaced      INTEGER NOT NULL DEFAULT 0,
    ignored       INTEGER NOT NULL DEFAULT 0,
    failed        INTEGER NOT NULL DEFAULT 0,
    proposal_id   TEXT
);

-- Per-record outcomes within a run. One row per conversation record,
-- written exactly once; retries produce new runs, never row updates.
CREATE TABLE IF NOT EXISTS record_outcomes (
    id          INTEGER PRIMARY KEY AUTOINCREMENT,
    run_id      TEXT NOT NULL REFERENCES runs(id) ON DELETE CASCADE,
    record_id   TEXT NOT NULL,
    action      TEXT NOT NULL,
    confidence  REAL NOT NULL,
    target_path TEXT,
    fallback    INTEGER NOT NULL DEFAULT 0,
    note        TEXT,
    created_at  TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_outcomes_run ON record_outcomes(run_id);
CREATE INDEX IF NOT EXISTS idx_outcomes_record ON record_outcomes(record_id);

-- Structured reasoning results keyed by content hash, so unchanged
-- conversations reuse prior judgments across runs.
CREATE TABLE IF NOT EXISTS reasoning_cache (
    id          TEXT PRIMARY KEY,
    task        TEXT NOT NULL,
    content_hash TEXT NOT NULL,
    model       TEXT NOT NULL,
    result_json TEXT NOT NULL,
    created_at  TEXT NOT NULL,
    UNIQUE(task, content_hash, model)
);

INSERT INTO schema_migrations (version) VALUES (1);
"#,
    }]
}

// SQLite pool setup and schema bootstrap
// The database is the single source of truth for assets, events, jobs,
// rules, roles and configuration

use crate::error::Result;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteSynchronous};
use sqlx::SqlitePool;
use std::path::Path;
use std::str::FromStr;

/// Open (and create if missing) the SQLite database at the given path
///
/// WAL mode keeps readers concurrent while writes stay serialized.
pub async fn open_pool(db_path: &Path) -> Result<SqlitePool> {
    if let Some(parent) = db_path.parent() {
        std::fs::create_dir_all(parent)?;
    }

    let options = SqliteConnectOptions::from_str(&format!("sqlite://{}", db_path.display()))?
        .create_if_missing(true)
        .journal_mode(SqliteJournalMode::Wal)
        .synchronous(SqliteSynchronous::Normal)
        .foreign_keys(true);

    let pool = SqlitePoolOptions::new()
        .max_connections(8)
        .connect_with(options)
        .await?;

    Ok(pool)
}

/// Open an in-memory database, used by tests
pub async fn open_memory_pool() -> Result<SqlitePool> {
    let options = SqliteConnectOptions::from_str("sqlite::memory:")?.foreign_keys(true);

    // A single connection so every query sees the same in-memory database
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .connect_with(options)
        .await?;

    Ok(pool)
}

/// Create all tables if they do not exist yet
pub async fn init_schema(pool: &SqlitePool) -> Result<()> {
    let statements = [
        r#"
        CREATE TABLE IF NOT EXISTS so_assets (
            id            TEXT PRIMARY KEY,
            abs_path      TEXT NOT NULL UNIQUE,
            current_path  TEXT NOT NULL,
            file_name     TEXT NOT NULL,
            size          INTEGER NOT NULL DEFAULT 0,
            mtime         TEXT,
            ctime         TEXT,
            file_hash     TEXT,
            status        TEXT NOT NULL DEFAULT 'pending',
            duration_sec  REAL,
            width         INTEGER,
            height        INTEGER,
            fps           REAL,
            video_codec   TEXT,
            audio_codec   TEXT,
            bitrate       INTEGER,
            container     TEXT,
            tags_json     TEXT NOT NULL DEFAULT '[]',
            created_at    TEXT NOT NULL,
            updated_at    TEXT NOT NULL,
            indexed_at    TEXT
        )
        "#,
        r#"
        CREATE TABLE IF NOT EXISTS so_asset_events (
            id            TEXT PRIMARY KEY,
            asset_id      TEXT NOT NULL,
            event_type    TEXT NOT NULL,
            payload_json  TEXT NOT NULL DEFAULT '{}',
            job_id        TEXT,
            created_at    TEXT NOT NULL
        )
        "#,
        "CREATE INDEX IF NOT EXISTS idx_asset_events_asset ON so_asset_events (asset_id, created_at)",
        r#"
        CREATE TABLE IF NOT EXISTS so_jobs (
            id               TEXT PRIMARY KEY,
            type             TEXT NOT NULL,
            asset_id         TEXT,
            payload_json     TEXT NOT NULL DEFAULT '{}',
            state            TEXT NOT NULL DEFAULT 'queued',
            priority         INTEGER NOT NULL DEFAULT 1,
            retry_count      INTEGER NOT NULL DEFAULT 0,
            max_retries      INTEGER NOT NULL DEFAULT 3,
            timeout_sec      INTEGER,
            result_json      TEXT,
            error_message    TEXT,
            cancel_requested INTEGER NOT NULL DEFAULT 0,
            next_retry_at    TEXT,
            created_at       TEXT NOT NULL,
            started_at       TEXT,
            completed_at     TEXT,
            updated_at       TEXT NOT NULL
        )
        "#,
        "CREATE INDEX IF NOT EXISTS idx_jobs_state ON so_jobs (state, priority, created_at)",
        r#"
        CREATE TABLE IF NOT EXISTS so_progress (
            job_id      TEXT PRIMARY KEY,
            progress    REAL NOT NULL DEFAULT 0,
            updated_at  TEXT NOT NULL
        )
        "#,
        r#"
        CREATE TABLE IF NOT EXISTS so_rules (
            id                TEXT PRIMARY KEY,
            name              TEXT NOT NULL,
            priority          INTEGER NOT NULL DEFAULT 0,
            enabled           INTEGER NOT NULL DEFAULT 1,
            trigger_json      TEXT NOT NULL DEFAULT '{}',
            conditions_json   TEXT NOT NULL DEFAULT '[]',
            actions_json      TEXT NOT NULL DEFAULT '[]',
            guardrails_json   TEXT NOT NULL DEFAULT '{}',
            quiet_period_sec  INTEGER,
            created_at        TEXT NOT NULL,
            updated_at        TEXT NOT NULL
        )
        "#,
        r#"
        CREATE TABLE IF NOT EXISTS so_roles (
            role      TEXT PRIMARY KEY,
            abs_path  TEXT NOT NULL,
            watch     INTEGER NOT NULL DEFAULT 0
        )
        "#,
        r#"
        CREATE TABLE IF NOT EXISTS so_configs (
            key         TEXT PRIMARY KEY,
            value_json  TEXT NOT NULL,
            updated_at  TEXT NOT NULL
        )
        "#,
        r#"
        CREATE VIRTUAL TABLE IF NOT EXISTS so_assets_fts USING fts5(
            asset_id UNINDEXED,
            file_name,
            path,
            tag_text
        )
        "#,
    ];

    for statement in statements {
        sqlx::query(statement).execute(pool).await?;
    }

    Ok(())
}

//! Database schema initialization

use sqlx::SqlitePool;

use crate::error::Result;

/// Initialize the database schema
pub async fn initialize_schema(pool: &SqlitePool) -> Result<()> {
    sqlx::query(SCHEMA_SQL)
        .execute(pool)
        .await?;

    Ok(())
}

const SCHEMA_SQL: &str = r#"
-- Upload sessions (one row per resumable upload; chunk set is a JSON array)
CREATE TABLE IF NOT EXISTS upload_sessions (
    token TEXT PRIMARY KEY,
    original_name TEXT NOT NULL,
    server_name TEXT NOT NULL UNIQUE,
    owner TEXT NOT NULL,
    total_size INTEGER NOT NULL,
    content_type TEXT,
    total_chunks INTEGER,
    uploaded_chunks TEXT NOT NULL DEFAULT '[]',
    staging_dir TEXT NOT NULL,
    status TEXT NOT NULL DEFAULT 'IN_PROGRESS',
    checksum TEXT,
    created_at TEXT NOT NULL,
    last_activity_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_upload_sessions_owner ON upload_sessions(owner);
CREATE INDEX IF NOT EXISTS idx_upload_sessions_status_activity
    ON upload_sessions(status, last_activity_at);

-- Audit trail for attachment actions
CREATE TABLE IF NOT EXISTS audit_log (
    id TEXT PRIMARY KEY,
    actor TEXT NOT NULL,
    action TEXT NOT NULL,
    details TEXT NOT NULL,
    created_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_audit_log_actor ON audit_log(actor);
CREATE INDEX IF NOT EXISTS idx_audit_log_created ON audit_log(created_at);
"#;

//! Upload Session Store
//!
//! Persistence contract for upload sessions with a SQLite implementation
//! and an in-memory one for single-node and test use. `update` replaces the
//! whole record, chunk set and status included, in a single statement.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use chrono::{DateTime, SecondsFormat, Utc};
use sqlx::SqlitePool;
use tokio::sync::RwLock;

use super::types::{SessionStatus, UploadSession};

/// Session store errors
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("Session not found: {0}")]
    NotFound(String),

    #[error("Session already exists: {0}")]
    Duplicate(String),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Corrupt session record {token}: {reason}")]
    Corrupt { token: String, reason: String },
}

// ============================================================================
// Store Trait
// ============================================================================

/// Trait for session persistence backends
#[async_trait::async_trait]
pub trait SessionStore: Send + Sync {
    /// Insert a new session; fails if the token or server name is taken
    async fn create(&self, session: &UploadSession) -> Result<(), StoreError>;

    /// Get a session by token
    async fn get(&self, token: &str) -> Result<Option<UploadSession>, StoreError>;

    /// Replace an existing session record
    async fn update(&self, session: &UploadSession) -> Result<(), StoreError>;

    /// Delete a session; `Ok(false)` if it did not exist
    async fn delete(&self, token: &str) -> Result<bool, StoreError>;

    /// Sessions in `status` whose last activity is before `older_than`
    async fn find_stale(
        &self,
        status: SessionStatus,
        older_than: DateTime<Utc>,
    ) -> Result<Vec<UploadSession>, StoreError>;

    /// Look up the session that produced a committed artifact
    async fn find_by_server_name(
        &self,
        server_name: &str,
    ) -> Result<Option<UploadSession>, StoreError>;
}

// ============================================================================
// In-Memory Store
// ============================================================================

/// Map-backed store for single-node deployments and tests
#[derive(Clone, Default)]
pub struct MemorySessionStore {
    sessions: Arc<RwLock<HashMap<String, UploadSession>>>,
}

impl MemorySessionStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.sessions.read().await.len()
    }
}

#[async_trait::async_trait]
impl SessionStore for MemorySessionStore {
    async fn create(&self, session: &UploadSession) -> Result<(), StoreError> {
        let mut sessions = self.sessions.write().await;
        if sessions.contains_key(&session.token)
            || sessions.values().any(|s| s.server_name == session.server_name)
        {
            return Err(StoreError::Duplicate(session.token.clone()));
        }
        sessions.insert(session.token.clone(), session.clone());
        Ok(())
    }

    async fn get(&self, token: &str) -> Result<Option<UploadSession>, StoreError> {
        Ok(self.sessions.read().await.get(token).cloned())
    }

    async fn update(&self, session: &UploadSession) -> Result<(), StoreError> {
        let mut sessions = self.sessions.write().await;
        match sessions.get_mut(&session.token) {
            Some(existing) => {
                *existing = session.clone();
                Ok(())
            }
            None => Err(StoreError::NotFound(session.token.clone())),
        }
    }

    async fn delete(&self, token: &str) -> Result<bool, StoreError> {
        Ok(self.sessions.write().await.remove(token).is_some())
    }

    async fn find_stale(
        &self,
        status: SessionStatus,
        older_than: DateTime<Utc>,
    ) -> Result<Vec<UploadSession>, StoreError> {
        let sessions = self.sessions.read().await;
        Ok(sessions
            .values()
            .filter(|s| s.status == status && s.last_activity_at < older_than)
            .cloned()
            .collect())
    }

    async fn find_by_server_name(
        &self,
        server_name: &str,
    ) -> Result<Option<UploadSession>, StoreError> {
        let sessions = self.sessions.read().await;
        Ok(sessions
            .values()
            .find(|s| s.server_name == server_name)
            .cloned())
    }
}

// ============================================================================
// SQLite Store
// ============================================================================

/// Raw `upload_sessions` row
#[derive(Debug, sqlx::FromRow)]
struct SessionRow {
    token: String,
    original_name: String,
    server_name: String,
    owner: String,
    total_size: i64,
    content_type: Option<String>,
    total_chunks: Option<i64>,
    uploaded_chunks: String,
    staging_dir: String,
    status: String,
    checksum: Option<String>,
    created_at: String,
    last_activity_at: String,
}

impl TryFrom<SessionRow> for UploadSession {
    type Error = StoreError;

    fn try_from(row: SessionRow) -> Result<Self, Self::Error> {
        let corrupt = |reason: String| StoreError::Corrupt {
            token: row.token.clone(),
            reason,
        };

        let uploaded_chunks: BTreeSet<u32> = serde_json::from_str(&row.uploaded_chunks)
            .map_err(|e| corrupt(format!("uploaded_chunks: {}", e)))?;
        let status = row.status.parse::<SessionStatus>().map_err(corrupt)?;
        let created_at = parse_timestamp(&row.created_at).map_err(corrupt)?;
        let last_activity_at = parse_timestamp(&row.last_activity_at).map_err(corrupt)?;
        let total_chunks = row
            .total_chunks
            .map(u32::try_from)
            .transpose()
            .map_err(|e| corrupt(format!("total_chunks: {}", e)))?;

        Ok(UploadSession {
            token: row.token,
            original_name: row.original_name,
            server_name: row.server_name,
            owner: row.owner,
            total_size: row.total_size.max(0) as u64,
            content_type: row.content_type,
            total_chunks,
            uploaded_chunks,
            staging_dir: row.staging_dir,
            status,
            checksum: row.checksum,
            created_at,
            last_activity_at,
        })
    }
}

/// Fixed-width RFC 3339 so that text comparison orders chronologically
fn format_timestamp(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_timestamp(value: &str) -> Result<DateTime<Utc>, String> {
    DateTime::parse_from_rfc3339(value)
        .map(|ts| ts.with_timezone(&Utc))
        .map_err(|e| format!("timestamp {}: {}", value, e))
}

fn encode_chunks(chunks: &BTreeSet<u32>) -> String {
    // A set of integers always serializes
    serde_json::to_string(chunks).unwrap_or_else(|_| "[]".to_string())
}

const SELECT_COLUMNS: &str = r#"
    SELECT token, original_name, server_name, owner, total_size, content_type,
           total_chunks, uploaded_chunks, staging_dir, status, checksum,
           created_at, last_activity_at
    FROM upload_sessions
"#;

/// SQLite-backed session store
#[derive(Clone)]
pub struct SqliteSessionStore {
    pool: SqlitePool,
}

impl SqliteSessionStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

#[async_trait::async_trait]
impl SessionStore for SqliteSessionStore {
    async fn create(&self, session: &UploadSession) -> Result<(), StoreError> {
        let result = sqlx::query(
            r#"
            INSERT INTO upload_sessions (
                token, original_name, server_name, owner, total_size, content_type,
                total_chunks, uploaded_chunks, staging_dir, status, checksum,
                created_at, last_activity_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&session.token)
        .bind(&session.original_name)
        .bind(&session.server_name)
        .bind(&session.owner)
        .bind(session.total_size as i64)
        .bind(&session.content_type)
        .bind(session.total_chunks.map(i64::from))
        .bind(encode_chunks(&session.uploaded_chunks))
        .bind(&session.staging_dir)
        .bind(session.status.as_str())
        .bind(&session.checksum)
        .bind(format_timestamp(session.created_at))
        .bind(format_timestamp(session.last_activity_at))
        .execute(&self.pool)
        .await;

        match result {
            Ok(_) => Ok(()),
            Err(sqlx::Error::Database(e)) if e.is_unique_violation() => {
                Err(StoreError::Duplicate(session.token.clone()))
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn get(&self, token: &str) -> Result<Option<UploadSession>, StoreError> {
        let row = sqlx::query_as::<_, SessionRow>(&format!("{} WHERE token = ?", SELECT_COLUMNS))
            .bind(token)
            .fetch_optional(&self.pool)
            .await?;

        row.map(UploadSession::try_from).transpose()
    }

    async fn update(&self, session: &UploadSession) -> Result<(), StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE upload_sessions
            SET original_name = ?,
                total_chunks = ?,
                uploaded_chunks = ?,
                status = ?,
                checksum = ?,
                last_activity_at = ?
            WHERE token = ?
            "#,
        )
        .bind(&session.original_name)
        .bind(session.total_chunks.map(i64::from))
        .bind(encode_chunks(&session.uploaded_chunks))
        .bind(session.status.as_str())
        .bind(&session.checksum)
        .bind(format_timestamp(session.last_activity_at))
        .bind(&session.token)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound(session.token.clone()));
        }

        Ok(())
    }

    async fn delete(&self, token: &str) -> Result<bool, StoreError> {
        let result = sqlx::query("DELETE FROM upload_sessions WHERE token = ?")
            .bind(token)
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn find_stale(
        &self,
        status: SessionStatus,
        older_than: DateTime<Utc>,
    ) -> Result<Vec<UploadSession>, StoreError> {
        let rows = sqlx::query_as::<_, SessionRow>(&format!(
            "{} WHERE status = ? AND last_activity_at < ? ORDER BY last_activity_at ASC",
            SELECT_COLUMNS
        ))
        .bind(status.as_str())
        .bind(format_timestamp(older_than))
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(UploadSession::try_from).collect()
    }

    async fn find_by_server_name(
        &self,
        server_name: &str,
    ) -> Result<Option<UploadSession>, StoreError> {
        let row = sqlx::query_as::<_, SessionRow>(&format!(
            "{} WHERE server_name = ?",
            SELECT_COLUMNS
        ))
        .bind(server_name)
        .fetch_optional(&self.pool)
        .await?;

        row.map(UploadSession::try_from).transpose()
    }
}

//! Audit sink for attachment actions
//!
//! Upload operations report notable events here. Sink failures are logged by
//! the caller and never fail the operation that produced the event.

use chrono::{SecondsFormat, Utc};
use sqlx::SqlitePool;
use uuid::Uuid;

/// Audited attachment actions
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuditAction {
    UploadInitiated,
    UploadCompleted,
    UploadCancelled,
    FileDeleted,
}

impl AuditAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::UploadInitiated => "ATTACHMENT_UPLOAD_INITIATED",
            Self::UploadCompleted => "ATTACHMENT_UPLOAD_COMPLETED",
            Self::UploadCancelled => "ATTACHMENT_UPLOAD_CANCELLED",
            Self::FileDeleted => "ATTACHMENT_FILE_DELETED",
        }
    }
}

#[async_trait::async_trait]
pub trait AuditSink: Send + Sync {
    async fn log_action(
        &self,
        actor: &str,
        action: AuditAction,
        details: &str,
    ) -> anyhow::Result<()>;
}

/// Emits audit events as structured log lines on the `audit` target
#[derive(Debug, Clone, Default)]
pub struct TracingAuditSink;

#[async_trait::async_trait]
impl AuditSink for TracingAuditSink {
    async fn log_action(
        &self,
        actor: &str,
        action: AuditAction,
        details: &str,
    ) -> anyhow::Result<()> {
        tracing::info!(target: "audit", actor = %actor, action = action.as_str(), details = %details, "Attachment action");
        Ok(())
    }
}

/// Persists audit events to the `audit_log` table
#[derive(Clone)]
pub struct SqliteAuditSink {
    pool: SqlitePool,
}

impl SqliteAuditSink {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

#[async_trait::async_trait]
impl AuditSink for SqliteAuditSink {
    async fn log_action(
        &self,
        actor: &str,
        action: AuditAction,
        details: &str,
    ) -> anyhow::Result<()> {
        sqlx::query(
            r#"
            INSERT INTO audit_log (id, actor, action, details, created_at)
            VALUES (?, ?, ?, ?, ?)
            "#,
        )
        .bind(Uuid::new_v4().to_string())
        .bind(actor)
        .bind(action.as_str())
        .bind(details)
        .bind(Utc::now().to_rfc3339_opts(SecondsFormat::Micros, true))
        .execute(&self.pool)
        .await?;

        Ok(())
    }
}

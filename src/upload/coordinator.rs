//! Upload Coordinator
//!
//! Drives the session state machine:
//!
//! ```text
//! initiate ──> IN_PROGRESS ──upload_chunk──> IN_PROGRESS
//!                   │
//!                   ├──finalize──> COMPLETED | FAILED_MISSING_CHUNK | FAILED_ASSEMBLY
//!                   ├──chunk write error──> FAILED_CHUNK_WRITE
//!                   └──cancel──> CANCELLED
//! ```
//!
//! Every mutation of a session happens under that session's token lock.

use std::path::PathBuf;
use std::sync::Arc;

use chrono::Utc;
use uuid::Uuid;

use super::artifacts::{ArtifactStore, CommittedArtifact};
use super::locks::TokenLocks;
use super::naming;
use super::staging::{StagingArea, StagingError};
use super::store::SessionStore;
use super::types::{
    ChunkProgress, InitiatedUpload, SessionStatus, UploadError, UploadSession, MAX_FILE_SIZE,
};
use crate::audit::{AuditAction, AuditSink};

/// Why assembling an artifact failed
enum AssemblyFailure {
    MissingChunk(u32),
    Io(String),
}

// ============================================================================
// Coordinator
// ============================================================================

#[derive(Clone)]
pub struct UploadCoordinator {
    inner: Arc<UploadCoordinatorInner>,
}

struct UploadCoordinatorInner {
    store: Arc<dyn SessionStore>,
    staging: StagingArea,
    artifacts: ArtifactStore,
    locks: TokenLocks,
    audit: Arc<dyn AuditSink>,
    max_file_size: u64,
}

impl UploadCoordinator {
    pub fn new(
        store: Arc<dyn SessionStore>,
        staging: StagingArea,
        artifacts: ArtifactStore,
        locks: TokenLocks,
        audit: Arc<dyn AuditSink>,
    ) -> Self {
        Self::with_max_file_size(store, staging, artifacts, locks, audit, MAX_FILE_SIZE)
    }

    pub fn with_max_file_size(
        store: Arc<dyn SessionStore>,
        staging: StagingArea,
        artifacts: ArtifactStore,
        locks: TokenLocks,
        audit: Arc<dyn AuditSink>,
        max_file_size: u64,
    ) -> Self {
        Self {
            inner: Arc::new(UploadCoordinatorInner {
                store,
                staging,
                artifacts,
                locks,
                audit,
                max_file_size,
            }),
        }
    }

    // ========================================================================
    // Session Lifecycle
    // ========================================================================

    /// Open a new upload session
    pub async fn initiate(
        &self,
        file_name: &str,
        total_size: u64,
        content_type: Option<String>,
        owner: &str,
    ) -> Result<InitiatedUpload, UploadError> {
        let original_name = naming::validate_file_name(file_name)?;

        if total_size == 0 {
            return Err(UploadError::InvalidRequest(
                "total size must be greater than zero".to_string(),
            ));
        }
        if total_size > self.inner.max_file_size {
            return Err(UploadError::FileTooLarge {
                size: total_size,
                max: self.inner.max_file_size,
            });
        }

        let now = Utc::now();
        let token = Uuid::new_v4().to_string();
        let server_name = naming::server_file_name(&original_name, now);

        let staging_dir = self.inner.staging.allocate(&token).await?;

        let session = UploadSession {
            token: token.clone(),
            original_name,
            server_name: server_name.clone(),
            owner: owner.to_string(),
            total_size,
            content_type,
            total_chunks: None,
            uploaded_chunks: Default::default(),
            staging_dir,
            status: SessionStatus::InProgress,
            checksum: None,
            created_at: now,
            last_activity_at: now,
        };

        if let Err(e) = self.inner.store.create(&session).await {
            self.inner.staging.purge(&session.staging_dir).await;
            return Err(e.into());
        }

        tracing::info!(
            upload_id = %token,
            owner = %owner,
            file_name = %session.original_name,
            server_name = %server_name,
            total_size = total_size,
            "Created upload session"
        );

        self.audit(
            owner,
            AuditAction::UploadInitiated,
            &format!("{} (upload {})", session.original_name, token),
        )
        .await;

        Ok(InitiatedUpload { token, server_name })
    }

    /// Stage one chunk of an upload
    pub async fn upload_chunk(
        &self,
        token: &str,
        index: u32,
        total_chunks: u32,
        data: &[u8],
        owner: &str,
    ) -> Result<ChunkProgress, UploadError> {
        let _guard = self.inner.locks.lock(token).await;
        let mut session = self.load_owned(token, owner).await?;

        if session.status.is_terminal() {
            tracing::warn!(
                upload_id = %token,
                status = %session.status,
                "Chunk rejected for closed session"
            );
            return Err(UploadError::InvalidState(session.status));
        }

        if total_chunks == 0 {
            return Err(UploadError::InvalidRequest(
                "total chunks must be greater than zero".to_string(),
            ));
        }
        if data.is_empty() {
            return Err(UploadError::InvalidRequest("chunk must not be empty".to_string()));
        }

        let total = match session.total_chunks {
            None => total_chunks,
            Some(recorded) if recorded == total_chunks => recorded,
            Some(recorded) => {
                tracing::warn!(
                    upload_id = %token,
                    recorded = recorded,
                    claimed = total_chunks,
                    "Total chunk count changed mid-upload"
                );
                return Err(UploadError::TotalChunksMismatch {
                    recorded,
                    claimed: total_chunks,
                });
            }
        };

        if index >= total {
            return Err(UploadError::ChunkIndexOutOfBounds { index, total });
        }

        match self.inner.staging.write_chunk(&session.staging_dir, index, data).await {
            Ok(()) => {}
            Err(StagingError::PathViolation(path)) => {
                return Err(UploadError::PathViolation(path));
            }
            Err(e) => {
                tracing::error!(
                    upload_id = %token,
                    chunk_index = index,
                    error = %e,
                    "Failed to stage chunk"
                );
                self.fail(&mut session, SessionStatus::FailedChunkWrite).await;
                return Err(UploadError::ChunkWriteFailure {
                    index,
                    reason: e.to_string(),
                });
            }
        }

        session.total_chunks = Some(total);
        session.mark_chunk_uploaded(index);
        self.inner.store.update(&session).await?;

        let progress = session.progress();
        tracing::debug!(
            upload_id = %token,
            chunk_index = index,
            chunks_received = progress.received,
            total_chunks = progress.total,
            "Chunk uploaded"
        );

        Ok(progress)
    }

    /// Assemble all staged chunks into the committed artifact
    ///
    /// Repeating the call on a completed session returns the same server
    /// name without touching the file system.
    pub async fn finalize(
        &self,
        token: &str,
        owner: &str,
        client_file_name: Option<&str>,
    ) -> Result<String, UploadError> {
        let _guard = self.inner.locks.lock(token).await;
        let mut session = self.load_owned(token, owner).await?;

        match session.status {
            SessionStatus::InProgress => {}
            SessionStatus::Completed => {
                tracing::info!(
                    upload_id = %token,
                    server_name = %session.server_name,
                    "Repeated finalize for completed upload"
                );
                return Ok(session.server_name);
            }
            other => return Err(UploadError::InvalidState(other)),
        }

        if let Some(name) = client_file_name {
            if name != session.original_name {
                tracing::warn!(
                    upload_id = %token,
                    client_name = %name,
                    recorded_name = %session.original_name,
                    "Finalize name differs from recorded name, keeping recorded name"
                );
            }
        }

        let total = match session.total_chunks {
            Some(total) if session.all_chunks_uploaded() => total,
            _ => {
                tracing::debug!(
                    upload_id = %token,
                    missing = ?session.missing_chunks(),
                    "Finalize before all chunks arrived"
                );
                return Err(UploadError::IncompleteUpload {
                    received: session.uploaded_chunks.len(),
                    expected: session
                        .total_chunks
                        .map(|t| t.to_string())
                        .unwrap_or_else(|| "?".to_string()),
                });
            }
        };

        tracing::info!(
            upload_id = %token,
            file_name = %session.original_name,
            chunks = total,
            "Assembling file from chunks"
        );

        let committed = match self.assemble(&session, total).await {
            Ok(committed) => committed,
            Err(AssemblyFailure::MissingChunk(index)) => {
                tracing::error!(upload_id = %token, chunk_index = index, "Chunk missing during assembly");
                self.fail(&mut session, SessionStatus::FailedMissingChunk).await;
                return Err(UploadError::MissingChunkOnAssembly(index));
            }
            Err(AssemblyFailure::Io(reason)) => {
                tracing::error!(upload_id = %token, error = %reason, "Assembly failed");
                self.fail(&mut session, SessionStatus::FailedAssembly).await;
                return Err(UploadError::AssemblyIOFailure(reason));
            }
        };

        session.checksum = Some(committed.checksum.clone());
        session.transition(SessionStatus::Completed);
        self.inner.store.update(&session).await?;

        self.inner.staging.purge(&session.staging_dir).await;

        tracing::info!(
            upload_id = %token,
            owner = %owner,
            server_name = %session.server_name,
            size = committed.size,
            checksum = %committed.checksum,
            "Upload completed"
        );

        self.audit(
            owner,
            AuditAction::UploadCompleted,
            &format!("{} saved as {}", session.original_name, session.server_name),
        )
        .await;

        Ok(session.server_name)
    }

    /// Read-only snapshot of a session
    pub async fn status(&self, token: &str, owner: &str) -> Result<UploadSession, UploadError> {
        self.load_owned(token, owner).await
    }

    /// Abandon an in-progress upload and drop its staged chunks
    pub async fn cancel(&self, token: &str, owner: &str) -> Result<(), UploadError> {
        let _guard = self.inner.locks.lock(token).await;
        let mut session = self.load_owned(token, owner).await?;

        if session.status.is_terminal() {
            return Err(UploadError::InvalidState(session.status));
        }

        self.inner.staging.purge(&session.staging_dir).await;
        session.transition(SessionStatus::Cancelled);
        self.inner.store.update(&session).await?;

        tracing::info!(upload_id = %token, owner = %owner, "Upload session cancelled");

        self.audit(
            owner,
            AuditAction::UploadCancelled,
            &format!("{} (upload {})", session.original_name, token),
        )
        .await;

        Ok(())
    }

    // ========================================================================
    // Committed Artifacts
    // ========================================================================

    /// Locate a committed artifact for download
    pub async fn open_artifact(
        &self,
        file_name: &str,
        actor: &str,
    ) -> Result<(PathBuf, u64), UploadError> {
        let located = self.inner.artifacts.locate(file_name).await?;
        tracing::info!(actor = %actor, file_name = %file_name, "Attachment downloaded");
        Ok(located)
    }

    /// Delete a committed artifact together with its session record
    pub async fn delete_artifact(&self, server_name: &str, owner: &str) -> Result<(), UploadError> {
        let session = self
            .inner
            .store
            .find_by_server_name(server_name)
            .await?
            .filter(|s| s.owner == owner)
            .ok_or_else(|| UploadError::SessionNotFoundOrUnauthorized(server_name.to_string()))?;

        let _guard = self.inner.locks.lock(&session.token).await;

        if session.status != SessionStatus::Completed {
            return Err(UploadError::InvalidState(session.status));
        }

        let existed = self.inner.artifacts.delete(server_name).await?;
        if !existed {
            tracing::warn!(server_name = %server_name, "Artifact file already gone, removing record");
        }

        self.inner.staging.purge(&session.staging_dir).await;
        self.inner.store.delete(&session.token).await?;

        tracing::info!(
            upload_id = %session.token,
            owner = %owner,
            server_name = %server_name,
            "Attachment deleted"
        );

        self.audit(owner, AuditAction::FileDeleted, server_name).await;

        Ok(())
    }

    // ========================================================================
    // Helpers
    // ========================================================================

    /// Load a session that belongs to `owner`
    ///
    /// Unknown and foreign tokens produce the same error.
    async fn load_owned(&self, token: &str, owner: &str) -> Result<UploadSession, UploadError> {
        match self.inner.store.get(token).await? {
            Some(session) if session.owner == owner => Ok(session),
            Some(_) => {
                tracing::warn!(upload_id = %token, actor = %owner, "Access to foreign upload session");
                Err(UploadError::SessionNotFoundOrUnauthorized(token.to_string()))
            }
            None => Err(UploadError::SessionNotFoundOrUnauthorized(token.to_string())),
        }
    }

    async fn assemble(
        &self,
        session: &UploadSession,
        total: u32,
    ) -> Result<CommittedArtifact, AssemblyFailure> {
        let mut reader = self
            .inner
            .staging
            .read_chunks_in_order(&session.staging_dir, total)
            .map_err(|e| AssemblyFailure::Io(e.to_string()))?;

        let mut partial = self
            .inner
            .artifacts
            .begin(&session.server_name)
            .await
            .map_err(|e| AssemblyFailure::Io(e.to_string()))?;

        loop {
            let mut chunk = match reader.next_chunk().await {
                Ok(Some(chunk)) => chunk,
                Ok(None) => break,
                Err(e) => {
                    partial.abort().await;
                    return Err(match e {
                        StagingError::MissingChunk(index) => AssemblyFailure::MissingChunk(index),
                        other => AssemblyFailure::Io(other.to_string()),
                    });
                }
            };

            if let Err(e) = partial.append(&mut chunk).await {
                partial.abort().await;
                return Err(AssemblyFailure::Io(e.to_string()));
            }
        }

        partial
            .commit()
            .await
            .map_err(|e| AssemblyFailure::Io(e.to_string()))
    }

    /// Record a terminal failure; the caller reports the original error
    async fn fail(&self, session: &mut UploadSession, status: SessionStatus) {
        session.transition(status);
        if let Err(e) = self.inner.store.update(session).await {
            tracing::error!(
                upload_id = %session.token,
                status = %status,
                error = %e,
                "Failed to persist session failure"
            );
        }
    }

    async fn audit(&self, actor: &str, action: AuditAction, details: &str) {
        if let Err(e) = self.inner.audit.log_action(actor, action, details).await {
            tracing::warn!(actor = %actor, action = action.as_str(), error = %e, "Audit sink failed");
        }
    }
}

// ============================================================================
// Tests
// ============================================================================

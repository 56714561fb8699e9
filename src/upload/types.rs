//! Upload types for the chunked attachment protocol

use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::artifacts::ArtifactError;
use super::staging::StagingError;
use super::store::StoreError;

// ============================================================================
// Constants
// ============================================================================

/// Maximum declared file size: 500MB
pub const MAX_FILE_SIZE: u64 = 500 * 1024 * 1024;

/// Request body limit for one chunk: 16MB
pub const DEFAULT_MAX_CHUNK_SIZE: usize = 16 * 1024 * 1024;

// ============================================================================
// Session Types
// ============================================================================

/// Upload session state, one record per resumable upload
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadSession {
    /// Client-facing handle and primary key
    pub token: String,

    /// Sanitized file name as supplied by the client
    pub original_name: String,

    /// Generated name of the committed artifact
    pub server_name: String,

    /// Actor who opened the session
    pub owner: String,

    /// Declared size in bytes (informational)
    pub total_size: u64,

    /// Client-declared MIME type
    pub content_type: Option<String>,

    /// Fixed by the first chunk upload
    pub total_chunks: Option<u32>,

    /// Indices of chunks that have been staged
    pub uploaded_chunks: BTreeSet<u32>,

    /// Session directory name under the staging root
    pub staging_dir: String,

    pub status: SessionStatus,

    /// SHA-256 of the assembled artifact
    pub checksum: Option<String>,

    pub created_at: DateTime<Utc>,

    pub last_activity_at: DateTime<Utc>,
}

impl UploadSession {
    /// Check if every expected chunk has been staged
    pub fn all_chunks_uploaded(&self) -> bool {
        match self.total_chunks {
            Some(total) if total > 0 => self.uploaded_chunks.len() >= total as usize,
            _ => false,
        }
    }

    /// Indices in `[0, total_chunks)` that have not been staged yet
    pub fn missing_chunks(&self) -> Vec<u32> {
        let total = self.total_chunks.unwrap_or(0);
        (0..total)
            .filter(|i| !self.uploaded_chunks.contains(i))
            .collect()
    }

    /// Record a staged chunk; duplicates are ignored
    pub fn mark_chunk_uploaded(&mut self, index: u32) {
        self.uploaded_chunks.insert(index);
        self.last_activity_at = Utc::now();
    }

    /// Move to a terminal state
    pub fn transition(&mut self, status: SessionStatus) {
        debug_assert!(self.status == SessionStatus::InProgress);
        self.status = status;
        self.last_activity_at = Utc::now();
    }

    pub fn progress(&self) -> ChunkProgress {
        let total = self.total_chunks.unwrap_or(0);
        ChunkProgress {
            received: self.uploaded_chunks.len(),
            total,
            complete: self.all_chunks_uploaded(),
        }
    }
}

/// Session status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SessionStatus {
    /// Accepting chunks
    InProgress,
    /// Artifact assembled and committed
    Completed,
    /// A chunk could not be written to the staging area
    FailedChunkWrite,
    /// A chunk disappeared before assembly
    FailedMissingChunk,
    /// Writing the artifact failed
    FailedAssembly,
    /// Cancelled by the owner
    Cancelled,
}

impl SessionStatus {
    pub const FAILED: [SessionStatus; 3] = [
        SessionStatus::FailedChunkWrite,
        SessionStatus::FailedMissingChunk,
        SessionStatus::FailedAssembly,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::InProgress => "IN_PROGRESS",
            Self::Completed => "COMPLETED",
            Self::FailedChunkWrite => "FAILED_CHUNK_WRITE",
            Self::FailedMissingChunk => "FAILED_MISSING_CHUNK",
            Self::FailedAssembly => "FAILED_ASSEMBLY",
            Self::Cancelled => "CANCELLED",
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::InProgress)
    }
}

impl fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SessionStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "IN_PROGRESS" => Ok(Self::InProgress),
            "COMPLETED" => Ok(Self::Completed),
            "FAILED_CHUNK_WRITE" => Ok(Self::FailedChunkWrite),
            "FAILED_MISSING_CHUNK" => Ok(Self::FailedMissingChunk),
            "FAILED_ASSEMBLY" => Ok(Self::FailedAssembly),
            "CANCELLED" => Ok(Self::Cancelled),
            other => Err(format!("unknown session status: {}", other)),
        }
    }
}

/// Chunk counters returned after each accepted chunk
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ChunkProgress {
    pub received: usize,
    pub total: u32,
    pub complete: bool,
}

/// Result of a successful `initiate`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InitiatedUpload {
    pub token: String,
    pub server_name: String,
}

// ============================================================================
// Wire Types
// ============================================================================

/// Request to initiate a chunked upload
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InitiateRequest {
    pub file_name: String,

    pub total_size: u64,

    #[serde(default)]
    pub content_type: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InitiateResponse {
    pub upload_id: String,
    pub server_file_name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FinalizeResponse {
    pub message: String,
    pub file_name: String,
    pub upload_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionStatusResponse {
    pub upload_id: String,
    pub server_file_name: String,
    pub original_file_name: String,
    pub status: SessionStatus,
    pub uploaded_chunks: Vec<u32>,
    pub total_chunks: Option<u32>,
    pub total_size: u64,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub checksum: Option<String>,
}

impl From<UploadSession> for SessionStatusResponse {
    fn from(session: UploadSession) -> Self {
        Self {
            upload_id: session.token,
            server_file_name: session.server_name,
            original_file_name: session.original_name,
            status: session.status,
            uploaded_chunks: session.uploaded_chunks.into_iter().collect(),
            total_chunks: session.total_chunks,
            total_size: session.total_size,
            checksum: session.checksum,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CleanupResponse {
    pub message: String,
    pub upload_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeleteFileResponse {
    pub message: String,
    pub file_name: String,
}

// ============================================================================
// Error Types
// ============================================================================

/// Upload error types
#[derive(Debug, thiserror::Error)]
pub enum UploadError {
    #[error("Authentication required")]
    Unauthenticated,

    /// Unknown token and foreign token are deliberately indistinguishable
    #[error("Upload session not found or not owned by caller: {0}")]
    SessionNotFoundOrUnauthorized(String),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Path escapes storage root: {0}")]
    PathViolation(String),

    #[error("Total chunk count changed from {recorded} to {claimed}")]
    TotalChunksMismatch { recorded: u32, claimed: u32 },

    #[error("Chunk index out of bounds: {index} (total: {total})")]
    ChunkIndexOutOfBounds { index: u32, total: u32 },

    #[error("File too large: {size} bytes (max: {max})")]
    FileTooLarge { size: u64, max: u64 },

    #[error("Operation not allowed while session is {0}")]
    InvalidState(SessionStatus),

    #[error("Upload incomplete: {received} of {expected} chunks received")]
    IncompleteUpload { received: usize, expected: String },

    #[error("Attachment not found: {0}")]
    ArtifactNotFound(String),

    #[error("Failed to write chunk {index}: {reason}")]
    ChunkWriteFailure { index: u32, reason: String },

    #[error("Chunk {0} missing during assembly")]
    MissingChunkOnAssembly(u32),

    #[error("Assembly failed: {0}")]
    AssemblyIOFailure(String),

    #[error("Session store error: {0}")]
    Store(#[from] StoreError),

    #[error("Storage error: {0}")]
    Storage(String),
}

impl UploadError {
    /// Get HTTP status code for this error
    pub fn status_code(&self) -> axum::http::StatusCode {
        use axum::http::StatusCode;
        match self {
            Self::Unauthenticated => StatusCode::UNAUTHORIZED,
            Self::SessionNotFoundOrUnauthorized(_) => StatusCode::NOT_FOUND,
            Self::InvalidRequest(_) => StatusCode::BAD_REQUEST,
            Self::PathViolation(_) => StatusCode::BAD_REQUEST,
            Self::TotalChunksMismatch { .. } => StatusCode::BAD_REQUEST,
            Self::ChunkIndexOutOfBounds { .. } => StatusCode::BAD_REQUEST,
            Self::FileTooLarge { .. } => StatusCode::PAYLOAD_TOO_LARGE,
            Self::InvalidState(_) => StatusCode::CONFLICT,
            Self::IncompleteUpload { .. } => StatusCode::CONFLICT,
            Self::ArtifactNotFound(_) => StatusCode::NOT_FOUND,
            Self::ChunkWriteFailure { .. } => StatusCode::INTERNAL_SERVER_ERROR,
            Self::MissingChunkOnAssembly(_) => StatusCode::INTERNAL_SERVER_ERROR,
            Self::AssemblyIOFailure(_) => StatusCode::INTERNAL_SERVER_ERROR,
            Self::Store(_) => StatusCode::INTERNAL_SERVER_ERROR,
            Self::Storage(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Stable machine-readable error code
    pub fn code(&self) -> &'static str {
        match self {
            Self::Unauthenticated => "UNAUTHENTICATED",
            Self::SessionNotFoundOrUnauthorized(_) => "SESSION_NOT_FOUND",
            Self::InvalidRequest(_) => "INVALID_REQUEST",
            Self::PathViolation(_) => "PATH_VIOLATION",
            Self::TotalChunksMismatch { .. } => "TOTAL_CHUNKS_MISMATCH",
            Self::ChunkIndexOutOfBounds { .. } => "CHUNK_INDEX_OUT_OF_BOUNDS",
            Self::FileTooLarge { .. } => "FILE_TOO_LARGE",
            Self::InvalidState(_) => "INVALID_STATE",
            Self::IncompleteUpload { .. } => "INCOMPLETE_UPLOAD",
            Self::ArtifactNotFound(_) => "ARTIFACT_NOT_FOUND",
            Self::ChunkWriteFailure { .. } => "CHUNK_WRITE_FAILURE",
            Self::MissingChunkOnAssembly(_) => "MISSING_CHUNK",
            Self::AssemblyIOFailure(_) => "ASSEMBLY_FAILURE",
            Self::Store(_) => "STORE_ERROR",
            Self::Storage(_) => "STORAGE_ERROR",
        }
    }
}

impl From<StagingError> for UploadError {
    fn from(err: StagingError) -> Self {
        match err {
            StagingError::PathViolation(path) => Self::PathViolation(path),
            StagingError::MissingChunk(index) => Self::MissingChunkOnAssembly(index),
            StagingError::Io(e) => Self::Storage(e.to_string()),
        }
    }
}

impl From<ArtifactError> for UploadError {
    fn from(err: ArtifactError) -> Self {
        match err {
            ArtifactError::PathViolation(path) => Self::PathViolation(path),
            ArtifactError::NotFound(name) => Self::ArtifactNotFound(name),
            ArtifactError::Io(e) => Self::Storage(e.to_string()),
        }
    }
}

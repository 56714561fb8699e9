//! Chunk Staging Area
//!
//! Temporary storage for uploaded chunks before assembly. Each session owns
//! one directory under the staging root; each chunk is a file named by its
//! index.

use std::path::{Component, Path, PathBuf};
use std::time::SystemTime;

use tokio::fs;
use tokio::io::AsyncWriteExt;

/// Staging area errors
#[derive(Debug, thiserror::Error)]
pub enum StagingError {
    #[error("Path escapes staging root: {0}")]
    PathViolation(String),

    #[error("Chunk {0} is missing")]
    MissingChunk(u32),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Path-safe chunk storage rooted at a single directory
#[derive(Debug, Clone)]
pub struct StagingArea {
    root: PathBuf,
}

impl StagingArea {
    /// Open (and create if needed) the staging root
    pub async fn open(root: impl AsRef<Path>) -> Result<Self, StagingError> {
        fs::create_dir_all(root.as_ref()).await?;
        let root = fs::canonicalize(root.as_ref()).await?;
        tracing::info!(root = %root.display(), "Staging area ready");
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Create an empty directory for a session
    pub async fn allocate(&self, token: &str) -> Result<String, StagingError> {
        let dir = self.resolve(token)?;
        fs::create_dir_all(&dir).await?;
        tracing::debug!(upload_id = %token, dir = %dir.display(), "Allocated staging directory");
        Ok(token.to_string())
    }

    /// Write (or overwrite) the chunk with the given index
    ///
    /// Bytes land in a temporary sibling first and are renamed over the final
    /// name, so a failed write never replaces a previously staged chunk.
    pub async fn write_chunk(
        &self,
        staging_dir: &str,
        index: u32,
        data: &[u8],
    ) -> Result<(), StagingError> {
        let dir = self.resolve(staging_dir)?;
        fs::create_dir_all(&dir).await?;

        let final_path = dir.join(index.to_string());
        let temp_path = dir.join(format!("{}.part", index));

        let result = async {
            let mut file = fs::File::create(&temp_path).await?;
            file.write_all(data).await?;
            file.sync_data().await?;
            fs::rename(&temp_path, &final_path).await
        }
        .await;

        if let Err(e) = result {
            let _ = fs::remove_file(&temp_path).await;
            return Err(e.into());
        }

        Ok(())
    }

    /// Iterate the chunks `0..count` of a session in index order
    pub fn read_chunks_in_order(
        &self,
        staging_dir: &str,
        count: u32,
    ) -> Result<ChunkReader, StagingError> {
        let dir = self.resolve(staging_dir)?;
        Ok(ChunkReader {
            dir,
            next: 0,
            count,
        })
    }

    /// Best-effort recursive delete of a session directory
    ///
    /// Returns `false` when something could not be removed; the failure is
    /// logged, never raised.
    pub async fn purge(&self, staging_dir: &str) -> bool {
        let dir = match self.resolve(staging_dir) {
            Ok(dir) => dir,
            Err(e) => {
                tracing::warn!(staging_dir = %staging_dir, error = %e, "Refusing to purge staging directory");
                return false;
            }
        };

        match fs::remove_dir_all(&dir).await {
            Ok(()) => {
                tracing::debug!(dir = %dir.display(), "Purged staging directory");
                true
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => true,
            Err(e) => {
                tracing::warn!(dir = %dir.display(), error = %e, "Failed to purge staging directory");
                false
            }
        }
    }

    /// List session directories with their last modification time
    pub async fn list_dirs(&self) -> Result<Vec<(String, SystemTime)>, StagingError> {
        let mut dirs = Vec::new();
        let mut entries = fs::read_dir(&self.root).await?;

        while let Some(entry) = entries.next_entry().await? {
            let metadata = match entry.metadata().await {
                Ok(metadata) => metadata,
                Err(_) => continue,
            };
            if !metadata.is_dir() {
                continue;
            }
            if let Some(name) = entry.file_name().to_str() {
                let modified = metadata.modified().unwrap_or(SystemTime::UNIX_EPOCH);
                dirs.push((name.to_string(), modified));
            }
        }

        Ok(dirs)
    }

    /// Resolve a session directory name under the root
    ///
    /// Only a single normal path component is accepted, and an existing
    /// directory must canonicalize to a location inside the root (guards
    /// against symlinks planted in the staging area).
    fn resolve(&self, name: &str) -> Result<PathBuf, StagingError> {
        let mut components = Path::new(name).components();
        match (components.next(), components.next()) {
            (Some(Component::Normal(_)), None) => {}
            _ => return Err(StagingError::PathViolation(name.to_string())),
        }

        let path = self.root.join(name);
        if let Ok(canonical) = std::fs::canonicalize(&path) {
            if !canonical.starts_with(&self.root) {
                return Err(StagingError::PathViolation(name.to_string()));
            }
        }

        Ok(path)
    }
}

/// Ordered, lazily opened view over a session's chunks
#[derive(Debug)]
pub struct ChunkReader {
    dir: PathBuf,
    next: u32,
    count: u32,
}

impl ChunkReader {
    /// Open the next chunk, or `None` once all `count` chunks were produced
    pub async fn next_chunk(&mut self) -> Result<Option<fs::File>, StagingError> {
        if self.next >= self.count {
            return Ok(None);
        }

        let index = self.next;
        match fs::File::open(self.dir.join(index.to_string())).await {
            Ok(file) => {
                self.next += 1;
                Ok(Some(file))
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(StagingError::MissingChunk(index))
            }
            Err(e) => Err(e.into()),
        }
    }
}

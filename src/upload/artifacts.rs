//! Artifact Store
//!
//! Destination root for committed attachments. Files are assembled under a
//! hidden partial name and renamed into place, so readers only ever see
//! complete artifacts.

use std::path::{Component, Path, PathBuf};

use sha2::{Digest, Sha256};
use tokio::fs;
use tokio::io::{AsyncReadExt, AsyncWriteExt, BufWriter};

/// Artifact store errors
#[derive(Debug, thiserror::Error)]
pub enum ArtifactError {
    #[error("Path escapes artifact root: {0}")]
    PathViolation(String),

    #[error("Artifact not found: {0}")]
    NotFound(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Metadata of a committed artifact
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommittedArtifact {
    pub path: PathBuf,
    pub size: u64,
    /// Hex-encoded SHA-256 of the content
    pub checksum: String,
}

/// Committed attachment storage
#[derive(Debug, Clone)]
pub struct ArtifactStore {
    root: PathBuf,
}

impl ArtifactStore {
    /// Open (and create if needed) the artifact root
    pub async fn open(root: impl AsRef<Path>) -> Result<Self, ArtifactError> {
        fs::create_dir_all(root.as_ref()).await?;
        let root = fs::canonicalize(root.as_ref()).await?;
        tracing::info!(root = %root.display(), "Artifact store ready");
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Start writing a new artifact
    pub async fn begin(&self, server_name: &str) -> Result<PartialArtifact, ArtifactError> {
        let final_path = self.resolve(server_name)?;
        let temp_path = self.root.join(format!(".{}.partial", server_name));

        let file = fs::File::create(&temp_path).await?;

        Ok(PartialArtifact {
            temp_path,
            final_path,
            writer: BufWriter::new(file),
            hasher: Sha256::new(),
            size: 0,
        })
    }

    /// Locate a committed artifact, returning its path and size
    pub async fn locate(&self, name: &str) -> Result<(PathBuf, u64), ArtifactError> {
        let path = self.resolve(name)?;
        match fs::metadata(&path).await {
            Ok(metadata) if metadata.is_file() => Ok((path, metadata.len())),
            Ok(_) => Err(ArtifactError::NotFound(name.to_string())),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(ArtifactError::NotFound(name.to_string()))
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Delete a committed artifact; `Ok(false)` if it did not exist
    pub async fn delete(&self, name: &str) -> Result<bool, ArtifactError> {
        let path = self.resolve(name)?;
        match fs::remove_file(&path).await {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    /// Resolve an artifact name under the root
    ///
    /// Hidden names are refused so in-flight partial files cannot be
    /// addressed.
    fn resolve(&self, name: &str) -> Result<PathBuf, ArtifactError> {
        let mut components = Path::new(name).components();
        let single = matches!(
            (components.next(), components.next()),
            (Some(Component::Normal(_)), None)
        );
        if !single || name.starts_with('.') || name.contains('\\') {
            return Err(ArtifactError::PathViolation(name.to_string()));
        }

        let path = self.root.join(name);
        if let Ok(canonical) = std::fs::canonicalize(&path) {
            if !canonical.starts_with(&self.root) {
                return Err(ArtifactError::PathViolation(name.to_string()));
            }
        }

        Ok(path)
    }
}

/// An artifact being assembled
#[derive(Debug)]
pub struct PartialArtifact {
    temp_path: PathBuf,
    final_path: PathBuf,
    writer: BufWriter<fs::File>,
    hasher: Sha256,
    size: u64,
}

impl PartialArtifact {
    /// Stream a reader to the end of the artifact
    pub async fn append<R>(&mut self, reader: &mut R) -> std::io::Result<u64>
    where
        R: tokio::io::AsyncRead + Unpin,
    {
        let mut buf = vec![0u8; 64 * 1024];
        let mut copied = 0u64;

        loop {
            let n = reader.read(&mut buf).await?;
            if n == 0 {
                break;
            }
            self.writer.write_all(&buf[..n]).await?;
            self.hasher.update(&buf[..n]);
            copied += n as u64;
        }

        self.size += copied;
        Ok(copied)
    }

    /// Flush and atomically move the artifact into place
    ///
    /// On failure the partial file is removed.
    pub async fn commit(mut self) -> std::io::Result<CommittedArtifact> {
        if let Err(e) = self.finish().await {
            let _ = fs::remove_file(&self.temp_path).await;
            return Err(e);
        }

        Ok(CommittedArtifact {
            path: self.final_path,
            size: self.size,
            checksum: hex::encode(self.hasher.finalize()),
        })
    }

    async fn finish(&mut self) -> std::io::Result<()> {
        self.writer.flush().await?;
        self.writer.get_ref().sync_all().await?;
        fs::rename(&self.temp_path, &self.final_path).await
    }

    /// Drop the partial file
    pub async fn abort(self) {
        let temp_path = self.temp_path;
        drop(self.writer);
        if let Err(e) = fs::remove_file(&temp_path).await {
            if e.kind() != std::io::ErrorKind::NotFound {
                tracing::warn!(path = %temp_path.display(), error = %e, "Failed to remove partial artifact");
            }
        }
    }
}

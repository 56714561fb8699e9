//! Chunked Attachment Upload Module
//!
//! Resumable uploads for contract attachments:
//! - Chunks arrive in any order, may be retried, and are staged on disk
//! - Finalize assembles them exactly once into a committed artifact
//! - A background reaper reclaims abandoned and failed sessions
//!
//! Protocol Flow:
//! 1. Client initiates with file name and size, receives an upload id
//! 2. Client uploads chunks (index + total count) under that id
//! 3. Client finalizes; the server assembles and returns the stored name
//! 4. Client may poll status or cancel at any point before finalize

pub mod artifacts;
pub mod coordinator;
pub mod locks;
pub mod naming;
pub mod reaper;
pub mod staging;
pub mod store;
pub mod types;

pub use artifacts::{ArtifactError, ArtifactStore, CommittedArtifact};
pub use coordinator::UploadCoordinator;
pub use locks::TokenLocks;
pub use reaper::{SessionReaper, SweepReport};
pub use staging::{StagingArea, StagingError};
pub use store::{MemorySessionStore, SessionStore, SqliteSessionStore, StoreError};
pub use types::*;

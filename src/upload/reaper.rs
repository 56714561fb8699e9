//! Session Reaper
//!
//! Periodically removes abandoned and failed upload sessions together with
//! their staged chunks, then purges staging directories no record points to.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use super::locks::TokenLocks;
use super::staging::StagingArea;
use super::store::{SessionStore, StoreError};
use super::types::{SessionStatus, UploadSession};
use crate::config::ReaperConfig;

/// Outcome counters of one sweep
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepReport {
    /// Session records deleted
    pub reaped: usize,
    /// Records deleted although their staging directory could not be purged
    pub purge_failures: usize,
    /// Candidates that changed under the lock and were left alone
    pub skipped: usize,
    /// Staging directories without a record that were purged
    pub orphans_purged: usize,
    /// Store or file system errors that aborted part of the sweep
    pub errors: usize,
}

pub struct SessionReaper {
    store: Arc<dyn SessionStore>,
    staging: StagingArea,
    locks: TokenLocks,
    config: ReaperConfig,
}

impl SessionReaper {
    pub fn new(
        store: Arc<dyn SessionStore>,
        staging: StagingArea,
        locks: TokenLocks,
        config: ReaperConfig,
    ) -> Self {
        Self {
            store,
            staging,
            locks,
            config,
        }
    }

    /// Run one cleanup pass
    pub async fn sweep(&self) -> SweepReport {
        let mut report = SweepReport::default();

        let mut buckets = vec![(SessionStatus::InProgress, self.config.in_progress_ttl)];
        buckets.extend(SessionStatus::FAILED.iter().map(|s| (*s, self.config.failed_ttl)));
        if let Some(ttl) = self.config.terminal_ttl {
            buckets.push((SessionStatus::Completed, ttl));
            buckets.push((SessionStatus::Cancelled, ttl));
        }

        for (status, ttl) in buckets {
            let Some(cutoff) = cutoff(ttl) else {
                continue;
            };
            match self.store.find_stale(status, cutoff).await {
                Ok(candidates) => {
                    for candidate in candidates {
                        self.reap(candidate, cutoff, &mut report).await;
                    }
                }
                Err(e) => {
                    tracing::error!(status = %status, error = %e, "Failed to query stale sessions");
                    report.errors += 1;
                }
            }
        }

        self.sweep_orphans(&mut report).await;

        if report != SweepReport::default() {
            tracing::info!(
                reaped = report.reaped,
                purge_failures = report.purge_failures,
                skipped = report.skipped,
                orphans_purged = report.orphans_purged,
                errors = report.errors,
                "Upload session sweep finished"
            );
        }

        report
    }

    /// Start the background sweep loop
    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(self.config.interval);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                interval.tick().await;
                self.sweep().await;
            }
        })
    }

    async fn reap(&self, candidate: UploadSession, cutoff: DateTime<Utc>, report: &mut SweepReport) {
        let _guard = self.locks.lock(&candidate.token).await;

        // A chunk or finalize may have landed between the query and the lock
        let session = match self.store.get(&candidate.token).await {
            Ok(Some(session))
                if session.status == candidate.status && session.last_activity_at < cutoff =>
            {
                session
            }
            Ok(_) => {
                report.skipped += 1;
                return;
            }
            Err(e) => {
                tracing::error!(upload_id = %candidate.token, error = %e, "Failed to reload session");
                report.errors += 1;
                return;
            }
        };

        if !self.staging.purge(&session.staging_dir).await {
            tracing::warn!(
                upload_id = %session.token,
                staging_dir = %session.staging_dir,
                "Staging directory left behind, orphan sweep will retry"
            );
            report.purge_failures += 1;
        }

        match self.store.delete(&session.token).await {
            Ok(_) => {
                tracing::debug!(
                    upload_id = %session.token,
                    status = %session.status,
                    last_activity_at = %session.last_activity_at,
                    "Reaped upload session"
                );
                report.reaped += 1;
            }
            Err(e) => {
                tracing::error!(upload_id = %session.token, error = %e, "Failed to delete session record");
                report.errors += 1;
            }
        }
    }

    async fn sweep_orphans(&self, report: &mut SweepReport) {
        let dirs = match self.staging.list_dirs().await {
            Ok(dirs) => dirs,
            Err(e) => {
                tracing::error!(error = %e, "Failed to list staging directories");
                report.errors += 1;
                return;
            }
        };

        for (name, modified) in dirs {
            let old_enough = modified
                .elapsed()
                .map(|age| age > self.config.failed_ttl)
                .unwrap_or(false);
            if !old_enough {
                continue;
            }

            match self.has_record(&name).await {
                Ok(true) => {}
                Ok(false) => {
                    if self.staging.purge(&name).await {
                        tracing::info!(staging_dir = %name, "Purged orphaned staging directory");
                        report.orphans_purged += 1;
                    }
                }
                Err(e) => {
                    tracing::error!(staging_dir = %name, error = %e, "Failed to check staging owner");
                    report.errors += 1;
                }
            }
        }
    }

    /// Staging directories are named after their session token
    async fn has_record(&self, staging_dir: &str) -> Result<bool, StoreError> {
        let _guard = self.locks.lock(staging_dir).await;
        Ok(self.store.get(staging_dir).await?.is_some())
    }
}

fn cutoff(ttl: Duration) -> Option<DateTime<Utc>> {
    let ttl = chrono::Duration::from_std(ttl).ok()?;
    Utc::now().checked_sub_signed(ttl)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::upload::store::MemorySessionStore;
    use tempfile::TempDir;

    const HOUR: Duration = Duration::from_secs(60 * 60);

    fn config() -> ReaperConfig {
        ReaperConfig {
            interval: HOUR,
            in_progress_ttl: 24 * HOUR,
            failed_ttl: 6 * HOUR,
            terminal_ttl: None,
        }
    }

    struct Fixture {
        _temp_dir: TempDir,
        store: Arc<MemorySessionStore>,
        staging: StagingArea,
    }

    impl Fixture {
        async fn new() -> Self {
            let temp_dir = TempDir::new().unwrap();
            let staging = StagingArea::open(temp_dir.path()).await.unwrap();
            Self {
                _temp_dir: temp_dir,
                store: Arc::new(MemorySessionStore::new()),
                staging,
            }
        }

        fn reaper(&self, config: ReaperConfig) -> SessionReaper {
            SessionReaper::new(self.store.clone(), self.staging.clone(), TokenLocks::new(), config)
        }

        async fn session(&self, token: &str, status: SessionStatus, idle_hours: i64) {
            let staging_dir = self.staging.allocate(token).await.unwrap();
            self.staging.write_chunk(&staging_dir, 0, b"chunk").await.unwrap();

            let at = Utc::now() - chrono::Duration::hours(idle_hours);
            let session = UploadSession {
                token: token.to_string(),
                original_name: "a.pdf".to_string(),
                server_name: format!("a_{}.pdf", token),
                owner: "alice".to_string(),
                total_size: 5,
                content_type: None,
                total_chunks: Some(1),
                uploaded_chunks: [0].into_iter().collect(),
                staging_dir,
                status,
                checksum: None,
                created_at: at,
                last_activity_at: at,
            };
            self.store.create(&session).await.unwrap();
        }

        async fn exists(&self, token: &str) -> bool {
            self.store.get(token).await.unwrap().is_some()
        }
    }

    #[tokio::test]
    async fn test_thresholds_per_status() {
        let f = Fixture::new().await;
        f.session("stale", SessionStatus::InProgress, 25).await;
        f.session("active", SessionStatus::InProgress, 23).await;
        f.session("failed-old", SessionStatus::FailedAssembly, 7).await;
        f.session("failed-new", SessionStatus::FailedMissingChunk, 5).await;
        f.session("write-old", SessionStatus::FailedChunkWrite, 7).await;
        f.session("done", SessionStatus::Completed, 100).await;
        f.session("cancelled", SessionStatus::Cancelled, 100).await;

        let report = f.reaper(config()).sweep().await;
        assert_eq!(report.reaped, 3);

        assert!(!f.exists("stale").await);
        assert!(f.exists("active").await);
        assert!(!f.exists("failed-old").await);
        assert!(f.exists("failed-new").await);
        assert!(!f.exists("write-old").await);
        assert!(f.exists("done").await);
        assert!(f.exists("cancelled").await);

        assert!(!f.staging.root().join("stale").exists());
        assert!(f.staging.root().join("active").exists());
    }

    #[tokio::test]
    async fn test_terminal_ttl_reaps_finished_records() {
        let f = Fixture::new().await;
        f.session("done", SessionStatus::Completed, 100).await;
        f.session("recent", SessionStatus::Completed, 1).await;
        f.session("cancelled", SessionStatus::Cancelled, 100).await;

        let report = f
            .reaper(ReaperConfig {
                terminal_ttl: Some(48 * HOUR),
                ..config()
            })
            .sweep()
            .await;

        assert_eq!(report.reaped, 2);
        assert!(!f.exists("done").await);
        assert!(f.exists("recent").await);
        assert!(!f.exists("cancelled").await);
    }

    #[tokio::test]
    async fn test_record_deleted_when_purge_fails() {
        let f = Fixture::new().await;
        f.session("bad-dir", SessionStatus::InProgress, 30).await;

        // Point the record at a name the staging area refuses to touch
        let mut session = f.store.get("bad-dir").await.unwrap().unwrap();
        session.staging_dir = "../outside".to_string();
        f.store.update(&session).await.unwrap();

        let report = f.reaper(config()).sweep().await;
        assert_eq!(report.reaped, 1);
        assert_eq!(report.purge_failures, 1);
        assert!(!f.exists("bad-dir").await);
    }

    #[tokio::test]
    async fn test_orphan_directories_are_purged() {
        let f = Fixture::new().await;
        f.session("tracked", SessionStatus::FailedAssembly, 0).await;
        f.staging.allocate("orphan").await.unwrap();

        tokio::time::sleep(Duration::from_millis(20)).await;

        let report = f
            .reaper(ReaperConfig {
                failed_ttl: Duration::from_millis(10),
                in_progress_ttl: HOUR,
                ..config()
            })
            .sweep()
            .await;

        assert_eq!(report.orphans_purged, 1);
        assert!(!f.staging.root().join("orphan").exists());
        // The tracked session goes through the failed bucket instead
        assert_eq!(report.reaped, 1);
        assert!(!f.staging.root().join("tracked").exists());
    }

    #[tokio::test]
    async fn test_fresh_orphans_are_kept() {
        let f = Fixture::new().await;
        f.staging.allocate("just-created").await.unwrap();

        let report = f.reaper(config()).sweep().await;
        assert_eq!(report.orphans_purged, 0);
        assert!(f.staging.root().join("just-created").exists());
    }

    #[tokio::test]
    async fn test_sweep_skips_session_touched_after_query() {
        let f = Fixture::new().await;
        f.session("busy", SessionStatus::InProgress, 30).await;
        let reaper = f.reaper(config());

        let candidate = f.store.get("busy").await.unwrap().unwrap();
        let mut touched = candidate.clone();
        touched.mark_chunk_uploaded(0);
        f.store.update(&touched).await.unwrap();

        let mut report = SweepReport::default();
        let threshold = cutoff(reaper.config.in_progress_ttl).unwrap();
        reaper.reap(candidate, threshold, &mut report).await;

        assert_eq!(report.skipped, 1);
        assert!(f.exists("busy").await);
    }
}

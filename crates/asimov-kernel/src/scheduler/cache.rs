//! On-disk job-table cache
//!
//! The cache file holds `{updated, jobs}`. A read within the TTL is served
//! from disk; anything older triggers a fresh query. Submissions and
//! removals invalidate the cache so the next read sees them.

use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::{Accounting, ClusterId, JobDescription, JobTable, Scheduler};
use crate::error::SchedulerError;

#[derive(Debug, Serialize, Deserialize)]
struct CacheDocument {
    updated: DateTime<Utc>,
    jobs: JobTable,
}

/// Wraps a scheduler with a TTL-bounded job-table cache
#[derive(Debug)]
pub struct CachedScheduler<S> {
    inner: S,
    path: PathBuf,
    ttl: Duration,
}

impl<S: Scheduler> CachedScheduler<S> {
    /// Cache `inner`'s job table at `path` for `ttl`
    #[must_use]
    pub fn new(inner: S, path: impl Into<PathBuf>, ttl: Duration) -> Self {
        Self {
            inner,
            path: path.into(),
            ttl,
        }
    }

    /// Cache file location
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// The wrapped scheduler
    #[must_use]
    pub fn inner(&self) -> &S {
        &self.inner
    }

    async fn read_fresh(&self) -> Option<JobTable> {
        let text = tokio::fs::read_to_string(&self.path).await.ok()?;
        let doc: CacheDocument = match serde_yaml::from_str(&text) {
            Ok(doc) => doc,
            Err(e) => {
                tracing::warn!("Ignoring unreadable job cache {}: {}", self.path.display(), e);
                return None;
            }
        };
        let ttl = chrono::Duration::from_std(self.ttl).ok()?;
        if Utc::now() - doc.updated < ttl {
            tracing::debug!("Job table served from cache ({} jobs)", doc.jobs.len());
            Some(doc.jobs)
        } else {
            None
        }
    }

    async fn write(&self, jobs: &JobTable) {
        let doc = CacheDocument {
            updated: Utc::now(),
            jobs: jobs.clone(),
        };
        let result = async {
            let text = serde_yaml::to_string(&doc)
                .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
            if let Some(parent) = self.path.parent() {
                tokio::fs::create_dir_all(parent).await?;
            }
            tokio::fs::write(&self.path, text).await
        }
        .await;
        if let Err(e) = result {
            tracing::warn!("Could not write job cache {}: {}", self.path.display(), e);
        }
    }

    /// Drop the cached table
    pub async fn invalidate(&self) {
        match tokio::fs::remove_file(&self.path).await {
            Ok(()) => tracing::debug!("Invalidated job cache"),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => tracing::warn!("Could not remove job cache {}: {}", self.path.display(), e),
        }
    }
}

#[async_trait]
impl<S: Scheduler> Scheduler for CachedScheduler<S> {
    async fn submit(&self, description: &JobDescription) -> Result<ClusterId, SchedulerError> {
        let id = self.inner.submit(description).await?;
        self.invalidate().await;
        Ok(id)
    }

    async fn list_jobs(&self) -> Result<JobTable, SchedulerError> {
        match self.read_fresh().await {
            Some(jobs) => Ok(jobs),
            None => self.refresh_jobs().await,
        }
    }

    async fn refresh_jobs(&self) -> Result<JobTable, SchedulerError> {
        let jobs = self.inner.refresh_jobs().await?;
        self.write(&jobs).await;
        Ok(jobs)
    }

    async fn remove(&self, id: ClusterId) -> Result<(), SchedulerError> {
        self.inner.remove(id).await?;
        self.invalidate().await;
        Ok(())
    }

    async fn accounting(&self, id: ClusterId) -> Result<Accounting, SchedulerError> {
        self.inner.accounting(id).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scheduler::{JobInfo, JobStatus};
    use std::sync::atomic::{AtomicU64, Ordering};

    #[derive(Debug, Default)]
    struct CountingScheduler {
        queries: AtomicU64,
    }

    #[async_trait]
    impl Scheduler for CountingScheduler {
        async fn submit(&self, _description: &JobDescription) -> Result<ClusterId, SchedulerError> {
            Ok(ClusterId(1))
        }

        async fn list_jobs(&self) -> Result<JobTable, SchedulerError> {
            let n = self.queries.fetch_add(1, Ordering::SeqCst) + 1;
            let mut table = JobTable::new();
            table.insert(JobInfo::new(ClusterId(n), JobStatus::Running));
            Ok(table)
        }

        async fn remove(&self, _id: ClusterId) -> Result<(), SchedulerError> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_fresh_cache_is_reused() {
        let dir = tempfile::tempdir().unwrap();
        let cached = CachedScheduler::new(
            CountingScheduler::default(),
            dir.path().join(".asimov/_cache_jobs.yaml"),
            Duration::from_secs(900),
        );

        let first = cached.list_jobs().await.unwrap();
        let second = cached.list_jobs().await.unwrap();
        assert_eq!(first, second);
        assert_eq!(cached.inner().queries.load(Ordering::SeqCst), 1);
        assert!(cached.path().exists());
    }

    #[tokio::test]
    async fn test_expired_cache_is_refreshed() {
        let dir = tempfile::tempdir().unwrap();
        let cached = CachedScheduler::new(
            CountingScheduler::default(),
            dir.path().join("cache.yaml"),
            Duration::ZERO,
        );

        cached.list_jobs().await.unwrap();
        let second = cached.list_jobs().await.unwrap();
        assert!(second.contains(ClusterId(2)));
    }

    #[tokio::test]
    async fn test_submit_invalidates() {
        let dir = tempfile::tempdir().unwrap();
        let cached = CachedScheduler::new(
            CountingScheduler::default(),
            dir.path().join("cache.yaml"),
            Duration::from_secs(900),
        );

        cached.list_jobs().await.unwrap();
        cached.submit(&JobDescription::new("true")).await.unwrap();
        assert!(!cached.path().exists());
        cached.list_jobs().await.unwrap();
        assert_eq!(cached.inner().queries.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_refresh_bypasses_cache() {
        let dir = tempfile::tempdir().unwrap();
        let cached = CachedScheduler::new(
            CountingScheduler::default(),
            dir.path().join("cache.yaml"),
            Duration::from_secs(900),
        );

        cached.list_jobs().await.unwrap();
        let refreshed = cached.refresh_jobs().await.unwrap();
        assert!(refreshed.contains(ClusterId(2)));
    }
}

//! Job Registry
//!
//! Owns every live job, indexed by job id and by non-empty request id, and
//! evicts terminal jobs once they outlive the configured TTL. Eviction is
//! driven by [`JobRegistry::sweep`], which callers invoke on every boundary
//! operation; the sweep rate-limits itself through `last_sweep`.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use crate::engine::SqlEngine;
use crate::job::{Job, QueryStatus};

/// Job counts by bucket
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RegistryMetrics {
    pub queued: usize,
    pub running: usize,
    /// Terminal jobs still retained
    pub completed: usize,
    pub stored: usize,
    pub evicted: u64,
}

#[derive(Default)]
struct RegistryInner {
    jobs: HashMap<String, Arc<Job>>,
    /// request id -> job id, non-empty request ids only
    by_request: HashMap<String, String>,
    last_sweep: Option<DateTime<Utc>>,
}

impl RegistryInner {
    fn insert(&mut self, job: Arc<Job>) {
        if !job.request_id().is_empty() {
            self.by_request
                .insert(job.request_id().to_string(), job.id().to_string());
        }
        self.jobs.insert(job.id().to_string(), job);
    }

    fn remove(&mut self, id: &str) -> Option<Arc<Job>> {
        let job = self.jobs.remove(id)?;
        let owns_request = self
            .by_request
            .get(job.request_id())
            .map(|owner| owner == id)
            .unwrap_or(false);
        if owns_request {
            self.by_request.remove(job.request_id());
        }
        Some(job)
    }
}

/// Thread-safe job storage
pub struct JobRegistry {
    inner: RwLock<RegistryInner>,
    ttl: Duration,
    sweep_interval: Duration,
    evicted: AtomicU64,
    engine: Arc<dyn SqlEngine>,
}

impl JobRegistry {
    pub fn new(engine: Arc<dyn SqlEngine>, ttl: Duration, sweep_interval: Duration) -> Self {
        Self {
            inner: RwLock::new(RegistryInner::default()),
            ttl,
            sweep_interval,
            evicted: AtomicU64::new(0),
            engine,
        }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Insert or overwrite by id
    pub async fn put(&self, job: Arc<Job>) {
        self.inner.write().await.insert(job);
    }

    pub async fn get(&self, id: &str) -> Option<Arc<Job>> {
        self.inner.read().await.jobs.get(id).cloned()
    }

    pub async fn get_by_request_id(&self, request_id: &str) -> Option<Arc<Job>> {
        if request_id.is_empty() {
            return None;
        }
        let inner = self.inner.read().await;
        inner
            .by_request
            .get(request_id)
            .and_then(|id| inner.jobs.get(id))
            .cloned()
    }

    /// Return the live job owning `request_id`, or register the one built by
    /// `make`. The lookup and insert happen under one write lock, so racing
    /// submissions with the same request id create at most one job.
    ///
    /// The flag is true when a new job was inserted.
    pub async fn get_or_insert_with<F>(&self, request_id: &str, make: F) -> (Arc<Job>, bool)
    where
        F: FnOnce() -> Job,
    {
        let mut inner = self.inner.write().await;
        if !request_id.is_empty() {
            let existing = inner
                .by_request
                .get(request_id)
                .and_then(|id| inner.jobs.get(id))
                .cloned();
            if let Some(job) = existing {
                return (job, false);
            }
        }

        let job = Arc::new(make());
        inner.insert(job.clone());
        (job, true)
    }

    /// Delete from both indices
    pub async fn remove(&self, id: &str) -> Option<Arc<Job>> {
        self.inner.write().await.remove(id)
    }

    pub async fn len(&self) -> usize {
        self.inner.read().await.jobs.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Release the job's scratch storage, if it still holds any.
    ///
    /// Failures are logged and swallowed; the job is considered released
    /// either way.
    pub async fn release_storage(&self, job: &Job) {
        let Some(scratch) = job.take_storage() else {
            return;
        };

        let engine = self.engine.clone();
        let target = scratch.clone();
        match tokio::task::spawn_blocking(move || engine.release(&target)).await {
            Ok(Ok(())) => debug!(query_id = %job.id(), scratch = %scratch, "Released result storage"),
            Ok(Err(e)) => warn!(
                query_id = %job.id(),
                scratch = %scratch,
                error = %e,
                "Failed to release result storage"
            ),
            Err(e) => warn!(query_id = %job.id(), error = %e, "Storage release task failed"),
        }
    }

    /// Evict terminal jobs at least `ttl` old, at most once per sweep interval.
    ///
    /// Returns the number of jobs evicted.
    pub async fn sweep(&self, now: DateTime<Utc>) -> usize {
        let expired: Vec<Arc<Job>> = {
            let mut inner = self.inner.write().await;
            if let Some(last) = inner.last_sweep {
                let too_soon = now
                    .signed_duration_since(last)
                    .to_std()
                    .map(|elapsed| elapsed < self.sweep_interval)
                    .unwrap_or(true);
                if too_soon {
                    return 0;
                }
            }
            inner.last_sweep = Some(now);
            inner
                .jobs
                .values()
                .filter(|job| job.is_expired(now, self.ttl))
                .cloned()
                .collect()
        };

        if expired.is_empty() {
            return 0;
        }

        for job in &expired {
            self.release_storage(job).await;
        }

        let mut evicted = 0;
        {
            let mut inner = self.inner.write().await;
            for job in &expired {
                if inner.remove(job.id()).is_some() {
                    evicted += 1;
                }
            }
        }

        self.evicted.fetch_add(evicted as u64, Ordering::Relaxed);
        info!(evicted, "Evicted expired query jobs");
        evicted
    }

    pub async fn metrics(&self) -> RegistryMetrics {
        let inner = self.inner.read().await;
        let mut metrics = RegistryMetrics {
            stored: inner.jobs.len(),
            evicted: self.evicted.load(Ordering::Relaxed),
            ..Default::default()
        };
        for job in inner.jobs.values() {
            match job.status() {
                QueryStatus::Queued => metrics.queued += 1,
                QueryStatus::Running => metrics.running += 1,
                _ => metrics.completed += 1,
            }
        }
        metrics
    }
}

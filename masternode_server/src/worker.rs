//! Background caching of origin responses
//!
//! Proxied bodies for unknown routes are handed to a bounded queue and hashed
//! off the request path. Every job reports a `CacheOutcome` to a sink task
//! that logs it and keeps the counters shown on `/health`.

use crate::cache::{CacheError, ContentCache};
use bytes::Bytes;
use serde::Serialize;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};

/// A proxied body waiting to be cached
#[derive(Debug)]
pub struct CacheJob {
    pub host: String,
    pub path: String,
    pub body: Bytes,
}

#[derive(Debug, thiserror::Error)]
pub enum CacheJobError {
    #[error(transparent)]
    Cache(#[from] CacheError),

    #[error("Failed to write cached body: {0}")]
    Write(#[from] std::io::Error),
}

/// Result of one caching job
#[derive(Debug)]
pub struct CacheOutcome {
    pub host: String,
    pub path: String,
    /// Content hash on success
    pub result: Result<String, CacheJobError>,
}

#[derive(Debug, Default)]
pub struct CacheStats {
    cached: AtomicU64,
    failed: AtomicU64,
    dropped: AtomicU64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct CacheStatsSnapshot {
    pub cached: u64,
    pub failed: u64,
    pub dropped: u64,
}

impl CacheStats {
    pub fn snapshot(&self) -> CacheStatsSnapshot {
        CacheStatsSnapshot {
            cached: self.cached.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
        }
    }
}

/// Handle to the caching worker pool
#[derive(Debug, Clone)]
pub struct CacheWorkers {
    job_tx: mpsc::Sender<CacheJob>,
    stats: Arc<CacheStats>,
}

impl CacheWorkers {
    /// Start `workers` tasks draining a queue of at most `queue` jobs
    pub fn spawn(
        cache: Arc<ContentCache>,
        workers: usize,
        queue: usize,
        directory: Option<PathBuf>,
    ) -> Self {
        let (job_tx, job_rx) = mpsc::channel::<CacheJob>(queue);
        let (outcome_tx, outcome_rx) = mpsc::channel::<CacheOutcome>(queue);
        let job_rx = Arc::new(Mutex::new(job_rx));
        let directory = directory.map(Arc::new);
        let stats = Arc::new(CacheStats::default());

        for id in 0..workers {
            let cache = cache.clone();
            let job_rx = job_rx.clone();
            let outcome_tx = outcome_tx.clone();
            let directory = directory.clone();

            tokio::spawn(async move {
                loop {
                    let job = job_rx.lock().await.recv().await;
                    let Some(job) = job else { break };

                    let result = run_job(&cache, directory.as_deref(), &job).await;
                    let outcome = CacheOutcome {
                        host: job.host,
                        path: job.path,
                        result,
                    };
                    if outcome_tx.send(outcome).await.is_err() {
                        break;
                    }
                }
                tracing::debug!("Cache worker {} stopped", id);
            });
        }

        tokio::spawn(record_outcomes(outcome_rx, stats.clone()));

        Self { job_tx, stats }
    }

    /// Queue a job without waiting; returns false when it was dropped
    pub fn enqueue(&self, job: CacheJob) -> bool {
        match self.job_tx.try_send(job) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(job)) => {
                tracing::warn!("Cache queue full, dropping {}{}", job.host, job.path);
                self.stats.dropped.fetch_add(1, Ordering::Relaxed);
                false
            }
            Err(mpsc::error::TrySendError::Closed(job)) => {
                tracing::error!("Cache workers gone, dropping {}{}", job.host, job.path);
                self.stats.dropped.fetch_add(1, Ordering::Relaxed);
                false
            }
        }
    }

    pub fn stats(&self) -> CacheStatsSnapshot {
        self.stats.snapshot()
    }
}

async fn run_job(
    cache: &ContentCache,
    directory: Option<&PathBuf>,
    job: &CacheJob,
) -> Result<String, CacheJobError> {
    let route = cache.cache_route(&job.host, &job.path, &job.body)?;

    if let Some(directory) = directory {
        tokio::fs::create_dir_all(directory).await?;
        tokio::fs::write(directory.join(&route.hash), &job.body).await?;
    }

    Ok(route.hash.clone())
}

async fn record_outcomes(mut outcome_rx: mpsc::Receiver<CacheOutcome>, stats: Arc<CacheStats>) {
    while let Some(outcome) = outcome_rx.recv().await {
        match outcome.result {
            Ok(hash) => {
                stats.cached.fetch_add(1, Ordering::Relaxed);
                tracing::debug!("Cached {}{} as {}", outcome.host, outcome.path, hash);
            }
            Err(e) => {
                stats.failed.fetch_add(1, Ordering::Relaxed);
                tracing::error!("Failed to cache {}{}: {}", outcome.host, outcome.path, e);
            }
        }
    }
}

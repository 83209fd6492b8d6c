//! Job tracking for cancelling running copy jobs.

use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;

/// Tracks running copy jobs by handle and provides a cancellation mechanism
#[derive(Clone, Default)]
pub struct JobTracker {
    jobs: Arc<RwLock<HashMap<String, CancellationToken>>>,
}

impl JobTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a job and get the token it should watch.
    /// Re-registering a handle replaces the previous token.
    pub async fn register(&self, job_handle: &str) -> CancellationToken {
        let token = CancellationToken::new();
        let mut jobs = self.jobs.write().await;
        jobs.insert(job_handle.to_string(), token.clone());
        token
    }

    /// Cancel a running job by its handle. Returns whether it was tracked.
    pub async fn cancel(&self, job_handle: &str) -> bool {
        let mut jobs = self.jobs.write().await;
        if let Some(token) = jobs.remove(job_handle) {
            token.cancel();
            true
        } else {
            false
        }
    }

    /// Remove a job from tracking (called when the job finishes)
    pub async fn complete(&self, job_handle: &str) {
        let mut jobs = self.jobs.write().await;
        jobs.remove(job_handle);
    }

    pub async fn running_count(&self) -> usize {
        let jobs = self.jobs.read().await;
        jobs.len()
    }
}

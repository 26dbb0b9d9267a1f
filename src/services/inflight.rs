//! Process-wide registry of jobs with an active polling run.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio_util::sync::CancellationToken;

#[derive(Debug, Default, Clone)]
pub struct InFlightRegistry {
    entries: Arc<Mutex<HashMap<String, CancellationToken>>>,
}

impl InFlightRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, CancellationToken>> {
        self.entries.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Register `job_id` unless a run already owns it.
    ///
    /// The returned guard deregisters the job when dropped.
    pub fn try_enter(&self, job_id: &str) -> Option<InFlightGuard> {
        let mut entries = self.lock();
        if entries.contains_key(job_id) {
            return None;
        }
        let token = CancellationToken::new();
        entries.insert(job_id.to_string(), token.clone());
        Some(InFlightGuard {
            registry: self.clone(),
            job_id: job_id.to_string(),
            token,
        })
    }

    pub fn contains(&self, job_id: &str) -> bool {
        self.lock().contains_key(job_id)
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Ask every active run to stop at its next suspension point.
    pub fn cancel_all(&self) {
        let entries = self.lock();
        for (job_id, token) in entries.iter() {
            tracing::info!(job_id = %job_id, "Cancelling polling run");
            token.cancel();
        }
    }
}

/// Ownership of one job's polling run.
#[derive(Debug)]
pub struct InFlightGuard {
    registry: InFlightRegistry,
    job_id: String,
    token: CancellationToken,
}

impl InFlightGuard {
    pub fn job_id(&self) -> &str {
        &self.job_id
    }

    pub fn token(&self) -> &CancellationToken {
        &self.token
    }
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.registry.lock().remove(&self.job_id);
    }
}

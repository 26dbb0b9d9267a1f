//! Test doubles for the lifecycle tests: a scripted remote service, sleepers
//! that never touch the clock, and an in-memory ledger.

#![allow(dead_code)]

use async_trait::async_trait;
use sqlx::SqlitePool;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Semaphore;

use video_relay::db;
use video_relay::models::job::{Orientation, Requester};
use video_relay::services::backoff::{BackoffPolicy, Sleeper};
use video_relay::services::cdn::CdnRewrite;
use video_relay::services::credentials::{Credential, CredentialPool};
use video_relay::services::lifecycle::{Orchestrator, SubmitJob};
use video_relay::services::poller::{PollSettings, PollingEngine};
use video_relay::services::remote::{
    PendingTask, RecentResult, RemoteError, RemoteJobClient, SubmitParams,
};

/// Remote service double. Each listing call pops the next scripted answer and
/// falls back to a fixed answer once the script runs out.
#[derive(Default)]
pub struct ScriptedRemote {
    submit_script: Mutex<VecDeque<Result<String, RemoteError>>>,
    pending_script: Mutex<VecDeque<Result<Vec<PendingTask>, RemoteError>>>,
    pending_fallback: Mutex<Vec<PendingTask>>,
    results_script: Mutex<VecDeque<Result<Vec<RecentResult>, RemoteError>>>,
    results_fallback: Mutex<Vec<RecentResult>>,

    pub submit_calls: AtomicUsize,
    pub pending_calls: AtomicUsize,
    pub results_calls: AtomicUsize,
    pub upload_calls: AtomicUsize,
    /// Fingerprints of the credentials each submit was made with.
    pub submitted_with: Mutex<Vec<String>>,
    pub submitted_params: Mutex<Vec<SubmitParams>>,
    pub results_limits: Mutex<Vec<u32>>,
}

impl ScriptedRemote {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn push_submit(&self, result: Result<String, RemoteError>) {
        self.submit_script.lock().unwrap().push_back(result);
    }

    pub fn push_pending(&self, result: Result<Vec<PendingTask>, RemoteError>) {
        self.pending_script.lock().unwrap().push_back(result);
    }

    pub fn set_pending_fallback(&self, tasks: Vec<PendingTask>) {
        *self.pending_fallback.lock().unwrap() = tasks;
    }

    pub fn push_results(&self, result: Result<Vec<RecentResult>, RemoteError>) {
        self.results_script.lock().unwrap().push_back(result);
    }

    pub fn set_results_fallback(&self, items: Vec<RecentResult>) {
        *self.results_fallback.lock().unwrap() = items;
    }

    pub fn total_calls(&self) -> usize {
        self.submit_calls.load(Ordering::SeqCst)
            + self.pending_calls.load(Ordering::SeqCst)
            + self.results_calls.load(Ordering::SeqCst)
            + self.upload_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl RemoteJobClient for ScriptedRemote {
    async fn submit(&self, params: &SubmitParams, credential: &Credential) -> Result<String, RemoteError> {
        let n = self.submit_calls.fetch_add(1, Ordering::SeqCst);
        self.submitted_with
            .lock()
            .unwrap()
            .push(credential.fingerprint().to_string());
        self.submitted_params.lock().unwrap().push(params.clone());
        self.submit_script
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| Ok(format!("task_{}", n + 1)))
    }

    async fn list_pending(&self, _credential: &Credential) -> Result<Vec<PendingTask>, RemoteError> {
        self.pending_calls.fetch_add(1, Ordering::SeqCst);
        let scripted = self.pending_script.lock().unwrap().pop_front();
        scripted.unwrap_or_else(|| Ok(self.pending_fallback.lock().unwrap().clone()))
    }

    async fn list_recent_results(
        &self,
        _credential: &Credential,
        limit: u32,
    ) -> Result<Vec<RecentResult>, RemoteError> {
        self.results_calls.fetch_add(1, Ordering::SeqCst);
        self.results_limits.lock().unwrap().push(limit);
        let scripted = self.results_script.lock().unwrap().pop_front();
        scripted.unwrap_or_else(|| Ok(self.results_fallback.lock().unwrap().clone()))
    }

    async fn upload_image(&self, _image: Vec<u8>, _credential: &Credential) -> Result<String, RemoteError> {
        let n = self.upload_calls.fetch_add(1, Ordering::SeqCst);
        Ok(format!("media_{}", n + 1))
    }
}

pub fn pending(job_id: &str, status: &str, progress: f64) -> PendingTask {
    PendingTask {
        id: job_id.to_string(),
        status: Some(status.to_string()),
        progress_pct: Some(progress),
        failure_reason: None,
    }
}

pub fn ready(job_id: &str, url: &str) -> RecentResult {
    RecentResult {
        task_id: Some(job_id.to_string()),
        id: Some(format!("gen_{job_id}")),
        downloadable_url: Some(url.to_string()),
        reason_str: None,
    }
}

pub fn rejected(message: &str) -> RemoteError {
    RemoteError::Rejected {
        status: 400,
        message: message.to_string(),
    }
}

/// Returns at once and remembers every requested duration.
#[derive(Default)]
pub struct RecordingSleeper {
    pub waits: Mutex<Vec<Duration>>,
}

impl RecordingSleeper {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn waits(&self) -> Vec<Duration> {
        self.waits.lock().unwrap().clone()
    }

    pub fn total(&self) -> Duration {
        self.waits().iter().sum()
    }
}

#[async_trait]
impl Sleeper for RecordingSleeper {
    async fn sleep(&self, duration: Duration) {
        self.waits.lock().unwrap().push(duration);
        tokio::task::yield_now().await;
    }
}

/// Blocks every sleep until the test hands out a permit.
pub struct GatedSleeper {
    gate: Semaphore,
    pub entered: AtomicUsize,
}

impl GatedSleeper {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            gate: Semaphore::new(0),
            entered: AtomicUsize::new(0),
        })
    }

    pub fn open(&self, sleeps: usize) {
        self.gate.add_permits(sleeps);
    }

    /// Yield until `n` sleeps have started.
    pub async fn wait_entered(&self, n: usize) {
        while self.entered.load(Ordering::SeqCst) < n {
            tokio::task::yield_now().await;
        }
    }
}

#[async_trait]
impl Sleeper for GatedSleeper {
    async fn sleep(&self, _duration: Duration) {
        self.entered.fetch_add(1, Ordering::SeqCst);
        if let Ok(permit) = self.gate.acquire().await {
            permit.forget();
        }
    }
}

pub async fn memory_ledger() -> SqlitePool {
    let pool = db::init_memory_pool().await.expect("Failed to open in-memory ledger");
    db::run_migrations(&pool).await.expect("Failed to run migrations");
    pool
}

pub fn fast_settings() -> PollSettings {
    PollSettings {
        queue: BackoffPolicy {
            max_interval: Duration::from_secs(60),
            min_interval: Duration::from_secs(5),
            budget: Duration::from_secs(300),
        },
        resolve: BackoffPolicy::fixed(Duration::from_secs(3), Duration::from_secs(30)),
        recent_limit: 15,
        interactive_recent_limit: 30,
    }
}

/// Everything a lifecycle test needs, wired around the given doubles.
pub struct Harness {
    pub orchestrator: Orchestrator,
    pub pool: CredentialPool,
    pub ledger: SqlitePool,
    pub remote: Arc<ScriptedRemote>,
}

pub async fn harness(
    secrets: &[&str],
    ceiling: u32,
    remote: Arc<ScriptedRemote>,
    sleeper: Arc<dyn Sleeper>,
    settings: PollSettings,
) -> Harness {
    harness_with_cdn(secrets, ceiling, remote, sleeper, settings, CdnRewrite::None).await
}

pub async fn harness_with_cdn(
    secrets: &[&str],
    ceiling: u32,
    remote: Arc<ScriptedRemote>,
    sleeper: Arc<dyn Sleeper>,
    settings: PollSettings,
    cdn: CdnRewrite,
) -> Harness {
    let ledger = memory_ledger().await;
    let pool = CredentialPool::new(secrets.iter().copied(), ceiling);
    let engine = PollingEngine::new(remote.clone(), ledger.clone(), sleeper, settings);
    let orchestrator = Orchestrator::new(pool.clone(), remote.clone(), ledger.clone(), engine, cdn);

    Harness {
        orchestrator,
        pool,
        ledger,
        remote,
    }
}

pub fn job(prompt: &str) -> SubmitJob {
    SubmitJob {
        prompt: prompt.to_string(),
        orientation: Orientation::Portrait,
        reference_image: None,
        requester: Requester {
            id: Some("user-1".to_string()),
            label: Some("Tester".to_string()),
        },
        request_ref: Some("msg-1".to_string()),
    }
}

//! Polling engine: follows one remote job to a terminal outcome.
//!
//! A run has two phases. Phase A waits for the job to leave the remote
//! pending list under a decreasing [`Backoff`]; phase B then looks the job up
//! in the recent-results listing until a download URL shows up. The outcome is
//! written to the task ledger before the run returns.
//!
//! Runs are spawned onto the runtime, so they keep going when the caller that
//! started them goes away. At most one run per job id is active in a process;
//! a second caller gets a one-shot [`ProgressSnapshot`] instead.

use sqlx::SqlitePool;
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::db::queries;
use crate::models::job::Outcome;
use crate::services::backoff::{BackoffPolicy, Sleeper};
use crate::services::credentials::{Credential, CredentialLease};
use crate::services::inflight::InFlightRegistry;
use crate::services::remote::{PendingState, RemoteError, RemoteJobClient, ResultLookup};

/// Schedules and listing sizes used by a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollSettings {
    /// Phase A schedule.
    pub queue: BackoffPolicy,
    /// Phase B schedule.
    pub resolve: BackoffPolicy,
    pub recent_limit: u32,
    pub interactive_recent_limit: u32,
}

impl Default for PollSettings {
    fn default() -> Self {
        Self {
            queue: BackoffPolicy::default(),
            resolve: BackoffPolicy::fixed(Duration::from_secs(3), Duration::from_secs(30)),
            recent_limit: 15,
            interactive_recent_limit: 30,
        }
    }
}

/// One look at a job's place in the remote queue.
#[derive(Debug, Clone, PartialEq)]
pub struct ProgressSnapshot {
    pub job_id: String,
    pub state: PendingState,
}

impl ProgressSnapshot {
    pub fn status(&self) -> &str {
        match &self.state {
            PendingState::Pending { status, .. } => status.as_str(),
            PendingState::Failed { .. } => "failed",
            PendingState::NotPending => "processing",
        }
    }

    /// Progress as a percentage, when the job is still queued.
    pub fn progress_pct(&self) -> Option<f64> {
        match &self.state {
            PendingState::Pending { progress, .. } => Some(progress * 100.0),
            _ => None,
        }
    }
}

impl fmt::Display for ProgressSnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.state {
            PendingState::Pending { status, progress } => write!(
                f,
                "The task is still in the queue, check back later. Status: {status}, progress: {:.2}%",
                progress * 100.0
            ),
            PendingState::NotPending => {
                write!(f, "The task has left the queue, the video is being fetched")
            }
            PendingState::Failed { reason } => write!(f, "The task failed: {reason}"),
        }
    }
}

/// How a run was requested.
#[derive(Debug, Clone)]
pub enum WatchMode {
    /// Nobody is waiting on progress.
    Background,
    /// A caller is waiting: report progress on the channel before the long wait.
    Interactive(mpsc::Sender<ProgressSnapshot>),
}

/// Result of asking the engine to follow a job.
#[derive(Debug)]
pub enum Watch {
    /// This call started the run.
    Started(PollHandle),
    /// Another run owns the job; here is where it stands.
    AlreadyRunning(ProgressSnapshot),
}

/// Handle on a spawned run. Dropping it detaches the run, it does not stop it.
#[derive(Debug)]
pub struct PollHandle {
    job_id: String,
    handle: JoinHandle<Option<Outcome>>,
}

impl PollHandle {
    pub fn job_id(&self) -> &str {
        &self.job_id
    }

    /// Wait for the run. `None` when it was cancelled or died before an outcome.
    pub async fn outcome(self) -> Option<Outcome> {
        match self.handle.await {
            Ok(outcome) => outcome,
            Err(e) => {
                tracing::error!(job_id = %self.job_id, error = %e, "Polling task ended abnormally");
                None
            }
        }
    }
}

enum QueueWait {
    Finished,
    Verdict(Outcome),
}

#[derive(Clone)]
pub struct PollingEngine {
    remote: Arc<dyn RemoteJobClient>,
    ledger: SqlitePool,
    sleeper: Arc<dyn Sleeper>,
    registry: InFlightRegistry,
    settings: PollSettings,
}

impl PollingEngine {
    pub fn new(
        remote: Arc<dyn RemoteJobClient>,
        ledger: SqlitePool,
        sleeper: Arc<dyn Sleeper>,
        settings: PollSettings,
    ) -> Self {
        Self {
            remote,
            ledger,
            sleeper,
            registry: InFlightRegistry::new(),
            settings,
        }
    }

    pub fn settings(&self) -> &PollSettings {
        &self.settings
    }

    pub fn is_in_flight(&self, job_id: &str) -> bool {
        self.registry.contains(job_id)
    }

    pub fn in_flight_count(&self) -> usize {
        self.registry.len()
    }

    /// Stop every active run at its next sleep. Their ledger rows stay `queued`.
    pub fn shutdown(&self) {
        self.registry.cancel_all();
    }

    /// Single status check, no polling.
    pub async fn snapshot(&self, job_id: &str, credential: &Credential) -> Result<ProgressSnapshot, RemoteError> {
        let tasks = self.remote.list_pending(credential).await?;
        Ok(ProgressSnapshot {
            job_id: job_id.to_string(),
            state: PendingState::from_listing(job_id, &tasks),
        })
    }

    /// Start following `job_id` unless a run already owns it.
    ///
    /// The lease moves into the run and is released when the run ends. Errors
    /// only come from the status check made for a snapshot.
    pub async fn watch(&self, job_id: &str, lease: CredentialLease, mode: WatchMode) -> Result<Watch, RemoteError> {
        let Some(guard) = self.registry.try_enter(job_id) else {
            tracing::info!(job_id = %job_id, "Job already being polled, returning a snapshot");
            let snapshot = self.snapshot(job_id, lease.credential()).await?;
            return Ok(Watch::AlreadyRunning(snapshot));
        };

        let recent_limit = match &mode {
            WatchMode::Background => self.settings.recent_limit,
            WatchMode::Interactive(progress) => {
                let snapshot = self.snapshot(job_id, lease.credential()).await?;
                if matches!(snapshot.state, PendingState::Pending { .. }) {
                    let _ = progress.send(snapshot).await;
                }
                self.settings.interactive_recent_limit
            }
        };

        let engine = self.clone();
        let handle = tokio::spawn(async move {
            let cancel = guard.token().clone();
            let outcome = engine
                .run(guard.job_id(), lease.credential(), recent_limit, &cancel)
                .await;
            drop(lease);
            drop(guard);
            outcome
        });

        Ok(Watch::Started(PollHandle {
            job_id: job_id.to_string(),
            handle,
        }))
    }

    async fn run(
        &self,
        job_id: &str,
        credential: &Credential,
        recent_limit: u32,
        cancel: &CancellationToken,
    ) -> Option<Outcome> {
        let started = Instant::now();
        tracing::info!(job_id = %job_id, credential = credential.tag(), "Polling started");

        let outcome = match self.wait_for_queue(job_id, credential, cancel).await? {
            QueueWait::Finished => self.wait_for_result(job_id, credential, recent_limit, cancel).await?,
            QueueWait::Verdict(outcome) => outcome,
        };

        self.persist(job_id, &outcome).await;

        let status = outcome.status();
        metrics::counter!("video_jobs_terminal_total", "status" => status.as_str()).increment(1);
        metrics::histogram!("video_job_poll_seconds").record(started.elapsed().as_secs_f64());
        tracing::info!(
            job_id = %job_id,
            status = %status,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Polling finished"
        );

        Some(outcome)
    }

    /// Phase A. `None` when cancelled.
    async fn wait_for_queue(
        &self,
        job_id: &str,
        credential: &Credential,
        cancel: &CancellationToken,
    ) -> Option<QueueWait> {
        let mut backoff = self.settings.queue.start();

        loop {
            let (status, progress) = match self.remote.list_pending(credential).await {
                Ok(tasks) => match PendingState::from_listing(job_id, &tasks) {
                    PendingState::NotPending => {
                        tracing::debug!(job_id = %job_id, "Job left the pending list");
                        return Some(QueueWait::Finished);
                    }
                    PendingState::Failed { reason } => {
                        tracing::warn!(job_id = %job_id, reason = %reason, "Remote service reported failure");
                        return Some(QueueWait::Verdict(Outcome::Failed { reason }));
                    }
                    PendingState::Pending { status, progress } => (status, progress),
                },
                Err(e) => {
                    tracing::error!(job_id = %job_id, error = %e, "Status check failed");
                    return Some(QueueWait::Verdict(Outcome::Exception {
                        message: format!("Failed to check the task status, try again later: {e}"),
                    }));
                }
            };
            tracing::debug!(job_id = %job_id, status = %status, progress, "Job still pending");

            let Some(wait) = backoff.next_wait() else {
                let elapsed = backoff.elapsed().as_secs();
                let message = format!(
                    "Video generation timed out after {elapsed}s (last status: {status}, progress: {:.2}%)",
                    progress * 100.0
                );
                tracing::warn!(job_id = %job_id, elapsed_secs = elapsed, "Queue wait budget exhausted");
                return Some(QueueWait::Verdict(Outcome::Timeout { message }));
            };

            if !self.pause(wait, cancel).await {
                tracing::info!(job_id = %job_id, "Polling cancelled during queue wait");
                return None;
            }
        }
    }

    /// Phase B. `None` when cancelled.
    async fn wait_for_result(
        &self,
        job_id: &str,
        credential: &Credential,
        limit: u32,
        cancel: &CancellationToken,
    ) -> Option<Outcome> {
        let mut backoff = self.settings.resolve.start();

        loop {
            match self.remote.list_recent_results(credential, limit).await {
                Ok(items) => match ResultLookup::from_listing(job_id, &items) {
                    ResultLookup::Ready { url, result_id } => {
                        return Some(Outcome::Done { url, result_id });
                    }
                    ResultLookup::Unrecoverable { reason } => {
                        tracing::warn!(job_id = %job_id, reason = %reason, "Job finished without a video");
                        return Some(Outcome::Failed { reason });
                    }
                    ResultLookup::NotListed => {
                        tracing::debug!(job_id = %job_id, "Result not listed yet");
                    }
                },
                Err(e) => {
                    tracing::warn!(
                        job_id = %job_id,
                        error = %e,
                        transport = e.is_transport(),
                        "Result lookup failed, will retry"
                    );
                }
            }

            let Some(wait) = backoff.next_wait() else {
                let message = format!(
                    "Timed out after {}s waiting for the download URL",
                    backoff.elapsed().as_secs()
                );
                tracing::warn!(job_id = %job_id, "{message}");
                return Some(Outcome::Timeout { message });
            };

            if !self.pause(wait, cancel).await {
                tracing::info!(job_id = %job_id, "Polling cancelled during result lookup");
                return None;
            }
        }
    }

    /// Sleep unless cancelled first. Returns `false` on cancellation.
    async fn pause(&self, wait: Duration, cancel: &CancellationToken) -> bool {
        tokio::select! {
            _ = cancel.cancelled() => false,
            _ = self.sleeper.sleep(wait) => true,
        }
    }

    async fn persist(&self, job_id: &str, outcome: &Outcome) {
        match queries::record_outcome(&self.ledger, job_id, outcome).await {
            Ok(true) => {}
            Ok(false) => {
                tracing::warn!(
                    job_id = %job_id,
                    status = %outcome.status(),
                    "Ledger row missing or already final, outcome not recorded"
                );
            }
            Err(e) => {
                tracing::error!(job_id = %job_id, error = %e, "Failed to record job outcome");
            }
        }
    }
}

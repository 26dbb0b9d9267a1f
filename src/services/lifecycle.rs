//! Lifecycle orchestrator: the operations exposed to callers.
//!
//! `submit` admits a job against the credential pool, creates it remotely,
//! records it in the ledger and hands it to the polling engine. `resolve`
//! answers from the ledger when it can and otherwise resumes polling with the
//! credential that created the job.

use sqlx::SqlitePool;
use std::sync::Arc;

use crate::db::queries;
use crate::models::job::{JobStatus, NewJobRecord, Orientation, Outcome, Requester};
use crate::services::cdn::CdnRewrite;
use crate::services::credentials::{AdmissionError, Credential, CredentialPool};
use crate::services::poller::{PollHandle, PollingEngine, ProgressSnapshot, Watch, WatchMode};
use crate::services::remote::{RemoteError, RemoteJobClient, SubmitParams};

/// Upper bound on ledger rows re-attached at startup.
const RESUME_BATCH: i64 = 500;

/// A generation request, already normalized by the caller.
#[derive(Debug, Clone)]
pub struct SubmitJob {
    pub prompt: String,
    pub orientation: Orientation,
    pub reference_image: Option<ReferenceImage>,
    pub requester: Requester,
    pub request_ref: Option<String>,
}

#[derive(Debug, Clone)]
pub struct ReferenceImage {
    /// Where the image came from, kept in the ledger.
    pub source_url: Option<String>,
    pub bytes: Vec<u8>,
}

/// An accepted job. `completion` may be awaited with [`Orchestrator::settle`] or dropped.
#[derive(Debug)]
pub struct Submission {
    pub job_id: String,
    pub completion: Option<PollHandle>,
}

/// Answer to a query about a job.
#[derive(Debug, Clone, PartialEq)]
pub enum Resolution {
    Ready { url: String },
    InProgress(ProgressSnapshot),
}

#[derive(Debug, thiserror::Error)]
pub enum LifecycleError {
    #[error(transparent)]
    Admission(#[from] AdmissionError),

    #[error("Failed to create the video task: {0}")]
    Submission(RemoteError),

    #[error("No video task found with id {0}")]
    NotFound(String),

    #[error("The credential that created this task is no longer configured, its status cannot be checked")]
    CredentialUnavailable,

    #[error("{0}")]
    JobFailed(String),

    #[error("{0}")]
    JobTimedOut(String),

    #[error("{0}")]
    JobException(String),

    #[error("Failed to check the task status, try again later: {0}")]
    Remote(RemoteError),

    #[error("Polling was interrupted, query the task again to resume")]
    Interrupted,

    #[error("Database error: {0}")]
    Ledger(#[from] sqlx::Error),
}

#[derive(Clone)]
pub struct Orchestrator {
    pool: CredentialPool,
    remote: Arc<dyn RemoteJobClient>,
    ledger: SqlitePool,
    engine: PollingEngine,
    cdn: CdnRewrite,
}

impl Orchestrator {
    pub fn new(
        pool: CredentialPool,
        remote: Arc<dyn RemoteJobClient>,
        ledger: SqlitePool,
        engine: PollingEngine,
        cdn: CdnRewrite,
    ) -> Self {
        Self {
            pool,
            remote,
            ledger,
            engine,
            cdn,
        }
    }

    pub fn pool(&self) -> &CredentialPool {
        &self.pool
    }

    pub fn engine(&self) -> &PollingEngine {
        &self.engine
    }

    /// Create a job on the remote service and start following it.
    ///
    /// When the remote rejects a submission the next eligible credential is
    /// tried, each credential at most once.
    pub async fn submit(&self, job: SubmitJob) -> Result<Submission, LifecycleError> {
        let mut tried: Vec<String> = Vec::new();
        let mut last_error: Option<RemoteError> = None;

        loop {
            let lease = match self.pool.acquire_excluding(&tried) {
                Ok(lease) => lease,
                Err(admission) => {
                    if let Some(e) = last_error {
                        return Err(LifecycleError::Submission(e));
                    }
                    metrics::counter!("video_admission_rejected_total", "reason" => admission.reason())
                        .increment(1);
                    tracing::warn!(error = %admission, "Submission rejected by admission control");
                    return Err(admission.into());
                }
            };

            let job_id = match self.create_remote(&job, lease.credential()).await {
                Ok(job_id) => job_id,
                Err(e) => {
                    tracing::warn!(
                        credential = lease.credential().tag(),
                        error = %e,
                        "Remote submission failed, trying the next credential"
                    );
                    tried.push(lease.credential().fingerprint().to_string());
                    last_error = Some(e);
                    continue;
                }
            };

            let record = NewJobRecord {
                job_id: job_id.clone(),
                requester: job.requester.clone(),
                prompt: job.prompt.clone(),
                reference_image_url: job.reference_image.as_ref().and_then(|i| i.source_url.clone()),
                orientation: job.orientation,
                request_ref: job.request_ref.clone(),
                credential_fingerprint: lease.credential().fingerprint().to_string(),
            };
            if let Err(e) = queries::insert_job(&self.ledger, &record).await {
                tracing::error!(job_id = %job_id, error = %e, "Failed to record submitted job");
                return Err(e.into());
            }

            metrics::counter!("video_jobs_submitted_total").increment(1);
            tracing::info!(
                job_id = %job_id,
                credential = lease.credential().tag(),
                orientation = %job.orientation,
                "Video job submitted"
            );

            let completion = match self.engine.watch(&job_id, lease, WatchMode::Background).await {
                Ok(Watch::Started(handle)) => Some(handle),
                Ok(Watch::AlreadyRunning(_)) => None,
                Err(e) => {
                    tracing::warn!(job_id = %job_id, error = %e, "Could not start polling");
                    None
                }
            };

            return Ok(Submission { job_id, completion });
        }
    }

    async fn create_remote(&self, job: &SubmitJob, credential: &Credential) -> Result<String, RemoteError> {
        let image_id = match &job.reference_image {
            Some(image) => Some(self.remote.upload_image(image.bytes.clone(), credential).await?),
            None => None,
        };

        let params = SubmitParams {
            prompt: job.prompt.clone(),
            orientation: job.orientation,
            image_id,
        };
        self.remote.submit(&params, credential).await
    }

    /// Report on a job, polling it to completion if the ledger has no verdict yet.
    pub async fn resolve(&self, job_id: &str, mode: WatchMode) -> Result<Resolution, LifecycleError> {
        let record = queries::get_job(&self.ledger, job_id)
            .await?
            .ok_or_else(|| LifecycleError::NotFound(job_id.to_string()))?;

        if let Some(url) = &record.result_url {
            return Ok(Resolution::Ready {
                url: self.cdn.apply(url),
            });
        }

        match record.status {
            JobStatus::Failed => {
                return Err(LifecycleError::JobFailed(
                    record
                        .error_message
                        .unwrap_or_else(|| "Video generation failed".to_string()),
                ));
            }
            JobStatus::Done => {
                return Err(LifecycleError::JobFailed(
                    "The task finished without a downloadable video".to_string(),
                ));
            }
            JobStatus::Queued | JobStatus::Timeout | JobStatus::Exception => {}
        }
        if record.status.is_retryable() {
            tracing::info!(job_id = %job_id, status = %record.status, "Polling again after an earlier run gave up");
        }

        let lease = self
            .pool
            .claim(&record.credential_fingerprint)
            .ok_or(LifecycleError::CredentialUnavailable)?;

        match self.engine.watch(job_id, lease, mode).await.map_err(LifecycleError::Remote)? {
            Watch::AlreadyRunning(snapshot) => Ok(Resolution::InProgress(snapshot)),
            Watch::Started(handle) => self.settle(handle).await.map(|url| Resolution::Ready { url }),
        }
    }

    /// Wait for a run and turn its outcome into the caller-facing URL or error.
    pub async fn settle(&self, handle: PollHandle) -> Result<String, LifecycleError> {
        match handle.outcome().await {
            Some(Outcome::Done { url, .. }) => Ok(self.cdn.apply(&url)),
            Some(Outcome::Failed { reason }) => Err(LifecycleError::JobFailed(reason)),
            Some(Outcome::Timeout { message }) => Err(LifecycleError::JobTimedOut(message)),
            Some(Outcome::Exception { message }) => Err(LifecycleError::JobException(message)),
            None => Err(LifecycleError::Interrupted),
        }
    }

    /// Re-attach polling to every `queued` job left over from a previous process.
    pub async fn resume_pending(&self) -> Result<usize, LifecycleError> {
        let jobs = queries::list_jobs_by_status(&self.ledger, JobStatus::Queued, RESUME_BATCH).await?;
        let mut resumed = 0;

        for job in jobs {
            let Some(lease) = self.pool.claim(&job.credential_fingerprint) else {
                tracing::warn!(job_id = %job.job_id, "Skipping resume, credential no longer configured");
                continue;
            };
            match self.engine.watch(&job.job_id, lease, WatchMode::Background).await {
                Ok(Watch::Started(_)) => resumed += 1,
                Ok(Watch::AlreadyRunning(_)) => {}
                Err(e) => tracing::warn!(job_id = %job.job_id, error = %e, "Failed to resume job"),
            }
        }

        tracing::info!(resumed, "Resumed queued jobs");
        Ok(resumed)
    }

    /// Stop active runs so they resume on the next start.
    pub fn shutdown(&self) {
        self.engine.shutdown();
    }
}

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use strum::{Display, EnumIter, EnumString, IntoStaticStr};

/// Lifecycle status of a remote video job as recorded in the task ledger.
///
/// `Queued` is the only non-terminal state that is persisted; "polling" is
/// implicit while a run holds the job in the in-flight registry.
#[derive(
    Debug,
    Clone,
    Copy,
    Serialize,
    Deserialize,
    PartialEq,
    Eq,
    Hash,
    Display,
    EnumIter,
    EnumString,
    IntoStaticStr,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum JobStatus {
    Queued,
    Done,
    Failed,
    Timeout,
    Exception,
}

impl JobStatus {
    pub fn as_str(self) -> &'static str {
        self.into()
    }

    /// `Done` and `Failed` are verdicts from the remote service and never change.
    /// `Timeout` and `Exception` only describe how one polling run ended.
    pub fn is_final(self) -> bool {
        matches!(self, JobStatus::Done | JobStatus::Failed)
    }

    /// Whether another polling run may be started for a job in this state.
    pub fn is_retryable(self) -> bool {
        !self.is_final()
    }

    /// The ledger only writes `next` over rows whose status allows it.
    pub fn can_transition_to(self, next: JobStatus) -> bool {
        match self {
            JobStatus::Done | JobStatus::Failed => false,
            JobStatus::Queued | JobStatus::Timeout | JobStatus::Exception => {
                next != JobStatus::Queued
            }
        }
    }
}

/// Aspect of the generated video.
#[derive(
    Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default, Display, EnumString, IntoStaticStr,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum Orientation {
    Landscape,
    #[default]
    Portrait,
}

impl Orientation {
    pub fn as_str(self) -> &'static str {
        self.into()
    }
}

/// Who asked for the job. Informational only.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct Requester {
    pub id: Option<String>,
    pub label: Option<String>,
}

/// A row of the task ledger.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobRecord {
    pub job_id: String,
    pub requester: Requester,
    pub prompt: String,
    pub reference_image_url: Option<String>,
    pub orientation: Orientation,
    pub status: JobStatus,
    pub result_url: Option<String>,
    pub result_id: Option<String>,
    pub request_ref: Option<String>,
    pub credential_fingerprint: String,
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Fields written once, when the remote service accepts a submission.
#[derive(Debug, Clone)]
pub struct NewJobRecord {
    pub job_id: String,
    pub requester: Requester,
    pub prompt: String,
    pub reference_image_url: Option<String>,
    pub orientation: Orientation,
    pub request_ref: Option<String>,
    pub credential_fingerprint: String,
}

/// Terminal result of one polling run, as written back to the ledger.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    Done { url: String, result_id: Option<String> },
    Failed { reason: String },
    Timeout { message: String },
    Exception { message: String },
}

impl Outcome {
    pub fn status(&self) -> JobStatus {
        match self {
            Outcome::Done { .. } => JobStatus::Done,
            Outcome::Failed { .. } => JobStatus::Failed,
            Outcome::Timeout { .. } => JobStatus::Timeout,
            Outcome::Exception { .. } => JobStatus::Exception,
        }
    }

    pub fn error_message(&self) -> Option<&str> {
        match self {
            Outcome::Done { .. } => None,
            Outcome::Failed { reason } => Some(reason),
            Outcome::Timeout { message } | Outcome::Exception { message } => Some(message),
        }
    }
}

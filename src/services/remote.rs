//! Client for the remote video generation service.
//!
//! [`RemoteJobClient`] is the seam the lifecycle engine talks through;
//! [`SoraClient`] is the HTTP implementation. Raw listing entries are turned
//! into [`PendingState`] / [`ResultLookup`] here so nothing past this module
//! matches on remote status strings.

use async_trait::async_trait;
use reqwest::{multipart, Client, Response};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::models::job::Orientation;
use crate::services::credentials::Credential;

const USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/141.0.0.0 Safari/537.36";

/// Parameters of a generation request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubmitParams {
    pub prompt: String,
    pub orientation: Orientation,
    pub image_id: Option<String>,
}

/// One entry of the remote pending list.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct PendingTask {
    pub id: String,
    #[serde(default)]
    pub status: Option<String>,
    /// Fraction in `0.0..=1.0`.
    #[serde(default)]
    pub progress_pct: Option<f64>,
    #[serde(default)]
    pub failure_reason: Option<String>,
}

/// One entry of the remote recent-results listing.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct RecentResult {
    #[serde(default)]
    pub task_id: Option<String>,
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub downloadable_url: Option<String>,
    #[serde(default)]
    pub reason_str: Option<String>,
}

#[derive(Deserialize)]
struct RecentResultsPage {
    #[serde(default)]
    items: Vec<RecentResult>,
}

#[derive(Deserialize)]
struct IdResponse {
    id: Option<String>,
}

#[derive(Deserialize)]
struct ErrorEnvelope {
    error: Option<ErrorBody>,
}

#[derive(Deserialize)]
struct ErrorBody {
    message: Option<String>,
}

#[derive(Debug, thiserror::Error)]
pub enum RemoteError {
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Remote service rejected the request ({status}): {message}")]
    Rejected { status: u16, message: String },

    #[error("Failed to parse remote response: {0}")]
    Decode(String),
}

impl RemoteError {
    /// Network or parsing trouble, as opposed to an explicit verdict from the service.
    pub fn is_transport(&self) -> bool {
        !matches!(self, RemoteError::Rejected { .. })
    }
}

/// Capabilities consumed from the remote service. Every call carries a bearer credential.
#[async_trait]
pub trait RemoteJobClient: Send + Sync {
    async fn submit(&self, params: &SubmitParams, credential: &Credential) -> Result<String, RemoteError>;

    async fn list_pending(&self, credential: &Credential) -> Result<Vec<PendingTask>, RemoteError>;

    async fn list_recent_results(
        &self,
        credential: &Credential,
        limit: u32,
    ) -> Result<Vec<RecentResult>, RemoteError>;

    async fn upload_image(&self, image: Vec<u8>, credential: &Credential) -> Result<String, RemoteError>;
}

/// Where a job stands in the remote queue.
#[derive(Debug, Clone, PartialEq)]
pub enum PendingState {
    Pending { status: String, progress: f64 },
    Failed { reason: String },
    /// No longer listed: queuing is over, the result may still be on its way.
    NotPending,
}

impl PendingState {
    pub fn from_listing(job_id: &str, tasks: &[PendingTask]) -> Self {
        let Some(task) = tasks.iter().find(|t| t.id == job_id) else {
            return PendingState::NotPending;
        };

        let status = task
            .status
            .as_deref()
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .unwrap_or("queued")
            .to_ascii_lowercase();

        if matches!(status.as_str(), "failed" | "error" | "cancelled" | "canceled") {
            let reason = task
                .failure_reason
                .clone()
                .unwrap_or_else(|| format!("Remote service reported status {status}"));
            return PendingState::Failed { reason };
        }

        PendingState::Pending {
            status,
            progress: task.progress_pct.unwrap_or(0.0).clamp(0.0, 1.0),
        }
    }
}

/// What the recent-results listing says about a job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResultLookup {
    Ready { url: String, result_id: Option<String> },
    Unrecoverable { reason: String },
    NotListed,
}

impl ResultLookup {
    pub fn from_listing(job_id: &str, items: &[RecentResult]) -> Self {
        let Some(item) = items.iter().find(|i| i.task_id.as_deref() == Some(job_id)) else {
            return ResultLookup::NotListed;
        };

        match item.downloadable_url.as_deref().filter(|u| !u.is_empty()) {
            Some(url) => ResultLookup::Ready {
                url: url.to_string(),
                result_id: item.id.clone(),
            },
            None => ResultLookup::Unrecoverable {
                reason: item
                    .reason_str
                    .clone()
                    .filter(|r| !r.is_empty())
                    .unwrap_or_else(|| "The remote service produced no downloadable video".to_string()),
            },
        }
    }
}

/// HTTP client for the Sora backend.
pub struct SoraClient {
    http: Client,
    base_url: String,
    model: String,
}

impl SoraClient {
    pub fn new(base_url: &str, model: &str, proxy: Option<&str>) -> Result<Self, RemoteError> {
        let mut builder = Client::builder()
            .user_agent(USER_AGENT)
            .timeout(Duration::from_secs(60));
        if let Some(proxy) = proxy.filter(|p| !p.is_empty()) {
            builder = builder.proxy(reqwest::Proxy::all(proxy)?);
        }

        Ok(Self {
            http: builder.build()?,
            base_url: base_url.trim_end_matches('/').to_string(),
            model: model.to_string(),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    fn create_payload(&self, params: &SubmitParams) -> serde_json::Value {
        let inpaint_items: Vec<serde_json::Value> = params
            .image_id
            .iter()
            .map(|id| serde_json::json!({ "kind": "upload", "upload_id": id }))
            .collect();

        serde_json::json!({
            "kind": "video",
            "prompt": params.prompt,
            "title": null,
            "orientation": params.orientation.as_str(),
            "size": "small",
            "n_frames": 300,
            "inpaint_items": inpaint_items,
            "remix_target_id": null,
            "cameo_ids": null,
            "cameo_replacements": null,
            "model": self.model,
            "style_id": null,
            "audio_caption": null,
            "audio_transcript": null,
            "video_caption": null,
            "storyboard_id": null,
        })
    }
}

/// Decode a JSON body, turning non-2xx answers into [`RemoteError::Rejected`].
async fn read_json<T: DeserializeOwned>(response: Response) -> Result<T, RemoteError> {
    let status = response.status();
    let body = response.text().await?;

    if !status.is_success() {
        let message = serde_json::from_str::<ErrorEnvelope>(&body)
            .ok()
            .and_then(|e| e.error)
            .and_then(|e| e.message)
            .unwrap_or_else(|| snippet(&body));
        return Err(RemoteError::Rejected {
            status: status.as_u16(),
            message,
        });
    }

    serde_json::from_str(&body).map_err(|e| RemoteError::Decode(format!("{e}; body: {}", snippet(&body))))
}

fn snippet(body: &str) -> String {
    body.chars().take(200).collect()
}

fn require_id(resp: IdResponse, what: &str) -> Result<String, RemoteError> {
    resp.id
        .filter(|id| !id.is_empty())
        .ok_or_else(|| RemoteError::Decode(format!("{what} response carried no id")))
}

#[async_trait]
impl RemoteJobClient for SoraClient {
    async fn submit(&self, params: &SubmitParams, credential: &Credential) -> Result<String, RemoteError> {
        let response = self
            .http
            .post(self.url("/backend/nf/create"))
            .bearer_auth(credential.secret())
            .json(&self.create_payload(params))
            .send()
            .await?;

        require_id(read_json(response).await?, "create")
    }

    async fn list_pending(&self, credential: &Credential) -> Result<Vec<PendingTask>, RemoteError> {
        let response = self
            .http
            .get(self.url("/backend/nf/pending"))
            .bearer_auth(credential.secret())
            .send()
            .await?;

        read_json(response).await
    }

    async fn list_recent_results(
        &self,
        credential: &Credential,
        limit: u32,
    ) -> Result<Vec<RecentResult>, RemoteError> {
        let response = self
            .http
            .get(self.url("/backend/project_y/profile/drafts"))
            .query(&[("limit", limit)])
            .bearer_auth(credential.secret())
            .send()
            .await?;

        let page: RecentResultsPage = read_json(response).await?;
        Ok(page.items)
    }

    async fn upload_image(&self, image: Vec<u8>, credential: &Credential) -> Result<String, RemoteError> {
        let part = multipart::Part::bytes(image)
            .file_name(format!("{}.png", uuid::Uuid::new_v4()))
            .mime_str("image/png")?;
        let form = multipart::Form::new().part("file", part);

        let response = self
            .http
            .post(self.url("/backend/uploads"))
            .bearer_auth(credential.secret())
            .multipart(form)
            .send()
            .await?;

        require_id(read_json(response).await?, "upload")
    }
}

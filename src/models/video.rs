use garde::Validate;
use serde::{Deserialize, Serialize};

use crate::models::job::{JobStatus, Orientation};

/// Orientation requested by the caller. `Auto` derives it from the reference image.
#[derive(Debug, Clone, Copy, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum OrientationChoice {
    Landscape,
    Portrait,
    Auto,
}

impl From<Orientation> for OrientationChoice {
    fn from(o: Orientation) -> Self {
        match o {
            Orientation::Landscape => OrientationChoice::Landscape,
            Orientation::Portrait => OrientationChoice::Portrait,
        }
    }
}

/// Request to generate a video.
#[derive(Debug, Deserialize, Validate)]
pub struct SubmitVideoRequest {
    #[garde(length(max = 4000))]
    pub prompt: Option<String>,

    #[garde(skip)]
    pub orientation: Option<OrientationChoice>,

    #[garde(url, length(max = 2048))]
    pub image_url: Option<String>,

    #[garde(length(min = 1, max = 128))]
    pub requester_id: Option<String>,

    #[garde(length(min = 1, max = 128))]
    pub requester_label: Option<String>,

    #[garde(length(min = 1, max = 128))]
    pub request_ref: Option<String>,

    /// Block until the video is ready instead of returning the job id right away.
    #[garde(skip)]
    #[serde(default)]
    pub wait: bool,
}

/// Response after submitting a video job.
#[derive(Debug, Serialize, Deserialize)]
pub struct SubmitVideoResponse {
    pub job_id: String,
    pub status: JobStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub video_url: Option<String>,
    pub message: String,
}

#[derive(Debug, Deserialize)]
pub struct JobQuery {
    #[serde(default)]
    pub wait: bool,
}

/// Response for querying a video job.
#[derive(Debug, Serialize, Deserialize)]
pub struct JobStatusResponse {
    pub job_id: String,
    pub status: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub video_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub progress_pct: Option<f64>,
    pub message: String,
}

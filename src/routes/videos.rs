use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::Json;
use garde::Validate;
use tokio::sync::mpsc;

use crate::app_state::AppState;
use crate::error::AppResult;
use crate::models::job::{JobStatus, Orientation, Requester};
use crate::models::video::{JobQuery, JobStatusResponse, OrientationChoice, SubmitVideoRequest, SubmitVideoResponse};
use crate::services::image::{fetch_reference_image, orientation_of};
use crate::services::lifecycle::{ReferenceImage, Resolution, SubmitJob};
use crate::services::poller::WatchMode;

/// POST /api/v1/videos — submit a prompt (and optional reference image) for generation.
pub async fn submit_video(
    State(state): State<AppState>,
    Json(req): Json<SubmitVideoRequest>,
) -> AppResult<(StatusCode, Json<SubmitVideoResponse>)> {
    req.validate()?;

    let prompt = req
        .prompt
        .as_deref()
        .map(str::trim)
        .filter(|p| !p.is_empty())
        .map(str::to_string)
        .unwrap_or_else(|| state.default_prompt.clone());

    let reference_image = match &req.image_url {
        Some(url) => Some(ReferenceImage {
            bytes: fetch_reference_image(&state.http, url).await?,
            source_url: Some(url.clone()),
        }),
        None => None,
    };

    let choice = req
        .orientation
        .unwrap_or_else(|| OrientationChoice::from(state.default_orientation));
    let orientation = pick_orientation(choice, reference_image.as_ref(), state.default_orientation);

    let job = SubmitJob {
        prompt,
        orientation,
        reference_image,
        requester: Requester {
            id: req.requester_id.clone(),
            label: req.requester_label.clone(),
        },
        request_ref: req.request_ref.clone(),
    };

    let submission = state.orchestrator.submit(job).await?;

    if !req.wait {
        return Ok((
            StatusCode::ACCEPTED,
            Json(SubmitVideoResponse {
                job_id: submission.job_id,
                status: JobStatus::Queued,
                video_url: None,
                message: "Video task submitted, query the job id for the result".to_string(),
            }),
        ));
    }

    let url = match submission.completion {
        Some(handle) => state.orchestrator.settle(handle).await?,
        None => match state
            .orchestrator
            .resolve(&submission.job_id, WatchMode::Background)
            .await?
        {
            Resolution::Ready { url } => url,
            Resolution::InProgress(snapshot) => {
                return Ok((
                    StatusCode::ACCEPTED,
                    Json(SubmitVideoResponse {
                        job_id: submission.job_id,
                        status: JobStatus::Queued,
                        video_url: None,
                        message: snapshot.to_string(),
                    }),
                ));
            }
        },
    };

    Ok((
        StatusCode::OK,
        Json(SubmitVideoResponse {
            job_id: submission.job_id,
            status: JobStatus::Done,
            video_url: Some(url),
            message: "Video generated".to_string(),
        }),
    ))
}

/// GET /api/v1/videos/{job_id} — result URL, or where the job stands.
///
/// Without `wait` the first progress report is returned while polling carries
/// on in the background; with `wait` the call blocks until a verdict.
pub async fn get_video(
    State(state): State<AppState>,
    Path(job_id): Path<String>,
    Query(query): Query<JobQuery>,
) -> AppResult<Json<JobStatusResponse>> {
    let resolution = if query.wait {
        state.orchestrator.resolve(&job_id, WatchMode::Background).await?
    } else {
        let (tx, mut rx) = mpsc::channel(1);
        let resolve = state.orchestrator.resolve(&job_id, WatchMode::Interactive(tx));
        tokio::pin!(resolve);

        tokio::select! {
            result = &mut resolve => result?,
            Some(snapshot) = rx.recv() => Resolution::InProgress(snapshot),
        }
    };

    Ok(Json(status_response(job_id, resolution)))
}

fn status_response(job_id: String, resolution: Resolution) -> JobStatusResponse {
    match resolution {
        Resolution::Ready { url } => JobStatusResponse {
            job_id,
            status: JobStatus::Done.to_string(),
            video_url: Some(url),
            progress_pct: None,
            message: "Video generated".to_string(),
        },
        Resolution::InProgress(snapshot) => JobStatusResponse {
            job_id,
            status: snapshot.status().to_string(),
            video_url: None,
            progress_pct: snapshot.progress_pct(),
            message: snapshot.to_string(),
        },
    }
}

/// `Auto` reads the reference image; without a readable one it falls back to `default`.
fn pick_orientation(choice: OrientationChoice, image: Option<&ReferenceImage>, default: Orientation) -> Orientation {
    match choice {
        OrientationChoice::Landscape => Orientation::Landscape,
        OrientationChoice::Portrait => Orientation::Portrait,
        OrientationChoice::Auto => match image.map(|i| orientation_of(&i.bytes)) {
            Some(Ok(orientation)) => orientation,
            Some(Err(e)) => {
                tracing::warn!(error = %e, "Could not read reference image dimensions, using default orientation");
                default
            }
            None => default,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::poller::ProgressSnapshot;
    use crate::services::remote::PendingState;
    use image::{ImageFormat, RgbImage};
    use std::io::Cursor;

    fn reference(width: u32, height: u32) -> ReferenceImage {
        let mut out = Cursor::new(Vec::new());
        RgbImage::new(width, height)
            .write_to(&mut out, ImageFormat::Png)
            .unwrap();
        ReferenceImage {
            source_url: None,
            bytes: out.into_inner(),
        }
    }

    #[test]
    fn explicit_orientation_wins() {
        let wide = reference(64, 36);
        assert_eq!(
            pick_orientation(OrientationChoice::Portrait, Some(&wide), Orientation::Landscape),
            Orientation::Portrait
        );
    }

    #[test]
    fn auto_reads_the_image() {
        let wide = reference(64, 36);
        assert_eq!(
            pick_orientation(OrientationChoice::Auto, Some(&wide), Orientation::Portrait),
            Orientation::Landscape
        );
    }

    #[test]
    fn auto_without_usable_image_uses_default() {
        assert_eq!(
            pick_orientation(OrientationChoice::Auto, None, Orientation::Landscape),
            Orientation::Landscape
        );
        let broken = ReferenceImage {
            source_url: None,
            bytes: b"nope".to_vec(),
        };
        assert_eq!(
            pick_orientation(OrientationChoice::Auto, Some(&broken), Orientation::Portrait),
            Orientation::Portrait
        );
    }

    #[test]
    fn in_progress_response_carries_percentage() {
        let response = status_response(
            "task_1".to_string(),
            Resolution::InProgress(ProgressSnapshot {
                job_id: "task_1".to_string(),
                state: PendingState::Pending {
                    status: "running".to_string(),
                    progress: 0.42,
                },
            }),
        );
        assert_eq!(response.status, "running");
        assert!((response.progress_pct.unwrap() - 42.0).abs() < 1e-9);
        assert!(response.message.contains("42.00%"));
        assert!(response.video_url.is_none());
    }
}

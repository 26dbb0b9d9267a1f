use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde_json::json;

use crate::services::credentials::AdmissionError;
use crate::services::image::ImageError;
use crate::services::lifecycle::LifecycleError;

/// Error type for HTTP handlers, rendered as `{"error", "code"}` JSON.
#[derive(Debug, thiserror::Error)]
pub enum AppError {
    #[error(transparent)]
    Lifecycle(#[from] LifecycleError),

    #[error(transparent)]
    Image(#[from] ImageError),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Validation failed: {0}")]
    Validation(String),
}

pub type AppResult<T> = Result<T, AppError>;

impl From<garde::Report> for AppError {
    fn from(report: garde::Report) -> Self {
        AppError::Validation(report.to_string())
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, code, message) = match &self {
            AppError::Lifecycle(err) => classify_lifecycle_error(err),

            AppError::Image(err) => match err {
                ImageError::TooLarge => (StatusCode::PAYLOAD_TOO_LARGE, "IMAGE_TOO_LARGE", err.to_string()),
                ImageError::Unsupported(_) => {
                    (StatusCode::UNSUPPORTED_MEDIA_TYPE, "UNSUPPORTED_IMAGE", err.to_string())
                }
                ImageError::Download(_) | ImageError::Status(_) => {
                    (StatusCode::UNPROCESSABLE_ENTITY, "IMAGE_UNAVAILABLE", err.to_string())
                }
            },

            AppError::Database(err) => classify_sqlx_error(err),

            AppError::Validation(msg) => (StatusCode::BAD_REQUEST, "VALIDATION_ERROR", msg.clone()),
        };

        let body = json!({
            "error": message,
            "code": code,
        });

        (status, axum::Json(body)).into_response()
    }
}

fn classify_lifecycle_error(err: &LifecycleError) -> (StatusCode, &'static str, String) {
    let message = err.to_string();
    match err {
        LifecycleError::Admission(AdmissionError::NoCredentialsConfigured) => {
            (StatusCode::SERVICE_UNAVAILABLE, "NO_CREDENTIALS", message)
        }
        LifecycleError::Admission(AdmissionError::AllBusy) => {
            (StatusCode::SERVICE_UNAVAILABLE, "CAPACITY_EXHAUSTED", message)
        }
        LifecycleError::Submission(_) => (StatusCode::BAD_GATEWAY, "SUBMISSION_FAILED", message),
        LifecycleError::NotFound(_) => (StatusCode::NOT_FOUND, "NOT_FOUND", message),
        LifecycleError::CredentialUnavailable => (StatusCode::CONFLICT, "CREDENTIAL_UNAVAILABLE", message),
        LifecycleError::JobFailed(_) => (StatusCode::UNPROCESSABLE_ENTITY, "JOB_FAILED", message),
        LifecycleError::JobTimedOut(_) => (StatusCode::GATEWAY_TIMEOUT, "JOB_TIMEOUT", message),
        LifecycleError::JobException(_) | LifecycleError::Remote(_) => {
            (StatusCode::BAD_GATEWAY, "REMOTE_ERROR", message)
        }
        LifecycleError::Interrupted => (StatusCode::SERVICE_UNAVAILABLE, "INTERRUPTED", message),
        LifecycleError::Ledger(db) => classify_sqlx_error(db),
    }
}

/// Sanitize ledger errors; a duplicate job id is the only expected conflict.
fn classify_sqlx_error(err: &sqlx::Error) -> (StatusCode, &'static str, String) {
    match err {
        sqlx::Error::RowNotFound => (StatusCode::NOT_FOUND, "NOT_FOUND", "Resource not found".to_string()),
        sqlx::Error::Database(db_err) if db_err.is_unique_violation() => (
            StatusCode::CONFLICT,
            "CONFLICT",
            "A task with this id is already recorded".to_string(),
        ),
        other => {
            tracing::error!(error = %other, "Database error");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                "INTERNAL_ERROR",
                "An internal error occurred".to_string(),
            )
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn status_of(err: AppError) -> StatusCode {
        err.into_response().status()
    }

    #[test]
    fn admission_errors_are_service_unavailable() {
        assert_eq!(
            status_of(LifecycleError::from(AdmissionError::AllBusy).into()),
            StatusCode::SERVICE_UNAVAILABLE
        );
        assert_eq!(
            status_of(LifecycleError::from(AdmissionError::NoCredentialsConfigured).into()),
            StatusCode::SERVICE_UNAVAILABLE
        );
    }

    #[test]
    fn missing_job_is_not_found() {
        assert_eq!(
            status_of(LifecycleError::NotFound("task_x".to_string()).into()),
            StatusCode::NOT_FOUND
        );
    }

    #[test]
    fn job_verdicts_map_to_distinct_statuses() {
        assert_eq!(
            status_of(LifecycleError::JobFailed("policy".to_string()).into()),
            StatusCode::UNPROCESSABLE_ENTITY
        );
        assert_eq!(
            status_of(LifecycleError::JobTimedOut("300s".to_string()).into()),
            StatusCode::GATEWAY_TIMEOUT
        );
        assert_eq!(
            status_of(LifecycleError::JobException("reset".to_string()).into()),
            StatusCode::BAD_GATEWAY
        );
    }

    #[test]
    fn image_errors() {
        assert_eq!(status_of(ImageError::TooLarge.into()), StatusCode::PAYLOAD_TOO_LARGE);
        assert_eq!(status_of(ImageError::Status(404).into()), StatusCode::UNPROCESSABLE_ENTITY);
    }
}

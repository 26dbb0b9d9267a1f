use chrono::Utc;
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};
use std::str::FromStr;
use strum::IntoEnumIterator;

use crate::models::job::{JobRecord, JobStatus, NewJobRecord, Orientation, Outcome, Requester};

const JOB_COLUMNS: &str = r#"
    job_id, requester_id, requester_label, prompt, reference_image_url, orientation,
    status, result_url, result_id, request_ref, credential_fingerprint, error_message,
    updated_at, created_at
"#;

/// Insert the ledger row for a freshly submitted job
pub async fn insert_job(pool: &SqlitePool, job: &NewJobRecord) -> Result<JobRecord, sqlx::Error> {
    let now = Utc::now();

    sqlx::query(
        r#"
        INSERT INTO video_tasks (
            job_id, requester_id, requester_label, prompt, reference_image_url, orientation,
            status, request_ref, credential_fingerprint, updated_at, created_at
        )
        VALUES (?1, ?2, ?3, ?4, ?5, ?6, 'queued', ?7, ?8, ?9, ?9)
        "#,
    )
    .bind(&job.job_id)
    .bind(&job.requester.id)
    .bind(&job.requester.label)
    .bind(&job.prompt)
    .bind(&job.reference_image_url)
    .bind(job.orientation.as_str())
    .bind(&job.request_ref)
    .bind(&job.credential_fingerprint)
    .bind(now)
    .execute(pool)
    .await?;

    Ok(JobRecord {
        job_id: job.job_id.clone(),
        requester: job.requester.clone(),
        prompt: job.prompt.clone(),
        reference_image_url: job.reference_image_url.clone(),
        orientation: job.orientation,
        status: JobStatus::Queued,
        result_url: None,
        result_id: None,
        request_ref: job.request_ref.clone(),
        credential_fingerprint: job.credential_fingerprint.clone(),
        error_message: None,
        created_at: now,
        updated_at: now,
    })
}

/// Get a job by its remote id
pub async fn get_job(pool: &SqlitePool, job_id: &str) -> Result<Option<JobRecord>, sqlx::Error> {
    let row = sqlx::query(&format!("SELECT {JOB_COLUMNS} FROM video_tasks WHERE job_id = ?1"))
        .bind(job_id)
        .fetch_optional(pool)
        .await?;

    row.map(job_from_row).transpose()
}

/// Write the terminal outcome of a polling run.
///
/// Only rows whose status may move to the outcome's status are updated (see
/// [`JobStatus::can_transition_to`]) and `result_url` is only filled when
/// empty. Returns whether the row changed.
pub async fn record_outcome(pool: &SqlitePool, job_id: &str, outcome: &Outcome) -> Result<bool, sqlx::Error> {
    let next = outcome.status();
    let writable: Vec<JobStatus> = JobStatus::iter().filter(|s| s.can_transition_to(next)).collect();
    if writable.is_empty() {
        return Ok(false);
    }

    let (url, result_id) = match outcome {
        Outcome::Done { url, result_id } => (Some(url.as_str()), result_id.as_deref()),
        _ => (None, None),
    };

    let placeholders = (0..writable.len())
        .map(|i| format!("?{}", i + 7))
        .collect::<Vec<_>>()
        .join(", ");
    let sql = format!(
        r#"
        UPDATE video_tasks
        SET status = ?1,
            result_url = COALESCE(result_url, ?2),
            result_id = COALESCE(result_id, ?3),
            error_message = ?4,
            updated_at = ?5
        WHERE job_id = ?6
          AND status IN ({placeholders})
        "#
    );

    let mut query = sqlx::query(&sql)
        .bind(next.as_str())
        .bind(url)
        .bind(result_id)
        .bind(outcome.error_message())
        .bind(Utc::now())
        .bind(job_id);
    for status in &writable {
        query = query.bind(status.as_str());
    }

    let result = query.execute(pool).await?;
    Ok(result.rows_affected() > 0)
}

/// Jobs in the given status, oldest first
pub async fn list_jobs_by_status(
    pool: &SqlitePool,
    status: JobStatus,
    limit: i64,
) -> Result<Vec<JobRecord>, sqlx::Error> {
    let rows = sqlx::query(&format!(
        "SELECT {JOB_COLUMNS} FROM video_tasks WHERE status = ?1 ORDER BY created_at ASC LIMIT ?2"
    ))
    .bind(status.as_str())
    .bind(limit)
    .fetch_all(pool)
    .await?;

    rows.into_iter().map(job_from_row).collect()
}

fn job_from_row(r: SqliteRow) -> Result<JobRecord, sqlx::Error> {
    let status: String = r.try_get("status")?;
    let orientation: String = r.try_get("orientation")?;

    Ok(JobRecord {
        job_id: r.try_get("job_id")?,
        requester: Requester {
            id: r.try_get("requester_id")?,
            label: r.try_get("requester_label")?,
        },
        prompt: r.try_get("prompt")?,
        reference_image_url: r.try_get("reference_image_url")?,
        orientation: Orientation::from_str(&orientation).map_err(|e| sqlx::Error::Decode(Box::new(e)))?,
        status: JobStatus::from_str(&status).map_err(|e| sqlx::Error::Decode(Box::new(e)))?,
        result_url: r.try_get("result_url")?,
        result_id: r.try_get("result_id")?,
        request_ref: r.try_get("request_ref")?,
        credential_fingerprint: r.try_get("credential_fingerprint")?,
        error_message: r.try_get("error_message")?,
        created_at: r.try_get("created_at")?,
        updated_at: r.try_get("updated_at")?,
    })
}

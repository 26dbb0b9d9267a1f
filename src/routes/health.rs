use axum::extract::State;
use axum::http::StatusCode;
use axum::Json;
use serde::Serialize;

use crate::app_state::AppState;

#[derive(Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
    pub checks: HealthChecks,
}

#[derive(Serialize)]
pub struct HealthChecks {
    pub database: ComponentHealth,
    pub credentials: CredentialHealth,
    pub active_polls: usize,
}

#[derive(Serialize)]
pub struct ComponentHealth {
    pub status: String,
    pub latency_ms: Option<u64>,
}

#[derive(Serialize)]
pub struct CredentialHealth {
    pub status: String,
    pub configured: usize,
    pub ceiling: u32,
    /// Jobs in flight per credential, keyed by fingerprint prefix.
    pub in_use: Vec<CredentialUsage>,
}

#[derive(Serialize)]
pub struct CredentialUsage {
    pub credential: String,
    pub in_use: u32,
}

/// GET /health — ledger connectivity and credential pool occupancy.
pub async fn health_check(State(state): State<AppState>) -> (StatusCode, Json<HealthResponse>) {
    let start = std::time::Instant::now();

    let db_check = match sqlx::query("SELECT 1").execute(&state.db).await {
        Ok(_) => ComponentHealth {
            status: "ok".to_string(),
            latency_ms: Some(start.elapsed().as_millis() as u64),
        },
        Err(e) => {
            tracing::warn!(error = %e, "Ledger health check failed");
            ComponentHealth {
                status: "error".to_string(),
                latency_ms: None,
            }
        }
    };

    let pool = state.orchestrator.pool();
    let usage: Vec<CredentialUsage> = pool
        .snapshot()
        .into_iter()
        .map(|slot| CredentialUsage {
            credential: slot.tag,
            in_use: slot.in_use,
        })
        .collect();
    let saturated = usage.iter().all(|u| u.in_use >= pool.ceiling());
    let credentials = CredentialHealth {
        status: if pool.is_empty() {
            "error".to_string()
        } else if saturated {
            "saturated".to_string()
        } else {
            "ok".to_string()
        },
        configured: pool.len(),
        ceiling: pool.ceiling(),
        in_use: usage,
    };

    let all_healthy = db_check.status == "ok" && credentials.status != "error";
    let status_code = if all_healthy {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };

    let response = HealthResponse {
        status: if all_healthy {
            "ok".to_string()
        } else {
            "degraded".to_string()
        },
        version: env!("CARGO_PKG_VERSION").to_string(),
        checks: HealthChecks {
            database: db_check,
            credentials,
            active_polls: state.orchestrator.engine().in_flight_count(),
        },
    };

    (status_code, Json(response))
}

use reqwest::Client;
use sqlx::SqlitePool;

use crate::models::job::Orientation;
use crate::services::lifecycle::Orchestrator;

/// Shared application state passed to all route handlers.
#[derive(Clone)]
pub struct AppState {
    pub db: SqlitePool,
    pub orchestrator: Orchestrator,
    /// Client for fetching reference images.
    pub http: Client,
    pub default_prompt: String,
    pub default_orientation: Orientation,
}

impl AppState {
    pub fn new(
        db: SqlitePool,
        orchestrator: Orchestrator,
        http: Client,
        default_prompt: String,
        default_orientation: Orientation,
    ) -> Self {
        Self {
            db,
            orchestrator,
            http,
            default_prompt,
            default_orientation,
        }
    }
}

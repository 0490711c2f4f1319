use tracing::warn;

use crate::{dto::health::HealthResponse, state::SharedState};

/// Report `ok` while the storage backend answers, `degraded` otherwise.
pub async fn health_status(state: &SharedState) -> HealthResponse {
    match state.store().health_check().await {
        Ok(()) => HealthResponse::ok(),
        Err(err) => {
            warn!(error = %err, "storage health check failed");
            HealthResponse::degraded()
        }
    }
}

use axum::{Json, extract::State};

use beacon_types::api::{FederationSendRequest, SimpleResponse};

use crate::error::ApiError;
use crate::state::AppState;

/// Sign and queue one activity for a remote inbox.
pub async fn send_activity(
    State(state): State<AppState>,
    Json(req): Json<FederationSendRequest>,
) -> Result<Json<SimpleResponse>, ApiError> {
    let outbox = state.outbox.as_ref().ok_or(ApiError::FederationDisabled)?;
    outbox.deliver_activity(&req.inbox, &req.activity).await?;
    Ok(Json(SimpleResponse::ok(format!("queued for {}", req.inbox))))
}

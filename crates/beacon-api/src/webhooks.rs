use axum::{Json, extract::State};
use chrono::Utc;
use tracing::info;

use beacon_types::api::{CreateWebhookRequest, DeleteWebhookRequest, SimpleResponse};
use beacon_types::models::Webhook;

use crate::error::{ApiError, blocking};
use crate::state::AppState;

pub async fn list_webhooks(State(state): State<AppState>) -> Result<Json<Vec<Webhook>>, ApiError> {
    let db = state.db.clone();
    Ok(Json(blocking(move || db.get_webhooks()).await?))
}

pub async fn create_webhook(
    State(state): State<AppState>,
    Json(req): Json<CreateWebhookRequest>,
) -> Result<Json<Webhook>, ApiError> {
    let url = req.url.trim().to_string();
    if !(url.starts_with("http://") || url.starts_with("https://")) {
        return Err(ApiError::BadRequest("url must be http or https".into()));
    }
    if req.events.is_empty() {
        return Err(ApiError::BadRequest("at least one event is required".into()));
    }

    let db = state.db.clone();
    let (hook_url, events) = (url.clone(), req.events.clone());
    let id = blocking(move || db.insert_webhook(&hook_url, &events)).await?;

    info!("Added webhook {} for {}", id, url);

    Ok(Json(Webhook {
        id,
        url,
        events: req.events,
        timestamp: Utc::now(),
        last_used: None,
    }))
}

pub async fn delete_webhook(
    State(state): State<AppState>,
    Json(req): Json<DeleteWebhookRequest>,
) -> Result<Json<SimpleResponse>, ApiError> {
    let db = state.db.clone();
    let id = req.id;
    if !blocking(move || db.delete_webhook(id)).await? {
        return Err(ApiError::NotFound("webhook"));
    }
    Ok(Json(SimpleResponse::ok(format!("deleted webhook {}", id))))
}

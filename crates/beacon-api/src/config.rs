use axum::{
    Json,
    extract::{Path, State},
};
use tracing::info;

use beacon_chat::settings::is_chat_setting;
use beacon_types::api::{ConfigValueRequest, SimpleResponse};

use crate::error::{ApiError, blocking};
use crate::state::AppState;

/// Update one runtime chat setting. Takes effect on the next message.
pub async fn set_config_value(
    State(state): State<AppState>,
    Path(key): Path<String>,
    Json(req): Json<ConfigValueRequest>,
) -> Result<Json<SimpleResponse>, ApiError> {
    if !is_chat_setting(&key) {
        return Err(ApiError::NotFound("setting"));
    }
    let value = req
        .value
        .as_bool()
        .ok_or_else(|| ApiError::BadRequest(format!("{} expects a boolean", key)))?;

    let db = state.db.clone();
    let k = key.clone();
    blocking(move || db.set_config_bool(&k, value)).await?;

    info!("Config {} set to {}", key, value);
    Ok(Json(SimpleResponse::ok(format!("{} updated", key))))
}

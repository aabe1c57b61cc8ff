//! Chat moderation endpoints.

use axum::{Json, extract::State};

use std::net::IpAddr;

use beacon_types::api::{
    IpBanRequest, MessageVisibilityRequest, SendMessageRequest, SetUserEnabledRequest,
    SimpleResponse,
};
use beacon_types::events::Envelope;
use beacon_types::models::{ClientInfo, IpBan};

use crate::error::{ApiError, blocking};
use crate::state::AppState;

/// Every stored message, hidden ones included, newest first.
pub async fn get_messages(State(state): State<AppState>) -> Json<Vec<Envelope>> {
    let messages = state.chat.store().moderation_history().await;
    Json(messages.as_ref().clone())
}

pub async fn set_message_visibility(
    State(state): State<AppState>,
    Json(req): Json<MessageVisibilityRequest>,
) -> Result<Json<SimpleResponse>, ApiError> {
    if req.id_array.is_empty() {
        return Err(ApiError::BadRequest("idArray must not be empty".into()));
    }

    let updated = state
        .chat
        .set_messages_visibility(req.id_array, req.visible)
        .await;

    Ok(Json(SimpleResponse::ok(format!(
        "changed visibility of {} messages",
        updated.len()
    ))))
}

pub async fn set_user_enabled(
    State(state): State<AppState>,
    Json(req): Json<SetUserEnabledRequest>,
) -> Result<Json<SimpleResponse>, ApiError> {
    if !state.chat.set_user_enabled(&req.user_id, req.enabled).await {
        return Err(ApiError::NotFound("user"));
    }

    let verb = if req.enabled { "enabled" } else { "disabled" };
    Ok(Json(SimpleResponse::ok(format!("{} {}", req.user_id, verb))))
}

pub async fn get_clients(State(state): State<AppState>) -> Json<Vec<ClientInfo>> {
    Json(state.chat.hub().clients().await)
}

pub async fn send_system_message(
    State(state): State<AppState>,
    Json(req): Json<SendMessageRequest>,
) -> Result<Json<Envelope>, ApiError> {
    let body = non_empty(&req.body)?;
    Ok(Json(state.chat.send_system_message(body, false).await))
}

pub async fn send_action(
    State(state): State<AppState>,
    Json(req): Json<SendMessageRequest>,
) -> Result<Json<Envelope>, ApiError> {
    let body = non_empty(&req.body)?;
    Ok(Json(state.chat.send_action(body).await))
}

// -- IP bans --

pub async fn get_ip_bans(State(state): State<AppState>) -> Result<Json<Vec<IpBan>>, ApiError> {
    let db = state.db.clone();
    Ok(Json(blocking(move || db.get_ip_address_bans()).await?))
}

pub async fn ban_ip_address(
    State(state): State<AppState>,
    Json(req): Json<IpBanRequest>,
) -> Result<Json<SimpleResponse>, ApiError> {
    let address = parse_ip(&req.value)?;
    let note = req.note.filter(|n| !n.trim().is_empty());
    state.chat.ban_ip_address(&address, note).await?;
    Ok(Json(SimpleResponse::ok(format!("banned {}", address))))
}

pub async fn remove_ip_ban(
    State(state): State<AppState>,
    Json(req): Json<IpBanRequest>,
) -> Result<Json<SimpleResponse>, ApiError> {
    let address = parse_ip(&req.value)?;
    let db = state.db.clone();
    let ip = address.clone();
    if !blocking(move || db.remove_ip_address_ban(&ip)).await? {
        return Err(ApiError::NotFound("IP ban"));
    }
    Ok(Json(SimpleResponse::ok(format!("unbanned {}", address))))
}

/// Normalized so bans match the address seen at connect time.
fn parse_ip(value: &str) -> Result<String, ApiError> {
    value
        .trim()
        .parse::<IpAddr>()
        .map(|ip| ip.to_string())
        .map_err(|_| ApiError::BadRequest(format!("{} is not an IP address", value.trim())))
}

fn non_empty(body: &str) -> Result<&str, ApiError> {
    let body = body.trim();
    if body.is_empty() {
        return Err(ApiError::BadRequest("body must not be empty".into()));
    }
    Ok(body)
}

use axum::{Json, extract::State};
use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use chrono::Utc;
use rand_core::{OsRng, RngCore};
use tracing::info;
use uuid::Uuid;

use beacon_types::api::{RegisterRequest, RegisterResponse};
use beacon_types::events::Envelope;
use beacon_types::models::User;

use crate::error::{ApiError, blocking};
use crate::state::AppState;

const MAX_DISPLAY_NAME: usize = 30;
const DISPLAY_COLORS: u32 = 8;

/// Recent visible chat, oldest first.
pub async fn get_history(State(state): State<AppState>) -> Json<Vec<Envelope>> {
    Json(state.chat.store().history().await)
}

/// Create an anonymous chat user and hand back its access token.
pub async fn register(
    State(state): State<AppState>,
    body: Option<Json<RegisterRequest>>,
) -> Result<Json<RegisterResponse>, ApiError> {
    let req = body.map(|Json(req)| req).unwrap_or_default();

    let id = Uuid::new_v4().to_string();
    let display_name = match req.display_name.as_deref().map(str::trim) {
        Some(name) if !name.is_empty() => {
            if name.chars().count() > MAX_DISPLAY_NAME {
                return Err(ApiError::BadRequest("display name is too long".into()));
            }
            name.to_string()
        }
        _ => format!("Viewer-{}", &id[..6]),
    };

    let user = User {
        id: id.clone(),
        display_name: display_name.clone(),
        display_color: (OsRng.next_u32() % DISPLAY_COLORS) as i32,
        created_at: Utc::now(),
        disabled_at: None,
        authenticated_at: None,
        scopes: vec![],
        is_bot: false,
    };
    let access_token = generate_token();

    let db = state.db.clone();
    let token = access_token.clone();
    blocking(move || db.create_user(&user, &token)).await?;

    info!("Registered chat user {} ({})", display_name, id);

    Ok(Json(RegisterResponse {
        id,
        access_token,
        display_name,
    }))
}

fn generate_token() -> String {
    let mut bytes = [0u8; 32];
    OsRng.fill_bytes(&mut bytes);
    URL_SAFE_NO_PAD.encode(bytes)
}

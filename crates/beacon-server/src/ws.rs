use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    extract::{ConnectInfo, Query, State, WebSocketUpgrade},
    http::{HeaderMap, StatusCode, header},
    response::{IntoResponse, Response},
};
use serde::Deserialize;
use tracing::{debug, error, info};

use beacon_chat::client::{self, ChatClient, ConnectionMeta, MAX_MESSAGE_SIZE};
use beacon_chat::hub::HubHandle;
use beacon_chat::transport::split_socket;
use beacon_db::Database;
use beacon_types::models::User;

#[derive(Clone)]
pub struct WsState {
    pub db: Arc<Database>,
    pub hub: HubHandle,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WsParams {
    access_token: String,
}

/// Outcome of checking a connecting peer before the upgrade.
#[derive(Debug)]
pub enum Admission {
    Allowed(User),
    UnknownToken,
    Disabled,
    BannedAddress,
}

/// Banned addresses are refused before the token is even looked at.
pub fn admit(db: &Database, access_token: &str, ip_address: &str) -> anyhow::Result<Admission> {
    if db.is_ip_address_banned(ip_address)? {
        return Ok(Admission::BannedAddress);
    }
    Ok(match db.get_user_by_access_token(access_token)? {
        None => Admission::UnknownToken,
        Some(user) if user.is_disabled() => Admission::Disabled,
        Some(user) => Admission::Allowed(user),
    })
}

/// Authenticate the access token at the HTTP layer, then hand the socket
/// to a chat session.
pub async fn ws_upgrade(
    State(state): State<WsState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    Query(params): Query<WsParams>,
    headers: HeaderMap,
    ws: WebSocketUpgrade,
) -> Response {
    let ip_address = addr.ip().to_string();

    let db = state.db.clone();
    let token = params.access_token;
    let ip = ip_address.clone();
    let user = match tokio::task::spawn_blocking(move || admit(&db, &token, &ip)).await {
        Ok(Ok(Admission::Allowed(user))) => user,
        Ok(Ok(Admission::UnknownToken)) => return StatusCode::UNAUTHORIZED.into_response(),
        Ok(Ok(Admission::Disabled)) => return StatusCode::FORBIDDEN.into_response(),
        Ok(Ok(Admission::BannedAddress)) => {
            debug!("Refused chat connection from banned address {}", ip_address);
            return StatusCode::FORBIDDEN.into_response();
        }
        Ok(Err(e)) => {
            error!("Failed to admit chat connection: {}", e);
            return StatusCode::INTERNAL_SERVER_ERROR.into_response();
        }
        Err(e) => {
            error!("spawn_blocking join error: {}", e);
            return StatusCode::INTERNAL_SERVER_ERROR.into_response();
        }
    };

    let meta = ConnectionMeta {
        ip_address,
        user_agent: headers
            .get(header::USER_AGENT)
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default()
            .to_string(),
        geo: None,
    };

    ws.max_message_size(MAX_MESSAGE_SIZE * 2)
        .on_upgrade(move |socket| async move {
            info!("{} ({}) connected to chat from {}", user.display_name, user.id, meta.ip_address);

            let (client, outbound) =
                ChatClient::new(user, meta, state.hub.clone(), state.db.clone());
            state.hub.register(client.clone()).await;

            let (sink, stream) = split_socket(socket);
            client::run(client, outbound, sink, stream).await;
        })
}

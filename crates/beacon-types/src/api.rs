use serde::{Deserialize, Serialize};

use crate::models::EventType;

// -- Chat --

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegisterRequest {
    #[serde(default)]
    pub display_name: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RegisterResponse {
    pub id: String,
    pub access_token: String,
    pub display_name: String,
}

// -- Moderation --

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageVisibilityRequest {
    pub id_array: Vec<String>,
    pub visible: bool,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SetUserEnabledRequest {
    pub user_id: String,
    pub enabled: bool,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SendMessageRequest {
    pub body: String,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct IpBanRequest {
    pub value: String,
    #[serde(default)]
    pub note: Option<String>,
}

// -- Webhooks --

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CreateWebhookRequest {
    pub url: String,
    pub events: Vec<EventType>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DeleteWebhookRequest {
    pub id: i64,
}

// -- Config --

#[derive(Debug, Deserialize)]
pub struct ConfigValueRequest {
    pub value: serde_json::Value,
}

// -- Federation --

#[derive(Debug, Deserialize)]
pub struct FederationSendRequest {
    pub inbox: String,
    pub activity: serde_json::Value,
}

/// Generic `{success, message}` reply used by admin mutations.
#[derive(Debug, Serialize)]
pub struct SimpleResponse {
    pub success: bool,
    pub message: String,
}

impl SimpleResponse {
    pub fn ok(message: impl Into<String>) -> Self {
        Self {
            success: true,
            message: message.into(),
        }
    }
}

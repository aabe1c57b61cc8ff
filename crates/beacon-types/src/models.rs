use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Scope granting chat moderation rights.
pub const SCOPE_MODERATOR: &str = "MODERATOR";

/// A chat participant as seen by other clients.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct User {
    pub id: String,
    pub display_name: String,
    pub display_color: i32,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub disabled_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub authenticated_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub scopes: Vec<String>,
    #[serde(default)]
    pub is_bot: bool,
}

impl User {
    pub fn is_moderator(&self) -> bool {
        self.scopes.iter().any(|s| s == SCOPE_MODERATOR)
    }

    pub fn is_authenticated(&self) -> bool {
        self.authenticated_at.is_some()
    }

    pub fn is_disabled(&self) -> bool {
        self.disabled_at.is_some()
    }
}

/// Coarse location attached to a connected client, resolved from its address.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GeoDetails {
    pub country_code: String,
    pub region_name: String,
    pub time_zone: String,
}

/// A live chat connection, as reported to administrators.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClientInfo {
    pub id: u64,
    pub user: User,
    pub connected_at: DateTime<Utc>,
    pub message_count: u64,
    pub user_agent: String,
    pub ip_address: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub geo: Option<GeoDetails>,
}

/// Event kinds a webhook destination can subscribe to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventType {
    #[serde(rename = "CHAT")]
    MessageSent,
    #[serde(rename = "USER_JOINED")]
    UserJoined,
    #[serde(rename = "VISIBILITY-UPDATE")]
    VisibilityToggled,
    #[serde(rename = "FEDIVERSE_ENGAGEMENT")]
    FediverseEngagement,
    #[serde(rename = "STREAM_STARTED")]
    StreamStarted,
    #[serde(rename = "STREAM_STOPPED")]
    StreamStopped,
    #[serde(rename = "STREAM_TITLE_UPDATED")]
    StreamTitleUpdated,
}

impl EventType {
    pub const ALL: [EventType; 7] = [
        EventType::MessageSent,
        EventType::UserJoined,
        EventType::VisibilityToggled,
        EventType::FediverseEngagement,
        EventType::StreamStarted,
        EventType::StreamStopped,
        EventType::StreamTitleUpdated,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::MessageSent => "CHAT",
            Self::UserJoined => "USER_JOINED",
            Self::VisibilityToggled => "VISIBILITY-UPDATE",
            Self::FediverseEngagement => "FEDIVERSE_ENGAGEMENT",
            Self::StreamStarted => "STREAM_STARTED",
            Self::StreamStopped => "STREAM_STOPPED",
            Self::StreamTitleUpdated => "STREAM_TITLE_UPDATED",
        }
    }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnknownEventType(pub String);

impl fmt::Display for UnknownEventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "unknown event type: {}", self.0)
    }
}

impl std::error::Error for UnknownEventType {}

impl FromStr for EventType {
    type Err = UnknownEventType;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .iter()
            .copied()
            .find(|e| e.as_str() == s)
            .ok_or_else(|| UnknownEventType(s.to_string()))
    }
}

/// A registered webhook destination.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Webhook {
    pub id: i64,
    pub url: String,
    pub events: Vec<EventType>,
    pub timestamp: DateTime<Utc>,
    pub last_used: Option<DateTime<Utc>>,
}

/// An address refused a chat connection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IpBan {
    pub ip_address: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notes: Option<String>,
    pub created_at: DateTime<Utc>,
}

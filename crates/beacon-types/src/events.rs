use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use uuid::Uuid;

use crate::models::{EventType, User};

/// A chat event as it travels over the WebSocket and into storage.
///
/// Every envelope carries a server-generated id and timestamp; the payload
/// is flattened next to them with a `type` discriminator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    pub id: String,
    pub timestamp: DateTime<Utc>,
    #[serde(flatten)]
    pub event: ChatEvent,
}

impl Envelope {
    /// Stamp a fresh id and the current time onto an event.
    pub fn new(event: ChatEvent) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            timestamp: Utc::now(),
            event,
        }
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }

    /// Hidden-at timestamp for user messages; other kinds can't be hidden.
    pub fn hidden_at(&self) -> Option<DateTime<Utc>> {
        match &self.event {
            ChatEvent::UserMessage { hidden_at, .. } => *hidden_at,
            _ => None,
        }
    }
}

/// Events sent from the server to chat clients.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all_fields = "camelCase")]
pub enum ChatEvent {
    /// A message typed by a chat participant
    #[serde(rename = "CHAT")]
    UserMessage {
        user: User,
        body: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        hidden_at: Option<DateTime<Utc>>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        client_id: Option<u64>,
    },

    /// A message from the server operator, shown with the server's name
    #[serde(rename = "SYSTEM")]
    SystemMessage { body: String },

    /// An italic status line ("so-and-so joined", policy notices)
    #[serde(rename = "CHAT_ACTION")]
    Action { body: String },

    /// Someone on a remote server followed this stream
    #[serde(rename = "FEDIVERSE_ENGAGEMENT_FOLLOW")]
    FediverseFollow(Engagement),

    /// Someone on a remote server liked a post from this stream
    #[serde(rename = "FEDIVERSE_ENGAGEMENT_LIKE")]
    FediverseLike(Engagement),

    /// Someone on a remote server boosted a post from this stream
    #[serde(rename = "FEDIVERSE_ENGAGEMENT_REPOST")]
    FediverseRepost(Engagement),

    /// Messages were hidden or shown by a moderator
    #[serde(rename = "VISIBILITY-UPDATE")]
    VisibilityUpdate { ids: Vec<String>, visible: bool },

    /// Sent once to a client right after it connects
    #[serde(rename = "CONNECTED_USER_INFO")]
    ConnectedUserInfo { user: User },

    /// A user opened a chat connection
    #[serde(rename = "USER_JOINED")]
    UserJoined { user: User },
}

impl ChatEvent {
    /// Stored type tag, matching the wire discriminator.
    pub fn type_name(&self) -> &'static str {
        match self {
            Self::UserMessage { .. } => "CHAT",
            Self::SystemMessage { .. } => "SYSTEM",
            Self::Action { .. } => "CHAT_ACTION",
            Self::FediverseFollow(_) => "FEDIVERSE_ENGAGEMENT_FOLLOW",
            Self::FediverseLike(_) => "FEDIVERSE_ENGAGEMENT_LIKE",
            Self::FediverseRepost(_) => "FEDIVERSE_ENGAGEMENT_REPOST",
            Self::VisibilityUpdate { .. } => "VISIBILITY-UPDATE",
            Self::ConnectedUserInfo { .. } => "CONNECTED_USER_INFO",
            Self::UserJoined { .. } => "USER_JOINED",
        }
    }

    /// Whether this kind of event belongs in chat history.
    pub fn is_persisted(&self) -> bool {
        matches!(
            self,
            Self::UserMessage { .. }
                | Self::SystemMessage { .. }
                | Self::Action { .. }
                | Self::FediverseFollow(_)
                | Self::FediverseLike(_)
                | Self::FediverseRepost(_)
        )
    }

    pub fn body(&self) -> Option<&str> {
        match self {
            Self::UserMessage { body, .. }
            | Self::SystemMessage { body }
            | Self::Action { body } => Some(body),
            Self::FediverseFollow(e) | Self::FediverseLike(e) | Self::FediverseRepost(e) => {
                Some(&e.body)
            }
            _ => None,
        }
    }
}

/// Which kind of remote engagement a fediverse event reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngagementKind {
    Follow,
    Like,
    Repost,
}

impl EngagementKind {
    pub fn into_event(self, engagement: Engagement) -> ChatEvent {
        match self {
            Self::Follow => ChatEvent::FediverseFollow(engagement),
            Self::Like => ChatEvent::FediverseLike(engagement),
            Self::Repost => ChatEvent::FediverseRepost(engagement),
        }
    }
}

/// Display data for a fediverse engagement shown in chat.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Engagement {
    pub body: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,
    pub link: String,
    /// Account name of the remote actor.
    pub title: String,
}

/// Payloads sent FROM chat clients TO the server.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "type")]
pub enum InboundMessage {
    #[serde(rename = "CHAT")]
    Chat { body: String },
}

/// Body of an outbound webhook POST.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct WebhookEvent {
    #[serde(rename = "type")]
    pub event_type: EventType,
    #[serde(rename = "eventData", skip_serializing_if = "Option::is_none")]
    pub event_data: Option<serde_json::Value>,
}

impl WebhookEvent {
    pub fn chat_message(envelope: &Envelope) -> Option<Self> {
        let ChatEvent::UserMessage { user, body, hidden_at, client_id } = &envelope.event else {
            return None;
        };
        Some(Self {
            event_type: EventType::MessageSent,
            event_data: Some(json!({
                "id": envelope.id,
                "timestamp": envelope.timestamp,
                "user": user,
                "body": body,
                "rawBody": body,
                "clientId": client_id,
                "visible": hidden_at.is_none(),
            })),
        })
    }

    pub fn user_joined(user: &User, client_id: u64) -> Self {
        Self {
            event_type: EventType::UserJoined,
            event_data: Some(json!({
                "user": user,
                "clientId": client_id,
                "timestamp": Utc::now(),
            })),
        }
    }

    pub fn visibility_toggled(envelope: &Envelope) -> Option<Self> {
        let ChatEvent::VisibilityUpdate { ids, visible } = &envelope.event else {
            return None;
        };
        Some(Self {
            event_type: EventType::VisibilityToggled,
            event_data: Some(json!({
                "id": envelope.id,
                "timestamp": envelope.timestamp,
                "ids": ids,
                "visible": visible,
            })),
        })
    }

    pub fn fediverse_engagement(envelope: &Envelope) -> Self {
        Self {
            event_type: EventType::FediverseEngagement,
            event_data: serde_json::to_value(envelope).ok(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn user() -> User {
        User {
            id: "u1".into(),
            display_name: "orca".into(),
            display_color: 2,
            created_at: Utc::now(),
            disabled_at: None,
            authenticated_at: None,
            scopes: vec![],
            is_bot: false,
        }
    }

    #[test]
    fn envelope_serializes_flat_with_type() {
        let env = Envelope::new(ChatEvent::UserMessage {
            user: user(),
            body: "hello".into(),
            hidden_at: None,
            client_id: Some(7),
        });
        let value: serde_json::Value = serde_json::to_value(&env).unwrap();
        assert_eq!(value["type"], "CHAT");
        assert_eq!(value["id"], env.id);
        assert_eq!(value["body"], "hello");
        assert_eq!(value["clientId"], 7);
        assert!(value.get("hiddenAt").is_none());
        assert_eq!(value["user"]["displayName"], "orca");
    }

    #[test]
    fn visibility_update_wire_form() {
        let env = Envelope::new(ChatEvent::VisibilityUpdate {
            ids: vec!["e1".into()],
            visible: false,
        });
        let back: Envelope = serde_json::from_str(&env.to_json().unwrap()).unwrap();
        assert_eq!(back, env);
        assert!(env.to_json().unwrap().contains("\"VISIBILITY-UPDATE\""));
    }

    #[test]
    fn fresh_envelopes_get_distinct_ids() {
        let a = Envelope::new(ChatEvent::Action { body: "x".into() });
        let b = Envelope::new(ChatEvent::Action { body: "x".into() });
        assert_ne!(a.id, b.id);
    }

    #[test]
    fn inbound_parses_chat_and_rejects_unknown() {
        let msg: InboundMessage = serde_json::from_str(r#"{"type":"CHAT","body":"hi"}"#).unwrap();
        assert_eq!(msg, InboundMessage::Chat { body: "hi".into() });
        assert!(serde_json::from_str::<InboundMessage>(r#"{"type":"EXPLODE"}"#).is_err());
        assert!(serde_json::from_str::<InboundMessage>("not json").is_err());
    }

    #[test]
    fn only_history_kinds_are_persisted() {
        assert!(ChatEvent::SystemMessage { body: "x".into() }.is_persisted());
        assert!(!ChatEvent::UserJoined { user: user() }.is_persisted());
        assert!(
            !ChatEvent::VisibilityUpdate { ids: vec![], visible: true }.is_persisted()
        );
    }

    #[test]
    fn chat_webhook_payload_reports_visibility() {
        let env = Envelope::new(ChatEvent::UserMessage {
            user: user(),
            body: "hey".into(),
            hidden_at: None,
            client_id: None,
        });
        let hook = WebhookEvent::chat_message(&env).unwrap();
        let value = serde_json::to_value(&hook).unwrap();
        assert_eq!(value["type"], "CHAT");
        assert_eq!(value["eventData"]["visible"], true);
        assert_eq!(value["eventData"]["id"], env.id);
        assert!(WebhookEvent::visibility_toggled(&env).is_none());
    }
}

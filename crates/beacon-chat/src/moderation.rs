use std::sync::Arc;

use beacon_db::Database;
use beacon_dispatch::webhooks::WebhookNotifier;
use beacon_types::events::{ChatEvent, Engagement, EngagementKind, Envelope, WebhookEvent};
use chrono::Utc;
use tracing::{error, info, warn};

use crate::hub::HubHandle;
use crate::store::ChatStore;

/// Administrative chat operations: moderation and server-originated messages.
#[derive(Clone)]
pub struct ChatService {
    db: Arc<Database>,
    store: Arc<ChatStore>,
    hub: HubHandle,
    webhooks: WebhookNotifier,
}

impl ChatService {
    pub fn new(
        db: Arc<Database>,
        store: Arc<ChatStore>,
        hub: HubHandle,
        webhooks: WebhookNotifier,
    ) -> Self {
        Self {
            db,
            store,
            hub,
            webhooks,
        }
    }

    pub fn store(&self) -> &Arc<ChatStore> {
        &self.store
    }

    pub fn hub(&self) -> &HubHandle {
        &self.hub
    }

    /// Hide or show messages, tell every client and notify webhooks.
    /// Returns the ids that were updated.
    pub async fn set_messages_visibility(&self, ids: Vec<String>, visible: bool) -> Vec<String> {
        let updated = self.store.set_visibility(ids, visible).await;
        self.announce_visibility(&updated, visible).await;
        updated
    }

    /// Hide or show everything a user has written.
    pub async fn set_user_visibility(&self, user_id: &str, visible: bool) -> Vec<String> {
        let updated = self.store.set_visibility_for_user(user_id, visible).await;
        self.announce_visibility(&updated, visible).await;
        updated
    }

    async fn announce_visibility(&self, ids: &[String], visible: bool) {
        if ids.is_empty() {
            return;
        }

        let envelope = Envelope::new(ChatEvent::VisibilityUpdate {
            ids: ids.to_vec(),
            visible,
        });
        self.hub.broadcast_event(&envelope).await;

        if let Some(event) = WebhookEvent::visibility_toggled(&envelope) {
            self.notify(event).await;
        }
    }

    /// Enable or disable a user. Disabling hides their messages and drops
    /// their live connections. Returns false for an unknown user.
    pub async fn set_user_enabled(&self, user_id: &str, enabled: bool) -> bool {
        let db = self.db.clone();
        let id = user_id.to_string();
        let disabled_at = if enabled { None } else { Some(Utc::now()) };
        let found = match tokio::task::spawn_blocking(move || db.set_user_disabled(&id, disabled_at))
            .await
        {
            Ok(Ok(found)) => found,
            Ok(Err(e)) => {
                error!("Failed to update user {}: {}", user_id, e);
                return false;
            }
            Err(e) => {
                error!("spawn_blocking join error: {}", e);
                return false;
            }
        };
        if !found {
            return false;
        }

        self.set_user_visibility(user_id, enabled).await;
        if !enabled {
            self.hub.disconnect_user(user_id).await;
        }

        info!(
            "User {} {}",
            user_id,
            if enabled { "enabled" } else { "disabled" }
        );
        true
    }

    /// Ban an address and drop every session connected from it.
    pub async fn ban_ip_address(&self, address: &str, notes: Option<String>) -> anyhow::Result<()> {
        let db = self.db.clone();
        let ip = address.to_string();
        tokio::task::spawn_blocking(move || db.ban_ip_address(&ip, notes.as_deref())).await??;

        self.hub.disconnect_address(address).await;
        info!("Banned IP address {}", address);
        Ok(())
    }

    /// Broadcast a system message, persisting it unless `ephemeral`.
    pub async fn send_system_message(&self, body: &str, ephemeral: bool) -> Envelope {
        let envelope = Envelope::new(ChatEvent::SystemMessage {
            body: body.to_string(),
        });
        self.publish(&envelope, !ephemeral).await;
        envelope
    }

    pub async fn send_action(&self, body: &str) -> Envelope {
        let envelope = Envelope::new(ChatEvent::Action {
            body: body.to_string(),
        });
        self.publish(&envelope, true).await;
        envelope
    }

    /// Announce a follow, like or repost from a federated server.
    pub async fn send_fediverse_engagement(
        &self,
        kind: EngagementKind,
        engagement: Engagement,
    ) -> Envelope {
        let envelope = Envelope::new(kind.into_event(engagement));
        self.publish(&envelope, true).await;
        self.notify(WebhookEvent::fediverse_engagement(&envelope)).await;
        envelope
    }

    async fn publish(&self, envelope: &Envelope, persist: bool) {
        if persist {
            self.store.save_event(envelope).await;
        }
        self.hub.broadcast_event(envelope).await;
    }

    async fn notify(&self, event: WebhookEvent) {
        if let Err(e) = self.webhooks.notify(event).await {
            warn!("Failed to queue webhook event: {}", e);
        }
    }
}

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use beacon_dispatch::webhooks::WebhookNotifier;
use beacon_types::events::{ChatEvent, Envelope, InboundMessage, WebhookEvent};
use beacon_types::models::{ClientInfo, User};
use chrono::{Duration, Utc};
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

use crate::client::{ChatClient, ClientId};
use crate::filter::MessageFilter;
use crate::settings::ChatSettings;
use crate::store::ChatStore;

const COMMAND_BUFFER: usize = 1024;

/// Webhook events waiting for the dispatch queue. Past this the hub drops
/// events rather than wait on a slow destination.
const WEBHOOK_BUFFER: usize = 256;

/// Accounts younger than this can't talk while established-users mode is on.
const ESTABLISHED_AFTER_MINUTES: i64 = 15;

pub const FILTERED_MESSAGE: &str =
    "Sorry, that message contained language that is not allowed in this chat.";
pub const NOT_ESTABLISHED_MESSAGE: &str =
    "This chat is currently only open to established users. Please try again later.";

pub enum HubCommand {
    Register(Arc<ChatClient>),
    Unregister(ClientId),
    Inbound {
        client: Arc<ChatClient>,
        data: String,
    },
    Broadcast(String),
    SendTo {
        client_id: ClientId,
        payload: String,
    },
    DisconnectUser {
        user_id: String,
    },
    DisconnectAddress {
        ip_address: String,
    },
    Clients(oneshot::Sender<Vec<ClientInfo>>),
    Shutdown,
}

/// Cheap cloneable front to the hub loop.
#[derive(Clone)]
pub struct HubHandle {
    tx: mpsc::Sender<HubCommand>,
    next_id: Arc<AtomicU64>,
}

impl HubHandle {
    /// A handle plus the command receiver it feeds.
    pub fn channel(capacity: usize) -> (Self, mpsc::Receiver<HubCommand>) {
        let (tx, rx) = mpsc::channel(capacity);
        let handle = Self {
            tx,
            next_id: Arc::new(AtomicU64::new(1)),
        };
        (handle, rx)
    }

    pub(crate) fn next_client_id(&self) -> ClientId {
        ClientId(self.next_id.fetch_add(1, Ordering::Relaxed))
    }

    pub async fn register(&self, client: Arc<ChatClient>) {
        self.command(HubCommand::Register(client)).await;
    }

    /// Never waits: called from `ChatClient::close`, which may run inside
    /// the hub loop itself.
    pub fn unregister(&self, id: ClientId) {
        match self.tx.try_send(HubCommand::Unregister(id)) {
            Ok(()) | Err(TrySendError::Closed(_)) => {}
            Err(TrySendError::Full(cmd)) => {
                let tx = self.tx.clone();
                tokio::spawn(async move {
                    let _ = tx.send(cmd).await;
                });
            }
        }
    }

    /// Hand a sanitized payload to the hub. False once the hub is gone.
    pub async fn inbound(&self, client: Arc<ChatClient>, data: String) -> bool {
        self.tx
            .send(HubCommand::Inbound { client, data })
            .await
            .is_ok()
    }

    pub async fn broadcast(&self, payload: String) {
        self.command(HubCommand::Broadcast(payload)).await;
    }

    pub async fn broadcast_event(&self, envelope: &Envelope) {
        match envelope.to_json() {
            Ok(json) => self.broadcast(json).await,
            Err(e) => warn!("Failed to serialize {} event: {}", envelope.event.type_name(), e),
        }
    }

    pub async fn send_to(&self, client_id: ClientId, payload: String) {
        self.command(HubCommand::SendTo { client_id, payload }).await;
    }

    pub async fn disconnect_user(&self, user_id: &str) {
        self.command(HubCommand::DisconnectUser {
            user_id: user_id.to_string(),
        })
        .await;
    }

    /// Drop every session connected from `ip_address`.
    pub async fn disconnect_address(&self, ip_address: &str) {
        self.command(HubCommand::DisconnectAddress {
            ip_address: ip_address.to_string(),
        })
        .await;
    }

    pub async fn clients(&self) -> Vec<ClientInfo> {
        let (reply, rx) = oneshot::channel();
        self.command(HubCommand::Clients(reply)).await;
        rx.await.unwrap_or_default()
    }

    pub async fn client_count(&self) -> usize {
        self.clients().await.len()
    }

    /// Stop the hub loop and close every connected session.
    pub async fn shutdown(&self) {
        self.command(HubCommand::Shutdown).await;
    }

    async fn command(&self, cmd: HubCommand) {
        if self.tx.send(cmd).await.is_err() {
            warn!("Chat hub is not running");
        }
    }
}

/// Owns the registry of connected clients. All registry changes happen on
/// the hub task, so the map needs no lock.
pub struct Hub {
    clients: HashMap<ClientId, Arc<ChatClient>>,
    store: Arc<ChatStore>,
    settings: Arc<dyn ChatSettings>,
    filter: Arc<dyn MessageFilter>,
    webhooks: WebhookNotifier,
}

impl Hub {
    pub fn new(
        store: Arc<ChatStore>,
        settings: Arc<dyn ChatSettings>,
        filter: Arc<dyn MessageFilter>,
        webhooks: WebhookNotifier,
    ) -> Self {
        Self {
            clients: HashMap::new(),
            store,
            settings,
            filter,
            webhooks,
        }
    }

    /// Start the hub loop. It runs until [`HubHandle::shutdown`].
    pub fn spawn(self) -> HubHandle {
        let (handle, rx) = HubHandle::channel(COMMAND_BUFFER);
        let relay = WebhookRelay::start(self.webhooks.clone(), WEBHOOK_BUFFER);
        tokio::spawn(self.run(rx, relay));
        handle
    }

    async fn run(mut self, mut rx: mpsc::Receiver<HubCommand>, relay: WebhookRelay) {
        info!("Chat hub started");

        while let Some(cmd) = rx.recv().await {
            match cmd {
                HubCommand::Shutdown => break,
                HubCommand::Register(client) => self.handle_register(client, &relay),
                HubCommand::Unregister(id) => self.handle_unregister(id),
                HubCommand::Inbound { client, data } => {
                    self.handle_inbound(client, data, &relay).await
                }
                HubCommand::Broadcast(payload) => self.broadcast(&payload),
                HubCommand::SendTo { client_id, payload } => {
                    if let Some(client) = self.clients.get(&client_id) {
                        client.send_payload(payload);
                    }
                }
                HubCommand::DisconnectUser { user_id } => {
                    self.disconnect_where(|c| c.user.id == user_id)
                }
                HubCommand::DisconnectAddress { ip_address } => {
                    self.disconnect_where(|c| c.meta.ip_address == ip_address)
                }
                HubCommand::Clients(reply) => {
                    let _ = reply.send(self.clients.values().map(|c| c.info()).collect());
                }
            }
        }

        for client in self.clients.values() {
            client.close();
        }
        self.clients.clear();
        info!("Chat hub stopped");
    }

    fn handle_register(&mut self, client: Arc<ChatClient>, relay: &WebhookRelay) {
        if client.is_closed() {
            return;
        }

        let user = client.user.clone();
        self.clients.insert(client.id, client.clone());

        client.send_event(&Envelope::new(ChatEvent::ConnectedUserInfo { user: user.clone() }));

        let joined = Envelope::new(ChatEvent::UserJoined { user: user.clone() });
        if let Ok(json) = joined.to_json() {
            for (id, other) in &self.clients {
                if *id != client.id {
                    other.send_payload(json.clone());
                }
            }
        }

        relay.forward(WebhookEvent::user_joined(&user, client.id.0));

        info!(
            "{} ({}) joined chat as client {}, {} connected",
            user.display_name,
            user.id,
            client.id,
            self.clients.len()
        );
    }

    fn handle_unregister(&mut self, id: ClientId) {
        if let Some(client) = self.clients.remove(&id) {
            debug!(
                "{} left chat (client {}), {} connected",
                client.user.display_name,
                id,
                self.clients.len()
            );
        }
    }

    async fn handle_inbound(
        &mut self,
        client: Arc<ChatClient>,
        data: String,
        relay: &WebhookRelay,
    ) {
        let message = match serde_json::from_str::<InboundMessage>(&data) {
            Ok(message) => message,
            Err(e) => {
                debug!(
                    "Client {} sent unreadable payload: {} -- raw: {}",
                    client.id,
                    e,
                    preview(&data)
                );
                return;
            }
        };

        match message {
            InboundMessage::Chat { body } => self.handle_chat(client, body, relay).await,
        }
    }

    async fn handle_chat(
        &mut self,
        client: Arc<ChatClient>,
        body: String,
        relay: &WebhookRelay,
    ) {
        let user = &client.user;
        let body = body.trim().to_string();
        if body.is_empty() || user.is_disabled() {
            return;
        }

        if self.settings.chat_disabled() && !user.is_moderator() {
            debug!("Chat is disabled, dropping message from {}", user.display_name);
            return;
        }

        if self.settings.established_users_only() && !is_established(user) {
            client.send_action(NOT_ESTABLISHED_MESSAGE);
            return;
        }

        if self.settings.slur_filter_enabled() && !self.filter.allow(&body) {
            client.send_action(FILTERED_MESSAGE);
            return;
        }

        client.record_message();

        let envelope = Envelope::new(ChatEvent::UserMessage {
            user: user.clone(),
            body,
            hidden_at: None,
            client_id: Some(client.id.0),
        });

        self.store.save_event(&envelope).await;

        match envelope.to_json() {
            Ok(json) => self.broadcast(&json),
            Err(e) => warn!("Failed to serialize chat message: {}", e),
        }

        if let Some(event) = WebhookEvent::chat_message(&envelope) {
            relay.forward(event);
        }
    }

    fn broadcast(&self, payload: &str) {
        for client in self.clients.values() {
            // Non-blocking; a full buffer only costs that client this payload
            client.send_payload(payload.to_string());
        }
    }

    fn disconnect_where(&mut self, pred: impl Fn(&ChatClient) -> bool) {
        let ids: Vec<ClientId> = self
            .clients
            .values()
            .filter(|c| pred(c))
            .map(|c| c.id)
            .collect();

        for id in ids {
            if let Some(client) = self.clients.remove(&id) {
                info!("Disconnecting {} (client {})", client.user.display_name, id);
                client.close();
            }
        }
    }
}

/// Hands webhook events from the hub to one long-lived task that feeds the
/// dispatch queue. The hub never waits on it: when the relay is backed up
/// the event is dropped with a warning.
pub struct WebhookRelay {
    tx: mpsc::Sender<WebhookEvent>,
}

impl WebhookRelay {
    pub fn start(webhooks: WebhookNotifier, capacity: usize) -> Self {
        let (tx, mut rx) = mpsc::channel::<WebhookEvent>(capacity.max(1));

        tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                // Waits here while the dispatch queue is full
                if let Err(e) = webhooks.notify(event).await {
                    warn!("Failed to queue webhook event: {}", e);
                }
            }
            debug!("Webhook relay stopped");
        });

        Self { tx }
    }

    /// Returns false if the event was dropped.
    pub fn forward(&self, event: WebhookEvent) -> bool {
        match self.tx.try_send(event) {
            Ok(()) => true,
            Err(TrySendError::Full(event)) => {
                warn!(
                    "Webhook relay is backed up, dropping {} event",
                    event.event_type.as_str()
                );
                false
            }
            Err(TrySendError::Closed(_)) => false,
        }
    }
}

fn preview(data: &str) -> &str {
    match data.char_indices().nth(200) {
        Some((end, _)) => &data[..end],
        None => data,
    }
}

fn is_established(user: &User) -> bool {
    user.is_moderator()
        || user.is_authenticated()
        || Utc::now() - user.created_at >= Duration::minutes(ESTABLISHED_AFTER_MINUTES)
}

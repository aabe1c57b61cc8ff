use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use beacon_chat::client::{self, ChatClient, ConnectionMeta};
use beacon_chat::filter::WordListFilter;
use beacon_chat::hub::Hub;
use beacon_chat::moderation::ChatService;
use beacon_chat::store::ChatStore;
use beacon_chat::transport::Frame;
use beacon_db::Database;
use beacon_dispatch::DispatchError;
use beacon_dispatch::queue::{Deliver, QueueSizing};
use beacon_dispatch::webhooks::{WebhookDelivery, WebhookNotifier};
use beacon_types::events::{ChatEvent, Envelope};
use beacon_types::models::{EventType, User};
use chrono::Utc;
use futures_util::StreamExt;
use futures::channel::mpsc;

#[derive(Default)]
struct Recorder {
    events: Mutex<Vec<EventType>>,
}

#[async_trait]
impl Deliver<WebhookDelivery> for Recorder {
    async fn deliver(&self, _url: &str, delivery: WebhookDelivery) -> Result<(), DispatchError> {
        self.events.lock().unwrap().push(delivery.event.event_type);
        Ok(())
    }
}

struct Peer {
    client: Arc<ChatClient>,
    to_server: mpsc::UnboundedSender<Result<Frame, String>>,
    from_server: mpsc::UnboundedReceiver<Frame>,
}

impl Peer {
    fn say(&self, body: &str) {
        let json = serde_json::json!({"type": "CHAT", "body": body}).to_string();
        self.to_server.unbounded_send(Ok(Frame::Text(json))).unwrap();
    }

    /// Read frames until an event of `kind` shows up.
    async fn expect(&mut self, kind: &str) -> Envelope {
        let wait = async {
            loop {
                let text = match self.from_server.next().await {
                    Some(Frame::Text(text)) => text,
                    Some(_) => continue,
                    None => panic!("connection closed while waiting for {}", kind),
                };
                for line in text.split('\n') {
                    let env: Envelope = serde_json::from_str(line).unwrap();
                    if env.event.type_name() == kind {
                        return env;
                    }
                }
            }
        };
        tokio::time::timeout(Duration::from_secs(5), wait)
            .await
            .unwrap_or_else(|_| panic!("no {} event arrived", kind))
    }
}

fn user(db: &Database, id: &str) -> User {
    let user = User {
        id: id.into(),
        display_name: format!("viewer-{}", id),
        display_color: 5,
        created_at: Utc::now(),
        disabled_at: None,
        authenticated_at: None,
        scopes: vec![],
        is_bot: false,
    };
    db.create_user(&user, &format!("token-{}", id)).unwrap();
    user
}

struct Server {
    db: Arc<Database>,
    service: ChatService,
    recorder: Arc<Recorder>,
}

fn server() -> Server {
    let db = Arc::new(Database::open_in_memory().unwrap());
    db.insert_webhook(
        "http://hooks.test/chat",
        &[EventType::MessageSent, EventType::VisibilityToggled],
    )
    .unwrap();

    let recorder = Arc::new(Recorder::default());
    let webhooks =
        WebhookNotifier::with_deliverer(db.clone(), QueueSizing::new(1, 16), recorder.clone());
    let store = Arc::new(ChatStore::new(db.clone()));
    let hub = Hub::new(
        store.clone(),
        db.clone(),
        Arc::new(WordListFilter::default()),
        webhooks.clone(),
    )
    .spawn();
    let service = ChatService::new(db.clone(), store, hub, webhooks);

    Server {
        db,
        service,
        recorder,
    }
}

async fn connect(server: &Server, id: &str) -> Peer {
    connect_from(server, id, "198.51.100.1").await
}

async fn connect_from(server: &Server, id: &str, ip_address: &str) -> Peer {
    let meta = ConnectionMeta {
        ip_address: ip_address.into(),
        ..ConnectionMeta::default()
    };
    let (client, outbound) = ChatClient::new(
        user(&server.db, id),
        meta,
        server.service.hub().clone(),
        server.db.clone(),
    );
    let (to_server, stream) = mpsc::unbounded();
    let (sink, from_server) = mpsc::unbounded();

    server.service.hub().register(client.clone()).await;
    tokio::spawn(client::run(client.clone(), outbound, sink, stream));

    let mut peer = Peer {
        client,
        to_server,
        from_server,
    };
    peer.expect("CONNECTED_USER_INFO").await;
    peer
}

#[tokio::test]
async fn hidden_message_leaves_history_but_stays_in_moderation_view() {
    let server = server();
    let mut alice = connect(&server, "alice").await;
    let mut bob = connect(&server, "bob").await;

    alice.say("hello");
    let e1 = bob.expect("CHAT").await;
    assert_eq!(e1.event.body(), Some("hello"));
    alice.expect("CHAT").await;

    let store = server.service.store();
    assert_eq!(store.history().await.len(), 1);

    let updated = server
        .service
        .set_messages_visibility(vec![e1.id.clone()], false)
        .await;
    assert_eq!(updated, vec![e1.id.clone()]);

    for peer in [&mut alice, &mut bob] {
        let update = peer.expect("VISIBILITY-UPDATE").await;
        assert_eq!(
            update.event,
            ChatEvent::VisibilityUpdate {
                ids: vec![e1.id.clone()],
                visible: false,
            }
        );
    }

    assert!(store.history().await.is_empty());
    let moderation = store.moderation_history().await;
    assert_eq!(moderation.len(), 1);
    assert_eq!(moderation[0].id, e1.id);
    assert!(moderation[0].hidden_at().is_some());

    // Chat and visibility webhooks are fired off the hub task
    tokio::time::sleep(Duration::from_millis(100)).await;
    let events = server.recorder.events.lock().unwrap().clone();
    assert!(events.contains(&EventType::MessageSent));
    assert!(events.contains(&EventType::VisibilityToggled));
}

#[tokio::test]
async fn disabling_a_user_hides_their_messages_and_disconnects_them() {
    let server = server();
    let mut alice = connect(&server, "alice").await;
    let mut bob = connect(&server, "bob").await;

    alice.say("spam spam");
    bob.expect("CHAT").await;

    assert!(server.service.set_user_enabled("alice", false).await);
    let update = bob.expect("VISIBILITY-UPDATE").await;
    assert!(matches!(update.event, ChatEvent::VisibilityUpdate { visible: false, .. }));

    // The write pump answers a closed session with a close frame
    let closed = tokio::time::timeout(Duration::from_secs(5), async {
        while let Some(frame) = alice.from_server.next().await {
            if frame == Frame::Close {
                return true;
            }
        }
        false
    })
    .await
    .unwrap();
    assert!(closed);
    assert!(alice.client.is_closed());
    assert_eq!(server.service.hub().client_count().await, 1);

    assert!(!server.service.set_user_enabled("nobody", false).await);
}

#[tokio::test]
async fn system_messages_persist_unless_ephemeral() {
    let server = server();
    let mut alice = connect(&server, "alice").await;

    server.service.send_system_message("Stream starting soon", false).await;
    server.service.send_system_message("Just passing through", true).await;
    alice.expect("SYSTEM").await;

    let history = server.service.store().history().await;
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].event.body(), Some("Stream starting soon"));
}

#[tokio::test]
async fn banning_an_address_drops_its_sessions_and_is_recorded() {
    let server = server();
    let mut alice = connect_from(&server, "alice", "203.0.113.9").await;
    let bob = connect_from(&server, "bob", "198.51.100.20").await;

    server
        .service
        .ban_ip_address("203.0.113.9", Some("ban evasion".into()))
        .await
        .unwrap();

    let closed = tokio::time::timeout(Duration::from_secs(5), async {
        while let Some(frame) = alice.from_server.next().await {
            if frame == Frame::Close {
                return true;
            }
        }
        false
    })
    .await
    .unwrap();
    assert!(closed);
    assert!(!bob.client.is_closed());
    assert_eq!(server.service.hub().client_count().await, 1);

    assert!(server.db.is_ip_address_banned("203.0.113.9").unwrap());
    let bans = server.db.get_ip_address_bans().unwrap();
    assert_eq!(bans.len(), 1);
    assert_eq!(bans[0].notes.as_deref(), Some("ban evasion"));
}

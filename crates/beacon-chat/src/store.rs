use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use beacon_db::Database;
use beacon_db::models::{MessageRow, NewMessage};
use beacon_types::events::{ChatEvent, Engagement, Envelope};
use chrono::Utc;
use tracing::{debug, error, info, warn};

/// Messages returned to chat clients on join.
pub const HISTORY_LIMIT: u32 = 50;

/// How often the pruner checks for expired messages.
pub const PRUNE_INTERVAL: Duration = Duration::from_secs(5 * 60);

#[derive(Default)]
struct HistoryCache {
    /// Bumped on every write so a slow reader can't store stale results.
    generation: u64,
    entries: Option<Arc<Vec<Envelope>>>,
}

/// Chat persistence plus the moderation view of it.
///
/// Every write invalidates the cached moderation history. Database failures
/// are logged and surface as empty results so live chat keeps flowing.
pub struct ChatStore {
    db: Arc<Database>,
    cache: Mutex<HistoryCache>,
}

impl ChatStore {
    pub fn new(db: Arc<Database>) -> Self {
        Self {
            db,
            cache: Mutex::new(HistoryCache::default()),
        }
    }

    fn cache(&self) -> MutexGuard<'_, HistoryCache> {
        self.cache.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn invalidate(&self) {
        let mut cache = self.cache();
        cache.generation += 1;
        cache.entries = None;
    }

    /// Run a blocking database call off the async workers.
    async fn blocking<F, T>(&self, what: &str, f: F) -> Option<T>
    where
        F: FnOnce(&Database) -> anyhow::Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let db = self.db.clone();
        match tokio::task::spawn_blocking(move || f(&db)).await {
            Ok(Ok(value)) => Some(value),
            Ok(Err(e)) => {
                error!("Failed to {}: {}", what, e);
                None
            }
            Err(e) => {
                error!("spawn_blocking join error while trying to {}: {}", what, e);
                None
            }
        }
    }

    /// Persist a chat event. Ephemeral kinds are ignored.
    pub async fn save_event(&self, envelope: &Envelope) {
        if !envelope.event.is_persisted() {
            return;
        }

        let envelope = envelope.clone();
        self.blocking("save chat event", move |db| {
            db.insert_message(&new_message(&envelope))
        })
        .await;
        self.invalidate();
    }

    /// Hide or show messages. Returns the ids that exist.
    pub async fn set_visibility(&self, ids: Vec<String>, visible: bool) -> Vec<String> {
        if ids.is_empty() {
            return vec![];
        }

        let hidden_at = if visible { None } else { Some(Utc::now()) };
        let updated = self
            .blocking("update message visibility", move |db| {
                db.set_messages_hidden_at(&ids, hidden_at)
            })
            .await
            .unwrap_or_default();
        self.invalidate();
        updated
    }

    /// Hide or show everything `user_id` has written.
    pub async fn set_visibility_for_user(&self, user_id: &str, visible: bool) -> Vec<String> {
        let user_id = user_id.to_string();
        let ids = self
            .blocking("look up user messages", move |db| {
                db.get_message_ids_for_user(&user_id)
            })
            .await
            .unwrap_or_default();
        self.set_visibility(ids, visible).await
    }

    /// Recent visible messages from enabled users, oldest first.
    pub async fn history(&self) -> Vec<Envelope> {
        let rows = self
            .blocking("load chat history", |db| db.get_visible_messages(HISTORY_LIMIT))
            .await
            .unwrap_or_default();

        let mut history = to_envelopes(rows);
        history.reverse();
        history
    }

    /// Every stored message including hidden ones, newest first.
    pub async fn moderation_history(&self) -> Arc<Vec<Envelope>> {
        let generation = {
            let cache = self.cache();
            if let Some(entries) = &cache.entries {
                return entries.clone();
            }
            cache.generation
        };

        let rows = self
            .blocking("load moderation history", |db| db.get_all_messages())
            .await
            .unwrap_or_default();
        let entries = Arc::new(to_envelopes(rows));

        let mut cache = self.cache();
        if cache.generation == generation {
            cache.entries = Some(entries.clone());
        }
        entries
    }

    pub async fn messages_from_user(&self, user_id: &str) -> Vec<Envelope> {
        let user_id = user_id.to_string();
        let rows = self
            .blocking("load user messages", move |db| db.get_messages_from_user(&user_id))
            .await
            .unwrap_or_default();
        to_envelopes(rows)
    }

    pub async fn message_count(&self) -> i64 {
        self.blocking("count messages", |db| db.get_message_count())
            .await
            .unwrap_or_default()
    }

    /// Delete messages older than `max_age`. Returns how many went.
    pub async fn prune_older_than(&self, max_age: chrono::Duration) -> usize {
        let cutoff = Utc::now() - max_age;
        let removed = self
            .blocking("prune chat messages", move |db| db.delete_messages_before(cutoff))
            .await
            .unwrap_or_default();
        if removed > 0 {
            self.invalidate();
        }
        removed
    }
}

/// Background task that deletes chat messages older than `max_age`.
pub async fn run_prune_loop(store: Arc<ChatStore>, max_age: chrono::Duration, every: Duration) {
    let mut interval = tokio::time::interval(every);

    loop {
        interval.tick().await;

        let removed = store.prune_older_than(max_age).await;
        if removed > 0 {
            info!("Pruned {} chat messages", removed);
        }
    }
}

fn new_message(envelope: &Envelope) -> NewMessage<'_> {
    let base = NewMessage {
        id: &envelope.id,
        event_type: envelope.event.type_name(),
        body: envelope.event.body().unwrap_or_default(),
        timestamp: envelope.timestamp,
        ..Default::default()
    };

    match &envelope.event {
        ChatEvent::UserMessage {
            user, hidden_at, ..
        } => NewMessage {
            user_id: Some(&user.id),
            hidden_at: *hidden_at,
            ..base
        },
        ChatEvent::FediverseFollow(e) | ChatEvent::FediverseLike(e) | ChatEvent::FediverseRepost(e) => {
            NewMessage {
                image: e.image.as_deref(),
                link: Some(&e.link),
                title: Some(&e.title),
                ..base
            }
        }
        _ => base,
    }
}

fn to_envelopes(rows: Vec<MessageRow>) -> Vec<Envelope> {
    rows.into_iter().filter_map(envelope_from_row).collect()
}

fn envelope_from_row(row: MessageRow) -> Option<Envelope> {
    let engagement = |row: &MessageRow| Engagement {
        body: row.body.clone(),
        image: row.image.clone(),
        link: row.link.clone().unwrap_or_default(),
        title: row.title.clone().unwrap_or_default(),
    };

    let event = match row.event_type.as_str() {
        "CHAT" => {
            let Some(user) = row.author.clone() else {
                warn!("Chat message {} has no author, skipping", row.id);
                return None;
            };
            ChatEvent::UserMessage {
                user,
                body: row.body.clone(),
                hidden_at: row.hidden_at,
                client_id: None,
            }
        }
        "SYSTEM" => ChatEvent::SystemMessage {
            body: row.body.clone(),
        },
        "CHAT_ACTION" => ChatEvent::Action {
            body: row.body.clone(),
        },
        "FEDIVERSE_ENGAGEMENT_FOLLOW" => ChatEvent::FediverseFollow(engagement(&row)),
        "FEDIVERSE_ENGAGEMENT_LIKE" => ChatEvent::FediverseLike(engagement(&row)),
        "FEDIVERSE_ENGAGEMENT_REPOST" => ChatEvent::FediverseRepost(engagement(&row)),
        other => {
            debug!("Skipping stored message {} of unknown type {}", row.id, other);
            return None;
        }
    };

    Some(Envelope {
        id: row.id,
        timestamp: row.timestamp,
        event,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use beacon_types::models::User;

    fn setup() -> (Arc<Database>, ChatStore, User) {
        let db = Arc::new(Database::open_in_memory().unwrap());
        let user = User {
            id: "u1".into(),
            display_name: "orca".into(),
            display_color: 3,
            created_at: Utc::now(),
            disabled_at: None,
            authenticated_at: None,
            scopes: vec![],
            is_bot: false,
        };
        db.create_user(&user, "tok").unwrap();
        let store = ChatStore::new(db.clone());
        (db, store, user)
    }

    fn said(user: &User, body: &str) -> Envelope {
        Envelope::new(ChatEvent::UserMessage {
            user: user.clone(),
            body: body.into(),
            hidden_at: None,
            client_id: Some(1),
        })
    }

    #[tokio::test]
    async fn visibility_round_trip() {
        let (_db, store, user) = setup();
        let e1 = said(&user, "first");
        let e2 = said(&user, "second");
        store.save_event(&e1).await;
        store.save_event(&e2).await;

        let hidden = store.set_visibility(vec![e1.id.clone()], false).await;
        assert_eq!(hidden, vec![e1.id.clone()]);
        let ids: Vec<String> = store.history().await.into_iter().map(|e| e.id).collect();
        assert_eq!(ids, vec![e2.id.clone()]);

        store.set_visibility(vec![e1.id.clone()], true).await;
        let ids: Vec<String> = store.history().await.into_iter().map(|e| e.id).collect();
        assert_eq!(ids, vec![e1.id.clone(), e2.id.clone()]);
    }

    #[tokio::test]
    async fn moderation_cache_is_dropped_on_write() {
        let (_db, store, user) = setup();
        store.save_event(&said(&user, "one")).await;

        let first = store.moderation_history().await;
        let again = store.moderation_history().await;
        assert!(Arc::ptr_eq(&first, &again));

        let e2 = said(&user, "two");
        store.save_event(&e2).await;
        let fresh = store.moderation_history().await;
        assert_eq!(fresh.len(), 2);
        assert_eq!(fresh[0].id, e2.id);

        store.set_visibility(vec![e2.id.clone()], false).await;
        let after_hide = store.moderation_history().await;
        assert!(!Arc::ptr_eq(&fresh, &after_hide));
        assert!(after_hide[0].hidden_at().is_some());
    }

    #[tokio::test]
    async fn history_excludes_disabled_users_keeps_system_events() {
        let (db, store, user) = setup();
        store.save_event(&said(&user, "hi")).await;
        store
            .save_event(&Envelope::new(ChatEvent::SystemMessage {
                body: "Welcome".into(),
            }))
            .await;
        store
            .save_event(&Envelope::new(ChatEvent::FediverseLike(Engagement {
                body: "liked the stream".into(),
                image: None,
                link: "https://remote.example/@bob".into(),
                title: "bob".into(),
            })))
            .await;
        // Ephemeral events are never written
        store
            .save_event(&Envelope::new(ChatEvent::UserJoined { user: user.clone() }))
            .await;

        db.set_user_disabled(&user.id, Some(Utc::now())).unwrap();
        let history = store.history().await;
        let kinds: Vec<&str> = history.iter().map(|e| e.event.type_name()).collect();
        assert_eq!(kinds, vec!["SYSTEM", "FEDIVERSE_ENGAGEMENT_LIKE"]);
        assert_eq!(store.message_count().await, 3);
    }

    #[tokio::test]
    async fn user_visibility_and_empty_input() {
        let (_db, store, user) = setup();
        store.save_event(&said(&user, "a")).await;
        store.save_event(&said(&user, "b")).await;

        assert_eq!(store.set_visibility_for_user(&user.id, false).await.len(), 2);
        assert!(store.history().await.is_empty());
        assert_eq!(store.messages_from_user(&user.id).await.len(), 2);
        assert!(store.set_visibility(vec![], false).await.is_empty());
    }

    #[tokio::test]
    async fn prune_removes_old_messages() {
        let (_db, store, user) = setup();
        let mut old = said(&user, "ancient");
        old.timestamp = Utc::now() - chrono::Duration::hours(30);
        store.save_event(&old).await;
        store.save_event(&said(&user, "recent")).await;

        assert_eq!(store.prune_older_than(chrono::Duration::hours(24)).await, 1);
        assert_eq!(store.message_count().await, 1);
    }
}

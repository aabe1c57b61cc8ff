use std::collections::HashSet;

use crate::Database;
use crate::models::{MessageRow, NewMessage};
use anyhow::Result;
use beacon_types::models::{EventType, IpBan, User, Webhook};
use chrono::{DateTime, Utc};
use rusqlite::{Connection, Row};

/// Columns selected for every message query, in the order `message_from_row` expects.
const MESSAGE_COLUMNS: &str = "m.id, m.user_id, m.body, m.event_type, m.hidden_at, m.timestamp,
     m.image, m.link, m.title, m.subtitle,
     u.display_name, u.display_color, u.created_at, u.disabled_at,
     u.authenticated_at, u.scopes, u.type";

impl Database {
    // -- Users --

    pub fn create_user(&self, user: &User, access_token: &str) -> Result<()> {
        let scopes = user.scopes.join(",");
        let user_type = if user.is_bot { "API" } else { "STANDARD" };
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO users (id, display_name, display_color, access_token, created_at,
                                    disabled_at, authenticated_at, scopes, type)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
                rusqlite::params![
                    user.id,
                    user.display_name,
                    user.display_color,
                    access_token,
                    user.created_at,
                    user.disabled_at,
                    user.authenticated_at,
                    scopes,
                    user_type,
                ],
            )?;
            Ok(())
        })
    }

    pub fn get_user_by_id(&self, id: &str) -> Result<Option<User>> {
        self.with_conn(|conn| query_user(conn, "id", id))
    }

    pub fn get_user_by_access_token(&self, token: &str) -> Result<Option<User>> {
        self.with_conn(|conn| query_user(conn, "access_token", token))
    }

    /// Set or clear `disabled_at`. Returns false when the user doesn't exist.
    pub fn set_user_disabled(&self, id: &str, disabled_at: Option<DateTime<Utc>>) -> Result<bool> {
        self.with_conn(|conn| {
            let changed = conn.execute(
                "UPDATE users SET disabled_at = ?1 WHERE id = ?2",
                rusqlite::params![disabled_at, id],
            )?;
            Ok(changed > 0)
        })
    }

    // -- Messages --

    pub fn insert_message(&self, msg: &NewMessage<'_>) -> Result<()> {
        self.with_conn_mut(|conn| {
            let tx = conn.transaction()?;
            tx.execute(
                "INSERT INTO messages (id, user_id, body, event_type, hidden_at, timestamp,
                                       image, link, title, subtitle)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
                rusqlite::params![
                    msg.id,
                    msg.user_id,
                    msg.body,
                    msg.event_type,
                    msg.hidden_at,
                    msg.timestamp,
                    msg.image,
                    msg.link,
                    msg.title,
                    msg.subtitle,
                ],
            )?;
            tx.commit()?;
            Ok(())
        })
    }

    /// Set `hidden_at` for every listed message in one transaction.
    /// Returns the ids that matched a row.
    pub fn set_messages_hidden_at(
        &self,
        message_ids: &[String],
        hidden_at: Option<DateTime<Utc>>,
    ) -> Result<Vec<String>> {
        if message_ids.is_empty() {
            return Ok(vec![]);
        }

        self.with_conn_mut(|conn| {
            let mut seen = HashSet::new();
            let unique: Vec<&String> = message_ids
                .iter()
                .filter(|id| seen.insert(id.as_str()))
                .collect();

            let tx = conn.transaction()?;
            let mut affected = Vec::new();

            // Stay well under SQLite's bound variable limit
            for chunk in unique.chunks(ID_BATCH) {
                let id_params: Vec<&dyn rusqlite::types::ToSql> = chunk
                    .iter()
                    .map(|id| *id as &dyn rusqlite::types::ToSql)
                    .collect();

                {
                    let mut stmt = tx.prepare(&format!(
                        "SELECT id FROM messages WHERE id IN ({})",
                        placeholders(1, chunk.len())
                    ))?;
                    let found = stmt
                        .query_map(id_params.as_slice(), |row| row.get::<_, String>(0))?
                        .collect::<std::result::Result<Vec<_>, _>>()?;
                    affected.extend(found);
                }

                let mut update_params: Vec<&dyn rusqlite::types::ToSql> =
                    Vec::with_capacity(chunk.len() + 1);
                update_params.push(&hidden_at);
                update_params.extend(id_params);
                tx.execute(
                    &format!(
                        "UPDATE messages SET hidden_at = ?1 WHERE id IN ({})",
                        placeholders(2, chunk.len())
                    ),
                    update_params.as_slice(),
                )?;
            }
            tx.commit()?;

            Ok(affected)
        })
    }

    pub fn get_message_ids_for_user(&self, user_id: &str) -> Result<Vec<String>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare("SELECT id FROM messages WHERE user_id = ?1")?;
            let ids = stmt
                .query_map([user_id], |row| row.get(0))?
                .collect::<std::result::Result<Vec<String>, _>>()?;
            Ok(ids)
        })
    }

    /// Newest-first visible messages whose author (if any) isn't disabled.
    pub fn get_visible_messages(&self, limit: u32) -> Result<Vec<MessageRow>> {
        self.with_conn(|conn| {
            query_messages(
                conn,
                "WHERE m.hidden_at IS NULL AND u.disabled_at IS NULL
                 ORDER BY m.timestamp DESC, m.rowid DESC LIMIT ?1",
                rusqlite::params![limit],
            )
        })
    }

    /// Every stored message, newest first, regardless of visibility.
    pub fn get_all_messages(&self) -> Result<Vec<MessageRow>> {
        self.with_conn(|conn| {
            query_messages(conn, "ORDER BY m.timestamp DESC, m.rowid DESC", [])
        })
    }

    pub fn get_messages_from_user(&self, user_id: &str) -> Result<Vec<MessageRow>> {
        self.with_conn(|conn| {
            query_messages(
                conn,
                "WHERE m.user_id = ?1 ORDER BY m.timestamp DESC, m.rowid DESC",
                [user_id],
            )
        })
    }

    pub fn get_message_count(&self) -> Result<i64> {
        self.with_conn(|conn| {
            Ok(conn.query_row("SELECT COUNT(*) FROM messages", [], |row| row.get(0))?)
        })
    }

    /// Delete messages older than `cutoff`. Returns the number removed.
    pub fn delete_messages_before(&self, cutoff: DateTime<Utc>) -> Result<usize> {
        self.with_conn(|conn| {
            Ok(conn.execute("DELETE FROM messages WHERE timestamp < ?1", [cutoff])?)
        })
    }

    // -- Webhooks --

    pub fn insert_webhook(&self, url: &str, events: &[EventType]) -> Result<i64> {
        let events = join_events(events);
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO webhooks (url, events, timestamp) VALUES (?1, ?2, ?3)",
                rusqlite::params![url, events, Utc::now()],
            )?;
            Ok(conn.last_insert_rowid())
        })
    }

    /// Returns false when no webhook has that id.
    pub fn delete_webhook(&self, id: i64) -> Result<bool> {
        self.with_conn(|conn| {
            let deleted = conn.execute("DELETE FROM webhooks WHERE id = ?1", [id])?;
            Ok(deleted > 0)
        })
    }

    pub fn get_webhooks(&self) -> Result<Vec<Webhook>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id, url, events, timestamp, last_used FROM webhooks ORDER BY id",
            )?;
            let rows = stmt
                .query_map([], webhook_from_row)?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            Ok(rows)
        })
    }

    /// Webhooks subscribed to `event`.
    pub fn get_webhooks_for_event(&self, event: EventType) -> Result<Vec<Webhook>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id, url, events, timestamp, last_used FROM webhooks
                 WHERE ',' || events || ',' LIKE '%,' || ?1 || ',%'
                 ORDER BY id",
            )?;
            let rows = stmt
                .query_map([event.as_str()], webhook_from_row)?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            Ok(rows)
        })
    }

    pub fn set_webhook_used(&self, id: i64) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute(
                "UPDATE webhooks SET last_used = ?1 WHERE id = ?2",
                rusqlite::params![Utc::now(), id],
            )?;
            Ok(())
        })
    }

    // -- IP bans --

    /// Ban an address. Banning it again replaces the note.
    pub fn ban_ip_address(&self, address: &str, notes: Option<&str>) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO ip_bans (ip_address, notes, created_at) VALUES (?1, ?2, ?3)
                 ON CONFLICT(ip_address) DO UPDATE SET notes = excluded.notes",
                rusqlite::params![address, notes, Utc::now()],
            )?;
            Ok(())
        })
    }

    pub fn is_ip_address_banned(&self, address: &str) -> Result<bool> {
        self.with_conn(|conn| {
            let banned: bool = conn.query_row(
                "SELECT EXISTS(SELECT 1 FROM ip_bans WHERE ip_address = ?1)",
                [address],
                |row| row.get(0),
            )?;
            Ok(banned)
        })
    }

    pub fn get_ip_address_bans(&self) -> Result<Vec<IpBan>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT ip_address, notes, created_at FROM ip_bans ORDER BY created_at DESC",
            )?;
            let bans = stmt
                .query_map([], |row| {
                    Ok(IpBan {
                        ip_address: row.get(0)?,
                        notes: row.get(1)?,
                        created_at: row.get(2)?,
                    })
                })?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            Ok(bans)
        })
    }

    /// Returns false if the address was not banned.
    pub fn remove_ip_address_ban(&self, address: &str) -> Result<bool> {
        self.with_conn(|conn| {
            let removed = conn.execute("DELETE FROM ip_bans WHERE ip_address = ?1", [address])?;
            Ok(removed > 0)
        })
    }

    // -- Config --

    pub fn get_config_value(&self, key: &str) -> Result<Option<String>> {
        self.with_conn(|conn| {
            conn.query_row("SELECT value FROM config WHERE key = ?1", [key], |row| row.get(0))
                .optional()
        })
    }

    pub fn set_config_value(&self, key: &str, value: &str) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO config (key, value) VALUES (?1, ?2)
                 ON CONFLICT(key) DO UPDATE SET value = excluded.value",
                [key, value],
            )?;
            Ok(())
        })
    }

    /// Boolean setting, falling back to `default` when unset or unreadable.
    pub fn get_config_bool(&self, key: &str, default: bool) -> bool {
        match self.get_config_value(key) {
            Ok(Some(v)) => v == "true",
            Ok(None) => default,
            Err(e) => {
                tracing::warn!("Failed to read config {}: {}", key, e);
                default
            }
        }
    }

    pub fn set_config_bool(&self, key: &str, value: bool) -> Result<()> {
        self.set_config_value(key, if value { "true" } else { "false" })
    }
}

fn query_user(conn: &Connection, column: &str, value: &str) -> Result<Option<User>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT id, display_name, display_color, created_at, disabled_at, authenticated_at,
                scopes, type
         FROM users WHERE {} = ?1",
        column
    ))?;

    stmt.query_row([value], |row| {
        Ok(User {
            id: row.get(0)?,
            display_name: row.get(1)?,
            display_color: row.get(2)?,
            created_at: row.get(3)?,
            disabled_at: row.get(4)?,
            authenticated_at: row.get(5)?,
            scopes: split_scopes(row.get::<_, String>(6)?),
            is_bot: row.get::<_, String>(7)? == "API",
        })
    })
    .optional()
}

fn query_messages<P: rusqlite::Params>(
    conn: &Connection,
    tail: &str,
    params: P,
) -> Result<Vec<MessageRow>> {
    // LEFT JOIN keeps author-less system and fediverse events
    let mut stmt = conn.prepare(&format!(
        "SELECT {} FROM messages m LEFT JOIN users u ON m.user_id = u.id {}",
        MESSAGE_COLUMNS, tail
    ))?;

    let rows = stmt
        .query_map(params, message_from_row)?
        .collect::<std::result::Result<Vec<_>, _>>()?;

    Ok(rows)
}

fn message_from_row(row: &Row<'_>) -> rusqlite::Result<MessageRow> {
    let user_id: Option<String> = row.get(1)?;
    let display_name: Option<String> = row.get(10)?;

    let author = match (&user_id, display_name) {
        (Some(id), Some(display_name)) => Some(User {
            id: id.clone(),
            display_name,
            display_color: row.get::<_, Option<i32>>(11)?.unwrap_or_default(),
            created_at: row.get::<_, Option<DateTime<Utc>>>(12)?.unwrap_or_default(),
            disabled_at: row.get(13)?,
            authenticated_at: row.get(14)?,
            scopes: split_scopes(row.get::<_, Option<String>>(15)?.unwrap_or_default()),
            is_bot: row.get::<_, Option<String>>(16)?.as_deref() == Some("API"),
        }),
        _ => None,
    };

    Ok(MessageRow {
        id: row.get(0)?,
        user_id,
        body: row.get(2)?,
        event_type: row.get(3)?,
        hidden_at: row.get(4)?,
        timestamp: row.get(5)?,
        image: row.get(6)?,
        link: row.get(7)?,
        title: row.get(8)?,
        subtitle: row.get(9)?,
        author,
    })
}

fn webhook_from_row(row: &Row<'_>) -> rusqlite::Result<Webhook> {
    let events: String = row.get(2)?;
    Ok(Webhook {
        id: row.get(0)?,
        url: row.get(1)?,
        events: events.split(',').filter_map(|e| e.parse().ok()).collect(),
        timestamp: row.get(3)?,
        last_used: row.get(4)?,
    })
}

/// `?start, ?start+1, ...` for an IN clause of `count` values.
/// Ids bound per statement in bulk updates.
const ID_BATCH: usize = 500;

fn placeholders(start: usize, count: usize) -> String {
    (start..start + count)
        .map(|i| format!("?{}", i))
        .collect::<Vec<_>>()
        .join(", ")
}

fn split_scopes(scopes: String) -> Vec<String> {
    scopes
        .split(',')
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

fn join_events(events: &[EventType]) -> String {
    events.iter().map(EventType::as_str).collect::<Vec<_>>().join(",")
}

/// Extension trait for optional query results
trait OptionalExt<T> {
    fn optional(self) -> Result<Option<T>>;
}

impl<T> OptionalExt<T> for std::result::Result<T, rusqlite::Error> {
    fn optional(self) -> Result<Option<T>> {
        match self {
            Ok(val) => Ok(Some(val)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn user(id: &str) -> User {
        User {
            id: id.to_string(),
            display_name: format!("name-{}", id),
            display_color: 4,
            created_at: Utc::now(),
            disabled_at: None,
            authenticated_at: None,
            scopes: vec!["MODERATOR".into()],
            is_bot: false,
        }
    }

    fn insert(db: &Database, id: &str, user_id: Option<&str>, ts: DateTime<Utc>) {
        db.insert_message(&NewMessage {
            id,
            user_id,
            body: "body",
            event_type: if user_id.is_some() { "CHAT" } else { "SYSTEM" },
            timestamp: ts,
            ..Default::default()
        })
        .unwrap();
    }

    #[test]
    fn user_roundtrip_by_token() {
        let db = Database::open_in_memory().unwrap();
        db.create_user(&user("u1"), "tok").unwrap();

        let found = db.get_user_by_access_token("tok").unwrap().unwrap();
        assert_eq!(found.id, "u1");
        assert!(found.is_moderator());
        assert!(db.get_user_by_access_token("nope").unwrap().is_none());

        assert!(db.set_user_disabled("u1", Some(Utc::now())).unwrap());
        assert!(db.get_user_by_id("u1").unwrap().unwrap().is_disabled());
        assert!(!db.set_user_disabled("ghost", None).unwrap());
    }

    #[test]
    fn hidden_at_update_reports_matched_ids() {
        let db = Database::open_in_memory().unwrap();
        db.create_user(&user("u1"), "tok").unwrap();
        insert(&db, "a", Some("u1"), Utc::now());
        insert(&db, "b", Some("u1"), Utc::now());

        let ids = vec!["a".to_string(), "missing".to_string()];
        let affected = db.set_messages_hidden_at(&ids, Some(Utc::now())).unwrap();
        assert_eq!(affected, vec!["a".to_string()]);

        let visible: Vec<String> = db
            .get_visible_messages(50)
            .unwrap()
            .into_iter()
            .map(|m| m.id)
            .collect();
        assert_eq!(visible, vec!["b".to_string()]);

        assert!(db.set_messages_hidden_at(&[], None).unwrap().is_empty());
    }

    #[test]
    fn hiding_more_ids_than_sqlite_binds_at_once() {
        let db = Database::open_in_memory().unwrap();
        db.create_user(&user("u1"), "tok").unwrap();
        let mut ids: Vec<String> = (0..40_000).map(|i| format!("missing-{}", i)).collect();
        for id in ["a", "b", "c"] {
            insert(&db, id, Some("u1"), Utc::now());
        }
        ids.insert(0, "a".into());
        ids.insert(20_000, "b".into());
        ids.push("c".into());

        let mut affected = db.set_messages_hidden_at(&ids, Some(Utc::now())).unwrap();
        affected.sort();
        assert_eq!(affected, vec!["a".to_string(), "b".to_string(), "c".to_string()]);
        assert!(db.get_visible_messages(50).unwrap().is_empty());
    }

    #[test]
    fn visible_messages_skip_disabled_authors_but_keep_system_events() {
        let db = Database::open_in_memory().unwrap();
        db.create_user(&user("u1"), "t1").unwrap();
        db.create_user(&user("u2"), "t2").unwrap();
        let now = Utc::now();
        insert(&db, "m1", Some("u1"), now - Duration::seconds(3));
        insert(&db, "m2", Some("u2"), now - Duration::seconds(2));
        insert(&db, "s1", None, now - Duration::seconds(1));

        db.set_user_disabled("u2", Some(now)).unwrap();

        let ids: Vec<String> = db.get_visible_messages(50).unwrap().into_iter().map(|m| m.id).collect();
        assert_eq!(ids, vec!["s1".to_string(), "m1".to_string()]);

        let all = db.get_all_messages().unwrap();
        assert_eq!(all.len(), 3);
        assert!(all.iter().find(|m| m.id == "s1").unwrap().author.is_none());
        assert_eq!(all.iter().find(|m| m.id == "m1").unwrap().author.as_ref().unwrap().id, "u1");
    }

    #[test]
    fn prune_and_count() {
        let db = Database::open_in_memory().unwrap();
        let now = Utc::now();
        insert(&db, "old", None, now - Duration::hours(5));
        insert(&db, "new", None, now);
        assert_eq!(db.get_message_count().unwrap(), 2);

        assert_eq!(db.delete_messages_before(now - Duration::hours(2)).unwrap(), 1);
        assert_eq!(db.get_message_count().unwrap(), 1);
    }

    #[test]
    fn ip_bans_roundtrip() {
        let db = Database::open_in_memory().unwrap();
        assert!(!db.is_ip_address_banned("203.0.113.7").unwrap());

        db.ban_ip_address("203.0.113.7", Some("spam")).unwrap();
        db.ban_ip_address("203.0.113.7", Some("spam again")).unwrap();
        db.ban_ip_address("2001:db8::1", None).unwrap();

        assert!(db.is_ip_address_banned("203.0.113.7").unwrap());
        let bans = db.get_ip_address_bans().unwrap();
        assert_eq!(bans.len(), 2);
        let v4 = bans.iter().find(|b| b.ip_address == "203.0.113.7").unwrap();
        assert_eq!(v4.notes.as_deref(), Some("spam again"));

        assert!(db.remove_ip_address_ban("203.0.113.7").unwrap());
        assert!(!db.remove_ip_address_ban("203.0.113.7").unwrap());
        assert!(!db.is_ip_address_banned("203.0.113.7").unwrap());
    }

    #[test]
    fn webhooks_filter_by_event() {
        let db = Database::open_in_memory().unwrap();
        let chat = db.insert_webhook("http://a", &[EventType::MessageSent]).unwrap();
        db.insert_webhook(
            "http://b",
            &[EventType::UserJoined, EventType::VisibilityToggled],
        )
        .unwrap();

        let hooks = db.get_webhooks_for_event(EventType::VisibilityToggled).unwrap();
        assert_eq!(hooks.len(), 1);
        assert_eq!(hooks[0].url, "http://b");
        assert_eq!(hooks[0].events.len(), 2);

        assert!(db.get_webhooks().unwrap()[0].last_used.is_none());
        db.set_webhook_used(chat).unwrap();
        assert!(db.get_webhooks().unwrap()[0].last_used.is_some());

        assert!(db.delete_webhook(chat).unwrap());
        assert!(!db.delete_webhook(chat).unwrap());
        assert_eq!(db.get_webhooks().unwrap().len(), 1);
    }

    #[test]
    fn config_values_upsert() {
        let db = Database::open_in_memory().unwrap();
        assert!(db.get_config_bool("chat_slur_filter_enabled", true));
        db.set_config_bool("chat_slur_filter_enabled", false).unwrap();
        assert!(!db.get_config_bool("chat_slur_filter_enabled", true));
        db.set_config_value("federation_username", "live").unwrap();
        db.set_config_value("federation_username", "stream").unwrap();
        assert_eq!(
            db.get_config_value("federation_username").unwrap().as_deref(),
            Some("stream")
        );
    }
}

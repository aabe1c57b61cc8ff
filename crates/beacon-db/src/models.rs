//! Row types for the SQLite tables. Kept apart from the beacon-types
//! event models so the wire format can change without a migration.

use chrono::{DateTime, Utc};

use beacon_types::models::User;

/// One row of the `messages` table, joined with its author when there is one.
#[derive(Debug, Clone)]
pub struct MessageRow {
    pub id: String,
    pub user_id: Option<String>,
    pub body: String,
    pub event_type: String,
    pub hidden_at: Option<DateTime<Utc>>,
    pub timestamp: DateTime<Utc>,
    pub image: Option<String>,
    pub link: Option<String>,
    pub title: Option<String>,
    pub subtitle: Option<String>,
    pub author: Option<User>,
}

/// Values for a single `messages` insert.
#[derive(Debug, Clone, Default)]
pub struct NewMessage<'a> {
    pub id: &'a str,
    pub user_id: Option<&'a str>,
    pub body: &'a str,
    pub event_type: &'a str,
    pub hidden_at: Option<DateTime<Utc>>,
    pub timestamp: DateTime<Utc>,
    pub image: Option<&'a str>,
    pub link: Option<&'a str>,
    pub title: Option<&'a str>,
    pub subtitle: Option<&'a str>,
}

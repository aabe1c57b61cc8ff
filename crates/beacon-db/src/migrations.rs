use anyhow::Result;
use rusqlite::Connection;
use tracing::info;

pub fn run(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS users (
            id                TEXT PRIMARY KEY,
            display_name      TEXT NOT NULL,
            display_color     INTEGER NOT NULL DEFAULT 0,
            access_token      TEXT NOT NULL UNIQUE,
            created_at        TEXT NOT NULL,
            disabled_at       TEXT,
            authenticated_at  TEXT,
            scopes            TEXT NOT NULL DEFAULT '',
            type              TEXT NOT NULL DEFAULT 'STANDARD'
        );

        CREATE TABLE IF NOT EXISTS messages (
            id          TEXT PRIMARY KEY,
            user_id     TEXT REFERENCES users(id),
            body        TEXT NOT NULL,
            event_type  TEXT NOT NULL,
            hidden_at   TEXT,
            timestamp   TEXT NOT NULL,
            image       TEXT,
            link        TEXT,
            title       TEXT,
            subtitle    TEXT
        );

        CREATE INDEX IF NOT EXISTS idx_messages_timestamp
            ON messages(timestamp);

        CREATE INDEX IF NOT EXISTS idx_messages_user
            ON messages(user_id);

        CREATE TABLE IF NOT EXISTS webhooks (
            id          INTEGER PRIMARY KEY AUTOINCREMENT,
            url         TEXT NOT NULL,
            events      TEXT NOT NULL,
            timestamp   TEXT NOT NULL,
            last_used   TEXT
        );

        CREATE TABLE IF NOT EXISTS ip_bans (
            ip_address  TEXT PRIMARY KEY,
            notes       TEXT,
            created_at  TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS config (
            key     TEXT PRIMARY KEY,
            value   TEXT NOT NULL
        );
        ",
    )?;

    info!("Database migrations complete");
    Ok(())
}

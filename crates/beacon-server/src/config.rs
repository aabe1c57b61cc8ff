use std::path::PathBuf;

use anyhow::Context;

/// Process configuration, read once at startup. Chat settings that can
/// change at runtime live in the database instead.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub db_path: PathBuf,
    pub admin_password: String,
    /// PEM file holding the PKCS#8 key used to sign federation requests.
    pub federation_key_path: Option<PathBuf>,
    pub federation_actor: Option<String>,
    pub prune_hours: i64,
    /// Comma or newline separated words rejected by the chat filter.
    pub filter_words: String,
}

impl ServerConfig {
    pub fn from_env() -> anyhow::Result<Self> {
        let port = var_or("BEACON_PORT", "8080")
            .parse()
            .context("BEACON_PORT must be a port number")?;
        let prune_hours = var_or("BEACON_PRUNE_HOURS", "2")
            .parse()
            .context("BEACON_PRUNE_HOURS must be a whole number of hours")?;

        Ok(Self {
            host: var_or("BEACON_HOST", "0.0.0.0"),
            port,
            db_path: PathBuf::from(var_or("BEACON_DB_PATH", "beacon.db")),
            admin_password: var_or("BEACON_ADMIN_PASSWORD", ""),
            federation_key_path: var("BEACON_FEDERATION_KEY_PATH").map(PathBuf::from),
            federation_actor: var("BEACON_FEDERATION_ACTOR"),
            prune_hours,
            filter_words: var_or("BEACON_CHAT_FILTER_WORDS", ""),
        })
    }
}

fn var(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.trim().is_empty())
}

fn var_or(key: &str, default: &str) -> String {
    var(key).unwrap_or_else(|| default.into())
}

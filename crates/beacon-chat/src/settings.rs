use beacon_db::Database;

pub const KEY_SPAM_PROTECTION: &str = "chat_spam_protection_enabled";
pub const KEY_SLUR_FILTER: &str = "chat_slur_filter_enabled";
pub const KEY_ESTABLISHED_ONLY: &str = "chat_established_users_only";
pub const KEY_CHAT_DISABLED: &str = "chat_disabled";

/// Runtime chat policy switches. Read on every inbound message, so
/// implementations should be cheap.
pub trait ChatSettings: Send + Sync + 'static {
    fn spam_protection_enabled(&self) -> bool;
    fn slur_filter_enabled(&self) -> bool;
    fn established_users_only(&self) -> bool;
    fn chat_disabled(&self) -> bool;
}

impl ChatSettings for Database {
    fn spam_protection_enabled(&self) -> bool {
        self.get_config_bool(KEY_SPAM_PROTECTION, true)
    }

    fn slur_filter_enabled(&self) -> bool {
        self.get_config_bool(KEY_SLUR_FILTER, false)
    }

    fn established_users_only(&self) -> bool {
        self.get_config_bool(KEY_ESTABLISHED_ONLY, false)
    }

    fn chat_disabled(&self) -> bool {
        self.get_config_bool(KEY_CHAT_DISABLED, false)
    }
}

/// Whether `key` names one of the boolean chat settings above.
pub fn is_chat_setting(key: &str) -> bool {
    matches!(
        key,
        KEY_SPAM_PROTECTION | KEY_SLUR_FILTER | KEY_ESTABLISHED_ONLY | KEY_CHAT_DISABLED
    )
}

use std::sync::Arc;

use beacon_chat::ChatService;
use beacon_db::Database;
use beacon_dispatch::federation::Outbox;

pub type AppState = Arc<AppStateInner>;

pub struct AppStateInner {
    pub db: Arc<Database>,
    pub chat: ChatService,
    /// `None` when no federation key is configured.
    pub outbox: Option<Outbox>,
    pub admin_password: String,
}

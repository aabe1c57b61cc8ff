pub mod client;
pub mod filter;
pub mod hub;
pub mod moderation;
pub mod settings;
pub mod store;
pub mod transport;

pub use client::{ChatClient, ClientId, ConnectionMeta};
pub use hub::{Hub, HubHandle};
pub use moderation::ChatService;
pub use store::ChatStore;

mod config;
mod ws;

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Context;
use axum::{Router, routing::get};
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use beacon_api::state::{AppState, AppStateInner};
use beacon_chat::filter::WordListFilter;
use beacon_chat::hub::Hub;
use beacon_chat::store::{self, ChatStore};
use beacon_chat::ChatService;
use beacon_dispatch::QueueSizing;
use beacon_dispatch::federation::{HttpSignatureSigner, Outbox};
use beacon_dispatch::webhooks::WebhookNotifier;

use crate::config::ServerConfig;
use crate::ws::{WsState, ws_upgrade};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env if present
    let _ = dotenvy::dotenv();

    // Init logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "beacon=debug,tower_http=debug".into()),
        )
        .init();

    let config = ServerConfig::from_env()?;
    if config.admin_password.is_empty() {
        warn!("BEACON_ADMIN_PASSWORD is not set, admin API is locked");
    }

    // Init database
    let db = Arc::new(beacon_db::Database::open(&config.db_path)?);
    let http = reqwest::Client::new();

    // Outbound delivery
    let known_webhooks = db.get_webhooks()?.len();
    let webhooks = WebhookNotifier::start(
        http.clone(),
        db.clone(),
        QueueSizing::for_fanout(known_webhooks, 1, 5),
    );
    let outbox = match (&config.federation_key_path, &config.federation_actor) {
        (Some(path), Some(actor)) => {
            let pem = std::fs::read_to_string(path)
                .with_context(|| format!("reading federation key {}", path.display()))?;
            let signer = HttpSignatureSigner::from_pem(actor, &pem)?;
            info!("Federation delivery enabled as {}", signer.key_id());
            Some(Outbox::start(http, Arc::new(signer), QueueSizing::from_parallelism()))
        }
        _ => {
            info!("Federation delivery disabled");
            None
        }
    };

    // Chat
    let filter = WordListFilter::parse(&config.filter_words);
    if !filter.is_empty() {
        info!("Chat filter loaded with {} words", filter.len());
    }
    let chat_store = Arc::new(ChatStore::new(db.clone()));
    let hub = Hub::new(chat_store.clone(), db.clone(), Arc::new(filter), webhooks.clone()).spawn();
    let chat = ChatService::new(db.clone(), chat_store.clone(), hub.clone(), webhooks);

    if config.prune_hours > 0 {
        tokio::spawn(store::run_prune_loop(
            chat_store,
            chrono::Duration::hours(config.prune_hours),
            store::PRUNE_INTERVAL,
        ));
    }

    let app_state: AppState = Arc::new(AppStateInner {
        db: db.clone(),
        chat,
        outbox,
        admin_password: config.admin_password.clone(),
    });

    // Routes
    let ws_route = Router::new()
        .route("/ws", get(ws_upgrade))
        .with_state(WsState {
            db: db.clone(),
            hub: hub.clone(),
        });

    let app = beacon_api::router(app_state)
        .merge(ws_route)
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http());

    let addr: SocketAddr = format!("{}:{}", config.host, config.port).parse()?;
    info!("Beacon server listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await?;

    hub.shutdown().await;
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();
    #[cfg(unix)]
    {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = ctrl_c => info!("Received Ctrl+C, shutting down..."),
                    _ = sigterm.recv() => info!("Received SIGTERM, shutting down..."),
                }
            }
            Err(e) => {
                warn!("Failed to install SIGTERM handler: {}", e);
                ctrl_c.await.ok();
                info!("Received Ctrl+C, shutting down...");
            }
        }
    }
    #[cfg(not(unix))]
    {
        ctrl_c.await.ok();
        info!("Received Ctrl+C, shutting down...");
    }
}

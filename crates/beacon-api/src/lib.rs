pub mod admin;
pub mod chat;
pub mod config;
pub mod error;
pub mod federation;
pub mod middleware;
pub mod state;
pub mod webhooks;

use axum::{
    Router, middleware as axum_middleware,
    routing::{get, post},
};

use crate::state::AppState;

/// Public chat routes plus the admin API behind `require_admin`.
pub fn router(state: AppState) -> Router {
    let public_routes = Router::new()
        .route("/api/chat", get(chat::get_history))
        .route("/api/chat/register", post(chat::register))
        .with_state(state.clone());

    let admin_routes = Router::new()
        .route("/api/admin/chat/messages", get(admin::get_messages))
        .route("/api/admin/chat/messagevisibility", post(admin::set_message_visibility))
        .route("/api/admin/chat/users/setenabled", post(admin::set_user_enabled))
        .route("/api/admin/chat/clients", get(admin::get_clients))
        .route("/api/admin/chat/users/ipbans", get(admin::get_ip_bans))
        .route("/api/admin/chat/users/ipbans/create", post(admin::ban_ip_address))
        .route("/api/admin/chat/users/ipbans/remove", post(admin::remove_ip_ban))
        .route("/api/admin/chat/send/system", post(admin::send_system_message))
        .route("/api/admin/chat/send/action", post(admin::send_action))
        .route("/api/admin/webhooks", get(webhooks::list_webhooks))
        .route("/api/admin/webhooks/create", post(webhooks::create_webhook))
        .route("/api/admin/webhooks/delete", post(webhooks::delete_webhook))
        .route("/api/admin/config/{key}", post(config::set_config_value))
        .route("/api/admin/federation/send", post(federation::send_activity))
        .layer(axum_middleware::from_fn_with_state(
            state.clone(),
            middleware::require_admin,
        ))
        .with_state(state);

    Router::new().merge(public_routes).merge(admin_routes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use axum::body::Body;
    use axum::http::{Request, StatusCode, header};
    use beacon_chat::filter::WordListFilter;
    use beacon_chat::hub::Hub;
    use beacon_chat::store::ChatStore;
    use beacon_chat::ChatService;
    use beacon_db::Database;
    use beacon_dispatch::queue::QueueSizing;
    use beacon_dispatch::webhooks::WebhookNotifier;
    use serde_json::{Value, json};
    use tower::ServiceExt;

    use crate::state::AppStateInner;

    const PASSWORD: &str = "letmein";

    fn app() -> (Router, Arc<Database>) {
        let db = Arc::new(Database::open_in_memory().unwrap());
        let webhooks =
            WebhookNotifier::start(reqwest::Client::new(), db.clone(), QueueSizing::new(1, 4));
        let store = Arc::new(ChatStore::new(db.clone()));
        let hub = Hub::new(
            store.clone(),
            db.clone(),
            Arc::new(WordListFilter::default()),
            webhooks.clone(),
        )
        .spawn();
        let state = Arc::new(AppStateInner {
            db: db.clone(),
            chat: ChatService::new(db.clone(), store, hub, webhooks),
            outbox: None,
            admin_password: PASSWORD.into(),
        });
        (router(state), db)
    }

    fn admin(method: &str, uri: &str, body: Value) -> Request<Body> {
        Request::builder()
            .method(method)
            .uri(uri)
            .header(header::AUTHORIZATION, format!("Bearer {}", PASSWORD))
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    async fn json_body(response: axum::response::Response) -> Value {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn admin_routes_require_password() {
        let (app, _) = app();

        let response = app
            .clone()
            .oneshot(
                Request::get("/api/admin/chat/messages")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

        let response = app
            .oneshot(
                Request::get("/api/admin/chat/messages")
                    .header(header::AUTHORIZATION, "Bearer wrong")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn register_then_history_shows_system_message() {
        let (app, db) = app();

        let response = app
            .clone()
            .oneshot(
                Request::post("/api/chat/register")
                    .header(header::CONTENT_TYPE, "application/json")
                    .body(Body::from(json!({"displayName": "otter"}).to_string()))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = json_body(response).await;
        assert_eq!(body["displayName"], "otter");
        let token = body["accessToken"].as_str().unwrap();
        assert!(db.get_user_by_access_token(token).unwrap().is_some());

        let response = app
            .clone()
            .oneshot(admin("POST", "/api/admin/chat/send/system", json!({"body": "hi all"})))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let response = app
            .oneshot(Request::get("/api/chat").body(Body::empty()).unwrap())
            .await
            .unwrap();
        let history = json_body(response).await;
        assert_eq!(history[0]["type"], "SYSTEM");
        assert_eq!(history[0]["body"], "hi all");
    }

    #[tokio::test]
    async fn webhook_crud_and_validation() {
        let (app, _) = app();

        let response = app
            .clone()
            .oneshot(admin(
                "POST",
                "/api/admin/webhooks/create",
                json!({"url": "ftp://nope", "events": ["CHAT"]}),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);

        let response = app
            .clone()
            .oneshot(admin(
                "POST",
                "/api/admin/webhooks/create",
                json!({"url": "https://hooks.example/x", "events": ["CHAT", "USER_JOINED"]}),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let id = json_body(response).await["id"].as_i64().unwrap();

        let response = app
            .clone()
            .oneshot(admin("POST", "/api/admin/webhooks/delete", json!({"id": id})))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let response = app
            .oneshot(admin("POST", "/api/admin/webhooks/delete", json!({"id": id})))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn config_and_federation_guards() {
        let (app, db) = app();

        let response = app
            .clone()
            .oneshot(admin(
                "POST",
                "/api/admin/config/chat_disabled",
                json!({"value": true}),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(db.get_config_value("chat_disabled").unwrap().as_deref(), Some("true"));

        let response = app
            .clone()
            .oneshot(admin("POST", "/api/admin/config/chat_disabled", json!({"value": "yes"})))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);

        let response = app
            .clone()
            .oneshot(admin("POST", "/api/admin/config/unknown", json!({"value": true})))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);

        let response = app
            .oneshot(admin(
                "POST",
                "/api/admin/federation/send",
                json!({"inbox": "https://remote.example/inbox", "activity": {"type": "Create"}}),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    }

    #[tokio::test]
    async fn ip_ban_lifecycle() {
        let (app, db) = app();

        let response = app
            .clone()
            .oneshot(admin(
                "POST",
                "/api/admin/chat/users/ipbans/create",
                json!({"value": "not-an-ip"}),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);

        let response = app
            .clone()
            .oneshot(admin(
                "POST",
                "/api/admin/chat/users/ipbans/create",
                json!({"value": " 203.0.113.7 ", "note": "flooding"}),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert!(db.is_ip_address_banned("203.0.113.7").unwrap());

        let response = app
            .clone()
            .oneshot(admin("GET", "/api/admin/chat/users/ipbans", json!({})))
            .await
            .unwrap();
        let bans = json_body(response).await;
        assert_eq!(bans[0]["ipAddress"], "203.0.113.7");
        assert_eq!(bans[0]["notes"], "flooding");

        let remove = json!({"value": "203.0.113.7"});
        let response = app
            .clone()
            .oneshot(admin("POST", "/api/admin/chat/users/ipbans/remove", remove.clone()))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let response = app
            .oneshot(admin("POST", "/api/admin/chat/users/ipbans/remove", remove))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn unknown_user_cannot_be_disabled() {
        let (app, _) = app();
        let response = app
            .oneshot(admin(
                "POST",
                "/api/admin/chat/users/setenabled",
                json!({"userId": "ghost", "enabled": false}),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }
}

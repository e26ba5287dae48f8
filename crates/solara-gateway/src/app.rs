use axum::{
    extract::DefaultBodyLimit,
    routing::{get, post},
    Router,
};
use solara_core::config::MAX_WEBHOOK_BODY_BYTES;
use solara_core::SolaraConfig;
use solara_pipeline::Pipeline;
use std::sync::Arc;

/// Central shared state, passed as Arc<AppState> to all Axum handlers.
pub struct AppState {
    pub config: SolaraConfig,
    pub pipeline: Pipeline,
}

impl AppState {
    pub fn new(config: SolaraConfig, pipeline: Pipeline) -> Self {
        Self { config, pipeline }
    }
}

/// Assemble the full Axum router.
pub fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(crate::http::health::health_handler))
        .route(
            "/webhooks/{source}",
            post(crate::http::webhooks::webhook_handler),
        )
        .route("/buffers", get(crate::http::buffers::list_handler))
        .route(
            "/buffers/{key}",
            get(crate::http::buffers::status_handler).delete(crate::http::buffers::clear_handler),
        )
        .route(
            "/buffers/{key}/flush",
            post(crate::http::buffers::flush_handler),
        )
        .layer(DefaultBodyLimit::max(MAX_WEBHOOK_BODY_BYTES))
        .with_state(state)
        .layer(tower_http::trace::TraceLayer::new_for_http())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::outbound::{LogSink, UnconfiguredDispatcher};
    use async_trait::async_trait;
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use serde_json::Value;
    use solara_core::config::{WebhookAuthMode, WebhookSourceConfig};
    use solara_identity::{ConversationIdentity, IdentityStore, MemoryIdentityStore, StoreError};
    use solara_pipeline::PipelineConfig;
    use std::sync::atomic::{AtomicBool, Ordering};
    use tower::ServiceExt;

    const SECRET: &str = "hook-secret";

    fn app_with(config: SolaraConfig) -> Router {
        app_with_store(config, Arc::new(MemoryIdentityStore::new()))
    }

    fn app_with_store(config: SolaraConfig, store: Arc<dyn IdentityStore>) -> Router {
        let pipeline = Pipeline::new(
            PipelineConfig::from(&config),
            store,
            Arc::new(UnconfiguredDispatcher),
            Arc::new(LogSink),
        );
        build_router(Arc::new(AppState::new(config, pipeline)))
    }

    /// Identity store that is down until `up` is set.
    #[derive(Default)]
    struct OutageStore {
        up: AtomicBool,
        inner: MemoryIdentityStore,
    }

    impl OutageStore {
        fn check(&self) -> Result<(), StoreError> {
            if self.up.load(Ordering::SeqCst) {
                Ok(())
            } else {
                Err(StoreError::Unavailable("database is locked".to_string()))
            }
        }
    }

    #[async_trait]
    impl IdentityStore for OutageStore {
        async fn find(&self, key: &str) -> Result<Option<ConversationIdentity>, StoreError> {
            self.check()?;
            self.inner.find(key).await
        }

        async fn insert_new(&self, key: &str) -> Result<ConversationIdentity, StoreError> {
            self.check()?;
            self.inner.insert_new(key).await
        }
    }

    fn test_app() -> Router {
        let mut config = SolaraConfig::default();
        config.webhooks.enabled = true;
        config.webhooks.sources = vec![
            WebhookSourceConfig {
                name: "whatsapp".to_string(),
                secret: Some(SECRET.to_string()),
                auth_mode: WebhookAuthMode::HmacSha256,
            },
            WebhookSourceConfig {
                name: "relay".to_string(),
                secret: Some("relay-token".to_string()),
                auth_mode: WebhookAuthMode::BearerToken,
            },
            WebhookSourceConfig {
                name: "internal".to_string(),
                secret: None,
                auth_mode: WebhookAuthMode::None,
            },
        ];
        app_with(config)
    }

    async fn send(app: &Router, req: Request<Body>) -> (StatusCode, Value) {
        let resp = app.clone().oneshot(req).await.unwrap();
        let status = resp.status();
        let body = axum::body::to_bytes(resp.into_body(), 64 * 1024)
            .await
            .unwrap();
        let json = serde_json::from_slice(&body).unwrap_or(Value::Null);
        (status, json)
    }

    fn signed_post(path: &str, body: &str) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri(path)
            .header("content-type", "application/json")
            .header(
                "x-hub-signature-256",
                crate::http::webhooks::sign(SECRET, body.as_bytes()),
            )
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    fn get(path: &str) -> Request<Body> {
        Request::builder().uri(path).body(Body::empty()).unwrap()
    }

    const EVENT: &str = r#"{"id":"wamid.1","conversation_key":"5511999999999","text":"Oi"}"#;

    #[tokio::test]
    async fn health_reports_ok() {
        let app = test_app();
        let (status, json) = send(&app, get("/health")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["status"], "ok");
        assert_eq!(json["buffering"], true);
        assert_eq!(json["active_buffers"], 0);
    }

    #[tokio::test]
    async fn webhooks_disabled_is_404() {
        let app = app_with(SolaraConfig::default());
        let (status, _) = send(&app, signed_post("/webhooks/whatsapp", EVENT)).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn unknown_source_is_404() {
        let app = test_app();
        let (status, _) = send(&app, signed_post("/webhooks/telegram", EVENT)).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn signed_event_is_buffered() {
        let app = test_app();
        let (status, json) = send(&app, signed_post("/webhooks/whatsapp", EVENT)).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["results"][0]["id"], "wamid.1");
        assert_eq!(json["results"][0]["outcome"], "buffered");

        let (_, status) = send(&app, get("/buffers/5511999999999")).await;
        assert_eq!(status["buffer_size"], 1);
        assert_eq!(status["has_active_timer"], true);
        assert_eq!(status["is_flushing"], false);

        let (_, list) = send(&app, get("/buffers")).await;
        assert_eq!(list["keys"][0], "5511999999999");
    }

    #[tokio::test]
    async fn redelivery_reported_as_duplicate() {
        let app = test_app();
        send(&app, signed_post("/webhooks/whatsapp", EVENT)).await;
        let (status, json) = send(&app, signed_post("/webhooks/whatsapp", EVENT)).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["results"][0]["outcome"], "duplicate");
    }

    #[tokio::test]
    async fn bad_signature_is_401() {
        let app = test_app();
        let req = Request::builder()
            .method("POST")
            .uri("/webhooks/whatsapp")
            .header("x-hub-signature-256", "sha256=00ff")
            .body(Body::from(EVENT))
            .unwrap();
        let (status, json) = send(&app, req).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert_eq!(json["code"], "AUTH_FAILED");
    }

    #[tokio::test]
    async fn bearer_source_requires_token() {
        let app = test_app();
        let missing = Request::builder()
            .method("POST")
            .uri("/webhooks/relay")
            .body(Body::from(EVENT))
            .unwrap();
        let (status, _) = send(&app, missing).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);

        let ok = Request::builder()
            .method("POST")
            .uri("/webhooks/relay")
            .header("authorization", "Bearer relay-token")
            .body(Body::from(EVENT))
            .unwrap();
        let (status, _) = send(&app, ok).await;
        assert_eq!(status, StatusCode::OK);
    }

    #[tokio::test]
    async fn invalid_body_is_400() {
        let app = test_app();
        let (status, json) = send(&app, signed_post("/webhooks/whatsapp", "{not json")).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(json["code"], "INVALID_EVENT");

        let (status, _) = send(&app, signed_post("/webhooks/whatsapp", "[]")).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn array_body_reports_each_message() {
        let app = test_app();
        let body = r#"[
            {"id":"a","conversation_key":"5511777777777","text":"Oi"},
            {"id":"b","conversation_key":"","text":"sem remetente"}
        ]"#;
        let req = Request::builder()
            .method("POST")
            .uri("/webhooks/internal")
            .body(Body::from(body))
            .unwrap();
        let (status, json) = send(&app, req).await;
        assert_eq!(status, StatusCode::OK);
        let results = json["results"].as_array().unwrap();
        assert_eq!(results.len(), 2);
        assert_eq!(results[0]["outcome"], "buffered");
        assert_eq!(results[1]["id"], "b");
        assert!(results[1]["error"].is_string());
    }

    #[tokio::test]
    async fn flush_and_clear_endpoints() {
        let app = test_app();
        send(&app, signed_post("/webhooks/whatsapp", EVENT)).await;

        let flush = Request::builder()
            .method("POST")
            .uri("/buffers/5511999999999/flush")
            .body(Body::empty())
            .unwrap();
        let (status, json) = send(&app, flush).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["outcome"], "flushed");
        assert_eq!(json["messages"], 1);
        assert_eq!(json["key"], "5511999999999");

        let again = Request::builder()
            .method("POST")
            .uri("/buffers/5511999999999/flush")
            .body(Body::empty())
            .unwrap();
        let (_, json) = send(&app, again).await;
        assert_eq!(json["outcome"], "empty");

        let second = r#"{"id":"wamid.2","conversation_key":"5511999999999","text":"Tudo bem?"}"#;
        send(&app, signed_post("/webhooks/whatsapp", second)).await;
        let clear = Request::builder()
            .method("DELETE")
            .uri("/buffers/5511999999999")
            .body(Body::empty())
            .unwrap();
        let (status, json) = send(&app, clear).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["discarded"], 1);

        let (_, status) = send(&app, get("/buffers/5511999999999")).await;
        assert_eq!(status["buffer_size"], 0);
        assert_eq!(status["has_active_timer"], false);
    }

    #[tokio::test]
    async fn identity_outage_asks_sender_to_redeliver() {
        let mut config = SolaraConfig::default();
        config.buffer.enabled = false;
        config.identity.max_attempts = 1;
        config.webhooks.enabled = true;
        config.webhooks.sources = vec![WebhookSourceConfig {
            name: "internal".to_string(),
            secret: None,
            auth_mode: WebhookAuthMode::None,
        }];
        let store = Arc::new(OutageStore::default());
        let app = app_with_store(config, store.clone());

        let post = || {
            Request::builder()
                .method("POST")
                .uri("/webhooks/internal")
                .body(Body::from(EVENT))
                .unwrap()
        };

        let (status, json) = send(&app, post()).await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(json["ok"], false);
        assert_eq!(json["results"][0]["retryable"], true);

        store.up.store(true, Ordering::SeqCst);
        let (status, json) = send(&app, post()).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["results"][0]["outcome"], "processed");
    }
}

//! # HTTP API
//!
//! Thin axum layer over the bridge. Each POST maps 1:1 to
//! [`TransportBridge::handle_inbound`]; malformed bodies are answered with
//! `400` before they reach the core.
//!
//! | Route                 | Body                    |
//! |-----------------------|-------------------------|
//! | `POST /api/emotion`   | `{"emotion": "happy"}`  |
//! | `POST /api/animation` | `{"animation": "none"}` |
//! | `POST /api/audio`     | `{"audio_url": "..."}`  |
//! | `POST /api/reload`    | ignored                 |
//! | `GET /api/state`      | -                       |
//! | `GET /healthcheck`    | -                       |
//! | `GET /metrics`        | -                       |
//! | `GET /ws`             | WebSocket upgrade       |
//!
//! Every request is logged by `tower_http`'s [`TraceLayer`] and timed into the
//! `http_request_duration_ms` histogram, see [`metrics`].

pub mod metrics;

use crate::bridge::{InboundKind, InboundSource, TransportBridge};
use crate::error::SyncError;
use crate::realtime::socket::websocket_handler;
use crate::state::Snapshot;
use axum::extract::rejection::JsonRejection;
use axum::extract::State;
use axum::http::StatusCode;
use axum::middleware;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use metrics_exporter_prometheus::PrometheusHandle;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tower_http::trace::{DefaultMakeSpan, DefaultOnResponse, TraceLayer};
use tracing::{info, Level};

type SharedBridge = Arc<TransportBridge>;

pub fn router(bridge: SharedBridge, metrics_handle: PrometheusHandle) -> Router {
    let metrics_routes = Router::new()
        .route("/metrics", get(metrics::metrics_handler))
        .with_state(metrics_handle);

    Router::new()
        .route("/api/emotion", post(set_emotion))
        .route("/api/animation", post(set_animation))
        .route("/api/audio", post(set_audio))
        .route("/api/reload", post(reload))
        .route("/api/state", get(current_state))
        .route("/healthcheck", get(healthcheck))
        .route("/ws", get(websocket_handler))
        .with_state(bridge)
        .merge(metrics_routes)
        .layer(middleware::from_fn(metrics::track_request_duration))
        .layer(
            TraceLayer::new_for_http()
                .make_span_with(DefaultMakeSpan::new().level(Level::INFO))
                .on_response(DefaultOnResponse::new().level(Level::INFO)),
        )
}

#[derive(Debug, Deserialize)]
struct EmotionRequest {
    emotion: String,
}

#[derive(Debug, Deserialize)]
struct AnimationRequest {
    animation: String,
}

#[derive(Debug, Deserialize)]
struct AudioRequest {
    #[serde(alias = "audioUrl")]
    audio_url: String,
}

#[derive(Debug, Serialize)]
struct StatusBody {
    status: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    reason: Option<String>,
}

impl StatusBody {
    fn success() -> Json<Self> {
        Json(Self {
            status: "success",
            reason: None,
        })
    }
}

/// Client-visible failure; always a 400 with a reason string
#[derive(Debug)]
struct ApiError(String);

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = StatusBody {
            status: "error",
            reason: Some(self.0),
        };
        (StatusCode::BAD_REQUEST, Json(body)).into_response()
    }
}

impl From<JsonRejection> for ApiError {
    fn from(rejection: JsonRejection) -> Self {
        ApiError(rejection.body_text())
    }
}

impl From<SyncError> for ApiError {
    fn from(err: SyncError) -> Self {
        ApiError(err.to_string())
    }
}

type ApiResult = Result<Json<StatusBody>, ApiError>;

async fn apply(bridge: &TransportBridge, kind: InboundKind, value: &str) -> ApiResult {
    info!("API: setting {} to {}", kind, value);
    bridge.handle_inbound(InboundSource::Api, kind, value).await?;
    Ok(StatusBody::success())
}

async fn set_emotion(
    State(bridge): State<SharedBridge>,
    body: Result<Json<EmotionRequest>, JsonRejection>,
) -> ApiResult {
    let Json(request) = body?;
    apply(&bridge, InboundKind::Emotion, &request.emotion).await
}

async fn set_animation(
    State(bridge): State<SharedBridge>,
    body: Result<Json<AnimationRequest>, JsonRejection>,
) -> ApiResult {
    let Json(request) = body?;
    apply(&bridge, InboundKind::Animation, &request.animation).await
}

async fn set_audio(
    State(bridge): State<SharedBridge>,
    body: Result<Json<AudioRequest>, JsonRejection>,
) -> ApiResult {
    let Json(request) = body?;
    apply(&bridge, InboundKind::Audio, &request.audio_url).await
}

async fn reload(State(bridge): State<SharedBridge>) -> ApiResult {
    bridge
        .handle_inbound(InboundSource::Api, InboundKind::Reload, "")
        .await?;
    Ok(StatusBody::success())
}

async fn current_state(State(bridge): State<SharedBridge>) -> Json<Snapshot> {
    Json(bridge.store().current_snapshot())
}

async fn healthcheck() -> Json<serde_json::Value> {
    Json(serde_json::json!({ "status": "ok" }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mqtt::message_manager::MqttMessage;
    use crate::realtime::{RealtimeEvent, RealtimeHub};
    use crate::state::store::StateStore;
    use crate::state::{Animation, Emotion};
    use axum::body::{to_bytes, Body};
    use axum::http::Request;
    use std::sync::OnceLock;
    use std::time::Duration;
    use tokio::sync::mpsc;
    use tower::ServiceExt;

    // The recorder is process-wide, every router in this test binary shares it
    fn metrics_handle() -> PrometheusHandle {
        static HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();
        HANDLE
            .get_or_init(|| super::metrics::init_metrics_recorder().unwrap())
            .clone()
    }

    fn app() -> (Router, SharedBridge, mpsc::Receiver<MqttMessage>) {
        let (store, _resets) = StateStore::new(Duration::from_secs(30));
        let (mqtt_out, published) = mpsc::channel(16);
        let bridge = Arc::new(TransportBridge::new(
            store,
            RealtimeHub::default(),
            mqtt_out,
            "avatar",
        ));
        (router(bridge.clone(), metrics_handle()), bridge, published)
    }

    fn post_json(uri: &str, body: &str) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri(uri)
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    async fn body_json(response: Response) -> serde_json::Value {
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn post_emotion_updates_state() {
        let (app, bridge, mut published) = app();

        let response = app
            .oneshot(post_json("/api/emotion", r#"{"emotion": "happy"}"#))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_json(response).await["status"], "success");
        assert_eq!(bridge.store().current_snapshot().state.emotion, Emotion::Happy);
        assert_eq!(published.try_recv().unwrap().topic, "avatar/emotion/state");
    }

    #[tokio::test]
    async fn post_animation_accepts_wire_literal() {
        let (app, bridge, _published) = app();

        let response = app
            .oneshot(post_json("/api/animation", r#"{"animation": "silly_dancing"}"#))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            bridge.store().current_snapshot().state.animation,
            Animation::Dancing
        );
    }

    #[tokio::test]
    async fn post_audio_accepts_camel_case_key() {
        let (app, bridge, _published) = app();

        let response = app
            .oneshot(post_json("/api/audio", r#"{"audioUrl": "/static/mp3/dearbaby.mp3"}"#))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            bridge.store().current_snapshot().state.audio.as_deref(),
            Some("/static/mp3/dearbaby.mp3")
        );
    }

    #[tokio::test]
    async fn invalid_value_is_a_client_error() {
        let (app, bridge, _published) = app();

        let response = app
            .oneshot(post_json("/api/emotion", r#"{"emotion": "bored"}"#))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let body = body_json(response).await;
        assert_eq!(body["status"], "error");
        assert!(body["reason"].as_str().unwrap().contains("bored"));
        assert!(bridge.store().current_snapshot().state.is_baseline());
    }

    #[tokio::test]
    async fn missing_key_never_reaches_the_core() {
        let (app, bridge, _published) = app();

        let response = app
            .clone()
            .oneshot(post_json("/api/animation", r#"{"emotion": "happy"}"#))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);

        let response = app
            .oneshot(post_json("/api/emotion", "not json"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert!(bridge.store().current_snapshot().last_activity_at.is_none());
    }

    #[tokio::test]
    async fn reload_ignores_body_and_notifies_viewers() {
        let (app, bridge, mut published) = app();
        let mut viewer = bridge.realtime().subscribe();

        let response = app
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/api/reload")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(viewer.try_recv().unwrap(), RealtimeEvent::ReloadPage {});
        assert!(published.try_recv().is_err());
    }

    #[tokio::test]
    async fn state_and_healthcheck() {
        let (app, bridge, _published) = app();
        bridge.store().apply_emotion(Emotion::Sad).await.unwrap();

        let response = app
            .clone()
            .oneshot(Request::get("/api/state").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await;
        assert_eq!(body["emotion"], "sad");
        assert_eq!(body["animation"], "none");

        let response = app
            .oneshot(Request::get("/healthcheck").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(body_json(response).await["status"], "ok");
    }

    #[tokio::test]
    async fn metrics_expose_request_duration_histogram() {
        let (app, _bridge, _published) = app();

        let response = app
            .clone()
            .oneshot(post_json("/api/emotion", r#"{"emotion": "happy"}"#))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let response = app
            .clone()
            .oneshot(post_json("/api/emotion", r#"{"emotion": "bored"}"#))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);

        let response = app
            .oneshot(Request::get("/metrics").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let text = String::from_utf8(bytes.to_vec()).unwrap();

        assert!(text.contains("# TYPE http_request_duration_ms histogram"));
        assert!(text.contains("http_request_duration_ms_bucket"));
        assert!(text.contains(r#"route="/api/emotion""#));
        assert!(text.contains(r#"code="200""#));
        assert!(text.contains(r#"code="400""#));
    }

    #[tokio::test]
    async fn unknown_route_is_traced_and_timed() {
        let (app, _bridge, _published) = app();

        let response = app
            .clone()
            .oneshot(Request::get("/nope").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);

        let response = app
            .oneshot(Request::get("/metrics").body(Body::empty()).unwrap())
            .await
            .unwrap();
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let text = String::from_utf8(bytes.to_vec()).unwrap();
        assert!(text.contains(r#"code="404""#));
    }
}

//! `LookoutServer`: Axum HTTP ingress plus the viewer WebSocket endpoint.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use axum::extract::{Path, State};
use axum::http::{StatusCode, header};
use axum::response::{IntoResponse, Json, Response};
use axum::routing::{get, post};
use axum::Router;
use lookout_core::events::{DecisionEvent, PriorityTier, StatusEvent};
use lookout_settings::ServerSettings;
use metrics_exporter_prometheus::PrometheusHandle;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use crate::emitter::EmitOutcome;
use crate::pipeline::Pipeline;
use crate::router::RouteOutcome;
use crate::scheduler::ArchivalError;
use crate::websocket::ws_handler;

/// Shared state accessible from Axum handlers.
#[derive(Clone)]
pub struct AppState {
    /// Delivery pipeline.
    pub pipeline: Arc<Pipeline>,
    /// Prometheus render handle; `/metrics` is 404 without one.
    pub metrics: Option<PrometheusHandle>,
    /// When the server started.
    pub start_time: Instant,
    /// Concurrent viewer cap.
    pub max_connections: usize,
}

/// The Lookout HTTP server.
pub struct LookoutServer {
    settings: ServerSettings,
    pipeline: Arc<Pipeline>,
    metrics: Option<PrometheusHandle>,
    start_time: Instant,
}

impl LookoutServer {
    /// Create a server around a wired pipeline.
    pub fn new(
        settings: ServerSettings,
        pipeline: Arc<Pipeline>,
        metrics: Option<PrometheusHandle>,
    ) -> Self {
        Self {
            settings,
            pipeline,
            metrics,
            start_time: Instant::now(),
        }
    }

    /// Build the Axum router with all routes.
    pub fn router(&self) -> Router {
        let state = AppState {
            pipeline: self.pipeline.clone(),
            metrics: self.metrics.clone(),
            start_time: self.start_time,
            max_connections: self.settings.max_connections,
        };

        Router::new()
            .route("/ws", get(ws_handler))
            .route("/health", get(health_handler))
            .route("/metrics", get(metrics_handler))
            .route("/archive", post(archive_handler))
            .route("/sessions/{id}/status", post(status_handler))
            .route("/sessions/{id}/decisions", post(decision_handler))
            .route(
                "/sessions/{id}/decisions/read-all",
                post(read_all_handler),
            )
            .route(
                "/sessions/{id}/decisions/{decision_id}/read",
                post(read_handler),
            )
            .route("/sessions/{id}/end", post(end_handler))
            .with_state(state)
            .layer(TraceLayer::new_for_http())
            .layer(CorsLayer::permissive())
    }

    /// Bind `host:port` and serve until `shutdown` is cancelled.
    ///
    /// Returns the bound address (useful with port 0) and the serve task.
    pub async fn listen(
        &self,
        shutdown: CancellationToken,
    ) -> std::io::Result<(SocketAddr, JoinHandle<()>)> {
        let listener =
            TcpListener::bind((self.settings.host.as_str(), self.settings.port)).await?;
        let addr = listener.local_addr()?;
        let app = self
            .router()
            .into_make_service_with_connect_info::<SocketAddr>();
        info!(%addr, "lookout server listening");

        let handle = tokio::spawn(async move {
            let served = axum::serve(listener, app)
                .with_graceful_shutdown(async move { shutdown.cancelled().await })
                .await;
            if let Err(e) = served {
                warn!(error = %e, "server exited with error");
            }
        });
        Ok((addr, handle))
    }

    /// Get the pipeline.
    pub fn pipeline(&self) -> &Arc<Pipeline> {
        &self.pipeline
    }

    /// Get the server settings.
    pub fn settings(&self) -> &ServerSettings {
        &self.settings
    }
}

/// Health check response body.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthResponse {
    /// Always `"ok"` when the server is running.
    pub status: String,
    /// Seconds since the server started.
    pub uptime_secs: u64,
    /// Open viewer connections.
    pub connections: usize,
    /// Sessions the scheduler is polling.
    pub watched_sessions: usize,
}

/// Status ingress body: the event plus its delivery tier.
#[derive(Debug, Deserialize)]
struct StatusIngress {
    #[serde(flatten)]
    event: StatusEvent,
    #[serde(default = "default_status_priority")]
    priority: PriorityTier,
}

fn default_status_priority() -> PriorityTier {
    PriorityTier::High
}

#[derive(Debug, Deserialize)]
struct ReadAllRequest {
    #[serde(default)]
    count: u64,
}

/// GET /health
async fn health_handler(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".into(),
        uptime_secs: state.start_time.elapsed().as_secs(),
        connections: state.pipeline.broadcast().connection_count(),
        watched_sessions: state.pipeline.scheduler().watched_count(),
    })
}

/// GET /metrics
async fn metrics_handler(State(state): State<AppState>) -> Response {
    match &state.metrics {
        Some(handle) => (
            [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
            crate::metrics::render(handle),
        )
            .into_response(),
        None => StatusCode::NOT_FOUND.into_response(),
    }
}

/// POST /sessions/{id}/status
async fn status_handler(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
    Json(body): Json<StatusIngress>,
) -> Response {
    let outcome = state
        .pipeline
        .emitter()
        .emit(&session_id, body.event, body.priority);
    let status = match outcome {
        EmitOutcome::Published | EmitOutcome::Flushed => StatusCode::OK,
        EmitOutcome::Queued => StatusCode::ACCEPTED,
        EmitOutcome::Failed => StatusCode::BAD_GATEWAY,
    };
    (status, Json(json!({ "outcome": outcome }))).into_response()
}

/// POST /sessions/{id}/decisions
async fn decision_handler(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
    Json(decision): Json<DecisionEvent>,
) -> Response {
    let outcome = state.pipeline.router().route_decision(&session_id, decision);
    let status = match outcome {
        RouteOutcome::Delivered { .. } => StatusCode::OK,
        RouteOutcome::Queued => StatusCode::ACCEPTED,
        RouteOutcome::Failed => StatusCode::BAD_GATEWAY,
    };
    (status, Json(outcome)).into_response()
}

/// POST /sessions/{id}/decisions/{decision_id}/read
async fn read_handler(
    State(state): State<AppState>,
    Path((session_id, decision_id)): Path<(String, String)>,
) -> Json<serde_json::Value> {
    let published = state.pipeline.router().mark_read(&session_id, &decision_id);
    Json(json!({ "published": published }))
}

/// POST /sessions/{id}/decisions/read-all
async fn read_all_handler(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
    Json(body): Json<ReadAllRequest>,
) -> Json<serde_json::Value> {
    let published = state.pipeline.router().mark_all_read(&session_id, body.count);
    Json(json!({ "published": published }))
}

/// POST /sessions/{id}/end
async fn end_handler(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
) -> Json<crate::pipeline::EndedSession> {
    Json(state.pipeline.end_session(&session_id))
}

/// POST /archive
async fn archive_handler(State(state): State<AppState>) -> Response {
    match state.pipeline.scheduler().trigger_archival().await {
        Ok(report) => Json(report).into_response(),
        Err(e) => {
            warn!(error = %e, "manual archival failed");
            let body = match &e {
                ArchivalError::Listing(_) => json!({ "error": e.to_string() }),
                ArchivalError::Partial(report) => {
                    json!({ "error": e.to_string(), "report": report })
                }
            };
            (StatusCode::BAD_GATEWAY, Json(body)).into_response()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collaborators::{
        CollaboratorError, MockAgentStatusSource, MockSessionArchiver,
    };
    use crate::pipeline::tests::test_pipeline;
    use axum::body::Body;
    use axum::extract::connect_info::MockConnectInfo;
    use axum::http::Request;
    use lookout_settings::{LimitRule, LookoutSettings};
    use serde_json::Value;
    use std::net::SocketAddr;
    use tower::ServiceExt;

    fn make_server(settings: &LookoutSettings) -> LookoutServer {
        LookoutServer::new(
            settings.server.clone(),
            Arc::new(test_pipeline(settings)),
            None,
        )
    }

    fn post_json(uri: &str, body: &Value) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri(uri)
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    async fn body_json(resp: Response) -> Value {
        let body = axum::body::to_bytes(resp.into_body(), 64_000)
            .await
            .unwrap();
        serde_json::from_slice(&body).unwrap()
    }

    #[tokio::test]
    async fn health_endpoint_returns_ok() {
        let server = make_server(&LookoutSettings::default());
        let req = Request::builder().uri("/health").body(Body::empty()).unwrap();

        let resp = server.router().oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let parsed = body_json(resp).await;
        assert_eq!(parsed["status"], "ok");
        assert_eq!(parsed["connections"], 0);
        assert_eq!(parsed["watchedSessions"], 0);
        assert!(parsed["uptimeSecs"].is_number());
    }

    #[tokio::test]
    async fn metrics_without_recorder_is_404() {
        let server = make_server(&LookoutSettings::default());
        let req = Request::builder().uri("/metrics").body(Body::empty()).unwrap();
        let resp = server.router().oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn metrics_renders_with_handle() {
        let settings = LookoutSettings::default();
        let handle = metrics_exporter_prometheus::PrometheusBuilder::new()
            .build_recorder()
            .handle();
        let server = LookoutServer::new(
            settings.server.clone(),
            Arc::new(test_pipeline(&settings)),
            Some(handle),
        );
        let req = Request::builder().uri("/metrics").body(Body::empty()).unwrap();
        let resp = server.router().oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        assert!(resp.headers()[header::CONTENT_TYPE]
            .to_str()
            .unwrap()
            .starts_with("text/plain"));
    }

    #[tokio::test]
    async fn unknown_route_returns_404() {
        let server = make_server(&LookoutSettings::default());
        let req = Request::builder().uri("/nonexistent").body(Body::empty()).unwrap();
        let resp = server.router().oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn status_ingress_defaults_to_high_and_queues() {
        let server = make_server(&LookoutSettings::default());
        let body = json!({ "type": "agent-status-update", "payload": { "agent": "coder" } });

        let resp = server
            .router()
            .oneshot(post_json("/sessions/s1/status", &body))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::ACCEPTED);
        assert_eq!(body_json(resp).await["outcome"], "queued");
        assert_eq!(server.pipeline().emitter().queue_len("s1"), 1);
    }

    #[tokio::test]
    async fn critical_status_reaches_viewer() {
        let server = make_server(&LookoutSettings::default());
        let pipeline = server.pipeline().clone();
        let (conn, mut rx) = pipeline.connect_viewer("10.0.0.1");
        let _ = pipeline.join(&conn, "s1");

        let body = json!({ "type": "agent-error", "payload": {}, "priority": "critical" });
        let resp = server
            .router()
            .oneshot(post_json("/sessions/s1/status", &body))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(body_json(resp).await["outcome"], "published");

        let delivered: Value = serde_json::from_str(&rx.try_recv().unwrap()).unwrap();
        assert_eq!(delivered["type"], "agent-error");
        assert_eq!(delivered["sessionId"], "s1");
    }

    #[tokio::test]
    async fn high_decision_is_delivered_and_low_is_queued() {
        let server = make_server(&LookoutSettings::default());
        let app = server.router();

        let high = json!({ "id": "d1", "agent": "planner", "summary": "ship", "importance": "high" });
        let resp = app
            .clone()
            .oneshot(post_json("/sessions/s1/decisions", &high))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let parsed = body_json(resp).await;
        assert_eq!(parsed["outcome"], "delivered");
        assert!(parsed["latencyMs"].is_number());

        let low = json!({ "id": "d2", "agent": "planner", "summary": "tidy", "importance": "low" });
        let resp = app
            .oneshot(post_json("/sessions/s1/decisions", &low))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::ACCEPTED);
        assert_eq!(server.pipeline().router().queue_len("s1"), 1);
    }

    #[tokio::test]
    async fn malformed_decision_is_rejected() {
        let server = make_server(&LookoutSettings::default());
        let resp = server
            .router()
            .oneshot(post_json("/sessions/s1/decisions", &json!({ "id": "d1" })))
            .await
            .unwrap();
        assert!(resp.status().is_client_error());
    }

    #[tokio::test]
    async fn read_markers_publish_to_viewers() {
        let server = make_server(&LookoutSettings::default());
        let pipeline = server.pipeline().clone();
        let (conn, mut rx) = pipeline.connect_viewer("10.0.0.1");
        let _ = pipeline.join(&conn, "s1");
        let app = server.router();

        let resp = app
            .clone()
            .oneshot(post_json("/sessions/s1/decisions/d7/read", &json!({})))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(body_json(resp).await["published"], true);
        let event: Value = serde_json::from_str(&rx.try_recv().unwrap()).unwrap();
        assert_eq!(event["type"], "decision-read");
        assert_eq!(event["data"]["decisionId"], "d7");

        let resp = app
            .oneshot(post_json("/sessions/s1/decisions/read-all", &json!({ "count": 4 })))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let event: Value = serde_json::from_str(&rx.try_recv().unwrap()).unwrap();
        assert_eq!(event["type"], "all-decisions-read");
        assert_eq!(event["data"]["count"], 4);
    }

    #[tokio::test]
    async fn end_session_discards_queues() {
        let server = make_server(&LookoutSettings::default());
        let _ = server.pipeline().emitter().emit(
            "s1",
            StatusEvent::progress(10.0),
            PriorityTier::Low,
        );

        let resp = server
            .router()
            .oneshot(post_json("/sessions/s1/end", &json!({})))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let parsed = body_json(resp).await;
        assert_eq!(parsed["discardedStatus"], 1);
        assert_eq!(parsed["discardedDecisions"], 0);
        assert_eq!(server.pipeline().emitter().queue_len("s1"), 0);
    }

    #[tokio::test]
    async fn archive_with_nothing_eligible_returns_empty_report() {
        let server = make_server(&LookoutSettings::default());
        let resp = server
            .router()
            .oneshot(post_json("/archive", &json!({})))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let parsed = body_json(resp).await;
        assert_eq!(parsed["archived"], json!([]));
        assert_eq!(parsed["skipped"], 0);
    }

    #[tokio::test]
    async fn archive_listing_failure_is_bad_gateway() {
        let mut source = MockAgentStatusSource::new();
        let _ = source
            .expect_archivable_sessions()
            .returning(|_| Err(CollaboratorError::Transport("connection refused".into())));
        let settings = LookoutSettings::default();
        let pipeline = Pipeline::new(
            &settings,
            Arc::new(source),
            Arc::new(MockSessionArchiver::new()),
        );
        let server = LookoutServer::new(settings.server.clone(), Arc::new(pipeline), None);

        let resp = server
            .router()
            .oneshot(post_json("/archive", &json!({})))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::BAD_GATEWAY);
        let parsed = body_json(resp).await;
        assert!(parsed["error"].as_str().unwrap().contains("connection refused"));
        assert!(parsed.get("report").is_none());
    }

    #[tokio::test]
    async fn ws_connection_rate_limit_returns_429() {
        let mut settings = LookoutSettings::default();
        settings.rate_limits.connection = LimitRule::new(60_000, 1);
        let server = make_server(&settings);
        let app = server
            .router()
            .layer(MockConnectInfo(SocketAddr::from(([10, 0, 0, 1], 4000))));

        let first = Request::builder().uri("/ws").body(Body::empty()).unwrap();
        let resp = app.clone().oneshot(first).await.unwrap();
        assert_ne!(resp.status(), StatusCode::TOO_MANY_REQUESTS);

        let second = Request::builder().uri("/ws").body(Body::empty()).unwrap();
        let resp = app.oneshot(second).await.unwrap();
        assert_eq!(resp.status(), StatusCode::TOO_MANY_REQUESTS);
        assert!(resp.headers().contains_key(header::RETRY_AFTER));
        let parsed = body_json(resp).await;
        assert_eq!(parsed["type"], "rate-limited");
        assert_eq!(parsed["operation"], "connection");
    }

    #[tokio::test]
    async fn listen_serves_health_until_cancelled() {
        let mut settings = LookoutSettings::default();
        settings.server.host = "127.0.0.1".into();
        settings.server.port = 0;
        let server = make_server(&settings);
        let token = CancellationToken::new();

        let (addr, handle) = server.listen(token.clone()).await.unwrap();
        let resp = reqwest::get(format!("http://{addr}/health")).await.unwrap();
        assert_eq!(resp.status().as_u16(), 200);
        let parsed: Value = resp.json().await.unwrap();
        assert_eq!(parsed["status"], "ok");

        token.cancel();
        tokio::time::timeout(std::time::Duration::from_secs(5), handle)
            .await
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn ws_connection_cap_returns_503() {
        let mut settings = LookoutSettings::default();
        settings.server.max_connections = 1;
        let server = make_server(&settings);
        let (_conn, _rx) = server.pipeline().connect_viewer("10.0.0.5");
        let app = server
            .router()
            .layer(MockConnectInfo(SocketAddr::from(([10, 0, 0, 1], 4000))));

        let req = Request::builder().uri("/ws").body(Body::empty()).unwrap();
        let resp = app.oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::SERVICE_UNAVAILABLE);
    }
}

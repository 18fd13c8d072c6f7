//! Viewer WebSocket gateway (`GET /ws`).
//!
//! | Module | Purpose |
//! |--------|---------|
//! | `handler` | Frame parsing, join/leave/ping dispatch, rate-limit replies |
//! | `session` | Per-connection read loop, outbound forwarder, cleanup |

pub mod handler;
pub mod session;

use std::net::SocketAddr;

use axum::extract::ws::rejection::WebSocketUpgradeRejection;
use axum::extract::ws::WebSocketUpgrade;
use axum::extract::{ConnectInfo, State};
use axum::http::{HeaderValue, StatusCode, header};
use axum::response::{IntoResponse, Response};
use axum::Json;
use tracing::warn;

use crate::rate_limit::LimitDecision;
use crate::server::AppState;

/// `GET /ws`: admit the caller, then upgrade.
///
/// Admission checks run before the upgrade: the connection cap (503) and
/// the per-address connection limiter (429 with `Retry-After`).
pub async fn ws_handler(
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    State(state): State<AppState>,
    ws: Result<WebSocketUpgrade, WebSocketUpgradeRejection>,
) -> Response {
    let remote = addr.ip().to_string();

    if state.pipeline.broadcast().connection_count() >= state.max_connections {
        warn!(remote = %remote, "connection cap reached, refusing viewer");
        return (StatusCode::SERVICE_UNAVAILABLE, "too many connections").into_response();
    }

    if let LimitDecision::Denied { retry_after } = state.pipeline.check_connect(&remote) {
        warn!(remote = %remote, "connection rate limit exceeded");
        let secs = retry_after.as_secs_f64().ceil().max(1.0) as u64;
        let mut response = (
            StatusCode::TOO_MANY_REQUESTS,
            Json(handler::rate_limited("connection", retry_after)),
        )
            .into_response();
        let _ = response
            .headers_mut()
            .insert(header::RETRY_AFTER, HeaderValue::from(secs));
        return response;
    }

    let ws = match ws {
        Ok(ws) => ws,
        Err(rejection) => return rejection.into_response(),
    };

    let pipeline = state.pipeline.clone();
    ws.on_upgrade(move |socket| async move {
        let (connection, outbox) = pipeline.connect_viewer(&remote);
        session::run_viewer_session(socket, pipeline, connection, outbox).await;
    })
}

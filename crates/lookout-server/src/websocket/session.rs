//! Viewer WebSocket lifecycle, from upgrade through disconnect.

use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::extract::ws::{Message, WebSocket};
use futures::{SinkExt, StreamExt};
use metrics::histogram;
use tokio::sync::mpsc;
use tracing::{debug, info, instrument};

use super::handler::handle_frame;
use crate::channel::ClientConnection;
use crate::metrics::WS_CONNECTION_DURATION_SECONDS;
use crate::pipeline::Pipeline;

/// Interval between server-initiated Ping frames.
const PING_INTERVAL: Duration = Duration::from_secs(30);

/// How long the forwarder gets to deliver a Close frame after eviction.
const CLOSE_GRACE: Duration = Duration::from_secs(1);

/// Run a viewer session.
///
/// 1. Forwards the connection's outbox (events and replies) to the socket
/// 2. Dispatches inbound text frames through [`handle_frame`]
/// 3. Sends periodic Ping frames
/// 4. Hangs up once the channel closes the connection (slow-client eviction)
/// 5. Detaches the viewer from every room on disconnect
#[instrument(skip_all, fields(conn_id = %connection.id, remote = %connection.remote))]
pub async fn run_viewer_session(
    ws: WebSocket,
    pipeline: Arc<Pipeline>,
    connection: Arc<ClientConnection>,
    mut outbox: mpsc::Receiver<Arc<String>>,
) {
    let (mut ws_tx, mut ws_rx) = ws.split();
    let started = Instant::now();
    info!("viewer connected");

    let forwarder_conn = Arc::clone(&connection);
    let outbound = tokio::spawn(async move {
        let mut ping_interval = tokio::time::interval(PING_INTERVAL);
        // Skip the immediate first tick
        let _ = ping_interval.tick().await;

        loop {
            tokio::select! {
                () = forwarder_conn.closed() => {
                    let _ = ws_tx.send(Message::Close(None)).await;
                    break;
                }
                msg = outbox.recv() => {
                    let Some(text) = msg else { break };
                    if ws_tx.send(Message::Text(text.as_str().into())).await.is_err() {
                        break;
                    }
                }
                _ = ping_interval.tick() => {
                    if ws_tx.send(Message::Ping(Vec::<u8>::new().into())).await.is_err() {
                        break;
                    }
                }
            }
        }
    });

    loop {
        let msg = tokio::select! {
            () = connection.closed() => {
                info!(drops = connection.drop_count(), "viewer closed by server");
                break;
            }
            msg = ws_rx.next() => match msg {
                Some(Ok(msg)) => msg,
                _ => break,
            },
        };
        let text = match msg {
            Message::Text(ref t) => t.as_str().to_owned(),
            Message::Binary(ref data) => match std::str::from_utf8(data) {
                Ok(s) => s.to_owned(),
                Err(_) => {
                    debug!(len = data.len(), "ignoring non-UTF8 binary frame");
                    continue;
                }
            },
            Message::Close(_) => {
                debug!("viewer sent close frame");
                break;
            }
            Message::Ping(_) | Message::Pong(_) => continue,
        };

        let reply = handle_frame(&text, &connection, &pipeline);
        if !connection.send_json(&reply) {
            debug!("failed to enqueue reply (channel full or closed)");
        }
    }

    info!("viewer disconnected");
    histogram!(WS_CONNECTION_DURATION_SECONDS).record(started.elapsed().as_secs_f64());
    if connection.is_closed() {
        let abort = outbound.abort_handle();
        if tokio::time::timeout(CLOSE_GRACE, outbound).await.is_err() {
            abort.abort();
        }
    } else {
        outbound.abort();
    }
    pipeline.disconnect_viewer(&connection);
}

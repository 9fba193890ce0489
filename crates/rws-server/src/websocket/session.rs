//! `WebSocket` session lifecycle: one connected client from upgrade through
//! disconnect.

use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{Message, WebSocket};
use futures::stream::SplitSink;
use futures::{SinkExt, StreamExt};
use metrics::{counter, gauge, histogram};
use rws_core::{RwsContext, Session, TransportAdapter};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use super::connection::ClientConnection;
use super::heartbeat::{HeartbeatResult, run_heartbeat};
use crate::metrics::{
    WS_CONNECTION_DURATION_SECONDS, WS_CONNECTIONS_ACTIVE, WS_CONNECTIONS_TOTAL,
    WS_DISCONNECTIONS_TOTAL,
};

/// Inbound frames buffered between the socket reader and the session worker.
const INBOUND_QUEUE: usize = 64;

/// Per-connection tuning taken from the server config.
#[derive(Clone, Copy, Debug)]
pub struct SessionLimits {
    /// Outbound queue capacity.
    pub send_queue_capacity: usize,
    /// Interval between server pings.
    pub heartbeat_interval: Duration,
    /// Silence tolerated before the connection is dropped.
    pub heartbeat_timeout: Duration,
}

/// Run a `WebSocket` session for a connected client.
///
/// 1. Registers a session in `context`, backed by a [`ClientConnection`]
/// 2. Forwards queued outbound frames and periodic pings to the socket
/// 3. Hands inbound text frames, in arrival order, to the session on a
///    blocking worker
/// 4. Drops the client when the heartbeat times out
/// 5. Removes the session when the socket closes or the connection is
///    disconnected from the core side
#[instrument(skip_all, fields(session_id))]
pub async fn run_ws_session(
    ws: WebSocket,
    context: Arc<RwsContext>,
    limits: SessionLimits,
    shutdown: CancellationToken,
) {
    let (ws_tx, mut ws_rx) = ws.split();
    let (send_tx, send_rx) = mpsc::channel::<String>(limits.send_queue_capacity.max(1));
    let connection = Arc::new(ClientConnection::new(send_tx));
    let closed = connection.closed_token();

    let session = context.add_session(Arc::clone(&connection) as Arc<dyn TransportAdapter>);
    let _ = tracing::Span::current().record("session_id", session.id());
    counter!(WS_CONNECTIONS_TOTAL).increment(1);
    gauge!(WS_CONNECTIONS_ACTIVE).increment(1.0);

    let writer = tokio::spawn(write_loop(
        ws_tx,
        send_rx,
        limits.heartbeat_interval,
        closed.clone(),
    ));

    let heartbeat_conn = Arc::clone(&connection);
    let heartbeat_cancel = closed.clone();
    let heartbeat = tokio::spawn(async move {
        let result = run_heartbeat(
            Arc::clone(&heartbeat_conn),
            limits.heartbeat_interval,
            limits.heartbeat_timeout,
            heartbeat_cancel,
        )
        .await;
        if result == HeartbeatResult::TimedOut {
            warn!(
                silent_for = ?heartbeat_conn.last_pong_elapsed(),
                "client unresponsive, disconnecting"
            );
            heartbeat_conn.disconnect();
        }
    });

    let (inbound_tx, worker) = spawn_inbound_worker(Arc::clone(&session));

    loop {
        let msg = tokio::select! {
            msg = ws_rx.next() => msg,
            () = closed.cancelled() => {
                debug!("connection closed from the server side");
                break;
            }
            () = shutdown.cancelled() => {
                debug!("server shutting down");
                break;
            }
        };

        let text = match msg {
            Some(Ok(Message::Text(text))) => text.to_string(),
            Some(Ok(Message::Binary(data))) => match String::from_utf8(data.to_vec()) {
                Ok(text) => text,
                Err(_) => {
                    info!(len = data.len(), "ignoring non-UTF8 binary frame");
                    continue;
                }
            },
            Some(Ok(Message::Ping(_) | Message::Pong(_))) => {
                connection.mark_alive();
                continue;
            }
            Some(Ok(Message::Close(_))) => {
                info!("client sent close frame");
                break;
            }
            Some(Err(e)) => {
                debug!(error = %e, "websocket read failed");
                break;
            }
            None => break,
        };

        connection.mark_alive();
        if inbound_tx.send(text).await.is_err() {
            break;
        }
    }

    // Let the worker finish frames already accepted, then tear down.
    drop(inbound_tx);
    if let Err(e) = worker.await {
        warn!(error = %e, "inbound worker failed");
    }
    context.remove_session(&session);
    session.disconnect();
    let _ = writer.await;
    let _ = heartbeat.await;

    let age = connection.age();
    info!(
        dropped = connection.drop_count(),
        duration_secs = age.as_secs(),
        "client disconnected"
    );
    counter!(WS_DISCONNECTIONS_TOTAL).increment(1);
    gauge!(WS_CONNECTIONS_ACTIVE).decrement(1.0);
    histogram!(WS_CONNECTION_DURATION_SECONDS).record(age.as_secs_f64());
}

/// Feed inbound frames to the session one at a time on a blocking thread,
/// so calls into application objects never stall the runtime and replies
/// keep the order their requests arrived in.
fn spawn_inbound_worker(
    session: Arc<Session>,
) -> (mpsc::Sender<String>, tokio::task::JoinHandle<()>) {
    let (tx, mut rx) = mpsc::channel::<String>(INBOUND_QUEUE);
    let handle = tokio::task::spawn_blocking(move || {
        while let Some(text) = rx.blocking_recv() {
            if session.is_closed() {
                break;
            }
            session.handle_text(&text);
        }
    });
    (tx, handle)
}

/// Drain the outbound queue into the socket, pinging every `ping_every`.
/// Exits when the connection is closed or the socket fails; a close frame
/// is sent on the way out.
async fn write_loop(
    mut ws_tx: SplitSink<WebSocket, Message>,
    mut send_rx: mpsc::Receiver<String>,
    ping_every: Duration,
    closed: CancellationToken,
) {
    let mut ping = tokio::time::interval(ping_every);
    let _ = ping.tick().await;

    loop {
        tokio::select! {
            biased;
            msg = send_rx.recv() => match msg {
                Some(text) => {
                    if ws_tx.send(Message::Text(text.into())).await.is_err() {
                        break;
                    }
                }
                None => break,
            },
            _ = ping.tick() => {
                if ws_tx.send(Message::Ping(Vec::new().into())).await.is_err() {
                    break;
                }
            }
            () = closed.cancelled() => {
                // Flush what was queued before the close.
                while let Ok(text) = send_rx.try_recv() {
                    if ws_tx.send(Message::Text(text.into())).await.is_err() {
                        break;
                    }
                }
                let _ = ws_tx.send(Message::Close(None)).await;
                break;
            }
        }
    }
    closed.cancel();
}

//! `WebSocket` client connection: the transport a session writes to.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::{Duration, Instant};

use metrics::counter;
use parking_lot::Mutex;
use rws_core::{TransportAdapter, TransportError};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio_util::sync::CancellationToken;

use crate::metrics::WS_SEND_DROPS_TOTAL;

/// Outbound half of one `WebSocket` connection.
///
/// Sends never block: frames go into a bounded queue drained by the
/// connection's writer task. Cancelling the token closes the connection.
pub struct ClientConnection {
    tx: mpsc::Sender<String>,
    closed: CancellationToken,
    connected_at: Instant,
    is_alive: AtomicBool,
    last_pong: Mutex<Instant>,
    dropped_messages: AtomicU64,
}

impl ClientConnection {
    /// Create a connection writing into `tx`.
    pub fn new(tx: mpsc::Sender<String>) -> Self {
        let now = Instant::now();
        Self {
            tx,
            closed: CancellationToken::new(),
            connected_at: now,
            is_alive: AtomicBool::new(true),
            last_pong: Mutex::new(now),
            dropped_messages: AtomicU64::new(0),
        }
    }

    /// Token cancelled when the connection closes.
    pub fn closed_token(&self) -> CancellationToken {
        self.closed.clone()
    }

    /// Mark the connection as alive (pong or other client activity).
    pub fn mark_alive(&self) {
        self.is_alive.store(true, Ordering::Relaxed);
        *self.last_pong.lock() = Instant::now();
    }

    /// Read and reset the alive flag. `true` if the client was heard from
    /// since the previous check.
    pub fn check_alive(&self) -> bool {
        self.is_alive.swap(false, Ordering::Relaxed)
    }

    /// Time since the last pong (or connection establishment).
    pub fn last_pong_elapsed(&self) -> Duration {
        self.last_pong.lock().elapsed()
    }

    /// Connection age.
    pub fn age(&self) -> Duration {
        self.connected_at.elapsed()
    }

    /// Frames refused because the queue was full or closed.
    pub fn drop_count(&self) -> u64 {
        self.dropped_messages.load(Ordering::Relaxed)
    }

    fn record_drop(&self) {
        let _ = self.dropped_messages.fetch_add(1, Ordering::Relaxed);
        counter!(WS_SEND_DROPS_TOTAL).increment(1);
    }
}

impl TransportAdapter for ClientConnection {
    fn send_message(&self, text: &str) -> Result<(), TransportError> {
        if self.closed.is_cancelled() {
            return Err(TransportError::Closed);
        }
        match self.tx.try_send(text.to_owned()) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(_)) => {
                self.record_drop();
                Err(TransportError::QueueFull)
            }
            Err(TrySendError::Closed(_)) => {
                self.record_drop();
                Err(TransportError::Closed)
            }
        }
    }

    fn is_connected(&self) -> bool {
        !self.closed.is_cancelled() && !self.tx.is_closed()
    }

    fn disconnect(&self) {
        self.closed.cancel();
    }
}

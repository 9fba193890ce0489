//! Transport adapter seam.

use crate::errors::TransportError;

/// The connection a session writes to.
///
/// Implementations must be cheap to call from any thread: events fired by
/// application code can reach a session at any time.
pub trait TransportAdapter: Send + Sync {
    /// Queue one text frame for the client.
    fn send_message(&self, text: &str) -> Result<(), TransportError>;

    /// Whether the connection is still open.
    fn is_connected(&self) -> bool;

    /// Close the connection. Must tolerate an already-closed connection.
    fn disconnect(&self);
}

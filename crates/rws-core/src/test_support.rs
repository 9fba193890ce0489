//! In-memory transport and context fixtures for unit tests.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::Mutex;
use serde_json::Value;

use crate::context::RwsContext;
use crate::errors::TransportError;
use crate::session::Session;
use crate::transport::TransportAdapter;
use crate::types::Envelope;

/// Transport that records every frame sent to it.
pub(crate) struct RecordingAdapter {
    sent: Mutex<Vec<String>>,
    connected: AtomicBool,
    failing: AtomicBool,
}

impl Default for RecordingAdapter {
    fn default() -> Self {
        Self {
            sent: Mutex::new(Vec::new()),
            connected: AtomicBool::new(true),
            failing: AtomicBool::new(false),
        }
    }
}

impl RecordingAdapter {
    /// Frames sent so far, parsed.
    pub(crate) fn messages(&self) -> Vec<Value> {
        self.sent
            .lock()
            .iter()
            .map(|text| serde_json::from_str(text).unwrap())
            .collect()
    }

    /// Make every following send fail while still reporting connected.
    pub(crate) fn fail_sends(&self) {
        self.failing.store(true, Ordering::SeqCst);
    }
}

impl TransportAdapter for RecordingAdapter {
    fn send_message(&self, text: &str) -> Result<(), TransportError> {
        if self.failing.load(Ordering::SeqCst) || !self.connected.load(Ordering::SeqCst) {
            return Err(TransportError::Closed);
        }
        self.sent.lock().push(text.to_owned());
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    fn disconnect(&self) {
        self.connected.store(false, Ordering::SeqCst);
    }
}

/// A context with the built-in objects and helpers to connect sessions.
pub(crate) struct TestBed {
    pub(crate) context: Arc<RwsContext>,
}

impl TestBed {
    pub(crate) fn new() -> Self {
        Self {
            context: RwsContext::with_builtins(),
        }
    }

    pub(crate) fn connect(&self) -> (Arc<Session>, Arc<RecordingAdapter>) {
        let adapter = Arc::new(RecordingAdapter::default());
        let session = self.context.add_session(adapter.clone());
        (session, adapter)
    }
}

/// Unwrap a JSON object literal into an envelope.
pub(crate) fn envelope(value: Value) -> Envelope {
    match value {
        Value::Object(map) => map,
        other => panic!("not an object: {other}"),
    }
}

//! Per-connection protocol state and message routing.

use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use metrics::counter;
use parking_lot::{Mutex, RwLock};
use serde_json::Value;
use tracing::{debug, error, warn};

use crate::capability::{EventSink, Instance, SubscriptionToken};
use crate::context::RwsContext;
use crate::errors::{Result, RwsError, TransportError};
use crate::native::Native;
use crate::transport::TransportAdapter;
use crate::types::{
    CallRequest, Envelope, Route, SYSTEM_ADDRESS, SubscriptionSpec, call_exception, call_result,
    event_message, fields,
};

struct ActiveSubscription {
    spec: SubscriptionSpec,
    token: SubscriptionToken,
}

/// One client connection.
pub struct Session {
    id: String,
    name: RwLock<String>,
    context: Weak<RwsContext>,
    adapter: Arc<dyn TransportAdapter>,
    attributes: Mutex<HashMap<String, Instance>>,
    subscriptions: Mutex<HashMap<String, ActiveSubscription>>,
    groups: Mutex<BTreeSet<String>>,
    closed: AtomicBool,
}

impl Session {
    pub(crate) fn new(
        id: String,
        context: Weak<RwsContext>,
        adapter: Arc<dyn TransportAdapter>,
    ) -> Self {
        Self {
            name: RwLock::new(format!("Client #{id}")),
            id,
            context,
            adapter,
            attributes: Mutex::new(HashMap::new()),
            subscriptions: Mutex::new(HashMap::new()),
            groups: Mutex::new(BTreeSet::new()),
            closed: AtomicBool::new(false),
        }
    }

    /// Server-assigned id, stable for the connection's lifetime.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Display name.
    pub fn name(&self) -> String {
        self.name.read().clone()
    }

    /// Set the display name and notify lifecycle listeners, even when the
    /// name is unchanged.
    pub fn set_name(self: &Arc<Self>, name: impl Into<String>) {
        *self.name.write() = name.into();
        if let Some(context) = self.context.upgrade() {
            context.fire_change(self);
        }
    }

    /// The owning session registry.
    pub fn context(&self) -> Result<Arc<RwsContext>> {
        self.context.upgrade().ok_or(RwsError::ContextClosed)
    }

    /// Whether the session has been removed from its registry.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    pub(crate) fn mark_closed(&self) -> bool {
        !self.closed.swap(true, Ordering::AcqRel)
    }

    /// Whether the underlying transport is still open.
    pub fn is_connected(&self) -> bool {
        self.adapter.is_connected()
    }

    // ── Attributes ──────────────────────────────────────────────────

    /// Read an attribute.
    pub fn attribute(&self, key: &str) -> Option<Instance> {
        self.attributes.lock().get(key).cloned()
    }

    /// Store an attribute, returning the previous value.
    pub fn set_attribute(&self, key: &str, value: Instance) -> Option<Instance> {
        self.attributes.lock().insert(key.to_owned(), value)
    }

    /// Remove an attribute.
    pub fn remove_attribute(&self, key: &str) -> Option<Instance> {
        self.attributes.lock().remove(key)
    }

    /// Attribute keys, sorted.
    pub fn attribute_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.attributes.lock().keys().cloned().collect();
        names.sort();
        names
    }

    pub(crate) fn clear_attributes(&self) {
        self.attributes.lock().clear();
    }

    // ── Sending ─────────────────────────────────────────────────────

    /// Stamp `from` on `payload`, serialize it and hand it to the transport.
    pub fn send(&self, from: &str, mut payload: Envelope) -> Result<()> {
        let _ = payload.insert(fields::FROM.to_owned(), Value::String(from.to_owned()));
        let text = serde_json::to_string(&payload)
            .map_err(|e| RwsError::Transport(TransportError::Io(e.to_string())))?;
        self.adapter.send_message(&text)?;
        Ok(())
    }

    // ── Inbound ─────────────────────────────────────────────────────

    /// Handle one inbound text frame. Frames that are not JSON objects are
    /// logged and dropped.
    pub fn handle_text(self: &Arc<Self>, text: &str) {
        let envelope = match serde_json::from_str::<Value>(text) {
            Ok(Value::Object(envelope)) => envelope,
            Ok(other) => {
                warn!(session_id = %self.id, kind = json_kind(&other), "dropping non-object frame");
                return;
            }
            Err(e) => {
                warn!(session_id = %self.id, error = %e, "dropping unparseable frame");
                return;
            }
        };
        if let Err(e) = self.handle_message(envelope) {
            match e {
                RwsError::Transport(_) => {
                    debug!(session_id = %self.id, error = %e, "routed send failed");
                }
                _ => warn!(session_id = %self.id, error = %e, code = e.code(), "dropping frame"),
            }
        }
    }

    /// Route one inbound envelope by its `to` field.
    ///
    /// A failed direct send is returned to the caller; broadcast and
    /// multicast swallow per-recipient failures.
    pub fn handle_message(self: &Arc<Self>, envelope: Envelope) -> Result<()> {
        let route = Route::of(&envelope)?;
        match route {
            Route::System => self.dispatch_call(&envelope),
            Route::Broadcast => {
                let _ = self.context()?.send_all(&self.id, &envelope, false);
                Ok(())
            }
            Route::Group(group) => {
                let _ = self.context()?.send_multi(&self.id, &group, &envelope, false);
                Ok(())
            }
            Route::Direct(to) => self.context()?.send_to(&self.id, &to, envelope),
        }
    }

    fn dispatch_call(self: &Arc<Self>, envelope: &Envelope) -> Result<()> {
        let request = CallRequest::from_envelope(envelope);
        let context = self.context()?;
        let object = request.object.as_deref().unwrap_or_default();
        let method = request.method.as_deref().unwrap_or_default();

        counter!("rws_calls_total").increment(1);
        let outcome = if request.object.is_none() {
            Err(RwsError::InvalidEnvelope {
                message: "missing 'object'".to_owned(),
            })
        } else if request.method.is_none() {
            Err(RwsError::InvalidEnvelope {
                message: "missing 'method'".to_owned(),
            })
        } else {
            context.registry().call(self, object, method, request.params)
        };

        let reply = match outcome {
            Ok(result) => {
                debug!(session_id = %self.id, object, method, "call succeeded");
                request.id.map(|id| call_result(id, result))
            }
            Err(e) => {
                counter!("rws_call_errors_total", "code" => e.code()).increment(1);
                if e.is_invocation() {
                    error!(session_id = %self.id, object, method, error = %e, "call failed");
                } else {
                    warn!(session_id = %self.id, object, method, code = e.code(), error = %e, "call rejected");
                }
                request.id.map(|id| call_exception(id, e.to_string()))
            }
        };

        match reply {
            Some(reply) => context.deliver(SYSTEM_ADDRESS, self, reply),
            None => Ok(()),
        }
    }

    // ── Subscriptions ───────────────────────────────────────────────

    /// Subscribe to an event; fired events arrive as `{id: handler_id, event}`.
    ///
    /// Fails without touching existing subscriptions if the handler id is taken.
    pub fn subscribe(self: &Arc<Self>, spec: SubscriptionSpec) -> Result<()> {
        if self.subscriptions.lock().contains_key(&spec.handler_id) {
            return Err(RwsError::DuplicateHandler {
                handler_id: spec.handler_id,
            });
        }
        let context = self.context()?;
        let sink = self.event_sink(spec.handler_id.clone());
        let token = context.registry().subscribe(self, &spec, sink)?;

        let clash = {
            let mut subscriptions = self.subscriptions.lock();
            if subscriptions.contains_key(&spec.handler_id) {
                true
            } else {
                let _ = subscriptions.insert(
                    spec.handler_id.clone(),
                    ActiveSubscription {
                        spec: spec.clone(),
                        token,
                    },
                );
                false
            }
        };
        if clash {
            let _ = context.registry().unsubscribe(self, &spec, token);
            return Err(RwsError::DuplicateHandler {
                handler_id: spec.handler_id,
            });
        }
        if self.is_closed() {
            self.cancel_subscriptions();
            return Err(RwsError::Transport(TransportError::Closed));
        }
        debug!(
            session_id = %self.id,
            handler_id = %spec.handler_id,
            object = %spec.object,
            event = %spec.event,
            action = %spec.action,
            "subscribed"
        );
        Ok(())
    }

    fn event_sink(self: &Arc<Self>, handler_id: String) -> EventSink {
        let session = Arc::downgrade(self);
        Arc::new(move |data: Native| {
            let Some(session) = session.upgrade() else {
                return Ok(());
            };
            if session.is_closed() {
                return Ok(());
            }
            let context = session.context()?;
            let payload = context.registry().converters().convert_to_wire(&data)?;
            context.deliver(
                SYSTEM_ADDRESS,
                &session,
                event_message(&handler_id, payload),
            )?;
            Ok(())
        })
    }

    /// Cancel a subscription. Unknown handler ids are ignored.
    pub fn unsubscribe(&self, handler_id: &str) -> Result<()> {
        let Some(active) = self.subscriptions.lock().remove(handler_id) else {
            return Ok(());
        };
        self.context()?
            .registry()
            .unsubscribe(self, &active.spec, active.token)
    }

    /// Active subscriptions, sorted by handler id.
    pub fn subscriptions(&self) -> Vec<SubscriptionSpec> {
        let mut specs: Vec<SubscriptionSpec> = self
            .subscriptions
            .lock()
            .values()
            .map(|s| s.spec.clone())
            .collect();
        specs.sort_by(|a, b| a.handler_id.cmp(&b.handler_id));
        specs
    }

    pub(crate) fn cancel_subscriptions(&self) {
        let active: Vec<ActiveSubscription> = self
            .subscriptions
            .lock()
            .drain()
            .map(|(_, s)| s)
            .collect();
        if active.is_empty() {
            return;
        }
        let Ok(context) = self.context() else {
            return;
        };
        for subscription in active {
            if let Err(e) =
                context
                    .registry()
                    .unsubscribe(self, &subscription.spec, subscription.token)
            {
                debug!(
                    session_id = %self.id,
                    handler_id = %subscription.spec.handler_id,
                    error = %e,
                    "failed to cancel subscription"
                );
            }
        }
    }

    // ── Multicast groups ────────────────────────────────────────────

    /// Join a group. Returns `false` (and notifies nobody) if already a member.
    pub fn join(self: &Arc<Self>, group: &str) -> bool {
        if !self.groups.lock().insert(group.to_owned()) {
            return false;
        }
        debug!(session_id = %self.id, group, "joined group");
        if let Some(context) = self.context.upgrade() {
            context.fire_join(group, self);
        }
        true
    }

    /// Leave a group. Returns `false` (and notifies nobody) if not a member.
    pub fn leave(self: &Arc<Self>, group: &str) -> bool {
        if !self.groups.lock().remove(group) {
            return false;
        }
        debug!(session_id = %self.id, group, "left group");
        if let Some(context) = self.context.upgrade() {
            context.fire_leave(group, self);
        }
        true
    }

    /// Whether the session is in `group`.
    pub fn in_group(&self, group: &str) -> bool {
        self.groups.lock().contains(group)
    }

    /// Joined groups, sorted.
    pub fn groups(&self) -> BTreeSet<String> {
        self.groups.lock().clone()
    }

    // ── Teardown ────────────────────────────────────────────────────

    /// Cancel every subscription, then close the transport. Both steps are
    /// best-effort and safe on an already-closed connection.
    pub fn disconnect(&self) {
        self.cancel_subscriptions();
        self.adapter.disconnect();
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("name", &*self.name.read())
            .field("closed", &self.is_closed())
            .finish_non_exhaustive()
    }
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

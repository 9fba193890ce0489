//! Session registry: which sessions exist and how they talk to each other.

use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use dashmap::DashMap;
use metrics::counter;
use tracing::{debug, error, info};

use crate::builtin::register_builtins;
use crate::capability::Instance;
use crate::errors::Result;
use crate::listeners::{ListenerSet, MulticastListener, SessionListener};
use crate::registry::ObjectRegistry;
use crate::session::Session;
use crate::transport::TransportAdapter;
use crate::types::Envelope;

/// The session registry of one running server.
pub struct RwsContext {
    sessions: DashMap<String, Arc<Session>>,
    next_id: AtomicU64,
    registry: Arc<ObjectRegistry>,
    attributes: DashMap<String, Instance>,
    session_listeners: ListenerSet<dyn SessionListener>,
    multicast_listeners: ListenerSet<dyn MulticastListener>,
}

impl RwsContext {
    /// Create a context dispatching calls to `registry`.
    pub fn new(registry: Arc<ObjectRegistry>) -> Arc<Self> {
        Arc::new(Self {
            sessions: DashMap::new(),
            next_id: AtomicU64::new(1),
            registry,
            attributes: DashMap::new(),
            session_listeners: ListenerSet::new(),
            multicast_listeners: ListenerSet::new(),
        })
    }

    /// Create a context with a fresh registry holding the built-in objects.
    pub fn with_builtins() -> Arc<Self> {
        let registry = Arc::new(ObjectRegistry::new());
        register_builtins(&registry);
        Self::new(registry)
    }

    /// The object registry.
    pub fn registry(&self) -> &Arc<ObjectRegistry> {
        &self.registry
    }

    // ── Sessions ────────────────────────────────────────────────────

    /// Create and register a session for a newly accepted connection.
    pub fn add_session(self: &Arc<Self>, adapter: Arc<dyn TransportAdapter>) -> Arc<Session> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed).to_string();
        let session = Arc::new(Session::new(id.clone(), Arc::downgrade(self), adapter));
        let _ = self.sessions.insert(id, Arc::clone(&session));
        info!(session_id = session.id(), sessions = self.sessions.len(), "session connected");
        self.session_listeners
            .fire("connect", |l| l.connect(&session));
        session
    }

    /// Remove a session and tear it down. Removing an absent session is a no-op.
    pub fn remove_session(&self, session: &Arc<Session>) {
        if self.sessions.remove(session.id()).is_none() {
            return;
        }
        let _ = session.mark_closed();
        session.cancel_subscriptions();
        session.clear_attributes();
        info!(session_id = session.id(), sessions = self.sessions.len(), "session disconnected");
        self.session_listeners
            .fire("disconnect", |l| l.disconnect(session));
    }

    /// Look up a live session.
    pub fn session(&self, id: &str) -> Option<Arc<Session>> {
        self.sessions.get(id).map(|entry| Arc::clone(entry.value()))
    }

    /// Snapshot of the live sessions.
    pub fn sessions(&self) -> Vec<Arc<Session>> {
        self.sessions
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect()
    }

    /// Number of live sessions.
    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    /// Remove and disconnect every session.
    pub fn shutdown(&self) {
        for session in self.sessions() {
            self.remove_session(&session);
            session.disconnect();
        }
    }

    // ── Sending ─────────────────────────────────────────────────────

    /// Send to one session. Unknown recipients are silently dropped; a failed
    /// send tears the recipient down and is returned.
    pub fn send_to(&self, from: &str, to: &str, payload: Envelope) -> Result<()> {
        let Some(session) = self.session(to) else {
            debug!(from, to, "dropping message for unknown session");
            return Ok(());
        };
        self.deliver(from, &session, payload)
    }

    /// Send to every live session, skipping `from` unless `include_self`.
    ///
    /// Per-recipient failures are swallowed. Returns the number of sessions
    /// reached.
    pub fn send_all(&self, from: &str, payload: &Envelope, include_self: bool) -> usize {
        self.fan_out(from, payload, include_self, |_| true)
    }

    /// Send to every member of `group`, skipping `from` unless `include_self`.
    ///
    /// Membership is read once per recipient when the send starts. Returns
    /// the number of sessions reached.
    pub fn send_multi(
        &self,
        from: &str,
        group: &str,
        payload: &Envelope,
        include_self: bool,
    ) -> usize {
        self.fan_out(from, payload, include_self, |s| s.in_group(group))
    }

    fn fan_out<F>(&self, from: &str, payload: &Envelope, include_self: bool, filter: F) -> usize
    where
        F: Fn(&Session) -> bool,
    {
        let targets: Vec<Arc<Session>> = self
            .sessions()
            .into_iter()
            .filter(|s| (include_self || s.id() != from) && filter(&**s))
            .collect();
        let mut reached = 0;
        for session in &targets {
            if session.is_closed() {
                continue;
            }
            if self.deliver(from, session, payload.clone()).is_ok() {
                reached += 1;
            }
        }
        reached
    }

    /// Shared send primitive. On failure the recipient is removed and
    /// force-disconnected, and the error is returned.
    pub fn deliver(&self, from: &str, session: &Arc<Session>, payload: Envelope) -> Result<()> {
        match session.send(from, payload) {
            Ok(()) => Ok(()),
            Err(e) => {
                error!(session_id = session.id(), from, error = %e, "send failed, removing session");
                counter!("rws_send_failures_total").increment(1);
                self.remove_session(session);
                if session.is_connected() {
                    session.disconnect();
                }
                Err(e)
            }
        }
    }

    // ── Multicast queries ───────────────────────────────────────────

    /// Union of every live session's groups.
    pub fn list_groups(&self) -> BTreeSet<String> {
        self.sessions
            .iter()
            .flat_map(|entry| entry.value().groups())
            .collect()
    }

    /// Live sessions in `group`, ordered by id.
    pub fn list_members(&self, group: &str) -> Vec<Arc<Session>> {
        let mut members: Vec<Arc<Session>> = self
            .sessions()
            .into_iter()
            .filter(|s| s.in_group(group))
            .collect();
        members.sort_by_key(|s| s.id().parse::<u64>().unwrap_or(u64::MAX));
        members
    }

    // ── Attributes ──────────────────────────────────────────────────

    /// Read a registry-wide attribute.
    pub fn attribute(&self, key: &str) -> Option<Instance> {
        self.attributes
            .get(key)
            .map(|entry| Arc::clone(entry.value()))
    }

    /// Store a registry-wide attribute, returning the previous value.
    pub fn set_attribute(&self, key: &str, value: Instance) -> Option<Instance> {
        self.attributes.insert(key.to_owned(), value)
    }

    /// Remove a registry-wide attribute.
    pub fn remove_attribute(&self, key: &str) -> Option<Instance> {
        self.attributes.remove(key).map(|(_, v)| v)
    }

    /// Registry-wide attribute keys, sorted.
    pub fn attribute_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .attributes
            .iter()
            .map(|entry| entry.key().clone())
            .collect();
        names.sort();
        names
    }

    // ── Listeners ───────────────────────────────────────────────────

    /// Add a lifecycle listener. Returns `false` if already added.
    pub fn add_session_listener(&self, listener: Arc<dyn SessionListener>) -> bool {
        self.session_listeners.add(listener)
    }

    /// Remove a lifecycle listener.
    pub fn remove_session_listener(&self, listener: &Arc<dyn SessionListener>) -> bool {
        self.session_listeners.remove(listener)
    }

    /// Add a multicast listener. Returns `false` if already added.
    pub fn add_multicast_listener(&self, listener: Arc<dyn MulticastListener>) -> bool {
        self.multicast_listeners.add(listener)
    }

    /// Remove a multicast listener.
    pub fn remove_multicast_listener(&self, listener: &Arc<dyn MulticastListener>) -> bool {
        self.multicast_listeners.remove(listener)
    }

    pub(crate) fn fire_change(&self, session: &Arc<Session>) {
        self.session_listeners
            .fire("change", |l| l.change(session));
    }

    pub(crate) fn fire_join(&self, group: &str, session: &Arc<Session>) {
        self.multicast_listeners
            .fire("join", |l| l.join(group, session));
    }

    pub(crate) fn fire_leave(&self, group: &str, session: &Arc<Session>) {
        self.multicast_listeners
            .fire("leave", |l| l.leave(group, session));
    }
}

impl fmt::Debug for RwsContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RwsContext")
            .field("sessions", &self.sessions.len())
            .field("objects", &self.registry.object_names())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::{ListenerError, ListenerResult};
    use crate::test_support::{TestBed, envelope};
    use parking_lot::Mutex;
    use serde_json::json;

    #[derive(Default)]
    struct Journal {
        entries: Mutex<Vec<String>>,
    }

    impl Journal {
        fn entries(&self) -> Vec<String> {
            self.entries.lock().clone()
        }
    }

    impl SessionListener for Journal {
        fn connect(&self, session: &Arc<Session>) -> ListenerResult {
            self.entries.lock().push(format!("connect {}", session.id()));
            Ok(())
        }

        fn disconnect(&self, session: &Arc<Session>) -> ListenerResult {
            self.entries.lock().push(format!("disconnect {}", session.id()));
            Ok(())
        }

        fn change(&self, session: &Arc<Session>) -> ListenerResult {
            self.entries.lock().push(format!("change {}", session.name()));
            Ok(())
        }
    }

    impl MulticastListener for Journal {
        fn join(&self, group: &str, session: &Arc<Session>) -> ListenerResult {
            self.entries.lock().push(format!("join {group} {}", session.id()));
            Ok(())
        }

        fn leave(&self, group: &str, session: &Arc<Session>) -> ListenerResult {
            self.entries.lock().push(format!("leave {group} {}", session.id()));
            Ok(())
        }
    }

    struct Grumpy;

    impl SessionListener for Grumpy {
        fn connect(&self, _session: &Arc<Session>) -> ListenerResult {
            Err::<(), ListenerError>("not today".into())
        }

        fn disconnect(&self, _session: &Arc<Session>) -> ListenerResult {
            panic!("refusing to say goodbye");
        }
    }

    #[test]
    fn ids_are_sequential_and_unique() {
        let bed = TestBed::new();
        let ids: Vec<String> = (0..5).map(|_| bed.connect().0.id().to_owned()).collect();
        assert_eq!(ids, vec!["1", "2", "3", "4", "5"]);
        assert_eq!(bed.context.session_count(), 5);
    }

    #[test]
    fn lifecycle_events_in_order() {
        let bed = TestBed::new();
        let journal = Arc::new(Journal::default());
        assert!(bed.context.add_session_listener(journal.clone()));
        let (a, _) = bed.connect();
        a.set_name("alice");
        a.set_name("alice");
        bed.context.remove_session(&a);
        bed.context.remove_session(&a);
        assert_eq!(
            journal.entries(),
            vec!["connect 1", "change alice", "change alice", "disconnect 1"]
        );
    }

    #[test]
    fn failing_listeners_do_not_block_others() {
        let bed = TestBed::new();
        let journal = Arc::new(Journal::default());
        let _ = bed.context.add_session_listener(Arc::new(Grumpy));
        let _ = bed.context.add_session_listener(journal.clone());
        let (a, _) = bed.connect();
        bed.context.remove_session(&a);
        assert_eq!(journal.entries(), vec!["connect 1", "disconnect 1"]);
        assert!(bed.context.session("1").is_none());
    }

    #[test]
    fn removing_listener_stops_notifications() {
        let bed = TestBed::new();
        let journal = Arc::new(Journal::default());
        let listener: Arc<dyn SessionListener> = journal.clone();
        let _ = bed.context.add_session_listener(Arc::clone(&listener));
        assert!(bed.context.remove_session_listener(&listener));
        let _ = bed.connect();
        assert!(journal.entries().is_empty());
    }

    #[test]
    fn join_leave_events_fire_per_state_change() {
        let bed = TestBed::new();
        let journal = Arc::new(Journal::default());
        let _ = bed.context.add_multicast_listener(journal.clone());
        let (a, _) = bed.connect();
        let _ = a.join("room");
        let _ = a.join("room");
        let _ = a.leave("room");
        let _ = a.leave("room");
        assert_eq!(journal.entries(), vec!["join room 1", "leave room 1"]);
    }

    #[test]
    fn removal_clears_state() {
        let bed = TestBed::new();
        let (a, _) = bed.connect();
        let _ = a.set_attribute("k", Arc::new(1_u8));
        let _ = a.join("room");
        bed.context.remove_session(&a);
        assert!(a.is_closed());
        assert!(a.attribute_names().is_empty());
        assert!(bed.context.list_groups().is_empty());
        assert_eq!(bed.context.send_all("sys", &envelope(json!({})), true), 0);
    }

    #[test]
    fn send_all_respects_include_self() {
        let bed = TestBed::new();
        let (a, out_a) = bed.connect();
        let (_b, out_b) = bed.connect();
        let msg = envelope(json!({"n": 1}));
        assert_eq!(bed.context.send_all(a.id(), &msg, false), 1);
        assert!(out_a.messages().is_empty());
        assert_eq!(out_b.messages().len(), 1);
        assert_eq!(bed.context.send_all(a.id(), &msg, true), 2);
        assert_eq!(out_a.messages(), vec![json!({"from": "1", "n": 1})]);
    }

    #[test]
    fn one_broken_recipient_does_not_stop_fan_out() {
        let bed = TestBed::new();
        let (_a, out_a) = bed.connect();
        let (b, out_b) = bed.connect();
        let (_c, out_c) = bed.connect();
        out_b.fail_sends();
        let reached = bed.context.send_all("sys", &envelope(json!({"n": 1})), true);
        assert_eq!(reached, 2);
        assert_eq!(out_a.messages().len(), 1);
        assert_eq!(out_c.messages().len(), 1);
        assert!(bed.context.session(b.id()).is_none());
        assert!(!out_b.is_connected());
    }

    #[test]
    fn send_multi_uses_membership_at_call_time() {
        let bed = TestBed::new();
        let (a, _) = bed.connect();
        let (b, out_b) = bed.connect();
        let (c, out_c) = bed.connect();
        let _ = a.join("room");
        let _ = b.join("room");
        let msg = envelope(json!({"text": "hi"}));
        assert_eq!(bed.context.send_multi(a.id(), "room", &msg, false), 1);
        let _ = c.join("room");
        assert_eq!(out_b.messages().len(), 1);
        assert!(out_c.messages().is_empty());
        assert_eq!(bed.context.send_multi(a.id(), "room", &msg, true), 3);
    }

    #[test]
    fn send_to_unknown_is_silent() {
        let bed = TestBed::new();
        assert!(bed.context.send_to("sys", "42", envelope(json!({}))).is_ok());
    }

    #[test]
    fn groups_and_members() {
        let bed = TestBed::new();
        let (a, _) = bed.connect();
        let (b, _) = bed.connect();
        let _ = a.join("red");
        let _ = b.join("red");
        let _ = b.join("blue");
        let groups: Vec<String> = bed.context.list_groups().into_iter().collect();
        assert_eq!(groups, vec!["blue", "red"]);
        let members: Vec<String> = bed
            .context
            .list_members("red")
            .iter()
            .map(|s| s.id().to_owned())
            .collect();
        assert_eq!(members, vec!["1", "2"]);
        assert!(bed.context.list_members("green").is_empty());
    }

    #[test]
    fn context_attributes() {
        let bed = TestBed::new();
        assert!(bed.context.set_attribute("motd", Arc::new("hello")).is_none());
        let value = bed.context.attribute("motd").unwrap();
        assert_eq!(value.downcast_ref::<&str>(), Some(&"hello"));
        assert_eq!(bed.context.attribute_names(), vec!["motd"]);
        assert!(bed.context.remove_attribute("motd").is_some());
        assert!(bed.context.attribute("motd").is_none());
    }

    #[test]
    fn shutdown_disconnects_everyone() {
        let bed = TestBed::new();
        let (_a, out_a) = bed.connect();
        let (_b, out_b) = bed.connect();
        bed.context.shutdown();
        assert_eq!(bed.context.session_count(), 0);
        assert!(!out_a.is_connected());
        assert!(!out_b.is_connected());
    }

    #[test]
    fn concurrent_connect_and_disconnect() {
        let bed = TestBed::new();
        let context = Arc::clone(&bed.context);
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let context = Arc::clone(&context);
                std::thread::spawn(move || {
                    for _ in 0..50 {
                        let adapter = Arc::new(crate::test_support::RecordingAdapter::default());
                        let session = context.add_session(adapter);
                        let _ = context.send_all(session.id(), &Envelope::new(), false);
                        context.remove_session(&session);
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(context.session_count(), 0);
    }
}

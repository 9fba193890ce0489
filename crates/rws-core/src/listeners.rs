//! Lifecycle and multicast listeners.

use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::warn;

use crate::errors::ListenerResult;
use crate::session::Session;

/// Observes sessions coming and going.
pub trait SessionListener: Send + Sync {
    /// A session was added.
    fn connect(&self, _session: &Arc<Session>) -> ListenerResult {
        Ok(())
    }

    /// A session was removed. Fires exactly once per session.
    fn disconnect(&self, _session: &Arc<Session>) -> ListenerResult {
        Ok(())
    }

    /// A session changed its display name.
    fn change(&self, _session: &Arc<Session>) -> ListenerResult {
        Ok(())
    }
}

/// Observes multicast group membership.
pub trait MulticastListener: Send + Sync {
    /// `session` joined `group`.
    fn join(&self, _group: &str, _session: &Arc<Session>) -> ListenerResult {
        Ok(())
    }

    /// `session` left `group`.
    fn leave(&self, _group: &str, _session: &Arc<Session>) -> ListenerResult {
        Ok(())
    }
}

/// Copy-on-write listener list.
///
/// Adding or removing replaces the list, firing walks a snapshot in
/// registration order. Adding the same `Arc` twice is a no-op.
pub struct ListenerSet<L: ?Sized> {
    listeners: RwLock<Arc<Vec<Arc<L>>>>,
}

impl<L: ?Sized> Default for ListenerSet<L> {
    fn default() -> Self {
        Self {
            listeners: RwLock::new(Arc::new(Vec::new())),
        }
    }
}

impl<L: ?Sized> ListenerSet<L> {
    /// Create an empty set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a listener. Returns `false` if it was already present.
    pub fn add(&self, listener: Arc<L>) -> bool {
        let mut guard = self.listeners.write();
        if guard.iter().any(|l| Arc::ptr_eq(l, &listener)) {
            return false;
        }
        let mut next = (**guard).clone();
        next.push(listener);
        *guard = Arc::new(next);
        true
    }

    /// Remove a listener. Returns `false` if it was not present.
    pub fn remove(&self, listener: &Arc<L>) -> bool {
        let mut guard = self.listeners.write();
        if !guard.iter().any(|l| Arc::ptr_eq(l, listener)) {
            return false;
        }
        let next: Vec<Arc<L>> = guard
            .iter()
            .filter(|l| !Arc::ptr_eq(l, listener))
            .cloned()
            .collect();
        *guard = Arc::new(next);
        true
    }

    /// Number of listeners.
    pub fn len(&self) -> usize {
        self.listeners.read().len()
    }

    /// Whether the set is empty.
    pub fn is_empty(&self) -> bool {
        self.listeners.read().is_empty()
    }

    /// Call `f` on every listener. Errors and panics are logged and skipped.
    pub fn fire<F>(&self, event: &'static str, f: F)
    where
        F: Fn(&L) -> ListenerResult,
    {
        let snapshot = Arc::clone(&self.listeners.read());
        for (index, listener) in snapshot.iter().enumerate() {
            match catch_unwind(AssertUnwindSafe(|| f(&**listener))) {
                Ok(Ok(())) => {}
                Ok(Err(e)) => warn!(event, index, error = %e, "listener failed"),
                Err(_) => warn!(event, index, "listener panicked"),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::ListenerError;
    use crate::logging::capture_logs;
    use parking_lot::Mutex;

    trait Probe: Send + Sync {
        fn hit(&self, n: u32) -> ListenerResult;
    }

    struct Recorder {
        tag: &'static str,
        log: Arc<Mutex<Vec<&'static str>>>,
    }

    impl Probe for Recorder {
        fn hit(&self, _n: u32) -> ListenerResult {
            self.log.lock().push(self.tag);
            Ok(())
        }
    }

    struct Failing;

    impl Probe for Failing {
        fn hit(&self, n: u32) -> ListenerResult {
            Err::<(), ListenerError>(format!("failed on {n}").into())
        }
    }

    struct Panicking;

    impl Probe for Panicking {
        fn hit(&self, _n: u32) -> ListenerResult {
            panic!("listener panicked");
        }
    }

    fn recorder(tag: &'static str, log: &Arc<Mutex<Vec<&'static str>>>) -> Arc<dyn Probe> {
        Arc::new(Recorder {
            tag,
            log: Arc::clone(log),
        })
    }

    #[test]
    fn fires_in_registration_order() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let set: ListenerSet<dyn Probe> = ListenerSet::new();
        assert!(set.add(recorder("a", &log)));
        assert!(set.add(recorder("b", &log)));
        set.fire("probe", |l| l.hit(1));
        assert_eq!(*log.lock(), vec!["a", "b"]);
    }

    #[test]
    fn duplicate_add_is_ignored() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let set: ListenerSet<dyn Probe> = ListenerSet::new();
        let a = recorder("a", &log);
        assert!(set.add(Arc::clone(&a)));
        assert!(!set.add(Arc::clone(&a)));
        assert_eq!(set.len(), 1);
        assert!(set.remove(&a));
        assert!(!set.remove(&a));
        assert!(set.is_empty());
    }

    #[test]
    fn failing_listeners_do_not_stop_the_rest() {
        let (logs, _guard) = capture_logs();
        let log = Arc::new(Mutex::new(Vec::new()));
        let set: ListenerSet<dyn Probe> = ListenerSet::new();
        let _ = set.add(Arc::new(Failing));
        let _ = set.add(Arc::new(Panicking));
        let _ = set.add(recorder("after", &log));

        set.fire("probe", |l| l.hit(7));

        assert_eq!(*log.lock(), vec!["after"]);
        assert!(logs.has_message("listener failed"));
        assert!(logs.has_message("listener panicked"));
    }
}

//! Capability resolver seam.
//!
//! A [`CapabilityResolver`] tells the object registry which operations and
//! events a target type exposes, creates instances of it and performs the
//! actual invocation. [`MethodTable`] is the explicit-registration
//! implementation: every operation is a closure with declared parameter
//! types, every event an [`EventSource`] reachable from the instance.

use std::any::Any;
use std::fmt;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::RwLock;
use tracing::{debug, warn};

use crate::errors::{CapabilityError, ListenerResult};
use crate::native::Native;
use crate::session::Session;

/// A live target instance (or any attribute value).
pub type Instance = Arc<dyn Any + Send + Sync>;

/// Callback invoked with the payload every time a subscribed event fires.
pub type EventSink = Arc<dyn Fn(Native) -> ListenerResult + Send + Sync>;

/// Name and declared parameter types of an operation.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct OperationSignature {
    /// Operation name.
    pub name: String,
    /// Declared parameter types, used to decode wire arguments.
    pub params: Vec<String>,
}

impl OperationSignature {
    /// Build a signature.
    pub fn new(name: impl Into<String>, params: &[&str]) -> Self {
        Self {
            name: name.into(),
            params: params.iter().map(|p| (*p).to_owned()).collect(),
        }
    }
}

/// Name and actions of an event.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EventSignature {
    /// Event name.
    pub name: String,
    /// Actions (sub-events) a subscriber can pick.
    pub actions: Vec<String>,
}

impl EventSignature {
    /// Build a signature.
    pub fn new(name: impl Into<String>, actions: &[&str]) -> Self {
        Self {
            name: name.into(),
            actions: actions.iter().map(|a| (*a).to_owned()).collect(),
        }
    }

    /// Whether the event has this action.
    pub fn has_action(&self, action: &str) -> bool {
        self.actions.iter().any(|a| a == action)
    }
}

/// Opaque handle cancelling one subscription.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct SubscriptionToken(u64);

impl SubscriptionToken {
    /// Wrap a resolver-chosen value.
    pub fn new(value: u64) -> Self {
        Self(value)
    }

    /// The wrapped value.
    pub fn get(self) -> u64 {
        self.0
    }
}

/// Per-call context handed to operations.
#[derive(Clone, Copy)]
pub struct CallContext<'a> {
    /// The session the call arrived on.
    pub session: &'a Arc<Session>,
}

impl<'a> CallContext<'a> {
    /// Context for a call made by `session`.
    pub fn new(session: &'a Arc<Session>) -> Self {
        Self { session }
    }
}

/// Enumerates and drives the operations and events of one target type.
pub trait CapabilityResolver: Send + Sync {
    /// Fully-qualified name of the target type.
    fn type_name(&self) -> &str;

    /// Every operation the type has, overloads included.
    fn operations(&self) -> Vec<OperationSignature>;

    /// Every event the type has.
    fn events(&self) -> Vec<EventSignature>;

    /// Create a fresh instance.
    fn instantiate(&self) -> Result<Instance, CapabilityError>;

    /// Run an operation on an instance with already-decoded arguments.
    fn invoke(
        &self,
        cx: &CallContext<'_>,
        instance: &Instance,
        operation: &str,
        args: Vec<Native>,
    ) -> Result<Native, CapabilityError>;

    /// Attach `sink` to one action of an event.
    fn subscribe(
        &self,
        instance: &Instance,
        event: &str,
        action: &str,
        sink: EventSink,
    ) -> Result<SubscriptionToken, CapabilityError>;

    /// Detach a sink. Unknown tokens are ignored.
    fn unsubscribe(
        &self,
        instance: &Instance,
        event: &str,
        token: SubscriptionToken,
    ) -> Result<(), CapabilityError>;
}

// ── Event source ────────────────────────────────────────────────────

#[derive(Clone)]
struct Subscriber {
    token: SubscriptionToken,
    action: String,
    sink: EventSink,
}

/// Event listener list owned by a target instance.
///
/// Subscribing and unsubscribing replace the list; firing iterates a
/// snapshot, so sinks can (un)subscribe from inside a callback.
pub struct EventSource {
    subscribers: RwLock<Arc<Vec<Subscriber>>>,
    next_token: AtomicU64,
}

impl Default for EventSource {
    fn default() -> Self {
        Self {
            subscribers: RwLock::new(Arc::new(Vec::new())),
            next_token: AtomicU64::new(1),
        }
    }
}

impl EventSource {
    /// Create an empty source.
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach a sink to `action`.
    pub fn subscribe(&self, action: &str, sink: EventSink) -> SubscriptionToken {
        let token = SubscriptionToken(self.next_token.fetch_add(1, Ordering::Relaxed));
        let mut guard = self.subscribers.write();
        let mut next = (**guard).clone();
        next.push(Subscriber {
            token,
            action: action.to_owned(),
            sink,
        });
        *guard = Arc::new(next);
        token
    }

    /// Detach a sink. Returns whether it was attached.
    pub fn unsubscribe(&self, token: SubscriptionToken) -> bool {
        let mut guard = self.subscribers.write();
        if !guard.iter().any(|s| s.token == token) {
            return false;
        }
        let next: Vec<Subscriber> = guard
            .iter()
            .filter(|s| s.token != token)
            .cloned()
            .collect();
        *guard = Arc::new(next);
        true
    }

    /// Number of attached sinks.
    pub fn subscriber_count(&self) -> usize {
        self.subscribers.read().len()
    }

    /// Deliver `data` to every sink attached to `action`.
    ///
    /// A sink that errors or panics is logged and skipped. Returns the number
    /// of sinks that accepted the event.
    pub fn fire(&self, action: &str, data: impl Into<Native>) -> usize {
        let data = data.into();
        let snapshot = Arc::clone(&self.subscribers.read());
        let mut delivered = 0;
        for subscriber in snapshot.iter().filter(|s| s.action == action) {
            match catch_unwind(AssertUnwindSafe(|| (subscriber.sink)(data.clone()))) {
                Ok(Ok(())) => delivered += 1,
                Ok(Err(e)) => {
                    warn!(action, token = subscriber.token.0, error = %e, "event sink failed");
                }
                Err(_) => {
                    warn!(action, token = subscriber.token.0, "event sink panicked");
                }
            }
        }
        debug!(action, delivered, "event fired");
        delivered
    }
}

impl fmt::Debug for EventSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventSource")
            .field("subscribers", &self.subscriber_count())
            .finish()
    }
}

// ── Method table ────────────────────────────────────────────────────

type Factory<T> = Box<dyn Fn() -> Result<T, CapabilityError> + Send + Sync>;
type OperationFn<T> =
    Box<dyn Fn(&CallContext<'_>, &T, Vec<Native>) -> Result<Native, CapabilityError> + Send + Sync>;
type EventAccessor<T> = Box<dyn for<'a> Fn(&'a T) -> &'a EventSource + Send + Sync>;

/// Explicit method table for a concrete target type.
pub struct MethodTable<T> {
    type_name: String,
    factory: Option<Factory<T>>,
    operations: Vec<(OperationSignature, OperationFn<T>)>,
    events: Vec<(EventSignature, EventAccessor<T>)>,
}

impl<T: Send + Sync + 'static> MethodTable<T> {
    /// Empty table named after `T`.
    pub fn new() -> Self {
        Self {
            type_name: std::any::type_name::<T>().to_owned(),
            factory: None,
            operations: Vec::new(),
            events: Vec::new(),
        }
    }

    /// Override the reported type name.
    #[must_use]
    pub fn named(mut self, name: impl Into<String>) -> Self {
        self.type_name = name.into();
        self
    }

    /// Constructor used for per-call and per-connection instances.
    #[must_use]
    pub fn factory<F>(mut self, factory: F) -> Self
    where
        F: Fn() -> Result<T, CapabilityError> + Send + Sync + 'static,
    {
        self.factory = Some(Box::new(factory));
        self
    }

    /// Add an operation. Adding the same name twice declares an overload.
    #[must_use]
    pub fn operation<F>(mut self, name: &str, params: &[&str], f: F) -> Self
    where
        F: Fn(&CallContext<'_>, &T, Vec<Native>) -> Result<Native, CapabilityError>
            + Send
            + Sync
            + 'static,
    {
        self.operations
            .push((OperationSignature::new(name, params), Box::new(f)));
        self
    }

    /// Add an event backed by an [`EventSource`] on the instance.
    #[must_use]
    pub fn event<F>(mut self, name: &str, actions: &[&str], accessor: F) -> Self
    where
        F: for<'a> Fn(&'a T) -> &'a EventSource + Send + Sync + 'static,
    {
        self.events
            .push((EventSignature::new(name, actions), Box::new(accessor)));
        self
    }

    fn downcast<'i>(&self, instance: &'i Instance) -> Result<&'i T, CapabilityError> {
        (**instance)
            .downcast_ref::<T>()
            .ok_or_else(|| CapabilityError::WrongInstance(self.type_name.clone()))
    }

    fn event_source<'i>(
        &self,
        instance: &'i Instance,
        event: &str,
    ) -> Result<(&EventSignature, &'i EventSource), CapabilityError> {
        let target = self.downcast(instance)?;
        let (signature, accessor) = self
            .events
            .iter()
            .find(|(sig, _)| sig.name == event)
            .ok_or_else(|| CapabilityError::NotFound(format!("event '{event}'")))?;
        Ok((signature, accessor(target)))
    }
}

impl<T: Send + Sync + 'static> Default for MethodTable<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Send + Sync + 'static> CapabilityResolver for MethodTable<T> {
    fn type_name(&self) -> &str {
        &self.type_name
    }

    fn operations(&self) -> Vec<OperationSignature> {
        self.operations.iter().map(|(sig, _)| sig.clone()).collect()
    }

    fn events(&self) -> Vec<EventSignature> {
        self.events.iter().map(|(sig, _)| sig.clone()).collect()
    }

    fn instantiate(&self) -> Result<Instance, CapabilityError> {
        let factory = self
            .factory
            .as_ref()
            .ok_or_else(|| CapabilityError::NotInstantiable(self.type_name.clone()))?;
        let instance: Instance = Arc::new(factory()?);
        Ok(instance)
    }

    fn invoke(
        &self,
        cx: &CallContext<'_>,
        instance: &Instance,
        operation: &str,
        args: Vec<Native>,
    ) -> Result<Native, CapabilityError> {
        let target = self.downcast(instance)?;
        let (_, f) = self
            .operations
            .iter()
            .find(|(sig, _)| sig.name == operation)
            .ok_or_else(|| CapabilityError::NotFound(format!("operation '{operation}'")))?;
        f(cx, target, args)
    }

    fn subscribe(
        &self,
        instance: &Instance,
        event: &str,
        action: &str,
        sink: EventSink,
    ) -> Result<SubscriptionToken, CapabilityError> {
        let (signature, source) = self.event_source(instance, event)?;
        if !signature.has_action(action) {
            return Err(CapabilityError::NotFound(format!(
                "action '{action}' of event '{event}'"
            )));
        }
        Ok(source.subscribe(action, sink))
    }

    fn unsubscribe(
        &self,
        instance: &Instance,
        event: &str,
        token: SubscriptionToken,
    ) -> Result<(), CapabilityError> {
        let (_, source) = self.event_source(instance, event)?;
        let _ = source.unsubscribe(token);
        Ok(())
    }
}

impl<T> fmt::Debug for MethodTable<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MethodTable")
            .field("type_name", &self.type_name)
            .field("operations", &self.operations.len())
            .field("events", &self.events.len())
            .finish()
    }
}

/// Pull the argument at `index` out of a decoded argument list.
pub fn arg(args: &[Native], index: usize) -> Result<&Native, CapabilityError> {
    args.get(index)
        .ok_or_else(|| CapabilityError::BadArgument(format!("missing argument {index}")))
}

/// Read the argument at `index` as a string.
pub fn str_arg(args: &[Native], index: usize) -> Result<&str, CapabilityError> {
    arg(args, index)?
        .as_str()
        .ok_or_else(|| CapabilityError::BadArgument(format!("argument {index} is not a string")))
}

/// Read the argument at `index` as an integer.
pub fn int_arg(args: &[Native], index: usize) -> Result<i64, CapabilityError> {
    arg(args, index)?
        .as_i64()
        .ok_or_else(|| CapabilityError::BadArgument(format!("argument {index} is not an integer")))
}

/// Read the argument at `index` as a number.
pub fn num_arg(args: &[Native], index: usize) -> Result<f64, CapabilityError> {
    arg(args, index)?
        .as_f64()
        .ok_or_else(|| CapabilityError::BadArgument(format!("argument {index} is not a number")))
}

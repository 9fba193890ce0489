//! # rws-core
//!
//! Session registry, message routing and object registry for remote
//! `WebSocket` scripting.
//!
//! - **Context**: `RwsContext` owns the live sessions, fans messages out
//!   (direct, broadcast, multicast) and notifies lifecycle listeners
//! - **Session**: per-connection routing of inbound envelopes, call dispatch,
//!   event subscriptions, group membership
//! - **Object registry**: script names to capability descriptors, instance
//!   scopes, argument/result conversion, client stub scripts
//! - **Converters**: glob-matched value converters and type stub generation
//! - **Capability resolvers**: the seam through which operations and events
//!   of a target type are discovered and driven (`MethodTable`)
//!
//! The crate is transport-agnostic and synchronous; transports implement
//! `TransportAdapter` and feed inbound frames to `Session::handle_text`.

#![deny(unsafe_code)]

pub mod builtin;
pub mod capability;
pub mod context;
pub mod converter;
pub mod errors;
pub mod listeners;
pub mod logging;
pub mod native;
pub mod object;
pub mod pattern;
pub mod registry;
pub mod session;
pub mod transport;
pub mod types;

#[cfg(test)]
pub(crate) mod test_support;

pub use capability::{
    CallContext, CapabilityResolver, EventSink, EventSource, Instance, MethodTable,
    SubscriptionToken,
};
pub use context::RwsContext;
pub use converter::{ConverterRegistry, SerdeConverter, StubGenerator, ValueConverter};
pub use errors::{CapabilityError, ListenerResult, Result, RwsError, TransportError};
pub use listeners::{MulticastListener, SessionListener};
pub use native::{Native, NativeObject};
pub use object::{CapabilityDescriptor, Filter, Scope};
pub use registry::{InstanceTarget, ObjectRegistry};
pub use session::Session;
pub use transport::TransportAdapter;
pub use types::{Envelope, SubscriptionSpec};

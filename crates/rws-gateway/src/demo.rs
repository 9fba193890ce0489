//! Demo objects served by the gateway.
//!
//! - `calc`: stateless arithmetic, a fresh instance per call
//! - `geometry`: operations over `Point` values converted with serde
//! - `chat`: one shared room; posts are fired as `messages.posted` events

use std::collections::VecDeque;
use std::sync::Arc;

use parking_lot::Mutex;
use rws_core::capability::{arg, num_arg, str_arg};
use rws_core::{
    CapabilityDescriptor, CapabilityError, EventSource, Instance, ListenerResult, MethodTable,
    Native, RwsContext, Scope, SerdeConverter, Session, SessionListener,
};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tracing::info;

/// Chat posts kept for `chat.history`.
const HISTORY_LIMIT: usize = 50;

#[derive(Debug, Default)]
struct Calc;

/// A 2D point, sent over the wire as `{"x", "y", "class": "Point"}`.
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Point {
    /// Horizontal coordinate.
    pub x: f64,
    /// Vertical coordinate.
    pub y: f64,
}

#[derive(Debug, Default)]
struct Geometry;

/// Shared chat room.
#[derive(Debug, Default)]
pub struct ChatRoom {
    history: Mutex<VecDeque<Value>>,
    messages: EventSource,
}

impl ChatRoom {
    fn post(&self, from: &str, text: &str) -> Value {
        let entry = json!({
            "from": from,
            "text": text,
            "at": chrono::Utc::now().to_rfc3339(),
        });
        {
            let mut history = self.history.lock();
            if history.len() == HISTORY_LIMIT {
                let _ = history.pop_front();
            }
            history.push_back(entry.clone());
        }
        let _ = self.messages.fire("posted", Native::wire(entry.clone()));
        entry
    }

    fn history(&self) -> Vec<Value> {
        self.history.lock().iter().cloned().collect()
    }
}

fn point_arg(args: &[Native], index: usize) -> Result<Point, CapabilityError> {
    arg(args, index)?
        .downcast_ref::<Point>()
        .copied()
        .ok_or_else(|| CapabilityError::BadArgument(format!("argument {index} is not a Point")))
}

fn calc_table() -> MethodTable<Calc> {
    MethodTable::<Calc>::new()
        .factory(|| Ok(Calc))
        .operation("add", &["number", "number"], |_, _, args| {
            Ok(Native::wire(num_arg(&args, 0)? + num_arg(&args, 1)?))
        })
        .operation("sub", &["number", "number"], |_, _, args| {
            Ok(Native::wire(num_arg(&args, 0)? - num_arg(&args, 1)?))
        })
        .operation("mul", &["number", "number"], |_, _, args| {
            Ok(Native::wire(num_arg(&args, 0)? * num_arg(&args, 1)?))
        })
        .operation("div", &["number", "number"], |_, _, args| {
            let divisor = num_arg(&args, 1)?;
            if divisor == 0.0 {
                return Err(CapabilityError::Failed("division by zero".into()));
            }
            Ok(Native::wire(num_arg(&args, 0)? / divisor))
        })
}

fn geometry_table() -> MethodTable<Geometry> {
    let point = std::any::type_name::<Point>();
    MethodTable::<Geometry>::new()
        .factory(|| Ok(Geometry))
        .operation("midpoint", &[point, point], |_, _, args| {
            let (a, b) = (point_arg(&args, 0)?, point_arg(&args, 1)?);
            Ok(Native::object(Point {
                x: (a.x + b.x) / 2.0,
                y: (a.y + b.y) / 2.0,
            }))
        })
        .operation("distance", &[point, point], |_, _, args| {
            let (a, b) = (point_arg(&args, 0)?, point_arg(&args, 1)?);
            Ok(Native::wire((a.x - b.x).hypot(a.y - b.y)))
        })
}

fn chat_table() -> MethodTable<ChatRoom> {
    MethodTable::<ChatRoom>::new()
        .operation("post", &["string"], |cx, room, args| {
            Ok(Native::wire(room.post(&cx.session.name(), str_arg(&args, 0)?)))
        })
        .operation("history", &[], |_, room, _| Ok(Native::wire(room.history())))
        .event("messages", &["posted"], |room| &room.messages)
}

/// Logs session lifecycle.
struct PresenceLog;

impl SessionListener for PresenceLog {
    fn connect(&self, session: &Arc<Session>) -> ListenerResult {
        info!(session_id = session.id(), "client joined");
        Ok(())
    }

    fn disconnect(&self, session: &Arc<Session>) -> ListenerResult {
        info!(session_id = session.id(), name = %session.name(), "client left");
        Ok(())
    }

    fn change(&self, session: &Arc<Session>) -> ListenerResult {
        info!(session_id = session.id(), name = %session.name(), "client renamed");
        Ok(())
    }
}

/// Register the demo objects and listeners on `context`. Returns the chat room.
pub fn register(context: &RwsContext) -> anyhow::Result<Arc<ChatRoom>> {
    let registry = context.registry();

    let _ = registry.converters().register(
        std::any::type_name::<Point>(),
        Arc::new(SerdeConverter::<Point>::new()),
        None,
    );

    let _ = registry.register(
        CapabilityDescriptor::builder("calc", Arc::new(calc_table()))
            .scope(Scope::PerCall)
            .build()?,
    );
    let _ = registry.register(
        CapabilityDescriptor::builder("geometry", Arc::new(geometry_table())).build()?,
    );

    let room = Arc::new(ChatRoom::default());
    let instance: Instance = room.clone();
    let _ = registry.register(
        CapabilityDescriptor::builder("chat", Arc::new(chat_table()))
            .instance(instance)
            .build()?,
    );

    let _ = context.add_session_listener(Arc::new(PresenceLog));
    info!(objects = ?registry.object_names(), "demo objects registered");
    Ok(room)
}

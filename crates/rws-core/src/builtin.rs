//! Built-in `__this__` object: session operations reachable over the wire.

use std::sync::Arc;

use serde_json::Value;

use crate::capability::{MethodTable, arg, str_arg};
use crate::errors::CapabilityError;
use crate::native::Native;
use crate::object::{CapabilityDescriptor, Scope};
use crate::registry::ObjectRegistry;
use crate::session::Session;
use crate::types::SubscriptionSpec;

/// Script name of the calling session's own object.
pub const SESSION_OBJECT: &str = "__this__";

/// Marker instance; every operation acts on the calling session.
#[derive(Debug, Default)]
struct ThisSession;

fn ids(sessions: &[Arc<Session>]) -> Native {
    Native::wire(
        sessions
            .iter()
            .map(|s| Value::String(s.id().to_owned()))
            .collect::<Vec<_>>(),
    )
}

fn group_list<'a>(groups: impl IntoIterator<Item = &'a String>) -> Native {
    Native::wire(
        groups
            .into_iter()
            .map(|g| Value::String(g.clone()))
            .collect::<Vec<_>>(),
    )
}

fn table() -> MethodTable<ThisSession> {
    MethodTable::<ThisSession>::new()
        .named("rws_core::session::Session")
        .factory(|| Ok(ThisSession))
        .operation("getId", &[], |cx, _, _| Ok(Native::wire(cx.session.id())))
        .operation("getName", &[], |cx, _, _| Ok(Native::wire(cx.session.name())))
        .operation("setName", &["string"], |cx, _, args| {
            cx.session.set_name(str_arg(&args, 0)?);
            Ok(Native::Null)
        })
        .operation("join", &["string"], |cx, _, args| {
            let _ = cx.session.join(str_arg(&args, 0)?);
            Ok(Native::Null)
        })
        .operation("leave", &["string"], |cx, _, args| {
            let _ = cx.session.leave(str_arg(&args, 0)?);
            Ok(Native::Null)
        })
        .operation("listMulticastGroups", &[], |cx, _, _| {
            Ok(group_list(&cx.session.groups()))
        })
        .operation("listGroups", &[], |cx, _, _| {
            let context = cx.session.context()?;
            Ok(group_list(&context.list_groups()))
        })
        .operation("listMembers", &["string"], |cx, _, args| {
            let context = cx.session.context()?;
            Ok(ids(&context.list_members(str_arg(&args, 0)?)))
        })
        .operation("subscribe", &["object"], |cx, _, args| {
            let raw = arg(&args, 0)?
                .as_value()
                .cloned()
                .ok_or_else(|| CapabilityError::BadArgument("expected an object".into()))?;
            let spec: SubscriptionSpec = serde_json::from_value(raw)
                .map_err(|e| CapabilityError::BadArgument(e.to_string()))?;
            cx.session.subscribe(spec)?;
            Ok(Native::Null)
        })
        .operation("unsubscribe", &["string"], |cx, _, args| {
            cx.session.unsubscribe(str_arg(&args, 0)?)?;
            Ok(Native::Null)
        })
}

/// Register the built-in objects.
pub fn register_builtins(registry: &ObjectRegistry) {
    let descriptor = CapabilityDescriptor::builder(SESSION_OBJECT, Arc::new(table()))
        .scope(Scope::Global)
        .build();
    match descriptor {
        Ok(descriptor) => {
            let _ = registry.register(descriptor);
        }
        Err(e) => tracing::error!(error = %e, "failed to register built-in session object"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capability::EventSource;
    use crate::test_support::TestBed;
    use serde_json::json;

    fn call(bed: &TestBed, session: &Arc<Session>, method: &str, params: Value) -> Value {
        let params = match params {
            Value::Array(items) => items,
            _ => Vec::new(),
        };
        bed.context
            .registry()
            .call(session, SESSION_OBJECT, method, params)
            .unwrap()
    }

    #[test]
    fn identity_and_name() {
        let bed = TestBed::new();
        let (a, _) = bed.connect();
        assert_eq!(call(&bed, &a, "getId", json!([])), json!("1"));
        assert_eq!(call(&bed, &a, "getName", json!([])), json!("Client #1"));
        assert_eq!(call(&bed, &a, "setName", json!(["alice"])), Value::Null);
        assert_eq!(a.name(), "alice");
    }

    #[test]
    fn each_session_sees_itself() {
        let bed = TestBed::new();
        let (a, _) = bed.connect();
        let (b, _) = bed.connect();
        assert_eq!(call(&bed, &a, "getId", json!([])), json!("1"));
        assert_eq!(call(&bed, &b, "getId", json!([])), json!("2"));
    }

    #[test]
    fn groups_over_the_wire() {
        let bed = TestBed::new();
        let (a, _) = bed.connect();
        let (b, _) = bed.connect();
        let _ = call(&bed, &a, "join", json!(["red"]));
        let _ = call(&bed, &b, "join", json!(["red"]));
        let _ = call(&bed, &b, "join", json!(["blue"]));
        assert_eq!(call(&bed, &a, "listMulticastGroups", json!([])), json!(["red"]));
        assert_eq!(call(&bed, &a, "listGroups", json!([])), json!(["blue", "red"]));
        assert_eq!(call(&bed, &a, "listMembers", json!(["red"])), json!(["1", "2"]));
        let _ = call(&bed, &b, "leave", json!(["red"]));
        assert_eq!(call(&bed, &a, "listMembers", json!(["red"])), json!(["1"]));
    }

    #[derive(Default)]
    struct Clock {
        ticks: EventSource,
    }

    #[test]
    fn subscribe_over_the_wire() {
        let bed = TestBed::new();
        let clock = Arc::new(Clock::default());
        let instance: crate::capability::Instance = clock.clone();
        let table = MethodTable::<Clock>::new().event("ticks", &["tick"], |c| &c.ticks);
        let _ = bed.context.registry().register(
            CapabilityDescriptor::builder("clock", Arc::new(table))
                .instance(instance)
                .build()
                .unwrap(),
        );
        let (a, out) = bed.connect();
        a.handle_text(
            r#"{"object":"__this__","method":"subscribe","id":1,
                "params":[{"handlerId":"h","object":"clock","event":"ticks","action":"tick"}]}"#,
        );
        let _ = clock.ticks.fire("tick", Native::wire("now"));
        a.handle_text(
            r#"{"object":"__this__","method":"subscribe","id":2,
                "params":[{"handlerId":"h","object":"clock","event":"ticks","action":"tick"}]}"#,
        );
        a.handle_text(r#"{"object":"__this__","method":"unsubscribe","params":["h"],"id":3}"#);
        let _ = clock.ticks.fire("tick", Native::wire("later"));

        let messages = out.messages();
        assert_eq!(messages.len(), 4);
        assert_eq!(messages[0], json!({"from": "sys", "id": 1, "result": null}));
        assert_eq!(messages[1], json!({"from": "sys", "id": "h", "event": "now"}));
        assert!(messages[2]["exception"]
            .as_str()
            .unwrap()
            .contains("already exists"));
        assert_eq!(messages[3], json!({"from": "sys", "id": 3, "result": null}));
    }

    #[test]
    fn subscription_mistakes_keep_their_error_kind() {
        let bed = TestBed::new();
        let (a, _) = bed.connect();
        let params = |object: &str| {
            vec![json!({"handlerId": "h", "object": object, "event": "ticks", "action": "tick"})]
        };
        let err = bed
            .context
            .registry()
            .call(&a, SESSION_OBJECT, "subscribe", params("nope"))
            .unwrap_err();
        assert_eq!(err.code(), crate::errors::UNKNOWN_OBJECT);
        assert!(!err.is_invocation());
        assert_eq!(err.to_string(), "Unknown object 'nope'");
    }

    #[test]
    fn duplicate_handler_is_rejected_not_failed() {
        let (logs, _guard) = crate::logging::capture_logs();
        let bed = TestBed::new();
        let clock = Arc::new(Clock::default());
        let instance: crate::capability::Instance = clock;
        let table = MethodTable::<Clock>::new().event("ticks", &["tick"], |c| &c.ticks);
        let _ = bed.context.registry().register(
            CapabilityDescriptor::builder("clock", Arc::new(table))
                .instance(instance)
                .build()
                .unwrap(),
        );
        let (a, _) = bed.connect();
        let spec = json!({"handlerId": "h", "object": "clock", "event": "ticks", "action": "tick"});
        let registry = bed.context.registry();
        assert!(registry
            .call(&a, SESSION_OBJECT, "subscribe", vec![spec.clone()])
            .is_ok());
        let err = registry
            .call(&a, SESSION_OBJECT, "subscribe", vec![spec])
            .unwrap_err();
        assert_eq!(err.code(), crate::errors::DUPLICATE_HANDLER);

        a.handle_text(
            r#"{"object":"__this__","method":"subscribe","id":1,
                "params":[{"handlerId":"h","object":"clock","event":"ticks","action":"tick"}]}"#,
        );
        assert!(logs.has_event(tracing::Level::WARN, "call rejected"));
        assert!(!logs.has_event(tracing::Level::ERROR, "call failed"));
    }

    #[test]
    fn malformed_subscription_is_rejected() {
        let bed = TestBed::new();
        let (a, out) = bed.connect();
        a.handle_text(r#"{"object":"__this__","method":"subscribe","params":[{"object":"x"}],"id":1}"#);
        assert!(out.messages()[0]["exception"].is_string());
    }
}

//! Object registry: script names to descriptors, instances and dispatch.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;
use serde_json::Value;
use tracing::{debug, info, instrument};

use crate::capability::{CallContext, EventSink, Instance, SubscriptionToken};
use crate::context::RwsContext;
use crate::converter::{ConverterRegistry, StubGenerator};
use crate::errors::{CapabilityError, Result, RwsError};
use crate::object::{CapabilityDescriptor, Scope};
use crate::session::Session;
use crate::types::{SYSTEM_ADDRESS, SubscriptionSpec};

/// Attribute key a named instance is stored under.
pub fn instance_key(name: &str) -> String {
    format!("__rws_instance__:{name}")
}

/// Where [`ObjectRegistry::register_instance`] stores the instance.
#[derive(Clone, Copy)]
pub enum InstanceTarget<'a> {
    /// Visible to one session only.
    Session(&'a Session),
    /// Visible to every session that has not bound its own.
    Context(&'a RwsContext),
}

struct Resolved {
    descriptor: Arc<CapabilityDescriptor>,
    binding: Option<String>,
}

/// Registered objects plus the converters that travel with them.
#[derive(Default)]
pub struct ObjectRegistry {
    objects: RwLock<Vec<Arc<CapabilityDescriptor>>>,
    bindings: RwLock<HashMap<String, Arc<CapabilityDescriptor>>>,
    converters: ConverterRegistry,
}

impl ObjectRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Converters used for arguments, results and event payloads.
    pub fn converters(&self) -> &ConverterRegistry {
        &self.converters
    }

    /// Register a descriptor. A previous registration under the same name is
    /// replaced in place, keeping its position for `match_object`.
    pub fn register(&self, descriptor: CapabilityDescriptor) -> Arc<CapabilityDescriptor> {
        let descriptor = Arc::new(descriptor);
        let name = descriptor.script_name().to_owned();
        let later: Vec<String> = {
            let mut objects = self.objects.write();
            if let Some(index) = objects.iter().position(|d| d.script_name() == name) {
                info!(object = %name, "replacing object registration");
                objects[index] = Arc::clone(&descriptor);
                objects[index + 1..]
                    .iter()
                    .map(|d| d.script_name().to_owned())
                    .collect()
            } else {
                info!(object = %name, scope = ?descriptor.scope(), "registering object");
                objects.push(Arc::clone(&descriptor));
                Vec::new()
            }
        };
        match descriptor.converter() {
            Some(conv) => {
                let _ = self.converters.replace_owned(
                    &name,
                    &descriptor.pattern().to_string(),
                    Arc::clone(&conv.converter),
                    &conv.wire_name,
                    &later,
                );
            }
            None => self.converters.unregister_owned(&name),
        }
        descriptor
    }

    /// Register a descriptor and bind `instance` under `instance_name`.
    ///
    /// Binding under the descriptor's own name in the context store provides
    /// the default instance for a per-connection object.
    pub fn register_instance(
        &self,
        descriptor: CapabilityDescriptor,
        target: InstanceTarget<'_>,
        instance_name: &str,
        instance: Instance,
    ) -> Arc<CapabilityDescriptor> {
        let descriptor = self.register(descriptor);
        let key = instance_key(instance_name);
        let _ = match target {
            InstanceTarget::Session(session) => session.set_attribute(&key, instance),
            InstanceTarget::Context(context) => context.set_attribute(&key, instance),
        };
        if instance_name != descriptor.script_name() {
            let _ = self
                .bindings
                .write()
                .insert(instance_name.to_owned(), Arc::clone(&descriptor));
        }
        debug!(object = %descriptor.script_name(), instance = instance_name, "bound instance");
        descriptor
    }

    /// Remove an object and its bindings. Returns whether it was registered.
    pub fn unregister(&self, name: &str) -> bool {
        let removed = {
            let mut objects = self.objects.write();
            let before = objects.len();
            objects.retain(|d| d.script_name() != name);
            before != objects.len()
        };
        if removed {
            self.bindings
                .write()
                .retain(|_, d| d.script_name() != name);
            self.converters.unregister_owned(name);
            info!(object = name, "unregistered object");
        }
        removed
    }

    /// Look up a descriptor by script name.
    pub fn get(&self, name: &str) -> Option<Arc<CapabilityDescriptor>> {
        self.objects
            .read()
            .iter()
            .find(|d| d.script_name() == name)
            .cloned()
    }

    /// Registered object names, in registration order.
    pub fn object_names(&self) -> Vec<String> {
        self.objects
            .read()
            .iter()
            .map(|d| d.script_name().to_owned())
            .collect()
    }

    /// Instance names bound to an object, sorted.
    pub fn instance_names(&self, script_name: &str) -> Vec<String> {
        let mut names: Vec<String> = self
            .bindings
            .read()
            .iter()
            .filter(|(_, d)| d.script_name() == script_name)
            .map(|(name, _)| name.clone())
            .collect();
        names.sort();
        names
    }

    /// First descriptor, in registration order, whose pattern matches `type_name`.
    pub fn match_object(&self, type_name: &str) -> Option<Arc<CapabilityDescriptor>> {
        self.objects
            .read()
            .iter()
            .find(|d| d.pattern().matches(type_name))
            .cloned()
    }

    fn resolve(&self, name: &str) -> Result<Resolved> {
        if let Some(descriptor) = self.get(name) {
            return Ok(Resolved {
                descriptor,
                binding: None,
            });
        }
        self.bindings
            .read()
            .get(name)
            .map(|descriptor| Resolved {
                descriptor: Arc::clone(descriptor),
                binding: Some(name.to_owned()),
            })
            .ok_or_else(|| RwsError::UnknownObject {
                name: name.to_owned(),
            })
    }

    fn instance_for(session: &Session, resolved: &Resolved) -> Result<Instance> {
        let descriptor = &resolved.descriptor;
        if let Some(binding) = &resolved.binding {
            return lookup_stored(session, &instance_key(binding)).ok_or_else(|| {
                RwsError::Instantiation {
                    object: binding.clone(),
                    message: "no instance bound under this name".to_owned(),
                }
            });
        }
        match descriptor.scope() {
            Scope::PerCall => descriptor.instantiate(),
            Scope::Global => descriptor.global_instance(),
            Scope::PerConnection => {
                let key = instance_key(descriptor.script_name());
                if let Some(instance) = lookup_stored(session, &key) {
                    return Ok(instance);
                }
                let instance = descriptor.instantiate()?;
                let _ = session.set_attribute(&key, Arc::clone(&instance));
                debug!(
                    session_id = session.id(),
                    object = descriptor.script_name(),
                    "created per-connection instance"
                );
                Ok(instance)
            }
        }
    }

    /// Invoke `method` on `object` for `session`, converting arguments and result.
    #[instrument(skip(self, session, args), fields(session_id = session.id()))]
    pub fn call(
        &self,
        session: &Arc<Session>,
        object: &str,
        method: &str,
        args: Vec<Value>,
    ) -> Result<Value> {
        let resolved = self.resolve(object)?;
        let descriptor = Arc::clone(&resolved.descriptor);
        let operation = descriptor.operation(method)?;
        if args.len() != operation.params.len() {
            return Err(RwsError::invalid_arguments(format!(
                "Method '{method}' of object '{object}' expects {} argument(s), got {}",
                operation.params.len(),
                args.len()
            )));
        }
        let natives = args
            .iter()
            .zip(&operation.params)
            .map(|(arg, param_type)| self.converters.convert_from_wire(arg, param_type))
            .collect::<Result<Vec<_>>>()?;
        let instance = Self::instance_for(session, &resolved)?;

        let cx = CallContext::new(session);
        let result = descriptor
            .resolver()
            .invoke(&cx, &instance, method, natives)
            .map_err(|e| match e {
                CapabilityError::NotFound(_) => RwsError::UnknownMethod {
                    object: object.to_owned(),
                    method: method.to_owned(),
                },
                CapabilityError::BadArgument(message) => RwsError::InvalidArguments { message },
                CapabilityError::Rws(err) => *err,
                other => RwsError::Invocation {
                    object: object.to_owned(),
                    method: method.to_owned(),
                    message: other.to_string(),
                },
            })?;
        self.converters.convert_to_wire(&result)
    }

    /// Attach `sink` to the event named by `spec`.
    pub fn subscribe(
        &self,
        session: &Session,
        spec: &SubscriptionSpec,
        sink: EventSink,
    ) -> Result<SubscriptionToken> {
        let resolved = self.resolve(&spec.object)?;
        let _ = resolved.descriptor.event(&spec.event, &spec.action)?;
        let instance = Self::instance_for(session, &resolved)?;
        resolved
            .descriptor
            .resolver()
            .subscribe(&instance, &spec.event, &spec.action, sink)
            .map_err(|e| subscription_error(spec, e))
    }

    /// Detach the subscription identified by `token`.
    pub fn unsubscribe(
        &self,
        session: &Session,
        spec: &SubscriptionSpec,
        token: SubscriptionToken,
    ) -> Result<()> {
        let resolved = self.resolve(&spec.object)?;
        let instance = Self::instance_for(session, &resolved)?;
        resolved
            .descriptor
            .resolver()
            .unsubscribe(&instance, &spec.event, token)
            .map_err(|e| subscription_error(spec, e))
    }

    /// Client script exposing `name` as a JavaScript object, followed by
    /// stubs for every converter-backed parameter type.
    pub fn object_script(&self, name: &str) -> Result<String> {
        let descriptor = self.resolve(name)?.descriptor;
        let mut stubs = StubGenerator::new(&self.converters);
        stubs.line("if (!rws) var rws = {};");
        stubs.line(format!("if (!{name}) var {name} = {{}};"));

        for op in descriptor.operations() {
            let params = (0..op.params.len())
                .map(|i| format!("p{i}"))
                .collect::<Vec<_>>()
                .join(", ");
            if params.is_empty() {
                stubs.line(format!(
                    "{name}.{method} = function(onsuccess, onfailure) {{",
                    method = op.name
                ));
                stubs.line(format!(
                    "    rws.call('{SYSTEM_ADDRESS}', '{method}', '{name}', onsuccess, onfailure)",
                    method = op.name
                ));
            } else {
                stubs.line(format!(
                    "{name}.{method} = function({params}, onsuccess, onfailure) {{",
                    method = op.name
                ));
                stubs.line(format!(
                    "    rws.call('{SYSTEM_ADDRESS}', '{method}', '{name}', onsuccess, onfailure, {params})",
                    method = op.name
                ));
            }
            stubs.line("}");
        }

        for event in descriptor.events() {
            for action in &event.actions {
                let suffix = format!("{}{}", upper_first(&event.name), upper_first(action));
                stubs.line(format!("{name}.subscribe{suffix} = function(handler) {{"));
                stubs.line(format!(
                    "    return rws.subscribe('{SYSTEM_ADDRESS}', '{action}', '{event}', '{name}', handler)",
                    event = event.name
                ));
                stubs.line("}");
                stubs.line(format!("{name}.unsubscribe{suffix} = function(handlerid) {{"));
                stubs.line("    rws.unsubscribe(handlerid)");
                stubs.line("}");
            }
        }

        for op in descriptor.operations() {
            for param_type in &op.params {
                stubs.generate(param_type)?;
            }
        }
        Ok(stubs.finish())
    }
}

fn lookup_stored(session: &Session, key: &str) -> Option<Instance> {
    session.attribute(key).or_else(|| {
        session
            .context()
            .ok()
            .and_then(|context| context.attribute(key))
    })
}

fn subscription_error(spec: &SubscriptionSpec, err: CapabilityError) -> RwsError {
    match err {
        CapabilityError::Rws(err) => *err,
        CapabilityError::NotFound(_) => RwsError::UnknownEvent {
            object: spec.object.clone(),
            event: spec.event.clone(),
        },
        other => RwsError::Invocation {
            object: spec.object.clone(),
            method: format!("subscribe:{}", spec.event),
            message: other.to_string(),
        },
    }
}

fn upper_first(s: &str) -> String {
    let mut chars = s.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars).collect(),
        None => String::new(),
    }
}

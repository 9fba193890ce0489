//! Capability descriptors: what a script-visible object name stands for.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::warn;

use crate::capability::{CapabilityResolver, EventSignature, Instance, OperationSignature};
use crate::converter::ValueConverter;
use crate::errors::{Result, RwsError};
use crate::pattern::{TypePattern, simple_name};

/// How the live instance behind a descriptor is found.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum Scope {
    /// A new instance for every call.
    PerCall,
    /// One instance per session, kept in the session's attributes.
    #[default]
    PerConnection,
    /// One instance held by the descriptor.
    Global,
}

/// Allow- or deny-list over operation or event names.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub enum Filter {
    /// Everything the resolver reports.
    #[default]
    All,
    /// Only these names.
    Allow(BTreeSet<String>),
    /// Everything but these names.
    Deny(BTreeSet<String>),
}

impl Filter {
    /// Allow only `names`.
    pub fn allow<I, S>(names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::Allow(names.into_iter().map(Into::into).collect())
    }

    /// Allow everything except `names`.
    pub fn deny<I, S>(names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::Deny(names.into_iter().map(Into::into).collect())
    }

    /// Whether `name` passes the filter.
    pub fn permits(&self, name: &str) -> bool {
        match self {
            Self::All => true,
            Self::Allow(names) => names.contains(name),
            Self::Deny(names) => !names.contains(name),
        }
    }
}

/// Converter attached to a descriptor, registered alongside it.
#[derive(Clone)]
pub struct DescriptorConverter {
    /// The converter.
    pub converter: Arc<dyn ValueConverter>,
    /// Name stamped on encoded values.
    pub wire_name: String,
}

/// A script-visible object: name, resolver, scope and exposed capabilities.
pub struct CapabilityDescriptor {
    script_name: String,
    resolver: Arc<dyn CapabilityResolver>,
    scope: Scope,
    pattern: TypePattern,
    operations: BTreeMap<String, OperationSignature>,
    overloaded: BTreeSet<String>,
    events: BTreeMap<String, EventSignature>,
    converter: Option<DescriptorConverter>,
    global: Mutex<Option<Instance>>,
}

impl CapabilityDescriptor {
    /// Start building a descriptor.
    pub fn builder(
        script_name: impl Into<String>,
        resolver: Arc<dyn CapabilityResolver>,
    ) -> DescriptorBuilder {
        DescriptorBuilder {
            script_name: script_name.into(),
            resolver,
            scope: Scope::default(),
            pattern: None,
            operations: Filter::All,
            events: Filter::All,
            converter: None,
            wire_name: None,
            instance: None,
        }
    }

    /// Name clients address the object by.
    pub fn script_name(&self) -> &str {
        &self.script_name
    }

    /// Instance scope.
    pub fn scope(&self) -> Scope {
        self.scope
    }

    /// Pattern matched against type names by `match_object`.
    pub fn pattern(&self) -> &TypePattern {
        &self.pattern
    }

    /// The resolver behind this object.
    pub fn resolver(&self) -> &Arc<dyn CapabilityResolver> {
        &self.resolver
    }

    /// Converter registered together with the descriptor, if any.
    pub fn converter(&self) -> Option<&DescriptorConverter> {
        self.converter.as_ref()
    }

    /// Exposed operation names, sorted.
    pub fn operation_names(&self) -> Vec<&str> {
        self.operations.keys().map(String::as_str).collect()
    }

    /// Exposed event names, sorted.
    pub fn event_names(&self) -> Vec<&str> {
        self.events.keys().map(String::as_str).collect()
    }

    /// Exposed operations, sorted by name.
    pub fn operations(&self) -> impl Iterator<Item = &OperationSignature> {
        self.operations.values()
    }

    /// Exposed events, sorted by name.
    pub fn events(&self) -> impl Iterator<Item = &EventSignature> {
        self.events.values()
    }

    /// Resolve an exposed operation.
    pub fn operation(&self, name: &str) -> Result<&OperationSignature> {
        if self.overloaded.contains(name) {
            return Err(RwsError::OverloadedOperation {
                object: self.script_name.clone(),
                method: name.to_owned(),
            });
        }
        self.operations
            .get(name)
            .ok_or_else(|| RwsError::UnknownMethod {
                object: self.script_name.clone(),
                method: name.to_owned(),
            })
    }

    /// Resolve an exposed event and one of its actions.
    pub fn event(&self, name: &str, action: &str) -> Result<&EventSignature> {
        let signature = self.events.get(name).ok_or_else(|| RwsError::UnknownEvent {
            object: self.script_name.clone(),
            event: name.to_owned(),
        })?;
        if !signature.has_action(action) {
            return Err(RwsError::UnknownAction {
                object: self.script_name.clone(),
                event: name.to_owned(),
                action: action.to_owned(),
            });
        }
        Ok(signature)
    }

    /// Create a fresh instance through the resolver.
    pub fn instantiate(&self) -> Result<Instance> {
        self.resolver
            .instantiate()
            .map_err(|e| RwsError::Instantiation {
                object: self.script_name.clone(),
                message: e.to_string(),
            })
    }

    /// The shared instance of a global descriptor, created on first use.
    pub fn global_instance(&self) -> Result<Instance> {
        let mut guard = self.global.lock();
        if let Some(instance) = guard.as_ref() {
            return Ok(Arc::clone(instance));
        }
        let instance = self.instantiate()?;
        *guard = Some(Arc::clone(&instance));
        Ok(instance)
    }
}

impl fmt::Debug for CapabilityDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CapabilityDescriptor")
            .field("script_name", &self.script_name)
            .field("type_name", &self.resolver.type_name())
            .field("scope", &self.scope)
            .field("pattern", &self.pattern)
            .field("operations", &self.operations.keys().collect::<Vec<_>>())
            .field("overloaded", &self.overloaded)
            .field("events", &self.events.keys().collect::<Vec<_>>())
            .finish_non_exhaustive()
    }
}

/// Builder for [`CapabilityDescriptor`].
pub struct DescriptorBuilder {
    script_name: String,
    resolver: Arc<dyn CapabilityResolver>,
    scope: Scope,
    pattern: Option<String>,
    operations: Filter,
    events: Filter,
    converter: Option<Arc<dyn ValueConverter>>,
    wire_name: Option<String>,
    instance: Option<Instance>,
}

impl DescriptorBuilder {
    /// Instance scope. Defaults to [`Scope::PerConnection`].
    #[must_use]
    pub fn scope(mut self, scope: Scope) -> Self {
        self.scope = scope;
        self
    }

    /// Type-name pattern. Defaults to the resolver's type name.
    #[must_use]
    pub fn match_pattern(mut self, pattern: impl Into<String>) -> Self {
        self.pattern = Some(pattern.into());
        self
    }

    /// Which operations are exposed.
    #[must_use]
    pub fn operations(mut self, filter: Filter) -> Self {
        self.operations = filter;
        self
    }

    /// Which events are exposed.
    #[must_use]
    pub fn events(mut self, filter: Filter) -> Self {
        self.events = filter;
        self
    }

    /// Converter for values of the matched types.
    #[must_use]
    pub fn converter(mut self, converter: Arc<dyn ValueConverter>) -> Self {
        self.converter = Some(converter);
        self
    }

    /// Name stamped on encoded values. Defaults to the simple type name.
    #[must_use]
    pub fn wire_name(mut self, name: impl Into<String>) -> Self {
        self.wire_name = Some(name.into());
        self
    }

    /// Pre-built shared instance. Implies [`Scope::Global`].
    #[must_use]
    pub fn instance(mut self, instance: Instance) -> Self {
        self.instance = Some(instance);
        self.scope = Scope::Global;
        self
    }

    /// Validate the filters against the resolver and build.
    pub fn build(self) -> Result<CapabilityDescriptor> {
        if self.script_name.is_empty() {
            return Err(RwsError::invalid_arguments("object name must not be empty"));
        }
        let type_name = self.resolver.type_name().to_owned();
        let reported_ops = self.resolver.operations();
        let reported_events = self.resolver.events();

        if let Filter::Allow(names) = &self.operations {
            if let Some(missing) = names.iter().find(|n| !reported_ops.iter().any(|op| &op.name == *n)) {
                return Err(RwsError::UnknownMethod {
                    object: self.script_name,
                    method: missing.clone(),
                });
            }
        }
        if let Filter::Allow(names) = &self.events {
            if let Some(missing) = names
                .iter()
                .find(|n| !reported_events.iter().any(|ev| &ev.name == *n))
            {
                return Err(RwsError::UnknownEvent {
                    object: self.script_name,
                    event: missing.clone(),
                });
            }
        }

        let mut operations = BTreeMap::new();
        let mut overloaded = BTreeSet::new();
        for op in reported_ops
            .into_iter()
            .filter(|op| self.operations.permits(&op.name))
        {
            if overloaded.contains(&op.name) {
                continue;
            }
            if operations.contains_key(&op.name) {
                let _ = operations.remove(&op.name);
                warn!(object = %self.script_name, method = %op.name, "overloaded operation will be rejected");
                let _ = overloaded.insert(op.name);
                continue;
            }
            let _ = operations.insert(op.name.clone(), op);
        }

        let events = reported_events
            .into_iter()
            .filter(|ev| self.events.permits(&ev.name))
            .map(|ev| (ev.name.clone(), ev))
            .collect();

        let converter = self.converter.map(|converter| DescriptorConverter {
            converter,
            wire_name: self
                .wire_name
                .unwrap_or_else(|| simple_name(&type_name).to_owned()),
        });

        Ok(CapabilityDescriptor {
            script_name: self.script_name,
            pattern: TypePattern::parse(self.pattern.as_deref().unwrap_or(&type_name)),
            resolver: self.resolver,
            scope: self.scope,
            operations,
            overloaded,
            events,
            converter,
            global: Mutex::new(self.instance),
        })
    }
}

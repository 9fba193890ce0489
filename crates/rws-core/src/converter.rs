//! Value converter registry.
//!
//! Maps native values to and from the wire format by matching a value's
//! runtime type name (or a parameter's declared type name) against an
//! ordered list of glob patterns. The first registered match wins.

use std::collections::HashSet;
use std::fmt::Write as _;
use std::marker::PhantomData;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::RwLock;
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use tracing::{debug, info};

use crate::errors::{Result, RwsError};
use crate::native::{Native, NativeObject};
use crate::pattern::{TypePattern, simple_name};

/// Field stamped on encoded objects naming their wire type.
pub const CLASS_FIELD: &str = "class";

/// Encodes and decodes values of the types its pattern matches.
pub trait ValueConverter: Send + Sync {
    /// Encode a native value.
    fn to_wire(&self, value: &Native, converters: &ConverterRegistry) -> Result<Value>;

    /// Decode a wire value into `target_type`.
    fn from_wire(
        &self,
        value: &Value,
        target_type: &str,
        converters: &ConverterRegistry,
    ) -> Result<Native>;

    /// Emit a client-side type stub for `type_name` under `wire_name`.
    fn generate_stub(
        &self,
        _wire_name: &str,
        _type_name: &str,
        _stubs: &mut StubGenerator<'_>,
    ) -> Result<()> {
        Ok(())
    }
}

/// Handle returned by [`ConverterRegistry::register`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct ConversionId(u64);

/// A registered converter.
#[derive(Clone)]
pub struct Conversion {
    id: ConversionId,
    pattern: TypePattern,
    converter: Arc<dyn ValueConverter>,
    wire_name: Option<String>,
    owner: Option<String>,
}

impl Conversion {
    /// The pattern this conversion was registered under.
    pub fn pattern(&self) -> &TypePattern {
        &self.pattern
    }

    /// The converter.
    pub fn converter(&self) -> &Arc<dyn ValueConverter> {
        &self.converter
    }

    /// Wire name for a concrete type: the registered name, else the simple type name.
    pub fn wire_name_for(&self, type_name: &str) -> String {
        self.wire_name
            .clone()
            .unwrap_or_else(|| simple_name(type_name).to_owned())
    }
}

impl std::fmt::Debug for Conversion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Conversion")
            .field("pattern", &self.pattern)
            .field("wire_name", &self.wire_name)
            .field("owner", &self.owner)
            .finish_non_exhaustive()
    }
}

/// Ordered list of converters.
#[derive(Default)]
pub struct ConverterRegistry {
    conversions: RwLock<Vec<Conversion>>,
    next_id: AtomicU64,
}

impl ConverterRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a converter for types matching `pattern`.
    pub fn register(
        &self,
        pattern: &str,
        converter: Arc<dyn ValueConverter>,
        wire_name: Option<&str>,
    ) -> ConversionId {
        self.push(pattern, converter, wire_name.map(str::to_owned))
    }

    /// Install `owner`'s converter where its previous one sat. Without a
    /// previous one it goes before the first converter owned by any of
    /// `later`, else at the end.
    pub(crate) fn replace_owned(
        &self,
        owner: &str,
        pattern: &str,
        converter: Arc<dyn ValueConverter>,
        wire_name: &str,
        later: &[String],
    ) -> ConversionId {
        let id = ConversionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let conversion = Conversion {
            id,
            pattern: TypePattern::parse(pattern),
            converter,
            wire_name: Some(wire_name.to_owned()),
            owner: Some(owner.to_owned()),
        };
        let mut conversions = self.conversions.write();
        let owned_by = |c: &Conversion, name: &str| c.owner.as_deref() == Some(name);
        if let Some(index) = conversions.iter().position(|c| owned_by(c, owner)) {
            debug!(owner, pattern, "replacing converter in place");
            conversions[index] = conversion;
        } else {
            info!(owner, pattern, wire_name, "registering converter");
            let index = conversions
                .iter()
                .position(|c| later.iter().any(|name| owned_by(c, name)))
                .unwrap_or(conversions.len());
            conversions.insert(index, conversion);
        }
        id
    }

    fn push(
        &self,
        pattern: &str,
        converter: Arc<dyn ValueConverter>,
        wire_name: Option<String>,
    ) -> ConversionId {
        let id = ConversionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        info!(pattern, wire_name = ?wire_name, "registering converter");
        self.conversions.write().push(Conversion {
            id,
            pattern: TypePattern::parse(pattern),
            converter,
            wire_name,
            owner: None,
        });
        id
    }

    /// Remove a converter. Returns whether it was present.
    pub fn unregister(&self, id: ConversionId) -> bool {
        let mut conversions = self.conversions.write();
        let before = conversions.len();
        conversions.retain(|c| c.id != id);
        before != conversions.len()
    }

    pub(crate) fn unregister_owned(&self, owner: &str) {
        self.conversions
            .write()
            .retain(|c| c.owner.as_deref() != Some(owner));
    }

    /// Number of registered converters.
    pub fn len(&self) -> usize {
        self.conversions.read().len()
    }

    /// Whether no converters are registered.
    pub fn is_empty(&self) -> bool {
        self.conversions.read().is_empty()
    }

    /// First conversion, in registration order, whose pattern matches.
    pub fn find(&self, type_name: &str) -> Option<Conversion> {
        self.conversions
            .read()
            .iter()
            .find(|c| c.pattern.matches(type_name))
            .cloned()
    }

    /// Encode a native value for the wire.
    pub fn convert_to_wire(&self, value: &Native) -> Result<Value> {
        if value.is_null() {
            return Ok(Value::Null);
        }
        let type_name = value.type_name();
        if let Some(conv) = self.find(type_name) {
            let mut encoded = conv.converter.to_wire(value, self)?;
            if let Value::Object(map) = &mut encoded {
                let _ = map.insert(
                    CLASS_FIELD.to_owned(),
                    Value::String(conv.wire_name_for(type_name)),
                );
            }
            return Ok(encoded);
        }
        match value {
            Native::Null => Ok(Value::Null),
            Native::Wire(v) => Ok(v.clone()),
            Native::Seq(items) => items
                .iter()
                .map(|item| self.convert_to_wire(item))
                .collect::<Result<Vec<_>>>()
                .map(Value::Array),
            Native::Object(obj) => {
                debug!(type_name, "no converter matched, encoding as string");
                Ok(Value::String(format!("{:?}", obj.as_ref())))
            }
        }
    }

    /// Decode a wire value for a parameter declared as `target_type`.
    pub fn convert_from_wire(&self, value: &Value, target_type: &str) -> Result<Native> {
        if value.is_null() {
            return Ok(Native::Null);
        }
        if let Some(conv) = self.find(target_type) {
            return conv.converter.from_wire(value, target_type, self);
        }
        if wire_satisfies(value, target_type) {
            return Ok(Native::Wire(value.clone()));
        }
        Ok(Native::Wire(Value::String(string_form(value))))
    }

    /// Generate client stubs for the given types and everything they depend on.
    pub fn generate_type_stubs<'t>(
        &self,
        type_names: impl IntoIterator<Item = &'t str>,
    ) -> Result<String> {
        let mut stubs = StubGenerator::new(self);
        for type_name in type_names {
            stubs.generate(type_name)?;
        }
        Ok(stubs.finish())
    }
}

/// Whether a wire value can be handed to a parameter of `target_type` as-is.
pub fn wire_satisfies(value: &Value, target_type: &str) -> bool {
    match target_type {
        "any" | "serde_json::value::Value" => true,
        "string" | "alloc::string::String" | "&str" | "str" => value.is_string(),
        "number" | "f64" | "f32" => value.is_number(),
        "integer" | "i64" | "i32" | "i16" | "i8" | "isize" => value.is_i64(),
        "u64" | "u32" | "u16" | "u8" | "usize" => value.is_u64(),
        "bool" | "boolean" => value.is_boolean(),
        "array" => value.is_array(),
        "object" | "serde_json::map::Map<alloc::string::String, serde_json::value::Value>" => {
            value.is_object()
        }
        other => other.starts_with("alloc::vec::Vec") && value.is_array(),
    }
}

fn string_form(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Emits client-side type stubs, each type at most once per generation pass.
///
/// The emitted set lives exactly as long as the generator, so a pass that
/// fails halfway leaves nothing behind for the next one.
pub struct StubGenerator<'a> {
    converters: &'a ConverterRegistry,
    emitted: HashSet<String>,
    out: String,
}

impl<'a> StubGenerator<'a> {
    /// Start a generation pass.
    pub fn new(converters: &'a ConverterRegistry) -> Self {
        Self {
            converters,
            emitted: HashSet::new(),
            out: String::new(),
        }
    }

    /// Emit the stub for `type_name` unless it was already emitted in this pass.
    pub fn generate(&mut self, type_name: &str) -> Result<()> {
        if !self.emitted.insert(type_name.to_owned()) {
            return Ok(());
        }
        let Some(conv) = self.converters.find(type_name) else {
            return Ok(());
        };
        let wire_name = conv.wire_name_for(type_name);
        conv.converter.generate_stub(&wire_name, type_name, self)
    }

    /// Whether `type_name` was visited in this pass.
    pub fn is_emitted(&self, type_name: &str) -> bool {
        self.emitted.contains(type_name)
    }

    /// Append one line of output.
    pub fn line(&mut self, line: impl AsRef<str>) {
        self.out.push_str(line.as_ref());
        self.out.push('\n');
    }

    /// The output so far.
    pub fn output(&self) -> &str {
        &self.out
    }

    /// Finish the pass and take the output.
    pub fn finish(self) -> String {
        self.out
    }
}

/// Converter backed by serde for a concrete type.
///
/// Stubs list the fields of `T::default()`, numbers initialised to `0` and
/// everything else to `null`.
pub struct SerdeConverter<T> {
    depends_on: Vec<String>,
    _marker: PhantomData<fn() -> T>,
}

impl<T> SerdeConverter<T>
where
    T: Serialize + DeserializeOwned + Default + NativeObject,
{
    /// Create a converter for `T`.
    pub fn new() -> Self {
        Self {
            depends_on: Vec::new(),
            _marker: PhantomData,
        }
    }

    /// Declare types whose stubs the stub for `T` needs.
    #[must_use]
    pub fn depends_on<I, S>(mut self, type_names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.depends_on.extend(type_names.into_iter().map(Into::into));
        self
    }
}

impl<T> Default for SerdeConverter<T>
where
    T: Serialize + DeserializeOwned + Default + NativeObject,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<T> ValueConverter for SerdeConverter<T>
where
    T: Serialize + DeserializeOwned + Default + NativeObject,
{
    fn to_wire(&self, value: &Native, _converters: &ConverterRegistry) -> Result<Value> {
        let typed = value.downcast_ref::<T>().ok_or_else(|| {
            RwsError::conversion(format!(
                "expected {}, got {}",
                std::any::type_name::<T>(),
                value.type_name()
            ))
        })?;
        serde_json::to_value(typed).map_err(|e| RwsError::conversion(e.to_string()))
    }

    fn from_wire(
        &self,
        value: &Value,
        target_type: &str,
        _converters: &ConverterRegistry,
    ) -> Result<Native> {
        let mut value = value.clone();
        if let Value::Object(map) = &mut value {
            let _ = map.remove(CLASS_FIELD);
        }
        serde_json::from_value::<T>(value)
            .map(Native::object)
            .map_err(|e| RwsError::conversion(format!("{target_type}: {e}")))
    }

    fn generate_stub(
        &self,
        wire_name: &str,
        _type_name: &str,
        stubs: &mut StubGenerator<'_>,
    ) -> Result<()> {
        let sample =
            serde_json::to_value(T::default()).map_err(|e| RwsError::conversion(e.to_string()))?;
        stubs.line(format!("if (typeof {wire_name} != 'function') {{"));
        stubs.line(format!("    function {wire_name}() {{"));
        stubs.line(format!("        this.$class = '{wire_name}';"));
        if let Value::Object(fields) = &sample {
            for (name, value) in fields {
                let mut line = String::new();
                let init = if value.is_number() { "0" } else { "null" };
                let _ = write!(line, "        this.{name} = {init};");
                stubs.line(line);
            }
        }
        stubs.line("    }");
        stubs.line("}");
        for dependency in &self.depends_on {
            stubs.generate(dependency)?;
        }
        Ok(())
    }
}

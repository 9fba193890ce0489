//! Native (server-side) values exchanged with capability resolvers.

use std::any::Any;
use std::fmt;
use std::sync::Arc;

use serde_json::Value;

/// A typed server-side object that can be matched by its type name.
///
/// Implemented for every `Any + Send + Sync + Debug` type. When holding an
/// `Arc<dyn NativeObject>`, call through `as_ref()` so the trait object's
/// implementation is used rather than the one for the `Arc` itself.
pub trait NativeObject: Any + Send + Sync + fmt::Debug {
    /// Fully-qualified runtime type name.
    fn type_name(&self) -> &'static str;
    /// Upcast for downcasting.
    fn as_any(&self) -> &dyn Any;
}

impl<T: Any + Send + Sync + fmt::Debug> NativeObject for T {
    fn type_name(&self) -> &'static str {
        std::any::type_name::<T>()
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// Type name reported for wire-native values.
pub const WIRE_TYPE_NAME: &str = "serde_json::value::Value";
/// Type name reported for sequences.
pub const SEQ_TYPE_NAME: &str = "alloc::vec::Vec";

/// A value on the server side of the converter.
#[derive(Clone, Debug, Default)]
pub enum Native {
    /// Absent value.
    #[default]
    Null,
    /// Already in wire form.
    Wire(Value),
    /// Ordered sequence.
    Seq(Vec<Native>),
    /// Typed object, encoded by a matching converter.
    Object(Arc<dyn NativeObject>),
}

impl Native {
    /// Wrap anything convertible into a wire value.
    pub fn wire(value: impl Into<Value>) -> Self {
        Self::Wire(value.into())
    }

    /// Wrap a typed object.
    pub fn object<T: NativeObject>(value: T) -> Self {
        Self::Object(Arc::new(value))
    }

    /// Whether this is `Null` (or a wire `null`).
    pub fn is_null(&self) -> bool {
        matches!(self, Self::Null | Self::Wire(Value::Null))
    }

    /// Runtime type name used for converter matching.
    pub fn type_name(&self) -> &'static str {
        match self {
            Self::Null => "null",
            Self::Wire(_) => WIRE_TYPE_NAME,
            Self::Seq(_) => SEQ_TYPE_NAME,
            Self::Object(obj) => obj.as_ref().type_name(),
        }
    }

    /// Borrow the wire value.
    pub fn as_value(&self) -> Option<&Value> {
        match self {
            Self::Wire(v) => Some(v),
            _ => None,
        }
    }

    /// Borrow a wire string.
    pub fn as_str(&self) -> Option<&str> {
        self.as_value().and_then(Value::as_str)
    }

    /// Read a wire integer.
    pub fn as_i64(&self) -> Option<i64> {
        self.as_value().and_then(Value::as_i64)
    }

    /// Read a wire number.
    pub fn as_f64(&self) -> Option<f64> {
        self.as_value().and_then(Value::as_f64)
    }

    /// Read a wire boolean.
    pub fn as_bool(&self) -> Option<bool> {
        self.as_value().and_then(Value::as_bool)
    }

    /// Downcast a typed object.
    pub fn downcast_ref<T: Any>(&self) -> Option<&T> {
        match self {
            Self::Object(obj) => obj.as_ref().as_any().downcast_ref::<T>(),
            _ => None,
        }
    }
}

impl From<Value> for Native {
    fn from(value: Value) -> Self {
        Self::Wire(value)
    }
}

impl From<Vec<Native>> for Native {
    fn from(items: Vec<Native>) -> Self {
        Self::Seq(items)
    }
}

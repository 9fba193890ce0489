//! Glob matching of fully-qualified type names.
//!
//! Supported forms: `name` (exact), `prefix*`, `*suffix`, `*infix*` and a
//! lone `*` matching everything. Lookups that use patterns scan in
//! registration order and stop at the first hit, so a broad pattern
//! registered early shadows a precise one registered later.

use std::fmt;

/// A parsed type-name pattern.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum TypePattern {
    /// `*`
    Any,
    /// `name`
    Exact(String),
    /// `prefix*`
    Prefix(String),
    /// `*suffix`
    Suffix(String),
    /// `*infix*`
    Contains(String),
}

impl TypePattern {
    /// Parse a glob pattern.
    pub fn parse(pattern: &str) -> Self {
        if pattern == "*" || pattern == "**" {
            return Self::Any;
        }
        match (pattern.strip_prefix('*'), pattern.strip_suffix('*')) {
            (Some(_), Some(_)) => Self::Contains(pattern[1..pattern.len() - 1].to_owned()),
            (None, Some(prefix)) => Self::Prefix(prefix.to_owned()),
            (Some(suffix), None) => Self::Suffix(suffix.to_owned()),
            (None, None) => Self::Exact(pattern.to_owned()),
        }
    }

    /// Whether `type_name` matches.
    pub fn matches(&self, type_name: &str) -> bool {
        match self {
            Self::Any => true,
            Self::Exact(name) => type_name == name,
            Self::Prefix(prefix) => type_name.starts_with(prefix.as_str()),
            Self::Suffix(suffix) => type_name.ends_with(suffix.as_str()),
            Self::Contains(infix) => type_name.contains(infix.as_str()),
        }
    }
}

impl fmt::Display for TypePattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Any => f.write_str("*"),
            Self::Exact(name) => f.write_str(name),
            Self::Prefix(prefix) => write!(f, "{prefix}*"),
            Self::Suffix(suffix) => write!(f, "*{suffix}"),
            Self::Contains(infix) => write!(f, "*{infix}*"),
        }
    }
}

impl From<&str> for TypePattern {
    fn from(pattern: &str) -> Self {
        Self::parse(pattern)
    }
}

/// Simple name of a fully-qualified type: last path segment, generics removed.
///
/// `alloc::vec::Vec<demo::Point>` becomes `Vec`, `demo::shapes::Point` becomes `Point`.
pub fn simple_name(type_name: &str) -> &str {
    let base = type_name.split('<').next().unwrap_or(type_name);
    base.rsplit("::").next().unwrap_or(base)
}

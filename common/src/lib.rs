//! Ingress Manager Common Types
//!
//! The logical key shared by the work queue, the event router and the
//! reconciler. A key names one Service and, by convention, the Ingress that
//! shares its namespace and name.

use std::fmt;
use thiserror::Error;

/// Separator between namespace and name in a serialized key
pub const KEY_SEPARATOR: char = '/';

/// Errors produced while parsing a serialized key
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum KeyError {
    #[error("key is empty")]
    Empty,

    #[error("unexpected key format: {0:?}")]
    UnexpectedFormat(String),

    #[error("key {0:?} has an empty name")]
    EmptyName(String),

    #[error("key {0:?} has no namespace")]
    MissingNamespace(String),
}

/// Logical key: `(namespace, name)`, serialized as `"namespace/name"`
///
/// Cluster-scoped objects have no namespace and serialize as `"name"`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct ObjectKey {
    pub namespace: Option<String>,
    pub name: String,
}

impl ObjectKey {
    /// Key for a namespaced object
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: Some(namespace.into()),
            name: name.into(),
        }
    }

    /// Key for a cluster-scoped object
    pub fn cluster_scoped(name: impl Into<String>) -> Self {
        Self {
            namespace: None,
            name: name.into(),
        }
    }

    /// Build a key from optional object metadata fields
    ///
    /// Returns `None` when the name is missing or empty; such objects cannot
    /// be addressed and therefore never produce a unit of work.
    pub fn from_parts(namespace: Option<&str>, name: Option<&str>) -> Option<Self> {
        let name = name.filter(|n| !n.is_empty())?;
        Some(Self {
            namespace: namespace.filter(|ns| !ns.is_empty()).map(str::to_string),
            name: name.to_string(),
        })
    }

    /// Split a serialized key into namespace and name
    ///
    /// Accepts `"name"` and `"namespace/name"`. Anything with more than one
    /// separator, or with an empty name, is malformed.
    pub fn parse(key: &str) -> Result<Self, KeyError> {
        if key.is_empty() {
            return Err(KeyError::Empty);
        }

        let mut parts = key.split(KEY_SEPARATOR);
        let first = parts.next().unwrap_or_default();
        let second = parts.next();
        if parts.next().is_some() {
            return Err(KeyError::UnexpectedFormat(key.to_string()));
        }

        let (namespace, name) = match second {
            Some(name) => (Some(first), name),
            None => (None, first),
        };

        if name.is_empty() {
            return Err(KeyError::EmptyName(key.to_string()));
        }

        Ok(Self {
            namespace: namespace.filter(|ns| !ns.is_empty()).map(str::to_string),
            name: name.to_string(),
        })
    }

    /// Namespace of a key that must address a namespaced object
    pub fn require_namespace(&self) -> Result<&str, KeyError> {
        self.namespace
            .as_deref()
            .ok_or_else(|| KeyError::MissingNamespace(self.to_string()))
    }
}

impl fmt::Display for ObjectKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.namespace {
            Some(ns) => write!(f, "{}{}{}", ns, KEY_SEPARATOR, self.name),
            None => f.write_str(&self.name),
        }
    }
}

impl std::str::FromStr for ObjectKey {
    type Err = KeyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

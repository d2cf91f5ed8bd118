//! Query keys and their canonical hashes.
//!
//! A [`QueryKey`] is the application's name for a logical request, an ordered
//! sequence of JSON-like values such as `("user", 42)`. The registry never
//! compares keys directly. It compares their [`QueryHash`], a canonical string
//! that is equal for any two structurally equal keys.

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::{QueryError, QueryResult};

/// An immutable, structured request key.
///
/// Built from any `Serialize` value. Arrays and tuples become the key's parts
/// in order; any other value becomes a single-part key, so `"todos"` and
/// `["todos"]` name the same request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueryKey {
    parts: Vec<Value>,
    hash: QueryHash,
}

impl QueryKey {
    /// Build a key from a serializable value.
    ///
    /// Fails with [`QueryError::UnhashableKey`] when the value has no JSON
    /// representation, e.g. a map keyed by tuples or a `Serialize` impl that
    /// errors.
    pub fn new<K>(key: &K) -> QueryResult<Self>
    where
        K: Serialize + ?Sized,
    {
        let value = serde_json::to_value(key).map_err(unhashable)?;
        let parts = match canonicalize(value) {
            Value::Array(parts) => parts,
            other => vec![other],
        };
        let hash = serde_json::to_string(&parts)
            .map(QueryHash)
            .map_err(unhashable)?;
        Ok(Self { parts, hash })
    }

    /// The key's parts, with object members in canonical order.
    pub fn parts(&self) -> &[Value] {
        &self.parts
    }

    pub fn len(&self) -> usize {
        self.parts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.parts.is_empty()
    }

    /// The canonical hash the registry uses as this key's identity.
    pub fn hash(&self) -> &QueryHash {
        &self.hash
    }
}

impl fmt::Display for QueryKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.hash.fmt(f)
    }
}

/// Canonical string form of a [`QueryKey`].
///
/// Compact JSON with object members sorted by name and array order kept.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct QueryHash(String);

impl QueryHash {
    /// Hash a serializable key without keeping the key itself.
    pub fn of<K>(key: &K) -> QueryResult<Self>
    where
        K: Serialize + ?Sized,
    {
        QueryKey::new(key).map(|key| key.hash)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for QueryHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for QueryHash {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

fn unhashable(err: serde_json::Error) -> QueryError {
    QueryError::UnhashableKey {
        reason: err.to_string(),
    }
}

/// Rebuild every object with its members inserted in sorted order.
///
/// `serde_json::Map` only sorts on its own when the `preserve_order` feature
/// is off, and any crate in the build can turn it on.
fn canonicalize(value: Value) -> Value {
    match value {
        Value::Array(items) => Value::Array(items.into_iter().map(canonicalize).collect()),
        Value::Object(members) => {
            let mut sorted: Vec<(String, Value)> = members.into_iter().collect();
            sorted.sort_by(|a, b| a.0.cmp(&b.0));
            let mut map = Map::with_capacity(sorted.len());
            for (name, member) in sorted {
                map.insert(name, canonicalize(member));
            }
            Value::Object(map)
        }
        scalar => scalar,
    }
}

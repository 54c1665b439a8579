use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::EngineError;

/// Dataset/collection name used for the synthetic node bound to the seed identity
pub const ROOT_NAME: &str = "__ROOT__";

/// Dotted path to a (possibly nested) field inside a collection, e.g. `address.city`
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FieldPath(pub Vec<String>);

impl FieldPath {
    pub fn new<S: Into<String>>(levels: impl IntoIterator<Item = S>) -> Self {
        Self(levels.into_iter().map(Into::into).collect())
    }

    /// Parse `a.b.c` into a path
    pub fn parse(path: &str) -> Self {
        Self(
            path.split('.')
                .filter(|s| !s.is_empty())
                .map(|s| s.to_string())
                .collect(),
        )
    }

    pub fn levels(&self) -> &[String] {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// First level of the path, i.e. the top-level column/property name
    pub fn head(&self) -> Option<&str> {
        self.0.first().map(|s| s.as_str())
    }

    /// Extend with one more level
    pub fn child(&self, name: &str) -> Self {
        let mut levels = self.0.clone();
        levels.push(name.to_string());
        Self(levels)
    }

    /// True if `self` equals `other` or is an ancestor of it
    pub fn is_prefix_of(&self, other: &FieldPath) -> bool {
        other.0.len() >= self.0.len() && other.0[..self.0.len()] == self.0[..]
    }

    /// Collect every value at this path in a JSON value, flattening arrays on the way
    pub fn retrieve_from(&self, value: &serde_json::Value) -> Vec<serde_json::Value> {
        let mut out = Vec::new();
        collect_at(value, &self.0, &mut out);
        out
    }
}

fn collect_at(value: &serde_json::Value, levels: &[String], out: &mut Vec<serde_json::Value>) {
    match value {
        serde_json::Value::Array(items) => {
            for item in items {
                collect_at(item, levels, out);
            }
        }
        serde_json::Value::Object(map) => {
            if let Some((first, rest)) = levels.split_first() {
                if let Some(next) = map.get(first) {
                    collect_at(next, rest, out);
                }
            } else {
                out.push(value.clone());
            }
        }
        serde_json::Value::Null => {}
        scalar => {
            if levels.is_empty() {
                out.push(scalar.clone());
            }
        }
    }
}

impl fmt::Display for FieldPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.join("."))
    }
}

/// Identifies a collection as `dataset.collection`
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CollectionAddress {
    pub dataset: String,
    pub collection: String,
}

impl CollectionAddress {
    pub fn new(dataset: impl Into<String>, collection: impl Into<String>) -> Self {
        Self {
            dataset: dataset.into(),
            collection: collection.into(),
        }
    }

    /// The synthetic address of the seed node
    pub fn root() -> Self {
        Self::new(ROOT_NAME, ROOT_NAME)
    }

    pub fn is_root(&self) -> bool {
        self.dataset == ROOT_NAME && self.collection == ROOT_NAME
    }

    pub fn field(&self, path: FieldPath) -> FieldAddress {
        FieldAddress {
            collection: self.clone(),
            path,
        }
    }

    /// Parse `dataset.collection`
    pub fn parse(value: &str) -> Result<Self, EngineError> {
        match value.split_once('.') {
            Some((dataset, collection)) if !dataset.is_empty() && !collection.is_empty() && !collection.contains('.') => {
                Ok(Self::new(dataset, collection))
            }
            _ => Err(EngineError::Validation(format!(
                "Invalid collection address '{}'. Expected 'dataset.collection'",
                value
            ))),
        }
    }
}

impl fmt::Display for CollectionAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.dataset, self.collection)
    }
}

impl Serialize for CollectionAddress {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for CollectionAddress {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        CollectionAddress::parse(&raw).map_err(serde::de::Error::custom)
    }
}

/// Identifies a field as `dataset.collection.path.to.field`
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FieldAddress {
    pub collection: CollectionAddress,
    pub path: FieldPath,
}

impl FieldAddress {
    pub fn new(dataset: impl Into<String>, collection: impl Into<String>, path: FieldPath) -> Self {
        Self {
            collection: CollectionAddress::new(dataset, collection),
            path,
        }
    }

    /// Parse `dataset.collection.field[.sub...]`
    pub fn parse(value: &str) -> Result<Self, EngineError> {
        let parts: Vec<&str> = value.split('.').collect();
        if parts.len() < 3 || parts.iter().any(|p| p.is_empty()) {
            return Err(EngineError::Validation(format!(
                "Invalid field address '{}'. Expected 'dataset.collection.field'",
                value
            )));
        }
        Ok(Self::new(parts[0], parts[1], FieldPath::new(parts[2..].iter().copied())))
    }
}

impl fmt::Display for FieldAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.collection, self.path)
    }
}

impl Serialize for FieldAddress {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for FieldAddress {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        FieldAddress::parse(&raw).map_err(serde::de::Error::custom)
    }
}

//! Identifiers of hierarchy entities.

use std::borrow::Borrow;
use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

/// Opaque, stable identifier of a subject, model, category or element.
///
/// Only equality, hashing and ordering are meaningful. Cloning is cheap.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NodeId(Arc<str>);

impl NodeId {
    /// Creates an id from any string-like value.
    pub fn new(id: impl AsRef<str>) -> Self {
        Self(Arc::from(id.as_ref()))
    }

    /// Returns the id as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "NodeId({})", self.0)
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for NodeId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

impl From<String> for NodeId {
    fn from(id: String) -> Self {
        Self(Arc::from(id))
    }
}

impl Borrow<str> for NodeId {
    fn borrow(&self) -> &str {
        &self.0
    }
}

/// An id qualified by the full name of its runtime class.
///
/// Ancestor paths are made of instance keys.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InstanceKey {
    /// Full class name, e.g. `BisCore.Subject`.
    pub class_name: String,
    /// Instance id.
    pub id: NodeId,
}

impl InstanceKey {
    /// Creates a new instance key.
    pub fn new(class_name: impl Into<String>, id: impl Into<NodeId>) -> Self {
        Self {
            class_name: class_name.into(),
            id: id.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn test_node_id_equality_and_hash() {
        let a = NodeId::from("0x1");
        let b = NodeId::from(String::from("0x1"));
        assert_eq!(a, b);

        let set: HashSet<NodeId> = [a, b, NodeId::from("0x2")].into_iter().collect();
        assert_eq!(set.len(), 2);
        assert!(set.contains("0x2"));
    }

    #[test]
    fn test_node_id_serde_is_transparent() {
        let id = NodeId::from("0x20000000001");
        assert_eq!(serde_json::to_string(&id).unwrap(), "\"0x20000000001\"");
        let back: NodeId = serde_json::from_str("\"0x20000000001\"").unwrap();
        assert_eq!(back, id);
    }

    #[test]
    fn test_instance_key_json_shape() {
        let key: InstanceKey =
            serde_json::from_str(r#"{"className":"BisCore.Subject","id":"0x1"}"#).unwrap();
        assert_eq!(key, InstanceKey::new("BisCore.Subject", "0x1"));
    }
}

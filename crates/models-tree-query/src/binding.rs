//! Typed query bindings.
//!
//! Id lists are bound in one of two ways depending on their size: short lists
//! expand into an `IN (?, ?, ...)` predicate with one binding per id, long lists
//! are handed to the executor as a single virtual-set parameter.

use std::collections::BTreeMap;

use serde::Serialize;

use crate::id::NodeId;

/// Id lists of at least this many entries are bound as a virtual set.
pub const MAX_INLINE_IDS: usize = 1000;

/// A positional or named query parameter value.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", content = "value", rename_all = "kebab-case")]
pub enum Binding {
    /// A single id.
    Id(NodeId),
    /// An id set bound through a single `InVirtualSet(?, column)` placeholder.
    IdSet(Vec<NodeId>),
    /// A string value.
    String(String),
}

impl Binding {
    /// Returns the ids carried by this binding (none for strings).
    pub fn ids(&self) -> Vec<NodeId> {
        match self {
            Self::Id(id) => vec![id.clone()],
            Self::IdSet(ids) => ids.clone(),
            Self::String(_) => Vec::new(),
        }
    }
}

/// Named bindings, referenced from statement text as `:name`.
pub type NamedBindings = BTreeMap<String, Binding>;

/// Binds a single id against `column` and returns the predicate text.
pub fn bind_id(column: &str, id: &NodeId, bindings: &mut Vec<Binding>) -> String {
    bindings.push(Binding::Id(id.clone()));
    format!("{column} = ?")
}

/// Binds a list of ids against `column` and returns the predicate text.
///
/// An empty list produces a predicate that matches nothing.
pub fn bind_ids<I>(column: &str, ids: I, bindings: &mut Vec<Binding>) -> String
where
    I: IntoIterator<Item = NodeId>,
{
    let ids: Vec<NodeId> = ids.into_iter().collect();
    if ids.is_empty() {
        return "1 = 0".to_string();
    }
    if ids.len() < MAX_INLINE_IDS {
        let placeholders = vec!["?"; ids.len()].join(", ");
        bindings.extend(ids.into_iter().map(Binding::Id));
        return format!("{column} IN ({placeholders})");
    }
    bindings.push(Binding::IdSet(ids));
    format!("InVirtualSet(?, {column})")
}

/// Binds a single id under `name` and returns the predicate text.
pub fn bind_named(column: &str, id: &NodeId, name: &str, bindings: &mut NamedBindings) -> String {
    bindings.insert(name.to_string(), Binding::Id(id.clone()));
    format!("{column} = :{name}")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ids(count: usize) -> Vec<NodeId> {
        (0..count).map(|i| NodeId::new(format!("0x{i:x}"))).collect()
    }

    #[test]
    fn test_bind_single_id() {
        let mut bindings = Vec::new();
        let text = bind_id("e.Model.Id", &NodeId::from("0x10"), &mut bindings);
        assert_eq!(text, "e.Model.Id = ?");
        assert_eq!(bindings, vec![Binding::Id(NodeId::from("0x10"))]);
    }

    #[test]
    fn test_bind_short_list_inlines_placeholders() {
        let mut bindings = Vec::new();
        let text = bind_ids("Category.Id", ids(3), &mut bindings);
        assert_eq!(text, "Category.Id IN (?, ?, ?)");
        assert_eq!(bindings.len(), 3);
        assert!(bindings.iter().all(|b| matches!(b, Binding::Id(_))));
    }

    #[test]
    fn test_bind_long_list_uses_virtual_set() {
        let mut bindings = Vec::new();
        let text = bind_ids("id", ids(MAX_INLINE_IDS), &mut bindings);
        assert_eq!(text, "InVirtualSet(?, id)");
        assert_eq!(bindings.len(), 1);
        assert_eq!(bindings[0].ids().len(), MAX_INLINE_IDS);
    }

    #[test]
    fn test_bind_threshold_boundary() {
        let mut bindings = Vec::new();
        bind_ids("id", ids(MAX_INLINE_IDS - 1), &mut bindings);
        assert_eq!(bindings.len(), MAX_INLINE_IDS - 1);
    }

    #[test]
    fn test_bind_empty_list_matches_nothing() {
        let mut bindings = Vec::new();
        assert_eq!(bind_ids("id", Vec::new(), &mut bindings), "1 = 0");
        assert!(bindings.is_empty());
    }

    #[test]
    fn test_bind_named() {
        let mut bindings = NamedBindings::new();
        let text = bind_named("e.Parent.Id", &NodeId::from("0x5"), "parentId", &mut bindings);
        assert_eq!(text, "e.Parent.Id = :parentId");
        assert_eq!(bindings.get("parentId"), Some(&Binding::Id(NodeId::from("0x5"))));
    }

    #[test]
    fn test_binding_serialization() {
        let json = serde_json::to_string(&Binding::Id(NodeId::from("0x1"))).unwrap();
        assert_eq!(json, r#"{"type":"id","value":"0x1"}"#);
    }
}

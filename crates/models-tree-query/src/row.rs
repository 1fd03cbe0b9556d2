//! Result rows produced by a [`QueryExecutor`](crate::QueryExecutor).

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::{QueryError, QueryResult};

/// A single result row, keyed by column name.
///
/// Rows are decoded into typed structs with [`Row::decode`], so executors are
/// free to return any JSON-compatible column values.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Row(Map<String, Value>);

impl Row {
    /// Creates an empty row.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the row with `column` set to `value`.
    pub fn with(mut self, column: impl Into<String>, value: impl Into<Value>) -> Self {
        self.0.insert(column.into(), value.into());
        self
    }

    /// Gets a column value.
    pub fn get(&self, column: &str) -> Option<&Value> {
        self.0.get(column)
    }

    /// Returns the number of columns.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Returns true if the row has no columns.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Decodes the row into `T`.
    ///
    /// `query` names the originating query and is only used for error reporting.
    pub fn decode<T: DeserializeOwned>(self, query: &str) -> QueryResult<T> {
        serde_json::from_value(Value::Object(self.0)).map_err(|err| QueryError::decode(query, err))
    }
}

impl From<Map<String, Value>> for Row {
    fn from(columns: Map<String, Value>) -> Self {
        Self(columns)
    }
}

impl<K: Into<String>, V: Into<Value>> FromIterator<(K, V)> for Row {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Self(iter.into_iter().map(|(k, v)| (k.into(), v.into())).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::NodeId;

    #[derive(Debug, Deserialize)]
    #[serde(rename_all = "camelCase")]
    struct SubjectRow {
        id: NodeId,
        parent_id: Option<NodeId>,
        #[serde(default)]
        hide_in_hierarchy: bool,
    }

    #[test]
    fn test_decode_typed_row() {
        let row = Row::new()
            .with("id", "0x2")
            .with("parentId", "0x1")
            .with("hideInHierarchy", true);
        let subject: SubjectRow = row.decode("subjects").unwrap();
        assert_eq!(subject.id, NodeId::from("0x2"));
        assert_eq!(subject.parent_id, Some(NodeId::from("0x1")));
        assert!(subject.hide_in_hierarchy);
    }

    #[test]
    fn test_decode_null_and_missing_columns() {
        let row = Row::new().with("id", "0x1").with("parentId", Value::Null);
        let subject: SubjectRow = row.decode("subjects").unwrap();
        assert!(subject.parent_id.is_none());
        assert!(!subject.hide_in_hierarchy);
    }

    #[test]
    fn test_decode_failure_names_query() {
        let row: Row = [("parentId", "0x1")].into_iter().collect();
        let err = row.decode::<SubjectRow>("subjects").unwrap_err();
        assert!(matches!(err, QueryError::Decode { query, .. } if query == "subjects"));
    }
}

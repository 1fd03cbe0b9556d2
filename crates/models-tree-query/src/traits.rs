//! Collaborator traits supplied by the host environment.
//!
//! The query layer never talks to a database directly. The host implements
//! [`QueryExecutor`] over its data connection, [`ClassHierarchyInspector`] over
//! its schema metadata, and optionally [`GroupedInstancesProvider`] and
//! [`InstanceLabelSelector`].
//!
//! # Example: an in-memory executor
//!
//! ```ignore
//! use futures::stream::{self, StreamExt};
//! use models_tree_query::{Query, QueryExecutor, Row, RowStream};
//!
//! struct FixedRows(Vec<Row>);
//!
//! impl QueryExecutor for FixedRows {
//!     fn execute(&self, _query: Query) -> RowStream {
//!         stream::iter(self.0.clone().into_iter().map(Ok)).boxed()
//!     }
//! }
//! ```

use std::sync::Arc;

use async_trait::async_trait;
use futures::stream::BoxStream;

use crate::builder::Query;
use crate::error::QueryResult;
use crate::id::NodeId;
use crate::row::Row;

/// Lazy stream of result rows.
pub type RowStream = BoxStream<'static, QueryResult<Row>>;

/// Lazy stream of ids.
pub type IdStream = BoxStream<'static, QueryResult<NodeId>>;

/// Executes parametrized queries against the backing store.
///
/// Implementations must not do any work until the returned stream is polled.
/// Rows of a single query may arrive in any order.
pub trait QueryExecutor: Send + Sync {
    /// Starts executing `query` and returns its rows.
    fn execute(&self, query: Query) -> RowStream;
}

impl<T: QueryExecutor + ?Sized> QueryExecutor for Arc<T> {
    fn execute(&self, query: Query) -> RowStream {
        (**self).execute(query)
    }
}

/// Answers "is class A a kind of class B" questions.
#[async_trait]
pub trait ClassHierarchyInspector: Send + Sync {
    /// Returns true if `class_name` is `base_class_name` or derives from it.
    async fn derives_from(&self, class_name: &str, base_class_name: &str) -> QueryResult<bool>;
}

#[async_trait]
impl<T: ClassHierarchyInspector + ?Sized> ClassHierarchyInspector for Arc<T> {
    async fn derives_from(&self, class_name: &str, base_class_name: &str) -> QueryResult<bool> {
        (**self).derives_from(class_name, base_class_name).await
    }
}

/// Produces the statement fragment that selects a display label for an instance.
pub trait InstanceLabelSelector: Send + Sync {
    /// Returns a selector expression for the label of `class_alias`, an alias
    /// of class `class_name` in the enclosing statement.
    fn label_selector(&self, class_alias: &str, class_name: &str) -> String;
}

/// Label selector preferring the user label and falling back to the code value.
#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultLabelSelector;

impl InstanceLabelSelector for DefaultLabelSelector {
    fn label_selector(&self, class_alias: &str, _class_name: &str) -> String {
        format!("COALESCE([{class_alias}].[UserLabel], [{class_alias}].[CodeValue], '')")
    }
}

/// Resolves the element ids grouped under a grouping node.
pub trait GroupedInstancesProvider<K>: Send + Sync {
    /// Returns the ids of the instances grouped by `key`.
    fn grouped_instance_ids(&self, key: &K) -> IdStream;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::builder::QueryBuilder;
    use futures::stream::{self, StreamExt, TryStreamExt};

    struct FixedRows(Vec<Row>);

    impl QueryExecutor for FixedRows {
        fn execute(&self, _query: Query) -> RowStream {
            stream::iter(self.0.clone().into_iter().map(Ok)).boxed()
        }
    }

    struct NameInspector;

    #[async_trait]
    impl ClassHierarchyInspector for NameInspector {
        async fn derives_from(&self, class_name: &str, base: &str) -> QueryResult<bool> {
            Ok(class_name == base)
        }
    }

    #[tokio::test]
    async fn test_executor_through_arc() {
        let executor: Arc<dyn QueryExecutor> =
            Arc::new(FixedRows(vec![Row::new().with("id", "0x1")]));
        let rows: Vec<Row> = executor
            .execute(QueryBuilder::new("q").push("SELECT 1").build())
            .try_collect()
            .await
            .unwrap();
        assert_eq!(rows.len(), 1);
    }

    #[tokio::test]
    async fn test_inspector_through_arc() {
        let inspector = Arc::new(NameInspector);
        assert!(inspector.derives_from("A", "A").await.unwrap());
        assert!(!inspector.derives_from("A", "B").await.unwrap());
    }

    #[test]
    fn test_default_label_selector() {
        let selector = DefaultLabelSelector.label_selector("s", "BisCore.Subject");
        assert_eq!(selector, "COALESCE([s].[UserLabel], [s].[CodeValue], '')");
    }
}

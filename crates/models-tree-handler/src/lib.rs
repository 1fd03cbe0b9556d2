//! # models-tree-handler
//!
//! Caching hierarchy query handler for a spatial models tree.
//!
//! The tree shows subjects, the models under them, the categories of each
//! model and the element hierarchies inside categories. This crate answers
//! the structural questions such a tree asks ("children of this node",
//! "path from the root to these nodes") over a host-provided
//! [`QueryExecutor`](models_tree_query::QueryExecutor), caching results so
//! repeated and concurrent requests hit the store once.
//!
//! ## Key Features
//!
//! - **Single-flight caching** - concurrent requests for the same key share one query
//! - **Hidden subjects** - subjects marked hidden are skipped, their content promoted
//! - **One-pass element closures** - one recursive query fills the cache for a whole subtree
//! - **Ancestor paths** - for instance keys or label searches, in a single query
//! - **Row ceiling** - element and path queries fail fast past a configured size
//!
//! ## Quick Start
//!
//! ```ignore
//! use futures::TryStreamExt;
//! use models_tree_handler::{HandlerConfig, QueryHandler};
//!
//! let handler = QueryHandler::new(executor);
//!
//! let root_subjects: Vec<_> = handler
//!     .query_child_subjects(&["0x1".into()])
//!     .try_collect()
//!     .await?;
//! let models: Vec<_> = handler
//!     .query_subject_models(&["0x1".into()])
//!     .try_collect()
//!     .await?;
//! ```
//!
//! ## Ancestor Paths
//!
//! ```ignore
//! use models_tree_handler::PathsRequest;
//!
//! let resolver = handler.path_resolver(inspector);
//! let paths = resolver
//!     .compute_ancestor_paths(&PathsRequest::Label("pump".into()))
//!     .await?;
//! ```
//!
//! ## Architecture
//!
//! ```text
//! QueryHandler
//! ├── SubjectHierarchyIndex   - subject/model snapshot, loaded once
//! ├── ResultCache             - model categories by model id
//! ├── RecursiveChildResolver  - element subtrees, cached per element
//! ├── SingleFlightCache       - grouping node contents by key
//! └── PathResolver            - ancestor paths (uncached)
//! ```

#![warn(missing_docs)]
#![warn(rustdoc::missing_crate_level_docs)]

mod cache;
mod config;
mod elements;
mod handler;
mod paths;
mod queries;
mod subjects;

// Public re-exports
pub use cache::{CacheStats, Lookup, ResultCache, SingleFlightCache};
pub use config::{CacheConfig, HandlerConfig, HandlerConfigBuilder};
pub use elements::RecursiveChildResolver;
pub use handler::{CategoryNode, GroupedElements, GroupingNodeKey, QueryHandler};
pub use paths::{
    InstanceKeyPath, KindClasses, NodeKind, PathResolver, PathsRequest, FILTER_BY_KEYS,
    FILTER_BY_LABEL,
};
pub use queries::{
    ElementsQueryProps, CATEGORY_ELEMENTS, ELEMENTS, ELEMENTS_COUNT, ELEMENT_CHILDREN,
    ELEMENT_MODEL_CATEGORY, MODELS, MODEL_CATEGORIES, SUBJECTS,
};
pub use subjects::{SubjectHierarchyIndex, SubjectInfo, SubjectsInfo};

// Re-export the query layer for convenience
pub use models_tree_query;
pub use models_tree_query::{InstanceKey, NodeId, QueryError, QueryResult};

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_public_api_accessible() {
        let _: Option<CacheConfig> = None;
        let _: Option<HandlerConfig> = None;
        let _: Option<QueryHandler> = None;
        let _: Option<PathResolver> = None;
        let _: Option<ResultCache<NodeId>> = None;
        let _: Option<QueryResult<()>> = None;
    }

    #[test]
    fn test_re_exports() {
        let id: NodeId = "0x1".into();
        let key = InstanceKey::new("BisCore.Subject", id.clone());
        assert_eq!(key.id, id);
        let _ = models_tree_query::MAX_INLINE_IDS;
    }
}

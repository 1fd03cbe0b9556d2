//! The models tree query handler.

use std::collections::HashSet;
use std::sync::Arc;

use futures::future::{self, FutureExt};
use futures::stream::{self, StreamExt, TryStreamExt};
use models_tree_query::{
    ClassHierarchyInspector, GroupedInstancesProvider, IdStream, LimitingQueryExecutor, NodeId,
    QueryError, QueryExecutor, QueryResult,
};
use serde::{Deserialize, Serialize};
use tracing::{debug, instrument};

use crate::cache::{replay, CacheStats, ResultCache, SingleFlightCache};
use crate::config::HandlerConfig;
use crate::elements::RecursiveChildResolver;
use crate::paths::PathResolver;
use crate::queries::{
    self, ElementsQueryProps, ElementsSelect, CATEGORY_ELEMENTS, ELEMENTS, ELEMENTS_COUNT,
    ELEMENT_MODEL_CATEGORY, MODEL_CATEGORIES,
};
use crate::subjects::SubjectHierarchyIndex;

/// Identifies a grouping node of the presented hierarchy.
///
/// Only used as an opaque cache key and handed to the
/// [`GroupedInstancesProvider`].
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GroupingNodeKey {
    /// Grouping kind, e.g. `class-grouping`.
    #[serde(rename = "type")]
    pub grouping_type: String,
    /// Node identifiers from the root down to the grouping node.
    pub path_from_root: Vec<String>,
    /// Number of grouped instances.
    pub grouped_instances_count: usize,
}

/// Elements under a grouping node, with the model and category they share.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GroupedElements {
    /// Model of the first grouped element.
    pub model_id: NodeId,
    /// Category of the first grouped element.
    pub category_id: NodeId,
    element_ids: Arc<Vec<NodeId>>,
}

impl GroupedElements {
    /// Streams the grouped element ids.
    pub fn element_ids(&self) -> IdStream {
        replay(Arc::clone(&self.element_ids))
    }

    /// Returns the number of grouped elements.
    pub fn len(&self) -> usize {
        self.element_ids.len()
    }

    /// Returns true if nothing is grouped.
    pub fn is_empty(&self) -> bool {
        self.element_ids.is_empty()
    }
}

/// A category node, possibly merged from several categories across models.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct CategoryNode {
    /// Category ids represented by the node.
    pub category_ids: Vec<NodeId>,
    /// Display label, used in error messages.
    pub label: String,
    /// Models the node's elements live in.
    pub model_ids: Vec<NodeId>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ModelCategoryRow {
    model_id: NodeId,
    category_id: NodeId,
}

#[derive(Deserialize)]
struct CountRow {
    count: u64,
}

/// Answers hierarchy questions of a models tree over a [`QueryExecutor`].
///
/// Results are cached until [`invalidate_cache`](Self::invalidate_cache).
/// Concurrent requests for the same cached value share one query.
///
/// # Example
///
/// ```ignore
/// use models_tree_handler::{HandlerConfig, QueryHandler};
///
/// let handler = QueryHandler::with_config(executor, HandlerConfig::builder().with_max_results(10_000).build());
/// let subjects: Vec<_> = handler.query_child_subjects(&[root_subject]).try_collect().await?;
/// ```
pub struct QueryHandler {
    executor: Arc<dyn QueryExecutor>,
    limited: Arc<dyn QueryExecutor>,
    config: HandlerConfig,
    subjects: Arc<SubjectHierarchyIndex>,
    element_children: RecursiveChildResolver,
    model_categories: ResultCache<NodeId>,
    grouped_elements: SingleFlightCache<String, GroupedElements>,
    grouping_provider: Option<Arc<dyn GroupedInstancesProvider<GroupingNodeKey>>>,
}

impl QueryHandler {
    /// Creates a handler with default configuration.
    pub fn new(executor: Arc<dyn QueryExecutor>) -> Self {
        Self::with_config(executor, HandlerConfig::default())
    }

    /// Creates a handler with custom configuration.
    ///
    /// # Arguments
    ///
    /// * `executor` - Runs the handler's statements
    /// * `config` - Cache sizes and the row ceiling of element queries
    pub fn with_config(executor: Arc<dyn QueryExecutor>, config: HandlerConfig) -> Self {
        let limited: Arc<dyn QueryExecutor> = match config.max_results {
            Some(limit) => Arc::new(LimitingQueryExecutor::new(Arc::clone(&executor), limit)),
            None => Arc::clone(&executor),
        };
        Self {
            subjects: Arc::new(SubjectHierarchyIndex::new(Arc::clone(&executor))),
            element_children: RecursiveChildResolver::new(Arc::clone(&executor)),
            model_categories: ResultCache::new("model-categories", &config.cache),
            grouped_elements: SingleFlightCache::new("grouped-elements", &config.cache),
            grouping_provider: None,
            executor,
            limited,
            config,
        }
    }

    /// Sets the provider resolving grouping node contents.
    pub fn with_grouping_provider(
        mut self,
        provider: Arc<dyn GroupedInstancesProvider<GroupingNodeKey>>,
    ) -> Self {
        self.grouping_provider = Some(provider);
        self
    }

    /// Returns the handler configuration.
    pub fn config(&self) -> &HandlerConfig {
        &self.config
    }

    /// Returns the subject index.
    pub fn subjects(&self) -> &SubjectHierarchyIndex {
        &self.subjects
    }

    /// Creates a path resolver sharing this handler's executor and row ceiling.
    pub fn path_resolver(&self, inspector: Arc<dyn ClassHierarchyInspector>) -> PathResolver {
        PathResolver::new(Arc::clone(&self.limited), inspector)
    }

    /// Nearest visible child subjects of `parents`.
    pub fn query_child_subjects(&self, parents: &[NodeId]) -> IdStream {
        let subjects = Arc::clone(&self.subjects);
        let parents = parents.to_vec();
        ids_from(async move { subjects.child_subject_ids(&parents).await })
    }

    /// Models shown directly under `parents`, including those of hidden
    /// child subjects.
    pub fn query_subject_models(&self, parents: &[NodeId]) -> IdStream {
        let subjects = Arc::clone(&self.subjects);
        let parents = parents.to_vec();
        ids_from(async move { subjects.subject_model_ids(&parents).await })
    }

    /// Subjects with at least one model in their subtree.
    pub fn query_parent_subjects(&self) -> IdStream {
        let subjects = Arc::clone(&self.subjects);
        ids_from(async move { subjects.parent_subject_ids().await })
    }

    /// Every model in the subtree of `subject`, hidden or not.
    pub fn query_all_subject_models(&self, subject: &NodeId) -> IdStream {
        let subjects = Arc::clone(&self.subjects);
        let subject = subject.clone();
        ids_from(async move { subjects.subject_models_recursive(&subject).await })
    }

    /// Categories that have at least one root element in `model`.
    pub fn query_model_categories(&self, model: &NodeId) -> IdStream {
        let executor = Arc::clone(&self.executor);
        let query = queries::model_categories_query(model);
        self.model_categories.get_or_compute(model.clone(), move || {
            debug!(query = MODEL_CATEGORIES, "querying model categories");
            queries::ids(executor.execute(query), MODEL_CATEGORIES)
        })
    }

    /// Every element below `element`.
    pub fn query_element_children(&self, element: &NodeId) -> IdStream {
        self.element_children.resolve_children(element)
    }

    /// Resolves the elements grouped under `key` and the model and category
    /// of the first of them.
    ///
    /// # Errors
    ///
    /// [`QueryError::InvalidHierarchyState`] if the node groups no elements or
    /// its first element has no model/category row.
    #[instrument(level = "debug", skip(self))]
    pub async fn query_grouping_node_children(
        &self,
        key: &GroupingNodeKey,
    ) -> QueryResult<GroupedElements> {
        let provider = self
            .grouping_provider
            .clone()
            .ok_or_else(|| QueryError::query_failure("no grouped instances provider configured"))?;
        let cache_key = serde_json::to_string(key).map_err(QueryError::query_failure)?;
        let executor = Arc::clone(&self.executor);
        let key = key.clone();
        self.grouped_elements
            .get_or_start(cache_key, move || {
                group_elements(provider, executor, key).boxed()
            })
            .resolve()
            .await
    }

    /// Root elements of `node`'s categories within its models.
    ///
    /// A node without model ids yields [`QueryError::InvalidHierarchyState`].
    pub fn query_category_elements(&self, node: &CategoryNode) -> IdStream {
        if node.model_ids.is_empty() {
            let err = QueryError::invalid_state(format!(
                "Invalid category node \"{}\" - missing model information.",
                node.label
            ));
            return stream::once(future::ready(Err(err))).boxed();
        }
        let query = queries::category_elements_query(&node.category_ids, &node.model_ids);
        queries::ids(self.limited.execute(query), CATEGORY_ELEMENTS)
    }

    /// Elements matching `props`, together with all their descendants.
    ///
    /// Subject to the configured row ceiling.
    pub fn query_elements(&self, props: &ElementsQueryProps) -> IdStream {
        let query = queries::elements_query(props, ElementsSelect::Ids);
        queries::ids(self.limited.execute(query), ELEMENTS)
    }

    /// Number of elements [`query_elements`](Self::query_elements) would return.
    #[instrument(level = "debug", skip(self))]
    pub async fn query_elements_count(&self, props: &ElementsQueryProps) -> QueryResult<u64> {
        let query = queries::elements_query(props, ElementsSelect::Count);
        let row: Option<CountRow> =
            queries::decoded(self.executor.execute(query), ELEMENTS_COUNT)
                .try_next()
                .await?;
        Ok(row.map_or(0, |row| row.count))
    }

    /// Drops every cache and the subject index.
    pub fn invalidate_cache(&self) {
        self.model_categories.clear();
        self.grouped_elements.clear();
        self.element_children.invalidate();
        self.subjects.invalidate();
        debug!("invalidated query handler caches");
    }

    /// Returns statistics of the model categories cache.
    pub fn model_categories_stats(&self) -> CacheStats {
        self.model_categories.stats()
    }
}

impl std::fmt::Debug for QueryHandler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueryHandler")
            .field("config", &self.config)
            .field("subjects", &self.subjects)
            .field("element_children", &self.element_children)
            .field("model_categories", &self.model_categories)
            .finish()
    }
}

fn ids_from<F>(ids: F) -> IdStream
where
    F: std::future::Future<Output = QueryResult<Vec<NodeId>>> + Send + 'static,
{
    stream::once(ids)
        .map_ok(|ids| stream::iter(ids.into_iter().map(Ok)))
        .try_flatten()
        .boxed()
}

async fn group_elements(
    provider: Arc<dyn GroupedInstancesProvider<GroupingNodeKey>>,
    executor: Arc<dyn QueryExecutor>,
    key: GroupingNodeKey,
) -> QueryResult<GroupedElements> {
    let mut seen = HashSet::new();
    let element_ids: Vec<NodeId> = provider
        .grouped_instance_ids(&key)
        .try_filter(|id| future::ready(seen.insert(id.clone())))
        .try_collect()
        .await?;
    let first = element_ids.first().ok_or_else(|| {
        QueryError::invalid_state(format!(
            "Grouping node {:?} does not group any elements",
            key.path_from_root
        ))
    })?;

    let rows = executor.execute(queries::element_model_category_query(first));
    let row: Option<ModelCategoryRow> = queries::decoded(rows, ELEMENT_MODEL_CATEGORY)
        .try_next()
        .await?;
    let row = row.ok_or_else(|| {
        QueryError::invalid_state(format!("Element {first} has no model or category"))
    })?;

    debug!(
        elements = element_ids.len(),
        model = %row.model_id,
        category = %row.category_id,
        "resolved grouping node"
    );
    Ok(GroupedElements {
        model_id: row.model_id,
        category_id: row.category_id,
        element_ids: Arc::new(element_ids),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CacheConfig;
    use models_tree_query::{Query, Row, RowStream};
    use parking_lot::Mutex;

    #[derive(Default)]
    struct MockStore {
        executed: Mutex<Vec<String>>,
    }

    impl MockStore {
        fn count(&self, name: &str) -> usize {
            self.executed.lock().iter().filter(|q| *q == name).count()
        }
    }

    impl QueryExecutor for MockStore {
        fn execute(&self, query: Query) -> RowStream {
            self.executed.lock().push(query.name().to_string());
            let rows = match query.name() {
                MODEL_CATEGORIES => vec![Row::new().with("id", "0xc1"), Row::new().with("id", "0xc2")],
                ELEMENT_MODEL_CATEGORY => {
                    vec![Row::new().with("modelId", "0x10").with("categoryId", "0xc1")]
                }
                ELEMENTS_COUNT => vec![Row::new().with("count", 7)],
                ELEMENTS | CATEGORY_ELEMENTS => (0..5)
                    .map(|i| Row::new().with("id", format!("0x{i}")))
                    .collect(),
                _ => Vec::new(),
            };
            stream::iter(rows.into_iter().map(Ok)).boxed()
        }
    }

    struct FixedGroups(Vec<&'static str>);

    impl GroupedInstancesProvider<GroupingNodeKey> for FixedGroups {
        fn grouped_instance_ids(&self, _key: &GroupingNodeKey) -> IdStream {
            stream::iter(self.0.clone().into_iter().map(|id| Ok(NodeId::from(id)))).boxed()
        }
    }

    fn grouping_key() -> GroupingNodeKey {
        GroupingNodeKey {
            grouping_type: "class-grouping".into(),
            path_from_root: vec!["0x1".into(), "0x10".into()],
            grouped_instances_count: 2,
        }
    }

    fn handler(store: &Arc<MockStore>) -> QueryHandler {
        QueryHandler::new(store.clone())
    }

    #[tokio::test]
    async fn test_model_categories_are_cached() {
        let store = Arc::new(MockStore::default());
        let handler = handler(&store);
        let model = NodeId::from("0x10");

        let first: Vec<NodeId> = handler.query_model_categories(&model).try_collect().await.unwrap();
        let second: Vec<NodeId> = handler.query_model_categories(&model).try_collect().await.unwrap();

        assert_eq!(first, vec![NodeId::from("0xc1"), NodeId::from("0xc2")]);
        assert_eq!(second, first);
        assert_eq!(store.count(MODEL_CATEGORIES), 1);
        assert_eq!(handler.model_categories_stats().finalized_entries, 1);
    }

    #[tokio::test]
    async fn test_grouping_node_children_are_memoized() {
        let store = Arc::new(MockStore::default());
        let handler =
            handler(&store).with_grouping_provider(Arc::new(FixedGroups(vec!["0x5", "0x6", "0x5"])));

        let grouped = handler.query_grouping_node_children(&grouping_key()).await.unwrap();
        let again = handler.query_grouping_node_children(&grouping_key()).await.unwrap();

        assert_eq!(grouped.model_id, NodeId::from("0x10"));
        assert_eq!(grouped.category_id, NodeId::from("0xc1"));
        assert_eq!(grouped.len(), 2);
        let ids: Vec<NodeId> = grouped.element_ids().try_collect().await.unwrap();
        assert_eq!(ids, vec![NodeId::from("0x5"), NodeId::from("0x6")]);
        assert_eq!(again, grouped);
        assert_eq!(store.count(ELEMENT_MODEL_CATEGORY), 1);
    }

    #[tokio::test]
    async fn test_empty_grouping_node_is_invalid() {
        let store = Arc::new(MockStore::default());
        let handler = handler(&store).with_grouping_provider(Arc::new(FixedGroups(Vec::new())));

        let err = handler
            .query_grouping_node_children(&grouping_key())
            .await
            .unwrap_err();

        assert!(matches!(err, QueryError::InvalidHierarchyState(_)));
        assert_eq!(store.count(ELEMENT_MODEL_CATEGORY), 0);
    }

    #[tokio::test]
    async fn test_grouping_without_provider_fails() {
        let store = Arc::new(MockStore::default());
        let err = handler(&store)
            .query_grouping_node_children(&grouping_key())
            .await
            .unwrap_err();
        assert!(matches!(err, QueryError::QueryFailure(_)));
    }

    #[tokio::test]
    async fn test_category_node_without_models_is_invalid() {
        let store = Arc::new(MockStore::default());
        let node = CategoryNode {
            category_ids: vec![NodeId::from("0xc1")],
            label: "Piping".into(),
            model_ids: Vec::new(),
        };

        let result: QueryResult<Vec<NodeId>> =
            handler(&store).query_category_elements(&node).try_collect().await;

        assert_eq!(
            result,
            Err(QueryError::InvalidHierarchyState(
                "Invalid category node \"Piping\" - missing model information.".into()
            ))
        );
        assert_eq!(store.count(CATEGORY_ELEMENTS), 0);
    }

    #[tokio::test]
    async fn test_elements_respect_row_ceiling() {
        let store = Arc::new(MockStore::default());
        let config = HandlerConfig::builder()
            .with_cache(CacheConfig { max_entries: Some(16) })
            .with_max_results(3)
            .build();
        let handler = QueryHandler::with_config(store.clone(), config);

        let result: QueryResult<Vec<NodeId>> = handler
            .query_elements(&ElementsQueryProps::default())
            .try_collect()
            .await;
        let err = result.unwrap_err();
        assert!(err.is_result_set_too_large());
        assert_eq!(err, QueryError::ResultSetTooLarge { limit: 3 });
    }

    #[tokio::test]
    async fn test_elements_count() {
        let store = Arc::new(MockStore::default());
        let count = handler(&store)
            .query_elements_count(&ElementsQueryProps::default())
            .await
            .unwrap();
        assert_eq!(count, 7);
    }

    #[tokio::test]
    async fn test_invalidate_clears_model_categories() {
        let store = Arc::new(MockStore::default());
        let handler = handler(&store);
        let model = NodeId::from("0x10");

        let _: Vec<NodeId> = handler.query_model_categories(&model).try_collect().await.unwrap();
        handler.invalidate_cache();
        let _: Vec<NodeId> = handler.query_model_categories(&model).try_collect().await.unwrap();

        assert_eq!(store.count(MODEL_CATEGORIES), 2);
    }

    #[test]
    fn test_grouping_key_serializes_as_cache_key() {
        let json = serde_json::to_string(&grouping_key()).unwrap();
        assert_eq!(
            json,
            r#"{"type":"class-grouping","pathFromRoot":["0x1","0x10"],"groupedInstancesCount":2}"#
        );
    }
}

//! Ancestor paths for filtering and revealing tree nodes.
//!
//! A path lists the instance keys from the hierarchy root down to a target,
//! root first. Hidden subjects are left out of paths entirely.
//!
//! Targets are given either as instance keys of mixed kinds or as a label
//! substring. Either way the resolver issues exactly one query; the statement
//! builds every path in the store (leaf first, as nested JSON arrays) and the
//! resolver flattens and reverses each one.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::Arc;

use futures::future::{self, FutureExt, TryFutureExt};
use futures::stream::TryStreamExt;
use models_tree_query::{
    bind_ids, Binding, ClassHierarchyInspector, DefaultLabelSelector, Fragment, InstanceKey,
    InstanceLabelSelector, LimitingQueryExecutor, NodeId, Query, QueryBuilder, QueryError,
    QueryExecutor, QueryResult,
};
use serde::Deserialize;
use serde_json::Value;
use tracing::{debug, instrument, trace};

use crate::cache::SingleFlightCache;
use crate::config::CacheConfig;
use crate::queries::{self, subject_hidden_condition};

/// Name of the query built from instance keys.
pub const FILTER_BY_KEYS: &str = "models-tree/filter-by-keys";
/// Name of the query built from a label.
pub const FILTER_BY_LABEL: &str = "models-tree/filter-by-label";

/// Instance keys from the hierarchy root down to a target.
pub type InstanceKeyPath = Vec<InstanceKey>;

/// What to compute ancestor paths for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PathsRequest {
    /// Paths to each of these instances.
    Keys(Vec<InstanceKey>),
    /// Paths to every subject, model or element whose label contains the text.
    Label(String),
}

/// Kind of a hierarchy node, derived from its class.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NodeKind {
    /// A subject.
    Subject,
    /// A model.
    Model,
    /// A spatial category.
    Category,
    /// Any other element.
    Element,
}

/// Base classes used to classify instance keys.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KindClasses {
    /// Base class of subjects.
    pub subject: String,
    /// Base class of models.
    pub model: String,
    /// Base class of categories.
    pub category: String,
}

impl Default for KindClasses {
    fn default() -> Self {
        Self {
            subject: "BisCore.Subject".to_string(),
            model: "BisCore.Model".to_string(),
            category: "BisCore.SpatialCategory".to_string(),
        }
    }
}

#[derive(Debug, Default)]
struct KindIds {
    elements: Vec<NodeId>,
    categories: Vec<NodeId>,
    models: Vec<NodeId>,
    subjects: Vec<NodeId>,
}

impl KindIds {
    fn push(&mut self, kind: NodeKind, id: NodeId) {
        let ids = match kind {
            NodeKind::Subject => &mut self.subjects,
            NodeKind::Model => &mut self.models,
            NodeKind::Category => &mut self.categories,
            NodeKind::Element => &mut self.elements,
        };
        if !ids.contains(&id) {
            ids.push(id);
        }
    }
}

/// Computes ancestor paths of hierarchy nodes.
///
/// # Example
///
/// ```ignore
/// let resolver = PathResolver::new(executor, inspector).with_max_results(10_000);
/// let paths = resolver
///     .compute_ancestor_paths(&PathsRequest::Label("pump".into()))
///     .await?;
/// ```
pub struct PathResolver {
    executor: Arc<dyn QueryExecutor>,
    inspector: Arc<dyn ClassHierarchyInspector>,
    labels: Arc<dyn InstanceLabelSelector>,
    classes: KindClasses,
    kinds: SingleFlightCache<String, NodeKind>,
}

impl PathResolver {
    /// Creates a resolver using [`DefaultLabelSelector`] and BisCore base classes.
    pub fn new(
        executor: Arc<dyn QueryExecutor>,
        inspector: Arc<dyn ClassHierarchyInspector>,
    ) -> Self {
        Self {
            executor,
            inspector,
            labels: Arc::new(DefaultLabelSelector),
            classes: KindClasses::default(),
            kinds: SingleFlightCache::new("class-kinds", &CacheConfig::default()),
        }
    }

    /// Sets the label selector used for label searches.
    pub fn with_label_selector(mut self, labels: Arc<dyn InstanceLabelSelector>) -> Self {
        self.labels = labels;
        self
    }

    /// Sets the base classes used to classify keys.
    pub fn with_kind_classes(mut self, classes: KindClasses) -> Self {
        self.classes = classes;
        self.kinds.clear();
        self
    }

    /// Fails path queries returning more than `limit` rows with
    /// [`QueryError::ResultSetTooLarge`].
    pub fn with_max_results(mut self, limit: usize) -> Self {
        self.executor = Arc::new(LimitingQueryExecutor::new(self.executor, limit));
        self
    }

    /// Computes root-first ancestor paths for the request.
    ///
    /// Paths come back in no particular order. Repeating a request returns the
    /// same set of paths.
    #[instrument(level = "debug", skip(self))]
    pub async fn compute_ancestor_paths(
        &self,
        request: &PathsRequest,
    ) -> QueryResult<Vec<InstanceKeyPath>> {
        match request {
            PathsRequest::Keys(keys) => self.paths_from_keys(keys).await,
            PathsRequest::Label(label) => self.paths_from_label(label).await,
        }
    }

    /// Classifies `class_name`, asking the inspector only once per class.
    ///
    /// Concurrent requests for the same class share one classification.
    pub async fn classify(&self, class_name: &str) -> QueryResult<NodeKind> {
        let inspector = Arc::clone(&self.inspector);
        let classes = self.classes.clone();
        let class = class_name.to_string();
        self.kinds
            .get_or_start(class_name.to_string(), move || {
                classify_class(inspector, classes, class).boxed()
            })
            .resolve()
            .await
    }

    async fn paths_from_keys(&self, keys: &[InstanceKey]) -> QueryResult<Vec<InstanceKeyPath>> {
        let classes: BTreeSet<&str> = keys.iter().map(|key| key.class_name.as_str()).collect();
        let kinds: HashMap<&str, NodeKind> = future::try_join_all(
            classes
                .into_iter()
                .map(|class| self.classify(class).map_ok(move |kind| (class, kind))),
        )
        .await?
        .into_iter()
        .collect();

        let mut ids = KindIds::default();
        for key in keys {
            if let Some(kind) = kinds.get(key.class_name.as_str()) {
                ids.push(*kind, key.id.clone());
            }
        }

        let Some(query) = keys_query(&ids) else {
            return Ok(Vec::new());
        };
        let paths = self.run(query, FILTER_BY_KEYS).await?;
        debug!(keys = keys.len(), paths = paths.len(), "resolved key paths");
        Ok(paths)
    }

    async fn paths_from_label(&self, label: &str) -> QueryResult<Vec<InstanceKeyPath>> {
        if label.is_empty() {
            return Ok(Vec::new());
        }
        let mut paths = self
            .run(label_query(label, self.labels.as_ref()), FILTER_BY_LABEL)
            .await?;
        let mut seen = HashSet::new();
        paths.retain(|path| seen.insert(path.clone()));
        debug!(label, paths = paths.len(), "resolved label paths");
        Ok(paths)
    }

    async fn run(&self, query: Query, name: &'static str) -> QueryResult<Vec<InstanceKeyPath>> {
        queries::decoded::<PathRow>(self.executor.execute(query), name)
            .and_then(|row| future::ready(row.into_path(name)))
            .try_collect()
            .await
    }
}

impl std::fmt::Debug for PathResolver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PathResolver")
            .field("classes", &self.classes)
            .field("classified", &self.kinds.len())
            .finish()
    }
}

async fn classify_class(
    inspector: Arc<dyn ClassHierarchyInspector>,
    classes: KindClasses,
    class_name: String,
) -> QueryResult<NodeKind> {
    let candidates = [
        (NodeKind::Subject, &classes.subject),
        (NodeKind::Model, &classes.model),
        (NodeKind::Category, &classes.category),
    ];
    let mut kind = NodeKind::Element;
    for (candidate, base) in candidates {
        if inspector.derives_from(&class_name, base).await? {
            kind = candidate;
            break;
        }
    }
    trace!(class_name = %class_name, ?kind, "classified");
    Ok(kind)
}

#[derive(Deserialize)]
struct PathRow {
    path: PathColumn,
}

/// Executors may hand JSON columns back as text or already parsed.
#[derive(Deserialize)]
#[serde(untagged)]
enum PathColumn {
    Text(String),
    Json(Value),
}

impl PathRow {
    fn into_path(self, query: &str) -> QueryResult<InstanceKeyPath> {
        let value = match self.path {
            PathColumn::Text(text) => {
                serde_json::from_str(&text).map_err(|err| QueryError::decode(query, err))?
            }
            PathColumn::Json(value) => value,
        };
        let mut path = Vec::new();
        flatten(value, &mut path, query)?;
        path.reverse();
        Ok(path)
    }
}

fn flatten(value: Value, path: &mut InstanceKeyPath, query: &str) -> QueryResult<()> {
    match value {
        Value::Array(items) => {
            for item in items {
                flatten(item, path, query)?;
            }
        }
        key => {
            let key = serde_json::from_value(key).map_err(|err| QueryError::decode(query, err))?;
            path.push(key);
        }
    }
    Ok(())
}

/// Label selector for statements that never read labels.
struct NoLabels;

impl InstanceLabelSelector for NoLabels {
    fn label_selector(&self, _class_alias: &str, _class_name: &str) -> String {
        "''".to_string()
    }
}

fn instance_key(class_id: &str, hex_id: &str) -> String {
    format!("json_object('className', ec_classname({class_id}, 's.c'), 'id', {hex_id})")
}

fn alias_key(alias: &str) -> String {
    instance_key(
        &format!("[{alias}].[ECClassId]"),
        &format!("printf('0x%x', [{alias}].[ECInstanceId])"),
    )
}

fn hex_key(alias: &str) -> String {
    instance_key(&format!("[{alias}].[ECClassId]"), &format!("[{alias}].[HexId]"))
}

/// Join condition between subject paths `s` and a model row `alias`: the
/// model's partition parent or the subject's target partition.
fn subject_of(alias: &str) -> String {
    format!(
        "s.TargetId = {alias}.ModelParentId OR json_extract(s.JsonProperties, '$.Subject.Model.TargetPartition') = {alias}.HexId"
    )
}

fn subject_path_ctes(labels: &dyn InstanceLabelSelector) -> Vec<String> {
    vec![
        format!(
            "Models(ECClassId, ECInstanceId, HexId, ModelParentId, Label) AS (
              SELECT
                m.ECClassId,
                m.ECInstanceId,
                printf('0x%x', m.ECInstanceId),
                p.Parent.Id,
                {label}
              FROM bis.GeometricModel3d m
              JOIN bis.Element p ON p.ECInstanceId = m.ModeledElement.Id
            )",
            label = labels.label_selector("p", "BisCore.Element"),
        ),
        format!(
            "SubjectsHierarchy(TargetId, TargetLabel, ECClassId, ECInstanceId, ParentId, JsonProperties, Path) AS (
              SELECT
                s.ECInstanceId,
                {label},
                s.ECClassId,
                s.ECInstanceId,
                s.Parent.Id,
                s.JsonProperties,
                CASE WHEN {hidden_s} THEN json_array() ELSE json_array({key_s}) END
              FROM bis.Subject s
              UNION ALL
              SELECT
                c.TargetId,
                c.TargetLabel,
                p.ECClassId,
                p.ECInstanceId,
                p.Parent.Id,
                p.JsonProperties,
                CASE WHEN {hidden_p} THEN c.Path ELSE json_insert(c.Path, '$[#]', {key_p}) END
              FROM SubjectsHierarchy c
              JOIN bis.Subject p ON p.ECInstanceId = c.ParentId
            )",
            label = labels.label_selector("s", "BisCore.Subject"),
            hidden_s = subject_hidden_condition("s"),
            hidden_p = subject_hidden_condition("p"),
            key_s = alias_key("s"),
            key_p = alias_key("p"),
        ),
        "Subjects(TargetId, TargetLabel, JsonProperties, Path) AS (
              SELECT s.TargetId, s.TargetLabel, s.JsonProperties, s.Path
              FROM SubjectsHierarchy s
              WHERE s.ParentId IS NULL
            )"
        .to_string(),
    ]
}

fn path_ctes(labels: &dyn InstanceLabelSelector) -> Vec<String> {
    let mut ctes = vec![
        format!(
            "ElementsHierarchy(TargetId, TargetLabel, ECInstanceId, ParentId, ModelId, CategoryId, Path) AS (
              SELECT
                e.ECInstanceId,
                {label},
                e.ECInstanceId,
                e.Parent.Id,
                e.Model.Id,
                e.Category.Id,
                json_array({key_e})
              FROM bis.GeometricElement3d e
              UNION ALL
              SELECT
                c.TargetId,
                c.TargetLabel,
                p.ECInstanceId,
                p.Parent.Id,
                p.Model.Id,
                p.Category.Id,
                json_insert(c.Path, '$[#]', {key_p})
              FROM ElementsHierarchy c
              JOIN bis.GeometricElement3d p ON p.ECInstanceId = c.ParentId
            )",
            label = labels.label_selector("e", "BisCore.GeometricElement3d"),
            key_e = alias_key("e"),
            key_p = alias_key("p"),
        ),
        "RootedElements(TargetId, TargetLabel, ModelId, CategoryId, Path) AS (
              SELECT e.TargetId, e.TargetLabel, e.ModelId, e.CategoryId, e.Path
              FROM ElementsHierarchy e
              WHERE e.ParentId IS NULL
            )"
        .to_string(),
        "Categories(ECClassId, ECInstanceId, HexId) AS (
              SELECT c.ECClassId, c.ECInstanceId, printf('0x%x', c.ECInstanceId)
              FROM bis.SpatialCategory c
            )"
        .to_string(),
        format!(
            "ModelElementsHierarchy(TargetId, TargetLabel, ModelId, ModelParentId, HexId, Path) AS (
              SELECT
                e.TargetId,
                e.TargetLabel,
                m.ECInstanceId,
                m.ModelParentId,
                m.HexId,
                json_insert(e.Path, '$[#]', {key_c}, '$[#]', {key_m})
              FROM RootedElements e
              JOIN Categories c ON c.ECInstanceId = e.CategoryId
              JOIN Models m ON m.ECInstanceId = e.ModelId
              UNION ALL
              SELECT
                h.TargetId,
                h.TargetLabel,
                m.ECInstanceId,
                m.ModelParentId,
                m.HexId,
                json_insert(h.Path, '$[#]', json(e.Path), '$[#]', {key_c}, '$[#]', {key_m})
              FROM ModelElementsHierarchy h
              JOIN RootedElements e ON e.TargetId = h.ModelId
              JOIN Categories c ON c.ECInstanceId = e.CategoryId
              JOIN Models m ON m.ECInstanceId = e.ModelId
            )",
            key_c = hex_key("c"),
            key_m = hex_key("m"),
        ),
    ];
    ctes.extend(subject_path_ctes(labels));
    ctes
}

/// One sub-query per non-empty kind, bound in element, category, model,
/// subject order.
fn keys_query(ids: &KindIds) -> Option<Query> {
    let mut parts = Vec::new();
    if !ids.elements.is_empty() {
        parts.push(Fragment::new("elements", |bindings| {
            format!(
                "SELECT json_insert(h.Path, '$[#]', json(s.Path)) AS path
                FROM ModelElementsHierarchy h
                JOIN Subjects s ON {join}
                WHERE {filter}",
                join = subject_of("h"),
                filter = bind_ids("h.TargetId", ids.elements.iter().cloned(), bindings),
            )
        }));
    }
    if !ids.categories.is_empty() {
        parts.push(Fragment::new("categories", |bindings| {
            format!(
                "SELECT json_array({key_c}, {key_m}, json(s.Path)) AS path
                FROM Categories c, Models m
                JOIN Subjects s ON {join}
                WHERE m.ECInstanceId IN (
                    SELECT e.Model.Id FROM bis.GeometricElement3d e WHERE e.Category.Id = c.ECInstanceId
                  )
                  AND {filter}",
                key_c = hex_key("c"),
                key_m = hex_key("m"),
                join = subject_of("m"),
                filter = bind_ids("c.ECInstanceId", ids.categories.iter().cloned(), bindings),
            )
        }));
    }
    if !ids.models.is_empty() {
        parts.push(Fragment::new("models", |bindings| {
            format!(
                "SELECT json_array({key_m}, json(s.Path)) AS path
                FROM Models m
                JOIN Subjects s ON {join}
                WHERE {filter}",
                key_m = hex_key("m"),
                join = subject_of("m"),
                filter = bind_ids("m.ECInstanceId", ids.models.iter().cloned(), bindings),
            )
        }));
    }
    if !ids.subjects.is_empty() {
        parts.push(Fragment::new("subjects", |bindings| {
            format!(
                "SELECT s.Path AS path FROM Subjects s WHERE {}",
                bind_ids("s.TargetId", ids.subjects.iter().cloned(), bindings)
            )
        }));
    }
    if parts.is_empty() {
        return None;
    }

    Some(
        QueryBuilder::new(FILTER_BY_KEYS)
            .ctes(path_ctes(&NoLabels))
            .union_all(parts)
            .build(),
    )
}

fn label_query(label: &str, labels: &dyn InstanceLabelSelector) -> Query {
    let sources = [
        format!(
            "SELECT h.TargetLabel AS Label, json_insert(h.Path, '$[#]', json(s.Path)) AS Path
            FROM ModelElementsHierarchy h
            JOIN Subjects s ON {}",
            subject_of("h")
        ),
        format!(
            "SELECT m.Label AS Label, json_array({}, json(s.Path)) AS Path
            FROM Models m
            JOIN Subjects s ON {}",
            hex_key("m"),
            subject_of("m")
        ),
        "SELECT s.TargetLabel AS Label, s.Path AS Path FROM Subjects s".to_string(),
    ];

    QueryBuilder::new(FILTER_BY_LABEL)
        .ctes(path_ctes(labels))
        .push("SELECT DISTINCT Path AS path FROM (")
        .push(&sources.join(" UNION ALL "))
        .push(")")
        .filter([Fragment::new("label", |bindings| {
            bindings.push(Binding::String(escape_like(label)));
            "Label LIKE '%' || ? || '%' ESCAPE '\\'".to_string()
        })])
        .build()
}

/// Escapes `LIKE` wildcards so the label matches as a literal substring.
fn escape_like(label: &str) -> String {
    let mut escaped = String::with_capacity(label.len());
    for ch in label.chars() {
        if matches!(ch, '\\' | '%' | '_') {
            escaped.push('\\');
        }
        escaped.push(ch);
    }
    escaped
}

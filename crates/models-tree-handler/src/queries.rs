//! Statements issued by the query handler.
//!
//! Every statement has a stable name (see the `*` constants) so executors can
//! tag, trace or, in tests, dispatch on them.

use futures::future;
use futures::stream::{BoxStream, StreamExt, TryStreamExt};
use models_tree_query::{
    bind_named, Fragment, IdStream, NodeId, Query, QueryBuilder, QueryResult, RowStream,
};
use serde::de::DeserializeOwned;
use serde::Deserialize;

/// Subjects with their parent, target partition and hidden flag.
pub const SUBJECTS: &str = "models-tree/subjects";
/// Non-private models that contain at least one element.
pub const MODELS: &str = "models-tree/models";
/// Categories of a model's root elements.
pub const MODEL_CATEGORIES: &str = "models-tree/model-categories";
/// Full `(id, parentId)` closure below an element.
pub const ELEMENT_CHILDREN: &str = "models-tree/element-children";
/// Elements matching [`ElementsQueryProps`], with their descendants.
pub const ELEMENTS: &str = "models-tree/elements";
/// Count variant of [`ELEMENTS`].
pub const ELEMENTS_COUNT: &str = "models-tree/elements-count";
/// Model and category of a single element.
pub const ELEMENT_MODEL_CATEGORY: &str = "models-tree/element-model-category";
/// Root elements of categories within models.
pub const CATEGORY_ELEMENTS: &str = "models-tree/category-elements";

/// Condition matching subjects that never show up as tree nodes: bridge job
/// subjects and subjects of `Hierarchy` model type.
pub(crate) fn subject_hidden_condition(alias: &str) -> String {
    format!(
        "(
          json_extract([{alias}].JsonProperties, '$.Subject.Job.Bridge') IS NOT NULL
          OR json_extract([{alias}].JsonProperties, '$.Subject.Model.Type') = 'Hierarchy'
        )"
    )
}

/// Filters of an elements query. Every filter is optional.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ElementsQueryProps {
    /// Only elements in this model.
    pub model_id: Option<NodeId>,
    /// Only elements in this category.
    pub category_id: Option<NodeId>,
    /// Only children of this element.
    pub root_element_id: Option<NodeId>,
    /// Restricts the final result (roots and descendants) to these ids.
    pub element_ids: Option<Vec<NodeId>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ElementsSelect {
    Ids,
    Count,
}

#[derive(Deserialize)]
struct IdRow {
    id: NodeId,
}

/// Decodes every row of `rows` into `T`.
pub(crate) fn decoded<T>(
    rows: RowStream,
    query: &'static str,
) -> BoxStream<'static, QueryResult<T>>
where
    T: DeserializeOwned + Send + 'static,
{
    rows.and_then(move |row| future::ready(row.decode(query))).boxed()
}

/// Decodes the `id` column of every row.
pub(crate) fn ids(rows: RowStream, query: &'static str) -> IdStream {
    decoded::<IdRow>(rows, query).map_ok(|row| row.id).boxed()
}

pub(crate) fn subjects_query() -> Query {
    QueryBuilder::new(SUBJECTS)
        .push(&format!(
            "SELECT
              s.ECInstanceId id,
              s.Parent.Id parentId,
              json_extract(s.JsonProperties, '$.Subject.Model.TargetPartition') targetPartitionId,
              CASE WHEN {} THEN 1 ELSE 0 END hideInHierarchy
            FROM bis.Subject s",
            subject_hidden_condition("s")
        ))
        .build()
}

pub(crate) fn models_query() -> Query {
    QueryBuilder::new(MODELS)
        .push(
            "SELECT p.ECInstanceId id, p.Parent.Id parentId
            FROM bis.InformationPartitionElement p
            INNER JOIN bis.GeometricModel3d m ON m.ModeledElement.Id = p.ECInstanceId",
        )
        .filter([
            Fragment::raw("public", "NOT m.IsPrivate"),
            Fragment::raw(
                "has-elements",
                "EXISTS (SELECT 1 FROM bis.GeometricElement3d WHERE Model.Id = m.ECInstanceId)",
            ),
        ])
        .build()
}

pub(crate) fn model_categories_query(model_id: &NodeId) -> Query {
    QueryBuilder::new(MODEL_CATEGORIES)
        .push(
            "SELECT ECInstanceId id
            FROM bis.SpatialCategory c
            WHERE EXISTS (
              SELECT 1
              FROM bis.GeometricElement3d e
              WHERE ",
        )
        .fragment(Fragment::id("model", "e.Model.Id", model_id))
        .push(
            "
                AND e.Category.Id = c.ECInstanceId
                AND e.Parent IS NULL
              LIMIT 1
            )",
        )
        .build()
}

pub(crate) fn element_children_query(element_id: &NodeId) -> Query {
    QueryBuilder::new(ELEMENT_CHILDREN)
        .push(
            "WITH RECURSIVE ChildElements(id, parentId) AS (
              SELECT e.ECInstanceId AS id, e.Parent.Id AS parentId
              FROM bis.GeometricElement3d e
              WHERE ",
        )
        .named(|bindings| bind_named("e.Parent.Id", element_id, "parentId", bindings))
        .push(
            "
              UNION ALL
              SELECT e.ECInstanceId AS id, e.Parent.Id AS parentId
              FROM bis.GeometricElement3d e
              INNER JOIN ChildElements ce ON e.Parent.Id = ce.id
            )
            SELECT id, parentId FROM ChildElements",
        )
        .build()
}

pub(crate) fn elements_query(props: &ElementsQueryProps, select: ElementsSelect) -> Query {
    let mut roots = Vec::new();
    if let Some(model_id) = &props.model_id {
        roots.push(Fragment::id("model", "Model.Id", model_id));
    }
    if let Some(category_id) = &props.category_id {
        roots.push(Fragment::id("category", "Category.Id", category_id));
    }
    if let Some(root_element_id) = &props.root_element_id {
        roots.push(Fragment::id("root-element", "Parent.Id", root_element_id));
    }
    let restriction = props
        .element_ids
        .as_ref()
        .map(|ids| Fragment::ids("element-ids", "id", ids.iter().cloned()));

    let (name, projection) = match select {
        ElementsSelect::Ids => (ELEMENTS, "id"),
        ElementsSelect::Count => (ELEMENTS_COUNT, "COUNT(*) count"),
    };
    QueryBuilder::new(name)
        .push(
            "WITH RECURSIVE
              RootElements(id) AS (
                SELECT e.ECInstanceId AS id
                FROM bis.GeometricElement3d e",
        )
        .filter(roots)
        .push(
            "
              ),
              ChildElements(id) AS (
                SELECT * FROM RootElements
                UNION ALL
                SELECT e.ECInstanceId AS id
                FROM bis.GeometricElement3d e
                INNER JOIN ChildElements ce ON e.Parent.Id = ce.id
              )
            SELECT ",
        )
        .push(projection)
        .push(" FROM ChildElements")
        .filter(restriction)
        .build()
}

pub(crate) fn element_model_category_query(element_id: &NodeId) -> Query {
    QueryBuilder::new(ELEMENT_MODEL_CATEGORY)
        .push("SELECT Model.Id AS modelId, Category.Id AS categoryId FROM bis.GeometricElement3d")
        .filter([Fragment::id("element", "ECInstanceId", element_id)])
        .push(" LIMIT 1")
        .build()
}

pub(crate) fn category_elements_query(category_ids: &[NodeId], model_ids: &[NodeId]) -> Query {
    QueryBuilder::new(CATEGORY_ELEMENTS)
        .push("SELECT this.ECInstanceId id FROM bis.GeometricElement3d this")
        .filter([
            Fragment::ids("category", "this.Category.Id", category_ids.iter().cloned()),
            Fragment::ids("model", "this.Model.Id", model_ids.iter().cloned()),
            Fragment::raw("roots", "this.Parent IS NULL"),
        ])
        .build()
}

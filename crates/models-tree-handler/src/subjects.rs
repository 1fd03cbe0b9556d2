//! In-memory subject/model forest.
//!
//! The [`SubjectHierarchyIndex`] loads every subject and every displayable
//! model in two queries and answers all subject-level hierarchy questions from
//! memory afterwards.
//!
//! Subjects flagged `hideInHierarchy` never become tree nodes. They are
//! transparent: their child subjects and models surface under the nearest
//! visible ancestor instead.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::{Arc, OnceLock};

use futures::future::FutureExt;
use futures::TryStreamExt;
use models_tree_query::{NodeId, QueryExecutor, QueryResult};
use serde::{Deserialize, Deserializer};
use tracing::{debug, instrument};

use crate::cache::SingleFlightCache;
use crate::config::CacheConfig;
use crate::queries::{self, MODELS, SUBJECTS};

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SubjectRow {
    id: NodeId,
    #[serde(default)]
    parent_id: Option<NodeId>,
    #[serde(default)]
    target_partition_id: Option<NodeId>,
    #[serde(default, deserialize_with = "flag")]
    hide_in_hierarchy: bool,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ModelRow {
    id: NodeId,
    #[serde(default)]
    parent_id: Option<NodeId>,
}

/// Boolean columns may come back as `true`/`false` or as `1`/`0`.
fn flag<'de, D: Deserializer<'de>>(deserializer: D) -> Result<bool, D::Error> {
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Flag {
        Bool(bool),
        Int(i64),
    }

    Ok(match Option::<Flag>::deserialize(deserializer)? {
        Some(Flag::Bool(value)) => value,
        Some(Flag::Int(value)) => value != 0,
        None => false,
    })
}

/// Per-subject metadata.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SubjectInfo {
    /// The subject never shows up as a tree node.
    pub hide_in_hierarchy: bool,
}

/// Immutable snapshot of the subject/model forest.
#[derive(Debug, Default)]
pub struct SubjectsInfo {
    subject_children: HashMap<NodeId, BTreeSet<NodeId>>,
    subject_models: HashMap<NodeId, BTreeSet<NodeId>>,
    subject_infos: HashMap<NodeId, SubjectInfo>,
    subject_parents: HashMap<NodeId, NodeId>,
    parent_subjects: OnceLock<BTreeSet<NodeId>>,
}

impl SubjectsInfo {
    fn from_rows(subjects: Vec<SubjectRow>, models: Vec<ModelRow>) -> Self {
        let mut info = Self::default();
        let mut targets: HashMap<NodeId, Vec<NodeId>> = HashMap::new();

        for subject in subjects {
            if let Some(parent_id) = subject.parent_id {
                info.subject_children
                    .entry(parent_id.clone())
                    .or_default()
                    .insert(subject.id.clone());
                info.subject_parents.insert(subject.id.clone(), parent_id);
            }
            if let Some(target) = subject.target_partition_id {
                targets.entry(target).or_default().push(subject.id.clone());
            }
            info.subject_infos.insert(
                subject.id,
                SubjectInfo {
                    hide_in_hierarchy: subject.hide_in_hierarchy,
                },
            );
        }

        for model in models {
            let owners = model
                .parent_id
                .into_iter()
                .chain(targets.get(&model.id).into_iter().flatten().cloned());
            for owner in owners {
                info.subject_models
                    .entry(owner)
                    .or_default()
                    .insert(model.id.clone());
            }
        }

        info
    }

    /// Returns the metadata of a subject, if it is known.
    pub fn subject_info(&self, subject_id: &NodeId) -> Option<SubjectInfo> {
        self.subject_infos.get(subject_id).copied()
    }

    /// Returns the number of known subjects.
    pub fn subject_count(&self) -> usize {
        self.subject_infos.len()
    }

    fn is_hidden(&self, subject_id: &NodeId) -> bool {
        self.subject_info(subject_id)
            .is_some_and(|info| info.hide_in_hierarchy)
    }

    fn children(&self, subject_id: &NodeId) -> impl Iterator<Item = &NodeId> {
        self.subject_children.get(subject_id).into_iter().flatten()
    }

    fn models(&self, subject_id: &NodeId) -> impl Iterator<Item = &NodeId> {
        self.subject_models.get(subject_id).into_iter().flatten()
    }

    /// Nearest visible descendants of `parents`; hidden subjects are walked
    /// through, visible ones end the walk on their branch.
    pub fn child_subject_ids(&self, parents: &[NodeId]) -> BTreeSet<NodeId> {
        let mut result = BTreeSet::new();
        let mut visited = HashSet::new();
        let mut stack: Vec<&NodeId> = parents.iter().flat_map(|p| self.children(p)).collect();

        while let Some(subject) = stack.pop() {
            if !visited.insert(subject) {
                continue;
            }
            if self.is_hidden(subject) {
                stack.extend(self.children(subject));
            } else {
                result.insert(subject.clone());
            }
        }
        result
    }

    /// Models of `parents` and of every hidden subject reached below them
    /// before a visible one.
    pub fn subject_model_ids(&self, parents: &[NodeId]) -> BTreeSet<NodeId> {
        let mut result: BTreeSet<NodeId> = parents
            .iter()
            .flat_map(|p| self.models(p))
            .cloned()
            .collect();
        let mut visited = HashSet::new();
        let mut stack: Vec<&NodeId> = parents.iter().flat_map(|p| self.children(p)).collect();

        while let Some(subject) = stack.pop() {
            if !visited.insert(subject) || !self.is_hidden(subject) {
                continue;
            }
            result.extend(self.models(subject).cloned());
            stack.extend(self.children(subject));
        }
        result
    }

    /// Subjects with at least one model anywhere in their subtree.
    pub fn parent_subject_ids(&self) -> &BTreeSet<NodeId> {
        self.parent_subjects.get_or_init(|| {
            let mut result = BTreeSet::new();
            for (subject, models) in &self.subject_models {
                if models.is_empty() {
                    continue;
                }
                let mut current = Some(subject);
                while let Some(id) = current {
                    if !result.insert(id.clone()) {
                        break;
                    }
                    current = self.subject_parents.get(id);
                }
            }
            result
        })
    }

    /// Every model attached to `subject` or to any subject below it.
    pub fn subject_models_recursive(&self, subject: &NodeId) -> BTreeSet<NodeId> {
        let mut result = BTreeSet::new();
        let mut visited = HashSet::new();
        let mut stack = vec![subject];

        while let Some(current) = stack.pop() {
            if !visited.insert(current) {
                continue;
            }
            result.extend(self.models(current).cloned());
            stack.extend(self.children(current));
        }
        result
    }
}

/// Lazily built, single-flight index of subjects and their models.
///
/// The first request triggers the two loading queries; every concurrent or
/// later request shares that build until [`invalidate`](Self::invalidate).
///
/// # Example
///
/// ```ignore
/// let index = SubjectHierarchyIndex::new(executor);
/// let children = index.child_subject_ids(&[root_subject]).await?;
/// ```
pub struct SubjectHierarchyIndex {
    executor: Arc<dyn QueryExecutor>,
    snapshot: SingleFlightCache<(), Arc<SubjectsInfo>>,
}

impl SubjectHierarchyIndex {
    /// Creates an index over `executor`. Nothing is loaded until first use.
    pub fn new(executor: Arc<dyn QueryExecutor>) -> Self {
        Self {
            executor,
            snapshot: SingleFlightCache::new("subjects", &CacheConfig::default()),
        }
    }

    /// Returns the current snapshot, building it if necessary.
    pub async fn snapshot(&self) -> QueryResult<Arc<SubjectsInfo>> {
        let executor = Arc::clone(&self.executor);
        self.snapshot
            .get_or_start((), move || build(executor).boxed())
            .resolve()
            .await
    }

    /// See [`SubjectsInfo::child_subject_ids`].
    pub async fn child_subject_ids(&self, parents: &[NodeId]) -> QueryResult<Vec<NodeId>> {
        let info = self.snapshot().await?;
        Ok(info.child_subject_ids(parents).into_iter().collect())
    }

    /// See [`SubjectsInfo::subject_model_ids`].
    pub async fn subject_model_ids(&self, parents: &[NodeId]) -> QueryResult<Vec<NodeId>> {
        let info = self.snapshot().await?;
        Ok(info.subject_model_ids(parents).into_iter().collect())
    }

    /// See [`SubjectsInfo::parent_subject_ids`].
    pub async fn parent_subject_ids(&self) -> QueryResult<Vec<NodeId>> {
        let info = self.snapshot().await?;
        Ok(info.parent_subject_ids().iter().cloned().collect())
    }

    /// See [`SubjectsInfo::subject_models_recursive`].
    pub async fn subject_models_recursive(&self, subject: &NodeId) -> QueryResult<Vec<NodeId>> {
        let info = self.snapshot().await?;
        Ok(info.subject_models_recursive(subject).into_iter().collect())
    }

    /// Returns true if a snapshot is built or being built.
    pub fn is_loaded(&self) -> bool {
        self.snapshot.contains(&())
    }

    /// Drops the snapshot; the next request rebuilds it.
    pub fn invalidate(&self) {
        self.snapshot.clear();
    }
}

impl std::fmt::Debug for SubjectHierarchyIndex {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SubjectHierarchyIndex")
            .field("loaded", &self.is_loaded())
            .finish()
    }
}

#[instrument(level = "debug", skip_all)]
async fn build(executor: Arc<dyn QueryExecutor>) -> QueryResult<Arc<SubjectsInfo>> {
    let subjects = executor.execute(queries::subjects_query());
    let models = executor.execute(queries::models_query());
    let subjects = queries::decoded::<SubjectRow>(subjects, SUBJECTS).try_collect::<Vec<_>>();
    let models = queries::decoded::<ModelRow>(models, MODELS).try_collect::<Vec<_>>();
    let (subjects, models) = futures::try_join!(subjects, models)?;

    debug!(
        subjects = subjects.len(),
        models = models.len(),
        "loaded subject hierarchy"
    );
    Ok(Arc::new(SubjectsInfo::from_rows(subjects, models)))
}

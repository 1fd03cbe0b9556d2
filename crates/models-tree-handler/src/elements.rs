//! Element subtree resolution.
//!
//! [`RecursiveChildResolver`] answers "every element below X" questions. A miss
//! runs one recursive query for the whole closure below X and records the
//! direct children of *every* node it discovers, so later lookups anywhere in
//! that subtree are answered from memory without touching the store.

use std::collections::hash_map::Entry;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;

use futures::future::FutureExt;
use futures::stream::{self, StreamExt, TryStreamExt};
use models_tree_query::{IdStream, NodeId, QueryExecutor, QueryResult};
use parking_lot::Mutex;
use serde::Deserialize;
use tracing::{debug, instrument, trace};

use crate::cache::{replay, CacheStats, SingleFlightCache};
use crate::queries::{self, ELEMENT_CHILDREN};

type ChildMap = HashMap<NodeId, Arc<HashSet<NodeId>>>;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ChildRow {
    id: NodeId,
    #[serde(default)]
    parent_id: Option<NodeId>,
}

#[derive(Default)]
struct ResolverState {
    generation: u64,
    children: Arc<ChildMap>,
}

/// Resolves and caches element descendant closures.
///
/// Concurrent misses for the same root share a single query; once the pass is
/// recorded only the child map answers for it. A pass that fails or is
/// abandoned writes nothing; a pass that finishes after
/// [`invalidate`](Self::invalidate) still answers its callers but is not
/// recorded.
pub struct RecursiveChildResolver {
    executor: Arc<dyn QueryExecutor>,
    state: Arc<Mutex<ResolverState>>,
    passes: SingleFlightCache<NodeId, Arc<Vec<NodeId>>>,
}

impl RecursiveChildResolver {
    /// Creates a resolver over `executor`.
    pub fn new(executor: Arc<dyn QueryExecutor>) -> Self {
        Self {
            executor,
            state: Arc::new(Mutex::new(ResolverState::default())),
            passes: SingleFlightCache::in_flight("element-children"),
        }
    }

    /// Returns every descendant of `root`, excluding `root` itself.
    ///
    /// The stream is lazy and unordered. When `root`'s children are known, the
    /// subtree is replayed breadth-first from memory.
    pub fn resolve_children(&self, root: &NodeId) -> IdStream {
        let (generation, children) = {
            let state = self.state.lock();
            (state.generation, Arc::clone(&state.children))
        };

        if let Some(direct) = children.get(root) {
            trace!(root = %root, "element children cache hit");
            let direct = Arc::clone(direct);
            return stream::iter(CachedDescendants::new(children, &direct))
                .map(Ok)
                .boxed();
        }

        let lookup = self.passes.get_or_start(root.clone(), || {
            run_pass(
                Arc::clone(&self.executor),
                Arc::clone(&self.state),
                root.clone(),
                generation,
            )
            .boxed()
        });
        stream::once(lookup.resolve())
            .map_ok(replay)
            .try_flatten()
            .boxed()
    }

    /// Returns true if the direct children of `element` are cached.
    pub fn is_cached(&self, element: &NodeId) -> bool {
        self.state.lock().children.contains_key(element)
    }

    /// Returns the number of elements with cached children.
    pub fn cached_nodes(&self) -> usize {
        self.state.lock().children.len()
    }

    /// Returns statistics of the in-flight passes.
    pub fn stats(&self) -> CacheStats {
        self.passes.stats()
    }

    /// Forgets every cached subtree.
    pub fn invalidate(&self) {
        {
            let mut state = self.state.lock();
            state.generation += 1;
            state.children = Arc::default();
        }
        self.passes.clear();
    }
}

impl std::fmt::Debug for RecursiveChildResolver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RecursiveChildResolver")
            .field("cached_nodes", &self.cached_nodes())
            .field("passes", &self.passes)
            .finish()
    }
}

#[instrument(level = "debug", skip(executor, state))]
async fn run_pass(
    executor: Arc<dyn QueryExecutor>,
    state: Arc<Mutex<ResolverState>>,
    root: NodeId,
    generation: u64,
) -> QueryResult<Arc<Vec<NodeId>>> {
    let rows = executor.execute(queries::element_children_query(&root));
    let rows: Vec<ChildRow> = queries::decoded(rows, ELEMENT_CHILDREN)
        .try_collect()
        .await?;

    let mut subset: HashMap<NodeId, HashSet<NodeId>> = HashMap::new();
    let mut ids = Vec::with_capacity(rows.len());
    let mut seen = HashSet::with_capacity(rows.len());
    for row in rows {
        if let Some(parent_id) = row.parent_id {
            subset.entry(parent_id).or_default().insert(row.id.clone());
        }
        if seen.insert(row.id.clone()) {
            ids.push(row.id);
        }
    }
    // Leaves get an explicit empty entry.
    for id in &ids {
        subset.entry(id.clone()).or_default();
    }
    if subset.is_empty() {
        subset.insert(root.clone(), HashSet::new());
    }

    let mut state = state.lock();
    if state.generation == generation {
        let nodes = subset.len();
        merge(Arc::make_mut(&mut state.children), subset);
        debug!(root = %root, descendants = ids.len(), nodes, "cached element subtree");
    } else {
        debug!(root = %root, "cache invalidated during pass; result not recorded");
    }
    Ok(Arc::new(ids))
}

fn merge(children: &mut ChildMap, subset: HashMap<NodeId, HashSet<NodeId>>) {
    for (parent, found) in subset {
        match children.entry(parent) {
            Entry::Vacant(entry) => {
                entry.insert(Arc::new(found));
            }
            Entry::Occupied(mut entry) => {
                let known: &HashSet<NodeId> = entry.get();
                if !found.is_subset(known) {
                    let mut union = known.clone();
                    union.extend(found);
                    entry.insert(Arc::new(union));
                }
            }
        }
    }
}

/// Breadth-first walk over a snapshot of cached children.
struct CachedDescendants {
    children: Arc<ChildMap>,
    queue: VecDeque<NodeId>,
    visited: HashSet<NodeId>,
}

impl CachedDescendants {
    fn new(children: Arc<ChildMap>, direct: &HashSet<NodeId>) -> Self {
        Self {
            children,
            queue: direct.iter().cloned().collect(),
            visited: direct.iter().cloned().collect(),
        }
    }
}

impl Iterator for CachedDescendants {
    type Item = NodeId;

    fn next(&mut self) -> Option<NodeId> {
        let id = self.queue.pop_front()?;
        if let Some(grandchildren) = self.children.get(&id) {
            for child in grandchildren.iter() {
                if self.visited.insert(child.clone()) {
                    self.queue.push_back(child.clone());
                }
            }
        }
        Some(id)
    }
}

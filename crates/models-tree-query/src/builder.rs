//! Statement assembly.
//!
//! Statements are assembled from raw text and named [`Fragment`]s. Every
//! fragment carries the bindings for its own placeholders, so positional
//! binding order always follows text order regardless of which optional
//! fragments are present. The name of each fragment is kept on the built
//! [`Query`], which lets executors and tests inspect what a statement filters
//! by without parsing its text.

use crate::binding::{bind_id, bind_ids, Binding, NamedBindings};
use crate::id::NodeId;

/// A named piece of statement text together with its positional bindings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Fragment {
    name: String,
    text: String,
    bindings: Vec<Binding>,
}

impl Fragment {
    /// Creates a fragment whose text and bindings are produced by `build`.
    pub fn new<F>(name: impl Into<String>, build: F) -> Self
    where
        F: FnOnce(&mut Vec<Binding>) -> String,
    {
        let mut bindings = Vec::new();
        let text = build(&mut bindings);
        Self {
            name: name.into(),
            text,
            bindings,
        }
    }

    /// `column = ?` fragment.
    pub fn id(name: impl Into<String>, column: &str, id: &NodeId) -> Self {
        Self::new(name, |bindings| bind_id(column, id, bindings))
    }

    /// `column IN (...)` or `InVirtualSet(?, column)` fragment.
    pub fn ids<I>(name: impl Into<String>, column: &str, ids: I) -> Self
    where
        I: IntoIterator<Item = NodeId>,
    {
        Self::new(name, |bindings| bind_ids(column, ids, bindings))
    }

    /// Fragment without bindings.
    pub fn raw(name: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            text: text.into(),
            bindings: Vec::new(),
        }
    }

    /// Returns the fragment name.
    pub fn name(&self) -> &str {
        &self.name
    }
}

/// Bindings contributed by one named fragment of a [`Query`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Clause {
    /// Fragment name.
    pub name: String,
    /// Positional bindings of the fragment, in text order.
    pub bindings: Vec<Binding>,
}

/// A fully assembled, parametrized statement.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Query {
    name: String,
    ctes: Vec<String>,
    text: String,
    bindings: Vec<Binding>,
    named_bindings: NamedBindings,
    clauses: Vec<Clause>,
}

impl Query {
    /// Stable query name, e.g. `models-tree/subjects`.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Common table expressions to prepend to the statement.
    pub fn ctes(&self) -> &[String] {
        &self.ctes
    }

    /// Statement text without the CTEs.
    pub fn text(&self) -> &str {
        &self.text
    }

    /// Positional bindings, in placeholder order.
    pub fn bindings(&self) -> &[Binding] {
        &self.bindings
    }

    /// Named bindings.
    pub fn named_bindings(&self) -> &NamedBindings {
        &self.named_bindings
    }

    /// Named fragments in text order.
    pub fn clauses(&self) -> &[Clause] {
        &self.clauses
    }

    /// Gets the named fragment, if it is part of the statement.
    pub fn clause(&self, name: &str) -> Option<&Clause> {
        self.clauses.iter().find(|clause| clause.name == name)
    }

    /// Returns true if the statement contains the named fragment.
    pub fn has_clause(&self, name: &str) -> bool {
        self.clause(name).is_some()
    }

    /// Ids bound by the named fragment (empty if the fragment is absent).
    pub fn clause_ids(&self, name: &str) -> Vec<NodeId> {
        self.clause(name)
            .map(|clause| clause.bindings.iter().flat_map(Binding::ids).collect())
            .unwrap_or_default()
    }

    /// Gets a named binding.
    pub fn named_binding(&self, name: &str) -> Option<&Binding> {
        self.named_bindings.get(name)
    }

    /// Full statement text including the `WITH RECURSIVE` prefix.
    pub fn full_text(&self) -> String {
        if self.ctes.is_empty() {
            return self.text.clone();
        }
        format!("WITH RECURSIVE\n{}\n{}", self.ctes.join(",\n"), self.text)
    }

    /// Counts `?` placeholders outside single-quoted literals.
    pub fn placeholder_count(&self) -> usize {
        let mut in_literal = false;
        let mut count = 0;
        for ch in self.full_text().chars() {
            match ch {
                '\'' => in_literal = !in_literal,
                '?' if !in_literal => count += 1,
                _ => {}
            }
        }
        count
    }
}

/// Builder for [`Query`].
///
/// # Example
///
/// ```rust
/// use models_tree_query::{Fragment, NodeId, QueryBuilder};
///
/// let model = NodeId::from("0x10");
/// let query = QueryBuilder::new("elements")
///     .push("SELECT ECInstanceId FROM bis.GeometricElement3d")
///     .filter([
///         Fragment::id("model", "Model.Id", &model),
///         Fragment::raw("roots", "Parent IS NULL"),
///     ])
///     .build();
///
/// assert_eq!(
///     query.text(),
///     "SELECT ECInstanceId FROM bis.GeometricElement3d WHERE Model.Id = ? AND Parent IS NULL"
/// );
/// assert_eq!(query.placeholder_count(), query.bindings().len());
/// ```
#[derive(Debug, Clone, Default)]
pub struct QueryBuilder {
    name: String,
    ctes: Vec<String>,
    text: String,
    bindings: Vec<Binding>,
    named_bindings: NamedBindings,
    clauses: Vec<Clause>,
}

impl QueryBuilder {
    /// Creates a builder for a query with the given name.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    /// Adds a common table expression. CTEs must not carry positional bindings.
    pub fn cte(mut self, cte: impl Into<String>) -> Self {
        self.ctes.push(cte.into());
        self
    }

    /// Adds several common table expressions.
    pub fn ctes<I, S>(mut self, ctes: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.ctes.extend(ctes.into_iter().map(Into::into));
        self
    }

    /// Appends raw text.
    pub fn push(mut self, text: &str) -> Self {
        self.text.push_str(text);
        self
    }

    /// Appends a named fragment.
    pub fn fragment(mut self, fragment: Fragment) -> Self {
        self.text.push_str(&fragment.text);
        self.record(fragment.name, fragment.bindings);
        self
    }

    /// Appends text that references named (`:name`) bindings.
    pub fn named<F>(mut self, build: F) -> Self
    where
        F: FnOnce(&mut NamedBindings) -> String,
    {
        let text = build(&mut self.named_bindings);
        self.text.push_str(&text);
        self
    }

    /// Appends ` WHERE a AND b ...`; appends nothing when there are no predicates.
    pub fn filter<I>(self, predicates: I) -> Self
    where
        I: IntoIterator<Item = Fragment>,
    {
        self.join(" WHERE ", " AND ", predicates)
    }

    /// Appends the sub-queries joined by ` UNION ALL `.
    pub fn union_all<I>(self, parts: I) -> Self
    where
        I: IntoIterator<Item = Fragment>,
    {
        self.join("", " UNION ALL ", parts)
    }

    /// Builds the query.
    pub fn build(self) -> Query {
        Query {
            name: self.name,
            ctes: self.ctes,
            text: self.text,
            bindings: self.bindings,
            named_bindings: self.named_bindings,
            clauses: self.clauses,
        }
    }

    fn join<I>(mut self, prefix: &str, separator: &str, fragments: I) -> Self
    where
        I: IntoIterator<Item = Fragment>,
    {
        for (idx, fragment) in fragments.into_iter().enumerate() {
            self.text.push_str(if idx == 0 { prefix } else { separator });
            self = self.fragment(fragment);
        }
        self
    }

    fn record(&mut self, name: String, bindings: Vec<Binding>) {
        self.bindings.extend(bindings.iter().cloned());
        self.clauses.push(Clause { name, bindings });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::binding::{bind_named, MAX_INLINE_IDS};

    fn id(s: &str) -> NodeId {
        NodeId::from(s)
    }

    #[test]
    fn test_filter_without_predicates_adds_nothing() {
        let query = QueryBuilder::new("q")
            .push("SELECT 1")
            .filter(Vec::new())
            .build();
        assert_eq!(query.text(), "SELECT 1");
        assert!(query.clauses().is_empty());
    }

    #[test]
    fn test_bindings_follow_text_order() {
        let query = QueryBuilder::new("q")
            .push("SELECT * FROM t")
            .filter([
                Fragment::id("model", "Model.Id", &id("0x1")),
                Fragment::ids("category", "Category.Id", [id("0x2"), id("0x3")]),
                Fragment::id("parent", "Parent.Id", &id("0x4")),
            ])
            .build();

        assert_eq!(
            query.text(),
            "SELECT * FROM t WHERE Model.Id = ? AND Category.Id IN (?, ?) AND Parent.Id = ?"
        );
        let bound: Vec<NodeId> = query.bindings().iter().flat_map(Binding::ids).collect();
        assert_eq!(bound, vec![id("0x1"), id("0x2"), id("0x3"), id("0x4")]);
        assert_eq!(query.placeholder_count(), query.bindings().len());
    }

    #[test]
    fn test_clause_lookup() {
        let query = QueryBuilder::new("q")
            .push("SELECT * FROM t")
            .filter([Fragment::ids("category", "Category.Id", [id("0x2"), id("0x3")])])
            .build();

        assert!(query.has_clause("category"));
        assert!(!query.has_clause("model"));
        assert_eq!(query.clause_ids("category"), vec![id("0x2"), id("0x3")]);
        assert!(query.clause_ids("model").is_empty());
    }

    #[test]
    fn test_union_all_skips_leading_separator() {
        let query = QueryBuilder::new("paths")
            .union_all([
                Fragment::ids("models", "m.Id", [id("0x1")]),
                Fragment::ids("subjects", "s.Id", [id("0x2")]),
            ])
            .build();
        assert_eq!(query.text(), "m.Id IN (?) UNION ALL s.Id IN (?)");
        assert_eq!(query.clauses().len(), 2);
    }

    #[test]
    fn test_virtual_set_counts_as_one_placeholder() {
        let ids: Vec<NodeId> = (0..MAX_INLINE_IDS)
            .map(|i| NodeId::new(format!("0x{i:x}")))
            .collect();
        let query = QueryBuilder::new("q")
            .push("SELECT * FROM t")
            .filter([Fragment::ids("ids", "id", ids)])
            .build();
        assert_eq!(query.placeholder_count(), 1);
        assert_eq!(query.bindings().len(), 1);
        assert_eq!(query.clause_ids("ids").len(), MAX_INLINE_IDS);
    }

    #[test]
    fn test_placeholders_inside_literals_are_ignored() {
        let query = QueryBuilder::new("q")
            .push("SELECT '?' AS mark FROM t")
            .filter([Fragment::id("x", "x", &id("0x1"))])
            .build();
        assert_eq!(query.placeholder_count(), 1);
    }

    #[test]
    fn test_ctes_and_named_bindings() {
        let query = QueryBuilder::new("children")
            .cte("Children(id) AS (SELECT 1)")
            .named(|named| bind_named("Parent.Id", &id("0x9"), "parentId", named))
            .build();
        assert!(query.full_text().starts_with("WITH RECURSIVE\nChildren(id)"));
        assert_eq!(query.named_binding("parentId"), Some(&Binding::Id(id("0x9"))));
        assert_eq!(query.placeholder_count(), 0);
    }
}

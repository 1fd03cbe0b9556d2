//! # models-tree-query
//!
//! Statement building, typed bindings and collaborator traits for the models
//! tree hierarchy query layer.
//!
//! The crate does not execute anything itself. It describes *what* to ask the
//! backing store ([`Query`], built with [`QueryBuilder`]) and defines the
//! capabilities the host must provide ([`QueryExecutor`],
//! [`ClassHierarchyInspector`], [`GroupedInstancesProvider`],
//! [`InstanceLabelSelector`]).
//!
//! ## Bindings
//!
//! | Value | Statement text | Bindings |
//! |-------|----------------|----------|
//! | single id | `col = ?` | one `Id` |
//! | fewer than [`MAX_INLINE_IDS`] ids | `col IN (?, ?, ...)` | one `Id` per entry |
//! | [`MAX_INLINE_IDS`] ids or more | `InVirtualSet(?, col)` | one `IdSet` |
//! | named id | `col = :name` | one named `Id` |
//!
//! ## Quick Start
//!
//! ```rust
//! use models_tree_query::{Fragment, NodeId, QueryBuilder};
//!
//! let query = QueryBuilder::new("models-tree/elements")
//!     .push("SELECT ECInstanceId id FROM bis.GeometricElement3d")
//!     .filter([Fragment::ids("category", "Category.Id", [NodeId::from("0x17")])])
//!     .build();
//!
//! assert_eq!(query.placeholder_count(), query.bindings().len());
//! ```

#![warn(missing_docs)]
#![warn(rustdoc::missing_crate_level_docs)]

mod binding;
mod builder;
mod error;
mod id;
mod limit;
mod row;
mod traits;

pub use binding::{bind_id, bind_ids, bind_named, Binding, NamedBindings, MAX_INLINE_IDS};
pub use builder::{Clause, Fragment, Query, QueryBuilder};
pub use error::{QueryError, QueryResult};
pub use id::{InstanceKey, NodeId};
pub use limit::LimitingQueryExecutor;
pub use row::Row;
pub use traits::{
    ClassHierarchyInspector, DefaultLabelSelector, GroupedInstancesProvider, IdStream,
    InstanceLabelSelector, QueryExecutor, RowStream,
};

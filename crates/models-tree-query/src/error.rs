//! Error types for hierarchy queries.

use std::fmt::Display;

use thiserror::Error;

/// Errors that can occur while querying the models hierarchy.
///
/// The type is `Clone` so a single failed computation can be handed to every
/// caller waiting on it.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum QueryError {
    /// The query executor rejected or failed to run a statement.
    #[error("Query failed: {0}")]
    QueryFailure(String),

    /// A hierarchy node lacks structural metadata required to resolve its children.
    #[error("Invalid hierarchy state: {0}")]
    InvalidHierarchyState(String),

    /// A query produced more rows than the configured ceiling.
    #[error("Result set too large: more than {limit} rows")]
    ResultSetTooLarge {
        /// Configured row limit.
        limit: usize,
    },

    /// A row could not be mapped into its typed form.
    #[error("Failed to decode row of query `{query}`: {message}")]
    Decode {
        /// Name of the query the row came from.
        query: String,
        /// Decoder message.
        message: String,
    },

    /// The class hierarchy inspector failed.
    #[error("Class hierarchy inspection failed: {0}")]
    ClassInspection(String),
}

impl QueryError {
    /// Creates a [`QueryError::QueryFailure`] from any displayable cause.
    pub fn query_failure(cause: impl Display) -> Self {
        Self::QueryFailure(cause.to_string())
    }

    /// Creates a [`QueryError::InvalidHierarchyState`] with the given message.
    pub fn invalid_state(message: impl Into<String>) -> Self {
        Self::InvalidHierarchyState(message.into())
    }

    /// Creates a [`QueryError::Decode`] for a row of the named query.
    pub fn decode(query: impl Into<String>, source: serde_json::Error) -> Self {
        Self::Decode {
            query: query.into(),
            message: source.to_string(),
        }
    }

    /// Returns true if this is a row-limit policy failure rather than a defect.
    pub fn is_result_set_too_large(&self) -> bool {
        matches!(self, Self::ResultSetTooLarge { .. })
    }
}

/// Result type for hierarchy query operations.
pub type QueryResult<T> = std::result::Result<T, QueryError>;

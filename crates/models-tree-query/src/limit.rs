//! Row-count ceiling for query results.

use futures::future;
use futures::stream::StreamExt;
use tracing::warn;

use crate::builder::Query;
use crate::error::QueryError;
use crate::traits::{QueryExecutor, RowStream};

/// Wraps an executor and fails any query that yields more than `limit` rows.
///
/// The first `limit` rows pass through untouched. If another row arrives, the
/// stream yields [`QueryError::ResultSetTooLarge`] and ends.
#[derive(Debug, Clone)]
pub struct LimitingQueryExecutor<E> {
    inner: E,
    limit: usize,
}

impl<E: QueryExecutor> LimitingQueryExecutor<E> {
    /// Wraps `inner` with the given row limit.
    pub fn new(inner: E, limit: usize) -> Self {
        Self { inner, limit }
    }

    /// Returns the configured row limit.
    pub fn limit(&self) -> usize {
        self.limit
    }
}

impl<E: QueryExecutor> QueryExecutor for LimitingQueryExecutor<E> {
    fn execute(&self, query: Query) -> RowStream {
        let limit = self.limit;
        let name = query.name().to_string();
        self.inner
            .execute(query)
            .scan((0usize, false), move |(seen, exceeded), row| {
                if *exceeded {
                    return future::ready(None);
                }
                let row = match row {
                    Ok(row) => {
                        *seen += 1;
                        if *seen > limit {
                            *exceeded = true;
                            warn!(query = %name, limit, "query exceeded row limit");
                            Err(QueryError::ResultSetTooLarge { limit })
                        } else {
                            Ok(row)
                        }
                    }
                    Err(err) => Err(err),
                };
                future::ready(Some(row))
            })
            .boxed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::builder::QueryBuilder;
    use crate::error::QueryResult;
    use crate::row::Row;
    use futures::stream;

    struct Rows(usize);

    impl QueryExecutor for Rows {
        fn execute(&self, _query: Query) -> RowStream {
            let rows: Vec<QueryResult<Row>> =
                (0..self.0).map(|i| Ok(Row::new().with("id", i))).collect();
            stream::iter(rows).boxed()
        }
    }

    fn query() -> Query {
        QueryBuilder::new("limited").push("SELECT id FROM t").build()
    }

    #[tokio::test]
    async fn test_under_limit_passes_through() {
        let executor = LimitingQueryExecutor::new(Rows(3), 3);
        let rows: Vec<_> = executor.execute(query()).collect().await;
        assert_eq!(rows.len(), 3);
        assert!(rows.iter().all(Result::is_ok));
    }

    #[tokio::test]
    async fn test_over_limit_fails_once_and_ends() {
        let executor = LimitingQueryExecutor::new(Rows(10), 4);
        let rows: Vec<_> = executor.execute(query()).collect().await;
        assert_eq!(rows.len(), 5);
        assert_eq!(
            rows.last().cloned(),
            Some(Err(QueryError::ResultSetTooLarge { limit: 4 }))
        );
    }
}

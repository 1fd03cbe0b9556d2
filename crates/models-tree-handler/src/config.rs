//! Configuration types for the query handler.

/// Configuration for the query handler.
///
/// # Example
///
/// ```rust
/// use models_tree_handler::{CacheConfig, HandlerConfig};
///
/// let config = HandlerConfig::builder()
///     .with_cache(CacheConfig { max_entries: Some(500) })
///     .with_max_results(10_000)
///     .build();
/// ```
#[derive(Debug, Clone, Default)]
pub struct HandlerConfig {
    /// Cache configuration.
    pub cache: CacheConfig,
    /// Row ceiling for element and path queries (None = unlimited).
    pub max_results: Option<usize>,
}

impl HandlerConfig {
    /// Creates a new builder for HandlerConfig.
    pub fn builder() -> HandlerConfigBuilder {
        HandlerConfigBuilder::default()
    }
}

/// Builder for HandlerConfig.
#[derive(Debug, Clone, Default)]
pub struct HandlerConfigBuilder {
    cache: CacheConfig,
    max_results: Option<usize>,
}

impl HandlerConfigBuilder {
    /// Sets the cache configuration.
    pub fn with_cache(mut self, cache: CacheConfig) -> Self {
        self.cache = cache;
        self
    }

    /// Sets the row ceiling for element and path queries.
    pub fn with_max_results(mut self, max_results: usize) -> Self {
        self.max_results = Some(max_results);
        self
    }

    /// Builds the HandlerConfig.
    pub fn build(self) -> HandlerConfig {
        HandlerConfig {
            cache: self.cache,
            max_results: self.max_results,
        }
    }
}

/// Configuration for the keyed result caches.
#[derive(Debug, Clone)]
pub struct CacheConfig {
    /// Maximum number of finished values per cache. `None` keeps every value
    /// until the cache is cleared.
    ///
    /// With a bound, the least recently used values beyond it are evicted and
    /// recomputed by their next caller, so repeated requests may query again.
    /// In-flight computations are never evicted.
    pub max_entries: Option<usize>,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self { max_entries: None }
    }
}

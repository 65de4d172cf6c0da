//! Server configuration.

use std::time::Duration;

use actionhost_client::PoolConfig;
use actionhost_common::{ActionError, Result};

use crate::resource_limits::ResourceLimits;

/// Bounds on the document cache.
///
/// Bundles untouched for `idle_ttl` are dropped; past `max_bundles` the least
/// recently used bundles go first.
#[derive(Debug, Clone, PartialEq)]
pub struct CacheConfig {
    pub max_bundles: usize,
    pub idle_ttl: Duration,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            max_bundles: 1024,
            idle_ttl: Duration::from_secs(3600),
        }
    }
}

/// Everything the dispatcher needs to know up front.
///
/// # Example
///
/// ```
/// use actionhost_server::{ResourceLimits, ServerConfig};
/// use std::time::Duration;
///
/// let config = ServerConfig::new()
///     .with_pool_size(4)
///     .with_limits(ResourceLimits::new().with_execution_timeout(Duration::from_secs(5)));
/// assert!(config.validate().is_ok());
/// assert_eq!(config.pool_config().pool_size, 4);
/// ```
#[derive(Debug, Clone, PartialEq)]
pub struct ServerConfig {
    /// Store connections available to one request
    pub pool_size: usize,
    /// Largest accepted request body
    pub max_body_bytes: usize,
    /// Stream chunks buffered ahead of a slow client
    pub stream_buffer: usize,
    pub limits: ResourceLimits,
    pub cache: CacheConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            pool_size: 10,
            max_body_bytes: 10 * 1024 * 1024,
            stream_buffer: 32,
            limits: ResourceLimits::default(),
            cache: CacheConfig::default(),
        }
    }
}

impl ServerConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_pool_size(mut self, pool_size: usize) -> Self {
        self.pool_size = pool_size;
        self
    }

    pub fn with_max_body_bytes(mut self, max: usize) -> Self {
        self.max_body_bytes = max;
        self
    }

    pub fn with_stream_buffer(mut self, chunks: usize) -> Self {
        self.stream_buffer = chunks;
        self
    }

    pub fn with_limits(mut self, limits: ResourceLimits) -> Self {
        self.limits = limits;
        self
    }

    pub fn with_cache(mut self, cache: CacheConfig) -> Self {
        self.cache = cache;
        self
    }

    /// Pool settings for one request, derived from the store-call deadline.
    pub fn pool_config(&self) -> PoolConfig {
        PoolConfig {
            pool_size: self.pool_size,
            acquire_timeout: self.limits.store_call_timeout,
            call_timeout: self.limits.store_call_timeout,
        }
    }

    pub fn validate(&self) -> Result<()> {
        self.limits.validate().map_err(ActionError::Config)?;

        if self.pool_size == 0 {
            return Err(ActionError::Config("pool size must be greater than zero".into()));
        }
        if self.stream_buffer == 0 {
            return Err(ActionError::Config("stream buffer must be greater than zero".into()));
        }
        if self.max_body_bytes == 0 {
            return Err(ActionError::Config("max body size must be greater than zero".into()));
        }
        if self.cache.max_bundles == 0 {
            return Err(ActionError::Config("cache must hold at least one bundle".into()));
        }
        Ok(())
    }
}

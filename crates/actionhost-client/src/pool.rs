use std::sync::Arc;
use std::time::Duration;

use actionhost_common::{ActionError, Credentials, Result, TenantId};
use futures::future::join_all;
use serde_json::Value;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

use crate::store::{DocumentStore, StoreRequest};

/// Store pool configuration.
///
/// # Default Configuration
///
/// - `pool_size`: 10
/// - `acquire_timeout`: 10 seconds
/// - `call_timeout`: 10 seconds
#[derive(Debug, Clone, PartialEq)]
pub struct PoolConfig {
    /// Concurrent store calls one request may have in flight
    pub pool_size: usize,
    /// Maximum wait for a free slot
    pub acquire_timeout: Duration,
    /// Deadline for a single store call
    pub call_timeout: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            pool_size: 10,
            acquire_timeout: Duration::from_secs(10),
            call_timeout: Duration::from_secs(10),
        }
    }
}

/// Per-request pool of store connections.
///
/// Every pool is bound to one tenant and one set of caller credentials, so
/// nothing issued through it can reach another tenant's database. Slots are
/// semaphore permits; a permit is held for the duration of one call and
/// returned on drop, whatever the call's outcome.
///
/// # Example
///
/// ```rust
/// use actionhost_client::{MemoryStore, PoolConfig, StorePool, StoreRequest};
/// use actionhost_common::{Credentials, TenantId};
/// use std::sync::Arc;
///
/// # #[tokio::main]
/// # async fn main() {
/// let store = Arc::new(MemoryStore::new());
/// let pool = StorePool::new(
///     store,
///     TenantId::new("db1").unwrap(),
///     Credentials::anonymous(),
///     PoolConfig::default(),
/// );
/// let info = pool.call(StoreRequest::get("").unwrap()).await.unwrap();
/// assert_eq!(info["db_name"], "db1");
/// assert_eq!(pool.available(), 10);
/// # }
/// ```
#[derive(Clone)]
pub struct StorePool {
    store: Arc<dyn DocumentStore>,
    tenant: TenantId,
    credentials: Credentials,
    semaphore: Arc<Semaphore>,
    config: PoolConfig,
}

impl StorePool {
    pub fn new(
        store: Arc<dyn DocumentStore>,
        tenant: TenantId,
        credentials: Credentials,
        config: PoolConfig,
    ) -> Self {
        Self {
            store,
            tenant,
            credentials,
            semaphore: Arc::new(Semaphore::new(config.pool_size)),
            config,
        }
    }

    pub fn tenant(&self) -> &TenantId {
        &self.tenant
    }

    pub fn pool_size(&self) -> usize {
        self.config.pool_size
    }

    /// Free slots right now.
    pub fn available(&self) -> usize {
        self.semaphore.available_permits()
    }

    /// Cancels pending and future acquisitions. Calls already running keep
    /// their permit until they finish.
    pub fn close(&self) {
        self.semaphore.close();
    }

    pub fn is_closed(&self) -> bool {
        self.semaphore.is_closed()
    }

    async fn acquire(&self) -> Result<OwnedSemaphorePermit> {
        match tokio::time::timeout(self.config.acquire_timeout, self.semaphore.clone().acquire_owned()).await {
            Ok(Ok(permit)) => Ok(permit),
            Ok(Err(_)) => Err(ActionError::Cancelled),
            Err(_) => Err(ActionError::Timeout(self.config.acquire_timeout)),
        }
    }

    /// Issues one request against the pool's tenant.
    pub async fn call(&self, request: StoreRequest) -> Result<Value> {
        let _permit = self.acquire().await?;

        tokio::time::timeout(
            self.config.call_timeout,
            self.store.request(&self.credentials, &self.tenant, request),
        )
        .await
        .map_err(|_| ActionError::Timeout(self.config.call_timeout))?
    }

    /// Issues every request concurrently and returns the results in order.
    ///
    /// At most `pool_size` of them are in flight at once.
    pub async fn all(&self, requests: Vec<StoreRequest>) -> Vec<Result<Value>> {
        join_all(requests.into_iter().map(|request| self.call(request))).await
    }
}

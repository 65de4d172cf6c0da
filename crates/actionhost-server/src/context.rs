//! Per-request dispatch state.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use actionhost_client::StorePool;
use serde_json::{json, Value};

use crate::response::ResponseChannel;
use crate::router::{DispatchTarget, RequestMethod};

/// Everything one request carries through resolution, compilation and
/// execution. Discarded once the response completes.
pub struct DispatchContext {
    pub method: RequestMethod,
    pub target: DispatchTarget,
    pub query: Value,
    pub body: Value,
    pub host: Option<String>,
    pub channel: Arc<ResponseChannel>,
    /// Store connections scoped to the tenant and the caller's credentials.
    pub pool: StorePool,
    cancelled: AtomicBool,
}

impl DispatchContext {
    pub fn new(
        method: RequestMethod,
        target: DispatchTarget,
        query: Value,
        body: Value,
        host: Option<String>,
        channel: Arc<ResponseChannel>,
        pool: StorePool,
    ) -> Self {
        Self {
            method,
            target,
            query,
            body,
            host,
            channel,
            pool,
            cancelled: AtomicBool::new(false),
        }
    }

    /// Marks the request abandoned and releases its store pool. Running
    /// store calls finish; every later suspension point fails.
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
        self.pool.close();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    /// The data half of the `request` object tenant code receives.
    pub fn request_data(&self) -> Value {
        json!({
            "method": self.method.as_str(),
            "tenant": self.target.tenant.as_str(),
            "bundle": self.target.bundle.to_string(),
            "action": self.target.action,
            "path": self.target.segments,
            "query": self.query,
            "body": self.body,
            "host": self.host,
        })
    }
}

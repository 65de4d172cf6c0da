//! Administrative forwarding.
//!
//! Requests under `/<tenant>/_admin_db/` are not run as tenant code. The
//! dispatcher identifies the caller through the store's session endpoint and
//! hands the request to an [`AdminHandler`].

use actionhost_common::{ActionError, Result, TenantId};
use async_trait::async_trait;
use serde_json::{Map, Value};

/// Receiver of administrative actions.
#[async_trait]
pub trait AdminHandler: Send + Sync {
    async fn process_admin_action(
        &self,
        action: &str,
        tenant: &TenantId,
        user_name: Option<&str>,
        roles: &[String],
        params: Value,
    ) -> Result<Value>;
}

/// Handler used when no administrative subsystem is configured.
#[derive(Debug, Default, Clone, Copy)]
pub struct DisabledAdmin;

#[async_trait]
impl AdminHandler for DisabledAdmin {
    async fn process_admin_action(
        &self,
        action: &str,
        _tenant: &TenantId,
        _user_name: Option<&str>,
        _roles: &[String],
        _params: Value,
    ) -> Result<Value> {
        Err(ActionError::BadRequest(format!(
            "administrative action {} is not available",
            action
        )))
    }
}

/// Admin parameters: the body's fields when it is a JSON object, overridden
/// by query parameters of the same name.
pub fn merge_params(query: Value, body: Value) -> Value {
    let mut params = match body {
        Value::Object(fields) => fields,
        _ => Map::new(),
    };
    if let Value::Object(query) = query {
        params.extend(query);
    }
    Value::Object(params)
}

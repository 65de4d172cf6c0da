use std::fmt;

use actionhost_common::{ActionError, Credentials, Result, Revision, TenantId};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Result of a conditional document fetch.
#[derive(Debug, Clone, PartialEq)]
pub enum FetchOutcome {
    /// The caller's known revision is still current.
    NotModified,
    NotFound,
    Document { revision: Revision, fields: Value },
}

/// Identity of the caller as reported by the store's session endpoint.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserContext {
    pub name: Option<String>,
    #[serde(default)]
    pub roles: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StoreMethod {
    Get,
    Post,
    Put,
    Delete,
    Head,
}

impl StoreMethod {
    /// Parses a method name case-insensitively.
    pub fn parse(name: &str) -> Result<Self> {
        match name.to_ascii_uppercase().as_str() {
            "GET" => Ok(StoreMethod::Get),
            "POST" => Ok(StoreMethod::Post),
            "PUT" => Ok(StoreMethod::Put),
            "DELETE" => Ok(StoreMethod::Delete),
            "HEAD" => Ok(StoreMethod::Head),
            other => Err(ActionError::Upstream(format!("unsupported store method {}", other))),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            StoreMethod::Get => "GET",
            StoreMethod::Post => "POST",
            StoreMethod::Put => "PUT",
            StoreMethod::Delete => "DELETE",
            StoreMethod::Head => "HEAD",
        }
    }
}

impl fmt::Display for StoreMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One pass-through operation against the tenant's database.
///
/// `path` is relative to the database and has already been checked by
/// [`StoreRequest::new`]; it can never name another database.
#[derive(Debug, Clone, PartialEq)]
pub struct StoreRequest {
    pub method: StoreMethod,
    path: String,
    pub body: Option<Value>,
    pub query: Vec<(String, String)>,
}

impl StoreRequest {
    pub fn new(method: StoreMethod, path: &str) -> Result<Self> {
        Ok(Self {
            method,
            path: validate_path(path)?,
            body: None,
            query: Vec::new(),
        })
    }

    pub fn get(path: &str) -> Result<Self> {
        Self::new(StoreMethod::Get, path)
    }

    pub fn with_body(mut self, body: Value) -> Self {
        self.body = Some(body);
        self
    }

    pub fn with_query(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.query.push((key.into(), value.into()));
        self
    }

    pub fn path(&self) -> &str {
        &self.path
    }
}

/// Normalizes a database-relative path and rejects anything that could walk
/// out of the database: dot segments (plain or percent-encoded), query or
/// fragment markers, backslashes and control characters. URL parsing drops
/// tab, CR and LF, so `".\t."` would otherwise turn into `..`.
pub fn validate_path(path: &str) -> Result<String> {
    let trimmed = path.trim_start_matches('/');
    if trimmed.contains(['?', '#', '\\']) || trimmed.chars().any(|c| c.is_control()) {
        return Err(ActionError::Upstream(format!("invalid store path {}", path)));
    }

    for segment in trimmed.split('/') {
        let decoded = segment.to_ascii_lowercase().replace("%2e", ".");
        if decoded == "." || decoded == ".." {
            return Err(ActionError::Upstream(format!("invalid store path {}", path)));
        }
    }

    Ok(trimmed.to_string())
}

/// The backing document store.
///
/// Credentials are handed over exactly as received; implementations forward
/// them and never interpret them.
#[async_trait]
pub trait DocumentStore: Send + Sync {
    /// Fetches `doc_id` unless `known` is still its current revision.
    async fn fetch_with_revision(
        &self,
        credentials: &Credentials,
        tenant: &TenantId,
        doc_id: &str,
        known: Option<&Revision>,
    ) -> Result<FetchOutcome>;

    async fn request(
        &self,
        credentials: &Credentials,
        tenant: &TenantId,
        request: StoreRequest,
    ) -> Result<Value>;

    async fn session(&self, credentials: &Credentials) -> Result<UserContext>;
}

//! Identifiers shared by the cache, the router and the store clients.
//!
//! Tenants and bundles are validated once, at the edge, so nothing further
//! down ever has to split or re-check strings.

use std::fmt;

use serde::{Deserialize, Serialize};

use super::error::{ActionError, Result};

/// Name of the bundle used when the path does not select one.
pub const DEFAULT_BUNDLE: &str = "datamanager";

/// A tenant (database) name.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TenantId(String);

impl TenantId {
    pub fn new(name: impl Into<String>) -> Result<Self> {
        let name = name.into();
        if name.is_empty() || name == "." || name == ".." || name.contains('/') {
            return Err(ActionError::BadRequest("bad url".into()));
        }
        Ok(Self(name))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TenantId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A code bundle selector, displayed as `design/<name>`.
///
/// Stores that follow the CouchDB convention keep the bundle in the design
/// document returned by [`BundleId::doc_id`].
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct BundleId {
    name: String,
}

impl BundleId {
    pub fn named(name: impl Into<String>) -> Result<Self> {
        let name = name.into();
        if name.is_empty() || name == "." || name == ".." || name.contains('/') {
            return Err(ActionError::BadRequest("bad url".into()));
        }
        Ok(Self { name })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Document id in the backing store (`_design/<name>`).
    pub fn doc_id(&self) -> String {
        format!("_design/{}", self.name)
    }
}

impl Default for BundleId {
    fn default() -> Self {
        Self {
            name: DEFAULT_BUNDLE.to_string(),
        }
    }
}

impl fmt::Display for BundleId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "design/{}", self.name)
    }
}

/// Cache key for one tenant bundle.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BundleKey {
    pub tenant: TenantId,
    pub bundle: BundleId,
}

impl BundleKey {
    pub fn new(tenant: TenantId, bundle: BundleId) -> Self {
        Self { tenant, bundle }
    }
}

impl fmt::Display for BundleKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.tenant, self.bundle)
    }
}

/// Opaque revision token of a stored document.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Revision(String);

impl Revision {
    pub fn new(token: impl Into<String>) -> Self {
        Self(token.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Revision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Caller credentials, carried verbatim from the inbound request headers.
///
/// They are never parsed here; the store decides what they mean.
#[derive(Clone, Default, PartialEq, Eq, Hash)]
pub struct Credentials {
    pub authorization: Option<String>,
    pub cookie: Option<String>,
}

impl Credentials {
    pub fn anonymous() -> Self {
        Self::default()
    }

    pub fn is_anonymous(&self) -> bool {
        self.authorization.is_none() && self.cookie.is_none()
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("authorization", &self.authorization.as_ref().map(|_| "<redacted>"))
            .field("cookie", &self.cookie.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

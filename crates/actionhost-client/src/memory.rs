//! In-process document store.
//!
//! Revisions follow the CouchDB `<seq>-<tag>` shape and bump on every write.
//! Fetch counters let callers observe how often a document was transferred
//! versus confirmed unchanged.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{PoisonError, RwLock};

use actionhost_common::{ActionError, Credentials, Result, Revision, TenantId};
use async_trait::async_trait;
use serde_json::{json, Map, Value};

use crate::store::{DocumentStore, FetchOutcome, StoreMethod, StoreRequest, UserContext};

#[derive(Debug, Clone)]
struct StoredDoc {
    seq: u64,
    body: Value,
}

impl StoredDoc {
    fn revision(&self) -> String {
        format!("{}-mem", self.seq)
    }

    fn with_meta(&self, id: &str) -> Value {
        let mut body = self.body.clone();
        if let Value::Object(map) = &mut body {
            map.insert("_id".into(), Value::String(id.to_string()));
            map.insert("_rev".into(), Value::String(self.revision()));
        }
        body
    }
}

#[derive(Default)]
struct MemoryInner {
    /// tenant -> doc id -> document
    databases: HashMap<String, BTreeMap<String, StoredDoc>>,
    /// authorization header -> session
    sessions: HashMap<String, UserContext>,
}

/// A [`DocumentStore`] kept entirely in memory.
#[derive(Default)]
pub struct MemoryStore {
    inner: RwLock<MemoryInner>,
    full_fetches: AtomicU64,
    not_modified: AtomicU64,
    requests: AtomicU64,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates or replaces a document, returning its new revision.
    pub fn put_document(&self, tenant: &str, doc_id: &str, body: Value) -> Revision {
        let mut inner = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        let docs = inner.databases.entry(tenant.to_string()).or_default();
        let seq = docs.get(doc_id).map(|d| d.seq + 1).unwrap_or(1);
        let doc = StoredDoc { seq, body: strip_meta(body) };
        let rev = doc.revision();
        docs.insert(doc_id.to_string(), doc);
        Revision::new(rev)
    }

    /// Stores a bundle document with the given libraries and actions.
    pub fn put_bundle(
        &self,
        tenant: &str,
        bundle: &str,
        libs: &[(&str, &str)],
        actions: &[(&str, &str)],
    ) -> Revision {
        let lib: Map<String, Value> = libs
            .iter()
            .map(|(k, v)| (k.to_string(), Value::String(v.to_string())))
            .collect();
        let action: Map<String, Value> = actions
            .iter()
            .map(|(k, v)| (k.to_string(), Value::String(v.to_string())))
            .collect();
        self.put_document(
            tenant,
            &format!("_design/{}", bundle),
            json!({"server": {"lib": lib, "action": action}}),
        )
    }

    pub fn document(&self, tenant: &str, doc_id: &str) -> Option<Value> {
        let inner = self.inner.read().unwrap_or_else(PoisonError::into_inner);
        inner
            .databases
            .get(tenant)
            .and_then(|docs| docs.get(doc_id))
            .map(|doc| doc.with_meta(doc_id))
    }

    /// Registers the session returned for requests carrying `authorization`.
    pub fn add_session(&self, authorization: &str, user: UserContext) {
        let mut inner = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        inner.sessions.insert(authorization.to_string(), user);
    }

    /// Fetches that transferred a document body.
    pub fn full_fetches(&self) -> u64 {
        self.full_fetches.load(Ordering::Relaxed)
    }

    /// Fetches answered with "not modified".
    pub fn not_modified_fetches(&self) -> u64 {
        self.not_modified.load(Ordering::Relaxed)
    }

    /// Pass-through requests issued by actions.
    pub fn request_count(&self) -> u64 {
        self.requests.load(Ordering::Relaxed)
    }

    fn delete(&self, tenant: &str, doc_id: &str, rev: Option<&str>) -> Result<Value> {
        let mut inner = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        let docs = inner
            .databases
            .get_mut(tenant)
            .ok_or_else(|| ActionError::Upstream("404 missing".into()))?;
        let current = docs
            .get(doc_id)
            .ok_or_else(|| ActionError::Upstream("404 missing".into()))?;
        if let Some(rev) = rev {
            if rev != current.revision() {
                return Err(ActionError::Upstream("409 Document update conflict.".into()));
            }
        }
        let revision = format!("{}-mem", current.seq + 1);
        docs.remove(doc_id);
        Ok(json!({"ok": true, "id": doc_id, "rev": revision}))
    }

    fn write(&self, tenant: &str, doc_id: &str, body: Value) -> Result<Value> {
        let expected = body.get("_rev").and_then(Value::as_str).map(str::to_string);
        if let Some(existing) = self.document(tenant, doc_id) {
            if expected.as_deref() != existing.get("_rev").and_then(Value::as_str) {
                return Err(ActionError::Upstream("409 Document update conflict.".into()));
            }
        }
        let rev = self.put_document(tenant, doc_id, body);
        Ok(json!({"ok": true, "id": doc_id, "rev": rev.as_str()}))
    }

    fn all_docs(&self, tenant: &str) -> Value {
        let inner = self.inner.read().unwrap_or_else(PoisonError::into_inner);
        let rows: Vec<Value> = inner
            .databases
            .get(tenant)
            .map(|docs| {
                docs.iter()
                    .map(|(id, doc)| json!({"id": id, "key": id, "value": {"rev": doc.revision()}}))
                    .collect()
            })
            .unwrap_or_default();
        json!({"total_rows": rows.len(), "offset": 0, "rows": rows})
    }
}

fn strip_meta(body: Value) -> Value {
    match body {
        Value::Object(mut map) => {
            map.remove("_id");
            map.remove("_rev");
            Value::Object(map)
        }
        other => other,
    }
}

#[async_trait]
impl DocumentStore for MemoryStore {
    async fn fetch_with_revision(
        &self,
        _credentials: &Credentials,
        tenant: &TenantId,
        doc_id: &str,
        known: Option<&Revision>,
    ) -> Result<FetchOutcome> {
        let Some(doc) = self.document(tenant.as_str(), doc_id) else {
            return Ok(FetchOutcome::NotFound);
        };

        let revision = doc
            .get("_rev")
            .and_then(Value::as_str)
            .map(Revision::new)
            .ok_or_else(|| ActionError::Upstream(format!("document {} has no revision", doc_id)))?;

        if known == Some(&revision) {
            self.not_modified.fetch_add(1, Ordering::Relaxed);
            return Ok(FetchOutcome::NotModified);
        }

        self.full_fetches.fetch_add(1, Ordering::Relaxed);
        Ok(FetchOutcome::Document { revision, fields: doc })
    }

    async fn request(
        &self,
        _credentials: &Credentials,
        tenant: &TenantId,
        request: StoreRequest,
    ) -> Result<Value> {
        self.requests.fetch_add(1, Ordering::Relaxed);
        let tenant = tenant.as_str();
        let path = request.path().to_string();

        match (request.method, path.as_str()) {
            (StoreMethod::Get, "") => Ok(json!({"db_name": tenant})),
            (StoreMethod::Get, "_all_docs") => Ok(self.all_docs(tenant)),
            (StoreMethod::Get, id) => self
                .document(tenant, id)
                .ok_or_else(|| ActionError::Upstream("404 missing".into())),
            (StoreMethod::Put, id) if !id.is_empty() => {
                self.write(tenant, id, request.body.unwrap_or_else(|| json!({})))
            }
            (StoreMethod::Post, "") => {
                let body = request.body.unwrap_or_else(|| json!({}));
                let id = body
                    .get("_id")
                    .and_then(Value::as_str)
                    .map(str::to_string)
                    .unwrap_or_else(|| format!("doc-{}", self.requests.load(Ordering::Relaxed)));
                self.write(tenant, &id, body)
            }
            (StoreMethod::Delete, id) if !id.is_empty() => {
                let rev = request
                    .query
                    .iter()
                    .find(|(k, _)| k == "rev")
                    .map(|(_, v)| v.as_str());
                self.delete(tenant, id, rev)
            }
            (method, other) => Err(ActionError::Upstream(format!(
                "unsupported operation {} {}",
                method, other
            ))),
        }
    }

    async fn session(&self, credentials: &Credentials) -> Result<UserContext> {
        let inner = self.inner.read().unwrap_or_else(PoisonError::into_inner);
        match &credentials.authorization {
            Some(auth) => inner
                .sessions
                .get(auth)
                .cloned()
                .ok_or_else(|| ActionError::Upstream("401 Name or password is incorrect.".into())),
            None => Ok(UserContext::default()),
        }
    }
}

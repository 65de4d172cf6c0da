//! Tenant bundles.
//!
//! A [`TenantBundle`] is one generation of a tenant's code: the revision it
//! was fetched at, its library and action sources, and the compiled units
//! produced from those sources. Sources never change after construction; a
//! newer revision produces a new bundle with empty caches.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock};

use actionhost_common::{BundleId, BundleKey, Revision, TenantId};
use serde_json::Value;

static NEXT_GENERATION: AtomicU64 = AtomicU64::new(1);

/// Cache key of a compiled action.
///
/// `method` is `None` when the unit was compiled from the method-agnostic
/// source (`list` rather than `list.get`).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ScriptKey {
    pub tenant: TenantId,
    pub bundle: BundleId,
    pub action: String,
    pub method: Option<String>,
}

impl ScriptKey {
    /// Name of the source entry this key was compiled from.
    pub fn source_name(&self) -> String {
        match &self.method {
            Some(method) => format!("{}.{}", self.action, method),
            None => self.action.clone(),
        }
    }
}

impl fmt::Display for ScriptKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.tenant, self.bundle, self.source_name())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnitKind {
    Action,
    Library,
}

/// A syntax-checked unit ready to be instantiated in a sandbox.
///
/// The unit holds the wrapped function source; each sandbox evaluates it to
/// obtain a fresh function object bound to that sandbox's realm.
#[derive(Debug)]
pub struct CompiledUnit {
    pub(crate) name: String,
    pub(crate) kind: UnitKind,
    pub(crate) generation: u64,
    pub(crate) wrapped: String,
}

impl CompiledUnit {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kind(&self) -> UnitKind {
        self.kind
    }

    /// Generation of the bundle this unit was compiled from.
    pub fn generation(&self) -> u64 {
        self.generation
    }
}

/// One generation of a tenant's code bundle.
pub struct TenantBundle {
    key: BundleKey,
    revision: Revision,
    generation: u64,
    libs: HashMap<String, Arc<str>>,
    actions: HashMap<String, Arc<str>>,
    pub(crate) scripts: RwLock<HashMap<ScriptKey, Arc<CompiledUnit>>>,
    pub(crate) libraries: RwLock<HashMap<String, Arc<CompiledUnit>>>,
    pub(crate) compiles: AtomicU64,
}

impl TenantBundle {
    /// Builds a bundle from the stored document.
    ///
    /// Sources live under `server.lib` and `server.action`. A document
    /// without a `server` section is an empty bundle. Entries whose value is
    /// not a string are skipped.
    pub fn from_document(key: BundleKey, revision: Revision, fields: &Value) -> Self {
        let server = fields.get("server");
        let libs = collect_sources(&key, "lib", server.and_then(|s| s.get("lib")));
        let actions = collect_sources(&key, "action", server.and_then(|s| s.get("action")));

        let generation = NEXT_GENERATION.fetch_add(1, Ordering::Relaxed);
        tracing::debug!(
            "bundle {} at revision {} is generation {} ({} libs, {} actions)",
            key,
            revision,
            generation,
            libs.len(),
            actions.len()
        );

        Self {
            key,
            revision,
            generation,
            libs,
            actions,
            scripts: RwLock::new(HashMap::new()),
            libraries: RwLock::new(HashMap::new()),
            compiles: AtomicU64::new(0),
        }
    }

    pub fn key(&self) -> &BundleKey {
        &self.key
    }

    pub fn tenant(&self) -> &TenantId {
        &self.key.tenant
    }

    pub fn revision(&self) -> &Revision {
        &self.revision
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Selects the source for `action` called with `method`.
    ///
    /// `<action>.<method>` (method lower-cased) wins over plain `<action>`.
    pub fn action_source(&self, action: &str, method: &str) -> Option<(ScriptKey, Arc<str>)> {
        let method = method.to_ascii_lowercase();
        let specific = format!("{}.{}", action, method);

        let (method, source) = match self.actions.get(&specific) {
            Some(source) => (Some(method), source),
            None => (None, self.actions.get(action)?),
        };

        let key = ScriptKey {
            tenant: self.key.tenant.clone(),
            bundle: self.key.bundle.clone(),
            action: action.to_string(),
            method,
        };
        Some((key, Arc::clone(source)))
    }

    pub fn library_source(&self, name: &str) -> Option<Arc<str>> {
        self.libs.get(name).cloned()
    }

    pub fn library_names(&self) -> impl Iterator<Item = &str> {
        self.libs.keys().map(String::as_str)
    }

    pub fn action_names(&self) -> impl Iterator<Item = &str> {
        self.actions.keys().map(String::as_str)
    }

    /// Compilations performed against this generation so far.
    pub fn compile_count(&self) -> u64 {
        self.compiles.load(Ordering::Relaxed)
    }

    pub fn cached_script(&self, key: &ScriptKey) -> Option<Arc<CompiledUnit>> {
        self.scripts
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(key)
            .cloned()
    }

    pub fn cached_library(&self, name: &str) -> Option<Arc<CompiledUnit>> {
        self.libraries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(name)
            .cloned()
    }
}

impl fmt::Debug for TenantBundle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TenantBundle")
            .field("key", &self.key)
            .field("revision", &self.revision)
            .field("generation", &self.generation)
            .field("libs", &self.libs.len())
            .field("actions", &self.actions.len())
            .finish()
    }
}

fn collect_sources(key: &BundleKey, section: &str, value: Option<&Value>) -> HashMap<String, Arc<str>> {
    let Some(Value::Object(entries)) = value else {
        return HashMap::new();
    };

    entries
        .iter()
        .filter_map(|(name, source)| match source.as_str() {
            Some(text) => Some((name.clone(), Arc::from(text))),
            None => {
                tracing::warn!("bundle {}: skipping non-string {} entry {}", key, section, name);
                None
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn key() -> BundleKey {
        BundleKey::new(TenantId::new("db1").unwrap(), BundleId::default())
    }

    fn bundle(fields: Value) -> TenantBundle {
        TenantBundle::from_document(key(), Revision::new("1-a"), &fields)
    }

    #[test]
    fn test_method_specific_source_wins() {
        let b = bundle(json!({"server": {"action": {"list": "generic", "list.get": "specific"}}}));

        let (key, source) = b.action_source("list", "GET").unwrap();
        assert_eq!(&*source, "specific");
        assert_eq!(key.method.as_deref(), Some("get"));
        assert_eq!(key.source_name(), "list.get");

        let (key, source) = b.action_source("list", "POST").unwrap();
        assert_eq!(&*source, "generic");
        assert_eq!(key.method, None);
    }

    #[test]
    fn test_unknown_action() {
        let b = bundle(json!({"server": {"action": {"list.post": "x"}}}));
        assert!(b.action_source("list", "GET").is_none());
        assert!(b.action_source("other", "GET").is_none());
    }

    #[test]
    fn test_document_without_server_is_empty() {
        let b = bundle(json!({"_id": "_design/datamanager", "views": {}}));
        assert_eq!(b.action_names().count(), 0);
        assert_eq!(b.library_names().count(), 0);
    }

    #[test]
    fn test_non_string_entries_skipped() {
        let b = bundle(json!({"server": {"lib": {"ok": "exports.a = 1", "bad": {"nested": true}}}}));
        assert!(b.library_source("ok").is_some());
        assert!(b.library_source("bad").is_none());
    }

    #[test]
    fn test_generations_are_distinct() {
        let a = bundle(json!({}));
        let b = bundle(json!({}));
        assert_ne!(a.generation(), b.generation());
        assert_eq!(a.compile_count(), 0);
    }

    #[test]
    fn test_script_key_display() {
        let b = bundle(json!({"server": {"action": {"list.get": "x"}}}));
        let (key, _) = b.action_source("list", "get").unwrap();
        assert_eq!(key.to_string(), "db1/design/datamanager/list.get");
    }
}

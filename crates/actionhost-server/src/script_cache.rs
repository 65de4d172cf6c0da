//! Script cache and compiler.
//!
//! Action and library sources are wrapped into function expressions whose
//! parameters are the only names tenant code can bind to:
//!
//! - actions: `store, request, log, require, Buffer`
//! - libraries: `exports, module, log, require, Buffer`
//!
//! Compilation parses the wrapped source once per bundle generation. Only
//! successful compilations are cached; a failing source is parsed again on
//! the next request.

use std::collections::hash_map::Entry;
use std::sync::atomic::Ordering;
use std::sync::{Arc, PoisonError};

use actionhost_common::{ActionError, Result};
use boa_engine::{Context, Script, Source};

use crate::bundle::{CompiledUnit, TenantBundle, UnitKind};

pub const ACTION_PARAMS: &str = "store, request, log, require, Buffer";
pub const LIBRARY_PARAMS: &str = "exports, module, log, require, Buffer";

/// Wraps `source` as the body of a function expression taking `params`.
pub fn wrap(params: &str, source: &str) -> String {
    format!("(function ({}) {{\n{}\n}})", params, source)
}

/// Parses the wrapped form of `source` without running it.
pub fn compile(
    name: &str,
    kind: UnitKind,
    generation: u64,
    source: &str,
    ctx: &mut Context,
) -> Result<CompiledUnit> {
    let params = match kind {
        UnitKind::Action => ACTION_PARAMS,
        UnitKind::Library => LIBRARY_PARAMS,
    };
    let wrapped = wrap(params, source);

    Script::parse(Source::from_bytes(wrapped.as_bytes()), None, ctx)
        .map_err(|e| ActionError::Compile(format!("{}: {}", name, e)))?;

    Ok(CompiledUnit {
        name: name.to_string(),
        kind,
        generation,
        wrapped,
    })
}

impl TenantBundle {
    /// Returns the compiled unit for `action` called with `method`, compiling
    /// and caching it on first use within this generation.
    pub fn compile_action(
        &self,
        action: &str,
        method: &str,
        ctx: &mut Context,
    ) -> Result<Arc<CompiledUnit>> {
        let (key, source) = self
            .action_source(action, method)
            .ok_or_else(|| ActionError::UnknownAction(action.to_string()))?;

        if let Some(unit) = self.cached_script(&key) {
            tracing::debug!("script cache hit for {}", key);
            return Ok(unit);
        }

        tracing::debug!("compiling {} (generation {})", key, self.generation());
        self.compiles.fetch_add(1, Ordering::Relaxed);
        let unit = Arc::new(compile(
            &key.source_name(),
            UnitKind::Action,
            self.generation(),
            &source,
            ctx,
        )?);

        Ok(insert_or_existing(
            self.scripts.write().unwrap_or_else(PoisonError::into_inner).entry(key),
            unit,
        ))
    }

    /// Returns the compiled unit for library `name`, or `None` when the
    /// bundle has no such library.
    pub fn compile_library(&self, name: &str, ctx: &mut Context) -> Result<Option<Arc<CompiledUnit>>> {
        let Some(source) = self.library_source(name) else {
            return Ok(None);
        };

        if let Some(unit) = self.cached_library(name) {
            return Ok(Some(unit));
        }

        tracing::debug!("compiling library {} (generation {})", name, self.generation());
        self.compiles.fetch_add(1, Ordering::Relaxed);
        let unit = Arc::new(compile(name, UnitKind::Library, self.generation(), &source, ctx)?);

        Ok(Some(insert_or_existing(
            self.libraries
                .write()
                .unwrap_or_else(PoisonError::into_inner)
                .entry(name.to_string()),
            unit,
        )))
    }
}

/// Double-checked insert: a unit cached by a concurrent compile wins.
fn insert_or_existing<K>(entry: Entry<'_, K, Arc<CompiledUnit>>, unit: Arc<CompiledUnit>) -> Arc<CompiledUnit> {
    match entry {
        Entry::Occupied(existing) => Arc::clone(existing.get()),
        Entry::Vacant(slot) => Arc::clone(slot.insert(unit)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use actionhost_common::{BundleId, BundleKey, Revision, TenantId};
    use serde_json::json;

    fn bundle(actions: serde_json::Value, libs: serde_json::Value) -> TenantBundle {
        TenantBundle::from_document(
            BundleKey::new(TenantId::new("db1").unwrap(), BundleId::default()),
            Revision::new("1-a"),
            &json!({"server": {"action": actions, "lib": libs}}),
        )
    }

    #[test]
    fn test_wrap_shape() {
        assert_eq!(wrap("a, b", "return a;"), "(function (a, b) {\nreturn a;\n})");
    }

    #[test]
    fn test_compile_once_per_generation() {
        let b = bundle(json!({"hello": "request.sendResult('hi');"}), json!({}));
        let mut ctx = Context::default();

        let first = b.compile_action("hello", "GET", &mut ctx).unwrap();
        let second = b.compile_action("hello", "GET", &mut ctx).unwrap();

        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(b.compile_count(), 1);
        assert_eq!(first.generation(), b.generation());
        assert_eq!(first.kind(), UnitKind::Action);
    }

    #[test]
    fn test_method_variants_cached_separately() {
        let b = bundle(json!({"list": "1;", "list.post": "2;"}), json!({}));
        let mut ctx = Context::default();

        let get = b.compile_action("list", "GET", &mut ctx).unwrap();
        let post = b.compile_action("list", "POST", &mut ctx).unwrap();
        assert_eq!(get.name(), "list");
        assert_eq!(post.name(), "list.post");
        assert_eq!(b.compile_count(), 2);
    }

    #[test]
    fn test_compile_error_not_cached() {
        let b = bundle(json!({"broken": "function ("}), json!({}));
        let mut ctx = Context::default();

        let err = b.compile_action("broken", "GET", &mut ctx).unwrap_err();
        assert!(matches!(err, ActionError::Compile(_)));
        assert!(b.compile_action("broken", "GET", &mut ctx).is_err());
        assert_eq!(b.compile_count(), 2);
        assert!(b.scripts.read().unwrap().is_empty());
    }

    #[test]
    fn test_unknown_action() {
        let b = bundle(json!({}), json!({}));
        let err = b.compile_action("missing", "GET", &mut Context::default()).unwrap_err();
        assert!(matches!(err, ActionError::UnknownAction(ref a) if a == "missing"));
    }

    #[test]
    fn test_library_compile() {
        let b = bundle(json!({}), json!({"util": "exports.x = 1;"}));
        let mut ctx = Context::default();

        let unit = b.compile_library("util", &mut ctx).unwrap().unwrap();
        assert_eq!(unit.kind(), UnitKind::Library);
        assert!(b.compile_library("missing", &mut ctx).unwrap().is_none());

        let again = b.compile_library("util", &mut ctx).unwrap().unwrap();
        assert!(Arc::ptr_eq(&unit, &again));
        assert_eq!(b.compile_count(), 1);
    }

    #[test]
    fn test_top_level_return_is_allowed() {
        let b = bundle(json!({"early": "if (true) { return; }"}), json!({}));
        assert!(b.compile_action("early", "GET", &mut Context::default()).is_ok());
    }
}

//! Module resolver.
//!
//! One resolver exists per sandbox, so the module table is never shared
//! between requests. Compiled library units are shared through the bundle;
//! their execution and the resulting exports belong to this request only.
//!
//! Each library moves through
//!
//! ```text
//! (absent) -> InProgress -> Done(exports)
//!                        -> Failed(error)
//! ```
//!
//! A `require` that finds its target `InProgress` is a cycle. A `Failed`
//! entry rethrows the original error for the rest of the request, so a
//! library that threw is never reported as cyclic later.

use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::sync::Arc;

use actionhost_common::ActionError;
use boa_engine::{js_string, object::JsObject, Context, JsError, JsNativeError, JsResult, JsValue, Source};

use crate::bundle::TenantBundle;

enum ModuleState {
    InProgress,
    Done(JsValue),
    Failed(JsError),
}

/// Values handed to every library besides its own `exports` and `module`.
#[derive(Clone)]
pub(crate) struct LibraryCapabilities {
    pub log: JsValue,
    pub require: JsValue,
    pub buffer: JsValue,
}

pub(crate) struct ModuleResolver {
    bundle: Arc<TenantBundle>,
    modules: RefCell<HashMap<String, ModuleState>>,
    capabilities: RefCell<Option<LibraryCapabilities>>,
    cycle: RefCell<Option<String>>,
    compile_failure: RefCell<Option<ActionError>>,
    executions: Cell<usize>,
}

impl ModuleResolver {
    pub fn new(bundle: Arc<TenantBundle>) -> Self {
        Self {
            bundle,
            modules: RefCell::new(HashMap::new()),
            capabilities: RefCell::new(None),
            cycle: RefCell::new(None),
            compile_failure: RefCell::new(None),
            executions: Cell::new(0),
        }
    }

    /// Installs the values libraries receive. The `require` among them is
    /// bound to this resolver, so it can only be set after construction.
    pub fn set_capabilities(&self, capabilities: LibraryCapabilities) {
        *self.capabilities.borrow_mut() = Some(capabilities);
    }

    /// First library found in a cycle during this request, if any.
    pub fn cycle(&self) -> Option<String> {
        self.cycle.borrow().clone()
    }

    /// Takes the recorded library compile failure if `message` is the error
    /// it was thrown as.
    pub fn take_compile_failure(&self, message: &str) -> Option<ActionError> {
        let mut failure = self.compile_failure.borrow_mut();
        match failure.as_ref() {
            Some(err) if message.contains(&err.to_string()) => failure.take(),
            _ => None,
        }
    }

    /// Library sources executed so far.
    pub fn executions(&self) -> usize {
        self.executions.get()
    }

    pub fn require(&self, name: &str, ctx: &mut Context) -> JsResult<JsValue> {
        match self.modules.borrow().get(name) {
            Some(ModuleState::Done(exports)) => return Ok(exports.clone()),
            Some(ModuleState::Failed(err)) => return Err(err.clone()),
            Some(ModuleState::InProgress) => {
                tracing::debug!("cyclic require of library {}", name);
                self.cycle.borrow_mut().get_or_insert_with(|| name.to_string());
                return Err(JsNativeError::error()
                    .with_message(cycle_message(name))
                    .into());
            }
            None => {}
        }

        self.modules
            .borrow_mut()
            .insert(name.to_string(), ModuleState::InProgress);

        let result = self.execute(name, ctx);
        let state = match &result {
            Ok(exports) => ModuleState::Done(exports.clone()),
            Err(err) => {
                tracing::debug!("library {} failed: {}", name, err);
                ModuleState::Failed(err.clone())
            }
        };
        self.modules.borrow_mut().insert(name.to_string(), state);
        result
    }

    fn execute(&self, name: &str, ctx: &mut Context) -> JsResult<JsValue> {
        let unit = match self.bundle.compile_library(name, ctx) {
            Ok(Some(unit)) => unit,
            Ok(None) => {
                tracing::debug!("library {} not in bundle, resolving to empty exports", name);
                return Ok(JsObject::with_object_proto(ctx.intrinsics()).into());
            }
            Err(e) => {
                let thrown: JsError = JsNativeError::syntax().with_message(e.to_string()).into();
                *self.compile_failure.borrow_mut() = Some(e);
                return Err(thrown);
            }
        };

        let capabilities = self
            .capabilities
            .borrow()
            .clone()
            .ok_or_else(|| JsNativeError::error().with_message("library capabilities not installed"))?;

        self.executions.set(self.executions.get() + 1);
        tracing::debug!("executing library {} (generation {})", name, unit.generation());

        let function = ctx.eval(Source::from_bytes(unit.wrapped.as_bytes()))?;
        let function = function
            .as_object()
            .map(|o| o.clone())
            .filter(|o| o.is_callable())
            .ok_or_else(|| JsNativeError::typ().with_message(format!("library {} did not compile to a function", name)))?;

        let exports = JsObject::with_object_proto(ctx.intrinsics());
        let module = JsObject::with_object_proto(ctx.intrinsics());
        module.set(js_string!("exports"), exports.clone(), false, ctx)?;

        function.call(
            &JsValue::undefined(),
            &[
                exports.into(),
                module.clone().into(),
                capabilities.log,
                capabilities.require,
                capabilities.buffer,
            ],
            ctx,
        )?;

        module.get(js_string!("exports"), ctx)
    }

    /// Drops every JS value held by the resolver. The `require` function
    /// refers back to the resolver, so this must run before the sandbox's
    /// context goes away.
    pub fn clear(&self) {
        self.modules.borrow_mut().clear();
        self.capabilities.borrow_mut().take();
    }
}

pub(crate) fn cycle_message(name: &str) -> String {
    format!("cyclic dependency while resolving library {}", name)
}

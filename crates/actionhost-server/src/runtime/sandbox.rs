use std::cell::RefCell;
use std::rc::Rc;
use std::sync::Arc;

use actionhost_common::{ActionError, Result};
use boa_engine::builtins::promise::{OperationType, PromiseState};
use boa_engine::context::HostHooks;
use boa_engine::object::builtins::JsPromise;
use boa_engine::object::JsObject;
use boa_engine::{Context, JsError, JsNativeError, JsResult, JsValue, Source};
use tokio::runtime::Handle;

use crate::bundle::{CompiledUnit, TenantBundle};
use crate::context::DispatchContext;
use crate::resource_limits::ResourceLimits;
use crate::response::DispatchState;
use crate::runtime::bindings::{self, StoreFailures};
use crate::runtime::resolver::{cycle_message, ModuleResolver};

/// Promises rejected with no handler attached, in rejection order.
///
/// An async action that throws after its first `await` has nobody left to
/// catch the error; it only shows up here.
#[derive(Default)]
struct RejectionTracker {
    unhandled: RefCell<Vec<JsObject>>,
}

impl RejectionTracker {
    /// Reason of the first rejection still unhandled once the job queue drained.
    fn first_unhandled(&self) -> Option<JsValue> {
        self.unhandled.borrow().iter().find_map(|promise| {
            match JsPromise::from_object(promise.clone()).ok()?.state() {
                PromiseState::Rejected(reason) => Some(reason),
                _ => None,
            }
        })
    }

    fn clear(&self) {
        self.unhandled.borrow_mut().clear();
    }
}

impl HostHooks for RejectionTracker {
    fn promise_rejection_tracker(&self, promise: &JsObject, operation: OperationType, _context: &mut Context) {
        let mut unhandled = self.unhandled.borrow_mut();
        match operation {
            OperationType::Reject => unhandled.push(promise.clone()),
            OperationType::Handle => unhandled.retain(|p| !JsObject::equals(p, promise)),
        }
    }
}

/// Runs one action in a fresh Boa context.
///
/// A context is created per dispatch and dropped with it, so nothing an
/// action leaves on the global object is visible to any other request.
/// `run` blocks: call it from a blocking thread, with `handle` pointing at
/// the runtime that owns the store pool.
pub struct Sandbox {
    limits: ResourceLimits,
    handle: Handle,
}

impl Sandbox {
    pub fn new(limits: ResourceLimits, handle: Handle) -> Self {
        Self { limits, handle }
    }

    fn new_context(&self, rejections: Rc<RejectionTracker>) -> Result<Context> {
        let mut ctx = Context::builder()
            .host_hooks(rejections)
            .build()
            .map_err(|e| ActionError::Runtime(format!("failed to create script context: {}", e)))?;
        let limits = ctx.runtime_limits_mut();
        limits.set_loop_iteration_limit(self.limits.loop_iteration_limit);
        limits.set_recursion_limit(self.limits.recursion_limit);
        Ok(ctx)
    }

    /// Compiles (or reuses) the dispatch's action and runs it.
    ///
    /// Responses go out through the dispatch's channel as the action makes
    /// them. The returned error is the one the caller still has to report;
    /// the channel decides whether a response already went out.
    pub fn run(&self, bundle: Arc<TenantBundle>, dispatch: Arc<DispatchContext>) -> Result<()> {
        let channel = Arc::clone(&dispatch.channel);
        channel.advance(DispatchState::Compiling)?;

        let rejections = Rc::new(RejectionTracker::default());
        let mut ctx = self.new_context(Rc::clone(&rejections))?;
        let unit = bundle.compile_action(&dispatch.target.action, dispatch.method.as_str(), &mut ctx)?;

        channel.advance(DispatchState::Executing)?;
        tracing::info!("run action {}", unit.name());

        let resolver = Rc::new(ModuleResolver::new(Arc::clone(&bundle)));
        let failures = Rc::new(StoreFailures::default());

        let outcome = self
            .execute(&unit, &dispatch, &resolver, &failures, &rejections, &mut ctx)
            .map_err(|err| classify(&err, &dispatch, &resolver, &failures, &mut ctx));

        tracing::debug!(
            "action {} executed {} libraries",
            unit.name(),
            resolver.executions()
        );
        resolver.clear();
        rejections.clear();

        outcome?;
        channel.finish()
    }

    fn execute(
        &self,
        unit: &CompiledUnit,
        dispatch: &Arc<DispatchContext>,
        resolver: &Rc<ModuleResolver>,
        failures: &Rc<StoreFailures>,
        rejections: &RejectionTracker,
        ctx: &mut Context,
    ) -> JsResult<()> {
        let capabilities = bindings::install(
            ctx,
            Arc::clone(dispatch),
            self.handle.clone(),
            Rc::clone(resolver),
            Rc::clone(failures),
        )?;
        resolver.set_capabilities(capabilities.library());

        let function = ctx.eval(Source::from_bytes(unit.wrapped.as_bytes()))?;
        let function = function
            .as_object()
            .map(|o| o.clone())
            .filter(|o| o.is_callable())
            .ok_or_else(|| JsNativeError::typ().with_message(format!("{} did not compile to a function", unit.name())))?;

        function.call(&JsValue::undefined(), &capabilities.action_args(), ctx)?;

        // promise continuations may still respond
        ctx.run_jobs()?;

        match rejections.first_unhandled() {
            Some(reason) => Err(JsError::from_opaque(reason)),
            None => Ok(()),
        }
    }
}

/// Human-readable form of a thrown value.
fn describe(err: &JsError, ctx: &mut Context) -> String {
    if let Ok(native) = err.try_native(ctx) {
        return native.to_string();
    }
    err.as_opaque()
        .and_then(|value| value.to_string(ctx).ok())
        .map(|s| s.to_std_string_escaped())
        .unwrap_or_else(|| err.to_string())
}

/// Maps an uncaught JS error onto the request error taxonomy.
fn classify(
    err: &JsError,
    dispatch: &DispatchContext,
    resolver: &ModuleResolver,
    failures: &StoreFailures,
    ctx: &mut Context,
) -> ActionError {
    if dispatch.is_cancelled() {
        return ActionError::Cancelled;
    }

    let message = describe(err, ctx);
    if let Some(name) = resolver.cycle() {
        if message.contains(&cycle_message(&name)) {
            return ActionError::CyclicDependency(name);
        }
    }
    if let Some(compile_err) = resolver.take_compile_failure(&message) {
        return compile_err;
    }
    if let Some(store_err) = failures.take_matching(&message) {
        return store_err;
    }
    ActionError::Runtime(message)
}

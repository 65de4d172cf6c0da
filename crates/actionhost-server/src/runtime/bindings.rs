//! Capabilities handed to tenant code.
//!
//! Nothing here is installed on the global object. Each value is passed as
//! an argument to the wrapped action or library function:
//!
//! - `store`: `get`, `put`, `post`, `remove`, `view`, `request`, `all`
//! - `request`: request data plus `sendResult`, `sendError`, `startStream`,
//!   `sendChunk`, `endStream`, `sendFile`
//! - `log(...args)`
//! - `require(name)`
//! - `Buffer`: `from`, `alloc`, `toString`
//!
//! Store calls block the sandbox thread on the dispatcher's runtime handle.
//! The per-request pool bounds them and applies the store-call deadline.

use std::cell::RefCell;
use std::fmt;
use std::rc::Rc;
use std::sync::Arc;

use actionhost_client::{StoreMethod, StoreRequest};
use actionhost_common::{ActionError, StreamHead};
use boa_engine::{
    js_string,
    native_function::NativeFunction,
    object::{builtins::JsUint8Array, FunctionObjectBuilder, JsObject, ObjectInitializer},
    Context, JsArgs, JsError, JsNativeError, JsResult, JsValue,
};
use boa_gc::{Finalize, Trace};
use hyper::body::Bytes;
use serde_json::{json, Value};
use tokio::runtime::Handle;

use crate::context::DispatchContext;
use crate::runtime::conversions::{js_value_to_json, json_to_js_value};
use crate::runtime::resolver::{LibraryCapabilities, ModuleResolver};

/// Largest byte array `Buffer` or `sendChunk` will build.
pub const MAX_BUFFER_BYTES: u64 = 64 * 1024 * 1024;

/// Query parameters a view expects as JSON text.
const JSON_VIEW_PARAMS: &[&str] = &["key", "keys", "startkey", "endkey", "start_key", "end_key"];

/// Last store failure thrown into the sandbox, kept so an uncaught one can be
/// reported as an upstream error rather than a script error.
#[derive(Default)]
pub(crate) struct StoreFailures {
    last: RefCell<Option<ActionError>>,
}

impl StoreFailures {
    fn record(&self, err: ActionError) -> JsError {
        let thrown = js_error(&err);
        *self.last.borrow_mut() = Some(err);
        thrown
    }

    /// Takes the recorded failure if `message` is the error it was thrown as.
    pub fn take_matching(&self, message: &str) -> Option<ActionError> {
        let mut last = self.last.borrow_mut();
        match last.as_ref() {
            Some(err) if message.contains(&err.to_string()) => last.take(),
            _ => None,
        }
    }
}

#[derive(Clone, Trace, Finalize)]
struct Host {
    #[unsafe_ignore_trace]
    dispatch: Arc<DispatchContext>,
    #[unsafe_ignore_trace]
    handle: Handle,
    #[unsafe_ignore_trace]
    failures: Rc<StoreFailures>,
}

impl Host {
    fn check_cancelled(&self) -> JsResult<()> {
        if self.dispatch.is_cancelled() {
            return Err(js_error(&ActionError::Cancelled));
        }
        Ok(())
    }

    fn store_call(&self, request: actionhost_common::Result<StoreRequest>, ctx: &mut Context) -> JsResult<JsValue> {
        self.check_cancelled()?;
        let request = request.map_err(|e| self.failures.record(e))?;
        tracing::debug!("store {} {}", request.method, request.path());

        let pool = self.dispatch.pool.clone();
        match self.handle.block_on(async move { pool.call(request).await }) {
            Ok(value) => json_to_js_value(value, ctx).map_err(|e| js_error(&e)),
            Err(err) => Err(self.failures.record(err)),
        }
    }
}

#[derive(Trace, Finalize)]
struct Resolver {
    #[unsafe_ignore_trace]
    resolver: Rc<ModuleResolver>,
}

/// The values an action function is called with.
pub(crate) struct Capabilities {
    pub store: JsValue,
    pub request: JsValue,
    pub log: JsValue,
    pub require: JsValue,
    pub buffer: JsValue,
}

impl Capabilities {
    /// Arguments in the order of the action wrapper's parameters.
    pub fn action_args(&self) -> [JsValue; 5] {
        [
            self.store.clone(),
            self.request.clone(),
            self.log.clone(),
            self.require.clone(),
            self.buffer.clone(),
        ]
    }

    pub fn library(&self) -> LibraryCapabilities {
        LibraryCapabilities {
            log: self.log.clone(),
            require: self.require.clone(),
            buffer: self.buffer.clone(),
        }
    }
}

type HostFn = fn(&JsValue, &[JsValue], &Host, &mut Context) -> JsResult<JsValue>;

fn js_error(err: &dyn fmt::Display) -> JsError {
    JsNativeError::error().with_message(err.to_string()).into()
}

fn host_function(ctx: &mut Context, name: &str, length: usize, f: HostFn, host: &Host) -> JsValue {
    FunctionObjectBuilder::new(
        ctx.realm(),
        NativeFunction::from_copy_closure_with_captures(f, host.clone()),
    )
    .name(js_string!(name))
    .length(length)
    .build()
    .into()
}

fn attach(target: &JsObject, functions: &[(&str, usize, HostFn)], host: &Host, ctx: &mut Context) -> JsResult<()> {
    for &(name, length, f) in functions {
        let function = host_function(ctx, name, length, f, host);
        target.set(js_string!(name), function, false, ctx)?;
    }
    Ok(())
}

/// Builds the capability values for one dispatch.
pub(crate) fn install(
    ctx: &mut Context,
    dispatch: Arc<DispatchContext>,
    handle: Handle,
    resolver: Rc<ModuleResolver>,
    failures: Rc<StoreFailures>,
) -> JsResult<Capabilities> {
    let request_data = dispatch.request_data();
    let host = Host {
        dispatch,
        handle,
        failures,
    };

    let store = JsObject::with_object_proto(ctx.intrinsics());
    attach(
        &store,
        &[
            ("get", 1, store_get as HostFn),
            ("put", 1, store_put as HostFn),
            ("post", 1, store_post as HostFn),
            ("remove", 2, store_remove as HostFn),
            ("view", 3, store_view as HostFn),
            ("request", 4, store_request as HostFn),
            ("all", 1, store_all as HostFn),
        ],
        &host,
        ctx,
    )?;

    let request = json_to_js_value(request_data, ctx)
        .map_err(|e| js_error(&e))?
        .as_object()
        .map(|o| o.clone())
        .ok_or_else(|| JsNativeError::typ().with_message("request data is not an object"))?;
    attach(
        &request,
        &[
            ("sendResult", 1, send_result as HostFn),
            ("sendError", 1, send_error as HostFn),
            ("startStream", 1, start_stream as HostFn),
            ("sendChunk", 1, send_chunk as HostFn),
            ("endStream", 0, end_stream as HostFn),
            ("sendFile", 2, send_file as HostFn),
        ],
        &host,
        ctx,
    )?;

    let log = host_function(ctx, "log", 0, tenant_log, &host);

    let require = FunctionObjectBuilder::new(
        ctx.realm(),
        NativeFunction::from_copy_closure_with_captures(require_library, Resolver { resolver }),
    )
    .name(js_string!("require"))
    .length(1)
    .build();

    let buffer = ObjectInitializer::new(ctx)
        .function(NativeFunction::from_fn_ptr(buffer_from), js_string!("from"), 1)
        .function(NativeFunction::from_fn_ptr(buffer_alloc), js_string!("alloc"), 1)
        .function(NativeFunction::from_fn_ptr(buffer_to_string), js_string!("toString"), 1)
        .build();

    Ok(Capabilities {
        store: store.into(),
        request: request.into(),
        log,
        require: require.into(),
        buffer: buffer.into(),
    })
}

// ---------------------------------------------------------------------------
// argument helpers
// ---------------------------------------------------------------------------

fn string_arg(args: &[JsValue], index: usize, what: &str, ctx: &mut Context) -> JsResult<String> {
    let value = args.get_or_undefined(index);
    if !value.is_string() {
        return Err(JsNativeError::typ()
            .with_message(format!("{} must be a string", what))
            .into());
    }
    Ok(value.to_string(ctx)?.to_std_string_escaped())
}

fn json_arg(args: &[JsValue], index: usize, ctx: &mut Context) -> JsResult<Value> {
    js_value_to_json(args.get_or_undefined(index).clone(), ctx).map_err(|e| js_error(&e))
}

/// Bytes of a string (UTF-8), an array of numbers, or a typed array.
fn bytes_of(value: &JsValue, ctx: &mut Context) -> JsResult<Vec<u8>> {
    if value.is_string() {
        return Ok(value.to_string(ctx)?.to_std_string_escaped().into_bytes());
    }

    let Some(object) = value.as_object().map(|o| o.clone()) else {
        return Err(JsNativeError::typ()
            .with_message("expected a string or a byte array")
            .into());
    };

    let length = object.get(js_string!("length"), ctx)?.to_length(ctx)?;
    if length > MAX_BUFFER_BYTES {
        return Err(JsNativeError::range()
            .with_message(format!("byte array larger than {} bytes", MAX_BUFFER_BYTES))
            .into());
    }

    let length = length as usize;
    let mut bytes = Vec::with_capacity(length);
    for i in 0..length {
        bytes.push(object.get(i, ctx)?.to_uint8(ctx)?);
    }
    Ok(bytes)
}

/// Query pairs from a parameter object. Strings go through as-is unless
/// listed in `json_keys`; everything else is sent as JSON text.
fn query_pairs(params: &Value, json_keys: &[&str]) -> Vec<(String, String)> {
    let Value::Object(params) = params else {
        return Vec::new();
    };

    params
        .iter()
        .map(|(key, value)| {
            let text = match value {
                Value::String(s) if !json_keys.contains(&key.as_str()) => s.clone(),
                other => other.to_string(),
            };
            (key.clone(), text)
        })
        .collect()
}

/// Builds a store request from `{method, path, body, query}`.
fn request_from_descriptor(descriptor: &Value) -> actionhost_common::Result<StoreRequest> {
    let method = StoreMethod::parse(descriptor.get("method").and_then(Value::as_str).unwrap_or("GET"))?;
    let path = descriptor
        .get("path")
        .and_then(Value::as_str)
        .ok_or_else(|| ActionError::Upstream("store request without a path".into()))?;

    let mut request = StoreRequest::new(method, path)?;
    if let Some(body) = descriptor.get("body").filter(|b| !b.is_null()) {
        request = request.with_body(body.clone());
    }
    for (key, value) in query_pairs(descriptor.get("query").unwrap_or(&Value::Null), &[]) {
        request = request.with_query(key, value);
    }
    Ok(request)
}

// ---------------------------------------------------------------------------
// store
// ---------------------------------------------------------------------------

fn store_get(_this: &JsValue, args: &[JsValue], host: &Host, ctx: &mut Context) -> JsResult<JsValue> {
    let id = string_arg(args, 0, "store.get: document id", ctx)?;
    host.store_call(StoreRequest::get(&id), ctx)
}

fn store_put(_this: &JsValue, args: &[JsValue], host: &Host, ctx: &mut Context) -> JsResult<JsValue> {
    let doc = json_arg(args, 0, ctx)?;
    let Some(id) = doc.get("_id").and_then(Value::as_str).map(str::to_string) else {
        return Err(JsNativeError::typ()
            .with_message("store.put: document needs an _id")
            .into());
    };
    host.store_call(
        StoreRequest::new(StoreMethod::Put, &id).map(|r| r.with_body(doc)),
        ctx,
    )
}

fn store_post(_this: &JsValue, args: &[JsValue], host: &Host, ctx: &mut Context) -> JsResult<JsValue> {
    let doc = json_arg(args, 0, ctx)?;
    host.store_call(StoreRequest::new(StoreMethod::Post, "").map(|r| r.with_body(doc)), ctx)
}

fn store_remove(_this: &JsValue, args: &[JsValue], host: &Host, ctx: &mut Context) -> JsResult<JsValue> {
    let id = string_arg(args, 0, "store.remove: document id", ctx)?;
    let rev = if args.get_or_undefined(1).is_undefined() {
        None
    } else {
        Some(string_arg(args, 1, "store.remove: revision", ctx)?)
    };

    let request = StoreRequest::new(StoreMethod::Delete, &id).map(|r| match rev {
        Some(rev) => r.with_query("rev", rev),
        None => r,
    });
    host.store_call(request, ctx)
}

fn store_view(_this: &JsValue, args: &[JsValue], host: &Host, ctx: &mut Context) -> JsResult<JsValue> {
    let design = string_arg(args, 0, "store.view: design name", ctx)?;
    let view = string_arg(args, 1, "store.view: view name", ctx)?;
    let params = json_arg(args, 2, ctx)?;

    let path = format!("_design/{}/_view/{}", design, view);
    let request = StoreRequest::get(&path).map(|r| {
        query_pairs(&params, JSON_VIEW_PARAMS)
            .into_iter()
            .fold(r, |r, (key, value)| r.with_query(key, value))
    });
    host.store_call(request, ctx)
}

fn store_request(_this: &JsValue, args: &[JsValue], host: &Host, ctx: &mut Context) -> JsResult<JsValue> {
    let method = string_arg(args, 0, "store.request: method", ctx)?;
    let path = string_arg(args, 1, "store.request: path", ctx)?;
    let body = json_arg(args, 2, ctx)?;
    let query = json_arg(args, 3, ctx)?;

    let descriptor = json!({"method": method, "path": path, "body": body, "query": query});
    host.store_call(request_from_descriptor(&descriptor), ctx)
}

fn store_all(_this: &JsValue, args: &[JsValue], host: &Host, ctx: &mut Context) -> JsResult<JsValue> {
    host.check_cancelled()?;
    let Value::Array(descriptors) = json_arg(args, 0, ctx)? else {
        return Err(JsNativeError::typ()
            .with_message("store.all: expected an array of requests")
            .into());
    };

    let requests = descriptors
        .iter()
        .map(request_from_descriptor)
        .collect::<actionhost_common::Result<Vec<_>>>()
        .map_err(|e| host.failures.record(e))?;
    tracing::debug!("store batch of {} requests", requests.len());

    let pool = host.dispatch.pool.clone();
    let results = host.handle.block_on(async move { pool.all(requests).await });

    let mut values = Vec::with_capacity(results.len());
    for result in results {
        values.push(result.map_err(|e| host.failures.record(e))?);
    }
    json_to_js_value(Value::Array(values), ctx).map_err(|e| js_error(&e))
}

// ---------------------------------------------------------------------------
// request
// ---------------------------------------------------------------------------

fn send_result(_this: &JsValue, args: &[JsValue], host: &Host, ctx: &mut Context) -> JsResult<JsValue> {
    host.check_cancelled()?;
    let payload = json_arg(args, 0, ctx)?;
    host.dispatch.channel.send_result(payload).map_err(|e| js_error(&e))?;
    Ok(JsValue::undefined())
}

fn send_error(_this: &JsValue, args: &[JsValue], host: &Host, ctx: &mut Context) -> JsResult<JsValue> {
    host.check_cancelled()?;
    let payload = json_arg(args, 0, ctx)?;
    host.dispatch.channel.send_error(payload).map_err(|e| js_error(&e))?;
    Ok(JsValue::undefined())
}

fn filename_arg(args: &[JsValue], index: usize, ctx: &mut Context) -> JsResult<String> {
    if args.get_or_undefined(index).is_undefined() {
        return Ok("download".to_string());
    }
    string_arg(args, index, "filename", ctx)
}

fn start_stream(_this: &JsValue, args: &[JsValue], host: &Host, ctx: &mut Context) -> JsResult<JsValue> {
    host.check_cancelled()?;
    let filename = filename_arg(args, 0, ctx)?;
    host.dispatch
        .channel
        .start_stream(StreamHead::new(filename))
        .map_err(|e| js_error(&e))?;
    Ok(JsValue::undefined())
}

fn send_chunk(_this: &JsValue, args: &[JsValue], host: &Host, ctx: &mut Context) -> JsResult<JsValue> {
    host.check_cancelled()?;
    let bytes = bytes_of(args.get_or_undefined(0), ctx)?;
    host.dispatch
        .channel
        .send_chunk(Bytes::from(bytes))
        .map_err(|e| js_error(&e))?;
    Ok(JsValue::undefined())
}

fn end_stream(_this: &JsValue, _args: &[JsValue], host: &Host, _ctx: &mut Context) -> JsResult<JsValue> {
    host.check_cancelled()?;
    host.dispatch.channel.end_stream().map_err(|e| js_error(&e))?;
    Ok(JsValue::undefined())
}

fn send_file(_this: &JsValue, args: &[JsValue], host: &Host, ctx: &mut Context) -> JsResult<JsValue> {
    host.check_cancelled()?;
    let bytes = bytes_of(args.get_or_undefined(0), ctx)?;
    let filename = filename_arg(args, 1, ctx)?;

    let channel = &host.dispatch.channel;
    channel
        .start_stream(StreamHead::new(filename))
        .and_then(|_| channel.send_chunk(Bytes::from(bytes)))
        .and_then(|_| channel.end_stream())
        .map_err(|e| js_error(&e))?;
    Ok(JsValue::undefined())
}

// ---------------------------------------------------------------------------
// log, require, Buffer
// ---------------------------------------------------------------------------

fn tenant_log(_this: &JsValue, args: &[JsValue], host: &Host, ctx: &mut Context) -> JsResult<JsValue> {
    let values: Vec<Value> = args
        .iter()
        .map(|arg| js_value_to_json(arg.clone(), ctx).unwrap_or(Value::Null))
        .collect();
    let rendered = serde_json::Value::Array(values).to_string();

    tracing::info!(
        target: "actionhost::tenant",
        tenant = %host.dispatch.target.tenant,
        action = %host.dispatch.target.action,
        "{}",
        rendered
    );
    Ok(JsValue::undefined())
}

fn require_library(_this: &JsValue, args: &[JsValue], capture: &Resolver, ctx: &mut Context) -> JsResult<JsValue> {
    let name = string_arg(args, 0, "require: library name", ctx)?;
    capture.resolver.require(&name, ctx)
}

fn buffer_from(_this: &JsValue, args: &[JsValue], ctx: &mut Context) -> JsResult<JsValue> {
    let bytes = bytes_of(args.get_or_undefined(0), ctx)?;
    Ok(JsUint8Array::from_iter(bytes, ctx)?.into())
}

fn buffer_alloc(_this: &JsValue, args: &[JsValue], ctx: &mut Context) -> JsResult<JsValue> {
    let size = args.get_or_undefined(0).to_length(ctx)?;
    if size > MAX_BUFFER_BYTES {
        return Err(JsNativeError::range()
            .with_message(format!("Buffer.alloc: size larger than {} bytes", MAX_BUFFER_BYTES))
            .into());
    }
    Ok(JsUint8Array::from_iter(std::iter::repeat(0u8).take(size as usize), ctx)?.into())
}

fn buffer_to_string(_this: &JsValue, args: &[JsValue], ctx: &mut Context) -> JsResult<JsValue> {
    let bytes = bytes_of(args.get_or_undefined(0), ctx)?;
    let text = String::from_utf8_lossy(&bytes).into_owned();
    Ok(JsValue::new(js_string!(text)))
}

use std::sync::Arc;

use actionhost_client::{MemoryStore, PoolConfig, StorePool};
use actionhost_common::{ActionError, BundleId, BundleKey, ResponseEvent, Result, StreamHead, TenantId};
use hyper::body::Bytes;
use serde_json::{json, Value};
use tokio::runtime::Handle;

use crate::bundle::TenantBundle;
use crate::context::DispatchContext;
use crate::resource_limits::ResourceLimits;
use crate::response::{DispatchState, ResponseChannel, ResponseReceiver};
use crate::router::{parse_body, parse_query, route, InboundRequest, Route};
use crate::runtime::Sandbox;

fn load_bundle(store: &MemoryStore, libs: &[(&str, &str)], actions: &[(&str, &str)]) -> Arc<TenantBundle> {
    let revision = store.put_bundle("db1", "datamanager", libs, actions);
    let doc = store.document("db1", "_design/datamanager").unwrap();
    let key = BundleKey::new(TenantId::new("db1").unwrap(), BundleId::default());
    Arc::new(TenantBundle::from_document(key, revision, &doc))
}

fn dispatch_for(
    store: &Arc<MemoryStore>,
    request: InboundRequest,
) -> (Arc<DispatchContext>, ResponseReceiver) {
    let Route::Action(target) = route(&request.path).unwrap() else {
        panic!("not an action path: {}", request.path);
    };
    let (channel, receiver) = ResponseChannel::new(16);
    channel.advance(DispatchState::Resolving).unwrap();

    let pool = StorePool::new(
        store.clone(),
        target.tenant.clone(),
        request.credentials.clone(),
        PoolConfig::default(),
    );
    let dispatch = Arc::new(DispatchContext::new(
        request.method,
        target,
        parse_query(request.query.as_deref()),
        parse_body(request.method, &request.body),
        request.host,
        channel,
        pool,
    ));
    (dispatch, receiver)
}

/// Runs the dispatch the way the dispatcher does: on a blocking thread,
/// reporting any returned error through the channel.
async fn execute(
    bundle: Arc<TenantBundle>,
    dispatch: Arc<DispatchContext>,
    receiver: ResponseReceiver,
    limits: ResourceLimits,
) -> (Result<()>, Vec<ResponseEvent>) {
    let events = tokio::spawn(receiver.collect());
    let sandbox = Sandbox::new(limits, Handle::current());

    let outcome = tokio::task::spawn_blocking(move || {
        let channel = Arc::clone(&dispatch.channel);
        let outcome = sandbox.run(bundle, dispatch);
        if let Err(err) = &outcome {
            channel.fail_blocking(err);
        }
        outcome
    })
    .await
    .unwrap();

    (outcome, events.await.unwrap())
}

async fn run(
    store: &Arc<MemoryStore>,
    bundle: &Arc<TenantBundle>,
    request: InboundRequest,
) -> (Result<()>, Vec<ResponseEvent>) {
    let (dispatch, receiver) = dispatch_for(store, request);
    execute(Arc::clone(bundle), dispatch, receiver, ResourceLimits::default()).await
}

async fn run_action(source: &str) -> (Result<()>, Vec<ResponseEvent>) {
    let store = Arc::new(MemoryStore::new());
    let bundle = load_bundle(&store, &[], &[("act", source)]);
    run(&store, &bundle, InboundRequest::get("/db1/act")).await
}

fn reply(events: &[ResponseEvent]) -> Value {
    match events {
        [ResponseEvent::Reply { status: 200, body }] => body.clone(),
        other => panic!("expected a single ok reply, got {:?}", other),
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn test_send_result_with_request_data() {
    let store = Arc::new(MemoryStore::new());
    let bundle = load_bundle(
        &store,
        &[],
        &[(
            "echo",
            "request.sendResult({tenant: request.tenant, action: request.action, method: request.method, x: request.query.x, body: request.body, path: request.path});",
        )],
    );

    let request = InboundRequest::post("/db1/echo", r#"{"n": 1}"#).with_query("x=7");
    let (outcome, events) = run(&store, &bundle, request).await;
    outcome.unwrap();
    assert_eq!(
        reply(&events),
        json!({
            "tenant": "db1",
            "action": "echo",
            "method": "POST",
            "x": "7",
            "body": {"n": 1},
            "path": ["db1", "echo"],
        })
    );
}

#[tokio::test(flavor = "multi_thread")]
async fn test_send_error_payloads() {
    let (outcome, events) = run_action("request.sendError('no such thing');").await;
    outcome.unwrap();
    assert_eq!(
        events,
        vec![ResponseEvent::Reply { status: 400, body: json!({"error": "no such thing"}) }]
    );

    let (_, events) = run_action("request.sendError({reason: 'x'});").await;
    assert_eq!(events, vec![ResponseEvent::Reply { status: 400, body: json!({"reason": "x"}) }]);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_second_response_is_rejected() {
    let (outcome, events) = run_action(
        "request.sendResult(1); try { request.sendResult(2); } catch (e) { log(e.message); }",
    )
    .await;
    outcome.unwrap();
    assert_eq!(reply(&events), json!(1));
}

#[tokio::test(flavor = "multi_thread")]
async fn test_require_memoizes_within_request() {
    let store = Arc::new(MemoryStore::new());
    let bundle = load_bundle(
        &store,
        &[(
            "util",
            "exports.counter = {n: 0}; exports.bump = function () { return ++exports.counter.n; };",
        )],
        &[(
            "act",
            "var a = require('util'); var b = require('util'); a.bump(); request.sendResult({same: a === b, n: b.counter.n});",
        )],
    );

    let (outcome, events) = run(&store, &bundle, InboundRequest::get("/db1/act")).await;
    outcome.unwrap();
    assert_eq!(reply(&events), json!({"same": true, "n": 1}));

    // fresh exports on the next request
    let (_, events) = run(&store, &bundle, InboundRequest::get("/db1/act")).await;
    assert_eq!(reply(&events), json!({"same": true, "n": 1}));
    assert!(bundle.cached_library("util").is_some());
}

#[tokio::test(flavor = "multi_thread")]
async fn test_module_exports_replacement() {
    let store = Arc::new(MemoryStore::new());
    let bundle = load_bundle(
        &store,
        &[("double", "module.exports = function (x) { return x * 2; };")],
        &[("act", "request.sendResult(require('double')(21));")],
    );

    let (_, events) = run(&store, &bundle, InboundRequest::get("/db1/act")).await;
    assert_eq!(reply(&events), json!(42));
}

#[tokio::test(flavor = "multi_thread")]
async fn test_unknown_library_is_empty() {
    let (outcome, events) = run_action("request.sendResult(Object.keys(require('nothing')).length);").await;
    outcome.unwrap();
    assert_eq!(reply(&events), json!(0));
}

#[tokio::test(flavor = "multi_thread")]
async fn test_self_require_is_cyclic() {
    let store = Arc::new(MemoryStore::new());
    let bundle = load_bundle(
        &store,
        &[("a", "require('a'); exports.x = 1;")],
        &[("act", "require('a'); request.sendResult(1);")],
    );

    let (outcome, events) = run(&store, &bundle, InboundRequest::get("/db1/act")).await;
    assert!(matches!(outcome, Err(ActionError::CyclicDependency(ref name)) if name == "a"));
    assert_eq!(
        events,
        vec![ResponseEvent::Reply {
            status: 400,
            body: json!({"error": "cyclic dependency while resolving library a"}),
        }]
    );
}

#[tokio::test(flavor = "multi_thread")]
async fn test_transitive_cycle() {
    let store = Arc::new(MemoryStore::new());
    let bundle = load_bundle(
        &store,
        &[("a", "require('b');"), ("b", "require('a');")],
        &[("act", "require('a'); request.sendResult(1);")],
    );

    let (outcome, _) = run(&store, &bundle, InboundRequest::get("/db1/act")).await;
    assert!(matches!(outcome, Err(ActionError::CyclicDependency(ref name)) if name == "a"));
}

#[tokio::test(flavor = "multi_thread")]
async fn test_failed_library_rethrows_original_error() {
    let store = Arc::new(MemoryStore::new());
    let bundle = load_bundle(
        &store,
        &[("bad", "throw new Error('broken lib');")],
        &[("act", "try { require('bad'); } catch (e) {} require('bad');")],
    );

    let (outcome, _) = run(&store, &bundle, InboundRequest::get("/db1/act")).await;
    match outcome {
        Err(ActionError::Runtime(message)) => assert!(message.contains("broken lib"), "{}", message),
        other => panic!("expected a runtime error, got {:?}", other),
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn test_library_syntax_error_is_compile_error() {
    let store = Arc::new(MemoryStore::new());
    let bundle = load_bundle(
        &store,
        &[("bad", "function (")],
        &[("act", "require('bad'); request.sendResult(1);")],
    );

    let (outcome, events) = run(&store, &bundle, InboundRequest::get("/db1/act")).await;
    match outcome {
        Err(ActionError::Compile(message)) => assert!(message.starts_with("bad: "), "{}", message),
        other => panic!("expected a compile error, got {:?}", other),
    }
    assert!(matches!(events.as_slice(), [ResponseEvent::Reply { status: 400, .. }]));
}

#[tokio::test(flavor = "multi_thread")]
async fn test_caught_library_syntax_error_then_throw_is_runtime() {
    let store = Arc::new(MemoryStore::new());
    let bundle = load_bundle(
        &store,
        &[("bad", "function (")],
        &[("act", "try { require('bad'); } catch (e) {} throw new Error('later');")],
    );

    let (outcome, _) = run(&store, &bundle, InboundRequest::get("/db1/act")).await;
    match outcome {
        Err(ActionError::Runtime(message)) => assert!(message.contains("later"), "{}", message),
        other => panic!("expected a runtime error, got {:?}", other),
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn test_store_crud() {
    let (outcome, events) = run_action(
        "var created = store.put({_id: 'a', v: 1});
         var doc = store.get('a');
         var removed = store.remove('a', doc._rev);
         request.sendResult({created: created.ok, v: doc.v, removed: removed.ok});",
    )
    .await;
    outcome.unwrap();
    assert_eq!(reply(&events), json!({"created": true, "v": 1, "removed": true}));
}

#[tokio::test(flavor = "multi_thread")]
async fn test_store_all() {
    let store = Arc::new(MemoryStore::new());
    store.put_document("db1", "a", json!({"v": 1}));
    store.put_document("db1", "b", json!({"v": 2}));
    let bundle = load_bundle(
        &store,
        &[],
        &[(
            "act",
            "var docs = store.all([{path: 'a'}, {method: 'GET', path: 'b'}]); request.sendResult(docs.map(function (d) { return d.v; }));",
        )],
    );

    let (_, events) = run(&store, &bundle, InboundRequest::get("/db1/act")).await;
    assert_eq!(reply(&events), json!([1, 2]));
}

#[tokio::test(flavor = "multi_thread")]
async fn test_uncaught_store_error_is_upstream() {
    let (outcome, events) = run_action("store.get('missing'); request.sendResult(1);").await;
    assert!(matches!(outcome, Err(ActionError::Upstream(_))));
    assert_eq!(
        events,
        vec![ResponseEvent::Reply { status: 400, body: json!({"error": "store error: 404 missing"}) }]
    );
}

#[tokio::test(flavor = "multi_thread")]
async fn test_caught_store_error() {
    let (outcome, events) = run_action(
        "try { store.get('missing'); } catch (e) { request.sendResult({caught: e.message}); }",
    )
    .await;
    outcome.unwrap();
    assert_eq!(reply(&events), json!({"caught": "store error: 404 missing"}));
}

#[tokio::test(flavor = "multi_thread")]
async fn test_streaming() {
    let (outcome, events) = run_action(
        "request.startStream('out.txt'); request.sendChunk('a'); request.sendChunk([98]); request.endStream();",
    )
    .await;
    outcome.unwrap();
    assert_eq!(
        events,
        vec![
            ResponseEvent::StreamStart(StreamHead::new("out.txt")),
            ResponseEvent::Chunk(Bytes::from_static(b"a")),
            ResponseEvent::Chunk(Bytes::from_static(b"b")),
            ResponseEvent::StreamEnd,
        ]
    );
}

#[tokio::test(flavor = "multi_thread")]
async fn test_send_file() {
    let (outcome, events) = run_action("request.sendFile(Buffer.from('hi'), 'h.txt');").await;
    outcome.unwrap();
    assert_eq!(
        events,
        vec![
            ResponseEvent::StreamStart(StreamHead::new("h.txt")),
            ResponseEvent::Chunk(Bytes::from_static(b"hi")),
            ResponseEvent::StreamEnd,
        ]
    );
}

#[tokio::test(flavor = "multi_thread")]
async fn test_open_stream_is_ended() {
    let (outcome, events) = run_action("request.startStream('f'); request.sendChunk('x');").await;
    outcome.unwrap();
    assert_eq!(events.last(), Some(&ResponseEvent::StreamEnd));
}

#[tokio::test(flavor = "multi_thread")]
async fn test_error_after_stream_start_aborts() {
    let (outcome, events) =
        run_action("request.startStream('f'); request.sendChunk('x'); throw new Error('boom');").await;
    assert!(matches!(outcome, Err(ActionError::Runtime(_))));
    assert_eq!(events.len(), 3);
    assert!(matches!(events[2], ResponseEvent::StreamAbort(_)));
}

#[tokio::test(flavor = "multi_thread")]
async fn test_no_response_is_an_error() {
    let (outcome, events) = run_action("var x = 1;").await;
    assert!(matches!(outcome, Err(ActionError::Runtime(_))));
    assert_eq!(
        events,
        vec![ResponseEvent::Reply {
            status: 400,
            body: json!({"error": "action completed without sending a response"}),
        }]
    );
}

#[tokio::test(flavor = "multi_thread")]
async fn test_buffer() {
    let (outcome, events) = run_action(
        "var b = Buffer.alloc(3); b[0] = 104; b[1] = 105; b[2] = 33;
         request.sendResult({text: Buffer.toString(b), len: Buffer.from([1, 2]).length});",
    )
    .await;
    outcome.unwrap();
    assert_eq!(reply(&events), json!({"text": "hi!", "len": 2}));
}

#[tokio::test(flavor = "multi_thread")]
async fn test_promise_continuation_responds() {
    let (outcome, events) =
        run_action("Promise.resolve(5).then(function (v) { request.sendResult({v: v}); });").await;
    outcome.unwrap();
    assert_eq!(reply(&events), json!({"v": 5}));
}

#[tokio::test(flavor = "multi_thread")]
async fn test_log_accepts_any_values() {
    let (outcome, events) =
        run_action("log('a', 1, {b: [true, null]}, undefined); log(); request.sendResult('logged');").await;
    outcome.unwrap();
    assert_eq!(reply(&events), json!("logged"));
}

#[tokio::test(flavor = "multi_thread")]
async fn test_async_throw_is_runtime_error() {
    let (outcome, events) =
        run_action("(async function () { await null; throw new Error('boom in async'); })();").await;
    match outcome {
        Err(ActionError::Runtime(message)) => assert!(message.contains("boom in async"), "{}", message),
        other => panic!("expected a runtime error, got {:?}", other),
    }
    match events.as_slice() {
        [ResponseEvent::Reply { status: 400, body }] => {
            assert!(body["error"].as_str().unwrap().contains("boom in async"))
        }
        other => panic!("expected an error reply, got {:?}", other),
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn test_handled_rejection_is_not_an_error() {
    let (outcome, events) = run_action(
        "Promise.reject(new Error('ignored')).catch(function () { request.sendResult('caught'); });",
    )
    .await;
    outcome.unwrap();
    assert_eq!(reply(&events), json!("caught"));
}

#[tokio::test(flavor = "multi_thread")]
async fn test_globals_do_not_leak() {
    let store = Arc::new(MemoryStore::new());
    let bundle = load_bundle(
        &store,
        &[],
        &[(
            "act",
            "var seen = typeof leaked !== 'undefined'; leaked = 1; globalThis.other = 2; request.sendResult({seen: seen});",
        )],
    );

    for _ in 0..2 {
        let (_, events) = run(&store, &bundle, InboundRequest::get("/db1/act")).await;
        assert_eq!(reply(&events), json!({"seen": false}));
    }
    assert_eq!(bundle.compile_count(), 1);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_method_specific_action() {
    let store = Arc::new(MemoryStore::new());
    let bundle = load_bundle(
        &store,
        &[],
        &[
            ("list", "request.sendResult('any');"),
            ("list.post", "request.sendResult('post');"),
        ],
    );

    let (_, events) = run(&store, &bundle, InboundRequest::get("/db1/list")).await;
    assert_eq!(reply(&events), json!("any"));
    let (_, events) = run(&store, &bundle, InboundRequest::post("/db1/list", "")).await;
    assert_eq!(reply(&events), json!("post"));
}

#[tokio::test(flavor = "multi_thread")]
async fn test_unknown_action() {
    let store = Arc::new(MemoryStore::new());
    let bundle = load_bundle(&store, &[], &[("act", "request.sendResult(1);")]);

    let (outcome, events) = run(&store, &bundle, InboundRequest::get("/db1/nope")).await;
    assert!(matches!(outcome, Err(ActionError::UnknownAction(ref a)) if a == "nope"));
    assert_eq!(
        events,
        vec![ResponseEvent::Reply { status: 400, body: json!({"error": "unknown action nope"}) }]
    );
}

#[tokio::test(flavor = "multi_thread")]
async fn test_loop_limit() {
    let store = Arc::new(MemoryStore::new());
    let bundle = load_bundle(&store, &[], &[("spin", "while (true) {}")]);
    let (dispatch, receiver) = dispatch_for(&store, InboundRequest::get("/db1/spin"));

    let limits = ResourceLimits::new().with_loop_iteration_limit(10_000);
    let (outcome, _) = execute(bundle, dispatch, receiver, limits).await;
    assert!(matches!(outcome, Err(ActionError::Runtime(_))));
}

#[tokio::test(flavor = "multi_thread")]
async fn test_cancelled_dispatch() {
    let store = Arc::new(MemoryStore::new());
    store.put_document("db1", "a", json!({"v": 1}));
    let bundle = load_bundle(&store, &[], &[("act", "store.get('a'); request.sendResult(1);")]);
    let (dispatch, receiver) = dispatch_for(&store, InboundRequest::get("/db1/act"));

    dispatch.cancel();
    let (outcome, _) = execute(bundle, dispatch, receiver, ResourceLimits::default()).await;
    assert!(matches!(outcome, Err(ActionError::Cancelled)));
    assert_eq!(store.request_count(), 0);
}

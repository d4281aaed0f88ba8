// udf_tests.rs
// SQL functions and auto-extensions through the bridge facade
//
// These tests verify:
// 1. Function objects are classified and dispatched per category
// 2. Argument wrappers are valid during a call and invalid after it
// 3. Aggregate calls share one per-aggregation key
// 4. Auto-extensions see the connection being opened

use parking_lot::Mutex;
use sqlbridge_core::config::BridgeConfig;
use sqlbridge_core::engine::SQLITE_UTF8;
use sqlbridge_core::testing::{Fixture, MockEnv, MockResult};
use sqlbridge_core::{codes, HookKind, ManagedEnv, ObjRef, Ret, RetKind, UdfMethod, Value};
use std::sync::Arc;

fn setup() -> (Fixture, MockEnv, ObjRef, usize) {
    let fx = Fixture::new();
    let env = fx.rt.attach();
    let (rc, db) = fx.open(&env, "udf.db");
    assert_eq!(rc, codes::SQLITE_OK);
    let db = db.unwrap();
    let ptr = fx.db_ptr(&env, db);
    (fx, env, db, ptr)
}

fn sig(method: UdfMethod) -> String {
    method.signature(&BridgeConfig::default())
}

/// Read a `long` field straight off a managed object
fn long_field(env: &MockEnv, obj: ObjRef, name: &str) -> i64 {
    let class = env.object_class(obj).unwrap();
    let field = env.field_id(class, name, "J").unwrap();
    match env.get_field(obj, field, RetKind::Long) {
        Ok(Ret::Long(v)) => v,
        _ => 0,
    }
}

fn register(fx: &Fixture, env: &MockEnv, db: ObjRef, name: &str, class: &str) -> i32 {
    let jname = env.new_string(name);
    let functor = env.alloc_plain(class);
    fx.bridge
        .create_function(env, Some(db), Some(jname), -1, SQLITE_UTF8, Some(functor))
}

/// Wrappers a function saw, kept alive as local refs for later inspection
#[derive(Default)]
struct Captured {
    context: Option<ObjRef>,
    values: Vec<ObjRef>,
    addresses: Vec<i64>,
    aggregate_keys: Vec<i64>,
}

fn capture(env: &MockEnv, args: &[Value], into: &Mutex<Captured>) {
    let mut c = into.lock();
    if let Some(Value::Object(Some(cx))) = args.first() {
        c.aggregate_keys.push(long_field(env, *cx, "aggregateContext"));
        c.addresses.push(long_field(env, *cx, "nativePointer"));
        c.context = env.new_local_ref(*cx).ok();
    }
    if let Some(Value::Object(Some(array))) = args.get(1) {
        let len = env.array_length(*array).unwrap_or(0);
        for i in 0..len {
            if let Ok(Some(v)) = env.get_array_element(*array, i) {
                c.addresses.push(long_field(env, v, "nativePointer"));
                c.values.push(v);
            }
        }
    }
}

// =============================================================================
// SCALAR FUNCTIONS
// =============================================================================

/// Test: Scalar function called with two arguments
/// Expected: Wrappers carry live addresses during the call and 0 afterwards
#[test]
fn test_scalar_arguments_invalidated_after_call() {
    let (fx, env, db, ptr) = setup();
    let captured: Arc<Mutex<Captured>> = Arc::default();
    let c = captured.clone();
    let class = fx.rt.define_class("test/udf/Scalar");
    fx.rt.add_method(&class, "xFunc", &sig(UdfMethod::Func), move |env, args| {
        capture(env, args, &c);
        Ok(Ret::Void)
    });
    assert_eq!(register(&fx, &env, db, "twice", &class), codes::SQLITE_OK);
    assert!(fx.engine().has_function(ptr, "twice"));

    let ctx = fx.engine().new_context();
    let result = fx.engine().call_function(ptr, "twice", UdfMethod::Func, ctx, 2);

    assert_eq!(result, None);
    let c = captured.lock();
    assert_eq!(c.values.len(), 2);
    assert!(c.addresses.iter().all(|a| *a != 0));
    assert_eq!(c.addresses[0], ctx as i64);
    assert_eq!(long_field(&env, c.context.unwrap(), "nativePointer"), 0);
    for v in &c.values {
        assert_eq!(long_field(&env, *v, "nativePointer"), 0);
    }
    assert_eq!(fx.bridge.metrics().snapshot().udf_func, 1);
}

/// Test: Scalar function throws
/// Expected: Error result names the function and the exception
#[test]
fn test_scalar_exception_sets_error_result() {
    let (fx, env, db, ptr) = setup();
    let class = fx.rt.define_class("test/udf/Throws");
    fx.rt.add_method(&class, "xFunc", &sig(UdfMethod::Func), |env, _| {
        env.throw("java.lang.ArithmeticException: / by zero");
        Err("thrown".into())
    });
    register(&fx, &env, db, "divide", &class);

    let ctx = fx.engine().new_context();
    let result = fx.engine().call_function(ptr, "divide", UdfMethod::Func, ctx, 1);

    assert_eq!(
        result,
        Some(MockResult::Error(
            "Client-defined SQL function divide.xFunc() threw: java.lang.ArithmeticException: / by zero"
                .into()
        ))
    );
    assert!(!env.exception_check());
}

/// Test: Scalar function throws an exception whose toString() throws too
/// Expected: Error result still names the function, with a generic reason
#[test]
fn test_unprintable_exception_reports_unknown() {
    let (fx, env, db, ptr) = setup();
    let opaque = fx.rt.define_class("test/udf/OpaqueError");
    fx.rt
        .add_method(&opaque, "toString", "()Ljava/lang/String;", |_, _| {
            Err("toString failed".into())
        });
    let class = fx.rt.define_class("test/udf/Unprintable");
    fx.rt.add_method(&class, "xFunc", &sig(UdfMethod::Func), move |env, _| {
        let ex = env.alloc_plain(&opaque);
        env.throw_object(ex);
        Err("thrown".into())
    });
    register(&fx, &env, db, "opaque", &class);

    let ctx = fx.engine().new_context();
    let result = fx.engine().call_function(ptr, "opaque", UdfMethod::Func, ctx, 0);

    assert_eq!(
        result,
        Some(MockResult::Error(
            "Client-defined SQL function opaque.xFunc() threw: Unknown exception".into()
        ))
    );
    assert!(!env.exception_check());
}

/// Test: Marshaling runs out of memory after the context wrapper
/// Expected: NOMEM result and no leaked local references
#[test]
fn test_marshal_oom_reports_nomem() {
    let (fx, env, db, ptr) = setup();
    let class = fx.rt.define_class("test/udf/Starved");
    fx.rt
        .add_method(&class, "xFunc", &sig(UdfMethod::Func), |_, _| Ok(Ret::Void));
    register(&fx, &env, db, "starved", &class);
    let ctx = fx.engine().new_context();
    // Warm every cache the call path touches
    fx.engine().call_function(ptr, "starved", UdfMethod::Func, ctx, 2);
    let locals = fx.rt.local_ref_count();

    fx.rt.fail_allocations_after(1);
    let ctx = fx.engine().new_context();
    let result = fx.engine().call_function(ptr, "starved", UdfMethod::Func, ctx, 2);
    fx.rt.fail_allocations_after(usize::MAX);

    assert_eq!(result, Some(MockResult::NoMem));
    assert_eq!(fx.rt.calls_to(&class, "xFunc"), 1);
    assert_eq!(fx.rt.local_ref_count(), locals);
    assert!(!env.exception_check());
}

/// Test: Register an object with no function entry points
/// Expected: MISUSE, nothing registered, nothing pinned
#[test]
fn test_create_function_rejects_non_function() {
    let (fx, env, db, ptr) = setup();
    let class = fx.rt.define_class("test/udf/Nothing");
    let globals = fx.rt.global_ref_count();

    assert_eq!(register(&fx, &env, db, "nothing", &class), codes::SQLITE_MISUSE);

    assert!(!fx.engine().has_function(ptr, "nothing"));
    assert_eq!(fx.rt.global_ref_count(), globals);
    let msg = fx.bridge.errmsg(&env, Some(db)).and_then(|m| env.string_value(m));
    assert_eq!(
        msg.as_deref(),
        Some("misuse: nothing is not a scalar, aggregate or window function")
    );
}

/// Test: Function replaced by name, then the connection closes
/// Expected: Each binding's xDestroy runs exactly once
#[test]
fn test_function_destroy_on_replace_and_close() {
    let (fx, env, db, _) = setup();
    let make = |name: &str| {
        let class = fx.rt.define_class(name);
        fx.rt
            .add_method(&class, "xFunc", &sig(UdfMethod::Func), |_, _| Ok(Ret::Void));
        fx.rt.add_method(&class, "xDestroy", "()V", |_, _| Ok(Ret::Void));
        class
    };
    let first = make("test/udf/First");
    let second = make("test/udf/Second");

    register(&fx, &env, db, "f", &first);
    register(&fx, &env, db, "F", &second);
    assert_eq!(fx.rt.calls_to(&first, "xDestroy"), 1);
    assert_eq!(fx.rt.calls_to(&second, "xDestroy"), 0);

    fx.bridge.close(&env, Some(db), false);
    assert_eq!(fx.rt.calls_to(&second, "xDestroy"), 1);
}

// =============================================================================
// AGGREGATE AND WINDOW FUNCTIONS
// =============================================================================

fn aggregate_class(fx: &Fixture, name: &str, captured: Arc<Mutex<Captured>>, window: bool) -> String {
    let class = fx.rt.define_class(name);
    let methods: &[UdfMethod] = if window {
        &[UdfMethod::Step, UdfMethod::Final, UdfMethod::Value, UdfMethod::Inverse]
    } else {
        &[UdfMethod::Step, UdfMethod::Final]
    };
    for m in methods {
        let c = captured.clone();
        fx.rt.add_method(&class, m.name(), &sig(*m), move |env, args| {
            capture(env, args, &c);
            Ok(Ret::Void)
        });
    }
    class
}

/// Test: Three xStep calls and one xFinal on the same aggregation
/// Expected: Every call sees the same non-zero aggregate key
#[test]
fn test_aggregate_key_is_stable() {
    let (fx, env, db, ptr) = setup();
    let captured: Arc<Mutex<Captured>> = Arc::default();
    let class = aggregate_class(&fx, "test/udf/Sum", captured.clone(), false);
    register(&fx, &env, db, "mysum", &class);

    let ctx = fx.engine().new_context();
    for _ in 0..3 {
        assert_eq!(fx.engine().call_function(ptr, "mysum", UdfMethod::Step, ctx, 1), None);
    }
    fx.engine().call_function(ptr, "mysum", UdfMethod::Final, ctx, 0);

    let keys = captured.lock().aggregate_keys.clone();
    assert_eq!(keys.len(), 4);
    assert_ne!(keys[0], 0);
    assert!(keys.iter().all(|k| *k == keys[0]));
}

/// Test: xFinal on an aggregation that never stepped (empty group)
/// Expected: Key 0; no storage is allocated just to finish
#[test]
fn test_final_without_step_gets_zero_key() {
    let (fx, env, db, ptr) = setup();
    let captured: Arc<Mutex<Captured>> = Arc::default();
    let class = aggregate_class(&fx, "test/udf/Empty", captured.clone(), false);
    register(&fx, &env, db, "empty", &class);

    let ctx = fx.engine().new_context();
    fx.engine().call_function(ptr, "empty", UdfMethod::Final, ctx, 0);

    assert_eq!(captured.lock().aggregate_keys, vec![0]);
}

/// Test: Window function entry points
/// Expected: xValue and xInverse dispatch; xValue gets no argument array
#[test]
fn test_window_function_dispatch() {
    let (fx, env, db, ptr) = setup();
    let captured: Arc<Mutex<Captured>> = Arc::default();
    let class = aggregate_class(&fx, "test/udf/Win", captured.clone(), true);
    register(&fx, &env, db, "win", &class);

    let ctx = fx.engine().new_context();
    fx.engine().call_function(ptr, "win", UdfMethod::Step, ctx, 1);
    fx.engine().call_function(ptr, "win", UdfMethod::Value, ctx, 0);
    fx.engine().call_function(ptr, "win", UdfMethod::Inverse, ctx, 1);

    assert_eq!(fx.rt.calls_to(&class, "xValue"), 1);
    assert_eq!(fx.rt.calls_to(&class, "xInverse"), 1);
    assert_eq!(captured.lock().values.len(), 2);
    let snap = fx.bridge.metrics().snapshot();
    assert_eq!((snap.udf_step, snap.udf_value, snap.udf_inverse), (1, 1, 1));
}

// =============================================================================
// AUTO-EXTENSIONS
// =============================================================================

/// Test: Auto-extension registered twice, then a connection is opened
/// Expected: Runner installed once; extension runs once with the new wrapper
#[test]
fn test_auto_extension_sees_opening_connection() {
    let fx = Fixture::new();
    let env = fx.rt.attach();
    let seen: Arc<Mutex<Vec<(ObjRef, i64)>>> = Arc::default();
    let s = seen.clone();
    let class = fx.rt.callback_class(
        "test/udf/Ext",
        &fx.hook_sig(HookKind::AutoExtension),
        move |env, args| {
            if let [Value::Object(Some(db))] = args {
                let addr = long_field(env, *db, "nativePointer");
                s.lock().push((env.new_local_ref(*db).unwrap(), addr));
            }
            Ok(Ret::Int(0))
        },
    );
    let ext = env.alloc_plain(&class);
    assert_eq!(fx.bridge.auto_extension(&env, Some(ext)), codes::SQLITE_OK);
    assert_eq!(fx.bridge.auto_extension(&env, Some(ext)), codes::SQLITE_OK);
    assert_eq!(fx.engine().runner_installs(), 1);
    assert_eq!(fx.bridge.auto_extensions().len(), 1);

    let (rc, db) = fx.open(&env, "ext.db");

    assert_eq!(rc, codes::SQLITE_OK);
    let db = db.unwrap();
    let seen = seen.lock();
    assert_eq!(seen.len(), 1);
    assert!(env.is_same_object(Some(seen[0].0), Some(db)));
    assert_eq!(seen[0].1 as usize, fx.db_ptr(&env, db));
    assert_eq!(fx.bridge.connections().stats().in_use, 1);
}

/// Test: Second auto-extension fails
/// Expected: Open returns its code; the third extension never runs
#[test]
fn test_auto_extension_failure_aborts_open() {
    let fx = Fixture::new();
    let env = fx.rt.attach();
    let sig = fx.hook_sig(HookKind::AutoExtension);
    let ok = fx.rt.callback_class("test/udf/ExtOk", &sig, |_, _| Ok(Ret::Int(0)));
    let bad = fx
        .rt
        .callback_class("test/udf/ExtBad", &sig, |_, _| Ok(Ret::Int(codes::SQLITE_FORMAT)));
    let never = fx.rt.callback_class("test/udf/ExtNever", &sig, |_, _| Ok(Ret::Int(0)));
    for class in [&ok, &bad, &never] {
        fx.bridge.auto_extension(&env, Some(env.alloc_plain(class)));
    }

    let (rc, db) = fx.open(&env, "broken.db");

    assert_eq!(rc, codes::SQLITE_FORMAT);
    assert_eq!(fx.rt.calls_to(&never, "call"), 0);
    let db = db.expect("engine returns a handle that must be closed");
    let msg = fx.bridge.errmsg(&env, Some(db)).and_then(|m| env.string_value(m));
    assert!(msg.unwrap_or_default().contains("auto-extension returned 24"));
    assert_eq!(fx.bridge.close(&env, Some(db), false), codes::SQLITE_OK);
}

/// Test: Cancel and reset
/// Expected: Cancelled extensions no longer run; reset keeps the runner
#[test]
fn test_auto_extension_cancel_and_reset() {
    let fx = Fixture::new();
    let env = fx.rt.attach();
    let sig = fx.hook_sig(HookKind::AutoExtension);
    let class = fx.rt.callback_class("test/udf/ExtCancel", &sig, |_, _| Ok(Ret::Int(0)));
    let a = env.alloc_plain(&class);
    let b = env.alloc_plain(&class);
    fx.bridge.auto_extension(&env, Some(a));
    fx.bridge.auto_extension(&env, Some(b));

    assert!(fx.bridge.cancel_auto_extension(&env, Some(a)));
    assert!(!fx.bridge.cancel_auto_extension(&env, Some(a)));
    assert!(!fx.bridge.cancel_auto_extension(&env, None));
    fx.open(&env, "one.db");
    assert_eq!(fx.rt.calls_to(&class, "call"), 1);

    fx.bridge.reset_auto_extension(&env);
    fx.open(&env, "two.db");
    assert_eq!(fx.rt.calls_to(&class, "call"), 1);
    assert_eq!(fx.engine().runner_installs(), 1);
}

// hook_tests.rs
// Per-connection and global callback hooks through the bridge facade
//
// These tests verify:
// 1. Rebinding the same object is free (no new global references)
// 2. Registrations that return the previous hook hand back the right object
// 3. Callback results reach the engine and callback exceptions are contained
// 4. Collations are torn down exactly once, and never when registration fails

use parking_lot::Mutex;
use sqlbridge_core::engine::SQLITE_UTF8;
use sqlbridge_core::testing::{Fixture, MockEnv};
use sqlbridge_core::{codes, HookKind, ManagedEnv, ObjRef, Ret, Value};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

fn setup() -> (Fixture, MockEnv, ObjRef, usize) {
    let fx = Fixture::new();
    let env = fx.rt.attach();
    let (rc, db) = fx.open(&env, "hooks.db");
    assert_eq!(rc, codes::SQLITE_OK);
    let db = db.unwrap();
    let ptr = fx.db_ptr(&env, db);
    (fx, env, db, ptr)
}

fn errmsg(fx: &Fixture, env: &MockEnv, db: ObjRef) -> String {
    fx.bridge
        .errmsg(env, Some(db))
        .and_then(|m| env.string_value(m))
        .unwrap_or_default()
}

fn int_hook(fx: &Fixture, name: &str, kind: HookKind, rc: i32) -> String {
    fx.rt
        .callback_class(name, &fx.hook_sig(kind), move |_, _| Ok(Ret::Int(rc)))
}

fn void_hook(fx: &Fixture, name: &str, kind: HookKind) -> String {
    fx.rt
        .callback_class(name, &fx.hook_sig(kind), |_, _| Ok(Ret::Void))
}

// =============================================================================
// REBINDING
// =============================================================================

/// Test: Register the same busy handler twice
/// Expected: Second registration adds no global reference
#[test]
fn test_idempotent_rebind_keeps_global_count() {
    let (fx, env, db, ptr) = setup();
    let class = int_hook(&fx, "test/hooks/Busy", HookKind::Busy, 0);
    let h = env.alloc_plain(&class);

    assert_eq!(
        fx.bridge.set_callback(&env, Some(db), HookKind::Busy, 0, Some(h)),
        codes::SQLITE_OK
    );
    let globals = fx.rt.global_ref_count();
    assert_eq!(
        fx.bridge.set_callback(&env, Some(db), HookKind::Busy, 0, Some(h)),
        codes::SQLITE_OK
    );
    assert_eq!(fx.rt.global_ref_count(), globals);

    // A different object replaces the binding one-for-one
    let other = env.alloc_plain(&class);
    assert_eq!(
        fx.bridge.set_callback(&env, Some(db), HookKind::Busy, 0, Some(other)),
        codes::SQLITE_OK
    );
    assert_eq!(fx.rt.global_ref_count(), globals);

    assert_eq!(fx.bridge.set_callback(&env, Some(db), HookKind::Busy, 0, None), codes::SQLITE_OK);
    assert_eq!(fx.rt.global_ref_count(), globals - 1);
    assert!(!fx.engine().hook_enabled(ptr, HookKind::Busy));
}

/// Test: Register an object lacking the hook method
/// Expected: Error returned, previous binding untouched, no exception pending
#[test]
fn test_bind_failure_leaves_slot_unchanged() {
    let (fx, env, db, ptr) = setup();
    let good = int_hook(&fx, "test/hooks/Progress", HookKind::Progress, 0);
    fx.bridge
        .set_callback(&env, Some(db), HookKind::Progress, 5, Some(env.alloc_plain(&good)));
    let globals = fx.rt.global_ref_count();
    let bad = env.alloc_plain("test/hooks/NotAHook");

    let rc = fx.bridge.set_callback(&env, Some(db), HookKind::Progress, 5, Some(bad));

    assert_eq!(rc, codes::SQLITE_ERROR);
    assert!(!env.exception_check());
    assert_eq!(fx.rt.global_ref_count(), globals);
    assert!(fx.engine().hook_enabled(ptr, HookKind::Progress));
}

/// Test: Hook registration on a closed connection
/// Expected: MISUSE
#[test]
fn test_hook_on_closed_connection() {
    let (fx, env, db, _) = setup();
    fx.bridge.close(&env, Some(db), false);
    let class = int_hook(&fx, "test/hooks/Late", HookKind::Busy, 0);
    assert_eq!(
        fx.bridge.set_callback(&env, Some(db), HookKind::Busy, 0, Some(env.alloc_plain(&class))),
        codes::SQLITE_MISUSE
    );
}

// =============================================================================
// HOOKS RETURNING THEIR PREDECESSOR
// =============================================================================

/// Test: commit_hook called three times
/// Expected: null, then the first hook, then the second
#[test]
fn test_commit_hook_returns_previous() {
    let (fx, env, db, _) = setup();
    let class = int_hook(&fx, "test/hooks/Commit", HookKind::Commit, 0);
    let first = env.alloc_plain(&class);
    let second = env.alloc_plain(&class);

    assert_eq!(fx.bridge.swap_callback(&env, Some(db), HookKind::Commit, Some(first)), None);
    let prev = fx.bridge.swap_callback(&env, Some(db), HookKind::Commit, Some(second));
    assert!(env.is_same_object(prev, Some(first)));
    let prev = fx.bridge.swap_callback(&env, Some(db), HookKind::Commit, None);
    assert!(env.is_same_object(prev, Some(second)));
}

/// Test: Rebinding the current update hook
/// Expected: The same object comes back and nothing is re-resolved
#[test]
fn test_update_hook_noop_returns_same_object() {
    let (fx, env, db, _) = setup();
    let class = void_hook(&fx, "test/hooks/Update", HookKind::Update);
    let h = env.alloc_plain(&class);
    fx.bridge.swap_callback(&env, Some(db), HookKind::Update, Some(h));
    let globals = fx.rt.global_ref_count();

    let prev = fx.bridge.swap_callback(&env, Some(db), HookKind::Update, Some(h));

    assert!(env.is_same_object(prev, Some(h)));
    assert_eq!(fx.rt.global_ref_count(), globals);
}

// =============================================================================
// DISPATCH
// =============================================================================

/// Test: Commit hook vetoes the commit
/// Expected: Non-zero reaches the engine, which then runs the rollback hook
#[test]
fn test_commit_veto_triggers_rollback() {
    let (fx, env, db, ptr) = setup();
    let commit = int_hook(&fx, "test/hooks/Veto", HookKind::Commit, 1);
    let rollback = void_hook(&fx, "test/hooks/Rollback", HookKind::Rollback);
    fx.bridge
        .swap_callback(&env, Some(db), HookKind::Commit, Some(env.alloc_plain(&commit)));
    fx.bridge
        .swap_callback(&env, Some(db), HookKind::Rollback, Some(env.alloc_plain(&rollback)));

    assert_eq!(fx.engine().fire_commit(ptr), 1);
    assert_eq!(fx.rt.calls_to(&rollback, "call"), 1);
    assert_eq!(fx.bridge.metrics().hook_calls(HookKind::Commit), 1);
}

/// Test: Commit hook throws
/// Expected: Treated as a veto; exception text available through errmsg
#[test]
fn test_commit_hook_exception_becomes_error() {
    let (fx, env, db, ptr) = setup();
    let class = fx
        .rt
        .callback_class("test/hooks/CommitThrow", &fx.hook_sig(HookKind::Commit), |env, _| {
            env.throw("java.lang.RuntimeException: no commits");
            Err("thrown".into())
        });
    fx.bridge
        .swap_callback(&env, Some(db), HookKind::Commit, Some(env.alloc_plain(&class)));

    assert_eq!(fx.engine().fire_commit(ptr), codes::SQLITE_ERROR);
    assert!(!env.exception_check());
    assert_eq!(
        errmsg(&fx, &env, db),
        "callback threw: java.lang.RuntimeException: no commits"
    );
}

/// Test: Update and pre-update hooks on a row change
/// Expected: Both see op, database and table names, and the row id
#[test]
fn test_update_and_preupdate_arguments() {
    let (fx, env, db, ptr) = setup();
    let updates: Arc<Mutex<Vec<(i32, String, String, i64)>>> = Arc::default();
    let pre_matches_db = Arc::new(AtomicUsize::new(0));

    let seen = updates.clone();
    let update = fx
        .rt
        .callback_class("test/hooks/Upd", &fx.hook_sig(HookKind::Update), move |env, args| {
            if let [Value::Int(op), Value::Object(d), Value::Object(t), Value::Long(row)] = args {
                let name = |o: &Option<ObjRef>| o.and_then(|o| env.string_value(o)).unwrap_or_default();
                seen.lock().push((*op, name(d), name(t), *row));
            }
            Ok(Ret::Void)
        });
    let hits = pre_matches_db.clone();
    let preupdate = fx.rt.callback_class(
        "test/hooks/PreUpd",
        &fx.hook_sig(HookKind::PreUpdate),
        move |env, args| {
            if let [Value::Object(conn), Value::Int(18), _, _, Value::Long(7), Value::Long(7)] = args {
                if env.is_same_object(*conn, Some(db)) {
                    hits.fetch_add(1, Ordering::SeqCst);
                }
            }
            Ok(Ret::Void)
        },
    );
    fx.bridge
        .swap_callback(&env, Some(db), HookKind::Update, Some(env.alloc_plain(&update)));
    fx.bridge
        .swap_callback(&env, Some(db), HookKind::PreUpdate, Some(env.alloc_plain(&preupdate)));

    fx.engine().fire_update(ptr, 18, "users", 7);

    assert_eq!(
        *updates.lock(),
        vec![(18, "main".to_string(), "users".to_string(), 7)]
    );
    assert_eq!(pre_matches_db.load(Ordering::SeqCst), 1);
}

/// Test: Authorizer denies an action
/// Expected: Decision reaches the engine; null strings arrive as null
#[test]
fn test_authorizer_decision_and_null_args() {
    let (fx, env, db, ptr) = setup();
    let nulls = Arc::new(AtomicUsize::new(0));
    let n = nulls.clone();
    let class = fx.rt.callback_class(
        "test/hooks/Auth",
        &fx.hook_sig(HookKind::Authorizer),
        move |_, args| {
            n.store(
                args.iter().filter(|a| matches!(a, Value::Object(None))).count(),
                Ordering::SeqCst,
            );
            Ok(Ret::Int(1))
        },
    );
    assert_eq!(
        fx.bridge
            .set_callback(&env, Some(db), HookKind::Authorizer, 0, Some(env.alloc_plain(&class))),
        codes::SQLITE_OK
    );

    let rc = fx
        .engine()
        .fire_authorizer(ptr, 21, [Some("t"), None, Some("main"), None]);

    assert_eq!(rc, 1);
    assert_eq!(nulls.load(Ordering::SeqCst), 2);
}

/// Test: Busy handler sees the retry count
/// Expected: Handler result is returned to the engine for each attempt
#[test]
fn test_busy_handler_retry_count() {
    let (fx, env, db, ptr) = setup();
    let class = fx
        .rt
        .callback_class("test/hooks/Retry", &fx.hook_sig(HookKind::Busy), |_, args| {
            match args {
                [Value::Int(n)] if *n < 3 => Ok(Ret::Int(1)),
                _ => Ok(Ret::Int(0)),
            }
        });
    fx.bridge
        .set_callback(&env, Some(db), HookKind::Busy, 0, Some(env.alloc_plain(&class)));

    let results: Vec<i32> = (0..5).map(|n| fx.engine().fire_busy(ptr, n)).collect();
    assert_eq!(results, vec![1, 1, 1, 0, 0]);
}

/// Test: Progress handler with a changed instruction count
/// Expected: Same object keeps its binding; the engine sees the new count,
///           and a zero count uninstalls the handler
#[test]
fn test_progress_handler_updates_count() {
    let (fx, env, db, ptr) = setup();
    let class = int_hook(&fx, "test/hooks/Prog", HookKind::Progress, 1);
    let h = env.alloc_plain(&class);
    fx.bridge.set_callback(&env, Some(db), HookKind::Progress, 10, Some(h));
    let globals = fx.rt.global_ref_count();

    fx.bridge.set_callback(&env, Some(db), HookKind::Progress, 20, Some(h));

    assert_eq!(fx.engine().hook_arg(ptr, HookKind::Progress), Some(20));
    assert_eq!(fx.rt.global_ref_count(), globals);
    assert_eq!(fx.engine().fire_progress(ptr), 1);

    fx.bridge.set_callback(&env, Some(db), HookKind::Progress, 0, Some(h));
    assert!(!fx.engine().hook_enabled(ptr, HookKind::Progress));
    assert_eq!(fx.engine().fire_progress(ptr), 0);
}

/// Test: Engine rejects the refreshed count for an already bound handler
/// Expected: Failure code and message surface; the binding itself survives
#[test]
fn test_progress_refresh_failure_is_reported() {
    let (fx, env, db, ptr) = setup();
    let class = int_hook(&fx, "test/hooks/ProgRefresh", HookKind::Progress, 0);
    let h = env.alloc_plain(&class);
    fx.bridge.set_callback(&env, Some(db), HookKind::Progress, 10, Some(h));
    let globals = fx.rt.global_ref_count();

    fx.engine().fail_next_set_hook(codes::SQLITE_MISUSE);
    let rc = fx.bridge.set_callback(&env, Some(db), HookKind::Progress, 20, Some(h));

    assert_eq!(rc, codes::SQLITE_MISUSE);
    assert!(errmsg(&fx, &env, db).contains("cannot refresh progress hook"));
    assert_eq!(fx.engine().hook_arg(ptr, HookKind::Progress), Some(10));
    assert_eq!(fx.rt.global_ref_count(), globals);
}

/// Test: Register a process-wide callback kind on a connection
/// Expected: MISUSE, nothing bound
#[test]
fn test_set_callback_rejects_global_kinds() {
    let (fx, env, db, _) = setup();
    let class = void_hook(&fx, "test/hooks/NotPerConnection", HookKind::ConfigLog);
    let globals = fx.rt.global_ref_count();

    let rc = fx
        .bridge
        .set_callback(&env, Some(db), HookKind::ConfigLog, 0, Some(env.alloc_plain(&class)));

    assert_eq!(rc, codes::SQLITE_MISUSE);
    assert_eq!(fx.rt.global_ref_count(), globals);
}

/// Test: Close a connection with hooks bound
/// Expected: Every hook's reference is released
#[test]
fn test_close_releases_hooks() {
    let (fx, env, db, _) = setup();
    let baseline = fx.rt.global_ref_count();
    let busy = int_hook(&fx, "test/hooks/B", HookKind::Busy, 0);
    let commit = int_hook(&fx, "test/hooks/C", HookKind::Commit, 0);
    let update = void_hook(&fx, "test/hooks/U", HookKind::Update);
    fx.bridge.set_callback(&env, Some(db), HookKind::Busy, 0, Some(env.alloc_plain(&busy)));
    fx.bridge.swap_callback(&env, Some(db), HookKind::Commit, Some(env.alloc_plain(&commit)));
    fx.bridge.swap_callback(&env, Some(db), HookKind::Update, Some(env.alloc_plain(&update)));
    assert_eq!(fx.rt.global_ref_count(), baseline + 3);

    fx.bridge.close(&env, Some(db), false);

    // The connection's own wrapper reference goes too
    assert_eq!(fx.rt.global_ref_count(), baseline - 1);
}

// =============================================================================
// COLLATIONS
// =============================================================================

fn collation_class(fx: &Fixture, name: &str) -> String {
    let class = fx.rt.callback_class(
        name,
        &fx.hook_sig(HookKind::Collation),
        |env, args| match args {
            [Value::Object(Some(a)), Value::Object(Some(b))] => {
                let a = env.byte_array_contents(*a).map_err(|e| e.to_string())?;
                let b = env.byte_array_contents(*b).map_err(|e| e.to_string())?;
                // Reverse order
                Ok(Ret::Int(b.cmp(&a) as i32))
            }
            _ => Err("bad collation arguments".into()),
        },
    );
    fx.rt.add_method(&class, "xDestroy", "()V", |_, _| Ok(Ret::Void));
    class
}

/// Test: Register a collation, compare with it, close the connection
/// Expected: Comparisons use the managed order; xDestroy runs once on close
#[test]
fn test_collation_lifecycle() {
    let (fx, env, db, ptr) = setup();
    let class = collation_class(&fx, "test/hooks/Reverse");
    let name = env.new_string("REVERSE");

    let rc = fx
        .bridge
        .create_collation(&env, Some(db), Some(name), SQLITE_UTF8, Some(env.alloc_plain(&class)));

    assert_eq!(rc, codes::SQLITE_OK);
    assert!(fx.engine().has_collation(ptr, "REVERSE"));
    assert_eq!(fx.engine().compare(ptr, "REVERSE", b"a", b"b"), Some(1));
    assert_eq!(fx.engine().compare(ptr, "REVERSE", b"b", b"a"), Some(-1));

    fx.bridge.close(&env, Some(db), false);
    assert_eq!(fx.rt.calls_to(&class, "xDestroy"), 1);
}

/// Test: Native collation registration fails
/// Expected: Failure code returned; the reference is released but xDestroy
///           never runs for a collation that was never installed
#[test]
fn test_collation_registration_failure_skips_teardown() {
    let (fx, env, db, _) = setup();
    let class = collation_class(&fx, "test/hooks/Rejected");
    let globals = fx.rt.global_ref_count();
    fx.engine().fail_next_collation(codes::SQLITE_BUSY);

    let name = env.new_string("R");
    let rc = fx
        .bridge
        .create_collation(&env, Some(db), Some(name), SQLITE_UTF8, Some(env.alloc_plain(&class)));

    assert_eq!(rc, codes::SQLITE_BUSY);
    assert_eq!(fx.rt.calls_to(&class, "xDestroy"), 0);
    assert_eq!(fx.rt.global_ref_count(), globals);
}

/// Test: Replace a collation under the same name
/// Expected: The replaced binding is destroyed, the new one is not
#[test]
fn test_collation_replacement_destroys_old() {
    let (fx, env, db, _) = setup();
    let old = collation_class(&fx, "test/hooks/Old");
    let new = collation_class(&fx, "test/hooks/New");
    for class in [&old, &new] {
        let name = env.new_string("C");
        fx.bridge
            .create_collation(&env, Some(db), Some(name), SQLITE_UTF8, Some(env.alloc_plain(class)));
    }
    assert_eq!(fx.rt.calls_to(&old, "xDestroy"), 1);
    assert_eq!(fx.rt.calls_to(&new, "xDestroy"), 0);
}

/// Test: collation_needed callback for an unknown collation
/// Expected: Callback gets the connection wrapper and the collation name
#[test]
fn test_collation_needed_arguments() {
    let (fx, env, db, ptr) = setup();
    let asked: Arc<Mutex<Vec<String>>> = Arc::default();
    let seen = asked.clone();
    let class = fx.rt.callback_class(
        "test/hooks/Needed",
        &fx.hook_sig(HookKind::CollationNeeded),
        move |env, args| {
            if let [Value::Object(conn), Value::Int(enc), Value::Object(Some(name))] = args {
                assert!(env.is_same_object(*conn, Some(db)));
                assert_eq!(*enc, SQLITE_UTF8);
                seen.lock().push(env.string_value(*name).unwrap_or_default());
            }
            Ok(Ret::Int(0))
        },
    );
    fx.bridge
        .set_callback(&env, Some(db), HookKind::CollationNeeded, 0, Some(env.alloc_plain(&class)));

    fx.engine().fire_collation_needed(ptr, "nocase2");

    assert_eq!(*asked.lock(), vec!["nocase2".to_string()]);
}

// =============================================================================
// GLOBAL LOG HOOK
// =============================================================================

/// Test: config_log install, rebind, fire, remove
/// Expected: Messages reach the callback; rebinding is free; removal disables
#[test]
fn test_config_log_hook() {
    let (fx, env, _, _) = setup();
    let got: Arc<Mutex<Vec<(i32, String)>>> = Arc::default();
    let seen = got.clone();
    let class = fx.rt.callback_class(
        "test/hooks/Log",
        &fx.hook_sig(HookKind::ConfigLog),
        move |env, args| {
            if let [Value::Int(code), Value::Object(Some(msg))] = args {
                seen.lock().push((*code, env.string_value(*msg).unwrap_or_default()));
            }
            Ok(Ret::Void)
        },
    );
    let h = env.alloc_plain(&class);

    assert_eq!(fx.bridge.config_log(&env, Some(h)), codes::SQLITE_OK);
    let globals = fx.rt.global_ref_count();
    assert_eq!(fx.bridge.config_log(&env, Some(h)), codes::SQLITE_OK);
    assert_eq!(fx.rt.global_ref_count(), globals);
    assert!(fx.engine().log_enabled());

    fx.engine().fire_log(28, "recovered 3 frames");
    assert_eq!(*got.lock(), vec![(28, "recovered 3 frames".to_string())]);

    assert_eq!(fx.bridge.config_log(&env, None), codes::SQLITE_OK);
    assert!(!fx.engine().log_enabled());
    assert_eq!(fx.rt.global_ref_count(), globals - 1);
}

//! Exported `native` methods of `org.sqlite.jni.capi.CApi`
//!
//! Each export unwraps its `JObject` arguments into handles and forwards to
//! the matching [`sqlbridge_core::Bridge`] entry point. [`NATIVES`] lists every method
//! with its exported symbol.

use jni::objects::{JByteArray, JClass, JObject, JString};
use jni::sys::{jboolean, jint, JNI_FALSE, JNI_TRUE};
use jni::JNIEnv;
use sqlbridge_core::{codes, HookKind, ObjRef};

use crate::vm::entry;
use crate::BRIDGE;

/// (method name, exported symbol) for every native method
pub const NATIVES: &[(&str, &str)] = &[
    ("sqlite3_open_v2", "Java_org_sqlite_jni_capi_CApi_sqlite3_1open_1v2"),
    ("sqlite3_close", "Java_org_sqlite_jni_capi_CApi_sqlite3_1close"),
    ("sqlite3_close_v2", "Java_org_sqlite_jni_capi_CApi_sqlite3_1close_1v2"),
    ("sqlite3_errmsg", "Java_org_sqlite_jni_capi_CApi_sqlite3_1errmsg"),
    ("sqlite3_prepare_v3", "Java_org_sqlite_jni_capi_CApi_sqlite3_1prepare_1v3"),
    ("sqlite3_step", "Java_org_sqlite_jni_capi_CApi_sqlite3_1step"),
    ("sqlite3_finalize", "Java_org_sqlite_jni_capi_CApi_sqlite3_1finalize"),
    ("sqlite3_busy_handler", "Java_org_sqlite_jni_capi_CApi_sqlite3_1busy_1handler"),
    ("sqlite3_busy_timeout", "Java_org_sqlite_jni_capi_CApi_sqlite3_1busy_1timeout"),
    ("sqlite3_progress_handler", "Java_org_sqlite_jni_capi_CApi_sqlite3_1progress_1handler"),
    ("sqlite3_commit_hook", "Java_org_sqlite_jni_capi_CApi_sqlite3_1commit_1hook"),
    ("sqlite3_rollback_hook", "Java_org_sqlite_jni_capi_CApi_sqlite3_1rollback_1hook"),
    ("sqlite3_update_hook", "Java_org_sqlite_jni_capi_CApi_sqlite3_1update_1hook"),
    ("sqlite3_preupdate_hook", "Java_org_sqlite_jni_capi_CApi_sqlite3_1preupdate_1hook"),
    ("sqlite3_trace_v2", "Java_org_sqlite_jni_capi_CApi_sqlite3_1trace_1v2"),
    ("sqlite3_set_authorizer", "Java_org_sqlite_jni_capi_CApi_sqlite3_1set_1authorizer"),
    ("sqlite3_collation_needed", "Java_org_sqlite_jni_capi_CApi_sqlite3_1collation_1needed"),
    ("sqlite3_create_collation", "Java_org_sqlite_jni_capi_CApi_sqlite3_1create_1collation"),
    ("sqlite3_create_function", "Java_org_sqlite_jni_capi_CApi_sqlite3_1create_1function"),
    ("sqlite3_auto_extension", "Java_org_sqlite_jni_capi_CApi_sqlite3_1auto_1extension"),
    (
        "sqlite3_cancel_auto_extension",
        "Java_org_sqlite_jni_capi_CApi_sqlite3_1cancel_1auto_1extension",
    ),
    (
        "sqlite3_reset_auto_extension",
        "Java_org_sqlite_jni_capi_CApi_sqlite3_1reset_1auto_1extension",
    ),
    (
        "sqlite3_config__CONFIG_LOG",
        "Java_org_sqlite_jni_capi_CApi_sqlite3_1config_1_1CONFIG_1LOG",
    ),
    ("sqlite3_db_config", "Java_org_sqlite_jni_capi_CApi_sqlite3_1db_1config"),
    ("sqlite3_shutdown", "Java_org_sqlite_jni_capi_CApi_sqlite3_1shutdown"),
    (
        "sqlite3_java_uncache_thread",
        "Java_org_sqlite_jni_capi_CApi_sqlite3_1java_1uncache_1thread",
    ),
    (
        "sqlite3_jni_internal_details",
        "Java_org_sqlite_jni_capi_CApi_sqlite3_1jni_1internal_1details",
    ),
];

fn obj(o: &JObject) -> Option<ObjRef> {
    ObjRef::from_raw(o.as_raw() as usize)
}

fn jobj<'local>(o: Option<ObjRef>) -> JObject<'local> {
    match o {
        Some(o) => unsafe { JObject::from_raw(o.as_raw() as _) },
        None => JObject::null(),
    }
}

fn jbool(b: bool) -> jboolean {
    if b {
        JNI_TRUE
    } else {
        JNI_FALSE
    }
}

// ============================================================================
// CONNECTIONS AND STATEMENTS
// ============================================================================

#[no_mangle]
pub extern "system" fn Java_org_sqlite_jni_capi_CApi_sqlite3_1open_1v2<'local>(
    env: JNIEnv<'local>,
    _class: JClass<'local>,
    filename: JString<'local>,
    out_db: JObject<'local>,
    flags: jint,
    vfs: JString<'local>,
) -> jint {
    entry(env, "sqlite3_open_v2", codes::SQLITE_ERROR, |env| {
        BRIDGE.open(env, obj(&filename), flags, obj(&vfs), obj(&out_db))
    })
}

#[no_mangle]
pub extern "system" fn Java_org_sqlite_jni_capi_CApi_sqlite3_1close<'local>(
    env: JNIEnv<'local>,
    _class: JClass<'local>,
    db: JObject<'local>,
) -> jint {
    entry(env, "sqlite3_close", codes::SQLITE_ERROR, |env| {
        BRIDGE.close(env, obj(&db), false)
    })
}

#[no_mangle]
pub extern "system" fn Java_org_sqlite_jni_capi_CApi_sqlite3_1close_1v2<'local>(
    env: JNIEnv<'local>,
    _class: JClass<'local>,
    db: JObject<'local>,
) -> jint {
    entry(env, "sqlite3_close_v2", codes::SQLITE_ERROR, |env| {
        BRIDGE.close(env, obj(&db), true)
    })
}

#[no_mangle]
pub extern "system" fn Java_org_sqlite_jni_capi_CApi_sqlite3_1errmsg<'local>(
    env: JNIEnv<'local>,
    _class: JClass<'local>,
    db: JObject<'local>,
) -> JString<'local> {
    entry(env, "sqlite3_errmsg", JString::from(JObject::null()), |env| {
        JString::from(jobj(BRIDGE.errmsg(env, obj(&db))))
    })
}

#[no_mangle]
pub extern "system" fn Java_org_sqlite_jni_capi_CApi_sqlite3_1prepare_1v3<'local>(
    env: JNIEnv<'local>,
    _class: JClass<'local>,
    db: JObject<'local>,
    sql: JByteArray<'local>,
    prep_flags: jint,
    out_stmt: JObject<'local>,
    out_tail: JObject<'local>,
) -> jint {
    entry(env, "sqlite3_prepare_v3", codes::SQLITE_ERROR, |env| {
        BRIDGE.prepare(
            env,
            obj(&db),
            obj(&sql),
            prep_flags as u32,
            obj(&out_stmt),
            obj(&out_tail),
        )
    })
}

#[no_mangle]
pub extern "system" fn Java_org_sqlite_jni_capi_CApi_sqlite3_1step<'local>(
    env: JNIEnv<'local>,
    _class: JClass<'local>,
    stmt: JObject<'local>,
) -> jint {
    entry(env, "sqlite3_step", codes::SQLITE_ERROR, |env| {
        BRIDGE.step(env, obj(&stmt))
    })
}

#[no_mangle]
pub extern "system" fn Java_org_sqlite_jni_capi_CApi_sqlite3_1finalize<'local>(
    env: JNIEnv<'local>,
    _class: JClass<'local>,
    stmt: JObject<'local>,
) -> jint {
    entry(env, "sqlite3_finalize", codes::SQLITE_ERROR, |env| {
        BRIDGE.finalize(env, obj(&stmt))
    })
}

// ============================================================================
// CONNECTION HOOKS
// ============================================================================

#[no_mangle]
pub extern "system" fn Java_org_sqlite_jni_capi_CApi_sqlite3_1busy_1handler<'local>(
    env: JNIEnv<'local>,
    _class: JClass<'local>,
    db: JObject<'local>,
    handler: JObject<'local>,
) -> jint {
    entry(env, "sqlite3_busy_handler", codes::SQLITE_ERROR, |env| {
        BRIDGE.set_callback(env, obj(&db), HookKind::Busy, 0, obj(&handler))
    })
}

#[no_mangle]
pub extern "system" fn Java_org_sqlite_jni_capi_CApi_sqlite3_1busy_1timeout<'local>(
    env: JNIEnv<'local>,
    _class: JClass<'local>,
    db: JObject<'local>,
    ms: jint,
) -> jint {
    entry(env, "sqlite3_busy_timeout", codes::SQLITE_ERROR, |env| {
        BRIDGE.busy_timeout(env, obj(&db), ms)
    })
}

#[no_mangle]
pub extern "system" fn Java_org_sqlite_jni_capi_CApi_sqlite3_1progress_1handler<'local>(
    env: JNIEnv<'local>,
    _class: JClass<'local>,
    db: JObject<'local>,
    n_ops: jint,
    handler: JObject<'local>,
) {
    entry(env, "sqlite3_progress_handler", (), |env| {
        BRIDGE.set_callback(env, obj(&db), HookKind::Progress, n_ops, obj(&handler));
    })
}

#[no_mangle]
pub extern "system" fn Java_org_sqlite_jni_capi_CApi_sqlite3_1commit_1hook<'local>(
    env: JNIEnv<'local>,
    _class: JClass<'local>,
    db: JObject<'local>,
    hook: JObject<'local>,
) -> JObject<'local> {
    entry(env, "sqlite3_commit_hook", JObject::null(), |env| {
        jobj(BRIDGE.swap_callback(env, obj(&db), HookKind::Commit, obj(&hook)))
    })
}

#[no_mangle]
pub extern "system" fn Java_org_sqlite_jni_capi_CApi_sqlite3_1rollback_1hook<'local>(
    env: JNIEnv<'local>,
    _class: JClass<'local>,
    db: JObject<'local>,
    hook: JObject<'local>,
) -> JObject<'local> {
    entry(env, "sqlite3_rollback_hook", JObject::null(), |env| {
        jobj(BRIDGE.swap_callback(env, obj(&db), HookKind::Rollback, obj(&hook)))
    })
}

#[no_mangle]
pub extern "system" fn Java_org_sqlite_jni_capi_CApi_sqlite3_1update_1hook<'local>(
    env: JNIEnv<'local>,
    _class: JClass<'local>,
    db: JObject<'local>,
    hook: JObject<'local>,
) -> JObject<'local> {
    entry(env, "sqlite3_update_hook", JObject::null(), |env| {
        jobj(BRIDGE.swap_callback(env, obj(&db), HookKind::Update, obj(&hook)))
    })
}

#[no_mangle]
pub extern "system" fn Java_org_sqlite_jni_capi_CApi_sqlite3_1preupdate_1hook<'local>(
    env: JNIEnv<'local>,
    _class: JClass<'local>,
    db: JObject<'local>,
    hook: JObject<'local>,
) -> JObject<'local> {
    entry(env, "sqlite3_preupdate_hook", JObject::null(), |env| {
        jobj(BRIDGE.swap_callback(env, obj(&db), HookKind::PreUpdate, obj(&hook)))
    })
}

#[no_mangle]
pub extern "system" fn Java_org_sqlite_jni_capi_CApi_sqlite3_1trace_1v2<'local>(
    env: JNIEnv<'local>,
    _class: JClass<'local>,
    db: JObject<'local>,
    mask: jint,
    tracer: JObject<'local>,
) -> jint {
    entry(env, "sqlite3_trace_v2", codes::SQLITE_ERROR, |env| {
        BRIDGE.set_callback(env, obj(&db), HookKind::Trace, mask, obj(&tracer))
    })
}

#[no_mangle]
pub extern "system" fn Java_org_sqlite_jni_capi_CApi_sqlite3_1set_1authorizer<'local>(
    env: JNIEnv<'local>,
    _class: JClass<'local>,
    db: JObject<'local>,
    authorizer: JObject<'local>,
) -> jint {
    entry(env, "sqlite3_set_authorizer", codes::SQLITE_ERROR, |env| {
        BRIDGE.set_callback(env, obj(&db), HookKind::Authorizer, 0, obj(&authorizer))
    })
}

#[no_mangle]
pub extern "system" fn Java_org_sqlite_jni_capi_CApi_sqlite3_1collation_1needed<'local>(
    env: JNIEnv<'local>,
    _class: JClass<'local>,
    db: JObject<'local>,
    hook: JObject<'local>,
) -> jint {
    entry(env, "sqlite3_collation_needed", codes::SQLITE_ERROR, |env| {
        BRIDGE.set_callback(env, obj(&db), HookKind::CollationNeeded, 0, obj(&hook))
    })
}

#[no_mangle]
pub extern "system" fn Java_org_sqlite_jni_capi_CApi_sqlite3_1create_1collation<'local>(
    env: JNIEnv<'local>,
    _class: JClass<'local>,
    db: JObject<'local>,
    name: JString<'local>,
    enc: jint,
    collation: JObject<'local>,
) -> jint {
    entry(env, "sqlite3_create_collation", codes::SQLITE_ERROR, |env| {
        BRIDGE.create_collation(env, obj(&db), obj(&name), enc, obj(&collation))
    })
}

#[no_mangle]
pub extern "system" fn Java_org_sqlite_jni_capi_CApi_sqlite3_1create_1function<'local>(
    env: JNIEnv<'local>,
    _class: JClass<'local>,
    db: JObject<'local>,
    name: JString<'local>,
    n_arg: jint,
    flags: jint,
    function: JObject<'local>,
) -> jint {
    entry(env, "sqlite3_create_function", codes::SQLITE_ERROR, |env| {
        BRIDGE.create_function(env, obj(&db), obj(&name), n_arg, flags, obj(&function))
    })
}

#[no_mangle]
pub extern "system" fn Java_org_sqlite_jni_capi_CApi_sqlite3_1db_1config<'local>(
    env: JNIEnv<'local>,
    _class: JClass<'local>,
    db: JObject<'local>,
    op: jint,
    value: JString<'local>,
) -> jint {
    entry(env, "sqlite3_db_config", codes::SQLITE_ERROR, |env| {
        BRIDGE.db_config(env, obj(&db), op, obj(&value))
    })
}

// ============================================================================
// PROCESS-WIDE
// ============================================================================

#[no_mangle]
pub extern "system" fn Java_org_sqlite_jni_capi_CApi_sqlite3_1auto_1extension<'local>(
    env: JNIEnv<'local>,
    _class: JClass<'local>,
    ext: JObject<'local>,
) -> jint {
    entry(env, "sqlite3_auto_extension", codes::SQLITE_ERROR, |env| {
        BRIDGE.auto_extension(env, obj(&ext))
    })
}

#[no_mangle]
pub extern "system" fn Java_org_sqlite_jni_capi_CApi_sqlite3_1cancel_1auto_1extension<'local>(
    env: JNIEnv<'local>,
    _class: JClass<'local>,
    ext: JObject<'local>,
) -> jboolean {
    entry(env, "sqlite3_cancel_auto_extension", JNI_FALSE, |env| {
        jbool(BRIDGE.cancel_auto_extension(env, obj(&ext)))
    })
}

#[no_mangle]
pub extern "system" fn Java_org_sqlite_jni_capi_CApi_sqlite3_1reset_1auto_1extension<'local>(
    env: JNIEnv<'local>,
    _class: JClass<'local>,
) {
    entry(env, "sqlite3_reset_auto_extension", (), |env| {
        BRIDGE.reset_auto_extension(env)
    })
}

#[no_mangle]
pub extern "system" fn Java_org_sqlite_jni_capi_CApi_sqlite3_1config_1_1CONFIG_1LOG<'local>(
    env: JNIEnv<'local>,
    _class: JClass<'local>,
    logger: JObject<'local>,
) -> jint {
    entry(env, "sqlite3_config(SQLITE_CONFIG_LOG)", codes::SQLITE_ERROR, |env| {
        BRIDGE.config_log(env, obj(&logger))
    })
}

#[no_mangle]
pub extern "system" fn Java_org_sqlite_jni_capi_CApi_sqlite3_1shutdown<'local>(
    env: JNIEnv<'local>,
    _class: JClass<'local>,
) -> jint {
    entry(env, "sqlite3_shutdown", codes::SQLITE_ERROR, |env| {
        BRIDGE.shutdown(env)
    })
}

#[no_mangle]
pub extern "system" fn Java_org_sqlite_jni_capi_CApi_sqlite3_1java_1uncache_1thread<'local>(
    env: JNIEnv<'local>,
    _class: JClass<'local>,
) -> jboolean {
    entry(env, "sqlite3_java_uncache_thread", JNI_FALSE, |env| {
        jbool(BRIDGE.uncache_thread(env))
    })
}

#[no_mangle]
pub extern "system" fn Java_org_sqlite_jni_capi_CApi_sqlite3_1jni_1internal_1details<'local>(
    env: JNIEnv<'local>,
    _class: JClass<'local>,
) {
    entry(env, "sqlite3_jni_internal_details", (), |_| {
        BRIDGE.internal_details();
    })
}

//! [`NativeEngine`] over libsqlite3
//!
//! Every registration passes the `sqlite3*` (or a boxed binding) as the
//! callback's user data; the trampolines below recover it and hand the
//! event to the process-wide bridge on the calling thread.

use std::borrow::Cow;
use std::ffi::{CStr, CString};
use std::ptr;
use std::slice;

use libc::{c_char, c_int, c_uint, c_void};
use libsqlite3_sys as ffi;
use sqlbridge_core::engine::{
    ContextPtr, SQLITE_DBCONFIG_MAINDBNAME, SQLITE_TRACE_CLOSE, SQLITE_TRACE_PROFILE,
    SQLITE_TRACE_ROW, SQLITE_TRACE_STMT,
};
use sqlbridge_core::{
    codes, log_debug, log_warn, BridgeError, DbPtr, HookKind, HookSlot, NativeEngine, Prepared, StmtPtr,
    TraceEvent, UdfBinding, UdfKind, UdfMethod,
};

use crate::vm;
use crate::BRIDGE;

const SQLITE_TOOBIG: c_int = 18;
const SQLITE_CONFIG_LOG: c_int = 16;

type EntryPoint =
    unsafe extern "C" fn(*mut ffi::sqlite3, *mut *mut c_char, *const ffi::sqlite3_api_routines) -> c_int;
type LogCallback = unsafe extern "C" fn(*mut c_void, c_int, *const c_char);

#[allow(clashing_extern_declarations)]
extern "C" {
    // Declared with the entry point's real signature rather than `fn()`
    fn sqlite3_auto_extension(entry: Option<EntryPoint>) -> c_int;
}

fn handle(db: DbPtr) -> *mut ffi::sqlite3 {
    db as *mut ffi::sqlite3
}

/// Borrow a C string from SQLite
unsafe fn text<'a>(p: *const c_char) -> Option<Cow<'a, str>> {
    if p.is_null() {
        None
    } else {
        Some(CStr::from_ptr(p).to_string_lossy())
    }
}

/// Copy `s` into memory SQLite will free
unsafe fn sqlite_strdup(s: &str) -> *mut c_char {
    let p = ffi::sqlite3_malloc64((s.len() + 1) as u64) as *mut u8;
    if p.is_null() {
        return ptr::null_mut();
    }
    ptr::copy_nonoverlapping(s.as_ptr(), p, s.len());
    *p.add(s.len()) = 0;
    p as *mut c_char
}

unsafe fn bytes<'a>(p: *const c_void, n: c_int) -> &'a [u8] {
    if p.is_null() || n <= 0 {
        &[]
    } else {
        slice::from_raw_parts(p as *const u8, n as usize)
    }
}

/// The system SQLite library, one instance per process
#[derive(Debug, Default)]
pub struct Sqlite3Engine;

impl NativeEngine for Sqlite3Engine {
    fn open(&self, filename: &str, flags: i32, vfs: Option<&str>) -> (i32, DbPtr) {
        let Ok(filename) = CString::new(filename) else {
            return (codes::SQLITE_MISUSE, 0);
        };
        let vfs = match vfs.map(CString::new).transpose() {
            Ok(v) => v,
            Err(_) => return (codes::SQLITE_MISUSE, 0),
        };
        let mut db = ptr::null_mut();
        let rc = unsafe {
            ffi::sqlite3_open_v2(
                filename.as_ptr(),
                &mut db,
                flags,
                vfs.as_ref().map_or(ptr::null(), |v| v.as_ptr()),
            )
        };
        (rc, db as DbPtr)
    }

    fn close(&self, db: DbPtr, v2: bool) -> i32 {
        unsafe {
            if v2 {
                ffi::sqlite3_close_v2(handle(db))
            } else {
                ffi::sqlite3_close(handle(db))
            }
        }
    }

    fn errmsg(&self, db: DbPtr) -> Option<String> {
        unsafe { text(ffi::sqlite3_errmsg(handle(db))).map(Cow::into_owned) }
    }

    fn prepare(&self, db: DbPtr, sql: &[u8], prep_flags: u32) -> Prepared {
        let Ok(len) = c_int::try_from(sql.len()) else {
            return Prepared {
                rc: SQLITE_TOOBIG,
                ..Prepared::default()
            };
        };
        let mut stmt = ptr::null_mut();
        let mut tail: *const c_char = ptr::null();
        let rc = unsafe {
            ffi::sqlite3_prepare_v3(
                handle(db),
                sql.as_ptr() as *const c_char,
                len,
                prep_flags as c_uint,
                &mut stmt,
                &mut tail,
            )
        };
        let tail = if tail.is_null() {
            sql.len()
        } else {
            tail as usize - sql.as_ptr() as usize
        };
        Prepared {
            rc,
            stmt: stmt as StmtPtr,
            tail,
        }
    }

    fn step(&self, stmt: StmtPtr) -> i32 {
        unsafe { ffi::sqlite3_step(stmt as *mut ffi::sqlite3_stmt) }
    }

    fn finalize(&self, stmt: StmtPtr) -> i32 {
        unsafe { ffi::sqlite3_finalize(stmt as *mut ffi::sqlite3_stmt) }
    }

    fn set_hook(&self, db: DbPtr, kind: HookKind, enable: bool, arg: i32) -> i32 {
        let h = handle(db);
        let p = h as *mut c_void;
        let null = ptr::null_mut();
        unsafe {
            match kind {
                HookKind::Busy if enable => ffi::sqlite3_busy_handler(h, Some(busy_trampoline), p),
                HookKind::Busy => ffi::sqlite3_busy_handler(h, None, null),
                HookKind::Progress => {
                    if enable {
                        ffi::sqlite3_progress_handler(h, arg, Some(progress_trampoline), p);
                    } else {
                        ffi::sqlite3_progress_handler(h, 0, None, null);
                    }
                    codes::SQLITE_OK
                }
                HookKind::Commit => {
                    if enable {
                        ffi::sqlite3_commit_hook(h, Some(commit_trampoline), p);
                    } else {
                        ffi::sqlite3_commit_hook(h, None, null);
                    }
                    codes::SQLITE_OK
                }
                HookKind::Rollback => {
                    if enable {
                        ffi::sqlite3_rollback_hook(h, Some(rollback_trampoline), p);
                    } else {
                        ffi::sqlite3_rollback_hook(h, None, null);
                    }
                    codes::SQLITE_OK
                }
                HookKind::Update => {
                    if enable {
                        ffi::sqlite3_update_hook(h, Some(update_trampoline), p);
                    } else {
                        ffi::sqlite3_update_hook(h, None, null);
                    }
                    codes::SQLITE_OK
                }
                HookKind::PreUpdate => set_preupdate_hook(h, enable),
                HookKind::Trace if enable => {
                    ffi::sqlite3_trace_v2(h, arg as c_uint, Some(trace_trampoline), p)
                }
                HookKind::Trace => ffi::sqlite3_trace_v2(h, 0, None, null),
                HookKind::Authorizer if enable => {
                    ffi::sqlite3_set_authorizer(h, Some(authorizer_trampoline), p)
                }
                HookKind::Authorizer => ffi::sqlite3_set_authorizer(h, None, null),
                HookKind::CollationNeeded if enable => {
                    ffi::sqlite3_collation_needed(h, p, Some(collation_needed_trampoline))
                }
                HookKind::CollationNeeded => ffi::sqlite3_collation_needed(h, null, None),
                HookKind::Collation | HookKind::AutoExtension | HookKind::ConfigLog => {
                    codes::SQLITE_MISUSE
                }
            }
        }
    }

    fn busy_timeout(&self, db: DbPtr, ms: i32) -> i32 {
        unsafe { ffi::sqlite3_busy_timeout(handle(db), ms) }
    }

    fn create_function(
        &self,
        db: DbPtr,
        name: &str,
        n_arg: i32,
        flags: i32,
        binding: Box<UdfBinding>,
    ) -> i32 {
        let Ok(cname) = CString::new(name) else {
            vm::callback("xDestroy", (), |env| BRIDGE.on_function_destroy(env, binding));
            return codes::SQLITE_MISUSE;
        };
        let kind = binding.kind();
        let p = Box::into_raw(binding) as *mut c_void;
        let h = handle(db);
        // SQLite runs x_destroy itself when registration fails
        unsafe {
            match kind {
                UdfKind::Scalar => ffi::sqlite3_create_function_v2(
                    h,
                    cname.as_ptr(),
                    n_arg,
                    flags,
                    p,
                    Some(x_func),
                    None,
                    None,
                    Some(x_destroy),
                ),
                UdfKind::Aggregate => ffi::sqlite3_create_function_v2(
                    h,
                    cname.as_ptr(),
                    n_arg,
                    flags,
                    p,
                    None,
                    Some(x_step),
                    Some(x_final),
                    Some(x_destroy),
                ),
                UdfKind::Window => ffi::sqlite3_create_window_function(
                    h,
                    cname.as_ptr(),
                    n_arg,
                    flags,
                    p,
                    Some(x_step),
                    Some(x_final),
                    Some(x_value),
                    Some(x_inverse),
                    Some(x_destroy),
                ),
            }
        }
    }

    fn create_collation(
        &self,
        db: DbPtr,
        name: &str,
        enc: i32,
        binding: Box<HookSlot>,
    ) -> Result<(), (i32, Box<HookSlot>)> {
        let Ok(cname) = CString::new(name) else {
            return Err((codes::SQLITE_MISUSE, binding));
        };
        let p = Box::into_raw(binding);
        let rc = unsafe {
            ffi::sqlite3_create_collation_v2(
                handle(db),
                cname.as_ptr(),
                enc,
                p as *mut c_void,
                Some(collation_trampoline),
                Some(collation_destroy_trampoline),
            )
        };
        if rc == codes::SQLITE_OK {
            Ok(())
        } else {
            // The destructor does not run on failure; ownership comes back
            Err((rc, unsafe { Box::from_raw(p) }))
        }
    }

    fn result_error(&self, ctx: ContextPtr, msg: &str) {
        let len = c_int::try_from(msg.len()).unwrap_or(c_int::MAX);
        unsafe {
            ffi::sqlite3_result_error(ctx as *mut ffi::sqlite3_context, msg.as_ptr() as *const c_char, len)
        }
    }

    fn result_error_nomem(&self, ctx: ContextPtr) {
        unsafe { ffi::sqlite3_result_error_nomem(ctx as *mut ffi::sqlite3_context) }
    }

    fn aggregate_context_key(&self, ctx: ContextPtr, allocate: bool) -> i64 {
        let n = if allocate { 8 } else { 0 };
        unsafe { ffi::sqlite3_aggregate_context(ctx as *mut ffi::sqlite3_context, n) as i64 }
    }

    fn install_auto_extension_runner(&self) -> i32 {
        unsafe { sqlite3_auto_extension(Some(auto_extension_runner)) }
    }

    fn db_config_main_name(&self, db: DbPtr, name: &CStr) -> i32 {
        unsafe { ffi::sqlite3_db_config(handle(db), SQLITE_DBCONFIG_MAINDBNAME, name.as_ptr()) }
    }

    fn config_log(&self, enable: bool) -> i32 {
        let callback: *const c_void = if enable {
            log_trampoline as LogCallback as *const c_void
        } else {
            ptr::null()
        };
        let rc = unsafe { ffi::sqlite3_config(SQLITE_CONFIG_LOG, callback, ptr::null_mut::<c_void>()) };
        if rc != codes::SQLITE_OK {
            log_warn!("SQLITE_CONFIG_LOG rejected with {}; library already initialized?", rc);
        }
        rc
    }

    fn shutdown(&self) -> i32 {
        unsafe { ffi::sqlite3_shutdown() }
    }
}

#[cfg(feature = "preupdate_hook")]
unsafe fn set_preupdate_hook(h: *mut ffi::sqlite3, enable: bool) -> i32 {
    if enable {
        ffi::sqlite3_preupdate_hook(h, Some(preupdate_trampoline), h as *mut c_void);
    } else {
        ffi::sqlite3_preupdate_hook(h, None, ptr::null_mut());
    }
    codes::SQLITE_OK
}

#[cfg(not(feature = "preupdate_hook"))]
unsafe fn set_preupdate_hook(_h: *mut ffi::sqlite3, enable: bool) -> i32 {
    if !enable {
        return codes::SQLITE_OK;
    }
    log_warn!("preupdate hook requested but SQLite was built without it");
    codes::SQLITE_ERROR
}

// ============================================================================
// CONNECTION HOOK TRAMPOLINES
// ============================================================================

unsafe extern "C" fn busy_trampoline(p: *mut c_void, n: c_int) -> c_int {
    vm::callback("busy", 0, |env| BRIDGE.on_busy(env, p as DbPtr, n))
}

unsafe extern "C" fn progress_trampoline(p: *mut c_void) -> c_int {
    vm::callback("progress", 0, |env| BRIDGE.on_progress(env, p as DbPtr))
}

unsafe extern "C" fn commit_trampoline(p: *mut c_void) -> c_int {
    vm::callback("commit", 0, |env| BRIDGE.on_commit(env, p as DbPtr))
}

unsafe extern "C" fn rollback_trampoline(p: *mut c_void) {
    vm::callback("rollback", (), |env| BRIDGE.on_rollback(env, p as DbPtr))
}

unsafe extern "C" fn update_trampoline(
    p: *mut c_void,
    op: c_int,
    db_name: *const c_char,
    table: *const c_char,
    rowid: ffi::sqlite3_int64,
) {
    let db_name = text(db_name).unwrap_or_default();
    let table = text(table).unwrap_or_default();
    vm::callback("update", (), |env| {
        BRIDGE.on_update(env, p as DbPtr, op, &db_name, &table, rowid)
    })
}

#[cfg(feature = "preupdate_hook")]
unsafe extern "C" fn preupdate_trampoline(
    p: *mut c_void,
    _db: *mut ffi::sqlite3,
    op: c_int,
    db_name: *const c_char,
    table: *const c_char,
    key1: ffi::sqlite3_int64,
    key2: ffi::sqlite3_int64,
) {
    let db_name = text(db_name).unwrap_or_default();
    let table = text(table).unwrap_or_default();
    vm::callback("preupdate", (), |env| {
        BRIDGE.on_preupdate(env, p as DbPtr, op, &db_name, &table, key1, key2)
    })
}

unsafe extern "C" fn trace_trampoline(mask: c_uint, ctx: *mut c_void, p: *mut c_void, x: *mut c_void) -> c_int {
    let db = ctx as DbPtr;
    let stmt = p as StmtPtr;
    match mask {
        SQLITE_TRACE_STMT => {
            let sql = text(x as *const c_char).unwrap_or_default();
            vm::callback("trace", 0, |env| {
                BRIDGE.on_trace(env, db, TraceEvent::Stmt { stmt, sql: &sql })
            })
        }
        SQLITE_TRACE_PROFILE => {
            let nanos = if x.is_null() { 0 } else { *(x as *const i64) };
            vm::callback("trace", 0, |env| {
                BRIDGE.on_trace(env, db, TraceEvent::Profile { stmt, nanos })
            })
        }
        SQLITE_TRACE_ROW => vm::callback("trace", 0, |env| BRIDGE.on_trace(env, db, TraceEvent::Row { stmt })),
        SQLITE_TRACE_CLOSE => vm::callback("trace", 0, |env| BRIDGE.on_trace(env, db, TraceEvent::Close)),
        other => {
            log_debug!("ignoring trace event {:#x}", other);
            0
        }
    }
}

unsafe extern "C" fn authorizer_trampoline(
    p: *mut c_void,
    action: c_int,
    a1: *const c_char,
    a2: *const c_char,
    a3: *const c_char,
    a4: *const c_char,
) -> c_int {
    let args = [text(a1), text(a2), text(a3), text(a4)];
    vm::callback("authorizer", codes::SQLITE_OK, |env| {
        BRIDGE.on_authorizer(
            env,
            p as DbPtr,
            action,
            [
                args[0].as_deref(),
                args[1].as_deref(),
                args[2].as_deref(),
                args[3].as_deref(),
            ],
        )
    })
}

unsafe extern "C" fn collation_needed_trampoline(
    p: *mut c_void,
    _db: *mut ffi::sqlite3,
    enc: c_int,
    name: *const c_char,
) {
    let name = text(name).unwrap_or_default();
    vm::callback("collation-needed", (), |env| {
        BRIDGE.on_collation_needed(env, p as DbPtr, enc, &name)
    })
}

unsafe extern "C" fn collation_trampoline(
    p: *mut c_void,
    n1: c_int,
    a: *const c_void,
    n2: c_int,
    b: *const c_void,
) -> c_int {
    let binding = &*(p as *const HookSlot);
    let (a, b) = (bytes(a, n1), bytes(b, n2));
    vm::callback("collation", 0, |env| BRIDGE.on_collation(env, binding, a, b))
}

unsafe extern "C" fn collation_destroy_trampoline(p: *mut c_void) {
    let binding = Box::from_raw(p as *mut HookSlot);
    vm::callback("collation xDestroy", (), |env| {
        BRIDGE.on_collation_destroy(env, binding)
    })
}

// ============================================================================
// SQL FUNCTION TRAMPOLINES
// ============================================================================

unsafe fn dispatch_function(
    ctx: *mut ffi::sqlite3_context,
    method: UdfMethod,
    argc: c_int,
    argv: *mut *mut ffi::sqlite3_value,
) {
    let binding = ffi::sqlite3_user_data(ctx) as *const UdfBinding;
    if binding.is_null() {
        return;
    }
    let argv: Vec<usize> = if argv.is_null() || argc <= 0 {
        Vec::new()
    } else {
        slice::from_raw_parts(argv, argc as usize)
            .iter()
            .map(|v| *v as usize)
            .collect()
    };
    let binding = &*binding;
    vm::callback(method.name(), (), |env| {
        BRIDGE.on_function(env, binding, method, ctx as ContextPtr, &argv)
    })
}

unsafe extern "C" fn x_func(ctx: *mut ffi::sqlite3_context, argc: c_int, argv: *mut *mut ffi::sqlite3_value) {
    dispatch_function(ctx, UdfMethod::Func, argc, argv)
}

unsafe extern "C" fn x_step(ctx: *mut ffi::sqlite3_context, argc: c_int, argv: *mut *mut ffi::sqlite3_value) {
    dispatch_function(ctx, UdfMethod::Step, argc, argv)
}

unsafe extern "C" fn x_final(ctx: *mut ffi::sqlite3_context) {
    dispatch_function(ctx, UdfMethod::Final, 0, ptr::null_mut())
}

unsafe extern "C" fn x_value(ctx: *mut ffi::sqlite3_context) {
    dispatch_function(ctx, UdfMethod::Value, 0, ptr::null_mut())
}

unsafe extern "C" fn x_inverse(ctx: *mut ffi::sqlite3_context, argc: c_int, argv: *mut *mut ffi::sqlite3_value) {
    dispatch_function(ctx, UdfMethod::Inverse, argc, argv)
}

unsafe extern "C" fn x_destroy(p: *mut c_void) {
    let binding = Box::from_raw(p as *mut UdfBinding);
    vm::callback("xDestroy", (), |env| BRIDGE.on_function_destroy(env, binding))
}

// ============================================================================
// PROCESS-WIDE TRAMPOLINES
// ============================================================================

unsafe extern "C" fn auto_extension_runner(
    db: *mut ffi::sqlite3,
    err: *mut *mut c_char,
    _api: *const ffi::sqlite3_api_routines,
) -> c_int {
    let panicked = Err(BridgeError::Error("auto-extension runner panicked".into()));
    match vm::callback("auto-extension", panicked, |env| {
        BRIDGE.on_auto_extension(env, db as DbPtr)
    }) {
        Ok(()) => codes::SQLITE_OK,
        Err(e) => {
            if !err.is_null() {
                *err = sqlite_strdup(&e.to_string());
            }
            e.code()
        }
    }
}

unsafe extern "C" fn log_trampoline(_p: *mut c_void, code: c_int, msg: *const c_char) {
    let msg = text(msg).unwrap_or_default();
    vm::callback("log", (), |env| BRIDGE.on_config_log(env, code, &msg))
}

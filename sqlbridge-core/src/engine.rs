// sqlbridge-core/src/engine.rs
//! Native engine abstraction
//!
//! [`NativeEngine`] is the slice of the SQLite C ABI the bridge drives
//! directly. Pointers cross it as plain addresses; `0` is the null pointer.
//!
//! ```text
//! NativeEngine trait
//!   ├── Sqlite3Engine (bindings/jni, libsqlite3-sys)
//!   └── MockEngine    (testing, scripted in-memory engine)
//! ```
//!
//! Callbacks flow the other way: an implementation routes every native
//! event to the matching `Bridge::on_*` method on the calling thread.

use std::ffi::CStr;

use crate::hooks::{HookKind, HookSlot};
use crate::udf::UdfBinding;

/// `sqlite3*`
pub type DbPtr = usize;
/// `sqlite3_stmt*`
pub type StmtPtr = usize;
/// `sqlite3_context*`
pub type ContextPtr = usize;
/// `sqlite3_value*`
pub type ValuePtr = usize;

pub const SQLITE_TRACE_STMT: u32 = 0x01;
pub const SQLITE_TRACE_PROFILE: u32 = 0x02;
pub const SQLITE_TRACE_ROW: u32 = 0x04;
pub const SQLITE_TRACE_CLOSE: u32 = 0x08;

pub const SQLITE_DBCONFIG_MAINDBNAME: i32 = 1000;

pub const SQLITE_UTF8: i32 = 1;

/// One `sqlite3_trace_v2()` event, decoded
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TraceEvent<'a> {
    Stmt { stmt: StmtPtr, sql: &'a str },
    Profile { stmt: StmtPtr, nanos: i64 },
    Row { stmt: StmtPtr },
    Close,
}

impl TraceEvent<'_> {
    pub fn mask(&self) -> u32 {
        match self {
            TraceEvent::Stmt { .. } => SQLITE_TRACE_STMT,
            TraceEvent::Profile { .. } => SQLITE_TRACE_PROFILE,
            TraceEvent::Row { .. } => SQLITE_TRACE_ROW,
            TraceEvent::Close => SQLITE_TRACE_CLOSE,
        }
    }

    pub fn stmt(&self) -> Option<StmtPtr> {
        match *self {
            TraceEvent::Stmt { stmt, .. }
            | TraceEvent::Profile { stmt, .. }
            | TraceEvent::Row { stmt } => Some(stmt),
            TraceEvent::Close => None,
        }
    }
}

/// Result of a prepare call
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Prepared {
    pub rc: i32,
    /// Null for an empty statement (only whitespace or comments)
    pub stmt: StmtPtr,
    /// Byte offset of the unconsumed SQL tail
    pub tail: usize,
}

pub trait NativeEngine: Send + Sync {
    /// `sqlite3_open_v2()`; the handle may be non-null even on failure
    fn open(&self, filename: &str, flags: i32, vfs: Option<&str>) -> (i32, DbPtr);

    /// `sqlite3_close()` or, with `v2`, `sqlite3_close_v2()`
    fn close(&self, db: DbPtr, v2: bool) -> i32;

    fn errmsg(&self, db: DbPtr) -> Option<String>;

    /// Attach a bridge-level error to the connection's error state
    ///
    /// Engines without such a facility return false and the bridge keeps
    /// the message itself.
    fn set_error_message(&self, _db: DbPtr, _code: i32, _msg: &str) -> bool {
        false
    }

    fn prepare(&self, db: DbPtr, sql: &[u8], prep_flags: u32) -> Prepared;

    fn step(&self, stmt: StmtPtr) -> i32;

    fn finalize(&self, stmt: StmtPtr) -> i32;

    /// Enable or disable native dispatch for a per-connection hook
    ///
    /// `arg` is the instruction count for [`HookKind::Progress`] and the
    /// event mask for [`HookKind::Trace`]; other kinds ignore it.
    fn set_hook(&self, db: DbPtr, kind: HookKind, enable: bool, arg: i32) -> i32;

    fn busy_timeout(&self, db: DbPtr, ms: i32) -> i32;

    /// Register a SQL function owning `binding`
    ///
    /// The binding reaches `Bridge::on_function_destroy` exactly once,
    /// including when registration fails.
    fn create_function(
        &self,
        db: DbPtr,
        name: &str,
        n_arg: i32,
        flags: i32,
        binding: Box<UdfBinding>,
    ) -> i32;

    /// Register a collation owning `binding`
    ///
    /// On failure the binding is handed back untouched.
    fn create_collation(
        &self,
        db: DbPtr,
        name: &str,
        enc: i32,
        binding: Box<HookSlot>,
    ) -> Result<(), (i32, Box<HookSlot>)>;

    fn result_error(&self, ctx: ContextPtr, msg: &str);

    fn result_error_nomem(&self, ctx: ContextPtr);

    /// Stable key of the per-aggregation storage; 0 if none exists
    ///
    /// With `allocate` the storage is created on first use.
    fn aggregate_context_key(&self, ctx: ContextPtr, allocate: bool) -> i64;

    /// Install the single native auto-extension runner
    fn install_auto_extension_runner(&self) -> i32;

    /// `SQLITE_DBCONFIG_MAINDBNAME`; `name` must outlive the connection
    fn db_config_main_name(&self, db: DbPtr, name: &CStr) -> i32;

    /// `SQLITE_CONFIG_LOG`, routed to `Bridge::on_config_log`
    fn config_log(&self, enable: bool) -> i32;

    fn shutdown(&self) -> i32;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_trace_event_masks() {
        assert_eq!(TraceEvent::Stmt { stmt: 1, sql: "x" }.mask(), SQLITE_TRACE_STMT);
        assert_eq!(TraceEvent::Close.mask(), SQLITE_TRACE_CLOSE);
        assert_eq!(TraceEvent::Row { stmt: 7 }.stmt(), Some(7));
        assert_eq!(TraceEvent::Close.stmt(), None);
    }
}

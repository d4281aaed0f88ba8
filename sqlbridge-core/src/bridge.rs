// sqlbridge-core/src/bridge.rs
//! Bridge facade
//!
//! [`Bridge`] owns every process-wide registry and exposes two surfaces:
//!
//! - managed-facing entry points (`open`, `prepare`, `commit_hook`, ...)
//!   taking wrapper objects and returning result codes, one per exported
//!   native method;
//! - native-facing dispatch (`on_busy`, `on_trace`, `on_function`, ...)
//!   called by the engine's trampolines when a registered event fires.
//!
//! No bridge lock is held while managed code runs. Hooks are invoked through
//! a call-local duplicate taken under the allocator lock.

use std::ffi::CString;

use parking_lot::Mutex;

use crate::auto_ext::AutoExtensionRegistry;
use crate::config::BridgeConfig;
use crate::connection::ConnectionAllocator;
use crate::engine::{
    ContextPtr, DbPtr, NativeEngine, StmtPtr, TraceEvent, ValuePtr, SQLITE_DBCONFIG_MAINDBNAME,
};
use crate::env_cache::{EnvCache, EnvRefs};
use crate::error::{codes, set_last_error, BridgeError, Result};
use crate::hooks::{HookKind, HookSlot, LocalHook};
use crate::metadata::{HandleKind, HandleMetadataCache};
use crate::metrics::Metrics;
use crate::refs::LocalRef;
use crate::runtime::{ManagedEnv, ObjRef, Ret, Value};
use crate::udf::{UdfBinding, UdfKind, UdfMethod, UdfOutcome};
use crate::{log_debug, log_info, log_warn};

pub struct Bridge<N: NativeEngine> {
    config: BridgeConfig,
    engine: N,
    metadata: HandleMetadataCache,
    envs: EnvCache,
    connections: ConnectionAllocator,
    auto_ext: AutoExtensionRegistry,
    log_hook: Mutex<HookSlot>,
    metrics: Metrics,
}

impl<N: NativeEngine> Bridge<N> {
    pub fn new(engine: N, config: BridgeConfig) -> Self {
        Bridge {
            metadata: HandleMetadataCache::new(config.clone()),
            envs: EnvCache::new(),
            connections: ConnectionAllocator::new(config.initial_connection_capacity),
            auto_ext: AutoExtensionRegistry::new(),
            log_hook: Mutex::new(HookSlot::default()),
            metrics: Metrics::new(config.metrics),
            engine,
            config,
        }
    }

    pub fn config(&self) -> &BridgeConfig {
        &self.config
    }

    pub fn engine(&self) -> &N {
        &self.engine
    }

    pub fn metadata(&self) -> &HandleMetadataCache {
        &self.metadata
    }

    pub fn env_cache(&self) -> &EnvCache {
        &self.envs
    }

    pub fn connections(&self) -> &ConnectionAllocator {
        &self.connections
    }

    pub fn auto_extensions(&self) -> &AutoExtensionRegistry {
        &self.auto_ext
    }

    pub fn metrics(&self) -> &Metrics {
        &self.metrics
    }

    fn refs<E: ManagedEnv + ?Sized>(&self, env: &E) -> EnvRefs {
        self.envs.for_current_thread(env, &self.metrics)
    }

    fn db_of<E: ManagedEnv + ?Sized>(&self, env: &E, db: Option<ObjRef>) -> DbPtr {
        self.metadata.read_address(env, db, HandleKind::Connection)
    }

    /// Attach `err` to the connection (if any) and the thread; returns its code
    fn record_error(&self, db: DbPtr, err: &BridgeError) -> i32 {
        let code = err.code();
        let msg = err.to_string();
        if db != 0 && !self.engine.set_error_message(db, code, &msg) {
            self.connections
                .with_native(db, |st| st.set_last_error(Some(msg.clone())));
        }
        set_last_error(&msg);
        code
    }

    fn callback_failed(&self, db: DbPtr, kind: HookKind, msg: &str) {
        log_warn!("{} hook threw: {}", kind.name(), msg);
        self.record_error(db, &BridgeError::CallbackThrew(msg.to_string()));
    }

    fn string_arg<E: ManagedEnv + ?Sized>(
        &self,
        env: &E,
        refs: &EnvRefs,
        s: Option<ObjRef>,
        what: &str,
    ) -> Result<String> {
        match s {
            Some(s) => refs.from_managed_string(env, s),
            None => Err(BridgeError::misuse(format!("{} must not be null", what))),
        }
    }

    // ========================================================================
    // CONNECTIONS AND STATEMENTS
    // ========================================================================

    /// Open a connection and store its wrapper in `out_db`
    ///
    /// The wrapper exists (with a null address) before the native open
    /// starts so auto-extensions running inside it can be handed the
    /// identical object.
    pub fn open<E: ManagedEnv + ?Sized>(
        &self,
        env: &E,
        filename: Option<ObjRef>,
        flags: i32,
        vfs: Option<ObjRef>,
        out_db: Option<ObjRef>,
    ) -> i32 {
        let Some(out) = out_db else {
            return self.record_error(0, &BridgeError::misuse("open requires an output pointer"));
        };
        let refs = self.refs(env);
        let filename = match self.string_arg(env, &refs, filename, "filename") {
            Ok(f) => f,
            Err(err) => return self.record_error(0, &err),
        };
        let vfs = match vfs.map(|v| refs.from_managed_string(env, v)).transpose() {
            Ok(v) => v,
            Err(err) => return self.record_error(0, &err),
        };

        let wrapper = match self.metadata.wrap(env, HandleKind::Connection, 0) {
            Ok(w) => LocalRef::new(env, w),
            Err(err) => return self.record_error(0, &err),
        };
        let key = match self
            .connections
            .allocate(env, 0, wrapper.get(), &self.metrics)
        {
            Ok(key) => key,
            Err(err) => return self.record_error(0, &err),
        };

        let (rc, db) = {
            let _opening = self.envs.enter_opening(env.id(), key);
            self.engine.open(&filename, flags, vfs.as_deref())
        };

        if db == 0 {
            self.connections.release(env, key, &self.metrics);
            self.metadata
                .set_output(env, HandleKind::OutConnection, Some(out), Value::Object(None));
            return if rc == codes::SQLITE_OK { codes::SQLITE_NOMEM } else { rc };
        }
        self.connections.attach_native(key, db);
        self.metadata
            .write_address(env, Some(wrapper.get()), HandleKind::Connection, db);
        self.metadata.set_output(
            env,
            HandleKind::OutConnection,
            Some(out),
            Value::Object(Some(wrapper.get())),
        );
        log_debug!("opened {} as {:#x} (rc={})", filename, db, rc);
        rc
    }

    /// Close `db`; on success its state is released and the wrapper zeroed
    pub fn close<E: ManagedEnv + ?Sized>(&self, env: &E, db_wrapper: Option<ObjRef>, v2: bool) -> i32 {
        let db = self.db_of(env, db_wrapper);
        if db == 0 {
            return codes::SQLITE_OK;
        }
        let key = self.connections.lookup(db);
        let rc = self.engine.close(db, v2);
        if rc == codes::SQLITE_OK {
            if let Some(key) = key {
                self.connections.release(env, key, &self.metrics);
            }
            self.metadata
                .write_address(env, db_wrapper, HandleKind::Connection, 0);
            log_debug!("closed {:#x}", db);
        }
        rc
    }

    /// Message for the most recent failure on `db`
    ///
    /// A bridge-level message the engine could not take precedence once.
    pub fn errmsg<E: ManagedEnv + ?Sized>(&self, env: &E, db_wrapper: Option<ObjRef>) -> Option<ObjRef> {
        let db = self.db_of(env, db_wrapper);
        if db == 0 {
            return None;
        }
        let pending = self
            .connections
            .with_native(db, |st| {
                let msg = st.last_error().map(str::to_string);
                st.set_last_error(None);
                msg
            })
            .flatten();
        let msg = pending.or_else(|| self.engine.errmsg(db))?;
        self.refs(env).to_managed_string(env, &msg).ok()
    }

    pub fn prepare<E: ManagedEnv + ?Sized>(
        &self,
        env: &E,
        db_wrapper: Option<ObjRef>,
        sql: Option<ObjRef>,
        prep_flags: u32,
        out_stmt: Option<ObjRef>,
        out_tail: Option<ObjRef>,
    ) -> i32 {
        let db = self.db_of(env, db_wrapper);
        if db == 0 {
            return self.record_error(0, &BridgeError::misuse("prepare on a closed connection"));
        }
        let Some(sql) = sql else {
            return self.record_error(db, &BridgeError::misuse("SQL must not be null"));
        };
        let bytes = match env.byte_array_contents(sql) {
            Ok(b) => b,
            Err(err) => {
                env.clear_exception();
                return self.record_error(db, &err.into());
            }
        };
        self.refs(env);
        let wrapper = match self.metadata.wrap(env, HandleKind::Statement, 0) {
            Ok(w) => LocalRef::new(env, w),
            Err(err) => return self.record_error(db, &err),
        };

        let prepared = {
            let _tracing = self.envs.enter_tracing(env.id(), Some(wrapper.get()));
            self.engine.prepare(db, &bytes, prep_flags)
        };
        self.metadata.set_output(
            env,
            HandleKind::OutInt32,
            out_tail,
            Value::Int(prepared.tail as i32),
        );
        if prepared.rc != codes::SQLITE_OK || prepared.stmt == 0 {
            self.metadata
                .set_output(env, HandleKind::OutStatement, out_stmt, Value::Object(None));
            return prepared.rc;
        }

        let registered = self
            .connections
            .with_native(db, |st| st.add_statement(prepared.stmt));
        if let Err(err) = registered.unwrap_or_else(|| Err(BridgeError::misuse("unknown connection"))) {
            self.engine.finalize(prepared.stmt);
            self.metadata
                .set_output(env, HandleKind::OutStatement, out_stmt, Value::Object(None));
            return self.record_error(db, &err);
        }
        self.metadata
            .write_address(env, Some(wrapper.get()), HandleKind::Statement, prepared.stmt);
        self.metadata.set_output(
            env,
            HandleKind::OutStatement,
            out_stmt,
            Value::Object(Some(wrapper.get())),
        );
        prepared.rc
    }

    /// Step `stmt`; trace callbacks fired meanwhile see `stmt_wrapper` itself
    pub fn step<E: ManagedEnv + ?Sized>(&self, env: &E, stmt_wrapper: Option<ObjRef>) -> i32 {
        let stmt = self
            .metadata
            .read_address(env, stmt_wrapper, HandleKind::Statement);
        if stmt == 0 || !self.connections.owns_statement(stmt) {
            return self.record_error(0, &BridgeError::misuse("step on a finalized statement"));
        }
        self.refs(env);
        let _tracing = self.envs.enter_tracing(env.id(), stmt_wrapper);
        self.engine.step(stmt)
    }

    /// Finalize `stmt` natively, whether or not its connection is still tracked
    ///
    /// After `close_v2` the native connection lingers until its last
    /// statement is finalized, so the call must reach the engine regardless.
    pub fn finalize<E: ManagedEnv + ?Sized>(&self, env: &E, stmt_wrapper: Option<ObjRef>) -> i32 {
        let stmt = self
            .metadata
            .read_address(env, stmt_wrapper, HandleKind::Statement);
        if stmt == 0 {
            return codes::SQLITE_OK;
        }
        if !self.connections.forget_statement(stmt) {
            log_debug!("finalizing {:#x} after its connection closed", stmt);
        }
        let rc = self.engine.finalize(stmt);
        self.metadata
            .write_address(env, stmt_wrapper, HandleKind::Statement, 0);
        rc
    }

    // ========================================================================
    // HOOK REGISTRATION
    // ========================================================================

    /// Bind `obj` into `kind`'s slot and switch native dispatch accordingly
    ///
    /// Returns `None` when `obj` is already bound there (nothing changes
    /// apart from `arg`), else the previous binding for the caller to
    /// dispose of.
    fn install_hook<E: ManagedEnv + ?Sized>(
        &self,
        env: &E,
        db: DbPtr,
        kind: HookKind,
        obj: Option<ObjRef>,
        arg: i32,
    ) -> Result<Option<HookSlot>> {
        if db == 0 {
            return Err(BridgeError::misuse(format!(
                "{} hook on a closed connection",
                kind.name()
            )));
        }
        if kind.index() >= HookKind::PER_CONNECTION {
            return Err(BridgeError::misuse(format!(
                "{} is not a per-connection hook",
                kind.name()
            )));
        }
        if let Some(obj) = obj {
            let same = self
                .connections
                .with_native(db, |st| st.hook(kind).rebind_noop(env, obj))
                .ok_or_else(|| BridgeError::misuse("unknown connection"))?;
            if same {
                if matches!(kind, HookKind::Trace | HookKind::Progress) {
                    let rc = self.engine.set_hook(db, kind, true, arg);
                    if rc != codes::SQLITE_OK {
                        return Err(BridgeError::Engine {
                            code: rc,
                            message: format!("cannot refresh {} hook", kind.name()),
                        });
                    }
                }
                return Ok(None);
            }
        }
        let fresh = match obj {
            Some(obj) => HookSlot::for_kind(env, obj, kind, &self.config)?,
            None => HookSlot::default(),
        };
        let rc = self.engine.set_hook(db, kind, obj.is_some(), arg);
        if rc != codes::SQLITE_OK {
            return Err(BridgeError::Engine {
                code: rc,
                message: format!("cannot install {} hook", kind.name()),
            });
        }
        self.connections
            .replace_hook(db, kind, fresh)
            .map(Some)
            .ok_or_else(|| BridgeError::misuse("unknown connection"))
    }

    /// Register (or with `None` remove) a per-connection callback
    ///
    /// `arg` is the progress interval or trace mask; for those two kinds a
    /// value of zero or less removes the callback.
    pub fn set_callback<E: ManagedEnv + ?Sized>(
        &self,
        env: &E,
        db_wrapper: Option<ObjRef>,
        kind: HookKind,
        arg: i32,
        obj: Option<ObjRef>,
    ) -> i32 {
        let db = self.db_of(env, db_wrapper);
        let result = self.install_hook(env, db, kind, Self::effective(kind, arg, obj), arg);
        match result {
            Ok(Some(mut old)) => {
                old.unbind(env);
                codes::SQLITE_OK
            }
            Ok(None) => codes::SQLITE_OK,
            Err(err) => self.record_error(db, &err),
        }
    }

    /// Like [`Bridge::set_callback`], handing the previous callback object back
    ///
    /// This is the contract of the commit, rollback, update and pre-update
    /// registrations.
    pub fn swap_callback<E: ManagedEnv + ?Sized>(
        &self,
        env: &E,
        db_wrapper: Option<ObjRef>,
        kind: HookKind,
        obj: Option<ObjRef>,
    ) -> Option<ObjRef> {
        let db = self.db_of(env, db_wrapper);
        match self.install_hook(env, db, kind, obj, 0) {
            Ok(Some(mut old)) => old
                .detach_callback()
                .and_then(|cb| cb.into_local(env).ok())
                .map(LocalRef::detach),
            Ok(None) => obj.and_then(|o| env.new_local_ref(o).ok()),
            Err(err) => {
                self.record_error(db, &err);
                None
            }
        }
    }

    fn effective(kind: HookKind, arg: i32, obj: Option<ObjRef>) -> Option<ObjRef> {
        match kind {
            HookKind::Trace | HookKind::Progress if arg <= 0 => None,
            _ => obj,
        }
    }

    /// Native `busy_timeout()` replaces any busy handler, managed or not
    pub fn busy_timeout<E: ManagedEnv + ?Sized>(&self, env: &E, db_wrapper: Option<ObjRef>, ms: i32) -> i32 {
        let db = self.db_of(env, db_wrapper);
        if db == 0 {
            return self.record_error(0, &BridgeError::misuse("busy_timeout on a closed connection"));
        }
        let rc = self.engine.busy_timeout(db, ms);
        if rc == codes::SQLITE_OK {
            if let Some(mut old) = self
                .connections
                .replace_hook(db, HookKind::Busy, HookSlot::default())
            {
                old.unbind(env);
            }
        }
        rc
    }

    /// Register a collation; a rejected binding is released without `xDestroy()`
    pub fn create_collation<E: ManagedEnv + ?Sized>(
        &self,
        env: &E,
        db_wrapper: Option<ObjRef>,
        name: Option<ObjRef>,
        enc: i32,
        obj: Option<ObjRef>,
    ) -> i32 {
        let db = self.db_of(env, db_wrapper);
        let prepared = (|| -> Result<(String, HookSlot)> {
            if db == 0 {
                return Err(BridgeError::misuse("create_collation on a closed connection"));
            }
            let refs = self.refs(env);
            let name = self.string_arg(env, &refs, name, "collation name")?;
            let obj = obj.ok_or_else(|| BridgeError::misuse("collation must not be null"))?;
            let slot = HookSlot::for_kind(env, obj, HookKind::Collation, &self.config)?;
            Ok((name, slot))
        })();
        let (name, slot) = match prepared {
            Ok(p) => p,
            Err(err) => return self.record_error(db, &err),
        };
        match self.engine.create_collation(db, &name, enc, Box::new(slot)) {
            Ok(()) => codes::SQLITE_OK,
            Err((rc, slot)) => {
                // Never registered, so no xDestroy(); dropping releases the reference
                drop(slot);
                rc
            }
        }
    }

    pub fn create_function<E: ManagedEnv + ?Sized>(
        &self,
        env: &E,
        db_wrapper: Option<ObjRef>,
        name: Option<ObjRef>,
        n_arg: i32,
        flags: i32,
        functor: Option<ObjRef>,
    ) -> i32 {
        let db = self.db_of(env, db_wrapper);
        let binding = (|| -> Result<UdfBinding> {
            if db == 0 {
                return Err(BridgeError::misuse("create_function on a closed connection"));
            }
            let refs = self.refs(env);
            let name = self.string_arg(env, &refs, name, "function name")?;
            let functor = functor.ok_or_else(|| BridgeError::misuse("function must not be null"))?;
            UdfBinding::detect(env, functor, &name, &self.config)
        })();
        match binding {
            Ok(binding) => {
                let name = binding.name().to_string();
                self.engine
                    .create_function(db, &name, n_arg, flags, Box::new(binding))
            }
            Err(err) => self.record_error(db, &err),
        }
    }

    // ========================================================================
    // PROCESS-WIDE REGISTRATIONS
    // ========================================================================

    pub fn auto_extension<E: ManagedEnv + ?Sized>(&self, env: &E, obj: Option<ObjRef>) -> i32 {
        let Some(obj) = obj else {
            return self.record_error(0, &BridgeError::misuse("auto-extension must not be null"));
        };
        if self.auto_ext.claim_runner_install() {
            let rc = self.engine.install_auto_extension_runner();
            if rc != codes::SQLITE_OK {
                self.auto_ext.release_runner_claim();
                return rc;
            }
        }
        match self.auto_ext.add(env, obj, &self.config) {
            Ok(_) => codes::SQLITE_OK,
            Err(err) => self.record_error(0, &err),
        }
    }

    pub fn cancel_auto_extension<E: ManagedEnv + ?Sized>(&self, env: &E, obj: Option<ObjRef>) -> bool {
        match obj {
            Some(obj) => self.auto_ext.cancel(env, obj),
            None => false,
        }
    }

    pub fn reset_auto_extension<E: ManagedEnv + ?Sized>(&self, env: &E) {
        self.auto_ext.reset(env);
    }

    /// Install (or with `None` remove) the global log callback
    pub fn config_log<E: ManagedEnv + ?Sized>(&self, env: &E, obj: Option<ObjRef>) -> i32 {
        if let Some(obj) = obj {
            if self.log_hook.lock().rebind_noop(env, obj) {
                return codes::SQLITE_OK;
            }
        }
        let fresh = match obj {
            Some(obj) => match HookSlot::for_kind(env, obj, HookKind::ConfigLog, &self.config) {
                Ok(slot) => slot,
                Err(err) => return self.record_error(0, &err),
            },
            None => HookSlot::default(),
        };
        let rc = self.engine.config_log(obj.is_some());
        if rc != codes::SQLITE_OK {
            return rc;
        }
        let mut old = std::mem::replace(&mut *self.log_hook.lock(), fresh);
        old.unbind(env);
        codes::SQLITE_OK
    }

    /// `db_config()`; only `SQLITE_DBCONFIG_MAINDBNAME` is supported
    pub fn db_config<E: ManagedEnv + ?Sized>(
        &self,
        env: &E,
        db_wrapper: Option<ObjRef>,
        op: i32,
        name: Option<ObjRef>,
    ) -> i32 {
        let db = self.db_of(env, db_wrapper);
        if db == 0 {
            return self.record_error(0, &BridgeError::misuse("db_config on a closed connection"));
        }
        if op != SQLITE_DBCONFIG_MAINDBNAME {
            return self.record_error(db, &BridgeError::misuse(format!("unsupported db_config op {}", op)));
        }
        let refs = self.refs(env);
        let name = match self
            .string_arg(env, &refs, name, "database name")
            .and_then(|n| CString::new(n).map_err(|_| BridgeError::misuse("database name contains NUL")))
        {
            Ok(n) => n,
            Err(err) => return self.record_error(db, &err),
        };
        let rc = self.engine.db_config_main_name(db, &name);
        if rc == codes::SQLITE_OK {
            let previous = self
                .connections
                .with_native(db, |st| st.replace_main_db_name(Some(name)));
            drop(previous);
        }
        rc
    }

    /// Tear down every process-wide registry, then the native library
    pub fn shutdown<E: ManagedEnv + ?Sized>(&self, env: &E) -> i32 {
        self.auto_ext.reset(env);
        let evicted = self.envs.clear(env);
        self.metadata.teardown(env);
        log_debug!("shutdown evicted {} thread environment(s)", evicted);
        self.engine.shutdown()
    }

    /// Drop the calling thread's cached environment
    pub fn uncache_thread<E: ManagedEnv + ?Sized>(&self, env: &E) -> bool {
        self.envs.evict(env, &self.metrics)
    }

    /// Counters and registry sizes as JSON, also logged at INFO
    pub fn internal_details(&self) -> String {
        let envs = self.envs.stats();
        let conns = self.connections.stats();
        let cache = self.metadata.stats();
        let details = serde_json::json!({
            "metrics": self.metrics.snapshot(),
            "env_cache": { "live": envs.live, "free": envs.free },
            "connections": {
                "in_use": conns.in_use,
                "free": conns.free,
                "capacity": conns.capacity,
            },
            "metadata": { "resolutions": cache.resolutions, "hits": cache.hits },
            "auto_extensions": self.auto_ext.len(),
        });
        let text = serde_json::to_string_pretty(&details).unwrap_or_default();
        log_info!("internal details: {}", text);
        text
    }

    // ========================================================================
    // NATIVE DISPATCH
    // ========================================================================

    fn invoke<E: ManagedEnv + ?Sized>(
        &self,
        env: &E,
        refs: &EnvRefs,
        hook: &LocalHook<'_, E>,
        kind: HookKind,
        args: &[Value],
    ) -> std::result::Result<Ret, String> {
        self.metrics.hook_called(kind);
        match env.call_method(hook.obj.get(), hook.method, kind.return_kind(), args) {
            Ok(ret) => Ok(ret),
            Err(_) => {
                let msg = refs
                    .exception_message(env)
                    .unwrap_or_else(|| format!("{} hook threw", kind.name()));
                env.clear_exception();
                Err(msg)
            }
        }
    }

    fn managed_str<'e, E: ManagedEnv + ?Sized>(
        env: &'e E,
        refs: &EnvRefs,
        s: Option<&str>,
    ) -> Result<Option<LocalRef<'e, E>>> {
        Ok(refs
            .to_managed_opt(env, s)?
            .map(|obj| LocalRef::new(env, obj)))
    }

    fn obj_of<E: ManagedEnv + ?Sized>(r: &Option<LocalRef<'_, E>>) -> Value {
        Value::Object(r.as_ref().map(LocalRef::get))
    }

    pub fn on_busy<E: ManagedEnv + ?Sized>(&self, env: &E, db: DbPtr, n: i32) -> i32 {
        let Some((hook, _)) = self.connections.dup_hook(env, db, HookKind::Busy) else {
            return 0;
        };
        let refs = self.refs(env);
        match self.invoke(env, &refs, &hook, HookKind::Busy, &[Value::Int(n)]) {
            Ok(ret) => ret.as_int(),
            Err(msg) => {
                self.callback_failed(db, HookKind::Busy, &msg);
                0
            }
        }
    }

    /// Non-zero interrupts the running statement
    pub fn on_progress<E: ManagedEnv + ?Sized>(&self, env: &E, db: DbPtr) -> i32 {
        let Some((hook, _)) = self.connections.dup_hook(env, db, HookKind::Progress) else {
            return 0;
        };
        let refs = self.refs(env);
        match self.invoke(env, &refs, &hook, HookKind::Progress, &[]) {
            Ok(ret) => ret.as_int(),
            Err(msg) => {
                self.callback_failed(db, HookKind::Progress, &msg);
                codes::SQLITE_ERROR
            }
        }
    }

    /// Non-zero turns the commit into a rollback
    pub fn on_commit<E: ManagedEnv + ?Sized>(&self, env: &E, db: DbPtr) -> i32 {
        let Some((hook, _)) = self.connections.dup_hook(env, db, HookKind::Commit) else {
            return 0;
        };
        let refs = self.refs(env);
        match self.invoke(env, &refs, &hook, HookKind::Commit, &[]) {
            Ok(ret) => ret.as_int(),
            Err(msg) => {
                self.callback_failed(db, HookKind::Commit, &msg);
                codes::SQLITE_ERROR
            }
        }
    }

    pub fn on_rollback<E: ManagedEnv + ?Sized>(&self, env: &E, db: DbPtr) {
        let Some((hook, _)) = self.connections.dup_hook(env, db, HookKind::Rollback) else {
            return;
        };
        let refs = self.refs(env);
        if let Err(msg) = self.invoke(env, &refs, &hook, HookKind::Rollback, &[]) {
            self.callback_failed(db, HookKind::Rollback, &msg);
        }
    }

    pub fn on_update<E: ManagedEnv + ?Sized>(
        &self,
        env: &E,
        db: DbPtr,
        op: i32,
        db_name: &str,
        table: &str,
        rowid: i64,
    ) {
        let Some((hook, _)) = self.connections.dup_hook(env, db, HookKind::Update) else {
            return;
        };
        let refs = self.refs(env);
        let strings = Self::managed_str(env, &refs, Some(db_name))
            .and_then(|d| Ok((d, Self::managed_str(env, &refs, Some(table))?)));
        let (db_name, table) = match strings {
            Ok(s) => s,
            Err(err) => {
                log_warn!("update hook skipped: {}", err);
                return;
            }
        };
        let args = [
            Value::Int(op),
            Self::obj_of(&db_name),
            Self::obj_of(&table),
            Value::Long(rowid),
        ];
        if let Err(msg) = self.invoke(env, &refs, &hook, HookKind::Update, &args) {
            self.callback_failed(db, HookKind::Update, &msg);
        }
    }

    #[allow(clippy::too_many_arguments)]
    pub fn on_preupdate<E: ManagedEnv + ?Sized>(
        &self,
        env: &E,
        db: DbPtr,
        op: i32,
        db_name: &str,
        table: &str,
        key1: i64,
        key2: i64,
    ) {
        let Some((hook, wrapper)) = self.connections.dup_hook(env, db, HookKind::PreUpdate) else {
            return;
        };
        let refs = self.refs(env);
        let strings = Self::managed_str(env, &refs, Some(db_name))
            .and_then(|d| Ok((d, Self::managed_str(env, &refs, Some(table))?)));
        let (db_name, table) = match strings {
            Ok(s) => s,
            Err(err) => {
                log_warn!("preupdate hook skipped: {}", err);
                return;
            }
        };
        let args = [
            Self::obj_of(&wrapper),
            Value::Int(op),
            Self::obj_of(&db_name),
            Self::obj_of(&table),
            Value::Long(key1),
            Value::Long(key2),
        ];
        if let Err(msg) = self.invoke(env, &refs, &hook, HookKind::PreUpdate, &args) {
            self.callback_failed(db, HookKind::PreUpdate, &msg);
        }
    }

    /// Deliver one trace event
    ///
    /// Statement events reuse the wrapper currently being stepped on this
    /// thread when it refers to the same statement; close events carry the
    /// connection's own wrapper.
    pub fn on_trace<E: ManagedEnv + ?Sized>(&self, env: &E, db: DbPtr, event: TraceEvent<'_>) -> i32 {
        let Some((hook, wrapper)) = self.connections.dup_hook(env, db, HookKind::Trace) else {
            return 0;
        };
        let refs = self.refs(env);

        let mut fresh: Option<LocalRef<'_, E>> = None;
        let p = match event.stmt() {
            Some(stmt) => {
                let current = self.envs.scratch(env.id()).tracing_stmt.filter(|s| {
                    self.metadata.read_address(env, Some(*s), HandleKind::Statement) == stmt
                });
                match current {
                    Some(s) => Some(s),
                    None => match self.metadata.wrap(env, HandleKind::Statement, stmt) {
                        Ok(w) => {
                            fresh = Some(LocalRef::new(env, w));
                            Some(w)
                        }
                        Err(err) => return self.record_error(db, &err),
                    },
                }
            }
            None => wrapper.as_ref().map(LocalRef::get),
        };
        let x = match event {
            TraceEvent::Stmt { sql, .. } => refs.to_managed_string(env, sql).map(Some),
            TraceEvent::Profile { nanos, .. } => refs.new_boxed_long(env, nanos).map(Some),
            TraceEvent::Row { .. } | TraceEvent::Close => Ok(None),
        };
        let x = match x {
            Ok(x) => x.map(|obj| LocalRef::new(env, obj)),
            Err(err) => return self.record_error(db, &err),
        };

        let args = [
            Value::Int(event.mask() as i32),
            Value::Object(p),
            Self::obj_of(&x),
        ];
        let rc = match self.invoke(env, &refs, &hook, HookKind::Trace, &args) {
            Ok(ret) => ret.as_int(),
            Err(msg) => {
                self.callback_failed(db, HookKind::Trace, &msg);
                codes::SQLITE_ERROR
            }
        };
        if let Some(w) = &fresh {
            self.metadata
                .write_address(env, Some(w.get()), HandleKind::Statement, 0);
        }
        rc
    }

    /// Authorizer decision (OK, DENY or IGNORE); a throw denies
    pub fn on_authorizer<E: ManagedEnv + ?Sized>(
        &self,
        env: &E,
        db: DbPtr,
        action: i32,
        args: [Option<&str>; 4],
    ) -> i32 {
        let Some((hook, _)) = self.connections.dup_hook(env, db, HookKind::Authorizer) else {
            return codes::SQLITE_OK;
        };
        let refs = self.refs(env);
        let mut strings = Vec::with_capacity(4);
        for s in args {
            match Self::managed_str(env, &refs, s) {
                Ok(s) => strings.push(s),
                Err(err) => return self.record_error(db, &err),
            }
        }
        let mut call_args = vec![Value::Int(action)];
        call_args.extend(strings.iter().map(Self::obj_of));
        match self.invoke(env, &refs, &hook, HookKind::Authorizer, &call_args) {
            Ok(ret) => ret.as_int(),
            Err(msg) => {
                self.callback_failed(db, HookKind::Authorizer, &msg);
                codes::SQLITE_ERROR
            }
        }
    }

    pub fn on_collation_needed<E: ManagedEnv + ?Sized>(&self, env: &E, db: DbPtr, enc: i32, name: &str) {
        let Some((hook, wrapper)) = self.connections.dup_hook(env, db, HookKind::CollationNeeded)
        else {
            return;
        };
        let refs = self.refs(env);
        let name = match Self::managed_str(env, &refs, Some(name)) {
            Ok(n) => n,
            Err(err) => {
                self.record_error(db, &err);
                return;
            }
        };
        let args = [Self::obj_of(&wrapper), Value::Int(enc), Self::obj_of(&name)];
        if let Err(msg) = self.invoke(env, &refs, &hook, HookKind::CollationNeeded, &args) {
            self.callback_failed(db, HookKind::CollationNeeded, &msg);
        }
    }

    /// Compare two keys with a managed collation
    pub fn on_collation<E: ManagedEnv + ?Sized>(&self, env: &E, binding: &HookSlot, a: &[u8], b: &[u8]) -> i32 {
        let Some(hook) = binding.local_dup(env) else {
            return 0;
        };
        let refs = self.refs(env);
        let arrays = env
            .new_byte_array(a)
            .map(|a| LocalRef::new(env, a))
            .and_then(|a| Ok((a, LocalRef::new(env, env.new_byte_array(b)?))));
        let (a, b) = match arrays {
            Ok(ab) => ab,
            Err(_) => {
                env.clear_exception();
                log_warn!("collation skipped: out of memory");
                return 0;
            }
        };
        let args = [Value::Object(Some(a.get())), Value::Object(Some(b.get()))];
        match self.invoke(env, &refs, &hook, HookKind::Collation, &args) {
            Ok(ret) => ret.as_int(),
            Err(msg) => {
                log_warn!("collation threw: {}", msg);
                0
            }
        }
    }

    /// Native collation destructor
    pub fn on_collation_destroy<E: ManagedEnv + ?Sized>(&self, env: &E, mut binding: Box<HookSlot>) {
        binding.unbind(env);
    }

    /// Run one UDF entry point and set the native result on failure
    pub fn on_function<E: ManagedEnv + ?Sized>(
        &self,
        env: &E,
        binding: &UdfBinding,
        method: UdfMethod,
        ctx: ContextPtr,
        argv: &[ValuePtr],
    ) {
        let refs = self.refs(env);
        let key = match binding.kind() {
            UdfKind::Scalar => None,
            UdfKind::Aggregate | UdfKind::Window => {
                let allocate = method.takes_args();
                let key = self.engine.aggregate_context_key(ctx, allocate);
                if key == 0 && allocate {
                    self.engine.result_error_nomem(ctx);
                    return;
                }
                Some(key)
            }
        };
        match binding.dispatch(env, &self.metadata, &refs, &self.metrics, method, ctx, argv, key) {
            UdfOutcome::Ok => {}
            UdfOutcome::Error(msg) => self.engine.result_error(ctx, &msg),
            UdfOutcome::NoMem => self.engine.result_error_nomem(ctx),
        }
    }

    /// Native per-function finalizer
    pub fn on_function_destroy<E: ManagedEnv + ?Sized>(&self, env: &E, binding: Box<UdfBinding>) {
        binding.destroy(env);
    }

    /// Native auto-extension runner, called inside open
    pub fn on_auto_extension<E: ManagedEnv + ?Sized>(&self, env: &E, db: DbPtr) -> Result<()> {
        let refs = self.refs(env);
        let key = match self.envs.scratch(env.id()).opening {
            Some(key) => {
                self.connections.attach_native(key, db);
                self.envs.clear_opening(env.id());
                Some(key)
            }
            None => self.connections.lookup(db),
        };
        let wrapper = key
            .and_then(|k| self.connections.with(k, |st| st.wrapper()))
            .flatten()
            .and_then(|w| env.new_local_ref(w).ok())
            .map(|w| LocalRef::new(env, w));
        let Some(wrapper) = wrapper else {
            log_debug!("auto-extensions skipped for foreign connection {:#x}", db);
            return Ok(());
        };
        self.metadata
            .write_address(env, Some(wrapper.get()), HandleKind::Connection, db);
        self.auto_ext.run(env, wrapper.get(), &refs, &self.metrics)
    }

    pub fn on_config_log<E: ManagedEnv + ?Sized>(&self, env: &E, code: i32, msg: &str) {
        let hook = self.log_hook.lock().local_dup(env);
        let Some(hook) = hook else { return };
        let refs = self.refs(env);
        let msg = match Self::managed_str(env, &refs, Some(msg)) {
            Ok(m) => m,
            Err(_) => return,
        };
        let args = [Value::Int(code), Self::obj_of(&msg)];
        if let Err(err) = self.invoke(env, &refs, &hook, HookKind::ConfigLog, &args) {
            log_warn!("log callback threw: {}", err);
        }
    }

    /// True if `stmt` belongs to a connection this bridge still tracks
    pub fn is_live_statement(&self, stmt: StmtPtr) -> bool {
        self.connections.owns_statement(stmt)
    }
}

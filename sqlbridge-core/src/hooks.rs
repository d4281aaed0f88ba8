// sqlbridge-core/src/hooks.rs
//! Callback hook registry
//!
//! A [`HookSlot`] binds one managed callback object to one resolved entry
//! point. Every native-to-managed callback kind uses the same slot type.
//!
//! ```text
//!            bind (resolves ok)
//!  Unbound ───────────────────────▶ Bound ──┐ rebind_noop(same object)
//!     ▲                               │ ◀───┘
//!     └──── unbind / bind(other) ─────┘   (teardown runs on this edge only)
//! ```

use crate::config::BridgeConfig;
use crate::error::{BridgeError, Result};
use crate::refs::{GlobalRef, LocalRef};
use crate::runtime::{ManagedEnv, ManagedError, MethodId, ObjRef, RetKind};
use crate::{log_debug, log_warn};

/// Name of the optional teardown method on callback objects
pub const TEARDOWN_METHOD: &str = "xDestroy";

/// Every kind of managed callback the bridge can dispatch to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HookKind {
    Busy,
    Progress,
    Commit,
    Rollback,
    Update,
    PreUpdate,
    Trace,
    Authorizer,
    CollationNeeded,
    Collation,
    AutoExtension,
    ConfigLog,
}

impl HookKind {
    pub const COUNT: usize = 12;

    pub const ALL: [HookKind; HookKind::COUNT] = [
        HookKind::Busy,
        HookKind::Progress,
        HookKind::Commit,
        HookKind::Rollback,
        HookKind::Update,
        HookKind::PreUpdate,
        HookKind::Trace,
        HookKind::Authorizer,
        HookKind::CollationNeeded,
        HookKind::Collation,
        HookKind::AutoExtension,
        HookKind::ConfigLog,
    ];

    /// Kinds with one slot in every connection state
    pub const PER_CONNECTION: usize = 9;

    pub fn index(self) -> usize {
        self as usize
    }

    pub fn name(self) -> &'static str {
        match self {
            HookKind::Busy => "busy",
            HookKind::Progress => "progress",
            HookKind::Commit => "commit",
            HookKind::Rollback => "rollback",
            HookKind::Update => "update",
            HookKind::PreUpdate => "preupdate",
            HookKind::Trace => "trace",
            HookKind::Authorizer => "authorizer",
            HookKind::CollationNeeded => "collation_needed",
            HookKind::Collation => "collation",
            HookKind::AutoExtension => "auto_extension",
            HookKind::ConfigLog => "config_log",
        }
    }

    /// Method every callback interface exposes
    pub fn method_name(self) -> &'static str {
        "call"
    }

    /// JNI signature of `call` for this kind
    pub fn signature(self, config: &BridgeConfig) -> String {
        let db = format!("L{};", config.class_name("sqlite3"));
        match self {
            HookKind::Busy => "(I)I".into(),
            HookKind::Progress | HookKind::Commit => "()I".into(),
            HookKind::Rollback => "()V".into(),
            HookKind::Update => "(ILjava/lang/String;Ljava/lang/String;J)V".into(),
            HookKind::PreUpdate => {
                format!("({}ILjava/lang/String;Ljava/lang/String;JJ)V", db)
            }
            HookKind::Trace => "(ILjava/lang/Object;Ljava/lang/Object;)I".into(),
            HookKind::Authorizer => {
                "(ILjava/lang/String;Ljava/lang/String;Ljava/lang/String;Ljava/lang/String;)I"
                    .into()
            }
            HookKind::CollationNeeded => format!("({}ILjava/lang/String;)I", db),
            HookKind::Collation => "([B[B)I".into(),
            HookKind::AutoExtension => format!("({})I", db),
            HookKind::ConfigLog => "(ILjava/lang/String;)V".into(),
        }
    }

    pub fn return_kind(self) -> RetKind {
        match self {
            HookKind::Rollback | HookKind::Update | HookKind::PreUpdate | HookKind::ConfigLog => {
                RetKind::Void
            }
            _ => RetKind::Int,
        }
    }

    /// Whether dropping a binding of this kind invokes `xDestroy()`
    pub fn wants_teardown(self) -> bool {
        matches!(self, HookKind::Collation)
    }
}

/// One callback binding
#[derive(Debug, Default)]
pub struct HookSlot {
    callback: Option<GlobalRef>,
    method: Option<MethodId>,
    wants_teardown: bool,
}

impl HookSlot {
    /// Build a bound slot for `obj` without touching any existing binding
    ///
    /// Fails (with the pending exception cleared) if `obj`'s class lacks
    /// `name` with signature `sig`.
    pub fn resolve<E: ManagedEnv + ?Sized>(
        env: &E,
        obj: ObjRef,
        name: &str,
        sig: &str,
        wants_teardown: bool,
    ) -> Result<HookSlot> {
        let method = lookup_method(env, obj, name, sig).map_err(|err| match err {
            ManagedError::OutOfMemory => BridgeError::OutOfMemory,
            _ => BridgeError::Error(format!("cannot find {}{} on callback object", name, sig)),
        })?;
        let callback = GlobalRef::new(env, obj).map_err(|_| {
            env.clear_exception();
            BridgeError::OutOfMemory
        })?;
        Ok(HookSlot {
            callback: Some(callback),
            method: Some(method),
            wants_teardown,
        })
    }

    /// Convenience for the fixed interface of `kind`
    pub fn for_kind<E: ManagedEnv + ?Sized>(
        env: &E,
        obj: ObjRef,
        kind: HookKind,
        config: &BridgeConfig,
    ) -> Result<HookSlot> {
        Self::resolve(
            env,
            obj,
            kind.method_name(),
            &kind.signature(config),
            kind.wants_teardown(),
        )
    }

    /// Rebind in place: resolve first, then unbind the previous binding
    ///
    /// On resolution failure the slot is left exactly as it was.
    pub fn bind<E: ManagedEnv + ?Sized>(
        &mut self,
        env: &E,
        obj: ObjRef,
        name: &str,
        sig: &str,
        wants_teardown: bool,
    ) -> Result<()> {
        let fresh = HookSlot::resolve(env, obj, name, sig, wants_teardown)?;
        let mut old = std::mem::replace(self, fresh);
        old.unbind(env);
        Ok(())
    }

    /// True (and nothing happens) when already bound to `obj`
    pub fn rebind_noop<E: ManagedEnv + ?Sized>(&self, env: &E, obj: ObjRef) -> bool {
        match &self.callback {
            Some(cb) => env.is_same_object(Some(cb.get()), Some(obj)),
            None => false,
        }
    }

    /// Run teardown if flagged, then release and zero the slot
    pub fn unbind<E: ManagedEnv + ?Sized>(&mut self, env: &E) {
        if let Some(cb) = &self.callback {
            if self.wants_teardown {
                call_teardown(env, cb.get());
            }
            log_debug!("unbound callback {:?}", cb.get());
        }
        *self = HookSlot::default();
    }

    pub fn is_bound(&self) -> bool {
        self.callback.is_some()
    }

    pub fn callback(&self) -> Option<ObjRef> {
        self.callback.as_ref().map(GlobalRef::get)
    }

    /// Give the callback object to the caller without teardown
    ///
    /// Used by registrations that return the previously installed hook.
    pub fn detach_callback(&mut self) -> Option<GlobalRef> {
        let cb = self.callback.take();
        *self = HookSlot::default();
        cb
    }

    /// Call-local duplicate that stays valid even if the slot is rebound
    pub fn local_dup<'e, E: ManagedEnv + ?Sized>(&self, env: &'e E) -> Option<LocalHook<'e, E>> {
        let cb = self.callback.as_ref()?;
        let method = self.method?;
        let obj = env.new_local_ref(cb.get()).ok()?;
        Some(LocalHook {
            obj: LocalRef::new(env, obj),
            method,
        })
    }
}

/// Binding copied out of a slot for the duration of one invocation
pub struct LocalHook<'e, E: ManagedEnv + ?Sized> {
    pub obj: LocalRef<'e, E>,
    pub method: MethodId,
}

fn lookup_method<E: ManagedEnv + ?Sized>(
    env: &E,
    obj: ObjRef,
    name: &str,
    sig: &str,
) -> std::result::Result<MethodId, ManagedError> {
    let class = LocalRef::new(env, env.object_class(obj)?);
    match env.method_id(class.get(), name, sig) {
        Ok(mid) => Ok(mid),
        Err(err) => {
            env.clear_exception();
            Err(err)
        }
    }
}

/// Invoke `xDestroy()` on `obj` if it has one; exceptions are suppressed
pub fn call_teardown<E: ManagedEnv + ?Sized>(env: &E, obj: ObjRef) {
    let Ok(method) = lookup_method(env, obj, TEARDOWN_METHOD, "()V") else {
        return;
    };
    if env.call_method(obj, method, RetKind::Void, &[]).is_err() {
        env.clear_exception();
        log_warn!("{}() threw; exception suppressed", TEARDOWN_METHOD);
    }
}

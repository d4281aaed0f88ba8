// sqlbridge-core/src/udf.rs
//! User-defined SQL function bindings
//!
//! A managed functor is classified by the entry points its class exposes:
//!
//! | Category  | Methods                                   |
//! |-----------|-------------------------------------------|
//! | Scalar    | `xFunc`                                   |
//! | Aggregate | `xStep`, `xFinal`                         |
//! | Window    | `xStep`, `xFinal`, `xValue`, `xInverse`   |
//!
//! The native registration owns the boxed [`UdfBinding`] and hands it back
//! through its finalizer, which calls [`UdfBinding::destroy`].

use crate::config::BridgeConfig;
use crate::env_cache::EnvRefs;
use crate::error::{BridgeError, Result};
use crate::hooks::call_teardown;
use crate::marshal::marshal_in;
use crate::metadata::HandleMetadataCache;
use crate::metrics::Metrics;
use crate::refs::{GlobalRef, LocalRef};
use crate::runtime::{ManagedEnv, MethodId, ObjRef, RetKind};
use crate::{log_debug, log_warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UdfKind {
    Scalar,
    Aggregate,
    Window,
}

/// One managed entry point of a function object
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UdfMethod {
    Func,
    Step,
    Final,
    Value,
    Inverse,
}

impl UdfMethod {
    pub const ALL: [UdfMethod; 5] = [
        UdfMethod::Func,
        UdfMethod::Step,
        UdfMethod::Final,
        UdfMethod::Value,
        UdfMethod::Inverse,
    ];

    pub fn name(self) -> &'static str {
        match self {
            UdfMethod::Func => "xFunc",
            UdfMethod::Step => "xStep",
            UdfMethod::Final => "xFinal",
            UdfMethod::Value => "xValue",
            UdfMethod::Inverse => "xInverse",
        }
    }

    /// `xFinal` and `xValue` take only the context
    pub fn takes_args(self) -> bool {
        matches!(self, UdfMethod::Func | UdfMethod::Step | UdfMethod::Inverse)
    }

    /// Whether a throw becomes the SQL function's error result
    pub fn reports_error(self) -> bool {
        matches!(self, UdfMethod::Func | UdfMethod::Final)
    }

    pub fn signature(self, config: &BridgeConfig) -> String {
        let cx = config.class_name("sqlite3_context");
        if self.takes_args() {
            format!("(L{};[L{};)V", cx, config.class_name("sqlite3_value"))
        } else {
            format!("(L{};)V", cx)
        }
    }

    fn index(self) -> usize {
        self as usize
    }
}

/// What the native side must do after a dispatch
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UdfOutcome {
    Ok,
    /// Set this text as the function's error result
    Error(String),
    /// Report an out-of-memory result
    NoMem,
}

/// Managed functor plus its resolved entry points
#[derive(Debug)]
pub struct UdfBinding {
    functor: GlobalRef,
    name: String,
    kind: UdfKind,
    methods: [Option<MethodId>; 5],
}

impl UdfBinding {
    /// Classify `functor` and pin it; MISUSE when it fits no category
    pub fn detect<E: ManagedEnv + ?Sized>(
        env: &E,
        functor: ObjRef,
        name: &str,
        config: &BridgeConfig,
    ) -> Result<UdfBinding> {
        let class = LocalRef::new(env, env.object_class(functor)?);
        let mut methods = [None; 5];
        for m in UdfMethod::ALL {
            methods[m.index()] = match env.method_id(class.get(), m.name(), &m.signature(config)) {
                Ok(mid) => Some(mid),
                Err(_) => {
                    env.clear_exception();
                    None
                }
            };
        }
        let has = |m: UdfMethod| methods[m.index()].is_some();
        let kind = if has(UdfMethod::Func) {
            UdfKind::Scalar
        } else if has(UdfMethod::Step) && has(UdfMethod::Final) {
            if has(UdfMethod::Value) && has(UdfMethod::Inverse) {
                UdfKind::Window
            } else {
                UdfKind::Aggregate
            }
        } else {
            return Err(BridgeError::misuse(format!(
                "{} is not a scalar, aggregate or window function",
                name
            )));
        };
        let functor = GlobalRef::new(env, functor).map_err(|_| {
            env.clear_exception();
            BridgeError::OutOfMemory
        })?;
        log_debug!("bound {:?} function {}", kind, name);
        Ok(UdfBinding {
            functor,
            name: name.to_string(),
            kind,
            methods,
        })
    }

    pub fn kind(&self) -> UdfKind {
        self.kind
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn functor(&self) -> ObjRef {
        self.functor.get()
    }

    pub fn method(&self, m: UdfMethod) -> Option<MethodId> {
        self.methods[m.index()]
    }

    /// Finalizer path: run `xDestroy()` if present, then release the functor
    pub fn destroy<E: ManagedEnv + ?Sized>(self, env: &E) {
        call_teardown(env, self.functor.get());
        log_debug!("destroyed function {}", self.name);
    }

    /// Invoke one entry point for a native callback
    ///
    /// `aggregate_key` is `Some` for aggregate and window calls; the bridge
    /// obtains it from the engine's per-aggregation storage.
    #[allow(clippy::too_many_arguments)]
    pub fn dispatch<E: ManagedEnv + ?Sized>(
        &self,
        env: &E,
        meta: &HandleMetadataCache,
        refs: &EnvRefs,
        metrics: &Metrics,
        method: UdfMethod,
        ctx: usize,
        argv: &[usize],
        aggregate_key: Option<i64>,
    ) -> UdfOutcome {
        let Some(mid) = self.method(method) else {
            return UdfOutcome::Error(format!(
                "SQL function {} has no {}()",
                self.name,
                method.name()
            ));
        };
        metrics.incr(match method {
            UdfMethod::Func => &metrics.udf_func,
            UdfMethod::Step => &metrics.udf_step,
            UdfMethod::Final => &metrics.udf_final,
            UdfMethod::Value => &metrics.udf_value,
            UdfMethod::Inverse => &metrics.udf_inverse,
        });

        let argv = method.takes_args().then_some(argv);
        let args = match marshal_in(env, meta, ctx, argv, aggregate_key) {
            Ok(args) => args,
            Err(_) => return UdfOutcome::NoMem,
        };
        let result = env.call_method(self.functor.get(), mid, RetKind::Void, &args.call_args());
        let outcome = match result {
            Ok(_) => UdfOutcome::Ok,
            Err(_) => {
                let msg = refs.exception_message(env);
                env.clear_exception();
                if method.reports_error() {
                    UdfOutcome::Error(format!(
                        "Client-defined SQL function {}.{}() threw: {}",
                        self.name,
                        method.name(),
                        msg.as_deref().unwrap_or("Unknown exception")
                    ))
                } else {
                    log_warn!(
                        "SQL function {}.{}() threw: {}",
                        self.name,
                        method.name(),
                        msg.as_deref().unwrap_or("<unprintable>")
                    );
                    UdfOutcome::Ok
                }
            }
        };
        drop(args);
        outcome
    }
}

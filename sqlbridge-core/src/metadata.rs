// sqlbridge-core/src/metadata.rs
//! Handle metadata cache
//!
//! One lazily resolved [`HandleMetadata`] per wrapper class. The first
//! caller for a kind pays for class/field/constructor lookup under the
//! cache lock; every later caller reads a copy of the cached entry.
//!
//! Resolution failure is fatal: a missing wrapper class or member means the
//! managed and native halves were built from different definitions.

use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::RwLock;

use crate::config::BridgeConfig;
use crate::error::{BridgeError, Result};
use crate::refs::LocalRef;
use crate::runtime::{FieldId, ManagedEnv, ManagedError, MethodId, ObjRef, Ret, RetKind, Value};
use crate::{log_debug, log_trace};

/// Field holding the native address in every wrapper class
pub const NATIVE_POINTER_FIELD: &str = "nativePointer";

/// Every managed type whose layout the bridge manipulates directly
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HandleKind {
    Connection,
    Statement,
    Value,
    Context,
    Backup,
    Blob,
    OutInt32,
    OutInt64,
    OutBool,
    OutString,
    OutByteArray,
    OutConnection,
    OutStatement,
    OutValue,
}

/// Shape of an output box's `value` field
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BoxedValue {
    Int,
    Long,
    Bool,
    Object,
}

impl HandleKind {
    pub const COUNT: usize = 14;

    pub const ALL: [HandleKind; HandleKind::COUNT] = [
        HandleKind::Connection,
        HandleKind::Statement,
        HandleKind::Value,
        HandleKind::Context,
        HandleKind::Backup,
        HandleKind::Blob,
        HandleKind::OutInt32,
        HandleKind::OutInt64,
        HandleKind::OutBool,
        HandleKind::OutString,
        HandleKind::OutByteArray,
        HandleKind::OutConnection,
        HandleKind::OutStatement,
        HandleKind::OutValue,
    ];

    pub fn index(self) -> usize {
        self as usize
    }

    /// Class name relative to the configured package
    pub fn simple_name(self) -> &'static str {
        match self {
            HandleKind::Connection => "sqlite3",
            HandleKind::Statement => "sqlite3_stmt",
            HandleKind::Value => "sqlite3_value",
            HandleKind::Context => "sqlite3_context",
            HandleKind::Backup => "sqlite3_backup",
            HandleKind::Blob => "sqlite3_blob",
            HandleKind::OutInt32 => "OutputPointer$Int32",
            HandleKind::OutInt64 => "OutputPointer$Int64",
            HandleKind::OutBool => "OutputPointer$Bool",
            HandleKind::OutString => "OutputPointer$String",
            HandleKind::OutByteArray => "OutputPointer$ByteArray",
            HandleKind::OutConnection => "OutputPointer$sqlite3",
            HandleKind::OutStatement => "OutputPointer$sqlite3_stmt",
            HandleKind::OutValue => "OutputPointer$sqlite3_value",
        }
    }

    /// Wrappers carry a native address; output boxes carry a `value`
    pub fn is_wrapper(self) -> bool {
        matches!(
            self,
            HandleKind::Connection
                | HandleKind::Statement
                | HandleKind::Value
                | HandleKind::Context
                | HandleKind::Backup
                | HandleKind::Blob
        )
    }

    /// Type and JNI signature of the `value` field of an output box
    pub fn value_field(self, config: &BridgeConfig) -> Option<(BoxedValue, String)> {
        let object = |sig: String| Some((BoxedValue::Object, sig));
        match self {
            HandleKind::OutInt32 => Some((BoxedValue::Int, "I".into())),
            HandleKind::OutInt64 => Some((BoxedValue::Long, "J".into())),
            HandleKind::OutBool => Some((BoxedValue::Bool, "Z".into())),
            HandleKind::OutString => object("Ljava/lang/String;".into()),
            HandleKind::OutByteArray => object("[B".into()),
            HandleKind::OutConnection => object(format!("L{};", config.class_name("sqlite3"))),
            HandleKind::OutStatement => {
                object(format!("L{};", config.class_name("sqlite3_stmt")))
            }
            HandleKind::OutValue => object(format!("L{};", config.class_name("sqlite3_value"))),
            _ => None,
        }
    }
}

/// Resolved structural metadata for one wrapper class
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HandleMetadata {
    pub kind: HandleKind,
    /// Long-lived class reference
    pub class: ObjRef,
    /// Zero-argument constructor
    pub ctor: MethodId,
    /// `long nativePointer` (wrappers only)
    pub address_field: Option<FieldId>,
    /// `value` (output boxes only)
    pub value_field: Option<(BoxedValue, FieldId)>,
    /// `long aggregateContext` (callback context only)
    pub aggregate_slot: Option<FieldId>,
}

/// Snapshot of cache activity
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CacheStats {
    pub resolutions: u64,
    pub hits: u64,
}

pub struct HandleMetadataCache {
    config: BridgeConfig,
    slots: RwLock<[Option<HandleMetadata>; HandleKind::COUNT]>,
    resolutions: AtomicU64,
    hits: AtomicU64,
}

impl HandleMetadataCache {
    pub fn new(config: BridgeConfig) -> Self {
        HandleMetadataCache {
            config,
            slots: RwLock::new([None; HandleKind::COUNT]),
            resolutions: AtomicU64::new(0),
            hits: AtomicU64::new(0),
        }
    }

    pub fn config(&self) -> &BridgeConfig {
        &self.config
    }

    /// Metadata for `kind`, resolving it on first use
    pub fn resolve<E: ManagedEnv + ?Sized>(&self, env: &E, kind: HandleKind) -> HandleMetadata {
        if let Some(meta) = self.slots.read()[kind.index()] {
            self.hits.fetch_add(1, Ordering::Relaxed);
            return meta;
        }

        let mut slots = self.slots.write();
        // Another thread may have won the race while we waited.
        if let Some(meta) = slots[kind.index()] {
            self.hits.fetch_add(1, Ordering::Relaxed);
            return meta;
        }
        let meta = match self.resolve_uncached(env, kind) {
            Ok(meta) => meta,
            Err(err) => {
                env.clear_exception();
                env.fatal(&format!(
                    "cannot resolve {}: {}",
                    self.config.class_name(kind.simple_name()),
                    err
                ))
            }
        };
        slots[kind.index()] = Some(meta);
        self.resolutions.fetch_add(1, Ordering::Relaxed);
        log_debug!("resolved metadata for {}", kind.simple_name());
        meta
    }

    fn resolve_uncached<E: ManagedEnv + ?Sized>(
        &self,
        env: &E,
        kind: HandleKind,
    ) -> std::result::Result<HandleMetadata, ManagedError> {
        let name = self.config.class_name(kind.simple_name());
        let local = LocalRef::new(env, env.find_class(&name)?);
        let ctor = env.method_id(local.get(), "<init>", "()V")?;
        let address_field = if kind.is_wrapper() {
            Some(env.field_id(local.get(), NATIVE_POINTER_FIELD, "J")?)
        } else {
            None
        };
        let value_field = match kind.value_field(&self.config) {
            Some((boxed, sig)) => Some((boxed, env.field_id(local.get(), "value", &sig)?)),
            None => None,
        };
        let aggregate_slot = if kind == HandleKind::Context {
            Some(env.field_id(local.get(), "aggregateContext", "J")?)
        } else {
            None
        };
        let class = env.new_global_ref(local.get())?;
        Ok(HandleMetadata {
            kind,
            class,
            ctor,
            address_field,
            value_field,
            aggregate_slot,
        })
    }

    /// New wrapper of `kind` holding `address` (local reference)
    pub fn wrap<E: ManagedEnv + ?Sized>(
        &self,
        env: &E,
        kind: HandleKind,
        address: usize,
    ) -> Result<ObjRef> {
        let meta = self.resolve(env, kind);
        let obj = match env.new_object(meta.class, meta.ctor, &[]) {
            Ok(obj) => obj,
            Err(err) => return Err(self.allocation_failure(env, kind, err)),
        };
        if address != 0 {
            if let Some(field) = meta.address_field {
                if let Err(err) = env.set_field(obj, field, Value::Long(address as i64)) {
                    env.delete_local_ref(obj);
                    return Err(self.allocation_failure(env, kind, err));
                }
            }
        }
        log_trace!("wrapped {} @ {:#x}", kind.simple_name(), address);
        Ok(obj)
    }

    fn allocation_failure<E: ManagedEnv + ?Sized>(
        &self,
        env: &E,
        kind: HandleKind,
        err: ManagedError,
    ) -> BridgeError {
        env.clear_exception();
        if self.config.fatal_on_oom {
            env.fatal(&format!("allocation of {} failed: {}", kind.simple_name(), err));
        }
        BridgeError::OutOfMemory
    }

    /// Native address stored in `handle`; 0 for a null handle
    pub fn read_address<E: ManagedEnv + ?Sized>(
        &self,
        env: &E,
        handle: Option<ObjRef>,
        kind: HandleKind,
    ) -> usize {
        let Some(handle) = handle else { return 0 };
        let Some(field) = self.resolve(env, kind).address_field else {
            return 0;
        };
        match env.get_field(handle, field, RetKind::Long) {
            Ok(Ret::Long(v)) => v as usize,
            _ => 0,
        }
    }

    /// Install or zero the native address held by `handle`
    pub fn write_address<E: ManagedEnv + ?Sized>(
        &self,
        env: &E,
        handle: Option<ObjRef>,
        kind: HandleKind,
        address: usize,
    ) {
        let Some(handle) = handle else { return };
        if let Some(field) = self.resolve(env, kind).address_field {
            if env.set_field(handle, field, Value::Long(address as i64)).is_err() {
                env.clear_exception();
            }
        }
    }

    /// Store into an output box's `value`; a null box is ignored
    pub fn set_output<E: ManagedEnv + ?Sized>(
        &self,
        env: &E,
        kind: HandleKind,
        out: Option<ObjRef>,
        value: Value,
    ) {
        let Some(out) = out else { return };
        if let Some((_, field)) = self.resolve(env, kind).value_field {
            if env.set_field(out, field, value).is_err() {
                env.clear_exception();
            }
        }
    }

    /// Read an output box's `value`
    pub fn read_output<E: ManagedEnv + ?Sized>(
        &self,
        env: &E,
        kind: HandleKind,
        out: ObjRef,
    ) -> Option<Ret> {
        let (boxed, field) = self.resolve(env, kind).value_field?;
        let ret_kind = match boxed {
            BoxedValue::Int => RetKind::Int,
            BoxedValue::Long => RetKind::Long,
            BoxedValue::Bool => RetKind::Bool,
            BoxedValue::Object => RetKind::Object,
        };
        env.get_field(out, field, ret_kind).ok()
    }

    /// Store the per-aggregation key into a context wrapper
    pub fn set_aggregate_slot<E: ManagedEnv + ?Sized>(&self, env: &E, context: ObjRef, key: i64) {
        if let Some(field) = self.resolve(env, HandleKind::Context).aggregate_slot {
            if env.set_field(context, field, Value::Long(key)).is_err() {
                env.clear_exception();
            }
        }
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            resolutions: self.resolutions.load(Ordering::Relaxed),
            hits: self.hits.load(Ordering::Relaxed),
        }
    }

    pub fn is_resolved(&self, kind: HandleKind) -> bool {
        self.slots.read()[kind.index()].is_some()
    }

    /// Release every cached class reference; later calls resolve again
    pub fn teardown<E: ManagedEnv + ?Sized>(&self, env: &E) {
        let mut slots = self.slots.write();
        for slot in slots.iter_mut() {
            if let Some(meta) = slot.take() {
                env.delete_global_ref(meta.class);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::MockRuntime;

    #[test]
    fn test_resolve_is_cached() {
        let rt = MockRuntime::new();
        let env = rt.attach();
        let cache = HandleMetadataCache::new(BridgeConfig::default());

        let first = cache.resolve(&env, HandleKind::Statement);
        let lookups = rt.class_lookups();
        let second = cache.resolve(&env, HandleKind::Statement);

        assert_eq!(first, second);
        assert_eq!(rt.class_lookups(), lookups);
        assert_eq!(cache.stats(), CacheStats { resolutions: 1, hits: 1 });
        assert!(first.address_field.is_some());
        assert!(first.aggregate_slot.is_none());
    }

    #[test]
    fn test_context_has_aggregate_slot() {
        let rt = MockRuntime::new();
        let env = rt.attach();
        let cache = HandleMetadataCache::new(BridgeConfig::default());
        let meta = cache.resolve(&env, HandleKind::Context);
        assert!(meta.aggregate_slot.is_some());
    }

    #[test]
    fn test_wrap_read_write_address() {
        let rt = MockRuntime::new();
        let env = rt.attach();
        let cache = HandleMetadataCache::new(BridgeConfig::default());

        let stmt = cache.wrap(&env, HandleKind::Statement, 0xdead0).unwrap();
        assert_eq!(cache.read_address(&env, Some(stmt), HandleKind::Statement), 0xdead0);

        cache.write_address(&env, Some(stmt), HandleKind::Statement, 0);
        assert_eq!(cache.read_address(&env, Some(stmt), HandleKind::Statement), 0);
        assert_eq!(cache.read_address(&env, None, HandleKind::Statement), 0);
    }

    #[test]
    fn test_wrap_reports_oom() {
        let rt = MockRuntime::new();
        let env = rt.attach();
        let cache = HandleMetadataCache::new(BridgeConfig::default());
        cache.resolve(&env, HandleKind::Value);

        rt.fail_allocations_after(0);
        let err = cache.wrap(&env, HandleKind::Value, 8).unwrap_err();
        assert_eq!(err, BridgeError::OutOfMemory);
        assert!(!env.exception_check());
    }

    #[test]
    fn test_output_boxes() {
        let rt = MockRuntime::new();
        let env = rt.attach();
        let cache = HandleMetadataCache::new(BridgeConfig::default());

        let out = env.alloc_plain("org/sqlite/jni/capi/OutputPointer$Int32");
        cache.set_output(&env, HandleKind::OutInt32, Some(out), Value::Int(42));
        assert_eq!(cache.read_output(&env, HandleKind::OutInt32, out), Some(Ret::Int(42)));

        // Null output box is silently ignored.
        cache.set_output(&env, HandleKind::OutInt32, None, Value::Int(1));
    }

    #[test]
    #[should_panic(expected = "cannot resolve")]
    fn test_missing_class_is_fatal() {
        let rt = MockRuntime::new();
        let env = rt.attach();
        let config = BridgeConfig {
            class_prefix: "does/not/exist/".into(),
            ..BridgeConfig::default()
        };
        let cache = HandleMetadataCache::new(config);
        cache.resolve(&env, HandleKind::Connection);
    }

    #[test]
    fn test_teardown_forces_re_resolution() {
        let rt = MockRuntime::new();
        let env = rt.attach();
        let cache = HandleMetadataCache::new(BridgeConfig::default());
        cache.resolve(&env, HandleKind::Blob);
        let globals = rt.global_ref_count();

        cache.teardown(&env);
        assert!(!cache.is_resolved(HandleKind::Blob));
        assert_eq!(rt.global_ref_count(), globals - 1);

        cache.resolve(&env, HandleKind::Blob);
        assert_eq!(cache.stats().resolutions, 2);
    }
}

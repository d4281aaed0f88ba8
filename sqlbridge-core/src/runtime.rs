// sqlbridge-core/src/runtime.rs
//! Managed runtime abstraction
//!
//! The bridge only ever talks to the managed side through [`ManagedEnv`],
//! a narrow, JNI-shaped view of one thread's execution environment.
//!
//! ```text
//! ManagedEnv trait (one calling thread's environment)
//!   ├── JniEnv       (bindings/jni, over the jni crate's JNIEnv)
//!   └── MockEnv      (testing, in-memory object heap)
//! ```
//!
//! References handed across the trait are opaque, pointer-sized handles.
//! Whether a handle is call-scoped ("local") or long-lived ("global") is
//! decided by the call that produced it; see [`crate::refs`] for the RAII
//! guards that pair acquisition with release.

use std::num::NonZeroUsize;
use std::sync::Arc;

use thiserror::Error;

/// Opaque reference to a managed object (instance, class, array, string)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ObjRef(NonZeroUsize);

impl ObjRef {
    /// Wrap a raw handle; 0 is the managed null and yields `None`
    pub fn from_raw(raw: usize) -> Option<ObjRef> {
        NonZeroUsize::new(raw).map(ObjRef)
    }

    pub fn as_raw(self) -> usize {
        self.0.get()
    }
}

/// Resolved field identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FieldId(NonZeroUsize);

impl FieldId {
    pub fn from_raw(raw: usize) -> Option<FieldId> {
        NonZeroUsize::new(raw).map(FieldId)
    }

    pub fn as_raw(self) -> usize {
        self.0.get()
    }
}

/// Resolved method or constructor identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MethodId(NonZeroUsize);

impl MethodId {
    pub fn from_raw(raw: usize) -> Option<MethodId> {
        NonZeroUsize::new(raw).map(MethodId)
    }

    pub fn as_raw(self) -> usize {
        self.0.get()
    }
}

/// Identity of a thread's environment (one per attached thread)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct EnvId(pub usize);

/// Argument passed to a managed call or stored into a field
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Value {
    Bool(bool),
    Int(i32),
    Long(i64),
    Object(Option<ObjRef>),
}

/// Expected return shape of a managed call
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetKind {
    Void,
    Bool,
    Int,
    Long,
    Object,
}

/// Result of a managed call or field read
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Ret {
    Void,
    Bool(bool),
    Int(i32),
    Long(i64),
    Object(Option<ObjRef>),
}

impl Ret {
    pub fn as_int(self) -> i32 {
        match self {
            Ret::Int(v) => v,
            Ret::Long(v) => v as i32,
            Ret::Bool(b) => b as i32,
            _ => 0,
        }
    }

    pub fn as_object(self) -> Option<ObjRef> {
        match self {
            Ret::Object(o) => o,
            _ => None,
        }
    }
}

/// Failure reported by the managed side
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ManagedError {
    /// A managed exception is pending on this thread
    #[error("managed exception pending")]
    Exception,

    /// The runtime could not allocate an object, string or array
    #[error("managed allocation failed")]
    OutOfMemory,

    /// Lookup of a class, field or method failed
    #[error("{kind} not found: {name}")]
    NotFound { kind: &'static str, name: String },
}

pub type ManagedResult<T> = std::result::Result<T, ManagedError>;

/// Releases long-lived references from whichever thread drops them
pub trait RefReleaser: Send + Sync {
    fn delete_global_ref(&self, obj: ObjRef);
}

/// One thread's view of the managed runtime
///
/// Every method maps onto a single function of a JNI-style table. Calls that
/// can run managed code return `Err(ManagedError::Exception)` and leave the
/// exception pending; callers clear it with [`ManagedEnv::clear_exception`] or
/// [`ManagedEnv::take_exception`].
pub trait ManagedEnv {
    /// Identity of this environment (stable for the thread's lifetime)
    fn id(&self) -> EnvId;

    /// Releaser usable after this environment is gone
    fn releaser(&self) -> Arc<dyn RefReleaser>;

    // ========================================================================
    // REFLECTION
    // ========================================================================

    /// Look up a class by its slash-separated binary name (local reference)
    fn find_class(&self, name: &str) -> ManagedResult<ObjRef>;

    /// Class of an instance (local reference)
    fn object_class(&self, obj: ObjRef) -> ManagedResult<ObjRef>;

    fn field_id(&self, class: ObjRef, name: &str, sig: &str) -> ManagedResult<FieldId>;

    fn static_field_id(&self, class: ObjRef, name: &str, sig: &str) -> ManagedResult<FieldId>;

    fn method_id(&self, class: ObjRef, name: &str, sig: &str) -> ManagedResult<MethodId>;

    // ========================================================================
    // OBJECTS AND FIELDS
    // ========================================================================

    fn new_object(&self, class: ObjRef, ctor: MethodId, args: &[Value]) -> ManagedResult<ObjRef>;

    fn get_field(&self, obj: ObjRef, field: FieldId, kind: RetKind) -> ManagedResult<Ret>;

    fn set_field(&self, obj: ObjRef, field: FieldId, value: Value) -> ManagedResult<()>;

    fn get_static_field(&self, class: ObjRef, field: FieldId, kind: RetKind) -> ManagedResult<Ret>;

    /// Invoke an instance method
    fn call_method(
        &self,
        obj: ObjRef,
        method: MethodId,
        ret: RetKind,
        args: &[Value],
    ) -> ManagedResult<Ret>;

    // ========================================================================
    // REFERENCES
    // ========================================================================

    fn new_global_ref(&self, obj: ObjRef) -> ManagedResult<ObjRef>;

    fn delete_global_ref(&self, obj: ObjRef);

    fn new_local_ref(&self, obj: ObjRef) -> ManagedResult<ObjRef>;

    fn delete_local_ref(&self, obj: ObjRef);

    /// Reference identity (two handles to the same object compare equal)
    fn is_same_object(&self, a: Option<ObjRef>, b: Option<ObjRef>) -> bool;

    // ========================================================================
    // ARRAYS
    // ========================================================================

    fn new_byte_array(&self, bytes: &[u8]) -> ManagedResult<ObjRef>;

    fn byte_array_contents(&self, array: ObjRef) -> ManagedResult<Vec<u8>>;

    fn new_object_array(&self, len: usize, element_class: ObjRef) -> ManagedResult<ObjRef>;

    fn array_length(&self, array: ObjRef) -> ManagedResult<usize>;

    fn set_array_element(&self, array: ObjRef, index: usize, value: Option<ObjRef>)
        -> ManagedResult<()>;

    /// Element at `index` as a new local reference
    fn get_array_element(&self, array: ObjRef, index: usize) -> ManagedResult<Option<ObjRef>>;

    // ========================================================================
    // EXCEPTIONS
    // ========================================================================

    fn exception_check(&self) -> bool;

    /// Take and clear the pending exception (local reference to the throwable)
    fn take_exception(&self) -> Option<ObjRef>;

    /// Discard the pending exception, if any
    fn clear_exception(&self) {
        if let Some(ex) = self.take_exception() {
            self.delete_local_ref(ex);
        }
    }

    /// Terminate the process with a diagnostic; used for metadata mismatches
    fn fatal(&self, msg: &str) -> !;
}

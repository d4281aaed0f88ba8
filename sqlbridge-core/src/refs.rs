// sqlbridge-core/src/refs.rs
//! RAII guards for cross-boundary references
//!
//! Long-lived references must be released exactly once; call-scoped ones
//! should be released as soon as the call that produced them is done, so
//! long-running native loops do not exhaust the runtime's local frame.

use std::fmt;
use std::mem::ManuallyDrop;
use std::sync::Arc;

use crate::runtime::{ManagedEnv, ManagedResult, ObjRef, RefReleaser};

/// Owned long-lived reference; released on drop
pub struct GlobalRef {
    obj: ObjRef,
    releaser: Arc<dyn RefReleaser>,
}

impl GlobalRef {
    /// Acquire a new long-lived reference to `obj`
    pub fn new<E: ManagedEnv + ?Sized>(env: &E, obj: ObjRef) -> ManagedResult<GlobalRef> {
        let obj = env.new_global_ref(obj)?;
        Ok(GlobalRef {
            obj,
            releaser: env.releaser(),
        })
    }

    pub fn get(&self) -> ObjRef {
        self.obj
    }

    /// Give up ownership without releasing; the caller now owns the handle
    pub fn detach(self) -> ObjRef {
        let this = ManuallyDrop::new(self);
        // SAFETY: `this` is never dropped, so the Arc is moved out exactly once.
        let _releaser = unsafe { std::ptr::read(&this.releaser) };
        this.obj
    }

    /// Convert into a call-scoped reference owned by `env`
    ///
    /// Used when a previous hook object is handed back to the caller.
    pub fn into_local<'e, E: ManagedEnv + ?Sized>(
        self,
        env: &'e E,
    ) -> ManagedResult<LocalRef<'e, E>> {
        let local = env.new_local_ref(self.obj)?;
        Ok(LocalRef::new(env, local))
    }
}

impl Drop for GlobalRef {
    fn drop(&mut self) {
        self.releaser.delete_global_ref(self.obj);
    }
}

impl fmt::Debug for GlobalRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("GlobalRef").field(&self.obj).finish()
    }
}

/// Call-scoped reference, deleted when the guard drops
pub struct LocalRef<'e, E: ManagedEnv + ?Sized> {
    env: &'e E,
    obj: Option<ObjRef>,
}

impl<'e, E: ManagedEnv + ?Sized> LocalRef<'e, E> {
    pub fn new(env: &'e E, obj: ObjRef) -> Self {
        LocalRef { env, obj: Some(obj) }
    }

    pub fn get(&self) -> ObjRef {
        match self.obj {
            Some(obj) => obj,
            None => unreachable!("LocalRef used after release"),
        }
    }

    /// Hand the reference to the caller (e.g. as a native method's return)
    pub fn detach(mut self) -> ObjRef {
        let obj = self.get();
        self.obj = None;
        obj
    }
}

impl<E: ManagedEnv + ?Sized> Drop for LocalRef<'_, E> {
    fn drop(&mut self) {
        if let Some(obj) = self.obj.take() {
            self.env.delete_local_ref(obj);
        }
    }
}

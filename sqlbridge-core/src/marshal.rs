// sqlbridge-core/src/marshal.rs
//! Argument marshaling for native-to-managed function calls
//!
//! [`marshal_in`] wraps a callback context and its argument values in fresh
//! managed wrappers. The returned [`MarshaledArgs`] zeroes every wrapper it
//! created when dropped, so a callback that stashes an argument away ends up
//! holding an inert handle instead of a dangling native pointer.

use crate::error::{BridgeError, Result};
use crate::metadata::{HandleKind, HandleMetadataCache};
use crate::refs::LocalRef;
use crate::runtime::{ManagedEnv, ObjRef, Value};
use crate::log_trace;

/// Wrappers built for one invocation
pub struct MarshaledArgs<'a, E: ManagedEnv + ?Sized> {
    env: &'a E,
    meta: &'a HandleMetadataCache,
    context: Option<LocalRef<'a, E>>,
    args: Vec<LocalRef<'a, E>>,
    array: Option<LocalRef<'a, E>>,
}

impl<'a, E: ManagedEnv + ?Sized> MarshaledArgs<'a, E> {
    fn empty(env: &'a E, meta: &'a HandleMetadataCache) -> Self {
        MarshaledArgs {
            env,
            meta,
            context: None,
            args: Vec::new(),
            array: None,
        }
    }

    pub fn context(&self) -> Option<ObjRef> {
        self.context.as_ref().map(LocalRef::get)
    }

    /// The `sqlite3_value[]` handed to the callback, if arguments were wrapped
    pub fn array(&self) -> Option<ObjRef> {
        self.array.as_ref().map(LocalRef::get)
    }

    pub fn arg(&self, index: usize) -> Option<ObjRef> {
        self.args.get(index).map(LocalRef::get)
    }

    pub fn len(&self) -> usize {
        self.args.len()
    }

    pub fn is_empty(&self) -> bool {
        self.args.is_empty()
    }

    /// Call arguments in `(context[, values])` order
    pub fn call_args(&self) -> Vec<Value> {
        let mut out = vec![Value::Object(self.context())];
        if self.array.is_some() {
            out.push(Value::Object(self.array()));
        }
        out
    }
}

impl<E: ManagedEnv + ?Sized> Drop for MarshaledArgs<'_, E> {
    fn drop(&mut self) {
        if let Some(cx) = &self.context {
            self.meta
                .write_address(self.env, Some(cx.get()), HandleKind::Context, 0);
        }
        for arg in &self.args {
            self.meta
                .write_address(self.env, Some(arg.get()), HandleKind::Value, 0);
        }
        log_trace!("invalidated {} marshaled argument(s)", self.args.len());
    }
}

/// Wrap `ctx` and, when `argv` is given, every value in it
///
/// `aggregate_key` is written into the context's aggregation slot. On any
/// allocation failure the wrappers built so far are zeroed and released
/// and `OutOfMemory` is returned; the caller reports NOMEM to the engine.
pub fn marshal_in<'a, E: ManagedEnv + ?Sized>(
    env: &'a E,
    meta: &'a HandleMetadataCache,
    ctx: usize,
    argv: Option<&[usize]>,
    aggregate_key: Option<i64>,
) -> Result<MarshaledArgs<'a, E>> {
    let mut out = MarshaledArgs::empty(env, meta);
    let cx = meta.wrap(env, HandleKind::Context, ctx)?;
    out.context = Some(LocalRef::new(env, cx));
    if let Some(key) = aggregate_key {
        meta.set_aggregate_slot(env, cx, key);
    }

    let Some(argv) = argv else {
        return Ok(out);
    };
    let value_class = meta.resolve(env, HandleKind::Value).class;
    let array = env
        .new_object_array(argv.len(), value_class)
        .map_err(|err| {
            env.clear_exception();
            BridgeError::from(err)
        })?;
    out.array = Some(LocalRef::new(env, array));
    out.args.reserve(argv.len());
    for (i, value) in argv.iter().enumerate() {
        let wrapped = LocalRef::new(env, meta.wrap(env, HandleKind::Value, *value)?);
        if let Err(err) = env.set_array_element(array, i, Some(wrapped.get())) {
            env.clear_exception();
            meta.write_address(env, Some(wrapped.get()), HandleKind::Value, 0);
            return Err(err.into());
        }
        out.args.push(wrapped);
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BridgeConfig;
    use crate::testing::MockRuntime;

    #[test]
    fn test_wrappers_zeroed_on_drop() {
        let rt = MockRuntime::new();
        let env = rt.attach();
        let meta = HandleMetadataCache::new(BridgeConfig::default());

        let (cx, first, array) = {
            let args = marshal_in(&env, &meta, 0xc0, Some(&[0x10, 0x20]), Some(42)).unwrap();
            let cx = env.new_local_ref(args.context().unwrap()).unwrap();
            let first = env.new_local_ref(args.arg(0).unwrap()).unwrap();
            let array = env.new_local_ref(args.array().unwrap()).unwrap();
            assert_eq!(args.len(), 2);
            assert_eq!(meta.read_address(&env, Some(cx), HandleKind::Context), 0xc0);
            assert_eq!(meta.read_address(&env, Some(first), HandleKind::Value), 0x10);
            (cx, first, array)
        };

        assert_eq!(meta.read_address(&env, Some(cx), HandleKind::Context), 0);
        assert_eq!(meta.read_address(&env, Some(first), HandleKind::Value), 0);
        let second = env.get_array_element(array, 1).unwrap().unwrap();
        assert_eq!(meta.read_address(&env, Some(second), HandleKind::Value), 0);
    }

    #[test]
    fn test_context_only() {
        let rt = MockRuntime::new();
        let env = rt.attach();
        let meta = HandleMetadataCache::new(BridgeConfig::default());

        let args = marshal_in(&env, &meta, 0xc0, None, None).unwrap();
        assert!(args.array().is_none());
        assert!(args.is_empty());
        assert_eq!(args.call_args().len(), 1);
    }

    #[test]
    fn test_oom_mid_loop_releases_partial_wrappers() {
        let rt = MockRuntime::new();
        let env = rt.attach();
        let meta = HandleMetadataCache::new(BridgeConfig::default());
        meta.resolve(&env, HandleKind::Context);
        meta.resolve(&env, HandleKind::Value);
        let locals = rt.local_ref_count();

        // context, array, first value succeed; the second value fails
        rt.fail_allocations_after(3);
        let err = marshal_in(&env, &meta, 0xc0, Some(&[1, 2, 3]), None).err();
        rt.fail_allocations_after(usize::MAX);

        assert_eq!(err, Some(BridgeError::OutOfMemory));
        assert!(!env.exception_check());
        assert_eq!(rt.local_ref_count(), locals);
    }
}

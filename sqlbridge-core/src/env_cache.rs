// sqlbridge-core/src/env_cache.rs
//! Per-thread environment cache
//!
//! One entry per thread that has called into the bridge. An entry holds
//! long-lived references to the handful of runtime types every thread
//! needs (string conversion, boxed longs, `toString()` for exception
//! messages) plus scratch state that re-entrant callbacks consult.
//!
//! # Architecture
//!
//! ```text
//! EnvCache
//!   └── Mutex<EnvList>
//!         ├── nodes: Vec<Node>   (arena, never shrinks)
//!         ├── head  → in-use chain (linear lookup by EnvId)
//!         └── free  → recycled nodes
//! ```

use parking_lot::Mutex;

use crate::connection::StateKey;
use crate::error::{BridgeError, Result};
use crate::metrics::Metrics;
use crate::refs::LocalRef;
use crate::runtime::{EnvId, ManagedEnv, ManagedError, MethodId, ObjRef, Ret, RetKind, Value};
use crate::{log_debug, log_warn};

/// Long-lived per-thread references
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EnvRefs {
    pub long_class: ObjRef,
    pub long_ctor: MethodId,
    pub string_class: ObjRef,
    pub string_ctor: MethodId,
    pub string_get_bytes: MethodId,
    pub utf8: ObjRef,
    pub to_string: MethodId,
}

/// Thread-scoped state consulted by callbacks that fire mid-call
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Scratch {
    /// Statement wrapper active for tracing (local reference of the caller)
    pub tracing_stmt: Option<ObjRef>,
    /// Connection currently inside native open
    pub opening: Option<StateKey>,
}

struct Node {
    env: EnvId,
    refs: Option<EnvRefs>,
    scratch: Scratch,
    next: Option<usize>,
}

#[derive(Default)]
struct EnvList {
    nodes: Vec<Node>,
    head: Option<usize>,
    free: Option<usize>,
}

impl EnvList {
    fn find(&self, env: EnvId) -> Option<usize> {
        let mut cursor = self.head;
        while let Some(i) = cursor {
            if self.nodes[i].env == env {
                return Some(i);
            }
            cursor = self.nodes[i].next;
        }
        None
    }

    fn insert(&mut self, env: EnvId, refs: EnvRefs) -> Result<usize> {
        let node = Node {
            env,
            refs: Some(refs),
            scratch: Scratch::default(),
            next: self.head,
        };
        let index = match self.free {
            Some(i) => {
                self.free = self.nodes[i].next;
                self.nodes[i] = node;
                i
            }
            None => {
                self.nodes
                    .try_reserve(1)
                    .map_err(|_| BridgeError::OutOfMemory)?;
                self.nodes.push(node);
                self.nodes.len() - 1
            }
        };
        self.head = Some(index);
        Ok(index)
    }

    fn unlink(&mut self, env: EnvId) -> Option<EnvRefs> {
        let mut prev: Option<usize> = None;
        let mut cursor = self.head;
        while let Some(i) = cursor {
            if self.nodes[i].env == env {
                let next = self.nodes[i].next;
                match prev {
                    Some(p) => self.nodes[p].next = next,
                    None => self.head = next,
                }
                let refs = self.nodes[i].refs.take();
                self.nodes[i].scratch = Scratch::default();
                self.nodes[i].env = EnvId(0);
                self.nodes[i].next = self.free;
                self.free = Some(i);
                return refs;
            }
            prev = cursor;
            cursor = self.nodes[i].next;
        }
        None
    }
}

/// Entry counts for diagnostics
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EnvCacheStats {
    pub live: usize,
    pub free: usize,
}

pub struct EnvCache {
    list: Mutex<EnvList>,
}

impl Default for EnvCache {
    fn default() -> Self {
        Self::new()
    }
}

impl EnvCache {
    pub fn new() -> Self {
        EnvCache {
            list: Mutex::new(EnvList::default()),
        }
    }

    /// References for the calling thread, creating the entry on first use
    pub fn for_current_thread<E: ManagedEnv + ?Sized>(&self, env: &E, metrics: &Metrics) -> EnvRefs {
        {
            let list = self.list.lock();
            if let Some(i) = list.find(env.id()) {
                if let Some(refs) = list.nodes[i].refs {
                    metrics.incr(&metrics.env_hits);
                    return refs;
                }
            }
        }
        metrics.incr(&metrics.env_misses);

        // Only this thread creates its own entry, so resolving outside the
        // lock cannot race with another insert for the same EnvId.
        let refs = match resolve_refs(env) {
            Ok(refs) => refs,
            Err(err) => {
                env.clear_exception();
                env.fatal(&format!("cannot initialize thread environment: {}", err))
            }
        };
        if let Err(err) = self.list.lock().insert(env.id(), refs) {
            release_refs(env, &refs);
            env.fatal(&format!("cannot cache thread environment: {}", err));
        }
        log_debug!("cached environment {:?}", env.id());
        refs
    }

    /// Drop the calling thread's entry; false if it had none
    pub fn evict<E: ManagedEnv + ?Sized>(&self, env: &E, metrics: &Metrics) -> bool {
        let refs = self.list.lock().unlink(env.id());
        match refs {
            Some(refs) => {
                release_refs(env, &refs);
                metrics.incr(&metrics.env_evictions);
                log_debug!("evicted environment {:?}", env.id());
                true
            }
            None => false,
        }
    }

    /// Evict every entry (bridge shutdown)
    pub fn clear<E: ManagedEnv + ?Sized>(&self, env: &E) -> usize {
        let drained: Vec<EnvRefs> = {
            let mut list = self.list.lock();
            let mut envs = Vec::new();
            let mut cursor = list.head;
            while let Some(i) = cursor {
                envs.push(list.nodes[i].env);
                cursor = list.nodes[i].next;
            }
            envs.into_iter().filter_map(|id| list.unlink(id)).collect()
        };
        for refs in &drained {
            release_refs(env, refs);
        }
        drained.len()
    }

    pub fn scratch(&self, env: EnvId) -> Scratch {
        let list = self.list.lock();
        list.find(env)
            .map(|i| list.nodes[i].scratch)
            .unwrap_or_default()
    }

    fn update_scratch(&self, env: EnvId, f: impl FnOnce(&mut Scratch)) {
        let mut list = self.list.lock();
        match list.find(env) {
            Some(i) => f(&mut list.nodes[i].scratch),
            None => log_warn!("scratch update for uncached environment {:?}", env),
        }
    }

    /// Make `stmt` the tracing statement until the guard drops
    pub fn enter_tracing(&self, env: EnvId, stmt: Option<ObjRef>) -> ScratchGuard<'_> {
        let prev = self.scratch(env).tracing_stmt;
        self.update_scratch(env, |s| s.tracing_stmt = stmt);
        ScratchGuard {
            cache: self,
            env,
            restore: Restore::Tracing(prev),
        }
    }

    /// Mark `key` as the connection mid-open until the guard drops
    pub fn enter_opening(&self, env: EnvId, key: StateKey) -> ScratchGuard<'_> {
        let prev = self.scratch(env).opening;
        self.update_scratch(env, |s| s.opening = Some(key));
        ScratchGuard {
            cache: self,
            env,
            restore: Restore::Opening(prev),
        }
    }

    /// Forget the mid-open connection once the native side knows it
    pub fn clear_opening(&self, env: EnvId) {
        self.update_scratch(env, |s| s.opening = None);
    }

    pub fn stats(&self) -> EnvCacheStats {
        let list = self.list.lock();
        let mut live = 0;
        let mut cursor = list.head;
        while let Some(i) = cursor {
            live += 1;
            cursor = list.nodes[i].next;
        }
        EnvCacheStats {
            live,
            free: list.nodes.len() - live,
        }
    }

    pub fn len(&self) -> usize {
        self.stats().live
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

enum Restore {
    Tracing(Option<ObjRef>),
    Opening(Option<StateKey>),
}

/// Restores one scratch field when dropped, on every exit path
pub struct ScratchGuard<'a> {
    cache: &'a EnvCache,
    env: EnvId,
    restore: Restore,
}

impl Drop for ScratchGuard<'_> {
    fn drop(&mut self) {
        match self.restore {
            Restore::Tracing(prev) => self.cache.update_scratch(self.env, |s| s.tracing_stmt = prev),
            Restore::Opening(prev) => self.cache.update_scratch(self.env, |s| s.opening = prev),
        }
    }
}

fn resolve_refs<E: ManagedEnv + ?Sized>(env: &E) -> std::result::Result<EnvRefs, ManagedError> {
    let long_local = LocalRef::new(env, env.find_class("java/lang/Long")?);
    let long_ctor = env.method_id(long_local.get(), "<init>", "(J)V")?;

    let string_local = LocalRef::new(env, env.find_class("java/lang/String")?);
    let string_ctor = env.method_id(
        string_local.get(),
        "<init>",
        "([BLjava/nio/charset/Charset;)V",
    )?;
    let string_get_bytes = env.method_id(
        string_local.get(),
        "getBytes",
        "(Ljava/nio/charset/Charset;)[B",
    )?;

    let object_local = LocalRef::new(env, env.find_class("java/lang/Object")?);
    let to_string = env.method_id(object_local.get(), "toString", "()Ljava/lang/String;")?;

    let charsets = LocalRef::new(env, env.find_class("java/nio/charset/StandardCharsets")?);
    let utf8_field = env.static_field_id(charsets.get(), "UTF_8", "Ljava/nio/charset/Charset;")?;
    let utf8_local = env
        .get_static_field(charsets.get(), utf8_field, RetKind::Object)?
        .as_object()
        .ok_or(ManagedError::NotFound {
            kind: "static field value",
            name: "StandardCharsets.UTF_8".into(),
        })?;
    let utf8_local = LocalRef::new(env, utf8_local);

    let long_class = env.new_global_ref(long_local.get())?;
    let string_class = env.new_global_ref(string_local.get())?;
    let utf8 = env.new_global_ref(utf8_local.get())?;
    Ok(EnvRefs {
        long_class,
        long_ctor,
        string_class,
        string_ctor,
        string_get_bytes,
        utf8,
        to_string,
    })
}

fn release_refs<E: ManagedEnv + ?Sized>(env: &E, refs: &EnvRefs) {
    env.delete_global_ref(refs.long_class);
    env.delete_global_ref(refs.string_class);
    env.delete_global_ref(refs.utf8);
}

impl EnvRefs {
    /// UTF-8 text as a managed String (local reference)
    pub fn to_managed_string<E: ManagedEnv + ?Sized>(&self, env: &E, s: &str) -> Result<ObjRef> {
        let bytes = env.new_byte_array(s.as_bytes()).map_err(|e| oom(env, e))?;
        let bytes = LocalRef::new(env, bytes);
        env.new_object(
            self.string_class,
            self.string_ctor,
            &[Value::Object(Some(bytes.get())), Value::Object(Some(self.utf8))],
        )
        .map_err(|e| oom(env, e))
    }

    /// Optional variant: `None` maps to the managed null
    pub fn to_managed_opt<E: ManagedEnv + ?Sized>(
        &self,
        env: &E,
        s: Option<&str>,
    ) -> Result<Option<ObjRef>> {
        s.map(|s| self.to_managed_string(env, s)).transpose()
    }

    /// Managed String as UTF-8 text
    pub fn from_managed_string<E: ManagedEnv + ?Sized>(&self, env: &E, s: ObjRef) -> Result<String> {
        let bytes = env
            .call_method(s, self.string_get_bytes, RetKind::Object, &[Value::Object(Some(self.utf8))])
            .map_err(|e| oom(env, e))?
            .as_object()
            .ok_or(BridgeError::OutOfMemory)?;
        let bytes = LocalRef::new(env, bytes);
        let raw = env.byte_array_contents(bytes.get()).map_err(|e| oom(env, e))?;
        Ok(String::from_utf8_lossy(&raw).into_owned())
    }

    /// Boxed `java.lang.Long` (local reference)
    pub fn new_boxed_long<E: ManagedEnv + ?Sized>(&self, env: &E, v: i64) -> Result<ObjRef> {
        env.new_object(self.long_class, self.long_ctor, &[Value::Long(v)])
            .map_err(|e| oom(env, e))
    }

    /// Take the pending exception and render it with `toString()`
    ///
    /// Always leaves the thread with no pending exception. Returns `None`
    /// when nothing was pending or the rendering itself failed.
    pub fn exception_message<E: ManagedEnv + ?Sized>(&self, env: &E) -> Option<String> {
        let ex = LocalRef::new(env, env.take_exception()?);
        let rendered = match env.call_method(ex.get(), self.to_string, RetKind::Object, &[]) {
            Ok(Ret::Object(Some(s))) => LocalRef::new(env, s),
            _ => {
                env.clear_exception();
                return None;
            }
        };
        let msg = self.from_managed_string(env, rendered.get()).ok();
        env.clear_exception();
        msg
    }
}

fn oom<E: ManagedEnv + ?Sized>(env: &E, _err: ManagedError) -> BridgeError {
    env.clear_exception();
    BridgeError::OutOfMemory
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::MockRuntime;

    #[test]
    fn test_first_call_misses_then_hits() {
        let rt = MockRuntime::new();
        let env = rt.attach();
        let cache = EnvCache::new();
        let metrics = Metrics::new(true);

        let a = cache.for_current_thread(&env, &metrics);
        let b = cache.for_current_thread(&env, &metrics);
        assert_eq!(a, b);
        assert_eq!(metrics.snapshot().env_misses, 1);
        assert_eq!(metrics.snapshot().env_hits, 1);
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn test_evict_releases_and_recycles() {
        let rt = MockRuntime::new();
        let env = rt.attach();
        let cache = EnvCache::new();
        let metrics = Metrics::new(true);

        let globals = rt.global_ref_count();
        cache.for_current_thread(&env, &metrics);
        assert_eq!(rt.global_ref_count(), globals + 3);

        assert!(cache.evict(&env, &metrics));
        assert!(!cache.evict(&env, &metrics));
        assert_eq!(rt.global_ref_count(), globals);
        assert_eq!(cache.stats(), EnvCacheStats { live: 0, free: 1 });

        cache.for_current_thread(&env, &metrics);
        assert_eq!(cache.stats(), EnvCacheStats { live: 1, free: 0 });
    }

    #[test]
    fn test_one_entry_per_thread() {
        let rt = MockRuntime::new();
        let cache = EnvCache::new();
        let metrics = Metrics::new(true);

        crossbeam::thread::scope(|s| {
            for _ in 0..4 {
                s.spawn(|_| {
                    let env = rt.attach();
                    cache.for_current_thread(&env, &metrics);
                    cache.for_current_thread(&env, &metrics);
                });
            }
        })
        .unwrap();

        assert_eq!(cache.len(), 4);
        assert_eq!(metrics.snapshot().env_misses, 4);
        let env = rt.attach();
        assert_eq!(cache.clear(&env), 4);
        assert!(cache.is_empty());
    }

    #[test]
    fn test_scratch_guards_restore_in_order() {
        let rt = MockRuntime::new();
        let env = rt.attach();
        let cache = EnvCache::new();
        let metrics = Metrics::new(true);
        cache.for_current_thread(&env, &metrics);

        let outer = env.alloc_plain("test/Stmt");
        let inner = env.alloc_plain("test/Stmt");
        {
            let _g1 = cache.enter_tracing(env.id(), Some(outer));
            {
                let _g2 = cache.enter_tracing(env.id(), Some(inner));
                assert_eq!(cache.scratch(env.id()).tracing_stmt, Some(inner));
            }
            assert_eq!(cache.scratch(env.id()).tracing_stmt, Some(outer));
        }
        assert_eq!(cache.scratch(env.id()).tracing_stmt, None);
    }

    #[test]
    fn test_scratch_restored_on_panic() {
        let rt = MockRuntime::new();
        let env = rt.attach();
        let cache = EnvCache::new();
        let metrics = Metrics::new(true);
        cache.for_current_thread(&env, &metrics);
        let stmt = env.alloc_plain("test/Stmt");

        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            let _g = cache.enter_tracing(env.id(), Some(stmt));
            panic!("callback blew up");
        }));
        assert!(result.is_err());
        assert_eq!(cache.scratch(env.id()), Scratch::default());
    }

    #[test]
    fn test_string_round_trip_utf8() {
        let rt = MockRuntime::new();
        let env = rt.attach();
        let cache = EnvCache::new();
        let refs = cache.for_current_thread(&env, &Metrics::new(false));

        let s = refs.to_managed_string(&env, "héllo wörld").unwrap();
        assert_eq!(refs.from_managed_string(&env, s).unwrap(), "héllo wörld");
    }

    #[test]
    fn test_exception_message_clears_pending() {
        let rt = MockRuntime::new();
        let env = rt.attach();
        let cache = EnvCache::new();
        let refs = cache.for_current_thread(&env, &Metrics::new(false));

        env.throw("java.lang.IllegalStateException: nope");
        assert!(env.exception_check());
        let msg = refs.exception_message(&env);
        assert_eq!(msg.as_deref(), Some("java.lang.IllegalStateException: nope"));
        assert!(!env.exception_check());
        assert_eq!(refs.exception_message(&env), None);
    }
}

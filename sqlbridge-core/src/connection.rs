// sqlbridge-core/src/connection.rs
//! Connection state allocator
//!
//! One [`ConnectionState`] per live native connection, kept in an arena of
//! fixed blocks. Released blocks are zeroed and pushed onto a free list so
//! a later open reuses them instead of growing the arena.
//!
//! # Architecture
//!
//! ```text
//! ConnectionAllocator
//!   └── Mutex<Arena>
//!         ├── blocks: Vec<Block>
//!         ├── used → in-use chain (linear lookup by native pointer)
//!         └── free → recycled chain
//! ```
//!
//! The lock is held only for list surgery and slot swaps. Managed code
//! (hook teardown, callbacks) always runs after it is released.

use std::ffi::CString;

use parking_lot::Mutex;

use crate::error::{BridgeError, Result};
use crate::hooks::{HookKind, HookSlot, LocalHook};
use crate::metrics::Metrics;
use crate::refs::{GlobalRef, LocalRef};
use crate::runtime::{ManagedEnv, ObjRef};
use crate::{log_debug, log_trace};

/// Handle to an allocated block; stale keys never match a recycled block
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct StateKey {
    index: u32,
    generation: u32,
}

impl StateKey {
    pub fn index(self) -> usize {
        self.index as usize
    }
}

/// Per-connection bridge state
#[derive(Debug, Default)]
pub struct ConnectionState {
    native: usize,
    wrapper: Option<GlobalRef>,
    main_db_name: Option<CString>,
    hooks: [HookSlot; HookKind::PER_CONNECTION],
    statements: Vec<usize>,
    last_error: Option<String>,
}

impl ConnectionState {
    pub fn native(&self) -> usize {
        self.native
    }

    /// Long-lived reference to the connection wrapper the caller holds
    pub fn wrapper(&self) -> Option<ObjRef> {
        self.wrapper.as_ref().map(GlobalRef::get)
    }

    pub fn hook(&self, kind: HookKind) -> &HookSlot {
        &self.hooks[kind.index()]
    }

    pub fn hook_mut(&mut self, kind: HookKind) -> &mut HookSlot {
        &mut self.hooks[kind.index()]
    }

    pub fn bound_hooks(&self) -> usize {
        self.hooks.iter().filter(|h| h.is_bound()).count()
    }

    pub fn main_db_name(&self) -> Option<&CString> {
        self.main_db_name.as_ref()
    }

    /// Swap the owned name buffer, returning the previous one
    pub fn replace_main_db_name(&mut self, name: Option<CString>) -> Option<CString> {
        std::mem::replace(&mut self.main_db_name, name)
    }

    pub fn add_statement(&mut self, stmt: usize) -> Result<()> {
        self.statements
            .try_reserve(1)
            .map_err(|_| BridgeError::OutOfMemory)?;
        self.statements.push(stmt);
        Ok(())
    }

    pub fn remove_statement(&mut self, stmt: usize) -> bool {
        match self.statements.iter().position(|s| *s == stmt) {
            Some(i) => {
                self.statements.swap_remove(i);
                true
            }
            None => false,
        }
    }

    pub fn has_statement(&self, stmt: usize) -> bool {
        self.statements.contains(&stmt)
    }

    pub fn set_last_error(&mut self, msg: Option<String>) {
        self.last_error = msg;
    }

    pub fn last_error(&self) -> Option<&str> {
        self.last_error.as_deref()
    }
}

struct Block {
    state: ConnectionState,
    generation: u32,
    in_use: bool,
    next: Option<usize>,
}

#[derive(Default)]
struct Arena {
    blocks: Vec<Block>,
    used: Option<usize>,
    free: Option<usize>,
}

impl Arena {
    fn get(&self, key: StateKey) -> Option<&Block> {
        self.blocks
            .get(key.index())
            .filter(|b| b.in_use && b.generation == key.generation)
    }

    fn get_mut(&mut self, key: StateKey) -> Option<&mut Block> {
        self.blocks
            .get_mut(key.index())
            .filter(|b| b.in_use && b.generation == key.generation)
    }

    fn find_native(&self, native: usize) -> Option<usize> {
        if native == 0 {
            return None;
        }
        let mut cursor = self.used;
        while let Some(i) = cursor {
            if self.blocks[i].state.native == native {
                return Some(i);
            }
            cursor = self.blocks[i].next;
        }
        None
    }

    fn key_of(&self, index: usize) -> StateKey {
        StateKey {
            index: index as u32,
            generation: self.blocks[index].generation,
        }
    }

    fn unlink_used(&mut self, index: usize) -> bool {
        let mut prev: Option<usize> = None;
        let mut cursor = self.used;
        while let Some(i) = cursor {
            if i == index {
                let next = self.blocks[i].next;
                match prev {
                    Some(p) => self.blocks[p].next = next,
                    None => self.used = next,
                }
                return true;
            }
            prev = cursor;
            cursor = self.blocks[i].next;
        }
        false
    }

    fn chain(&self, mut cursor: Option<usize>) -> Vec<usize> {
        let mut out = Vec::new();
        while let Some(i) = cursor {
            out.push(i);
            cursor = self.blocks[i].next;
        }
        out
    }
}

/// Block counts for diagnostics
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AllocatorStats {
    pub in_use: usize,
    pub free: usize,
    pub capacity: usize,
}

pub struct ConnectionAllocator {
    arena: Mutex<Arena>,
}

impl ConnectionAllocator {
    pub fn new(capacity: usize) -> Self {
        let mut arena = Arena::default();
        arena.blocks.reserve(capacity);
        ConnectionAllocator {
            arena: Mutex::new(arena),
        }
    }

    /// Allocate a zeroed state for `native` (0 while an open is in flight)
    pub fn allocate<E: ManagedEnv + ?Sized>(
        &self,
        env: &E,
        native: usize,
        wrapper: ObjRef,
        metrics: &Metrics,
    ) -> Result<StateKey> {
        let wrapper = GlobalRef::new(env, wrapper).map_err(|_| {
            env.clear_exception();
            BridgeError::OutOfMemory
        })?;
        let state = ConnectionState {
            native,
            wrapper: Some(wrapper),
            ..ConnectionState::default()
        };

        let mut arena = self.arena.lock();
        if native != 0 && arena.find_native(native).is_some() {
            return Err(BridgeError::misuse(format!(
                "connection {:#x} already has bridge state",
                native
            )));
        }
        let index = match arena.free {
            Some(i) => {
                arena.free = arena.blocks[i].next;
                metrics.incr(&metrics.connections_recycled);
                i
            }
            None => {
                arena
                    .blocks
                    .try_reserve(1)
                    .map_err(|_| BridgeError::OutOfMemory)?;
                arena.blocks.push(Block {
                    state: ConnectionState::default(),
                    generation: 0,
                    in_use: false,
                    next: None,
                });
                metrics.incr(&metrics.connections_allocated);
                arena.blocks.len() - 1
            }
        };
        let used = arena.used;
        let block = &mut arena.blocks[index];
        block.state = state;
        block.in_use = true;
        block.next = used;
        arena.used = Some(index);
        log_trace!("allocated connection state #{} for {:#x}", index, native);
        Ok(arena.key_of(index))
    }

    /// In-use state for `native`, if any
    pub fn lookup(&self, native: usize) -> Option<StateKey> {
        let arena = self.arena.lock();
        arena.find_native(native).map(|i| arena.key_of(i))
    }

    /// Record the native pointer once open produced it
    pub fn attach_native(&self, key: StateKey, native: usize) -> bool {
        let mut arena = self.arena.lock();
        match arena.get_mut(key) {
            Some(block) => {
                block.state.native = native;
                true
            }
            None => false,
        }
    }

    /// Run `f` on the state under the allocator lock
    ///
    /// `f` must not call into managed code.
    pub fn with<R>(&self, key: StateKey, f: impl FnOnce(&mut ConnectionState) -> R) -> Option<R> {
        let mut arena = self.arena.lock();
        arena.get_mut(key).map(|b| f(&mut b.state))
    }

    /// Like [`ConnectionAllocator::with`], addressed by native pointer
    pub fn with_native<R>(
        &self,
        native: usize,
        f: impl FnOnce(&mut ConnectionState) -> R,
    ) -> Option<R> {
        let mut arena = self.arena.lock();
        let index = arena.find_native(native)?;
        Some(f(&mut arena.blocks[index].state))
    }

    /// Install `slot` for `kind`, returning the previous binding
    ///
    /// The caller unbinds the returned slot once the lock is gone.
    pub fn replace_hook(&self, native: usize, kind: HookKind, slot: HookSlot) -> Option<HookSlot> {
        self.with_native(native, |st| std::mem::replace(st.hook_mut(kind), slot))
    }

    /// Call-local copy of a hook plus the connection wrapper
    pub fn dup_hook<'e, E: ManagedEnv + ?Sized>(
        &self,
        env: &'e E,
        native: usize,
        kind: HookKind,
    ) -> Option<(LocalHook<'e, E>, Option<LocalRef<'e, E>>)> {
        self.with_native(native, |st| {
            let hook = st.hook(kind).local_dup(env)?;
            let wrapper = st
                .wrapper()
                .and_then(|w| env.new_local_ref(w).ok())
                .map(|w| LocalRef::new(env, w));
            Some((hook, wrapper))
        })
        .flatten()
    }

    /// True if `stmt` was prepared on a still-live connection
    pub fn owns_statement(&self, stmt: usize) -> bool {
        let arena = self.arena.lock();
        let mut cursor = arena.used;
        while let Some(i) = cursor {
            if arena.blocks[i].state.has_statement(stmt) {
                return true;
            }
            cursor = arena.blocks[i].next;
        }
        false
    }

    /// Forget `stmt` wherever it is registered
    pub fn forget_statement(&self, stmt: usize) -> bool {
        let mut arena = self.arena.lock();
        let mut cursor = arena.used;
        while let Some(i) = cursor {
            if arena.blocks[i].state.remove_statement(stmt) {
                return true;
            }
            cursor = arena.blocks[i].next;
        }
        false
    }

    /// Tear down a state after the native close completed
    ///
    /// All hook slots are unbound (teardown included) after the block is
    /// back on the free list and the lock is released.
    pub fn release<E: ManagedEnv + ?Sized>(&self, env: &E, key: StateKey, metrics: &Metrics) -> bool {
        let taken = {
            let mut arena = self.arena.lock();
            if arena.get(key).is_none() {
                return false;
            }
            let index = key.index();
            arena.unlink_used(index);
            let free = arena.free;
            let block = &mut arena.blocks[index];
            let taken = std::mem::take(&mut block.state);
            block.in_use = false;
            block.generation = block.generation.wrapping_add(1);
            block.next = free;
            arena.free = Some(index);
            taken
        };
        let mut taken = taken;
        for slot in taken.hooks.iter_mut() {
            slot.unbind(env);
        }
        metrics.incr(&metrics.connections_released);
        log_debug!("released connection state #{} ({:#x})", key.index(), taken.native);
        true
    }

    pub fn stats(&self) -> AllocatorStats {
        let arena = self.arena.lock();
        AllocatorStats {
            in_use: arena.chain(arena.used).len(),
            free: arena.chain(arena.free).len(),
            capacity: arena.blocks.len(),
        }
    }

    /// Block indices in free-list order
    pub fn free_list(&self) -> Vec<usize> {
        let arena = self.arena.lock();
        arena.chain(arena.free)
    }

    /// Native pointers of every in-use state
    pub fn live_natives(&self) -> Vec<usize> {
        let arena = self.arena.lock();
        arena
            .chain(arena.used)
            .into_iter()
            .map(|i| arena.blocks[i].state.native)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::Ret;
    use crate::testing::MockRuntime;

    #[test]
    fn test_allocate_lookup_release() {
        let rt = MockRuntime::new();
        let env = rt.attach();
        let metrics = Metrics::new(true);
        let alloc = ConnectionAllocator::new(2);
        let wrapper = env.alloc_plain("org/sqlite/jni/capi/sqlite3");

        let key = alloc.allocate(&env, 0x1000, wrapper, &metrics).unwrap();
        assert_eq!(alloc.lookup(0x1000), Some(key));
        assert_eq!(alloc.lookup(0x2000), None);
        assert_eq!(alloc.lookup(0), None);

        assert!(alloc.release(&env, key, &metrics));
        assert!(!alloc.release(&env, key, &metrics));
        assert_eq!(alloc.lookup(0x1000), None);
        assert_eq!(alloc.free_list(), vec![0]);
    }

    #[test]
    fn test_duplicate_native_pointer_rejected() {
        let rt = MockRuntime::new();
        let env = rt.attach();
        let metrics = Metrics::new(true);
        let alloc = ConnectionAllocator::new(2);
        let wrapper = env.alloc_plain("org/sqlite/jni/capi/sqlite3");

        alloc.allocate(&env, 0x1000, wrapper, &metrics).unwrap();
        let err = alloc.allocate(&env, 0x1000, wrapper, &metrics).unwrap_err();
        assert!(matches!(err, BridgeError::Misuse(_)));
    }

    #[test]
    fn test_release_zeroes_and_recycles() {
        let rt = MockRuntime::new();
        let env = rt.attach();
        let metrics = Metrics::new(true);
        let alloc = ConnectionAllocator::new(1);
        let class = rt.callback_class("test/CommitHook", "()I", |_, _| Ok(Ret::Int(0)));
        let hook = env.alloc_plain(&class);
        let wrapper = env.alloc_plain("org/sqlite/jni/capi/sqlite3");
        let globals = rt.global_ref_count();

        let key = alloc.allocate(&env, 0xaa, wrapper, &metrics).unwrap();
        let slot = HookSlot::resolve(&env, hook, "call", "()I", false).unwrap();
        assert!(alloc.replace_hook(0xaa, HookKind::Commit, slot).unwrap().callback().is_none());
        assert_eq!(alloc.with(key, |st| st.bound_hooks()), Some(1));

        alloc.release(&env, key, &metrics);
        assert_eq!(rt.global_ref_count(), globals);

        let again = alloc.allocate(&env, 0xbb, wrapper, &metrics).unwrap();
        assert_eq!(again.index(), key.index());
        assert_ne!(again, key);
        assert_eq!(alloc.with(again, |st| st.bound_hooks()), Some(0));
        assert_eq!(alloc.with(key, |st| st.bound_hooks()), None);
        assert_eq!(metrics.snapshot().connections_recycled, 1);
    }

    #[test]
    fn test_statement_registry() {
        let rt = MockRuntime::new();
        let env = rt.attach();
        let metrics = Metrics::new(false);
        let alloc = ConnectionAllocator::new(1);
        let wrapper = env.alloc_plain("org/sqlite/jni/capi/sqlite3");
        let key = alloc.allocate(&env, 0x10, wrapper, &metrics).unwrap();

        alloc.with(key, |st| st.add_statement(0x99)).unwrap().unwrap();
        assert!(alloc.owns_statement(0x99));
        assert!(alloc.forget_statement(0x99));
        assert!(!alloc.owns_statement(0x99));

        alloc.with(key, |st| st.add_statement(0x98)).unwrap().unwrap();
        alloc.release(&env, key, &metrics);
        assert!(!alloc.owns_statement(0x98));
    }

    #[test]
    fn test_attach_native_after_open() {
        let rt = MockRuntime::new();
        let env = rt.attach();
        let metrics = Metrics::new(false);
        let alloc = ConnectionAllocator::new(1);
        let wrapper = env.alloc_plain("org/sqlite/jni/capi/sqlite3");

        let key = alloc.allocate(&env, 0, wrapper, &metrics).unwrap();
        assert_eq!(alloc.lookup(0x77), None);
        assert!(alloc.attach_native(key, 0x77));
        assert_eq!(alloc.lookup(0x77), Some(key));
        assert_eq!(alloc.live_natives(), vec![0x77]);
    }
}

// sqlbridge-core/src/auto_ext.rs
//! Process-wide auto-extension list
//!
//! Auto-extensions run inside every native open, in registration order,
//! with the wrapper of the connection being opened. The native engine only
//! knows about a single runner; this list is what the runner walks.

use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::Mutex;

use crate::config::BridgeConfig;
use crate::env_cache::EnvRefs;
use crate::error::{codes, BridgeError, Result};
use crate::hooks::{HookKind, HookSlot, LocalHook};
use crate::metrics::Metrics;
use crate::runtime::{ManagedEnv, ObjRef, Value};
use crate::{log_debug, log_trace};

#[derive(Default)]
pub struct AutoExtensionRegistry {
    entries: Mutex<Vec<HookSlot>>,
    runner_installed: AtomicBool,
}

impl AutoExtensionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append `obj`; registering an object already present does nothing
    ///
    /// Returns whether the list changed.
    pub fn add<E: ManagedEnv + ?Sized>(&self, env: &E, obj: ObjRef, config: &BridgeConfig) -> Result<bool> {
        if self.contains(env, obj) {
            return Ok(false);
        }
        let slot = HookSlot::for_kind(env, obj, HookKind::AutoExtension, config)?;
        let mut entries = self.entries.lock();
        if entries.iter().any(|s| s.rebind_noop(env, obj)) {
            return Ok(false);
        }
        entries.try_reserve(1).map_err(|_| BridgeError::OutOfMemory)?;
        entries.push(slot);
        log_debug!("auto-extension registered ({} total)", entries.len());
        Ok(true)
    }

    pub fn contains<E: ManagedEnv + ?Sized>(&self, env: &E, obj: ObjRef) -> bool {
        self.entries.lock().iter().any(|s| s.rebind_noop(env, obj))
    }

    /// Remove the most recently added match for `obj`
    pub fn cancel<E: ManagedEnv + ?Sized>(&self, env: &E, obj: ObjRef) -> bool {
        let removed = {
            let mut entries = self.entries.lock();
            match entries.iter().rposition(|s| s.rebind_noop(env, obj)) {
                Some(i) => Some(entries.swap_remove(i)),
                None => None,
            }
        };
        match removed {
            Some(mut slot) => {
                slot.unbind(env);
                true
            }
            None => false,
        }
    }

    /// Forget every managed auto-extension; the native runner stays installed
    pub fn reset<E: ManagedEnv + ?Sized>(&self, env: &E) {
        let drained = std::mem::take(&mut *self.entries.lock());
        for mut slot in drained {
            slot.unbind(env);
        }
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// True exactly once per registry: the caller installs the native runner
    pub fn claim_runner_install(&self) -> bool {
        self.runner_installed
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Undo a claim whose native installation failed
    pub fn release_runner_claim(&self) {
        self.runner_installed.store(false, Ordering::Release);
    }

    /// Run every entry against `db_wrapper`, stopping at the first failure
    ///
    /// Entries are copied out before any managed code runs, so an extension
    /// may register or cancel others without deadlocking.
    pub fn run<E: ManagedEnv + ?Sized>(
        &self,
        env: &E,
        db_wrapper: ObjRef,
        refs: &EnvRefs,
        metrics: &Metrics,
    ) -> Result<()> {
        let snapshot: Vec<LocalHook<'_, E>> = {
            let entries = self.entries.lock();
            entries.iter().filter_map(|s| s.local_dup(env)).collect()
        };
        for hook in snapshot {
            metrics.incr(&metrics.auto_ext_runs);
            metrics.hook_called(HookKind::AutoExtension);
            let ret = env.call_method(
                hook.obj.get(),
                hook.method,
                HookKind::AutoExtension.return_kind(),
                &[Value::Object(Some(db_wrapper))],
            );
            match ret {
                Ok(ret) => {
                    let rc = ret.as_int();
                    if rc != codes::SQLITE_OK {
                        log_trace!("auto-extension returned {}", rc);
                        return Err(BridgeError::Engine {
                            code: rc,
                            message: format!("auto-extension returned {}", rc),
                        });
                    }
                }
                Err(_) => {
                    let msg = refs
                        .exception_message(env)
                        .unwrap_or_else(|| "<unprintable exception>".to_string());
                    env.clear_exception();
                    return Err(BridgeError::Error(format!("auto-extension threw: {}", msg)));
                }
            }
        }
        Ok(())
    }
}

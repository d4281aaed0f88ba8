//! Process-wide `JavaVM` and per-thread environment lookup
//!
//! Engine callbacks arrive on whatever thread is inside SQLite. They find
//! their environment through the VM captured in `JNI_OnLoad`.

use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, OnceLock};

use jni::{JNIEnv, JavaVM};
use lazy_static::lazy_static;
use sqlbridge_core::{log_error, log_warn, ObjRef, RefReleaser};

use crate::env::{release_global, JniEnv};

static VM: OnceLock<JavaVM> = OnceLock::new();

lazy_static! {
    static ref RELEASER: Arc<VmReleaser> = Arc::new(VmReleaser);
}

pub(crate) fn install(vm: JavaVM) {
    if VM.set(vm).is_err() {
        log_warn!("library loaded twice; keeping the first JavaVM");
    }
}

/// Environment of the calling thread, attaching it as a daemon if needed
pub(crate) fn current_env() -> Option<JniEnv<'static>> {
    let vm = VM.get()?;
    let env = match vm.get_env() {
        Ok(env) => env,
        Err(_) => vm.attach_current_thread_as_daemon().ok()?,
    };
    Some(JniEnv::new(env))
}

/// Run a native callback against the calling thread's environment
///
/// A panic never unwinds into SQLite; `fallback` is returned instead.
pub(crate) fn callback<R>(what: &str, fallback: R, f: impl FnOnce(&JniEnv<'static>) -> R) -> R {
    let Some(env) = current_env() else {
        log_error!("{} callback on a thread with no managed environment", what);
        return fallback;
    };
    match panic::catch_unwind(AssertUnwindSafe(|| f(&env))) {
        Ok(r) => r,
        Err(_) => {
            log_error!("panic in {} callback", what);
            fallback
        }
    }
}

/// Run an exported native method; a panic never unwinds into the runtime
pub(crate) fn entry<'local, R>(
    env: JNIEnv<'local>,
    what: &str,
    fallback: R,
    f: impl FnOnce(&JniEnv<'local>) -> R,
) -> R {
    let env = JniEnv::new(env);
    match panic::catch_unwind(AssertUnwindSafe(|| f(&env))) {
        Ok(r) => r,
        Err(_) => {
            log_error!("panic in {}", what);
            fallback
        }
    }
}

pub(crate) fn releaser() -> Arc<dyn RefReleaser> {
    RELEASER.clone()
}

/// Deletes global references from any thread
struct VmReleaser;

impl RefReleaser for VmReleaser {
    fn delete_global_ref(&self, obj: ObjRef) {
        release_global(obj);
    }
}

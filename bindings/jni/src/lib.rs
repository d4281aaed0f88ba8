//! sqlbridge JNI layer
//!
//! This crate is the shared library the managed runtime loads. It supplies
//! the two production implementations of the core traits:
//!
//! - [`env::JniEnv`]: `ManagedEnv` over the `jni` crate's `JNIEnv`
//! - [`engine::Sqlite3Engine`]: `NativeEngine` over libsqlite3
//!
//! and exports the `Java_org_sqlite_jni_capi_CApi_*` natives plus a small
//! C surface (`sqlbridge_*`) for errors, version and counters. The log
//! level comes from `SQLBRIDGE_LOG` when the library loads.

mod engine;
mod env;
mod error;
mod memory;
mod natives;
mod vm;

use std::os::raw::c_void;

use jni::sys::{jint, JNI_VERSION_1_8};
use jni::JavaVM;
use lazy_static::lazy_static;
use sqlbridge_core::{log_info, log_warn, set_log_level, Bridge, BridgeConfig};

pub use engine::Sqlite3Engine;
pub use env::JniEnv;
pub use error::*;
pub use memory::*;
pub use natives::*;

lazy_static! {
    /// The one bridge instance of this process
    pub(crate) static ref BRIDGE: Bridge<Sqlite3Engine> = Bridge::new(Sqlite3Engine, load_config());
}

fn load_config() -> BridgeConfig {
    match BridgeConfig::from_env() {
        Ok(config) => config,
        Err(err) => {
            log_warn!("ignoring bridge environment: {}", err);
            BridgeConfig::default()
        }
    }
}

/// Called by the runtime when it loads this library
#[no_mangle]
pub extern "system" fn JNI_OnLoad(vm: *mut jni::sys::JavaVM, _reserved: *mut c_void) -> jint {
    set_log_level(BRIDGE.config().level());
    match unsafe { JavaVM::from_raw(vm) } {
        Ok(vm) => vm::install(vm),
        Err(err) => log_warn!("no usable JavaVM at load: {}", err),
    }
    log_info!(
        "sqlbridge {} loaded (class prefix {})",
        env!("CARGO_PKG_VERSION"),
        BRIDGE.config().class_prefix
    );
    JNI_VERSION_1_8
}

// sqlbridge-core/src/lib.rs
// Pure Rust API - NO JNI or libsqlite3 dependencies

#[macro_use]
pub mod logging;

pub mod auto_ext;
pub mod bridge;
pub mod config;
pub mod connection;
pub mod engine;
pub mod env_cache;
pub mod error;
pub mod hooks;
pub mod marshal;
pub mod metadata;
pub mod metrics;
pub mod naming;
pub mod refs;
pub mod runtime;
#[cfg(any(test, feature = "testing"))]
pub mod testing;
pub mod udf;

// Public exports
pub use auto_ext::AutoExtensionRegistry;
pub use bridge::Bridge;
pub use config::BridgeConfig;
pub use connection::{AllocatorStats, ConnectionAllocator, ConnectionState, StateKey};
pub use engine::{DbPtr, NativeEngine, Prepared, StmtPtr, TraceEvent};
pub use env_cache::{EnvCache, EnvRefs};
pub use error::{codes, BridgeError, Result};
pub use hooks::{HookKind, HookSlot};
pub use logging::{get_log_level, set_log_level, LogLevel};
pub use metadata::{HandleKind, HandleMetadataCache};
pub use metrics::{Metrics, MetricsSnapshot};
pub use refs::{GlobalRef, LocalRef};
pub use runtime::{EnvId, ManagedEnv, ManagedError, ObjRef, RefReleaser, Ret, RetKind, Value};
pub use udf::{UdfBinding, UdfKind, UdfMethod};

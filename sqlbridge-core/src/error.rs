// sqlbridge-core/src/error.rs
//! Error types and result codes
//!
//! Every bridge entry point answers in the native engine's integer
//! result-code domain. Internally, fallible paths use [`BridgeError`] and
//! convert at the boundary with [`BridgeError::code`].

use std::cell::RefCell;

use thiserror::Error;

use crate::runtime::ManagedError;

/// Native result codes used by the bridge.
pub mod codes {
    pub const SQLITE_OK: i32 = 0;
    pub const SQLITE_ERROR: i32 = 1;
    pub const SQLITE_BUSY: i32 = 5;
    pub const SQLITE_NOMEM: i32 = 7;
    pub const SQLITE_MISUSE: i32 = 21;
    pub const SQLITE_FORMAT: i32 = 24;
    pub const SQLITE_RANGE: i32 = 25;
    pub const SQLITE_ROW: i32 = 100;
    pub const SQLITE_DONE: i32 = 101;
}

/// Errors raised inside the bridge before or after the native engine runs
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BridgeError {
    /// A cross-boundary allocation (wrapper, string, array) failed
    #[error("out of memory")]
    OutOfMemory,

    /// Caller broke the API contract (null handle, stale wrapper, bad args)
    #[error("misuse: {0}")]
    Misuse(String),

    /// Generic bridge-level error with a message
    #[error("{0}")]
    Error(String),

    /// A managed callback threw; the message is its string form
    #[error("callback threw: {0}")]
    CallbackThrew(String),

    /// The native engine itself reported a failure
    #[error("native engine returned {code}: {message}")]
    Engine { code: i32, message: String },
}

impl BridgeError {
    /// Map to the native result code the caller will see
    pub fn code(&self) -> i32 {
        match self {
            BridgeError::OutOfMemory => codes::SQLITE_NOMEM,
            BridgeError::Misuse(_) => codes::SQLITE_MISUSE,
            BridgeError::Error(_) | BridgeError::CallbackThrew(_) => codes::SQLITE_ERROR,
            BridgeError::Engine { code, .. } => *code,
        }
    }

    pub fn misuse(msg: impl Into<String>) -> Self {
        BridgeError::Misuse(msg.into())
    }
}

impl From<ManagedError> for BridgeError {
    fn from(err: ManagedError) -> Self {
        match err {
            ManagedError::OutOfMemory => BridgeError::OutOfMemory,
            ManagedError::Exception => BridgeError::CallbackThrew("pending exception".into()),
            ManagedError::NotFound { .. } => BridgeError::Error(err.to_string()),
        }
    }
}

pub type Result<T> = std::result::Result<T, BridgeError>;

/// Collapse a `Result<()>` into a result code
pub fn rc_of(result: Result<()>) -> i32 {
    match result {
        Ok(()) => codes::SQLITE_OK,
        Err(err) => err.code(),
    }
}

// Thread-local storage for the last bridge-level error message
thread_local! {
    static LAST_ERROR: RefCell<Option<String>> = const { RefCell::new(None) };
}

/// Record the calling thread's last bridge error
pub fn set_last_error(msg: &str) {
    LAST_ERROR.with(|e| {
        *e.borrow_mut() = Some(msg.to_string());
    });
}

pub fn clear_last_error() {
    LAST_ERROR.with(|e| {
        *e.borrow_mut() = None;
    });
}

/// Last bridge error recorded on this thread, if any
pub fn last_error() -> Option<String> {
    LAST_ERROR.with(|e| e.borrow().clone())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_codes() {
        assert_eq!(BridgeError::OutOfMemory.code(), codes::SQLITE_NOMEM);
        assert_eq!(BridgeError::misuse("x").code(), codes::SQLITE_MISUSE);
        assert_eq!(BridgeError::CallbackThrew("boom".into()).code(), codes::SQLITE_ERROR);
        let engine = BridgeError::Engine {
            code: codes::SQLITE_BUSY,
            message: "database is locked".into(),
        };
        assert_eq!(engine.code(), codes::SQLITE_BUSY);
    }

    #[test]
    fn test_managed_error_conversion() {
        assert_eq!(BridgeError::from(ManagedError::OutOfMemory), BridgeError::OutOfMemory);
        let err = BridgeError::from(ManagedError::NotFound {
            kind: "method",
            name: "call".into(),
        });
        assert_eq!(err.code(), codes::SQLITE_ERROR);
    }

    #[test]
    fn test_last_error_roundtrip() {
        clear_last_error();
        assert!(last_error().is_none());
        set_last_error(&BridgeError::misuse("null connection").to_string());
        assert_eq!(last_error().as_deref(), Some("misuse: null connection"));
        clear_last_error();
        assert!(last_error().is_none());
    }

    #[test]
    fn test_rc_of() {
        assert_eq!(rc_of(Ok(())), codes::SQLITE_OK);
        assert_eq!(rc_of(Err(BridgeError::OutOfMemory)), codes::SQLITE_NOMEM);
    }
}

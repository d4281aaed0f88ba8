//! Error handling for C consumers
//!
//! Bridge entry points return SQLite result codes; the detailed message of
//! the last bridge-level failure on a thread is available through
//! `sqlbridge_get_last_error()`.

use std::cell::RefCell;
use std::ffi::CString;
use std::os::raw::c_char;

use sqlbridge_core::error::{clear_last_error, last_error};

// C copy of the last message, valid until the next call on the same thread
thread_local! {
    static LAST_ERROR_C: RefCell<Option<CString>> = const { RefCell::new(None) };
}

/// Get the last error message
///
/// Returns a pointer to a null-terminated UTF-8 string, or null if no error
/// has been recorded on this thread.
///
/// # Safety
/// The returned pointer must not be freed by the caller.
/// The pointer is only valid until the next call on the same thread.
#[no_mangle]
pub extern "C" fn sqlbridge_get_last_error() -> *const c_char {
    let msg = last_error().and_then(|m| CString::new(m).ok());
    LAST_ERROR_C.with(|e| {
        let mut slot = e.borrow_mut();
        *slot = msg;
        match slot.as_ref() {
            Some(cstr) => cstr.as_ptr(),
            None => std::ptr::null(),
        }
    })
}

/// Clear the last error message
#[no_mangle]
pub extern "C" fn sqlbridge_clear_error() {
    clear_last_error();
    LAST_ERROR_C.with(|e| *e.borrow_mut() = None);
}

/// Returns 1 if there is an error message, 0 otherwise.
#[no_mangle]
pub extern "C" fn sqlbridge_has_error() -> i32 {
    if last_error().is_some() {
        1
    } else {
        0
    }
}

/// Helper to convert Rust string to C string (caller must free with sqlbridge_free_string)
pub(crate) fn string_to_c_str(s: &str) -> *mut c_char {
    match CString::new(s) {
        Ok(cstr) => cstr.into_raw(),
        Err(_) => std::ptr::null_mut(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sqlbridge_core::error::set_last_error;
    use std::ffi::CStr;

    fn c_str_to_string(ptr: *const c_char) -> Option<String> {
        if ptr.is_null() {
            return None;
        }
        unsafe { CStr::from_ptr(ptr).to_str().ok().map(|s| s.to_string()) }
    }

    #[test]
    fn test_last_error_roundtrip() {
        sqlbridge_clear_error();
        assert_eq!(sqlbridge_has_error(), 0);
        assert!(sqlbridge_get_last_error().is_null());

        set_last_error("misuse: function must not be null");
        assert_eq!(sqlbridge_has_error(), 1);
        let msg = c_str_to_string(sqlbridge_get_last_error());
        assert_eq!(msg.as_deref(), Some("misuse: function must not be null"));

        sqlbridge_clear_error();
        assert_eq!(sqlbridge_has_error(), 0);
    }
}

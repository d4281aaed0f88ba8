//! Memory management for strings returned to C callers

use std::ffi::CString;
use std::os::raw::c_char;

/// Free a string allocated by this library
///
/// Must be called for every `*mut c_char` returned by a `sqlbridge_*`
/// function (except `sqlbridge_get_last_error()`).
///
/// # Safety
/// - The pointer must have been allocated by a `sqlbridge_*` function
/// - The pointer must not be used after this call
/// - It is safe to call with a null pointer (no-op)
#[no_mangle]
pub extern "C" fn sqlbridge_free_string(ptr: *mut c_char) {
    if !ptr.is_null() {
        unsafe {
            // Reconstruct the CString to properly free it
            let _ = CString::from_raw(ptr);
        }
    }
}

/// Version of the bridge library (caller frees with `sqlbridge_free_string()`)
#[no_mangle]
pub extern "C" fn sqlbridge_version() -> *mut c_char {
    crate::error::string_to_c_str(env!("CARGO_PKG_VERSION"))
}

/// Bridge counters as JSON (caller frees with `sqlbridge_free_string()`)
#[no_mangle]
pub extern "C" fn sqlbridge_internal_details() -> *mut c_char {
    crate::error::string_to_c_str(&crate::BRIDGE.internal_details())
}

//! C string conversion helpers and the `free_string` half of the
//! string-ownership contract: every heap string this crate hands out
//! crosses back through here to be freed.

use std::ffi::{CStr, CString};
use std::os::raw::c_char;

/// # Safety
/// `ptr` must be null or point at a valid, nul-terminated C string.
pub(crate) unsafe fn cstr_to_string(ptr: *const c_char) -> Option<String> {
    if ptr.is_null() {
        return None;
    }
    unsafe { CStr::from_ptr(ptr) }.to_str().ok().map(str::to_string)
}

pub(crate) fn string_to_cstring(s: impl AsRef<str>) -> CString {
    CString::new(s.as_ref()).unwrap_or_else(|e| {
        // Interior nul: truncate at the first one rather than fail outright,
        // since this only ever wraps our own JSON/error text.
        let valid_up_to = e.nul_position();
        CString::new(&e.into_vec()[..valid_up_to]).expect("truncated at nul")
    })
}

/// Frees a string previously returned by this library (error messages,
/// JSON payloads, callback payloads). Null is accepted and ignored.
///
/// # Safety
/// `ptr` must either be null or have been returned by this crate and not
/// already freed.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn fv_free_string(ptr: *mut c_char) {
    if ptr.is_null() {
        return;
    }
    drop(unsafe { CString::from_raw(ptr) });
}

//! Thread-local last-error slot — the only mutable global state this
//! crate carries besides the runtime singleton. Every fallible C function
//! clears it on entry and sets it on failure.

use std::cell::RefCell;
use std::ffi::CString;
use std::os::raw::c_char;

pub use familyvault_core::ErrorCode;

thread_local! {
    static LAST_ERROR: RefCell<Option<(ErrorCode, CString)>> = const { RefCell::new(None) };
}

pub(crate) fn clear_last_error() {
    LAST_ERROR.with(|slot| *slot.borrow_mut() = None);
}

pub(crate) fn set_last_error(code: ErrorCode, message: impl AsRef<str>) {
    let message = CString::new(message.as_ref()).unwrap_or_else(|_| {
        CString::new("error message contained an interior nul byte").expect("no nul bytes")
    });
    LAST_ERROR.with(|slot| *slot.borrow_mut() = Some((code, message)));
}

pub(crate) fn set_core_error(err: &familyvault_core::FamilyVaultError) {
    set_last_error(err.code(), err.to_string());
}

/// Returns the last error's code on this thread, or `ErrorCode::Ok` if none
/// is set. Mirrored 1:1 from `familyvault_core::ErrorCode`.
#[unsafe(no_mangle)]
pub extern "C" fn fv_last_error_code() -> i32 {
    LAST_ERROR.with(|slot| {
        slot.borrow()
            .as_ref()
            .map_or(ErrorCode::Ok as i32, |(code, _)| *code as i32)
    })
}

/// Heap-allocates a copy of the last error's message for this thread; the
/// caller frees it with `fv_free_string`. Null if no error is set.
#[unsafe(no_mangle)]
pub extern "C" fn fv_last_error_message() -> *mut c_char {
    LAST_ERROR.with(|slot| {
        slot.borrow()
            .as_ref()
            .map_or(std::ptr::null_mut(), |(_, message)| {
                message.clone().into_raw()
            })
    })
}

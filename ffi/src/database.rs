//! The database handle: opens the embedded store and owns the reference
//! count every manager constructor/destructor participates in.

use std::os::raw::c_char;

use familyvault_core::Store;

use crate::errors::{clear_last_error, set_core_error, set_last_error, ErrorCode};
use crate::strings::cstr_to_string;

pub struct FvDatabase {
    pub(crate) store: Option<Store>,
}

pub(crate) unsafe fn clone_store(handle: *const FvDatabase) -> Option<Store> {
    if handle.is_null() {
        return None;
    }
    unsafe { &*handle }.store.clone()
}

/// Opens (creating if necessary) the database at `path`, applying any
/// pending migration. Returns null and sets the last error on failure.
///
/// # Safety
/// `path` must be a valid, nul-terminated, UTF-8 C string.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn fv_database_open(path: *const c_char) -> *mut FvDatabase {
    clear_last_error();
    let Some(path) = (unsafe { cstr_to_string(path) }) else {
        set_last_error(ErrorCode::InvalidArgument, "path must be a valid UTF-8 string");
        return std::ptr::null_mut();
    };
    match Store::open(&path) {
        Ok(store) => Box::into_raw(Box::new(FvDatabase { store: Some(store) })),
        Err(e) => {
            set_core_error(&e);
            std::ptr::null_mut()
        }
    }
}

/// In-memory database, for embedders' own tests.
#[unsafe(no_mangle)]
pub extern "C" fn fv_database_open_in_memory() -> *mut FvDatabase {
    clear_last_error();
    match Store::open_in_memory() {
        Ok(store) => Box::into_raw(Box::new(FvDatabase { store: Some(store) })),
        Err(e) => {
            set_core_error(&e);
            std::ptr::null_mut()
        }
    }
}

/// Number of live handles sharing this database's connection (this handle
/// included), or `-1` if `handle` is null or already closed.
///
/// # Safety
/// `handle` must be null or a valid pointer returned by `fv_database_open*`
/// and not yet closed/freed.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn fv_database_ref_count(handle: *const FvDatabase) -> i64 {
    if handle.is_null() {
        return -1;
    }
    unsafe { &*handle }
        .store
        .as_ref()
        .map_or(-1, |s| s.ref_count() as i64)
}

/// Closes and frees the database handle. Fails with `Busy` (without freeing
/// anything) while any manager constructed from it is still alive; release
/// those first, then retry.
///
/// # Safety
/// `handle` must be null or a valid pointer returned by `fv_database_open*`
/// and not yet freed.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn fv_database_close(handle: *mut FvDatabase) -> i32 {
    clear_last_error();
    if handle.is_null() {
        set_last_error(ErrorCode::InvalidArgument, "database handle is null");
        return ErrorCode::InvalidArgument as i32;
    }
    let db = unsafe { &mut *handle };
    let Some(store) = db.store.as_ref() else {
        set_last_error(ErrorCode::Internal, "database already closed");
        return ErrorCode::Internal as i32;
    };
    if store.ref_count() > 1 {
        set_last_error(ErrorCode::Busy, "database still referenced by live managers");
        return ErrorCode::Busy as i32;
    }
    let store = db.store.take().expect("checked Some above");
    match store.close() {
        Ok(()) => {
            drop(unsafe { Box::from_raw(handle) });
            ErrorCode::Ok as i32
        }
        Err(e) => {
            // Lost the race against a manager attaching between the check
            // and the take; the handle is now unusable and must be retried
            // as a fresh open by the caller (rare: single-threaded embedder
            // use is the expected case for a database's whole lifecycle).
            set_core_error(&e);
            e.code() as i32
        }
    }
}

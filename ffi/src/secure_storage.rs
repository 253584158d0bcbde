//! Opaque key→bytes store: an encrypted-file backend for platforms with
//! no native keystore binding, and an in-memory backend for embedders that
//! manage secret persistence themselves.

use std::os::raw::c_char;
use std::sync::Arc;

use familyvault_core::{EncryptedFileStorage, MemoryStorage, SecureStorage};

use crate::errors::{clear_last_error, set_core_error, set_last_error, ErrorCode};
use crate::strings::{cstr_to_string, string_to_cstring};

pub struct FvSecureStorage {
    pub(crate) inner: Arc<dyn SecureStorage>,
}

fn bytes_to_raw(bytes: Vec<u8>, out_len: *mut usize) -> *mut u8 {
    if !out_len.is_null() {
        unsafe { *out_len = bytes.len() };
    }
    let boxed = bytes.into_boxed_slice();
    Box::into_raw(boxed) as *mut u8
}

/// Opens (creating if necessary) an encrypted-file secure storage backend
/// at `path`, keyed by `passphrase`.
///
/// # Safety
/// `path` must be valid; `passphrase`/`passphrase_len` must describe a
/// readable byte buffer.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn fv_secure_storage_open(
    path: *const c_char,
    passphrase: *const u8,
    passphrase_len: usize,
) -> *mut FvSecureStorage {
    clear_last_error();
    let Some(path) = (unsafe { cstr_to_string(path) }) else {
        set_last_error(ErrorCode::InvalidArgument, "path must be valid UTF-8");
        return std::ptr::null_mut();
    };
    if passphrase.is_null() {
        set_last_error(ErrorCode::InvalidArgument, "passphrase is null");
        return std::ptr::null_mut();
    }
    let passphrase = unsafe { std::slice::from_raw_parts(passphrase, passphrase_len) };
    match EncryptedFileStorage::open(&path, passphrase) {
        Ok(storage) => Box::into_raw(Box::new(FvSecureStorage {
            inner: Arc::new(storage),
        })),
        Err(e) => {
            set_core_error(&e);
            std::ptr::null_mut()
        }
    }
}

/// An in-memory secure storage backend, for tests and embedders that
/// manage persistence themselves.
#[unsafe(no_mangle)]
pub extern "C" fn fv_secure_storage_new_memory() -> *mut FvSecureStorage {
    Box::into_raw(Box::new(FvSecureStorage {
        inner: Arc::new(MemoryStorage::default()),
    }))
}

/// # Safety
/// `handle` must be null or a valid, not-yet-freed pointer returned by
/// `fv_secure_storage_open`/`fv_secure_storage_new_memory`.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn fv_secure_storage_free(handle: *mut FvSecureStorage) {
    if !handle.is_null() {
        drop(unsafe { Box::from_raw(handle) });
    }
}

/// # Safety
/// `handle`, `key` must be valid; `bytes`/`len` must describe a readable
/// buffer.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn fv_secure_storage_store(
    handle: *mut FvSecureStorage,
    key: *const c_char,
    bytes: *const u8,
    len: usize,
) -> i32 {
    clear_last_error();
    let Some(storage) = (unsafe { handle.as_ref() }) else {
        set_last_error(ErrorCode::InvalidArgument, "secure storage handle is null");
        return ErrorCode::InvalidArgument as i32;
    };
    let Some(key) = (unsafe { cstr_to_string(key) }) else {
        set_last_error(ErrorCode::InvalidArgument, "key must be valid UTF-8");
        return ErrorCode::InvalidArgument as i32;
    };
    let bytes = if bytes.is_null() {
        &[][..]
    } else {
        unsafe { std::slice::from_raw_parts(bytes, len) }
    };
    match storage.inner.store(&key, bytes) {
        Ok(()) => ErrorCode::Ok as i32,
        Err(e) => {
            let code = e.code();
            set_core_error(&e);
            code as i32
        }
    }
}

/// Retrieves `key`'s bytes. Returns null (with `out_len` set to `0`) if the
/// key is absent or on failure; check `fv_last_error_code` to distinguish.
///
/// # Safety
/// `handle`, `key`, `out_len` must be valid.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn fv_secure_storage_retrieve(
    handle: *mut FvSecureStorage,
    key: *const c_char,
    out_len: *mut usize,
) -> *mut u8 {
    clear_last_error();
    if !out_len.is_null() {
        unsafe { *out_len = 0 };
    }
    let Some(storage) = (unsafe { handle.as_ref() }) else {
        set_last_error(ErrorCode::InvalidArgument, "secure storage handle is null");
        return std::ptr::null_mut();
    };
    let Some(key) = (unsafe { cstr_to_string(key) }) else {
        set_last_error(ErrorCode::InvalidArgument, "key must be valid UTF-8");
        return std::ptr::null_mut();
    };
    match storage.inner.retrieve(&key) {
        Ok(Some(bytes)) => bytes_to_raw(bytes, out_len),
        Ok(None) => std::ptr::null_mut(),
        Err(e) => {
            set_core_error(&e);
            std::ptr::null_mut()
        }
    }
}

/// Frees a buffer returned by `fv_secure_storage_retrieve`.
///
/// # Safety
/// `ptr`/`len` must be exactly what `fv_secure_storage_retrieve` returned,
/// or `ptr` null.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn fv_secure_storage_free_bytes(ptr: *mut u8, len: usize) {
    if ptr.is_null() {
        return;
    }
    drop(unsafe { Box::from_raw(std::slice::from_raw_parts_mut(ptr, len)) });
}

/// # Safety
/// `handle`, `key` must be valid.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn fv_secure_storage_remove(
    handle: *mut FvSecureStorage,
    key: *const c_char,
) -> i32 {
    clear_last_error();
    let Some(storage) = (unsafe { handle.as_ref() }) else {
        set_last_error(ErrorCode::InvalidArgument, "secure storage handle is null");
        return ErrorCode::InvalidArgument as i32;
    };
    let Some(key) = (unsafe { cstr_to_string(key) }) else {
        set_last_error(ErrorCode::InvalidArgument, "key must be valid UTF-8");
        return ErrorCode::InvalidArgument as i32;
    };
    match storage.inner.remove(&key) {
        Ok(()) => ErrorCode::Ok as i32,
        Err(e) => {
            let code = e.code();
            set_core_error(&e);
            code as i32
        }
    }
}

/// Returns `1`/`0`/`-1` (present / absent / error).
///
/// # Safety
/// `handle`, `key` must be valid.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn fv_secure_storage_exists(
    handle: *mut FvSecureStorage,
    key: *const c_char,
) -> i32 {
    clear_last_error();
    let Some(storage) = (unsafe { handle.as_ref() }) else {
        set_last_error(ErrorCode::InvalidArgument, "secure storage handle is null");
        return -1;
    };
    let Some(key) = (unsafe { cstr_to_string(key) }) else {
        set_last_error(ErrorCode::InvalidArgument, "key must be valid UTF-8");
        return -1;
    };
    match storage.inner.exists(&key) {
        Ok(true) => 1,
        Ok(false) => 0,
        Err(e) => {
            set_core_error(&e);
            -1
        }
    }
}

/// # Safety
/// `handle`, `key`, `value` must be valid.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn fv_secure_storage_store_string(
    handle: *mut FvSecureStorage,
    key: *const c_char,
    value: *const c_char,
) -> i32 {
    clear_last_error();
    let Some(storage) = (unsafe { handle.as_ref() }) else {
        set_last_error(ErrorCode::InvalidArgument, "secure storage handle is null");
        return ErrorCode::InvalidArgument as i32;
    };
    let Some(key) = (unsafe { cstr_to_string(key) }) else {
        set_last_error(ErrorCode::InvalidArgument, "key must be valid UTF-8");
        return ErrorCode::InvalidArgument as i32;
    };
    let Some(value) = (unsafe { cstr_to_string(value) }) else {
        set_last_error(ErrorCode::InvalidArgument, "value must be valid UTF-8");
        return ErrorCode::InvalidArgument as i32;
    };
    match storage.inner.store_string(&key, &value) {
        Ok(()) => ErrorCode::Ok as i32,
        Err(e) => {
            let code = e.code();
            set_core_error(&e);
            code as i32
        }
    }
}

/// Returns null if the key is absent or on failure.
///
/// # Safety
/// `handle`, `key` must be valid.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn fv_secure_storage_retrieve_string(
    handle: *mut FvSecureStorage,
    key: *const c_char,
) -> *mut c_char {
    clear_last_error();
    let Some(storage) = (unsafe { handle.as_ref() }) else {
        set_last_error(ErrorCode::InvalidArgument, "secure storage handle is null");
        return std::ptr::null_mut();
    };
    let Some(key) = (unsafe { cstr_to_string(key) }) else {
        set_last_error(ErrorCode::InvalidArgument, "key must be valid UTF-8");
        return std::ptr::null_mut();
    };
    match storage.inner.retrieve_string(&key) {
        Ok(Some(value)) => string_to_cstring(value).into_raw(),
        Ok(None) => std::ptr::null_mut(),
        Err(e) => {
            set_core_error(&e);
            std::ptr::null_mut()
        }
    }
}

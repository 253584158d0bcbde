//! Folder registration and filesystem scanning.

use std::os::raw::{c_char, c_void};

use familyvault_core::{Folder, IndexManager, Visibility};

use crate::database::{clone_store, FvDatabase};
use crate::errors::{clear_last_error, set_core_error, set_last_error, ErrorCode};
use crate::strings::{cstr_to_string, string_to_cstring};
use crate::{invoke_callback, FvCallback, SendPtr};

pub struct FvIndexManager {
    pub(crate) inner: IndexManager,
}

fn folder_json(f: &Folder) -> serde_json::Value {
    serde_json::json!({
        "id": f.id,
        "path": f.path,
        "name": f.name,
        "enabled": f.enabled,
        "default_visibility": f.default_visibility.as_str(),
        "last_scan_at": f.last_scan_at,
        "file_count": f.file_count,
        "total_size": f.total_size,
    })
}

fn parse_visibility(s: Option<String>) -> Visibility {
    s.as_deref()
        .and_then(|s| Visibility::parse(s).ok())
        .unwrap_or(Visibility::Private)
}

/// # Safety
/// `db` must be a valid, open database handle.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn fv_index_manager_new(db: *const FvDatabase) -> *mut FvIndexManager {
    clear_last_error();
    let Some(store) = (unsafe { clone_store(db) }) else {
        set_last_error(ErrorCode::InvalidArgument, "database handle is null or closed");
        return std::ptr::null_mut();
    };
    Box::into_raw(Box::new(FvIndexManager {
        inner: IndexManager::new(store),
    }))
}

/// # Safety
/// `handle` must be null or a valid, not-yet-freed pointer from
/// `fv_index_manager_new`.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn fv_index_manager_free(handle: *mut FvIndexManager) {
    if !handle.is_null() {
        drop(unsafe { Box::from_raw(handle) });
    }
}

/// Registers `path` as an indexed folder. Returns the new folder id, or
/// `-1` on failure.
///
/// # Safety
/// `handle`, `path`, `name` must be valid; `visibility` is `"private"` or
/// `"family"` (null defaults to `"private"`).
#[unsafe(no_mangle)]
pub unsafe extern "C" fn fv_index_manager_add_folder(
    handle: *mut FvIndexManager,
    path: *const c_char,
    name: *const c_char,
    visibility: *const c_char,
) -> i64 {
    clear_last_error();
    let Some(mgr) = (unsafe { handle.as_ref() }) else {
        set_last_error(ErrorCode::InvalidArgument, "index manager handle is null");
        return -1;
    };
    let Some(path) = (unsafe { cstr_to_string(path) }) else {
        set_last_error(ErrorCode::InvalidArgument, "path must be valid UTF-8");
        return -1;
    };
    let Some(name) = (unsafe { cstr_to_string(name) }) else {
        set_last_error(ErrorCode::InvalidArgument, "name must be valid UTF-8");
        return -1;
    };
    let visibility = parse_visibility(unsafe { cstr_to_string(visibility) });
    match mgr.inner.add_folder(&path, &name, visibility) {
        Ok(id) => id,
        Err(e) => {
            set_core_error(&e);
            -1
        }
    }
}

/// # Safety
/// `handle` must be a valid handle.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn fv_index_manager_remove_folder(
    handle: *mut FvIndexManager,
    folder_id: i64,
) -> i32 {
    clear_last_error();
    let Some(mgr) = (unsafe { handle.as_ref() }) else {
        set_last_error(ErrorCode::InvalidArgument, "index manager handle is null");
        return ErrorCode::InvalidArgument as i32;
    };
    match mgr.inner.remove_folder(folder_id) {
        Ok(()) => ErrorCode::Ok as i32,
        Err(e) => {
            let code = e.code();
            set_core_error(&e);
            code as i32
        }
    }
}

/// Returns the folder as a JSON object, or null if not found.
///
/// # Safety
/// `handle` must be a valid handle.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn fv_index_manager_get_folder(
    handle: *mut FvIndexManager,
    folder_id: i64,
) -> *mut c_char {
    clear_last_error();
    let Some(mgr) = (unsafe { handle.as_ref() }) else {
        set_last_error(ErrorCode::InvalidArgument, "index manager handle is null");
        return std::ptr::null_mut();
    };
    match mgr.inner.get_folder(folder_id) {
        Ok(Some(folder)) => string_to_cstring(folder_json(&folder).to_string()).into_raw(),
        Ok(None) => std::ptr::null_mut(),
        Err(e) => {
            set_core_error(&e);
            std::ptr::null_mut()
        }
    }
}

/// Returns every registered folder as a JSON array.
///
/// # Safety
/// `handle` must be a valid handle.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn fv_index_manager_list_folders(handle: *mut FvIndexManager) -> *mut c_char {
    clear_last_error();
    let Some(mgr) = (unsafe { handle.as_ref() }) else {
        set_last_error(ErrorCode::InvalidArgument, "index manager handle is null");
        return std::ptr::null_mut();
    };
    match mgr.inner.list_folders() {
        Ok(folders) => {
            let arr: Vec<_> = folders.iter().map(folder_json).collect();
            string_to_cstring(serde_json::Value::Array(arr).to_string()).into_raw()
        }
        Err(e) => {
            set_core_error(&e);
            std::ptr::null_mut()
        }
    }
}

/// Scans `folder_id`, reporting progress through `callback` as
/// `{"scanned": N, "total": N}`, and returns the number of files indexed,
/// or `-1` on failure.
///
/// # Safety
/// `handle` must be a valid handle; `callback`, if non-null, must be safe to
/// call from this thread with the given `user_data`.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn fv_index_manager_scan_folder(
    handle: *mut FvIndexManager,
    folder_id: i64,
    callback: FvCallback,
    user_data: *mut c_void,
) -> i64 {
    clear_last_error();
    let Some(mgr) = (unsafe { handle.as_ref() }) else {
        set_last_error(ErrorCode::InvalidArgument, "index manager handle is null");
        return -1;
    };
    let user_data = SendPtr(user_data);
    let result = mgr.inner.scan_folder(folder_id, |scanned, total| {
        let json = serde_json::json!({"scanned": scanned, "total": total}).to_string();
        unsafe { invoke_callback(callback, user_data, 0, &json) };
    });
    match result {
        Ok(n) => n as i64,
        Err(e) => {
            set_core_error(&e);
            -1
        }
    }
}

/// Scans every enabled folder in sequence. `callback` receives
/// `{"folder_id": N, "scanned": N, "total": N}` per progress tick. Returns
/// the total number of files indexed across all folders.
///
/// # Safety
/// Same as `fv_index_manager_scan_folder`.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn fv_index_manager_scan_all(
    handle: *mut FvIndexManager,
    callback: FvCallback,
    user_data: *mut c_void,
) -> i64 {
    clear_last_error();
    let Some(mgr) = (unsafe { handle.as_ref() }) else {
        set_last_error(ErrorCode::InvalidArgument, "index manager handle is null");
        return -1;
    };
    let user_data = SendPtr(user_data);
    let result = mgr.inner.scan_all(|folder_id, scanned, total| {
        let json =
            serde_json::json!({"folder_id": folder_id, "scanned": scanned, "total": total})
                .to_string();
        unsafe { invoke_callback(callback, user_data, 0, &json) };
    });
    match result {
        Ok(n) => n as i64,
        Err(e) => {
            set_core_error(&e);
            -1
        }
    }
}

/// Cooperative cancellation for an in-flight `scan_folder`/`scan_all` call
/// running on another thread.
///
/// # Safety
/// `handle` must be a valid handle.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn fv_index_manager_stop_scan(handle: *mut FvIndexManager) {
    if let Some(mgr) = unsafe { handle.as_ref() } {
        mgr.inner.stop_scan();
    }
}

/// # Safety
/// `handle` must be a valid handle; `visibility` is `"private"` or
/// `"family"`.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn fv_index_manager_set_file_visibility(
    handle: *mut FvIndexManager,
    file_id: i64,
    visibility: *const c_char,
) -> i32 {
    clear_last_error();
    let Some(mgr) = (unsafe { handle.as_ref() }) else {
        set_last_error(ErrorCode::InvalidArgument, "index manager handle is null");
        return ErrorCode::InvalidArgument as i32;
    };
    let visibility = parse_visibility(unsafe { cstr_to_string(visibility) });
    match mgr.inner.set_file_visibility(file_id, visibility) {
        Ok(()) => ErrorCode::Ok as i32,
        Err(e) => {
            let code = e.code();
            set_core_error(&e);
            code as i32
        }
    }
}

/// # Safety
/// `handle` must be a valid handle.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn fv_index_manager_delete_file(
    handle: *mut FvIndexManager,
    file_id: i64,
    delete_from_disk: bool,
) -> i32 {
    clear_last_error();
    let Some(mgr) = (unsafe { handle.as_ref() }) else {
        set_last_error(ErrorCode::InvalidArgument, "index manager handle is null");
        return ErrorCode::InvalidArgument as i32;
    };
    match mgr.inner.delete_file(file_id, delete_from_disk) {
        Ok(()) => ErrorCode::Ok as i32,
        Err(e) => {
            let code = e.code();
            set_core_error(&e);
            code as i32
        }
    }
}

/// Computes checksums for any indexed file missing one. Returns the number
/// computed, or `-1` on failure.
///
/// # Safety
/// `handle` must be a valid handle.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn fv_index_manager_compute_missing_checksums(
    handle: *mut FvIndexManager,
) -> i64 {
    clear_last_error();
    let Some(mgr) = (unsafe { handle.as_ref() }) else {
        set_last_error(ErrorCode::InvalidArgument, "index manager handle is null");
        return -1;
    };
    match mgr.inner.compute_missing_checksums() {
        Ok(n) => n as i64,
        Err(e) => {
            set_core_error(&e);
            -1
        }
    }
}

//! Checksum-based duplicate grouping and safe delete.

use familyvault_core::{DuplicateFinder, DuplicateGroup};

use crate::database::{clone_store, FvDatabase};
use crate::errors::{clear_last_error, set_core_error, set_last_error, ErrorCode};
use crate::index_manager::FvIndexManager;
use crate::strings::string_to_cstring;
use std::os::raw::c_char;

pub struct FvDuplicateFinder {
    inner: DuplicateFinder,
}

fn group_json(g: &DuplicateGroup) -> serde_json::Value {
    serde_json::json!({
        "checksum": g.checksum,
        "size": g.size,
        "copies": g.copies,
        "potential_savings": g.potential_savings,
        "file_ids": g.file_ids,
    })
}

/// # Safety
/// `db` must be a valid, open database handle.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn fv_duplicate_finder_new(db: *const FvDatabase) -> *mut FvDuplicateFinder {
    clear_last_error();
    let Some(store) = (unsafe { clone_store(db) }) else {
        set_last_error(ErrorCode::InvalidArgument, "database handle is null or closed");
        return std::ptr::null_mut();
    };
    Box::into_raw(Box::new(FvDuplicateFinder {
        inner: DuplicateFinder::new(store),
    }))
}

/// # Safety
/// `handle` must be null or a valid, not-yet-freed pointer from
/// `fv_duplicate_finder_new`.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn fv_duplicate_finder_free(handle: *mut FvDuplicateFinder) {
    if !handle.is_null() {
        drop(unsafe { Box::from_raw(handle) });
    }
}

/// Returns every local duplicate group (checksum match, >=2 copies) as a
/// JSON array.
///
/// # Safety
/// `handle` must be valid.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn fv_duplicate_finder_find_local_duplicates(
    handle: *mut FvDuplicateFinder,
) -> *mut c_char {
    clear_last_error();
    let Some(finder) = (unsafe { handle.as_ref() }) else {
        set_last_error(ErrorCode::InvalidArgument, "duplicate finder handle is null");
        return std::ptr::null_mut();
    };
    match finder.inner.find_local_duplicates() {
        Ok(groups) => {
            let arr: Vec<_> = groups.iter().map(group_json).collect();
            string_to_cstring(serde_json::Value::Array(arr).to_string()).into_raw()
        }
        Err(e) => {
            set_core_error(&e);
            std::ptr::null_mut()
        }
    }
}

/// Returns the file ids whose checksum has no matching copy on any remote
/// device, as a JSON array of integers.
///
/// # Safety
/// `handle` must be valid.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn fv_duplicate_finder_files_without_backup(
    handle: *mut FvDuplicateFinder,
) -> *mut c_char {
    clear_last_error();
    let Some(finder) = (unsafe { handle.as_ref() }) else {
        set_last_error(ErrorCode::InvalidArgument, "duplicate finder handle is null");
        return std::ptr::null_mut();
    };
    match finder.inner.files_without_backup() {
        Ok(ids) => {
            let arr: Vec<_> = ids.into_iter().map(serde_json::Value::from).collect();
            string_to_cstring(serde_json::Value::Array(arr).to_string()).into_raw()
        }
        Err(e) => {
            set_core_error(&e);
            std::ptr::null_mut()
        }
    }
}

/// Deletes every file in `file_ids` (JSON array of integers) except
/// `keep_id`. When `index_manager` is non-null, deletion goes through it so
/// folder counters stay consistent; otherwise rows are removed directly.
///
/// # Safety
/// `handle` and `file_ids_json` must be valid; `index_manager`, if non-null,
/// must be a valid handle sharing the same database.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn fv_duplicate_finder_keep_only_one(
    handle: *mut FvDuplicateFinder,
    file_ids_json: *const c_char,
    keep_id: i64,
    index_manager: *const FvIndexManager,
    delete_from_disk: bool,
) -> i32 {
    clear_last_error();
    let Some(finder) = (unsafe { handle.as_ref() }) else {
        set_last_error(ErrorCode::InvalidArgument, "duplicate finder handle is null");
        return ErrorCode::InvalidArgument as i32;
    };
    let Some(json) = (unsafe { crate::strings::cstr_to_string(file_ids_json) }) else {
        set_last_error(ErrorCode::InvalidArgument, "file_ids must be valid UTF-8");
        return ErrorCode::InvalidArgument as i32;
    };
    let file_ids: Vec<i64> = match serde_json::from_str(&json) {
        Ok(ids) => ids,
        Err(e) => {
            set_last_error(ErrorCode::InvalidArgument, format!("invalid file_ids JSON: {e}"));
            return ErrorCode::InvalidArgument as i32;
        }
    };
    let mgr_ref = unsafe { index_manager.as_ref() }.map(|m| &m.inner);
    match finder.inner.keep_only_one(&file_ids, keep_id, mgr_ref, delete_from_disk) {
        Ok(()) => ErrorCode::Ok as i32,
        Err(e) => {
            let code = e.code();
            set_core_error(&e);
            code as i32
        }
    }
}

//! Standalone inspection handle for `IndexSync`'s replication state. The
//! live sync loop only ever runs inside a `NetworkManager`, which owns its
//! own `IndexSync` instance — this handle wraps a second instance sharing
//! the same underlying database, so an embedder can read cursor/backoff
//! state (and drive the request/response halves of the protocol directly,
//! e.g. over its own transport) without needing a running network manager.

use std::os::raw::c_char;

use familyvault_core::{IndexNotify, IndexRequest, IndexSync, SyncRow};

use crate::database::{clone_store, FvDatabase};
use crate::errors::{clear_last_error, set_core_error, set_last_error, ErrorCode};
use crate::strings::{cstr_to_string, string_to_cstring};

pub struct FvIndexSync {
    inner: IndexSync,
}

/// # Safety
/// `db` must be a valid, open database handle.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn fv_index_sync_new(db: *const FvDatabase) -> *mut FvIndexSync {
    clear_last_error();
    let Some(store) = (unsafe { clone_store(db) }) else {
        set_last_error(ErrorCode::InvalidArgument, "database handle is null or closed");
        return std::ptr::null_mut();
    };
    Box::into_raw(Box::new(FvIndexSync {
        inner: IndexSync::new(store),
    }))
}

/// # Safety
/// `handle` must be null or a valid, not-yet-freed pointer from
/// `fv_index_sync_new`.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn fv_index_sync_free(handle: *mut FvIndexSync) {
    if !handle.is_null() {
        drop(unsafe { Box::from_raw(handle) });
    }
}

/// Returns `1`/`0` for whether a sync with `device_id` is currently marked
/// in flight.
///
/// # Safety
/// `handle`, `device_id` must be valid.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn fv_index_sync_is_syncing(
    handle: *mut FvIndexSync,
    device_id: *const c_char,
) -> i32 {
    let Some(sync) = (unsafe { handle.as_ref() }) else {
        return 0;
    };
    match unsafe { cstr_to_string(device_id) } {
        Some(device_id) => sync.inner.is_syncing(&device_id) as i32,
        None => 0,
    }
}

/// Builds the pull request for `device_id` (`{"since_version", "full"}`) as
/// JSON, for an embedder carrying rows over its own transport.
///
/// # Safety
/// `handle`, `device_id` must be valid.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn fv_index_sync_build_request(
    handle: *mut FvIndexSync,
    device_id: *const c_char,
) -> *mut c_char {
    clear_last_error();
    let Some(sync) = (unsafe { handle.as_ref() }) else {
        set_last_error(ErrorCode::InvalidArgument, "index sync handle is null");
        return std::ptr::null_mut();
    };
    let Some(device_id) = (unsafe { cstr_to_string(device_id) }) else {
        set_last_error(ErrorCode::InvalidArgument, "device_id must be valid UTF-8");
        return std::ptr::null_mut();
    };
    let request = sync.inner.build_request(&device_id);
    string_to_cstring(serde_json::to_string(&request).unwrap_or_else(|_| "{}".to_string())).into_raw()
}

/// Server side of the protocol: answers a peer's `request_json`
/// (`{"since_version", "full"}`) with `{"rows": [...], "new_cursor": N}`, or
/// null on failure.
///
/// # Safety
/// `handle`, `request_json` must be valid.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn fv_index_sync_handle_request(
    handle: *mut FvIndexSync,
    request_json: *const c_char,
) -> *mut c_char {
    clear_last_error();
    let Some(sync) = (unsafe { handle.as_ref() }) else {
        set_last_error(ErrorCode::InvalidArgument, "index sync handle is null");
        return std::ptr::null_mut();
    };
    let Some(request_json) = (unsafe { cstr_to_string(request_json) }) else {
        set_last_error(ErrorCode::InvalidArgument, "request_json must be valid UTF-8");
        return std::ptr::null_mut();
    };
    let request: IndexRequest = match serde_json::from_str(&request_json) {
        Ok(r) => r,
        Err(e) => {
            set_last_error(ErrorCode::InvalidArgument, e.to_string());
            return std::ptr::null_mut();
        }
    };
    match sync.inner.handle_request(&request) {
        Ok(response) => {
            string_to_cstring(serde_json::to_string(&response).unwrap_or_else(|_| "{}".to_string()))
                .into_raw()
        }
        Err(e) => {
            set_core_error(&e);
            std::ptr::null_mut()
        }
    }
}

/// Client side: applies the JSON-encoded rows (`{"rows": [...]}`, the same
/// shape `IndexNotify` uses) received from `source_device_id`. Returns the
/// number of rows actually applied, or `-1` on failure.
///
/// # Safety
/// `handle`, `source_device_id`, `rows_json` must be valid.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn fv_index_sync_apply_rows(
    handle: *mut FvIndexSync,
    source_device_id: *const c_char,
    rows_json: *const c_char,
) -> i64 {
    clear_last_error();
    let Some(sync) = (unsafe { handle.as_ref() }) else {
        set_last_error(ErrorCode::InvalidArgument, "index sync handle is null");
        return -1;
    };
    let Some(source_device_id) = (unsafe { cstr_to_string(source_device_id) }) else {
        set_last_error(ErrorCode::InvalidArgument, "source_device_id must be valid UTF-8");
        return -1;
    };
    let Some(rows_json) = (unsafe { cstr_to_string(rows_json) }) else {
        set_last_error(ErrorCode::InvalidArgument, "rows_json must be valid UTF-8");
        return -1;
    };
    let rows: Vec<SyncRow> = match serde_json::from_str::<IndexNotify>(&rows_json) {
        Ok(notify) => notify.rows,
        Err(_) => match serde_json::from_str::<Vec<SyncRow>>(&rows_json) {
            Ok(rows) => rows,
            Err(e) => {
                set_last_error(ErrorCode::InvalidArgument, e.to_string());
                return -1;
            }
        },
    };
    match sync.inner.apply_rows(&source_device_id, &rows) {
        Ok(applied) => applied as i64,
        Err(e) => {
            set_core_error(&e);
            -1
        }
    }
}

/// Marks `remote_id` as deleted/private so the next sync tells peers to
/// drop their cached copy. Returns `0` on success.
///
/// # Safety
/// `handle` must be valid.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn fv_index_sync_record_tombstone(
    handle: *mut FvIndexSync,
    remote_id: i64,
) -> i32 {
    clear_last_error();
    let Some(sync) = (unsafe { handle.as_ref() }) else {
        set_last_error(ErrorCode::InvalidArgument, "index sync handle is null");
        return ErrorCode::InvalidArgument as i32;
    };
    match sync.inner.record_tombstone(remote_id) {
        Ok(()) => ErrorCode::Ok as i32,
        Err(e) => {
            let code = e.code();
            set_core_error(&e);
            code as i32
        }
    }
}

/// Seconds between this device's periodic re-pulls of an already-connected
/// peer.
///
/// # Safety
/// `handle` must be valid.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn fv_index_sync_push_interval_secs(handle: *mut FvIndexSync) -> u64 {
    match unsafe { handle.as_ref() } {
        Some(sync) => sync.inner.push_interval().as_secs(),
        None => 0,
    }
}

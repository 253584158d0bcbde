//! `NetworkManager`: discovery, transport, index sync, and file transfer
//! composed behind a single handle and a single event callback.

use std::net::SocketAddr;
use std::os::raw::{c_char, c_void};
use std::str::FromStr;
use std::sync::Arc;

use familyvault_core::{
    DeviceIdentity, DeviceType, FamilyVaultEvent, FileCache, NetworkManager, TransferProgress,
};

use crate::database::{clone_store, FvDatabase};
use crate::errors::{clear_last_error, set_core_error, set_last_error, ErrorCode};
use crate::runtime::runtime;
use crate::strings::{cstr_to_string, string_to_cstring};
use crate::{invoke_callback, FvCallback, SendPtr};

pub struct FvNetworkManager {
    inner: Arc<NetworkManager>,
}

fn transfer_progress_json(p: &TransferProgress) -> serde_json::Value {
    match p {
        TransferProgress::Starting { total_size } => {
            serde_json::json!({"type": "starting", "total_size": total_size})
        }
        TransferProgress::Progress { bytes_transferred, total_size } => {
            serde_json::json!({
                "type": "progress",
                "bytes_transferred": bytes_transferred,
                "total_size": total_size,
            })
        }
        TransferProgress::Completed { path, total_size } => {
            serde_json::json!({
                "type": "completed",
                "path": path.to_string_lossy(),
                "total_size": total_size,
            })
        }
        TransferProgress::Failed { error } => serde_json::json!({"type": "failed", "error": error}),
        TransferProgress::Cancelled => serde_json::json!({"type": "cancelled"}),
    }
}

/// Constructs a network manager bound to `bind_addr` (`"0.0.0.0:0"` picks an
/// ephemeral port), using `psk` as the 32-byte transport pre-shared key and
/// `cache_dir` as the root of the pulled-file cache.
///
/// # Safety
/// `device_id`, `device_name`, `bind_addr`, `cache_dir` must be valid;
/// `psk` must point at 32 readable bytes; `db` must be a valid, open
/// database handle.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn fv_network_manager_new(
    device_id: *const c_char,
    device_name: *const c_char,
    device_type: *const c_char,
    bind_addr: *const c_char,
    psk: *const u8,
    db: *const FvDatabase,
    cache_dir: *const c_char,
) -> *mut FvNetworkManager {
    clear_last_error();
    let Some(device_id) = (unsafe { cstr_to_string(device_id) }) else {
        set_last_error(ErrorCode::InvalidArgument, "device_id must be valid UTF-8");
        return std::ptr::null_mut();
    };
    let Some(device_name) = (unsafe { cstr_to_string(device_name) }) else {
        set_last_error(ErrorCode::InvalidArgument, "device_name must be valid UTF-8");
        return std::ptr::null_mut();
    };
    let device_type = unsafe { cstr_to_string(device_type) }
        .and_then(|s| DeviceType::from_str(&s).ok())
        .unwrap_or(DeviceType::Desktop);
    let Some(bind_addr) = (unsafe { cstr_to_string(bind_addr) }) else {
        set_last_error(ErrorCode::InvalidArgument, "bind_addr must be valid UTF-8");
        return std::ptr::null_mut();
    };
    let Ok(bind_addr) = SocketAddr::from_str(&bind_addr) else {
        set_last_error(ErrorCode::InvalidArgument, "bind_addr is not a valid socket address");
        return std::ptr::null_mut();
    };
    if psk.is_null() {
        set_last_error(ErrorCode::InvalidArgument, "psk is null");
        return std::ptr::null_mut();
    }
    let mut psk_bytes = [0u8; 32];
    unsafe { std::ptr::copy_nonoverlapping(psk, psk_bytes.as_mut_ptr(), 32) };
    let Some(store) = (unsafe { clone_store(db) }) else {
        set_last_error(ErrorCode::InvalidArgument, "database handle is null or closed");
        return std::ptr::null_mut();
    };
    let Some(cache_dir) = (unsafe { cstr_to_string(cache_dir) }) else {
        set_last_error(ErrorCode::InvalidArgument, "cache_dir must be valid UTF-8");
        return std::ptr::null_mut();
    };

    let identity = DeviceIdentity {
        device_id,
        device_name,
        device_type,
    };
    let cache = FileCache::new(cache_dir);
    match NetworkManager::new(identity, bind_addr, psk_bytes, store, cache) {
        Ok(manager) => Box::into_raw(Box::new(FvNetworkManager {
            inner: Arc::new(manager),
        })),
        Err(e) => {
            set_core_error(&e);
            std::ptr::null_mut()
        }
    }
}

/// # Safety
/// `handle` must be null or a valid, not-yet-freed pointer from
/// `fv_network_manager_new`.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn fv_network_manager_free(handle: *mut FvNetworkManager) {
    if !handle.is_null() {
        drop(unsafe { Box::from_raw(handle) });
    }
}

/// Starts discovery, the transport accept loop, and periodic sync.
/// `callback` receives one JSON object per `FamilyVaultEvent` variant
/// (`{"type": "...", ...}`).
///
/// # Safety
/// `handle` must be valid; `callback`, if non-null, must be safe to call
/// with the given `user_data` from a runtime worker thread.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn fv_network_manager_start(
    handle: *mut FvNetworkManager,
    callback: FvCallback,
    user_data: *mut c_void,
) -> i32 {
    clear_last_error();
    let Some(manager) = (unsafe { handle.as_ref() }) else {
        set_last_error(ErrorCode::InvalidArgument, "network manager handle is null");
        return ErrorCode::InvalidArgument as i32;
    };
    let user_data = SendPtr(user_data);
    let result = manager.inner.start(move |event: FamilyVaultEvent| {
        if let Ok(json) = serde_json::to_string(&event) {
            unsafe { invoke_callback(callback, user_data, 0, &json) };
        }
    });
    match result {
        Ok(()) => ErrorCode::Ok as i32,
        Err(e) => {
            let code = e.code();
            set_core_error(&e);
            code as i32
        }
    }
}

/// Stops every background task and closes every connection. Blocks until
/// shutdown completes.
///
/// # Safety
/// `handle` must be valid.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn fv_network_manager_stop(handle: *mut FvNetworkManager) {
    if let Some(manager) = unsafe { handle.as_ref() } {
        runtime().block_on(manager.inner.stop());
    }
}

/// Returns the local device id.
///
/// # Safety
/// `handle` must be valid.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn fv_network_manager_local_device_id(
    handle: *mut FvNetworkManager,
) -> *mut c_char {
    clear_last_error();
    let Some(manager) = (unsafe { handle.as_ref() }) else {
        set_last_error(ErrorCode::InvalidArgument, "network manager handle is null");
        return std::ptr::null_mut();
    };
    string_to_cstring(manager.inner.local_device_id()).into_raw()
}

/// Returns the bound local address as `"ip:port"`, or null on failure.
///
/// # Safety
/// `handle` must be valid.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn fv_network_manager_local_addr(handle: *mut FvNetworkManager) -> *mut c_char {
    clear_last_error();
    let Some(manager) = (unsafe { handle.as_ref() }) else {
        set_last_error(ErrorCode::InvalidArgument, "network manager handle is null");
        return std::ptr::null_mut();
    };
    match manager.inner.local_addr() {
        Ok(addr) => string_to_cstring(addr.to_string()).into_raw(),
        Err(e) => {
            set_core_error(&e);
            std::ptr::null_mut()
        }
    }
}

/// Returns the current state machine value: `"stopped"`, `"starting"`,
/// `"running"`, `"stopping"`, or `"error"`.
///
/// # Safety
/// `handle` must be valid.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn fv_network_manager_state(handle: *mut FvNetworkManager) -> *mut c_char {
    clear_last_error();
    let Some(manager) = (unsafe { handle.as_ref() }) else {
        set_last_error(ErrorCode::InvalidArgument, "network manager handle is null");
        return std::ptr::null_mut();
    };
    let json = serde_json::to_value(manager.inner.state())
        .ok()
        .and_then(|v| v.as_str().map(str::to_string))
        .unwrap_or_else(|| "error".to_string());
    string_to_cstring(json).into_raw()
}

/// Returns every currently-discovered peer as a JSON array (same shape as
/// `fv_network_discovery_list_peers`).
///
/// # Safety
/// `handle` must be valid.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn fv_network_manager_discovered_peers(
    handle: *mut FvNetworkManager,
) -> *mut c_char {
    clear_last_error();
    let Some(manager) = (unsafe { handle.as_ref() }) else {
        set_last_error(ErrorCode::InvalidArgument, "network manager handle is null");
        return std::ptr::null_mut();
    };
    let peers = manager.inner.discovered_peers();
    let arr: Vec<_> = peers
        .iter()
        .map(|p| {
            serde_json::json!({
                "device_id": p.device_id,
                "device_name": p.device_name,
                "device_type": p.device_type.as_str(),
                "ip_address": p.ip_address,
                "service_port": p.service_port,
                "last_seen_at": p.last_seen_at,
            })
        })
        .collect();
    string_to_cstring(serde_json::Value::Array(arr).to_string()).into_raw()
}

/// Connects to `device_id` using its discovered address. Returns `0` on
/// success.
///
/// # Safety
/// `handle`, `device_id` must be valid.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn fv_network_manager_connect_to_device(
    handle: *mut FvNetworkManager,
    device_id: *const c_char,
) -> i32 {
    clear_last_error();
    let Some(manager) = (unsafe { handle.as_ref() }) else {
        set_last_error(ErrorCode::InvalidArgument, "network manager handle is null");
        return ErrorCode::InvalidArgument as i32;
    };
    let Some(device_id) = (unsafe { cstr_to_string(device_id) }) else {
        set_last_error(ErrorCode::InvalidArgument, "device_id must be valid UTF-8");
        return ErrorCode::InvalidArgument as i32;
    };
    match runtime().block_on(manager.inner.connect_to_device(&device_id)) {
        Ok(()) => ErrorCode::Ok as i32,
        Err(e) => {
            let code = e.code();
            set_core_error(&e);
            code as i32
        }
    }
}

/// Connects to `addr` (`"ip:port"`), verifying the peer presents
/// `expected_device_id`. Returns `0` on success.
///
/// # Safety
/// `handle`, `addr`, `expected_device_id` must be valid.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn fv_network_manager_connect_to_address(
    handle: *mut FvNetworkManager,
    addr: *const c_char,
    expected_device_id: *const c_char,
) -> i32 {
    clear_last_error();
    let Some(manager) = (unsafe { handle.as_ref() }) else {
        set_last_error(ErrorCode::InvalidArgument, "network manager handle is null");
        return ErrorCode::InvalidArgument as i32;
    };
    let Some(addr) = (unsafe { cstr_to_string(addr) }) else {
        set_last_error(ErrorCode::InvalidArgument, "addr must be valid UTF-8");
        return ErrorCode::InvalidArgument as i32;
    };
    let Ok(addr) = SocketAddr::from_str(&addr) else {
        set_last_error(ErrorCode::InvalidArgument, "addr is not a valid socket address");
        return ErrorCode::InvalidArgument as i32;
    };
    let Some(expected_device_id) = (unsafe { cstr_to_string(expected_device_id) }) else {
        set_last_error(ErrorCode::InvalidArgument, "expected_device_id must be valid UTF-8");
        return ErrorCode::InvalidArgument as i32;
    };
    match runtime().block_on(manager.inner.connect_to_address(addr, &expected_device_id)) {
        Ok(()) => ErrorCode::Ok as i32,
        Err(e) => {
            let code = e.code();
            set_core_error(&e);
            code as i32
        }
    }
}

/// # Safety
/// `handle`, `device_id` must be valid.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn fv_network_manager_disconnect_device(
    handle: *mut FvNetworkManager,
    device_id: *const c_char,
) {
    let Some(manager) = (unsafe { handle.as_ref() }) else {
        return;
    };
    if let Some(device_id) = unsafe { cstr_to_string(device_id) } {
        manager.inner.disconnect_device(&device_id);
    }
}

/// # Safety
/// `handle` must be valid.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn fv_network_manager_disconnect_all(handle: *mut FvNetworkManager) {
    if let Some(manager) = unsafe { handle.as_ref() } {
        manager.inner.disconnect_all();
    }
}

/// Returns `1`/`0` for connected/not connected.
///
/// # Safety
/// `handle`, `device_id` must be valid.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn fv_network_manager_is_connected_to(
    handle: *mut FvNetworkManager,
    device_id: *const c_char,
) -> i32 {
    let Some(manager) = (unsafe { handle.as_ref() }) else {
        return 0;
    };
    match unsafe { cstr_to_string(device_id) } {
        Some(device_id) => manager.inner.is_connected_to(&device_id) as i32,
        None => 0,
    }
}

/// Returns the connected device ids as a JSON array of strings.
///
/// # Safety
/// `handle` must be valid.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn fv_network_manager_connected_devices(
    handle: *mut FvNetworkManager,
) -> *mut c_char {
    clear_last_error();
    let Some(manager) = (unsafe { handle.as_ref() }) else {
        set_last_error(ErrorCode::InvalidArgument, "network manager handle is null");
        return std::ptr::null_mut();
    };
    let devices = manager.inner.connected_devices();
    string_to_cstring(serde_json::to_string(&devices).unwrap_or_else(|_| "[]".to_string())).into_raw()
}

/// Pulls `file_id` from `source_device_id`'s tracked connection into the
/// cache, blocking until the transfer finishes. `progress_cb` (optional)
/// receives one JSON object per `TransferProgress` step. Returns the cached
/// file path, or null on failure.
///
/// # Safety
/// `handle`, `source_device_id` must be valid; `checksum`/`extension` may be
/// null; `progress_cb`, if non-null, must be safe to call with the given
/// `user_data` from a runtime worker thread.
#[unsafe(no_mangle)]
#[allow(clippy::too_many_arguments)]
pub unsafe extern "C" fn fv_network_manager_request_file_from(
    handle: *mut FvNetworkManager,
    source_device_id: *const c_char,
    file_id: i64,
    expected_size: i64,
    checksum: *const c_char,
    extension: *const c_char,
    progress_cb: FvCallback,
    user_data: *mut c_void,
) -> *mut c_char {
    clear_last_error();
    let Some(manager) = (unsafe { handle.as_ref() }) else {
        set_last_error(ErrorCode::InvalidArgument, "network manager handle is null");
        return std::ptr::null_mut();
    };
    let Some(source_device_id) = (unsafe { cstr_to_string(source_device_id) }) else {
        set_last_error(ErrorCode::InvalidArgument, "source_device_id must be valid UTF-8");
        return std::ptr::null_mut();
    };
    let expected_size = if expected_size < 0 { None } else { Some(expected_size as u64) };
    let checksum = unsafe { cstr_to_string(checksum) };
    let extension = unsafe { cstr_to_string(extension) };
    let user_data = SendPtr(user_data);

    let result = runtime().block_on(manager.inner.request_file_from(
        &source_device_id,
        file_id,
        expected_size,
        checksum,
        extension.as_deref(),
        move |progress| {
            let json = transfer_progress_json(&progress).to_string();
            unsafe { invoke_callback(progress_cb, user_data, 0, &json) };
        },
    ));
    match result {
        Ok(path) => string_to_cstring(path.to_string_lossy()).into_raw(),
        Err(e) => {
            set_core_error(&e);
            std::ptr::null_mut()
        }
    }
}

/// Cancels every in-flight transfer pulling from `device_id`. A no-op if
/// none are in flight.
///
/// # Safety
/// `handle`, `device_id` must be valid.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn fv_network_manager_cancel_transfers_for_device(
    handle: *mut FvNetworkManager,
    device_id: *const c_char,
) -> i32 {
    let Some(manager) = (unsafe { handle.as_ref() }) else {
        return 0;
    };
    match unsafe { cstr_to_string(device_id) } {
        Some(device_id) => manager.inner.file_transfer().cancel_for_device(&device_id) as i32,
        None => 0,
    }
}

/// Wholesale-clears the file cache. Returns `0` on success.
///
/// # Safety
/// `handle` must be valid.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn fv_network_manager_cache_clear(handle: *mut FvNetworkManager) -> i32 {
    clear_last_error();
    let Some(manager) = (unsafe { handle.as_ref() }) else {
        set_last_error(ErrorCode::InvalidArgument, "network manager handle is null");
        return ErrorCode::InvalidArgument as i32;
    };
    match manager.inner.file_transfer().clear_cache() {
        Ok(()) => ErrorCode::Ok as i32,
        Err(e) => {
            let code = e.code();
            set_core_error(&e);
            code as i32
        }
    }
}

/// Returns the total size in bytes of every file currently in the cache, or
/// `-1` on failure (see the thread-local last error).
///
/// # Safety
/// `handle` must be valid.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn fv_network_manager_cache_size(handle: *mut FvNetworkManager) -> i64 {
    clear_last_error();
    let Some(manager) = (unsafe { handle.as_ref() }) else {
        set_last_error(ErrorCode::InvalidArgument, "network manager handle is null");
        return -1;
    };
    match manager.inner.file_transfer().cache_size() {
        Ok(size) => size as i64,
        Err(e) => {
            set_core_error(&e);
            -1
        }
    }
}

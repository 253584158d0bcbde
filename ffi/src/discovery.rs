//! mDNS peer discovery: announce, browse, and a stale-peer sweep,
//! surfaced to the embedder as found/updated/lost/error events.

use std::os::raw::{c_char, c_void};
use std::str::FromStr;
use std::sync::Arc;

use familyvault_core::{DeviceIdentity, DeviceType, DiscoveryEvent, DiscoveryService, Peer};
use tokio::sync::mpsc;

use crate::errors::{clear_last_error, set_core_error, set_last_error, ErrorCode};
use crate::runtime::runtime;
use crate::strings::{cstr_to_string, string_to_cstring};
use crate::{invoke_callback, FvCallback, SendPtr};

pub struct FvNetworkDiscovery {
    inner: Arc<DiscoveryService>,
}

fn peer_json(p: &Peer) -> serde_json::Value {
    serde_json::json!({
        "device_id": p.device_id,
        "device_name": p.device_name,
        "device_type": p.device_type.as_str(),
        "ip_address": p.ip_address,
        "service_port": p.service_port,
        "last_seen_at": p.last_seen_at,
    })
}

fn event_json(event: &DiscoveryEvent) -> serde_json::Value {
    match event {
        DiscoveryEvent::DeviceFound(p) => {
            serde_json::json!({"type": "device_found", "peer": peer_json(p)})
        }
        DiscoveryEvent::DeviceUpdated(p) => {
            serde_json::json!({"type": "device_updated", "peer": peer_json(p)})
        }
        DiscoveryEvent::DeviceLost(id) => {
            serde_json::json!({"type": "device_lost", "device_id": id})
        }
        DiscoveryEvent::Error(msg) => {
            serde_json::json!({"type": "error", "message": msg})
        }
    }
}

/// Constructs a discovery service announcing `device_name`/`device_type`
/// on `service_port`. `device_type` is `"desktop"`, `"mobile"`, or
/// `"tablet"` (null defaults to `"desktop"`).
///
/// # Safety
/// `device_id`, `device_name` must be valid.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn fv_network_discovery_new(
    device_id: *const c_char,
    device_name: *const c_char,
    device_type: *const c_char,
    service_port: u16,
) -> *mut FvNetworkDiscovery {
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
    let identity = DeviceIdentity {
        device_id,
        device_name,
        device_type,
    };
    match DiscoveryService::new(identity, service_port) {
        Ok(service) => Box::into_raw(Box::new(FvNetworkDiscovery {
            inner: Arc::new(service),
        })),
        Err(e) => {
            set_core_error(&e);
            std::ptr::null_mut()
        }
    }
}

/// # Safety
/// `handle` must be null or a valid, not-yet-freed pointer from
/// `fv_network_discovery_new`.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn fv_network_discovery_free(handle: *mut FvNetworkDiscovery) {
    if !handle.is_null() {
        let boxed = unsafe { Box::from_raw(handle) };
        boxed.inner.shutdown();
    }
}

/// Starts announcing and browsing. `callback` receives one JSON object per
/// event: `{"type":"device_found"|"device_updated","peer":{...}}`,
/// `{"type":"device_lost","device_id":"..."}`, or
/// `{"type":"error","message":"..."}`.
///
/// # Safety
/// `handle` must be valid; `callback`, if non-null, must be safe to call
/// with the given `user_data` from a runtime worker thread.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn fv_network_discovery_start(
    handle: *mut FvNetworkDiscovery,
    callback: FvCallback,
    user_data: *mut c_void,
) -> i32 {
    clear_last_error();
    let Some(discovery) = (unsafe { handle.as_ref() }) else {
        set_last_error(ErrorCode::InvalidArgument, "discovery handle is null");
        return ErrorCode::InvalidArgument as i32;
    };
    let (tx, mut rx) = mpsc::unbounded_channel();
    if let Err(e) = discovery.inner.start_listening(tx) {
        let code = e.code();
        set_core_error(&e);
        return code as i32;
    }
    let user_data = SendPtr(user_data);
    runtime().spawn(async move {
        while let Some(event) = rx.recv().await {
            let json = event_json(&event).to_string();
            unsafe { invoke_callback(callback, user_data, 0, &json) };
        }
    });
    ErrorCode::Ok as i32
}

/// # Safety
/// `handle` must be valid.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn fv_network_discovery_stop(handle: *mut FvNetworkDiscovery) {
    if let Some(discovery) = unsafe { handle.as_ref() } {
        discovery.inner.shutdown();
    }
}

/// Returns every currently-tracked peer as a JSON array.
///
/// # Safety
/// `handle` must be valid.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn fv_network_discovery_list_peers(
    handle: *mut FvNetworkDiscovery,
) -> *mut c_char {
    clear_last_error();
    let Some(discovery) = (unsafe { handle.as_ref() }) else {
        set_last_error(ErrorCode::InvalidArgument, "discovery handle is null");
        return std::ptr::null_mut();
    };
    let peers = discovery.inner.get_discovered_peers();
    let arr: Vec<_> = peers.iter().map(peer_json).collect();
    string_to_cstring(serde_json::Value::Array(arr).to_string()).into_raw()
}

/// Returns `device_id`'s peer record as a JSON object, or null if not
/// currently tracked.
///
/// # Safety
/// `handle`, `device_id` must be valid.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn fv_network_discovery_get_peer(
    handle: *mut FvNetworkDiscovery,
    device_id: *const c_char,
) -> *mut c_char {
    clear_last_error();
    let Some(discovery) = (unsafe { handle.as_ref() }) else {
        set_last_error(ErrorCode::InvalidArgument, "discovery handle is null");
        return std::ptr::null_mut();
    };
    let Some(device_id) = (unsafe { cstr_to_string(device_id) }) else {
        set_last_error(ErrorCode::InvalidArgument, "device_id must be valid UTF-8");
        return std::ptr::null_mut();
    };
    match discovery.inner.get_peer(&device_id) {
        Some(peer) => string_to_cstring(peer_json(&peer).to_string()).into_raw(),
        None => std::ptr::null_mut(),
    }
}
